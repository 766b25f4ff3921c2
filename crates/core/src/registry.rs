//! Process-wide registries
//!
//! One global registry of shard constructors, object types, enum types
//! and settings, guarded by an `RwLock`; constructors are plain function
//! pointers so the registry itself stays `Send + Sync`. Wires are
//! mesh-thread entities, so the global-wire table is thread-local.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, OnceLock, RwLock};

use crate::shard::ShardInstance;
use crate::value::{ObjectData, Var};
use crate::wire::Wire;

/// Constructs a fresh, default-parameterized instance of a shard.
pub type ShardConstructor = fn() -> ShardInstance;

/// Registered object type: identity plus the optional hooks snapshots
/// need to revive payloads.
#[derive(Clone)]
pub struct ObjectTypeInfo {
    pub name: String,
    pub vendor_id: i32,
    pub type_id: i32,
    pub deserialize: Option<fn(&[u8]) -> Option<Arc<dyn ObjectData>>>,
}

/// Registered enumeration: identity plus value labels.
#[derive(Debug, Clone)]
pub struct EnumTypeInfo {
    pub name: String,
    pub vendor_id: i32,
    pub type_id: i32,
    pub labels: Vec<String>,
}

fn type_key(vendor_id: i32, type_id: i32) -> i64 {
    ((vendor_id as i64) << 32) | (type_id as u32 as i64)
}

#[derive(Default)]
struct Registry {
    shards: HashMap<String, ShardConstructor>,
    objects: HashMap<i64, ObjectTypeInfo>,
    enums: HashMap<i64, EnumTypeInfo>,
    settings: HashMap<String, Var>,
}

static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();

fn registry() -> &'static RwLock<Registry> {
    REGISTRY.get_or_init(|| RwLock::new(Registry::default()))
}

/// Register a shard constructor under its full name. Re-registration
/// replaces the constructor (and is reported, since it usually means two
/// modules collide).
pub fn register_shard(name: impl Into<String>, constructor: ShardConstructor) {
    let name = name.into();
    let mut reg = registry().write().unwrap();
    if reg.shards.insert(name.clone(), constructor).is_some() {
        tracing::warn!(name = %name, "shard constructor replaced");
    }
}

pub fn has_shard(name: &str) -> bool {
    registry().read().unwrap().shards.contains_key(name)
}

/// Construct a fresh instance of a registered shard.
pub fn create_shard(name: &str) -> Option<ShardInstance> {
    let constructor = registry().read().unwrap().shards.get(name).copied();
    constructor.map(|ctor| ctor())
}

pub fn registered_shard_names() -> Vec<String> {
    registry().read().unwrap().shards.keys().cloned().collect()
}

pub fn register_object_type(info: ObjectTypeInfo) {
    let key = type_key(info.vendor_id, info.type_id);
    let mut reg = registry().write().unwrap();
    if reg.objects.insert(key, info).is_some() {
        tracing::warn!("object type registration replaced");
    }
}

pub fn find_object_type(vendor_id: i32, type_id: i32) -> Option<ObjectTypeInfo> {
    registry()
        .read()
        .unwrap()
        .objects
        .get(&type_key(vendor_id, type_id))
        .cloned()
}

pub fn register_enum_type(info: EnumTypeInfo) {
    let key = type_key(info.vendor_id, info.type_id);
    let mut reg = registry().write().unwrap();
    if reg.enums.insert(key, info).is_some() {
        tracing::warn!("enum type registration replaced");
    }
}

pub fn find_enum_type(vendor_id: i32, type_id: i32) -> Option<EnumTypeInfo> {
    registry()
        .read()
        .unwrap()
        .enums
        .get(&type_key(vendor_id, type_id))
        .cloned()
}

/// Process-wide settings, keyed by name.
pub fn set_setting(name: impl Into<String>, value: Var) {
    registry().write().unwrap().settings.insert(name.into(), value);
}

pub fn get_setting(name: &str) -> Option<Var> {
    registry().read().unwrap().settings.get(name).cloned()
}

thread_local! {
    static GLOBAL_WIRES: RefCell<HashMap<String, Rc<Wire>>> = RefCell::new(HashMap::new());
}

/// Publish a wire under a global name on this thread.
pub fn set_global_wire(name: impl Into<String>, wire: Rc<Wire>) {
    GLOBAL_WIRES.with(|wires| {
        wires.borrow_mut().insert(name.into(), wire);
    });
}

pub fn get_global_wire(name: &str) -> Option<Rc<Wire>> {
    GLOBAL_WIRES.with(|wires| wires.borrow().get(name).cloned())
}

pub fn remove_global_wire(name: &str) -> Option<Rc<Wire>> {
    GLOBAL_WIRES.with(|wires| wires.borrow_mut().remove(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::error::ActivationError;
    use crate::shard::Shard;
    use crate::types::TypeInfo;
    use serial_test::serial;

    struct Probe;

    impl Shard for Probe {
        fn name(&self) -> &'static str {
            "RegistryProbe"
        }

        fn input_types(&self) -> Vec<TypeInfo> {
            vec![TypeInfo::Any]
        }

        fn output_types(&self) -> Vec<TypeInfo> {
            vec![TypeInfo::Any]
        }

        fn activate(&mut self, _context: &Context, input: &Var) -> Result<Var, ActivationError> {
            Ok(input.clone())
        }
    }

    fn probe_ctor() -> ShardInstance {
        ShardInstance::new(Probe)
    }

    #[test]
    #[serial]
    fn test_register_and_create() {
        register_shard("RegistryProbe", probe_ctor);
        assert!(has_shard("RegistryProbe"));
        let instance = create_shard("RegistryProbe").unwrap();
        assert_eq!(instance.name(), "RegistryProbe");
        assert!(create_shard("NoSuchShard").is_none());
    }

    #[test]
    #[serial]
    fn test_object_and_enum_types() {
        register_object_type(ObjectTypeInfo {
            name: "TestObject".into(),
            vendor_id: 0x7465,
            type_id: 0x0001,
            deserialize: None,
        });
        let found = find_object_type(0x7465, 0x0001).unwrap();
        assert_eq!(found.name, "TestObject");
        assert!(find_object_type(0x7465, 0x0002).is_none());

        register_enum_type(EnumTypeInfo {
            name: "TestEnum".into(),
            vendor_id: 0x7465,
            type_id: 0x0100,
            labels: vec!["A".into(), "B".into()],
        });
        let found = find_enum_type(0x7465, 0x0100).unwrap();
        assert_eq!(found.labels, vec!["A", "B"]);
    }

    #[test]
    #[serial]
    fn test_settings() {
        set_setting("registry-test-setting", Var::Int(3));
        assert_eq!(get_setting("registry-test-setting"), Some(Var::Int(3)));
        assert_eq!(get_setting("missing-setting"), None);
    }

    #[test]
    fn test_global_wires_thread_local() {
        let wire = Wire::new("global-one");
        set_global_wire("global-one", wire.clone());
        let found = get_global_wire("global-one").unwrap();
        assert!(Rc::ptr_eq(&wire, &found));
        assert!(remove_global_wire("global-one").is_some());
        assert!(get_global_wire("global-one").is_none());
    }
}
