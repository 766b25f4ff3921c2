//! Versioned engine interface table
//!
//! Embedders and externally built shard modules talk to the engine
//! through one struct of function pointers obtained from
//! `shards_interface(abi_version)`. A version mismatch returns `None`
//! instead of a partially compatible table. Errors never cross this
//! boundary as unwinds; every fallible entry returns a `Result`.

use std::rc::Rc;
use std::sync::Arc;

use crate::blocking::await_blocking;
use crate::compose::{compose_wire, default_validation_callback, InstanceData};
use crate::context::{reference_variable, release_variable, suspend, Context, WireState};
use crate::error::{ActivationError, ComposeError};
use crate::events::{get_event_dispatcher, EventDispatcher};
use crate::hash::hash_var;
use crate::mesh::{Mesh, MeshError};
use crate::registry::{
    create_shard, register_enum_type, register_object_type, register_shard, EnumTypeInfo,
    ObjectTypeInfo, ShardConstructor,
};
use crate::shard::ShardInstance;
use crate::signals::install_signal_handlers;
use crate::types::{derive_type, TypeInfo};
use crate::value::{clone_var, destroy_var, Var, VariableRef};
use crate::wire::{stop, Wire};

/// Current interface revision. Bump on any breaking change to
/// `ShardsInterface`.
pub const ABI_VERSION: u32 = 0x0001_0000;

type BoxedCall = Box<dyn FnOnce() -> Result<Var, ActivationError> + Send>;
type BoxedCancel = Box<dyn FnOnce()>;

/// The function table. All entries are plain fn pointers so the table
/// can live in static storage and be handed out by shared reference.
pub struct ShardsInterface {
    pub abi_version: u32,

    // registration
    pub register_shard: fn(&str, ShardConstructor),
    pub create_shard: fn(&str) -> Option<ShardInstance>,
    pub register_object_type: fn(ObjectTypeInfo),
    pub register_enum_type: fn(EnumTypeInfo),

    // variant ops
    pub clone_var: fn(&mut Var, &Var),
    pub destroy_var: fn(&mut Var),
    pub hash_var: fn(&Var) -> u128,
    pub is_equal_var: fn(&Var, &Var) -> bool,
    pub derive_var_type: fn(&Var) -> Result<TypeInfo, ComposeError>,

    // variable lookups
    pub reference_variable: fn(&Context, &str) -> VariableRef,
    pub release_variable: fn(VariableRef),

    // flow control
    pub suspend: fn(&Context, f64) -> Result<WireState, ActivationError>,
    pub abort_wire: fn(&Context, &str),
    pub get_state: fn(&Context) -> WireState,

    // wire lifecycle
    pub create_wire: fn(&str) -> Rc<Wire>,
    pub add_shard: fn(&Rc<Wire>, ShardInstance),
    pub set_wire_looped: fn(&Rc<Wire>, bool),
    pub set_wire_unsafe: fn(&Rc<Wire>, bool),
    pub set_wire_pure: fn(&Rc<Wire>, bool),
    pub set_wire_stack_size: fn(&Rc<Wire>, usize),
    pub stop_wire: fn(&Rc<Wire>) -> bool,
    pub compose_wire: fn(&Rc<Wire>, &InstanceData) -> Result<TypeInfo, ComposeError>,

    // mesh lifecycle
    pub create_mesh: fn(&str) -> Rc<Mesh>,
    pub schedule: fn(&Rc<Mesh>, &Rc<Wire>, Var, bool) -> Result<(), MeshError>,
    pub unschedule: fn(&Rc<Mesh>, &Rc<Wire>),
    pub tick: fn(&Rc<Mesh>) -> bool,
    pub is_empty: fn(&Rc<Mesh>) -> bool,
    pub terminate: fn(&Rc<Mesh>),

    // async
    pub async_activate: fn(&Context, BoxedCall, BoxedCancel) -> Result<Var, ActivationError>,

    // events and process state
    pub get_event_dispatcher: fn(&str) -> Arc<EventDispatcher>,
    pub install_signal_handlers: fn(),
}

fn register_shard_entry(name: &str, ctor: ShardConstructor) {
    register_shard(name, ctor)
}

fn is_equal_var_entry(a: &Var, b: &Var) -> bool {
    a == b
}

fn derive_var_type_entry(var: &Var) -> Result<TypeInfo, ComposeError> {
    derive_type(var, None)
}

fn abort_wire_entry(context: &Context, message: &str) {
    context.cancel_flow(message);
}

fn get_state_entry(context: &Context) -> WireState {
    context.state()
}

fn create_wire_entry(name: &str) -> Rc<Wire> {
    Wire::new(name)
}

fn add_shard_entry(wire: &Rc<Wire>, shard: ShardInstance) {
    wire.add_shard(shard)
}

fn set_wire_looped_entry(wire: &Rc<Wire>, looped: bool) {
    wire.set_looped(looped)
}

fn set_wire_unsafe_entry(wire: &Rc<Wire>, unsafe_: bool) {
    wire.set_unsafe(unsafe_)
}

fn set_wire_pure_entry(wire: &Rc<Wire>, pure: bool) {
    wire.set_pure(pure)
}

fn set_wire_stack_size_entry(wire: &Rc<Wire>, size: usize) {
    wire.set_stack_size(size)
}

fn compose_wire_entry(wire: &Rc<Wire>, data: &InstanceData) -> Result<TypeInfo, ComposeError> {
    compose_wire(wire, &default_validation_callback, data).map(|r| r.output_type)
}

fn create_mesh_entry(label: &str) -> Rc<Mesh> {
    Mesh::new(label)
}

fn schedule_entry(
    mesh: &Rc<Mesh>,
    wire: &Rc<Wire>,
    input: Var,
    compose: bool,
) -> Result<(), MeshError> {
    mesh.schedule(wire, input, compose)
}

fn unschedule_entry(mesh: &Rc<Mesh>, wire: &Rc<Wire>) {
    mesh.remove(wire)
}

fn tick_entry(mesh: &Rc<Mesh>) -> bool {
    mesh.tick()
}

fn is_empty_entry(mesh: &Rc<Mesh>) -> bool {
    mesh.is_empty()
}

fn terminate_entry(mesh: &Rc<Mesh>) {
    mesh.terminate()
}

fn async_activate_entry(
    context: &Context,
    call: BoxedCall,
    cancel: BoxedCancel,
) -> Result<Var, ActivationError> {
    await_blocking(context, move || call(), move || cancel())
}

fn get_event_dispatcher_entry(name: &str) -> Arc<EventDispatcher> {
    get_event_dispatcher(name)
}

static INTERFACE: ShardsInterface = ShardsInterface {
    abi_version: ABI_VERSION,
    register_shard: register_shard_entry,
    create_shard,
    register_object_type,
    register_enum_type,
    clone_var,
    destroy_var,
    hash_var,
    is_equal_var: is_equal_var_entry,
    derive_var_type: derive_var_type_entry,
    reference_variable,
    release_variable,
    suspend,
    abort_wire: abort_wire_entry,
    get_state: get_state_entry,
    create_wire: create_wire_entry,
    add_shard: add_shard_entry,
    set_wire_looped: set_wire_looped_entry,
    set_wire_unsafe: set_wire_unsafe_entry,
    set_wire_pure: set_wire_pure_entry,
    set_wire_stack_size: set_wire_stack_size_entry,
    stop_wire: stop,
    compose_wire: compose_wire_entry,
    create_mesh: create_mesh_entry,
    schedule: schedule_entry,
    unschedule: unschedule_entry,
    tick: tick_entry,
    is_empty: is_empty_entry,
    terminate: terminate_entry,
    async_activate: async_activate_entry,
    get_event_dispatcher: get_event_dispatcher_entry,
    install_signal_handlers,
};

/// Obtain the interface table. Consumers must pass the ABI revision they
/// were built against; a mismatch yields `None`.
pub fn shards_interface(abi_version: u32) -> Option<&'static ShardsInterface> {
    (abi_version == ABI_VERSION).then_some(&INTERFACE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_gate() {
        assert!(shards_interface(ABI_VERSION).is_some());
        assert!(shards_interface(ABI_VERSION + 1).is_none());
        assert!(shards_interface(0).is_none());
    }

    #[test]
    fn test_variant_entries_work() {
        let iface = shards_interface(ABI_VERSION).unwrap();
        let mut dst = Var::None;
        (iface.clone_var)(&mut dst, &Var::Int(9));
        assert_eq!(dst, Var::Int(9));
        assert!((iface.is_equal_var)(&dst, &Var::Int(9)));
        assert_eq!((iface.hash_var)(&dst), (iface.hash_var)(&Var::Int(9)));
        (iface.destroy_var)(&mut dst);
        assert!(dst.is_none());
    }

    #[test]
    fn test_wire_and_mesh_entries() {
        let iface = shards_interface(ABI_VERSION).unwrap();
        let mesh = (iface.create_mesh)("iface-test");
        let wire = (iface.create_wire)("iface-wire");
        (iface.set_wire_looped)(&wire, true);
        assert!(wire.is_looped());
        assert!((iface.is_empty)(&mesh));
        assert!((iface.tick)(&mesh));
        (iface.terminate)(&mesh);
    }
}
