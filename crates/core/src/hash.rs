//! 128-bit content hashing for values and type descriptors
//!
//! Streaming XXH3-128 over tag + payload. Unordered collections (`Set`,
//! type unions) are hashed by collecting element digests, sorting, then
//! folding, so the result is independent of insertion order. Recursive
//! structures (wires referring to themselves through parameters, cyclic
//! type descriptors) are folded into a marker through a thread-local
//! visit guard instead of recursing forever.

use std::cell::RefCell;
use std::collections::HashSet;

use xxhash_rust::xxh3::Xxh3;

use crate::types::TypeInfo;
use crate::value::{ObjectHandle, ShType, Var};
use crate::wire::Wire;

/// Marker folded in when a recursive reference is detected.
const RECURSION_MARKER: &[u8] = b"\xF0recur";

/// Bound on nested type depth; beyond this the descriptor is cyclic or
/// hostile, either way we fold a marker and stop.
const MAX_TYPE_DEPTH: usize = 256;

thread_local! {
    static HASHING_WIRES: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
    static TYPE_DEPTH: RefCell<usize> = const { RefCell::new(0) };
}

/// 128-bit structural hash of a value.
pub fn hash_var(var: &Var) -> u128 {
    let mut state = Xxh3::new();
    update_var(var, &mut state);
    state.digest128()
}

/// Hash digest as an `Int2` value, the engine's conventional carrier for
/// 128-bit hashes (used for wire content hashes in snapshots).
pub fn hash_var_to_int2(var: &Var) -> Var {
    let digest = hash_var(var);
    int2_from_digest(digest)
}

pub(crate) fn int2_from_digest(digest: u128) -> Var {
    let low = digest as u64 as i64;
    let high = (digest >> 64) as u64 as i64;
    Var::Int2([low, high])
}

pub(crate) fn digest_from_int2(var: &Var) -> Option<u128> {
    match var {
        Var::Int2([low, high]) => {
            Some(((*high as u64 as u128) << 64) | (*low as u64 as u128))
        }
        _ => None,
    }
}

fn update_tag(tag: ShType, state: &mut Xxh3) {
    state.update(&[u8::from(tag)]);
}

fn update_var(var: &Var, state: &mut Xxh3) {
    update_tag(var.sh_type(), state);
    match var {
        Var::None => {}
        Var::Bool(v) => state.update(&[*v as u8]),
        Var::Int(v) => state.update(&v.to_le_bytes()),
        Var::Int2(v) => {
            for x in v {
                state.update(&x.to_le_bytes());
            }
        }
        Var::Int3(v) => {
            for x in v {
                state.update(&x.to_le_bytes());
            }
        }
        Var::Int4(v) => {
            for x in v {
                state.update(&x.to_le_bytes());
            }
        }
        Var::Int8(v) => {
            for x in v {
                state.update(&x.to_le_bytes());
            }
        }
        Var::Int16(v) => {
            for x in v {
                state.update(&x.to_le_bytes());
            }
        }
        Var::Float(v) => state.update(&v.to_le_bytes()),
        Var::Float2(v) => {
            for x in v {
                state.update(&x.to_le_bytes());
            }
        }
        Var::Float3(v) => {
            for x in v {
                state.update(&x.to_le_bytes());
            }
        }
        Var::Float4(v) => {
            for x in v {
                state.update(&x.to_le_bytes());
            }
        }
        Var::Color(c) => state.update(&[c.r, c.g, c.b, c.a]),
        Var::Enum(e) => {
            state.update(&e.value.to_le_bytes());
            state.update(&e.vendor_id.to_le_bytes());
            state.update(&e.type_id.to_le_bytes());
        }
        Var::String(s) | Var::Path(s) | Var::ContextVar(s) => state.update(s.as_bytes()),
        Var::Bytes(b) => state.update(b),
        Var::Image(img) => {
            state.update(&[img.channels, img.flags]);
            state.update(&img.width.to_le_bytes());
            state.update(&img.height.to_le_bytes());
            state.update(&img.data);
        }
        Var::Audio(audio) => {
            state.update(&audio.n_samples.to_le_bytes());
            state.update(&audio.channels.to_le_bytes());
            state.update(&audio.sample_rate.to_le_bytes());
            for s in &audio.samples {
                state.update(&s.to_le_bytes());
            }
        }
        Var::Seq(items) => {
            state.update(&(items.len() as u32).to_le_bytes());
            for item in items {
                update_var(item, state);
            }
        }
        Var::Table(table) => {
            state.update(&(table.len() as u64).to_le_bytes());
            // iteration is key-sorted, already deterministic
            for (k, v) in table.0.iter() {
                update_var(k, state);
                update_var(v, state);
            }
        }
        Var::Set(set) => {
            state.update(&(set.len() as u64).to_le_bytes());
            let mut digests: Vec<u128> = set.0.iter().map(hash_var).collect();
            digests.sort_unstable();
            for d in digests {
                state.update(&d.to_le_bytes());
            }
        }
        Var::Wire(wire) => update_wire(wire, state),
        Var::ShardRef(shard) => {
            state.update(&shard.shard_hash().to_le_bytes());
            for i in 0..shard.parameters().len() {
                if let Ok(param) = shard.get_param(i) {
                    update_var(&param, state);
                }
            }
        }
        Var::Object(obj) => {
            state.update(&obj.vendor_id.to_le_bytes());
            state.update(&obj.type_id.to_le_bytes());
            let serialized = match &obj.handle {
                ObjectHandle::Strong(data) => data.serialize(),
                ObjectHandle::Weak(weak) => weak.upgrade().and_then(|d| d.serialize()),
            };
            match serialized {
                Some(bytes) => state.update(&bytes),
                // opaque object, identity is all we have
                None => state.update(&obj_addr(obj).to_le_bytes()),
            }
        }
        Var::Array(array) => {
            state.update(&[u8::from(array.inner)]);
            state.update(&array.data);
        }
        Var::Trait(t) => {
            state.update(&t.id[0].to_le_bytes());
            state.update(&t.id[1].to_le_bytes());
            state.update(t.name.as_bytes());
        }
        Var::Type(t) => update_type(t, state),
    }
}

fn obj_addr(obj: &crate::value::ShObject) -> usize {
    match &obj.handle {
        ObjectHandle::Strong(arc) => std::sync::Arc::as_ptr(arc) as *const () as usize,
        ObjectHandle::Weak(weak) => weak.as_ptr() as *const () as usize,
    }
}

/// Fold a wire's identity and content into the hash state. Re-entering a
/// wire already being hashed (self reference through a parameter) folds a
/// marker instead of recursing.
fn update_wire(wire: &std::rc::Rc<Wire>, state: &mut Xxh3) {
    let addr = std::rc::Rc::as_ptr(wire) as usize;
    let first_visit = HASHING_WIRES.with(|set| set.borrow_mut().insert(addr));
    if !first_visit {
        state.update(RECURSION_MARKER);
        return;
    }

    state.update(wire.name().as_bytes());
    state.update(&[wire.is_looped() as u8, wire.is_unsafe() as u8, wire.is_pure() as u8]);
    for shard in wire.shards().iter() {
        state.update(&shard.shard_hash().to_le_bytes());
        for i in 0..shard.parameters().len() {
            if let Ok(param) = shard.get_param(i) {
                update_var(&param, state);
            }
        }
    }

    HASHING_WIRES.with(|set| {
        set.borrow_mut().remove(&addr);
    });
}

/// 128-bit content hash of a wire: name, flags and the shard list with
/// their parameters. Used as the cache key for serialized snapshots.
pub fn hash_wire(wire: &std::rc::Rc<Wire>) -> u128 {
    let mut state = Xxh3::new();
    update_wire(wire, &mut state);
    state.digest128()
}

/// 128-bit structural hash of a type descriptor, order-insensitive over
/// unordered member collections.
pub fn hash_type(info: &TypeInfo) -> u128 {
    let mut state = Xxh3::new();
    update_type(info, &mut state);
    state.digest128()
}

fn update_type(info: &TypeInfo, state: &mut Xxh3) {
    let too_deep = TYPE_DEPTH.with(|d| {
        let mut depth = d.borrow_mut();
        *depth += 1;
        *depth > MAX_TYPE_DEPTH
    });
    if too_deep {
        state.update(RECURSION_MARKER);
        TYPE_DEPTH.with(|d| *d.borrow_mut() -= 1);
        return;
    }

    update_tag(info.basic_type(), state);
    match info {
        TypeInfo::Enum { vendor_id, type_id } | TypeInfo::Object { vendor_id, type_id } => {
            state.update(&vendor_id.to_le_bytes());
            state.update(&type_id.to_le_bytes());
        }
        TypeInfo::Seq { types, fixed_size } => {
            state.update(&fixed_size.to_le_bytes());
            update_type_union(types, state);
        }
        TypeInfo::Set(types) | TypeInfo::ContextVar(types) => update_type_union(types, state),
        TypeInfo::Table { keys, types } => {
            state.update(&(types.len() as u32).to_le_bytes());
            for (i, t) in types.iter().enumerate() {
                match keys.get(i) {
                    Some(k) => update_var(k, state),
                    None => update_var(&Var::None, state),
                }
                update_type(t, state);
            }
        }
        TypeInfo::Array { inner } => state.update(&[u8::from(*inner)]),
        TypeInfo::Type(inner) => update_type(inner, state),
        _ => {}
    }

    TYPE_DEPTH.with(|d| *d.borrow_mut() -= 1);
}

// Element order inside a type union is not meaningful; sort the digests
// before folding.
fn update_type_union(types: &[TypeInfo], state: &mut Xxh3) {
    state.update(&(types.len() as u32).to_le_bytes());
    let mut digests: Vec<u128> = types.iter().map(hash_type).collect();
    digests.sort_unstable();
    for d in digests {
        state.update(&d.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ShSet, ShTable};

    #[test]
    fn test_hash_stable_for_clones() {
        let v = Var::Seq(vec![Var::Int(1), Var::from("abc"), Var::Float(2.5)]);
        let c = v.clone();
        assert_eq!(hash_var(&v), hash_var(&c));
    }

    #[test]
    fn test_hash_differs_for_different_values() {
        assert_ne!(hash_var(&Var::Int(1)), hash_var(&Var::Int(2)));
        assert_ne!(hash_var(&Var::Int(1)), hash_var(&Var::Float(1.0)));
        assert_ne!(hash_var(&Var::None), hash_var(&Var::Bool(false)));
    }

    #[test]
    fn test_set_hash_order_insensitive() {
        let mut a = ShSet::new();
        a.insert(Var::Int(1));
        a.insert(Var::Int(2));
        a.insert(Var::Int(3));

        let mut b = ShSet::new();
        b.insert(Var::Int(3));
        b.insert(Var::Int(1));
        b.insert(Var::Int(2));

        assert_eq!(hash_var(&Var::Set(Box::new(a))), hash_var(&Var::Set(Box::new(b))));
    }

    #[test]
    fn test_table_hash_deterministic() {
        let mut a = ShTable::new();
        a.insert(Var::from("x"), Var::Int(1));
        a.insert(Var::from("y"), Var::Int(2));

        let mut b = ShTable::new();
        b.insert(Var::from("y"), Var::Int(2));
        b.insert(Var::from("x"), Var::Int(1));

        assert_eq!(hash_var(&Var::Table(Box::new(a))), hash_var(&Var::Table(Box::new(b))));
    }

    #[test]
    fn test_type_union_hash_order_insensitive() {
        let a = TypeInfo::Seq { types: vec![TypeInfo::Int, TypeInfo::Float], fixed_size: 0 };
        let b = TypeInfo::Seq { types: vec![TypeInfo::Float, TypeInfo::Int], fixed_size: 0 };
        assert_eq!(hash_type(&a), hash_type(&b));

        let c = TypeInfo::Seq { types: vec![TypeInfo::Float, TypeInfo::String], fixed_size: 0 };
        assert_ne!(hash_type(&a), hash_type(&c));
    }

    #[test]
    fn test_int2_digest_roundtrip() {
        let digest = 0x0123456789abcdef_fedcba9876543210u128;
        let var = int2_from_digest(digest);
        assert_eq!(digest_from_int2(&var), Some(digest));
    }
}
