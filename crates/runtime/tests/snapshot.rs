//! Wire and shard snapshots through the registry.

use std::rc::Rc;

use shards_core::hash::hash_wire;
use shards_core::mesh::Mesh;
use shards_core::serialize::{BufferReader, BufferWriter, Serialization};
use shards_core::value::Var;
use shards_core::wire::Wire;

use shards_runtime::register_core_shards;

fn build_wire() -> Rc<Wire> {
    let wire = Wire::new("snapshot-wire");
    wire.set_looped(false);

    let constant = shards_core::registry::create_shard("Const").unwrap();
    constant.set_param(0, &Var::Int(42)).unwrap();
    constant.set_source_anchor(3, 1);
    wire.add_shard(constant);

    let add = shards_core::registry::create_shard("Math.Add").unwrap();
    add.set_param(0, &Var::Int(1)).unwrap();
    wire.add_shard(add);

    let log = shards_core::registry::create_shard("Log").unwrap();
    wire.add_shard(log);

    wire.add_trait(shards_core::value::WireTrait {
        id: [0xAAAA_BBBB, 0xCCCC_DDDD],
        name: "answer-producer".to_string(),
    });

    wire
}

fn snapshot(wire: &Rc<Wire>) -> Vec<u8> {
    let mut serializer = Serialization::new();
    let mut writer = BufferWriter::new();
    serializer.write_wire(wire, &mut writer).unwrap();
    writer.bytes
}

#[test]
fn test_wire_snapshot_roundtrip() {
    register_core_shards();

    let wire = build_wire();
    let bytes = snapshot(&wire);

    let mut serializer = Serialization::new();
    let mut reader = BufferReader::new(&bytes);
    let decoded = serializer.read_wire(&mut reader).unwrap();

    assert_eq!(decoded.name(), "snapshot-wire");
    assert!(!decoded.is_looped());
    assert_eq!(decoded.shards().len(), 3);
    assert_eq!(decoded.shards()[0].name(), "Const");
    assert_eq!(decoded.shards()[0].get_param(0).unwrap(), Var::Int(42));
    assert_eq!(decoded.shards()[0].line(), 3);
    assert_eq!(decoded.shards()[1].get_param(0).unwrap(), Var::Int(1));
    assert_eq!(decoded.traits().len(), 1);
    assert_eq!(decoded.traits()[0].name, "answer-producer");

    // content hash is preserved through the roundtrip
    assert_eq!(hash_wire(&wire), hash_wire(&decoded));
}

#[test]
fn test_snapshot_is_deterministic() {
    register_core_shards();
    let wire = build_wire();
    assert_eq!(snapshot(&wire), snapshot(&wire));
}

#[test]
fn test_decoded_wire_runs() {
    register_core_shards();

    let bytes = snapshot(&build_wire());
    let mut serializer = Serialization::new();
    let mut reader = BufferReader::new(&bytes);
    let decoded = serializer.read_wire(&mut reader).unwrap();

    let mesh = Mesh::new("snapshot");
    mesh.schedule(&decoded, Var::None, true).unwrap();
    while !mesh.is_empty() {
        assert!(mesh.tick());
    }
    assert_eq!(decoded.finished_output(), Var::Int(43));
}

#[test]
fn test_repeated_wire_reference_uses_cache() {
    register_core_shards();

    let wire = build_wire();
    let mut serializer = Serialization::new();

    let mut first = BufferWriter::new();
    serializer.write_wire(&wire, &mut first).unwrap();
    // second occurrence through the same serializer emits only the
    // name + hash reference
    let mut second = BufferWriter::new();
    serializer.write_wire(&wire, &mut second).unwrap();
    assert!(second.bytes.len() < first.bytes.len());

    // and the reader resolves it back to the same wire instance
    let mut stream = BufferWriter::new();
    let mut serializer = Serialization::new();
    serializer.write_wire(&wire, &mut stream).unwrap();
    serializer.write_wire(&wire, &mut stream).unwrap();

    let mut deserializer = Serialization::new();
    let mut reader = BufferReader::new(&stream.bytes);
    let a = deserializer.read_wire(&mut reader).unwrap();
    let b = deserializer.read_wire(&mut reader).unwrap();
    assert!(Rc::ptr_eq(&a, &b));
}

#[test]
fn test_default_parameters_are_skipped() {
    register_core_shards();

    let mut serializer = Serialization::new();

    // all defaults: only the terminator is written for params
    let pristine = shards_core::registry::create_shard("Log").unwrap();
    let mut w = BufferWriter::new();
    serializer.write_shard(&pristine, &mut w).unwrap();
    let pristine_len = w.bytes.len();

    let labeled = shards_core::registry::create_shard("Log").unwrap();
    labeled.set_param(0, &Var::from("prefix")).unwrap();
    let mut w = BufferWriter::new();
    serializer.write_shard(&labeled, &mut w).unwrap();
    assert!(w.bytes.len() > pristine_len);
}

#[test]
fn test_shard_hash_mismatch_is_fatal() {
    register_core_shards();

    let constant = shards_core::registry::create_shard("Const").unwrap();
    constant.set_param(0, &Var::Int(7)).unwrap();

    let mut serializer = Serialization::new();
    let mut writer = BufferWriter::new();
    serializer.write_shard(&constant, &mut writer).unwrap();

    // corrupt the 32-bit hash that follows the length-prefixed name
    let mut bytes = writer.bytes;
    let name_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let hash_offset = 4 + name_len;
    bytes[hash_offset] ^= 0xFF;

    let mut deserializer = Serialization::new();
    let mut reader = BufferReader::new(&bytes);
    match deserializer.read_shard(&mut reader) {
        Err(shards_core::error::SerializeError::ShardHashMismatch { name, .. }) => {
            assert_eq!(name, "Const");
        }
        other => panic!("expected hash mismatch, got {:?}", other.map(|s| s.name())),
    }
}

#[test]
fn test_unknown_shard_rejected() {
    register_core_shards();

    let mut writer = BufferWriter::new();
    writer.write_str("NoSuchShardAnywhere");
    writer.write_u32(0xDEAD_BEEF);
    writer.write_i32(-1);

    let mut deserializer = Serialization::new();
    let mut reader = BufferReader::new(&writer.bytes);
    assert!(matches!(
        deserializer.read_shard(&mut reader),
        Err(shards_core::error::SerializeError::UnknownShard(_))
    ));
}
