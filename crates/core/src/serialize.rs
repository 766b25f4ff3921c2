//! Deterministic binary snapshots of values, shards and wires
//!
//! Little-endian, tag byte followed by a tag-specific payload. Strings
//! and byte buffers are length-prefixed. Shards serialize their name, a
//! stable 32-bit hash and only the parameters that differ from a
//! freshly-constructed instance; decoding refuses a shard whose hash no
//! longer matches the registered implementation. Wires are cached by
//! content hash so repeated references serialize as the hash alone.
//!
//! Readers never trust the stream: any read past the end of the source
//! raises `Overflow requested`.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::SerializeError;
use crate::hash::{digest_from_int2, hash_wire, int2_from_digest};
use crate::registry;
use crate::shard::ShardInstance;
use crate::types::TypeInfo;
use crate::value::{
    Audio, Image, ObjectHandle, PackedArray, ShColor, ShEnum, ShSet, ShTable, ShType, Var,
    WireTrait,
};
use crate::wire::Wire;

/// Growable little-endian output buffer.
#[derive(Debug, Default)]
pub struct BufferWriter {
    pub bytes: Vec<u8>,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i16(&mut self, v: i16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Length-prefixed string; no NUL in the stream.
    pub fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.write_raw(s.as_bytes());
    }
}

/// Bounds-checked little-endian reader.
#[derive(Debug)]
pub struct BufferReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SerializeError> {
        if len > self.remaining() {
            return Err(SerializeError::Overflow { requested: len, remaining: self.remaining() });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, SerializeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, SerializeError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, SerializeError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, SerializeError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_i16(&mut self) -> Result<i16, SerializeError> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32, SerializeError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64, SerializeError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_f32(&mut self) -> Result<f32, SerializeError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_f64(&mut self) -> Result<f64, SerializeError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8], SerializeError> {
        self.take(len)
    }

    pub fn read_str(&mut self) -> Result<String, SerializeError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| SerializeError::InvalidData("string is not valid utf-8".into()))
    }
}

/// Stateful codec: owns the seen-wire cache (keyed by content hash) and
/// a prototype cache of shards keyed by name, used to skip parameters
/// that still carry their default values.
#[derive(Default)]
pub struct Serialization {
    wires: HashMap<u128, Rc<Wire>>,
    prototypes: HashMap<String, Option<ShardInstance>>,
}

impl Serialization {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all cached wires and prototypes.
    pub fn reset(&mut self) {
        self.wires.clear();
        self.prototypes.clear();
    }

    pub fn write_var(&mut self, var: &Var, w: &mut BufferWriter) -> Result<(), SerializeError> {
        w.write_u8(u8::from(var.sh_type()));
        match var {
            Var::None => {}
            Var::Bool(v) => w.write_u8(*v as u8),
            Var::Int(v) => w.write_i64(*v),
            Var::Int2(v) => {
                for x in v {
                    w.write_i64(*x);
                }
            }
            Var::Int3(v) => {
                for x in v {
                    w.write_i32(*x);
                }
            }
            Var::Int4(v) => {
                for x in v {
                    w.write_i32(*x);
                }
            }
            Var::Int8(v) => {
                for x in v {
                    w.write_i16(*x);
                }
            }
            Var::Int16(v) => {
                for x in v {
                    w.write_u8(*x as u8);
                }
            }
            Var::Float(v) => w.write_f64(*v),
            Var::Float2(v) => {
                for x in v {
                    w.write_f64(*x);
                }
            }
            Var::Float3(v) => {
                for x in v {
                    w.write_f32(*x);
                }
            }
            Var::Float4(v) => {
                for x in v {
                    w.write_f32(*x);
                }
            }
            Var::Color(c) => {
                w.write_u8(c.r);
                w.write_u8(c.g);
                w.write_u8(c.b);
                w.write_u8(c.a);
            }
            Var::Enum(e) => {
                w.write_i32(e.value);
                w.write_i32(e.vendor_id);
                w.write_i32(e.type_id);
            }
            Var::String(s) | Var::Path(s) | Var::ContextVar(s) => w.write_str(s),
            Var::Bytes(b) => {
                w.write_u32(b.len() as u32);
                w.write_raw(b);
            }
            Var::Image(img) => {
                let size = img.width as usize * img.height as usize * img.channels as usize;
                if img.data.len() != size {
                    return Err(SerializeError::InvalidData(format!(
                        "image data size {} does not match {}x{}x{}",
                        img.data.len(),
                        img.width,
                        img.height,
                        img.channels
                    )));
                }
                w.write_u8(img.channels);
                w.write_u8(img.flags);
                w.write_u16(img.width);
                w.write_u16(img.height);
                w.write_raw(&img.data);
            }
            Var::Audio(audio) => {
                let size = audio.n_samples as usize * audio.channels as usize;
                if audio.samples.len() != size {
                    return Err(SerializeError::InvalidData(format!(
                        "audio sample count {} does not match {}x{}",
                        audio.samples.len(),
                        audio.n_samples,
                        audio.channels
                    )));
                }
                w.write_u16(audio.n_samples);
                w.write_u16(audio.channels);
                w.write_u32(audio.sample_rate);
                for s in &audio.samples {
                    w.write_f32(*s);
                }
            }
            Var::Seq(items) => {
                w.write_u32(items.len() as u32);
                for item in items {
                    self.write_var(item, w)?;
                }
            }
            Var::Table(table) => {
                w.write_u64(table.len() as u64);
                for (k, v) in table.0.iter() {
                    self.write_var(k, w)?;
                    self.write_var(v, w)?;
                }
            }
            Var::Set(set) => {
                w.write_u64(set.len() as u64);
                for v in set.0.iter() {
                    self.write_var(v, w)?;
                }
            }
            Var::Wire(wire) => self.write_wire(wire, w)?,
            Var::ShardRef(shard) => self.write_shard(shard, w)?,
            Var::Object(obj) => {
                let data = match &obj.handle {
                    ObjectHandle::Strong(data) => data.serialize(),
                    ObjectHandle::Weak(weak) => weak.upgrade().and_then(|d| d.serialize()),
                };
                let Some(bytes) = data else {
                    return Err(SerializeError::InvalidData(format!(
                        "object {}/{} is not serializable",
                        obj.vendor_id, obj.type_id
                    )));
                };
                w.write_i32(obj.vendor_id);
                w.write_i32(obj.type_id);
                w.write_u64(bytes.len() as u64);
                w.write_raw(&bytes);
            }
            Var::Array(array) => {
                w.write_u8(u8::from(array.inner));
                w.write_u32(array.len() as u32);
                w.write_raw(&array.data);
            }
            Var::Trait(t) => {
                w.write_u64(t.id[0]);
                w.write_u64(t.id[1]);
                w.write_str(&t.name);
            }
            Var::Type(t) => self.write_type(t, w)?,
        }
        Ok(())
    }

    pub fn read_var(&mut self, r: &mut BufferReader<'_>) -> Result<Var, SerializeError> {
        let tag_byte = r.read_u8()?;
        let tag = ShType::try_from(tag_byte)
            .map_err(|_| SerializeError::InvalidTypeTag(tag_byte))?;
        Ok(match tag {
            ShType::None => Var::None,
            ShType::Any => {
                return Err(SerializeError::InvalidData("Any is not a value tag".into()))
            }
            ShType::Bool => Var::Bool(r.read_u8()? != 0),
            ShType::Int => Var::Int(r.read_i64()?),
            ShType::Int2 => Var::Int2([r.read_i64()?, r.read_i64()?]),
            ShType::Int3 => Var::Int3([r.read_i32()?, r.read_i32()?, r.read_i32()?]),
            ShType::Int4 => {
                Var::Int4([r.read_i32()?, r.read_i32()?, r.read_i32()?, r.read_i32()?])
            }
            ShType::Int8 => {
                let mut v = [0i16; 8];
                for x in &mut v {
                    *x = r.read_i16()?;
                }
                Var::Int8(v)
            }
            ShType::Int16 => {
                let mut v = [0i8; 16];
                for x in &mut v {
                    *x = r.read_u8()? as i8;
                }
                Var::Int16(v)
            }
            ShType::Float => Var::Float(r.read_f64()?),
            ShType::Float2 => Var::Float2([r.read_f64()?, r.read_f64()?]),
            ShType::Float3 => Var::Float3([r.read_f32()?, r.read_f32()?, r.read_f32()?]),
            ShType::Float4 => {
                Var::Float4([r.read_f32()?, r.read_f32()?, r.read_f32()?, r.read_f32()?])
            }
            ShType::Color => Var::Color(ShColor {
                r: r.read_u8()?,
                g: r.read_u8()?,
                b: r.read_u8()?,
                a: r.read_u8()?,
            }),
            ShType::Enum => Var::Enum(ShEnum {
                value: r.read_i32()?,
                vendor_id: r.read_i32()?,
                type_id: r.read_i32()?,
            }),
            ShType::String => Var::String(r.read_str()?),
            ShType::Path => Var::Path(r.read_str()?),
            ShType::ContextVar => Var::ContextVar(r.read_str()?),
            ShType::Bytes => {
                let len = r.read_u32()? as usize;
                Var::Bytes(r.read_raw(len)?.to_vec())
            }
            ShType::Image => {
                let channels = r.read_u8()?;
                let flags = r.read_u8()?;
                let width = r.read_u16()?;
                let height = r.read_u16()?;
                let size = width as usize * height as usize * channels as usize;
                let data = r.read_raw(size)?.to_vec();
                Var::Image(Box::new(Image { channels, flags, width, height, data, version: 0 }))
            }
            ShType::Audio => {
                let n_samples = r.read_u16()?;
                let channels = r.read_u16()?;
                let sample_rate = r.read_u32()?;
                let count = n_samples as usize * channels as usize;
                let mut samples = Vec::with_capacity(count);
                for _ in 0..count {
                    samples.push(r.read_f32()?);
                }
                Var::Audio(Box::new(Audio { n_samples, channels, sample_rate, samples }))
            }
            ShType::Seq => {
                let len = r.read_u32()? as usize;
                let mut items = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    items.push(self.read_var(r)?);
                }
                Var::Seq(items)
            }
            ShType::Table => {
                let count = r.read_u64()?;
                let mut table = ShTable::new();
                for _ in 0..count {
                    let key = self.read_var(r)?;
                    let value = self.read_var(r)?;
                    table.insert(key, value);
                }
                Var::Table(Box::new(table))
            }
            ShType::Set => {
                let count = r.read_u64()?;
                let mut set = ShSet::new();
                for _ in 0..count {
                    set.insert(self.read_var(r)?);
                }
                Var::Set(Box::new(set))
            }
            ShType::Wire => Var::Wire(self.read_wire(r)?),
            ShType::ShardRef => Var::ShardRef(self.read_shard(r)?),
            ShType::Object => {
                let vendor_id = r.read_i32()?;
                let type_id = r.read_i32()?;
                let len = r.read_u64()? as usize;
                let bytes = r.read_raw(len)?;
                let info = registry::find_object_type(vendor_id, type_id).ok_or_else(|| {
                    SerializeError::InvalidData(format!(
                        "unknown object type {}/{}",
                        vendor_id, type_id
                    ))
                })?;
                let deserialize = info.deserialize.ok_or_else(|| {
                    SerializeError::InvalidData(format!(
                        "object type {}/{} is not deserializable",
                        vendor_id, type_id
                    ))
                })?;
                let data = deserialize(bytes).ok_or_else(|| {
                    SerializeError::InvalidData(format!(
                        "object type {}/{} failed to deserialize",
                        vendor_id, type_id
                    ))
                })?;
                Var::Object(crate::value::ShObject::new(vendor_id, type_id, data))
            }
            ShType::Array => {
                let inner_byte = r.read_u8()?;
                let inner = ShType::try_from(inner_byte)
                    .map_err(|_| SerializeError::InvalidTypeTag(inner_byte))?;
                let elem_size = inner.blittable_size().ok_or_else(|| {
                    SerializeError::InvalidData(format!("array inner type {} is not packed", inner))
                })?;
                let len = r.read_u32()? as usize;
                let data = r.read_raw(len * elem_size)?.to_vec();
                Var::Array(Box::new(PackedArray { inner, data }))
            }
            ShType::Trait => {
                let id = [r.read_u64()?, r.read_u64()?];
                let name = r.read_str()?;
                Var::Trait(Box::new(WireTrait { id, name }))
            }
            ShType::Type => Var::Type(Box::new(self.read_type(r)?)),
        })
    }

    pub fn write_type(&mut self, info: &TypeInfo, w: &mut BufferWriter) -> Result<(), SerializeError> {
        w.write_u8(u8::from(info.basic_type()));
        match info {
            TypeInfo::Enum { vendor_id, type_id } | TypeInfo::Object { vendor_id, type_id } => {
                w.write_i32(*vendor_id);
                w.write_i32(*type_id);
            }
            TypeInfo::Seq { types, fixed_size } => {
                w.write_u32(*fixed_size);
                w.write_u32(types.len() as u32);
                for t in types {
                    self.write_type(t, w)?;
                }
            }
            TypeInfo::Set(types) | TypeInfo::ContextVar(types) => {
                w.write_u32(types.len() as u32);
                for t in types {
                    self.write_type(t, w)?;
                }
            }
            TypeInfo::Table { keys, types } => {
                w.write_u32(types.len() as u32);
                for (i, t) in types.iter().enumerate() {
                    match keys.get(i) {
                        Some(key) => self.write_var(key, w)?,
                        None => self.write_var(&Var::None, w)?,
                    }
                    self.write_type(t, w)?;
                }
            }
            TypeInfo::Array { inner } => w.write_u8(u8::from(*inner)),
            TypeInfo::Type(inner) => self.write_type(inner, w)?,
            _ => {}
        }
        Ok(())
    }

    pub fn read_type(&mut self, r: &mut BufferReader<'_>) -> Result<TypeInfo, SerializeError> {
        let tag_byte = r.read_u8()?;
        let tag = ShType::try_from(tag_byte)
            .map_err(|_| SerializeError::InvalidTypeTag(tag_byte))?;
        Ok(match tag {
            ShType::None => TypeInfo::None,
            ShType::Any => TypeInfo::Any,
            ShType::Bool => TypeInfo::Bool,
            ShType::Int => TypeInfo::Int,
            ShType::Int2 => TypeInfo::Int2,
            ShType::Int3 => TypeInfo::Int3,
            ShType::Int4 => TypeInfo::Int4,
            ShType::Int8 => TypeInfo::Int8,
            ShType::Int16 => TypeInfo::Int16,
            ShType::Float => TypeInfo::Float,
            ShType::Float2 => TypeInfo::Float2,
            ShType::Float3 => TypeInfo::Float3,
            ShType::Float4 => TypeInfo::Float4,
            ShType::Color => TypeInfo::Color,
            ShType::Enum => TypeInfo::Enum { vendor_id: r.read_i32()?, type_id: r.read_i32()? },
            ShType::String => TypeInfo::String,
            ShType::Path => TypeInfo::Path,
            ShType::ContextVar => {
                let count = r.read_u32()? as usize;
                let mut types = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    types.push(self.read_type(r)?);
                }
                TypeInfo::ContextVar(types)
            }
            ShType::Bytes => TypeInfo::Bytes,
            ShType::Image => TypeInfo::Image,
            ShType::Audio => TypeInfo::Audio,
            ShType::Seq => {
                let fixed_size = r.read_u32()?;
                let count = r.read_u32()? as usize;
                let mut types = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    types.push(self.read_type(r)?);
                }
                TypeInfo::Seq { types, fixed_size }
            }
            ShType::Table => {
                let count = r.read_u32()? as usize;
                let mut keys = Vec::with_capacity(count.min(256));
                let mut types = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    keys.push(self.read_var(r)?);
                    types.push(self.read_type(r)?);
                }
                TypeInfo::Table { keys, types }
            }
            ShType::Set => {
                let count = r.read_u32()? as usize;
                let mut types = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    types.push(self.read_type(r)?);
                }
                TypeInfo::Set(types)
            }
            ShType::Wire => TypeInfo::Wire,
            ShType::ShardRef => TypeInfo::ShardRef,
            ShType::Object => {
                TypeInfo::Object { vendor_id: r.read_i32()?, type_id: r.read_i32()? }
            }
            ShType::Array => {
                let inner_byte = r.read_u8()?;
                let inner = ShType::try_from(inner_byte)
                    .map_err(|_| SerializeError::InvalidTypeTag(inner_byte))?;
                TypeInfo::Array { inner }
            }
            ShType::Trait => TypeInfo::Trait,
            ShType::Type => TypeInfo::Type(Box::new(self.read_type(r)?)),
        })
    }

    /// Serialize a shard: name, hash, non-default parameters terminated
    /// by index -1, state, source anchor.
    pub fn write_shard(
        &mut self,
        shard: &ShardInstance,
        w: &mut BufferWriter,
    ) -> Result<(), SerializeError> {
        let name = shard.name();
        w.write_str(name);
        w.write_u32(shard.shard_hash());

        let prototype = self
            .prototypes
            .entry(name.to_string())
            .or_insert_with(|| registry::create_shard(name))
            .clone();

        let params = shard.parameters();
        for index in 0..params.len() {
            let value = shard
                .get_param(index)
                .map_err(|e| SerializeError::Shard(e.to_string()))?;
            let default = prototype.as_ref().and_then(|p| p.get_param(index).ok());
            let differs = default.map(|d| d != value).unwrap_or(true);
            if differs {
                w.write_i32(index as i32);
                self.write_var(&value, w)?;
            }
        }
        w.write_i32(-1); // end of params

        self.write_var(&shard.get_state(), w)?;

        w.write_u32(shard.line());
        w.write_u32(shard.column());
        Ok(())
    }

    /// Reconstruct a shard through the registry. A hash mismatch means
    /// the serialized version is not compatible with this build and is
    /// fatal.
    pub fn read_shard(&mut self, r: &mut BufferReader<'_>) -> Result<ShardInstance, SerializeError> {
        let name = r.read_str()?;
        let serialized_hash = r.read_u32()?;

        let shard = registry::create_shard(&name)
            .ok_or_else(|| SerializeError::UnknownShard(name.clone()))?;
        let current = shard.shard_hash();
        if current != serialized_hash {
            return Err(SerializeError::ShardHashMismatch {
                name,
                serialized: serialized_hash,
                current,
            });
        }

        loop {
            let index = r.read_i32()?;
            if index == -1 {
                break;
            }
            let value = self.read_var(r)?;
            shard
                .set_param(index as usize, &value)
                .map_err(|e| SerializeError::Shard(format!("{}: {}", name, e)))?;
        }

        let state = self.read_var(r)?;
        if !state.is_none() {
            shard.set_state(&state);
        }

        let line = r.read_u32()?;
        let column = r.read_u32()?;
        shard.set_source_anchor(line, column);

        Ok(shard)
    }

    /// Serialize a wire. The first occurrence writes the full body;
    /// wires already in the seen-cache emit only name + content hash.
    pub fn write_wire(&mut self, wire: &Rc<Wire>, w: &mut BufferWriter) -> Result<(), SerializeError> {
        w.write_str(wire.name());
        let digest = hash_wire(wire);
        self.write_var(&int2_from_digest(digest), w)?;

        if self.wires.contains_key(&digest) {
            return Ok(());
        }
        // cache before the body so self references resolve
        self.wires.insert(digest, wire.clone());

        w.write_u8(wire.is_looped() as u8);
        w.write_u8(wire.is_unsafe() as u8);
        w.write_u8(wire.is_pure() as u8);

        let shards = wire.shards();
        w.write_u32(shards.len() as u32);
        for shard in shards.iter() {
            self.write_shard(shard, w)?;
        }
        drop(shards);

        let traits = wire.traits();
        w.write_u32(traits.len() as u32);
        for t in &traits {
            w.write_u64(t.id[0]);
            w.write_u64(t.id[1]);
            w.write_str(&t.name);
        }

        Ok(())
    }

    pub fn read_wire(&mut self, r: &mut BufferReader<'_>) -> Result<Rc<Wire>, SerializeError> {
        let name = r.read_str()?;
        let hash_var = self.read_var(r)?;
        let digest = digest_from_int2(&hash_var)
            .ok_or_else(|| SerializeError::InvalidData("wire hash must be an Int2".into()))?;

        if let Some(cached) = self.wires.get(&digest) {
            return Ok(cached.clone());
        }

        let wire = Wire::new(name);
        self.wires.insert(digest, wire.clone());

        wire.set_looped(r.read_u8()? != 0);
        wire.set_unsafe(r.read_u8()? != 0);
        wire.set_pure(r.read_u8()? != 0);

        let shard_count = r.read_u32()?;
        for _ in 0..shard_count {
            wire.add_shard(self.read_shard(r)?);
        }

        let trait_count = r.read_u32()?;
        for _ in 0..trait_count {
            let id = [r.read_u64()?, r.read_u64()?];
            let trait_name = r.read_str()?;
            wire.add_trait(WireTrait { id, name: trait_name });
        }

        Ok(wire)
    }
}

/// One-shot encode of a value.
pub fn to_bytes(var: &Var) -> Result<Vec<u8>, SerializeError> {
    let mut serializer = Serialization::new();
    let mut writer = BufferWriter::new();
    serializer.write_var(var, &mut writer)?;
    Ok(writer.bytes)
}

/// One-shot decode of a value.
pub fn from_bytes(bytes: &[u8]) -> Result<Var, SerializeError> {
    let mut serializer = Serialization::new();
    let mut reader = BufferReader::new(bytes);
    serializer.read_var(&mut reader)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(var: &Var) -> Var {
        let bytes = to_bytes(var).unwrap();
        from_bytes(&bytes).unwrap()
    }

    #[test]
    fn test_scalar_roundtrips() {
        for var in [
            Var::None,
            Var::Bool(true),
            Var::Int(-42),
            Var::Int2([1, -2]),
            Var::Int3([1, 2, 3]),
            Var::Float(2.75),
            Var::Float2([0.5, -0.25]),
            Var::Color(ShColor { r: 1, g: 2, b: 3, a: 4 }),
            Var::Enum(ShEnum { value: 3, vendor_id: 7, type_id: 9 }),
        ] {
            assert_eq!(roundtrip(&var), var);
        }
    }

    #[test]
    fn test_string_family_roundtrips() {
        assert_eq!(roundtrip(&Var::from("hello")), Var::from("hello"));
        assert_eq!(roundtrip(&Var::Path("/tmp/x".into())), Var::Path("/tmp/x".into()));
        assert_eq!(
            roundtrip(&Var::ContextVar("speed".into())),
            Var::ContextVar("speed".into())
        );
        assert_eq!(roundtrip(&Var::Bytes(vec![1, 2, 3])), Var::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn test_container_roundtrips() {
        let seq = Var::Seq(vec![Var::Int(1), Var::from("two"), Var::Float(3.0)]);
        assert_eq!(roundtrip(&seq), seq);

        let mut table = ShTable::new();
        table.insert(Var::from("k"), Var::Int(1));
        table.insert(Var::Int(2), Var::from("v"));
        let table = Var::Table(Box::new(table));
        assert_eq!(roundtrip(&table), table);

        let mut set = ShSet::new();
        set.insert(Var::Int(1));
        set.insert(Var::Int(5));
        let set = Var::Set(Box::new(set));
        assert_eq!(roundtrip(&set), set);
    }

    #[test]
    fn test_image_audio_roundtrips() {
        let img = Var::Image(Box::new(Image {
            channels: 2,
            flags: 0,
            width: 2,
            height: 2,
            data: vec![9; 8],
            version: 3,
        }));
        // version is runtime-only, not part of the stream
        match roundtrip(&img) {
            Var::Image(out) => {
                assert_eq!(out.data, vec![9; 8]);
                assert_eq!(out.version, 0);
            }
            other => panic!("expected image, got {}", other),
        }

        let audio = Var::Audio(Box::new(Audio {
            n_samples: 2,
            channels: 2,
            sample_rate: 44100,
            samples: vec![0.1, 0.2, 0.3, 0.4],
        }));
        assert_eq!(roundtrip(&audio), audio);
    }

    #[test]
    fn test_type_roundtrip() {
        let info = TypeInfo::Seq {
            types: vec![TypeInfo::Int, TypeInfo::Table {
                keys: vec![Var::from("x"), Var::None],
                types: vec![TypeInfo::Float, TypeInfo::String],
            }],
            fixed_size: 3,
        };
        let var = Var::Type(Box::new(info));
        assert_eq!(roundtrip(&var), var);
    }

    #[test]
    fn test_truncated_stream_overflows() {
        let bytes = to_bytes(&Var::from("a longer string payload")).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        match from_bytes(truncated) {
            Err(SerializeError::Overflow { .. }) => {}
            other => panic!("expected overflow, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_tag_rejected() {
        match from_bytes(&[0xEE]) {
            Err(SerializeError::InvalidTypeTag(0xEE)) => {}
            other => panic!("expected invalid tag, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_stream_overflows() {
        assert!(matches!(from_bytes(&[]), Err(SerializeError::Overflow { .. })));
    }
}
