//! Variant values - the polymorphic currency of the engine
//!
//! Every value flowing between shards is a `Var`: a tagged union over a
//! closed set of types. Numeric tags are plain payloads copied by value;
//! container tags own heap storage; `Wire`/`ShardRef`/`Object` tags are
//! shared handles.
//!
//! The important contract here is *clone-into-reuse*: `Clone::clone_from`
//! must reuse destination capacity whenever tags and shapes line up, so a
//! shard that writes the same variable every iteration never re-allocates
//! on the hot path. `clone` always produces an independent deep copy
//! (handles excepted, which bump their reference count).

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::sync::Arc;

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::shard::ShardInstance;
use crate::types::TypeInfo;
use crate::wire::Wire;

/// Hard cap on dynamic sequence growth. Exceeding it is a logic bug
/// severe enough to kill the process rather than corrupt memory.
pub const MAX_SEQ_LEN: usize = u32::MAX as usize;

/// The closed tag set. `Any` only ever appears at the type level, never
/// as a live value tag; it lives here so type descriptors and serialized
/// streams share one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ShType {
    None = 0,
    Any = 1,
    Bool = 2,
    Int = 3,
    Int2 = 4,
    Int3 = 5,
    Int4 = 6,
    Int8 = 7,
    Int16 = 8,
    Float = 9,
    Float2 = 10,
    Float3 = 11,
    Float4 = 12,
    Color = 13,
    Enum = 14,
    String = 15,
    Path = 16,
    ContextVar = 17,
    Bytes = 18,
    Image = 19,
    Audio = 20,
    Seq = 21,
    Table = 22,
    Set = 23,
    Wire = 24,
    ShardRef = 25,
    Object = 26,
    Array = 27,
    Trait = 28,
    Type = 29,
}

impl ShType {
    /// Payload size in bytes for tags that can live in a packed `Array`.
    /// Non-blittable tags return `None`.
    pub fn blittable_size(self) -> Option<usize> {
        match self {
            ShType::Bool => Some(1),
            ShType::Int => Some(8),
            ShType::Int2 => Some(16),
            ShType::Int3 => Some(12),
            ShType::Int4 => Some(16),
            ShType::Int8 => Some(16),
            ShType::Int16 => Some(16),
            ShType::Float => Some(8),
            ShType::Float2 => Some(16),
            ShType::Float3 => Some(12),
            ShType::Float4 => Some(16),
            ShType::Color => Some(4),
            ShType::Enum => Some(12),
            _ => None,
        }
    }
}

impl std::fmt::Display for ShType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// RGBA color, 8 bits per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ShColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

/// Enum payload: a value within a registered (vendor, type) enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShEnum {
    pub value: i32,
    pub vendor_id: i32,
    pub type_id: i32,
}

/// Image payload. `version` is bumped every time the pixel buffer is
/// rewritten in place so downstream caches can detect staleness.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Image {
    pub channels: u8,
    pub flags: u8,
    pub width: u16,
    pub height: u16,
    pub data: Vec<u8>,
    pub version: u32,
}

/// Audio payload: interleaved f32 samples.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Audio {
    pub n_samples: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

/// Ordered table keyed by the total `Var` ordering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShTable(pub BTreeMap<Var, Var>);

impl ShTable {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, key: &Var) -> Option<&Var> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: Var, value: Var) -> Option<Var> {
        self.0.insert(key, value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Unordered set of values. Iteration is sorted (BTree), but hashing and
/// equality are insertion-order independent by construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShSet(pub BTreeSet<Var>);

impl ShSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn contains(&self, value: &Var) -> bool {
        self.0.contains(value)
    }

    pub fn insert(&mut self, value: Var) -> bool {
        self.0.insert(value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Packed array of blittable payloads sharing one inner type.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedArray {
    pub inner: ShType,
    pub data: Vec<u8>,
}

impl PackedArray {
    pub fn new(inner: ShType) -> Self {
        debug_assert!(inner.blittable_size().is_some());
        Self { inner, data: Vec::new() }
    }

    /// Number of packed elements.
    pub fn len(&self) -> usize {
        match self.inner.blittable_size() {
            Some(size) if size > 0 => self.data.len() / size,
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A named capability advertised by a wire so other code can discover it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WireTrait {
    pub id: [u64; 2],
    pub name: String,
}

impl WireTrait {
    pub fn same_id_as(&self, other: &WireTrait) -> bool {
        self.id == other.id
    }
}

/// Vtable carried by `Object` variants. Hooks are optional; the defaults
/// make an object opaque, unhashable-by-content and thread-bound.
pub trait ObjectData: std::any::Any {
    /// Stable byte representation, if the object supports serialization.
    fn serialize(&self) -> Option<Vec<u8>> {
        None
    }

    /// Whether the object may be shared between meshes on different threads.
    fn is_thread_safe(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn std::any::Any;
}

/// Object payload: opaque data plus its registered (vendor, type) identity.
/// Weak handles observe without keeping the payload alive.
#[derive(Clone)]
pub enum ObjectHandle {
    Strong(Arc<dyn ObjectData>),
    Weak(std::sync::Weak<dyn ObjectData>),
}

impl ObjectHandle {
    pub fn upgrade(&self) -> Option<Arc<dyn ObjectData>> {
        match self {
            ObjectHandle::Strong(arc) => Some(arc.clone()),
            ObjectHandle::Weak(weak) => weak.upgrade(),
        }
    }

    fn addr(&self) -> usize {
        match self {
            ObjectHandle::Strong(arc) => Arc::as_ptr(arc) as *const () as usize,
            ObjectHandle::Weak(weak) => weak.as_ptr() as *const () as usize,
        }
    }
}

#[derive(Clone)]
pub struct ShObject {
    pub vendor_id: i32,
    pub type_id: i32,
    pub handle: ObjectHandle,
}

impl ShObject {
    pub fn new(vendor_id: i32, type_id: i32, data: Arc<dyn ObjectData>) -> Self {
        Self { vendor_id, type_id, handle: ObjectHandle::Strong(data) }
    }

    /// Downgrade to a weak observer of the same payload.
    pub fn weak(&self) -> Self {
        let handle = match &self.handle {
            ObjectHandle::Strong(arc) => ObjectHandle::Weak(Arc::downgrade(arc)),
            ObjectHandle::Weak(weak) => ObjectHandle::Weak(weak.clone()),
        };
        Self { vendor_id: self.vendor_id, type_id: self.type_id, handle }
    }
}

impl std::fmt::Debug for ShObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShObject")
            .field("vendor_id", &self.vendor_id)
            .field("type_id", &self.type_id)
            .field("addr", &self.handle.addr())
            .finish()
    }
}

/// The engine's polymorphic value.
#[derive(Debug)]
pub enum Var {
    None,
    Bool(bool),
    Int(i64),
    Int2([i64; 2]),
    Int3([i32; 3]),
    Int4([i32; 4]),
    Int8([i16; 8]),
    Int16([i8; 16]),
    Float(f64),
    Float2([f64; 2]),
    Float3([f32; 3]),
    Float4([f32; 4]),
    Color(ShColor),
    Enum(ShEnum),
    String(String),
    Path(String),
    ContextVar(String),
    Bytes(Vec<u8>),
    Image(Box<Image>),
    Audio(Box<Audio>),
    Seq(Vec<Var>),
    Table(Box<ShTable>),
    Set(Box<ShSet>),
    Wire(Rc<Wire>),
    ShardRef(ShardInstance),
    Object(ShObject),
    Array(Box<PackedArray>),
    Trait(Box<WireTrait>),
    Type(Box<TypeInfo>),
}

// Safety: Var crosses thread boundaries in exactly one place - the value
// returned by a TidePool worker inside `await_blocking`. The contract is
// the same one the engine imposes at every other boundary:
// - plain data tags (numerics, strings, bytes, containers of those) are
//   owned and carry no shared state;
// - `Wire`/`ShardRef` handles must only be cloned, dropped or
//   dereferenced on the mesh thread that owns them;
// - `Object` payloads shared across threads must answer
//   `is_thread_safe() == true`.
// Meshes never migrate fibers between threads, so code holding a Var on
// the wrong thread has already broken the scheduling contract.
unsafe impl Send for Var {}
unsafe impl Sync for Var {}

impl Default for Var {
    fn default() -> Self {
        Var::None
    }
}

impl Var {
    pub fn sh_type(&self) -> ShType {
        match self {
            Var::None => ShType::None,
            Var::Bool(_) => ShType::Bool,
            Var::Int(_) => ShType::Int,
            Var::Int2(_) => ShType::Int2,
            Var::Int3(_) => ShType::Int3,
            Var::Int4(_) => ShType::Int4,
            Var::Int8(_) => ShType::Int8,
            Var::Int16(_) => ShType::Int16,
            Var::Float(_) => ShType::Float,
            Var::Float2(_) => ShType::Float2,
            Var::Float3(_) => ShType::Float3,
            Var::Float4(_) => ShType::Float4,
            Var::Color(_) => ShType::Color,
            Var::Enum(_) => ShType::Enum,
            Var::String(_) => ShType::String,
            Var::Path(_) => ShType::Path,
            Var::ContextVar(_) => ShType::ContextVar,
            Var::Bytes(_) => ShType::Bytes,
            Var::Image(_) => ShType::Image,
            Var::Audio(_) => ShType::Audio,
            Var::Seq(_) => ShType::Seq,
            Var::Table(_) => ShType::Table,
            Var::Set(_) => ShType::Set,
            Var::Wire(_) => ShType::Wire,
            Var::ShardRef(_) => ShType::ShardRef,
            Var::Object(_) => ShType::Object,
            Var::Array(_) => ShType::Array,
            Var::Trait(_) => ShType::Trait,
            Var::Type(_) => ShType::Type,
        }
    }

    /// Blittable tags copy by plain value; everything else owns heap
    /// storage or a refcounted handle.
    pub fn is_blittable(&self) -> bool {
        matches!(
            self,
            Var::None
                | Var::Bool(_)
                | Var::Int(_)
                | Var::Int2(_)
                | Var::Int3(_)
                | Var::Int4(_)
                | Var::Int8(_)
                | Var::Int16(_)
                | Var::Float(_)
                | Var::Float2(_)
                | Var::Float3(_)
                | Var::Float4(_)
                | Var::Color(_)
                | Var::Enum(_)
        )
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Var::None)
    }

    /// Truthiness used by flow shards: `None` and `false` are falsy,
    /// everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Var::None | Var::Bool(false))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Var::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Var::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Var::String(s) | Var::Path(s) | Var::ContextVar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Var]> {
        match self {
            Var::Seq(s) => Some(s),
            _ => None,
        }
    }

    /// Total ordering: tag ordinal first, then payload. Handles order by
    /// identity; floats by IEEE total order so `Var` can key tables.
    pub fn total_cmp(&self, other: &Var) -> Ordering {
        let lt = self.sh_type();
        let rt = other.sh_type();
        if lt != rt {
            return lt.cmp(&rt);
        }
        match (self, other) {
            (Var::None, Var::None) => Ordering::Equal,
            (Var::Bool(a), Var::Bool(b)) => a.cmp(b),
            (Var::Int(a), Var::Int(b)) => a.cmp(b),
            (Var::Int2(a), Var::Int2(b)) => a.cmp(b),
            (Var::Int3(a), Var::Int3(b)) => a.cmp(b),
            (Var::Int4(a), Var::Int4(b)) => a.cmp(b),
            (Var::Int8(a), Var::Int8(b)) => a.cmp(b),
            (Var::Int16(a), Var::Int16(b)) => a.cmp(b),
            (Var::Float(a), Var::Float(b)) => a.total_cmp(b),
            (Var::Float2(a), Var::Float2(b)) => cmp_float_slices(a, b),
            (Var::Float3(a), Var::Float3(b)) => cmp_f32_slices(a, b),
            (Var::Float4(a), Var::Float4(b)) => cmp_f32_slices(a, b),
            (Var::Color(a), Var::Color(b)) => a.cmp(b),
            (Var::Enum(a), Var::Enum(b)) => a.cmp(b),
            (Var::String(a), Var::String(b))
            | (Var::Path(a), Var::Path(b))
            | (Var::ContextVar(a), Var::ContextVar(b)) => a.cmp(b),
            (Var::Bytes(a), Var::Bytes(b)) => a.cmp(b),
            (Var::Image(a), Var::Image(b)) => (a.channels, a.flags, a.width, a.height, &a.data)
                .cmp(&(b.channels, b.flags, b.width, b.height, &b.data)),
            (Var::Audio(a), Var::Audio(b)) => (a.n_samples, a.channels, a.sample_rate)
                .cmp(&(b.n_samples, b.channels, b.sample_rate))
                .then_with(|| cmp_f32_slices(&a.samples, &b.samples)),
            (Var::Seq(a), Var::Seq(b)) => cmp_var_slices(a, b),
            (Var::Table(a), Var::Table(b)) => {
                let mut ai = a.0.iter();
                let mut bi = b.0.iter();
                loop {
                    match (ai.next(), bi.next()) {
                        (None, None) => return Ordering::Equal,
                        (None, Some(_)) => return Ordering::Less,
                        (Some(_), None) => return Ordering::Greater,
                        (Some((ak, av)), Some((bk, bv))) => {
                            let ord = ak.total_cmp(bk).then_with(|| av.total_cmp(bv));
                            if ord != Ordering::Equal {
                                return ord;
                            }
                        }
                    }
                }
            }
            (Var::Set(a), Var::Set(b)) => {
                let mut ai = a.0.iter();
                let mut bi = b.0.iter();
                loop {
                    match (ai.next(), bi.next()) {
                        (None, None) => return Ordering::Equal,
                        (None, Some(_)) => return Ordering::Less,
                        (Some(_), None) => return Ordering::Greater,
                        (Some(av), Some(bv)) => {
                            let ord = av.total_cmp(bv);
                            if ord != Ordering::Equal {
                                return ord;
                            }
                        }
                    }
                }
            }
            (Var::Wire(a), Var::Wire(b)) => (Rc::as_ptr(a) as usize).cmp(&(Rc::as_ptr(b) as usize)),
            (Var::ShardRef(a), Var::ShardRef(b)) => a.addr().cmp(&b.addr()),
            (Var::Object(a), Var::Object(b)) => (a.vendor_id, a.type_id, a.handle.addr())
                .cmp(&(b.vendor_id, b.type_id, b.handle.addr())),
            (Var::Array(a), Var::Array(b)) => (a.inner, &a.data).cmp(&(b.inner, &b.data)),
            (Var::Trait(a), Var::Trait(b)) => a.cmp(b),
            (Var::Type(a), Var::Type(b)) => a.cmp(b),
            _ => unreachable!("total_cmp: tags already matched"),
        }
    }
}

fn cmp_float_slices(a: &[f64], b: &[f64]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = x.total_cmp(y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn cmp_f32_slices(a: &[f32], b: &[f32]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = x.total_cmp(y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn cmp_var_slices(a: &[Var], b: &[Var]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = x.total_cmp(y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.total_cmp(other) == Ordering::Equal
    }
}

impl Eq for Var {}

impl PartialOrd for Var {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.total_cmp(other))
    }
}

impl Ord for Var {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

impl Clone for Var {
    fn clone(&self) -> Self {
        match self {
            Var::None => Var::None,
            Var::Bool(v) => Var::Bool(*v),
            Var::Int(v) => Var::Int(*v),
            Var::Int2(v) => Var::Int2(*v),
            Var::Int3(v) => Var::Int3(*v),
            Var::Int4(v) => Var::Int4(*v),
            Var::Int8(v) => Var::Int8(*v),
            Var::Int16(v) => Var::Int16(*v),
            Var::Float(v) => Var::Float(*v),
            Var::Float2(v) => Var::Float2(*v),
            Var::Float3(v) => Var::Float3(*v),
            Var::Float4(v) => Var::Float4(*v),
            Var::Color(v) => Var::Color(*v),
            Var::Enum(v) => Var::Enum(*v),
            Var::String(v) => Var::String(v.clone()),
            Var::Path(v) => Var::Path(v.clone()),
            Var::ContextVar(v) => Var::ContextVar(v.clone()),
            Var::Bytes(v) => Var::Bytes(v.clone()),
            Var::Image(v) => Var::Image(v.clone()),
            Var::Audio(v) => Var::Audio(v.clone()),
            Var::Seq(v) => Var::Seq(v.clone()),
            Var::Table(v) => Var::Table(v.clone()),
            Var::Set(v) => Var::Set(v.clone()),
            Var::Wire(v) => Var::Wire(v.clone()),
            Var::ShardRef(v) => Var::ShardRef(v.clone()),
            Var::Object(v) => Var::Object(v.clone()),
            Var::Array(v) => Var::Array(v.clone()),
            Var::Trait(v) => Var::Trait(v.clone()),
            Var::Type(v) => Var::Type(v.clone()),
        }
    }

    /// Clone-into with capacity reuse. Same-tag, compatible-shape
    /// destinations keep their heap buffers; anything else falls back to
    /// a fresh deep clone.
    fn clone_from(&mut self, src: &Self) {
        match (&mut *self, src) {
            (Var::String(d), Var::String(s))
            | (Var::Path(d), Var::Path(s))
            | (Var::ContextVar(d), Var::ContextVar(s)) => {
                d.clear();
                d.push_str(s);
            }
            (Var::Bytes(d), Var::Bytes(s)) => {
                d.clear();
                d.extend_from_slice(s);
            }
            (Var::Seq(d), Var::Seq(s)) => {
                seq_resize(d, s.len());
                for (dv, sv) in d.iter_mut().zip(s.iter()) {
                    dv.clone_from(sv);
                }
            }
            (Var::Table(d), Var::Table(s)) => {
                // Happy path for repeated writes: identical key sets let
                // us clone values in place so nested buffers are reused.
                if d.len() == s.len() && d.0.keys().zip(s.0.keys()).all(|(a, b)| a == b) {
                    for (dv, sv) in d.0.values_mut().zip(s.0.values()) {
                        dv.clone_from(sv);
                    }
                } else {
                    *d = s.clone();
                }
            }
            (Var::Image(d), Var::Image(s)) => {
                d.channels = s.channels;
                d.flags = s.flags;
                d.width = s.width;
                d.height = s.height;
                d.data.clear();
                d.data.extend_from_slice(&s.data);
                d.version = d.version.wrapping_add(1);
            }
            (Var::Audio(d), Var::Audio(s)) => {
                d.n_samples = s.n_samples;
                d.channels = s.channels;
                d.sample_rate = s.sample_rate;
                d.samples.clear();
                d.samples.extend_from_slice(&s.samples);
            }
            (dst, src) => *dst = src.clone(),
        }
    }
}

/// Reset a value to `None`, releasing any payload it owned.
pub fn destroy_var(var: &mut Var) {
    *var = Var::None;
}

/// Deep clone `src` into `dst`, reusing destination storage where the
/// shapes allow it.
pub fn clone_var(dst: &mut Var, src: &Var) {
    dst.clone_from(src);
}

/// Resize a sequence, zero-filling (`Var::None`) new slots so that
/// clone-into remains valid on every element. Aborts the process when the
/// requested length exceeds the engine cap.
pub fn seq_resize(seq: &mut Vec<Var>, len: usize) {
    if len > MAX_SEQ_LEN {
        tracing::error!(len, "sequence resize beyond engine cap");
        std::process::abort();
    }
    seq.resize_with(len, || Var::None);
}

/// Append to a sequence with the same growth cap as `seq_resize`.
pub fn seq_push(seq: &mut Vec<Var>, value: Var) {
    if seq.len() >= MAX_SEQ_LEN {
        tracing::error!("sequence push beyond engine cap");
        std::process::abort();
    }
    seq.push(value);
}

/// Approximate equality: floats and float vectors compare within `eps`,
/// sequences recurse, everything else falls back to exact equality.
pub fn almost_equal(a: &Var, b: &Var, eps: f64) -> bool {
    match (a, b) {
        (Var::Float(x), Var::Float(y)) => (x - y).abs() <= eps,
        (Var::Float2(x), Var::Float2(y)) => {
            x.iter().zip(y.iter()).all(|(p, q)| (p - q).abs() <= eps)
        }
        (Var::Float3(x), Var::Float3(y)) => x
            .iter()
            .zip(y.iter())
            .all(|(p, q)| (f64::from(*p) - f64::from(*q)).abs() <= eps),
        (Var::Float4(x), Var::Float4(y)) => x
            .iter()
            .zip(y.iter())
            .all(|(p, q)| (f64::from(*p) - f64::from(*q)).abs() <= eps),
        (Var::Seq(x), Var::Seq(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| almost_equal(p, q, eps))
        }
        _ => a == b,
    }
}

impl std::fmt::Display for Var {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Var::None => write!(f, "none"),
            Var::Bool(v) => write!(f, "{}", v),
            Var::Int(v) => write!(f, "{}", v),
            Var::Int2(v) => write!(f, "({} {})", v[0], v[1]),
            Var::Int3(v) => write!(f, "({} {} {})", v[0], v[1], v[2]),
            Var::Int4(v) => write!(f, "({} {} {} {})", v[0], v[1], v[2], v[3]),
            Var::Int8(v) => write!(f, "{:?}", v),
            Var::Int16(v) => write!(f, "{:?}", v),
            Var::Float(v) => write!(f, "{}", v),
            Var::Float2(v) => write!(f, "({} {})", v[0], v[1]),
            Var::Float3(v) => write!(f, "({} {} {})", v[0], v[1], v[2]),
            Var::Float4(v) => write!(f, "({} {} {} {})", v[0], v[1], v[2], v[3]),
            Var::Color(c) => write!(f, "#{:02x}{:02x}{:02x}{:02x}", c.r, c.g, c.b, c.a),
            Var::Enum(e) => write!(f, "enum({}/{}:{})", e.vendor_id, e.type_id, e.value),
            Var::String(s) => write!(f, "{:?}", s),
            Var::Path(s) => write!(f, "path({})", s),
            Var::ContextVar(s) => write!(f, "${}", s),
            Var::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            Var::Image(i) => write!(f, "image({}x{}x{})", i.width, i.height, i.channels),
            Var::Audio(a) => write!(f, "audio({}ch@{}Hz)", a.channels, a.sample_rate),
            Var::Seq(s) => {
                write!(f, "[")?;
                for (i, v) in s.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Var::Table(t) => {
                write!(f, "{{")?;
                for (i, (k, v)) in t.0.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Var::Set(s) => write!(f, "set[{}]", s.len()),
            Var::Wire(w) => write!(f, "wire({})", w.name()),
            Var::ShardRef(s) => write!(f, "shard({})", s.name()),
            Var::Object(o) => write!(f, "object({}/{})", o.vendor_id, o.type_id),
            Var::Array(a) => write!(f, "array({}x{})", a.inner, a.len()),
            Var::Trait(t) => write!(f, "trait({})", t.name),
            Var::Type(t) => write!(f, "type({})", t),
        }
    }
}

impl From<bool> for Var {
    fn from(v: bool) -> Self {
        Var::Bool(v)
    }
}

impl From<i64> for Var {
    fn from(v: i64) -> Self {
        Var::Int(v)
    }
}

impl From<f64> for Var {
    fn from(v: f64) -> Self {
        Var::Float(v)
    }
}

impl From<&str> for Var {
    fn from(v: &str) -> Self {
        Var::String(v.to_string())
    }
}

impl From<String> for Var {
    fn from(v: String) -> Self {
        Var::String(v)
    }
}

impl From<Vec<Var>> for Var {
    fn from(v: Vec<Var>) -> Self {
        Var::Seq(v)
    }
}

bitflags! {
    /// Flags on a variable slot. Ownership and refcounting are handled by
    /// Rust (`Rc<Variable>` strong counts), so only the semantic flags
    /// survive from the original flag set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VarFlags: u32 {
        /// Lifetime owned outside the mesh; skipped by scope teardown checks.
        const EXTERNAL = 1 << 0;
        /// Writes fire `OnExposedVarSet` on the owning mesh.
        const EXPOSED = 1 << 1;
    }
}

/// A named variable slot living in a wire or mesh scope.
///
/// `reference_variable` hands out `Rc<Variable>` clones; the strong count
/// is the refcount of the original design and dropping the handle is
/// `releaseVariable`.
#[derive(Debug)]
pub struct Variable {
    pub name: String,
    pub value: RefCell<Var>,
    pub flags: Cell<VarFlags>,
}

impl Variable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: RefCell::new(Var::None),
            flags: Cell::new(VarFlags::empty()),
        }
    }

    pub fn with_value(name: impl Into<String>, value: Var) -> Self {
        let v = Self::new(name);
        *v.value.borrow_mut() = value;
        v
    }

    pub fn is_external(&self) -> bool {
        self.flags.get().contains(VarFlags::EXTERNAL)
    }

    pub fn is_exposed(&self) -> bool {
        self.flags.get().contains(VarFlags::EXPOSED)
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> Var {
        self.value.borrow().clone()
    }

    /// Clone-into the slot, reusing its storage.
    pub fn set(&self, value: &Var) {
        self.value.borrow_mut().clone_from(value);
    }
}

/// Shared handle to a variable slot.
pub type VariableRef = Rc<Variable>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destroy_resets_to_none() {
        let mut v = Var::String("hello".into());
        destroy_var(&mut v);
        assert!(v.is_none());

        let mut v = Var::Seq(vec![Var::Int(1), Var::Int(2)]);
        destroy_var(&mut v);
        assert!(v.is_none());
    }

    #[test]
    fn test_clone_of_clone_equals() {
        let v = Var::Seq(vec![
            Var::Int(42),
            Var::String("abc".into()),
            Var::Float(1.5),
        ]);
        let mut dst = Var::None;
        clone_var(&mut dst, &v);
        assert_eq!(dst, v);
    }

    #[test]
    fn test_string_clone_reuses_capacity() {
        let mut dst = Var::String(String::with_capacity(64));
        let ptr_before = match &dst {
            Var::String(s) => s.as_ptr(),
            _ => unreachable!(),
        };
        let src = Var::String("short".into());
        clone_var(&mut dst, &src);
        match &dst {
            Var::String(s) => {
                assert_eq!(s, "short");
                assert_eq!(s.as_ptr(), ptr_before, "buffer should be reused");
                assert!(s.capacity() >= 64);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_string_clone_reallocates_when_too_small() {
        let mut dst = Var::String(String::new());
        let long = "x".repeat(128);
        clone_var(&mut dst, &Var::String(long.clone()));
        assert_eq!(dst.as_str(), Some(long.as_str()));
    }

    #[test]
    fn test_seq_clone_in_place_preserves_nested_buffers() {
        let mut dst = Var::Seq(vec![Var::String(String::with_capacity(32))]);
        let inner_ptr = match &dst {
            Var::Seq(s) => match &s[0] {
                Var::String(st) => st.as_ptr(),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        };
        let src = Var::Seq(vec![Var::String("hi".into())]);
        clone_var(&mut dst, &src);
        match &dst {
            Var::Seq(s) => match &s[0] {
                Var::String(st) => {
                    assert_eq!(st, "hi");
                    assert_eq!(st.as_ptr(), inner_ptr, "nested buffer should be reused");
                }
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_seq_resize_zero_fills() {
        let mut seq = vec![Var::Int(1)];
        seq_resize(&mut seq, 4);
        assert_eq!(seq.len(), 4);
        assert_eq!(seq[0], Var::Int(1));
        assert!(seq[1..].iter().all(Var::is_none));

        seq_resize(&mut seq, 1);
        assert_eq!(seq.len(), 1);
    }

    #[test]
    fn test_table_clone_in_place_same_keys() {
        let mut src_table = ShTable::new();
        src_table.insert(Var::from("a"), Var::Int(1));
        src_table.insert(Var::from("b"), Var::Int(2));
        let src = Var::Table(Box::new(src_table));

        let mut dst = src.clone();
        // Mutate source values, keep keys.
        let src2 = {
            let mut t = ShTable::new();
            t.insert(Var::from("a"), Var::Int(10));
            t.insert(Var::from("b"), Var::Int(20));
            Var::Table(Box::new(t))
        };
        clone_var(&mut dst, &src2);
        assert_eq!(dst, src2);
    }

    #[test]
    fn test_table_clone_rebuilds_on_shape_change() {
        let mut dst = Var::Table(Box::new(ShTable::new()));
        let src = {
            let mut t = ShTable::new();
            t.insert(Var::Int(1), Var::from("one"));
            Var::Table(Box::new(t))
        };
        clone_var(&mut dst, &src);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_image_clone_bumps_version() {
        let mut dst = Var::Image(Box::new(Image {
            channels: 4,
            width: 2,
            height: 2,
            data: vec![0; 16],
            ..Default::default()
        }));
        let src = Var::Image(Box::new(Image {
            channels: 4,
            width: 2,
            height: 2,
            data: vec![255; 16],
            ..Default::default()
        }));
        clone_var(&mut dst, &src);
        match &dst {
            Var::Image(img) => {
                assert_eq!(img.data, vec![255; 16]);
                assert_eq!(img.version, 1);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_ordering_tag_first() {
        assert!(Var::Bool(true) < Var::Int(0));
        assert!(Var::Int(100) < Var::Float(0.0));
        assert!(Var::Int(1) < Var::Int(2));
    }

    #[test]
    fn test_equality_structural() {
        let a = Var::Seq(vec![Var::Int(1), Var::from("x")]);
        let b = Var::Seq(vec![Var::Int(1), Var::from("x")]);
        assert_eq!(a, b);
        let c = Var::Seq(vec![Var::Int(1), Var::from("y")]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_almost_equal_floats() {
        assert!(almost_equal(&Var::Float(1.0), &Var::Float(1.0 + 1e-12), 1e-9));
        assert!(!almost_equal(&Var::Float(1.0), &Var::Float(1.1), 1e-9));
        assert!(almost_equal(
            &Var::Float2([1.0, 2.0]),
            &Var::Float2([1.0 + 1e-12, 2.0]),
            1e-9
        ));
        assert!(almost_equal(
            &Var::Seq(vec![Var::Float(0.5)]),
            &Var::Seq(vec![Var::Float(0.5 + 1e-12)]),
            1e-9
        ));
    }

    #[test]
    fn test_blittable_classification() {
        assert!(Var::Int(1).is_blittable());
        assert!(Var::Color(ShColor { r: 1, g: 2, b: 3, a: 4 }).is_blittable());
        assert!(!Var::String("x".into()).is_blittable());
        assert!(!Var::Seq(vec![]).is_blittable());
    }

    #[test]
    fn test_variable_slot_set_reuses() {
        let slot = Variable::with_value("x", Var::String(String::with_capacity(64)));
        let ptr = match &*slot.value.borrow() {
            Var::String(s) => s.as_ptr(),
            _ => unreachable!(),
        };
        slot.set(&Var::String("abc".into()));
        let borrowed = slot.value.borrow();
        match &*borrowed {
            Var::String(s) => {
                assert_eq!(s, "abc");
                assert_eq!(s.as_ptr(), ptr);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_weak_object_does_not_keep_alive() {
        struct Dummy;
        impl ObjectData for Dummy {
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }
        let strong = ShObject::new(1, 2, Arc::new(Dummy));
        let weak = strong.weak();
        assert!(weak.handle.upgrade().is_some());
        drop(strong);
        assert!(weak.handle.upgrade().is_none());
    }
}
