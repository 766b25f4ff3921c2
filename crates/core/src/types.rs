//! Type descriptors and structural matching
//!
//! `TypeInfo` mirrors the variant tag set at the type level: sequences
//! carry their allowed element types, tables their key/value schema,
//! context variables the types they may resolve to. `TypeMatcher` decides
//! whether a producer type is acceptable to a receiver, with a handful of
//! relaxation flags for user-written literals.

use crate::error::ComposeError;
use crate::value::{ShType, Var};

/// Structural type information.
///
/// A `Seq` with an empty type list means "sequence of Any"; a `Table`
/// whose trailing key is `None` accepts arbitrary extra keys of the
/// trailing value type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeInfo {
    None,
    Any,
    Bool,
    Int,
    Int2,
    Int3,
    Int4,
    Int8,
    Int16,
    Float,
    Float2,
    Float3,
    Float4,
    Color,
    Enum { vendor_id: i32, type_id: i32 },
    String,
    Path,
    ContextVar(Vec<TypeInfo>),
    Bytes,
    Image,
    Audio,
    Seq { types: Vec<TypeInfo>, fixed_size: u32 },
    Table { keys: Vec<Var>, types: Vec<TypeInfo> },
    Set(Vec<TypeInfo>),
    Wire,
    ShardRef,
    Object { vendor_id: i32, type_id: i32 },
    Array { inner: ShType },
    Trait,
    Type(Box<TypeInfo>),
}

impl Default for TypeInfo {
    fn default() -> Self {
        TypeInfo::None
    }
}

impl TypeInfo {
    pub fn basic_type(&self) -> ShType {
        match self {
            TypeInfo::None => ShType::None,
            TypeInfo::Any => ShType::Any,
            TypeInfo::Bool => ShType::Bool,
            TypeInfo::Int => ShType::Int,
            TypeInfo::Int2 => ShType::Int2,
            TypeInfo::Int3 => ShType::Int3,
            TypeInfo::Int4 => ShType::Int4,
            TypeInfo::Int8 => ShType::Int8,
            TypeInfo::Int16 => ShType::Int16,
            TypeInfo::Float => ShType::Float,
            TypeInfo::Float2 => ShType::Float2,
            TypeInfo::Float3 => ShType::Float3,
            TypeInfo::Float4 => ShType::Float4,
            TypeInfo::Color => ShType::Color,
            TypeInfo::Enum { .. } => ShType::Enum,
            TypeInfo::String => ShType::String,
            TypeInfo::Path => ShType::Path,
            TypeInfo::ContextVar(_) => ShType::ContextVar,
            TypeInfo::Bytes => ShType::Bytes,
            TypeInfo::Image => ShType::Image,
            TypeInfo::Audio => ShType::Audio,
            TypeInfo::Seq { .. } => ShType::Seq,
            TypeInfo::Table { .. } => ShType::Table,
            TypeInfo::Set(_) => ShType::Set,
            TypeInfo::Wire => ShType::Wire,
            TypeInfo::ShardRef => ShType::ShardRef,
            TypeInfo::Object { .. } => ShType::Object,
            TypeInfo::Array { .. } => ShType::Array,
            TypeInfo::Trait => ShType::Trait,
            TypeInfo::Type(_) => ShType::Type,
        }
    }

    /// `[T]` - sequence of one element type.
    pub fn seq_of(inner: TypeInfo) -> TypeInfo {
        TypeInfo::Seq { types: vec![inner], fixed_size: 0 }
    }

    /// `[Any]` - open sequence.
    pub fn any_seq() -> TypeInfo {
        TypeInfo::Seq { types: vec![TypeInfo::Any], fixed_size: 0 }
    }
}

impl std::fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeInfo::Enum { vendor_id, type_id } => write!(f, "Enum({}/{})", vendor_id, type_id),
            TypeInfo::Object { vendor_id, type_id } => {
                write!(f, "Object({}/{})", vendor_id, type_id)
            }
            TypeInfo::ContextVar(types) => {
                write!(f, "ContextVar(")?;
                for (i, t) in types.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, ")")
            }
            TypeInfo::Seq { types, fixed_size } => {
                write!(f, "[")?;
                for (i, t) in types.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", t)?;
                }
                if *fixed_size != 0 {
                    write!(f, "; {}", fixed_size)?;
                }
                write!(f, "]")
            }
            TypeInfo::Table { keys, types } => {
                write!(f, "{{")?;
                for (i, t) in types.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    match keys.get(i) {
                        Some(k) if !k.is_none() => write!(f, "{}: {}", k, t)?,
                        _ => write!(f, "_: {}", t)?,
                    }
                }
                write!(f, "}}")
            }
            TypeInfo::Set(types) => {
                write!(f, "Set(")?;
                for (i, t) in types.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, ")")
            }
            TypeInfo::Array { inner } => write!(f, "Array({})", inner),
            TypeInfo::Type(inner) => write!(f, "Type({})", inner),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Metadata about a variable a shard exposes to, or requires from, the
/// surrounding scope.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExposedTypeInfo {
    pub name: String,
    pub help: String,
    pub exposed_type: TypeInfo,
    pub is_mutable: bool,
    pub is_protected: bool,
    pub global: bool,
    /// Observed by variable-change triggers.
    pub exposed: bool,
}

impl ExposedTypeInfo {
    pub fn new(name: impl Into<String>, exposed_type: TypeInfo) -> Self {
        Self { name: name.into(), exposed_type, ..Default::default() }
    }

    pub fn mutable(name: impl Into<String>, exposed_type: TypeInfo) -> Self {
        Self { name: name.into(), exposed_type, is_mutable: true, ..Default::default() }
    }
}

/// Structural type matching with explicit relaxation flags.
///
/// `Any` is the universal supertype on the receiver side. In `strict`
/// mode element types and table keys must line up; the `relax_*` flags
/// soften the rules for empty literals written by users, and
/// `ignore_fixed_seq` skips fixed-size sequence checks.
#[derive(Debug, Clone, Copy)]
pub struct TypeMatcher {
    pub is_parameter: bool,
    pub strict: bool,
    pub relax_empty_table_check: bool,
    pub relax_empty_seq_check: bool,
    pub check_var_types: bool,
    pub ignore_fixed_seq: bool,
}

impl Default for TypeMatcher {
    fn default() -> Self {
        Self {
            is_parameter: true,
            strict: true,
            relax_empty_table_check: true,
            relax_empty_seq_check: false,
            check_var_types: false,
            ignore_fixed_seq: false,
        }
    }
}

impl TypeMatcher {
    pub fn matches(&self, input: &TypeInfo, receiver: &TypeInfo) -> bool {
        if receiver.basic_type() == ShType::Any {
            return true;
        }

        if input.basic_type() != receiver.basic_type() {
            return false;
        }

        match (input, receiver) {
            (
                TypeInfo::Object { vendor_id: iv, type_id: it },
                TypeInfo::Object { vendor_id: rv, type_id: rt },
            ) => iv == rv && it == rt,
            (
                TypeInfo::Enum { vendor_id: iv, type_id: it },
                TypeInfo::Enum { vendor_id: rv, type_id: rt },
            ) => {
                // (0, 0) on the receiver side accepts any enum.
                (*rv == 0 && *rt == 0) || (iv == rv && it == rt)
            }
            (
                TypeInfo::Seq { types: in_types, fixed_size: in_fixed },
                TypeInfo::Seq { types: recv_types, fixed_size: recv_fixed },
            ) => {
                if !self.strict {
                    return true;
                }
                if in_types.is_empty() && recv_types.is_empty() {
                    return true;
                } else if !in_types.is_empty() && !recv_types.is_empty() {
                    for it in in_types {
                        let matched = recv_types.iter().any(|rt| {
                            rt.basic_type() == ShType::Any || self.matches(it, rt)
                        });
                        if !matched {
                            return false;
                        }
                    }
                } else if in_types.is_empty() && !recv_types.is_empty() {
                    // An empty input element list means [Any]: the receiver
                    // must explicitly contain Any, unless the input is a
                    // user literal such as `[]`.
                    if !self.relax_empty_seq_check {
                        return recv_types.iter().any(|t| t.basic_type() == ShType::Any);
                    }
                } else {
                    // input non-empty, receiver empty
                    return false;
                }
                if !self.ignore_fixed_seq && *recv_fixed != 0 && *recv_fixed > *in_fixed {
                    return false;
                }
                true
            }
            (
                TypeInfo::Table { keys: in_keys, types: in_types },
                TypeInfo::Table { keys: recv_keys, types: recv_types },
            ) => {
                if !self.strict {
                    return true;
                }
                self.match_tables(in_keys, in_types, recv_keys, recv_types)
            }
            (TypeInfo::ContextVar(in_types), TypeInfo::ContextVar(recv_types)) => {
                if !self.check_var_types {
                    return true;
                }
                for rt in recv_types {
                    if in_types.iter().all(|it| self.matches(it, rt)) {
                        return true;
                    }
                }
                false
            }
            _ => true,
        }
    }

    // A receiver table with only value types is flexible: keys are open,
    // those types (or anything, if no types) are accepted. A receiver
    // with key info wants a 1:1 match, except that a trailing None key
    // accepts arbitrary extra keys of the trailing type.
    fn match_tables(
        &self,
        in_keys: &[Var],
        in_types: &[TypeInfo],
        recv_keys: &[Var],
        recv_types: &[TypeInfo],
    ) -> bool {
        if recv_keys.is_empty() && in_keys.is_empty() && self.relax_empty_table_check {
            return true;
        }

        if recv_keys.is_empty() {
            if in_types.is_empty() {
                if recv_types.is_empty() {
                    return true; // both Any
                }
                return recv_types.iter().any(|rt| self.matches(&TypeInfo::Any, rt));
            }
            if self.is_parameter || !recv_types.is_empty() {
                for it in in_types {
                    if !recv_types.iter().any(|rt| self.matches(it, rt)) {
                        return false;
                    }
                }
            }
            return true;
        }

        // update case: {} into an already-typed receiver
        if !self.is_parameter && in_keys.is_empty() && in_types.is_empty() {
            return true;
        }

        let last_element_empty = recv_keys.last().map(Var::is_none).unwrap_or(false);
        if !last_element_empty
            && (in_keys.len() != recv_keys.len() || in_keys.len() != in_types.len())
        {
            return false;
        }

        let mut missing = in_keys.len();
        for (i, in_key) in in_keys.iter().enumerate() {
            let in_type = match in_types.get(i) {
                Some(t) => t,
                None => return false,
            };
            for (y, recv_key) in recv_keys.iter().enumerate() {
                if in_key == recv_key || (last_element_empty && y == recv_keys.len() - 1) {
                    if self.matches(in_type, &recv_types[y]) {
                        missing -= 1;
                        break;
                    } else {
                        return false;
                    }
                }
            }
        }

        missing == 0
    }
}

/// Convenience wrapper used by the composition pass.
pub fn match_types(
    input: &TypeInfo,
    receiver: &TypeInfo,
    is_parameter: bool,
    strict: bool,
    relax_empty_seq_check: bool,
) -> bool {
    TypeMatcher { is_parameter, strict, relax_empty_seq_check, ..Default::default() }
        .matches(input, receiver)
}

/// Resolver used when deriving types for `ContextVar` values: given a
/// variable name, report its type if the surrounding scope knows it.
pub type VarTypeResolver<'a> = &'a dyn Fn(&str) -> Option<TypeInfo>;

/// Derive a concrete `TypeInfo` from a value.
///
/// `ContextVar` values resolve against `scope` when one is provided;
/// failing to resolve is a compose error because the reference would be
/// dangling at runtime.
pub fn derive_type(var: &Var, scope: Option<VarTypeResolver<'_>>) -> Result<TypeInfo, ComposeError> {
    Ok(match var {
        Var::None => TypeInfo::None,
        Var::Bool(_) => TypeInfo::Bool,
        Var::Int(_) => TypeInfo::Int,
        Var::Int2(_) => TypeInfo::Int2,
        Var::Int3(_) => TypeInfo::Int3,
        Var::Int4(_) => TypeInfo::Int4,
        Var::Int8(_) => TypeInfo::Int8,
        Var::Int16(_) => TypeInfo::Int16,
        Var::Float(_) => TypeInfo::Float,
        Var::Float2(_) => TypeInfo::Float2,
        Var::Float3(_) => TypeInfo::Float3,
        Var::Float4(_) => TypeInfo::Float4,
        Var::Color(_) => TypeInfo::Color,
        Var::Enum(e) => TypeInfo::Enum { vendor_id: e.vendor_id, type_id: e.type_id },
        Var::String(_) => TypeInfo::String,
        Var::Path(_) => TypeInfo::Path,
        Var::ContextVar(name) => match scope {
            Some(resolve) => match resolve(name) {
                Some(t) => TypeInfo::ContextVar(vec![t]),
                None => {
                    return Err(ComposeError::new(format!(
                        "could not derive type of unresolved variable reference: {}",
                        name
                    )))
                }
            },
            None => TypeInfo::ContextVar(Vec::new()),
        },
        Var::Bytes(_) => TypeInfo::Bytes,
        Var::Image(_) => TypeInfo::Image,
        Var::Audio(_) => TypeInfo::Audio,
        Var::Seq(items) => {
            let mut types: Vec<TypeInfo> = Vec::new();
            for item in items {
                let t = derive_type(item, scope)?;
                if !types.contains(&t) {
                    types.push(t);
                }
            }
            TypeInfo::Seq { types, fixed_size: items.len() as u32 }
        }
        Var::Table(table) => {
            let mut keys = Vec::with_capacity(table.len());
            let mut types = Vec::with_capacity(table.len());
            for (k, v) in table.0.iter() {
                keys.push(k.clone());
                types.push(derive_type(v, scope)?);
            }
            TypeInfo::Table { keys, types }
        }
        Var::Set(set) => {
            let mut types: Vec<TypeInfo> = Vec::new();
            for item in set.0.iter() {
                let t = derive_type(item, scope)?;
                if !types.contains(&t) {
                    types.push(t);
                }
            }
            TypeInfo::Set(types)
        }
        Var::Wire(_) => TypeInfo::Wire,
        Var::ShardRef(_) => TypeInfo::ShardRef,
        Var::Object(o) => TypeInfo::Object { vendor_id: o.vendor_id, type_id: o.type_id },
        Var::Array(a) => TypeInfo::Array { inner: a.inner },
        Var::Trait(_) => TypeInfo::Trait,
        Var::Type(t) => TypeInfo::Type(t.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_receiver_matches_everything() {
        let m = TypeMatcher::default();
        assert!(m.matches(&TypeInfo::Int, &TypeInfo::Any));
        assert!(m.matches(&TypeInfo::any_seq(), &TypeInfo::Any));
        assert!(m.matches(&TypeInfo::None, &TypeInfo::Any));
    }

    #[test]
    fn test_basic_type_mismatch() {
        let m = TypeMatcher::default();
        assert!(!m.matches(&TypeInfo::Int, &TypeInfo::Float));
        assert!(!m.matches(&TypeInfo::String, &TypeInfo::Bytes));
    }

    #[test]
    fn test_enum_any_receiver() {
        let m = TypeMatcher::default();
        let input = TypeInfo::Enum { vendor_id: 10, type_id: 20 };
        assert!(m.matches(&input, &TypeInfo::Enum { vendor_id: 0, type_id: 0 }));
        assert!(m.matches(&input, &TypeInfo::Enum { vendor_id: 10, type_id: 20 }));
        assert!(!m.matches(&input, &TypeInfo::Enum { vendor_id: 10, type_id: 21 }));
    }

    #[test]
    fn test_seq_element_matching() {
        let m = TypeMatcher::default();
        let ints = TypeInfo::seq_of(TypeInfo::Int);
        let nums = TypeInfo::Seq { types: vec![TypeInfo::Int, TypeInfo::Float], fixed_size: 0 };
        assert!(m.matches(&ints, &nums));
        assert!(!m.matches(&nums, &ints));
        assert!(m.matches(&ints, &TypeInfo::any_seq()));
    }

    #[test]
    fn test_empty_seq_needs_any_receiver() {
        let m = TypeMatcher::default();
        let empty = TypeInfo::Seq { types: vec![], fixed_size: 0 };
        assert!(!m.matches(&empty, &TypeInfo::seq_of(TypeInfo::Int)));
        assert!(m.matches(&empty, &TypeInfo::any_seq()));

        let relaxed = TypeMatcher { relax_empty_seq_check: true, ..Default::default() };
        assert!(relaxed.matches(&empty, &TypeInfo::seq_of(TypeInfo::Int)));
    }

    #[test]
    fn test_fixed_size_seq() {
        let m = TypeMatcher::default();
        let recv = TypeInfo::Seq { types: vec![TypeInfo::Int], fixed_size: 4 };
        let small = TypeInfo::Seq { types: vec![TypeInfo::Int], fixed_size: 2 };
        let big = TypeInfo::Seq { types: vec![TypeInfo::Int], fixed_size: 8 };
        assert!(!m.matches(&small, &recv));
        assert!(m.matches(&big, &recv));

        let ignoring = TypeMatcher { ignore_fixed_seq: true, ..Default::default() };
        assert!(ignoring.matches(&small, &recv));
    }

    #[test]
    fn test_table_flexible_receiver() {
        let m = TypeMatcher::default();
        let input = TypeInfo::Table {
            keys: vec![Var::from("x")],
            types: vec![TypeInfo::Int],
        };
        let recv = TypeInfo::Table { keys: vec![], types: vec![TypeInfo::Int] };
        assert!(m.matches(&input, &recv));

        let recv_float = TypeInfo::Table { keys: vec![], types: vec![TypeInfo::Float] };
        assert!(!m.matches(&input, &recv_float));
    }

    #[test]
    fn test_table_strict_keys() {
        let m = TypeMatcher::default();
        let input = TypeInfo::Table {
            keys: vec![Var::from("x"), Var::from("y")],
            types: vec![TypeInfo::Int, TypeInfo::Float],
        };
        let recv = input.clone();
        assert!(m.matches(&input, &recv));

        let wrong = TypeInfo::Table {
            keys: vec![Var::from("x")],
            types: vec![TypeInfo::Int],
        };
        assert!(!m.matches(&input, &wrong));
    }

    #[test]
    fn test_table_trailing_none_key_open() {
        let m = TypeMatcher::default();
        let recv = TypeInfo::Table {
            keys: vec![Var::from("x"), Var::None],
            types: vec![TypeInfo::Int, TypeInfo::String],
        };
        let input = TypeInfo::Table {
            keys: vec![Var::from("x"), Var::from("extra")],
            types: vec![TypeInfo::Int, TypeInfo::String],
        };
        assert!(m.matches(&input, &recv));

        let bad = TypeInfo::Table {
            keys: vec![Var::from("x"), Var::from("extra")],
            types: vec![TypeInfo::Int, TypeInfo::Float],
        };
        assert!(!m.matches(&bad, &recv));
    }

    #[test]
    fn test_context_var_types() {
        let relaxed = TypeMatcher::default();
        let a = TypeInfo::ContextVar(vec![TypeInfo::Int]);
        let b = TypeInfo::ContextVar(vec![TypeInfo::Float]);
        // without check_var_types inner types are ignored
        assert!(relaxed.matches(&a, &b));

        let checking = TypeMatcher { check_var_types: true, ..Default::default() };
        assert!(!checking.matches(&a, &b));
        assert!(checking.matches(&a, &TypeInfo::ContextVar(vec![TypeInfo::Int])));
    }

    #[test]
    fn test_derive_scalars() {
        assert_eq!(derive_type(&Var::Int(3), None).unwrap(), TypeInfo::Int);
        assert_eq!(derive_type(&Var::from("s"), None).unwrap(), TypeInfo::String);
        assert_eq!(derive_type(&Var::Bool(true), None).unwrap(), TypeInfo::Bool);
    }

    #[test]
    fn test_derive_seq_dedups_and_fixes_size() {
        let v = Var::Seq(vec![Var::Int(1), Var::Int(2), Var::from("s")]);
        match derive_type(&v, None).unwrap() {
            TypeInfo::Seq { types, fixed_size } => {
                assert_eq!(types, vec![TypeInfo::Int, TypeInfo::String]);
                assert_eq!(fixed_size, 3);
            }
            other => panic!("expected seq type, got {}", other),
        }
    }

    #[test]
    fn test_derive_context_var_resolution() {
        let v = Var::ContextVar("speed".into());
        let resolver = |name: &str| (name == "speed").then(|| TypeInfo::Float);
        assert_eq!(
            derive_type(&v, Some(&resolver)).unwrap(),
            TypeInfo::ContextVar(vec![TypeInfo::Float])
        );

        let missing = Var::ContextVar("missing".into());
        assert!(derive_type(&missing, Some(&resolver)).is_err());
    }
}
