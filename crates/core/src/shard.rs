//! The shard contract - the vtable every operator implements
//!
//! A shard is a typed operator with a warmup/activate/cleanup lifecycle.
//! The engine talks to shards exclusively through this trait plus the
//! `ShardInstance` wrapper, which owns the instance, its source anchor
//! (line/column) and the inline fast-path tag.
//!
//! The inline tag is resolved from the shard's name exactly once, when
//! the instance is created. Well-known primitives (`Pass`, `Const`)
//! bypass the dynamic call entirely on the hot path.

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use crate::compose::InstanceData;
use crate::context::Context;
use crate::error::{ActivationError, ComposeError, ShardError};
use crate::error::format_panic_payload;
use crate::types::{ExposedTypeInfo, TypeInfo};
use crate::value::Var;

/// Stable 32-bit hash of a shard name. Serialized snapshots carry it and
/// refuse to load when it no longer matches the registered shard.
pub fn shard_name_hash(name: &str) -> u32 {
    xxhash_rust::xxh32::xxh32(name.as_bytes(), 0x5348_5244)
}

/// Introspection record for a single parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterInfo {
    pub name: &'static str,
    pub help: &'static str,
    pub types: Vec<TypeInfo>,
}

impl ParameterInfo {
    pub fn new(name: &'static str, help: &'static str, types: Vec<TypeInfo>) -> Self {
        Self { name, help, types }
    }
}

/// A single operator.
///
/// `compose` is optional: return `Ok(None)` to let the engine adopt the
/// single declared output type. Shards declaring multiple output types
/// (or a non-passthrough `Any`) must implement it.
pub trait Shard: 'static {
    fn name(&self) -> &'static str;

    fn help(&self) -> &'static str {
        ""
    }

    /// Stable content hash; defaults to a hash of the name.
    fn hash(&self) -> u32 {
        shard_name_hash(self.name())
    }

    fn input_types(&self) -> Vec<TypeInfo>;

    fn output_types(&self) -> Vec<TypeInfo>;

    fn parameters(&self) -> Vec<ParameterInfo> {
        Vec::new()
    }

    fn set_param(&mut self, index: usize, _value: &Var) -> Result<(), ShardError> {
        Err(ShardError::InvalidParameterIndex(index))
    }

    fn get_param(&self, index: usize) -> Result<Var, ShardError> {
        Err(ShardError::InvalidParameterIndex(index))
    }

    /// Variables this shard writes into the surrounding scope. Valid
    /// after `compose`.
    fn exposed_variables(&self) -> Vec<ExposedTypeInfo> {
        Vec::new()
    }

    /// Variables this shard expects to find in the surrounding scope.
    fn required_variables(&self) -> Vec<ExposedTypeInfo> {
        Vec::new()
    }

    /// Specialize the output type for the given instance data.
    fn compose(&mut self, _data: &InstanceData) -> Result<Option<TypeInfo>, ComposeError> {
        Ok(None)
    }

    fn warmup(&mut self, _context: &Context) -> Result<(), ActivationError> {
        Ok(())
    }

    /// Hot path. May suspend through the context, fail, or signal flow
    /// changes (`restart_flow`, `return_flow`, ...) before returning.
    fn activate(&mut self, context: &Context, input: &Var) -> Result<Var, ActivationError>;

    /// Symmetric to `warmup`. `context` is absent when the wire tears
    /// down without ever having run.
    fn cleanup(&mut self, _context: Option<&Context>) -> Result<(), ActivationError> {
        Ok(())
    }

    /// Optional serializable state beyond parameters.
    fn get_state(&self) -> Var {
        Var::None
    }

    fn set_state(&mut self, _state: &Var) {}
}

/// Fast-path tag for well-known primitives, resolved by name exactly
/// once when the instance is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineShardId {
    NotInline,
    CorePass,
    CoreConst,
}

impl InlineShardId {
    fn from_name(name: &str) -> Self {
        match name {
            "Pass" => InlineShardId::CorePass,
            "Const" => InlineShardId::CoreConst,
            _ => InlineShardId::NotInline,
        }
    }
}

/// Owning handle to a shard plus its engine-side bookkeeping.
///
/// Cloning is cheap (shared handle); a wire and a `ShardRef` variant can
/// point at the same instance.
#[derive(Clone)]
pub struct ShardInstance {
    inner: Rc<RefCell<dyn Shard>>,
    inline: InlineShardId,
    /// Source anchor carried through serialization and error logs.
    line: Cell<u32>,
    column: Cell<u32>,
    /// Value cache for the `Const` fast path, filled at warmup.
    const_cache: Rc<RefCell<Option<Var>>>,
}

impl ShardInstance {
    pub fn new(shard: impl Shard) -> Self {
        let inline = InlineShardId::from_name(shard.name());
        Self {
            inner: Rc::new(RefCell::new(shard)),
            inline,
            line: Cell::new(0),
            column: Cell::new(0),
            const_cache: Rc::new(RefCell::new(None)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.borrow().name()
    }

    pub fn help(&self) -> &'static str {
        self.inner.borrow().help()
    }

    pub fn shard_hash(&self) -> u32 {
        self.inner.borrow().hash()
    }

    pub fn inline_id(&self) -> InlineShardId {
        self.inline
    }

    pub fn line(&self) -> u32 {
        self.line.get()
    }

    pub fn column(&self) -> u32 {
        self.column.get()
    }

    pub fn set_source_anchor(&self, line: u32, column: u32) {
        self.line.set(line);
        self.column.set(column);
    }

    /// Identity address, used for ordering and identity comparisons.
    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const () as usize
    }

    pub fn input_types(&self) -> Vec<TypeInfo> {
        self.inner.borrow().input_types()
    }

    pub fn output_types(&self) -> Vec<TypeInfo> {
        self.inner.borrow().output_types()
    }

    pub fn parameters(&self) -> Vec<ParameterInfo> {
        self.inner.borrow().parameters()
    }

    pub fn get_param(&self, index: usize) -> Result<Var, ShardError> {
        self.inner.borrow().get_param(index)
    }

    pub fn set_param(&self, index: usize, value: &Var) -> Result<(), ShardError> {
        self.inner.borrow_mut().set_param(index, value)
    }

    pub fn exposed_variables(&self) -> Vec<ExposedTypeInfo> {
        self.inner.borrow().exposed_variables()
    }

    pub fn required_variables(&self) -> Vec<ExposedTypeInfo> {
        self.inner.borrow().required_variables()
    }

    pub fn compose(&self, data: &InstanceData) -> Result<Option<TypeInfo>, ComposeError> {
        self.inner.borrow_mut().compose(data)
    }

    pub fn warmup(&self, context: &Context) -> Result<(), ActivationError> {
        self.inner.borrow_mut().warmup(context)?;
        if self.inline == InlineShardId::CoreConst {
            if let Ok(value) = self.get_param(0) {
                *self.const_cache.borrow_mut() = Some(value);
            }
        }
        Ok(())
    }

    /// Activate with inline dispatch. Panics inside shard code are
    /// converted to activation errors so they never unwind through the
    /// fiber; generator control-flow unwinds are re-raised untouched.
    pub fn activate(&self, context: &Context, input: &Var) -> Result<Var, ActivationError> {
        match self.inline {
            InlineShardId::CorePass => return Ok(input.clone()),
            InlineShardId::CoreConst => {
                if let Some(value) = self.const_cache.borrow().as_ref() {
                    return Ok(value.clone());
                }
            }
            InlineShardId::NotInline => {}
        }

        let result = catch_unwind(AssertUnwindSafe(|| {
            self.inner.borrow_mut().activate(context, input)
        }));
        match result {
            Ok(out) => out,
            Err(payload) => {
                if payload.downcast_ref::<generator::Error>().is_some() {
                    // coroutine teardown, not a shard failure
                    std::panic::resume_unwind(payload);
                }
                Err(ActivationError::new(format_panic_payload(&payload)))
            }
        }
    }

    pub fn cleanup(&self, context: Option<&Context>) -> Result<(), ActivationError> {
        if self.inline == InlineShardId::CoreConst {
            *self.const_cache.borrow_mut() = None;
        }
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.inner.borrow_mut().cleanup(context)
        }));
        match result {
            Ok(out) => out,
            Err(payload) => {
                if payload.downcast_ref::<generator::Error>().is_some() {
                    std::panic::resume_unwind(payload);
                }
                Err(ActivationError::new(format_panic_payload(&payload)))
            }
        }
    }

    pub fn get_state(&self) -> Var {
        self.inner.borrow().get_state()
    }

    pub fn set_state(&self, state: &Var) {
        self.inner.borrow_mut().set_state(state)
    }
}

impl std::fmt::Debug for ShardInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardInstance")
            .field("name", &self.name())
            .field("inline", &self.inline)
            .field("line", &self.line.get())
            .field("column", &self.column.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Shard for Echo {
        fn name(&self) -> &'static str {
            "Echo"
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

    struct Panicky;

    impl Shard for Panicky {
        fn name(&self) -> &'static str {
            "Panicky"
        }

        fn input_types(&self) -> Vec<TypeInfo> {
            vec![TypeInfo::Any]
        }

        fn output_types(&self) -> Vec<TypeInfo> {
            vec![TypeInfo::Any]
        }

        fn activate(&mut self, _context: &Context, _input: &Var) -> Result<Var, ActivationError> {
            panic!("kaboom");
        }
    }

    #[test]
    fn test_shard_name_hash_is_stable() {
        assert_eq!(shard_name_hash("Const"), shard_name_hash("Const"));
        assert_ne!(shard_name_hash("Const"), shard_name_hash("Pass"));
    }

    #[test]
    fn test_inline_resolution_happens_once_by_name() {
        let echo = ShardInstance::new(Echo);
        assert_eq!(echo.inline_id(), InlineShardId::NotInline);
    }

    #[test]
    fn test_activate_echo() {
        let echo = ShardInstance::new(Echo);
        let ctx = Context::detached();
        let out = echo.activate(&ctx, &Var::Int(7)).unwrap();
        assert_eq!(out, Var::Int(7));
    }

    #[test]
    fn test_panic_becomes_activation_error() {
        let shard = ShardInstance::new(Panicky);
        let ctx = Context::detached();
        let err = shard.activate(&ctx, &Var::None).unwrap_err();
        assert_eq!(err.message, "kaboom");
    }

    #[test]
    fn test_default_params_reject_indices() {
        let echo = ShardInstance::new(Echo);
        assert!(matches!(
            echo.get_param(0),
            Err(ShardError::InvalidParameterIndex(0))
        ));
        assert!(matches!(
            echo.set_param(3, &Var::None),
            Err(ShardError::InvalidParameterIndex(3))
        ));
    }

    #[test]
    fn test_source_anchor() {
        let echo = ShardInstance::new(Echo);
        echo.set_source_anchor(12, 4);
        assert_eq!(echo.line(), 12);
        assert_eq!(echo.column(), 4);
    }
}
