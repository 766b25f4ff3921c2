//! Core shards: constants, logging, flow control and runtime type checks
//!
//! These are the primitives the engine's own semantics reference by
//! name: `Const`/`Pass` take the inline fast path, `Input`/`And`/`Or`
//! are special-cased by composition, the flow stoppers map directly to
//! context flow states and the `Expect*` family turns a wire's declared
//! input into a runtime check.

use shards_core::compose::InstanceData;
use shards_core::context::Context;
use shards_core::error::{ActivationError, ComposeError, ShardError};
use shards_core::shard::{ParameterInfo, Shard};
use shards_core::types::{derive_type, TypeInfo, TypeMatcher};
use shards_core::value::Var;

/// Emits a constant value, ignoring input.
#[derive(Default)]
pub struct Const {
    value: Var,
}

impl Const {
    pub fn with_value(value: Var) -> Self {
        Self { value }
    }
}

impl Shard for Const {
    fn name(&self) -> &'static str {
        "Const"
    }

    fn help(&self) -> &'static str {
        "Declares an un-named constant value"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::None]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new("Value", "The constant value to insert in the wire", vec![TypeInfo::Any])]
    }

    fn set_param(&mut self, index: usize, value: &Var) -> Result<(), ShardError> {
        match index {
            0 => {
                self.value = value.clone();
                Ok(())
            }
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn get_param(&self, index: usize) -> Result<Var, ShardError> {
        match index {
            0 => Ok(self.value.clone()),
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn compose(&mut self, _data: &InstanceData) -> Result<Option<TypeInfo>, ComposeError> {
        Ok(Some(derive_type(&self.value, None)?))
    }

    fn activate(&mut self, _context: &Context, _input: &Var) -> Result<Var, ActivationError> {
        Ok(self.value.clone())
    }
}

/// Forwards its input unchanged.
#[derive(Default)]
pub struct Pass;

impl Shard for Pass {
    fn name(&self) -> &'static str {
        "Pass"
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

/// Logs the current value, passing it through.
#[derive(Default)]
pub struct Log {
    label: String,
}

impl Shard for Log {
    fn name(&self) -> &'static str {
        "Log"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new("Label", "Prefix to log before the value", vec![TypeInfo::String, TypeInfo::None])]
    }

    fn set_param(&mut self, index: usize, value: &Var) -> Result<(), ShardError> {
        match index {
            0 => {
                self.label = value.as_str().unwrap_or("").to_string();
                Ok(())
            }
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn get_param(&self, index: usize) -> Result<Var, ShardError> {
        match index {
            0 => Ok(if self.label.is_empty() { Var::None } else { Var::from(self.label.as_str()) }),
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn activate(&mut self, context: &Context, input: &Var) -> Result<Var, ActivationError> {
        let wire = context.current_wire().map(|w| w.name().to_string());
        if self.label.is_empty() {
            tracing::info!(wire = wire.as_deref().unwrap_or(""), "{}", input);
        } else {
            tracing::info!(wire = wire.as_deref().unwrap_or(""), "{}: {}", self.label, input);
        }
        Ok(input.clone())
    }
}

/// Replaces the current value with the wire's input.
#[derive(Default)]
pub struct Input;

impl Shard for Input {
    fn name(&self) -> &'static str {
        "Input"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn activate(&mut self, context: &Context, _input: &Var) -> Result<Var, ActivationError> {
        let wire = context
            .current_wire()
            .ok_or_else(|| ActivationError::new("Input used outside of a running wire"))?;
        Ok(wire.current_input())
    }
}

/// Short-circuit conjunction: a falsy input returns it to the caller,
/// otherwise the next shard restarts from the wire input.
#[derive(Default)]
pub struct And;

impl Shard for And {
    fn name(&self) -> &'static str {
        "And"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Bool]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn activate(&mut self, context: &Context, input: &Var) -> Result<Var, ActivationError> {
        if input.is_truthy() {
            context.rebase_flow();
        } else {
            context.return_flow(input.clone());
        }
        Ok(input.clone())
    }
}

/// Short-circuit disjunction: a truthy input returns it to the caller.
#[derive(Default)]
pub struct Or;

impl Shard for Or {
    fn name(&self) -> &'static str {
        "Or"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Bool]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn activate(&mut self, context: &Context, input: &Var) -> Result<Var, ActivationError> {
        if input.is_truthy() {
            context.return_flow(input.clone());
        } else {
            context.rebase_flow();
        }
        Ok(input.clone())
    }
}

/// Restarts the wire from its first shard, with the current value as the
/// new wire input.
#[derive(Default)]
pub struct Restart;

impl Shard for Restart {
    fn name(&self) -> &'static str {
        "Restart"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn activate(&mut self, context: &Context, input: &Var) -> Result<Var, ActivationError> {
        context.restart_flow(input.clone());
        Ok(input.clone())
    }
}

/// Ends the current iteration, returning the current value.
#[derive(Default)]
pub struct Return;

impl Shard for Return {
    fn name(&self) -> &'static str {
        "Return"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn activate(&mut self, context: &Context, input: &Var) -> Result<Var, ActivationError> {
        context.return_flow(input.clone());
        Ok(input.clone())
    }
}

/// Fails the wire with a message.
#[derive(Default)]
pub struct Fail {
    message: String,
}

impl Shard for Fail {
    fn name(&self) -> &'static str {
        "Fail"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new("Message", "The failure message", vec![TypeInfo::String, TypeInfo::None])]
    }

    fn set_param(&mut self, index: usize, value: &Var) -> Result<(), ShardError> {
        match index {
            0 => {
                self.message = value.as_str().unwrap_or("").to_string();
                Ok(())
            }
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn get_param(&self, index: usize) -> Result<Var, ShardError> {
        match index {
            0 => Ok(if self.message.is_empty() { Var::None } else { Var::from(self.message.as_str()) }),
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn activate(&mut self, _context: &Context, input: &Var) -> Result<Var, ActivationError> {
        let message = if !self.message.is_empty() {
            self.message.clone()
        } else if let Some(s) = input.as_str() {
            s.to_string()
        } else {
            "failed".to_string()
        };
        Err(ActivationError::new(message))
    }
}

/// Stops the wire. With no value parameter the current value becomes the
/// wire's final output and the shard acts as a flow stopper.
#[derive(Default)]
pub struct Stop {
    value: Var,
}

impl Shard for Stop {
    fn name(&self) -> &'static str {
        "Stop"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new("Value", "The value to stop the wire with", vec![TypeInfo::Any])]
    }

    fn set_param(&mut self, index: usize, value: &Var) -> Result<(), ShardError> {
        match index {
            0 => {
                self.value = value.clone();
                Ok(())
            }
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn get_param(&self, index: usize) -> Result<Var, ShardError> {
        match index {
            0 => Ok(self.value.clone()),
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn activate(&mut self, context: &Context, input: &Var) -> Result<Var, ActivationError> {
        let output = if self.value.is_none() { input.clone() } else { self.value.clone() };
        context.stop_flow(output.clone());
        Ok(output)
    }
}

/// Runtime type gate with a parameterized expectation. As the first
/// shard of a wire it widens the wire's declared input to Any - the
/// check happens here instead.
pub struct ExpectType {
    shard_name: &'static str,
    expected: TypeInfo,
}

impl ExpectType {
    pub fn new(shard_name: &'static str, expected: TypeInfo) -> Self {
        Self { shard_name, expected }
    }

    /// The parameterized `Expect` shard, defaulting to Any.
    pub fn open() -> Self {
        Self { shard_name: "Expect", expected: TypeInfo::Any }
    }
}

impl Shard for ExpectType {
    fn name(&self) -> &'static str {
        self.shard_name
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        if self.shard_name == "Expect" {
            vec![ParameterInfo::new("Type", "The type to expect at runtime", vec![TypeInfo::Type(Box::new(TypeInfo::Any))])]
        } else {
            Vec::new()
        }
    }

    fn set_param(&mut self, index: usize, value: &Var) -> Result<(), ShardError> {
        match (self.shard_name, index) {
            ("Expect", 0) => match value {
                Var::Type(t) => {
                    self.expected = (**t).clone();
                    Ok(())
                }
                other => Err(ShardError::InvalidParameterValue {
                    index,
                    reason: format!("expected a type value, got {}", other),
                }),
            },
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn get_param(&self, index: usize) -> Result<Var, ShardError> {
        match (self.shard_name, index) {
            ("Expect", 0) => Ok(Var::Type(Box::new(self.expected.clone()))),
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn compose(&mut self, _data: &InstanceData) -> Result<Option<TypeInfo>, ComposeError> {
        Ok(Some(self.expected.clone()))
    }

    fn activate(&mut self, _context: &Context, input: &Var) -> Result<Var, ActivationError> {
        let actual = derive_type(input, None).map_err(ActivationError::from)?;
        let matcher = TypeMatcher { relax_empty_seq_check: true, ignore_fixed_seq: true, ..Default::default() };
        if !matcher.matches(&actual, &self.expected) {
            return Err(ActivationError::new(format!(
                "unexpected value type, expected {} got {}",
                self.expected, actual
            )));
        }
        Ok(input.clone())
    }
}

pub fn expect_int() -> ExpectType {
    ExpectType::new("ExpectInt", TypeInfo::Int)
}

pub fn expect_float() -> ExpectType {
    ExpectType::new("ExpectFloat", TypeInfo::Float)
}

pub fn expect_bool() -> ExpectType {
    ExpectType::new("ExpectBool", TypeInfo::Bool)
}

pub fn expect_string() -> ExpectType {
    ExpectType::new("ExpectString", TypeInfo::String)
}

pub fn expect_seq() -> ExpectType {
    ExpectType::new("ExpectSeq", TypeInfo::any_seq())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shards_core::context::WireState;

    #[test]
    fn test_const_composes_to_value_type() {
        let mut shard = Const::with_value(Var::Int(42));
        let out = shard.compose(&InstanceData::default()).unwrap();
        assert_eq!(out, Some(TypeInfo::Int));
        let ctx = Context::detached();
        assert_eq!(shard.activate(&ctx, &Var::None).unwrap(), Var::Int(42));
    }

    #[test]
    fn test_pass_forwards() {
        let mut shard = Pass;
        let ctx = Context::detached();
        assert_eq!(shard.activate(&ctx, &Var::from("x")).unwrap(), Var::from("x"));
    }

    #[test]
    fn test_and_or_flow() {
        let ctx = Context::detached();
        let mut and = And;
        and.activate(&ctx, &Var::Bool(false)).unwrap();
        assert_eq!(ctx.state(), WireState::Return);

        ctx.continue_flow();
        and.activate(&ctx, &Var::Bool(true)).unwrap();
        assert_eq!(ctx.state(), WireState::Rebase);

        ctx.continue_flow();
        let mut or = Or;
        or.activate(&ctx, &Var::Bool(true)).unwrap();
        assert_eq!(ctx.state(), WireState::Return);

        ctx.continue_flow();
        or.activate(&ctx, &Var::Bool(false)).unwrap();
        assert_eq!(ctx.state(), WireState::Rebase);
    }

    #[test]
    fn test_stop_prefers_parameter_value() {
        let ctx = Context::detached();
        let mut stop = Stop::default();
        stop.set_param(0, &Var::Int(9)).unwrap();
        let out = stop.activate(&ctx, &Var::Int(1)).unwrap();
        assert_eq!(out, Var::Int(9));
        assert_eq!(ctx.state(), WireState::Stop);
        assert_eq!(ctx.flow_storage(), Var::Int(9));
    }

    #[test]
    fn test_fail_uses_message_or_input() {
        let ctx = Context::detached();
        let mut fail = Fail::default();
        let err = fail.activate(&ctx, &Var::from("broken input")).unwrap_err();
        assert_eq!(err.message, "broken input");

        fail.set_param(0, &Var::from("explicit")).unwrap();
        let err = fail.activate(&ctx, &Var::None).unwrap_err();
        assert_eq!(err.message, "explicit");
    }

    #[test]
    fn test_expect_checks_at_runtime() {
        let ctx = Context::detached();
        let mut expect = expect_int();
        assert_eq!(expect.activate(&ctx, &Var::Int(1)).unwrap(), Var::Int(1));
        let err = expect.activate(&ctx, &Var::from("nope")).unwrap_err();
        assert!(err.message.contains("unexpected value type"));
    }

    #[test]
    fn test_parameterized_expect() {
        let mut expect = ExpectType::open();
        expect
            .set_param(0, &Var::Type(Box::new(TypeInfo::Float)))
            .unwrap();
        let out = expect.compose(&InstanceData::default()).unwrap();
        assert_eq!(out, Some(TypeInfo::Float));
        let ctx = Context::detached();
        assert!(expect.activate(&ctx, &Var::Float(0.5)).is_ok());
        assert!(expect.activate(&ctx, &Var::Int(2)).is_err());
    }
}
