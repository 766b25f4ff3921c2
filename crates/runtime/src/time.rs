//! Time shards

use shards_core::context::{suspend, Context, WireState};
use shards_core::error::{ActivationError, ShardError};
use shards_core::shard::{ParameterInfo, Shard};
use shards_core::types::TypeInfo;
use shards_core::value::Var;

/// Suspends the wire for at least the given number of seconds, passing
/// the input through on resume.
#[derive(Default)]
pub struct Pause {
    seconds: f64,
}

impl Pause {
    pub fn with_seconds(seconds: f64) -> Self {
        Self { seconds }
    }
}

impl Shard for Pause {
    fn name(&self) -> &'static str {
        "Pause"
    }

    fn help(&self) -> &'static str {
        "Pauses the wire, giving the mesh a chance to run other wires"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new(
            "Time",
            "Seconds to pause for; non-positive pauses until the next tick",
            vec![TypeInfo::Float, TypeInfo::Int],
        )]
    }

    fn set_param(&mut self, index: usize, value: &Var) -> Result<(), ShardError> {
        match index {
            0 => {
                self.seconds = match value {
                    Var::Float(v) => *v,
                    Var::Int(v) => *v as f64,
                    _ => 0.0,
                };
                Ok(())
            }
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn get_param(&self, index: usize) -> Result<Var, ShardError> {
        match index {
            0 => Ok(Var::Float(self.seconds)),
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn activate(&mut self, context: &Context, input: &Var) -> Result<Var, ActivationError> {
        if suspend(context, self.seconds)? != WireState::Continue {
            return Ok(Var::None);
        }
        Ok(input.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_params() {
        let mut pause = Pause::default();
        pause.set_param(0, &Var::Float(0.25)).unwrap();
        assert_eq!(pause.get_param(0).unwrap(), Var::Float(0.25));
        pause.set_param(0, &Var::Int(2)).unwrap();
        assert_eq!(pause.get_param(0).unwrap(), Var::Float(2.0));
    }

    #[test]
    fn test_pause_outside_fiber_errors() {
        let ctx = Context::detached();
        let mut pause = Pause::with_seconds(0.0);
        let err = pause.activate(&ctx, &Var::None).unwrap_err();
        assert!(err.message.contains("without a fiber"));
    }
}
