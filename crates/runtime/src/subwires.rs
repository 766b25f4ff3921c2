//! Sub-wire shards
//!
//! `Do` runs another wire inline within the caller's fiber: the
//! sub-wire's shards execute under the caller's context with the
//! sub-wire pushed onto the wire stack. Scheduling a wire as its own
//! fiber is a mesh operation, not a shard concern.

use std::rc::Rc;

use shards_core::compose::{compose_wire, default_validation_callback, InstanceData};
use shards_core::context::Context;
use shards_core::error::{ActivationError, ComposeError, ShardError};
use shards_core::shard::{ParameterInfo, Shard};
use shards_core::types::TypeInfo;
use shards_core::value::Var;
use shards_core::wire::{cleanup_wire, run_sub_wire, warmup_wire, RunWireOutputState, Wire};

/// Runs a wire inline, forwarding the current value as its input and
/// producing the wire's output.
#[derive(Default)]
pub struct Do {
    wire: Option<Rc<Wire>>,
}

impl Do {
    pub fn with_wire(wire: Rc<Wire>) -> Self {
        Self { wire: Some(wire) }
    }
}

impl Shard for Do {
    fn name(&self) -> &'static str {
        "Do"
    }

    fn help(&self) -> &'static str {
        "Runs a sub-wire inline within the current wire's fiber"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new("Wire", "The wire to run", vec![TypeInfo::Wire])]
    }

    fn set_param(&mut self, index: usize, value: &Var) -> Result<(), ShardError> {
        match (index, value) {
            (0, Var::Wire(wire)) => {
                self.wire = Some(wire.clone());
                Ok(())
            }
            (0, Var::None) => {
                self.wire = None;
                Ok(())
            }
            (0, other) => Err(ShardError::InvalidParameterValue {
                index,
                reason: format!("expected a wire, got {}", other),
            }),
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn get_param(&self, index: usize) -> Result<Var, ShardError> {
        match index {
            0 => Ok(self
                .wire
                .as_ref()
                .map(|w| Var::Wire(w.clone()))
                .unwrap_or(Var::None)),
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>, ComposeError> {
        let wire = self
            .wire
            .as_ref()
            .ok_or_else(|| ComposeError::new("Do: no wire set"))?;

        let sub_data = InstanceData {
            wire: Some(wire.clone()),
            input_type: data.input_type.clone(),
            output_types: Vec::new(),
            shared: data.shared.clone(),
            on_worker_thread: data.on_worker_thread,
            required: data.required.clone(),
        };
        let result = compose_wire(wire, &default_validation_callback, &sub_data)?;
        Ok(Some(result.output_type))
    }

    fn warmup(&mut self, context: &Context) -> Result<(), ActivationError> {
        let wire = self
            .wire
            .as_ref()
            .ok_or_else(|| ActivationError::new("Do: no wire set"))?;
        warmup_wire(wire, context)
    }

    fn activate(&mut self, context: &Context, input: &Var) -> Result<Var, ActivationError> {
        let wire = self
            .wire
            .as_ref()
            .ok_or_else(|| ActivationError::new("Do: no wire set"))?;

        let result = run_sub_wire(wire, context, input);
        match result.state {
            RunWireOutputState::Failed => {
                // context already carries the error; annotate with the
                // sub-wire for the caller's log
                let message = context.error_message();
                Err(ActivationError::new(format!(
                    "sub-wire {} failed: {}",
                    wire.name(),
                    message
                )))
            }
            RunWireOutputState::Returned | RunWireOutputState::Restarted => {
                // absorbed here, the caller's flow continues
                context.continue_flow();
                Ok(result.output)
            }
            RunWireOutputState::Stopped | RunWireOutputState::Running => Ok(result.output),
        }
    }

    fn cleanup(&mut self, context: Option<&Context>) -> Result<(), ActivationError> {
        if let Some(wire) = &self.wire {
            cleanup_wire(wire, false, context);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Const;
    use shards_core::compose::compose_shards;
    use shards_core::shard::ShardInstance;

    #[test]
    fn test_do_composes_sub_wire_output() {
        let sub = Wire::new("sub");
        sub.add_shard(ShardInstance::new(Const::with_value(Var::Int(5))));

        let parent_shards = vec![{
            let shard = ShardInstance::new(Do::default());
            shard.set_param(0, &Var::Wire(sub.clone())).unwrap();
            shard
        }];

        let result = compose_shards(
            &parent_shards,
            &default_validation_callback,
            &InstanceData::default(),
        )
        .unwrap();
        assert_eq!(result.output_type, TypeInfo::Int);
        assert_eq!(sub.output_type(), TypeInfo::Int);
    }

    #[test]
    fn test_do_without_wire_fails_compose() {
        let mut shard = Do::default();
        let err = shard.compose(&InstanceData::default()).unwrap_err();
        assert!(err.message.contains("no wire set"));
    }

    #[test]
    fn test_do_rejects_non_wire_param() {
        let mut shard = Do::default();
        assert!(shard.set_param(0, &Var::Int(1)).is_err());
        assert!(shard.set_param(0, &Var::None).is_ok());
    }
}
