//! Math shards: element-wise binary operations with a constant operand
//!
//! `Math.Add`, `Math.Subtract` and `Math.Multiply` operate on the
//! numeric tags (Int, Float and their vector forms) and broadcast over
//! sequences of those. The operand type must match the input type at
//! compose time.

use shards_core::compose::InstanceData;
use shards_core::context::Context;
use shards_core::error::{ActivationError, ComposeError, ShardError};
use shards_core::shard::{ParameterInfo, Shard};
use shards_core::types::{derive_type, TypeInfo};
use shards_core::value::Var;

fn math_types() -> Vec<TypeInfo> {
    vec![
        TypeInfo::Int,
        TypeInfo::Int2,
        TypeInfo::Float,
        TypeInfo::Float2,
        TypeInfo::Float3,
        TypeInfo::Float4,
        TypeInfo::Seq {
            types: vec![TypeInfo::Int, TypeInfo::Float],
            fixed_size: 0,
        },
    ]
}

/// Shared implementation for the binary math shards; each registered
/// name binds one integer op and its float counterpart.
pub struct MathBinary {
    shard_name: &'static str,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
    operand: Var,
}

impl MathBinary {
    fn new(
        shard_name: &'static str,
        int_op: fn(i64, i64) -> i64,
        float_op: fn(f64, f64) -> f64,
    ) -> Self {
        Self { shard_name, int_op, float_op, operand: Var::Int(0) }
    }

    fn apply(&self, input: &Var, operand: &Var) -> Result<Var, ActivationError> {
        let int_op = self.int_op;
        let float_op = self.float_op;
        match (input, operand) {
            (Var::Int(a), Var::Int(b)) => Ok(Var::Int(int_op(*a, *b))),
            (Var::Float(a), Var::Float(b)) => Ok(Var::Float(float_op(*a, *b))),
            (Var::Int2(a), Var::Int2(b)) => {
                Ok(Var::Int2([int_op(a[0], b[0]), int_op(a[1], b[1])]))
            }
            (Var::Float2(a), Var::Float2(b)) => {
                Ok(Var::Float2([float_op(a[0], b[0]), float_op(a[1], b[1])]))
            }
            (Var::Float3(a), Var::Float3(b)) => Ok(Var::Float3([
                float_op(a[0].into(), b[0].into()) as f32,
                float_op(a[1].into(), b[1].into()) as f32,
                float_op(a[2].into(), b[2].into()) as f32,
            ])),
            (Var::Float4(a), Var::Float4(b)) => Ok(Var::Float4([
                float_op(a[0].into(), b[0].into()) as f32,
                float_op(a[1].into(), b[1].into()) as f32,
                float_op(a[2].into(), b[2].into()) as f32,
                float_op(a[3].into(), b[3].into()) as f32,
            ])),
            (Var::Seq(items), operand) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.apply(item, operand)?);
                }
                Ok(Var::Seq(out))
            }
            (a, b) => Err(ActivationError::new(format!(
                "{}: operand mismatch, input {} operand {}",
                self.shard_name, a, b
            ))),
        }
    }
}

impl Shard for MathBinary {
    fn name(&self) -> &'static str {
        self.shard_name
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        math_types()
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        math_types()
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new(
            "Operand",
            "The second operand of the operation",
            vec![
                TypeInfo::Int,
                TypeInfo::Int2,
                TypeInfo::Float,
                TypeInfo::Float2,
                TypeInfo::Float3,
                TypeInfo::Float4,
            ],
        )]
    }

    fn set_param(&mut self, index: usize, value: &Var) -> Result<(), ShardError> {
        match index {
            0 => {
                self.operand = value.clone();
                Ok(())
            }
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn get_param(&self, index: usize) -> Result<Var, ShardError> {
        match index {
            0 => Ok(self.operand.clone()),
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>, ComposeError> {
        let operand_type = derive_type(&self.operand, None)?;
        match &data.input_type {
            TypeInfo::Seq { types, .. } => {
                if !types.is_empty() && !types.contains(&operand_type) {
                    return Err(ComposeError::new(format!(
                        "{}: operand type {} does not match sequence elements {:?}",
                        self.shard_name, operand_type, types
                    )));
                }
            }
            input => {
                if *input != operand_type {
                    return Err(ComposeError::new(format!(
                        "{}: operand type {} does not match input type {}",
                        self.shard_name, operand_type, input
                    )));
                }
            }
        }
        Ok(Some(data.input_type.clone()))
    }

    fn activate(&mut self, _context: &Context, input: &Var) -> Result<Var, ActivationError> {
        let operand = self.operand.clone();
        self.apply(input, &operand)
    }
}

pub fn add() -> MathBinary {
    MathBinary::new("Math.Add", i64::wrapping_add, |a, b| a + b)
}

pub fn subtract() -> MathBinary {
    MathBinary::new("Math.Subtract", i64::wrapping_sub, |a, b| a - b)
}

pub fn multiply() -> MathBinary {
    MathBinary::new("Math.Multiply", i64::wrapping_mul, |a, b| a * b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_ops() {
        let ctx = Context::detached();
        let mut shard = add();
        shard.set_param(0, &Var::Int(5)).unwrap();
        assert_eq!(shard.activate(&ctx, &Var::Int(2)).unwrap(), Var::Int(7));

        let mut shard = subtract();
        shard.set_param(0, &Var::Int(1)).unwrap();
        assert_eq!(shard.activate(&ctx, &Var::Int(2)).unwrap(), Var::Int(1));

        let mut shard = multiply();
        shard.set_param(0, &Var::Int(3)).unwrap();
        assert_eq!(shard.activate(&ctx, &Var::Int(2)).unwrap(), Var::Int(6));
    }

    #[test]
    fn test_float_and_vector_ops() {
        let ctx = Context::detached();
        let mut shard = add();
        shard.set_param(0, &Var::Float(0.5)).unwrap();
        assert_eq!(shard.activate(&ctx, &Var::Float(1.0)).unwrap(), Var::Float(1.5));

        let mut shard = add();
        shard.set_param(0, &Var::Float2([1.0, 2.0])).unwrap();
        assert_eq!(
            shard.activate(&ctx, &Var::Float2([0.5, 0.5])).unwrap(),
            Var::Float2([1.5, 2.5])
        );
    }

    #[test]
    fn test_broadcast_over_seq() {
        let ctx = Context::detached();
        let mut shard = multiply();
        shard.set_param(0, &Var::Int(2)).unwrap();
        let input = Var::Seq(vec![Var::Int(1), Var::Int(2), Var::Int(3)]);
        assert_eq!(
            shard.activate(&ctx, &input).unwrap(),
            Var::Seq(vec![Var::Int(2), Var::Int(4), Var::Int(6)])
        );
    }

    #[test]
    fn test_compose_rejects_operand_mismatch() {
        let mut shard = add();
        shard.set_param(0, &Var::Float(1.0)).unwrap();
        let data = InstanceData { input_type: TypeInfo::Int, ..Default::default() };
        assert!(shard.compose(&data).is_err());

        shard.set_param(0, &Var::Int(1)).unwrap();
        assert_eq!(shard.compose(&data).unwrap(), Some(TypeInfo::Int));
    }

    #[test]
    fn test_type_mismatch_at_runtime() {
        let ctx = Context::detached();
        let mut shard = add();
        shard.set_param(0, &Var::Int(1)).unwrap();
        assert!(shard.activate(&ctx, &Var::Float(1.0)).is_err());
    }
}
