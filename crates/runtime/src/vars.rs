//! Variable shards: Set, Ref, Update, Get, Push
//!
//! `Set` and `Push` own the storage they expose; `Ref` only borrows its
//! target; `Update` mutates a variable someone else exposed; `Get` reads
//! one, with an optional default. Composition enforces the aliasing
//! rules between these by name (a `Ref` target must never be re-owned by
//! a `Set`/`Push` and vice versa).

use shards_core::compose::InstanceData;
use shards_core::context::{reference_variable, Context};
use shards_core::error::{ActivationError, ComposeError, ShardError};
use shards_core::shard::{ParameterInfo, Shard};
use shards_core::types::{derive_type, ExposedTypeInfo, TypeInfo};
use shards_core::value::{seq_push, Var, VarFlags, VariableRef};

fn name_param() -> ParameterInfo {
    ParameterInfo::new(
        "Name",
        "The name of the variable",
        vec![TypeInfo::String, TypeInfo::ContextVar(vec![])],
    )
}

fn resolve_slot(
    context: &Context,
    name: &str,
    global: bool,
) -> Result<VariableRef, ActivationError> {
    if global {
        let mesh = context
            .main_wire()
            .and_then(|w| w.mesh())
            .ok_or_else(|| ActivationError::new("no mesh available for a global variable"))?;
        Ok(mesh.get_variable(name))
    } else {
        Ok(reference_variable(context, name))
    }
}

/// Writes the input into a named variable it owns, passing the input
/// through.
#[derive(Default)]
pub struct Set {
    name: String,
    global: bool,
    exposed: bool,
    inferred: Option<TypeInfo>,
    slot: Option<VariableRef>,
}

impl Shard for Set {
    fn name(&self) -> &'static str {
        "Set"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![
            name_param(),
            ParameterInfo::new("Global", "Write into the mesh scope", vec![TypeInfo::Bool]),
            ParameterInfo::new(
                "Exposed",
                "Fire variable-change events on every write",
                vec![TypeInfo::Bool],
            ),
        ]
    }

    fn set_param(&mut self, index: usize, value: &Var) -> Result<(), ShardError> {
        match index {
            0 => {
                self.name = value.as_str().unwrap_or("").to_string();
                Ok(())
            }
            1 => {
                self.global = matches!(value, Var::Bool(true));
                Ok(())
            }
            2 => {
                self.exposed = matches!(value, Var::Bool(true));
                Ok(())
            }
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn get_param(&self, index: usize) -> Result<Var, ShardError> {
        match index {
            0 => Ok(Var::from(self.name.as_str())),
            1 => Ok(Var::Bool(self.global)),
            2 => Ok(Var::Bool(self.exposed)),
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn exposed_variables(&self) -> Vec<ExposedTypeInfo> {
        let mut info = ExposedTypeInfo::mutable(
            self.name.clone(),
            self.inferred.clone().unwrap_or(TypeInfo::Any),
        );
        info.global = self.global;
        info.exposed = self.exposed;
        vec![info]
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>, ComposeError> {
        if self.name.is_empty() {
            return Err(ComposeError::new("Set: variable name is required"));
        }
        self.inferred = Some(data.input_type.clone());
        Ok(Some(data.input_type.clone()))
    }

    fn warmup(&mut self, context: &Context) -> Result<(), ActivationError> {
        let slot = resolve_slot(context, &self.name, self.global)?;
        if self.exposed {
            slot.flags.set(slot.flags.get() | VarFlags::EXPOSED);
        }
        self.slot = Some(slot);
        Ok(())
    }

    fn activate(&mut self, context: &Context, input: &Var) -> Result<Var, ActivationError> {
        let slot = self
            .slot
            .as_ref()
            .ok_or_else(|| ActivationError::new("Set: not warmed up"))?;
        slot.set(input);
        if slot.is_exposed() {
            if let Some(mesh) = context.main_wire().and_then(|w| w.mesh()) {
                mesh.trigger_var_value_change(&self.name, input);
            }
        }
        Ok(input.clone())
    }

    fn cleanup(&mut self, _context: Option<&Context>) -> Result<(), ActivationError> {
        self.slot = None;
        Ok(())
    }
}

/// Borrows the input under a name without taking ownership of the
/// storage.
#[derive(Default)]
pub struct Ref {
    name: String,
    inferred: Option<TypeInfo>,
    slot: Option<VariableRef>,
}

impl Shard for Ref {
    fn name(&self) -> &'static str {
        "Ref"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![name_param()]
    }

    fn set_param(&mut self, index: usize, value: &Var) -> Result<(), ShardError> {
        match index {
            0 => {
                self.name = value.as_str().unwrap_or("").to_string();
                Ok(())
            }
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn get_param(&self, index: usize) -> Result<Var, ShardError> {
        match index {
            0 => Ok(Var::from(self.name.as_str())),
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn exposed_variables(&self) -> Vec<ExposedTypeInfo> {
        vec![ExposedTypeInfo::new(
            self.name.clone(),
            self.inferred.clone().unwrap_or(TypeInfo::Any),
        )]
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>, ComposeError> {
        if self.name.is_empty() {
            return Err(ComposeError::new("Ref: variable name is required"));
        }
        self.inferred = Some(data.input_type.clone());
        Ok(Some(data.input_type.clone()))
    }

    fn warmup(&mut self, context: &Context) -> Result<(), ActivationError> {
        self.slot = Some(reference_variable(context, &self.name));
        Ok(())
    }

    fn activate(&mut self, _context: &Context, input: &Var) -> Result<Var, ActivationError> {
        let slot = self
            .slot
            .as_ref()
            .ok_or_else(|| ActivationError::new("Ref: not warmed up"))?;
        slot.set(input);
        Ok(input.clone())
    }

    fn cleanup(&mut self, _context: Option<&Context>) -> Result<(), ActivationError> {
        self.slot = None;
        Ok(())
    }
}

/// Overwrites a variable someone else exposed; never creates storage.
#[derive(Default)]
pub struct Update {
    name: String,
    inferred: Option<TypeInfo>,
    slot: Option<VariableRef>,
}

impl Shard for Update {
    fn name(&self) -> &'static str {
        "Update"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![name_param()]
    }

    fn set_param(&mut self, index: usize, value: &Var) -> Result<(), ShardError> {
        match index {
            0 => {
                self.name = value.as_str().unwrap_or("").to_string();
                Ok(())
            }
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn get_param(&self, index: usize) -> Result<Var, ShardError> {
        match index {
            0 => Ok(Var::from(self.name.as_str())),
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn required_variables(&self) -> Vec<ExposedTypeInfo> {
        vec![ExposedTypeInfo::mutable(
            self.name.clone(),
            self.inferred.clone().unwrap_or(TypeInfo::Any),
        )]
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>, ComposeError> {
        if self.name.is_empty() {
            return Err(ComposeError::new("Update: variable name is required"));
        }
        self.inferred = Some(data.input_type.clone());
        Ok(Some(data.input_type.clone()))
    }

    fn warmup(&mut self, context: &Context) -> Result<(), ActivationError> {
        self.slot = Some(reference_variable(context, &self.name));
        Ok(())
    }

    fn activate(&mut self, context: &Context, input: &Var) -> Result<Var, ActivationError> {
        let slot = self
            .slot
            .as_ref()
            .ok_or_else(|| ActivationError::new("Update: not warmed up"))?;
        slot.set(input);
        if slot.is_exposed() {
            if let Some(mesh) = context.main_wire().and_then(|w| w.mesh()) {
                mesh.trigger_var_value_change(&self.name, input);
            }
        }
        Ok(input.clone())
    }

    fn cleanup(&mut self, _context: Option<&Context>) -> Result<(), ActivationError> {
        self.slot = None;
        Ok(())
    }
}

/// Reads a named variable, with an optional default for the first read.
#[derive(Default)]
pub struct Get {
    name: String,
    default: Var,
    slot: Option<VariableRef>,
}

impl Shard for Get {
    fn name(&self) -> &'static str {
        "Get"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![
            name_param(),
            ParameterInfo::new(
                "Default",
                "Value to produce while the variable is unset",
                vec![TypeInfo::Any],
            ),
        ]
    }

    fn set_param(&mut self, index: usize, value: &Var) -> Result<(), ShardError> {
        match index {
            0 => {
                self.name = value.as_str().unwrap_or("").to_string();
                Ok(())
            }
            1 => {
                self.default = value.clone();
                Ok(())
            }
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn get_param(&self, index: usize) -> Result<Var, ShardError> {
        match index {
            0 => Ok(Var::from(self.name.as_str())),
            1 => Ok(self.default.clone()),
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn required_variables(&self) -> Vec<ExposedTypeInfo> {
        if self.default.is_none() {
            vec![ExposedTypeInfo::new(self.name.clone(), TypeInfo::Any)]
        } else {
            Vec::new()
        }
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>, ComposeError> {
        if self.name.is_empty() {
            return Err(ComposeError::new("Get: variable name is required"));
        }
        // resolve against what the scope exposes, else type the default
        if let Some(info) = data.shared.iter().find(|info| info.name == self.name) {
            return Ok(Some(info.exposed_type.clone()));
        }
        if !self.default.is_none() {
            return Ok(Some(derive_type(&self.default, None)?));
        }
        Err(ComposeError::new(format!(
            "Get: variable not found and no default provided: {}",
            self.name
        )))
    }

    fn warmup(&mut self, context: &Context) -> Result<(), ActivationError> {
        self.slot = Some(reference_variable(context, &self.name));
        Ok(())
    }

    fn activate(&mut self, _context: &Context, _input: &Var) -> Result<Var, ActivationError> {
        let slot = self
            .slot
            .as_ref()
            .ok_or_else(|| ActivationError::new("Get: not warmed up"))?;
        let value = slot.get();
        if value.is_none() && !self.default.is_none() {
            return Ok(self.default.clone());
        }
        Ok(value)
    }

    fn cleanup(&mut self, _context: Option<&Context>) -> Result<(), ActivationError> {
        self.slot = None;
        Ok(())
    }
}

/// Appends the input to a sequence variable it owns, creating the
/// sequence on first use.
#[derive(Default)]
pub struct Push {
    name: String,
    inferred: Option<TypeInfo>,
    slot: Option<VariableRef>,
}

impl Shard for Push {
    fn name(&self) -> &'static str {
        "Push"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![name_param()]
    }

    fn set_param(&mut self, index: usize, value: &Var) -> Result<(), ShardError> {
        match index {
            0 => {
                self.name = value.as_str().unwrap_or("").to_string();
                Ok(())
            }
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn get_param(&self, index: usize) -> Result<Var, ShardError> {
        match index {
            0 => Ok(Var::from(self.name.as_str())),
            _ => Err(ShardError::InvalidParameterIndex(index)),
        }
    }

    fn exposed_variables(&self) -> Vec<ExposedTypeInfo> {
        let element = self.inferred.clone().unwrap_or(TypeInfo::Any);
        vec![ExposedTypeInfo::mutable(
            self.name.clone(),
            TypeInfo::Seq { types: vec![element], fixed_size: 0 },
        )]
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>, ComposeError> {
        if self.name.is_empty() {
            return Err(ComposeError::new("Push: variable name is required"));
        }
        self.inferred = Some(data.input_type.clone());
        Ok(Some(data.input_type.clone()))
    }

    fn warmup(&mut self, context: &Context) -> Result<(), ActivationError> {
        self.slot = Some(reference_variable(context, &self.name));
        Ok(())
    }

    fn activate(&mut self, _context: &Context, input: &Var) -> Result<Var, ActivationError> {
        let slot = self
            .slot
            .as_ref()
            .ok_or_else(|| ActivationError::new("Push: not warmed up"))?;
        let mut value = slot.value.borrow_mut();
        match &mut *value {
            Var::Seq(items) => seq_push(items, input.clone()),
            other => *other = Var::Seq(vec![input.clone()]),
        }
        drop(value);
        Ok(input.clone())
    }

    fn cleanup(&mut self, _context: Option<&Context>) -> Result<(), ActivationError> {
        self.slot = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shards_core::compose::{compose_shards, default_validation_callback};
    use shards_core::shard::ShardInstance;

    fn named(shard: impl Shard, name: &str) -> ShardInstance {
        let instance = ShardInstance::new(shard);
        instance.set_param(0, &Var::from(name)).unwrap();
        instance
    }

    #[test]
    fn test_set_exposes_input_type() {
        let shards = vec![named(Set::default(), "x")];
        let data = InstanceData { input_type: TypeInfo::Int, ..Default::default() };
        let result = compose_shards(&shards, &default_validation_callback, &data).unwrap();
        assert_eq!(result.output_type, TypeInfo::Int);
        assert_eq!(result.exposed.len(), 1);
        assert_eq!(result.exposed[0].name, "x");
        assert_eq!(result.exposed[0].exposed_type, TypeInfo::Int);
        assert!(result.exposed[0].is_mutable);
    }

    #[test]
    fn test_set_then_ref_conflict_is_fatal() {
        let shards = vec![named(Set::default(), "x"), named(Ref::default(), "x")];
        let data = InstanceData { input_type: TypeInfo::Int, ..Default::default() };
        let err = compose_shards(&shards, &default_validation_callback, &data).unwrap_err();
        assert!(err.message.contains("not allowed"));
    }

    #[test]
    fn test_ref_then_push_conflict_is_fatal() {
        let shards = vec![named(Ref::default(), "y"), named(Push::default(), "y")];
        let data = InstanceData { input_type: TypeInfo::Int, ..Default::default() };
        let err = compose_shards(&shards, &default_validation_callback, &data).unwrap_err();
        assert!(err.message.contains("not allowed"));
    }

    #[test]
    fn test_get_types_from_exposed_scope() {
        let shards = vec![named(Set::default(), "v"), named(Get::default(), "v")];
        let data = InstanceData { input_type: TypeInfo::Float, ..Default::default() };
        let result = compose_shards(&shards, &default_validation_callback, &data).unwrap();
        assert_eq!(result.output_type, TypeInfo::Float);
    }

    #[test]
    fn test_get_falls_back_to_default_type() {
        let get = named(Get::default(), "missing");
        get.set_param(1, &Var::Int(0)).unwrap();
        let result =
            compose_shards(&[get], &default_validation_callback, &InstanceData::default())
                .unwrap();
        assert_eq!(result.output_type, TypeInfo::Int);
    }

    #[test]
    fn test_get_without_default_or_scope_fails() {
        let shards = vec![named(Get::default(), "nowhere")];
        let err =
            compose_shards(&shards, &default_validation_callback, &InstanceData::default())
                .unwrap_err();
        assert!(err.message.contains("no default"));
    }

    #[test]
    fn test_push_exposes_sequence() {
        let shards = vec![named(Push::default(), "items")];
        let data = InstanceData { input_type: TypeInfo::String, ..Default::default() };
        let result = compose_shards(&shards, &default_validation_callback, &data).unwrap();
        assert_eq!(
            result.exposed[0].exposed_type,
            TypeInfo::Seq { types: vec![TypeInfo::String], fixed_size: 0 }
        );
    }
}
