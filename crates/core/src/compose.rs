//! Composition - wire-level static type checking
//!
//! A single forward pass over a wire's shards: validate that each
//! shard's declared inputs accept the previous output, let shards with a
//! `compose` hook specialize their output type, track exposed and
//! required variables, and detect flow-stopping tails.
//!
//! Diagnostics go through a validation callback: warnings are reported
//! and composition continues, everything else is fatal to the compose
//! call.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::Ordering;

use crate::error::ComposeError;
use crate::hash::hash_wire;
use crate::shard::ShardInstance;
use crate::types::{derive_type, match_types, ExposedTypeInfo, TypeInfo};
use crate::value::{ShType, Var};
use crate::wire::{emit_event, Wire, WireEvent};

/// Seed data for composing a wire or a single shard.
#[derive(Clone, Default)]
pub struct InstanceData {
    pub wire: Option<Rc<Wire>>,
    pub input_type: TypeInfo,
    /// Declared input types of the *next* shard, available to `compose`
    /// implementations as a specialization hint.
    pub output_types: Vec<TypeInfo>,
    /// Variables inherited from the surrounding scope.
    pub shared: Vec<ExposedTypeInfo>,
    pub on_worker_thread: bool,
    /// Accumulator for every unresolved requirement across nested
    /// composes, shared by reference.
    pub required: Option<Rc<RefCell<HashMap<String, ExposedTypeInfo>>>>,
}

/// Outcome of composing a shard sequence.
#[derive(Debug, Clone, Default)]
pub struct ComposeResult {
    pub output_type: TypeInfo,
    pub exposed: Vec<ExposedTypeInfo>,
    pub required: Vec<ExposedTypeInfo>,
    /// The sequence ends in `Restart`/`Return`/`Fail`/`Stop(None)` and
    /// never yields an output to a caller.
    pub flow_stopper: bool,
}

/// Diagnostics sink for composition. `warning == true` reports and
/// continues; otherwise the callback decides fatality by returning an
/// error (the default callback always does).
pub type ValidationCallback<'a> = &'a dyn Fn(Option<&ShardInstance>, &str, bool) -> Result<(), ComposeError>;

/// Log warnings, make everything else fatal.
pub fn default_validation_callback(
    shard: Option<&ShardInstance>,
    message: &str,
    warning: bool,
) -> Result<(), ComposeError> {
    let name = shard.map(|s| s.name()).unwrap_or("(none)");
    if warning {
        tracing::warn!(shard = name, "validation warning: {}", message);
        Ok(())
    } else {
        Err(ComposeError::new(format!("{}, input shard: {}", message, name)))
    }
}

struct ValidationContext<'a> {
    inherited: HashMap<String, ExposedTypeInfo>,
    exposed: HashMap<String, ExposedTypeInfo>,
    /// Names owned by `Set`/`Push` (managed storage).
    variables: HashSet<String>,
    /// Names borrowed by `Ref`.
    references: HashSet<String>,
    required: Vec<ExposedTypeInfo>,

    previous_output_type: TypeInfo,
    original_input_type: TypeInfo,

    wire: Option<Rc<Wire>>,
    callback: ValidationCallback<'a>,
    on_worker_thread: bool,
    full_required: Option<Rc<RefCell<HashMap<String, ExposedTypeInfo>>>>,
}

fn validate_connection(
    ctx: &mut ValidationContext<'_>,
    bottom: &ShardInstance,
    next: Option<&ShardInstance>,
) -> Result<(), ComposeError> {
    let previous_output = ctx.previous_output_type.clone();

    // validate our generic input
    let input_infos = bottom.input_types();
    let input_matches = if input_infos.len() == 1 && input_infos[0] == TypeInfo::None {
        // a None input always matches
        true
    } else {
        input_infos
            .iter()
            .any(|info| match_types(&previous_output, info, false, true, false))
    };

    if !input_matches {
        let msg = format!(
            "could not find a matching input type, shard: {} (line: {}, column: {}) expected: {:?}, found instead: {}",
            bottom.name(),
            bottom.line(),
            bottom.column(),
            input_infos,
            previous_output
        );
        (ctx.callback)(Some(bottom), &msg, false)?;
    }

    // Infer and specialize the output type. Without a compose hook we
    // assume the single declared output.
    let mut data = InstanceData {
        wire: ctx.wire.clone(),
        input_type: previous_output.clone(),
        output_types: next.map(|n| n.input_types()).unwrap_or_default(),
        shared: Vec::new(),
        on_worker_thread: ctx.on_worker_thread,
        required: ctx.full_required.clone(),
    };
    for info in ctx.exposed.values() {
        data.shared.push(info.clone());
    }
    for info in ctx.inherited.values() {
        data.shared.push(info.clone());
    }

    match bottom.compose(&data) {
        Ok(Some(output_type)) => {
            ctx.previous_output_type = output_type;
        }
        Ok(None) => {
            let output_types = bottom.output_types();
            if output_types.len() == 1 {
                if output_types[0].basic_type() != ShType::Any {
                    ctx.previous_output_type = output_types[0].clone();
                } else {
                    // Any means passthrough - keep the previous output
                    // type - unless a specific input type is required, in
                    // which case the shard is not a passthrough.
                    if input_infos.len() == 1 && input_infos[0].basic_type() != ShType::Any {
                        ctx.previous_output_type = output_types[0].clone();
                    }
                }
            } else {
                tracing::error!(shard = bottom.name(), "shard needs to implement the compose method");
                return Err(ComposeError::new(
                    "shard has multiple possible output types and is missing the compose method",
                ));
            }
        }
        Err(err) => {
            let wire_name = ctx.wire.as_ref().map(|w| w.name().to_string());
            tracing::error!(
                error = %err,
                wire = wire_name.as_deref().unwrap_or("(unwired)"),
                "error composing shard"
            );
            return Err(err);
        }
    }

    // Grab those after type inference!
    let shard_name = bottom.name();
    for exposed in bottom.exposed_variables() {
        let name = exposed.name.clone();

        // Reference mutability checks: Ref borrows the target, Set/Push
        // own and manage it. The combinations must not alias.
        match shard_name {
            "Ref" => {
                if ctx.variables.contains(&name) {
                    let err = format!(
                        "Ref variable name already used as Set. Overwriting a previously Set variable with Ref is not allowed, name: {}",
                        name
                    );
                    (ctx.callback)(Some(bottom), &err, false)?;
                }
                ctx.references.insert(name.clone());
            }
            "Set" => {
                if ctx.references.contains(&name) {
                    let err = format!(
                        "Set variable name already used as Ref. Overwriting a previously Ref variable with Set is not allowed, name: {}",
                        name
                    );
                    (ctx.callback)(Some(bottom), &err, false)?;
                }
                ctx.variables.insert(name.clone());
            }
            "Update" => {
                if ctx.references.contains(&name) {
                    let err = format!(
                        "Update variable name already used as Ref. Overwriting a previously Ref variable with Update is not allowed, name: {}",
                        name
                    );
                    (ctx.callback)(Some(bottom), &err, false)?;
                }
            }
            "Push" => {
                if ctx.references.contains(&name) {
                    let err = format!(
                        "Push variable name already used as Ref. Overwriting a previously Ref variable with Push is not allowed, name: {}",
                        name
                    );
                    (ctx.callback)(Some(bottom), &err, false)?;
                }
                ctx.variables.insert(name.clone());
            }
            _ => {}
        }

        ctx.exposed.insert(name, exposed);
    }

    // Finally do checks on what we consume.
    let mut required_vars: HashMap<String, ExposedTypeInfo> = HashMap::new();
    for required in bottom.required_variables() {
        required_vars.insert(required.name.clone(), required);
    }

    for (full_name, required_param) in &required_vars {
        // only the first part of the name matters; the rest is a table
        // key handled at activation
        let name = full_name.split(' ').next().unwrap_or(full_name);

        let found = ctx.exposed.get(name).or_else(|| ctx.inherited.get(name));

        let matching = match found {
            None => {
                let err = format!("required variable not found: {}", name);
                // warning only, the callback decides fatality
                (ctx.callback)(Some(bottom), &err, true)?;
                false
            }
            Some(exposed) => match_types(
                &exposed.exposed_type,
                &required_param.exposed_type,
                false,
                true,
                false,
            ),
        };

        if matching {
            // add required stuff that we do not expose ourselves
            if !ctx.exposed.contains_key(required_param.name.as_str()) {
                if !ctx.required.iter().any(|r| r.name == required_param.name) {
                    ctx.required.push(required_param.clone());
                }
                if let Some(full) = &ctx.full_required {
                    full.borrow_mut()
                        .insert(required_param.name.clone(), required_param.clone());
                }
            }
        } else if found.is_some() {
            let mut msg = format!(
                "required types do not match currently exposed ones for variable '{}' required possible types: {{\"{}\" ({})}} exposed types: ",
                full_name, required_param.name, required_param.exposed_type
            );
            for info in ctx.exposed.values() {
                msg.push_str(&format!("{{\"{}\" ({})}} ", info.name, info.exposed_type));
            }
            for info in ctx.inherited.values() {
                msg.push_str(&format!("{{\"{}\" ({})}} ", info.name, info.exposed_type));
            }
            (ctx.callback)(Some(bottom), &msg, false)?;
        }
    }

    Ok(())
}

/// Whether a shard name terminates the flow when it is the last shard of
/// a sequence. `Stop` only counts with no passthrough value.
fn is_flow_stopper(shard: &ShardInstance) -> bool {
    match shard.name() {
        "Restart" | "Return" | "Fail" => true,
        "Stop" => shard
            .get_param(0)
            .map(|value| value.is_none())
            .unwrap_or(true),
        _ => false,
    }
}

/// Compose an ordered shard sequence against the given instance data.
pub fn compose_shards(
    shards: &[ShardInstance],
    callback: ValidationCallback<'_>,
    data: &InstanceData,
) -> Result<ComposeResult, ComposeError> {
    let mut ctx = ValidationContext {
        inherited: HashMap::new(),
        exposed: HashMap::new(),
        variables: HashSet::new(),
        references: HashSet::new(),
        required: Vec::new(),
        previous_output_type: data.input_type.clone(),
        original_input_type: data.input_type.clone(),
        wire: data.wire.clone(),
        callback,
        on_worker_thread: data.on_worker_thread,
        full_required: data.required.clone(),
    };

    // externally injected variables are visible to every shard
    if let Some(wire) = &ctx.wire {
        for (name, ext) in wire.external_variables() {
            let exposed_type = match &ext.type_info {
                Some(t) => t.clone(),
                None => derive_type(&ext.var.value.borrow(), None)?,
            };
            let mut info = ExposedTypeInfo::mutable(name.clone(), exposed_type);
            info.exposed = ext.var.is_exposed();
            ctx.inherited.insert(name, info);
        }

        // mesh variables participate only when they carry metadata
        if let Some(mesh) = wire.mesh() {
            for (name, info) in mesh.variables_metadata() {
                ctx.inherited.insert(name, info);
            }
        }
    }

    for info in &data.shared {
        ctx.inherited.insert(info.name.clone(), info.clone());
    }

    let count = shards.len();
    for i in 0..count {
        let shard = &shards[i];
        let next = if i + 1 < count { Some(&shards[i + 1]) } else { None };

        match shard.name() {
            // Hard-coded: Input validates the followup against the
            // wire's input, And/Or against the original input.
            "Input" => {
                ctx.previous_output_type = ctx
                    .wire
                    .as_ref()
                    .map(|w| w.input_type())
                    .unwrap_or(TypeInfo::Any);
            }
            "And" | "Or" => {
                ctx.previous_output_type = ctx.original_input_type.clone();
            }
            _ => {
                if let Err(err) = validate_connection(&mut ctx, shard, next) {
                    let verbose = format!(
                        "error validating shard: {}, line: {}, column: {}, wire: {}, error: {}",
                        shard.name(),
                        shard.line(),
                        shard.column(),
                        ctx.wire.as_ref().map(|w| w.name()).unwrap_or("(unwired)"),
                        err
                    );
                    tracing::error!("{}", verbose);
                    return Err(ComposeError::new(verbose));
                }
            }
        }
    }

    let mut result = ComposeResult {
        output_type: ctx.previous_output_type,
        exposed: ctx.exposed.into_values().collect(),
        required: ctx.required,
        flow_stopper: false,
    };

    if let Some(last) = shards.last() {
        result.flow_stopper = is_flow_stopper(last);
    }

    Ok(result)
}

/// Compose a wire: settle its input type, run the pass over its shards,
/// freeze its output type and fire `OnComposed`.
///
/// Re-entrant composition of the same wire is a fatal error, guarded by
/// the wire's `composing` bit.
pub fn compose_wire(
    wire: &Rc<Wire>,
    callback: ValidationCallback<'_>,
    data: &InstanceData,
) -> Result<ComposeResult, ComposeError> {
    if wire
        .composing
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        tracing::error!(wire = wire.name(), "wire is already being composed");
        return Err(ComposeError::new("wire is already being composed"));
    }
    struct ComposingGuard<'a>(&'a Wire);
    impl Drop for ComposingGuard<'_> {
        fn drop(&mut self) {
            self.0.composing.store(false, Ordering::Release);
        }
    }
    let _guard = ComposingGuard(wire);

    // Settle the input type of the wire before composing.
    {
        let shards = wire.shards();
        if let Some(first) = shards.first() {
            if first.name().starts_with("Expect") {
                // the type is checked at runtime, any input is fine
                wire.set_input_type(TypeInfo::Any);
                wire.set_ignore_input_type_check(true);
            } else if !shards.iter().any(|s| s.name() == "Input") {
                let in_types = first.input_types();
                if in_types.len() == 1 && in_types[0] == TypeInfo::None {
                    wire.set_input_type(TypeInfo::None);
                    wire.set_ignore_input_type_check(true);
                } else {
                    wire.set_input_type(data.input_type.clone());
                    wire.set_ignore_input_type_check(false);
                }
            } else {
                wire.set_input_type(data.input_type.clone());
                wire.set_ignore_input_type_check(false);
            }
        } else {
            wire.set_input_type(data.input_type.clone());
            wire.set_ignore_input_type_check(false);
        }
    }

    let mut wire_data = data.clone();
    wire_data.wire = Some(wire.clone());
    wire_data.input_type = wire.input_type();

    let result = {
        let shards = wire.shards();
        compose_shards(&shards, callback, &wire_data)?
    };

    wire.set_output_type(result.output_type.clone());
    wire.set_compose_result(result.clone());
    wire.set_composed_hash(hash_wire(wire));

    emit_event(wire, &WireEvent::Composed);

    Ok(result)
}

/// Validate a parameter assignment against a shard's declared parameter
/// types before applying it.
pub fn validate_set_param(
    shard: &ShardInstance,
    index: usize,
    value: &Var,
    callback: ValidationCallback<'_>,
) -> Result<(), ComposeError> {
    let params = shard.parameters();
    let Some(param) = params.get(index) else {
        let msg = format!("set parameter: parameter index out of range: {}", index);
        (ctx_err(callback, shard, &msg))?;
        return Ok(());
    };

    let value_type = derive_type(value, None)?;
    let matcher = crate::types::TypeMatcher {
        relax_empty_seq_check: true,
        ignore_fixed_seq: true,
        ..Default::default()
    };
    if !param.types.iter().any(|t| matcher.matches(&value_type, t)) {
        let msg = format!(
            "set parameter: value type {} not accepted by parameter '{}' of {}",
            value_type,
            param.name,
            shard.name()
        );
        (ctx_err(callback, shard, &msg))?;
    }
    Ok(())
}

fn ctx_err(
    callback: ValidationCallback<'_>,
    shard: &ShardInstance,
    msg: &str,
) -> Result<(), ComposeError> {
    callback(Some(shard), msg, false)
}
