//! Wires - fiber-hosted pipelines of shards
//!
//! A wire owns an ordered list of shards, a variable scope and (while
//! scheduled) a fiber. The lifecycle is:
//!
//! ```text
//! add_shard*      (edits allowed only while Stopped)
//! prepare(flow)   allocate the fiber; warmup runs, then the fiber suspends
//! start(input)    state := Starting
//! tick_wire       resume the fiber; shards run, possibly suspend or loop
//! stop            flag the context, final resume, cleanup, OnStop
//! ```
//!
//! The fiber body (`run`) iterates the pipeline once - or forever when
//! `looped` - honouring the flow-control states a shard may leave on the
//! context: `Return`, `Restart`, `Stop`, `Error` and `Rebase`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::compose::ComposeResult;
use crate::context::{Context, WireState};
use crate::error::ActivationError;
use crate::fiber::{yield_current, Fiber, DEFAULT_STACK_SIZE};
use crate::mesh::{Flow, Mesh};
use crate::shard::ShardInstance;
use crate::types::TypeInfo;
use crate::value::{Var, VarFlags, Variable, VariableRef, WireTrait};

/// Wire lifecycle states. Ordering matters: `is_running` and the stop
/// path compare ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    Stopped,
    Prepared,
    Starting,
    Iterating,
    IterationEnded,
    Failed,
    Ended,
}

/// Lifecycle notifications delivered to wire listeners and the owning
/// mesh.
#[derive(Debug)]
pub enum WireEvent {
    Start,
    Stop,
    Cleanup,
    Error { shard: Option<String>, message: String },
    Detached { child: Rc<Wire> },
    Composed,
    Update,
}

/// An externally owned variable injected into a wire's scope.
#[derive(Debug, Clone)]
pub struct ExternalVariable {
    pub var: VariableRef,
    pub type_info: Option<TypeInfo>,
}

pub struct Wire {
    name: String,
    id: Cell<u64>,
    debug_id: Cell<u64>,

    looped: Cell<bool>,
    unsafe_: Cell<bool>,
    pure: Cell<bool>,
    is_root: Cell<bool>,
    detached: Cell<bool>,

    pub(crate) state: Cell<RunState>,
    pub(crate) composing: AtomicBool,
    stopping: AtomicBool,
    warmed_up: Cell<bool>,

    input_type: RefCell<TypeInfo>,
    output_type: RefCell<TypeInfo>,
    ignore_input_type_check: Cell<bool>,

    pub(crate) current_input: RefCell<Var>,
    pub(crate) previous_output: RefCell<Var>,
    // preserved over stop/reset, cleared only by the next prepare
    finished_output: RefCell<Var>,
    finished_error: RefCell<String>,

    composed_hash: Cell<Option<u128>>,
    compose_result: RefCell<Option<ComposeResult>>,

    pub(crate) context: RefCell<Option<Rc<Context>>>,
    pub(crate) resumer: RefCell<Option<Rc<Wire>>>,
    mesh: RefCell<Weak<Mesh>>,

    shards: RefCell<Vec<ShardInstance>>,
    variables: RefCell<HashMap<String, VariableRef>>,
    external_variables: RefCell<HashMap<String, ExternalVariable>>,
    traits: RefCell<Vec<WireTrait>>,

    listeners: RefCell<Vec<Box<dyn Fn(&Rc<Wire>, &WireEvent)>>>,

    fiber: RefCell<Option<Fiber>>,
    stack_size: Cell<usize>,

    self_ref: RefCell<Weak<Wire>>,
}

impl Wire {
    pub fn new(name: impl Into<String>) -> Rc<Wire> {
        let wire = Rc::new(Wire {
            name: name.into(),
            id: Cell::new(0),
            debug_id: Cell::new(0),
            looped: Cell::new(false),
            unsafe_: Cell::new(false),
            pure: Cell::new(false),
            is_root: Cell::new(false),
            detached: Cell::new(false),
            state: Cell::new(RunState::Stopped),
            composing: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            warmed_up: Cell::new(false),
            input_type: RefCell::new(TypeInfo::None),
            output_type: RefCell::new(TypeInfo::None),
            ignore_input_type_check: Cell::new(false),
            current_input: RefCell::new(Var::None),
            previous_output: RefCell::new(Var::None),
            finished_output: RefCell::new(Var::None),
            finished_error: RefCell::new(String::new()),
            composed_hash: Cell::new(None),
            compose_result: RefCell::new(None),
            context: RefCell::new(None),
            resumer: RefCell::new(None),
            mesh: RefCell::new(Weak::new()),
            shards: RefCell::new(Vec::new()),
            variables: RefCell::new(HashMap::new()),
            external_variables: RefCell::new(HashMap::new()),
            traits: RefCell::new(Vec::new()),
            listeners: RefCell::new(Vec::new()),
            fiber: RefCell::new(None),
            stack_size: Cell::new(DEFAULT_STACK_SIZE),
            self_ref: RefCell::new(Weak::new()),
        });
        wire.id.set(Rc::as_ptr(&wire) as u64);
        *wire.self_ref.borrow_mut() = Rc::downgrade(&wire);
        tracing::trace!(name = wire.name(), "creating wire");
        wire
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id.get()
    }

    pub fn debug_id(&self) -> u64 {
        self.debug_id.get()
    }

    pub fn set_debug_id(&self, id: u64) {
        self.debug_id.set(id);
    }

    pub fn is_looped(&self) -> bool {
        self.looped.get()
    }

    pub fn set_looped(&self, looped: bool) {
        self.looped.set(looped);
    }

    pub fn is_unsafe(&self) -> bool {
        self.unsafe_.get()
    }

    pub fn set_unsafe(&self, unsafe_: bool) {
        self.unsafe_.set(unsafe_);
    }

    pub fn is_pure(&self) -> bool {
        self.pure.get()
    }

    pub fn set_pure(&self, pure: bool) {
        self.pure.set(pure);
    }

    pub fn is_root(&self) -> bool {
        self.is_root.get()
    }

    pub(crate) fn set_root(&self, root: bool) {
        self.is_root.set(root);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.get()
    }

    pub fn set_detached(&self, detached: bool) {
        self.detached.set(detached);
    }

    pub fn state(&self) -> RunState {
        self.state.get()
    }

    pub fn is_warmed_up(&self) -> bool {
        self.warmed_up.get()
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size.get()
    }

    pub fn set_stack_size(&self, size: usize) {
        self.stack_size.set(size.max(0x1000));
    }

    pub fn input_type(&self) -> TypeInfo {
        self.input_type.borrow().clone()
    }

    pub(crate) fn set_input_type(&self, info: TypeInfo) {
        *self.input_type.borrow_mut() = info;
    }

    pub fn output_type(&self) -> TypeInfo {
        self.output_type.borrow().clone()
    }

    pub(crate) fn set_output_type(&self, info: TypeInfo) {
        *self.output_type.borrow_mut() = info;
    }

    pub fn ignores_input_type_check(&self) -> bool {
        self.ignore_input_type_check.get()
    }

    pub(crate) fn set_ignore_input_type_check(&self, ignore: bool) {
        self.ignore_input_type_check.set(ignore);
    }

    /// Output captured by the last completed run. Preserved across stop;
    /// cleared only by the next `prepare`, so post-stop reads may see the
    /// previous run's data until then.
    pub fn finished_output(&self) -> Var {
        self.finished_output.borrow().clone()
    }

    /// Error recorded by the last failed run; same staleness contract as
    /// `finished_output`.
    pub fn finished_error(&self) -> String {
        self.finished_error.borrow().clone()
    }

    pub fn composed_hash(&self) -> Option<u128> {
        self.composed_hash.get()
    }

    pub(crate) fn set_composed_hash(&self, hash: u128) {
        self.composed_hash.set(Some(hash));
    }

    pub fn compose_result(&self) -> Option<ComposeResult> {
        self.compose_result.borrow().clone()
    }

    pub(crate) fn set_compose_result(&self, result: ComposeResult) {
        *self.compose_result.borrow_mut() = Some(result);
    }

    pub fn context(&self) -> Option<Rc<Context>> {
        self.context.borrow().clone()
    }

    /// Input handed to the current (or last) run.
    pub fn current_input(&self) -> Var {
        self.current_input.borrow().clone()
    }

    pub fn mesh(&self) -> Option<Rc<Mesh>> {
        self.mesh.borrow().upgrade()
    }

    pub(crate) fn set_mesh(&self, mesh: &Rc<Mesh>) {
        *self.mesh.borrow_mut() = Rc::downgrade(mesh);
    }

    pub(crate) fn clear_mesh(&self) {
        *self.mesh.borrow_mut() = Weak::new();
    }

    pub fn set_resumer(&self, resumer: Option<Rc<Wire>>) {
        *self.resumer.borrow_mut() = resumer;
    }

    /// Append a shard to the pipeline. Edits are only allowed while the
    /// wire is stopped.
    pub fn add_shard(&self, shard: ShardInstance) {
        assert_eq!(
            self.state.get(),
            RunState::Stopped,
            "shards can only be added to a stopped wire"
        );
        self.shards.borrow_mut().push(shard);
    }

    /// Remove a shard by identity.
    pub fn remove_shard(&self, shard: &ShardInstance) -> bool {
        assert_eq!(
            self.state.get(),
            RunState::Stopped,
            "shards can only be removed from a stopped wire"
        );
        let mut shards = self.shards.borrow_mut();
        match shards.iter().position(|s| s.addr() == shard.addr()) {
            Some(idx) => {
                shards.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn shards(&self) -> std::cell::Ref<'_, Vec<ShardInstance>> {
        self.shards.borrow()
    }

    pub fn add_trait(&self, t: WireTrait) {
        self.traits.borrow_mut().push(t);
    }

    pub fn traits(&self) -> Vec<WireTrait> {
        self.traits.borrow().clone()
    }

    pub fn get_variable_if_exists(&self, name: &str) -> Option<VariableRef> {
        self.variables.borrow().get(name).cloned()
    }

    pub fn get_or_create_variable(&self, name: &str) -> VariableRef {
        self.variables
            .borrow_mut()
            .entry(name.to_string())
            .or_insert_with(|| Rc::new(Variable::new(name)))
            .clone()
    }

    pub fn variables(&self) -> Vec<(String, VariableRef)> {
        self.variables
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn get_external_variable_if_exists(&self, name: &str) -> Option<VariableRef> {
        self.external_variables.borrow().get(name).map(|e| e.var.clone())
    }

    /// Inject an externally owned variable; its lifetime is the
    /// embedder's responsibility.
    pub fn add_external_variable(
        &self,
        name: impl Into<String>,
        var: VariableRef,
        type_info: Option<TypeInfo>,
    ) {
        var.flags.set(var.flags.get() | VarFlags::EXTERNAL);
        self.external_variables
            .borrow_mut()
            .insert(name.into(), ExternalVariable { var, type_info });
    }

    pub fn remove_external_variable(&self, name: &str) {
        self.external_variables.borrow_mut().remove(name);
    }

    pub fn external_variables(&self) -> Vec<(String, ExternalVariable)> {
        self.external_variables
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Subscribe to lifecycle events of this wire.
    pub fn on_event(&self, listener: impl Fn(&Rc<Wire>, &WireEvent) + 'static) {
        self.listeners.borrow_mut().push(Box::new(listener));
    }

    /// Strong handle to this wire, if any still exists.
    pub fn self_rc(&self) -> Option<Rc<Wire>> {
        self.self_ref.borrow().upgrade()
    }
}

impl std::fmt::Debug for Wire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wire")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("shards", &self.shards.borrow().len())
            .finish()
    }
}

/// Deliver an event to the wire's listeners and its mesh.
pub fn emit_event(wire: &Rc<Wire>, event: &WireEvent) {
    for listener in wire.listeners.borrow().iter() {
        listener(wire, event);
    }
    if let Some(mesh) = wire.mesh() {
        mesh.notify_wire_event(wire, event);
    }
}

/// Announce that `child` was detached from `parent` onto its own fiber.
/// Shards that branch wires call this right after scheduling the child.
pub fn emit_detached(parent: &Rc<Wire>, child: &Rc<Wire>) {
    child.set_detached(true);
    emit_event(parent, &WireEvent::Detached { child: child.clone() });
}

pub fn is_running(wire: &Wire) -> bool {
    let state = wire.state.get();
    state >= RunState::Starting && state <= RunState::IterationEnded
}

pub fn has_ended(wire: &Wire) -> bool {
    wire.state.get() > RunState::IterationEnded
}

pub fn is_canceled(context: &Context) -> bool {
    context.should_stop()
}

/// Warm up every shard under the given context. On failure the already
/// warmed prefix is cleaned up and the error propagates.
pub fn warmup_wire(wire: &Rc<Wire>, context: &Context) -> Result<(), ActivationError> {
    if wire.warmed_up.get() {
        return Ok(());
    }
    let mut failure: Option<(String, ActivationError)> = None;
    {
        let shards = wire.shards.borrow();
        for (idx, shard) in shards.iter().enumerate() {
            if let Err(err) = shard.warmup(context) {
                tracing::error!(
                    wire = wire.name(),
                    shard = shard.name(),
                    error = %err,
                    "shard warmup failed"
                );
                for done in shards[..idx].iter().rev() {
                    if let Err(cleanup_err) = done.cleanup(Some(context)) {
                        tracing::error!(
                            shard = done.name(),
                            error = %cleanup_err,
                            "cleanup failed after warmup error"
                        );
                    }
                }
                failure = Some((shard.name().to_string(), err));
                break;
            }
        }
    }
    if let Some((shard_name, err)) = failure {
        emit_event(
            wire,
            &WireEvent::Error { shard: Some(shard_name), message: err.message.clone() },
        );
        return Err(err);
    }
    wire.warmed_up.set(true);
    Ok(())
}

/// Clean up all shards in reverse order (best effort: later cleanups run
/// even if earlier ones fail), release the variable scope and detach
/// from the mesh.
pub fn cleanup_wire(wire: &Rc<Wire>, force: bool, context: Option<&Context>) {
    if !wire.warmed_up.get() && !force {
        return;
    }

    {
        let shards = wire.shards.borrow();
        for shard in shards.iter().rev() {
            if let Err(err) = shard.cleanup(context) {
                tracing::error!(
                    wire = wire.name(),
                    shard = shard.name(),
                    error = %err,
                    "shard cleanup error"
                );
            }
        }
    }

    wire.warmed_up.set(false);

    // drop the owned scope; external variables stay with their owners
    wire.variables.borrow_mut().clear();

    emit_event(wire, &WireEvent::Cleanup);

    if let Some(mesh) = wire.mesh() {
        mesh.wire_cleaned_up(wire);
    }
    wire.clear_mesh();
}

/// Allocate the wire's fiber and run it up to its first suspension
/// point, which includes shard warmup. Check `wire.state()` afterwards:
/// a warmup failure leaves the wire `Failed`.
pub fn prepare(wire: &Rc<Wire>, flow: Option<Rc<Flow>>) {
    assert!(
        !wire.fiber.borrow().as_ref().map(Fiber::is_alive).unwrap_or(false),
        "wire already prepared"
    );
    let mut fiber = Fiber::new();
    let runner_wire = wire.clone();
    fiber.init(wire.stack_size(), move || run(&runner_wire, flow));
    *wire.fiber.borrow_mut() = Some(fiber);
}

/// Hand the wire its input and mark it ready for ticking.
pub fn start(wire: &Rc<Wire>, input: Var) {
    if wire.state.get() != RunState::Prepared {
        tracing::error!(wire = wire.name(), "attempted to start a wire not ready for running");
        return;
    }
    if !wire.fiber.borrow().as_ref().map(Fiber::is_alive).unwrap_or(false) {
        return;
    }
    *wire.current_input.borrow_mut() = input;
    wire.state.set(RunState::Starting);
}

/// Resume the wire if it is due. Mesh-thread tasks queued by the fiber
/// run here, between two resumes, without yielding back to the caller.
pub fn tick_wire(wire: &Rc<Wire>, now: Instant) {
    tick_impl(wire, now, false);
}

pub(crate) fn tick_cleanup(wire: &Rc<Wire>) {
    tick_impl(wire, Instant::now(), true);
}

fn tick_impl(wire: &Rc<Wire>, now: Instant, cleanup_context: bool) {
    loop {
        let context = wire.context.borrow().clone();
        let can_run = if cleanup_context {
            true
        } else {
            let due = context
                .as_ref()
                .map(|c| c.next.get().map(|deadline| now >= deadline).unwrap_or(true))
                .unwrap_or(false);
            let last = context.as_ref().map(|c| c.on_last_resume.get()).unwrap_or(false);
            (is_running(wire) && due) || last
        };
        if !can_run {
            return;
        }

        {
            let mut fiber = wire.fiber.borrow_mut();
            match fiber.as_mut() {
                Some(f) if f.is_alive() => f.resume(),
                _ => return,
            }
        }

        // If the fiber queued a mesh-thread task, run it and resume the
        // fiber again instead of yielding to the caller.
        let task = {
            let context = wire.context.borrow().clone();
            match context {
                Some(ctx) => ctx.mesh_thread_task.borrow_mut().take(),
                None => None,
            }
        };
        match task {
            Some(task) => task(),
            None => return,
        }
    }
}

/// Cooperatively stop a wire: flag its context, resume it once so it
/// walks the cleanup path, and reclaim the fiber. Returns whether the
/// wire had ended by itself.
pub fn stop(wire: &Rc<Wire>) -> bool {
    stop_ex(wire, None, None)
}

pub fn stop_ex(
    wire: &Rc<Wire>,
    mut result: Option<&mut Var>,
    current_context: Option<&Context>,
) -> bool {
    if wire.state.get() == RunState::Stopped {
        if let Some(out) = result.as_deref_mut() {
            out.clone_from(&wire.finished_output.borrow());
        }
        return true;
    }

    // re-entrant stop folds into the in-flight one
    if wire.stopping.swap(true, Ordering::AcqRel) {
        return true;
    }
    struct StoppingGuard<'a>(&'a Wire);
    impl Drop for StoppingGuard<'_> {
        fn drop(&mut self) {
            self.0.stopping.store(false, Ordering::Release);
        }
    }
    let _guard = StoppingGuard(wire);

    tracing::trace!(wire = wire.name(), state = ?wire.state.get(), "stopping wire");

    let fiber_alive = wire.fiber.borrow().as_ref().map(Fiber::is_alive).unwrap_or(false);
    if fiber_alive {
        let state = wire.state.get();
        if state > RunState::Stopped && state < RunState::Failed {
            let context = wire.context.borrow().clone();
            if let Some(context) = context {
                context.stop_flow(Var::None);
                context.on_last_resume.set(true);

                let same_context = current_context
                    .map(|c| std::ptr::eq(c as *const Context, Rc::as_ptr(&context)))
                    .unwrap_or(false);
                if same_context {
                    tracing::warn!(
                        wire = wire.name(),
                        "trying to stop a wire from the same context it's running in"
                    );
                } else {
                    tick_cleanup(wire);
                }
            }
        }
    } else if wire.state.get() < RunState::Failed {
        // never ran inside a fiber; cleanup inline (a completed run has
        // already walked its own cleanup path)
        cleanup_wire(wire, true, None);
        emit_event(wire, &WireEvent::Stop);
    }
    *wire.fiber.borrow_mut() = None;

    let ended = wire.state.get() == RunState::Ended;
    wire.state.set(RunState::Stopped);
    *wire.current_input.borrow_mut() = Var::None;

    if let Some(out) = result {
        out.clone_from(&wire.finished_output.borrow());
    }

    ended
}

/// Outcome of one `run_wire` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunWireOutputState {
    Running,
    Restarted,
    Returned,
    Stopped,
    Failed,
}

#[derive(Debug)]
pub struct RunWireOutput {
    pub output: Var,
    pub state: RunWireOutputState,
}

/// Activate a slice of shards sequentially, forwarding each output as
/// the next input. Flow-control states left on the context decide the
/// early exits; `handles_return` lets conditional containers absorb
/// `Return` instead of propagating it.
pub fn activate_shards(
    shards: &[ShardInstance],
    context: &Context,
    wire_input: &Var,
    handles_return: bool,
) -> (WireState, Var) {
    let mut input = wire_input.clone();
    let mut output = Var::None;

    for shard in shards {
        context.bump_step();
        match shard.activate(context, &input) {
            Ok(out) => output = out,
            Err(err) => {
                if !context.failed() {
                    context.cancel_flow(format!("{}: {}", shard.name(), err.message));
                }
            }
        }

        if !context.should_continue() {
            match context.state() {
                WireState::Return => {
                    if handles_return {
                        context.continue_flow();
                    }
                    return (WireState::Return, output);
                }
                WireState::Error => {
                    tracing::error!(
                        shard = shard.name(),
                        error = %context.error_message(),
                        line = shard.line(),
                        column = shard.column(),
                        "shard activation error"
                    );
                    return (WireState::Error, output);
                }
                WireState::Stop | WireState::Restart => return (context.state(), output),
                WireState::Rebase => {
                    // reset local input back to the wire input
                    input = wire_input.clone();
                    context.continue_flow();
                    continue;
                }
                WireState::Continue => {}
            }
        }

        input = output.clone();
    }

    (WireState::Continue, output)
}

/// One iteration of a wire's pipeline under an existing context.
pub fn run_wire(wire: &Rc<Wire>, context: &Context, wire_input: &Var) -> RunWireOutput {
    *wire.previous_output.borrow_mut() = Var::None;
    *wire.current_input.borrow_mut() = wire_input.clone();
    wire.state.set(RunState::Iterating);

    emit_event(wire, &WireEvent::Update);

    let (state, output) = {
        let shards = wire.shards.borrow();
        activate_shards(&shards, context, wire_input, false)
    };
    *wire.previous_output.borrow_mut() = output.clone();
    wire.state.set(RunState::IterationEnded);

    match state {
        WireState::Return => RunWireOutput {
            output: context.flow_storage(),
            state: RunWireOutputState::Returned,
        },
        WireState::Restart => RunWireOutput {
            output: context.flow_storage(),
            state: RunWireOutputState::Restarted,
        },
        WireState::Error => {
            debug_assert!(context.failed());
            emit_event(
                wire,
                &WireEvent::Error { shard: None, message: context.error_message() },
            );
            RunWireOutput { output, state: RunWireOutputState::Failed }
        }
        WireState::Stop => {
            debug_assert!(!context.failed());
            RunWireOutput {
                output: context.flow_storage(),
                state: RunWireOutputState::Stopped,
            }
        }
        WireState::Rebase => {
            // handled inside activate_shards; reaching here is a bug
            unreachable!("rebase must not escape shard activation")
        }
        WireState::Continue => RunWireOutput { output, state: RunWireOutputState::Running },
    }
}

/// Execute a sub-wire inline within the caller's fiber: push it onto the
/// context's wire stack, run one pass, pop.
pub fn run_sub_wire(sub: &Rc<Wire>, context: &Context, input: &Var) -> RunWireOutput {
    context.push_wire(sub.clone());
    let result = run_wire(sub, context, input);
    context.pop_wire();
    result
}

/// The fiber body: warmup, suspend, iterate, capture results, cleanup.
pub(crate) fn run(wire: &Rc<Wire>, flow: Option<Rc<Flow>>) {
    tracing::trace!(wire = wire.name(), "wire rolling");

    let mut running = true;
    let mut failed = false;

    // Reset state; finished output/error survive until here.
    wire.state.set(RunState::Prepared);
    *wire.finished_output.borrow_mut() = Var::None;
    wire.finished_error.borrow_mut().clear();

    // a pre-set context means we were started from another fiber
    let parent = wire.context.borrow().clone();
    let context = Rc::new(Context::new(wire.clone(), parent));
    context.has_continuation.set(true);
    *context.flow.borrow_mut() = flow;
    *wire.context.borrow_mut() = Some(context.clone());

    let warmed = match warmup_wire(wire, &context) {
        Ok(()) => true,
        Err(_) => {
            wire.state.set(RunState::Failed);
            failed = true;
            tracing::error!(wire = wire.name(), "wire warmup failed");
            false
        }
    };

    if warmed {
        // We pre-rolled our fiber; suspend here before actually starting
        // so the scheduler decides when the first iteration runs.
        yield_current();

        if context.should_stop() {
            tracing::debug!(wire = wire.name(), "wire stopped before starting");
        } else {
            emit_event(wire, &WireEvent::Start);

            while running {
                running = wire.is_looped();

                context.continue_flow();

                let input = wire.current_input.borrow().clone();
                let run_res = run_wire(wire, &context, &input);
                match run_res.state {
                    RunWireOutputState::Failed => {
                        tracing::debug!(wire = wire.name(), "wire failed");
                        wire.state.set(RunState::Failed);
                        failed = true;
                        context.stop_flow(run_res.output);
                        break;
                    }
                    RunWireOutputState::Stopped | RunWireOutputState::Returned => {
                        tracing::debug!(wire = wire.name(), "wire stopped");
                        context.stop_flow(run_res.output.clone());
                        // the actual output lives in the flow storage now
                        *wire.previous_output.borrow_mut() = run_res.output;
                        break;
                    }
                    RunWireOutputState::Restarted => {
                        // restart overwrites the current input on purpose
                        *wire.current_input.borrow_mut() = context.flow_storage();
                        running = true;
                    }
                    RunWireOutputState::Running => {}
                }

                if !wire.is_unsafe() && running {
                    // yield anyway every iteration so the mesh can tick
                    // other wires
                    context.next.set(None);
                    yield_current();

                    if context.should_stop() {
                        tracing::debug!(wire = wire.name(), "wire aborted on resume");
                        break;
                    }
                }
            }
        }
    }

    *wire.finished_output.borrow_mut() = wire.previous_output.borrow().clone();

    if failed || context.failed() {
        let mut message = context.error_message();
        if message.is_empty() {
            message = "Generic error".to_string();
        }
        *wire.finished_error.borrow_mut() = message.clone();
        tracing::debug!(wire = wire.name(), error = %message, "wire failed with error");

        // a failing wire also cancels the wire that resumed it
        if let Some(resumer) = wire.resumer.borrow().as_ref() {
            if let Some(resumer_ctx) = resumer.context() {
                resumer_ctx.cancel_flow(message);
            }
        }
    }

    if let Some(resumer) = wire.resumer.borrow_mut().take() {
        tracing::trace!(wire = wire.name(), resumer = resumer.name(), "wire ending, resuming parent");
        if let Some(flow) = context.flow.borrow().as_ref() {
            *flow.wire.borrow_mut() = resumer;
        }
    }

    // run cleanup on all the shards with the stop state set
    context.stop_flow(wire.previous_output.borrow().clone());
    context.on_last_resume.set(true);
    cleanup_wire(wire, true, Some(&context));
    context.on_last_resume.set(false);

    if wire.state.get() != RunState::Failed {
        wire.state.set(RunState::Ended);
    }

    emit_event(wire, &WireEvent::Stop);

    // the context dies with this stack frame
    context.has_continuation.set(false);
    *wire.context.borrow_mut() = None;

    tracing::trace!(wire = wire.name(), "wire ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::suspend;
    use crate::error::ActivationError;
    use crate::shard::Shard;

    struct ConstInt(i64);

    impl Shard for ConstInt {
        fn name(&self) -> &'static str {
            "TestConstInt"
        }

        fn input_types(&self) -> Vec<TypeInfo> {
            vec![TypeInfo::None]
        }

        fn output_types(&self) -> Vec<TypeInfo> {
            vec![TypeInfo::Int]
        }

        fn activate(&mut self, _context: &Context, _input: &Var) -> Result<Var, ActivationError> {
            Ok(Var::Int(self.0))
        }
    }

    struct AddOne;

    impl Shard for AddOne {
        fn name(&self) -> &'static str {
            "TestAddOne"
        }

        fn input_types(&self) -> Vec<TypeInfo> {
            vec![TypeInfo::Int]
        }

        fn output_types(&self) -> Vec<TypeInfo> {
            vec![TypeInfo::Int]
        }

        fn activate(&mut self, _context: &Context, input: &Var) -> Result<Var, ActivationError> {
            match input {
                Var::Int(v) => Ok(Var::Int(v + 1)),
                other => Err(ActivationError::new(format!("expected int, got {}", other))),
            }
        }
    }

    struct FailShard;

    impl Shard for FailShard {
        fn name(&self) -> &'static str {
            "TestFail"
        }

        fn input_types(&self) -> Vec<TypeInfo> {
            vec![TypeInfo::Any]
        }

        fn output_types(&self) -> Vec<TypeInfo> {
            vec![TypeInfo::Any]
        }

        fn activate(&mut self, _context: &Context, _input: &Var) -> Result<Var, ActivationError> {
            Err(ActivationError::new("deliberate failure"))
        }
    }

    struct Sleeper(f64);

    impl Shard for Sleeper {
        fn name(&self) -> &'static str {
            "TestSleeper"
        }

        fn input_types(&self) -> Vec<TypeInfo> {
            vec![TypeInfo::Any]
        }

        fn output_types(&self) -> Vec<TypeInfo> {
            vec![TypeInfo::Any]
        }

        fn activate(&mut self, context: &Context, input: &Var) -> Result<Var, ActivationError> {
            if suspend(context, self.0)? != WireState::Continue {
                return Ok(Var::None);
            }
            Ok(input.clone())
        }
    }

    fn drive_to_end(wire: &Rc<Wire>) {
        prepare(wire, None);
        start(wire, Var::None);
        for _ in 0..1000 {
            if !is_running(wire) {
                break;
            }
            tick_wire(wire, Instant::now());
        }
        stop(wire);
    }

    #[test]
    fn test_simple_wire_runs_to_end() {
        let wire = Wire::new("simple");
        wire.add_shard(ShardInstance::new(ConstInt(41)));
        wire.add_shard(ShardInstance::new(AddOne));
        drive_to_end(&wire);
        assert_eq!(wire.finished_output(), Var::Int(42));
        assert_eq!(wire.state(), RunState::Stopped);
        assert!(wire.finished_error().is_empty());
    }

    #[test]
    fn test_failing_wire_records_error_with_shard_name() {
        let wire = Wire::new("failing");
        wire.add_shard(ShardInstance::new(ConstInt(1)));
        wire.add_shard(ShardInstance::new(FailShard));
        prepare(&wire, None);
        start(&wire, Var::None);
        tick_wire(&wire, Instant::now());
        assert_eq!(wire.state(), RunState::Failed);
        assert!(wire.finished_error().contains("TestFail"));
        assert!(wire.finished_error().contains("deliberate failure"));
        stop(&wire);
        assert_eq!(wire.state(), RunState::Stopped);
    }

    #[test]
    fn test_suspended_wire_stays_iterating() {
        let wire = Wire::new("sleepy");
        wire.add_shard(ShardInstance::new(Sleeper(10.0)));
        prepare(&wire, None);
        start(&wire, Var::None);
        tick_wire(&wire, Instant::now());
        // deadline far in the future: still running, not finished
        assert!(is_running(&wire));
        // ticking again before the deadline is a no-op
        tick_wire(&wire, Instant::now());
        assert!(is_running(&wire));
        stop(&wire);
        assert_eq!(wire.state(), RunState::Stopped);
    }

    #[test]
    fn test_looped_wire_iterates_until_stopped() {
        let wire = Wire::new("looper");
        wire.set_looped(true);
        wire.add_shard(ShardInstance::new(ConstInt(7)));
        prepare(&wire, None);
        start(&wire, Var::None);
        for _ in 0..5 {
            tick_wire(&wire, Instant::now());
            assert!(is_running(&wire));
        }
        stop(&wire);
        assert_eq!(wire.state(), RunState::Stopped);
        assert_eq!(wire.finished_output(), Var::Int(7));
    }

    #[test]
    fn test_stop_idempotent_and_preserves_finished_output() {
        let wire = Wire::new("idem");
        wire.add_shard(ShardInstance::new(ConstInt(3)));
        drive_to_end(&wire);
        assert_eq!(wire.finished_output(), Var::Int(3));
        // stopping again is a no-op that still reports the output
        let mut out = Var::None;
        assert!(stop_ex(&wire, Some(&mut out), None));
        assert_eq!(out, Var::Int(3));
    }

    #[test]
    fn test_events_fire_in_order() {
        use std::cell::RefCell as StdRefCell;
        let events: Rc<StdRefCell<Vec<String>>> = Rc::new(StdRefCell::new(Vec::new()));

        let wire = Wire::new("events");
        wire.add_shard(ShardInstance::new(ConstInt(1)));
        let sink = events.clone();
        wire.on_event(move |_, event| {
            let tag = match event {
                WireEvent::Start => "start",
                WireEvent::Stop => "stop",
                WireEvent::Cleanup => "cleanup",
                WireEvent::Update => "update",
                WireEvent::Composed => "composed",
                WireEvent::Error { .. } => "error",
                WireEvent::Detached { .. } => "detached",
            };
            sink.borrow_mut().push(tag.to_string());
        });

        drive_to_end(&wire);
        let seen = events.borrow();
        assert_eq!(&*seen, &["start", "update", "cleanup", "stop"]);
    }

    #[test]
    fn test_variables_cleared_on_cleanup() {
        let wire = Wire::new("vars");
        let slot = wire.get_or_create_variable("x");
        slot.set(&Var::Int(5));
        wire.add_shard(ShardInstance::new(ConstInt(0)));
        drive_to_end(&wire);
        assert!(wire.get_variable_if_exists("x").is_none());
    }

    #[test]
    fn test_add_shard_rejected_while_running() {
        let wire = Wire::new("guard");
        wire.add_shard(ShardInstance::new(Sleeper(10.0)));
        prepare(&wire, None);
        start(&wire, Var::None);
        tick_wire(&wire, Instant::now());
        assert!(is_running(&wire));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            wire.add_shard(ShardInstance::new(ConstInt(1)));
        }));
        assert!(result.is_err());
        stop(&wire);
    }
}
