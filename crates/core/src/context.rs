//! Per-activation flow-control context
//!
//! A `Context` lives for one run of a wire's fiber and is shared (`Rc`)
//! between the fiber body and the scheduler: the mesh reads the resume
//! deadline and sets the stop flags while the fiber is suspended. All
//! flow-control state is interior-mutable for that reason.
//!
//! Variable resolution (`reference_variable`) also lives here because it
//! walks the context's wire stack before falling back to the mesh scope.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::ActivationError;
use crate::fiber::yield_current;
use crate::value::{Var, VarFlags, Variable, VariableRef};
use crate::wire::Wire;

/// Flow-control state of a running wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireState {
    Continue,
    Return,
    Restart,
    Stop,
    Error,
    Rebase,
}

/// Snapshot of the mutable flow state, used by shards that run nested
/// wires and need to restore the caller's state afterwards.
#[derive(Debug)]
pub struct StateSnapshot {
    pub state: WireState,
    pub flow_storage: Var,
    pub error_message: String,
}

pub struct Context {
    /// Root wire of this fiber; bottom of `wire_stack`.
    main: Option<Rc<Wire>>,
    /// Parent context when this fiber was started from another fiber.
    parent: Option<Rc<Context>>,
    wire_stack: RefCell<Vec<Rc<Wire>>>,

    state: Cell<WireState>,
    flow_storage: RefCell<Var>,
    error_message: RefCell<String>,

    /// Earliest instant the scheduler should resume this fiber; `None`
    /// means resume on the next tick.
    pub(crate) next: Cell<Option<Instant>>,
    /// The next resume is the final cleanup pass.
    pub(crate) on_last_resume: Cell<bool>,
    /// Set while the context's work is offloaded to a TidePool worker.
    pub(crate) on_worker_thread: Cell<bool>,
    /// Whether a live fiber is carrying this context.
    pub(crate) has_continuation: Cell<bool>,

    step_counter: Cell<u64>,

    /// Action to run on the mesh thread between two resumes of this
    /// fiber; see `call_on_mesh_thread`.
    pub(crate) mesh_thread_task: RefCell<Option<Box<dyn FnOnce()>>>,

    /// The flow record hosting this run, when the wire is scheduled on a
    /// mesh. A finishing wire hands the flow over to its resumer.
    pub(crate) flow: RefCell<Option<Rc<crate::mesh::Flow>>>,

    /// Reentrant anonymous storage keyed by string, resolved upward
    /// through parent contexts.
    any_storage: RefCell<HashMap<String, Rc<dyn Any>>>,
}

impl Context {
    pub fn new(starter: Rc<Wire>, parent: Option<Rc<Context>>) -> Self {
        let ctx = Self {
            main: Some(starter.clone()),
            parent,
            wire_stack: RefCell::new(vec![starter]),
            state: Cell::new(WireState::Continue),
            flow_storage: RefCell::new(Var::None),
            error_message: RefCell::new(String::new()),
            next: Cell::new(None),
            on_last_resume: Cell::new(false),
            on_worker_thread: Cell::new(false),
            has_continuation: Cell::new(false),
            step_counter: Cell::new(0),
            mesh_thread_task: RefCell::new(None),
            flow: RefCell::new(None),
            any_storage: RefCell::new(HashMap::new()),
        };
        if let Some(parent) = &ctx.parent {
            // nested fibers keep the caller's wire stack visible
            let mut stack = parent.wire_stack.borrow().clone();
            stack.extend(ctx.wire_stack.borrow().iter().cloned());
            *ctx.wire_stack.borrow_mut() = stack;
        }
        ctx
    }

    /// A context with no wire and no fiber, for driving shards outside a
    /// mesh (tests, tooling).
    pub fn detached() -> Self {
        Self {
            main: None,
            parent: None,
            wire_stack: RefCell::new(Vec::new()),
            state: Cell::new(WireState::Continue),
            flow_storage: RefCell::new(Var::None),
            error_message: RefCell::new(String::new()),
            next: Cell::new(None),
            on_last_resume: Cell::new(false),
            on_worker_thread: Cell::new(false),
            has_continuation: Cell::new(false),
            step_counter: Cell::new(0),
            mesh_thread_task: RefCell::new(None),
            flow: RefCell::new(None),
            any_storage: RefCell::new(HashMap::new()),
        }
    }

    pub fn root_wire(&self) -> Option<Rc<Wire>> {
        self.wire_stack.borrow().first().cloned()
    }

    pub fn current_wire(&self) -> Option<Rc<Wire>> {
        self.wire_stack.borrow().last().cloned()
    }

    pub fn main_wire(&self) -> Option<Rc<Wire>> {
        self.main.clone()
    }

    pub fn parent(&self) -> Option<Rc<Context>> {
        self.parent.clone()
    }

    pub(crate) fn push_wire(&self, wire: Rc<Wire>) {
        self.wire_stack.borrow_mut().push(wire);
    }

    pub(crate) fn pop_wire(&self) {
        self.wire_stack.borrow_mut().pop();
    }

    pub fn stop_flow(&self, last_value: Var) {
        self.state.set(WireState::Stop);
        *self.flow_storage.borrow_mut() = last_value;
    }

    pub fn restart_flow(&self, last_value: Var) {
        self.state.set(WireState::Restart);
        *self.flow_storage.borrow_mut() = last_value;
    }

    pub fn return_flow(&self, last_value: Var) {
        self.state.set(WireState::Return);
        *self.flow_storage.borrow_mut() = last_value;
    }

    pub fn cancel_flow(&self, message: impl Into<String>) {
        self.state.set(WireState::Error);
        *self.error_message.borrow_mut() = message.into();
    }

    pub fn rebase_flow(&self) {
        self.state.set(WireState::Rebase);
    }

    pub fn continue_flow(&self) {
        self.state.set(WireState::Continue);
    }

    pub fn should_continue(&self) -> bool {
        self.state.get() == WireState::Continue
    }

    pub fn should_return(&self) -> bool {
        self.state.get() == WireState::Return
    }

    pub fn should_stop(&self) -> bool {
        self.state.get() == WireState::Stop
    }

    pub fn failed(&self) -> bool {
        self.state.get() == WireState::Error
    }

    pub fn state(&self) -> WireState {
        self.state.get()
    }

    pub fn flow_storage(&self) -> Var {
        self.flow_storage.borrow().clone()
    }

    pub fn error_message(&self) -> String {
        self.error_message.borrow().clone()
    }

    pub fn on_last_resume(&self) -> bool {
        self.on_last_resume.get()
    }

    pub fn on_worker_thread(&self) -> bool {
        self.on_worker_thread.get()
    }

    pub fn step_counter(&self) -> u64 {
        self.step_counter.get()
    }

    pub(crate) fn bump_step(&self) {
        self.step_counter.set(self.step_counter.get().wrapping_add(1));
    }

    pub fn take_state_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.state.get(),
            flow_storage: std::mem::take(&mut *self.flow_storage.borrow_mut()),
            error_message: std::mem::take(&mut *self.error_message.borrow_mut()),
        }
    }

    pub fn restore_state_snapshot(&self, snapshot: StateSnapshot) {
        self.state.set(snapshot.state);
        *self.flow_storage.borrow_mut() = snapshot.flow_storage;
        *self.error_message.borrow_mut() = snapshot.error_message;
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("state", &self.state.get())
            .field("wires", &self.wire_stack.borrow().len())
            .field("on_last_resume", &self.on_last_resume.get())
            .finish()
    }
}

/// Suspend the current fiber for at least `seconds` (non-positive means
/// "until the next tick"). Returns the flow state observed on resume.
///
/// Suspending a context that is not in `Continue` is a contract
/// violation, as is suspending without a live fiber.
pub fn suspend(context: &Context, seconds: f64) -> Result<WireState, ActivationError> {
    if !context.should_continue() {
        return Err(ActivationError::new(format!(
            "trying to suspend a context that is not running, state: {:?}",
            context.state()
        )));
    }
    if !context.has_continuation.get() {
        return Err(ActivationError::new("trying to suspend a context without a fiber"));
    }

    if seconds <= 0.0 {
        context.next.set(None);
    } else {
        context.next.set(Some(Instant::now() + Duration::from_secs_f64(seconds)));
    }

    yield_current();

    Ok(context.state())
}

/// Resolve a variable by name.
///
/// Lookup order: wire stack from innermost to outermost (own variables,
/// then external variables; a `pure` wire stops the walk), then the mesh
/// scope, then the mesh's injected refs. If nothing matches, the
/// variable is created in the current (innermost) wire.
///
/// The returned handle keeps the slot alive; dropping it is the release.
pub fn reference_variable(context: &Context, name: &str) -> VariableRef {
    {
        let stack = context.wire_stack.borrow();
        for wire in stack.iter().rev() {
            if let Some(var) = wire.get_variable_if_exists(name) {
                return var;
            }
            if let Some(ext) = wire.get_external_variable_if_exists(name) {
                debug_assert!(ext.is_external());
                return ext;
            }
            if wire.is_pure() {
                // names must not leak past a pure wire boundary
                return create_in_current(context, name);
            }
        }
    }

    if let Some(main) = &context.main {
        if let Some(mesh) = main.mesh() {
            if let Some(var) = mesh.get_variable_if_exists(name) {
                return var;
            }
            if let Some(var) = mesh.get_ref_if_exists(name) {
                tracing::trace!(name, "referencing a parent mesh variable");
                return var;
            }
        }
    }

    create_in_current(context, name)
}

fn create_in_current(context: &Context, name: &str) -> VariableRef {
    let wire = context
        .current_wire()
        .expect("reference_variable needs at least one wire on the stack");
    tracing::trace!(wire = wire.name(), name, "creating a variable");
    wire.get_or_create_variable(name)
}

/// Release a variable handle obtained from `reference_variable`. The
/// slot's storage is destroyed when the owning scope is also gone.
pub fn release_variable(variable: VariableRef) {
    drop(variable);
}

/// Look up (or create at the root) a typed storage entry shared across a
/// context chain. Creation happens in the outermost context so nested
/// activations observe one shared instance.
pub fn get_or_create_any_storage<T, F>(context: &Rc<Context>, key: &str, init: F) -> Rc<T>
where
    T: 'static,
    F: FnOnce() -> T,
{
    // walk to the root, checking each level on the way
    let mut current = context.clone();
    loop {
        if let Some(existing) = current.any_storage.borrow().get(key) {
            return existing
                .clone()
                .downcast::<T>()
                .expect("any-storage type mismatch for key");
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }

    let created: Rc<T> = Rc::new(init());
    current
        .any_storage
        .borrow_mut()
        .insert(key.to_string(), created.clone());
    created
}

/// Mark a mesh-scope variable slot as external, with lifetime managed by
/// the embedder.
pub fn mark_external(variable: &Variable) {
    variable.flags.set(variable.flags.get() | VarFlags::EXTERNAL);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_state_transitions() {
        let ctx = Context::detached();
        assert!(ctx.should_continue());

        ctx.return_flow(Var::Int(1));
        assert!(ctx.should_return());
        assert_eq!(ctx.flow_storage(), Var::Int(1));

        ctx.continue_flow();
        assert!(ctx.should_continue());

        ctx.stop_flow(Var::Int(2));
        assert!(ctx.should_stop());

        ctx.cancel_flow("broken");
        assert!(ctx.failed());
        assert_eq!(ctx.error_message(), "broken");

        ctx.rebase_flow();
        assert_eq!(ctx.state(), WireState::Rebase);
    }

    #[test]
    fn test_suspend_rejects_non_continue_context() {
        let ctx = Context::detached();
        ctx.stop_flow(Var::None);
        let err = suspend(&ctx, 0.0).unwrap_err();
        assert!(err.message.contains("not running"));
    }

    #[test]
    fn test_suspend_rejects_missing_fiber() {
        let ctx = Context::detached();
        let err = suspend(&ctx, 0.0).unwrap_err();
        assert!(err.message.contains("without a fiber"));
    }

    #[test]
    fn test_state_snapshot_roundtrip() {
        let ctx = Context::detached();
        ctx.return_flow(Var::Int(9));
        let snapshot = ctx.take_state_snapshot();
        assert!(ctx.flow_storage().is_none());

        ctx.continue_flow();
        ctx.restore_state_snapshot(snapshot);
        assert!(ctx.should_return());
        assert_eq!(ctx.flow_storage(), Var::Int(9));
    }

    #[test]
    fn test_reference_release_is_idempotent() {
        let wire = crate::wire::Wire::new("scope");
        let ctx = Context::new(wire.clone(), None);
        for _ in 0..100 {
            let handle = reference_variable(&ctx, "x");
            handle.set(&Var::Int(1));
            release_variable(handle);
        }
        // the scope still owns exactly one slot, nothing leaked
        let slot = wire.get_variable_if_exists("x").unwrap();
        assert_eq!(Rc::strong_count(&slot), 2); // the map entry plus ours
        assert_eq!(slot.get(), Var::Int(1));
    }

    #[test]
    fn test_inner_wire_shadows_outer() {
        let outer = crate::wire::Wire::new("outer");
        let inner = crate::wire::Wire::new("inner");
        outer.get_or_create_variable("v").set(&Var::Int(1));
        inner.get_or_create_variable("v").set(&Var::Int(2));

        let ctx = Context::new(outer, None);
        ctx.push_wire(inner);
        let found = reference_variable(&ctx, "v");
        assert_eq!(found.get(), Var::Int(2));
    }

    #[test]
    fn test_pure_wire_stops_lookup() {
        let outer = crate::wire::Wire::new("outer");
        outer.get_or_create_variable("shared").set(&Var::Int(9));

        let inner = crate::wire::Wire::new("inner");
        inner.set_pure(true);

        let ctx = Context::new(outer.clone(), None);
        ctx.push_wire(inner.clone());

        // the name exists outside, but a pure wire must not see it
        let found = reference_variable(&ctx, "shared");
        assert!(found.get().is_none());
        assert!(inner.get_variable_if_exists("shared").is_some());
        assert_eq!(outer.get_variable_if_exists("shared").unwrap().get(), Var::Int(9));
    }

    #[test]
    fn test_mesh_scope_fallback() {
        let mesh = crate::mesh::Mesh::new("scope-test");
        let wire = crate::wire::Wire::new("w");
        wire.set_mesh(&mesh);
        mesh.get_variable("global").set(&Var::Int(5));

        let ctx = Context::new(wire, None);
        let found = reference_variable(&ctx, "global");
        assert_eq!(found.get(), Var::Int(5));
    }

    #[test]
    fn test_any_storage_shared_through_parents() {
        let root = Rc::new(Context::detached());
        let a: Rc<u32> = get_or_create_any_storage(&root, "counter", || 7u32);
        assert_eq!(*a, 7);

        // same key resolves to the same instance
        let b: Rc<u32> = get_or_create_any_storage(&root, "counter", || 99u32);
        assert!(Rc::ptr_eq(&a, &b));
    }
}
