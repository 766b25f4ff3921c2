//! Mesh - the scheduler hosting many wires on one thread
//!
//! A mesh owns the wires scheduled on it (shared ownership), a pool of
//! `Flow` records for the running ones, and the outermost variable
//! scope. `tick` resumes every due wire in schedule order; all fibers of
//! a mesh run on the mesh's owning thread and are never migrated.
//!
//! Wires hold only a weak backref to their mesh and detach themselves on
//! stop, so meshes and wires never keep each other alive in a cycle.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Instant;

use thiserror::Error;

use crate::compose::{compose_wire, default_validation_callback, InstanceData};
use crate::error::ComposeError;
use crate::types::{derive_type, ExposedTypeInfo};
use crate::value::{Var, VarFlags, Variable, VariableRef};
use crate::wire::{
    is_running, prepare, start, stop, tick_wire, RunState, Wire, WireEvent,
};

/// A running-wire record. The wire slot is a cell because a finishing
/// wire may hand its flow over to a resumer.
#[derive(Debug)]
pub struct Flow {
    pub wire: RefCell<Rc<Wire>>,
    pub paused: Cell<bool>,
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error("{0}")]
    Schedule(String),
}

pub struct Mesh {
    label: RefCell<String>,

    scheduled: RefCell<Vec<Rc<Wire>>>,
    flows: RefCell<Vec<Rc<Flow>>>,

    variables: RefCell<HashMap<String, VariableRef>>,
    metadata: RefCell<HashMap<String, ExposedTypeInfo>>,
    // variables with lifetime managed externally (or by another mesh)
    refs: RefCell<HashMap<String, VariableRef>>,

    any_storage: RefCell<HashMap<String, Rc<dyn Any>>>,

    parent: RefCell<Weak<Mesh>>,
    instance_data: RefCell<InstanceData>,

    errors: RefCell<Vec<String>>,
    failed_wires: RefCell<Vec<Rc<Wire>>>,

    listeners: RefCell<Vec<Box<dyn Fn(&Rc<Wire>, &WireEvent)>>>,
    var_listeners: RefCell<Vec<Box<dyn Fn(&str, &Var)>>>,

    self_ref: RefCell<Weak<Mesh>>,
}

impl Mesh {
    pub fn new(label: impl Into<String>) -> Rc<Mesh> {
        let mesh = Rc::new(Mesh {
            label: RefCell::new(label.into()),
            scheduled: RefCell::new(Vec::new()),
            flows: RefCell::new(Vec::new()),
            variables: RefCell::new(HashMap::new()),
            metadata: RefCell::new(HashMap::new()),
            refs: RefCell::new(HashMap::new()),
            any_storage: RefCell::new(HashMap::new()),
            parent: RefCell::new(Weak::new()),
            instance_data: RefCell::new(InstanceData::default()),
            errors: RefCell::new(Vec::new()),
            failed_wires: RefCell::new(Vec::new()),
            listeners: RefCell::new(Vec::new()),
            var_listeners: RefCell::new(Vec::new()),
            self_ref: RefCell::new(Weak::new()),
        });
        *mesh.self_ref.borrow_mut() = Rc::downgrade(&mesh);
        mesh
    }

    pub fn label(&self) -> String {
        self.label.borrow().clone()
    }

    pub fn set_label(&self, label: impl Into<String>) {
        *self.label.borrow_mut() = label.into();
    }

    pub fn parent(&self) -> Option<Rc<Mesh>> {
        self.parent.borrow().upgrade()
    }

    pub fn set_parent(&self, parent: &Rc<Mesh>) {
        *self.parent.borrow_mut() = Rc::downgrade(parent);
    }

    /// Template seeded into every composition run on this mesh.
    pub fn instance_data(&self) -> InstanceData {
        self.instance_data.borrow().clone()
    }

    pub fn set_instance_data(&self, data: InstanceData) {
        *self.instance_data.borrow_mut() = data;
    }

    /// Pre-compose a wire against this mesh's scope without scheduling
    /// it.
    pub fn compose(
        self: &Rc<Self>,
        wire: &Rc<Wire>,
        input: Var,
    ) -> Result<(), MeshError> {
        tracing::trace!(wire = wire.name(), "composing wire");

        if wire.is_warmed_up() {
            tracing::error!(wire = wire.name(), "attempted to pre-compose a wire multiple times");
            return Err(MeshError::Schedule("multiple wire pre-composing".into()));
        }

        wire.set_mesh(self);
        wire.set_root(true);
        let result = (|| {
            let mut data = self.instance_data();
            data.input_type = derive_type(&input, None)?;
            compose_wire(wire, &default_validation_callback, &data)
        })();
        wire.set_root(false);
        result?;

        tracing::trace!(wire = wire.name(), "wire composed");
        Ok(())
    }

    /// Compose (optionally), prepare and start a wire on this mesh.
    pub fn schedule(
        self: &Rc<Self>,
        wire: &Rc<Wire>,
        input: Var,
        compose: bool,
    ) -> Result<(), MeshError> {
        tracing::trace!(wire = wire.name(), "scheduling wire");

        if wire.is_warmed_up() || self.scheduled.borrow().iter().any(|w| Rc::ptr_eq(w, wire)) {
            tracing::error!(wire = wire.name(), "attempted to schedule a wire multiple times");
            return Err(MeshError::Schedule(format!(
                "multiple schedule of wire {}",
                wire.name()
            )));
        }

        wire.set_mesh(self);

        if compose {
            wire.set_root(true);
            let composed = (|| {
                let mut data = self.instance_data();
                data.input_type = derive_type(&input, None)?;
                compose_wire(wire, &default_validation_callback, &data)
            })();
            wire.set_root(false);
            composed?;
            tracing::trace!(wire = wire.name(), "wire composed");
        } else {
            tracing::trace!(wire = wire.name(), "wire skipped compose");
        }

        // create a flow as well
        let flow = Rc::new(Flow { wire: RefCell::new(wire.clone()), paused: Cell::new(false) });
        self.flows.borrow_mut().push(flow.clone());

        prepare(wire, Some(flow));

        // the wire might fail on warmup during prepare
        if wire.state() == RunState::Failed {
            return Err(MeshError::Schedule(format!(
                "wire {} failed during prepare",
                wire.name()
            )));
        }

        start(wire, input);

        self.scheduled.borrow_mut().push(wire.clone());
        tracing::trace!(wire = wire.name(), "wire scheduled");
        Ok(())
    }

    /// Resume every due wire once, in schedule order. Returns `false`
    /// when any wire failed during this tick.
    ///
    /// Pending interrupts terminate the mesh instead of ticking.
    pub fn tick(self: &Rc<Self>) -> bool {
        let mut no_errors = true;
        self.errors.borrow_mut().clear();
        self.failed_wires.borrow_mut().clear();

        if crate::signals::interrupt_count() > 0 {
            self.terminate();
            return no_errors;
        }

        let now = Instant::now();
        let mut cursor = 0usize;
        loop {
            let flow = match self.flows.borrow().get(cursor) {
                Some(flow) => flow.clone(),
                None => break,
            };
            if flow.paused.get() {
                cursor += 1;
                continue;
            }

            let wire = flow.wire.borrow().clone();
            tick_wire(&wire, now);

            if !is_running(&wire) {
                let error = wire.finished_error();
                if !error.is_empty() {
                    self.errors.borrow_mut().push(error);
                }

                if wire.state() == RunState::Failed {
                    self.failed_wires.borrow_mut().push(wire.clone());
                    no_errors = false;
                }

                if !stop(&wire) {
                    no_errors = false;
                }

                tracing::trace!(wire = wire.name(), "wire ended while ticking");
                debug_assert!(
                    !self.scheduled.borrow().iter().any(|w| Rc::ptr_eq(w, &wire)),
                    "wire still in scheduled"
                );
                debug_assert!(wire.mesh().is_none(), "wire still has a mesh");
            }

            // Wire removal edits the pool in place; only advance when the
            // cursor still points at the flow we just processed.
            let unchanged = self
                .flows
                .borrow()
                .get(cursor)
                .map(|f| Rc::ptr_eq(f, &flow))
                .unwrap_or(false);
            if unchanged {
                cursor += 1;
            }
        }

        no_errors
    }

    /// Stop every scheduled wire and drop the variable scope.
    pub fn clear(self: &Rc<Self>) {
        let mut to_stop: Vec<Rc<Wire>> = Vec::new();
        // the scheduled set might not be the full picture
        for flow in self.flows.borrow().iter() {
            to_stop.push(flow.wire.borrow().clone());
        }
        for wire in self.scheduled.borrow().iter() {
            to_stop.push(wire.clone());
        }
        self.flows.borrow_mut().clear();
        self.scheduled.borrow_mut().clear();

        // remove dupes
        to_stop.sort_by_key(|w| Rc::as_ptr(w) as usize);
        to_stop.dedup_by(|a, b| Rc::ptr_eq(a, b));

        for wire in &to_stop {
            stop(wire);
        }

        // find dangling variables and notice
        for (name, var) in self.variables.borrow().iter() {
            if Rc::strong_count(var) > 1 {
                tracing::error!(name = %name, "found a dangling global variable");
            }
        }
        self.variables.borrow_mut().clear();
        self.metadata.borrow_mut().clear();
    }

    /// Full teardown: wires, variables, injected refs and any-storage.
    pub fn terminate(self: &Rc<Self>) {
        self.clear();
        // whichever shard uses refs must have cleaned them by now
        self.refs.borrow_mut().clear();
        self.any_storage.borrow_mut().clear();
    }

    /// Unschedule a wire. A no-op on the flow pool if the wire was never
    /// scheduled here.
    pub fn remove(self: &Rc<Self>, wire: &Rc<Wire>) {
        stop(wire);
        self.scheduled.borrow_mut().retain(|w| !Rc::ptr_eq(w, wire));
        self.flows
            .borrow_mut()
            .retain(|f| !Rc::ptr_eq(&f.wire.borrow(), wire));
    }

    pub fn is_empty(&self) -> bool {
        self.flows.borrow().is_empty()
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduled.borrow().len()
    }

    /// Errors captured during the last tick.
    pub fn errors(&self) -> Vec<String> {
        self.errors.borrow().clone()
    }

    /// Wires that failed during the last tick.
    pub fn failed_wires(&self) -> Vec<Rc<Wire>> {
        self.failed_wires.borrow().clone()
    }

    pub fn set_paused(&self, wire: &Rc<Wire>, paused: bool) {
        for flow in self.flows.borrow().iter() {
            if Rc::ptr_eq(&flow.wire.borrow(), wire) {
                flow.paused.set(paused);
            }
        }
    }

    pub(crate) fn wire_cleaned_up(&self, wire: &Rc<Wire>) {
        self.scheduled.borrow_mut().retain(|w| !Rc::ptr_eq(w, wire));
        let mut flows = self.flows.borrow_mut();
        if let Some(idx) = flows.iter().position(|f| Rc::ptr_eq(&f.wire.borrow(), wire)) {
            flows.remove(idx);
        }
    }

    // -- variable scope -----------------------------------------------

    /// Get or create a mesh-scope variable slot.
    pub fn get_variable(&self, name: &str) -> VariableRef {
        self.variables
            .borrow_mut()
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::trace!(name, "creating a global variable");
                Rc::new(Variable::new(name))
            })
            .clone()
    }

    pub fn get_variable_if_exists(&self, name: &str) -> Option<VariableRef> {
        self.variables.borrow().get(name).cloned()
    }

    /// Attach type metadata to a mesh variable. Conflicting metadata for
    /// the same name is reported, last writer wins.
    pub fn set_metadata(&self, name: &str, info: ExposedTypeInfo) {
        let mut metadata = self.metadata.borrow_mut();
        if let Some(existing) = metadata.get(name) {
            if *existing != info {
                tracing::warn!(
                    name,
                    "metadata for global variable already exists and is different"
                );
            }
        }
        metadata.insert(name.to_string(), info);
    }

    pub fn get_metadata(&self, name: &str) -> Option<ExposedTypeInfo> {
        self.metadata.borrow().get(name).cloned()
    }

    pub fn remove_metadata(&self, name: &str) {
        self.metadata.borrow_mut().remove(name);
    }

    /// Variables that carry metadata, as seen by composition.
    pub fn variables_metadata(&self) -> Vec<(String, ExposedTypeInfo)> {
        self.metadata
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Inject a reference to a variable owned elsewhere (another mesh or
    /// the embedder).
    pub fn add_ref(&self, name: &str, var: VariableRef) {
        debug_assert!(
            var.flags.get().contains(VarFlags::EXTERNAL) || Rc::strong_count(&var) > 1,
            "injected refs must be kept alive by their owner"
        );
        self.refs.borrow_mut().insert(name.to_string(), var);
    }

    pub fn get_ref_if_exists(&self, name: &str) -> Option<VariableRef> {
        self.refs.borrow().get(name).cloned()
    }

    pub fn has_ref(&self, name: &str) -> bool {
        self.refs.borrow().contains_key(name)
    }

    pub fn release_refs(&self) {
        self.refs.borrow_mut().clear();
    }

    /// Shared anonymous storage scoped to this mesh.
    pub fn get_or_create_any_storage<T, F>(&self, key: &str, init: F) -> Rc<T>
    where
        T: 'static,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.any_storage.borrow().get(key) {
            return existing
                .clone()
                .downcast::<T>()
                .expect("any-storage type mismatch for key");
        }
        let created: Rc<T> = Rc::new(init());
        self.any_storage
            .borrow_mut()
            .insert(key.to_string(), created.clone());
        created
    }

    // -- events -------------------------------------------------------

    /// Subscribe to lifecycle events of every wire on this mesh.
    pub fn on_wire_event(&self, listener: impl Fn(&Rc<Wire>, &WireEvent) + 'static) {
        self.listeners.borrow_mut().push(Box::new(listener));
    }

    /// Subscribe to exposed-variable writes.
    pub fn on_exposed_var_set(&self, listener: impl Fn(&str, &Var) + 'static) {
        self.var_listeners.borrow_mut().push(Box::new(listener));
    }

    pub(crate) fn notify_wire_event(&self, wire: &Rc<Wire>, event: &WireEvent) {
        for listener in self.listeners.borrow().iter() {
            listener(wire, event);
        }
    }

    /// Fire `OnExposedVarSet`, synchronously on the mesh thread.
    pub fn trigger_var_value_change(&self, name: &str, value: &Var) {
        for listener in self.var_listeners.borrow().iter() {
            listener(name, value);
        }
    }
}

impl std::fmt::Debug for Mesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mesh")
            .field("label", &self.label.borrow())
            .field("scheduled", &self.scheduled.borrow().len())
            .field("flows", &self.flows.borrow().len())
            .finish()
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        // wires may outlive the mesh handle; make sure they are detached
        let wires: Vec<Rc<Wire>> = self
            .flows
            .borrow()
            .iter()
            .map(|f| f.wire.borrow().clone())
            .chain(self.scheduled.borrow().iter().cloned())
            .collect();
        self.flows.borrow_mut().clear();
        self.scheduled.borrow_mut().clear();
        for wire in &wires {
            stop(wire);
        }
    }
}
