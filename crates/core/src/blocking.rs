//! Blocking offloads and mesh-thread hops
//!
//! `await_blocking` runs a blocking callable on a TidePool worker while
//! the calling fiber keeps suspending, so the mesh keeps ticking other
//! wires. Cancellation is cooperative only: when the flow stops early
//! the caller-supplied `cancel` is invoked and we block-wait for the
//! worker to observe it - there is no structured cancellation into
//! third-party code.
//!
//! `call_on_mesh_thread` is the inverse hop: a fiber (whose work may
//! conceptually live on any worker) queues an action that the scheduler
//! executes on the mesh thread between two resumes.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::{suspend, Context, WireState};
use crate::error::{format_panic_payload, ActivationError};
use crate::fiber::yield_current;
use crate::tidepool::tide_pool;
use crate::value::Var;

struct BlockingCall {
    complete: AtomicBool,
    result: Mutex<Option<Result<Var, ActivationError>>>,
}

/// Offload `func` to a worker thread and suspend until it completes.
///
/// Errors (including panics) captured on the worker are re-raised here
/// through `cancel_flow`. Calling this recursively from a worker thread
/// is a contract violation.
pub fn await_blocking<F, C>(context: &Context, func: F, cancel: C) -> Result<Var, ActivationError>
where
    F: FnOnce() -> Result<Var, ActivationError> + Send + 'static,
    C: FnOnce(),
{
    if context.on_worker_thread() {
        debug_assert!(false, "await called recursively from a worker thread");
        return Err(ActivationError::new("await called recursively from a worker thread"));
    }

    // no fiber to suspend: degrade to a plain inline call
    if !context.has_continuation.get() {
        return func();
    }

    let call = Arc::new(BlockingCall {
        complete: AtomicBool::new(false),
        result: Mutex::new(None),
    });

    context.on_worker_thread.set(true);

    let worker_call = call.clone();
    tide_pool().schedule(Box::new(move || {
        let result = catch_unwind(AssertUnwindSafe(func))
            .unwrap_or_else(|payload| Err(ActivationError::new(format_panic_payload(&payload))));
        *worker_call.result.lock().unwrap() = Some(result);
        worker_call.complete.store(true, Ordering::Release);
    }));

    while !call.complete.load(Ordering::Acquire) && context.should_continue() {
        match suspend(context, 0.0) {
            Ok(WireState::Continue) => {}
            _ => break,
        }
    }

    context.on_worker_thread.set(false);

    if !call.complete.load(Ordering::Acquire) {
        // flow stopped while the worker is still going: request
        // cancellation and wait for it to be observed
        cancel();
        while !call.complete.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
    }

    let result = call
        .result
        .lock()
        .unwrap()
        .take()
        .unwrap_or_else(|| Err(ActivationError::new("await produced no result")));

    match result {
        Ok(value) => Ok(value),
        Err(err) => {
            context.cancel_flow(err.message.clone());
            Err(err)
        }
    }
}

/// Queue `action` to run on the mesh thread, then resume. The scheduler
/// executes the action between two resumes of the root fiber, so the
/// action observes mesh state exclusively.
///
/// Called without a live fiber, the action runs inline on the calling
/// thread (with a debug note); called from a worker inside
/// `await_blocking`, it fails.
pub fn call_on_mesh_thread<F>(context: &Rc<Context>, action: F) -> Result<(), ActivationError>
where
    F: FnOnce() + 'static,
{
    if context.on_worker_thread() {
        return Err(ActivationError::new("trying to call_on_mesh_thread from a worker thread"));
    }

    if !context.has_continuation.get() {
        tracing::debug!("no live fiber, running mesh-thread action inline");
        action();
        return Ok(());
    }

    // The root context owns the continuation the mesh resumes; nested
    // contexts delegate upward.
    let mut root = context.clone();
    while let Some(parent) = root.parent() {
        root = parent;
    }

    debug_assert!(
        root.mesh_thread_task.borrow().is_none(),
        "context already has a mesh thread task"
    );
    *root.mesh_thread_task.borrow_mut() = Some(Box::new(action));

    // the scheduler picks the task up and resumes us once it ran
    yield_current();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_await_without_fiber_runs_inline() {
        let ctx = Context::detached();
        let out = await_blocking(&ctx, || Ok(Var::Int(5)), || {}).unwrap();
        assert_eq!(out, Var::Int(5));
    }

    #[test]
    fn test_await_recursion_guard() {
        let ctx = Context::detached();
        ctx.on_worker_thread.set(true);
        // debug builds assert; release builds report the error
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            await_blocking(&ctx, || Ok(Var::None), || {})
        }));
        match outcome {
            Ok(Err(err)) => assert!(err.message.contains("recursively")),
            Ok(Ok(_)) => panic!("recursive await must not succeed"),
            Err(_) => {} // debug assertion fired
        }
    }

    #[test]
    fn test_call_on_mesh_thread_inline_fallback() {
        use std::cell::Cell;
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let ctx = Rc::new(Context::detached());
        call_on_mesh_thread(&ctx, move || flag.set(true)).unwrap();
        assert!(ran.get());
    }
}
