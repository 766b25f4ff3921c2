//! Stackful fibers - one per wire
//!
//! A fiber is an explicitly resumable coroutine with its own stack. The
//! mesh resumes due fibers from `tick`; shards suspend from arbitrary
//! call depth through `yield_current`. Cancellation is cooperative only:
//! the scheduler flags the context (`stop_flow` + `on_last_resume`) and
//! resumes once more so the fiber walks its cleanup path.
//!
//! Thread affinity is a hard contract: a fiber must be resumed on the
//! thread that created it. Meshes never migrate fibers, so the debug
//! assertion only fires on externally broken code.

use std::cell::RefCell;
use std::thread::ThreadId;

use generator::{Gn, LocalGenerator, Scope};

/// Default fiber stack size: 1 MiB.
pub const DEFAULT_STACK_SIZE: usize = 0x10_0000;

type FiberScope = Scope<'static, 'static, (), ()>;

// Tracks the scope of whichever fiber is actually executing on this thread
// right now, so `yield_current` can reach it without every call site
// threading a handle through. Pushed/popped around each active stretch of
// execution (not for the whole fiber lifetime), so sibling fibers resumed
// in between see a correct, non-stale top of stack.
thread_local! {
    static SCOPE_STACK: RefCell<Vec<*mut FiberScope>> = RefCell::new(Vec::new());
}

fn push_scope(ptr: *mut FiberScope) {
    SCOPE_STACK.with(|s| s.borrow_mut().push(ptr));
}

fn pop_scope() -> *mut FiberScope {
    SCOPE_STACK.with(|s| s.borrow_mut().pop()).expect("yield_current called outside a fiber")
}

pub struct Fiber {
    gen: Option<LocalGenerator<'static, (), ()>>,
    owner: ThreadId,
}

impl Default for Fiber {
    fn default() -> Self {
        Self::new()
    }
}

impl Fiber {
    pub fn new() -> Self {
        Self { gen: None, owner: std::thread::current().id() }
    }

    /// Spawn the coroutine and run `f` up to its first suspension point.
    /// This pre-allocates the stack and lets the body do its setup work
    /// (warmup) before the caller ever schedules the fiber.
    pub fn init(&mut self, stack_size: usize, f: impl FnOnce() + 'static) {
        debug_assert!(self.gen.is_none(), "fiber already initialized");
        self.owner = std::thread::current().id();
        let mut gen: LocalGenerator<'static, (), ()> = Gn::new_scoped_opt_local(stack_size, move |mut scope| {
            let ptr = &mut scope as *mut _ as *mut FiberScope;
            push_scope(ptr);
            f();
            pop_scope();
        });
        gen.resume();
        self.gen = Some(gen);
    }

    /// Transfer control to the fiber; returns when it suspends or
    /// completes.
    pub fn resume(&mut self) {
        debug_assert_eq!(
            std::thread::current().id(),
            self.owner,
            "fiber resumed on a different thread than it was created on"
        );
        if let Some(gen) = &mut self.gen {
            if !gen.is_done() {
                gen.resume();
            }
        }
    }

    /// Whether the fiber can still be resumed.
    pub fn is_alive(&self) -> bool {
        self.gen.as_ref().map(|g| !g.is_done()).unwrap_or(false)
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber").field("alive", &self.is_alive()).finish()
    }
}

/// Suspend the currently running fiber, returning control to its last
/// resumer. Must only be called from within a fiber.
pub fn yield_current() {
    let ptr = pop_scope();
    unsafe { (*ptr).yield_with(()) };
    push_scope(ptr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_init_runs_to_first_suspend() {
        let steps = Rc::new(Cell::new(0));
        let s = steps.clone();
        let mut fiber = Fiber::new();
        fiber.init(DEFAULT_STACK_SIZE, move || {
            s.set(1);
            yield_current();
            s.set(2);
        });
        // init already ran the body up to the first yield
        assert_eq!(steps.get(), 1);
        assert!(fiber.is_alive());

        fiber.resume();
        assert_eq!(steps.get(), 2);
        assert!(!fiber.is_alive());
    }

    #[test]
    fn test_resume_after_done_is_noop() {
        let mut fiber = Fiber::new();
        fiber.init(DEFAULT_STACK_SIZE, || {});
        assert!(!fiber.is_alive());
        fiber.resume();
        fiber.resume();
    }

    #[test]
    fn test_multiple_suspension_points() {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let mut fiber = Fiber::new();
        fiber.init(DEFAULT_STACK_SIZE, move || {
            for _ in 0..5 {
                c.set(c.get() + 1);
                yield_current();
            }
        });
        assert_eq!(count.get(), 1);
        for expected in 2..=5 {
            fiber.resume();
            assert_eq!(count.get(), expected);
        }
        fiber.resume();
        assert!(!fiber.is_alive());
    }

    #[test]
    fn test_deep_stack_suspend() {
        // suspension works from nested call frames
        fn descend(depth: usize) {
            if depth == 0 {
                yield_current();
            } else {
                descend(depth - 1);
            }
        }
        let mut fiber = Fiber::new();
        fiber.init(DEFAULT_STACK_SIZE, || {
            descend(64);
        });
        assert!(fiber.is_alive());
        fiber.resume();
        assert!(!fiber.is_alive());
    }
}
