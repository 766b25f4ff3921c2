//! SIGINT/SIGTERM accounting
//!
//! The handler only bumps a counter; meshes observe it in `tick` and
//! terminate themselves. After five signals the process gives up waiting
//! for cooperative shutdown and aborts.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Once;

static SIGNAL_COUNT: AtomicI32 = AtomicI32::new(0);
static INSTALL: Once = Once::new();

/// Signals tolerated before hard-aborting the process.
const ABORT_THRESHOLD: i32 = 5;

/// Install the SIGINT/SIGTERM handlers. Idempotent; a no-op on
/// non-Unix platforms (use `post_interrupt` there).
pub fn install_signal_handlers() {
    INSTALL.call_once(|| {
        #[cfg(unix)]
        unsafe {
            for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
                let result = signal_hook::low_level::register(signal, || {
                    let count = SIGNAL_COUNT.fetch_add(1, Ordering::AcqRel) + 1;
                    if count >= ABORT_THRESHOLD {
                        std::process::abort();
                    }
                });
                if result.is_err() {
                    tracing::error!(signal, "failed to install signal handler");
                }
            }
        }
    });
}

/// Interrupts observed so far. Meshes terminate when this is non-zero.
pub fn interrupt_count() -> i32 {
    SIGNAL_COUNT.load(Ordering::Acquire)
}

/// Record an interrupt without an OS signal (embedders, non-Unix
/// platforms).
pub fn post_interrupt() {
    SIGNAL_COUNT.fetch_add(1, Ordering::AcqRel);
}

/// Re-arm after the embedder handled a shutdown request.
pub fn reset_interrupts() {
    SIGNAL_COUNT.store(0, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_post_and_reset() {
        reset_interrupts();
        assert_eq!(interrupt_count(), 0);
        post_interrupt();
        post_interrupt();
        assert_eq!(interrupt_count(), 2);
        reset_interrupts();
        assert_eq!(interrupt_count(), 0);
    }

    #[test]
    #[serial]
    fn test_install_idempotent() {
        install_signal_handlers();
        install_signal_handlers();
    }
}
