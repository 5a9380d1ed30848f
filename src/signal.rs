//! Signal handling for graceful unmount.
//!
//! A single [`ShutdownSignal`] is shared by the FUSE mount loop, the
//! cache sweeper thread, and in-flight builds. When SIGINT, SIGTERM, or
//! SIGHUP arrives the flag flips, waiting openers are woken with a
//! cancellation error, and running encoder processes are killed.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

/// Shutdown state coordinating signal handlers with engine threads.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    signaled: AtomicBool,
    signal_num: AtomicI32,
}

impl ShutdownSignal {
    /// Creates a new signal in the non-signaled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shutdown has been requested.
    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Requests shutdown. `signal_num` is 0 for programmatic triggers.
    pub fn trigger(&self, signal_num: i32) {
        self.signal_num.store(signal_num, Ordering::Release);
        self.signaled.store(true, Ordering::Release);
    }

    /// Human-readable name of the signal that triggered shutdown.
    pub fn signal_name(&self) -> &'static str {
        match self.signal_num.load(Ordering::Acquire) {
            SIGINT => "SIGINT",
            SIGTERM => "SIGTERM",
            SIGHUP => "SIGHUP",
            0 => "none",
            _ => "unknown",
        }
    }
}

/// Installs handlers for SIGINT, SIGTERM, and SIGHUP that trigger
/// `shutdown`.
pub fn install_signal_handlers(shutdown: Arc<ShutdownSignal>) -> std::io::Result<()> {
    for sig in [SIGINT, SIGTERM, SIGHUP] {
        let shutdown = shutdown.clone();
        // SAFETY: the handler closure only touches atomics.
        unsafe {
            signal_hook::low_level::register(sig, move || {
                shutdown.trigger(sig);
            })?;
        }
    }
    Ok(())
}
