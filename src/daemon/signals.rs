//! Signal handling: SIGTERM/SIGINT request graceful shutdown.
//!
//! Uses the `signal-hook` crate for safe registration. The supervisor
//! loop polls the flag each iteration rather than blocking on signals.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Thread-safe shutdown flag shared between the signal handler and the
/// supervisor loop.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a handler and register OS signal hooks. Registration is
    /// best-effort; failures are logged to stderr but not fatal.
    #[must_use]
    pub fn new() -> Self {
        let handler = Self::unregistered();
        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&handler.shutdown_flag)) {
            eprintln!("[SSG-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&handler.shutdown_flag)) {
            eprintln!("[SSG-SIGNAL] failed to register SIGINT: {e}");
        }
        handler
    }

    /// A handler with no OS hooks (tests, embedded use).
    #[must_use]
    pub fn unregistered() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a shutdown has been requested.
    #[must_use]
    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Programmatically request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
