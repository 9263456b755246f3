//! Daemon lifecycle state, stored atomically.
//!
//! Transitions are monotonic along starting → ready → stopping → stopped,
//! except that ready ⇌ running may alternate for the daemon's lifetime.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Starting,
    Ready,
    Running,
    Stopping,
    Stopped,
}

impl DaemonState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Starting,
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Ready => 1,
            Self::Running => 2,
            Self::Stopping => 3,
            Self::Stopped => 4,
        }
    }
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => f.write_str("starting"),
            Self::Ready => f.write_str("ready"),
            Self::Running => f.write_str("running"),
            Self::Stopping => f.write_str("stopping"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// Atomic holder for the daemon state.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU8::new(DaemonState::Starting.as_u8()))
    }

    #[must_use]
    pub fn get(&self) -> DaemonState {
        DaemonState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: DaemonState) {
        self.0.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Transition only if the current state matches. Returns whether the
    /// swap happened.
    pub fn transition(&self, from: DaemonState, to: DaemonState) -> bool {
        self.0
            .compare_exchange(
                from.as_u8(),
                to.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
