//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use storage_sage::prelude::*;
//! ```

// Core
pub use crate::core::cancel::CancelToken;
pub use crate::core::config::Config;
pub use crate::core::errors::{Result, SageError};
pub use crate::core::types::{
    ActionResult, Candidate, Decision, EnvSnapshot, Mode, PlanItem, SafetyVerdict, TargetKind,
};

// Scanner
pub use crate::scanner::walker::{ScanRequest, Scanner};

// Policy
pub use crate::policy::{
    AgePolicy, CompositeMode, CompositePolicy, ExclusionPolicy, ExtensionPolicy, Policy,
    SizePolicy,
};

// Safety
pub use crate::safety::SafetyValidator;

// Pipeline
pub use crate::exec::executor::Executor;
pub use crate::exec::planner::Planner;

// Trash
pub use crate::trash::manager::TrashManager;

// Audit
pub use crate::audit::Recorder;
pub use crate::audit::jsonl::JsonlRecorder;
#[cfg(feature = "sqlite")]
pub use crate::audit::sqlite::SqliteRecorder;

// Daemon
#[cfg(feature = "daemon")]
pub use crate::daemon::runner::Daemon;
