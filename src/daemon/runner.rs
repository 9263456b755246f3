//! Daemon supervisor: owns the single-instance lock, HTTP surface,
//! scheduler thread, auditor, and trash manager; tears them down in
//! reverse construction order on shutdown.

#![allow(missing_docs)]

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::audit::Recorder;
use crate::audit::jsonl::JsonlRecorder;
#[cfg(feature = "sqlite")]
use crate::audit::sqlite::SqliteRecorder;
use crate::core::cancel::CancelToken;
use crate::core::config::{Config, parse_schedule};
use crate::core::errors::{Result, SageError};
use crate::core::types::Mode;
use crate::daemon::http::ControlServer;
use crate::daemon::lock::InstanceLock;
use crate::daemon::signals::SignalHandler;
use crate::daemon::state::{DaemonState, StateCell};
use crate::exec::run::run_once;
use crate::policy::policy_from_config;
use crate::safety::SafetyValidator;
use crate::trash::manager::TrashManager;

/// Ceiling on any single triggered or scheduled run.
pub const RUN_CEILING: Duration = Duration::from_secs(30 * 60);
/// Grace allowed for an in-flight run to settle during shutdown.
const SHUTDOWN_RUN_GRACE: Duration = Duration::from_secs(10);
/// Poll granularity for the scheduler and supervisor loops.
const TICK: Duration = Duration::from_millis(100);

/// The user-supplied (or pipeline-derived) run function.
pub type RunFn = Arc<dyn Fn(&CancelToken) -> Result<()> + Send + Sync>;

/// Why a trigger was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerError {
    /// A run is already in progress; exactly one runs at a time.
    AlreadyRunning,
    /// The daemon is shutting down or stopped.
    NotAccepting,
}

impl std::fmt::Display for TriggerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRunning => f.write_str("run already in progress"),
            Self::NotAccepting => f.write_str("daemon not accepting runs"),
        }
    }
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusBody {
    pub state: DaemonState,
    pub running: bool,
    pub last_run: String,
    pub last_error: String,
    pub run_count: u64,
    pub schedule: String,
}

/// State shared between the supervisor, scheduler, and HTTP handlers.
pub struct SharedState {
    pub state: StateCell,
    running: AtomicBool,
    last_run: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
    run_count: AtomicU64,
    pub config: Config,
    pub schedule: Option<Duration>,
    run_fn: RunFn,
    pub recorder: Arc<dyn Recorder>,
    #[cfg(feature = "sqlite")]
    pub sqlite: Option<Arc<SqliteRecorder>>,
    pub trash: Option<Arc<TrashManager>>,
    run_token: Mutex<Option<CancelToken>>,
}

impl SharedState {
    pub fn status(&self) -> StatusBody {
        StatusBody {
            state: self.state.get(),
            running: self.running.load(Ordering::SeqCst),
            last_run: self
                .last_run
                .lock()
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
            last_error: self.last_error.lock().clone().unwrap_or_default(),
            run_count: self.run_count.load(Ordering::SeqCst),
            schedule: self.config.daemon.schedule.clone(),
        }
    }

    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start a run unless one is already in progress. Both the scheduler
    /// tick and external triggers funnel through this CAS guard.
    pub fn try_trigger(self: &Arc<Self>) -> std::result::Result<(), TriggerError> {
        match self.state.get() {
            DaemonState::Ready | DaemonState::Running => {}
            _ => return Err(TriggerError::NotAccepting),
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TriggerError::AlreadyRunning);
        }

        let shared = Arc::clone(self);
        thread::spawn(move || perform_run(&shared));
        Ok(())
    }

    fn cancel_in_flight_run(&self) {
        if let Some(token) = self.run_token.lock().as_ref() {
            token.cancel();
        }
    }
}

/// Execute the run function with panic isolation. A panic is reified into
/// the last-error slot and still counts as a completed run attempt.
fn perform_run(shared: &Arc<SharedState>) {
    shared.state.transition(DaemonState::Ready, DaemonState::Running);
    let token = CancelToken::with_deadline(Instant::now() + RUN_CEILING);
    *shared.run_token.lock() = Some(token.clone());

    let outcome = catch_unwind(AssertUnwindSafe(|| (shared.run_fn)(&token)));
    let error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            eprintln!("[SSG-DAEMON] run panicked: {message}");
            Some(format!("panic: {message}"))
        }
    };

    *shared.last_error.lock() = error;
    *shared.last_run.lock() = Some(Utc::now());
    shared.run_count.fetch_add(1, Ordering::SeqCst);
    *shared.run_token.lock() = None;
    shared.state.transition(DaemonState::Running, DaemonState::Ready);
    shared.running.store(false, Ordering::SeqCst);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

// ──────────────────── daemon ────────────────────

/// The supervisor. Construction wires resources; [`start`](Self::start)
/// brings them up; [`shutdown`](Self::shutdown) tears them down in
/// reverse order, exactly once.
pub struct Daemon {
    shared: Arc<SharedState>,
    lock: Option<InstanceLock>,
    http: Option<ControlServer>,
    scheduler: Option<JoinHandle<()>>,
    stop: CancelToken,
    signals: SignalHandler,
    stopped: bool,
}

impl Daemon {
    /// Build a daemon whose run function is the full reclamation pipeline.
    pub fn new(config: Config) -> Result<Self> {
        Self::build(config, None)
    }

    /// Build a daemon with a custom run function (tests, embedding).
    pub fn with_run_fn(config: Config, run_fn: RunFn) -> Result<Self> {
        Self::build(config, Some(run_fn))
    }

    fn build(config: Config, run_fn: Option<RunFn>) -> Result<Self> {
        config.validate()?;

        #[cfg(feature = "sqlite")]
        let mut sqlite: Option<Arc<SqliteRecorder>> = None;
        let recorder: Arc<dyn Recorder> = match config.audit.backend.as_str() {
            "jsonl" => Arc::new(JsonlRecorder::open(&config.audit.path)?),
            _ => {
                #[cfg(feature = "sqlite")]
                {
                    let typed = Arc::new(SqliteRecorder::open(&config.audit.path)?);
                    sqlite = Some(Arc::clone(&typed));
                    typed
                }
                #[cfg(not(feature = "sqlite"))]
                {
                    return Err(SageError::InvalidConfig {
                        details: "audit.backend = sqlite requires the sqlite feature"
                            .to_string(),
                    });
                }
            }
        };

        let trash = if config.trash.enabled {
            Some(Arc::new(TrashManager::from_config(&config)?))
        } else {
            None
        };

        let schedule = if config.daemon.schedule.is_empty() {
            None
        } else {
            Some(parse_schedule(&config.daemon.schedule)?)
        };

        let run_fn = match run_fn {
            Some(f) => f,
            None => {
                let mode: Mode = config
                    .daemon
                    .mode
                    .parse()
                    .map_err(|details| SageError::InvalidConfig { details })?;
                let safety = SafetyValidator::from_config(
                    &config.safety,
                    config.effective_allowed_roots(),
                );
                let policy = policy_from_config(&config.policy)?;
                let pipeline_config = config.clone();
                let pipeline_recorder = Arc::clone(&recorder);
                let pipeline_trash = trash.clone();
                Arc::new(move |cancel: &CancelToken| {
                    run_once(
                        &pipeline_config,
                        &policy,
                        &safety,
                        pipeline_trash.as_deref(),
                        pipeline_recorder.as_ref(),
                        mode,
                        cancel,
                    )
                    .map(|_| ())
                }) as RunFn
            }
        };

        let shared = Arc::new(SharedState {
            state: StateCell::new(),
            running: AtomicBool::new(false),
            last_run: Mutex::new(None),
            last_error: Mutex::new(None),
            run_count: AtomicU64::new(0),
            config,
            schedule,
            run_fn,
            recorder,
            #[cfg(feature = "sqlite")]
            sqlite,
            trash,
            run_token: Mutex::new(None),
        });

        Ok(Self {
            shared,
            lock: None,
            http: None,
            scheduler: None,
            stop: CancelToken::new(),
            signals: SignalHandler::unregistered(),
            stopped: false,
        })
    }

    /// Shared state handle (HTTP handlers, tests).
    pub fn shared(&self) -> Arc<SharedState> {
        Arc::clone(&self.shared)
    }

    /// Install OS signal hooks (SIGTERM/SIGINT → shutdown).
    pub fn install_signal_hooks(&mut self) {
        self.signals = SignalHandler::new();
    }

    /// Acquire the single-instance lock, start the HTTP surface and the
    /// scheduler, and transition to ready.
    pub fn start(&mut self) -> Result<()> {
        let lock = InstanceLock::acquire(&self.shared.config.daemon.pid_file)?;
        self.lock = Some(lock);

        let http = ControlServer::start(
            &self.shared.config.daemon.listen_addr,
            Arc::clone(&self.shared),
        )?;
        self.http = Some(http);

        if let Some(interval) = self.shared.schedule {
            let shared = Arc::clone(&self.shared);
            let stop = self.stop.clone();
            self.scheduler = Some(thread::spawn(move || scheduler_loop(&shared, &stop, interval)));
        }

        self.shared.state.set(DaemonState::Ready);
        Ok(())
    }

    /// Local address of the HTTP surface once started.
    pub fn http_addr(&self) -> Option<std::net::SocketAddr> {
        self.http.as_ref().map(ControlServer::local_addr)
    }

    /// External on-demand trigger; same guard as the scheduler.
    pub fn trigger(&self) -> std::result::Result<(), TriggerError> {
        self.shared.try_trigger()
    }

    /// Block until a shutdown is requested (signal or programmatic), then
    /// shut down.
    pub fn run_until_shutdown(&mut self) -> Result<()> {
        while !self.signals.should_shutdown() && !self.stop.is_canceled() {
            thread::sleep(TICK);
        }
        self.shutdown()
    }

    /// Request the supervisor loop to exit.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Tear everything down in reverse construction order. Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        self.shared.state.set(DaemonState::Stopping);
        self.stop.cancel();
        self.shared.cancel_in_flight_run();

        if let Some(handle) = self.scheduler.take() {
            let _ = handle.join();
        }
        if let Some(http) = self.http.take() {
            http.shutdown();
        }

        // Give an in-flight run a bounded window to observe cancellation.
        let deadline = Instant::now() + SHUTDOWN_RUN_GRACE;
        while self.shared.is_running() && Instant::now() < deadline {
            thread::sleep(TICK);
        }

        // Auditor close is idempotent; exactly one effective close.
        self.shared.recorder.close()?;
        if let Some(trash) = &self.shared.trash {
            trash.close()?;
        }
        if let Some(mut lock) = self.lock.take() {
            lock.release();
        }

        self.shared.state.set(DaemonState::Stopped);
        Ok(())
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn scheduler_loop(shared: &Arc<SharedState>, stop: &CancelToken, interval: Duration) {
    let mut next = Instant::now() + interval;
    loop {
        while Instant::now() < next {
            if stop.is_canceled() {
                return;
            }
            thread::sleep(TICK.min(next.saturating_duration_since(Instant::now())));
        }
        if stop.is_canceled() {
            return;
        }
        // Overlap with an in-flight run skips the tick; the guard is shared
        // with external triggers.
        let _ = shared.try_trigger();
        next = Instant::now() + interval;
    }
}

// ──────────────────── tests ────────────────────
