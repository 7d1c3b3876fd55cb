// Scheduler engine: repeating timers driving the script executor and the operations processor

use crate::config::{AgentConfig, ScheduleMode, Settings};
use crate::errors::SchedulerError;
use crate::executor::{ScriptExecutor, ScriptParameters};
use crate::models::{BatchResult, ExecutionContext, ExecutionResult};
use crate::operations::{panic_message, OperationsProcessor};
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub const DUAL_CONTEXT_TIMER: &str = "DualContextRun";
pub const USER_OPERATIONS_TIMER: &str = "UserOperations";
pub const SYSTEM_OPERATIONS_TIMER: &str = "SystemOperations";

const OUTPUT_LOG_LIMIT: usize = 1000;
const MIN_TIMER_PERIOD: Duration = Duration::from_secs(1);

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Automation entrypoint run by the user and dual-context timers
    pub entry_script: PathBuf,
    pub manifest_path: PathBuf,
    /// CONFIG.json, re-read on every start
    pub config_file: PathBuf,
    pub inter_phase_delay: Duration,
    pub system_initial_delay: Duration,
    pub shutdown_grace: Duration,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            entry_script: settings.entry_script_path(),
            manifest_path: settings.manifest_path(),
            config_file: settings.config_file_path(),
            inter_phase_delay: Duration::from_secs(settings.scheduler.inter_phase_delay_seconds),
            system_initial_delay: Duration::from_secs(
                settings.scheduler.system_initial_delay_seconds,
            ),
            shutdown_grace: Duration::from_secs(settings.scheduler.shutdown_grace_seconds),
        }
    }
}

/// Lifecycle of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Stopped => "stopped",
            SchedulerState::Starting => "starting",
            SchedulerState::Running => "running",
            SchedulerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Both phases of one dual-context run
#[derive(Debug, Clone)]
pub struct DualContextOutcome {
    pub user: ExecutionResult,
    pub elevated: ExecutionResult,
}

impl DualContextOutcome {
    pub fn success(&self) -> bool {
        self.user.success() && self.elevated.success()
    }
}

/// Scheduler trait for the agent's periodic work
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Create the timers; a second call while running is a no-op
    async fn start(&self) -> Result<(), SchedulerError>;

    /// Cancel and release every timer; a no-op when not running
    async fn stop(&self) -> Result<(), SchedulerError>;

    async fn run_dual_context_now(&self) -> DualContextOutcome;

    async fn run_user_operations_now(&self) -> ExecutionResult;

    async fn run_system_operations_now(&self) -> BatchResult;

    /// Snapshot of timer name to next fire time
    async fn next_execution_times(&self) -> HashMap<String, DateTime<Utc>>;

    fn state(&self) -> SchedulerState;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerJob {
    DualContext,
    UserOperations,
    SystemOperations,
}

struct TimerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Main scheduler implementation
pub struct SchedulerService {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    executor: Arc<dyn ScriptExecutor>,
    processor: Arc<dyn OperationsProcessor>,
    state: std::sync::Mutex<SchedulerState>,
    // Parent of every timer token and of on-demand runs; replaced after each stop
    shutdown: std::sync::Mutex<CancellationToken>,
    timers: Mutex<HashMap<String, TimerHandle>>,
    next_runs: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl SchedulerService {
    pub fn new(
        config: SchedulerConfig,
        executor: Arc<dyn ScriptExecutor>,
        processor: Arc<dyn OperationsProcessor>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                executor,
                processor,
                state: std::sync::Mutex::new(SchedulerState::Stopped),
                shutdown: std::sync::Mutex::new(CancellationToken::new()),
                timers: Mutex::new(HashMap::new()),
                next_runs: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    fn set_state(&self, state: SchedulerState) {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Spawn one repeating timer and record its first fire time
    async fn schedule(&self, name: &str, job: TimerJob, initial_delay: Duration, period: Duration) {
        let period = period.max(MIN_TIMER_PERIOD);
        let cancel = self.inner.shutdown_token().child_token();

        let mut timers = self.inner.timers.lock().await;
        if timers.contains_key(name) {
            warn!(timer = %name, "Timer already scheduled");
            return;
        }

        self.inner
            .set_next_run(name, Utc::now() + to_chrono(initial_delay))
            .await;

        let task = tokio::spawn(run_timer(
            Arc::clone(&self.inner),
            name.to_string(),
            job,
            initial_delay,
            period,
            cancel.clone(),
        ));
        timers.insert(name.to_string(), TimerHandle { cancel, task });

        info!(
            timer = %name,
            initial_delay_secs = initial_delay.as_secs(),
            interval_secs = period.as_secs(),
            "Timer scheduled"
        );
    }
}

#[async_trait]
impl Scheduler for SchedulerService {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), SchedulerError> {
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match *state {
                SchedulerState::Stopped => *state = SchedulerState::Starting,
                other => {
                    warn!(state = %other, "Scheduler already started");
                    return Ok(());
                }
            }
        }

        info!("Starting scheduler");

        let agent_config = AgentConfig::load_or_default(&self.inner.config.config_file).await;

        match agent_config.schedule_mode {
            ScheduleMode::Dual => {
                self.schedule(
                    DUAL_CONTEXT_TIMER,
                    TimerJob::DualContext,
                    Duration::ZERO,
                    agent_config.refresh_interval(),
                )
                .await;
            }
            ScheduleMode::Split => {
                self.schedule(
                    USER_OPERATIONS_TIMER,
                    TimerJob::UserOperations,
                    Duration::ZERO,
                    agent_config.user_interval(),
                )
                .await;
            }
        }

        if agent_config.skip.system_ops {
            info!("System operations timer disabled by configuration");
        } else {
            self.schedule(
                SYSTEM_OPERATIONS_TIMER,
                TimerJob::SystemOperations,
                self.inner.config.system_initial_delay,
                agent_config.system_interval(),
            )
            .await;
        }

        self.set_state(SchedulerState::Running);
        info!(mode = ?agent_config.schedule_mode, "Scheduler started");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<(), SchedulerError> {
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *state != SchedulerState::Running {
                debug!(state = %*state, "Scheduler not running, nothing to stop");
                return Ok(());
            }
            *state = SchedulerState::Stopping;
        }

        info!("Stopping scheduler");
        self.inner.shutdown_token().cancel();

        let timers: Vec<(String, TimerHandle)> =
            self.inner.timers.lock().await.drain().collect();
        let grace = self.inner.config.shutdown_grace;

        for (name, mut handle) in timers {
            handle.cancel.cancel();
            match tokio::time::timeout(grace, &mut handle.task).await {
                Ok(Ok(())) => debug!(timer = %name, "Timer released"),
                Ok(Err(e)) => error!(timer = %name, error = %e, "Timer task ended abnormally"),
                Err(_) => {
                    warn!(timer = %name, grace_secs = grace.as_secs(), "Timer did not finish in time, aborting");
                    handle.task.abort();
                }
            }
        }

        self.inner.next_runs.write().await.clear();
        *self
            .inner
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();

        self.set_state(SchedulerState::Stopped);
        info!("Scheduler stopped");
        Ok(())
    }

    async fn run_dual_context_now(&self) -> DualContextOutcome {
        let cancel = self.inner.shutdown_token();
        self.inner.run_dual_context(&cancel).await
    }

    async fn run_user_operations_now(&self) -> ExecutionResult {
        let cancel = self.inner.shutdown_token();
        self.inner.run_user_operations(&cancel).await
    }

    async fn run_system_operations_now(&self) -> BatchResult {
        let cancel = self.inner.shutdown_token();
        self.inner.run_system_operations(&cancel).await
    }

    async fn next_execution_times(&self) -> HashMap<String, DateTime<Utc>> {
        self.inner.next_runs.read().await.clone()
    }

    fn state(&self) -> SchedulerState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl SchedulerInner {
    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn set_next_run(&self, name: &str, at: DateTime<Utc>) {
        self.next_runs.write().await.insert(name.to_string(), at);
    }

    async fn run_job(&self, job: TimerJob, cancel: &CancellationToken) {
        match job {
            TimerJob::DualContext => {
                self.run_dual_context(cancel).await;
            }
            TimerJob::UserOperations => {
                self.run_user_operations(cancel).await;
            }
            TimerJob::SystemOperations => {
                self.run_system_operations(cancel).await;
            }
        }
    }

    /// User phase, inter-phase delay, then elevated phase; both phases always attempted
    #[instrument(skip(self, cancel))]
    async fn run_dual_context(&self, cancel: &CancellationToken) -> DualContextOutcome {
        info!(script = %self.config.entry_script.display(), "Starting dual-context run");
        let parameters = ScriptParameters::new();

        let user = self
            .executor
            .execute_as_user(&self.config.entry_script, &parameters, None, cancel)
            .await;
        log_execution(&user);

        let elevated = if cancel.is_cancelled() {
            ExecutionResult::started(ExecutionContext::Elevated).cancel()
        } else {
            let paused = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(self.config.inter_phase_delay) => true,
            };
            if paused {
                let result = self
                    .executor
                    .execute_elevated(&self.config.entry_script, &parameters, cancel)
                    .await;
                log_execution(&result);
                result
            } else {
                ExecutionResult::started(ExecutionContext::Elevated).cancel()
            }
        };

        let outcome = DualContextOutcome { user, elevated };
        info!(
            user_success = outcome.user.success(),
            elevated_success = outcome.elevated.success(),
            "Dual-context run completed"
        );
        outcome
    }

    #[instrument(skip(self, cancel))]
    async fn run_user_operations(&self, cancel: &CancellationToken) -> ExecutionResult {
        info!(script = %self.config.entry_script.display(), "Executing user operations");
        let result = self
            .executor
            .execute_as_user(&self.config.entry_script, &ScriptParameters::new(), None, cancel)
            .await;
        log_execution(&result);
        result
    }

    #[instrument(skip(self, cancel))]
    async fn run_system_operations(&self, cancel: &CancellationToken) -> BatchResult {
        info!(manifest = %self.config.manifest_path.display(), "Executing system operations");
        let batch = self
            .processor
            .process_manifest(&self.config.manifest_path, cancel)
            .await;

        info!(
            total = batch.total_operations,
            succeeded = batch.successful_operations,
            failed = batch.failed_operations,
            cancelled = batch.cancelled,
            duration_ms = batch.duration().num_milliseconds(),
            "System operations completed"
        );
        for failed in batch.results.iter().filter(|r| !r.success) {
            warn!(
                operation_id = %failed.operation_id,
                error = failed.error.as_deref().unwrap_or_default(),
                "System operation failed"
            );
        }
        batch
    }
}

/// Timer loop: first tick after `initial_delay`, then every `period` until cancelled
async fn run_timer(
    inner: Arc<SchedulerInner>,
    name: String,
    job: TimerJob,
    initial_delay: Duration,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + initial_delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let fired_at = Utc::now();
        telemetry::record_scheduled_run(&name);
        debug!(timer = %name, "Timer fired");

        if let Err(panic) = AssertUnwindSafe(inner.run_job(job, &cancel))
            .catch_unwind()
            .await
        {
            error!(timer = %name, panic = %panic_message(panic.as_ref()), "Timer run panicked");
        }

        if cancel.is_cancelled() {
            break;
        }

        let next = (fired_at + to_chrono(period)).max(Utc::now());
        inner.set_next_run(&name, next).await;
    }

    debug!(timer = %name, "Timer loop exited");
}

fn log_execution(result: &ExecutionResult) {
    let duration_ms = result.duration().num_milliseconds();
    if result.success() {
        info!(context = %result.context, duration_ms, "Script run completed");
    } else if result.cancelled {
        info!(context = %result.context, duration_ms, "Script run cancelled");
    } else {
        warn!(
            context = %result.context,
            exit_code = result.exit_code,
            duration_ms,
            error = %result.error,
            "Script run completed with errors"
        );
    }

    if !result.output.is_empty() {
        debug!(context = %result.context, output = %truncate_output(&result.output), "Script output");
    }
}

fn truncate_output(output: &str) -> String {
    match output.char_indices().nth(OUTPUT_LOG_LIMIT) {
        Some((cut, _)) => format!("{}...", &output[..cut]),
        None => output.to_string(),
    }
}

// Capped so adding it to a timestamp cannot overflow
fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::days(3650))
        .min(chrono::Duration::days(3650))
}
