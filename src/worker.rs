//! The worker daemon.
//!
//! A [`Worker`] claims one job at a time from one or more queues of a
//! connection, runs it under a deadline, and applies the retry policy when it
//! errors: release for another attempt, or fail permanently once the job has
//! used up its tries or passed its `timeoutAt`. Between jobs it checks whether
//! it should stop: a quit request, the memory limit, or a restart request.
//!
//! ```rust,no_run
//! use queuework::{
//!     EventManager, HandlerRegistry, QueueManager, Worker, WorkerOptions,
//!     handler::handler_fn,
//!     queue::{ConnectionConfig, RedisConnectionConfig},
//! };
//! use std::{collections::BTreeMap, sync::Arc};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut connections = BTreeMap::new();
//! connections.insert(
//!     "redis".to_string(),
//!     ConnectionConfig::Redis(RedisConnectionConfig::new("redis://127.0.0.1/")),
//! );
//! let manager = Arc::new(QueueManager::from_config("redis", connections));
//!
//! let handlers = HandlerRegistry::new().with_handler(
//!     "send_email",
//!     handler_fn(|data| async move {
//!         println!("sending {}", data);
//!         Ok(())
//!     }),
//! );
//!
//! let worker = Worker::new(manager, Arc::new(handlers), Arc::new(EventManager::new_default()));
//! let exit = worker.daemon("redis", "high,default", &WorkerOptions::default()).await;
//! std::process::exit(exit.exit_code());
//! # }
//! ```

use crate::{
    QueueworkError, Result,
    config::duration_secs,
    events::{EventSink, QueueEvent},
    failing::FailingJob,
    handler::{HandlerRegistry, JobContext},
    job::{Job, JobSnapshot, unix_now},
    memory::{MemoryProbe, ProcMemoryProbe},
    queue::QueueManager,
    reporter::{ExceptionReporter, TracingReporter},
    restart::RestartSignal,
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
        mpsc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Exit status used when the worker stops because it reached its memory limit.
pub const MEMORY_EXCEEDED_STATUS: i32 = 12;

/// Exit status used when a job outlives its deadline and the process is terminated.
pub const TIMEOUT_EXIT_STATUS: i32 = 1;

#[cfg(target_os = "linux")]
const SIGCONT: i32 = 18;
#[cfg(all(unix, not(target_os = "linux")))]
const SIGCONT: i32 = 19;

/// Options controlling a worker run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Delay before a failed job is retried
    #[serde(with = "duration_secs")]
    pub delay: Duration,
    /// Resident memory limit in megabytes
    pub memory: u64,
    /// Default job deadline; zero disables deadlines
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Idle time between polls of empty queues
    #[serde(with = "duration_secs")]
    pub sleep: Duration,
    /// Attempts allowed for jobs that do not set their own; zero means unlimited
    pub max_tries: u32,
    /// Process jobs even in maintenance mode
    pub force: bool,
    /// Time a job may overrun its deadline before the process is terminated
    #[serde(with = "duration_secs")]
    pub kill_grace: Duration,
    /// Stop once every queue is empty
    pub stop_when_empty: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            memory: 128,
            timeout: Duration::from_secs(60),
            sleep: Duration::from_secs(3),
            max_tries: 0,
            force: false,
            kill_grace: Duration::from_secs(5),
            stop_when_empty: false,
        }
    }
}

impl WorkerOptions {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_memory(mut self, megabytes: u64) -> Self {
        self.memory = megabytes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_stop_when_empty(mut self, stop: bool) -> Self {
        self.stop_when_empty = stop;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    NotRunning,
    Running,
    Paused,
    Stopping,
}

impl WorkerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerStatus::Running,
            2 => WorkerStatus::Paused,
            3 => WorkerStatus::Stopping,
            _ => WorkerStatus::NotRunning,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerStatus::NotRunning => 0,
            WorkerStatus::Running => 1,
            WorkerStatus::Paused => 2,
            WorkerStatus::Stopping => 3,
        }
    }
}

/// How a daemon run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The worker stopped itself between jobs
    Stopped { status: i32 },
    /// The worker was asked to quit
    Killed { status: i32 },
}

impl WorkerExit {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerExit::Stopped { status } | WorkerExit::Killed { status } => *status,
        }
    }
}

#[derive(Debug, Default)]
struct WorkerFlags {
    should_quit: AtomicBool,
    paused: AtomicBool,
    status: AtomicU8,
}

impl WorkerFlags {
    fn set_status(&self, status: WorkerStatus) {
        self.status.store(status.as_u8(), Ordering::SeqCst);
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }
}

/// Controls a running worker from another task or a signal listener.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    flags: Arc<WorkerFlags>,
}

impl WorkerHandle {
    /// Stop claiming jobs until resumed.
    pub fn pause(&self) {
        self.flags.paused.store(true, Ordering::SeqCst);
        if self.flags.status() == WorkerStatus::Running {
            self.flags.set_status(WorkerStatus::Paused);
        }
        info!("Worker paused");
    }

    pub fn resume(&self) {
        self.flags.paused.store(false, Ordering::SeqCst);
        if self.flags.status() == WorkerStatus::Paused {
            self.flags.set_status(WorkerStatus::Running);
        }
        info!("Worker resumed");
    }

    /// Exit after the current job finishes.
    pub fn quit(&self) {
        self.flags.should_quit.store(true, Ordering::SeqCst);
        info!("Worker asked to quit");
    }

    pub fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::SeqCst)
    }

    pub fn should_quit(&self) -> bool {
        self.flags.should_quit.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> WorkerStatus {
        self.flags.status()
    }
}

/// Terminates the process if a job is still running well past its deadline.
/// Dropping the guard disarms it.
struct Watchdog {
    _disarm: mpsc::Sender<()>,
}

impl Watchdog {
    fn arm(job: String, limit: Duration) -> Option<Self> {
        let (disarm, disarmed) = mpsc::channel::<()>();

        let spawned = std::thread::Builder::new()
            .name("queuework-watchdog".to_string())
            .spawn(move || {
                if let Err(mpsc::RecvTimeoutError::Timeout) = disarmed.recv_timeout(limit) {
                    error!(
                        "Job {} is still running {:?} after it started; terminating worker",
                        job, limit
                    );
                    std::process::exit(TIMEOUT_EXIT_STATUS);
                }
            });

        match spawned {
            Ok(_) => Some(Self { _disarm: disarm }),
            Err(e) => {
                warn!("Could not start timeout watchdog: {}", e);
                None
            }
        }
    }
}

pub type MaintenanceCheck = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct Worker {
    manager: Arc<QueueManager>,
    failer: Arc<FailingJob>,
    events: Arc<dyn EventSink>,
    reporter: Arc<dyn ExceptionReporter>,
    restart: Option<Arc<dyn RestartSignal>>,
    memory: Arc<dyn MemoryProbe>,
    maintenance: Option<MaintenanceCheck>,
    flags: Arc<WorkerFlags>,
}

impl Worker {
    pub fn new(
        manager: Arc<QueueManager>,
        handlers: Arc<HandlerRegistry>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            manager,
            failer: Arc::new(FailingJob::new(handlers, events.clone())),
            events,
            reporter: Arc::new(TracingReporter),
            restart: None,
            memory: Arc::new(ProcMemoryProbe),
            maintenance: None,
            flags: Arc::new(WorkerFlags::default()),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ExceptionReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_restart_signal(mut self, restart: Arc<dyn RestartSignal>) -> Self {
        self.restart = Some(restart);
        self
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = probe;
        self
    }

    /// Report maintenance mode; jobs are not claimed while it returns true
    /// unless the run is forced.
    pub fn with_maintenance_check<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.maintenance = Some(Arc::new(check));
        self
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            flags: self.flags.clone(),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.flags.status()
    }

    /// Quit on SIGTERM, pause on SIGUSR2, resume on SIGCONT.
    #[cfg(unix)]
    pub fn listen_for_signals(&self) -> Result<tokio::task::JoinHandle<()>> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut pause = signal(SignalKind::user_defined2())?;
        let mut resume = signal(SignalKind::from_raw(SIGCONT))?;
        let handle = self.handle();

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(()) = terminate.recv() => handle.quit(),
                    Some(()) = pause.recv() => handle.pause(),
                    Some(()) = resume.recv() => handle.resume(),
                    else => break,
                }
            }
        }))
    }

    /// Process jobs from `queue` (comma-separated, highest priority first)
    /// until a stop condition is met.
    pub async fn daemon(&self, connection: &str, queue: &str, options: &WorkerOptions) -> WorkerExit {
        self.flags.set_status(if self.handle().is_paused() {
            WorkerStatus::Paused
        } else {
            WorkerStatus::Running
        });

        let last_restart = self.timestamp_of_last_restart().await;
        info!("Worker started on {} [{}]", connection, queue);

        loop {
            if !self.daemon_should_run(options, connection, queue).await {
                if let Some(exit) = self.pause_worker(options, last_restart).await {
                    return exit;
                }
                continue;
            }

            match self.get_next_job(connection, queue).await {
                Some(mut job) => self.run_job(job.as_mut(), connection, options).await,
                None => {
                    if options.stop_when_empty {
                        return self.stop(0).await;
                    }
                    self.sleep(options.sleep).await;
                }
            }

            if let Some(exit) = self.stop_if_necessary(options, last_restart).await {
                return exit;
            }
        }
    }

    /// Claim and run a single job. Returns whether a job was found.
    pub async fn run_next_job(&self, connection: &str, queue: &str, options: &WorkerOptions) -> bool {
        match self.get_next_job(connection, queue).await {
            Some(mut job) => {
                self.run_job(job.as_mut(), connection, options).await;
                true
            }
            None => {
                self.sleep(options.sleep).await;
                false
            }
        }
    }

    async fn daemon_should_run(&self, options: &WorkerOptions, connection: &str, queue: &str) -> bool {
        if !options.force && self.maintenance.as_ref().is_some_and(|check| check()) {
            return false;
        }

        if self.flags.paused.load(Ordering::SeqCst) {
            return false;
        }

        self.events
            .until(QueueEvent::Looping {
                connection: connection.to_string(),
                queue: queue.to_string(),
            })
            .await
    }

    async fn pause_worker(&self, options: &WorkerOptions, last_restart: Option<i64>) -> Option<WorkerExit> {
        self.sleep(options.sleep.max(Duration::from_secs(1))).await;
        self.stop_if_necessary(options, last_restart).await
    }

    async fn stop_if_necessary(&self, options: &WorkerOptions, last_restart: Option<i64>) -> Option<WorkerExit> {
        if self.flags.should_quit.load(Ordering::SeqCst) {
            return Some(self.kill(0).await);
        }

        if self.memory_exceeded(options.memory) {
            return Some(self.stop(MEMORY_EXCEEDED_STATUS).await);
        }

        if self.queue_should_restart(last_restart).await {
            return Some(self.stop(0).await);
        }

        None
    }

    /// Pop from each queue in order and return the first job found.
    async fn get_next_job(&self, connection: &str, queue: &str) -> Option<Box<dyn Job>> {
        let result = async {
            let backend = self.manager.connection(Some(connection)).await?;
            for name in queue.split(',').map(str::trim).filter(|name| !name.is_empty()) {
                if let Some(job) = backend.pop(Some(name)).await? {
                    return Ok(Some(job));
                }
            }
            Ok::<_, QueueworkError>(None)
        }
        .await;

        match result {
            Ok(job) => job,
            Err(e) => {
                self.reporter.report(&e);
                self.stop_worker_if_lost_connection(&e);
                self.sleep(Duration::from_secs(1)).await;
                None
            }
        }
    }

    async fn run_job(&self, job: &mut dyn Job, connection: &str, options: &WorkerOptions) {
        let timeout = self.timeout_for_job(job, options);
        let _watchdog = timeout.and_then(|limit| {
            Watchdog::arm(
                format!("{} ({})", job.display_name(), job.job_id()),
                limit.saturating_add(options.kill_grace),
            )
        });

        if let Err(e) = self.process(connection, job, options, timeout).await {
            self.reporter.report(&e);
            self.stop_worker_if_lost_connection(&e);
        }
    }

    /// Deadline for a job: the larger of its own timeout and the worker's, or
    /// none when both are zero.
    fn timeout_for_job(&self, job: &dyn Job, options: &WorkerOptions) -> Option<Duration> {
        let own = Duration::from_secs(job.timeout().unwrap_or(0));
        let limit = own.max(options.timeout);
        (!limit.is_zero()).then_some(limit)
    }

    fn stop_worker_if_lost_connection(&self, error: &QueueworkError) {
        if error.causes_lost_connection() {
            warn!("Lost connection to the queue backend; worker will quit");
            self.flags.should_quit.store(true, Ordering::SeqCst);
        }
    }

    /// Run one reserved job through the retry and failure policy.
    pub async fn process(
        &self,
        connection: &str,
        job: &mut dyn Job,
        options: &WorkerOptions,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.events
            .dispatch(QueueEvent::JobProcessing {
                connection: connection.to_string(),
                job: JobSnapshot::of(job),
            })
            .await;

        let outcome = match self
            .mark_job_as_failed_if_already_exceeds_max_attempts(connection, job, options.max_tries)
            .await
        {
            Ok(()) => match self.fire(job, timeout).await {
                Ok(()) if !job.is_deleted_or_released() && !job.has_failed() => job.delete().await,
                other => other,
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                debug!("Job {} processed", job.job_id());
                self.events
                    .dispatch(QueueEvent::JobProcessed {
                        connection: connection.to_string(),
                        job: JobSnapshot::of(job),
                    })
                    .await;
                Ok(())
            }
            Err(e) => self.handle_job_exception(connection, job, options, e).await,
        }
    }

    async fn fire(&self, job: &mut dyn Job, timeout: Option<Duration>) -> Result<()> {
        let handlers = self.failer.handlers();
        let cancel = CancellationToken::new();
        let display_name = job.display_name().to_string();
        let mut ctx = JobContext::new(job, &self.failer, cancel.clone());

        let Some(limit) = timeout else {
            return handlers.fire(&mut ctx).await;
        };

        match tokio::time::timeout(limit, handlers.fire(&mut ctx)).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                warn!("Job {} timed out after {:?}", display_name, limit);
                Err(QueueworkError::Timeout {
                    job: display_name,
                    seconds: limit.as_secs(),
                })
            }
        }
    }

    async fn handle_job_exception(
        &self,
        connection: &str,
        job: &mut dyn Job,
        options: &WorkerOptions,
        error: QueueworkError,
    ) -> Result<()> {
        if !job.has_failed() {
            self.mark_job_as_failed_if_will_exceed_max_attempts(connection, job, options.max_tries, &error)
                .await;
        }

        self.events
            .dispatch(QueueEvent::JobExceptionOccurred {
                connection: connection.to_string(),
                job: JobSnapshot::of(job),
                error: error.to_string(),
            })
            .await;

        if !job.is_deleted() && !job.is_released() && !job.has_failed() {
            debug!("Releasing job {} for another attempt in {:?}", job.job_id(), options.delay);
            if let Err(release_error) = job.release(options.delay).await {
                self.reporter.report(&release_error);
                self.stop_worker_if_lost_connection(&release_error);
            }
        }

        Err(error)
    }

    /// Fail a re-delivered job that has already used up its tries or passed its
    /// deadline, without running it.
    async fn mark_job_as_failed_if_already_exceeds_max_attempts(
        &self,
        connection: &str,
        job: &mut dyn Job,
        max_tries: u32,
    ) -> Result<()> {
        let max_tries = job.max_tries().unwrap_or(max_tries);

        let tries_exceeded = max_tries > 0 && job.attempts() > max_tries;

        if !job.payload().deadline_passed(unix_now()) && !tries_exceeded {
            return Ok(());
        }

        let error = QueueworkError::MaxAttemptsExceeded {
            job: job.display_name().to_string(),
        };
        self.fail_job(connection, job, &error).await;
        Err(error)
    }

    async fn mark_job_as_failed_if_will_exceed_max_attempts(
        &self,
        connection: &str,
        job: &mut dyn Job,
        max_tries: u32,
        error: &QueueworkError,
    ) {
        let max_tries = job.max_tries().unwrap_or(max_tries);

        let tries_used = max_tries > 0 && job.attempts() >= max_tries;

        if job.payload().deadline_passed(unix_now()) || tries_used {
            self.fail_job(connection, job, error).await;
        }
    }

    async fn fail_job(&self, connection: &str, job: &mut dyn Job, error: &QueueworkError) {
        warn!(
            "Job {} ({}) failed permanently after {} attempts: {}",
            job.display_name(),
            job.job_id(),
            job.attempts(),
            error
        );

        if let Err(e) = self.failer.handle(connection, job, error).await {
            self.reporter.report(&e);
        }
    }

    /// Whether resident memory is at or above `limit` megabytes.
    pub fn memory_exceeded(&self, limit: u64) -> bool {
        self.memory
            .resident_megabytes()
            .is_some_and(|megabytes| megabytes >= limit as f64)
    }

    async fn timestamp_of_last_restart(&self) -> Option<i64> {
        let restart = self.restart.as_ref()?;
        match restart.last_restart().await {
            Ok(timestamp) => timestamp,
            Err(e) => {
                self.reporter.report(&e);
                None
            }
        }
    }

    async fn queue_should_restart(&self, last_restart: Option<i64>) -> bool {
        if self.restart.is_none() {
            return false;
        }
        self.timestamp_of_last_restart().await != last_restart
    }

    /// End the run between jobs.
    pub async fn stop(&self, status: i32) -> WorkerExit {
        self.flags.set_status(WorkerStatus::Stopping);
        self.events
            .dispatch(QueueEvent::WorkerStopping { status })
            .await;
        info!("Worker stopping with status {}", status);
        WorkerExit::Stopped { status }
    }

    /// End the run at the request of a signal or handle.
    pub async fn kill(&self, status: i32) -> WorkerExit {
        self.flags.set_status(WorkerStatus::Stopping);
        self.events
            .dispatch(QueueEvent::WorkerStopping { status })
            .await;
        info!("Worker quitting with status {}", status);
        WorkerExit::Killed { status }
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}
