//! The `Task` abstraction: lifecycle, progress, logs, typed result, dependency
//! gating, retry engine and cancellation. See `SPEC_FULL.md` §3 and §4.2.
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use rand::Rng;

use crate::error::Error;
use crate::group::GroupInner;
use crate::style::{self, Text};

pub type TaskId = u64;

/// Errors returned by user-supplied task bodies travel as this boxed trait object,
/// exactly like any other fallible Rust function - the engine never requires task
/// authors to adopt its own `Error` type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The finite status set from §3. `Warning` is reachable only via
/// [`TaskContext::mark_warning`] called from inside a task body that otherwise
/// returns `Ok`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Warning,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Warning | TaskStatus::Cancelled
        )
    }

    pub fn health(self) -> HealthState {
        match self {
            TaskStatus::Success => HealthState::Ok,
            TaskStatus::Warning => HealthState::Warning,
            TaskStatus::Failed | TaskStatus::Cancelled => HealthState::Error,
            TaskStatus::Pending | TaskStatus::Running => HealthState::Pending,
        }
    }

    /// The `PASS/FAIL/ERR/SKIP` test-style alias set from §3.
    pub fn as_alias(self) -> &'static str {
        match self {
            TaskStatus::Success => "PASS",
            TaskStatus::Failed => "FAIL",
            TaskStatus::Warning => "ERR",
            TaskStatus::Cancelled => "SKIP",
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Warning => "warning",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The health capability from §9 "Health-driven status override": any result value
/// carrying its own semantic verdict can opt in via [`StoredResult::with_health`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthState {
    Ok,
    Warning,
    Error,
    Pending,
}

pub trait Health: Send + Sync {
    fn health(&self) -> HealthState;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub time: DateTime<Local>,
}

/// An opaque, runtime-typed task result.
///
/// Stable Rust has no specialization, so the "does this value implement `Health`"
/// capability check happens once, at construction time, rather than via automatic
/// duck-typing on `Any`: callers who want the override use [`StoredResult::with_health`]
/// instead of [`StoredResult::new`]. See `DESIGN.md` for the tradeoff.
#[derive(Clone)]
pub struct StoredResult {
    any: Arc<dyn Any + Send + Sync>,
    health: Option<HealthState>,
    type_name: &'static str,
}

impl StoredResult {
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        StoredResult {
            any: Arc::new(value),
            health: None,
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn with_health<T: Health + Send + Sync + 'static>(value: T) -> Self {
        let health = Some(value.health());
        StoredResult {
            any: Arc::new(value),
            health,
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.any.downcast_ref::<T>()
    }

    pub fn health(&self) -> Option<HealthState> {
        self.health
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

/// The per-task retry policy, §3 "Retry policy".
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter_factor: f64,
    pub retryable_substrings: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_factor: 0.1,
            retryable_substrings: [
                "timeout",
                "connection",
                "temporary",
                "rate limit",
                "429",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Optional knobs passed to `Manager::start` / `Manager::start_with_result`.
#[derive(Clone, Default)]
pub struct TaskOptions {
    pub(crate) dependencies: Vec<Task>,
    pub(crate) priority: Option<i32>,
    pub(crate) retry: Option<RetryConfig>,
    pub(crate) identity: Option<String>,
    pub(crate) overall_timeout: Option<Duration>,
    pub(crate) attempt_timeout: Option<Duration>,
    pub(crate) metadata: HashMap<String, String>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dependencies(mut self, deps: impl IntoIterator<Item = Task>) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// The overall timeout (`WithTimeout`): applies to the whole task, across retries.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.overall_timeout = Some(duration);
        self
    }

    /// The per-attempt timeout (`WithTaskTimeout`): applies to each individual attempt.
    pub fn attempt_timeout(mut self, duration: Duration) -> Self {
        self.attempt_timeout = Some(duration);
        self
    }

    /// Arbitrary display metadata (e.g. a model name or prompt), carried for the
    /// formatter collaborator; the engine never interprets it.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Counts used by [`Task::wait_for`] / [`crate::group::Group::wait_for`] to report
/// how many (and which kind of) tasks reached a terminal status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaitResult {
    pub total: usize,
    pub success: usize,
    pub failure: usize,
    pub warning: usize,
}

impl WaitResult {
    pub(crate) fn of(status: TaskStatus) -> Self {
        let mut r = WaitResult {
            total: 1,
            ..Default::default()
        };
        match status {
            TaskStatus::Success => r.success = 1,
            TaskStatus::Warning => r.warning = 1,
            _ => r.failure = 1,
        }
        r
    }

    pub fn merge(mut self, other: WaitResult) -> Self {
        self.total += other.total;
        self.success += other.success;
        self.failure += other.failure;
        self.warning += other.warning;
        self
    }

    pub fn all_ok(&self) -> bool {
        self.failure == 0
    }
}

/// Handed to the task body on every attempt: the only way a task can observe
/// cancellation, emit logs, report progress, or request a `Warning` outcome.
pub struct TaskContext<'a> {
    task: &'a Task,
}

impl<'a> TaskContext<'a> {
    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.task.push_log(level, message.into());
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn set_progress(&self, value: u64, max: u64) {
        self.task.set_progress(value, max);
    }

    /// Explicit, capability-check-at-observation-time escape hatch: a task body
    /// that otherwise returns `Ok` can still terminate as `Warning` instead of
    /// `Success` (§4.2 "`Warning` is reachable only by explicit API call").
    pub fn mark_warning(&self) {
        self.task.mark_warning();
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }
}

pub(crate) type BodyFn =
    dyn Fn(&TaskContext) -> std::result::Result<StoredResult, BoxError> + Send + Sync;

struct MutableState {
    status: TaskStatus,
    progress_value: u64,
    progress_max: u64,
    enqueued_at: Option<DateTime<Local>>,
    start_time: Option<DateTime<Local>>,
    end_time: Option<DateTime<Local>>,
    logs: Vec<LogEntry>,
    result: Option<StoredResult>,
    error: Option<Arc<dyn std::error::Error + Send + Sync>>,
    retry_count: u32,
    mark_warning: bool,
}

pub(crate) struct TaskInner {
    id: TaskId,
    name: String,
    identity: Option<String>,
    priority: i32,
    dependencies: Vec<Task>,
    retry: RetryConfig,
    overall_deadline: Option<Instant>,
    attempt_timeout: Option<Duration>,
    metadata: HashMap<String, String>,
    cancelled: AtomicBool,
    completed: AtomicBool,
    dirty: AtomicBool,
    generation: AtomicU32,
    state: Mutex<MutableState>,
    cv: Condvar,
    parent: Mutex<Option<Weak<GroupInner>>>,
    body: Box<BodyFn>,
}

/// A cheap, `Clone`-able handle to a unit of deferred work.
///
/// Cloning a `Task` clones the handle, not the work - every clone observes and
/// mutates the same underlying state, which is how dependents, the render loop and
/// the owning `Manager` all see a single source of truth.
#[derive(Clone)]
pub struct Task(pub(crate) Arc<TaskInner>);

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: TaskId,
        name: impl Into<String>,
        body: Box<BodyFn>,
        priority: i32,
        dependencies: Vec<Task>,
        retry: RetryConfig,
        identity: Option<String>,
        overall_timeout: Option<Duration>,
        attempt_timeout: Option<Duration>,
        metadata: HashMap<String, String>,
    ) -> Task {
        let now = Local::now();
        Task(Arc::new(TaskInner {
            id,
            name: name.into(),
            identity,
            priority,
            dependencies,
            retry,
            overall_deadline: overall_timeout.map(|d| Instant::now() + d),
            attempt_timeout,
            metadata,
            cancelled: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            dirty: AtomicBool::new(true),
            generation: AtomicU32::new(0),
            state: Mutex::new(MutableState {
                status: TaskStatus::Pending,
                progress_value: 0,
                progress_max: 0,
                enqueued_at: Some(now),
                start_time: None,
                end_time: None,
                logs: Vec::new(),
                result: None,
                error: None,
                retry_count: 0,
                mark_warning: false,
            }),
            cv: Condvar::new(),
            parent: Mutex::new(None),
            body,
        }))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MutableState> {
        self.0.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> TaskId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn identity(&self) -> Option<&str> {
        self.0.identity.as_deref()
    }

    pub fn priority(&self) -> i32 {
        self.0.priority
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.0.metadata
    }

    pub fn dependencies(&self) -> &[Task] {
        &self.0.dependencies
    }

    /// The possibly health-overridden status: §4.2 "Result and error".
    pub fn status(&self) -> TaskStatus {
        let guard = self.lock();
        if guard.status == TaskStatus::Success {
            if let Some(result) = &guard.result {
                if let Some(health) = result.health() {
                    return match health {
                        HealthState::Ok => TaskStatus::Success,
                        HealthState::Warning => TaskStatus::Warning,
                        HealthState::Error => TaskStatus::Failed,
                        HealthState::Pending => TaskStatus::Pending,
                    };
                }
            }
        }
        guard.status
    }

    /// The literal state-machine status, ignoring any health override. Used
    /// internally for legality checks; exposed for callers who need the
    /// unadulterated transition history.
    pub fn raw_status(&self) -> TaskStatus {
        self.lock().status
    }

    pub fn is_completed(&self) -> bool {
        self.0.completed.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        if self.0.cancelled.load(Ordering::Acquire) {
            return true;
        }
        matches!(self.0.overall_deadline, Some(deadline) if Instant::now() >= deadline)
    }

    pub fn enqueued_at(&self) -> Option<DateTime<Local>> {
        self.lock().enqueued_at
    }

    pub fn start_time(&self) -> Option<DateTime<Local>> {
        self.lock().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Local>> {
        self.lock().end_time
    }

    pub fn duration(&self) -> Duration {
        let guard = self.lock();
        match (guard.start_time, guard.end_time) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or(Duration::ZERO),
            (Some(start), None) => (Local::now() - start).to_std().unwrap_or(Duration::ZERO),
            _ => Duration::ZERO,
        }
    }

    pub fn progress(&self) -> (u64, u64) {
        let guard = self.lock();
        (guard.progress_value, guard.progress_max)
    }

    pub fn retry_count(&self) -> u32 {
        self.lock().retry_count
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.lock().logs.clone()
    }

    pub fn result(&self) -> Option<StoredResult> {
        self.lock().result.clone()
    }

    pub fn error(&self) -> Option<Arc<dyn std::error::Error + Send + Sync>> {
        self.lock().error.clone()
    }

    /// The typed accessor: a runtime type mismatch is an error, never a panic.
    pub fn result_as<T: Clone + 'static>(&self) -> crate::error::Result<T> {
        let guard = self.lock();
        match &guard.result {
            None => Err(Error::NoResult),
            Some(result) => result
                .downcast_ref::<T>()
                .cloned()
                .ok_or(Error::ResultTypeMismatch),
        }
    }

    pub fn parent(&self) -> Option<crate::group::Group> {
        self.0
            .parent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
            .map(crate::group::Group::from_inner)
    }

    pub(crate) fn set_parent(&self, parent: Weak<GroupInner>) {
        *self.0.parent.lock().unwrap_or_else(|e| e.into_inner()) = Some(parent);
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::Release);
        let mut guard = self.lock();
        if !guard.status.is_terminal() {
            guard.status = TaskStatus::Cancelled;
            guard.end_time = Some(Local::now());
            if guard.start_time.is_none() {
                guard.start_time = Some(Local::now());
            }
            self.0.completed.store(true, Ordering::Release);
            drop(guard);
            self.mark_dirty();
            self.0.cv.notify_all();
        }
    }

    pub(crate) fn mark_dirty(&self) {
        self.0.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn take_dirty(&self) -> bool {
        self.0.dirty.swap(false, Ordering::AcqRel)
    }

    fn push_log(&self, level: LogLevel, message: String) {
        let mut guard = self.lock();
        guard.logs.push(LogEntry {
            level,
            message,
            time: Local::now(),
        });
        drop(guard);
        self.mark_dirty();
    }

    fn set_progress(&self, value: u64, max: u64) {
        let mut guard = self.lock();
        guard.progress_value = value;
        guard.progress_max = max;
        drop(guard);
        self.mark_dirty();
    }

    fn mark_warning(&self) {
        self.lock().mark_warning = true;
    }

    /// Transition straight to `Cancelled` because a dependency ended
    /// `Failed`/`Cancelled` - §4.2 "Dependency gate".
    pub(crate) fn fail_dependency(&self) {
        self.finish(
            TaskStatus::Cancelled,
            None,
            Some(Arc::new(Error::DependencyFailed)),
        );
    }

    /// §4.2 "Waiting": poll `completed` on a ~10ms tick (implemented as a
    /// condvar wait with that timeout, which is equivalent but doesn't spin)
    /// up to an absolute ceiling.
    pub fn wait_for(&self) -> WaitResult {
        self.wait_for_ceiling(Duration::from_secs(30))
    }

    pub fn wait_for_ceiling(&self, ceiling: Duration) -> WaitResult {
        let deadline = Instant::now() + ceiling;
        let mut guard = self.lock();
        loop {
            if guard.status.is_terminal() {
                break;
            }
            if self.0.cancelled.load(Ordering::Acquire) {
                guard.status = TaskStatus::Cancelled;
                guard.end_time = Some(Local::now());
                self.0.completed.store(true, Ordering::Release);
                break;
            }
            if Instant::now() >= deadline {
                guard.status = TaskStatus::Failed;
                guard.end_time = Some(Local::now());
                guard.error = Some(Arc::new(Error::WaitTimeout(ceiling)));
                self.0.completed.store(true, Ordering::Release);
                break;
            }
            let wait = deadline.saturating_duration_since(Instant::now());
            let tick = wait.min(Duration::from_millis(10));
            let (g, _) = self.0.cv.wait_timeout(guard, tick).unwrap_or_else(|e| {
                let (g, t) = e.into_inner();
                (g, t)
            });
            guard = g;
        }
        let status = guard.status;
        drop(guard);
        self.mark_dirty();
        WaitResult::of(status)
    }

    /// Produces the `Pretty()` styled-text tree from §4.2.
    pub fn pretty(&self, log_level: LogLevel) -> Text {
        let status = self.status();
        let icon = style::status_icon(status);
        let name = truncate(&self.0.name, 48);
        let duration = humanize(self.duration());
        let head = format!("{icon} {name}");
        let logs: Vec<Text> = self
            .logs()
            .into_iter()
            .filter(|l| l.level >= log_level)
            .rev()
            .take(5)
            .rev()
            .map(|l| {
                Text::leaf(
                    format!("{} {}", l.level, l.message),
                    style::log_style_class(l.level),
                )
            })
            .collect();
        Text::node(
            format!("{head}{:>pad$}", duration, pad = 50usize.saturating_sub(head.len())),
            style::status_style_class(status),
            logs,
        )
    }

    /// The retry engine (§4.2). Runs to a terminal status; never returns early.
    pub(crate) fn execute(&self) {
        {
            let mut guard = self.lock();
            // A task can be cancelled while still `Pending` in the queue, before a
            // worker ever picks it up; a terminal status must never be forced back
            // to `Running` (§4.2, §8 "no terminal state ever transitions again").
            if guard.status.is_terminal() {
                return;
            }
            if guard.start_time.is_none() {
                guard.start_time = Some(Local::now());
            }
            guard.status = TaskStatus::Running;
        }
        self.mark_dirty();

        if self.is_cancelled() {
            self.finish(TaskStatus::Cancelled, None, Some(Arc::new(Error::Cancelled)));
            return;
        }

        loop {
            let ctx = TaskContext { task: self };
            let outcome = self.run_one_attempt(&ctx);

            match outcome {
                Ok(result) => {
                    // A cancellation (via `Task::cancel`, `Group::cancel`, `CancelAll`, or
                    // overall-timeout expiry) may have landed the task in `Cancelled` while
                    // this attempt was still running; a body that then returns `Ok` must not
                    // resurrect it into `Success` (§5: "one that returns nil after
                    // cancellation still lands in `Cancelled`").
                    if self.is_cancelled() {
                        self.finish(TaskStatus::Cancelled, None, Some(Arc::new(Error::Cancelled)));
                        return;
                    }
                    let warned = {
                        let mut guard = self.lock();
                        std::mem::replace(&mut guard.mark_warning, false)
                    };
                    let status = if warned {
                        TaskStatus::Warning
                    } else {
                        TaskStatus::Success
                    };
                    self.finish(status, Some(result), None);
                    return;
                }
                Err(err) => {
                    if self.is_cancelled() {
                        self.finish(TaskStatus::Cancelled, None, Some(Arc::from(err)));
                        return;
                    }

                    let retry_count = self.retry_count();
                    let retryable = is_retryable(&err, &self.0.retry.retryable_substrings);
                    if retryable && retry_count < self.0.retry.max_retries {
                        self.push_log(
                            LogLevel::Warn,
                            format!("attempt {} failed: {err}; retrying", retry_count + 1),
                        );
                        {
                            let mut guard = self.lock();
                            guard.retry_count += 1;
                        }
                        let delay = compute_backoff_delay(&self.0.retry, retry_count + 1);
                        if self.sleep_or_cancel(delay) {
                            self.finish(
                                TaskStatus::Cancelled,
                                None,
                                Some(Arc::new(Error::Cancelled)),
                            );
                            return;
                        }
                        continue;
                    }

                    self.push_log(LogLevel::Error, format!("{err}"));
                    self.finish(TaskStatus::Failed, None, Some(Arc::from(err)));
                    return;
                }
            }
        }
    }

    /// Runs a single attempt, enforcing the per-attempt timeout (if any) with an
    /// abandon-the-thread pattern: synchronous Rust has no way to forcibly stop a
    /// blocking closure, so a timed-out attempt's thread is left to finish on its
    /// own while the engine moves on and treats it as a cancellation-kind error.
    fn run_one_attempt(&self, ctx: &TaskContext<'_>) -> std::result::Result<StoredResult, BoxError> {
        let Some(attempt_timeout) = self.0.attempt_timeout else {
            return (self.0.body)(ctx);
        };

        let (tx, rx) = mpsc::channel();
        // The spawned thread keeps its own `Arc` clone of the task's inner state, so
        // if `recv_timeout` below fires first the thread is simply abandoned: it runs
        // to completion (or forever) on its own and its result is dropped on the floor
        // when nobody reads the channel again.
        let ctx_task = Task(self.0.clone());
        std::thread::spawn(move || {
            let ctx = TaskContext { task: &ctx_task };
            let result = (ctx_task.0.body)(&ctx);
            let _ = tx.send(result);
        });

        match rx.recv_timeout(attempt_timeout) {
            Ok(result) => result,
            Err(_) => Err(Box::new(Error::Timeout(attempt_timeout)) as BoxError),
        }
    }

    fn sleep_or_cancel(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            std::thread::sleep(remaining.min(Duration::from_millis(20)));
        }
    }

    /// Terminal-state transition. No-op if the task is already terminal: no
    /// terminal state ever transitions again (§4.2, §8), so a caller racing
    /// with e.g. a concurrent cancellation must never clobber it.
    fn finish(
        &self,
        status: TaskStatus,
        result: Option<StoredResult>,
        error: Option<Arc<dyn std::error::Error + Send + Sync>>,
    ) {
        let mut guard = self.lock();
        if guard.status.is_terminal() {
            return;
        }
        guard.status = status;
        guard.end_time = Some(Local::now());
        if guard.start_time.is_none() {
            guard.start_time = Some(Local::now());
        }
        if status == TaskStatus::Success || status == TaskStatus::Warning {
            guard.result = result;
        }
        if status == TaskStatus::Failed || status == TaskStatus::Cancelled {
            guard.error = error;
        }
        drop(guard);
        self.0.completed.store(true, Ordering::Release);
        self.0.generation.fetch_add(1, Ordering::AcqRel);
        self.mark_dirty();
        self.0.cv.notify_all();
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("status", &self.raw_status())
            .field("priority", &self.0.priority)
            .finish()
    }
}

/// Shared by `Task` and `Group`: anything that can resolve to a flat list of
/// leaf tasks. Nested groups flatten through this same interface (§3 "Group").
pub trait Taskable: Send + Sync {
    fn tasks(&self) -> Vec<Task>;
}

impl Taskable for Task {
    fn tasks(&self) -> Vec<Task> {
        vec![self.clone()]
    }
}

fn is_retryable(err: &BoxError, substrings: &[String]) -> bool {
    let message = err.to_string().to_lowercase();
    substrings
        .iter()
        .any(|needle| message.contains(&needle.to_lowercase()))
}

fn compute_backoff_delay(retry: &RetryConfig, attempt_number: u32) -> Duration {
    let exponent = attempt_number.saturating_sub(1) as i32;
    let raw = retry.base_delay.as_secs_f64() * retry.backoff_factor.powi(exponent);
    let capped = raw.min(retry.max_delay.as_secs_f64()).max(0.0);
    let jitter_span = capped * retry.jitter_factor;
    let jitter = if jitter_span > 0.0 {
        rand::rng().random_range(-jitter_span..=jitter_span)
    } else {
        0.0
    };
    Duration::from_secs_f64((capped + jitter).max(0.0))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{truncated}…")
    }
}

pub(crate) fn humanize(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}.{:01}s", secs, d.subsec_millis() / 100)
    }
}
