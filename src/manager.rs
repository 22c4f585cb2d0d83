//! `Manager`: the scheduler owning the worker pool, priority queue, signal
//! handling and render loop. See `SPEC_FULL.md` §3, §4.1.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use crossterm::tty::IsTty;

use crate::config::{env_verbose, ManagerConfig};
use crate::error::{Error, Result};
use crate::group::Group;
use crate::queue::PriorityQueue;
use crate::style::OutputStyle;
use crate::task::{
    BodyFn, BoxError, Health, RetryConfig, StoredResult, Task, TaskContext, TaskOptions,
    TaskStatus,
};

pub(crate) struct ManagerInner {
    max_concurrent: AtomicUsize,
    no_color: AtomicBool,
    no_progress: AtomicBool,
    verbose: AtomicBool,
    interactive: AtomicBool,
    width: AtomicU16,
    graceful_timeout: Mutex<Duration>,
    retry_default: Mutex<RetryConfig>,
    queue: PriorityQueue,
    registry: Mutex<Vec<Task>>,
    identity_map: Mutex<HashMap<String, Task>>,
    next_id: AtomicU64,
    active_workers: AtomicUsize,
    shutdown: AtomicBool,
    shutdown_once: Once,
    interrupt_handler: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    style: Mutex<OutputStyle>,
}

impl ManagerInner {
    pub(crate) fn submit(self: &Arc<Self>, name: String, body: Box<BodyFn>, opts: TaskOptions) -> Task {
        if let Some(identity) = &opts.identity {
            let map = self.identity_map.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = map.get(identity) {
                if !existing.is_completed() {
                    return existing.clone();
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let priority = opts
            .priority
            .unwrap_or(if opts.dependencies.is_empty() { 0 } else { 1 });
        let retry = opts
            .retry
            .clone()
            .unwrap_or_else(|| self.retry_default.lock().unwrap_or_else(|e| e.into_inner()).clone());

        let task = Task::new(
            id,
            name,
            body,
            priority,
            opts.dependencies.clone(),
            retry,
            opts.identity.clone(),
            opts.overall_timeout,
            opts.attempt_timeout,
            opts.metadata.clone(),
        );

        if let Some(identity) = &opts.identity {
            self.identity_map
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(identity.clone(), task.clone());
        }
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task.clone());
        tracing::debug!(task_id = id, name = task.name(), priority, "task enqueued");
        self.queue.push(task.clone());
        task
    }

    fn clear_identity(&self, identity: &str, task: &Task) {
        let mut map = self.identity_map.lock().unwrap_or_else(|e| e.into_inner());
        if map.get(identity).is_some_and(|t| t.id() == task.id()) {
            map.remove(identity);
        }
    }

    fn graceful_timeout(&self) -> Duration {
        *self.graceful_timeout.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel_all(&self) {
        for task in self.registry.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            task.cancel();
        }
    }

    fn install_signal_handler(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        let signal_count = AtomicU8::new(0);
        ctrlc::set_handler(move || {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            match signal_count.fetch_add(1, Ordering::AcqRel) + 1 {
                1 => manager.handle_first_signal(),
                2 => manager.handle_second_signal(),
                _ => panic!("received a third interrupt signal; aborting"),
            }
        })
        .map_err(Error::SignalSetup)?;
        Ok(())
    }

    /// First `SIGINT`/`SIGTERM`: graceful shutdown, guarded to run at most once.
    fn handle_first_signal(self: &Arc<Self>) {
        self.shutdown_once.call_once(|| {
            tracing::warn!("received interrupt, shutting down gracefully");
            eprintln!("\nreceived interrupt, shutting down gracefully (press again to force)...");
            if let Some(handler) = self.interrupt_handler.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                handler();
            }
            self.cancel_all();
            let deadline = Instant::now() + self.graceful_timeout();
            while Instant::now() < deadline {
                if self.queue.is_empty() && self.active_workers.load(Ordering::Acquire) == 0 {
                    break;
                }
                thread::sleep(Duration::from_millis(20));
            }
            let drained = self.queue.is_empty() && self.active_workers.load(Ordering::Acquire) == 0;
            self.shutdown.store(true, Ordering::Release);
            std::process::exit(if drained { 0 } else { 1 });
        });
    }

    /// Second signal: force exit, dumping whatever diagnostics are available.
    fn handle_second_signal(self: &Arc<Self>) {
        tracing::error!("received second interrupt, forcing exit");
        eprintln!("\nforcing exit...");
        eprintln!(
            "active workers: {}/{}",
            self.active_workers.load(Ordering::Acquire),
            self.max_concurrent.load(Ordering::Acquire)
        );
        eprintln!("{}", std::backtrace::Backtrace::force_capture());
        thread::sleep(Duration::from_millis(100));
        std::process::exit(130);
    }
}

/// A cheap, `Clone`-able handle to the scheduler. Construction spawns the
/// worker pool, installs the signal handler, and starts the render loop.
#[derive(Clone)]
pub struct Manager(pub(crate) Arc<ManagerInner>);

impl Manager {
    pub fn new(max_concurrent: usize) -> Result<Manager> {
        Self::with_config(ManagerConfig {
            max_concurrent,
            ..ManagerConfig::default()
        })
    }

    pub fn with_config(config: ManagerConfig) -> Result<Manager> {
        let max_concurrent = config.max_concurrent.max(1);
        let is_tty = std::io::stderr().is_tty();
        let interactive = is_tty && !config.verbose && !env_verbose();
        let width = config
            .width
            .or_else(|| crossterm::terminal::size().ok().map(|(w, _)| w))
            .unwrap_or(80);

        let inner = Arc::new(ManagerInner {
            max_concurrent: AtomicUsize::new(max_concurrent),
            no_color: AtomicBool::new(config.no_color || !is_tty),
            no_progress: AtomicBool::new(config.no_progress),
            verbose: AtomicBool::new(config.verbose || env_verbose()),
            interactive: AtomicBool::new(interactive),
            width: AtomicU16::new(width),
            graceful_timeout: Mutex::new(config.graceful_timeout),
            retry_default: Mutex::new(RetryConfig::default()),
            queue: PriorityQueue::new(),
            registry: Mutex::new(Vec::new()),
            identity_map: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            active_workers: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            shutdown_once: Once::new(),
            interrupt_handler: Mutex::new(None),
            style: Mutex::new(OutputStyle::new(is_tty && !config.no_color)),
        });

        for _ in 0..max_concurrent {
            let worker = inner.clone();
            thread::spawn(move || worker_loop(worker));
        }

        if config.install_signal_handler {
            inner.install_signal_handler()?;
        }

        let renderer = inner.clone();
        thread::spawn(move || render_loop(renderer));

        Ok(Manager(inner))
    }

    /// `Start(name, opts…)`.
    pub fn start<F>(&self, name: impl Into<String>, body: F, opts: TaskOptions) -> Task
    where
        F: Fn(&TaskContext) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        let wrapped: Box<BodyFn> = Box::new(move |ctx| body(ctx).map(StoredResult::new));
        self.0.submit(name.into(), wrapped, opts)
    }

    /// `StartWithResult(name, fn, opts…)`.
    pub fn start_with_result<T, F>(&self, name: impl Into<String>, body: F, opts: TaskOptions) -> Task
    where
        T: Send + Sync + 'static,
        F: Fn(&TaskContext) -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        let wrapped: Box<BodyFn> = Box::new(move |ctx| body(ctx).map(StoredResult::new));
        self.0.submit(name.into(), wrapped, opts)
    }

    /// Like [`Manager::start_with_result`], but the value opts into the
    /// health-driven status override (§4.2 "Result and error").
    pub fn start_with_health<T, F>(&self, name: impl Into<String>, body: F, opts: TaskOptions) -> Task
    where
        T: Health + Send + Sync + 'static,
        F: Fn(&TaskContext) -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        let wrapped: Box<BodyFn> = Box::new(move |ctx| body(ctx).map(StoredResult::with_health));
        self.0.submit(name.into(), wrapped, opts)
    }

    pub fn start_group(&self, name: impl Into<String>) -> Group {
        Group::new(name, Arc::downgrade(&self.0))
    }

    /// Blocks until the queue is empty, no worker is active and every known
    /// task is `completed`; returns the process exit-code verdict.
    pub fn wait(&self) -> i32 {
        loop {
            let registry = self.0.registry.lock().unwrap_or_else(|e| e.into_inner());
            let all_completed = registry.iter().all(|t| t.is_completed());
            let idle = self.0.active_workers.load(Ordering::Acquire) == 0;
            let empty = self.0.queue.is_empty();
            drop(registry);
            if all_completed && idle && empty {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        self.0.shutdown.store(true, Ordering::Release);
        let registry = self.0.registry.lock().unwrap_or_else(|e| e.into_inner());
        if registry
            .iter()
            .any(|t| matches!(t.status(), TaskStatus::Failed | TaskStatus::Cancelled))
        {
            1
        } else {
            0
        }
    }

    pub fn cancel_all(&self) {
        self.0.cancel_all();
    }

    pub fn set_max_concurrent(&self, n: usize) {
        self.0.max_concurrent.store(n.max(1), Ordering::Release);
    }

    pub fn set_retry_config(&self, cfg: RetryConfig) {
        *self.0.retry_default.lock().unwrap_or_else(|e| e.into_inner()) = cfg;
    }

    pub fn set_graceful_timeout(&self, d: Duration) {
        *self.0.graceful_timeout.lock().unwrap_or_else(|e| e.into_inner()) = d;
    }

    pub fn set_interrupt_handler(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.0.interrupt_handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(f));
    }

    pub fn set_no_color(&self, b: bool) {
        self.0.no_color.store(b, Ordering::Release);
        let is_tty = std::io::stderr().is_tty();
        *self.0.style.lock().unwrap_or_else(|e| e.into_inner()) = OutputStyle::new(is_tty && !b);
    }

    pub fn set_no_progress(&self, b: bool) {
        self.0.no_progress.store(b, Ordering::Release);
    }

    /// The render width hint currently in effect (auto-detected at
    /// construction unless pinned via [`ManagerConfig::width`]).
    pub fn width(&self) -> u16 {
        self.0.width.load(Ordering::Acquire)
    }

    pub fn set_width(&self, width: u16) {
        self.0.width.store(width, Ordering::Release);
    }

    pub fn set_verbose(&self, b: bool) {
        self.0.verbose.store(b, Ordering::Release);
        self.0
            .interactive
            .store(std::io::stderr().is_tty() && !b, Ordering::Release);
    }

    /// A `Manager` with the process-wide signal handler disabled, for tests
    /// that construct many instances in one process (`ctrlc` allows only one).
    #[cfg(test)]
    pub(crate) fn for_test(max_concurrent: usize) -> Manager {
        Manager::with_config(ManagerConfig {
            max_concurrent,
            install_signal_handler: false,
            ..ManagerConfig::default()
        })
        .expect("manager construction without a signal handler cannot fail")
    }
}

fn worker_loop(manager: Arc<ManagerInner>) {
    loop {
        if manager.shutdown.load(Ordering::Acquire) {
            return;
        }

        let Some(task) = manager.queue.pop() else {
            thread::sleep(Duration::from_millis(10));
            continue;
        };

        if task
            .dependencies()
            .iter()
            .any(|dep| matches!(dep.status(), TaskStatus::Failed | TaskStatus::Cancelled))
        {
            task.fail_dependency();
            finish_task(&manager, &task);
            continue;
        }

        if !task.dependencies().iter().all(|dep| dep.is_completed()) {
            thread::sleep(Duration::from_millis(50));
            manager.queue.push_with_priority(task.priority(), task);
            continue;
        }

        // Admit atomically against the *current* `max_concurrent` (it can be
        // lowered at runtime via `set_max_concurrent`): a plain load-then-add
        // lets two workers both observe room for one more and overrun the
        // gate. `fetch_update` retries its whole read-compare-write as one
        // atomic step, so at most `max_concurrent` tasks are ever admitted.
        let admitted = manager
            .active_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let gate = manager.max_concurrent.load(Ordering::Acquire);
                (current < gate).then_some(current + 1)
            })
            .is_ok();

        if !admitted {
            thread::sleep(Duration::from_millis(10));
            manager.queue.push_with_priority(task.priority(), task);
            continue;
        }

        task.execute();
        manager.active_workers.fetch_sub(1, Ordering::AcqRel);
        finish_task(&manager, &task);
    }
}

fn finish_task(manager: &Arc<ManagerInner>, task: &Task) {
    if let Some(identity) = task.identity() {
        manager.clear_identity(identity, task);
    }
    tracing::debug!(task_id = task.id(), status = %task.status(), "task finished");
}

fn render_loop(manager: Arc<ManagerInner>) {
    loop {
        if manager.shutdown.load(Ordering::Acquire) {
            return;
        }
        thread::sleep(Duration::from_millis(250));
        render_tick(&manager);
    }
}

fn render_tick(manager: &Arc<ManagerInner>) {
    if manager.no_progress.load(Ordering::Acquire) {
        return;
    }
    let style = *manager.style.lock().unwrap_or_else(|e| e.into_inner());
    let tasks: Vec<Task> = manager.registry.lock().unwrap_or_else(|e| e.into_inner()).clone();
    // Leave room for the icon, the right-padded duration, and indentation.
    let name_width = manager.width.load(Ordering::Acquire).saturating_sub(24).max(10) as usize;

    if manager.interactive.load(Ordering::Acquire) {
        eprint!("\x1B[H\x1B[J");
        for task in &tasks {
            let name = truncate_for_render(task.name(), name_width);
            eprintln!("  {}", style.status_line(task.status(), &name, &humanize(task.duration())));
            for log in task.logs().iter().rev().take(5).rev() {
                eprintln!("  {}", style.log_line(log.level, &log.message));
            }
        }
    } else {
        for task in &tasks {
            if task.take_dirty() {
                let name = truncate_for_render(task.name(), name_width);
                eprintln!("{}", style.status_line(task.status(), &name, &humanize(task.duration())));
            }
        }
    }
}

fn truncate_for_render(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        name.to_string()
    } else {
        let truncated: String = name.chars().take(max.saturating_sub(1)).collect();
        format!("{truncated}…")
    }
}

use crate::task::humanize;

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::task::TaskOptions;

    #[tracing_test::traced_test]
    #[test]
    fn task_submission_is_logged_at_debug() {
        let manager = Manager::for_test(1);
        manager.start("noop", |_ctx| Ok(()), TaskOptions::new());
        assert_eq!(manager.wait(), 0);
        assert!(logs_contain("task enqueued"));
    }

    #[test]
    fn linear_dependency_runs_in_order() {
        let manager = Manager::for_test(4);
        let a = manager.start(
            "a",
            |_ctx| {
                std::thread::sleep(Duration::from_millis(50));
                Ok(())
            },
            TaskOptions::new(),
        );
        let b = manager.start(
            "b",
            |_ctx| {
                std::thread::sleep(Duration::from_millis(10));
                Ok(())
            },
            TaskOptions::new().dependencies([a.clone()]),
        );

        assert_eq!(manager.wait(), 0);
        assert_eq!(a.raw_status(), TaskStatus::Success);
        assert_eq!(b.raw_status(), TaskStatus::Success);
        assert!(a.end_time().unwrap() <= b.start_time().unwrap());
    }

    #[test]
    fn failing_dependency_cancels_dependent() {
        let manager = Manager::for_test(4);
        let a = manager.start(
            "a",
            |_ctx| Err(Box::<dyn std::error::Error + Send + Sync>::from("fatal")),
            TaskOptions::new(),
        );
        let b = manager.start("b", |_ctx| Ok(()), TaskOptions::new().dependencies([a.clone()]));

        assert_eq!(manager.wait(), 1);
        assert_eq!(a.raw_status(), TaskStatus::Failed);
        assert_eq!(b.raw_status(), TaskStatus::Cancelled);
        let message = b.error().unwrap().to_string();
        assert!(message.contains("dependency failed"), "got: {message}");
    }

    #[test]
    fn concurrency_bound_is_never_exceeded() {
        let manager = Manager::for_test(2);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        for i in 0..5 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            manager.start(
                format!("task-{i}"),
                move |_ctx| {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(100));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
                TaskOptions::new(),
            );
        }

        assert_eq!(manager.wait(), 0);
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn identity_dedup_returns_the_same_task() {
        let manager = Manager::for_test(2);
        let first = manager.start(
            "slow",
            |_ctx| {
                std::thread::sleep(Duration::from_millis(60));
                Ok(())
            },
            TaskOptions::new().identity("shared-key"),
        );
        let second = manager.start("slow", |_ctx| Ok(()), TaskOptions::new().identity("shared-key"));

        assert_eq!(first.id(), second.id());
        assert_eq!(manager.wait(), 0);
    }

    #[test]
    fn priority_zero_task_runs_before_later_enqueued_low_priority_batch() {
        let manager = Manager::for_test(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            manager.start(
                format!("low-{i}"),
                move |_ctx| {
                    std::thread::sleep(Duration::from_millis(60));
                    order.lock().unwrap().push(format!("low-{i}"));
                    Ok(())
                },
                TaskOptions::new().priority(5),
            );
        }

        std::thread::sleep(Duration::from_millis(20));
        let order_clone = order.clone();
        manager.start(
            "urgent",
            move |_ctx| {
                order_clone.lock().unwrap().push("urgent".to_string());
                Ok(())
            },
            TaskOptions::new().priority(0),
        );

        assert_eq!(manager.wait(), 0);
        let recorded = order.lock().unwrap();
        // With a single worker the in-flight low-priority task finishes first, but
        // the priority-0 task must cut ahead of the remaining four low-priority ones.
        let urgent_pos = recorded.iter().position(|n| n == "urgent").unwrap();
        assert!(urgent_pos <= 1, "urgent ran at position {urgent_pos}: {recorded:?}");
    }

    #[test]
    fn width_can_be_pinned_and_overridden() {
        let manager = Manager::with_config(ManagerConfig {
            width: Some(120),
            install_signal_handler: false,
            ..ManagerConfig::default()
        })
        .unwrap();
        assert_eq!(manager.width(), 120);
        manager.set_width(40);
        assert_eq!(manager.width(), 40);
    }

    #[test]
    fn per_attempt_timeout_is_classified_like_any_other_retryable_error() {
        let manager = Manager::for_test(2);
        let mut retry = RetryConfig::default();
        retry.max_retries = 2;
        retry.base_delay = Duration::from_millis(5);
        retry.max_delay = Duration::from_millis(20);
        retry.jitter_factor = 0.0;
        retry.retryable_substrings = vec!["timed out".to_string()];

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let task = manager.start(
            "slow-then-fast",
            move |_ctx| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Ok(())
            },
            TaskOptions::new()
                .retry(retry)
                .attempt_timeout(Duration::from_millis(20)),
        );

        assert_eq!(manager.wait(), 0);
        assert_eq!(task.raw_status(), TaskStatus::Success);
        assert_eq!(task.retry_count(), 1);
    }

    #[test]
    fn lowering_max_concurrent_mid_flight_never_overruns_the_new_gate() {
        // Four worker threads exist from construction; shrinking the gate to 1
        // before submitting any work means every one of them is polling the
        // queue concurrently and must still serialize admission down to 1.
        let manager = Manager::for_test(4);
        manager.set_max_concurrent(1);
        std::thread::sleep(Duration::from_millis(20));

        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for i in 0..12 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            manager.start(
                format!("job-{i}"),
                move |_ctx| {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(15));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
                TaskOptions::new(),
            );
        }

        assert_eq!(manager.wait(), 0);
        assert_eq!(
            max_seen.load(Ordering::SeqCst),
            1,
            "gate was lowered to 1 but multiple tasks ran concurrently"
        );
    }
}
