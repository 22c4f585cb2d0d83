//! `Group`: an ordered collection of tasks (and nested groups) sharing one
//! aggregate status, duration and "wait until stably idle" operation. See
//! `SPEC_FULL.md` §3, §4.3.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::Local;

use crate::manager::ManagerInner;
use crate::task::{BodyFn, BoxError, StoredResult, Task, TaskId, TaskOptions, TaskStatus, Taskable};

/// A minimal counting semaphore built on `Mutex` + `Condvar`, used for a Group's
/// optional local concurrency bound (§4.3 "Local concurrency bound"). The engine
/// is thread-based throughout, so there is no async runtime to borrow one from.
pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    cv: std::sync::Condvar,
}

impl Semaphore {
    fn new(n: usize) -> Self {
        Semaphore {
            permits: Mutex::new(n),
            cv: std::sync::Condvar::new(),
        }
    }

    /// Acquires one permit, returning a guard that releases it on drop - including
    /// on unwind, so a panicking child body can never leak a permit and
    /// permanently shrink the group's effective bound.
    fn acquire(self: &Arc<Self>) -> SemaphorePermit {
        let mut guard = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        while *guard == 0 {
            guard = self.cv.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
        *guard -= 1;
        drop(guard);
        SemaphorePermit { semaphore: self.clone() }
    }

    fn release(&self) {
        let mut guard = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        *guard += 1;
        self.cv.notify_one();
    }
}

/// RAII handle for one [`Semaphore`] permit; releases on drop regardless of
/// whether the guarded body returned normally or unwound via panic.
struct SemaphorePermit {
    semaphore: Arc<Semaphore>,
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

pub(crate) struct GroupInner {
    name: String,
    manager: Weak<ManagerInner>,
    children: Mutex<Vec<Arc<dyn Taskable>>>,
    semaphore: Mutex<Option<Arc<Semaphore>>>,
}

/// A cheap, `Clone`-able handle to a Group. Like [`Task`], cloning shares state.
#[derive(Clone)]
pub struct Group(pub(crate) Arc<GroupInner>);

impl Group {
    pub(crate) fn new(name: impl Into<String>, manager: Weak<ManagerInner>) -> Group {
        Group(Arc::new(GroupInner {
            name: name.into(),
            manager,
            children: Mutex::new(Vec::new()),
            semaphore: Mutex::new(None),
        }))
    }

    pub(crate) fn from_inner(inner: Arc<GroupInner>) -> Group {
        Group(inner)
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Installs (or replaces) the local concurrency bound. Applies only to
    /// children added after this call.
    pub fn set_max_concurrent(&self, n: usize) {
        *self.0.semaphore.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(Semaphore::new(n)));
    }

    fn manager(&self) -> Option<Arc<ManagerInner>> {
        self.0.manager.upgrade()
    }

    /// Adds a child task whose body is wrapped to acquire/release this group's
    /// local semaphore (if any) around the user function, per §4.3.
    pub fn add<T, F>(&self, name: impl Into<String>, body: F, opts: TaskOptions) -> Task
    where
        T: Send + Sync + 'static,
        F: Fn(&crate::task::TaskContext) -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        let semaphore = self
            .0
            .semaphore
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let wrapped: Box<BodyFn> = Box::new(move |ctx| {
            let _permit = semaphore.as_ref().map(|sem| sem.acquire());
            body(ctx).map(StoredResult::new)
        });

        let task = match self.manager() {
            Some(manager) => manager.submit(name.into(), wrapped, opts),
            None => {
                tracing::error!("group's manager was dropped; child task will never run");
                manager_less_task(name.into())
            }
        };
        task.set_parent(Arc::downgrade(&self.0));
        self.0
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(task.clone()));
        task
    }

    /// Nests another group as a child; its tasks flatten through [`Taskable`].
    pub fn add_group(&self, group: Group) {
        self.0
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(group));
    }

    pub fn status(&self) -> TaskStatus {
        let tasks = Taskable::tasks(self);
        if tasks.is_empty() {
            return TaskStatus::Pending;
        }
        if tasks.iter().any(|t| t.status() == TaskStatus::Running) {
            TaskStatus::Running
        } else if tasks.iter().any(|t| t.status() == TaskStatus::Pending) {
            TaskStatus::Pending
        } else if tasks
            .iter()
            .any(|t| matches!(t.status(), TaskStatus::Failed | TaskStatus::Cancelled))
        {
            TaskStatus::Failed
        } else if tasks.iter().any(|t| t.status() == TaskStatus::Warning) {
            TaskStatus::Warning
        } else {
            TaskStatus::Success
        }
    }

    pub fn duration(&self) -> Duration {
        let tasks = Taskable::tasks(self);
        let start = tasks.iter().filter_map(|t| t.start_time()).min();
        let still_running = tasks.iter().any(|t| !t.is_completed());
        let end = if still_running {
            None
        } else {
            tasks.iter().filter_map(|t| t.end_time()).max()
        };
        match (start, end) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or(Duration::ZERO),
            (Some(start), None) => (Local::now() - start).to_std().unwrap_or(Duration::ZERO),
            _ => Duration::ZERO,
        }
    }

    pub fn cancel(&self) {
        for task in Taskable::tasks(self) {
            task.cancel();
        }
    }

    /// §4.3 "Dynamic addition": requires `STABLE_WINDOW` consecutive idle checks
    /// at a stable child count before declaring completion, so a child added
    /// mid-wait is never missed.
    pub fn wait_for(&self) -> crate::task::WaitResult {
        self.wait_for_ceiling(Duration::from_secs(30))
    }

    pub fn wait_for_ceiling(&self, ceiling: Duration) -> crate::task::WaitResult {
        const STABLE_WINDOW: usize = 3;
        let deadline = Instant::now() + ceiling;
        let mut stable_count = 0usize;
        let mut last_len = usize::MAX;

        loop {
            let tasks = Taskable::tasks(self);
            let len = tasks.len();
            let all_done = tasks.iter().all(|t| t.is_completed());

            if all_done {
                stable_count = if len == last_len { stable_count + 1 } else { 1 };
                last_len = len;
                if stable_count >= STABLE_WINDOW || Instant::now() >= deadline {
                    return tasks
                        .into_iter()
                        .map(|t| crate::task::WaitResult::of(t.status()))
                        .fold(crate::task::WaitResult::default(), crate::task::WaitResult::merge);
                }
            } else {
                stable_count = 0;
                last_len = len;
                if Instant::now() >= deadline {
                    return tasks
                        .into_iter()
                        .map(|t| crate::task::WaitResult::of(t.status()))
                        .fold(crate::task::WaitResult::default(), crate::task::WaitResult::merge);
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Typed projection from task id to value for every child whose result is a `T`.
    pub fn results<T: Clone + 'static>(&self) -> HashMap<TaskId, T> {
        Taskable::tasks(self)
            .into_iter()
            .filter_map(|t| t.result_as::<T>().ok().map(|v| (t.id(), v)))
            .collect()
    }
}

impl Taskable for Group {
    fn tasks(&self) -> Vec<Task> {
        self.0
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .flat_map(|child| child.tasks())
            .collect()
    }
}

/// Constructs a standalone, already-cancelled task when a group outlives its
/// manager - an invariant violation that should never happen in normal use,
/// but one the engine would rather report as a cancelled task than panic on.
fn manager_less_task(name: String) -> Task {
    let task = Task::new(
        0,
        name,
        Box::new(|_| Err(Box::<dyn std::error::Error + Send + Sync>::from("manager dropped"))),
        0,
        Vec::new(),
        crate::task::RetryConfig::default(),
        None,
        None,
        None,
        HashMap::new(),
    );
    task.cancel();
    task
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::manager::Manager;

    fn bare_group() -> Group {
        Group::new("empty", Weak::new())
    }

    #[test]
    fn empty_group_is_pending_with_zero_duration() {
        let group = bare_group();
        assert_eq!(group.status(), TaskStatus::Pending);
        assert_eq!(group.duration(), Duration::ZERO);
    }

    #[test]
    fn nested_group_flattens_through_taskable() {
        let manager = Manager::for_test(2);
        let outer = manager.start_group("outer");
        let inner = manager.start_group("inner");
        outer.add_group(inner.clone());
        inner.add("leaf", |_ctx| Ok::<_, BoxError>(()), TaskOptions::new());

        assert_eq!(Taskable::tasks(&outer).len(), 1);
        let result = outer.wait_for_ceiling(Duration::from_secs(5));
        assert_eq!(result.total, 1);
        assert_eq!(result.success, 1);
    }

    #[test]
    fn status_is_failed_when_any_child_failed_and_rest_terminal() {
        let manager = Manager::for_test(2);
        let group = manager.start_group("mixed");
        group.add("ok", |_ctx| Ok::<_, BoxError>(()), TaskOptions::new());
        group.add(
            "bad",
            |_ctx| Err::<(), BoxError>(Box::from("permission denied")),
            TaskOptions::new(),
        );
        group.wait_for_ceiling(Duration::from_secs(5));
        assert_eq!(group.status(), TaskStatus::Failed);
    }

    #[test]
    fn local_concurrency_bound_limits_simultaneous_children() {
        let manager = Manager::for_test(8);
        let group = manager.start_group("bounded");
        group.set_max_concurrent(2);

        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..6 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            group.add(
                "child",
                move |_ctx| {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(40));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(())
                },
                TaskOptions::new(),
            );
        }

        group.wait_for_ceiling(Duration::from_secs(5));
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn adding_a_child_during_wait_extends_the_wait() {
        let manager = Manager::for_test(4);
        let group = manager.start_group("dynamic");
        group.add(
            "first",
            |_ctx| {
                std::thread::sleep(Duration::from_millis(30));
                Ok::<_, BoxError>(())
            },
            TaskOptions::new(),
        );

        let group_clone = group.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(15));
            group_clone.add(
                "late",
                |_ctx| Ok::<_, BoxError>(()),
                TaskOptions::new(),
            );
        });

        let result = group.wait_for_ceiling(Duration::from_secs(5));
        assert_eq!(result.total, 2);
        assert_eq!(result.success, 2);
    }
}
