//! Engine-level errors.
//!
//! This covers failures of the *engine itself* (dependency bookkeeping, waiting,
//! result extraction, signal wiring). Errors returned by user-supplied task bodies
//! travel as a boxed [`std::error::Error`] and are never forced through this enum -
//! see [`crate::task::BoxError`].
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A dependency of this task ended `Failed` or `Cancelled`.
    #[error("dependency failed")]
    DependencyFailed,

    /// `Task::wait_for` hit its safety ceiling before the task completed.
    #[error("wait timeout after {0:?}")]
    WaitTimeout(Duration),

    /// The task (or one of its ancestors) was cancelled.
    #[error("task was cancelled")]
    Cancelled,

    /// Either the overall timeout or a per-attempt timeout elapsed.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// `Task::result_as::<T>` was called but the stored result isn't a `T`.
    #[error("result type mismatch: task's result isn't the requested type")]
    ResultTypeMismatch,

    /// `Task::result_as::<T>` was called before the task produced a result.
    #[error("task has no result")]
    NoResult,

    /// A shared lock was poisoned by a panicking thread.
    #[error("internal lock was poisoned")]
    Poisoned,

    /// Registering a signal handler failed.
    #[error("failed to install signal handler: {0}")]
    SignalSetup(#[from] ctrlc::Error),

    /// `RUST_LOG` (or an equivalent env filter directive) failed to parse.
    #[error("invalid tracing filter directive: {0}")]
    TracingFilter(#[from] tracing_subscriber::filter::FromEnvError),
}

pub type Result<T> = std::result::Result<T, Error>;
