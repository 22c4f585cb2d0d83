#![doc = include_str!("../README.md")]

/// Library-level configuration surface: `ManagerConfig`, `RetryConfig` defaults,
/// and the `VERBOSE`/`DEBUG` environment knobs.
pub mod config;
/// The engine's own error taxonomy. User task-body errors travel separately,
/// as `task::BoxError`.
pub mod error;
/// `Group`: an ordered collection of tasks (and nested groups) sharing one
/// aggregate status, duration, and local concurrency bound.
pub mod group;
/// `Manager`: the scheduler owning the worker pool, priority queue, signal
/// handling and render loop.
pub mod manager;
/// The Manager's internal priority queue.
mod queue;
/// The `Pretty()` styled-text tree, plus the Manager's own minimal ANSI path.
pub mod style;
/// `Task`: lifecycle, progress, logs, typed result, dependency gating, retry.
pub mod task;

pub use config::ManagerConfig;
pub use error::{Error, Result};
pub use group::Group;
pub use manager::Manager;
pub use style::Text;
pub use task::{
    BoxError, Health, HealthState, LogEntry, LogLevel, RetryConfig, StoredResult, Task, TaskContext,
    TaskId, TaskOptions, TaskStatus, Taskable, WaitResult,
};

/// Initializes a `tracing-subscriber` fmt layer for binaries embedding this engine,
/// modeled on the teacher's `install_tracing`: `verbose` raises the default filter
/// from `WARN` to `DEBUG`, and `RUST_LOG` always takes precedence when set.
pub fn init_tracing(verbose: bool) -> Result<()> {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let level = if verbose { LevelFilter::DEBUG } else { LevelFilter::WARN };
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let filter_layer = EnvFilter::builder().with_default_directive(level.into()).from_env()?;

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter_layer))
        .init();

    Ok(())
}
