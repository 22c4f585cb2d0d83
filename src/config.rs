//! Library-level configuration surface (ambient stack, §7 "Configuration").
//!
//! Deliberately a plain, cheaply `Clone`-able value type - there is no
//! file-based configuration layer in scope here, unlike `pueue_lib`'s YAML
//! `Settings`, which belongs to the out-of-scope daemon/client collaborator.
use std::time::Duration;

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false)
}

pub(crate) fn env_verbose() -> bool {
    env_flag("VERBOSE") || env_flag("DEBUG")
}

/// The enumerated `Manager` options from §6.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub max_concurrent: usize,
    pub no_color: bool,
    pub no_progress: bool,
    pub graceful_timeout: Duration,
    pub verbose: bool,
    /// Render width hint (§3 "rendering configuration ... width"). `None`
    /// auto-detects the stderr terminal's column count at construction time;
    /// `Some(n)` pins it (useful for tests and for non-TTY line-mode output
    /// piped to a fixed-width collector).
    pub width: Option<u16>,
    /// §4.1 "Installs a signal handler unless explicitly disabled." The
    /// process only permits a single `SIGINT`/`SIGTERM` handler at a time
    /// (see `ctrlc`'s own restriction), so anything embedding more than one
    /// `Manager` - including this crate's own test suite - must disable it
    /// on all but (at most) one instance.
    pub install_signal_handler: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            max_concurrent: 4,
            no_color: false,
            no_progress: false,
            graceful_timeout: Duration::from_secs(10),
            verbose: env_verbose(),
            width: None,
            install_signal_handler: true,
        }
    }
}
