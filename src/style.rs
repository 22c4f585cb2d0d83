//! The `Pretty()` surface: a small styled-text tree handed off to the (out of scope)
//! formatter collaborator, plus the minimal ANSI path the render loop needs to drive
//! its own interactive/line output without depending on that collaborator.
use crossterm::style::{Attribute, Color, Stylize};

use crate::task::{LogLevel, TaskStatus};

/// A node in the styled-text tree returned by `Task::pretty` / `Manager::pretty`.
///
/// `style` is an opaque, CSS-class-like string (`"status-failed"`, `"log-warn"`, ...),
/// resolved by the external formatter into ANSI, HTML or PDF. The engine only
/// guarantees the shape and contents of the tree, never how it's painted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Text {
    pub content: String,
    pub style: String,
    pub children: Vec<Text>,
}

impl Text {
    pub fn leaf(content: impl Into<String>, style: impl Into<String>) -> Self {
        Text {
            content: content.into(),
            style: style.into(),
            children: Vec::new(),
        }
    }

    pub fn node(content: impl Into<String>, style: impl Into<String>, children: Vec<Text>) -> Self {
        Text {
            content: content.into(),
            style: style.into(),
            children,
        }
    }
}

/// Status glyph, per §7: ✗ failed, ⚠ warning, ⊘ cancelled, ⏳ pending, a running spinner
/// frame, and a checkmark for success.
pub fn status_icon(status: TaskStatus) -> char {
    match status {
        TaskStatus::Pending => '⏳',
        TaskStatus::Running => '▶',
        TaskStatus::Success => '✓',
        TaskStatus::Failed => '✗',
        TaskStatus::Warning => '⚠',
        TaskStatus::Cancelled => '⊘',
    }
}

pub fn status_color(status: TaskStatus) -> Color {
    match status {
        TaskStatus::Pending => Color::Grey,
        TaskStatus::Running => Color::Cyan,
        TaskStatus::Success => Color::Green,
        TaskStatus::Failed => Color::Red,
        TaskStatus::Warning => Color::Yellow,
        TaskStatus::Cancelled => Color::Magenta,
    }
}

pub fn status_style_class(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "status-pending",
        TaskStatus::Running => "status-running",
        TaskStatus::Success => "status-success",
        TaskStatus::Failed => "status-failed",
        TaskStatus::Warning => "status-warning",
        TaskStatus::Cancelled => "status-cancelled",
    }
}

pub fn log_style_class(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "log-debug",
        LogLevel::Info => "log-info",
        LogLevel::Warn => "log-warn",
        LogLevel::Error => "log-error",
    }
}

fn log_color(level: LogLevel) -> Color {
    match level {
        LogLevel::Debug => Color::DarkGrey,
        LogLevel::Info => Color::White,
        LogLevel::Warn => Color::Yellow,
        LogLevel::Error => Color::Red,
    }
}

/// A tiny, self-contained ANSI styler for the Manager's own render loop (§6:
/// "the core never renders ANSI directly except through [the formatter] - with the
/// one exception that the Manager's own render loop needs a minimal ANSI path").
/// Separate from - and much smaller than - a full table/HTML/PDF formatter.
#[derive(Debug, Clone, Copy)]
pub struct OutputStyle {
    pub enabled: bool,
}

impl OutputStyle {
    pub const fn new(enabled: bool) -> Self {
        OutputStyle { enabled }
    }

    pub fn style_text(&self, text: impl ToString, color: Option<Color>, bold: bool) -> String {
        let text = text.to_string();
        if !self.enabled {
            return text;
        }
        let mut styled = text.stylize();
        if let Some(color) = color {
            styled = styled.with(color);
        }
        if bold {
            styled = styled.attribute(Attribute::Bold);
        }
        styled.to_string()
    }

    pub fn status_line(&self, status: TaskStatus, name: &str, duration: &str) -> String {
        let icon = status_icon(status);
        let color = status_color(status);
        let head = self.style_text(format!("{icon} {name}"), Some(color), false);
        format!("{head}  {duration}")
    }

    pub fn log_line(&self, level: LogLevel, message: &str) -> String {
        self.style_text(format!("  {message}"), Some(log_color(level)), false)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn disabled_style_passes_text_through_unchanged() {
        let style = OutputStyle::new(false);
        let expected = format!("{} build  0.5s", status_icon(TaskStatus::Success));
        let actual = style.status_line(TaskStatus::Success, "build", "0.5s");
        similar_asserts::assert_eq!(expected, actual);
    }

    #[test]
    fn status_icons_are_distinct_per_variant() {
        let all = [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Success,
            TaskStatus::Failed,
            TaskStatus::Warning,
            TaskStatus::Cancelled,
        ];
        let icons: Vec<char> = all.iter().map(|s| status_icon(*s)).collect();
        let mut unique = icons.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(icons.len(), unique.len());
    }
}
