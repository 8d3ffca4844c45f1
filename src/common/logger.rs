use colored::*;
use tracing::Level;

use crate::downloader::task::TaskState;

/// 初始化 tracing，`verbose` 时输出 DEBUG
pub fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    // 测试或嵌入场景下可能已经初始化过
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

/// 录制时长，`1h02m03s` / `4m05s` / `7.5s`
pub fn format_duration(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    if seconds < 60.0 {
        return format!("{:.1}s", seconds);
    }
    let total = seconds.round() as u64;
    let (h, m, s) = (total / 3600, total % 3600 / 60, total % 60);
    if h > 0 {
        format!("{}h{:02}m{:02}s", h, m, s)
    } else {
        format!("{}m{:02}s", m, s)
    }
}

/// 终端上给人看的输出，日志走 tracing
pub struct PrettyLogger;

impl PrettyLogger {
    pub fn success(message: impl AsRef<str>) {
        println!("{} {}", "✓".green().bold(), message.as_ref());
    }

    pub fn info(message: impl AsRef<str>) {
        println!("{} {}", "ℹ".blue().bold(), message.as_ref());
    }

    pub fn warning(message: impl AsRef<str>) {
        println!("{} {}", "⚠".yellow().bold(), message.as_ref());
    }

    /// 错误写到 stderr
    pub fn error(message: impl AsRef<str>) {
        eprintln!("{} {}", "✗".red().bold(), message.as_ref());
    }

    pub fn step(step: impl AsRef<str>) {
        println!("\n{} {}", "▶".cyan().bold(), step.as_ref().bold());
    }

    pub fn file_info(label: impl AsRef<str>, path: impl AsRef<str>) {
        println!(
            "{} {}: {}",
            "📁".blue().bold(),
            label.as_ref().bold(),
            path.as_ref()
        );
    }

    /// 任务概要：格式和直播标记
    pub fn task_info(task_id: impl AsRef<str>, format_id: impl AsRef<str>, is_live: bool) {
        let kind = if is_live { "直播".red() } else { "点播".normal() };
        println!(
            "{} {} ({}, {})",
            "🎬".magenta().bold(),
            task_id.as_ref().bold(),
            format_id.as_ref().cyan(),
            kind
        );
    }

    /// 状态着色
    pub fn state(state: TaskState) -> ColoredString {
        let text = state.to_string();
        match state {
            TaskState::Success => text.green().bold(),
            TaskState::Pause | TaskState::Prepare => text.yellow(),
            TaskState::Canceled => text.bright_black(),
            TaskState::Error | TaskState::OutOfSpace => text.red().bold(),
            TaskState::Pending | TaskState::Downloading => text.cyan(),
        }
    }

    pub fn separator() {
        println!("{}", "─".repeat(50).bright_black());
    }

    pub fn completion_summary(title: impl AsRef<str>, items: Vec<impl AsRef<str>>) {
        println!("\n{}", format!("🎉 {}", title.as_ref()).green().bold());
        for item in items {
            println!("  {}", item.as_ref());
        }
    }
}

#[macro_export]
macro_rules! log_success {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::success(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::info(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::warning(format!($($arg)*))
    };
}
