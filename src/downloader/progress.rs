use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::manager::ProgressSink;
use super::task::{Progress, Task, TaskState};

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}";
const LIVE_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {bytes} {msg}";

/// 终端进度显示：点播用进度条，直播没有总量用 spinner
pub struct TerminalProgress {
    bar: ProgressBar,
    live: bool,
}

impl TerminalProgress {
    pub fn new(live: bool) -> Self {
        Self::with_target(live, ProgressDrawTarget::stderr())
    }

    /// 不输出到终端
    pub fn hidden(live: bool) -> Self {
        Self::with_target(live, ProgressDrawTarget::hidden())
    }

    fn with_target(live: bool, target: ProgressDrawTarget) -> Self {
        let (bar, template) = if live {
            (ProgressBar::new_spinner(), LIVE_TEMPLATE)
        } else {
            (ProgressBar::new(0), BAR_TEMPLATE)
        };
        bar.set_draw_target(target);
        let style = ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        if live {
            bar.enable_steady_tick(Duration::from_millis(120));
        }
        Self { bar, live }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn length(&self) -> Option<u64> {
        self.bar.length()
    }
}

impl ProgressSink for TerminalProgress {
    fn report(&self, task: &Task, progress: Progress, state: TaskState) {
        match state {
            TaskState::Downloading => {
                if self.live {
                    self.bar
                        .set_message(format!("已录制 {:.1}s", task.accumulated_duration));
                } else {
                    self.bar
                        .set_length(progress.total_bytes.max(progress.current_bytes));
                }
                self.bar.set_position(progress.current_bytes);
            }
            TaskState::Prepare => {
                self.bar.set_position(progress.current_bytes);
                self.bar.set_message("合并中...");
            }
            TaskState::Success => match &task.error_message {
                Some(message) => self
                    .bar
                    .finish_with_message(format!("部分完成: {}", message)),
                None => self.bar.finish_with_message("下载完成"),
            },
            TaskState::Pause => self.bar.abandon_with_message("已暂停"),
            TaskState::Canceled => self.bar.abandon_with_message("已取消"),
            TaskState::OutOfSpace => self.bar.abandon_with_message("磁盘空间不足"),
            TaskState::Error => self.bar.abandon_with_message(format!(
                "下载失败: {}",
                task.error_message.as_deref().unwrap_or("未知错误")
            )),
            TaskState::Pending => {}
        }
    }
}
