use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::DownloadError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    // 合并阶段也报这个状态
    Prepare,
    #[default]
    Pending,
    Downloading,
    Pause,
    Success,
    Error,
    Canceled,
    OutOfSpace,
}

impl TaskState {
    /// 终态只能进入一次
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Error | TaskState::Canceled | TaskState::OutOfSpace
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Prepare => "PREPARE",
            TaskState::Pending => "PENDING",
            TaskState::Downloading => "DOWNLOADING",
            TaskState::Pause => "PAUSE",
            TaskState::Success => "SUCCESS",
            TaskState::Error => "ERROR",
            TaskState::Canceled => "CANCELED",
            TaskState::OutOfSpace => "OUT_OF_SPACE",
        };
        write!(f, "{}", s)
    }
}

/// 进度。直播没有总量，`total_bytes` 为 0
///
/// 字段顺序决定了派生的排序：先比较 `current_bytes`。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Progress {
    pub current_bytes: u64,
    pub total_bytes: u64,
}

impl Progress {
    pub fn new(current_bytes: u64, total_bytes: u64) -> Self {
        Self {
            current_bytes,
            total_bytes,
        }
    }

    pub fn live(current_bytes: u64) -> Self {
        Self::new(current_bytes, 0)
    }

    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.current_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0)
    }
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub format_id: String,
    #[serde(default)]
    pub state: TaskState,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub downloaded_bytes: u64,
    // 直播已录制时长，秒
    #[serde(default)]
    pub accumulated_duration: f64,
    #[serde(default)]
    pub is_live: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    // 决定合并时是否转码
    #[serde(default)]
    pub video_codec: Option<String>,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, url: impl Into<String>, format_id: impl Into<String>) -> Self {
        let created_at = Utc::now();
        Self {
            id: id.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            format_id: format_id.into(),
            state: TaskState::Pending,
            progress: 0.0,
            output_path: None,
            total_bytes: 0,
            downloaded_bytes: 0,
            accumulated_duration: 0.0,
            is_live: false,
            error_message: None,
            video_codec: None,
            created_at,
            updated_at: created_at,
            finished_at: None,
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn live(mut self, is_live: bool) -> Self {
        self.is_live = is_live;
        self
    }

    pub fn with_video_codec(mut self, codec: impl Into<String>) -> Self {
        self.video_codec = Some(codec.into());
        self
    }

    pub fn apply_progress(&mut self, progress: Progress) {
        self.downloaded_bytes = progress.current_bytes;
        self.total_bytes = progress.total_bytes;
        self.progress = progress.percent();
        self.updated_at = Utc::now();
    }

    /// 非终态之间的切换
    pub fn transition(&mut self, state: TaskState) -> Result<(), DownloadError> {
        if self.state.is_terminal() {
            return Err(DownloadError::InvalidState(format!(
                "任务 {} 已处于终态 {}，不能切换到 {}",
                self.id, self.state, state
            )));
        }
        self.state = state;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// 设置最终状态，终态只能设置一次
    pub fn finish(
        &mut self,
        state: TaskState,
        error_message: Option<String>,
    ) -> Result<(), DownloadError> {
        self.transition(state)?;
        self.error_message = error_message;
        if state == TaskState::Success {
            self.progress = 100.0;
        }
        self.finished_at = Some(self.updated_at);
        Ok(())
    }
}
