use std::fmt;

use thiserror::Error;

use crate::manifest::ManifestError;

/// 中断原因。不是错误，是控制信号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interruption {
    Pause,
    Cancel,
    StopAndSave,
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interruption::Pause => write!(f, "暂停"),
            Interruption::Cancel => write!(f, "取消"),
            Interruption::StopAndSave => write!(f, "停止并保存"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP错误: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP 请求失败，状态码: {status}，URL: {url}")]
    Status { status: u16, url: String },

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("下载被中断: {0}")]
    Interrupted(Interruption),

    #[error("重试 {attempts} 次后仍然失败: {url}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        #[source]
        source: Box<DownloadError>,
    },

    #[error("清单错误: {0}")]
    Manifest(#[from] ManifestError),

    #[error("合并失败: {message}")]
    Merge {
        message: String,
        logs: String,
        // 直播录制中断后合并又失败时，保留最初的原因
        #[source]
        source: Option<Box<DownloadError>>,
    },

    #[error("未检测到 ffmpeg，请安装 ffmpeg 或设置环境变量 FFMPEG_PATH")]
    FfmpegNotFound,

    #[error("磁盘空间不足")]
    OutOfSpace,

    #[error("没有录制到任何分片")]
    NothingCaptured,

    #[error("无效的状态: {0}")]
    InvalidState(String),
}

const ENOSPC: i32 = 28;

impl DownloadError {
    pub fn is_interruption(&self) -> bool {
        self.interruption().is_some()
    }

    pub fn interruption(&self) -> Option<Interruption> {
        match self {
            DownloadError::Interrupted(reason) => Some(*reason),
            _ => None,
        }
    }

    /// 磁盘写满单独成一类终态，调用方的恢复策略不同
    pub fn is_out_of_space(&self) -> bool {
        match self {
            DownloadError::OutOfSpace => true,
            DownloadError::Io(e) => is_io_out_of_space(e),
            DownloadError::RetriesExhausted { source, .. } => source.is_out_of_space(),
            DownloadError::Merge { logs, source, .. } => {
                logs.contains("No space left on device")
                    || source.as_ref().is_some_and(|s| s.is_out_of_space())
            }
            _ => false,
        }
    }

    /// 沿着 source 链找到最初的原因
    pub fn root_cause(&self) -> &DownloadError {
        match self {
            DownloadError::RetriesExhausted { source, .. } => source.root_cause(),
            DownloadError::Merge {
                source: Some(source),
                ..
            } => source.root_cause(),
            other => other,
        }
    }
}

pub fn is_io_out_of_space(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::StorageFull || e.raw_os_error() == Some(ENOSPC)
}
