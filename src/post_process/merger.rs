use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::downloader::error::DownloadError;

/// 外部合并工具一次执行的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSession {
    pub success: bool,
    pub return_code: Option<i32>,
    pub logs: String,
}

impl MergeSession {
    /// 合并失败是整个任务的硬失败，不重试
    pub fn into_result(self, what: &str) -> Result<(), DownloadError> {
        if self.success {
            return Ok(());
        }
        Err(DownloadError::Merge {
            message: format!("ffmpeg 合并{}失败，返回码: {:?}", what, self.return_code),
            logs: self.logs,
            source: None,
        })
    }
}

/// 音视频封装工具，只接收参数列表，返回成功与否和日志
#[async_trait]
pub trait Remuxer: Send + Sync {
    async fn remux(&self, args: &[String]) -> Result<MergeSession, DownloadError>;
}

pub struct FfmpegRemuxer {
    ffmpeg_path: String,
}

impl FfmpegRemuxer {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// 检查 ffmpeg 是否可用
    pub async fn ensure_available(&self) -> Result<(), DownloadError> {
        debug!("检查系统中是否安装了 ffmpeg: {}", self.ffmpeg_path);
        let status = Command::new(&self.ffmpeg_path)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            _ => {
                error!("❌ 未检测到 ffmpeg，请确保系统中已安装并配置了 ffmpeg 可执行路径。");
                error!("或者设置环境变量 FFMPEG_PATH 指向 ffmpeg 可执行文件路径");
                Err(DownloadError::FfmpegNotFound)
            }
        }
    }
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    async fn remux(&self, args: &[String]) -> Result<MergeSession, DownloadError> {
        self.ensure_available().await?;
        debug!("执行 ffmpeg: {:?}", args);

        let output = Command::new(&self.ffmpeg_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        let logs = String::from_utf8_lossy(&output.stderr).to_string();
        if output.status.success() {
            info!("✅ ffmpeg 合并成功: {:?}", args.last());
        } else {
            error!("❌ ffmpeg 合并失败，错误日志如下：\n{}", logs);
        }

        Ok(MergeSession {
            success: output.status.success(),
            return_code: output.status.code(),
            logs,
        })
    }
}
