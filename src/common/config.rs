use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件失败: {0}")]
    Io(#[from] std::io::Error),
    #[error("配置文件格式错误: {0}")]
    Parse(#[from] serde_json::Error),
}

/// 单个分片的重试策略，退避为线性 `attempt × base`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次（从 1 开始）失败后的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(attempt as u64))
    }
}

/// 下载引擎配置，所有字段都有默认值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // 点播并发数，同时也是整文件下载的分块数
    pub threads: usize,
    pub retry: RetryPolicy,
    // 控制标记的轮询间隔
    pub poll_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub hls_default_target_duration_secs: f64,
    pub dash_default_update_period_ms: u64,
    pub dash_min_update_period_ms: u64,
    // 合并输出的容器格式
    pub container: String,
    pub ffmpeg_path: String,
    // 每个任务的工作目录都建在这里
    pub temp_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: 3,
            retry: RetryPolicy::default(),
            poll_interval_ms: 250,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            hls_default_target_duration_secs: 10.0,
            dash_default_update_period_ms: 2000,
            dash_min_update_period_ms: 1000,
            container: "mp4".to_string(),
            ffmpeg_path: default_ffmpeg_path(),
            temp_dir: std::env::temp_dir().join("streamdl"),
        }
    }
}

fn default_ffmpeg_path() -> String {
    std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string())
}

impl EngineConfig {
    /// 从 JSON 文件加载，缺省字段取默认值
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("加载配置文件: {:?}", path);
        let raw = tokio::fs::read(path).await?;
        let config = serde_json::from_slice(&raw)?;
        Ok(config)
    }

    /// 环境变量优先于配置文件
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("FFMPEG_PATH") {
            if !path.is_empty() {
                self.ffmpeg_path = path;
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// 至少一个并发
    pub fn parallelism(&self) -> usize {
        self.threads.max(1)
    }

    pub fn work_dir_for(&self, task_id: &str) -> PathBuf {
        self.temp_dir.join(task_id)
    }
}
