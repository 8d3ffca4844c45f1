use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use streamdl::downloader::task::Task;

/// HLS / MPEG-DASH 分片下载器
#[derive(Parser, Debug)]
#[command(name = "streamdl")]
#[command(version = "0.1")]
#[command(about = "HLS / MPEG-DASH 分片下载与合并工具", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// 引擎配置文件 (JSON)
    #[arg(long, global = true, value_name = "FILE")]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// 任务工作目录的根目录
    #[arg(long, global = true, value_name = "DIR")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub temp_dir: Option<PathBuf>,

    /// 并发数
    #[arg(long, global = true, value_name = "N")]
    pub threads: Option<usize>,

    /// 任务状态文件
    #[arg(long, global = true, value_name = "FILE")]
    #[arg(default_value = "state.json")]
    pub state_file: PathBuf,

    /// 视频保存目录
    #[arg(long, global = true, value_name = "DIR")]
    #[arg(default_value = ".")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub output_dir: PathBuf,

    /// 输出调试日志
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 开始或继续下载
    Download {
        #[arg(long, value_name = "JOB")]
        job: PathBuf,
    },
    /// 暂停正在进行的下载
    Pause {
        #[arg(long, value_name = "JOB")]
        job: PathBuf,
    },
    /// 取消下载并删除工作目录
    Cancel {
        #[arg(long, value_name = "JOB")]
        job: PathBuf,
    },
    /// 停止直播录制并合并已录制的部分
    #[command(name = "stop-save")]
    StopSave {
        #[arg(long, value_name = "JOB")]
        job: PathBuf,

        /// 不等待录制进程，直接合并磁盘上的分片
        #[arg(long)]
        merge_only: bool,
    },
}

impl Command {
    pub fn job_path(&self) -> &Path {
        match self {
            Command::Download { job }
            | Command::Pause { job }
            | Command::Cancel { job }
            | Command::StopSave { job, .. } => job,
        }
    }
}

/// 任务定义文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub format_id: String,
    #[serde(default)]
    pub is_live: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    // 预解析清单的位置，缺省时用 url
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
}

impl Job {
    /// 读取任务文件。没有 id 时生成一个并写回，之后的暂停/取消才能找到同一个任务
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("读取任务文件失败: {:?}", path))?;
        let mut job: Job =
            serde_json::from_slice(&raw).with_context(|| format!("任务文件格式错误: {:?}", path))?;
        if job.id.is_none() {
            let id = Uuid::new_v4().to_string();
            info!("任务文件没有 id，分配: {}", id);
            job.id = Some(id);
            tokio::fs::write(path, serde_json::to_vec_pretty(&job)?).await?;
        }
        Ok(job)
    }

    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    pub fn to_task(&self) -> Task {
        let mut task = Task::new(self.id(), &self.url, &self.format_id)
            .with_headers(self.headers.clone())
            .live(self.is_live);
        if let Some(codec) = &self.video_codec {
            task = task.with_video_codec(codec);
        }
        task
    }
}

/// 任务状态文件，内容是任务数组
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> anyhow::Result<Vec<Task>> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("状态文件格式错误: {:?}", self.path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn task(&self, id: &str) -> anyhow::Result<Option<Task>> {
        Ok(self.load().await?.into_iter().find(|t| t.id == id))
    }

    /// 按 id 覆盖保存
    pub async fn save(&self, task: &Task) -> anyhow::Result<()> {
        let mut tasks = self.load().await?;
        match tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task.clone(),
            None => tasks.push(task.clone()),
        }
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(&tasks)?).await?;
        debug!("保存任务状态 {} -> {:?}", task.id, self.path);
        Ok(())
    }
}
