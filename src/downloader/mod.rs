use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::common::client::HttpClient;
use crate::common::config::EngineConfig;
use crate::manifest::ManifestSource;
use crate::post_process::merger::Remuxer;

use base_url::BaseUrlDownloader;
use control::DownloadController;
use error::DownloadError;
use fetcher::SegmentFetcher;
use layout::WorkDir;
use live::LiveCaptureLoop;
use merger::{CodecHint, MergeInvoker};
use store::SegmentStore;
use task::{Progress, Task};
use vod::VodSegmentDownloader;

pub mod base_url;
pub mod chunked;
pub mod control;
pub mod error;
pub mod fetcher;
pub mod layout;
pub mod live;
pub mod manager;
pub mod merger;
pub mod progress;
pub mod store;
pub mod task;
pub mod vod;

/// 各下载器共享的依赖
pub struct DownloadContext {
    pub config: EngineConfig,
    pub client: HttpClient,
    pub store: Arc<dyn SegmentStore>,
    pub remuxer: Arc<dyn Remuxer>,
    pub source: Arc<dyn ManifestSource>,
}

impl DownloadContext {
    pub fn fetcher(&self, task: &Task, controller: &DownloadController) -> SegmentFetcher {
        SegmentFetcher::new(
            self.client.clone(),
            Arc::clone(&self.store),
            controller.clone(),
            task.headers.clone(),
        )
        .with_retry(self.config.retry.clone())
        .with_timeout(self.config.request_timeout())
    }

    pub fn merger(&self, task: &Task, work_dir: &WorkDir) -> MergeInvoker {
        MergeInvoker::new(
            Arc::clone(&self.remuxer),
            self.client.clone(),
            task.headers.clone(),
            work_dir.clone(),
        )
    }

    pub fn codec_hint(&self, task: &Task) -> CodecHint {
        CodecHint::new(task.video_codec.as_deref())
    }
}

/// 下载过程中的回调，由引擎转成任务状态再交给外部
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: Progress);

    /// 进入合并阶段
    fn on_merge(&self, progress: Progress);

    /// 直播已录制的总时长（秒）
    fn on_duration(&self, _seconds: f64) {}
}

#[derive(Debug)]
pub struct DownloadOutput {
    pub file: PathBuf,
    // 直播录制被打断但合并成功时的原始原因
    pub interrupted: Option<DownloadError>,
}

impl DownloadOutput {
    pub fn complete(file: PathBuf) -> Self {
        Self {
            file,
            interrupted: None,
        }
    }
}

/// 把一个任务下载到工作目录，返回合并好的文件
#[async_trait]
pub trait ManifestDownloader: Send + Sync {
    async fn download(
        &self,
        task: &Task,
        work_dir: &WorkDir,
        controller: &DownloadController,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<DownloadOutput, DownloadError>;
}

/// 按（分片列表 / 整文件）×（点播 / 直播）选出的下载器
pub enum AnyDownloader {
    Vod(VodSegmentDownloader),
    BaseUrl(BaseUrlDownloader),
    HlsLive(LiveCaptureLoop),
    DashLive(LiveCaptureLoop),
}

impl AnyDownloader {
    pub fn name(&self) -> &'static str {
        match self {
            AnyDownloader::Vod(_) => "点播分片",
            AnyDownloader::BaseUrl(_) => "整文件",
            AnyDownloader::HlsLive(_) => "HLS 直播",
            AnyDownloader::DashLive(_) => "DASH 直播",
        }
    }
}

#[async_trait]
impl ManifestDownloader for AnyDownloader {
    async fn download(
        &self,
        task: &Task,
        work_dir: &WorkDir,
        controller: &DownloadController,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<DownloadOutput, DownloadError> {
        match self {
            AnyDownloader::Vod(d) => d.download(task, work_dir, controller, observer).await,
            AnyDownloader::BaseUrl(d) => d.download(task, work_dir, controller, observer).await,
            AnyDownloader::HlsLive(d) => d.download(task, work_dir, controller, observer).await,
            AnyDownloader::DashLive(d) => d.download(task, work_dir, controller, observer).await,
        }
    }
}
