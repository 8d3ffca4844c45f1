use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::chunked::{ByteProgress, ChunkedFileDownloader};
use super::control::DownloadController;
use super::error::DownloadError;
use super::layout::WorkDir;
use super::task::{Progress, Task};
use super::{DownloadContext, DownloadOutput, ManifestDownloader, ProgressObserver};
use crate::manifest::{MediaKind, TrackSelection};

// 音视频两路各自的 (已下载, 总量)
#[derive(Debug, Default)]
struct CombinedProgress {
    video: (u64, u64),
    audio: (u64, u64),
}

impl CombinedProgress {
    fn update(&mut self, kind: MediaKind, current: u64, total: u64) -> Progress {
        match kind {
            MediaKind::Video => self.video = (current, total),
            MediaKind::Audio => self.audio = (current, total),
        }
        self.total()
    }

    fn total(&self) -> Progress {
        Progress::new(self.video.0 + self.audio.0, self.video.1 + self.audio.1)
    }
}

/// DASH BaseURL：每一路是一个完整文件，用分块下载器拉取后合并
pub struct BaseUrlDownloader {
    ctx: Arc<DownloadContext>,
    selection: TrackSelection,
}

impl BaseUrlDownloader {
    pub fn new(ctx: Arc<DownloadContext>, selection: TrackSelection) -> Self {
        Self { ctx, selection }
    }

    fn stream_url(&self, kind: MediaKind) -> Option<&str> {
        let rep = match kind {
            MediaKind::Video => self.selection.video.as_ref(),
            MediaKind::Audio => self.selection.audio.as_ref(),
        }?;
        rep.base_urls().first().map(String::as_str)
    }

    async fn fetch_stream(
        &self,
        kind: MediaKind,
        task: &Task,
        work_dir: &WorkDir,
        controller: &DownloadController,
        combined: &Arc<Mutex<CombinedProgress>>,
        observer: &Arc<dyn ProgressObserver>,
    ) -> Result<Option<PathBuf>, DownloadError> {
        let Some(url) = self.stream_url(kind) else {
            return Ok(None);
        };
        let dest = work_dir.stream_path(kind);
        info!("⬇️ 任务 {}: 下载{}整文件 {}", task.id, kind, url);

        let combined = Arc::clone(combined);
        let observer = Arc::clone(observer);
        let on_progress: ByteProgress = Arc::new(move |current, total| {
            // 两路可能同时回调，合并后在锁内上报
            if let Ok(mut combined) = combined.lock() {
                observer.on_progress(combined.update(kind, current, total));
            }
        });

        let downloader = ChunkedFileDownloader::new(
            self.ctx.client.clone(),
            task.headers.clone(),
            controller.clone(),
            self.ctx.config.parallelism(),
        )
        .with_retry(self.ctx.config.retry.clone());
        let bytes = downloader.download(url, &dest, on_progress).await?;
        debug!("任务 {}: {} 整文件完成 {} 字节", task.id, kind, bytes);
        Ok(Some(dest))
    }
}

#[async_trait]
impl ManifestDownloader for BaseUrlDownloader {
    async fn download(
        &self,
        task: &Task,
        work_dir: &WorkDir,
        controller: &DownloadController,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<DownloadOutput, DownloadError> {
        let combined = Arc::new(Mutex::new(CombinedProgress::default()));

        let (video, audio) = tokio::try_join!(
            self.fetch_stream(MediaKind::Video, task, work_dir, controller, &combined, &observer),
            self.fetch_stream(MediaKind::Audio, task, work_dir, controller, &combined, &observer),
        )?;
        if video.is_none() && audio.is_none() {
            return Err(DownloadError::InvalidState("没有可下载的整文件地址".into()));
        }

        controller.check()?;

        let final_progress = combined
            .lock()
            .map(|c| c.total())
            .map_err(|_| DownloadError::InvalidState("进度锁已损坏".into()))?;
        observer.on_merge(final_progress);

        let output = work_dir.merged_output(&self.ctx.config.container);
        self.ctx
            .merger(task, work_dir)
            .merge_files(
                video.as_deref(),
                audio.as_deref(),
                &output,
                &self.ctx.codec_hint(task),
            )
            .await?
            .into_result("整文件")?;

        for path in video.iter().chain(audio.iter()) {
            remove_intermediate(path).await;
        }
        info!("✅ 任务 {} 合并完成: {:?}", task.id, output);
        Ok(DownloadOutput::complete(output))
    }
}

async fn remove_intermediate(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("删除中间文件失败 {:?}: {}", path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_progress_sums_both_streams() {
        let mut combined = CombinedProgress::default();
        assert_eq!(combined.update(MediaKind::Video, 10, 100), Progress::new(10, 100));
        assert_eq!(combined.update(MediaKind::Audio, 5, 50), Progress::new(15, 150));
        assert_eq!(combined.update(MediaKind::Video, 100, 100), Progress::new(105, 150));
    }
}
