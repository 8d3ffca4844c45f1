use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::control::DownloadController;
use super::error::DownloadError;
use super::layout::WorkDir;
use super::task::{Progress, Task};
use super::{DownloadContext, DownloadOutput, ManifestDownloader, ProgressObserver};
use crate::manifest::{MediaKind, MediaSegment, TrackSelection};

/// 待下载的一个分片
struct SegmentJob {
    url: String,
    dest: PathBuf,
    label: String,
}

/// 已完成的字节数和分片数
#[derive(Debug, Default)]
struct VodCounters {
    bytes: u64,
    completed: usize,
}

impl VodCounters {
    fn record(&mut self, bytes: u64) {
        self.bytes += bytes;
        self.completed += 1;
    }

    /// 按已完成分片的平均大小估算总量，全部完成时等于实际字节数
    fn estimate(&self, total_segments: usize) -> Progress {
        if self.completed == 0 {
            return Progress::new(self.bytes, 0);
        }
        let total = self.bytes as u128 * total_segments as u128 / self.completed as u128;
        Progress::new(self.bytes, total.min(u64::MAX as u128) as u64)
    }
}

/// 点播分片下载：音视频分片混在同一个并发池里
pub struct VodSegmentDownloader {
    ctx: Arc<DownloadContext>,
    selection: TrackSelection,
}

impl VodSegmentDownloader {
    pub fn new(ctx: Arc<DownloadContext>, selection: TrackSelection) -> Self {
        Self { ctx, selection }
    }

    fn units(&self) -> impl Iterator<Item = (MediaKind, usize, &MediaSegment)> {
        let video = self
            .selection
            .video_segments()
            .iter()
            .enumerate()
            .map(|(i, s)| (MediaKind::Video, i, s));
        let audio = self
            .selection
            .audio_segments()
            .iter()
            .enumerate()
            .map(|(i, s)| (MediaKind::Audio, i, s));
        video.chain(audio)
    }
}

#[async_trait]
impl ManifestDownloader for VodSegmentDownloader {
    async fn download(
        &self,
        task: &Task,
        work_dir: &WorkDir,
        controller: &DownloadController,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<DownloadOutput, DownloadError> {
        let total_segments = self.units().count();
        if total_segments == 0 {
            return Err(DownloadError::InvalidState("没有可下载的分片".into()));
        }

        // 已存在的分片就是续传的基线
        let mut counters = VodCounters::default();
        let mut pending = Vec::new();
        for (kind, index, segment) in self.units() {
            let dest = work_dir.segment_path(kind, index, segment.is_fragmented());
            let len = self.ctx.store.len(&dest).await?;
            if len > 0 {
                counters.record(len);
            } else {
                pending.push(SegmentJob {
                    url: segment.url.clone(),
                    dest,
                    label: format!("[{}] {} #{}", task.id, kind, index),
                });
            }
        }

        info!(
            "📦 任务 {}: 共 {} 个分片，已完成 {} 个，待下载 {} 个",
            task.id,
            total_segments,
            counters.completed,
            pending.len()
        );
        if counters.completed > 0 {
            observer.on_progress(counters.estimate(total_segments));
        }

        let counters = Arc::new(Mutex::new(counters));
        let semaphore = Arc::new(Semaphore::new(self.ctx.config.parallelism()));
        let fetcher = self.ctx.fetcher(task, controller);
        let mut join_set = JoinSet::new();

        for job in pending {
            let semaphore = Arc::clone(&semaphore);
            let fetcher = fetcher.clone();
            let counters = Arc::clone(&counters);
            let observer = Arc::clone(&observer);
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| DownloadError::InvalidState("并发池已关闭".into()))?;
                let bytes = fetcher.fetch(&job.url, &job.dest, &job.label).await?;

                // 在锁内上报，保证进度单调
                let mut counters = counters
                    .lock()
                    .map_err(|_| DownloadError::InvalidState("进度计数器锁已损坏".into()))?;
                counters.record(bytes);
                observer.on_progress(counters.estimate(total_segments));
                Ok::<(), DownloadError>(())
            });
        }

        let mut first_error: Option<DownloadError> = None;
        while let Some(joined) = join_set.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => Err(DownloadError::InvalidState(format!("分片任务异常退出: {}", e))),
            };
            if let Err(e) = result {
                if e.is_interruption() {
                    // 其余分片会在下一次检查时自行停下
                    debug!("任务 {} 分片下载被打断: {}", task.id, e);
                } else {
                    error!("❌ 任务 {} 分片下载失败: {}", task.id, e);
                    join_set.abort_all();
                }
                if first_error.as_ref().is_none_or(|prev| prev.is_interruption() && !e.is_interruption()) {
                    first_error = Some(e);
                }
            }
        }

        // 汇合之后再看一次控制标记，被打断的点播任务不合并
        if let Some(reason) = controller.signal() {
            warn!("⏸️ 任务 {} 在合并前被{}", task.id, reason);
            return Err(DownloadError::Interrupted(reason));
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let final_progress = {
            let counters = counters
                .lock()
                .map_err(|_| DownloadError::InvalidState("进度计数器锁已损坏".into()))?;
            Progress::new(counters.bytes, counters.bytes)
        };
        observer.on_merge(final_progress);

        let output = work_dir.merged_output(&self.ctx.config.container);
        self.ctx
            .merger(task, work_dir)
            .merge_segments(
                self.selection.video_segments(),
                self.selection.audio_segments(),
                &output,
                &self.ctx.codec_hint(task),
            )
            .await?
            .into_result("分片")?;

        info!("✅ 任务 {} 合并完成: {:?}", task.id, output);
        Ok(DownloadOutput::complete(output))
    }
}
