use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use super::control::DownloadController;
use super::error::{DownloadError, Interruption};
use super::fetcher::SegmentFetcher;
use super::layout::WorkDir;
use super::store::SegmentStore;
use super::task::{Progress, Task};
use super::{DownloadContext, DownloadOutput, ManifestDownloader, ProgressObserver};
use crate::manifest::{InitSegment, MediaKind, MediaSegment, StreamSelector, TrackSelection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveFlavor {
    Hls,
    Dash,
}

#[derive(Debug, Serialize, Deserialize)]
struct CapturedEntry {
    kind: MediaKind,
    segment: MediaSegment,
}

/// 已录制的分片。列表只在分片下载成功后增长，下一个分片的下标就是当前长度
#[derive(Debug, Default)]
struct Capture {
    video: Vec<MediaSegment>,
    audio: Vec<MediaSegment>,
    seen: HashSet<String>,
    bytes: u64,
    duration: f64,
}

impl Capture {
    /// 从录制记录恢复，只认磁盘上确实存在的连续分片
    async fn load(work_dir: &WorkDir, store: &dyn SegmentStore) -> Result<Self, DownloadError> {
        let mut capture = Capture::default();
        let text = match tokio::fs::read_to_string(work_dir.capture_log_path()).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(capture),
            Err(e) => return Err(e.into()),
        };

        let entries: Vec<CapturedEntry> = text
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        let has_video = entries.iter().any(|e| e.kind == MediaKind::Video);
        for entry in entries {
            let index = capture.list(entry.kind).len();
            let dest = work_dir.segment_path(entry.kind, index, entry.segment.is_fragmented());
            let len = store.len(&dest).await?;
            if len == 0 {
                continue;
            }
            let counts = entry.kind == MediaKind::Video || !has_video;
            capture.push(entry.kind, entry.segment, len, counts);
        }
        if !capture.is_empty() {
            info!(
                "🔁 恢复直播录制: 视频 {} 个，音频 {} 个分片",
                capture.video.len(),
                capture.audio.len()
            );
        }
        Ok(capture)
    }

    fn list(&self, kind: MediaKind) -> &[MediaSegment] {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty()
    }

    fn push(&mut self, kind: MediaKind, segment: MediaSegment, bytes: u64, counts_duration: bool) {
        self.seen.insert(segment.url.clone());
        self.bytes += bytes;
        if counts_duration {
            self.duration += segment.duration;
        }
        match kind {
            MediaKind::Video => self.video.push(segment),
            MediaKind::Audio => self.audio.push(segment),
        }
    }
}

async fn append_capture_log(
    work_dir: &WorkDir,
    kind: MediaKind,
    segment: &MediaSegment,
) -> Result<(), DownloadError> {
    let entry = CapturedEntry {
        kind,
        segment: segment.clone(),
    };
    let mut line = serde_json::to_string(&entry).map_err(std::io::Error::other)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(work_dir.capture_log_path())
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// 只有磁盘文件时补出的分片描述，元数据取自模板
fn placeholder(template: Option<&MediaSegment>, fragmented: bool) -> MediaSegment {
    let mut segment = MediaSegment::new("", template.map_or(0.0, |t| t.duration));
    if fragmented {
        segment.init = Some(
            template
                .and_then(|t| t.init.clone())
                .unwrap_or(InitSegment { url: String::new() }),
        );
    } else {
        segment.encryption = template.and_then(|t| t.encryption.clone());
    }
    segment
}

/// 直播录制：反复刷新清单，按到达顺序逐个下载新分片，结束后总是尝试合并
pub struct LiveCaptureLoop {
    ctx: Arc<DownloadContext>,
    flavor: LiveFlavor,
    selection: Option<TrackSelection>,
    merge_only: bool,
}

impl LiveCaptureLoop {
    pub fn new(ctx: Arc<DownloadContext>, flavor: LiveFlavor, selection: TrackSelection) -> Self {
        Self {
            ctx,
            flavor,
            selection: Some(selection),
            merge_only: false,
        }
    }

    /// 跳过录制，只合并磁盘上已有的分片
    pub fn merge_only(ctx: Arc<DownloadContext>) -> Self {
        Self {
            ctx,
            // 不刷新清单，用不到等待间隔
            flavor: LiveFlavor::Hls,
            selection: None,
            merge_only: true,
        }
    }

    pub fn flavor(&self) -> LiveFlavor {
        self.flavor
    }

    /// 两次刷新之间的等待
    fn refresh_interval(&self, selection: &TrackSelection) -> Duration {
        let config = &self.ctx.config;
        let timeline = selection.timeline();
        match self.flavor {
            LiveFlavor::Hls => {
                let target = timeline
                    .and_then(|t| t.target_duration)
                    .filter(|d| *d > 0.0)
                    .unwrap_or(config.hls_default_target_duration_secs);
                Duration::from_secs_f64((target / 2.0).max(0.0))
            }
            LiveFlavor::Dash => {
                let period_ms = timeline
                    .and_then(|t| t.minimum_update_period)
                    .filter(|p| *p > 0.0)
                    .map(|p| (p * 1000.0) as u64)
                    .unwrap_or(config.dash_default_update_period_ms);
                Duration::from_millis(period_ms.max(config.dash_min_update_period_ms))
            }
        }
    }

    async fn refresh(&self, task: &Task) -> Result<TrackSelection, DownloadError> {
        let manifest = self.ctx.source.fetch(&task.url, &task.headers).await?;
        Ok(StreamSelector::select(&manifest, &task.format_id)?)
    }

    async fn ensure_init(
        &self,
        fetcher: &SegmentFetcher,
        work_dir: &WorkDir,
        kind: MediaKind,
        segment: &MediaSegment,
        task: &Task,
    ) -> Result<(), DownloadError> {
        if let Some(init) = &segment.init
            && !init.url.is_empty()
        {
            let label = format!("[{}] {} init", task.id, kind);
            fetcher.fetch(&init.url, &work_dir.init_path(kind), &label).await?;
        }
        Ok(())
    }

    async fn capture_new(
        &self,
        selection: &TrackSelection,
        task: &Task,
        work_dir: &WorkDir,
        fetcher: &SegmentFetcher,
        observer: &Arc<dyn ProgressObserver>,
        capture: &mut Capture,
    ) -> Result<(), DownloadError> {
        let streams = [
            (MediaKind::Video, selection.video_segments()),
            (MediaKind::Audio, selection.audio_segments()),
        ];
        for (kind, segments) in streams {
            let counts_duration = kind == MediaKind::Video || selection.video.is_none();
            for segment in segments {
                if capture.seen.contains(&segment.url) {
                    continue;
                }
                self.ensure_init(fetcher, work_dir, kind, segment, task)
                    .await?;

                let index = capture.list(kind).len();
                let dest = work_dir.segment_path(kind, index, segment.is_fragmented());
                let label = format!("[{}] live {} #{}", task.id, kind, index);
                let bytes = fetcher.fetch(&segment.url, &dest, &label).await?;
                append_capture_log(work_dir, kind, segment).await?;

                capture.push(kind, segment.clone(), bytes, counts_duration);
                observer.on_progress(Progress::live(capture.bytes));
                observer.on_duration(capture.duration);
            }
        }
        Ok(())
    }

    async fn capture(
        &self,
        task: &Task,
        work_dir: &WorkDir,
        controller: &DownloadController,
        observer: &Arc<dyn ProgressObserver>,
        capture: &mut Capture,
    ) -> Result<(), DownloadError> {
        let fetcher = self.ctx.fetcher(task, controller);
        let mut next = self.selection.clone();

        if self.flavor == LiveFlavor::Dash
            && let Some(selection) = &next
        {
            for (kind, segments) in [
                (MediaKind::Video, selection.video_segments()),
                (MediaKind::Audio, selection.audio_segments()),
            ] {
                if let Some(first) = segments.first() {
                    self.ensure_init(&fetcher, work_dir, kind, first, task)
                        .await?;
                }
            }
        }

        loop {
            if let Some(reason) = controller.signal() {
                info!("⏹️ 任务 {} 直播录制收到{}信号", task.id, reason);
                break;
            }

            let selection = match next.take() {
                Some(selection) => selection,
                None => self.refresh(task).await?,
            };
            self.capture_new(&selection, task, work_dir, &fetcher, observer, capture)
                .await?;

            if selection.is_ended() {
                info!("🏁 任务 {} 直播已结束", task.id);
                break;
            }

            let wait = self.refresh_interval(&selection);
            debug!("任务 {} 等待 {:?} 后刷新清单", task.id, wait);
            if let Some(reason) = controller.interruptible_sleep(wait).await {
                info!("⏹️ 任务 {} 等待中收到{}信号", task.id, reason);
                break;
            }
        }
        Ok(())
    }

    async fn merge(
        &self,
        task: &Task,
        work_dir: &WorkDir,
        video: &[MediaSegment],
        audio: &[MediaSegment],
    ) -> Result<std::path::PathBuf, DownloadError> {
        let output = work_dir.merged_output(&self.ctx.config.container);
        self.ctx
            .merger(task, work_dir)
            .merge_segments(video, audio, &output, &self.ctx.codec_hint(task))
            .await?
            .into_result("直播分片")?;
        Ok(output)
    }

    /// 磁盘上连续的分片，优先用录制记录里的元数据
    async fn on_disk(
        &self,
        work_dir: &WorkDir,
        kind: MediaKind,
        logged: &[MediaSegment],
        template: Option<&MediaSegment>,
    ) -> Result<(Vec<MediaSegment>, u64), DownloadError> {
        let (count, fragmented) = work_dir.scan_contiguous(kind).await?;
        let mut segments = Vec::with_capacity(count);
        let mut bytes = 0;
        for index in 0..count {
            let segment = logged
                .get(index)
                .filter(|s| s.is_fragmented() == fragmented)
                .cloned()
                .unwrap_or_else(|| placeholder(template, fragmented));
            bytes += file_len(&work_dir.segment_path(kind, index, fragmented)).await?;
            segments.push(segment);
        }
        Ok((segments, bytes))
    }

    async fn merge_existing(
        &self,
        task: &Task,
        work_dir: &WorkDir,
        observer: &Arc<dyn ProgressObserver>,
    ) -> Result<DownloadOutput, DownloadError> {
        info!("🧩 任务 {} 只合并已录制的分片", task.id);
        // 清单只用来补全 init / 密钥等信息，拿不到也照样合并
        let snapshot = match self.refresh(task).await {
            Ok(selection) => Some(selection),
            Err(e) => {
                warn!("任务 {} 获取清单快照失败，按磁盘文件合并: {}", task.id, e);
                None
            }
        };
        let logged = match Capture::load(work_dir, self.ctx.store.as_ref()).await {
            Ok(capture) => capture,
            Err(e) => {
                warn!("任务 {} 读取录制记录失败: {}", task.id, e);
                Capture::default()
            }
        };

        let (video, video_bytes) = self
            .on_disk(
                work_dir,
                MediaKind::Video,
                &logged.video,
                snapshot.as_ref().and_then(|s| s.video_segments().first()),
            )
            .await?;
        let (audio, audio_bytes) = self
            .on_disk(
                work_dir,
                MediaKind::Audio,
                &logged.audio,
                snapshot.as_ref().and_then(|s| s.audio_segments().first()),
            )
            .await?;
        if video.is_empty() && audio.is_empty() {
            return Err(DownloadError::NothingCaptured);
        }

        observer.on_merge(Progress::live(video_bytes + audio_bytes));
        let output = self.merge(task, work_dir, &video, &audio).await?;
        Ok(DownloadOutput::complete(output))
    }
}

async fn file_len(path: &Path) -> Result<u64, DownloadError> {
    Ok(tokio::fs::metadata(path).await?.len())
}

#[async_trait]
impl ManifestDownloader for LiveCaptureLoop {
    async fn download(
        &self,
        task: &Task,
        work_dir: &WorkDir,
        controller: &DownloadController,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<DownloadOutput, DownloadError> {
        if self.merge_only {
            return self.merge_existing(task, work_dir, &observer).await;
        }

        let mut capture = Capture::load(work_dir, self.ctx.store.as_ref()).await?;
        let outcome = self
            .capture(task, work_dir, controller, &observer, &mut capture)
            .await;

        // 停止保存是正常结束，其它信号和异常都作为原因带出去
        let cause = match outcome {
            Ok(()) => controller
                .signal()
                .filter(|reason| *reason != Interruption::StopAndSave)
                .map(DownloadError::Interrupted),
            Err(DownloadError::Interrupted(Interruption::StopAndSave)) => None,
            Err(e) => {
                if !e.is_interruption() {
                    error!("❌ 任务 {} 直播录制出错: {}", task.id, e);
                }
                Some(e)
            }
        };

        if capture.is_empty() {
            return Err(cause.unwrap_or(DownloadError::NothingCaptured));
        }

        info!(
            "🧩 任务 {} 录制结束，共 {} 个视频分片 {} 个音频分片，时长 {:.1}s",
            task.id,
            capture.video.len(),
            capture.audio.len(),
            capture.duration
        );
        observer.on_merge(Progress::live(capture.bytes));

        match self.merge(task, work_dir, &capture.video, &capture.audio).await {
            Ok(file) => Ok(DownloadOutput {
                file,
                interrupted: cause,
            }),
            Err(merge_error) => match cause {
                None => Err(merge_error),
                Some(cause) => {
                    let logs = match &merge_error {
                        DownloadError::Merge { logs, .. } => logs.clone(),
                        _ => String::new(),
                    };
                    Err(DownloadError::Merge {
                        message: format!("录制中断（{}）后合并失败: {}", cause, merge_error),
                        logs,
                        source: Some(Box::new(cause)),
                    })
                }
            },
        }
    }
}
