use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use super::base_url::BaseUrlDownloader;
use super::control::DownloadController;
use super::error::{DownloadError, Interruption};
use super::layout::WorkDir;
use super::live::{LiveCaptureLoop, LiveFlavor};
use super::store::FsSegmentStore;
use super::task::{Progress, Task, TaskState};
use super::vod::VodSegmentDownloader;
use super::{
    AnyDownloader, DownloadContext, DownloadOutput, ManifestDownloader, ProgressObserver,
};
use crate::common::client::HttpClient;
use crate::common::config::EngineConfig;
use crate::manifest::{
    ManifestError, ManifestShape, ManifestSource, Protocol, StreamSelector, TrackSelection,
};
use crate::post_process::merger::Remuxer;

const PAUSED_MESSAGE: &str = "Paused";
const CANCELED_MESSAGE: &str = "Canceled";

/// 进度与状态的接收方，负责展示和持久化
pub trait ProgressSink: Send + Sync {
    fn report(&self, task: &Task, progress: Progress, state: TaskState);
}

/// 把下载器的回调写进任务，再转给 sink
struct TaskObserver {
    task: Arc<Mutex<Task>>,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressObserver for TaskObserver {
    fn on_progress(&self, progress: Progress) {
        if let Ok(mut task) = self.task.lock() {
            task.apply_progress(progress);
            self.sink.report(&task, progress, TaskState::Downloading);
        }
    }

    fn on_merge(&self, progress: Progress) {
        if let Ok(mut task) = self.task.lock() {
            task.apply_progress(progress);
            self.sink.report(&task, progress, TaskState::Prepare);
        }
    }

    fn on_duration(&self, seconds: f64) {
        if let Ok(mut task) = self.task.lock() {
            task.accumulated_duration = seconds;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Capture,
    MergeOnly,
}

// 任务运行期间登记在进程内的注册表里
struct ActiveGuard {
    active: Arc<DashMap<String, ()>>,
    task_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.remove(&self.task_id);
    }
}

/// 下载引擎：选下载器、运行、把结果映射成唯一的最终状态
#[derive(Clone)]
pub struct DownloadEngine {
    ctx: Arc<DownloadContext>,
    active: Arc<DashMap<String, ()>>, // task_id
}

impl DownloadEngine {
    pub fn new(
        config: EngineConfig,
        remuxer: Arc<dyn Remuxer>,
        source: Arc<dyn ManifestSource>,
    ) -> Result<Self, DownloadError> {
        let client = HttpClient::new(&config)?;
        Ok(Self::from_context(DownloadContext {
            config,
            client,
            store: Arc::new(FsSegmentStore),
            remuxer,
            source,
        }))
    }

    pub fn from_context(ctx: DownloadContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn work_dir_for(&self, task: &Task) -> WorkDir {
        WorkDir::new(self.ctx.config.work_dir_for(&task.id))
    }

    pub fn controller_for(&self, task: &Task) -> DownloadController {
        DownloadController::new(
            self.ctx.config.work_dir_for(&task.id),
            self.ctx.config.poll_interval(),
        )
    }

    /// 本进程内是否正在运行该任务
    pub fn is_active(&self, task_id: &str) -> bool {
        self.active.contains_key(task_id)
    }

    fn register(&self, task_id: &str) -> Result<ActiveGuard, DownloadError> {
        if self.active.insert(task_id.to_string(), ()).is_some() {
            return Err(DownloadError::InvalidState(format!(
                "任务 {} 已在运行",
                task_id
            )));
        }
        Ok(ActiveGuard {
            active: Arc::clone(&self.active),
            task_id: task_id.to_string(),
        })
    }

    /// 按（分片列表 / 整文件）×（点播 / 直播）选择下载器
    pub fn select_downloader(
        &self,
        task: &Task,
        selection: TrackSelection,
    ) -> Result<AnyDownloader, DownloadError> {
        let shape = selection
            .shape()
            .ok_or(DownloadError::Manifest(ManifestError::NoMedia))?;
        let ctx = Arc::clone(&self.ctx);

        let downloader = match (shape, task.is_live) {
            (ManifestShape::SegmentList, false) => {
                AnyDownloader::Vod(VodSegmentDownloader::new(ctx, selection))
            }
            (ManifestShape::BaseUrl, false) => {
                AnyDownloader::BaseUrl(BaseUrlDownloader::new(ctx, selection))
            }
            (ManifestShape::BaseUrl, true) => {
                warn!("任务 {} 的整文件清单不能按直播录制，改为点播下载", task.id);
                AnyDownloader::BaseUrl(BaseUrlDownloader::new(ctx, selection))
            }
            (ManifestShape::SegmentList, true) => match selection.protocol {
                Protocol::Hls => AnyDownloader::HlsLive(LiveCaptureLoop::new(
                    ctx,
                    LiveFlavor::Hls,
                    selection,
                )),
                Protocol::Dash => AnyDownloader::DashLive(LiveCaptureLoop::new(
                    ctx,
                    LiveFlavor::Dash,
                    selection,
                )),
            },
        };
        Ok(downloader)
    }

    /// 运行任务直到得到一个最终状态
    pub async fn run(
        &self,
        task: &mut Task,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<TaskState, DownloadError> {
        self.drive(task, sink, RunMode::Capture).await
    }

    pub async fn pause(&self, task: &Task) -> Result<(), DownloadError> {
        info!("⏸️ 请求暂停任务 {}", task.id);
        self.controller_for(task).request_pause().await
    }

    pub async fn cancel(&self, task: &Task) -> Result<(), DownloadError> {
        info!("🛑 请求取消任务 {}", task.id);
        self.controller_for(task).request_cancel().await
    }

    /// 只设置停止保存标记，由正在运行的录制自行合并
    pub async fn request_stop_and_save(&self, task: &Task) -> Result<(), DownloadError> {
        info!("💾 请求停止并保存任务 {}", task.id);
        self.controller_for(task).request_stop_and_save().await
    }

    /// 停止并保存。本进程没有在录制时，直接合并磁盘上已有的分片
    pub async fn stop_and_save(
        &self,
        task: &mut Task,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<TaskState, DownloadError> {
        self.request_stop_and_save(task).await?;
        if self.is_active(&task.id) {
            info!("任务 {} 正在录制，等待录制循环合并", task.id);
            return Ok(task.state);
        }
        if !task.is_live {
            debug!("点播任务 {} 只设置标记", task.id);
            return Ok(task.state);
        }
        self.drive(task, sink, RunMode::MergeOnly).await
    }

    /// 丢弃任务：删除工作目录并标记为取消
    pub async fn discard(
        &self,
        task: &mut Task,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<TaskState, DownloadError> {
        if self.is_active(&task.id) {
            self.cancel(task).await?;
            return Ok(task.state);
        }
        self.work_dir_for(task).remove().await?;
        task.output_path = None;
        if !task.state.is_terminal() {
            task.finish(TaskState::Canceled, Some(CANCELED_MESSAGE.to_string()))?;
        }
        sink.report(task, current_progress(task), task.state);
        Ok(task.state)
    }

    async fn drive(
        &self,
        task: &mut Task,
        sink: Arc<dyn ProgressSink>,
        mode: RunMode,
    ) -> Result<TaskState, DownloadError> {
        if task.state.is_terminal() {
            return Err(DownloadError::InvalidState(format!(
                "任务 {} 已结束 ({})",
                task.id, task.state
            )));
        }

        let _guard = self.register(&task.id)?;
        let work_dir = self.work_dir_for(task);
        let controller = self.controller_for(task);
        match mode {
            RunMode::Capture => controller.start().await?,
            RunMode::MergeOnly => work_dir.ensure().await?,
        }

        task.transition(TaskState::Downloading)?;
        sink.report(task, current_progress(task), TaskState::Downloading);
        info!(
            "🚀 任务 {} 开始 (格式 {}, {})",
            task.id,
            task.format_id,
            if task.is_live { "直播" } else { "点播" }
        );

        let shared = Arc::new(Mutex::new(task.clone()));
        let observer: Arc<dyn ProgressObserver> = Arc::new(TaskObserver {
            task: Arc::clone(&shared),
            sink: Arc::clone(&sink),
        });
        let outcome = match mode {
            RunMode::Capture => self.execute(task, &work_dir, &controller, observer).await,
            RunMode::MergeOnly => {
                LiveCaptureLoop::merge_only(Arc::clone(&self.ctx))
                    .download(task, &work_dir, &controller, observer)
                    .await
            }
        };

        if let Ok(observed) = shared.lock() {
            task.downloaded_bytes = observed.downloaded_bytes;
            task.total_bytes = observed.total_bytes;
            task.progress = observed.progress;
            task.accumulated_duration = observed.accumulated_duration;
        }

        let state = self.settle(task, &work_dir, outcome).await?;
        sink.report(task, current_progress(task), state);
        Ok(state)
    }

    async fn execute(
        &self,
        task: &Task,
        work_dir: &WorkDir,
        controller: &DownloadController,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<DownloadOutput, DownloadError> {
        let manifest = self.ctx.source.fetch(&task.url, &task.headers).await?;
        let selection = StreamSelector::select(&manifest, &task.format_id)?;
        let downloader = self.select_downloader(task, selection)?;
        info!("任务 {} 使用{}下载器", task.id, downloader.name());
        downloader
            .download(task, work_dir, controller, observer)
            .await
    }

    /// 把下载结果映射成最终状态
    async fn settle(
        &self,
        task: &mut Task,
        work_dir: &WorkDir,
        outcome: Result<DownloadOutput, DownloadError>,
    ) -> Result<TaskState, DownloadError> {
        match outcome {
            Ok(output) => {
                task.output_path = Some(output.file.clone());
                match output.interrupted {
                    None | Some(DownloadError::Interrupted(Interruption::StopAndSave)) => {
                        info!("✅ 任务 {} 完成: {:?}", task.id, output.file);
                        task.finish(TaskState::Success, None)?;
                    }
                    // 暂停的直播录制仍然合并出了文件，状态保持 PAUSE
                    Some(DownloadError::Interrupted(Interruption::Pause)) => {
                        info!("⏸️ 任务 {} 已暂停，已录制部分合并到 {:?}", task.id, output.file);
                        pause(task)?;
                    }
                    Some(DownloadError::Interrupted(Interruption::Cancel)) => {
                        if let Err(e) = work_dir.clear_except(&output.file).await {
                            warn!("清理任务 {} 工作目录失败: {}", task.id, e);
                        }
                        info!("🛑 任务 {} 已取消，保留已录制部分 {:?}", task.id, output.file);
                        task.finish(TaskState::Canceled, Some(CANCELED_MESSAGE.to_string()))?;
                    }
                    Some(cause) => {
                        warn!("⚠️ 任务 {} 部分完成: {}", task.id, cause);
                        task.finish(TaskState::Success, Some(describe(&cause)))?;
                    }
                }
            }
            Err(e) => match e.interruption() {
                Some(Interruption::Pause) | Some(Interruption::StopAndSave) => {
                    info!("⏸️ 任务 {} 已暂停", task.id);
                    pause(task)?;
                }
                Some(Interruption::Cancel) => {
                    if let Err(e) = work_dir.remove().await {
                        warn!("删除任务 {} 工作目录失败: {}", task.id, e);
                    }
                    info!("🛑 任务 {} 已取消", task.id);
                    task.finish(TaskState::Canceled, Some(CANCELED_MESSAGE.to_string()))?;
                }
                None if e.is_out_of_space() => {
                    error!("💽 任务 {} 磁盘空间不足: {}", task.id, e);
                    task.finish(TaskState::OutOfSpace, Some(describe(&e)))?;
                }
                None => {
                    error!("❌ 任务 {} 失败: {}", task.id, describe(&e));
                    if let DownloadError::Merge { logs, .. } = &e {
                        debug!("合并日志:\n{}", logs);
                    }
                    task.finish(TaskState::Error, Some(describe(&e)))?;
                }
            },
        }
        Ok(task.state)
    }
}

fn pause(task: &mut Task) -> Result<(), DownloadError> {
    task.transition(TaskState::Pause)?;
    task.error_message = Some(PAUSED_MESSAGE.to_string());
    Ok(())
}

fn current_progress(task: &Task) -> Progress {
    Progress::new(task.downloaded_bytes, task.total_bytes)
}

/// 错误信息带上最初的原因
fn describe(e: &DownloadError) -> String {
    let root = e.root_cause();
    if std::ptr::eq(root, e) {
        e.to_string()
    } else {
        format!("{} (原因: {})", e, root)
    }
}
