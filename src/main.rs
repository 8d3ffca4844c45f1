use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use colored::Colorize;
use tracing::{debug, error, info, warn};

use streamdl::common::config::EngineConfig;
use streamdl::common::logger::{PrettyLogger, format_duration, init_tracing};
use streamdl::downloader::progress::TerminalProgress;
use streamdl::manifest::{JsonManifestSource, ManifestSource};
use streamdl::post_process::merger::FfmpegRemuxer;
use streamdl::post_process::move_file_to_output;
use streamdl::{DownloadEngine, ProgressSink, Task, TaskState};
use streamdl::{log_info, log_success, log_warning};

mod cli;

use cli::{Cli, Command, Job, StateFile};

/// 配置文件 < 命令行参数 < 环境变量
async fn build_config(args: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .await
            .with_context(|| format!("加载配置失败: {:?}", path))?,
        None => EngineConfig::default(),
    };
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if let Some(temp_dir) = &args.temp_dir {
        config.temp_dir = temp_dir.clone();
    }
    config.apply_env();
    debug!("引擎配置: {:?}", config);
    Ok(config)
}

fn build_engine(config: EngineConfig, job: &Job) -> anyhow::Result<DownloadEngine> {
    let client = streamdl::common::client::HttpClient::new(&config)?;
    let source: Arc<dyn ManifestSource> = match &job.manifest {
        Some(location) => Arc::new(JsonManifestSource::with_location(client, location)),
        None => Arc::new(JsonManifestSource::new(client)),
    };
    let remuxer = Arc::new(FfmpegRemuxer::new(config.ffmpeg_path.clone()));
    Ok(DownloadEngine::new(config, remuxer, source)?)
}

/// 合并出的文件移到输出目录
async fn deliver_output(task: &mut Task, args: &Cli) -> anyhow::Result<()> {
    let Some(file) = task.output_path.clone() else {
        return Ok(());
    };
    if !tokio::fs::try_exists(&file).await? {
        return Ok(());
    }
    PrettyLogger::step("移动输出文件");
    let target = move_file_to_output(&file, &args.output_dir, &task.id).await?;
    PrettyLogger::file_info("输出文件", target.to_string_lossy());
    task.output_path = Some(target);
    Ok(())
}

/// 运行期间状态文件里是 DOWNLOADING，暂停/取消命令据此决定只发信号。
/// 任务没能跑起来时恢复成运行前的记录
async fn run_tracked(
    engine: &DownloadEngine,
    task: &mut Task,
    sink: Arc<dyn ProgressSink>,
    state: &StateFile,
) -> anyhow::Result<TaskState> {
    let before = task.clone();
    let mut running = task.clone();
    running.state = TaskState::Downloading;
    state.save(&running).await?;

    match engine.run(task, sink).await {
        Ok(final_state) => Ok(final_state),
        Err(e) => {
            state.save(&before).await?;
            Err(e).with_context(|| format!("任务 {} 无法运行", before.id))
        }
    }
}

async fn download(engine: &DownloadEngine, mut task: Task, args: &Cli, state: &StateFile) -> anyhow::Result<()> {
    if task.state.is_terminal() {
        log_warning!("任务 {} 已结束 ({})，如需重新下载请删除状态文件中的记录", task.id, task.state);
        return Ok(());
    }
    PrettyLogger::task_info(&task.id, &task.format_id, task.is_live);

    // Ctrl-C 按暂停处理，已下载的部分保留
    let controller = engine.controller_for(&task);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到 Ctrl-C，暂停下载");
            if let Err(e) = controller.request_pause().await {
                error!("设置暂停标记失败: {}", e);
            }
        }
    });

    let sink = Arc::new(TerminalProgress::new(task.is_live));
    let final_state = run_tracked(engine, &mut task, sink, state).await?;
    if final_state == TaskState::Success
        && let Err(e) = deliver_output(&mut task, args).await
    {
        state.save(&task).await?;
        return Err(e);
    }
    state.save(&task).await?;

    PrettyLogger::separator();
    match final_state {
        TaskState::Success => {
            let mut items = vec![format!("任务: {}", task.id)];
            if let Some(path) = &task.output_path {
                items.push(format!("文件: {}", path.display()));
            }
            if task.is_live {
                items.push(format!("时长: {}", format_duration(task.accumulated_duration)));
            }
            if let Some(message) = &task.error_message {
                items.push(format!("{} {}", "部分完成:".yellow(), message));
            }
            let title = if task.is_live { "录制完成！" } else { "下载完成！" };
            PrettyLogger::completion_summary(title, items);
        }
        TaskState::Pause => log_info!("任务 {} 已暂停，再次执行 download 继续", task.id),
        TaskState::Canceled => log_info!("任务 {} 已取消", task.id),
        other => {
            PrettyLogger::error(format!(
                "任务 {} 结束于 {}: {}",
                task.id,
                PrettyLogger::state(other),
                task.error_message.as_deref().unwrap_or("未知错误")
            ));
            bail!("下载失败");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_tracing(args.verbose);

    let config = build_config(&args).await?;
    let job = Job::load(args.command.job_path()).await?;
    let state = StateFile::new(&args.state_file);
    let task = match state.task(job.id()).await? {
        Some(saved) => {
            info!("从状态文件恢复任务 {} ({})", saved.id, saved.state);
            saved
        }
        None => job.to_task(),
    };
    let engine = build_engine(config, &job)?;

    match &args.command {
        Command::Download { .. } => download(&engine, task, &args, &state).await?,
        Command::Pause { .. } => {
            engine.pause(&task).await?;
            log_success!("已请求暂停任务 {}", task.id);
        }
        Command::Cancel { .. } => {
            if task.state == TaskState::Downloading {
                engine.cancel(&task).await?;
                log_success!("已请求取消任务 {}", task.id);
            } else {
                let mut task = task;
                let sink = Arc::new(TerminalProgress::hidden(task.is_live));
                engine.discard(&mut task, sink).await?;
                state.save(&task).await?;
                log_success!("任务 {} 已取消并删除工作目录", task.id);
            }
        }
        Command::StopSave { merge_only, .. } => {
            if task.state == TaskState::Downloading && !merge_only {
                engine.request_stop_and_save(&task).await?;
                log_success!("已请求停止录制，任务 {} 将合并已录制的部分", task.id);
            } else {
                let mut task = task;
                let sink = Arc::new(TerminalProgress::new(task.is_live));
                let final_state = engine.stop_and_save(&mut task, sink).await?;
                if final_state == TaskState::Success {
                    deliver_output(&mut task, &args).await?;
                }
                state.save(&task).await?;
                log_info!("任务 {} 当前状态: {}", task.id, PrettyLogger::state(final_state));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn job(id: &str) -> Job {
        Job {
            id: Some(id.to_string()),
            url: "http://127.0.0.1:9/manifest.json".into(),
            headers: BTreeMap::new(),
            format_id: "hls-720p-1000".into(),
            is_live: false,
            video_codec: None,
            manifest: None,
        }
    }

    #[tokio::test]
    async fn failed_start_restores_the_saved_state() {
        let dir = tempfile::tempdir().unwrap();
        // 工作目录的根是个普通文件，任务目录建不出来
        let blocked = dir.path().join("blocked");
        tokio::fs::write(&blocked, b"").await.unwrap();
        let config = EngineConfig {
            temp_dir: blocked,
            ..Default::default()
        };

        let job = job("restore-me");
        let engine = build_engine(config, &job).unwrap();
        let state = StateFile::new(dir.path().join("state.json"));
        let mut task = job.to_task();
        state.save(&task).await.unwrap();

        let sink = Arc::new(TerminalProgress::hidden(false));
        let err = run_tracked(&engine, &mut task, sink, &state)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("restore-me"));

        let saved = state.task("restore-me").await.unwrap().unwrap();
        assert_eq!(saved.state, TaskState::Pending);
        assert!(!engine.is_active("restore-me"));
    }
}
