use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::error::{DownloadError, Interruption};

const PAUSE_FLAG: &str = "pause";
const CANCEL_FLAG: &str = "cancel";
const STOP_AND_SAVE_FLAG: &str = "stop_and_save";

/// 基于标记文件的控制器
///
/// 信号以文件形式放在任务工作目录里，另一个进程发出的暂停/取消/停止保存
/// 也能被正在下载的进程看到。只能轮询，不做事件通知。
#[derive(Debug, Clone)]
pub struct DownloadController {
    work_dir: PathBuf,
    poll_interval: Duration,
}

impl DownloadController {
    pub fn new(work_dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            work_dir: work_dir.into(),
            poll_interval,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// 新一轮下载前清掉旧的标记
    pub async fn start(&self) -> Result<(), DownloadError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        for name in [PAUSE_FLAG, CANCEL_FLAG, STOP_AND_SAVE_FLAG] {
            match tokio::fs::remove_file(self.work_dir.join(name)).await {
                Ok(()) => debug!("清除旧标记: {}", name),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub async fn request_pause(&self) -> Result<(), DownloadError> {
        self.raise(PAUSE_FLAG).await
    }

    pub async fn request_cancel(&self) -> Result<(), DownloadError> {
        self.raise(CANCEL_FLAG).await
    }

    pub async fn request_stop_and_save(&self) -> Result<(), DownloadError> {
        self.raise(STOP_AND_SAVE_FLAG).await
    }

    async fn raise(&self, name: &str) -> Result<(), DownloadError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.work_dir.join(name))
            .await?;
        debug!("设置标记 {} -> {:?}", name, self.work_dir);
        Ok(())
    }

    pub fn is_pause_requested(&self) -> bool {
        self.work_dir.join(PAUSE_FLAG).exists()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.work_dir.join(CANCEL_FLAG).exists()
    }

    pub fn is_stop_and_save_requested(&self) -> bool {
        self.work_dir.join(STOP_AND_SAVE_FLAG).exists()
    }

    pub fn is_interrupted(&self) -> bool {
        self.signal().is_some()
    }

    /// 当前信号，同时存在时取消优先于暂停，暂停优先于停止保存
    pub fn signal(&self) -> Option<Interruption> {
        if self.is_cancel_requested() {
            Some(Interruption::Cancel)
        } else if self.is_pause_requested() {
            Some(Interruption::Pause)
        } else if self.is_stop_and_save_requested() {
            Some(Interruption::StopAndSave)
        } else {
            None
        }
    }

    /// 有信号就返回对应的中断错误
    pub fn check(&self) -> Result<(), DownloadError> {
        match self.signal() {
            Some(reason) => Err(DownloadError::Interrupted(reason)),
            None => Ok(()),
        }
    }

    /// 可中断的等待：按轮询间隔检查标记，收到信号提前返回
    pub async fn interruptible_sleep(&self, duration: Duration) -> Option<Interruption> {
        let deadline = Instant::now() + duration;
        loop {
            if let Some(reason) = self.signal() {
                return Some(reason);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(dir: &Path) -> DownloadController {
        DownloadController::new(dir.join("task"), Duration::from_millis(20))
    }

    #[tokio::test]
    async fn flags_are_visible_to_another_instance() {
        let dir = tempfile::tempdir().unwrap();
        let a = controller(dir.path());
        let b = controller(dir.path());
        a.start().await.unwrap();
        assert!(!b.is_interrupted());

        a.request_pause().await.unwrap();
        assert!(b.is_pause_requested());
        assert_eq!(b.signal(), Some(Interruption::Pause));

        a.request_cancel().await.unwrap();
        assert_eq!(b.signal(), Some(Interruption::Cancel));

        b.start().await.unwrap();
        assert!(!a.is_interrupted());
    }

    #[tokio::test]
    async fn sleep_returns_early_on_signal() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        ctl.start().await.unwrap();

        let raiser = ctl.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            raiser.request_stop_and_save().await.unwrap();
        });

        let started = std::time::Instant::now();
        let reason = ctl.interruptible_sleep(Duration::from_secs(5)).await;
        assert_eq!(reason, Some(Interruption::StopAndSave));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn sleep_runs_to_completion_without_signal() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        ctl.start().await.unwrap();
        assert_eq!(ctl.interruptible_sleep(Duration::from_millis(50)).await, None);
        assert!(ctl.check().is_ok());
    }
}
