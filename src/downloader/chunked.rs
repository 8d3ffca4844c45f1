use std::collections::BTreeMap;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::control::DownloadController;
use super::error::{DownloadError, Interruption};
use super::layout::non_empty;
use crate::common::client::HttpClient;
use crate::common::config::RetryPolicy;

const WATCH_INTERVAL: Duration = Duration::from_millis(500);

pub type ByteProgress = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// 一个区间块，闭区间 `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// 把 `size` 字节平均切成最多 `count` 块，余数放在最后一块
pub fn split_ranges(size: u64, count: usize) -> Vec<ChunkRange> {
    if size == 0 {
        return Vec::new();
    }
    let count = (count.max(1) as u64).min(size);
    let base = size / count;
    (0..count)
        .map(|i| {
            let start = i * base;
            let end = if i == count - 1 { size - 1 } else { start + base - 1 };
            ChunkRange {
                index: i as usize,
                start,
                end,
            }
        })
        .collect()
}

/// 整文件多线程分块下载，每块的进度写在 `<file>.chunk_<i>` 中以便续传
pub struct ChunkedFileDownloader {
    client: HttpClient,
    headers: BTreeMap<String, String>,
    controller: DownloadController,
    threads: usize,
    retry: RetryPolicy,
}

impl ChunkedFileDownloader {
    pub fn new(
        client: HttpClient,
        headers: BTreeMap<String, String>,
        controller: DownloadController,
        threads: usize,
    ) -> Self {
        Self {
            client,
            headers,
            controller,
            threads: threads.max(1),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn part_path(dest: &Path) -> PathBuf {
        sibling(dest, ".part")
    }

    pub fn chunk_state_path(dest: &Path, index: usize) -> PathBuf {
        sibling(dest, &format!(".chunk_{}", index))
    }

    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        on_progress: ByteProgress,
    ) -> Result<u64, DownloadError> {
        if non_empty(dest).await? {
            let len = tokio::fs::metadata(dest).await?.len();
            debug!("文件已完整下载，跳过: {:?}", dest);
            on_progress(len, len);
            return Ok(len);
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // 外层 future 被丢弃时 guard 会取消 token，正在下载的块随之暂停
        let token = CancellationToken::new();
        let _guard = token.clone().drop_guard();
        self.spawn_watcher(token.clone());

        let info = self
            .retrying("探测", &token, || self.client.probe(url, &self.headers))
            .await?;
        let written = match info.size {
            Some(size) if info.supports_ranges && size > 0 => {
                info!("分块下载 {:?}: {} 字节, {} 线程", dest, size, self.threads);
                self.download_ranges(url, dest, size, &token, on_progress)
                    .await?
            }
            _ => {
                info!("服务器不支持区间请求，整体下载 {:?}", dest);
                self.retrying("整体下载", &token, || {
                    self.download_single(url, dest, info.size, &token, Arc::clone(&on_progress))
                })
                .await?
            }
        };

        tokio::fs::rename(Self::part_path(dest), dest).await?;
        for index in 0..self.threads {
            let _ = tokio::fs::remove_file(Self::chunk_state_path(dest, index)).await;
        }
        Ok(written)
    }

    fn spawn_watcher(&self, token: CancellationToken) {
        let controller = self.controller.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(WATCH_INTERVAL) => {
                        if controller.is_interrupted() {
                            debug!("收到控制信号，暂停分块下载");
                            token.cancel();
                            break;
                        }
                    }
                }
            }
        });
    }

    /// 按重试策略执行 `op`，每次之前检查控制信号，打断和磁盘满不重试
    async fn retrying<T, F, Fut>(
        &self,
        what: &str,
        token: &CancellationToken,
        mut op: F,
    ) -> Result<T, DownloadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            if token.is_cancelled() || self.controller.is_interrupted() {
                return Err(self.interruption());
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_interruption() || e.is_out_of_space() || attempt >= attempts => {
                    return Err(e);
                }
                Err(e) => {
                    warn!("{} 第 {} 次失败: {}", what, attempt, e);
                    tokio::select! {
                        _ = token.cancelled() => return Err(self.interruption()),
                        _ = tokio::time::sleep(self.retry.delay_for(attempt)) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn interruption(&self) -> DownloadError {
        DownloadError::Interrupted(self.controller.signal().unwrap_or(Interruption::Pause))
    }

    async fn download_single(
        &self,
        url: &str,
        dest: &Path,
        size: Option<u64>,
        token: &CancellationToken,
        on_progress: ByteProgress,
    ) -> Result<u64, DownloadError> {
        let resp = self.client.get(url, &self.headers).await?;
        HttpClient::check_response_status(&resp, url)?;
        let total = size.or(resp.content_length()).unwrap_or(0);

        // 每次尝试都从头写
        let mut file = tokio::fs::File::create(Self::part_path(dest)).await?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.interruption()),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            on_progress(written, total.max(written));
        }
        file.flush().await?;
        Ok(written)
    }

    async fn download_ranges(
        &self,
        url: &str,
        dest: &Path,
        size: u64,
        token: &CancellationToken,
        on_progress: ByteProgress,
    ) -> Result<u64, DownloadError> {
        let part = Self::part_path(dest);
        let part_existed = tokio::fs::try_exists(&part).await?;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&part)
            .await?;
        if file.metadata().await?.len() != size {
            file.set_len(size).await?;
        }
        drop(file);

        let ranges = split_ranges(size, self.threads);
        let downloaded = Arc::new(AtomicU64::new(0));
        let mut resumed = Vec::with_capacity(ranges.len());
        for range in &ranges {
            let state = Self::chunk_state_path(dest, range.index);
            // 临时文件没了，块进度也就作废
            let done = if part_existed {
                read_chunk_state(&state, range).await
            } else {
                0
            };
            downloaded.fetch_add(done, Ordering::SeqCst);
            resumed.push(done);
        }
        let already = downloaded.load(Ordering::SeqCst);
        if already > 0 {
            info!("续传 {:?}: 已有 {}/{} 字节", dest, already, size);
            on_progress(already, size);
        }

        let mut set = JoinSet::new();
        for (range, done) in ranges.into_iter().zip(resumed) {
            if done >= range.len() {
                continue;
            }
            let job = ChunkJob {
                client: self.client.clone(),
                headers: self.headers.clone(),
                url: url.to_string(),
                part: part.clone(),
                state: Self::chunk_state_path(dest, range.index),
                range,
                done,
                total: size,
                downloaded: Arc::clone(&downloaded),
                on_progress: Arc::clone(&on_progress),
                token: token.clone(),
                retry: self.retry.clone(),
            };
            set.spawn(job.run());
        }

        let mut first_error: Option<ChunkError> = None;
        while let Some(joined) = set.join_next().await {
            let result = joined
                .map_err(|e| DownloadError::InvalidState(format!("分块任务异常: {}", e)))?;
            if let Err(e) = result {
                token.cancel();
                // 真正的失败优先于随之而来的取消
                if first_error
                    .as_ref()
                    .is_none_or(|prev| prev.is_interruption() && !e.is_interruption())
                {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(ChunkError::Cancelled) => Err(self.interruption()),
            Some(ChunkError::Failed(e)) => Err(e),
            None => Ok(downloaded.load(Ordering::SeqCst)),
        }
    }
}

fn sibling(dest: &Path, suffix: &str) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    dest.with_file_name(name)
}

// 状态文件内容: `<start> <end> <done>`，区间对不上就从头下载这一块
async fn read_chunk_state(path: &Path, range: &ChunkRange) -> u64 {
    let Ok(text) = tokio::fs::read_to_string(path).await else {
        return 0;
    };
    let fields: Vec<u64> = text
        .split_whitespace()
        .filter_map(|f| f.parse().ok())
        .collect();
    match fields.as_slice() {
        [start, end, done] if *start == range.start && *end == range.end => {
            (*done).min(range.len())
        }
        _ => 0,
    }
}

enum ChunkError {
    Cancelled,
    Failed(DownloadError),
}

impl ChunkError {
    fn is_interruption(&self) -> bool {
        matches!(self, ChunkError::Cancelled)
    }
}

struct ChunkJob {
    client: HttpClient,
    headers: BTreeMap<String, String>,
    url: String,
    part: PathBuf,
    state: PathBuf,
    range: ChunkRange,
    done: u64,
    total: u64,
    downloaded: Arc<AtomicU64>,
    on_progress: ByteProgress,
    token: CancellationToken,
    retry: RetryPolicy,
}

impl ChunkJob {
    async fn run(mut self) -> Result<(), ChunkError> {
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            if self.token.is_cancelled() {
                return Err(ChunkError::Cancelled);
            }
            match self.copy_range().await {
                Ok(()) => return Ok(()),
                Err(ChunkError::Cancelled) => return Err(ChunkError::Cancelled),
                Err(ChunkError::Failed(e)) => {
                    if e.is_out_of_space() || attempt == attempts {
                        return Err(ChunkError::Failed(e));
                    }
                    warn!("分块 {} 第 {} 次失败: {}", self.range.index, attempt, e);
                    tokio::select! {
                        _ = self.token.cancelled() => return Err(ChunkError::Cancelled),
                        _ = tokio::time::sleep(self.retry.delay_for(attempt)) => {}
                    }
                }
            }
        }
        Ok(())
    }

    async fn copy_range(&mut self) -> Result<(), ChunkError> {
        let start = self.range.start + self.done;
        let resp = self
            .client
            .get_range(&self.url, &self.headers, start, Some(self.range.end))
            .await
            .map_err(|e| ChunkError::Failed(e.into()))?;
        if resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(ChunkError::Failed(DownloadError::Status {
                status: resp.status().as_u16(),
                url: self.url.clone(),
            }));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.part)
            .await
            .map_err(failed)?;
        file.seek(SeekFrom::Start(start)).await.map_err(failed)?;

        let mut stream = resp.bytes_stream();
        let remaining = self.range.len();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    file.flush().await.map_err(failed)?;
                    return Err(ChunkError::Cancelled);
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| ChunkError::Failed(e.into()))?;
            // 服务器多给的字节不写
            let take = (remaining - self.done).min(chunk.len() as u64) as usize;
            file.write_all(&chunk[..take]).await.map_err(failed)?;
            file.flush().await.map_err(failed)?;
            self.done += take as u64;
            let state = format!("{} {} {}", self.range.start, self.range.end, self.done);
            tokio::fs::write(&self.state, state)
                .await
                .map_err(failed)?;

            let current = self.downloaded.fetch_add(take as u64, Ordering::SeqCst) + take as u64;
            (self.on_progress)(current, self.total);
            if self.done >= remaining {
                break;
            }
        }

        if self.done < remaining {
            return Err(ChunkError::Failed(DownloadError::InvalidState(format!(
                "分块 {} 提前结束: {}/{}",
                self.range.index, self.done, remaining
            ))));
        }
        Ok(())
    }
}

fn failed(e: std::io::Error) -> ChunkError {
    ChunkError::Failed(e.into())
}
