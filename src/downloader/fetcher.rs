use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::control::DownloadController;
use super::error::DownloadError;
use super::store::SegmentStore;
use crate::common::client::HttpClient;
use crate::common::config::RetryPolicy;

pub type BytesCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// 单个分片下载器：跳过已存在的分片，失败按线性退避重试，每次尝试前检查控制标记
#[derive(Clone)]
pub struct SegmentFetcher {
    client: HttpClient,
    store: Arc<dyn SegmentStore>,
    controller: DownloadController,
    headers: BTreeMap<String, String>,
    retry: RetryPolicy,
    timeout: Duration,
    on_bytes: Option<BytesCallback>,
}

impl SegmentFetcher {
    pub fn new(
        client: HttpClient,
        store: Arc<dyn SegmentStore>,
        controller: DownloadController,
        headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            client,
            store,
            controller,
            headers,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            on_bytes: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_progress(mut self, on_bytes: BytesCallback) -> Self {
        self.on_bytes = Some(on_bytes);
        self
    }

    /// 下载 `url` 到 `dest`，返回写入的字节数
    pub async fn fetch(&self, url: &str, dest: &Path, label: &str) -> Result<u64, DownloadError> {
        let existing = self.store.len(dest).await?;
        if existing > 0 {
            debug!("{}: 分片已存在，跳过 ({} 字节)", label, existing);
            return Ok(existing);
        }

        let attempts = self.retry.attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            self.controller.check()?;

            debug!("{}: 下载 {} (第 {}/{} 次)", label, url, attempt, attempts);
            match self.try_fetch(url, dest).await {
                Ok(bytes) => {
                    debug!("{}: 下载完成 {} 字节", label, bytes);
                    if let Some(on_bytes) = &self.on_bytes {
                        on_bytes(bytes);
                    }
                    return Ok(bytes);
                }
                Err(e) => {
                    self.store.discard(dest).await?;
                    if e.is_out_of_space() {
                        return Err(e);
                    }
                    warn!("{}: 第 {} 次下载失败: {}", label, attempt, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        let delay = self.retry.delay_for(attempt);
                        if let Some(reason) = self.controller.interruptible_sleep(delay).await {
                            return Err(DownloadError::Interrupted(reason));
                        }
                    }
                }
            }
        }

        Err(DownloadError::RetriesExhausted {
            url: url.to_string(),
            attempts,
            source: Box::new(
                last_error.unwrap_or_else(|| DownloadError::InvalidState("没有进行任何尝试".into())),
            ),
        })
    }

    async fn try_fetch(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        let resp = self
            .client
            .get_with_timeout(url, &self.headers, self.timeout)
            .await?;
        HttpClient::check_response_status(&resp, url)?;

        let mut writer = self.store.open_writer(dest).await?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        writer.shutdown().await?;
        drop(writer);

        self.store.commit(dest).await?;
        Ok(written)
    }
}
