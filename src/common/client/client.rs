use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{
    Client, ClientBuilder, Response, StatusCode,
    header::{
        ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CONTENT_LENGTH, CONTENT_RANGE, HeaderMap,
        HeaderName, HeaderValue, RANGE, USER_AGENT,
    },
};
use tracing::{debug, warn};

use crate::common::config::EngineConfig;
use crate::downloader::error::DownloadError;

/// 远端文件信息，由 `bytes=0-0` 探测得到
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteFileInfo {
    pub size: Option<u64>,
    pub supports_ranges: bool,
}

// 分片下载用的 HTTP 客户端
#[derive(Debug, Clone)]
pub struct HttpClient {
    pub inner: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(&EngineConfig::default()).unwrap_or_else(|e| {
            warn!("使用自定义配置创建客户端失败，改用默认客户端: {}", e);
            Self {
                inner: Client::new(),
            }
        })
    }
}

impl HttpClient {
    pub fn new(config: &EngineConfig) -> Result<Self, DownloadError> {
        let inner = ClientBuilder::new()
            .connect_timeout(config.connect_timeout())
            .default_headers(Self::get_default_headers())
            .build()?;
        Ok(Self { inner })
    }

    pub fn get_default_headers() -> HeaderMap {
        // 创建默认请求头
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9"));
        // 分片按原始字节落盘，不要压缩
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        headers.insert(USER_AGENT, HeaderValue::from_static("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36"));
        headers
    }

    /// 任务自带的请求头，非法的名字或值跳过
    pub fn task_headers(headers: &BTreeMap<String, String>) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let parsed = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            );
            match parsed {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => warn!("⚠️ 跳过非法请求头: {}", name),
            }
        }
        map
    }

    pub async fn get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Response, reqwest::Error> {
        debug!("GET {}", url);
        self.inner
            .get(url)
            .headers(Self::task_headers(headers))
            .send()
            .await
    }

    /// 单个分片请求，带整体超时
    pub async fn get_with_timeout(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Response, reqwest::Error> {
        debug!("GET {} (超时 {:?})", url, timeout);
        self.inner
            .get(url)
            .headers(Self::task_headers(headers))
            .timeout(timeout)
            .send()
            .await
    }

    /// 区间请求，`end` 为闭区间，缺省表示到文件末尾
    pub async fn get_range(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        start: u64,
        end: Option<u64>,
    ) -> Result<Response, reqwest::Error> {
        let range = match end {
            Some(end) => format!("bytes={}-{}", start, end),
            None => format!("bytes={}-", start),
        };
        debug!("GET {} Range: {}", url, range);
        self.inner
            .get(url)
            .headers(Self::task_headers(headers))
            .header(RANGE, range)
            .send()
            .await
    }

    /// 用 `bytes=0-0` 探测文件大小和区间支持，206 视为支持
    pub async fn probe(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<RemoteFileInfo, DownloadError> {
        let resp = self.get_range(url, headers, 0, Some(0)).await?;
        Self::check_response_status(&resp, url)?;

        let info = if resp.status() == StatusCode::PARTIAL_CONTENT {
            // Content-Range: bytes 0-0/12345
            let size = resp
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.rsplit('/').next())
                .and_then(|v| v.trim().parse::<u64>().ok());
            RemoteFileInfo {
                size,
                supports_ranges: size.is_some(),
            }
        } else {
            let size = resp
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            RemoteFileInfo {
                size,
                supports_ranges: false,
            }
        };

        debug!("探测结果 {}: {:?}", url, info);
        Ok(info)
    }

    // 检查响应状态
    pub fn check_response_status(response: &Response, url: &str) -> Result<(), DownloadError> {
        let status = response.status();
        match status {
            status if status.is_success() => Ok(()),
            StatusCode::FORBIDDEN => {
                warn!("🚫 403 Forbidden，可能缺少请求头或链接已过期: {}", url);
                Err(DownloadError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                })
            }
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("⚠️ 429 Too Many Requests，请求过于频繁: {}", url);
                Err(DownloadError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                })
            }
            _ => {
                debug!("❌ 非成功状态码: {}", status);
                Err(DownloadError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                })
            }
        }
    }
}
