use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::errors::ManifestError;
use super::models::ParsedManifest;
use crate::common::client::HttpClient;

/// 清单来源。引擎不解析 HLS/DASH 文本，只消费外部给出的结构化清单
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// 每次调用都重新获取，直播轮询依赖这一点
    async fn fetch(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<ParsedManifest, ManifestError>;
}

/// 读取预解析好的 JSON 清单，位置可以是本地文件或 http(s) 地址
pub struct JsonManifestSource {
    client: HttpClient,
    // 覆盖任务 url 的清单位置
    location: Option<String>,
}

impl JsonManifestSource {
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            location: None,
        }
    }

    pub fn with_location(client: HttpClient, location: impl Into<String>) -> Self {
        Self {
            client,
            location: Some(location.into()),
        }
    }

}

enum Location {
    Remote(Url),
    Local(PathBuf),
}

impl Location {
    fn resolve(location: &str) -> Result<Self, ManifestError> {
        match Url::parse(location) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(Location::Remote(url)),
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(Location::Local)
                .map_err(|_| ManifestError::Unsupported(format!("无效的文件地址: {}", location))),
            // 普通路径（包括 Windows 盘符）
            _ => Ok(Location::Local(PathBuf::from(location))),
        }
    }
}

#[async_trait]
impl ManifestSource for JsonManifestSource {
    async fn fetch(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<ParsedManifest, ManifestError> {
        let location = self.location.as_deref().unwrap_or(url);
        debug!("读取清单: {}", location);

        let body = match Location::resolve(location)? {
            Location::Remote(url) => {
                let resp = self
                    .client
                    .get(url.as_str(), headers)
                    .await
                    .map_err(|e| ManifestError::Fetch(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(ManifestError::Fetch(format!(
                        "HTTP 状态码 {}: {}",
                        resp.status(),
                        location
                    )));
                }
                resp.bytes().await?.to_vec()
            }
            Location::Local(path) => tokio::fs::read(path).await?,
        };

        let manifest: ParsedManifest = serde_json::from_slice(&body)?;
        debug!(
            "清单包含 {} 个视频档位, {} 个音频档位",
            manifest.video.len(),
            manifest.audio.len()
        );
        Ok(manifest)
    }
}
