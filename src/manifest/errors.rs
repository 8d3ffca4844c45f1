use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("清单获取失败: {0}")]
    Fetch(String),
    #[error("清单解码失败: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("网络请求失败: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("未提供格式 id")]
    MissingFormatId,
    #[error("清单中找不到所选格式: {0}")]
    FormatNotFound(String),
    #[error("所选格式既没有分片也没有 BaseURL")]
    NoMedia,
    #[error("不支持的清单: {0}")]
    Unsupported(String),
}
