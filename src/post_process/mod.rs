pub mod merger;

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::downloader::error::DownloadError;

/// 目标已存在时依次尝试 `{stem}_1.{ext}`、`{stem}_2.{ext}`……
pub async fn unique_target(target: &Path) -> Result<PathBuf, DownloadError> {
    if !fs::try_exists(target).await? {
        return Ok(target.to_path_buf());
    }
    let stem = target.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let ext = target.extension().and_then(|s| s.to_str()).unwrap_or("");
    let mut counter = 1;
    loop {
        let new_name = if ext.is_empty() {
            format!("{}_{}", stem, counter)
        } else {
            format!("{}_{}.{}", stem, counter, ext)
        };
        let candidate = target.with_file_name(new_name);
        if !fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
        counter += 1;
    }
}

/// 把合并结果移动到输出目录，文件名冲突时自动加序号
pub async fn move_file_to_output(
    source: &Path,
    output_dir: &Path,
    name: &str,
) -> Result<PathBuf, DownloadError> {
    if !fs::try_exists(source).await? {
        return Err(DownloadError::InvalidState(format!(
            "源文件不存在: {:?}",
            source
        )));
    }
    fs::create_dir_all(output_dir).await?;

    let extension = source
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("mp4");
    let target = unique_target(&output_dir.join(name).with_extension(extension)).await?;

    debug!("移动文件: {:?} -> {:?}", source, target);
    if fs::rename(source, &target).await.is_err() {
        // 跨文件系统时 rename 会失败，改为复制后删除
        fs::copy(source, &target).await?;
        fs::remove_file(source).await?;
    }
    debug!("✅ 文件移动成功: {:?}", target);
    Ok(target)
}
