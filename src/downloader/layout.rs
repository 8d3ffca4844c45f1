use std::path::{Path, PathBuf};

use tracing::debug;

use crate::manifest::MediaKind;

const FRAGMENTED_EXT: &str = "m4s";
const PLAIN_EXT: &str = "ts";

/// 任务工作目录。文件名是断点续传的依据，跨版本必须保持一致
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn segment_ext(fragmented: bool) -> &'static str {
        if fragmented { FRAGMENTED_EXT } else { PLAIN_EXT }
    }

    fn segment_prefix(kind: MediaKind) -> &'static str {
        match kind {
            MediaKind::Video => "segment_",
            MediaKind::Audio => "audio_segment_",
        }
    }

    /// `segment_00003.ts` / `audio_segment_00003.m4s`
    pub fn segment_name(kind: MediaKind, index: usize, fragmented: bool) -> String {
        format!(
            "{}{:05}.{}",
            Self::segment_prefix(kind),
            index,
            Self::segment_ext(fragmented)
        )
    }

    pub fn segment_path(&self, kind: MediaKind, index: usize, fragmented: bool) -> PathBuf {
        self.root.join(Self::segment_name(kind, index, fragmented))
    }

    pub fn init_path(&self, kind: MediaKind) -> PathBuf {
        self.root.join(format!("init_{}.{}", kind, FRAGMENTED_EXT))
    }

    pub fn concat_list_path(&self, kind: MediaKind) -> PathBuf {
        self.root.join(format!("{}.txt", kind))
    }

    pub fn playlist_path(&self, kind: MediaKind) -> PathBuf {
        self.root.join(format!("{}.m3u8", kind))
    }

    pub fn key_file_name(kind: MediaKind) -> String {
        format!("{}encryption.key", Self::segment_prefix(kind))
    }

    pub fn key_path(&self, kind: MediaKind) -> PathBuf {
        self.root.join(Self::key_file_name(kind))
    }

    pub fn concatenated_path(&self, kind: MediaKind) -> PathBuf {
        self.root.join(format!("concatenated_{}.mp4", kind))
    }

    /// BaseURL 整文件下载的中间文件
    pub fn stream_path(&self, kind: MediaKind) -> PathBuf {
        self.root.join(format!("{}_stream.mp4", kind))
    }

    /// 直播已录制分片的记录，每行一个 JSON
    pub fn capture_log_path(&self) -> PathBuf {
        self.root.join("captured_segments.jsonl")
    }

    pub fn merged_output(&self, container: &str) -> PathBuf {
        self.root.join(format!("merged_output.{}", container))
    }

    pub async fn ensure(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    /// 从 0 开始连续存在的分片数，以及它们是否为分片 MP4
    pub async fn scan_contiguous(&self, kind: MediaKind) -> std::io::Result<(usize, bool)> {
        let fragmented = if non_empty(&self.segment_path(kind, 0, true)).await? {
            true
        } else if non_empty(&self.segment_path(kind, 0, false)).await? {
            false
        } else {
            return Ok((0, false));
        };

        let mut count = 0;
        while non_empty(&self.segment_path(kind, count, fragmented)).await? {
            count += 1;
        }
        debug!("磁盘上连续的 {} 分片: {} 个", kind, count);
        Ok((count, fragmented))
    }

    /// 删除整个工作目录
    pub async fn remove(&self) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// 清空工作目录，只留下 `keep`
    pub async fn clear_except(&self, keep: &Path) -> std::io::Result<()> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path == keep {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}

/// 存在且长度非零
pub async fn non_empty(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.is_file() && meta.len() > 0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
