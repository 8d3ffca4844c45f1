use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::AsyncWrite;

pub type SegmentWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 分片落盘抽象。文件是否存在且非空就是续传的检查点
#[async_trait]
pub trait SegmentStore: Send + Sync {
    /// 已完成分片的长度，不存在时为 0
    async fn len(&self, path: &Path) -> io::Result<u64>;

    /// 打开临时写入位置，最终文件名在 `commit` 之前不会出现
    async fn open_writer(&self, path: &Path) -> io::Result<SegmentWriter>;

    async fn commit(&self, path: &Path) -> io::Result<()>;

    /// 丢弃未完成的写入
    async fn discard(&self, path: &Path) -> io::Result<()>;
}

/// 写 `<name>.part`，成功后改名
#[derive(Debug, Clone, Default)]
pub struct FsSegmentStore;

impl FsSegmentStore {
    pub fn part_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".part");
        path.with_file_name(name)
    }
}

#[async_trait]
impl SegmentStore for FsSegmentStore {
    async fn len(&self, path: &Path) -> io::Result<u64> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn open_writer(&self, path: &Path) -> io::Result<SegmentWriter> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(Self::part_path(path)).await?;
        Ok(Box::new(file))
    }

    async fn commit(&self, path: &Path) -> io::Result<()> {
        tokio::fs::rename(Self::part_path(path), path).await
    }

    async fn discard(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::remove_file(Self::part_path(path)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

type Buffers = Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>;

/// 内存实现，测试用
#[derive(Debug, Clone, Default)]
pub struct MemorySegmentStore {
    committed: Buffers,
    pending: Buffers,
}

impl MemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<Vec<u8>> {
        self.committed.lock().ok()?.get(path).cloned()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, data: Vec<u8>) {
        if let Ok(mut committed) = self.committed.lock() {
            committed.insert(path.into(), data);
        }
    }

    pub fn has_pending(&self, path: &Path) -> bool {
        self.pending
            .lock()
            .map(|pending| pending.contains_key(path))
            .unwrap_or(false)
    }
}

fn poisoned() -> io::Error {
    io::Error::other("内存存储锁已损坏")
}

struct MemoryWriter {
    path: PathBuf,
    pending: Buffers,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut pending = self.pending.lock().map_err(|_| poisoned())?;
        pending
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl SegmentStore for MemorySegmentStore {
    async fn len(&self, path: &Path) -> io::Result<u64> {
        let committed = self.committed.lock().map_err(|_| poisoned())?;
        Ok(committed.get(path).map(|b| b.len() as u64).unwrap_or(0))
    }

    async fn open_writer(&self, path: &Path) -> io::Result<SegmentWriter> {
        self.pending
            .lock()
            .map_err(|_| poisoned())?
            .insert(path.to_path_buf(), Vec::new());
        Ok(Box::new(MemoryWriter {
            path: path.to_path_buf(),
            pending: Arc::clone(&self.pending),
        }))
    }

    async fn commit(&self, path: &Path) -> io::Result<()> {
        let data = self
            .pending
            .lock()
            .map_err(|_| poisoned())?
            .remove(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "没有待提交的写入"))?;
        self.committed
            .lock()
            .map_err(|_| poisoned())?
            .insert(path.to_path_buf(), data);
        Ok(())
    }

    async fn discard(&self, path: &Path) -> io::Result<()> {
        self.pending.lock().map_err(|_| poisoned())?.remove(path);
        Ok(())
    }
}
