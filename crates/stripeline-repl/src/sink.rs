//! Destinations for replica bytes.
//!
//! Every division writes at its own absolute offsets, possibly at the same
//! time as the others, so sinks take `&self`. A sink either has true
//! positioned writes or serializes seek-then-write behind a lock.

use async_trait::async_trait;
use std::io::{self, SeekFrom};
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Where received file content goes.
#[async_trait]
pub trait ReplicaSink: Send + Sync {
    /// Writes all of `data` at absolute `offset`.
    async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Forces written data to stable storage.
    async fn sync_data(&self) -> io::Result<()>;
}

/// File written with positioned writes; divisions never contend.
#[derive(Debug, Clone)]
pub struct PositionedFile {
    file: Arc<std::fs::File>,
}

impl PositionedFile {
    /// Wraps an open, writable file.
    pub fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(file),
        }
    }
}

#[cfg(unix)]
#[async_trait]
impl ReplicaSink for PositionedFile {
    async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        let file = self.file.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || file.write_all_at(&data, offset))
            .await
            .map_err(io::Error::other)?
    }

    async fn sync_data(&self) -> io::Result<()> {
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || file.sync_data())
            .await
            .map_err(io::Error::other)?
    }
}

/// File written by seek-then-write inside one critical section shared by
/// all divisions.
#[derive(Debug)]
pub struct SeekLockedFile {
    file: Mutex<tokio::fs::File>,
}

impl SeekLockedFile {
    /// Wraps an open, writable file.
    pub fn new(file: tokio::fs::File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }
}

#[async_trait]
impl ReplicaSink for SeekLockedFile {
    async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await
    }

    async fn sync_data(&self) -> io::Result<()> {
        let file = self.file.lock().await;
        file.sync_data().await
    }
}

/// Swallows everything. Used to keep the stream framed when there is no
/// usable replica to write to.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

#[async_trait]
impl ReplicaSink for DiscardSink {
    async fn write_at(&self, _offset: u64, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }

    async fn sync_data(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Best sink for `file` on this platform.
pub fn file_sink(file: std::fs::File) -> Box<dyn ReplicaSink> {
    #[cfg(unix)]
    {
        Box::new(PositionedFile::new(file))
    }
    #[cfg(not(unix))]
    {
        Box::new(SeekLockedFile::new(tokio::fs::File::from_std(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn scatter(sink: &dyn ReplicaSink) {
        let chunks: [(u64, &[u8]); 3] = [(6, b"world"), (0, b"hello "), (11, b"!")];
        let writes = chunks.iter().map(|(offset, data)| sink.write_at(*offset, data));
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }
        sink.sync_data().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_positioned_writes_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica");
        let file = std::fs::File::create(&path).unwrap();
        scatter(&PositionedFile::new(file)).await;
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world!");
    }

    #[tokio::test]
    async fn test_seek_locked_writes_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica");
        let file = tokio::fs::File::create(&path).await.unwrap();
        scatter(&SeekLockedFile::new(file)).await;
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world!");
    }

    #[tokio::test]
    async fn test_discard_accepts_anything() {
        scatter(&DiscardSink).await;
    }
}
