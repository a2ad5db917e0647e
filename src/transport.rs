//! Collaborator contracts for moving bytes: range fetching from candidates, tree
//! metadata fetching, and the local sink downloaded data is written to.

use crate::candidate::Candidate;
use crate::error::{TransferError, TreeFetchError};
use crate::hash_queue::TreeSource;
use crate::thex::TigerHash;
use async_trait::async_trait;
use futures::Stream;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// Chunks of a range response, in order
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransferError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub offset: u64,
    pub length: u64,
    pub timeout: Duration,
}

/// Requests a byte range of the target from a candidate
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    async fn fetch_range(
        &self,
        candidate: &Candidate,
        request: RangeRequest,
    ) -> Result<ByteStream, TransferError>;
}

/// Requests hash tree nodes (in `encode_nodes` form) from a candidate
#[async_trait]
pub trait TreeFetcher: Send + Sync {
    async fn fetch_tree_metadata(
        &self,
        candidate: &Candidate,
        root: &TigerHash,
    ) -> Result<Vec<u8>, TreeFetchError>;
}

/// Destination of verified data
#[async_trait]
pub trait DataSink: Send + Sync {
    async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    async fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Where the whole written file can be re-read for final verification.
    fn tree_source(&self) -> TreeSource;
}

/// Sink backed by a preallocated buffer
#[derive(Debug)]
pub struct MemorySink {
    data: Mutex<Vec<u8>>,
}

impl MemorySink {
    pub fn new(size: u64) -> Self {
        Self {
            data: Mutex::new(vec![0u8; size as usize]),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DataSink for MemorySink {
    async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut buf = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let start = offset as usize;
        let end = start + data.len();
        if end > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write {}..{} past end {}", start, end, buf.len()),
            ));
        }
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn tree_source(&self) -> TreeSource {
        TreeSource::Bytes(Arc::new(self.contents()))
    }
}

/// Sink writing into a preallocated file
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl FileSink {
    /// Create (or truncate) `path` and size it to `size` bytes.
    pub async fn create(path: impl AsRef<Path>, size: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.set_len(size).await?;
        debug!(path = %path.display(), size, "Created download file");
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DataSink for FileSink {
    async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().await;
        file.seek(io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await
    }

    async fn flush(&self) -> io::Result<()> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_all().await
    }

    fn tree_source(&self) -> TreeSource {
        TreeSource::File(self.path.clone())
    }
}
