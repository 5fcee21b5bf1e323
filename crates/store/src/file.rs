//! File-backed store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use mc_common::StoreError;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{check_range, ByteStore};

/// Store backed by a single file. Appends go to the end; reads seek.
#[derive(Debug)]
pub struct FileStore {
    path: Option<PathBuf>,
    file: Mutex<File>,
    len: AtomicU64,
}

impl FileStore {
    /// Create (or truncate) a file at `path`.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        debug!(path = %path.display(), "Created file store");
        Ok(Self {
            path: Some(path),
            file: Mutex::new(file),
            len: AtomicU64::new(0),
        })
    }

    /// Open an existing file for reading and further appends.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path).await?;
        let len = file.metadata().await?.len();
        debug!(path = %path.display(), len, "Opened file store");
        Ok(Self {
            path: Some(path),
            file: Mutex::new(file),
            len: AtomicU64::new(len),
        })
    }

    /// Anonymous temporary file, removed by the OS once dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        let file = tempfile::tempfile()?;
        Ok(Self {
            path: None,
            file: Mutex::new(File::from_std(file)),
            len: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[async_trait]
impl ByteStore for FileStore {
    async fn append(&self, chunk: &[u8]) -> Result<(), StoreError> {
        let mut file = self.file.lock().await;
        let end = self.len.load(Ordering::Acquire);
        file.seek(std::io::SeekFrom::Start(end)).await?;
        file.write_all(chunk).await?;
        file.flush().await?;
        self.len.store(end + chunk.len() as u64, Ordering::Release);
        Ok(())
    }

    async fn read(&self, offset: u64, size: u32) -> Result<Bytes, StoreError> {
        check_range(offset, size, self.len())?;
        let mut buf = vec![0u8; size as usize];
        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }
}
