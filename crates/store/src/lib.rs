//! `mc-store` — Append-only byte storage for ingested media.
//!
//! A [`ByteStore`] is filled once during ingestion and afterwards only read.
//! Sample tables reference it by `{offset, size}`, so clips produced by split
//! or clone share one store behind an `Arc`.
//!
//! Two backends:
//! - [`MemoryStore`]: a growable in-memory buffer.
//! - [`FileStore`]: a file on disk, optionally an anonymous temporary file
//!   for intermediate remux output.

mod file;
mod memory;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use mc_common::StoreError;
use tracing::debug;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Shared, read-mostly byte store handle.
pub type SharedStore = Arc<dyn ByteStore>;

/// Append-only buffer with random-access reads.
#[async_trait]
pub trait ByteStore: Send + Sync {
    /// Append bytes at the end of the store.
    async fn append(&self, chunk: &[u8]) -> Result<(), StoreError>;

    /// Read exactly `size` bytes starting at `offset`.
    async fn read(&self, offset: u64, size: u32) -> Result<Bytes, StoreError>;

    /// Number of bytes appended so far.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reject reads that reach past the end of the store.
pub(crate) fn check_range(offset: u64, size: u32, len: u64) -> Result<(), StoreError> {
    match offset.checked_add(size as u64) {
        Some(end) if end <= len => Ok(()),
        _ => Err(StoreError::OutOfRange { offset, size, len }),
    }
}

/// Drain `stream` into `store`, returning the number of bytes written.
pub async fn write_stream<S>(store: &dyn ByteStore, stream: S) -> Result<u64, StoreError>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    futures::pin_mut!(stream);
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        store.append(&chunk).await?;
        written += chunk.len() as u64;
    }
    debug!(written, "Stream written to store");
    Ok(written)
}
