//! In-memory store.

use async_trait::async_trait;
use bytes::Bytes;
use mc_common::StoreError;
use parking_lot::RwLock;

use crate::{check_range, ByteStore};

/// Growable in-memory buffer.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `bytes`.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            data: RwLock::new(bytes.into()),
        }
    }
}

#[async_trait]
impl ByteStore for MemoryStore {
    async fn append(&self, chunk: &[u8]) -> Result<(), StoreError> {
        self.data.write().extend_from_slice(chunk);
        Ok(())
    }

    async fn read(&self, offset: u64, size: u32) -> Result<Bytes, StoreError> {
        let data = self.data.read();
        check_range(offset, size, data.len() as u64)?;
        let start = offset as usize;
        Ok(Bytes::copy_from_slice(&data[start..start + size as usize]))
    }

    fn len(&self) -> u64 {
        self.data.read().len() as u64
    }
}
