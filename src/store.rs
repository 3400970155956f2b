//! In-memory [`BlockStore`] used by the example binary and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::identity::Key;
use crate::messages::MAX_BLOCK_SIZE;
use crate::protocols::{BlockStore, StoreError};

#[derive(Default)]
struct Entry {
    value: Vec<u8>,
    locks: u32,
}

/// Hash-verifying block cache with a byte capacity.
///
/// When full, unlocked blocks are dropped in key order until the new block fits.
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Key, Entry>>,
    capacity: usize,
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new(256 * 1024 * 1024)
    }
}

impl MemoryBlockStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Store locally produced content, returning its key.
    pub async fn insert(&self, value: Vec<u8>) -> Result<Key, StoreError> {
        let key = Key::from_content(&value);
        self.set(&key, value).await?;
        Ok(key)
    }

    pub async fn len(&self) -> usize {
        self.blocks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blocks.read().await.is_empty()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn contains(&self, key: &Key) -> bool {
        self.blocks.read().await.contains_key(key)
    }

    async fn get(&self, key: &Key) -> Result<Vec<u8>, StoreError> {
        self.blocks
            .read()
            .await
            .get(key)
            .map(|e| e.value.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn set(&self, key: &Key, value: Vec<u8>) -> Result<(), StoreError> {
        if value.len() > MAX_BLOCK_SIZE || value.len() > self.capacity {
            return Err(StoreError::Rejected("block too large".into()));
        }
        if !key.matches(&value) {
            return Err(StoreError::HashMismatch);
        }

        let mut blocks = self.blocks.write().await;
        if blocks.contains_key(key) {
            return Ok(());
        }
        let mut used: usize = blocks.values().map(|e| e.value.len()).sum();
        if used + value.len() > self.capacity {
            let mut victims: Vec<Key> = blocks
                .iter()
                .filter(|(_, e)| e.locks == 0)
                .map(|(k, _)| k.clone())
                .collect();
            victims.sort();
            for victim in victims {
                if used + value.len() <= self.capacity {
                    break;
                }
                if let Some(entry) = blocks.remove(&victim) {
                    used -= entry.value.len();
                    trace!(key = ?victim, "evicted block");
                }
            }
            if used + value.len() > self.capacity {
                return Err(StoreError::Rejected("store full".into()));
            }
        }
        blocks.insert(key.clone(), Entry { value, locks: 0 });
        Ok(())
    }

    async fn length(&self, key: &Key) -> u64 {
        self.blocks
            .read()
            .await
            .get(key)
            .map_or(0, |e| e.value.len() as u64)
    }

    async fn keys(&self) -> Vec<Key> {
        self.blocks.read().await.keys().cloned().collect()
    }

    async fn lock(&self, key: &Key) {
        if let Some(entry) = self.blocks.write().await.get_mut(key) {
            entry.locks = entry.locks.saturating_add(1);
        }
    }

    async fn unlock(&self, key: &Key) {
        if let Some(entry) = self.blocks.write().await.get_mut(key) {
            entry.locks = entry.locks.saturating_sub(1);
        }
    }

    async fn check_seeds(&self) {
        let mut blocks = self.blocks.write().await;
        let before = blocks.len();
        blocks.retain(|key, entry| key.matches(&entry.value));
        if blocks.len() != before {
            tracing::warn!(dropped = before - blocks.len(), "dropped corrupt blocks");
        }
    }
}
