//! Collaborator trait definitions.
//!
//! The engine never touches disks or sockets directly. It talks to two
//! collaborators through the traits below so that the physical store and the
//! transport stack can be swapped (or replaced with in-memory versions in
//! tests) without touching scheduling logic.
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Block store | [`BlockStore`] | Content-addressed block cache |
//! | Transport | [`Transport`] | Establish and accept raw peer streams |

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::identity::Key;

/// A bidirectional byte stream to one peer.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Block store failures the engine distinguishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The key is not in the cache.
    NotFound,
    /// The value does not hash to the key.
    HashMismatch,
    /// The store refused the write (full, locked, I/O).
    Rejected(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "block not found"),
            StoreError::HashMismatch => write!(f, "block does not match its key"),
            StoreError::Rejected(reason) => write!(f, "block rejected: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {}

/// Content-addressed block cache.
#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    async fn contains(&self, key: &Key) -> bool;

    /// Fails with [`StoreError::NotFound`] if absent.
    async fn get(&self, key: &Key) -> Result<Vec<u8>, StoreError>;

    /// Stores a block pulled from a peer. The store verifies the hash.
    async fn set(&self, key: &Key, value: Vec<u8>) -> Result<(), StoreError>;

    /// Length of the stored block, 0 if absent.
    async fn length(&self, key: &Key) -> u64;

    /// Current cache contents, used to advertise what we hold.
    async fn keys(&self) -> Vec<Key>;

    /// Reference-count `key` against garbage collection.
    async fn lock(&self, key: &Key);

    async fn unlock(&self, key: &Key);

    /// Periodic consistency sweep.
    async fn check_seeds(&self);
}

/// Raw stream establishment. Filtering (proxy, allow/deny) is applied by the
/// implementation as well as by the engine's router.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to `uri`. `Ok(None)` means the uri is not handled by this
    /// transport or was filtered out.
    async fn create_connection(&self, uri: &str) -> Result<Option<Box<dyn PeerStream>>>;

    /// Wait for one inbound stream, returning it with the remote's uri.
    async fn accept_connection(&self) -> Result<(Box<dyn PeerStream>, String)>;
}
