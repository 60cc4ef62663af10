//! Pluggable key-value substrate for the durable queue.
//!
//! A [`KvMap`] is an unordered mapping from byte-string keys to byte-string
//! values. The queue overlays a FIFO on top of it by writing decimal index
//! keys; it serializes all access through its own lock, so implementations
//! do not need to be thread-safe on their own.
//!
//! Two implementations are provided:
//! - [`DiskMap`]: a crash-consistent log-structured on-disk store
//! - [`MemoryMap`]: a process-local mapping for tests and ephemeral queues

use std::io;

use thiserror::Error;

pub mod disk;
pub mod memory;

pub use disk::DiskMap;
pub use memory::MemoryMap;

/// Errors that can occur during map operations.
#[derive(Debug, Error)]
pub enum MapError {
    /// The requested key is not present.
    #[error("key not found")]
    NotFound,

    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The on-disk data is damaged in a way that cannot be repaired by
    /// truncating a torn tail record.
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// The store has been closed; no further operations are possible.
    #[error("store is closed")]
    Closed,

    /// A key visitor aborted iteration.
    #[error("{0}")]
    Visitor(anyhow::Error),
}

/// Result type for map operations.
pub type Result<T> = std::result::Result<T, MapError>;

/// Unordered byte-key to byte-value store.
///
/// Used as `Box<dyn KvMap + Send + Sync>` behind the queue's lock.
pub trait KvMap {
    /// Upserts a key-value pair.
    ///
    /// When this returns `Ok`, durable implementations guarantee the pair
    /// survives a crash.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Returns the stored value, or [`MapError::NotFound`] when absent.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Removes a key. Idempotent: removing an absent key is `Ok`.
    fn del(&mut self, key: &[u8]) -> Result<()>;

    /// Invokes `visit` once per live key, in no particular order.
    ///
    /// Iteration aborts on the first visitor error, which is propagated
    /// as [`MapError::Visitor`].
    fn keys(&self, visit: &mut dyn FnMut(&[u8]) -> anyhow::Result<()>) -> Result<()>;

    /// Releases any held resources. Subsequent operations fail with
    /// [`MapError::Closed`]. The default implementation is a no-op.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
