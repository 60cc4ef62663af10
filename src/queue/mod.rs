//! Durable FIFO queue over a [`KvMap`].
//!
//! The queue stores each payload under the decimal ASCII form of a signed
//! 64-bit index. `read_id` points at the head (next to deliver), `write_id`
//! at the slot the next put will fill. Both indices only ever grow; history
//! is never rewritten and 64 bits are treated as inexhaustible.
//!
//! # Concurrency
//!
//! Puts may come from many threads; a single consumer drives head/remove.
//! A writer lock linearises storage mutations, while the indices are plain
//! atomics so [`Queue::empty`] and [`Queue::size`] stay lock-free. Those
//! snapshots may race with concurrent puts; a stale "empty" only costs the
//! consumer one extra wakeup cycle.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::storage::{KvMap, MapError};

pub mod notify;
pub mod typed;

pub use notify::{Notification, Subscription};
pub use typed::TypedQueue;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue holds no items.
    #[error("queue is empty")]
    Empty,

    /// The backing store holds a key that is not a decimal index.
    #[error("queue key is not a decimal index: {0:?}")]
    BadKey(String),

    /// The backing store failed.
    #[error("storage error: {0}")]
    Storage(#[from] MapError),
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Persistent FIFO queue with put notifications.
pub struct Queue {
    storage: RwLock<Box<dyn KvMap + Send + Sync>>,
    read_id: AtomicI64,
    write_id: AtomicI64,
    on_created: Notification,
}

impl Queue {
    /// Builds a queue over `storage`, reconstructing the head and tail
    /// indices by scanning all live keys.
    ///
    /// An empty store starts both indices at 0. Keys that do not parse as
    /// decimal 64-bit integers fail construction with [`QueueError::BadKey`].
    pub fn new(storage: Box<dyn KvMap + Send + Sync>) -> Result<Self> {
        let mut min_id = i64::MAX;
        let mut max_id = i64::MIN;
        let mut empty = true;
        let mut bad_key: Option<String> = None;

        let scan = storage.keys(&mut |key| {
            let parsed = std::str::from_utf8(key)
                .ok()
                .and_then(|s| s.parse::<i64>().ok());
            match parsed {
                Some(id) => {
                    min_id = min_id.min(id);
                    max_id = max_id.max(id);
                    empty = false;
                    Ok(())
                }
                None => {
                    bad_key = Some(String::from_utf8_lossy(key).into_owned());
                    anyhow::bail!("unparseable queue key")
                }
            }
        });
        if let Some(key) = bad_key {
            return Err(QueueError::BadKey(key));
        }
        scan?;

        let (read_id, write_id) = if empty {
            (0, 0)
        } else {
            // The slot after the largest index is where the next put lands.
            (min_id, max_id + 1)
        };

        debug!(read_id, write_id, "reconstructed queue indices");

        Ok(Queue {
            storage: RwLock::new(storage),
            read_id: AtomicI64::new(read_id),
            write_id: AtomicI64::new(write_id),
            on_created: Notification::new(),
        })
    }

    /// Handle to the bus that pulses on every successful put.
    pub fn on_created(&self) -> &Notification {
        &self.on_created
    }

    /// Lock-free emptiness snapshot; may be stale against racing puts.
    pub fn empty(&self) -> bool {
        self.read_id.load(Ordering::Acquire) >= self.write_id.load(Ordering::Acquire)
    }

    /// Lock-free size snapshot; may be stale against racing puts.
    pub fn size(&self) -> i64 {
        self.write_id.load(Ordering::Acquire) - self.read_id.load(Ordering::Acquire)
    }

    /// Appends a payload at the tail.
    ///
    /// On storage failure the write index does not advance and the error is
    /// surfaced to the producer. Subscribers are notified after the lock is
    /// released so a woken consumer does not immediately contend on it.
    pub fn put(&self, data: &[u8]) -> Result<()> {
        {
            let mut storage = self.storage.write();
            let id = self.write_id.load(Ordering::Acquire);
            storage.put(id.to_string().as_bytes(), data)?;
            self.write_id.store(id + 1, Ordering::Release);
        }
        self.on_created.notify();
        Ok(())
    }

    /// Returns the head payload without removing it.
    ///
    /// Fails with [`QueueError::Empty`] when the queue holds nothing.
    pub fn head(&self) -> Result<Vec<u8>> {
        if self.empty() {
            return Err(QueueError::Empty);
        }
        let storage = self.storage.read();
        let id = self.read_id.load(Ordering::Acquire);
        Ok(storage.get(id.to_string().as_bytes())?)
    }

    /// Removes the head. A no-op on an empty queue. Does not notify.
    pub fn remove(&self) -> Result<()> {
        if self.empty() {
            return Ok(());
        }
        let mut storage = self.storage.write();
        let id = self.read_id.load(Ordering::Acquire);
        storage.del(id.to_string().as_bytes())?;
        self.read_id.store(id + 1, Ordering::Release);
        Ok(())
    }

    /// Closes the backing store. Subsequent operations fail.
    pub fn close(&self) -> Result<()> {
        let mut storage = self.storage.write();
        Ok(storage.close()?)
    }
}
