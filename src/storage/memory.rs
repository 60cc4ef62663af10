//! In-memory map for tests and ephemeral queues.

use std::collections::HashMap;

use super::{KvMap, MapError, Result};

/// Process-local map. Keys and values are copied on the way in so the
/// caller may reuse its buffers. Not internally synchronised; the queue's
/// lock serialises access.
#[derive(Debug, Default)]
pub struct MemoryMap {
    entries: HashMap<Vec<u8>, Vec<u8>>,
}

impl MemoryMap {
    /// Creates an empty in-memory map.
    pub fn new() -> Self {
        MemoryMap::default()
    }
}

impl KvMap for MemoryMap {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.entries.get(key).cloned().ok_or(MapError::NotFound)
    }

    fn del(&mut self, key: &[u8]) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self, visit: &mut dyn FnMut(&[u8]) -> anyhow::Result<()>) -> Result<()> {
        for key in self.entries.keys() {
            visit(key).map_err(MapError::Visitor)?;
        }
        Ok(())
    }
}
