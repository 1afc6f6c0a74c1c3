//! File catalog: name -> length

use super::block_store::BlockStore;
use super::layout;
use crate::backend::{StorageBackend, WriteBatch};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct FileCatalog {
    backend: Arc<dyn StorageBackend>,
    key: Vec<u8>,
}

impl FileCatalog {
    pub fn new(backend: Arc<dyn StorageBackend>, catalog_key: &str) -> Self {
        Self {
            backend,
            key: catalog_key.as_bytes().to_vec(),
        }
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        self.backend.hexists(&self.key, name.as_bytes())
    }

    /// Length of `name`, 0 when absent
    pub fn length(&self, name: &str) -> Result<u64> {
        Ok(self.length_opt(name)?.unwrap_or(0))
    }

    pub fn length_opt(&self, name: &str) -> Result<Option<u64>> {
        match self.backend.hget(&self.key, name.as_bytes())? {
            Some(raw) => Ok(Some(layout::decode_length(name, &raw)?)),
            None => Ok(None),
        }
    }

    /// Every catalogued name, in no particular order
    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .backend
            .hkeys(&self.key)?
            .into_iter()
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
            .collect())
    }

    pub(crate) fn stage_length(&self, batch: &mut WriteBatch, name: &str, length: u64) {
        batch.set(&self.key, name.as_bytes().to_vec(), layout::encode_length(length));
    }

    pub(crate) fn stage_remove(&self, batch: &mut WriteBatch, name: &str) {
        batch.delete(&self.key, vec![name.as_bytes().to_vec()]);
    }

    /// Remove `name` and all of its blocks; returns false (and logs) when absent
    pub fn delete(&self, name: &str, blocks: &BlockStore) -> Result<bool> {
        let Some(length) = self.length_opt(name)? else {
            warn!(name, "delete of a file that is not in the catalog");
            return Ok(false);
        };
        blocks.delete(name, length, self)?;
        Ok(true)
    }

    /// Re-home `values` (stored bytes of `old`'s blocks) under `new`, then drop `old`
    ///
    /// Additions are queued before deletions, so on a backend without
    /// transactions a failure part way leaves both names readable rather than
    /// neither.
    pub fn rename(
        &self,
        old: &str,
        new: &str,
        values: Vec<Vec<u8>>,
        length: u64,
        blocks: &BlockStore,
    ) -> Result<()> {
        if old == new {
            return Ok(());
        }
        let count = blocks.stored_count(old, length)?;
        let previous = self.length_opt(new)?;
        let stale = match previous {
            Some(previous) => blocks.stored_count(new, previous)?,
            None => 0,
        };

        let mut batch = WriteBatch::new();
        blocks.stage_stored(&mut batch, new, values, count)?;
        self.stage_length(&mut batch, new, length);
        blocks.stage_remove_range(&mut batch, new, count, stale);
        self.stage_remove(&mut batch, old);
        blocks.stage_remove_range(&mut batch, old, 0, count);

        debug!(old, new, length, blocks = count, replaced = previous.is_some(), "renaming file");
        blocks.commit(batch)
    }
}
