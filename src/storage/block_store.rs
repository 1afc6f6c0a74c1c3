//! Block store: `(name, index)` -> block bytes
//!
//! ## Save
//! Blocks are trimmed to their logical length, encoded (in parallel when
//! compressing) and committed in one batch together with the catalog length:
//! new blocks, then the length, then any trailing blocks of a previous longer
//! version.
//!
//! ## Load
//! All blocks are fetched through `hget_many`, which keeps at most
//! `sync_interval` requests in flight. A load never yields a partial file: a
//! failed round trip is a `Transport` error and a missing block is a
//! `ConsistencyViolation`, both naming the affected indices.

use super::catalog::FileCatalog;
use super::codec::BlockCodec;
use super::layout::{block_count, block_key, block_len, checked_block_count, parse_block_key};
use crate::backend::{StorageBackend, WriteBatch};
use crate::config::DirectoryConfig;
use crate::{Result, StorageError};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error};

/// Below this many blocks the codec runs on the calling thread
const PARALLEL_CODEC_THRESHOLD: usize = 4;

/// How many offending indices an error message lists
const MAX_REPORTED_INDICES: usize = 16;

/// Immutable snapshot of a file's content
#[derive(Debug)]
pub struct LoadedFile {
    blocks: Vec<Vec<u8>>,
    length: u64,
    block_size: usize,
}

impl LoadedFile {
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Logical bytes of block `index`
    pub fn block(&self, index: usize) -> &[u8] {
        &self.blocks[index]
    }
}

pub struct BlockStore {
    backend: Arc<dyn StorageBackend>,
    key: Vec<u8>,
    block_size: usize,
    codec: BlockCodec,
    sync_interval: usize,
}

impl BlockStore {
    pub fn new(backend: Arc<dyn StorageBackend>, config: &DirectoryConfig) -> Self {
        Self {
            backend,
            key: config.blocks_key.as_bytes().to_vec(),
            block_size: config.block_size,
            codec: BlockCodec::from_compress(config.compress),
            sync_interval: config.sync_interval,
        }
    }

    /// Block count of a catalogued length, rejecting damaged lengths
    pub fn stored_count(&self, name: &str, length: u64) -> Result<u64> {
        checked_block_count(name, length, self.block_size).inspect_err(|e| {
            error!(name, length, error = %e, "catalog length out of range");
        })
    }

    /// Persist `blocks` as the whole content of `name`, replacing any earlier version
    pub fn save(&self, name: &str, blocks: Vec<Vec<u8>>, length: u64, catalog: &FileCatalog) -> Result<()> {
        let count = block_count(length, self.block_size) as usize;
        if blocks.len() < count {
            return Err(StorageError::InvalidArgument(format!(
                "save of '{}': {} bytes need {} blocks, got {}",
                name,
                length,
                count,
                blocks.len()
            )));
        }
        let previous = catalog.length_opt(name)?;
        let stale = match previous {
            Some(previous) => self.stored_count(name, previous)?,
            None => 0,
        };
        let stored = self.encode_blocks(blocks, length, count)?;

        let mut batch = WriteBatch::new();
        self.stage_stored(&mut batch, name, stored, count as u64)?;
        catalog.stage_length(&mut batch, name, length);
        self.stage_remove_range(&mut batch, name, count as u64, stale);

        debug!(name, length, blocks = count, overwrite = previous.is_some(), "saving file");
        self.commit(batch)
    }

    /// Fetch and decode every block of `name`
    pub fn load(&self, name: &str, length: u64) -> Result<LoadedFile> {
        let stored = self.load_raw(name, length)?;
        let blocks = self.decode_blocks(name, stored, length)?;
        Ok(LoadedFile {
            blocks,
            length,
            block_size: self.block_size,
        })
    }

    /// Fetch the stored (possibly compressed) bytes of every block of `name`
    pub fn load_raw(&self, name: &str, length: u64) -> Result<Vec<Vec<u8>>> {
        let count = self.stored_count(name, length)?;
        let fields: Vec<Vec<u8>> = (0..count).map(|i| block_key(name, i)).collect();
        let fetched = self.backend.hget_many(&self.key, &fields, self.sync_interval);

        if !fetched.is_complete() {
            return Err(StorageError::Transport(format!(
                "load of '{}' lost {} of {} blocks: {}",
                name,
                fetched.failed.len(),
                count,
                format_indices(&fetched.failed)
            )));
        }
        if fetched.values.len() != fields.len() {
            return Err(StorageError::Transport(format!(
                "load of '{}' returned {} of {} blocks",
                name,
                fetched.values.len(),
                count
            )));
        }

        let missing: Vec<usize> = fetched
            .values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.is_none().then_some(i))
            .collect();
        if !missing.is_empty() {
            error!(name, length, missing = missing.len(), "catalogued file has missing blocks");
            return Err(StorageError::ConsistencyViolation(format!(
                "'{}' ({} bytes) is missing blocks {}",
                name,
                length,
                format_indices(&missing)
            )));
        }

        Ok(fetched.values.into_iter().flatten().collect())
    }

    /// Remove the catalog entry and every block of `name`
    pub fn delete(&self, name: &str, length: u64, catalog: &FileCatalog) -> Result<()> {
        let count = self.stored_count(name, length)?;
        let mut batch = WriteBatch::new();
        catalog.stage_remove(&mut batch, name);
        self.stage_remove_range(&mut batch, name, 0, count);
        debug!(name, length, blocks = count, "deleting file");
        self.commit(batch)
    }

    /// Indices of every block stored for `name`, ascending
    pub fn stored_block_indices(&self, name: &str) -> Result<Vec<u64>> {
        Ok(self
            .stored_blocks()?
            .remove(name)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default())
    }

    /// Full scan of the block table grouped by file name
    pub fn stored_blocks(&self) -> Result<BTreeMap<String, BTreeSet<u64>>> {
        let mut files: BTreeMap<String, BTreeSet<u64>> = BTreeMap::new();
        for raw in self.backend.hkeys(&self.key)? {
            match parse_block_key(&raw) {
                Some((name, index)) => {
                    files.entry(name).or_default().insert(index);
                }
                None => {
                    error!(key = %String::from_utf8_lossy(&raw), "unrecognised key in block table");
                }
            }
        }
        Ok(files)
    }

    pub(crate) fn stage_stored(
        &self,
        batch: &mut WriteBatch,
        name: &str,
        stored: Vec<Vec<u8>>,
        count: u64,
    ) -> Result<()> {
        if stored.len() as u64 != count {
            return Err(StorageError::InvalidArgument(format!(
                "'{}' needs {} blocks, got {}",
                name,
                count,
                stored.len()
            )));
        }
        for (index, value) in stored.into_iter().enumerate() {
            batch.set(&self.key, block_key(name, index as u64), value);
        }
        Ok(())
    }

    /// Queue removal of blocks `from..to` of `name` (nothing when `from >= to`)
    pub(crate) fn stage_remove_range(&self, batch: &mut WriteBatch, name: &str, from: u64, to: u64) {
        let fields: Vec<Vec<u8>> = (from..to).map(|i| block_key(name, i)).collect();
        batch.delete(&self.key, fields);
    }

    pub(crate) fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.backend.commit(batch, self.sync_interval)
    }

    fn encode_blocks(&self, mut blocks: Vec<Vec<u8>>, length: u64, count: usize) -> Result<Vec<Vec<u8>>> {
        blocks.truncate(count);
        for (index, block) in blocks.iter_mut().enumerate() {
            block.truncate(block_len(length, self.block_size, index as u64));
        }
        match self.codec {
            BlockCodec::None => Ok(blocks),
            codec if count >= PARALLEL_CODEC_THRESHOLD => {
                blocks.par_iter().map(|b| codec.encode(b)).collect()
            }
            codec => blocks.iter().map(|b| codec.encode(b)).collect(),
        }
    }

    fn decode_blocks(&self, name: &str, stored: Vec<Vec<u8>>, length: u64) -> Result<Vec<Vec<u8>>> {
        let codec = self.codec;
        let block_size = self.block_size;
        let decode_one = |(index, raw): (usize, Vec<u8>)| -> Result<Vec<u8>> {
            let mut block = match codec {
                BlockCodec::None => raw,
                _ => codec.decode(&raw)?,
            };
            let expected = block_len(length, block_size, index as u64);
            if block.len() < expected {
                return Err(StorageError::ConsistencyViolation(format!(
                    "block {} of '{}' holds {} bytes, expected {}",
                    index,
                    name,
                    block.len(),
                    expected
                )));
            }
            block.truncate(expected);
            Ok(block)
        };

        if codec != BlockCodec::None && stored.len() >= PARALLEL_CODEC_THRESHOLD {
            stored.into_par_iter().enumerate().map(decode_one).collect()
        } else {
            stored.into_iter().enumerate().map(decode_one).collect()
        }
    }
}

fn format_indices(indices: &[usize]) -> String {
    let shown: Vec<String> = indices.iter().take(MAX_REPORTED_INDICES).map(|i| i.to_string()).collect();
    if indices.len() > MAX_REPORTED_INDICES {
        format!("[{}, ... {} more]", shown.join(", "), indices.len() - MAX_REPORTED_INDICES)
    } else {
        format!("[{}]", shown.join(", "))
    }
}
