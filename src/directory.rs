//! Virtual directory over a key-value store
//!
//! `KvDirectory` is the entry point: it owns the catalog and block store for
//! one store, hands out read and write cursors, and tracks the memory held by
//! open outputs. Handles are cheap to clone and share all state; two
//! directories opened separately share nothing, even over the same backend.

use crate::backend::StorageBackend;
use crate::config::DirectoryConfig;
use crate::io::{ReadCursor, WriteCursor};
use crate::lock::{HeldLock, LockManager};
use crate::storage::{BlockStore, FileCatalog};
use crate::{Result, StorageError};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// State shared by a directory and the cursors it created
pub(crate) struct Shared {
    pub(crate) config: DirectoryConfig,
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) catalog: FileCatalog,
    pub(crate) blocks: BlockStore,
    /// Bytes held in buffers of open outputs
    ram_bytes: AtomicI64,
    /// Open outputs per file name
    pending: DashMap<String, usize>,
    closed: AtomicBool,
}

impl Shared {
    pub(crate) fn ensure_open(&self, op: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed(format!("{}: directory is closed", op)));
        }
        Ok(())
    }

    pub(crate) fn add_ram_bytes(&self, bytes: i64) {
        self.ram_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn register_output(&self, name: &str) {
        *self.pending.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Forget one open output of `name` and return its buffer bytes
    pub(crate) fn release_output(&self, name: &str, bytes: i64) {
        self.ram_bytes.fetch_sub(bytes, Ordering::AcqRel);
        if let Some(mut open) = self.pending.get_mut(name) {
            *open = open.saturating_sub(1);
        }
        self.pending.remove_if(name, |_, open| *open == 0);
    }
}

/// Result of `KvDirectory::check_consistency`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub files_checked: usize,
    /// `(name, index)` of blocks a catalogued file needs but the store lacks
    pub missing_blocks: Vec<(String, u64)>,
    /// `(name, index)` of blocks past the end of a catalogued file
    pub extra_blocks: Vec<(String, u64)>,
    /// `(name, index)` of blocks whose file is not in the catalog
    pub orphan_blocks: Vec<(String, u64)>,
    /// Catalogued files whose length entry is malformed or out of range
    pub bad_lengths: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_blocks.is_empty()
            && self.extra_blocks.is_empty()
            && self.orphan_blocks.is_empty()
            && self.bad_lengths.is_empty()
    }
}

#[derive(Clone)]
pub struct KvDirectory {
    shared: Arc<Shared>,
    locks: Arc<LockManager>,
}

impl KvDirectory {
    pub fn open(backend: Arc<dyn StorageBackend>, config: DirectoryConfig) -> Result<Self> {
        config.validate()?;
        let locks = LockManager::new(&config.lock_dir)?;
        let catalog = FileCatalog::new(backend.clone(), &config.catalog_key);
        let blocks = BlockStore::new(backend.clone(), &config);

        debug!(
            backend = %backend.kind(),
            block_size = config.block_size,
            compress = config.compress,
            sync_interval = config.sync_interval,
            "directory opened"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                backend,
                catalog,
                blocks,
                ram_bytes: AtomicI64::new(0),
                pending: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
            locks: Arc::new(locks),
        })
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.shared.config
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.shared.backend
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    /// All file names, sorted
    pub fn list_all(&self) -> Result<Vec<String>> {
        self.shared.ensure_open("list_all")?;
        let mut names = self.shared.catalog.list()?;
        names.sort();
        Ok(names)
    }

    pub fn file_exists(&self, name: &str) -> Result<bool> {
        self.shared.ensure_open("file_exists")?;
        self.shared.catalog.exists(name)
    }

    /// Length of `name`; 0 for an absent file
    pub fn file_length(&self, name: &str) -> Result<u64> {
        self.shared.ensure_open("file_length")?;
        self.shared.catalog.length(name)
    }

    /// Remove `name` and its blocks; an absent file is logged and ignored
    pub fn delete_file(&self, name: &str) -> Result<()> {
        self.shared.ensure_open("delete_file")?;
        self.shared.catalog.delete(name, &self.shared.blocks)?;
        Ok(())
    }

    pub fn rename_file(&self, source: &str, dest: &str) -> Result<()> {
        self.shared.ensure_open("rename_file")?;
        let length = self
            .shared
            .catalog
            .length_opt(source)?
            .ok_or_else(|| StorageError::NotFound(format!("rename of '{}' to '{}'", source, dest)))?;
        let values = self.shared.blocks.load_raw(source, length)?;
        self.shared
            .catalog
            .rename(source, dest, values, length, &self.shared.blocks)
    }

    /// Writer whose content replaces `name` when closed
    pub fn create_output(&self, name: &str) -> Result<WriteCursor> {
        self.shared.ensure_open("create_output")?;
        if name.is_empty() {
            return Err(StorageError::InvalidArgument("file name must not be empty".into()));
        }
        Ok(WriteCursor::new(name, self.shared.clone()))
    }

    /// Load `name` and return a reader positioned at 0
    pub fn open_input(&self, name: &str) -> Result<ReadCursor> {
        self.shared.ensure_open("open_input")?;
        let length = self
            .shared
            .catalog
            .length_opt(name)?
            .ok_or_else(|| StorageError::NotFound(format!("open_input of '{}'", name)))?;
        let file = self.shared.blocks.load(name, length)?;
        Ok(ReadCursor::new(name, file))
    }

    /// Content is durable once an output is closed; nothing to do here
    pub fn sync<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        self.shared.ensure_open("sync")?;
        debug!(files = names.len(), "sync requested");
        Ok(())
    }

    pub fn obtain_lock(&self, name: &str) -> Result<HeldLock> {
        self.shared.ensure_open("obtain_lock")?;
        self.locks.acquire(name)
    }

    /// Bytes currently buffered by open outputs of this directory
    pub fn ram_bytes_used(&self) -> i64 {
        self.shared.ram_bytes.load(Ordering::Acquire)
    }

    /// Names with at least one open output, sorted
    pub fn pending_outputs(&self) -> Vec<String> {
        let names: BTreeSet<String> = self.shared.pending.iter().map(|e| e.key().clone()).collect();
        names.into_iter().collect()
    }

    /// Compare the catalog against the block table; reports, never repairs
    pub fn check_consistency(&self) -> Result<ConsistencyReport> {
        self.shared.ensure_open("check_consistency")?;
        let blocks = &self.shared.blocks;
        let mut stored = blocks.stored_blocks()?;
        let mut report = ConsistencyReport::default();

        for name in self.shared.catalog.list()? {
            let present = stored.remove(&name).unwrap_or_default();
            report.files_checked += 1;
            let length = match self.shared.catalog.length(&name) {
                Ok(length) => length,
                Err(StorageError::ConsistencyViolation(msg)) => {
                    error!(name = %name, error = %msg, "unreadable catalog length");
                    report.bad_lengths.push(name);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let expected = match blocks.stored_count(&name, length) {
                Ok(expected) => expected,
                Err(_) => {
                    report.bad_lengths.push(name);
                    continue;
                }
            };

            let missing: Vec<u64> = (0..expected).filter(|i| !present.contains(i)).collect();
            let extra: Vec<u64> = present.range(expected..).copied().collect();
            if !missing.is_empty() {
                error!(name = %name, length, missing = missing.len(), "file is missing blocks");
            }
            if !extra.is_empty() {
                error!(name = %name, length, extra = extra.len(), "file has blocks past its length");
            }
            report.missing_blocks.extend(missing.into_iter().map(|i| (name.clone(), i)));
            report.extra_blocks.extend(extra.into_iter().map(|i| (name.clone(), i)));
        }

        for (name, indices) in stored {
            error!(name = %name, blocks = indices.len(), "blocks of a file absent from the catalog");
            report.orphan_blocks.extend(indices.into_iter().map(|i| (name.clone(), i)));
        }

        debug!(files = report.files_checked, consistent = report.is_consistent(), "consistency check done");
        Ok(report)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Release the backend; later calls on any handle fail with `Closed`
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let pending = self.pending_outputs();
        if !pending.is_empty() {
            warn!(outputs = ?pending, "closing directory with open outputs");
        }
        debug!(backend = %self.shared.backend.kind(), "closing directory");
        self.shared.backend.close()
    }
}
