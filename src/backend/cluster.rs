//! Cluster nodes
//!
//! One connection per node, hash keys routed by `crc32(key) % nodes`. Cluster
//! clients cannot pipeline across slots or run `MULTI`, so every command goes
//! out on its own and batches are applied strictly in order.

use super::{
    run_hdel, run_hexists, run_hget, run_hkeys, run_hset, slot_for, BackendKind, BatchGet,
    Connection, StorageBackend, WriteBatch,
};
use crate::{Result, StorageError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

pub struct ClusterBackend<C: Connection> {
    nodes: Vec<Mutex<C>>,
    closed: AtomicBool,
}

impl<C: Connection> ClusterBackend<C> {
    pub fn new(nodes: Vec<C>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(StorageError::InvalidConfig("cluster backend needs at least one node".into()));
        }
        Ok(Self {
            nodes: nodes.into_iter().map(Mutex::new).collect(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn node_for(&self, key: &[u8]) -> usize {
        slot_for(key, self.nodes.len())
    }

    fn with_node<T>(&self, key: &[u8], f: impl FnOnce(&mut C) -> Result<T>) -> Result<T> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed("cluster backend".into()));
        }
        let mut conn = self.nodes[self.node_for(key)].lock();
        f(&mut *conn)
    }
}

impl<C: Connection> StorageBackend for ClusterBackend<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::Cluster
    }

    fn hexists(&self, key: &[u8], field: &[u8]) -> Result<bool> {
        self.with_node(key, |c| run_hexists(c, key, field))
    }

    fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_node(key, |c| run_hget(c, key, field))
    }

    fn hset(&self, key: &[u8], field: &[u8], value: &[u8]) -> Result<bool> {
        self.with_node(key, |c| run_hset(c, key, field, value))
    }

    fn hdel(&self, key: &[u8], fields: &[Vec<u8>]) -> Result<u64> {
        self.with_node(key, |c| run_hdel(c, key, fields))
    }

    fn hkeys(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.with_node(key, |c| run_hkeys(c, key))
    }

    /// One request in flight at a time, so the sync interval is moot here
    fn hget_many(&self, key: &[u8], fields: &[Vec<u8>], _sync_interval: usize) -> BatchGet {
        let mut result = BatchGet::with_capacity(fields.len());
        for (index, field) in fields.iter().enumerate() {
            match self.hget(key, field) {
                Ok(value) => result.values.push(value),
                Err(e) => {
                    warn!(index, error = %e, "single get failed in batched load");
                    result.values.push(None);
                    result.failed.push(index);
                }
            }
        }
        result
    }

    fn commit(&self, batch: WriteBatch, _sync_interval: usize) -> Result<()> {
        for command in batch.commands() {
            // Every write answers with an integer; anything else means it did not apply
            self.with_node(command.key(), |c| c.execute(command))?.into_integer()?;
        }
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        false
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(backend = %self.kind(), nodes = self.nodes.len(), "closing backend");
        for node in &self.nodes {
            node.lock().close()?;
        }
        Ok(())
    }
}
