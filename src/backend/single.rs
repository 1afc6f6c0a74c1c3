//! Single shared connection
//!
//! One connection guarded by a mutex: callers on different threads take turns,
//! so a long batched load blocks every other operation until it finishes.

use super::{
    pipelined_get, run_hdel, run_hexists, run_hget, run_hkeys, run_hset,
    transactional_commit, BackendKind, BatchGet, Connection, StorageBackend, WriteBatch,
};
use crate::{Result, StorageError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

pub struct SingleConnectionBackend<C: Connection> {
    conn: Mutex<C>,
    closed: AtomicBool,
}

impl<C: Connection> SingleConnectionBackend<C> {
    pub fn new(conn: C) -> Self {
        Self {
            conn: Mutex::new(conn),
            closed: AtomicBool::new(false),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut C) -> Result<T>) -> Result<T> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed("single-connection backend".into()));
        }
        let mut conn = self.conn.lock();
        f(&mut *conn)
    }
}

impl<C: Connection> StorageBackend for SingleConnectionBackend<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::Single
    }

    fn hexists(&self, key: &[u8], field: &[u8]) -> Result<bool> {
        self.with_conn(|c| run_hexists(c, key, field))
    }

    fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_conn(|c| run_hget(c, key, field))
    }

    fn hset(&self, key: &[u8], field: &[u8], value: &[u8]) -> Result<bool> {
        self.with_conn(|c| run_hset(c, key, field, value))
    }

    fn hdel(&self, key: &[u8], fields: &[Vec<u8>]) -> Result<u64> {
        self.with_conn(|c| run_hdel(c, key, fields))
    }

    fn hkeys(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.with_conn(|c| run_hkeys(c, key))
    }

    fn hget_many(&self, key: &[u8], fields: &[Vec<u8>], sync_interval: usize) -> BatchGet {
        self.with_conn(|c| Ok(pipelined_get(c, key, fields, sync_interval)))
            .unwrap_or_else(|_| BatchGet::all_failed(fields.len()))
    }

    fn commit(&self, batch: WriteBatch, _sync_interval: usize) -> Result<()> {
        self.with_conn(|c| transactional_commit(c, batch.commands()))
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(backend = %self.kind(), "closing backend");
        self.conn.lock().close()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{Probe, ProbeConnection};
    use super::super::MemoryStore;
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    #[test]
    fn test_commit_is_one_transaction() {
        let store = MemoryStore::new();
        let probe = Arc::new(Probe::default());
        let backend = SingleConnectionBackend::new(ProbeConnection::new(store.connect(), probe.clone()));

        let mut batch = WriteBatch::new();
        for i in 0..10u8 {
            batch.set(b"h", vec![i], vec![i]);
        }
        backend.commit(batch, 3).unwrap();

        assert_eq!(probe.transactions.load(Ordering::SeqCst), 1);
        assert_eq!(store.field_count(b"h"), 10);
    }

    #[test]
    fn test_operations_after_close_fail() {
        let store = MemoryStore::new();
        let backend = SingleConnectionBackend::new(store.connect());
        assert!(backend.hset(b"h", b"f", b"v").unwrap());
        backend.close().unwrap();
        backend.close().unwrap();
        assert!(matches!(backend.hget(b"h", b"f"), Err(StorageError::Closed(_))));
        assert_eq!(backend.hget_many(b"h", &[b"f".to_vec()], 4).failed, vec![0]);
    }
}
