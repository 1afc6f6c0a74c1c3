//! Sharded pools
//!
//! Each hash key lives on exactly one shard (`crc32(key) % shards`), so a whole
//! table stays on one server. A batch that touches tables on different shards
//! cannot be one transaction; it runs shard-run by shard-run in batch order.

use super::pool::{pooled_get_many, with_pooled, ConnectionPool};
use super::{
    pipelined_commit, run_hdel, run_hexists, run_hget, run_hkeys, run_hset, slot_for,
    transactional_commit, BackendKind, BatchGet, Command, Connection, StorageBackend, WriteBatch,
};
use crate::config::PoolConfig;
use crate::{Result, StorageError};
use tracing::debug;

pub struct ShardedBackend<C: Connection> {
    shards: Vec<ConnectionPool<C>>,
}

impl<C: Connection> ShardedBackend<C> {
    /// One factory per shard; shard order defines routing and must be stable
    pub fn new<F>(factories: Vec<F>, config: PoolConfig) -> Result<Self>
    where
        F: Fn() -> Result<C> + Send + Sync + 'static,
    {
        if factories.is_empty() {
            return Err(StorageError::InvalidConfig("sharded backend needs at least one shard".into()));
        }
        let shards = factories
            .into_iter()
            .map(|f| ConnectionPool::new(f, config.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { shards })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_for(&self, key: &[u8]) -> usize {
        slot_for(key, self.shards.len())
    }

    fn pool_for(&self, key: &[u8]) -> &ConnectionPool<C> {
        &self.shards[self.shard_for(key)]
    }
}

/// Split commands into maximal consecutive runs on the same shard
fn shard_runs(commands: Vec<Command>, shards: usize) -> Vec<(usize, Vec<Command>)> {
    let mut runs: Vec<(usize, Vec<Command>)> = Vec::new();
    for command in commands {
        let shard = slot_for(command.key(), shards);
        match runs.last_mut() {
            Some((last, run)) if *last == shard => run.push(command),
            _ => runs.push((shard, vec![command])),
        }
    }
    runs
}

impl<C: Connection> StorageBackend for ShardedBackend<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::Sharded
    }

    fn hexists(&self, key: &[u8], field: &[u8]) -> Result<bool> {
        with_pooled(self.pool_for(key), |c| run_hexists(c, key, field))
    }

    fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>> {
        with_pooled(self.pool_for(key), |c| run_hget(c, key, field))
    }

    fn hset(&self, key: &[u8], field: &[u8], value: &[u8]) -> Result<bool> {
        with_pooled(self.pool_for(key), |c| run_hset(c, key, field, value))
    }

    fn hdel(&self, key: &[u8], fields: &[Vec<u8>]) -> Result<u64> {
        with_pooled(self.pool_for(key), |c| run_hdel(c, key, fields))
    }

    fn hkeys(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        with_pooled(self.pool_for(key), |c| run_hkeys(c, key))
    }

    fn hget_many(&self, key: &[u8], fields: &[Vec<u8>], sync_interval: usize) -> BatchGet {
        pooled_get_many(self.pool_for(key), key, fields, sync_interval)
    }

    fn commit(&self, batch: WriteBatch, sync_interval: usize) -> Result<()> {
        let mut runs = shard_runs(batch.into_commands(), self.shards.len());
        if runs.len() == 1 {
            let (shard, commands) = runs.remove(0);
            return with_pooled(&self.shards[shard], |c| transactional_commit(c, &commands));
        }
        debug!(runs = runs.len(), "batch spans shards, committing in order");
        for (shard, commands) in runs {
            with_pooled(&self.shards[shard], |c| pipelined_commit(c, &commands, sync_interval))?;
        }
        Ok(())
    }

    /// Only a single-shard deployment can guarantee cross-table atomicity
    fn supports_transactions(&self) -> bool {
        self.shards.len() == 1
    }

    fn close(&self) -> Result<()> {
        debug!(backend = %self.kind(), shards = self.shards.len(), "closing backend");
        for shard in &self.shards {
            shard.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{Probe, ProbeConnection};
    use super::super::MemoryStore;
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    /// Two shards with keys known to land on different shards
    fn split_keys(backend: &ShardedBackend<ProbeConnection<crate::backend::MemoryConnection>>) -> (Vec<u8>, Vec<u8>) {
        let first = b"table-0".to_vec();
        let other = (1..100)
            .map(|i| format!("table-{}", i).into_bytes())
            .find(|k| backend.shard_for(k) != backend.shard_for(&first))
            .unwrap();
        (first, other)
    }

    fn backend(stores: &[MemoryStore], probe: &Arc<Probe>) -> ShardedBackend<ProbeConnection<crate::backend::MemoryConnection>> {
        let factories: Vec<_> = stores
            .iter()
            .map(|s| {
                let s = s.clone();
                let probe = probe.clone();
                move || Ok::<_, StorageError>(ProbeConnection::new(s.connect(), probe.clone()))
            })
            .collect();
        ShardedBackend::new(factories, PoolConfig::default()).unwrap()
    }

    #[test]
    fn test_keys_route_to_their_shard() {
        let stores = vec![MemoryStore::new(), MemoryStore::new()];
        let probe = Arc::new(Probe::default());
        let backend = backend(&stores, &probe);
        let (a, b) = split_keys(&backend);

        backend.hset(&a, b"f", b"1").unwrap();
        backend.hset(&b, b"f", b"2").unwrap();

        assert_eq!(stores[backend.shard_for(&a)].get(&a, b"f"), Some(b"1".to_vec()));
        assert_eq!(stores[backend.shard_for(&b)].get(&b, b"f"), Some(b"2".to_vec()));
        assert_eq!(stores[backend.shard_for(&a)].get(&b, b"f"), None);
    }

    #[test]
    fn test_cross_shard_commit_is_ordered_not_transactional() {
        let stores = vec![MemoryStore::new(), MemoryStore::new()];
        let probe = Arc::new(Probe::default());
        let backend = backend(&stores, &probe);
        let (a, b) = split_keys(&backend);

        let mut batch = WriteBatch::new();
        batch.set(&a, b"x".to_vec(), b"1".to_vec());
        batch.set(&b, b"y".to_vec(), b"2".to_vec());
        batch.delete(&a, vec![b"x".to_vec()]);
        backend.commit(batch, 8).unwrap();

        assert_eq!(probe.transactions.load(Ordering::SeqCst), 0);
        assert_eq!(probe.pipelines.load(Ordering::SeqCst), 3);
        assert_eq!(stores[backend.shard_for(&a)].field_count(&a), 0);
        assert_eq!(stores[backend.shard_for(&b)].field_count(&b), 1);
        assert!(!backend.supports_transactions());
    }

    #[test]
    fn test_single_shard_commit_is_transactional() {
        let stores = vec![MemoryStore::new(), MemoryStore::new()];
        let probe = Arc::new(Probe::default());
        let backend = backend(&stores, &probe);

        let mut batch = WriteBatch::new();
        batch.set(b"t", b"x".to_vec(), b"1".to_vec());
        batch.set(b"t", b"y".to_vec(), b"2".to_vec());
        backend.commit(batch, 1).unwrap();

        assert_eq!(probe.transactions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_shards_rejected() {
        let factories: Vec<fn() -> Result<crate::backend::MemoryConnection>> = Vec::new();
        assert!(ShardedBackend::new(factories, PoolConfig::default()).is_err());
    }

    #[test]
    fn test_shard_runs_merge_neighbours() {
        let cmd = |k: &str| Command::HKeys { key: k.into() };
        let runs = shard_runs(vec![cmd("a"), cmd("a"), cmd("a")], 4);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].1.len(), 3);
    }
}
