//! Connection pool
//!
//! Connections are created lazily up to `max_connections` and parked in a
//! bounded channel while idle. A checkout that finds the pool exhausted waits
//! up to `checkout_timeout` for a connection to come back, or until the pool
//! is closed.

use super::{
    pipelined_get, run_hdel, run_hexists, run_hget, run_hkeys, run_hset, transactional_commit,
    BackendKind, BatchGet, Connection, StorageBackend, WriteBatch,
};
use crate::config::PoolConfig;
use crate::{Result, StorageError};
use crossbeam::channel::{bounded, select, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, warn};

type Factory<C> = Box<dyn Fn() -> Result<C> + Send + Sync>;

pub struct ConnectionPool<C: Connection> {
    factory: Factory<C>,
    idle_tx: Sender<C>,
    idle_rx: Receiver<C>,
    /// Live connections (idle + checked out)
    live: AtomicUsize,
    config: PoolConfig,
    closed: AtomicBool,
    /// Never sent on; dropped by `close` to wake waiting checkouts
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl<C: Connection> ConnectionPool<C> {
    pub fn new<F>(factory: F, config: PoolConfig) -> Result<Self>
    where
        F: Fn() -> Result<C> + Send + Sync + 'static,
    {
        config.validate()?;
        let (idle_tx, idle_rx) = bounded(config.max_connections);
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Ok(Self {
            factory: Box::new(factory),
            idle_tx,
            idle_rx,
            live: AtomicUsize::new(0),
            config,
            closed: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        })
    }

    /// Check out a connection, creating one if the pool is below capacity
    pub fn get(&self) -> Result<PooledConnection<'_, C>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed("connection pool".into()));
        }

        match self.idle_rx.try_recv() {
            Ok(conn) => return Ok(self.wrap(conn)),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                return Err(StorageError::Closed("connection pool".into()));
            }
        }

        let max = self.config.max_connections;
        let reserved = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok();
        if reserved {
            return match (self.factory)() {
                Ok(conn) => {
                    debug!(live = self.live.load(Ordering::Relaxed), "opened pooled connection");
                    Ok(self.wrap(conn))
                }
                Err(e) => {
                    self.live.fetch_sub(1, Ordering::AcqRel);
                    Err(e)
                }
            };
        }

        select! {
            recv(self.idle_rx) -> conn => match conn {
                Ok(conn) => Ok(self.wrap(conn)),
                Err(_) => Err(StorageError::Closed("connection pool".into())),
            },
            recv(self.shutdown_rx) -> _ => Err(StorageError::Closed("connection pool closed during checkout".into())),
            default(self.config.checkout_timeout()) => Err(StorageError::Transport(format!(
                "timed out after {} ms waiting for a pooled connection ({} in use)",
                self.config.checkout_timeout_ms, max
            ))),
        }
    }

    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn idle_connections(&self) -> usize {
        self.idle_rx.len()
    }

    /// Close idle connections; checked-out ones are closed when returned
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        drop(self.shutdown_tx.lock().take());
        while let Ok(mut conn) = self.idle_rx.try_recv() {
            self.live.fetch_sub(1, Ordering::AcqRel);
            if let Err(e) = conn.close() {
                warn!(error = %e, "error closing pooled connection");
            }
        }
        Ok(())
    }

    fn wrap(&self, conn: C) -> PooledConnection<'_, C> {
        PooledConnection {
            conn: Some(conn),
            pool: self,
            broken: false,
        }
    }

    fn give_back(&self, mut conn: C, broken: bool) {
        if broken || self.closed.load(Ordering::Acquire) {
            self.live.fetch_sub(1, Ordering::AcqRel);
            if let Err(e) = conn.close() {
                warn!(error = %e, broken, "error closing returned connection");
            }
            return;
        }
        if let Err(e) = self.idle_tx.try_send(conn) {
            self.live.fetch_sub(1, Ordering::AcqRel);
            if let Err(e) = e.into_inner().close() {
                warn!(error = %e, "error closing surplus connection");
            }
        }
    }
}

/// Checked-out connection; returns to the pool on drop
pub struct PooledConnection<'a, C: Connection> {
    conn: Option<C>,
    pool: &'a ConnectionPool<C>,
    broken: bool,
}

impl<C: Connection> PooledConnection<'_, C> {
    /// Drop the connection instead of returning it (after a transport failure)
    pub fn discard(&mut self) {
        self.broken = true;
    }
}

impl<C: Connection> Deref for PooledConnection<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl<C: Connection> DerefMut for PooledConnection<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl<C: Connection> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn, self.broken);
        }
    }
}

/// Backend over one connection pool
pub struct PooledBackend<C: Connection> {
    pool: ConnectionPool<C>,
}

impl<C: Connection> PooledBackend<C> {
    pub fn new<F>(factory: F, config: PoolConfig) -> Result<Self>
    where
        F: Fn() -> Result<C> + Send + Sync + 'static,
    {
        Ok(Self {
            pool: ConnectionPool::new(factory, config)?,
        })
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut C) -> Result<T>) -> Result<T> {
        with_pooled(&self.pool, f)
    }
}

/// Run `f` on a pooled connection, discarding it on transport failure
pub(crate) fn with_pooled<C: Connection, T>(
    pool: &ConnectionPool<C>,
    f: impl FnOnce(&mut C) -> Result<T>,
) -> Result<T> {
    let mut conn = pool.get()?;
    let result = f(&mut *conn);
    if matches!(result, Err(StorageError::Transport(_))) {
        conn.discard();
    }
    result
}

/// Batched load on a pooled connection, discarding it if any chunk failed
pub(crate) fn pooled_get_many<C: Connection>(
    pool: &ConnectionPool<C>,
    key: &[u8],
    fields: &[Vec<u8>],
    sync_interval: usize,
) -> BatchGet {
    match pool.get() {
        Ok(mut conn) => {
            let result = pipelined_get(&mut *conn, key, fields, sync_interval);
            if !result.is_complete() {
                conn.discard();
            }
            result
        }
        Err(e) => {
            warn!(error = %e, fields = fields.len(), "no connection for batched load");
            BatchGet::all_failed(fields.len())
        }
    }
}

impl<C: Connection> StorageBackend for PooledBackend<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::Pooled
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
        pooled_get_many(&self.pool, key, fields, sync_interval)
    }

    fn commit(&self, batch: WriteBatch, _sync_interval: usize) -> Result<()> {
        self.with_conn(|c| transactional_commit(c, batch.commands()))
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn close(&self) -> Result<()> {
        debug!(backend = %self.kind(), "closing backend");
        self.pool.close()
    }
}

#[cfg(test)]
mod tests {
    use super::super::MemoryStore;
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn small_pool(store: &MemoryStore, max: usize) -> ConnectionPool<crate::backend::MemoryConnection> {
        let store = store.clone();
        ConnectionPool::new(
            move || Ok(store.connect()),
            PoolConfig {
                max_connections: max,
                checkout_timeout_ms: 50,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_connections_are_reused() {
        let store = MemoryStore::new();
        let pool = small_pool(&store, 2);
        {
            let _a = pool.get().unwrap();
        }
        {
            let _b = pool.get().unwrap();
        }
        assert_eq!(pool.live_connections(), 1);
        assert_eq!(pool.idle_connections(), 1);
    }

    #[test]
    fn test_checkout_times_out_when_exhausted() {
        let store = MemoryStore::new();
        let pool = small_pool(&store, 1);
        let _held = pool.get().unwrap();
        let err = pool.get().err().unwrap();
        assert!(err.is_transport());
    }

    #[test]
    fn test_discarded_connection_is_not_returned() {
        let store = MemoryStore::new();
        let pool = small_pool(&store, 2);
        {
            let mut conn = pool.get().unwrap();
            conn.discard();
        }
        assert_eq!(pool.live_connections(), 0);
        assert_eq!(pool.idle_connections(), 0);
    }

    #[test]
    fn test_factory_failure_releases_slot() {
        let pool: ConnectionPool<crate::backend::MemoryConnection> = ConnectionPool::new(
            || Err(StorageError::Transport("connection refused".into())),
            PoolConfig::default(),
        )
        .unwrap();
        assert!(pool.get().is_err());
        assert_eq!(pool.live_connections(), 0);
    }

    #[test]
    fn test_closed_pool_rejects_checkout() {
        let store = MemoryStore::new();
        let pool = small_pool(&store, 2);
        drop(pool.get().unwrap());
        pool.close().unwrap();
        assert_eq!(pool.live_connections(), 0);
        assert!(matches!(pool.get(), Err(StorageError::Closed(_))));
    }

    #[test]
    fn test_close_wakes_waiting_checkout() {
        let store = MemoryStore::new();
        let s = store.clone();
        let pool = ConnectionPool::new(
            move || Ok(s.connect()),
            PoolConfig {
                max_connections: 1,
                checkout_timeout_ms: 10_000,
            },
        )
        .unwrap();
        let held = pool.get().unwrap();

        thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let start = Instant::now();
                let result = pool.get().map(|_| ());
                (result, start.elapsed())
            });
            thread::sleep(Duration::from_millis(100));
            pool.close().unwrap();

            let (result, waited) = waiter.join().unwrap();
            assert!(matches!(result, Err(StorageError::Closed(_))));
            assert!(waited < Duration::from_secs(2), "waited {:?}", waited);
        });

        // a connection returned after close is closed, not parked
        drop(held);
        assert_eq!(pool.live_connections(), 0);
        assert_eq!(pool.idle_connections(), 0);
    }

    #[test]
    fn test_concurrent_backend_use() {
        let store = MemoryStore::new();
        let s = store.clone();
        let backend = Arc::new(
            PooledBackend::new(
                move || Ok(s.connect()),
                PoolConfig {
                    max_connections: 3,
                    checkout_timeout_ms: 5_000,
                },
            )
            .unwrap(),
        );

        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let backend = backend.clone();
                thread::spawn(move || {
                    for i in 0..20u8 {
                        backend.hset(b"h", &[t, i], &[i]).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.field_count(b"h"), 160);
        assert!(backend.pool().live_connections() <= 3);
    }
}
