//! In-process hash store
//!
//! Behaves like a single key-value server: many connections share one store,
//! pipelines apply command by command, transactions apply under one write lock.

use super::{Command, Connection, Reply};
use crate::{Result, StorageError};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;

type Hash = AHashMap<Vec<u8>, Vec<u8>>;

/// Shared in-memory keyspace: hash key -> (field -> value)
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<AHashMap<Vec<u8>, Hash>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session against this store
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            store: self.clone(),
            open: true,
        }
    }

    /// Number of fields in one hash
    pub fn field_count(&self, key: &[u8]) -> usize {
        self.data.read().get(key).map_or(0, |h| h.len())
    }

    pub fn fields(&self, key: &[u8]) -> Vec<Vec<u8>> {
        self.data
            .read()
            .get(key)
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, key: &[u8], field: &[u8]) -> Option<Vec<u8>> {
        self.data.read().get(key).and_then(|h| h.get(field).cloned())
    }

    /// Write a field directly, bypassing any connection
    pub fn put(&self, key: &[u8], field: &[u8], value: Vec<u8>) {
        self.data
            .write()
            .entry(key.to_vec())
            .or_default()
            .insert(field.to_vec(), value);
    }

    pub fn remove(&self, key: &[u8], field: &[u8]) -> Option<Vec<u8>> {
        let mut data = self.data.write();
        let removed = data.get_mut(key).and_then(|h| h.remove(field));
        if data.get(key).is_some_and(|h| h.is_empty()) {
            data.remove(key);
        }
        removed
    }

    fn read(data: &AHashMap<Vec<u8>, Hash>, command: &Command) -> Option<Reply> {
        let reply = match command {
            Command::HExists { key, field } => {
                let found = data.get(key).is_some_and(|h| h.contains_key(field));
                Reply::Integer(found as i64)
            }
            Command::HGet { key, field } => match data.get(key).and_then(|h| h.get(field)) {
                Some(v) => Reply::Bulk(v.clone()),
                None => Reply::Nil,
            },
            Command::HKeys { key } => {
                Reply::Multi(data.get(key).map(|h| h.keys().cloned().collect()).unwrap_or_default())
            }
            Command::HSet { .. } | Command::HDel { .. } => return None,
        };
        Some(reply)
    }

    fn apply(data: &mut AHashMap<Vec<u8>, Hash>, command: &Command) -> Reply {
        match command {
            Command::HSet { key, field, value } => {
                let hash = data.entry(key.clone()).or_default();
                let created = hash.insert(field.clone(), value.clone()).is_none();
                Reply::Integer(created as i64)
            }
            Command::HDel { key, fields } => {
                let mut removed = 0i64;
                if let Some(hash) = data.get_mut(key) {
                    for field in fields {
                        if hash.remove(field).is_some() {
                            removed += 1;
                        }
                    }
                    if hash.is_empty() {
                        data.remove(key);
                    }
                }
                Reply::Integer(removed)
            }
            read => Self::read(data, read).unwrap_or(Reply::Nil),
        }
    }
}

/// One session against a `MemoryStore`
pub struct MemoryConnection {
    store: MemoryStore,
    open: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(StorageError::Transport("connection closed".into()))
        }
    }
}

impl Connection for MemoryConnection {
    fn execute(&mut self, command: &Command) -> Result<Reply> {
        self.ensure_open()?;
        if !command.is_write() {
            if let Some(reply) = MemoryStore::read(&self.store.data.read(), command) {
                return Ok(reply);
            }
        }
        Ok(MemoryStore::apply(&mut self.store.data.write(), command))
    }

    fn transaction(&mut self, commands: &[Command]) -> Result<Vec<Reply>> {
        self.ensure_open()?;
        let mut data = self.store.data.write();
        Ok(commands.iter().map(|c| MemoryStore::apply(&mut data, c)).collect())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}
