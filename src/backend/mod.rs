//! Key-value transport
//!
//! ## Layers
//! - **Connection**: one wire session speaking hash commands (`HGET`, `HSET`, ...)
//!   with pipelining and `MULTI`/`EXEC`-style transactions
//! - **StorageBackend**: the capability set the directory consumes, built on top of
//!   one or more connections
//!
//! ## Implementations
//! - `SingleConnectionBackend`: one connection behind a mutex
//! - `PooledBackend`: a bounded pool of connections
//! - `ShardedBackend`: one pool per shard, routed by table key
//! - `ClusterBackend`: one connection per node, no pipelining, no transactions
//!
//! The concrete network client is pluggable; `memory::MemoryConnection` is the
//! bundled in-process implementation.

pub mod cluster;
pub mod memory;
pub mod pool;
pub mod sharded;
pub mod single;

pub use cluster::ClusterBackend;
pub use memory::{MemoryConnection, MemoryStore};
pub use pool::{ConnectionPool, PooledBackend, PooledConnection};
pub use sharded::ShardedBackend;
pub use single::SingleConnectionBackend;

use crate::{Result, StorageError};
use std::fmt;
use tracing::warn;

/// Hash command sent over a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    HExists { key: Vec<u8>, field: Vec<u8> },
    HGet { key: Vec<u8>, field: Vec<u8> },
    HSet { key: Vec<u8>, field: Vec<u8>, value: Vec<u8> },
    HDel { key: Vec<u8>, fields: Vec<Vec<u8>> },
    HKeys { key: Vec<u8> },
}

impl Command {
    /// Hash key addressed by this command (used for shard routing)
    pub fn key(&self) -> &[u8] {
        match self {
            Command::HExists { key, .. }
            | Command::HGet { key, .. }
            | Command::HSet { key, .. }
            | Command::HDel { key, .. }
            | Command::HKeys { key } => key,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Command::HSet { .. } | Command::HDel { .. })
    }

    fn name(&self) -> &'static str {
        match self {
            Command::HExists { .. } => "HEXISTS",
            Command::HGet { .. } => "HGET",
            Command::HSet { .. } => "HSET",
            Command::HDel { .. } => "HDEL",
            Command::HKeys { .. } => "HKEYS",
        }
    }
}

/// Reply to a single command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Integer(i64),
    Bulk(Vec<u8>),
    Multi(Vec<Vec<u8>>),
}

impl Reply {
    pub fn into_bool(self) -> Result<bool> {
        match self {
            Reply::Integer(n) => Ok(n != 0),
            other => Err(unexpected("integer", &other)),
        }
    }

    pub fn into_integer(self) -> Result<i64> {
        match self {
            Reply::Integer(n) => Ok(n),
            other => Err(unexpected("integer", &other)),
        }
    }

    pub fn into_bytes(self) -> Result<Option<Vec<u8>>> {
        match self {
            Reply::Nil => Ok(None),
            Reply::Bulk(bytes) => Ok(Some(bytes)),
            other => Err(unexpected("bulk", &other)),
        }
    }

    pub fn into_list(self) -> Result<Vec<Vec<u8>>> {
        match self {
            Reply::Multi(items) => Ok(items),
            Reply::Nil => Ok(Vec::new()),
            other => Err(unexpected("multi-bulk", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Reply) -> StorageError {
    let shape = match got {
        Reply::Nil => "nil",
        Reply::Integer(_) => "integer",
        Reply::Bulk(_) => "bulk",
        Reply::Multi(_) => "multi-bulk",
    };
    StorageError::Transport(format!("expected {} reply, got {}", expected, shape))
}

/// One session with the key-value service
pub trait Connection: Send {
    /// Run one command and wait for its reply
    fn execute(&mut self, command: &Command) -> Result<Reply>;

    /// Send all commands, then collect all replies (one round trip)
    fn pipeline(&mut self, commands: &[Command]) -> Result<Vec<Reply>> {
        commands.iter().map(|c| self.execute(c)).collect()
    }

    /// Run all commands atomically; either every command applies or none does
    fn transaction(&mut self, commands: &[Command]) -> Result<Vec<Reply>>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Ordered list of write commands committed as one logical unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    commands: Vec<Command>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &[u8], field: Vec<u8>, value: Vec<u8>) -> &mut Self {
        self.commands.push(Command::HSet {
            key: key.to_vec(),
            field,
            value,
        });
        self
    }

    /// Queue a delete; an empty field list is ignored
    pub fn delete(&mut self, key: &[u8], fields: Vec<Vec<u8>>) -> &mut Self {
        if !fields.is_empty() {
            self.commands.push(Command::HDel {
                key: key.to_vec(),
                fields,
            });
        }
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Result of a batched multi-field read
///
/// `values` holds one slot per requested field in request order. Slots whose
/// round trip failed are `None` and their indices are listed in `failed`; a
/// `None` slot that is not in `failed` means the field is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchGet {
    pub values: Vec<Option<Vec<u8>>>,
    pub failed: Vec<usize>,
}

impl BatchGet {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            values: Vec::with_capacity(n),
            failed: Vec::new(),
        }
    }

    /// Every slot failed (e.g. no connection could be obtained)
    pub fn all_failed(n: usize) -> Self {
        Self {
            values: vec![None; n],
            failed: (0..n).collect(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn push_failed(&mut self) {
        self.failed.push(self.values.len());
        self.values.push(None);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Single,
    Pooled,
    Sharded,
    Cluster,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::Single => "single",
            BackendKind::Pooled => "pooled",
            BackendKind::Sharded => "sharded",
            BackendKind::Cluster => "cluster",
        };
        f.write_str(s)
    }
}

/// Hash-map capability set consumed by the directory
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn hexists(&self, key: &[u8], field: &[u8]) -> Result<bool>;

    fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Returns true when the field was newly created
    fn hset(&self, key: &[u8], field: &[u8], value: &[u8]) -> Result<bool>;

    /// Returns the number of fields actually removed
    fn hdel(&self, key: &[u8], fields: &[Vec<u8>]) -> Result<u64>;

    fn hkeys(&self, key: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Fetch many fields of one hash with at most `sync_interval` requests in
    /// flight; failures are logged and recorded in the result
    fn hget_many(&self, key: &[u8], fields: &[Vec<u8>], sync_interval: usize) -> BatchGet;

    /// Apply `batch` atomically where supported, otherwise in order
    fn commit(&self, batch: WriteBatch, sync_interval: usize) -> Result<()>;

    fn supports_transactions(&self) -> bool;

    fn close(&self) -> Result<()>;
}

pub(crate) fn run_hexists<C: Connection + ?Sized>(conn: &mut C, key: &[u8], field: &[u8]) -> Result<bool> {
    conn.execute(&Command::HExists {
        key: key.to_vec(),
        field: field.to_vec(),
    })?
    .into_bool()
}

pub(crate) fn run_hget<C: Connection + ?Sized>(
    conn: &mut C,
    key: &[u8],
    field: &[u8],
) -> Result<Option<Vec<u8>>> {
    conn.execute(&Command::HGet {
        key: key.to_vec(),
        field: field.to_vec(),
    })?
    .into_bytes()
}

pub(crate) fn run_hset<C: Connection + ?Sized>(
    conn: &mut C,
    key: &[u8],
    field: &[u8],
    value: &[u8],
) -> Result<bool> {
    conn.execute(&Command::HSet {
        key: key.to_vec(),
        field: field.to_vec(),
        value: value.to_vec(),
    })?
    .into_bool()
}

pub(crate) fn run_hdel<C: Connection + ?Sized>(conn: &mut C, key: &[u8], fields: &[Vec<u8>]) -> Result<u64> {
    if fields.is_empty() {
        return Ok(0);
    }
    let removed = conn
        .execute(&Command::HDel {
            key: key.to_vec(),
            fields: fields.to_vec(),
        })?
        .into_integer()?;
    Ok(removed.max(0) as u64)
}

pub(crate) fn run_hkeys<C: Connection + ?Sized>(conn: &mut C, key: &[u8]) -> Result<Vec<Vec<u8>>> {
    conn.execute(&Command::HKeys { key: key.to_vec() })?.into_list()
}

/// Pipelined multi-get with a forced sync every `sync_interval` requests
///
/// Each chunk is sent, synced and drained into the result before the next one
/// is queued, so no more than `sync_interval` replies are ever buffered.
pub(crate) fn pipelined_get<C: Connection + ?Sized>(
    conn: &mut C,
    key: &[u8],
    fields: &[Vec<u8>],
    sync_interval: usize,
) -> BatchGet {
    let interval = sync_interval.max(1);
    let mut result = BatchGet::with_capacity(fields.len());

    for chunk in fields.chunks(interval) {
        let commands: Vec<Command> = chunk
            .iter()
            .map(|field| Command::HGet {
                key: key.to_vec(),
                field: field.clone(),
            })
            .collect();

        match conn.pipeline(&commands) {
            Ok(replies) if replies.len() == commands.len() => {
                for reply in replies {
                    match reply.into_bytes() {
                        Ok(value) => result.values.push(value),
                        Err(e) => {
                            warn!(index = result.values.len(), error = %e, "bad reply in batched load");
                            result.push_failed();
                        }
                    }
                }
            }
            Ok(replies) => {
                warn!(
                    sent = commands.len(),
                    received = replies.len(),
                    "pipeline reply count mismatch in batched load"
                );
                for _ in chunk {
                    result.push_failed();
                }
            }
            Err(e) => {
                warn!(
                    start = result.values.len(),
                    count = chunk.len(),
                    total = fields.len(),
                    error = %e,
                    "pipeline sync failed in batched load"
                );
                for _ in chunk {
                    result.push_failed();
                }
            }
        }
    }

    result
}

/// Run `commands` in order, pipelined `sync_interval` at a time
pub(crate) fn pipelined_commit<C: Connection + ?Sized>(
    conn: &mut C,
    commands: &[Command],
    sync_interval: usize,
) -> Result<()> {
    for chunk in commands.chunks(sync_interval.max(1)) {
        let replies = conn.pipeline(chunk)?;
        verify_write_replies(chunk, replies)?;
    }
    Ok(())
}

/// Run `commands` as one transaction
pub(crate) fn transactional_commit<C: Connection + ?Sized>(conn: &mut C, commands: &[Command]) -> Result<()> {
    if commands.is_empty() {
        return Ok(());
    }
    let replies = conn.transaction(commands)?;
    verify_write_replies(commands, replies)
}

/// Every write must have produced an integer reply
fn verify_write_replies(commands: &[Command], replies: Vec<Reply>) -> Result<()> {
    if replies.len() != commands.len() {
        return Err(StorageError::Transport(format!(
            "commit aborted: {} commands sent, {} replies received",
            commands.len(),
            replies.len()
        )));
    }
    for (command, reply) in commands.iter().zip(replies) {
        if !matches!(reply, Reply::Integer(_)) {
            return Err(StorageError::Transport(format!(
                "{} on '{}' did not complete: {:?}",
                command.name(),
                String::from_utf8_lossy(command.key()),
                reply
            )));
        }
    }
    Ok(())
}

/// Stable routing of a hash key onto one of `n` shards / nodes
pub(crate) fn slot_for(key: &[u8], n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    crc32fast::hash(key) as usize % n
}
