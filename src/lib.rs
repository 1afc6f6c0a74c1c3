//! kvdir: block-chunked virtual files in a hash key-value store
//!
//! Files are split into fixed-size blocks, each stored as one field of a hash
//! table in a remote key-value service; a second hash maps file names to
//! lengths. Files are written sequentially and read with random access.
//!
//! ## Layers
//! - **backend**: hash-command transport (single connection, pool, shards, cluster)
//! - **storage**: catalog, block store, codec, key layout
//! - **io**: read / write cursors
//! - **lock**: advisory file locks
//! - **directory**: `KvDirectory`, the public entry point
//!
//! ## Example
//! ```ignore
//! use kvdir::backend::{MemoryStore, SingleConnectionBackend};
//! use kvdir::{DirectoryConfig, KvDirectory};
//! use std::sync::Arc;
//!
//! let store = MemoryStore::new();
//! let dir = KvDirectory::open(
//!     Arc::new(SingleConnectionBackend::new(store.connect())),
//!     DirectoryConfig::default(),
//! )?;
//!
//! let mut out = dir.create_output("_0.cfs")?;
//! out.write_bytes(b"hello")?;
//! out.close()?;
//!
//! let mut input = dir.open_input("_0.cfs")?;
//! assert_eq!(input.read_byte()?, b'h');
//! ```

pub mod backend;
pub mod config;
pub mod directory;
pub mod io;
pub mod lock;
pub mod storage;

mod error;

pub use backend::{BackendKind, Connection, StorageBackend};
pub use config::{DirectoryConfig, PoolConfig};
pub use directory::{ConsistencyReport, KvDirectory};
pub use error::{Result, StorageError};
pub use io::{DataInput, DataOutput, ReadCursor, WriteCursor};
pub use lock::{HeldLock, LockFingerprint, LockManager};
