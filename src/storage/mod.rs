//! Storage layer
//!
//! Two hash tables in the backing store:
//! - **catalog**: file name -> 8-byte big-endian length
//! - **blocks**: `@<name>:<index>` -> block bytes (optionally snappy-compressed)
//!
//! For every name in the catalog the block table holds exactly
//! `ceil(length / block_size)` blocks, and no block exists for an absent name.
//! Every mutation touching both tables goes out as one `WriteBatch`.

pub mod block_store;
pub mod catalog;
pub mod checksum;
pub mod codec;
pub mod layout;

pub use block_store::{BlockStore, LoadedFile};
pub use catalog::FileCatalog;
pub use checksum::{Checksum, ChecksumBuilder, ChecksumType};
pub use codec::BlockCodec;
