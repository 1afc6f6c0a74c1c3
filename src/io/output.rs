//! Append-only writer
//!
//! Bytes accumulate in block-sized buffers owned by the cursor. Nothing
//! reaches the store until `close`, which hands the buffers to the block store
//! and commits them together with the catalog length; a file is therefore
//! either absent, its previous version, or the complete new content.

use super::DataOutput;
use crate::directory::Shared;
use crate::storage::{ChecksumBuilder, ChecksumType};
use crate::{Result, StorageError};
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct WriteCursor {
    name: String,
    shared: Arc<Shared>,
    buffers: Vec<Vec<u8>>,
    block_size: usize,
    position: u64,
    checksum: ChecksumBuilder,
    /// Bytes reserved in the directory's accounting for `buffers`
    allocated: i64,
    finished: bool,
}

impl WriteCursor {
    pub(crate) fn new(name: &str, shared: Arc<Shared>) -> Self {
        shared.register_output(name);
        Self {
            name: name.to_string(),
            block_size: shared.config.block_size,
            checksum: ChecksumBuilder::new(ChecksumType::from_enabled(shared.config.checksum)),
            shared,
            buffers: Vec::new(),
            position: 0,
            allocated: 0,
            finished: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes written so far (the length the file will have)
    pub fn file_pointer(&self) -> u64 {
        self.position
    }

    /// CRC32 of every byte written so far
    pub fn checksum(&self) -> Result<u32> {
        self.checksum.value().ok_or_else(|| {
            StorageError::InvalidState(format!("checksum tracking is disabled for output '{}'", self.name))
        })
    }

    pub fn write_byte(&mut self, b: u8) -> Result<()> {
        self.write_bytes(&[b])
    }

    pub fn write_bytes(&mut self, mut data: &[u8]) -> Result<()> {
        self.checksum.update(data);
        self.position += data.len() as u64;

        while !data.is_empty() {
            let full = self.buffers.last().map_or(true, |b| b.len() == self.block_size);
            if full {
                self.grow();
            }
            let Some(buffer) = self.buffers.last_mut() else {
                break;
            };
            let n = (self.block_size - buffer.len()).min(data.len());
            buffer.extend_from_slice(&data[..n]);
            data = &data[n..];
        }
        Ok(())
    }

    /// Persist the written bytes as the full content of the file
    ///
    /// An existing file under the same name is replaced, never merged.
    pub fn close(mut self) -> Result<()> {
        self.finished = true;
        let buffers = std::mem::take(&mut self.buffers);
        let result = self.shared.ensure_open("close output").and_then(|_| {
            self.shared
                .blocks
                .save(&self.name, buffers, self.position, &self.shared.catalog)
        });
        self.release();

        match &result {
            Ok(()) => debug!(name = %self.name, length = self.position, "output closed"),
            Err(e) => warn!(name = %self.name, length = self.position, error = %e, "output flush failed"),
        }
        result
    }

    fn grow(&mut self) {
        self.buffers.push(Vec::with_capacity(self.block_size));
        self.allocated += self.block_size as i64;
        self.shared.add_ram_bytes(self.block_size as i64);
    }

    fn release(&mut self) {
        self.shared.release_output(&self.name, self.allocated);
        self.allocated = 0;
    }
}

impl Drop for WriteCursor {
    fn drop(&mut self) {
        if !self.finished {
            warn!(name = %self.name, discarded = self.position, "output dropped without close");
            self.buffers.clear();
            self.release();
        }
    }
}

impl DataOutput for WriteCursor {
    fn write_byte(&mut self, b: u8) -> Result<()> {
        WriteCursor::write_byte(self, b)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        WriteCursor::write_bytes(self, buf)
    }
}

impl Write for WriteCursor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        WriteCursor::write_bytes(self, buf)?;
        Ok(buf.len())
    }

    /// Buffers are only persisted by `close`
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
