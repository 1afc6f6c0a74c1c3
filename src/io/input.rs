//! Random-access reader
//!
//! The whole file is fetched when the cursor is opened; reads never touch the
//! store. Clones and slices share the loaded blocks and keep their own
//! position, so any number of them can be read from different threads.

use super::DataInput;
use crate::storage::LoadedFile;
use crate::{Result, StorageError};
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ReadCursor {
    description: String,
    /// `None` once closed
    file: Option<Arc<LoadedFile>>,
    /// Absolute start of this view inside the file
    base: u64,
    length: u64,
    /// Position relative to `base`
    position: u64,
}

impl ReadCursor {
    pub fn new(description: impl Into<String>, file: LoadedFile) -> Self {
        let length = file.len();
        Self {
            description: description.into(),
            file: Some(Arc::new(file)),
            base: 0,
            length,
            position: 0,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Length of this view (the slice length for slices)
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn file_pointer(&self) -> u64 {
        self.position
    }

    pub fn remaining(&self) -> u64 {
        self.length - self.position
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        if self.position >= self.length {
            return Err(StorageError::EndOfStream(format!(
                "read past EOF: {} (length {})",
                self.description, self.length
            )));
        }
        let file = self.file()?;
        let absolute = self.base + self.position;
        let block_size = file.block_size() as u64;
        let byte = file.block((absolute / block_size) as usize)[(absolute % block_size) as usize];
        self.position += 1;
        Ok(byte)
    }

    /// Fill `buf`, crossing block boundaries as needed; fails without reading
    /// anything when fewer than `buf.len()` bytes remain
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.len() as u64 > self.remaining() {
            return Err(StorageError::EndOfStream(format!(
                "read of {} bytes past EOF at {}: {} (length {})",
                buf.len(),
                self.position,
                self.description,
                self.length
            )));
        }
        let file = self.file()?.clone();
        let block_size = file.block_size() as u64;

        let mut copied = 0;
        while copied < buf.len() {
            let absolute = self.base + self.position;
            let block = file.block((absolute / block_size) as usize);
            let offset = (absolute % block_size) as usize;
            let n = (block.len() - offset).min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&block[offset..offset + n]);
            copied += n;
            self.position += n as u64;
        }
        Ok(())
    }

    pub fn seek(&mut self, position: u64) -> Result<()> {
        if position > self.length {
            return Err(StorageError::OutOfRange(format!(
                "seek to {} past EOF: {} (length {})",
                position, self.description, self.length
            )));
        }
        self.file()?;
        self.position = position;
        Ok(())
    }

    /// View of `[offset, offset + length)` sharing this cursor's blocks
    pub fn slice(&self, description: &str, offset: u64, length: u64) -> Result<ReadCursor> {
        let file = self.file()?.clone();
        let in_bounds = offset.checked_add(length).is_some_and(|end| end <= self.length);
        if !in_bounds {
            return Err(StorageError::OutOfRange(format!(
                "slice() {} out of bounds: offset={}, length={}, file length={}: {}",
                description, offset, length, self.length, self.description
            )));
        }
        Ok(ReadCursor {
            description: format!("{} [slice={}]", self.description, description),
            file: Some(file),
            base: self.base + offset,
            length,
            position: 0,
        })
    }

    /// Drop this view's reference to the loaded blocks; idempotent
    pub fn close(&mut self) {
        self.file = None;
    }

    fn file(&self) -> Result<&Arc<LoadedFile>> {
        self.file
            .as_ref()
            .ok_or_else(|| StorageError::Closed(format!("read cursor {}", self.description)))
    }
}

impl DataInput for ReadCursor {
    fn read_byte(&mut self) -> Result<u8> {
        ReadCursor::read_byte(self)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        ReadCursor::read_bytes(self, buf)
    }
}

impl Read for ReadCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (buf.len() as u64).min(self.remaining()) as usize;
        ReadCursor::read_bytes(self, &mut buf[..n])?;
        Ok(n)
    }
}

impl Seek for ReadCursor {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(delta) => self.length.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")
        })?;
        ReadCursor::seek(self, target)?;
        Ok(target)
    }
}
