//! Cursors over directory files
//!
//! `ReadCursor` is a random-access reader over a file loaded once into memory;
//! `WriteCursor` appends into block buffers and persists them on close.
//! Both speak the typed encodings of `DataInput` / `DataOutput`:
//!
//! - fixed-width integers are big-endian
//! - `vint` / `vlong` are 7-bit groups, low group first, high bit = continuation
//! - strings are a `vint` byte length followed by UTF-8

pub mod input;
pub mod output;

pub use input::ReadCursor;
pub use output::WriteCursor;

use crate::{Result, StorageError};

/// Longest `vint` (32 bits / 7)
const MAX_VINT_BYTES: usize = 5;
/// Longest `vlong` (64 bits / 7)
const MAX_VLONG_BYTES: usize = 10;

pub trait DataInput {
    fn read_byte(&mut self) -> Result<u8>;

    /// Fill `buf` completely or fail without a partial read
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()>;

    fn read_i16(&mut self) -> Result<i16> {
        let mut b = [0u8; 2];
        self.read_bytes(&mut b)?;
        Ok(i16::from_be_bytes(b))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.read_bytes(&mut b)?;
        Ok(i32::from_be_bytes(b))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.read_bytes(&mut b)?;
        Ok(i64::from_be_bytes(b))
    }

    fn read_vint(&mut self) -> Result<i32> {
        Ok(read_varint(self, MAX_VINT_BYTES)? as u32 as i32)
    }

    fn read_vlong(&mut self) -> Result<i64> {
        Ok(read_varint(self, MAX_VLONG_BYTES)? as i64)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_vint()?;
        if len < 0 {
            return Err(StorageError::Codec(format!("negative string length {}", len)));
        }
        let mut bytes = vec![0u8; len as usize];
        self.read_bytes(&mut bytes)?;
        String::from_utf8(bytes).map_err(|e| StorageError::Codec(format!("string is not UTF-8: {}", e)))
    }
}

pub trait DataOutput {
    fn write_byte(&mut self, b: u8) -> Result<()>;

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()>;

    fn write_i16(&mut self, v: i16) -> Result<()> {
        self.write_bytes(&v.to_be_bytes())
    }

    fn write_i32(&mut self, v: i32) -> Result<()> {
        self.write_bytes(&v.to_be_bytes())
    }

    fn write_i64(&mut self, v: i64) -> Result<()> {
        self.write_bytes(&v.to_be_bytes())
    }

    /// Negative values always take five bytes
    fn write_vint(&mut self, v: i32) -> Result<()> {
        self.write_bytes(&encode_varint(v as u32 as u64))
    }

    fn write_vlong(&mut self, v: i64) -> Result<()> {
        self.write_bytes(&encode_varint(v as u64))
    }

    fn write_string(&mut self, s: &str) -> Result<()> {
        let len = i32::try_from(s.len())
            .map_err(|_| StorageError::InvalidArgument(format!("string of {} bytes is too long", s.len())))?;
        self.write_vint(len)?;
        self.write_bytes(s.as_bytes())
    }
}

fn encode_varint(mut value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(MAX_VLONG_BYTES);
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            bytes.push(byte);
            return bytes;
        }
        bytes.push(byte | 0x80);
    }
}

fn read_varint<I: DataInput + ?Sized>(input: &mut I, max_bytes: usize) -> Result<u64> {
    let mut value = 0u64;
    for i in 0..max_bytes {
        let byte = input.read_byte()?;
        value |= ((byte & 0x7F) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(StorageError::Codec(format!("variable-length integer longer than {} bytes", max_bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory stand-in so the encodings can be checked without a store
    #[derive(Default)]
    struct Bytes {
        data: Vec<u8>,
        pos: usize,
    }

    impl DataInput for Bytes {
        fn read_byte(&mut self) -> Result<u8> {
            let b = *self
                .data
                .get(self.pos)
                .ok_or_else(|| StorageError::EndOfStream("bytes".into()))?;
            self.pos += 1;
            Ok(b)
        }

        fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
            let end = self.pos + buf.len();
            if end > self.data.len() {
                return Err(StorageError::EndOfStream("bytes".into()));
            }
            buf.copy_from_slice(&self.data[self.pos..end]);
            self.pos = end;
            Ok(())
        }
    }

    impl DataOutput for Bytes {
        fn write_byte(&mut self, b: u8) -> Result<()> {
            self.data.push(b);
            Ok(())
        }

        fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
            self.data.extend_from_slice(buf);
            Ok(())
        }
    }

    #[test]
    fn test_vint_wire_format() {
        let mut out = Bytes::default();
        out.write_vint(300).unwrap();
        assert_eq!(out.data, vec![0xAC, 0x02]);

        let mut out = Bytes::default();
        out.write_vint(-1).unwrap();
        assert_eq!(out.data, vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
        assert_eq!(out.read_vint().unwrap(), -1);
    }

    #[test]
    fn test_fixed_width_is_big_endian() {
        let mut out = Bytes::default();
        out.write_i32(0x0102_0304).unwrap();
        out.write_i16(-2).unwrap();
        assert_eq!(out.data, vec![1, 2, 3, 4, 0xFF, 0xFE]);
        assert_eq!(out.read_i32().unwrap(), 0x0102_0304);
        assert_eq!(out.read_i16().unwrap(), -2);
    }

    #[test]
    fn test_mixed_record() {
        let mut out = Bytes::default();
        out.write_string("segments_2").unwrap();
        out.write_vlong(i64::MAX).unwrap();
        out.write_i64(-7).unwrap();

        assert_eq!(out.read_string().unwrap(), "segments_2");
        assert_eq!(out.read_vlong().unwrap(), i64::MAX);
        assert_eq!(out.read_i64().unwrap(), -7);
        assert!(matches!(out.read_byte(), Err(StorageError::EndOfStream(_))));
    }

    #[test]
    fn test_overlong_vint_rejected() {
        let mut input = Bytes {
            data: vec![0x80; 6],
            pos: 0,
        };
        assert!(matches!(input.read_vint(), Err(StorageError::Codec(_))));
    }
}
