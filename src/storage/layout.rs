//! Key layout and block arithmetic shared by the catalog and block store

use crate::{Result, StorageError};

/// Width of a persisted file length
pub const LENGTH_BYTES: usize = 8;

/// Largest block count a single file may have
pub const MAX_BLOCKS_PER_FILE: u64 = i32::MAX as u64;

/// Hash field of block `index` of file `name`: `@<name>:<index>`
pub fn block_key(name: &str, index: u64) -> Vec<u8> {
    format!("@{}:{}", name, index).into_bytes()
}

/// Inverse of `block_key`; names may themselves contain `:`
pub fn parse_block_key(key: &[u8]) -> Option<(String, u64)> {
    let text = std::str::from_utf8(key).ok()?;
    let rest = text.strip_prefix('@')?;
    let (name, index) = rest.rsplit_once(':')?;
    Some((name.to_string(), index.parse().ok()?))
}

/// Blocks needed to hold `length` bytes
pub fn block_count(length: u64, block_size: usize) -> u64 {
    let block_size = block_size as u64;
    length.div_ceil(block_size)
}

/// `block_count` for a length read from the catalog; a length needing more
/// than `MAX_BLOCKS_PER_FILE` blocks can only come from a damaged entry
pub fn checked_block_count(name: &str, length: u64, block_size: usize) -> Result<u64> {
    let count = block_count(length, block_size);
    if count > MAX_BLOCKS_PER_FILE {
        return Err(StorageError::ConsistencyViolation(format!(
            "'{}' claims {} bytes ({} blocks), more than {} blocks per file",
            name, length, count, MAX_BLOCKS_PER_FILE
        )));
    }
    Ok(count)
}

/// Logical bytes of block `index` in a file of `length` bytes
pub fn block_len(length: u64, block_size: usize, index: u64) -> usize {
    let start = index * block_size as u64;
    length.saturating_sub(start).min(block_size as u64) as usize
}

pub fn encode_length(length: u64) -> Vec<u8> {
    length.to_be_bytes().to_vec()
}

pub fn decode_length(name: &str, raw: &[u8]) -> Result<u64> {
    let bytes: [u8; LENGTH_BYTES] = raw.try_into().map_err(|_| {
        StorageError::ConsistencyViolation(format!(
            "length of '{}' is {} bytes wide, expected {}",
            name,
            raw.len(),
            LENGTH_BYTES
        ))
    })?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_key_format() {
        assert_eq!(block_key("_0.cfs", 3), b"@_0.cfs:3".to_vec());
        assert_eq!(parse_block_key(b"@_0.cfs:3"), Some(("_0.cfs".to_string(), 3)));
        assert_eq!(parse_block_key(b"@a:b:12"), Some(("a:b".to_string(), 12)));
        assert_eq!(parse_block_key(b"_0.cfs:3"), None);
        assert_eq!(parse_block_key(b"@name:x"), None);
    }

    #[test]
    fn test_block_count_edges() {
        assert_eq!(block_count(0, 1024), 0);
        assert_eq!(block_count(1, 1024), 1);
        assert_eq!(block_count(1023, 1024), 1);
        assert_eq!(block_count(1024, 1024), 1);
        assert_eq!(block_count(1025, 1024), 2);
        assert_eq!(block_count(10 * 1024 + 7, 1024), 11);
    }

    #[test]
    fn test_checked_block_count_bounds() {
        let limit = MAX_BLOCKS_PER_FILE * 1024;
        assert_eq!(checked_block_count("f", 2500, 1024).unwrap(), 3);
        assert_eq!(checked_block_count("f", limit, 1024).unwrap(), MAX_BLOCKS_PER_FILE);
        assert!(matches!(
            checked_block_count("f", limit + 1, 1024),
            Err(StorageError::ConsistencyViolation(_))
        ));
        assert!(checked_block_count("f", u64::MAX, 1024).is_err());
    }

    #[test]
    fn test_last_block_is_short() {
        assert_eq!(block_len(2500, 1024, 0), 1024);
        assert_eq!(block_len(2500, 1024, 2), 452);
        assert_eq!(block_len(2500, 1024, 3), 0);
    }

    #[test]
    fn test_length_is_big_endian() {
        assert_eq!(encode_length(258), vec![0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(decode_length("f", &encode_length(258)).unwrap(), 258);
        assert!(matches!(
            decode_length("f", &[1, 2, 3]),
            Err(StorageError::ConsistencyViolation(_))
        ));
    }
}
