//! Binary codec for stored records.
//!
//! Every value handed to a [`crate::storage::DataDb`] and every WAL frame uses
//! the same envelope:
//!
//! ```text
//! [version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
//! ```
//!
//! Corruption is detected on read, never silently accepted.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

use super::StorageError;

/// Current codec version.
const CODEC_VERSION: u8 = 1;

/// Magic bytes at the start of cgmon files.
pub const MAGIC: [u8; 4] = *b"CGMN";

/// Largest accepted payload.
const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn frame(data: &[u8]) -> IoResult<Vec<u8>> {
    let len = u32::try_from(data.len())
        .map_err(|_| IoError::new(ErrorKind::InvalidInput, "entry too large to frame"))?;
    let mut out = Vec::with_capacity(1 + 4 + data.len() + 4);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(&checksum(data).to_le_bytes());
    Ok(out)
}

/// Serializes a value into a checksummed frame.
///
/// # Errors
///
/// Fails if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;
    frame(&data)
}

/// Reads one frame from `reader`, verifying version, size and checksum.
///
/// # Errors
///
/// `UnexpectedEof` on a truncated frame, `InvalidData` on corruption.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported codec version: {} (expected {CODEC_VERSION})", version[0]),
        ));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_ENTRY_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("entry size {len} exceeds maximum {MAX_ENTRY_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored = u32::from_le_bytes(crc_bytes);
    let computed = checksum(&data);
    if stored != computed {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("CRC mismatch: stored={stored:08x}, computed={computed:08x}"),
        ));
    }

    serde_json::from_slice(&data)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))
}

/// Encodes a record for storage.
///
/// # Errors
///
/// `SerializationError` if the value cannot be serialized.
pub fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    encode(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

/// Decodes a stored record. Trailing bytes are rejected.
///
/// # Errors
///
/// `SerializationError` on corruption or schema mismatch.
pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    let mut cursor = std::io::Cursor::new(bytes);
    let value = decode(&mut cursor).map_err(|e| StorageError::SerializationError(e.to_string()))?;
    if usize::try_from(cursor.position()).ok() != Some(bytes.len()) {
        return Err(StorageError::SerializationError(
            "trailing bytes after record".to_string(),
        ));
    }
    Ok(value)
}

/// Write the file header (magic + version).
///
/// # Errors
///
/// Propagates write failures.
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])?;
    Ok(())
}

/// Read and validate the file header.
///
/// # Errors
///
/// `InvalidData` if the magic bytes do not match.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}"),
        ));
    }
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    Ok(version[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_record_roundtrip() {
        let value = serde_json::json!({"tenant": "cgrates.org", "id": "SQ1"});
        let bytes = encode_record(&value).unwrap();
        let decoded: serde_json::Value = decode_record(&bytes).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn test_detects_corruption() {
        let mut bytes = encode_record(&"some stored value".to_string()).unwrap();
        bytes[8] ^= 0xFF;
        let err = decode_record::<String>(&bytes).unwrap_err();
        assert!(matches!(err, StorageError::SerializationError(_)));
    }

    #[test]
    fn test_rejects_oversized_entry() {
        let mut bad = vec![CODEC_VERSION];
        bad.extend_from_slice(&(200_000_000u32).to_le_bytes());
        let result: IoResult<String> = decode(&mut Cursor::new(bad));
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut bytes = encode_record(&1u32).unwrap();
        bytes.push(0);
        assert!(decode_record::<u32>(&bytes).is_err());
    }

    #[test]
    fn test_header_roundtrip() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        assert_eq!(read_header(&mut Cursor::new(buf)).unwrap(), CODEC_VERSION);
        assert!(read_header(&mut Cursor::new(b"ABCD\x01".to_vec())).is_err());
    }
}
