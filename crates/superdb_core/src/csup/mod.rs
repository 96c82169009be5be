//! CSUP, the columnar object format.
//!
//! An object is a fixed-size header, a metadata section holding the column
//! tree as BSUP values, and a data section of (possibly compressed)
//! segments referenced from the metadata.
pub mod encoder;
pub mod metadata;
pub mod reader;
pub mod writer;

use bytes::Bytes;
use superdb_error::{DbError, Result};

pub use metadata::{Metadata, Segment};
pub use reader::{Object, Reader};
pub use writer::Writer;

pub const MAGIC: &[u8; 4] = b"VNG\0";
pub const VERSION: u32 = 12;
pub const HEADER_SIZE: usize = 28;
pub const MAX_META_SIZE: u64 = 100 * 1024 * 1024;
pub const MAX_DATA_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Values per object before the writer starts a new one.
pub const DEFAULT_OBJECT_VALUES: usize = 120_000;

pub const COMPRESSION_NONE: u32 = 0;
pub const COMPRESSION_LZ4: u32 = 1;

/// Segments smaller than this are stored uncompressed.
const MIN_COMPRESS_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub meta_size: u64,
    pub data_size: u64,
    pub root: u32,
}

impl Header {
    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(MAGIC);
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..16].copy_from_slice(&self.meta_size.to_le_bytes());
        out[16..24].copy_from_slice(&self.data_size.to_le_bytes());
        out[24..28].copy_from_slice(&self.root.to_le_bytes());
        out
    }

    pub fn deserialize(buf: &[u8]) -> Result<Header> {
        if buf.len() < HEADER_SIZE || &buf[0..4] != MAGIC {
            return Err(DbError::format("invalid CSUP header"));
        }
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i..i + 8]);
            u64::from_le_bytes(b)
        };
        let header = Header {
            version: u32_at(4),
            meta_size: u64_at(8),
            data_size: u64_at(16),
            root: u32_at(24),
        };
        if header.version != VERSION {
            return Err(DbError::format(format!(
                "unsupported CSUP version {} (expected {VERSION})",
                header.version
            )));
        }
        if header.meta_size > MAX_META_SIZE {
            return Err(DbError::format("CSUP metadata section too big"));
        }
        if header.data_size > MAX_DATA_SIZE {
            return Err(DbError::format("CSUP data section too big"));
        }
        Ok(header)
    }
}

pub fn detect(buf: &[u8]) -> bool {
    buf.len() >= HEADER_SIZE && &buf[0..4] == MAGIC
}

/// Compresses a segment when that makes it smaller.
pub(crate) fn compress(raw: &[u8]) -> (Vec<u8>, u32) {
    if raw.len() >= MIN_COMPRESS_SIZE {
        let c = lz4_flex::block::compress(raw);
        if c.len() < raw.len() {
            return (c, COMPRESSION_LZ4);
        }
    }
    (raw.to_vec(), COMPRESSION_NONE)
}

impl Segment {
    /// Reads and decompresses the segment from an object's data section.
    pub fn read(&self, data: &Bytes) -> Result<Bytes> {
        let start = self.offset as usize;
        let end = start
            .checked_add(self.length as usize)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| DbError::format("CSUP segment out of bounds"))?;
        let raw = data.slice(start..end);
        match self.compression_format {
            COMPRESSION_NONE => Ok(raw),
            COMPRESSION_LZ4 => {
                // LZ4 blocks expand at most 255x.
                if self.mem_length > self.length.saturating_mul(255) {
                    return Err(DbError::format(format!(
                        "CSUP segment decompresses to {} bytes from {}",
                        self.mem_length, self.length
                    )));
                }
                let out = lz4_flex::block::decompress(&raw, self.mem_length as usize)
                    .map_err(|e| DbError::with_source("corrupt CSUP segment", Box::new(e)))?;
                Ok(Bytes::from(out))
            }
            other => Err(DbError::format(format!("unknown CSUP compression format {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_segment_length_rejected() {
        let (compressed, format) = compress(&[7u8; 4096]);
        assert_eq!(COMPRESSION_LZ4, format);
        let data = Bytes::from(compressed.clone());
        let mut seg = Segment {
            offset: 0,
            length: compressed.len() as u64,
            mem_length: 4096,
            compression_format: format,
        };
        assert_eq!(&[7u8; 4096][..], &seg.read(&data).unwrap()[..]);

        seg.mem_length = 1 << 40;
        let err = seg.read(&data).unwrap_err();
        assert!(err.to_string().contains("decompresses to"));
    }

    #[test]
    fn header_round_trip_and_bounds() {
        let h = Header {
            version: VERSION,
            meta_size: 10,
            data_size: 20,
            root: 3,
        };
        let buf = h.serialize();
        assert!(detect(&buf));
        assert_eq!(h, Header::deserialize(&buf).unwrap());

        let mut bad = h;
        bad.version = 11;
        let err = Header::deserialize(&bad.serialize()).unwrap_err();
        assert!(err.to_string().contains("unsupported CSUP version"));

        bad = h;
        bad.meta_size = MAX_META_SIZE + 1;
        let err = Header::deserialize(&bad.serialize()).unwrap_err();
        assert!(err.to_string().contains("metadata section too big"));

        bad = h;
        bad.data_size = MAX_DATA_SIZE + 1;
        let err = Header::deserialize(&bad.serialize()).unwrap_err();
        assert!(err.to_string().contains("data section too big"));

        assert!(Header::deserialize(b"nope").unwrap_err().to_string().contains("invalid CSUP header"));
    }
}
