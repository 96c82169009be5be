//! BSUP: the binary row format with inline type definitions.
//!
//! A stream is a sequence of frames. Each frame starts with a header byte:
//! bits 0-3 hold the low bits of the payload length, bits 4-5 the frame
//! kind, bit 6 is set for compressed payloads and bit 7 (the version) must
//! be zero. The remaining length bits follow as a uvarint.
//!
//! A compressed payload starts with the uvarint compression format and the
//! uvarint uncompressed size.
//!
//! Type frames define complex types with stream-local ids starting at 30.
//! Value frames hold a sequence of `uvarint(type id)` plus tagged body. An
//! end-of-stream frame discards the local types so streams concatenate.
pub mod reader;
pub mod scanner;
pub mod writer;

use superdb_error::{DbError, Result};

use crate::value::scode::{append_uvarint, read_uvarint};

pub use reader::{Frame, FrameReader, Reader};
pub use scanner::{Scanner, ScannerOptions};
pub use writer::Writer;

pub const FRAME_TYPES: u8 = 0;
pub const FRAME_VALUES: u8 = 1;
pub const FRAME_CONTROL: u8 = 2;
pub const FRAME_EOS: u8 = 3;

pub const COMPRESSION_LZ4: u64 = 1;

pub const TYPEDEF_RECORD: u8 = 0;
pub const TYPEDEF_ARRAY: u8 = 1;
pub const TYPEDEF_SET: u8 = 2;
pub const TYPEDEF_MAP: u8 = 3;
pub const TYPEDEF_UNION: u8 = 4;
pub const TYPEDEF_ENUM: u8 = 5;
pub const TYPEDEF_ERROR: u8 = 6;
pub const TYPEDEF_NAME: u8 = 7;

/// Upper bound on a frame payload.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Default payload size at which the writer cuts a frame.
pub const DEFAULT_FRAME_THRESHOLD: usize = 512 * 1024;

/// Payloads smaller than this are never compressed.
const MIN_COMPRESS_SIZE: usize = 1024;

pub(crate) fn append_frame_header(out: &mut Vec<u8>, kind: u8, compressed: bool, len: usize) {
    let mut code = (len as u8 & 0x0f) | (kind << 4);
    if compressed {
        code |= 0x40;
    }
    out.push(code);
    append_uvarint(out, (len >> 4) as u64);
}

/// Parses a frame header, returning the frame kind, the compressed flag,
/// the payload length and the header size. Returns None when `buf` is too
/// short to hold the header.
pub(crate) fn parse_frame_header(buf: &[u8]) -> Result<Option<(u8, bool, usize, usize)>> {
    let Some(&code) = buf.first() else {
        return Ok(None);
    };
    if code & 0x80 != 0 {
        return Err(DbError::format("bsup version mismatch"));
    }
    let Some((high, n)) = read_uvarint(&buf[1..]) else {
        if buf.len() > 10 {
            return Err(DbError::format("bad bsup frame length"));
        }
        return Ok(None);
    };
    let len = ((high as usize) << 4) | (code & 0x0f) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(DbError::format(format!("bsup frame too big: {len} bytes")));
    }
    Ok(Some(((code >> 4) & 0x03, code & 0x40 != 0, len, n + 1)))
}

/// Compresses a payload when that makes it smaller, returning the framed
/// payload and whether it is compressed.
pub(crate) fn maybe_compress(payload: &[u8]) -> (Vec<u8>, bool) {
    if payload.len() < MIN_COMPRESS_SIZE {
        return (payload.to_vec(), false);
    }
    let compressed = lz4_flex::block::compress(payload);
    let mut out = Vec::with_capacity(compressed.len() + 10);
    append_uvarint(&mut out, COMPRESSION_LZ4);
    append_uvarint(&mut out, payload.len() as u64);
    out.extend_from_slice(&compressed);
    if out.len() >= payload.len() {
        return (payload.to_vec(), false);
    }
    (out, true)
}

pub(crate) fn decompress(payload: &[u8]) -> Result<Vec<u8>> {
    let (format, n) = read_uvarint(payload).ok_or_else(|| DbError::format("bad bsup compression header"))?;
    if format != COMPRESSION_LZ4 {
        return Err(DbError::format(format!("unknown bsup compression format: {format}")));
    }
    let (size, m) = read_uvarint(&payload[n..]).ok_or_else(|| DbError::format("bad bsup compression header"))?;
    if size as usize > MAX_FRAME_SIZE {
        return Err(DbError::format("bsup uncompressed frame too big"));
    }
    lz4_flex::block::decompress(&payload[n + m..], size as usize)
        .map_err(|e| DbError::with_source("failed to decompress bsup frame", Box::new(e)))
}

/// True when `buf` starts with something that parses as BSUP.
pub fn detect(buf: &[u8]) -> bool {
    matches!(parse_frame_header(buf), Ok(Some((kind, _, _, _))) if kind == FRAME_TYPES || kind == FRAME_VALUES || kind == FRAME_EOS)
        && reader::detect_frames(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header() {
        let mut buf = Vec::new();
        append_frame_header(&mut buf, FRAME_VALUES, true, 1000);
        let (kind, compressed, len, n) = parse_frame_header(&buf).unwrap().unwrap();
        assert_eq!((FRAME_VALUES, true, 1000, buf.len()), (kind, compressed, len, n));
        assert!(parse_frame_header(&[0x80, 0]).is_err());
    }

    #[test]
    fn compression_only_when_smaller() {
        let payload = vec![7u8; 4096];
        let (out, compressed) = maybe_compress(&payload);
        assert!(compressed);
        assert_eq!(payload, decompress(&out).unwrap());
        let (out, compressed) = maybe_compress(b"short");
        assert!(!compressed);
        assert_eq!(b"short".to_vec(), out);
    }
}
