//! SCODE: the self-describing body encoding of values.
//!
//! A container element is a uvarint tag followed by the body. Tag zero is
//! null, otherwise the tag is the body length plus one.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use half::f16;
use superdb_error::{DbError, Result};

pub fn append_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Reads a uvarint, returning the value and the number of bytes consumed.
pub fn read_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut v = 0u64;
    let mut shift = 0;
    for (i, b) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        v |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            return Some((v, i + 1));
        }
        shift += 7;
    }
    None
}

pub fn append_tagged(buf: &mut Vec<u8>, body: Option<&[u8]>) {
    match body {
        None => buf.push(0),
        Some(body) => {
            append_uvarint(buf, body.len() as u64 + 1);
            buf.extend_from_slice(body);
        }
    }
}

/// Incremental builder of container bodies.
#[derive(Debug, Default, Clone)]
pub struct Builder {
    bytes: Vec<u8>,
    containers: Vec<usize>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.bytes.clear();
        self.containers.clear();
    }

    pub fn append(&mut self, body: Option<&[u8]>) {
        append_tagged(&mut self.bytes, body);
    }

    pub fn begin_container(&mut self) {
        self.containers.push(self.bytes.len());
    }

    pub fn end_container(&mut self) {
        if let Some(off) = self.containers.pop() {
            let len = self.bytes.len() - off;
            let mut tag = Vec::with_capacity(4);
            append_uvarint(&mut tag, len as u64 + 1);
            self.bytes.splice(off..off, tag);
        }
    }

    /// Ends a container whose body must be sorted and deduplicated (sets).
    pub fn end_set(&mut self) {
        if let Some(&off) = self.containers.last() {
            let mut elems: Vec<Vec<u8>> = Iter::new(&self.bytes[off..])
                .map(|e| {
                    let mut v = Vec::new();
                    append_tagged(&mut v, e);
                    v
                })
                .collect();
            elems.sort();
            elems.dedup();
            self.bytes.truncate(off);
            for e in elems {
                self.bytes.extend_from_slice(&e);
            }
        }
        self.end_container();
    }

    /// Ends a map container, sorting entries by key bytes.
    pub fn end_map(&mut self) {
        if let Some(&off) = self.containers.last() {
            let mut it = Iter::new(&self.bytes[off..]);
            let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
            while let (Some(k), Some(v)) = (it.next(), it.next()) {
                let mut key = Vec::new();
                append_tagged(&mut key, k);
                let mut val = Vec::new();
                append_tagged(&mut val, v);
                entries.push((key, val));
            }
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries.dedup_by(|a, b| a.0 == b.0);
            self.bytes.truncate(off);
            for (k, v) in entries {
                self.bytes.extend_from_slice(&k);
                self.bytes.extend_from_slice(&v);
            }
        }
        self.end_container();
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.bytes)
    }

    /// Body of the first element, typically the one container the builder
    /// was used to assemble.
    pub fn into_first_body(self) -> Option<Bytes> {
        let bytes = self.into_bytes();
        Iter::new(&bytes)
            .next()
            .flatten()
            .map(|b| bytes.slice_ref(b))
    }

    /// Takes the built body and leaves the builder empty for reuse.
    pub fn take(&mut self) -> Bytes {
        self.containers.clear();
        Bytes::from(std::mem::take(&mut self.bytes))
    }
}

/// Iterates the tagged elements of a container body. Each item is `None` for
/// a null element. Iteration stops early on malformed input; [`validate`]
/// reports such input.
#[derive(Debug, Clone)]
pub struct Iter<'a> {
    buf: &'a [u8],
}

impl<'a> Iter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Iter { buf }
    }

    pub fn done(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn try_next(&mut self) -> Result<Option<Option<&'a [u8]>>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let (tag, n) =
            read_uvarint(self.buf).ok_or_else(|| DbError::format("bad container tag"))?;
        if tag == 0 {
            self.buf = &self.buf[n..];
            return Ok(Some(None));
        }
        let len = (tag - 1) as usize;
        let end = n
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| DbError::format("container element overruns body"))?;
        let body = &self.buf[n..end];
        self.buf = &self.buf[end..];
        Ok(Some(Some(body)))
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = Option<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.try_next() {
            Ok(item) => item,
            Err(_) => {
                self.buf = &[];
                None
            }
        }
    }
}

/// Checks that a container body is a well-formed sequence of tagged
/// elements.
pub fn validate(buf: &[u8]) -> Result<usize> {
    let mut it = Iter::new(buf);
    let mut n = 0;
    while it.try_next()?.is_some() {
        n += 1;
    }
    Ok(n)
}

pub fn encode_uint(v: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    append_uint(&mut out, v);
    out
}

pub fn append_uint(out: &mut Vec<u8>, mut v: u64) {
    while v != 0 {
        out.push(v as u8);
        v >>= 8;
    }
}

pub fn decode_uint(buf: &[u8]) -> u64 {
    let mut v = 0u64;
    for (i, b) in buf.iter().take(8).enumerate() {
        v |= (*b as u64) << (8 * i);
    }
    v
}

pub fn encode_int(v: i64) -> Vec<u8> {
    encode_uint(((v << 1) ^ (v >> 63)) as u64)
}

pub fn append_int(out: &mut Vec<u8>, v: i64) {
    append_uint(out, ((v << 1) ^ (v >> 63)) as u64)
}

pub fn decode_int(buf: &[u8]) -> i64 {
    let u = decode_uint(buf);
    ((u >> 1) as i64) ^ -((u & 1) as i64)
}

pub fn encode_float64(v: f64) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

pub fn encode_float32(v: f32) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

pub fn encode_float16(v: f16) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

/// Decodes a float of any supported width based on the body length.
pub fn decode_float(buf: &[u8]) -> Option<f64> {
    match buf.len() {
        2 => Some(f16::from_le_bytes([buf[0], buf[1]]).to_f64()),
        4 => Some(f32::from_le_bytes(buf.try_into().ok()?) as f64),
        8 => Some(f64::from_le_bytes(buf.try_into().ok()?)),
        _ => None,
    }
}

pub fn encode_bool(v: bool) -> Vec<u8> {
    vec![v as u8]
}

pub fn decode_bool(buf: &[u8]) -> bool {
    buf.first().is_some_and(|b| *b != 0)
}

pub fn encode_ip(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

pub fn decode_ip(buf: &[u8]) -> Option<IpAddr> {
    match buf.len() {
        4 => Some(IpAddr::V4(Ipv4Addr::from(<[u8; 4]>::try_from(buf).ok()?))),
        16 => Some(IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(buf).ok()?))),
        _ => None,
    }
}

/// Net values are the network address followed by the mask bytes.
pub fn encode_net(ip: IpAddr, prefix: u8) -> Vec<u8> {
    let addr = encode_ip(ip);
    let bits = addr.len() * 8;
    let prefix = (prefix as usize).min(bits);
    let mut mask = vec![0u8; addr.len()];
    for (i, m) in mask.iter_mut().enumerate() {
        let lo = i * 8;
        if prefix >= lo + 8 {
            *m = 0xff;
        } else if prefix > lo {
            *m = 0xffu8 << (8 - (prefix - lo));
        }
    }
    let mut out: Vec<u8> = addr.iter().zip(&mask).map(|(a, m)| a & m).collect();
    out.extend_from_slice(&mask);
    out
}

pub fn decode_net(buf: &[u8]) -> Option<(IpAddr, u8)> {
    let half = buf.len() / 2;
    let ip = decode_ip(&buf[..half])?;
    let prefix = buf[half..].iter().map(|b| b.count_ones()).sum::<u32>() as u8;
    Some((ip, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uvarint_boundaries() {
        for v in [0u64, 1, 127, 128, 16383, 16384, u64::MAX] {
            let mut buf = Vec::new();
            append_uvarint(&mut buf, v);
            assert_eq!(Some((v, buf.len())), read_uvarint(&buf));
        }
        assert_eq!(None, read_uvarint(&[0x80]));
    }

    #[test]
    fn ints_are_minimal() {
        assert!(encode_int(0).is_empty());
        assert_eq!(vec![2], encode_int(1));
        assert_eq!(vec![1], encode_int(-1));
        assert_eq!(i64::MIN, decode_int(&encode_int(i64::MIN)));
        assert_eq!(i64::MAX, decode_int(&encode_int(i64::MAX)));
        assert_eq!(vec![0xff, 0x01], encode_uint(511));
    }

    #[test]
    fn nested_containers() {
        let mut b = Builder::new();
        b.append(Some(b"a"));
        b.begin_container();
        b.append(None);
        b.append(Some(b"bc"));
        b.end_container();
        let bytes = b.into_bytes();
        let elems: Vec<_> = Iter::new(&bytes).collect();
        assert_eq!(2, elems.len());
        assert_eq!(Some(&b"a"[..]), elems[0]);
        let inner: Vec<_> = Iter::new(elems[1].unwrap()).collect();
        assert_eq!(vec![None, Some(&b"bc"[..])], inner);
    }

    #[test]
    fn set_is_canonical() {
        let mut b = Builder::new();
        b.begin_container();
        b.append(Some(&encode_int(3)));
        b.append(Some(&encode_int(1)));
        b.append(Some(&encode_int(3)));
        b.end_set();
        let bytes = b.into_bytes();
        let outer: Vec<_> = Iter::new(&bytes).collect();
        let elems: Vec<_> = Iter::new(outer[0].unwrap())
            .map(|e| decode_int(e.unwrap()))
            .collect();
        assert_eq!(vec![1, 3], elems);
    }

    #[test]
    fn validate_detects_overrun() {
        assert_eq!(1, validate(&[2, 7]).unwrap());
        assert!(validate(&[5, 7]).is_err());
    }

    #[test]
    fn net_masks_address() {
        let bytes = encode_net("10.1.2.3".parse().unwrap(), 8);
        assert_eq!(vec![10, 0, 0, 0, 255, 0, 0, 0], bytes);
        let (ip, prefix) = decode_net(&bytes).unwrap();
        assert_eq!("10.0.0.0", ip.to_string());
        assert_eq!(8, prefix);
    }
}
