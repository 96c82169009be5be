use std::collections::VecDeque;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use superdb_error::{DbError, Result, ResultExt};

use super::{
    FRAME_CONTROL, FRAME_EOS, FRAME_TYPES, FRAME_VALUES, MAX_FRAME_SIZE, TYPEDEF_ARRAY,
    TYPEDEF_ENUM, TYPEDEF_ERROR, TYPEDEF_MAP, TYPEDEF_NAME, TYPEDEF_RECORD, TYPEDEF_SET,
    TYPEDEF_UNION, decompress, parse_frame_header,
};
use crate::io::ValueReader;
use crate::types::{ComplexKind, Field, ID_TYPE_COMPLEX, PrimitiveType, Type, TypeContext};
use crate::value::Value;
use crate::value::scode::{self, read_uvarint};

pub const DEFAULT_READ_SIZE: usize = 512 * 1024;

#[derive(Debug)]
pub enum Frame {
    Types(Bytes),
    Values(Bytes),
    Control(Bytes),
    Eos,
}

/// Splits a byte stream into decompressed frames.
pub struct FrameReader<R: Read + Send> {
    input: R,
    buf: Vec<u8>,
    start: usize,
    read_size: usize,
    read_max: usize,
    eof: bool,
    bytes_read: u64,
}

impl<R: Read + Send> FrameReader<R> {
    pub fn new(input: R) -> Self {
        Self::with_sizes(input, DEFAULT_READ_SIZE, MAX_FRAME_SIZE)
    }

    pub fn with_sizes(input: R, read_size: usize, read_max: usize) -> Self {
        FrameReader {
            input,
            buf: Vec::new(),
            start: 0,
            read_size: read_size.max(1),
            read_max: read_max.max(read_size),
            eof: false,
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn fill(&mut self, need: usize) -> Result<bool> {
        while self.buf.len() - self.start < need {
            if self.eof {
                return Ok(false);
            }
            if self.start > 0 {
                self.buf.drain(..self.start);
                self.start = 0;
            }
            let want = self.read_size.max(need - self.buf.len());
            if self.buf.len() + want > self.read_max + self.read_size {
                return Err(DbError::format(format!(
                    "bsup frame exceeds read buffer limit of {} bytes",
                    self.read_max
                )));
            }
            let len = self.buf.len();
            self.buf.resize(len + want, 0);
            let n = self.input.read(&mut self.buf[len..]).context("failed to read bsup input")?;
            self.buf.truncate(len + n);
            self.bytes_read += n as u64;
            if n == 0 {
                self.eof = true;
            }
        }
        Ok(true)
    }

    /// Next frame, or None at the end of the input.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut need = 2;
        let (kind, compressed, len, hdr) = loop {
            let have = self.fill(need)?;
            let avail = &self.buf[self.start..];
            if avail.is_empty() {
                return Ok(None);
            }
            match parse_frame_header(avail)? {
                Some(h) => break h,
                None if have => need += 1,
                None => return Err(DbError::format("truncated bsup frame header")),
            }
        };
        if !self.fill(hdr + len)? {
            return Err(DbError::format("truncated bsup frame"));
        }
        let payload = &self.buf[self.start + hdr..self.start + hdr + len];
        let payload = if compressed {
            Bytes::from(decompress(payload)?)
        } else {
            Bytes::copy_from_slice(payload)
        };
        self.start += hdr + len;
        Ok(Some(match kind {
            FRAME_TYPES => Frame::Types(payload),
            FRAME_VALUES => Frame::Values(payload),
            FRAME_CONTROL => Frame::Control(payload),
            _ => Frame::Eos,
        }))
    }
}

/// Stream-local type table. Local ids at or above 30 index `types`.
#[derive(Clone)]
pub struct LocalTypes {
    ctx: Arc<TypeContext>,
    types: Arc<Vec<Type>>,
}

impl LocalTypes {
    pub fn new(ctx: Arc<TypeContext>) -> Self {
        LocalTypes {
            ctx,
            types: Arc::new(Vec::new()),
        }
    }

    pub fn reset(&mut self) {
        self.types = Arc::new(Vec::new());
    }

    /// A snapshot of the table for decoding values on another thread.
    pub fn snapshot(&self) -> Arc<Vec<Type>> {
        self.types.clone()
    }

    pub fn decode_types(&mut self, payload: &[u8]) -> Result<()> {
        let mut types = (*self.types).clone();
        let mut pos = 0;
        while pos < payload.len() {
            let code = payload[pos];
            pos += 1;
            let typ = match code {
                TYPEDEF_RECORD => {
                    let n = uvarint(payload, &mut pos)? as usize;
                    let mut fields = Vec::with_capacity(n.min(1024));
                    for _ in 0..n {
                        let name = string(payload, &mut pos)?;
                        let typ = local(&types, uvarint(payload, &mut pos)?)?;
                        fields.push(Field::new(name, typ));
                    }
                    self.ctx.lookup_record(fields)?
                }
                TYPEDEF_ARRAY => self.ctx.lookup_array(&local(&types, uvarint(payload, &mut pos)?)?),
                TYPEDEF_SET => self.ctx.lookup_set(&local(&types, uvarint(payload, &mut pos)?)?),
                TYPEDEF_MAP => {
                    let k = local(&types, uvarint(payload, &mut pos)?)?;
                    let v = local(&types, uvarint(payload, &mut pos)?)?;
                    self.ctx.lookup_map(&k, &v)
                }
                TYPEDEF_UNION => {
                    let n = uvarint(payload, &mut pos)? as usize;
                    let mut members = Vec::with_capacity(n.min(1024));
                    for _ in 0..n {
                        members.push(local(&types, uvarint(payload, &mut pos)?)?);
                    }
                    self.ctx.lookup_union(members)?
                }
                TYPEDEF_ENUM => {
                    let n = uvarint(payload, &mut pos)? as usize;
                    let mut symbols = Vec::with_capacity(n.min(1024));
                    for _ in 0..n {
                        symbols.push(string(payload, &mut pos)?);
                    }
                    self.ctx.lookup_enum(symbols)?
                }
                TYPEDEF_ERROR => self.ctx.lookup_error(&local(&types, uvarint(payload, &mut pos)?)?),
                TYPEDEF_NAME => {
                    let name = string(payload, &mut pos)?;
                    let inner = local(&types, uvarint(payload, &mut pos)?)?;
                    self.ctx.lookup_named(&name, &inner)?
                }
                other => return Err(DbError::format(format!("unknown bsup typedef code: {other}"))),
            };
            types.push(typ);
        }
        self.types = Arc::new(types);
        Ok(())
    }
}

fn uvarint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let (v, n) = read_uvarint(&buf[*pos..]).ok_or_else(|| DbError::format("truncated bsup typedef"))?;
    *pos += n;
    Ok(v)
}

fn string(buf: &[u8], pos: &mut usize) -> Result<String> {
    let len = uvarint(buf, pos)? as usize;
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| DbError::format("truncated bsup typedef"))?;
    let s = std::str::from_utf8(&buf[*pos..end])?.to_string();
    *pos = end;
    Ok(s)
}

fn local(types: &[Type], id: u64) -> Result<Type> {
    let id = u32::try_from(id).map_err(|_| DbError::format("bsup type id out of range"))?;
    if id < ID_TYPE_COMPLEX {
        return PrimitiveType::from_id(id)
            .map(Type::Primitive)
            .ok_or_else(|| DbError::format(format!("bsup: unknown type id {id}")));
    }
    types
        .get((id - ID_TYPE_COMPLEX) as usize)
        .cloned()
        .ok_or_else(|| DbError::format(format!("bsup: undefined type id {id}")))
}

/// Decodes a values frame.
pub fn decode_values(types: &[Type], payload: &Bytes, validate: bool) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        let id = uvarint(payload, &mut pos)?;
        let typ = local(types, id)?;
        let (tag, n) =
            read_uvarint(&payload[pos..]).ok_or_else(|| DbError::format("truncated bsup value"))?;
        pos += n;
        let body = if tag == 0 {
            None
        } else {
            let end = pos + (tag - 1) as usize;
            if end > payload.len() {
                return Err(DbError::format("bsup value overruns frame"));
            }
            let body = payload.slice(pos..end);
            pos = end;
            Some(body)
        };
        let val = Value::new(typ, body);
        if validate {
            validate_value(val.typ(), val.bytes())?;
        }
        out.push(val);
    }
    Ok(out)
}

/// Checks that a body is well formed for its type.
pub fn validate_value(typ: &Type, body: Option<&[u8]>) -> Result<()> {
    let Some(body) = body else {
        return Ok(());
    };
    let bad = || DbError::format(format!("invalid value for type {typ}"));
    match typ.kind() {
        None => match typ.primitive() {
            Some(PrimitiveType::Bool) if body.len() != 1 => Err(bad()),
            Some(PrimitiveType::String) => std::str::from_utf8(body).map(|_| ()).map_err(|_| bad()),
            Some(PrimitiveType::Ip) if body.len() != 4 && body.len() != 16 => Err(bad()),
            Some(p) if p.is_integer() && body.len() > 8 => Err(bad()),
            _ => Ok(()),
        },
        Some(ComplexKind::Record(fields)) => {
            let mut it = scode::Iter::new(body);
            for f in fields {
                let elem = it.try_next()?.ok_or_else(bad)?;
                validate_value(&f.typ, elem)?;
            }
            if it.done() { Ok(()) } else { Err(bad()) }
        }
        Some(ComplexKind::Array(inner)) | Some(ComplexKind::Set(inner)) => {
            let mut it = scode::Iter::new(body);
            while let Some(elem) = it.try_next()? {
                validate_value(inner, elem)?;
            }
            Ok(())
        }
        Some(ComplexKind::Map(k, v)) => {
            let mut it = scode::Iter::new(body);
            let mut key = true;
            while let Some(elem) = it.try_next()? {
                validate_value(if key { k } else { v }, elem)?;
                key = !key;
            }
            if key { Ok(()) } else { Err(bad()) }
        }
        Some(ComplexKind::Union(members)) => {
            let (tag, n) = read_uvarint(body).ok_or_else(bad)?;
            let member = members.get(tag as usize).ok_or_else(bad)?;
            let mut it = scode::Iter::new(&body[n..]);
            validate_value(member, it.try_next()?.ok_or_else(bad)?)
        }
        Some(ComplexKind::Enum(symbols)) => {
            if (scode::decode_uint(body) as usize) < symbols.len() {
                Ok(())
            } else {
                Err(bad())
            }
        }
        Some(ComplexKind::Named(_, inner)) | Some(ComplexKind::Error(inner)) => {
            validate_value(inner, Some(body))
        }
    }
}

/// Sequential BSUP reader.
pub struct Reader<R: Read + Send> {
    frames: FrameReader<R>,
    types: LocalTypes,
    pending: VecDeque<Value>,
    validate: bool,
}

impl<R: Read + Send> Reader<R> {
    pub fn new(ctx: Arc<TypeContext>, input: R) -> Self {
        Reader {
            frames: FrameReader::new(input),
            types: LocalTypes::new(ctx),
            pending: VecDeque::new(),
            validate: false,
        }
    }

    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Reads the next values frame, or None at the end of the input.
    pub fn read_batch(&mut self) -> Result<Option<Vec<Value>>> {
        loop {
            match self.frames.next_frame()? {
                None => return Ok(None),
                Some(Frame::Types(payload)) => self.types.decode_types(&payload)?,
                Some(Frame::Values(payload)) => {
                    let vals = decode_values(&self.types.snapshot(), &payload, self.validate)?;
                    if !vals.is_empty() {
                        return Ok(Some(vals));
                    }
                }
                Some(Frame::Control(_)) => {}
                Some(Frame::Eos) => self.types.reset(),
            }
        }
    }
}

impl<R: Read + Send> ValueReader for Reader<R> {
    fn read(&mut self) -> Result<Option<Value>> {
        loop {
            if let Some(val) = self.pending.pop_front() {
                return Ok(Some(val));
            }
            match self.read_batch()? {
                Some(vals) => self.pending.extend(vals),
                None => return Ok(None),
            }
        }
    }
}

/// True when every complete frame at the front of `buf` decodes, and there
/// is at least one.
pub(crate) fn detect_frames(buf: &[u8]) -> bool {
    let ctx = Arc::new(TypeContext::new());
    let mut types = LocalTypes::new(ctx);
    let mut pos = 0;
    let mut frames = 0;
    while pos < buf.len() {
        let Ok(Some((kind, compressed, len, hdr))) = parse_frame_header(&buf[pos..]) else {
            break;
        };
        if pos + hdr + len > buf.len() {
            break;
        }
        let raw = &buf[pos + hdr..pos + hdr + len];
        let payload = if compressed {
            match decompress(raw) {
                Ok(p) => Bytes::from(p),
                Err(_) => return false,
            }
        } else {
            Bytes::copy_from_slice(raw)
        };
        let ok = match kind {
            FRAME_TYPES => types.decode_types(&payload).is_ok(),
            FRAME_VALUES => decode_values(&types.snapshot(), &payload, true).is_ok(),
            FRAME_EOS => len == 0 && !compressed,
            _ => true,
        };
        if !ok {
            return false;
        }
        frames += 1;
        pos += hdr + len;
    }
    frames > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsup::Writer;
    use crate::io::ValueWriter;
    use crate::value::sup::parse_values;

    #[test]
    fn write_then_read() {
        let ctx = Arc::new(TypeContext::new());
        let vals = parse_values(&ctx, r#"{a:1,b:"x"} {a:2,b:null} [1,2] 3 "s""#).unwrap();
        let mut w = Writer::new(Vec::new()).with_threshold(8);
        for v in &vals {
            w.write(v).unwrap();
        }
        w.close().unwrap();
        let buf = w.into_inner();
        assert!(crate::bsup::detect(&buf));

        let other = Arc::new(TypeContext::new());
        let mut r = Reader::new(other, buf.as_slice()).with_validation(true);
        let mut got = Vec::new();
        while let Some(v) = r.read().unwrap() {
            got.push(v.to_string());
        }
        let want: Vec<String> = vals.iter().map(|v| v.to_string()).collect();
        assert_eq!(want, got);
    }

    #[test]
    fn text_is_not_bsup() {
        assert!(!crate::bsup::detect(b"{a:1}\n"));
        assert!(!crate::bsup::detect(b"[1,2,3]"));
    }

    #[test]
    fn invalid_body_rejected() {
        assert!(validate_value(&Type::BOOL, Some(&[1, 2])).is_err());
        assert!(validate_value(&Type::STRING, Some(&[0xff])).is_err());
        assert!(validate_value(&Type::INT64, Some(&[1])).is_ok());
    }
}
