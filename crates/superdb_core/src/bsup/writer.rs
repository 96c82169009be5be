use std::collections::HashMap;
use std::io::Write;

use superdb_error::{Result, ResultExt};

use super::{
    DEFAULT_FRAME_THRESHOLD, FRAME_EOS, FRAME_TYPES, FRAME_VALUES, TYPEDEF_ARRAY, TYPEDEF_ENUM,
    TYPEDEF_ERROR, TYPEDEF_MAP, TYPEDEF_NAME, TYPEDEF_RECORD, TYPEDEF_SET, TYPEDEF_UNION,
    append_frame_header, maybe_compress,
};
use crate::io::ValueWriter;
use crate::types::{ComplexKind, ID_TYPE_COMPLEX, Type};
use crate::value::Value;
use crate::value::scode::{append_tagged, append_uvarint};

/// Writes values as BSUP frames.
pub struct Writer<W: Write + Send> {
    out: W,
    local: HashMap<Type, u32>,
    types: Vec<u8>,
    values: Vec<u8>,
    threshold: usize,
    compress: bool,
}

impl<W: Write + Send> Writer<W> {
    pub fn new(out: W) -> Self {
        Writer {
            out,
            local: HashMap::new(),
            types: Vec::new(),
            values: Vec::new(),
            threshold: DEFAULT_FRAME_THRESHOLD,
            compress: true,
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn local_id(&mut self, typ: &Type) -> u32 {
        if typ.is_primitive() {
            return typ.id();
        }
        if let Some(id) = self.local.get(typ) {
            return *id;
        }
        let mut def = Vec::new();
        match typ.kind() {
            Some(ComplexKind::Record(fields)) => {
                let ids: Vec<u32> = fields.iter().map(|f| self.local_id(&f.typ)).collect();
                def.push(TYPEDEF_RECORD);
                append_uvarint(&mut def, fields.len() as u64);
                for (f, id) in fields.iter().zip(ids) {
                    append_uvarint(&mut def, f.name.len() as u64);
                    def.extend_from_slice(f.name.as_bytes());
                    append_uvarint(&mut def, id as u64);
                }
            }
            Some(ComplexKind::Array(inner)) => {
                let id = self.local_id(inner);
                def.push(TYPEDEF_ARRAY);
                append_uvarint(&mut def, id as u64);
            }
            Some(ComplexKind::Set(inner)) => {
                let id = self.local_id(inner);
                def.push(TYPEDEF_SET);
                append_uvarint(&mut def, id as u64);
            }
            Some(ComplexKind::Map(k, v)) => {
                let (k, v) = (self.local_id(k), self.local_id(v));
                def.push(TYPEDEF_MAP);
                append_uvarint(&mut def, k as u64);
                append_uvarint(&mut def, v as u64);
            }
            Some(ComplexKind::Union(members)) => {
                let ids: Vec<u32> = members.iter().map(|t| self.local_id(t)).collect();
                def.push(TYPEDEF_UNION);
                append_uvarint(&mut def, ids.len() as u64);
                for id in ids {
                    append_uvarint(&mut def, id as u64);
                }
            }
            Some(ComplexKind::Enum(symbols)) => {
                def.push(TYPEDEF_ENUM);
                append_uvarint(&mut def, symbols.len() as u64);
                for s in symbols {
                    append_uvarint(&mut def, s.len() as u64);
                    def.extend_from_slice(s.as_bytes());
                }
            }
            Some(ComplexKind::Error(inner)) => {
                let id = self.local_id(inner);
                def.push(TYPEDEF_ERROR);
                append_uvarint(&mut def, id as u64);
            }
            Some(ComplexKind::Named(name, inner)) => {
                let id = self.local_id(inner);
                def.push(TYPEDEF_NAME);
                append_uvarint(&mut def, name.len() as u64);
                def.extend_from_slice(name.as_bytes());
                append_uvarint(&mut def, id as u64);
            }
            None => {}
        }
        let id = ID_TYPE_COMPLEX + self.local.len() as u32;
        self.local.insert(typ.clone(), id);
        self.types.extend_from_slice(&def);
        id
    }

    fn write_frame(&mut self, kind: u8, payload: &[u8]) -> Result<()> {
        let (payload, compressed) = if self.compress {
            maybe_compress(payload)
        } else {
            (payload.to_vec(), false)
        };
        let mut header = Vec::with_capacity(12);
        append_frame_header(&mut header, kind, compressed, payload.len());
        self.out.write_all(&header).context("failed to write bsup frame")?;
        self.out.write_all(&payload).context("failed to write bsup frame")?;
        Ok(())
    }

    /// Writes any buffered types and values.
    pub fn flush(&mut self) -> Result<()> {
        if !self.types.is_empty() {
            let types = std::mem::take(&mut self.types);
            self.write_frame(FRAME_TYPES, &types)?;
        }
        if !self.values.is_empty() {
            let values = std::mem::take(&mut self.values);
            self.write_frame(FRAME_VALUES, &values)?;
        }
        self.out.flush().context("failed to flush bsup output")?;
        Ok(())
    }

    /// Flushes and ends the stream so a following stream starts with fresh
    /// type ids.
    pub fn end_stream(&mut self) -> Result<()> {
        self.flush()?;
        self.write_frame(FRAME_EOS, &[])?;
        self.local.clear();
        Ok(())
    }
}

impl<W: Write + Send> ValueWriter for Writer<W> {
    fn write(&mut self, val: &Value) -> Result<()> {
        let id = self.local_id(val.typ());
        append_uvarint(&mut self.values, id as u64);
        append_tagged(&mut self.values, val.bytes());
        if self.values.len() >= self.threshold {
            self.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.end_stream()
    }
}
