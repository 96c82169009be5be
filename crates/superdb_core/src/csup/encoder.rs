//! Column encoders.
//!
//! An encoder is built per type and fed the SCODE body of every value of
//! that type. Each encoder tracks nulls itself; the body encoders below it
//! only ever see present values. Primitive leaves decide between a
//! constant, a dictionary and a plain column when the object is finished.
use std::cmp::Ordering;
use std::collections::HashMap;

use rayon::prelude::*;
use superdb_error::{DbError, Result};

use super::metadata::{FieldMeta, Metadata, Segment};
use super::{COMPRESSION_NONE, compress};
use crate::types::{ComplexKind, PrimitiveType, Type};
use crate::value::compare::{NullsOrder, compare_values};
use crate::value::scode::{self, append_tagged, read_uvarint};
use crate::value::sup::format_value;
use crate::value::Value;

/// Largest dictionary. Bigger cardinalities fall back to a plain column.
pub const MAX_DICT_SIZE: usize = 256;

/// Raw segment buffers of an object under construction. Until
/// [`Segments::finish`] runs, a segment's `offset` is its buffer index.
#[derive(Debug, Default)]
pub struct Segments {
    bufs: Vec<Vec<u8>>,
}

impl Segments {
    fn push(&mut self, buf: Vec<u8>) -> Segment {
        let idx = self.bufs.len() as u64;
        let len = buf.len() as u64;
        self.bufs.push(buf);
        Segment {
            offset: idx,
            length: len,
            mem_length: len,
            compression_format: COMPRESSION_NONE,
        }
    }

    /// Compresses every segment in parallel, lays them out back to back and
    /// patches the placeholder segments in `nodes`. Returns the data
    /// section.
    pub fn finish(self, nodes: &mut [Metadata]) -> Result<Vec<u8>> {
        let compressed: Vec<(Vec<u8>, u32, u64)> = self
            .bufs
            .par_iter()
            .map(|raw| {
                let (buf, format) = compress(raw);
                (buf, format, raw.len() as u64)
            })
            .collect();
        let mut data = Vec::new();
        let mut placed = Vec::with_capacity(compressed.len());
        for (buf, format, mem_length) in compressed {
            placed.push(Segment {
                offset: data.len() as u64,
                length: buf.len() as u64,
                mem_length,
                compression_format: format,
            });
            data.extend_from_slice(&buf);
        }
        let mut missing = false;
        for node in nodes.iter_mut() {
            node.for_each_segment_mut(&mut |seg| match placed.get(seg.offset as usize) {
                Some(p) => *seg = *p,
                None => missing = true,
            });
        }
        if missing {
            return Err(DbError::new("internal error: CSUP segment index out of range"));
        }
        Ok(data)
    }
}

#[derive(Debug)]
pub struct Encoder {
    typ: Type,
    /// One entry per slot, true when null. Empty until the first null.
    nulls: Vec<bool>,
    len: u32,
    body: Body,
}

#[derive(Debug)]
enum Body {
    Null,
    Record(Vec<(String, Encoder)>),
    Array {
        set: bool,
        lengths: Vec<u32>,
        values: Box<Encoder>,
    },
    Map {
        lengths: Vec<u32>,
        keys: Box<Encoder>,
        values: Box<Encoder>,
    },
    Union {
        tags: Vec<u32>,
        members: Vec<Encoder>,
    },
    Named(String, Box<Encoder>),
    Error(Box<Encoder>),
    Enum(Vec<String>, Vec<u64>),
    Primitive(PrimitiveType, Vec<Vec<u8>>),
}

impl Encoder {
    pub fn new(typ: &Type) -> Encoder {
        let body = match typ.kind() {
            None => match typ.primitive() {
                Some(PrimitiveType::Null) | None => Body::Null,
                Some(p) => Body::Primitive(p, Vec::new()),
            },
            Some(ComplexKind::Record(fields)) => Body::Record(
                fields
                    .iter()
                    .map(|f| (f.name.clone(), Encoder::new(&f.typ)))
                    .collect(),
            ),
            Some(ComplexKind::Array(inner)) | Some(ComplexKind::Set(inner)) => Body::Array {
                set: matches!(typ.kind(), Some(ComplexKind::Set(_))),
                lengths: Vec::new(),
                values: Box::new(Encoder::new(inner)),
            },
            Some(ComplexKind::Map(k, v)) => Body::Map {
                lengths: Vec::new(),
                keys: Box::new(Encoder::new(k)),
                values: Box::new(Encoder::new(v)),
            },
            Some(ComplexKind::Union(types)) => Body::Union {
                tags: Vec::new(),
                members: types.iter().map(Encoder::new).collect(),
            },
            Some(ComplexKind::Named(name, inner)) => Body::Named(name.clone(), Box::new(Encoder::new(inner))),
            Some(ComplexKind::Error(inner)) => Body::Error(Box::new(Encoder::new(inner))),
            Some(ComplexKind::Enum(symbols)) => Body::Enum(symbols.clone(), Vec::new()),
        };
        Encoder {
            typ: typ.clone(),
            nulls: Vec::new(),
            len: 0,
            body,
        }
    }

    pub fn typ(&self) -> &Type {
        &self.typ
    }

    pub fn write(&mut self, body: Option<&[u8]>) -> Result<()> {
        let idx = self.len as usize;
        self.len += 1;
        let Some(body) = body else {
            if self.nulls.is_empty() {
                self.nulls.resize(idx, false);
            }
            self.nulls.push(true);
            return Ok(());
        };
        if !self.nulls.is_empty() {
            self.nulls.push(false);
        }
        match &mut self.body {
            Body::Null => {}
            Body::Record(fields) => {
                let mut it = scode::Iter::new(body);
                for (_, enc) in fields.iter_mut() {
                    let elem = it.try_next()?.ok_or_else(|| DbError::format("record body has too few fields"))?;
                    enc.write(elem)?;
                }
            }
            Body::Array { lengths, values, .. } => {
                let mut it = scode::Iter::new(body);
                let mut n = 0;
                while let Some(elem) = it.try_next()? {
                    values.write(elem)?;
                    n += 1;
                }
                lengths.push(n);
            }
            Body::Map { lengths, keys, values } => {
                let mut it = scode::Iter::new(body);
                let mut n = 0;
                while let Some(k) = it.try_next()? {
                    let v = it.try_next()?.ok_or_else(|| DbError::format("map body missing value"))?;
                    keys.write(k)?;
                    values.write(v)?;
                    n += 1;
                }
                lengths.push(n);
            }
            Body::Union { tags, members } => {
                let (tag, n) = read_uvarint(body).ok_or_else(|| DbError::format("bad union tag"))?;
                let member = members
                    .get_mut(tag as usize)
                    .ok_or_else(|| DbError::format("union tag out of range"))?;
                let elem = scode::Iter::new(&body[n..]).try_next()?.flatten();
                member.write(elem)?;
                tags.push(tag as u32);
            }
            Body::Named(_, inner) | Body::Error(inner) => inner.write(Some(body))?,
            Body::Enum(_, idx) => idx.push(scode::decode_uint(body)),
            Body::Primitive(_, vals) => vals.push(body.to_vec()),
        }
        Ok(())
    }

    /// Emits the metadata for this column, returning its node id.
    pub fn metadata(self, segs: &mut Segments, nodes: &mut Vec<Metadata>) -> Result<u32> {
        if matches!(self.body, Body::Null) {
            return Ok(push(
                nodes,
                Metadata::Const {
                    value: "null".to_string(),
                    count: self.len,
                },
            ));
        }
        let count = self.len;
        let nulls = self.nulls;
        let values = match self.body {
            Body::Null => unreachable!("handled above"),
            Body::Record(fields) => {
                let length = count - nulls.iter().filter(|n| **n).count() as u32;
                let mut metas = Vec::with_capacity(fields.len());
                for (name, enc) in fields {
                    let values = enc.metadata(segs, nodes)?;
                    metas.push(FieldMeta { name, values });
                }
                push(nodes, Metadata::Record { length, fields: metas })
            }
            Body::Array { set, lengths, values } => {
                let length = lengths.len() as u32;
                let values = values.metadata(segs, nodes)?;
                let lengths = segs.push(u32s(&lengths));
                push(
                    nodes,
                    if set {
                        Metadata::Set { length, lengths, values }
                    } else {
                        Metadata::Array { length, lengths, values }
                    },
                )
            }
            Body::Map { lengths, keys, values } => {
                let length = lengths.len() as u32;
                let keys = keys.metadata(segs, nodes)?;
                let values = values.metadata(segs, nodes)?;
                let lengths = segs.push(u32s(&lengths));
                push(
                    nodes,
                    Metadata::Map {
                        length,
                        lengths,
                        keys,
                        values,
                    },
                )
            }
            Body::Union { tags, members } => {
                let length = tags.len() as u32;
                let mut ids = Vec::with_capacity(members.len());
                for m in members {
                    ids.push(m.metadata(segs, nodes)?);
                }
                let tags = segs.push(u32s(&tags));
                push(
                    nodes,
                    Metadata::Union {
                        length,
                        tags,
                        values: ids,
                    },
                )
            }
            Body::Named(name, inner) => {
                let values = inner.metadata(segs, nodes)?;
                push(nodes, Metadata::Named { name, values })
            }
            Body::Error(inner) => {
                let values = inner.metadata(segs, nodes)?;
                push(nodes, Metadata::Error { values })
            }
            Body::Enum(symbols, idx) => {
                let mut buf = Vec::with_capacity(idx.len() * 8);
                for i in &idx {
                    buf.extend_from_slice(&i.to_le_bytes());
                }
                let (min, max) = (idx.iter().min(), idx.iter().max());
                let values = push(
                    nodes,
                    Metadata::Uint {
                        typ: "uint64".to_string(),
                        location: segs.push(buf),
                        min: min.map(|m| m.to_string()),
                        max: max.map(|m| m.to_string()),
                        count: idx.len() as u32,
                    },
                );
                push(nodes, Metadata::Enum { symbols, values })
            }
            Body::Primitive(p, vals) => dict_or_leaf(p, vals, segs, nodes)?,
        };
        if !nulls.iter().any(|n| *n) {
            return Ok(values);
        }
        let runs = segs.push(u32s(&null_runs(&nulls)));
        Ok(push(nodes, Metadata::Nulls { runs, values, count }))
    }
}

fn push(nodes: &mut Vec<Metadata>, node: Metadata) -> u32 {
    nodes.push(node);
    (nodes.len() - 1) as u32
}

fn u32s(vals: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vals.len() * 4);
    for v in vals {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Run lengths alternating present and null, starting with present.
fn null_runs(nulls: &[bool]) -> Vec<u32> {
    let mut runs = Vec::new();
    let mut cur = false;
    let mut n = 0u32;
    for &is_null in nulls {
        if is_null != cur {
            runs.push(n);
            cur = is_null;
            n = 0;
        }
        n += 1;
    }
    runs.push(n);
    runs
}

fn dict_or_leaf(p: PrimitiveType, vals: Vec<Vec<u8>>, segs: &mut Segments, nodes: &mut Vec<Metadata>) -> Result<u32> {
    let use_dict = !matches!(p, PrimitiveType::Bool | PrimitiveType::Uint8 | PrimitiveType::Int8);
    if !use_dict || vals.is_empty() {
        return Ok(leaf(p, &vals, segs, nodes));
    }
    let mut entries: Vec<&[u8]> = Vec::new();
    let mut lookup: HashMap<&[u8], usize> = HashMap::new();
    let mut index = Vec::with_capacity(vals.len());
    for v in &vals {
        let next = entries.len();
        let idx = *lookup.entry(v.as_slice()).or_insert_with(|| {
            entries.push(v.as_slice());
            next
        });
        if entries.len() > MAX_DICT_SIZE {
            return Ok(leaf(p, &vals, segs, nodes));
        }
        index.push(idx as u8);
    }
    if entries.len() == 1 {
        let val = Value::new(Type::Primitive(p), Some(bytes::Bytes::copy_from_slice(entries[0])));
        return Ok(push(
            nodes,
            Metadata::Const {
                value: format_value(&val),
                count: vals.len() as u32,
            },
        ));
    }
    let mut counts = vec![0u32; entries.len()];
    for i in &index {
        counts[*i as usize] += 1;
    }
    let owned: Vec<Vec<u8>> = entries.iter().map(|e| e.to_vec()).collect();
    let values = leaf(p, &owned, segs, nodes);
    let index = segs.push(index);
    Ok(push(
        nodes,
        Metadata::Dict {
            values,
            counts,
            index,
            length: vals.len() as u32,
        },
    ))
}

fn min_max(p: PrimitiveType, vals: &[Vec<u8>]) -> (Option<String>, Option<String>) {
    let typ = Type::Primitive(p);
    let mut min: Option<Value> = None;
    let mut max: Option<Value> = None;
    for v in vals {
        let val = Value::new(typ.clone(), Some(bytes::Bytes::copy_from_slice(v)));
        if min
            .as_ref()
            .is_none_or(|m| compare_values(&val, m, NullsOrder::Last) == Ordering::Less)
        {
            min = Some(val.clone());
        }
        if max
            .as_ref()
            .is_none_or(|m| compare_values(&val, m, NullsOrder::Last) == Ordering::Greater)
        {
            max = Some(val);
        }
    }
    (min.map(|v| format_value(&v)), max.map(|v| format_value(&v)))
}

fn leaf(p: PrimitiveType, vals: &[Vec<u8>], segs: &mut Segments, nodes: &mut Vec<Metadata>) -> u32 {
    let (min, max) = min_max(p, vals);
    let typ = p.name().to_string();
    let count = vals.len() as u32;
    let node = if p.is_signed() {
        let mut buf = Vec::with_capacity(vals.len() * 8);
        for v in vals {
            buf.extend_from_slice(&scode::decode_int(v).to_le_bytes());
        }
        Metadata::Int {
            typ,
            location: segs.push(buf),
            min,
            max,
            count,
        }
    } else if p.is_unsigned() {
        let mut buf = Vec::with_capacity(vals.len() * 8);
        for v in vals {
            buf.extend_from_slice(&scode::decode_uint(v).to_le_bytes());
        }
        Metadata::Uint {
            typ,
            location: segs.push(buf),
            min,
            max,
            count,
        }
    } else if p.is_float() {
        let mut buf = Vec::with_capacity(vals.len() * 8);
        for v in vals {
            buf.extend_from_slice(&scode::decode_float(v).unwrap_or(f64::NAN).to_le_bytes());
        }
        Metadata::Float {
            typ,
            location: segs.push(buf),
            min,
            max,
            count,
        }
    } else if matches!(p, PrimitiveType::String | PrimitiveType::Bytes) {
        let mut offsets = Vec::with_capacity(vals.len() * 4);
        let mut data = Vec::new();
        for v in vals {
            data.extend_from_slice(v);
            offsets.extend_from_slice(&(data.len() as u32).to_le_bytes());
        }
        Metadata::Bytes {
            typ,
            offsets: segs.push(offsets),
            location: segs.push(data),
            min,
            max,
            count,
        }
    } else {
        let mut buf = Vec::new();
        for v in vals {
            append_tagged(&mut buf, Some(v));
        }
        Metadata::Primitive {
            typ,
            location: segs.push(buf),
            min,
            max,
            count,
        }
    };
    push(nodes, node)
}

/// Encodes values of any mix of types. A single type is encoded directly;
/// several types go under a `Dynamic` node with one tag per value.
#[derive(Debug, Default)]
pub struct DynamicEncoder {
    tags: Vec<u32>,
    encoders: Vec<Encoder>,
    by_type: HashMap<Type, usize>,
}

impl DynamicEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn write(&mut self, val: &Value) -> Result<()> {
        let next = self.encoders.len();
        let tag = *self.by_type.entry(val.typ().clone()).or_insert(next);
        if tag == next {
            self.encoders.push(Encoder::new(val.typ()));
        }
        self.encoders[tag].write(val.bytes())?;
        self.tags.push(tag as u32);
        Ok(())
    }

    pub fn metadata(self, segs: &mut Segments, nodes: &mut Vec<Metadata>) -> Result<u32> {
        let length = self.tags.len() as u32;
        let mut ids = Vec::with_capacity(self.encoders.len());
        for enc in self.encoders {
            ids.push(enc.metadata(segs, nodes)?);
        }
        if ids.len() == 1 {
            return Ok(ids[0]);
        }
        let tags = segs.push(u32s(&self.tags));
        Ok(push(
            nodes,
            Metadata::Dynamic {
                tags,
                values: ids,
                length,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeContext;
    use crate::value::sup::parse_values;

    #[test]
    fn runs_start_with_present() {
        assert_eq!(vec![0, 2, 1], null_runs(&[true, true, false]));
        assert_eq!(vec![1, 1, 1], null_runs(&[false, true, false]));
    }

    #[test]
    fn low_cardinality_becomes_dict_or_const() {
        let ctx = TypeContext::new();
        let mut enc = DynamicEncoder::new();
        for v in parse_values(&ctx, "{a:1,s:\"x\"} {a:2,s:\"x\"} {a:1,s:\"x\"}").unwrap() {
            enc.write(&v).unwrap();
        }
        let mut segs = Segments::default();
        let mut nodes = Vec::new();
        let root = enc.metadata(&mut segs, &mut nodes).unwrap();
        let Metadata::Record { fields, .. } = &nodes[root as usize] else {
            panic!("expected record root");
        };
        assert!(matches!(nodes[fields[0].values as usize], Metadata::Dict { .. }));
        assert!(matches!(&nodes[fields[1].values as usize], Metadata::Const { value, count: 3 } if value == "\"x\""));
    }
}
