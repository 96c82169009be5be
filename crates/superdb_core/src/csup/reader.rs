//! Reading CSUP objects back into values.
use std::collections::VecDeque;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use indexmap::IndexMap;
use superdb_error::{DbError, Result, ResultExt};
use tracing::trace;

use super::metadata::{Metadata, Segment};
use super::{HEADER_SIZE, Header};
use crate::bsup;
use crate::io::ValueReader;
use crate::types::{Field, PrimitiveType, Type, TypeContext};
use crate::value::compare::{NullsOrder, compare_values};
use crate::value::scode::{self, Builder, append_tagged, append_uvarint};
use crate::value::sup::parse_value;
use crate::value::{Value, new_record};

/// Field projection over record columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    All,
    Fields(IndexMap<String, Projection>),
}

impl Projection {
    /// Builds a projection tree from field paths. An empty list projects
    /// every record down to `{}`.
    pub fn from_paths(paths: &[Vec<String>]) -> Projection {
        let mut root = Projection::Fields(IndexMap::new());
        for path in paths {
            root.insert(path);
        }
        root
    }

    fn insert(&mut self, path: &[String]) {
        let Projection::Fields(fields) = self else {
            return;
        };
        match path.split_first() {
            None => *self = Projection::All,
            Some((head, rest)) => {
                let child = fields
                    .entry(head.clone())
                    .or_insert_with(|| Projection::Fields(IndexMap::new()));
                if rest.is_empty() {
                    *child = Projection::All;
                } else {
                    child.insert(rest);
                }
            }
        }
    }
}

/// A single-typed column decoded from a metadata node.
#[derive(Debug, Clone)]
pub struct Column {
    pub typ: Type,
    pub bodies: Vec<Option<Bytes>>,
}

/// One CSUP object held in memory.
#[derive(Debug)]
pub struct Object {
    ctx: Arc<TypeContext>,
    nodes: Vec<Metadata>,
    root: u32,
    data: Bytes,
    size: usize,
}

impl Object {
    /// Reads the next object from `input`. Returns None at a clean end of
    /// input.
    pub fn read_from<R: Read>(ctx: Arc<TypeContext>, input: &mut R) -> Result<Option<Object>> {
        let mut hdr = [0u8; HEADER_SIZE];
        let mut n = 0;
        while n < HEADER_SIZE {
            let k = input.read(&mut hdr[n..]).context("failed to read CSUP header")?;
            if k == 0 {
                break;
            }
            n += k;
        }
        if n == 0 {
            return Ok(None);
        }
        let header = Header::deserialize(&hdr[..n])?;
        let mut meta = vec![0u8; header.meta_size as usize];
        input.read_exact(&mut meta).context("truncated CSUP metadata section")?;
        let mut data = vec![0u8; header.data_size as usize];
        input.read_exact(&mut data).context("truncated CSUP data section")?;
        let obj = Object::from_parts(ctx, &header, &meta, Bytes::from(data))?;
        Ok(Some(obj))
    }

    /// Parses an object from a buffer holding at least one whole object.
    pub fn from_bytes(ctx: Arc<TypeContext>, buf: &Bytes) -> Result<Object> {
        let header = Header::deserialize(buf)?;
        let meta_end = HEADER_SIZE + header.meta_size as usize;
        let data_end = meta_end + header.data_size as usize;
        if buf.len() < data_end {
            return Err(DbError::format("truncated CSUP object"));
        }
        Object::from_parts(ctx, &header, &buf[HEADER_SIZE..meta_end], buf.slice(meta_end..data_end))
    }

    fn from_parts(ctx: Arc<TypeContext>, header: &Header, meta: &[u8], data: Bytes) -> Result<Object> {
        let mctx = Arc::new(TypeContext::new());
        let mut reader = bsup::Reader::new(mctx, meta);
        let mut nodes = Vec::new();
        while let Some(val) = reader.read()? {
            nodes.push(Metadata::from_value(&val)?);
        }
        if header.root as usize >= nodes.len() {
            return Err(DbError::format("CSUP root node out of range"));
        }
        trace!(nodes = nodes.len(), data_size = data.len(), "decoded csup metadata");
        Ok(Object {
            ctx,
            nodes,
            root: header.root,
            size: HEADER_SIZE + meta.len() + data.len(),
            data,
        })
    }

    pub fn ctx(&self) -> &Arc<TypeContext> {
        &self.ctx
    }

    pub fn nodes(&self) -> &[Metadata] {
        &self.nodes
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    /// Total encoded size of the object.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of values in the object.
    pub fn len(&self) -> usize {
        self.nodes[self.root as usize].len(&self.nodes) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node(&self, id: u32) -> Result<&Metadata> {
        self.nodes
            .get(id as usize)
            .ok_or_else(|| DbError::format(format!("CSUP node {id} out of range")))
    }

    pub fn segment(&self, seg: &Segment) -> Result<Bytes> {
        seg.read(&self.data)
    }

    /// Decodes every value of the object under a projection.
    pub fn values(&self, projection: &Projection) -> Result<Vec<Value>> {
        match self.node(self.root)? {
            Metadata::Dynamic { tags, values, length } => {
                let tags = self.u32s(tags)?;
                let mut cols = Vec::with_capacity(values.len());
                for id in values {
                    cols.push(self.column(*id, projection)?);
                }
                let mut cursors = vec![0usize; cols.len()];
                let mut out = Vec::with_capacity(*length as usize);
                for tag in tags {
                    let col = cols
                        .get(tag as usize)
                        .ok_or_else(|| DbError::format("CSUP dynamic tag out of range"))?;
                    let slot = cursors[tag as usize];
                    cursors[tag as usize] += 1;
                    let body = col
                        .bodies
                        .get(slot)
                        .ok_or_else(|| DbError::format("CSUP dynamic column too short"))?;
                    out.push(Value::new(col.typ.clone(), body.clone()));
                }
                Ok(out)
            }
            _ => {
                let col = self.column(self.root, projection)?;
                Ok(col
                    .bodies
                    .into_iter()
                    .map(|b| Value::new(col.typ.clone(), b))
                    .collect())
            }
        }
    }

    pub(crate) fn u32s(&self, seg: &Segment) -> Result<Vec<u32>> {
        let buf = self.segment(seg)?;
        Ok(buf
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub(crate) fn u64s(&self, seg: &Segment) -> Result<Vec<u64>> {
        let buf = self.segment(seg)?;
        Ok(buf
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                u64::from_le_bytes(b)
            })
            .collect())
    }

    /// Type of the values described by a node.
    pub fn node_type(&self, id: u32) -> Result<Type> {
        let ctx = &self.ctx;
        Ok(match self.node(id)? {
            Metadata::Record { fields, .. } => {
                let mut out = Vec::with_capacity(fields.len());
                for f in fields {
                    out.push(Field::new(f.name.clone(), self.node_type(f.values)?));
                }
                ctx.lookup_record(out)?
            }
            Metadata::Array { values, .. } => ctx.lookup_array(&self.node_type(*values)?),
            Metadata::Set { values, .. } => ctx.lookup_set(&self.node_type(*values)?),
            Metadata::Map { keys, values, .. } => {
                ctx.lookup_map(&self.node_type(*keys)?, &self.node_type(*values)?)
            }
            Metadata::Union { values, .. } => {
                let mut types = Vec::with_capacity(values.len());
                for v in values {
                    types.push(self.node_type(*v)?);
                }
                ctx.lookup_union(types)?
            }
            Metadata::Named { name, values } => ctx.lookup_named(name, &self.node_type(*values)?)?,
            Metadata::Error { values } => ctx.lookup_error(&self.node_type(*values)?),
            Metadata::Enum { symbols, .. } => ctx.lookup_enum(symbols.clone())?,
            Metadata::Int { typ, .. }
            | Metadata::Uint { typ, .. }
            | Metadata::Float { typ, .. }
            | Metadata::Bytes { typ, .. }
            | Metadata::Primitive { typ, .. } => Type::Primitive(
                PrimitiveType::from_name(typ)
                    .ok_or_else(|| DbError::format(format!("unknown CSUP primitive type {typ}")))?,
            ),
            Metadata::Dict { values, .. } | Metadata::Nulls { values, .. } => self.node_type(*values)?,
            Metadata::Const { value, .. } => parse_value(ctx, value)?.typ().clone(),
            Metadata::Dynamic { .. } => {
                return Err(DbError::format("CSUP dynamic node below the root"));
            }
        })
    }

    /// Decodes a single-typed node into per-slot bodies.
    pub fn column(&self, id: u32, projection: &Projection) -> Result<Column> {
        let ctx = &self.ctx;
        match self.node(id)? {
            Metadata::Record { length, fields } => {
                let want = match projection {
                    Projection::All => None,
                    Projection::Fields(want) => Some(want),
                };
                let mut types = Vec::new();
                let mut cols = Vec::new();
                for f in fields {
                    let sub = match want {
                        None => &Projection::All,
                        Some(want) => match want.get(&f.name) {
                            Some(sub) => sub,
                            None => continue,
                        },
                    };
                    let col = self.column(f.values, sub)?;
                    types.push(Field::new(f.name.clone(), col.typ.clone()));
                    cols.push(col);
                }
                let typ = ctx.lookup_record(types)?;
                let mut bodies = Vec::with_capacity(*length as usize);
                let mut b = Builder::new();
                for slot in 0..*length as usize {
                    for col in &cols {
                        b.append(col.bodies.get(slot).and_then(|b| b.as_deref()));
                    }
                    bodies.push(Some(b.take()));
                }
                Ok(Column { typ, bodies })
            }
            Metadata::Array { lengths, values, .. } | Metadata::Set { lengths, values, .. } => {
                let inner = self.column(*values, &Projection::All)?;
                let typ = if matches!(self.node(id)?, Metadata::Set { .. }) {
                    ctx.lookup_set(&inner.typ)
                } else {
                    ctx.lookup_array(&inner.typ)
                };
                let mut off = 0usize;
                let mut bodies = Vec::new();
                for n in self.u32s(lengths)? {
                    let end = off + n as usize;
                    let elems = inner
                        .bodies
                        .get(off..end)
                        .ok_or_else(|| DbError::format("CSUP array lengths overrun values"))?;
                    let mut buf = Vec::new();
                    for e in elems {
                        append_tagged(&mut buf, e.as_deref());
                    }
                    bodies.push(Some(Bytes::from(buf)));
                    off = end;
                }
                Ok(Column { typ, bodies })
            }
            Metadata::Map {
                lengths, keys, values, ..
            } => {
                let k = self.column(*keys, &Projection::All)?;
                let v = self.column(*values, &Projection::All)?;
                let typ = ctx.lookup_map(&k.typ, &v.typ);
                let mut off = 0usize;
                let mut bodies = Vec::new();
                for n in self.u32s(lengths)? {
                    let mut buf = Vec::new();
                    for i in off..off + n as usize {
                        let (Some(kb), Some(vb)) = (k.bodies.get(i), v.bodies.get(i)) else {
                            return Err(DbError::format("CSUP map lengths overrun entries"));
                        };
                        append_tagged(&mut buf, kb.as_deref());
                        append_tagged(&mut buf, vb.as_deref());
                    }
                    off += n as usize;
                    bodies.push(Some(Bytes::from(buf)));
                }
                Ok(Column { typ, bodies })
            }
            Metadata::Union { tags, values, .. } => {
                let typ = self.node_type(id)?;
                let mut members = Vec::with_capacity(values.len());
                for v in values {
                    members.push(self.column(*v, &Projection::All)?);
                }
                let mut cursors = vec![0usize; members.len()];
                let mut bodies = Vec::new();
                for tag in self.u32s(tags)? {
                    let t = tag as usize;
                    let body = members
                        .get(t)
                        .and_then(|m| m.bodies.get(cursors[t]))
                        .ok_or_else(|| DbError::format("CSUP union tag out of range"))?;
                    cursors[t] += 1;
                    let mut buf = Vec::new();
                    append_uvarint(&mut buf, tag as u64);
                    append_tagged(&mut buf, body.as_deref());
                    bodies.push(Some(Bytes::from(buf)));
                }
                Ok(Column { typ, bodies })
            }
            Metadata::Named { name, values } => {
                let inner = self.column(*values, projection)?;
                let typ = ctx.lookup_named(name, &inner.typ)?;
                Ok(Column {
                    typ,
                    bodies: inner.bodies,
                })
            }
            Metadata::Error { values } => {
                let inner = self.column(*values, &Projection::All)?;
                Ok(Column {
                    typ: ctx.lookup_error(&inner.typ),
                    bodies: inner.bodies,
                })
            }
            Metadata::Enum { symbols, values } => {
                let inner = self.column(*values, &Projection::All)?;
                Ok(Column {
                    typ: ctx.lookup_enum(symbols.clone())?,
                    bodies: inner.bodies,
                })
            }
            Metadata::Int { location, .. } => {
                let bodies = self
                    .u64s(location)?
                    .into_iter()
                    .map(|u| Some(Bytes::from(scode::encode_int(u as i64))))
                    .collect();
                Ok(Column {
                    typ: self.node_type(id)?,
                    bodies,
                })
            }
            Metadata::Uint { location, .. } => {
                let bodies = self
                    .u64s(location)?
                    .into_iter()
                    .map(|u| Some(Bytes::from(scode::encode_uint(u))))
                    .collect();
                Ok(Column {
                    typ: self.node_type(id)?,
                    bodies,
                })
            }
            Metadata::Float { location, .. } => {
                let typ = self.node_type(id)?;
                let bodies = self
                    .u64s(location)?
                    .into_iter()
                    .map(|u| Value::from_float(typ.clone(), f64::from_bits(u)).into_parts().1)
                    .collect();
                Ok(Column { typ, bodies })
            }
            Metadata::Bytes { offsets, location, .. } => {
                let data = self.segment(location)?;
                let mut start = 0usize;
                let mut bodies = Vec::new();
                for end in self.u32s(offsets)? {
                    let end = end as usize;
                    if end < start || end > data.len() {
                        return Err(DbError::format("CSUP bytes offsets out of range"));
                    }
                    bodies.push(Some(data.slice(start..end)));
                    start = end;
                }
                Ok(Column {
                    typ: self.node_type(id)?,
                    bodies,
                })
            }
            Metadata::Primitive { location, .. } => {
                let data = self.segment(location)?;
                let mut it = scode::Iter::new(&data);
                let mut bodies = Vec::new();
                while let Some(elem) = it.try_next()? {
                    bodies.push(elem.map(|b| data.slice_ref(b)));
                }
                Ok(Column {
                    typ: self.node_type(id)?,
                    bodies,
                })
            }
            Metadata::Dict { values, index, .. } => {
                let entries = self.column(*values, &Projection::All)?;
                let index = self.segment(index)?;
                let mut bodies = Vec::with_capacity(index.len());
                for i in index.iter() {
                    let body = entries
                        .bodies
                        .get(*i as usize)
                        .ok_or_else(|| DbError::format("CSUP dictionary index out of range"))?;
                    bodies.push(body.clone());
                }
                Ok(Column {
                    typ: entries.typ,
                    bodies,
                })
            }
            Metadata::Const { value, count } => {
                let val = parse_value(ctx, value)?;
                Ok(Column {
                    typ: val.typ().clone(),
                    bodies: vec![val.body().cloned(); *count as usize],
                })
            }
            Metadata::Nulls { runs, values, count } => {
                let inner = self.column(*values, projection)?;
                let mut dense = inner.bodies.into_iter();
                let mut bodies = Vec::with_capacity(*count as usize);
                let mut null = false;
                for run in self.u32s(runs)? {
                    for _ in 0..run {
                        if null {
                            bodies.push(None);
                        } else {
                            bodies.push(
                                dense
                                    .next()
                                    .ok_or_else(|| DbError::format("CSUP nulls runs overrun values"))?,
                            );
                        }
                    }
                    null = !null;
                }
                Ok(Column { typ: inner.typ, bodies })
            }
            Metadata::Dynamic { .. } => Err(DbError::format("CSUP dynamic node below the root")),
        }
    }

    /// Min and max of the leaf column at `path`, following records from the
    /// root. None when the path does not resolve to a leaf in every
    /// top-level type.
    pub fn min_max(&self, path: &[String]) -> Result<Option<(Value, Value)>> {
        let roots: Vec<u32> = match self.node(self.root)? {
            Metadata::Dynamic { values, .. } => values.clone(),
            _ => vec![self.root],
        };
        let mut acc: Option<(Value, Value)> = None;
        for root in roots {
            let Some((min, max)) = self.leaf_min_max(root, path)? else {
                // Nulls carry no range and never satisfy a range test.
                if self.is_null_leaf(root, path)? {
                    continue;
                }
                return Ok(None);
            };
            acc = Some(match acc {
                None => (min, max),
                Some((lo, hi)) => (
                    if compare_values(&min, &lo, NullsOrder::Last).is_lt() { min } else { lo },
                    if compare_values(&max, &hi, NullsOrder::Last).is_gt() { max } else { hi },
                ),
            });
        }
        Ok(acc)
    }

    fn is_null_leaf(&self, id: u32, path: &[String]) -> Result<bool> {
        match (self.node(id)?, path.split_first()) {
            (Metadata::Nulls { values, .. }, _) | (Metadata::Named { values, .. }, _) => {
                self.is_null_leaf(*values, path)
            }
            (Metadata::Record { fields, .. }, Some((head, rest))) => match fields.iter().find(|f| &f.name == head) {
                Some(f) => self.is_null_leaf(f.values, rest),
                None => Ok(false),
            },
            (Metadata::Dict { values, .. }, None) => self.is_null_leaf(*values, path),
            (Metadata::Const { value, .. }, None) => Ok(parse_value(&self.ctx, value)?.is_null()),
            _ => Ok(false),
        }
    }

    fn leaf_min_max(&self, id: u32, path: &[String]) -> Result<Option<(Value, Value)>> {
        let ctx = &self.ctx;
        match (self.node(id)?, path.split_first()) {
            (Metadata::Nulls { values, .. }, _) | (Metadata::Named { values, .. }, _) => {
                self.leaf_min_max(*values, path)
            }
            (Metadata::Record { fields, .. }, Some((head, rest))) => {
                match fields.iter().find(|f| &f.name == head) {
                    Some(f) => self.leaf_min_max(f.values, rest),
                    None => Ok(None),
                }
            }
            (Metadata::Dict { values, .. }, None) => self.leaf_min_max(*values, path),
            (Metadata::Const { value, .. }, None) => {
                let val = parse_value(ctx, value)?;
                if val.is_null() {
                    return Ok(None);
                }
                Ok(Some((val.clone(), val)))
            }
            (node, None) => match node.min_max() {
                Some((Some(min), Some(max))) => Ok(Some((parse_value(ctx, min)?, parse_value(ctx, max)?))),
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    /// Builds the `{path: {min, max}}` record a metadata filter is evaluated
    /// against. Paths that do not resolve are left out.
    pub fn metadata_record(&self, paths: &[Vec<String>]) -> Result<Value> {
        enum Tree {
            Leaf(Value),
            Node(IndexMap<String, Tree>),
        }
        fn insert(tree: &mut IndexMap<String, Tree>, path: &[String], leaf: Value) {
            let Some((head, rest)) = path.split_first() else {
                return;
            };
            if rest.is_empty() {
                tree.insert(head.clone(), Tree::Leaf(leaf));
                return;
            }
            let child = tree
                .entry(head.clone())
                .or_insert_with(|| Tree::Node(IndexMap::new()));
            if let Tree::Node(map) = child {
                insert(map, rest, leaf);
            }
        }
        fn build(ctx: &TypeContext, tree: IndexMap<String, Tree>) -> Result<Value> {
            let mut fields = Vec::with_capacity(tree.len());
            for (name, t) in tree {
                let v = match t {
                    Tree::Leaf(v) => v,
                    Tree::Node(map) => build(ctx, map)?,
                };
                fields.push((name, v));
            }
            new_record(ctx, fields)
        }

        let ctx = &self.ctx;
        let mut tree = IndexMap::new();
        for path in paths {
            if let Some((min, max)) = self.min_max(path)? {
                let leaf = new_record(ctx, vec![("min".to_string(), min), ("max".to_string(), max)])?;
                insert(&mut tree, path, leaf);
            }
        }
        build(ctx, tree)
    }
}

/// Reads concatenated CSUP objects as a value stream.
pub struct Reader<R: Read + Send> {
    ctx: Arc<TypeContext>,
    input: R,
    projection: Projection,
    pending: VecDeque<Value>,
    done: bool,
}

impl<R: Read + Send> Reader<R> {
    pub fn from_reader(ctx: Arc<TypeContext>, input: R, projection: Option<Vec<Vec<String>>>) -> Result<Self> {
        let projection = match projection {
            None => Projection::All,
            Some(paths) => Projection::from_paths(&paths),
        };
        Ok(Reader {
            ctx,
            input,
            projection,
            pending: VecDeque::new(),
            done: false,
        })
    }

    /// Next whole object, or None at the end of the input.
    pub fn next_object(&mut self) -> Result<Option<Object>> {
        if self.done {
            return Ok(None);
        }
        let obj = Object::read_from(self.ctx.clone(), &mut self.input)?;
        if obj.is_none() {
            self.done = true;
        }
        Ok(obj)
    }
}

impl<R: Read + Send> ValueReader for Reader<R> {
    fn read(&mut self) -> Result<Option<Value>> {
        loop {
            if let Some(val) = self.pending.pop_front() {
                return Ok(Some(val));
            }
            match self.next_object()? {
                Some(obj) => self.pending.extend(obj.values(&self.projection)?),
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csup::Writer;
    use crate::io::ValueWriter;
    use crate::value::sup::parse_values;

    fn encode(src: &str, object_values: usize) -> Vec<u8> {
        let ctx = TypeContext::new();
        let mut w = Writer::new(Vec::new()).with_object_values(object_values);
        for v in parse_values(&ctx, src).unwrap() {
            w.write(&v).unwrap();
        }
        w.close().unwrap();
        w.into_inner()
    }

    fn decode(buf: &[u8], projection: Option<Vec<Vec<String>>>) -> Vec<String> {
        let ctx = Arc::new(TypeContext::new());
        let mut r = Reader::from_reader(ctx, buf, projection).unwrap();
        let mut out = Vec::new();
        while let Some(v) = r.read().unwrap() {
            out.push(v.to_string());
        }
        out
    }

    #[test]
    fn values_survive_encoding() {
        let src = r#"{a:1,b:"x",c:[1,2],d:null}
{a:2,b:null,c:[],d:1.5}
{a:3,b:"y",c:null,d:2.5}
"plain"
{a:4,b:"x",c:[3],d:null}
10.0.0.1
|[1,2]|
|{"k":1}|"#;
        let buf = encode(src, 2);
        let ctx = TypeContext::new();
        let want: Vec<String> = parse_values(&ctx, src).unwrap().iter().map(|v| v.to_string()).collect();
        assert_eq!(want, decode(&buf, None));
    }

    #[test]
    fn projection_keeps_named_fields() {
        let buf = encode("{a:1,b:{c:2,d:3}} {a:2,b:{c:4,d:5}}", 100);
        let got = decode(&buf, Some(vec![vec!["b".to_string(), "d".to_string()]]));
        assert_eq!(vec!["{b:{d:3}}", "{b:{d:5}}"], got);
        let got = decode(&buf, Some(vec![]));
        assert_eq!(vec!["{}", "{}"], got);
    }

    #[test]
    fn metadata_record_has_bounds() {
        let buf = encode("{ts:5,s:\"b\"} {ts:1,s:\"a\"} {ts:9,s:null}", 100);
        let ctx = Arc::new(TypeContext::new());
        let obj = Object::read_from(ctx, &mut buf.as_slice()).unwrap().unwrap();
        assert_eq!(3, obj.len());
        let rec = obj
            .metadata_record(&[vec!["ts".to_string()], vec!["s".to_string()], vec!["nope".to_string()]])
            .unwrap();
        assert_eq!("{ts:{min:1,max:9},s:{min:\"a\",max:\"b\"}}", rec.to_string());
    }

    #[test]
    fn rolls_objects_at_threshold() {
        let buf = encode("1 2 3 4 5", 2);
        let ctx = Arc::new(TypeContext::new());
        let mut r = Reader::from_reader(ctx, buf.as_slice(), None).unwrap();
        let mut objects = 0;
        while r.next_object().unwrap().is_some() {
            objects += 1;
        }
        assert_eq!(3, objects);
    }
}
