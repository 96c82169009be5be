//! Column-oriented execution.
//!
//! A [`Vector`] holds a run of values by column: flat primitive arrays,
//! records of field vectors, containers over offsets into an element
//! vector. Values of differing types share one chunk through
//! [`Vector::Dynamic`], which keeps one single-typed vector per type and a
//! tag per slot. Operators with a native kernel work on the columns
//! directly; everything else goes through the scalar evaluators a slot at
//! a time.
pub mod expr;
pub mod op;
pub mod scan;

use std::sync::Arc;

use bytes::Bytes;
use indexmap::IndexMap;
use superdb_error::Result;

use crate::runtime::{Batch, BoxPuller, Chunk, Puller, batch_of};
use crate::types::{ComplexKind, PrimitiveType, Type};
use crate::value::{Value, scode};

/// Null flags of a vector. An empty flag list means no slot is null.
#[derive(Debug, Clone, Default)]
pub struct Nulls(Vec<bool>);

impl Nulls {
    pub fn from_flags(flags: Vec<bool>) -> Self {
        if flags.iter().any(|f| *f) { Nulls(flags) } else { Nulls::default() }
    }

    pub fn is_null(&self, i: usize) -> bool {
        self.0.get(i).copied().unwrap_or(false)
    }

    pub fn any(&self) -> bool {
        !self.0.is_empty()
    }
}

/// Primitive values held in a native array. `typ` keeps the declared
/// width, so int8 through int64, time and duration all live in an
/// `Int` vector.
#[derive(Debug, Clone)]
pub struct Flat<T> {
    pub typ: Type,
    pub values: Vec<T>,
    pub nulls: Nulls,
}

/// Variable-length leaf values: bytes, string, ip, net and type values.
#[derive(Debug, Clone)]
pub struct BytesVec {
    pub typ: Type,
    /// `offsets[i]..offsets[i + 1]` delimits slot `i` in `data`.
    pub offsets: Vec<u32>,
    pub data: Bytes,
    pub nulls: Nulls,
}

impl BytesVec {
    pub fn slot(&self, i: usize) -> &[u8] {
        &self.data[self.offsets[i] as usize..self.offsets[i + 1] as usize]
    }
}

#[derive(Debug, Clone)]
pub struct RecordVec {
    pub typ: Type,
    pub fields: Vec<Vector>,
    pub len: usize,
    pub nulls: Nulls,
}

/// Arrays and sets; `typ` tells them apart.
#[derive(Debug, Clone)]
pub struct ArrayVec {
    pub typ: Type,
    pub offsets: Vec<u32>,
    pub values: Box<Vector>,
    pub nulls: Nulls,
}

#[derive(Debug, Clone)]
pub struct MapVec {
    pub typ: Type,
    pub offsets: Vec<u32>,
    pub keys: Box<Vector>,
    pub values: Box<Vector>,
    pub nulls: Nulls,
}

/// Slot `i` is `values[tags[i]]` at position `index[i]`.
#[derive(Debug, Clone)]
pub struct UnionVec {
    pub typ: Type,
    pub tags: Vec<u32>,
    pub index: Vec<u32>,
    pub values: Vec<Vector>,
    pub nulls: Nulls,
}

#[derive(Debug, Clone)]
pub struct DictVec {
    pub values: Box<Vector>,
    pub index: Vec<u32>,
}

/// Selected slots of another vector.
#[derive(Debug, Clone)]
pub struct ViewVec {
    pub inner: Arc<Vector>,
    pub index: Vec<u32>,
}

/// Values of several types. Slot `i` is `values[tags[i]]` at position
/// `index[i]`.
#[derive(Debug, Clone)]
pub struct DynamicVec {
    pub tags: Vec<u32>,
    pub index: Vec<u32>,
    pub values: Vec<Vector>,
}

#[derive(Debug, Clone)]
pub enum Vector {
    Bool(Flat<bool>),
    Int(Flat<i64>),
    Uint(Flat<u64>),
    Float(Flat<f64>),
    Bytes(BytesVec),
    Null(usize),
    Record(RecordVec),
    Array(ArrayVec),
    Map(MapVec),
    Union(UnionVec),
    Named(Type, Box<Vector>),
    Error(Type, Box<Vector>),
    Const(Value, usize),
    Dict(DictVec),
    View(ViewVec),
    Dynamic(DynamicVec),
}

impl Vector {
    pub fn len(&self) -> usize {
        match self {
            Vector::Bool(v) => v.values.len(),
            Vector::Int(v) => v.values.len(),
            Vector::Uint(v) => v.values.len(),
            Vector::Float(v) => v.values.len(),
            Vector::Bytes(v) => v.offsets.len().saturating_sub(1),
            Vector::Null(n) | Vector::Const(_, n) => *n,
            Vector::Record(v) => v.len,
            Vector::Array(v) => v.offsets.len().saturating_sub(1),
            Vector::Map(v) => v.offsets.len().saturating_sub(1),
            Vector::Union(v) => v.tags.len(),
            Vector::Named(_, v) | Vector::Error(_, v) => v.len(),
            Vector::Dict(v) => v.index.len(),
            Vector::View(v) => v.index.len(),
            Vector::Dynamic(v) => v.tags.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The type shared by every slot, or None for a dynamic vector.
    pub fn uniform_type(&self) -> Option<Type> {
        match self {
            Vector::Bool(v) => Some(v.typ.clone()),
            Vector::Int(v) => Some(v.typ.clone()),
            Vector::Uint(v) => Some(v.typ.clone()),
            Vector::Float(v) => Some(v.typ.clone()),
            Vector::Bytes(v) => Some(v.typ.clone()),
            Vector::Null(_) => Some(Type::NULL),
            Vector::Record(v) => Some(v.typ.clone()),
            Vector::Array(v) => Some(v.typ.clone()),
            Vector::Map(v) => Some(v.typ.clone()),
            Vector::Union(v) => Some(v.typ.clone()),
            Vector::Named(t, _) | Vector::Error(t, _) => Some(t.clone()),
            Vector::Const(val, _) => Some(val.typ().clone()),
            Vector::Dict(v) => v.values.uniform_type(),
            Vector::View(v) => v.inner.uniform_type(),
            Vector::Dynamic(v) if v.values.len() == 1 => v.values[0].uniform_type(),
            Vector::Dynamic(_) => None,
        }
    }

    pub fn typ_at(&self, i: usize) -> Type {
        match self {
            Vector::Dict(v) => v.values.typ_at(v.index[i] as usize),
            Vector::View(v) => v.inner.typ_at(v.index[i] as usize),
            Vector::Dynamic(v) => v.values[v.tags[i] as usize].typ_at(v.index[i] as usize),
            _ => self.uniform_type().unwrap_or(Type::NULL),
        }
    }

    pub fn is_null_at(&self, i: usize) -> bool {
        match self {
            Vector::Bool(v) => v.nulls.is_null(i),
            Vector::Int(v) => v.nulls.is_null(i),
            Vector::Uint(v) => v.nulls.is_null(i),
            Vector::Float(v) => v.nulls.is_null(i),
            Vector::Bytes(v) => v.nulls.is_null(i),
            Vector::Null(_) => true,
            Vector::Record(v) => v.nulls.is_null(i),
            Vector::Array(v) => v.nulls.is_null(i),
            Vector::Map(v) => v.nulls.is_null(i),
            Vector::Union(v) => v.nulls.is_null(i),
            Vector::Named(_, v) | Vector::Error(_, v) => v.is_null_at(i),
            Vector::Const(val, _) => val.is_null(),
            Vector::Dict(v) => v.values.is_null_at(v.index[i] as usize),
            Vector::View(v) => v.inner.is_null_at(v.index[i] as usize),
            Vector::Dynamic(v) => v.values[v.tags[i] as usize].is_null_at(v.index[i] as usize),
        }
    }

    /// SCODE body of slot `i`.
    pub fn body_at(&self, i: usize) -> Option<Bytes> {
        if self.is_null_at(i) {
            return None;
        }
        match self {
            Vector::Bool(v) => Some(Bytes::from(scode::encode_bool(v.values[i]))),
            Vector::Int(v) => Some(Bytes::from(scode::encode_int(v.values[i]))),
            Vector::Uint(v) => Some(Bytes::from(scode::encode_uint(v.values[i]))),
            Vector::Float(v) => Value::from_float(v.typ.clone(), v.values[i]).into_parts().1,
            Vector::Bytes(v) => Some(v.data.slice(v.offsets[i] as usize..v.offsets[i + 1] as usize)),
            Vector::Null(_) => None,
            Vector::Record(v) => {
                let mut buf = Vec::new();
                for f in &v.fields {
                    scode::append_tagged(&mut buf, f.body_at(i).as_deref());
                }
                Some(Bytes::from(buf))
            }
            Vector::Array(v) => {
                let mut buf = Vec::new();
                for j in v.offsets[i]..v.offsets[i + 1] {
                    scode::append_tagged(&mut buf, v.values.body_at(j as usize).as_deref());
                }
                Some(Bytes::from(buf))
            }
            Vector::Map(v) => {
                let mut buf = Vec::new();
                for j in v.offsets[i]..v.offsets[i + 1] {
                    scode::append_tagged(&mut buf, v.keys.body_at(j as usize).as_deref());
                    scode::append_tagged(&mut buf, v.values.body_at(j as usize).as_deref());
                }
                Some(Bytes::from(buf))
            }
            Vector::Union(v) => {
                let mut buf = Vec::new();
                scode::append_uvarint(&mut buf, v.tags[i] as u64);
                let inner = v.values[v.tags[i] as usize].body_at(v.index[i] as usize);
                scode::append_tagged(&mut buf, inner.as_deref());
                Some(Bytes::from(buf))
            }
            Vector::Named(_, v) | Vector::Error(_, v) => v.body_at(i),
            Vector::Const(val, _) => val.body().cloned(),
            Vector::Dict(v) => v.values.body_at(v.index[i] as usize),
            Vector::View(v) => v.inner.body_at(v.index[i] as usize),
            Vector::Dynamic(v) => v.values[v.tags[i] as usize].body_at(v.index[i] as usize),
        }
    }

    pub fn value_at(&self, i: usize) -> Value {
        match self {
            Vector::Const(val, _) => val.clone(),
            Vector::View(v) => v.inner.value_at(v.index[i] as usize),
            Vector::Dynamic(v) => v.values[v.tags[i] as usize].value_at(v.index[i] as usize),
            _ => Value::new(self.typ_at(i), self.body_at(i)),
        }
    }

    /// Materializes every slot.
    pub fn values(&self) -> Vec<Value> {
        (0..self.len()).map(|i| self.value_at(i)).collect()
    }

    /// The slots at `index`, in that order.
    pub fn pick(&self, index: Vec<u32>) -> Vector {
        match self {
            Vector::Const(val, _) => Vector::Const(val.clone(), index.len()),
            Vector::Null(_) => Vector::Null(index.len()),
            Vector::View(v) => Vector::View(ViewVec {
                inner: v.inner.clone(),
                index: index.iter().map(|i| v.index[*i as usize]).collect(),
            }),
            _ => Vector::View(ViewVec {
                inner: Arc::new(self.clone()),
                index,
            }),
        }
    }

    /// Interleaves the slots of several vectors. `picks[i]` names the
    /// vector and the slot that becomes slot `i`.
    pub fn interleave(values: Vec<Vector>, picks: Vec<(u32, u32)>) -> Vector {
        if values.len() == 1 {
            let index: Vec<u32> = picks.into_iter().map(|(_, i)| i).collect();
            let only = &values[0];
            if index.len() == only.len() && index.iter().enumerate().all(|(i, j)| i as u32 == *j) {
                return values.into_iter().next().unwrap_or(Vector::Null(0));
            }
            return only.pick(index);
        }
        let (tags, index) = picks.into_iter().unzip();
        Vector::Dynamic(DynamicVec { tags, index, values })
    }

    /// Builds a vector from values, grouping them by type.
    pub fn from_values(vals: &[Value]) -> Vector {
        let Some(first) = vals.first() else {
            return Vector::Null(0);
        };
        if vals.iter().all(|v| v.typ() == first.typ()) {
            let bodies: Vec<Option<Bytes>> = vals.iter().map(|v| v.body().cloned()).collect();
            return Vector::from_bodies(first.typ(), &bodies);
        }
        let mut groups: IndexMap<Type, Vec<Option<Bytes>>> = IndexMap::new();
        let mut tags = Vec::with_capacity(vals.len());
        let mut index = Vec::with_capacity(vals.len());
        for v in vals {
            let entry = groups.entry(v.typ().clone());
            let tag = entry.index();
            let bodies = entry.or_default();
            tags.push(tag as u32);
            index.push(bodies.len() as u32);
            bodies.push(v.body().cloned());
        }
        let values = groups.iter().map(|(t, b)| Vector::from_bodies(t, b)).collect();
        Vector::Dynamic(DynamicVec { tags, index, values })
    }

    /// Decodes SCODE bodies of a single type into columns.
    pub fn from_bodies(typ: &Type, bodies: &[Option<Bytes>]) -> Vector {
        let nulls = Nulls::from_flags(bodies.iter().map(Option::is_none).collect());
        match typ.kind() {
            None => from_primitive(typ, bodies, nulls),
            Some(ComplexKind::Record(fields)) => {
                let mut cols: Vec<Vec<Option<Bytes>>> = vec![Vec::with_capacity(bodies.len()); fields.len()];
                for body in bodies {
                    match body {
                        Some(b) => {
                            let mut it = scode::Iter::new(b);
                            for col in cols.iter_mut() {
                                let field = it.next().flatten().map(|f| b.slice_ref(f));
                                col.push(field);
                            }
                        }
                        None => cols.iter_mut().for_each(|c| c.push(None)),
                    }
                }
                Vector::Record(RecordVec {
                    typ: typ.clone(),
                    fields: fields.iter().zip(&cols).map(|(f, c)| Vector::from_bodies(&f.typ, c)).collect(),
                    len: bodies.len(),
                    nulls,
                })
            }
            Some(ComplexKind::Array(inner)) | Some(ComplexKind::Set(inner)) => {
                let (offsets, elems) = split_elements(bodies, 1);
                Vector::Array(ArrayVec {
                    typ: typ.clone(),
                    offsets,
                    values: Box::new(Vector::from_bodies(inner, &elems[0])),
                    nulls,
                })
            }
            Some(ComplexKind::Map(k, v)) => {
                let (offsets, mut elems) = split_elements(bodies, 2);
                let vals = elems.pop().unwrap_or_default();
                let keys = elems.pop().unwrap_or_default();
                Vector::Map(MapVec {
                    typ: typ.clone(),
                    offsets,
                    keys: Box::new(Vector::from_bodies(k, &keys)),
                    values: Box::new(Vector::from_bodies(v, &vals)),
                    nulls,
                })
            }
            Some(ComplexKind::Union(members)) => {
                let mut parts: Vec<Vec<Option<Bytes>>> = vec![Vec::new(); members.len()];
                let mut tags = Vec::with_capacity(bodies.len());
                let mut index = Vec::with_capacity(bodies.len());
                let mut flags = Vec::with_capacity(bodies.len());
                for body in bodies {
                    let decoded = body.as_ref().and_then(|b| {
                        let (tag, n) = scode::read_uvarint(b)?;
                        let rest = b.slice(n..);
                        let inner = scode::Iter::new(&rest).next()?.map(|e| rest.slice_ref(e));
                        Some((tag as usize, inner))
                    });
                    match decoded {
                        Some((tag, inner)) if tag < members.len() => {
                            tags.push(tag as u32);
                            index.push(parts[tag].len() as u32);
                            parts[tag].push(inner);
                            flags.push(false);
                        }
                        _ => {
                            tags.push(0);
                            index.push(0);
                            flags.push(true);
                        }
                    }
                }
                let nulls = Nulls::from_flags(flags);
                Vector::Union(UnionVec {
                    typ: typ.clone(),
                    tags,
                    index,
                    values: members.iter().zip(&parts).map(|(t, p)| Vector::from_bodies(t, p)).collect(),
                    nulls,
                })
            }
            Some(ComplexKind::Enum(_)) => {
                let values = bodies.iter().map(|b| b.as_deref().map(scode::decode_uint).unwrap_or(0)).collect();
                Vector::Uint(Flat {
                    typ: typ.clone(),
                    values,
                    nulls,
                })
            }
            Some(ComplexKind::Named(_, inner)) => Vector::Named(typ.clone(), Box::new(Vector::from_bodies(inner, bodies))),
            Some(ComplexKind::Error(inner)) => Vector::Error(typ.clone(), Box::new(Vector::from_bodies(inner, bodies))),
        }
    }
}

fn from_primitive(typ: &Type, bodies: &[Option<Bytes>], nulls: Nulls) -> Vector {
    let Some(p) = typ.primitive() else {
        return Vector::Null(bodies.len());
    };
    match p {
        PrimitiveType::Null => Vector::Null(bodies.len()),
        PrimitiveType::Bool => Vector::Bool(Flat {
            typ: typ.clone(),
            values: bodies.iter().map(|b| b.as_deref().map(scode::decode_bool).unwrap_or(false)).collect(),
            nulls,
        }),
        p if p.is_signed() => Vector::Int(Flat {
            typ: typ.clone(),
            values: bodies.iter().map(|b| b.as_deref().map(scode::decode_int).unwrap_or(0)).collect(),
            nulls,
        }),
        p if p.is_unsigned() => Vector::Uint(Flat {
            typ: typ.clone(),
            values: bodies.iter().map(|b| b.as_deref().map(scode::decode_uint).unwrap_or(0)).collect(),
            nulls,
        }),
        p if p.is_float() => Vector::Float(Flat {
            typ: typ.clone(),
            values: bodies.iter().map(|b| b.as_deref().and_then(scode::decode_float).unwrap_or(0.0)).collect(),
            nulls,
        }),
        _ => {
            let mut offsets = Vec::with_capacity(bodies.len() + 1);
            let mut data = Vec::new();
            offsets.push(0);
            for b in bodies {
                if let Some(b) = b {
                    data.extend_from_slice(b);
                }
                offsets.push(data.len() as u32);
            }
            Vector::Bytes(BytesVec {
                typ: typ.clone(),
                offsets,
                data: Bytes::from(data),
                nulls,
            })
        }
    }
}

/// Splits container bodies into offsets and `stride` element columns
/// (one for arrays and sets, keys then values for maps).
fn split_elements(bodies: &[Option<Bytes>], stride: usize) -> (Vec<u32>, Vec<Vec<Option<Bytes>>>) {
    let mut offsets = Vec::with_capacity(bodies.len() + 1);
    let mut cols: Vec<Vec<Option<Bytes>>> = vec![Vec::new(); stride];
    offsets.push(0);
    for body in bodies {
        if let Some(b) = body {
            for (n, elem) in scode::Iter::new(b).enumerate() {
                cols[n % stride].push(elem.map(|e| b.slice_ref(e)));
            }
        }
        offsets.push(cols[0].len() as u32);
    }
    (offsets, cols)
}

impl Chunk for Vector {
    fn len(&self) -> usize {
        Vector::len(self)
    }

    fn slice(&self, from: usize, to: usize) -> Self {
        self.pick((from as u32..to as u32).collect())
    }

    fn concat(chunks: Vec<Self>) -> Option<Self> {
        if chunks.len() <= 1 {
            return chunks.into_iter().next();
        }
        let mut picks = Vec::new();
        for (tag, c) in chunks.iter().enumerate() {
            picks.extend((0..c.len() as u32).map(|i| (tag as u32, i)));
        }
        Some(Vector::interleave(chunks, picks))
    }
}

/// Turns vectors back into batches of values.
pub struct Materializer {
    parent: BoxPuller<Vector>,
}

impl Materializer {
    pub fn new(parent: BoxPuller<Vector>) -> Self {
        Materializer { parent }
    }
}

impl Puller for Materializer {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        loop {
            let Some(vec) = self.parent.pull(done)? else {
                return Ok(None);
            };
            if let Some(b) = batch_of(vec.values()) {
                return Ok(Some(b));
            }
        }
    }
}

/// Turns batches of values into vectors.
pub struct Dematerializer {
    parent: BoxPuller,
}

impl Dematerializer {
    pub fn new(parent: BoxPuller) -> Self {
        Dematerializer { parent }
    }
}

impl Puller<Vector> for Dematerializer {
    fn pull(&mut self, done: bool) -> Result<Option<Vector>> {
        Ok(self.parent.pull(done)?.map(|b| Vector::from_values(b.values())))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::runtime::RuntimeContext;
    use crate::runtime::testutil::source;

    pub fn vsource(rctx: &RuntimeContext, sup: &str) -> BoxPuller<Vector> {
        Box::new(Dematerializer::new(source(rctx, sup)))
    }

    pub fn vrun(p: BoxPuller<Vector>) -> Vec<String> {
        crate::runtime::testutil::run(&mut Materializer::new(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeContext;
    use crate::value::sup::parse_values;

    fn text(v: &Vector) -> Vec<String> {
        v.values().iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn single_type_values_become_columns() {
        let ctx = TypeContext::new();
        let vals = parse_values(&ctx, "{a:1,b:\"x\"} {a:2,b:\"yz\"} {a:3,b:\"\"}").unwrap();
        let vec = Vector::from_values(&vals);
        let Vector::Record(rec) = &vec else {
            panic!("expected a record vector");
        };
        assert!(matches!(rec.fields[0], Vector::Int(_)));
        assert!(matches!(rec.fields[1], Vector::Bytes(_)));
        assert_eq!(vec!["{a:1,b:\"x\"}", "{a:2,b:\"yz\"}", "{a:3,b:\"\"}"], text(&vec));
    }

    #[test]
    fn mixed_types_become_dynamic() {
        let ctx = TypeContext::new();
        let src = "1 \"a\" [1,2] 2 |[3]| {x:1.5} null {x:null}";
        let vals = parse_values(&ctx, src).unwrap();
        let vec = Vector::from_values(&vals);
        assert!(matches!(vec, Vector::Dynamic(_)));
        let want: Vec<String> = vals.iter().map(|v| v.to_string()).collect();
        assert_eq!(want, text(&vec));
    }

    #[test]
    fn union_elements_keep_their_tags() {
        let ctx = TypeContext::new();
        let vals = parse_values(&ctx, "[1,\"a\",null] [\"b\"]").unwrap();
        let vec = Vector::from_values(&vals);
        let want: Vec<String> = vals.iter().map(|v| v.to_string()).collect();
        assert_eq!(want, text(&vec));
    }

    #[test]
    fn slices_and_concatenation() {
        let ctx = TypeContext::new();
        let a = Vector::from_values(&parse_values(&ctx, "1 2 3 4").unwrap());
        let b = Vector::from_values(&parse_values(&ctx, "\"x\"").unwrap());
        let s = a.slice(1, 3);
        assert_eq!(vec!["2", "3"], text(&s));
        assert_eq!(vec!["3"], text(&s.slice(1, 2)));
        let joined = Vector::concat(vec![s, b]).unwrap();
        assert_eq!(vec!["2", "3", "\"x\""], text(&joined));
    }
}
