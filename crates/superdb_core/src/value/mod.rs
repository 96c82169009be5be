//! Typed values: a type plus an SCODE body.
pub mod coerce;
pub mod compare;
pub mod fuse;
pub mod scode;
pub mod sup;

use std::fmt;
use std::net::IpAddr;

use bytes::Bytes;
use half::f16;

pub use scode::Builder as ValueBuilder;

use crate::types::{ComplexKind, PrimitiveType, Type, TypeContext};

/// A value is a type and its body. A null value has no body.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Value {
    typ: Type,
    body: Option<Bytes>,
}

impl Value {
    pub fn new(typ: Type, body: Option<Bytes>) -> Self {
        Value { typ, body }
    }

    pub const fn null() -> Self {
        Value {
            typ: Type::NULL,
            body: None,
        }
    }

    pub fn null_of(typ: Type) -> Self {
        Value { typ, body: None }
    }

    pub fn typ(&self) -> &Type {
        &self.typ
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn into_parts(self) -> (Type, Option<Bytes>) {
        (self.typ, self.body)
    }

    pub fn is_null(&self) -> bool {
        self.body.is_none()
    }

    pub fn is_error(&self) -> bool {
        self.typ.under().is_error()
    }

    fn is_error_string(&self, s: &str) -> bool {
        match self.typ.under().kind() {
            Some(ComplexKind::Error(inner)) => {
                *inner.under() == Type::STRING && self.bytes() == Some(s.as_bytes())
            }
            _ => false,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.is_error_string("missing")
    }

    pub fn is_quiet(&self) -> bool {
        self.is_error_string("quiet")
    }

    pub fn from_int64(v: i64) -> Self {
        Self::from_int(Type::INT64, v)
    }

    pub fn from_int(typ: Type, v: i64) -> Self {
        Value::new(typ, Some(Bytes::from(scode::encode_int(v))))
    }

    pub fn from_uint64(v: u64) -> Self {
        Self::from_uint(Type::UINT64, v)
    }

    pub fn from_uint(typ: Type, v: u64) -> Self {
        Value::new(typ, Some(Bytes::from(scode::encode_uint(v))))
    }

    pub fn from_float64(v: f64) -> Self {
        Value::new(Type::FLOAT64, Some(Bytes::from(scode::encode_float64(v))))
    }

    /// Encodes `v` at the width of the float type `typ`.
    pub fn from_float(typ: Type, v: f64) -> Self {
        let body = match typ.primitive() {
            Some(PrimitiveType::Float16) => scode::encode_float16(f16::from_f64(v)),
            Some(PrimitiveType::Float32) => scode::encode_float32(v as f32),
            _ => scode::encode_float64(v),
        };
        Value::new(typ, Some(Bytes::from(body)))
    }

    pub fn from_bool(v: bool) -> Self {
        Value::new(Type::BOOL, Some(Bytes::from(scode::encode_bool(v))))
    }

    pub fn from_str(s: &str) -> Self {
        Value::new(Type::STRING, Some(Bytes::copy_from_slice(s.as_bytes())))
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        Value::new(Type::BYTES, Some(Bytes::copy_from_slice(b)))
    }

    pub fn from_time(nanos: i64) -> Self {
        Self::from_int(Type::TIME, nanos)
    }

    pub fn from_duration(nanos: i64) -> Self {
        Self::from_int(Type::DURATION, nanos)
    }

    pub fn from_ip(ip: IpAddr) -> Self {
        Value::new(Type::IP, Some(Bytes::from(scode::encode_ip(ip))))
    }

    pub fn from_net(ip: IpAddr, prefix: u8) -> Self {
        Value::new(Type::NET, Some(Bytes::from(scode::encode_net(ip, prefix))))
    }

    pub fn from_type(ctx: &TypeContext, typ: &Type) -> Self {
        Value::new(Type::TYPE, Some(ctx.encode_type_value(typ)))
    }

    fn prim(&self) -> Option<PrimitiveType> {
        self.typ.under().primitive()
    }

    /// Integer view of signed, unsigned (when it fits), time and duration
    /// values.
    pub fn as_int(&self) -> Option<i64> {
        let p = self.prim()?;
        let b = self.bytes()?;
        if p.is_signed() {
            Some(scode::decode_int(b))
        } else if p.is_unsigned() {
            i64::try_from(scode::decode_uint(b)).ok()
        } else {
            None
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        let p = self.prim()?;
        let b = self.bytes()?;
        if p.is_unsigned() {
            Some(scode::decode_uint(b))
        } else if p.is_signed() {
            u64::try_from(scode::decode_int(b)).ok()
        } else {
            None
        }
    }

    /// Float view of any numeric value.
    pub fn as_float(&self) -> Option<f64> {
        let p = self.prim()?;
        let b = self.bytes()?;
        if p.is_float() {
            scode::decode_float(b)
        } else if p.is_unsigned() {
            Some(scode::decode_uint(b) as f64)
        } else if p.is_signed() {
            Some(scode::decode_int(b) as f64)
        } else {
            None
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.prim()? {
            PrimitiveType::Bool => Some(scode::decode_bool(self.bytes()?)),
            _ => None,
        }
    }

    /// String view of string values.
    pub fn as_str(&self) -> Option<&str> {
        match self.prim()? {
            PrimitiveType::String => std::str::from_utf8(self.bytes()?).ok(),
            _ => None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.as_bool() == Some(true)
    }

    /// Strips named types and resolves union values to their member value.
    pub fn under(&self) -> Value {
        let mut val = self.clone();
        loop {
            match val.typ.kind() {
                Some(ComplexKind::Named(_, inner)) => val.typ = inner.clone(),
                Some(ComplexKind::Union(types)) => {
                    let Some(body) = &val.body else {
                        return Value::null_of(val.typ.under().clone());
                    };
                    let Some((tag, n)) = scode::read_uvarint(body) else {
                        return val;
                    };
                    let Some(typ) = types.get(tag as usize) else {
                        return val;
                    };
                    let inner = body.slice(n..);
                    let mut it = scode::Iter::new(&inner);
                    let elem = match it.next() {
                        Some(Some(b)) => Some(inner.slice_ref(b)),
                        _ => None,
                    };
                    val = Value::new(typ.clone(), elem);
                }
                _ => return val,
            }
        }
    }

    /// Looks up a field of a record value.
    pub fn deref(&self, field: &str) -> Option<Value> {
        let val = self.under();
        let fields = val.typ.record_fields()?;
        let idx = fields.iter().position(|f| f.name == field)?;
        let typ = fields[idx].typ.clone();
        let Some(body) = val.body() else {
            return Some(Value::null_of(typ));
        };
        let elem = scode::Iter::new(body).nth(idx)?;
        Some(Value::new(typ, elem.map(|b| body.slice_ref(b))))
    }

    pub fn deref_path<S: AsRef<str>>(&self, path: &[S]) -> Option<Value> {
        let mut val = self.clone();
        for name in path {
            val = val.deref(name.as_ref())?;
        }
        Some(val)
    }

    /// Field values of a record, in order.
    pub fn fields(&self) -> Vec<(String, Value)> {
        let val = self.under();
        let Some(fields) = val.typ.record_fields() else {
            return Vec::new();
        };
        let Some(body) = val.body() else {
            return fields
                .iter()
                .map(|f| (f.name.clone(), Value::null_of(f.typ.clone())))
                .collect();
        };
        fields
            .iter()
            .zip(scode::Iter::new(body))
            .map(|(f, elem)| {
                (
                    f.name.clone(),
                    Value::new(f.typ.clone(), elem.map(|b| body.slice_ref(b))),
                )
            })
            .collect()
    }

    /// Elements of an array or set, or the key/value alternation of a map.
    pub fn elements(&self) -> Vec<Value> {
        let val = self.under();
        let Some(body) = val.body() else {
            return Vec::new();
        };
        match val.typ.kind() {
            Some(ComplexKind::Array(inner)) | Some(ComplexKind::Set(inner)) => scode::Iter::new(body)
                .map(|elem| Value::new(inner.clone(), elem.map(|b| body.slice_ref(b))))
                .collect(),
            Some(ComplexKind::Map(k, v)) => scode::Iter::new(body)
                .enumerate()
                .map(|(i, elem)| {
                    let typ = if i % 2 == 0 { k.clone() } else { v.clone() };
                    Value::new(typ, elem.map(|b| body.slice_ref(b)))
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Number of elements in a container or bytes in a stringy value.
    pub fn len(&self) -> Option<usize> {
        let val = self.under();
        match val.typ.kind() {
            Some(ComplexKind::Record(fields)) => Some(fields.len()),
            Some(ComplexKind::Array(_)) | Some(ComplexKind::Set(_)) => {
                Some(val.bytes().map(|b| scode::Iter::new(b).count()).unwrap_or(0))
            }
            Some(ComplexKind::Map(_, _)) => {
                Some(val.bytes().map(|b| scode::Iter::new(b).count() / 2).unwrap_or(0))
            }
            None => match val.typ.primitive()? {
                PrimitiveType::String | PrimitiveType::Bytes => {
                    Some(val.bytes().map(|b| b.len()).unwrap_or(0))
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Inner value of an error value.
    pub fn error_inner(&self) -> Option<Value> {
        match self.typ.under().kind() {
            Some(ComplexKind::Error(inner)) => Some(Value::new(inner.clone(), self.body.clone())),
            _ => None,
        }
    }

    /// Byte size used for progress accounting.
    pub fn size(&self) -> usize {
        self.body.as_ref().map(|b| b.len()).unwrap_or(0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        sup::write_value(f, self)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Builds a record value from named field values, interning the record type.
pub fn new_record(ctx: &TypeContext, fields: Vec<(String, Value)>) -> superdb_error::Result<Value> {
    let mut b = ValueBuilder::new();
    let mut types = Vec::with_capacity(fields.len());
    for (name, val) in fields {
        b.append(val.bytes());
        types.push(crate::types::Field::new(name, val.typ));
    }
    let typ = ctx.lookup_record(types)?;
    Ok(Value::new(typ, Some(b.into_bytes())))
}

/// Builds an array value. Elements of differing types are wrapped in a
/// union.
pub fn new_array(ctx: &TypeContext, elems: &[Value]) -> superdb_error::Result<Value> {
    build_sequence(ctx, elems, false)
}

pub fn new_set(ctx: &TypeContext, elems: &[Value]) -> superdb_error::Result<Value> {
    build_sequence(ctx, elems, true)
}

fn build_sequence(ctx: &TypeContext, elems: &[Value], set: bool) -> superdb_error::Result<Value> {
    let inner = unify_types(ctx, elems.iter().map(|v| v.typ()))?;
    let mut b = ValueBuilder::new();
    b.begin_container();
    for e in elems {
        append_as(&mut b, &inner, e);
    }
    if set {
        b.end_set();
    } else {
        b.end_container();
    }
    let typ = if set {
        ctx.lookup_set(&inner)
    } else {
        ctx.lookup_array(&inner)
    };
    Ok(Value::new(typ, b.into_first_body()))
}

/// Appends `val` to a builder as a value of `target`, adding the union tag
/// when `target` is a union containing the value's type. A null member is
/// written as a null body without a tag, so every null of a union type
/// shares one encoding.
pub fn append_as(b: &mut ValueBuilder, target: &Type, val: &Value) {
    if target != val.typ() {
        if let Some(tag) = target.union_tag(val.typ()) {
            match val.bytes() {
                None => b.append(None),
                Some(body) => {
                    let mut out = Vec::with_capacity(body.len() + 4);
                    scode::append_uvarint(&mut out, tag as u64);
                    scode::append_tagged(&mut out, Some(body));
                    b.append(Some(&out));
                }
            }
            return;
        }
    }
    b.append(val.bytes());
}

/// Single type for a list of element types: the type itself when they agree,
/// null for an empty list, otherwise a union.
pub fn unify_types<'a>(
    ctx: &TypeContext,
    types: impl Iterator<Item = &'a Type>,
) -> superdb_error::Result<Type> {
    let mut uniq: Vec<Type> = Vec::new();
    for t in types {
        if !uniq.contains(t) {
            uniq.push(t.clone());
        }
    }
    match uniq.len() {
        0 => Ok(Type::NULL),
        1 => Ok(uniq.remove(0)),
        _ => ctx.lookup_union(uniq),
    }
}

/// Wraps a member value in a union type.
pub fn new_union_value(union: &Type, val: &Value) -> Value {
    let Some(tag) = union.union_tag(val.typ()) else {
        return val.clone();
    };
    let body = val.bytes().map(|body| {
        let mut out = Vec::with_capacity(body.len() + 4);
        scode::append_uvarint(&mut out, tag as u64);
        scode::append_tagged(&mut out, Some(body));
        Bytes::from(out)
    });
    Value::new(union.clone(), body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_union_member_has_no_tag() {
        let ctx = TypeContext::new();
        let elems = [Value::from_int64(1), Value::from_str("a"), Value::null_of(Type::NULL)];
        let arr = new_array(&ctx, &elems).unwrap();
        let body = arr.bytes().unwrap();
        let mut it = scode::Iter::new(body);
        let mut bodies = Vec::new();
        while let Some(b) = it.try_next().unwrap() {
            bodies.push(b.map(<[u8]>::to_vec));
        }
        assert_eq!(3, bodies.len());
        assert!(bodies[0].is_some());
        assert!(bodies[1].is_some());
        assert_eq!(None, bodies[2]);
    }

    #[test]
    fn record_deref() {
        let ctx = TypeContext::new();
        let rec = new_record(
            &ctx,
            vec![
                ("a".to_string(), Value::from_int64(1)),
                ("b".to_string(), Value::from_str("x")),
            ],
        )
        .unwrap();
        assert_eq!(Some(1), rec.deref("a").unwrap().as_int());
        assert_eq!(Some("x"), rec.deref("b").unwrap().as_str());
        assert!(rec.deref("c").is_none());
        assert_eq!("{a:1,b:\"x\"}", rec.to_string());
    }

    #[test]
    fn mixed_array_is_union() {
        let ctx = TypeContext::new();
        let arr = new_array(&ctx, &[Value::from_int64(1), Value::from_str("a")]).unwrap();
        let elems = arr.elements();
        assert_eq!(2, elems.len());
        assert!(elems[0].typ().is_union());
        assert_eq!(Some(1), elems[0].under().as_int());
        assert_eq!(Some("a"), elems[1].under().as_str());
    }

    #[test]
    fn null_record_fields() {
        let ctx = TypeContext::new();
        let rec = new_record(&ctx, vec![("a".to_string(), Value::from_int64(1))]).unwrap();
        let null = Value::null_of(rec.typ().clone());
        assert!(null.deref("a").unwrap().is_null());
    }
}
