//! Canonical, self-contained byte encoding of a type.
//!
//! Primitive types encode as their id. Complex types start with one of the
//! codes below followed by their components. Named types are emitted as a
//! definition the first time a name appears and as a reference afterwards.
use std::collections::HashMap;

use superdb_error::{DbError, Result};

use super::{ComplexKind, Field, PrimitiveType, Type, TypeContext};
use crate::value::scode::{append_uvarint, read_uvarint};

pub const TYPE_VALUE_RECORD: u8 = 30;
pub const TYPE_VALUE_ARRAY: u8 = 31;
pub const TYPE_VALUE_SET: u8 = 32;
pub const TYPE_VALUE_MAP: u8 = 33;
pub const TYPE_VALUE_UNION: u8 = 34;
pub const TYPE_VALUE_ENUM: u8 = 35;
pub const TYPE_VALUE_ERROR: u8 = 36;
pub const TYPE_VALUE_NAME_DEF: u8 = 37;
pub const TYPE_VALUE_NAME_REF: u8 = 38;

pub fn encode_type_value(typ: &Type) -> Vec<u8> {
    let mut out = Vec::new();
    let mut typedefs = HashMap::new();
    append_type_value(&mut out, typ, &mut typedefs);
    out
}

pub fn append_type_value(out: &mut Vec<u8>, typ: &Type, typedefs: &mut HashMap<String, Type>) {
    let kind = match typ {
        Type::Primitive(p) => {
            out.push(p.id() as u8);
            return;
        }
        Type::Complex(c) => &c.kind,
    };
    match kind {
        ComplexKind::Record(fields) => {
            out.push(TYPE_VALUE_RECORD);
            append_uvarint(out, fields.len() as u64);
            for field in fields {
                append_name(out, &field.name);
                append_type_value(out, &field.typ, typedefs);
            }
        }
        ComplexKind::Array(inner) => {
            out.push(TYPE_VALUE_ARRAY);
            append_type_value(out, inner, typedefs);
        }
        ComplexKind::Set(inner) => {
            out.push(TYPE_VALUE_SET);
            append_type_value(out, inner, typedefs);
        }
        ComplexKind::Map(key, val) => {
            out.push(TYPE_VALUE_MAP);
            append_type_value(out, key, typedefs);
            append_type_value(out, val, typedefs);
        }
        ComplexKind::Union(types) => {
            out.push(TYPE_VALUE_UNION);
            append_uvarint(out, types.len() as u64);
            for t in types {
                append_type_value(out, t, typedefs);
            }
        }
        ComplexKind::Enum(symbols) => {
            out.push(TYPE_VALUE_ENUM);
            append_uvarint(out, symbols.len() as u64);
            for s in symbols {
                append_name(out, s);
            }
        }
        ComplexKind::Error(inner) => {
            out.push(TYPE_VALUE_ERROR);
            append_type_value(out, inner, typedefs);
        }
        ComplexKind::Named(name, inner) => {
            if typedefs.get(name) == Some(typ) {
                out.push(TYPE_VALUE_NAME_REF);
                append_name(out, name);
            } else {
                out.push(TYPE_VALUE_NAME_DEF);
                append_name(out, name);
                typedefs.insert(name.clone(), typ.clone());
                append_type_value(out, inner, typedefs);
            }
        }
    }
}

fn append_name(out: &mut Vec<u8>, name: &str) {
    append_uvarint(out, name.len() as u64);
    out.extend_from_slice(name.as_bytes());
}

fn bad_type_value() -> DbError {
    DbError::format("bad type value encoding")
}

/// Decodes a type value, interning every type in `ctx`. Returns the type and
/// the number of bytes consumed.
pub fn decode_type_value(ctx: &TypeContext, buf: &[u8]) -> Result<(Type, usize)> {
    let mut decoder = Decoder {
        ctx,
        buf,
        off: 0,
        typedefs: HashMap::new(),
    };
    let typ = decoder.decode()?;
    Ok((typ, decoder.off))
}

struct Decoder<'a> {
    ctx: &'a TypeContext,
    buf: &'a [u8],
    off: usize,
    typedefs: HashMap<Vec<u8>, Type>,
}

impl Decoder<'_> {
    fn byte(&mut self) -> Result<u8> {
        let b = *self.buf.get(self.off).ok_or_else(bad_type_value)?;
        self.off += 1;
        Ok(b)
    }

    fn uvarint(&mut self) -> Result<usize> {
        let (v, n) = read_uvarint(&self.buf[self.off..]).ok_or_else(bad_type_value)?;
        self.off += n;
        Ok(v as usize)
    }

    fn name(&mut self) -> Result<&[u8]> {
        let len = self.uvarint()?;
        let end = self.off.checked_add(len).ok_or_else(bad_type_value)?;
        let name = self.buf.get(self.off..end).ok_or_else(bad_type_value)?;
        self.off = end;
        Ok(name)
    }

    fn decode(&mut self) -> Result<Type> {
        let code = self.byte()?;
        if code < TYPE_VALUE_RECORD {
            return PrimitiveType::from_id(code as u32)
                .map(Type::Primitive)
                .ok_or_else(bad_type_value);
        }
        match code {
            TYPE_VALUE_RECORD => {
                let n = self.uvarint()?;
                let mut fields = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    let name = String::from_utf8(self.name()?.to_vec())?;
                    let typ = self.decode()?;
                    fields.push(Field::new(name, typ));
                }
                self.ctx.lookup_record(fields)
            }
            TYPE_VALUE_ARRAY => {
                let inner = self.decode()?;
                Ok(self.ctx.lookup_array(&inner))
            }
            TYPE_VALUE_SET => {
                let inner = self.decode()?;
                Ok(self.ctx.lookup_set(&inner))
            }
            TYPE_VALUE_MAP => {
                let key = self.decode()?;
                let val = self.decode()?;
                Ok(self.ctx.lookup_map(&key, &val))
            }
            TYPE_VALUE_UNION => {
                let n = self.uvarint()?;
                let mut types = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    types.push(self.decode()?);
                }
                self.ctx.lookup_union(types)
            }
            TYPE_VALUE_ENUM => {
                let n = self.uvarint()?;
                let mut symbols = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    symbols.push(String::from_utf8(self.name()?.to_vec())?);
                }
                self.ctx.lookup_enum(symbols)
            }
            TYPE_VALUE_ERROR => {
                let inner = self.decode()?;
                Ok(self.ctx.lookup_error(&inner))
            }
            TYPE_VALUE_NAME_DEF => {
                let name = self.name()?.to_vec();
                let inner = self.decode()?;
                let typ = self.ctx.lookup_named_bytes(&name, &inner)?;
                self.typedefs.insert(name, typ.clone());
                Ok(typ)
            }
            TYPE_VALUE_NAME_REF => {
                let name = self.name()?.to_vec();
                if let Some(typ) = self.typedefs.get(&name) {
                    return Ok(typ.clone());
                }
                let name = String::from_utf8(name)?;
                self.ctx
                    .lookup_def(&name)
                    .ok_or_else(|| DbError::format(format!("no type named {name:?}")))
            }
            _ => Err(bad_type_value()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_is_single_byte() {
        assert_eq!(vec![9], encode_type_value(&Type::INT64));
    }

    #[test]
    fn named_reference_after_definition() {
        let ctx = TypeContext::new();
        let port = ctx.lookup_named("port", &Type::UINT16).unwrap();
        let rec = ctx
            .lookup_record(vec![Field::new("src", port.clone()), Field::new("dst", port)])
            .unwrap();
        let bytes = encode_type_value(&rec);
        assert_eq!(1, bytes.iter().filter(|b| **b == TYPE_VALUE_NAME_REF).count());

        let other = TypeContext::new();
        let (decoded, n) = decode_type_value(&other, &bytes).unwrap();
        assert_eq!(bytes.len(), n);
        assert_eq!(bytes, encode_type_value(&decoded));
    }

    #[test]
    fn truncated_input_fails() {
        let ctx = TypeContext::new();
        let arr = ctx.lookup_array(&Type::STRING);
        let bytes = encode_type_value(&arr);
        assert!(decode_type_value(&ctx, &bytes[..1]).is_err());
    }
}
