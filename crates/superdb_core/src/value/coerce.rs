//! Conversion of values between types.
use bytes::Bytes;
use chrono::DateTime;
use superdb_error::{DbError, Result};

use super::sup::{format_value, parse_duration};
use super::{Value, ValueBuilder, append_as, new_union_value, scode};
use crate::types::{ComplexKind, PrimitiveType, Type, TypeContext};

fn cannot_cast(val: &Value, typ: &Type) -> DbError {
    DbError::new(format!("cannot cast {val} to type {typ}"))
}

/// Casts `val` to `target`, converting primitives and recursively reshaping
/// containers. Record casts fill absent fields with nulls.
pub fn cast_value(ctx: &TypeContext, val: &Value, target: &Type) -> Result<Value> {
    if val.typ() == target {
        return Ok(val.clone());
    }
    if val.is_null() {
        return Ok(Value::null_of(target.clone()));
    }
    let Some(kind) = target.kind() else {
        let p = target.primitive().unwrap_or(PrimitiveType::Null);
        return cast_primitive(&val.under(), p).ok_or_else(|| cannot_cast(val, target));
    };
    match kind {
        ComplexKind::Named(_, inner) => {
            let v = cast_value(ctx, val, inner)?;
            Ok(Value::new(target.clone(), v.body().cloned()))
        }
        ComplexKind::Union(types) => {
            let v = val.under();
            if target.union_tag(v.typ()).is_some() {
                return Ok(new_union_value(target, &v));
            }
            for t in types {
                if let Ok(c) = cast_value(ctx, &v, t) {
                    return Ok(new_union_value(target, &c));
                }
            }
            Err(cannot_cast(val, target))
        }
        ComplexKind::Enum(symbols) => {
            let v = val.under();
            let idx = match v.as_str() {
                Some(s) => symbols.iter().position(|sym| sym == s),
                None => v.as_uint().map(|u| u as usize).filter(|u| *u < symbols.len()),
            };
            let idx = idx.ok_or_else(|| cannot_cast(val, target))?;
            Ok(Value::new(
                target.clone(),
                Some(Bytes::from(scode::encode_uint(idx as u64))),
            ))
        }
        ComplexKind::Error(inner) => {
            let src = val.error_inner().ok_or_else(|| cannot_cast(val, target))?;
            let v = cast_value(ctx, &src, inner)?;
            Ok(Value::new(target.clone(), v.body().cloned()))
        }
        ComplexKind::Array(inner) | ComplexKind::Set(inner) => {
            let v = val.under();
            if !matches!(
                v.typ().kind(),
                Some(ComplexKind::Array(_)) | Some(ComplexKind::Set(_))
            ) {
                return Err(cannot_cast(val, target));
            }
            let mut b = ValueBuilder::new();
            b.begin_container();
            for elem in v.elements() {
                let c = cast_value(ctx, &elem.under(), inner)?;
                append_as(&mut b, inner, &c);
            }
            if matches!(kind, ComplexKind::Set(_)) {
                b.end_set();
            } else {
                b.end_container();
            }
            Ok(Value::new(target.clone(), b.into_first_body()))
        }
        ComplexKind::Map(kt, vt) => {
            let v = val.under();
            if !matches!(v.typ().kind(), Some(ComplexKind::Map(_, _))) {
                return Err(cannot_cast(val, target));
            }
            let mut b = ValueBuilder::new();
            b.begin_container();
            for pair in v.elements().chunks(2) {
                let [k, x] = pair else {
                    return Err(cannot_cast(val, target));
                };
                append_as(&mut b, kt, &cast_value(ctx, &k.under(), kt)?);
                append_as(&mut b, vt, &cast_value(ctx, &x.under(), vt)?);
            }
            b.end_map();
            Ok(Value::new(target.clone(), b.into_first_body()))
        }
        ComplexKind::Record(fields) => {
            let v = val.under();
            let Some(src_fields) = v.typ().record_fields() else {
                return Err(cannot_cast(val, target));
            };
            if src_fields.iter().any(|f| target.field_index(&f.name).is_none()) {
                return Err(cannot_cast(val, target));
            }
            let mut b = ValueBuilder::new();
            for field in fields {
                let src = v
                    .deref(&field.name)
                    .unwrap_or_else(|| Value::null_of(field.typ.clone()));
                let c = cast_value(ctx, &src, &field.typ)?;
                append_as(&mut b, &field.typ, &c);
            }
            Ok(Value::new(target.clone(), Some(b.into_bytes())))
        }
    }
}

fn int_range(p: PrimitiveType) -> (i128, i128) {
    match p {
        PrimitiveType::Int8 => (i8::MIN as i128, i8::MAX as i128),
        PrimitiveType::Int16 => (i16::MIN as i128, i16::MAX as i128),
        PrimitiveType::Int32 => (i32::MIN as i128, i32::MAX as i128),
        PrimitiveType::Uint8 => (0, u8::MAX as i128),
        PrimitiveType::Uint16 => (0, u16::MAX as i128),
        PrimitiveType::Uint32 => (0, u32::MAX as i128),
        PrimitiveType::Uint64 => (0, u64::MAX as i128),
        _ => (i64::MIN as i128, i64::MAX as i128),
    }
}

/// Integer view of a numeric or string value as a wide integer.
fn wide_int(v: &Value) -> Option<i128> {
    let p = v.typ().primitive()?;
    if p.is_unsigned() {
        return v.as_uint().map(|u| u as i128);
    }
    if p.is_signed() {
        return v.as_int().map(|i| i as i128);
    }
    if p.is_float() {
        let f = v.as_float()?;
        return f.is_finite().then_some(f.trunc() as i128);
    }
    if p == PrimitiveType::String {
        return v.as_str()?.trim().parse::<i128>().ok();
    }
    if p == PrimitiveType::Bool {
        return v.as_bool().map(|b| b as i128);
    }
    None
}

/// Converts a primitive value. Returns None when the conversion is not
/// defined or the value is out of range.
pub fn cast_primitive(val: &Value, p: PrimitiveType) -> Option<Value> {
    let typ = Type::Primitive(p);
    if val.typ() == &typ {
        return Some(val.clone());
    }
    let src = val.typ().primitive();
    match p {
        _ if p.is_integer() => {
            let i = wide_int(val)?;
            let (lo, hi) = int_range(p);
            if i < lo || i > hi {
                return None;
            }
            Some(if p.is_unsigned() {
                Value::from_uint(typ, i as u64)
            } else {
                Value::from_int(typ, i as i64)
            })
        }
        _ if p.is_float() => {
            let f = match src? {
                PrimitiveType::String => val.as_str()?.trim().parse::<f64>().ok()?,
                PrimitiveType::Bool => val.as_bool()? as i64 as f64,
                _ => val.as_float()?,
            };
            Some(Value::from_float(typ, f))
        }
        PrimitiveType::Bool => match src? {
            PrimitiveType::String => match val.as_str()? {
                "true" => Some(Value::from_bool(true)),
                "false" => Some(Value::from_bool(false)),
                _ => None,
            },
            s if s.is_number() => Some(Value::from_bool(val.as_float()? != 0.0)),
            _ => None,
        },
        PrimitiveType::String => {
            let s = match src {
                Some(PrimitiveType::Bytes) => String::from_utf8(val.bytes()?.to_vec()).ok()?,
                _ => format_value(val),
            };
            Some(Value::from_str(&s))
        }
        PrimitiveType::Bytes => Some(Value::from_bytes(val.bytes()?)),
        PrimitiveType::Time => match src? {
            PrimitiveType::String => {
                let s = val.as_str()?;
                let nanos = match DateTime::parse_from_rfc3339(s) {
                    Ok(t) => t.timestamp_nanos_opt()?,
                    Err(_) => s.parse::<i64>().ok()?,
                };
                Some(Value::from_time(nanos))
            }
            s if s.is_float() => Some(Value::from_time(val.as_float()? as i64)),
            s if s.is_signed() || s.is_unsigned() => Some(Value::from_time(val.as_int()?)),
            _ => None,
        },
        PrimitiveType::Duration => match src? {
            PrimitiveType::String => parse_duration(val.as_str()?).map(Value::from_duration),
            s if s.is_float() => Some(Value::from_duration(val.as_float()? as i64)),
            s if s.is_signed() || s.is_unsigned() => Some(Value::from_duration(val.as_int()?)),
            _ => None,
        },
        PrimitiveType::Ip => {
            let ip = val.as_str()?.parse().ok()?;
            Some(Value::from_ip(ip))
        }
        PrimitiveType::Net => {
            let (addr, bits) = val.as_str()?.split_once('/')?;
            Some(Value::from_net(addr.parse().ok()?, bits.parse().ok()?))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::sup::{parse_type, parse_value};

    #[test]
    fn integer_ranges() {
        assert!(cast_primitive(&Value::from_int64(300), PrimitiveType::Uint8).is_none());
        assert!(cast_primitive(&Value::from_int64(-1), PrimitiveType::Uint64).is_none());
        let v = cast_primitive(&Value::from_int64(200), PrimitiveType::Uint8).unwrap();
        assert_eq!(Some(200), v.as_uint());
        let v = cast_primitive(&Value::from_float64(2.9), PrimitiveType::Int64).unwrap();
        assert_eq!(Some(2), v.as_int());
    }

    #[test]
    fn strings() {
        let v = cast_primitive(&Value::from_str("42"), PrimitiveType::Int32).unwrap();
        assert_eq!("42::int32", v.to_string());
        let v = cast_primitive(&Value::from_int64(7), PrimitiveType::String).unwrap();
        assert_eq!(Some("7"), v.as_str());
    }

    #[test]
    fn record_gains_null_fields() {
        let ctx = TypeContext::new();
        let val = parse_value(&ctx, "{a:1}").unwrap();
        let typ = parse_type(&ctx, "{a:int64,b:string}").unwrap();
        let out = cast_value(&ctx, &val, &typ).unwrap();
        assert_eq!("{a:1,b:null::string}", out.to_string());
    }

    #[test]
    fn record_extra_field_fails() {
        let ctx = TypeContext::new();
        let val = parse_value(&ctx, "{a:1,c:2}").unwrap();
        let typ = parse_type(&ctx, "{a:int64}").unwrap();
        assert!(cast_value(&ctx, &val, &typ).is_err());
    }
}
