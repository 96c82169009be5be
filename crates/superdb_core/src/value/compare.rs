//! Total ordering of values.
//!
//! Numbers compare by value across widths and signedness. Values of
//! otherwise incomparable types order by their types.
use std::cmp::Ordering;

use super::{Value, scode};
use crate::types::compare::compare_types;
use crate::types::{ComplexKind, PrimitiveType, Type};

/// Where nulls sort relative to non-null values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullsOrder {
    First,
    #[default]
    Last,
}

pub fn compare_values(a: &Value, b: &Value, nulls: NullsOrder) -> Ordering {
    let a = a.under();
    let b = b.under();
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => {
            return match nulls {
                NullsOrder::Last => Ordering::Greater,
                NullsOrder::First => Ordering::Less,
            };
        }
        (false, true) => {
            return match nulls {
                NullsOrder::Last => Ordering::Less,
                NullsOrder::First => Ordering::Greater,
            };
        }
        _ => {}
    }
    if let Some(ord) = compare_numbers(&a, &b) {
        return ord;
    }
    if a.typ() != b.typ() {
        let (pa, pb) = (a.typ().primitive(), b.typ().primitive());
        if pa.is_some_and(|p| p.is_stringy()) && pb.is_some_and(|p| p.is_stringy()) {
            return a.bytes().cmp(&b.bytes());
        }
        return compare_types(a.typ(), b.typ());
    }
    compare_same(&a, &b, nulls)
}

/// Orders two numeric values. Returns None if either is not a number.
pub fn compare_numbers(a: &Value, b: &Value) -> Option<Ordering> {
    let pa = a.typ().under().primitive().filter(|p| p.is_number())?;
    let pb = b.typ().under().primitive().filter(|p| p.is_number())?;
    if pa.is_integer() && pb.is_integer() {
        return Some(wide(a, pa)?.cmp(&wide(b, pb)?));
    }
    let (x, y) = (a.as_float()?, b.as_float()?);
    Some(x.total_cmp(&y))
}

fn wide(v: &Value, p: PrimitiveType) -> Option<i128> {
    let body = v.bytes()?;
    Some(if p.is_unsigned() {
        scode::decode_uint(body) as i128
    } else {
        scode::decode_int(body) as i128
    })
}

/// Equality as used by `==`, treating numbers of different widths as equal
/// when they hold the same value.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if a.is_null() || b.is_null() {
        return false;
    }
    compare_values(a, b, NullsOrder::Last) == Ordering::Equal
}

fn compare_same(a: &Value, b: &Value, nulls: NullsOrder) -> Ordering {
    let (Some(ab), Some(bb)) = (a.bytes(), b.bytes()) else {
        return Ordering::Equal;
    };
    match a.typ() {
        Type::Primitive(p) => match p {
            PrimitiveType::Time | PrimitiveType::Duration => {
                scode::decode_int(ab).cmp(&scode::decode_int(bb))
            }
            PrimitiveType::Bool => scode::decode_bool(ab).cmp(&scode::decode_bool(bb)),
            PrimitiveType::Ip => match (scode::decode_ip(ab), scode::decode_ip(bb)) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => ab.cmp(bb),
            },
            _ => ab.cmp(bb),
        },
        Type::Complex(c) => match &c.kind {
            ComplexKind::Record(_) => {
                let (fa, fb) = (a.fields(), b.fields());
                for ((_, x), (_, y)) in fa.iter().zip(fb.iter()) {
                    let ord = compare_values(x, y, nulls);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            }
            ComplexKind::Array(_) | ComplexKind::Set(_) | ComplexKind::Map(_, _) => {
                let (ea, eb) = (a.elements(), b.elements());
                for (x, y) in ea.iter().zip(eb.iter()) {
                    let ord = compare_values(x, y, nulls);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                ea.len().cmp(&eb.len())
            }
            ComplexKind::Enum(_) => scode::decode_uint(ab).cmp(&scode::decode_uint(bb)),
            ComplexKind::Error(_) => match (a.error_inner(), b.error_inner()) {
                (Some(x), Some(y)) => compare_values(&x, &y, nulls),
                _ => Ordering::Equal,
            },
            _ => ab.cmp(bb),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeContext;
    use crate::value::sup::parse_value;

    fn cmp(a: &str, b: &str) -> Ordering {
        let ctx = TypeContext::new();
        let a = parse_value(&ctx, a).unwrap();
        let b = parse_value(&ctx, b).unwrap();
        compare_values(&a, &b, NullsOrder::Last)
    }

    #[test]
    fn numbers_across_types() {
        assert_eq!(Ordering::Equal, cmp("1", "1::uint8"));
        assert_eq!(Ordering::Less, cmp("1", "1.5"));
        assert_eq!(Ordering::Greater, cmp("18446744073709551615::uint64", "-1"));
    }

    #[test]
    fn nulls_placement() {
        assert_eq!(Ordering::Greater, cmp("null", "1"));
        let one = Value::from_int64(1);
        assert_eq!(
            Ordering::Less,
            compare_values(&Value::null_of(Type::INT64), &one, NullsOrder::First)
        );
    }

    #[test]
    fn strings_and_records() {
        assert_eq!(Ordering::Less, cmp("\"a\"", "\"b\""));
        assert_eq!(Ordering::Less, cmp("{a:1,b:2}", "{a:1,b:3}"));
        assert_eq!(Ordering::Less, cmp("[1,2]", "[1,2,3]"));
    }

    #[test]
    fn equality() {
        let ctx = TypeContext::new();
        let a = parse_value(&ctx, "2").unwrap();
        let b = parse_value(&ctx, "2.").unwrap();
        assert!(values_equal(&a, &b));
        assert!(!values_equal(&Value::null(), &Value::null()));
    }
}
