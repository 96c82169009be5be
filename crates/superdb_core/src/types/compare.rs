use std::cmp::Ordering;

use super::{ComplexKind, Type};

fn kind_rank(typ: &Type) -> u8 {
    match typ.kind() {
        None => 0,
        Some(ComplexKind::Record(_)) => 1,
        Some(ComplexKind::Array(_)) => 2,
        Some(ComplexKind::Set(_)) => 3,
        Some(ComplexKind::Map(_, _)) => 4,
        Some(ComplexKind::Union(_)) => 5,
        Some(ComplexKind::Enum(_)) => 6,
        Some(ComplexKind::Error(_)) => 7,
        Some(ComplexKind::Named(_, _)) => 8,
    }
}

/// Canonical structural order over types.
///
/// Primitives sort before complex types and by id among themselves. Complex
/// types sort by kind and then structurally, so the order does not depend on
/// the context that interned them.
pub fn compare_types(a: &Type, b: &Type) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    let ord = kind_rank(a).cmp(&kind_rank(b));
    if ord != Ordering::Equal {
        return ord;
    }
    match (a.kind(), b.kind()) {
        (None, None) => a.id().cmp(&b.id()),
        (Some(ComplexKind::Record(fa)), Some(ComplexKind::Record(fb))) => {
            fa.len().cmp(&fb.len()).then_with(|| {
                for (x, y) in fa.iter().zip(fb) {
                    let ord = x
                        .name
                        .cmp(&y.name)
                        .then_with(|| compare_types(&x.typ, &y.typ));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            })
        }
        (Some(ComplexKind::Array(x)), Some(ComplexKind::Array(y)))
        | (Some(ComplexKind::Set(x)), Some(ComplexKind::Set(y)))
        | (Some(ComplexKind::Error(x)), Some(ComplexKind::Error(y))) => compare_types(x, y),
        (Some(ComplexKind::Map(ka, va)), Some(ComplexKind::Map(kb, vb))) => {
            compare_types(ka, kb).then_with(|| compare_types(va, vb))
        }
        (Some(ComplexKind::Union(ta)), Some(ComplexKind::Union(tb))) => {
            ta.len().cmp(&tb.len()).then_with(|| {
                ta.iter()
                    .zip(tb)
                    .map(|(x, y)| compare_types(x, y))
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            })
        }
        (Some(ComplexKind::Enum(sa)), Some(ComplexKind::Enum(sb))) => {
            sa.len().cmp(&sb.len()).then_with(|| sa.cmp(sb))
        }
        (Some(ComplexKind::Named(na, ia)), Some(ComplexKind::Named(nb, ib))) => {
            na.cmp(nb).then_with(|| compare_types(ia, ib))
        }
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Field, TypeContext};

    #[test]
    fn primitives_before_complex() {
        let ctx = TypeContext::new();
        let arr = ctx.lookup_array(&Type::INT64);
        assert_eq!(Ordering::Less, compare_types(&Type::STRING, &arr));
        assert_eq!(Ordering::Less, compare_types(&Type::INT64, &Type::STRING));
    }

    #[test]
    fn independent_of_context() {
        let a = TypeContext::new();
        let b = TypeContext::new();
        b.lookup_array(&Type::NULL);
        let ra = a.lookup_record(vec![Field::new("a", Type::INT64)]).unwrap();
        let rb = b.lookup_record(vec![Field::new("a", Type::INT64)]).unwrap();
        assert_eq!(Ordering::Equal, compare_types(&ra, &rb));
        let rc = a.lookup_record(vec![Field::new("b", Type::INT64)]).unwrap();
        assert_eq!(Ordering::Less, compare_types(&ra, &rc));
    }
}
