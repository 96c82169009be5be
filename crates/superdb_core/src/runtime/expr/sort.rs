//! Comparison of values by sort keys.
use std::cmp::Ordering;
use std::sync::Arc;

use super::{BoxEval, Evaluator, This};
use crate::order::{Nulls, Which};
use crate::types::{PrimitiveType, Type, TypeContext};
use crate::value::Value;
use crate::value::compare::{NullsOrder, compare_values};

/// One sort key: an expression with its direction and null placement.
pub struct SortEval {
    pub eval: BoxEval,
    pub order: Which,
    pub nulls: Nulls,
}

impl SortEval {
    pub fn new(eval: BoxEval, order: Which, nulls: Nulls) -> Self {
        SortEval { eval, order, nulls }
    }
}

/// Orders values by a list of sort keys.
pub struct Comparator {
    keys: Vec<SortEval>,
}

impl Comparator {
    pub fn new(keys: Vec<SortEval>) -> Self {
        Comparator { keys }
    }

    /// Sorting by the heuristic key of `sample`, the first value of a
    /// stream sorted without explicit keys.
    pub fn guess(ctx: &Arc<TypeContext>, sample: &Value, reverse: bool) -> Self {
        let path = guess_sort_key(sample).unwrap_or_default();
        let order = if reverse { Which::Desc } else { Which::Asc };
        Comparator::new(vec![SortEval::new(
            Box::new(This::new(ctx.clone(), path)),
            order,
            Nulls::Last,
        )])
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Evaluates the keys of a value. Missing keys act as null.
    pub fn key_values(&self, val: &Value) -> Vec<Value> {
        self.keys
            .iter()
            .map(|k| {
                let v = k.eval.eval(val);
                if v.is_missing() { Value::null() } else { v }
            })
            .collect()
    }

    pub fn compare_keys(&self, a: &[Value], b: &[Value]) -> Ordering {
        for ((k, x), y) in self.keys.iter().zip(a).zip(b) {
            let (x, y) = match k.order {
                Which::Asc => (x, y),
                Which::Desc => (y, x),
            };
            let nulls_max = matches!((k.order, k.nulls), (Which::Asc, Nulls::Last) | (Which::Desc, Nulls::First));
            let nulls = if nulls_max { NullsOrder::Last } else { NullsOrder::First };
            let ord = compare_values(x, y, nulls);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        self.compare_keys(&self.key_values(a), &self.key_values(b))
    }
}

/// Picks a sort key for a record: its first integer field, else its first
/// float field, else its first field that is not a time. Nested records are
/// searched in place. Returns `ts` when nothing matches and None when the
/// value is not a record.
pub fn guess_sort_key(val: &Value) -> Option<Vec<String>> {
    let typ = val.typ().under();
    if !typ.is_record() {
        return None;
    }
    let is_int = |t: &Type| t.under().primitive().is_some_and(|p| p.is_integer());
    let is_float = |t: &Type| t.under().primitive().is_some_and(|p| p.is_float());
    let not_time = |t: &Type| t.under().primitive() != Some(PrimitiveType::Time);
    for pred in [&is_int as &dyn Fn(&Type) -> bool, &is_float, &not_time] {
        let mut path = Vec::new();
        if first_matching_field(typ, pred, &mut path) {
            return Some(path);
        }
    }
    Some(vec!["ts".to_string()])
}

fn first_matching_field(typ: &Type, pred: &dyn Fn(&Type) -> bool, path: &mut Vec<String>) -> bool {
    let Some(fields) = typ.under().record_fields() else {
        return false;
    };
    for f in fields {
        path.push(f.name.clone());
        if f.typ.under().is_record() {
            if first_matching_field(&f.typ, pred, path) {
                return true;
            }
        } else if pred(&f.typ) {
            return true;
        }
        path.pop();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::sup::{parse_value, parse_values};

    fn sorted(ctx: &Arc<TypeContext>, cmp: &Comparator, sup: &str) -> String {
        let mut vals = parse_values(ctx, sup).unwrap();
        vals.sort_by(|a, b| cmp.compare(a, b));
        vals.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ")
    }

    fn key(ctx: &Arc<TypeContext>, name: &str, order: Which, nulls: Nulls) -> SortEval {
        SortEval::new(Box::new(This::new(ctx.clone(), vec![name.to_string()])), order, nulls)
    }

    #[test]
    fn directions_and_nulls() {
        let ctx = Arc::new(TypeContext::new());
        let input = "{x:2} {x:null} {x:1} {y:0}";
        let asc = Comparator::new(vec![key(&ctx, "x", Which::Asc, Nulls::Last)]);
        assert_eq!("{x:1} {x:2} {x:null} {y:0}", sorted(&ctx, &asc, input));
        let desc = Comparator::new(vec![key(&ctx, "x", Which::Desc, Nulls::Last)]);
        assert_eq!("{x:2} {x:1} {x:null} {y:0}", sorted(&ctx, &desc, input));
        let desc_first = Comparator::new(vec![key(&ctx, "x", Which::Desc, Nulls::First)]);
        assert_eq!("{x:null} {y:0} {x:2} {x:1}", sorted(&ctx, &desc_first, input));
    }

    #[test]
    fn guessed_keys() {
        let ctx = TypeContext::new();
        let v = parse_value(&ctx, r#"{s:"a",r:{f:1.5,n:3}}"#).unwrap();
        assert_eq!(Some(vec!["r".to_string(), "n".to_string()]), guess_sort_key(&v));
        let v = parse_value(&ctx, r#"{s:"a",f:1.5}"#).unwrap();
        assert_eq!(Some(vec!["f".to_string()]), guess_sort_key(&v));
        let v = parse_value(&ctx, r#"{t:2024-01-01T00:00:00Z,s:"a"}"#).unwrap();
        assert_eq!(Some(vec!["s".to_string()]), guess_sort_key(&v));
        assert_eq!(None, guess_sort_key(&Value::from_int64(1)));
    }
}
