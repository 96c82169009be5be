//! Predicates over object metadata derived from filter predicates.
//!
//! A range pruner evaluates to true for an object's `{min, max}` key range
//! when no value in that range can satisfy the filter, so the object can be
//! skipped. A metadata filter is the opposite: it evaluates to true when the
//! object's per-field `{min, max}` might contain a match.
use crate::dag::{Expr, VectorElem};
use crate::order::SortKeys;
use crate::value::Value;
use crate::value::sup::format_value;

/// Builds a range pruner for the primary sort key when both a predicate and
/// a sort key exist.
pub fn maybe_new_range_pruner(pred: Option<&Expr>, sort_keys: &SortKeys) -> Option<Expr> {
    let key = sort_keys.first()?;
    build_range_pruner(pred?, &key.key)
}

fn build_range_pruner(pred: &Expr, key: &[String]) -> Option<Expr> {
    let Expr::BinaryExpr { op, lhs, rhs } = pred else {
        return None;
    };
    match op.as_str() {
        // Either side ruling out the range rules out the conjunction.
        "and" => {
            let l = build_range_pruner(lhs, key);
            let r = build_range_pruner(rhs, key);
            match (l, r) {
                (Some(l), Some(r)) => Some(Expr::binary("or", l, r)),
                (l, r) => l.or(r),
            }
        }
        "or" => {
            let l = build_range_pruner(lhs, key)?;
            let r = build_range_pruner(rhs, key)?;
            Some(Expr::binary("and", l, r))
        }
        "==" | "<" | "<=" | ">" | ">=" => {
            let (path, literal, op) = literal_comparison(op, lhs, rhs)?;
            if path != key {
                return None;
            }
            Some(range_pruner_pred(op, literal))
        }
        _ => None,
    }
}

fn range_pruner_pred(op: &str, literal: &Expr) -> Expr {
    let min = Expr::this(["min"]);
    let max = Expr::this(["max"]);
    match op {
        "<" => compare("<=", literal.clone(), min),
        "<=" => compare("<", literal.clone(), min),
        ">" => compare(">=", literal.clone(), max),
        ">=" => compare(">", literal.clone(), max),
        _ => Expr::binary(
            "or",
            compare(">", min, literal.clone()),
            compare("<", max, literal.clone()),
        ),
    }
}

/// A comparison through the `compare` builtin with nulls sorting last, so
/// cross-type and null keys compare consistently with the pool order.
fn compare(op: &str, lhs: Expr, rhs: Expr) -> Expr {
    let call = Expr::call("compare", vec![lhs, rhs, Expr::literal("true")]);
    Expr::binary(op, call, Expr::literal("0"))
}

/// Normalizes `this OP literal` and `literal OP this`, mirroring the
/// comparator when the literal is on the left.
fn literal_comparison<'a>(op: &'a str, lhs: &'a Expr, rhs: &'a Expr) -> Option<(&'a [String], &'a Expr, &'a str)> {
    // Metadata ranges leave nulls out.
    if [lhs, rhs].iter().any(|e| matches!(e, Expr::Literal { value } if value == "null")) {
        return None;
    }
    match (lhs, rhs) {
        (Expr::This { path }, lit @ Expr::Literal { .. }) => Some((path, lit, op)),
        (lit @ Expr::Literal { .. }, Expr::This { path }) => Some((path, lit, mirror_comparator(op))),
        _ => None,
    }
}

fn mirror_comparator(op: &str) -> &str {
    match op {
        "<" => ">",
        "<=" => ">=",
        ">" => "<",
        ">=" => "<=",
        other => other,
    }
}

/// Builds the object selector of a vector scan: true when an object's
/// `{path: {min, max}}` metadata might contain a value matching `pred`.
pub fn new_metadata_pruner(pred: &Expr) -> Option<Expr> {
    match pred {
        Expr::BinaryExpr { op, lhs, rhs } => match op.as_str() {
            "and" => {
                let l = new_metadata_pruner(lhs);
                let r = new_metadata_pruner(rhs);
                match (l, r) {
                    (Some(l), Some(r)) => Some(Expr::binary("and", l, r)),
                    (l, r) => l.or(r),
                }
            }
            "or" => {
                let l = new_metadata_pruner(lhs)?;
                let r = new_metadata_pruner(rhs)?;
                Some(Expr::binary("or", l, r))
            }
            "==" | "<" | "<=" | ">" | ">=" => {
                let (path, literal, op) = literal_comparison(op, lhs, rhs)?;
                Some(metadata_pruner_pred(op, path, literal))
            }
            "in" => {
                let Expr::This { path } = lhs.as_ref() else {
                    return None;
                };
                let elems = match rhs.as_ref() {
                    Expr::ArrayExpr { elems } | Expr::SetExpr { elems } => elems,
                    _ => return None,
                };
                let mut out: Option<Expr> = None;
                for elem in elems {
                    let VectorElem::VectorValue { expr: lit @ Expr::Literal { .. } } = elem else {
                        return None;
                    };
                    let pred = metadata_pruner_pred("==", path, lit);
                    out = Some(match out {
                        None => pred,
                        Some(acc) => Expr::binary("or", acc, pred),
                    });
                }
                out
            }
            _ => None,
        },
        Expr::RegexpMatch { pattern, expr } => {
            let Expr::This { path } = expr.as_ref() else {
                return None;
            };
            let prefix = literal_prefix(pattern)?;
            let succ = successor(&prefix)?;
            let (min, max) = min_max(path);
            Some(Expr::binary(
                "and",
                compare("<=", min, string_literal(&succ)),
                compare(">=", max, string_literal(&prefix)),
            ))
        }
        _ => None,
    }
}

fn min_max(path: &[String]) -> (Expr, Expr) {
    let mut min = path.to_vec();
    min.push("min".to_string());
    let mut max = path.to_vec();
    max.push("max".to_string());
    (Expr::This { path: min }, Expr::This { path: max })
}

fn metadata_pruner_pred(op: &str, path: &[String], literal: &Expr) -> Expr {
    let (min, max) = min_max(path);
    match op {
        "<" => compare("<", min, literal.clone()),
        "<=" => compare("<=", min, literal.clone()),
        ">" => compare(">", max, literal.clone()),
        ">=" => compare(">=", max, literal.clone()),
        _ => Expr::binary(
            "and",
            compare(">=", literal.clone(), min),
            compare("<=", literal.clone(), max),
        ),
    }
}

/// The literal prefix of an anchored pattern such as `^abc` or `^abc.*`.
/// Any other metacharacter disqualifies the pattern.
fn literal_prefix(pattern: &str) -> Option<String> {
    let rest = pattern.strip_prefix('^')?;
    let rest = rest.strip_suffix(".*").unwrap_or(rest);
    if rest.is_empty() || rest.chars().any(|c| "\\.+*?()|[]{}^$".contains(c)) {
        return None;
    }
    Some(rest.to_string())
}

/// Smallest string greater than every string with the given prefix.
fn successor(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let mut next = last as u32 + 1;
        // Skip the surrogate gap.
        if (0xD800..=0xDFFF).contains(&next) {
            next = 0xE000;
        }
        if let Some(c) = char::from_u32(next) {
            chars.push(c);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

fn string_literal(s: &str) -> Expr {
    Expr::literal(format_value(&Value::from_str(s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{SortKey, Which};

    fn keys() -> SortKeys {
        vec![SortKey::new(vec!["ts".to_string()], Which::Asc)]
    }

    fn cmp_text(e: &Expr) -> String {
        match e {
            Expr::BinaryExpr { op, lhs, rhs } => match lhs.as_ref() {
                Expr::Call { args, .. } => format!(
                    "{}{op}{}",
                    cmp_text(&args[0]),
                    cmp_text(&args[1])
                ),
                _ => format!("({} {op} {})", cmp_text(lhs), cmp_text(rhs)),
            },
            Expr::This { path } => path.join("."),
            Expr::Literal { value } => value.clone(),
            other => format!("{other:?}"),
        }
    }

    #[test]
    fn range_pruner_forms() {
        let pred = Expr::binary("<", Expr::this(["ts"]), Expr::literal("5"));
        let p = maybe_new_range_pruner(Some(&pred), &keys()).unwrap();
        assert_eq!("5<=min", cmp_text(&p));

        let pred = Expr::binary("==", Expr::this(["ts"]), Expr::literal("5"));
        let p = maybe_new_range_pruner(Some(&pred), &keys()).unwrap();
        assert_eq!("(min>5 or max<5)", cmp_text(&p));
    }

    #[test]
    fn literal_on_left_is_mirrored() {
        // 5 <= ts is ts >= 5, which is prunable when 5 > max.
        let pred = Expr::binary("<=", Expr::literal("5"), Expr::this(["ts"]));
        let p = maybe_new_range_pruner(Some(&pred), &keys()).unwrap();
        assert_eq!("5>max", cmp_text(&p));
    }

    #[test]
    fn and_or_composition() {
        let other = Expr::binary("==", Expr::this(["x"]), Expr::literal("1"));
        let key = Expr::binary(">", Expr::this(["ts"]), Expr::literal("9"));
        let and = Expr::binary("and", other.clone(), key.clone());
        assert_eq!(
            "9>=max",
            cmp_text(&maybe_new_range_pruner(Some(&and), &keys()).unwrap())
        );
        let or = Expr::binary("or", other, key);
        assert!(maybe_new_range_pruner(Some(&or), &keys()).is_none());
        assert!(maybe_new_range_pruner(None, &keys()).is_none());
        let pred = Expr::binary(">", Expr::this(["ts"]), Expr::literal("9"));
        assert!(maybe_new_range_pruner(Some(&pred), &Vec::new()).is_none());
    }

    #[test]
    fn metadata_pruner_in_list() {
        let pred = Expr::binary(
            "in",
            Expr::this(["x"]),
            Expr::ArrayExpr {
                elems: vec![
                    VectorElem::VectorValue {
                        expr: Expr::literal("1"),
                    },
                    VectorElem::VectorValue {
                        expr: Expr::literal("2"),
                    },
                ],
            },
        );
        let p = new_metadata_pruner(&pred).unwrap();
        assert_eq!(
            "((1>=x.min and 1<=x.max) or (2>=x.min and 2<=x.max))",
            cmp_text(&p)
        );
    }

    #[test]
    fn null_literals_are_not_pruned() {
        let pred = Expr::binary("==", Expr::this(["s"]), Expr::literal("null"));
        assert!(new_metadata_pruner(&pred).is_none());
    }

    #[test]
    fn regexp_prefix() {
        let pred = Expr::RegexpMatch {
            pattern: "^ab.*".to_string(),
            expr: Box::new(Expr::this(["s"])),
        };
        let p = new_metadata_pruner(&pred).unwrap();
        assert_eq!("(s.min<=\"ac\" and s.max>=\"ab\")", cmp_text(&p));
        let pred = Expr::RegexpMatch {
            pattern: "a+b".to_string(),
            expr: Box::new(Expr::this(["s"])),
        };
        assert!(new_metadata_pruner(&pred).is_none());
    }
}
