//! Keyword search and regular expression matching.
use std::net::IpAddr;
use std::sync::Arc;

use regex::Regex;
use superdb_error::{DbError, Result, ResultExt};
use unicode_normalization::UnicodeNormalization;

use super::{BoxEval, Evaluator};
use crate::types::{ComplexKind, PrimitiveType, TypeContext};
use crate::value::Value;
use crate::value::compare::values_equal;
use crate::value::scode;

/// Visits every leaf of a value, depth first, until `f` returns true.
/// Record field names are offered to `names` before their values.
pub fn walk_leaves(val: &Value, names: &mut dyn FnMut(&str) -> bool, f: &mut dyn FnMut(&Value) -> bool) -> bool {
    let val = val.under();
    match val.typ().kind() {
        Some(ComplexKind::Record(_)) => {
            for (name, v) in val.fields() {
                if names(&name) || walk_leaves(&v, names, f) {
                    return true;
                }
            }
            false
        }
        Some(ComplexKind::Array(_)) | Some(ComplexKind::Set(_)) | Some(ComplexKind::Map(..)) => {
            val.elements().iter().any(|e| walk_leaves(e, names, f))
        }
        Some(ComplexKind::Error(_)) => val.error_inner().is_some_and(|inner| walk_leaves(&inner, names, f)),
        _ => f(&val),
    }
}

fn fold(s: &str) -> String {
    s.nfc().collect::<String>().to_lowercase()
}

enum Term {
    /// Case-insensitive substring over string leaves and field names.
    Text(String),
    /// A CIDR literal matches equal nets and contained addresses.
    Net(IpAddr, u8),
    /// Any other literal matches leaves that compare equal. String leaves
    /// also match the literal's source text as a substring.
    Typed(Value, String),
}

/// Keyword search over every leaf of an expression's value.
pub struct Search {
    term: Term,
    expr: BoxEval,
}

impl Search {
    /// `text` is the search token as written; `value` its typed literal, a
    /// string literal denoting a plain text search.
    pub fn new(text: &str, value: Value, expr: BoxEval) -> Self {
        let term = match value.typ().primitive() {
            Some(PrimitiveType::String) => Term::Text(fold(value.as_str().unwrap_or(text))),
            Some(PrimitiveType::Net) => match value.bytes().and_then(scode::decode_net) {
                Some((ip, prefix)) => Term::Net(ip, prefix),
                None => Term::Typed(value, fold(text)),
            },
            _ => Term::Typed(value, fold(text)),
        };
        Search { term, expr }
    }

    fn matches(&self, val: &Value) -> bool {
        match &self.term {
            Term::Text(needle) => walk_leaves(
                val,
                &mut |name| fold(name).contains(needle.as_str()),
                &mut |leaf| leaf.as_str().is_some_and(|s| fold(s).contains(needle.as_str())),
            ),
            Term::Net(net, prefix) => walk_leaves(val, &mut |_| false, &mut |leaf| {
                match leaf.typ().primitive() {
                    Some(PrimitiveType::Net) => leaf
                        .bytes()
                        .and_then(scode::decode_net)
                        .is_some_and(|(ip, p)| ip == *net && p == *prefix),
                    Some(PrimitiveType::Ip) => leaf
                        .bytes()
                        .and_then(scode::decode_ip)
                        .is_some_and(|ip| net_contains(*net, *prefix, ip)),
                    _ => false,
                }
            }),
            Term::Typed(lit, text) => walk_leaves(val, &mut |_| false, &mut |leaf| match leaf.as_str() {
                Some(s) => !text.is_empty() && fold(s).contains(text.as_str()),
                None => values_equal(leaf, lit),
            }),
        }
    }
}

impl Evaluator for Search {
    fn eval(&self, this: &Value) -> Value {
        let val = self.expr.eval(this);
        if val.is_error() && (val.is_missing() || val.is_quiet()) {
            return Value::from_bool(false);
        }
        Value::from_bool(self.matches(&val))
    }
}

pub fn net_contains(net: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (net, ip) {
        (IpAddr::V4(n), IpAddr::V4(a)) => {
            let bits = u32::from(prefix.min(32));
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            u32::from(n) & mask == u32::from(a) & mask
        }
        (IpAddr::V6(n), IpAddr::V6(a)) => {
            let bits = u32::from(prefix.min(128));
            let mask = if bits == 0 { 0 } else { u128::MAX << (128 - bits) };
            u128::from(n) & mask == u128::from(a) & mask
        }
        _ => false,
    }
}

pub fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| DbError::with_source(format!("invalid regular expression: {pattern}"), Box::new(e)))
}

/// `expr =~ /pattern/` over a string value.
pub struct RegexpMatch {
    ctx: Arc<TypeContext>,
    re: Regex,
    expr: BoxEval,
}

impl RegexpMatch {
    pub fn new(ctx: Arc<TypeContext>, pattern: &str, expr: BoxEval) -> Result<Self> {
        Ok(RegexpMatch {
            ctx,
            re: compile_regex(pattern)?,
            expr,
        })
    }
}

impl Evaluator for RegexpMatch {
    fn eval(&self, this: &Value) -> Value {
        let val = self.expr.eval(this);
        if val.is_error() {
            return val;
        }
        if val.is_null() {
            return Value::from_bool(false);
        }
        match val.under().as_str() {
            Some(s) => Value::from_bool(self.re.is_match(s)),
            None => self.ctx.wrap_error("=~: string value required", &val),
        }
    }
}

/// A regular expression search matching any string leaf.
pub struct RegexpSearch {
    re: Regex,
    expr: BoxEval,
}

impl RegexpSearch {
    pub fn new(pattern: &str, expr: BoxEval) -> Result<Self> {
        Ok(RegexpSearch {
            re: compile_regex(pattern).context("regexp search")?,
            expr,
        })
    }
}

impl Evaluator for RegexpSearch {
    fn eval(&self, this: &Value) -> Value {
        let val = self.expr.eval(this);
        let hit = walk_leaves(&val, &mut |_| false, &mut |leaf| leaf.as_str().is_some_and(|s| self.re.is_match(s)));
        Value::from_bool(hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::expr::This;
    use crate::value::sup::parse_value;

    fn this(ctx: &Arc<TypeContext>) -> BoxEval {
        Box::new(This::new(ctx.clone(), Vec::new()))
    }

    #[test]
    fn text_search_folds_case() {
        let ctx = Arc::new(TypeContext::new());
        let rec = parse_value(&ctx, r#"{msg:"Hello World",n:[1,2]}"#).unwrap();
        let s = Search::new("world", Value::from_str("world"), this(&ctx));
        assert!(s.eval(&rec).is_true());
        let s = Search::new("msg", Value::from_str("msg"), this(&ctx));
        assert!(s.eval(&rec).is_true());
        let s = Search::new("nope", Value::from_str("nope"), this(&ctx));
        assert_eq!(Some(false), s.eval(&rec).as_bool());
    }

    #[test]
    fn typed_search() {
        let ctx = Arc::new(TypeContext::new());
        let rec = parse_value(&ctx, r#"{a:{b:[1,2]},addr:10.1.2.3}"#).unwrap();
        assert!(Search::new("2", Value::from_int64(2), this(&ctx)).eval(&rec).is_true());
        assert!(!Search::new("7", Value::from_int64(7), this(&ctx)).eval(&rec).is_true());
        let net = parse_value(&ctx, "10.1.0.0/16").unwrap();
        assert!(Search::new("10.1.0.0/16", net, this(&ctx)).eval(&rec).is_true());
    }

    #[test]
    fn regexps() {
        let ctx = Arc::new(TypeContext::new());
        let rec = parse_value(&ctx, r#"{s:"foobar",t:{u:"baz"}}"#).unwrap();
        let s = Box::new(This::new(ctx.clone(), vec!["s".to_string()]));
        assert!(RegexpMatch::new(ctx.clone(), "^foo", s).unwrap().eval(&rec).is_true());
        assert!(RegexpSearch::new("^ba", this(&ctx)).unwrap().eval(&rec).is_true());
        assert!(RegexpMatch::new(ctx.clone(), "(", this(&ctx)).is_err());
    }
}
