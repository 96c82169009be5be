//! Scalar expression evaluation.
//!
//! Evaluation never fails: problems surface as error values, and a path
//! that does not resolve yields `error("missing")`.
pub mod agg;
pub mod binary;
pub mod function;
pub mod record;
pub mod search;
pub mod sort;

use std::sync::Arc;

use indexmap::IndexMap;
use superdb_error::Result;

pub use agg::{AggExpr, AggFunc, Aggregator, Resetter, Resetters, new_agg_func};
pub use sort::{Comparator, SortEval, guess_sort_key};

use crate::types::{ComplexKind, PrimitiveType, Type, TypeContext};
use crate::value::{Value, ValueBuilder, append_as, new_array, new_record, new_set, unify_types};

pub trait Evaluator: Send + Sync {
    fn eval(&self, this: &Value) -> Value;
}

pub type BoxEval = Box<dyn Evaluator>;

impl<E: Evaluator + ?Sized> Evaluator for Box<E> {
    fn eval(&self, this: &Value) -> Value {
        self.as_ref().eval(this)
    }
}

impl<E: Evaluator + ?Sized> Evaluator for Arc<E> {
    fn eval(&self, this: &Value) -> Value {
        self.as_ref().eval(this)
    }
}

/// Converts a construction failure into an error value.
pub(crate) fn or_error(ctx: &TypeContext, r: Result<Value>) -> Value {
    r.unwrap_or_else(|e| ctx.new_error_string(e.get_msg()))
}

/// `this`, or a field path into it.
pub struct This {
    ctx: Arc<TypeContext>,
    path: Vec<String>,
}

impl This {
    pub fn new(ctx: Arc<TypeContext>, path: Vec<String>) -> Self {
        This { ctx, path }
    }
}

impl Evaluator for This {
    fn eval(&self, this: &Value) -> Value {
        if self.path.is_empty() {
            return this.clone();
        }
        this.deref_path(&self.path).unwrap_or_else(|| self.ctx.missing())
    }
}

pub struct Literal(pub Value);

impl Evaluator for Literal {
    fn eval(&self, _this: &Value) -> Value {
        self.0.clone()
    }
}

/// Field access on the result of an expression.
pub struct Dot {
    ctx: Arc<TypeContext>,
    record: BoxEval,
    field: String,
}

impl Dot {
    pub fn new(ctx: Arc<TypeContext>, record: BoxEval, field: String) -> Self {
        Dot { ctx, record, field }
    }
}

impl Evaluator for Dot {
    fn eval(&self, this: &Value) -> Value {
        dot_value(&self.ctx, &self.record.eval(this), &self.field)
    }
}

/// `val.field`. Errors pass through and maps with string keys index like
/// records.
pub(crate) fn dot_value(ctx: &TypeContext, val: &Value, field: &str) -> Value {
    if val.is_error() {
        return val.clone();
    }
    if let Some(v) = val.deref(field) {
        return v;
    }
    if matches!(val.under().typ().kind(), Some(ComplexKind::Map(..))) {
        return map_lookup(ctx, &val.under(), &Value::from_str(field));
    }
    ctx.missing()
}

fn map_lookup(ctx: &TypeContext, map: &Value, key: &Value) -> Value {
    let elems = map.elements();
    for pair in elems.chunks(2) {
        if let [k, v] = pair {
            if crate::value::compare::values_equal(&k.under(), &key.under()) {
                return v.clone();
            }
        }
    }
    ctx.missing()
}

/// Resolves a possibly negative index against a length.
fn resolve_index(idx: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let i = if idx < 0 { len + idx } else { idx };
    (0..len).contains(&i).then_some(i as usize)
}

/// `container[index]` over arrays, sets, records, maps, strings and bytes.
pub struct Index {
    ctx: Arc<TypeContext>,
    container: BoxEval,
    index: BoxEval,
}

impl Index {
    pub fn new(ctx: Arc<TypeContext>, container: BoxEval, index: BoxEval) -> Self {
        Index {
            ctx,
            container,
            index,
        }
    }
}

impl Evaluator for Index {
    fn eval(&self, this: &Value) -> Value {
        let container = self.container.eval(this);
        if container.is_error() {
            return container;
        }
        let index = self.index.eval(this);
        if index.is_error() {
            return index;
        }
        let container = container.under();
        let index = index.under();
        match container.typ().kind() {
            Some(ComplexKind::Array(_)) | Some(ComplexKind::Set(_)) => {
                let Some(i) = index.as_int() else {
                    return self.ctx.wrap_error("index is not an integer", &index);
                };
                let elems = container.elements();
                match resolve_index(i, elems.len()) {
                    Some(i) => elems[i].clone(),
                    None => self.ctx.missing(),
                }
            }
            Some(ComplexKind::Record(_)) => match index.as_str() {
                Some(name) => container.deref(name).unwrap_or_else(|| self.ctx.missing()),
                None => self.ctx.wrap_error("record index is not a string", &index),
            },
            Some(ComplexKind::Map(..)) => map_lookup(&self.ctx, &container, &index),
            _ => match (container.typ().primitive(), index.as_int()) {
                (Some(PrimitiveType::String), Some(i)) => {
                    let s = container.as_str().unwrap_or_default();
                    let chars: Vec<char> = s.chars().collect();
                    match resolve_index(i, chars.len()) {
                        Some(i) => Value::from_str(&chars[i].to_string()),
                        None => self.ctx.missing(),
                    }
                }
                (Some(PrimitiveType::Bytes), Some(i)) => {
                    let b = container.bytes().unwrap_or_default();
                    match resolve_index(i, b.len()) {
                        Some(i) => Value::from_uint(Type::UINT8, b[i] as u64),
                        None => self.ctx.missing(),
                    }
                }
                _ => self.ctx.missing(),
            },
        }
    }
}

/// `expr[from:to]` over arrays, sets, strings and bytes. Bounds may be
/// negative and are clamped to the value.
pub struct Slice {
    ctx: Arc<TypeContext>,
    expr: BoxEval,
    from: Option<BoxEval>,
    to: Option<BoxEval>,
}

impl Slice {
    pub fn new(ctx: Arc<TypeContext>, expr: BoxEval, from: Option<BoxEval>, to: Option<BoxEval>) -> Self {
        Slice { ctx, expr, from, to }
    }

    fn bound(&self, e: &Option<BoxEval>, this: &Value, len: usize, default: usize) -> std::result::Result<usize, Value> {
        let Some(e) = e else {
            return Ok(default);
        };
        let v = e.eval(this);
        if v.is_null() {
            return Ok(default);
        }
        let Some(i) = v.under().as_int() else {
            return Err(self.ctx.wrap_error("slice index is not an integer", &v));
        };
        let len = len as i64;
        let i = if i < 0 { len + i } else { i };
        Ok(i.clamp(0, len) as usize)
    }
}

impl Evaluator for Slice {
    fn eval(&self, this: &Value) -> Value {
        let val = self.expr.eval(this);
        if val.is_error() || val.is_null() {
            return val;
        }
        let val = val.under();
        let len = match val.typ().primitive() {
            Some(PrimitiveType::String) => val.as_str().map(|s| s.chars().count()).unwrap_or(0),
            _ => match val.len() {
                Some(n) if !val.typ().is_record() => n,
                _ => return self.ctx.wrap_error("sliced value is not an array, set, string or bytes", &val),
            },
        };
        let (from, to) = match (self.bound(&self.from, this, len, 0), self.bound(&self.to, this, len, len)) {
            (Ok(f), Ok(t)) => (f, t.max(f)),
            (Err(e), _) | (_, Err(e)) => return e,
        };
        match val.typ().primitive() {
            Some(PrimitiveType::String) => {
                let s: String = val.as_str().unwrap_or_default().chars().skip(from).take(to - from).collect();
                Value::from_str(&s)
            }
            Some(PrimitiveType::Bytes) => Value::from_bytes(&val.bytes().unwrap_or_default()[from..to]),
            _ => {
                let elems = val.elements();
                let typ = val.typ().clone();
                let mut b = ValueBuilder::new();
                b.begin_container();
                for e in &elems[from..to] {
                    b.append(e.bytes());
                }
                b.end_container();
                Value::new(typ, b.into_first_body())
            }
        }
    }
}

pub struct IsNull(pub BoxEval);

impl Evaluator for IsNull {
    fn eval(&self, this: &Value) -> Value {
        let v = self.0.eval(this);
        if v.is_error() {
            return v;
        }
        Value::from_bool(v.is_null())
    }
}

/// `cond ? then : else`. A non-boolean condition is an error.
pub struct Conditional {
    ctx: Arc<TypeContext>,
    cond: BoxEval,
    then: BoxEval,
    otherwise: BoxEval,
}

impl Conditional {
    pub fn new(ctx: Arc<TypeContext>, cond: BoxEval, then: BoxEval, otherwise: BoxEval) -> Self {
        Conditional {
            ctx,
            cond,
            then,
            otherwise,
        }
    }
}

impl Evaluator for Conditional {
    fn eval(&self, this: &Value) -> Value {
        let cond = self.cond.eval(this);
        if cond.is_error() {
            return cond;
        }
        match cond.under().as_bool() {
            Some(true) => self.then.eval(this),
            Some(false) => self.otherwise.eval(this),
            None if cond.is_null() => self.otherwise.eval(this),
            None => self.ctx.wrap_error("?-operator: bool predicate required", &cond),
        }
    }
}

pub enum RecordElemEval {
    Field(String, BoxEval),
    Spread(BoxEval),
}

/// Record construction. A later field of the same name replaces an earlier
/// one in place; missing field values are left out.
pub struct RecordExpr {
    ctx: Arc<TypeContext>,
    elems: Vec<RecordElemEval>,
}

impl RecordExpr {
    pub fn new(ctx: Arc<TypeContext>, elems: Vec<RecordElemEval>) -> Self {
        RecordExpr { ctx, elems }
    }
}

impl Evaluator for RecordExpr {
    fn eval(&self, this: &Value) -> Value {
        let mut fields: IndexMap<String, Value> = IndexMap::new();
        for elem in &self.elems {
            match elem {
                RecordElemEval::Field(name, e) => {
                    let v = e.eval(this);
                    if v.is_missing() {
                        continue;
                    }
                    fields.insert(name.clone(), v);
                }
                RecordElemEval::Spread(e) => {
                    let v = e.eval(this);
                    for (name, fv) in v.fields() {
                        fields.insert(name, fv);
                    }
                }
            }
        }
        or_error(&self.ctx, new_record(&self.ctx, fields.into_iter().collect()))
    }
}

pub enum VectorElemEval {
    Value(BoxEval),
    Spread(BoxEval),
}

/// Array or set construction with spreads.
pub struct SequenceExpr {
    ctx: Arc<TypeContext>,
    elems: Vec<VectorElemEval>,
    set: bool,
}

impl SequenceExpr {
    pub fn new(ctx: Arc<TypeContext>, elems: Vec<VectorElemEval>, set: bool) -> Self {
        SequenceExpr { ctx, elems, set }
    }
}

impl Evaluator for SequenceExpr {
    fn eval(&self, this: &Value) -> Value {
        let mut vals = Vec::new();
        for elem in &self.elems {
            match elem {
                VectorElemEval::Value(e) => {
                    let v = e.eval(this);
                    if !v.is_missing() {
                        vals.push(v);
                    }
                }
                VectorElemEval::Spread(e) => {
                    let v = e.eval(this);
                    let under = v.under();
                    match under.typ().kind() {
                        Some(ComplexKind::Array(_)) | Some(ComplexKind::Set(_)) => {
                            vals.extend(under.elements());
                        }
                        _ if v.is_missing() => {}
                        _ => vals.push(v),
                    }
                }
            }
        }
        let r = if self.set {
            new_set(&self.ctx, &vals)
        } else {
            new_array(&self.ctx, &vals)
        };
        or_error(&self.ctx, r)
    }
}

/// Map construction from key/value expression pairs.
pub struct MapExpr {
    ctx: Arc<TypeContext>,
    entries: Vec<(BoxEval, BoxEval)>,
}

impl MapExpr {
    pub fn new(ctx: Arc<TypeContext>, entries: Vec<(BoxEval, BoxEval)>) -> Self {
        MapExpr { ctx, entries }
    }
}

impl Evaluator for MapExpr {
    fn eval(&self, this: &Value) -> Value {
        let pairs: Vec<(Value, Value)> = self.entries.iter().map(|(k, v)| (k.eval(this), v.eval(this))).collect();
        or_error(&self.ctx, new_map(&self.ctx, &pairs))
    }
}

pub fn new_map(ctx: &TypeContext, pairs: &[(Value, Value)]) -> Result<Value> {
    let ktyp = unify_types(ctx, pairs.iter().map(|(k, _)| k.typ()))?;
    let vtyp = unify_types(ctx, pairs.iter().map(|(_, v)| v.typ()))?;
    let mut b = ValueBuilder::new();
    b.begin_container();
    for (k, v) in pairs {
        append_as(&mut b, &ktyp, k);
        append_as(&mut b, &vtyp, v);
    }
    b.end_map();
    Ok(Value::new(ctx.lookup_map(&ktyp, &vtyp), b.into_first_body()))
}

/// Applies `inner` to each element of an array or set.
pub struct MapCall {
    ctx: Arc<TypeContext>,
    expr: BoxEval,
    inner: BoxEval,
}

impl MapCall {
    pub fn new(ctx: Arc<TypeContext>, expr: BoxEval, inner: BoxEval) -> Self {
        MapCall { ctx, expr, inner }
    }
}

impl Evaluator for MapCall {
    fn eval(&self, this: &Value) -> Value {
        let val = self.expr.eval(this);
        if val.is_error() {
            return val;
        }
        let under = val.under();
        let set = match under.typ().kind() {
            Some(ComplexKind::Array(_)) => false,
            Some(ComplexKind::Set(_)) => true,
            _ => return self.ctx.wrap_error("map: not an array or set", &val),
        };
        let out: Vec<Value> = under.elements().iter().map(|e| self.inner.eval(&e.under())).collect();
        let r = if set {
            new_set(&self.ctx, &out)
        } else {
            new_array(&self.ctx, &out)
        };
        or_error(&self.ctx, r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::sup::parse_value;

    fn ctx() -> Arc<TypeContext> {
        Arc::new(TypeContext::new())
    }

    fn this(ctx: &Arc<TypeContext>, path: &[&str]) -> BoxEval {
        Box::new(This::new(ctx.clone(), path.iter().map(|s| s.to_string()).collect()))
    }

    fn lit(v: Value) -> BoxEval {
        Box::new(Literal(v))
    }

    #[test]
    fn this_and_missing() {
        let ctx = ctx();
        let rec = parse_value(&ctx, "{a:{b:1}}").unwrap();
        assert_eq!("1", this(&ctx, &["a", "b"]).eval(&rec).to_string());
        assert!(this(&ctx, &["a", "c"]).eval(&rec).is_missing());
        assert_eq!(rec, this(&ctx, &[]).eval(&rec));
    }

    #[test]
    fn index_and_slice() {
        let ctx = ctx();
        let rec = parse_value(&ctx, r#"{v:[1,2,3],s:"hello",m:|{"a":1}|}"#).unwrap();
        let idx = Index::new(ctx.clone(), this(&ctx, &["v"]), lit(Value::from_int64(-1)));
        assert_eq!("3", idx.eval(&rec).to_string());
        let out = Index::new(ctx.clone(), this(&ctx, &["v"]), lit(Value::from_int64(3)));
        assert!(out.eval(&rec).is_missing());
        let m = Dot::new(ctx.clone(), this(&ctx, &["m"]), "a".to_string());
        assert_eq!("1", m.eval(&rec).to_string());
        let s = Slice::new(ctx.clone(), this(&ctx, &["s"]), Some(lit(Value::from_int64(1))), Some(lit(Value::from_int64(-1))));
        assert_eq!("\"ell\"", s.eval(&rec).to_string());
        let s = Slice::new(ctx.clone(), this(&ctx, &["v"]), Some(lit(Value::from_int64(1))), None);
        assert_eq!("[2,3]", s.eval(&rec).to_string());
    }

    #[test]
    fn record_spread_overrides() {
        let ctx = ctx();
        let rec = parse_value(&ctx, "{a:1,b:2}").unwrap();
        let e = RecordExpr::new(
            ctx.clone(),
            vec![
                RecordElemEval::Spread(this(&ctx, &[])),
                RecordElemEval::Field("a".to_string(), lit(Value::from_str("x"))),
                RecordElemEval::Field("c".to_string(), this(&ctx, &["nope"])),
            ],
        );
        assert_eq!(r#"{a:"x",b:2}"#, e.eval(&rec).to_string());
    }

    #[test]
    fn sequences_and_maps() {
        let ctx = ctx();
        let rec = parse_value(&ctx, "{v:[1,2]}").unwrap();
        let arr = SequenceExpr::new(
            ctx.clone(),
            vec![
                VectorElemEval::Spread(this(&ctx, &["v"])),
                VectorElemEval::Value(lit(Value::from_int64(2))),
            ],
            false,
        );
        assert_eq!("[1,2,2]", arr.eval(&rec).to_string());
        let set = SequenceExpr::new(ctx.clone(), vec![VectorElemEval::Spread(this(&ctx, &["v"])), VectorElemEval::Value(lit(Value::from_int64(2)))], true);
        assert_eq!("|[1,2]|", set.eval(&rec).to_string());
        let m = MapExpr::new(ctx.clone(), vec![(lit(Value::from_str("k")), this(&ctx, &["v"]))]);
        assert_eq!(r#"|{"k":[1,2]}|"#, m.eval(&rec).to_string());
    }

    #[test]
    fn conditional_requires_bool() {
        let ctx = ctx();
        let c = Conditional::new(ctx.clone(), lit(Value::from_int64(1)), lit(Value::from_int64(1)), lit(Value::from_int64(2)));
        assert!(c.eval(&Value::null()).is_error());
        let c = Conditional::new(ctx.clone(), lit(Value::from_bool(false)), lit(Value::from_int64(1)), lit(Value::from_int64(2)));
        assert_eq!("2", c.eval(&Value::null()).to_string());
    }
}
