//! Aggregate functions.
//!
//! An [`AggFunc`] accumulates values and can exchange its state with other
//! instances as a partial value, which is how parallel branches hand their
//! work to a final aggregation.
use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashSet;
use parking_lot::Mutex;
use superdb_error::{DbError, Result};

use super::{BoxEval, Evaluator, or_error};
use crate::types::{PrimitiveType, Type, TypeContext};
use crate::value::compare::{NullsOrder, compare_values};
use crate::value::fuse::Schema;
use crate::value::{Value, new_array, new_record, new_set};

pub trait AggFunc: Send {
    fn consume(&mut self, val: &Value);
    fn consume_as_partial(&mut self, partial: &Value) -> Result<()>;
    fn result(&mut self, ctx: &TypeContext) -> Value;
    fn result_as_partial(&mut self, ctx: &TypeContext) -> Value;
}

const AGG_NAMES: &[&str] = &[
    "and", "any", "avg", "collect", "count", "dcount", "fuse", "max", "min", "or", "sum", "union",
];

pub fn is_agg_func(name: &str) -> bool {
    AGG_NAMES.contains(&name)
}

pub fn new_agg_func(name: &str) -> Result<Box<dyn AggFunc>> {
    Ok(match name {
        "count" => Box::new(Count(0)),
        "sum" => Box::new(Sum::default()),
        "avg" => Box::new(Avg::default()),
        "min" => Box::new(Extreme::new(Ordering::Less)),
        "max" => Box::new(Extreme::new(Ordering::Greater)),
        "any" => Box::new(Any(None)),
        "collect" => Box::new(Collect::default()),
        "union" => Box::new(Union::default()),
        "dcount" => Box::new(DCount::default()),
        "fuse" => Box::new(Fuse::default()),
        "and" => Box::new(Logical { and: true, state: None }),
        "or" => Box::new(Logical { and: false, state: None }),
        _ => return Err(DbError::new(format!("unknown aggregation: {name}"))),
    })
}

fn value_key(v: &Value) -> (Type, Option<Bytes>) {
    (v.typ().clone(), v.body().cloned())
}

fn bad_partial(name: &str, v: &Value) -> DbError {
    DbError::new(format!("{name}: partial has bad type")).with_field("partial", v)
}

/// Counts non-null values.
struct Count(i64);

impl AggFunc for Count {
    fn consume(&mut self, val: &Value) {
        if !val.is_null() {
            self.0 += 1;
        }
    }

    fn consume_as_partial(&mut self, partial: &Value) -> Result<()> {
        let n = partial.under().as_int().ok_or_else(|| bad_partial("count", partial))?;
        self.0 += n;
        Ok(())
    }

    fn result(&mut self, _ctx: &TypeContext) -> Value {
        Value::from_int64(self.0)
    }

    fn result_as_partial(&mut self, ctx: &TypeContext) -> Value {
        self.result(ctx)
    }
}

#[derive(Default)]
enum Num {
    #[default]
    Empty,
    Int(i64),
    Uint(u64),
    Float(f64),
    Error(String),
}

#[derive(Default)]
struct Sum(Num);

impl Sum {
    fn add(&mut self, val: &Value) {
        let v = val.under();
        let Some(p) = v.typ().primitive().filter(|p| p.is_number()) else {
            self.0 = Num::Error(format!("sum: not a number: {val}"));
            return;
        };
        self.0 = match std::mem::take(&mut self.0) {
            Num::Error(e) => Num::Error(e),
            Num::Empty if p.is_float() => Num::Float(v.as_float().unwrap_or_default()),
            Num::Empty if p.is_unsigned() => Num::Uint(v.as_uint().unwrap_or_default()),
            Num::Empty => Num::Int(v.as_int().unwrap_or_default()),
            Num::Float(f) => Num::Float(f + v.as_float().unwrap_or_default()),
            Num::Uint(u) if p.is_unsigned() => Num::Uint(u.wrapping_add(v.as_uint().unwrap_or_default())),
            Num::Uint(u) if p.is_float() => Num::Float(u as f64 + v.as_float().unwrap_or_default()),
            Num::Uint(u) => Num::Int((u as i64).wrapping_add(v.as_int().unwrap_or_default())),
            Num::Int(i) if p.is_float() => Num::Float(i as f64 + v.as_float().unwrap_or_default()),
            Num::Int(i) if p.is_unsigned() => Num::Int(i.wrapping_add(v.as_uint().unwrap_or_default() as i64)),
            Num::Int(i) => Num::Int(i.wrapping_add(v.as_int().unwrap_or_default())),
        };
    }
}

impl AggFunc for Sum {
    fn consume(&mut self, val: &Value) {
        if !val.is_null() {
            self.add(val);
        }
    }

    fn consume_as_partial(&mut self, partial: &Value) -> Result<()> {
        if partial.is_error() {
            return Err(bad_partial("sum", partial));
        }
        self.consume(partial);
        Ok(())
    }

    fn result(&mut self, ctx: &TypeContext) -> Value {
        match &self.0 {
            Num::Empty => Value::null_of(Type::INT64),
            Num::Int(i) => Value::from_int64(*i),
            Num::Uint(u) => Value::from_uint64(*u),
            Num::Float(f) => Value::from_float64(*f),
            Num::Error(msg) => ctx.new_error_string(msg),
        }
    }

    fn result_as_partial(&mut self, ctx: &TypeContext) -> Value {
        self.result(ctx)
    }
}

#[derive(Default)]
struct Avg {
    sum: f64,
    count: i64,
}

impl AggFunc for Avg {
    fn consume(&mut self, val: &Value) {
        if let Some(f) = val.under().as_float() {
            self.sum += f;
            self.count += 1;
        }
    }

    fn consume_as_partial(&mut self, partial: &Value) -> Result<()> {
        let sum = partial.deref("sum").and_then(|v| v.as_float());
        let count = partial.deref("count").and_then(|v| v.as_int());
        let (Some(sum), Some(count)) = (sum, count) else {
            return Err(bad_partial("avg", partial));
        };
        self.sum += sum;
        self.count += count;
        Ok(())
    }

    fn result(&mut self, _ctx: &TypeContext) -> Value {
        if self.count == 0 {
            return Value::null_of(Type::FLOAT64);
        }
        Value::from_float64(self.sum / self.count as f64)
    }

    fn result_as_partial(&mut self, ctx: &TypeContext) -> Value {
        let fields = vec![
            ("sum".to_string(), Value::from_float64(self.sum)),
            ("count".to_string(), Value::from_int64(self.count)),
        ];
        or_error(ctx, new_record(ctx, fields))
    }
}

/// `min` when `keep` is Less, `max` when Greater.
struct Extreme {
    keep: Ordering,
    best: Option<Value>,
}

impl Extreme {
    fn new(keep: Ordering) -> Self {
        Extreme { keep, best: None }
    }
}

impl AggFunc for Extreme {
    fn consume(&mut self, val: &Value) {
        if val.is_null() {
            return;
        }
        let val = val.under();
        match &self.best {
            Some(best) if compare_values(&val, best, NullsOrder::Last) != self.keep => {}
            _ => self.best = Some(val),
        }
    }

    fn consume_as_partial(&mut self, partial: &Value) -> Result<()> {
        self.consume(partial);
        Ok(())
    }

    fn result(&mut self, _ctx: &TypeContext) -> Value {
        self.best.clone().unwrap_or_else(Value::null)
    }

    fn result_as_partial(&mut self, ctx: &TypeContext) -> Value {
        self.result(ctx)
    }
}

/// First value seen, preferring non-null values.
struct Any(Option<Value>);

impl AggFunc for Any {
    fn consume(&mut self, val: &Value) {
        match &self.0 {
            None => self.0 = Some(val.clone()),
            Some(v) if v.is_null() && !val.is_null() => self.0 = Some(val.clone()),
            _ => {}
        }
    }

    fn consume_as_partial(&mut self, partial: &Value) -> Result<()> {
        self.consume(partial);
        Ok(())
    }

    fn result(&mut self, _ctx: &TypeContext) -> Value {
        self.0.clone().unwrap_or_else(Value::null)
    }

    fn result_as_partial(&mut self, ctx: &TypeContext) -> Value {
        self.result(ctx)
    }
}

#[derive(Default)]
struct Collect(Vec<Value>);

impl AggFunc for Collect {
    fn consume(&mut self, val: &Value) {
        if !val.is_null() {
            self.0.push(val.clone());
        }
    }

    fn consume_as_partial(&mut self, partial: &Value) -> Result<()> {
        if partial.is_null() {
            return Ok(());
        }
        if partial.under().typ().inner().is_none() {
            return Err(bad_partial("collect", partial));
        }
        self.0.extend(partial.elements().iter().map(|v| v.under()));
        Ok(())
    }

    fn result(&mut self, ctx: &TypeContext) -> Value {
        if self.0.is_empty() {
            return Value::null();
        }
        or_error(ctx, new_array(ctx, &self.0))
    }

    fn result_as_partial(&mut self, ctx: &TypeContext) -> Value {
        self.result(ctx)
    }
}

#[derive(Default)]
struct Union {
    seen: HashSet<(Type, Option<Bytes>)>,
    vals: Vec<Value>,
}

impl Union {
    fn add(&mut self, val: Value) {
        if self.seen.insert(value_key(&val)) {
            self.vals.push(val);
        }
    }
}

impl AggFunc for Union {
    fn consume(&mut self, val: &Value) {
        if !val.is_null() {
            self.add(val.under());
        }
    }

    fn consume_as_partial(&mut self, partial: &Value) -> Result<()> {
        if partial.is_null() {
            return Ok(());
        }
        if partial.under().typ().inner().is_none() {
            return Err(bad_partial("union", partial));
        }
        for v in partial.elements() {
            self.add(v.under());
        }
        Ok(())
    }

    fn result(&mut self, ctx: &TypeContext) -> Value {
        if self.vals.is_empty() {
            return Value::null();
        }
        or_error(ctx, new_set(ctx, &self.vals))
    }

    fn result_as_partial(&mut self, ctx: &TypeContext) -> Value {
        self.result(ctx)
    }
}

/// Exact distinct count. Partials carry the distinct values as a set.
#[derive(Default)]
struct DCount(Union);

impl AggFunc for DCount {
    fn consume(&mut self, val: &Value) {
        self.0.add(val.under());
    }

    fn consume_as_partial(&mut self, partial: &Value) -> Result<()> {
        self.0.consume_as_partial(partial)
    }

    fn result(&mut self, _ctx: &TypeContext) -> Value {
        Value::from_int64(self.0.vals.len() as i64)
    }

    fn result_as_partial(&mut self, ctx: &TypeContext) -> Value {
        self.0.result(ctx)
    }
}

/// Fuses the types of all values into a single type value. Partials are
/// type values, decoded when the result is computed.
#[derive(Default)]
struct Fuse {
    types: Vec<Type>,
    seen: HashSet<Type>,
    partials: Vec<Bytes>,
}

impl AggFunc for Fuse {
    fn consume(&mut self, val: &Value) {
        if self.seen.insert(val.typ().clone()) {
            self.types.push(val.typ().clone());
        }
    }

    fn consume_as_partial(&mut self, partial: &Value) -> Result<()> {
        if partial.typ().primitive() != Some(PrimitiveType::Type) {
            return Err(bad_partial("fuse", partial));
        }
        if let Some(b) = partial.body() {
            self.partials.push(b.clone());
        }
        Ok(())
    }

    fn result(&mut self, ctx: &TypeContext) -> Value {
        let mut schema = Schema::new();
        for t in &self.types {
            if let Err(e) = schema.mix(ctx, t) {
                return ctx.new_error_string(e.get_msg());
            }
        }
        for b in &self.partials {
            let mixed = ctx.lookup_by_value(b).and_then(|t| schema.mix(ctx, &t));
            if let Err(e) = mixed {
                return ctx.new_error_string(e.get_msg());
            }
        }
        Value::from_type(ctx, &schema.typ())
    }

    fn result_as_partial(&mut self, ctx: &TypeContext) -> Value {
        self.result(ctx)
    }
}

struct Logical {
    and: bool,
    state: Option<bool>,
}

impl AggFunc for Logical {
    fn consume(&mut self, val: &Value) {
        let Some(b) = val.under().as_bool() else {
            return;
        };
        self.state = Some(match self.state {
            None => b,
            Some(s) if self.and => s && b,
            Some(s) => s || b,
        });
    }

    fn consume_as_partial(&mut self, partial: &Value) -> Result<()> {
        self.consume(partial);
        Ok(())
    }

    fn result(&mut self, _ctx: &TypeContext) -> Value {
        match self.state {
            Some(b) => Value::from_bool(b),
            None => Value::null_of(Type::BOOL),
        }
    }

    fn result_as_partial(&mut self, ctx: &TypeContext) -> Value {
        self.result(ctx)
    }
}

/// Feeds only values not seen before to the wrapped function.
struct Distinct {
    seen: HashSet<(Type, Option<Bytes>)>,
    inner: Box<dyn AggFunc>,
}

impl AggFunc for Distinct {
    fn consume(&mut self, val: &Value) {
        if self.seen.insert(value_key(val)) {
            self.inner.consume(val);
        }
    }

    fn consume_as_partial(&mut self, partial: &Value) -> Result<()> {
        self.inner.consume_as_partial(partial)
    }

    fn result(&mut self, ctx: &TypeContext) -> Value {
        self.inner.result(ctx)
    }

    fn result_as_partial(&mut self, ctx: &TypeContext) -> Value {
        self.inner.result_as_partial(ctx)
    }
}

/// An aggregate call site: the function name, its argument and an optional
/// `where` filter.
pub struct Aggregator {
    name: String,
    distinct: bool,
    expr: Option<BoxEval>,
    filter: Option<BoxEval>,
}

impl Aggregator {
    pub fn new(name: &str, distinct: bool, expr: Option<BoxEval>, filter: Option<BoxEval>) -> Result<Self> {
        new_agg_func(name)?;
        if expr.is_none() && name != "count" {
            return Err(DbError::new(format!("{name}: argument required")));
        }
        Ok(Aggregator {
            name: name.to_string(),
            distinct,
            expr,
            filter,
        })
    }

    /// An aggregator whose argument and filter are evaluated elsewhere, as
    /// the vector runtime does. Only [`Aggregator::new_func`] is used.
    pub(crate) fn state_only(name: &str, distinct: bool) -> Result<Self> {
        new_agg_func(name)?;
        Ok(Aggregator {
            name: name.to_string(),
            distinct,
            expr: None,
            filter: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn new_func(&self) -> Box<dyn AggFunc> {
        // The name was validated in new.
        let inner = new_agg_func(&self.name).unwrap_or_else(|_| Box::new(Count(0)));
        if self.distinct {
            Box::new(Distinct {
                seen: HashSet::new(),
                inner,
            })
        } else {
            inner
        }
    }

    /// Feeds `this` to `f` unless the filter rejects it or the argument is
    /// missing. Errors other than missing are consumed like any value.
    pub fn apply(&self, f: &mut dyn AggFunc, this: &Value) {
        if let Some(filter) = &self.filter {
            if !filter.eval(this).is_true() {
                return;
            }
        }
        match &self.expr {
            None => f.consume(this),
            Some(e) => {
                let v = e.eval(this);
                if !v.is_missing() {
                    f.consume(&v);
                }
            }
        }
    }
}

/// State that must be cleared between platoons.
pub trait Resetter: Send + Sync {
    fn reset(&self);
}

/// Resetters shared by the expressions of one operator.
#[derive(Clone, Default)]
pub struct Resetters(Arc<Mutex<Vec<Arc<dyn Resetter>>>>);

impl Resetters {
    pub fn add(&self, r: Arc<dyn Resetter>) {
        self.0.lock().push(r);
    }

    pub fn reset(&self) {
        for r in self.0.lock().iter() {
            r.reset();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// A running aggregate inside an expression: each evaluation consumes
/// `this` and yields the result so far.
pub struct AggExpr {
    ctx: Arc<TypeContext>,
    agg: Aggregator,
    func: Mutex<Box<dyn AggFunc>>,
}

impl AggExpr {
    pub fn new(ctx: Arc<TypeContext>, agg: Aggregator) -> Arc<Self> {
        let func = Mutex::new(agg.new_func());
        Arc::new(AggExpr { ctx, agg, func })
    }
}

impl Evaluator for AggExpr {
    fn eval(&self, this: &Value) -> Value {
        let mut f = self.func.lock();
        self.agg.apply(f.as_mut(), this);
        f.result(&self.ctx)
    }
}

impl Resetter for AggExpr {
    fn reset(&self) {
        *self.func.lock() = self.agg.new_func();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::expr::This;
    use crate::value::sup::{parse_value, parse_values};

    fn run(ctx: &TypeContext, name: &str, sup: &str) -> String {
        let mut f = new_agg_func(name).unwrap();
        for v in parse_values(ctx, sup).unwrap() {
            f.consume(&v);
        }
        f.result(ctx).to_string()
    }

    #[test]
    fn basic_aggregations() {
        let ctx = TypeContext::new();
        assert_eq!("2", run(&ctx, "count", "1 null 3"));
        assert_eq!("4", run(&ctx, "sum", "1 null 3"));
        assert_eq!("4.5", run(&ctx, "sum", "1 3.5"));
        assert_eq!("2.", run(&ctx, "avg", "1 3"));
        assert_eq!("1", run(&ctx, "min", "3 1 null 2"));
        assert_eq!("\"b\"", run(&ctx, "max", r#""a" "b""#));
        assert_eq!("[1,2,1]", run(&ctx, "collect", "1 2 1"));
        assert_eq!("|[1,2]|", run(&ctx, "union", "1 2 1"));
        assert_eq!("2", run(&ctx, "dcount", "1 2 1"));
        assert_eq!("false", run(&ctx, "and", "true false"));
        assert_eq!("true", run(&ctx, "or", "true false"));
        assert_eq!("null::int64", run(&ctx, "sum", ""));
        assert_eq!("<int64>", run(&ctx, "fuse", "1 2"));
    }

    #[test]
    fn partials_merge() {
        let ctx = TypeContext::new();
        for name in ["count", "sum", "avg", "min", "max", "collect", "union", "dcount", "and", "or"] {
            let mut whole = new_agg_func(name).unwrap();
            let mut a = new_agg_func(name).unwrap();
            let mut b = new_agg_func(name).unwrap();
            for (i, v) in parse_values(&ctx, "true 1 false 2").unwrap().iter().enumerate() {
                let v = if name == "and" || name == "or" { v.clone() } else { Value::from_int64(i as i64) };
                whole.consume(&v);
                if i % 2 == 0 { a.consume(&v) } else { b.consume(&v) }
            }
            let mut merged = new_agg_func(name).unwrap();
            merged.consume_as_partial(&a.result_as_partial(&ctx)).unwrap();
            merged.consume_as_partial(&b.result_as_partial(&ctx)).unwrap();
            let (m, w) = (merged.result(&ctx), whole.result(&ctx));
            if name == "collect" {
                assert_eq!("[0,2,1,3]", m.to_string());
            } else if name == "union" {
                assert_eq!(4, m.len().unwrap());
            } else {
                assert_eq!(w.to_string(), m.to_string(), "{name}");
            }
        }
    }

    #[test]
    fn aggregator_filters_and_distinct() {
        let ctx = Arc::new(TypeContext::new());
        let x = Box::new(This::new(ctx.clone(), vec!["x".to_string()]));
        let agg = Aggregator::new("sum", true, Some(x), None).unwrap();
        let mut f = agg.new_func();
        for v in parse_values(&ctx, "{x:1} {x:1} {x:2} {y:5}").unwrap() {
            agg.apply(f.as_mut(), &v);
        }
        assert_eq!("3", f.result(&ctx).to_string());
        assert!(Aggregator::new("bogus", false, None, None).is_err());
    }

    #[test]
    fn running_aggregate_resets() {
        let ctx = Arc::new(TypeContext::new());
        let agg = Aggregator::new("count", false, None, None).unwrap();
        let e = AggExpr::new(ctx.clone(), agg);
        let resetters = Resetters::default();
        resetters.add(e.clone());
        let v = parse_value(&ctx, "{}").unwrap();
        e.eval(&v);
        assert_eq!("2", e.eval(&v).to_string());
        resetters.reset();
        assert_eq!("1", e.eval(&v).to_string());
    }
}
