//! Vector operators. Operators that only move chunks (head, tail, skip,
//! pass, combine, fork, scatter, switch, scope) are the generic ones from
//! [`crate::runtime::op`].
pub mod aggregate;
pub mod route;

use std::sync::Arc;

use superdb_error::Result;

pub use aggregate::{VecAggregate, VecAggregator};
pub use route::{VecCaseRouter, VecDistinct, VecExprSwitch, VecUnnest};

use super::expr::{BoxVecEval, VecEval, map_slots};
use super::{DynamicVec, RecordVec, Vector};
use crate::runtime::expr::{Evaluator, Resetters};
use crate::runtime::{BoxPuller, Puller};
use crate::types::{Field, PrimitiveType, TypeContext};
use crate::value::Value;

fn dropped(v: &Value) -> bool {
    v.is_error() && (v.is_missing() || v.is_quiet())
}

/// True when slot `i` holds a missing or quiet error.
fn dropped_at(vec: &Vector, i: usize) -> bool {
    vec.typ_at(i).under().is_error() && dropped(&vec.value_at(i))
}

/// Removes missing and quiet slots. None when nothing is left.
fn compact(vec: Vector) -> Option<Vector> {
    if vec.uniform_type().is_some_and(|t| !t.under().is_error()) {
        return (!vec.is_empty()).then_some(vec);
    }
    let keep: Vec<u32> = (0..vec.len()).filter(|i| !dropped_at(&vec, *i)).map(|i| i as u32).collect();
    if keep.is_empty() {
        return None;
    }
    if keep.len() == vec.len() {
        return Some(vec);
    }
    Some(vec.pick(keep))
}

/// Applies a vector evaluator to every chunk, discarding missing and quiet
/// results.
pub struct VecApplier {
    parent: BoxPuller<Vector>,
    eval: BoxVecEval,
    resetters: Resetters,
}

impl VecApplier {
    pub fn new(parent: BoxPuller<Vector>, eval: BoxVecEval, resetters: Resetters) -> Self {
        VecApplier {
            parent,
            eval,
            resetters,
        }
    }
}

impl Puller<Vector> for VecApplier {
    fn pull(&mut self, done: bool) -> Result<Option<Vector>> {
        loop {
            let Some(vec) = self.parent.pull(done)? else {
                self.resetters.reset();
                return Ok(None);
            };
            if let Some(out) = compact(self.eval.eval(&vec)) {
                return Ok(Some(out));
            }
        }
    }
}

/// Emits every expression for every slot, slot by slot.
pub struct VecValues {
    parent: BoxPuller<Vector>,
    exprs: Vec<BoxVecEval>,
    resetters: Resetters,
}

impl VecValues {
    pub fn new(parent: BoxPuller<Vector>, exprs: Vec<BoxVecEval>, resetters: Resetters) -> Self {
        VecValues {
            parent,
            exprs,
            resetters,
        }
    }
}

impl Puller<Vector> for VecValues {
    fn pull(&mut self, done: bool) -> Result<Option<Vector>> {
        loop {
            let Some(vec) = self.parent.pull(done)? else {
                self.resetters.reset();
                return Ok(None);
            };
            let outs: Vec<Vector> = self.exprs.iter().map(|e| e.eval(&vec)).collect();
            let mut picks = Vec::with_capacity(vec.len() * outs.len());
            for i in 0..vec.len() {
                for (k, out) in outs.iter().enumerate() {
                    if !dropped_at(out, i) {
                        picks.push((k as u32, i as u32));
                    }
                }
            }
            if !picks.is_empty() {
                return Ok(Some(Vector::interleave(outs, picks)));
            }
        }
    }
}

/// Keeps the slots for which the predicate is true. Error predicates are
/// emitted in place of the slot; a predicate that is not boolean becomes
/// a "not type bool" error.
pub struct VecFilterEval {
    ctx: Arc<TypeContext>,
    pred: BoxVecEval,
}

impl VecFilterEval {
    pub fn new(ctx: Arc<TypeContext>, pred: BoxVecEval) -> Self {
        VecFilterEval { ctx, pred }
    }
}

impl VecEval for VecFilterEval {
    fn eval(&self, vec: &Vector) -> Vector {
        let pred = self.pred.eval(vec);
        let mut picks = Vec::with_capacity(vec.len());
        let mut errs = Vec::new();
        if let Vector::Bool(b) = &pred {
            for (i, keep) in b.values.iter().enumerate() {
                picks.push(if *keep && !b.nulls.is_null(i) { (0, i as u32) } else { (1, 0) });
            }
        } else {
            for i in 0..pred.len() {
                let p = pred.value_at(i);
                if p.typ().primitive() == Some(PrimitiveType::Bool) {
                    picks.push(if p.is_true() { (0, i as u32) } else { (1, 0) });
                } else {
                    picks.push((2, errs.len() as u32));
                    errs.push(if p.is_error() { p } else { self.ctx.wrap_error("not type bool", &p) });
                }
            }
        }
        let parts = vec![vec.clone(), Vector::Const(self.ctx.missing(), 1), Vector::from_values(&errs)];
        Vector::interleave(parts, picks)
    }
}

/// Runs `native` over the record vectors inside `vec` and `scalar` over
/// every other slot. `native` returns None to fall back to `scalar`.
fn per_record(
    vec: &Vector,
    native: &dyn Fn(&Vector, &RecordVec) -> Option<Vector>,
    scalar: &dyn Evaluator,
) -> Vector {
    match vec {
        Vector::Record(rec) if !rec.nulls.any() => {
            native(vec, rec).unwrap_or_else(|| map_slots(vec, |v| scalar.eval(&v)))
        }
        Vector::Dynamic(d) => Vector::Dynamic(DynamicVec {
            tags: d.tags.clone(),
            index: d.index.clone(),
            values: d.values.iter().map(|v| per_record(v, native, scalar)).collect(),
        }),
        Vector::View(v) if v.index.len() * 2 >= v.inner.len() => {
            per_record(&v.inner, native, scalar).pick(v.index.clone())
        }
        _ => map_slots(vec, |v| scalar.eval(&v)),
    }
}

/// A column usable as a record field: single-typed and free of errors.
/// Ok(None) for an entirely missing column.
fn field_column(col: Vector) -> Option<Option<Vector>> {
    if let Vector::Const(val, _) = &col {
        if val.is_missing() {
            return Some(None);
        }
    }
    let typ = col.uniform_type()?;
    if typ.under().is_error() {
        return None;
    }
    Some(Some(col))
}

fn top_level(path: &[String]) -> Option<&str> {
    match path {
        [name] => Some(name),
        _ => None,
    }
}

fn record_of(ctx: &TypeContext, fields: Vec<(String, Vector)>, len: usize) -> Option<Vector> {
    let types = fields
        .iter()
        .map(|(n, v)| Some(Field::new(n.clone(), v.uniform_type()?)))
        .collect::<Option<Vec<_>>>()?;
    let typ = ctx.lookup_record(types).ok()?;
    Some(Vector::Record(RecordVec {
        typ,
        fields: fields.into_iter().map(|(_, v)| v).collect(),
        len,
        nulls: Default::default(),
    }))
}

fn named_fields(rec: &RecordVec) -> Vec<(String, Vector)> {
    rec.typ
        .record_fields()
        .unwrap_or_default()
        .iter()
        .zip(&rec.fields)
        .map(|(f, v)| (f.name.clone(), v.clone()))
        .collect()
}

/// `put`: assigns fields of each record. Top-level assignments of
/// single-typed columns replace or append record columns in place.
pub struct VecPutEval {
    ctx: Arc<TypeContext>,
    assignments: Vec<(Vec<String>, BoxVecEval)>,
    scalar: Box<dyn Evaluator>,
}

impl VecPutEval {
    pub fn new(ctx: Arc<TypeContext>, assignments: Vec<(Vec<String>, BoxVecEval)>, scalar: Box<dyn Evaluator>) -> Self {
        VecPutEval {
            ctx,
            assignments,
            scalar,
        }
    }

    fn native(&self, vec: &Vector, rec: &RecordVec) -> Option<Vector> {
        let mut fields = named_fields(rec);
        for (path, e) in &self.assignments {
            let name = top_level(path)?;
            let Some(col) = field_column(e.eval(vec))? else {
                continue;
            };
            match fields.iter_mut().find(|(n, _)| n == name) {
                Some(slot) => slot.1 = col,
                None => fields.push((name.to_string(), col)),
            }
        }
        record_of(&self.ctx, fields, rec.len)
    }
}

impl VecEval for VecPutEval {
    fn eval(&self, vec: &Vector) -> Vector {
        per_record(vec, &|v, rec| self.native(v, rec), self.scalar.as_ref())
    }
}

/// `cut`: builds records from the assigned fields only.
pub struct VecCutEval {
    ctx: Arc<TypeContext>,
    assignments: Vec<(Vec<String>, BoxVecEval)>,
    scalar: Box<dyn Evaluator>,
}

impl VecCutEval {
    pub fn new(ctx: Arc<TypeContext>, assignments: Vec<(Vec<String>, BoxVecEval)>, scalar: Box<dyn Evaluator>) -> Self {
        VecCutEval {
            ctx,
            assignments,
            scalar,
        }
    }

    fn native(&self, vec: &Vector, rec: &RecordVec) -> Option<Vector> {
        let mut fields: Vec<(String, Vector)> = Vec::with_capacity(self.assignments.len());
        for (path, e) in &self.assignments {
            let name = top_level(path)?;
            if fields.iter().any(|(n, _)| n == name) {
                return None;
            }
            if let Some(col) = field_column(e.eval(vec))? {
                fields.push((name.to_string(), col));
            }
        }
        if fields.is_empty() {
            return Some(Vector::Const(self.ctx.quiet(), rec.len));
        }
        record_of(&self.ctx, fields, rec.len)
    }
}

impl VecEval for VecCutEval {
    fn eval(&self, vec: &Vector) -> Vector {
        per_record(vec, &|v, rec| self.native(v, rec), self.scalar.as_ref())
    }
}

/// `drop`: removes fields. Records left without fields are dropped.
pub struct VecDropEval {
    ctx: Arc<TypeContext>,
    paths: Vec<Vec<String>>,
    scalar: Box<dyn Evaluator>,
}

impl VecDropEval {
    pub fn new(ctx: Arc<TypeContext>, paths: Vec<Vec<String>>, scalar: Box<dyn Evaluator>) -> Self {
        VecDropEval { ctx, paths, scalar }
    }

    fn native(&self, rec: &RecordVec) -> Option<Vector> {
        let names = self.paths.iter().map(|p| top_level(p)).collect::<Option<Vec<_>>>()?;
        let fields: Vec<(String, Vector)> = named_fields(rec)
            .into_iter()
            .filter(|(n, _)| !names.contains(&n.as_str()))
            .collect();
        if fields.is_empty() {
            return Some(Vector::Const(self.ctx.quiet(), rec.len));
        }
        record_of(&self.ctx, fields, rec.len)
    }
}

impl VecEval for VecDropEval {
    fn eval(&self, vec: &Vector) -> Vector {
        per_record(vec, &|_, rec| self.native(rec), self.scalar.as_ref())
    }
}

/// `rename`: renames fields, applying each pair in order.
pub struct VecRenameEval {
    ctx: Arc<TypeContext>,
    renames: Vec<(Vec<String>, Vec<String>)>,
    scalar: Box<dyn Evaluator>,
}

impl VecRenameEval {
    pub fn new(ctx: Arc<TypeContext>, renames: Vec<(Vec<String>, Vec<String>)>, scalar: Box<dyn Evaluator>) -> Self {
        VecRenameEval { ctx, renames, scalar }
    }

    fn native(&self, rec: &RecordVec) -> Option<Vector> {
        let mut fields = named_fields(rec);
        for (from, to) in &self.renames {
            let (from, to) = (top_level(from)?, top_level(to)?);
            if from != to && fields.iter().any(|(n, _)| n == to) {
                return None;
            }
            if let Some(slot) = fields.iter_mut().find(|(n, _)| n == from) {
                slot.0 = to.to_string();
            }
        }
        record_of(&self.ctx, fields, rec.len)
    }
}

impl VecEval for VecRenameEval {
    fn eval(&self, vec: &Vector) -> Vector {
        per_record(vec, &|_, rec| self.native(rec), self.scalar.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::expr::This;
    use crate::runtime::expr::binary::CompareOp;
    use crate::runtime::op::{CutEval, DropEval, PutEval, RenameEval};
    use crate::runtime::testutil::rctx;
    use crate::vector::expr::{VecCompare, VecLiteral, VecThis};
    use crate::vector::testutil::{vrun, vsource};

    fn path(s: &str) -> Vec<String> {
        s.split('.').map(str::to_string).collect()
    }

    fn vthis(ctx: &Arc<TypeContext>, p: &str) -> BoxVecEval {
        Box::new(VecThis::new(ctx.clone(), path(p)))
    }

    fn sthis(ctx: &Arc<TypeContext>, p: &str) -> Box<dyn Evaluator> {
        Box::new(This::new(ctx.clone(), path(p)))
    }

    #[test]
    fn filter_keeps_true_slots_and_reports_errors() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let pred = VecCompare::new(CompareOp::Gt, vthis(&ctx, "x"), Box::new(VecLiteral(Value::from_int64(1))));
        let op = VecApplier::new(
            vsource(&rctx, "{x:1} {x:2} {x:3} {y:1}"),
            Box::new(VecFilterEval::new(ctx.clone(), Box::new(pred))),
            Resetters::default(),
        );
        assert_eq!(vec!["{x:2}", "{x:3}"], vrun(Box::new(op)));

        let op = VecApplier::new(
            vsource(&rctx, "{x:1}"),
            Box::new(VecFilterEval::new(ctx.clone(), vthis(&ctx, "x"))),
            Resetters::default(),
        );
        assert_eq!(vec!["error({message:\"not type bool\",on:1})"], vrun(Box::new(op)));
    }

    #[test]
    fn values_interleave_expressions() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let exprs = vec![vthis(&ctx, "a"), vthis(&ctx, "b"), vthis(&ctx, "nope")];
        let op = VecValues::new(vsource(&rctx, "{a:1,b:\"x\"} {a:3,b:\"y\"}"), exprs, Resetters::default());
        assert_eq!(vec!["1", "\"x\"", "3", "\"y\""], vrun(Box::new(op)));
    }

    #[test]
    fn record_ops_match_scalar() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let input = "{a:1,b:{c:2}} {a:2,b:{c:3}} {z:1}";
        let run = |eval: BoxVecEval| vrun(Box::new(VecApplier::new(vsource(&rctx, input), eval, Resetters::default())));

        let put = VecPutEval::new(
            ctx.clone(),
            vec![(path("x"), vthis(&ctx, "a"))],
            Box::new(PutEval::new(ctx.clone(), vec![(path("x"), sthis(&ctx, "a"))])),
        );
        assert_eq!(vec!["{a:1,b:{c:2},x:1}", "{a:2,b:{c:3},x:2}", "{z:1}"], run(Box::new(put)));

        let cut = VecCutEval::new(
            ctx.clone(),
            vec![(path("b"), vthis(&ctx, "b"))],
            Box::new(CutEval::new(ctx.clone(), vec![(path("b"), sthis(&ctx, "b"))])),
        );
        assert_eq!(vec!["{b:{c:2}}", "{b:{c:3}}"], run(Box::new(cut)));

        let drop = VecDropEval::new(
            ctx.clone(),
            vec![path("a")],
            Box::new(DropEval::new(ctx.clone(), vec![path("a")])),
        );
        assert_eq!(vec!["{b:{c:2}}", "{b:{c:3}}", "{z:1}"], run(Box::new(drop)));

        let renames = vec![(path("a"), path("n"))];
        let rename = VecRenameEval::new(
            ctx.clone(),
            renames.clone(),
            Box::new(RenameEval::new(ctx.clone(), renames)),
        );
        assert_eq!(vec!["{n:1,b:{c:2}}", "{n:2,b:{c:3}}", "{z:1}"], run(Box::new(rename)));
    }
}
