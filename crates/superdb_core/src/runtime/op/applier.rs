//! Operators that map each value independently.
use std::sync::Arc;

use superdb_error::Result;

use crate::runtime::expr::record::{build_from_paths, drop_paths, put_paths, rename_path};
use crate::runtime::expr::{BoxEval, Evaluator, Resetters};
use crate::runtime::{Batch, BoxPuller, Puller, batch_of};
use crate::types::{PrimitiveType, TypeContext};
use crate::value::Value;

fn dropped(v: &Value) -> bool {
    v.is_error() && (v.is_missing() || v.is_quiet())
}

/// Applies an evaluator to every value, discarding missing and quiet
/// results. Filter, put, cut, drop and rename are all appliers.
pub struct Applier {
    parent: BoxPuller,
    eval: BoxEval,
    resetters: Resetters,
}

impl Applier {
    pub fn new(parent: BoxPuller, eval: BoxEval, resetters: Resetters) -> Self {
        Applier {
            parent,
            eval,
            resetters,
        }
    }
}

impl Puller for Applier {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        loop {
            let Some(batch) = self.parent.pull(done)? else {
                self.resetters.reset();
                return Ok(None);
            };
            let out: Vec<Value> = batch
                .values()
                .iter()
                .map(|v| self.eval.eval(v))
                .filter(|v| !dropped(v))
                .collect();
            if let Some(b) = batch_of(out) {
                return Ok(Some(b));
            }
        }
    }
}

/// Emits every expression for every input value.
pub struct Values {
    parent: BoxPuller,
    exprs: Vec<BoxEval>,
    resetters: Resetters,
}

impl Values {
    pub fn new(parent: BoxPuller, exprs: Vec<BoxEval>, resetters: Resetters) -> Self {
        Values {
            parent,
            exprs,
            resetters,
        }
    }
}

impl Puller for Values {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        loop {
            let Some(batch) = self.parent.pull(done)? else {
                self.resetters.reset();
                return Ok(None);
            };
            let mut out = Vec::with_capacity(batch.len() * self.exprs.len());
            for v in batch.values() {
                for e in &self.exprs {
                    let val = e.eval(v);
                    if !dropped(&val) {
                        out.push(val);
                    }
                }
            }
            if let Some(b) = batch_of(out) {
                return Ok(Some(b));
            }
        }
    }
}

/// Keeps `this` when the predicate is true.
pub struct FilterEval {
    ctx: Arc<TypeContext>,
    pred: BoxEval,
}

impl FilterEval {
    pub fn new(ctx: Arc<TypeContext>, pred: BoxEval) -> Self {
        FilterEval { ctx, pred }
    }
}

impl Evaluator for FilterEval {
    fn eval(&self, this: &Value) -> Value {
        let val = self.pred.eval(this);
        if val.typ().primitive() == Some(PrimitiveType::Bool) {
            return if val.is_true() { this.clone() } else { self.ctx.missing() };
        }
        if val.is_error() {
            return val;
        }
        self.ctx.wrap_error("not type bool", &val)
    }
}

/// Assigns fields of `this`.
pub struct PutEval {
    ctx: Arc<TypeContext>,
    assignments: Vec<(Vec<String>, BoxEval)>,
}

impl PutEval {
    pub fn new(ctx: Arc<TypeContext>, assignments: Vec<(Vec<String>, BoxEval)>) -> Self {
        PutEval { ctx, assignments }
    }
}

impl Evaluator for PutEval {
    fn eval(&self, this: &Value) -> Value {
        if !this.under().typ().is_record() {
            return self.ctx.wrap_error("put: not a record", this);
        }
        let mut updates = Vec::with_capacity(self.assignments.len());
        for (path, e) in &self.assignments {
            let v = e.eval(this);
            if v.is_missing() {
                continue;
            }
            updates.push((path.clone(), v));
        }
        if updates.is_empty() {
            return this.clone();
        }
        match put_paths(&self.ctx, this, updates) {
            Ok(v) => v,
            Err(e) => self.ctx.new_error_string(format!("put: {}", e.get_msg())),
        }
    }
}

/// Builds a new record from the assigned fields only.
pub struct CutEval {
    ctx: Arc<TypeContext>,
    assignments: Vec<(Vec<String>, BoxEval)>,
}

impl CutEval {
    pub fn new(ctx: Arc<TypeContext>, assignments: Vec<(Vec<String>, BoxEval)>) -> Self {
        CutEval { ctx, assignments }
    }
}

impl Evaluator for CutEval {
    fn eval(&self, this: &Value) -> Value {
        let mut entries = Vec::with_capacity(self.assignments.len());
        for (path, e) in &self.assignments {
            let v = e.eval(this);
            if v.is_missing() {
                continue;
            }
            if path.is_empty() {
                return v;
            }
            entries.push((path.clone(), v));
        }
        if entries.is_empty() {
            return self.ctx.quiet();
        }
        match build_from_paths(&self.ctx, entries) {
            Ok(v) => v,
            Err(e) => self.ctx.new_error_string(format!("cut: {}", e.get_msg())),
        }
    }
}

/// Removes fields. A record left without fields is dropped.
pub struct DropEval {
    ctx: Arc<TypeContext>,
    paths: Vec<Vec<String>>,
}

impl DropEval {
    pub fn new(ctx: Arc<TypeContext>, paths: Vec<Vec<String>>) -> Self {
        DropEval { ctx, paths }
    }
}

impl Evaluator for DropEval {
    fn eval(&self, this: &Value) -> Value {
        match drop_paths(&self.ctx, this, &self.paths) {
            Ok(Some(v)) => v,
            Ok(None) => self.ctx.quiet(),
            Err(e) => self.ctx.new_error_string(format!("drop: {}", e.get_msg())),
        }
    }
}

/// Renames fields, applying each `(from, to)` pair in order.
pub struct RenameEval {
    ctx: Arc<TypeContext>,
    renames: Vec<(Vec<String>, Vec<String>)>,
}

impl RenameEval {
    pub fn new(ctx: Arc<TypeContext>, renames: Vec<(Vec<String>, Vec<String>)>) -> Self {
        RenameEval { ctx, renames }
    }
}

impl Evaluator for RenameEval {
    fn eval(&self, this: &Value) -> Value {
        let mut val = this.clone();
        for (from, to) in &self.renames {
            val = match rename_path(&self.ctx, &val, from, to) {
                Ok(v) => v,
                Err(e) => return self.ctx.wrap_error(e.get_msg(), this),
            };
        }
        val
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::expr::This;
    use crate::runtime::expr::binary::{CompareConst, CompareOp};
    use crate::runtime::testutil::{rctx, run, source};

    fn path(s: &str) -> Vec<String> {
        s.split('.').map(|s| s.to_string()).collect()
    }

    fn this(ctx: &Arc<TypeContext>, p: &str) -> BoxEval {
        Box::new(This::new(ctx.clone(), path(p)))
    }

    #[test]
    fn filter_keeps_true_values() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let pred = CompareConst::new(CompareOp::Gt, this(&ctx, "x"), Value::from_int64(1));
        let eval = FilterEval::new(ctx.clone(), Box::new(pred));
        let mut op = Applier::new(source(&rctx, "{x:1} {x:2} {x:3} {y:1}"), Box::new(eval), Resetters::default());
        assert_eq!(vec!["{x:2}", "{x:3}"], run(&mut op));
    }

    #[test]
    fn non_boolean_filter_is_an_error() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let eval = FilterEval::new(ctx.clone(), this(&ctx, "x"));
        let mut op = Applier::new(source(&rctx, "{x:1}"), Box::new(eval), Resetters::default());
        assert_eq!(vec!["error({message:\"not type bool\",on:1})"], run(&mut op));
    }

    #[test]
    fn put_cut_drop_rename() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let input = "{a:1,b:{c:2}}";

        let put = PutEval::new(ctx.clone(), vec![(path("b.d"), this(&ctx, "a"))]);
        let mut op = Applier::new(source(&rctx, input), Box::new(put), Resetters::default());
        assert_eq!(vec!["{a:1,b:{c:2,d:1}}"], run(&mut op));

        let cut = CutEval::new(ctx.clone(), vec![(path("x"), this(&ctx, "b.c")), (path("z"), this(&ctx, "nope"))]);
        let mut op = Applier::new(source(&rctx, input), Box::new(cut), Resetters::default());
        assert_eq!(vec!["{x:2}"], run(&mut op));

        let drop = DropEval::new(ctx.clone(), vec![path("a"), path("b")]);
        let mut op = Applier::new(source(&rctx, input), Box::new(drop), Resetters::default());
        assert!(run(&mut op).is_empty());

        let rename = RenameEval::new(ctx.clone(), vec![(path("a"), path("x"))]);
        let mut op = Applier::new(source(&rctx, input), Box::new(rename), Resetters::default());
        assert_eq!(vec!["{x:1,b:{c:2}}"], run(&mut op));
    }

    #[test]
    fn values_emits_each_expression() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let exprs = vec![this(&ctx, "a"), this(&ctx, "b"), this(&ctx, "nope")];
        let mut op = Values::new(source(&rctx, "{a:1,b:2} {a:3,b:4}"), exprs, Resetters::default());
        assert_eq!(vec!["1", "2", "3", "4"], run(&mut op));
    }
}
