//! Hash aggregation over vectors.
use std::collections::VecDeque;
use std::sync::Arc;

use indexmap::IndexMap;
use superdb_error::{DbError, Result};

use crate::runtime::expr::record::build_from_paths;
use crate::runtime::expr::{AggFunc, Aggregator};
use crate::runtime::{BoxPuller, Puller, RuntimeContext};
use crate::value::Value;
use crate::vector::Vector;
use crate::vector::expr::BoxVecEval;

type Row = Vec<Box<dyn AggFunc>>;

/// An aggregate call whose argument and filter are vector expressions.
pub struct VecAggregator {
    agg: Aggregator,
    expr: Option<BoxVecEval>,
    filter: Option<BoxVecEval>,
}

impl VecAggregator {
    pub fn new(name: &str, distinct: bool, expr: Option<BoxVecEval>, filter: Option<BoxVecEval>) -> Result<Self> {
        let agg = Aggregator::state_only(name, distinct)?;
        if expr.is_none() && name != "count" {
            return Err(DbError::new(format!("{name}: argument required")));
        }
        Ok(VecAggregator { agg, expr, filter })
    }
}

/// The evaluated argument and filter of one aggregator for one chunk.
struct Evaluated {
    arg: Option<Vector>,
    filter: Option<Vector>,
}

/// Hash aggregation with the keys and arguments evaluated a chunk at a
/// time. Groups keep first-seen order. Sorted-input streaming and spilling
/// are left to the row-oriented [`crate::runtime::op::Aggregate`].
pub struct VecAggregate {
    rctx: Arc<RuntimeContext>,
    parent: BoxPuller<Vector>,
    keys: Vec<(Vec<String>, BoxVecEval)>,
    aggs: Vec<(Vec<String>, VecAggregator)>,
    partials_in: bool,
    partials_out: bool,
    table: IndexMap<Vec<Value>, Row>,
    pending: VecDeque<Value>,
    eos: bool,
}

impl VecAggregate {
    pub fn new(
        rctx: Arc<RuntimeContext>,
        parent: BoxPuller<Vector>,
        keys: Vec<(Vec<String>, BoxVecEval)>,
        aggs: Vec<(Vec<String>, VecAggregator)>,
        partials_in: bool,
        partials_out: bool,
    ) -> Self {
        VecAggregate {
            rctx,
            parent,
            keys,
            aggs,
            partials_in,
            partials_out,
            table: IndexMap::new(),
            pending: VecDeque::new(),
            eos: false,
        }
    }

    fn row(&mut self, keys: Vec<Value>) -> &mut Row {
        let aggs = &self.aggs;
        self.table
            .entry(keys)
            .or_insert_with(|| aggs.iter().map(|(_, a)| a.agg.new_func()).collect())
    }

    fn consume(&mut self, vec: &Vector) -> Result<()> {
        if self.partials_in {
            for val in vec.values() {
                let Some(keys) = self.keys.iter().map(|(p, _)| val.deref_path(p)).collect::<Option<Vec<_>>>() else {
                    continue;
                };
                if keys.iter().any(Value::is_missing) {
                    continue;
                }
                let paths: Vec<Vec<String>> = self.aggs.iter().map(|(p, _)| p.clone()).collect();
                let row = self.row(keys);
                for (f, path) in row.iter_mut().zip(&paths) {
                    let state = val.deref_path(path).unwrap_or_else(Value::null);
                    f.consume_as_partial(&state)?;
                }
            }
            return Ok(());
        }
        let keys: Vec<Vector> = self.keys.iter().map(|(_, e)| e.eval(vec)).collect();
        let evals: Vec<Evaluated> = self
            .aggs
            .iter()
            .map(|(_, a)| Evaluated {
                arg: a.expr.as_ref().map(|e| e.eval(vec)),
                filter: a.filter.as_ref().map(|e| e.eval(vec)),
            })
            .collect();
        'slots: for i in 0..vec.len() {
            let mut key = Vec::with_capacity(keys.len());
            for k in &keys {
                let v = k.value_at(i);
                if v.is_missing() {
                    continue 'slots;
                }
                key.push(v);
            }
            let row = self.row(key);
            for (f, ev) in row.iter_mut().zip(&evals) {
                if let Some(filter) = &ev.filter {
                    if !filter.value_at(i).is_true() {
                        continue;
                    }
                }
                let arg = match &ev.arg {
                    Some(arg) => arg.value_at(i),
                    None => vec.value_at(i),
                };
                if !arg.is_missing() {
                    f.consume(&arg);
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.keys.is_empty() && self.table.is_empty() {
            self.row(Vec::new());
        }
        let ctx = self.rctx.ctx.clone();
        for (keys, mut row) in self.table.drain(..) {
            let mut entries = Vec::with_capacity(keys.len() + row.len());
            for ((path, _), key) in self.keys.iter().zip(keys) {
                entries.push((path.clone(), key));
            }
            for ((path, _), f) in self.aggs.iter().zip(row.iter_mut()) {
                let v = if self.partials_out {
                    f.result_as_partial(&ctx)
                } else {
                    f.result(&ctx)
                };
                entries.push((path.clone(), v));
            }
            self.pending.push_back(build_from_paths(&ctx, entries)?);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.table.clear();
        self.pending.clear();
        self.eos = false;
    }
}

impl Puller<Vector> for VecAggregate {
    fn pull(&mut self, done: bool) -> Result<Option<Vector>> {
        if done {
            self.reset();
            return self.parent.pull(true);
        }
        loop {
            if !self.pending.is_empty() {
                let n = self.rctx.config.batch_size.max(1).min(self.pending.len());
                let vals: Vec<Value> = self.pending.drain(..n).collect();
                return Ok(Some(Vector::from_values(&vals)));
            }
            if self.eos {
                self.eos = false;
                return Ok(None);
            }
            match self.parent.pull(false) {
                Err(e) => {
                    self.reset();
                    return Err(e);
                }
                Ok(None) => {
                    self.flush()?;
                    self.eos = true;
                }
                Ok(Some(vec)) => self.consume(&vec)?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::expr::binary::CompareOp;
    use crate::runtime::testutil::rctx;
    use crate::types::TypeContext;
    use crate::vector::expr::{VecCompare, VecLiteral, VecThis};
    use crate::vector::testutil::{vrun, vsource};

    fn this(ctx: &Arc<TypeContext>, name: &str) -> BoxVecEval {
        Box::new(VecThis::new(ctx.clone(), vec![name.to_string()]))
    }

    fn agg(ctx: &Arc<TypeContext>, name: &str, arg: Option<&str>) -> (Vec<String>, VecAggregator) {
        let expr = arg.map(|a| this(ctx, a));
        (vec![name.to_string()], VecAggregator::new(name, false, expr, None).unwrap())
    }

    #[test]
    fn groups_by_key() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let keys = vec![(vec!["a".to_string()], this(&ctx, "a"))];
        let aggs = vec![agg(&ctx, "sum", Some("b")), agg(&ctx, "count", None)];
        let input = vsource(&rctx, "{a:1,b:2} {a:1,b:3} {a:2,b:4} {b:9}");
        let op = VecAggregate::new(rctx.clone(), input, keys, aggs, false, false);
        assert_eq!(vec!["{a:1,sum:5,count:2}", "{a:2,sum:4,count:1}"], vrun(Box::new(op)));
    }

    #[test]
    fn scalar_form_and_filter() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let op = VecAggregate::new(rctx.clone(), vsource(&rctx, ""), Vec::new(), vec![agg(&ctx, "count", None)], false, false);
        assert_eq!(vec!["{count:0}"], vrun(Box::new(op)));

        let filter = VecCompare::new(CompareOp::Gt, this(&ctx, "x"), Box::new(VecLiteral(Value::from_int64(1))));
        let counted = VecAggregator::new("count", false, None, Some(Box::new(filter))).unwrap();
        let aggs = vec![(vec!["count".to_string()], counted)];
        let op = VecAggregate::new(rctx.clone(), vsource(&rctx, "{x:1} {x:2} {x:3} 7"), Vec::new(), aggs, false, false);
        assert_eq!(vec!["{count:2}"], vrun(Box::new(op)));
    }

    #[test]
    fn partials_combine() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let keys = || vec![(vec!["k".to_string()], this(&ctx, "k"))];
        let first = VecAggregate::new(
            rctx.clone(),
            vsource(&rctx, "{k:1,v:1} {k:1,v:2} {k:2,v:5}"),
            keys(),
            vec![agg(&ctx, "avg", Some("v"))],
            false,
            true,
        );
        let second = VecAggregate::new(rctx.clone(), Box::new(first), keys(), vec![agg(&ctx, "avg", Some("v"))], true, false);
        assert_eq!(vec!["{k:1,avg:1.5}", "{k:2,avg:5.}"], vrun(Box::new(second)));
    }
}
