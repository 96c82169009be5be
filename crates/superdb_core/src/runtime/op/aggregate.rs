//! Grouped aggregation.
use std::collections::VecDeque;
use std::sync::Arc;

use indexmap::IndexMap;
use superdb_error::Result;
use tracing::debug;

use super::sort::spill_values;
use crate::bsup;
use crate::io::ValueReader;
use crate::runtime::expr::record::build_from_paths;
use crate::runtime::expr::{AggFunc, Aggregator, BoxEval};
use crate::runtime::{Batch, BoxPuller, Puller, RuntimeContext, SpillFile};
use crate::value::Value;

type Row = Vec<Box<dyn AggFunc>>;

/// Hash aggregation over group keys.
///
/// Without keys the operator is a scalar aggregation and always emits one
/// record per platoon, even for empty input. When `partials_in` is set the
/// input records carry partial states at the key and aggregate paths; when
/// `partials_out` is set the results are partial states for a downstream
/// aggregation to combine. A nonzero `input_sort_dir` declares the input
/// sorted by the first key, so each group is emitted as soon as that key
/// changes. With a nonzero `limit`, groups beyond that many are spilled as
/// partials and merged back at the end of the platoon.
pub struct Aggregate {
    rctx: Arc<RuntimeContext>,
    parent: BoxPuller,
    keys: Vec<(Vec<String>, BoxEval)>,
    aggs: Vec<(Vec<String>, Aggregator)>,
    limit: usize,
    input_sort_dir: i32,
    partials_in: bool,
    partials_out: bool,
    table: IndexMap<Vec<Value>, Row>,
    last_primary: Option<Value>,
    spills: Vec<SpillFile>,
    pending: VecDeque<Value>,
    eos: bool,
}

impl Aggregate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rctx: Arc<RuntimeContext>,
        parent: BoxPuller,
        keys: Vec<(Vec<String>, BoxEval)>,
        aggs: Vec<(Vec<String>, Aggregator)>,
        limit: usize,
        input_sort_dir: i32,
        partials_in: bool,
        partials_out: bool,
    ) -> Self {
        Aggregate {
            rctx,
            parent,
            keys,
            aggs,
            limit,
            input_sort_dir,
            partials_in,
            partials_out,
            table: IndexMap::new(),
            last_primary: None,
            spills: Vec::new(),
            pending: VecDeque::new(),
            eos: false,
        }
    }

    fn new_row(&self) -> Row {
        self.aggs.iter().map(|(_, a)| a.new_func()).collect()
    }

    fn key_values(&self, val: &Value, partial: bool) -> Option<Vec<Value>> {
        let mut out = Vec::with_capacity(self.keys.len());
        for (path, eval) in &self.keys {
            let key = if partial {
                val.deref_path(path)?
            } else {
                eval.eval(val)
            };
            if key.is_missing() {
                return None;
            }
            out.push(key);
        }
        Some(out)
    }

    fn consume(&mut self, val: &Value, partial: bool, merging: bool) -> Result<()> {
        let Some(keys) = self.key_values(val, partial) else {
            return Ok(());
        };
        if self.input_sort_dir != 0 && !merging {
            if let Some(first) = keys.first() {
                if self.last_primary.as_ref().is_some_and(|last| last != first) {
                    self.flush()?;
                }
                self.last_primary = Some(first.clone());
            }
        }
        if !merging && self.limit > 0 && self.table.len() >= self.limit && !self.table.contains_key(&keys) {
            self.spill()?;
        }
        if !self.table.contains_key(&keys) {
            let row = self.new_row();
            self.table.insert(keys.clone(), row);
        }
        let Some(row) = self.table.get_mut(&keys) else {
            return Ok(());
        };
        for (f, (path, agg)) in row.iter_mut().zip(&self.aggs) {
            if partial {
                let state = val.deref_path(path).unwrap_or_else(Value::null);
                f.consume_as_partial(&state)?;
            } else {
                agg.apply(f.as_mut(), val);
            }
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        let rows = self.drain_rows(true)?;
        let file = spill_values(&self.rctx, rows.iter())?;
        debug!(groups = rows.len(), "aggregation spilled partial groups");
        self.spills.push(file);
        Ok(())
    }

    /// Removes every group from the table as an output record.
    fn drain_rows(&mut self, as_partial: bool) -> Result<Vec<Value>> {
        let ctx = self.rctx.ctx.clone();
        let mut out = Vec::with_capacity(self.table.len());
        for (keys, mut row) in self.table.drain(..) {
            let mut entries = Vec::with_capacity(keys.len() + row.len());
            for ((path, _), key) in self.keys.iter().zip(keys) {
                entries.push((path.clone(), key));
            }
            for ((path, _), f) in self.aggs.iter().zip(row.iter_mut()) {
                let v = if as_partial {
                    f.result_as_partial(&ctx)
                } else {
                    f.result(&ctx)
                };
                entries.push((path.clone(), v));
            }
            out.push(build_from_paths(&ctx, entries)?);
        }
        Ok(out)
    }

    /// Merges spilled groups back in and queues every group for output.
    fn flush(&mut self) -> Result<()> {
        for file in std::mem::take(&mut self.spills) {
            let mut reader = bsup::Reader::new(self.rctx.ctx.clone(), file);
            while let Some(rec) = reader.read()? {
                self.consume(&rec, true, true)?;
            }
        }
        if self.keys.is_empty() && self.table.is_empty() {
            let row = self.new_row();
            self.table.insert(Vec::new(), row);
        }
        let rows = self.drain_rows(self.partials_out)?;
        self.pending.extend(rows);
        Ok(())
    }

    fn reset(&mut self) {
        self.table.clear();
        self.spills.clear();
        self.pending.clear();
        self.last_primary = None;
        self.eos = false;
    }
}

impl Puller for Aggregate {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if done {
            self.reset();
            return self.parent.pull(true);
        }
        loop {
            if !self.pending.is_empty() {
                let n = self.rctx.config.batch_size.max(1).min(self.pending.len());
                return Ok(Some(Batch::new(self.pending.drain(..n).collect())));
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
                    self.last_primary = None;
                    self.eos = true;
                }
                Ok(Some(batch)) => {
                    for val in batch.values() {
                        self.consume(val, self.partials_in, false)?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::session::SessionConfig;
    use crate::runtime::expr::This;
    use crate::runtime::testutil::{rctx, run, source, text};
    use crate::types::TypeContext;

    fn this(rctx: &RuntimeContext, name: &str) -> BoxEval {
        Box::new(This::new(rctx.ctx.clone(), vec![name.to_string()]))
    }

    fn agg(rctx: &RuntimeContext, name: &str, arg: Option<&str>) -> (Vec<String>, Aggregator) {
        let expr = arg.map(|a| this(rctx, a));
        (vec![name.to_string()], Aggregator::new(name, false, expr, None).unwrap())
    }

    #[test]
    fn groups_by_key() {
        let rctx = rctx();
        let keys = vec![(vec!["a".to_string()], this(&rctx, "a"))];
        let aggs = vec![agg(&rctx, "sum", Some("b"))];
        let input = source(&rctx, "{a:1,b:2} {a:1,b:3} {a:2,b:4} {b:9}");
        let mut op = Aggregate::new(rctx.clone(), input, keys, aggs, 0, 0, false, false);
        assert_eq!(vec!["{a:1,sum:5}", "{a:2,sum:4}"], run(&mut op));
    }

    #[test]
    fn scalar_form_emits_for_empty_input() {
        let rctx = rctx();
        let aggs = vec![agg(&rctx, "count", None)];
        let mut op = Aggregate::new(rctx.clone(), source(&rctx, ""), Vec::new(), aggs, 0, 0, false, false);
        assert_eq!(vec!["{count:0}"], run(&mut op));
    }

    #[test]
    fn partials_round_trip() {
        let rctx = rctx();
        let keys = || vec![(vec!["k".to_string()], this(&rctx, "k"))];
        let aggs = || vec![agg(&rctx, "avg", Some("v"))];
        let first = Aggregate::new(
            rctx.clone(),
            source(&rctx, "{k:1,v:1} {k:1,v:2} {k:2,v:5}"),
            keys(),
            aggs(),
            0,
            0,
            false,
            true,
        );
        let mut second = Aggregate::new(rctx.clone(), Box::new(first), keys(), aggs(), 0, 0, true, false);
        assert_eq!(vec!["{k:1,avg:1.5}", "{k:2,avg:5.}"], run(&mut second));
    }

    #[test]
    fn sorted_input_streams_groups() {
        let rctx = rctx();
        let keys = vec![(vec!["k".to_string()], this(&rctx, "k"))];
        let aggs = vec![agg(&rctx, "count", None)];
        let mut op = Aggregate::new(
            rctx.clone(),
            source(&rctx, "{k:1} {k:1} {k:2} {k:3} {k:3}"),
            keys,
            aggs,
            0,
            1,
            false,
            false,
        );
        // Groups 1 and 2 close before the input ends.
        let first = op.pull(false).unwrap().unwrap();
        assert_eq!(vec!["{k:1,count:2}", "{k:2,count:1}"], text(first.values()));
        assert_eq!(vec!["{k:3,count:2}"], run(&mut op));
    }

    #[test]
    fn limit_spills_and_merges() {
        let rctx = RuntimeContext::new(Arc::new(TypeContext::new()), SessionConfig::default());
        let keys = vec![(vec!["k".to_string()], this(&rctx, "k"))];
        let aggs = vec![agg(&rctx, "sum", Some("v"))];
        let input = source(&rctx, "{k:1,v:1} {k:2,v:1} {k:3,v:1} {k:1,v:1} {k:2,v:1}");
        let mut op = Aggregate::new(rctx.clone(), input, keys, aggs, 2, 0, false, false);
        let mut out = run(&mut op);
        out.sort();
        assert_eq!(vec!["{k:1,sum:2}", "{k:2,sum:2}", "{k:3,sum:1}"], out);
        assert_eq!(0, rctx.temp_files());
    }
}
