use std::sync::Arc;

use superdb_error::Result;

use crate::runtime::expr::BoxEval;
use crate::runtime::{Batch, BoxPuller, HASH_STATE, HashSet, Puller, batch_of};
use crate::types::TypeContext;
use crate::value::{Value, new_record};

/// Collapses runs of adjacent equal values. With `cflag` each run becomes
/// `{value,count}` with a uint64 count.
pub struct Uniq {
    ctx: Arc<TypeContext>,
    parent: BoxPuller,
    cflag: bool,
    last: Option<Value>,
    count: u64,
    eos: bool,
}

impl Uniq {
    pub fn new(ctx: Arc<TypeContext>, parent: BoxPuller, cflag: bool) -> Self {
        Uniq {
            ctx,
            parent,
            cflag,
            last: None,
            count: 0,
            eos: false,
        }
    }

    fn wrap(&self, val: Value) -> Result<Value> {
        if !self.cflag {
            return Ok(val);
        }
        new_record(
            &self.ctx,
            vec![
                ("value".to_string(), val),
                ("count".to_string(), Value::from_uint64(self.count)),
            ],
        )
    }

    fn flush(&mut self, out: &mut Vec<Value>) -> Result<()> {
        if let Some(last) = self.last.take() {
            out.push(self.wrap(last)?);
        }
        self.count = 0;
        Ok(())
    }
}

impl Puller for Uniq {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if done {
            self.last = None;
            self.count = 0;
            self.eos = false;
            return self.parent.pull(true);
        }
        if self.eos {
            self.eos = false;
            return Ok(None);
        }
        loop {
            let mut out = Vec::new();
            let Some(batch) = self.parent.pull(false)? else {
                self.flush(&mut out)?;
                let batch = batch_of(out);
                self.eos = batch.is_some();
                return Ok(batch);
            };
            for val in batch.values() {
                if self.last.as_ref() == Some(val) {
                    self.count += 1;
                    continue;
                }
                self.flush(&mut out)?;
                self.last = Some(val.clone());
                self.count = 1;
            }
            if let Some(b) = batch_of(out) {
                return Ok(Some(b));
            }
        }
    }
}

/// Emits the first value seen for each distinct key within a platoon.
pub struct Distinct {
    parent: BoxPuller,
    expr: BoxEval,
    seen: HashSet<Value>,
}

impl Distinct {
    pub fn new(parent: BoxPuller, expr: BoxEval) -> Self {
        Distinct {
            parent,
            expr,
            seen: HashSet::with_hasher(HASH_STATE),
        }
    }
}

impl Puller for Distinct {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        loop {
            let Some(batch) = self.parent.pull(done)? else {
                self.seen.clear();
                return Ok(None);
            };
            let out: Vec<Value> = batch
                .values()
                .iter()
                .filter(|v| self.seen.insert(self.expr.eval(v)))
                .cloned()
                .collect();
            if let Some(b) = batch_of(out) {
                return Ok(Some(b));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::expr::This;
    use crate::runtime::testutil::{rctx, run, source};

    #[test]
    fn uniq_collapses_adjacent_runs() {
        let rctx = rctx();
        let mut op = Uniq::new(rctx.ctx.clone(), source(&rctx, "1 1 2 2 2 1"), false);
        assert_eq!(vec!["1", "2", "1"], run(&mut op));
        let mut op = Uniq::new(rctx.ctx.clone(), source(&rctx, "1 1 2 2 2 1"), true);
        assert_eq!(
            vec![
                "{value:1,count:2::uint64}",
                "{value:2,count:3::uint64}",
                "{value:1,count:1::uint64}"
            ],
            run(&mut op)
        );
    }

    #[test]
    fn distinct_by_key() {
        let rctx = rctx();
        let key = Box::new(This::new(rctx.ctx.clone(), vec!["k".to_string()]));
        let mut op = Distinct::new(source(&rctx, "{k:1,v:1} {k:2,v:2} {k:1,v:3} {v:4} {v:5}"), key);
        assert_eq!(vec!["{k:1,v:1}", "{k:2,v:2}", "{v:4}"], run(&mut op));
    }
}
