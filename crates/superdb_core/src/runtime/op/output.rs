//! Sinks and pass-through operators: output labeling, lake loads, fuse,
//! running counts and pass.
use std::collections::VecDeque;
use std::sync::Arc;

use superdb_error::Result;
use tracing::debug;
use uuid::Uuid;

use super::sort::spill_values;
use crate::bsup;
use crate::io::ValueReader;
use crate::lake::{CommitMessage, Lake};
use crate::runtime::expr::BoxEval;
use crate::runtime::{Batch, BoxPuller, Chunk, Puller, RuntimeContext, SpillFile, drain_platoon};
use crate::value::fuse::Schema;
use crate::value::{Value, new_record};

/// Passes chunks through unchanged.
pub struct Pass<T = Batch> {
    parent: BoxPuller<T>,
}

impl<T: Chunk> Pass<T> {
    pub fn new(parent: BoxPuller<T>) -> Self {
        Pass { parent }
    }
}

impl<T: Chunk> Puller<T> for Pass<T> {
    fn pull(&mut self, done: bool) -> Result<Option<T>> {
        self.parent.pull(done)
    }
}

/// Labels every batch with the name of the output channel it feeds.
pub struct Output {
    parent: BoxPuller,
    name: Arc<str>,
}

impl Output {
    pub fn new(parent: BoxPuller, name: &str) -> Self {
        Output {
            parent,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Puller for Output {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        Ok(self
            .parent
            .pull(done)?
            .map(|b| b.with_label(self.name.clone())))
    }
}

/// Drains its parent into a lake branch and emits the new commit id as a
/// bytes value.
pub struct Load {
    lake: Arc<dyn Lake>,
    parent: BoxPuller,
    pool: Uuid,
    branch: String,
    msg: CommitMessage,
    eos: bool,
}

impl Load {
    pub fn new(lake: Arc<dyn Lake>, parent: BoxPuller, pool: Uuid, branch: &str, msg: CommitMessage) -> Self {
        let branch = if branch.is_empty() { "main" } else { branch };
        Load {
            lake,
            parent,
            pool,
            branch: branch.to_string(),
            msg,
            eos: false,
        }
    }
}

impl Puller for Load {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if self.eos {
            self.eos = false;
            return Ok(None);
        }
        if done {
            return self.parent.pull(true);
        }
        let vals = drain_platoon(&mut self.parent)?;
        let n = vals.len();
        let commit = self.lake.load(&self.pool, &self.branch, vals, self.msg.clone())?;
        debug!(pool = %self.pool, branch = %self.branch, %commit, values = n, "load committed");
        self.eos = true;
        Ok(Some(Batch::new(vec![Value::from_bytes(commit.as_bytes())])))
    }
}

/// Buffers a platoon, fusing the types of its values into one supertype,
/// then emits every value shaped to that type. Values beyond the memory
/// budget are spilled.
pub struct Fuse {
    rctx: Arc<RuntimeContext>,
    parent: BoxPuller,
    schema: Schema,
    vals: Vec<Value>,
    nbytes: usize,
    spills: Vec<SpillFile>,
    pending: VecDeque<Value>,
    eos: bool,
}

impl Fuse {
    pub fn new(rctx: Arc<RuntimeContext>, parent: BoxPuller) -> Self {
        Fuse {
            rctx,
            parent,
            schema: Schema::new(),
            vals: Vec::new(),
            nbytes: 0,
            spills: Vec::new(),
            pending: VecDeque::new(),
            eos: false,
        }
    }

    fn stash(&mut self, val: &Value) -> Result<()> {
        self.schema.mix(&self.rctx.ctx, val.typ())?;
        self.nbytes += val.size();
        self.vals.push(val.clone());
        if self.nbytes >= self.rctx.config.sort_mem_bytes {
            let file = spill_values(&self.rctx, self.vals.iter())?;
            debug!(values = self.vals.len(), "fuse spilled values");
            self.spills.push(file);
            self.vals.clear();
            self.nbytes = 0;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let ctx = self.rctx.ctx.clone();
        for file in std::mem::take(&mut self.spills) {
            let mut reader = bsup::Reader::new(ctx.clone(), file);
            while let Some(val) = reader.read()? {
                self.pending.push_back(self.schema.shape(&ctx, &val)?);
            }
        }
        for val in std::mem::take(&mut self.vals) {
            self.pending.push_back(self.schema.shape(&ctx, &val)?);
        }
        self.reset_buffers();
        Ok(())
    }

    fn reset_buffers(&mut self) {
        self.schema = Schema::new();
        self.vals.clear();
        self.spills.clear();
        self.nbytes = 0;
    }
}

impl Puller for Fuse {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if done {
            self.reset_buffers();
            self.pending.clear();
            self.eos = false;
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
            match self.parent.pull(false)? {
                Some(batch) => {
                    for val in batch.values() {
                        self.stash(val)?;
                    }
                }
                None => {
                    self.finish()?;
                    self.eos = true;
                }
            }
        }
    }
}

/// Adds a running count to each value: the output is the record of the
/// expression's fields followed by `alias`. The count restarts with each
/// platoon.
pub struct Count {
    rctx: Arc<RuntimeContext>,
    parent: BoxPuller,
    alias: String,
    expr: Option<BoxEval>,
    count: i64,
}

impl Count {
    pub fn new(rctx: Arc<RuntimeContext>, parent: BoxPuller, alias: &str, expr: Option<BoxEval>) -> Self {
        Count {
            rctx,
            parent,
            alias: alias.to_string(),
            expr,
            count: 0,
        }
    }
}

impl Puller for Count {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        let Some(batch) = self.parent.pull(done)? else {
            self.count = 0;
            return Ok(None);
        };
        let ctx = &self.rctx.ctx;
        let mut out = Vec::with_capacity(batch.len());
        for val in batch.values() {
            self.count += 1;
            let mut fields = match &self.expr {
                Some(e) => e.eval(val).fields(),
                None => Vec::new(),
            };
            fields.retain(|(name, _)| name != &self.alias);
            fields.push((self.alias.clone(), Value::from_int64(self.count)));
            out.push(new_record(ctx, fields).unwrap_or_else(|e| ctx.new_error_string(e.get_msg())));
        }
        Ok(Some(Batch::new(out)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::session::SessionConfig;
    use crate::lake::MemoryLake;
    use crate::order::SortKeys;
    use crate::runtime::expr::This;
    use crate::runtime::testutil::{rctx, run, source};
    use crate::types::TypeContext;

    #[test]
    fn output_labels_batches() {
        let rctx = rctx();
        let mut op = Output::new(source(&rctx, "1 2"), "main");
        let b = op.pull(false).unwrap().unwrap();
        assert_eq!(Some("main"), b.label());
        assert_eq!("main", op.name());
    }

    #[test]
    fn fuse_unifies_record_types() {
        let rctx = rctx();
        let mut op = Fuse::new(rctx.clone(), source(&rctx, "{a:1} {b:\"x\"}"));
        assert_eq!(vec!["{a:1,b:null::string}", "{a:null::int64,b:\"x\"}"], run(&mut op));
    }

    #[test]
    fn fuse_spills_past_budget() {
        let mut config = SessionConfig::default();
        config.sort_mem_bytes = 1;
        let rctx = RuntimeContext::new(Arc::new(TypeContext::new()), config);
        let mut op = Fuse::new(rctx.clone(), source(&rctx, "{a:1} {a:2} {a:3}"));
        assert_eq!(vec!["{a:1}", "{a:2}", "{a:3}"], run(&mut op));
        assert_eq!(0, rctx.temp_files());
    }

    #[test]
    fn count_restarts_per_platoon() {
        let rctx = rctx();
        let this: BoxEval = Box::new(This::new(rctx.ctx.clone(), Vec::new()));
        let mut op = Count::new(rctx.clone(), source(&rctx, "{x:1} {x:2} {x:3}"), "n", Some(this));
        assert_eq!(vec!["{x:1,n:1}", "{x:2,n:2}", "{x:3,n:3}"], run(&mut op));
        assert!(run(&mut op).is_empty());
    }

    #[test]
    fn load_commits_and_emits_id() {
        let rctx = rctx();
        let lake = Arc::new(MemoryLake::new());
        let pool = lake.create_pool("logs", SortKeys::default(), 100).unwrap();
        let mut op = Load::new(lake.clone(), source(&rctx, "{x:1} {x:2}"), pool, "", CommitMessage::default());
        let out = drain_platoon(&mut op).unwrap();
        assert_eq!(1, out.len());
        let head = lake.branch_head(&pool, "main").unwrap();
        assert_eq!(Some(head.as_bytes().as_slice()), out[0].bytes());
    }
}
