//! Sort with spilling, and top-n.
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, bounded, select};
use superdb_error::{DbError, Result};
use tracing::debug;

use crate::bsup;
use crate::io::{ValueReader, ValueWriter};
use crate::runtime::expr::{Comparator, Resetters, SortEval};
use crate::runtime::{Batch, BoxPuller, CancelToken, Puller, RuntimeContext, SpillFile};
use crate::types::TypeContext;
use crate::value::Value;

type Keyed = (Vec<Value>, Value);
type SortResult = Result<Option<Batch>>;

fn comparator(ctx: &Arc<TypeContext>, exprs: &mut Option<Vec<SortEval>>, first: &Value, reverse: bool) -> Comparator {
    match exprs.take() {
        Some(keys) if !keys.is_empty() => Comparator::new(keys),
        _ => Comparator::guess(ctx, first, reverse),
    }
}

/// Sorts each platoon of its parent. The sort runs on a worker thread that
/// spills sorted runs to temporary files once the buffered values exceed
/// the configured memory budget.
pub struct Sort {
    rctx: Arc<RuntimeContext>,
    worker: Option<SortWorker>,
    results: Option<Receiver<SortResult>>,
}

impl Sort {
    /// With no `exprs` the key is guessed from the first value, descending
    /// when `reverse` is set.
    pub fn new(
        rctx: Arc<RuntimeContext>,
        parent: BoxPuller,
        exprs: Vec<SortEval>,
        reverse: bool,
        resetters: Resetters,
    ) -> Self {
        let worker = SortWorker {
            rctx: rctx.clone(),
            ctx: rctx.ctx.clone(),
            token: rctx.token().clone(),
            parent,
            exprs: Some(exprs),
            reverse,
            comparator: None,
            resetters,
            mem_max: rctx.config.sort_mem_bytes.max(1),
            batch_size: rctx.config.batch_size.max(1),
            files: Vec::new(),
        };
        Sort {
            rctx,
            worker: Some(worker),
            results: None,
        }
    }

    fn start(&mut self) -> Result<()> {
        if let Some(mut worker) = self.worker.take() {
            let (tx, rx) = bounded(1);
            self.results = Some(rx);
            self.rctx.spawn("sort", move || worker.run(tx))?;
        }
        Ok(())
    }
}

impl Puller for Sort {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        self.start()?;
        let Some(results) = &self.results else {
            return Ok(None);
        };
        loop {
            let Ok(result) = results.recv() else {
                self.rctx.token().check()?;
                return Err(DbError::new("sort worker exited unexpectedly"));
            };
            match result {
                Ok(Some(_)) if done => continue,
                r => return r,
            }
        }
    }
}

struct SortWorker {
    rctx: Arc<RuntimeContext>,
    ctx: Arc<TypeContext>,
    token: CancelToken,
    parent: BoxPuller,
    exprs: Option<Vec<SortEval>>,
    reverse: bool,
    comparator: Option<Comparator>,
    resetters: Resetters,
    mem_max: usize,
    batch_size: usize,
    files: Vec<SpillFile>,
}

impl SortWorker {
    fn run(&mut self, tx: Sender<SortResult>) {
        let mut buffered = Vec::new();
        let mut nbytes = 0;
        loop {
            let batch = match self.parent.pull(false) {
                Ok(b) => b,
                Err(e) => {
                    buffered.clear();
                    nbytes = 0;
                    self.files.clear();
                    if !self.send(&tx, Err(e)) {
                        return;
                    }
                    continue;
                }
            };
            let Some(batch) = batch else {
                let ok = self.finish(&tx, std::mem::take(&mut buffered));
                nbytes = 0;
                if !ok {
                    return;
                }
                continue;
            };
            for val in batch.values() {
                let cmp = self
                    .comparator
                    .get_or_insert_with(|| comparator(&self.ctx, &mut self.exprs, val, self.reverse));
                nbytes += val.size();
                buffered.push((cmp.key_values(val), val.clone()));
            }
            if nbytes >= self.mem_max {
                let run = std::mem::take(&mut buffered);
                nbytes = 0;
                if let Err(e) = self.spill_run(run) {
                    self.files.clear();
                    if !self.send(&tx, Err(e)) {
                        return;
                    }
                }
            }
        }
    }

    fn send(&self, tx: &Sender<SortResult>, r: SortResult) -> bool {
        if matches!(r, Ok(None)) {
            self.resetters.reset();
        }
        select! {
            send(tx, r) -> res => res.is_ok(),
            recv(self.token.done()) -> _ => false,
        }
    }

    fn sort_run(&self, run: &mut [Keyed]) {
        if let Some(cmp) = &self.comparator {
            run.sort_by(|a, b| cmp.compare_keys(&a.0, &b.0));
        }
    }

    fn spill_run(&mut self, mut run: Vec<Keyed>) -> Result<()> {
        self.sort_run(&mut run);
        let file = spill_values(&self.rctx, run.iter().map(|(_, v)| v))?;
        debug!(runs = self.files.len() + 1, "sort spilled a run");
        self.files.push(file);
        Ok(())
    }

    /// Emits the sorted platoon followed by an end of stream.
    fn finish(&mut self, tx: &Sender<SortResult>, mut run: Vec<Keyed>) -> bool {
        if self.files.is_empty() {
            self.sort_run(&mut run);
            for chunk in run.chunks(self.batch_size) {
                let batch = Batch::new(chunk.iter().map(|(_, v)| v.clone()).collect());
                if !self.send(tx, Ok(Some(batch))) {
                    return false;
                }
            }
            return self.send(tx, Ok(None));
        }
        if !run.is_empty() {
            if let Err(e) = self.spill_run(run) {
                self.files.clear();
                return self.send(tx, Err(e));
            }
        }
        let files = std::mem::take(&mut self.files);
        let Some(cmp) = &self.comparator else {
            return self.send(tx, Ok(None));
        };
        let mut merger = match RunMerger::new(&self.ctx, files, cmp) {
            Ok(m) => m,
            Err(e) => return self.send(tx, Err(e)),
        };
        loop {
            match merger.next_batch(cmp, self.batch_size) {
                Ok(Some(batch)) => {
                    if !self.send(tx, Ok(Some(batch))) {
                        return false;
                    }
                }
                Ok(None) => return self.send(tx, Ok(None)),
                Err(e) => return self.send(tx, Err(e)),
            }
        }
    }
}

/// Writes values to a new spill file as BSUP and rewinds it.
pub(crate) fn spill_values<'a>(rctx: &RuntimeContext, vals: impl Iterator<Item = &'a Value>) -> Result<SpillFile> {
    let file = rctx.new_spill_file()?;
    let mut w = bsup::Writer::new(file);
    for v in vals {
        w.write(v)?;
    }
    w.close()?;
    let mut file = w.into_inner();
    file.rewind()?;
    Ok(file)
}

/// A k-way merge over sorted spill runs. Ties go to the earlier run, so the
/// merge is stable.
struct RunMerger {
    readers: Vec<bsup::Reader<SpillFile>>,
    heads: Vec<Option<Keyed>>,
}

impl RunMerger {
    fn new(ctx: &Arc<TypeContext>, files: Vec<SpillFile>, cmp: &Comparator) -> Result<Self> {
        let mut readers: Vec<_> = files.into_iter().map(|f| bsup::Reader::new(ctx.clone(), f)).collect();
        let mut heads = Vec::with_capacity(readers.len());
        for r in &mut readers {
            heads.push(r.read()?.map(|v| (cmp.key_values(&v), v)));
        }
        Ok(RunMerger { readers, heads })
    }

    fn next_batch(&mut self, cmp: &Comparator, size: usize) -> Result<Option<Batch>> {
        let mut out = Vec::with_capacity(size);
        while out.len() < size {
            let mut min: Option<usize> = None;
            for (i, head) in self.heads.iter().enumerate() {
                let Some((keys, _)) = head else {
                    continue;
                };
                let better = match min.and_then(|m| self.heads[m].as_ref()) {
                    None => true,
                    Some((best, _)) => cmp.compare_keys(keys, best).is_lt(),
                };
                if better {
                    min = Some(i);
                }
            }
            let Some(i) = min else {
                break;
            };
            let next = self.readers[i].read()?.map(|v| (cmp.key_values(&v), v));
            if let Some((_, v)) = std::mem::replace(&mut self.heads[i], next) {
                out.push(v);
            }
        }
        Ok(crate::runtime::batch_of(out))
    }
}

/// The first `limit` values of each platoon in sort order.
pub struct Top {
    ctx: Arc<TypeContext>,
    parent: BoxPuller,
    limit: usize,
    exprs: Option<Vec<SortEval>>,
    reverse: bool,
    comparator: Option<Comparator>,
    vals: Vec<Keyed>,
    eos: bool,
}

impl Top {
    pub fn new(ctx: Arc<TypeContext>, parent: BoxPuller, limit: usize, exprs: Vec<SortEval>, reverse: bool) -> Self {
        Top {
            ctx,
            parent,
            limit,
            exprs: Some(exprs),
            reverse,
            comparator: None,
            vals: Vec::new(),
            eos: false,
        }
    }

    fn compact(&mut self) {
        if let Some(cmp) = &self.comparator {
            self.vals.sort_by(|a, b| cmp.compare_keys(&a.0, &b.0));
        }
        self.vals.truncate(self.limit);
    }
}

impl Puller for Top {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if done {
            self.vals.clear();
            self.eos = false;
            return self.parent.pull(true);
        }
        if self.eos {
            self.eos = false;
            return Ok(None);
        }
        while let Some(batch) = self.parent.pull(false)? {
            for val in batch.values() {
                let cmp = self
                    .comparator
                    .get_or_insert_with(|| comparator(&self.ctx, &mut self.exprs, val, self.reverse));
                self.vals.push((cmp.key_values(val), val.clone()));
            }
            if self.vals.len() >= 2 * self.limit.max(1) {
                self.compact();
            }
        }
        self.compact();
        let out: Vec<Value> = self.vals.drain(..).map(|(_, v)| v).collect();
        let batch = crate::runtime::batch_of(out);
        self.eos = batch.is_some();
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::session::SessionConfig;
    use crate::order::{Nulls, Which};
    use crate::runtime::expr::This;
    use crate::runtime::testutil::{rctx, run, source};

    fn key(ctx: &Arc<TypeContext>, name: &str, order: Which) -> SortEval {
        SortEval::new(Box::new(This::new(ctx.clone(), vec![name.to_string()])), order, Nulls::Last)
    }

    #[test]
    fn sorts_each_platoon() {
        let rctx = rctx();
        let exprs = vec![key(&rctx.ctx, "x", Which::Asc)];
        let mut op = Sort::new(
            rctx.clone(),
            source(&rctx, "{x:3} {x:1} {x:4} {x:1,y:1} {x:2}"),
            exprs,
            false,
            Resetters::default(),
        );
        assert_eq!(vec!["{x:1}", "{x:1,y:1}", "{x:2}", "{x:3}", "{x:4}"], run(&mut op));
        drop(op);
        rctx.cancel();
    }

    #[test]
    fn guesses_key_and_direction() {
        let rctx = rctx();
        let mut op = Sort::new(rctx.clone(), source(&rctx, "{s:\"b\",n:1} {s:\"a\",n:2}"), Vec::new(), true, Resetters::default());
        assert_eq!(vec!["{s:\"a\",n:2}", "{s:\"b\",n:1}"], run(&mut op));
    }

    #[test]
    fn spills_and_merges() {
        let mut config = SessionConfig::default();
        config.sort_mem_bytes = 4;
        let rctx = RuntimeContext::new(Arc::new(TypeContext::new()), config);
        let exprs = vec![key(&rctx.ctx, "x", Which::Desc)];
        let mut op = Sort::new(
            rctx.clone(),
            source(&rctx, "{x:3} {x:9} {x:1} {x:7} {x:5} {x:8}"),
            exprs,
            false,
            Resetters::default(),
        );
        assert_eq!(vec!["{x:9}", "{x:8}", "{x:7}", "{x:5}", "{x:3}", "{x:1}"], run(&mut op));
        drop(op);
        rctx.cancel();
        assert_eq!(0, rctx.temp_files());
    }

    #[test]
    fn top_keeps_smallest() {
        let rctx = rctx();
        let exprs = vec![key(&rctx.ctx, "x", Which::Asc)];
        let mut op = Top::new(rctx.ctx.clone(), source(&rctx, "{x:3} {x:1} {x:4} {x:2}"), 2, exprs, false);
        assert_eq!(vec!["{x:1}", "{x:2}"], run(&mut op));
        assert!(op.pull(false).unwrap().is_none());
    }
}
