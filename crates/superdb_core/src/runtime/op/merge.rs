//! Fan-in: combine and ordered merge of parallel parents.
//!
//! Each parent is pulled on its own worker thread so upstream branches run
//! concurrently. A worker pulls only on request, which keeps at most one
//! chunk in flight per parent and lets `done` reach every branch.
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Select, Sender, bounded, select};
use superdb_error::{DbError, Result};
use tracing::trace;

use crate::runtime::catcher::panic_error;
use crate::runtime::expr::{Comparator, Resetters};
use crate::runtime::{Batch, BoxPuller, CancelToken, Chunk, Puller, RuntimeContext};
use crate::value::Value;

type PullResult<T> = Result<Option<T>>;

/// Worker threads pulling a set of parents on demand.
pub(crate) struct Workers<T> {
    token: CancelToken,
    reqs: Vec<Sender<bool>>,
    resps: Vec<Receiver<PullResult<T>>>,
}

impl<T: Send + 'static> Workers<T> {
    pub(crate) fn spawn(rctx: &RuntimeContext, name: &str, parents: Vec<BoxPuller<T>>) -> Result<Self> {
        let token = rctx.token().clone();
        let mut reqs = Vec::with_capacity(parents.len());
        let mut resps = Vec::with_capacity(parents.len());
        for (i, mut parent) in parents.into_iter().enumerate() {
            let (req_tx, req_rx) = bounded::<bool>(1);
            let (resp_tx, resp_rx) = bounded::<PullResult<T>>(1);
            let token = token.clone();
            rctx.spawn(&format!("{name}-{i}"), move || {
                loop {
                    let done = select! {
                        recv(req_rx) -> msg => match msg {
                            Ok(done) => done,
                            Err(_) => return,
                        },
                        recv(token.done()) -> _ => return,
                    };
                    let r = panic::catch_unwind(AssertUnwindSafe(|| parent.pull(done)))
                        .unwrap_or_else(|payload| Err(panic_error(&payload)));
                    if resp_tx.send(r).is_err() {
                        return;
                    }
                }
            })?;
            reqs.push(req_tx);
            resps.push(resp_rx);
        }
        Ok(Workers { token, reqs, resps })
    }

    pub(crate) fn len(&self) -> usize {
        self.reqs.len()
    }

    pub(crate) fn request(&self, i: usize, done: bool) -> Result<()> {
        self.reqs[i]
            .send(done)
            .map_err(|_| DbError::new("internal error: parent worker exited"))
    }

    pub(crate) fn recv(&self, i: usize) -> PullResult<T> {
        select! {
            recv(self.resps[i]) -> r => r.map_err(|_| DbError::new("internal error: parent worker exited"))?,
            recv(self.token.done()) -> _ => Err(DbError::cancelled()),
        }
    }

    /// Waits for the first response among `active` parents.
    pub(crate) fn select(&self, active: &[usize]) -> Result<(usize, PullResult<T>)> {
        let mut sel = Select::new();
        for &i in active {
            sel.recv(&self.resps[i]);
        }
        let cancel = sel.recv(self.token.done());
        let oper = sel.select();
        let idx = oper.index();
        if idx == cancel {
            let _ = oper.recv(self.token.done());
            return Err(DbError::cancelled());
        }
        let i = active[idx];
        let r = oper
            .recv(&self.resps[i])
            .map_err(|_| DbError::new("internal error: parent worker exited"))?;
        Ok((i, r))
    }
}

#[derive(Clone, Copy, Default)]
struct ParentState {
    eos: bool,
    in_flight: bool,
}

/// Interleaves the chunks of all parents in arrival order. A platoon ends
/// once every parent has ended its platoon.
pub struct Combine<T> {
    rctx: Arc<RuntimeContext>,
    parents: Vec<BoxPuller<T>>,
    workers: Option<Workers<T>>,
    state: Vec<ParentState>,
}

impl<T: Chunk> Combine<T> {
    pub fn new(rctx: Arc<RuntimeContext>, parents: Vec<BoxPuller<T>>) -> Self {
        let state = vec![ParentState::default(); parents.len()];
        Combine {
            rctx,
            parents,
            workers: None,
            state,
        }
    }

    fn workers(&mut self) -> Result<&Workers<T>> {
        if self.workers.is_none() {
            let parents = std::mem::take(&mut self.parents);
            trace!(parents = parents.len(), "starting combine workers");
            self.workers = Some(Workers::spawn(&self.rctx, "combine", parents)?);
        }
        match &self.workers {
            Some(w) => Ok(w),
            None => unreachable!("workers started above"),
        }
    }

    fn stop(&mut self) -> Result<Option<T>> {
        self.workers()?;
        let Some(workers) = &self.workers else {
            return Ok(None);
        };
        let mut first_err = None;
        for (i, st) in self.state.iter_mut().enumerate() {
            if st.in_flight {
                st.in_flight = false;
                match workers.recv(i) {
                    Ok(None) => st.eos = true,
                    Ok(Some(_)) => {}
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }
            if !st.eos {
                if let Err(e) = workers.request(i, true).and_then(|_| workers.recv(i)) {
                    first_err.get_or_insert(e);
                }
            }
            st.eos = false;
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

impl<T: Chunk> Puller<T> for Combine<T> {
    fn pull(&mut self, done: bool) -> Result<Option<T>> {
        if done {
            return self.stop();
        }
        self.workers()?;
        let Some(workers) = &self.workers else {
            return Ok(None);
        };
        loop {
            for (i, st) in self.state.iter_mut().enumerate() {
                if !st.eos && !st.in_flight {
                    workers.request(i, false)?;
                    st.in_flight = true;
                }
            }
            let active: Vec<usize> = (0..workers.len()).filter(|&i| self.state[i].in_flight).collect();
            if active.is_empty() {
                for st in &mut self.state {
                    st.eos = false;
                }
                return Ok(None);
            }
            let (i, r) = workers.select(&active)?;
            self.state[i].in_flight = false;
            match r? {
                Some(chunk) => return Ok(Some(chunk)),
                None => self.state[i].eos = true,
            }
        }
    }
}

/// An ordered merge of parents that are each sorted by the comparator.
/// Equal keys are taken from the lower-numbered parent first.
pub struct Merge {
    rctx: Arc<RuntimeContext>,
    parents: Vec<BoxPuller>,
    workers: Option<Workers<Batch>>,
    cmp: Comparator,
    resetters: Resetters,
    heads: Vec<VecDeque<(Vec<Value>, Value)>>,
    eos: Vec<bool>,
}

impl Merge {
    pub fn new(rctx: Arc<RuntimeContext>, parents: Vec<BoxPuller>, cmp: Comparator, resetters: Resetters) -> Self {
        let n = parents.len();
        Merge {
            rctx,
            parents,
            workers: None,
            cmp,
            resetters,
            heads: vec![VecDeque::new(); n],
            eos: vec![false; n],
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.workers.is_none() {
            let parents = std::mem::take(&mut self.parents);
            self.workers = Some(Workers::spawn(&self.rctx, "merge", parents)?);
        }
        Ok(())
    }

    /// Fills every empty head whose parent is still in the platoon.
    fn fill(&mut self) -> Result<()> {
        let Some(workers) = &self.workers else {
            return Ok(());
        };
        let need: Vec<usize> = (0..self.heads.len())
            .filter(|&i| !self.eos[i] && self.heads[i].is_empty())
            .collect();
        for &i in &need {
            workers.request(i, false)?;
        }
        let mut first_err = None;
        for &i in &need {
            match workers.recv(i) {
                Ok(Some(batch)) => self.heads[i].extend(
                    batch
                        .values()
                        .iter()
                        .map(|v| (self.cmp.key_values(v), v.clone())),
                ),
                Ok(None) => self.eos[i] = true,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn min_head(&self, skip: Option<usize>) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, head) in self.heads.iter().enumerate() {
            if Some(i) == skip {
                continue;
            }
            let Some((keys, _)) = head.front() else {
                continue;
            };
            let better = match best.and_then(|b| self.heads[b].front()) {
                None => true,
                Some((bk, _)) => self.cmp.compare_keys(keys, bk).is_lt(),
            };
            if better {
                best = Some(i);
            }
        }
        best
    }

    fn stop(&mut self) -> Result<Option<Batch>> {
        self.start()?;
        let Some(workers) = &self.workers else {
            return Ok(None);
        };
        let mut first_err = None;
        for i in 0..self.heads.len() {
            self.heads[i].clear();
            if !self.eos[i] {
                if let Err(e) = workers.request(i, true).and_then(|_| workers.recv(i)) {
                    first_err.get_or_insert(e);
                }
            }
            self.eos[i] = false;
        }
        self.resetters.reset();
        match first_err {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

impl Puller for Merge {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if done {
            return self.stop();
        }
        self.start()?;
        self.fill()?;
        let Some(i) = self.min_head(None) else {
            self.eos.fill(false);
            self.resetters.reset();
            return Ok(None);
        };
        // Take values from the smallest parent while they do not pass the
        // head of any other parent.
        let limit = self.min_head(Some(i));
        let batch_size = self.rctx.config.batch_size.max(1);
        let mut out = Vec::new();
        while out.len() < batch_size {
            let Some((keys, _)) = self.heads[i].front() else {
                break;
            };
            if let Some(j) = limit {
                if let Some((other, _)) = self.heads[j].front() {
                    let ord = self.cmp.compare_keys(keys, other);
                    if ord.is_gt() || (ord.is_eq() && j < i) {
                        break;
                    }
                }
            }
            if let Some((_, v)) = self.heads[i].pop_front() {
                out.push(v);
            }
        }
        Ok(Some(Batch::new(out)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{Nulls, Which};
    use crate::runtime::expr::{SortEval, This};
    use crate::runtime::testutil::{rctx, run, source, text};
    use crate::runtime::drain_platoon;

    #[test]
    fn combine_drains_all_parents() {
        let rctx = rctx();
        let parents = vec![source(&rctx, "1 2 3"), source(&rctx, "4 5"), source(&rctx, "")];
        let mut op = Combine::new(rctx.clone(), parents);
        let mut out = run(&mut op);
        out.sort();
        assert_eq!(vec!["1", "2", "3", "4", "5"], out);
        assert!(run(&mut op).is_empty());
        drop(op);
        rctx.cancel();
    }

    #[test]
    fn combine_done_reaches_parents() {
        let rctx = rctx();
        let parents = vec![source(&rctx, "1 2 3 4"), source(&rctx, "5 6 7 8")];
        let mut op = Combine::new(rctx.clone(), parents);
        assert!(op.pull(false).unwrap().is_some());
        assert!(op.pull(true).unwrap().is_none());
        assert!(run(&mut op).is_empty());
    }

    #[test]
    fn merge_preserves_order() {
        let rctx = rctx();
        let key = SortEval::new(Box::new(This::new(rctx.ctx.clone(), vec!["x".into()])), Which::Asc, Nulls::Last);
        let parents = vec![
            source(&rctx, "{x:1} {x:4} {x:7}"),
            source(&rctx, "{x:2} {x:3} {x:8}"),
            source(&rctx, "{x:5,p:2}"),
            source(&rctx, "{x:5,p:3} {x:6}"),
        ];
        let mut op = Merge::new(rctx.clone(), parents, Comparator::new(vec![key]), Resetters::default());
        let out = text(&drain_platoon(&mut op).unwrap());
        assert_eq!(
            vec!["{x:1}", "{x:2}", "{x:3}", "{x:4}", "{x:5,p:2}", "{x:5,p:3}", "{x:6}", "{x:7}", "{x:8}"],
            out
        );
    }
}
