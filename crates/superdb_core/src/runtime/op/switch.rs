//! Routing of values to switch cases.
use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use superdb_error::{DbError, Result};

use crate::runtime::expr::BoxEval;
use crate::runtime::{Batch, BoxPuller, Chunk, HASH_STATE, HashMap, Puller, batch_of};
use crate::value::Value;

/// Splits a chunk into one optional chunk per case.
pub trait Router<T>: Send {
    fn route(&mut self, chunk: &T) -> Vec<Option<T>>;
}

struct SwitchState<T> {
    parent: BoxPuller<T>,
    router: Box<dyn Router<T>>,
    queues: Vec<VecDeque<Result<Option<T>>>>,
    stopped: Vec<bool>,
}

/// One case exit of a switch. An exit with nothing queued pulls the parent
/// and routes the chunk to every case; the end of a platoon reaches all
/// cases.
pub struct Switch<T> {
    state: Arc<Mutex<SwitchState<T>>>,
    index: usize,
}

impl<T: Chunk> Switch<T> {
    pub fn exits(parent: BoxPuller<T>, router: Box<dyn Router<T>>, n: usize) -> Vec<Switch<T>> {
        let state = Arc::new(Mutex::new(SwitchState {
            parent,
            router,
            queues: (0..n).map(|_| VecDeque::new()).collect(),
            stopped: vec![false; n],
        }));
        (0..n)
            .map(|index| Switch {
                state: state.clone(),
                index,
            })
            .collect()
    }
}

impl<T: Chunk> Puller<T> for Switch<T> {
    fn pull(&mut self, done: bool) -> Result<Option<T>> {
        let mut st = self.state.lock();
        let me = self.index;
        if done {
            while let Some(item) = st.queues[me].pop_front() {
                if matches!(item, Ok(None)) {
                    return Ok(None);
                }
            }
            st.stopped[me] = true;
            if st.stopped.iter().all(|s| *s) {
                st.stopped.fill(false);
                return st.parent.pull(true);
            }
            return Ok(None);
        }
        loop {
            if let Some(item) = st.queues[me].pop_front() {
                return item;
            }
            let chunk = match st.parent.pull(false) {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    for j in 0..st.queues.len() {
                        if st.stopped[j] {
                            st.stopped[j] = false;
                        } else if j != me {
                            st.queues[j].push_back(Ok(None));
                        }
                    }
                    return Ok(None);
                }
                Err(e) => {
                    for j in (0..st.queues.len()).filter(|&j| j != me) {
                        let copy = DbError::new_kind(e.kind(), e.get_msg());
                        st.queues[j].push_back(Err(copy));
                    }
                    return Err(e);
                }
            };
            let routed = st.router.route(&chunk);
            for (j, part) in routed.into_iter().enumerate() {
                if let Some(part) = part {
                    if !st.stopped[j] {
                        st.queues[j].push_back(Ok(Some(part)));
                    }
                }
            }
        }
    }
}

/// Sends each value to the first case whose predicate is true. Unmatched
/// values are dropped.
pub struct CaseRouter {
    cases: Vec<BoxEval>,
}

impl CaseRouter {
    pub fn new(cases: Vec<BoxEval>) -> Self {
        CaseRouter { cases }
    }
}

impl Router<Batch> for CaseRouter {
    fn route(&mut self, chunk: &Batch) -> Vec<Option<Batch>> {
        let mut parts: Vec<Vec<Value>> = vec![Vec::new(); self.cases.len()];
        for val in chunk.values() {
            if let Some(i) = self.cases.iter().position(|c| c.eval(val).is_true()) {
                parts[i].push(val.clone());
            }
        }
        parts.into_iter().map(batch_of).collect()
    }
}

/// Sends each value to the case whose constant has the same body as the
/// switch expression, or to the default case.
pub struct ExprSwitch {
    expr: BoxEval,
    cases: HashMap<Option<Bytes>, usize>,
    default: Option<usize>,
    n: usize,
}

impl ExprSwitch {
    /// `cases[i]` is the constant of case `i`, None for the default case.
    pub fn new(expr: BoxEval, cases: Vec<Option<Value>>) -> Self {
        let n = cases.len();
        let mut map = HashMap::with_hasher(HASH_STATE);
        let mut default = None;
        for (i, c) in cases.into_iter().enumerate() {
            match c {
                Some(v) => {
                    map.entry(v.body().cloned()).or_insert(i);
                }
                None => default = default.or(Some(i)),
            }
        }
        ExprSwitch {
            expr,
            cases: map,
            default,
            n,
        }
    }
}

impl Router<Batch> for ExprSwitch {
    fn route(&mut self, chunk: &Batch) -> Vec<Option<Batch>> {
        let mut parts: Vec<Vec<Value>> = vec![Vec::new(); self.n];
        for val in chunk.values() {
            let key = self.expr.eval(val);
            if key.is_missing() {
                continue;
            }
            let route = self.cases.get(&key.body().cloned()).copied().or(self.default);
            if let Some(i) = route {
                parts[i].push(val.clone());
            }
        }
        parts.into_iter().map(batch_of).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::expr::This;
    use crate::runtime::expr::binary::{CompareConst, CompareOp};
    use crate::runtime::testutil::{rctx, run, source};

    #[test]
    fn boolean_cases_take_first_match() {
        let rctx = rctx();
        let x = |op, n| -> BoxEval {
            Box::new(CompareConst::new(
                op,
                Box::new(This::new(rctx.ctx.clone(), vec!["x".into()])),
                Value::from_int64(n),
            ))
        };
        let router = CaseRouter::new(vec![x(CompareOp::Lt, 2), x(CompareOp::Lt, 4)]);
        let mut exits = Switch::exits(source(&rctx, "{x:1} {x:2} {x:3} {x:4}"), Box::new(router), 2);
        let mut b = exits.pop().unwrap();
        let mut a = exits.pop().unwrap();
        assert_eq!(vec!["{x:2}", "{x:3}"], run(&mut b));
        assert_eq!(vec!["{x:1}"], run(&mut a));
    }

    #[test]
    fn expr_switch_with_default() {
        let rctx = rctx();
        let expr = Box::new(This::new(rctx.ctx.clone(), vec!["k".into()]));
        let router = ExprSwitch::new(expr, vec![Some(Value::from_str("a")), None]);
        let mut exits = Switch::exits(source(&rctx, r#"{k:"a"} {k:"b"} {k:"a",n:1} {j:1}"#), Box::new(router), 2);
        let mut other = exits.pop().unwrap();
        let mut a = exits.pop().unwrap();
        assert_eq!(vec![r#"{k:"a"}"#, r#"{k:"a",n:1}"#], run(&mut a));
        assert_eq!(vec![r#"{k:"b"}"#], run(&mut other));
    }
}
