//! Fan-out: fork and mirror exits over one parent, and a parent shared by
//! scatter branches.
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use superdb_error::{DbError, Result};

use crate::runtime::{BoxPuller, Chunk, Puller};

/// An item queued for an exit. `Ok(None)` marks the end of a platoon.
type Item<T> = Result<Option<T>>;

fn replicate(e: &DbError) -> DbError {
    DbError::new_kind(e.kind(), e.get_msg())
}

struct ForkState<T> {
    parent: BoxPuller<T>,
    queues: Vec<VecDeque<Item<T>>>,
    /// Exits that asked to stop the current platoon.
    stopped: Vec<bool>,
}

impl<T: Chunk> ForkState<T> {
    /// Pulls the parent once and queues the result for every other exit
    /// still in the platoon.
    fn advance(&mut self, me: usize) -> Item<T> {
        let r = self.parent.pull(false);
        let n = self.queues.len();
        for j in (0..n).filter(|&j| j != me) {
            if self.stopped[j] {
                if matches!(r, Ok(None)) {
                    self.stopped[j] = false;
                }
                continue;
            }
            let item = match &r {
                Ok(c) => Ok(c.clone()),
                Err(e) => Err(replicate(e)),
            };
            self.queues[j].push_back(item);
        }
        r
    }
}

/// One exit of a fork. Every exit sees every chunk of the parent. The exit
/// that finds its queue empty pulls the parent on behalf of all of them.
pub struct Fork<T> {
    state: Arc<Mutex<ForkState<T>>>,
    index: usize,
}

impl<T: Chunk> Fork<T> {
    /// Creates `n` exits over `parent`.
    pub fn exits(parent: BoxPuller<T>, n: usize) -> Vec<Fork<T>> {
        let state = Arc::new(Mutex::new(ForkState {
            parent,
            queues: (0..n).map(|_| VecDeque::new()).collect(),
            stopped: vec![false; n],
        }));
        (0..n)
            .map(|index| Fork {
                state: state.clone(),
                index,
            })
            .collect()
    }
}

impl<T: Chunk> Puller<T> for Fork<T> {
    fn pull(&mut self, done: bool) -> Result<Option<T>> {
        let mut st = self.state.lock();
        let me = self.index;
        if done {
            // Discard what is queued for this platoon. If the platoon already
            // ended upstream there is nothing to stop.
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
        if let Some(item) = st.queues[me].pop_front() {
            return item;
        }
        st.advance(me)
    }
}

/// A parent shared by scatter branches. Each branch pulls from the same
/// source, so every chunk goes to exactly one branch. Stopping takes effect
/// once every branch has asked for it.
pub struct Shared<T> {
    state: Arc<Mutex<SharedState<T>>>,
}

struct SharedState<T> {
    parent: BoxPuller<T>,
    branches: usize,
    stopped: usize,
}

impl<T: Chunk> Shared<T> {
    pub fn branches(parent: BoxPuller<T>, n: usize) -> Vec<Shared<T>> {
        let state = Arc::new(Mutex::new(SharedState {
            parent,
            branches: n,
            stopped: 0,
        }));
        (0..n).map(|_| Shared { state: state.clone() }).collect()
    }
}

impl<T: Chunk> Puller<T> for Shared<T> {
    fn pull(&mut self, done: bool) -> Result<Option<T>> {
        let mut st = self.state.lock();
        if done {
            st.stopped += 1;
            if st.stopped >= st.branches {
                st.stopped = 0;
                return st.parent.pull(true);
            }
            return Ok(None);
        }
        st.parent.pull(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testutil::{rctx, run, source};

    #[test]
    fn every_exit_sees_everything() {
        let rctx = rctx();
        let mut exits = Fork::exits(source(&rctx, "1 2 3"), 2);
        let mut b = exits.pop().unwrap();
        let mut a = exits.pop().unwrap();
        assert_eq!(vec!["1", "2", "3"], run(&mut a));
        assert_eq!(vec!["1", "2", "3"], run(&mut b));
    }

    #[test]
    fn stopped_exit_skips_rest_of_platoon() {
        let rctx = rctx();
        let mut exits = Fork::exits(source(&rctx, "1 2 3 4 5"), 2);
        let mut b = exits.pop().unwrap();
        let mut a = exits.pop().unwrap();
        assert_eq!(2, a.pull(false).unwrap().unwrap().len());
        assert!(a.pull(true).unwrap().is_none());
        assert_eq!(vec!["1", "2", "3", "4", "5"], run(&mut b));
        // The platoon ended, so the stopped exit starts fresh.
        assert!(run(&mut a).is_empty());
    }

    #[test]
    fn scatter_branches_split_input() {
        let rctx = rctx();
        let mut branches = Shared::branches(source(&rctx, "1 2 3 4 5"), 2);
        let mut b = branches.pop().unwrap();
        let mut a = branches.pop().unwrap();
        let first = a.pull(false).unwrap().unwrap();
        let mut rest = run(&mut b);
        rest.extend(run(&mut a));
        assert_eq!(2, first.len());
        assert_eq!(vec!["3", "4", "5"], rest);
    }
}
