//! Head, tail and skip. Each works per platoon and is generic over the
//! chunk type.
use std::collections::VecDeque;

use superdb_error::Result;

use crate::runtime::{BoxPuller, Chunk, Puller};

/// Forwards the first `limit` values of each platoon.
pub struct Head<T> {
    parent: BoxPuller<T>,
    limit: usize,
    count: usize,
}

impl<T: Chunk> Head<T> {
    pub fn new(parent: BoxPuller<T>, limit: usize) -> Self {
        Head {
            parent,
            limit,
            count: 0,
        }
    }
}

impl<T: Chunk> Puller<T> for Head<T> {
    fn pull(&mut self, done: bool) -> Result<Option<T>> {
        if self.count >= self.limit || done {
            // Stop the rest of the platoon upstream and start over.
            self.count = 0;
            self.parent.pull(true)?;
            return Ok(None);
        }
        let Some(chunk) = self.parent.pull(false)? else {
            self.count = 0;
            return Ok(None);
        };
        let remaining = self.limit - self.count;
        if chunk.len() < remaining {
            self.count += chunk.len();
            return Ok(Some(chunk));
        }
        self.count = self.limit;
        Ok(Some(chunk.slice(0, remaining)))
    }
}

/// Emits the last `limit` values of each platoon.
pub struct Tail<T> {
    parent: BoxPuller<T>,
    limit: usize,
    chunks: VecDeque<T>,
    buffered: usize,
    eos: bool,
}

impl<T: Chunk> Tail<T> {
    pub fn new(parent: BoxPuller<T>, limit: usize) -> Self {
        Tail {
            parent,
            limit,
            chunks: VecDeque::new(),
            buffered: 0,
            eos: false,
        }
    }

    fn push(&mut self, chunk: T) {
        self.buffered += chunk.len();
        self.chunks.push_back(chunk);
        while let Some(front) = self.chunks.front() {
            if self.buffered - front.len() < self.limit {
                break;
            }
            self.buffered -= front.len();
            self.chunks.pop_front();
        }
    }

    fn reset(&mut self) {
        self.chunks.clear();
        self.buffered = 0;
    }
}

impl<T: Chunk> Puller<T> for Tail<T> {
    fn pull(&mut self, done: bool) -> Result<Option<T>> {
        if done {
            self.reset();
            self.eos = false;
            return self.parent.pull(true);
        }
        if self.eos {
            self.eos = false;
            return Ok(None);
        }
        while let Some(chunk) = self.parent.pull(false)? {
            if self.limit > 0 {
                self.push(chunk);
            }
        }
        let chunks: Vec<T> = self.chunks.drain(..).collect();
        self.buffered = 0;
        let Some(all) = T::concat(chunks) else {
            return Ok(None);
        };
        let from = all.len().saturating_sub(self.limit);
        self.eos = true;
        Ok(Some(all.slice(from, all.len())))
    }
}

/// Drops the first `count` values of each platoon.
pub struct Skip<T> {
    parent: BoxPuller<T>,
    count: usize,
    skipped: usize,
}

impl<T: Chunk> Skip<T> {
    pub fn new(parent: BoxPuller<T>, count: usize) -> Self {
        Skip {
            parent,
            count,
            skipped: 0,
        }
    }
}

impl<T: Chunk> Puller<T> for Skip<T> {
    fn pull(&mut self, done: bool) -> Result<Option<T>> {
        loop {
            let Some(chunk) = self.parent.pull(done)? else {
                self.skipped = 0;
                return Ok(None);
            };
            let remaining = self.count - self.skipped;
            if remaining == 0 {
                return Ok(Some(chunk));
            }
            if chunk.len() <= remaining {
                self.skipped += chunk.len();
                continue;
            }
            self.skipped = self.count;
            return Ok(Some(chunk.slice(remaining, chunk.len())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testutil::{rctx, run, source};

    #[test]
    fn head_restarts_per_platoon() {
        let rctx = rctx();
        let mut op = Head::new(source(&rctx, "1 2 3 4 5"), 3);
        assert_eq!(vec!["1", "2", "3"], run(&mut op));
        // The source was told to stop, so the next platoon is empty.
        assert!(run(&mut op).is_empty());
        let mut zero = Head::new(source(&rctx, "1 2"), 0);
        assert!(run(&mut zero).is_empty());
    }

    #[test]
    fn tail_keeps_last_values() {
        let rctx = rctx();
        let mut op = Tail::new(source(&rctx, "1 2 3 4 5"), 2);
        assert_eq!(vec!["4", "5"], run(&mut op));
        assert!(op.pull(false).unwrap().is_none());
        let mut op = Tail::new(source(&rctx, "1 2 3"), 10);
        assert_eq!(vec!["1", "2", "3"], run(&mut op));
    }

    #[test]
    fn skip_drops_prefix() {
        let rctx = rctx();
        let mut op = Skip::new(source(&rctx, "1 2 3 4 5"), 3);
        assert_eq!(vec!["4", "5"], run(&mut op));
    }

    #[test]
    fn done_resets_head() {
        let rctx = rctx();
        let mut op = Head::new(source(&rctx, "1 2 3 4 5"), 4);
        assert_eq!(2, op.pull(false).unwrap().unwrap().len());
        assert!(op.pull(true).unwrap().is_none());
        assert_eq!(0, op.count);
    }
}
