//! Pull-based execution of compiled plans.
//!
//! Every operator is a [`Puller`]. `pull(false)` returns the next batch, or
//! `None` at the end of a platoon; a later `pull(false)` may start the next
//! platoon. `pull(true)` asks the operator to stop early: it drains its
//! parents with `pull(true)` and returns `None` (or the first error), after
//! which it may be reused. An operator never returns a batch and an error
//! together.
pub mod batch;
pub mod catcher;
pub mod context;
pub mod expr;
pub mod op;
pub mod scan;

use std::collections::VecDeque;

use ahash::RandomState;
use superdb_error::Result;

pub use batch::{Batch, batch_of};
pub use catcher::Catcher;
pub use context::{CancelToken, Meter, Progress, RuntimeContext, SpillFile, WaitGroup};

use crate::config::session::DEFAULT_BATCH_SIZE;
use crate::value::Value;

/// A pull-driven stream of chunks. Scalar operators move [`Batch`]es; the
/// vector runtime moves [`crate::vector::Vector`]s through the same trait.
pub trait Puller<T = Batch>: Send {
    fn pull(&mut self, done: bool) -> Result<Option<T>>;
}

pub type BoxPuller<T = Batch> = Box<dyn Puller<T>>;

/// Seeded hash state for operator hash tables.
pub(crate) const HASH_STATE: RandomState = RandomState::with_seeds(0, 0, 0, 0);

pub(crate) type HashMap<K, V> = hashbrown::HashMap<K, V, RandomState>;
pub(crate) type HashSet<K> = hashbrown::HashSet<K, RandomState>;

impl<T, P: Puller<T> + ?Sized> Puller<T> for Box<P> {
    fn pull(&mut self, done: bool) -> Result<Option<T>> {
        self.as_mut().pull(done)
    }
}

/// The unit moved between operators. The generic fan-in, fan-out and limit
/// operators only need to count, slice and concatenate chunks.
pub trait Chunk: Clone + Send + 'static {
    fn len(&self) -> usize;

    /// Slots `from..to` of the chunk.
    fn slice(&self, from: usize, to: usize) -> Self;

    /// Joins chunks end to end. Returns None for an empty list.
    fn concat(chunks: Vec<Self>) -> Option<Self>;
}

impl Chunk for Batch {
    fn len(&self) -> usize {
        Batch::len(self)
    }

    fn slice(&self, from: usize, to: usize) -> Self {
        let b = Batch::new(self.values()[from..to].to_vec());
        match self.label() {
            Some(label) => b.with_label(label),
            None => b,
        }
    }

    fn concat(chunks: Vec<Self>) -> Option<Self> {
        if chunks.len() == 1 {
            return chunks.into_iter().next();
        }
        batch_of(chunks.iter().flat_map(|b| b.values().iter().cloned()).collect())
    }
}

/// Pulls batches until the end of the current platoon.
pub fn drain_platoon(p: &mut dyn Puller) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    while let Some(batch) = p.pull(false)? {
        out.extend_from_slice(batch.values());
    }
    Ok(out)
}

/// A source over values held in memory, emitting one platoon.
pub struct ArrayPuller {
    vals: VecDeque<Value>,
    batch_size: usize,
}

impl ArrayPuller {
    pub fn new(vals: Vec<Value>) -> Self {
        Self::with_batch_size(vals, DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(vals: Vec<Value>, batch_size: usize) -> Self {
        ArrayPuller {
            vals: vals.into(),
            batch_size: batch_size.max(1),
        }
    }
}

impl Puller for ArrayPuller {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if done {
            self.vals.clear();
            return Ok(None);
        }
        let n = self.batch_size.min(self.vals.len());
        Ok(batch_of(self.vals.drain(..n).collect()))
    }
}

/// A source that is immediately at the end of its stream.
pub struct NullPuller;

impl Puller for NullPuller {
    fn pull(&mut self, _done: bool) -> Result<Option<Batch>> {
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use super::*;
    use crate::config::session::SessionConfig;
    use crate::types::TypeContext;
    use crate::value::sup::parse_values;

    pub fn rctx() -> Arc<RuntimeContext> {
        RuntimeContext::new(Arc::new(TypeContext::new()), SessionConfig::default())
    }

    pub fn source(rctx: &RuntimeContext, sup: &str) -> BoxPuller {
        Box::new(ArrayPuller::with_batch_size(parse_values(&rctx.ctx, sup).unwrap(), 2))
    }

    pub fn text(vals: &[Value]) -> Vec<String> {
        vals.iter().map(|v| v.to_string()).collect()
    }

    pub fn run(p: &mut dyn Puller) -> Vec<String> {
        text(&drain_platoon(p).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_puller_batches() {
        let vals = (0..5).map(Value::from_int64).collect();
        let mut p = ArrayPuller::with_batch_size(vals, 2);
        assert_eq!(2, p.pull(false).unwrap().unwrap().len());
        assert_eq!(2, p.pull(false).unwrap().unwrap().len());
        assert_eq!(1, p.pull(false).unwrap().unwrap().len());
        assert!(p.pull(false).unwrap().is_none());
    }

    #[test]
    fn done_ends_stream() {
        let mut p = ArrayPuller::new((0..5).map(Value::from_int64).collect());
        assert!(p.pull(true).unwrap().is_none());
        assert!(p.pull(false).unwrap().is_none());
    }
}
