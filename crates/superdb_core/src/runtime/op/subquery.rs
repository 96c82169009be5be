//! Subqueries embedded in expressions.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use superdb_error::Result;

use crate::runtime::expr::Evaluator;
use crate::runtime::{Batch, BoxPuller, Puller};
use crate::types::TypeContext;
use crate::value::{Value, new_array};

/// Maximum nesting of one correlated subquery within itself, reached
/// through recursive functions.
pub const MAX_SUBQUERY_RECURSION: usize = 10_000;

#[derive(Default)]
struct FeedState {
    batch: Option<Batch>,
    eos: bool,
}

/// The source of a correlated subquery body. Each evaluation posts one
/// value, which the body sees as a platoon of its own.
#[derive(Clone, Default)]
pub struct Feeder {
    state: Arc<Mutex<FeedState>>,
}

impl Feeder {
    pub fn new() -> Self {
        Self::default()
    }

    fn post(&self, val: Value) {
        let mut st = self.state.lock();
        st.batch = Some(Batch::new(vec![val]));
        st.eos = false;
    }
}

impl Puller for Feeder {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        let mut st = self.state.lock();
        if done {
            st.batch = None;
            st.eos = false;
            return Ok(None);
        }
        if st.eos {
            st.eos = false;
            return Ok(None);
        }
        st.eos = true;
        Ok(st.batch.take())
    }
}

/// A compiled subquery body together with the feeder at its entry.
pub struct SubqueryBody {
    pub feeder: Feeder,
    pub body: BoxPuller,
}

pub type BodyFactory = Arc<dyn Fn() -> Result<SubqueryBody> + Send + Sync>;

/// A correlated subquery: the body runs once per evaluation over the
/// single value `this` and must yield at most one value.
///
/// Idle bodies are pooled. An evaluation that finds the pool empty, as
/// happens when the subquery re-enters itself through a recursive
/// function, compiles a fresh body from the factory.
pub struct Subquery {
    ctx: Arc<TypeContext>,
    factory: BodyFactory,
    idle: Mutex<Vec<SubqueryBody>>,
    active: AtomicUsize,
}

impl Subquery {
    pub fn new(ctx: Arc<TypeContext>, factory: BodyFactory) -> Self {
        Subquery {
            ctx,
            factory,
            idle: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
        }
    }

    fn run(&self, sub: &mut SubqueryBody, this: &Value) -> Result<Value> {
        sub.feeder.post(this.clone());
        let mut first = None;
        let mut count = 0;
        while let Some(batch) = sub.body.pull(false)? {
            if first.is_none() {
                first = batch.values().first().cloned();
            }
            count += batch.len();
        }
        if count > 1 {
            return Ok(self
                .ctx
                .new_error_string("query expression produced multiple values (consider [subquery])"));
        }
        Ok(first.unwrap_or_else(Value::null))
    }
}

impl Evaluator for Subquery {
    fn eval(&self, this: &Value) -> Value {
        let depth = self.active.fetch_add(1, Ordering::SeqCst);
        let result = if depth >= MAX_SUBQUERY_RECURSION {
            self.ctx.wrap_error("subquery recursion depth exceeded", this)
        } else {
            let pooled = self.idle.lock().pop();
            match pooled.map(Ok).unwrap_or_else(|| (self.factory)()) {
                Err(e) => self.ctx.new_error_string(e.get_msg()),
                Ok(mut sub) => match self.run(&mut sub, this) {
                    Ok(v) => {
                        self.idle.lock().push(sub);
                        v
                    }
                    // A failed body is dropped rather than reused.
                    Err(e) => self.ctx.new_error_string(e.get_msg()),
                },
            }
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// An uncorrelated subquery: the body runs once, on first use, and its
/// output is cached as null (no values), the single value, or an array.
pub struct CachedSubquery {
    ctx: Arc<TypeContext>,
    body: Mutex<Option<BoxPuller>>,
    cached: OnceLock<Value>,
}

impl CachedSubquery {
    pub fn new(ctx: Arc<TypeContext>, body: BoxPuller) -> Self {
        CachedSubquery {
            ctx,
            body: Mutex::new(Some(body)),
            cached: OnceLock::new(),
        }
    }

    fn exec(&self) -> Value {
        let Some(mut body) = self.body.lock().take() else {
            return Value::null();
        };
        let mut vals = Vec::new();
        loop {
            match body.pull(false) {
                Err(e) => return self.ctx.new_error_string(e.get_msg()),
                Ok(None) => break,
                Ok(Some(batch)) => vals.extend_from_slice(batch.values()),
            }
        }
        match vals.len() {
            0 => Value::null(),
            1 => vals.remove(0),
            _ => new_array(&self.ctx, &vals).unwrap_or_else(|e| self.ctx.new_error_string(e.get_msg())),
        }
    }
}

impl Evaluator for CachedSubquery {
    fn eval(&self, _this: &Value) -> Value {
        self.cached.get_or_init(|| self.exec()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::expr::This;
    use crate::runtime::op::{Applier, PutEval, Values};
    use crate::runtime::testutil::{rctx, source};

    fn values_body(ctx: &Arc<TypeContext>, paths: &[&[&str]]) -> BodyFactory {
        let ctx = ctx.clone();
        let paths: Vec<Vec<String>> = paths
            .iter()
            .map(|p| p.iter().map(|s| s.to_string()).collect())
            .collect();
        Arc::new(move || {
            let feeder = Feeder::new();
            let exprs = paths
                .iter()
                .map(|p| Box::new(This::new(ctx.clone(), p.clone())) as _)
                .collect();
            let body = Values::new(Box::new(feeder.clone()), exprs, Default::default());
            Ok(SubqueryBody {
                feeder,
                body: Box::new(body),
            })
        })
    }

    #[test]
    fn correlated_runs_per_value() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let sub = Subquery::new(ctx.clone(), values_body(&ctx, &[&["x"]]));
        let v = crate::value::sup::parse_value(&ctx, "{x:7}").unwrap();
        assert_eq!("7", sub.eval(&v).to_string());
        let w = crate::value::sup::parse_value(&ctx, "{x:8}").unwrap();
        assert_eq!("8", sub.eval(&w).to_string());
        assert_eq!(1, sub.idle.lock().len());
    }

    #[test]
    fn correlated_rejects_multiple_values() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let sub = Subquery::new(ctx.clone(), values_body(&ctx, &[&["x"], &["y"]]));
        let v = crate::value::sup::parse_value(&ctx, "{x:1,y:2}").unwrap();
        assert!(sub.eval(&v).is_error());
    }

    #[test]
    fn cached_runs_once() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let sub = Arc::new(CachedSubquery::new(ctx.clone(), source(&rctx, "1 2")));
        let assign = vec![(vec!["s".to_string()], Box::new(sub) as _)];
        let mut op = Applier::new(
            source(&rctx, "{} {}"),
            Box::new(PutEval::new(ctx, assign)),
            Default::default(),
        );
        let out = crate::runtime::drain_platoon(&mut op).unwrap();
        let text: Vec<String> = out.iter().map(|v| v.to_string()).collect();
        assert_eq!(vec!["{s:[1,2]}", "{s:[1,2]}"], text);
    }
}
