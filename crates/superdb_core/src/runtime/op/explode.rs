//! Operators that turn one value into many: explode, unnest and the scope
//! mediator that runs a body over each unnested value.
use std::sync::Arc;

use parking_lot::Mutex;
use superdb_error::Result;
use tracing::trace;

use crate::runtime::expr::BoxEval;
use crate::runtime::{Batch, BoxPuller, Chunk, Puller, batch_of};
use crate::types::{ComplexKind, Field, Type, TypeContext};
use crate::value::{Value, ValueBuilder, new_record};

/// Emits `{alias: v}` for every nested value `v` of the target type found
/// in the argument values. A matching value is not searched further.
pub struct Explode {
    parent: BoxPuller,
    args: Vec<BoxEval>,
    typ: Type,
    out_type: Type,
}

impl Explode {
    pub fn new(ctx: &TypeContext, parent: BoxPuller, args: Vec<BoxEval>, typ: Type, alias: &str) -> Result<Self> {
        let out_type = ctx.lookup_record(vec![Field::new(alias, typ.clone())])?;
        Ok(Explode {
            parent,
            args,
            typ,
            out_type,
        })
    }

    fn walk(&self, val: &Value, out: &mut Vec<Value>) {
        if val.typ() == &self.typ {
            if let Some(body) = val.body() {
                let mut b = ValueBuilder::new();
                b.append(Some(body));
                out.push(Value::new(self.out_type.clone(), Some(b.into_bytes())));
            }
            return;
        }
        match val.typ().kind() {
            Some(ComplexKind::Record(_)) => {
                for (_, field) in val.fields() {
                    self.walk(&field, out);
                }
            }
            Some(ComplexKind::Array(_)) | Some(ComplexKind::Set(_)) | Some(ComplexKind::Map(_, _)) => {
                for elem in val.elements() {
                    self.walk(&elem, out);
                }
            }
            Some(ComplexKind::Union(_)) | Some(ComplexKind::Named(_, _)) => {
                let under = val.under();
                if under.typ() != val.typ() {
                    self.walk(&under, out);
                }
            }
            _ => {}
        }
    }
}

impl Puller for Explode {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        loop {
            let Some(batch) = self.parent.pull(done)? else {
                return Ok(None);
            };
            let mut out = Vec::new();
            for val in batch.values() {
                for arg in &self.args {
                    let v = arg.eval(val);
                    if v.is_error() {
                        if !v.is_missing() {
                            out.push(v);
                        }
                        continue;
                    }
                    self.walk(&v, &mut out);
                }
            }
            if let Some(b) = batch_of(out) {
                return Ok(Some(b));
            }
        }
    }
}

/// Emits the elements of the expression's value for each input value, one
/// batch per input value so that a scope body sees each as its own
/// platoon.
///
/// Arrays and sets yield their elements, maps yield `{key,value}` records,
/// and a two-field record whose second field is an array or set yields one
/// record per element with the first field repeated. Missing values are
/// skipped; anything else becomes an error.
pub struct Unnest {
    ctx: Arc<TypeContext>,
    parent: BoxPuller,
    expr: BoxEval,
    outer: Vec<Value>,
    next: usize,
}

impl Unnest {
    pub fn new(ctx: Arc<TypeContext>, parent: BoxPuller, expr: BoxEval) -> Self {
        Unnest {
            ctx,
            parent,
            expr,
            outer: Vec::new(),
            next: 0,
        }
    }
}

impl Puller for Unnest {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if done {
            self.outer.clear();
            self.next = 0;
            return self.parent.pull(true);
        }
        loop {
            if self.next >= self.outer.len() {
                let Some(batch) = self.parent.pull(false)? else {
                    return Ok(None);
                };
                self.outer = batch.into_values();
                self.next = 0;
            }
            let this = &self.outer[self.next];
            self.next += 1;
            let val = self.expr.eval(this);
            if val.is_missing() {
                continue;
            }
            if let Some(b) = batch_of(unnest_value(&self.ctx, &val)) {
                return Ok(Some(b));
            }
        }
    }
}

pub fn unnest_value(ctx: &TypeContext, val: &Value) -> Vec<Value> {
    let val = val.under();
    match val.typ().kind() {
        Some(ComplexKind::Array(_)) | Some(ComplexKind::Set(_)) => {
            val.elements().iter().map(Value::under).collect()
        }
        Some(ComplexKind::Map(_, _)) => {
            let elems = val.elements();
            let mut out = Vec::with_capacity(elems.len() / 2);
            for pair in elems.chunks(2) {
                if let [k, v] = pair {
                    let entry = vec![("key".to_string(), k.clone()), ("value".to_string(), v.clone())];
                    out.push(new_record(ctx, entry).unwrap_or_else(|e| ctx.new_error_string(e.get_msg())));
                }
            }
            out
        }
        Some(ComplexKind::Record(fields)) => {
            if fields.len() != 2 {
                return vec![ctx.wrap_error("unnest: encountered record without two fields", &val)];
            }
            if fields[1].typ.under().inner().is_none() {
                return vec![ctx.wrap_error(
                    "unnest: encountered record without an array/set type for second field",
                    &val,
                )];
            }
            let pair = val.fields();
            let (left_name, left) = pair[0].clone();
            let right_name = pair[1].0.clone();
            unnest_value(ctx, &pair[1].1)
                .into_iter()
                .map(|right| {
                    let entry = vec![(left_name.clone(), left.clone()), (right_name.clone(), right)];
                    new_record(ctx, entry).unwrap_or_else(|e| ctx.new_error_string(e.get_msg()))
                })
                .collect()
        }
        _ => vec![ctx.wrap_error("unnest: encountered non-array value", &val)],
    }
}

struct ScopeState<T> {
    parent: BoxPuller<T>,
    /// A batch went to the body and its platoon has not ended yet.
    sent: bool,
    /// The parent reached the end of its platoon.
    parent_eos: bool,
}

/// Runs a body over each batch of its parent as a separate platoon.
///
/// The body pulls from [`ScopeEntry`] and the outer consumer pulls from
/// the [`ScopeExit`]. A done from the outer consumer reaches both the body
/// and the parent; a done from inside the body only ends the current
/// platoon and is hidden from the parent.
pub struct Scope<T = Batch> {
    state: Arc<Mutex<ScopeState<T>>>,
}

impl<T: Chunk> Scope<T> {
    pub fn new(parent: BoxPuller<T>) -> Self {
        Scope {
            state: Arc::new(Mutex::new(ScopeState {
                parent,
                sent: false,
                parent_eos: false,
            })),
        }
    }

    /// The source the body reads from.
    pub fn entry(&self) -> ScopeEntry<T> {
        ScopeEntry {
            state: self.state.clone(),
        }
    }

    pub fn exit(self, body: BoxPuller<T>) -> ScopeExit<T> {
        ScopeExit {
            state: self.state,
            body,
            platoon: Vec::new(),
        }
    }
}

pub struct ScopeEntry<T = Batch> {
    state: Arc<Mutex<ScopeState<T>>>,
}

impl<T: Chunk> Puller<T> for ScopeEntry<T> {
    fn pull(&mut self, done: bool) -> Result<Option<T>> {
        let mut st = self.state.lock();
        if done || st.sent {
            st.sent = false;
            return Ok(None);
        }
        match st.parent.pull(false)? {
            Some(batch) => {
                st.sent = true;
                Ok(Some(batch))
            }
            None => {
                st.parent_eos = true;
                Ok(None)
            }
        }
    }
}

pub struct ScopeExit<T = Batch> {
    state: Arc<Mutex<ScopeState<T>>>,
    body: BoxPuller<T>,
    platoon: Vec<T>,
}

impl<T: Chunk> ScopeExit<T> {
    /// Collects the body's output for one parent batch, skipping parent
    /// batches the body filtered away entirely. An empty platoon means the
    /// parent platoon ended.
    fn pull_platoon(&mut self) -> Result<()> {
        loop {
            let batch = match self.body.pull(false) {
                Ok(b) => b,
                Err(e) => {
                    self.platoon.clear();
                    return Err(e);
                }
            };
            match batch {
                Some(b) => self.platoon.push(b),
                None => {
                    if !self.platoon.is_empty() {
                        return Ok(());
                    }
                    let mut st = self.state.lock();
                    if st.parent_eos {
                        st.parent_eos = false;
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl<T: Chunk> Puller<T> for ScopeExit<T> {
    fn pull(&mut self, done: bool) -> Result<Option<T>> {
        if done {
            self.platoon.clear();
            let body = self.body.pull(true);
            let mut st = self.state.lock();
            st.sent = false;
            st.parent_eos = false;
            let parent = st.parent.pull(true);
            trace!("scope stopped");
            body?;
            return parent;
        }
        if self.platoon.is_empty() {
            self.pull_platoon()?;
            if self.platoon.is_empty() {
                return Ok(None);
            }
        }
        Ok(Some(self.platoon.remove(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::expr::This;
    use crate::runtime::op::{Applier, FilterEval, Head};
    use crate::runtime::expr::binary::{CompareConst, CompareOp};
    use crate::runtime::testutil::{rctx, run, source};
    use crate::value::sup::parse_type;

    fn field(ctx: &Arc<TypeContext>, name: &str) -> BoxEval {
        Box::new(This::new(ctx.clone(), vec![name.to_string()]))
    }

    #[test]
    fn explode_finds_nested_values() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let typ = parse_type(&ctx, "ip").unwrap();
        let args = vec![Box::new(This::new(ctx.clone(), Vec::new())) as BoxEval];
        let input = source(&rctx, "{a:10.0.0.1,b:[10.0.0.2],c:\"x\"} {d:1}");
        let mut op = Explode::new(&ctx, input, args, typ, "addr").unwrap();
        assert_eq!(vec!["{addr:10.0.0.1}", "{addr:10.0.0.2}"], run(&mut op));
    }

    #[test]
    fn unnest_elements_in_order() {
        let rctx = rctx();
        let mut op = Unnest::new(rctx.ctx.clone(), source(&rctx, "{v:[1,2,3]} {w:1} {v:|[\"a\"]|}"), field(&rctx.ctx, "v"));
        assert_eq!(vec!["1", "2", "3", "\"a\""], run(&mut op));
    }

    #[test]
    fn unnest_pairs_record_and_rejects_scalars() {
        let rctx = rctx();
        let ctx = &rctx.ctx;
        let pair = crate::value::sup::parse_value(ctx, "{k:1,vs:[2,3]}").unwrap();
        let out: Vec<String> = unnest_value(ctx, &pair).iter().map(|v| v.to_string()).collect();
        assert_eq!(vec!["{k:1,vs:2}", "{k:1,vs:3}"], out);
        let bad = unnest_value(ctx, &Value::from_int64(1));
        assert!(bad[0].is_error());
    }

    #[test]
    fn scope_runs_body_per_value() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let unnest = Unnest::new(ctx.clone(), source(&rctx, "{v:[1,2,3]} {v:[4,5]} {v:[9]}"), field(&ctx, "v"));
        let scope = Scope::new(Box::new(unnest));
        let body = Head::<Batch>::new(Box::new(scope.entry()), 1);
        let mut exit = scope.exit(Box::new(body));
        assert_eq!(vec!["1", "4", "9"], run(&mut exit));
    }

    #[test]
    fn scope_skips_filtered_platoons() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let this: BoxEval = Box::new(This::new(ctx.clone(), Vec::new()));
        let pred = Box::new(CompareConst::new(CompareOp::Gt, this, Value::from_int64(3)));
        let unnest = Unnest::new(ctx.clone(), source(&rctx, "{v:[1,2]} {v:[4,5]}"), field(&ctx, "v"));
        let scope = Scope::new(Box::new(unnest));
        let body = Applier::new(Box::new(scope.entry()), Box::new(FilterEval::new(ctx, pred)), Default::default());
        let mut exit = scope.exit(Box::new(body));
        assert_eq!(vec!["4", "5"], run(&mut exit));
    }
}
