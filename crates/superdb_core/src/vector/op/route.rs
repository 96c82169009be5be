//! Switch routers, distinct and unnest over vectors.
use std::sync::Arc;

use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use superdb_error::Result;

use crate::runtime::op::{Router, unnest_value};
use crate::runtime::{BoxPuller, Puller};
use crate::types::{ComplexKind, TypeContext};
use crate::value::Value;
use crate::vector::Vector;
use crate::vector::expr::BoxVecEval;

fn parts(vec: &Vector, index: Vec<Vec<u32>>) -> Vec<Option<Vector>> {
    index
        .into_iter()
        .map(|idx| (!idx.is_empty()).then(|| vec.pick(idx)))
        .collect()
}

/// Sends each slot to the first case whose predicate is true.
pub struct VecCaseRouter {
    cases: Vec<BoxVecEval>,
}

impl VecCaseRouter {
    pub fn new(cases: Vec<BoxVecEval>) -> Self {
        VecCaseRouter { cases }
    }
}

impl Router<Vector> for VecCaseRouter {
    fn route(&mut self, chunk: &Vector) -> Vec<Option<Vector>> {
        let preds: Vec<Vector> = self.cases.iter().map(|c| c.eval(chunk)).collect();
        let mut index = vec![Vec::new(); self.cases.len()];
        for i in 0..chunk.len() {
            if let Some(k) = preds.iter().position(|p| p.value_at(i).is_true()) {
                index[k].push(i as u32);
            }
        }
        parts(chunk, index)
    }
}

/// Sends each slot to the case whose constant has the same body as the
/// switch expression, or to the default case.
pub struct VecExprSwitch {
    expr: BoxVecEval,
    cases: HashMap<Option<Bytes>, usize>,
    default: Option<usize>,
    n: usize,
}

impl VecExprSwitch {
    pub fn new(expr: BoxVecEval, cases: Vec<Option<Value>>) -> Self {
        let n = cases.len();
        let mut map = HashMap::new();
        let mut default = None;
        for (i, c) in cases.into_iter().enumerate() {
            match c {
                Some(v) => {
                    map.entry(v.body().cloned()).or_insert(i);
                }
                None => default = default.or(Some(i)),
            }
        }
        VecExprSwitch {
            expr,
            cases: map,
            default,
            n,
        }
    }
}

impl Router<Vector> for VecExprSwitch {
    fn route(&mut self, chunk: &Vector) -> Vec<Option<Vector>> {
        let keys = self.expr.eval(chunk);
        let mut index = vec![Vec::new(); self.n];
        for i in 0..chunk.len() {
            if keys.typ_at(i).under().is_error() && keys.value_at(i).is_missing() {
                continue;
            }
            let body = keys.body_at(i);
            if let Some(k) = self.cases.get(&body).copied().or(self.default) {
                index[k].push(i as u32);
            }
        }
        parts(chunk, index)
    }
}

/// Keeps the first slot seen for each distinct key within a platoon.
pub struct VecDistinct {
    parent: BoxPuller<Vector>,
    expr: BoxVecEval,
    seen: HashSet<Value>,
}

impl VecDistinct {
    pub fn new(parent: BoxPuller<Vector>, expr: BoxVecEval) -> Self {
        VecDistinct {
            parent,
            expr,
            seen: HashSet::new(),
        }
    }
}

impl Puller<Vector> for VecDistinct {
    fn pull(&mut self, done: bool) -> Result<Option<Vector>> {
        loop {
            let Some(vec) = self.parent.pull(done)? else {
                self.seen.clear();
                return Ok(None);
            };
            let keys = self.expr.eval(&vec);
            let keep: Vec<u32> = (0..vec.len())
                .filter(|i| self.seen.insert(keys.value_at(*i)))
                .map(|i| i as u32)
                .collect();
            if keep.len() == vec.len() {
                return Ok(Some(vec));
            }
            if !keep.is_empty() {
                return Ok(Some(vec.pick(keep)));
            }
        }
    }
}

/// Emits one vector per input slot holding the unnested elements.
pub struct VecUnnest {
    ctx: Arc<TypeContext>,
    parent: BoxPuller<Vector>,
    expr: BoxVecEval,
    current: Option<Vector>,
    next: usize,
}

impl VecUnnest {
    pub fn new(ctx: Arc<TypeContext>, parent: BoxPuller<Vector>, expr: BoxVecEval) -> Self {
        VecUnnest {
            ctx,
            parent,
            expr,
            current: None,
            next: 0,
        }
    }

    /// The elements of slot `i` of an array or set column, taken without
    /// materializing the slot.
    fn elements(vec: &Vector, i: usize) -> Option<Vector> {
        let Vector::Array(arr) = vec else {
            return None;
        };
        if arr.nulls.is_null(i) {
            return None;
        }
        let elem = arr.typ.under().inner()?;
        if matches!(elem.kind(), Some(ComplexKind::Union(_)) | Some(ComplexKind::Named(..))) {
            return None;
        }
        let (from, to) = (arr.offsets[i], arr.offsets[i + 1]);
        Some(arr.values.pick((from..to).collect()))
    }
}

impl Puller<Vector> for VecUnnest {
    fn pull(&mut self, done: bool) -> Result<Option<Vector>> {
        if done {
            self.current = None;
            self.next = 0;
            return self.parent.pull(true);
        }
        loop {
            let Some(cur) = self.current.as_ref() else {
                let Some(vec) = self.parent.pull(false)? else {
                    return Ok(None);
                };
                self.current = Some(self.expr.eval(&vec));
                self.next = 0;
                continue;
            };
            if self.next >= cur.len() {
                self.current = None;
                continue;
            }
            let i = self.next;
            self.next += 1;
            if let Some(elems) = Self::elements(cur, i) {
                if !elems.is_empty() {
                    return Ok(Some(elems));
                }
                continue;
            }
            let val = cur.value_at(i);
            if val.is_missing() {
                continue;
            }
            let out = unnest_value(&self.ctx, &val);
            if !out.is_empty() {
                return Ok(Some(Vector::from_values(&out)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::op::Switch;
    use crate::runtime::expr::binary::CompareOp;
    use crate::runtime::testutil::rctx;
    use crate::vector::expr::{VecCompare, VecLiteral, VecThis};
    use crate::vector::testutil::{vrun, vsource};

    fn this(ctx: &Arc<TypeContext>, name: &str) -> BoxVecEval {
        Box::new(VecThis::new(ctx.clone(), vec![name.to_string()]))
    }

    #[test]
    fn case_router_takes_first_match() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let lt = |n| -> BoxVecEval {
            Box::new(VecCompare::new(CompareOp::Lt, this(&ctx, "x"), Box::new(VecLiteral(Value::from_int64(n)))))
        };
        let router = VecCaseRouter::new(vec![lt(2), lt(4)]);
        let mut exits = Switch::exits(vsource(&rctx, "{x:1} {x:2} {x:3} {x:4}"), Box::new(router), 2);
        let b = exits.pop().unwrap();
        let a = exits.pop().unwrap();
        assert_eq!(vec!["{x:2}", "{x:3}"], vrun(Box::new(b)));
        assert_eq!(vec!["{x:1}"], vrun(Box::new(a)));
    }

    #[test]
    fn expr_switch_routes_by_value() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let router = VecExprSwitch::new(this(&ctx, "k"), vec![Some(Value::from_str("a")), None]);
        let src = vsource(&rctx, r#"{k:"a"} {k:"b"} {k:"a"} {j:1}"#);
        let mut exits = Switch::exits(src, Box::new(router), 2);
        let other = exits.pop().unwrap();
        let a = exits.pop().unwrap();
        assert_eq!(vec![r#"{k:"a"}"#, r#"{k:"a"}"#], vrun(Box::new(a)));
        assert_eq!(vec![r#"{k:"b"}"#], vrun(Box::new(other)));
    }

    #[test]
    fn distinct_keeps_first_per_key() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let op = VecDistinct::new(vsource(&rctx, "{k:1,v:1} {k:2,v:2} {k:1,v:3} {k:3,v:4}"), this(&ctx, "k"));
        assert_eq!(vec!["{k:1,v:1}", "{k:2,v:2}", "{k:3,v:4}"], vrun(Box::new(op)));
    }

    #[test]
    fn unnest_columns_and_fallback() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let op = VecUnnest::new(ctx.clone(), vsource(&rctx, "{a:[1,2]} {a:[3]} {b:1} {a:[]}"), this(&ctx, "a"));
        assert_eq!(vec!["1", "2", "3"], vrun(Box::new(op)));

        let op = VecUnnest::new(ctx.clone(), vsource(&rctx, "{a:|{\"x\":1}|} {a:5}"), this(&ctx, "a"));
        let out = vrun(Box::new(op));
        assert_eq!(r#"{key:"x",value:1}"#, out[0]);
        assert!(out[1].starts_with("error("));
    }
}
