//! Two-input joins. The right input is materialized and the left input
//! streams against it. A right join swaps the inputs and then swaps the
//! output fields back.
use std::str::FromStr;
use std::sync::Arc;

use superdb_error::{DbError, Result};
use tracing::debug;

use crate::runtime::expr::BoxEval;
use crate::runtime::{Batch, BoxPuller, HASH_STATE, HashMap, Puller, batch_of, drain_platoon};
use crate::types::TypeContext;
use crate::value::{Value, new_record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStyle {
    Inner,
    Left,
    Right,
    Anti,
    Cross,
}

impl FromStr for JoinStyle {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "inner" | "" => JoinStyle::Inner,
            "left" => JoinStyle::Left,
            "right" => JoinStyle::Right,
            "anti" => JoinStyle::Anti,
            "cross" => JoinStyle::Cross,
            other => return Err(DbError::new(format!("unknown join style: {other}"))),
        })
    }
}

/// Builds the joined records.
struct Wrapper {
    ctx: Arc<TypeContext>,
    style: JoinStyle,
    left_alias: String,
    right_alias: String,
}

impl Wrapper {
    /// Joins `outer` (a value of the streamed side) with `inner` (a value of
    /// the materialized side). Either may be absent; an absent side is left
    /// out of the record.
    fn wrap(&self, outer: Option<&Value>, inner: Option<&Value>) -> Value {
        let (l, r) = if self.style == JoinStyle::Right {
            (inner, outer)
        } else {
            (outer, inner)
        };
        let mut fields = Vec::with_capacity(2);
        if let Some(l) = l {
            fields.push((self.left_alias.clone(), l.under()));
        }
        if let Some(r) = r {
            fields.push((self.right_alias.clone(), r.under()));
        }
        new_record(&self.ctx, fields).unwrap_or_else(|e| self.ctx.new_error_string(e.get_msg()))
    }

    /// Whether unmatched values of the streamed side are emitted alone.
    fn keeps_unmatched(&self) -> bool {
        matches!(self.style, JoinStyle::Left | JoinStyle::Right | JoinStyle::Anti)
    }
}

/// Equi-join over key expressions.
pub struct HashJoin {
    wrapper: Wrapper,
    left: BoxPuller,
    right: BoxPuller,
    left_key: BoxEval,
    right_key: BoxEval,
    table: Option<HashMap<Value, Vec<Value>>>,
}

impl HashJoin {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<TypeContext>,
        style: JoinStyle,
        left: BoxPuller,
        right: BoxPuller,
        left_key: BoxEval,
        right_key: BoxEval,
        left_alias: impl Into<String>,
        right_alias: impl Into<String>,
    ) -> Self {
        let (left, right, left_key, right_key) = if style == JoinStyle::Right {
            (right, left, right_key, left_key)
        } else {
            (left, right, left_key, right_key)
        };
        HashJoin {
            wrapper: Wrapper {
                ctx,
                style,
                left_alias: left_alias.into(),
                right_alias: right_alias.into(),
            },
            left,
            right,
            left_key,
            right_key,
            table: None,
        }
    }

    fn build(&mut self) -> Result<()> {
        let mut table: HashMap<Value, Vec<Value>> = HashMap::with_hasher(HASH_STATE);
        for val in drain_platoon(&mut self.right)? {
            let key = self.right_key.eval(&val);
            if key.is_missing() {
                continue;
            }
            table.entry(key).or_default().push(val);
        }
        debug!(keys = table.len(), "hash join table built");
        self.table = Some(table);
        Ok(())
    }
}

impl Puller for HashJoin {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if done {
            let built = self.table.take().is_some();
            let left = self.left.pull(true);
            if !built {
                self.right.pull(true)?;
            }
            return left;
        }
        if self.table.is_none() {
            self.build()?;
        }
        loop {
            let Some(batch) = self.left.pull(false)? else {
                self.table = None;
                return Ok(None);
            };
            let Some(table) = &self.table else {
                return Ok(None);
            };
            let mut out = Vec::new();
            for val in batch.values() {
                let key = self.left_key.eval(val);
                if key.is_missing() {
                    continue;
                }
                match table.get(&key) {
                    None => {
                        if self.wrapper.keeps_unmatched() {
                            out.push(self.wrapper.wrap(Some(val), None));
                        }
                    }
                    Some(_) if self.wrapper.style == JoinStyle::Anti => {}
                    Some(matches) => {
                        for m in matches {
                            out.push(self.wrapper.wrap(Some(val), Some(m)));
                        }
                    }
                }
            }
            if let Some(b) = batch_of(out) {
                return Ok(Some(b));
            }
        }
    }
}

/// Join on an arbitrary condition evaluated over the joined record. The
/// `cross` style pairs everything.
pub struct NestedLoopJoin {
    wrapper: Wrapper,
    left: BoxPuller,
    right: BoxPuller,
    cond: Option<BoxEval>,
    inner: Option<Vec<Value>>,
}

impl NestedLoopJoin {
    pub fn new(
        ctx: Arc<TypeContext>,
        style: JoinStyle,
        left: BoxPuller,
        right: BoxPuller,
        cond: Option<BoxEval>,
        left_alias: impl Into<String>,
        right_alias: impl Into<String>,
    ) -> Self {
        let (left, right) = if style == JoinStyle::Right {
            (right, left)
        } else {
            (left, right)
        };
        NestedLoopJoin {
            wrapper: Wrapper {
                ctx,
                style,
                left_alias: left_alias.into(),
                right_alias: right_alias.into(),
            },
            left,
            right,
            cond,
            inner: None,
        }
    }
}

impl Puller for NestedLoopJoin {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if done {
            let built = self.inner.take().is_some();
            let left = self.left.pull(true);
            if !built {
                self.right.pull(true)?;
            }
            return left;
        }
        if self.inner.is_none() {
            self.inner = Some(drain_platoon(&mut self.right)?);
        }
        loop {
            let Some(batch) = self.left.pull(false)? else {
                self.inner = None;
                return Ok(None);
            };
            let Some(inner) = &self.inner else {
                return Ok(None);
            };
            let mut out = Vec::new();
            for val in batch.values() {
                let mut hit = false;
                for other in inner {
                    let joined = self.wrapper.wrap(Some(val), Some(other));
                    let matched = match (&self.cond, self.wrapper.style) {
                        (_, JoinStyle::Cross) | (None, _) => true,
                        (Some(cond), _) => cond.eval(&joined).is_true(),
                    };
                    if !matched {
                        continue;
                    }
                    hit = true;
                    if self.wrapper.style != JoinStyle::Anti {
                        out.push(joined);
                    }
                }
                if !hit && self.wrapper.keeps_unmatched() {
                    out.push(self.wrapper.wrap(Some(val), None));
                }
            }
            if let Some(b) = batch_of(out) {
                return Ok(Some(b));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::expr::This;
    use crate::runtime::expr::binary::{Compare, CompareOp};
    use crate::runtime::testutil::{rctx, run, source};

    fn key(ctx: &Arc<TypeContext>, path: &[&str]) -> BoxEval {
        Box::new(This::new(ctx.clone(), path.iter().map(|s| s.to_string()).collect()))
    }

    fn hash_join(style: &str) -> Vec<String> {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let left = source(&rctx, "{id:1,a:\"x\"} {id:2,a:\"y\"}");
        let right = source(&rctx, "{id:1,b:10} {id:3,b:30}");
        let mut op = HashJoin::new(
            ctx.clone(),
            style.parse().unwrap(),
            left,
            right,
            key(&ctx, &["id"]),
            key(&ctx, &["id"]),
            "l",
            "r",
        );
        run(&mut op)
    }

    #[test]
    fn hash_join_styles() {
        assert_eq!(vec![r#"{l:{id:1,a:"x"},r:{id:1,b:10}}"#], hash_join("inner"));
        assert_eq!(
            vec![r#"{l:{id:1,a:"x"},r:{id:1,b:10}}"#, r#"{l:{id:2,a:"y"}}"#],
            hash_join("left")
        );
        assert_eq!(
            vec![r#"{l:{id:1,a:"x"},r:{id:1,b:10}}"#, r#"{r:{id:3,b:30}}"#],
            hash_join("right")
        );
        assert_eq!(vec![r#"{l:{id:2,a:"y"}}"#], hash_join("anti"));
    }

    #[test]
    fn nested_loop_on_inequality() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let cond = Box::new(Compare::new(CompareOp::Lt, key(&ctx, &["l", "x"]), key(&ctx, &["r", "y"])));
        let mut op = NestedLoopJoin::new(
            ctx,
            JoinStyle::Left,
            source(&rctx, "{x:1} {x:5}"),
            source(&rctx, "{y:2} {y:3}"),
            Some(cond),
            "l",
            "r",
        );
        assert_eq!(vec!["{l:{x:1},r:{y:2}}", "{l:{x:1},r:{y:3}}", "{l:{x:5}}"], run(&mut op));
    }

    #[test]
    fn unknown_style_is_rejected() {
        assert!("outer".parse::<JoinStyle>().is_err());
    }
}
