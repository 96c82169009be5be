//! Sort order tracking through a sequence.
use superdb_error::{DbError, Result};

use crate::dag::{AggregateOp, Expr, Op, Seq, SortExpr};
use crate::order::{SortKey, SortKeys};

use super::Optimizer;

impl Optimizer {
    pub(crate) fn sort_keys_of_source(&self, op: &Op) -> Result<SortKeys> {
        match op {
            Op::DefaultScan(op) => Ok(op.sort_keys.clone()),
            Op::FileScan(_) | Op::HttpScan(_) => Ok(SortKeys::new()),
            Op::PoolScan(op) => self.sort_keys_for_pool(&op.id),
            Op::ListerScan(op) => self.sort_keys_for_pool(&op.pool),
            Op::SeqScan(op) => self.sort_keys_for_pool(&op.pool),
            // Only the object list of a tap follows the pool order. Other
            // commit metadata is treated as unordered.
            Op::CommitMetaScan(op) if op.tap && op.meta == "objects" => {
                self.sort_keys_for_pool(&op.pool)
            }
            Op::CommitMetaScan(_) => Ok(SortKeys::new()),
            other => Err(DbError::new(format!(
                "internal error: unknown source type {}",
                other.kind()
            ))),
        }
    }

    /// Sort keys at each path end of `seq`, leaving the plan untouched.
    pub fn sort_keys(&self, seq: &Seq) -> Result<Vec<SortKeys>> {
        self.propagate_sort_key(&mut seq.clone(), Vec::new())
    }

    /// Propagates the sort keys of `parents` through `seq`, recording the
    /// input order on aggregates keyed by the sort key.
    pub(crate) fn propagate_sort_key(
        &self,
        seq: &mut Seq,
        mut parents: Vec<SortKeys>,
    ) -> Result<Vec<SortKeys>> {
        for op in seq.iter_mut() {
            parents = self.propagate_sort_key_op(op, parents)?;
        }
        Ok(parents)
    }

    fn propagate_sort_key_op(&self, op: &mut Op, parents: Vec<SortKeys>) -> Result<Vec<SortKeys>> {
        if matches!(op, Op::HashJoin(_) | Op::Join(_)) {
            return Ok(vec![SortKeys::new()]);
        }
        let parent = unify(parents);
        match op {
            Op::Aggregate(agg) => {
                let Some(primary) = parent.first() else {
                    return Ok(vec![SortKeys::new()]);
                };
                if aggregate_preserves(agg, primary) {
                    agg.input_sort_dir = primary.order.direction();
                    return Ok(vec![parent]);
                }
                Ok(vec![SortKeys::new()])
            }
            Op::Fork(p) | Op::Scatter(p) => {
                let mut keys = Vec::new();
                for path in &mut p.paths {
                    keys.extend(self.propagate_sort_key(path, vec![parent.clone()])?);
                }
                Ok(keys)
            }
            Op::Mirror(m) => {
                let mut keys = self.propagate_sort_key(&mut m.main, vec![parent.clone()])?;
                keys.extend(self.propagate_sort_key(&mut m.mirror, vec![parent])?);
                Ok(keys)
            }
            Op::Merge(merge) => {
                let keys = merge_sort_keys(&merge.exprs);
                if keys == parent {
                    Ok(vec![keys])
                } else {
                    Ok(vec![SortKeys::new()])
                }
            }
            Op::PoolScan(_) | Op::ListerScan(_) | Op::SeqScan(_) | Op::DefaultScan(_) => {
                Ok(vec![self.sort_keys_of_source(op)?])
            }
            other => Ok(vec![analyze_sort_keys(other, &parent)]),
        }
    }
}

/// Parents agree on an order only if they all have the same keys.
fn unify(parents: Vec<SortKeys>) -> SortKeys {
    let mut iter = parents.into_iter();
    let Some(first) = iter.next() else {
        return SortKeys::new();
    };
    for p in iter {
        if p != first {
            return SortKeys::new();
        }
    }
    first
}

/// Sort keys implied by the first expression of a merge.
pub(crate) fn merge_sort_keys(exprs: &[SortExpr]) -> SortKeys {
    match exprs.first() {
        Some(SortExpr {
            key: Expr::This { path },
            order,
            ..
        }) => vec![SortKey::new(path.clone(), *order)],
        _ => SortKeys::new(),
    }
}

fn field_of(e: &Expr) -> Option<&[String]> {
    e.this_path()
}

/// Calls whose output order follows the order of their first argument.
fn order_preserving_call(e: &Expr, key: &[String]) -> bool {
    let Expr::Call { name, args } = e else {
        return false;
    };
    matches!(name.as_str(), "bucket" | "floor" | "ceil" | "round")
        && args.first().and_then(field_of) == Some(key)
}

pub(crate) fn aggregate_preserves(agg: &AggregateOp, key: &SortKey) -> bool {
    agg.keys.iter().any(|k| {
        field_of(&k.lhs) == Some(key.key.as_slice())
            && (field_of(&k.rhs) == Some(key.key.as_slice()) || order_preserving_call(&k.rhs, &key.key))
    })
}

fn touches(path: &[String], key: &[String]) -> bool {
    let n = path.len().min(key.len());
    path[..n] == key[..n]
}

/// Sort keys of the output of `op` given the sort keys of its input.
pub(crate) fn analyze_sort_keys(op: &Op, parent: &SortKeys) -> SortKeys {
    match op {
        Op::Sort(sort) => sort_exprs_keys(&sort.exprs),
        Op::Top(top) => sort_exprs_keys(&top.exprs),
        Op::Filter(_)
        | Op::Head(_)
        | Op::Tail(_)
        | Op::Skip(_)
        | Op::Pass
        | Op::Output(_)
        | Op::Uniq(_)
        | Op::Slicer
        | Op::Distinct(_) => parent.clone(),
        Op::Put(a) | Op::Rename(a) => {
            let Some(primary) = parent.first() else {
                return SortKeys::new();
            };
            let clobbered = a.args.iter().any(|arg| match field_of(&arg.lhs) {
                Some(path) => touches(path, &primary.key),
                None => true,
            });
            let renamed_from = matches!(op, Op::Rename(_))
                && a.args.iter().any(|arg| match field_of(&arg.rhs) {
                    Some(path) => touches(path, &primary.key),
                    None => true,
                });
            if clobbered || renamed_from {
                SortKeys::new()
            } else {
                parent.clone()
            }
        }
        Op::Cut(a) => {
            let Some(primary) = parent.first() else {
                return SortKeys::new();
            };
            let kept = a.args.iter().any(|arg| {
                field_of(&arg.lhs) == Some(primary.key.as_slice())
                    && field_of(&arg.rhs) == Some(primary.key.as_slice())
            });
            if kept { parent.clone() } else { SortKeys::new() }
        }
        Op::Drop(d) => {
            let Some(primary) = parent.first() else {
                return SortKeys::new();
            };
            let dropped = d.args.iter().any(|arg| match field_of(arg) {
                Some(path) => touches(path, &primary.key),
                None => true,
            });
            if dropped { SortKeys::new() } else { parent.clone() }
        }
        Op::Count(c) => {
            let Some(primary) = parent.first() else {
                return SortKeys::new();
            };
            let spreads_this = matches!(&c.expr, Some(Expr::This { path }) if path.is_empty());
            if spreads_this && primary.key.first() != Some(&c.alias) {
                parent.clone()
            } else {
                SortKeys::new()
            }
        }
        _ => SortKeys::new(),
    }
}

fn sort_exprs_keys(exprs: &[SortExpr]) -> SortKeys {
    let mut keys = SortKeys::new();
    for e in exprs {
        let Some(path) = field_of(&e.key) else {
            return SortKeys::new();
        };
        keys.push(SortKey::new(path.to_vec(), e.order));
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{Assignment, AssignmentsOp, SortOp};
    use crate::order::{Nulls, Which};

    fn ts_keys() -> SortKeys {
        vec![SortKey::new(vec!["ts".to_string()], Which::Desc)]
    }

    #[test]
    fn aggregate_records_input_order() {
        let mut seq = vec![Op::Aggregate(AggregateOp {
            keys: vec![Assignment::new(
                Expr::this(["ts"]),
                Expr::call("bucket", vec![Expr::this(["ts"]), Expr::literal("1h")]),
            )],
            ..Default::default()
        })];
        let out = Optimizer::new(None, false)
            .propagate_sort_key(&mut seq, vec![ts_keys()])
            .unwrap();
        assert_eq!(vec![ts_keys()], out);
        let Op::Aggregate(agg) = &seq[0] else { panic!() };
        assert_eq!(-1, agg.input_sort_dir);
    }

    #[test]
    fn put_on_key_loses_order() {
        let put = Op::Put(AssignmentsOp {
            args: vec![Assignment::new(Expr::this(["ts"]), Expr::literal("1"))],
        });
        assert!(analyze_sort_keys(&put, &ts_keys()).is_empty());
        let put = Op::Put(AssignmentsOp {
            args: vec![Assignment::new(Expr::this(["y"]), Expr::literal("1"))],
        });
        assert_eq!(ts_keys(), analyze_sort_keys(&put, &ts_keys()));
    }

    #[test]
    fn sort_sets_keys() {
        let sort = Op::Sort(SortOp {
            exprs: vec![SortExpr::new(Expr::this(["a"]), Which::Asc, Nulls::Last)],
            reverse: false,
        });
        assert_eq!(
            vec![SortKey::new(vec!["a".to_string()], Which::Asc)],
            analyze_sort_keys(&sort, &SortKeys::new())
        );
    }
}
