//! Demand analysis: which fields of its input each operator needs.
//!
//! Demand flows right to left through a sequence. Scans record the demand
//! reaching them as their projection.
use std::collections::BTreeMap;

use crate::dag::{Assignment, Expr, Op, RecordElem, Seq, SortOp, TopOp, VectorElem};

/// `All` means every field is needed. `Keys` maps field names to the demand
/// on that field's value and never holds an empty entry. An empty `Keys` is
/// "nothing needed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Demand {
    All,
    Keys(BTreeMap<String, Demand>),
}

impl Demand {
    pub fn none() -> Demand {
        Demand::Keys(BTreeMap::new())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Demand::All)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Demand::Keys(keys) if keys.is_empty())
    }

    /// Demand for `key` only. Demanding nothing of a key demands nothing.
    pub fn key(key: impl Into<String>, value: Demand) -> Demand {
        if value.is_none() {
            return value;
        }
        let mut keys = BTreeMap::new();
        keys.insert(key.into(), value);
        Demand::Keys(keys)
    }

    pub fn union(self, other: Demand) -> Demand {
        match (self, other) {
            (Demand::All, _) | (_, Demand::All) => Demand::All,
            (Demand::Keys(mut a), Demand::Keys(b)) => {
                for (k, v) in b {
                    let merged = match a.remove(&k) {
                        Some(existing) => existing.union(v),
                        None => v,
                    };
                    a.insert(k, merged);
                }
                Demand::Keys(a)
            }
        }
    }

    /// Removes the entries of `other` from `self`.
    pub fn delete(self, other: &Demand) -> Demand {
        let (Demand::Keys(mut a), Demand::Keys(b)) = (self.clone(), other) else {
            return self;
        };
        for (k, bv) in b {
            let Some(av) = a.remove(k) else {
                continue;
            };
            if bv.is_all() {
                continue;
            }
            let rest = av.delete(bv);
            if !rest.is_none() {
                a.insert(k.clone(), rest);
            }
        }
        Demand::Keys(a)
    }

    pub fn get(&self, key: &str) -> Demand {
        match self {
            Demand::All => Demand::All,
            Demand::Keys(keys) => keys.get(key).cloned().unwrap_or_else(Demand::none),
        }
    }

    /// Projection paths for this demand. `All` has no projection.
    pub fn fields(&self) -> Option<Vec<Vec<String>>> {
        let Demand::Keys(keys) = self else {
            return None;
        };
        let mut out = Vec::new();
        for (k, v) in keys {
            match v.fields() {
                Some(paths) if !paths.is_empty() => {
                    for path in paths {
                        let mut full = vec![k.clone()];
                        full.extend(path);
                        out.push(full);
                    }
                }
                _ => out.push(vec![k.clone()]),
            }
        }
        Some(out)
    }
}

pub fn demand_for_seq(seq: &mut Seq, mut downstream: Demand) -> Demand {
    for op in seq.iter_mut().rev() {
        downstream = demand_for_op(op, downstream);
    }
    downstream
}

fn union_exprs<'a>(exprs: impl IntoIterator<Item = &'a Expr>) -> Demand {
    exprs
        .into_iter()
        .fold(Demand::none(), |d, e| d.union(demand_for_expr(e)))
}

fn demand_for_op(op: &mut Op, downstream: Demand) -> Demand {
    match op {
        Op::Combine
        | Op::Drop(_)
        | Op::Head(_)
        | Op::Pass
        | Op::Skip(_)
        | Op::Tail(_) => downstream,
        // Without keys the sort key is guessed from the first value.
        Op::Sort(SortOp { exprs, .. }) | Op::Top(TopOp { exprs, .. }) if exprs.is_empty() => Demand::All,
        Op::Sort(SortOp { exprs, .. }) | Op::Top(TopOp { exprs, .. }) => {
            downstream.union(union_exprs(exprs.iter().map(|s| &s.key)))
        }
        // Uniq compares whole values.
        Op::Uniq(_) => Demand::All,
        Op::Aggregate(op) => union_exprs(op.keys.iter().chain(op.aggs.iter()).map(|a| &a.rhs)),
        Op::Count(op) => op.expr.as_ref().map(demand_for_expr).unwrap_or_else(Demand::none),
        Op::Cut(op) => demand_for_assignments(&op.args, Demand::none()),
        Op::Distinct(op) => downstream.union(demand_for_expr(&op.expr)),
        Op::Explode(op) => union_exprs(&op.args),
        Op::Filter(op) => downstream.union(demand_for_expr(&op.expr)),
        Op::Fork(op) | Op::Scatter(op) => op
            .paths
            .iter_mut()
            .fold(Demand::none(), |d, p| d.union(demand_for_seq(p, downstream.clone()))),
        Op::Fuse | Op::Load(_) | Op::Output(_) => Demand::All,
        // Joins nest each side under its alias, so the demand on either
        // parent is the demand under its alias plus its key.
        Op::HashJoin(op) => downstream
            .get(&op.left_alias)
            .union(downstream.get(&op.right_alias))
            .union(demand_for_expr(&op.left_key))
            .union(demand_for_expr(&op.right_key)),
        Op::Join(_) => Demand::All,
        Op::Merge(op) => downstream.union(union_exprs(op.exprs.iter().map(|s| &s.key))),
        Op::Mirror(op) => {
            demand_for_seq(&mut op.main, Demand::All).union(demand_for_seq(&mut op.mirror, Demand::All))
        }
        Op::Put(op) | Op::Rename(op) => demand_for_assignments(&op.args, downstream),
        Op::Scope(op) => demand_for_seq(&mut op.body, downstream),
        Op::Slicer => Demand::none(),
        Op::Switch(op) => {
            let mut d = op.expr.as_ref().map(demand_for_expr).unwrap_or_else(Demand::none);
            for case in &mut op.cases {
                if let Some(e) = &case.expr {
                    d = d.union(demand_for_expr(e));
                }
                d = d.union(demand_for_seq(&mut case.path, downstream.clone()));
            }
            d
        }
        Op::Unnest(op) => {
            if let Some(body) = &mut op.body {
                demand_for_seq(body, Demand::All);
            }
            downstream.union(demand_for_expr(&op.expr))
        }
        Op::Values(op) => union_exprs(&op.exprs),

        Op::FileScan(op) => {
            let mut d = downstream;
            let pd = &mut op.pushdown;
            for sf in pd.data_filter.iter().chain(pd.meta_filter.iter()) {
                if let Some(e) = &sf.expr {
                    d = d.union(demand_for_expr(e));
                }
            }
            pd.projection = d.fields();
            Demand::none()
        }
        Op::SeqScan(op) => {
            let mut d = downstream;
            for e in op.filter.iter().chain(op.key_pruner.iter()) {
                d = d.union(demand_for_expr(e));
            }
            op.fields = d.fields();
            Demand::none()
        }
        Op::RobotScan(op) => demand_for_expr(&op.expr),
        Op::CommitMetaScan(_)
        | Op::DbMetaScan(_)
        | Op::DefaultScan(_)
        | Op::DeleterScan(_)
        | Op::DeleteScan(_)
        | Op::HttpScan(_)
        | Op::ListerScan(_)
        | Op::NullScan
        | Op::PoolMetaScan(_)
        | Op::PoolScan(_) => Demand::none(),
    }
}

pub fn demand_for_expr(expr: &Expr) -> Demand {
    match expr {
        Expr::This { path } => path
            .iter()
            .rev()
            .fold(Demand::All, |d, k| Demand::key(k.clone(), d)),
        Expr::Dot { lhs, .. } => demand_for_expr(lhs),
        Expr::Call { name, args } => {
            let d = if name == "every" {
                Demand::key("ts", Demand::All)
            } else {
                Demand::none()
            };
            d.union(union_exprs(args))
        }
        Expr::RecordExpr { elems } => elems.iter().fold(Demand::none(), |d, elem| match elem {
            RecordElem::Field { value, .. } => d.union(demand_for_expr(value)),
            RecordElem::Spread { expr } => d.union(demand_for_expr(expr)),
        }),
        Expr::ArrayExpr { elems } | Expr::SetExpr { elems } => {
            elems.iter().fold(Demand::none(), |d, elem| match elem {
                VectorElem::Spread { expr } | VectorElem::VectorValue { expr } => {
                    d.union(demand_for_expr(expr))
                }
            })
        }
        // A subquery can reach the outer value only through its own
        // expressions, which are analyzed when its body is.
        Expr::Subquery { .. } | Expr::Literal { .. } | Expr::FuncRef { .. } | Expr::BadExpr => {
            Demand::none()
        }
        Expr::CallParam { .. } => Demand::All,
        other => {
            let mut d = Demand::none();
            other.for_each_child(&mut |child| {
                let prev = std::mem::replace(&mut d, Demand::none());
                d = prev.union(demand_for_expr(child));
            });
            d
        }
    }
}

fn demand_for_assignments(assignments: &[Assignment], downstream: Demand) -> Demand {
    let mut d = downstream;
    for a in assignments {
        if a.lhs.is_this() {
            // The assignment overwrites a static field.
            d = d.delete(&demand_for_expr(&a.lhs));
        } else {
            d = d.union(demand_for_expr(&a.lhs));
        }
        d = d.union(demand_for_expr(&a.rhs));
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{AggregateOp, AssignmentsOp, FileScan, Pushdown, SortExpr, UniqOp};
    use crate::order::{Nulls, Which};

    fn cut_y() -> Op {
        Op::Cut(AssignmentsOp {
            args: vec![Assignment::new(Expr::this(["y"]), Expr::this(["y"]))],
        })
    }

    fn paths(d: &Demand) -> Vec<String> {
        d.fields()
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.join("."))
            .collect()
    }

    #[test]
    fn lattice() {
        let a = demand_for_expr(&Expr::this(["a", "b"]));
        let c = demand_for_expr(&Expr::this(["c"]));
        let u = a.clone().union(c.clone());
        assert_eq!(vec!["a.b", "c"], paths(&u));
        assert!(u.clone().union(Demand::All).is_all());
        assert_eq!(vec!["a.b"], paths(&u.clone().delete(&c)));
        assert!(Demand::key("x", Demand::none()).is_none());
        assert_eq!(Demand::All, u.get("c"));
        assert!(u.get("zz").is_none());
        assert_eq!(None, Demand::All.fields());
        assert_eq!(Some(Vec::new()), Demand::none().fields());
    }

    #[test]
    fn scan_projection_from_aggregate() {
        let mut seq = vec![
            Op::FileScan(FileScan {
                paths: vec!["in.csup".to_string()],
                format: "csup".to_string(),
                pushdown: Pushdown::default(),
            }),
            Op::filter(Expr::binary(">", Expr::this(["x"]), Expr::literal("1"))),
            Op::Aggregate(AggregateOp {
                keys: vec![Assignment::new(Expr::this(["k"]), Expr::this(["k"]))],
                aggs: vec![Assignment::new(
                    Expr::this(["s"]),
                    Expr::agg("sum", Some(Expr::this(["v"]))),
                )],
                ..Default::default()
            }),
            Op::output("main"),
        ];
        let d = demand_for_seq(&mut seq, Demand::All);
        assert!(d.is_none());
        let Op::FileScan(scan) = &seq[0] else { panic!() };
        assert_eq!(
            Some(vec![vec!["k".to_string()], vec!["v".to_string()], vec!["x".to_string()]]),
            scan.pushdown.projection
        );
    }

    #[test]
    fn put_overwrites_field() {
        let mut seq = vec![
            Op::Put(crate::dag::AssignmentsOp {
                args: vec![Assignment::new(Expr::this(["y"]), Expr::this(["x"]))],
            }),
            Op::Cut(crate::dag::AssignmentsOp {
                args: vec![Assignment::new(Expr::this(["y"]), Expr::this(["y"]))],
            }),
        ];
        let d = demand_for_seq(&mut seq, Demand::All);
        assert_eq!(vec!["x"], paths(&d));
    }

    #[test]
    fn sort_keys_are_demanded() {
        let mut seq = vec![
            Op::Sort(SortOp {
                exprs: vec![SortExpr::new(Expr::this(["x"]), Which::Asc, Nulls::Last)],
                reverse: false,
            }),
            cut_y(),
        ];
        assert_eq!(vec!["x", "y"], paths(&demand_for_seq(&mut seq, Demand::All)));

        let mut guessed = vec![Op::Sort(SortOp::default()), cut_y()];
        assert!(demand_for_seq(&mut guessed, Demand::All).is_all());
    }

    #[test]
    fn uniq_demands_whole_values() {
        let mut seq = vec![Op::Uniq(UniqOp { cflag: false }), cut_y()];
        assert!(demand_for_seq(&mut seq, Demand::All).is_all());
    }
}
