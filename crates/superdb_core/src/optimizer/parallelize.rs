//! Splits source paths into parallel branches.
//!
//! A source path `Source | prefix | tail` becomes
//! `Source | Scatter[prefix x n] | Merge or Combine | tail`, after which
//! operators downstream of the fan-in are lifted into the branches where
//! doing so keeps the results unchanged.
use superdb_error::{DbError, Result};
use tracing::debug;

use crate::dag::walk::{walk, walk_entries};
use crate::dag::{Expr, Main, MergeOp, Op, PathsOp, Seq, SortExpr};
use crate::order::{Nulls, SortKeys, Which};

use super::Optimizer;
use super::remove_pass_ops;
use super::sort_keys::{aggregate_preserves, analyze_sort_keys, merge_sort_keys};

impl Optimizer {
    /// Parallelizes each entry path so the total number of branches across
    /// entries approaches `concurrency`.
    pub fn parallelize(&mut self, main: &mut Main, concurrency: usize) -> Result<()> {
        if self.nent == 0 {
            return Ok(());
        }
        let replicas = (concurrency / self.nent).max(2);
        let vector = self.vector;
        walk_entries(&mut main.body, &mut |seq| {
            let rewrite = match seq.first() {
                Some(Op::ListerScan(_)) => {
                    let start = if matches!(seq.get(1), Some(Op::Slicer)) { 2 } else { 1 };
                    if !matches!(seq.get(start), Some(Op::SeqScan(_))) {
                        return Err(DbError::new("internal error: lister not followed by a sequence scan"));
                    }
                    self.parallelize_seq_scan(&seq[start..], replicas)?
                        .map(|p| (start, p))
                }
                // The scalar file scan can't split its input.
                Some(Op::FileScan(_)) if vector => {
                    parallelize_file_scan(&seq[1..], replicas).map(|p| (1, p))
                }
                _ => None,
            };
            if let Some((front, parallel)) = rewrite {
                debug!(replicas, front, "parallelized source path");
                seq.truncate(front);
                seq.extend(parallel);
            }
            Ok(())
        })?;
        optimize_parallels(&mut main.body)?;
        remove_pass_ops(&mut main.body);
        Ok(())
    }

    fn parallelize_seq_scan(&self, seq: &[Op], replicas: usize) -> Result<Option<Seq>> {
        let Some(Op::SeqScan(scan)) = seq.first() else {
            return Ok(None);
        };
        if seq.len() == 1 && scan.filter.is_none() {
            // A bare scan gains nothing from parallel reads.
            return Ok(None);
        }
        let keys = self.sort_keys_of_source(&seq[0])?;
        if keys.len() > 1 {
            return Ok(None);
        }
        let (n, exprs, _) = concurrent_path(&seq[1..], &keys);
        Ok(Some(parallelize_head(seq, n + 1, exprs, replicas)))
    }
}

fn parallelize_file_scan(seq: &[Op], replicas: usize) -> Option<Seq> {
    // The leading pass lets the first operator after the scan be split.
    let mut with_pass = Vec::with_capacity(seq.len() + 1);
    with_pass.push(Op::Pass);
    with_pass.extend_from_slice(seq);
    let (n, exprs, _) = concurrent_path(&with_pass, &SortKeys::new());
    match with_pass.get(n) {
        Some(Op::Aggregate(_) | Op::Sort(_) | Op::Top(_)) => {
            Some(parallelize_head(&with_pass, n, exprs, replicas))
        }
        _ => None,
    }
}

fn parallelize_head(seq: &[Op], n: usize, exprs: Vec<SortExpr>, replicas: usize) -> Seq {
    let (head, tail) = seq.split_at(n);
    let scatter = Op::Scatter(PathsOp {
        paths: (0..replicas).map(|_| head.to_vec()).collect(),
    });
    // A merge is always inserted here since downstream order requirements
    // are unknown. Lifting may drop it later.
    let merge = if exprs.is_empty() {
        Op::Combine
    } else {
        Op::Merge(MergeOp { exprs })
    };
    let mut out = vec![scatter, merge];
    out.extend_from_slice(tail);
    out
}

pub(crate) fn optimize_parallels(seq: &mut Seq) -> Result<()> {
    walk(seq, false, &mut |seq| {
        let mut at = 0;
        while at + 2 <= seq.len() {
            lift_into_par_paths(seq, at);
            at += 1;
        }
    });
    Ok(())
}

fn append_to_paths(parallel: &mut Op, op: &Op) {
    if let Op::Fork(p) | Op::Scatter(p) = parallel {
        for path in &mut p.paths {
            path.push(op.clone());
        }
    }
}

/// Moves the operator after the fan-in of the parallel operator at `at`
/// into its branches when that leaves the result unchanged.
fn lift_into_par_paths(seq: &mut Seq, at: usize) {
    if !matches!(seq[at], Op::Fork(_) | Op::Scatter(_)) {
        return;
    }
    let (egress, merge_keys) = match &seq[at + 1] {
        Op::Merge(m) => (at + 2, Some(merge_sort_keys(&m.exprs))),
        Op::Combine => (at + 2, None),
        _ => (at + 1, None),
    };
    if egress >= seq.len() {
        return;
    }
    match seq[egress].clone() {
        Op::Aggregate(mut agg) => {
            if agg.partials_in || agg.partials_out {
                return;
            }
            let mut partial = agg.clone();
            partial.partials_out = true;
            append_to_paths(&mut seq[at], &Op::Aggregate(partial));
            // Keys are computed by the partial aggregates upstream.
            agg.partials_in = true;
            for key in &mut agg.keys {
                key.rhs = key.lhs.clone();
            }
            seq[egress] = Op::Aggregate(agg);
        }
        Op::Sort(sort) => {
            if sort.exprs.is_empty() {
                return;
            }
            append_to_paths(&mut seq[at], &Op::Sort(sort.clone()));
            seq[at + 1] = Op::Merge(MergeOp { exprs: sort.exprs });
            if egress > at + 1 {
                seq[egress] = Op::Pass;
            }
        }
        Op::Top(top) => {
            if top.exprs.is_empty() {
                return;
            }
            append_to_paths(&mut seq[at], &Op::Top(top.clone()));
            let head = Op::head(top.limit);
            seq[at + 1] = Op::Merge(MergeOp { exprs: top.exprs });
            if egress > at + 1 {
                seq[egress] = head;
            } else {
                seq.insert(at + 2, head);
            }
        }
        op @ (Op::Head(_) | Op::Tail(_)) => {
            // The original stays after the fan-in and limits again.
            append_to_paths(&mut seq[at], &op);
        }
        op @ (Op::Cut(_) | Op::Drop(_) | Op::Put(_) | Op::Rename(_) | Op::Filter(_)) => {
            if let Some(keys) = merge_keys {
                if keys.is_empty() || analyze_sort_keys(&op, &keys) != keys {
                    return;
                }
            }
            append_to_paths(&mut seq[at], &op);
            seq[egress] = Op::Pass;
        }
        _ => {}
    }
}

/// Length of the longest prefix of `seq` that can run in parallel branches
/// given input ordered by `sort_keys`, the sort expressions of the order at
/// its exit, and whether that order must be preserved.
pub(crate) fn concurrent_path(seq: &[Op], sort_keys: &SortKeys) -> (usize, Vec<SortExpr>, bool) {
    let mut keys = sort_keys.clone();
    for (k, op) in seq.iter().enumerate() {
        match op {
            Op::Aggregate(agg) => {
                // Ordered input lets the aggregate release groups as they
                // close.
                if keys.first().is_some_and(|key| aggregate_preserves(agg, key)) {
                    return (k, sort_exprs_for_sort_keys(&keys), true);
                }
                return (k, Vec::new(), false);
            }
            Op::Sort(sort) => {
                // Heuristic sorts can't be split.
                if sort.exprs.is_empty() {
                    return (0, Vec::new(), false);
                }
                return (k, sort.exprs.clone(), false);
            }
            Op::Top(top) => {
                if top.exprs.is_empty() {
                    return (0, Vec::new(), false);
                }
                return (k, top.exprs.clone(), false);
            }
            Op::Load(_) => return (k, Vec::new(), false),
            Op::Fork(_)
            | Op::Scatter(_)
            | Op::Mirror(_)
            | Op::Head(_)
            | Op::Tail(_)
            | Op::Uniq(_)
            | Op::Fuse
            | Op::Join(_)
            | Op::HashJoin(_)
            | Op::Output(_) => return (k, sort_exprs_for_sort_keys(&keys), true),
            other => {
                let next = analyze_sort_keys(other, &keys);
                if !keys.is_empty() && next.is_empty() {
                    return (k, sort_exprs_for_sort_keys(&keys), true);
                }
                keys = next;
            }
        }
    }
    (seq.len(), sort_exprs_for_sort_keys(&keys), true)
}

/// Sort expressions for keys, with nulls ordered as the largest values.
fn sort_exprs_for_sort_keys(keys: &SortKeys) -> Vec<SortExpr> {
    keys.iter()
        .map(|k| {
            let nulls = match k.order {
                Which::Asc => Nulls::Last,
                Which::Desc => Nulls::First,
            };
            SortExpr::new(
                Expr::This {
                    path: k.key.clone(),
                },
                k.order,
                nulls,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{AggregateOp, Assignment, FileScan, Pushdown, TopOp};

    fn count_by_k() -> Op {
        Op::Aggregate(AggregateOp {
            keys: vec![Assignment::new(Expr::this(["k"]), Expr::this(["k"]))],
            aggs: vec![Assignment::new(Expr::this(["count"]), Expr::agg("count", None))],
            ..Default::default()
        })
    }

    fn file_scan() -> Op {
        Op::FileScan(FileScan {
            paths: vec!["x.csup".to_string()],
            format: "csup".to_string(),
            pushdown: Pushdown::default(),
        })
    }

    #[test]
    fn vector_aggregate_splits_into_partials() {
        let mut main = Main::new(vec![
            file_scan(),
            Op::filter(Expr::binary(">", Expr::this(["x"]), Expr::literal("1"))),
            count_by_k(),
            Op::output("main"),
        ]);
        let mut opt = Optimizer::new(None, true);
        opt.optimize(&mut main).unwrap();
        opt.parallelize(&mut main, 4).unwrap();
        let [Op::FileScan(_), Op::Scatter(scatter), Op::Combine, Op::Aggregate(agg), Op::Output(_)] =
            main.body.as_slice()
        else {
            panic!("{:#?}", main.body);
        };
        assert_eq!(4, scatter.paths.len());
        for path in &scatter.paths {
            let [Op::Filter(_), Op::Aggregate(partial)] = path.as_slice() else {
                panic!("{path:?}");
            };
            assert!(partial.partials_out);
        }
        assert!(agg.partials_in);
    }

    #[test]
    fn scalar_file_scan_not_parallelized() {
        let mut main = Main::new(vec![file_scan(), count_by_k(), Op::output("main")]);
        let mut opt = Optimizer::new(None, false);
        opt.optimize(&mut main).unwrap();
        let before = main.clone();
        opt.parallelize(&mut main, 4).unwrap();
        assert_eq!(before, main);
    }

    #[test]
    fn top_lifts_into_branches() {
        let top = TopOp {
            limit: 3,
            exprs: vec![SortExpr::new(Expr::this(["x"]), Which::Asc, Nulls::Last)],
            reverse: false,
        };
        let mut seq = vec![
            Op::Scatter(PathsOp {
                paths: vec![vec![Op::Pass], vec![Op::Pass]],
            }),
            Op::Combine,
            Op::Top(top.clone()),
        ];
        optimize_parallels(&mut seq).unwrap();
        let [Op::Scatter(s), Op::Merge(m), Op::Head(h)] = seq.as_slice() else {
            panic!("{seq:?}");
        };
        assert_eq!(Op::Top(top.clone()), s.paths[0][1]);
        assert_eq!(top.exprs, m.exprs);
        assert_eq!(3, h.count);
    }

    #[test]
    fn put_on_merge_key_not_lifted() {
        let merge = MergeOp {
            exprs: vec![SortExpr::new(Expr::this(["ts"]), Which::Asc, Nulls::Last)],
        };
        let put = Op::Put(crate::dag::AssignmentsOp {
            args: vec![Assignment::new(Expr::this(["ts"]), Expr::literal("0"))],
        });
        let mut seq = vec![
            Op::Scatter(PathsOp {
                paths: vec![vec![Op::Pass], vec![Op::Pass]],
            }),
            Op::Merge(merge),
            put.clone(),
        ];
        optimize_parallels(&mut seq).unwrap();
        assert_eq!(put, seq[2]);
    }
}
