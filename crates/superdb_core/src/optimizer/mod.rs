//! Plan rewriting.
//!
//! [`Optimizer::optimize`] applies the rewrite passes in a fixed order.
//! [`Optimizer::parallelize`] runs afterwards as a separate step when the
//! requested concurrency is greater than one, and
//! [`Optimizer::optimize_deleter`] handles delete-where plans.
pub mod demand;
pub mod join;
pub mod parallelize;
pub mod pruner;
pub mod sort_keys;

use std::collections::HashMap;
use std::sync::Arc;

use superdb_error::{DbError, Result};
use tracing::debug;

use crate::dag::walk::{walk, walk_entries, walk_expr_mut, walk_seqs};
use crate::dag::{
    Assignment, Expr, ListerScan, Main, MergeOp, Op, PathsOp, RecordElem, ScanFilter, Seq,
    SeqScan, SortExpr, TopOp, copy_seq,
};
use crate::lake::Lake;
use crate::order::{Nulls, SortKeys};
use demand::{Demand, demand_for_seq};
use pruner::{maybe_new_range_pruner, new_metadata_pruner};

/// Largest limit fused into a `Top`, which holds its values in memory.
const MAX_TOP_LIMIT: usize = 1 << 20;

pub struct Optimizer {
    lake: Option<Arc<dyn Lake>>,
    vector: bool,
    /// Number of entry sources found by source path rewriting.
    nent: usize,
}

impl Optimizer {
    pub fn new(lake: Option<Arc<dyn Lake>>, vector: bool) -> Self {
        Optimizer {
            lake,
            vector,
            nent: 0,
        }
    }

    pub fn optimize(&mut self, main: &mut Main) -> Result<()> {
        let seq = &mut main.body;
        join::replace_join_with_hash_join(seq);
        lift_filter_ops(seq)?;
        merge_filters(seq);
        merge_values_ops(seq)?;
        walk_exprs_records(seq);
        join::join_filter_pullup(seq);
        remove_pass_ops(seq);
        replace_sort_and_head_or_tail_with_top(seq);
        parallelize::optimize_parallels(seq)?;
        merge_filters(seq);
        self.optimize_source_paths(seq)?;
        remove_pass_ops(seq);
        demand_for_seq(seq, Demand::All);
        set_pushdown_unordered(seq, false);
        debug!(nent = self.nent, "optimized plan");
        Ok(())
    }

    /// Rewrites `DeleteScan | Filter | Output` into a parallel scan of the
    /// pool that emits the values surviving the delete.
    pub fn optimize_deleter(&mut self, main: &mut Main, replicas: usize) -> Result<()> {
        let [Op::DeleteScan(scan), Op::Filter(filter), Op::Output(output)] = main.body.as_slice() else {
            return Err(DbError::new("invalid delete where query"));
        };
        let mut lister = ListerScan {
            pool: scan.id,
            commit: scan.commit,
            key_pruner: None,
        };
        let sort_keys = self.sort_keys_of_source(&Op::ListerScan(lister.clone()))?;
        lister.key_pruner = maybe_new_range_pruner(Some(&filter.expr), &sort_keys);
        let deleter = Op::DeleterScan(crate::dag::DeleterScan {
            pool: scan.id,
            filter: Some(filter.expr.clone()),
            key_pruner: lister.key_pruner.clone(),
        });
        let paths = (0..replicas.max(1))
            .map(|_| copy_seq(std::slice::from_ref(&deleter)))
            .collect::<Result<Vec<_>>>()?;
        let merge = match sort_keys.first() {
            Some(key) => Op::Merge(MergeOp {
                exprs: vec![SortExpr::new(
                    Expr::This {
                        path: key.key.clone(),
                    },
                    key.order,
                    Nulls::Last,
                )],
            }),
            None => Op::Combine,
        };
        let output = Op::Output(output.clone());
        main.body = vec![
            Op::ListerScan(lister),
            Op::Scatter(PathsOp { paths }),
            merge,
            output,
        ];
        Ok(())
    }

    fn optimize_source_paths(&mut self, seq: &mut Seq) -> Result<()> {
        walk_entries(seq, &mut |seq| {
            if seq.is_empty() {
                return Err(DbError::new(
                    "internal error: optimizer encountered empty sequential operator",
                ));
            }
            if seq.len() == 1 {
                return Ok(());
            }
            self.propagate_sort_key(seq, vec![SortKeys::new()])?;
            let mut chain: Seq = seq.drain(1..).collect();
            let filter = match chain.first() {
                Some(Op::Filter(_)) => match chain.remove(0) {
                    Op::Filter(f) => Some(f.expr),
                    _ => None,
                },
                _ => None,
            };
            let source = seq.remove(0);
            let rewritten = match source {
                Op::PoolScan(op) => {
                    self.nent += 1;
                    let sort_keys = self.sort_keys_of_source(&Op::PoolScan(op.clone()))?;
                    let key_pruner = maybe_new_range_pruner(filter.as_ref(), &sort_keys);
                    let mut out = vec![Op::ListerScan(ListerScan {
                        pool: op.id,
                        commit: op.commit,
                        key_pruner: key_pruner.clone(),
                    })];
                    let (_, _, order_required) = parallelize::concurrent_path(&chain, &sort_keys);
                    if order_required {
                        out.push(Op::Slicer);
                    }
                    out.push(Op::SeqScan(SeqScan {
                        pool: op.id,
                        commit: op.commit,
                        fields: None,
                        filter,
                        key_pruner,
                    }));
                    out.extend(chain);
                    out
                }
                Op::FileScan(mut op) => {
                    self.nent += 1;
                    if self.vector {
                        // Vector scans select objects by metadata and leave
                        // the filter in place.
                        if let Some(f) = &filter {
                            op.pushdown.meta_filter = Some(ScanFilter {
                                projection: None,
                                expr: new_metadata_pruner(f),
                            });
                        }
                        let mut out = vec![Op::FileScan(op)];
                        if let Some(f) = filter {
                            out.push(Op::filter(f));
                        }
                        out.extend(chain);
                        out
                    } else {
                        if let Some(f) = filter {
                            op.pushdown.data_filter = Some(ScanFilter {
                                projection: None,
                                expr: Some(f),
                            });
                        }
                        let mut out = vec![Op::FileScan(op)];
                        out.extend(chain);
                        out
                    }
                }
                Op::CommitMetaScan(mut op) => {
                    self.nent += 1;
                    if op.tap {
                        let sort_keys = self.sort_keys_of_source(&Op::CommitMetaScan(op.clone()))?;
                        op.key_pruner = maybe_new_range_pruner(filter.as_ref(), &sort_keys);
                        // The downstream operators are dropped when tapping
                        // the object list.
                        let output = match chain.pop() {
                            Some(out @ Op::Output(_)) => out,
                            _ => Op::output("main"),
                        };
                        vec![Op::CommitMetaScan(op), output]
                    } else {
                        let mut out = vec![Op::CommitMetaScan(op)];
                        out.extend(filter.map(Op::filter));
                        out.extend(chain);
                        out
                    }
                }
                Op::DefaultScan(mut op) => {
                    self.nent += 1;
                    op.filter = filter;
                    let mut out = vec![Op::DefaultScan(op)];
                    out.extend(chain);
                    out
                }
                other => {
                    let mut out = vec![other];
                    out.extend(filter.map(Op::filter));
                    out.extend(chain);
                    out
                }
            };
            *seq = rewritten;
            Ok(())
        })
    }

    pub(crate) fn sort_keys_for_pool(&self, id: &uuid::Uuid) -> Result<SortKeys> {
        let lake = self.lake.as_ref().ok_or_else(|| {
            DbError::new("internal error: database operation requires database operating context")
        })?;
        Ok(lake.pool(id)?.sort_keys)
    }
}

/// Merges adjacent filters into one conjunction.
pub fn merge_filters(seq: &mut Seq) {
    walk(seq, true, &mut |seq| {
        let mut i = seq.len().saturating_sub(1);
        while i > 0 {
            i -= 1;
            if let (Op::Filter(_), Op::Filter(_)) = (&seq[i], &seq[i + 1]) {
                let Op::Filter(f2) = seq.remove(i + 1) else {
                    continue;
                };
                if let Op::Filter(f1) = &mut seq[i] {
                    let lhs = std::mem::replace(&mut f1.expr, Expr::BadExpr);
                    f1.expr = Expr::binary("and", lhs, f2.expr);
                }
            }
        }
    });
}

/// Removes `Pass` operators, keeping one in an otherwise empty sequence.
pub fn remove_pass_ops(seq: &mut Seq) {
    walk(seq, true, &mut |seq| {
        seq.retain(|op| !matches!(op, Op::Pass));
        if seq.is_empty() {
            seq.push(Op::Pass);
        }
    });
}

fn has_this_with_empty_path(expr: &Expr) -> bool {
    expr.any(&mut |e| matches!(e, Expr::This { path } if path.is_empty()))
}

fn has_subquery(expr: &Expr) -> bool {
    expr.any(&mut |e| matches!(e, Expr::Subquery { .. }))
}

fn op_blocks_substitution(op: &mut Op) -> bool {
    let mut blocked = false;
    op.for_each_expr_mut(&mut |e| {
        blocked |= has_this_with_empty_path(e) || has_subquery(e);
    });
    blocked
}

/// Field expressions of a record expression and its spread. A spread is
/// only accepted as the first element.
fn record_fields_and_spread(elems: &[RecordElem]) -> Option<(HashMap<String, Expr>, Option<Expr>)> {
    let mut fields = HashMap::new();
    let mut spread = None;
    for (i, elem) in elems.iter().enumerate() {
        match elem {
            RecordElem::Field { name, value } => {
                fields.insert(name.clone(), value.clone());
            }
            RecordElem::Spread { expr } => {
                if i > 0 {
                    return None;
                }
                spread = Some(expr.clone());
            }
        }
    }
    Some((fields, spread))
}

/// Rewrites every `this` reference in `expr` into the expression producing
/// it from the record expression's fields. Returns false when a reference
/// can't be resolved statically.
fn substitute_record_fields(
    expr: &mut Expr,
    fields: &HashMap<String, Expr>,
    spread: Option<&Expr>,
) -> bool {
    let mut ok = true;
    walk_expr_mut(expr, &mut |e| {
        if !ok {
            return;
        }
        let Expr::This { path } = e else {
            return;
        };
        let replacement = match fields.get(&path[0]) {
            Some(value) => add_path_to_expr(value.clone(), &path[1..]),
            None => match spread {
                None => Some(Expr::literal("error(\"missing\")")),
                Some(spread) => add_path_to_expr(spread.clone(), path),
            },
        };
        match replacement {
            Some(r) => *e = r,
            None => ok = false,
        }
    });
    ok
}

/// Moves a filter ahead of a preceding `Values` of a single record
/// expression by rewriting its field references.
fn lift_filter_ops(seq: &mut Seq) -> Result<()> {
    walk_seqs(seq, &mut |seq| {
        let mut i = seq.len().saturating_sub(1);
        while i > 0 {
            i -= 1;
            let (Op::Values(values), Op::Filter(filter)) = (&seq[i], &seq[i + 1]) else {
                continue;
            };
            let [Expr::RecordExpr { elems }] = values.exprs.as_slice() else {
                continue;
            };
            if has_this_with_empty_path(&filter.expr) || has_subquery(&filter.expr) {
                continue;
            }
            let Some((fields, spread)) = record_fields_and_spread(elems) else {
                continue;
            };
            let mut expr = filter.expr.clone();
            if substitute_record_fields(&mut expr, &fields, spread.as_ref()) {
                seq.swap(i, i + 1);
                seq[i] = Op::filter(expr);
            }
        }
    });
    Ok(())
}

/// Fuses `Values{record}` into a following `Values` or `Aggregate`.
fn merge_values_ops(seq: &mut Seq) -> Result<()> {
    walk(seq, true, &mut |seq| {
        let mut i = 0;
        while i + 1 < seq.len() {
            let Op::Values(values) = &seq[i] else {
                i += 1;
                continue;
            };
            let [Expr::RecordExpr { elems }] = values.exprs.as_slice() else {
                i += 1;
                continue;
            };
            let Some((fields, spread)) = record_fields_and_spread(elems) else {
                i += 1;
                continue;
            };
            if !matches!(seq[i + 1], Op::Aggregate(_) | Op::Values(_)) || op_blocks_substitution(&mut seq[i + 1]) {
                i += 1;
                continue;
            }
            let mut merged = seq[i + 1].clone();
            let mut ok = true;
            match &mut merged {
                Op::Aggregate(agg) => {
                    for a in agg.keys.iter_mut().chain(agg.aggs.iter_mut()) {
                        ok &= substitute_record_fields(&mut a.rhs, &fields, spread.as_ref());
                    }
                }
                Op::Values(v) => {
                    for e in &mut v.exprs {
                        ok &= substitute_record_fields(e, &fields, spread.as_ref());
                    }
                }
                _ => {}
            }
            if ok {
                merged.for_each_expr_mut(&mut |e| walk_expr_mut(e, &mut inline_record_spreads));
                seq[i] = merged;
                seq.remove(i + 1);
            } else {
                i += 1;
            }
        }
    });
    Ok(())
}

/// Appends `path` to an expression, resolving through record expressions
/// where possible. Returns None when the target field can't be determined.
fn add_path_to_expr(expr: Expr, path: &[String]) -> Option<Expr> {
    if path.is_empty() {
        return Some(expr);
    }
    match expr {
        Expr::RecordExpr { elems } => {
            let mut spread: Option<Expr> = None;
            for elem in elems.into_iter().rev() {
                match elem {
                    RecordElem::Field { name, value } => {
                        if name != path[0] {
                            continue;
                        }
                        if spread.is_some() {
                            // A later spread might overwrite the field.
                            return None;
                        }
                        return add_path_to_expr(value, &path[1..]);
                    }
                    RecordElem::Spread { expr } => {
                        if spread.is_some() {
                            return None;
                        }
                        spread = Some(expr);
                    }
                }
            }
            add_path_to_expr(spread?, path)
        }
        Expr::This { path: mut base } => {
            base.extend(path.iter().cloned());
            Some(Expr::This { path: base })
        }
        other => Some(path.iter().fold(other, |e, name| Expr::dot(e, name.clone()))),
    }
}

/// Turns `{...{a}}` into `{a}` and drops fields overwritten later in the
/// same record expression.
fn inline_record_spreads(expr: &mut Expr) {
    let Expr::RecordExpr { elems } = expr else {
        return;
    };
    let mut out = Vec::with_capacity(elems.len());
    for elem in elems.drain(..) {
        match elem {
            RecordElem::Spread {
                expr: Expr::RecordExpr { elems: inner },
            } => out.extend(inner),
            other => out.push(other),
        }
    }
    if out.iter().any(|e| matches!(e, RecordElem::Spread { .. })) {
        *elems = out;
        return;
    }
    // A repeated field keeps its first position and its last value.
    let mut deduped: Vec<RecordElem> = Vec::with_capacity(out.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for elem in out {
        let RecordElem::Field { name, value } = elem else {
            continue;
        };
        match index.get(&name) {
            Some(&i) => deduped[i] = RecordElem::Field { name, value },
            None => {
                index.insert(name.clone(), deduped.len());
                deduped.push(RecordElem::Field { name, value });
            }
        }
    }
    *elems = deduped;
}

fn walk_exprs_records(seq: &mut Seq) {
    crate::dag::walk::walk_exprs(seq, &mut inline_record_spreads);
}

/// Replaces `Sort` followed by `Head` or `Tail` with a bounded `Top`.
fn replace_sort_and_head_or_tail_with_top(seq: &mut Seq) {
    walk_seqs(seq, &mut |seq| {
        let mut i = 0;
        while i + 1 < seq.len() {
            let Op::Sort(sort) = &seq[i] else {
                i += 1;
                continue;
            };
            let mut exprs = sort.exprs.clone();
            let mut reverse = sort.reverse;
            let limit = match &seq[i + 1] {
                Op::Head(h) => h.count,
                Op::Tail(t) => {
                    for e in &mut exprs {
                        e.order = e.order.flip();
                    }
                    reverse = !reverse;
                    t.count
                }
                _ => {
                    i += 1;
                    continue;
                }
            };
            if limit > MAX_TOP_LIMIT {
                i += 1;
                continue;
            }
            let reverse = reverse && exprs.is_empty();
            seq[i] = Op::Top(TopOp {
                limit,
                exprs,
                reverse,
            });
            seq.remove(i + 1);
            i += 1;
        }
    });
}

/// Marks file scans whose output order doesn't matter downstream. Returns
/// whether the input of `seq` may be unordered.
pub fn set_pushdown_unordered(seq: &mut Seq, mut unordered: bool) -> bool {
    for op in seq.iter_mut().rev() {
        match op {
            Op::Aggregate(_)
            | Op::Combine
            | Op::Distinct(_)
            | Op::HashJoin(_)
            | Op::Join(_)
            | Op::Sort(_)
            | Op::Top(_)
            | Op::DefaultScan(_)
            | Op::HttpScan(_)
            | Op::PoolScan(_)
            | Op::CommitMetaScan(_)
            | Op::DbMetaScan(_)
            | Op::PoolMetaScan(_) => unordered = true,
            Op::FileScan(scan) => {
                scan.pushdown.unordered = unordered;
                unordered = true;
            }
            Op::Fork(p) | Op::Scatter(p) => {
                for path in &mut p.paths {
                    set_pushdown_unordered(path, true);
                }
                unordered = true;
            }
            Op::Switch(s) => {
                for case in &mut s.cases {
                    set_pushdown_unordered(&mut case.path, true);
                }
                unordered = true;
            }
            Op::Merge(_) => unordered = false,
            Op::Mirror(m) => unordered = set_pushdown_unordered(&mut m.main, unordered),
            _ => {}
        }
    }
    unordered
}

/// For `count() by <field>`, returns the field name.
pub fn is_count_by_string(op: &Op) -> Option<&str> {
    let Op::Aggregate(agg) = op else {
        return None;
    };
    let ([key], [count]) = (agg.keys.as_slice(), agg.aggs.as_slice()) else {
        return None;
    };
    if !is_count(count) {
        return None;
    }
    match (&key.lhs, &key.rhs) {
        (Expr::This { path: l }, Expr::This { path: r }) if l.len() == 1 && l == r => Some(&l[0]),
        _ => None,
    }
}

fn is_count(a: &Assignment) -> bool {
    let Expr::This { path } = &a.lhs else {
        return false;
    };
    if path.len() != 1 || path[0] != "count" {
        return false;
    }
    matches!(&a.rhs, Expr::Agg { name, expr: None, filter: None, .. } if name == "count")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{AggregateOp, CountArg, FileScan, FilterOp, Pushdown, SortOp, ValuesOp};
    use crate::order::Which;

    fn file_scan() -> Op {
        Op::FileScan(FileScan {
            paths: vec!["a.sup".to_string()],
            format: "sup".to_string(),
            pushdown: Pushdown::default(),
        })
    }

    fn gt(field: &str, n: i64) -> Expr {
        Expr::binary(">", Expr::this([field]), Expr::literal(n.to_string()))
    }

    #[test]
    fn filters_merge_into_scan() {
        let mut main = Main::new(vec![
            file_scan(),
            Op::filter(gt("x", 1)),
            Op::filter(gt("y", 2)),
            Op::Pass,
            Op::output("main"),
        ]);
        Optimizer::new(None, false).optimize(&mut main).unwrap();
        assert_eq!(2, main.body.len());
        let Op::FileScan(scan) = &main.body[0] else { panic!() };
        let filter = scan.pushdown.data_filter.as_ref().unwrap().expr.as_ref().unwrap();
        assert_eq!(Expr::binary("and", gt("x", 1), gt("y", 2)), *filter);
        // Output demands everything.
        assert_eq!(None, scan.pushdown.projection);
        assert!(matches!(main.body[1], Op::Output(_)));
    }

    #[test]
    fn vector_scan_keeps_filter() {
        let mut main = Main::new(vec![file_scan(), Op::filter(gt("x", 1)), Op::output("main")]);
        Optimizer::new(None, true).optimize(&mut main).unwrap();
        assert_eq!(3, main.body.len());
        let Op::FileScan(scan) = &main.body[0] else { panic!() };
        assert!(scan.pushdown.meta_filter.as_ref().unwrap().expr.is_some());
        assert!(scan.pushdown.data_filter.is_none());
        assert!(matches!(main.body[1], Op::Filter(_)));
    }

    #[test]
    fn sort_head_becomes_top() {
        let sort = Op::Sort(SortOp {
            exprs: vec![SortExpr::new(Expr::this(["x"]), Which::Asc, Nulls::Last)],
            reverse: false,
        });
        let mut seq = vec![sort.clone(), Op::Tail(CountArg { count: 2 })];
        replace_sort_and_head_or_tail_with_top(&mut seq);
        let [Op::Top(top)] = seq.as_slice() else { panic!() };
        assert_eq!(2, top.limit);
        assert_eq!(Which::Desc, top.exprs[0].order);
        assert!(!top.reverse);

        let mut seq = vec![sort, Op::head(MAX_TOP_LIMIT + 1)];
        replace_sort_and_head_or_tail_with_top(&mut seq);
        assert_eq!(2, seq.len());
    }

    #[test]
    fn filter_lifts_over_values() {
        let values = Op::Values(ValuesOp {
            exprs: vec![Expr::RecordExpr {
                elems: vec![
                    RecordElem::Spread {
                        expr: Expr::this(Vec::<String>::new()),
                    },
                    RecordElem::Field {
                        name: "y".to_string(),
                        value: Expr::this(["x"]),
                    },
                ],
            }],
        });
        // Only the filter next to the values lifts in one pass.
        let mut seq = vec![values.clone(), Op::filter(gt("y", 1)), Op::filter(gt("z", 2))];
        lift_filter_ops(&mut seq).unwrap();
        assert_eq!(vec![Op::filter(gt("x", 1)), values.clone(), Op::filter(gt("z", 2))], seq);

        // Merged first, both predicates lift.
        let mut seq = vec![values, Op::filter(gt("y", 1)), Op::filter(gt("z", 2))];
        merge_filters(&mut seq);
        lift_filter_ops(&mut seq).unwrap();
        let Op::Filter(FilterOp { expr }) = &seq[0] else { panic!("{seq:?}") };
        assert_eq!(Expr::binary("and", gt("x", 1), gt("z", 2)), *expr);
        assert!(matches!(seq[1], Op::Values(_)));
    }

    #[test]
    fn values_merge_into_aggregate() {
        let values = Op::Values(ValuesOp {
            exprs: vec![Expr::RecordExpr {
                elems: vec![RecordElem::Field {
                    name: "k".to_string(),
                    value: Expr::this(["a", "b"]),
                }],
            }],
        });
        let agg = Op::Aggregate(AggregateOp {
            keys: vec![Assignment::new(Expr::this(["k"]), Expr::this(["k"]))],
            aggs: vec![Assignment::new(
                Expr::this(["c"]),
                Expr::agg("count", Some(Expr::this(["q"]))),
            )],
            ..Default::default()
        });
        let mut seq = vec![values, agg];
        merge_values_ops(&mut seq).unwrap();
        let [Op::Aggregate(agg)] = seq.as_slice() else { panic!() };
        assert_eq!(Expr::this(["a", "b"]), agg.keys[0].rhs);
        assert_eq!(
            Expr::agg("count", Some(Expr::literal("error(\"missing\")"))),
            agg.aggs[0].rhs
        );
    }

    #[test]
    fn spreads_inline() {
        let mut e = Expr::RecordExpr {
            elems: vec![
                RecordElem::Field {
                    name: "a".to_string(),
                    value: Expr::literal("1"),
                },
                RecordElem::Spread {
                    expr: Expr::RecordExpr {
                        elems: vec![RecordElem::Field {
                            name: "a".to_string(),
                            value: Expr::literal("2"),
                        }],
                    },
                },
            ],
        };
        inline_record_spreads(&mut e);
        assert_eq!(
            Expr::RecordExpr {
                elems: vec![RecordElem::Field {
                    name: "a".to_string(),
                    value: Expr::literal("2"),
                }]
            },
            e
        );
    }

    #[test]
    fn count_by_string() {
        let op = Op::Aggregate(AggregateOp {
            keys: vec![Assignment::new(Expr::this(["s"]), Expr::this(["s"]))],
            aggs: vec![Assignment::new(Expr::this(["count"]), Expr::agg("count", None))],
            ..Default::default()
        });
        assert_eq!(Some("s"), is_count_by_string(&op));
        assert_eq!(None, is_count_by_string(&Op::Pass));
    }

    #[test]
    fn deleter_shape() {
        let mut main = Main::new(vec![Op::Pass]);
        let err = Optimizer::new(None, false)
            .optimize_deleter(&mut main, 2)
            .unwrap_err();
        assert_eq!("invalid delete where query", err.to_string());
    }

    #[test]
    fn pool_scan_requires_lake() {
        let mut main = Main::new(vec![
            Op::PoolScan(crate::dag::PoolScan {
                id: uuid::Uuid::new_v4(),
                commit: uuid::Uuid::new_v4(),
            }),
            Op::output("main"),
        ]);
        let err = Optimizer::new(None, false).optimize(&mut main).unwrap_err();
        assert!(err.to_string().contains("database operating context"));
    }
}
