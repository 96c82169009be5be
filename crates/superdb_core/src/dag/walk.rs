//! Hand-written traversals over plan trees.
use superdb_error::Result;

use super::{Expr, Op, RecordElem, Seq, VectorElem};

impl Expr {
    /// Calls `f` on each direct child expression. Subquery bodies are plans of
    /// their own and are not children.
    pub fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        match self {
            Expr::Agg { expr, filter, .. } => {
                if let Some(e) = expr {
                    f(e);
                }
                if let Some(e) = filter {
                    f(e);
                }
            }
            Expr::ArrayExpr { elems } | Expr::SetExpr { elems } => {
                for elem in elems {
                    match elem {
                        VectorElem::Spread { expr } | VectorElem::VectorValue { expr } => f(expr),
                    }
                }
            }
            Expr::BinaryExpr { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Expr::Call { args, .. } | Expr::CallParam { args, .. } => args.iter_mut().for_each(f),
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                f(cond);
                f(then);
                f(otherwise);
            }
            Expr::Dot { lhs, .. } => f(lhs),
            Expr::IndexExpr { expr, index } => {
                f(expr);
                f(index);
            }
            Expr::IsNullExpr { expr }
            | Expr::RegexpMatch { expr, .. }
            | Expr::RegexpSearch { expr, .. }
            | Expr::Search { expr, .. } => f(expr),
            Expr::MapCall { expr, inner } => {
                f(expr);
                f(inner);
            }
            Expr::MapExpr { entries } => {
                for entry in entries {
                    f(&mut entry.key);
                    f(&mut entry.value);
                }
            }
            Expr::RecordExpr { elems } => {
                for elem in elems {
                    match elem {
                        RecordElem::Field { value, .. } => f(value),
                        RecordElem::Spread { expr } => f(expr),
                    }
                }
            }
            Expr::SliceExpr { expr, from, to } => {
                f(expr);
                if let Some(e) = from {
                    f(e);
                }
                if let Some(e) = to {
                    f(e);
                }
            }
            Expr::UnaryExpr { operand, .. } => f(operand),
            Expr::BadExpr
            | Expr::FuncRef { .. }
            | Expr::Literal { .. }
            | Expr::Subquery { .. }
            | Expr::This { .. } => {}
        }
    }

    pub fn for_each_child(&self, f: &mut dyn FnMut(&Expr)) {
        match self {
            Expr::Agg { expr, filter, .. } => {
                expr.iter().for_each(|e| f(e));
                filter.iter().for_each(|e| f(e));
            }
            Expr::ArrayExpr { elems } | Expr::SetExpr { elems } => {
                for elem in elems {
                    match elem {
                        VectorElem::Spread { expr } | VectorElem::VectorValue { expr } => f(expr),
                    }
                }
            }
            Expr::BinaryExpr { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Expr::Call { args, .. } | Expr::CallParam { args, .. } => args.iter().for_each(f),
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                f(cond);
                f(then);
                f(otherwise);
            }
            Expr::Dot { lhs, .. } => f(lhs),
            Expr::IndexExpr { expr, index } => {
                f(expr);
                f(index);
            }
            Expr::IsNullExpr { expr }
            | Expr::RegexpMatch { expr, .. }
            | Expr::RegexpSearch { expr, .. }
            | Expr::Search { expr, .. } => f(expr),
            Expr::MapCall { expr, inner } => {
                f(expr);
                f(inner);
            }
            Expr::MapExpr { entries } => {
                for entry in entries {
                    f(&entry.key);
                    f(&entry.value);
                }
            }
            Expr::RecordExpr { elems } => {
                for elem in elems {
                    match elem {
                        RecordElem::Field { value, .. } => f(value),
                        RecordElem::Spread { expr } => f(expr),
                    }
                }
            }
            Expr::SliceExpr { expr, from, to } => {
                f(expr);
                from.iter().for_each(|e| f(e));
                to.iter().for_each(|e| f(e));
            }
            Expr::UnaryExpr { operand, .. } => f(operand),
            Expr::BadExpr
            | Expr::FuncRef { .. }
            | Expr::Literal { .. }
            | Expr::Subquery { .. }
            | Expr::This { .. } => {}
        }
    }

    /// Whether any node of the expression tree satisfies `pred`.
    pub fn any(&self, pred: &mut dyn FnMut(&Expr) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        let mut found = false;
        self.for_each_child(&mut |child| {
            if !found {
                found = child.any(pred);
            }
        });
        found
    }
}

/// Post-order rewrite: children first, then `f` on the node itself.
pub fn walk_expr_mut(expr: &mut Expr, f: &mut dyn FnMut(&mut Expr)) {
    expr.for_each_child_mut(&mut |child| walk_expr_mut(child, f));
    f(expr);
}

/// Every `This` path of an expression.
pub fn this_paths(expr: &Expr) -> Vec<Vec<String>> {
    let mut out = Vec::new();
    collect_this(expr, &mut out);
    out
}

fn collect_this(expr: &Expr, out: &mut Vec<Vec<String>>) {
    if let Expr::This { path } = expr {
        out.push(path.clone());
    }
    expr.for_each_child(&mut |child| collect_this(child, out));
}

impl Op {
    /// Calls `f` on each expression slot of the operator itself. Nested
    /// sequences are not visited.
    pub fn for_each_expr_mut(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        match self {
            Op::Aggregate(op) => {
                for a in op.keys.iter_mut().chain(op.aggs.iter_mut()) {
                    f(&mut a.lhs);
                    f(&mut a.rhs);
                }
            }
            Op::Cut(op) | Op::Put(op) | Op::Rename(op) => {
                for a in &mut op.args {
                    f(&mut a.lhs);
                    f(&mut a.rhs);
                }
            }
            Op::Count(op) => {
                if let Some(e) = &mut op.expr {
                    f(e);
                }
            }
            Op::Distinct(op) => f(&mut op.expr),
            Op::Drop(op) => op.args.iter_mut().for_each(f),
            Op::Explode(op) => op.args.iter_mut().for_each(f),
            Op::Filter(op) => f(&mut op.expr),
            Op::HashJoin(op) => {
                f(&mut op.left_key);
                f(&mut op.right_key);
            }
            Op::Join(op) => {
                if let Some(e) = &mut op.cond {
                    f(e);
                }
            }
            Op::Merge(op) => op.exprs.iter_mut().for_each(|s| f(&mut s.key)),
            Op::Sort(op) => op.exprs.iter_mut().for_each(|s| f(&mut s.key)),
            Op::Top(op) => op.exprs.iter_mut().for_each(|s| f(&mut s.key)),
            Op::Switch(op) => {
                if let Some(e) = &mut op.expr {
                    f(e);
                }
                for c in &mut op.cases {
                    if let Some(e) = &mut c.expr {
                        f(e);
                    }
                }
            }
            Op::Unnest(op) => f(&mut op.expr),
            Op::Values(op) => op.exprs.iter_mut().for_each(f),
            Op::CommitMetaScan(op) => {
                if let Some(e) = &mut op.key_pruner {
                    f(e);
                }
            }
            Op::DefaultScan(op) => {
                if let Some(e) = &mut op.filter {
                    f(e);
                }
            }
            Op::DeleterScan(op) => {
                for e in op.filter.iter_mut().chain(op.key_pruner.iter_mut()) {
                    f(e);
                }
            }
            Op::FileScan(op) => {
                let pd = &mut op.pushdown;
                for sf in pd.data_filter.iter_mut().chain(pd.meta_filter.iter_mut()) {
                    if let Some(e) = &mut sf.expr {
                        f(e);
                    }
                }
            }
            Op::ListerScan(op) => {
                if let Some(e) = &mut op.key_pruner {
                    f(e);
                }
            }
            Op::RobotScan(op) => {
                f(&mut op.expr);
                if let Some(e) = &mut op.filter {
                    f(e);
                }
            }
            Op::SeqScan(op) => {
                for e in op.filter.iter_mut().chain(op.key_pruner.iter_mut()) {
                    f(e);
                }
            }
            Op::Combine
            | Op::Fork(_)
            | Op::Fuse
            | Op::Head(_)
            | Op::Load(_)
            | Op::Mirror(_)
            | Op::Output(_)
            | Op::Pass
            | Op::Scatter(_)
            | Op::Scope(_)
            | Op::Skip(_)
            | Op::Slicer
            | Op::Tail(_)
            | Op::Uniq(_)
            | Op::DbMetaScan(_)
            | Op::DeleteScan(_)
            | Op::HttpScan(_)
            | Op::NullScan
            | Op::PoolMetaScan(_)
            | Op::PoolScan(_) => {}
        }
    }

    /// Calls `f` on each sequence nested directly in the operator.
    pub fn for_each_seq_mut(&mut self, f: &mut dyn FnMut(&mut Seq)) {
        match self {
            Op::Fork(op) | Op::Scatter(op) => op.paths.iter_mut().for_each(f),
            Op::Mirror(op) => {
                f(&mut op.main);
                f(&mut op.mirror);
            }
            Op::Scope(op) => f(&mut op.body),
            Op::Switch(op) => op.cases.iter_mut().for_each(|c| f(&mut c.path)),
            Op::Unnest(op) => {
                if let Some(body) = &mut op.body {
                    f(body);
                }
            }
            _ => {}
        }
    }
}

/// Applies `post` to every sequence in the tree, innermost first, including
/// subquery bodies and the root.
pub fn walk_seqs(seq: &mut Seq, post: &mut dyn FnMut(&mut Seq)) {
    for op in seq.iter_mut() {
        op.for_each_seq_mut(&mut |inner| walk_seqs(inner, post));
        op.for_each_expr_mut(&mut |e| walk_subqueries(e, post));
    }
    post(seq);
}

fn walk_subqueries(expr: &mut Expr, post: &mut dyn FnMut(&mut Seq)) {
    if let Expr::Subquery { body, .. } = expr {
        walk_seqs(body, post);
    }
    expr.for_each_child_mut(&mut |child| walk_subqueries(child, post));
}

/// Applies `post` to every operator in the tree, nested ones first.
pub fn walk_ops(seq: &mut Seq, post: &mut dyn FnMut(&mut Op)) {
    walk_seqs(seq, &mut |s| s.iter_mut().for_each(&mut *post));
}

/// Applies `post` to every expression of every operator in the tree.
pub fn walk_exprs(seq: &mut Seq, post: &mut dyn FnMut(&mut Expr)) {
    walk_ops(seq, &mut |op| op.for_each_expr_mut(&mut |e| walk_expr_mut(e, post)));
}

/// Visits the parallel and unnest structure of a sequence, calling `post`
/// on each nested sequence and then on `seq`. `over` controls whether
/// unnest bodies are entered.
pub fn walk(seq: &mut Seq, over: bool, post: &mut dyn FnMut(&mut Seq)) {
    for op in seq.iter_mut() {
        match op {
            Op::Unnest(u) => {
                if over {
                    if let Some(body) = &mut u.body {
                        walk(body, over, post);
                    }
                }
            }
            Op::Fork(p) | Op::Scatter(p) => {
                for path in &mut p.paths {
                    walk(path, over, post);
                }
            }
            Op::Mirror(m) => {
                walk(&mut m.main, over, post);
                walk(&mut m.mirror, over, post);
            }
            _ => {}
        }
    }
    post(seq);
}

/// Like [`walk`] over parallel structure only, with a fallible visitor.
/// Each visited sequence is a potential entry path starting at a source.
pub fn walk_entries(seq: &mut Seq, post: &mut dyn FnMut(&mut Seq) -> Result<()>) -> Result<()> {
    for op in seq.iter_mut() {
        match op {
            Op::Fork(p) | Op::Scatter(p) => {
                for path in &mut p.paths {
                    walk_entries(path, post)?;
                }
            }
            Op::Mirror(m) => {
                walk_entries(&mut m.main, post)?;
                walk_entries(&mut m.mirror, post)?;
            }
            _ => {}
        }
    }
    post(seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{FilterOp, PathsOp, ValuesOp};

    #[test]
    fn walk_exprs_reaches_nested_paths() {
        let mut seq = vec![
            Op::Fork(PathsOp {
                paths: vec![vec![Op::Filter(FilterOp {
                    expr: Expr::this(["a"]),
                })]],
            }),
            Op::Values(ValuesOp {
                exprs: vec![Expr::binary("+", Expr::this(["b"]), Expr::literal("1"))],
            }),
        ];
        let mut seen = Vec::new();
        walk_exprs(&mut seq, &mut |e| {
            if let Expr::This { path } = e {
                seen.push(path.join("."));
            }
        });
        assert_eq!(vec!["a", "b"], seen);
    }

    #[test]
    fn this_paths_in_order() {
        let e = Expr::binary(
            "and",
            Expr::this(["x", "y"]),
            Expr::dot(Expr::this(["z"]), "w"),
        );
        assert_eq!(
            vec![vec!["x".to_string(), "y".to_string()], vec!["z".to_string()]],
            this_paths(&e)
        );
    }

    #[test]
    fn any_finds_subquery() {
        let e = Expr::binary(
            "==",
            Expr::this(["a"]),
            Expr::Subquery {
                correlated: false,
                body: Vec::new(),
            },
        );
        assert!(e.any(&mut |e| matches!(e, Expr::Subquery { .. })));
        assert!(!e.any(&mut |e| matches!(e, Expr::Literal { .. })));
    }
}
