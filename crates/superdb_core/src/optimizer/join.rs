//! Join normalization.
use crate::dag::walk::{walk_expr_mut, walk_ops, walk_seqs};
use crate::dag::{Expr, HashJoinOp, Op, RecordElem, Seq, join_and, split_and};

/// Replaces joins on equality conditions between the two aliases with hash
/// joins. Several conditions become record keys `{c0, c1, ...}`.
pub fn replace_join_with_hash_join(seq: &mut Seq) {
    walk_ops(seq, &mut |op| {
        let Op::Join(join) = op else {
            return;
        };
        let Some(cond) = &join.cond else {
            return;
        };
        let mut lefts = Vec::new();
        let mut rights = Vec::new();
        for e in split_and(cond.clone()) {
            let Some((l, r)) = equi_join_key_exprs(e, &join.left_alias, &join.right_alias) else {
                return;
            };
            lefts.push(l);
            rights.push(r);
        }
        let (left_key, right_key) = if lefts.len() == 1 {
            (lefts.remove(0), rights.remove(0))
        } else {
            (build_tuple(lefts), build_tuple(rights))
        };
        let style = match join.style.as_str() {
            "cross" => "inner".to_string(),
            other => other.to_string(),
        };
        *op = Op::HashJoin(HashJoinOp {
            style,
            left_alias: join.left_alias.clone(),
            right_alias: join.right_alias.clone(),
            left_key,
            right_key,
        });
    });
}

fn build_tuple(exprs: Vec<Expr>) -> Expr {
    Expr::RecordExpr {
        elems: exprs
            .into_iter()
            .enumerate()
            .map(|(i, value)| RecordElem::Field {
                name: format!("c{i}"),
                value,
            })
            .collect(),
    }
}

fn equi_join_key_exprs(e: Expr, left_alias: &str, right_alias: &str) -> Option<(Expr, Expr)> {
    let Expr::BinaryExpr { op, lhs, rhs } = e else {
        return None;
    };
    if op != "==" {
        return None;
    }
    let (mut lhs, mut rhs) = (*lhs, *rhs);
    let mut lhs_first = first_this_path_component(&lhs)?;
    let mut rhs_first = first_this_path_component(&rhs)?;
    if lhs_first != left_alias {
        std::mem::swap(&mut lhs_first, &mut rhs_first);
        std::mem::swap(&mut lhs, &mut rhs);
    }
    if lhs_first != left_alias || rhs_first != right_alias {
        return None;
    }
    strip_first_this_path_component(&mut lhs);
    strip_first_this_path_component(&mut rhs);
    Some((lhs, rhs))
}

/// The first path component shared by every `this` in `e`, if any.
fn first_this_path_component(e: &Expr) -> Option<String> {
    let mut prefix: Option<String> = None;
    let mut ok = true;
    let mut e = e.clone();
    walk_expr_mut(&mut e, &mut |e| {
        if let Expr::This { path } = e {
            match (path.first(), &prefix) {
                (None, _) => ok = false,
                (Some(first), None) => prefix = Some(first.clone()),
                (Some(first), Some(p)) if first != p => ok = false,
                _ => {}
            }
        }
    });
    if ok { prefix } else { None }
}

fn strip_first_this_path_component(e: &mut Expr) {
    walk_expr_mut(e, &mut |e| {
        if let Expr::This { path } = e {
            if !path.is_empty() {
                path.remove(0);
            }
        }
    });
}

/// Pushes conjuncts of a filter that follows a join and references only
/// one side of it into that side's path.
pub fn join_filter_pullup(seq: &mut Seq) {
    super::merge_filters(seq);
    walk_seqs(seq, &mut |seq| {
        let mut i = 0;
        while i + 2 < seq.len() {
            if pullup_at(seq, i) {
                continue;
            }
            i += 1;
        }
    });
}

/// Returns true when the filter at `i + 2` was removed.
fn pullup_at(seq: &mut Seq, i: usize) -> bool {
    let (left_alias, right_alias) = match &seq[i + 1] {
        Op::Join(j) => (j.left_alias.clone(), j.right_alias.clone()),
        Op::HashJoin(j) => (j.left_alias.clone(), j.right_alias.clone()),
        _ => return false,
    };
    let Op::Fork(fork) = &seq[i] else {
        return false;
    };
    if fork.paths.len() != 2 {
        return false;
    }
    let Op::Filter(filter) = &seq[i + 2] else {
        return false;
    };
    let conjuncts = split_and(filter.expr.clone());
    let total = conjuncts.len();
    let mut remaining = Vec::new();
    let mut lifted: [Vec<Expr>; 2] = [Vec::new(), Vec::new()];
    for e in conjuncts {
        if let Some(l) = pullup_expr(&left_alias, &e) {
            lifted[0].push(l);
        } else if let Some(r) = pullup_expr(&right_alias, &e) {
            lifted[1].push(r);
        } else {
            remaining.push(e);
        }
    }
    if remaining.len() == total {
        return false;
    }
    if let Op::Fork(fork) = &mut seq[i] {
        for (path, exprs) in fork.paths.iter_mut().zip(lifted) {
            if let Some(pred) = join_and(exprs) {
                path.push(Op::filter(pred));
            }
        }
        for path in &mut fork.paths {
            super::merge_filters(path);
        }
    }
    match join_and(remaining) {
        Some(pred) => {
            seq[i + 2] = Op::filter(pred);
            false
        }
        None => {
            seq.remove(i + 2);
            true
        }
    }
}

/// Rewrites a predicate over `alias.x` into one over `x`, when it compares
/// fields of that alias only with literals.
fn pullup_expr(alias: &str, e: &Expr) -> Option<Expr> {
    let Expr::BinaryExpr { op, lhs, rhs } = e else {
        return None;
    };
    if op == "and" || op == "or" {
        let l = pullup_expr(alias, lhs)?;
        let r = pullup_expr(alias, rhs)?;
        return Some(Expr::binary(op.clone(), l, r));
    }
    if !matches!(op.as_str(), "==" | "!=" | "<" | "<=" | ">" | ">=") {
        return None;
    }
    let strip = |e: &Expr| -> Option<Expr> {
        match e {
            Expr::This { path } if path.len() > 1 && path[0] == alias => Some(Expr::This {
                path: path[1..].to_vec(),
            }),
            _ => None,
        }
    };
    match (lhs.as_ref(), rhs.as_ref()) {
        (this, lit @ Expr::Literal { .. }) => Some(Expr::binary(op.clone(), strip(this)?, lit.clone())),
        (lit @ Expr::Literal { .. }, this) => Some(Expr::binary(op.clone(), lit.clone(), strip(this)?)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{JoinOp, PathsOp};

    fn join(cond: Expr) -> Op {
        Op::Join(JoinOp {
            style: "cross".to_string(),
            left_alias: "l".to_string(),
            right_alias: "r".to_string(),
            cond: Some(cond),
        })
    }

    #[test]
    fn equi_join_becomes_hash_join() {
        let cond = Expr::binary(
            "and",
            Expr::binary("==", Expr::this(["r", "id"]), Expr::this(["l", "rid"])),
            Expr::binary("==", Expr::this(["l", "a"]), Expr::this(["r", "b"])),
        );
        let mut seq = vec![join(cond)];
        replace_join_with_hash_join(&mut seq);
        let Op::HashJoin(hj) = &seq[0] else { panic!("{seq:?}") };
        assert_eq!("inner", hj.style);
        assert_eq!(
            build_tuple(vec![Expr::this(["rid"]), Expr::this(["a"])]),
            hj.left_key
        );
        assert_eq!(
            build_tuple(vec![Expr::this(["id"]), Expr::this(["b"])]),
            hj.right_key
        );
    }

    #[test]
    fn non_equi_join_kept() {
        let cond = Expr::binary("<", Expr::this(["l", "a"]), Expr::this(["r", "b"]));
        let mut seq = vec![join(cond)];
        replace_join_with_hash_join(&mut seq);
        assert!(matches!(seq[0], Op::Join(_)));
    }

    #[test]
    fn filter_pulled_into_join_side() {
        let cond = Expr::binary("==", Expr::this(["l", "a"]), Expr::this(["r", "b"]));
        let filter = Expr::binary(
            "and",
            Expr::binary(">", Expr::this(["l", "x"]), Expr::literal("1")),
            Expr::binary("==", Expr::this(["l", "y"]), Expr::this(["r", "y"])),
        );
        let mut seq = vec![
            Op::Fork(PathsOp {
                paths: vec![vec![Op::Pass], vec![Op::Pass]],
            }),
            join(cond),
            Op::filter(filter),
        ];
        join_filter_pullup(&mut seq);
        let Op::Fork(fork) = &seq[0] else { panic!() };
        assert_eq!(
            Op::filter(Expr::binary(">", Expr::this(["x"]), Expr::literal("1"))),
            fork.paths[0][1]
        );
        assert_eq!(1, fork.paths[1].len());
        assert_eq!(
            Op::filter(Expr::binary("==", Expr::this(["l", "y"]), Expr::this(["r", "y"]))),
            seq[2]
        );
    }
}
