//! Columnar operators, sources and expressions.
//!
//! Operators without a columnar form run on the row runtime between a
//! materializer and a dematerializer.
use superdb_error::{DbError, Result};
use tracing::debug;

use super::scalar::renames;
use super::{Builder, Lane, lval};
use crate::dag::walk::this_paths;
use crate::dag::{Assignment, Expr, Op, RecordElem, SwitchOp};
use crate::runtime::expr::binary::{ArithOp, CompareOp};
use crate::runtime::op::{CutEval, DropEval, PutEval, RenameEval, Router};
use crate::runtime::BoxPuller;
use crate::value::Value;
use crate::vector::expr::{
    BoxVecEval, Logic, SlotEval, VecArith, VecCompare, VecConditional, VecDot, VecIsNull, VecLiteral, VecLogic,
    VecNot, VecRecordElem, VecRecordExpr, VecThis,
};
use crate::vector::op::{
    VecAggregate, VecAggregator, VecApplier, VecCaseRouter, VecCutEval, VecDistinct, VecDropEval, VecExprSwitch,
    VecFilterEval, VecPutEval, VecRenameEval, VecUnnest, VecValues,
};
use crate::vector::scan::{MetaFilter, VecFileScan};
use crate::vector::{Dematerializer, Materializer, Vector};

impl Builder {
    pub(crate) fn vector_op(&mut self, op: &Op, parent: BoxPuller<Vector>) -> Result<BoxPuller<Vector>> {
        let ctx = self.ctx().clone();
        let resetters = self.fresh_resetters();
        Ok(match op {
            Op::Filter(filter) => {
                let pred = self.vexpr(&filter.expr)?;
                Box::new(VecApplier::new(parent, Box::new(VecFilterEval::new(ctx, pred)), resetters))
            }
            Op::Put(put) => {
                let columns = self.vassignments(&put.args)?;
                let rows = Box::new(PutEval::new(ctx.clone(), self.assignments(&put.args)?));
                Box::new(VecApplier::new(parent, Box::new(VecPutEval::new(ctx, columns, rows)), resetters))
            }
            Op::Cut(cut) => {
                let columns = self.vassignments(&cut.args)?;
                let rows = Box::new(CutEval::new(ctx.clone(), self.assignments(&cut.args)?));
                Box::new(VecApplier::new(parent, Box::new(VecCutEval::new(ctx, columns, rows)), resetters))
            }
            Op::Drop(drop) => {
                let paths = drop.args.iter().map(lval).collect::<Result<Vec<_>>>()?;
                let rows = Box::new(DropEval::new(ctx.clone(), paths.clone()));
                Box::new(VecApplier::new(parent, Box::new(VecDropEval::new(ctx, paths, rows)), resetters))
            }
            Op::Rename(rename) => {
                let renames = renames(&rename.args)?;
                let rows = Box::new(RenameEval::new(ctx.clone(), renames.clone()));
                Box::new(VecApplier::new(parent, Box::new(VecRenameEval::new(ctx, renames, rows)), resetters))
            }
            Op::Values(values) => {
                let exprs = values.exprs.iter().map(|e| self.vexpr(e)).collect::<Result<Vec<_>>>()?;
                Box::new(VecValues::new(parent, exprs, resetters))
            }
            Op::Distinct(distinct) => Box::new(VecDistinct::new(parent, self.vexpr(&distinct.expr)?)),
            Op::Aggregate(agg) if agg.limit == 0 && agg.input_sort_dir == 0 => {
                let keys = self.vassignments(&agg.keys)?;
                let aggs = agg
                    .aggs
                    .iter()
                    .map(|a| Ok((lval(&a.lhs)?, self.vaggregator(&a.rhs)?)))
                    .collect::<Result<Vec<_>>>()?;
                Box::new(VecAggregate::new(
                    self.rctx().clone(),
                    parent,
                    keys,
                    aggs,
                    agg.partials_in,
                    agg.partials_out,
                ))
            }
            _ => {
                debug!(op = op.kind(), "row operator in vector plan");
                let rows = self.scalar_op(op, Box::new(Materializer::new(parent)))?;
                Box::new(Dematerializer::new(rows))
            }
        })
    }

    pub(crate) fn vector_source(
        &mut self,
        op: &Op,
        parent: Option<BoxPuller<Vector>>,
        split: Option<usize>,
    ) -> Result<Vec<BoxPuller<Vector>>> {
        let Op::FileScan(scan) = op else {
            let parent = parent.map(Vector::into_batches);
            return Ok(self
                .scalar_source(op, parent, split)?
                .into_iter()
                .map(Vector::from_batches)
                .collect());
        };
        let opts = self.reader_options(&scan.format)?;
        let filter = scan.pushdown.data_filter.as_ref().and_then(|f| f.expr.as_ref());
        let pushdown = self.pushdown(scan.pushdown.projection.clone(), filter)?;
        let meta = match scan.pushdown.meta_filter.as_ref().and_then(|f| f.expr.as_ref()) {
            Some(expr) => Some(MetaFilter::new(metadata_paths(expr), self.expr(expr)?)),
            None => None,
        };
        let file = VecFileScan::new(self.rctx().clone(), &scan.paths, opts, pushdown, meta, self.meter().clone())?;
        Ok(match split {
            Some(n) => file
                .split(n)
                .into_iter()
                .map(|s| Box::new(s) as BoxPuller<Vector>)
                .collect(),
            None => vec![Box::new(file)],
        })
    }

    pub(crate) fn vector_router(&mut self, op: &SwitchOp) -> Result<Box<dyn Router<Vector>>> {
        match &op.expr {
            Some(expr) => {
                let cases = self.switch_constants(op)?;
                Ok(Box::new(VecExprSwitch::new(self.vexpr(expr)?, cases)))
            }
            None => {
                let mut cases = Vec::with_capacity(op.cases.len());
                for case in &op.cases {
                    cases.push(match &case.expr {
                        Some(e) => self.vexpr(e)?,
                        None => Box::new(VecLiteral(Value::from_bool(true))) as BoxVecEval,
                    });
                }
                Ok(Box::new(VecCaseRouter::new(cases)))
            }
        }
    }

    pub(crate) fn vector_unnest(&mut self, expr: &Expr, parent: BoxPuller<Vector>) -> Result<BoxPuller<Vector>> {
        let expr = self.vexpr(expr)?;
        Ok(Box::new(VecUnnest::new(self.ctx().clone(), parent, expr)))
    }

    /// Compiles an expression to a vector kernel, evaluating slot by slot
    /// through the row evaluator where no kernel exists.
    pub(crate) fn vexpr(&mut self, e: &Expr) -> Result<BoxVecEval> {
        let ctx = self.ctx().clone();
        Ok(match e {
            Expr::This { path } => Box::new(VecThis::new(ctx, path.clone())),
            Expr::Dot { lhs, rhs } => Box::new(VecDot::new(ctx, self.vexpr(lhs)?, rhs.clone())),
            Expr::Literal { value } => Box::new(VecLiteral(self.literal(value)?)),
            Expr::IsNullExpr { expr } => Box::new(VecIsNull(self.vexpr(expr)?)),
            Expr::UnaryExpr { op, operand } if op == "!" => Box::new(VecNot::new(ctx, self.vexpr(operand)?)),
            Expr::Conditional { cond, then, otherwise } => Box::new(VecConditional::new(
                ctx,
                self.vexpr(cond)?,
                self.vexpr(then)?,
                self.vexpr(otherwise)?,
            )),
            Expr::BinaryExpr { op, lhs, rhs } => match op.as_str() {
                "and" => Box::new(VecLogic::new(ctx, Logic::And, self.vexpr(lhs)?, self.vexpr(rhs)?)),
                "or" => Box::new(VecLogic::new(ctx, Logic::Or, self.vexpr(lhs)?, self.vexpr(rhs)?)),
                op => match (CompareOp::parse(op), ArithOp::parse(op)) {
                    (Some(cmp), _) => Box::new(VecCompare::new(cmp, self.vexpr(lhs)?, self.vexpr(rhs)?)),
                    (_, Some(arith)) => Box::new(VecArith::new(ctx, arith, self.vexpr(lhs)?, self.vexpr(rhs)?)),
                    _ => Box::new(SlotEval(self.expr(e)?)),
                },
            },
            Expr::RecordExpr { elems } => {
                let elems = elems
                    .iter()
                    .map(|elem| {
                        Ok(match elem {
                            RecordElem::Field { name, value } => VecRecordElem::Field(name.clone(), self.vexpr(value)?),
                            RecordElem::Spread { expr } => VecRecordElem::Spread(self.vexpr(expr)?),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Box::new(VecRecordExpr::new(ctx, elems))
            }
            _ => Box::new(SlotEval(self.expr(e)?)),
        })
    }

    fn vassignments(&mut self, args: &[Assignment]) -> Result<Vec<(Vec<String>, BoxVecEval)>> {
        args.iter()
            .map(|a| Ok((lval(&a.lhs)?, self.vexpr(&a.rhs)?)))
            .collect()
    }

    fn vaggregator(&mut self, e: &Expr) -> Result<VecAggregator> {
        let Expr::Agg {
            name,
            distinct,
            expr,
            filter,
        } = e
        else {
            return Err(DbError::new("aggregate: expected an aggregate function"));
        };
        let expr = expr.as_deref().map(|e| self.vexpr(e)).transpose()?;
        let filter = filter.as_deref().map(|e| self.vexpr(e)).transpose()?;
        VecAggregator::new(name, *distinct, expr, filter)
    }
}

/// The field paths whose `{min, max}` ranges a metadata selector reads.
fn metadata_paths(expr: &Expr) -> Vec<Vec<String>> {
    let mut out: Vec<Vec<String>> = Vec::new();
    for mut path in this_paths(expr) {
        if matches!(path.last().map(String::as_str), Some("min" | "max")) {
            path.pop();
        }
        if !path.is_empty() && !out.contains(&path) {
            out.push(path);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::super::testutil::run_plan;
    use super::*;
    use crate::dag::{AggregateOp, DefaultScan, Main};

    fn sum_by(key: &str, field: &str) -> Op {
        Op::Aggregate(AggregateOp {
            keys: vec![Assignment::new(Expr::this([key]), Expr::this([key]))],
            aggs: vec![Assignment::new(
                Expr::this(["sum"]),
                Expr::Agg {
                    name: "sum".to_string(),
                    distinct: false,
                    expr: Some(Box::new(Expr::this([field]))),
                    filter: None,
                },
            )],
            ..Default::default()
        })
    }

    #[test]
    fn metadata_paths_strip_ranges() {
        let expr = Expr::binary(
            "and",
            Expr::binary(">=", Expr::this(["a", "max"]), Expr::literal("1")),
            Expr::binary("<=", Expr::this(["a", "min"]), Expr::literal("5")),
        );
        assert_eq!(vec![vec!["a".to_string()]], metadata_paths(&expr));
    }

    #[test]
    fn aggregate_runs_on_both_runtimes() {
        let main = Main::new(vec![Op::DefaultScan(DefaultScan::default()), sum_by("a", "b")]);
        let input = "{a:1,b:2} {a:1,b:3} {a:2,b:4}";
        let want = vec!["{a:1,sum:5}", "{a:2,sum:4}"];
        assert_eq!(want, run_plan(&main, input, false).unwrap());
        assert_eq!(want, run_plan(&main, input, true).unwrap());
    }

    #[test]
    fn row_operators_bridge() {
        let main = Main::new(vec![
            Op::DefaultScan(DefaultScan::default()),
            Op::Sort(crate::dag::SortOp {
                exprs: vec![crate::dag::SortExpr::new(
                    Expr::this(["x"]),
                    crate::order::Which::Desc,
                    crate::order::Nulls::Last,
                )],
                reverse: false,
            }),
        ]);
        assert_eq!(vec!["{x:3}", "{x:2}", "{x:1}"], run_plan(&main, "{x:2} {x:3} {x:1}", true).unwrap());
    }
}
