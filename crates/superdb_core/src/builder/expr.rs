//! Expression compilation for the row runtime.
use std::sync::Arc;

use indexmap::IndexMap;
use superdb_error::{DbError, Result};
use tracing::trace;

use super::{BuildEnv, Builder};
use crate::dag::{Expr, FuncDef, RecordElem, Seq, VectorElem};
use crate::runtime::expr::binary::{And, Arith, ArithOp, Compare, CompareConst, CompareOp, ContainsConst, In, Negate, Not, Or};
use crate::runtime::expr::function::{Call, Udf, UdfCall, is_builtin, lookup_function};
use crate::runtime::expr::search::{RegexpMatch, RegexpSearch, Search};
use crate::runtime::expr::{
    AggExpr, Aggregator, BoxEval, Conditional, Dot, Index, IsNull, Literal, MapCall, MapExpr,
    RecordElemEval, RecordExpr, SequenceExpr, Slice, This, VectorElemEval,
};
use crate::runtime::op::{BodyFactory, CachedSubquery, Feeder, Subquery, SubqueryBody};
use crate::runtime::{Batch, BoxPuller};

impl Builder {
    pub(crate) fn expr(&mut self, e: &Expr) -> Result<BoxEval> {
        let ctx = self.ctx().clone();
        Ok(match e {
            Expr::This { path } => Box::new(This::new(ctx, path.clone())),
            Expr::Literal { value } => Box::new(Literal(self.literal(value)?)),
            Expr::Dot { lhs, rhs } => Box::new(Dot::new(ctx, self.expr(lhs)?, rhs.clone())),
            Expr::IndexExpr { expr, index } => Box::new(Index::new(ctx, self.expr(expr)?, self.expr(index)?)),
            Expr::SliceExpr { expr, from, to } => {
                let expr = self.expr(expr)?;
                let from = self.maybe_expr(from.as_deref())?;
                let to = self.maybe_expr(to.as_deref())?;
                Box::new(Slice::new(ctx, expr, from, to))
            }
            Expr::IsNullExpr { expr } => Box::new(IsNull(self.expr(expr)?)),
            Expr::UnaryExpr { op, operand } => {
                let operand = self.expr(operand)?;
                match op.as_str() {
                    "!" => Box::new(Not::new(ctx, operand)),
                    "-" => Box::new(Negate::new(ctx, operand)),
                    other => return Err(DbError::new(format!("unknown unary operator {other:?}"))),
                }
            }
            Expr::BinaryExpr { op, lhs, rhs } => self.binary(op, lhs, rhs)?,
            Expr::Conditional { cond, then, otherwise } => {
                Box::new(Conditional::new(ctx, self.expr(cond)?, self.expr(then)?, self.expr(otherwise)?))
            }
            Expr::RecordExpr { elems } => {
                let elems = elems
                    .iter()
                    .map(|elem| {
                        Ok(match elem {
                            RecordElem::Field { name, value } => RecordElemEval::Field(name.clone(), self.expr(value)?),
                            RecordElem::Spread { expr } => RecordElemEval::Spread(self.expr(expr)?),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Box::new(RecordExpr::new(ctx, elems))
            }
            Expr::ArrayExpr { elems } => Box::new(SequenceExpr::new(ctx, self.vector_elems(elems)?, false)),
            Expr::SetExpr { elems } => Box::new(SequenceExpr::new(ctx, self.vector_elems(elems)?, true)),
            Expr::MapExpr { entries } => {
                let entries = entries
                    .iter()
                    .map(|e| Ok((self.expr(&e.key)?, self.expr(&e.value)?)))
                    .collect::<Result<Vec<_>>>()?;
                Box::new(MapExpr::new(ctx, entries))
            }
            Expr::MapCall { expr, inner } => Box::new(MapCall::new(ctx, self.expr(expr)?, self.expr(inner)?)),
            Expr::Search { text, value, expr } => {
                let value = self.literal(value)?;
                Box::new(Search::new(text, value, self.expr(expr)?))
            }
            Expr::RegexpMatch { pattern, expr } => Box::new(RegexpMatch::new(ctx, pattern, self.expr(expr)?)?),
            Expr::RegexpSearch { pattern, expr } => Box::new(RegexpSearch::new(pattern, self.expr(expr)?)?),
            Expr::Agg {
                name,
                distinct,
                expr,
                filter,
            } => {
                let expr = self.maybe_expr(expr.as_deref())?;
                let filter = self.maybe_expr(filter.as_deref())?;
                let agg = AggExpr::new(ctx, Aggregator::new(name, *distinct, expr, filter)?);
                self.resetters.add(agg.clone());
                Box::new(agg)
            }
            Expr::Call { name, args } => self.call(name, args)?,
            Expr::CallParam { param, args } => {
                let tag = self
                    .bound(param)
                    .ok_or_else(|| DbError::new(format!("{param}: not a function parameter")))?;
                self.call(&tag, args)?
            }
            Expr::FuncRef { tag } => {
                return Err(DbError::new(format!("function reference {tag} used as a value")));
            }
            Expr::Subquery { correlated, body } => self.subquery(*correlated, body)?,
            Expr::BadExpr => return Err(DbError::new("internal error: bad expression in plan")),
        })
    }

    fn binary(&mut self, op: &str, lhs: &Expr, rhs: &Expr) -> Result<BoxEval> {
        let ctx = self.ctx().clone();
        if let Some(cmp) = CompareOp::parse(op) {
            return Ok(match (lhs, rhs) {
                (_, Expr::Literal { value }) => Box::new(CompareConst::new(cmp, self.expr(lhs)?, self.literal(value)?)),
                (Expr::Literal { value }, _) => {
                    Box::new(CompareConst::new(cmp.mirror(), self.expr(rhs)?, self.literal(value)?))
                }
                _ => Box::new(Compare::new(cmp, self.expr(lhs)?, self.expr(rhs)?)),
            });
        }
        if let Some(arith) = ArithOp::parse(op) {
            return Ok(Box::new(Arith::new(ctx, arith, self.expr(lhs)?, self.expr(rhs)?)));
        }
        Ok(match op {
            "and" => Box::new(And::new(ctx, self.expr(lhs)?, self.expr(rhs)?)),
            "or" => Box::new(Or::new(ctx, self.expr(lhs)?, self.expr(rhs)?)),
            "in" => match lhs {
                Expr::Literal { value } => Box::new(ContainsConst::new(self.literal(value)?, self.expr(rhs)?)),
                _ => Box::new(In::new(self.expr(lhs)?, self.expr(rhs)?)),
            },
            other => return Err(DbError::new(format!("unknown binary operator {other:?}"))),
        })
    }

    fn vector_elems(&mut self, elems: &[VectorElem]) -> Result<Vec<VectorElemEval>> {
        elems
            .iter()
            .map(|elem| {
                Ok(match elem {
                    VectorElem::VectorValue { expr } => VectorElemEval::Value(self.expr(expr)?),
                    VectorElem::Spread { expr } => VectorElemEval::Spread(self.expr(expr)?),
                })
            })
            .collect()
    }

    fn bound(&self, param: &str) -> Option<String> {
        self.bindings.last().and_then(|b| b.get(param).cloned())
    }

    fn func(&self, name: &str) -> Option<FuncDef> {
        let funcs = &self.env.funcs;
        funcs
            .iter()
            .find(|f| f.tag == name)
            .or_else(|| funcs.iter().find(|f| f.name == name))
            .cloned()
    }

    fn call(&mut self, name: &str, args: &[Expr]) -> Result<BoxEval> {
        if let Some(def) = self.func(name) {
            return self.udf_call(&def, args);
        }
        if !is_builtin(name) {
            return Err(DbError::new(format!("{name}: no such function")));
        }
        let func = lookup_function(self.ctx().clone(), name, args.len())?;
        let args = args.iter().map(|a| self.expr(a)).collect::<Result<Vec<_>>>()?;
        Ok(Box::new(Call::new(func, args)))
    }

    /// Compiles a call of a user function. Arguments that pass functions
    /// are bound at compile time, so each combination of function
    /// arguments gets its own compiled body.
    fn udf_call(&mut self, def: &FuncDef, args: &[Expr]) -> Result<BoxEval> {
        if args.len() != def.params.len() {
            return Err(DbError::new(format!(
                "call to {}: expected {} arguments, got {}",
                def.name,
                def.params.len(),
                args.len()
            )));
        }
        let mut bindings = IndexMap::new();
        let mut params = Vec::new();
        let mut values = Vec::new();
        for (param, arg) in def.params.iter().zip(args) {
            let func_tag = match arg {
                Expr::FuncRef { tag } => Some(tag.clone()),
                Expr::This { path } if path.len() == 1 => self.bound(&path[0]),
                _ => None,
            };
            match func_tag {
                Some(tag) => {
                    bindings.insert(param.clone(), tag);
                }
                None => {
                    params.push(param.clone());
                    values.push(arg);
                }
            }
        }
        let key = if bindings.is_empty() {
            def.tag.clone()
        } else {
            let bound: Vec<String> = bindings.iter().map(|(p, t)| format!("{p}={t}")).collect();
            format!("{}({})", def.tag, bound.join(","))
        };
        let cached = self.udfs().lock().get(&key).cloned();
        let udf = match cached {
            Some(udf) => udf,
            None => {
                trace!(function = %def.name, key = %key, "compiling function");
                let udf = Udf::new(self.ctx().clone(), def.name.clone(), params);
                self.udfs().lock().insert(key, udf.clone());
                self.bindings.push(bindings);
                let body = self.expr(&def.expr);
                self.bindings.pop();
                udf.set_body(body?)?;
                udf
            }
        };
        let args = values.into_iter().map(|a| self.expr(a)).collect::<Result<Vec<_>>>()?;
        Ok(Box::new(UdfCall::new(&udf, args)))
    }

    fn subquery(&mut self, correlated: bool, body: &Seq) -> Result<BoxEval> {
        let ctx = self.ctx().clone();
        if !correlated {
            let saved = std::mem::take(&mut self.resetters);
            let outs = self.compile_seq::<Batch>(body, Vec::new());
            self.resetters = saved;
            let body = self.combine(outs?)?;
            return Ok(Box::new(CachedSubquery::new(ctx, body)));
        }
        let env = self.env.clone();
        let udfs = self.weak_udfs();
        let bindings = self.bindings.clone();
        let body = body.clone();
        let factory: BodyFactory = Arc::new(move || {
            let udfs = udfs
                .upgrade()
                .ok_or_else(|| DbError::new("subquery evaluated after its query closed"))?;
            correlated_body(env.clone(), udfs, bindings.clone(), &body)
        });
        // Compile once up front so errors surface with the query.
        factory()?;
        Ok(Box::new(Subquery::new(ctx, factory)))
    }
}

fn correlated_body(
    env: BuildEnv,
    udfs: Arc<super::UdfCache>,
    bindings: Vec<IndexMap<String, String>>,
    body: &Seq,
) -> Result<SubqueryBody> {
    let mut b = Builder::with_env(env, udfs, Vec::new());
    b.bindings = bindings;
    let feeder = Feeder::new();
    let entry: BoxPuller = Box::new(feeder.clone());
    let outs = b.compile_seq::<Batch>(body, vec![entry])?;
    let body = b.combine(outs)?;
    Ok(SubqueryBody { feeder, body })
}

#[cfg(test)]
mod tests {
    use super::super::testutil::run_plan;
    use crate::dag::{DefaultScan, Expr, FuncDef, Main, Op, RecordElem};

    fn scan() -> Op {
        Op::DefaultScan(DefaultScan::default())
    }

    fn call(name: &str, args: Vec<Expr>) -> Expr {
        Expr::Call {
            name: name.to_string(),
            args,
        }
    }

    #[test]
    fn constant_comparisons_on_either_side() {
        let main = Main::new(vec![
            scan(),
            Op::filter(Expr::binary("<", Expr::literal("2"), Expr::this(["x"]))),
        ]);
        assert_eq!(vec!["{x:3}"], run_plan(&main, "{x:1} {x:3}", false).unwrap());
    }

    #[test]
    fn constant_in_container() {
        let main = Main::new(vec![
            scan(),
            Op::filter(Expr::binary("in", Expr::literal("2"), Expr::this(["a"]))),
        ]);
        assert_eq!(vec!["{a:[1,2]}"], run_plan(&main, "{a:[1,2]} {a:[3]}", false).unwrap());
    }

    #[test]
    fn recursive_function() {
        // fact(n) = n <= 1 ? 1 : n * fact(n - 1)
        let body = Expr::Conditional {
            cond: Box::new(Expr::binary("<=", Expr::this(["n"]), Expr::literal("1"))),
            then: Box::new(Expr::literal("1")),
            otherwise: Box::new(Expr::binary(
                "*",
                Expr::this(["n"]),
                call("fact", vec![Expr::binary("-", Expr::this(["n"]), Expr::literal("1"))]),
            )),
        };
        let mut main = Main::new(vec![scan(), Op::values(vec![call("fact", vec![Expr::this([] as [&str; 0])])])]);
        main.funcs.push(FuncDef {
            tag: "fact".to_string(),
            name: "fact".to_string(),
            params: vec!["n".to_string()],
            expr: body,
        });
        assert_eq!(vec!["120"], run_plan(&main, "5", false).unwrap());
    }

    #[test]
    fn function_parameters_bind_at_compile_time() {
        // apply(f, x) = f(x); double(y) = y * 2
        let mut main = Main::new(vec![
            scan(),
            Op::values(vec![call(
                "apply",
                vec![Expr::FuncRef { tag: "double".to_string() }, Expr::this([] as [&str; 0])],
            )]),
        ]);
        main.funcs.push(FuncDef {
            tag: "apply".to_string(),
            name: "apply".to_string(),
            params: vec!["f".to_string(), "x".to_string()],
            expr: Expr::CallParam {
                param: "f".to_string(),
                args: vec![Expr::this(["x"])],
            },
        });
        main.funcs.push(FuncDef {
            tag: "double".to_string(),
            name: "double".to_string(),
            params: vec!["y".to_string()],
            expr: Expr::binary("*", Expr::this(["y"]), Expr::literal("2")),
        });
        assert_eq!(vec!["6"], run_plan(&main, "3", false).unwrap());
    }

    #[test]
    fn running_aggregate_resets_per_platoon() {
        let main = Main::new(vec![
            scan(),
            Op::values(vec![Expr::Agg {
                name: "count".to_string(),
                distinct: false,
                expr: None,
                filter: None,
            }]),
        ]);
        assert_eq!(vec!["1", "2", "3"], run_plan(&main, "1 2 3", false).unwrap());
    }

    #[test]
    fn subqueries() {
        let uncorrelated = Expr::Subquery {
            correlated: false,
            body: vec![Op::NullScan, Op::values(vec![Expr::literal("7")])],
        };
        let correlated = Expr::Subquery {
            correlated: true,
            body: vec![Op::values(vec![Expr::binary("+", Expr::this(["x"]), Expr::literal("1"))])],
        };
        let main = Main::new(vec![
            scan(),
            Op::values(vec![Expr::RecordExpr {
                elems: vec![
                    RecordElem::Field {
                        name: "c".to_string(),
                        value: uncorrelated,
                    },
                    RecordElem::Field {
                        name: "y".to_string(),
                        value: correlated,
                    },
                ],
            }]),
        ]);
        assert_eq!(vec!["{c:7,y:2}", "{c:7,y:3}"], run_plan(&main, "{x:1} {x:2}", false).unwrap());
    }

    #[test]
    fn unknown_function() {
        let main = Main::new(vec![scan(), Op::values(vec![call("nope", Vec::new())])]);
        assert_eq!("nope: no such function", run_plan(&main, "1", false).unwrap_err().get_msg());
    }
}
