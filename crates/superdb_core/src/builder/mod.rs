//! Compiles an optimized plan into a tree of pullers.
//!
//! The structural operators (fan-in, fan-out, switches, scopes, outputs and
//! the generic limits) are compiled once for both runtimes through the
//! [`Lane`] trait. Everything else is handed to the lane: [`Batch`] builds
//! the row-oriented operators and [`Vector`] builds the columnar ones,
//! bridging through the row runtime where it has no native operator.
mod expr;
mod scalar;
mod vector;

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use superdb_error::{DbError, Result};
use tracing::debug;
use uuid::Uuid;

use crate::dag::{Expr, FuncDef, MergeOp, Op, Seq, SwitchOp};
use crate::io::{ReaderOptions, ValueReader};
use crate::lake::Lake;
use crate::runtime::expr::Resetters;
use crate::runtime::expr::function::Udf;
use crate::runtime::op::{Combine, Fork, Head, Output, Pass, Router, Scope, Shared, Skip, Switch, Tail};
use crate::runtime::scan::Deletes;
use crate::runtime::{Batch, BoxPuller, Chunk, Meter, RuntimeContext};
use crate::types::TypeContext;
use crate::value::Value;
use crate::value::sup::parse_value;
use crate::vector::{Dematerializer, Materializer, Vector};

/// Compiled user functions keyed by tag and function-parameter bindings.
pub(crate) type UdfCache = Mutex<IndexMap<String, Arc<Udf>>>;

/// What every builder of one query shares, including the builders that
/// correlated subqueries create at run time.
#[derive(Clone)]
pub(crate) struct BuildEnv {
    pub rctx: Arc<RuntimeContext>,
    pub lake: Option<Arc<dyn Lake>>,
    pub opts: ReaderOptions,
    pub meter: Meter,
    pub deletes: Deletes,
    pub funcs: Arc<Vec<FuncDef>>,
}

/// The runtime a plan compiles to.
pub(crate) trait Lane: Chunk + Sized {
    /// Compiles a source. `parent` is the upstream of sources that read
    /// from one, and `split` asks for that many pullers sharing the input.
    fn source(b: &mut Builder, op: &Op, parent: Option<BoxPuller<Self>>, split: Option<usize>) -> Result<Vec<BoxPuller<Self>>>;

    /// Compiles a single-parent operator with no generic form.
    fn op(b: &mut Builder, op: &Op, parent: BoxPuller<Self>) -> Result<BoxPuller<Self>>;

    fn join(b: &mut Builder, op: &Op, left: BoxPuller<Self>, right: BoxPuller<Self>) -> Result<BoxPuller<Self>>;

    fn merge(b: &mut Builder, op: &MergeOp, parents: Vec<BoxPuller<Self>>) -> Result<BoxPuller<Self>>;

    fn router(b: &mut Builder, op: &SwitchOp) -> Result<Box<dyn Router<Self>>>;

    fn unnest(b: &mut Builder, expr: &Expr, parent: BoxPuller<Self>) -> Result<BoxPuller<Self>>;

    fn into_batches(p: BoxPuller<Self>) -> BoxPuller;

    fn from_batches(p: BoxPuller) -> BoxPuller<Self>;
}

pub struct Builder {
    env: BuildEnv,
    /// Strong handle on the function cache. Builders made by correlated
    /// subqueries hold only the weak one.
    udfs: Arc<UdfCache>,
    readers: Vec<Box<dyn ValueReader>>,
    channels: IndexMap<String, Vec<BoxPuller>>,
    /// Resetters of the operator being compiled. Aggregate expressions
    /// register here.
    resetters: Resetters,
    /// Function parameters bound to function tags, innermost last.
    bindings: Vec<IndexMap<String, String>>,
    /// Pool of the most recent lister, whose key order a slicer follows.
    pool: Option<Uuid>,
}

impl Builder {
    pub fn new(
        rctx: Arc<RuntimeContext>,
        lake: Option<Arc<dyn Lake>>,
        opts: ReaderOptions,
        funcs: Vec<FuncDef>,
        readers: Vec<Box<dyn ValueReader>>,
    ) -> Self {
        let env = BuildEnv {
            rctx,
            lake,
            opts,
            meter: Meter::default(),
            deletes: Deletes::default(),
            funcs: Arc::new(funcs),
        };
        Self::with_env(env, Arc::new(Mutex::new(IndexMap::new())), readers)
    }

    pub(crate) fn with_env(env: BuildEnv, udfs: Arc<UdfCache>, readers: Vec<Box<dyn ValueReader>>) -> Self {
        Builder {
            env,
            udfs,
            readers,
            channels: IndexMap::new(),
            resetters: Resetters::default(),
            bindings: Vec::new(),
            pool: None,
        }
    }

    pub fn ctx(&self) -> &Arc<TypeContext> {
        &self.env.rctx.ctx
    }

    pub fn rctx(&self) -> &Arc<RuntimeContext> {
        &self.env.rctx
    }

    pub fn meter(&self) -> &Meter {
        &self.env.meter
    }

    pub fn deletes(&self) -> &Deletes {
        &self.env.deletes
    }

    pub(crate) fn udfs(&self) -> &Arc<UdfCache> {
        &self.udfs
    }

    pub(crate) fn weak_udfs(&self) -> Weak<UdfCache> {
        Arc::downgrade(&self.udfs)
    }

    /// Compiles a plan body, on the vector runtime when `vector` is set.
    /// Outputs are collected by channel name, and the ends of paths that
    /// reach no output feed the `main` channel.
    pub fn build(&mut self, body: &Seq, vector: bool) -> Result<()> {
        if !body.first().is_some_and(Op::is_source) {
            return Err(DbError::new("internal error: DAG entry point is not a data source"));
        }
        let ends = if vector {
            self.compile_seq::<Vector>(body, Vec::new())?
                .into_iter()
                .map(Vector::into_batches)
                .collect()
        } else {
            self.compile_seq::<Batch>(body, Vec::new())?
        };
        if !ends.is_empty() {
            self.channels.entry("main".to_string()).or_default().extend(ends);
        }
        debug!(
            vector,
            channels = self.channels.len(),
            udfs = self.udfs.lock().len(),
            "built query"
        );
        Ok(())
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Takes the compiled outputs, leaving the builder empty.
    pub fn take_channels(&mut self) -> IndexMap<String, Vec<BoxPuller>> {
        std::mem::take(&mut self.channels)
    }

    pub(crate) fn compile_seq<T: Lane>(&mut self, seq: &[Op], mut parents: Vec<BoxPuller<T>>) -> Result<Vec<BoxPuller<T>>> {
        let mut i = 0;
        while i < seq.len() {
            let op = &seq[i];
            if op.is_source() {
                let split = match (op, seq.get(i + 1)) {
                    (Op::FileScan(_), Some(Op::Scatter(scatter))) => Some(scatter.paths.len()),
                    _ => None,
                };
                let parent = if reads_upstream(op) && !parents.is_empty() {
                    Some(self.combine(parents)?)
                } else {
                    None
                };
                let scans = T::source(self, op, parent, split)?;
                parents = match (split, seq.get(i + 1)) {
                    (Some(_), Some(Op::Scatter(scatter))) => {
                        i += 1;
                        self.compile_paths(&scatter.paths, scans)?
                    }
                    _ => scans,
                };
            } else {
                if parents.is_empty() {
                    return Err(DbError::new("internal error: DAG entry point is not a data source"));
                }
                parents = self.compile_op(op, parents)?;
            }
            i += 1;
        }
        Ok(parents)
    }

    fn compile_paths<T: Lane>(&mut self, paths: &[Seq], exits: Vec<BoxPuller<T>>) -> Result<Vec<BoxPuller<T>>> {
        let mut outs = Vec::new();
        for (path, exit) in paths.iter().zip(exits) {
            outs.extend(self.compile_seq(path, vec![exit])?);
        }
        Ok(outs)
    }

    fn compile_op<T: Lane>(&mut self, op: &Op, parents: Vec<BoxPuller<T>>) -> Result<Vec<BoxPuller<T>>> {
        match op {
            Op::Fork(fork) => {
                let parent = self.combine(parents)?;
                let exits = boxed(Fork::exits(parent, fork.paths.len()));
                self.compile_paths(&fork.paths, exits)
            }
            Op::Scatter(scatter) => {
                let parent = self.combine(parents)?;
                let exits = boxed(Shared::branches(parent, scatter.paths.len()));
                self.compile_paths(&scatter.paths, exits)
            }
            Op::Mirror(mirror) => {
                let parent = self.combine(parents)?;
                let mut exits = Fork::exits(parent, 2).into_iter();
                let (Some(main), Some(copy)) = (exits.next(), exits.next()) else {
                    return Err(DbError::new("internal error: mirror needs two exits"));
                };
                let mut outs = self.compile_seq(&mirror.main, vec![Box::new(main)])?;
                outs.extend(self.compile_seq(&mirror.mirror, vec![Box::new(copy)])?);
                Ok(outs)
            }
            Op::Switch(switch) => {
                let parent = self.combine(parents)?;
                let router = T::router(self, switch)?;
                let exits = boxed(Switch::exits(parent, router, switch.cases.len()));
                let paths: Vec<Seq> = switch.cases.iter().map(|c| c.path.clone()).collect();
                self.compile_paths(&paths, exits)
            }
            Op::Combine => Ok(vec![self.combine(parents)?]),
            Op::Merge(merge) => Ok(vec![T::merge(self, merge, parents)?]),
            Op::HashJoin(_) | Op::Join(_) => {
                let [left, right]: [BoxPuller<T>; 2] = parents
                    .try_into()
                    .map_err(|_| DbError::new("join requires two upstream parallel query paths"))?;
                Ok(vec![T::join(self, op, left, right)?])
            }
            Op::Scope(scope) => {
                let parent = self.combine(parents)?;
                Ok(vec![self.scoped(parent, &scope.body)?])
            }
            Op::Unnest(unnest) => {
                let parent = self.combine(parents)?;
                let parent = T::unnest(self, &unnest.expr, parent)?;
                match &unnest.body {
                    Some(body) => Ok(vec![self.scoped(parent, body)?]),
                    None => Ok(vec![parent]),
                }
            }
            Op::Output(output) => {
                let parent = self.combine(parents)?;
                let out = Output::new(T::into_batches(parent), &output.name);
                self.channels.entry(output.name.clone()).or_default().push(Box::new(out));
                Ok(Vec::new())
            }
            Op::Head(arg) => Ok(vec![Box::new(Head::new(self.combine(parents)?, arg.count))]),
            Op::Tail(arg) => Ok(vec![Box::new(Tail::new(self.combine(parents)?, arg.count))]),
            Op::Skip(arg) => Ok(vec![Box::new(Skip::new(self.combine(parents)?, arg.count))]),
            Op::Pass => Ok(vec![Box::new(Pass::new(self.combine(parents)?))]),
            _ => {
                let parent = self.combine(parents)?;
                Ok(vec![T::op(self, op, parent)?])
            }
        }
    }

    /// Runs `body` over each batch of `parent` as a platoon of its own.
    fn scoped<T: Lane>(&mut self, parent: BoxPuller<T>, body: &Seq) -> Result<BoxPuller<T>> {
        let scope = Scope::new(parent);
        let outs = self.compile_seq(body, vec![Box::new(scope.entry())])?;
        let body = self.combine(outs)?;
        Ok(Box::new(scope.exit(body)))
    }

    pub(crate) fn combine<T: Lane>(&self, mut parents: Vec<BoxPuller<T>>) -> Result<BoxPuller<T>> {
        match parents.len() {
            0 => Err(DbError::new("internal error: operator has no upstream")),
            1 => Ok(parents.remove(0)),
            _ => Ok(Box::new(Combine::new(self.env.rctx.clone(), parents))),
        }
    }

    pub(crate) fn lake(&self) -> Result<Arc<dyn Lake>> {
        self.env
            .lake
            .clone()
            .ok_or_else(|| DbError::new("query requires a lake"))
    }

    /// Parses a constant in SUP text form.
    pub(crate) fn literal(&self, value: &str) -> Result<Value> {
        parse_value(self.ctx(), value)
    }

    /// The constants of an expression switch, None marking the default case.
    pub(crate) fn switch_constants(&self, op: &SwitchOp) -> Result<Vec<Option<Value>>> {
        op.cases
            .iter()
            .map(|case| match &case.expr {
                None => Ok(None),
                Some(Expr::Literal { value }) => Ok(Some(self.literal(value)?)),
                Some(_) => Err(DbError::new("switch case is not a constant expression")),
            })
            .collect()
    }

    /// Starts compiling the expressions of a new operator.
    pub(crate) fn fresh_resetters(&mut self) -> Resetters {
        self.resetters = Resetters::default();
        self.resetters.clone()
    }
}

/// Sources that consume the output of the operators before them.
fn reads_upstream(op: &Op) -> bool {
    matches!(op, Op::SeqScan(_) | Op::DeleterScan(_) | Op::RobotScan(_))
}

fn boxed<T: Chunk, P: crate::runtime::Puller<T> + 'static>(pullers: Vec<P>) -> Vec<BoxPuller<T>> {
    pullers.into_iter().map(|p| Box::new(p) as BoxPuller<T>).collect()
}

/// Extracts the field path of an assignment target.
pub(crate) fn lval(e: &Expr) -> Result<Vec<String>> {
    match e {
        Expr::This { path } => Ok(path.clone()),
        Expr::Dot { lhs, rhs } => {
            let mut path = lval(lhs)?;
            path.push(rhs.clone());
            Ok(path)
        }
        _ => Err(DbError::new("assignment target is not a field path")),
    }
}

impl Lane for Vector {
    fn source(b: &mut Builder, op: &Op, parent: Option<BoxPuller<Self>>, split: Option<usize>) -> Result<Vec<BoxPuller<Self>>> {
        b.vector_source(op, parent, split)
    }

    fn op(b: &mut Builder, op: &Op, parent: BoxPuller<Self>) -> Result<BoxPuller<Self>> {
        b.vector_op(op, parent)
    }

    fn join(b: &mut Builder, op: &Op, left: BoxPuller<Self>, right: BoxPuller<Self>) -> Result<BoxPuller<Self>> {
        let joined = <Batch as Lane>::join(b, op, Vector::into_batches(left), Vector::into_batches(right))?;
        Ok(Vector::from_batches(joined))
    }

    fn merge(b: &mut Builder, op: &MergeOp, parents: Vec<BoxPuller<Self>>) -> Result<BoxPuller<Self>> {
        let parents = parents.into_iter().map(Vector::into_batches).collect();
        Ok(Vector::from_batches(<Batch as Lane>::merge(b, op, parents)?))
    }

    fn router(b: &mut Builder, op: &SwitchOp) -> Result<Box<dyn Router<Self>>> {
        b.vector_router(op)
    }

    fn unnest(b: &mut Builder, expr: &Expr, parent: BoxPuller<Self>) -> Result<BoxPuller<Self>> {
        b.vector_unnest(expr, parent)
    }

    fn into_batches(p: BoxPuller<Self>) -> BoxPuller {
        Box::new(Materializer::new(p))
    }

    fn from_batches(p: BoxPuller) -> BoxPuller<Self> {
        Box::new(Dematerializer::new(p))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::config::session::SessionConfig;
    use crate::dag::Main;
    use crate::runtime::drain_platoon;
    use crate::runtime::testutil::text;

    pub fn runtime() -> Arc<RuntimeContext> {
        RuntimeContext::new(Arc::new(TypeContext::new()), SessionConfig::default())
    }

    /// Builds `main` over the given SUP input and drains every channel.
    pub fn run_plan(main: &Main, input: &str, vector: bool) -> Result<Vec<String>> {
        let rctx = runtime();
        let vals = crate::value::sup::parse_values(&rctx.ctx, input)?;
        let reader: Box<dyn ValueReader> = Box::new(crate::io::ArrayReader::new(vals));
        let mut b = Builder::new(rctx, None, ReaderOptions::default(), main.funcs.clone(), vec![reader]);
        b.build(&main.body, vector)?;
        let mut out = Vec::new();
        for (_, pullers) in b.take_channels() {
            for mut p in pullers {
                out.extend(text(&drain_platoon(p.as_mut())?));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::run_plan;
    use crate::dag::{
        Case, DefaultScan, Expr, HashJoinOp, Main, Op, PathsOp, SwitchOp, UnnestOp,
    };

    fn scan() -> Op {
        Op::DefaultScan(DefaultScan::default())
    }

    fn gt(field: &str, n: &str) -> Expr {
        Expr::binary(">", Expr::this([field]), Expr::literal(n))
    }

    #[test]
    fn entry_must_be_a_source() {
        let main = Main::new(vec![Op::head(1)]);
        let err = run_plan(&main, "1", false).unwrap_err();
        assert_eq!("internal error: DAG entry point is not a data source", err.get_msg());
    }

    #[test]
    fn fork_feeds_every_path() {
        for vector in [false, true] {
            let main = Main::new(vec![
                scan(),
                Op::Fork(PathsOp {
                    paths: vec![vec![Op::filter(gt("x", "1"))], vec![Op::head(1)]],
                }),
                Op::output("out"),
            ]);
            let mut out = run_plan(&main, "{x:1} {x:2}", vector).unwrap();
            out.sort();
            assert_eq!(vec!["{x:1}", "{x:2}"], out, "vector={vector}");
        }
    }

    #[test]
    fn switch_cases_must_be_constant() {
        let main = Main::new(vec![
            scan(),
            Op::Switch(SwitchOp {
                expr: Some(Expr::this(["k"])),
                cases: vec![Case {
                    expr: Some(Expr::this(["j"])),
                    path: vec![Op::Pass],
                }],
            }),
        ]);
        let err = run_plan(&main, "{k:1}", false).unwrap_err();
        assert_eq!("switch case is not a constant expression", err.get_msg());
    }

    #[test]
    fn expression_switch_routes_values() {
        for vector in [false, true] {
            let main = Main::new(vec![
                scan(),
                Op::Switch(SwitchOp {
                    expr: Some(Expr::this(["k"])),
                    cases: vec![
                        Case {
                            expr: Some(Expr::literal("1")),
                            path: vec![Op::output("one")],
                        },
                        Case {
                            expr: None,
                            path: vec![Op::output("rest")],
                        },
                    ],
                }),
            ]);
            let out = run_plan(&main, "{k:1} {k:2} {k:1}", vector).unwrap();
            assert_eq!(vec!["{k:1}", "{k:1}", "{k:2}"], out, "vector={vector}");
        }
    }

    #[test]
    fn join_needs_two_parents() {
        let main = Main::new(vec![
            scan(),
            Op::HashJoin(HashJoinOp {
                style: "inner".to_string(),
                left_alias: "l".to_string(),
                right_alias: "r".to_string(),
                left_key: Expr::this(["k"]),
                right_key: Expr::this(["k"]),
            }),
        ]);
        let err = run_plan(&main, "{k:1}", false).unwrap_err();
        assert_eq!("join requires two upstream parallel query paths", err.get_msg());
    }

    #[test]
    fn unnest_body_runs_per_value() {
        for vector in [false, true] {
            let main = Main::new(vec![
                scan(),
                Op::Unnest(UnnestOp {
                    expr: Expr::this(["a"]),
                    body: Some(vec![Op::head(1)]),
                }),
            ]);
            let out = run_plan(&main, "{a:[1,2]} {a:[3,4]}", vector).unwrap();
            assert_eq!(vec!["1", "3"], out, "vector={vector}");
        }
    }
}
