//! Row-oriented operators and sources.
use std::sync::Arc;

use superdb_error::{DbError, Result};
use tracing::debug;

use super::{Builder, Lane, lval};
use crate::dag::{Assignment, Expr, MergeOp, Op, SortExpr, SwitchOp};
use crate::io::file::HttpRequest;
use crate::io::{Format, ReaderOptions};
use crate::lake::CommitMessage;
use crate::runtime::expr::{Aggregator, BoxEval, Comparator, Evaluator, SortEval};
use crate::runtime::op::{
    Aggregate, Applier, CaseRouter, Count, CutEval, Distinct, DropEval, Explode, ExprSwitch,
    FilterEval, Fuse, HashJoin, JoinStyle, Load, Merge, NestedLoopJoin, PutEval, RenameEval,
    Router, Sort, Top, Uniq, Unnest, Values,
};
use crate::runtime::scan::{
    CommitMetaScan, DbMetaScan, Deleter, FileScan, HttpScan, Lister, PoolMetaScan, Pushdown,
    ReaderScan, RobotScan, SeqScan, Slicer,
};
use crate::runtime::{ArrayPuller, Batch, BoxPuller, NullPuller};
use crate::value::Value;
use crate::value::sup::parse_type;

impl Lane for Batch {
    fn source(b: &mut Builder, op: &Op, parent: Option<BoxPuller>, split: Option<usize>) -> Result<Vec<BoxPuller>> {
        b.scalar_source(op, parent, split)
    }

    fn op(b: &mut Builder, op: &Op, parent: BoxPuller) -> Result<BoxPuller> {
        b.scalar_op(op, parent)
    }

    fn join(b: &mut Builder, op: &Op, left: BoxPuller, right: BoxPuller) -> Result<BoxPuller> {
        let ctx = b.ctx().clone();
        match op {
            Op::HashJoin(join) => {
                let style: JoinStyle = join.style.parse()?;
                let left_key = b.expr(&join.left_key)?;
                let right_key = b.expr(&join.right_key)?;
                Ok(Box::new(HashJoin::new(
                    ctx,
                    style,
                    left,
                    right,
                    left_key,
                    right_key,
                    join.left_alias.as_str(),
                    join.right_alias.as_str(),
                )))
            }
            Op::Join(join) => {
                let style: JoinStyle = join.style.parse()?;
                let cond = join.cond.as_ref().map(|c| b.expr(c)).transpose()?;
                Ok(Box::new(NestedLoopJoin::new(
                    ctx,
                    style,
                    left,
                    right,
                    cond,
                    join.left_alias.as_str(),
                    join.right_alias.as_str(),
                )))
            }
            other => Err(DbError::new(format!("internal error: {} is not a join", other.kind()))),
        }
    }

    fn merge(b: &mut Builder, op: &MergeOp, parents: Vec<BoxPuller>) -> Result<BoxPuller> {
        let resetters = b.fresh_resetters();
        let cmp = Comparator::new(b.sort_evals(&op.exprs)?);
        Ok(Box::new(Merge::new(b.rctx().clone(), parents, cmp, resetters)))
    }

    fn router(b: &mut Builder, op: &SwitchOp) -> Result<Box<dyn Router<Batch>>> {
        match &op.expr {
            Some(expr) => {
                let cases = b.switch_constants(op)?;
                Ok(Box::new(ExprSwitch::new(b.expr(expr)?, cases)))
            }
            None => {
                let mut cases = Vec::with_capacity(op.cases.len());
                for case in &op.cases {
                    cases.push(match &case.expr {
                        Some(e) => b.expr(e)?,
                        None => Box::new(crate::runtime::expr::Literal(Value::from_bool(true))) as BoxEval,
                    });
                }
                Ok(Box::new(CaseRouter::new(cases)))
            }
        }
    }

    fn unnest(b: &mut Builder, expr: &Expr, parent: BoxPuller) -> Result<BoxPuller> {
        let expr = b.expr(expr)?;
        Ok(Box::new(Unnest::new(b.ctx().clone(), parent, expr)))
    }

    fn into_batches(p: BoxPuller) -> BoxPuller {
        p
    }

    fn from_batches(p: BoxPuller) -> BoxPuller {
        p
    }
}

impl Builder {
    pub(crate) fn scalar_op(&mut self, op: &Op, parent: BoxPuller) -> Result<BoxPuller> {
        let ctx = self.ctx().clone();
        let rctx = self.rctx().clone();
        let resetters = self.fresh_resetters();
        Ok(match op {
            Op::Filter(filter) => {
                let pred = self.expr(&filter.expr)?;
                Box::new(Applier::new(parent, Box::new(FilterEval::new(ctx, pred)), resetters))
            }
            Op::Put(put) => {
                let assignments = self.assignments(&put.args)?;
                Box::new(Applier::new(parent, Box::new(PutEval::new(ctx, assignments)), resetters))
            }
            Op::Cut(cut) => {
                let assignments = self.assignments(&cut.args)?;
                Box::new(Applier::new(parent, Box::new(CutEval::new(ctx, assignments)), resetters))
            }
            Op::Drop(drop) => {
                let paths = drop.args.iter().map(lval).collect::<Result<Vec<_>>>()?;
                Box::new(Applier::new(parent, Box::new(DropEval::new(ctx, paths)), resetters))
            }
            Op::Rename(rename) => {
                let renames = renames(&rename.args)?;
                Box::new(Applier::new(parent, Box::new(RenameEval::new(ctx, renames)), resetters))
            }
            Op::Values(values) => {
                let exprs = values.exprs.iter().map(|e| self.expr(e)).collect::<Result<Vec<_>>>()?;
                Box::new(Values::new(parent, exprs, resetters))
            }
            Op::Aggregate(agg) => {
                let keys = self.assignments(&agg.keys)?;
                let aggs = agg
                    .aggs
                    .iter()
                    .map(|a| Ok((lval(&a.lhs)?, self.aggregator(&a.rhs)?)))
                    .collect::<Result<Vec<_>>>()?;
                Box::new(Aggregate::new(
                    rctx,
                    parent,
                    keys,
                    aggs,
                    agg.limit,
                    agg.input_sort_dir,
                    agg.partials_in,
                    agg.partials_out,
                ))
            }
            Op::Sort(sort) => {
                let exprs = self.sort_evals(&sort.exprs)?;
                Box::new(Sort::new(rctx, parent, exprs, sort.reverse, resetters))
            }
            Op::Top(top) => {
                let exprs = self.sort_evals(&top.exprs)?;
                Box::new(Top::new(ctx, parent, top.limit, exprs, top.reverse))
            }
            Op::Uniq(uniq) => Box::new(Uniq::new(ctx, parent, uniq.cflag)),
            Op::Distinct(distinct) => Box::new(Distinct::new(parent, self.expr(&distinct.expr)?)),
            Op::Fuse => Box::new(Fuse::new(rctx, parent)),
            Op::Count(count) => {
                let expr = count.expr.as_ref().map(|e| self.expr(e)).transpose()?;
                Box::new(Count::new(rctx, parent, &count.alias, expr))
            }
            Op::Explode(explode) => {
                let args = explode.args.iter().map(|e| self.expr(e)).collect::<Result<Vec<_>>>()?;
                let typ = parse_type(&ctx, &explode.typ)?;
                Box::new(Explode::new(&ctx, parent, args, typ, &explode.alias)?)
            }
            Op::Load(load) => {
                let msg = CommitMessage {
                    author: load.author.clone(),
                    message: load.message.clone(),
                    meta: load.meta.clone(),
                };
                Box::new(Load::new(self.lake()?, parent, load.pool, &load.branch, msg))
            }
            Op::Slicer => {
                let pool = self
                    .pool
                    .ok_or_else(|| DbError::new("internal error: slicer without a lister"))?;
                let order = self
                    .lake()?
                    .pool(&pool)?
                    .sort_keys
                    .first()
                    .map(|k| k.order)
                    .unwrap_or_default();
                Box::new(Slicer::new(ctx, parent, order))
            }
            other => {
                return Err(DbError::new(format!(
                    "internal error: unknown operator {} in the row runtime",
                    other.kind()
                )));
            }
        })
    }

    pub(crate) fn scalar_source(&mut self, op: &Op, parent: Option<BoxPuller>, split: Option<usize>) -> Result<Vec<BoxPuller>> {
        let rctx = self.rctx().clone();
        let meter = self.meter().clone();
        match op {
            Op::DefaultScan(scan) => {
                let pushdown = self.pushdown(None, scan.filter.as_ref())?;
                let batch_size = rctx.config.batch_size;
                let scans: Vec<BoxPuller> = std::mem::take(&mut self.readers)
                    .into_iter()
                    .map(|r| {
                        Box::new(ReaderScan::new(rctx.ctx.clone(), r, pushdown.clone(), meter.clone(), batch_size))
                            as BoxPuller
                    })
                    .collect();
                debug!(readers = scans.len(), "default scan");
                if scans.is_empty() {
                    return one(Box::new(NullPuller));
                }
                one(self.combine(scans)?)
            }
            Op::FileScan(scan) => {
                let opts = self.reader_options(&scan.format)?;
                let filter = scan.pushdown.data_filter.as_ref().and_then(|f| f.expr.as_ref());
                let pushdown = self.pushdown(scan.pushdown.projection.clone(), filter)?;
                let file = FileScan::new(rctx, &scan.paths, opts, pushdown, meter)?;
                Ok(match split {
                    Some(n) => file.split(n).into_iter().map(|s| Box::new(s) as BoxPuller).collect(),
                    None => vec![Box::new(file)],
                })
            }
            Op::HttpScan(scan) => {
                let opts = self.reader_options(&scan.format)?;
                let req = HttpRequest {
                    url: scan.url.clone(),
                    method: scan.method.clone(),
                    headers: scan.headers.clone(),
                    body: scan.body.clone(),
                };
                one(Box::new(HttpScan::new(rctx, req, opts, Pushdown::default(), meter)))
            }
            Op::RobotScan(scan) => {
                let parent = parent.ok_or_else(|| DbError::new("robot scan requires an upstream"))?;
                let opts = self.reader_options(&scan.format)?;
                let expr = self.expr(&scan.expr)?;
                let pushdown = self.pushdown(None, scan.filter.as_ref())?;
                one(Box::new(RobotScan::new(rctx, parent, expr, opts, pushdown, meter)))
            }
            Op::ListerScan(scan) => {
                self.pool = Some(scan.pool);
                let pruner = self.maybe_expr(scan.key_pruner.as_ref())?;
                one(Box::new(Lister::new(rctx, self.lake()?, scan.pool, scan.commit, pruner)))
            }
            Op::SeqScan(scan) => {
                let lake = self.lake()?;
                let parent = match parent {
                    Some(p) => p,
                    None => {
                        let pruner = self.maybe_expr(scan.key_pruner.as_ref())?;
                        Box::new(Lister::new(rctx.clone(), lake.clone(), scan.pool, scan.commit, pruner))
                    }
                };
                let config = lake.pool(&scan.pool)?;
                let pushdown = self.pushdown(scan.fields.clone(), scan.filter.as_ref())?;
                let pruner = self.maybe_expr(scan.key_pruner.as_ref())?;
                one(Box::new(SeqScan::new(rctx, lake, &config, parent, pushdown, pruner, meter)))
            }
            Op::PoolScan(scan) => {
                let lake = self.lake()?;
                let config = lake.pool(&scan.id)?;
                let lister = Box::new(Lister::new(rctx.clone(), lake.clone(), scan.id, scan.commit, None));
                one(Box::new(SeqScan::new(rctx, lake, &config, lister, Pushdown::default(), None, meter)))
            }
            Op::DeleterScan(scan) => {
                let parent = parent.ok_or_else(|| DbError::new("internal error: deleter scan without a lister"))?;
                let filter = self.maybe_expr(scan.filter.as_ref())?;
                let pruner = self.maybe_expr(scan.key_pruner.as_ref())?;
                let deletes = self.deletes().clone();
                one(Box::new(Deleter::new(rctx, self.lake()?, scan.pool, parent, filter, pruner, deletes, meter)))
            }
            Op::DeleteScan(_) => Err(DbError::new("delete scan must be compiled as a delete query")),
            Op::DbMetaScan(scan) => one(DbMetaScan::open(&rctx, self.lake()?.as_ref(), &scan.meta)?),
            Op::PoolMetaScan(scan) => one(PoolMetaScan::open(&rctx, self.lake()?.as_ref(), &scan.id, &scan.meta)?),
            Op::CommitMetaScan(scan) => {
                let pruner = self.maybe_expr(scan.key_pruner.as_ref())?;
                one(CommitMetaScan::open(&rctx, self.lake()?, &scan.pool, &scan.commit, &scan.meta, pruner)?)
            }
            Op::NullScan => one(Box::new(ArrayPuller::with_batch_size(vec![Value::null()], 1))),
            other => Err(DbError::new(format!("internal error: {} is not a source", other.kind()))),
        }
    }

    pub(crate) fn reader_options(&self, format: &str) -> Result<ReaderOptions> {
        let mut opts = self.env.opts;
        if !format.is_empty() {
            opts.format = Format::from_name(format)?;
        }
        Ok(opts)
    }

    pub(crate) fn pushdown(&mut self, projection: Option<Vec<Vec<String>>>, filter: Option<&Expr>) -> Result<Pushdown> {
        let filter = match filter {
            Some(e) => Some(Arc::from(self.expr(e)?) as Arc<dyn Evaluator>),
            None => None,
        };
        Ok(Pushdown::new(projection, filter))
    }

    pub(crate) fn maybe_expr(&mut self, e: Option<&Expr>) -> Result<Option<BoxEval>> {
        e.map(|e| self.expr(e)).transpose()
    }

    pub(crate) fn assignments(&mut self, args: &[Assignment]) -> Result<Vec<(Vec<String>, BoxEval)>> {
        args.iter()
            .map(|a| Ok((lval(&a.lhs)?, self.expr(&a.rhs)?)))
            .collect()
    }

    fn sort_evals(&mut self, exprs: &[SortExpr]) -> Result<Vec<SortEval>> {
        exprs
            .iter()
            .map(|s| Ok(SortEval::new(self.expr(&s.key)?, s.order, s.nulls)))
            .collect()
    }

    fn aggregator(&mut self, e: &Expr) -> Result<Aggregator> {
        let Expr::Agg {
            name,
            distinct,
            expr,
            filter,
        } = e
        else {
            return Err(DbError::new("aggregate: expected an aggregate function"));
        };
        let expr = self.maybe_expr(expr.as_deref())?;
        let filter = self.maybe_expr(filter.as_deref())?;
        Aggregator::new(name, *distinct, expr, filter)
    }
}

/// `(from, to)` pairs of a rename, whose assignments read `to := from`.
pub(crate) fn renames(args: &[Assignment]) -> Result<Vec<(Vec<String>, Vec<String>)>> {
    args.iter().map(|a| Ok((lval(&a.rhs)?, lval(&a.lhs)?))).collect()
}

fn one(p: BoxPuller) -> Result<Vec<BoxPuller>> {
    Ok(vec![p])
}
