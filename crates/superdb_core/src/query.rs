//! Compiling plans into runnable queries.
use std::sync::Arc;

use superdb_error::Result;
use tracing::debug;

use crate::bsup::ScannerOptions;
use crate::builder::{Builder, UdfCache};
use crate::config::session::SessionConfig;
use crate::dag::{Main, Op};
use crate::describe::{Info, describe};
use crate::io::{ReaderOptions, ValueReader};
use crate::lake::Lake;
use crate::optimizer::Optimizer;
use crate::runtime::op::Combine;
use crate::runtime::scan::Deletes;
use crate::runtime::{Batch, BoxPuller, Catcher, Meter, Progress, Puller, RuntimeContext};
use crate::types::TypeContext;

/// Process wide settings shared by every compiled query.
#[derive(Debug, Clone)]
pub struct Engine {
    config: SessionConfig,
    reader_options: ReaderOptions,
}

impl Engine {
    pub fn new(config: SessionConfig) -> Self {
        let reader_options = ReaderOptions {
            bsup: ScannerOptions {
                threads: config.bsup_threads,
                read_size: config.bsup_read_size,
                read_max: config.bsup_read_max,
                validate: config.bsup_validate,
            },
            csv_delim: config.csv_delim,
            ..Default::default()
        };
        Engine {
            config,
            reader_options,
        }
    }

    /// Overrides the options file scans fall back on when a scan names no
    /// format of its own.
    pub fn with_reader_options(mut self, opts: ReaderOptions) -> Self {
        self.reader_options = opts;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn reader_options(&self) -> &ReaderOptions {
        &self.reader_options
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new(SessionConfig::from_env())
    }
}

#[derive(Clone)]
pub struct Compiler {
    engine: Arc<Engine>,
    lake: Option<Arc<dyn Lake>>,
}

impl Compiler {
    pub fn new(engine: Arc<Engine>, lake: Option<Arc<dyn Lake>>) -> Self {
        Compiler { engine, lake }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Rewrites a plan the way [`Compiler::new_query`] would before
    /// building it.
    pub fn optimize(&self, main: &mut Main, parallelism: usize) -> Result<()> {
        let vector = self.engine.config.vector_execution;
        let mut opt = Optimizer::new(self.lake.clone(), vector);
        if matches!(main.body.first(), Some(Op::DeleteScan(_))) {
            return opt.optimize_deleter(main, parallelism.max(1));
        }
        opt.optimize(main)?;
        if parallelism > 1 {
            opt.parallelize(main, parallelism)?;
        }
        Ok(())
    }

    /// Describes the sources and output channels of an unoptimized plan.
    pub fn describe(&self, main: &Main) -> Result<Info> {
        describe(main, self.lake.clone())
    }

    /// Optimizes and builds a plan. The readers feed the plan's default
    /// scan in order.
    pub fn new_query(
        &self,
        ctx: Arc<TypeContext>,
        mut main: Main,
        readers: Vec<Box<dyn ValueReader>>,
        parallelism: usize,
    ) -> Result<Query> {
        self.optimize(&mut main, parallelism)?;

        let config = self.engine.config.clone();
        let vector = config.vector_execution;
        let rctx = RuntimeContext::new(ctx, config);
        let mut builder = Builder::new(
            rctx.clone(),
            self.lake.clone(),
            self.engine.reader_options,
            main.funcs,
            readers,
        );
        builder.build(&main.body, vector)?;

        let meter = builder.meter().clone();
        let deletes = builder.deletes().clone();
        let udfs = builder.udfs().clone();
        let mut outputs: Vec<BoxPuller> = builder.take_channels().into_values().flatten().collect();
        debug!(outputs = outputs.len(), vector, "built query");
        let puller: BoxPuller = match outputs.len() {
            1 => outputs.remove(0),
            _ => Box::new(Combine::new(rctx.clone(), outputs)),
        };

        Ok(Query {
            rctx,
            puller: Catcher::new(puller),
            meter,
            deletes,
            _udfs: udfs,
            closed: false,
        })
    }

    pub fn new_query_from_json(
        &self,
        ctx: Arc<TypeContext>,
        plan: &str,
        readers: Vec<Box<dyn ValueReader>>,
        parallelism: usize,
    ) -> Result<Query> {
        self.new_query(ctx, Main::from_json(plan)?, readers, parallelism)
    }
}

/// A running query. Batches from every output are labeled with the output's
/// name.
pub struct Query {
    rctx: Arc<RuntimeContext>,
    puller: Catcher,
    meter: Meter,
    deletes: Deletes,
    /// Compiled function calls only hold weak references.
    _udfs: Arc<UdfCache>,
    closed: bool,
}

impl Query {
    pub fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        self.rctx.token().check()?;
        self.puller.pull(done)
    }

    pub fn progress(&self) -> Progress {
        self.meter.progress()
    }

    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    /// Objects a delete query removed.
    pub fn deletes(&self) -> &Deletes {
        &self.deletes
    }

    pub fn runtime(&self) -> &Arc<RuntimeContext> {
        &self.rctx
    }

    /// Cancels outstanding work and waits for it to release its resources.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.rctx.cancel();
        }
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ArrayReader;
    use crate::runtime::testutil::text;
    use crate::value::sup::parse_values;

    fn compiler(vector: bool) -> Compiler {
        let config = SessionConfig {
            vector_execution: vector,
            ..Default::default()
        };
        Compiler::new(Arc::new(Engine::new(config)), None)
    }

    fn run(c: &Compiler, plan: &str, input: &str) -> Result<Vec<String>> {
        let ctx = Arc::new(TypeContext::new());
        let vals = parse_values(&ctx, input)?;
        let readers: Vec<Box<dyn ValueReader>> = vec![Box::new(ArrayReader::new(vals))];
        let mut q = c.new_query_from_json(ctx, plan, readers, 1)?;
        let mut out = Vec::new();
        while let Some(batch) = q.pull(false)? {
            out.extend(text(batch.values()));
        }
        q.close();
        Ok(out)
    }

    const FILTER: &str = r#"{"body":[
        {"kind":"DefaultScan"},
        {"kind":"Filter","expr":{"kind":"BinaryExpr","op":">",
            "lhs":{"kind":"This","path":["x"]},"rhs":{"kind":"Literal","value":"1"}}},
        {"kind":"Output","name":"main"}]}"#;

    #[test]
    fn runs_plan_from_json() {
        for vector in [false, true] {
            let got = run(&compiler(vector), FILTER, "{x:1} {x:2} {x:3}").unwrap();
            assert_eq!(vec!["{x:2}", "{x:3}"], got);
        }
    }

    #[test]
    fn compile_errors_come_from_new_query() {
        let plan = r#"{"body":[{"kind":"DefaultScan"},
            {"kind":"Filter","expr":{"kind":"Call","name":"nope","args":[]}}]}"#;
        let ctx = Arc::new(TypeContext::new());
        let err = compiler(false)
            .new_query_from_json(ctx, plan, Vec::new(), 1)
            .err()
            .unwrap();
        assert!(err.to_string().contains("nope: no such function"));
    }

    #[test]
    fn bad_json_is_an_error() {
        let ctx = Arc::new(TypeContext::new());
        assert!(compiler(false).new_query_from_json(ctx, "{", Vec::new(), 1).is_err());
    }

    #[test]
    fn closed_query_reports_cancellation() {
        let ctx = Arc::new(TypeContext::new());
        let mut q = compiler(false).new_query_from_json(ctx, FILTER, Vec::new(), 1).unwrap();
        q.close();
        let err = q.pull(false).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(0, q.runtime().temp_files());
    }

    #[test]
    fn engine_carries_scanner_settings() {
        let engine = Engine::new(SessionConfig {
            bsup_threads: 3,
            csv_delim: b';',
            ..Default::default()
        });
        assert_eq!(3, engine.reader_options().bsup.threads);
        assert_eq!(b';', engine.reader_options().csv_delim);
    }
}
