//! Data sources. Every scanner emits batches of at most `batch_size`
//! values, applies the pushed-down filter and projection, and adds what
//! it read to the query's progress meter.
pub mod file;
pub mod lake;
pub mod robot;

use std::sync::Arc;

use superdb_error::Result;
use tracing::trace;

pub use file::{FileScan, open_path};
pub use lake::{
    CommitMetaScan, DbMetaScan, Deleter, Deletes, Lister, PoolMetaScan, SeqScan, Slicer, object_from_value,
    object_value,
};
pub use robot::{HttpScan, RobotScan};

use crate::io::ValueReader;
use crate::runtime::expr::Evaluator;
use crate::runtime::expr::record::build_from_paths;
use crate::runtime::{Batch, Meter, Progress, Puller, batch_of};
use crate::types::TypeContext;
use crate::value::Value;

/// Work a scanner does below materialization: keep only values for which
/// `filter` is true and cut records down to `projection`.
#[derive(Clone, Default)]
pub struct Pushdown {
    pub projection: Option<Vec<Vec<String>>>,
    pub filter: Option<Arc<dyn Evaluator>>,
}

impl Pushdown {
    pub fn new(projection: Option<Vec<Vec<String>>>, filter: Option<Arc<dyn Evaluator>>) -> Self {
        Pushdown { projection, filter }
    }

    pub fn keep(&self, val: &Value) -> bool {
        match &self.filter {
            Some(f) => f.eval(val).is_true(),
            None => true,
        }
    }
}

/// Cuts a record down to the fields on `paths`. Paths that do not resolve
/// are left out; values that are not records pass through.
pub fn project(ctx: &TypeContext, val: &Value, paths: &[Vec<String>]) -> Result<Value> {
    if !val.typ().under().is_record() {
        return Ok(val.clone());
    }
    let under = val.under();
    let entries = paths
        .iter()
        .filter_map(|p| under.deref_path(p).map(|v| (p.clone(), v)))
        .collect();
    build_from_paths(ctx, entries)
}

/// Filters and projects a batch worth of values, counting them into
/// `progress`.
pub(crate) fn apply_pushdown(
    ctx: &TypeContext,
    pushdown: &Pushdown,
    vals: Vec<Value>,
    progress: &mut Progress,
) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(vals.len());
    for val in vals {
        let size = val.size() as u64;
        progress.records_read += 1;
        progress.bytes_read += size;
        if !pushdown.keep(&val) {
            continue;
        }
        progress.records_matched += 1;
        progress.bytes_matched += size;
        out.push(match &pushdown.projection {
            Some(paths) => project(ctx, &val, paths)?,
            None => val,
        });
    }
    Ok(out)
}

/// A source over a [`ValueReader`]. The reader is closed when it runs out
/// or when the scan is stopped, after which the scan stays at the end of
/// its stream.
pub struct ReaderScan {
    ctx: Arc<TypeContext>,
    reader: Option<Box<dyn ValueReader>>,
    pushdown: Pushdown,
    meter: Meter,
    batch_size: usize,
}

impl ReaderScan {
    pub fn new(
        ctx: Arc<TypeContext>,
        reader: Box<dyn ValueReader>,
        pushdown: Pushdown,
        meter: Meter,
        batch_size: usize,
    ) -> Self {
        ReaderScan {
            ctx,
            reader: Some(reader),
            pushdown,
            meter,
            batch_size: batch_size.max(1),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self.reader.take() {
            Some(mut r) => r.close(),
            None => Ok(()),
        }
    }
}

impl Puller for ReaderScan {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if done {
            self.close()?;
            return Ok(None);
        }
        loop {
            let Some(reader) = self.reader.as_mut() else {
                return Ok(None);
            };
            let mut vals = Vec::with_capacity(self.batch_size);
            let mut eof = false;
            while vals.len() < self.batch_size {
                match reader.read()? {
                    Some(v) => vals.push(v),
                    None => {
                        eof = true;
                        break;
                    }
                }
            }
            let mut progress = Progress::default();
            let vals = apply_pushdown(&self.ctx, &self.pushdown, vals, &mut progress)?;
            self.meter.add(progress);
            if eof {
                trace!("reader scan reached end of input");
                self.close()?;
            }
            if let Some(b) = batch_of(vals) {
                return Ok(Some(b));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ArrayReader;
    use crate::runtime::expr::This;
    use crate::runtime::expr::binary::{CompareConst, CompareOp};
    use crate::runtime::testutil::{rctx, run};
    use crate::value::sup::parse_values;

    #[test]
    fn reader_scan_filters_projects_and_meters() {
        let rctx = rctx();
        let ctx = rctx.ctx.clone();
        let vals = parse_values(&ctx, "{a:1,b:2} {a:5,b:6} {a:7} 3").unwrap();
        let pred = CompareConst::new(
            CompareOp::Gt,
            Box::new(This::new(ctx.clone(), vec!["a".into()])),
            Value::from_int64(4),
        );
        let pushdown = Pushdown::new(Some(vec![vec!["b".to_string()]]), Some(Arc::new(pred)));
        let meter = Meter::default();
        let mut scan = ReaderScan::new(ctx, Box::new(ArrayReader::new(vals)), pushdown, meter.clone(), 2);
        assert_eq!(vec!["{b:6}", "{}"], run(&mut scan));
        let p = meter.progress();
        assert_eq!(4, p.records_read);
        assert_eq!(2, p.records_matched);
        assert!(run(&mut scan).is_empty());
    }
}
