//! File scan for the vector runtime.
//!
//! CSUP objects load straight into vectors: records become column sets,
//! dictionary and constant nodes keep their compact form, and objects the
//! metadata filter rules out are never decoded. Other formats are read as
//! values and dematerialized.
use std::io::Read;
use std::sync::Arc;

use parking_lot::Mutex;
use superdb_error::{DbError, Result};
use tracing::{debug, trace};

use super::{Dematerializer, DictVec, DynamicVec, RecordVec, Vector};
use crate::csup::metadata::Metadata;
use crate::csup::reader::{Object, Projection};
use crate::csup;
use crate::io::file::{expand_paths, open};
use crate::io::{Format, ReaderOptions, Track, detect};
use crate::runtime::expr::BoxEval;
use crate::runtime::scan::file::open_input;
use crate::runtime::scan::{Pushdown, ReaderScan};
use crate::runtime::{Chunk, Meter, Progress, Puller, RuntimeContext};
use crate::types::Field;
use crate::value::sup::parse_value;

/// Selects CSUP objects by their `{path: {min, max}}` metadata. An object
/// is skipped only when the selector is false.
pub struct MetaFilter {
    paths: Vec<Vec<String>>,
    expr: BoxEval,
}

impl MetaFilter {
    /// `paths` are the leaf paths whose ranges the selector reads.
    pub fn new(paths: Vec<Vec<String>>, expr: BoxEval) -> Self {
        MetaFilter { paths, expr }
    }

    fn keep(&self, obj: &Object) -> Result<bool> {
        let meta = obj.metadata_record(&self.paths)?;
        let verdict = self.expr.eval(&meta);
        Ok(verdict.is_true() || verdict.as_bool().is_none())
    }
}

/// Loads a whole object as a vector.
pub fn load_object(obj: &Object, projection: &Projection) -> Result<Vector> {
    match obj.node(obj.root())? {
        Metadata::Dynamic { tags, values, .. } => {
            let tags = obj.u32s(tags)?;
            let mut vecs = Vec::with_capacity(values.len());
            for id in values {
                vecs.push(load_node(obj, *id, projection)?);
            }
            let mut cursors = vec![0u32; vecs.len()];
            let mut index = Vec::with_capacity(tags.len());
            for tag in &tags {
                let cursor = cursors
                    .get_mut(*tag as usize)
                    .ok_or_else(|| DbError::format("CSUP dynamic tag out of range"))?;
                index.push(*cursor);
                *cursor += 1;
            }
            Ok(Vector::Dynamic(DynamicVec {
                tags,
                index,
                values: vecs,
            }))
        }
        _ => load_node(obj, obj.root(), projection),
    }
}

fn load_node(obj: &Object, id: u32, projection: &Projection) -> Result<Vector> {
    match obj.node(id)? {
        Metadata::Record { length, fields } => {
            let mut types = Vec::with_capacity(fields.len());
            let mut cols = Vec::with_capacity(fields.len());
            for f in fields {
                let sub = match projection {
                    Projection::All => &Projection::All,
                    Projection::Fields(want) => match want.get(&f.name) {
                        Some(sub) => sub,
                        None => continue,
                    },
                };
                let col = load_node(obj, f.values, sub)?;
                let typ = col
                    .uniform_type()
                    .ok_or_else(|| DbError::format("CSUP record field is not single-typed"))?;
                types.push(Field::new(f.name.clone(), typ));
                cols.push(col);
            }
            Ok(Vector::Record(RecordVec {
                typ: obj.ctx().lookup_record(types)?,
                fields: cols,
                len: *length as usize,
                nulls: Default::default(),
            }))
        }
        Metadata::Dict { values, index, .. } => {
            let values = load_node(obj, *values, &Projection::All)?;
            let index = obj.segment(index)?.iter().map(|i| *i as u32).collect();
            Ok(Vector::Dict(DictVec {
                values: Box::new(values),
                index,
            }))
        }
        Metadata::Const { value, count } => Ok(Vector::Const(parse_value(obj.ctx(), value)?, *count as usize)),
        Metadata::Nulls { runs, values, .. } if obj.u32s(runs)?.len() <= 1 => load_node(obj, *values, projection),
        _ => {
            let col = obj.column(id, projection)?;
            Ok(Vector::from_bodies(&col.typ, &col.bodies))
        }
    }
}

enum Source {
    Csup {
        reader: csup::Reader<Box<dyn Read + Send>>,
        object: Option<(Vector, usize)>,
    },
    Rows(Dematerializer),
}

struct PathQueue {
    paths: Vec<String>,
    next: usize,
}

/// Reads its paths one after another as a stream of vectors. Pullers made
/// by [`VecFileScan::split`] share the path list.
pub struct VecFileScan {
    rctx: Arc<RuntimeContext>,
    queue: Arc<Mutex<PathQueue>>,
    shared: bool,
    opts: ReaderOptions,
    pushdown: Pushdown,
    projection: Projection,
    meta_filter: Option<Arc<MetaFilter>>,
    meter: Meter,
    current: Option<Source>,
}

impl VecFileScan {
    pub fn new(
        rctx: Arc<RuntimeContext>,
        paths: &[String],
        opts: ReaderOptions,
        pushdown: Pushdown,
        meta_filter: Option<MetaFilter>,
        meter: Meter,
    ) -> Result<Self> {
        let paths = expand_paths(paths)?;
        debug!(paths = paths.len(), format = %opts.format, "vector file scan");
        let projection = match &pushdown.projection {
            None => Projection::All,
            Some(paths) => Projection::from_paths(paths),
        };
        Ok(VecFileScan {
            rctx,
            queue: Arc::new(Mutex::new(PathQueue { paths, next: 0 })),
            shared: false,
            opts,
            pushdown,
            projection,
            meta_filter: meta_filter.map(Arc::new),
            meter,
            current: None,
        })
    }

    pub fn split(self, n: usize) -> Vec<VecFileScan> {
        (0..n.max(1))
            .map(|_| VecFileScan {
                rctx: self.rctx.clone(),
                queue: self.queue.clone(),
                shared: true,
                opts: self.opts,
                pushdown: self.pushdown.clone(),
                projection: self.projection.clone(),
                meta_filter: self.meta_filter.clone(),
                meter: self.meter.clone(),
                current: None,
            })
            .collect()
    }

    fn open_next(&mut self) -> Result<bool> {
        let path = {
            let mut q = self.queue.lock();
            let Some(path) = q.paths.get(q.next).cloned() else {
                if !self.shared {
                    q.next = 0;
                }
                return Ok(false);
            };
            q.next += 1;
            path
        };
        debug!(%path, "opening vector input");
        let mut input = open(&path)?;
        let mut format = match self.opts.format {
            Format::Auto => Format::from_path(&path),
            f => f,
        };
        if format == Format::Auto {
            let mut track = Track::new(input);
            format = detect(&mut track)?;
            input = Box::new(track.rewind());
        }
        let ctx = self.rctx.ctx.clone();
        self.current = Some(if format == Format::Csup {
            Source::Csup {
                reader: csup::Reader::from_reader(ctx, input, None)?,
                object: None,
            }
        } else {
            let reader = open_input(ctx.clone(), input, format, &self.opts, self.pushdown.projection.clone())?;
            let scan = ReaderScan::new(
                ctx,
                reader,
                self.pushdown.clone(),
                self.meter.clone(),
                self.rctx.config.batch_size,
            );
            Source::Rows(Dematerializer::new(Box::new(scan)))
        });
        Ok(true)
    }

    /// Next object that passes the metadata filter, loaded and filtered.
    fn next_object(&mut self) -> Result<Option<Vector>> {
        let Some(Source::Csup { reader, .. }) = self.current.as_mut() else {
            return Ok(None);
        };
        while let Some(obj) = reader.next_object()? {
            let mut progress = Progress {
                records_read: obj.len() as u64,
                bytes_read: obj.size() as u64,
                ..Default::default()
            };
            if let Some(mf) = &self.meta_filter {
                if !mf.keep(&obj)? {
                    trace!(values = obj.len(), "metadata filter skipped object");
                    self.meter.add(progress);
                    continue;
                }
            }
            let mut vec = load_object(&obj, &self.projection)?;
            if let Some(filter) = &self.pushdown.filter {
                let keep: Vec<u32> = (0..vec.len())
                    .filter(|i| filter.eval(&vec.value_at(*i)).is_true())
                    .map(|i| i as u32)
                    .collect();
                if keep.len() != vec.len() {
                    vec = vec.pick(keep);
                }
            }
            progress.records_matched = vec.len() as u64;
            progress.bytes_matched = match obj.len() {
                0 => 0,
                n => obj.size() as u64 * vec.len() as u64 / n as u64,
            };
            self.meter.add(progress);
            if !vec.is_empty() {
                return Ok(Some(vec));
            }
        }
        Ok(None)
    }

    fn pull_current(&mut self) -> Result<Option<Vector>> {
        let batch_size = self.rctx.config.batch_size.max(1);
        loop {
            match self.current.as_mut() {
                None => return Ok(None),
                Some(Source::Rows(rows)) => return rows.pull(false),
                Some(Source::Csup { object, .. }) => {
                    if let Some((vec, off)) = object.as_mut() {
                        if *off < vec.len() {
                            let end = (*off + batch_size).min(vec.len());
                            let out = if *off == 0 && end == vec.len() {
                                vec.clone()
                            } else {
                                vec.slice(*off, end)
                            };
                            *off = end;
                            return Ok(Some(out));
                        }
                    }
                    let next = self.next_object()?;
                    let Some(Source::Csup { object, .. }) = self.current.as_mut() else {
                        return Ok(None);
                    };
                    match next {
                        Some(vec) => *object = Some((vec, 0)),
                        None => return Ok(None),
                    }
                }
            }
        }
    }
}

impl Puller<Vector> for VecFileScan {
    fn pull(&mut self, done: bool) -> Result<Option<Vector>> {
        if done {
            if let Some(Source::Rows(mut rows)) = self.current.take() {
                rows.pull(true)?;
            }
            if !self.shared {
                self.queue.lock().next = 0;
            }
            return Ok(None);
        }
        loop {
            self.rctx.token().check()?;
            if self.current.is_none() && !self.open_next()? {
                return Ok(None);
            }
            match self.pull_current()? {
                Some(vec) => return Ok(Some(vec)),
                None => self.current = None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::csup::Writer;
    use crate::io::ValueWriter;
    use crate::runtime::expr::binary::{CompareConst, CompareOp};
    use crate::runtime::expr::This;
    use crate::runtime::testutil::rctx;
    use crate::types::TypeContext;
    use crate::value::Value;
    use crate::value::sup::parse_values;
    use crate::vector::testutil::vrun;

    fn write_csup(dir: &tempfile::TempDir, name: &str, src: &str, object_values: usize) -> String {
        let ctx = TypeContext::new();
        let mut w = Writer::new(Vec::new()).with_object_values(object_values);
        for v in parse_values(&ctx, src).unwrap() {
            w.write(&v).unwrap();
        }
        w.close().unwrap();
        let buf = w.into_inner();
        let path = dir.path().join(name);
        std::fs::File::create(&path).unwrap().write_all(&buf).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn loads_columns_with_projection() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csup(&dir, "a.csup", "{a:1,b:\"x\"} {a:2,b:\"x\"} {a:3,b:\"y\"}", 100);
        let rctx = rctx();
        let pushdown = Pushdown::new(Some(vec![vec!["a".to_string()]]), None);
        let scan = VecFileScan::new(rctx.clone(), &[path], ReaderOptions::default(), pushdown, None, Meter::default())
            .unwrap();
        assert_eq!(vec!["{a:1}", "{a:2}", "{a:3}"], vrun(Box::new(scan)));
    }

    #[test]
    fn mixed_objects_load_as_dynamic() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csup(&dir, "m.csup", "1 \"two\" {x:3} 4 null", 100);
        let rctx = rctx();
        let scan =
            VecFileScan::new(rctx.clone(), &[path], ReaderOptions::default(), Pushdown::default(), None, Meter::default())
                .unwrap();
        assert_eq!(vec!["1", "\"two\"", "{x:3}", "4", "null"], vrun(Box::new(scan)));
    }

    #[test]
    fn metadata_filter_skips_objects() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csup(&dir, "k.csup", "{k:1} {k:2} {k:10} {k:11}", 2);
        let rctx = rctx();
        let max = Box::new(This::new(rctx.ctx.clone(), vec!["k".into(), "max".into()]));
        let selector = Box::new(CompareConst::new(CompareOp::Ge, max, Value::from_int64(10)));
        let meter = Meter::default();
        let scan = VecFileScan::new(
            rctx.clone(),
            &[path],
            ReaderOptions::default(),
            Pushdown::default(),
            Some(MetaFilter::new(vec![vec!["k".into()]], selector)),
            meter.clone(),
        )
        .unwrap();
        assert_eq!(vec!["{k:10}", "{k:11}"], vrun(Box::new(scan)));
        let progress = meter.progress();
        assert_eq!(4, progress.records_read);
        assert_eq!(2, progress.records_matched);
    }

    #[test]
    fn other_formats_are_dematerialized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sup");
        std::fs::File::create(&path).unwrap().write_all(b"{a:1} {a:2}").unwrap();
        let rctx = rctx();
        let scan = VecFileScan::new(
            rctx.clone(),
            &[path.to_string_lossy().into_owned()],
            ReaderOptions::default(),
            Pushdown::default(),
            None,
            Meter::default(),
        )
        .unwrap();
        assert_eq!(vec!["{a:1}", "{a:2}"], vrun(Box::new(scan)));
    }
}
