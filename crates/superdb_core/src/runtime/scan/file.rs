//! Scans over files, globs, stdin and URLs.
use std::io::Read;
use std::sync::Arc;

use parking_lot::Mutex;
use superdb_error::Result;
use tracing::debug;

use super::{Pushdown, ReaderScan};
use crate::csup;
use crate::io::file::{expand_paths, open};
use crate::io::{Format, ReaderOptions, Track, ValueReader, detect, new_reader};
use crate::runtime::{Batch, Meter, Puller, RuntimeContext};
use crate::types::TypeContext;

/// Opens a path as a value reader. An `auto` format is guessed from the
/// extension and then from the content. CSUP input is projected as it is
/// decoded.
pub fn open_path(
    ctx: Arc<TypeContext>,
    path: &str,
    opts: &ReaderOptions,
    projection: Option<Vec<Vec<String>>>,
) -> Result<Box<dyn ValueReader>> {
    let input = open(path)?;
    let format = match opts.format {
        Format::Auto => Format::from_path(path),
        f => f,
    };
    open_input(ctx, input, format, opts, projection)
}

pub(crate) fn open_input(
    ctx: Arc<TypeContext>,
    mut input: Box<dyn Read + Send>,
    mut format: Format,
    opts: &ReaderOptions,
    projection: Option<Vec<Vec<String>>>,
) -> Result<Box<dyn ValueReader>> {
    if format == Format::Auto {
        let mut track = Track::new(input);
        format = detect(&mut track)?;
        input = Box::new(track.rewind());
    }
    if format == Format::Csup {
        return Ok(Box::new(csup::Reader::from_reader(ctx, input, projection)?));
    }
    let opts = ReaderOptions { format, ..*opts };
    new_reader(ctx, input, &opts)
}

struct PathQueue {
    paths: Vec<String>,
    next: usize,
}

/// Reads its paths one after another as a single stream.
///
/// Pullers made by [`FileScan::split`] share the path list and each take
/// the next unread path, so every file is read by exactly one of them.
/// A lone scan starts over from the first path once its stream has ended.
pub struct FileScan {
    rctx: Arc<RuntimeContext>,
    queue: Arc<Mutex<PathQueue>>,
    shared: bool,
    opts: ReaderOptions,
    pushdown: Pushdown,
    meter: Meter,
    current: Option<ReaderScan>,
}

impl FileScan {
    pub fn new(
        rctx: Arc<RuntimeContext>,
        paths: &[String],
        opts: ReaderOptions,
        pushdown: Pushdown,
        meter: Meter,
    ) -> Result<Self> {
        let paths = expand_paths(paths)?;
        debug!(paths = paths.len(), format = %opts.format, "file scan");
        Ok(FileScan {
            rctx,
            queue: Arc::new(Mutex::new(PathQueue { paths, next: 0 })),
            shared: false,
            opts,
            pushdown,
            meter,
            current: None,
        })
    }

    /// Splits the scan into `n` pullers that read disjoint files.
    pub fn split(self, n: usize) -> Vec<FileScan> {
        (0..n.max(1))
            .map(|_| FileScan {
                rctx: self.rctx.clone(),
                queue: self.queue.clone(),
                shared: true,
                opts: self.opts,
                pushdown: self.pushdown.clone(),
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
        debug!(%path, "opening input");
        let reader = open_path(self.rctx.ctx.clone(), &path, &self.opts, self.pushdown.projection.clone())?;
        self.current = Some(ReaderScan::new(
            self.rctx.ctx.clone(),
            reader,
            self.pushdown.clone(),
            self.meter.clone(),
            self.rctx.config.batch_size,
        ));
        Ok(true)
    }
}

impl Puller for FileScan {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if done {
            if let Some(mut cur) = self.current.take() {
                cur.pull(true)?;
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
            let Some(cur) = self.current.as_mut() else {
                return Ok(None);
            };
            match cur.pull(false)? {
                Some(batch) => return Ok(Some(batch)),
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
    use crate::runtime::drain_platoon;
    use crate::runtime::testutil::{rctx, run, text};
    use crate::value::sup::parse_values;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> String {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn reads_paths_in_order_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(&dir, "a.sup", b"1 2 3");
        let b = write_file(&dir, "b.json", b"{\"x\":4}\n");
        let rctx = rctx();
        let mut scan =
            FileScan::new(rctx.clone(), &[a, b], ReaderOptions::default(), Pushdown::default(), Meter::default())
                .unwrap();
        assert_eq!(vec!["1", "2", "3", "{x:4}"], run(&mut scan));
        assert!(scan.pull(true).unwrap().is_none());
        assert_eq!(4, drain_platoon(&mut scan).unwrap().len());
    }

    #[test]
    fn csup_is_projected_while_decoding() {
        let ctx = TypeContext::new();
        let mut w = Writer::new(Vec::new());
        for v in parse_values(&ctx, "{a:1,b:2} {a:3,b:4}").unwrap() {
            w.write(&v).unwrap();
        }
        w.close().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "data", &w.into_inner());
        let rctx = rctx();
        let opts = ReaderOptions::default();
        let mut r = open_path(rctx.ctx.clone(), &path, &opts, Some(vec![vec!["b".to_string()]])).unwrap();
        let mut vals = Vec::new();
        while let Some(v) = r.read().unwrap() {
            vals.push(v);
        }
        assert_eq!(vec!["{b:2}", "{b:4}"], text(&vals));
    }

    #[test]
    fn split_scans_share_paths() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<String> = (0..3).map(|i| write_file(&dir, &format!("{i}.sup"), format!("{i}").as_bytes())).collect();
        let rctx = rctx();
        let scan =
            FileScan::new(rctx, &paths, ReaderOptions::default(), Pushdown::default(), Meter::default()).unwrap();
        let mut parts = scan.split(2);
        let mut seen: Vec<String> = parts.iter_mut().flat_map(|p| run(p)).collect();
        seen.sort();
        assert_eq!(vec!["0", "1", "2"], seen);
    }
}
