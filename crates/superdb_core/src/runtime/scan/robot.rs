//! Scans whose inputs are named at run time: the robot scan reads the
//! paths computed from its parent's values, and the HTTP scan issues one
//! request.
use std::io::Cursor;
use std::sync::Arc;

use superdb_error::Result;
use tracing::debug;

use super::file::{open_input, open_path};
use super::{Pushdown, ReaderScan};
use crate::io::file::{HttpRequest, fetch};
use crate::io::{Format, ReaderOptions};
use crate::runtime::expr::BoxEval;
use crate::runtime::{Batch, BoxPuller, Meter, Puller, RuntimeContext, batch_of};
use crate::value::Value;

/// For each parent value, evaluates `expr` to a path or URL and streams
/// the values read from it. Non-string paths become error values in the
/// output.
pub struct RobotScan {
    rctx: Arc<RuntimeContext>,
    parent: BoxPuller,
    expr: BoxEval,
    opts: ReaderOptions,
    pushdown: Pushdown,
    meter: Meter,
    inputs: Vec<Value>,
    next: usize,
    current: Option<ReaderScan>,
}

impl RobotScan {
    pub fn new(
        rctx: Arc<RuntimeContext>,
        parent: BoxPuller,
        expr: BoxEval,
        opts: ReaderOptions,
        pushdown: Pushdown,
        meter: Meter,
    ) -> Self {
        RobotScan {
            rctx,
            parent,
            expr,
            opts,
            pushdown,
            meter,
            inputs: Vec::new(),
            next: 0,
            current: None,
        }
    }

    /// Opens the next input, returning an error value instead when the
    /// path expression does not yield a string.
    fn open_next(&mut self) -> Result<Option<Value>> {
        let this = &self.inputs[self.next];
        self.next += 1;
        let val = self.expr.eval(this);
        let Some(path) = val.under().as_str().map(str::to_string) else {
            return Ok(Some(self.rctx.ctx.wrap_error("from encountered non-string input", &val)));
        };
        debug!(%path, "robot scan opening input");
        let reader = open_path(self.rctx.ctx.clone(), &path, &self.opts, self.pushdown.projection.clone())?;
        self.current = Some(ReaderScan::new(
            self.rctx.ctx.clone(),
            reader,
            self.pushdown.clone(),
            self.meter.clone(),
            self.rctx.config.batch_size,
        ));
        Ok(None)
    }
}

impl Puller for RobotScan {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if done {
            if let Some(mut cur) = self.current.take() {
                cur.pull(true)?;
            }
            self.inputs.clear();
            self.next = 0;
            return self.parent.pull(true);
        }
        loop {
            if let Some(cur) = self.current.as_mut() {
                match cur.pull(false)? {
                    Some(batch) => return Ok(Some(batch)),
                    None => self.current = None,
                }
            }
            if self.next >= self.inputs.len() {
                let Some(batch) = self.parent.pull(false)? else {
                    return Ok(None);
                };
                self.inputs = batch.into_values();
                self.next = 0;
                continue;
            }
            if let Some(err) = self.open_next()? {
                if let Some(b) = batch_of(vec![err]) {
                    return Ok(Some(b));
                }
            }
        }
    }
}

/// Reads the body of one HTTP request as a value stream.
pub struct HttpScan {
    rctx: Arc<RuntimeContext>,
    req: HttpRequest,
    format: Format,
    opts: ReaderOptions,
    pushdown: Pushdown,
    meter: Meter,
    current: Option<ReaderScan>,
    eos: bool,
}

impl HttpScan {
    pub fn new(
        rctx: Arc<RuntimeContext>,
        req: HttpRequest,
        opts: ReaderOptions,
        pushdown: Pushdown,
        meter: Meter,
    ) -> Self {
        let format = match opts.format {
            Format::Auto => Format::from_path(&req.url),
            f => f,
        };
        HttpScan {
            rctx,
            req,
            format,
            opts,
            pushdown,
            meter,
            current: None,
            eos: false,
        }
    }
}

impl Puller for HttpScan {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if done {
            if let Some(mut cur) = self.current.take() {
                cur.pull(true)?;
            }
            self.eos = false;
            return Ok(None);
        }
        if self.eos {
            self.eos = false;
            return Ok(None);
        }
        if self.current.is_none() {
            let body = fetch(&self.req)?;
            debug!(url = %self.req.url, bytes = body.len(), "http scan fetched body");
            let reader = open_input(
                self.rctx.ctx.clone(),
                Box::new(Cursor::new(body)),
                self.format,
                &self.opts,
                self.pushdown.projection.clone(),
            )?;
            self.current = Some(ReaderScan::new(
                self.rctx.ctx.clone(),
                reader,
                self.pushdown.clone(),
                self.meter.clone(),
                self.rctx.config.batch_size,
            ));
        }
        let Some(cur) = self.current.as_mut() else {
            return Ok(None);
        };
        match cur.pull(false)? {
            Some(batch) => Ok(Some(batch)),
            None => {
                self.current = None;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::runtime::testutil::{rctx, run, source};
    use crate::runtime::expr::This;

    #[test]
    fn robot_reads_computed_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for (name, body) in [("a.sup", "1 2"), ("b.sup", "3")] {
            let path = dir.path().join(name);
            std::fs::File::create(&path).unwrap().write_all(body.as_bytes()).unwrap();
            paths.push(path.to_string_lossy().into_owned());
        }
        let rctx = rctx();
        let src = format!("{{p:{:?}}} {{p:5}} {{p:{:?}}}", paths[0], paths[1]);
        let expr = Box::new(This::new(rctx.ctx.clone(), vec!["p".into()]));
        let mut scan = RobotScan::new(
            rctx.clone(),
            source(&rctx, &src),
            expr,
            ReaderOptions::default(),
            Pushdown::default(),
            Meter::default(),
        );
        let out = run(&mut scan);
        assert_eq!(4, out.len());
        assert_eq!(vec!["1", "2"], out[..2].to_vec());
        assert!(out[2].starts_with("error("));
        assert_eq!("3", out[3]);
    }
}
