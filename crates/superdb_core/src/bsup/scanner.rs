//! Multi-threaded BSUP decoding.
//!
//! An input thread splits the stream into frames and decodes type frames
//! itself, since they extend the shared local type table. Value frames go
//! to a pool of workers along with a snapshot of that table. For each value
//! frame the input thread also queues the receiver of that frame's result,
//! so the consumer sees batches in stream order.
use std::collections::VecDeque;
use std::io::Read;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, bounded};
use superdb_error::{DbError, Result};
use tracing::{debug, trace, warn};

use super::reader::{Frame, FrameReader, LocalTypes, decode_values};
use crate::io::ValueReader;
use crate::types::{Type, TypeContext};
use crate::value::Value;

#[derive(Debug, Clone, Copy)]
pub struct ScannerOptions {
    /// Number of decoding workers. Zero means one per logical CPU.
    pub threads: usize,
    pub read_size: usize,
    pub read_max: usize,
    pub validate: bool,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        ScannerOptions {
            threads: 0,
            read_size: super::reader::DEFAULT_READ_SIZE,
            read_max: super::MAX_FRAME_SIZE,
            validate: false,
        }
    }
}

type BatchResult = Result<Vec<Value>>;

struct Work {
    types: Arc<Vec<Type>>,
    payload: Bytes,
    result: Sender<BatchResult>,
}

pub struct Scanner {
    results: Option<Receiver<Receiver<BatchResult>>>,
    pending: VecDeque<Value>,
    threads: Vec<JoinHandle<()>>,
    bytes_read: Arc<AtomicU64>,
}

impl Scanner {
    pub fn new<R>(ctx: Arc<TypeContext>, input: R, opts: ScannerOptions) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let nthreads = if opts.threads == 0 {
            num_cpus::get()
        } else {
            opts.threads
        };
        let (work_tx, work_rx) = bounded::<Work>(nthreads);
        let (results_tx, results_rx) = bounded::<Receiver<BatchResult>>(nthreads * 2);
        let bytes_read = Arc::new(AtomicU64::new(0));

        let mut threads = Vec::with_capacity(nthreads + 1);
        for i in 0..nthreads {
            let work_rx = work_rx.clone();
            let validate = opts.validate;
            let handle = std::thread::Builder::new()
                .name(format!("bsup-worker-{i}"))
                .spawn(move || worker(work_rx, validate))?;
            threads.push(handle);
        }

        let frames = FrameReader::with_sizes(input, opts.read_size, opts.read_max);
        let counter = bytes_read.clone();
        let handle = std::thread::Builder::new()
            .name("bsup-input".to_string())
            .spawn(move || input_loop(frames, LocalTypes::new(ctx), work_tx, results_tx, counter))?;
        threads.push(handle);
        debug!(workers = nthreads, "started bsup scanner");

        Ok(Scanner {
            results: Some(results_rx),
            pending: VecDeque::new(),
            threads,
            bytes_read,
        })
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Next decoded batch in stream order.
    pub fn read_batch(&mut self) -> Result<Option<Vec<Value>>> {
        let Some(results) = &self.results else {
            return Ok(None);
        };
        let Ok(rx) = results.recv() else {
            return Ok(None);
        };
        match rx.recv() {
            Ok(batch) => batch.map(Some),
            Err(_) => Err(DbError::new("bsup scanner worker exited without a result")),
        }
    }

    fn shutdown(&mut self) {
        // Dropping the queue unblocks the input thread and the workers.
        self.results = None;
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("bsup scanner thread panicked");
            }
        }
    }
}

impl ValueReader for Scanner {
    fn read(&mut self) -> Result<Option<Value>> {
        loop {
            if let Some(val) = self.pending.pop_front() {
                return Ok(Some(val));
            }
            match self.read_batch()? {
                Some(vals) => self.pending.extend(vals),
                None => return Ok(None),
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn input_loop<R: Read + Send>(
    mut frames: FrameReader<R>,
    mut types: LocalTypes,
    work_tx: Sender<Work>,
    results_tx: Sender<Receiver<BatchResult>>,
    bytes_read: Arc<AtomicU64>,
) {
    let fail = |err: DbError| {
        let (tx, rx) = bounded(1);
        let _ = tx.send(Err(err));
        let _ = results_tx.send(rx);
    };
    loop {
        let frame = frames.next_frame();
        bytes_read.store(frames.bytes_read(), Ordering::Relaxed);
        match frame {
            Ok(None) => break,
            Ok(Some(Frame::Types(payload))) => {
                if let Err(err) = types.decode_types(&payload) {
                    fail(err);
                    break;
                }
            }
            Ok(Some(Frame::Values(payload))) => {
                let (tx, rx) = bounded(1);
                if results_tx.send(rx).is_err() {
                    break;
                }
                let work = Work {
                    types: types.snapshot(),
                    payload,
                    result: tx,
                };
                if work_tx.send(work).is_err() {
                    break;
                }
            }
            Ok(Some(Frame::Control(_))) => {}
            Ok(Some(Frame::Eos)) => types.reset(),
            Err(err) => {
                fail(err);
                break;
            }
        }
    }
    trace!("bsup input thread done");
}

fn worker(work_rx: Receiver<Work>, validate: bool) {
    for work in work_rx {
        let result = catch_unwind(AssertUnwindSafe(|| decode_values(&work.types, &work.payload, validate)))
            .unwrap_or_else(|panic| {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(DbError::new(format!("panic in bsup worker: {msg}")))
            });
        // The consumer may have gone away.
        let _ = work.result.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsup::Writer;
    use crate::io::ValueWriter;

    fn encoded(n: i64) -> Vec<u8> {
        let mut w = Writer::new(Vec::new()).with_threshold(16);
        for i in 0..n {
            w.write(&Value::from_int64(i)).unwrap();
        }
        w.close().unwrap();
        w.into_inner()
    }

    #[test]
    fn batches_in_stream_order() {
        let ctx = Arc::new(TypeContext::new());
        let opts = ScannerOptions {
            threads: 4,
            ..Default::default()
        };
        let mut s = Scanner::new(ctx, std::io::Cursor::new(encoded(1000)), opts).unwrap();
        let mut n = 0;
        while let Some(v) = s.read().unwrap() {
            assert_eq!(Some(n), v.as_int());
            n += 1;
        }
        assert_eq!(1000, n);
        s.close().unwrap();
    }

    #[test]
    fn early_drop_joins_threads() {
        let ctx = Arc::new(TypeContext::new());
        let mut s = Scanner::new(ctx, std::io::Cursor::new(encoded(10_000)), ScannerOptions::default()).unwrap();
        assert!(s.read().unwrap().is_some());
        drop(s);
    }

    #[test]
    fn corrupt_input_errors() {
        let ctx = Arc::new(TypeContext::new());
        let mut buf = encoded(10);
        buf.truncate(buf.len() - 3);
        let mut s = Scanner::new(ctx, std::io::Cursor::new(buf), ScannerOptions::default()).unwrap();
        let mut result = Ok(None);
        for _ in 0..20 {
            result = s.read();
            if !matches!(result, Ok(Some(_))) {
                break;
            }
        }
        assert!(result.is_err());
    }
}
