use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use superdb_error::{DbError, Result, ResultExt};
use tracing::{debug, warn};

use super::catcher::panic_message;
use crate::config::session::SessionConfig;
use crate::types::TypeContext;

/// Cooperative cancellation shared by every worker of a query.
///
/// [`CancelToken::done`] returns a receiver that disconnects on cancel, so
/// workers can wait on it alongside their own channels in a `select!`.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug)]
struct CancelInner {
    cancelled: AtomicBool,
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        CancelToken {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.tx.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Never yields a message; a receive fails once the token is cancelled.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.rx
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(DbError::cancelled());
        }
        Ok(())
    }
}

/// Counts running workers so cancellation can wait for their cleanup.
#[derive(Debug, Clone, Default)]
pub struct WaitGroup {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl WaitGroup {
    pub fn add(&self) -> WaitGuard {
        *self.inner.0.lock() += 1;
        WaitGuard {
            group: self.clone(),
        }
    }

    /// Blocks until every outstanding guard is dropped.
    pub fn wait(&self) {
        let (count, cond) = &*self.inner;
        let mut n = count.lock();
        while *n > 0 {
            cond.wait(&mut n);
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.inner.0.lock()
    }
}

#[derive(Debug)]
pub struct WaitGuard {
    group: WaitGroup,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        let (count, cond) = &*self.group.inner;
        let mut n = count.lock();
        *n = n.saturating_sub(1);
        if *n == 0 {
            cond.notify_all();
        }
    }
}

/// Bytes and records read and matched by a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub bytes_read: u64,
    pub bytes_matched: u64,
    pub records_read: u64,
    pub records_matched: u64,
}

impl Progress {
    pub fn add(&mut self, other: Progress) {
        self.bytes_read += other.bytes_read;
        self.bytes_matched += other.bytes_matched;
        self.records_read += other.records_read;
        self.records_matched += other.records_matched;
    }
}

/// Progress counters updated concurrently by scanners.
#[derive(Debug, Clone, Default)]
pub struct Meter {
    inner: Arc<MeterInner>,
}

#[derive(Debug, Default)]
struct MeterInner {
    bytes_read: AtomicU64,
    bytes_matched: AtomicU64,
    records_read: AtomicU64,
    records_matched: AtomicU64,
}

impl Meter {
    pub fn add(&self, p: Progress) {
        let m = &self.inner;
        m.bytes_read.fetch_add(p.bytes_read, Ordering::Relaxed);
        m.bytes_matched.fetch_add(p.bytes_matched, Ordering::Relaxed);
        m.records_read.fetch_add(p.records_read, Ordering::Relaxed);
        m.records_matched.fetch_add(p.records_matched, Ordering::Relaxed);
    }

    pub fn progress(&self) -> Progress {
        let m = &self.inner;
        Progress {
            bytes_read: m.bytes_read.load(Ordering::Relaxed),
            bytes_matched: m.bytes_matched.load(Ordering::Relaxed),
            records_read: m.records_read.load(Ordering::Relaxed),
            records_matched: m.records_matched.load(Ordering::Relaxed),
        }
    }
}

/// Per-query execution state shared by all operators.
#[derive(Debug)]
pub struct RuntimeContext {
    pub ctx: Arc<TypeContext>,
    pub config: SessionConfig,
    cancel: CancelToken,
    group: WaitGroup,
    temp_files: Arc<AtomicUsize>,
}

impl RuntimeContext {
    pub fn new(ctx: Arc<TypeContext>, config: SessionConfig) -> Arc<Self> {
        Arc::new(RuntimeContext {
            ctx,
            config,
            cancel: CancelToken::new(),
            group: WaitGroup::default(),
            temp_files: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn wait_group(&self) -> &WaitGroup {
        &self.group
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Trips the cancellation token and waits for registered workers to
    /// release their resources.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.group.wait();
        debug!(temp_files = self.temp_files(), "runtime cancelled");
    }

    /// Number of spill files currently alive.
    pub fn temp_files(&self) -> usize {
        self.temp_files.load(Ordering::SeqCst)
    }

    /// Creates an anonymous spill file tracked by the temp-file counter.
    pub fn new_spill_file(&self) -> Result<SpillFile> {
        let file = tempfile::tempfile().context("failed to create spill file")?;
        self.temp_files.fetch_add(1, Ordering::SeqCst);
        Ok(SpillFile {
            file,
            counter: self.temp_files.clone(),
        })
    }

    /// Runs `f` on a named thread registered with the wait group. A panic in
    /// `f` is logged and swallowed; `f` reports failures through its own
    /// channels.
    pub fn spawn<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.group.add();
        let thread_name = name.to_string();
        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let _guard = guard;
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                    warn!(thread = %thread_name, msg = %panic_message(&payload), "worker panicked");
                }
            })
            .context_fn(|| format!("failed to spawn {name} worker"))?;
        Ok(())
    }
}

/// A temporary file that decrements the context's temp-file count when
/// dropped. The OS removes the file once it is closed.
#[derive(Debug)]
pub struct SpillFile {
    file: File,
    counter: Arc<AtomicUsize>,
}

impl SpillFile {
    pub fn rewind(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0)).context("failed to rewind spill file")?;
        Ok(())
    }
}

impl Read for SpillFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for SpillFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn cancel_waits_for_workers() {
        let rctx = RuntimeContext::new(Arc::new(TypeContext::new()), SessionConfig::default());
        let token = rctx.token().clone();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        rctx.spawn("test", move || {
            // Blocks until cancelled.
            let _ = token.done().recv();
            thread::sleep(Duration::from_millis(10));
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        rctx.cancel();
        assert!(finished.load(Ordering::SeqCst));
        assert!(rctx.token().check().unwrap_err().is_cancelled());
    }

    #[test]
    fn spill_files_are_counted() {
        let rctx = RuntimeContext::new(Arc::new(TypeContext::new()), SessionConfig::default());
        let mut f = rctx.new_spill_file().unwrap();
        assert_eq!(1, rctx.temp_files());
        f.write_all(b"abc").unwrap();
        f.rewind().unwrap();
        let mut s = String::new();
        f.read_to_string(&mut s).unwrap();
        assert_eq!("abc", s);
        drop(f);
        assert_eq!(0, rctx.temp_files());
    }

    #[test]
    fn meter_accumulates() {
        let m = Meter::default();
        m.add(Progress {
            bytes_read: 10,
            records_read: 2,
            ..Default::default()
        });
        m.clone().add(Progress {
            bytes_read: 5,
            records_matched: 1,
            ..Default::default()
        });
        let p = m.progress();
        assert_eq!((15, 2, 1), (p.bytes_read, p.records_read, p.records_matched));
    }
}
