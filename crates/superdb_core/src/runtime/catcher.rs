use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};

use superdb_error::{DbError, Result};
use tracing::warn;

use super::{Batch, BoxPuller, Puller};

/// Converts panics raised while pulling into errors.
pub struct Catcher {
    parent: BoxPuller,
}

impl Catcher {
    pub fn new(parent: BoxPuller) -> Self {
        Catcher { parent }
    }
}

impl Puller for Catcher {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.parent.pull(done))) {
            Ok(result) => result,
            Err(payload) => Err(panic_error(&payload)),
        }
    }
}

pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Error for a recovered panic, carrying the backtrace of the recovery
/// point as a field.
pub fn panic_error(payload: &Box<dyn Any + Send>) -> DbError {
    let msg = panic_message(payload);
    let backtrace = Backtrace::force_capture();
    warn!(%msg, "recovered from panic");
    DbError::new(format!("panic: {msg}")).with_field("backtrace", backtrace.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Boom;

    impl Puller for Boom {
        fn pull(&mut self, _done: bool) -> Result<Option<Batch>> {
            panic!("kaboom")
        }
    }

    #[test]
    fn panic_becomes_error() {
        let mut c = Catcher::new(Box::new(Boom));
        let err = c.pull(false).unwrap_err();
        assert!(err.to_string().contains("kaboom"));
        assert!(err.get_field("backtrace").is_some());
    }
}
