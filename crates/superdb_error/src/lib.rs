//! Error type shared by every crate in the workspace.
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error;
use std::fmt;

pub type Result<T, E = DbError> = std::result::Result<T, E>;

/// Broad classification of an error.
///
/// Most errors are `Generic`. The remaining kinds exist so callers can
/// distinguish failures that need special handling (cancellation is never
/// wrapped, type context rejections are reported as compile errors).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Generic,
    Cancelled,
    DuplicateField,
    InvalidUtf8,
    PrimitiveNameCollision,
    UnknownTypeId,
    Format,
    NotImplemented,
}

/// Helper macro for returning a "not implemented" error.
#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)+) => {{
        let msg = format!($($arg)+);
        return Err($crate::DbError::new_kind($crate::ErrorKind::NotImplemented, format!("Not yet implemented: {msg}")));
    }};
}

pub struct DbError {
    inner: Box<DbErrorInner>,
}

struct DbErrorInner {
    kind: ErrorKind,
    msg: String,
    source: Option<Box<dyn Error + Send + Sync>>,
    fields: Vec<ErrorField>,
    backtrace: Backtrace,
}

#[derive(Debug)]
struct ErrorField {
    key: String,
    value: String,
}

impl DbError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self::new_kind(ErrorKind::Generic, msg)
    }

    pub fn new_kind(kind: ErrorKind, msg: impl Into<String>) -> Self {
        DbError {
            inner: Box::new(DbErrorInner {
                kind,
                msg: msg.into(),
                source: None,
                fields: Vec::new(),
                backtrace: Backtrace::capture(),
            }),
        }
    }

    pub fn with_source(msg: impl Into<String>, source: Box<dyn Error + Send + Sync>) -> Self {
        let mut err = Self::new(msg);
        err.inner.source = Some(source);
        err
    }

    /// Error returned when a query's cancellation token trips.
    pub fn cancelled() -> Self {
        Self::new_kind(ErrorKind::Cancelled, "context canceled")
    }

    /// Format error, used for malformed encoded input.
    pub fn format(msg: impl Into<String>) -> Self {
        Self::new_kind(ErrorKind::Format, msg)
    }

    /// Add a field to the error providing additional context.
    pub fn with_field<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: fmt::Display,
    {
        self.inner.fields.push(ErrorField {
            key: key.into(),
            value: value.to_string(),
        });
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.inner.kind
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.kind == ErrorKind::Cancelled
    }

    pub fn get_msg(&self) -> &str {
        &self.inner.msg
    }

    pub fn get_field(&self, key: &str) -> Option<&str> {
        self.inner
            .fields
            .iter()
            .find(|f| f.key == key)
            .map(|f| f.value.as_str())
    }

    pub fn get_backtrace(&self) -> Option<&Backtrace> {
        if self.inner.backtrace.status() == BacktraceStatus::Captured {
            Some(&self.inner.backtrace)
        } else {
            None
        }
    }
}

impl From<fmt::Error> for DbError {
    fn from(value: fmt::Error) -> Self {
        Self::with_source("Format error", Box::new(value))
    }
}

impl From<std::io::Error> for DbError {
    fn from(value: std::io::Error) -> Self {
        Self::with_source("IO error", Box::new(value))
    }
}

impl From<std::str::Utf8Error> for DbError {
    fn from(value: std::str::Utf8Error) -> Self {
        Self::new_kind(ErrorKind::InvalidUtf8, format!("Utf8 error: {value}"))
    }
}

impl From<std::string::FromUtf8Error> for DbError {
    fn from(value: std::string::FromUtf8Error) -> Self {
        Self::new_kind(ErrorKind::InvalidUtf8, format!("Utf8 error: {value}"))
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.msg)?;
        for field in &self.inner.fields {
            write!(f, " [{}: {}]", field.key, field.value)?;
        }
        if let Some(source) = &self.inner.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")?;
        if let Some(bt) = self.get_backtrace() {
            write!(f, "\n\nBacktrace:\n{bt}")?;
        }
        Ok(())
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// An extension trait for adding context to the Error variant of a result.
pub trait ResultExt<T, E> {
    /// Wrap an error with a static context string.
    fn context(self, msg: &'static str) -> Result<T>;

    /// Wrap an error with a context string generated from a function.
    fn context_fn<F>(self, f: F) -> Result<T>
    where
        F: Fn() -> String;
}

impl<T, E: Error + Send + Sync + 'static> ResultExt<T, E> for std::result::Result<T, E> {
    fn context(self, msg: &'static str) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(DbError::with_source(msg, Box::new(e))),
        }
    }

    fn context_fn<F>(self, f: F) -> Result<T>
    where
        F: Fn() -> String,
    {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(DbError::with_source(f(), Box::new(e))),
        }
    }
}

pub trait OptionExt<T> {
    /// Return an error if the option is None.
    fn required(self, msg: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, msg: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(DbError::new(format!("Missing required value: {msg}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_fields_and_source() {
        let io = std::io::Error::other("disk on fire");
        let err = DbError::with_source("failed to read", Box::new(io)).with_field("path", "a.bsup");
        assert_eq!("failed to read [path: a.bsup]: disk on fire", err.to_string());
        assert_eq!(Some("a.bsup"), err.get_field("path"));
    }

    #[test]
    fn cancelled_kind() {
        let err = DbError::cancelled();
        assert!(err.is_cancelled());
        assert!(!DbError::new("other").is_cancelled());
    }

    #[test]
    fn not_implemented_macro() {
        fn f() -> Result<()> {
            not_implemented!("parquet {}", "writer")
        }
        let err = f().unwrap_err();
        assert_eq!(ErrorKind::NotImplemented, err.kind());
        assert_eq!("Not yet implemented: parquet writer", err.to_string());
    }

    #[test]
    fn required_option() {
        let v: Option<u32> = None;
        let err = v.required("pool").unwrap_err();
        assert_eq!("Missing required value: pool", err.to_string());
    }
}
