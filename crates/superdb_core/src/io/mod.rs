//! Value readers and writers for the supported serialization formats.
pub mod csv;
pub mod file;
pub mod json;
pub mod text;
pub mod track;

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use superdb_error::{DbError, Result, not_implemented};
use tracing::debug;

use crate::bsup::{self, ScannerOptions};
use crate::csup;
use crate::types::TypeContext;
use crate::value::Value;
pub use track::Track;

/// A stream of values. `Ok(None)` marks the end of the stream.
pub trait ValueReader: Send {
    fn read(&mut self) -> Result<Option<Value>>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A sink of values. `close` flushes anything buffered.
pub trait ValueWriter: Send {
    fn write(&mut self, val: &Value) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

impl ValueReader for Box<dyn ValueReader> {
    fn read(&mut self) -> Result<Option<Value>> {
        self.as_mut().read()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

/// A reader over values already in memory.
#[derive(Debug, Default)]
pub struct ArrayReader {
    vals: std::collections::VecDeque<Value>,
}

impl ArrayReader {
    pub fn new(vals: Vec<Value>) -> Self {
        ArrayReader { vals: vals.into() }
    }
}

impl ValueReader for ArrayReader {
    fn read(&mut self) -> Result<Option<Value>> {
        Ok(self.vals.pop_front())
    }
}

/// A writer collecting values in memory.
#[derive(Debug, Default)]
pub struct ArrayWriter {
    pub vals: Vec<Value>,
}

impl ValueWriter for ArrayWriter {
    fn write(&mut self, val: &Value) -> Result<()> {
        self.vals.push(val.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Auto,
    Arrows,
    Bsup,
    Csup,
    Csv,
    Json,
    Jsup,
    Line,
    Parquet,
    Sup,
    Tsv,
    Zeek,
}

impl Format {
    pub fn from_name(name: &str) -> Result<Format> {
        Ok(match name {
            "" | "auto" => Format::Auto,
            "arrows" => Format::Arrows,
            "bsup" => Format::Bsup,
            "csup" => Format::Csup,
            "csv" => Format::Csv,
            "json" => Format::Json,
            "jsup" => Format::Jsup,
            "line" => Format::Line,
            "parquet" => Format::Parquet,
            "sup" => Format::Sup,
            "tsv" => Format::Tsv,
            "zeek" => Format::Zeek,
            other => return Err(DbError::new(format!("unknown format: {other}"))),
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Format::Auto => "auto",
            Format::Arrows => "arrows",
            Format::Bsup => "bsup",
            Format::Csup => "csup",
            Format::Csv => "csv",
            Format::Json => "json",
            Format::Jsup => "jsup",
            Format::Line => "line",
            Format::Parquet => "parquet",
            Format::Sup => "sup",
            Format::Tsv => "tsv",
            Format::Zeek => "zeek",
        }
    }

    /// Guesses a format from a path's extension.
    pub fn from_path(path: &str) -> Format {
        let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
        match ext {
            "bsup" => Format::Bsup,
            "csup" => Format::Csup,
            "csv" => Format::Csv,
            "json" | "ndjson" => Format::Json,
            "sup" => Format::Sup,
            "tsv" => Format::Tsv,
            _ => Format::Auto,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    pub format: Format,
    pub bsup: ScannerOptions,
    pub csv_delim: u8,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            format: Format::Auto,
            bsup: ScannerOptions::default(),
            csv_delim: b',',
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub format: Format,
    pub csv_delim: u8,
    pub csup_object_values: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            format: Format::Sup,
            csv_delim: b',',
            csup_object_values: csup::DEFAULT_OBJECT_VALUES,
        }
    }
}

/// Opens a reader over `input`, detecting the format when it is `auto`.
pub fn new_reader(
    ctx: Arc<TypeContext>,
    input: Box<dyn Read + Send>,
    opts: &ReaderOptions,
) -> Result<Box<dyn ValueReader>> {
    let format = match opts.format {
        Format::Auto => {
            let mut track = Track::new(input);
            let format = detect(&mut track)?;
            debug!(%format, "detected input format");
            return open_reader(ctx, Box::new(track.rewind()), format, opts);
        }
        f => f,
    };
    open_reader(ctx, input, format, opts)
}

fn open_reader(
    ctx: Arc<TypeContext>,
    input: Box<dyn Read + Send>,
    format: Format,
    opts: &ReaderOptions,
) -> Result<Box<dyn ValueReader>> {
    Ok(match format {
        Format::Bsup => Box::new(bsup::Scanner::new(ctx, input, opts.bsup)?),
        Format::Csup => Box::new(csup::Reader::from_reader(ctx, input, None)?),
        Format::Csv => Box::new(csv::CsvReader::new(ctx, input, opts.csv_delim)),
        Format::Tsv => Box::new(csv::CsvReader::new(ctx, input, b'\t')),
        Format::Json => Box::new(json::JsonReader::new(ctx, input)),
        Format::Line => Box::new(text::LineReader::new(input)),
        Format::Sup => Box::new(text::SupReader::new(ctx, input)?),
        Format::Auto => return Err(DbError::new("input format must be resolved before opening")),
        f @ (Format::Arrows | Format::Jsup | Format::Parquet | Format::Zeek) => not_implemented!("{f}: format not supported"),
    })
}

/// Number of leading bytes examined when detecting a format.
pub const DETECT_PREFIX_SIZE: usize = 1024 * 1024;

/// Tries, in order, bsup, csup, json and sup, falling back to line.
pub fn detect<R: Read>(track: &mut Track<R>) -> Result<Format> {
    let prefix = track.fill(DETECT_PREFIX_SIZE)?;
    let truncated = prefix.len() >= DETECT_PREFIX_SIZE;
    if bsup::detect(prefix) {
        return Ok(Format::Bsup);
    }
    if csup::detect(prefix) {
        return Ok(Format::Csup);
    }
    if json::detect(prefix, truncated) {
        return Ok(Format::Json);
    }
    if text::detect_sup(prefix) {
        return Ok(Format::Sup);
    }
    Ok(Format::Line)
}

/// Opens a writer for `out`. `auto` writes SUP.
pub fn new_writer(out: Box<dyn Write + Send>, opts: &WriterOptions) -> Result<Box<dyn ValueWriter>> {
    Ok(match opts.format {
        Format::Auto | Format::Sup => Box::new(text::SupWriter::new(out)),
        Format::Bsup => Box::new(bsup::Writer::new(out)),
        Format::Csup => Box::new(csup::Writer::new(out).with_object_values(opts.csup_object_values)),
        Format::Csv => Box::new(csv::CsvWriter::new(out, opts.csv_delim)),
        Format::Tsv => Box::new(csv::CsvWriter::new(out, b'\t')),
        Format::Json => Box::new(json::JsonWriter::new(out)),
        Format::Line => Box::new(text::LineWriter::new(out)),
        f @ (Format::Arrows | Format::Jsup | Format::Parquet | Format::Zeek) => not_implemented!("{f}: format not supported"),
    })
}

/// Reads every value of a reader.
pub fn read_all(r: &mut dyn ValueReader) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    while let Some(v) = r.read()? {
        out.push(v);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use superdb_error::ErrorKind;

    use super::*;
    use crate::value::sup::parse_values;

    fn detect_bytes(b: &[u8]) -> Format {
        let mut track = Track::new(Cursor::new(b.to_vec()));
        detect(&mut track).unwrap()
    }

    #[test]
    fn detection_order() {
        let ctx = TypeContext::new();
        let mut w = bsup::Writer::new(Vec::new());
        for v in parse_values(&ctx, "{a:1}").unwrap() {
            w.write(&v).unwrap();
        }
        w.close().unwrap();
        assert_eq!(Format::Bsup, detect_bytes(&w.into_inner()));
        assert_eq!(Format::Json, detect_bytes(br#"{"a":1} {"a":2}"#));
        assert_eq!(Format::Sup, detect_bytes(b"{a:1} {a:2}"));
        assert_eq!(Format::Line, detect_bytes(b"hello, world\n"));
    }

    #[test]
    fn detected_reader_sees_whole_input() {
        let ctx = Arc::new(TypeContext::new());
        let input: Box<dyn Read + Send> = Box::new(Cursor::new(b"{a:1} {a:2}".to_vec()));
        let mut r = new_reader(ctx, input, &ReaderOptions::default()).unwrap();
        let vals = read_all(&mut r).unwrap();
        assert_eq!(2, vals.len());
        assert_eq!("{a:2}", vals[1].to_string());
    }

    #[test]
    fn unsupported_formats() {
        let ctx = Arc::new(TypeContext::new());
        let opts = ReaderOptions {
            format: Format::from_name("parquet").unwrap(),
            ..Default::default()
        };
        let input: Box<dyn Read + Send> = Box::new(Cursor::new(Vec::new()));
        let err = new_reader(ctx, input, &opts).err().unwrap();
        assert_eq!(ErrorKind::NotImplemented, err.kind());
        assert!(err.to_string().contains("format not supported"));
        assert!(Format::from_name("xml").is_err());
    }
}
