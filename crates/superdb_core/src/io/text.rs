//! SUP and line-oriented text formats.
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::Arc;

use superdb_error::{Result, ResultExt};

use super::{DETECT_PREFIX_SIZE, ValueReader, ValueWriter};
use crate::types::TypeContext;
use crate::value::Value;
use crate::value::sup::{Parser, parse_values};

/// Reads SUP text. The input is parsed up front.
pub struct SupReader {
    vals: VecDeque<Value>,
}

impl SupReader {
    pub fn new<R: Read>(ctx: Arc<TypeContext>, mut input: R) -> Result<Self> {
        let mut text = String::new();
        input.read_to_string(&mut text).context("failed to read SUP input")?;
        let vals = parse_values(&ctx, &text)?;
        Ok(SupReader { vals: vals.into() })
    }
}

impl ValueReader for SupReader {
    fn read(&mut self) -> Result<Option<Value>> {
        Ok(self.vals.pop_front())
    }
}

/// Whether the prefix parses as a sequence of SUP values. A truncated
/// prefix only needs one complete value.
pub fn detect_sup(prefix: &[u8]) -> bool {
    let truncated = prefix.len() >= DETECT_PREFIX_SIZE;
    let text = match std::str::from_utf8(prefix) {
        Ok(s) => s,
        Err(e) if truncated => match std::str::from_utf8(&prefix[..e.valid_up_to()]) {
            Ok(s) => s,
            Err(_) => return false,
        },
        Err(_) => return false,
    };
    let ctx = TypeContext::new();
    let mut p = Parser::new(&ctx, text);
    let mut n = 0;
    loop {
        p.ws();
        if p.eof() {
            return true;
        }
        if p.value().is_err() {
            return truncated && n > 0;
        }
        n += 1;
    }
}

pub struct SupWriter<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> SupWriter<W> {
    pub fn new(out: W) -> Self {
        SupWriter { out }
    }
}

impl<W: Write + Send> ValueWriter for SupWriter<W> {
    fn write(&mut self, val: &Value) -> Result<()> {
        writeln!(self.out, "{val}").context("failed to write SUP output")
    }

    fn close(&mut self) -> Result<()> {
        self.out.flush().context("failed to flush SUP output")
    }
}

/// Reads each line as a string value.
pub struct LineReader<R: Read> {
    lines: std::io::Lines<BufReader<R>>,
}

impl<R: Read> LineReader<R> {
    pub fn new(input: R) -> Self {
        LineReader {
            lines: BufReader::new(input).lines(),
        }
    }
}

impl<R: Read + Send> ValueReader for LineReader<R> {
    fn read(&mut self) -> Result<Option<Value>> {
        match self.lines.next() {
            None => Ok(None),
            Some(line) => {
                let line = line.context("failed to read line input")?;
                Ok(Some(Value::from_str(line.trim_end_matches('\r'))))
            }
        }
    }
}

/// Writes strings verbatim and anything else as SUP, one per line.
pub struct LineWriter<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> LineWriter<W> {
    pub fn new(out: W) -> Self {
        LineWriter { out }
    }
}

impl<W: Write + Send> ValueWriter for LineWriter<W> {
    fn write(&mut self, val: &Value) -> Result<()> {
        let under = val.under();
        let res = match under.as_str() {
            Some(s) => writeln!(self.out, "{s}"),
            None => writeln!(self.out, "{val}"),
        };
        res.context("failed to write line output")
    }

    fn close(&mut self) -> Result<()> {
        self.out.flush().context("failed to flush line output")
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn sup_detect() {
        assert!(detect_sup(b"{a:1} [1,2] \"s\""));
        assert!(detect_sup(b""));
        assert!(!detect_sup(b"1 apple"));
    }

    #[test]
    fn line_writer_unquotes_strings() {
        let mut w = LineWriter::new(Vec::new());
        w.write(&Value::from_str("a b")).unwrap();
        w.write(&Value::from_int64(7)).unwrap();
        w.close().unwrap();
        assert_eq!("a b\n7\n", String::from_utf8(w.out).unwrap());
    }

    #[test]
    fn line_reader_strips_cr() {
        let mut r = LineReader::new(Cursor::new(b"x\r\ny\n".to_vec()));
        assert_eq!(Some("x"), r.read().unwrap().unwrap().as_str());
        assert_eq!(Some("y"), r.read().unwrap().unwrap().as_str());
        assert!(r.read().unwrap().is_none());
    }
}
