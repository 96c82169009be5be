//! CSV and TSV data frames.
use std::io::{Read, Write};
use std::sync::Arc;

use superdb_error::{DbError, Result, ResultExt};

use super::{ValueReader, ValueWriter};
use crate::types::{PrimitiveType, TypeContext};
use crate::value::sup::format_value;
use crate::value::{Value, new_record};

/// Reads a header row followed by records. Numeric cells become float64,
/// `true`/`false` become bool, empty cells are null and anything else is a
/// string.
pub struct CsvReader<R: Read> {
    ctx: Arc<TypeContext>,
    rows: csv::StringRecordsIntoIter<R>,
    header: Vec<String>,
}

impl<R: Read> CsvReader<R> {
    pub fn new(ctx: Arc<TypeContext>, input: R, delim: u8) -> Self {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delim)
            .has_headers(true)
            .flexible(true)
            .from_reader(input);
        let header = reader
            .headers()
            .map(|h| h.iter().map(str::to_string).collect())
            .unwrap_or_default();
        CsvReader {
            ctx,
            rows: reader.into_records(),
            header,
        }
    }
}

fn cell_value(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::null();
    }
    match cell {
        "true" => return Value::from_bool(true),
        "false" => return Value::from_bool(false),
        _ => {}
    }
    match cell.parse::<f64>() {
        Ok(f) if !cell.eq_ignore_ascii_case("nan") && !cell.to_ascii_lowercase().contains("inf") => {
            Value::from_float64(f)
        }
        _ => Value::from_str(cell),
    }
}

impl<R: Read + Send> ValueReader for CsvReader<R> {
    fn read(&mut self) -> Result<Option<Value>> {
        let Some(row) = self.rows.next() else {
            return Ok(None);
        };
        let row = row.context("failed to read CSV input")?;
        let mut fields = Vec::with_capacity(self.header.len());
        for (i, name) in self.header.iter().enumerate() {
            let val = row.get(i).map(cell_value).unwrap_or_else(Value::null);
            fields.push((name.clone(), val));
        }
        Ok(Some(new_record(&self.ctx, fields)?))
    }
}

/// Writes records as rows under a header taken from the first record.
/// Nested records are flattened into dotted column names.
pub struct CsvWriter<W: Write> {
    out: csv::Writer<W>,
    first: Option<Vec<String>>,
}

impl<W: Write> CsvWriter<W> {
    pub fn new(out: W, delim: u8) -> Self {
        CsvWriter {
            out: csv::WriterBuilder::new().delimiter(delim).from_writer(out),
            first: None,
        }
    }
}

fn flatten(prefix: &str, val: &Value, out: &mut Vec<(String, Value)>) {
    for (name, v) in val.fields() {
        let name = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}.{name}")
        };
        if v.typ().under().is_record() {
            flatten(&name, &v, out);
        } else {
            out.push((name, v));
        }
    }
}

fn cell_text(val: &Value) -> String {
    let val = val.under();
    if val.is_null() {
        return String::new();
    }
    match val.typ().primitive() {
        Some(PrimitiveType::String) => val.as_str().unwrap_or_default().to_string(),
        Some(PrimitiveType::Bytes) if val.bytes().is_some_and(|b| b.is_empty()) => String::new(),
        Some(p) if p.is_float() => {
            let s = format_value(&val);
            s.strip_suffix('.').map(str::to_string).unwrap_or(s)
        }
        _ => format_value(&val),
    }
}

impl<W: Write + Send> ValueWriter for CsvWriter<W> {
    fn write(&mut self, val: &Value) -> Result<()> {
        if !val.typ().under().is_record() {
            return Err(DbError::new(format!("CSV output encountered non-record value: {val}")));
        }
        let mut cols = Vec::new();
        flatten("", val, &mut cols);
        match &self.first {
            None => {
                let names: Vec<String> = cols.iter().map(|(n, _)| n.clone()).collect();
                self.out.write_record(&names).context("failed to write CSV header")?;
                self.first = Some(names);
            }
            Some(names) => {
                if names.len() != cols.len() || names.iter().zip(&cols).any(|(a, (b, _))| a != b) {
                    return Err(DbError::new(
                        "CSV output requires uniform records but multiple types encountered: not a data frame (consider 'fuse')",
                    ));
                }
            }
        }
        let row: Vec<String> = cols.iter().map(|(_, v)| cell_text(v)).collect();
        self.out.write_record(&row).context("failed to write CSV row")
    }

    fn close(&mut self) -> Result<()> {
        self.out.flush().context("failed to flush CSV output")
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::value::sup::parse_values;

    #[test]
    fn reads_typed_cells() {
        let ctx = Arc::new(TypeContext::new());
        let mut r = CsvReader::new(ctx, Cursor::new(b"a,b,c\n1,x,\n2.5,true,y\n".to_vec()), b',');
        assert_eq!("{a:1.,b:\"x\",c:null}", r.read().unwrap().unwrap().to_string());
        assert_eq!("{a:2.5,b:true,c:\"y\"}", r.read().unwrap().unwrap().to_string());
        assert!(r.read().unwrap().is_none());
    }

    #[test]
    fn writer_flattens_and_rejects_new_shapes() {
        let ctx = TypeContext::new();
        let vals = parse_values(&ctx, "{a:1,r:{b:\"x\"}} {a:2,r:{b:\"y\"}} {z:1}").unwrap();
        let mut buf = Vec::new();
        {
            let mut w = CsvWriter::new(&mut buf, b',');
            w.write(&vals[0]).unwrap();
            w.write(&vals[1]).unwrap();
            let err = w.write(&vals[2]).unwrap_err();
            assert!(err.to_string().contains("not a data frame"));
            w.close().unwrap();
        }
        assert_eq!("a,r.b\n1,x\n2,y\n", String::from_utf8(buf).unwrap());
    }
}
