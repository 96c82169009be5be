//! JSON values, one per JSON text.
use std::io::{Read, Write};
use std::sync::Arc;

use serde_json::{Map, Number, StreamDeserializer, de::IoRead};
use superdb_error::{DbError, Result, ResultExt};

use super::{ValueReader, ValueWriter};
use crate::types::{ComplexKind, PrimitiveType, TypeContext};
use crate::value::sup::format_value;
use crate::value::{Value, new_array, new_record};

pub struct JsonReader<R: Read> {
    ctx: Arc<TypeContext>,
    stream: StreamDeserializer<'static, IoRead<R>, serde_json::Value>,
}

impl<R: Read> JsonReader<R> {
    pub fn new(ctx: Arc<TypeContext>, input: R) -> Self {
        JsonReader {
            ctx,
            stream: serde_json::Deserializer::from_reader(input).into_iter(),
        }
    }
}

impl<R: Read + Send> ValueReader for JsonReader<R> {
    fn read(&mut self) -> Result<Option<Value>> {
        match self.stream.next() {
            None => Ok(None),
            Some(v) => {
                let v = v.context("failed to parse JSON input")?;
                Ok(Some(from_json(&self.ctx, &v)?))
            }
        }
    }
}

/// Whether the prefix starts with a JSON value. A prefix cut off at the
/// detection limit is accepted when the value was well-formed up to the cut.
pub fn detect(prefix: &[u8], truncated: bool) -> bool {
    let mut stream = serde_json::Deserializer::from_slice(prefix).into_iter::<serde_json::Value>();
    let mut n = 0;
    loop {
        match stream.next() {
            None => return n > 0,
            Some(Ok(_)) => n += 1,
            Some(Err(e)) => return truncated && e.is_eof(),
        }
    }
}

/// Converts parsed JSON into a value. Objects become records with fields
/// in document order.
pub fn from_json(ctx: &TypeContext, v: &serde_json::Value) -> Result<Value> {
    Ok(match v {
        serde_json::Value::Null => Value::null(),
        serde_json::Value::Bool(b) => Value::from_bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from_int64(i)
            } else if let Some(u) = n.as_u64() {
                Value::from_uint64(u)
            } else {
                Value::from_float64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::from_str(s),
        serde_json::Value::Array(elems) => {
            let vals = elems.iter().map(|e| from_json(ctx, e)).collect::<Result<Vec<_>>>()?;
            new_array(ctx, &vals)?
        }
        serde_json::Value::Object(obj) => {
            let fields = obj
                .iter()
                .map(|(k, v)| Ok((k.clone(), from_json(ctx, v)?)))
                .collect::<Result<Vec<_>>>()?;
            new_record(ctx, fields)?
        }
    })
}

/// Converts a value to JSON. Types without a JSON counterpart become their
/// SUP text.
pub fn to_json(val: &Value) -> serde_json::Value {
    let val = val.under();
    if val.is_null() {
        return serde_json::Value::Null;
    }
    match val.typ().kind() {
        Some(ComplexKind::Record(_)) => {
            let mut obj = Map::new();
            for (name, v) in val.fields() {
                obj.insert(name, to_json(&v));
            }
            serde_json::Value::Object(obj)
        }
        Some(ComplexKind::Array(_)) | Some(ComplexKind::Set(_)) => {
            serde_json::Value::Array(val.elements().iter().map(to_json).collect())
        }
        Some(ComplexKind::Map(_, _)) => {
            let elems = val.elements();
            let mut obj = Map::new();
            for kv in elems.chunks(2) {
                if let [k, v] = kv {
                    let key = match k.under().as_str() {
                        Some(s) => s.to_string(),
                        None => format_value(k),
                    };
                    obj.insert(key, to_json(v));
                }
            }
            serde_json::Value::Object(obj)
        }
        Some(ComplexKind::Error(_)) => {
            let mut obj = Map::new();
            let inner = val.error_inner().unwrap_or_else(Value::null);
            obj.insert("error".to_string(), to_json(&inner));
            serde_json::Value::Object(obj)
        }
        Some(ComplexKind::Enum(symbols)) => {
            let idx = val.bytes().map(crate::value::scode::decode_uint).unwrap_or(0) as usize;
            serde_json::Value::String(symbols.get(idx).cloned().unwrap_or_default())
        }
        Some(_) => serde_json::Value::String(format_value(&val)),
        None => primitive_to_json(&val),
    }
}

fn primitive_to_json(val: &Value) -> serde_json::Value {
    let Some(p) = val.typ().primitive() else {
        return serde_json::Value::Null;
    };
    match p {
        PrimitiveType::Bool => serde_json::Value::Bool(val.is_true()),
        PrimitiveType::String => serde_json::Value::String(val.as_str().unwrap_or_default().to_string()),
        PrimitiveType::Type => {
            let s = format_value(val);
            serde_json::Value::String(s.trim_start_matches('<').trim_end_matches('>').to_string())
        }
        p if p.is_float() => val
            .as_float()
            .and_then(Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        p if p.is_unsigned() => val
            .as_uint()
            .map(|u| serde_json::Value::Number(u.into()))
            .unwrap_or(serde_json::Value::Null),
        p if p.is_integer() => val
            .as_int()
            .map(|i| serde_json::Value::Number(i.into()))
            .unwrap_or(serde_json::Value::Null),
        _ => {
            let s = format_value(val);
            serde_json::Value::String(s.trim_matches('"').to_string())
        }
    }
}

pub struct JsonWriter<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonWriter<W> {
    pub fn new(out: W) -> Self {
        JsonWriter { out }
    }
}

impl<W: Write + Send> ValueWriter for JsonWriter<W> {
    fn write(&mut self, val: &Value) -> Result<()> {
        serde_json::to_writer(&mut self.out, &to_json(val))
            .map_err(|e| DbError::with_source("failed to write JSON output", Box::new(e)))?;
        self.out.write_all(b"\n").context("failed to write JSON output")
    }

    fn close(&mut self) -> Result<()> {
        self.out.flush().context("failed to flush JSON output")
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::value::sup::parse_value;

    #[test]
    fn objects_keep_field_order() {
        let ctx = Arc::new(TypeContext::new());
        let mut r = JsonReader::new(ctx, Cursor::new(br#"{"b":1,"a":[1,2]} 2.5"#.to_vec()));
        let v = r.read().unwrap().unwrap();
        assert_eq!("{b:1,a:[1,2]}", v.to_string());
        assert_eq!(Some(2.5), r.read().unwrap().unwrap().as_float());
        assert!(r.read().unwrap().is_none());
    }

    #[test]
    fn writes_one_text_per_value() {
        let ctx = TypeContext::new();
        let mut w = JsonWriter::new(Vec::new());
        w.write(&parse_value(&ctx, "{a:1,t:<int64>,s:|[1,2]|}").unwrap()).unwrap();
        w.write(&parse_value(&ctx, "error(\"boom\")").unwrap()).unwrap();
        w.close().unwrap();
        let out = String::from_utf8(w.out).unwrap();
        assert_eq!("{\"a\":1,\"t\":\"int64\",\"s\":[1,2]}\n{\"error\":\"boom\"}\n", out);
    }

    #[test]
    fn detect_rejects_sup() {
        assert!(detect(br#"{"a":1}"#, false));
        assert!(!detect(b"{a:1}", false));
        assert!(detect(br#"{"a":[1,2"#, true));
    }
}
