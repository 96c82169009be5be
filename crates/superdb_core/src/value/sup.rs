//! SUP, the human-readable text form of values and types.
//!
//! Values whose type cannot be inferred from their literal syntax carry a
//! `::type` decorator; named types are decorated with `::=name`.
use std::fmt::{self, Write};
use std::net::IpAddr;

use chrono::{DateTime, SecondsFormat};
use superdb_error::{DbError, Result};

use super::coerce::cast_value;
use super::scode;
use super::{Value, ValueBuilder, new_array, new_record, new_set, unify_types};
use crate::types::{ComplexKind, Field, PrimitiveType, Type, TypeContext};

pub fn format_value(val: &Value) -> String {
    let mut s = String::new();
    let _ = write_value(&mut s, val);
    s
}

pub fn format_type(typ: &Type) -> String {
    let mut s = String::new();
    let _ = write_type(&mut s, typ);
    s
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

fn write_name<W: Write + ?Sized>(w: &mut W, name: &str) -> fmt::Result {
    if is_identifier(name) && PrimitiveType::from_name(name).is_none() {
        w.write_str(name)
    } else {
        write_quoted(w, name)
    }
}

fn write_field_name<W: Write + ?Sized>(w: &mut W, name: &str) -> fmt::Result {
    if is_identifier(name) {
        w.write_str(name)
    } else {
        write_quoted(w, name)
    }
}

fn write_quoted<W: Write + ?Sized>(w: &mut W, s: &str) -> fmt::Result {
    match serde_json::to_string(s) {
        Ok(q) => w.write_str(&q),
        Err(_) => write!(w, "{s:?}"),
    }
}

pub fn write_type<W: Write + ?Sized>(w: &mut W, typ: &Type) -> fmt::Result {
    let kind = match typ {
        Type::Primitive(p) => return w.write_str(p.name()),
        Type::Complex(c) => &c.kind,
    };
    match kind {
        ComplexKind::Record(fields) => {
            w.write_char('{')?;
            for (i, field) in fields.iter().enumerate() {
                if i > 0 {
                    w.write_char(',')?;
                }
                write_field_name(w, &field.name)?;
                w.write_char(':')?;
                write_type(w, &field.typ)?;
            }
            w.write_char('}')
        }
        ComplexKind::Array(inner) => {
            w.write_char('[')?;
            write_type(w, inner)?;
            w.write_char(']')
        }
        ComplexKind::Set(inner) => {
            w.write_str("|[")?;
            write_type(w, inner)?;
            w.write_str("]|")
        }
        ComplexKind::Map(k, v) => {
            w.write_str("|{")?;
            write_type(w, k)?;
            w.write_char(':')?;
            write_type(w, v)?;
            w.write_str("}|")
        }
        ComplexKind::Union(types) => {
            w.write_char('(')?;
            for (i, t) in types.iter().enumerate() {
                if i > 0 {
                    w.write_char('|')?;
                }
                write_type(w, t)?;
            }
            w.write_char(')')
        }
        ComplexKind::Enum(symbols) => {
            w.write_str("enum(")?;
            for (i, s) in symbols.iter().enumerate() {
                if i > 0 {
                    w.write_char(',')?;
                }
                write_field_name(w, s)?;
            }
            w.write_char(')')
        }
        ComplexKind::Error(inner) => {
            w.write_str("error(")?;
            write_type(w, inner)?;
            w.write_char(')')
        }
        ComplexKind::Named(name, inner) => {
            write_name(w, name)?;
            w.write_char('=')?;
            write_type(w, inner)
        }
    }
}

/// Types whose values are recognized from their literal syntax alone.
fn is_implied(typ: &Type) -> bool {
    matches!(
        typ.primitive(),
        Some(
            PrimitiveType::Int64
                | PrimitiveType::Float64
                | PrimitiveType::Bool
                | PrimitiveType::String
                | PrimitiveType::Null
                | PrimitiveType::Time
                | PrimitiveType::Duration
                | PrimitiveType::Ip
                | PrimitiveType::Net
                | PrimitiveType::Bytes
                | PrimitiveType::Type
        )
    )
}

pub fn write_value<W: Write + ?Sized>(w: &mut W, val: &Value) -> fmt::Result {
    let typ = val.typ();
    let Some(body) = val.bytes() else {
        w.write_str("null")?;
        if !typ.is_null() {
            return decorate(w, typ);
        }
        return Ok(());
    };
    let kind = match typ {
        Type::Primitive(p) => {
            write_primitive(w, *p, body)?;
            if !is_implied(typ) {
                w.write_str("::")?;
                w.write_str(p.name())?;
            }
            return Ok(());
        }
        Type::Complex(c) => &c.kind,
    };
    match kind {
        ComplexKind::Record(_) => {
            w.write_char('{')?;
            for (i, (name, field)) in val.fields().iter().enumerate() {
                if i > 0 {
                    w.write_char(',')?;
                }
                write_field_name(w, name)?;
                w.write_char(':')?;
                write_value(w, field)?;
            }
            w.write_char('}')
        }
        ComplexKind::Array(inner) | ComplexKind::Set(inner) => {
            let set = matches!(kind, ComplexKind::Set(_));
            w.write_str(if set { "|[" } else { "[" })?;
            let elems = val.elements();
            for (i, elem) in elems.iter().enumerate() {
                if i > 0 {
                    w.write_char(',')?;
                }
                write_value(w, &elem.under())?;
            }
            w.write_str(if set { "]|" } else { "]" })?;
            if (elems.is_empty() && !inner.is_null()) || inner.is_union() {
                decorate(w, typ)?;
            }
            Ok(())
        }
        ComplexKind::Map(k, v) => {
            w.write_str("|{")?;
            let elems = val.elements();
            for (i, pair) in elems.chunks(2).enumerate() {
                if i > 0 {
                    w.write_char(',')?;
                }
                write_value(w, &pair[0].under())?;
                w.write_char(':')?;
                if let Some(v) = pair.get(1) {
                    write_value(w, &v.under())?;
                }
            }
            w.write_str("}|")?;
            if elems.is_empty() || k.is_union() || v.is_union() {
                decorate(w, typ)?;
            }
            Ok(())
        }
        ComplexKind::Union(_) => {
            write_value(w, &val.under())?;
            decorate(w, typ)
        }
        ComplexKind::Enum(symbols) => {
            let idx = scode::decode_uint(body) as usize;
            match symbols.get(idx) {
                Some(sym) => write_quoted(w, sym)?,
                None => write!(w, "{idx}")?,
            }
            decorate(w, typ)
        }
        ComplexKind::Error(_) => {
            w.write_str("error(")?;
            if let Some(inner) = val.error_inner() {
                write_value(w, &inner)?;
            }
            w.write_char(')')
        }
        ComplexKind::Named(name, inner) => {
            write_value(w, &Value::new(inner.clone(), val.body().cloned()))?;
            w.write_str("::=")?;
            write_name(w, name)
        }
    }
}

fn decorate<W: Write + ?Sized>(w: &mut W, typ: &Type) -> fmt::Result {
    w.write_str("::")?;
    if typ.named().is_some() {
        w.write_char('(')?;
        write_type(w, typ)?;
        return w.write_char(')');
    }
    write_type(w, typ)
}

fn write_float<W: Write + ?Sized>(w: &mut W, f: f64) -> fmt::Result {
    if f.is_nan() {
        w.write_str("NaN")
    } else if f.is_infinite() {
        w.write_str(if f > 0.0 { "+Inf" } else { "-Inf" })
    } else if f == (f as i64) as f64 && f.abs() < 1e18 {
        write!(w, "{}.", f as i64)
    } else {
        write!(w, "{f}")
    }
}

pub fn format_duration(nanos: i64) -> String {
    if nanos == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    if nanos < 0 {
        out.push('-');
    }
    let mut n = nanos.unsigned_abs();
    const SEC: u64 = 1_000_000_000;
    if n < SEC {
        let (unit, div) = if n < 1_000 {
            ("ns", 1)
        } else if n < 1_000_000 {
            ("us", 1_000)
        } else {
            ("ms", 1_000_000)
        };
        out.push_str(&trim_fraction(n / div, n % div, div));
        out.push_str(unit);
        return out;
    }
    let hours = n / (3600 * SEC);
    n %= 3600 * SEC;
    let mins = n / (60 * SEC);
    n %= 60 * SEC;
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if hours > 0 || mins > 0 {
        out.push_str(&format!("{mins}m"));
    }
    out.push_str(&trim_fraction(n / SEC, n % SEC, SEC));
    out.push('s');
    out
}

fn trim_fraction(whole: u64, frac: u64, div: u64) -> String {
    if frac == 0 {
        return whole.to_string();
    }
    let width = div.to_string().len() - 1;
    let digits = format!("{frac:0width$}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

pub fn format_time(nanos: i64) -> String {
    DateTime::from_timestamp_nanos(nanos).to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn write_primitive<W: Write + ?Sized>(w: &mut W, p: PrimitiveType, body: &[u8]) -> fmt::Result {
    match p {
        PrimitiveType::Uint8 | PrimitiveType::Uint16 | PrimitiveType::Uint32 | PrimitiveType::Uint64 => {
            write!(w, "{}", scode::decode_uint(body))
        }
        PrimitiveType::Int8 | PrimitiveType::Int16 | PrimitiveType::Int32 | PrimitiveType::Int64 => {
            write!(w, "{}", scode::decode_int(body))
        }
        PrimitiveType::Duration => w.write_str(&format_duration(scode::decode_int(body))),
        PrimitiveType::Time => w.write_str(&format_time(scode::decode_int(body))),
        PrimitiveType::Float16 | PrimitiveType::Float32 | PrimitiveType::Float64 => {
            write_float(w, scode::decode_float(body).unwrap_or(f64::NAN))
        }
        PrimitiveType::Bool => w.write_str(if scode::decode_bool(body) { "true" } else { "false" }),
        PrimitiveType::Bytes => {
            w.write_str("0x")?;
            for b in body {
                write!(w, "{b:02x}")?;
            }
            Ok(())
        }
        PrimitiveType::String => write_quoted(w, &String::from_utf8_lossy(body)),
        PrimitiveType::Ip => match scode::decode_ip(body) {
            Some(ip) => write!(w, "{ip}"),
            None => w.write_str("<bad ip>"),
        },
        PrimitiveType::Net => match scode::decode_net(body) {
            Some((ip, prefix)) => write!(w, "{ip}/{prefix}"),
            None => w.write_str("<bad net>"),
        },
        PrimitiveType::Type => {
            let scratch = TypeContext::new();
            w.write_char('<')?;
            match scratch.lookup_by_value(body) {
                Ok(t) => write_type(w, &t)?,
                Err(_) => w.write_str("<bad type>")?,
            }
            w.write_char('>')
        }
        PrimitiveType::Null => w.write_str("null"),
    }
}

/// Parses one SUP value.
pub fn parse_value(ctx: &TypeContext, src: &str) -> Result<Value> {
    let mut p = Parser::new(ctx, src);
    let val = p.value()?;
    p.ws();
    if !p.eof() {
        return Err(p.error("unexpected trailing text"));
    }
    Ok(val)
}

/// Parses a stream of whitespace- or comma-free separated SUP values.
pub fn parse_values(ctx: &TypeContext, src: &str) -> Result<Vec<Value>> {
    let mut p = Parser::new(ctx, src);
    let mut vals = Vec::new();
    loop {
        p.ws();
        if p.eof() {
            return Ok(vals);
        }
        vals.push(p.value()?);
    }
}

pub fn parse_type(ctx: &TypeContext, src: &str) -> Result<Type> {
    let mut p = Parser::new(ctx, src);
    let typ = p.typ()?;
    p.ws();
    if !p.eof() {
        return Err(p.error("unexpected trailing text"));
    }
    Ok(typ)
}

/// Incremental SUP parser over a text buffer.
pub struct Parser<'a> {
    ctx: &'a TypeContext,
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    pub fn new(ctx: &'a TypeContext, src: &'a str) -> Self {
        Parser { ctx, src, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    pub fn eof(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn error(&self, msg: &str) -> DbError {
        let near: String = self.rest().chars().take(20).collect();
        DbError::format(format!("SUP syntax error: {msg}")).with_field("near", near)
    }

    /// Skips whitespace and `//` comments.
    pub fn ws(&mut self) {
        loop {
            let rest = self.rest();
            let trimmed = rest.trim_start();
            self.pos += rest.len() - trimmed.len();
            if trimmed.starts_with("//") {
                let end = trimmed.find('\n').unwrap_or(trimmed.len());
                self.pos += end;
                continue;
            }
            return;
        }
    }

    fn accept(&mut self, tok: &str) -> bool {
        self.ws();
        if self.rest().starts_with(tok) {
            self.pos += tok.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &str) -> Result<()> {
        if self.accept(tok) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {tok:?}")))
        }
    }

    fn identifier(&mut self) -> Option<&'a str> {
        self.ws();
        let rest = self.rest();
        let mut end = 0;
        for (i, c) in rest.char_indices() {
            let ok = if i == 0 {
                c.is_ascii_alphabetic() || c == '_' || c == '$'
            } else {
                c.is_ascii_alphanumeric() || c == '_' || c == '$'
            };
            if !ok {
                break;
            }
            end = i + c.len_utf8();
        }
        if end == 0 {
            return None;
        }
        self.pos += end;
        Some(&rest[..end])
    }

    fn quoted(&mut self) -> Result<String> {
        self.ws();
        let rest = self.rest();
        let bytes = rest.as_bytes();
        if bytes.first() != Some(&b'"') {
            return Err(self.error("expected string"));
        }
        let mut i = 1;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => i += 2,
                b'"' => {
                    let lit = &rest[..=i];
                    let s: String = serde_json::from_str(lit)
                        .map_err(|e| DbError::with_source("bad string literal", Box::new(e)))?;
                    self.pos += i + 1;
                    return Ok(s);
                }
                _ => i += 1,
            }
        }
        Err(self.error("unterminated string"))
    }

    fn name(&mut self) -> Result<String> {
        self.ws();
        if self.peek() == Some('"') {
            return self.quoted();
        }
        self.identifier()
            .map(str::to_string)
            .ok_or_else(|| self.error("expected name"))
    }

    pub fn value(&mut self) -> Result<Value> {
        let mut val = self.base_value()?;
        loop {
            if self.accept("::=") {
                let name = self.name()?;
                let named = self.ctx.lookup_named(&name, val.typ())?;
                val = Value::new(named, val.body().cloned());
            } else if self.accept("::") {
                let typ = self.typ()?;
                val = cast_value(self.ctx, &val, &typ)?;
            } else {
                return Ok(val);
            }
        }
    }

    fn base_value(&mut self) -> Result<Value> {
        self.ws();
        let rest = self.rest();
        if rest.starts_with("|[") {
            self.pos += 2;
            let elems = self.value_list("]|")?;
            return new_set(self.ctx, &elems);
        }
        if rest.starts_with("|{") {
            self.pos += 2;
            return self.map_value();
        }
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some('{') => {
                self.pos += 1;
                self.record_value()
            }
            Some('[') => {
                self.pos += 1;
                let elems = self.value_list("]")?;
                new_array(self.ctx, &elems)
            }
            Some('"') => {
                let s = self.quoted()?;
                Ok(Value::from_str(&s))
            }
            Some('<') => {
                self.pos += 1;
                let typ = self.typ()?;
                self.expect(">")?;
                Ok(Value::from_type(self.ctx, &typ))
            }
            Some('(') => {
                self.pos += 1;
                let val = self.value()?;
                self.expect(")")?;
                Ok(val)
            }
            Some(_) => self.scalar(),
        }
    }

    fn value_list(&mut self, close: &str) -> Result<Vec<Value>> {
        let mut elems = Vec::new();
        if self.accept(close) {
            return Ok(elems);
        }
        loop {
            elems.push(self.value()?);
            if self.accept(close) {
                return Ok(elems);
            }
            self.expect(",")?;
        }
    }

    fn record_value(&mut self) -> Result<Value> {
        let mut fields = Vec::new();
        if !self.accept("}") {
            loop {
                let name = self.name()?;
                self.expect(":")?;
                fields.push((name, self.value()?));
                if self.accept("}") {
                    break;
                }
                self.expect(",")?;
            }
        }
        new_record(self.ctx, fields)
    }

    fn map_value(&mut self) -> Result<Value> {
        let mut keys = Vec::new();
        let mut vals = Vec::new();
        if !self.accept("}|") {
            loop {
                keys.push(self.value()?);
                self.expect(":")?;
                vals.push(self.value()?);
                if self.accept("}|") {
                    break;
                }
                self.expect(",")?;
            }
        }
        let ktype = unify_types(self.ctx, keys.iter().map(Value::typ))?;
        let vtype = unify_types(self.ctx, vals.iter().map(Value::typ))?;
        let mut b = ValueBuilder::new();
        b.begin_container();
        for (k, v) in keys.iter().zip(&vals) {
            super::append_as(&mut b, &ktype, k);
            super::append_as(&mut b, &vtype, v);
        }
        b.end_map();
        let typ = self.ctx.lookup_map(&ktype, &vtype);
        Ok(Value::new(typ, b.into_first_body()))
    }

    fn scalar(&mut self) -> Result<Value> {
        let rest = self.rest();
        if rest.starts_with("error(") {
            self.pos += "error(".len();
            let inner = self.value()?;
            self.expect(")")?;
            let typ = self.ctx.lookup_error(inner.typ());
            return Ok(Value::new(typ, inner.body().cloned()));
        }
        let end = rest
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '/' | '+' | '-' | '_')))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let token = &rest[..end];
        if token.is_empty() {
            return Err(self.error("unexpected character"));
        }
        // "1::" reads as an IPv6 address, but followed by a complex type
        // it is a decorated literal.
        let decorated = token.len() > 2
            && token.ends_with("::")
            && matches!(rest[end..].chars().next(), Some('(' | '{' | '[' | '|' | '"'));
        if decorated {
            if let Some(val) = parse_scalar_token(&token[..token.len() - 2]) {
                self.pos += end - 2;
                return Ok(val);
            }
        }
        if let Some(val) = parse_scalar_token(token) {
            self.pos += end;
            return Ok(val);
        }
        // The token may have run into a decorator.
        for (i, _) in token.match_indices("::").collect::<Vec<_>>().into_iter().rev() {
            if let Some(val) = parse_scalar_token(&token[..i]) {
                self.pos += i;
                return Ok(val);
            }
        }
        Err(self.error("unrecognized literal"))
    }

    pub fn typ(&mut self) -> Result<Type> {
        self.ws();
        let rest = self.rest();
        if rest.starts_with("|[") {
            self.pos += 2;
            let inner = self.typ()?;
            self.expect("]|")?;
            return Ok(self.ctx.lookup_set(&inner));
        }
        if rest.starts_with("|{") {
            self.pos += 2;
            let k = self.typ()?;
            self.expect(":")?;
            let v = self.typ()?;
            self.expect("}|")?;
            return Ok(self.ctx.lookup_map(&k, &v));
        }
        match self.peek() {
            Some('{') => {
                self.pos += 1;
                let mut fields = Vec::new();
                if !self.accept("}") {
                    loop {
                        let name = self.name()?;
                        self.expect(":")?;
                        fields.push(Field::new(name, self.typ()?));
                        if self.accept("}") {
                            break;
                        }
                        self.expect(",")?;
                    }
                }
                self.ctx.lookup_record(fields)
            }
            Some('[') => {
                self.pos += 1;
                let inner = self.typ()?;
                self.expect("]")?;
                Ok(self.ctx.lookup_array(&inner))
            }
            Some('(') => {
                self.pos += 1;
                let mut types = vec![self.typ()?];
                while self.accept("|") {
                    types.push(self.typ()?);
                }
                self.expect(")")?;
                if types.len() == 1 {
                    return Ok(types.remove(0));
                }
                self.ctx.lookup_union(types)
            }
            Some('"') => {
                let name = self.quoted()?;
                self.named_type(name)
            }
            _ => {
                let name = self
                    .identifier()
                    .ok_or_else(|| self.error("expected type"))?;
                if let Some(p) = PrimitiveType::from_name(name) {
                    return Ok(Type::Primitive(p));
                }
                if name == "enum" && self.accept("(") {
                    let mut symbols = Vec::new();
                    if !self.accept(")") {
                        loop {
                            symbols.push(self.name()?);
                            if self.accept(")") {
                                break;
                            }
                            self.expect(",")?;
                        }
                    }
                    return self.ctx.lookup_enum(symbols);
                }
                if name == "error" && self.accept("(") {
                    let inner = self.typ()?;
                    self.expect(")")?;
                    return Ok(self.ctx.lookup_error(&inner));
                }
                self.named_type(name.to_string())
            }
        }
    }

    fn named_type(&mut self, name: String) -> Result<Type> {
        if self.accept("=") {
            let inner = self.typ()?;
            return self.ctx.lookup_named(&name, &inner);
        }
        self.ctx
            .lookup_def(&name)
            .ok_or_else(|| DbError::format(format!("no such type name: {name:?}")))
    }
}

/// Parses a bare literal token: numbers, durations, times, addresses,
/// networks, hex bytes and keywords.
pub fn parse_scalar_token(token: &str) -> Option<Value> {
    match token {
        "null" => return Some(Value::null()),
        "true" => return Some(Value::from_bool(true)),
        "false" => return Some(Value::from_bool(false)),
        "NaN" => return Some(Value::from_float64(f64::NAN)),
        "Inf" | "+Inf" => return Some(Value::from_float64(f64::INFINITY)),
        "-Inf" => return Some(Value::from_float64(f64::NEG_INFINITY)),
        _ => {}
    }
    if let Some(hex) = token.strip_prefix("0x") {
        if hex.len() % 2 == 0 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            let bytes: Option<Vec<u8>> = (0..hex.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
                .collect();
            return bytes.map(|b| Value::from_bytes(&b));
        }
    }
    if let Ok(v) = token.parse::<i64>() {
        return Some(Value::from_int64(v));
    }
    if let Ok(v) = token.parse::<u64>() {
        return Some(Value::from_uint64(v));
    }
    let numeric = token
        .trim_start_matches(['-', '+'])
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '-' | '+'));
    if numeric && token.matches('.').count() <= 1 {
        if let Ok(v) = token.parse::<f64>() {
            return Some(Value::from_float64(v));
        }
    }
    if let Ok(ip) = token.parse::<IpAddr>() {
        return Some(Value::from_ip(ip));
    }
    if let Some((addr, bits)) = token.split_once('/') {
        if let (Ok(ip), Ok(bits)) = (addr.parse::<IpAddr>(), bits.parse::<u8>()) {
            return Some(Value::from_net(ip, bits));
        }
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(token) {
        return t.timestamp_nanos_opt().map(Value::from_time);
    }
    parse_duration(token).map(Value::from_duration)
}

/// Parses durations such as `1h2m3.5s`, `-10ms` or `2d`.
pub fn parse_duration(s: &str) -> Option<i64> {
    let (neg, mut rest) = match s.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if rest.is_empty() {
        return None;
    }
    let mut total: f64 = 0.0;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let num: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];
        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale: f64 = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "d" => 86400e9,
            "w" => 7.0 * 86400e9,
            "y" => 365.0 * 86400e9,
            _ => return None,
        };
        total += num * scale;
        rest = &rest[unit_end..];
    }
    let nanos = total.round() as i64;
    Some(if neg { -nanos } else { nanos })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(src: &str) {
        let ctx = TypeContext::new();
        let val = parse_value(&ctx, src).unwrap();
        assert_eq!(src, format_value(&val), "format of {src}");
        let again = parse_value(&ctx, &format_value(&val)).unwrap();
        assert_eq!(val, again);
    }

    #[test]
    fn literals() {
        for src in [
            "1",
            "-7",
            "1.5",
            "2.",
            "true",
            "null",
            "\"hi\\n\"",
            "0x0102",
            "10.0.0.1",
            "10.0.0.0/8",
            "::1",
            "1h2m3s",
            "1.5ms",
            "2023-01-02T03:04:05Z",
            "<int64>",
            "<{a:[string]}>",
        ] {
            round_trip(src);
        }
    }

    #[test]
    fn decorated() {
        for src in [
            "1::uint8",
            "null::int64",
            "1.5::float32",
            "{a:1::int32,b:[1,2]}",
            "[]::[int64]",
            "|[1,2]|",
            "|{\"a\":1}|",
            "1::(int64|string)",
            "[1,\"a\"]::[(int64|string)]",
            "error(\"missing\")",
            "{x:1}::=point",
            "\"b\"::enum(a,b)",
        ] {
            round_trip(src);
        }
    }

    #[test]
    fn union_decorator_after_address_like_token() {
        let ctx = TypeContext::new();
        let val = parse_value(&ctx, "1::(int64|string)").unwrap();
        assert!(matches!(val.typ().kind(), Some(ComplexKind::Union(_))));
        assert_eq!("1::(int64|string)", format_value(&val));
        let ip = parse_value(&ctx, "[1::]").unwrap();
        assert_eq!("[1::]", format_value(&ip));
    }

    #[test]
    fn values_stream() {
        let ctx = TypeContext::new();
        let vals = parse_values(&ctx, "{x:1} {x:2}\n{x:3}").unwrap();
        assert_eq!(3, vals.len());
        assert_eq!(vals[0].typ(), vals[2].typ());
        assert_eq!(Some(3), vals[2].deref("x").unwrap().as_int());
    }

    #[test]
    fn durations() {
        assert_eq!(Some(3_723_000_000_000), parse_duration("1h2m3s"));
        assert_eq!(Some(-1_500_000), parse_duration("-1.5ms"));
        assert_eq!(None, parse_duration("1x"));
        assert_eq!("1h2m3s", format_duration(3_723_000_000_000));
        assert_eq!("500ns", format_duration(500));
        assert_eq!("0s", format_duration(0));
    }

    #[test]
    fn syntax_error() {
        let ctx = TypeContext::new();
        assert!(parse_value(&ctx, "{a:1").is_err());
        assert!(parse_value(&ctx, "1 2").is_err());
    }
}
