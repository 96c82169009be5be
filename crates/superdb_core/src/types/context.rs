use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;

use ahash::RandomState;
use bytes::Bytes;
use parking_lot::RwLock;
use superdb_error::{DbError, ErrorKind, Result};

use super::cache::TypeFetcher;
use super::compare::compare_types;
use super::type_value::{self, encode_type_value};
use super::{ComplexKind, ComplexType, Field, ID_TYPE_COMPLEX, MAX_COLUMNS, PrimitiveType, Type};
use crate::value::{Value, ValueBuilder};

thread_local! {
    static KEY_BUF: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

const KEY_RECORD: u8 = 0;
const KEY_ARRAY: u8 = 1;
const KEY_SET: u8 = 2;
const KEY_MAP: u8 = 3;
const KEY_UNION: u8 = 4;
const KEY_ENUM: u8 = 5;
const KEY_NAMED: u8 = 6;
const KEY_ERROR: u8 = 7;

/// Interning store for complex types.
///
/// Every lookup returns the one canonical instance for its shape, so type
/// equality within a context is pointer equality.
#[derive(Debug, Default)]
pub struct TypeContext {
    tables: RwLock<Tables>,
}

type HashMap<K, V> = hashbrown::HashMap<K, V, RandomState>;

#[derive(Debug, Default)]
struct Tables {
    by_key: HashMap<Vec<u8>, Type>,
    by_id: Vec<Type>,
    typedefs: HashMap<String, Type>,
    to_value: HashMap<Type, Bytes>,
    to_type: HashMap<Vec<u8>, Type>,
    string_err: Option<Type>,
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_str(buf: &mut Vec<u8>, s: &[u8]) {
    push_u32(buf, s.len() as u32);
    buf.extend_from_slice(s);
}

impl TypeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a lookup key in a thread-local scratch buffer, then interns the
    /// type if it's not already present.
    fn intern(&self, fill: impl FnOnce(&mut Vec<u8>), make: impl FnOnce() -> ComplexKind) -> Type {
        KEY_BUF.with(|buf| {
            let mut key = buf.borrow_mut();
            key.clear();
            fill(&mut key);
            if let Some(typ) = self.tables.read().by_key.get(key.as_slice()) {
                return typ.clone();
            }
            let mut tables = self.tables.write();
            if let Some(typ) = tables.by_key.get(key.as_slice()) {
                return typ.clone();
            }
            let id = ID_TYPE_COMPLEX + tables.by_id.len() as u32;
            let typ = Type::Complex(Arc::new(ComplexType { id, kind: make() }));
            tables.by_id.push(typ.clone());
            tables.by_key.insert(key.clone(), typ.clone());
            typ
        })
    }

    pub fn lookup_record(&self, fields: Vec<Field>) -> Result<Type> {
        if fields.len() > MAX_COLUMNS {
            return Err(DbError::new("too many record fields"));
        }
        let mut seen = HashSet::with_capacity(fields.len());
        for field in &fields {
            if !seen.insert(field.name.as_str()) {
                return Err(DbError::new_kind(
                    ErrorKind::DuplicateField,
                    format!("duplicate field: {:?}", field.name),
                )
                .with_field("name", &field.name));
            }
        }
        Ok(self.intern(
            |key| {
                key.push(KEY_RECORD);
                for field in &fields {
                    push_str(key, field.name.as_bytes());
                    push_u32(key, field.typ.id());
                }
            },
            || ComplexKind::Record(fields.clone()),
        ))
    }

    pub fn lookup_array(&self, inner: &Type) -> Type {
        self.intern(
            |key| {
                key.push(KEY_ARRAY);
                push_u32(key, inner.id());
            },
            || ComplexKind::Array(inner.clone()),
        )
    }

    pub fn lookup_set(&self, inner: &Type) -> Type {
        self.intern(
            |key| {
                key.push(KEY_SET);
                push_u32(key, inner.id());
            },
            || ComplexKind::Set(inner.clone()),
        )
    }

    pub fn lookup_map(&self, key_type: &Type, val_type: &Type) -> Type {
        self.intern(
            |key| {
                key.push(KEY_MAP);
                push_u32(key, key_type.id());
                push_u32(key, val_type.id());
            },
            || ComplexKind::Map(key_type.clone(), val_type.clone()),
        )
    }

    /// Members are put in canonical order and deduplicated so member order
    /// never affects identity.
    pub fn lookup_union(&self, mut types: Vec<Type>) -> Result<Type> {
        types.sort_by(compare_types);
        types.dedup();
        if types.len() > MAX_COLUMNS {
            return Err(DbError::new("too many union types"));
        }
        if types.is_empty() {
            return Err(DbError::new("union type must have at least one member"));
        }
        Ok(self.intern(
            |key| {
                key.push(KEY_UNION);
                for t in &types {
                    push_u32(key, t.id());
                }
            },
            || ComplexKind::Union(types.clone()),
        ))
    }

    pub fn lookup_enum(&self, symbols: Vec<String>) -> Result<Type> {
        if symbols.len() > MAX_COLUMNS {
            return Err(DbError::new("too many enum symbols"));
        }
        Ok(self.intern(
            |key| {
                key.push(KEY_ENUM);
                for s in &symbols {
                    push_str(key, s.as_bytes());
                }
            },
            || ComplexKind::Enum(symbols.clone()),
        ))
    }

    pub fn lookup_error(&self, inner: &Type) -> Type {
        self.intern(
            |key| {
                key.push(KEY_ERROR);
                push_u32(key, inner.id());
            },
            || ComplexKind::Error(inner.clone()),
        )
    }

    /// Interns a named type and binds the name for [`TypeContext::lookup_def`].
    /// The binding is updated even when the named type already existed.
    pub fn lookup_named(&self, name: &str, inner: &Type) -> Result<Type> {
        if PrimitiveType::from_name(name).is_some() {
            return Err(DbError::new_kind(
                ErrorKind::PrimitiveNameCollision,
                format!("named type collides with primitive type: {name}"),
            ));
        }
        let typ = self.intern(
            |key| {
                key.push(KEY_NAMED);
                push_str(key, name.as_bytes());
                push_u32(key, inner.id());
            },
            || ComplexKind::Named(name.to_string(), inner.clone()),
        );
        self.tables
            .write()
            .typedefs
            .insert(name.to_string(), typ.clone());
        Ok(typ)
    }

    pub fn lookup_named_bytes(&self, name: &[u8], inner: &Type) -> Result<Type> {
        let name = std::str::from_utf8(name).map_err(|_| {
            DbError::new_kind(
                ErrorKind::InvalidUtf8,
                format!("bad type name {:?}: invalid UTF-8", String::from_utf8_lossy(name)),
            )
        })?;
        self.lookup_named(name, inner)
    }

    pub fn lookup_def(&self, name: &str) -> Option<Type> {
        self.tables.read().typedefs.get(name).cloned()
    }

    pub fn lookup_type(&self, id: u32) -> Result<Type> {
        if id < ID_TYPE_COMPLEX {
            return PrimitiveType::from_id(id)
                .map(Type::Primitive)
                .ok_or_else(|| unknown_type_id(id));
        }
        self.tables
            .read()
            .by_id
            .get((id - ID_TYPE_COMPLEX) as usize)
            .cloned()
            .ok_or_else(|| unknown_type_id(id))
    }

    /// Canonical type-value encoding of a type, cached per type.
    pub fn encode_type_value(&self, typ: &Type) -> Bytes {
        if typ.is_primitive() {
            return Bytes::from(encode_type_value(typ));
        }
        if let Some(bytes) = self.tables.read().to_value.get(typ) {
            return bytes.clone();
        }
        let bytes = Bytes::from(encode_type_value(typ));
        self.tables
            .write()
            .to_value
            .insert(typ.clone(), bytes.clone());
        bytes
    }

    pub fn decode_type_value(&self, buf: &[u8]) -> Result<(Type, usize)> {
        type_value::decode_type_value(self, buf)
    }

    /// Interns the type described by a complete type value.
    pub fn lookup_by_value(&self, buf: &[u8]) -> Result<Type> {
        if let Some(typ) = self.tables.read().to_type.get(buf) {
            return Ok(typ.clone());
        }
        let (typ, n) = self.decode_type_value(buf)?;
        if n != buf.len() {
            return Err(DbError::format("bad type value encoding: trailing bytes"));
        }
        self.tables
            .write()
            .to_type
            .insert(buf.to_vec(), typ.clone());
        Ok(typ)
    }

    /// Maps a type from another context into this one.
    pub fn translate_type(&self, external: &Type) -> Result<Type> {
        if external.is_primitive() {
            return Ok(external.clone());
        }
        self.lookup_by_value(&encode_type_value(external))
    }

    pub fn translate_value(&self, val: &Value) -> Result<Value> {
        let typ = self.translate_type(val.typ())?;
        Ok(Value::new(typ, val.body().cloned()))
    }

    /// Drop every interned type.
    pub fn reset(&self) {
        *self.tables.write() = Tables::default();
    }

    pub fn string_err_type(&self) -> Type {
        if let Some(typ) = &self.tables.read().string_err {
            return typ.clone();
        }
        let typ = self.lookup_error(&Type::STRING);
        self.tables.write().string_err = Some(typ.clone());
        typ
    }

    pub fn new_error_string(&self, msg: impl AsRef<str>) -> Value {
        Value::new(
            self.string_err_type(),
            Some(Bytes::copy_from_slice(msg.as_ref().as_bytes())),
        )
    }

    pub fn missing(&self) -> Value {
        self.new_error_string("missing")
    }

    pub fn quiet(&self) -> Value {
        self.new_error_string("quiet")
    }

    /// Builds `error({message:msg,on:val})`.
    pub fn wrap_error(&self, msg: impl AsRef<str>, val: &Value) -> Value {
        let fields = vec![
            Field::new("message", Type::STRING),
            Field::new("on", val.typ().clone()),
        ];
        let rec = match self.lookup_record(fields) {
            Ok(rec) => rec,
            Err(_) => return self.new_error_string(msg),
        };
        let mut b = ValueBuilder::new();
        b.append(Some(msg.as_ref().as_bytes()));
        b.append(val.bytes());
        Value::new(self.lookup_error(&rec), Some(b.into_bytes()))
    }
}

fn unknown_type_id(id: u32) -> DbError {
    DbError::new_kind(ErrorKind::UnknownTypeId, format!("unknown type ID: {id}"))
}

impl TypeFetcher for TypeContext {
    fn lookup_type(&self, id: u32) -> Result<Type> {
        TypeContext::lookup_type(self, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_identity() {
        let ctx = TypeContext::new();
        let a = ctx
            .lookup_record(vec![Field::new("x", Type::INT64)])
            .unwrap();
        let b = ctx
            .lookup_record(vec![Field::new("x", Type::INT64)])
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
        assert_eq!(ID_TYPE_COMPLEX, a.id());
        assert_eq!(a, ctx.lookup_type(a.id()).unwrap());
    }

    #[test]
    fn duplicate_field() {
        let ctx = TypeContext::new();
        let err = ctx
            .lookup_record(vec![
                Field::new("x", Type::INT64),
                Field::new("x", Type::STRING),
            ])
            .unwrap_err();
        assert_eq!(ErrorKind::DuplicateField, err.kind());
        assert_eq!(Some("x"), err.get_field("name"));
    }

    #[test]
    fn union_member_order_irrelevant() {
        let ctx = TypeContext::new();
        let a = ctx.lookup_union(vec![Type::STRING, Type::INT64]).unwrap();
        let b = ctx
            .lookup_union(vec![Type::INT64, Type::STRING, Type::INT64])
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(2, a.union_members().unwrap().len());
    }

    #[test]
    fn named_rebinds() {
        let ctx = TypeContext::new();
        let a = ctx.lookup_named("foo", &Type::INT64).unwrap();
        let b = ctx.lookup_named("foo", &Type::STRING).unwrap();
        assert_eq!(Some(b.clone()), ctx.lookup_def("foo"));
        ctx.lookup_named("foo", &Type::INT64).unwrap();
        assert_eq!(Some(a), ctx.lookup_def("foo"));
        assert_ne!(b, ctx.lookup_def("foo").unwrap());
    }

    #[test]
    fn named_rejects_primitive_and_bad_utf8() {
        let ctx = TypeContext::new();
        let err = ctx.lookup_named("int64", &Type::INT64).unwrap_err();
        assert_eq!(ErrorKind::PrimitiveNameCollision, err.kind());
        let err = ctx.lookup_named_bytes(&[0xff, 0xfe], &Type::INT64).unwrap_err();
        assert_eq!(ErrorKind::InvalidUtf8, err.kind());
    }

    #[test]
    fn unknown_id() {
        let ctx = TypeContext::new();
        assert_eq!(ErrorKind::UnknownTypeId, ctx.lookup_type(30).unwrap_err().kind());
        assert_eq!(ErrorKind::UnknownTypeId, ctx.lookup_type(4).unwrap_err().kind());
    }

    #[test]
    fn translate_preserves_encoding() {
        let a = TypeContext::new();
        let b = TypeContext::new();
        // Skew the id space of b so ids differ across contexts.
        b.lookup_array(&Type::BOOL);
        let inner = a.lookup_set(&Type::IP);
        let t1 = a
            .lookup_record(vec![
                Field::new("s", inner),
                Field::new("u", a.lookup_union(vec![Type::INT64, Type::STRING]).unwrap()),
            ])
            .unwrap();
        let t2 = b.translate_type(&t1).unwrap();
        assert_ne!(t1.id(), t2.id());
        assert_eq!(a.encode_type_value(&t1), b.encode_type_value(&t2));
        assert_eq!(t2, b.translate_type(&t1).unwrap());
    }

    #[test]
    fn reset_clears() {
        let ctx = TypeContext::new();
        let t = ctx.lookup_array(&Type::INT64);
        ctx.reset();
        assert!(ctx.lookup_type(t.id()).is_err());
        assert_ne!(t, ctx.lookup_array(&Type::INT64));
    }

    #[test]
    fn concurrent_lookups_agree() {
        let ctx = Arc::new(TypeContext::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctx = ctx.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|i| {
                            ctx.lookup_record(vec![Field::new(format!("f{i}"), Type::INT64)])
                                .unwrap()
                                .id()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for r in &results[1..] {
            assert_eq!(&results[0], r);
        }
    }

    #[test]
    fn error_helpers() {
        let ctx = TypeContext::new();
        let missing = ctx.missing();
        assert!(missing.is_missing());
        assert!(ctx.quiet().is_quiet());
        let wrapped = ctx.wrap_error("bad", &Value::from_int64(1));
        assert_eq!(r#"error({message:"bad",on:1})"#, wrapped.to_string());
    }
}
