//! The super-structured type system.
//!
//! Primitive types are plain enum values. Complex types are interned by a
//! [`TypeContext`] so that two complex types are equal exactly when they are
//! the same allocation.
pub mod cache;
pub mod compare;
pub mod context;
pub mod primitive;
pub mod type_value;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub use cache::{TypeCache, TypeFetcher};
pub use compare::compare_types;
pub use context::TypeContext;
pub use primitive::{ID_TYPE_COMPLEX, PrimitiveType};

/// Maximum number of record fields, union members or enum symbols.
pub const MAX_COLUMNS: usize = 100_000;

#[derive(Clone)]
pub enum Type {
    Primitive(PrimitiveType),
    Complex(Arc<ComplexType>),
}

#[derive(Debug)]
pub struct ComplexType {
    pub(crate) id: u32,
    pub(crate) kind: ComplexKind,
}

#[derive(Debug)]
pub enum ComplexKind {
    Record(Vec<Field>),
    Array(Type),
    Set(Type),
    Map(Type, Type),
    Union(Vec<Type>),
    Enum(Vec<String>),
    Named(String, Type),
    Error(Type),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub typ: Type,
}

impl Field {
    pub fn new(name: impl Into<String>, typ: Type) -> Self {
        Field {
            name: name.into(),
            typ,
        }
    }
}

impl Type {
    pub const UINT8: Type = Type::Primitive(PrimitiveType::Uint8);
    pub const UINT16: Type = Type::Primitive(PrimitiveType::Uint16);
    pub const UINT32: Type = Type::Primitive(PrimitiveType::Uint32);
    pub const UINT64: Type = Type::Primitive(PrimitiveType::Uint64);
    pub const INT8: Type = Type::Primitive(PrimitiveType::Int8);
    pub const INT16: Type = Type::Primitive(PrimitiveType::Int16);
    pub const INT32: Type = Type::Primitive(PrimitiveType::Int32);
    pub const INT64: Type = Type::Primitive(PrimitiveType::Int64);
    pub const DURATION: Type = Type::Primitive(PrimitiveType::Duration);
    pub const TIME: Type = Type::Primitive(PrimitiveType::Time);
    pub const FLOAT16: Type = Type::Primitive(PrimitiveType::Float16);
    pub const FLOAT32: Type = Type::Primitive(PrimitiveType::Float32);
    pub const FLOAT64: Type = Type::Primitive(PrimitiveType::Float64);
    pub const BOOL: Type = Type::Primitive(PrimitiveType::Bool);
    pub const BYTES: Type = Type::Primitive(PrimitiveType::Bytes);
    pub const STRING: Type = Type::Primitive(PrimitiveType::String);
    pub const IP: Type = Type::Primitive(PrimitiveType::Ip);
    pub const NET: Type = Type::Primitive(PrimitiveType::Net);
    pub const TYPE: Type = Type::Primitive(PrimitiveType::Type);
    pub const NULL: Type = Type::Primitive(PrimitiveType::Null);

    pub fn id(&self) -> u32 {
        match self {
            Type::Primitive(p) => p.id(),
            Type::Complex(c) => c.id,
        }
    }

    pub fn primitive(&self) -> Option<PrimitiveType> {
        match self {
            Type::Primitive(p) => Some(*p),
            Type::Complex(_) => None,
        }
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self, Type::Primitive(_))
    }

    pub fn kind(&self) -> Option<&ComplexKind> {
        match self {
            Type::Primitive(_) => None,
            Type::Complex(c) => Some(&c.kind),
        }
    }

    /// Strip any named type wrappers.
    pub fn under(&self) -> &Type {
        let mut typ = self;
        while let Some(ComplexKind::Named(_, inner)) = typ.kind() {
            typ = inner;
        }
        typ
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Type::Primitive(PrimitiveType::Null))
    }

    pub fn record_fields(&self) -> Option<&[Field]> {
        match self.kind() {
            Some(ComplexKind::Record(fields)) => Some(fields),
            _ => None,
        }
    }

    /// Element type of an array or set.
    pub fn inner(&self) -> Option<&Type> {
        match self.kind() {
            Some(ComplexKind::Array(inner)) | Some(ComplexKind::Set(inner)) => Some(inner),
            _ => None,
        }
    }

    pub fn is_record(&self) -> bool {
        matches!(self.kind(), Some(ComplexKind::Record(_)))
    }

    pub fn is_container(&self) -> bool {
        matches!(
            self.kind(),
            Some(
                ComplexKind::Record(_)
                    | ComplexKind::Array(_)
                    | ComplexKind::Set(_)
                    | ComplexKind::Map(_, _)
            )
        )
    }

    pub fn is_union(&self) -> bool {
        matches!(self.kind(), Some(ComplexKind::Union(_)))
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind(), Some(ComplexKind::Error(_)))
    }

    pub fn union_members(&self) -> Option<&[Type]> {
        match self.kind() {
            Some(ComplexKind::Union(types)) => Some(types),
            _ => None,
        }
    }

    pub fn named(&self) -> Option<(&str, &Type)> {
        match self.kind() {
            Some(ComplexKind::Named(name, inner)) => Some((name, inner)),
            _ => None,
        }
    }

    /// Index of a field within a record type.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.record_fields()?.iter().position(|f| f.name == name)
    }

    /// Index of `typ` within a union type.
    pub fn union_tag(&self, typ: &Type) -> Option<usize> {
        self.union_members()?.iter().position(|t| t == typ)
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Type::Primitive(a), Type::Primitive(b)) => a == b,
            (Type::Complex(a), Type::Complex(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Type {}

impl Hash for Type {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Type::Primitive(p) => p.hash(state),
            Type::Complex(c) => (Arc::as_ptr(c) as usize).hash(state),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::value::sup::write_type(f, self)
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{self}>")
    }
}

impl From<PrimitiveType> for Type {
    fn from(value: PrimitiveType) -> Self {
        Type::Primitive(value)
    }
}
