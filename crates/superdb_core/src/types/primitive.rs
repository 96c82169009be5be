use std::fmt;

/// First id handed out to complex types. Ids below this are reserved for
/// primitives.
pub const ID_TYPE_COMPLEX: u32 = 30;

/// Primitive types with their fixed, well-known ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PrimitiveType {
    Uint8 = 0,
    Uint16 = 1,
    Uint32 = 2,
    Uint64 = 3,
    Int8 = 6,
    Int16 = 7,
    Int32 = 8,
    Int64 = 9,
    Duration = 12,
    Time = 13,
    Float16 = 14,
    Float32 = 15,
    Float64 = 16,
    Bool = 23,
    Bytes = 24,
    String = 25,
    Ip = 26,
    Net = 27,
    Type = 28,
    Null = 29,
}

pub const ALL_PRIMITIVES: [PrimitiveType; 20] = [
    PrimitiveType::Uint8,
    PrimitiveType::Uint16,
    PrimitiveType::Uint32,
    PrimitiveType::Uint64,
    PrimitiveType::Int8,
    PrimitiveType::Int16,
    PrimitiveType::Int32,
    PrimitiveType::Int64,
    PrimitiveType::Duration,
    PrimitiveType::Time,
    PrimitiveType::Float16,
    PrimitiveType::Float32,
    PrimitiveType::Float64,
    PrimitiveType::Bool,
    PrimitiveType::Bytes,
    PrimitiveType::String,
    PrimitiveType::Ip,
    PrimitiveType::Net,
    PrimitiveType::Type,
    PrimitiveType::Null,
];

impl PrimitiveType {
    pub const fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        ALL_PRIMITIVES.iter().copied().find(|p| p.id() == id)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ALL_PRIMITIVES.iter().copied().find(|p| p.name() == name)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Uint8 => "uint8",
            Self::Uint16 => "uint16",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Duration => "duration",
            Self::Time => "time",
            Self::Float16 => "float16",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Bool => "bool",
            Self::Bytes => "bytes",
            Self::String => "string",
            Self::Ip => "ip",
            Self::Net => "net",
            Self::Type => "type",
            Self::Null => "null",
        }
    }

    /// Signed integer encodings (zigzag). Time and duration are signed
    /// nanoseconds.
    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 | Self::Duration | Self::Time
        )
    }

    pub const fn is_unsigned(self) -> bool {
        matches!(
            self,
            Self::Uint8 | Self::Uint16 | Self::Uint32 | Self::Uint64
        )
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float16 | Self::Float32 | Self::Float64)
    }

    pub const fn is_integer(self) -> bool {
        self.is_unsigned()
            || matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    pub const fn is_number(self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub const fn is_stringy(self) -> bool {
        matches!(self, Self::String | Self::Bytes)
    }

    /// Width in bits of integer and float types.
    pub const fn bit_width(self) -> Option<u32> {
        match self {
            Self::Uint8 | Self::Int8 => Some(8),
            Self::Uint16 | Self::Int16 | Self::Float16 => Some(16),
            Self::Uint32 | Self::Int32 | Self::Float32 => Some(32),
            Self::Uint64 | Self::Int64 | Self::Float64 | Self::Duration | Self::Time => Some(64),
            _ => None,
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_fixed() {
        assert_eq!(0, PrimitiveType::Uint8.id());
        assert_eq!(9, PrimitiveType::Int64.id());
        assert_eq!(25, PrimitiveType::String.id());
        assert_eq!(29, PrimitiveType::Null.id());
        assert_eq!(None, PrimitiveType::from_id(4));
        assert_eq!(Some(PrimitiveType::Time), PrimitiveType::from_id(13));
    }

    #[test]
    fn names_round_trip() {
        for p in ALL_PRIMITIVES {
            assert_eq!(Some(p), PrimitiveType::from_name(p.name()));
        }
        assert_eq!(None, PrimitiveType::from_name("decimal"));
    }
}
