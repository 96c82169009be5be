//! The metadata graph of a CSUP object.
//!
//! Nodes are addressed by their index in the metadata section. Leaf nodes
//! record the SUP text of their minimum and maximum values so readers can
//! prune objects without touching the data section.
use serde::{Deserialize, Serialize};
use superdb_error::{DbError, Result, ResultExt};

use crate::io::json::{from_json, to_json};
use crate::types::TypeContext;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Segment {
    pub offset: u64,
    pub length: u64,
    pub mem_length: u64,
    pub compression_format: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    pub values: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Metadata {
    Record {
        length: u32,
        fields: Vec<FieldMeta>,
    },
    Array {
        length: u32,
        lengths: Segment,
        values: u32,
    },
    Set {
        length: u32,
        lengths: Segment,
        values: u32,
    },
    Map {
        length: u32,
        lengths: Segment,
        keys: u32,
        values: u32,
    },
    Union {
        length: u32,
        tags: Segment,
        values: Vec<u32>,
    },
    Named {
        name: String,
        values: u32,
    },
    Error {
        values: u32,
    },
    Enum {
        symbols: Vec<String>,
        values: u32,
    },
    /// Signed integers, times and durations as little-endian i64.
    Int {
        #[serde(rename = "type")]
        typ: String,
        location: Segment,
        min: Option<String>,
        max: Option<String>,
        count: u32,
    },
    /// Unsigned integers as little-endian u64.
    Uint {
        #[serde(rename = "type")]
        typ: String,
        location: Segment,
        min: Option<String>,
        max: Option<String>,
        count: u32,
    },
    /// Floats as little-endian f64 regardless of width.
    Float {
        #[serde(rename = "type")]
        typ: String,
        location: Segment,
        min: Option<String>,
        max: Option<String>,
        count: u32,
    },
    /// Strings and bytes as end offsets plus concatenated data.
    Bytes {
        #[serde(rename = "type")]
        typ: String,
        offsets: Segment,
        location: Segment,
        min: Option<String>,
        max: Option<String>,
        count: u32,
    },
    /// Any other primitive as tagged SCODE bodies.
    Primitive {
        #[serde(rename = "type")]
        typ: String,
        location: Segment,
        min: Option<String>,
        max: Option<String>,
        count: u32,
    },
    Dict {
        values: u32,
        counts: Vec<u32>,
        index: Segment,
        length: u32,
    },
    Const {
        value: String,
        count: u32,
    },
    /// Alternating run lengths of present and null slots, starting with a
    /// present run.
    Nulls {
        runs: Segment,
        values: u32,
        count: u32,
    },
    Dynamic {
        tags: Segment,
        values: Vec<u32>,
        length: u32,
    },
}

impl Metadata {
    /// Number of slots the node describes.
    pub fn len(&self, nodes: &[Metadata]) -> u32 {
        match self {
            Metadata::Record { length, .. }
            | Metadata::Array { length, .. }
            | Metadata::Set { length, .. }
            | Metadata::Map { length, .. }
            | Metadata::Union { length, .. }
            | Metadata::Dict { length, .. }
            | Metadata::Dynamic { length, .. } => *length,
            Metadata::Int { count, .. }
            | Metadata::Uint { count, .. }
            | Metadata::Float { count, .. }
            | Metadata::Bytes { count, .. }
            | Metadata::Primitive { count, .. }
            | Metadata::Const { count, .. }
            | Metadata::Nulls { count, .. } => *count,
            Metadata::Named { values, .. } | Metadata::Error { values } | Metadata::Enum { values, .. } => nodes
                .get(*values as usize)
                .map(|n| n.len(nodes))
                .unwrap_or(0),
        }
    }

    pub(crate) fn for_each_segment_mut(&mut self, f: &mut impl FnMut(&mut Segment)) {
        match self {
            Metadata::Array { lengths, .. } | Metadata::Set { lengths, .. } | Metadata::Map { lengths, .. } => {
                f(lengths)
            }
            Metadata::Union { tags, .. } | Metadata::Dynamic { tags, .. } => f(tags),
            Metadata::Int { location, .. }
            | Metadata::Uint { location, .. }
            | Metadata::Float { location, .. }
            | Metadata::Primitive { location, .. } => f(location),
            Metadata::Bytes { offsets, location, .. } => {
                f(offsets);
                f(location);
            }
            Metadata::Dict { index, .. } => f(index),
            Metadata::Nulls { runs, .. } => f(runs),
            Metadata::Record { .. }
            | Metadata::Named { .. }
            | Metadata::Error { .. }
            | Metadata::Enum { .. }
            | Metadata::Const { .. } => {}
        }
    }

    /// Min and max SUP text of a leaf.
    pub fn min_max(&self) -> Option<(&Option<String>, &Option<String>)> {
        match self {
            Metadata::Int { min, max, .. }
            | Metadata::Uint { min, max, .. }
            | Metadata::Float { min, max, .. }
            | Metadata::Bytes { min, max, .. }
            | Metadata::Primitive { min, max, .. } => Some((min, max)),
            _ => None,
        }
    }

    pub fn to_value(&self, ctx: &TypeContext) -> Result<Value> {
        let json = serde_json::to_value(self).context("failed to marshal CSUP metadata")?;
        from_json(ctx, &json)
    }

    pub fn from_value(val: &Value) -> Result<Metadata> {
        let json = to_json(val);
        serde_json::from_value(json)
            .map_err(|e| DbError::with_source("invalid CSUP metadata", Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_round_trip() {
        let ctx = TypeContext::new();
        let node = Metadata::Int {
            typ: "int64".to_string(),
            location: Segment {
                offset: 1,
                length: 16,
                mem_length: 16,
                compression_format: 0,
            },
            min: Some("1".to_string()),
            max: None,
            count: 2,
        };
        let val = node.to_value(&ctx).unwrap();
        assert!(val.to_string().starts_with("{kind:\"Int\""));
        assert_eq!(node, Metadata::from_value(&val).unwrap());
    }
}
