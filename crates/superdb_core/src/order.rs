//! Sort order descriptors shared by the plan and the runtime.
use std::fmt;

use serde::{Deserialize, Serialize};
use superdb_error::{DbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Which {
    #[default]
    Asc,
    Desc,
}

impl Which {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(Which::Asc),
            "desc" => Ok(Which::Desc),
            _ => Err(DbError::new(format!("unknown order: {s}"))),
        }
    }

    pub fn flip(self) -> Self {
        match self {
            Which::Asc => Which::Desc,
            Which::Desc => Which::Asc,
        }
    }

    /// Direction as used by aggregations over sorted input: 1 ascending,
    /// -1 descending.
    pub fn direction(self) -> i32 {
        match self {
            Which::Asc => 1,
            Which::Desc => -1,
        }
    }
}

impl fmt::Display for Which {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Which::Asc => write!(f, "asc"),
            Which::Desc => write!(f, "desc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nulls {
    First,
    #[default]
    Last,
}

impl Nulls {
    pub fn flip(self) -> Self {
        match self {
            Nulls::First => Nulls::Last,
            Nulls::Last => Nulls::First,
        }
    }
}

/// A path-based sort key of a data source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub order: Which,
    pub key: Vec<String>,
}

impl SortKey {
    pub fn new(key: Vec<String>, order: Which) -> Self {
        SortKey { order, key }
    }
}

pub type SortKeys = Vec<SortKey>;

/// Leading key of a list of sort keys.
pub fn primary(keys: &[SortKey]) -> Option<&SortKey> {
    keys.first()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn which_json() {
        assert_eq!("\"desc\"", serde_json::to_string(&Which::Desc).unwrap());
        let w: Which = serde_json::from_str("\"asc\"").unwrap();
        assert_eq!(Which::Asc, w);
        assert!(Which::parse("sideways").is_err());
        assert_eq!(Which::Desc, Which::parse("DESC").unwrap());
    }
}
