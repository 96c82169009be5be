//! Lake capabilities used by the query core.
//!
//! A lake holds pools. A pool is a set of branches pointing at commits, and
//! a commit is an immutable list of data objects sorted by the pool's sort
//! key. The core only needs the operations in [`Lake`]; [`MemoryLake`]
//! implements them in memory.
pub mod memory;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use superdb_error::Result;
use uuid::Uuid;

use crate::order::SortKeys;
use crate::types::TypeContext;
use crate::value::Value;

pub use memory::MemoryLake;

/// Default number of values per data object.
pub const DEFAULT_POOL_THRESHOLD: usize = 500_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: Uuid,
    pub name: String,
    pub sort_keys: SortKeys,
    pub threshold: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BranchInfo {
    pub name: String,
    pub commit: Uuid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitInfo {
    pub id: Uuid,
    pub parent: Option<Uuid>,
    pub author: String,
    pub message: String,
    pub meta: String,
    pub date: DateTime<Utc>,
}

/// A data object. `min` and `max` bound the values of the pool's primary
/// sort key within the object.
#[derive(Debug, Clone, PartialEq)]
pub struct DataObject {
    pub id: Uuid,
    pub min: Value,
    pub max: Value,
    pub count: u64,
    pub size: u64,
}

/// Commit metadata supplied by a load.
#[derive(Debug, Clone, Default)]
pub struct CommitMessage {
    pub author: String,
    pub message: String,
    pub meta: String,
}

pub trait Lake: Send + Sync {
    fn pools(&self) -> Result<Vec<PoolConfig>>;

    fn pool(&self, id: &Uuid) -> Result<PoolConfig>;

    fn branches(&self, pool: &Uuid) -> Result<Vec<BranchInfo>>;

    /// Commits reachable from `commit`, newest first.
    fn commit_log(&self, pool: &Uuid, commit: &Uuid) -> Result<Vec<CommitInfo>>;

    /// Objects of a commit in pool key order, with `min` and `max` mapped
    /// into `ctx`.
    fn objects(&self, ctx: &TypeContext, pool: &Uuid, commit: &Uuid) -> Result<Vec<DataObject>>;

    /// Values of an object, typed in `ctx`.
    fn read_object(&self, ctx: &Arc<TypeContext>, pool: &Uuid, object: &Uuid) -> Result<Vec<Value>>;

    /// Adds values to a branch, returning the new commit.
    fn load(&self, pool: &Uuid, branch: &str, vals: Vec<Value>, msg: CommitMessage) -> Result<Uuid>;

    /// Removes objects from a branch and adds `vals` in one commit.
    fn replace(
        &self,
        pool: &Uuid,
        branch: &str,
        deleted: &[Uuid],
        vals: Vec<Value>,
        msg: CommitMessage,
    ) -> Result<Uuid>;
}
