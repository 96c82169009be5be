//! The plan intermediate representation.
//!
//! Operators and expressions are tagged sum types. Serialization uses a
//! `kind` discriminator, and a deep copy is a serialize/deserialize round
//! trip so a copy never shares anything with its source.
pub mod expr;
pub mod walk;

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use superdb_error::{Result, ResultExt};
use uuid::Uuid;

pub use expr::{Assignment, Entry, Expr, RecordElem, SortExpr, VectorElem, join_and, split_and};

use crate::order::SortKeys;

pub type Seq = Vec<Op>;

pub const DB_METAS: &[&str] = &["branches", "pools"];
pub const POOL_METAS: &[&str] = &["branches"];
pub const COMMIT_METAS: &[&str] = &["log", "objects", "partitions", "rawlog", "vectors"];

/// Root of a plan: user function definitions and the body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Main {
    #[serde(default)]
    pub funcs: Vec<FuncDef>,
    pub body: Seq,
}

impl Main {
    pub fn new(body: Seq) -> Self {
        Main {
            funcs: Vec::new(),
            body,
        }
    }

    pub fn from_json(s: &str) -> Result<Main> {
        serde_json::from_str(s).context("failed to unmarshal plan")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to marshal plan")
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to marshal plan")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncDef {
    pub tag: String,
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    /// None marks the default case of an expression switch.
    #[serde(default)]
    pub expr: Option<Expr>,
    pub path: Seq,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScanFilter {
    #[serde(default)]
    pub projection: Option<Vec<Vec<String>>>,
    pub expr: Option<Expr>,
}

/// What a file scan may push below materialization. A `None` projection
/// reads every field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Pushdown {
    #[serde(default)]
    pub projection: Option<Vec<Vec<String>>>,
    #[serde(default)]
    pub data_filter: Option<ScanFilter>,
    #[serde(default)]
    pub meta_filter: Option<ScanFilter>,
    #[serde(default)]
    pub unordered: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateOp {
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub keys: Vec<Assignment>,
    #[serde(default)]
    pub aggs: Vec<Assignment>,
    #[serde(default)]
    pub input_sort_dir: i32,
    #[serde(default)]
    pub partials_in: bool,
    #[serde(default)]
    pub partials_out: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentsOp {
    pub args: Vec<Assignment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountOp {
    pub alias: String,
    #[serde(default)]
    pub expr: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistinctOp {
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropOp {
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplodeOp {
    pub args: Vec<Expr>,
    /// Target type in SUP syntax.
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(rename = "as")]
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterOp {
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsOp {
    pub paths: Vec<Seq>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashJoinOp {
    pub style: String,
    pub left_alias: String,
    pub right_alias: String,
    pub left_key: Expr,
    pub right_key: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountArg {
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinOp {
    pub style: String,
    pub left_alias: String,
    pub right_alias: String,
    pub cond: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadOp {
    pub pool: Uuid,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub meta: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MergeOp {
    pub exprs: Vec<SortExpr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorOp {
    pub main: Seq,
    pub mirror: Seq,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputOp {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeOp {
    pub body: Seq,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SortOp {
    pub exprs: Vec<SortExpr>,
    /// Only meaningful when `exprs` is empty.
    #[serde(default)]
    pub reverse: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchOp {
    #[serde(default)]
    pub expr: Option<Expr>,
    pub cases: Vec<Case>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TopOp {
    pub limit: usize,
    pub exprs: Vec<SortExpr>,
    #[serde(default)]
    pub reverse: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniqOp {
    #[serde(default)]
    pub cflag: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnnestOp {
    pub expr: Expr,
    #[serde(default)]
    pub body: Option<Seq>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuesOp {
    pub exprs: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitMetaScan {
    pub pool: Uuid,
    pub commit: Uuid,
    pub meta: String,
    #[serde(default)]
    pub tap: bool,
    #[serde(default)]
    pub key_pruner: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbMetaScan {
    pub meta: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DefaultScan {
    #[serde(default)]
    pub filter: Option<Expr>,
    #[serde(default)]
    pub sort_keys: SortKeys,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleterScan {
    pub pool: Uuid,
    #[serde(rename = "where")]
    pub filter: Option<Expr>,
    #[serde(default)]
    pub key_pruner: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteScan {
    pub id: Uuid,
    pub commit: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileScan {
    pub paths: Vec<String>,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub pushdown: Pushdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpScan {
    pub url: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListerScan {
    pub pool: Uuid,
    pub commit: Uuid,
    #[serde(default)]
    pub key_pruner: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolMetaScan {
    pub id: Uuid,
    pub meta: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolScan {
    pub id: Uuid,
    pub commit: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotScan {
    pub expr: Expr,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub filter: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeqScan {
    pub pool: Uuid,
    pub commit: Uuid,
    #[serde(default)]
    pub fields: Option<Vec<Vec<String>>>,
    #[serde(default)]
    pub filter: Option<Expr>,
    #[serde(default)]
    pub key_pruner: Option<Expr>,
}

/// Operator nodes, tagged by `kind` when serialized. Sources are the `*Scan`
/// variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Op {
    Aggregate(AggregateOp),
    Combine,
    Count(CountOp),
    Cut(AssignmentsOp),
    Distinct(DistinctOp),
    Drop(DropOp),
    Explode(ExplodeOp),
    Filter(FilterOp),
    Fork(PathsOp),
    Fuse,
    HashJoin(HashJoinOp),
    Head(CountArg),
    Join(JoinOp),
    Load(LoadOp),
    Merge(MergeOp),
    Mirror(MirrorOp),
    Output(OutputOp),
    Pass,
    Put(AssignmentsOp),
    Rename(AssignmentsOp),
    Scatter(PathsOp),
    Scope(ScopeOp),
    Skip(CountArg),
    Slicer,
    Sort(SortOp),
    Switch(SwitchOp),
    Tail(CountArg),
    Top(TopOp),
    Uniq(UniqOp),
    Unnest(UnnestOp),
    Values(ValuesOp),

    CommitMetaScan(CommitMetaScan),
    #[serde(rename = "DBMetaScan")]
    DbMetaScan(DbMetaScan),
    DefaultScan(DefaultScan),
    DeleterScan(DeleterScan),
    DeleteScan(DeleteScan),
    FileScan(FileScan),
    #[serde(rename = "HTTPScan")]
    HttpScan(HttpScan),
    ListerScan(ListerScan),
    NullScan,
    PoolMetaScan(PoolMetaScan),
    PoolScan(PoolScan),
    RobotScan(RobotScan),
    SeqScan(SeqScan),
}

impl Op {
    pub fn filter(expr: Expr) -> Op {
        Op::Filter(FilterOp { expr })
    }

    pub fn values(exprs: Vec<Expr>) -> Op {
        Op::Values(ValuesOp { exprs })
    }

    pub fn head(count: usize) -> Op {
        Op::Head(CountArg { count })
    }

    pub fn output(name: impl Into<String>) -> Op {
        Op::Output(OutputOp { name: name.into() })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Op::Aggregate(_) => "Aggregate",
            Op::Combine => "Combine",
            Op::Count(_) => "Count",
            Op::Cut(_) => "Cut",
            Op::Distinct(_) => "Distinct",
            Op::Drop(_) => "Drop",
            Op::Explode(_) => "Explode",
            Op::Filter(_) => "Filter",
            Op::Fork(_) => "Fork",
            Op::Fuse => "Fuse",
            Op::HashJoin(_) => "HashJoin",
            Op::Head(_) => "Head",
            Op::Join(_) => "Join",
            Op::Load(_) => "Load",
            Op::Merge(_) => "Merge",
            Op::Mirror(_) => "Mirror",
            Op::Output(_) => "Output",
            Op::Pass => "Pass",
            Op::Put(_) => "Put",
            Op::Rename(_) => "Rename",
            Op::Scatter(_) => "Scatter",
            Op::Scope(_) => "Scope",
            Op::Skip(_) => "Skip",
            Op::Slicer => "Slicer",
            Op::Sort(_) => "Sort",
            Op::Switch(_) => "Switch",
            Op::Tail(_) => "Tail",
            Op::Top(_) => "Top",
            Op::Uniq(_) => "Uniq",
            Op::Unnest(_) => "Unnest",
            Op::Values(_) => "Values",
            Op::CommitMetaScan(_) => "CommitMetaScan",
            Op::DbMetaScan(_) => "DBMetaScan",
            Op::DefaultScan(_) => "DefaultScan",
            Op::DeleterScan(_) => "DeleterScan",
            Op::DeleteScan(_) => "DeleteScan",
            Op::FileScan(_) => "FileScan",
            Op::HttpScan(_) => "HTTPScan",
            Op::ListerScan(_) => "ListerScan",
            Op::NullScan => "NullScan",
            Op::PoolMetaScan(_) => "PoolMetaScan",
            Op::PoolScan(_) => "PoolScan",
            Op::RobotScan(_) => "RobotScan",
            Op::SeqScan(_) => "SeqScan",
        }
    }

    /// Whether the operator produces data without an upstream.
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            Op::CommitMetaScan(_)
                | Op::DbMetaScan(_)
                | Op::DefaultScan(_)
                | Op::DeleterScan(_)
                | Op::DeleteScan(_)
                | Op::FileScan(_)
                | Op::HttpScan(_)
                | Op::ListerScan(_)
                | Op::NullScan
                | Op::PoolMetaScan(_)
                | Op::PoolScan(_)
                | Op::RobotScan(_)
                | Op::SeqScan(_)
        )
    }
}

/// Deep copy through the serialized form.
pub fn deep_copy<T: Serialize + DeserializeOwned>(v: &T) -> Result<T> {
    let json = serde_json::to_value(v).context("failed to marshal plan node")?;
    serde_json::from_value(json).context("failed to unmarshal plan node")
}

pub fn copy_seq(seq: &[Op]) -> Result<Seq> {
    seq.iter().map(deep_copy).collect()
}

pub fn unmarshal_op(s: &str) -> Result<Op> {
    serde_json::from_str(s).context("failed to unmarshal plan operator")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{Nulls, Which};

    fn sample() -> Main {
        Main::new(vec![
            Op::FileScan(FileScan {
                paths: vec!["a.sup".to_string()],
                format: "sup".to_string(),
                pushdown: Pushdown::default(),
            }),
            Op::filter(Expr::binary(">", Expr::this(["x"]), Expr::literal("1"))),
            Op::Fork(PathsOp {
                paths: vec![
                    vec![Op::Sort(SortOp {
                        exprs: vec![SortExpr::new(Expr::this(["x"]), Which::Desc, Nulls::First)],
                        reverse: false,
                    })],
                    vec![Op::Pass],
                ],
            }),
            Op::Combine,
            Op::output("main"),
        ])
    }

    #[test]
    fn json_round_trip() {
        let main = sample();
        let s = main.to_json().unwrap();
        assert!(s.contains(r#""kind":"FileScan""#));
        assert!(s.contains(r#""order":"desc""#));
        let back = Main::from_json(&s).unwrap();
        assert_eq!(main, back);
    }

    #[test]
    fn copy_is_independent() {
        let main = sample();
        let mut copy = copy_seq(&main.body).unwrap();
        assert_eq!(main.body, copy);
        copy[1] = Op::Pass;
        assert_ne!(main.body, copy);
    }

    #[test]
    fn unknown_kind_fails() {
        let err = unmarshal_op(r#"{"kind":"Teleport"}"#).unwrap_err();
        assert!(err.to_string().contains("unmarshal"));
    }

    #[test]
    fn unit_ops() {
        let op = unmarshal_op(r#"{"kind":"Pass"}"#).unwrap();
        assert_eq!(Op::Pass, op);
        assert!(unmarshal_op(r#"{"kind":"NullScan"}"#).unwrap().is_source());
    }
}
