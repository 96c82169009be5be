//! Scalar operators.
//!
//! Operators that only move, slice or route chunks are generic over
//! [`Chunk`](super::Chunk) and serve the vector runtime as well.
pub mod aggregate;
pub mod applier;
pub mod explode;
pub mod fork;
pub mod join;
pub mod limit;
pub mod merge;
pub mod output;
pub mod sort;
pub mod subquery;
pub mod switch;
pub mod uniq;

pub use aggregate::Aggregate;
pub use applier::{Applier, CutEval, DropEval, FilterEval, PutEval, RenameEval, Values};
pub use explode::{Explode, Scope, ScopeEntry, ScopeExit, Unnest, unnest_value};
pub use fork::{Fork, Shared};
pub use join::{HashJoin, JoinStyle, NestedLoopJoin};
pub use limit::{Head, Skip, Tail};
pub use merge::{Combine, Merge};
pub use output::{Count, Fuse, Load, Output, Pass};
pub use sort::{Sort, Top};
pub use subquery::{BodyFactory, CachedSubquery, Feeder, Subquery, SubqueryBody};
pub use switch::{CaseRouter, ExprSwitch, Router, Switch};
pub use uniq::{Distinct, Uniq};
