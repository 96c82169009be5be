//! Query compilation and execution core for super-structured data.
//!
//! A query enters as a [`dag::Main`], is rewritten by the
//! [`optimizer::Optimizer`], compiled into pullers by the
//! [`builder::Builder`] and executed by the pull-based [`runtime`] or its
//! columnar counterpart in [`vector`].
pub mod bsup;
pub mod builder;
pub mod config;
pub mod csup;
pub mod dag;
pub mod describe;
pub mod io;
pub mod lake;
pub mod optimizer;
pub mod order;
pub mod query;
pub mod runtime;
pub mod types;
pub mod value;
pub mod vector;
