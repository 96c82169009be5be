use serde::{Deserialize, Serialize};

use super::Seq;
use crate::order::{Nulls, Which};

/// Expression nodes of the plan, tagged by `kind` when serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Expr {
    Agg {
        name: String,
        #[serde(default)]
        distinct: bool,
        #[serde(default)]
        expr: Option<Box<Expr>>,
        #[serde(default, rename = "where")]
        filter: Option<Box<Expr>>,
    },
    ArrayExpr {
        elems: Vec<VectorElem>,
    },
    /// Placeholder for an expression that failed semantic checks. Never
    /// reaches the runtime.
    BadExpr,
    BinaryExpr {
        op: String,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        name: String,
        #[serde(default)]
        args: Vec<Expr>,
    },
    /// Call of a function passed by reference as the parameter `param`.
    CallParam {
        param: String,
        #[serde(default)]
        args: Vec<Expr>,
    },
    Conditional {
        cond: Box<Expr>,
        then: Box<Expr>,
        #[serde(rename = "else")]
        otherwise: Box<Expr>,
    },
    Dot {
        lhs: Box<Expr>,
        rhs: String,
    },
    /// Reference to a function definition by tag.
    FuncRef {
        tag: String,
    },
    IndexExpr {
        expr: Box<Expr>,
        index: Box<Expr>,
    },
    IsNullExpr {
        expr: Box<Expr>,
    },
    /// A constant in SUP text form.
    Literal {
        value: String,
    },
    MapCall {
        expr: Box<Expr>,
        inner: Box<Expr>,
    },
    MapExpr {
        entries: Vec<Entry>,
    },
    RecordExpr {
        elems: Vec<RecordElem>,
    },
    RegexpMatch {
        pattern: String,
        expr: Box<Expr>,
    },
    RegexpSearch {
        pattern: String,
        expr: Box<Expr>,
    },
    Search {
        text: String,
        value: String,
        expr: Box<Expr>,
    },
    SetExpr {
        elems: Vec<VectorElem>,
    },
    SliceExpr {
        expr: Box<Expr>,
        #[serde(default)]
        from: Option<Box<Expr>>,
        #[serde(default)]
        to: Option<Box<Expr>>,
    },
    Subquery {
        #[serde(default)]
        correlated: bool,
        body: Seq,
    },
    This {
        path: Vec<String>,
    },
    UnaryExpr {
        op: String,
        operand: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RecordElem {
    Field { name: String, value: Expr },
    Spread { expr: Expr },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum VectorElem {
    Spread { expr: Expr },
    VectorValue { expr: Expr },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: Expr,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortExpr {
    pub key: Expr,
    #[serde(default)]
    pub order: Which,
    #[serde(default)]
    pub nulls: Nulls,
}

impl SortExpr {
    pub fn new(key: Expr, order: Which, nulls: Nulls) -> Self {
        SortExpr { key, order, nulls }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub lhs: Expr,
    pub rhs: Expr,
}

impl Assignment {
    pub fn new(lhs: Expr, rhs: Expr) -> Self {
        Assignment { lhs, rhs }
    }
}

impl Expr {
    pub fn this<S: Into<String>>(path: impl IntoIterator<Item = S>) -> Expr {
        Expr::This {
            path: path.into_iter().map(Into::into).collect(),
        }
    }

    pub fn literal(value: impl Into<String>) -> Expr {
        Expr::Literal {
            value: value.into(),
        }
    }

    pub fn binary(op: impl Into<String>, lhs: Expr, rhs: Expr) -> Expr {
        Expr::BinaryExpr {
            op: op.into(),
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            name: name.into(),
            args,
        }
    }

    pub fn dot(lhs: Expr, rhs: impl Into<String>) -> Expr {
        Expr::Dot {
            lhs: Box::new(lhs),
            rhs: rhs.into(),
        }
    }

    pub fn agg(name: impl Into<String>, expr: Option<Expr>) -> Expr {
        Expr::Agg {
            name: name.into(),
            distinct: false,
            expr: expr.map(Box::new),
            filter: None,
        }
    }

    /// Path of a `This` expression.
    pub fn this_path(&self) -> Option<&[String]> {
        match self {
            Expr::This { path } => Some(path),
            _ => None,
        }
    }

    pub fn literal_text(&self) -> Option<&str> {
        match self {
            Expr::Literal { value } => Some(value),
            _ => None,
        }
    }

    pub fn is_this(&self) -> bool {
        matches!(self, Expr::This { .. })
    }
}

/// Splits a predicate into its `and` conjuncts.
pub fn split_and(expr: Expr) -> Vec<Expr> {
    match expr {
        Expr::BinaryExpr { op, lhs, rhs } if op == "and" => {
            let mut out = split_and(*lhs);
            out.extend(split_and(*rhs));
            out
        }
        other => vec![other],
    }
}

/// Joins conjuncts with `and`, left-deep. Returns None for an empty list.
pub fn join_and(exprs: Vec<Expr>) -> Option<Expr> {
    exprs.into_iter().reduce(|acc, e| Expr::binary("and", acc, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join() {
        let e = Expr::binary(
            "and",
            Expr::binary("==", Expr::this(["a"]), Expr::literal("1")),
            Expr::binary(
                "and",
                Expr::this(["b"]),
                Expr::binary("or", Expr::this(["c"]), Expr::this(["d"])),
            ),
        );
        let parts = split_and(e);
        assert_eq!(3, parts.len());
        assert!(matches!(&parts[2], Expr::BinaryExpr { op, .. } if op == "or"));
        let joined = join_and(parts).unwrap();
        assert_eq!(3, split_and(joined).len());
        assert!(join_and(Vec::new()).is_none());
    }

    #[test]
    fn json_tags() {
        let e = Expr::agg("count", None);
        let s = serde_json::to_string(&e).unwrap();
        assert_eq!(
            r#"{"kind":"Agg","name":"count","distinct":false,"expr":null,"where":null}"#,
            s
        );
        let back: Expr = serde_json::from_str(r#"{"kind":"This","path":["x"]}"#).unwrap();
        assert_eq!(Expr::this(["x"]), back);
    }
}
