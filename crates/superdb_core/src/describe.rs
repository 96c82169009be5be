//! Static description of a plan: where its data comes from and what each
//! output channel looks like.
use std::sync::Arc;

use serde::Serialize;
use superdb_error::{DbError, Result};
use uuid::Uuid;

use crate::dag::walk::walk;
use crate::dag::{Main, Op, Seq};
use crate::lake::Lake;
use crate::optimizer::Optimizer;
use crate::order::SortKeys;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Info {
    pub sources: Vec<Source>,
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum Source {
    #[serde(rename = "DBMeta")]
    DbMeta { meta: String },
    Pool { name: String, id: Uuid },
    Path { uri: String },
    Null,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Channel {
    pub name: String,
    /// Group-by keys of the aggregate feeding the channel, if one does.
    pub aggregation_keys: Option<Vec<Vec<String>>>,
    pub sort: SortKeys,
}

/// Describes the sources and output channels of `main`. Pool sources are
/// resolved to names through `lake`.
///
/// When several outputs share a name their values interleave, so the
/// merged channel claims neither an order nor aggregation keys.
pub fn describe(main: &Main, lake: Option<Arc<dyn Lake>>) -> Result<Info> {
    let Some(first) = main.body.first() else {
        return Err(DbError::new("describe: empty plan"));
    };
    let mut sources = Vec::new();
    describe_sources(lake.as_deref(), first, &mut sources)?;

    let sort_keys = Optimizer::new(lake, false).sort_keys(&main.body)?;
    let aggs = describe_aggs(&main.body, vec![None]);
    let outputs = collect_outputs(&main.body);

    let mut channels: Vec<Channel> = Vec::with_capacity(outputs.len());
    for (i, name) in outputs.into_iter().enumerate() {
        if let Some(existing) = channels.iter_mut().find(|c| c.name == name) {
            existing.sort = SortKeys::new();
            existing.aggregation_keys = None;
            continue;
        }
        channels.push(Channel {
            name,
            aggregation_keys: aggs.get(i).cloned().flatten(),
            sort: sort_keys.get(i).cloned().unwrap_or_default(),
        });
    }
    Ok(Info { sources, channels })
}

fn describe_sources(lake: Option<&dyn Lake>, op: &Op, out: &mut Vec<Source>) -> Result<()> {
    match op {
        Op::Fork(paths) => {
            for path in &paths.paths {
                if let Some(first) = path.first() {
                    describe_sources(lake, first, out)?;
                }
            }
        }
        Op::DefaultScan(_) => out.push(Source::Path {
            uri: "stdio://stdin".to_string(),
        }),
        Op::FileScan(scan) => out.extend(scan.paths.iter().map(|p| Source::Path { uri: p.clone() })),
        Op::HttpScan(scan) => out.push(Source::Path { uri: scan.url.clone() }),
        Op::NullScan => out.push(Source::Null),
        Op::DbMetaScan(scan) => out.push(Source::DbMeta { meta: scan.meta.clone() }),
        Op::PoolScan(scan) => out.push(pool_source(lake, &scan.id)?),
        Op::ListerScan(scan) => out.push(pool_source(lake, &scan.pool)?),
        Op::SeqScan(scan) => out.push(pool_source(lake, &scan.pool)?),
        Op::CommitMetaScan(scan) => out.push(pool_source(lake, &scan.pool)?),
        other => {
            return Err(DbError::new(format!("unsupported source type {}", other.kind())));
        }
    }
    Ok(())
}

fn pool_source(lake: Option<&dyn Lake>, id: &Uuid) -> Result<Source> {
    let lake = lake.ok_or_else(|| DbError::new("describe: pool sources require a lake"))?;
    let config = lake.pool(id)?;
    Ok(Source::Pool {
        name: config.name,
        id: config.id,
    })
}

/// Aggregation keys at each path end of `seq`, in the order sort keys are
/// reported.
fn describe_aggs(seq: &Seq, mut parents: Vec<Option<Vec<Vec<String>>>>) -> Vec<Option<Vec<Vec<String>>>> {
    for op in seq {
        parents = match op {
            Op::Fork(p) | Op::Scatter(p) => p
                .paths
                .iter()
                .flat_map(|path| describe_aggs(path, vec![None]))
                .collect(),
            Op::Mirror(m) => {
                let mut aggs = describe_aggs(&m.main, vec![None]);
                aggs.extend(describe_aggs(&m.mirror, vec![None]));
                aggs
            }
            Op::Aggregate(agg) => {
                let keys = agg
                    .keys
                    .iter()
                    .filter_map(|k| k.lhs.this_path().map(<[String]>::to_vec))
                    .collect();
                vec![Some(keys)]
            }
            _ if parents.len() > 1 => vec![None],
            _ => parents,
        };
    }
    parents
}

/// Names of the outputs ending each sequence, nested paths first.
fn collect_outputs(seq: &Seq) -> Vec<String> {
    let mut names = Vec::new();
    walk(&mut seq.clone(), false, &mut |seq| {
        if let Some(Op::Output(out)) = seq.last() {
            names.push(out.name.clone());
        }
    });
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{AggregateOp, Assignment, DefaultScan, Expr, FileScan, OutputOp, PathsOp, SortExpr, SortOp};
    use crate::lake::MemoryLake;
    use crate::order::{Nulls, SortKey, Which};

    fn output(name: &str) -> Op {
        Op::Output(OutputOp { name: name.to_string() })
    }

    fn count_by(key: &str) -> Op {
        Op::Aggregate(AggregateOp {
            keys: vec![Assignment::new(Expr::this([key]), Expr::this([key]))],
            aggs: vec![Assignment::new(
                Expr::this(["count"]),
                Expr::Agg {
                    name: "count".to_string(),
                    distinct: false,
                    expr: None,
                    filter: None,
                },
            )],
            ..Default::default()
        })
    }

    fn sort_by(field: &str) -> Op {
        Op::Sort(SortOp {
            exprs: vec![SortExpr::new(Expr::this([field]), Which::Asc, Nulls::Last)],
            reverse: false,
        })
    }

    #[test]
    fn forked_outputs() {
        let main = Main::new(vec![
            Op::DefaultScan(DefaultScan::default()),
            Op::Fork(PathsOp {
                paths: vec![vec![count_by("a"), output("counts")], vec![sort_by("x"), output("sorted")]],
            }),
        ]);
        let info = describe(&main, None).unwrap();
        assert_eq!(
            vec![Source::Path {
                uri: "stdio://stdin".to_string()
            }],
            info.sources
        );
        assert_eq!(
            vec![
                Channel {
                    name: "counts".to_string(),
                    aggregation_keys: Some(vec![vec!["a".to_string()]]),
                    sort: SortKeys::new(),
                },
                Channel {
                    name: "sorted".to_string(),
                    aggregation_keys: None,
                    sort: vec![SortKey::new(vec!["x".to_string()], Which::Asc)],
                },
            ],
            info.channels
        );
    }

    #[test]
    fn repeated_output_name_clears_properties() {
        let main = Main::new(vec![
            Op::DefaultScan(DefaultScan::default()),
            Op::Fork(PathsOp {
                paths: vec![vec![count_by("a"), output("main")], vec![sort_by("x"), output("main")]],
            }),
        ]);
        let info = describe(&main, None).unwrap();
        assert_eq!(1, info.channels.len());
        assert_eq!(None, info.channels[0].aggregation_keys);
        assert!(info.channels[0].sort.is_empty());
    }

    #[test]
    fn pool_sources_are_named() {
        let lake = Arc::new(MemoryLake::new());
        let id = lake.create_pool("logs", SortKeys::new(), 1024).unwrap();
        let main = Main::new(vec![
            Op::PoolScan(crate::dag::PoolScan { id, commit: Uuid::nil() }),
            output("main"),
        ]);
        let info = describe(&main, Some(lake)).unwrap();
        assert_eq!(
            vec![Source::Pool {
                name: "logs".to_string(),
                id
            }],
            info.sources
        );
    }

    #[test]
    fn file_sources_and_errors() {
        let main = Main::new(vec![Op::FileScan(FileScan {
            paths: vec!["a.sup".to_string(), "b.sup".to_string()],
            format: String::new(),
            pushdown: Default::default(),
        })]);
        let info = describe(&main, None).unwrap();
        assert_eq!(2, info.sources.len());
        assert!(info.channels.is_empty());

        let err = describe(&Main::new(vec![sort_by("x")]), None).unwrap_err();
        assert!(err.to_string().contains("unsupported source type"));
    }

    #[test]
    fn serializes_kind_tags() {
        let json = serde_json::to_string(&Source::DbMeta { meta: "pools".to_string() }).unwrap();
        assert_eq!(r#"{"kind":"DBMeta","meta":"pools"}"#, json);
    }
}
