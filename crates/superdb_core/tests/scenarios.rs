//! End-to-end queries run through the compiler on the row runtime and the
//! vector runtime.
use std::fs;
use std::sync::Arc;

use superdb_core::config::session::SessionConfig;
use superdb_core::builder::Builder;
use superdb_core::dag::{
    AggregateOp, Assignment, AssignmentsOp, DefaultScan, Expr, FileScan, FilterOp, Main, Op, SortExpr, SortOp,
    TopOp, UniqOp, UnnestOp,
};
use superdb_core::io::{ArrayReader, Format, ReaderOptions, ValueReader, WriterOptions, new_writer};
use superdb_core::order::{Nulls, Which};
use superdb_core::query::{Compiler, Engine};
use superdb_core::runtime::{Progress, Puller, RuntimeContext};
use superdb_core::types::TypeContext;
use superdb_core::value::sup::parse_values;
use superdb_error::Result;

fn compiler(vector: bool) -> Compiler {
    let config = SessionConfig {
        vector_execution: vector,
        ..Default::default()
    };
    Compiler::new(Arc::new(Engine::new(config)), None)
}

fn run(body: Vec<Op>, input: &str, vector: bool) -> Result<Vec<String>> {
    logutil::init_test();
    let ctx = Arc::new(TypeContext::new());
    let vals = parse_values(&ctx, input)?;
    let readers: Vec<Box<dyn ValueReader>> = vec![Box::new(ArrayReader::new(vals))];
    let mut q = compiler(vector).new_query(ctx, Main::new(body), readers, 1)?;
    let mut out = Vec::new();
    while let Some(batch) = q.pull(false)? {
        out.extend(batch.values().iter().map(|v| v.to_string()));
    }
    q.close();
    Ok(out)
}

fn scan() -> Op {
    Op::DefaultScan(DefaultScan::default())
}

fn agg(name: &str, expr: Option<Expr>) -> Expr {
    Expr::Agg {
        name: name.to_string(),
        distinct: false,
        expr: expr.map(Box::new),
        filter: None,
    }
}

fn sort_by(field: &str) -> Op {
    Op::Sort(SortOp {
        exprs: vec![SortExpr::new(Expr::this([field]), Which::Asc, Nulls::Last)],
        reverse: false,
    })
}

#[test]
fn filter_then_count() {
    for vector in [false, true] {
        let body = vec![
            scan(),
            Op::Filter(FilterOp {
                expr: Expr::binary(">", Expr::this(["x"]), Expr::literal("1")),
            }),
            Op::Aggregate(AggregateOp {
                aggs: vec![Assignment::new(Expr::this(["count"]), agg("count", None))],
                ..Default::default()
            }),
        ];
        assert_eq!(vec!["{count:2}"], run(body, "{x:1} {x:2} {x:3}", vector).unwrap());
    }
}

#[test]
fn sum_grouped_by_key() {
    for vector in [false, true] {
        let body = vec![
            scan(),
            Op::Aggregate(AggregateOp {
                keys: vec![Assignment::new(Expr::this(["a"]), Expr::this(["a"]))],
                aggs: vec![Assignment::new(Expr::this(["sum"]), agg("sum", Some(Expr::this(["b"]))))],
                ..Default::default()
            }),
        ];
        let mut got = run(body, "{a:1,b:2} {a:1,b:3} {a:2,b:4}", vector).unwrap();
        got.sort();
        assert_eq!(vec!["{a:1,sum:5}", "{a:2,sum:4}"], got);
    }
}

#[test]
fn string_equality() {
    for vector in [false, true] {
        let body = vec![
            scan(),
            Op::Filter(FilterOp {
                expr: Expr::binary("==", Expr::this(["s"]), Expr::literal("\"hello\"")),
            }),
        ];
        assert_eq!(
            vec!["{s:\"hello\"}"],
            run(body, "{s:\"hello\"} {s:\"world\"}", vector).unwrap()
        );
    }
}

#[test]
fn unnest_array_in_order() {
    for vector in [false, true] {
        let body = vec![
            scan(),
            Op::Unnest(UnnestOp {
                expr: Expr::this(["v"]),
                body: None,
            }),
        ];
        assert_eq!(vec!["1", "2", "3"], run(body, "{v:[1,2,3]}", vector).unwrap());
    }
}

#[test]
fn sort_then_head() {
    for vector in [false, true] {
        let body = vec![scan(), sort_by("x"), Op::head(2)];
        assert_eq!(vec!["{x:1}", "{x:2}"], run(body, "{x:3} {x:1} {x:4} {x:2}", vector).unwrap());
    }
}

#[test]
fn fuse_files_then_sort() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.sup");
    let b = dir.path().join("b.sup");
    fs::write(&a, "{k:1,v:\"a\"}\n").unwrap();
    fs::write(&b, "{k:2,v:\"b\",w:true}\n").unwrap();
    let paths: Vec<String> = [&b, &a].iter().map(|p| p.to_string_lossy().into_owned()).collect();
    for vector in [false, true] {
        let body = vec![
            Op::FileScan(FileScan {
                paths: paths.clone(),
                format: String::new(),
                pushdown: Default::default(),
            }),
            Op::Fuse,
            sort_by("k"),
        ];
        assert_eq!(
            vec!["{k:1,v:\"a\",w:null::bool}", "{k:2,v:\"b\",w:true}"],
            run(body, "", vector).unwrap()
        );
    }
}

fn file_scan(path: &str) -> Op {
    Op::FileScan(FileScan {
        paths: vec![path.to_string()],
        format: String::new(),
        pushdown: Default::default(),
    })
}

fn cut(field: &str) -> Op {
    Op::Cut(AssignmentsOp {
        args: vec![Assignment::new(Expr::this([field]), Expr::this([field]))],
    })
}

/// Runs a plan through the compiler, optimizations included.
fn run_optimized(body: Vec<Op>, vector: bool) -> Result<(Vec<String>, Progress)> {
    let ctx = Arc::new(TypeContext::new());
    let mut q = compiler(vector).new_query(ctx, Main::new(body), Vec::new(), 1)?;
    let mut out = Vec::new();
    while let Some(batch) = q.pull(false)? {
        out.extend(batch.values().iter().map(|v| v.to_string()));
    }
    let progress = q.progress();
    q.close();
    Ok((out, progress))
}

/// Builds a plan exactly as given, with no rewrites.
fn run_unoptimized(body: Vec<Op>, vector: bool) -> Result<Vec<String>> {
    let config = SessionConfig {
        vector_execution: vector,
        ..Default::default()
    };
    let rctx = RuntimeContext::new(Arc::new(TypeContext::new()), config);
    let mut b = Builder::new(rctx.clone(), None, ReaderOptions::default(), Vec::new(), Vec::new());
    b.build(&body, vector)?;
    let mut out = Vec::new();
    for (_, pullers) in b.take_channels() {
        for mut p in pullers {
            while let Some(batch) = p.pull(false)? {
                out.extend(batch.values().iter().map(|v| v.to_string()));
            }
        }
    }
    rctx.cancel();
    Ok(out)
}

#[test]
fn projection_keeps_fields_operators_need() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("in.sup");
    fs::write(&path, "{x:2,y:\"b\"} {x:1,y:\"a\"} {x:3,y:\"a\"}\n").unwrap();
    let path = path.to_string_lossy().into_owned();
    let plans: Vec<(Vec<Op>, Vec<&str>)> = vec![
        (vec![file_scan(&path), sort_by("x"), cut("y")], vec!["{y:\"a\"}", "{y:\"b\"}", "{y:\"a\"}"]),
        (
            vec![file_scan(&path), Op::Uniq(UniqOp { cflag: false }), cut("y")],
            vec!["{y:\"b\"}", "{y:\"a\"}", "{y:\"a\"}"],
        ),
        (
            vec![
                file_scan(&path),
                Op::Top(TopOp {
                    limit: 1,
                    exprs: vec![SortExpr::new(Expr::this(["x"]), Which::Asc, Nulls::Last)],
                    reverse: false,
                }),
                cut("y"),
            ],
            vec!["{y:\"a\"}"],
        ),
    ];
    for vector in [false, true] {
        for (body, want) in &plans {
            let (got, _) = run_optimized(body.clone(), vector).unwrap();
            assert_eq!(*want, got, "{body:?}");
            assert_eq!(run_unoptimized(body.clone(), vector).unwrap(), got);
        }
    }
}

#[test]
fn csup_metadata_skips_objects_without_changing_results() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("k.csup");
    let ctx = TypeContext::new();
    let opts = WriterOptions {
        format: Format::Csup,
        csup_object_values: 2,
        ..Default::default()
    };
    let mut w = new_writer(Box::new(fs::File::create(&path).unwrap()), &opts).unwrap();
    for v in parse_values(&ctx, "{k:1} {k:2} {k:10} {k:11}").unwrap() {
        w.write(&v).unwrap();
    }
    w.close().unwrap();
    let path = path.to_string_lossy().into_owned();
    let body = vec![
        file_scan(&path),
        Op::Filter(FilterOp {
            expr: Expr::binary(">=", Expr::this(["k"]), Expr::literal("10")),
        }),
    ];

    let (got, progress) = run_optimized(body.clone(), true).unwrap();
    assert_eq!(vec!["{k:10}", "{k:11}"], got);
    assert_eq!(run_unoptimized(body, true).unwrap(), got);
    // The first object never loads.
    assert_eq!(4, progress.records_read);
    assert_eq!(2, progress.records_matched);
}
