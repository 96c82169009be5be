use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use superdb_core::config::session::SessionConfig;
use superdb_core::dag::Main;
use superdb_core::io::file::expand_paths;
use superdb_core::io::{Format, ReaderOptions, ValueReader, WriterOptions, new_writer};
use superdb_core::query::{Compiler, Engine};
use superdb_core::runtime::scan::open_path;
use superdb_core::types::TypeContext;
use superdb_core::value::Value;
use superdb_error::{DbError, Result, ResultExt};
use tracing::{Level, debug};

#[derive(Parser, Debug)]
#[clap(name = "superdb")]
struct Arguments {
    /// Query plan as DAG JSON.
    #[clap(short = 'c', conflicts_with = "plan_file")]
    plan: Option<String>,
    /// File containing a query plan as DAG JSON.
    #[clap(short = 'I')]
    plan_file: Option<PathBuf>,
    /// Input format.
    #[clap(short = 'i', default_value = "auto")]
    input_format: String,
    /// Output format.
    #[clap(short = 'f', default_value = "sup")]
    output_format: String,
    /// Write output to a file instead of stdout.
    #[clap(short = 'o')]
    output: Option<PathBuf>,
    /// BSUP decoding workers. Zero uses one per CPU.
    #[clap(long = "bsup.threads")]
    bsup_threads: Option<u64>,
    /// Largest BSUP frame accepted, in bytes.
    #[clap(long = "bsup.readmax")]
    bsup_read_max: Option<u64>,
    /// Target BSUP read size, in bytes.
    #[clap(long = "bsup.readsize")]
    bsup_read_size: Option<u64>,
    /// Validate BSUP values as they are decoded.
    #[clap(long = "bsup.validate")]
    bsup_validate: bool,
    /// CSV field delimiter.
    #[clap(long = "csv.delim")]
    csv_delim: Option<String>,
    /// Disable static type checking.
    #[clap(long)]
    dynamic: bool,
    /// Number of parallel scan paths.
    #[clap(short = 'P', long)]
    parallelism: Option<u64>,
    /// Print the optimized plan instead of running it.
    #[clap(long)]
    compile: bool,
    /// Print the plan's sources and output channels as JSON.
    #[clap(long, conflicts_with = "compile")]
    describe: bool,
    #[clap(long, default_value = "error")]
    log_level: Level,
    /// Log as JSON lines.
    #[clap(long)]
    log_json: bool,
    /// Input paths or URLs. `-` reads stdin.
    inputs: Vec<String>,
}

impl Arguments {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = SessionConfig::from_env();
        let uints = [
            ("bsup_threads", self.bsup_threads),
            ("bsup_read_max", self.bsup_read_max),
            ("bsup_read_size", self.bsup_read_size),
            ("parallelism", self.parallelism),
        ];
        for (name, val) in uints {
            if let Some(val) = val {
                config.set_from_value(name, &Value::from_uint64(val))?;
            }
        }
        if let Some(delim) = &self.csv_delim {
            config.set_from_value("csv_delim", &Value::from_str(delim))?;
        }
        if self.bsup_validate {
            config.set_from_value("bsup_validate", &Value::from_bool(true))?;
        }
        if self.dynamic {
            config.set_from_value("dynamic", &Value::from_bool(true))?;
        }
        Ok(config)
    }

    fn plan(&self) -> Result<Main> {
        match (&self.plan, &self.plan_file) {
            (Some(json), _) => Main::from_json(json),
            (None, Some(path)) => {
                let json = fs::read_to_string(path).context_fn(|| format!("{}: cannot read plan", path.display()))?;
                Main::from_json(&json)
            }
            (None, None) => Err(DbError::new("a query plan is required (-c or -I)")),
        }
    }
}

fn main() {
    let args = Arguments::parse();
    let format = if args.log_json {
        logutil::LogFormat::Json
    } else {
        logutil::LogFormat::HumanReadable
    };
    logutil::configure_global_logger(args.log_level, format, io::stderr);

    let result = std::panic::catch_unwind(|| inner(args));
    match result {
        Ok(Err(err)) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("panic: {err:?}");
            std::process::exit(2);
        }
        Ok(Ok(())) => (),
    }
}

fn inner(args: Arguments) -> Result<()> {
    let config = args.session_config()?;
    let parallelism = config.parallelism;
    let mut main = args.plan()?;

    let engine = Arc::new(Engine::new(config.clone()));
    let compiler = Compiler::new(engine.clone(), None);
    let mut out: Box<dyn Write + Send> = match &args.output {
        Some(path) => {
            let f = File::create(path).context_fn(|| format!("{}: cannot create file", path.display()))?;
            Box::new(BufWriter::new(f))
        }
        None => Box::new(BufWriter::new(io::stdout())),
    };

    if args.describe {
        let info = compiler.describe(&main)?;
        let json = serde_json::to_string_pretty(&info).context("failed to encode description")?;
        writeln!(out, "{json}").context("failed to write description")?;
        out.flush().context("failed to flush output")?;
        return Ok(());
    }

    if args.compile {
        compiler.optimize(&mut main, parallelism)?;
        writeln!(out, "{}", main.to_json_pretty()?).context("failed to write plan")?;
        out.flush().context("failed to flush output")?;
        return Ok(());
    }

    let ctx = Arc::new(TypeContext::new());
    let opts = ReaderOptions {
        format: Format::from_name(&args.input_format)?,
        ..*engine.reader_options()
    };
    let readers = expand_paths(&args.inputs)?
        .iter()
        .map(|path| open_path(ctx.clone(), path, &opts, None))
        .collect::<Result<Vec<Box<dyn ValueReader>>>>()?;

    let mut writer = new_writer(
        out,
        &WriterOptions {
            format: Format::from_name(&args.output_format)?,
            csv_delim: config.csv_delim,
            csup_object_values: config.csup_object_values,
        },
    )?;
    let mut query = compiler.new_query(ctx, main, readers, parallelism)?;
    while let Some(batch) = query.pull(false)? {
        for val in batch.values() {
            writer.write(val)?;
        }
    }
    debug!(progress = ?query.progress(), "query finished");
    query.close();
    writer.close()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_settings() {
        let args = Arguments::parse_from([
            "superdb",
            "-c",
            "{}",
            "--bsup.threads",
            "2",
            "--csv.delim",
            ";",
            "-P",
            "3",
            "--dynamic",
        ]);
        let config = args.session_config().unwrap();
        assert_eq!(2, config.bsup_threads);
        assert_eq!(b';', config.csv_delim);
        assert_eq!(3, config.parallelism);
        assert!(config.dynamic);
    }

    #[test]
    fn bad_delimiter_is_rejected() {
        let args = Arguments::parse_from(["superdb", "-c", "{}", "--csv.delim", "ab"]);
        assert!(args.session_config().is_err());
    }

    #[test]
    fn plan_is_required() {
        let args = Arguments::parse_from(["superdb", "in.sup"]);
        assert!(args.plan().is_err());
        assert_eq!(vec!["in.sup".to_string()], args.inputs);
    }

    #[test]
    fn describes_plan() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("info.json");
        let plan = r#"{"body":[{"kind":"DefaultScan"},{"kind":"Output","name":"main"}]}"#;
        let args = Arguments::parse_from(["superdb", "-c", plan, "--describe", "-o", output.to_str().unwrap()]);
        inner(args).unwrap();
        let got = fs::read_to_string(&output).unwrap();
        assert!(got.contains(r#""uri": "stdio://stdin""#));
        assert!(got.contains(r#""name": "main""#));
    }

    #[test]
    fn runs_plan_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.sup");
        let output = dir.path().join("out.sup");
        fs::write(&input, "{x:1}\n{x:2}\n").unwrap();
        let plan = r#"{"body":[{"kind":"DefaultScan"},{"kind":"Filter","expr":{"kind":"BinaryExpr","op":">",
            "lhs":{"kind":"This","path":["x"]},"rhs":{"kind":"Literal","value":"1"}}}]}"#;
        let args = Arguments::parse_from([
            "superdb",
            "-c",
            plan,
            "-P",
            "1",
            "-o",
            output.to_str().unwrap(),
            input.to_str().unwrap(),
        ]);
        inner(args).unwrap();
        assert_eq!("{x:2}\n", fs::read_to_string(&output).unwrap());
    }
}
