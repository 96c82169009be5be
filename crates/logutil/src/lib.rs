//! Utilities for logging.
use std::io;

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    HumanReadable,
    Json,
}

/// Configure the global logger.
///
/// `RUST_LOG` overrides `default_level` when set. Errors from installing the
/// subscriber (e.g. one is already installed) are ignored.
pub fn configure_global_logger<W>(default_level: Level, format: LogFormat, writer: W)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let mut env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    // Quiet down the http stack.
    for directive in ["h2=info", "hyper=info", "reqwest=info"] {
        if let Ok(directive) = directive.parse() {
            env_filter = env_filter.add_directive(directive);
        }
    }

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_writer(writer);

    let _ = match format {
        LogFormat::HumanReadable => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

/// Install a debug logger that writes to stderr for tests.
pub fn init_test() {
    configure_global_logger(Level::DEBUG, LogFormat::HumanReadable, io::stderr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_twice_is_harmless() {
        init_test();
        configure_global_logger(Level::INFO, LogFormat::Json, io::stderr);
        tracing::debug!("logger configured");
    }
}
