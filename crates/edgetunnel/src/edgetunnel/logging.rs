use std::{
    io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::edgetunnel::config;

// Transport internals log per packet at debug; keep them quiet unless asked.
const QUIET_DEPS: &[&str] = &["quinn=warn", "quinn_proto=warn", "tokio_yamux=warn", "rustls=warn"];

const LOG_FILE_NAME: &str = "edgetunnel.log";

#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Output {
    Stderr,
    Stdout,
    Discard,
    File(PathBuf),
    /// `daily:<dir>` rotates `<dir>/edgetunnel.log.YYYY-MM-DD`.
    Daily(PathBuf),
}

impl Output {
    fn parse(s: &str) -> Output {
        match s.trim() {
            "" | "stderr" => Output::Stderr,
            "stdout" => Output::Stdout,
            "discard" => Output::Discard,
            other => match other.strip_prefix("daily:") {
                Some(dir) => Output::Daily(PathBuf::from(dir.trim())),
                None => Output::File(PathBuf::from(other)),
            },
        }
    }
}

fn directive(level: &str) -> String {
    let level = match level.trim().to_ascii_lowercase().as_str() {
        l @ ("trace" | "debug" | "info" | "warn" | "error") => l.to_string(),
        _ => "info".to_string(),
    };
    if level == "trace" {
        return level;
    }
    std::iter::once(level.as_str())
        .chain(QUIET_DEPS.iter().copied())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn init(logging: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let fmt = logging.format.trim().to_ascii_lowercase();

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive(&logging.level)))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(&Output::parse(&logging.output))?;

    let base_fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(fmt == "text")
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);

    let base_fmt = match fmt.as_str() {
        "json" => base_fmt.json().boxed(),
        "compact" => base_fmt.compact().boxed(),
        _ => base_fmt.boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(base_fmt)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

fn make_writer(output: &Output) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    match output {
        Output::Stderr => Ok(tracing_appender::non_blocking(io::stderr())),
        Output::Stdout => Ok(tracing_appender::non_blocking(io::stdout())),
        Output::Discard => Ok(tracing_appender::non_blocking(io::sink())),
        Output::Daily(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("logging: mkdir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            Ok(tracing_appender::non_blocking(appender))
        }
        Output::File(p) => {
            create_parent(p)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}

fn create_parent(p: &Path) -> anyhow::Result<()> {
    if let Some(parent) = p.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("logging: mkdir {}", parent.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_targets() {
        assert_eq!(Output::parse(""), Output::Stderr);
        assert_eq!(Output::parse("stdout"), Output::Stdout);
        assert_eq!(Output::parse("discard"), Output::Discard);
        assert_eq!(
            Output::parse("daily:/var/log/edgetunnel"),
            Output::Daily(PathBuf::from("/var/log/edgetunnel"))
        );
        assert_eq!(
            Output::parse("/var/log/edgetunnel.log"),
            Output::File(PathBuf::from("/var/log/edgetunnel.log"))
        );
    }

    #[test]
    fn directive_quiets_transport_crates() {
        assert_eq!(
            directive("DEBUG"),
            "debug,quinn=warn,quinn_proto=warn,tokio_yamux=warn,rustls=warn"
        );
        assert!(directive("bogus").starts_with("info,"));
        assert_eq!(directive("trace"), "trace");
        for l in ["debug", "info", "warn", "error"] {
            assert!(EnvFilter::try_new(directive(l)).is_ok(), "{l}");
        }
    }
}
