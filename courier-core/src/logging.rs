use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

/// Transport and database crates log every connection at debug
const QUIET_DEPENDENCIES: [&str; 5] = [
    "hyper=warn",
    "hyper_util=warn",
    "reqwest=warn",
    "h2=warn",
    "sqlx=warn",
];

/// Initialize structured logging based on configuration
///
/// `RUST_LOG` replaces the configured filter entirely. Otherwise the
/// configured level applies, HTTP and database dependencies are held at
/// `warn`, and `logging.directives` (e.g. `courier_cluster::rpc=debug`)
/// are applied last.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = build_filter(config, std::env::var("RUST_LOG").ok().as_deref())?;

    let writer = match &config.file_path {
        Some(file_path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let layer = if config.format.as_str() == "json" {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_line_number(true)
            .with_file(false)
            .with_writer(writer)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .try_init()?;

    Ok(())
}

fn build_filter(config: &LoggingConfig, rust_log: Option<&str>) -> anyhow::Result<EnvFilter> {
    if let Some(filter) = rust_log.and_then(|spec| EnvFilter::try_new(spec).ok()) {
        return Ok(filter);
    }

    let level = parse_log_level(&config.level)?;
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .parse_lossy("");
    let directives = QUIET_DEPENDENCIES
        .iter()
        .map(|d| (*d).to_string())
        .chain(config.directives.iter().cloned());
    for directive in directives {
        let parsed = directive
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid log directive {directive:?}: {e}"))?;
        filter = filter.add_directive(parsed);
    }
    Ok(filter)
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

/// Generate a correlation id shared by every hop of one logical request chain
#[must_use]
pub fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate an id for a single outbound request
#[must_use]
pub fn generate_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}
