/*!
 * Tracing subscriber setup
 *
 * The library only emits `tracing` events; installing a subscriber is left to
 * the embedding program. [`init_logging`] is a convenience that honors
 * `RUST_LOG` first and the configured level second.
 */

use std::fs::OpenOptions;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::S3FileConfig;
use crate::error::{S3Error, S3Result};

/// Install a global subscriber: compact text on stdout, or JSON lines when a
/// log file is configured
pub fn init_logging(config: &S3FileConfig) -> S3Result<()> {
    let filter = filter_for(effective_level(config))?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.log_file.as_deref() {
        Some(path) => {
            let sink = open_log_file(path)?;
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(sink)
                        .with_ansi(false)
                        .with_thread_names(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_span_events(FmtSpan::CLOSE),
                )
                .try_init()
        }
        None => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_writer(std::io::stdout)
                    .with_span_events(FmtSpan::NONE),
            )
            .try_init(),
    };

    installed.map_err(|e| S3Error::Invalid(format!("logging already initialized: {}", e)))
}

fn effective_level(config: &S3FileConfig) -> Level {
    if config.verbose {
        return Level::DEBUG;
    }
    config.log_level.to_tracing_level()
}

fn filter_for(level: Level) -> S3Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = format!("s3file={}", level.to_string().to_ascii_lowercase());
    EnvFilter::try_new(&directive)
        .map_err(|e| S3Error::Invalid(format!("bad log directive {:?}: {}", directive, e)))
}

fn open_log_file(path: &Path) -> S3Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| S3Error::Io(format!("open log file {}: {}", path.display(), e)))
}

/// Route `s3file` events to the test harness output, once per process
#[cfg(test)]
pub fn init_test_logging() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("s3file=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer().without_time())
            .try_init();
    });
}
