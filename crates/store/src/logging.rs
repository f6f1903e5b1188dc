//! File logging for hosts that embed the store.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::paths::DataPaths;

const DEFAULT_FILTER: &str = "info";
const LOG_FILE: &str = "store.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Logger settings read from `CHAMBER_LOG_*` variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub filter: String,
    pub format: LogFormat,
    pub truncate_on_start: bool,
    pub run_id: String,
}

impl LogSettings {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let filter = lookup("CHAMBER_LOG_FILTER")
            .or_else(|| lookup("RUST_LOG"))
            .filter(|value| EnvFilter::try_new(value).is_ok())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let format = match lookup("CHAMBER_LOG_FORMAT") {
            Some(value) if value.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        };
        Self {
            filter,
            format,
            truncate_on_start: lookup("CHAMBER_TRUNCATE_LOG_ON_START").as_deref() == Some("1"),
            run_id: lookup("CHAMBER_RUN_ID").unwrap_or_else(chamber_protocol::new_id),
        }
    }
}

/// Keeps the non-blocking writer alive; drop it last.
pub struct LoggingHandle {
    pub run_id: String,
    pub log_path: PathBuf,
    pub guard: WorkerGuard,
}

/// Install the global subscriber, writing to `<data dir>/logs/store.log`.
pub fn init_logging(paths: &DataPaths) -> anyhow::Result<LoggingHandle> {
    let settings = LogSettings::from_lookup(|key| std::env::var(key).ok());
    let log_dir = paths.log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join(LOG_FILE);

    if settings.truncate_on_start {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)?;
    }

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
        &log_dir, LOG_FILE,
    ));
    let registry = tracing_subscriber::registry().with(EnvFilter::try_new(&settings.filter)?);
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_target(true);
    match settings.format {
        LogFormat::Pretty => registry.with(layer.pretty()).try_init()?,
        LogFormat::Json => registry
            .with(layer.json().flatten_event(true).with_current_span(true))
            .try_init()?,
    }

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %settings.run_id,
        log_path = %log_path.display(),
        format = ?settings.format,
        filter = %settings.filter,
    );

    Ok(LoggingHandle {
        run_id: settings.run_id,
        log_path,
        guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn defaults_to_json_at_info() {
        let settings = LogSettings::from_lookup(lookup(&[]));
        assert_eq!(settings.filter, "info");
        assert_eq!(settings.format, LogFormat::Json);
        assert!(!settings.truncate_on_start);
        assert!(!settings.run_id.is_empty());
    }

    #[test]
    fn store_filter_wins_over_rust_log() {
        let settings = LogSettings::from_lookup(lookup(&[
            ("RUST_LOG", "warn"),
            ("CHAMBER_LOG_FILTER", "chamber_store=debug"),
            ("CHAMBER_LOG_FORMAT", "Pretty"),
            ("CHAMBER_RUN_ID", "run-7"),
        ]));
        assert_eq!(settings.filter, "chamber_store=debug");
        assert_eq!(settings.format, LogFormat::Pretty);
        assert_eq!(settings.run_id, "run-7");
    }

    #[test]
    fn unparsable_filter_falls_back_to_default() {
        let settings = LogSettings::from_lookup(lookup(&[("CHAMBER_LOG_FILTER", "chamber_store=loud")]));
        assert_eq!(settings.filter, "info");
    }
}
