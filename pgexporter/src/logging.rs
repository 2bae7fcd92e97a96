//! Logging subsystem: a `tracing` subscriber driven by the configuration,
//! plus the severity counters surfaced as `pgexporter_logging_*` metrics.

use std::fs::OpenOptions;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, Layer, Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Registry;

use crate::config::{Config, LogLevel, LogMode, LogType};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("cannot open log file: {0}")]
    Io(#[from] std::io::Error),
    #[error("log_type = file requires log_path")]
    MissingLogPath,
    #[error("logging already initialized")]
    AlreadyInitialized,
}

/// Severity counters incremented by every log statement.
#[derive(Debug, Default)]
pub struct LogCounters {
    pub info: AtomicU64,
    pub warn: AtomicU64,
    pub error: AtomicU64,
    pub fatal: AtomicU64,
}

impl LogCounters {
    pub fn info(&self) -> u64 {
        self.info.load(Ordering::Relaxed)
    }

    pub fn warn(&self) -> u64 {
        self.warn.load(Ordering::Relaxed)
    }

    pub fn error(&self) -> u64 {
        self.error.load(Ordering::Relaxed)
    }

    pub fn fatal(&self) -> u64 {
        self.fatal.load(Ordering::Relaxed)
    }

    /// Startup failures are counted here before the process exits non-zero.
    pub fn record_fatal(&self) {
        self.fatal.fetch_add(1, Ordering::Relaxed);
    }
}

/// Layer that counts events by severity.
pub struct CountingLayer {
    counters: Arc<LogCounters>,
}

impl CountingLayer {
    pub fn new(counters: Arc<LogCounters>) -> Self {
        CountingLayer { counters }
    }
}

impl<S: Subscriber> Layer<S> for CountingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        match *event.metadata().level() {
            Level::INFO => {
                self.counters.info.fetch_add(1, Ordering::Relaxed);
            }
            Level::WARN => {
                self.counters.warn.fetch_add(1, Ordering::Relaxed);
            }
            Level::ERROR => {
                self.counters.error.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Debug5 | LogLevel::Debug4 | LogLevel::Debug3 | LogLevel::Debug2 => {
            LevelFilter::TRACE
        }
        LogLevel::Debug1 => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error | LogLevel::Fatal => LevelFilter::ERROR,
    }
}

/// Installs the global subscriber per `log_type` / `log_level` / `log_path`.
pub fn init(config: &Config, counters: Arc<LogCounters>) -> Result<(), LoggingError> {
    let filter = level_filter(config.log_level);
    let counting = CountingLayer::new(counters);

    let fmt_layer: Box<dyn Layer<Layered<CountingLayer, Layered<LevelFilter, Registry>>> + Send + Sync> = match config.log_type {
        LogType::Console | LogType::Syslog => {
            tracing_subscriber::fmt::layer().with_ansi(true).boxed()
        }
        LogType::File => {
            let path = config.log_path.as_ref().ok_or(LoggingError::MissingLogPath)?;
            let file = match config.log_mode {
                LogMode::Append => OpenOptions::new().create(true).append(true).open(path)?,
                LogMode::Create => OpenOptions::new().create(true).write(true).truncate(true).open(path)?,
            };
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(counting)
        .with(fmt_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    if config.log_type == LogType::Syslog {
        tracing::warn!("log_type = syslog is not supported, logging to console instead");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::subscriber::with_default;

    #[test]
    fn counting_layer_tracks_severities() {
        let counters = Arc::new(LogCounters::default());
        let subscriber =
            tracing_subscriber::registry().with(CountingLayer::new(counters.clone()));

        with_default(subscriber, || {
            tracing::info!("one");
            tracing::info!("two");
            tracing::warn!("three");
            tracing::error!("four");
            tracing::debug!("not counted");
        });

        assert_eq!(counters.info(), 2);
        assert_eq!(counters.warn(), 1);
        assert_eq!(counters.error(), 1);
        assert_eq!(counters.fatal(), 0);
    }
}
