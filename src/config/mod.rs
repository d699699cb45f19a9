//! Configuration layer: typed settings with layered precedence (file → env).

use std::{num::NonZeroUsize, path::Path, str::FromStr, time::Duration};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "leadcache";
const ENV_PREFIX: &str = "LEADCACHE";
const DEFAULT_STALE_TIME_MS: u64 = 0;
const DEFAULT_GC_TIME_MS: u64 = 5 * 60 * 1000;
const DEFAULT_PREFETCH_BATCH_LIMIT: u64 = 32;
const DEFAULT_PREFETCH_CONCURRENCY: u64 = 4;
const DEFAULT_PREFETCH_INTERVAL_MS: u64 = 1000;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub query: QuerySettings,
    pub prefetch: PrefetchSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuerySettings {
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub refetch_on_window_focus: bool,
    pub refetch_on_visibility: bool,
    pub refetch_interval: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchSettings {
    pub batch_limit: NonZeroUsize,
    pub concurrency: NonZeroUsize,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment).
///
/// `config/default.toml` and `leadcache.toml` are optional; `config_file`,
/// when given, must exist. Environment variables use the `LEADCACHE` prefix
/// with `__` between sections, e.g. `LEADCACHE__QUERY__STALE_TIME_MS`.
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            query,
            prefetch,
            logging,
        } = raw;

        let query = build_query_settings(query)?;
        let prefetch = build_prefetch_settings(prefetch)?;
        let logging = build_logging_settings(logging)?;

        Ok(Self {
            query,
            prefetch,
            logging,
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            query: QuerySettings {
                stale_time: Duration::from_millis(DEFAULT_STALE_TIME_MS),
                gc_time: Duration::from_millis(DEFAULT_GC_TIME_MS),
                refetch_on_window_focus: true,
                refetch_on_visibility: true,
                refetch_interval: None,
            },
            prefetch: PrefetchSettings {
                batch_limit: NonZeroUsize::new(DEFAULT_PREFETCH_BATCH_LIMIT as usize)
                    .unwrap_or(NonZeroUsize::MIN),
                concurrency: NonZeroUsize::new(DEFAULT_PREFETCH_CONCURRENCY as usize)
                    .unwrap_or(NonZeroUsize::MIN),
                interval: Duration::from_millis(DEFAULT_PREFETCH_INTERVAL_MS),
            },
            logging: LoggingSettings {
                level: LevelFilter::INFO,
                format: LogFormat::Compact,
            },
        }
    }
}

fn build_query_settings(query: RawQuerySettings) -> Result<QuerySettings, LoadError> {
    let stale_time = Duration::from_millis(query.stale_time_ms.unwrap_or(DEFAULT_STALE_TIME_MS));

    let gc_time_ms = query.gc_time_ms.unwrap_or(DEFAULT_GC_TIME_MS);
    if gc_time_ms == 0 {
        return Err(LoadError::invalid(
            "query.gc_time_ms",
            "must be greater than zero",
        ));
    }

    // Zero keeps polling off, same as leaving the key unset.
    let refetch_interval = query
        .refetch_interval_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis);

    Ok(QuerySettings {
        stale_time,
        gc_time: Duration::from_millis(gc_time_ms),
        refetch_on_window_focus: query.refetch_on_window_focus.unwrap_or(true),
        refetch_on_visibility: query.refetch_on_visibility.unwrap_or(true),
        refetch_interval,
    })
}

fn build_prefetch_settings(prefetch: RawPrefetchSettings) -> Result<PrefetchSettings, LoadError> {
    let batch_limit = non_zero_usize(
        prefetch.batch_limit.unwrap_or(DEFAULT_PREFETCH_BATCH_LIMIT),
        "prefetch.batch_limit",
    )?;
    let concurrency = non_zero_usize(
        prefetch.concurrency.unwrap_or(DEFAULT_PREFETCH_CONCURRENCY),
        "prefetch.concurrency",
    )?;

    let interval_ms = prefetch.interval_ms.unwrap_or(DEFAULT_PREFETCH_INTERVAL_MS);
    if interval_ms == 0 {
        return Err(LoadError::invalid(
            "prefetch.interval_ms",
            "must be greater than zero",
        ));
    }

    Ok(PrefetchSettings {
        batch_limit,
        concurrency,
        interval: Duration::from_millis(interval_ms),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    query: RawQuerySettings,
    prefetch: RawPrefetchSettings,
    logging: RawLoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQuerySettings {
    stale_time_ms: Option<u64>,
    gc_time_ms: Option<u64>,
    refetch_on_window_focus: Option<bool>,
    refetch_on_visibility: Option<bool>,
    refetch_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPrefetchSettings {
    batch_limit: Option<u64>,
    concurrency: Option<u64>,
    interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_usize: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value_usize)
        .ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
