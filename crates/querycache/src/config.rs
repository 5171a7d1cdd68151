//! YAML configuration for a [`QueryClient`](crate::QueryClient) and its ambient services.
//!
//! Every section is optional. Missing sections and fields fall back to their defaults, and
//! unknown fields are ignored.
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use std::{env, fs, io};

use anyhow::{Context, Result, bail};
use sentry::types::Dsn;
use serde::de::{self, Unexpected};
use serde::{Deserialize, Deserializer};
use tracing::level_filters::LevelFilter;

use crate::options::QueryDefaultsConfig;

/// How log lines are rendered.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `pretty` on an interactive terminal, `simplified` otherwise.
    #[default]
    Auto,
    /// Multi-line and colored.
    Pretty,
    /// One compact line per event, no colors.
    Simplified,
    /// One JSON object per line.
    Json,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// Used when `RUST_LOG` is not set.
    #[serde(deserialize_with = "level_filter")]
    pub level: LevelFilter,
    pub format: LogFormat,
    /// Sets `RUST_BACKTRACE=1` during logging setup.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::default(),
            enable_backtraces: true,
        }
    }
}

/// Where and how statsd metrics are sent.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of the statsd server. Read from `STATSD_SERVER` when absent.
    pub statsd: Option<String>,
    pub prefix: String,
    /// Attached to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        let statsd = env::var("STATSD_SERVER").ok().filter(|host| !host.is_empty());
        Self {
            statsd,
            prefix: String::from("querycache"),
            custom_tags: Default::default(),
        }
    }
}

/// Settings of the collector a client mounts on creation.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct GcConfig {
    pub enabled: bool,
    /// Pause between two sweeps.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: Logging,
    pub metrics: Metrics,
    /// Escalated query errors are sent here.
    pub sentry_dsn: Option<Dsn>,
    /// Client-wide defaults that per-query options are merged over.
    pub queries: QueryDefaultsConfig,
    pub gc: GcConfig,
}

impl Config {
    /// Loads the file at `path`, or the defaults if there is none.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let file = fs::File::open(path)
            .with_context(|| format!("cannot open config file {}", path.display()))?;
        Self::from_reader(file)
    }

    /// Parses YAML from `reader`. An empty or whitespace-only document is an error.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let yaml = io::read_to_string(reader).context("cannot read config")?;
        if yaml.trim().is_empty() {
            bail!("config is empty");
        }
        serde_yaml::from_str(&yaml).context("invalid config YAML")
    }
}

fn level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(|_| {
        de::Error::invalid_value(
            Unexpected::Str(&raw),
            &"one of off, error, warn, info, debug or trace",
        )
    })
}
