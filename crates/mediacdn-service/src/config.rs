//! The YAML configuration shared by the `edge` and `origin` commands.
//!
//! Every field has a default, so a file only needs to contain what differs. Durations use
//! humantime notation such as `5s` or `1h`.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sentry::types::Dsn;
use serde::Deserialize;
use url::Url;

const DEFAULT_ORIGIN_URL: &str = "http://127.0.0.1:8081/origin";

/// Verbosity of the node's own logs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// How log lines are rendered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `pretty` when attached to a terminal, `simplified` otherwise.
    Auto,
    Pretty,
    /// One compact line per event, without colors.
    Simplified,
    /// JSON lines.
    Json,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// Seeds `RUST_LOG` unless that is already set.
    pub level: LogLevel,
    pub format: LogFormat,
    /// Forces `RUST_BACKTRACE=1`.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of the statsd server, defaults to `$STATSD_SERVER`.
    pub statsd: Option<String>,
    pub prefix: String,
    /// Tags sent along with every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "mediacdn".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Configuration of the caching edge node.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Host and port to bind the edge webserver to.
    pub bind: String,

    /// The base directory of the object store.
    ///
    /// Objects are laid out as `cache_dir/series/type/filename`. Staging files for atomic
    /// writes live in `cache_dir/.tmp`.
    pub cache_dir: PathBuf,

    /// Base URL of the origin, e.g. `http://127.0.0.1:8081/origin`.
    pub origin_url: Url,

    /// The timeout for establishing a connection to the origin.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The upper limit for one complete request to the origin, including the body.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// The freshness window advertised to clients via `Cache-Control: max-age`.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,

    /// Upper bound for the total size (in bytes) of all stored objects.
    ///
    /// When exceeded, the least recently used objects are evicted. A value of `None` means the
    /// store grows without bound.
    pub max_cache_size: Option<u64>,

    /// Whether concurrent misses for the same key share one origin fetch.
    pub deduplicate_fetches: bool,

    /// Fail requests whose freshly fetched object could not be written to the store.
    ///
    /// By default such failures are only logged, and the fetched bytes are served anyway.
    pub strict_cache_writes: bool,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_owned(),
            cache_dir: PathBuf::from("cache"),
            origin_url: default_origin_url(),
            connect_timeout: Duration::from_secs(5),
            max_download_timeout: Duration::from_secs(60),
            max_age: Duration::from_secs(3600),
            max_cache_size: None,
            deduplicate_fetches: true,
            strict_cache_writes: false,
        }
    }
}

/// Configuration of the origin file server.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Host and port to bind the origin webserver to.
    pub bind: String,

    /// The directory tree that is served, laid out as `content_dir/series/type/filename`.
    pub content_dir: PathBuf,

    /// The freshness window advertised via `Cache-Control: max-age`.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8081".to_owned(),
            content_dir: PathBuf::from("content"),
            max_age: Duration::from_secs(3600),
        }
    }
}

/// Root of the configuration file.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub logging: Logging,

    /// Statsd reporting, off unless `statsd` is set.
    pub metrics: Metrics,

    /// Where internal errors are reported to, if anywhere.
    pub sentry_dsn: Option<Dsn>,

    pub edge: EdgeConfig,

    pub origin: OriginConfig,
}

impl Config {
    /// Loads the configuration from `path`, or the defaults if no path is given.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        Self::from_yaml(&yaml)
    }

    fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            bail!("config file empty");
        }
        let config: Self = serde_yaml::from_str(yaml).context("failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.edge.origin_url.cannot_be_a_base() {
            bail!("`edge.origin_url` must be an http(s) URL");
        }
        if self.edge.max_cache_size == Some(0) {
            bail!("`edge.max_cache_size` must be positive, omit it to disable eviction");
        }
        Ok(())
    }
}

fn default_origin_url() -> Url {
    match Url::parse(DEFAULT_ORIGIN_URL) {
        Ok(url) => url,
        Err(_) => unreachable!("the default origin URL is valid"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.edge.bind, "127.0.0.1:8080");
        assert_eq!(cfg.origin.bind, "127.0.0.1:8081");
        assert_eq!(cfg.edge.max_age, Duration::from_secs(3600));
        assert_eq!(cfg.edge.max_cache_size, None);
        assert!(cfg.edge.deduplicate_fetches);
        assert!(!cfg.edge.strict_cache_writes);
    }

    #[test]
    fn test_partial_edge_config() {
        // Setting individual values should not affect the other defaults.
        let yaml = r#"
            edge:
              cache_dir: /var/cache/mediacdn
              max_download_timeout: 10s
              max_cache_size: 1048576
        "#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(cfg.edge.cache_dir, PathBuf::from("/var/cache/mediacdn"));
        assert_eq!(cfg.edge.max_download_timeout, Duration::from_secs(10));
        assert_eq!(cfg.edge.connect_timeout, Duration::from_secs(5));
        assert_eq!(cfg.edge.max_cache_size, Some(1024 * 1024));
        assert_eq!(cfg.origin.content_dir, PathBuf::from("content"));
    }

    #[test]
    fn test_origin_url() {
        let yaml = r#"
            edge:
              origin_url: http://origin.internal:9000/origin
        "#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(cfg.edge.origin_url.host_str(), Some("origin.internal"));
        assert_eq!(cfg.edge.origin_url.port(), Some(9000));
    }

    #[test]
    fn test_logging_level() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(cfg.logging.level, LogLevel::Debug);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid() {
        assert!(Config::from_yaml("  \n").is_err());
        assert!(Config::from_yaml("edge:\n  max_cache_size: 0\n").is_err());
        assert!(Config::from_yaml("edge:\n  origin_url: \"mailto:ops@example.com\"\n").is_err());
        assert!(Config::from_yaml("edge:\n  max_age: soon\n").is_err());
    }
}
