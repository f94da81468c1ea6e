//! Configuration management.
//!
//! Values are resolved in three layers: built-in defaults, an optional TOML
//! file, then `CONCIERGE_*` environment variables.

use crate::cms::CmsConfig;
use crate::knowledge::KnowledgeConfig;
use crate::observability::{LogFormat, LoggingConfig, MetricsConfig, ObservabilityConfig};
use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use crate::session::{DEFAULT_SESSION_TTL, DEFAULT_SWEEP_INTERVAL};
use crate::webhooks::DEFAULT_MAX_AGE;
use crate::{Error, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application directory name under the platform config dir.
const APP_DIR: &str = "concierge-cache";

/// Main configuration for concierge-cache.
#[derive(Debug, Clone)]
pub struct ConciergeConfig {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Upstream CMS connection.
    pub cms: CmsConfig,
    /// Directory holding `<key>.json` snapshots.
    pub snapshot_dir: PathBuf,
    /// Knowledge cache TTL and fetch deadline.
    pub knowledge: KnowledgeConfig,
    /// Defaults for every circuit breaker in the registry.
    pub breaker: CircuitBreakerConfig,
    /// Retry policy for CMS requests.
    pub retry: RetryConfig,
    /// Push endpoint authentication.
    pub webhook: WebhookSettings,
    /// Downstream page-cache revalidation.
    pub revalidate: RevalidateSettings,
    /// Session expiry.
    pub session: SessionSettings,
    /// Logging and metrics.
    pub observability: ObservabilitySettings,
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: SocketAddr,
    /// Name reported by the health endpoint.
    pub service_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 3000)),
            service_name: APP_DIR.to_string(),
        }
    }
}

/// Push endpoint settings.
#[derive(Debug, Clone)]
pub struct WebhookSettings {
    /// Shared HMAC secret. `None` rejects every push with 500.
    pub secret: Option<SecretString>,
    /// Replay window for `x-timestamp`.
    pub max_age: Duration,
    /// Re-fetch every collection after an accepted push.
    pub prewarm: bool,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            secret: None,
            max_age: DEFAULT_MAX_AGE,
            prewarm: true,
        }
    }
}

/// Page-cache revalidation settings. Disabled unless both URL and secret are set.
#[derive(Debug, Clone)]
pub struct RevalidateSettings {
    /// Revalidation endpoint.
    pub url: Option<String>,
    /// Secret sent in the request body.
    pub secret: Option<SecretString>,
    /// Paths to revalidate after a push.
    pub paths: Vec<String>,
    /// Request timeout.
    pub timeout: Duration,
}

impl Default for RevalidateSettings {
    fn default() -> Self {
        Self {
            url: None,
            secret: None,
            paths: vec!["/".to_string()],
            timeout: Duration::from_secs(5),
        }
    }
}

/// Session store settings.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Idle time after which a session is evicted.
    pub ttl: Duration,
    /// How often the sweeper runs.
    pub sweep_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_SESSION_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Logging and metrics settings.
#[derive(Debug, Clone, Default)]
pub struct ObservabilitySettings {
    /// Log output format.
    pub log_format: LogFormat,
    /// Filter directive used when neither `CONCIERGE_LOG` nor `RUST_LOG` is set.
    pub log_filter: Option<String>,
    /// Append logs to this file instead of stderr.
    pub log_file: Option<PathBuf>,
    /// Record metrics.
    pub metrics_enabled: bool,
    /// Prometheus scrape port.
    pub metrics_port: Option<u16>,
}

impl Default for ConciergeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cms: CmsConfig::default(),
            snapshot_dir: PathBuf::from("cms-snapshots"),
            knowledge: KnowledgeConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            webhook: WebhookSettings::default(),
            revalidate: RevalidateSettings::default(),
            session: SessionSettings::default(),
            observability: ObservabilitySettings::default(),
        }
    }
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// `[server]` section.
    pub server: Option<ConfigFileServer>,
    /// `[cms]` section.
    pub cms: Option<ConfigFileCms>,
    /// `[snapshots]` section.
    pub snapshots: Option<ConfigFileSnapshots>,
    /// `[knowledge]` section.
    pub knowledge: Option<ConfigFileKnowledge>,
    /// `[breaker]` section.
    pub breaker: Option<ConfigFileBreaker>,
    /// `[retry]` section.
    pub retry: Option<ConfigFileRetry>,
    /// `[webhook]` section.
    pub webhook: Option<ConfigFileWebhook>,
    /// `[revalidate]` section.
    pub revalidate: Option<ConfigFileRevalidate>,
    /// `[session]` section.
    pub session: Option<ConfigFileSession>,
    /// `[observability]` section.
    pub observability: Option<ConfigFileObservability>,
}

/// `[server]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileServer {
    /// Listen address, e.g. `127.0.0.1:3000`.
    pub bind: Option<String>,
    /// Service name.
    pub service_name: Option<String>,
}

/// `[cms]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileCms {
    /// Base URL.
    pub base_url: Option<String>,
    /// API key.
    pub api_key: Option<String>,
    /// Request timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// `[snapshots]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileSnapshots {
    /// Snapshot directory.
    pub dir: Option<String>,
}

/// `[knowledge]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileKnowledge {
    /// In-memory TTL in seconds.
    pub ttl_secs: Option<u64>,
    /// Aggregation deadline in milliseconds.
    pub fetch_timeout_ms: Option<u64>,
}

/// `[breaker]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileBreaker {
    /// Consecutive failures before opening.
    pub failure_threshold: Option<u32>,
    /// Open duration in milliseconds.
    pub reset_timeout_ms: Option<u64>,
    /// Half-open trial requests.
    pub half_open_requests: Option<u32>,
}

/// `[retry]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileRetry {
    /// Retries after the first attempt.
    pub max_retries: Option<u32>,
    /// Base delay in milliseconds.
    pub base_delay_ms: Option<u64>,
    /// Delay cap in milliseconds.
    pub max_delay_ms: Option<u64>,
}

/// `[webhook]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileWebhook {
    /// Shared HMAC secret.
    pub secret: Option<String>,
    /// Replay window in seconds.
    pub max_age_secs: Option<u64>,
    /// Pre-warm snapshots after a push.
    pub prewarm: Option<bool>,
}

/// `[revalidate]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileRevalidate {
    /// Endpoint URL.
    pub url: Option<String>,
    /// Shared secret.
    pub secret: Option<String>,
    /// Paths to revalidate.
    pub paths: Option<Vec<String>>,
}

/// `[session]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileSession {
    /// Idle TTL in seconds.
    pub ttl_secs: Option<u64>,
    /// Sweep interval in seconds.
    pub sweep_interval_secs: Option<u64>,
}

/// `[observability]` section.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileObservability {
    /// `pretty` or `json`.
    pub log_format: Option<String>,
    /// Filter directive.
    pub log_filter: Option<String>,
    /// Log file path.
    pub log_file: Option<String>,
    /// Enable metrics.
    pub metrics_enabled: Option<bool>,
    /// Prometheus port.
    pub metrics_port: Option<u16>,
}

impl ConciergeConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| Error::operation("read_config_file", e))?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|e| Error::operation("parse_config_file", e))?;
        Self::from_config_file(file)
    }

    /// Loads configuration from the default location.
    ///
    /// Checks the following paths in order:
    /// 1. Platform-specific config dir (`~/Library/Application Support/concierge-cache/` on macOS)
    /// 2. XDG config dir (`~/.config/concierge-cache/` for Unix compatibility)
    ///
    /// Returns default configuration if no readable config file is found.
    #[must_use]
    pub fn load_default() -> Self {
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::default();
        };

        let candidates = [
            base_dirs.config_dir().join(APP_DIR).join("config.toml"),
            base_dirs
                .home_dir()
                .join(".config")
                .join(APP_DIR)
                .join("config.toml"),
        ];

        for path in candidates.iter().filter(|p| p.exists()) {
            match Self::load_from_file(path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable config file");
                },
            }
        }

        Self::default()
    }

    /// Loads from `path` when given, otherwise from the default location,
    /// then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit `path` cannot be loaded.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_default(),
        };
        Ok(config.with_env_overrides())
    }

    fn from_config_file(file: ConfigFile) -> Result<Self> {
        let mut config = Self::default();

        if let Some(server) = file.server {
            if let Some(bind) = server.bind {
                config.server.bind = parse_bind(&bind)?;
            }
            if let Some(name) = server.service_name {
                config.server.service_name = name;
            }
        }
        if let Some(cms) = file.cms {
            config.cms.base_url = non_empty(cms.base_url);
            config.cms.api_key = secret(cms.api_key);
            if let Some(ms) = cms.timeout_ms {
                config.cms.timeout = Duration::from_millis(ms);
            }
        }
        if let Some(dir) = file.snapshots.and_then(|s| s.dir) {
            config.snapshot_dir = PathBuf::from(dir);
        }
        if let Some(knowledge) = file.knowledge {
            if let Some(secs) = knowledge.ttl_secs {
                config.knowledge.ttl = Duration::from_secs(secs);
            }
            if let Some(ms) = knowledge.fetch_timeout_ms {
                config.knowledge.fetch_timeout = Duration::from_millis(ms);
            }
        }
        if let Some(breaker) = file.breaker {
            if let Some(v) = breaker.failure_threshold {
                config.breaker.failure_threshold = v.max(1);
            }
            if let Some(v) = breaker.reset_timeout_ms {
                config.breaker.reset_timeout_ms = v;
            }
            if let Some(v) = breaker.half_open_requests {
                config.breaker.half_open_requests = v.max(1);
            }
        }
        if let Some(retry) = file.retry {
            if let Some(v) = retry.max_retries {
                config.retry.max_retries = v;
            }
            if let Some(v) = retry.base_delay_ms {
                config.retry.base_delay_ms = v;
            }
            if let Some(v) = retry.max_delay_ms {
                config.retry.max_delay_ms = v;
            }
        }
        if let Some(webhook) = file.webhook {
            config.webhook.secret = secret(webhook.secret);
            if let Some(secs) = webhook.max_age_secs {
                config.webhook.max_age = Duration::from_secs(secs);
            }
            if let Some(prewarm) = webhook.prewarm {
                config.webhook.prewarm = prewarm;
            }
        }
        if let Some(revalidate) = file.revalidate {
            config.revalidate.url = non_empty(revalidate.url);
            config.revalidate.secret = secret(revalidate.secret);
            if let Some(paths) = revalidate.paths {
                config.revalidate.paths = paths;
            }
        }
        if let Some(session) = file.session {
            if let Some(secs) = session.ttl_secs {
                config.session.ttl = Duration::from_secs(secs);
            }
            if let Some(secs) = session.sweep_interval_secs {
                config.session.sweep_interval = Duration::from_secs(secs.max(1));
            }
        }
        if let Some(obs) = file.observability {
            if let Some(format) = obs.log_format {
                config.observability.log_format = format.parse()?;
            }
            config.observability.log_filter = obs.log_filter;
            config.observability.log_file = obs.log_file.map(PathBuf::from);
            if let Some(enabled) = obs.metrics_enabled {
                config.observability.metrics_enabled = enabled;
            }
            config.observability.metrics_port = obs.metrics_port;
        }

        Ok(config)
    }

    /// Applies `CONCIERGE_*` environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_overrides(&|key| std::env::var(key).ok());
        self
    }

    /// Applies overrides read through `lookup`. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CONCIERGE_BIND") {
            if let Ok(bind) = parse_bind(&v) {
                self.server.bind = bind;
            }
        }
        if let Some(v) = lookup("CONCIERGE_CMS_URL") {
            self.cms.base_url = non_empty(Some(v));
        }
        if let Some(v) = lookup("CONCIERGE_CMS_API_KEY") {
            self.cms.api_key = secret(Some(v));
        }
        if let Some(v) = lookup("CONCIERGE_CMS_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                self.cms.timeout = Duration::from_millis(ms);
            }
        }
        if let Some(v) = lookup("CONCIERGE_SNAPSHOT_DIR") {
            if !v.is_empty() {
                self.snapshot_dir = PathBuf::from(v);
            }
        }
        if let Some(v) = lookup("CONCIERGE_PUSH_SECRET") {
            self.webhook.secret = secret(Some(v));
        }
        if let Some(v) = lookup("CONCIERGE_REVALIDATE_URL") {
            self.revalidate.url = non_empty(Some(v));
        }
        if let Some(v) = lookup("CONCIERGE_REVALIDATE_SECRET") {
            self.revalidate.secret = secret(Some(v));
        }
        if let Some(v) = parsed::<u32>(lookup, "CONCIERGE_BREAKER_FAILURE_THRESHOLD") {
            self.breaker.failure_threshold = v.max(1);
        }
        if let Some(v) = parsed::<u64>(lookup, "CONCIERGE_BREAKER_RESET_MS") {
            self.breaker.reset_timeout_ms = v;
        }
        if let Some(v) = parsed::<u32>(lookup, "CONCIERGE_BREAKER_HALF_OPEN_REQUESTS") {
            self.breaker.half_open_requests = v.max(1);
        }
        if let Some(v) = parsed::<u32>(lookup, "CONCIERGE_RETRY_MAX_RETRIES") {
            self.retry.max_retries = v;
        }
        if let Some(v) = parsed::<u64>(lookup, "CONCIERGE_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = v;
        }
        if let Some(v) = parsed::<u64>(lookup, "CONCIERGE_RETRY_MAX_DELAY_MS") {
            self.retry.max_delay_ms = v;
        }
        if let Some(v) = lookup("CONCIERGE_LOG_FORMAT") {
            if let Ok(format) = v.parse() {
                self.observability.log_format = format;
            }
        }
        if let Some(v) = lookup("CONCIERGE_METRICS_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.observability.metrics_enabled = true;
                self.observability.metrics_port = Some(port);
            }
        }
    }

    /// Builds the observability configuration for this process.
    #[must_use]
    pub fn observability_config(&self, verbose: bool, metrics_expose: bool) -> ObservabilityConfig {
        let obs = &self.observability;
        let metrics = obs.metrics_port.map_or_else(
            || MetricsConfig {
                enabled: obs.metrics_enabled,
                ..MetricsConfig::default()
            },
            |port| MetricsConfig::new(obs.metrics_enabled, port),
        );

        ObservabilityConfig {
            logging: LoggingConfig::new(
                obs.log_format,
                obs.log_filter.as_deref(),
                obs.log_file.clone(),
                verbose,
            ),
            metrics,
            metrics_expose: metrics_expose && obs.metrics_port.is_some(),
        }
    }

    /// Returns `true` if page revalidation is configured.
    #[must_use]
    pub fn revalidation_enabled(&self) -> bool {
        self.revalidate.url.is_some() && self.revalidate.secret.is_some()
    }
}

fn parse_bind(value: &str) -> Result<SocketAddr> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidInput(format!("invalid bind address: {value}")))
}

fn parsed<T: std::str::FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn secret(value: Option<String>) -> Option<SecretString> {
    non_empty(value).map(SecretString::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ConciergeConfig::new();
        assert_eq!(config.server.bind.port(), 3000);
        assert_eq!(config.snapshot_dir, PathBuf::from("cms-snapshots"));
        assert_eq!(config.knowledge.ttl, Duration::from_secs(3600));
        assert_eq!(config.session.ttl, Duration::from_secs(7200));
        assert_eq!(config.webhook.max_age, Duration::from_secs(300));
        assert!(config.webhook.secret.is_none());
        assert!(!config.revalidation_enabled());
    }

    #[test]
    fn test_from_toml() {
        let config = ConciergeConfig::from_toml(
            r#"
            [server]
            bind = "127.0.0.1:8080"

            [cms]
            base_url = "https://cms.example.com"
            api_key = "key"
            timeout_ms = 2500

            [snapshots]
            dir = "/var/lib/concierge"

            [knowledge]
            ttl_secs = 60

            [breaker]
            failure_threshold = 3
            reset_timeout_ms = 10000

            [webhook]
            secret = "push"
            max_age_secs = 120
            prewarm = false

            [revalidate]
            url = "https://site.example.com/api/revalidate"
            secret = "reval"
            paths = ["/", "/events"]

            [observability]
            log_format = "json"
            metrics_enabled = true
            metrics_port = 9100
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind.to_string(), "127.0.0.1:8080");
        assert_eq!(config.cms.base_url.as_deref(), Some("https://cms.example.com"));
        assert_eq!(config.cms.api_key.unwrap().expose_secret(), "key");
        assert_eq!(config.cms.timeout, Duration::from_millis(2500));
        assert_eq!(config.snapshot_dir, PathBuf::from("/var/lib/concierge"));
        assert_eq!(config.knowledge.ttl, Duration::from_secs(60));
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.reset_timeout_ms, 10_000);
        assert_eq!(config.webhook.max_age, Duration::from_secs(120));
        assert!(!config.webhook.prewarm);
        assert_eq!(config.revalidate.paths, vec!["/", "/events"]);
        assert_eq!(config.observability.log_format, LogFormat::Json);
        assert_eq!(config.observability.metrics_port, Some(9100));
    }

    #[test]
    fn test_empty_secret_is_unset() {
        let config = ConciergeConfig::from_toml("[webhook]\nsecret = \"\"\n").unwrap();
        assert!(config.webhook.secret.is_none());
    }

    #[test]
    fn test_invalid_bind_rejected() {
        let result = ConciergeConfig::from_toml("[server]\nbind = \"not-an-address\"\n");
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let result = ConciergeConfig::from_toml("[server\n");
        assert!(matches!(result, Err(Error::OperationFailed { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConciergeConfig::new();
        config.apply_overrides(&lookup(&[
            ("CONCIERGE_BIND", "127.0.0.1:4000"),
            ("CONCIERGE_CMS_URL", "http://localhost:9000"),
            ("CONCIERGE_CMS_API_KEY", "abc"),
            ("CONCIERGE_PUSH_SECRET", "s3cret"),
            ("CONCIERGE_SNAPSHOT_DIR", "/tmp/snaps"),
            ("CONCIERGE_METRICS_PORT", "9200"),
        ]));

        assert_eq!(config.server.bind.port(), 4000);
        assert_eq!(config.cms.base_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.webhook.secret.unwrap().expose_secret(), "s3cret");
        assert_eq!(config.snapshot_dir, PathBuf::from("/tmp/snaps"));
        assert!(config.observability.metrics_enabled);
    }

    #[test]
    fn test_unparseable_env_values_ignored() {
        let mut config = ConciergeConfig::new();
        config.apply_overrides(&lookup(&[
            ("CONCIERGE_BIND", "nope"),
            ("CONCIERGE_CMS_TIMEOUT_MS", "soon"),
        ]));
        assert_eq!(config.server.bind.port(), 3000);
        assert_eq!(config.cms.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_resilience_env_overrides() {
        let mut config = ConciergeConfig::new();
        config.apply_overrides(&lookup(&[
            ("CONCIERGE_BREAKER_FAILURE_THRESHOLD", "0"),
            ("CONCIERGE_BREAKER_RESET_MS", "5000"),
            ("CONCIERGE_BREAKER_HALF_OPEN_REQUESTS", "2"),
            ("CONCIERGE_RETRY_MAX_RETRIES", "1"),
            ("CONCIERGE_RETRY_BASE_DELAY_MS", "250"),
            ("CONCIERGE_RETRY_MAX_DELAY_MS", "many"),
        ]));

        assert_eq!(config.breaker.failure_threshold, 1);
        assert_eq!(config.breaker.reset_timeout_ms, 5_000);
        assert_eq!(config.breaker.half_open_requests, 2);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.retry.max_delay_ms, 30_000);
    }

    #[test]
    fn test_load_from_missing_file() {
        let result = ConciergeConfig::load_from_file(Path::new("/nonexistent/config.toml"));
        assert!(result.is_err());
    }
}
