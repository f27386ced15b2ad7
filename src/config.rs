//! Configuration management for Ratewarden.
//!
//! Configuration is layered with the `config` crate: built-in defaults, an
//! optional file (YAML, TOML or JSON) and `RATEWARDEN__*` environment
//! overrides. Everything is validated once at startup; an invalid
//! configuration is fatal.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateLimitError, Result};
use crate::ratelimit::RuleConfig;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Header carrying an explicit client id.
pub const DEFAULT_CLIENT_ID_HEADER: &str = "X-Client-Id";

/// Upper bound on a single storage call.
pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_millis(250);

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitOptions,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which counter store backs the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local concurrent map. Quotas are per instance.
    #[default]
    Memory,
    /// Shared Redis instance. Quotas are shared by every instance.
    Redis,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitOptions {
    /// Named rules, evaluated in declaration order
    #[serde(default = "default_rules")]
    pub rules: IndexMap<String, RuleConfig>,

    /// Rule applied when no other rule matches
    #[serde(default = "default_rule_name")]
    pub default_rule: String,

    #[serde(default = "default_true")]
    pub enable_ip_whitelist: bool,

    #[serde(default)]
    pub ip_whitelist: Vec<String>,

    /// Header carrying an explicit client identifier
    #[serde(default = "default_client_id_header")]
    pub client_id_header: String,

    /// Path fragments that are never rate limited
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,

    #[serde(default)]
    pub storage: StorageBackend,

    /// Redis connection string, required when `storage` is `redis`
    #[serde(default)]
    pub redis_url: String,

    #[serde(default = "default_redis_key_prefix")]
    pub redis_key_prefix: String,

    /// Upper bound on a single storage round-trip
    #[serde(default = "default_storage_timeout", with = "duration_format")]
    pub storage_timeout: Duration,

    /// How long an idle counter is kept before the sweep removes it
    #[serde(default = "default_retention", with = "duration_format")]
    pub retention: Duration,

    #[serde(default = "default_sweep_interval", with = "duration_format")]
    pub sweep_interval: Duration,

    /// Events kept per client by the monitoring log
    #[serde(default = "default_max_events_per_client")]
    pub max_events_per_client: usize,

    #[serde(default = "default_stats_retention", with = "duration_format")]
    pub stats_retention: Duration,

    #[serde(default = "default_stats_trim_interval", with = "duration_format")]
    pub stats_trim_interval: Duration,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            default_rule: default_rule_name(),
            enable_ip_whitelist: true,
            ip_whitelist: Vec::new(),
            client_id_header: default_client_id_header(),
            exempt_paths: default_exempt_paths(),
            storage: StorageBackend::default(),
            redis_url: String::new(),
            redis_key_prefix: default_redis_key_prefix(),
            storage_timeout: default_storage_timeout(),
            retention: default_retention(),
            sweep_interval: default_sweep_interval(),
            max_events_per_client: default_max_events_per_client(),
            stats_retention: default_stats_retention(),
            stats_trim_interval: default_stats_trim_interval(),
        }
    }
}

fn default_rules() -> IndexMap<String, RuleConfig> {
    let minute = Duration::from_secs(60);
    let mut rules = IndexMap::new();
    rules.insert(
        "auth".to_string(),
        RuleConfig::new(100, minute).with_endpoints(["/api/v1/auth"]),
    );
    rules.insert(
        "upload".to_string(),
        RuleConfig::new(200, minute)
            .with_endpoints(["/api/v1/images"])
            .with_methods(["POST"]),
    );
    rules.insert(
        "delete-operations".to_string(),
        RuleConfig::new(50, minute).with_methods(["DELETE"]),
    );
    rules.insert(
        "critical-delete".to_string(),
        RuleConfig::new(20, Duration::from_secs(300)).with_methods(["DELETE"]),
    );
    // Unscoped, so it must come last or it shadows every rule after it.
    rules.insert("default".to_string(), RuleConfig::new(2000, minute));
    rules
}

fn default_rule_name() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_client_id_header() -> String {
    DEFAULT_CLIENT_ID_HEADER.to_string()
}

fn default_exempt_paths() -> Vec<String> {
    vec!["/health".to_string(), "/swagger".to_string(), "/files".to_string()]
}

fn default_redis_key_prefix() -> String {
    "ratelimit:".to_string()
}

fn default_storage_timeout() -> Duration {
    DEFAULT_STORAGE_TIMEOUT
}

fn default_retention() -> Duration {
    Duration::from_secs(2 * 3600)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_max_events_per_client() -> usize {
    1000
}

fn default_stats_retention() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_stats_trim_interval() -> Duration {
    Duration::from_secs(600)
}

impl RateLimitOptions {
    /// Check the options for anything that would leave the limiter with
    /// undefined behavior.
    pub fn validate(&self) -> Result<()> {
        if self.rules.is_empty() {
            return Err(RateLimitError::Config(
                "at least one rate limit rule must be configured".to_string(),
            ));
        }

        if !self.rules.contains_key(&self.default_rule) {
            return Err(RateLimitError::Config(format!(
                "default rule '{}' is not defined",
                self.default_rule
            )));
        }

        for (name, rule) in &self.rules {
            rule.validate(name)?;
        }

        if self.client_id_header.trim().is_empty() {
            return Err(RateLimitError::Config(
                "client_id_header must not be empty".to_string(),
            ));
        }

        for entry in &self.ip_whitelist {
            if !entry.eq_ignore_ascii_case("localhost") && entry.parse::<IpAddr>().is_err() {
                return Err(RateLimitError::Config(format!(
                    "invalid whitelist address '{}'",
                    entry
                )));
            }
        }

        if self.storage == StorageBackend::Redis && self.redis_url.trim().is_empty() {
            return Err(RateLimitError::Config(
                "redis_url is required when storage is 'redis'".to_string(),
            ));
        }

        if self.storage_timeout.is_zero() {
            return Err(RateLimitError::Config("storage_timeout must be positive".to_string()));
        }
        if self.sweep_interval.is_zero() || self.stats_trim_interval.is_zero() {
            return Err(RateLimitError::Config(
                "sweep and trim intervals must be positive".to_string(),
            ));
        }
        if self.max_events_per_client == 0 {
            return Err(RateLimitError::Config(
                "max_events_per_client must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Retention actually applied to idle counters.
    ///
    /// Never shorter than two of the longest rule windows, so a counter that
    /// still belongs to a live window is never swept.
    pub fn effective_retention(&self) -> Duration {
        let longest = self
            .rules
            .values()
            .map(|rule| rule.period)
            .max()
            .unwrap_or(Duration::ZERO);
        self.retention.max(longest.saturating_mul(2))
    }
}

impl AppConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.rate_limit.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.rate_limit.validate()?;
        Ok(config)
    }
}

/// Human-friendly durations: `250ms`, `30s`, `5m`, `2h`, `1d`, or a bare
/// number of seconds.
pub mod duration_format {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a duration such as \"30s\", \"5m\" or a number of seconds")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom(format!("negative duration: {v}")))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            parse(v).map_err(E::custom)
        }
    }

    /// Parse a duration with an optional unit suffix.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("duration cannot be empty".to_string());
        }

        let (num, unit) = if let Some(n) = s.strip_suffix("ms") {
            (n, "ms")
        } else if let Some(n) = s.strip_suffix('s') {
            (n, "s")
        } else if let Some(n) = s.strip_suffix('m') {
            (n, "m")
        } else if let Some(n) = s.strip_suffix('h') {
            (n, "h")
        } else if let Some(n) = s.strip_suffix('d') {
            (n, "d")
        } else {
            (s, "s")
        };

        let value: u64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration: {s}"))?;

        let millis = match unit {
            "ms" => Some(value),
            "s" => value.checked_mul(1000),
            "m" => value.checked_mul(60 * 1000),
            "h" => value.checked_mul(60 * 60 * 1000),
            _ => value.checked_mul(24 * 60 * 60 * 1000),
        }
        .ok_or_else(|| format!("duration out of range: {s}"))?;

        Ok(Duration::from_millis(millis))
    }

    /// Render a duration in the largest unit that represents it exactly.
    pub fn format(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis == 0 {
            return "0s".to_string();
        }
        if millis % 1000 != 0 {
            return format!("{millis}ms");
        }
        let secs = millis / 1000;
        if secs % 86_400 == 0 {
            format!("{}d", secs / 86_400)
        } else if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }
}
