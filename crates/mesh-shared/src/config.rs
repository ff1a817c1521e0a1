//! Configuration management using environment variables
//!
//! Everything is read once at startup. Static rule sets (ban list, topic
//! allow-list, error suppression list) live here so they can be injected into
//! the components that use them instead of being process-wide globals.

use crate::error::{Error, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Node ids that are always rejected
pub const DEFAULT_BANNED_IDS: [u32; 4] = [4_184_512_284, 220_300, 7, 4];

/// Valid node ids have at least six decimal digits
pub const DEFAULT_MIN_VALID_ID: u32 = 100_000;

/// Event name of store-and-forward traffic
pub const STORE_FORWARD_MARKER: &str = "onStoreForwardPacket";

/// Maximum number of entries kept per metric series
pub const DEFAULT_SERIES_MAX_LEN: usize = 200;

/// Wildcard subscriptions covering regional topic depths of zero to three
pub const DEFAULT_SUBSCRIBE_TOPICS: [&str; 8] = [
    "msh/+/2/map/",
    "msh/+/2/e/+/+",
    "msh/+/+/2/map/",
    "msh/+/+/2/e/+/+",
    "msh/+/+/+/2/map/",
    "msh/+/+/+/2/e/+/+",
    "msh/+/+/+/+/2/map/",
    "msh/+/+/+/+/2/e/+/+",
];

/// Decode error fragments that are expected on a busy mesh and never logged
pub const DEFAULT_SUPPRESSED_ERRORS: [&str; 7] = [
    "NO_RESPONSE",
    "TIMEOUT",
    "MAX_RETRANSMIT",
    "NO_ROUTE",
    "GOT_NAK",
    "NO_CHANNEL",
    "DUTY_CYCLE_LIMIT",
];

/// Application configuration
#[derive(Debug)]
pub struct Config {
    /// Redis configuration
    pub redis: RedisConfig,

    /// Which keyed store backend to use
    pub store: StoreBackend,

    /// Inbound endpoints
    pub endpoints: Vec<EndpointConfig>,

    /// Classification rule set
    pub classifier: ClassifierRules,

    /// Maximum entries per metric series
    pub series_max_len: usize,

    /// Message correlation settings
    pub correlation: CorrelationSettings,

    /// Telegram delivery settings
    pub telegram: TelegramConfig,

    /// Adapter transport settings
    pub adapter: AdapterSettings,
}

/// Redis configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis host
    pub host: String,

    /// Redis port
    pub port: u16,

    /// Redis password (optional)
    pub password: Option<String>,

    /// Direct Redis URL (takes precedence over host/port/password)
    /// Supports both `redis://` and `rediss://` (TLS) schemes
    pub url: Option<String>,
}

impl RedisConfig {
    /// Build a Redis connection URL
    ///
    /// If `url` is set (from REDIS_URL env var), uses that directly.
    /// Otherwise, builds URL from host/port/password components.
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        if let Some(password) = &self.password {
            format!("redis://:{}@{}:{}", password, self.host, self.port)
        } else {
            format!("redis://{}:{}", self.host, self.port)
        }
    }
}

/// Keyed store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    /// Process-local store, state is lost on restart
    Memory,
}

impl FromStr for StoreBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(Error::config(format!("Invalid STORE_BACKEND: {}", other))),
        }
    }
}

/// Kind of inbound endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointKind {
    /// MQTT broker with wildcard topic subscriptions
    TopicSubscribe,
    /// HTTP API of a single node, polled for radio frames
    DirectFeed,
}

/// One labeled inbound endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Label stored as the node's `server` field
    pub name: String,

    /// `mqtt://host:port` for topic-subscribe, `http(s)://host` for direct-feed
    pub address: String,

    pub kind: EndpointKind,

    /// Whether messages from this endpoint may produce notifications
    #[serde(default, alias = "telegram")]
    pub notify: bool,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

/// Rule set used by the event classifier
#[derive(Debug, Clone)]
pub struct ClassifierRules {
    pub banned_ids: HashSet<u32>,
    pub min_valid_id: u32,
    pub store_forward_marker: String,
}

impl Default for ClassifierRules {
    fn default() -> Self {
        Self {
            banned_ids: DEFAULT_BANNED_IDS.into_iter().collect(),
            min_valid_id: DEFAULT_MIN_VALID_ID,
            store_forward_marker: STORE_FORWARD_MARKER.to_string(),
        }
    }
}

/// Settings of the message correlation window
#[derive(Debug, Clone)]
pub struct CorrelationSettings {
    /// Debounce interval, re-armed on every new receipt
    pub window: Duration,

    /// How often the receipt dedup guard is cleared in bulk
    pub dedup_clear_interval: Duration,

    /// Full-topic prefixes whose messages may be notified
    pub allowed_topic_prefixes: Vec<String>,

    /// Senders whose messages are never notified
    pub denied_senders: HashSet<u32>,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(7_000),
            dedup_clear_interval: Duration::from_secs(600),
            allowed_topic_prefixes: vec!["msh/msk".to_string()],
            denied_senders: HashSet::new(),
        }
    }
}

/// Telegram delivery configuration
#[derive(Debug, Default)]
pub struct TelegramConfig {
    pub enabled: bool,

    pub bot_token: Option<SecretString>,

    /// Numeric chat id or `@channel` username
    pub channel_id: Option<String>,

    /// Bot username used to build `?start=` deep links
    pub bot_username: Option<String>,
}

impl TelegramConfig {
    /// Delivery is only attempted when enabled and fully configured
    pub fn is_active(&self) -> bool {
        self.enabled && self.bot_token.is_some() && self.channel_id.is_some()
    }
}

/// Transport settings shared by all source adapters
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    /// Consecutive failed connection attempts before an adapter gives up
    pub max_retry_attempts: u32,

    /// Fixed delay between connection attempts
    pub retry_delay: Duration,

    /// MQTT keep-alive interval
    pub keep_alive: Duration,

    /// Topic filters for topic-subscribe endpoints
    pub subscribe_topics: Vec<String>,

    /// Idle delay between direct-feed polls
    pub poll_interval: Duration,

    /// Decode error fragments that are not logged
    pub suppressed_errors: Vec<String>,

    /// Capacity of the envelope channel between adapters and the pipeline
    pub channel_capacity: usize,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            max_retry_attempts: 5,
            retry_delay: Duration::from_secs(5),
            keep_alive: Duration::from_secs(30),
            subscribe_topics: DEFAULT_SUBSCRIBE_TOPICS.iter().map(|t| t.to_string()).collect(),
            poll_interval: Duration::from_millis(3_000),
            suppressed_errors: DEFAULT_SUPPRESSED_ERRORS
                .iter()
                .map(|e| e.to_string())
                .collect(),
            channel_capacity: 1_024,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoints = Self::load_endpoints(&lookup)?;

        let classifier_defaults = ClassifierRules::default();
        let correlation_defaults = CorrelationSettings::default();
        let adapter_defaults = AdapterSettings::default();

        let classifier = ClassifierRules {
            banned_ids: match lookup("CLASSIFIER_BANNED_IDS") {
                Some(raw) => parse_list(&raw, "CLASSIFIER_BANNED_IDS")?.into_iter().collect(),
                None => classifier_defaults.banned_ids,
            },
            min_valid_id: parse_var(&lookup, "CLASSIFIER_MIN_VALID_ID", DEFAULT_MIN_VALID_ID)?,
            store_forward_marker: classifier_defaults.store_forward_marker,
        };

        let correlation = CorrelationSettings {
            window: Duration::from_millis(parse_var(
                &lookup,
                "CORRELATION_WINDOW_MS",
                correlation_defaults.window.as_millis() as u64,
            )?),
            dedup_clear_interval: Duration::from_secs(parse_var(
                &lookup,
                "CORRELATION_DEDUP_CLEAR_SECS",
                correlation_defaults.dedup_clear_interval.as_secs(),
            )?),
            allowed_topic_prefixes: match lookup("NOTIFY_TOPIC_PREFIXES") {
                Some(raw) => parse_list(&raw, "NOTIFY_TOPIC_PREFIXES")?,
                None => correlation_defaults.allowed_topic_prefixes,
            },
            denied_senders: match lookup("NOTIFY_DENIED_SENDERS") {
                Some(raw) => parse_list(&raw, "NOTIFY_DENIED_SENDERS")?.into_iter().collect(),
                None => correlation_defaults.denied_senders,
            },
        };

        if correlation.window.is_zero() {
            return Err(Error::config("CORRELATION_WINDOW_MS must be greater than 0"));
        }

        let adapter = AdapterSettings {
            max_retry_attempts: parse_var(
                &lookup,
                "ADAPTER_MAX_RETRY_ATTEMPTS",
                adapter_defaults.max_retry_attempts,
            )?,
            retry_delay: Duration::from_secs(parse_var(
                &lookup,
                "ADAPTER_RETRY_DELAY_SECS",
                adapter_defaults.retry_delay.as_secs(),
            )?),
            keep_alive: Duration::from_secs(parse_var(
                &lookup,
                "MQTT_KEEP_ALIVE_SECS",
                adapter_defaults.keep_alive.as_secs(),
            )?),
            subscribe_topics: match lookup("MQTT_SUBSCRIBE_TOPICS") {
                Some(raw) => parse_list(&raw, "MQTT_SUBSCRIBE_TOPICS")?,
                None => adapter_defaults.subscribe_topics,
            },
            poll_interval: Duration::from_millis(parse_var(
                &lookup,
                "DIRECT_FEED_POLL_MS",
                adapter_defaults.poll_interval.as_millis() as u64,
            )?),
            suppressed_errors: match lookup("DECODE_SUPPRESSED_ERRORS") {
                Some(raw) => parse_list(&raw, "DECODE_SUPPRESSED_ERRORS")?,
                None => adapter_defaults.suppressed_errors,
            },
            channel_capacity: parse_var(
                &lookup,
                "ADAPTER_CHANNEL_CAPACITY",
                adapter_defaults.channel_capacity,
            )?,
        };

        let telegram = TelegramConfig {
            enabled: parse_var(&lookup, "TELEGRAM_ENABLED", false)?,
            bot_token: lookup("TELEGRAM_BOT_TOKEN").map(SecretString::new),
            channel_id: lookup("TELEGRAM_CHANNEL_ID"),
            bot_username: lookup("TELEGRAM_BOT_USERNAME"),
        };

        if telegram.enabled && !telegram.is_active() {
            tracing::warn!(
                "TELEGRAM_ENABLED is set but TELEGRAM_BOT_TOKEN or TELEGRAM_CHANNEL_ID is missing, \
                 notifications will only be logged"
            );
        }

        Ok(Self {
            redis: RedisConfig {
                host: lookup("REDIS_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: parse_var(&lookup, "REDIS_PORT", 6379)?,
                password: lookup("REDIS_PASSWORD"),
                // REDIS_URL takes precedence - supports TLS (rediss://)
                url: lookup("REDIS_URL"),
            },
            store: lookup("STORE_BACKEND")
                .map(|raw| raw.parse())
                .transpose()?
                .unwrap_or(StoreBackend::Redis),
            endpoints,
            classifier,
            series_max_len: parse_var(&lookup, "SERIES_MAX_LEN", DEFAULT_SERIES_MAX_LEN)?,
            correlation,
            telegram,
            adapter,
        })
    }

    /// Parse the `MESH_ENDPOINTS` JSON array
    ///
    /// ```json
    /// [{"name": "msk", "address": "mqtt://mqtt.example.org:1883",
    ///   "kind": "topic-subscribe", "notify": true}]
    /// ```
    fn load_endpoints<F>(lookup: &F) -> Result<Vec<EndpointConfig>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = lookup("MESH_ENDPOINTS").ok_or_else(|| Error::config("MESH_ENDPOINTS must be set"))?;

        let endpoints: Vec<EndpointConfig> = serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("Invalid MESH_ENDPOINTS: {}", e)))?;

        if endpoints.is_empty() {
            return Err(Error::config(
                "MESH_ENDPOINTS must define at least one endpoint",
            ));
        }

        let mut names = HashSet::new();
        for endpoint in &endpoints {
            if !names.insert(endpoint.name.as_str()) {
                return Err(Error::config(format!(
                    "Duplicate endpoint name in MESH_ENDPOINTS: {}",
                    endpoint.name
                )));
            }
        }

        tracing::info!(count = endpoints.len(), "Loaded endpoint configuration");

        Ok(endpoints)
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid {}: {}", name, e))),
        None => Ok(default),
    }
}

/// Parse a comma separated list, ignoring empty items
fn parse_list<T>(raw: &str, name: &str) -> Result<Vec<T>>
where
    T: FromStr,
    T::Err: Display,
{
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse()
                .map_err(|e| Error::config(format!("Invalid {} item '{}': {}", name, item, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const ENDPOINTS: &str = r#"[
        {"name": "msk", "address": "mqtt://mqtt.example.org:1883", "kind": "topic-subscribe", "notify": true},
        {"name": "home", "address": "http://192.168.1.50", "kind": "direct-feed"}
    ]"#;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("MESH_ENDPOINTS", ENDPOINTS)]).unwrap();

        assert_eq!(config.store, StoreBackend::Redis);
        assert_eq!(config.series_max_len, 200);
        assert_eq!(config.classifier.min_valid_id, 100_000);
        assert!(config.classifier.banned_ids.contains(&4_184_512_284));
        assert_eq!(config.correlation.window, Duration::from_secs(7));
        assert_eq!(config.correlation.dedup_clear_interval, Duration::from_secs(600));
        assert_eq!(config.correlation.allowed_topic_prefixes, vec!["msh/msk"]);
        assert_eq!(config.adapter.max_retry_attempts, 5);
        assert_eq!(config.adapter.subscribe_topics.len(), 8);
        assert!(!config.telegram.is_active());
    }

    #[test]
    fn test_endpoint_parsing() {
        let config = load(&[("MESH_ENDPOINTS", ENDPOINTS)]).unwrap();

        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].kind, EndpointKind::TopicSubscribe);
        assert!(config.endpoints[0].notify);
        assert_eq!(config.endpoints[1].kind, EndpointKind::DirectFeed);
        assert!(!config.endpoints[1].notify);
    }

    #[test]
    fn test_endpoint_telegram_alias() {
        let raw = r#"[{"name": "a", "address": "mqtt://h", "kind": "topic-subscribe", "telegram": true}]"#;
        let config = load(&[("MESH_ENDPOINTS", raw)]).unwrap();
        assert!(config.endpoints[0].notify);
    }

    #[test]
    fn test_missing_endpoints_is_error() {
        assert!(load(&[]).is_err());
        assert!(load(&[("MESH_ENDPOINTS", "[]")]).is_err());
        assert!(load(&[("MESH_ENDPOINTS", "not json")]).is_err());
    }

    #[test]
    fn test_duplicate_endpoint_names_rejected() {
        let raw = r#"[
            {"name": "a", "address": "mqtt://h", "kind": "topic-subscribe"},
            {"name": "a", "address": "mqtt://g", "kind": "topic-subscribe"}
        ]"#;
        assert!(load(&[("MESH_ENDPOINTS", raw)]).is_err());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("MESH_ENDPOINTS", ENDPOINTS),
            ("STORE_BACKEND", "memory"),
            ("CLASSIFIER_BANNED_IDS", "123456, 654321"),
            ("CLASSIFIER_MIN_VALID_ID", "10000"),
            ("CORRELATION_WINDOW_MS", "2500"),
            ("NOTIFY_TOPIC_PREFIXES", "msh/msk,msh/spb"),
            ("NOTIFY_DENIED_SENDERS", "2482595192"),
            ("TELEGRAM_ENABLED", "true"),
            ("TELEGRAM_BOT_TOKEN", "token"),
            ("TELEGRAM_CHANNEL_ID", "@mesh_channel"),
        ])
        .unwrap();

        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.classifier.banned_ids.len(), 2);
        assert_eq!(config.classifier.min_valid_id, 10_000);
        assert_eq!(config.correlation.window, Duration::from_millis(2_500));
        assert_eq!(config.correlation.allowed_topic_prefixes.len(), 2);
        assert!(config.correlation.denied_senders.contains(&2_482_595_192));
        assert!(config.telegram.is_active());
    }

    #[test]
    fn test_invalid_numbers_are_errors() {
        assert!(load(&[("MESH_ENDPOINTS", ENDPOINTS), ("REDIS_PORT", "abc")]).is_err());
        assert!(load(&[("MESH_ENDPOINTS", ENDPOINTS), ("CLASSIFIER_BANNED_IDS", "1,x")]).is_err());
        assert!(load(&[("MESH_ENDPOINTS", ENDPOINTS), ("CORRELATION_WINDOW_MS", "0")]).is_err());
        assert!(load(&[("MESH_ENDPOINTS", ENDPOINTS), ("STORE_BACKEND", "sqlite")]).is_err());
    }

    #[test]
    fn test_redis_connection_url_with_password() {
        let config = RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            password: Some("secret".to_string()),
            url: None,
        };

        assert_eq!(config.connection_url(), "redis://:secret@localhost:6379");
    }

    #[test]
    fn test_redis_connection_url_with_direct_url() {
        let config = RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            password: Some("ignored".to_string()),
            url: Some("rediss://:authtoken@redis.example.com:6379".to_string()),
        };

        // Direct URL takes precedence over host/port/password
        assert_eq!(
            config.connection_url(),
            "rediss://:authtoken@redis.example.com:6379"
        );
    }
}
