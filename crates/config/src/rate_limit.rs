//! Request admission configuration structures.

use duration_str::{deserialize_duration, deserialize_option_duration};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Name of the rule applied when no endpoint entry matches a path, and
/// the fallback for unknown rule references.
pub const DEFAULT_RULE_NAME: &str = "api";

/// Request admission configuration for the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Whether request admission is enabled.
    pub enabled: bool,
    /// Storage backend configuration for the shared counter store.
    pub storage: StorageConfig,
    /// Named admission rules.
    pub rules: BTreeMap<String, RuleConfig>,
    /// Ordered endpoint-to-rule table. Exact entries win over prefix
    /// entries; overlapping prefixes resolve in declaration order.
    pub endpoints: Vec<EndpointRuleConfig>,
    /// Role multipliers applied to a rule's request quota. Unknown roles
    /// use a multiplier of 1.0.
    pub roles: BTreeMap<String, f64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage: StorageConfig::default(),
            rules: BTreeMap::new(),
            endpoints: Vec::new(),
            roles: BTreeMap::new(),
        }
    }
}

/// Configuration for a single named admission rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Length of the fixed counting window.
    #[serde(deserialize_with = "deserialize_duration")]
    pub window: Duration,
    /// Maximum number of requests admitted within the window.
    pub max_requests: u64,
    /// How the counting key is derived from a request.
    #[serde(default)]
    pub key_strategy: KeyStrategy,
    /// Message returned in the rejection body instead of the default.
    pub message: Option<String>,
    /// Emit `X-RateLimit-*` headers with an ISO-8601 reset timestamp.
    #[serde(default = "default_true")]
    pub standard_headers: bool,
    /// Emit `X-Rate-Limit-*` headers with an epoch-seconds reset value.
    #[serde(default)]
    pub legacy_headers: bool,
}

fn default_true() -> bool {
    true
}

/// Strategy for deriving the quota bucket key from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// Key by the caller's stable identity when present, otherwise by
    /// the caller's network address.
    #[default]
    Caller,
    /// Always key by the caller's network address.
    Address,
    /// One shared bucket for every request matching the rule.
    Global,
}

/// One entry of the ordered endpoint-to-rule table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointRuleConfig {
    /// Applies the rule when the request path equals `path` exactly.
    Exact {
        /// Path literal to match.
        path: String,
        /// Name of the rule to apply.
        rule: String,
    },
    /// Applies the rule when `prefix` is a string prefix of the path.
    Prefix {
        /// Path prefix to match.
        prefix: String,
        /// Name of the rule to apply.
        rule: String,
    },
}

impl EndpointRuleConfig {
    /// Name of the rule this entry applies.
    pub fn rule(&self) -> &str {
        match self {
            Self::Exact { rule, .. } | Self::Prefix { rule, .. } => rule,
        }
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (default). Counters are per-process; horizontal
    /// scaling requires the Redis backend.
    Memory,
    /// Redis storage with configuration.
    Redis(Box<RedisConfig>),
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Redis storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Connection pool configuration.
    #[serde(default)]
    pub pool: RedisPoolConfig,
    /// Key prefix for all counter keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: Option<String>,
    /// Response timeout for Redis commands. Exceeding it takes the
    /// fail-open path.
    #[serde(
        default = "default_response_timeout",
        deserialize_with = "deserialize_option_duration"
    )]
    pub response_timeout: Option<Duration>,
    /// Connection timeout.
    #[serde(
        default = "default_connection_timeout",
        deserialize_with = "deserialize_option_duration"
    )]
    pub connection_timeout: Option<Duration>,
}

fn default_key_prefix() -> Option<String> {
    Some("shopgate:rate_limit:".to_string())
}

fn default_response_timeout() -> Option<Duration> {
    Some(Duration::from_secs(1))
}

fn default_connection_timeout() -> Option<Duration> {
    Some(Duration::from_secs(5))
}

/// Redis connection pool configuration (deadpool-redis).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisPoolConfig {
    /// Maximum number of connections.
    pub max_size: Option<usize>,
    /// Timeout for creating connections.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub timeout_create: Option<Duration>,
    /// Timeout for waiting for a connection.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub timeout_wait: Option<Duration>,
    /// Timeout before recycling idle connections.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub timeout_recycle: Option<Duration>,
}

impl Default for RedisPoolConfig {
    fn default() -> Self {
        Self {
            max_size: Some(16),
            timeout_create: Some(Duration::from_secs(5)),
            timeout_wait: Some(Duration::from_secs(5)),
            timeout_recycle: Some(Duration::from_secs(300)),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
            pool: RedisPoolConfig::default(),
            key_prefix: default_key_prefix(),
            response_timeout: default_response_timeout(),
            connection_timeout: default_connection_timeout(),
        }
    }
}
