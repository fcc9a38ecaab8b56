//! Shopgate configuration structures to map the shopgate.toml configuration.

#![deny(missing_docs)]

mod client_identity;
mod loader;
mod rate_limit;

use std::{borrow::Cow, net::SocketAddr, path::Path};

pub use client_identity::ClientIdentity;
pub use rate_limit::*;
use serde::Deserialize;

/// Main configuration structure for the Shopgate application.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates the admission configuration, returning warnings for
    /// non-fatal issues such as shadowed endpoint prefixes.
    pub fn validate(&self) -> anyhow::Result<Vec<String>> {
        loader::validate_rate_limits(&self.server.rate_limits)
    }
}

/// HTTP server configuration settings.
#[derive(Default, Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// The socket address the server should listen on.
    pub listen_address: Option<SocketAddr>,
    /// Health endpoint configuration.
    #[serde(default)]
    pub health: HealthConfig,
    /// Statistics endpoint configuration.
    #[serde(default)]
    pub stats: StatsConfig,
    /// Client identity extraction configuration.
    #[serde(default)]
    pub client_identity: ClientIdentityConfig,
    /// Request admission (rate limiting) configuration.
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
}

/// Health endpoint configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    /// Whether the health endpoint is enabled.
    pub enabled: bool,
    /// The path for the health endpoint.
    pub path: Cow<'static, str>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            enabled: true,
            path: Cow::Borrowed("/health"),
        }
    }
}

/// Statistics endpoint configuration.
///
/// The snapshot endpoint answers `GET` on the configured path; the reset
/// endpoint answers `POST` on the same path with `/reset` appended.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatsConfig {
    /// Whether the statistics endpoints are enabled.
    pub enabled: bool,
    /// The base path for the statistics endpoints.
    pub path: Cow<'static, str>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            enabled: true,
            path: Cow::Borrowed("/stats"),
        }
    }
}

/// Client identity extraction configuration.
///
/// Shopgate does not authenticate callers itself; it trusts identity
/// headers injected by the upstream auth proxy. When disabled, every
/// caller is treated as anonymous and keyed by network address.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientIdentityConfig {
    /// Whether client identity extraction is enabled.
    pub enabled: bool,
    /// Header carrying the caller's stable identifier.
    pub client_id_header: String,
    /// Header carrying the caller's role, used for quota scaling.
    pub role_header: String,
}

impl Default for ClientIdentityConfig {
    fn default() -> Self {
        ClientIdentityConfig {
            enabled: false,
            client_id_header: "X-Client-Id".to_string(),
            role_header: "X-Client-Role".to_string(),
        }
    }
}
