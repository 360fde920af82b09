//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (CONFAB_*)
//! - TOML configuration file (`confab.toml`, or `CONFAB_CONFIG`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Token verification.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Channel registry tuning.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Removal grace period behaviour.
    #[serde(default)]
    pub presence: PresenceSettings,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Token verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for token signatures.
    #[serde(default = "default_auth_secret")]
    pub secret: String,

    /// Maximum accepted token age in seconds, measured from issuance.
    #[serde(default = "default_max_token_age")]
    pub max_token_age_secs: u64,
}

/// Channel registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Maximum topics a single connection may join.
    #[serde(default = "default_max_joined_topics")]
    pub max_joined_topics: usize,

    /// Keep channels alive after the last member leaves.
    #[serde(default)]
    pub keep_empty: bool,

    /// Messages returned in a conversation join snapshot.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Seed the in-memory store with a demo conversation for this many
    /// users (0 disables seeding).
    #[serde(default = "default_demo_users")]
    pub demo_users: u64,
}

/// Removal grace period configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSettings {
    /// Seconds between a removal and the forced leave.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,

    /// Whether rejoining a topic cancels a pending forced leave.
    #[serde(default)]
    pub cancel_on_rejoin: bool,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Connection idle timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

fn default_host() -> String {
    std::env::var("CONFAB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    env_or("CONFAB_PORT", 4000)
}

fn default_auth_secret() -> String {
    std::env::var("CONFAB_AUTH_SECRET").unwrap_or_else(|_| "change-me".to_string())
}

fn default_max_token_age() -> u64 {
    env_or("CONFAB_MAX_TOKEN_AGE_SECS", 86_400)
}

fn default_max_joined_topics() -> usize {
    env_or("CONFAB_MAX_JOINED_TOPICS", 100)
}

fn default_history_limit() -> usize {
    env_or("CONFAB_HISTORY_LIMIT", 50)
}

fn default_demo_users() -> u64 {
    env_or("CONFAB_DEMO_USERS", 0)
}

fn default_grace_secs() -> u64 {
    env_or("CONFAB_REMOVAL_GRACE_SECS", 5)
}

fn default_heartbeat_timeout() -> u64 {
    env_or("CONFAB_HEARTBEAT_TIMEOUT_MS", 60_000)
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    env_or("CONFAB_METRICS_PORT", 9090)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth: AuthConfig::default(),
            channels: ChannelsConfig::default(),
            presence: PresenceSettings::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: default_auth_secret(),
            max_token_age_secs: default_max_token_age(),
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            max_joined_topics: default_max_joined_topics(),
            keep_empty: false,
            history_limit: default_history_limit(),
            demo_users: default_demo_users(),
        }
    }
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            grace_secs: default_grace_secs(),
            cancel_on_rejoin: false,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from file or defaults.
    ///
    /// `CONFAB_CONFIG` names an explicit file; otherwise the default
    /// search paths are tried in order.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("CONFAB_CONFIG") {
            return Self::from_file(&path);
        }

        let config_paths = [
            "confab.toml",
            "/etc/confab/confab.toml",
            "~/.config/confab/confab.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ServerConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("Invalid host:port")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 4000);
        assert_eq!(config.auth.max_token_age_secs, 86_400);
        assert_eq!(config.presence.grace_secs, 5);
        assert!(!config.presence.cancel_on_rejoin);
        assert!(!config.channels.keep_empty);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = ServerConfig::default();
        let addr = config.bind_addr();
        assert_eq!(addr.port(), 4000);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [auth]
            secret = "testing-secret"

            [channels]
            history_limit = 25

            [presence]
            grace_secs = 2
            cancel_on_rejoin = true
        "#;

        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.auth.secret, "testing-secret");
        assert_eq!(config.channels.history_limit, 25);
        assert_eq!(config.presence.grace_secs, 2);
        assert!(config.presence.cancel_on_rejoin);
    }
}
