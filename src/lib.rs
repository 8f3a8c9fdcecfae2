//! CRUD PubSub
//!
//! Republishes REST CRUD mutations as real-time events over WebSockets:
//! - Connection registry of live, authenticated clients
//! - Bounded-concurrency fanout of change events to matching subscribers
//! - Auth handshake against an access-token store
//! - Ingest endpoint for the host request pipeline

pub mod api;
pub mod auth;
pub mod events;
pub mod server;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use server::{bind, start_server, ServerHandle};

use anyhow::Result;
use auth::AccessTokenRecord;
use serde::Deserialize;
use std::path::Path;

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: ServerYamlConfig,
    pub pubsub: PubSubYamlConfig,
    pub identity: IdentityYamlConfig,
}

/// Server configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerYamlConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerYamlConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
        }
    }
}

/// Fanout and WebSocket session settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubSubYamlConfig {
    /// Require the auth handshake before a connection receives events
    pub auth: bool,
    /// Deliveries in flight per publish
    pub max_concurrency: usize,
    /// Outbound queue length per connection
    pub channel_capacity: usize,
    /// Time a new connection has to authenticate before it is closed
    pub auth_timeout_ms: u64,
    /// Interval between server-sent WebSocket pings
    pub ping_interval_secs: u64,
    /// Endpoint patterns (regex) whose mutations are never published
    pub ignored_endpoints: Vec<String>,
}

impl Default for PubSubYamlConfig {
    fn default() -> Self {
        Self {
            auth: true,
            max_concurrency: events::DEFAULT_MAX_CONCURRENCY,
            channel_capacity: 256,
            auth_timeout_ms: 1000,
            ping_interval_secs: 30,
            ignored_endpoints: events::DEFAULT_IGNORED_ENDPOINTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Identity provider section.
///
/// When `url` is set, tokens are looked up over HTTP; otherwise the
/// static `tokens` list is used.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct IdentityYamlConfig {
    pub url: Option<String>,
    pub tokens: Vec<AccessTokenRecord>,
}

// ============================================================================
// Runtime config (what the application actually uses)
// ============================================================================

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub auth_enabled: bool,
    pub max_concurrency: usize,
    pub channel_capacity: usize,
    pub auth_timeout_ms: u64,
    pub ping_interval_secs: u64,
    pub ignored_endpoints: Vec<String>,
    pub identity_url: Option<String>,
    pub identity_tokens: Vec<AccessTokenRecord>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_yaml(YamlConfig::default())
    }
}

impl Config {
    /// Load configuration from environment variables only.
    /// Equivalent to from_yaml_and_env(None).
    pub fn from_env() -> Result<Self> {
        Self::from_yaml_and_env(None)
    }

    /// Load configuration from an optional YAML file, then override with env vars.
    ///
    /// Priority: env var > YAML > default
    ///
    /// If `yaml_path` is None, tries "config.yaml" in CWD. If the file doesn't
    /// exist, falls back to pure env var / defaults.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_yaml(Self::load_yaml(yaml_path));

        if let Ok(host) = std::env::var("SERVER_HOST") {
            config.server_host = host;
        }
        if let Some(port) = env_parse("SERVER_PORT") {
            config.server_port = port;
        }
        if let Ok(auth) = std::env::var("PUBSUB_AUTH") {
            config.auth_enabled = parse_flag(&auth).unwrap_or(config.auth_enabled);
        }
        if let Some(n) = env_parse("PUBSUB_MAX_CONCURRENCY") {
            config.max_concurrency = n;
        }
        if let Ok(url) = std::env::var("IDENTITY_URL") {
            config.identity_url = Some(url).filter(|u| !u.is_empty());
        }

        Ok(config)
    }

    fn from_yaml(yaml: YamlConfig) -> Self {
        Self {
            server_host: yaml.server.host,
            server_port: yaml.server.port,
            auth_enabled: yaml.pubsub.auth,
            max_concurrency: yaml.pubsub.max_concurrency,
            channel_capacity: yaml.pubsub.channel_capacity,
            auth_timeout_ms: yaml.pubsub.auth_timeout_ms,
            ping_interval_secs: yaml.pubsub.ping_interval_secs,
            ignored_endpoints: yaml.pubsub.ignored_endpoints,
            identity_url: yaml.identity.url,
            identity_tokens: yaml.identity.tokens,
        }
    }

    /// Try to load and parse a YAML config file. Returns defaults on any failure.
    fn load_yaml(yaml_path: Option<&Path>) -> YamlConfig {
        let default_path = Path::new("config.yaml");
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    YamlConfig::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                YamlConfig::default()
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|s| s.parse().ok())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod config_tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_yaml_config_loading() {
        let yaml = r#"
server:
  host: 127.0.0.1
  port: 9090

pubsub:
  auth: false
  max_concurrency: 8
  auth_timeout_ms: 2500
  ignored_endpoints: ["^/internal"]

identity:
  tokens:
    - id: "tok-1"
      userId: "42"
    - id: "tok-2"
      userId: "7"
      expiresAt: "2030-01-01T00:00:00Z"
"#;

        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert!(!config.pubsub.auth);
        assert_eq!(config.pubsub.max_concurrency, 8);
        assert_eq!(config.pubsub.auth_timeout_ms, 2500);
        // Unset fields keep their defaults
        assert_eq!(config.pubsub.channel_capacity, 256);
        assert_eq!(config.pubsub.ignored_endpoints, vec!["^/internal"]);
        assert_eq!(config.identity.tokens.len(), 2);
        assert_eq!(config.identity.tokens[0].user_id, "42");
        assert!(config.identity.tokens[1].expires_at.is_some());
        assert!(config.identity.url.is_none());
    }

    #[test]
    fn test_yaml_defaults() {
        let config = YamlConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.pubsub.auth);
        assert_eq!(config.pubsub.auth_timeout_ms, 1000);
        assert_eq!(config.pubsub.ping_interval_secs, 30);
        assert_eq!(config.pubsub.ignored_endpoints.len(), 2);
        assert!(config.identity.tokens.is_empty());
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" off "), Some(false));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    /// Combined test for YAML file loading and env var overrides.
    /// Runs as a single test to avoid parallel env var race conditions.
    #[test]
    fn test_yaml_and_env_lifecycle() {
        fn clear_env() {
            for var in &[
                "SERVER_HOST",
                "SERVER_PORT",
                "PUBSUB_AUTH",
                "PUBSUB_MAX_CONCURRENCY",
                "IDENTITY_URL",
            ] {
                std::env::remove_var(var);
            }
        }

        // --- Phase 1: YAML values loaded correctly ---
        let yaml = r#"
server:
  port: 9999
pubsub:
  max_concurrency: 4
identity:
  url: http://yaml-tokens:3000/api/AccessTokens
"#;
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&file_path).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        clear_env();

        let config = Config::from_yaml_and_env(Some(&file_path)).unwrap();
        assert_eq!(config.server_port, 9999);
        assert_eq!(config.max_concurrency, 4);
        assert!(config.auth_enabled);
        assert_eq!(
            config.identity_url.as_deref(),
            Some("http://yaml-tokens:3000/api/AccessTokens")
        );

        // --- Phase 2: Env vars override YAML ---
        std::env::set_var("SERVER_PORT", "7777");
        std::env::set_var("PUBSUB_AUTH", "false");
        std::env::set_var("IDENTITY_URL", "http://env-tokens/api/AccessTokens");

        let config = Config::from_yaml_and_env(Some(&file_path)).unwrap();
        assert_eq!(config.server_port, 7777);
        assert!(!config.auth_enabled);
        assert_eq!(
            config.identity_url.as_deref(),
            Some("http://env-tokens/api/AccessTokens")
        );
        // YAML value still used where no env override
        assert_eq!(config.max_concurrency, 4);

        clear_env();

        // --- Phase 3: No YAML file → defaults ---
        let nonexistent = Path::new("/tmp/nonexistent-pubsub-config-12345.yaml");
        let config = Config::from_yaml_and_env(Some(nonexistent)).unwrap();
        assert_eq!(config.server_port, 3000);
        assert!(config.auth_enabled);
        assert!(config.identity_url.is_none());
    }
}
