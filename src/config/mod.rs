//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`NETCONF_*`)
//! - CLI arguments (for `netconf serve`)
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 2830
//! capabilities = ["urn:ietf:params:netconf:capability:candidate:1.0"]
//! terminal_operations = ["commit"]
//!
//! [session]
//! hello_timeout_secs = 20
//! idle_timeout_secs = 3600      # 0 disables
//! max_message_size = 16777216
//! max_chunk_size = 16777216
//! outbound_chunk_size = 8192
//!
//! [client]
//! request_timeout_secs = 60
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{
    DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_OUTBOUND_CHUNK_SIZE,
    MAX_CHUNK_SIZE_LIMIT,
};
use crate::error::{NetconfError, Result};
use crate::timer::MAX_DELAY;

/// Default NETCONF-over-TCP port used by the CLI.
pub const DEFAULT_PORT: u16 = 2830;

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-session limits and timeouts
    #[serde(default)]
    pub session: SessionConfig,

    /// Client configuration
    #[serde(default)]
    pub client: ClientConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            NetconfError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Config file location under the user config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("netconf").join("config.toml"))
    }

    /// Default file if present, else defaults; environment applied on top
    pub fn load_default() -> Result<Self> {
        let base = match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::debug!("Loading config from {}", path.display());
                Self::from_file(path)?
            },
            _ => Self::default(),
        };
        let config = base.with_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `NETCONF_*` environment overrides
    pub fn with_env(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(host) = var("NETCONF_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("NETCONF_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(secs) = var("NETCONF_HELLO_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.session.hello_timeout_secs = secs;
        }
        if let Some(secs) = var("NETCONF_IDLE_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.session.idle_timeout_secs = secs;
        }
        if let Some(size) = var("NETCONF_MAX_MESSAGE_SIZE").and_then(|v| v.parse().ok()) {
            self.session.max_message_size = size;
        }
        if let Some(secs) = var("NETCONF_REQUEST_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.client.request_timeout_secs = secs;
        }
        self
    }

    /// Check limits for consistency
    pub fn validate(&self) -> Result<()> {
        let session = &self.session;
        if session.hello_timeout_secs == 0 {
            return Err(NetconfError::Config(
                "session.hello_timeout_secs must be positive".to_string(),
            ));
        }
        let max_secs = MAX_DELAY.as_secs();
        for (name, secs) in [
            ("session.hello_timeout_secs", session.hello_timeout_secs),
            ("session.idle_timeout_secs", session.idle_timeout_secs),
            ("client.request_timeout_secs", self.client.request_timeout_secs),
        ] {
            if secs > max_secs {
                return Err(NetconfError::Config(format!(
                    "{name} must be at most {max_secs}"
                )));
            }
        }
        if session.max_message_size == 0 || session.max_chunk_size == 0 {
            return Err(NetconfError::Config(
                "message and chunk size limits must be positive".to_string(),
            ));
        }
        if session.outbound_chunk_size == 0
            || session.outbound_chunk_size as u64 > MAX_CHUNK_SIZE_LIMIT
        {
            return Err(NetconfError::Config(format!(
                "session.outbound_chunk_size must be in 1..={MAX_CHUNK_SIZE_LIMIT}"
            )));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Capabilities advertised in addition to the base capabilities
    pub capabilities: Vec<String>,

    /// Operations that must end a pipelined batch
    pub terminal_operations: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            capabilities: Vec::new(),
            terminal_operations: vec!["commit".to_string()],
        }
    }
}

impl ServerConfig {
    /// Get the full listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Session limits and timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time allowed for the hello exchange
    pub hello_timeout_secs: u64,

    /// Close sessions without inbound traffic for this long (0 = never)
    pub idle_timeout_secs: u64,

    /// Maximum size of one assembled message
    pub max_message_size: usize,

    /// Maximum size of one incoming chunk
    pub max_chunk_size: usize,

    /// Size outgoing messages are split into in chunked mode
    pub outbound_chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hello_timeout_secs: 20,
            idle_timeout_secs: 3600,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            outbound_chunk_size: DEFAULT_OUTBOUND_CHUNK_SIZE,
        }
    }
}

impl SessionConfig {
    /// Hello timeout as a duration
    pub fn hello_timeout(&self) -> Duration {
        Duration::from_secs(self.hello_timeout_secs)
    }

    /// Idle timeout, `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default time to wait for an rpc-reply
    pub request_timeout_secs: u64,

    /// Capabilities advertised in addition to the base capabilities
    pub capabilities: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            capabilities: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr(), "127.0.0.1:2830");
        assert_eq!(config.session.hello_timeout(), Duration::from_secs(20));
        assert_eq!(config.session.idle_timeout(), Some(Duration::from_secs(3600)));
        assert_eq!(config.session.outbound_chunk_size, 8192);
        assert_eq!(config.server.terminal_operations, vec!["commit"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml_partial() {
        let toml = r#"
            [server]
            port = 8300

            [session]
            idle_timeout_secs = 0
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8300);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.session.idle_timeout(), None);
        assert_eq!(config.client.request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[client]\nrequest_timeout_secs = 5\ncapabilities = [\"urn:example:cap\"]"
        )
        .unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.client.request_timeout_secs, 5);
        assert_eq!(config.client.capabilities, vec!["urn:example:cap"]);
    }

    #[test]
    fn test_from_file_errors() {
        assert!(matches!(
            Config::from_file("/nonexistent/netconf.toml"),
            Err(NetconfError::Config(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session]\noutbound_chunk_size = 0").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn test_timeouts_are_bounded() {
        let mut config = Config::default();
        config.session.idle_timeout_secs = 100_000_000;
        assert!(matches!(config.validate(), Err(NetconfError::Config(_))));

        let mut config = Config::default();
        config.client.request_timeout_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.hello_timeout_secs = MAX_DELAY.as_secs();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("NETCONF_PORT", "9999"),
            ("NETCONF_IDLE_TIMEOUT", "0"),
            ("NETCONF_REQUEST_TIMEOUT", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let config =
            Config::default().with_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.session.idle_timeout(), None);
        assert_eq!(config.client.request_timeout_secs, 60);
    }
}
