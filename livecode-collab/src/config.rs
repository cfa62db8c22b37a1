//! Relay configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration:
//!
//! ```toml
//! bind_addr = "0.0.0.0:9090"
//! http_addr = "0.0.0.0:9091"
//!
//! [execution]
//! timeout_secs = 5
//!
//! [execution.languages.ruby]
//! program = "ruby"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("default language {0:?} has no [execution.languages] entry")]
    UnknownDefaultLanguage(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Realtime WebSocket listener
    pub bind_addr: String,
    /// Discovery HTTP API listener (`None` = disabled)
    pub http_addr: Option<String>,
    pub max_peers_per_session: usize,
    /// Envelopes buffered per peer before drops start
    pub outbox_capacity: usize,
    pub heartbeat_interval_secs: u64,
    /// Silence after which a connection is dropped
    pub peer_timeout_secs: u64,
    /// Lifetime of a session nobody has joined
    pub session_idle_ttl_secs: u64,
    pub execution: ExecutionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            http_addr: Some("127.0.0.1:9091".to_string()),
            max_peers_per_session: 100,
            outbox_capacity: 256,
            heartbeat_interval_secs: 15,
            peer_timeout_secs: 45,
            session_idle_ttl_secs: 300,
            execution: ExecutionConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.execution.validate()?;
        Ok(config)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn session_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.session_idle_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub timeout_secs: u64,
    /// Captured output beyond this is cut off
    pub max_output_bytes: usize,
    /// Used when a submission names no language
    pub default_language: String,
    pub languages: BTreeMap<String, CommandSpec>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        let mut languages = BTreeMap::new();
        languages.insert("javascript".to_string(), CommandSpec::new("node", &[]));
        languages.insert("python".to_string(), CommandSpec::new("python3", &["-"]));
        Self {
            timeout_secs: 10,
            max_output_bytes: 64 * 1024,
            default_language: "javascript".to_string(),
            languages,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The default language must be runnable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.languages.contains_key(&self.default_language) {
            Ok(())
        } else {
            Err(ConfigError::UnknownDefaultLanguage(self.default_language.clone()))
        }
    }
}

/// Interpreter invocation; the code is written to its stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}
