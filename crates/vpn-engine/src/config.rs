//! Engine Configuration
//!
//! Timeouts, failover threshold and the settings of the concrete
//! collaborator adapters. Loadable from TOML or JSON; every field has a
//! default so a partial file is enough.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Session-wide reconnection budget (seconds)
    #[serde(default = "default_reconnection_timeout")]
    pub reconnection_timeout_secs: u64,
    /// Upper bound of the synchronous teardown (milliseconds)
    #[serde(default = "default_teardown_timeout")]
    pub teardown_timeout_ms: u64,
    /// Poll interval inside the synchronous teardown (milliseconds)
    #[serde(default = "default_teardown_poll")]
    pub teardown_poll_ms: u64,
    /// Consecutive failures before automatic mode gives up
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub wrappers: WrapperConfig,
    #[serde(default)]
    pub direct: DirectConfig,
    #[serde(default)]
    pub privileged: PrivilegedConfig,
}

fn default_reconnection_timeout() -> u64 {
    12 * 60 * 60
}

fn default_teardown_timeout() -> u64 {
    10_000
}

fn default_teardown_poll() -> u64 {
    10
}

fn default_failure_threshold() -> u32 {
    3
}

/// Post-connect reachability probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Host answering with the caller's public address
    pub probe_host: String,
    pub probe_port: u16,
    pub probe_path: String,
    pub attempts: u32,
    pub attempt_timeout_ms: u64,
    pub retry_delay_ms: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            probe_host: "checkip.amazonaws.com".to_string(),
            probe_port: 80,
            probe_path: "/".to_string(),
            attempts: 3,
            attempt_timeout_ms: 5_000,
            retry_delay_ms: 1_000,
        }
    }
}

impl VerifierConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// One obfuscation wrapper program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrapperProcessConfig {
    pub program: String,
    /// Local port the wrapper listens on
    pub local_port: u16,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrapperConfig {
    pub tls: WrapperProcessConfig,
    pub websocket: WrapperProcessConfig,
    pub ready_timeout_ms: u64,
    pub ready_poll_ms: u64,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            tls: WrapperProcessConfig {
                program: "stunnel".to_string(),
                local_port: 1194,
                extra_args: Vec::new(),
            },
            websocket: WrapperProcessConfig {
                program: "wstunnel".to_string(),
                local_port: 1195,
                extra_args: Vec::new(),
            },
            ready_timeout_ms: 5_000,
            ready_poll_ms: 100,
        }
    }
}

impl WrapperConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms)
    }
}

/// Tunnel helper driven by the direct connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectConfig {
    pub program: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Local management socket port
    pub management_port: u16,
    /// How long the helper may take to open its management socket
    pub start_timeout_ms: u64,
    /// Grace period between a stop request and a kill
    pub kill_timeout_ms: u64,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            program: "openvpn".to_string(),
            extra_args: Vec::new(),
            management_port: 9544,
            start_timeout_ms: 20_000,
            kill_timeout_ms: 10_000,
        }
    }
}

impl DirectConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

/// Command templates for privileged teardown steps.
///
/// `{adapter}` and `{ip}` are substituted before execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrivilegedConfig {
    #[serde(default)]
    pub reset_adapter: Option<Vec<String>>,
    #[serde(default)]
    pub restore_routes: Option<Vec<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnection_timeout_secs: default_reconnection_timeout(),
            teardown_timeout_ms: default_teardown_timeout(),
            teardown_poll_ms: default_teardown_poll(),
            failure_threshold: default_failure_threshold(),
            verifier: VerifierConfig::default(),
            wrappers: WrapperConfig::default(),
            direct: DirectConfig::default(),
            privileged: PrivilegedConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn reconnection_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnection_timeout_secs)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn teardown_poll(&self) -> Duration {
        Duration::from_millis(self.teardown_poll_ms)
    }

    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            _ => Err(ConfigError::UnsupportedFormat),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidThreshold);
        }
        if self.reconnection_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("reconnection_timeout_secs"));
        }
        if self.teardown_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("teardown_timeout_ms"));
        }
        if self.teardown_poll_ms == 0 {
            return Err(ConfigError::InvalidTimeout("teardown_poll_ms"));
        }
        if self.teardown_poll_ms > self.teardown_timeout_ms {
            return Err(ConfigError::TeardownPollTooLong);
        }
        if self.verifier.attempts == 0 {
            return Err(ConfigError::InvalidTimeout("verifier.attempts"));
        }
        if self.wrappers.ready_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("wrappers.ready_timeout_ms"));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format")]
    UnsupportedFormat,

    #[error("Failure threshold must be at least 1")]
    InvalidThreshold,

    #[error("{0} must be non-zero")]
    InvalidTimeout(&'static str),

    #[error("Teardown poll interval exceeds the teardown timeout")]
    TeardownPollTooLong,
}
