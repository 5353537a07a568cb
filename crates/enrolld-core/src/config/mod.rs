//! Configuration parsing and validation.
//!
//! The daemon loads one TOML file with three sections: `[daemon]` (paths and
//! the token secret), `[engine]` (allocation/finalization knobs), and
//! `[collaborators]` (endpoints of the external submission, payment, and
//! notification services). Every engine knob has a default; validation is
//! fail-closed and runs at load time, never mid-cycle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::humantime_serde;
use crate::retry::RetryPolicy;
use crate::token::MIN_SECRET_BYTES;

/// Top-level daemon configuration.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Daemon paths and secrets.
    #[serde(default)]
    pub daemon: DaemonSection,

    /// Engine knobs.
    #[serde(default)]
    pub engine: EngineConfig,

    /// External collaborator endpoints.
    #[serde(default)]
    pub collaborators: CollaboratorConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] on the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.daemon.validate()?;
        self.engine.validate()?;
        Ok(())
    }
}

/// `[daemon]` section: paths and the token secret.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonSection {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Path to the Unix control socket.
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,

    /// Hex-encoded HMAC secret for resume tokens (at least 32 bytes).
    #[serde(default = "default_secret")]
    pub token_secret_hex: SecretString,
}

fn default_secret() -> SecretString {
    SecretString::new(String::new())
}

fn default_db_path() -> PathBuf {
    PathBuf::from("enrolld.db")
}

fn default_control_socket() -> PathBuf {
    PathBuf::from("enrolld.sock")
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            control_socket: default_control_socket(),
            token_secret_hex: default_secret(),
        }
    }
}

impl DaemonSection {
    fn validate(&self) -> Result<(), ConfigError> {
        let secret = self.token_secret_hex.expose_secret();
        let decoded = hex::decode(secret).map_err(|_| {
            ConfigError::Validation("daemon.token_secret_hex must be valid hex".to_string())
        })?;
        if decoded.len() < MIN_SECRET_BYTES {
            return Err(ConfigError::Validation(format!(
                "daemon.token_secret_hex must decode to at least {MIN_SECRET_BYTES} bytes"
            )));
        }
        Ok(())
    }
}

/// `[engine]` section: allocation and finalization knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Interval between allocation cycles.
    #[serde(default = "default_cycle_interval")]
    #[serde(with = "humantime_serde")]
    pub cycle_interval: Duration,

    /// Maximum sessions processed per cycle; the rest roll over.
    #[serde(default = "default_max_sessions_per_cycle")]
    pub max_sessions_per_cycle: usize,

    /// Bound on concurrent finalization attempts.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Maximum pending requests one user may hold per session.
    #[serde(default = "default_per_user_session_cap")]
    pub per_user_session_cap: usize,

    /// How long a human-verification interrupt stays resumable.
    #[serde(default = "default_interrupt_ttl")]
    #[serde(with = "humantime_serde")]
    pub interrupt_ttl: Duration,

    /// Hard timeout for one submission attempt.
    #[serde(default = "default_submission_timeout")]
    #[serde(with = "humantime_serde")]
    pub submission_timeout: Duration,

    /// Hard timeout for one charge capture call.
    #[serde(default = "default_charge_timeout")]
    #[serde(with = "humantime_serde")]
    pub charge_timeout: Duration,

    /// Submission retry budget and backoff.
    #[serde(default)]
    pub retry: RetryPolicy,
}

const fn default_cycle_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_max_sessions_per_cycle() -> usize {
    32
}

const fn default_worker_concurrency() -> usize {
    4
}

const fn default_per_user_session_cap() -> usize {
    1
}

const fn default_interrupt_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

const fn default_submission_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_charge_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval: default_cycle_interval(),
            max_sessions_per_cycle: default_max_sessions_per_cycle(),
            worker_concurrency: default_worker_concurrency(),
            per_user_session_cap: default_per_user_session_cap(),
            interrupt_ttl: default_interrupt_ttl(),
            submission_timeout: default_submission_timeout(),
            charge_timeout: default_charge_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Validates the engine knobs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] on the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions_per_cycle == 0 {
            return Err(ConfigError::Validation(
                "engine.max_sessions_per_cycle must be at least 1".to_string(),
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Validation(
                "engine.worker_concurrency must be at least 1".to_string(),
            ));
        }
        if self.per_user_session_cap == 0 {
            return Err(ConfigError::Validation(
                "engine.per_user_session_cap must be at least 1".to_string(),
            ));
        }
        if self.interrupt_ttl.is_zero() {
            return Err(ConfigError::Validation(
                "engine.interrupt_ttl must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "engine.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// `[collaborators]` section: external service endpoints.
///
/// Endpoints are only required by the daemon binary; library users inject
/// their own collaborator implementations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollaboratorConfig {
    /// Submission (browser automation) service endpoint.
    #[serde(default)]
    pub submission_url: String,

    /// Payment processor endpoint.
    #[serde(default)]
    pub payment_url: String,

    /// Notification delivery endpoint.
    #[serde(default)]
    pub notify_url: String,
}

impl CollaboratorConfig {
    /// Validates that every endpoint is configured (binary start-up check).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the missing endpoint.
    pub fn require_endpoints(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("collaborators.submission_url", &self.submission_url),
            ("collaborators.payment_url", &self.payment_url),
            ("collaborators.notify_url", &self.notify_url),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Validation(format!("{field} is required")));
            }
        }
        Ok(())
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[source] std::io::Error),

    /// Failed to parse the TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    /// A constraint was violated.
    #[error("invalid config: {0}")]
    Validation(String),
}
