//! Session configuration
//!
//! Loaded from TOML or built in code with the `with_*` helpers.
//!
//! ```toml
//! [logging]
//! filter = "rescache_core=debug"
//! json = false
//!
//! [requirements]
//! wait_timeout_ms = 5000
//!
//! [reconciler]
//! eager_reload = true
//! reload_timeout_ms = 30000
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default bound on one eager reload triggered by a push event
pub const DEFAULT_RELOAD_TIMEOUT_MS: u64 = 30_000;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RescacheConfig {
    /// Logging subscriber settings
    pub logging: LoggingConfig,
    /// How long loads wait on requirements
    pub requirements: RequirementConfig,
    /// Push reconciliation policy
    pub reconciler: ReconcilerConfig,
}

impl RescacheConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    /// `ConfigError::Parse` on invalid TOML or unknown value types
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read configuration from a TOML file
    ///
    /// # Errors
    /// `ConfigError::Io` if the file cannot be read, `ConfigError::Parse` if
    /// it is not valid configuration
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// With log filter directive
    #[inline]
    #[must_use]
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.logging.filter = filter.into();
        self
    }

    /// With requirement wait timeout
    #[inline]
    #[must_use]
    pub fn with_requirement_timeout(mut self, timeout: Duration) -> Self {
        self.requirements.wait_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// With eager reload of in-use keys on remote update
    #[inline]
    #[must_use]
    pub fn with_eager_reload(mut self, eager: bool) -> Self {
        self.reconciler.eager_reload = eager;
        self
    }

    /// With upper bound on one eager reload
    #[inline]
    #[must_use]
    pub fn with_reload_timeout(mut self, timeout: Duration) -> Self {
        self.reconciler = self.reconciler.with_reload_timeout(timeout);
        self
    }
}

/// Logging subscriber settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Requirement waiting policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequirementConfig {
    /// Upper bound on waiting for a pending condition; `None` waits forever
    pub wait_timeout_ms: Option<u64>,
}

impl RequirementConfig {
    /// Wait timeout as a duration
    #[inline]
    #[must_use]
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }
}

/// Push reconciliation policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Reload in-use keys right after a remote update is accepted
    pub eager_reload: bool,
    /// Log self-healed failures at warn level (debug otherwise)
    pub log_healed: bool,
    /// Upper bound on one eager reload; `None` waits as long as the load does
    pub reload_timeout_ms: Option<u64>,
}

impl ReconcilerConfig {
    /// Eager reload timeout as a duration
    #[inline]
    #[must_use]
    pub fn reload_timeout(&self) -> Option<Duration> {
        self.reload_timeout_ms.map(Duration::from_millis)
    }

    /// With upper bound on one eager reload
    #[inline]
    #[must_use]
    pub fn with_reload_timeout(mut self, timeout: Duration) -> Self {
        self.reload_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            eager_reload: true,
            log_healed: true,
            reload_timeout_ms: Some(DEFAULT_RELOAD_TIMEOUT_MS),
        }
    }
}
