//! Configuration types for Tapwire

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::filter::FilterConfig;
use crate::network::{DEFAULT_EVENT_BUFFER, DEFAULT_MAX_REDIRECTS};
use crate::proxy::MAX_CONNECTIONS;
use crate::recording::{DirStore, MemoryStore, RecordStore};
use crate::{Result, TapwireError};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Port the forward proxy listens on
    pub listen_port: u16,
    /// Directory for stored records; records stay in memory when unset
    #[serde(default)]
    pub record_dir: Option<PathBuf>,
    /// Host filter
    #[serde(default)]
    pub filter: FilterConfig,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Outgoing transport settings
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent proxy connections
    pub max_connections: usize,
    /// Capacity of each exchange's event queue
    pub event_buffer: usize,
    /// Maximum redirects followed per call
    pub max_redirects: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: MAX_CONNECTIONS,
            event_buffer: DEFAULT_EVENT_BUFFER,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }
}

/// Outgoing transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Speak HTTP/2 with prior knowledge only
    pub http2_only: bool,
    /// Seconds an idle pooled connection is kept
    pub pool_idle_timeout_secs: u64,
    /// Idle pooled connections kept per host
    pub pool_max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            http2_only: false,
            pool_idle_timeout_secs: 90,
            pool_max_idle_per_host: 10,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TapwireError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| TapwireError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            return Err(TapwireError::ConfigError(
                "listen_port cannot be 0".to_string(),
            ));
        }

        if let Some(dir) = &self.record_dir {
            if !dir.is_dir() {
                return Err(TapwireError::ConfigError(format!(
                    "Record directory does not exist: {}",
                    dir.display()
                )));
            }
        }

        self.filter
            .validate()
            .map_err(|e| TapwireError::ConfigError(format!("Invalid filter: {e}")))?;

        for (name, value) in [
            ("max_connections", self.limits.max_connections),
            ("event_buffer", self.limits.event_buffer),
            ("max_redirects", self.limits.max_redirects),
            ("pool_max_idle_per_host", self.transport.pool_max_idle_per_host),
        ] {
            if value == 0 {
                return Err(TapwireError::ConfigError(format!("{name} must be > 0")));
            }
        }

        Ok(())
    }

    /// Open the configured record store
    ///
    /// # Errors
    ///
    /// Returns error if the record directory cannot be opened
    pub fn store(&self) -> Result<Arc<dyn RecordStore>> {
        match &self.record_dir {
            Some(dir) => Ok(Arc::new(DirStore::open(dir.clone())?)),
            None => Ok(Arc::new(MemoryStore::new())),
        }
    }
}
