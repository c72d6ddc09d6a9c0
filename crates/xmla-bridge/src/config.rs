//! Bridge configuration
//!
//! YAML with `${VAR}` / `${VAR:-default}` environment expansion:
//!
//! ```yaml
//! connection:
//!   endpoint: powerbi://api.powerbi.com/v1.0/myorg/Sales
//!   dataset_name: AdventureWorks
//!   client_id: ${XMLA_CLIENT_ID}
//!   client_secret: ${XMLA_CLIENT_SECRET}
//!   tenant_id: ${XMLA_TENANT_ID}
//! pool:
//!   max_size: 16
//!   checkout_threshold: 50m
//!   checkin_threshold: 45m
//! retry:
//!   backoff: [1s, 4s]
//! stream:
//!   encoding: utf8
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

use crate::connection::ConnectionOptions;
use crate::error::{Error, Result};
use crate::executor::RetryPolicy;
use crate::pool::PoolConfig;
use crate::stream::StreamOptions;

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Engine connection options
    pub connection: ConnectionOptions,

    /// Pool settings
    #[serde(default)]
    pub pool: PoolConfig,

    /// Executor retry policy
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Result streaming settings
    #[serde(default)]
    pub stream: StreamOptions,
}

impl BridgeConfig {
    /// Create a configuration with defaults for everything but the connection
    pub fn new(connection: ConnectionOptions) -> Self {
        Self {
            connection,
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            stream: StreamOptions::default(),
        }
    }

    /// Load and validate configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loading bridge configuration");
        Self::from_yaml_str(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| Error::config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.connection.validate_options()?;
        self.pool.validate()?;
        if self.stream.buffer_size == 0 {
            return Err(Error::config("stream buffer_size must be at least 1"));
        }
        Ok(())
    }
}
