use crate::config::error::{ConfigError, Result};
use crate::pool::PoolConfig;
use crate::reconnect::ReconnectConfig;
use crate::retry::RetryConfig;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Mailbox connection pool
    #[serde(default)]
    pub pool: PoolConfig,

    /// Chat reconnection manager
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Retry executor defaults
    #[serde(default)]
    pub retry: RetryDefaults,
}

/// Default retry policies for the two executor entry points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDefaults {
    #[serde(default = "RetryConfig::stateless")]
    pub stateless: RetryConfig,

    #[serde(default = "RetryConfig::with_reconnect")]
    pub with_reconnect: RetryConfig,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            stateless: RetryConfig::stateless(),
            with_reconnect: RetryConfig::with_reconnect(),
        }
    }
}

impl ResilienceConfig {
    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_connections_per_account == 0 {
            return Err(ConfigError::ValidationError(
                "pool.max_connections_per_account must be at least 1".to_string(),
            ));
        }
        if self.pool.pending_request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "pool.pending_request_timeout_ms must be positive".to_string(),
            ));
        }

        let reconnect = &self.reconnect;
        if reconnect.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "reconnect.max_attempts must be at least 1".to_string(),
            ));
        }
        if reconnect.circuit_breaker_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "reconnect.circuit_breaker_threshold must be at least 1".to_string(),
            ));
        }
        check_backoff(
            "reconnect",
            reconnect.initial_backoff_ms,
            reconnect.max_backoff_ms,
            reconnect.backoff_multiplier,
        )?;

        for (name, retry) in [
            ("retry.stateless", &self.retry.stateless),
            ("retry.with_reconnect", &self.retry.with_reconnect),
        ] {
            check_backoff(name, retry.base_delay_ms, retry.max_delay_ms, retry.backoff_multiplier)?;
            if retry.throttle_multiplier == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name}.throttle_multiplier must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

fn check_backoff(section: &str, base_ms: u64, cap_ms: u64, multiplier: f64) -> Result<()> {
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(ConfigError::ValidationError(format!(
            "{section} backoff multiplier must be >= 1.0 (got {multiplier})"
        )));
    }
    if base_ms > cap_ms {
        return Err(ConfigError::ValidationError(format!(
            "{section} base delay {base_ms}ms exceeds max delay {cap_ms}ms"
        )));
    }
    Ok(())
}

/// Configuration loader with layered merging support
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration with layered merging:
    /// 1. Start with defaults (from Default implementations)
    /// 2. Merge config file if provided
    /// 3. Override with environment variables (RELINK_ prefix)
    pub fn load(&self) -> Result<ResilienceConfig> {
        let mut builder = Config::builder();

        // Layer 1: Defaults (serialize defaults to JSON and load as base)
        let defaults_json = serde_json::to_string(&ResilienceConfig::default())?;
        builder = builder.add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        // Layer 2: Config file (if provided)
        if let Some(ref path) = self.config_path {
            if path.exists() {
                builder = builder.add_source(File::from(path.as_ref()));
            } else {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
        }

        // Layer 3: Environment variables, double underscore for nesting
        // Example: RELINK_POOL__MAX_CONNECTIONS_PER_ACCOUNT=8
        builder = builder.add_source(
            Environment::with_prefix("RELINK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let resilience: ResilienceConfig = config.try_deserialize()?;
        resilience.validate()?;

        tracing::debug!(
            file = ?self.config_path,
            max_connections_per_account = resilience.pool.max_connections_per_account,
            max_attempts = resilience.reconnect.max_attempts,
            "loaded resilience configuration"
        );
        Ok(resilience)
    }

    /// Locate the default config file in standard locations:
    /// 1. Current directory: ./relink.toml
    /// 2. XDG config: ~/.config/relink/config.toml
    /// 3. Home directory: ~/.relink.toml
    pub fn find_config_file() -> Option<PathBuf> {
        let cwd_config = PathBuf::from("./relink.toml");
        if cwd_config.exists() {
            return Some(cwd_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let xdg_config = config_dir.join("relink").join("config.toml");
            if xdg_config.exists() {
                return Some(xdg_config);
            }
        }

        if let Some(home_dir) = dirs::home_dir() {
            let home_config = home_dir.join(".relink.toml");
            if home_config.exists() {
                return Some(home_config);
            }
        }

        None
    }

    /// Load configuration from default locations
    pub fn load_default() -> Result<ResilienceConfig> {
        let loader = if let Some(config_path) = Self::find_config_file() {
            ConfigLoader::new().with_file(config_path)
        } else {
            ConfigLoader::new()
        };

        loader.load()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
