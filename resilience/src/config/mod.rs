//! Layered configuration for the resilience engine
//!
//! Sources, lowest precedence first:
//! 1. Defaults (from code)
//! 2. Config file (relink.toml)
//! 3. Environment variables (RELINK_* prefix, `__` between sections)
//!
//! # Example
//!
//! ```no_run
//! use relink_resilience::config::ConfigLoader;
//!
//! // Load from default locations
//! let config = ConfigLoader::load_default().expect("Failed to load config");
//!
//! // Or load from specific file
//! let config = ConfigLoader::new()
//!     .with_file("./relink.toml")
//!     .load()
//!     .expect("Failed to load config");
//! ```

pub mod error;
pub mod loader;

pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, ResilienceConfig, RetryDefaults};
