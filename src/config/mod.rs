//! Locator Configuration Module
//!
//! Provides engine configuration loaded from TOML files, replacing all
//! hardcoded location tunables with operator-tunable values.
//!
//! ## Loading Order
//!
//! 1. `SEISLOC_CONFIG` environment variable (path to TOML file)
//! 2. `seisloc.toml` in the current working directory
//! 3. Built-in defaults
//!
//! The loaded `LocatorConfig` is passed by reference into the engine; there
//! is no global configuration state. A missing file is not an error, a
//! malformed one falls back to defaults with a warning, and out-of-range
//! values are repaired per field by `LocatorConfig::sanitized()`.

mod locator_config;
pub mod defaults;

pub use locator_config::{ConfigError, LocatorConfig, ValidationWarning};
pub use locator_config::{
    CloseoutConfig, DecorrelationConfig, DepthConfig, EstimatorConfig, PhaseIdConfig, StageConfig,
};
