//! Service configuration
//!
//! Configuration management using Figment.
//!
//! # Configuration Sources
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `RIGSVC_`
//! 2. TOML configuration file (default: `config/services.toml`)
//!
//! # Environment Variables
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! RIGSVC_APPLICATION__LOG_LEVEL=debug
//! RIGSVC_LIFECYCLE__POLL_INTERVAL_MS=500
//! ```

pub mod services_config;

pub use services_config::{
    ApplicationConfig, DeviceDefinition, DeviceKind, LifecycleConfig, ProfileConfig,
    ServicesConfig, DEFAULT_CONFIG_PATH, ENV_PREFIX,
};
