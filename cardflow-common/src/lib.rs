//! Cardflow Common - Shared configuration and logging for Cardflow services.
//!
//! This crate provides:
//! - Configuration types and loading (file, environment, defaults)
//! - Logging setup with noise filtering

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod logging;

pub use config::{AutomationConfig, Config, ObservabilityConfig, StorageBackend, StorageConfig};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::{AutomationConfig, Config, StorageConfig};
    pub use crate::logging::init_logging;
}
