//! KDL configuration parsing for deployit.
//!
//! This crate handles parsing of the system configuration (`deployit.kdl`)
//! and its environment variable overrides.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    QueueBackend, QueueConfig, ServerConfig, StorageBackend, StorageConfig, SystemConfig,
    WorkerConfig, parse_system_config,
};
