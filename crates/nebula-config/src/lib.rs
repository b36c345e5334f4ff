//! Configuration for the scene cache.
//!
//! Settings persist to disk as RON files, can be overridden from the command
//! line via clap, and are sanitized before the cache plans its pools.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, FieldConfig, SceneCacheConfig};
pub use error::ConfigError;
