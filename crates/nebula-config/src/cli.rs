//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Scene cache command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "nebula-scene-cache", about = "Nebula scene cache")]
pub struct CliArgs {
    /// Near-field radius in chunks.
    #[arg(long)]
    pub near_radius: Option<u32>,

    /// Far-field radius in chunks.
    #[arg(long)]
    pub far_radius: Option<u32>,

    /// New physical pages per field per frame.
    #[arg(long)]
    pub max_new_allocations: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config. Values are not sanitized here.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(r) = args.near_radius {
            self.scene_cache.near.radius_chunks = r;
        }
        if let Some(r) = args.far_radius {
            self.scene_cache.far.radius_chunks = r;
        }
        if let Some(n) = args.max_new_allocations {
            self.scene_cache.max_new_allocations_per_frame = n;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            near_radius: Some(4),
            max_new_allocations: Some(32),
            log_level: Some("trace".to_string()),
            ..CliArgs::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.scene_cache.near.radius_chunks, 4);
        assert_eq!(config.scene_cache.max_new_allocations_per_frame, 32);
        assert_eq!(config.debug.log_level, "trace");
        // Non-overridden fields retain defaults
        assert_eq!(config.scene_cache.far.radius_chunks, 24);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_parse_flags() {
        let args = CliArgs::parse_from(["nebula-scene-cache", "--far-radius", "40", "--config", "/tmp/x"]);
        assert_eq!(args.far_radius, Some(40));
        assert_eq!(args.config, Some(PathBuf::from("/tmp/x")));
        assert_eq!(args.near_radius, None);
    }
}
