//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name inside the config directory.
const CONFIG_FILE: &str = "config.ron";

/// Directory name under the platform config directory.
const APP_DIR: &str = "nebula-scene-cache";

/// Largest supported texel density per voxel edge.
pub const MAX_TEXELS_PER_VOXEL_EDGE: u32 = 16;
/// Virtual pages addressable per chunk.
pub const MAX_PAGES_PER_CHUNK: u32 = 16_384;
/// Largest atlas budget per field.
pub const MAX_ATLAS_COUNT: u32 = 256;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Paging and budget settings.
    pub scene_cache: SceneCacheConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Settings of one lighting field. Members missing from a file take the
/// near-field defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FieldConfig {
    /// Texels along one voxel edge in the capture atlases.
    pub texels_per_voxel_edge: u32,
    /// Chunk radius the field covers around the camera.
    pub radius_chunks: u32,
    /// Physical patch pages budgeted per resident chunk.
    pub patch_pages_per_chunk: u32,
}

/// Scene cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SceneCacheConfig {
    /// High-density field around the camera.
    pub near: FieldConfig,
    /// Low-density ring beyond the near field.
    pub far: FieldConfig,
    /// Atlas textures each field may allocate.
    pub max_atlas_count: u32,
    /// Feedback requests examined per field per frame.
    pub max_requests_per_frame: u32,
    /// New physical pages per field per frame.
    pub max_new_allocations_per_frame: u32,
    /// Relight-only refreshes per field per frame.
    pub max_recapture_per_frame: u32,
    /// Remesh generations a patch may go unreferenced before its id is
    /// reaped (0 keeps ids forever).
    pub patch_reap_age_generations: u32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Log per-frame cache telemetry.
    pub log_frame_stats: bool,
}

// --- Default implementations ---

impl Default for FieldConfig {
    fn default() -> Self {
        Self::near()
    }
}

impl FieldConfig {
    /// Near-field defaults.
    pub fn near() -> Self {
        Self {
            texels_per_voxel_edge: 4,
            radius_chunks: 8,
            patch_pages_per_chunk: 16,
        }
    }

    /// Far-field defaults.
    pub fn far() -> Self {
        Self {
            texels_per_voxel_edge: 2,
            radius_chunks: 24,
            patch_pages_per_chunk: 4,
        }
    }
}

impl Default for SceneCacheConfig {
    fn default() -> Self {
        Self {
            near: FieldConfig::near(),
            far: FieldConfig::far(),
            max_atlas_count: 64,
            max_requests_per_frame: 4096,
            max_new_allocations_per_frame: 256,
            max_recapture_per_frame: 128,
            patch_reap_age_generations: 16,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_frame_stats: false,
        }
    }
}

// --- Sanitization ---

impl FieldConfig {
    fn sanitize(&mut self) {
        let texels = self.texels_per_voxel_edge.clamp(1, MAX_TEXELS_PER_VOXEL_EDGE);
        self.texels_per_voxel_edge = 1 << texels.ilog2();
        self.patch_pages_per_chunk = self.patch_pages_per_chunk.clamp(1, MAX_PAGES_PER_CHUNK);
    }
}

impl SceneCacheConfig {
    /// Clamps every setting into the range the pool planner accepts.
    /// Returns `true` if anything changed.
    pub fn sanitize(&mut self) -> bool {
        let before = self.clone();

        self.near.sanitize();
        self.far.sanitize();
        self.near.radius_chunks = self.near.radius_chunks.max(1);
        self.far.radius_chunks = self
            .far
            .radius_chunks
            .max(self.near.radius_chunks.saturating_add(1));
        self.max_atlas_count = self.max_atlas_count.clamp(1, MAX_ATLAS_COUNT);
        self.max_requests_per_frame = self.max_requests_per_frame.max(1);
        self.max_new_allocations_per_frame = self.max_new_allocations_per_frame.max(1);
        self.max_recapture_per_frame = self.max_recapture_per_frame.max(1);

        let changed = *self != before;
        if changed {
            log::warn!("Scene cache config adjusted: {before:?} -> {self:?}");
        }
        changed
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Default config directory (`<platform config dir>/nebula-scene-cache`).
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::WriteError {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(|source| ConfigError::WriteError {
            path: config_path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE))?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        ron::from_str(&contents).map_err(ConfigError::ParseError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("max_atlas_count: 64"));
        assert!(ron_str.contains("texels_per_voxel_edge: 4"));
    }

    #[test]
    fn test_defaults_match_fields() {
        let config = SceneCacheConfig::default();
        assert_eq!(config.near, FieldConfig { texels_per_voxel_edge: 4, radius_chunks: 8, patch_pages_per_chunk: 16 });
        assert_eq!(config.far, FieldConfig { texels_per_voxel_edge: 2, radius_chunks: 24, patch_pages_per_chunk: 4 });
        assert_eq!(
            (
                config.max_requests_per_frame,
                config.max_new_allocations_per_frame,
                config.max_recapture_per_frame
            ),
            (4096, 256, 128)
        );
    }

    #[test]
    fn test_missing_field_uses_default() {
        let ron_str = "(scene_cache: (near: (radius_chunks: 3)))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.scene_cache.near.radius_chunks, 3);
        assert_eq!(config.scene_cache.near.texels_per_voxel_edge, 4);
        assert_eq!(config.scene_cache.far, FieldConfig::far());
        assert_eq!(config.debug, DebugConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_sanitize_defaults_unchanged() {
        let mut config = SceneCacheConfig::default();
        assert!(!config.sanitize());
        assert_eq!(config, SceneCacheConfig::default());
    }

    #[test]
    fn test_sanitize_clamps_density_to_power_of_two() {
        let mut config = SceneCacheConfig::default();
        config.near.texels_per_voxel_edge = 12;
        config.far.texels_per_voxel_edge = 0;
        assert!(config.sanitize());
        assert_eq!(config.near.texels_per_voxel_edge, 8);
        assert_eq!(config.far.texels_per_voxel_edge, 1);

        config.near.texels_per_voxel_edge = 100;
        config.sanitize();
        assert_eq!(config.near.texels_per_voxel_edge, 16);
    }

    #[test]
    fn test_sanitize_orders_radii_and_budgets() {
        let mut config = SceneCacheConfig::default();
        config.near.radius_chunks = 0;
        config.far.radius_chunks = 0;
        config.near.patch_pages_per_chunk = 0;
        config.far.patch_pages_per_chunk = 1_000_000;
        config.max_atlas_count = 0;
        config.max_new_allocations_per_frame = 0;
        config.max_recapture_per_frame = 0;
        config.max_requests_per_frame = 0;

        assert!(config.sanitize());
        assert_eq!(config.near.radius_chunks, 1);
        assert_eq!(config.far.radius_chunks, 2);
        assert_eq!(config.near.patch_pages_per_chunk, 1);
        assert_eq!(config.far.patch_pages_per_chunk, MAX_PAGES_PER_CHUNK);
        assert_eq!(config.max_atlas_count, 1);
        assert_eq!(config.max_new_allocations_per_frame, 1);
        assert_eq!(config.max_recapture_per_frame, 1);
        assert_eq!(config.max_requests_per_frame, 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.scene_cache.far.radius_chunks = 32;
        config.debug.log_level = "debug".to_string();

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        let config = Config::load_or_create(&nested).unwrap();
        assert_eq!(config, Config::default());
        assert!(nested.join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.scene_cache.max_new_allocations_per_frame = 64;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().scene_cache.max_new_allocations_per_frame, 64);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_reload_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::default().reload(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        let err = Config::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
