//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Trek WMTS endpoint for the Viking MDIM 2.1 global colour mosaic.
pub const TREK_MARS_MOSAIC_URL: &str = "https://trek.nasa.gov/tiles/Mars/EQ/Mars_Viking_MDIM21_ClrMosaic_global_232m/1.0.0/default/default028mm";

/// Mean volumetric radius of Mars in meters.
pub const MARS_RADIUS_M: f64 = 3_396_190.0;

/// Deepest pyramid level a tile coordinate can address.
pub const MAX_SUPPORTED_LEVEL: u8 = 24;

/// Largest segment count per tile edge.
pub const MAX_BASE_SEGMENTS: u32 = 256;

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Planet tile streaming settings.
    pub tiles: PlanetTileConfig,
    /// Persistent tile cache settings.
    pub cache: CacheConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Settings consumed by the planet tile engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlanetTileConfig {
    /// Planet radius in meters.
    pub radius_m: f64,
    /// Base URL of the tile pyramid, without a trailing slash.
    pub base_url: String,
    /// Tile image file extension (without the dot).
    pub extension: String,
    /// Coarsest level streamed. The tiles of this level are the quadtree roots.
    pub min_level: u8,
    /// Finest level the quadtree may subdivide to.
    pub max_level: u8,
    /// Grid segments per tile edge at the finest levels.
    pub base_segments: u32,
    /// Anisotropic filtering level requested for tile textures.
    pub anisotropy: u16,
    /// Emit skirt geometry along tile edges.
    pub skirts_enabled: bool,
    /// Skirt depth as a fraction of the tile's arc length.
    pub skirt_depth_factor: f64,
    /// Maximum number of texture loads in flight at once.
    pub max_concurrent_loads: usize,
    /// Maximum number of decoded textures kept in memory.
    pub max_cached_textures: usize,
    /// Projected tile size in pixels above which a tile is subdivided.
    pub subdivide_threshold_px: f64,
    /// Dead band around the subdivide threshold, as a fraction of it.
    pub subdivide_hysteresis: f64,
    /// Tiles whose normal/view dot product falls below this are culled.
    pub backface_threshold: f64,
    /// Build tile geometry on background worker threads.
    pub offload_geometry: bool,
    /// Network timeout for a single tile request, in seconds.
    pub fetch_timeout_secs: u64,
    /// Camera travel (fraction of the radius) that triggers a queue re-sort.
    pub reprioritize_distance_fraction: f64,
    /// Camera rotation in degrees that triggers a queue re-sort.
    pub reprioritize_angle_degrees: f64,
}

/// Persistent tile cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Keep downloaded tiles on disk between sessions.
    pub enabled: bool,
    /// Cache directory. `None` resolves to the platform cache directory.
    pub directory: Option<PathBuf>,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Also write JSON logs to the log directory.
    pub log_to_file: bool,
}

// --- Default implementations ---

impl Default for PlanetTileConfig {
    fn default() -> Self {
        Self {
            radius_m: MARS_RADIUS_M,
            base_url: TREK_MARS_MOSAIC_URL.to_string(),
            extension: "jpg".to_string(),
            min_level: 1,
            max_level: 7,
            base_segments: 32,
            anisotropy: 16,
            skirts_enabled: true,
            skirt_depth_factor: 0.02,
            max_concurrent_loads: 20,
            max_cached_textures: 128,
            subdivide_threshold_px: 60.0,
            subdivide_hysteresis: 0.1,
            backface_threshold: -0.2,
            offload_geometry: false,
            fetch_timeout_secs: 10,
            reprioritize_distance_fraction: 0.001,
            reprioritize_angle_degrees: 2.0,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl PlanetTileConfig {
    /// Reject settings the tile engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.radius_m.is_finite() && self.radius_m > 0.0) {
            return Err(invalid("tiles.radius_m", "must be a positive number"));
        }
        if self.max_level > MAX_SUPPORTED_LEVEL {
            return Err(invalid(
                "tiles.max_level",
                format!("must not exceed {MAX_SUPPORTED_LEVEL}"),
            ));
        }
        if self.min_level > self.max_level {
            return Err(invalid(
                "tiles.min_level",
                format!("{} is above max_level {}", self.min_level, self.max_level),
            ));
        }
        if !(1..=MAX_BASE_SEGMENTS).contains(&self.base_segments) {
            return Err(invalid(
                "tiles.base_segments",
                format!("must be between 1 and {MAX_BASE_SEGMENTS}"),
            ));
        }
        if self.max_concurrent_loads == 0 {
            return Err(invalid("tiles.max_concurrent_loads", "must be at least 1"));
        }
        if self.max_cached_textures == 0 {
            return Err(invalid("tiles.max_cached_textures", "must be at least 1"));
        }
        if self.subdivide_threshold_px.is_nan() || self.subdivide_threshold_px <= 0.0 {
            return Err(invalid("tiles.subdivide_threshold_px", "must be positive"));
        }
        if !(0.0..1.0).contains(&self.subdivide_hysteresis) {
            return Err(invalid("tiles.subdivide_hysteresis", "must be in [0, 1)"));
        }
        if !(-1.0..=1.0).contains(&self.backface_threshold) {
            return Err(invalid("tiles.backface_threshold", "must be in [-1, 1]"));
        }
        if self.base_url.trim().is_empty() {
            return Err(invalid("tiles.base_url", "must not be empty"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
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
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Directory holding persisted tiles, if caching is enabled.
    ///
    /// Falls back to `<platform cache dir>/ares/tiles` when no directory is configured.
    pub fn tile_cache_dir(&self) -> Option<PathBuf> {
        if !self.cache.enabled {
            return None;
        }
        self.cache
            .directory
            .clone()
            .or_else(|| dirs::cache_dir().map(|dir| dir.join("ares").join("tiles")))
    }
}
