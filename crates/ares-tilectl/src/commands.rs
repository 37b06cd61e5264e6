//! Subcommand implementations, kept free of argument parsing so tests can drive them.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ares_config::{Config, ConfigError};
use ares_tiles::{
    CameraState, FrameStats, LoadStats, PersistentTileStore, PlanetTileManager, PrefetchReport,
    RenderGroup, StoreError, StoreLocation, StoreMetadata, TileError, TileFetcher, TileUrlScheme,
    lon_lat_to_unit, prefetch_levels,
};
use glam::DVec3;
use tracing::{debug, info};

/// Vertical field of view of the simulated descent camera, in degrees.
const DESCENT_FOV_DEGREES: f64 = 60.0;
/// Viewport height of the simulated descent camera, in pixels.
const DESCENT_VIEWPORT_HEIGHT: f64 = 1080.0;
/// Frames between progress lines during a descent.
const PROGRESS_INTERVAL: u32 = 60;

/// Errors surfaced by `ares-tilectl`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A tile operation failed.
    #[error(transparent)]
    Tile(#[from] TileError),
    /// The tile store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The command needs the persistent cache but it is disabled.
    #[error("the tile cache is disabled (remove --no-cache or set cache.enabled)")]
    CacheDisabled,
    /// A level range with its bounds reversed.
    #[error("invalid level range {from}..={to}")]
    LevelRange {
        /// First level.
        from: u8,
        /// Last level.
        to: u8,
    },
}

fn cache_dir(config: &Config) -> Result<PathBuf, AppError> {
    config.tile_cache_dir().ok_or(AppError::CacheDisabled)
}

/// Open the on-disk tile store, failing if it cannot be used.
pub fn open_disk_store(config: &Config) -> Result<PersistentTileStore, AppError> {
    let store = PersistentTileStore::open(StoreLocation::Disk(cache_dir(config)?));
    if !store.is_available() {
        return Err(StoreError::Closed.into());
    }
    Ok(store)
}

/// Download `levels` into the tile store.
pub fn prefetch(
    config: &Config,
    fetcher: &dyn TileFetcher,
    levels: RangeInclusive<u8>,
    concurrency: usize,
) -> Result<PrefetchReport, AppError> {
    if levels.start() > levels.end() {
        return Err(AppError::LevelRange {
            from: *levels.start(),
            to: *levels.end(),
        });
    }
    let store = open_disk_store(config)?;
    let urls = TileUrlScheme::new(config.tiles.base_url.clone(), config.tiles.extension.clone());
    Ok(prefetch_levels(&store, fetcher, &urls, levels, concurrency)?)
}

/// Remove every persisted tile.
pub fn clear_cache(config: &Config) -> Result<(), AppError> {
    open_disk_store(config)?.clear()?;
    Ok(())
}

/// What `stats` reports about the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheReport {
    /// Store directory.
    pub location: PathBuf,
    /// Store metadata.
    pub metadata: StoreMetadata,
}

/// Describe the tile store.
pub fn cache_stats(config: &Config) -> Result<CacheReport, AppError> {
    let location = cache_dir(config)?;
    let store = open_disk_store(config)?;
    let metadata = store.metadata().ok_or(StoreError::Closed)?;
    Ok(CacheReport { location, metadata })
}

/// A scripted camera descent toward one surface point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DescentPlan {
    /// Frames to simulate.
    pub frames: u32,
    /// Altitude of the first frame, in meters.
    pub start_altitude_m: f64,
    /// Altitude of the last frame, in meters.
    pub end_altitude_m: f64,
    /// Target latitude in degrees.
    pub latitude_deg: f64,
    /// Target longitude in degrees.
    pub longitude_deg: f64,
    /// Wall-clock pause between frames.
    pub frame_interval: Duration,
}

impl DescentPlan {
    /// Altitude at `frame`, interpolated geometrically so the descent slows near the ground.
    pub fn altitude_at(&self, frame: u32) -> f64 {
        let t = if self.frames <= 1 {
            1.0
        } else {
            f64::from(frame.min(self.frames - 1)) / f64::from(self.frames - 1)
        };
        let start = self.start_altitude_m.max(1.0);
        let end = self.end_altitude_m.max(1.0);
        start * (end / start).powf(t)
    }

    /// Camera for `frame`, straight above the target and looking at the planet center.
    pub fn camera_at(&self, frame: u32, radius: f64) -> CameraState {
        let up = lon_lat_to_unit(
            self.longitude_deg.to_radians(),
            self.latitude_deg.to_radians(),
        );
        let position = up * (radius + self.altitude_at(frame));
        CameraState::look_at(
            position,
            DVec3::ZERO,
            DESCENT_FOV_DEGREES,
            DESCENT_VIEWPORT_HEIGHT,
        )
    }
}

/// Outcome of a descent.
#[derive(Debug, Clone, Copy)]
pub struct DescentSummary {
    /// Stats of the last frame.
    pub last_frame: FrameStats,
    /// Cumulative load counters.
    pub loads: LoadStats,
    /// Whether every outstanding load finished before the settle timeout.
    pub settled: bool,
    /// Triangles drawn in the last frame.
    pub visible_triangles: usize,
}

/// Fly `plan` against a headless renderer and report what the engine did.
pub fn descend(
    config: &Config,
    fetcher: Arc<dyn TileFetcher>,
    plan: &DescentPlan,
    settle_timeout: Duration,
) -> Result<DescentSummary, AppError> {
    let store = Arc::new(PersistentTileStore::open(StoreLocation::from_cache_dir(
        config.tile_cache_dir(),
    )));
    let mut manager = PlanetTileManager::new(&config.tiles, RenderGroup::new(), store, fetcher)?;
    let radius = config.tiles.radius_m;

    info!(
        "Descending over {:.2}°N {:.2}°E from {:.0} m to {:.0} m in {} frames",
        plan.latitude_deg, plan.longitude_deg, plan.start_altitude_m, plan.end_altitude_m, plan.frames
    );

    let mut last_frame = FrameStats::default();
    for frame in 0..plan.frames {
        last_frame = manager.update(&plan.camera_at(frame, radius));
        if frame % PROGRESS_INTERVAL == 0 || frame + 1 == plan.frames {
            info!(
                "frame {:>5} alt {:>10.0} m | nodes {:>4} desired {:>3} ({} loaded) culled {:>3} | level {:?} | loads {} queued {} running",
                last_frame.frame,
                plan.altitude_at(frame),
                last_frame.tracked_nodes,
                last_frame.desired,
                last_frame.desired_loaded,
                last_frame.culled,
                last_frame.max_visible_level,
                last_frame.queued_loads,
                last_frame.in_flight_loads,
            );
        }
        if !plan.frame_interval.is_zero() {
            std::thread::sleep(plan.frame_interval);
        }
    }

    let settled = manager.settle(settle_timeout);
    if settled && plan.frames > 0 {
        // One more pass so parents hide behind the children that just loaded.
        last_frame = manager.update(&plan.camera_at(plan.frames - 1, radius));
    }
    debug!("Descent settled: {settled}");

    let summary = DescentSummary {
        last_frame,
        loads: manager.load_stats(),
        settled,
        visible_triangles: manager.renderer().visible_triangles(),
    };
    manager.shutdown();
    Ok(summary)
}
