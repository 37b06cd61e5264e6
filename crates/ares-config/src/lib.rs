//! Configuration system for the Ares planet viewer.
//!
//! Provides runtime-configurable settings that persist to disk as RON files.
//! Supports CLI overrides via clap, hot-reload detection, validation of the
//! tile engine settings, and forward/backward compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CacheConfig, Config, DebugConfig, MARS_RADIUS_M, MAX_BASE_SEGMENTS, MAX_SUPPORTED_LEVEL,
    PlanetTileConfig, TREK_MARS_MOSAIC_URL,
};
pub use error::ConfigError;
