//! Command-line overrides for the tile engine configuration.

use std::path::PathBuf;

use clap::Args;

use crate::Config;

/// Configuration overrides accepted on the command line.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Args, Debug, Default, Clone)]
pub struct CliArgs {
    /// Tile pyramid base URL.
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Coarsest streamed level (quadtree roots).
    #[arg(long, global = true)]
    pub min_level: Option<u8>,

    /// Finest level the quadtree may subdivide to.
    #[arg(long, global = true)]
    pub max_level: Option<u8>,

    /// Maximum concurrent tile loads.
    #[arg(long, global = true)]
    pub max_concurrent_loads: Option<usize>,

    /// Maximum decoded textures kept in memory.
    #[arg(long, global = true)]
    pub max_cached_textures: Option<usize>,

    /// Directory for the persistent tile cache.
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Disable the persistent tile cache.
    #[arg(long, global = true)]
    pub no_cache: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref url) = args.base_url {
            self.tiles.base_url = url.clone();
        }
        if let Some(level) = args.min_level {
            self.tiles.min_level = level;
        }
        if let Some(level) = args.max_level {
            self.tiles.max_level = level;
        }
        if let Some(loads) = args.max_concurrent_loads {
            self.tiles.max_concurrent_loads = loads;
        }
        if let Some(textures) = args.max_cached_textures {
            self.tiles.max_cached_textures = textures;
        }
        if let Some(ref dir) = args.cache_dir {
            self.cache.directory = Some(dir.clone());
        }
        if args.no_cache {
            self.cache.enabled = false;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
