//! `ares-tilectl`: manage the Mars tile cache and fly scripted descents
//! against the tile engine without a window.
//!
//! Run with: `cargo run -p ares-tilectl -- descend`

mod commands;
mod platform;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use ares_config::{CliArgs, Config};
use ares_tiles::{HttpTileFetcher, TileFetcher};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use commands::{AppError, DescentPlan};
use platform::PlatformDirs;

/// Command-line interface of `ares-tilectl`.
#[derive(Parser, Debug)]
#[command(name = "ares-tilectl", about = "Mars tile cache and streaming tools")]
struct Cli {
    #[command(flatten)]
    overrides: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Download whole pyramid levels into the tile cache.
    Prefetch {
        /// First level to download.
        #[arg(long, default_value_t = 0)]
        from_level: u8,
        /// Last level to download.
        #[arg(long, default_value_t = 3)]
        to_level: u8,
        /// Parallel downloads (defaults to the configured load concurrency).
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Delete every cached tile.
    ClearCache,
    /// Show where the tile cache lives and what it holds.
    Stats,
    /// Simulate a descent from orbit and report what the engine streamed.
    Descend {
        /// Frames to simulate.
        #[arg(long, default_value_t = 600)]
        frames: u32,
        /// Starting altitude in meters.
        #[arg(long, default_value_t = 4_000_000.0)]
        start_altitude_m: f64,
        /// Final altitude in meters.
        #[arg(long, default_value_t = 2_000.0)]
        end_altitude_m: f64,
        /// Target latitude in degrees.
        #[arg(long, default_value_t = 18.4, allow_negative_numbers = true)]
        latitude_deg: f64,
        /// Target longitude in degrees.
        #[arg(long, default_value_t = 77.5, allow_negative_numbers = true)]
        longitude_deg: f64,
        /// Milliseconds between frames.
        #[arg(long, default_value_t = 16)]
        frame_ms: u64,
        /// Seconds to wait for outstanding loads after the last frame.
        #[arg(long, default_value_t = 30)]
        settle_secs: u64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let dirs = match PlatformDirs::resolve() {
        Ok(dirs) => match cli.overrides.config.clone() {
            Some(config_dir) => dirs.with_config_dir(config_dir),
            None => dirs,
        },
        Err(e) => {
            eprintln!("Failed to resolve platform directories: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = dirs.create_dirs() {
        eprintln!("Failed to create platform directories: {e}");
    }

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&dirs.config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&cli.overrides);
    if config.cache.directory.is_none() {
        config.cache.directory = Some(dirs.tile_cache_dir());
    }

    ares_log::init_logging(Some(&dirs.log_dir), cfg!(debug_assertions), Some(&config));

    match run(&cli.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: &Command, config: &Config) -> Result<(), AppError> {
    config.tiles.validate()?;
    let fetcher = Arc::new(HttpTileFetcher::new(Duration::from_secs(
        config.tiles.fetch_timeout_secs,
    )));

    match command {
        Command::Prefetch {
            from_level,
            to_level,
            concurrency,
        } => {
            let concurrency = concurrency.unwrap_or(config.tiles.max_concurrent_loads);
            let report = commands::prefetch(
                config,
                fetcher.as_ref(),
                *from_level..=*to_level,
                concurrency,
            )?;
            println!(
                "Prefetched levels {from_level}..={to_level}: {} downloaded, {} already cached, {} failed",
                report.downloaded, report.skipped, report.failed
            );
        }
        Command::ClearCache => {
            commands::clear_cache(config)?;
            println!("Tile cache cleared");
        }
        Command::Stats => {
            let report = commands::cache_stats(config)?;
            println!("Tile cache: {}", report.location.display());
            println!("  format version: {}", report.metadata.version);
            println!("  created (unix): {}", report.metadata.created_at_unix);
            println!("  tiles:          {}", report.metadata.record_count);
        }
        Command::Descend {
            frames,
            start_altitude_m,
            end_altitude_m,
            latitude_deg,
            longitude_deg,
            frame_ms,
            settle_secs,
        } => {
            let plan = DescentPlan {
                frames: *frames,
                start_altitude_m: *start_altitude_m,
                end_altitude_m: *end_altitude_m,
                latitude_deg: *latitude_deg,
                longitude_deg: *longitude_deg,
                frame_interval: Duration::from_millis(*frame_ms),
            };
            let fetcher: Arc<dyn TileFetcher> = fetcher;
            let summary =
                commands::descend(config, fetcher, &plan, Duration::from_secs(*settle_secs))?;
            info!("Descent finished");
            let stats = summary.last_frame;
            let loads = summary.loads;
            println!("Frames:            {}", stats.frame);
            println!("Tracked nodes:     {}", stats.tracked_nodes);
            println!("Drawn leaves:      {} ({} textured)", stats.desired, stats.desired_loaded);
            println!("Deepest level:     {:?}", stats.max_visible_level);
            println!("Visible triangles: {}", summary.visible_triangles);
            println!(
                "Loads:             {} requested, {} cache hits, {} from store, {} from network, {} failed",
                loads.requested, loads.cache_hits, loads.store_hits, loads.network_fetches, loads.failures
            );
            println!(
                "Cache:             {} evictions, {} late arrivals for pruned tiles",
                loads.evictions, loads.stale_discarded
            );
            if !summary.settled {
                println!("Some loads were still running when the settle timeout expired");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_descend_defaults() {
        let cli = Cli::try_parse_from(["ares-tilectl", "descend"]).unwrap();
        match cli.command {
            Command::Descend {
                frames,
                end_altitude_m,
                latitude_deg,
                ..
            } => {
                assert_eq!(frames, 600);
                assert_eq!(end_altitude_m, 2_000.0);
                assert_eq!(latitude_deg, 18.4);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_global_overrides_after_subcommand() {
        let cli = Cli::try_parse_from([
            "ares-tilectl",
            "prefetch",
            "--to-level",
            "2",
            "--no-cache",
            "--max-level",
            "9",
        ])
        .unwrap();
        assert!(cli.overrides.no_cache);
        assert_eq!(cli.overrides.max_level, Some(9));
        assert_eq!(
            cli.command,
            Command::Prefetch {
                from_level: 0,
                to_level: 2,
                concurrency: None,
            }
        );
    }

    #[test]
    fn test_negative_coordinates() {
        let cli = Cli::try_parse_from([
            "ares-tilectl",
            "descend",
            "--latitude-deg",
            "-4.5",
            "--longitude-deg",
            "-137.4",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Descend { latitude_deg, longitude_deg, .. }
                if latitude_deg == -4.5 && longitude_deg == -137.4
        ));
    }

    #[test]
    fn test_missing_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["ares-tilectl"]).is_err());
    }

    #[test]
    fn test_run_rejects_invalid_config() {
        let mut config = Config::default();
        config.tiles.max_concurrent_loads = 0;
        assert!(matches!(
            run(&Command::Stats, &config),
            Err(AppError::Config(_))
        ));
    }
}
