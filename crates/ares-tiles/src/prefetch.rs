//! Bulk download of whole pyramid levels into the persistent store.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};

use ares_config::MAX_SUPPORTED_LEVEL;
use tracing::{debug, info, warn};

use crate::coord::TileCoordinate;
use crate::error::{CoordinateError, TileError};
use crate::fetch::{TileFetcher, TileUrlScheme};
use crate::store::{PersistentTileStore, StoreError};
use crate::texture::decode_tile_image;

/// Outcome of [`prefetch_levels`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    /// Tiles fetched and stored.
    pub downloaded: u64,
    /// Tiles already in the store.
    pub skipped: u64,
    /// Tiles that could not be fetched or decoded.
    pub failed: u64,
}

impl PrefetchReport {
    /// Tiles visited.
    pub fn total(&self) -> u64 {
        self.downloaded + self.skipped + self.failed
    }
}

/// Fetch every tile of `levels` that the store does not hold yet, using up to
/// `concurrency` threads. Individual tile failures are counted, not returned.
///
/// Fails up front if the store is unavailable or a level is out of range.
pub fn prefetch_levels(
    store: &PersistentTileStore,
    fetcher: &dyn TileFetcher,
    urls: &TileUrlScheme,
    levels: RangeInclusive<u8>,
    concurrency: usize,
) -> Result<PrefetchReport, TileError> {
    if !store.is_available() {
        return Err(StoreError::Closed.into());
    }
    if *levels.end() > MAX_SUPPORTED_LEVEL {
        return Err(CoordinateError::LevelTooDeep {
            level: *levels.end(),
            max: MAX_SUPPORTED_LEVEL,
        }
        .into());
    }

    let downloaded = AtomicU64::new(0);
    let skipped = AtomicU64::new(0);
    let failed = AtomicU64::new(0);

    for level in levels {
        let total = TileCoordinate::tiles_at(level);
        info!("Prefetching level {level} ({total} tiles)");
        let (tx, rx) = crossbeam_channel::bounded::<TileCoordinate>(64);

        std::thread::scope(|scope| {
            for _ in 0..concurrency.max(1) {
                let rx = rx.clone();
                let (downloaded, skipped, failed) = (&downloaded, &skipped, &failed);
                scope.spawn(move || {
                    while let Ok(coord) = rx.recv() {
                        let counter = match prefetch_tile(store, fetcher, urls, &coord) {
                            Ok(true) => downloaded,
                            Ok(false) => skipped,
                            Err(e) => {
                                warn!("Prefetch of {coord} failed: {e}");
                                failed
                            }
                        };
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
            drop(rx);
            for coord in TileCoordinate::level_tiles(level) {
                if tx.send(coord).is_err() {
                    break;
                }
            }
            drop(tx);
        });
    }

    let report = PrefetchReport {
        downloaded: downloaded.into_inner(),
        skipped: skipped.into_inner(),
        failed: failed.into_inner(),
    };
    info!(
        "Prefetch finished: {} downloaded, {} already stored, {} failed",
        report.downloaded, report.skipped, report.failed
    );
    Ok(report)
}

/// Returns `true` if the tile was downloaded, `false` if it was already stored.
fn prefetch_tile(
    store: &PersistentTileStore,
    fetcher: &dyn TileFetcher,
    urls: &TileUrlScheme,
    coord: &TileCoordinate,
) -> Result<bool, TileError> {
    if store.contains(coord) {
        return Ok(false);
    }
    let url = urls.url(coord);
    let bytes = fetcher.fetch(&url)?;
    decode_tile_image(&bytes)?;
    store.put(coord, &bytes);
    debug!("Prefetched {coord}");
    Ok(true)
}
