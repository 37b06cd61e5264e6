//! Bounded-concurrency, priority-ordered texture loading.
//!
//! The frame thread owns the queue, the in-flight set and the texture cache.
//! Fetch workers (one per concurrency slot) resolve a tile from the
//! persistent store or the network, decode it and send the outcome back over
//! a channel. Nothing here blocks the frame thread except
//! [`poll_timeout`](TextureLoadScheduler::poll_timeout) and shutdown.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ares_config::PlanetTileConfig;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};

use crate::coord::TileCoordinate;
use crate::error::TileError;
use crate::fetch::{TileFetcher, TileUrlScheme};
use crate::queue::LoadQueue;
use crate::store::PersistentTileStore;
use crate::texture::{TextureCache, TileTexture, decode_tile_image};

/// Outcome of [`TextureLoadScheduler::request`].
#[derive(Debug, Clone)]
pub enum LoadRequest {
    /// The texture is cached and can be applied right away.
    Cached(TileTexture),
    /// A new load was queued.
    Queued,
    /// A load for this tile was already queued.
    AlreadyQueued,
    /// A load for this tile is running.
    InFlight,
}

/// Where a completed load got its bytes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileSource {
    /// The persistent store.
    Store,
    /// The remote pyramid.
    Network,
}

/// A finished load handed back to the frame thread.
#[derive(Debug)]
pub struct LoadCompletion {
    /// Tile the load was for.
    pub coord: TileCoordinate,
    /// The decoded texture and its source, or why the load failed.
    pub result: Result<(TileTexture, TileSource), TileError>,
    /// Wall-clock time the worker spent, in milliseconds.
    pub elapsed_ms: u64,
}

/// Cumulative load counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Calls to [`TextureLoadScheduler::request`].
    pub requested: u64,
    /// Requests answered from the texture cache.
    pub cache_hits: u64,
    /// Loads resolved from the persistent store.
    pub store_hits: u64,
    /// Loads resolved from the network.
    pub network_fetches: u64,
    /// Loads that failed.
    pub failures: u64,
    /// Textures evicted from the cache.
    pub evictions: u64,
    /// Completions that arrived after their node was pruned.
    pub stale_discarded: u64,
}

struct FetchJob {
    coord: TileCoordinate,
    url: String,
}

/// Schedules texture loads for the tile tree.
pub struct TextureLoadScheduler {
    queue: LoadQueue,
    in_flight: FxHashSet<TileCoordinate>,
    max_concurrent: usize,
    cache: TextureCache,
    urls: TileUrlScheme,
    job_sender: Option<Sender<FetchJob>>,
    completion_receiver: Receiver<LoadCompletion>,
    workers: Vec<JoinHandle<()>>,
    stats: LoadStats,
}

impl TextureLoadScheduler {
    /// Start one fetch worker per concurrency slot.
    pub fn new(
        config: &PlanetTileConfig,
        store: Arc<PersistentTileStore>,
        fetcher: Arc<dyn TileFetcher>,
    ) -> Result<Self, TileError> {
        let max_concurrent = config.max_concurrent_loads.max(1);
        let anisotropy = config.anisotropy;
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<FetchJob>();
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<LoadCompletion>();

        let mut workers = Vec::with_capacity(max_concurrent);
        for index in 0..max_concurrent {
            let jobs = job_rx.clone();
            let done = done_tx.clone();
            let store = Arc::clone(&store);
            let fetcher = Arc::clone(&fetcher);

            let handle = std::thread::Builder::new()
                .name(format!("tile-fetch-{index}"))
                .spawn(move || {
                    while let Ok(job) = jobs.recv() {
                        let start = Instant::now();
                        let result = load_tile(&job, &store, fetcher.as_ref(), anisotropy);
                        let completion = LoadCompletion {
                            coord: job.coord,
                            result,
                            elapsed_ms: start.elapsed().as_millis() as u64,
                        };
                        if done.send(completion).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|source| TileError::Spawn {
                    name: "tile fetch",
                    source,
                })?;
            workers.push(handle);
        }

        Ok(Self {
            queue: LoadQueue::new(),
            in_flight: FxHashSet::default(),
            max_concurrent,
            cache: TextureCache::new(config.max_cached_textures),
            urls: TileUrlScheme::new(config.base_url.clone(), config.extension.clone()),
            job_sender: Some(job_tx),
            completion_receiver: done_rx,
            workers,
            stats: LoadStats::default(),
        })
    }

    /// Ask for the texture of `coord` with the given priority (lower = sooner).
    pub fn request(&mut self, coord: TileCoordinate, priority: f64) -> LoadRequest {
        self.stats.requested += 1;
        if let Some(texture) = self.cache.get(&coord) {
            self.stats.cache_hits += 1;
            return LoadRequest::Cached(texture);
        }
        if self.in_flight.contains(&coord) {
            return LoadRequest::InFlight;
        }
        if self.queue.push(coord, priority) {
            trace!("Queued tile {coord} at priority {priority:.2}");
            LoadRequest::Queued
        } else {
            LoadRequest::AlreadyQueued
        }
    }

    /// Dispatch queued loads until the concurrency cap is reached.
    ///
    /// Returns the coordinates handed to workers.
    pub fn drain(&mut self) -> Vec<TileCoordinate> {
        let mut dispatched = Vec::new();
        let Some(sender) = &self.job_sender else {
            return dispatched;
        };
        while self.in_flight.len() < self.max_concurrent {
            let Some(coord) = self.queue.pop() else {
                break;
            };
            let job = FetchJob {
                coord,
                url: self.urls.url(&coord),
            };
            if sender.send(job).is_err() {
                warn!("Fetch workers are gone; dropping queued tile loads");
                self.queue.clear();
                break;
            }
            self.in_flight.insert(coord);
            dispatched.push(coord);
        }
        dispatched
    }

    /// Collect finished loads without blocking, cache the textures and refill the workers.
    pub fn poll(&mut self) -> Vec<LoadCompletion> {
        let mut completions = Vec::new();
        while let Ok(completion) = self.completion_receiver.try_recv() {
            completions.push(self.record(completion));
        }
        self.drain();
        completions
    }

    /// Like [`poll`](Self::poll), but waits up to `timeout` for the first completion.
    pub fn poll_timeout(&mut self, timeout: Duration) -> Vec<LoadCompletion> {
        if self.in_flight.is_empty() {
            self.drain();
        }
        let mut completions = Vec::new();
        match self.completion_receiver.recv_timeout(timeout) {
            Ok(completion) => completions.push(self.record(completion)),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
        }
        completions.extend(self.poll());
        completions
    }

    /// Recompute the priority of every queued load. In-flight loads are untouched.
    pub fn reprioritize(&mut self, priority_of: impl FnMut(&TileCoordinate) -> f64) {
        if !self.queue.is_empty() {
            debug!("Reprioritizing {} queued tile loads", self.queue.len());
            self.queue.reprioritize(priority_of);
        }
    }

    /// Drop a queued (not yet dispatched) load. Returns `true` if one was queued.
    pub fn cancel_pending(&mut self, coord: &TileCoordinate) -> bool {
        self.queue.remove(coord)
    }

    /// Whether a load for `coord` is queued or running.
    pub fn is_pending(&self, coord: &TileCoordinate) -> bool {
        self.queue.contains(coord) || self.in_flight.contains(coord)
    }

    /// Number of loads running.
    pub fn active_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of loads waiting for a slot.
    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// Whether no load is queued or running.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    /// The in-memory texture cache.
    pub fn cache(&self) -> &TextureCache {
        &self.cache
    }

    /// Cumulative counters.
    pub fn stats(&self) -> &LoadStats {
        &self.stats
    }

    /// Count a completion that arrived for a node that no longer exists.
    pub fn note_stale_completion(&mut self) {
        self.stats.stale_discarded += 1;
    }

    /// URL scheme used for network fetches.
    pub fn url_scheme(&self) -> &TileUrlScheme {
        &self.urls
    }

    /// Stop accepting work and join the workers once running fetches finish.
    ///
    /// Results of fetches that were running are discarded.
    pub fn shutdown(&mut self) {
        self.queue.clear();
        self.job_sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if !self.in_flight.is_empty() {
            debug!("Discarding {} tile loads running at shutdown", self.in_flight.len());
            self.in_flight.clear();
        }
        while self.completion_receiver.try_recv().is_ok() {}
    }

    fn record(&mut self, completion: LoadCompletion) -> LoadCompletion {
        self.in_flight.remove(&completion.coord);
        match &completion.result {
            Ok((texture, source)) => {
                match source {
                    TileSource::Store => self.stats.store_hits += 1,
                    TileSource::Network => self.stats.network_fetches += 1,
                }
                let evicted = self.cache.insert(completion.coord, texture.clone());
                self.stats.evictions += evicted.len() as u64;
                trace!(
                    "Tile {} loaded from {source:?} in {} ms",
                    completion.coord, completion.elapsed_ms
                );
            }
            Err(_) => self.stats.failures += 1,
        }
        completion
    }
}

impl Drop for TextureLoadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resolve one tile: persistent store first, then the network.
///
/// Only bytes that decode are written back to the store.
fn load_tile(
    job: &FetchJob,
    store: &PersistentTileStore,
    fetcher: &dyn TileFetcher,
    anisotropy: u16,
) -> Result<(TileTexture, TileSource), TileError> {
    if let Some(bytes) = store.get(&job.coord) {
        match decode_tile_image(&bytes) {
            Ok(image) => {
                let texture = TileTexture::new(job.coord, image, anisotropy);
                return Ok((texture, TileSource::Store));
            }
            Err(e) => warn!("Stored tile {} is unreadable, refetching: {e}", job.coord),
        }
    }

    let bytes = fetcher.fetch(&job.url)?;
    let image = decode_tile_image(&bytes)?;
    store.put(&job.coord, &bytes);
    Ok((TileTexture::new(job.coord, image, anisotropy), TileSource::Network))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreLocation;
    use crate::test_support::{StubFetcher, png_bytes};

    fn config(max_concurrent_loads: usize, max_cached_textures: usize) -> PlanetTileConfig {
        PlanetTileConfig {
            base_url: "http://tiles.invalid/mars".to_string(),
            extension: "png".to_string(),
            max_concurrent_loads,
            max_cached_textures,
            ..Default::default()
        }
    }

    fn coord(level: u8, column: u32, row: u32) -> TileCoordinate {
        TileCoordinate::new(level, column, row).unwrap()
    }

    fn memory_store() -> Arc<PersistentTileStore> {
        Arc::new(PersistentTileStore::open(StoreLocation::Memory))
    }

    fn run_until_idle(scheduler: &mut TextureLoadScheduler) -> Vec<LoadCompletion> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut completions = Vec::new();
        scheduler.drain();
        while !scheduler.is_idle() && Instant::now() < deadline {
            completions.extend(scheduler.poll_timeout(Duration::from_millis(50)));
        }
        completions
    }

    #[test]
    fn test_shutdown_with_running_loads_is_idle() {
        let fetcher = Arc::new(StubFetcher::serving_png().with_delay(Duration::from_millis(200)));
        let mut scheduler =
            TextureLoadScheduler::new(&config(2, 8), memory_store(), fetcher).unwrap();

        for column in 0..4 {
            scheduler.request(coord(2, column, 0), 1.0);
        }
        assert_eq!(scheduler.drain().len(), 2);
        assert_eq!(scheduler.active_count(), 2);

        scheduler.shutdown();
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.active_count(), 0);
        assert!(scheduler.poll().is_empty());
        assert!(scheduler.drain().is_empty());
    }

    #[test]
    fn test_network_load_populates_cache_and_store() {
        let store = memory_store();
        let fetcher = Arc::new(StubFetcher::serving_png());
        let mut scheduler =
            TextureLoadScheduler::new(&config(4, 8), Arc::clone(&store), fetcher.clone()).unwrap();

        let c = coord(2, 3, 1);
        assert!(matches!(scheduler.request(c, 1.0), LoadRequest::Queued));
        let completions = run_until_idle(&mut scheduler);

        assert_eq!(completions.len(), 1);
        let (texture, source) = completions[0].result.as_ref().unwrap();
        assert_eq!(*source, TileSource::Network);
        assert_eq!(texture.coord(), c);
        assert!(scheduler.cache().contains(&c));
        assert!(store.contains(&c));
        assert_eq!(fetcher.calls(), 1);

        // Second request is a cache hit.
        assert!(matches!(scheduler.request(c, 1.0), LoadRequest::Cached(_)));
        assert_eq!(scheduler.stats().cache_hits, 1);
    }

    #[test]
    fn test_store_hit_skips_network() {
        let store = memory_store();
        let c = coord(1, 2, 0);
        store.put(&c, &png_bytes(2, 2, [1, 2, 3, 255]));
        let fetcher = Arc::new(StubFetcher::not_found());
        let mut scheduler =
            TextureLoadScheduler::new(&config(2, 8), store, fetcher.clone()).unwrap();

        scheduler.request(c, 0.0);
        let completions = run_until_idle(&mut scheduler);
        assert!(matches!(
            completions[0].result,
            Ok((_, TileSource::Store))
        ));
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(scheduler.stats().store_hits, 1);
    }

    #[test]
    fn test_corrupt_store_record_is_refetched() {
        let store = memory_store();
        let c = coord(1, 0, 1);
        store.put(&c, b"not an image");
        let fetcher = Arc::new(StubFetcher::serving_png());
        let mut scheduler =
            TextureLoadScheduler::new(&config(2, 8), Arc::clone(&store), fetcher.clone()).unwrap();

        scheduler.request(c, 0.0);
        let completions = run_until_idle(&mut scheduler);
        assert!(matches!(
            completions[0].result,
            Ok((_, TileSource::Network))
        ));
        assert!(decode_tile_image(&store.get(&c).unwrap()).is_ok());
    }

    #[test]
    fn test_failure_is_reported_and_not_cached() {
        let store = memory_store();
        let fetcher = Arc::new(StubFetcher::not_found());
        let mut scheduler = TextureLoadScheduler::new(&config(2, 8), Arc::clone(&store), fetcher).unwrap();

        let c = coord(1, 1, 1);
        scheduler.request(c, 0.0);
        let completions = run_until_idle(&mut scheduler);
        assert!(matches!(
            completions[0].result,
            Err(TileError::HttpStatus { status: 404, .. })
        ));
        assert!(!scheduler.cache().contains(&c));
        assert!(!store.contains(&c));
        assert_eq!(scheduler.stats().failures, 1);

        // No automatic retry, but a new request is accepted.
        assert!(scheduler.is_idle());
        assert!(matches!(scheduler.request(c, 0.0), LoadRequest::Queued));
    }

    #[test]
    fn test_undecodable_network_bytes_fail() {
        let store = memory_store();
        let fetcher = Arc::new(StubFetcher::new(|_| Ok(b"<html>rate limited</html>".to_vec())));
        let mut scheduler = TextureLoadScheduler::new(&config(1, 8), Arc::clone(&store), fetcher).unwrap();

        let c = coord(1, 0, 0);
        scheduler.request(c, 0.0);
        let completions = run_until_idle(&mut scheduler);
        assert!(matches!(completions[0].result, Err(TileError::Decode(_))));
        assert!(!store.contains(&c));
    }

    #[test]
    fn test_duplicate_requests_are_deduplicated() {
        let fetcher = Arc::new(StubFetcher::serving_png().with_delay(Duration::from_millis(100)));
        let mut scheduler =
            TextureLoadScheduler::new(&config(1, 8), memory_store(), fetcher.clone()).unwrap();

        let (a, b) = (coord(2, 0, 0), coord(2, 1, 0));
        assert!(matches!(scheduler.request(a, 1.0), LoadRequest::Queued));
        assert!(matches!(scheduler.request(b, 2.0), LoadRequest::Queued));
        assert!(matches!(scheduler.request(b, 0.5), LoadRequest::AlreadyQueued));

        assert_eq!(scheduler.drain(), vec![a]);
        assert!(matches!(scheduler.request(a, 1.0), LoadRequest::InFlight));

        run_until_idle(&mut scheduler);
        assert_eq!(fetcher.calls(), 2);
    }

    #[test]
    fn test_burst_never_exceeds_cap() {
        let fetcher = Arc::new(StubFetcher::serving_png().with_delay(Duration::from_millis(20)));
        let mut scheduler =
            TextureLoadScheduler::new(&config(20, 128), memory_store(), fetcher.clone()).unwrap();

        let coords: Vec<_> = TileCoordinate::level_tiles(3).take(50).collect();
        for (i, c) in coords.iter().enumerate() {
            scheduler.request(*c, i as f64);
        }
        let dispatched = scheduler.drain();
        assert_eq!(dispatched.len(), 20);
        assert_eq!(dispatched[0], coords[0]);
        assert_eq!(scheduler.active_count(), 20);
        assert_eq!(scheduler.queued_count(), 30);

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut done = 0;
        while !scheduler.is_idle() && Instant::now() < deadline {
            done += scheduler.poll_timeout(Duration::from_millis(20)).len();
            assert!(scheduler.active_count() <= 20);
        }
        assert_eq!(done, 50);
        assert!(fetcher.peak_active() <= 20);
    }

    #[test]
    fn test_cancel_pending_only_touches_queue() {
        let fetcher = Arc::new(StubFetcher::serving_png().with_delay(Duration::from_millis(50)));
        let mut scheduler =
            TextureLoadScheduler::new(&config(1, 8), memory_store(), fetcher.clone()).unwrap();

        let (a, b) = (coord(2, 0, 0), coord(2, 1, 0));
        scheduler.request(a, 1.0);
        scheduler.request(b, 2.0);
        scheduler.drain();

        assert!(!scheduler.cancel_pending(&a));
        assert!(scheduler.cancel_pending(&b));
        assert!(!scheduler.is_pending(&b));
        assert!(scheduler.is_pending(&a));

        let completions = run_until_idle(&mut scheduler);
        assert_eq!(completions.len(), 1);
        assert_eq!(fetcher.calls(), 1);
    }

    #[test]
    fn test_reprioritize_changes_dispatch_order() {
        let fetcher = Arc::new(StubFetcher::serving_png());
        let mut scheduler =
            TextureLoadScheduler::new(&config(1, 8), memory_store(), fetcher).unwrap();

        let (a, b) = (coord(2, 0, 0), coord(2, 5, 0));
        scheduler.request(a, 1.0);
        scheduler.request(b, 2.0);
        scheduler.reprioritize(|c| if *c == b { 0.0 } else { 10.0 });
        assert_eq!(scheduler.drain(), vec![b]);
    }

    #[test]
    fn test_cache_eviction_counted() {
        let fetcher = Arc::new(StubFetcher::serving_png());
        let mut scheduler =
            TextureLoadScheduler::new(&config(4, 2), memory_store(), fetcher).unwrap();

        for c in TileCoordinate::level_tiles(2).take(3) {
            scheduler.request(c, 0.0);
        }
        run_until_idle(&mut scheduler);
        assert_eq!(scheduler.cache().len(), 2);
        assert_eq!(scheduler.stats().evictions, 1);
    }

    #[test]
    fn test_shutdown_stops_dispatch() {
        let fetcher = Arc::new(StubFetcher::serving_png());
        let mut scheduler =
            TextureLoadScheduler::new(&config(2, 8), memory_store(), fetcher.clone()).unwrap();
        scheduler.shutdown();
        scheduler.request(coord(1, 0, 0), 0.0);
        assert!(scheduler.drain().is_empty());
        assert_eq!(fetcher.calls(), 0);
    }
}
