//! Persistent cross-session tile store.
//!
//! Raw tile bytes are kept keyed by `"L/C/R"` with no expiry. The store is
//! shared by the fetch workers and must never take the frame loop down: a
//! medium that cannot be opened leaves the store in an always-miss state and
//! write failures are logged and swallowed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::coord::TileCoordinate;

/// Current on-disk layout version.
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Name of the metadata record inside a disk store.
pub const METADATA_FILE: &str = "meta.ron";

const TILE_EXTENSION: &str = "tile";

/// Disk metadata is rewritten after this many new records.
const METADATA_FLUSH_INTERVAL: u64 = 64;

/// Errors reported by store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("tile store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The metadata record could not be parsed.
    #[error("corrupt tile store metadata: {0}")]
    Metadata(#[from] ron::error::SpannedError),

    /// The metadata record could not be serialized.
    #[error("failed to serialize tile store metadata: {0}")]
    MetadataWrite(#[from] ron::Error),

    /// The store was never opened or has been closed.
    #[error("tile store is closed")]
    Closed,
}

/// Bookkeeping record kept alongside the tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    /// Layout version the store was written with.
    pub version: u32,
    /// Creation time, seconds since the Unix epoch.
    pub created_at_unix: u64,
    /// Number of distinct tiles stored.
    pub record_count: u64,
}

impl StoreMetadata {
    fn fresh() -> Self {
        Self {
            version: STORE_FORMAT_VERSION,
            created_at_unix: unix_now(),
            record_count: 0,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A key→blob medium backing [`PersistentTileStore`].
pub trait StoreBackend: Send + Sync {
    /// Bytes stored for `coord`, if any.
    fn get(&self, coord: &TileCoordinate) -> Result<Option<Vec<u8>>, StoreError>;
    /// Store `bytes` for `coord`, replacing any previous record.
    fn put(&self, coord: &TileCoordinate, bytes: &[u8]) -> Result<(), StoreError>;
    /// Whether a record exists for `coord`.
    fn contains(&self, coord: &TileCoordinate) -> Result<bool, StoreError>;
    /// Remove every record.
    fn clear(&self) -> Result<(), StoreError>;
    /// Current metadata.
    fn metadata(&self) -> StoreMetadata;
    /// Persist any buffered bookkeeping.
    fn flush(&self) -> Result<(), StoreError>;
}

// --- Disk backend ---

/// Directory-backed store: one file per tile at `<root>/<L>/<C>/<R>.tile`.
pub struct DiskBackend {
    root: PathBuf,
    metadata: Mutex<StoreMetadata>,
    unflushed: AtomicU64,
    tmp_counter: AtomicU64,
}

impl DiskBackend {
    /// Open (or create) a store rooted at `root`.
    ///
    /// A missing or unreadable metadata record is rebuilt by counting the tiles present.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let meta_path = root.join(METADATA_FILE);
        let metadata = match std::fs::read_to_string(&meta_path) {
            Ok(contents) => match ron::from_str::<StoreMetadata>(&contents) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("Rebuilding tile store metadata at {}: {e}", root.display());
                    StoreMetadata {
                        record_count: count_records(&root)?,
                        ..StoreMetadata::fresh()
                    }
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreMetadata {
                record_count: count_records(&root)?,
                ..StoreMetadata::fresh()
            },
            Err(e) => return Err(e.into()),
        };

        let backend = Self {
            root,
            metadata: Mutex::new(metadata),
            unflushed: AtomicU64::new(0),
            tmp_counter: AtomicU64::new(0),
        };
        backend.write_metadata(&metadata)?;
        Ok(backend)
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tile_path(&self, coord: &TileCoordinate) -> PathBuf {
        self.root
            .join(coord.level().to_string())
            .join(coord.column().to_string())
            .join(format!("{}.{TILE_EXTENSION}", coord.row()))
    }

    fn write_metadata(&self, metadata: &StoreMetadata) -> Result<(), StoreError> {
        let serialized = ron::ser::to_string_pretty(metadata, ron::ser::PrettyConfig::new())?;
        std::fs::write(self.root.join(METADATA_FILE), serialized)?;
        Ok(())
    }

    fn lock_metadata(&self) -> std::sync::MutexGuard<'_, StoreMetadata> {
        self.metadata.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StoreBackend for DiskBackend {
    fn get(&self, coord: &TileCoordinate) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(self.tile_path(coord)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, coord: &TileCoordinate, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.tile_path(coord);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let existed = path.exists();

        // Readers must never observe a half-written tile.
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("{TILE_EXTENSION}.{n}.tmp"));
        std::fs::write(&tmp, bytes)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }

        if !existed {
            let snapshot = {
                let mut metadata = self.lock_metadata();
                metadata.record_count += 1;
                *metadata
            };
            if self.unflushed.fetch_add(1, Ordering::Relaxed) + 1 >= METADATA_FLUSH_INTERVAL {
                self.unflushed.store(0, Ordering::Relaxed);
                self.write_metadata(&snapshot)?;
            }
        }
        Ok(())
    }

    fn contains(&self, coord: &TileCoordinate) -> Result<bool, StoreError> {
        Ok(self.tile_path(coord).try_exists()?)
    }

    fn clear(&self) -> Result<(), StoreError> {
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
            }
        }
        let fresh = StoreMetadata::fresh();
        *self.lock_metadata() = fresh;
        self.unflushed.store(0, Ordering::Relaxed);
        self.write_metadata(&fresh)
    }

    fn metadata(&self) -> StoreMetadata {
        *self.lock_metadata()
    }

    fn flush(&self) -> Result<(), StoreError> {
        let snapshot = *self.lock_metadata();
        self.unflushed.store(0, Ordering::Relaxed);
        self.write_metadata(&snapshot)
    }
}

/// Count `*.tile` files below `root`.
fn count_records(root: &Path) -> Result<u64, StoreError> {
    let mut count = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == TILE_EXTENSION) {
                count += 1;
            }
        }
    }
    Ok(count)
}

// --- Memory backend ---

/// Process-local store, used for tests and when no cache directory is wanted.
pub struct MemoryBackend {
    tiles: DashMap<TileCoordinate, Vec<u8>>,
    created_at_unix: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self {
            tiles: DashMap::new(),
            created_at_unix: AtomicU64::new(unix_now()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBackend for MemoryBackend {
    fn get(&self, coord: &TileCoordinate) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tiles.get(coord).map(|bytes| bytes.value().clone()))
    }

    fn put(&self, coord: &TileCoordinate, bytes: &[u8]) -> Result<(), StoreError> {
        self.tiles.insert(*coord, bytes.to_vec());
        Ok(())
    }

    fn contains(&self, coord: &TileCoordinate) -> Result<bool, StoreError> {
        Ok(self.tiles.contains_key(coord))
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.tiles.clear();
        self.created_at_unix.store(unix_now(), Ordering::Relaxed);
        Ok(())
    }

    fn metadata(&self) -> StoreMetadata {
        StoreMetadata {
            version: STORE_FORMAT_VERSION,
            created_at_unix: self.created_at_unix.load(Ordering::Relaxed),
            record_count: self.tiles.len() as u64,
        }
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// --- Store facade ---

/// Where a [`PersistentTileStore`] keeps its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// A directory on disk.
    Disk(PathBuf),
    /// Process memory; nothing survives a restart.
    Memory,
    /// No store; every lookup misses.
    Disabled,
}

impl StoreLocation {
    /// Location derived from a resolved cache directory (`None` disables the store).
    pub fn from_cache_dir(dir: Option<PathBuf>) -> Self {
        dir.map_or(Self::Disabled, Self::Disk)
    }
}

/// Durable tile store shared between the frame thread and fetch workers.
pub struct PersistentTileStore {
    backend: RwLock<Option<Box<dyn StoreBackend>>>,
}

impl PersistentTileStore {
    /// Open the store at `location`.
    ///
    /// Never fails: if the medium cannot be opened the store stays unavailable
    /// and every lookup misses.
    pub fn open(location: StoreLocation) -> Self {
        let backend: Option<Box<dyn StoreBackend>> = match location {
            StoreLocation::Disk(root) => match DiskBackend::open(&root) {
                Ok(backend) => {
                    info!(
                        "Opened tile store at {} ({} records)",
                        root.display(),
                        backend.metadata().record_count
                    );
                    Some(Box::new(backend))
                }
                Err(e) => {
                    warn!(
                        "Tile store at {} unavailable, continuing network-only: {e}",
                        root.display()
                    );
                    None
                }
            },
            StoreLocation::Memory => Some(Box::new(MemoryBackend::new())),
            StoreLocation::Disabled => {
                debug!("Tile store disabled");
                None
            }
        };
        Self {
            backend: RwLock::new(backend),
        }
    }

    /// Wrap an already constructed backend.
    pub fn with_backend(backend: Box<dyn StoreBackend>) -> Self {
        Self {
            backend: RwLock::new(Some(backend)),
        }
    }

    /// A store that misses on every lookup.
    pub fn unavailable() -> Self {
        Self {
            backend: RwLock::new(None),
        }
    }

    /// Whether a backend is open.
    pub fn is_available(&self) -> bool {
        self.read_backend().is_some()
    }

    /// Look up `coord`, reporting backend failures.
    pub fn try_get(&self, coord: &TileCoordinate) -> Result<Option<Vec<u8>>, StoreError> {
        match self.read_backend().as_deref() {
            Some(backend) => backend.get(coord),
            None => Err(StoreError::Closed),
        }
    }

    /// Look up `coord`. Failures and an unavailable store read as a miss.
    pub fn get(&self, coord: &TileCoordinate) -> Option<Vec<u8>> {
        match self.try_get(coord) {
            Ok(bytes) => bytes,
            Err(StoreError::Closed) => None,
            Err(e) => {
                warn!("Tile store read of {coord} failed: {e}");
                None
            }
        }
    }

    /// Store `bytes` for `coord`. Failures are logged, never returned.
    pub fn put(&self, coord: &TileCoordinate, bytes: &[u8]) {
        if let Some(backend) = self.read_backend().as_deref()
            && let Err(e) = backend.put(coord, bytes)
        {
            warn!("Tile store write of {coord} failed: {e}");
        }
    }

    /// Whether a record exists for `coord`.
    pub fn contains(&self, coord: &TileCoordinate) -> bool {
        match self.read_backend().as_deref() {
            Some(backend) => backend.contains(coord).unwrap_or(false),
            None => false,
        }
    }

    /// Remove every record.
    pub fn clear(&self) -> Result<(), StoreError> {
        match self.read_backend().as_deref() {
            Some(backend) => {
                backend.clear()?;
                info!("Cleared tile store");
                Ok(())
            }
            None => Err(StoreError::Closed),
        }
    }

    /// Metadata of the open backend.
    pub fn metadata(&self) -> Option<StoreMetadata> {
        self.read_backend().as_deref().map(|backend| backend.metadata())
    }

    /// Flush and detach the backend. Later lookups miss.
    pub fn close(&self) {
        let backend = self
            .backend
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(backend) = backend
            && let Err(e) = backend.flush()
        {
            warn!("Failed to flush tile store on close: {e}");
        }
    }

    fn read_backend(&self) -> std::sync::RwLockReadGuard<'_, Option<Box<dyn StoreBackend>>> {
        self.backend.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for PersistentTileStore {
    fn drop(&mut self) {
        self.close();
    }
}
