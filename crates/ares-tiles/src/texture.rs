//! Decoded tile textures and the bounded in-memory texture cache.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::coord::TileCoordinate;
use crate::error::TileError;

/// A decoded RGBA8 tile image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Tightly packed RGBA8 pixels, row-major from the top-left.
    pub rgba: Vec<u8>,
}

/// Decode PNG or JPEG tile bytes into RGBA8 pixels.
pub fn decode_tile_image(bytes: &[u8]) -> Result<TileImage, TileError> {
    let image = image::load_from_memory(bytes)?.to_rgba8();
    let (width, height) = image.dimensions();
    Ok(TileImage {
        width,
        height,
        rgba: image.into_raw(),
    })
}

#[derive(Debug)]
struct TextureData {
    coord: TileCoordinate,
    image: TileImage,
    anisotropy: u16,
}

/// Shared handle to a decoded tile texture.
///
/// Cloning is cheap; the pixel data is freed when the last handle (cache
/// entry or mesh) is dropped.
#[derive(Clone, Debug)]
pub struct TileTexture(Arc<TextureData>);

impl TileTexture {
    /// Wrap a decoded image for `coord`.
    pub fn new(coord: TileCoordinate, image: TileImage, anisotropy: u16) -> Self {
        Self(Arc::new(TextureData {
            coord,
            image,
            anisotropy,
        }))
    }

    /// Tile this texture was loaded for.
    pub fn coord(&self) -> TileCoordinate {
        self.0.coord
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.0.image.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.0.image.height
    }

    /// RGBA8 pixel data.
    pub fn pixels(&self) -> &[u8] {
        &self.0.image.rgba
    }

    /// Anisotropic filtering level requested for sampling.
    pub fn anisotropy(&self) -> u16 {
        self.0.anisotropy
    }

    /// Number of live handles to this texture.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Whether both handles point at the same texture.
    pub fn ptr_eq(&self, other: &TileTexture) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Bounded map from tile coordinate to texture.
///
/// Entries are evicted in insertion order once the capacity is exceeded.
/// Lookups do not refresh an entry's position.
pub struct TextureCache {
    capacity: usize,
    entries: FxHashMap<TileCoordinate, TileTexture>,
    order: VecDeque<TileCoordinate>,
}

impl TextureCache {
    /// Create an empty cache holding at most `capacity` textures (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: FxHashMap::default(),
            order: VecDeque::with_capacity(capacity + 1),
        }
    }

    /// A clone of the cached texture for `coord`.
    pub fn get(&self, coord: &TileCoordinate) -> Option<TileTexture> {
        self.entries.get(coord).cloned()
    }

    /// Whether `coord` is cached.
    pub fn contains(&self, coord: &TileCoordinate) -> bool {
        self.entries.contains_key(coord)
    }

    /// Insert a texture, returning the coordinates evicted to stay within capacity.
    ///
    /// Re-inserting a coordinate replaces its texture and makes it the newest entry.
    pub fn insert(&mut self, coord: TileCoordinate, texture: TileTexture) -> Vec<TileCoordinate> {
        if self.entries.insert(coord, texture).is_some() {
            self.order.retain(|c| *c != coord);
        }
        self.order.push_back(coord);

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }

    /// Drop the cache's handle for `coord`.
    pub fn remove(&mut self, coord: &TileCoordinate) -> Option<TileTexture> {
        let texture = self.entries.remove(coord)?;
        self.order.retain(|c| c != coord);
        Some(texture)
    }

    /// Number of cached textures.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of textures kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every cached handle.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
