//! Quadtree streaming of planet imagery tiles: addressing, geometry, texture
//! loading with a durable store, and the per-frame visibility walk.

pub mod coord;
pub mod error;
pub mod fetch;
pub mod geometry;
pub mod manager;
pub mod prefetch;
pub mod queue;
pub mod render;
pub mod scheduler;
pub mod store;
pub mod texture;
pub mod tree;
pub mod visibility;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use coord::{TileBounds, TileCoordinate, lon_lat_to_unit, unit_to_lon_lat};
pub use error::{CoordinateError, TileError};
pub use fetch::{HttpTileFetcher, TileFetcher, TileUrlScheme};
pub use geometry::{GeometryParams, TileGeometry, build_tile_geometry, segments_for_level};
pub use manager::{FrameStats, PlanetTileManager};
pub use prefetch::{PrefetchReport, prefetch_levels};
pub use queue::LoadQueue;
pub use render::{MeshId, MeshRecord, RenderGroup, TileRenderer};
pub use scheduler::{LoadCompletion, LoadRequest, LoadStats, TextureLoadScheduler, TileSource};
pub use store::{
    DiskBackend, MemoryBackend, PersistentTileStore, StoreBackend, StoreError, StoreLocation,
    StoreMetadata,
};
pub use texture::{TextureCache, TileImage, TileTexture, decode_tile_image};
pub use tree::{LoadState, TileNode, TileTree};
pub use visibility::{CameraState, TileVisibility, VisibilityDriver};
pub use worker::{GeometryWorker, WorkerRequest, WorkerResponse};
