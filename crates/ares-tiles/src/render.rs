//! The render sink tiles are handed to, and an in-memory implementation.
//!
//! The tile engine never touches GPU state itself. It creates one mesh per
//! tile node, toggles its visibility, swaps in textures as they arrive and
//! disposes it when the node is pruned.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::coord::TileCoordinate;
use crate::geometry::TileGeometry;
use crate::texture::TileTexture;

/// Handle to a mesh owned by a [`TileRenderer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u64);

/// Mesh lifecycle operations the tile engine needs from a renderer.
///
/// All calls happen on the frame thread. Calls with an unknown or already
/// disposed [`MeshId`] must be ignored.
pub trait TileRenderer {
    /// Create a hidden mesh with placeholder appearance for `coord`.
    fn create_mesh(&mut self, coord: TileCoordinate, geometry: &TileGeometry) -> MeshId;
    /// Show or hide a mesh.
    fn set_visible(&mut self, mesh: MeshId, visible: bool);
    /// Replace the mesh's texture.
    fn apply_texture(&mut self, mesh: MeshId, texture: TileTexture);
    /// Free the mesh and its GPU resources.
    fn dispose_mesh(&mut self, mesh: MeshId);
}

/// A mesh tracked by [`RenderGroup`].
#[derive(Debug)]
pub struct MeshRecord {
    /// Tile the mesh was created for.
    pub coord: TileCoordinate,
    /// Whether the mesh is drawn.
    pub visible: bool,
    /// Applied texture, `None` while the placeholder is shown.
    pub texture: Option<TileTexture>,
    /// Triangles in the geometry, skirts included.
    pub triangle_count: usize,
}

/// Headless [`TileRenderer`] keeping mesh state in a map.
///
/// Used by the command-line descent simulation and by tests to observe
/// exactly what the engine asked a renderer to do.
#[derive(Default)]
pub struct RenderGroup {
    meshes: FxHashMap<MeshId, MeshRecord>,
    next_id: u64,
    created: u64,
    disposed: u64,
}

impl RenderGroup {
    /// Create an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// The record for `mesh`, if it is alive.
    pub fn mesh(&self, mesh: MeshId) -> Option<&MeshRecord> {
        self.meshes.get(&mesh)
    }

    /// Number of live meshes.
    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    /// Whether no mesh is alive.
    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }

    /// Number of visible meshes.
    pub fn visible_count(&self) -> usize {
        self.meshes.values().filter(|m| m.visible).count()
    }

    /// Coordinates of visible meshes, sorted.
    pub fn visible_coords(&self) -> Vec<TileCoordinate> {
        let mut coords: Vec<_> = self
            .meshes
            .values()
            .filter(|m| m.visible)
            .map(|m| m.coord)
            .collect();
        coords.sort_unstable();
        coords
    }

    /// Whether a live mesh exists for `coord`.
    pub fn contains_coord(&self, coord: &TileCoordinate) -> bool {
        self.meshes.values().any(|m| m.coord == *coord)
    }

    /// Triangles across all visible meshes.
    pub fn visible_triangles(&self) -> usize {
        self.meshes
            .values()
            .filter(|m| m.visible)
            .map(|m| m.triangle_count)
            .sum()
    }

    /// Meshes created over the group's lifetime.
    pub fn created_count(&self) -> u64 {
        self.created
    }

    /// Meshes disposed over the group's lifetime.
    pub fn disposed_count(&self) -> u64 {
        self.disposed
    }
}

impl TileRenderer for RenderGroup {
    fn create_mesh(&mut self, coord: TileCoordinate, geometry: &TileGeometry) -> MeshId {
        let id = MeshId(self.next_id);
        self.next_id += 1;
        self.created += 1;
        self.meshes.insert(
            id,
            MeshRecord {
                coord,
                visible: false,
                texture: None,
                triangle_count: geometry.triangle_count(),
            },
        );
        id
    }

    fn set_visible(&mut self, mesh: MeshId, visible: bool) {
        match self.meshes.get_mut(&mesh) {
            Some(record) => record.visible = visible,
            None => debug!("set_visible on unknown mesh {mesh:?}"),
        }
    }

    fn apply_texture(&mut self, mesh: MeshId, texture: TileTexture) {
        match self.meshes.get_mut(&mesh) {
            Some(record) => record.texture = Some(texture),
            None => debug!("apply_texture on unknown mesh {mesh:?}"),
        }
    }

    fn dispose_mesh(&mut self, mesh: MeshId) {
        if self.meshes.remove(&mesh).is_some() {
            self.disposed += 1;
        } else {
            debug!("dispose of unknown mesh {mesh:?}");
        }
    }
}
