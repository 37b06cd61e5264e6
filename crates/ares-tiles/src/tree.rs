//! Quadtree nodes keyed by tile coordinate.
//!
//! The tree owns every node in a flat coordinate map; parent and child links
//! are coordinates into that map, so removing a subtree never leaves dangling
//! references behind.

use std::ops::Index;

use glam::DVec3;
use rustc_hash::FxHashMap;

use crate::coord::TileCoordinate;
use crate::render::MeshId;

/// Texture load progress of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadState {
    /// No load has been requested yet.
    Unrequested,
    /// A load is queued or in flight.
    Loading,
    /// The texture has been applied to the mesh.
    Loaded,
    /// The last load failed; the next visibility pass retries it.
    Failed,
}

impl LoadState {
    /// Whether a (re)load should be requested.
    pub fn needs_request(self) -> bool {
        matches!(self, LoadState::Unrequested | LoadState::Failed)
    }
}

/// One tile of the quadtree.
#[derive(Debug, Clone)]
pub struct TileNode {
    /// Address of the tile.
    pub coord: TileCoordinate,
    /// Tile center on the sphere surface, in planet space.
    pub center: DVec3,
    /// Mesh handle; `None` until geometry built off-thread has arrived.
    pub mesh: Option<MeshId>,
    /// Texture load progress.
    pub state: LoadState,
    /// Parent node, `None` for roots.
    pub parent: Option<TileCoordinate>,
    /// The four children, when subdivided.
    pub children: Option<[TileCoordinate; 4]>,
    /// Whether the mesh is currently shown.
    pub visible: bool,
}

impl TileNode {
    /// A fresh node with no mesh and no children.
    pub fn new(coord: TileCoordinate, radius: f64, parent: Option<TileCoordinate>) -> Self {
        Self {
            coord,
            center: coord.center_direction() * radius,
            mesh: None,
            state: LoadState::Unrequested,
            parent,
            children: None,
            visible: false,
        }
    }

    /// Whether the node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// Whether the node's texture is applied.
    pub fn is_loaded(&self) -> bool {
        self.state == LoadState::Loaded
    }
}

/// Coordinate-keyed storage of every live node.
#[derive(Default)]
pub struct TileTree {
    nodes: FxHashMap<TileCoordinate, TileNode>,
    roots: Vec<TileCoordinate>,
}

impl TileTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node`. Nodes without a parent become roots.
    ///
    /// Replaces any node already stored under the same coordinate.
    pub fn insert(&mut self, node: TileNode) {
        if node.parent.is_none() && !self.roots.contains(&node.coord) {
            self.roots.push(node.coord);
        }
        self.nodes.insert(node.coord, node);
    }

    /// The node at `coord`.
    pub fn get(&self, coord: &TileCoordinate) -> Option<&TileNode> {
        self.nodes.get(coord)
    }

    /// Mutable access to the node at `coord`.
    pub fn get_mut(&mut self, coord: &TileCoordinate) -> Option<&mut TileNode> {
        self.nodes.get_mut(coord)
    }

    /// Whether a node exists at `coord`.
    pub fn contains(&self, coord: &TileCoordinate) -> bool {
        self.nodes.contains_key(coord)
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Root coordinates in insertion order.
    pub fn roots(&self) -> &[TileCoordinate] {
        &self.roots
    }

    /// Iterate over every live node.
    pub fn iter(&self) -> impl Iterator<Item = &TileNode> {
        self.nodes.values()
    }

    /// Coordinates of every live node.
    pub fn coords(&self) -> Vec<TileCoordinate> {
        self.nodes.keys().copied().collect()
    }

    /// Remove every descendant of `coord`, returning them; `coord` becomes a leaf.
    pub fn detach_descendants(&mut self, coord: &TileCoordinate) -> Vec<TileNode> {
        let Some(children) = self.nodes.get_mut(coord).and_then(|node| node.children.take())
        else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        let mut pending: Vec<TileCoordinate> = children.to_vec();
        while let Some(next) = pending.pop() {
            if let Some(node) = self.nodes.remove(&next) {
                if let Some(grandchildren) = node.children {
                    pending.extend_from_slice(&grandchildren);
                }
                removed.push(node);
            }
        }
        removed
    }

    /// Whether `parent` is tracked and lists `child` among its children.
    pub fn is_linked(&self, parent: &TileCoordinate, child: &TileCoordinate) -> bool {
        self.nodes
            .get(parent)
            .and_then(|node| node.children)
            .is_some_and(|children| children.contains(child))
    }

    /// Remove `coord` and all its descendants, unlinking it from its parent.
    ///
    /// A parent left with a partial child set is turned back into a leaf and
    /// its remaining children are returned as well. A node its parent does not
    /// list is removed on its own.
    pub fn remove_subtree(&mut self, coord: &TileCoordinate) -> Vec<TileNode> {
        let Some(parent) = self.nodes.get(coord).map(|node| node.parent) else {
            return Vec::new();
        };
        if let Some(parent) = parent
            && self.is_linked(&parent, coord)
        {
            return self.detach_descendants(&parent);
        }

        let mut removed = self.detach_descendants(coord);
        if let Some(node) = self.nodes.remove(coord) {
            removed.push(node);
        }
        self.roots.retain(|root| root != coord);
        removed
    }

    /// Coordinates from `coord`'s parent up to its root.
    pub fn ancestors(&self, coord: &TileCoordinate) -> Vec<TileCoordinate> {
        let mut out = Vec::new();
        let mut current = self.nodes.get(coord).and_then(|node| node.parent);
        while let Some(parent) = current {
            out.push(parent);
            current = self.nodes.get(&parent).and_then(|node| node.parent);
        }
        out
    }
}

impl Index<&TileCoordinate> for TileTree {
    type Output = TileNode;

    fn index(&self, coord: &TileCoordinate) -> &TileNode {
        &self.nodes[coord]
    }
}
