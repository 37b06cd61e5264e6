//! The planet tile manager: quadtree, texture scheduling and the render sink
//! for one planet, driven once per frame by [`PlanetTileManager::update`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use ares_config::PlanetTileConfig;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::coord::TileCoordinate;
use crate::error::TileError;
use crate::fetch::TileFetcher;
use crate::geometry::{GeometryParams, TileGeometry, build_tile_geometry, segments_for_level};
use crate::render::TileRenderer;
use crate::scheduler::{LoadCompletion, LoadRequest, LoadStats, TextureLoadScheduler};
use crate::store::PersistentTileStore;
use crate::texture::TileTexture;
use crate::tree::{LoadState, TileNode, TileTree};
use crate::visibility::{CameraState, VisibilityDriver, VisibilityPass};
use crate::worker::{GeometryWorker, WorkerRequest, WorkerResponse};

/// Per-frame summary returned by [`PlanetTileManager::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frame number, starting at 1.
    pub frame: u64,
    /// Nodes in the tree.
    pub tracked_nodes: usize,
    /// Nodes whose mesh is shown.
    pub visible_meshes: usize,
    /// Leaves selected for drawing.
    pub desired: usize,
    /// Leaves selected for drawing whose texture is applied.
    pub desired_loaded: usize,
    /// Nodes culled as back-facing.
    pub culled: usize,
    /// Nodes split this frame.
    pub subdivisions: usize,
    /// Nodes whose descendants were dropped this frame.
    pub prunes: usize,
    /// Loads waiting for a slot.
    pub queued_loads: usize,
    /// Loads running.
    pub in_flight_loads: usize,
    /// Textures held by the cache.
    pub cached_textures: usize,
    /// Deepest level among the drawn leaves.
    pub max_visible_level: Option<u8>,
}

/// Streams imagery tiles for one planet.
pub struct PlanetTileManager<R: TileRenderer> {
    pub(crate) config: PlanetTileConfig,
    pub(crate) driver: VisibilityDriver,
    pub(crate) tree: TileTree,
    pub(crate) scheduler: TextureLoadScheduler,
    pub(crate) renderer: R,
    geometry: Option<GeometryWorker>,
    /// Outstanding geometry requests and the tiles they build.
    pending_geometry: FxHashMap<u64, Vec<TileCoordinate>>,
    next_request_id: u64,
    camera: Option<CameraState>,
    /// Camera the load queue was last sorted for.
    prioritized_camera: Option<CameraState>,
    frame: u64,
    frame_subdivisions: usize,
    frame_prunes: usize,
}

impl<R: TileRenderer> PlanetTileManager<R> {
    /// Create the manager and its root tiles (every tile of `config.min_level`).
    pub fn new(
        config: &PlanetTileConfig,
        renderer: R,
        store: Arc<PersistentTileStore>,
        fetcher: Arc<dyn TileFetcher>,
    ) -> Result<Self, TileError> {
        config.validate()?;
        let scheduler = TextureLoadScheduler::new(config, store, fetcher)?;
        let geometry = if config.offload_geometry {
            Some(GeometryWorker::with_defaults()?)
        } else {
            None
        };

        let mut manager = Self {
            config: config.clone(),
            driver: VisibilityDriver::from_config(config),
            tree: TileTree::new(),
            scheduler,
            renderer,
            geometry,
            pending_geometry: FxHashMap::default(),
            next_request_id: 0,
            camera: None,
            prioritized_camera: None,
            frame: 0,
            frame_subdivisions: 0,
            frame_prunes: 0,
        };

        let roots: Vec<TileCoordinate> = TileCoordinate::level_tiles(config.min_level).collect();
        manager.create_nodes(&roots, None);
        info!(
            "Planet tile manager ready: {} roots at level {}, max level {}",
            roots.len(),
            config.min_level,
            config.max_level
        );
        Ok(manager)
    }

    /// The node at `coord`, creating it (mesh, registration, texture request) if absent.
    ///
    /// `parent` must be `coord.parent()`, or `None` to derive it. Missing
    /// ancestors are created by subdividing down from the nearest tracked one,
    /// so a new node always arrives together with its siblings.
    ///
    /// Returns `None` if `parent` does not match or the level is outside the
    /// configured range.
    pub fn create_or_get_node(
        &mut self,
        coord: TileCoordinate,
        parent: Option<TileCoordinate>,
    ) -> Option<&TileNode> {
        if !self.tree.contains(&coord) {
            let level = coord.level();
            if level < self.config.min_level || level > self.config.max_level {
                debug!(
                    "Refusing tile {coord} outside levels {}..={}",
                    self.config.min_level, self.config.max_level
                );
                return None;
            }
            if level == self.config.min_level {
                if parent.is_some() {
                    debug!("Refusing root tile {coord} with a parent");
                    return None;
                }
                self.create_nodes(&[coord], None);
            } else {
                let expected = coord.parent()?;
                if let Some(given) = parent
                    && given != expected
                {
                    debug!("Refusing tile {coord} under {given}, its parent is {expected}");
                    return None;
                }
                if self.create_or_get_node(expected, None).is_none() {
                    return None;
                }
                self.subdivide(&expected)?;
            }
        }
        self.tree.get(&coord)
    }

    /// Give `coord` its four children. No-op if they exist or at the max level.
    ///
    /// Returns the children, or `None` if the node is unknown or cannot split.
    pub fn subdivide(&mut self, coord: &TileCoordinate) -> Option<[TileCoordinate; 4]> {
        let node = self.tree.get(coord)?;
        if let Some(children) = node.children {
            return Some(children);
        }
        if coord.level() >= self.config.max_level {
            return None;
        }
        let children = coord.children()?;
        self.create_nodes(&children, Some(*coord));
        if let Some(node) = self.tree.get_mut(coord) {
            node.children = Some(children);
        }
        self.frame_subdivisions += 1;
        Some(children)
    }

    /// Destroy every descendant of `coord`; the node itself becomes a leaf.
    pub fn prune(&mut self, coord: &TileCoordinate) {
        let removed = self.tree.detach_descendants(coord);
        if removed.is_empty() {
            return;
        }
        trace!("Pruned {} descendants of {coord}", removed.len());
        for node in &removed {
            self.dispose_node(node);
        }
        self.frame_prunes += 1;
    }

    /// Advance one frame for `camera`.
    pub fn update(&mut self, camera: &CameraState) -> FrameStats {
        self.frame += 1;
        self.frame_subdivisions = 0;
        self.frame_prunes = 0;
        self.camera = Some(*camera);

        self.pump_geometry();
        self.pump_loads();
        self.maybe_reprioritize(camera);
        let pass = self.run_visibility(camera);
        self.scheduler.drain();

        let stats = self.frame_stats(&pass);
        trace!("{stats:?}");
        stats
    }

    /// Block until every queued load and geometry request has been applied, or `timeout`.
    ///
    /// Returns `true` if everything settled. Does not re-run the visibility walk.
    pub fn settle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump_geometry();
            self.pump_loads();
            if self.is_idle() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = (deadline - now).min(Duration::from_millis(10));
            if !self.scheduler.is_idle() {
                for completion in self.scheduler.poll_timeout(wait) {
                    self.handle_completion(completion);
                }
            } else if let Some(response) =
                self.geometry.as_ref().and_then(|worker| worker.recv_timeout(wait))
            {
                self.handle_geometry_response(response);
            }
        }
    }

    /// Whether no load or geometry request is outstanding.
    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle() && self.pending_geometry.is_empty()
    }

    /// Stop the workers and dispose every mesh.
    pub fn shutdown(&mut self) {
        self.scheduler.shutdown();
        if let Some(mut worker) = self.geometry.take() {
            worker.shutdown();
        }
        self.pending_geometry.clear();
        for root in self.tree.roots().to_vec() {
            self.remove_subtree(&root);
        }
        info!("Planet tile manager shut down");
    }

    /// The node at `coord`.
    pub fn node(&self, coord: &TileCoordinate) -> Option<&TileNode> {
        self.tree.get(coord)
    }

    /// The quadtree.
    pub fn tree(&self) -> &TileTree {
        &self.tree
    }

    /// The render sink.
    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Mutable access to the render sink.
    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    /// The texture load scheduler.
    pub fn scheduler(&self) -> &TextureLoadScheduler {
        &self.scheduler
    }

    /// Cumulative load counters.
    pub fn load_stats(&self) -> LoadStats {
        *self.scheduler.stats()
    }

    /// Effective tile settings.
    pub fn config(&self) -> &PlanetTileConfig {
        &self.config
    }

    /// Thresholds used by the visibility walk.
    pub fn driver(&self) -> &VisibilityDriver {
        &self.driver
    }

    /// Frames processed so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    // --- node lifecycle ---

    fn geometry_params(&self, coord: TileCoordinate) -> GeometryParams {
        GeometryParams {
            coord,
            radius: self.config.radius_m,
            segments: segments_for_level(
                coord.level(),
                self.config.max_level,
                self.config.base_segments,
            ),
            skirts: self.config.skirts_enabled,
            skirt_depth_factor: self.config.skirt_depth_factor,
        }
    }

    /// Create the nodes in `coords` that do not exist yet, sharing one parent.
    fn create_nodes(&mut self, coords: &[TileCoordinate], parent: Option<TileCoordinate>) {
        let missing: Vec<TileCoordinate> = coords
            .iter()
            .copied()
            .filter(|coord| !self.tree.contains(coord))
            .collect();
        if missing.is_empty() {
            return;
        }

        let offloaded = self.submit_geometry(&missing);
        for coord in &missing {
            let mut node = TileNode::new(*coord, self.config.radius_m, parent);
            if !offloaded {
                let geometry = build_tile_geometry(&self.geometry_params(*coord));
                node.mesh = Some(self.renderer.create_mesh(*coord, &geometry));
            }
            self.tree.insert(node);
        }
        for coord in &missing {
            self.request_load(coord);
        }
    }

    /// Hand geometry for `coords` to the worker. Returns `false` if it must be built inline.
    fn submit_geometry(&mut self, coords: &[TileCoordinate]) -> bool {
        let Some(worker) = &self.geometry else {
            return false;
        };
        let id = self.next_request_id;
        self.next_request_id += 1;

        let request = match coords {
            [coord] => WorkerRequest::BuildGeometry {
                id,
                params: self.geometry_params(*coord),
            },
            _ => WorkerRequest::BatchBuildGeometry {
                id,
                params: coords.iter().map(|c| self.geometry_params(*c)).collect(),
            },
        };
        match worker.submit(request) {
            Ok(()) => {
                self.pending_geometry.insert(id, coords.to_vec());
                true
            }
            Err(e) => {
                warn!("Building tile geometry inline: {e}");
                false
            }
        }
    }

    fn install_geometry(&mut self, geometry: TileGeometry) {
        let coord = geometry.coord;
        let Some(node) = self.tree.get_mut(&coord) else {
            trace!("Dropping geometry for pruned tile {coord}");
            return;
        };
        if node.mesh.is_some() {
            return;
        }
        let mesh = self.renderer.create_mesh(coord, &geometry);
        node.mesh = Some(mesh);
        if node.visible {
            self.renderer.set_visible(mesh, true);
        }
        // A texture that arrived before the mesh is waiting in the cache.
        if node.state != LoadState::Loaded && !self.scheduler.is_pending(&coord) {
            node.state = LoadState::Unrequested;
            self.request_load(&coord);
        }
    }

    fn dispose_node(&mut self, node: &TileNode) {
        if let Some(mesh) = node.mesh {
            self.renderer.dispose_mesh(mesh);
        }
        self.scheduler.cancel_pending(&node.coord);
    }

    /// Remove `coord` and its whole subtree, disposing their meshes.
    pub(crate) fn remove_subtree(&mut self, coord: &TileCoordinate) {
        for node in self.tree.remove_subtree(coord) {
            self.dispose_node(&node);
        }
    }

    pub(crate) fn set_node_visible(&mut self, coord: &TileCoordinate, visible: bool) {
        let Some(node) = self.tree.get_mut(coord) else {
            return;
        };
        if node.visible == visible {
            return;
        }
        node.visible = visible;
        if let Some(mesh) = node.mesh {
            self.renderer.set_visible(mesh, visible);
        }
    }

    // --- texture loading ---

    /// Request the texture of `coord` unless it is loading or loaded.
    pub(crate) fn request_load(&mut self, coord: &TileCoordinate) {
        let Some(node) = self.tree.get(coord) else {
            return;
        };
        if !node.state.needs_request() {
            return;
        }
        let priority = self
            .driver
            .load_priority(coord, node.center, self.camera.as_ref());
        match self.scheduler.request(*coord, priority) {
            LoadRequest::Cached(texture) => self.apply_texture(coord, texture),
            LoadRequest::Queued | LoadRequest::AlreadyQueued | LoadRequest::InFlight => {
                if let Some(node) = self.tree.get_mut(coord) {
                    node.state = LoadState::Loading;
                }
            }
        }
    }

    /// Apply `texture` to the node's mesh. Textures for pruned nodes are only cached.
    fn apply_texture(&mut self, coord: &TileCoordinate, texture: TileTexture) {
        let Some(node) = self.tree.get_mut(coord) else {
            self.scheduler.note_stale_completion();
            debug!("Texture for pruned tile {coord} kept in cache only");
            return;
        };
        match node.mesh {
            Some(mesh) => {
                self.renderer.apply_texture(mesh, texture);
                node.state = LoadState::Loaded;
            }
            None => node.state = LoadState::Loading,
        }
    }

    fn handle_completion(&mut self, completion: LoadCompletion) {
        let coord = completion.coord;
        match completion.result {
            Ok((texture, _)) => self.apply_texture(&coord, texture),
            Err(e) => {
                warn!("Tile {coord} failed to load: {e}");
                if let Some(node) = self.tree.get_mut(&coord) {
                    node.state = LoadState::Failed;
                }
            }
        }
    }

    fn pump_loads(&mut self) {
        for completion in self.scheduler.poll() {
            self.handle_completion(completion);
        }
    }

    fn handle_geometry_response(&mut self, response: WorkerResponse) {
        self.pending_geometry.remove(&response.id());
        match response {
            WorkerResponse::Geometry { geometry, .. } => self.install_geometry(geometry),
            WorkerResponse::GeometryBatch { geometries, .. } => {
                for geometry in geometries {
                    self.install_geometry(geometry);
                }
            }
            WorkerResponse::Visible { id, .. } => {
                debug!("Ignoring visibility response {id}");
            }
        }
    }

    fn pump_geometry(&mut self) {
        let Some(worker) = &self.geometry else {
            return;
        };
        for response in worker.drain_responses() {
            self.handle_geometry_response(response);
        }
    }

    fn maybe_reprioritize(&mut self, camera: &CameraState) {
        let material = self.prioritized_camera.is_none_or(|previous| {
            camera.moved_materially(
                &previous,
                self.config.radius_m,
                self.config.reprioritize_distance_fraction,
                self.config.reprioritize_angle_degrees,
            )
        });
        if !material {
            return;
        }
        let tree = &self.tree;
        let driver = self.driver;
        self.scheduler.reprioritize(|coord| {
            let center = tree
                .get(coord)
                .map_or_else(|| coord.center_direction() * driver.radius, |n| n.center);
            driver.load_priority(coord, center, Some(camera))
        });
        self.prioritized_camera = Some(*camera);
    }

    fn frame_stats(&self, pass: &VisibilityPass) -> FrameStats {
        let desired_loaded = pass
            .desired
            .iter()
            .filter(|coord| self.tree.get(coord).is_some_and(|n| n.is_loaded()))
            .count();
        FrameStats {
            frame: self.frame,
            tracked_nodes: self.tree.len(),
            visible_meshes: self
                .tree
                .iter()
                .filter(|n| n.visible && n.mesh.is_some())
                .count(),
            desired: pass.desired.len(),
            desired_loaded,
            culled: pass.culled.len(),
            subdivisions: self.frame_subdivisions,
            prunes: self.frame_prunes,
            queued_loads: self.scheduler.queued_count(),
            in_flight_loads: self.scheduler.active_count(),
            cached_textures: self.scheduler.cache().len(),
            max_visible_level: pass.desired.iter().map(|c| c.level()).max(),
        }
    }
}
