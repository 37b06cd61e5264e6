//! Per-frame visibility: which tiles are shown, split, pruned and loaded first.
//!
//! The walk runs in two phases. The first descends from every root,
//! culling back-facing tiles, splitting tiles that project larger than the
//! threshold and collecting the leaves that should be drawn. The second is a
//! retention sweep that drops every node neither drawn, culled, nor an
//! ancestor of one of those.

use std::f64::consts::{PI, TAU};

use ares_config::PlanetTileConfig;
use glam::DVec3;
use rustc_hash::FxHashSet;
use tracing::trace;

use crate::coord::{TileCoordinate, lon_lat_to_unit, unit_to_lon_lat};
use crate::manager::PlanetTileManager;
use crate::render::TileRenderer;

/// Camera parameters the visibility walk depends on.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraState {
    /// Camera position in planet space (meters, planet center at the origin).
    pub position: DVec3,
    /// Unit view direction.
    pub forward: DVec3,
    /// Vertical field of view in radians.
    pub fov_y: f64,
    /// Viewport height in pixels.
    pub viewport_height: f64,
}

impl CameraState {
    /// Create a camera state; `forward` is normalized.
    pub fn new(position: DVec3, forward: DVec3, fov_y: f64, viewport_height: f64) -> Self {
        Self {
            position,
            forward: forward.normalize_or_zero(),
            fov_y,
            viewport_height,
        }
    }

    /// A camera at `position` looking at `target`, with the field of view given in degrees.
    pub fn look_at(
        position: DVec3,
        target: DVec3,
        fov_y_degrees: f64,
        viewport_height: f64,
    ) -> Self {
        Self::new(
            position,
            target - position,
            fov_y_degrees.to_radians(),
            viewport_height,
        )
    }

    /// Whether the camera moved or turned enough since `previous` to re-sort queued loads.
    pub fn moved_materially(
        &self,
        previous: &CameraState,
        radius: f64,
        distance_fraction: f64,
        angle_degrees: f64,
    ) -> bool {
        if self.position.distance(previous.position) > radius * distance_fraction {
            return true;
        }
        let cos = self.forward.dot(previous.forward).clamp(-1.0, 1.0);
        cos.acos() > angle_degrees.to_radians()
    }
}

/// Classification of one tile against a camera.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TileVisibility {
    /// Classified tile.
    pub coord: TileCoordinate,
    /// The tile faces away from the camera.
    pub back_facing: bool,
    /// Projected size in pixels.
    pub screen_px: f64,
    /// Distance from the camera to the tile center in meters.
    pub distance: f64,
}

/// Thresholds driving the per-frame walk.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VisibilityDriver {
    /// Planet radius in meters.
    pub radius: f64,
    /// Deepest level a tile may be split to.
    pub max_level: u8,
    /// Projected size in pixels above which a tile splits.
    pub threshold_px: f64,
    /// Dead band around `threshold_px`, as a fraction of it.
    pub hysteresis: f64,
    /// Facing dot product below which a tile is culled.
    pub backface_threshold: f64,
}

impl VisibilityDriver {
    /// Thresholds taken from the tile settings.
    pub fn from_config(config: &PlanetTileConfig) -> Self {
        Self {
            radius: config.radius_m,
            max_level: config.max_level,
            threshold_px: config.subdivide_threshold_px,
            hysteresis: config.subdivide_hysteresis,
            backface_threshold: config.backface_threshold,
        }
    }

    /// Facing test of a surface point: `dot(n̂(point), (camera − point)̂) < threshold`.
    pub fn is_back_facing_at(&self, point: DVec3, camera_position: DVec3) -> bool {
        let normal = point.normalize_or_zero();
        let to_camera = (camera_position - point).normalize_or_zero();
        normal.dot(to_camera) < self.backface_threshold
    }

    /// Facing test of a tile.
    ///
    /// The test point is the tile's point nearest the camera's ground point.
    /// For small tiles that is practically the center; for coarse tiles it
    /// keeps the tile under a low camera from being culled by its own far-away center.
    pub fn is_back_facing(&self, coord: &TileCoordinate, camera_position: DVec3) -> bool {
        let point = nearest_surface_point(coord, camera_position) * self.radius;
        self.is_back_facing_at(point, camera_position)
    }

    /// Projected size of the tile in pixels.
    pub fn screen_size_px(
        &self,
        coord: &TileCoordinate,
        center: DVec3,
        camera: &CameraState,
    ) -> f64 {
        let arc = coord.lon_span().max(coord.lat_span()) * self.radius;
        let distance = camera.position.distance(center);
        let angle = 2.0 * (arc * 0.5).atan2(distance);
        angle * camera.viewport_height / camera.fov_y.max(f64::EPSILON)
    }

    /// Whether a tile at `level` projecting to `px` should be (or stay) split.
    pub fn wants_split(&self, level: u8, px: f64, currently_split: bool) -> bool {
        if level >= self.max_level {
            return false;
        }
        let band = if currently_split {
            1.0 - self.hysteresis
        } else {
            1.0 + self.hysteresis
        };
        px > self.threshold_px * band
    }

    /// Classify `coord` against `camera`.
    pub fn classify(&self, coord: &TileCoordinate, camera: &CameraState) -> TileVisibility {
        let center = coord.center_direction() * self.radius;
        TileVisibility {
            coord: *coord,
            back_facing: self.is_back_facing(coord, camera.position),
            screen_px: self.screen_size_px(coord, center, camera),
            distance: camera.position.distance(center),
        }
    }

    /// Load priority of a tile (lower loads sooner).
    ///
    /// Coarser levels come first, then tiles nearer the view direction, then nearer tiles.
    pub fn load_priority(
        &self,
        coord: &TileCoordinate,
        center: DVec3,
        camera: Option<&CameraState>,
    ) -> f64 {
        let level = f64::from(coord.level()) * 10.0;
        let Some(camera) = camera else {
            return level;
        };
        let to_tile = (center - camera.position).normalize_or_zero();
        let angle = camera.forward.dot(to_tile).clamp(-1.0, 1.0).acos();
        let distance = (camera.position.distance(center) / self.radius).min(4.0);
        level + angle * 2.0 + distance
    }
}

/// Unit vector of the tile point nearest to the camera's ground point.
fn nearest_surface_point(coord: &TileCoordinate, camera_position: DVec3) -> DVec3 {
    let bounds = coord.bounds();
    let (camera_lon, camera_lat) = unit_to_lon_lat(camera_position);
    let center_lon = bounds.center_lon();
    let half_span = (bounds.east - bounds.west) * 0.5;
    let offset = (camera_lon - center_lon + PI).rem_euclid(TAU) - PI;
    let lon = center_lon + offset.clamp(-half_span, half_span);
    let lat = camera_lat.clamp(bounds.south, bounds.north);
    lon_lat_to_unit(lon, lat)
}

/// Nodes the first phase decided to keep.
#[derive(Debug, Default)]
pub(crate) struct VisibilityPass {
    /// Leaves to draw.
    pub desired: Vec<TileCoordinate>,
    /// Back-facing nodes.
    pub culled: Vec<TileCoordinate>,
}

impl<R: TileRenderer> PlanetTileManager<R> {
    /// Run both phases of the walk for `camera`.
    pub(crate) fn run_visibility(&mut self, camera: &CameraState) -> VisibilityPass {
        let mut pass = VisibilityPass::default();
        let roots = self.tree.roots().to_vec();
        for root in roots {
            self.visit(root, camera, &mut pass);
        }
        self.retain_reachable(&pass);
        pass
    }

    /// Visit one node. Returns whether its area is covered by loaded imagery
    /// (or needs none because it is culled).
    fn visit(
        &mut self,
        coord: TileCoordinate,
        camera: &CameraState,
        pass: &mut VisibilityPass,
    ) -> bool {
        let Some(node) = self.tree.get(&coord) else {
            return true;
        };
        let center = node.center;
        let currently_split = !node.is_leaf();

        if self.driver.is_back_facing(&coord, camera.position) {
            self.set_node_visible(&coord, false);
            pass.culled.push(coord);
            return true;
        }

        let px = self.driver.screen_size_px(&coord, center, camera);
        if self.driver.wants_split(coord.level(), px, currently_split)
            && let Some(children) = self.subdivide(&coord)
        {
            let mut all_covered = true;
            for child in children {
                // Every child is visited even after one comes back uncovered.
                all_covered &= self.visit(child, camera, pass);
            }
            self.set_node_visible(&coord, !all_covered);
            trace!("Tile {coord} split at {px:.0} px, children covered: {all_covered}");
            return all_covered || self.tree.get(&coord).is_some_and(|n| n.is_loaded());
        }

        if currently_split {
            self.prune(&coord);
        }
        self.set_node_visible(&coord, true);
        self.request_load(&coord);
        pass.desired.push(coord);
        self.tree.get(&coord).is_some_and(|n| n.is_loaded())
    }

    /// Drop every node that is not desired, culled, or an ancestor of one of those.
    fn retain_reachable(&mut self, pass: &VisibilityPass) {
        let mut retained: FxHashSet<TileCoordinate> = self.tree.roots().iter().copied().collect();
        for coord in pass.desired.iter().chain(&pass.culled) {
            if retained.insert(*coord) {
                retained.extend(self.tree.ancestors(coord));
            }
        }
        if retained.len() == self.tree.len() {
            return;
        }

        let tree = &self.tree;
        let stale: Vec<TileCoordinate> = tree
            .iter()
            .filter(|node| !retained.contains(&node.coord))
            .filter(|node| {
                node.parent.is_none_or(|parent| {
                    retained.contains(&parent) || !tree.is_linked(&parent, &node.coord)
                })
            })
            .map(|node| node.coord)
            .collect();

        for coord in stale {
            let Some(node) = self.tree.get(&coord) else {
                continue;
            };
            // Pruning a parent removes all of its children at once. A node its
            // parent does not list goes on its own.
            match node.parent.filter(|parent| self.tree.is_linked(parent, &coord)) {
                Some(parent) => self.prune(&parent),
                None => self.remove_subtree(&coord),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RADIUS: f64 = 3_396_190.0;

    fn driver() -> VisibilityDriver {
        VisibilityDriver {
            radius: RADIUS,
            max_level: 7,
            threshold_px: 60.0,
            hysteresis: 0.1,
            backface_threshold: -0.2,
        }
    }

    fn camera_above(lon_deg: f64, lat_deg: f64, altitude: f64) -> CameraState {
        let up = lon_lat_to_unit(lon_deg.to_radians(), lat_deg.to_radians());
        CameraState::look_at(up * (RADIUS + altitude), DVec3::ZERO, 60.0, 1080.0)
    }

    #[test]
    fn test_facing_formula() {
        let d = driver();
        let point = DVec3::X * RADIUS;
        assert!(!d.is_back_facing_at(point, DVec3::X * RADIUS * 2.0));
        assert!(d.is_back_facing_at(point, -DVec3::X * RADIUS * 2.0));
        // Grazing view sits between the threshold and zero.
        let grazing = point + DVec3::Y * RADIUS - DVec3::X * RADIUS * 0.1;
        assert!(!d.is_back_facing_at(point, grazing));
    }

    #[test]
    fn test_tile_under_low_camera_is_not_culled() {
        let d = driver();
        let camera = camera_above(77.5, 18.4, 2_000.0);
        let (lon, lat) = (77.5_f64.to_radians(), 18.4_f64.to_radians());
        let root = TileCoordinate::containing(1, lon, lat).unwrap();
        assert!(!d.is_back_facing(&root, camera.position));

        // The literal center test would have culled it.
        let center = root.center_direction() * RADIUS;
        assert!(d.is_back_facing_at(center, camera.position));
    }

    #[test]
    fn test_antipode_is_culled() {
        let d = driver();
        let camera = camera_above(77.5, 18.4, 2_000.0);
        let (lon, lat) = ((77.5_f64 - 180.0).to_radians(), (-18.4_f64).to_radians());
        let antipode = TileCoordinate::containing(1, lon, lat).unwrap();
        assert!(d.is_back_facing(&antipode, camera.position));
    }

    #[test]
    fn test_screen_size_shrinks_with_distance() {
        let d = driver();
        let coord = TileCoordinate::new(3, 8, 3).unwrap();
        let center = coord.center_direction() * RADIUS;
        let near = CameraState::look_at(center * 1.1, DVec3::ZERO, 60.0, 1080.0);
        let far = CameraState::look_at(center * 3.0, DVec3::ZERO, 60.0, 1080.0);
        let near_px = d.screen_size_px(&coord, center, &near);
        let far_px = d.screen_size_px(&coord, center, &far);
        assert!(near_px > far_px);

        let arc = coord.lon_span() * RADIUS;
        let expected = 2.0 * (arc / 2.0).atan2(RADIUS * 2.0) * 1080.0 / 60.0_f64.to_radians();
        assert!((far_px - expected).abs() < 1e-6);
    }

    #[test]
    fn test_split_hysteresis() {
        let d = driver();
        assert!(!d.wants_split(3, 65.0, false));
        assert!(d.wants_split(3, 67.0, false));
        assert!(d.wants_split(3, 55.0, true));
        assert!(!d.wants_split(3, 53.0, true));
        assert!(!d.wants_split(7, 10_000.0, false));

        let literal = VisibilityDriver {
            hysteresis: 0.0,
            ..driver()
        };
        assert!(literal.wants_split(3, 60.5, false));
        assert!(!literal.wants_split(3, 59.5, true));
    }

    #[test]
    fn test_priority_prefers_coarse_then_centered() {
        let d = driver();
        let camera = camera_above(0.0, 0.0, 500_000.0);
        let coarse = TileCoordinate::containing(2, 1.0, 0.5).unwrap();
        let fine = TileCoordinate::containing(5, 0.0, 0.0).unwrap();
        let p_coarse = d.load_priority(&coarse, coarse.center_direction() * RADIUS, Some(&camera));
        let p_fine = d.load_priority(&fine, fine.center_direction() * RADIUS, Some(&camera));
        assert!(p_coarse < p_fine);

        let ahead = TileCoordinate::containing(5, 0.0, 0.0).unwrap();
        let aside = TileCoordinate::containing(5, 0.6, 0.0).unwrap();
        let p_ahead = d.load_priority(&ahead, ahead.center_direction() * RADIUS, Some(&camera));
        let p_aside = d.load_priority(&aside, aside.center_direction() * RADIUS, Some(&camera));
        assert!(p_ahead < p_aside);

        assert_eq!(d.load_priority(&fine, DVec3::ZERO, None), 50.0);
    }

    #[test]
    fn test_material_camera_change() {
        let a = camera_above(10.0, 10.0, 100_000.0);
        let nudged = CameraState {
            position: a.position + DVec3::X * 100.0,
            ..a
        };
        assert!(!nudged.moved_materially(&a, RADIUS, 0.001, 2.0));

        let moved = CameraState {
            position: a.position + DVec3::X * 10_000.0,
            ..a
        };
        assert!(moved.moved_materially(&a, RADIUS, 0.001, 2.0));

        let forward = a.forward + DVec3::Y * 0.2;
        let turned = CameraState::new(a.position, forward, a.fov_y, a.viewport_height);
        assert!(turned.moved_materially(&a, RADIUS, 0.001, 2.0));
    }
}
