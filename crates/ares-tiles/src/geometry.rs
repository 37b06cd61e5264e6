//! Curved sphere-patch geometry for a single tile.
//!
//! A tile is a `segments × segments` grid laid on its lon/lat sector of the
//! sphere. Positions are stored relative to the tile center so they keep
//! full `f32` precision on a planet-sized radius; the center itself is kept
//! in double precision.

use ares_config::MAX_BASE_SEGMENTS;
use glam::{DVec3, Vec3};

use crate::coord::{TileCoordinate, lon_lat_to_unit};

/// Fewest grid segments a tile edge is ever built with.
pub const MIN_SEGMENTS: u32 = 4;

/// Levels below the finest one halve the segment count, up to this many times.
const MAX_SEGMENT_HALVINGS: u8 = 3;

/// Inputs for [`build_tile_geometry`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeometryParams {
    /// Tile to build.
    pub coord: TileCoordinate,
    /// Planet radius in meters.
    pub radius: f64,
    /// Grid segments per tile edge.
    pub segments: u32,
    /// Emit skirts along the four edges.
    pub skirts: bool,
    /// Skirt depth as a fraction of the tile's arc length.
    pub skirt_depth_factor: f64,
}

/// Owned mesh buffers for one tile.
#[derive(Clone, Debug, PartialEq)]
pub struct TileGeometry {
    /// Tile these buffers belong to.
    pub coord: TileCoordinate,
    /// Vertex positions relative to [`center`](Self::center).
    pub positions: Vec<Vec3>,
    /// Per-vertex texture coordinates, u west→east and v north→south.
    pub uvs: Vec<[f32; 2]>,
    /// Triangle list, counter-clockwise seen from outside the planet.
    pub indices: Vec<u32>,
    /// Tile center on the sphere surface, in planet space.
    pub center: DVec3,
    /// Longitude extent in radians.
    pub lon_span: f64,
    /// Latitude extent in radians.
    pub lat_span: f64,
}

impl TileGeometry {
    /// Number of vertices, skirts included.
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Number of triangles, skirts included.
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Segment count for a tile at `level` given the finest level and its segment count.
///
/// Each level above `max_level` halves the count (at most three times) and
/// the result never drops below [`MIN_SEGMENTS`].
pub fn segments_for_level(level: u8, max_level: u8, base_segments: u32) -> u32 {
    let halvings = max_level.saturating_sub(level).min(MAX_SEGMENT_HALVINGS);
    (base_segments >> halvings).max(MIN_SEGMENTS)
}

/// Build the mesh buffers for one tile.
///
/// The segment count is clamped to `1..=MAX_BASE_SEGMENTS` so indices fit in `u32`.
pub fn build_tile_geometry(params: &GeometryParams) -> TileGeometry {
    let coord = params.coord;
    let segments = params.segments.clamp(1, MAX_BASE_SEGMENTS);
    let bounds = coord.bounds();
    let lon_span = coord.lon_span();
    let lat_span = coord.lat_span();
    let center = coord.center_direction() * params.radius;

    let row_len = segments + 1;
    let grid_vertices = (row_len * row_len) as usize;
    let skirt_vertices = if params.skirts { 4 * row_len as usize } else { 0 };
    let mut positions = Vec::with_capacity(grid_vertices + skirt_vertices);
    let mut uvs = Vec::with_capacity(grid_vertices + skirt_vertices);

    let step = 1.0 / f64::from(segments);
    for i in 0..row_len {
        let v = f64::from(i) * step;
        let lat = bounds.north - v * lat_span;
        for j in 0..row_len {
            let u = f64::from(j) * step;
            let lon = bounds.west + u * lon_span;
            let world = lon_lat_to_unit(lon, lat) * params.radius;
            positions.push((world - center).as_vec3());
            uvs.push([u as f32, v as f32]);
        }
    }

    let skirt_indices = if params.skirts { 24 * segments as usize } else { 0 };
    let mut indices = Vec::with_capacity((segments * segments) as usize * 6 + skirt_indices);
    for i in 0..segments {
        for j in 0..segments {
            let a = i * row_len + j;
            let b = a + row_len;
            let c = a + 1;
            let d = b + 1;
            indices.extend_from_slice(&[a, b, c, c, b, d]);
        }
    }

    if params.skirts {
        let arc_length = lon_span.max(lat_span) * params.radius;
        let skirt_radius = (params.radius - params.skirt_depth_factor * arc_length).max(0.0);
        let scale = skirt_radius / params.radius;

        let edges: [(Vec<u32>, bool); 4] = [
            ((0..row_len).collect(), true),
            ((0..row_len).map(|j| segments * row_len + j).collect(), false),
            ((0..row_len).map(|i| i * row_len).collect(), false),
            ((0..row_len).map(|i| i * row_len + segments).collect(), true),
        ];

        for (edge, outward_ccw) in &edges {
            let first_skirt = positions.len() as u32;
            for &top in edge {
                let world = center + positions[top as usize].as_dvec3();
                positions.push((world * scale - center).as_vec3());
                uvs.push(uvs[top as usize]);
            }
            for k in 0..segments {
                let (t0, t1) = (edge[k as usize], edge[k as usize + 1]);
                let (s0, s1) = (first_skirt + k, first_skirt + k + 1);
                if *outward_ccw {
                    indices.extend_from_slice(&[t0, t1, s0, t1, s1, s0]);
                } else {
                    indices.extend_from_slice(&[t0, s0, t1, t1, s0, s1]);
                }
            }
        }
    }

    TileGeometry {
        coord,
        positions,
        uvs,
        indices,
        center,
        lon_span,
        lat_span,
    }
}
