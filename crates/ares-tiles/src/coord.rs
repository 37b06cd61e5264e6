//! Equirectangular tile addressing.
//!
//! Level `L` of the pyramid is a grid of `2^(L+1)` columns by `2^L` rows
//! covering the whole sphere. Column 0 starts at longitude −π and columns
//! increase eastward; row 0 starts at the north pole and rows increase
//! southward. Every tile therefore spans the same angle in longitude and
//! latitude (`π / 2^L`).

use std::f64::consts::{FRAC_PI_2, PI, TAU};
use std::fmt;
use std::str::FromStr;

use ares_config::MAX_SUPPORTED_LEVEL;
use glam::DVec3;

use crate::error::CoordinateError;

/// Uniquely identifies a tile in the pyramid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoordinate {
    level: u8,
    column: u32,
    row: u32,
}

/// Angular extent of a tile, in radians.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TileBounds {
    /// Western edge longitude.
    pub west: f64,
    /// Eastern edge longitude.
    pub east: f64,
    /// Northern edge latitude.
    pub north: f64,
    /// Southern edge latitude.
    pub south: f64,
}

impl TileBounds {
    /// Longitude at the tile's horizontal center.
    pub fn center_lon(&self) -> f64 {
        (self.west + self.east) * 0.5
    }

    /// Latitude at the tile's vertical center.
    pub fn center_lat(&self) -> f64 {
        (self.north + self.south) * 0.5
    }

    /// Whether `(lon, lat)` lies inside the tile (edges inclusive).
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.west && lon <= self.east && lat <= self.north && lat >= self.south
    }
}

impl TileCoordinate {
    /// Construct a coordinate, validating it against the grid of its level.
    pub fn new(level: u8, column: u32, row: u32) -> Result<Self, CoordinateError> {
        if level > MAX_SUPPORTED_LEVEL {
            return Err(CoordinateError::LevelTooDeep {
                level,
                max: MAX_SUPPORTED_LEVEL,
            });
        }
        let columns = Self::columns_at(level);
        if column >= columns {
            return Err(CoordinateError::ColumnOutOfRange {
                level,
                column,
                columns,
            });
        }
        let rows = Self::rows_at(level);
        if row >= rows {
            return Err(CoordinateError::RowOutOfRange { level, row, rows });
        }
        Ok(Self { level, column, row })
    }

    /// Pyramid level (0 = coarsest).
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Column index, counted eastward from longitude −π.
    pub fn column(&self) -> u32 {
        self.column
    }

    /// Row index, counted southward from the north pole.
    pub fn row(&self) -> u32 {
        self.row
    }

    /// Number of columns at `level`.
    pub fn columns_at(level: u8) -> u32 {
        1 << (u32::from(level) + 1)
    }

    /// Number of rows at `level`.
    pub fn rows_at(level: u8) -> u32 {
        1 << u32::from(level)
    }

    /// Total number of tiles at `level`.
    pub fn tiles_at(level: u8) -> u64 {
        u64::from(Self::columns_at(level)) * u64::from(Self::rows_at(level))
    }

    /// Longitude extent of one tile at this level, in radians.
    pub fn lon_span(&self) -> f64 {
        TAU / f64::from(Self::columns_at(self.level))
    }

    /// Latitude extent of one tile at this level, in radians.
    pub fn lat_span(&self) -> f64 {
        PI / f64::from(Self::rows_at(self.level))
    }

    /// Angular bounds of this tile.
    pub fn bounds(&self) -> TileBounds {
        let lon_span = self.lon_span();
        let lat_span = self.lat_span();
        let west = -PI + f64::from(self.column) * lon_span;
        let north = FRAC_PI_2 - f64::from(self.row) * lat_span;
        TileBounds {
            west,
            east: west + lon_span,
            north,
            south: north - lat_span,
        }
    }

    /// Unit vector from the planet center through the middle of the tile.
    pub fn center_direction(&self) -> DVec3 {
        let bounds = self.bounds();
        lon_lat_to_unit(bounds.center_lon(), bounds.center_lat())
    }

    /// The four children one level down, or `None` at the deepest supported level.
    ///
    /// Order: north-west, north-east, south-west, south-east.
    pub fn children(&self) -> Option<[TileCoordinate; 4]> {
        if self.level >= MAX_SUPPORTED_LEVEL {
            return None;
        }
        let level = self.level + 1;
        let c = self.column * 2;
        let r = self.row * 2;
        Some([
            Self::unchecked(level, c, r),
            Self::unchecked(level, c + 1, r),
            Self::unchecked(level, c, r + 1),
            Self::unchecked(level, c + 1, r + 1),
        ])
    }

    /// The tile one level up that contains this one, or `None` at level 0.
    pub fn parent(&self) -> Option<TileCoordinate> {
        if self.level == 0 {
            return None;
        }
        Some(Self::unchecked(self.level - 1, self.column / 2, self.row / 2))
    }

    /// Whether `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &TileCoordinate) -> bool {
        if other.level <= self.level {
            return false;
        }
        let shift = u32::from(other.level - self.level);
        other.column >> shift == self.column && other.row >> shift == self.row
    }

    /// The tile at `level` containing the given longitude/latitude (radians).
    ///
    /// Inputs are wrapped/clamped onto the sphere.
    pub fn containing(level: u8, lon: f64, lat: f64) -> Result<Self, CoordinateError> {
        if level > MAX_SUPPORTED_LEVEL {
            return Err(CoordinateError::LevelTooDeep {
                level,
                max: MAX_SUPPORTED_LEVEL,
            });
        }
        let columns = Self::columns_at(level);
        let rows = Self::rows_at(level);
        let lon = (lon + PI).rem_euclid(TAU);
        let lat = lat.clamp(-FRAC_PI_2, FRAC_PI_2);
        let column = ((lon / TAU) * f64::from(columns)) as u32;
        let row = (((FRAC_PI_2 - lat) / PI) * f64::from(rows)) as u32;
        Ok(Self::unchecked(
            level,
            column.min(columns - 1),
            row.min(rows - 1),
        ))
    }

    /// Every tile of `level`, row by row.
    pub fn level_tiles(level: u8) -> impl Iterator<Item = TileCoordinate> {
        let level = level.min(MAX_SUPPORTED_LEVEL);
        let columns = Self::columns_at(level);
        (0..Self::rows_at(level))
            .flat_map(move |row| (0..columns).map(move |column| Self::unchecked(level, column, row)))
    }

    fn unchecked(level: u8, column: u32, row: u32) -> Self {
        Self { level, column, row }
    }
}

impl fmt::Display for TileCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.level, self.column, self.row)
    }
}

impl FromStr for TileCoordinate {
    type Err = CoordinateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CoordinateError::MalformedKey(s.to_string());
        let mut parts = s.split('/');
        let level = parts.next().ok_or_else(malformed)?;
        let column = parts.next().ok_or_else(malformed)?;
        let row = parts.next().ok_or_else(malformed)?;
        if parts.next().is_some() {
            return Err(malformed());
        }
        let level = level.parse::<u8>().map_err(|_| malformed())?;
        let column = column.parse::<u32>().map_err(|_| malformed())?;
        let row = row.parse::<u32>().map_err(|_| malformed())?;
        Self::new(level, column, row)
    }
}

/// Unit vector for a longitude/latitude pair (radians), Y up.
///
/// Longitude 0 points along +X and longitude +π/2 along −Z.
pub fn lon_lat_to_unit(lon: f64, lat: f64) -> DVec3 {
    let (sin_lat, cos_lat) = lat.sin_cos();
    let (sin_lon, cos_lon) = lon.sin_cos();
    DVec3::new(cos_lat * cos_lon, sin_lat, -cos_lat * sin_lon)
}

/// Longitude/latitude (radians) of a direction. The input need not be normalized.
pub fn unit_to_lon_lat(dir: DVec3) -> (f64, f64) {
    let dir = dir.normalize_or_zero();
    let lat = dir.y.clamp(-1.0, 1.0).asin();
    let lon = (-dir.z).atan2(dir.x);
    (lon, lat)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    fn coord(level: u8, column: u32, row: u32) -> TileCoordinate {
        TileCoordinate::new(level, column, row).unwrap()
    }

    #[test]
    fn test_level_zero_is_two_by_one() {
        assert_eq!(TileCoordinate::columns_at(0), 2);
        assert_eq!(TileCoordinate::rows_at(0), 1);
        assert_eq!(TileCoordinate::level_tiles(0).count(), 2);
        assert_eq!(TileCoordinate::level_tiles(3).count(), 16 * 8);
        assert_eq!(TileCoordinate::tiles_at(3), 128);
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(matches!(
            TileCoordinate::new(1, 4, 0),
            Err(CoordinateError::ColumnOutOfRange { columns: 4, .. })
        ));
        assert!(matches!(
            TileCoordinate::new(1, 0, 2),
            Err(CoordinateError::RowOutOfRange { rows: 2, .. })
        ));
        assert!(matches!(
            TileCoordinate::new(MAX_SUPPORTED_LEVEL + 1, 0, 0),
            Err(CoordinateError::LevelTooDeep { .. })
        ));
        assert!(TileCoordinate::new(1, 3, 1).is_ok());
    }

    #[test]
    fn test_level_zero_bounds_cover_sphere() {
        let west = coord(0, 0, 0).bounds();
        let east = coord(0, 1, 0).bounds();
        assert!((west.west + PI).abs() < EPS);
        assert!(west.east.abs() < EPS);
        assert!((east.east - PI).abs() < EPS);
        assert!((west.north - FRAC_PI_2).abs() < EPS);
        assert!((west.south + FRAC_PI_2).abs() < EPS);
    }

    #[test]
    fn test_spans_are_equal_angles() {
        for level in 0..8 {
            let c = coord(level, 0, 0);
            assert!((c.lon_span() - c.lat_span()).abs() < EPS);
        }
    }

    #[test]
    fn test_children_partition_parent() {
        let parent = coord(3, 5, 2);
        let pb = parent.bounds();
        let children = parent.children().unwrap();

        let mut area = 0.0;
        for child in &children {
            assert_eq!(child.level(), 4);
            assert_eq!(child.parent(), Some(parent));
            let cb = child.bounds();
            assert!(cb.west >= pb.west - EPS && cb.east <= pb.east + EPS);
            assert!(cb.south >= pb.south - EPS && cb.north <= pb.north + EPS);
            area += (cb.east - cb.west) * (cb.north - cb.south);
        }
        let parent_area = (pb.east - pb.west) * (pb.north - pb.south);
        assert!((area - parent_area).abs() < EPS);

        // Shared edges line up exactly.
        let [nw, ne, sw, se] = children.map(|c| c.bounds());
        assert!((nw.east - ne.west).abs() < EPS);
        assert!((sw.east - se.west).abs() < EPS);
        assert!((nw.south - sw.north).abs() < EPS);
        assert!((ne.south - se.north).abs() < EPS);
        assert!((nw.west - pb.west).abs() < EPS);
        assert!((se.south - pb.south).abs() < EPS);
    }

    #[test]
    fn test_deepest_level_has_no_children() {
        let deepest = coord(MAX_SUPPORTED_LEVEL, 0, 0);
        assert!(deepest.children().is_none());
        assert!(coord(0, 1, 0).parent().is_none());
    }

    #[test]
    fn test_key_roundtrip_and_errors() {
        let c = coord(5, 40, 17);
        assert_eq!(c.to_string(), "5/40/17");
        assert_eq!("5/40/17".parse::<TileCoordinate>().unwrap(), c);

        for bad in ["", "5/40", "5/40/17/1", "a/b/c", "-1/0/0"] {
            assert!(matches!(
                bad.parse::<TileCoordinate>(),
                Err(CoordinateError::MalformedKey(_))
            ));
        }
        assert!(matches!(
            "1/9/0".parse::<TileCoordinate>(),
            Err(CoordinateError::ColumnOutOfRange { .. })
        ));
    }

    #[test]
    fn test_ancestry() {
        let root = coord(1, 2, 1);
        let grandchild = root.children().unwrap()[3].children().unwrap()[0];
        assert!(root.is_ancestor_of(&grandchild));
        assert!(!grandchild.is_ancestor_of(&root));
        assert!(!root.is_ancestor_of(&root));
        assert!(!coord(1, 0, 0).is_ancestor_of(&grandchild));
    }

    #[test]
    fn test_containing_matches_bounds() {
        let lon = 77.5_f64.to_radians();
        let lat = 18.4_f64.to_radians();
        for level in 0..10 {
            let c = TileCoordinate::containing(level, lon, lat).unwrap();
            assert!(c.bounds().contains(lon, lat), "level {level}: {c}");
        }
        let pole = TileCoordinate::containing(2, 0.0, FRAC_PI_2).unwrap();
        assert_eq!(pole.row(), 0);
        let antimeridian = TileCoordinate::containing(2, PI, 0.0).unwrap();
        assert_eq!(antimeridian.column(), 0);
    }

    #[test]
    fn test_lon_lat_conversion() {
        let north = lon_lat_to_unit(0.3, FRAC_PI_2);
        assert!((north - DVec3::Y).length() < 1e-9);
        let (lon, lat) = unit_to_lon_lat(lon_lat_to_unit(1.2, -0.4));
        assert!((lon - 1.2).abs() < 1e-9);
        assert!((lat + 0.4).abs() < 1e-9);
        assert!((coord(4, 3, 7).center_direction().length() - 1.0).abs() < EPS);
    }
}
