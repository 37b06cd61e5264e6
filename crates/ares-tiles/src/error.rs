//! Error types for tile addressing, loading and worker plumbing.

use ares_config::ConfigError;

use crate::store::StoreError;

/// A tile coordinate that does not address a tile of the pyramid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinateError {
    /// The level is deeper than the pyramid supports.
    #[error("level {level} exceeds the deepest supported level {max}")]
    LevelTooDeep {
        /// Requested level.
        level: u8,
        /// Deepest addressable level.
        max: u8,
    },

    /// The column lies outside `[0, 2^(level+1))`.
    #[error("column {column} out of range for level {level} (columns: {columns})")]
    ColumnOutOfRange {
        /// Level of the coordinate.
        level: u8,
        /// Requested column.
        column: u32,
        /// Number of columns at this level.
        columns: u32,
    },

    /// The row lies outside `[0, 2^level)`.
    #[error("row {row} out of range for level {level} (rows: {rows})")]
    RowOutOfRange {
        /// Level of the coordinate.
        level: u8,
        /// Requested row.
        row: u32,
        /// Number of rows at this level.
        rows: u32,
    },

    /// A `"L/C/R"` key could not be parsed.
    #[error("malformed tile key `{0}`")]
    MalformedKey(String),
}

/// Errors raised while fetching, decoding or storing a tile.
#[derive(Debug, thiserror::Error)]
pub enum TileError {
    /// The server answered with a non-success status.
    #[error("tile request {url} returned HTTP {status}")]
    HttpStatus {
        /// Requested URL.
        url: String,
        /// Response status code.
        status: u16,
    },

    /// The request never produced a response (DNS, TLS, timeout, ...).
    #[error("tile request {url} failed: {message}")]
    Transport {
        /// Requested URL.
        url: String,
        /// Transport error description.
        message: String,
    },

    /// Reading the response body failed.
    #[error("failed to read tile body: {0}")]
    Body(#[source] std::io::Error),

    /// The tile bytes are not a decodable image.
    #[error("failed to decode tile image: {0}")]
    Decode(#[from] image::ImageError),

    /// The persistent store reported an error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A tile coordinate was out of range.
    #[error(transparent)]
    Coordinate(#[from] CoordinateError),

    /// The engine configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A worker thread could not be started.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        /// Thread role.
        name: &'static str,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The worker pool has shut down and no longer accepts work.
    #[error("worker pool is shut down")]
    WorkerClosed,
}
