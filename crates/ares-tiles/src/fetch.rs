//! Tile addressing on the remote pyramid and the HTTP fetcher.

use std::io::Read;
use std::time::Duration;

use tracing::trace;

use crate::coord::TileCoordinate;
use crate::error::TileError;

/// Upper bound on a single tile body. Real tiles are a few tens of KiB.
pub const MAX_TILE_BYTES: u64 = 16 * 1024 * 1024;

/// Maps tile coordinates to URLs on a WMTS-style pyramid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileUrlScheme {
    base_url: String,
    extension: String,
}

impl TileUrlScheme {
    /// Create a scheme; a trailing `/` on the base and a leading `.` on the extension are dropped.
    pub fn new(base_url: impl Into<String>, extension: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let extension = extension.into().trim_start_matches('.').to_string();
        Self {
            base_url,
            extension,
        }
    }

    /// `{base}/{level}/{row}/{column}.{ext}`
    pub fn url(&self, coord: &TileCoordinate) -> String {
        format!(
            "{}/{}/{}/{}.{}",
            self.base_url,
            coord.level(),
            coord.row(),
            coord.column(),
            self.extension
        )
    }

    /// Pyramid base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Source of raw tile bytes. Called from fetch worker threads.
pub trait TileFetcher: Send + Sync {
    /// Download the body at `url`. Non-success statuses are errors.
    fn fetch(&self, url: &str) -> Result<Vec<u8>, TileError>;
}

/// Blocking HTTP fetcher backed by a shared `ureq` agent.
pub struct HttpTileFetcher {
    agent: ureq::Agent,
}

impl HttpTileFetcher {
    /// Create a fetcher whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("ares-tiles/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent }
    }
}

impl TileFetcher for HttpTileFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, TileError> {
        trace!("GET {url}");
        let response = match self.agent.get(url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(status, _)) => {
                return Err(TileError::HttpStatus {
                    url: url.to_string(),
                    status,
                });
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(TileError::Transport {
                    url: url.to_string(),
                    message: transport.to_string(),
                });
            }
        };

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_TILE_BYTES)
            .read_to_end(&mut bytes)
            .map_err(TileError::Body)?;
        Ok(bytes)
    }
}
