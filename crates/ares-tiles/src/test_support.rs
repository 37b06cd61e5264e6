//! Shared test doubles: synthetic tiles, an instrumented fetcher and a loopback tile server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::TileError;
use crate::fetch::TileFetcher;

/// Encode a solid-colour PNG.
pub fn png_bytes(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

type Handler = dyn Fn(&str) -> Result<Vec<u8>, TileError> + Send + Sync;

/// Fetcher double that records call counts and peak concurrency.
pub struct StubFetcher {
    handler: Box<Handler>,
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl StubFetcher {
    /// Answer every request with `handler`.
    pub fn new(handler: impl Fn(&str) -> Result<Vec<u8>, TileError> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
        }
    }

    /// Serve the same small PNG for every URL.
    pub fn serving_png() -> Self {
        let bytes = png_bytes(2, 2, [180, 90, 40, 255]);
        Self::new(move |_| Ok(bytes.clone()))
    }

    /// Answer every request with HTTP 404.
    pub fn not_found() -> Self {
        Self::new(|url| {
            Err(TileError::HttpStatus {
                url: url.to_string(),
                status: 404,
            })
        })
    }

    /// Hold each request for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of fetches performed.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of fetches observed running at once.
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }
}

impl TileFetcher for StubFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, TileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let result = (self.handler)(url);
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

type Route = dyn Fn(&str) -> Option<Vec<u8>> + Send + Sync;

/// Loopback HTTP server answering `GET` requests from a routing closure.
///
/// Paths the closure rejects get a 404.
pub struct TileServer {
    server: Arc<tiny_http::Server>,
    port: u16,
    requests: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl TileServer {
    /// Bind to an OS-assigned port and start serving.
    pub fn start(route: impl Fn(&str) -> Option<Vec<u8>> + Send + Sync + 'static) -> Self {
        let server = Arc::new(tiny_http::Server::http("127.0.0.1:0").unwrap());
        let port = server.server_addr().to_ip().unwrap().port();
        let requests = Arc::new(AtomicUsize::new(0));
        let route: Box<Route> = Box::new(route);

        let handle = {
            let server = Arc::clone(&server);
            let requests = Arc::clone(&requests);
            std::thread::spawn(move || {
                for request in server.incoming_requests() {
                    requests.fetch_add(1, Ordering::SeqCst);
                    let _ = match route(request.url()) {
                        Some(body) => request.respond(tiny_http::Response::from_data(body)),
                        None => request.respond(tiny_http::Response::empty(404)),
                    };
                }
            })
        };

        Self {
            server,
            port,
            requests,
            handle: Some(handle),
        }
    }

    /// Base URL of the pyramid served under `/tiles`.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}/tiles", self.port)
    }

    /// Requests answered so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for TileServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
