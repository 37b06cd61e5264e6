//! Background geometry worker.
//!
//! Requests carry everything a worker needs by value and responses move
//! the finished buffers back to the frame thread, so no state is shared
//! besides the in-flight counter.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::coord::TileCoordinate;
use crate::error::TileError;
use crate::geometry::{GeometryParams, TileGeometry, build_tile_geometry};
use crate::visibility::{CameraState, TileVisibility, VisibilityDriver};

/// Work accepted by [`GeometryWorker`].
#[derive(Debug, Clone)]
pub enum WorkerRequest {
    /// Build the mesh buffers of one tile.
    BuildGeometry {
        /// Correlation id echoed in the response.
        id: u64,
        /// Geometry inputs.
        params: GeometryParams,
    },
    /// Build several tiles in one round trip (typically the four children of a split).
    BatchBuildGeometry {
        /// Correlation id echoed in the response.
        id: u64,
        /// Geometry inputs, answered in the same order.
        params: Vec<GeometryParams>,
    },
    /// Classify tiles against a camera.
    CalculateVisible {
        /// Correlation id echoed in the response.
        id: u64,
        /// Camera to test against.
        camera: CameraState,
        /// Tiles to classify.
        tiles: Vec<TileCoordinate>,
        /// Thresholds to apply.
        driver: VisibilityDriver,
    },
}

impl WorkerRequest {
    /// Correlation id of the request.
    pub fn id(&self) -> u64 {
        match self {
            WorkerRequest::BuildGeometry { id, .. }
            | WorkerRequest::BatchBuildGeometry { id, .. }
            | WorkerRequest::CalculateVisible { id, .. } => *id,
        }
    }
}

/// Results produced by [`GeometryWorker`].
#[derive(Debug)]
pub enum WorkerResponse {
    /// Answer to [`WorkerRequest::BuildGeometry`].
    Geometry {
        /// Id of the request.
        id: u64,
        /// The built buffers.
        geometry: TileGeometry,
    },
    /// Answer to [`WorkerRequest::BatchBuildGeometry`].
    GeometryBatch {
        /// Id of the request.
        id: u64,
        /// The built buffers, in request order.
        geometries: Vec<TileGeometry>,
    },
    /// Answer to [`WorkerRequest::CalculateVisible`].
    Visible {
        /// Id of the request.
        id: u64,
        /// One classification per requested tile, in request order.
        tiles: Vec<TileVisibility>,
    },
}

impl WorkerResponse {
    /// Correlation id of the request this answers.
    pub fn id(&self) -> u64 {
        match self {
            WorkerResponse::Geometry { id, .. }
            | WorkerResponse::GeometryBatch { id, .. }
            | WorkerResponse::Visible { id, .. } => *id,
        }
    }
}

fn answer(request: WorkerRequest) -> WorkerResponse {
    match request {
        WorkerRequest::BuildGeometry { id, params } => WorkerResponse::Geometry {
            id,
            geometry: build_tile_geometry(&params),
        },
        WorkerRequest::BatchBuildGeometry { id, params } => WorkerResponse::GeometryBatch {
            id,
            geometries: params.iter().map(build_tile_geometry).collect(),
        },
        WorkerRequest::CalculateVisible {
            id,
            camera,
            tiles,
            driver,
        } => WorkerResponse::Visible {
            id,
            tiles: tiles
                .iter()
                .map(|coord| driver.classify(coord, &camera))
                .collect(),
        },
    }
}

/// Thread pool answering [`WorkerRequest`]s.
pub struct GeometryWorker {
    request_sender: Option<Sender<WorkerRequest>>,
    response_receiver: Receiver<WorkerResponse>,
    handles: Vec<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
}

impl GeometryWorker {
    /// Spawn `worker_count` threads (at least one).
    pub fn new(worker_count: usize) -> Result<Self, TileError> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<WorkerRequest>();
        let (response_tx, response_rx) = crossbeam_channel::unbounded::<WorkerResponse>();
        let in_flight = Arc::new(AtomicUsize::new(0));

        let worker_count = worker_count.max(1);
        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let rx = request_rx.clone();
            let tx = response_tx.clone();
            let flight = Arc::clone(&in_flight);

            let handle = std::thread::Builder::new()
                .name(format!("tile-geometry-{index}"))
                .spawn(move || {
                    while let Ok(request) = rx.recv() {
                        let response = answer(request);
                        flight.fetch_sub(1, Ordering::Relaxed);
                        if tx.send(response).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|source| TileError::Spawn {
                    name: "tile geometry",
                    source,
                })?;
            handles.push(handle);
        }

        Ok(Self {
            request_sender: Some(request_tx),
            response_receiver: response_rx,
            handles,
            in_flight,
        })
    }

    /// Spawn a pool sized to leave headroom for the frame and fetch threads.
    pub fn with_defaults() -> Result<Self, TileError> {
        let cpus = num_cpus::get().max(2);
        Self::new((cpus - 2).max(1))
    }

    /// Queue a request.
    pub fn submit(&self, request: WorkerRequest) -> Result<(), TileError> {
        let sender = self.request_sender.as_ref().ok_or(TileError::WorkerClosed)?;
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        if sender.send(request).is_err() {
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            return Err(TileError::WorkerClosed);
        }
        Ok(())
    }

    /// Collect every finished response without blocking.
    pub fn drain_responses(&self) -> Vec<WorkerResponse> {
        self.response_receiver.try_iter().collect()
    }

    /// Wait up to `timeout` for the next response.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WorkerResponse> {
        self.response_receiver.recv_timeout(timeout).ok()
    }

    /// Requests submitted but not yet answered.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Close the request channel and join the threads.
    pub fn shutdown(&mut self) {
        self.request_sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for GeometryWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;
    use std::time::Instant;

    const RADIUS: f64 = 3_396_190.0;

    fn params(coord: TileCoordinate) -> GeometryParams {
        GeometryParams {
            coord,
            radius: RADIUS,
            segments: 8,
            skirts: true,
            skirt_depth_factor: 0.02,
        }
    }

    fn wait_for(worker: &GeometryWorker) -> WorkerResponse {
        worker
            .recv_timeout(Duration::from_secs(5))
            .expect("worker did not answer")
    }

    #[test]
    fn test_build_matches_inline() {
        let worker = GeometryWorker::new(2).unwrap();
        let coord = TileCoordinate::new(3, 9, 2).unwrap();
        worker
            .submit(WorkerRequest::BuildGeometry {
                id: 7,
                params: params(coord),
            })
            .unwrap();

        match wait_for(&worker) {
            WorkerResponse::Geometry { id, geometry } => {
                assert_eq!(id, 7);
                assert_eq!(geometry, build_tile_geometry(&params(coord)));
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_batch_preserves_order() {
        let worker = GeometryWorker::new(1).unwrap();
        let children = TileCoordinate::new(2, 1, 1).unwrap().children().unwrap();
        let request = WorkerRequest::BatchBuildGeometry {
            id: 11,
            params: children.iter().copied().map(params).collect(),
        };
        assert_eq!(request.id(), 11);
        worker.submit(request).unwrap();

        match wait_for(&worker) {
            WorkerResponse::GeometryBatch { id, geometries } => {
                assert_eq!(id, 11);
                let coords: Vec<_> = geometries.iter().map(|g| g.coord).collect();
                assert_eq!(coords, children.to_vec());
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_calculate_visible() {
        let worker = GeometryWorker::new(1).unwrap();
        let driver = VisibilityDriver {
            radius: RADIUS,
            max_level: 6,
            threshold_px: 60.0,
            hysteresis: 0.0,
            backface_threshold: -0.2,
        };
        // Camera far out along +X sees longitude 0 and cannot see longitude ±π.
        let camera = CameraState::look_at(DVec3::X * RADIUS * 4.0, DVec3::ZERO, 60.0, 1080.0);
        let facing = TileCoordinate::containing(2, 0.05, 0.05).unwrap();
        let hidden = TileCoordinate::containing(2, 3.1, 0.05).unwrap();

        worker
            .submit(WorkerRequest::CalculateVisible {
                id: 3,
                camera,
                tiles: vec![facing, hidden],
                driver,
            })
            .unwrap();

        match wait_for(&worker) {
            WorkerResponse::Visible { id, tiles } => {
                assert_eq!(id, 3);
                assert!(!tiles[0].back_facing);
                assert!(tiles[1].back_facing);
                assert!(tiles[0].screen_px > 0.0);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_in_flight_returns_to_zero() {
        let worker = GeometryWorker::new(2).unwrap();
        for (i, coord) in TileCoordinate::level_tiles(1).enumerate() {
            worker
                .submit(WorkerRequest::BuildGeometry {
                    id: i as u64,
                    params: params(coord),
                })
                .unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut responses = Vec::new();
        while responses.len() < 8 && Instant::now() < deadline {
            responses.extend(worker.recv_timeout(Duration::from_millis(100)));
            responses.extend(worker.drain_responses());
        }
        assert_eq!(responses.len(), 8);
        let mut ids: Vec<_> = responses.iter().map(WorkerResponse::id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
        assert_eq!(worker.in_flight_count(), 0);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let mut worker = GeometryWorker::new(1).unwrap();
        worker.shutdown();
        let coord = TileCoordinate::new(1, 0, 0).unwrap();
        assert!(matches!(
            worker.submit(WorkerRequest::BuildGeometry {
                id: 0,
                params: params(coord),
            }),
            Err(TileError::WorkerClosed)
        ));
    }
}
