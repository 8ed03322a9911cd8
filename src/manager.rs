// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Datalogger lifecycle: opens the NVRAM ring, spawns the engine, sensor
//! and time-sync tasks, and tears them down cooperatively.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::{self, WallClock};
use crate::config::Config;
use crate::error::Result;
use crate::mesh::MeshPeer;
use crate::nvram::FileNvram;
use crate::sensor::{self, SensorSource};
use crate::sink::LineSink;
use crate::storage::engine::{EngineStatus, FlushEngine};
use crate::storage::ring::DurableRing;

/// Bound on cooperative shutdown. A timeout leaves the ring consistent
/// (slot and header writes are crash-safe) but may leave records
/// unflushed for the next start to drain.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Datalogger {
    status: Arc<EngineStatus>,
    stop: Arc<AtomicBool>,
    engine_handle: JoinHandle<()>,
    sensor_handle: JoinHandle<()>,
    time_sync_handle: JoinHandle<()>,
}

impl Datalogger {
    /// Open storage and start all three tasks. Must run inside a tokio
    /// runtime.
    pub fn start(
        cfg: &Config,
        source: Box<dyn SensorSource>,
        sink: Option<Box<dyn LineSink + Send>>,
        mesh: Option<Arc<dyn MeshPeer>>,
    ) -> Result<Self> {
        let nv = FileNvram::open(&cfg.nvram.path, cfg.nvram.size_bytes)?;
        let ring = DurableRing::open(nv, cfg.nvram.persist_every)?;
        let clock = WallClock::new();

        let engine = FlushEngine::new(ring, cfg.engine_config(), clock.clone(), sink, mesh.clone());
        let status = engine.status();
        let (tx, engine_handle) = engine.spawn(cfg.storage.queue_capacity);

        let stop = Arc::new(AtomicBool::new(false));
        let sensor_handle = sensor::spawn_sensor(
            source,
            tx,
            clock.clone(),
            status.clone(),
            Duration::from_millis(cfg.sensor.log_period_ms),
            stop.clone(),
        );
        let time_sync_handle = clock::spawn_time_sync(clock, mesh, stop.clone());

        info!(
            node_id = cfg.node_id,
            nvram = ?cfg.nvram.path,
            mount = ?cfg.storage.mount_point,
            "datalogger started"
        );
        Ok(Self { status, stop, engine_handle, sensor_handle, time_sync_handle })
    }

    pub fn status(&self) -> Arc<EngineStatus> {
        self.status.clone()
    }

    /// Cooperative shutdown: stop the producer, let the engine drain the
    /// queue and run a final flush, then close the file. Bounded by
    /// [`SHUTDOWN_TIMEOUT`].
    pub async fn shutdown(self) {
        info!("datalogger shutting down");
        self.stop.store(true, Ordering::Relaxed);

        let drain = async {
            // The sensor drops its sender on exit, which lets the engine
            // finish its receive loop.
            let _ = self.sensor_handle.await;
            let _ = self.engine_handle.await;
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            warn!("shutdown timed out, records may remain unflushed in the ring");
        }
        self.time_sync_handle.abort();
        info!("datalogger stopped");
    }
}
