// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Process-wide wall clock with a validity bit.
//!
//! Records carry `epoch = 0` until the clock becomes valid; the storage
//! layer tolerates that by falling back to [`WallClock::fallback_epoch_sec`]
//! for file-naming decisions only. The time-sync task is the sole writer;
//! nothing in the storage path depends on it for correctness.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::mesh::MeshPeer;

/// System clocks before this are assumed unset (battery-backed RTC lost).
const CLOCK_SANITY_EPOCH_SEC: i64 = 1_600_000_000;

pub struct WallClock {
    valid: AtomicBool,
    /// Correction applied on top of the system clock, e.g. from mesh time
    /// synchronization.
    offset_ms: RwLock<i64>,
}

impl WallClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { valid: AtomicBool::new(false), offset_ms: RwLock::new(0) })
    }

    fn raw_epoch_ms() -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            Err(_) => 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    pub fn mark_valid(&self) {
        self.valid.store(true, Ordering::Relaxed);
    }

    pub fn apply_offset_ms(&self, delta_ms: i64) {
        *self.offset_ms.write() += delta_ms;
    }

    /// `(epoch_sec, millis)` once the clock is valid, `None` before.
    pub fn now(&self) -> Option<(i64, i32)> {
        if !self.is_valid() {
            return None;
        }
        let ms = Self::raw_epoch_ms() + *self.offset_ms.read();
        Some((ms.div_euclid(1000), ms.rem_euclid(1000) as i32))
    }

    /// Best-effort epoch regardless of validity. Used only where a time is
    /// needed unconditionally (day-file naming for epoch-zero records).
    pub fn fallback_epoch_sec(&self) -> i64 {
        (Self::raw_epoch_ms() + *self.offset_ms.read()).div_euclid(1000)
    }
}

/// Periodic task that flips the validity bit once the system clock looks
/// sane and exchanges time with the mesh when a peer is configured.
pub fn spawn_time_sync(
    clock: Arc<WallClock>,
    mesh: Option<Arc<dyn MeshPeer>>,
    stop: Arc<std::sync::atomic::AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        let mut since_broadcast = Duration::ZERO;
        loop {
            tick.tick().await;
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let raw_sec = WallClock::raw_epoch_ms() / 1000;
            if !clock.is_valid() {
                if raw_sec > CLOCK_SANITY_EPOCH_SEC {
                    clock.mark_valid();
                    info!(epoch = raw_sec, "wall clock marked valid");
                } else if let Some(peer) = &mesh {
                    if peer.is_connected() {
                        debug!("requesting time from mesh");
                        peer.request_time();
                    }
                }
            } else if let Some(peer) = &mesh {
                since_broadcast += Duration::from_secs(1);
                if peer.is_connected() && since_broadcast >= Duration::from_secs(60) {
                    peer.broadcast_time(clock.fallback_epoch_sec());
                    since_broadcast = Duration::ZERO;
                }
            }
        }
    })
}
