// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Sensor producer task.
//!
//! Samples a [`SensorSource`] every `log_period_ms`, assembles a partial
//! record (ids are assigned later by the ring) and hands it to the engine
//! through the bounded queue. Enqueue is non-blocking: when the queue is
//! full the newest record is dropped here and the following records carry
//! the `FRAM_FULL` bit. The producer never touches the ring or the media.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::WallClock;
use crate::error::Result;
use crate::record::{flags, Record, SCHEMA_VERSION};
use crate::storage::engine::EngineStatus;

/// One conversion result from the measurement front end, in milli-units.
#[derive(Debug, Clone, Copy)]
pub struct Measurement {
    pub raw_temp_milli_c: i32,
    pub temp_milli_c: i32,
    pub resistance_milli_ohm: i32,
    /// Calibration coefficients were applied.
    pub cal_valid: bool,
}

/// Measurement front end capability. Implementations must not block for
/// longer than a conversion takes.
pub trait SensorSource: Send {
    fn sample(&mut self) -> Result<Measurement>;
}

/// Deterministic triangle-wave source so the binary runs without hardware:
/// 18–24 °C, PT100-shaped resistance, a fixed pseudo-calibration offset.
pub struct SimulatedPt100 {
    step: u32,
}

impl SimulatedPt100 {
    pub fn new() -> Self {
        Self { step: 0 }
    }
}

impl Default for SimulatedPt100 {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSource for SimulatedPt100 {
    fn sample(&mut self) -> Result<Measurement> {
        let phase = self.step % 240;
        let tri = if phase < 120 { phase } else { 240 - phase };
        self.step = self.step.wrapping_add(1);

        let temp_milli_c = 18_000 + (tri as i32) * 50;
        // PT100: ~0.385 Ohm/degC on a 100 Ohm element.
        let resistance_milli_ohm = 100_000 + temp_milli_c * 385 / 1000;
        Ok(Measurement {
            raw_temp_milli_c: temp_milli_c - 150,
            temp_milli_c,
            resistance_milli_ohm,
            cal_valid: true,
        })
    }
}

/// Spawn the sampling loop. Exits when `stop` is set or the engine side of
/// the queue is gone; dropping its sender is what lets the engine drain and
/// finish.
pub fn spawn_sensor(
    mut source: Box<dyn SensorSource>,
    tx: mpsc::Sender<Record>,
    clock: Arc<WallClock>,
    status: Arc<EngineStatus>,
    period: Duration,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(period_ms = period.as_millis() as u64, "sensor task started");
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut queue_full = false;

        loop {
            tick.tick().await;
            if stop.load(Ordering::Relaxed) {
                break;
            }

            let mut f: u16 = 0;
            let (epoch, millis) = match clock.now() {
                Some((sec, ms)) => {
                    f |= flags::TIME_VALID;
                    (sec, ms)
                }
                None => (0, 0),
            };

            let m = match source.sample() {
                Ok(m) => {
                    if m.cal_valid {
                        f |= flags::CAL_VALID;
                    }
                    m
                }
                Err(e) => {
                    warn!(error = %e, "sensor read failed");
                    f |= flags::SENSOR_FAULT;
                    Measurement {
                        raw_temp_milli_c: 0,
                        temp_milli_c: 0,
                        resistance_milli_ohm: 0,
                        cal_valid: false,
                    }
                }
            };

            if status.is_degraded() {
                f |= flags::SD_ERROR;
            }
            if status.is_ring_full() || queue_full {
                f |= flags::FRAM_FULL;
            }

            let rec = Record {
                schema_version: SCHEMA_VERSION,
                sequence: 0,
                record_id: 0,
                timestamp_epoch_sec: epoch,
                timestamp_millis: millis,
                raw_temp_milli_c: m.raw_temp_milli_c,
                temp_milli_c: m.temp_milli_c,
                resistance_milli_ohm: m.resistance_milli_ohm,
                flags: f,
            };

            match tx.try_send(rec) {
                Ok(()) => queue_full = false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if !queue_full {
                        warn!("producer queue full, dropping newest record");
                    }
                    queue_full = true;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    error!("engine queue closed, sensor task exiting");
                    break;
                }
            }
        }
        info!("sensor task stopped");
    })
}
