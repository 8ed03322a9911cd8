//! Flush engine — single storage task that couples the producer queue, the
//! NVRAM ring and the day file.
//!
//! ```text
//! sensor task ──→ bounded mpsc ──→ FlushEngine task
//!                                      │  per record: sink mirror,
//!                                      │  mesh offer, ring append
//!                                      ▼
//!                               DurableRing (NVRAM)
//!                                      │  watermark / periodic
//!                                      ▼  flush passes
//!                           <mount>/<YYYY-MM-DD>.csv
//! ```
//!
//! The engine is the sole mutator of the ring and the day file. Records are
//! consumed from the ring only after `append_verified` has confirmed them
//! on media, which is what makes a power cut at any instant safe. Observers
//! read progress through [`EngineStatus`] atomics.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use chrono::{FixedOffset, Offset};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clock::WallClock;
use crate::config::OnFullPolicy;
use crate::error::{LogError, Result};
use crate::mesh::MeshPeer;
use crate::nvram::NvBlock;
use crate::record::{self, flags, Record, CSV_HEADER};
use crate::sink::LineSink;
use crate::storage::day_file::{utc_date, DayFile};
use crate::storage::ring::DurableRing;

/// How long a queue receive may park before the engine re-checks its
/// periodic flush deadline.
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Counters and flags exported to the producer and to inspection tooling.
/// Approximate readings are fine; the producer only uses them to tag
/// condition bits on records.
#[derive(Debug, Default)]
pub struct EngineStatus {
    pub ring_full: AtomicBool,
    pub degraded: AtomicBool,
    pub saw_corruption: AtomicBool,
    pub buffered_records: AtomicU32,
    pub overrun_records_total: AtomicU64,
    pub sd_fail_count: AtomicU64,
    pub corrupt_skipped_total: AtomicU64,
    pub last_record_id_on_media: AtomicU64,
}

impl EngineStatus {
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn is_ring_full(&self) -> bool {
        self.ring_full.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            ring_full: self.ring_full.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            saw_corruption: self.saw_corruption.load(Ordering::Relaxed),
            buffered_records: self.buffered_records.load(Ordering::Relaxed),
            overrun_records_total: self.overrun_records_total.load(Ordering::Relaxed),
            sd_fail_count: self.sd_fail_count.load(Ordering::Relaxed),
            corrupt_skipped_total: self.corrupt_skipped_total.load(Ordering::Relaxed),
            last_record_id_on_media: self.last_record_id_on_media.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub ring_full: bool,
    pub degraded: bool,
    pub saw_corruption: bool,
    pub buffered_records: u32,
    pub overrun_records_total: u64,
    pub sd_fail_count: u64,
    pub corrupt_skipped_total: u64,
    pub last_record_id_on_media: u64,
}

/// Flattened engine tunables (see `Config::engine_config`).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub node_id: u16,
    pub mount_point: PathBuf,
    pub flush_watermark_records: u32,
    pub flush_period: Duration,
    pub batch_bytes_target: usize,
    pub max_records_per_pass: u32,
    pub max_pass_time: Duration,
    pub backoff: Duration,
    pub tail_scan_bytes: u64,
    pub file_buffer_bytes: usize,
    pub on_full: OnFullPolicy,
    pub local_offset_minutes: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Flushing,
    Degraded,
}

pub struct FlushEngine<N: NvBlock> {
    ring: DurableRing<N>,
    day_file: DayFile,
    cfg: EngineConfig,
    status: Arc<EngineStatus>,
    clock: Arc<WallClock>,
    sink: Option<Box<dyn LineSink + Send>>,
    mesh: Option<Arc<dyn MeshPeer>>,
    local_offset: FixedOffset,
    state: EngineState,
    last_flush: Instant,
    backoff_until: Option<Instant>,
}

impl<N: NvBlock> FlushEngine<N> {
    pub fn new(
        ring: DurableRing<N>,
        cfg: EngineConfig,
        clock: Arc<WallClock>,
        sink: Option<Box<dyn LineSink + Send>>,
        mesh: Option<Arc<dyn MeshPeer>>,
    ) -> Self {
        let day_file = DayFile::new(&cfg.mount_point, cfg.tail_scan_bytes, cfg.file_buffer_bytes);
        let local_offset = FixedOffset::east_opt(cfg.local_offset_minutes * 60)
            .unwrap_or_else(|| chrono::Utc.fix());
        let status = Arc::new(EngineStatus::default());
        let mut engine = Self {
            ring,
            day_file,
            cfg,
            status,
            clock,
            sink,
            mesh,
            local_offset,
            state: EngineState::Idle,
            last_flush: Instant::now(),
            backoff_until: None,
        };
        engine.sync_status();
        engine
    }

    pub fn status(&self) -> Arc<EngineStatus> {
        self.status.clone()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn ring(&self) -> &DurableRing<N> {
        &self.ring
    }

    /// Mirror ring and day-file progress into the shared atomics.
    fn sync_status(&self) {
        let full = self.ring.count() == self.ring.capacity();
        self.status.ring_full.store(full, Ordering::Relaxed);
        self.status
            .buffered_records
            .store(self.ring.count(), Ordering::Relaxed);
        self.status
            .overrun_records_total
            .store(self.ring.overrun_records_total(), Ordering::Relaxed);
        if self.ring.saw_corruption() {
            self.status.saw_corruption.store(true, Ordering::Relaxed);
        }
        self.status
            .last_record_id_on_media
            .store(self.day_file.last_record_id_on_media(), Ordering::Relaxed);
    }

    /// Reconcile with media already containing records at or below the
    /// ring's head. Runs once on engine start and again inside every flush
    /// pass after a day file is (re)opened.
    fn align_with_media(&mut self, target_epoch: i64) -> Result<()> {
        self.day_file.ensure_open_for(target_epoch)?;
        let resume = self.day_file.last_record_id_on_media();
        if resume > 0 {
            match self.ring.consume_up_to(resume) {
                Ok(0) => {}
                Ok(n) => {
                    info!(consumed = n, resume_record_id = resume, "ring aligned with media");
                }
                Err(e) => {
                    error!(error = %e, "corruption while aligning ring with media");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Startup step: mount the media and reconcile against whatever the
    /// current day file already holds. Failures leave the engine degraded
    /// with backoff armed; the ring keeps absorbing records meanwhile.
    pub fn align_on_startup(&mut self) {
        if let Err(e) = std::fs::create_dir_all(&self.cfg.mount_point) {
            self.fail_pass(LogError::Media(format!("mount {:?}: {e}", self.cfg.mount_point)));
            return;
        }
        let epoch = self.clock.fallback_epoch_sec();
        match self.align_with_media(epoch) {
            Ok(()) => {}
            Err(LogError::Corrupt(_)) => {}
            Err(e) => self.fail_pass(e),
        }
        self.sync_status();
    }

    /// Per-record processing, in arrival order: assign ids, mirror to the
    /// line output, offer to the mesh, stage in the ring.
    pub fn handle_record(&mut self, mut rec: Record) {
        let connected = self.mesh.as_ref().is_some_and(|m| m.is_connected());
        if connected {
            rec.flags |= flags::MESH_CONNECTED;
        }

        let full = self.ring.count() == self.ring.capacity();
        let refuse = self.cfg.on_full == OnFullPolicy::DropNewest && full;
        if !refuse {
            if let Err(e) = self.ring.assign_ids(&mut rec) {
                error!(error = %e, "failed to assign record ids");
            }
        }

        if let Some(sink) = self.sink.as_mut() {
            let row = record::format_csv_row(&rec, self.cfg.node_id, self.local_offset);
            sink.write_line(row.as_bytes());
        }
        if connected {
            if let Some(mesh) = &self.mesh {
                if let Err(e) = mesh.send_record(&rec) {
                    debug!(error = %e, "mesh offer failed");
                }
            }
        }

        if refuse {
            debug!(sequence = rec.sequence, "ring full, newest record refused");
        } else if let Err(e) = self.ring.append(&rec) {
            error!(error = %e, record_id = rec.record_id, "ring append failed");
        }
        self.sync_status();
    }

    /// A flush is due when the watermark is reached or the periodic
    /// deadline has elapsed, and there is something to write.
    pub fn flush_due(&self) -> bool {
        self.ring.count() > 0
            && (self.ring.count() >= self.cfg.flush_watermark_records
                || self.last_flush.elapsed() >= self.cfg.flush_period)
    }

    /// One bounded, cooperative flush pass.
    pub fn flush_pass(&mut self) {
        if let Some(until) = self.backoff_until {
            if Instant::now() < until {
                return;
            }
        }
        if let Err(e) = std::fs::create_dir_all(&self.cfg.mount_point) {
            self.fail_pass(LogError::Media(format!("mount {:?}: {e}", self.cfg.mount_point)));
            return;
        }
        self.state = EngineState::Flushing;

        let head = match self.ring.peek_oldest() {
            Ok(rec) => rec,
            Err(LogError::Empty) => {
                self.last_flush = Instant::now();
                self.state = EngineState::Idle;
                return;
            }
            Err(LogError::Corrupt(e)) => {
                warn!(error = %e, "corrupt record at ring head, skipping one slot");
                if let Err(skip) = self.ring.skip_corrupt_oldest() {
                    error!(error = %skip, "failed to skip corrupt slot");
                }
                self.status
                    .corrupt_skipped_total
                    .fetch_add(1, Ordering::Relaxed);
                self.sync_status();
                return;
            }
            Err(e) => {
                error!(error = %e, "ring peek failed");
                return;
            }
        };

        let target_epoch = if head.timestamp_epoch_sec != 0 {
            head.timestamp_epoch_sec
        } else {
            self.clock.fallback_epoch_sec()
        };
        match self.align_with_media(target_epoch) {
            Ok(()) => {}
            Err(LogError::Corrupt(_)) => {
                // Media is healthy; the corrupt slot surfaces at the head
                // and the next pass applies the skip-one rule.
                self.sync_status();
                return;
            }
            Err(e) => {
                self.fail_pass(e);
                return;
            }
        }

        let Some(target_date) = utc_date(target_epoch) else {
            error!(epoch = target_epoch, "unrepresentable flush target date");
            return;
        };

        // Batch build: bounded by bytes, records, wall time, day boundary
        // and ring exhaustion.
        let deadline = Instant::now() + self.cfg.max_pass_time;
        let mut buf = BytesMut::with_capacity(self.cfg.batch_bytes_target);
        let mut used: u32 = 0;
        let mut last_id: u64 = 0;
        while used < self.ring.count()
            && used < self.cfg.max_records_per_pass
            && buf.len() < self.cfg.batch_bytes_target
            && Instant::now() < deadline
        {
            let rec = match self.ring.peek_offset(used) {
                Ok(rec) => rec,
                Err(LogError::Corrupt(e)) => {
                    warn!(offset = used, error = %e, "corrupt slot ends batch");
                    break;
                }
                Err(e) => {
                    error!(offset = used, error = %e, "ring peek failed, ending batch");
                    break;
                }
            };
            let rec_epoch = if rec.timestamp_epoch_sec != 0 {
                rec.timestamp_epoch_sec
            } else {
                self.clock.fallback_epoch_sec()
            };
            if utc_date(rec_epoch) != Some(target_date) {
                break;
            }
            let row = record::format_csv_row(&rec, self.cfg.node_id, self.local_offset);
            buf.extend_from_slice(row.as_bytes());
            last_id = rec.record_id;
            used += 1;
        }
        if used == 0 {
            return;
        }

        match self.day_file.append_verified(&buf, last_id) {
            Ok(()) => {
                for _ in 0..used {
                    if let Err(e) = self.ring.discard_oldest() {
                        error!(error = %e, "discard after verified append failed");
                        break;
                    }
                }
                self.state = EngineState::Idle;
                self.status.degraded.store(false, Ordering::Relaxed);
                self.backoff_until = None;
                self.last_flush = Instant::now();
                self.sync_status();
                debug!(
                    records = used,
                    bytes = buf.len(),
                    last_record_id = last_id,
                    "batch flushed"
                );
            }
            Err(e) => self.fail_pass(e),
        }
    }

    /// Media failure path: close the file, enter degraded state, arm the
    /// backoff window. The ring is not advanced.
    fn fail_pass(&mut self, e: LogError) {
        let _ = self.day_file.close();
        self.state = EngineState::Degraded;
        self.status.degraded.store(true, Ordering::Relaxed);
        self.status.sd_fail_count.fetch_add(1, Ordering::Relaxed);
        self.backoff_until = Some(Instant::now() + self.cfg.backoff);
        warn!(
            error = %e,
            backoff_ms = self.cfg.backoff.as_millis() as u64,
            "flush failed, engine degraded"
        );
        self.sync_status();
    }

    /// Drain the ring on shutdown, stopping at the first pass that makes no
    /// progress (degraded media must not stall teardown — the ring is
    /// crash-safe either way).
    fn final_flush(&mut self) {
        loop {
            if self.ring.count() == 0 {
                return;
            }
            if let Some(until) = self.backoff_until {
                if Instant::now() < until {
                    return;
                }
            }
            let before = self.ring.count();
            self.flush_pass();
            if self.ring.count() >= before {
                return;
            }
        }
    }

    /// The storage task body: drain the producer queue, run flush passes on
    /// watermark or period, exit when every sender is gone.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Record>) {
        info!(
            mount = ?self.cfg.mount_point,
            watermark = self.cfg.flush_watermark_records,
            period_ms = self.cfg.flush_period.as_millis() as u64,
            "flush engine started"
        );
        self.align_on_startup();
        if let Some(sink) = self.sink.as_mut() {
            sink.write_line(CSV_HEADER.as_bytes());
        }

        loop {
            match tokio::time::timeout(RECV_TIMEOUT, rx.recv()).await {
                Ok(Some(rec)) => self.handle_record(rec),
                Ok(None) => break,
                Err(_) => {}
            }
            if self.flush_due() {
                self.flush_pass();
            }
        }

        // Cooperative shutdown: drain what is queued, one last flush, close.
        while let Ok(rec) = rx.try_recv() {
            self.handle_record(rec);
        }
        self.final_flush();
        if let Err(e) = self.day_file.close() {
            warn!(error = %e, "day file close failed during shutdown");
        }
        info!(unflushed = self.ring.count(), "flush engine stopped");
    }
}

impl<N: NvBlock + Send + 'static> FlushEngine<N> {
    /// Create the producer channel and spawn the engine task.
    pub fn spawn(
        self,
        queue_capacity: usize,
    ) -> (mpsc::Sender<Record>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }
}
