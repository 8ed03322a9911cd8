// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Durable ring buffer of records in NVRAM.
//!
//! ## NVRAM layout
//!
//! ```text
//! [RingHeader copy 0 : offset   0]
//! [RingHeader copy 1 : offset 128]
//! [record slots      : offset 256]   slot k at 256 + (k mod capacity) * 46
//!
//! RingHeader (40 bytes, LE):
//!   magic          : u32 = 0x46524C47
//!   version        : u32
//!   generation     : u32   picks the authoritative copy after reboot
//!   write_index    : u32   abstract monotonic position
//!   read_index     : u32   abstract monotonic position
//!   record_count   : u32   = write_index - read_index
//!   next_sequence  : u32
//!   next_record_id : u64
//!   crc32          : u32   IEEE, over the header with this field zeroed
//! ```
//!
//! Persists alternate between the two copies and are validated by read-back
//! before the new generation is adopted, so a write torn by a power cut
//! leaves the previous copy authoritative and the ring state unchanged.
//! Counters are persisted during `assign_ids`, before the slot itself is
//! written: a crash may hide the newest records behind a stale
//! `write_index`, but their ids are burned and never reissued.

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISO_HDLC};
use tracing::{debug, info, warn};

use crate::error::{LogError, Result};
use crate::nvram::NvBlock;
use crate::record::{self, Record, RECORD_SIZE};

pub const RING_MAGIC: u32 = 0x4652_4C47;
pub const RING_VERSION: u32 = 1;
pub const HEADER0_OFFSET: u32 = 0;
pub const HEADER1_OFFSET: u32 = 128;
pub const SLOTS_OFFSET: u32 = 256;
pub const HEADER_SIZE: usize = 40;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const RECORD_SIZE_U32: u32 = RECORD_SIZE as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RingHeader {
    generation: u32,
    write_index: u32,
    read_index: u32,
    record_count: u32,
    next_sequence: u32,
    next_record_id: u64,
}

impl RingHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], RING_MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], RING_VERSION);
        LittleEndian::write_u32(&mut buf[8..12], self.generation);
        LittleEndian::write_u32(&mut buf[12..16], self.write_index);
        LittleEndian::write_u32(&mut buf[16..20], self.read_index);
        LittleEndian::write_u32(&mut buf[20..24], self.record_count);
        LittleEndian::write_u32(&mut buf[24..28], self.next_sequence);
        LittleEndian::write_u64(&mut buf[28..36], self.next_record_id);
        let crc = CRC32.checksum(&buf[..HEADER_SIZE - 4]);
        LittleEndian::write_u32(&mut buf[36..40], crc);
        buf
    }

    /// `None` if magic, version or CRC do not check out.
    fn decode(buf: &[u8; HEADER_SIZE]) -> Option<Self> {
        if LittleEndian::read_u32(&buf[0..4]) != RING_MAGIC {
            return None;
        }
        if LittleEndian::read_u32(&buf[4..8]) != RING_VERSION {
            return None;
        }
        let stored = LittleEndian::read_u32(&buf[36..40]);
        if stored != CRC32.checksum(&buf[..HEADER_SIZE - 4]) {
            return None;
        }
        Some(Self {
            generation: LittleEndian::read_u32(&buf[8..12]),
            write_index: LittleEndian::read_u32(&buf[12..16]),
            read_index: LittleEndian::read_u32(&buf[16..20]),
            record_count: LittleEndian::read_u32(&buf[20..24]),
            next_sequence: LittleEndian::read_u32(&buf[24..28]),
            next_record_id: LittleEndian::read_u64(&buf[28..36]),
        })
    }
}

/// Fixed-capacity queue of records in NVRAM, sole owner of its byte range.
/// Mutated only by the flush engine.
pub struct DurableRing<N: NvBlock> {
    nv: N,
    capacity: u32,
    generation: u32,
    /// Which header copy holds `generation`. The next persist targets the
    /// other copy.
    copy_index: u8,
    write_index: u32,
    read_index: u32,
    record_count: u32,
    next_sequence: u32,
    next_record_id: u64,
    persist_every: u32,
    assigns_since_persist: u32,
    overrun_records_total: u64,
    saw_corruption: bool,
}

impl<N: NvBlock> DurableRing<N> {
    /// Probe both header copies and restore cursors and counters.
    ///
    /// `persist_every` is the id-assignment cadence at which the header is
    /// re-persisted (1 = every assignment).
    pub fn open(mut nv: N, persist_every: u32) -> Result<Self> {
        let size = nv.size();
        if size <= SLOTS_OFFSET || (size - SLOTS_OFFSET) / RECORD_SIZE_U32 == 0 {
            return Err(LogError::BadSize { nvram_bytes: size });
        }
        let capacity = (size - SLOTS_OFFSET) / RECORD_SIZE_U32;

        let h0 = Self::read_header(&mut nv, HEADER0_OFFSET)?;
        let h1 = Self::read_header(&mut nv, HEADER1_OFFSET)?;

        let mut ring = Self {
            nv,
            capacity,
            generation: 0,
            copy_index: 1,
            write_index: 0,
            read_index: 0,
            record_count: 0,
            next_sequence: 1,
            next_record_id: 1,
            persist_every: persist_every.max(1),
            assigns_since_persist: 0,
            overrun_records_total: 0,
            saw_corruption: false,
        };

        match (h0, h1) {
            (None, None) => ring.recover_from_slots()?,
            (Some(h), None) => ring.adopt(h, 0),
            (None, Some(h)) => ring.adopt(h, 1),
            (Some(a), Some(b)) => {
                if b.generation > a.generation {
                    ring.adopt(b, 1);
                } else {
                    ring.adopt(a, 0);
                }
            }
        }

        ring.raise_counters_from_slots()?;

        info!(
            capacity = ring.capacity,
            buffered = ring.record_count,
            generation = ring.generation,
            next_sequence = ring.next_sequence,
            next_record_id = ring.next_record_id,
            "durable ring opened"
        );
        Ok(ring)
    }

    fn read_header(nv: &mut N, offset: u32) -> Result<Option<RingHeader>> {
        let mut buf = [0u8; HEADER_SIZE];
        nv.read(offset, &mut buf)?;
        Ok(RingHeader::decode(&buf))
    }

    fn adopt(&mut self, h: RingHeader, copy: u8) {
        self.generation = h.generation;
        self.copy_index = copy;
        self.write_index = h.write_index;
        self.read_index = h.read_index;
        self.record_count = h.record_count.min(self.capacity);
        self.next_sequence = h.next_sequence;
        self.next_record_id = h.next_record_id;
        if h.record_count > self.capacity {
            warn!(
                record_count = h.record_count,
                capacity = self.capacity,
                "ring header count clamped to capacity"
            );
        }
    }

    /// Both headers unreadable: scan every slot for the largest valid
    /// record id so new assignments stay monotonic, then start empty.
    fn recover_from_slots(&mut self) -> Result<()> {
        warn!("both ring headers invalid, scanning slots for max record id");
        let mut max_id: u64 = 0;
        for slot in 0..self.capacity {
            let mut buf = [0u8; RECORD_SIZE];
            self.nv.read(SLOTS_OFFSET + slot * RECORD_SIZE_U32, &mut buf)?;
            if let Ok(rec) = record::decode(&buf) {
                max_id = max_id.max(rec.record_id);
            }
        }
        self.next_record_id = max_id + 1;
        self.next_sequence = 1;
        self.write_index = 0;
        self.read_index = 0;
        self.record_count = 0;
        self.generation = 0;
        self.copy_index = 1;
        self.persist_header()
    }

    /// Walk the buffered range and raise `next_sequence`/`next_record_id`
    /// above every valid slot in it.
    fn raise_counters_from_slots(&mut self) -> Result<()> {
        for k in 0..self.record_count {
            let pos = self.read_index.wrapping_add(k);
            let mut buf = [0u8; RECORD_SIZE];
            self.nv.read(self.slot_addr(pos), &mut buf)?;
            match record::decode(&buf) {
                Ok(rec) => {
                    self.next_sequence = self.next_sequence.max(rec.sequence.wrapping_add(1));
                    self.next_record_id = self.next_record_id.max(rec.record_id + 1);
                }
                Err(e) => {
                    warn!(offset = k, error = %e, "invalid slot inside buffered range");
                    self.saw_corruption = true;
                }
            }
        }
        Ok(())
    }

    fn slot_addr(&self, pos: u32) -> u32 {
        SLOTS_OFFSET + (pos % self.capacity) * RECORD_SIZE_U32
    }

    /// Write the next-generation header to the copy not currently
    /// authoritative, read it back, and adopt it only if it validates.
    fn persist_header(&mut self) -> Result<()> {
        let new_gen = self.generation.wrapping_add(1);
        let header = RingHeader {
            generation: new_gen,
            write_index: self.write_index,
            read_index: self.read_index,
            record_count: self.record_count,
            next_sequence: self.next_sequence,
            next_record_id: self.next_record_id,
        };
        let target_copy = self.copy_index ^ 1;
        let offset = if target_copy == 0 { HEADER0_OFFSET } else { HEADER1_OFFSET };

        let bytes = header.encode();
        self.nv.write(offset, &bytes)?;

        let mut back = [0u8; HEADER_SIZE];
        self.nv.read(offset, &mut back)?;
        match RingHeader::decode(&back) {
            Some(h) if h == header => {
                self.generation = new_gen;
                self.copy_index = target_copy;
                self.assigns_since_persist = 0;
                Ok(())
            }
            _ => Err(LogError::Nv(format!(
                "header copy {target_copy} failed read-back validation"
            ))),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn count(&self) -> u32 {
        self.record_count
    }

    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    pub fn next_record_id(&self) -> u64 {
        self.next_record_id
    }

    pub fn overrun_records_total(&self) -> u64 {
        self.overrun_records_total
    }

    pub fn saw_corruption(&self) -> bool {
        self.saw_corruption
    }

    /// Tear down the ring and hand the NVRAM back (used by reboot tests and
    /// inspection tooling).
    pub fn into_inner(self) -> N {
        self.nv
    }

    /// Stamp `sequence` and `record_id` and advance the counters. The
    /// header is re-persisted every `persist_every` assignments, before the
    /// slot write, so an id is burned even if the record never lands.
    pub fn assign_ids(&mut self, rec: &mut Record) -> Result<()> {
        rec.sequence = self.next_sequence;
        rec.record_id = self.next_record_id;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.next_record_id += 1;
        self.assigns_since_persist += 1;
        if self.assigns_since_persist >= self.persist_every {
            self.persist_header()?;
        }
        Ok(())
    }

    /// Persist the record into the slot at `write_index`. Ids must already
    /// be assigned. A full ring overwrites the oldest record and counts it
    /// in `overrun_records_total` — the single explicit drop policy.
    pub fn append(&mut self, rec: &Record) -> Result<()> {
        if self.record_count == self.capacity {
            self.read_index = self.read_index.wrapping_add(1);
            self.record_count -= 1;
            self.overrun_records_total += 1;
            debug!(
                overrun_total = self.overrun_records_total,
                "ring full, oldest record overwritten"
            );
        }
        let bytes = record::encode(rec);
        self.nv.write(self.slot_addr(self.write_index), &bytes)?;
        self.write_index = self.write_index.wrapping_add(1);
        self.record_count += 1;
        Ok(())
    }

    fn read_slot(&mut self, pos: u32) -> Result<Record> {
        let mut buf = [0u8; RECORD_SIZE];
        self.nv.read(self.slot_addr(pos), &mut buf)?;
        record::decode(&buf).map_err(|e| {
            self.saw_corruption = true;
            LogError::Corrupt(e)
        })
    }

    /// Copy of the record at the read cursor.
    pub fn peek_oldest(&mut self) -> Result<Record> {
        if self.record_count == 0 {
            return Err(LogError::Empty);
        }
        self.read_slot(self.read_index)
    }

    /// Copy of the record `k` positions past the read cursor.
    pub fn peek_offset(&mut self, k: u32) -> Result<Record> {
        if k >= self.record_count {
            return Err(LogError::OutOfRange { offset: k, count: self.record_count });
        }
        self.read_slot(self.read_index.wrapping_add(k))
    }

    /// Drop the oldest record and persist the advanced read cursor.
    pub fn discard_oldest(&mut self) -> Result<()> {
        if self.record_count == 0 {
            return Err(LogError::Empty);
        }
        self.read_index = self.read_index.wrapping_add(1);
        self.record_count -= 1;
        self.persist_header()
    }

    /// Advance past the head slot regardless of its validity. The ring
    /// never drops a corrupt slot on its own; this is the caller's explicit
    /// decision and it is counted via `saw_corruption`.
    pub fn skip_corrupt_oldest(&mut self) -> Result<()> {
        if self.record_count == 0 {
            return Err(LogError::Empty);
        }
        self.saw_corruption = true;
        self.read_index = self.read_index.wrapping_add(1);
        self.record_count -= 1;
        self.persist_header()
    }

    /// Pop records from the head while `record_id <= bound` (inclusive).
    /// Returns how many were consumed; stops with `Corrupt` at the first
    /// slot that fails validation.
    pub fn consume_up_to(&mut self, bound: u64) -> Result<u32> {
        let mut consumed = 0u32;
        while self.record_count > 0 {
            let rec = self.read_slot(self.read_index)?;
            if rec.record_id > bound {
                break;
            }
            self.discard_oldest()?;
            consumed += 1;
        }
        Ok(consumed)
    }
}
