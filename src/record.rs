// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Fixed-size sensor record: binary codec for NVRAM slots and the CSV row
//! format written to removable media.
//!
//! ## Slot layout (packed, little-endian, 46 bytes)
//!
//! ```text
//! magic                : u32 = 0x544C4F47 ("TLOG")
//! schema_version       : u16
//! sequence             : u32   producer-order counter
//! record_id            : u64   globally monotonic, never wraps
//! timestamp_epoch_sec  : i64   UTC, 0 until the wall clock is valid
//! timestamp_millis     : i32   0..999
//! raw_temp_milli_c     : i32
//! temp_milli_c         : i32
//! resistance_milli_ohm : i32
//! flags                : u16
//! crc16_ccitt          : u16   CRC-16/CCITT-FALSE over all prior bytes
//! ```

use byteorder::{ByteOrder, LittleEndian};
use chrono::{FixedOffset, TimeZone, Utc};
use crc::{Crc, CRC_16_IBM_3740};
use thiserror::Error;

pub const RECORD_MAGIC: u32 = 0x544C_4F47;
pub const SCHEMA_VERSION: u16 = 1;
pub const RECORD_SIZE: usize = 46;

/// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, xorout 0.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Header line of every day file. Resume skips it and any `#` comment line.
pub const CSV_HEADER: &str =
    "schema_ver,seq,epoch_utc,iso8601_local,raw_rtd_ohms,raw_temp_c,cal_temp_c,flags,node_id\n";

/// Condition bits carried in [`Record::flags`].
pub mod flags {
    /// Timestamp fields come from a synchronized wall clock.
    pub const TIME_VALID: u16 = 1 << 0;
    /// Calibration coefficients were applied to `temp_milli_c`.
    pub const CAL_VALID: u16 = 1 << 1;
    /// Media writes were failing when this record was produced.
    pub const SD_ERROR: u16 = 1 << 2;
    /// A mesh peer was connected when this record passed the engine.
    pub const MESH_CONNECTED: u16 = 1 << 3;
    /// The sensor read failed; measurement fields are zero.
    pub const SENSOR_FAULT: u16 = 1 << 4;
    /// The NVRAM ring was full (or the producer queue dropped a record).
    pub const FRAM_FULL: u16 = 1 << 5;
}

/// One temperature sample. `sequence` and `record_id` are zero until the
/// ring assigns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Record {
    pub schema_version: u16,
    pub sequence: u32,
    pub record_id: u64,
    pub timestamp_epoch_sec: i64,
    pub timestamp_millis: i32,
    pub raw_temp_milli_c: i32,
    pub temp_milli_c: i32,
    pub resistance_milli_ohm: i32,
    pub flags: u16,
}

/// Why a slot failed validation. The raw field view is kept so callers can
/// log what the slot claimed to contain; it must be treated as untrusted.
#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub record: Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeErrorKind {
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("unsupported schema version {0}")]
    BadSchema(u16),
    #[error("crc mismatch (stored 0x{stored:04x}, computed 0x{computed:04x})")]
    BadCrc { stored: u16, computed: u16 },
}

/// Pack a record into its slot representation. Fills `magic` and
/// `schema_version`, computes the CRC with its own slot zeroed.
pub fn encode(rec: &Record) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    LittleEndian::write_u32(&mut buf[0..4], RECORD_MAGIC);
    LittleEndian::write_u16(&mut buf[4..6], SCHEMA_VERSION);
    LittleEndian::write_u32(&mut buf[6..10], rec.sequence);
    LittleEndian::write_u64(&mut buf[10..18], rec.record_id);
    LittleEndian::write_i64(&mut buf[18..26], rec.timestamp_epoch_sec);
    LittleEndian::write_i32(&mut buf[26..30], rec.timestamp_millis);
    LittleEndian::write_i32(&mut buf[30..34], rec.raw_temp_milli_c);
    LittleEndian::write_i32(&mut buf[34..38], rec.temp_milli_c);
    LittleEndian::write_i32(&mut buf[38..42], rec.resistance_milli_ohm);
    LittleEndian::write_u16(&mut buf[42..44], rec.flags);
    let crc = CRC16.checksum(&buf[..RECORD_SIZE - 2]);
    LittleEndian::write_u16(&mut buf[44..46], crc);
    buf
}

/// Unpack a slot. The record is parsed before validation so a failed decode
/// still carries the raw field view for diagnostics.
pub fn decode(buf: &[u8; RECORD_SIZE]) -> std::result::Result<Record, DecodeError> {
    let magic = LittleEndian::read_u32(&buf[0..4]);
    let record = Record {
        schema_version: LittleEndian::read_u16(&buf[4..6]),
        sequence: LittleEndian::read_u32(&buf[6..10]),
        record_id: LittleEndian::read_u64(&buf[10..18]),
        timestamp_epoch_sec: LittleEndian::read_i64(&buf[18..26]),
        timestamp_millis: LittleEndian::read_i32(&buf[26..30]),
        raw_temp_milli_c: LittleEndian::read_i32(&buf[30..34]),
        temp_milli_c: LittleEndian::read_i32(&buf[34..38]),
        resistance_milli_ohm: LittleEndian::read_i32(&buf[38..42]),
        flags: LittleEndian::read_u16(&buf[42..44]),
    };

    if magic != RECORD_MAGIC {
        return Err(DecodeError { kind: DecodeErrorKind::BadMagic(magic), record });
    }
    if record.schema_version != SCHEMA_VERSION {
        return Err(DecodeError {
            kind: DecodeErrorKind::BadSchema(record.schema_version),
            record,
        });
    }
    let stored = LittleEndian::read_u16(&buf[44..46]);
    let computed = CRC16.checksum(&buf[..RECORD_SIZE - 2]);
    if stored != computed {
        return Err(DecodeError {
            kind: DecodeErrorKind::BadCrc { stored, computed },
            record,
        });
    }
    Ok(record)
}

/// Format one CSV data row.
///
/// The second column carries `record_id` — the media resume key. The local
/// ISO-8601 column is descriptive only and empty while the epoch is zero;
/// file naming never depends on it.
pub fn format_csv_row(rec: &Record, node_id: u16, local_offset: FixedOffset) -> String {
    let iso = if rec.timestamp_epoch_sec == 0 {
        String::new()
    } else {
        let nanos = (rec.timestamp_millis.clamp(0, 999) as u32) * 1_000_000;
        match Utc.timestamp_opt(rec.timestamp_epoch_sec, nanos).single() {
            Some(dt) => dt
                .with_timezone(&local_offset)
                .format("%Y-%m-%dT%H:%M:%S%.3f%:z")
                .to_string(),
            None => String::new(),
        }
    };

    format!(
        "{},{},{},{},{},{},{},0x{:04x},{}\n",
        SCHEMA_VERSION,
        rec.record_id,
        rec.timestamp_epoch_sec,
        iso,
        milli_to_fixed(rec.resistance_milli_ohm),
        milli_to_fixed(rec.raw_temp_milli_c),
        milli_to_fixed(rec.temp_milli_c),
        rec.flags,
        node_id,
    )
}

/// Three-decimal fixed point from a milli-unit integer, e.g. -5500 → "-5.500".
fn milli_to_fixed(v: i32) -> String {
    let v = i64::from(v);
    let sign = if v < 0 { "-" } else { "" };
    let a = v.abs();
    format!("{sign}{}.{:03}", a / 1000, a % 1000)
}
