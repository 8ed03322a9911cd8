// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Per-day CSV file on removable media, with power-cut recovery.
//!
//! Opening a day runs tail repair (truncate to the last newline within a
//! bounded scan window) and a backwards resume scan that recovers the
//! largest record id already on media. Appends are verified: write, flush,
//! fsync, read the region back, compare SHA-256 digests, and roll the file
//! back to its pre-append size on any failure. A power cut at any instant
//! therefore leaves either the whole batch on media or none of it.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, TimeZone, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{LogError, Result};
use crate::record::{CSV_HEADER, SCHEMA_VERSION};

/// Calendar date (UTC) a record with this epoch belongs to. File naming is
/// always UTC so resume stays deterministic across timezone changes.
pub(crate) fn utc_date(epoch_sec: i64) -> Option<NaiveDate> {
    Utc.timestamp_opt(epoch_sec, 0).single().map(|dt| dt.date_naive())
}

struct OpenDay {
    writer: BufWriter<File>,
    date: NaiveDate,
    path: PathBuf,
    size: u64,
}

/// Verified appender for `<mount_point>/<YYYY-MM-DD>.csv`.
pub struct DayFile {
    mount_point: PathBuf,
    tail_scan_bytes: u64,
    file_buffer_bytes: usize,
    open: Option<OpenDay>,
    last_record_id_on_media: u64,
    file_was_truncated: bool,
    #[cfg(test)]
    pub(crate) corrupt_next_readback: bool,
}

impl DayFile {
    pub fn new(mount_point: &Path, tail_scan_bytes: u64, file_buffer_bytes: usize) -> Self {
        Self {
            mount_point: mount_point.to_path_buf(),
            tail_scan_bytes: tail_scan_bytes.max(1),
            file_buffer_bytes,
            open: None,
            last_record_id_on_media: 0,
            file_was_truncated: false,
            #[cfg(test)]
            corrupt_next_readback: false,
        }
    }

    /// Largest record id known to be durably appended to the open file.
    pub fn last_record_id_on_media(&self) -> u64 {
        self.last_record_id_on_media
    }

    /// Whether the last real open had to repair a torn tail.
    pub fn file_was_truncated(&self) -> bool {
        self.file_was_truncated
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn current_date(&self) -> Option<NaiveDate> {
        self.open.as_ref().map(|od| od.date)
    }

    /// Open (create-or-append) the day file for `epoch_utc`. A no-op when
    /// that date is already open; otherwise the previous file is closed,
    /// the target's tail is repaired, the resume id is recovered, and a
    /// header line is written if the file is empty.
    pub fn ensure_open_for(&mut self, epoch_utc: i64) -> Result<()> {
        let date = utc_date(epoch_utc)
            .ok_or_else(|| LogError::Media(format!("timestamp {epoch_utc} out of range")))?;
        if let Some(od) = &self.open {
            if od.date == date {
                return Ok(());
            }
        }
        self.close()?;

        let path = self.mount_point.join(format!("{}.csv", date.format("%Y-%m-%d")));
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| LogError::Media(format!("open {path:?}: {e}")))?;
        let size = file
            .metadata()
            .map_err(|e| LogError::Media(format!("stat {path:?}: {e}")))?
            .len();

        let repaired = repair_tail(&mut file, size, self.tail_scan_bytes)?;
        self.file_was_truncated = repaired != size;
        if self.file_was_truncated {
            warn!(
                path = ?path,
                from = size,
                to = repaired,
                "repaired torn tail after power loss"
            );
        }

        self.last_record_id_on_media =
            scan_last_record_id(&mut file, repaired, self.tail_scan_bytes)?.unwrap_or(0);

        let mut size = repaired;
        let mut writer = BufWriter::with_capacity(self.file_buffer_bytes, file);
        if size == 0 {
            writer.write_all(CSV_HEADER.as_bytes())?;
            writer.flush()?;
            writer.get_ref().sync_data()?;
            size = CSV_HEADER.len() as u64;
        }

        info!(
            path = ?path,
            resume_record_id = self.last_record_id_on_media,
            truncated = self.file_was_truncated,
            "day file open"
        );
        self.open = Some(OpenDay { writer, date, path, size });
        Ok(())
    }

    /// Append pre-formatted line bytes at end-of-file and verify them by
    /// read-back. Only after `Ok` may the caller consume the matching
    /// records from the ring.
    pub fn append_verified(&mut self, batch: &[u8], last_record_id_in_batch: u64) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        #[cfg(test)]
        let corrupt_readback = std::mem::take(&mut self.corrupt_next_readback);

        let od = self
            .open
            .as_mut()
            .ok_or_else(|| LogError::Media("no day file open".into()))?;
        let pre_size = od.size;
        let expected = Sha256::digest(batch);

        let result = (|| -> Result<()> {
            od.writer.write_all(batch)?;
            od.writer.flush()?;
            let file = od.writer.get_mut();
            file.sync_data()?;

            file.seek(SeekFrom::Start(pre_size))?;
            let mut back = vec![0u8; batch.len()];
            file.read_exact(&mut back)?;
            #[cfg(test)]
            if corrupt_readback {
                back[0] ^= 0x01;
            }
            if Sha256::digest(&back) != expected {
                return Err(LogError::VerifyMismatch);
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                od.size = pre_size + batch.len() as u64;
                self.last_record_id_on_media = last_record_id_in_batch;
                debug!(
                    bytes = batch.len(),
                    last_record_id = last_record_id_in_batch,
                    "verified append"
                );
                Ok(())
            }
            Err(e) => {
                let file = od.writer.get_mut();
                if let Err(trunc) = file.set_len(pre_size).and_then(|_| file.sync_data()) {
                    warn!(path = ?od.path, error = %trunc, "rollback truncate failed");
                }
                od.size = pre_size;
                warn!(path = ?od.path, error = %e, "append rolled back");
                Err(e)
            }
        }
    }

    /// Flush, fsync and close the open file, if any.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut od) = self.open.take() {
            od.writer.flush()?;
            od.writer.get_ref().sync_data()?;
            debug!(path = ?od.path, "day file closed");
        }
        Ok(())
    }
}

/// Truncate the file to just after the last newline within the scan window.
/// Returns the post-repair size.
fn repair_tail(file: &mut File, size: u64, window: u64) -> Result<u64> {
    if size == 0 {
        return Ok(0);
    }
    let win = size.min(window);
    let start = size - win;
    file.seek(SeekFrom::Start(start))?;
    let mut buf = vec![0u8; win as usize];
    file.read_exact(&mut buf)?;

    if buf.last() == Some(&b'\n') {
        return Ok(size);
    }
    let new_size = match buf.iter().rposition(|&b| b == b'\n') {
        Some(pos) => start + pos as u64 + 1,
        // No newline inside the window: back out to the window start (zero
        // when the window reaches the start of the file).
        None => start,
    };
    file.set_len(new_size)?;
    file.sync_data()?;
    Ok(new_size)
}

/// Scan the tail window backwards for the newest data line and return its
/// record id. Comment lines and the header are skipped; a line counts only
/// if its first field equals the compiled schema version and its second
/// field parses as a u64.
fn scan_last_record_id(file: &mut File, size: u64, window: u64) -> Result<Option<u64>> {
    if size == 0 {
        return Ok(None);
    }
    let win = size.min(window);
    let start = size - win;
    file.seek(SeekFrom::Start(start))?;
    let mut buf = vec![0u8; win as usize];
    file.read_exact(&mut buf)?;

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<&str> = text.lines().collect();
    if start > 0 && !lines.is_empty() {
        // The window may begin mid-line; never trust the first fragment.
        lines.remove(0);
    }
    for line in lines.iter().rev() {
        if let Some(id) = parse_resume_line(line) {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

fn parse_resume_line(line: &str) -> Option<u64> {
    let line = line.trim_end_matches('\r');
    if line.is_empty() || line.starts_with('#') || line.starts_with("schema_ver,") {
        return None;
    }
    let mut fields = line.split(',');
    let schema: u16 = fields.next()?.parse().ok()?;
    if schema != SCHEMA_VERSION {
        return None;
    }
    fields.next()?.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_mismatch_rolls_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut day = DayFile::new(dir.path(), 256 * 1024, 4096);
        day.ensure_open_for(1_704_189_600).expect("open");

        let row = "1,1,1704189600,,100.000,21.000,21.000,0x0003,1\n";
        day.append_verified(row.as_bytes(), 1).expect("first append");
        let pre_size = std::fs::metadata(dir.path().join("2024-01-02.csv"))
            .expect("stat")
            .len();
        let pre_id = day.last_record_id_on_media();

        day.corrupt_next_readback = true;
        let err = day
            .append_verified(row.as_bytes(), 2)
            .expect_err("corrupted readback must fail");
        assert!(matches!(err, LogError::VerifyMismatch));

        let post_size = std::fs::metadata(dir.path().join("2024-01-02.csv"))
            .expect("stat")
            .len();
        assert_eq!(post_size, pre_size);
        assert_eq!(day.last_record_id_on_media(), pre_id);

        // The file stays usable after a rollback.
        day.append_verified(row.as_bytes(), 2).expect("append after rollback");
        assert_eq!(day.last_record_id_on_media(), 2);
    }

    #[test]
    fn resume_line_parsing() {
        assert_eq!(parse_resume_line("1,42,0,,100.000,21.000,21.000,0x0000,1"), Some(42));
        assert_eq!(parse_resume_line("# comment"), None);
        assert_eq!(parse_resume_line("schema_ver,seq,epoch_utc"), None);
        assert_eq!(parse_resume_line("9,42,0"), None);
        assert_eq!(parse_resume_line(""), None);
        assert_eq!(parse_resume_line("1,notanumber,0"), None);
    }
}
