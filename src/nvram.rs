// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Byte-addressable non-volatile memory capability.
//!
//! The ring is generic over [`NvBlock`] so the layout logic stays pure and
//! testable. Two backends ship: a fixed-size file image emulating an F-RAM
//! part on a host filesystem, and an in-memory image for tests and
//! inspection tooling.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{LogError, Result};

/// A byte array of known size with write-through semantics: `write` has
/// committed the bytes to the device when it returns. Addresses outside
/// `[0, size)` fail with `BadRange`. No caching, no alignment constraints.
pub trait NvBlock {
    fn size(&self) -> u32;
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<()>;
}

fn check_range(size: u32, addr: u32, len: usize) -> Result<()> {
    if u64::from(addr) + len as u64 > u64::from(size) {
        return Err(LogError::BadRange { addr, len: len as u32, size });
    }
    Ok(())
}

// ───────────────────────────── file image ────────────────────────────────

/// NVRAM emulated as a fixed-size file. Every write is followed by
/// `sync_data` so the image behaves like the write-through device it
/// stands in for.
pub struct FileNvram {
    file: File,
    size: u32,
    #[allow(dead_code)]
    path: PathBuf,
}

impl FileNvram {
    /// Open (or create and zero-fill) the image at `path` with exactly
    /// `size` bytes.
    pub fn open(path: &Path, size: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LogError::Nv(format!("create {parent:?}: {e}")))?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| LogError::Nv(format!("open image {path:?}: {e}")))?;
        let len = file
            .metadata()
            .map_err(|e| LogError::Nv(format!("stat image {path:?}: {e}")))?
            .len();
        if len != u64::from(size) {
            file.set_len(u64::from(size))
                .map_err(|e| LogError::Nv(format!("size image {path:?}: {e}")))?;
            info!(path = ?path, bytes = size, "NVRAM image sized");
        }
        Ok(Self { file, size, path: path.to_path_buf() })
    }
}

impl NvBlock for FileNvram {
    fn size(&self) -> u32 {
        self.size
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        check_range(self.size, addr, buf.len())?;
        self.file
            .seek(SeekFrom::Start(u64::from(addr)))
            .and_then(|_| self.file.read_exact(buf))
            .map_err(|e| LogError::Nv(format!("read {addr}+{}: {e}", buf.len())))
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        check_range(self.size, addr, data.len())?;
        self.file
            .seek(SeekFrom::Start(u64::from(addr)))
            .and_then(|_| self.file.write_all(data))
            .and_then(|_| self.file.sync_data())
            .map_err(|e| LogError::Nv(format!("write {addr}+{}: {e}", data.len())))
    }
}

// ───────────────────────────── memory image ──────────────────────────────

/// In-memory NVRAM image. Survives "reboots" only as long as the value
/// itself does, which is exactly what crash-recovery tests need.
pub struct MemNvram {
    data: Vec<u8>,
}

impl MemNvram {
    pub fn new(size: u32) -> Self {
        Self { data: vec![0u8; size as usize] }
    }
}

impl NvBlock for MemNvram {
    fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        check_range(self.size(), addr, buf.len())?;
        let at = addr as usize;
        buf.copy_from_slice(&self.data[at..at + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        check_range(self.size(), addr, data.len())?;
        let at = addr as usize;
        self.data[at..at + data.len()].copy_from_slice(data);
        Ok(())
    }
}
