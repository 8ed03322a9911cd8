// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

use crate::record::DecodeError;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("NVRAM error: {0}")]
    Nv(String),

    #[error("NVRAM access at {addr}+{len} outside device of {size} bytes")]
    BadRange { addr: u32, len: u32, size: u32 },

    #[error("NVRAM too small for a ring: {nvram_bytes} bytes leaves no record slot")]
    BadSize { nvram_bytes: u32 },

    #[error("record failed validation: {0}")]
    Corrupt(#[from] DecodeError),

    #[error("ring is empty")]
    Empty,

    #[error("ring offset {offset} out of range (buffered: {count})")]
    OutOfRange { offset: u32, count: u32 },

    #[error("media error: {0}")]
    Media(String),

    #[error("read-back digest mismatch after append")]
    VerifyMismatch,
}

pub type Result<T> = std::result::Result<T, LogError>;
