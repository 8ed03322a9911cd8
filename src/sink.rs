// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Line-output sink: a best-effort CSV mirror of every produced record to a
//! host-visible byte stream. Not durable; failures are swallowed.

use std::io::{Stdout, Write};

pub trait LineSink: Send {
    /// Write one `\n`-terminated line. Errors are the implementation's
    /// problem; the engine never retries a mirror write.
    fn write_line(&mut self, bytes: &[u8]);
}

/// Mirrors rows to standard output, the host stand-in for the serial
/// console stream.
pub struct StdoutSink {
    out: Stdout,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self { out: std::io::stdout() }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LineSink for StdoutSink {
    fn write_line(&mut self, bytes: &[u8]) {
        let _ = self.out.write_all(bytes);
        let _ = self.out.flush();
    }
}
