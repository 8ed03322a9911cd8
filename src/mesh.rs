// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Downstream mesh peer capability.
//!
//! The engine offers each record to a connected peer exactly once, with no
//! retry and no delivery guarantee — durable transport is the media's job.
//! The time-sync task uses the time exchange methods.

use crate::error::Result;
use crate::record::Record;

pub trait MeshPeer: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Best-effort, non-blocking offer of one record.
    fn send_record(&self, record: &Record) -> Result<()>;

    fn broadcast_time(&self, epoch_sec: i64);

    fn request_time(&self);
}
