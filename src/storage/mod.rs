// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage subsystem — NVRAM ring + day file + flush engine.

pub mod day_file;
pub mod engine;
pub mod ring;
