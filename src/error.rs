// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Error taxonomy for the transmux pipeline.
//!
//! Only class-5 invariant violations (and CLI-level I/O failures) are ever
//! surfaced as `Err`. Stream desync, missing prerequisites, incomplete
//! segments and malformed structural input are absorbed inside the
//! pipeline stages themselves and never reach this type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransmuxError {
    #[error("coalescer invariant violated: {0}")]
    InvariantViolation(String),

    #[error("unsupported codec for stream_type 0x{stream_type:02x} on pid {pid}")]
    UnsupportedCodec { stream_type: u8, pid: u16 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransmuxError>;
