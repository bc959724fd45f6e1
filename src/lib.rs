// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Streaming MPEG-2 Transport Stream → fragmented MP4 (ISO BMFF)
//! transmuxer. Consumes arbitrarily-chunked TS bytes, demultiplexes the
//! H.264/AAC elementary streams carried inside, and repackages them
//! without re-encoding as `moof`+`mdat` media segments suitable for an
//! MSE byte-stream sink. See `SPEC_FULL.md` for the full design.

pub mod adts;
pub mod audio;
pub mod bmff;
pub mod caption;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod id3;
pub mod metrics;
pub mod nal;
pub mod pes;
pub mod rollover;
pub mod track;
pub mod transmuxer;
pub mod ts;
pub mod video;

pub use config::TransmuxerConfig;
pub use error::{Result, TransmuxError};
pub use track::{SegmentEvent, TrackInfo};
pub use transmuxer::Transmuxer;
