// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Lightweight pipeline counters, reported via `tracing` rather than a
//! Prometheus exporter (see SPEC_FULL.md §13 for why the exporter was
//! dropped: this crate has no HTTP surface to scrape).

use std::time::Instant;

use tracing::info;

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub packets_processed: u64,
    pub resyncs: u64,
    pub video_segments_emitted: u64,
    pub audio_segments_emitted: u64,
    pub silence_frames_inserted: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_summary(&self, elapsed: std::time::Duration) {
        info!(
            packets_processed = self.packets_processed,
            resyncs = self.resyncs,
            video_segments_emitted = self.video_segments_emitted,
            audio_segments_emitted = self.audio_segments_emitted,
            silence_frames_inserted = self.silence_frames_inserted,
            elapsed_ms = elapsed.as_millis(),
            "transmux pipeline summary"
        );
    }
}

/// Tracks wall-clock duration of a single `push()` call for tracing spans.
pub struct PushGuard {
    start: Instant,
}

impl PushGuard {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Default for PushGuard {
    fn default() -> Self {
        Self::new()
    }
}
