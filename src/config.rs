// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Ambient configuration for a `Transmuxer` instance. Unlike the
//! teacher's environment-variable-driven service config, this crate has
//! no network surface, so configuration is plain constructor arguments
//! a host (e.g. the CLI in `main.rs`) fills in from flags.

#[derive(Debug, Clone)]
pub struct TransmuxerConfig {
    /// When true, every completed GOP/audio-sample-run is immediately
    /// remuxed into a media segment as soon as the coalescer's barrier
    /// is satisfied. When false, segments accumulate until `flush()`.
    pub remux: bool,
    /// When true, a track whose stream_type maps to an unrecognized
    /// codec family is tolerated (advertised in `trackinfo` only, never
    /// segmented) instead of producing `TransmuxError::UnsupportedCodec`.
    pub broad_mode: bool,
    /// Keep the stream's original (rollover-corrected) timestamps rather
    /// than rebasing the first sample of each segment to its
    /// `base_media_decode_time`.
    pub keep_original_timestamps: bool,
}

impl Default for TransmuxerConfig {
    fn default() -> Self {
        Self { remux: true, broad_mode: false, keep_original_timestamps: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_spec_baseline() {
        let cfg = TransmuxerConfig::default();
        assert!(cfg.remux, "combined segments are the default per §4.8");
        assert!(!cfg.broad_mode, "strict stream-type mapping is the default per §4.2");
        assert!(!cfg.keep_original_timestamps);
    }
}
