// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Track metadata and the side-channel events emitted alongside segments.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct VideoTrackInfo {
    pub pid: u16,
    pub codec: String,
    pub width: u16,
    pub height: u16,
    pub timescale: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioTrackInfo {
    pub pid: u16,
    pub codec: String,
    pub sample_rate: u32,
    pub channel_count: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubtitleTrackInfo {
    pub pid: u16,
    pub stream_type: u8,
    pub language: Option<String>,
}

/// Emitted once, the first time the PMT yields a complete set of tracks.
#[derive(Debug, Clone, Serialize)]
pub struct TrackInfo {
    pub video: Option<VideoTrackInfo>,
    pub audio: Vec<AudioTrackInfo>,
    pub subtitles: Vec<SubtitleTrackInfo>,
}

/// Per-track timeline anchor (§4.7). Set once, on the first flush that
/// produces data for that track, from the earliest DTS/PTS observed;
/// `base_media_decode_time` is the origin a host can relocate via
/// `Transmuxer::set_base_media_decode_time`, defaulting to 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimelineStart {
    pub dts: Option<u64>,
    pub pts: Option<u64>,
    pub base_media_decode_time: u64,
}

impl TimelineStart {
    /// Records the earliest (dts, pts) pair seen for this track, if one
    /// hasn't already been recorded since the last reset.
    pub fn observe(&mut self, dts: u64, pts: u64) {
        if self.dts.is_none() {
            self.dts = Some(dts);
            self.pts = Some(pts);
        }
    }

    /// Forgets the recorded anchor point without touching
    /// `base_media_decode_time` — used by `set_base_media_decode_time`,
    /// which relocates the origin but keeps behaving like a fresh start.
    pub fn clear(&mut self) {
        self.dts = None;
        self.pts = None;
    }

    /// Derives this fragment's `base_media_decode_time` per §4.7 from the
    /// minimum observed DTS in the fragment, in the 90 kHz video clock.
    /// Assumes `observe()` has already recorded this track's anchor (from
    /// the earliest DTS/PTS ever seen). Never negative — a derivation that
    /// would go negative is clamped to 0 and the clamp reported for
    /// logging.
    pub fn base_media_decode_time(&self, min_observed_dts: u64, keep_original_timestamps: bool) -> (u64, bool) {
        let start_dts = self.dts.unwrap_or(min_observed_dts) as i64;
        let raw = if keep_original_timestamps {
            min_observed_dts as i64 - self.base_media_decode_time as i64
        } else {
            min_observed_dts as i64 - start_dts + self.base_media_decode_time as i64
        };
        if raw < 0 {
            (0, true)
        } else {
            (raw as u64, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_records_only_the_first_anchor() {
        let mut ts = TimelineStart::default();
        ts.observe(1000, 900);
        ts.observe(2000, 1900);
        assert_eq!(ts.dts, Some(1000));
        assert_eq!(ts.pts, Some(900));
    }

    #[test]
    fn base_media_decode_time_rebases_against_anchor_by_default() {
        let mut ts = TimelineStart::default();
        ts.observe(90_000, 90_000);
        let (bmdt, clamped) = ts.base_media_decode_time(90_000, false);
        assert_eq!(bmdt, 0);
        assert!(!clamped);

        let (bmdt, clamped) = ts.base_media_decode_time(180_000, false);
        assert_eq!(bmdt, 90_000);
        assert!(!clamped);
    }

    #[test]
    fn keep_original_timestamps_uses_base_media_decode_time_directly() {
        let mut ts = TimelineStart { dts: None, pts: None, base_media_decode_time: 9_000_000 };
        ts.observe(9_000_000, 9_000_000);
        let (bmdt, clamped) = ts.base_media_decode_time(9_090_000, true);
        assert_eq!(bmdt, 90_000);
        assert!(!clamped);
    }

    #[test]
    fn negative_derivation_clamps_to_zero() {
        let ts = TimelineStart { dts: Some(10_000), pts: Some(10_000), base_media_decode_time: 0 };
        let (bmdt, clamped) = ts.base_media_decode_time(5_000, false);
        assert_eq!(bmdt, 0);
        assert!(clamped);
    }

    #[test]
    fn clear_forgets_anchor_but_keeps_base_media_decode_time() {
        let mut ts = TimelineStart { dts: Some(1), pts: Some(1), base_media_decode_time: 42 };
        ts.clear();
        assert_eq!(ts.dts, None);
        assert_eq!(ts.pts, None);
        assert_eq!(ts.base_media_decode_time, 42);
    }
}

/// A single emitted fragment: an init segment (`ftyp+moov`) or a media
/// segment (`moof+mdat`) for one track, plus accompanying metadata the
/// host may want (captions, timed ID3) that has no place in the ISO BMFF
/// container itself.
#[derive(Debug, Clone)]
pub enum SegmentEvent {
    TrackInfo(TrackInfo),
    InitSegment { data: bytes::Bytes },
    MediaSegment { track_id: u32, sequence_number: u32, data: bytes::Bytes },
    Captions(crate::caption::CaptionPacket),
    TimedMetadata(crate::id3::TimedMetadata),
    Done,
}
