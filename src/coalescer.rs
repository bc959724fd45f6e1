// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Stage 9 — Coalescer: the cross-track barrier. Holds a finished video
//! GOP and/or a finished run of audio samples until every track the
//! program map advertises has contributed data for this fragment, then
//! emits one `moof` (one `traf` per contributing track) sharing a single
//! sequence_number, plus the matching `mdat`.

use bytes::Bytes;

use crate::adts::AdtsFrame;
use crate::audio::AudioSample;
use crate::bmff::{self, SampleEntry, TrackFragment, AUDIO_TRACK_ID, VIDEO_TRACK_ID};
use crate::error::{TransmuxError, Result};
use crate::nal::Gop;
use crate::track::TimelineStart;

#[derive(Debug, Default)]
pub struct Coalescer {
    sequence_number: u32,
    has_video_track: bool,
    has_audio_track: bool,
    /// §4.8: when true (default), the barrier waits for one input from
    /// every registered track and emits a single combined segment. When
    /// false, each track's fragment is emitted on its own as soon as it
    /// arrives, with its own `moof`/sequence number.
    remux: bool,
    pending_video: Option<TrackFragment>,
    pending_audio: Option<TrackFragment>,
}

impl Coalescer {
    pub fn new(has_video_track: bool, has_audio_track: bool) -> Self {
        Self::with_remux(has_video_track, has_audio_track, true)
    }

    pub fn with_remux(has_video_track: bool, has_audio_track: bool, remux: bool) -> Self {
        Self {
            sequence_number: 0,
            has_video_track,
            has_audio_track,
            remux,
            pending_video: None,
            pending_audio: None,
        }
    }

    pub fn set_remux(&mut self, remux: bool) {
        self.remux = remux;
    }

    pub fn submit_video_gop(
        &mut self,
        gop: Gop,
        timeline: &mut TimelineStart,
        keep_original_timestamps: bool,
    ) -> Result<Option<Bytes>> {
        let fragment = build_video_fragment(&gop, timeline, keep_original_timestamps);
        if !self.remux {
            return Ok(Some(self.emit(vec![fragment])));
        }
        if self.pending_video.is_some() {
            return Err(TransmuxError::InvariantViolation(
                "a video fragment was already pending when a new GOP arrived".into(),
            ));
        }
        self.pending_video = Some(fragment);
        Ok(self.try_emit())
    }

    pub fn submit_audio_run(
        &mut self,
        samples: Vec<AudioSample>,
        timeline: &mut TimelineStart,
        keep_original_timestamps: bool,
    ) -> Result<Option<Bytes>> {
        if samples.is_empty() {
            return Ok(None);
        }
        let fragment = build_audio_fragment(&samples, timeline, keep_original_timestamps);
        if !self.remux {
            return Ok(Some(self.emit(vec![fragment])));
        }
        if self.pending_audio.is_some() {
            return Err(TransmuxError::InvariantViolation(
                "an audio fragment was already pending when a new run arrived".into(),
            ));
        }
        self.pending_audio = Some(fragment);
        Ok(self.try_emit())
    }

    /// Emits whatever is pending regardless of whether every track has
    /// contributed, for end-of-stream flush.
    pub fn flush(&mut self) -> Option<Bytes> {
        let fragments: Vec<TrackFragment> =
            [self.pending_video.take(), self.pending_audio.take()].into_iter().flatten().collect();
        if fragments.is_empty() {
            return None;
        }
        Some(self.emit(fragments))
    }

    fn try_emit(&mut self) -> Option<Bytes> {
        let video_ready = !self.has_video_track || self.pending_video.is_some();
        let audio_ready = !self.has_audio_track || self.pending_audio.is_some();
        if !(video_ready && audio_ready) {
            return None;
        }
        let fragments: Vec<TrackFragment> =
            [self.pending_video.take(), self.pending_audio.take()].into_iter().flatten().collect();
        if fragments.is_empty() {
            return None;
        }
        Some(self.emit(fragments))
    }

    fn emit(&mut self, fragments: Vec<TrackFragment>) -> Bytes {
        self.sequence_number += 1;
        bmff::moof_and_mdat(self.sequence_number, &fragments)
    }
}

fn build_video_fragment(
    gop: &Gop,
    timeline: &mut TimelineStart,
    keep_original_timestamps: bool,
) -> TrackFragment {
    let min_dts = gop.frames.iter().map(|f| f.dts).min().unwrap_or(0);
    if let Some(first) = gop.frames.first() {
        timeline.observe(first.dts, first.pts);
    }
    let (base_media_decode_time, clamped) = timeline.base_media_decode_time(min_dts, keep_original_timestamps);
    if clamped {
        tracing::warn!("video base_media_decode_time clamped to 0");
    }
    let mut data = Vec::with_capacity(gop.byte_length());
    let mut samples = Vec::with_capacity(gop.frames.len());

    let fallback_duration = gop
        .frames
        .windows(2)
        .next()
        .map(|w| w[1].dts.saturating_sub(w[0].dts) as u32)
        .filter(|&d| d > 0)
        .unwrap_or(3000);

    for (idx, frame) in gop.frames.iter().enumerate() {
        let duration = match gop.frames.get(idx + 1) {
            Some(next) => {
                let d = next.dts.saturating_sub(frame.dts) as u32;
                if d == 0 { fallback_duration } else { d }
            }
            None => fallback_duration,
        };
        let cto = (frame.pts as i64 - frame.dts as i64) as i32;
        samples.push(SampleEntry {
            duration,
            size: frame.data.len() as u32,
            is_sync: frame.is_keyframe,
            composition_time_offset: cto,
        });
        data.extend_from_slice(&frame.data);
    }

    TrackFragment {
        track_id: VIDEO_TRACK_ID,
        base_media_decode_time,
        samples,
        sample_data: Bytes::from(data),
    }
}

fn build_audio_fragment(
    samples: &[AudioSample],
    timeline: &mut TimelineStart,
    keep_original_timestamps: bool,
) -> TrackFragment {
    let min_pts = samples.iter().map(|s| s.pts).min().unwrap_or(0);
    let sample_rate = samples.first().map(|s| s.frame.sample_rate).unwrap_or(90_000);
    if let Some(first) = samples.first() {
        timeline.observe(first.pts, first.pts);
    }
    let (video_clock_bmdt, clamped) = timeline.base_media_decode_time(min_pts, keep_original_timestamps);
    if clamped {
        tracing::warn!("audio base_media_decode_time clamped to 0");
    }
    // §4.7: convert the final value from the 90 kHz video clock to the
    // audio timescale.
    let base_media_decode_time = (video_clock_bmdt as u128 * sample_rate as u128 / 90_000) as u64;
    let mut data = Vec::new();
    let mut entries = Vec::with_capacity(samples.len());

    for (idx, sample) in samples.iter().enumerate() {
        let duration = samples
            .get(idx + 1)
            .map(|n| video_ticks_to_audio_timescale(n.pts.saturating_sub(sample.pts), sample_rate))
            .filter(|&d| d > 0)
            .unwrap_or(1024);
        entries.push(SampleEntry {
            duration,
            size: sample.frame.data.len() as u32,
            is_sync: true,
            composition_time_offset: 0,
        });
        data.extend_from_slice(frame_bytes(&sample.frame));
    }

    TrackFragment {
        track_id: AUDIO_TRACK_ID,
        base_media_decode_time,
        samples: entries,
        sample_data: Bytes::from(data),
    }
}

fn frame_bytes(frame: &AdtsFrame) -> &[u8] {
    &frame.data
}

/// §6 `videoTsToAudioTs`: converts a duration measured in 90 kHz video
/// clock ticks (the clock `AudioSample::pts` is carried in, per the PES
/// layer) into the audio track's own timescale (its samplerate), which is
/// what `trun` durations and `mdhd`/`tkhd` are built against.
fn video_ticks_to_audio_timescale(ticks: u64, sample_rate: u32) -> u32 {
    ((ticks as u128 * sample_rate as u128) / 90_000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nal::Frame;

    fn video_frame(pts: u64, dts: u64, keyframe: bool) -> Frame {
        Frame { pts, dts, is_keyframe: keyframe, sps: None, pps: None, data: Bytes::from_static(&[0, 0, 0, 1, 0x65]) }
    }

    fn audio_sample(pts: u64) -> AudioSample {
        audio_sample_with_rate(pts, 44_100)
    }

    fn audio_sample_with_rate(pts: u64, sample_rate: u32) -> AudioSample {
        AudioSample {
            pts,
            frame: crate::adts::AdtsFrame { profile: 2, sample_rate, channel_count: 2, data: Bytes::from_static(&[0xAB; 4]) },
            synthesized: false,
        }
    }

    #[test]
    fn remux_true_barrier_waits_for_both_tracks() {
        let mut coalescer = Coalescer::new(true, true);
        let mut video_tl = TimelineStart::default();
        let mut audio_tl = TimelineStart::default();

        let gop = Gop { frames: vec![video_frame(0, 0, true), video_frame(3000, 3000, false)] };
        let out = coalescer.submit_video_gop(gop, &mut video_tl, false).unwrap();
        assert!(out.is_none(), "must not emit until audio also contributes");

        let out = coalescer
            .submit_audio_run(vec![audio_sample(0), audio_sample(1024)], &mut audio_tl, false)
            .unwrap();
        assert!(out.is_some(), "barrier satisfied once both tracks contributed");
    }

    #[test]
    fn remux_true_rejects_a_second_video_fragment_before_the_barrier_clears() {
        let mut coalescer = Coalescer::new(true, true);
        let mut video_tl = TimelineStart::default();
        let gop = Gop { frames: vec![video_frame(0, 0, true)] };
        coalescer.submit_video_gop(gop.clone(), &mut video_tl, false).unwrap();
        let err = coalescer.submit_video_gop(gop, &mut video_tl, false);
        assert!(err.is_err());
    }

    #[test]
    fn video_only_program_emits_without_waiting_on_audio() {
        let mut coalescer = Coalescer::new(true, false);
        let mut video_tl = TimelineStart::default();
        let gop = Gop { frames: vec![video_frame(0, 0, true)] };
        let out = coalescer.submit_video_gop(gop, &mut video_tl, false).unwrap();
        assert!(out.is_some());
    }

    #[test]
    fn remux_false_emits_each_track_independently() {
        let mut coalescer = Coalescer::with_remux(true, true, false);
        let mut video_tl = TimelineStart::default();
        let mut audio_tl = TimelineStart::default();

        let gop = Gop { frames: vec![video_frame(0, 0, true)] };
        let out = coalescer.submit_video_gop(gop, &mut video_tl, false).unwrap();
        assert!(out.is_some(), "remux=false emits per-track without a barrier");

        let out = coalescer.submit_audio_run(vec![audio_sample(0)], &mut audio_tl, false).unwrap();
        assert!(out.is_some());
    }

    #[test]
    fn empty_audio_run_never_triggers_emission() {
        let mut coalescer = Coalescer::new(false, true);
        let mut audio_tl = TimelineStart::default();
        let out = coalescer.submit_audio_run(Vec::new(), &mut audio_tl, false).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn build_video_fragment_derives_per_sample_durations_and_sync_flags() {
        let gop = Gop { frames: vec![video_frame(0, 0, true), video_frame(3000, 3000, false)] };
        let mut tl = TimelineStart::default();
        let frag = build_video_fragment(&gop, &mut tl, false);
        assert_eq!(frag.track_id, VIDEO_TRACK_ID);
        assert_eq!(frag.samples.len(), 2);
        assert!(frag.samples[0].is_sync);
        assert!(!frag.samples[1].is_sync);
        assert_eq!(frag.samples[0].duration, 3000);
        assert_eq!(frag.base_media_decode_time, 0);
    }

    #[test]
    fn build_audio_fragment_rescales_base_media_decode_time_to_samplerate() {
        let samples = vec![audio_sample(90_000), audio_sample(91_024)];
        let mut tl = TimelineStart::default();
        tl.observe(0, 0);
        let frag = build_audio_fragment(&samples, &mut tl, false);
        // 90_000 ticks at 90 kHz == 1s == 44_100 samples at the track's rate.
        assert_eq!(frag.base_media_decode_time, 44_100);
        assert_eq!(frag.track_id, AUDIO_TRACK_ID);
    }

    #[test]
    fn build_audio_fragment_emits_durations_in_the_audio_timescale_not_video_clock() {
        // One AAC frame (1024 samples @ 48 kHz) spans exactly 1920 ticks of
        // the 90 kHz video clock that AudioSample::pts is carried in.
        let samples = vec![audio_sample_with_rate(0, 48_000), audio_sample_with_rate(1920, 48_000)];
        let mut tl = TimelineStart::default();
        let frag = build_audio_fragment(&samples, &mut tl, false);
        assert_eq!(frag.samples[0].duration, 1024, "duration must be in samplerate units, not 90 kHz ticks");
    }
}
