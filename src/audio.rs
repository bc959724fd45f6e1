// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Stage 7 — AudioSegmenter: groups ADTS AAC frames into an ordered
//! sample list, inserting silence frames to bridge timestamp gaps larger
//! than one frame duration.

use tracing::{trace, warn};

use crate::adts::{parse_adts_frames, silent_adts_frame, AdtsFrame};

#[derive(Debug, Clone)]
pub struct AudioSample {
    pub pts: u64,
    pub frame: AdtsFrame,
    pub synthesized: bool,
}

pub struct AudioSegmenter {
    leftover: Vec<u8>,
    sample_rate: Option<u32>,
    channel_count: Option<u8>,
    last_pts: Option<u64>,
    samples_per_frame: u64,
    /// Set by `Transmuxer::set_audio_append_start`: the video-clock
    /// timestamp audio should appear to start at. Consumed (set back to
    /// `None`) the first time a frame arrives after it's set, per §4.6
    /// step 3 / the silence-prefix-law testable property.
    audio_append_start_ts: Option<u64>,
    /// 90 kHz-clock duration of the most recent silence prefix inserted to
    /// satisfy `audio_append_start_ts`, reported alongside `timingInfo`.
    pub prepended_content_duration: u64,
    /// §4.6 step 1: set once from the video track's earliest DTS so the
    /// audio track never starts before the video it's paired with.
    earliest_allowed_dts: Option<u64>,
}

impl AudioSegmenter {
    pub fn new() -> Self {
        Self {
            leftover: Vec::new(),
            sample_rate: None,
            channel_count: None,
            last_pts: None,
            samples_per_frame: 1024,
            audio_append_start_ts: None,
            prepended_content_duration: 0,
            earliest_allowed_dts: None,
        }
    }

    /// Records the video-clock timestamp the next audio run should appear
    /// to begin at (§4.9 `setAudioAppendStart`).
    pub fn set_audio_append_start(&mut self, ts: u64) {
        self.audio_append_start_ts = Some(ts);
    }

    /// §4.6 step 1: frames with DTS below this are trimmed before they
    /// reach the coalescer. Set once from the video track's earliest DTS;
    /// later calls are ignored until `reset()`.
    pub fn set_earliest_allowed_dts(&mut self, dts: u64) {
        if self.earliest_allowed_dts.is_none() {
            self.earliest_allowed_dts = Some(dts);
        }
    }

    /// Feeds one PES packet's payload (one or more back-to-back ADTS
    /// frames) tagged with that PES packet's PTS, returning every audio
    /// sample (silence-padded as needed) ready for the coalescer.
    pub fn push(&mut self, data: &[u8], pts: u64) -> Vec<AudioSample> {
        let mut buf = std::mem::take(&mut self.leftover);
        buf.extend_from_slice(data);
        let (frames, leftover_len) = parse_adts_frames(&buf);
        if leftover_len > 0 {
            self.leftover = buf[buf.len() - leftover_len..].to_vec();
        }

        let mut out = Vec::new();
        let mut next_pts = pts;
        for frame in frames {
            self.sample_rate = Some(frame.sample_rate);
            self.channel_count = Some(frame.channel_count);
            let frame_duration = self.frame_duration_in_timescale(frame.sample_rate);

            if let Some(append_start) = self.audio_append_start_ts.take() {
                if next_pts > append_start {
                    let gap = next_pts - append_start;
                    let gap_frames = (gap / frame_duration).min(1000);
                    self.prepended_content_duration = gap_frames * frame_duration;
                    debug_assert!(gap_frames > 0 || gap < frame_duration);
                    let mut fill_pts = append_start;
                    for _ in 0..gap_frames {
                        out.push(AudioSample {
                            pts: fill_pts,
                            frame: silent_adts_frame(frame.sample_rate, frame.channel_count),
                            synthesized: true,
                        });
                        fill_pts += frame_duration;
                    }
                }
            } else if let Some(last) = self.last_pts {
                let expected = last + frame_duration;
                if next_pts > expected + frame_duration {
                    let gap_frames = ((next_pts - expected) / frame_duration).min(1000);
                    warn!(gap_frames, "audio gap detected, padding with silence");
                    let mut fill_pts = expected;
                    for _ in 0..gap_frames {
                        out.push(AudioSample {
                            pts: fill_pts,
                            frame: silent_adts_frame(frame.sample_rate, frame.channel_count),
                            synthesized: true,
                        });
                        fill_pts += frame_duration;
                    }
                }
            }

            trace!(pts = next_pts, "audio frame");
            out.push(AudioSample { pts: next_pts, frame, synthesized: false });
            self.last_pts = Some(next_pts);
            next_pts += frame_duration;
        }

        if let Some(earliest) = self.earliest_allowed_dts {
            out.retain(|s| s.pts >= earliest);
        }

        out
    }

    pub fn reset(&mut self) {
        self.leftover.clear();
        self.last_pts = None;
        self.audio_append_start_ts = None;
        self.prepended_content_duration = 0;
        self.earliest_allowed_dts = None;
    }

    fn frame_duration_in_timescale(&self, sample_rate: u32) -> u64 {
        // 90kHz master clock ticks per 1024-sample AAC frame.
        (self.samples_per_frame * 90_000) / sample_rate as u64
    }
}

impl Default for AudioSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_adts(sample_rate_index: u8, payload_len: usize) -> Vec<u8> {
        let frame_length = 7 + payload_len;
        let mut out = vec![0u8; frame_length];
        out[0] = 0xFF;
        out[1] = 0xF1;
        out[2] = (1 << 6) | (sample_rate_index << 2);
        out[3] = (((frame_length >> 11) & 0x03) as u8) | 0x80;
        out[4] = ((frame_length >> 3) & 0xFF) as u8;
        out[5] = (((frame_length & 0x07) as u8) << 5) | 0x1F;
        out[6] = 0xFC;
        out
    }

    #[test]
    fn pads_large_gap_with_silence() {
        let mut seg = AudioSegmenter::new();
        let first = make_adts(4, 10); // 44100
        seg.push(&first, 0);

        let second = make_adts(4, 10);
        let samples = seg.push(&second, 90_000); // ~1s later, way more than one frame
        assert!(samples.iter().any(|s| s.synthesized));
    }

    #[test]
    fn trims_leading_frames_below_earliest_allowed_dts() {
        let mut seg = AudioSegmenter::new();
        seg.set_earliest_allowed_dts(50_000);

        let mut buf = Vec::new();
        buf.extend_from_slice(&make_adts(4, 10));
        buf.extend_from_slice(&make_adts(4, 10));
        buf.extend_from_slice(&make_adts(4, 10));
        // frame duration at 44100 Hz is 1024*90000/44100 ≈ 2089 ticks, so
        // three frames starting at pts=0 all land before the 50_000 cutoff.
        let samples = seg.push(&buf, 0);
        assert!(samples.is_empty(), "every frame in this batch starts before earliest_allowed_dts");
    }

    #[test]
    fn set_earliest_allowed_dts_only_takes_effect_once() {
        let mut seg = AudioSegmenter::new();
        seg.set_earliest_allowed_dts(100);
        seg.set_earliest_allowed_dts(1_000_000);
        // pts=200 clears the first (winning) cutoff of 100 but would have
        // been trimmed by the second call's 1_000_000 had it taken effect.
        let samples = seg.push(&make_adts(4, 10), 200);
        assert!(!samples.is_empty(), "the later call must not overwrite the first");
    }
}
