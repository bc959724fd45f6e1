// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Stage 6 — VideoSegmenter: groups H.264 access units into frames and
//! frames into GOPs, applying GOP-fusion and keyframe-pulling so that
//! every emitted segment both starts on a keyframe and is never
//! starved of one by an unlucky PES/keyframe split.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::nal::{codec_string, Frame, Gop, H264Parser};

/// Bounded window (90 kHz ticks) within which two adjacent short GOPs are
/// considered fragments of what was really a single encoder GOP, per
/// SPEC_FULL.md §12.
const FUSION_MIN_GAP: i64 = -10_000;
const FUSION_MAX_GAP: i64 = 45_000;
const GOP_CACHE_CAPACITY: usize = 6;

struct CachedGop {
    sps: Bytes,
    pps: Bytes,
    gop: Gop,
}

/// 90 kHz-tick tolerance for matching a GOP's anchor PTS against an
/// alignment list entry — GOP boundaries rarely land on the exact
/// requested tick, so an exact match would almost never succeed.
const ALIGNMENT_TOLERANCE: i64 = 1500;

pub struct VideoSegmenter {
    parser: H264Parser,
    current: Option<Gop>,
    cache: VecDeque<CachedGop>,
    alignment: Option<Vec<u64>>,
    align_at_end: bool,
    held: Vec<Gop>,
}

impl VideoSegmenter {
    pub fn new() -> Self {
        Self {
            parser: H264Parser::new(),
            current: None,
            cache: VecDeque::new(),
            alignment: None,
            align_at_end: false,
            held: Vec::new(),
        }
    }

    /// §4.5 step 5 / §4.9 `alignGopsWith`: future segments are trimmed so
    /// the first (or last, with `align_at_end`) retained GOP's PTS matches
    /// one of `pts_list`. An empty list disables alignment.
    pub fn align_gops_with(&mut self, pts_list: Vec<u64>, align_at_end: bool) {
        self.alignment = if pts_list.is_empty() { None } else { Some(pts_list) };
        self.align_at_end = align_at_end;
        self.held.clear();
    }

    pub fn codec_string(&self) -> Option<String> {
        self.parser.current_sps().map(|sps| codec_string(sps))
    }

    /// Feeds one PES packet's payload (a single H.264 access unit's Annex
    /// B bytes). Returns every GOP that becomes ready to hand to the
    /// coalescer as a result.
    pub fn push(&mut self, data: &[u8], pts: u64, dts: u64) -> Vec<Gop> {
        let frames = self.parser.push(data, pts, dts);
        let mut ready = Vec::new();

        for frame in frames {
            if frame.is_keyframe {
                if let Some(finished) = self.current.take() {
                    if let Some(fused) = self.try_fuse_or_cache(finished) {
                        ready.push(fused);
                    }
                }
                self.current = Some(Gop::default());
            }

            match &mut self.current {
                Some(gop) => gop.frames.push(frame),
                None => {
                    // Stream starts mid-GOP with no keyframe seen yet;
                    // drop frames until the first keyframe, per §7 class-4
                    // (malformed/unusable structural input, silently
                    // discarded rather than surfaced as an error).
                    trace!("discarding pre-keyframe video frame");
                }
            }
        }

        self.apply_alignment(ready)
    }

    /// Forces out whatever GOP is currently being built (end of stream /
    /// explicit flush).
    pub fn flush(&mut self) -> Vec<Gop> {
        let mut ready = Vec::new();
        if let Some(gop) = self.current.take() {
            if let Some(fused) = self.try_fuse_or_cache(gop) {
                ready.push(fused);
            }
        }
        while let Some(cached) = self.cache.pop_front() {
            ready.push(cached.gop);
        }
        ready.extend(self.held.drain(..));
        ready
    }

    pub fn reset(&mut self) {
        self.parser = H264Parser::new();
        self.current = None;
        self.cache.clear();
        self.held.clear();
    }

    /// If an alignment list is configured, trims leading (or, with
    /// `align_at_end`, trailing) GOPs from `ready` until the retained
    /// boundary GOP's anchor PTS matches an alignment entry. GOPs held
    /// back pending a future match are cached in `self.held` and
    /// prepended to the next call; if still no match is possible, no
    /// segment is emitted this round (§4.5 step 5).
    fn apply_alignment(&mut self, ready: Vec<Gop>) -> Vec<Gop> {
        let Some(alignment) = &self.alignment else { return ready };
        if alignment.is_empty() {
            return ready;
        }

        let mut pending: Vec<Gop> = self.held.drain(..).chain(ready).collect();
        if pending.is_empty() {
            return pending;
        }

        let matches = |pts: u64| alignment.iter().any(|&a| (pts as i64 - a as i64).abs() <= ALIGNMENT_TOLERANCE);

        if self.align_at_end {
            let idx = pending.iter().rposition(|g| g.frames.last().map(|f| matches(f.pts)).unwrap_or(false));
            match idx {
                Some(i) => {
                    let _ = pending.split_off(i + 1);
                }
                None => {
                    self.held = pending;
                    return Vec::new();
                }
            }
        } else {
            let idx = pending.iter().position(|g| g.frames.first().map(|f| matches(f.pts)).unwrap_or(false));
            match idx {
                Some(i) => {
                    pending.drain(0..i);
                }
                None => {
                    self.held = pending;
                    return Vec::new();
                }
            }
        }
        pending
    }

    /// Drops the GOP-fusion cache without emitting its contents — used by
    /// `set_base_media_decode_time`, which discards stale fusion candidates
    /// across the discontinuity rather than flushing them as segments.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Looks for a cached GOP sharing this one's SPS/PPS within the
    /// bounded DTS-gap fusion window and merges them if found; otherwise
    /// caches this GOP and pulls the oldest qualifying cached GOP forward
    /// to emit instead (keyframe-pulling: never let a just-finished GOP
    /// sit un-emitted when an older, complete one is available).
    fn try_fuse_or_cache(&mut self, gop: Gop) -> Option<Gop> {
        let (sps, pps) = match gop.frames.first() {
            Some(f) => (f.sps.clone().unwrap_or_default(), f.pps.clone().unwrap_or_default()),
            None => return None,
        };

        if let Some(gap_idx) = self.find_fusable(&sps, &pps, &gop) {
            let mut cached = self.cache.remove(gap_idx).expect("index in range");
            cached.gop.frames.extend(gop.frames);
            debug!(frames = cached.gop.frames.len(), "fused adjacent GOP fragments");
            return Some(cached.gop);
        }

        if self.cache.len() >= GOP_CACHE_CAPACITY {
            self.cache.pop_front();
        }
        self.cache.push_back(CachedGop { sps, pps, gop });
        None
    }

    fn find_fusable(&self, sps: &Bytes, pps: &Bytes, gop: &Gop) -> Option<usize> {
        let first_dts = gop.frames.first()?.dts as i64;
        self.cache.iter().position(|c| {
            if c.sps != *sps || c.pps != *pps {
                return false;
            }
            match c.gop.frames.last() {
                Some(last) => {
                    let gap = first_dts - last.dts as i64;
                    gap >= FUSION_MIN_GAP && gap <= FUSION_MAX_GAP
                }
                None => false,
            }
        })
    }
}

impl Default for VideoSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nal::Frame;

    fn frame(pts: u64, dts: u64, keyframe: bool) -> Frame {
        Frame {
            pts,
            dts,
            is_keyframe: keyframe,
            sps: Some(Bytes::from_static(&[0x67, 1, 2, 3])),
            pps: Some(Bytes::from_static(&[0x68, 1])),
            data: Bytes::from_static(&[0, 0, 0, 1, 0x61]),
        }
    }

    #[test]
    fn fuses_adjacent_short_gops_sharing_parameter_sets() {
        let mut seg = VideoSegmenter::new();
        seg.current = Some(Gop { frames: vec![frame(0, 0, true)] });
        let finished = seg.current.take().unwrap();
        assert!(seg.try_fuse_or_cache(finished).is_none());
        assert_eq!(seg.cache.len(), 1);

        let next = Gop { frames: vec![frame(3000, 3000, true)] };
        let fused = seg.try_fuse_or_cache(next).expect("should fuse");
        assert_eq!(fused.frames.len(), 2);
    }

    #[test]
    fn evicts_oldest_cache_entry_past_capacity() {
        let mut seg = VideoSegmenter::new();
        for i in 0..(GOP_CACHE_CAPACITY + 2) {
            let mut f = frame(i as u64 * 100_000, i as u64 * 100_000, true);
            f.sps = Some(Bytes::copy_from_slice(&[0x67, i as u8]));
            let gop = Gop { frames: vec![f] };
            seg.try_fuse_or_cache(gop);
        }
        assert!(seg.cache.len() <= GOP_CACHE_CAPACITY);
    }
}
