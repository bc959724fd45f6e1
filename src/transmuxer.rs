// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Stage 10 — the public façade wiring every stage together: packet
//! splitting, PSI parsing, PES reassembly, rollover correction, video/
//! audio segmentation, and coalescing into ISO BMFF fragments.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{info, warn};

use crate::audio::AudioSegmenter;
use crate::bmff::{self, AudioInit, VideoInit};
use crate::caption::{extract_captions, CaptionPacket};
use crate::config::TransmuxerConfig;
use crate::error::Result;
use crate::id3::extract_id3_tags;
use crate::metrics::PipelineStats;
use crate::pes::{PesAccumulator, PesPacket};
use crate::rollover::RolloverState;
use crate::coalescer::Coalescer;
use crate::track::{AudioTrackInfo, SegmentEvent, SubtitleTrackInfo, TimelineStart, TrackInfo, VideoTrackInfo};
use crate::ts::{CodecFamily, PacketSplitter, ProgramMap, PsiParser, TsPacket};
use crate::video::VideoSegmenter;

/// Drives the whole pipeline for one elementary program. Single-threaded,
/// synchronous and cooperative: `push` fully propagates whatever it can
/// before returning, per the design's concurrency model.
pub struct Transmuxer {
    config: TransmuxerConfig,
    splitter: PacketSplitter,
    psi: PsiParser,
    trackinfo_emitted: bool,
    program_map: Option<ProgramMap>,

    video_pid: Option<u16>,
    audio_pids: Vec<u16>,
    current_audio_pid: Option<u16>,
    timed_metadata_pids: Vec<u16>,

    /// §4.2 / §7 class-2: PES arriving before the first PMT is buffered
    /// here, in order, and replayed once the program map is known.
    waiting_for_pmt: Vec<TsPacket>,

    pes_accumulators: HashMap<u16, PesAccumulator>,
    video_pts_rollover: RolloverState,
    video_dts_rollover: RolloverState,
    audio_rollover: RolloverState,
    metadata_rollover: RolloverState,
    video_segmenter: VideoSegmenter,
    audio_segmenter: AudioSegmenter,
    coalescer: Coalescer,

    video_init: Option<VideoInit>,
    audio_init: Option<AudioInit>,
    init_segment_emitted: bool,

    video_timeline: TimelineStart,
    audio_timeline: TimelineStart,

    /// §4.8: captions are held until the barrier's first data emission,
    /// then released with their pts rebased to the timeline start.
    pending_captions: Vec<CaptionPacket>,
    data_emitted: bool,

    stats: PipelineStats,
}

impl Transmuxer {
    pub fn new(config: TransmuxerConfig) -> Self {
        Self {
            config,
            splitter: PacketSplitter::new(),
            psi: PsiParser::new(),
            trackinfo_emitted: false,
            program_map: None,
            video_pid: None,
            audio_pids: Vec::new(),
            current_audio_pid: None,
            timed_metadata_pids: Vec::new(),
            waiting_for_pmt: Vec::new(),
            pes_accumulators: HashMap::new(),
            video_pts_rollover: RolloverState::new(),
            video_dts_rollover: RolloverState::new(),
            audio_rollover: RolloverState::new(),
            metadata_rollover: RolloverState::new(),
            video_segmenter: VideoSegmenter::new(),
            audio_segmenter: AudioSegmenter::new(),
            coalescer: Coalescer::default(),
            video_init: None,
            audio_init: None,
            init_segment_emitted: false,
            video_timeline: TimelineStart::default(),
            audio_timeline: TimelineStart::default(),
            pending_captions: Vec::new(),
            data_emitted: false,
            stats: PipelineStats::new(),
        }
    }

    /// Feeds a chunk of raw transport-stream bytes of any length or
    /// alignment, returning every event it was able to produce before
    /// returning: at most one `trackinfo`, at most one init segment, and
    /// zero or more media segments / captions / timed metadata.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<SegmentEvent>> {
        let start = Instant::now();
        let mut events = Vec::new();

        let packets = self.splitter.push(data);
        for raw in packets {
            self.stats.packets_processed += 1;
            let Some(packet) = TsPacket::parse(&raw) else {
                warn!("discarding unparsable ts packet");
                continue;
            };
            if packet.transport_error {
                continue;
            }
            self.handle_packet(packet, &mut events)?;
        }

        self.stats.log_summary(start.elapsed());
        Ok(events)
    }

    fn handle_packet(&mut self, packet: TsPacket, events: &mut Vec<SegmentEvent>) -> Result<()> {
        if packet.pid == crate::ts::psi::PAT_PID || Some(packet.pid) == self.psi.pmt_pid() {
            if self.psi.feed(&packet) {
                self.on_program_map_updated(events)?;
            }
            return Ok(());
        }

        if !self.trackinfo_emitted {
            self.waiting_for_pmt.push(packet);
            return Ok(());
        }

        self.route_packet(packet, events)
    }

    fn route_packet(&mut self, packet: TsPacket, events: &mut Vec<SegmentEvent>) -> Result<()> {
        if Some(packet.pid) == self.video_pid {
            self.handle_video_packet(packet, events)?;
        } else if Some(packet.pid) == self.current_audio_pid {
            self.handle_audio_packet(packet, events)?;
        } else if self.timed_metadata_pids.contains(&packet.pid) {
            self.handle_metadata_packet(packet, events)?;
        }
        // private-data/subtitle PIDs are advertised but not segmented.
        Ok(())
    }

    fn on_program_map_updated(&mut self, events: &mut Vec<SegmentEvent>) -> Result<()> {
        let map = self.psi.program_map().cloned();
        let Some(map) = map else { return Ok(()) };

        if self.trackinfo_emitted {
            warn!("received a second PMT after trackinfo was already emitted; ignoring structural changes until reset()");
            return Ok(());
        }

        self.apply_program_map(&map)?;
        self.program_map = Some(map.clone());
        events.push(SegmentEvent::TrackInfo(self.build_trackinfo(&map)));
        self.trackinfo_emitted = true;

        self.maybe_emit_init(events);

        let queued: Vec<TsPacket> = std::mem::take(&mut self.waiting_for_pmt);
        for packet in queued {
            self.route_packet(packet, events)?;
        }

        Ok(())
    }

    fn apply_program_map(&mut self, map: &ProgramMap) -> Result<()> {
        if let Some(video) = &map.video {
            self.video_pid = Some(video.pid);
        }
        self.audio_pids = map.audio.iter().map(|a| a.pid).collect();
        if let Some(&first) = self.audio_pids.first() {
            self.current_audio_pid = Some(first);
        }
        self.timed_metadata_pids = map
            .private_data
            .iter()
            .filter(|s| s.codec == CodecFamily::TimedMetadata)
            .map(|s| s.pid)
            .collect();

        self.coalescer =
            Coalescer::with_remux(self.video_pid.is_some(), !self.audio_pids.is_empty(), self.config.remux);

        for stream in map.audio.iter().chain(map.private_data.iter()) {
            if !self.config.broad_mode && stream.codec == CodecFamily::Unknown {
                return Err(crate::error::TransmuxError::UnsupportedCodec {
                    stream_type: stream.stream_type,
                    pid: stream.pid,
                });
            }
        }

        Ok(())
    }

    fn build_trackinfo(&self, map: &ProgramMap) -> TrackInfo {
        let video = map.video.as_ref().map(|v| {
            let (width, height) = self.video_init.as_ref().map(|i| (i.width, i.height)).unwrap_or((0, 0));
            VideoTrackInfo {
                pid: v.pid,
                codec: self.video_segmenter.codec_string().unwrap_or_else(|| "avc1".into()),
                width,
                height,
                timescale: bmff::VIDEO_TIMESCALE,
            }
        });

        let audio = map
            .audio
            .iter()
            .map(|a| AudioTrackInfo {
                pid: a.pid,
                codec: match a.codec {
                    CodecFamily::Aac => "mp4a.40.2".into(),
                    CodecFamily::Ac3 => "ac-3".into(),
                    CodecFamily::MpegAudio => "mp4a.40.34".into(),
                    _ => "unknown".into(),
                },
                sample_rate: self.audio_init.as_ref().map(|i| i.sample_rate).unwrap_or(0),
                channel_count: self.audio_init.as_ref().map(|i| i.channel_count).unwrap_or(0),
            })
            .collect();

        let subtitles = map
            .private_data
            .iter()
            .filter(|p| p.codec != CodecFamily::TimedMetadata)
            .map(|p| SubtitleTrackInfo { pid: p.pid, stream_type: p.stream_type, language: None })
            .collect();

        TrackInfo { video, audio, subtitles }
    }

    fn handle_video_packet(&mut self, packet: TsPacket, events: &mut Vec<SegmentEvent>) -> Result<()> {
        let acc = self.pes_accumulators.entry(packet.pid).or_insert_with(PesAccumulator::new);
        if let Some(pes) = acc.push(&packet) {
            self.process_video_pes(pes, events)?;
        }
        Ok(())
    }

    fn process_video_pes(&mut self, pes: PesPacket, events: &mut Vec<SegmentEvent>) -> Result<()> {
        let Some(raw_pts) = pes.pts else { return Ok(()) };
        let raw_dts = pes.dts.unwrap_or(raw_pts);
        let pts = self.video_pts_rollover.extend(raw_pts);
        let dts = self.video_dts_rollover.extend(raw_dts);

        if let Some(mut captions) = extract_captions(&pes.data, pts) {
            captions.pts = self.rebase_caption_pts(pts);
            if self.data_emitted {
                events.push(SegmentEvent::Captions(captions));
            } else {
                self.pending_captions.push(captions);
            }
        }

        for gop in self.video_segmenter.push(&pes.data, pts, dts) {
            self.ensure_video_init(&gop, events);
            if let Some(first) = gop.frames.first() {
                self.audio_segmenter.set_earliest_allowed_dts(first.dts);
            }
            self.maybe_emit_init(events);
            let result = self.coalescer.submit_video_gop(
                gop,
                &mut self.video_timeline,
                self.config.keep_original_timestamps,
            )?;
            if let Some(data) = result {
                self.stats.video_segments_emitted += 1;
                events.push(SegmentEvent::MediaSegment {
                    track_id: bmff::VIDEO_TRACK_ID,
                    sequence_number: self.stats.video_segments_emitted as u32,
                    data,
                });
                self.note_media_segment_emitted(events);
            }
        }
        Ok(())
    }

    fn handle_audio_packet(&mut self, packet: TsPacket, events: &mut Vec<SegmentEvent>) -> Result<()> {
        let acc = self.pes_accumulators.entry(packet.pid).or_insert_with(PesAccumulator::new);
        if let Some(pes) = acc.push(&packet) {
            self.process_audio_pes(pes, events)?;
        }
        Ok(())
    }

    fn process_audio_pes(&mut self, pes: PesPacket, events: &mut Vec<SegmentEvent>) -> Result<()> {
        let Some(raw_pts) = pes.pts else { return Ok(()) };
        let pts = self.audio_rollover.extend(raw_pts);

        let samples = self.audio_segmenter.push(&pes.data, pts);
        if samples.is_empty() {
            return Ok(());
        }

        self.stats.silence_frames_inserted += samples.iter().filter(|s| s.synthesized).count() as u64;
        if let Some(first) = samples.first() {
            self.ensure_audio_init(first.frame.sample_rate, first.frame.channel_count);
            self.maybe_emit_init(events);
        }

        if let Some(data) = self.coalescer.submit_audio_run(
            samples,
            &mut self.audio_timeline,
            self.config.keep_original_timestamps,
        )? {
            self.stats.audio_segments_emitted += 1;
            events.push(SegmentEvent::MediaSegment {
                track_id: bmff::AUDIO_TRACK_ID,
                sequence_number: self.stats.audio_segments_emitted as u32,
                data,
            });
            self.note_media_segment_emitted(events);
        }
        Ok(())
    }

    fn handle_metadata_packet(&mut self, packet: TsPacket, events: &mut Vec<SegmentEvent>) -> Result<()> {
        let acc = self.pes_accumulators.entry(packet.pid).or_insert_with(PesAccumulator::new);
        if let Some(pes) = acc.push(&packet) {
            self.process_metadata_pes(pes, events);
        }
        Ok(())
    }

    fn process_metadata_pes(&mut self, pes: PesPacket, events: &mut Vec<SegmentEvent>) {
        let Some(raw_pts) = pes.pts else { return };
        let pts = self.metadata_rollover.extend(raw_pts);
        for tag in extract_id3_tags(&pes.data, pts) {
            events.push(SegmentEvent::TimedMetadata(tag));
        }
    }

    /// §4.8 `metadataTsToSeconds`, kept in 90 kHz ticks rather than
    /// converting to seconds: rebases `pts` against whichever track's
    /// timeline start is known (video first, then audio), or leaves it
    /// untouched when `keep_original_timestamps` is set.
    fn rebase_caption_pts(&self, pts: u64) -> u64 {
        if self.config.keep_original_timestamps {
            return pts;
        }
        let start = self.video_timeline.pts.or(self.audio_timeline.pts).unwrap_or(0);
        pts.saturating_sub(start)
    }

    fn note_media_segment_emitted(&mut self, events: &mut Vec<SegmentEvent>) {
        if self.data_emitted {
            return;
        }
        self.data_emitted = true;
        for packet in self.pending_captions.drain(..) {
            events.push(SegmentEvent::Captions(packet));
        }
    }

    fn ensure_video_init(&mut self, gop: &crate::nal::Gop, events: &mut Vec<SegmentEvent>) {
        if self.video_init.is_some() {
            return;
        }
        let Some(first) = gop.frames.first() else { return };
        let (Some(sps), Some(pps)) = (&first.sps, &first.pps) else { return };

        let (width, height) = crate::nal::sps_dimensions(sps).unwrap_or((0, 0));
        self.video_init = Some(VideoInit { codec_avcc: build_avcc_record(Some(sps), Some(pps)), width, height });

        // §8 "Codec string stability": trackinfo's codec was a generic
        // placeholder at PMT time (no NAL parsed yet); now that the SPS
        // is known, re-emit it matching what the init segment carries.
        if let Some(map) = self.program_map.clone() {
            events.push(SegmentEvent::TrackInfo(self.build_trackinfo(&map)));
        }
    }

    fn ensure_audio_init(&mut self, sample_rate: u32, channel_count: u8) {
        if self.audio_init.is_some() {
            return;
        }
        self.audio_init = Some(AudioInit { sample_rate, channel_count, object_type: 2 });
    }

    fn maybe_emit_init(&mut self, events: &mut Vec<SegmentEvent>) {
        if self.init_segment_emitted {
            return;
        }
        // §6 / §4.8: one shared init segment covers every advertised
        // track; a track the PMT never listed is vacuously ready.
        let video_ready = self.video_pid.is_none() || self.video_init.is_some();
        let audio_ready = self.audio_pids.is_empty() || self.audio_init.is_some();
        if !(video_ready && audio_ready) {
            return;
        }
        if self.video_init.is_none() && self.audio_init.is_none() {
            return;
        }
        let init = bmff::init_segment(self.video_init.as_ref(), self.audio_init.as_ref());
        events.push(SegmentEvent::InitSegment { data: init });
        self.init_segment_emitted = true;
    }

    /// Forces out every accumulator and segmenter's pending data as a
    /// final set of fragments (end of stream). Flush order follows §4.3:
    /// video PID first, then each audio PID (ascending), then timed
    /// metadata — so the final in-flight PES of each never just vanishes.
    pub fn flush(&mut self) -> Vec<SegmentEvent> {
        let mut events = Vec::new();

        if let Some(video_pid) = self.video_pid {
            if let Some(pes) = self.pes_accumulators.get_mut(&video_pid).and_then(PesAccumulator::flush) {
                if let Err(err) = self.process_video_pes(pes, &mut events) {
                    warn!(?err, "failed to process final buffered video pes on flush");
                }
            }
        }

        let mut audio_pids = self.audio_pids.clone();
        audio_pids.sort_unstable();
        for pid in audio_pids {
            if let Some(pes) = self.pes_accumulators.get_mut(&pid).and_then(PesAccumulator::flush) {
                if let Err(err) = self.process_audio_pes(pes, &mut events) {
                    warn!(?err, "failed to process final buffered audio pes on flush");
                }
            }
        }

        let mut metadata_pids = self.timed_metadata_pids.clone();
        metadata_pids.sort_unstable();
        for pid in metadata_pids {
            if let Some(pes) = self.pes_accumulators.get_mut(&pid).and_then(PesAccumulator::flush) {
                self.process_metadata_pes(pes, &mut events);
            }
        }

        for gop in self.video_segmenter.flush() {
            if let Ok(Some(data)) = self.coalescer.submit_video_gop(
                gop,
                &mut self.video_timeline,
                self.config.keep_original_timestamps,
            ) {
                events.push(SegmentEvent::MediaSegment {
                    track_id: bmff::VIDEO_TRACK_ID,
                    sequence_number: self.stats.video_segments_emitted as u32 + 1,
                    data,
                });
                self.note_media_segment_emitted(&mut events);
            }
        }
        if let Some(data) = self.coalescer.flush() {
            events.push(SegmentEvent::MediaSegment {
                track_id: 0,
                sequence_number: self.stats.video_segments_emitted as u32 + 1,
                data,
            });
            self.note_media_segment_emitted(&mut events);
        }

        for packet in self.pending_captions.drain(..) {
            events.push(SegmentEvent::Captions(packet));
        }

        events.push(SegmentEvent::Done);
        info!("transmuxer flushed");
        events
    }

    /// Full state reset: every stage forgets everything it has seen,
    /// including the accumulated rollover offsets.
    pub fn reset(&mut self) {
        *self = Transmuxer::new(self.config.clone());
    }

    /// Relocates every track's timeline origin to `t` (in the 90 kHz video
    /// clock): clears timeline-start on every track, signals a
    /// discontinuity to rollover (offset preserved, distinct from
    /// `reset()` — see SPEC_FULL.md §12), flushes the video GOP cache and
    /// resets the caption stream.
    pub fn set_base_media_decode_time(&mut self, t: u64) {
        self.video_timeline = TimelineStart { dts: None, pts: None, base_media_decode_time: t };
        self.audio_timeline = TimelineStart { dts: None, pts: None, base_media_decode_time: t };
        self.video_pts_rollover.discontinuity();
        self.video_dts_rollover.discontinuity();
        self.audio_rollover.discontinuity();
        self.video_segmenter.clear_cache();
        self.reset_captions();
    }

    pub fn set_remux(&mut self, remux: bool) {
        self.config.remux = remux;
        self.coalescer.set_remux(remux);
    }

    pub fn set_audio_track_from_pid(&mut self, pid: u16) {
        self.current_audio_pid = Some(pid);
    }

    /// See §4.9 / §4.6 step 3: the next audio run is padded with silence
    /// so it appears to start at `ts` (90 kHz video clock) if it would
    /// otherwise start later.
    pub fn set_audio_append_start(&mut self, ts: u64) {
        self.audio_segmenter.set_audio_append_start(ts);
    }

    /// §4.9 `alignGopsWith`: future video segments are trimmed so their
    /// first retained GOP's PTS lands on one of `pts_list` (90 kHz clock).
    pub fn align_gops_with(&mut self, pts_list: Vec<u64>) {
        self.video_segmenter.align_gops_with(pts_list, false);
    }

    pub fn reset_captions(&mut self) {
        self.pending_captions.clear();
        self.data_emitted = false;
    }
}

fn build_avcc_record(sps: Option<&bytes::Bytes>, pps: Option<&bytes::Bytes>) -> bytes::Bytes {
    let sps = sps.cloned().unwrap_or_default();
    let pps = pps.cloned().unwrap_or_default();
    let mut out = Vec::with_capacity(11 + sps.len() + pps.len());
    out.push(1); // configurationVersion
    out.push(sps.get(1).copied().unwrap_or(0x42)); // profile_idc
    out.push(sps.get(2).copied().unwrap_or(0)); // profile_compatibility
    out.push(sps.get(3).copied().unwrap_or(0x1E)); // level_idc
    out.push(0xFF); // reserved (6 bits) + lengthSizeMinusOne=3 (4-byte lengths)
    out.push(0xE1); // reserved (3 bits) + numOfSequenceParameterSets=1
    out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    out.extend_from_slice(&sps);
    out.push(1); // numOfPictureParameterSets
    out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    out.extend_from_slice(&pps);
    bytes::Bytes::from(out)
}
