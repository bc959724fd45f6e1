// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! ISO BMFF box writer — hand-rolled (see DESIGN.md for why this isn't
//! built on an external atom crate), styled after the teacher's
//! byte-exact `muxer.rs` box construction.

use bytes::{BufMut, Bytes, BytesMut};

pub const VIDEO_TRACK_ID: u32 = 1;
pub const AUDIO_TRACK_ID: u32 = 2;
pub const VIDEO_TIMESCALE: u32 = 90_000;

const TRUN_DATA_OFFSET_PRESENT: u32 = 0x000001;
const TRUN_SAMPLE_DURATION_PRESENT: u32 = 0x000100;
const TRUN_SAMPLE_SIZE_PRESENT: u32 = 0x000200;
const TRUN_SAMPLE_FLAGS_PRESENT: u32 = 0x000400;
const TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT: u32 = 0x000800;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

pub const SAMPLE_FLAG_NON_SYNC: u32 = 1 << 16;

fn boxed(fourcc: &[u8; 4], body: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(8 + body.len());
    out.put_u32(8 + body.len() as u32);
    out.put_slice(fourcc);
    out.put_slice(body);
    out
}

#[derive(Debug, Clone)]
pub struct VideoInit {
    pub codec_avcc: Bytes,
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone)]
pub struct AudioInit {
    pub sample_rate: u32,
    pub channel_count: u8,
    pub object_type: u8,
}

/// One sample's entry in a `trun` box.
#[derive(Debug, Clone, Copy)]
pub struct SampleEntry {
    pub duration: u32,
    pub size: u32,
    pub is_sync: bool,
    pub composition_time_offset: i32,
}

pub struct TrackFragment {
    pub track_id: u32,
    pub base_media_decode_time: u64,
    pub samples: Vec<SampleEntry>,
    pub sample_data: Bytes,
}

/// `ftyp` + `moov`: the init segment, emitted once per track set.
pub fn init_segment(video: Option<&VideoInit>, audio: Option<&AudioInit>) -> Bytes {
    let mut out = BytesMut::new();
    out.extend_from_slice(&ftyp());
    out.extend_from_slice(&moov(video, audio));
    out.freeze()
}

fn ftyp() -> BytesMut {
    let mut body = BytesMut::new();
    body.put_slice(b"mp42"); // major_brand
    body.put_u32(0); // minor_version
    for brand in [b"mp41", b"mp42", b"isom", b"hlsf"] {
        body.put_slice(brand);
    }
    boxed(b"ftyp", &body)
}

fn moov(video: Option<&VideoInit>, audio: Option<&AudioInit>) -> BytesMut {
    let mut body = BytesMut::new();
    body.extend_from_slice(&mvhd());

    let mut next_track_id = 1u32;
    if let Some(v) = video {
        body.extend_from_slice(&trak_video(VIDEO_TRACK_ID, v));
        next_track_id = VIDEO_TRACK_ID + 1;
    }
    if let Some(a) = audio {
        body.extend_from_slice(&trak_audio(AUDIO_TRACK_ID, a));
        next_track_id = next_track_id.max(AUDIO_TRACK_ID + 1);
    }

    body.extend_from_slice(&mvex(video.is_some(), audio.is_some()));
    let _ = next_track_id;
    boxed(b"moov", &body)
}

fn mvhd() -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(0); // version
    body.put_slice(&[0, 0, 0]); // flags
    body.put_u32(0); // creation_time
    body.put_u32(0); // modification_time
    body.put_u32(1000); // timescale
    body.put_u32(0); // duration (fragmented, unknown)
    body.put_u32(0x00010000); // rate = 1.0
    body.put_u16(0x0100); // volume = 1.0
    body.put_u16(0); // reserved
    body.put_u64(0); // reserved
    for v in [0x00010000i32, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
        body.put_i32(v);
    }
    body.put_bytes(0, 6 * 4); // pre_defined
    body.put_u32(3); // next_track_id (video=1, audio=2)
    boxed(b"mvhd", &body)
}

fn tkhd(track_id: u32, width: u16, height: u16) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(0);
    body.put_slice(&[0, 0, 0x07]); // flags: enabled | in_movie | in_preview
    body.put_u32(0);
    body.put_u32(0);
    body.put_u32(track_id);
    body.put_u32(0); // reserved
    body.put_u32(0); // duration
    body.put_u64(0); // reserved
    body.put_u16(0); // layer
    body.put_u16(0); // alternate_group
    body.put_u16(if width > 0 { 0 } else { 0x0100 }); // volume: 0 for video, 1.0 for audio
    body.put_u16(0);
    for v in [0x00010000i32, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
        body.put_i32(v);
    }
    body.put_u32((width as u32) << 16);
    body.put_u32((height as u32) << 16);
    boxed(b"tkhd", &body)
}

fn mdhd(timescale: u32) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(0);
    body.put_slice(&[0, 0, 0]);
    body.put_u32(0);
    body.put_u32(0);
    body.put_u32(timescale);
    body.put_u32(0);
    body.put_u16(0x55C4); // language "und"
    body.put_u16(0);
    boxed(b"mdhd", &body)
}

fn hdlr(handler_type: &[u8; 4], name: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(0);
    body.put_slice(&[0, 0, 0]);
    body.put_u32(0);
    body.put_slice(handler_type);
    body.put_bytes(0, 12);
    body.put_slice(name.as_bytes());
    body.put_u8(0);
    boxed(b"hdlr", &body)
}

fn dinf() -> BytesMut {
    let mut url = BytesMut::new();
    url.put_u8(0);
    url.put_slice(&[0, 0, 1]); // flag: self-contained
    let url_box = boxed(b"url ", &url);

    let mut dref_body = BytesMut::new();
    dref_body.put_u8(0);
    dref_body.put_slice(&[0, 0, 0]);
    dref_body.put_u32(1);
    dref_body.extend_from_slice(&url_box);
    let dref = boxed(b"dref", &dref_body);

    boxed(b"dinf", &dref)
}

fn avcc(avcc_params: &Bytes) -> BytesMut {
    boxed(b"avcC", avcc_params)
}

fn esds(object_type: u8, sample_rate: u32, channel_count: u8) -> BytesMut {
    let sample_rate_index = crate::adts::ADTS_SAMPLE_RATES
        .iter()
        .position(|&r| r == sample_rate)
        .unwrap_or(4) as u8;
    let decoder_specific_info = [
        (object_type << 3) | (sample_rate_index >> 1),
        (sample_rate_index << 7) | (channel_count << 3),
    ];

    let mut body = BytesMut::new();
    body.put_u32(0); // version/flags

    body.put_u8(0x03); // ES_DescrTag
    body.put_u8(25); // size
    body.put_u16(1); // ES_ID
    body.put_u8(0); // flags

    body.put_u8(0x04); // DecoderConfigDescrTag
    body.put_u8(17);
    body.put_u8(0x40); // object_type_indication: AAC
    body.put_u8(0x15); // stream_type: audio, upstream=0, reserved=1
    body.put_slice(&[0, 0, 0]); // buffer_size_db
    body.put_u32(0); // max_bitrate
    body.put_u32(0); // avg_bitrate

    body.put_u8(0x05); // DecoderSpecificInfoTag
    body.put_u8(decoder_specific_info.len() as u8);
    body.put_slice(&decoder_specific_info);

    body.put_u8(0x06); // SLConfigDescrTag
    body.put_u8(1);
    body.put_u8(0x02);

    boxed(b"esds", &body)
}

fn stsd_video(v: &VideoInit) -> BytesMut {
    let mut avc1 = BytesMut::new();
    avc1.put_bytes(0, 6); // reserved
    avc1.put_u16(1); // data_reference_index
    avc1.put_u16(0); // pre_defined
    avc1.put_u16(0); // reserved
    avc1.put_bytes(0, 12); // pre_defined
    avc1.put_u16(v.width);
    avc1.put_u16(v.height);
    avc1.put_u32(0x00480000); // horizresolution 72dpi
    avc1.put_u32(0x00480000); // vertresolution 72dpi
    avc1.put_u32(0); // reserved
    avc1.put_u16(1); // frame_count
    avc1.put_bytes(0, 32); // compressorname
    avc1.put_u16(0x0018); // depth
    avc1.put_i16(-1); // pre_defined
    avc1.extend_from_slice(&avcc(&v.codec_avcc));
    let avc1_box = boxed(b"avc1", &avc1);

    let mut body = BytesMut::new();
    body.put_u32(0);
    body.put_u32(1); // entry_count
    body.extend_from_slice(&avc1_box);
    boxed(b"stsd", &body)
}

fn stsd_audio(a: &AudioInit) -> BytesMut {
    let mut mp4a = BytesMut::new();
    mp4a.put_bytes(0, 6);
    mp4a.put_u16(1);
    mp4a.put_u32(0); // reserved
    mp4a.put_u32(0); // reserved
    mp4a.put_u16(a.channel_count as u16);
    mp4a.put_u16(16); // sample_size
    mp4a.put_u16(0); // pre_defined
    mp4a.put_u16(0); // reserved
    mp4a.put_u32((a.sample_rate as u32) << 16);
    mp4a.extend_from_slice(&esds(a.object_type, a.sample_rate, a.channel_count));
    let mp4a_box = boxed(b"mp4a", &mp4a);

    let mut body = BytesMut::new();
    body.put_u32(0);
    body.put_u32(1);
    body.extend_from_slice(&mp4a_box);
    boxed(b"stsd", &body)
}

fn empty_sample_table_tail() -> BytesMut {
    let mut out = BytesMut::new();
    for fourcc in [b"stts", b"stsc", b"stsz", b"stco"] {
        let mut body = BytesMut::new();
        body.put_u32(0);
        if fourcc == b"stsz" {
            body.put_u32(0); // sample_size
        }
        body.put_u32(0); // entry/sample_count
        out.extend_from_slice(&boxed(fourcc, &body));
    }
    out
}

fn stbl(stsd: BytesMut) -> BytesMut {
    let mut body = BytesMut::new();
    body.extend_from_slice(&stsd);
    body.extend_from_slice(&empty_sample_table_tail());
    boxed(b"stbl", &body)
}

fn minf_video(v: &VideoInit) -> BytesMut {
    let mut vmhd_body = BytesMut::new();
    vmhd_body.put_u32(1); // version/flags: flag 1 required by spec
    vmhd_body.put_bytes(0, 8);
    let vmhd = boxed(b"vmhd", &vmhd_body);

    let mut body = BytesMut::new();
    body.extend_from_slice(&vmhd);
    body.extend_from_slice(&dinf());
    body.extend_from_slice(&stbl(stsd_video(v)));
    boxed(b"minf", &body)
}

fn minf_audio(a: &AudioInit) -> BytesMut {
    let mut smhd_body = BytesMut::new();
    smhd_body.put_u32(0);
    smhd_body.put_i16(0); // balance
    smhd_body.put_u16(0);
    let smhd = boxed(b"smhd", &smhd_body);

    let mut body = BytesMut::new();
    body.extend_from_slice(&smhd);
    body.extend_from_slice(&dinf());
    body.extend_from_slice(&stbl(stsd_audio(a)));
    boxed(b"minf", &body)
}

fn mdia(timescale: u32, handler_type: &[u8; 4], name: &str, minf: BytesMut) -> BytesMut {
    let mut body = BytesMut::new();
    body.extend_from_slice(&mdhd(timescale));
    body.extend_from_slice(&hdlr(handler_type, name));
    body.extend_from_slice(&minf);
    boxed(b"mdia", &body)
}

fn trak_video(track_id: u32, v: &VideoInit) -> BytesMut {
    let mut body = BytesMut::new();
    body.extend_from_slice(&tkhd(track_id, v.width, v.height));
    body.extend_from_slice(&mdia(VIDEO_TIMESCALE, b"vide", "VideoHandler", minf_video(v)));
    boxed(b"trak", &body)
}

fn trak_audio(track_id: u32, a: &AudioInit) -> BytesMut {
    let mut body = BytesMut::new();
    body.extend_from_slice(&tkhd(track_id, 0, 0));
    body.extend_from_slice(&mdia(a.sample_rate, b"soun", "SoundHandler", minf_audio(a)));
    boxed(b"trak", &body)
}

fn trex(track_id: u32) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u32(0);
    body.put_u32(track_id);
    body.put_u32(1); // default_sample_description_index
    body.put_u32(0); // default_sample_duration
    body.put_u32(0); // default_sample_size
    body.put_u32(0); // default_sample_flags
    boxed(b"trex", &body)
}

fn mvex(has_video: bool, has_audio: bool) -> BytesMut {
    let mut body = BytesMut::new();
    if has_video {
        body.extend_from_slice(&trex(VIDEO_TRACK_ID));
    }
    if has_audio {
        body.extend_from_slice(&trex(AUDIO_TRACK_ID));
    }
    boxed(b"mvex", &body)
}

/// `moof` + `mdat` for a single fragment covering one or more tracks.
pub fn moof_and_mdat(sequence_number: u32, fragments: &[TrackFragment]) -> Bytes {
    let mut mfhd_body = BytesMut::new();
    mfhd_body.put_u32(0);
    mfhd_body.put_u32(sequence_number);
    let mfhd = boxed(b"mfhd", &mfhd_body);

    let mut trafs = BytesMut::new();
    for frag in fragments {
        trafs.extend_from_slice(&traf(frag));
    }

    let mut moof_body = BytesMut::new();
    moof_body.extend_from_slice(&mfhd);
    moof_body.extend_from_slice(&trafs);
    let moof = boxed(b"moof", &moof_body);

    // trun data_offset is relative to the start of the moof box; patch it
    // now that moof's total size is known.
    let moof_len = moof.len() as i32;
    let mut moof = moof;
    patch_data_offsets(&mut moof, fragments, moof_len);

    let mut mdat = BytesMut::with_capacity(8 + fragments.iter().map(|f| f.sample_data.len()).sum::<usize>());
    let total_media: usize = fragments.iter().map(|f| f.sample_data.len()).sum();
    mdat.put_u32(8 + total_media as u32);
    mdat.put_slice(b"mdat");
    for frag in fragments {
        mdat.put_slice(&frag.sample_data);
    }

    let mut out = BytesMut::with_capacity(moof.len() + mdat.len());
    out.extend_from_slice(&moof);
    out.extend_from_slice(&mdat);
    out.freeze()
}

fn traf(frag: &TrackFragment) -> BytesMut {
    let mut tfhd_body = BytesMut::new();
    tfhd_body.put_u8(0);
    tfhd_body.put_slice(&TFHD_DEFAULT_BASE_IS_MOOF.to_be_bytes()[1..]);
    tfhd_body.put_u32(frag.track_id);
    let tfhd = boxed(b"tfhd", &tfhd_body);

    let mut tfdt_body = BytesMut::new();
    tfdt_body.put_u8(1); // version 1: 64-bit base_media_decode_time
    tfdt_body.put_slice(&[0, 0, 0]);
    tfdt_body.put_u64(frag.base_media_decode_time);
    let tfdt = boxed(b"tfdt", &tfdt_body);

    let trun = trun(frag, 0); // data_offset patched later by patch_data_offsets

    let mut body = BytesMut::new();
    body.extend_from_slice(&tfhd);
    body.extend_from_slice(&tfdt);
    body.extend_from_slice(&trun);
    boxed(b"traf", &body)
}

fn trun(frag: &TrackFragment, data_offset: i32) -> BytesMut {
    let flags = TRUN_DATA_OFFSET_PRESENT
        | TRUN_SAMPLE_DURATION_PRESENT
        | TRUN_SAMPLE_SIZE_PRESENT
        | TRUN_SAMPLE_FLAGS_PRESENT
        | TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT;

    let mut body = BytesMut::new();
    body.put_u8(1); // version 1: signed composition time offsets
    body.put_slice(&flags.to_be_bytes()[1..]);
    body.put_u32(frag.samples.len() as u32);
    body.put_i32(data_offset);

    for s in &frag.samples {
        body.put_u32(s.duration);
        body.put_u32(s.size);
        let flags = if s.is_sync { 0 } else { SAMPLE_FLAG_NON_SYNC };
        body.put_u32(flags);
        body.put_i32(s.composition_time_offset);
    }

    boxed(b"trun", &body)
}

/// After assembling `moof` with placeholder data_offsets, rewrites each
/// `trun`'s data_offset field to point at that track's actual byte
/// offset within the following `mdat`'s payload.
fn patch_data_offsets(moof: &mut BytesMut, fragments: &[TrackFragment], moof_len: i32) {
    let mut media_offset = moof_len + 8; // skip this moof + the mdat header
    let mut search_start = 0usize;

    for frag in fragments {
        if let Some(pos) = find_trun_data_offset_field(&moof[search_start..], frag.samples.len()) {
            let abs_pos = search_start + pos;
            moof[abs_pos..abs_pos + 4].copy_from_slice(&media_offset.to_be_bytes());
            search_start = abs_pos + 4;
        }
        media_offset += frag.sample_data.len() as i32;
    }
}

fn find_trun_data_offset_field(data: &[u8], _sample_count: usize) -> Option<usize> {
    // trun boxes are identified by fourcc "trun"; the data_offset field
    // sits at a fixed offset (12 bytes into the box body: version/flags(4)
    // + sample_count(4) + data_offset(4)) immediately after the box header.
    let pos = data.windows(4).position(|w| w == b"trun")?;
    Some(pos + 4 + 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_segment_starts_with_ftyp_then_moov() {
        let video = VideoInit { codec_avcc: Bytes::from_static(&[1, 0x42, 0, 0x1E, 0]), width: 1280, height: 720 };
        let seg = init_segment(Some(&video), None);
        assert_eq!(&seg[4..8], b"ftyp");
        let ftyp_len = u32::from_be_bytes(seg[0..4].try_into().unwrap()) as usize;
        assert_eq!(&seg[ftyp_len + 4..ftyp_len + 8], b"moov");
    }

    #[test]
    fn moof_mdat_data_offset_points_into_mdat() {
        let frag = TrackFragment {
            track_id: VIDEO_TRACK_ID,
            base_media_decode_time: 0,
            samples: vec![SampleEntry { duration: 3000, size: 4, is_sync: true, composition_time_offset: 0 }],
            sample_data: Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF]),
        };
        let out = moof_and_mdat(1, &[frag]);
        let moof_len = u32::from_be_bytes(out[0..4].try_into().unwrap()) as usize;
        assert_eq!(&out[moof_len + 4..moof_len + 8], b"mdat");
        assert_eq!(&out[out.len() - 4..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }
}
