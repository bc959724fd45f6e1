// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! H.264 NAL / access-unit adaptation layer — the external-collaborator
//! seam for video, played by the `h264-parser` crate (grounded in
//! `moq-dev-moq`'s `hang` import path).

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use h264_parser::{AnnexBParser, Sps};

#[derive(Debug, Clone)]
pub struct NalUnit {
    pub nal_unit_type: u8,
    pub data: Bytes,
}

/// One H.264 access unit (frame) in decode order, carrying the
/// presentation/decode timestamps assigned by the PES layer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub pts: u64,
    pub dts: u64,
    pub is_keyframe: bool,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
    /// Access-unit payload in length-prefixed (AVCC) form, ready to drop
    /// straight into an `mdat`.
    pub data: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct Gop {
    pub frames: Vec<Frame>,
}

impl Gop {
    pub fn byte_length(&self) -> usize {
        self.frames.iter().map(|f| f.data.len()).sum()
    }
}

/// Derives the three-byte `avc1.PPCCLL` codec string from a decoded SPS.
pub fn codec_string(sps: &Sps) -> String {
    format!("avc1.{:02x}{:02x}{:02x}", sps.profile_idc, profile_compat(sps), sps.level_idc)
}

fn profile_compat(sps: &Sps) -> u8 {
    ((sps.constraint_set0_flag as u8) << 7)
        | ((sps.constraint_set1_flag as u8) << 6)
        | ((sps.constraint_set2_flag as u8) << 5)
        | ((sps.constraint_set3_flag as u8) << 4)
        | ((sps.constraint_set4_flag as u8) << 3)
        | ((sps.constraint_set5_flag as u8) << 2)
}

/// Wraps `h264_parser::AnnexBParser`, converting each access unit it
/// yields into our own `Frame` type and tracking the most recently seen
/// SPS/PPS for codec-string derivation and GOP fusion.
pub struct H264Parser {
    parser: AnnexBParser,
    last_sps: Option<Arc<Sps>>,
    last_sps_bytes: Option<Bytes>,
    last_pps_bytes: Option<Bytes>,
}

impl H264Parser {
    pub fn new() -> Self {
        Self {
            parser: AnnexBParser::new(),
            last_sps: None,
            last_sps_bytes: None,
            last_pps_bytes: None,
        }
    }

    pub fn current_sps(&self) -> Option<&Arc<Sps>> {
        self.last_sps.as_ref()
    }

    /// Feeds one access unit's raw Annex B bytes (as reassembled from a
    /// single PES packet) and returns the `Frame`s it completes, tagged
    /// with the given presentation/decode timestamps.
    pub fn push(&mut self, data: &[u8], pts: u64, dts: u64) -> Vec<Frame> {
        self.parser.push(data);
        let mut out = Vec::new();
        while let Some(au) = self.parser.next_access_unit() {
            let au = match au {
                Ok(au) => au,
                Err(_) => continue,
            };

            let annexb: &[u8] = &au.to_annexb_bytes();
            for nal in split_annexb(annexb) {
                if nal.is_empty() {
                    continue;
                }
                match nal[0] & 0x1F {
                    7 => self.last_sps_bytes = Some(Bytes::copy_from_slice(nal)),
                    8 => self.last_pps_bytes = Some(Bytes::copy_from_slice(nal)),
                    _ => {}
                }
            }
            if let Some(sps) = au.sps.clone() {
                self.last_sps = Some(sps);
            }

            let is_keyframe = au.is_keyframe();
            let avcc = annexb_to_avcc(annexb);

            out.push(Frame {
                pts,
                dts,
                is_keyframe,
                sps: self.last_sps_bytes.clone(),
                pps: self.last_pps_bytes.clone(),
                data: avcc,
            });
        }
        out
    }
}

impl Default for H264Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts an Annex B byte stream (start-code delimited) to AVCC
/// (4-byte big-endian length prefixed) form, stripping SPS/PPS/AUD NALs
/// which are carried separately in the sample description / not needed
/// per-sample.
fn annexb_to_avcc(annexb: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(annexb.len());
    for nal in split_annexb(annexb) {
        if nal.is_empty() {
            continue;
        }
        let nal_type = nal[0] & 0x1F;
        if matches!(nal_type, 7 | 8 | 9) {
            // SPS, PPS, AUD carried out of band
            continue;
        }
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_annexb_handles_three_and_four_byte_start_codes() {
        let data = [0, 0, 0, 1, 0x67, 0xAA, 0, 0, 1, 0x68, 0xBB, 0xCC];
        let nals = split_annexb(&data);
        assert_eq!(nals, vec![&[0x67u8, 0xAA][..], &[0x68u8, 0xBB, 0xCC][..]]);
    }

    #[test]
    fn split_annexb_trims_trailing_zero_padding_before_next_start_code() {
        let data = [0, 0, 1, 0x61, 0xAA, 0, 0, 0, 0, 1, 0x61, 0xBB];
        let nals = split_annexb(&data);
        assert_eq!(nals, vec![&[0x61u8, 0xAA][..], &[0x61u8, 0xBB][..]]);
    }

    struct BitWriter {
        bytes: Vec<u8>,
        cur: u8,
        nbits: u8,
    }

    impl BitWriter {
        fn new() -> Self {
            Self { bytes: Vec::new(), cur: 0, nbits: 0 }
        }

        fn push_bit(&mut self, bit: u32) {
            self.cur = (self.cur << 1) | (bit as u8 & 1);
            self.nbits += 1;
            if self.nbits == 8 {
                self.bytes.push(self.cur);
                self.cur = 0;
                self.nbits = 0;
            }
        }

        fn push_bits(&mut self, value: u32, n: u32) {
            for i in (0..n).rev() {
                self.push_bit((value >> i) & 1);
            }
        }

        fn push_ue(&mut self, value: u32) {
            let code = value + 1;
            let nbits = 32 - code.leading_zeros();
            for _ in 0..nbits - 1 {
                self.push_bit(0);
            }
            self.push_bits(code, nbits);
        }

        fn finish(mut self) -> Vec<u8> {
            while self.nbits != 0 {
                self.push_bit(0);
            }
            self.bytes
        }
    }

    #[test]
    fn sps_dimensions_decodes_a_1280x720_baseline_sps() {
        let mut w = BitWriter::new();
        w.push_bits(66, 8); // profile_idc: baseline
        w.push_bits(0xC0, 8); // constraint_set flags + reserved
        w.push_bits(30, 8); // level_idc
        w.push_ue(0); // seq_parameter_set_id
        w.push_ue(0); // log2_max_frame_num_minus4
        w.push_ue(2); // pic_order_cnt_type (no extra fields for type 2)
        w.push_ue(1); // max_num_ref_frames
        w.push_bits(0, 1); // gaps_in_frame_num_value_allowed_flag
        w.push_ue(79); // pic_width_in_mbs_minus1: (79+1)*16 = 1280
        w.push_ue(44); // pic_height_in_map_units_minus1: (44+1)*16 = 720
        w.push_bits(1, 1); // frame_mbs_only_flag
        w.push_bits(1, 1); // direct_8x8_inference_flag
        w.push_bits(0, 1); // frame_cropping_flag

        let mut nal = vec![0x67u8];
        nal.extend(w.finish());

        let (width, height) = sps_dimensions(&nal).expect("should decode dimensions");
        assert_eq!((width, height), (1280, 720));
    }

    #[test]
    fn annexb_to_avcc_strips_sps_pps_aud_and_length_prefixes_the_rest() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 0, 1, 0x09, 0xF0]); // AUD
        data.extend_from_slice(&[0, 0, 0, 1, 0x67, 1, 2, 3]); // SPS
        data.extend_from_slice(&[0, 0, 0, 1, 0x68, 4]); // PPS
        data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0xFF, 0xEE]); // IDR slice

        let avcc = annexb_to_avcc(&data);
        let mut expected = Vec::new();
        expected.extend_from_slice(&3u32.to_be_bytes());
        expected.extend_from_slice(&[0x65, 0xFF, 0xEE]);
        assert_eq!(&avcc[..], &expected[..]);
    }
}

/// Bit-level reader over an RBSP byte slice (emulation-prevention bytes
/// already stripped), used only for pulling `pic_width`/`pic_height` out of
/// an SPS — the rest of the decoded SPS comes from `h264_parser::Sps`.
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bit(&mut self) -> Option<u32> {
        let byte = self.pos / 8;
        if byte >= self.data.len() {
            return None;
        }
        let shift = 7 - (self.pos % 8);
        self.pos += 1;
        Some(((self.data[byte] >> shift) & 1) as u32)
    }

    fn u(&mut self, n: u32) -> Option<u32> {
        let mut v = 0u32;
        for _ in 0..n {
            v = (v << 1) | self.bit()?;
        }
        Some(v)
    }

    /// Exp-Golomb unsigned (`ue(v)`), ITU-T H.264 §9.1.
    fn ue(&mut self) -> Option<u32> {
        let mut leading_zeros = 0u32;
        while self.bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 32 {
                return None;
            }
        }
        if leading_zeros == 0 {
            return Some(0);
        }
        let suffix = self.u(leading_zeros)?;
        Some((1u32 << leading_zeros) - 1 + suffix)
    }

    /// Exp-Golomb signed (`se(v)`), ITU-T H.264 §9.1.1.
    fn se(&mut self) -> Option<i32> {
        let k = self.ue()?;
        let mag = ((k + 1) / 2) as i32;
        Some(if k % 2 == 0 { -mag } else { mag })
    }

    fn skip_scaling_list(&mut self, size: u32) -> Option<()> {
        let mut last_scale = 8i32;
        let mut next_scale = 8i32;
        for _ in 0..size {
            if next_scale != 0 {
                let delta_scale = self.se()?;
                next_scale = (last_scale + delta_scale + 256) % 256;
            }
            last_scale = if next_scale == 0 { last_scale } else { next_scale };
        }
        Some(())
    }
}

/// Strips H.264 emulation-prevention bytes (`0x03` following two `0x00`
/// bytes) from a NAL payload, yielding the raw RBSP `ue(v)`/`se(v)` parsing
/// expects.
fn strip_emulation_prevention(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len());
    let mut zero_run = 0u8;
    for &b in nal {
        if zero_run >= 2 && b == 0x03 {
            zero_run = 0;
            continue;
        }
        zero_run = if b == 0 { zero_run + 1 } else { 0 };
        out.push(b);
    }
    out
}

const CHROMA_444_SEPARATE_COLOUR_PLANE: &[u8] =
    &[100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// Decodes `pic_width`/`pic_height` from a raw SPS NAL (header byte
/// included), per ITU-T H.264 §7.3.2.1.1 / Annex E cropping rectangle. Not
/// exposed by `h264_parser::Sps`, so this crate derives it directly from
/// the RBSP the same way every H.264 demuxer does.
pub fn sps_dimensions(nal: &[u8]) -> Option<(u16, u16)> {
    if nal.is_empty() {
        return None;
    }
    let rbsp = strip_emulation_prevention(&nal[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.u(8)?;
    r.u(8)?; // constraint flags + reserved
    r.u(8)?; // level_idc
    r.ue()?; // seq_parameter_set_id

    if CHROMA_444_SEPARATE_COLOUR_PLANE.contains(&(profile_idc as u8)) {
        let chroma_format_idc = r.ue()?;
        if chroma_format_idc == 3 {
            r.u(1)?; // separate_colour_plane_flag
        }
        r.ue()?; // bit_depth_luma_minus8
        r.ue()?; // bit_depth_chroma_minus8
        r.u(1)?; // qpprime_y_zero_transform_bypass_flag
        if r.u(1)? != 0 {
            // seq_scaling_matrix_present_flag
            let count = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..count {
                if r.u(1)? != 0 {
                    // seq_scaling_list_present_flag[i]
                    r.skip_scaling_list(if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.ue()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = r.ue()?;
    if pic_order_cnt_type == 0 {
        r.ue()?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        r.u(1)?; // delta_pic_order_always_zero_flag
        r.se()?; // offset_for_non_ref_pic
        r.se()?; // offset_for_top_to_bottom_field
        let cycle = r.ue()?;
        for _ in 0..cycle {
            r.se()?; // offset_for_ref_frame
        }
    }

    r.ue()?; // max_num_ref_frames
    r.u(1)?; // gaps_in_frame_num_value_allowed_flag
    let pic_width_in_mbs_minus1 = r.ue()?;
    let pic_height_in_map_units_minus1 = r.ue()?;
    let frame_mbs_only_flag = r.u(1)?;
    if frame_mbs_only_flag == 0 {
        r.u(1)?; // mb_adaptive_frame_field_flag
    }
    r.u(1)?; // direct_8x8_inference_flag

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0u32, 0u32, 0u32, 0u32);
    if r.u(1)? != 0 {
        // frame_cropping_flag
        crop_left = r.ue()?;
        crop_right = r.ue()?;
        crop_top = r.ue()?;
        crop_bottom = r.ue()?;
    }

    let width = (pic_width_in_mbs_minus1 + 1) * 16 - (crop_left + crop_right) * 2;
    let height = (2 - frame_mbs_only_flag) * (pic_height_in_map_units_minus1 + 1) * 16
        - (crop_top + crop_bottom) * 2;

    Some((width as u16, height as u16))
}

/// Returns `(code_start, payload_start)` for each start code found:
/// `code_start` is where the `00 00 01` / `00 00 00 01` prefix begins,
/// `payload_start` is the byte right after it. A NAL's content always
/// runs from its own `payload_start` to the *next* NAL's `code_start` —
/// using the next NAL's `payload_start` instead would leak that NAL's
/// start-code bytes into this one's payload.
fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0usize;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push((i, i + 3));
            i += 3;
        } else if i + 4 <= data.len() && data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 0 && data[i + 3] == 1 {
            starts.push((i, i + 4));
            i += 4;
        } else {
            i += 1;
        }
    }
    let mut out = Vec::with_capacity(starts.len());
    for w in 0..starts.len() {
        let (_, payload_start) = starts[w];
        let mut end = if w + 1 < starts.len() { starts[w + 1].0 } else { data.len() };
        // Trailing zero bytes directly preceding the next start code are
        // Annex B `leading_zero_8bits` padding, never RBSP content.
        while end > payload_start && data[end - 1] == 0 {
            end -= 1;
        }
        out.push(&data[payload_start..end]);
    }
    out
}
