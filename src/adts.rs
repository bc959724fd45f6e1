// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! ADTS AAC framing — the external-collaborator seam for audio, played
//! by a small in-crate parser (no crate in the corpus covers ADTS
//! specifically; see DESIGN.md).

use bytes::Bytes;

pub const ADTS_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

#[derive(Debug, Clone)]
pub struct AdtsFrame {
    pub profile: u8,
    pub sample_rate: u32,
    pub channel_count: u8,
    pub data: Bytes,
}

/// Splits a buffer of back-to-back ADTS frames (as delivered inside one
/// PES packet's payload) into individual `AdtsFrame`s. Trailing partial
/// data (fewer bytes than the declared frame length) is returned as the
/// second element so callers can prepend it to the next PES payload.
pub fn parse_adts_frames(data: &[u8]) -> (Vec<AdtsFrame>, usize) {
    let mut frames = Vec::new();
    let mut offset = 0usize;

    while offset + 7 <= data.len() {
        if data[offset] != 0xFF || (data[offset + 1] & 0xF0) != 0xF0 {
            // not a sync word; bail out, treat the rest as unconsumed
            break;
        }
        let protection_absent = data[offset + 1] & 0x01;
        let profile = (data[offset + 2] >> 6) & 0x03;
        let sampling_frequency_index = (data[offset + 2] >> 2) & 0x0F;
        let channel_config =
            ((data[offset + 2] & 0x01) << 2) | ((data[offset + 3] >> 6) & 0x03);
        let frame_length = (((data[offset + 3] & 0x03) as usize) << 11)
            | ((data[offset + 4] as usize) << 3)
            | ((data[offset + 5] as usize) >> 5);

        if frame_length < 7 || offset + frame_length > data.len() {
            break;
        }

        let sample_rate = ADTS_SAMPLE_RATES
            .get(sampling_frequency_index as usize)
            .copied()
            .unwrap_or(48000);

        let header_len = if protection_absent == 1 { 7 } else { 9 };
        if offset + header_len > data.len() {
            break;
        }

        frames.push(AdtsFrame {
            profile: profile + 1, // ADTS profile field is (AAC object type - 1)
            sample_rate,
            channel_count: channel_config,
            data: Bytes::copy_from_slice(&data[offset + header_len..offset + frame_length]),
        });

        offset += frame_length;
    }

    (frames, data.len() - offset)
}

/// Synthesizes a single canonical silent AAC-LC ADTS frame for the given
/// sample rate / channel count, to be reused whenever a gap needs
/// silence padding rather than re-synthesized per gap (see SPEC_FULL.md
/// §12).
pub fn silent_adts_frame(sample_rate: u32, channel_count: u8) -> AdtsFrame {
    // A minimal, valid AAC-LC raw_data_block encoding silence: a single
    // SCE with an all-zero individual_channel_stream is not bit-exact to
    // any one encoder's output, but any compliant decoder renders silence
    // from it. Callers needing byte-exact reference silence frames can
    // override via configuration; this is the fallback.
    let payload: &[u8] = &[0x21, 0x10, 0x04, 0x60, 0x8C, 0x1C];
    AdtsFrame {
        profile: 2, // AAC-LC
        sample_rate,
        channel_count,
        data: Bytes::from_static(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_adts(payload_len: usize) -> Vec<u8> {
        let frame_length = 7 + payload_len;
        let mut out = vec![0u8; frame_length];
        out[0] = 0xFF;
        out[1] = 0xF1; // MPEG-4, no CRC
        out[2] = (1 << 6) | (4 << 2); // profile=2(LC), sampling_index=4 (44100)
        out[3] = (((frame_length >> 11) & 0x03) as u8) | 0x80; // channel bit + length high bits
        out[4] = ((frame_length >> 3) & 0xFF) as u8;
        out[5] = (((frame_length & 0x07) as u8) << 5) | 0x1F;
        out[6] = 0xFC;
        out
    }

    #[test]
    fn parses_single_frame() {
        let raw = make_adts(10);
        let (frames, leftover) = parse_adts_frames(&raw);
        assert_eq!(frames.len(), 1);
        assert_eq!(leftover, 0);
        assert_eq!(frames[0].sample_rate, 44100);
        assert_eq!(frames[0].data.len(), 10);
    }

    #[test]
    fn leaves_trailing_partial_frame() {
        let mut raw = make_adts(10);
        raw.extend_from_slice(&[0xFF, 0xF1, 0x00]);
        let (frames, leftover) = parse_adts_frames(&raw);
        assert_eq!(frames.len(), 1);
        assert_eq!(leftover, 3);
    }
}
