// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Stage 3 — PES Reassembler: accumulates TS payload fragments into
//! complete PES packets and decodes the 33-bit PTS/DTS fields.

use bytes::Bytes;
use tracing::warn;

use crate::ts::TsPacket;

pub const PES_START_CODE_PREFIX: [u8; 3] = [0x00, 0x00, 0x01];

#[derive(Debug, Clone)]
pub struct PesPacket {
    pub stream_id: u8,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub data: Bytes,
    pub random_access_indicator: bool,
}

/// Decodes a 33-bit PTS or DTS field per ISO/IEC 13818-1 §2.4.3.7: five
/// bytes starting at `data[offset]`, each carrying a marker bit pattern
/// around the 33 timestamp bits.
fn decode_timestamp(data: &[u8], offset: usize) -> Option<u64> {
    if offset + 5 > data.len() {
        return None;
    }
    let b = &data[offset..offset + 5];
    let ts = (((b[0] & 0x0E) as u64) << 29)
        | ((b[1] as u64) << 22)
        | (((b[2] & 0xFE) as u64) << 14)
        | ((b[3] as u64) << 7)
        | ((b[4] & 0xFE) as u64 >> 1);
    Some(ts)
}

/// Parses a complete PES packet payload (header + body), as handed over
/// by `PesAccumulator` once length/continuity bookkeeping says it's whole.
pub fn parse_pes(data: &[u8], random_access_indicator: bool) -> Option<PesPacket> {
    if data.len() < 9 || data[0..3] != PES_START_CODE_PREFIX {
        return None;
    }
    let stream_id = data[3];
    let pes_header_data_length = data[8] as usize;
    let header_end = 9 + pes_header_data_length;
    if header_end > data.len() {
        return None;
    }

    let pts_dts_flags = (data[7] & 0xC0) >> 6;
    let mut pts = None;
    let mut dts = None;
    if pts_dts_flags & 0x2 != 0 {
        pts = decode_timestamp(data, 9);
    }
    if pts_dts_flags == 0b11 {
        dts = decode_timestamp(data, 14);
    }

    Some(PesPacket {
        stream_id,
        pts,
        dts,
        data: Bytes::copy_from_slice(&data[header_end..]),
        random_access_indicator,
    })
}

/// Per-PID PES reassembly state, mirroring the teacher's `PesBuffer` but
/// generalized to both audio and video elementary streams and exposing
/// `PesPacket`s instead of raw byte vectors.
#[derive(Debug, Default)]
pub struct PesAccumulator {
    data: Vec<u8>,
    expected_continuity: Option<u8>,
    started: bool,
    random_access_indicator: bool,
}

impl PesAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one TS packet's payload. Returns a completed `PesPacket` if
    /// this packet's `payload_unit_start_indicator` closed out a
    /// previously-open accumulation.
    pub fn push(&mut self, packet: &TsPacket) -> Option<PesPacket> {
        let mut completed = None;

        if packet.payload_unit_start_indicator {
            if self.started && !self.data.is_empty() {
                completed = parse_pes(&self.data, self.random_access_indicator);
            }
            self.data.clear();
            self.started = true;
            self.random_access_indicator = packet.random_access_indicator;
            self.expected_continuity = Some(packet.continuity_counter);
        } else if self.started {
            match self.expected_continuity {
                Some(expected) if packet.continuity_counter != expected => {
                    warn!(
                        pid = packet.pid,
                        expected, got = packet.continuity_counter,
                        "pes continuity counter mismatch, discarding accumulator"
                    );
                    self.data.clear();
                    self.started = false;
                    return None;
                }
                _ => {}
            }
        } else {
            // payload before any PUSI; nothing to append to.
            return None;
        }

        if packet.has_payload {
            self.data.extend_from_slice(&packet.payload);
        }
        self.expected_continuity = Some((packet.continuity_counter + 1) & 0x0F);

        completed
    }

    /// Forces out whatever has been accumulated so far (end of stream).
    pub fn flush(&mut self) -> Option<PesPacket> {
        if !self.started || self.data.is_empty() {
            return None;
        }
        let result = parse_pes(&self.data, self.random_access_indicator);
        self.data.clear();
        self.started = false;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pes_bytes(stream_id: u8, pts: u64, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x00, 0x00, 0x01, stream_id];
        out.extend_from_slice(&[0x00, 0x00]); // pes_packet_length, filled below if needed
        out.push(0x80); // marker bits
        out.push(0x80); // pts_dts_flags = 10 (pts only)
        out.push(5); // pes_header_data_length
        let b0 = 0x21 | (((pts >> 29) as u8) & 0x0E);
        let b1 = ((pts >> 22) & 0xFF) as u8;
        let b2 = ((((pts >> 14) & 0xFF) as u8) & 0xFE) | 0x01;
        let b3 = ((pts >> 7) & 0xFF) as u8;
        let b4 = (((pts & 0x7F) as u8) << 1) | 0x01;
        out.extend_from_slice(&[b0, b1, b2, b3, b4]);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn decodes_pts_round_trip() {
        let pts = 90000u64 * 5;
        let bytes = pes_bytes(0xE0, pts, &[1, 2, 3]);
        let pes = parse_pes(&bytes, true).unwrap();
        assert_eq!(pes.pts, Some(pts));
        assert_eq!(&pes.data[..], &[1, 2, 3]);
    }
}
