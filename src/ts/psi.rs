// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Stage 2 — PacketParser: PAT/PMT section parsing and ProgramMap assembly.

use std::collections::HashMap;
use tracing::{debug, trace, warn};

use super::packet::TsPacket;

pub const PAT_PID: u16 = 0x0000;

pub const STREAM_TYPE_H264: u8 = 0x1B;
pub const STREAM_TYPE_AAC_ADTS: u8 = 0x0F;
pub const STREAM_TYPE_MPEG_AUDIO: u8 = 0x03;
pub const STREAM_TYPE_MPEG_AUDIO_2: u8 = 0x04;
pub const STREAM_TYPE_AC3: u8 = 0x81;
pub const STREAM_TYPE_ID3_METADATA: u8 = 0x15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecFamily {
    H264,
    Aac,
    Ac3,
    MpegAudio,
    TimedMetadata,
    Unknown,
}

impl CodecFamily {
    pub fn from_stream_type(stream_type: u8) -> Self {
        match stream_type {
            STREAM_TYPE_H264 => CodecFamily::H264,
            STREAM_TYPE_AAC_ADTS => CodecFamily::Aac,
            STREAM_TYPE_AC3 => CodecFamily::Ac3,
            STREAM_TYPE_MPEG_AUDIO | STREAM_TYPE_MPEG_AUDIO_2 => CodecFamily::MpegAudio,
            STREAM_TYPE_ID3_METADATA => CodecFamily::TimedMetadata,
            _ => CodecFamily::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub tag: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct StreamMap {
    pub pid: u16,
    pub stream_type: u8,
    pub codec: CodecFamily,
    pub descriptors: Vec<StreamDescriptor>,
}

/// The decoded state of a program: which PID carries which elementary
/// stream, derived once the PAT and the PMT it points at have both
/// been seen.
#[derive(Debug, Clone, Default)]
pub struct ProgramMap {
    pub program_number: u16,
    pub pmt_pid: u16,
    pub pcr_pid: u16,
    pub video: Option<StreamMap>,
    pub audio: Vec<StreamMap>,
    pub private_data: Vec<StreamMap>,
    pub version: u8,
    pub complete: bool,
}

/// Parses PAT/PMT sections as they stream in and assembles a `ProgramMap`.
/// Follows the teacher's `demux.rs` pointer-field / table-id / section-length
/// parsing approach, generalized to multi-stream PMTs.
#[derive(Debug, Default)]
pub struct PsiParser {
    pat_pmt_pid: Option<u16>,
    section_buffers: HashMap<u16, Vec<u8>>,
    program_map: Option<ProgramMap>,
}

impl PsiParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program_map(&self) -> Option<&ProgramMap> {
        self.program_map.as_ref().filter(|m| m.complete)
    }

    /// Feeds one transport packet belonging to pid 0 (PAT) or a known PMT
    /// pid. Returns `true` exactly when a complete new ProgramMap became
    /// available as a result of this call.
    pub fn feed(&mut self, packet: &TsPacket) -> bool {
        if packet.pid == PAT_PID {
            self.feed_section(packet, true)
        } else if Some(packet.pid) == self.pat_pmt_pid {
            self.feed_section(packet, false)
        } else {
            false
        }
    }

    pub fn pmt_pid(&self) -> Option<u16> {
        self.pat_pmt_pid
    }

    fn feed_section(&mut self, packet: &TsPacket, is_pat: bool) -> bool {
        if !packet.has_payload || packet.payload.is_empty() {
            return false;
        }

        let data: &[u8] = if packet.payload_unit_start_indicator {
            let pointer_field = packet.payload[0] as usize;
            if 1 + pointer_field > packet.payload.len() {
                warn!("psi pointer_field out of range, discarding packet");
                return false;
            }
            &packet.payload[1 + pointer_field..]
        } else {
            // Continuation packets are not accumulated across packets in
            // this implementation: PAT/PMT here are assumed to fit in a
            // single TS packet, true for every practical broadcast PMT.
            self.section_buffers.entry(packet.pid).or_default();
            &packet.payload[..]
        };

        if data.len() < 3 {
            return false;
        }

        let table_id = data[0];
        let section_length = (((data[1] & 0x0F) as usize) << 8) | data[2] as usize;
        let section_end = 3 + section_length;
        if section_end > data.len() {
            warn!("psi section_length exceeds available data, discarding");
            return false;
        }
        let section = &data[..section_end];

        if is_pat {
            if table_id != 0x00 {
                return false;
            }
            self.parse_pat(section)
        } else {
            if table_id != 0x02 {
                return false;
            }
            self.parse_pmt(section)
        }
    }

    fn parse_pat(&mut self, section: &[u8]) -> bool {
        // section: table_id, section_length hi/lo, tsid(2), version/cn(1),
        // section_number(1), last_section_number(1), then 4-byte program
        // entries, then 4-byte CRC.
        if section.len() < 8 {
            return false;
        }
        let programs_end = section.len() - 4;
        let mut offset = 8usize;
        while offset + 4 <= programs_end {
            let program_number = ((section[offset] as u16) << 8) | section[offset + 1] as u16;
            let pid = (((section[offset + 2] & 0x1F) as u16) << 8) | section[offset + 3] as u16;
            offset += 4;
            if program_number == 0 {
                continue; // network PID entry, not a program
            }
            debug!(program_number, pmt_pid = pid, "found PAT program entry");
            self.pat_pmt_pid = Some(pid);
            return false;
        }
        false
    }

    fn parse_pmt(&mut self, section: &[u8]) -> bool {
        if section.len() < 12 {
            return false;
        }
        if section[5] & 0x01 == 0 {
            trace!("ignoring pmt section with current_next_indicator = 0");
            return false;
        }
        let program_number = ((section[3] as u16) << 8) | section[4] as u16;
        let version = (section[5] >> 1) & 0x1F;
        let pcr_pid = (((section[8] & 0x1F) as u16) << 8) | section[9] as u16;
        let program_info_length = (((section[10] & 0x0F) as usize) << 8) | section[11] as usize;

        let mut offset = 12 + program_info_length;
        let section_end = section.len() - 4; // strip CRC32

        let mut map = ProgramMap {
            program_number,
            pmt_pid: self.pat_pmt_pid.unwrap_or_default(),
            pcr_pid,
            version,
            complete: true,
            ..Default::default()
        };

        while offset + 5 <= section_end {
            let stream_type = section[offset];
            let pid = (((section[offset + 1] & 0x1F) as u16) << 8) | section[offset + 2] as u16;
            let es_info_length =
                (((section[offset + 3] & 0x0F) as usize) << 8) | section[offset + 4] as usize;
            offset += 5;

            let descriptors = if offset + es_info_length <= section_end {
                parse_descriptors(&section[offset..offset + es_info_length])
            } else {
                Vec::new()
            };
            offset += es_info_length;

            let codec = CodecFamily::from_stream_type(stream_type);
            let stream = StreamMap { pid, stream_type, codec, descriptors };

            trace!(pid, stream_type, ?codec, "found PMT stream entry");
            match codec {
                CodecFamily::H264 => map.video = Some(stream),
                CodecFamily::Aac | CodecFamily::Ac3 | CodecFamily::MpegAudio => {
                    map.audio.push(stream)
                }
                _ => map.private_data.push(stream),
            }
        }

        let changed = match &self.program_map {
            Some(existing) => existing.version != map.version,
            None => true,
        };
        self.program_map = Some(map);
        changed
    }
}

fn parse_descriptors(data: &[u8]) -> Vec<StreamDescriptor> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset + 2 <= data.len() {
        let tag = data[offset];
        let len = data[offset + 1] as usize;
        offset += 2;
        if offset + len > data.len() {
            break;
        }
        out.push(StreamDescriptor { tag, data: data[offset..offset + len].to_vec() });
        offset += len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::packet::{TsPacket, TS_PACKET_SIZE, TS_SYNC_BYTE};

    fn wrap_section(pid: u16, section: &[u8]) -> TsPacket {
        let mut raw = vec![0u8; TS_PACKET_SIZE];
        raw[0] = TS_SYNC_BYTE;
        raw[1] = 0x40 | ((pid >> 8) as u8 & 0x1F);
        raw[2] = (pid & 0xFF) as u8;
        raw[3] = 0x10;
        raw[4] = 0x00; // pointer field
        raw[5..5 + section.len()].copy_from_slice(section);
        TsPacket::parse(&raw).unwrap()
    }

    fn pat_section(pmt_pid: u16) -> Vec<u8> {
        let mut s = vec![0x00u8, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00];
        s.push(0x00);
        s.push(0x01);
        s.push(0xE0 | ((pmt_pid >> 8) as u8 & 0x1F));
        s.push((pmt_pid & 0xFF) as u8);
        s.extend_from_slice(&[0, 0, 0, 0]); // dummy CRC
        s
    }

    fn pmt_section(video_pid: u16, audio_pid: u16) -> Vec<u8> {
        let mut s = vec![0x02u8];
        s.push(0xB0);
        s.push(0); // length placeholder, fixed below
        s.extend_from_slice(&[0x00, 0x01]); // program number
        s.push(0xC1); // version/current_next
        s.extend_from_slice(&[0x00, 0x00]); // section/last section number
        s.push(0xE0 | ((video_pid >> 8) as u8 & 0x1F));
        s.push((video_pid & 0xFF) as u8); // pcr pid
        s.extend_from_slice(&[0xF0, 0x00]); // program_info_length = 0

        s.push(STREAM_TYPE_H264);
        s.push(0xE0 | ((video_pid >> 8) as u8 & 0x1F));
        s.push((video_pid & 0xFF) as u8);
        s.extend_from_slice(&[0xF0, 0x00]);

        s.push(STREAM_TYPE_AAC_ADTS);
        s.push(0xE0 | ((audio_pid >> 8) as u8 & 0x1F));
        s.push((audio_pid & 0xFF) as u8);
        s.extend_from_slice(&[0xF0, 0x00]);

        s.extend_from_slice(&[0, 0, 0, 0]); // dummy CRC

        let section_length = s.len() - 3;
        s[1] = 0xB0 | (((section_length >> 8) as u8) & 0x0F);
        s[2] = (section_length & 0xFF) as u8;
        s
    }

    #[test]
    fn parses_pat_then_pmt_into_program_map() {
        let mut parser = PsiParser::new();
        let pat = wrap_section(PAT_PID, &pat_section(0x1000));
        assert!(!parser.feed(&pat));
        assert_eq!(parser.pmt_pid(), Some(0x1000));

        let pmt = wrap_section(0x1000, &pmt_section(0x100, 0x101));
        assert!(parser.feed(&pmt));

        let map = parser.program_map().expect("program map");
        assert_eq!(map.video.as_ref().unwrap().pid, 0x100);
        assert_eq!(map.audio[0].pid, 0x101);
        assert_eq!(map.audio[0].codec, CodecFamily::Aac);
    }
}
