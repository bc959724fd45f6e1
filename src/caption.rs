// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! CEA-608/708 caption byte-pair extraction from SEI NALs. Per Non-goals,
//! this crate never decodes or renders captions; it only extracts the
//! raw user-data byte pairs for a host to hand to its own decoder.

const SEI_TYPE_USER_DATA_REGISTERED: u8 = 4;
const CEA_708_ITU_T_T35_COUNTRY_CODE: u8 = 0xB5;

#[derive(Debug, Clone)]
pub struct CaptionPacket {
    pub pts: u64,
    pub byte_pairs: Vec<[u8; 2]>,
}

/// Scans one access unit's NAL units (AVCC length-prefixed) for SEI
/// `user_data_registered_itu_t_t35` payloads carrying CEA-608/708 data,
/// returning the raw caption byte pairs found, if any.
pub fn extract_captions(avcc_data: &[u8], pts: u64) -> Option<CaptionPacket> {
    let mut pairs = Vec::new();
    let mut offset = 0usize;

    while offset + 4 <= avcc_data.len() {
        let len = u32::from_be_bytes(avcc_data[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;
        if offset + len > avcc_data.len() {
            break;
        }
        let nal = &avcc_data[offset..offset + len];
        offset += len;

        if nal.is_empty() || (nal[0] & 0x1F) != 6 {
            continue; // not SEI
        }
        if let Some(found) = parse_sei(&nal[1..]) {
            pairs.extend(found);
        }
    }

    if pairs.is_empty() {
        None
    } else {
        Some(CaptionPacket { pts, byte_pairs: pairs })
    }
}

fn parse_sei(data: &[u8]) -> Option<Vec<[u8; 2]>> {
    let mut offset = 0usize;
    let mut payload_type = 0u32;
    while offset < data.len() && data[offset] == 0xFF {
        payload_type += 255;
        offset += 1;
    }
    if offset >= data.len() {
        return None;
    }
    payload_type += data[offset] as u32;
    offset += 1;

    let mut payload_size = 0usize;
    while offset < data.len() && data[offset] == 0xFF {
        payload_size += 255;
        offset += 1;
    }
    if offset >= data.len() {
        return None;
    }
    payload_size += data[offset] as usize;
    offset += 1;

    if payload_type != SEI_TYPE_USER_DATA_REGISTERED as u32
        || offset + payload_size > data.len()
        || payload_size < 3
    {
        return None;
    }

    let payload = &data[offset..offset + payload_size];
    if payload[0] != CEA_708_ITU_T_T35_COUNTRY_CODE {
        return None;
    }

    // Skip country code (1) + provider code (2) + user identifier (4) +
    // user data type code (1), then cc_count is the low 5 bits of the
    // next byte; each caption byte pair is 3 bytes (marker + 2 data).
    let header = 1 + 2 + 4 + 1;
    if payload.len() <= header {
        return None;
    }
    let cc_count = (payload[header] & 0x1F) as usize;
    let data_start = header + 2; // + reserved byte + process_em_data_flag byte

    let mut pairs = Vec::with_capacity(cc_count);
    for i in 0..cc_count {
        let base = data_start + i * 3;
        if base + 3 > payload.len() {
            break;
        }
        if payload[base] & 0x04 == 0 {
            continue; // cc_valid == 0
        }
        pairs.push([payload[base + 1], payload[base + 2]]);
    }

    if pairs.is_empty() {
        None
    } else {
        Some(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sei_nal(cc_pairs: &[(bool, u8, u8)]) -> Vec<u8> {
        let mut payload = vec![CEA_708_ITU_T_T35_COUNTRY_CODE];
        payload.extend_from_slice(&[0, 0]); // provider code
        payload.extend_from_slice(&[0, 0, 0, 0]); // user identifier
        payload.push(0); // user data type code
        payload.push(0xC0 | cc_pairs.len() as u8); // reserved bits + cc_count
        payload.push(0xFF); // reserved byte
        for (valid, b1, b2) in cc_pairs {
            payload.push(if *valid { 0xFC } else { 0xF8 });
            payload.push(*b1);
            payload.push(*b2);
        }

        let mut sei = vec![0x06]; // NAL header: type 6 (SEI)
        sei.push(SEI_TYPE_USER_DATA_REGISTERED);
        sei.push(payload.len() as u8);
        sei.extend_from_slice(&payload);

        let mut avcc = Vec::new();
        avcc.extend_from_slice(&(sei.len() as u32).to_be_bytes());
        avcc.extend_from_slice(&sei);
        avcc
    }

    #[test]
    fn extracts_valid_byte_pairs_from_a_sei_nal() {
        let avcc = sei_nal(&[(true, 0x94, 0x2C), (true, 0x61, 0x62)]);
        let packet = extract_captions(&avcc, 12345).expect("should find caption data");
        assert_eq!(packet.pts, 12345);
        assert_eq!(packet.byte_pairs, vec![[0x94, 0x2C], [0x61, 0x62]]);
    }

    #[test]
    fn skips_byte_pairs_with_cc_valid_unset() {
        let avcc = sei_nal(&[(false, 0x80, 0x80), (true, 0x11, 0x22)]);
        let packet = extract_captions(&avcc, 0).expect("one valid pair remains");
        assert_eq!(packet.byte_pairs, vec![[0x11, 0x22]]);
    }

    #[test]
    fn returns_none_for_non_sei_nals() {
        let mut avcc = Vec::new();
        let slice_nal = [0x61, 0xAA, 0xBB];
        avcc.extend_from_slice(&(slice_nal.len() as u32).to_be_bytes());
        avcc.extend_from_slice(&slice_nal);
        assert!(extract_captions(&avcc, 0).is_none());
    }

    #[test]
    fn returns_none_when_no_caption_pairs_present() {
        let avcc = sei_nal(&[]);
        assert!(extract_captions(&avcc, 0).is_none());
    }
}
