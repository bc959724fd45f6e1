// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Timed ID3 metadata extraction from private-data PES packets
//! (stream_type 0x15). The payload is handed through as an opaque,
//! already-valid ID3v2 tag; this crate does not interpret individual
//! frames, only locates tag boundaries so multiple tags packed into one
//! PES payload can be split apart.

#[derive(Debug, Clone)]
pub struct TimedMetadata {
    pub pts: u64,
    pub tag: Vec<u8>,
}

/// Splits a PES payload that may contain one or more concatenated ID3v2
/// tags ("ID3" + 2-byte version + 1-byte flags + 4-byte synchsafe size)
/// into individual tags.
pub fn extract_id3_tags(data: &[u8], pts: u64) -> Vec<TimedMetadata> {
    let mut out = Vec::new();
    let mut offset = 0usize;

    while offset + 10 <= data.len() {
        if &data[offset..offset + 3] != b"ID3" {
            break;
        }
        let size = synchsafe_to_u32(&data[offset + 6..offset + 10]) as usize;
        let tag_end = offset + 10 + size;
        if tag_end > data.len() {
            break;
        }
        out.push(TimedMetadata { pts, tag: data[offset..tag_end].to_vec() });
        offset = tag_end;
    }

    out
}

fn synchsafe_to_u32(bytes: &[u8]) -> u32 {
    ((bytes[0] as u32 & 0x7F) << 21)
        | ((bytes[1] as u32 & 0x7F) << 14)
        | ((bytes[2] as u32 & 0x7F) << 7)
        | (bytes[3] as u32 & 0x7F)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_tag() {
        let mut data = b"ID3".to_vec();
        data.extend_from_slice(&[0x04, 0x00, 0x00]);
        data.extend_from_slice(&[0, 0, 0, 4]); // size = 4
        data.extend_from_slice(&[1, 2, 3, 4]);

        let tags = extract_id3_tags(&data, 12345);
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].pts, 12345);
        assert_eq!(tags[0].tag.len(), 14);
    }
}
