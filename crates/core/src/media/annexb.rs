//! Annex B byte-stream scanning.
//!
//! The device consumes whole access units, start codes included, so the
//! file source needs to know where one access unit ends and the next
//! begins. Boundaries follow H.264 §7.4.1.2.3: once the current access unit
//! holds a VCL NAL, any of the following opens a new one:
//!
//! - an access unit delimiter (type 9),
//! - SEI, SPS or PPS (types 6, 7, 8) and the reserved types 14–18,
//! - a slice (types 1–5) whose `first_mb_in_slice` is 0.
//!
//! An access unit delimiter also closes a preceding access unit that holds
//! only non-VCL NALs.

use std::ops::Range;

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

/// Location of one NAL unit inside an Annex B buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalSpan {
    /// Offset of the start code that introduces this NAL.
    pub start_code: usize,
    /// Offset of the NAL header byte.
    pub payload: usize,
    /// One past the last NAL byte.
    pub end: usize,
}

impl NalSpan {
    pub fn bytes<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.payload..self.end]
    }
}

/// NAL unit type from the first header byte.
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1f)
}

fn is_vcl(nal_type: u8) -> bool {
    (NAL_SLICE..=NAL_IDR).contains(&nal_type)
}

/// `first_mb_in_slice` is the first ue(v) of the slice header; it is zero
/// exactly when its leading bit is set.
fn starts_new_picture(nal: &[u8]) -> bool {
    nal.get(1).is_some_and(|b| b & 0x80 != 0)
}

/// Scan for NAL units delimited by 4-byte `00 00 00 01` or 3-byte
/// `00 00 01` start codes. Bytes before the first start code are ignored,
/// as are empty NALs.
pub fn scan_nal_units(data: &[u8]) -> Vec<NalSpan> {
    let mut i = 0usize;

    // (start_code_offset, start_code_length)
    let mut start_entries: Vec<(usize, usize)> = Vec::new();

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            start_entries.push((i, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            start_entries.push((i, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut spans = Vec::with_capacity(start_entries.len());
    for (idx, &(start_code, sc_len)) in start_entries.iter().enumerate() {
        let end = start_entries
            .get(idx + 1)
            .map_or(data.len(), |&(next, _)| next);
        let payload = start_code + sc_len;
        if payload < end {
            spans.push(NalSpan {
                start_code,
                payload,
                end,
            });
        }
    }
    spans
}

/// Byte ranges of the access units in an Annex B buffer, start codes
/// included. Concatenating the ranges reproduces the buffer from its
/// first start code onward.
pub fn split_access_units(data: &[u8]) -> Vec<Range<usize>> {
    let spans = scan_nal_units(data);
    let mut units = Vec::new();

    let mut current_start: Option<usize> = None;
    let mut has_vcl = false;

    for span in &spans {
        let nal = span.bytes(data);
        let Some(ty) = nal_type(nal) else { continue };

        let boundary = match current_start {
            None => false,
            Some(_) if ty == NAL_AUD => true,
            Some(_) if !has_vcl => false,
            Some(_) => {
                matches!(ty, NAL_SEI | NAL_SPS | NAL_PPS | 14..=18)
                    || (is_vcl(ty) && starts_new_picture(nal))
            }
        };

        if boundary {
            if let Some(start) = current_start {
                units.push(start..span.start_code);
            }
            current_start = None;
            has_vcl = false;
        }

        current_start.get_or_insert(span.start_code);
        has_vcl |= is_vcl(ty);
    }

    if let Some(start) = current_start {
        units.push(start..data.len());
    }

    tracing::trace!(
        nal_count = spans.len(),
        access_units = units.len(),
        stream_bytes = data.len(),
        "annex b stream split"
    );

    units
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e];
    const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80];
    const IDR: &[u8] = &[0, 0, 0, 1, 0x65, 0x88, 0x84];
    const P_SLICE: &[u8] = &[0, 0, 0, 1, 0x41, 0x9a, 0x02];
    // first_mb_in_slice != 0: leading bit clear
    const P_SLICE_CONT: &[u8] = &[0, 0, 1, 0x41, 0x40, 0x11];
    const AUD: &[u8] = &[0, 0, 0, 1, 0x09, 0xf0];

    fn cat(parts: &[&[u8]]) -> Vec<u8> {
        parts.concat()
    }

    // --- NAL scanning ---

    #[test]
    fn scan_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let spans = scan_nal_units(&data);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].bytes(&data), &[0x65, 0xAA, 0xBB]);
        assert_eq!(spans[0].start_code, 0);
    }

    #[test]
    fn scan_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let spans = scan_nal_units(&data);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].bytes(&data), &[0x67, 0x42]);
        assert_eq!(spans[1].bytes(&data), &[0x68, 0xCE]);
        assert_eq!(spans[1].start_code, 6);
    }

    #[test]
    fn scan_ignores_leading_garbage() {
        let data = [0xFF, 0xFE, 0, 0, 1, 0x09, 0xF0];
        let spans = scan_nal_units(&data);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start_code, 2);
    }

    #[test]
    fn scan_empty_and_no_start_code() {
        assert!(scan_nal_units(&[]).is_empty());
        assert!(scan_nal_units(&[0xFF, 0xFE]).is_empty());
    }

    // --- access unit splitting ---

    #[test]
    fn parameter_sets_join_the_following_idr() {
        let data = cat(&[SPS, PPS, IDR, P_SLICE, P_SLICE]);
        let units = split_access_units(&data);
        assert_eq!(units.len(), 3);
        assert_eq!(&data[units[0].clone()], cat(&[SPS, PPS, IDR]).as_slice());
        assert_eq!(&data[units[1].clone()], P_SLICE);
        assert_eq!(&data[units[2].clone()], P_SLICE);
    }

    #[test]
    fn continuation_slice_stays_in_picture() {
        let data = cat(&[P_SLICE, P_SLICE_CONT, P_SLICE]);
        let units = split_access_units(&data);
        assert_eq!(units.len(), 2);
        assert_eq!(&data[units[0].clone()], cat(&[P_SLICE, P_SLICE_CONT]).as_slice());
    }

    #[test]
    fn delimiter_opens_new_unit() {
        let data = cat(&[AUD, SPS, PPS, IDR, AUD, P_SLICE, AUD, P_SLICE]);
        let units = split_access_units(&data);
        assert_eq!(units.len(), 3);
        assert_eq!(&data[units[0].clone()], cat(&[AUD, SPS, PPS, IDR]).as_slice());
        assert_eq!(&data[units[1].clone()], cat(&[AUD, P_SLICE]).as_slice());
    }

    #[test]
    fn second_keyframe_group_splits_at_sps() {
        let data = cat(&[SPS, PPS, IDR, P_SLICE, SPS, PPS, IDR]);
        let units = split_access_units(&data);
        assert_eq!(units.len(), 3);
        assert_eq!(&data[units[2].clone()], cat(&[SPS, PPS, IDR]).as_slice());
    }

    #[test]
    fn units_cover_stream_contiguously() {
        let data = cat(&[SPS, PPS, IDR, P_SLICE, P_SLICE_CONT, AUD, P_SLICE]);
        let units = split_access_units(&data);
        assert_eq!(units.first().unwrap().start, 0);
        assert_eq!(units.last().unwrap().end, data.len());
        for pair in units.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn no_nals_no_units() {
        assert!(split_access_units(&[1, 2, 3]).is_empty());
    }
}
