//! Elementary stream framing: AVCC/HVCC (length-prefixed) and Annex B
//! (start-code-delimited) H.264/HEVC bitstreams.

use bytes::{Bytes, BytesMut};

use crate::packet::{Sample, SampleFlags};
use crate::transform::Codec;

/// Annex B start code (4-byte)
const START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

/// Size of the fixed HEVCDecoderConfigurationRecord header, up to and
/// including `numOfArrays`.
const HVCC_HEADER_SIZE: usize = 23;

/// Smallest AVCDecoderConfigurationRecord holding one SPS length.
const AVCC_MIN_SIZE: usize = 7;

/// Offset of `numOfSequenceParameterSets` in an AVCDecoderConfigurationRecord.
const AVCC_SPS_COUNT_OFFSET: usize = 5;

fn starts_with_start_code(data: &[u8]) -> bool {
    data.starts_with(&[0x00, 0x00, 0x00, 0x01]) || data.starts_with(&[0x00, 0x00, 0x01])
}

fn read_u16(data: &[u8], offset: usize) -> Option<usize> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]) as usize)
}

fn read_u32(data: &[u8], offset: usize) -> Option<usize> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
}

/// Whether `data` is length-prefixed (AVCC/HVCC) rather than Annex B.
///
/// Configuration records start with a version byte of 1, which can never look
/// like a start code. For samples, `00 00 01 xx` is ambiguous: it is either a
/// 3-byte start code or a 4-byte length between 256 and 511. It is taken as a
/// length when `0 < length <= data.len() - 4`.
///
/// Buffers shorter than 4 bytes are neither.
pub fn is_avcc(data: &[u8], is_config_record: bool) -> bool {
    if data.len() < 4 {
        return false;
    }

    if is_config_record {
        return !starts_with_start_code(data);
    }

    if data.starts_with(&[0x00, 0x00, 0x00, 0x01]) {
        return false;
    }

    if data.starts_with(&[0x00, 0x00, 0x01]) {
        return read_u32(data, 0).is_some_and(|length| length > 0 && length <= data.len() - 4);
    }

    true
}

/// Converts AVCC/HVCC data to Annex B.
///
/// Samples: every 4-byte big-endian length is replaced by a start code;
/// conversion stops at the first zero or overlong length and the rest is
/// dropped. Configuration records: the parameter sets are extracted, `codec`
/// selects the record layout.
///
/// Returns `None` if no NAL unit could be produced.
pub fn convert_avcc_to_annexb(data: &[u8], is_config_record: bool, codec: Codec) -> Option<Bytes> {
    if data.len() < 4 {
        return None;
    }

    let mut out = BytesMut::with_capacity(data.len() + 16);
    let units = match (is_config_record, codec) {
        (false, _) => convert_length_prefixed(data, &mut out),
        (true, Codec::Hevc) => convert_hvcc_record(data, &mut out),
        (true, Codec::H264) => convert_avcc_record(data, &mut out),
    };

    (units > 0).then(|| out.freeze())
}

fn emit(out: &mut BytesMut, nal: &[u8]) {
    out.extend_from_slice(START_CODE);
    out.extend_from_slice(nal);
}

fn convert_length_prefixed(data: &[u8], out: &mut BytesMut) -> usize {
    let mut units = 0;
    let mut offset = 0;
    while let Some(length) = read_u32(data, offset) {
        offset += 4;
        if length == 0 || length > data.len() - offset {
            break;
        }
        emit(out, &data[offset..offset + length]);
        offset += length;
        units += 1;
    }
    units
}

/// Emits `count` 2-byte-length-prefixed NAL units starting at `*offset`.
/// Returns false on the first bounds violation.
fn convert_parameter_sets(
    data: &[u8],
    offset: &mut usize,
    count: usize,
    out: &mut BytesMut,
    units: &mut usize,
) -> bool {
    for _ in 0..count {
        let Some(length) = read_u16(data, *offset) else {
            return false;
        };
        *offset += 2;
        let Some(nal) = data.get(*offset..*offset + length) else {
            return false;
        };
        emit(out, nal);
        *offset += length;
        *units += 1;
    }
    true
}

fn convert_avcc_record(data: &[u8], out: &mut BytesMut) -> usize {
    if data.len() < AVCC_MIN_SIZE {
        return 0;
    }

    let mut units = 0;
    let mut offset = AVCC_SPS_COUNT_OFFSET;
    let sps_count = (data[offset] & 0x1F) as usize;
    offset += 1;

    if !convert_parameter_sets(data, &mut offset, sps_count, out, &mut units) {
        return units;
    }

    if let Some(&pps_count) = data.get(offset) {
        offset += 1;
        convert_parameter_sets(data, &mut offset, pps_count as usize, out, &mut units);
    }

    units
}

fn convert_hvcc_record(data: &[u8], out: &mut BytesMut) -> usize {
    if data.len() < HVCC_HEADER_SIZE {
        return 0;
    }

    let mut units = 0;
    let array_count = data[HVCC_HEADER_SIZE - 1];
    let mut offset = HVCC_HEADER_SIZE;

    for _ in 0..array_count {
        // array_completeness / reserved / NAL_unit_type
        offset += 1;
        let Some(nal_count) = read_u16(data, offset) else {
            break;
        };
        offset += 2;
        if !convert_parameter_sets(data, &mut offset, nal_count, out, &mut units) {
            break;
        }
    }

    units
}

/// Iterator over the NAL units of an Annex B buffer, without start codes.
pub struct AnnexBNalUnits<'a> {
    data: &'a [u8],
    position: usize,
}

/// Splits an Annex B buffer at its 3- and 4-byte start codes.
/// Bytes before the first start code are skipped.
pub fn split_annexb(data: &[u8]) -> AnnexBNalUnits<'_> {
    let position = find_start_code(data, 0).map_or(data.len(), |(_, payload)| payload);
    AnnexBNalUnits { data, position }
}

/// Finds the next start code at or after `from`.
/// Returns (index of the first start code byte, index of the payload).
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, i + 3));
            }
            if data[i + 2] == 0 && data.get(i + 3) == Some(&1) {
                return Some((i, i + 4));
            }
        }
        i += 1;
    }
    None
}

impl<'a> Iterator for AnnexBNalUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.position >= self.data.len() {
            return None;
        }
        let start = self.position;
        let (end, next) = find_start_code(self.data, start)
            .unwrap_or((self.data.len(), self.data.len()));
        self.position = next;

        // trailing_zero_8bits belong to neither unit
        let mut end = end;
        while end > start && self.data[end - 1] == 0 && next < self.data.len() {
            end -= 1;
        }
        Some(&self.data[start..end])
    }
}

/// NAL unit type from the unit header.
pub fn nal_unit_type(codec: Codec, nal: &[u8]) -> Option<u8> {
    let header = *nal.first()?;
    match codec {
        Codec::H264 => Some(header & 0x1F),
        Codec::Hevc => Some((header >> 1) & 0x3F),
    }
}

/// SPS/PPS for H.264, VPS/SPS/PPS for HEVC.
pub fn is_parameter_set(codec: Codec, nal: &[u8]) -> bool {
    match (codec, nal_unit_type(codec, nal)) {
        (Codec::H264, Some(7 | 8)) => true,
        (Codec::Hevc, Some(32..=34)) => true,
        _ => false,
    }
}

/// Normalizes the samples of one stream to Annex B.
///
/// Configuration records and length-prefixed samples are converted, Annex B
/// input is passed through untouched.
pub struct AnnexBFilter {
    codec: Codec,
}

impl AnnexBFilter {
    pub fn new(codec: Codec) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Converts one sample. Samples that cannot be converted come back empty.
    pub fn filter_sample(&mut self, sample: &Sample) -> Sample {
        let data = self.filter_data(sample.data(), sample.is_configuration());
        Sample::new(data, sample.presentation_time(), sample.flags())
    }

    pub fn filter_data(&mut self, data: &Bytes, is_config_record: bool) -> Bytes {
        if data.is_empty() || !is_avcc(data, is_config_record) {
            return data.clone();
        }
        match convert_avcc_to_annexb(data, is_config_record, self.codec) {
            Some(converted) => converted,
            None => {
                log::warn!(
                    "dropping {} byte {} that could not be converted to annex b",
                    data.len(),
                    if is_config_record { "configuration record" } else { "sample" }
                );
                Bytes::new()
            }
        }
    }
}

/// Sample flags for an Annex B access unit, derived from its NAL unit types.
pub fn annexb_flags(codec: Codec, data: &[u8]) -> SampleFlags {
    let mut flags = SampleFlags::NONE;
    let mut only_parameter_sets = true;
    for nal in split_annexb(data) {
        let key = match (codec, nal_unit_type(codec, nal)) {
            (Codec::H264, Some(5)) => true,
            (Codec::Hevc, Some(16..=21)) => true,
            _ => false,
        };
        if key {
            flags |= SampleFlags::KEY_FRAME;
        }
        if !is_parameter_set(codec, nal) {
            only_parameter_sets = false;
        }
    }
    if only_parameter_sets && !data.is_empty() {
        flags |= SampleFlags::CODEC_CONFIG;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avcc(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in units {
            out.extend_from_slice(&(unit.len() as u32).to_be_bytes());
            out.extend_from_slice(unit);
        }
        out
    }

    fn parse_avcc(data: &[u8]) -> Vec<&[u8]> {
        let mut units = Vec::new();
        let mut offset = 0;
        while offset + 4 <= data.len() {
            let length = read_u32(data, offset).unwrap();
            offset += 4;
            units.push(&data[offset..offset + length]);
            offset += length;
        }
        units
    }

    #[test]
    fn test_is_avcc_four_byte_start_code() {
        assert!(!is_avcc(&[0x00, 0x00, 0x00, 0x01, 0x67, 0x42], false));
        assert!(!is_avcc(&[0x00, 0x00, 0x00, 0x01, 0x67, 0x42], true));
    }

    #[test]
    fn test_is_avcc_other_prefix_defaults_to_avcc() {
        assert!(is_avcc(&[0x00, 0x00, 0x02, 0x10], false));
        assert!(is_avcc(&[0x01, 0x64, 0x00, 0x1F, 0xFF], true));
    }

    #[test]
    fn test_is_avcc_three_byte_ambiguity() {
        // length 0x0100 = 256 with exactly 256 bytes following: length prefix
        let mut data = vec![0x00, 0x00, 0x01, 0x00];
        data.extend(std::iter::repeat_n(0x41, 256));
        assert!(is_avcc(&data, false));

        // one byte short: start code
        data.pop();
        assert!(!is_avcc(&data, false));

        // configuration records never treat 00 00 01 as a length
        assert!(!is_avcc(&[0x00, 0x00, 0x01, 0x67], true));
    }

    #[test]
    fn test_is_avcc_short_input() {
        assert!(!is_avcc(&[0x00, 0x00, 0x01], false));
        assert!(!is_avcc(&[], true));
    }

    #[test]
    fn test_avcc_to_annexb() {
        let avcc = [0, 0, 0, 4, 0x65, 0x88, 0x81, 0x00];
        let out = convert_avcc_to_annexb(&avcc, false, Codec::H264).unwrap();
        assert_eq!(
            &out[..],
            &[0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x81, 0x00][..]
        );
    }

    #[test]
    fn test_avcc_to_annexb_drops_partial_tail() {
        let mut data = avcc(&[&[0x67, 0x01], &[0x68, 0x02, 0x03]]);
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x09, 0x65]);
        let out = convert_avcc_to_annexb(&data, false, Codec::H264).unwrap();
        assert_eq!(
            &out[..],
            &[0, 0, 0, 1, 0x67, 0x01, 0, 0, 0, 1, 0x68, 0x02, 0x03][..]
        );
    }

    #[test]
    fn test_avcc_to_annexb_fails_without_units() {
        assert!(convert_avcc_to_annexb(&[0, 0, 0, 0, 0x65], false, Codec::H264).is_none());
        assert!(convert_avcc_to_annexb(&[0, 0, 0, 9, 0x65], false, Codec::H264).is_none());
        assert!(convert_avcc_to_annexb(&[0, 0, 4], false, Codec::H264).is_none());
    }

    #[test]
    fn test_avc_config_record() {
        let sps = [0x67, 0x42, 0xC0, 0x1E];
        let pps = [0x68, 0xCE, 0x3C, 0x80];
        let mut record = vec![0x01, 0x42, 0xC0, 0x1E, 0xFF, 0xE1];
        record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        record.extend_from_slice(&sps);
        record.push(0x01);
        record.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        record.extend_from_slice(&pps);

        assert!(is_avcc(&record, true));
        let out = convert_avcc_to_annexb(&record, true, Codec::H264).unwrap();
        let units: Vec<&[u8]> = split_annexb(&out).collect();
        assert_eq!(units, vec![&sps[..], &pps[..]]);
        assert_eq!(annexb_flags(Codec::H264, &out), SampleFlags::CODEC_CONFIG);
    }

    #[test]
    fn test_avc_config_record_truncated_pps() {
        let sps = [0x67, 0x42];
        let mut record = vec![0x01, 0x42, 0xC0, 0x1E, 0xFF, 0xE1];
        record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        record.extend_from_slice(&sps);
        // one PPS announced, length runs past the end
        record.extend_from_slice(&[0x01, 0x00, 0x10, 0x68]);

        let out = convert_avcc_to_annexb(&record, true, Codec::H264).unwrap();
        assert_eq!(&out[..], &[0, 0, 0, 1, 0x67, 0x42][..]);
    }

    #[test]
    fn test_avc_config_record_too_short() {
        assert!(convert_avcc_to_annexb(&[0x01, 0x42, 0xC0, 0x1E, 0xFF, 0xE1], true, Codec::H264).is_none());
    }

    #[test]
    fn test_hevc_config_record() {
        let vps = [0x40, 0x01, 0x0C];
        let sps = [0x42, 0x01, 0x01, 0x60];
        let pps = [0x44, 0x01, 0xC1];
        let mut record = vec![0x01];
        record.extend(std::iter::repeat_n(0x00, 21));
        record.push(3);
        for (nal_type, nal) in [(32u8, &vps[..]), (33, &sps[..]), (34, &pps[..])] {
            record.push(0x80 | nal_type);
            record.extend_from_slice(&1u16.to_be_bytes());
            record.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            record.extend_from_slice(nal);
        }

        let out = convert_avcc_to_annexb(&record, true, Codec::Hevc).unwrap();
        let units: Vec<&[u8]> = split_annexb(&out).collect();
        assert_eq!(units, vec![&vps[..], &sps[..], &pps[..]]);
        assert!(units.iter().all(|nal| is_parameter_set(Codec::Hevc, nal)));
    }

    #[test]
    fn test_hevc_config_record_bounds() {
        let mut record = vec![0x01];
        record.extend(std::iter::repeat_n(0x00, 21));
        record.push(2);
        record.extend_from_slice(&[0xA0, 0x00, 0x01, 0x00, 0x02, 0x40, 0x01]);
        // second array announces a NAL unit longer than the record
        record.extend_from_slice(&[0xA1, 0x00, 0x01, 0x00, 0x20, 0x42]);

        let out = convert_avcc_to_annexb(&record, true, Codec::Hevc).unwrap();
        assert_eq!(&out[..], &[0, 0, 0, 1, 0x40, 0x01][..]);

        assert!(convert_avcc_to_annexb(&record[..22], true, Codec::Hevc).is_none());
    }

    #[test]
    fn test_round_trip_matches_direct_parse() {
        let long = vec![0x41u8; 300];
        let source = avcc(&[&[0x67, 0x64, 0x1F], &[0x68, 0xEE], &long, &[0x65, 0x00, 0x00, 0x03, 0x80]]);
        let out = convert_avcc_to_annexb(&source, false, Codec::H264).unwrap();
        let rescanned: Vec<&[u8]> = split_annexb(&out).collect();
        assert_eq!(rescanned, parse_avcc(&source));
    }

    #[test]
    fn test_detection_consistent_with_conversion() {
        // 256-byte unit: the length prefix reads 00 00 01 00
        let unit = vec![0x65u8; 256];
        let source = avcc(&[&unit]);
        assert!(convert_avcc_to_annexb(&source, false, Codec::H264).is_some());
        assert!(is_avcc(&source, false));

        let annexb = [0x00, 0x00, 0x01, 0x65, 0x88, 0x00, 0x00, 0x01, 0x41];
        assert!(!is_avcc(&annexb, false));
        let units: Vec<&[u8]> = split_annexb(&annexb).collect();
        assert_eq!(units, vec![&[0x65, 0x88][..], &[0x41][..]]);
    }

    #[test]
    fn test_filter_passes_annexb_through() {
        let mut filter = AnnexBFilter::new(Codec::H264);
        let annexb = Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x11]);
        assert_eq!(filter.filter_data(&annexb, false), annexb);

        let sample = Sample::new(avcc(&[&[0x65, 0x11]]), 40, SampleFlags::KEY_FRAME);
        let filtered = filter.filter_sample(&sample);
        assert_eq!(&filtered.data()[..], &annexb[..]);
        assert!(filtered.is_key_frame());
        assert_eq!(filtered.presentation_time(), 40);
    }

    #[test]
    fn test_annexb_flags() {
        let idr = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x65, 0x88];
        assert_eq!(annexb_flags(Codec::H264, &idr), SampleFlags::KEY_FRAME);
        let non_idr = [0, 0, 1, 0x41, 0x9A];
        assert_eq!(annexb_flags(Codec::H264, &non_idr), SampleFlags::NONE);
        let hevc_idr = [0, 0, 0, 1, 0x26, 0x01, 0xAF];
        assert_eq!(annexb_flags(Codec::Hevc, &hevc_idr), SampleFlags::KEY_FRAME);
    }
}
