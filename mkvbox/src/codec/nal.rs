//! H.264/H.265 NAL unit plumbing: configuration-record walking, framing
//! conversion between length prefixes and Annex B start codes.

use h264_reader::nal::sps::SeqParameterSet;
use h264_reader::rbsp::{decode_nal, BitReader};

use crate::codec::{Frame, Packetizer, PacketizerCommon};
use crate::error::{Error, Result};
use crate::io::get_u16_be;
use crate::media::{codec_ids, Track, VideoParams};
use crate::span::Span;

pub const FOUR_BYTE_STARTCODE: [u8; 4] = [0, 0, 0, 1];

/// Describes how NAL units are framed in a bitstream.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BitstreamFraming {
    /// Length-prefixed with `n` bytes per prefix (1..=4), the in-Matroska
    /// and MP4 form.
    LengthPrefix(u8),
    /// `00 00 00 01` start codes, the elementary-stream form.
    FourByteStartCode,
}

/// Splits a length-prefixed bitstream into NAL units.
pub fn split_length_prefixed(data: &Span, prefix_len: u8) -> Result<Vec<Span>> {
    let raw = data.to_slice();
    let n = prefix_len as usize;
    let mut units = Vec::new();
    let mut pos = 0usize;

    while pos + n <= raw.len() {
        let mut len = 0usize;
        for &byte in &raw[pos..pos + n] {
            len = (len << 8) | byte as usize;
        }
        pos += n;

        if pos + len > raw.len() {
            return Err(Error::Unsupported(format!(
                "NAL unit of {len} bytes overruns its frame"
            )));
        }
        units.push(data.slice(pos..pos + len));
        pos += len;
    }

    Ok(units)
}

/// Splits an Annex B bitstream (3- or 4-byte start codes) into NAL units.
pub fn split_start_codes(data: &Span) -> Vec<Span> {
    let raw = data.to_slice();
    let mut starts = Vec::new();
    let mut i = 0usize;

    while i + 3 <= raw.len() {
        if raw[i] == 0 && raw[i + 1] == 0 {
            if raw[i + 2] == 1 {
                starts.push((i, i + 3));
                i += 3;
                continue;
            }
            if i + 4 <= raw.len() && raw[i + 2] == 0 && raw[i + 3] == 1 {
                starts.push((i, i + 4));
                i += 4;
                continue;
            }
        }
        i += 1;
    }

    let mut units = Vec::new();
    for (index, &(_, begin)) in starts.iter().enumerate() {
        let end = starts
            .get(index + 1)
            .map(|&(next_start, _)| next_start)
            .unwrap_or(raw.len());
        if begin < end {
            units.push(data.slice(begin..end));
        }
    }
    units
}

/// Frames NAL units with the requested prefix form.
pub fn frame_nal_units(units: &[Span], target: BitstreamFraming) -> Span {
    let mut pieces = Vec::new();
    for unit in units {
        match target {
            BitstreamFraming::FourByteStartCode => {
                pieces.push(Span::from(&FOUR_BYTE_STARTCODE[..]));
            }
            BitstreamFraming::LengthPrefix(n) => {
                let bytes = (unit.len() as u32).to_be_bytes();
                pieces.push(Span::from(bytes[4 - n as usize..].to_vec()));
            }
        }
        pieces.push(unit.clone());
    }
    pieces.into_iter().collect()
}

pub fn nal_unit_type(unit: &Span) -> Option<u8> {
    unit.spans().next().and_then(|s| s.first()).map(|b| b & 0x1f)
}

pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_AUD: u8 = 9;

/// Pixel dimensions from a raw SPS NAL unit (with its header byte).
pub fn sps_dimensions(sps: &[u8]) -> Option<(u32, u32)> {
    if sps.len() < 2 {
        return None;
    }
    let rbsp = decode_nal(&sps[1..]).ok()?;
    let parsed = SeqParameterSet::from_bits(BitReader::new(&rbsp[..])).ok()?;
    parsed.pixel_dimensions().ok()
}

/// A parsed AVCDecoderConfigurationRecord.
#[derive(Debug, Clone, PartialEq)]
pub struct AvcConfig {
    pub profile: u8,
    pub profile_compat: u8,
    pub level: u8,
    /// Bytes per NAL length prefix (1..=4).
    pub nal_size_size: u8,
    pub sps: Vec<Span>,
    pub pps: Vec<Span>,
}

impl AvcConfig {
    pub fn parse(data: &Span) -> Result<AvcConfig> {
        let raw = data.to_slice();
        if raw.len() < 7 {
            return Err(Error::Unsupported("AVC codec private is too small".into()));
        }

        let nal_size_size = 1 + (raw[4] & 3);
        let mut pos = 6usize;
        let num_sps = (raw[5] & 0x1f) as usize;

        let mut read_sets = |count: usize, pos: &mut usize| -> Result<Vec<Span>> {
            let mut sets = Vec::with_capacity(count);
            for _ in 0..count {
                if *pos + 2 > raw.len() {
                    return Err(Error::Unsupported("truncated AVC config record".into()));
                }
                let len = get_u16_be(&raw[*pos..]) as usize;
                *pos += 2;
                if *pos + len > raw.len() {
                    return Err(Error::Unsupported("truncated AVC parameter set".into()));
                }
                sets.push(data.slice(*pos..*pos + len));
                *pos += len;
            }
            Ok(sets)
        };

        let sps = read_sets(num_sps, &mut pos)?;

        if pos >= raw.len() {
            return Err(Error::Unsupported("AVC config record without PPS".into()));
        }
        let num_pps = raw[pos] as usize;
        pos += 1;
        let pps = read_sets(num_pps, &mut pos)?;

        Ok(AvcConfig {
            profile: raw[1],
            profile_compat: raw[2],
            level: raw[3],
            nal_size_size,
            sps,
            pps,
        })
    }

    /// Assembles the configuration record, the codec private data for an
    /// AVC track built from an elementary stream.
    pub fn build(&self) -> Span {
        let head = vec![
            1,
            self.profile,
            self.profile_compat,
            self.level,
            0xfc | (self.nal_size_size - 1),
            0xe0 | self.sps.len() as u8,
        ];

        let mut pieces = vec![Span::from(head)];
        for sps in &self.sps {
            pieces.push(Span::from((sps.len() as u16).to_be_bytes().to_vec()));
            pieces.push(sps.clone());
        }
        pieces.push(Span::from(vec![self.pps.len() as u8]));
        for pps in &self.pps {
            pieces.push(Span::from((pps.len() as u16).to_be_bytes().to_vec()));
            pieces.push(pps.clone());
        }
        pieces.into_iter().collect()
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        let sps = self.sps.first()?.to_slice().to_vec();
        sps_dimensions(&sps)
    }
}

/// The subset of an HEVCDecoderConfigurationRecord the extract path needs:
/// the length-prefix width and the parameter-set NAL units.
#[derive(Debug, Clone, PartialEq)]
pub struct HevcConfig {
    pub nal_size_size: u8,
    pub parameter_sets: Vec<Span>,
}

impl HevcConfig {
    pub fn parse(data: &Span) -> Result<HevcConfig> {
        let raw = data.to_slice();
        if raw.len() < 23 {
            return Err(Error::Unsupported("HEVC codec private is too small".into()));
        }

        let nal_size_size = 1 + (raw[21] & 3);
        let num_arrays = raw[22] as usize;
        let mut pos = 23usize;
        let mut parameter_sets = Vec::new();

        for _ in 0..num_arrays {
            if pos + 3 > raw.len() {
                return Err(Error::Unsupported("truncated HEVC config record".into()));
            }
            let count = get_u16_be(&raw[pos + 1..]) as usize;
            pos += 3;

            for _ in 0..count {
                if pos + 2 > raw.len() {
                    return Err(Error::Unsupported("truncated HEVC parameter array".into()));
                }
                let len = get_u16_be(&raw[pos..]) as usize;
                pos += 2;
                if pos + len > raw.len() {
                    return Err(Error::Unsupported("truncated HEVC parameter set".into()));
                }
                parameter_sets.push(data.slice(pos..pos + len));
                pos += len;
            }
        }

        Ok(HevcConfig {
            nal_size_size,
            parameter_sets,
        })
    }
}

/// Pass-through packetizer for AVC tracks; lifts the stream geometry out of
/// the configuration record when the reader could not provide it.
pub struct AvcPacketizer {
    common: PacketizerCommon,
    config: AvcConfig,
    last_timecode: i64,
}

impl AvcPacketizer {
    pub fn new(mut track: Track, config: AvcConfig) -> AvcPacketizer {
        if track.video.is_none() {
            if let Some((width, height)) = config.dimensions() {
                track.video = Some(VideoParams {
                    pixel_width: width as u64,
                    pixel_height: height as u64,
                    ..VideoParams::default()
                });
            }
        }
        track.codec_private = Some(config.build());

        AvcPacketizer {
            common: PacketizerCommon::new(track),
            config,
            last_timecode: -1,
        }
    }

    pub fn nal_size_size(&self) -> u8 {
        self.config.nal_size_size
    }
}

impl Packetizer for AvcPacketizer {
    fn common(&self) -> &PacketizerCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut PacketizerCommon {
        &mut self.common
    }

    fn set_headers(&mut self) -> Result<()> {
        self.common.track.codec_id = codec_ids::V_MPEG4_AVC.into();
        self.common.track.flag_lacing = false;
        Ok(())
    }

    fn process(&mut self, mut frame: Frame) -> Result<()> {
        if frame.timecode == -1 {
            return Err(Error::Unsupported(
                "AVC frames need timecodes from their container".into(),
            ));
        }
        if frame.duration.is_none() {
            frame.duration = self.common.track.default_duration.map(|d| d as i64);
        }
        if frame.keyframe == Some(false) && frame.bref == 0 && self.last_timecode >= 0 {
            frame.bref = self.last_timecode;
        }
        self.last_timecode = frame.timecode;
        self.common.add_packet(frame)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    fn sample_config() -> AvcConfig {
        AvcConfig {
            profile: 100,
            profile_compat: 0,
            level: 31,
            nal_size_size: 4,
            sps: vec![Span::from(vec![0x67, 0x64, 0x00, 0x1f])],
            pps: vec![Span::from(vec![0x68, 0xee, 0x3c, 0x80])],
        }
    }

    #[test]
    fn avcc_build_parse_round_trip() {
        let config = sample_config();
        let built = config.build();
        let parsed = AvcConfig::parse(&built).unwrap();

        assert_eq!(parsed, config);
        assert_eq!(parsed.nal_size_size, 4);
    }

    #[test_case(4)]
    #[test_case(2)]
    #[test_case(1)]
    fn length_prefix_round_trip(prefix: u8) {
        let units = vec![
            Span::from(vec![0x65, 1, 2, 3]),
            Span::from(vec![0x41, 9]),
        ];

        let framed = frame_nal_units(&units, BitstreamFraming::LengthPrefix(prefix));
        let back = split_length_prefixed(&framed, prefix).unwrap();

        assert_eq!(back, units);
    }

    #[test]
    fn start_code_split_handles_both_lengths() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&[0, 0, 0, 1, 0x67, 0xaa]);
        stream.extend_from_slice(&[0, 0, 1, 0x68, 0xbb]);
        stream.extend_from_slice(&[0, 0, 0, 1, 0x65, 0xcc, 0xdd]);

        let units = split_start_codes(&Span::from(stream));

        assert_eq!(units.len(), 3);
        assert_eq!(units[0].to_bytes(), [0x67, 0xaa]);
        assert_eq!(units[1].to_bytes(), [0x68, 0xbb]);
        assert_eq!(units[2].to_bytes(), [0x65, 0xcc, 0xdd]);
        assert_eq!(nal_unit_type(&units[2]), Some(NAL_IDR));
    }

    #[test]
    fn length_to_start_code_conversion() {
        let units = vec![Span::from(vec![0x65, 1])];
        let prefixed = frame_nal_units(&units, BitstreamFraming::LengthPrefix(4));

        let split = split_length_prefixed(&prefixed, 4).unwrap();
        let annexb = frame_nal_units(&split, BitstreamFraming::FourByteStartCode);

        assert_eq!(annexb.to_bytes(), [0, 0, 0, 1, 0x65, 1]);
    }

    #[test]
    fn oversized_nal_is_an_error() {
        let data = Span::from(vec![0, 0, 0, 200, 1, 2, 3]);
        assert!(split_length_prefixed(&data, 4).is_err());
    }

    #[test]
    fn hevc_config_collects_parameter_sets() {
        let mut raw = vec![0u8; 21];
        raw[0] = 1;
        raw.push(0xfc | 3); // nal size 4
        raw.push(2); // two arrays

        // VPS array with one 3-byte set.
        raw.push(0x20 | 32);
        raw.extend_from_slice(&1u16.to_be_bytes());
        raw.extend_from_slice(&3u16.to_be_bytes());
        raw.extend_from_slice(&[0x40, 1, 2]);

        // SPS array with one 2-byte set.
        raw.push(0x20 | 33);
        raw.extend_from_slice(&1u16.to_be_bytes());
        raw.extend_from_slice(&2u16.to_be_bytes());
        raw.extend_from_slice(&[0x42, 1]);

        let config = HevcConfig::parse(&Span::from(raw)).unwrap();
        assert_eq!(config.nal_size_size, 4);
        assert_eq!(config.parameter_sets.len(), 2);
        assert_eq!(config.parameter_sets[0].to_bytes(), [0x40, 1, 2]);
    }
}
