//! AAC helpers: ADTS header parsing and synthesis, AudioSpecificConfig,
//! and the packetizer that strips ADTS framing for Matroska storage.

use crate::codec::{Frame, Packetizer, PacketizerCommon};
use crate::error::{Error, Result};
use crate::media::{codec_ids, AudioParams, Track};

pub const SAMPLES_PER_FRAME: u64 = 1024;

pub const SAMPLING_FREQUENCIES: [u32; 16] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 0, 0, 0, 0,
];

pub const PROFILE_MAIN: u8 = 0;
pub const PROFILE_LC: u8 = 1;
pub const PROFILE_SSR: u8 = 2;
pub const PROFILE_LTP: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// MPEG-4 when true, MPEG-2 otherwise (the inverted ID bit).
    pub mpeg4: bool,
    pub profile: u8,
    pub sample_rate_index: u8,
    pub channels: u8,
    /// Whole frame including the header.
    pub frame_length: usize,
    pub header_length: usize,
}

impl AdtsHeader {
    pub fn sample_rate(&self) -> u32 {
        SAMPLING_FREQUENCIES[self.sample_rate_index as usize]
    }

    pub fn payload_length(&self) -> usize {
        self.frame_length.saturating_sub(self.header_length)
    }
}

/// Parses an ADTS fixed+variable header at the start of `buf`.
pub fn parse_adts(buf: &[u8]) -> Option<AdtsHeader> {
    if buf.len() < 7 {
        return None;
    }
    if buf[0] != 0xff || buf[1] & 0xf0 != 0xf0 {
        return None;
    }

    let id = (buf[1] >> 3) & 1;
    let layer = (buf[1] >> 1) & 3;
    if layer != 0 {
        return None;
    }
    let protection_absent = buf[1] & 1 != 0;

    let profile = buf[2] >> 6;
    let sample_rate_index = (buf[2] >> 2) & 0x0f;
    if SAMPLING_FREQUENCIES[sample_rate_index as usize] == 0 {
        return None;
    }
    let channels = ((buf[2] & 1) << 2) | (buf[3] >> 6);

    let frame_length =
        ((buf[3] as usize & 3) << 11) | ((buf[4] as usize) << 3) | (buf[5] as usize >> 5);
    if frame_length == 0 {
        return None;
    }

    Some(AdtsHeader {
        mpeg4: id == 0,
        profile,
        sample_rate_index,
        channels: if channels > 6 { 2 } else { channels },
        frame_length,
        header_length: if protection_absent { 7 } else { 9 },
    })
}

/// Builds the 7-byte ADTS header (no CRC) for one raw AAC frame.
pub fn build_adts_header(
    mpeg4: bool,
    profile: u8,
    sample_rate_index: u8,
    channels: u8,
    payload_length: usize,
) -> [u8; 7] {
    let frame_length = payload_length + 7;
    let mut header = [0u8; 7];

    header[0] = 0xff;
    header[1] = 0xf0 | ((!mpeg4 as u8) << 3) | 1; // layer 0, no CRC
    header[2] = (profile << 6) | (sample_rate_index << 2) | (channels >> 2);
    header[3] = ((channels & 3) << 6) | ((frame_length >> 11) as u8 & 3);
    header[4] = (frame_length >> 3) as u8;
    header[5] = ((frame_length as u8 & 7) << 5) | 0x1f;
    header[6] = 0xfc;

    header
}

/// The two-byte AudioSpecificConfig stored as codec private data.
pub fn audio_specific_config(profile: u8, sample_rate_index: u8, channels: u8) -> [u8; 2] {
    let object_type = profile as u16 + 1;
    let config =
        (object_type << 11) | ((sample_rate_index as u16) << 7) | ((channels as u16) << 3);
    config.to_be_bytes()
}

pub fn codec_id(mpeg4: bool, profile: u8) -> String {
    let prefix = if mpeg4 {
        codec_ids::A_AAC_MPEG4_PREFIX
    } else {
        codec_ids::A_AAC_MPEG2_PREFIX
    };
    let suffix = match profile {
        PROFILE_MAIN => "MAIN",
        PROFILE_SSR => "SSR",
        PROFILE_LTP => "LTP",
        _ => "LC",
    };
    format!("{prefix}{suffix}")
}

/// Inverse of [`codec_id`], used on extraction to pick the ADTS version bit.
pub fn parse_codec_id(id: &str) -> Option<(bool, u8)> {
    let (mpeg4, suffix) = if let Some(rest) = id.strip_prefix(codec_ids::A_AAC_MPEG4_PREFIX) {
        (true, rest)
    } else if let Some(rest) = id.strip_prefix(codec_ids::A_AAC_MPEG2_PREFIX) {
        (false, rest)
    } else {
        return None;
    };

    let profile = match suffix {
        "MAIN" => PROFILE_MAIN,
        "LC" | "SBR" => PROFILE_LC,
        "SSR" => PROFILE_SSR,
        "LTP" => PROFILE_LTP,
        _ => return None,
    };
    Some((mpeg4, profile))
}

pub fn sample_rate_index(sample_rate: u32) -> Option<u8> {
    SAMPLING_FREQUENCIES
        .iter()
        .position(|&rate| rate == sample_rate)
        .map(|i| i as u8)
}

pub struct AacPacketizer {
    common: PacketizerCommon,
    header: AdtsHeader,
    frames_output: u64,
}

impl AacPacketizer {
    pub fn new(mut track: Track, header: AdtsHeader) -> AacPacketizer {
        if track.audio.is_none() {
            track.audio = Some(AudioParams {
                sample_rate: header.sample_rate() as f64,
                channels: header.channels as u64,
                bit_depth: None,
            });
        }
        AacPacketizer {
            common: PacketizerCommon::new(track),
            header,
            frames_output: 0,
        }
    }
}

impl Packetizer for AacPacketizer {
    fn common(&self) -> &PacketizerCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut PacketizerCommon {
        &mut self.common
    }

    fn set_headers(&mut self) -> Result<()> {
        let header = self.header;
        self.common.track.codec_id = codec_id(header.mpeg4, header.profile);
        self.common.track.codec_private = Some(
            audio_specific_config(header.profile, header.sample_rate_index, header.channels)
                .to_vec()
                .into(),
        );

        let rate = header.sample_rate() as f64;
        if rate <= 0.0 {
            return Err(Error::Unsupported("AAC with reserved sampling frequency".into()));
        }
        self.common.track.default_duration =
            Some((SAMPLES_PER_FRAME as f64 * 1_000_000_000.0 / rate) as u64);
        Ok(())
    }

    fn process(&mut self, mut frame: Frame) -> Result<()> {
        // Readers may deliver whole ADTS frames; Matroska stores raw blocks.
        {
            let raw = frame.data.to_slice();
            if let Some(adts) = parse_adts(&raw) {
                let end = adts.frame_length.min(frame.data.len());
                drop(raw);
                frame.data = frame.data.slice(adts.header_length..end);
            }
        }

        let rate = self.header.sample_rate() as f64;
        if frame.timecode == -1 {
            frame.timecode = (self.frames_output as f64 * SAMPLES_PER_FRAME as f64
                * 1_000_000_000.0
                / rate) as i64;
        }
        if frame.duration.is_none() {
            frame.duration = Some((SAMPLES_PER_FRAME as f64 * 1_000_000_000.0 / rate) as i64);
        }

        self.frames_output += 1;
        self.common.add_packet(frame)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test_case(true, PROFILE_LC, 4, 2; "mpeg4 lc 44100 stereo")]
    #[test_case(false, PROFILE_MAIN, 3, 6; "mpeg2 main 48000 5.1")]
    #[test_case(true, PROFILE_SSR, 11, 1; "mpeg4 ssr 8000 mono")]
    fn adts_header_round_trip(mpeg4: bool, profile: u8, sr_index: u8, channels: u8) {
        let payload = vec![0xaau8; 300];
        let header = build_adts_header(mpeg4, profile, sr_index, channels, payload.len());

        let mut frame = header.to_vec();
        frame.extend_from_slice(&payload);

        let parsed = parse_adts(&frame).expect("header should parse");
        assert_eq!(parsed.mpeg4, mpeg4);
        assert_eq!(parsed.profile, profile);
        assert_eq!(parsed.sample_rate_index, sr_index);
        assert_eq!(parsed.channels, channels);
        assert_eq!(parsed.frame_length, payload.len() + 7);
        assert_eq!(parsed.header_length, 7);
    }

    #[test]
    fn rejects_bad_sync_and_layer() {
        assert!(parse_adts(&[0xfe, 0xf1, 0, 0, 0, 0, 0]).is_none());
        assert!(parse_adts(&[0xff, 0xf7, 0, 0, 0, 0, 0]).is_none()); // layer != 0
    }

    #[test]
    fn audio_specific_config_bits() {
        // LC (object type 2), 44100 (index 4), 2 channels:
        // 00010 0100 0010 000 -> 0x12 0x10
        assert_eq!(audio_specific_config(PROFILE_LC, 4, 2), [0x12, 0x10]);
    }

    #[test]
    fn codec_id_round_trip() {
        let id = codec_id(true, PROFILE_LC);
        assert_eq!(id, "A_AAC/MPEG4/LC");
        assert_eq!(parse_codec_id(&id), Some((true, PROFILE_LC)));
        assert_eq!(parse_codec_id("A_AAC/MPEG2/MAIN"), Some((false, PROFILE_MAIN)));
        assert_eq!(parse_codec_id("A_VORBIS"), None);
    }

    #[test]
    fn packetizer_strips_adts_and_counts_samples() {
        let header = AdtsHeader {
            mpeg4: true,
            profile: PROFILE_LC,
            sample_rate_index: 4,
            channels: 2,
            frame_length: 17,
            header_length: 7,
        };
        let mut aac = AacPacketizer::new(Track::new(crate::media::TrackType::Audio), header);
        aac.set_headers().unwrap();

        let mut adts = build_adts_header(true, PROFILE_LC, 4, 2, 10).to_vec();
        adts.extend_from_slice(&[7u8; 10]);

        aac.process(Frame::new(adts.clone(), -1)).unwrap();
        aac.process(Frame::new(adts, -1)).unwrap();

        let queue = &mut aac.common_mut().queue;
        let first = queue.pop().unwrap();
        assert_eq!(first.data.len(), 10);
        assert_eq!(first.timecode, 0);

        let second = queue.pop().unwrap();
        let expected = (1024.0f64 * 1_000_000_000.0 / 44100.0) as i64;
        assert_eq!(second.timecode, expected);
    }
}
