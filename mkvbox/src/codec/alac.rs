//! ALAC packetizer. The codec private data is the 24-byte
//! ALACSpecificConfig, dug out of whatever shape of CAF magic cookie the
//! source carries.

use crate::codec::{Frame, Packetizer, PacketizerCommon};
use crate::error::{Error, Result};
use crate::io::{get_u16_be, get_u32_be};
use crate::media::{codec_ids, AudioParams, Track};
use crate::span::Span;

pub const CONFIG_SIZE: usize = 24;
pub const DEFAULT_FRAMES_PER_PACKET: u32 = 4096;

/// The ALACSpecificConfig, all fields big endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlacConfig {
    pub frame_length: u32,
    pub compatible_version: u8,
    pub bit_depth: u8,
    pub rice_history_mult: u8,
    pub rice_initial_history: u8,
    pub rice_limit: u8,
    pub num_channels: u8,
    pub max_run: u16,
    pub max_frame_bytes: u32,
    pub avg_bit_rate: u32,
    pub sample_rate: u32,
}

impl AlacConfig {
    pub fn parse(data: &[u8]) -> Result<AlacConfig> {
        if data.len() < CONFIG_SIZE {
            return Err(Error::Unsupported("ALAC config shorter than 24 bytes".into()));
        }

        Ok(AlacConfig {
            frame_length: get_u32_be(&data[0..]),
            compatible_version: data[4],
            bit_depth: data[5],
            rice_history_mult: data[6],
            rice_initial_history: data[7],
            rice_limit: data[8],
            num_channels: data[9],
            max_run: get_u16_be(&data[10..]),
            max_frame_bytes: get_u32_be(&data[12..]),
            avg_bit_rate: get_u32_be(&data[16..]),
            sample_rate: get_u32_be(&data[20..]),
        })
    }
}

/// Extracts the bare 24-byte ALACSpecificConfig from a CAF `kuki` chunk.
///
/// Modern files store the config directly; old-style cookies wrap it in a
/// `frma`/`alac` atom chain (12 bytes of `frma` prefix, then a 12-byte
/// `alac` atom head of size, tag and version flags).
pub fn config_from_cookie(cookie: &[u8]) -> Result<Vec<u8>> {
    let mut data = cookie;

    if data.len() >= 12 && &data[4..8] == b"frma" {
        data = &data[12..];
    }
    if data.len() >= 12 && &data[4..8] == b"alac" {
        data = &data[12..];
    }

    if data.len() < CONFIG_SIZE {
        return Err(Error::Unsupported(format!(
            "ALAC magic cookie of {} bytes holds no config",
            cookie.len()
        )));
    }

    Ok(data[..CONFIG_SIZE].to_vec())
}

pub struct AlacPacketizer {
    common: PacketizerCommon,
    config: AlacConfig,
    config_bytes: Vec<u8>,
    samples_output: u64,
}

impl AlacPacketizer {
    pub fn new(mut track: Track, cookie: &[u8]) -> Result<AlacPacketizer> {
        let config_bytes = config_from_cookie(cookie)?;
        let config = AlacConfig::parse(&config_bytes)?;

        track.audio = Some(AudioParams {
            sample_rate: config.sample_rate as f64,
            channels: config.num_channels as u64,
            bit_depth: Some(config.bit_depth as u64),
        });

        Ok(AlacPacketizer {
            common: PacketizerCommon::new(track),
            config,
            config_bytes,
            samples_output: 0,
        })
    }

    pub fn config(&self) -> &AlacConfig {
        &self.config
    }
}

impl Packetizer for AlacPacketizer {
    fn common(&self) -> &PacketizerCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut PacketizerCommon {
        &mut self.common
    }

    fn set_headers(&mut self) -> Result<()> {
        self.common.track.codec_id = codec_ids::A_ALAC.into();
        self.common.track.codec_private = Some(Span::from(self.config_bytes.clone()));

        let rate = self.config.sample_rate as f64;
        if rate > 0.0 {
            self.common.track.default_duration =
                Some((self.config.frame_length as f64 * 1_000_000_000.0 / rate) as u64);
        }
        Ok(())
    }

    fn process(&mut self, mut frame: Frame) -> Result<()> {
        let rate = self.config.sample_rate as f64;
        let samples = self.config.frame_length as u64;

        if frame.timecode == -1 {
            frame.timecode = (self.samples_output as f64 * 1_000_000_000.0 / rate) as i64;
        }
        if frame.duration.is_none() {
            frame.duration = Some((samples as f64 * 1_000_000_000.0 / rate) as i64);
        }

        self.samples_output += samples;
        self.common.add_packet(frame)
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::media::TrackType;
    use test_case::test_case;

    pub fn config_bytes(rate: u32, channels: u8, bit_depth: u8) -> Vec<u8> {
        let mut config = Vec::with_capacity(CONFIG_SIZE);
        config.extend_from_slice(&4096u32.to_be_bytes()); // frame length
        config.push(0); // compatible version
        config.push(bit_depth);
        config.extend_from_slice(&[40, 10, 14]); // rice params
        config.push(channels);
        config.extend_from_slice(&255u16.to_be_bytes()); // max run
        config.extend_from_slice(&0u32.to_be_bytes()); // max frame bytes
        config.extend_from_slice(&0u32.to_be_bytes()); // avg bit rate
        config.extend_from_slice(&rate.to_be_bytes());
        config
    }

    fn old_style_cookie(config: &[u8]) -> Vec<u8> {
        let mut cookie = Vec::new();
        cookie.extend_from_slice(&12u32.to_be_bytes());
        cookie.extend_from_slice(b"frma");
        cookie.extend_from_slice(b"alac");
        cookie.extend_from_slice(&(12 + CONFIG_SIZE as u32).to_be_bytes());
        cookie.extend_from_slice(b"alac");
        cookie.extend_from_slice(&0u32.to_be_bytes());
        cookie.extend_from_slice(config);
        cookie
    }

    #[test_case(false; "bare config")]
    #[test_case(true; "frma alac cookie")]
    fn cookie_yields_the_config(old_style: bool) {
        let config = config_bytes(44100, 2, 16);
        let cookie = if old_style {
            old_style_cookie(&config)
        } else {
            config.clone()
        };

        assert_eq!(config_from_cookie(&cookie).unwrap(), config);
    }

    #[test]
    fn short_cookie_is_rejected() {
        assert!(config_from_cookie(&[0u8; 10]).is_err());
    }

    #[test]
    fn packetizer_fills_track_from_config() {
        let cookie = config_bytes(44100, 6, 24);
        let mut alac =
            AlacPacketizer::new(Track::new(TrackType::Audio), &cookie).unwrap();
        alac.set_headers().unwrap();

        let track = &alac.common().track;
        assert_eq!(track.codec_id, "A_ALAC");
        assert_eq!(track.audio.as_ref().unwrap().channels, 6);
        assert_eq!(track.audio.as_ref().unwrap().bit_depth, Some(24));
        assert_eq!(track.codec_private.as_ref().unwrap().len(), CONFIG_SIZE);

        alac.process(Frame::new(vec![1u8, 2, 3], -1)).unwrap();
        alac.process(Frame::new(vec![4u8], -1)).unwrap();

        let queue = &mut alac.common_mut().queue;
        assert_eq!(queue.pop().unwrap().timecode, 0);
        let second = queue.pop().unwrap();
        assert_eq!(
            second.timecode,
            (4096.0f64 * 1_000_000_000.0 / 44100.0) as i64
        );
    }
}
