//! WavPack 4 packetizer. Multi-channel files arrive as runs of stereo/mono
//! sub-blocks; the reader assembles them into the Matroska layout (a
//! stripped 16-byte header plus per-sub-block prefixes) and the correction
//! file's counterpart travels as a BlockAddition.

use crate::codec::{Frame, Packetizer, PacketizerCommon};
use crate::error::{Error, Result};
use crate::io::{get_u16_le, get_u32_le};
use crate::media::{codec_ids, AudioParams, Track};

pub const HEADER_SIZE: usize = 32;

pub const FLAG_MONO: u32 = 0x0000_0004;
pub const FLAG_HYBRID: u32 = 0x0000_0008;
pub const FLAG_INITIAL_BLOCK: u32 = 0x0000_0800;
pub const FLAG_FINAL_BLOCK: u32 = 0x0000_1000;

const SAMPLE_RATES: [u32; 15] = [
    6000, 8000, 9600, 11025, 12000, 16000, 22050, 24000, 32000, 44100, 48000, 64000, 88200,
    96000, 192000,
];

/// One on-disk `wvpk` block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WvHeader {
    pub block_size: u32,
    pub version: u16,
    pub track_no: u8,
    pub index_no: u8,
    pub total_samples: u32,
    pub block_index: u32,
    pub block_samples: u32,
    pub flags: u32,
    pub crc: u32,
}

impl WvHeader {
    pub fn parse(data: &[u8]) -> Option<WvHeader> {
        if data.len() < HEADER_SIZE || &data[0..4] != b"wvpk" {
            return None;
        }

        let header = WvHeader {
            block_size: get_u32_le(&data[4..]),
            version: get_u16_le(&data[8..]),
            track_no: data[10],
            index_no: data[11],
            total_samples: get_u32_le(&data[12..]),
            block_index: get_u32_le(&data[16..]),
            block_samples: get_u32_le(&data[20..]),
            flags: get_u32_le(&data[24..]),
            crc: get_u32_le(&data[28..]),
        };

        if header.version >> 8 != 4 {
            return None;
        }
        Some(header)
    }

    /// Payload bytes following the 32-byte header.
    pub fn data_size(&self) -> usize {
        self.block_size as usize + 8 - HEADER_SIZE
    }

    pub fn channels(&self) -> u32 {
        if self.flags & FLAG_MONO != 0 {
            1
        } else {
            2
        }
    }

    pub fn sample_rate(&self) -> u32 {
        let index = ((self.flags >> 23) & 0x0f) as usize;
        SAMPLE_RATES.get(index).copied().unwrap_or(44100)
    }

    pub fn bits_per_sample(&self) -> u32 {
        ((self.flags & 3) + 1) * 8
    }

    pub fn is_hybrid(&self) -> bool {
        self.flags & FLAG_HYBRID != 0
    }
}

/// The 16 bytes of header kept inside a Matroska block: everything except
/// the id, size, flags and CRC, which either follow per sub-block or live
/// in the track headers.
pub fn stripped_header(header: &WvHeader) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..2].copy_from_slice(&header.version.to_le_bytes());
    out[2] = header.track_no;
    out[3] = header.index_no;
    out[4..8].copy_from_slice(&header.total_samples.to_le_bytes());
    out[8..12].copy_from_slice(&header.block_index.to_le_bytes());
    out[12..16].copy_from_slice(&header.block_samples.to_le_bytes());
    out
}

pub struct WavpackPacketizer {
    common: PacketizerCommon,
    sample_rate: u32,
    samples_per_block: u32,
    samples_output: u64,
}

impl WavpackPacketizer {
    pub fn new(mut track: Track, header: &WvHeader, channels: u32) -> WavpackPacketizer {
        track.audio = Some(AudioParams {
            sample_rate: header.sample_rate() as f64,
            channels: channels as u64,
            bit_depth: Some(header.bits_per_sample() as u64),
        });

        WavpackPacketizer {
            common: PacketizerCommon::new(track),
            sample_rate: header.sample_rate(),
            samples_per_block: header.block_samples,
            samples_output: 0,
        }
    }
}

impl Packetizer for WavpackPacketizer {
    fn common(&self) -> &PacketizerCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut PacketizerCommon {
        &mut self.common
    }

    fn set_headers(&mut self) -> Result<()> {
        self.common.track.codec_id = codec_ids::A_WAVPACK4.into();

        if self.sample_rate == 0 {
            return Err(Error::Unsupported("WavPack block with no sample rate".into()));
        }
        self.common.track.default_duration = Some(
            (self.samples_per_block as f64 * 1_000_000_000.0 / self.sample_rate as f64) as u64,
        );
        Ok(())
    }

    /// The frame is the reader-assembled chunk; its stripped header carries
    /// the sample count at offset 12.
    fn process(&mut self, mut frame: Frame) -> Result<()> {
        let raw = frame.data.to_slice();
        if raw.len() < 16 {
            return Err(Error::Unsupported("WavPack chunk shorter than its header".into()));
        }
        let samples = get_u32_le(&raw[12..]) as u64;
        drop(raw);

        let rate = self.sample_rate as f64;
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
mod test {
    use super::*;
    use crate::codec::Frame;
    use crate::media::TrackType;

    pub fn header_bytes(block_samples: u32, flags: u32, data_len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"wvpk");
        out.extend_from_slice(&((HEADER_SIZE - 8 + data_len) as u32).to_le_bytes());
        out.extend_from_slice(&0x0403u16.to_le_bytes()); // version 4.3
        out.push(0); // track_no
        out.push(0); // index_no
        out.extend_from_slice(&44100u32.to_le_bytes()); // total samples
        out.extend_from_slice(&0u32.to_le_bytes()); // block index
        out.extend_from_slice(&block_samples.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&0xdeadbeefu32.to_le_bytes()); // crc
        out
    }

    #[test]
    fn header_parse_and_stripping() {
        // Sample-rate index 9 (44100) in bits 23..27, stereo, initial+final.
        let flags = (9 << 23) | FLAG_INITIAL_BLOCK | FLAG_FINAL_BLOCK | 1;
        let bytes = header_bytes(22050, flags, 100);

        let header = WvHeader::parse(&bytes).unwrap();
        assert_eq!(header.version, 0x0403);
        assert_eq!(header.block_samples, 22050);
        assert_eq!(header.sample_rate(), 44100);
        assert_eq!(header.channels(), 2);
        assert_eq!(header.bits_per_sample(), 16);
        assert_eq!(header.data_size(), 100);
        assert!(!header.is_hybrid());

        let stripped = stripped_header(&header);
        assert_eq!(&stripped[0..2], &0x0403u16.to_le_bytes());
        assert_eq!(get_u32_le(&stripped[12..]), 22050);
    }

    #[test]
    fn wrong_magic_or_version_is_rejected() {
        let mut bytes = header_bytes(100, 0, 0);
        bytes[0] = b'x';
        assert!(WvHeader::parse(&bytes).is_none());

        let mut bytes = header_bytes(100, 0, 0);
        bytes[9] = 3; // version 3.x
        assert!(WvHeader::parse(&bytes).is_none());
    }

    #[test]
    fn timecodes_advance_by_block_samples() {
        let flags = 9 << 23;
        let header = WvHeader::parse(&header_bytes(22050, flags, 8)).unwrap();
        let mut wavpack = WavpackPacketizer::new(Track::new(TrackType::Audio), &header, 2);
        wavpack.set_headers().unwrap();

        assert_eq!(wavpack.common().track.default_duration, Some(500_000_000));

        let mut chunk = stripped_header(&header).to_vec();
        chunk.extend_from_slice(&[0u8; 8]);

        wavpack.process(Frame::new(chunk.clone(), -1)).unwrap();
        wavpack.process(Frame::new(chunk, -1)).unwrap();

        let queue = &mut wavpack.common_mut().queue;
        assert_eq!(queue.pop().unwrap().timecode, 0);
        assert_eq!(queue.pop().unwrap().timecode, 500_000_000);
    }
}
