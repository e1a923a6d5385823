//! Vorbis packetizer: derives per-packet sample offsets from the window
//! blocksizes and laces the three header packets into codec private data.

use nom::bytes::complete::tag;
use nom::number::complete::{le_u32, le_u8};
use nom::IResult;

use crate::codec::{lace_xiph, Frame, Packetizer, PacketizerCommon};
use crate::error::{Error, Result};
use crate::media::{codec_ids, AudioParams, Track};
use crate::span::Span;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdentHeader {
    pub channels: u8,
    pub sample_rate: u32,
    pub blocksize_0: u32,
    pub blocksize_1: u32,
}

fn ident_header(input: &[u8]) -> IResult<&[u8], IdentHeader> {
    let (input, _) = tag(b"\x01vorbis")(input)?;
    let (input, _version) = le_u32(input)?;
    let (input, channels) = le_u8(input)?;
    let (input, sample_rate) = le_u32(input)?;
    let (input, _bitrate_max) = le_u32(input)?;
    let (input, _bitrate_nominal) = le_u32(input)?;
    let (input, _bitrate_min) = le_u32(input)?;
    let (input, blocksizes) = le_u8(input)?;

    Ok((
        input,
        IdentHeader {
            channels,
            sample_rate,
            blocksize_0: 1 << (blocksizes & 0x0f),
            blocksize_1: 1 << (blocksizes >> 4),
        },
    ))
}

impl IdentHeader {
    pub fn parse(data: &[u8]) -> Result<IdentHeader> {
        let (_, header) = ident_header(data)
            .map_err(|_| Error::Unsupported("not a Vorbis identification header".into()))?;

        if header.sample_rate == 0 || header.channels == 0 {
            return Err(Error::Unsupported("Vorbis header with zero rate or channels".into()));
        }
        Ok(header)
    }

    /// Window size of an audio packet. Header packets (odd first byte) and
    /// empty packets decode no samples.
    pub fn packet_blocksize(&self, packet: &[u8]) -> u32 {
        match packet.first() {
            None => 0,
            Some(first) if first & 1 == 1 => 0,
            Some(first) => {
                if (first >> 1) & 1 == 0 {
                    self.blocksize_0
                } else {
                    self.blocksize_1
                }
            }
        }
    }
}

struct QueuedFrame {
    frame: Frame,
    end_samples: u64,
}

/// Buffers one packet so the final packet's duration can be clamped against
/// the stream's terminating granule position.
pub struct VorbisPacketizer {
    common: PacketizerCommon,
    ident: IdentHeader,
    headers: [Span; 3],
    last_blocksize: u32,
    samples: u64,
    queued: Option<QueuedFrame>,
    granule_limit: Option<u64>,
}

impl VorbisPacketizer {
    pub fn new(
        mut track: Track,
        ident_packet: Span,
        comment_packet: Span,
        setup_packet: Span,
    ) -> Result<VorbisPacketizer> {
        let ident = IdentHeader::parse(&ident_packet.to_slice())?;

        track.audio = Some(AudioParams {
            sample_rate: ident.sample_rate as f64,
            channels: ident.channels as u64,
            bit_depth: None,
        });

        Ok(VorbisPacketizer {
            common: PacketizerCommon::new(track),
            ident,
            headers: [ident_packet, comment_packet, setup_packet],
            last_blocksize: 0,
            samples: 0,
            queued: None,
            granule_limit: None,
        })
    }

    /// The terminating granule position of the source stream; the very last
    /// packet's duration is clamped so the sample count never exceeds it.
    pub fn set_granule_limit(&mut self, granulepos: u64) {
        self.granule_limit = Some(granulepos);
    }

    fn ns_per_sample(&self) -> f64 {
        1_000_000_000.0 / self.ident.sample_rate as f64
    }

    fn flush_queued(&mut self, clamp: bool) -> Result<()> {
        let Some(mut queued) = self.queued.take() else {
            return Ok(());
        };

        if clamp {
            if let Some(limit) = self.granule_limit {
                if queued.end_samples > limit {
                    let over = queued.end_samples - limit;
                    let duration = queued.frame.duration.unwrap_or(0)
                        - (over as f64 * self.ns_per_sample()) as i64;
                    queued.frame.duration = Some(duration.max(0));
                }
            }
        }

        self.common.add_packet(queued.frame)
    }
}

impl Packetizer for VorbisPacketizer {
    fn common(&self) -> &PacketizerCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut PacketizerCommon {
        &mut self.common
    }

    fn set_headers(&mut self) -> Result<()> {
        self.common.track.codec_id = codec_ids::A_VORBIS.into();
        self.common.track.codec_private = Some(lace_xiph(&self.headers));
        Ok(())
    }

    fn process(&mut self, mut frame: Frame) -> Result<()> {
        self.flush_queued(false)?;

        let this_blocksize = self.ident.packet_blocksize(&frame.data.to_slice());
        let samples_here = (this_blocksize + self.last_blocksize) as u64 / 4;

        if frame.timecode == -1 {
            frame.timecode = (self.samples as f64 * self.ns_per_sample()) as i64;
        }
        if frame.duration.is_none() {
            frame.duration = Some((samples_here as f64 * self.ns_per_sample()) as i64);
        }

        self.samples += samples_here;
        self.last_blocksize = this_blocksize;

        self.queued = Some(QueuedFrame {
            frame,
            end_samples: self.samples,
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_queued(true)
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::media::TrackType;

    pub fn ident_packet(rate: u32, channels: u8, bs0_exp: u8, bs1_exp: u8) -> Vec<u8> {
        let mut packet = b"\x01vorbis".to_vec();
        packet.extend_from_slice(&0u32.to_le_bytes());
        packet.push(channels);
        packet.extend_from_slice(&rate.to_le_bytes());
        packet.extend_from_slice(&[0u8; 12]); // bitrates
        packet.push((bs1_exp << 4) | bs0_exp);
        packet.push(1); // framing
        packet
    }

    fn packetizer(rate: u32) -> VorbisPacketizer {
        let ident = ident_packet(rate, 2, 8, 11);
        VorbisPacketizer::new(
            Track::new(TrackType::Audio),
            Span::from(ident),
            Span::from(b"\x03vorbis".to_vec()),
            Span::from(b"\x05vorbis".to_vec()),
        )
        .unwrap()
    }

    // Audio packets: even first byte; bit 1 selects the long window.
    const SHORT: &[u8] = &[0b0000_0000, 0xaa];
    const LONG: &[u8] = &[0b0000_0010, 0xaa];

    #[test]
    fn ident_parses_blocksizes() {
        let ident = IdentHeader::parse(&ident_packet(48000, 2, 8, 11)).unwrap();
        assert_eq!(ident.sample_rate, 48000);
        assert_eq!(ident.blocksize_0, 256);
        assert_eq!(ident.blocksize_1, 2048);
        assert_eq!(ident.packet_blocksize(SHORT), 256);
        assert_eq!(ident.packet_blocksize(LONG), 2048);
        assert_eq!(ident.packet_blocksize(&[0x01]), 0);
    }

    #[test]
    fn sample_offsets_follow_blocksize_rule() {
        let mut vorbis = packetizer(1_000_000_000); // 1 ns per sample
        vorbis.set_headers().unwrap();

        vorbis.process(Frame::new(LONG, -1)).unwrap();
        vorbis.process(Frame::new(LONG, -1)).unwrap();
        vorbis.process(Frame::new(SHORT, -1)).unwrap();
        vorbis.flush().unwrap();

        let queue = &mut vorbis.common_mut().queue;

        // First packet: (2048 + 0) / 4 = 512 samples, starting at 0.
        let first = queue.pop().unwrap();
        assert_eq!(first.timecode, 0);
        assert_eq!(first.duration, Some(512));

        // Second: (2048 + 2048) / 4 = 1024 samples at offset 512.
        let second = queue.pop().unwrap();
        assert_eq!(second.timecode, 512);
        assert_eq!(second.duration, Some(1024));

        // Third: (256 + 2048) / 4 = 576 samples at offset 1536.
        let third = queue.pop().unwrap();
        assert_eq!(third.timecode, 1536);
        assert_eq!(third.duration, Some(576));
    }

    #[test]
    fn final_duration_clamps_to_granule_limit() {
        let mut vorbis = packetizer(1_000_000_000);
        vorbis.set_headers().unwrap();

        vorbis.process(Frame::new(LONG, -1)).unwrap();
        vorbis.process(Frame::new(LONG, -1)).unwrap();
        // Stream claims 100 samples fewer than the windows decode to.
        vorbis.set_granule_limit(512 + 1024 - 100);
        vorbis.flush().unwrap();

        let queue = &mut vorbis.common_mut().queue;
        queue.pop().unwrap();
        let last = queue.pop().unwrap();

        assert_eq!(last.duration, Some(1024 - 100));
    }

    #[test]
    fn codec_private_is_xiph_laced() {
        let mut vorbis = packetizer(48000);
        vorbis.set_headers().unwrap();

        let private = vorbis.common().track.codec_private.clone().unwrap();
        let segments = crate::codec::unlace_xiph(&private).unwrap();

        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].to_bytes()[..7], b"\x01vorbis"[..]);
        assert_eq!(segments[1].to_bytes(), b"\x03vorbis");
        assert_eq!(segments[2].to_bytes(), b"\x05vorbis");
    }
}
