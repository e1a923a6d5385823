//! AVI 1.0 reader: RIFF walking, stream headers, movi chunk dispatch and
//! idx1-based key frame marking.

use std::io::SeekFrom;

use crate::codec::mpeg4::Mpeg4Packetizer;
use crate::codec::passthrough::{AudioPacketizer, VideoPacketizer};
use crate::codec::{Frame, Packetizer};
use crate::error::Result;
use crate::format::{ProbeResult, Reader, SourceOptions, Status};
use crate::io::{get_u16_le, get_u32_le, IoReader};
use crate::media::{codec_ids, AudioParams, Track, TrackType, VideoParams};
use crate::reader;
use crate::span::Span;

reader!("AVI", AviReader::create, AviReader::probe);

const AVIIF_KEYFRAME: u32 = 0x10;

/// FourCCs that carry an ISO MPEG-4 part 2 bitstream.
const MPEG4_FOURCCS: [&[u8; 4]; 6] = [b"DIVX", b"XVID", b"DX50", b"FMP4", b"MP4V", b"mp4v"];

struct AviStream {
    packetizer: Option<Box<dyn Packetizer>>,
    /// Key frame flags from idx1, by chunk occurrence.
    keyframes: Vec<bool>,
    chunks_seen: usize,
    is_video: bool,
}

pub struct AviReader {
    io: IoReader,
    streams: Vec<AviStream>,
    movi_pos: u64,
    movi_end: u64,
    position: u64,
}

impl AviReader {
    fn create(io: IoReader, options: SourceOptions) -> Result<Box<dyn Reader>> {
        Ok(Box::new(AviReader::open(io, options)?))
    }

    fn probe(data: &[u8]) -> ProbeResult {
        if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"AVI " {
            ProbeResult::Yup
        } else {
            ProbeResult::Unsure
        }
    }

    pub fn open(mut io: IoReader, options: SourceOptions) -> Result<AviReader> {
        let head = io.read_vec(12)?;
        if &head[0..4] != b"RIFF" || &head[8..12] != b"AVI " {
            return Err(io.invalid("AVI", 0, "missing RIFF/AVI header"));
        }

        let mut streams: Vec<AviStream> = Vec::new();
        let mut movi = None;
        let mut idx1 = None;
        let file_size = io.size();

        // Top-level chunk walk.
        loop {
            let chunk_pos = io.tell()?;
            if chunk_pos + 8 > file_size {
                break;
            }
            let mut fourcc = [0u8; 4];
            io.read_exact(&mut fourcc)?;
            let size = io.read_u32_le()? as u64;
            let next = chunk_pos + 8 + size + (size & 1);

            match &fourcc {
                b"LIST" => {
                    let mut list_type = [0u8; 4];
                    io.read_exact(&mut list_type)?;
                    match &list_type {
                        b"hdrl" => {
                            Self::parse_hdrl(&mut io, chunk_pos + 12, next, &mut streams, &options)?;
                        }
                        b"movi" => {
                            movi = Some((chunk_pos + 12, next));
                        }
                        _ => {}
                    }
                    io.seek(SeekFrom::Start(next))?;
                }
                b"idx1" => {
                    idx1 = Some((chunk_pos + 8, size));
                    io.seek(SeekFrom::Start(next))?;
                }
                _ => {
                    io.seek(SeekFrom::Start(next))?;
                }
            }
        }

        let (movi_pos, movi_end) =
            movi.ok_or_else(|| io.invalid("AVI", 12, "no movi list found"))?;

        if let Some((pos, size)) = idx1 {
            io.seek(SeekFrom::Start(pos))?;
            let entries = io.read_vec(size as usize)?;
            for entry in entries.chunks_exact(16) {
                let stream = ascii_stream_number(&entry[0..4]);
                let flags = get_u32_le(&entry[4..]);
                if let Some(stream) = stream {
                    if let Some(state) = streams.get_mut(stream) {
                        state.keyframes.push(flags & AVIIF_KEYFRAME != 0);
                    }
                }
            }
        }

        Ok(AviReader {
            io,
            streams,
            movi_pos,
            movi_end: movi_end.min(file_size),
            position: movi_pos,
        })
    }

    fn parse_hdrl(
        io: &mut IoReader,
        start: u64,
        end: u64,
        streams: &mut Vec<AviStream>,
        options: &SourceOptions,
    ) -> Result<()> {
        let mut pos = start;

        while pos + 8 <= end {
            io.seek(SeekFrom::Start(pos))?;
            let mut fourcc = [0u8; 4];
            io.read_exact(&mut fourcc)?;
            let size = io.read_u32_le()? as u64;
            let next = pos + 8 + size + (size & 1);

            if &fourcc == b"LIST" {
                let mut list_type = [0u8; 4];
                io.read_exact(&mut list_type)?;
                if &list_type == b"strl" {
                    let index = streams.len();
                    let stream = Self::parse_strl(io, pos + 12, next, index, options)?;
                    streams.push(stream);
                }
            }
            pos = next;
        }
        Ok(())
    }

    fn parse_strl(
        io: &mut IoReader,
        start: u64,
        end: u64,
        index: usize,
        options: &SourceOptions,
    ) -> Result<AviStream> {
        let mut strh = None;
        let mut strf = None;
        let mut pos = start;

        while pos + 8 <= end {
            io.seek(SeekFrom::Start(pos))?;
            let mut fourcc = [0u8; 4];
            io.read_exact(&mut fourcc)?;
            let size = io.read_u32_le()? as u64;
            let next = pos + 8 + size + (size & 1);

            match &fourcc {
                b"strh" => strh = Some(io.read_vec(size as usize)?),
                b"strf" => strf = Some(io.read_vec(size as usize)?),
                _ => {}
            }
            pos = next;
        }

        let strh = strh.ok_or_else(|| io.invalid("AVI", start, "strl without strh"))?;
        let strf = strf.ok_or_else(|| io.invalid("AVI", start, "strl without strf"))?;
        if strh.len() < 40 {
            return Err(io.invalid("AVI", start, "truncated stream header"));
        }

        let fcc_type = &strh[0..4];
        let scale = get_u32_le(&strh[20..]).max(1);
        let rate = get_u32_le(&strh[24..]).max(1);

        let mut stream = AviStream {
            packetizer: None,
            keyframes: Vec::new(),
            chunks_seen: 0,
            is_video: fcc_type == b"vids",
        };

        match fcc_type {
            b"vids" => {
                if strf.len() < 40 {
                    return Err(io.invalid("AVI", start, "truncated BITMAPINFOHEADER"));
                }
                let width = get_u32_le(&strf[4..]) as u64;
                let height = get_u32_le(&strf[8..]) as u64;
                let compression: [u8; 4] = strf[16..20].try_into().unwrap();

                let mut track = Track::new(TrackType::Video);
                track.default_duration =
                    Some((scale as f64 * 1_000_000_000.0 / rate as f64) as u64);
                track.video = Some(VideoParams {
                    pixel_width: width,
                    pixel_height: height,
                    frame_rate: Some(rate as f64 / scale as f64),
                    ..VideoParams::default()
                });

                let mut packetizer: Box<dyn Packetizer> =
                    if MPEG4_FOURCCS.iter().any(|&f| *f == compression) {
                        Box::new(Mpeg4Packetizer::new(track))
                    } else {
                        track.codec_id = format!(
                            "V_MS/VFW/FOURCC/{}",
                            String::from_utf8_lossy(&compression)
                        );
                        track.codec_private = Some(Span::from(strf.clone()));
                        Box::new(VideoPacketizer::new(track))
                    };
                options.apply(index, packetizer.as_mut());
                stream.packetizer = Some(packetizer);
            }
            b"auds" => {
                if strf.len() < 16 {
                    return Err(io.invalid("AVI", start, "truncated WAVEFORMATEX"));
                }
                let format_tag = get_u16_le(&strf[0..]);
                let channels = get_u16_le(&strf[2..]) as u64;
                let sample_rate = get_u32_le(&strf[4..]) as f64;
                let bits = get_u16_le(&strf[14..]) as u64;

                let mut track = Track::new(TrackType::Audio);
                track.audio = Some(AudioParams {
                    sample_rate,
                    channels,
                    bit_depth: if bits > 0 { Some(bits) } else { None },
                });

                let samples_per_frame = match format_tag {
                    0x0055 => {
                        track.codec_id = codec_ids::A_MPEG_L3.into();
                        1152
                    }
                    0x2000 => {
                        track.codec_id = "A_AC3".into();
                        1536
                    }
                    0x0001 => {
                        track.codec_id = codec_ids::A_PCM.into();
                        1
                    }
                    other => {
                        // Unsupported codec: the track is recognized but
                        // skipped, other tracks proceed.
                        options.warnings.warn(format!(
                            "{}: audio format tag 0x{other:04x} is not supported, \
                             skipping track {index}",
                            io.name()
                        ));
                        return Ok(stream);
                    }
                };

                let mut packetizer: Box<dyn Packetizer> =
                    Box::new(AudioPacketizer::new(track, samples_per_frame));
                options.apply(index, packetizer.as_mut());
                stream.packetizer = Some(packetizer);
            }
            _ => {}
        }

        Ok(stream)
    }

    /// Maps a packetizer index (counting only streams that have one) to the
    /// stream slot.
    fn stream_for_packetizer(&self, index: usize) -> Option<usize> {
        self.streams
            .iter()
            .enumerate()
            .filter(|(_, s)| s.packetizer.is_some())
            .map(|(i, _)| i)
            .nth(index)
    }
}

fn ascii_stream_number(fourcc: &[u8]) -> Option<usize> {
    let tens = (fourcc[0] as char).to_digit(10)?;
    let ones = (fourcc[1] as char).to_digit(10)?;
    Some((tens * 10 + ones) as usize)
}

impl Reader for AviReader {
    fn file_name(&self) -> &str {
        self.io.name()
    }

    fn container(&self) -> &'static str {
        "AVI"
    }

    fn read_headers(&mut self) -> Result<()> {
        for stream in &mut self.streams {
            if let Some(packetizer) = &mut stream.packetizer {
                packetizer.set_headers()?;
            }
        }
        Ok(())
    }

    fn packetizer_count(&self) -> usize {
        self.streams.iter().filter(|s| s.packetizer.is_some()).count()
    }

    fn packetizer(&self, index: usize) -> &dyn Packetizer {
        let slot = self.stream_for_packetizer(index).expect("bad index");
        self.streams[slot].packetizer.as_deref().unwrap()
    }

    fn packetizer_mut(&mut self, index: usize) -> &mut dyn Packetizer {
        let slot = self.stream_for_packetizer(index).expect("bad index");
        self.streams[slot].packetizer.as_deref_mut().unwrap()
    }

    fn read(&mut self, index: usize) -> Result<Status> {
        let wanted_slot = match self.stream_for_packetizer(index) {
            Some(slot) => slot,
            None => return Ok(Status::Done),
        };

        let mut delivered = false;
        while !delivered {
            if self.position + 8 > self.movi_end {
                return Ok(Status::Done);
            }

            self.io.seek(SeekFrom::Start(self.position))?;
            let mut fourcc = [0u8; 4];
            self.io.read_exact(&mut fourcc)?;
            let size = self.io.read_u32_le()? as u64;
            let next = self.position + 8 + size + (size & 1);

            if &fourcc == b"LIST" {
                // Descend into rec lists.
                self.position += 12;
                continue;
            }

            if let Some(slot) = ascii_stream_number(&fourcc) {
                if let Some(stream) = self.streams.get_mut(slot) {
                    if let Some(packetizer) = &mut stream.packetizer {
                        let occurrence = stream.chunks_seen;
                        stream.chunks_seen += 1;

                        let payload = self.io.read_vec(size as usize)?;
                        let mut frame = Frame::new(payload, -1);
                        if stream.is_video {
                            let key = stream
                                .keyframes
                                .get(occurrence)
                                .copied()
                                .unwrap_or(true);
                            frame = frame.keyframe(key);
                        }
                        packetizer.process(frame)?;

                        if slot == wanted_slot {
                            delivered = true;
                        }
                    }
                }
            }

            self.position = next;
        }

        Ok(Status::MoreData)
    }
}
