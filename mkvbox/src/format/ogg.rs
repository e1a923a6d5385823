//! Ogg reader: page-level demultiplexing with per-stream packet assembly
//! and mappings for Vorbis, Theora and Kate payloads.

use nom::bytes::complete::tag;
use nom::number::complete::{le_i64, le_u32, le_u8};
use nom::IResult;

use crate::codec::passthrough::{TextPacketizer, VideoPacketizer};
use crate::codec::vorbis::VorbisPacketizer;
use crate::codec::{lace_xiph, Frame, Packetizer};
use crate::error::Result;
use crate::format::{ProbeResult, Reader, SourceOptions, Status};
use crate::io::{get_u24_be, get_u32_be, get_u32_le, IoReader};
use crate::media::{codec_ids, Track, TrackType, VideoParams};
use crate::reader;
use crate::span::Span;

reader!("Ogg/OGM", OggReader::create, OggReader::probe);

const PAGE_EOS: u8 = 0x04;

#[derive(Debug)]
struct PageHeader {
    flags: u8,
    granulepos: i64,
    serial: u32,
    segments: Vec<u8>,
}

fn page_header(input: &[u8]) -> IResult<&[u8], PageHeader> {
    let (input, _) = tag(b"OggS")(input)?;
    let (input, _version) = le_u8(input)?;
    let (input, flags) = le_u8(input)?;
    let (input, granulepos) = le_i64(input)?;
    let (input, serial) = le_u32(input)?;
    let (input, _sequence) = le_u32(input)?;
    let (input, _crc) = le_u32(input)?;
    let (input, nsegs) = le_u8(input)?;
    let (input, table) = nom::bytes::complete::take(nsegs as usize)(input)?;

    Ok((
        input,
        PageHeader {
            flags,
            granulepos,
            serial,
            segments: table.to_vec(),
        },
    ))
}

enum StreamKind {
    Vorbis,
    Theora,
    Kate { gnum: u32, gden: u32 },
    Unknown,
}

/// Concrete per-codec packetizer slots, so codec-specific calls (the Vorbis
/// granule clamp) need no downcasting.
enum StreamPacketizer {
    Vorbis(VorbisPacketizer),
    Video(VideoPacketizer),
    Text(TextPacketizer),
}

impl StreamPacketizer {
    fn as_dyn(&self) -> &dyn Packetizer {
        match self {
            StreamPacketizer::Vorbis(p) => p,
            StreamPacketizer::Video(p) => p,
            StreamPacketizer::Text(p) => p,
        }
    }

    fn as_dyn_mut(&mut self) -> &mut dyn Packetizer {
        match self {
            StreamPacketizer::Vorbis(p) => p,
            StreamPacketizer::Video(p) => p,
            StreamPacketizer::Text(p) => p,
        }
    }
}

struct OggStream {
    serial: u32,
    kind: StreamKind,
    packetizer: Option<StreamPacketizer>,
    headers_needed: usize,
    headers: Vec<Span>,
    partial: Vec<u8>,
    /// Packets seen before the packetizer existed (data sharing a page with
    /// headers); delivered on the first read.
    pending: Vec<(Span, i64)>,
}

pub struct OggReader {
    io: IoReader,
    streams: Vec<OggStream>,
    options: SourceOptions,
    position: u64,
    headers_done: bool,
}

impl OggReader {
    fn create(io: IoReader, options: SourceOptions) -> Result<Box<dyn Reader>> {
        Ok(Box::new(OggReader::open(io, options)?))
    }

    fn probe(data: &[u8]) -> ProbeResult {
        if data.starts_with(b"OggS") {
            ProbeResult::Yup
        } else {
            ProbeResult::Unsure
        }
    }

    pub fn open(io: IoReader, options: SourceOptions) -> Result<OggReader> {
        let mut reader = OggReader {
            io,
            streams: Vec::new(),
            options,
            position: 0,
            headers_done: false,
        };

        // Walk pages until every discovered stream has its header packets.
        while !reader.headers_done {
            if !reader.next_page()? {
                break;
            }
            reader.headers_done = !reader.streams.is_empty()
                && reader
                    .streams
                    .iter()
                    .all(|s| s.headers.len() >= s.headers_needed);
        }

        if reader.streams.is_empty() {
            return Err(reader.io.invalid("Ogg", 0, "no logical streams found"));
        }

        reader.build_packetizers()?;
        Ok(reader)
    }

    /// Reads and dispatches one page. Returns false at end of file.
    fn next_page(&mut self) -> Result<bool> {
        let mut head = [0u8; 27];
        self.io.seek(std::io::SeekFrom::Start(self.position))?;
        if self.io.read_some(&mut head)? < head.len() {
            return Ok(false);
        }
        let nsegs = head[26] as usize;
        let mut full = head.to_vec();
        full.extend_from_slice(&self.io.read_vec(nsegs)?);

        let (_, header) = page_header(&full)
            .map_err(|_| self.io.invalid("Ogg", self.position, "bad page header"))?;

        let body_len: usize = header.segments.iter().map(|&s| s as usize).sum();
        let body = self.io.read_vec(body_len)?;
        self.position = self.io.tell()?;

        let stream_index = match self.streams.iter().position(|s| s.serial == header.serial) {
            Some(index) => index,
            None => {
                self.streams.push(OggStream {
                    serial: header.serial,
                    kind: StreamKind::Unknown,
                    packetizer: None,
                    headers_needed: 1,
                    headers: Vec::new(),
                    partial: Vec::new(),
                    pending: Vec::new(),
                });
                self.streams.len() - 1
            }
        };

        // Assemble packets: a lacing value below 255 ends a packet.
        let mut offset = 0usize;
        let mut packets: Vec<Vec<u8>> = Vec::new();
        {
            let stream = &mut self.streams[stream_index];
            for &segment in &header.segments {
                let end = (offset + segment as usize).min(body.len());
                stream.partial.extend_from_slice(&body[offset..end]);
                offset = end;
                if segment < 255 {
                    packets.push(std::mem::take(&mut stream.partial));
                }
            }
        }

        for packet in packets {
            self.handle_packet(stream_index, packet, &header)?;
        }

        if header.flags & PAGE_EOS != 0 && header.granulepos >= 0 {
            let stream = &mut self.streams[stream_index];
            if let Some(StreamPacketizer::Vorbis(vorbis)) = stream.packetizer.as_mut() {
                vorbis.set_granule_limit(header.granulepos as u64);
            }
        }
        Ok(true)
    }

    fn handle_packet(
        &mut self,
        stream_index: usize,
        packet: Vec<u8>,
        page: &PageHeader,
    ) -> Result<()> {
        let stream = &mut self.streams[stream_index];

        if stream.headers.is_empty() {
            // First packet identifies the stream.
            stream.kind = if packet.starts_with(b"\x01vorbis") {
                stream.headers_needed = 3;
                StreamKind::Vorbis
            } else if packet.starts_with(b"\x80theora") {
                stream.headers_needed = 3;
                StreamKind::Theora
            } else if packet.starts_with(b"\x80kate\0\0\0") && packet.len() >= 32 {
                stream.headers_needed = packet[11].max(1) as usize;
                StreamKind::Kate {
                    gnum: get_u32_le(&packet[24..]),
                    gden: get_u32_le(&packet[28..]).max(1),
                }
            } else {
                self.options.warnings.warn(format!(
                    "{}: unsupported Ogg stream with serial 0x{:08x}, skipping",
                    self.io.name(),
                    stream.serial
                ));
                StreamKind::Unknown
            };
            stream.headers.push(Span::from(packet));
            return Ok(());
        }

        if stream.headers.len() < stream.headers_needed {
            stream.headers.push(Span::from(packet));
            return Ok(());
        }

        match stream.packetizer.as_mut() {
            None if stream.pending.len() < 1024 => {
                stream.pending.push((Span::from(packet), page.granulepos));
            }
            None => {}
            Some(packetizer) => {
                deliver_packet(packetizer.as_dyn_mut(), &stream.kind, Span::from(packet))?;
            }
        }
        Ok(())
    }

    fn build_packetizers(&mut self) -> Result<()> {
        for index in 0..self.streams.len() {
            let stream = &mut self.streams[index];

            let packetizer: Option<StreamPacketizer> = match &stream.kind {
                StreamKind::Vorbis if stream.headers.len() >= 3 => {
                    Some(StreamPacketizer::Vorbis(VorbisPacketizer::new(
                        Track::new(TrackType::Audio),
                        stream.headers[0].clone(),
                        stream.headers[1].clone(),
                        stream.headers[2].clone(),
                    )?))
                }
                StreamKind::Theora if stream.headers.len() >= 3 => {
                    let ident = stream.headers[0].to_bytes();
                    let mut track = Track::new(TrackType::Video);
                    track.codec_id = codec_ids::V_THEORA.into();
                    track.codec_private = Some(lace_xiph(&stream.headers));

                    if ident.len() >= 42 {
                        let width = get_u24_be(&ident[14..]) as u64;
                        let height = get_u24_be(&ident[17..]) as u64;
                        let frn = get_u32_be(&ident[22..]) as f64;
                        let frd = get_u32_be(&ident[26..]).max(1) as f64;
                        track.video = Some(VideoParams {
                            pixel_width: width,
                            pixel_height: height,
                            frame_rate: Some(frn / frd),
                            ..VideoParams::default()
                        });
                        if frn > 0.0 {
                            track.default_duration =
                                Some((1_000_000_000.0 * frd / frn) as u64);
                        }
                    }
                    Some(StreamPacketizer::Video(VideoPacketizer::new(track)))
                }
                StreamKind::Kate { .. } => {
                    let mut track = Track::new(TrackType::Subtitle);
                    track.codec_id = codec_ids::S_KATE.into();
                    track.codec_private = Some(lace_xiph(&stream.headers));
                    Some(StreamPacketizer::Text(TextPacketizer::new(track)))
                }
                _ => None,
            };

            if let Some(mut packetizer) = packetizer {
                self.options.apply(index, packetizer.as_dyn_mut());
                let pending = std::mem::take(&mut stream.pending);
                stream.packetizer = Some(packetizer);

                let OggStream {
                    kind, packetizer, ..
                } = &mut self.streams[index];
                let packetizer = packetizer.as_mut().unwrap();
                for (data, _granulepos) in pending {
                    deliver_packet(packetizer.as_dyn_mut(), kind, data)?;
                }
            }
        }
        Ok(())
    }

    fn stream_for_packetizer(&self, index: usize) -> Option<usize> {
        self.streams
            .iter()
            .enumerate()
            .filter(|(_, s)| s.packetizer.is_some())
            .map(|(i, _)| i)
            .nth(index)
    }
}

fn deliver_packet(
    packetizer: &mut dyn Packetizer,
    kind: &StreamKind,
    data: Span,
) -> Result<()> {
    match kind {
        StreamKind::Vorbis => packetizer.process(Frame::new(data, -1)),
        StreamKind::Theora => {
            let raw = data.to_slice();
            if raw.first().map(|b| b & 0x80 != 0).unwrap_or(true) {
                return Ok(()); // stray header packet
            }
            let keyframe = raw.first().map(|b| b & 0x40 == 0).unwrap_or(false);
            drop(raw);
            packetizer.process(Frame::new(data, -1).keyframe(keyframe))
        }
        StreamKind::Kate { gnum, gden } => {
            let raw = data.to_slice();
            match raw.first() {
                Some(0x00) if raw.len() >= 17 => {
                    let start = i64::from_le_bytes(raw[1..9].try_into().unwrap());
                    let duration = i64::from_le_bytes(raw[9..17].try_into().unwrap());
                    let scale = 1_000_000_000.0 * *gden as f64 / (*gnum).max(1) as f64;
                    let timecode = (start as f64 * scale) as i64;
                    let duration = (duration as f64 * scale) as i64;
                    drop(raw);
                    packetizer.process(Frame::new(data, timecode).with_duration(duration))
                }
                // The end-of-stream marker and anything unrecognized is not
                // a displayable event.
                _ => Ok(()),
            }
        }
        StreamKind::Unknown => Ok(()),
    }
}

impl Reader for OggReader {
    fn file_name(&self) -> &str {
        self.io.name()
    }

    fn container(&self) -> &'static str {
        "Ogg/OGM"
    }

    fn read_headers(&mut self) -> Result<()> {
        for stream in &mut self.streams {
            if let Some(packetizer) = &mut stream.packetizer {
                packetizer.as_dyn_mut().set_headers()?;
            }
        }
        Ok(())
    }

    fn packetizer_count(&self) -> usize {
        self.streams.iter().filter(|s| s.packetizer.is_some()).count()
    }

    fn packetizer(&self, index: usize) -> &dyn Packetizer {
        let slot = self.stream_for_packetizer(index).expect("bad index");
        self.streams[slot].packetizer.as_ref().unwrap().as_dyn()
    }

    fn packetizer_mut(&mut self, index: usize) -> &mut dyn Packetizer {
        let slot = self.stream_for_packetizer(index).expect("bad index");
        self.streams[slot].packetizer.as_mut().unwrap().as_dyn_mut()
    }

    fn read(&mut self, index: usize) -> Result<Status> {
        let slot = match self.stream_for_packetizer(index) {
            Some(slot) => slot,
            None => return Ok(Status::Done),
        };

        let queue_len = |streams: &[OggStream]| {
            streams[slot]
                .packetizer
                .as_ref()
                .unwrap()
                .as_dyn()
                .common()
                .queue
                .len()
        };

        let before = queue_len(&self.streams);
        loop {
            if !self.next_page()? {
                return Ok(Status::Done);
            }
            if queue_len(&self.streams) > before {
                return Ok(Status::MoreData);
            }
        }
    }
}
