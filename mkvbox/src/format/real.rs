//! RealMedia (RMFF) reader: .RMF/PROP/MDPR/DATA chunk walk, stream setup
//! from the media-properties type-specific data, and packet delivery with
//! the keyframe flag from the packet header.

use std::io::SeekFrom;

use crate::codec::passthrough::{AudioPacketizer, VideoPacketizer};
use crate::codec::{Frame, Packetizer};
use crate::error::Result;
use crate::format::{ProbeResult, Reader, SourceOptions, Status};
use crate::io::{get_u16_be, get_u32_be, IoReader};
use crate::media::{AudioParams, Track, TrackType, VideoParams};
use crate::reader;
use crate::span::Span;

reader!("RealMedia", RealReader::create, RealReader::probe);

const PACKET_FLAG_KEYFRAME: u8 = 0x02;

struct RealStream {
    stream_number: u16,
    packetizer: Option<Box<dyn Packetizer>>,
}

pub struct RealReader {
    io: IoReader,
    streams: Vec<RealStream>,
    data_pos: u64,
    data_end: u64,
    position: u64,
}

impl RealReader {
    fn create(io: IoReader, options: SourceOptions) -> Result<Box<dyn Reader>> {
        Ok(Box::new(RealReader::open(io, options)?))
    }

    fn probe(data: &[u8]) -> ProbeResult {
        if data.starts_with(b".RMF") {
            ProbeResult::Yup
        } else {
            ProbeResult::Unsure
        }
    }

    pub fn open(mut io: IoReader, options: SourceOptions) -> Result<RealReader> {
        let head = io.read_vec(4)?;
        if &head != b".RMF" {
            return Err(io.invalid("RealMedia", 0, "missing .RMF file header"));
        }
        let header_size = io.read_u32_be()? as u64;
        io.seek(SeekFrom::Start(header_size.max(8)))?;

        let mut streams: Vec<RealStream> = Vec::new();
        let mut data = None;
        let file_size = io.size();

        loop {
            let chunk_pos = io.tell()?;
            if chunk_pos + 10 > file_size {
                break;
            }
            let mut chunk_type = [0u8; 4];
            io.read_exact(&mut chunk_type)?;
            let chunk_size = (io.read_u32_be()? as u64).max(10);
            let next = chunk_pos + chunk_size;

            match &chunk_type {
                b"MDPR" => {
                    let body = io.read_vec((chunk_size - 8) as usize)?;
                    if let Some(stream) = parse_mdpr(&body, streams.len(), &options) {
                        streams.push(stream);
                    }
                }
                b"DATA" => {
                    // object version, then packet count and the next-header
                    // offset.
                    data = Some((chunk_pos + 18, next));
                    break;
                }
                _ => {}
            }
            io.seek(SeekFrom::Start(next))?;
        }

        let (data_pos, data_end) =
            data.ok_or_else(|| io.invalid("RealMedia", 8, "no DATA chunk found"))?;

        Ok(RealReader {
            io,
            streams,
            data_pos,
            data_end: data_end.min(file_size),
            position: data_pos,
        })
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

/// Media properties: stream number, bit rates, names, then the
/// type-specific data holding the actual codec setup.
fn parse_mdpr(body: &[u8], index: usize, options: &SourceOptions) -> Option<RealStream> {
    if body.len() < 40 {
        return None;
    }

    let _object_version = get_u16_be(&body[0..]);
    let stream_number = get_u16_be(&body[2..]);
    let mut pos = 2 + 2 + 4 * 7; // bit rates, packet sizes, times

    let name_len = *body.get(pos)? as usize;
    pos += 1 + name_len;
    let mime_len = *body.get(pos)? as usize;
    let mime = String::from_utf8_lossy(body.get(pos + 1..pos + 1 + mime_len)?).into_owned();
    pos += 1 + mime_len;

    let type_specific_len = get_u32_be(body.get(pos..pos + 4)?) as usize;
    pos += 4;
    let type_specific = body.get(pos..pos + type_specific_len)?.to_vec();

    let mut stream = RealStream {
        stream_number,
        packetizer: None,
    };

    if mime.contains("video") && type_specific.len() >= 34 {
        // The RealVideo type-specific data: size, 'VIDO', codec fourcc,
        // width, height, then codec-dependent fields.
        let fourcc = &type_specific[8..12];
        let width = get_u16_be(&type_specific[12..]) as u64;
        let height = get_u16_be(&type_specific[14..]) as u64;

        let mut track = Track::new(TrackType::Video);
        track.codec_id = format!("V_REAL/{}", String::from_utf8_lossy(fourcc));
        track.codec_private = Some(Span::from(type_specific));
        track.video = Some(VideoParams {
            pixel_width: width,
            pixel_height: height,
            ..VideoParams::default()
        });

        let mut packetizer = Box::new(VideoPacketizer::new(track));
        options.apply(index, packetizer.as_mut());
        stream.packetizer = Some(packetizer);
    } else if mime.contains("audio") && type_specific.len() >= 6 {
        // RealAudio type-specific data starts with '.ra' 0xfd and a
        // version; the fields we need sit at version-dependent offsets.
        let version = get_u16_be(&type_specific[4..]);
        let (sample_rate, channels, fourcc) = if version == 5 && type_specific.len() >= 70 {
            (
                get_u16_be(&type_specific[48..]) as f64,
                get_u16_be(&type_specific[54..]) as u64,
                type_specific[66..70].to_vec(),
            )
        } else {
            (8000.0, 1, b"lpcJ".to_vec())
        };

        let mut track = Track::new(TrackType::Audio);
        track.codec_id = format!("A_REAL/{}", String::from_utf8_lossy(&fourcc));
        track.codec_private = Some(Span::from(type_specific));
        track.audio = Some(AudioParams {
            sample_rate,
            channels,
            bit_depth: None,
        });

        let mut packetizer = Box::new(AudioPacketizer::new(track, 256));
        options.apply(index, packetizer.as_mut());
        stream.packetizer = Some(packetizer);
    } else {
        options.warnings.warn(format!(
            "RealMedia stream {stream_number} with MIME type '{mime}' is not supported, \
             skipping"
        ));
    }

    Some(stream)
}

impl Reader for RealReader {
    fn file_name(&self) -> &str {
        self.io.name()
    }

    fn container(&self) -> &'static str {
        "RealMedia"
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

        loop {
            if self.position + 12 > self.data_end {
                return Ok(Status::Done);
            }

            // Media packet header, object version 0: version, length,
            // stream number, timestamp, packet group, flags.
            self.io.seek(SeekFrom::Start(self.position))?;
            let _version = self.io.read_u16_be()?;
            let length = self.io.read_u16_be()? as u64;
            let stream_number = self.io.read_u16_be()?;
            let timestamp_ms = self.io.read_u32_be()? as i64;
            let _packet_group = self.io.read_u8()?;
            let flags = self.io.read_u8()?;

            if length < 12 {
                return Ok(Status::Done);
            }
            let payload = self.io.read_vec((length - 12) as usize)?;
            self.position += length;

            let slot = self
                .streams
                .iter()
                .position(|s| s.stream_number == stream_number);
            let Some(slot) = slot else { continue };

            let Some(packetizer) = self.streams[slot].packetizer.as_mut() else {
                continue;
            };
            let is_video = packetizer.common().track.track_type == Some(TrackType::Video);

            let mut frame = Frame::new(payload, timestamp_ms * 1_000_000);
            if is_video {
                frame = frame.keyframe(flags & PACKET_FLAG_KEYFRAME != 0);
            }
            packetizer.process(frame)?;

            if slot == wanted_slot {
                return Ok(Status::MoreData);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mdpr_video() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0u16.to_be_bytes()); // object version
        body.extend_from_slice(&5u16.to_be_bytes()); // stream number
        body.extend_from_slice(&[0u8; 28]); // rates, sizes, times
        body.push(0); // stream name
        let mime = b"video/x-pn-realvideo";
        body.push(mime.len() as u8);
        body.extend_from_slice(mime);

        let mut type_specific = Vec::new();
        type_specific.extend_from_slice(&34u32.to_be_bytes());
        type_specific.extend_from_slice(b"VIDO");
        type_specific.extend_from_slice(b"RV40");
        type_specific.extend_from_slice(&352u16.to_be_bytes());
        type_specific.extend_from_slice(&288u16.to_be_bytes());
        type_specific.extend_from_slice(&[0u8; 18]);

        body.extend_from_slice(&(type_specific.len() as u32).to_be_bytes());
        body.extend_from_slice(&type_specific);
        body
    }

    fn packet(stream: u16, timestamp: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&((12 + payload.len()) as u16).to_be_bytes());
        out.extend_from_slice(&stream.to_be_bytes());
        out.extend_from_slice(&timestamp.to_be_bytes());
        out.push(0);
        out.push(flags);
        out.extend_from_slice(payload);
        out
    }

    pub fn rmff_bytes() -> Vec<u8> {
        let mut file = Vec::new();
        file.extend_from_slice(b".RMF");
        file.extend_from_slice(&18u32.to_be_bytes());
        file.extend_from_slice(&[0u8; 10]); // version, file version, headers

        let mdpr = mdpr_video();
        file.extend_from_slice(b"MDPR");
        file.extend_from_slice(&((mdpr.len() + 8) as u32).to_be_bytes());
        file.extend_from_slice(&mdpr);

        let packets = [
            packet(5, 0, PACKET_FLAG_KEYFRAME, &[1u8; 16]),
            packet(5, 40, 0, &[2u8; 16]),
        ];
        let data_len: usize = packets.iter().map(|p| p.len()).sum();

        file.extend_from_slice(b"DATA");
        file.extend_from_slice(&((18 + data_len) as u32).to_be_bytes());
        file.extend_from_slice(&0u16.to_be_bytes()); // object version
        file.extend_from_slice(&2u32.to_be_bytes()); // packet count
        file.extend_from_slice(&0u32.to_be_bytes()); // next data header
        for packet in &packets {
            file.extend_from_slice(packet);
        }
        file
    }

    #[test]
    fn rmff_video_stream_is_read() {
        let io = IoReader::from_memory("test.rm", rmff_bytes());
        let mut reader = RealReader::open(io, SourceOptions::default()).unwrap();
        reader.read_headers().unwrap();

        assert_eq!(reader.packetizer_count(), 1);
        let track = &reader.packetizer(0).common().track;
        assert_eq!(track.codec_id, "V_REAL/RV40");
        assert_eq!(track.video.as_ref().unwrap().pixel_width, 352);

        assert_eq!(reader.read(0).unwrap(), Status::MoreData);
        assert_eq!(reader.read(0).unwrap(), Status::MoreData);
        assert_eq!(reader.read(0).unwrap(), Status::Done);

        let queue = &mut reader.packetizer_mut(0).common_mut().queue;
        let first = queue.pop().unwrap();
        assert_eq!(first.timecode, 0);
        assert!(first.keyframe);
        let second = queue.pop().unwrap();
        assert_eq!(second.timecode, 40_000_000);
        assert!(!second.keyframe);
    }

    #[test]
    fn probe_needs_the_rmf_magic() {
        assert_eq!(RealReader::probe(&rmff_bytes()), ProbeResult::Yup);
        assert_eq!(RealReader::probe(b"RIFF"), ProbeResult::Unsure);
    }
}
