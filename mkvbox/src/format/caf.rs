//! CoreAudio (CAF) reader for ALAC tracks: chunk walk, magic-cookie
//! extraction and packet-table-driven frame delivery.

use std::io::SeekFrom;

use crate::codec::alac::AlacPacketizer;
use crate::codec::{Frame, Packetizer};
use crate::error::{Error, Result};
use crate::format::{ProbeResult, Reader, SourceOptions, Status};
use crate::io::IoReader;
use crate::media::{Track, TrackType};
use crate::reader;

reader!("CAF", CafReader::create, CafReader::probe);

#[derive(Debug, Clone, Copy)]
struct CafDescription {
    sample_rate: f64,
    format_id: [u8; 4],
    frames_per_packet: u32,
    channels: u32,
    bytes_per_packet: u32,
}

pub struct CafReader {
    io: IoReader,
    packetizer: AlacPacketizer,
    data_start: u64,
    data_end: u64,
    packet_sizes: Vec<u64>,
    next_packet: usize,
    position: u64,
    constant_packet_size: u32,
}

impl CafReader {
    fn create(io: IoReader, options: SourceOptions) -> Result<Box<dyn Reader>> {
        Ok(Box::new(CafReader::open(io, options)?))
    }

    fn probe(data: &[u8]) -> ProbeResult {
        if data.len() >= 8 && &data[0..4] == b"caff" {
            ProbeResult::Yup
        } else {
            ProbeResult::Unsure
        }
    }

    pub fn open(mut io: IoReader, options: SourceOptions) -> Result<CafReader> {
        let head = io.read_vec(8)?;
        if &head[0..4] != b"caff" {
            return Err(io.invalid("CAF", 0, "missing caff file header"));
        }

        let mut description = None;
        let mut cookie = None;
        let mut data = None;
        let mut packet_sizes = Vec::new();
        let file_size = io.size();

        loop {
            let chunk_pos = io.tell()?;
            if chunk_pos + 12 > file_size {
                break;
            }
            let mut chunk_type = [0u8; 4];
            io.read_exact(&mut chunk_type)?;
            let chunk_size = io.read_u64_be()? as i64;
            let body_start = io.tell()?;
            let known_size = if chunk_size < 0 {
                // The data chunk may carry the size-unknown sentinel.
                file_size - body_start
            } else {
                chunk_size as u64
            };

            match &chunk_type {
                b"desc" => {
                    let body = io.read_vec(32)?;
                    description = Some(CafDescription {
                        sample_rate: f64::from_be_bytes(body[0..8].try_into().unwrap()),
                        format_id: body[8..12].try_into().unwrap(),
                        bytes_per_packet: u32::from_be_bytes(body[16..20].try_into().unwrap()),
                        frames_per_packet: u32::from_be_bytes(body[20..24].try_into().unwrap()),
                        channels: u32::from_be_bytes(body[24..28].try_into().unwrap()),
                    });
                }
                b"kuki" => {
                    cookie = Some(io.read_vec(known_size as usize)?);
                }
                b"pakt" => {
                    let body = io.read_vec(known_size as usize)?;
                    packet_sizes = parse_packet_table(&body);
                }
                b"data" => {
                    // Skip the edit count; packets follow.
                    data = Some((body_start + 4, body_start + known_size));
                    if chunk_size < 0 {
                        break;
                    }
                }
                _ => {}
            }

            io.seek(SeekFrom::Start(body_start + known_size))?;
        }

        let description =
            description.ok_or_else(|| io.invalid("CAF", 8, "no desc chunk found"))?;
        if &description.format_id != b"alac" {
            return Err(Error::Unsupported(format!(
                "{}: CAF format '{}' is not supported, only ALAC is",
                io.name(),
                String::from_utf8_lossy(&description.format_id)
            )));
        }
        let cookie = cookie.ok_or_else(|| io.invalid("CAF", 8, "no kuki chunk found"))?;
        let (data_start, data_end) =
            data.ok_or_else(|| io.invalid("CAF", 8, "no data chunk found"))?;

        let mut packetizer = AlacPacketizer::new(Track::new(TrackType::Audio), &cookie)?;
        options.apply(0, &mut packetizer);

        Ok(CafReader {
            io,
            packetizer,
            data_start,
            data_end: data_end.min(file_size),
            packet_sizes,
            next_packet: 0,
            position: data_start,
            constant_packet_size: description.bytes_per_packet,
        })
    }
}

/// The pakt chunk: a 24-byte header, then one variable-length size per
/// packet (seven data bits per byte, high bit marks continuation).
fn parse_packet_table(body: &[u8]) -> Vec<u64> {
    if body.len() < 24 {
        return Vec::new();
    }
    let count = u64::from_be_bytes(body[0..8].try_into().unwrap());

    let mut sizes = Vec::new();
    let mut value = 0u64;
    for &byte in &body[24..] {
        value = (value << 7) | (byte & 0x7f) as u64;
        if byte & 0x80 == 0 {
            sizes.push(value);
            value = 0;
            if sizes.len() as u64 == count {
                break;
            }
        }
    }
    sizes
}

impl Reader for CafReader {
    fn file_name(&self) -> &str {
        self.io.name()
    }

    fn container(&self) -> &'static str {
        "CAF"
    }

    fn read_headers(&mut self) -> Result<()> {
        self.packetizer.set_headers()
    }

    fn packetizer_count(&self) -> usize {
        1
    }

    fn packetizer(&self, _index: usize) -> &dyn Packetizer {
        &self.packetizer
    }

    fn packetizer_mut(&mut self, _index: usize) -> &mut dyn Packetizer {
        &mut self.packetizer
    }

    fn read(&mut self, _index: usize) -> Result<Status> {
        if self.position >= self.data_end {
            return Ok(Status::Done);
        }

        let size = if let Some(&size) = self.packet_sizes.get(self.next_packet) {
            size
        } else if self.constant_packet_size > 0 {
            self.constant_packet_size as u64
        } else {
            return Ok(Status::Done);
        };
        self.next_packet += 1;

        let remaining = self.data_end - self.position;
        let want = size.min(remaining);
        if want == 0 {
            return Ok(Status::Done);
        }

        self.io.seek(SeekFrom::Start(self.position))?;
        let payload = self.io.read_vec(want as usize)?;
        self.position += want;

        self.packetizer.process(Frame::new(payload, -1))?;
        Ok(Status::MoreData)
    }
}
