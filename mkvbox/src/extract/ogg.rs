//! Ogg sink for Vorbis, Theora and Kate tracks. Header packets are unlaced
//! from the codec private data and flushed page-exactly: the first header
//! alone on its page, data starting on a fresh page. The final data packet
//! carries the end-of-stream flag.

use ogg::writing::{PacketWriteEndInfo, PacketWriter};

use std::fs::File;
use std::io::{self, BufWriter, Write};

use crate::codec::unlace_xiph;
use crate::codec::vorbis::IdentHeader;
use crate::error::{Error, Result};
use crate::extract::{Sink, SinkFrame};
use crate::media::{codec_ids, Track};

/// The serial used when deterministic output is requested.
pub const FIXED_SERIAL: u32 = 1_804_289_383;

enum SinkWriter {
    File(BufWriter<File>),
    Memory(Vec<u8>),
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SinkWriter::File(f) => f.write(buf),
            SinkWriter::Memory(v) => v.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SinkWriter::File(f) => f.flush(),
            SinkWriter::Memory(v) => v.flush(),
        }
    }
}

enum OggKind {
    Vorbis {
        ident: IdentHeader,
        previous_block_size: Option<u32>,
        samples: u64,
    },
    Theora {
        kfgshift: u32,
        keyframe_number: u64,
        non_keyframe_number: u64,
    },
    Kate {
        gnum: f64,
        gden: f64,
        kfgshift: u32,
    },
}

pub struct OggSink {
    path: String,
    deterministic: bool,
    writer: Option<PacketWriter<SinkWriter>>,
    serial: u32,
    kind: Option<OggKind>,
    queued: Option<(Vec<u8>, u64)>,
    memory: bool,
}

impl OggSink {
    pub fn new(path: &str, deterministic: bool) -> OggSink {
        OggSink {
            path: path.to_string(),
            deterministic,
            writer: None,
            serial: 0,
            kind: None,
            queued: None,
            memory: false,
        }
    }

    #[cfg(test)]
    pub fn memory(deterministic: bool) -> OggSink {
        let mut sink = OggSink::new("<memory>", deterministic);
        sink.memory = true;
        sink
    }

    #[cfg(test)]
    pub fn into_bytes(self) -> Vec<u8> {
        match self.writer.unwrap().into_inner() {
            SinkWriter::Memory(bytes) => bytes,
            SinkWriter::File(_) => panic!("not a memory sink"),
        }
    }

    fn writer(&mut self) -> &mut PacketWriter<SinkWriter> {
        self.writer.as_mut().expect("create_file not called")
    }

    fn write_packet(&mut self, data: Vec<u8>, info: PacketWriteEndInfo, granulepos: u64) -> Result<()> {
        let serial = self.serial;
        self.writer()
            .write_packet(data.into_boxed_slice(), serial, info, granulepos)
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))
    }

    /// Queues a data packet so the very last one can be flagged
    /// end-of-stream; the previously queued packet goes out as a normal
    /// page-packed packet.
    fn queue_packet(&mut self, data: Vec<u8>, granulepos: u64, flush_page: bool) -> Result<()> {
        if let Some((queued, queued_granule)) = self.queued.take() {
            let info = if flush_page {
                PacketWriteEndInfo::EndPage
            } else {
                PacketWriteEndInfo::NormalPacket
            };
            self.write_packet(queued, info, queued_granule)?;
        }
        self.queued = Some((data, granulepos));
        Ok(())
    }
}

impl Sink for OggSink {
    fn create_file(&mut self, track: &Track) -> Result<()> {
        let private = track.codec_private.as_ref().ok_or_else(|| {
            Error::Unsupported(format!(
                "track {} with the codec id '{}' is missing the codec private element \
                 and cannot be extracted",
                track.number, track.codec_id
            ))
        })?;

        let headers = unlace_xiph(private)?;
        if headers.is_empty() {
            return Err(Error::Unsupported(format!(
                "track {} does not contain valid headers",
                track.number
            )));
        }

        let first = headers[0].to_bytes();
        self.kind = Some(match track.codec_id.as_str() {
            codec_ids::A_VORBIS => OggKind::Vorbis {
                ident: IdentHeader::parse(&first)?,
                previous_block_size: None,
                samples: 0,
            },
            codec_ids::V_THEORA => {
                if first.len() < 42 {
                    return Err(Error::Unsupported(
                        "Theora identification header is too short".into(),
                    ));
                }
                let kfgshift =
                    (((first[40] & 0x03) as u32) << 3) | ((first[41] >> 5) as u32);
                OggKind::Theora {
                    kfgshift,
                    keyframe_number: 0,
                    non_keyframe_number: 0,
                }
            }
            codec_ids::S_KATE => {
                if first.len() < 32 {
                    return Err(Error::Unsupported(
                        "Kate identification header is too short".into(),
                    ));
                }
                OggKind::Kate {
                    gnum: crate::io::get_u32_le(&first[24..]) as f64,
                    gden: crate::io::get_u32_le(&first[28..]).max(1) as f64,
                    kfgshift: first[15] as u32,
                }
            }
            other => {
                return Err(Error::Unsupported(format!(
                    "codec id '{other}' has no Ogg mapping"
                )))
            }
        });

        self.serial = if self.deterministic {
            FIXED_SERIAL
        } else {
            rand::random::<u32>() & 0x7fff_ffff
        };

        let writer = if self.memory {
            SinkWriter::Memory(Vec::new())
        } else {
            SinkWriter::File(BufWriter::new(File::create(&self.path)?))
        };
        self.writer = Some(PacketWriter::new(writer));

        // The identification header must sit alone on the first page and
        // the data packets must start on a fresh page after the headers.
        for (index, header) in headers.iter().enumerate() {
            let info = if index == 0 || index == headers.len() - 1 {
                PacketWriteEndInfo::EndPage
            } else {
                PacketWriteEndInfo::NormalPacket
            };
            self.write_packet(header.to_bytes(), info, 0)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: &SinkFrame) -> Result<()> {
        let data = frame.data.to_bytes();

        let (granulepos, flush_page) = match self.kind.as_mut() {
            None => return Err(crate::internal_error!("Ogg sink used before create_file")),

            Some(OggKind::Vorbis {
                ident,
                previous_block_size,
                samples,
            }) => {
                // The first packet decodes no samples; each later one adds
                // the lapped-window count.
                let this_block_size = ident.packet_blocksize(&data);
                if let Some(previous) = previous_block_size {
                    *samples += (this_block_size + *previous) as u64 / 4;
                }
                *previous_block_size = Some(this_block_size);

                (*samples, false)
            }

            Some(OggKind::Theora {
                kfgshift,
                keyframe_number,
                non_keyframe_number,
            }) => {
                let keyframe = data.first().map(|b| b & 0x40 == 0).unwrap_or(false);
                if keyframe {
                    *keyframe_number += *non_keyframe_number + 1;
                    *non_keyframe_number = 0;
                } else {
                    *non_keyframe_number += 1;
                }
                let granule = (*keyframe_number << *kfgshift)
                    | (*non_keyframe_number & ((1 << *kfgshift) - 1));
                (granule, false)
            }

            Some(OggKind::Kate {
                gnum,
                gden,
                kfgshift,
            }) => {
                // The granule encodes the event's base time and the offset
                // to it, recovered from the packet's backlink field.
                let timecode_s = frame.timecode as f64 / 1_000_000_000.0;
                let backlink = if data.len() >= 1 + 3 * 8 {
                    crate::io::get_u64_le(&data[1 + 2 * 8..]) as f64 * *gden / *gnum
                } else {
                    0.0
                };
                let base = timecode_s - backlink;
                let offset = timecode_s - base;
                let g_base = (base * *gnum / *gden) as u64;
                let g_offset = (offset * *gnum / *gden) as u64;

                // Kate is a data packet per page.
                ((g_base << *kfgshift) | g_offset, true)
            }
        };

        self.queue_packet(data, granulepos, flush_page)
    }

    fn finish_file(&mut self) -> Result<()> {
        if let Some((queued, granule)) = self.queued.take() {
            self.write_packet(queued, PacketWriteEndInfo::EndStream, granule)?;
        }
        Ok(())
    }
}
