//! WavPack reader: aggregates the per-channel-pair sub-blocks of one sample
//! run into a single Matroska-layout chunk and pairs hybrid correction data
//! from a `.wvc` sidecar as BlockAdditions.

use std::io::SeekFrom;

use crate::codec::wavpack::{stripped_header, WavpackPacketizer, WvHeader, FLAG_FINAL_BLOCK, HEADER_SIZE};
use crate::codec::{Frame, Packetizer};
use crate::error::Result;
use crate::format::{ProbeResult, Reader, SourceOptions, Status};
use crate::io::IoReader;
use crate::media::{Track, TrackType};
use crate::reader;
use crate::span::Span;

reader!("WAVPACK", WavpackReader::create, WavpackReader::probe);

pub struct WavpackReader {
    io: IoReader,
    correction: Option<IoReader>,
    packetizer: WavpackPacketizer,
    channels: u32,
}

struct BlockRun {
    header: WvHeader,
    /// `(flags, crc, data)` per sub-block.
    blocks: Vec<(u32, u32, Vec<u8>)>,
}

/// Reads sub-blocks until the final-block flag closes the channel run.
fn read_block_run(io: &mut IoReader) -> Result<Option<BlockRun>> {
    let mut blocks = Vec::new();
    let mut first_header = None;

    loop {
        let mut head = [0u8; HEADER_SIZE];
        if io.read_some(&mut head)? < HEADER_SIZE {
            return Ok(None);
        }
        let Some(header) = WvHeader::parse(&head) else {
            return Ok(None);
        };

        let data = io.read_vec(header.data_size())?;
        blocks.push((header.flags, header.crc, data));
        if first_header.is_none() {
            first_header = Some(header);
        }

        if header.flags & FLAG_FINAL_BLOCK != 0 || blocks.len() > 64 {
            break;
        }
    }

    Ok(first_header.map(|header| BlockRun { header, blocks }))
}

impl WavpackReader {
    fn create(io: IoReader, options: SourceOptions) -> Result<Box<dyn Reader>> {
        Ok(Box::new(WavpackReader::open(io, options)?))
    }

    fn probe(data: &[u8]) -> ProbeResult {
        if WvHeader::parse(data).is_some() {
            ProbeResult::Yup
        } else {
            ProbeResult::Unsure
        }
    }

    pub fn open(mut io: IoReader, options: SourceOptions) -> Result<WavpackReader> {
        let head = io.read_vec(HEADER_SIZE)?;
        let header = WvHeader::parse(&head)
            .ok_or_else(|| io.invalid("WAVPACK", 0, "not a WavPack 4 block header"))?;

        // Count channels across the first run of sub-blocks.
        io.seek(SeekFrom::Start(0))?;
        let first_run = read_block_run(&mut io)?
            .ok_or_else(|| io.invalid("WAVPACK", 0, "the file header was not read correctly"))?;
        let channels: u32 = first_run
            .blocks
            .iter()
            .map(|(flags, _, _)| {
                if flags & crate::codec::wavpack::FLAG_MONO != 0 {
                    1
                } else {
                    2
                }
            })
            .sum();
        io.seek(SeekFrom::Start(0))?;

        // Hybrid files may have a correction sidecar next to them.
        let correction = if header.is_hybrid() {
            match IoReader::open(format!("{}c", io.name())) {
                Ok(mut sidecar) => {
                    log::info!(
                        "{}: using the WAVPACK demultiplexer with a correction file",
                        io.name()
                    );
                    sidecar.seek(SeekFrom::Start(0))?;
                    Some(sidecar)
                }
                Err(_) => {
                    log::info!(
                        "{}: could not open the corresponding correction file '{}c'",
                        io.name(),
                        io.name()
                    );
                    None
                }
            }
        } else {
            None
        };

        let mut packetizer =
            WavpackPacketizer::new(Track::new(TrackType::Audio), &header, channels);
        options.apply(0, &mut packetizer);

        Ok(WavpackReader {
            io,
            correction,
            packetizer,
            channels,
        })
    }
}

/// Matroska block layout: stripped 16-byte header, then per sub-block
/// `flags, crc[, size]` (size only for more than two channels, and never on
/// the last sub-block's companion in two-channel files).
fn assemble_main(run: &BlockRun, channels: u32) -> Vec<u8> {
    let mut chunk = stripped_header(&run.header).to_vec();
    for (flags, crc, data) in &run.blocks {
        chunk.extend_from_slice(&flags.to_le_bytes());
        chunk.extend_from_slice(&crc.to_le_bytes());
        if channels > 2 {
            chunk.extend_from_slice(&(data.len() as u32).to_le_bytes());
        }
        chunk.extend_from_slice(data);
    }
    chunk
}

/// Correction data keeps only `crc[, size]` per sub-block.
fn assemble_correction(run: &BlockRun, channels: u32) -> Vec<u8> {
    let mut chunk = Vec::new();
    for (_, crc, data) in &run.blocks {
        chunk.extend_from_slice(&crc.to_le_bytes());
        if channels > 2 {
            chunk.extend_from_slice(&(data.len() as u32).to_le_bytes());
        }
        chunk.extend_from_slice(data);
    }
    chunk
}

impl Reader for WavpackReader {
    fn file_name(&self) -> &str {
        self.io.name()
    }

    fn container(&self) -> &'static str {
        "WAVPACK"
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
        let Some(run) = read_block_run(&mut self.io)? else {
            return Ok(Status::Done);
        };

        let mut frame = Frame::new(assemble_main(&run, self.channels), -1);

        // Pair a correction run with the same sample count; runs whose
        // counterpart is missing are skipped.
        if let Some(correction) = &mut self.correction {
            loop {
                match read_block_run(correction)? {
                    Some(correction_run)
                        if correction_run.header.block_samples < run.header.block_samples =>
                    {
                        continue;
                    }
                    Some(correction_run)
                        if correction_run.header.block_samples == run.header.block_samples =>
                    {
                        frame.additions = Some(Span::from(assemble_correction(
                            &correction_run,
                            self.channels,
                        )));
                        break;
                    }
                    _ => {
                        self.correction = None;
                        break;
                    }
                }
            }
        }

        self.packetizer.process(frame)?;
        Ok(Status::MoreData)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::wavpack::{FLAG_INITIAL_BLOCK, FLAG_MONO};
    use crate::io::get_u32_le;

    fn block(samples: u32, flags: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"wvpk");
        out.extend_from_slice(&((HEADER_SIZE - 8 + payload.len()) as u32).to_le_bytes());
        out.extend_from_slice(&0x0403u16.to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&(samples * 2).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&samples.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&0x12345678u32.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn multichannel_runs_are_assembled_with_prefixes() {
        // 5.1: two stereo pairs plus two mono blocks (2+2+1+1).
        let rate_flags = 9 << 23;
        let mut file = Vec::new();
        file.extend_from_slice(&block(100, rate_flags | FLAG_INITIAL_BLOCK, &[1; 10]));
        file.extend_from_slice(&block(100, rate_flags, &[2; 10]));
        file.extend_from_slice(&block(100, rate_flags | FLAG_MONO, &[3; 6]));
        file.extend_from_slice(&block(
            100,
            rate_flags | FLAG_MONO | FLAG_FINAL_BLOCK,
            &[4; 6],
        ));

        let io = IoReader::from_memory("surround.wv", file);
        let mut reader = WavpackReader::open(io, SourceOptions::default()).unwrap();
        reader.read_headers().unwrap();

        assert_eq!(reader.channels, 6);
        assert_eq!(
            reader.packetizer.common().track.audio.as_ref().unwrap().channels,
            6
        );

        assert_eq!(reader.read(0).unwrap(), Status::MoreData);
        assert_eq!(reader.read(0).unwrap(), Status::Done);

        let packet = reader.packetizer.common_mut().queue.pop().unwrap();
        let data = packet.data.to_bytes();

        // Stripped header, then (flags, crc, size, data) per sub-block.
        assert_eq!(get_u32_le(&data[12..]), 100); // block samples
        let first_size = get_u32_le(&data[16 + 8..]);
        assert_eq!(first_size, 10);
        let expected_len = 16 + 4 * (4 + 4 + 4) + 10 + 10 + 6 + 6;
        assert_eq!(data.len(), expected_len);
    }

    #[test]
    fn probe_needs_the_wvpk_magic() {
        let data = block(100, 9 << 23, &[0; 4]);
        assert_eq!(WavpackReader::probe(&data), ProbeResult::Yup);
        assert_eq!(WavpackReader::probe(b"wvpk"), ProbeResult::Unsure);
    }
}
