//! WAV/RIFF reader: PCM goes through as-is, MPEG layer 3 payloads are
//! framed by the audio packetizer's sample counter.

use nom::bytes::complete::tag;
use nom::number::complete::le_u32;
use nom::IResult;

use crate::codec::{passthrough::AudioPacketizer, Frame, Packetizer};
use crate::error::{Error, Result};
use crate::format::{ProbeResult, Reader, SourceOptions, Status};
use crate::io::IoReader;
use crate::media::{codec_ids, AudioParams, Track, TrackType};
use crate::reader;

reader!("WAV", WavReader::create, WavReader::probe);

const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_MPEGLAYER3: u16 = 0x0055;
const WAVE_FORMAT_AC3: u16 = 0x2000;

fn riff_header(input: &[u8]) -> IResult<&[u8], u32> {
    let (input, _) = tag(b"RIFF")(input)?;
    let (input, size) = le_u32(input)?;
    let (input, _) = tag(b"WAVE")(input)?;
    Ok((input, size))
}

#[derive(Debug, Clone, Copy)]
struct FmtChunk {
    format_tag: u16,
    channels: u16,
    sample_rate: u32,
    block_align: u16,
    bits_per_sample: u16,
}

pub struct WavReader {
    io: IoReader,
    packetizers: Vec<Box<dyn Packetizer>>,
    data_start: u64,
    data_end: u64,
    position: u64,
    /// Bytes handed over per `read` call for PCM.
    chunk_size: usize,
}

impl std::fmt::Debug for WavReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavReader").finish_non_exhaustive()
    }
}

impl WavReader {
    fn create(io: IoReader, options: SourceOptions) -> Result<Box<dyn Reader>> {
        Ok(Box::new(WavReader::open(io, options)?))
    }

    fn probe(data: &[u8]) -> ProbeResult {
        if riff_header(data).is_ok() {
            ProbeResult::Yup
        } else {
            ProbeResult::Unsure
        }
    }

    pub fn open(mut io: IoReader, options: SourceOptions) -> Result<WavReader> {
        let head = io.read_vec(12)?;
        riff_header(&head)
            .map_err(|_| io.invalid("WAV", 0, "missing RIFF/WAVE header"))?;

        let mut fmt = None;
        let mut data = None;

        loop {
            let chunk_pos = io.tell()?;
            if chunk_pos + 8 > io.size() {
                break;
            }
            let mut fourcc = [0u8; 4];
            io.read_exact(&mut fourcc)?;
            let size = io.read_u32_le()? as u64;

            match &fourcc {
                b"fmt " => {
                    if size < 16 {
                        return Err(io.invalid("WAV", chunk_pos, "fmt chunk too small"));
                    }
                    let body = io.read_vec(16)?;
                    fmt = Some(FmtChunk {
                        format_tag: u16::from_le_bytes([body[0], body[1]]),
                        channels: u16::from_le_bytes([body[2], body[3]]),
                        sample_rate: u32::from_le_bytes([body[4], body[5], body[6], body[7]]),
                        block_align: u16::from_le_bytes([body[12], body[13]]),
                        bits_per_sample: u16::from_le_bytes([body[14], body[15]]),
                    });
                    io.seek(std::io::SeekFrom::Start(chunk_pos + 8 + size + (size & 1)))?;
                }
                b"data" => {
                    data = Some((chunk_pos + 8, chunk_pos + 8 + size));
                    break;
                }
                _ => {
                    io.seek(std::io::SeekFrom::Start(chunk_pos + 8 + size + (size & 1)))?;
                }
            }
        }

        let fmt = fmt.ok_or_else(|| io.invalid("WAV", 12, "no fmt chunk found"))?;
        let (data_start, data_end) =
            data.ok_or_else(|| io.invalid("WAV", 12, "no data chunk found"))?;
        let data_end = data_end.min(io.size());

        let mut track = Track::new(TrackType::Audio);
        track.audio = Some(AudioParams {
            sample_rate: fmt.sample_rate as f64,
            channels: fmt.channels as u64,
            bit_depth: Some(fmt.bits_per_sample as u64),
        });

        let (samples_per_frame, chunk_size) = match fmt.format_tag {
            WAVE_FORMAT_PCM => {
                track.codec_id = codec_ids::A_PCM.into();
                // Half a second of audio per packet.
                let bytes_per_sample = fmt.block_align.max(1) as usize;
                let frames = (fmt.sample_rate as usize / 2).max(1);
                (frames as u64, frames * bytes_per_sample)
            }
            WAVE_FORMAT_MPEGLAYER3 => {
                track.codec_id = codec_ids::A_MPEG_L3.into();
                (1152, 0)
            }
            WAVE_FORMAT_AC3 => {
                track.codec_id = "A_AC3".into();
                (1536, 0)
            }
            other => {
                return Err(Error::Unsupported(format!(
                    "{}: WAV format tag 0x{other:04x} is not supported",
                    io.name()
                )))
            }
        };

        let mut packetizer: Box<dyn Packetizer> =
            Box::new(AudioPacketizer::new(track, samples_per_frame));
        options.apply(0, packetizer.as_mut());

        Ok(WavReader {
            io,
            packetizers: vec![packetizer],
            data_start,
            data_end,
            position: data_start,
            chunk_size,
        })
    }
}

impl Reader for WavReader {
    fn file_name(&self) -> &str {
        self.io.name()
    }

    fn container(&self) -> &'static str {
        "WAV"
    }

    fn read_headers(&mut self) -> Result<()> {
        for packetizer in &mut self.packetizers {
            packetizer.set_headers()?;
        }
        Ok(())
    }

    fn packetizer_count(&self) -> usize {
        self.packetizers.len()
    }

    fn packetizer(&self, index: usize) -> &dyn Packetizer {
        self.packetizers[index].as_ref()
    }

    fn packetizer_mut(&mut self, index: usize) -> &mut dyn Packetizer {
        self.packetizers[index].as_mut()
    }

    fn read(&mut self, _index: usize) -> Result<Status> {
        if self.position >= self.data_end {
            return Ok(Status::Done);
        }

        let remaining = (self.data_end - self.position) as usize;
        let want = if self.chunk_size > 0 {
            self.chunk_size.min(remaining)
        } else {
            // Whole remaining payload for pre-framed formats; the
            // packetizer's sample counter provides timing.
            remaining.min(64 * 1024)
        };

        self.io.seek(std::io::SeekFrom::Start(self.position))?;
        let payload = self.io.read_vec(want)?;
        self.position += want as u64;

        self.packetizers[0].process(Frame::new(payload, -1))?;
        Ok(Status::MoreData)
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use assert_matches::assert_matches;

    pub fn wav_bytes(format_tag: u16, sample_rate: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + payload.len() as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&format_tag.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes()); // channels
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * 4).to_le_bytes()); // byte rate
        out.extend_from_slice(&4u16.to_le_bytes()); // block align
        out.extend_from_slice(&16u16.to_le_bytes()); // bits
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn probe_recognizes_riff_wave() {
        let data = wav_bytes(WAVE_FORMAT_PCM, 44100, &[0u8; 8]);
        assert_eq!(WavReader::probe(&data), ProbeResult::Yup);
        assert_eq!(WavReader::probe(b"nope"), ProbeResult::Unsure);
    }

    #[test]
    fn pcm_track_is_described_and_read() {
        let payload = vec![0x11u8; 44100 * 4]; // one second
        let data = wav_bytes(WAVE_FORMAT_PCM, 44100, &payload);

        let io = IoReader::from_memory("test.wav", data);
        let mut reader = WavReader::open(io, SourceOptions::default()).unwrap();
        reader.read_headers().unwrap();

        let track = &reader.packetizer(0).common().track;
        assert_eq!(track.codec_id, "A_PCM/INT/LIT");
        assert_eq!(track.audio.as_ref().unwrap().sample_rate, 44100.0);

        // Two half-second chunks, then done.
        assert_eq!(reader.read(0).unwrap(), Status::MoreData);
        assert_eq!(reader.read(0).unwrap(), Status::MoreData);
        assert_eq!(reader.read(0).unwrap(), Status::Done);

        let queue = &mut reader.packetizer_mut(0).common_mut().queue;
        let first = queue.pop().unwrap();
        assert_eq!(first.timecode, 0);
        assert_eq!(first.data.len(), 44100 / 2 * 4);
        let second = queue.pop().unwrap();
        assert_eq!(second.timecode, 500_000_000);
    }

    #[test]
    fn unsupported_format_tag_is_reported() {
        let data = wav_bytes(0x1234, 44100, &[0u8; 4]);
        let io = IoReader::from_memory("odd.wav", data);

        assert_matches!(
            WavReader::open(io, SourceOptions::default()),
            Err(Error::Unsupported(_))
        );
    }
}
