//! WAV sink: a placeholder RIFF/WAVE header up front, the real lengths
//! patched in once the stream is done.

use std::io::SeekFrom;

use crate::error::Result;
use crate::extract::{Output, Sink, SinkFrame};
use crate::media::Track;

pub struct WavSink {
    out: Output,
    bytes_written: u64,
}

impl WavSink {
    pub fn new(path: &str) -> WavSink {
        WavSink {
            out: Output::new(path),
            bytes_written: 0,
        }
    }

    #[cfg(test)]
    pub fn memory() -> WavSink {
        WavSink {
            out: Output::memory(),
            bytes_written: 0,
        }
    }

    #[cfg(test)]
    pub fn into_bytes(self) -> Vec<u8> {
        self.out.into_writer().unwrap().into_memory().unwrap()
    }
}

impl Sink for WavSink {
    fn create_file(&mut self, track: &Track) -> Result<()> {
        let (sample_rate, channels, bits) = track
            .audio
            .as_ref()
            .map(|a| (a.sample_rate as u32, a.channels as u16, a.bit_depth.unwrap_or(16) as u16))
            .unwrap_or((44100, 2, 16));

        let block_align = channels * bits / 8;

        let out = self.out.get()?;
        out.write_all(b"RIFF")?;
        out.write_u32_le(0)?; // patched on finish
        out.write_all(b"WAVE")?;
        out.write_all(b"fmt ")?;
        out.write_u32_le(16)?;
        out.write_u16_le(1)?; // PCM
        out.write_u16_le(channels)?;
        out.write_u32_le(sample_rate)?;
        out.write_u32_le(sample_rate * block_align as u32)?;
        out.write_u16_le(block_align)?;
        out.write_u16_le(bits)?;
        out.write_all(b"data")?;
        out.write_u32_le(0)?; // patched on finish
        Ok(())
    }

    fn handle_frame(&mut self, frame: &SinkFrame) -> Result<()> {
        self.out.get()?.write_span(&frame.data)?;
        self.bytes_written += frame.data.len() as u64;
        Ok(())
    }

    fn finish_file(&mut self) -> Result<()> {
        let bytes_written = self.bytes_written;
        let out = self.out.get()?;
        let end = out.tell()?;

        out.seek(SeekFrom::Start(4))?;
        out.write_u32_le(36 + bytes_written as u32)?;
        out.seek(SeekFrom::Start(40))?;
        out.write_u32_le(bytes_written as u32)?;

        out.seek(SeekFrom::Start(end))?;
        out.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::{AudioParams, TrackType};
    use crate::span::Span;

    #[test]
    fn header_lengths_are_patched() {
        let mut track = Track::new(TrackType::Audio);
        track.audio = Some(AudioParams {
            sample_rate: 8000.0,
            channels: 1,
            bit_depth: Some(16),
        });

        let mut sink = WavSink::memory();
        sink.create_file(&track).unwrap();
        sink.handle_frame(&SinkFrame {
            data: Span::from(vec![0u8; 100]),
            additions: Vec::new(),
            timecode: 0,
            duration: None,
            bref: 0,
            fref: 0,
            keyframe: true,
            discardable: false,
            references_valid: false,
            codec_state: None,
        })
        .unwrap();
        sink.finish_file().unwrap();

        let bytes = sink.into_bytes();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 136);
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes(bytes[40..44].try_into().unwrap()), 100);
        assert_eq!(bytes.len(), 144);
    }
}
