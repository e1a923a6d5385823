//! SRT sink: sequential numbering from 1, `HH:MM:SS,mmm --> HH:MM:SS,mmm`
//! ranges, a blank line after every entry.

use crate::error::Result;
use crate::extract::{format_timecode, Output, Sink, SinkFrame};
use crate::media::Track;

pub struct SrtSink {
    out: Output,
    entry: u64,
}

impl SrtSink {
    pub fn new(path: &str) -> SrtSink {
        SrtSink {
            out: Output::new(path),
            entry: 0,
        }
    }

    #[cfg(test)]
    pub fn memory() -> SrtSink {
        SrtSink {
            out: Output::memory(),
            entry: 0,
        }
    }

    #[cfg(test)]
    pub fn into_bytes(self) -> Vec<u8> {
        self.out.into_writer().unwrap().into_memory().unwrap()
    }
}

impl Sink for SrtSink {
    fn create_file(&mut self, _track: &Track) -> Result<()> {
        self.out.get()?;
        Ok(())
    }

    fn handle_frame(&mut self, frame: &SinkFrame) -> Result<()> {
        let Some(duration) = frame.duration else {
            log::warn!(
                "subtitle entry at {} has no duration, skipped",
                format_timecode(frame.timecode, ',')
            );
            return Ok(());
        };

        self.entry += 1;
        let text = String::from_utf8_lossy(&frame.data.to_slice()).into_owned();

        let block = format!(
            "{}\n{} --> {}\n{}\n\n",
            self.entry,
            format_timecode(frame.timecode, ','),
            format_timecode(frame.timecode + duration, ','),
            text.trim_end_matches(['\r', '\n'])
        );
        self.out.get()?.write_all(block.as_bytes())
    }

    fn finish_file(&mut self) -> Result<()> {
        self.out.get()?.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::TrackType;
    use crate::span::Span;

    fn entry(timecode: i64, duration: i64, text: &str) -> SinkFrame {
        SinkFrame {
            data: Span::from(text.as_bytes().to_vec()),
            additions: Vec::new(),
            timecode,
            duration: Some(duration),
            bref: 0,
            fref: 0,
            keyframe: true,
            discardable: false,
            references_valid: false,
            codec_state: None,
        }
    }

    #[test]
    fn entries_are_numbered_and_timed() {
        let mut sink = SrtSink::memory();
        sink.create_file(&Track::new(TrackType::Subtitle)).unwrap();

        sink.handle_frame(&entry(1_000_000_000, 2_000_000_000, "First line"))
            .unwrap();
        sink.handle_frame(&entry(62_500_000_000, 500_000_000, "Second"))
            .unwrap();
        sink.finish_file().unwrap();

        let text = String::from_utf8(sink.into_bytes()).unwrap();
        assert_eq!(
            text,
            "1\n00:00:01,000 --> 00:00:03,000\nFirst line\n\n\
             2\n00:01:02,500 --> 00:01:03,000\nSecond\n\n"
        );
    }
}
