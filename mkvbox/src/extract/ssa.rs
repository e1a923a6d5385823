//! SSA/ASS sink: events are buffered with their ReadOrder key and written
//! in authoring order once the stream is done, after the header from the
//! codec private data.

use crate::codec::ssa::SsaEvent;
use crate::error::Result;
use crate::extract::{Output, Sink, SinkFrame};
use crate::media::Track;

const EVENTS_FORMAT: &str =
    "Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text";

pub struct SsaSink {
    out: Output,
    events: Vec<(u64, String)>,
    header_has_events_section: bool,
}

impl SsaSink {
    pub fn new(path: &str) -> SsaSink {
        SsaSink {
            out: Output::new(path),
            events: Vec::new(),
            header_has_events_section: false,
        }
    }

    #[cfg(test)]
    pub fn memory() -> SsaSink {
        SsaSink {
            out: Output::memory(),
            events: Vec::new(),
            header_has_events_section: false,
        }
    }

    #[cfg(test)]
    pub fn into_bytes(self) -> Vec<u8> {
        self.out.into_writer().unwrap().into_memory().unwrap()
    }
}

/// `H:MM:SS.cc`, the script time format.
fn format_ssa_time(timecode_ns: i64) -> String {
    let total_cs = timecode_ns / 10_000_000;
    let cs = total_cs % 100;
    let seconds = (total_cs / 100) % 60;
    let minutes = (total_cs / 6_000) % 60;
    let hours = total_cs / 360_000;

    format!("{hours}:{minutes:02}:{seconds:02}.{cs:02}")
}

impl Sink for SsaSink {
    fn create_file(&mut self, track: &Track) -> Result<()> {
        let out = self.out.get()?;

        if let Some(private) = &track.codec_private {
            let header = String::from_utf8_lossy(&private.to_slice()).into_owned();
            self.header_has_events_section = header.to_ascii_lowercase().contains("[events]");

            out.write_all(header.trim_end_matches('\n').as_bytes())?;
            out.write_all(b"\n")?;
        }

        if !self.header_has_events_section {
            out.write_all(b"[Events]\n")?;
            out.write_all(EVENTS_FORMAT.as_bytes())?;
            out.write_all(b"\n")?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: &SinkFrame) -> Result<()> {
        let line = String::from_utf8_lossy(&frame.data.to_slice()).into_owned();
        let (read_order, event) = match SsaEvent::from_block(&line) {
            Ok(parsed) => parsed,
            Err(error) => {
                log::warn!("malformed SSA line skipped: {error}");
                return Ok(());
            }
        };

        let end = frame.timecode + frame.duration.unwrap_or(0);
        let dialogue = format!(
            "Dialogue: {},{},{},{},{},{},{},{},{},{}",
            event.layer,
            format_ssa_time(frame.timecode),
            format_ssa_time(end),
            event.style,
            event.name,
            event.margin_l,
            event.margin_r,
            event.margin_v,
            event.effect,
            event.text
        );

        self.events.push((read_order, dialogue));
        Ok(())
    }

    fn finish_file(&mut self) -> Result<()> {
        // ReadOrder is the presentation-independent authoring order.
        self.events.sort_by_key(|(read_order, _)| *read_order);

        let out = self.out.get()?;
        for (_, line) in &self.events {
            out.write_all(line.as_bytes())?;
            out.write_all(b"\n")?;
        }
        out.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::TrackType;
    use crate::span::Span;

    fn frame(line: &str, timecode: i64, duration: i64) -> SinkFrame {
        SinkFrame {
            data: Span::from(line.as_bytes().to_vec()),
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
    fn out_of_order_read_order_is_restored() {
        let mut track = Track::new(TrackType::Subtitle);
        track.codec_private = Some(Span::from(
            b"[Script Info]\nTitle: t\n\n[Events]\nFormat: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\n".to_vec(),
        ));

        let mut sink = SsaSink::memory();
        sink.create_file(&track).unwrap();

        // Packets arrive in ReadOrder 3, 1, 2, 4, 0.
        for (order, time) in [(3u64, 30), (1, 10), (2, 20), (4, 40), (0, 0)] {
            let line = format!("{order},0,Default,,0,0,0,,line {order}");
            sink.handle_frame(&frame(&line, time * 1_000_000_000, 1_000_000_000))
                .unwrap();
        }
        sink.finish_file().unwrap();

        let text = String::from_utf8(sink.into_bytes()).unwrap();

        // The Format line precedes the first event, events come sorted.
        let format_pos = text.find("Format: Layer").unwrap();
        let first_event = text.find("Dialogue:").unwrap();
        assert!(format_pos < first_event);

        let order: Vec<usize> = (0..5)
            .map(|i| text.find(&format!("line {i}")).unwrap())
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn times_use_centiseconds() {
        assert_eq!(format_ssa_time(0), "0:00:00.00");
        assert_eq!(format_ssa_time(3_723_450_000_000), "1:02:03.45");
    }
}
