//! SSA/ASS text reader: splits the script into the header (which becomes
//! codec private data) and the `[Events]` section, parses Dialogue lines
//! according to the declared Format order and times them.

use crate::codec::ssa::{SsaEvent, SsaPacketizer};
use crate::codec::Packetizer;
use crate::error::Result;
use crate::format::{ProbeResult, Reader, SourceOptions, Status};
use crate::io::IoReader;
use crate::media::{Track, TrackType};
use crate::reader;

reader!("SSA/ASS", SsaReader::create, SsaReader::probe);

pub struct SsaReader {
    io_name: String,
    packetizer: SsaPacketizer,
    events: Vec<(i64, i64, SsaEvent)>,
    next_event: usize,
}

impl SsaReader {
    fn create(io: IoReader, options: SourceOptions) -> Result<Box<dyn Reader>> {
        Ok(Box::new(SsaReader::open(io, options)?))
    }

    fn probe(data: &[u8]) -> ProbeResult {
        let text = String::from_utf8_lossy(&data[..data.len().min(2048)]);
        if text.contains("[Script Info]") {
            ProbeResult::Yup
        } else if text.contains("[Events]") && text.contains("Dialogue:") {
            ProbeResult::Maybe(0.7)
        } else {
            ProbeResult::Unsure
        }
    }

    pub fn open(mut io: IoReader, options: SourceOptions) -> Result<SsaReader> {
        let io_name = io.name().to_string();
        let raw = io.read_vec(io.size() as usize)?;
        let text = String::from_utf8_lossy(&raw).into_owned();

        let ass = text.contains("[V4+ Styles]") || io_name.to_ascii_lowercase().ends_with(".ass");

        let mut header = String::new();
        let mut format: Vec<String> = Vec::new();
        let mut in_events = false;
        let mut events = Vec::new();

        for line in text.lines() {
            let trimmed = line.trim_end_matches('\r');

            if trimmed.trim().eq_ignore_ascii_case("[events]") {
                in_events = true;
                header.push_str(trimmed);
                header.push('\n');
                continue;
            }

            if !in_events {
                header.push_str(trimmed);
                header.push('\n');
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix("Format:") {
                format = rest.split(',').map(|f| f.trim().to_string()).collect();
                header.push_str(trimmed);
                header.push('\n');
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix("Dialogue:") {
                match parse_dialogue(rest, &format) {
                    Some(event) => events.push(event),
                    None => options.warnings.warn(format!(
                        "{io_name}: malformed Dialogue line skipped: {trimmed}"
                    )),
                }
            }
        }

        if events.is_empty() && format.is_empty() {
            return Err(io.invalid("SSA/ASS", 0, "no [Events] Format line found"));
        }

        let mut packetizer = SsaPacketizer::new(Track::new(TrackType::Subtitle), header, ass);
        options.apply(0, &mut packetizer);

        Ok(SsaReader {
            io_name,
            packetizer,
            events,
            next_event: 0,
        })
    }
}

/// `H:MM:SS.cc` with centisecond precision.
fn parse_ssa_time(text: &str) -> Option<i64> {
    let mut pieces = text.trim().split(':');
    let hours: i64 = pieces.next()?.parse().ok()?;
    let minutes: i64 = pieces.next()?.parse().ok()?;
    let seconds_part = pieces.next()?;
    let (seconds, centis) = seconds_part.split_once('.')?;
    let seconds: i64 = seconds.parse().ok()?;
    let centis: i64 = centis.parse().ok()?;

    Some((((hours * 60 + minutes) * 60 + seconds) * 100 + centis) * 10_000_000)
}

fn parse_dialogue(rest: &str, format: &[String]) -> Option<(i64, i64, SsaEvent)> {
    let field_count = if format.is_empty() { 10 } else { format.len() };
    let fields: Vec<&str> = rest.trim().splitn(field_count, ',').collect();
    if fields.len() < field_count {
        return None;
    }

    let position = |name: &str, fallback: usize| -> usize {
        format
            .iter()
            .position(|f| f.eq_ignore_ascii_case(name))
            .unwrap_or(fallback)
    };

    let start = parse_ssa_time(fields.get(position("Start", 1)).copied()?)?;
    let end = parse_ssa_time(fields.get(position("End", 2)).copied()?)?;
    if end < start {
        return None;
    }

    let field = |name: &str, fallback: usize| -> String {
        fields
            .get(position(name, fallback))
            .map(|f| f.trim().to_string())
            .unwrap_or_default()
    };

    let event = SsaEvent {
        // SSA "Marked" and ASS "Layer" share the first column.
        layer: fields
            .first()
            .map(|f| f.trim().trim_start_matches("Marked=").to_string())
            .unwrap_or_default(),
        style: field("Style", 3),
        name: field("Name", 4),
        margin_l: field("MarginL", 5),
        margin_r: field("MarginR", 6),
        margin_v: field("MarginV", 7),
        effect: field("Effect", 8),
        text: fields.last().map(|f| f.to_string()).unwrap_or_default(),
    };

    Some((start, end - start, event))
}

impl Reader for SsaReader {
    fn file_name(&self) -> &str {
        &self.io_name
    }

    fn container(&self) -> &'static str {
        "SSA/ASS"
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
        let Some((start, duration, event)) = self.events.get(self.next_event).cloned() else {
            return Ok(Status::Done);
        };
        self.next_event += 1;

        self.packetizer.process_event(&event, start, duration)?;
        Ok(Status::MoreData)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SCRIPT: &str = "\
[Script Info]
Title: test
ScriptType: v4.00+

[V4+ Styles]
Format: Name, Fontname
Style: Default,Arial

[Events]
Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text
Dialogue: 0,0:00:01.00,0:00:03.50,Default,,0,0,0,,Hello, world
Dialogue: 0,0:00:04.00,0:00:05.00,Default,,0,0,0,,{\\i1}Second{\\i0}
";

    #[test]
    fn times_parse_with_centiseconds() {
        assert_eq!(parse_ssa_time("0:00:01.00"), Some(1_000_000_000));
        assert_eq!(parse_ssa_time("1:02:03.45"), Some(3_723_450_000_000));
        assert_eq!(parse_ssa_time("bogus"), None);
    }

    #[test]
    fn script_is_split_into_header_and_events() {
        let io = IoReader::from_memory("test.ass", SCRIPT.as_bytes().to_vec());
        let mut reader = SsaReader::open(io, SourceOptions::default()).unwrap();
        reader.read_headers().unwrap();

        let track = &reader.packetizer.common().track;
        assert_eq!(track.codec_id, "S_TEXT/ASS");
        let private = String::from_utf8(
            track.codec_private.as_ref().unwrap().to_bytes(),
        )
        .unwrap();
        assert!(private.contains("[Script Info]"));
        assert!(private.contains("Format: Layer"));
        assert!(!private.contains("Dialogue:"));

        assert_eq!(reader.read(0).unwrap(), Status::MoreData);
        assert_eq!(reader.read(0).unwrap(), Status::MoreData);
        assert_eq!(reader.read(0).unwrap(), Status::Done);

        let queue = &mut reader.packetizer_mut(0).common_mut().queue;
        let first = queue.pop().unwrap();
        assert_eq!(first.timecode, 1_000_000_000);
        assert_eq!(first.duration, Some(2_500_000_000));

        let line = String::from_utf8(first.data.to_bytes()).unwrap();
        // ReadOrder, Layer, Style ... with the commas of the text intact.
        assert!(line.starts_with("0,0,Default"));
        assert!(line.ends_with("Hello, world"));
    }

    #[test]
    fn probe_accepts_script_info() {
        assert_eq!(SsaReader::probe(SCRIPT.as_bytes()), ProbeResult::Yup);
        assert_eq!(SsaReader::probe(b"not a script"), ProbeResult::Unsure);
    }
}
