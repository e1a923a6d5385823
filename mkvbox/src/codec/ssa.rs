//! SSA/ASS packetizer. Events become Matroska-format lines whose first field
//! is the ReadOrder key used to restore authoring order on extraction.

use crate::codec::{Frame, Packetizer, PacketizerCommon};
use crate::error::{Error, Result};
use crate::media::{codec_ids, Track};
use crate::span::Span;

/// One parsed `Dialogue:` event. The text keeps any override tags verbatim;
/// payloads are treated as UTF-8 throughout.
#[derive(Debug, Clone, PartialEq)]
pub struct SsaEvent {
    pub layer: String,
    pub style: String,
    pub name: String,
    pub margin_l: String,
    pub margin_r: String,
    pub margin_v: String,
    pub effect: String,
    pub text: String,
}

impl SsaEvent {
    /// Matroska block payload: `ReadOrder,Layer,Style,Name,MarginL,MarginR,
    /// MarginV,Effect,Text`.
    pub fn to_block(&self, read_order: u64) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{}",
            read_order,
            self.layer,
            self.style,
            self.name,
            self.margin_l,
            self.margin_r,
            self.margin_v,
            self.effect,
            self.text
        )
    }

    /// Parses a Matroska block payload back into its fields, returning the
    /// ReadOrder sort key alongside.
    pub fn from_block(line: &str) -> Result<(u64, SsaEvent)> {
        let mut fields = line.splitn(9, ',');
        let mut next = |name: &'static str| {
            fields
                .next()
                .ok_or(Error::Unsupported(format!("SSA line is missing the {name} field")))
        };

        let read_order = next("ReadOrder")?
            .trim()
            .parse::<u64>()
            .map_err(|_| Error::Unsupported("SSA ReadOrder is not a number".into()))?;

        let event = SsaEvent {
            layer: next("Layer")?.to_string(),
            style: next("Style")?.to_string(),
            name: next("Name")?.to_string(),
            margin_l: next("MarginL")?.to_string(),
            margin_r: next("MarginR")?.to_string(),
            margin_v: next("MarginV")?.to_string(),
            effect: next("Effect")?.to_string(),
            text: next("Text")?.to_string(),
        };

        Ok((read_order, event))
    }
}

pub struct SsaPacketizer {
    common: PacketizerCommon,
    header: String,
    ass: bool,
    read_order: u64,
}

impl SsaPacketizer {
    /// `header` is everything of the script up to and including the
    /// `[Events]` Format line; it becomes the codec private data.
    pub fn new(track: Track, header: String, ass: bool) -> SsaPacketizer {
        SsaPacketizer {
            common: PacketizerCommon::new(track),
            header,
            ass,
            read_order: 0,
        }
    }

    pub fn process_event(&mut self, event: &SsaEvent, timecode: i64, duration: i64) -> Result<()> {
        let line = event.to_block(self.read_order);
        self.read_order += 1;

        let frame = Frame::new(Span::from(line.into_bytes()), timecode).with_duration(duration);
        self.common.add_packet(frame)
    }
}

impl Packetizer for SsaPacketizer {
    fn common(&self) -> &PacketizerCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut PacketizerCommon {
        &mut self.common
    }

    fn set_headers(&mut self) -> Result<()> {
        self.common.track.codec_id = if self.ass {
            codec_ids::S_TEXT_ASS.into()
        } else {
            codec_ids::S_TEXT_SSA.into()
        };
        self.common.track.codec_private = Some(Span::from(self.header.clone().into_bytes()));
        self.common.track.flag_lacing = false;
        Ok(())
    }

    fn process(&mut self, frame: Frame) -> Result<()> {
        // Pre-formatted Matroska lines pass through unchanged.
        self.common.add_packet(frame)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::TrackType;

    fn event(text: &str) -> SsaEvent {
        SsaEvent {
            layer: "0".into(),
            style: "Default".into(),
            name: "".into(),
            margin_l: "0".into(),
            margin_r: "0".into(),
            margin_v: "0".into(),
            effect: "".into(),
            text: text.into(),
        }
    }

    #[test]
    fn block_round_trip_keeps_commas_in_text() {
        let original = event("Hello, world, {\\i1}again{\\i0}");
        let line = original.to_block(7);

        let (read_order, back) = SsaEvent::from_block(&line).unwrap();
        assert_eq!(read_order, 7);
        assert_eq!(back, original);
    }

    #[test]
    fn missing_fields_are_reported() {
        assert!(SsaEvent::from_block("3,0,Default").is_err());
        assert!(SsaEvent::from_block("x,0,Default,,0,0,0,,text").is_err());
    }

    #[test]
    fn read_order_increments_per_event() {
        let mut ssa = SsaPacketizer::new(
            Track::new(TrackType::Subtitle),
            "[Events]\nFormat: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\n".into(),
            true,
        );
        ssa.set_headers().unwrap();
        assert_eq!(ssa.common().track.codec_id, "S_TEXT/ASS");

        ssa.process_event(&event("one"), 0, 1_000_000_000).unwrap();
        ssa.process_event(&event("two"), 2_000_000_000, 500_000_000)
            .unwrap();

        let queue = &mut ssa.common_mut().queue;
        let first = queue.pop().unwrap();
        assert!(String::from_utf8(first.data.to_bytes()).unwrap().starts_with("0,"));
        let second = queue.pop().unwrap();
        assert!(String::from_utf8(second.data.to_bytes()).unwrap().starts_with("1,"));
        assert_eq!(second.timecode, 2_000_000_000);
        assert_eq!(second.duration, Some(500_000_000));
    }
}
