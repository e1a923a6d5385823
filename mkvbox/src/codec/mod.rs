//! Per-codec packetizers: the transformers sitting between a source reader
//! and the cluster helper.

pub mod aac;
pub mod alac;
pub mod mpeg4;
pub mod nal;
pub mod passthrough;
pub mod ssa;
pub mod vobsub;
pub mod vorbis;
pub mod wavpack;

use crate::error::Result;
use crate::media::Track;
use crate::packet::{Packet, PacketQueue, SourceId};
use crate::span::Span;

/// A raw frame handed over by a reader. A timecode of -1 asks the packetizer
/// to derive one from its codec state (sample counts, frame rates).
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Span,
    pub timecode: i64,
    pub duration: Option<i64>,
    pub bref: i64,
    pub fref: i64,
    /// `None` means the reader does not know; the frame is then treated as a
    /// key frame and `references_valid` stays unset.
    pub keyframe: Option<bool>,
    pub discardable: bool,
    pub additions: Option<Span>,
}

impl Frame {
    pub fn new(data: impl Into<Span>, timecode: i64) -> Frame {
        Frame {
            data: data.into(),
            timecode,
            duration: None,
            bref: 0,
            fref: 0,
            keyframe: None,
            discardable: false,
            additions: None,
        }
    }

    pub fn with_duration(mut self, duration: i64) -> Frame {
        self.duration = Some(duration);
        self
    }

    pub fn keyframe(mut self, key: bool) -> Frame {
        self.keyframe = Some(key);
        self
    }
}

/// Per-track audio/video displacement and linear drift correction.
#[derive(Debug, Clone, Copy)]
pub struct TrackSync {
    /// Nanoseconds added to every timecode. Packets whose adjusted timecode
    /// turns negative are dropped.
    pub displacement: i64,
    pub linear: f64,
}

impl Default for TrackSync {
    fn default() -> Self {
        TrackSync {
            displacement: 0,
            linear: 1.0,
        }
    }
}

/// Result of checking whether a packetizer can continue another one's track
/// when appending files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResult {
    Yes,
    NoFormat,
    NoParameters,
    MaybeCodecPrivate,
}

/// Cross-cutting state every packetizer carries: the track it feeds, its
/// packet queue and the free-refs watermark set by the cluster helper.
pub struct PacketizerCommon {
    pub track: Track,
    pub queue: PacketQueue,
    pub free_refs: i64,
    pub sync: TrackSync,
    pub source: SourceId,
}

impl PacketizerCommon {
    pub fn new(track: Track) -> PacketizerCommon {
        PacketizerCommon {
            track,
            queue: PacketQueue::default(),
            free_refs: -1,
            sync: TrackSync::default(),
            source: SourceId(0),
        }
    }

    /// Applies sync correction and the track's content-encoding chain, then
    /// enqueues. Reference timecodes move with the frame they point at.
    pub fn add_packet(&mut self, frame: Frame) -> Result<()> {
        let adjust = |timecode: i64| -> i64 {
            ((timecode + self.sync.displacement) as f64 * self.sync.linear) as i64
        };

        let timecode = adjust(frame.timecode);
        if timecode < 0 {
            return Ok(());
        }

        let data = self.track.encode_block(frame.data)?;

        let mut packet = Packet::new(data, timecode);
        packet.duration = frame.duration;
        packet.discardable = frame.discardable;
        packet.additions = frame.additions;
        packet.source = self.source;
        packet.track = self.track.number;

        match frame.keyframe {
            Some(key) => {
                packet.references_valid = true;
                packet.keyframe = key;
                packet.bref = if frame.bref != 0 { adjust(frame.bref) } else { 0 };
                packet.fref = if frame.fref != 0 { adjust(frame.fref) } else { 0 };
            }
            None => {
                packet.references_valid = false;
                packet.keyframe = true;
            }
        }

        self.queue.push(packet);
        Ok(())
    }
}

/// The per-codec transformer contract.
pub trait Packetizer {
    fn common(&self) -> &PacketizerCommon;
    fn common_mut(&mut self) -> &mut PacketizerCommon;

    /// Completes the track metadata (codec id, codec private, defaults).
    /// Called once after the reader has filled in what it knows.
    fn set_headers(&mut self) -> Result<()>;

    /// Transforms one raw frame and enqueues the result.
    fn process(&mut self, frame: Frame) -> Result<()>;

    /// End of input; drain any codec buffering.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn can_connect_to(&self, other: &dyn Packetizer) -> ConnectResult {
        connect_check(&self.common().track, &other.common().track)
    }
}

/// Default equivalence used when appending files: same codec, compatible
/// parameters, then the codec privates decide.
pub fn connect_check(a: &Track, b: &Track) -> ConnectResult {
    if a.codec_id != b.codec_id || a.track_type != b.track_type {
        return ConnectResult::NoFormat;
    }
    if a.audio.as_ref().map(|p| (p.sample_rate.to_bits(), p.channels))
        != b.audio.as_ref().map(|p| (p.sample_rate.to_bits(), p.channels))
    {
        return ConnectResult::NoParameters;
    }
    if a.video.as_ref().map(|p| (p.pixel_width, p.pixel_height))
        != b.video.as_ref().map(|p| (p.pixel_width, p.pixel_height))
    {
        return ConnectResult::NoParameters;
    }
    if a.codec_private != b.codec_private {
        return ConnectResult::MaybeCodecPrivate;
    }
    ConnectResult::Yes
}

/// Xiph size run: `floor(size/255)` bytes of 0xFF followed by `size % 255`.
pub fn xiph_size_run(size: usize, out: &mut Vec<u8>) {
    let mut remaining = size;
    while remaining >= 255 {
        out.push(255);
        remaining -= 255;
    }
    out.push(remaining as u8);
}

/// Laces multi-segment codec private data (Vorbis, Theora, Kate) into the
/// single buffer Matroska expects: a count byte, size runs for all but the
/// last segment, then the concatenated payloads.
pub fn lace_xiph(segments: &[Span]) -> Span {
    let mut header = Vec::new();
    header.push((segments.len() - 1) as u8);
    for segment in &segments[..segments.len() - 1] {
        xiph_size_run(segment.len(), &mut header);
    }

    let mut out = Span::from(header);
    for segment in segments {
        out.push(segment.clone());
    }
    out
}

/// Inverse of [`lace_xiph`]; the last segment's length is whatever remains.
pub fn unlace_xiph(data: &Span) -> Result<Vec<Span>> {
    let raw = data.to_slice();
    let mut pos = 0usize;

    let count = *raw
        .first()
        .ok_or_else(|| crate::internal_error!("empty Xiph lace"))? as usize
        + 1;
    pos += 1;

    let mut sizes = Vec::with_capacity(count);
    for _ in 0..count - 1 {
        let mut size = 0usize;
        loop {
            let byte = *raw
                .get(pos)
                .ok_or_else(|| crate::internal_error!("truncated Xiph lace sizes"))?;
            pos += 1;
            size += byte as usize;
            if byte != 255 {
                break;
            }
        }
        sizes.push(size);
    }

    let mut segments = Vec::with_capacity(count);
    for size in sizes {
        if pos + size > raw.len() {
            return Err(crate::internal_error!("Xiph lace overruns its buffer"));
        }
        segments.push(data.slice(pos..pos + size));
        pos += size;
    }
    segments.push(data.slice(pos..));

    Ok(segments)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::TrackType;
    use test_case::test_case;

    #[test_case(&[1, 254, 255, 600])]
    #[test_case(&[0, 0, 5])]
    #[test_case(&[30, 45, 4000])]
    fn xiph_lace_round_trip(sizes: &[usize]) {
        let segments: Vec<Span> = sizes
            .iter()
            .enumerate()
            .map(|(i, &len)| Span::from(vec![i as u8 + 1; len]))
            .collect();

        let laced = lace_xiph(&segments);
        let back = unlace_xiph(&laced).unwrap();

        assert_eq!(back.len(), segments.len());
        for (a, b) in back.iter().zip(&segments) {
            assert_eq!(a.to_bytes(), b.to_bytes());
        }
    }

    #[test]
    fn size_run_encoding() {
        let mut out = Vec::new();
        xiph_size_run(510, &mut out);
        assert_eq!(out, [255, 255, 0]);

        out.clear();
        xiph_size_run(30, &mut out);
        assert_eq!(out, [30]);
    }

    #[test]
    fn connect_check_compares_format_then_parameters() {
        use crate::media::AudioParams;

        let mut a = Track::new(TrackType::Audio);
        a.codec_id = "A_VORBIS".into();
        a.audio = Some(AudioParams {
            sample_rate: 48000.0,
            channels: 2,
            bit_depth: None,
        });
        let mut b = a.clone();

        assert_eq!(connect_check(&a, &b), ConnectResult::Yes);

        b.codec_private = Some(Span::from(vec![1u8]));
        assert_eq!(connect_check(&a, &b), ConnectResult::MaybeCodecPrivate);

        b.codec_private = None;
        b.audio.as_mut().unwrap().channels = 6;
        assert_eq!(connect_check(&a, &b), ConnectResult::NoParameters);

        b.codec_id = "A_MPEG/L3".into();
        assert_eq!(connect_check(&a, &b), ConnectResult::NoFormat);
    }

    #[test]
    fn sync_displacement_drops_early_packets() {
        let mut common = PacketizerCommon::new(Track::new(TrackType::Audio));
        common.sync.displacement = -50;

        common.add_packet(Frame::new(vec![1u8], 20)).unwrap();
        common.add_packet(Frame::new(vec![2u8], 80)).unwrap();

        assert_eq!(common.queue.len(), 1);
        assert_eq!(common.queue.smallest_timecode(), Some(30));
    }

    #[test]
    fn linear_sync_scales_timecodes_and_refs() {
        let mut common = PacketizerCommon::new(Track::new(TrackType::Video));
        common.sync.linear = 2.0;

        let mut frame = Frame::new(vec![0u8], 100).keyframe(false);
        frame.bref = 60;
        common.add_packet(frame).unwrap();

        let packet = common.queue.pop().unwrap();
        assert_eq!(packet.timecode, 200);
        assert_eq!(packet.bref, 120);
        assert!(packet.references_valid);
        assert!(!packet.keyframe);
    }
}
