//! Track extraction: the inverse of the packetizers. A per-codec sink gets
//! every frame of its track and writes a proper container or elementary
//! stream around it.

pub mod avc;
pub mod avi;
pub mod caf;
pub mod ogg;
pub mod raw;
pub mod real;
pub mod srt;
pub mod ssa;
pub mod timecodes;
pub mod vobsub;
pub mod wav;

use std::collections::HashMap;

use crate::error::{Error, Result, Warnings};
use crate::format::mkv::MatroskaFile;
use crate::media::{codec_ids, Track};
use crate::span::Span;

#[derive(Clone, Default)]
pub struct ExtractOptions {
    pub warnings: Warnings,
    /// Fixed Ogg serial numbers and friends, for byte-stable output.
    pub deterministic: bool,
}

/// What to extract where.
#[derive(Clone)]
pub struct TrackSpec {
    pub track: u64,
    pub output: String,
    /// Prepend codec private data and every codec-state change to the raw
    /// bytes instead of picking a container.
    pub fullraw: bool,
}

/// One de-laced frame delivered to a sink.
#[derive(Debug, Clone)]
pub struct SinkFrame {
    pub data: Span,
    pub additions: Vec<Span>,
    pub timecode: i64,
    pub duration: Option<i64>,
    pub bref: i64,
    pub fref: i64,
    pub keyframe: bool,
    pub discardable: bool,
    pub references_valid: bool,
    pub codec_state: Option<Span>,
}

/// The per-codec demux writer.
pub trait Sink {
    fn create_file(&mut self, track: &Track) -> Result<()>;
    fn handle_frame(&mut self, frame: &SinkFrame) -> Result<()>;
    fn finish_file(&mut self) -> Result<()>;
}

/// Lazily opened sink output, so sinks can be pointed at an in-memory
/// writer in tests.
pub(crate) enum Output {
    Pending(String),
    Open(crate::io::IoWriter),
}

impl Output {
    pub fn new(path: &str) -> Output {
        Output::Pending(path.to_string())
    }

    pub fn memory() -> Output {
        Output::Open(crate::io::IoWriter::memory())
    }

    pub fn get(&mut self) -> Result<&mut crate::io::IoWriter> {
        if let Output::Pending(path) = self {
            *self = Output::Open(crate::io::IoWriter::create(path.as_str())?);
        }
        match self {
            Output::Open(writer) => Ok(writer),
            Output::Pending(_) => unreachable!(),
        }
    }

    pub fn into_writer(self) -> Option<crate::io::IoWriter> {
        match self {
            Output::Open(writer) => Some(writer),
            Output::Pending(_) => None,
        }
    }
}

/// Picks the sink for a track's codec.
pub fn new_sink(
    track: &Track,
    spec: &TrackSpec,
    options: &ExtractOptions,
) -> Result<Box<dyn Sink>> {
    if spec.fullraw {
        return Ok(Box::new(raw::RawSink::new(&spec.output, true)));
    }

    let codec_id = track.codec_id.as_str();

    let sink: Box<dyn Sink> = if crate::codec::aac::parse_codec_id(codec_id).is_some()
        || codec_id == "A_AAC"
    {
        Box::new(raw::AdtsSink::new(&spec.output))
    } else if matches!(
        codec_id,
        codec_ids::A_VORBIS | codec_ids::V_THEORA | codec_ids::S_KATE
    ) {
        Box::new(ogg::OggSink::new(&spec.output, options.deterministic))
    } else if codec_id == codec_ids::A_ALAC {
        Box::new(caf::CafSink::new(&spec.output))
    } else if codec_id == codec_ids::A_PCM {
        Box::new(wav::WavSink::new(&spec.output))
    } else if codec_id == codec_ids::S_TEXT_UTF8 {
        Box::new(srt::SrtSink::new(&spec.output))
    } else if matches!(codec_id, codec_ids::S_TEXT_SSA | codec_ids::S_TEXT_ASS) {
        Box::new(ssa::SsaSink::new(&spec.output))
    } else if codec_id == codec_ids::S_VOBSUB {
        Box::new(vobsub::VobsubSink::new(&spec.output))
    } else if codec_id == codec_ids::V_MPEG4_AVC {
        Box::new(avc::AvcSink::new(&spec.output, false))
    } else if codec_id == codec_ids::V_MPEGH_HEVC {
        Box::new(avc::AvcSink::new(&spec.output, true))
    } else if codec_id.starts_with(codec_ids::V_REAL_PREFIX)
        || codec_id.starts_with(codec_ids::A_REAL_PREFIX)
    {
        Box::new(real::RealSink::new(&spec.output))
    } else if codec_id.starts_with("V_MS/VFW/FOURCC") {
        Box::new(avi::AviSink::new(&spec.output))
    } else {
        Box::new(raw::RawSink::new(&spec.output, false))
    };

    Ok(sink)
}

/// Extracts the requested tracks from an opened Matroska file.
pub fn extract_tracks(
    mkv: &mut MatroskaFile,
    specs: &[TrackSpec],
    options: &ExtractOptions,
) -> Result<()> {
    let mut sinks: HashMap<u64, Box<dyn Sink>> = HashMap::new();

    for spec in specs {
        let track = mkv.track(spec.track).ok_or_else(|| {
            Error::Config(format!(
                "{}: there is no track with the ID {}",
                mkv.file_name(),
                spec.track
            ))
        })?;

        let mut sink = new_sink(track, spec, options)?;
        sink.create_file(track)?;
        sinks.insert(spec.track, sink);
    }

    while let Some(block) = mkv.next_block()? {
        let Some(sink) = sinks.get_mut(&block.track) else {
            continue;
        };
        let track = mkv
            .track(block.track)
            .ok_or_else(|| crate::internal_error!("block for unknown track {}", block.track))?;

        let frame_count = block.frames.len().max(1) as i64;
        let per_frame_duration = block.duration.map(|d| d / frame_count);

        for (index, raw_frame) in block.frames.iter().enumerate() {
            let data = track.decode_block(raw_frame.clone())?;

            let frame = SinkFrame {
                data,
                additions: block.additions.clone(),
                timecode: block.timecode
                    + index as i64 * per_frame_duration.unwrap_or(0),
                duration: per_frame_duration,
                bref: block.bref,
                fref: block.fref,
                keyframe: block.keyframe,
                discardable: block.discardable,
                references_valid: block.references_valid,
                codec_state: block.codec_state.clone(),
            };
            sink.handle_frame(&frame)?;
        }
    }

    for (_, sink) in sinks.iter_mut() {
        sink.finish_file()?;
    }
    Ok(())
}

/// Formats a nanosecond timecode as `HH:MM:SS,mmm` (SRT style) or with the
/// given separator before the milliseconds.
pub fn format_timecode(timecode_ns: i64, separator: char) -> String {
    let total_ms = timecode_ns / 1_000_000;
    let ms = total_ms % 1000;
    let seconds = (total_ms / 1000) % 60;
    let minutes = (total_ms / 60_000) % 60;
    let hours = total_ms / 3_600_000;

    format!("{hours:02}:{minutes:02}:{seconds:02}{separator}{ms:03}")
}
