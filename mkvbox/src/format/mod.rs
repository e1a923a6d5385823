//! Source-format readers. Every reader owns its input handle and the
//! packetizers it creates; the orchestrator pulls packets out through them.

pub mod avi;
pub mod caf;
pub mod es;
pub mod mkv;
pub mod ogg;
pub mod real;
pub mod ssa;
pub mod vobsub;
pub mod wav;
pub mod wavpack;

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::codec::{Packetizer, TrackSync};
use crate::error::{Error, Result, Warnings};
use crate::io::IoReader;
use crate::media::{CompressionAlgo, ContentEncoding};

/// Result of one `read` call: whether the reader can produce more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    MoreData,
    Done,
}

/// Per-source configuration handed to a reader at creation time. Track
/// indices are the reader's 0-based track ids.
#[derive(Clone, Default)]
pub struct SourceOptions {
    pub warnings: Warnings,
    pub sync: HashMap<usize, TrackSync>,
    pub languages: HashMap<usize, String>,
    pub default_track: HashMap<usize, bool>,
    /// Per-track content compression override; `None` strips any default
    /// chain the packetizer would set up.
    pub compression: HashMap<usize, Option<CompressionAlgo>>,
    /// Only these track ids are put to use; `None` uses all of them.
    pub track_filter: Option<Vec<usize>>,
    pub skip_big_vobsubs: bool,
}

impl SourceOptions {
    pub fn track_in_use(&self, index: usize) -> bool {
        match &self.track_filter {
            Some(wanted) => wanted.contains(&index),
            None => true,
        }
    }

    /// Applies the per-track overrides to a freshly created packetizer.
    pub fn apply(&self, index: usize, packetizer: &mut dyn Packetizer) {
        let common = packetizer.common_mut();
        if let Some(sync) = self.sync.get(&index) {
            common.sync = *sync;
        }
        if let Some(language) = self.languages.get(&index) {
            common.track.language = language.clone();
        }
        if let Some(default) = self.default_track.get(&index) {
            common.track.flag_default = *default;
        }
        if let Some(compression) = self.compression.get(&index) {
            common.track.encodings.clear();
            if let Some(algo) = compression {
                common.track.encodings.push(ContentEncoding {
                    order: 0,
                    scope: 1,
                    compression: *algo,
                });
            }
        }
        common.track.in_use = self.track_in_use(index);
    }
}

/// The per-source-format parser contract.
pub trait Reader {
    fn file_name(&self) -> &str;
    fn container(&self) -> &'static str;

    /// Populates tracks and invokes the packetizers' `set_headers`.
    fn read_headers(&mut self) -> Result<()>;

    fn packetizer_count(&self) -> usize;
    fn packetizer(&self, index: usize) -> &dyn Packetizer;
    fn packetizer_mut(&mut self, index: usize) -> &mut dyn Packetizer;

    /// Enqueues at least one packet into the nominated packetizer unless the
    /// end of the stream has been reached.
    fn read(&mut self, index: usize) -> Result<Status>;

    /// End of input: drain every owned packetizer's codec buffering.
    fn flush(&mut self) -> Result<()> {
        for index in 0..self.packetizer_count() {
            self.packetizer_mut(index).flush()?;
        }
        Ok(())
    }

    /// One line per container and per track, for the identify mode.
    fn identify(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "File '{}': container: {}",
            self.file_name(),
            self.container()
        )];
        for index in 0..self.packetizer_count() {
            let track = &self.packetizer(index).common().track;
            let kind = track
                .track_type
                .map(|t| t.describe())
                .unwrap_or("unknown");
            lines.push(format!(
                "Track ID {index}: {kind} ({})",
                track.codec_id
            ));
        }
        lines
    }
}

/// Registers a reader with the probe dispatch.
#[macro_export]
macro_rules! reader {
    ($name:literal, $create:expr, $probe:expr) => {
        pub const READER_META: $crate::format::ReaderMetadata = $crate::format::ReaderMetadata {
            name: $name,
            create: $create,
            probe: $probe,
        };
    };
}

#[derive(Clone)]
pub struct ReaderMetadata {
    pub name: &'static str,
    pub create: fn(IoReader, SourceOptions) -> Result<Box<dyn Reader>>,
    pub probe: fn(&[u8]) -> ProbeResult,
}

impl ReaderMetadata {
    pub fn create(&self, io: IoReader, options: SourceOptions) -> Result<Box<dyn Reader>> {
        (self.create)(io, options)
    }

    pub fn probe(&self, data: &[u8]) -> ProbeResult {
        (self.probe)(data)
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ProbeResult {
    Yup,
    Maybe(f32),
    Unsure,
}

impl PartialOrd for ProbeResult {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        use ProbeResult::*;

        let ordering = match (self, other) {
            (Yup, Yup) => Ordering::Equal,
            (Yup, _) => Ordering::Greater,
            (_, Yup) => Ordering::Less,
            (Maybe(p1), Maybe(p2)) => p1.partial_cmp(p2)?,
            (Unsure, Unsure) => Ordering::Equal,
            (Unsure, _) => Ordering::Less,
            (_, Unsure) => Ordering::Greater,
        };

        Some(ordering)
    }
}

pub fn readers() -> &'static [ReaderMetadata] {
    &[
        avi::READER_META,
        wav::READER_META,
        ogg::READER_META,
        real::READER_META,
        wavpack::READER_META,
        caf::READER_META,
        vobsub::READER_META,
        ssa::READER_META,
        es::ADTS_READER_META,
        es::AVC_READER_META,
        es::MPEG4_READER_META,
    ]
}

/// Probes the head of the file against every registered reader and opens
/// the best match.
pub fn open_reader(mut io: IoReader, options: SourceOptions) -> Result<Box<dyn Reader>> {
    let mut head = vec![0u8; 16384];
    let got = io.read_some(&mut head)?;
    head.truncate(got);
    io.seek(std::io::SeekFrom::Start(0))?;

    let best = readers()
        .iter()
        .map(|meta| (meta, meta.probe(&head)))
        .reduce(|accum, next| if accum.1 >= next.1 { accum } else { next });

    match best {
        Some((meta, result)) if result != ProbeResult::Unsure => meta.create(io, options),
        _ => Err(Error::Unsupported(format!(
            "{}: no reader recognizes this file",
            io.name()
        ))),
    }
}
