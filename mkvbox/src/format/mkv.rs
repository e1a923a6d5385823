//! Matroska reader for the extract pipeline: EBML header validation,
//! segment walking, track collection and lazy cluster/block iteration with
//! lace decoding.

use aho_corasick::AhoCorasick;
use std::io::SeekFrom;

use crate::ebml::{self, ids, vint, Element, ElementSize, Next};
use crate::error::{Error, Result, Warnings};
use crate::io::IoReader;
use crate::media::Track;
use crate::span::Span;

pub fn probe(data: &[u8]) -> bool {
    let patterns = [
        &ids::EBML_HEADER.0.to_be_bytes()[..],
        b"matroska",
        &ids::SEGMENT.0.to_be_bytes()[..],
        &ids::CLUSTER.0.to_be_bytes()[..],
    ];
    let ac = AhoCorasick::new(patterns).unwrap();

    let mut score = 0u32;
    for _ in ac.find_iter(data) {
        score += 1;
    }
    score >= 3
}

/// One Block or BlockGroup, laced frames still together.
#[derive(Debug, Clone)]
pub struct BlockItem {
    pub track: u64,
    /// Nanoseconds, already scaled by the segment's timecode scale.
    pub timecode: i64,
    pub duration: Option<i64>,
    pub keyframe: bool,
    pub discardable: bool,
    pub references_valid: bool,
    pub bref: i64,
    pub fref: i64,
    pub frames: Vec<Span>,
    pub additions: Vec<Span>,
    pub codec_state: Option<Span>,
}

#[derive(Debug, Clone)]
pub struct AttachmentInfo {
    pub name: String,
    pub mime: String,
    pub data: Span,
}

struct ClusterState {
    end: Option<u64>,
    base_ticks: i64,
}

pub struct MatroskaFile {
    io: IoReader,
    pub timecode_scale: u64,
    pub duration_ticks: Option<f64>,
    pub tracks: Vec<Track>,
    pub attachments: Vec<AttachmentInfo>,
    pub has_chapters: bool,
    pub has_tags: bool,
    warnings: Warnings,
    segment_end: Option<u64>,
    cluster: Option<ClusterState>,
    finished: bool,
}

impl MatroskaFile {
    pub fn open(mut io: IoReader, warnings: Warnings) -> Result<MatroskaFile> {
        // EBML header: doc type and versions must be acceptable.
        let head = match ebml::find_next_element(&mut io, ids::ROOT, None, false)? {
            Next::Child(head) if head.id == ids::EBML_HEADER => head,
            _ => return Err(io.invalid("Matroska", 0, "no EBML header found")),
        };
        let header = ebml::read_element(&mut io, &head)?;

        let doc_type = header
            .find(ids::DOC_TYPE)
            .and_then(Element::as_str)
            .unwrap_or("matroska");
        if doc_type != "matroska" && doc_type != "webm" {
            return Err(io.invalid(
                "Matroska",
                head.position,
                format!("unsupported doc type '{doc_type}'"),
            ));
        }
        // Historical writers emitted version 0; both 0 and 1 are accepted.
        let version = header
            .find(ids::EBML_VERSION)
            .and_then(Element::as_uint)
            .unwrap_or(1);
        if version > 1 {
            return Err(io.invalid(
                "Matroska",
                head.position,
                format!("unsupported EBML version {version}"),
            ));
        }

        // Find the Segment.
        let segment = loop {
            match ebml::find_next_element(&mut io, ids::ROOT, None, false)? {
                Next::Child(head) if head.id == ids::SEGMENT => break head,
                Next::Child(head) | Next::Dummy(head) | Next::UpperLevel(head) => {
                    ebml::skip_data(&mut io, &head)?;
                }
                Next::End => {
                    return Err(io.invalid("Matroska", 0, "no Segment found"));
                }
            }
        };

        let mut file = MatroskaFile {
            io,
            timecode_scale: 1_000_000,
            duration_ticks: None,
            tracks: Vec::new(),
            attachments: Vec::new(),
            has_chapters: false,
            has_tags: false,
            warnings,
            segment_end: segment.end(),
            cluster: None,
            finished: false,
        };
        file.read_headers()?;
        Ok(file)
    }

    pub fn file_name(&self) -> &str {
        self.io.name()
    }

    pub fn track(&self, number: u64) -> Option<&Track> {
        self.tracks.iter().find(|t| t.number == number)
    }

    /// Walks segment children until the first cluster, collecting Info,
    /// Tracks and Attachments.
    fn read_headers(&mut self) -> Result<()> {
        loop {
            let next =
                ebml::find_next_element(&mut self.io, ids::SEGMENT, self.segment_end, false)?;
            let head = match next {
                Next::Child(head) => head,
                Next::Dummy(head) | Next::UpperLevel(head) => {
                    ebml::skip_data(&mut self.io, &head)?;
                    continue;
                }
                Next::End => {
                    self.finished = true;
                    return Ok(());
                }
            };

            match head.id {
                ids::INFO => {
                    let info = ebml::read_element(&mut self.io, &head)?;
                    if let Some(scale) =
                        info.find(ids::TIMECODE_SCALE).and_then(Element::as_uint)
                    {
                        self.timecode_scale = scale.max(1);
                    }
                    self.duration_ticks =
                        info.find(ids::DURATION).and_then(Element::as_float);
                }
                ids::TRACKS => {
                    let tracks = ebml::read_element(&mut self.io, &head)?;
                    for entry in tracks.children().unwrap_or(&[]) {
                        if entry.id != ids::TRACK_ENTRY {
                            continue;
                        }
                        match Track::from_entry(entry, self.io.name()) {
                            Ok(track) => self.tracks.push(track),
                            Err(error) => self
                                .warnings
                                .warn(format!("ignoring track: {error}")),
                        }
                    }
                }
                ids::ATTACHMENTS => {
                    let attachments = ebml::read_element(&mut self.io, &head)?;
                    for file in attachments.children().unwrap_or(&[]) {
                        if file.id != ids::ATTACHED_FILE {
                            continue;
                        }
                        self.attachments.push(AttachmentInfo {
                            name: file
                                .find(ids::FILE_NAME)
                                .and_then(Element::as_str)
                                .unwrap_or("")
                                .to_string(),
                            mime: file
                                .find(ids::FILE_MIME_TYPE)
                                .and_then(Element::as_str)
                                .unwrap_or("")
                                .to_string(),
                            data: file
                                .find(ids::FILE_DATA)
                                .and_then(Element::as_binary)
                                .cloned()
                                .unwrap_or_default(),
                        });
                    }
                }
                ids::CHAPTERS => {
                    self.has_chapters = true;
                    ebml::skip_data(&mut self.io, &head)?;
                }
                ids::TAGS => {
                    self.has_tags = true;
                    ebml::skip_data(&mut self.io, &head)?;
                }
                ids::CLUSTER => {
                    self.enter_cluster(&head)?;
                    return Ok(());
                }
                _ => ebml::skip_data(&mut self.io, &head)?,
            }
        }
    }

    fn enter_cluster(&mut self, head: &ebml::Head) -> Result<()> {
        // The cluster timecode precedes the blocks by construction.
        let end = match head.size {
            ElementSize::Known(size) => Some(head.data_start() + size),
            ElementSize::Unknown => None,
        };
        self.cluster = Some(ClusterState {
            end,
            base_ticks: 0,
        });
        Ok(())
    }

    /// The next Block/BlockGroup, crossing cluster boundaries as needed.
    /// `None` at the end of the segment.
    pub fn next_block(&mut self) -> Result<Option<BlockItem>> {
        loop {
            if self.finished {
                return Ok(None);
            }

            let Some(cluster) = &self.cluster else {
                // Between clusters: look for the next one.
                match ebml::find_next_element(
                    &mut self.io,
                    ids::SEGMENT,
                    self.segment_end,
                    false,
                )? {
                    Next::Child(head) if head.id == ids::CLUSTER => {
                        self.enter_cluster(&head)?;
                        continue;
                    }
                    Next::Child(head) | Next::Dummy(head) | Next::UpperLevel(head) => {
                        ebml::skip_data(&mut self.io, &head)?;
                        continue;
                    }
                    Next::End => {
                        self.finished = true;
                        return Ok(None);
                    }
                }
            };

            let cluster_end = cluster.end;
            let next =
                ebml::find_next_element(&mut self.io, ids::CLUSTER, cluster_end, false)?;
            let head = match next {
                Next::Child(head) => head,
                Next::UpperLevel(head) => {
                    // An unknown-size cluster ends where the next top-level
                    // element begins.
                    self.io.seek(SeekFrom::Start(head.position))?;
                    self.cluster = None;
                    continue;
                }
                Next::Dummy(head) => {
                    ebml::skip_data(&mut self.io, &head)?;
                    continue;
                }
                Next::End => {
                    self.cluster = None;
                    continue;
                }
            };

            match head.id {
                ids::CLUSTER_TIMECODE => {
                    let element = ebml::read_element(&mut self.io, &head)?;
                    if let Some(cluster) = &mut self.cluster {
                        cluster.base_ticks = element.as_uint().unwrap_or(0) as i64;
                    }
                }
                ids::SIMPLE_BLOCK => {
                    let element = ebml::read_element(&mut self.io, &head)?;
                    let base = self.cluster.as_ref().unwrap().base_ticks;
                    if let Some(item) = self.parse_simple_block(&element, base)? {
                        return Ok(Some(item));
                    }
                }
                ids::BLOCK_GROUP => {
                    let element = ebml::read_element(&mut self.io, &head)?;
                    let base = self.cluster.as_ref().unwrap().base_ticks;
                    if let Some(item) = self.parse_block_group(&element, base)? {
                        return Ok(Some(item));
                    }
                }
                _ => ebml::skip_data(&mut self.io, &head)?,
            }
        }
    }

    fn parse_simple_block(&mut self, element: &Element, base_ticks: i64) -> Result<Option<BlockItem>> {
        let Some(data) = element.as_binary() else {
            return Ok(None);
        };

        let Some((mut item, flags)) = self.parse_block_payload(data, base_ticks)? else {
            return Ok(None);
        };
        item.references_valid = true;
        item.keyframe = flags & 0x80 != 0;
        item.discardable = flags & 0x01 != 0;
        Ok(Some(item))
    }

    fn parse_block_group(&mut self, group: &Element, base_ticks: i64) -> Result<Option<BlockItem>> {
        let Some(block) = group.find(ids::BLOCK).and_then(Element::as_binary) else {
            self.warnings.warn("BlockGroup without a Block, skipped".to_string());
            return Ok(None);
        };

        let Some((mut item, _flags)) = self.parse_block_payload(block, base_ticks)? else {
            return Ok(None);
        };

        let scale = self.timecode_scale as i64;
        item.duration = group
            .find(ids::BLOCK_DURATION)
            .and_then(Element::as_uint)
            .map(|d| d as i64 * scale);

        let mut references = group
            .children()
            .unwrap_or(&[])
            .iter()
            .filter(|c| c.id == ids::REFERENCE_BLOCK)
            .filter_map(Element::as_sint);
        item.references_valid = true;
        if let Some(first) = references.next() {
            item.keyframe = false;
            item.bref = item.timecode + first * scale;
            if let Some(second) = references.next() {
                item.fref = item.timecode + second * scale;
            }
        } else {
            item.keyframe = true;
        }

        if let Some(additions) = group.find(ids::BLOCK_ADDITIONS) {
            for more in additions.children().unwrap_or(&[]) {
                if more.id != ids::BLOCK_MORE {
                    continue;
                }
                if let Some(payload) =
                    more.find(ids::BLOCK_ADDITIONAL).and_then(Element::as_binary)
                {
                    item.additions.push(payload.clone());
                }
            }
        }

        item.codec_state = group
            .find(ids::CODEC_STATE)
            .and_then(Element::as_binary)
            .cloned();

        Ok(Some(item))
    }

    /// Decodes the binary block layout: track number VINT, 16-bit relative
    /// timecode, flags, lace header, frame data.
    fn parse_block_payload(
        &mut self,
        data: &Span,
        base_ticks: i64,
    ) -> Result<Option<(BlockItem, u8)>> {
        let raw = data.to_slice();

        let Some((track_len, track)) = vint::read_from_slice(&raw) else {
            self.warnings.warn("block with bad track number, skipped".to_string());
            return Ok(None);
        };
        let mut pos = track_len as usize;
        if pos + 3 > raw.len() {
            return Ok(None);
        }

        let delta = i16::from_be_bytes([raw[pos], raw[pos + 1]]) as i64;
        let flags = raw[pos + 2];
        pos += 3;

        let scale = self.timecode_scale as i64;
        let timecode = (base_ticks + delta) * scale;

        let frames = match (flags >> 1) & 0x03 {
            0 => vec![data.slice(pos..)],
            lacing => {
                let Some(&count_minus_one) = raw.get(pos) else {
                    return Ok(None);
                };
                pos += 1;
                let count = count_minus_one as usize + 1;

                let mut sizes: Vec<usize> = Vec::with_capacity(count);
                match lacing {
                    1 => {
                        // Xiph: 255-runs, last frame is the remainder.
                        for _ in 0..count - 1 {
                            let mut size = 0usize;
                            loop {
                                let Some(&byte) = raw.get(pos) else {
                                    return Ok(None);
                                };
                                pos += 1;
                                size += byte as usize;
                                if byte != 255 {
                                    break;
                                }
                            }
                            sizes.push(size);
                        }
                    }
                    2 => {
                        // Fixed size lacing.
                        let total = raw.len() - pos;
                        let each = total / count;
                        sizes = vec![each; count - 1];
                    }
                    _ => {
                        // EBML lacing: first size plain, then signed deltas.
                        let Some((len, first)) = vint::read_from_slice(&raw[pos..]) else {
                            return Ok(None);
                        };
                        pos += len as usize;
                        let mut size = first as i64;
                        sizes.push(size as usize);
                        for _ in 0..count.saturating_sub(2) {
                            let Some((len, delta)) =
                                vint::read_signed_from_slice(&raw[pos..])
                            else {
                                return Ok(None);
                            };
                            pos += len as usize;
                            size += delta;
                            sizes.push(size.max(0) as usize);
                        }
                    }
                }

                let mut frames = Vec::with_capacity(count);
                for size in sizes {
                    if pos + size > raw.len() {
                        return Ok(None);
                    }
                    frames.push(data.slice(pos..pos + size));
                    pos += size;
                }
                frames.push(data.slice(pos..));
                frames
            }
        };

        let item = BlockItem {
            track,
            timecode,
            duration: None,
            keyframe: true,
            discardable: false,
            references_valid: false,
            bref: 0,
            fref: 0,
            frames,
            additions: Vec::new(),
            codec_state: None,
        };
        Ok(Some((item, flags)))
    }
}
