//! The mux orchestrator: a single-threaded pull loop that drains source
//! readers in timecode order, funnels packets through the cluster helper
//! and patches the headers once the full file is known.

pub mod cluster;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::ebml::{ids, Element};
use crate::error::{Error, Result, Warnings};
use crate::format::{Reader, Status};
use crate::io::IoWriter;
use crate::media::codec_ids;
use crate::packet::SourceId;
use cluster::{ClusterHelper, ClusterOptions, CueEntry};

/// Seconds between 1970-01-01 and 2001-01-01, the EBML date epoch.
const EBML_DATE_EPOCH_OFFSET_S: i64 = 978_307_200;

const MUXING_APP: &str = "libmkvbox-0.1.0";

pub struct MuxOptions {
    pub max_cluster_size: u32,
    pub max_cluster_time_ms: u32,
    pub no_cues: bool,
    /// Emit per-cluster position elements.
    pub cluster_positions: bool,
    /// `(file, track)` pairs deciding track-number assignment priority.
    pub track_order: Vec<(usize, usize)>,
    pub warnings_as_errors: bool,
    /// Pin every varying output byte: counter UIDs, zero date.
    pub deterministic: bool,
    /// Soft cap on queued bytes across all packetizers.
    pub queued_bytes_limit: usize,
    pub writing_app: String,
}

impl Default for MuxOptions {
    fn default() -> Self {
        MuxOptions {
            max_cluster_size: 5_242_880,
            max_cluster_time_ms: cluster::MAX_CLUSTER_TIMECODE_MS as u32,
            no_cues: false,
            cluster_positions: false,
            track_order: Vec::new(),
            warnings_as_errors: false,
            deterministic: false,
            queued_bytes_limit: 128 * 1024 * 1024,
            writing_app: MUXING_APP.to_string(),
        }
    }
}

pub struct MuxReport {
    pub warnings: u64,
    pub duration_ms: i64,
    pub clusters_rendered: u64,
}

pub struct Muxer {
    out: IoWriter,
    readers: Vec<Box<dyn Reader>>,
    options: MuxOptions,
    warnings: Warnings,
}

impl Muxer {
    pub fn new(
        out: IoWriter,
        readers: Vec<Box<dyn Reader>>,
        options: MuxOptions,
        warnings: Warnings,
    ) -> Result<Muxer> {
        if readers.is_empty() {
            return Err(Error::Config("no input files given".into()));
        }
        Ok(Muxer {
            out,
            readers,
            options,
            warnings,
        })
    }

    pub fn into_output(self) -> IoWriter {
        self.out
    }

    /// Runs the whole mux. The cancel flag is checked once per scheduling
    /// iteration; on cancellation the current cluster and the headers are
    /// finalized so the output stays a valid, if short, Matroska file.
    pub fn run(&mut self, cancel: &AtomicBool) -> Result<MuxReport> {
        for reader in &mut self.readers {
            reader.read_headers()?;
        }
        self.assign_track_identities();

        // --- fixed header chain -------------------------------------------
        let mut ebml_head = Element::master(
            ids::EBML_HEADER,
            vec![
                Element::uint(ids::EBML_VERSION, 1),
                Element::uint(ids::EBML_READ_VERSION, 1),
                Element::uint(ids::EBML_MAX_ID_LENGTH, 4),
                Element::uint(ids::EBML_MAX_SIZE_LENGTH, 8),
                Element::string(ids::DOC_TYPE, "matroska"),
                Element::uint(ids::DOC_TYPE_VERSION, 2),
                Element::uint(ids::DOC_TYPE_READ_VERSION, 2),
            ],
        );
        ebml_head.update_size(false);
        ebml_head.render(&mut self.out, false)?;

        crate::ebml::vint::write_id(&mut self.out, ids::SEGMENT.0)?;
        let segment_size_pos = self.out.tell()?;
        crate::ebml::vint::write_unknown(&mut self.out, 8)?;
        let segment_start = self.out.tell()?;

        // Reserved space for the meta seek written at the end.
        let mut seek_void = Element::void(160);
        seek_void.update_size(false);
        seek_void.render(&mut self.out, false)?;

        let date = if self.options.deterministic {
            0
        } else {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| (d.as_secs() as i64 - EBML_DATE_EPOCH_OFFSET_S) * 1_000_000_000)
                .unwrap_or(0)
        };

        let mut info = Element::master(
            ids::INFO,
            vec![
                Element::uint(ids::TIMECODE_SCALE, 1_000_000),
                Element::utf8(ids::MUXING_APP, MUXING_APP),
                Element::utf8(ids::WRITING_APP, self.options.writing_app.clone()),
                Element::date(ids::DATE_UTC, date),
                Element::float(ids::DURATION, 0.0),
            ],
        );
        info.update_size(false);
        let info_position = self.out.tell()?;
        info.render(&mut self.out, false)?;

        let mut tracks = Element::master(ids::TRACKS, vec![]);
        let mut video_tracks = HashSet::new();
        let mut lacing_tracks = HashSet::new();
        for reader in &self.readers {
            for index in 0..reader.packetizer_count() {
                let track = &reader.packetizer(index).common().track;
                if !track.in_use {
                    continue;
                }
                tracks.push(track.to_entry());
                if track.track_type == Some(crate::media::TrackType::Video) {
                    video_tracks.insert(track.number);
                }
                if track.flag_lacing && track.codec_id == codec_ids::A_VORBIS {
                    lacing_tracks.insert(track.number);
                }
            }
        }
        if tracks.children().map(|c| c.is_empty()).unwrap_or(true) {
            return Err(Error::Config("no tracks to mux".into()));
        }
        tracks.update_size(false);
        let tracks_position = self.out.tell()?;
        tracks.render(&mut self.out, false)?;

        // --- the pull loop ------------------------------------------------
        let mut helper = ClusterHelper::new(
            ClusterOptions {
                max_size: self.options.max_cluster_size as u64,
                max_time_ms: self.options.max_cluster_time_ms as i64,
                timecode_scale: 1_000_000,
                video_tracks,
                lacing_tracks,
                write_positions: self.options.cluster_positions,
            },
            self.warnings.clone(),
        );

        let mut cues: Vec<CueEntry> = Vec::new();
        let mut clusters_rendered = 0u64;
        let mut reader_done = vec![false; self.readers.len()];

        loop {
            if cancel.load(Ordering::Relaxed) {
                log::info!("cancellation requested, finalizing the current cluster");
                break;
            }

            self.refill_queues(&mut reader_done)?;

            let Some((reader_index, packetizer_index)) = self.pick_winner() else {
                break;
            };

            // Packets may have been enqueued before the track identities
            // were assigned; stamp them on the way out.
            let packet = {
                let common = self
                    .readers[reader_index]
                    .packetizer_mut(packetizer_index)
                    .common_mut();
                let mut packet = common.queue.pop().unwrap();
                packet.track = common.track.number;
                packet.source = common.source;
                packet
            };

            if helper.should_close(&packet) {
                // Rendering releases what it can and leaves a fresh open
                // cluster behind.
                cues.extend(helper.render(&mut self.out, segment_start)?);
                clusters_rendered += 1;
                self.sync_free_refs(&helper);
            }
            helper.add_packet(packet);
        }

        // --- drain and finalize -------------------------------------------
        for reader in &mut self.readers {
            reader.flush()?;
        }
        loop {
            let Some((reader_index, packetizer_index)) = self.pick_winner() else {
                break;
            };
            let packet = {
                let common = self
                    .readers[reader_index]
                    .packetizer_mut(packetizer_index)
                    .common_mut();
                let mut packet = common.queue.pop().unwrap();
                packet.track = common.track.number;
                packet.source = common.source;
                packet
            };
            if helper.should_close(&packet) {
                cues.extend(helper.render(&mut self.out, segment_start)?);
                clusters_rendered += 1;
            }
            helper.add_packet(packet);
        }
        cues.extend(helper.render(&mut self.out, segment_start)?);
        clusters_rendered += 1;
        self.sync_free_refs(&helper);

        let mut seeks: Vec<(u32, u64)> = vec![
            (ids::INFO.0, info_position - segment_start),
            (ids::TRACKS.0, tracks_position - segment_start),
        ];

        if !self.options.no_cues && !cues.is_empty() {
            let cues_position = self.out.tell()?;
            let mut cues_element = Element::master(ids::CUES, vec![]);
            for entry in &cues {
                cues_element.push(Element::master(
                    ids::CUE_POINT,
                    vec![
                        Element::uint(ids::CUE_TIME, entry.timecode_ticks as u64),
                        Element::master(
                            ids::CUE_TRACK_POSITIONS,
                            vec![
                                Element::uint(ids::CUE_TRACK, entry.track),
                                Element::uint(ids::CUE_CLUSTER_POSITION, entry.cluster_position),
                                Element::uint(ids::CUE_BLOCK_NUMBER, entry.block_number),
                            ],
                        ),
                    ],
                ));
            }
            cues_element.update_size(false);
            cues_element.render(&mut self.out, false)?;
            seeks.push((ids::CUES.0, cues_position - segment_start));
        }

        let file_end = self.out.tell()?;

        // --- header patching ----------------------------------------------
        // The meta seek replaces its reserved Void.
        let mut seek_head = Element::master(ids::SEEK_HEAD, vec![]);
        for (id, position) in seeks {
            seek_head.push(Element::master(
                ids::SEEK,
                vec![
                    Element::binary(ids::SEEK_ID, id.to_be_bytes().to_vec()),
                    Element::uint(ids::SEEK_POSITION, position),
                ],
            ));
        }
        seek_void.replace_with(&mut seek_head, &mut self.out, true, false)?;

        // Duration becomes known only now; the float's size is fixed, so
        // Info re-renders over itself byte for byte.
        let duration_ms = helper.max_timecode() / 1_000_000;
        let old_size = info.total_size();
        if let Some(children) = info.children_mut() {
            for child in children.iter_mut() {
                if child.id == ids::DURATION {
                    *child = Element::float(ids::DURATION, duration_ms as f64);
                }
            }
        }
        info.update_size(false);
        if info.total_size() != old_size {
            return Err(crate::internal_error!(
                "Info size changed between render and patch"
            ));
        }
        self.out.seek(std::io::SeekFrom::Start(info_position))?;
        info.render(&mut self.out, false)?;

        // Close the unknown-size Segment.
        crate::ebml::patch_size(&mut self.out, segment_size_pos, file_end - segment_start, 8)?;

        self.out.seek(std::io::SeekFrom::Start(file_end))?;
        self.out.flush()?;

        Ok(MuxReport {
            warnings: self.warnings.count(),
            duration_ms,
            clusters_rendered,
        })
    }

    /// Assigns output track numbers (priority order first), track UIDs and
    /// the source ids the cluster helper resolves references by.
    fn assign_track_identities(&mut self) {
        let mut next_number = 1u64;
        let mut next_source = 1u32;
        let mut uid_counter = 0u64;

        let mut assigned: HashSet<(usize, usize)> = HashSet::new();
        let order: Vec<(usize, usize)> = self
            .options
            .track_order
            .clone()
            .into_iter()
            .chain(
                (0..self.readers.len()).flat_map(|r| {
                    (0..self.readers[r].packetizer_count()).map(move |p| (r, p))
                }),
            )
            .collect();

        for (reader_index, packetizer_index) in order {
            if reader_index >= self.readers.len()
                || packetizer_index >= self.readers[reader_index].packetizer_count()
                || !assigned.insert((reader_index, packetizer_index))
            {
                continue;
            }

            let deterministic = self.options.deterministic;
            let common = self.readers[reader_index]
                .packetizer_mut(packetizer_index)
                .common_mut();

            common.source = SourceId(next_source);
            next_source += 1;

            if !common.track.in_use {
                continue;
            }

            common.track.number = next_number;
            next_number += 1;

            uid_counter += 1;
            common.track.uid = if deterministic {
                uid_counter
            } else {
                // Track UIDs just need to be nonzero and unique per file.
                rand::random::<u64>() | 1
            };
        }
    }

    /// Mirrors the cluster helper's free-refs watermarks back into the
    /// packetizers after a render, so their queues know what can never be
    /// referenced again.
    fn sync_free_refs(&mut self, helper: &ClusterHelper) {
        for reader in &mut self.readers {
            for index in 0..reader.packetizer_count() {
                let common = reader.packetizer_mut(index).common_mut();
                common.free_refs = helper.free_refs(common.source);
            }
        }
    }

    /// Tops up the head of every in-use queue so the scheduler always
    /// compares real timecodes; queues of unused tracks are drained away.
    /// Refills are skipped while the soft memory cap is exceeded.
    fn refill_queues(&mut self, reader_done: &mut [bool]) -> Result<()> {
        let queued_bytes: usize = self
            .readers
            .iter()
            .map(|r| {
                (0..r.packetizer_count())
                    .map(|p| r.packetizer(p).common().queue.queued_bytes())
                    .sum::<usize>()
            })
            .sum();
        let over_limit = queued_bytes > self.options.queued_bytes_limit;

        for reader_index in 0..self.readers.len() {
            for packetizer_index in 0..self.readers[reader_index].packetizer_count() {
                // Unused tracks are recognized but their output is dropped.
                if !self.readers[reader_index]
                    .packetizer(packetizer_index)
                    .common()
                    .track
                    .in_use
                {
                    let queue = &mut self.readers[reader_index]
                        .packetizer_mut(packetizer_index)
                        .common_mut()
                        .queue;
                    while queue.pop().is_some() {}
                    continue;
                }

                if over_limit || reader_done[reader_index] {
                    continue;
                }

                while self.readers[reader_index]
                    .packetizer(packetizer_index)
                    .common()
                    .queue
                    .is_empty()
                {
                    match self.readers[reader_index].read(packetizer_index)? {
                        Status::MoreData => continue,
                        Status::Done => {
                            reader_done[reader_index] = true;
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// The packetizer with the smallest head-of-queue timecode; equal
    /// timecodes go to the smaller track number.
    fn pick_winner(&self) -> Option<(usize, usize)> {
        let mut best: Option<(i64, u64, usize, usize)> = None;

        for (reader_index, reader) in self.readers.iter().enumerate() {
            for packetizer_index in 0..reader.packetizer_count() {
                let common = reader.packetizer(packetizer_index).common();
                if !common.track.in_use {
                    continue;
                }
                let Some(timecode) = common.queue.smallest_timecode() else {
                    continue;
                };
                let key = (timecode, common.track.number, reader_index, packetizer_index);
                match best {
                    Some((t, n, _, _)) if (t, n) <= (timecode, common.track.number) => {}
                    _ => best = Some(key),
                }
            }
        }

        best.map(|(_, _, reader_index, packetizer_index)| (reader_index, packetizer_index))
    }
}
