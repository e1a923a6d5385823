//! The cluster helper: groups packets into Clusters, resolves frame
//! references, writes BlockGroups and releases packets once nothing can
//! reference them anymore.

use std::collections::{HashMap, HashSet};

use crate::codec::xiph_size_run;
use crate::ebml::{ids, vint, Element};
use crate::error::{Error, Result, Warnings};
use crate::io::IoWriter;
use crate::packet::{Packet, SourceId};
use crate::span::Span;

/// Relative range of a signed 16-bit millisecond block timecode.
pub const MAX_CLUSTER_TIMECODE_MS: i64 = 32_767;

/// One Cues entry produced while rendering a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CueEntry {
    pub timecode_ticks: i64,
    pub track: u64,
    /// Cluster position relative to the start of the Segment data.
    pub cluster_position: u64,
    /// 1-based block number within the cluster.
    pub block_number: u64,
}

struct ChContents {
    packets: Vec<Packet>,
    rendered: bool,
    is_referenced: bool,
}

impl ChContents {
    fn new() -> ChContents {
        ChContents {
            packets: Vec::new(),
            rendered: false,
            is_referenced: false,
        }
    }

    fn base_timecode(&self) -> Option<i64> {
        self.packets.first().map(|p| p.timecode)
    }
}

pub struct ClusterOptions {
    pub max_size: u64,
    pub max_time_ms: i64,
    pub timecode_scale: u64,
    /// Track numbers whose key frames force a cluster split and get Cues.
    pub video_tracks: HashSet<u64>,
    /// Track numbers whose reference-free packets may be Xiph-laced.
    pub lacing_tracks: HashSet<u64>,
    /// Emit a ClusterPosition child in every cluster.
    pub write_positions: bool,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        ClusterOptions {
            max_size: 5_242_880,
            max_time_ms: MAX_CLUSTER_TIMECODE_MS,
            timecode_scale: 1_000_000,
            video_tracks: HashSet::new(),
            lacing_tracks: HashSet::new(),
            write_positions: false,
        }
    }
}

/// A multi-track packet buffer owning the not-yet-released clusters.
pub struct ClusterHelper {
    clusters: Vec<ChContents>,
    cluster_content_size: u64,
    max_timecode: i64,
    free_refs: HashMap<SourceId, i64>,
    options: ClusterOptions,
    warnings: Warnings,
}

struct PendingGroup {
    track: u64,
    source: SourceId,
    timecode: i64,
    frames: Vec<Span>,
    duration: Option<i64>,
    bref: i64,
    fref: i64,
    keyframe: bool,
    additions: Option<Span>,
    codec_state: Option<Span>,
}

impl ClusterHelper {
    pub fn new(options: ClusterOptions, warnings: Warnings) -> ClusterHelper {
        let mut helper = ClusterHelper {
            clusters: Vec::new(),
            cluster_content_size: 0,
            max_timecode: 0,
            free_refs: HashMap::new(),
            options,
            warnings,
        };
        helper.add_cluster();
        helper
    }

    /// Opens a fresh cluster; relative timecodes restart at its first packet.
    pub fn add_cluster(&mut self) {
        self.clusters.push(ChContents::new());
        self.cluster_content_size = 0;
    }

    fn current(&self) -> &ChContents {
        self.clusters.last().expect("cluster list is never empty")
    }

    fn current_mut(&mut self) -> &mut ChContents {
        self.clusters.last_mut().expect("cluster list is never empty")
    }

    pub fn packet_count(&self) -> usize {
        self.current().packets.len()
    }

    pub fn content_size(&self) -> u64 {
        self.cluster_content_size
    }

    /// Highest end timecode seen, for the segment Duration patch.
    pub fn max_timecode(&self) -> i64 {
        self.max_timecode
    }

    /// Whether accepting `packet` into the open cluster would violate a
    /// bound, so the cluster must be rendered first.
    pub fn should_close(&self, packet: &Packet) -> bool {
        let current = self.current();
        let Some(base) = current.base_timecode() else {
            return false;
        };

        let scale = self.options.timecode_scale as i64;
        if (packet.timecode - base) / scale > self.options.max_time_ms {
            return true;
        }
        if self.cluster_content_size + packet.data.len() as u64 > self.options.max_size {
            return true;
        }
        if packet.is_key()
            && self.options.video_tracks.contains(&packet.track)
            && !current.packets.is_empty()
        {
            return true;
        }
        false
    }

    pub fn add_packet(&mut self, packet: Packet) {
        self.cluster_content_size += packet.data.len() as u64;

        let end = packet.timecode + packet.duration.unwrap_or(0);
        if end > self.max_timecode {
            self.max_timecode = end;
        }

        self.current_mut().packets.push(packet);
    }

    /// The free-refs watermark for a source: packets below it can never be
    /// referenced again.
    pub fn free_refs(&self, source: SourceId) -> i64 {
        self.free_refs.get(&source).copied().unwrap_or(-1)
    }

    fn free_ref(&mut self, timecode: i64, source: SourceId) {
        self.free_refs.insert(source, timecode);
    }

    fn find_packet(&self, source: SourceId, ref_timecode: i64) -> Option<&Packet> {
        self.clusters
            .iter()
            .flat_map(|c| c.packets.iter())
            .find(|p| p.source == source && p.timecode == ref_timecode)
    }

    fn find_packet_cluster(&self, source: SourceId, ref_timecode: i64) -> Option<usize> {
        self.clusters.iter().position(|c| {
            c.packets
                .iter()
                .any(|p| p.source == source && p.timecode == ref_timecode)
        })
    }

    fn may_lace(&self, group: &PendingGroup, packet: &Packet) -> bool {
        group.track == packet.track
            && group.frames.len() < 8
            && group.bref == 0
            && group.fref == 0
            && packet.is_key()
            && packet.fref == 0
            && packet.additions.is_none()
            && packet.codec_state.is_none()
            && group.additions.is_none()
            && group.codec_state.is_none()
            && self.options.lacing_tracks.contains(&packet.track)
    }

    /// Renders the open cluster and runs the release protocol. Returns the
    /// Cues entries for the groups written.
    pub fn render(&mut self, out: &mut IoWriter, segment_start: u64) -> Result<Vec<CueEntry>> {
        if self.current().packets.is_empty() {
            return Ok(Vec::new());
        }

        let scale = self.options.timecode_scale as i64;
        let base = self.current().base_timecode().unwrap();
        let base_ticks = base / scale;

        if (self.current().packets.iter().map(|p| p.timecode).max().unwrap() - base) / scale
            > MAX_CLUSTER_TIMECODE_MS
        {
            self.warnings.warn(format!(
                "cluster at {base_ticks} ms spans more than {MAX_CLUSTER_TIMECODE_MS} ms; \
                 block timecodes will wrap"
            ));
        }

        // Pass 1: resolve references and fold packets into block groups.
        let mut groups: Vec<PendingGroup> = Vec::new();
        let mut free_now: Vec<(i64, SourceId)> = Vec::new();

        let cluster_index = self.clusters.len() - 1;
        for packet in &self.clusters[cluster_index].packets {
            if packet.bref != 0 {
                // P and B frames keep their referents alive; both referents
                // must still be held (same cluster or an earlier one).
                if self.find_packet(packet.source, packet.bref).is_none() {
                    return Err(Error::ReferenceUnresolved {
                        timecode: packet.timecode,
                        ref_timecode: packet.bref,
                    });
                }
                if packet.fref != 0 && self.find_packet(packet.source, packet.fref).is_none() {
                    return Err(Error::ReferenceUnresolved {
                        timecode: packet.timecode,
                        ref_timecode: packet.fref,
                    });
                }
            } else {
                // A rendered key frame supersedes everything older on its
                // track.
                free_now.push((packet.timecode, packet.source));
            }

            // The laced-into-previous-group path: no new group appears.
            if let Some(last) = groups.last_mut() {
                if packet.bref == 0 && self.may_lace(last, packet) {
                    last.frames.push(packet.data.clone());
                    if let Some(duration) = packet.duration {
                        *last.duration.get_or_insert(0) += duration;
                    }
                    continue;
                }
            }

            groups.push(PendingGroup {
                track: packet.track,
                source: packet.source,
                timecode: packet.timecode,
                frames: vec![packet.data.clone()],
                duration: packet.duration,
                bref: packet.bref,
                fref: packet.fref,
                keyframe: packet.is_key(),
                additions: packet.additions.clone(),
                codec_state: packet.codec_state.clone(),
            });
        }

        // Pass 2: materialize the cluster element and collect Cues entries.
        let cluster_position = out.tell()? - segment_start;
        let mut cluster = Element::master(
            ids::CLUSTER,
            vec![Element::uint(ids::CLUSTER_TIMECODE, base_ticks as u64)],
        );
        if self.options.write_positions {
            cluster.push(Element::uint(ids::CLUSTER_POSITION, cluster_position));
        }

        let mut cues = Vec::new();
        let cue_all = self.options.video_tracks.is_empty();

        for (index, group) in groups.iter().enumerate() {
            let delta = group.timecode / scale - base_ticks;
            if !(-32768..=32767).contains(&delta) {
                self.warnings.warn(format!(
                    "block timecode delta {delta} ms is out of range and will be clamped"
                ));
            }
            let delta = delta.clamp(-32768, 32767) as i16;

            cluster.push(build_block_group(group, delta, base_ticks, scale));

            let is_cue = if cue_all {
                index == 0
            } else {
                group.keyframe && self.options.video_tracks.contains(&group.track)
            };
            if is_cue {
                cues.push(CueEntry {
                    timecode_ticks: group.timecode / scale,
                    track: group.track,
                    cluster_position,
                    block_number: index as u64 + 1,
                });
            }
        }

        cluster.update_size(false);
        cluster.render(out, false)?;

        for (timecode, source) in free_now {
            self.free_ref(timecode, source);
        }

        self.clusters[cluster_index].rendered = true;
        self.free_clusters()?;

        Ok(cues)
    }

    /// The release protocol: drop every rendered cluster no still-queued
    /// packet can reach through a backward reference.
    fn free_clusters(&mut self) -> Result<()> {
        for cluster in &mut self.clusters {
            cluster.is_referenced = false;
        }

        // Part 1: supersede packets below their source's watermark.
        for cluster in &mut self.clusters {
            for packet in &mut cluster.packets {
                let watermark = self.free_refs.get(&packet.source).copied().unwrap_or(-1);
                if watermark > packet.timecode {
                    packet.superseded = true;
                }
            }
        }

        // Part 2: keep clusters that hold a referent of any live packet.
        let mut referenced = vec![false; self.clusters.len()];
        for (index, cluster) in self.clusters.iter().enumerate() {
            for packet in &cluster.packets {
                if packet.superseded {
                    continue;
                }
                referenced[index] = true;
                if packet.bref == 0 {
                    continue;
                }
                match self.find_packet_cluster(packet.source, packet.bref) {
                    Some(target) => referenced[target] = true,
                    None => {
                        return Err(Error::ReferenceUnresolved {
                            timecode: packet.timecode,
                            ref_timecode: packet.bref,
                        })
                    }
                }
            }
        }
        for (cluster, flag) in self.clusters.iter_mut().zip(&referenced) {
            cluster.is_referenced = *flag;
        }

        // Parts 3 and 4: drop rendered, unreferenced clusters and compact.
        self.clusters
            .retain(|c| !c.rendered || c.is_referenced);
        if self.clusters.is_empty() {
            self.add_cluster();
        } else if self.clusters.last().map(|c| c.rendered).unwrap_or(false) {
            self.add_cluster();
        }

        Ok(())
    }

    /// Clusters still held in memory (rendered ones only stay while they are
    /// referenced).
    pub fn held_clusters(&self) -> usize {
        self.clusters.len()
    }
}

fn build_block_group(group: &PendingGroup, delta: i16, base_ticks: i64, scale: i64) -> Element {
    let mut block = Vec::with_capacity(16);
    let track_vint_len = vint::coded_len(group.track);
    let composed = (group.track | (1u64 << (7 * track_vint_len as u32))).to_be_bytes();
    block.extend_from_slice(&composed[8 - track_vint_len as usize..]);
    block.extend_from_slice(&delta.to_be_bytes());

    let laced = group.frames.len() > 1;
    block.push(if laced { 0x02 } else { 0x00 });

    let mut payload = Span::from(block);
    if laced {
        let mut lace_header = vec![(group.frames.len() - 1) as u8];
        for frame in &group.frames[..group.frames.len() - 1] {
            xiph_size_run(frame.len(), &mut lace_header);
        }
        payload.push(Span::from(lace_header));
    }
    for frame in &group.frames {
        payload.push(frame.clone());
    }

    let mut element = Element::master(
        ids::BLOCK_GROUP,
        vec![Element::binary(ids::BLOCK, payload)],
    );

    if let Some(duration) = group.duration {
        element.push(Element::uint(ids::BLOCK_DURATION, (duration / scale) as u64));
    }
    if group.bref != 0 {
        element.push(Element::sint(
            ids::REFERENCE_BLOCK,
            group.bref / scale - (base_ticks + delta as i64),
        ));
    }
    if group.fref != 0 {
        element.push(Element::sint(
            ids::REFERENCE_BLOCK,
            group.fref / scale - (base_ticks + delta as i64),
        ));
    }
    if let Some(additions) = &group.additions {
        element.push(Element::master(
            ids::BLOCK_ADDITIONS,
            vec![Element::master(
                ids::BLOCK_MORE,
                vec![
                    Element::uint(ids::BLOCK_ADD_ID, 1),
                    Element::binary(ids::BLOCK_ADDITIONAL, additions.clone()),
                ],
            )],
        ));
    }
    if let Some(state) = &group.codec_state {
        element.push(Element::binary(ids::CODEC_STATE, state.clone()));
    }

    element
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::Packet;

    fn options() -> ClusterOptions {
        ClusterOptions {
            video_tracks: [1u64].into_iter().collect(),
            ..ClusterOptions::default()
        }
    }

    fn packet(track: u64, source: u32, timecode_ms: i64, bref_ms: i64, fref_ms: i64) -> Packet {
        let mut packet = Packet::new(Span::from(vec![0u8; 4]), timecode_ms * 1_000_000);
        packet.track = track;
        packet.source = SourceId(source);
        packet.references_valid = true;
        packet.keyframe = bref_ms == 0;
        packet.bref = bref_ms * 1_000_000;
        packet.fref = fref_ms * 1_000_000;
        packet.duration = Some(40_000_000);
        packet
    }

    #[test]
    fn keyframe_closes_a_nonempty_cluster() {
        let helper = {
            let mut helper = ClusterHelper::new(options(), Warnings::new());
            helper.add_packet(packet(1, 1, 0, 0, 0));
            helper
        };

        assert!(!helper.should_close(&packet(2, 2, 10, 0, 0)));
        assert!(helper.should_close(&packet(1, 1, 40, 0, 0)));
        assert!(!helper.should_close(&packet(1, 1, 40, 20, 0)));
    }

    #[test]
    fn timecode_span_closes_a_cluster() {
        let mut helper = ClusterHelper::new(options(), Warnings::new());
        helper.add_packet(packet(2, 2, 0, 0, 0));

        assert!(!helper.should_close(&packet(2, 2, 32_000, 0, 0)));
        assert!(helper.should_close(&packet(2, 2, 33_000, 0, 0)));
    }

    #[test]
    fn render_produces_reference_offsets() {
        let mut helper = ClusterHelper::new(options(), Warnings::new());
        helper.add_packet(packet(1, 1, 100, 0, 0)); // key frame
        helper.add_packet(packet(1, 1, 180, 100, 0)); // P frame
        helper.add_packet(packet(1, 1, 140, 100, 180)); // B frame

        let mut out = IoWriter::memory();
        let cues = helper.render(&mut out, 0).unwrap();

        // Only the key frame of the video track is cued.
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].track, 1);
        assert_eq!(cues[0].block_number, 1);
        assert_eq!(cues[0].timecode_ticks, 100);

        let data = out.into_memory().unwrap();
        assert!(!data.is_empty());
    }

    #[test]
    fn unresolvable_reference_is_fatal() {
        let mut helper = ClusterHelper::new(options(), Warnings::new());
        helper.add_packet(packet(1, 1, 0, 0, 0));
        let mut bad = packet(1, 1, 40, 20, 0);
        bad.bref = 20 * 1_000_000; // no packet at 20 ms
        helper.add_packet(bad);

        let mut out = IoWriter::memory();
        let err = helper.render(&mut out, 0).unwrap_err();

        assert!(matches!(err, Error::ReferenceUnresolved { .. }));
    }

    #[test]
    fn release_protocol_drops_unreferenced_clusters() {
        let mut helper = ClusterHelper::new(options(), Warnings::new());
        let mut out = IoWriter::memory();

        // First cluster: key frame, then a P frame referencing it.
        helper.add_packet(packet(1, 1, 0, 0, 0));
        helper.add_packet(packet(1, 1, 40, 0, 0));
        helper.render(&mut out, 0).unwrap();
        // The rendered cluster stays: its P frame is not superseded yet.
        assert_eq!(helper.held_clusters(), 2);

        // Next cluster starts with a new key frame; once rendered, the
        // watermark supersedes the first cluster and it is dropped, while
        // the cluster holding the watermark frame itself stays.
        helper.add_packet(packet(1, 1, 80, 0, 0));
        helper.render(&mut out, 0).unwrap();
        assert_eq!(helper.held_clusters(), 2);
        assert_eq!(helper.packet_count(), 0);
    }

    #[test]
    fn lacing_folds_reference_free_frames() {
        let options = ClusterOptions {
            lacing_tracks: [2u64].into_iter().collect(),
            ..ClusterOptions::default()
        };
        let mut helper = ClusterHelper::new(options, Warnings::new());

        for i in 0..3 {
            let mut p = packet(2, 2, i * 10, 0, 0);
            p.references_valid = false;
            helper.add_packet(p);
        }

        let mut out = IoWriter::memory();
        let cues = helper.render(&mut out, 0).unwrap();
        // All three frames share one laced group, which is the cued one.
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].block_number, 1);

        let data = out.into_memory().unwrap();
        // Lace flag (0x02) followed by a frame count of 2.
        assert!(
            data.windows(2).any(|w| w == [0x02, 0x02]),
            "laced block header not found"
        );
    }
}
