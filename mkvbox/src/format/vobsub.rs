//! VobSub reader: parses the `.idx` text index, derives entry sizes from
//! the gaps between file positions and feeds the `.sub` program stream
//! entries to the VobSub packetizer.

use std::io::SeekFrom;

use crate::codec::vobsub::VobsubPacketizer;
use crate::codec::{Frame, Packetizer};
use crate::error::Result;
use crate::format::{ProbeResult, Reader, SourceOptions, Status};
use crate::io::IoReader;
use crate::media::{Track, TrackType};

use crate::reader;

reader!("VobSub", VobsubReader::create, VobsubReader::probe);

/// Entries larger than this are assumed to be artifacts of "size reaches to
/// the end of the file" index lines and can be skipped on request.
const BIG_ENTRY_LIMIT: u64 = 64 * 1024;

struct VobsubTrack {
    language: String,
    timecodes: Vec<i64>,
    positions: Vec<u64>,
    sizes: Vec<u64>,
    packetizer: VobsubPacketizer,
    index: usize,
}

pub struct VobsubReader {
    idx_name: String,
    sub: IoReader,
    tracks: Vec<VobsubTrack>,
    options: SourceOptions,
}

impl VobsubReader {
    fn create(io: IoReader, options: SourceOptions) -> Result<Box<dyn Reader>> {
        Ok(Box::new(VobsubReader::open(io, options)?))
    }

    fn probe(data: &[u8]) -> ProbeResult {
        let text = String::from_utf8_lossy(&data[..data.len().min(512)]);
        if text.contains("VobSub index file") {
            return ProbeResult::Yup;
        }
        if text.lines().any(|l| l.trim_start().starts_with("timestamp:"))
            && text.lines().any(|l| l.trim_start().starts_with("id:"))
        {
            ProbeResult::Maybe(0.6)
        } else {
            ProbeResult::Unsure
        }
    }

    pub fn open(mut io: IoReader, options: SourceOptions) -> Result<VobsubReader> {
        let idx_name = io.name().to_string();
        let raw = io.read_vec(io.size() as usize)?;
        let text = String::from_utf8_lossy(&raw).into_owned();

        let sub_name = sub_file_name(&idx_name);
        let sub = IoReader::open(&sub_name)?;

        // Header lines (everything that is not a timestamp) become the
        // codec private data shared by all tracks.
        let mut idx_data = String::new();
        let mut parsed: Vec<(String, Vec<i64>, Vec<u64>)> = Vec::new();

        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let lower = trimmed.to_ascii_lowercase();
            if let Some(rest) = lower.strip_prefix("id:") {
                let language = rest
                    .trim()
                    .split([',', ' '])
                    .next()
                    .unwrap_or("")
                    .to_string();
                parsed.push((language, Vec::new(), Vec::new()));
                continue;
            }
            if lower.starts_with("alt:") || lower.starts_with("langidx:") {
                continue;
            }

            if lower.starts_with("timestamp:") {
                let Some(track) = parsed.last_mut() else {
                    return Err(io.invalid(
                        "VobSub",
                        0,
                        ".idx file has a timestamp before any 'id:' line",
                    ));
                };
                if let Some((timecode, filepos)) = parse_timestamp_line(trimmed) {
                    track.1.push(timecode);
                    track.2.push(filepos);
                }
                continue;
            }

            idx_data.push_str(trimmed);
            idx_data.push('\n');
        }

        // Sizes: distance to the next entry of the same track; the last one
        // reaches to the next entry of ANY track, or the end of the file.
        let sub_size = sub.size();
        let mut all_positions: Vec<u64> = parsed
            .iter()
            .flat_map(|(_, _, positions)| positions.iter().copied())
            .collect();
        all_positions.sort_unstable();

        let mut tracks = Vec::new();
        for (index, (language, timecodes, positions)) in parsed.into_iter().enumerate() {
            let mut sizes = Vec::with_capacity(positions.len());
            for (i, &position) in positions.iter().enumerate() {
                let size = match positions.get(i + 1) {
                    Some(&next) => next - position,
                    None => {
                        let direct = sub_size - position;
                        if direct <= BIG_ENTRY_LIMIT {
                            direct
                        } else {
                            all_positions
                                .iter()
                                .find(|&&p| p > position)
                                .map(|&p| p - position)
                                .unwrap_or(direct)
                        }
                    }
                };
                sizes.push(size);
            }

            let mut track = Track::new(TrackType::Subtitle);
            track.language = language.clone();
            let mut packetizer = VobsubPacketizer::new(
                track,
                idx_data.clone(),
                true,
                options.warnings.clone(),
            );
            options.apply(index, &mut packetizer);

            tracks.push(VobsubTrack {
                language,
                timecodes,
                positions,
                sizes,
                packetizer,
                index: 0,
            });
        }

        if tracks.is_empty() {
            return Err(io.invalid("VobSub", 0, ".idx file contains no 'id:' line"));
        }

        Ok(VobsubReader {
            idx_name,
            sub,
            tracks,
            options,
        })
    }
}

fn sub_file_name(idx_name: &str) -> String {
    match idx_name.rfind('.') {
        Some(dot) => format!("{}.sub", &idx_name[..dot]),
        None => format!("{idx_name}.sub"),
    }
}

/// `timestamp: HH:MM:SS:mmm, filepos: 0000000000`
fn parse_timestamp_line(line: &str) -> Option<(i64, u64)> {
    let rest = line.strip_prefix("timestamp:")?.trim();
    let (time_part, pos_part) = rest.split_once(',')?;

    let mut pieces = time_part.trim().split(':');
    let hours: i64 = pieces.next()?.parse().ok()?;
    let minutes: i64 = pieces.next()?.parse().ok()?;
    let seconds: i64 = pieces.next()?.parse().ok()?;
    let millis: i64 = pieces.next()?.parse().ok()?;

    let timecode =
        (((hours * 60 + minutes) * 60 + seconds) * 1000 + millis) * 1_000_000;

    let filepos_text = pos_part.trim().strip_prefix("filepos:")?.trim();
    let filepos = u64::from_str_radix(filepos_text, 16).ok()?;

    Some((timecode, filepos))
}

impl Reader for VobsubReader {
    fn file_name(&self) -> &str {
        &self.idx_name
    }

    fn container(&self) -> &'static str {
        "VobSub"
    }

    fn read_headers(&mut self) -> Result<()> {
        for track in &mut self.tracks {
            track.packetizer.set_headers()?;
        }
        Ok(())
    }

    fn packetizer_count(&self) -> usize {
        self.tracks.len()
    }

    fn packetizer(&self, index: usize) -> &dyn Packetizer {
        &self.tracks[index].packetizer
    }

    fn packetizer_mut(&mut self, index: usize) -> &mut dyn Packetizer {
        &mut self.tracks[index].packetizer
    }

    fn read(&mut self, index: usize) -> Result<Status> {
        let Some(track) = self.tracks.get_mut(index) else {
            return Ok(Status::Done);
        };

        loop {
            let entry = track.index;
            if entry >= track.positions.len() {
                return Ok(Status::Done);
            }
            track.index += 1;

            let size = track.sizes[entry];
            if size > BIG_ENTRY_LIMIT && self.options.skip_big_vobsubs {
                self.options.warnings.warn(format!(
                    "Skipping entry at timecode {}s of track ID {index} in '{}' because \
                     it is too big ({size} bytes)",
                    track.timecodes[entry] / 1_000_000_000,
                    self.idx_name,
                ));
                continue;
            }

            self.sub.seek(SeekFrom::Start(track.positions[entry]))?;
            let payload = self.sub.read_vec(size as usize)?;

            track
                .packetizer
                .process(Frame::new(payload, track.timecodes[entry]))?;
            return Ok(Status::MoreData);
        }
    }

    fn identify(&self) -> Vec<String> {
        let mut lines = vec![format!("File '{}': container: VobSub", self.idx_name)];
        for (index, track) in self.tracks.iter().enumerate() {
            lines.push(format!(
                "Track ID {index}: subtitles (VobSub) [language:{}]",
                track.language
            ));
        }
        lines
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timestamp_lines_parse() {
        let (timecode, filepos) =
            parse_timestamp_line("timestamp: 00:01:02:500, filepos: 0000001b2").unwrap();

        assert_eq!(timecode, 62_500 * 1_000_000);
        assert_eq!(filepos, 0x1b2);
    }

    #[test]
    fn sub_name_replaces_the_extension() {
        assert_eq!(sub_file_name("movie.idx"), "movie.sub");
        assert_eq!(sub_file_name("noext"), "noext.sub");
    }

    #[test]
    fn probe_spots_index_files() {
        let idx = b"# VobSub index file, v7\nid: en, index: 0\n";
        assert_eq!(VobsubReader::probe(idx), ProbeResult::Yup);

        let loose = b"id: en\ntimestamp: 00:00:01:000, filepos: 000000000\n";
        assert!(matches!(VobsubReader::probe(loose), ProbeResult::Maybe(_)));

        assert_eq!(VobsubReader::probe(b"RIFF"), ProbeResult::Unsure);
    }
}
