//! Raw elementary stream readers: ADTS AAC, Annex-B H.264 and MPEG-4
//! part 2 video. Corrupt stretches are skipped to the next resync point
//! (ADTS sync word, start code) with a warning.

use std::io::SeekFrom;

use crate::codec::aac::{parse_adts, AacPacketizer};
use crate::codec::mpeg4::Mpeg4Packetizer;
use crate::codec::nal::{
    frame_nal_units, nal_unit_type, split_start_codes, AvcConfig, AvcPacketizer,
    BitstreamFraming, NAL_IDR, NAL_PPS, NAL_SPS,
};
use crate::codec::{Frame, Packetizer};
use crate::error::Result;
use crate::format::{ProbeResult, Reader, SourceOptions, Status};
use crate::io::IoReader;
use crate::media::{Track, TrackType};
use crate::span::Span;

pub const ADTS_READER_META: crate::format::ReaderMetadata = crate::format::ReaderMetadata {
    name: "AAC (ADTS)",
    create: AdtsReader::create,
    probe: AdtsReader::probe,
};

pub const AVC_READER_META: crate::format::ReaderMetadata = crate::format::ReaderMetadata {
    name: "AVC/H.264",
    create: AvcEsReader::create,
    probe: AvcEsReader::probe,
};

pub const MPEG4_READER_META: crate::format::ReaderMetadata = crate::format::ReaderMetadata {
    name: "MPEG-4 part 2",
    create: Mpeg4EsReader::create,
    probe: Mpeg4EsReader::probe,
};

/// Nominal frame spacing for streams that carry no timing of their own.
const DEFAULT_FRAME_DURATION_NS: i64 = 40_000_000;

// ---------------------------------------------------------------------------

pub struct AdtsReader {
    io: IoReader,
    packetizer: AacPacketizer,
    position: u64,
    options: SourceOptions,
}

impl AdtsReader {
    fn create(io: IoReader, options: SourceOptions) -> Result<Box<dyn Reader>> {
        Ok(Box::new(AdtsReader::open(io, options)?))
    }

    fn probe(data: &[u8]) -> ProbeResult {
        // Two chained headers make a convincing ADTS stream.
        let Some(first) = parse_adts(data) else {
            return ProbeResult::Unsure;
        };
        match data.get(first.frame_length..) {
            Some(rest) if parse_adts(rest).is_some() => ProbeResult::Maybe(0.8),
            _ => ProbeResult::Unsure,
        }
    }

    pub fn open(mut io: IoReader, options: SourceOptions) -> Result<AdtsReader> {
        let head = io.read_vec((io.size() as usize).min(8192))?;
        let start = find_adts_sync(&head, 0)
            .ok_or_else(|| io.invalid("AAC", 0, "no ADTS sync word found"))?;
        let header = parse_adts(&head[start..]).unwrap();

        let mut packetizer = AacPacketizer::new(Track::new(TrackType::Audio), header);
        options.apply(0, &mut packetizer);

        Ok(AdtsReader {
            io,
            packetizer,
            position: start as u64,
            options,
        })
    }
}

fn find_adts_sync(data: &[u8], from: usize) -> Option<usize> {
    (from..data.len().saturating_sub(7)).find(|&i| parse_adts(&data[i..]).is_some())
}

impl Reader for AdtsReader {
    fn file_name(&self) -> &str {
        self.io.name()
    }

    fn container(&self) -> &'static str {
        "AAC (ADTS)"
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
        loop {
            if self.position + 7 > self.io.size() {
                return Ok(Status::Done);
            }

            let mut head = [0u8; 9];
            self.io.seek(SeekFrom::Start(self.position))?;
            let got = self.io.read_some(&mut head)?;

            match parse_adts(&head[..got]) {
                Some(header) => {
                    self.io.seek(SeekFrom::Start(self.position))?;
                    let available =
                        (self.io.size() - self.position).min(header.frame_length as u64);
                    let frame = self.io.read_vec(available as usize)?;
                    self.position += available;

                    self.packetizer.process(Frame::new(frame, -1))?;
                    return Ok(Status::MoreData);
                }
                None => {
                    // Resync to the next sync word.
                    self.io.seek(SeekFrom::Start(self.position))?;
                    let window = self
                        .io
                        .read_vec(((self.io.size() - self.position) as usize).min(64 * 1024))?;
                    match find_adts_sync(&window, 1) {
                        Some(offset) => {
                            self.options.warnings.warn(format!(
                                "{}: garbage at byte {}, resynced after {offset} bytes",
                                self.io.name(),
                                self.position
                            ));
                            self.position += offset as u64;
                        }
                        None => return Ok(Status::Done),
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------

pub struct AvcEsReader {
    io_name: String,
    packetizer: AvcPacketizer,
    /// Access units, each already length-prefixed for Matroska storage.
    frames: Vec<(Span, bool)>,
    next_frame: usize,
}

impl AvcEsReader {
    fn create(io: IoReader, options: SourceOptions) -> Result<Box<dyn Reader>> {
        Ok(Box::new(AvcEsReader::open(io, options)?))
    }

    fn probe(data: &[u8]) -> ProbeResult {
        let has_start_code =
            data.starts_with(&[0, 0, 1]) || data.starts_with(&[0, 0, 0, 1]);
        if !has_start_code {
            return ProbeResult::Unsure;
        }

        let units = split_start_codes(&Span::from(data[..data.len().min(8192)].to_vec()));
        if units.iter().any(|u| nal_unit_type(u) == Some(NAL_SPS)) {
            ProbeResult::Maybe(0.7)
        } else {
            ProbeResult::Unsure
        }
    }

    pub fn open(mut io: IoReader, options: SourceOptions) -> Result<AvcEsReader> {
        let io_name = io.name().to_string();
        let data = io.read_vec(io.size() as usize)?;
        let units = split_start_codes(&Span::from(data));

        let sps: Vec<Span> = units
            .iter()
            .filter(|u| nal_unit_type(u) == Some(NAL_SPS))
            .take(1)
            .cloned()
            .collect();
        let pps: Vec<Span> = units
            .iter()
            .filter(|u| nal_unit_type(u) == Some(NAL_PPS))
            .take(1)
            .cloned()
            .collect();

        if sps.is_empty() || pps.is_empty() {
            return Err(crate::error::Error::invalid(
                &io_name,
                "AVC",
                0,
                "stream carries no SPS/PPS",
            ));
        }

        let sps_bytes = sps[0].to_bytes();
        let config = AvcConfig {
            profile: sps_bytes.get(1).copied().unwrap_or(0),
            profile_compat: sps_bytes.get(2).copied().unwrap_or(0),
            level: sps_bytes.get(3).copied().unwrap_or(0),
            nal_size_size: 4,
            sps,
            pps,
        };

        // Fold NAL units into access units: prefix NALs attach to the next
        // slice, a slice NAL closes the unit.
        let mut frames = Vec::new();
        let mut pending: Vec<Span> = Vec::new();
        let mut keyframe = false;
        for unit in units {
            let unit_type = nal_unit_type(&unit).unwrap_or(0);
            keyframe |= unit_type == NAL_IDR;
            let is_slice = matches!(unit_type, 1 | NAL_IDR);
            pending.push(unit);

            if is_slice {
                let au = frame_nal_units(&pending, BitstreamFraming::LengthPrefix(4));
                frames.push((au, keyframe));
                pending.clear();
                keyframe = false;
            }
        }

        let mut track = Track::new(TrackType::Video);
        track.default_duration = Some(DEFAULT_FRAME_DURATION_NS as u64);
        let mut packetizer = AvcPacketizer::new(track, config);
        options.apply(0, &mut packetizer);

        Ok(AvcEsReader {
            io_name,
            packetizer,
            frames,
            next_frame: 0,
        })
    }
}

impl Reader for AvcEsReader {
    fn file_name(&self) -> &str {
        &self.io_name
    }

    fn container(&self) -> &'static str {
        "AVC/H.264 elementary stream"
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
        let Some((frame, keyframe)) = self.frames.get(self.next_frame).cloned() else {
            return Ok(Status::Done);
        };

        let timecode = self.next_frame as i64 * DEFAULT_FRAME_DURATION_NS;
        self.next_frame += 1;

        self.packetizer
            .process(Frame::new(frame, timecode).keyframe(keyframe))?;
        Ok(Status::MoreData)
    }
}

// ---------------------------------------------------------------------------

pub struct Mpeg4EsReader {
    io_name: String,
    packetizer: Mpeg4Packetizer,
    frames: Vec<Span>,
    next_frame: usize,
}

impl Mpeg4EsReader {
    fn create(io: IoReader, options: SourceOptions) -> Result<Box<dyn Reader>> {
        Ok(Box::new(Mpeg4EsReader::open(io, options)?))
    }

    fn probe(data: &[u8]) -> ProbeResult {
        // Visual object sequence, visual object or VOL start code up front.
        if data.len() >= 4
            && data[0] == 0
            && data[1] == 0
            && data[2] == 1
            && (data[3] == 0xb0 || data[3] == 0xb5 || (0x20..=0x2f).contains(&data[3]))
        {
            ProbeResult::Maybe(0.6)
        } else {
            ProbeResult::Unsure
        }
    }

    pub fn open(mut io: IoReader, options: SourceOptions) -> Result<Mpeg4EsReader> {
        let io_name = io.name().to_string();
        let data = io.read_vec(io.size() as usize)?;

        // One frame per VOP; configuration headers stay glued to the first.
        let mut boundaries: Vec<usize> = Vec::new();
        for i in 0..data.len().saturating_sub(4) {
            if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 && data[i + 3] == 0xb6 {
                boundaries.push(i);
            }
        }

        let mut frames = Vec::new();
        let span = Span::from(data);
        for (index, &start) in boundaries.iter().enumerate() {
            let begin = if index == 0 { 0 } else { start };
            let end = boundaries
                .get(index + 1)
                .copied()
                .unwrap_or(span.len());
            frames.push(span.slice(begin..end));
        }

        if frames.is_empty() {
            return Err(crate::error::Error::invalid(
                &io_name,
                "MPEG-4",
                0,
                "stream contains no VOP",
            ));
        }

        let mut track = Track::new(TrackType::Video);
        track.default_duration = Some(DEFAULT_FRAME_DURATION_NS as u64);
        let mut packetizer = Mpeg4Packetizer::new(track);
        options.apply(0, &mut packetizer);

        Ok(Mpeg4EsReader {
            io_name,
            packetizer,
            frames,
            next_frame: 0,
        })
    }
}

impl Reader for Mpeg4EsReader {
    fn file_name(&self) -> &str {
        &self.io_name
    }

    fn container(&self) -> &'static str {
        "MPEG-4 part 2 elementary stream"
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
        let Some(frame) = self.frames.get(self.next_frame).cloned() else {
            return Ok(Status::Done);
        };
        self.next_frame += 1;

        self.packetizer.process(Frame::new(frame, -1))?;
        Ok(Status::MoreData)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::aac::{build_adts_header, PROFILE_LC};

    fn adts_stream(frames: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..frames {
            out.extend_from_slice(&build_adts_header(true, PROFILE_LC, 4, 2, 12));
            out.extend(std::iter::repeat(i as u8).take(12));
        }
        out
    }

    #[test]
    fn adts_probe_and_read() {
        let data = adts_stream(3);
        assert!(matches!(AdtsReader::probe(&data), ProbeResult::Maybe(_)));

        let io = IoReader::from_memory("test.aac", data);
        let mut reader = AdtsReader::open(io, SourceOptions::default()).unwrap();
        reader.read_headers().unwrap();

        assert_eq!(
            reader.packetizer.common().track.codec_id,
            "A_AAC/MPEG4/LC"
        );

        let mut frames = 0;
        while reader.read(0).unwrap() == Status::MoreData {
            frames += 1;
        }
        assert_eq!(frames, 3);

        // ADTS headers are stripped from the stored payloads.
        let packet = reader.packetizer.common_mut().queue.pop().unwrap();
        assert_eq!(packet.data.len(), 12);
    }

    #[test]
    fn adts_resyncs_over_garbage() {
        let mut data = adts_stream(1);
        data.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        data.extend_from_slice(&adts_stream(2));

        let options = SourceOptions::default();
        let warnings = options.warnings.clone();
        let io = IoReader::from_memory("dirty.aac", data);
        let mut reader = AdtsReader::open(io, options).unwrap();

        let mut frames = 0;
        while reader.read(0).unwrap() == Status::MoreData {
            frames += 1;
        }

        assert_eq!(frames, 3);
        assert_eq!(warnings.count(), 1);
    }

    fn avc_stream() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1f]); // SPS
        out.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xee]); // PPS
        out.extend_from_slice(&[0, 0, 0, 1, 0x65, 1, 2, 3]); // IDR slice
        out.extend_from_slice(&[0, 0, 0, 1, 0x41, 4, 5]); // non-IDR slice
        out
    }

    #[test]
    fn avc_units_become_length_prefixed_access_units() {
        let data = avc_stream();
        assert!(matches!(AvcEsReader::probe(&data), ProbeResult::Maybe(_)));

        let io = IoReader::from_memory("test.h264", data);
        let mut reader = AvcEsReader::open(io, SourceOptions::default()).unwrap();
        reader.read_headers().unwrap();

        let track = &reader.packetizer.common().track;
        assert_eq!(track.codec_id, "V_MPEG4/ISO/AVC");
        // The codec private is an AVCC record with nal_size_size 4.
        let private = track.codec_private.as_ref().unwrap();
        let config = AvcConfig::parse(private).unwrap();
        assert_eq!(config.nal_size_size, 4);
        assert_eq!(config.sps.len(), 1);

        assert_eq!(reader.read(0).unwrap(), Status::MoreData);
        assert_eq!(reader.read(0).unwrap(), Status::MoreData);
        assert_eq!(reader.read(0).unwrap(), Status::Done);

        let queue = &mut reader.packetizer.common_mut().queue;
        let first = queue.pop().unwrap();
        assert!(first.keyframe);
        let bytes = first.data.to_bytes();
        // SPS, PPS and the IDR slice, each with a 4-byte length prefix.
        assert_eq!(&bytes[0..4], &4u32.to_be_bytes());
        assert_eq!(bytes[4], 0x67);

        let second = queue.pop().unwrap();
        assert!(!second.keyframe);
        assert_eq!(second.timecode, DEFAULT_FRAME_DURATION_NS);
    }
}
