//! Mux-then-extract round trips through real sink files.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use mkvbox::codec::{Frame, Packetizer, PacketizerCommon};
use mkvbox::error::{Result, Warnings};
use mkvbox::extract::{extract_tracks, timecodes, ExtractOptions, TrackSpec};
use mkvbox::format::mkv::MatroskaFile;
use mkvbox::format::{Reader, Status};
use mkvbox::io::{IoReader, IoWriter};
use mkvbox::media::{AudioParams, Track, TrackType};
use mkvbox::mux::{MuxOptions, Muxer};
use mkvbox::Span;

/// A packetizer that passes frames through untouched.
struct PlainPacketizer {
    common: PacketizerCommon,
}

impl PlainPacketizer {
    fn new(track: Track) -> PlainPacketizer {
        PlainPacketizer {
            common: PacketizerCommon::new(track),
        }
    }
}

impl Packetizer for PlainPacketizer {
    fn common(&self) -> &PacketizerCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut PacketizerCommon {
        &mut self.common
    }

    fn set_headers(&mut self) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, frame: Frame) -> Result<()> {
        self.common.add_packet(frame)
    }
}

struct OneTrackReader {
    packetizer: PlainPacketizer,
    frames: VecDeque<Frame>,
}

impl Reader for OneTrackReader {
    fn file_name(&self) -> &str {
        "memory"
    }

    fn container(&self) -> &'static str {
        "test"
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
        match self.frames.pop_front() {
            Some(frame) => {
                self.packetizer.process(frame)?;
                Ok(Status::MoreData)
            }
            None => Ok(Status::Done),
        }
    }
}

fn mux_single_track(track: Track, frames: Vec<Frame>) -> Vec<u8> {
    let reader = OneTrackReader {
        packetizer: PlainPacketizer::new(track),
        frames: frames.into(),
    };

    let mut muxer = Muxer::new(
        IoWriter::memory(),
        vec![Box::new(reader)],
        MuxOptions {
            deterministic: true,
            ..MuxOptions::default()
        },
        Warnings::new(),
    )
    .unwrap();
    muxer.run(&AtomicBool::new(false)).unwrap();
    muxer.into_output().into_memory().unwrap()
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("mkvbox-extract-test-{}-{name}", std::process::id()))
}

#[test]
fn utf8_subtitles_become_srt() {
    let mut track = Track::new(TrackType::Subtitle);
    track.codec_id = "S_TEXT/UTF8".into();

    let frames = vec![
        Frame::new(b"First line".to_vec(), 1_000_000_000).with_duration(2_000_000_000),
        Frame::new(b"Second".to_vec(), 4_000_000_000).with_duration(500_000_000),
    ];
    let mkv_bytes = mux_single_track(track, frames);

    let out_path = temp_path("subs.srt");
    let io = IoReader::from_memory("in.mkv", mkv_bytes);
    let mut mkv = MatroskaFile::open(io, Warnings::new()).unwrap();
    extract_tracks(
        &mut mkv,
        &[TrackSpec {
            track: 1,
            output: out_path.display().to_string(),
            fullraw: false,
        }],
        &ExtractOptions::default(),
    )
    .unwrap();

    let srt = std::fs::read_to_string(&out_path).unwrap();
    std::fs::remove_file(&out_path).ok();

    assert!(srt.starts_with("1\n00:00:01,000 --> 00:00:03,000\nFirst line\n\n"));
    assert!(srt.contains("2\n00:00:04,000 --> 00:00:04,500\nSecond\n\n"));
}

#[test]
fn ass_events_are_sorted_by_read_order() {
    let mut track = Track::new(TrackType::Subtitle);
    track.codec_id = "S_TEXT/ASS".into();
    track.codec_private = Some(Span::from(
        b"[Script Info]\nTitle: x\n\n[Events]\nFormat: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\n"
            .to_vec(),
    ));

    // Packets arrive in ReadOrder 3, 1, 2, 4, 0.
    let frames: Vec<Frame> = [(3u64, 30i64), (1, 10), (2, 20), (4, 40), (0, 0)]
        .iter()
        .map(|&(order, seconds)| {
            Frame::new(
                format!("{order},0,Default,,0,0,0,,line {order}").into_bytes(),
                seconds * 1_000_000_000,
            )
            .with_duration(1_000_000_000)
        })
        .collect();
    let mkv_bytes = mux_single_track(track, frames);

    let out_path = temp_path("subs.ass");
    let io = IoReader::from_memory("in.mkv", mkv_bytes);
    let mut mkv = MatroskaFile::open(io, Warnings::new()).unwrap();
    extract_tracks(
        &mut mkv,
        &[TrackSpec {
            track: 1,
            output: out_path.display().to_string(),
            fullraw: false,
        }],
        &ExtractOptions::default(),
    )
    .unwrap();

    let script = std::fs::read_to_string(&out_path).unwrap();
    std::fs::remove_file(&out_path).ok();

    let format_pos = script.find("Format: Layer").unwrap();
    let first_dialogue = script.find("Dialogue:").unwrap();
    assert!(format_pos < first_dialogue);

    let positions: Vec<usize> = (0..5)
        .map(|i| script.find(&format!("line {i}")).unwrap())
        .collect();
    assert!(
        positions.windows(2).all(|w| w[0] < w[1]),
        "events are not in ReadOrder: {script}"
    );
}

#[test]
fn aac_extraction_reframes_adts() {
    let mut track = Track::new(TrackType::Audio);
    track.codec_id = "A_AAC/MPEG4/LC".into();
    track.audio = Some(AudioParams {
        sample_rate: 44100.0,
        channels: 2,
        bit_depth: None,
    });
    track.codec_private = Some(Span::from(
        mkvbox::codec::aac::audio_specific_config(mkvbox::codec::aac::PROFILE_LC, 4, 2).to_vec(),
    ));

    let frames = vec![
        Frame::new(vec![0x21u8; 100], 0),
        Frame::new(vec![0x22u8; 90], 23_219_954),
    ];
    let mkv_bytes = mux_single_track(track, frames);

    let out_path = temp_path("audio.aac");
    let io = IoReader::from_memory("in.mkv", mkv_bytes);
    let mut mkv = MatroskaFile::open(io, Warnings::new()).unwrap();
    extract_tracks(
        &mut mkv,
        &[TrackSpec {
            track: 1,
            output: out_path.display().to_string(),
            fullraw: false,
        }],
        &ExtractOptions::default(),
    )
    .unwrap();

    let adts = std::fs::read(&out_path).unwrap();
    std::fs::remove_file(&out_path).ok();

    let header = mkvbox::codec::aac::parse_adts(&adts).expect("leading ADTS header");
    assert!(header.mpeg4);
    assert_eq!(header.frame_length, 107);
    assert_eq!(adts.len(), 107 + 97);

    // The second frame follows immediately with its own header.
    let second = mkvbox::codec::aac::parse_adts(&adts[107..]).expect("second header");
    assert_eq!(second.frame_length, 97);
}

#[test]
fn timecode_dump_is_sorted_milliseconds() {
    let mut track = Track::new(TrackType::Audio);
    track.codec_id = "A_MPEG/L3".into();
    track.audio = Some(AudioParams {
        sample_rate: 44100.0,
        channels: 2,
        bit_depth: None,
    });

    let frames = vec![
        Frame::new(vec![1u8; 4], 0).with_duration(26_000_000),
        Frame::new(vec![2u8; 4], 26_000_000).with_duration(26_000_000),
        Frame::new(vec![3u8; 4], 52_000_000).with_duration(26_000_000),
    ];
    let mkv_bytes = mux_single_track(track, frames);

    let out_path = temp_path("timecodes.txt");
    let io = IoReader::from_memory("in.mkv", mkv_bytes);
    let mut mkv = MatroskaFile::open(io, Warnings::new()).unwrap();
    timecodes::extract_timecodes(&mut mkv, 1, &out_path.display().to_string()).unwrap();

    let dump = std::fs::read_to_string(&out_path).unwrap();
    std::fs::remove_file(&out_path).ok();

    assert_eq!(dump, "# timecode format v2\n0\n26\n52\n");
}

#[test]
fn fullraw_prepends_codec_private() {
    let mut track = Track::new(TrackType::Audio);
    track.codec_id = "A_MPEG/L3".into();
    track.codec_private = Some(Span::from(b"HDR!".to_vec()));
    track.audio = Some(AudioParams {
        sample_rate: 44100.0,
        channels: 2,
        bit_depth: None,
    });

    let frames = vec![Frame::new(b"payload".to_vec(), 0)];
    let mkv_bytes = mux_single_track(track, frames);

    let out_path = temp_path("full.raw");
    let io = IoReader::from_memory("in.mkv", mkv_bytes);
    let mut mkv = MatroskaFile::open(io, Warnings::new()).unwrap();
    extract_tracks(
        &mut mkv,
        &[TrackSpec {
            track: 1,
            output: out_path.display().to_string(),
            fullraw: true,
        }],
        &ExtractOptions::default(),
    )
    .unwrap();

    let raw = std::fs::read(&out_path).unwrap();
    std::fs::remove_file(&out_path).ok();

    assert_eq!(raw, b"HDR!payload");
}
