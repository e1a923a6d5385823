//! End-to-end mux tests: synthetic readers feed the orchestrator, the
//! resulting bytes are walked back with the Matroska reader.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;

use mkvbox::codec::passthrough::{AudioPacketizer, VideoPacketizer};
use mkvbox::codec::{Frame, Packetizer};
use mkvbox::error::{Result, Warnings};
use mkvbox::format::mkv::MatroskaFile;
use mkvbox::format::{Reader, Status};
use mkvbox::io::{IoReader, IoWriter};
use mkvbox::media::{AudioParams, Track, TrackType, VideoParams};
use mkvbox::mux::{MuxOptions, Muxer};
use mkvbox::Span;

/// A reader over canned frames, one queue per packetizer.
struct TestReader {
    packetizers: Vec<Box<dyn Packetizer>>,
    frames: Vec<VecDeque<Frame>>,
}

impl TestReader {
    fn new(tracks: Vec<(Box<dyn Packetizer>, Vec<Frame>)>) -> TestReader {
        let mut packetizers = Vec::new();
        let mut frames = Vec::new();
        for (packetizer, track_frames) in tracks {
            packetizers.push(packetizer);
            frames.push(track_frames.into());
        }
        TestReader {
            packetizers,
            frames,
        }
    }
}

impl Reader for TestReader {
    fn file_name(&self) -> &str {
        "test-input"
    }

    fn container(&self) -> &'static str {
        "test"
    }

    fn read_headers(&mut self) -> Result<()> {
        for packetizer in &mut self.packetizers {
            packetizer.set_headers()?;
        }
        Ok(())
    }

    fn packetizer_count(&self) -> usize {
        self.packetizers.len()
    }

    fn packetizer(&self, index: usize) -> &dyn Packetizer {
        self.packetizers[index].as_ref()
    }

    fn packetizer_mut(&mut self, index: usize) -> &mut dyn Packetizer {
        self.packetizers[index].as_mut()
    }

    fn read(&mut self, index: usize) -> Result<Status> {
        match self.frames[index].pop_front() {
            Some(frame) => {
                self.packetizers[index].process(frame)?;
                Ok(Status::MoreData)
            }
            None => Ok(Status::Done),
        }
    }
}

fn video_track() -> Track {
    let mut track = Track::new(TrackType::Video);
    track.codec_id = "V_MS/VFW/FOURCC/XVID".into();
    track.default_duration = Some(40_000_000);
    track.video = Some(VideoParams {
        pixel_width: 320,
        pixel_height: 240,
        ..VideoParams::default()
    });
    track
}

fn audio_track() -> Track {
    let mut track = Track::new(TrackType::Audio);
    track.codec_id = "A_MPEG/L3".into();
    track.audio = Some(AudioParams {
        sample_rate: 44100.0,
        channels: 2,
        bit_depth: None,
    });
    track
}

/// Scenario: 25 video frames at 40 ms plus 43 MP3 frames at ~23.22 ms,
/// one second of content, no reorder.
fn one_second_muxer(out: IoWriter, options: MuxOptions) -> Muxer {
    let video_frames: Vec<Frame> = (0..25)
        .map(|i| Frame::new(vec![0x10u8 + i as u8; 64], -1).keyframe(i == 0))
        .collect();
    let audio_frames: Vec<Frame> = (0..43)
        .map(|i| Frame::new(vec![0x60u8; 32 + i as usize % 3], -1))
        .collect();

    let reader = TestReader::new(vec![
        (
            Box::new(VideoPacketizer::new(video_track())) as Box<dyn Packetizer>,
            video_frames,
        ),
        (
            // 1024 samples at 44.1 kHz: one frame every ~23.22 ms.
            Box::new(AudioPacketizer::new(audio_track(), 1024)) as Box<dyn Packetizer>,
            audio_frames,
        ),
    ]);

    Muxer::new(out, vec![Box::new(reader)], options, Warnings::new()).unwrap()
}

fn mux_one_second(options: MuxOptions) -> Vec<u8> {
    let mut muxer = one_second_muxer(IoWriter::memory(), options);
    let report = muxer.run(&AtomicBool::new(false)).unwrap();
    assert_eq!(report.warnings, 0);
    muxer.into_output().into_memory().unwrap()
}

#[test]
fn one_second_av_mux_has_expected_shape() {
    let bytes = mux_one_second(MuxOptions {
        deterministic: true,
        ..MuxOptions::default()
    });

    let io = IoReader::from_memory("out.mkv", bytes.clone());
    let mut mkv = MatroskaFile::open(io, Warnings::new()).unwrap();

    assert_eq!(mkv.timecode_scale, 1_000_000);
    assert_eq!(mkv.tracks.len(), 2);
    assert_eq!(mkv.tracks[0].number, 1);
    assert_eq!(mkv.tracks[1].number, 2);
    assert_eq!(mkv.tracks[0].track_type, Some(TrackType::Video));

    // Duration covers the full second of content.
    let duration = mkv.duration_ticks.unwrap();
    assert!((999.0..=1005.0).contains(&duration), "duration {duration}");

    let mut video_blocks = 0;
    let mut audio_blocks = 0;
    let mut last_timecode = i64::MIN;
    while let Some(block) = mkv.next_block().unwrap() {
        match block.track {
            1 => video_blocks += 1,
            2 => audio_blocks += 1,
            other => panic!("unexpected track {other}"),
        }
        // Interleaved by timecode across the whole file.
        assert!(block.timecode >= last_timecode);
        last_timecode = block.timecode;
    }
    assert_eq!(video_blocks, 25);
    assert_eq!(audio_blocks, 43);

    // Cues for the video key frame are present.
    let cues_id = 0x1c53bb6bu32.to_be_bytes();
    assert!(bytes.windows(4).any(|w| w == cues_id));
}

#[test]
fn deterministic_mode_is_byte_identical() {
    let options = || MuxOptions {
        deterministic: true,
        ..MuxOptions::default()
    };

    let first = mux_one_second(options());
    let second = mux_one_second(options());

    assert_eq!(first, second);
}

#[test]
fn no_cues_suppresses_the_index() {
    let bytes = mux_one_second(MuxOptions {
        deterministic: true,
        no_cues: true,
        ..MuxOptions::default()
    });

    let cues_id = 0x1c53bb6bu32.to_be_bytes();
    assert!(!bytes.windows(4).any(|w| w == cues_id));
}

#[test]
fn b_frames_render_two_references() {
    // Presentation order I B P delivered in queue order I P B, the way a
    // reordering packetizer emits them.
    let mut p_frame = Frame::new(vec![2u8; 16], 80_000_000).keyframe(false);
    p_frame.bref = 40_000_000;
    let mut b_frame = Frame::new(vec![3u8; 16], 60_000_000).keyframe(false);
    b_frame.bref = 40_000_000;
    b_frame.fref = 80_000_000;

    let frames = vec![
        Frame::new(vec![1u8; 16], 40_000_000).keyframe(true),
        p_frame,
        b_frame,
    ];

    let reader = TestReader::new(vec![(
        Box::new(VideoPacketizer::new(video_track())) as Box<dyn Packetizer>,
        frames,
    )]);

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
    let bytes = muxer.into_output().into_memory().unwrap();

    let io = IoReader::from_memory("bframes.mkv", bytes);
    let mut mkv = MatroskaFile::open(io, Warnings::new()).unwrap();

    let key = mkv.next_block().unwrap().unwrap();
    assert!(key.keyframe);
    assert_eq!(key.timecode, 40_000_000);

    let p_block = mkv.next_block().unwrap().unwrap();
    assert!(!p_block.keyframe);
    assert_eq!(p_block.timecode, 80_000_000);
    assert_eq!(p_block.bref, 40_000_000);
    assert_eq!(p_block.fref, 0);

    let b_block = mkv.next_block().unwrap().unwrap();
    assert_eq!(b_block.timecode, 60_000_000);
    assert_eq!(b_block.bref, 40_000_000);
    assert_eq!(b_block.fref, 80_000_000);
}

#[test]
fn block_additions_survive_the_round_trip() {
    let mut frame = Frame::new(vec![0xabu8; 24], 0);
    frame.additions = Some(Span::from(vec![0xcdu8; 12]));

    let reader = TestReader::new(vec![(
        Box::new(AudioPacketizer::new(audio_track(), 1152)) as Box<dyn Packetizer>,
        vec![frame],
    )]);

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
    let bytes = muxer.into_output().into_memory().unwrap();

    let io = IoReader::from_memory("additions.mkv", bytes);
    let mut mkv = MatroskaFile::open(io, Warnings::new()).unwrap();

    let block = mkv.next_block().unwrap().unwrap();
    assert_eq!(block.frames[0].to_bytes(), vec![0xabu8; 24]);
    assert_eq!(block.additions.len(), 1);
    assert_eq!(block.additions[0].to_bytes(), vec![0xcdu8; 12]);
}

#[test]
fn cluster_time_bound_splits_clusters() {
    // Two audio packets 40 seconds apart cannot share a cluster.
    let frames = vec![
        Frame::new(vec![1u8; 8], 0),
        Frame::new(vec![2u8; 8], 40_000_000_000),
    ];

    let reader = TestReader::new(vec![(
        Box::new(AudioPacketizer::new(audio_track(), 1152)) as Box<dyn Packetizer>,
        frames,
    )]);

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
    let report = muxer.run(&AtomicBool::new(false)).unwrap();
    assert!(report.clusters_rendered >= 2);

    let bytes = muxer.into_output().into_memory().unwrap();
    let io = IoReader::from_memory("split.mkv", bytes);
    let mut mkv = MatroskaFile::open(io, Warnings::new()).unwrap();

    let first = mkv.next_block().unwrap().unwrap();
    assert_eq!(first.timecode, 0);
    let second = mkv.next_block().unwrap().unwrap();
    assert_eq!(second.timecode, 40_000_000_000);
}

#[test]
fn segment_size_is_finite_after_patching() {
    let bytes = mux_one_second(MuxOptions {
        deterministic: true,
        ..MuxOptions::default()
    });

    // Find the Segment id and check its size VINT is not the unknown-size
    // sentinel anymore.
    let segment_id = 0x18538067u32.to_be_bytes();
    let pos = bytes
        .windows(4)
        .position(|w| w == segment_id)
        .expect("segment id");
    let size_bytes = &bytes[pos + 4..pos + 12];
    assert_eq!(size_bytes[0], 0x01, "8 byte width");
    assert_ne!(&size_bytes[1..], &[0xff; 7], "not the unknown-size sentinel");

    let declared = u64::from_be_bytes(size_bytes.try_into().unwrap()) & ((1 << 56) - 1);
    assert_eq!(declared as usize, bytes.len() - (pos + 12));
}
