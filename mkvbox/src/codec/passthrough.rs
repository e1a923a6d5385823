//! Generic packetizers for codecs that need no payload transformation:
//! plain video frames, fixed-samples-per-frame audio and timed text.

use crate::codec::{ConnectResult, Frame, Packetizer, PacketizerCommon};
use crate::error::Result;
use crate::media::Track;

/// Frame-for-frame video. Derives timecodes from the default duration and
/// turns "not a key frame" into a backward reference to the previous frame.
pub struct VideoPacketizer {
    common: PacketizerCommon,
    frames_output: u64,
    last_timecode: i64,
}

impl VideoPacketizer {
    pub fn new(track: Track) -> VideoPacketizer {
        VideoPacketizer {
            common: PacketizerCommon::new(track),
            frames_output: 0,
            last_timecode: -1,
        }
    }
}

impl Packetizer for VideoPacketizer {
    fn common(&self) -> &PacketizerCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut PacketizerCommon {
        &mut self.common
    }

    fn set_headers(&mut self) -> Result<()> {
        self.common.track.flag_lacing = false;
        Ok(())
    }

    fn process(&mut self, mut frame: Frame) -> Result<()> {
        let duration = self
            .common
            .track
            .default_duration
            .unwrap_or(40_000_000) as i64;

        if frame.timecode == -1 {
            frame.timecode = self.frames_output as i64 * duration;
        }
        if frame.duration.is_none() {
            frame.duration = Some(duration);
        }

        if frame.keyframe == Some(false) && frame.bref == 0 && self.last_timecode >= 0 {
            frame.bref = self.last_timecode;
        }

        self.frames_output += 1;
        self.last_timecode = frame.timecode;
        self.common.add_packet(frame)
    }

    fn can_connect_to(&self, other: &dyn Packetizer) -> ConnectResult {
        super::connect_check(&self.common.track, &other.common().track)
    }
}

/// Audio with a fixed number of samples per frame (MP3, PCM, AC-3 style).
pub struct AudioPacketizer {
    common: PacketizerCommon,
    samples_per_frame: u64,
    samples_output: u64,
}

impl AudioPacketizer {
    pub fn new(track: Track, samples_per_frame: u64) -> AudioPacketizer {
        AudioPacketizer {
            common: PacketizerCommon::new(track),
            samples_per_frame,
            samples_output: 0,
        }
    }

    fn sample_rate(&self) -> f64 {
        self.common
            .track
            .audio
            .as_ref()
            .map(|a| a.sample_rate)
            .unwrap_or(8000.0)
    }
}

impl Packetizer for AudioPacketizer {
    fn common(&self) -> &PacketizerCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut PacketizerCommon {
        &mut self.common
    }

    fn set_headers(&mut self) -> Result<()> {
        let rate = self.sample_rate();
        if self.common.track.default_duration.is_none() && rate > 0.0 {
            self.common.track.default_duration =
                Some((self.samples_per_frame as f64 * 1_000_000_000.0 / rate) as u64);
        }
        Ok(())
    }

    fn process(&mut self, mut frame: Frame) -> Result<()> {
        let rate = self.sample_rate();

        if frame.timecode == -1 {
            frame.timecode =
                (self.samples_output as f64 * 1_000_000_000.0 / rate) as i64;
        }
        if frame.duration.is_none() {
            frame.duration =
                Some((self.samples_per_frame as f64 * 1_000_000_000.0 / rate) as i64);
        }

        self.samples_output += self.samples_per_frame;
        self.common.add_packet(frame)
    }
}

/// Timed text. Every entry is a key frame and must carry a duration.
pub struct TextPacketizer {
    common: PacketizerCommon,
}

impl TextPacketizer {
    pub fn new(track: Track) -> TextPacketizer {
        TextPacketizer {
            common: PacketizerCommon::new(track),
        }
    }
}

impl Packetizer for TextPacketizer {
    fn common(&self) -> &PacketizerCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut PacketizerCommon {
        &mut self.common
    }

    fn set_headers(&mut self) -> Result<()> {
        self.common.track.flag_lacing = false;
        Ok(())
    }

    fn process(&mut self, mut frame: Frame) -> Result<()> {
        frame.keyframe = Some(true);
        self.common.add_packet(frame)
    }
}
