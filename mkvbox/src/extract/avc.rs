//! AVC/HEVC elementary-stream sink: parameter sets from the configuration
//! record first, then every NAL unit with its length prefix swapped for a
//! `00 00 00 01` start code.

use crate::codec::nal::{AvcConfig, HevcConfig, FOUR_BYTE_STARTCODE};
use crate::error::{Error, Result};
use crate::extract::{Output, Sink, SinkFrame};
use crate::io::IoWriter;
use crate::media::Track;
use crate::span::Span;

pub struct AvcSink {
    out: Output,
    hevc: bool,
    nal_size_size: u8,
}

impl AvcSink {
    pub fn new(path: &str, hevc: bool) -> AvcSink {
        AvcSink {
            out: Output::new(path),
            hevc,
            nal_size_size: 4,
        }
    }

    #[cfg(test)]
    pub fn memory(hevc: bool) -> AvcSink {
        AvcSink {
            out: Output::memory(),
            hevc,
            nal_size_size: 4,
        }
    }

    #[cfg(test)]
    pub fn into_bytes(self) -> Vec<u8> {
        self.out.into_writer().unwrap().into_memory().unwrap()
    }
}

fn write_nal(out: &mut IoWriter, nal: &Span) -> Result<()> {
    out.write_all(&FOUR_BYTE_STARTCODE)?;
    out.write_span(nal)
}

/// Walks `nal_size_size`-prefixed units in `data`, writing each with a
/// start code.
fn write_prefixed_units(out: &mut IoWriter, data: &Span, nal_size_size: u8) -> Result<()> {
    let raw = data.to_slice();
    let n = nal_size_size as usize;
    let mut pos = 0usize;

    while pos + n <= raw.len() {
        let mut size = 0usize;
        for &byte in &raw[pos..pos + n] {
            size = (size << 8) | byte as usize;
        }
        pos += n;

        if pos + size > raw.len() {
            return Err(Error::Unsupported(format!(
                "NAL of {size} bytes overruns its {} byte frame",
                raw.len()
            )));
        }
        write_nal(out, &data.slice(pos..pos + size))?;
        pos += size;
    }
    Ok(())
}

impl Sink for AvcSink {
    fn create_file(&mut self, track: &Track) -> Result<()> {
        let private = track.codec_private.as_ref().ok_or_else(|| {
            Error::Unsupported(format!(
                "track {} with the codec id '{}' is missing the codec private element \
                 and cannot be extracted",
                track.number, track.codec_id
            ))
        })?;

        if self.hevc {
            let config = HevcConfig::parse(private)?;
            self.nal_size_size = config.nal_size_size;

            let out = self.out.get()?;
            for set in &config.parameter_sets {
                write_nal(out, set)?;
            }
        } else {
            let config = AvcConfig::parse(private)?;
            self.nal_size_size = config.nal_size_size;

            let out = self.out.get()?;
            for set in config.sps.iter().chain(config.pps.iter()) {
                write_nal(out, set)?;
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: &SinkFrame) -> Result<()> {
        let nal_size_size = self.nal_size_size;
        write_prefixed_units(self.out.get()?, &frame.data, nal_size_size)
    }

    fn finish_file(&mut self) -> Result<()> {
        self.out.get()?.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::TrackType;

    #[test]
    fn config_sets_and_frames_get_start_codes() {
        let config = AvcConfig {
            profile: 100,
            profile_compat: 0,
            level: 31,
            nal_size_size: 4,
            sps: vec![Span::from(vec![0x67, 0xaa])],
            pps: vec![Span::from(vec![0x68, 0xbb])],
        };

        let mut track = Track::new(TrackType::Video);
        track.codec_id = "V_MPEG4/ISO/AVC".into();
        track.codec_private = Some(config.build());

        let mut sink = AvcSink::memory(false);
        sink.create_file(&track).unwrap();

        // One frame holding two length-prefixed NAL units.
        let mut payload = Vec::new();
        payload.extend_from_slice(&3u32.to_be_bytes());
        payload.extend_from_slice(&[0x65, 1, 2]);
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.extend_from_slice(&[0x41, 3]);

        sink.handle_frame(&SinkFrame {
            data: Span::from(payload),
            additions: Vec::new(),
            timecode: 0,
            duration: None,
            bref: 0,
            fref: 0,
            keyframe: true,
            discardable: false,
            references_valid: true,
            codec_state: None,
        })
        .unwrap();
        sink.finish_file().unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&[0, 0, 0, 1, 0x67, 0xaa]);
        expected.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xbb]);
        expected.extend_from_slice(&[0, 0, 0, 1, 0x65, 1, 2]);
        expected.extend_from_slice(&[0, 0, 0, 1, 0x41, 3]);

        assert_eq!(sink.into_bytes(), expected);
    }

    #[test]
    fn missing_codec_private_is_an_error() {
        let mut track = Track::new(TrackType::Video);
        track.codec_id = "V_MPEG4/ISO/AVC".into();

        let mut sink = AvcSink::memory(false);
        assert!(sink.create_file(&track).is_err());
    }
}
