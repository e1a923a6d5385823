//! Verbatim extraction: plain payload dumps, the "fullraw" variant that
//! prepends codec private data and codec-state changes, and the ADTS
//! re-framing sink for AAC.

use crate::codec::aac;
use crate::error::{Error, Result};
use crate::extract::{Output, Sink, SinkFrame};
use crate::media::Track;

pub struct RawSink {
    out: Output,
    fullraw: bool,
}

impl RawSink {
    pub fn new(path: &str, fullraw: bool) -> RawSink {
        RawSink {
            out: Output::new(path),
            fullraw,
        }
    }

    #[cfg(test)]
    pub fn memory(fullraw: bool) -> RawSink {
        RawSink {
            out: Output::memory(),
            fullraw,
        }
    }

    #[cfg(test)]
    pub fn into_bytes(self) -> Vec<u8> {
        self.out.into_writer().unwrap().into_memory().unwrap()
    }
}

impl Sink for RawSink {
    fn create_file(&mut self, track: &Track) -> Result<()> {
        let out = self.out.get()?;
        if self.fullraw {
            if let Some(private) = &track.codec_private {
                out.write_span(private)?;
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: &SinkFrame) -> Result<()> {
        let out = self.out.get()?;
        if self.fullraw {
            if let Some(state) = &frame.codec_state {
                out.write_span(state)?;
            }
        }
        out.write_span(&frame.data)?;
        Ok(())
    }

    fn finish_file(&mut self) -> Result<()> {
        self.out.get()?.flush()
    }
}

/// AAC frames leave Matroska bare; each one gets a fresh 7-byte ADTS
/// header. The header's version bit comes from the codec id suffix.
pub struct AdtsSink {
    out: Output,
    mpeg4: bool,
    profile: u8,
    sample_rate_index: u8,
    channels: u8,
}

impl AdtsSink {
    pub fn new(path: &str) -> AdtsSink {
        AdtsSink {
            out: Output::new(path),
            mpeg4: true,
            profile: aac::PROFILE_LC,
            sample_rate_index: 4,
            channels: 2,
        }
    }

    #[cfg(test)]
    pub fn memory() -> AdtsSink {
        AdtsSink {
            out: Output::memory(),
            mpeg4: true,
            profile: aac::PROFILE_LC,
            sample_rate_index: 4,
            channels: 2,
        }
    }

    #[cfg(test)]
    pub fn into_bytes(self) -> Vec<u8> {
        self.out.into_writer().unwrap().into_memory().unwrap()
    }
}

impl Sink for AdtsSink {
    fn create_file(&mut self, track: &Track) -> Result<()> {
        if let Some((mpeg4, profile)) = aac::parse_codec_id(&track.codec_id) {
            self.mpeg4 = mpeg4;
            self.profile = profile;
        }

        // The AudioSpecificConfig is the better parameter source when
        // present; the track audio settings are the fallback.
        if let Some(private) = &track.codec_private {
            let raw = private.to_slice();
            if raw.len() >= 2 {
                self.profile = ((raw[0] >> 3) as u8).saturating_sub(1).min(3);
                self.sample_rate_index = ((raw[0] & 0x07) << 1) | (raw[1] >> 7);
                self.channels = (raw[1] >> 3) & 0x0f;
            }
        } else if let Some(audio) = &track.audio {
            self.channels = audio.channels.min(7) as u8;
            self.sample_rate_index = aac::sample_rate_index(audio.sample_rate as u32)
                .ok_or_else(|| {
                    Error::Unsupported(format!(
                        "AAC sample rate {} cannot be expressed in ADTS",
                        audio.sample_rate
                    ))
                })?;
        }

        self.out.get()?;
        Ok(())
    }

    fn handle_frame(&mut self, frame: &SinkFrame) -> Result<()> {
        let header = aac::build_adts_header(
            self.mpeg4,
            self.profile,
            self.sample_rate_index,
            self.channels,
            frame.data.len(),
        );

        let out = self.out.get()?;
        out.write_all(&header)?;
        out.write_span(&frame.data)?;
        Ok(())
    }

    fn finish_file(&mut self) -> Result<()> {
        self.out.get()?.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::TrackType;
    use crate::span::Span;

    fn frame(data: &[u8]) -> SinkFrame {
        SinkFrame {
            data: Span::from(data.to_vec()),
            additions: Vec::new(),
            timecode: 0,
            duration: None,
            bref: 0,
            fref: 0,
            keyframe: true,
            discardable: false,
            references_valid: false,
            codec_state: None,
        }
    }

    #[test]
    fn fullraw_prepends_private_and_codec_state() {
        let mut track = Track::new(TrackType::Audio);
        track.codec_private = Some(Span::from(b"PRIV".to_vec()));

        let mut sink = RawSink::memory(true);
        sink.create_file(&track).unwrap();

        let mut second = frame(b"bb");
        second.codec_state = Some(Span::from(b"STATE".to_vec()));

        sink.handle_frame(&frame(b"aa")).unwrap();
        sink.handle_frame(&second).unwrap();
        sink.finish_file().unwrap();

        assert_eq!(sink.into_bytes(), b"PRIVaaSTATEbb");
    }

    #[test]
    fn adts_sink_reframes_aac() {
        let mut track = Track::new(TrackType::Audio);
        track.codec_id = "A_AAC/MPEG4/LC".into();
        track.codec_private =
            Some(Span::from(aac::audio_specific_config(aac::PROFILE_LC, 4, 2).to_vec()));

        let mut sink = AdtsSink::memory();
        sink.create_file(&track).unwrap();
        sink.handle_frame(&frame(&[9u8; 20])).unwrap();
        sink.finish_file().unwrap();

        let bytes = sink.into_bytes();
        let parsed = aac::parse_adts(&bytes).expect("valid ADTS header");

        assert!(parsed.mpeg4);
        assert_eq!(parsed.profile, aac::PROFILE_LC);
        assert_eq!(parsed.sample_rate_index, 4);
        assert_eq!(parsed.channels, 2);
        assert_eq!(parsed.frame_length, 27);
        assert_eq!(bytes.len(), 27);
    }
}
