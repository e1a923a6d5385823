use std::io::Read;

use crate::ebml::{ids, Element};
use crate::error::{Error, Result};
use crate::span::Span;

/// Matroska codec id strings understood by the packetizers and sinks.
pub mod codec_ids {
    pub const V_MPEG4_AVC: &str = "V_MPEG4/ISO/AVC";
    pub const V_MPEGH_HEVC: &str = "V_MPEGH/ISO/HEVC";
    pub const V_MPEG4_ASP: &str = "V_MPEG4/ISO/ASP";
    pub const V_THEORA: &str = "V_THEORA";
    pub const V_REAL_PREFIX: &str = "V_REAL/";

    pub const A_VORBIS: &str = "A_VORBIS";
    pub const A_MPEG_L3: &str = "A_MPEG/L3";
    pub const A_PCM: &str = "A_PCM/INT/LIT";
    pub const A_AAC_MPEG2_PREFIX: &str = "A_AAC/MPEG2/";
    pub const A_AAC_MPEG4_PREFIX: &str = "A_AAC/MPEG4/";
    pub const A_ALAC: &str = "A_ALAC";
    pub const A_WAVPACK4: &str = "A_WAVPACK4";
    pub const A_FLAC: &str = "A_FLAC";
    pub const A_REAL_PREFIX: &str = "A_REAL/";

    pub const S_TEXT_UTF8: &str = "S_TEXT/UTF8";
    pub const S_TEXT_SSA: &str = "S_TEXT/SSA";
    pub const S_TEXT_ASS: &str = "S_TEXT/ASS";
    pub const S_VOBSUB: &str = "S_VOBSUB";
    pub const S_KATE: &str = "S_KATE";

    pub const B_VOBBTN: &str = "B_VOBBTN";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackType {
    Video,
    Audio,
    Subtitle,
    Buttons,
}

impl TrackType {
    pub fn to_id(self) -> u64 {
        match self {
            TrackType::Video => 1,
            TrackType::Audio => 2,
            TrackType::Subtitle => 0x11,
            TrackType::Buttons => 0x12,
        }
    }

    pub fn from_id(id: u64) -> Option<TrackType> {
        match id {
            1 => Some(TrackType::Video),
            2 => Some(TrackType::Audio),
            0x11 => Some(TrackType::Subtitle),
            0x12 => Some(TrackType::Buttons),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            TrackType::Video => "video",
            TrackType::Audio => "audio",
            TrackType::Subtitle => "subtitles",
            TrackType::Buttons => "buttons",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoParams {
    pub pixel_width: u64,
    pub pixel_height: u64,
    pub display_width: Option<u64>,
    pub display_height: Option<u64>,
    pub frame_rate: Option<f64>,
    pub interlaced: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioParams {
    pub sample_rate: f64,
    pub channels: u64,
    pub bit_depth: Option<u64>,
}

impl Default for AudioParams {
    fn default() -> Self {
        AudioParams {
            sample_rate: 8000.0,
            channels: 1,
            bit_depth: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgo {
    Zlib,
    Bzip2,
    Lzo1x,
}

impl CompressionAlgo {
    pub fn to_id(self) -> u64 {
        match self {
            CompressionAlgo::Zlib => 0,
            CompressionAlgo::Bzip2 => 1,
            CompressionAlgo::Lzo1x => 2,
        }
    }

    pub fn from_id(id: u64) -> Option<CompressionAlgo> {
        match id {
            0 => Some(CompressionAlgo::Zlib),
            1 => Some(CompressionAlgo::Bzip2),
            2 => Some(CompressionAlgo::Lzo1x),
            _ => None,
        }
    }
}

/// One entry of a track's ContentEncodings chain, ordered by `order`.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentEncoding {
    pub order: u64,
    /// Bit 1: blocks, bit 2: codec private. Only block scope is applied here.
    pub scope: u64,
    pub compression: CompressionAlgo,
}

impl ContentEncoding {
    pub fn zlib() -> ContentEncoding {
        ContentEncoding {
            order: 0,
            scope: 1,
            compression: CompressionAlgo::Zlib,
        }
    }

    pub fn compress(&self, data: &Span) -> Result<Span> {
        match self.compression {
            CompressionAlgo::Zlib => {
                use std::io::Write;

                let mut encoder = libflate::zlib::Encoder::new(Vec::new())?;
                for piece in data.spans() {
                    encoder.write_all(piece)?;
                }
                let compressed = encoder.finish().into_result()?;
                Ok(Span::from(compressed))
            }
            other => Err(Error::Unsupported(format!(
                "content compression {other:?} is not implemented"
            ))),
        }
    }

    pub fn decompress(&self, data: &Span) -> Result<Span> {
        match self.compression {
            CompressionAlgo::Zlib => {
                let raw = data.to_slice();
                let mut decoder = libflate::zlib::Decoder::new(&raw[..])?;
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(Span::from(out))
            }
            other => Err(Error::Unsupported(format!(
                "content compression {other:?} is not implemented"
            ))),
        }
    }
}

/// A stable identity within an output file. Owned by its packetizer once one
/// exists; the muxer renders one TrackEntry per in-use track.
#[derive(Debug, Clone, Default)]
pub struct Track {
    /// 1-based, unique per output file. Assigned by the orchestrator.
    pub number: u64,
    pub uid: u64,
    pub track_type: Option<TrackType>,
    pub codec_id: String,
    pub codec_private: Option<Span>,
    /// Nanoseconds per frame.
    pub default_duration: Option<u64>,
    pub language: String,
    pub flag_default: bool,
    pub flag_lacing: bool,
    pub video: Option<VideoParams>,
    pub audio: Option<AudioParams>,
    pub encodings: Vec<ContentEncoding>,
    /// Tracks not requested via the track order are recognized but unused.
    pub in_use: bool,
}

impl Track {
    pub fn new(track_type: TrackType) -> Track {
        Track {
            track_type: Some(track_type),
            language: "eng".into(),
            flag_lacing: true,
            in_use: true,
            ..Track::default()
        }
    }

    /// Applies the encoding chain to a block payload, lowest order first.
    pub fn encode_block(&self, data: Span) -> Result<Span> {
        let mut data = data;
        let mut chain: Vec<&ContentEncoding> =
            self.encodings.iter().filter(|e| e.scope & 1 != 0).collect();
        chain.sort_by_key(|e| e.order);

        for encoding in chain {
            data = encoding.compress(&data)?;
        }
        Ok(data)
    }

    /// Reverses the encoding chain, highest order first.
    pub fn decode_block(&self, data: Span) -> Result<Span> {
        let mut data = data;
        let mut chain: Vec<&ContentEncoding> =
            self.encodings.iter().filter(|e| e.scope & 1 != 0).collect();
        chain.sort_by_key(|e| std::cmp::Reverse(e.order));

        for encoding in chain {
            data = encoding.decompress(&data)?;
        }
        Ok(data)
    }

    /// Builds the TrackEntry master with the mandatory children filled in.
    pub fn to_entry(&self) -> Element {
        let mut entry = Element::master(
            ids::TRACK_ENTRY,
            vec![
                Element::uint(ids::TRACK_NUMBER, self.number),
                Element::uint(ids::TRACK_UID, self.uid),
                Element::uint(
                    ids::TRACK_TYPE,
                    self.track_type.map(TrackType::to_id).unwrap_or(0),
                ),
                Element::uint(ids::FLAG_LACING, self.flag_lacing as u64),
                Element::uint(ids::FLAG_DEFAULT, self.flag_default as u64),
            ],
        );

        if !self.language.is_empty() && self.language != "eng" {
            entry.push(Element::string(ids::LANGUAGE, self.language.clone()));
        }
        if let Some(duration) = self.default_duration {
            entry.push(Element::uint(ids::DEFAULT_DURATION, duration));
        }

        entry.push(Element::string(ids::CODEC_ID, self.codec_id.clone()));
        if let Some(private) = &self.codec_private {
            entry.push(Element::binary(ids::CODEC_PRIVATE, private.clone()));
        }

        if let Some(video) = &self.video {
            let mut child = Element::master(
                ids::VIDEO,
                vec![
                    Element::uint(ids::PIXEL_WIDTH, video.pixel_width),
                    Element::uint(ids::PIXEL_HEIGHT, video.pixel_height),
                ],
            );
            if let Some(width) = video.display_width {
                child.push(Element::uint(ids::DISPLAY_WIDTH, width));
            }
            if let Some(height) = video.display_height {
                child.push(Element::uint(ids::DISPLAY_HEIGHT, height));
            }
            if video.interlaced {
                child.push(Element::uint(ids::FLAG_INTERLACED, 1));
            }
            entry.push(child);
        }

        if let Some(audio) = &self.audio {
            let mut child = Element::master(
                ids::AUDIO,
                vec![
                    Element::float(ids::SAMPLING_FREQUENCY, audio.sample_rate),
                    Element::uint(ids::CHANNELS, audio.channels),
                ],
            );
            if let Some(depth) = audio.bit_depth {
                child.push(Element::uint(ids::BIT_DEPTH, depth));
            }
            entry.push(child);
        }

        if !self.encodings.is_empty() {
            let mut encodings = Element::master(ids::CONTENT_ENCODINGS, vec![]);
            for encoding in &self.encodings {
                encodings.push(Element::master(
                    ids::CONTENT_ENCODING,
                    vec![
                        Element::uint(ids::CONTENT_ENCODING_ORDER, encoding.order),
                        Element::uint(ids::CONTENT_ENCODING_SCOPE, encoding.scope),
                        Element::uint(ids::CONTENT_ENCODING_TYPE, 0),
                        Element::master(
                            ids::CONTENT_COMPRESSION,
                            vec![Element::uint(
                                ids::CONTENT_COMP_ALGO,
                                encoding.compression.to_id(),
                            )],
                        ),
                    ],
                ));
            }
            entry.push(encodings);
        }

        entry
    }

    /// Parses a TrackEntry read back from a Matroska file.
    pub fn from_entry(entry: &Element, file: &str) -> Result<Track> {
        let mut track = Track {
            language: "eng".into(),
            in_use: true,
            ..Track::default()
        };

        let mandatory = |id| {
            entry.find(id).ok_or_else(|| {
                Error::invalid(
                    file,
                    "Matroska",
                    entry.position().unwrap_or(0),
                    format!("TrackEntry is missing {:?}", id),
                )
            })
        };

        track.number = mandatory(ids::TRACK_NUMBER)?.as_uint().unwrap_or(0);
        track.uid = entry
            .find(ids::TRACK_UID)
            .and_then(Element::as_uint)
            .unwrap_or(track.number);
        track.track_type =
            TrackType::from_id(mandatory(ids::TRACK_TYPE)?.as_uint().unwrap_or(0));
        track.codec_id = mandatory(ids::CODEC_ID)?.as_str().unwrap_or("").to_string();
        track.codec_private = entry
            .find(ids::CODEC_PRIVATE)
            .and_then(Element::as_binary)
            .cloned();
        track.default_duration = entry.find(ids::DEFAULT_DURATION).and_then(Element::as_uint);
        if let Some(language) = entry.find(ids::LANGUAGE).and_then(Element::as_str) {
            track.language = language.to_string();
        }
        track.flag_default = entry
            .find(ids::FLAG_DEFAULT)
            .and_then(Element::as_uint)
            .unwrap_or(1)
            != 0;
        track.flag_lacing = entry
            .find(ids::FLAG_LACING)
            .and_then(Element::as_uint)
            .unwrap_or(1)
            != 0;

        if let Some(video) = entry.find(ids::VIDEO) {
            track.video = Some(VideoParams {
                pixel_width: video
                    .find(ids::PIXEL_WIDTH)
                    .and_then(Element::as_uint)
                    .unwrap_or(0),
                pixel_height: video
                    .find(ids::PIXEL_HEIGHT)
                    .and_then(Element::as_uint)
                    .unwrap_or(0),
                display_width: video.find(ids::DISPLAY_WIDTH).and_then(Element::as_uint),
                display_height: video.find(ids::DISPLAY_HEIGHT).and_then(Element::as_uint),
                frame_rate: None,
                interlaced: video
                    .find(ids::FLAG_INTERLACED)
                    .and_then(Element::as_uint)
                    .unwrap_or(0)
                    != 0,
            });
        }

        if let Some(audio) = entry.find(ids::AUDIO) {
            track.audio = Some(AudioParams {
                sample_rate: audio
                    .find(ids::SAMPLING_FREQUENCY)
                    .and_then(Element::as_float)
                    .unwrap_or(8000.0),
                channels: audio
                    .find(ids::CHANNELS)
                    .and_then(Element::as_uint)
                    .unwrap_or(1),
                bit_depth: audio.find(ids::BIT_DEPTH).and_then(Element::as_uint),
            });
        }

        if let Some(encodings) = entry.find(ids::CONTENT_ENCODINGS).and_then(Element::children) {
            for encoding in encodings.iter().filter(|e| e.id == ids::CONTENT_ENCODING) {
                let order = encoding
                    .find(ids::CONTENT_ENCODING_ORDER)
                    .and_then(Element::as_uint)
                    .unwrap_or(0);
                let scope = encoding
                    .find(ids::CONTENT_ENCODING_SCOPE)
                    .and_then(Element::as_uint)
                    .unwrap_or(1);
                let algo = encoding
                    .find(ids::CONTENT_COMPRESSION)
                    .and_then(|c| c.find(ids::CONTENT_COMP_ALGO))
                    .and_then(Element::as_uint)
                    .unwrap_or(0);

                match CompressionAlgo::from_id(algo) {
                    Some(compression) => track.encodings.push(ContentEncoding {
                        order,
                        scope,
                        compression,
                    }),
                    None => {
                        return Err(Error::Unsupported(format!(
                            "track {} uses unknown content compression {algo}",
                            track.number
                        )))
                    }
                }
            }
        }

        Ok(track)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ebml;
    use crate::io::{IoReader, IoWriter};

    fn round_trip(track: &Track) -> Track {
        let mut entry = track.to_entry();
        let mut out = IoWriter::memory();
        entry.update_size(false);
        entry.render(&mut out, false).unwrap();

        let mut input = IoReader::from_memory("mem", out.into_memory().unwrap());
        let head = match ebml::find_next_element(&mut input, ids::TRACKS, None, false).unwrap() {
            ebml::Next::Child(head) => head,
            other => panic!("{other:?}"),
        };
        let element = ebml::read_element(&mut input, &head).unwrap();
        Track::from_entry(&element, "mem").unwrap()
    }

    #[test]
    fn video_entry_round_trip() {
        let mut track = Track::new(TrackType::Video);
        track.number = 1;
        track.uid = 77;
        track.codec_id = codec_ids::V_MPEG4_AVC.into();
        track.codec_private = Some(Span::from(vec![1, 2, 3]));
        track.default_duration = Some(40_000_000);
        track.video = Some(VideoParams {
            pixel_width: 640,
            pixel_height: 480,
            display_width: Some(853),
            display_height: Some(480),
            ..VideoParams::default()
        });

        let back = round_trip(&track);

        assert_eq!(back.number, 1);
        assert_eq!(back.track_type, Some(TrackType::Video));
        assert_eq!(back.codec_id, codec_ids::V_MPEG4_AVC);
        assert_eq!(back.default_duration, Some(40_000_000));
        let video = back.video.unwrap();
        assert_eq!(video.pixel_width, 640);
        assert_eq!(video.display_width, Some(853));
    }

    #[test]
    fn zlib_chain_round_trips_block_payloads() {
        let mut track = Track::new(TrackType::Subtitle);
        track.encodings.push(ContentEncoding::zlib());

        let payload = Span::from(b"subtitle line that compresses".to_vec());
        let packed = track.encode_block(payload.clone()).unwrap();
        let unpacked = track.decode_block(packed).unwrap();

        assert_eq!(unpacked, payload);
    }

    #[test]
    fn audio_entry_round_trip_keeps_encodings() {
        let mut track = Track::new(TrackType::Audio);
        track.number = 2;
        track.uid = 5;
        track.codec_id = codec_ids::A_VORBIS.into();
        track.audio = Some(AudioParams {
            sample_rate: 48000.0,
            channels: 2,
            bit_depth: Some(16),
        });
        track.encodings.push(ContentEncoding::zlib());

        let back = round_trip(&track);

        assert_eq!(back.audio.as_ref().unwrap().sample_rate, 48000.0);
        assert_eq!(back.encodings.len(), 1);
        assert_eq!(back.encodings[0].compression, CompressionAlgo::Zlib);
    }
}
