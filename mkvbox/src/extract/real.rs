//! RealMedia sink: .RMF/PROP/MDPR/DATA layout with running bit-rate and
//! packet-size accounting, headers rewritten in place once the totals are
//! known.

use std::io::SeekFrom;

use crate::error::{Error, Result};
use crate::extract::{Output, Sink, SinkFrame};
use crate::media::{Track, TrackType};

const PACKET_HEADER_SIZE: u64 = 12;
const PACKET_FLAG_KEYFRAME: u8 = 0x02;

pub struct RealSink {
    out: Output,
    prop_pos: u64,
    mdpr_pos: u64,
    data_pos: u64,
    num_packets: u32,
    max_packet_size: u32,
    total_packet_bytes: u64,
    max_timecode_ms: u32,
}

impl RealSink {
    pub fn new(path: &str) -> RealSink {
        RealSink {
            out: Output::new(path),
            prop_pos: 0,
            mdpr_pos: 0,
            data_pos: 0,
            num_packets: 0,
            max_packet_size: 0,
            total_packet_bytes: 0,
            max_timecode_ms: 0,
        }
    }

    #[cfg(test)]
    pub fn memory() -> RealSink {
        RealSink {
            out: Output::memory(),
            ..RealSink::new("")
        }
    }

    #[cfg(test)]
    pub fn into_bytes(self) -> Vec<u8> {
        self.out.into_writer().unwrap().into_memory().unwrap()
    }

    fn bit_rates(&self) -> (u32, u32) {
        let duration_s = (self.max_timecode_ms as f64 / 1000.0).max(0.001);
        let avg = (self.total_packet_bytes as f64 * 8.0 / duration_s) as u32;
        (avg, avg)
    }
}

impl Sink for RealSink {
    fn create_file(&mut self, track: &Track) -> Result<()> {
        let type_specific = track
            .codec_private
            .as_ref()
            .ok_or_else(|| {
                Error::Unsupported(format!(
                    "track {} with the codec id '{}' is missing the codec private element \
                     and cannot be extracted",
                    track.number, track.codec_id
                ))
            })?
            .to_bytes();

        let mime: &[u8] = match track.track_type {
            Some(TrackType::Video) => b"video/x-pn-realvideo",
            _ => b"audio/x-pn-realaudio",
        };

        let out = self.out.get()?;

        // File header.
        out.write_all(b".RMF")?;
        out.write_u32_be(18)?;
        out.write_u16_be(0)?; // object version
        out.write_u32_be(0)?; // file version
        out.write_u32_be(3)?; // PROP + MDPR + DATA

        // PROP, all statistics rewritten on finish.
        self.prop_pos = out.tell()?;
        out.write_all(b"PROP")?;
        out.write_u32_be(50)?;
        out.write_u16_be(0)?;
        out.write_all(&[0u8; 40])?;

        // MDPR.
        self.mdpr_pos = out.tell()?;
        let mdpr_size = 8 + 2 + 2 + 4 * 7 + 1 + 1 + mime.len() + 4 + type_specific.len();
        out.write_all(b"MDPR")?;
        out.write_u32_be(mdpr_size as u32)?;
        out.write_u16_be(0)?; // object version
        out.write_u16_be(0)?; // stream number
        out.write_all(&[0u8; 28])?; // rates, sizes, times: patched
        out.write_u8(0)?; // stream name
        out.write_u8(mime.len() as u8)?;
        out.write_all(mime)?;
        out.write_u32_be(type_specific.len() as u32)?;
        out.write_all(&type_specific)?;

        // DATA; size and packet count patched on finish.
        self.data_pos = out.tell()?;
        out.write_all(b"DATA")?;
        out.write_u32_be(0)?;
        out.write_u16_be(0)?; // object version
        out.write_u32_be(0)?; // packet count
        out.write_u32_be(0)?; // next data header
        Ok(())
    }

    fn handle_frame(&mut self, frame: &SinkFrame) -> Result<()> {
        let payload = frame.data.to_bytes();
        let packet_size = PACKET_HEADER_SIZE as u32 + payload.len() as u32;
        let timecode_ms = (frame.timecode / 1_000_000) as u32;

        let out = self.out.get()?;
        out.write_u16_be(0)?; // object version
        out.write_u16_be(packet_size as u16)?;
        out.write_u16_be(0)?; // stream number
        out.write_u32_be(timecode_ms)?;
        out.write_u8(0)?; // packet group
        out.write_u8(if frame.keyframe { PACKET_FLAG_KEYFRAME } else { 0 })?;
        out.write_all(&payload)?;

        self.num_packets += 1;
        self.max_packet_size = self.max_packet_size.max(packet_size);
        self.total_packet_bytes += packet_size as u64;
        self.max_timecode_ms = self.max_timecode_ms.max(
            timecode_ms + (frame.duration.unwrap_or(0) / 1_000_000) as u32,
        );
        Ok(())
    }

    fn finish_file(&mut self) -> Result<()> {
        let (max_bit_rate, avg_bit_rate) = self.bit_rates();
        let avg_packet_size = if self.num_packets > 0 {
            (self.total_packet_bytes / self.num_packets as u64) as u32
        } else {
            0
        };

        let prop_pos = self.prop_pos;
        let mdpr_pos = self.mdpr_pos;
        let data_pos = self.data_pos;
        let num_packets = self.num_packets;
        let max_packet_size = self.max_packet_size;
        let max_timecode_ms = self.max_timecode_ms;

        let out = self.out.get()?;
        let end = out.tell()?;

        // PROP statistics.
        out.seek(SeekFrom::Start(prop_pos + 10))?;
        out.write_u32_be(max_bit_rate)?;
        out.write_u32_be(avg_bit_rate)?;
        out.write_u32_be(max_packet_size)?;
        out.write_u32_be(avg_packet_size)?;
        out.write_u32_be(num_packets)?;
        out.write_u32_be(max_timecode_ms)?; // duration
        out.write_u32_be(0)?; // preroll
        out.write_u32_be(0)?; // index offset
        out.write_u32_be((data_pos) as u32)?; // data offset
        out.write_u16_be(1)?; // stream count
        out.write_u16_be(0)?; // flags

        // MDPR per-stream statistics.
        out.seek(SeekFrom::Start(mdpr_pos + 12))?;
        out.write_u32_be(max_bit_rate)?;
        out.write_u32_be(avg_bit_rate)?;
        out.write_u32_be(max_packet_size)?;
        out.write_u32_be(avg_packet_size)?;
        out.write_u32_be(0)?; // start time
        out.write_u32_be(0)?; // preroll
        out.write_u32_be(max_timecode_ms)?; // duration

        // DATA chunk size and packet count.
        out.seek(SeekFrom::Start(data_pos + 4))?;
        out.write_u32_be((end - data_pos) as u32)?;
        out.seek(SeekFrom::Start(data_pos + 10))?;
        out.write_u32_be(num_packets)?;

        out.seek(SeekFrom::Start(end))?;
        out.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::VideoParams;
    use crate::span::Span;

    fn real_track() -> Track {
        let mut track = Track::new(TrackType::Video);
        track.codec_id = "V_REAL/RV40".into();
        track.number = 1;
        track.video = Some(VideoParams {
            pixel_width: 352,
            pixel_height: 288,
            ..VideoParams::default()
        });

        let mut type_specific = Vec::new();
        type_specific.extend_from_slice(&34u32.to_be_bytes());
        type_specific.extend_from_slice(b"VIDO");
        type_specific.extend_from_slice(b"RV40");
        type_specific.extend_from_slice(&352u16.to_be_bytes());
        type_specific.extend_from_slice(&288u16.to_be_bytes());
        type_specific.extend_from_slice(&[0u8; 18]);
        track.codec_private = Some(Span::from(type_specific));
        track
    }

    #[test]
    fn rmff_statistics_are_patched() {
        let mut sink = RealSink::memory();
        sink.create_file(&real_track()).unwrap();

        for (timecode, size) in [(0i64, 100usize), (40_000_000, 50)] {
            sink.handle_frame(&SinkFrame {
                data: Span::from(vec![7u8; size]),
                additions: Vec::new(),
                timecode,
                duration: Some(40_000_000),
                bref: 0,
                fref: 0,
                keyframe: timecode == 0,
                discardable: false,
                references_valid: true,
                codec_state: None,
            })
            .unwrap();
        }
        sink.finish_file().unwrap();

        let bytes = sink.into_bytes();
        assert_eq!(&bytes[0..4], b".RMF");

        let prop = bytes.windows(4).position(|w| w == b"PROP").unwrap();
        let max_packet =
            u32::from_be_bytes(bytes[prop + 18..prop + 22].try_into().unwrap());
        assert_eq!(max_packet, 112);
        let packets = u32::from_be_bytes(bytes[prop + 26..prop + 30].try_into().unwrap());
        assert_eq!(packets, 2);

        // The reader on the other side accepts the file again.
        let io = crate::io::IoReader::from_memory("roundtrip.rm", bytes);
        let mut reader =
            crate::format::real::RealReader::open(io, crate::format::SourceOptions::default())
                .unwrap();
        use crate::format::{Reader, Status};
        reader.read_headers().unwrap();
        assert_eq!(reader.read(0).unwrap(), Status::MoreData);
        let packet = reader.packetizer_mut(0).common_mut().queue.pop().unwrap();
        assert_eq!(packet.data.len(), 100);
        assert!(packet.keyframe);
    }
}
