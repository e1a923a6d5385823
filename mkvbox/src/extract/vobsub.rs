//! VobSub sink: SPU packets re-wrapped as an MPEG-2 program stream in the
//! `.sub` file, plus a companion `.idx` index assembled from the codec
//! private data and the frame timecodes.

use crate::error::Result;
use crate::extract::{Output, Sink, SinkFrame};
use crate::media::Track;

pub struct VobsubSink {
    sub: Output,
    idx_path: String,
    idx_lines: String,
    memory_idx: Option<String>,
}

impl VobsubSink {
    pub fn new(path: &str) -> VobsubSink {
        let base = path.strip_suffix(".sub").unwrap_or(path);
        VobsubSink {
            sub: Output::new(&format!("{base}.sub")),
            idx_path: format!("{base}.idx"),
            idx_lines: String::new(),
            memory_idx: None,
        }
    }

    #[cfg(test)]
    pub fn memory() -> VobsubSink {
        VobsubSink {
            sub: Output::memory(),
            idx_path: String::new(),
            idx_lines: String::new(),
            memory_idx: Some(String::new()),
        }
    }

    #[cfg(test)]
    pub fn into_parts(self) -> (Vec<u8>, String) {
        (
            self.sub.into_writer().unwrap().into_memory().unwrap(),
            self.memory_idx.unwrap_or_default(),
        )
    }
}

/// Wraps one SPU packet into a pack header plus a private-stream-1 PES
/// packet carrying the presentation timestamp.
fn wrap_pes(spu: &[u8], timecode_ns: i64) -> Vec<u8> {
    let pts = (timecode_ns / 1_000_000) * 90; // 90 kHz clock

    let mut out = Vec::with_capacity(spu.len() + 40);

    // MPEG-2 pack header with the SCR mirroring the PTS.
    out.extend_from_slice(&[0x00, 0x00, 0x01, 0xba]);
    let scr = pts;
    out.push(0x44 | (((scr >> 30) & 0x07) as u8) << 3 | (((scr >> 28) & 0x03) as u8));
    out.push(((scr >> 20) & 0xff) as u8);
    out.push(0x04 | (((scr >> 15) & 0x1f) as u8) << 3 | (((scr >> 13) & 0x03) as u8));
    out.push(((scr >> 5) & 0xff) as u8);
    out.push(0x04 | ((scr & 0x1f) as u8) << 3 | 0x03);
    out.push(0x01); // SCR extension
    out.extend_from_slice(&[0x01, 0x89, 0xc3]); // mux rate
    out.push(0xf8); // stuffing length 0

    // PES packet: flags, 5-byte PTS, substream id, payload.
    let pes_len = 3 + 5 + 1 + spu.len();
    out.extend_from_slice(&[0x00, 0x00, 0x01, 0xbd]);
    out.extend_from_slice(&(pes_len as u16).to_be_bytes());
    out.push(0x80);
    out.push(0x80); // PTS present
    out.push(5); // header data length
    out.push(0x21 | (((pts >> 30) & 0x07) as u8) << 1);
    out.push(((pts >> 22) & 0xff) as u8);
    out.push(0x01 | (((pts >> 14) & 0xff) as u8 & 0xfe));
    out.push(((pts >> 7) & 0xff) as u8);
    out.push(0x01 | (((pts << 1) & 0xff) as u8 & 0xfe));
    out.push(0x20); // substream 0x20
    out.extend_from_slice(spu);

    out
}

impl Sink for VobsubSink {
    fn create_file(&mut self, track: &Track) -> Result<()> {
        if let Some(private) = &track.codec_private {
            let header = String::from_utf8_lossy(&private.to_slice()).into_owned();
            self.idx_lines.push_str(header.trim_end_matches('\n'));
            self.idx_lines.push('\n');
        }
        self.sub.get()?;
        Ok(())
    }

    fn handle_frame(&mut self, frame: &SinkFrame) -> Result<()> {
        let out = self.sub.get()?;
        let position = out.tell()?;

        let wrapped = wrap_pes(&frame.data.to_slice(), frame.timecode);
        out.write_all(&wrapped)?;

        let total_ms = frame.timecode / 1_000_000;
        self.idx_lines.push_str(&format!(
            "timestamp: {:02}:{:02}:{:02}:{:03}, filepos: {position:09x}\n",
            total_ms / 3_600_000,
            (total_ms / 60_000) % 60,
            (total_ms / 1000) % 60,
            total_ms % 1000,
        ));
        Ok(())
    }

    fn finish_file(&mut self) -> Result<()> {
        match &mut self.memory_idx {
            Some(idx) => *idx = self.idx_lines.clone(),
            None => std::fs::write(&self.idx_path, self.idx_lines.as_bytes())?,
        }
        self.sub.get()?.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::TrackType;
    use crate::span::Span;

    #[test]
    fn idx_lines_record_positions_in_hex() {
        let mut track = Track::new(TrackType::Subtitle);
        track.codec_private = Some(Span::from(b"id: en, index: 0".to_vec()));

        let mut sink = VobsubSink::memory();
        sink.create_file(&track).unwrap();

        let frame = SinkFrame {
            data: Span::from(vec![0u8; 16]),
            additions: Vec::new(),
            timecode: 62_500 * 1_000_000,
            duration: None,
            bref: 0,
            fref: 0,
            keyframe: true,
            discardable: false,
            references_valid: false,
            codec_state: None,
        };
        sink.handle_frame(&frame).unwrap();
        sink.handle_frame(&frame).unwrap();
        sink.finish_file().unwrap();

        let (sub, idx) = sink.into_parts();

        assert!(idx.starts_with("id: en, index: 0\n"));
        assert!(idx.contains("timestamp: 00:01:02:500, filepos: 000000000\n"));

        // Second entry points at the start of the second PES wrap.
        let second_pos = sub.len() / 2;
        assert!(idx.contains(&format!("filepos: {second_pos:09x}")));

        // The .sub stream starts with a pack start code.
        assert_eq!(&sub[0..4], [0x00, 0x00, 0x01, 0xba]);

        // The packetizer's PES scanner gets the SPU back.
        let warnings = crate::error::Warnings::new();
        let payload =
            crate::codec::vobsub::PesScanner::new(&sub[..sub.len() / 2]).unwrap_pes(&warnings);
        assert_eq!(payload, vec![0u8; 16]);
    }

    #[test]
    fn output_name_derives_idx_companion() {
        let sink = VobsubSink::new("subs.sub");
        assert_eq!(sink.idx_path, "subs.idx");
    }
}
