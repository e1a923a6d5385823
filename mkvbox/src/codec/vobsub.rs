//! VobSub packetizer: unwraps MPEG program-stream packets into bare SPU
//! data and derives display durations from the SPU control sequence.

use crate::codec::{Frame, Packetizer, PacketizerCommon};
use crate::error::{Result, Warnings};
use crate::media::{codec_ids, ContentEncoding, Track};
use crate::span::Span;

/// Lengths of the SPU control-block commands 0x00..0x06; the STP_DCSQT
/// command (0x02) carries the stop timestamp the duration comes from.
const COMMAND_LENGTHS: [usize; 7] = [0, 0, 0, 2, 2, 6, 4];

/// Walks the SPU control sequence and returns the display duration in
/// nanoseconds, derived from the STP_DCSQT delay (`1024 * t / 90` ms).
pub fn spu_extract_duration(data: &[u8]) -> Option<i64> {
    if data.len() < 4 {
        return None;
    }

    let packet_size = ((data[0] as usize) << 8) | data[1] as usize;
    let data_size = ((data[2] as usize) << 8) | data[3] as usize;
    if packet_size > data.len() || data_size >= packet_size {
        return None;
    }

    let mut block = data_size;
    loop {
        if block + 4 > packet_size {
            return None;
        }

        let t = ((data[block] as i64) << 8) | data[block + 1] as i64;
        let next_ctrlblk = ((data[block + 2] as usize) << 8) | data[block + 3] as usize;

        if next_ctrlblk > packet_size || next_ctrlblk < data_size {
            return None;
        }

        // The last control block points at itself; its commands run to the
        // end of the packet.
        let commands_end = if next_ctrlblk > block {
            next_ctrlblk
        } else {
            packet_size
        };

        let mut i = block + 4;
        while i < commands_end {
            let command = data[i];
            let len = if command as usize <= 0x06 {
                COMMAND_LENGTHS[command as usize]
            } else {
                0
            };

            if i + 1 + len > packet_size {
                return None;
            }
            if command == 0x02 {
                return Some(1024 * t / 90 * 1_000_000);
            }
            if command == 0xff {
                break;
            }
            i += 1 + len;
        }

        if next_ctrlblk <= block {
            return None;
        }
        block = next_ctrlblk;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PesState {
    Idle,
    InPesHeader,
    InPayload,
    Flushing,
}

/// Explicit state machine over one buffered entry of an MPEG program
/// stream, collecting the private-stream-1 payload bytes.
pub struct PesScanner<'a> {
    data: &'a [u8],
    pos: usize,
    state: PesState,
    payload: Vec<u8>,
}

impl<'a> PesScanner<'a> {
    pub fn new(data: &'a [u8]) -> PesScanner<'a> {
        PesScanner {
            data,
            pos: 0,
            state: PesState::Idle,
            payload: Vec::new(),
        }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn byte(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos).copied();
        if byte.is_some() {
            self.pos += 1;
        }
        byte
    }

    fn find_start_code(&mut self) -> Option<u8> {
        while self.remaining() >= 4 {
            if self.data[self.pos] == 0
                && self.data[self.pos + 1] == 0
                && self.data[self.pos + 2] == 1
            {
                let code = self.data[self.pos + 3];
                self.pos += 4;
                return Some(code);
            }
            self.pos += 1;
        }
        None
    }

    /// Runs the machine to completion and returns the collected SPU bytes.
    pub fn unwrap_pes(mut self, warnings: &Warnings) -> Vec<u8> {
        loop {
            match self.state {
                PesState::Idle => match self.find_start_code() {
                    None => self.state = PesState::Flushing,
                    Some(0xb9) => self.state = PesState::Flushing, // system end
                    Some(0xba) => {
                        // Pack header; version nibble decides its length.
                        match self.byte() {
                            Some(c) if c & 0xc0 == 0x40 => self.pos += 9,
                            Some(c) if c & 0xf0 == 0x20 => self.pos += 7,
                            Some(c) => {
                                warnings.warn(format!(
                                    "vobsub: unsupported MPEG version 0x{c:02x}"
                                ));
                                self.state = PesState::Flushing;
                            }
                            None => self.state = PesState::Flushing,
                        }
                    }
                    Some(0xbd) => self.state = PesState::InPesHeader,
                    Some(0xbe) | Some(0xc0..=0xef) => {
                        // Padding or audio/video stream: skip by length.
                        match (self.byte(), self.byte()) {
                            (Some(hi), Some(lo)) => {
                                self.pos += ((hi as usize) << 8) | lo as usize;
                            }
                            _ => self.state = PesState::Flushing,
                        }
                    }
                    Some(code) => {
                        warnings.warn(format!("vobsub: unknown start code 0x{code:02x}"));
                        self.state = PesState::Flushing;
                    }
                },

                PesState::InPesHeader => {
                    let header = (|| -> Option<(usize, usize)> {
                        let len = ((self.byte()? as usize) << 8) | self.byte()? as usize;
                        let packet_start = self.pos;

                        let mut c = self.byte()?;
                        if c & 0xc0 == 0x40 {
                            // STD buffer scale and size.
                            self.byte()?;
                            c = self.byte()?;
                        }

                        if c & 0xc0 == 0x80 {
                            // System-2 (.VOB) stream: flags and header length.
                            let _pts_flags = self.byte()?;
                            let header_len = self.byte()? as usize;
                            let data_idx = self.pos + header_len;
                            if data_idx > packet_start + len {
                                return None;
                            }
                            self.pos = data_idx;
                        } else {
                            return None;
                        }

                        // Substream id precedes the SPU bytes.
                        self.byte()?;
                        let payload_len = len - (self.pos - packet_start);
                        Some((self.pos, payload_len))
                    })();

                    match header {
                        Some((start, len)) if start + len <= self.data.len() => {
                            self.payload.extend_from_slice(&self.data[start..start + len]);
                            self.pos = start + len;
                            self.state = PesState::InPayload;
                        }
                        _ => {
                            warnings.warn("vobsub: truncated PES packet".to_string());
                            self.state = PesState::Flushing;
                        }
                    }
                }

                PesState::InPayload => self.state = PesState::Idle,

                PesState::Flushing => return self.payload,
            }
        }
    }
}

pub struct VobsubPacketizer {
    common: PacketizerCommon,
    extract_from_mpeg: bool,
    warnings: Warnings,
}

impl VobsubPacketizer {
    pub fn new(
        mut track: Track,
        idx_data: String,
        extract_from_mpeg: bool,
        warnings: Warnings,
    ) -> VobsubPacketizer {
        track.codec_private = Some(Span::from(idx_data.into_bytes()));
        // VobSub bitmaps compress well; the chain is declared in the headers.
        track.encodings.push(ContentEncoding::zlib());

        VobsubPacketizer {
            common: PacketizerCommon::new(track),
            extract_from_mpeg,
            warnings,
        }
    }
}

impl Packetizer for VobsubPacketizer {
    fn common(&self) -> &PacketizerCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut PacketizerCommon {
        &mut self.common
    }

    fn set_headers(&mut self) -> Result<()> {
        self.common.track.codec_id = codec_ids::S_VOBSUB.into();
        self.common.track.flag_lacing = false;
        Ok(())
    }

    fn process(&mut self, mut frame: Frame) -> Result<()> {
        if self.extract_from_mpeg {
            let spu = PesScanner::new(&frame.data.to_slice()).unwrap_pes(&self.warnings);
            if spu.is_empty() {
                return Ok(());
            }
            frame.data = Span::from(spu);
        }

        match spu_extract_duration(&frame.data.to_slice()) {
            Some(duration) => frame.duration = Some(duration),
            None => {
                if frame.duration.is_none() {
                    self.warnings
                        .warn("vobsub: could not extract the duration for a SPU packet");
                }
            }
        }

        // Subtitle timecodes are quantized to milliseconds.
        frame.timecode -= frame.timecode.rem_euclid(1_000_000);
        frame.keyframe = Some(true);
        self.common.add_packet(frame)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::TrackType;

    /// Builds an SPU packet whose control sequence stops after `delay`
    /// ticks of the 90 kHz / 1024 clock.
    fn spu_with_stop(delay: u16) -> Vec<u8> {
        let pixel_data = [0u8; 8];
        let data_size = 4 + pixel_data.len();

        let mut ctrl = Vec::new();
        // First control block: start display, then a terminating block
        // carrying the stop command.
        let second_block = data_size + 5;
        ctrl.extend_from_slice(&0u16.to_be_bytes());
        ctrl.extend_from_slice(&(second_block as u16).to_be_bytes());
        ctrl.push(0x01); // STA_DSP

        ctrl.extend_from_slice(&delay.to_be_bytes());
        ctrl.extend_from_slice(&(second_block as u16).to_be_bytes());
        ctrl.push(0x02); // STP_DSP

        let total = data_size + ctrl.len();
        let mut spu = Vec::new();
        spu.extend_from_slice(&(total as u16).to_be_bytes());
        spu.extend_from_slice(&(data_size as u16).to_be_bytes());
        spu.extend_from_slice(&pixel_data);
        spu.extend_from_slice(&ctrl);
        spu
    }

    #[test]
    fn duration_comes_from_the_stop_command() {
        let spu = spu_with_stop(900);
        let duration = spu_extract_duration(&spu).unwrap();

        // 1024 * 900 / 90 ms = 10240 ms.
        assert_eq!(duration, 10_240 * 1_000_000);
    }

    #[test]
    fn garbage_has_no_duration() {
        assert_eq!(spu_extract_duration(&[0, 4, 0, 8, 1, 2]), None);
        assert_eq!(spu_extract_duration(&[]), None);
    }

    fn pes_wrap(spu: &[u8]) -> Vec<u8> {
        let mut pes = Vec::new();
        // Pack header, MPEG-2 style.
        pes.extend_from_slice(&[0, 0, 1, 0xba]);
        pes.push(0x44);
        pes.extend_from_slice(&[0u8; 9]);
        // Private stream 1 packet: flags, 5-byte PTS header, substream id.
        pes.extend_from_slice(&[0, 0, 1, 0xbd]);
        let len = 3 + 5 + 1 + spu.len();
        pes.extend_from_slice(&(len as u16).to_be_bytes());
        pes.push(0x80); // marker bits
        pes.push(0x80); // PTS present
        pes.push(5); // header length
        pes.extend_from_slice(&[0x21, 0x00, 0x01, 0x00, 0x01]);
        pes.push(0x20); // substream id
        pes.extend_from_slice(spu);
        pes
    }

    #[test]
    fn pes_scanner_recovers_the_spu_payload() {
        let spu = spu_with_stop(90);
        let wrapped = pes_wrap(&spu);

        let warnings = Warnings::new();
        let payload = PesScanner::new(&wrapped).unwrap_pes(&warnings);

        assert_eq!(payload, spu);
        assert_eq!(warnings.count(), 0);
    }

    #[test]
    fn packetizer_quantizes_to_milliseconds() {
        let warnings = Warnings::new();
        let mut vobsub = VobsubPacketizer::new(
            Track::new(TrackType::Subtitle),
            "id: en, index: 0\n".into(),
            false,
            warnings,
        );
        vobsub.set_headers().unwrap();
        assert_eq!(vobsub.common().track.codec_id, "S_VOBSUB");

        let spu = spu_with_stop(90);
        vobsub
            .process(Frame::new(spu, 1_234_567_890))
            .unwrap();

        let packet = vobsub.common_mut().queue.pop().unwrap();
        assert_eq!(packet.timecode, 1_234_000_000);
        assert_eq!(packet.duration, Some(1024 * 90 / 90 * 1_000_000));
    }
}
