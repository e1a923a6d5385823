//! MPEG-4 part 2 video: VOL header scanning for aspect ratio and timing
//! parameters, VOP type detection and B-frame timecode reordering.

use gcd::Gcd;

use crate::codec::{Frame, Packetizer, PacketizerCommon};
use crate::error::Result;
use crate::media::{codec_ids, Track, VideoParams};
use crate::span::Span;

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> BitReader<'a> {
        BitReader { data, pos: 0 }
    }

    fn bit(&mut self) -> Option<u32> {
        let byte = self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Some(bit as u32)
    }

    fn bits(&mut self, count: u32) -> Option<u32> {
        let mut value = 0;
        for _ in 0..count {
            value = (value << 1) | self.bit()?;
        }
        Some(value)
    }

    fn skip(&mut self, count: u32) -> Option<()> {
        for _ in 0..count {
            self.bit()?;
        }
        Some(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VopType {
    I,
    P,
    B,
    S,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolInfo {
    pub par_width: u32,
    pub par_height: u32,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub time_inc_resolution: u32,
    pub time_inc_bits: u32,
}

impl VolInfo {
    /// Display dimensions derived from the pixel aspect ratio.
    pub fn display_dimensions(&self, pixel_width: u32, pixel_height: u32) -> (u32, u32) {
        if self.par_width == self.par_height || self.par_height == 0 {
            return (pixel_width, pixel_height);
        }

        let width = pixel_width as u64 * self.par_width as u64 / self.par_height as u64;
        (width as u32, pixel_height)
    }

    /// Display aspect ratio in smallest terms.
    pub fn display_aspect_ratio(&self, pixel_width: u32, pixel_height: u32) -> (u32, u32) {
        let (width, height) = self.display_dimensions(pixel_width, pixel_height);
        let divisor = width.gcd(height).max(1);
        (width / divisor, height / divisor)
    }
}

fn start_code_positions(data: &[u8]) -> impl Iterator<Item = (usize, u8)> + '_ {
    (0..data.len().saturating_sub(3)).filter_map(|i| {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            Some((i, data[i + 3]))
        } else {
            None
        }
    })
}

fn bits_for(value: u32) -> u32 {
    let mut bits = 0;
    let mut left = value.saturating_sub(1);
    while left > 0 {
        bits += 1;
        left >>= 1;
    }
    bits.max(1)
}

/// Scans for a Video Object Layer start code (0x20..0x2f) and parses the
/// aspect ratio, time increment resolution and frame geometry out of it.
pub fn parse_vol_header(data: &[u8]) -> Option<VolInfo> {
    let vol_start = start_code_positions(data)
        .find(|&(_, code)| (0x20..=0x2f).contains(&code))
        .map(|(pos, _)| pos + 4)?;

    let mut bits = BitReader::new(&data[vol_start..]);

    bits.skip(1)?; // random_accessible_vol
    bits.skip(8)?; // video_object_type_indication
    if bits.bit()? == 1 {
        // is_object_layer_identifier
        bits.skip(4 + 3)?;
    }

    let aspect_ratio_info = bits.bits(4)?;
    let (par_width, par_height) = match aspect_ratio_info {
        1 => (1, 1),
        2 => (12, 11),
        3 => (10, 11),
        4 => (16, 11),
        5 => (40, 33),
        15 => {
            let width = bits.bits(8)?;
            let height = bits.bits(8)?;
            (width, height)
        }
        _ => (1, 1),
    };

    if bits.bit()? == 1 {
        // vol_control_parameters
        bits.skip(2 + 1)?; // chroma_format, low_delay
        if bits.bit()? == 1 {
            // vbv_parameters
            bits.skip(15 + 1 + 15 + 1 + 15 + 1 + 3 + 11 + 1 + 15 + 1)?;
        }
    }

    let shape = bits.bits(2)?;
    bits.skip(1)?; // marker
    let time_inc_resolution = bits.bits(16)?;
    bits.skip(1)?; // marker
    if bits.bit()? == 1 {
        // fixed_vop_rate
        bits.skip(bits_for(time_inc_resolution))?;
    }

    let (width, height) = if shape == 0 {
        bits.skip(1)?;
        let width = bits.bits(13)?;
        bits.skip(1)?;
        let height = bits.bits(13)?;
        (Some(width), Some(height))
    } else {
        (None, None)
    };

    Some(VolInfo {
        par_width,
        par_height,
        width,
        height,
        time_inc_resolution,
        time_inc_bits: bits_for(time_inc_resolution),
    })
}

/// Coding type of the first VOP in the buffer.
pub fn vop_type(data: &[u8]) -> Option<VopType> {
    let vop_start = start_code_positions(data)
        .find(|&(_, code)| code == 0xb6)
        .map(|(pos, _)| pos + 4)?;

    let first = data.get(vop_start)?;
    match first >> 6 {
        0 => Some(VopType::I),
        1 => Some(VopType::P),
        2 => Some(VopType::B),
        _ => Some(VopType::S),
    }
}

/// Everything up to the first VOP start code; used as codec private data.
pub fn config_headers(data: &[u8]) -> Option<Vec<u8>> {
    let vop = start_code_positions(data).find(|&(_, code)| code == 0xb6)?;
    if vop.0 == 0 {
        None
    } else {
        Some(data[..vop.0].to_vec())
    }
}

enum Anchor {
    None,
    Held { frame: Frame, bref: i64 },
}

/// Reorders decode-order frames into presentation order. Anchors (I/P/S) are
/// held back; B frames arriving after an anchor take its presentation slot
/// and push the anchor's timecode forward.
pub struct Mpeg4Packetizer {
    common: PacketizerCommon,
    vol: Option<VolInfo>,
    anchor: Anchor,
    pending_b: Vec<Frame>,
    last_anchor_timecode: i64,
    frames_input: u64,
    b_frames_seen: bool,
}

impl Mpeg4Packetizer {
    pub fn new(track: Track) -> Mpeg4Packetizer {
        Mpeg4Packetizer {
            common: PacketizerCommon::new(track),
            vol: None,
            anchor: Anchor::None,
            pending_b: Vec::new(),
            last_anchor_timecode: -1,
            frames_input: 0,
            b_frames_seen: false,
        }
    }

    pub fn has_b_frames(&self) -> bool {
        self.b_frames_seen
    }

    fn default_duration(&self) -> i64 {
        self.common.track.default_duration.unwrap_or(40_000_000) as i64
    }

    fn emit_anchor(&mut self) -> Result<()> {
        let Anchor::Held { mut frame, bref } = std::mem::replace(&mut self.anchor, Anchor::None)
        else {
            return Ok(());
        };

        frame.bref = bref.max(0);
        let anchor_timecode = frame.timecode;
        let prev_anchor = self.last_anchor_timecode;
        self.common.add_packet(frame)?;

        for mut b_frame in std::mem::take(&mut self.pending_b) {
            b_frame.keyframe = Some(false);
            b_frame.bref = prev_anchor.max(0);
            b_frame.fref = anchor_timecode;
            b_frame.discardable = true;
            self.common.add_packet(b_frame)?;
        }

        self.last_anchor_timecode = anchor_timecode;
        Ok(())
    }
}

impl Packetizer for Mpeg4Packetizer {
    fn common(&self) -> &PacketizerCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut PacketizerCommon {
        &mut self.common
    }

    fn set_headers(&mut self) -> Result<()> {
        self.common.track.codec_id = codec_ids::V_MPEG4_ASP.into();
        self.common.track.flag_lacing = false;
        Ok(())
    }

    fn process(&mut self, mut frame: Frame) -> Result<()> {
        let raw = frame.data.to_bytes();
        let duration = self.default_duration();

        if self.vol.is_none() {
            if let Some(vol) = parse_vol_header(&raw) {
                if let (Some(width), Some(height)) = (vol.width, vol.height) {
                    let (display_width, display_height) =
                        vol.display_dimensions(width, height);
                    let video =
                        self.common.track.video.get_or_insert_with(VideoParams::default);
                    if video.pixel_width == 0 {
                        video.pixel_width = width as u64;
                        video.pixel_height = height as u64;
                    }
                    video.display_width = Some(display_width as u64);
                    video.display_height = Some(display_height as u64);
                }
                self.vol = Some(vol);
            }
            if self.common.track.codec_private.is_none() {
                if let Some(headers) = config_headers(&raw) {
                    self.common.track.codec_private = Some(Span::from(headers));
                }
            }
        }

        if frame.timecode == -1 {
            frame.timecode = self.frames_input as i64 * duration;
        }
        if frame.duration.is_none() {
            frame.duration = Some(duration);
        }
        self.frames_input += 1;

        let vop = vop_type(&raw).unwrap_or(VopType::I);

        match vop {
            VopType::B => {
                self.b_frames_seen = true;
                // The B frame presents before the held anchor: swap slots so
                // the anchor keeps moving to the latest presentation time.
                if let Anchor::Held { frame: anchor, .. } = &mut self.anchor {
                    std::mem::swap(&mut anchor.timecode, &mut frame.timecode);
                }
                self.pending_b.push(frame);
            }
            anchor_type => {
                self.emit_anchor()?;

                let keyframe = anchor_type == VopType::I;
                frame.keyframe = Some(keyframe);
                let bref = if keyframe { -1 } else { self.last_anchor_timecode };
                self.anchor = Anchor::Held { frame, bref };
            }
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.emit_anchor()
    }
}
