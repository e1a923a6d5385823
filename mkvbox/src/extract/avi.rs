//! AVI 1.0 sink for VfW-compatible video tracks: RIFF/hdrl/movi layout,
//! `00dc` chunks, an idx1 index and the usual post-hoc size patching.

use std::io::SeekFrom;

use crate::error::{Error, Result};
use crate::extract::{Output, Sink, SinkFrame};
use crate::media::Track;

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;

struct IndexEntry {
    offset: u32,
    size: u32,
    keyframe: bool,
}

pub struct AviSink {
    out: Output,
    riff_size_pos: u64,
    frames_pos: u64,
    length_pos: u64,
    movi_size_pos: u64,
    movi_start: u64,
    frames: u32,
    index: Vec<IndexEntry>,
}

impl AviSink {
    pub fn new(path: &str) -> AviSink {
        AviSink {
            out: Output::new(path),
            riff_size_pos: 0,
            frames_pos: 0,
            length_pos: 0,
            movi_size_pos: 0,
            movi_start: 0,
            frames: 0,
            index: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn memory() -> AviSink {
        AviSink {
            out: Output::memory(),
            ..AviSink::new("")
        }
    }

    #[cfg(test)]
    pub fn into_bytes(self) -> Vec<u8> {
        self.out.into_writer().unwrap().into_memory().unwrap()
    }
}

impl Sink for AviSink {
    fn create_file(&mut self, track: &Track) -> Result<()> {
        // The codec private data is the source BITMAPINFOHEADER.
        let strf = track
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

        let (width, height) = track
            .video
            .as_ref()
            .map(|v| (v.pixel_width as u32, v.pixel_height as u32))
            .unwrap_or((0, 0));
        let micro_sec_per_frame =
            (track.default_duration.unwrap_or(40_000_000) / 1000) as u32;
        let rate = 1_000_000_000u32 / track.default_duration.unwrap_or(40_000_000).max(1) as u32;

        let out = self.out.get()?;

        out.write_all(b"RIFF")?;
        self.riff_size_pos = out.tell()?;
        out.write_u32_le(0)?;
        out.write_all(b"AVI ")?;

        // hdrl list: avih + one strl.
        let strl_size = 4 + (8 + 56) + (8 + strf.len() as u32);
        let hdrl_size = 4 + (8 + 56) + (8 + strl_size);
        out.write_all(b"LIST")?;
        out.write_u32_le(hdrl_size)?;
        out.write_all(b"hdrl")?;

        out.write_all(b"avih")?;
        out.write_u32_le(56)?;
        out.write_u32_le(micro_sec_per_frame)?;
        out.write_u32_le(0)?; // max bytes per sec
        out.write_u32_le(0)?; // padding granularity
        out.write_u32_le(AVIF_HASINDEX)?;
        self.frames_pos = out.tell()?;
        out.write_u32_le(0)?; // total frames, patched
        out.write_u32_le(0)?; // initial frames
        out.write_u32_le(1)?; // streams
        out.write_u32_le(0)?; // suggested buffer size
        out.write_u32_le(width)?;
        out.write_u32_le(height)?;
        out.write_all(&[0u8; 16])?; // reserved

        out.write_all(b"LIST")?;
        out.write_u32_le(strl_size)?;
        out.write_all(b"strl")?;

        out.write_all(b"strh")?;
        out.write_u32_le(56)?;
        out.write_all(b"vids")?;
        // The handler fourcc sits in the BITMAPINFOHEADER's compression
        // field; VfW players re-read it from there.
        out.write_all(strf.get(16..20).unwrap_or(b"\0\0\0\0"))?;
        out.write_u32_le(0)?; // flags
        out.write_u32_le(0)?; // priority, language
        out.write_u32_le(0)?; // initial frames
        out.write_u32_le(1)?; // scale
        out.write_u32_le(rate)?;
        out.write_u32_le(0)?; // start
        self.length_pos = out.tell()?;
        out.write_u32_le(0)?; // length, patched
        out.write_u32_le(0)?; // suggested buffer size
        out.write_u32_le(u32::MAX)?; // quality
        out.write_u32_le(0)?; // sample size
        out.write_all(&[0u8; 8])?; // frame rect

        out.write_all(b"strf")?;
        out.write_u32_le(strf.len() as u32)?;
        out.write_all(&strf)?;

        out.write_all(b"LIST")?;
        self.movi_size_pos = out.tell()?;
        out.write_u32_le(0)?;
        out.write_all(b"movi")?;
        self.movi_start = out.tell()?;
        Ok(())
    }

    fn handle_frame(&mut self, frame: &SinkFrame) -> Result<()> {
        let out = self.out.get()?;
        let offset = out.tell()? - self.movi_start + 4;

        let data = frame.data.to_bytes();
        out.write_all(b"00dc")?;
        out.write_u32_le(data.len() as u32)?;
        out.write_all(&data)?;
        if data.len() % 2 == 1 {
            out.write_u8(0)?;
        }

        self.index.push(IndexEntry {
            offset: offset as u32,
            size: data.len() as u32,
            keyframe: frame.keyframe,
        });
        self.frames += 1;
        Ok(())
    }

    fn finish_file(&mut self) -> Result<()> {
        let movi_end = {
            let out = self.out.get()?;
            out.tell()?
        };
        let movi_size = movi_end - self.movi_size_pos - 4;

        let frames = self.frames;
        let riff_size_pos = self.riff_size_pos;
        let frames_pos = self.frames_pos;
        let length_pos = self.length_pos;
        let movi_size_pos = self.movi_size_pos;

        let out = self.out.get()?;

        // idx1 after movi.
        out.write_all(b"idx1")?;
        out.write_u32_le(self.index.len() as u32 * 16)?;
        for entry in &self.index {
            out.write_all(b"00dc")?;
            out.write_u32_le(if entry.keyframe { AVIIF_KEYFRAME } else { 0 })?;
            out.write_u32_le(entry.offset)?;
            out.write_u32_le(entry.size)?;
        }

        let end = out.tell()?;
        out.seek(SeekFrom::Start(riff_size_pos))?;
        out.write_u32_le((end - riff_size_pos - 4) as u32)?;
        out.seek(SeekFrom::Start(frames_pos))?;
        out.write_u32_le(frames)?;
        out.seek(SeekFrom::Start(length_pos))?;
        out.write_u32_le(frames)?;
        out.seek(SeekFrom::Start(movi_size_pos))?;
        out.write_u32_le(movi_size as u32)?;

        out.seek(SeekFrom::Start(end))?;
        out.flush()
    }
}
