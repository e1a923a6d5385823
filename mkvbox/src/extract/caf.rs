//! ALAC-in-CAF sink: caff/desc/kuki (plus chan beyond stereo), a reserved
//! free chunk the packet table migrates into when it fits, and a data chunk
//! whose size is patched once everything is written.

use std::io::SeekFrom;

use crate::codec::alac::{AlacConfig, CONFIG_SIZE, DEFAULT_FRAMES_PER_PACKET};
use crate::error::{Error, Result};
use crate::extract::{Output, Sink, SinkFrame};
use crate::media::Track;

const FREE_CHUNK_SIZE: u64 = 16384;

/// CoreAudio channel layout tags by channel count above stereo.
fn channel_layout_tag(channels: u32) -> u32 {
    match channels {
        3 => (113 << 16) | 3,  // MPEG 3.0 B
        4 => (116 << 16) | 4,  // MPEG 4.0 B
        5 => (120 << 16) | 5,  // MPEG 5.0 D
        6 => (124 << 16) | 6,  // MPEG 5.1 D
        7 => (142 << 16) | 7,  // AAC 6.1
        8 => (127 << 16) | 8,  // MPEG 7.1 B
        _ => 0,
    }
}

pub struct CafSink {
    out: Output,
    free_chunk_offset: u64,
    data_chunk_offset: u64,
    bytes_written: u64,
    prev_written: u64,
    packets_written: u64,
    frames_written: u64,
    packet_sizes: Vec<u8>,
}

impl CafSink {
    pub fn new(path: &str) -> CafSink {
        CafSink {
            out: Output::new(path),
            free_chunk_offset: 0,
            data_chunk_offset: 0,
            bytes_written: 0,
            prev_written: 0,
            packets_written: 0,
            frames_written: 0,
            packet_sizes: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn memory() -> CafSink {
        CafSink {
            out: Output::memory(),
            ..CafSink::new("")
        }
    }

    #[cfg(test)]
    pub fn into_bytes(self) -> Vec<u8> {
        self.out.into_writer().unwrap().into_memory().unwrap()
    }
}

impl Sink for CafSink {
    fn create_file(&mut self, track: &Track) -> Result<()> {
        let private = track.codec_private.as_ref().ok_or_else(|| {
            Error::Unsupported(format!(
                "track {} with the codec id '{}' is missing the codec private element \
                 and cannot be extracted",
                track.number, track.codec_id
            ))
        })?;
        let config_bytes = private.to_bytes();
        if config_bytes.len() != CONFIG_SIZE {
            return Err(Error::Unsupported("ALAC private data size mismatch".into()));
        }
        let config = AlacConfig::parse(&config_bytes)?;

        let channels = track
            .audio
            .as_ref()
            .map(|a| a.channels as u32)
            .unwrap_or(config.num_channels as u32);
        let sample_rate = track
            .audio
            .as_ref()
            .map(|a| a.sample_rate)
            .unwrap_or(config.sample_rate as f64);

        let out = self.out.get()?;

        out.write_all(b"caff")?;
        out.write_u16_be(1)?; // file version
        out.write_u16_be(0)?; // file flags

        out.write_all(b"desc")?;
        out.write_u64_be(32)?;
        out.write_f64_be(sample_rate)?;
        out.write_all(b"alac")?;
        out.write_u32_be(0)?; // format flags
        out.write_u32_be(0)?; // bytes per packet
        out.write_u32_be(DEFAULT_FRAMES_PER_PACKET)?;
        out.write_u32_be(channels)?;
        out.write_u32_be(0)?; // bits per channel

        // The kuki carries the old-style frma/alac atom chain around the
        // config, plus the channel layout info beyond stereo.
        let kuki_size = 12 + 36 + 8 + if channels > 2 { 24 } else { 0 };
        out.write_all(b"kuki")?;
        out.write_u64_be(kuki_size)?;
        out.write_all(&[0, 0, 0, 12])?;
        out.write_all(b"frma")?;
        out.write_all(b"alac")?;
        out.write_u32_be(12 + CONFIG_SIZE as u32)?;
        out.write_all(b"alac")?;
        out.write_u32_be(0)?; // version flags
        out.write_all(&config_bytes)?;

        if channels > 2 {
            out.write_u32_be(24)?; // channel layout info size
            out.write_all(b"chan")?;
            out.write_u32_be(channel_layout_tag(channels))?;
            out.write_u32_be(0)?;
            out.write_u32_be(0)?;
        }
        // Terminator atom.
        out.write_u32_be(8)?;
        out.write_u32_be(0)?;

        if channels > 2 {
            out.write_all(b"chan")?;
            out.write_u64_be(12)?;
            out.write_u32_be(channel_layout_tag(channels))?;
            out.write_u32_be(0)?; // channel bitmap
            out.write_u32_be(0)?; // channel descriptions
        }

        // Reserved space the packet table migrates into if it fits.
        self.free_chunk_offset = out.tell()?;
        out.write_all(b"free")?;
        out.write_u64_be(FREE_CHUNK_SIZE)?;
        out.write_all(&vec![0u8; FREE_CHUNK_SIZE as usize])?;

        self.data_chunk_offset = out.tell()?;
        out.write_all(b"data")?;
        out.write_u64_be(u64::MAX)?; // size unknown until finish
        out.write_u32_be(1)?; // edit count
        Ok(())
    }

    fn handle_frame(&mut self, frame: &SinkFrame) -> Result<()> {
        self.out.get()?.write_span(&frame.data)?;
        self.bytes_written += frame.data.len() as u64;

        // Variable-length size entry, seven bits per byte.
        let amount = self.bytes_written - self.prev_written;
        self.prev_written = self.bytes_written;
        for shift in (1..=4).rev() {
            let top = amount >> (shift * 7);
            if top != 0 {
                self.packet_sizes.push(0x80 | (top & 0x7f) as u8);
            }
        }
        self.packet_sizes.push((amount & 0x7f) as u8);

        self.packets_written += 1;
        self.frames_written += DEFAULT_FRAMES_PER_PACKET as u64;
        Ok(())
    }

    fn finish_file(&mut self) -> Result<()> {
        let table_size = 4 + 8 + 24 + self.packet_sizes.len() as u64;
        let gap = self.data_chunk_offset as i64
            - (self.free_chunk_offset as i64 + table_size as i64);

        let free_chunk_offset = self.free_chunk_offset;
        let data_chunk_offset = self.data_chunk_offset;
        let bytes_written = self.bytes_written;

        {
            let out = self.out.get()?;
            let end = out.tell()?;

            if gap >= 0 && gap < 16 && gap != 0 {
                // Too tight to re-fill with a free chunk: append instead.
                out.seek(SeekFrom::Start(end))?;
            } else if gap >= 0 {
                // The table fits into the reserved region; a fresh free
                // chunk fills whatever is left.
                out.seek(SeekFrom::Start(free_chunk_offset))?;
            } else {
                out.seek(SeekFrom::Start(end))?;
            }
        }
        self.write_pakt_at_current(gap)?;

        let out = self.out.get()?;
        // The data chunk size is known now.
        let end = out.tell()?;
        out.seek(SeekFrom::Start(data_chunk_offset + 4))?;
        out.write_u64_be(bytes_written + 4)?;
        out.seek(SeekFrom::Start(end))?;
        out.flush()
    }
}

impl CafSink {
    fn write_pakt_at_current(&mut self, gap: i64) -> Result<()> {
        let packet_sizes = self.packet_sizes.clone();
        let packets_written = self.packets_written;
        let frames_written = self.frames_written;

        let out = self.out.get()?;
        out.write_all(b"pakt")?;
        out.write_u64_be(24 + packet_sizes.len() as u64)?;
        out.write_u64_be(packets_written)?;
        out.write_u64_be(frames_written)?;
        out.write_u32_be(0)?;
        out.write_u32_be(0)?;
        out.write_all(&packet_sizes)?;

        if gap >= 16 {
            out.write_all(b"free")?;
            out.write_u64_be(gap as u64 - 12)?;
            out.write_all(&vec![0u8; gap as usize - 12])?;
        }
        Ok(())
    }
}
