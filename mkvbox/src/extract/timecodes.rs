//! Timecode dump: one millisecond value per frame in a `# timecode format
//! v2` text file, sorted ascending.

use crate::error::Result;
use crate::format::mkv::MatroskaFile;
use crate::io::IoWriter;

pub fn write_timecodes(mkv: &mut MatroskaFile, track: u64, out: &mut IoWriter) -> Result<()> {
    let mut timecodes: Vec<i64> = Vec::new();

    while let Some(block) = mkv.next_block()? {
        if block.track != track {
            continue;
        }

        // Laced frames spread evenly across the block duration.
        let count = block.frames.len().max(1) as i64;
        let per_frame = block.duration.map(|d| d / count).unwrap_or(0);
        for index in 0..count {
            timecodes.push(block.timecode + index * per_frame);
        }
    }

    timecodes.sort_unstable();

    out.write_all(b"# timecode format v2\n")?;
    for timecode in timecodes {
        out.write_all(format!("{}\n", timecode / 1_000_000).as_bytes())?;
    }
    out.flush()
}

pub fn extract_timecodes(mkv: &mut MatroskaFile, track: u64, path: &str) -> Result<()> {
    let mut out = IoWriter::create(path)?;
    write_timecodes(mkv, track, &mut out)
}
