use std::collections::HashMap;
use std::sync::atomic::AtomicBool;

use anyhow::Context;

use mkvbox::codec::TrackSync;
use mkvbox::error::Warnings;
use mkvbox::extract::{ExtractOptions, TrackSpec};
use mkvbox::format::{open_reader, Reader, SourceOptions};
use mkvbox::io::{IoReader, IoWriter};
use mkvbox::mux::{MuxOptions, Muxer};

mod cli;

use cli::{Extract, Identify, Mkx, MkxCmd, Mux};

fn main() {
    let args = Mkx::from_env_or_exit();

    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let code = match run(args) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("(mkx) Error: {error:#}.");
            2
        }
    };
    std::process::exit(code);
}

fn run(args: Mkx) -> anyhow::Result<i32> {
    match args.subcommand {
        MkxCmd::Mux(mux) => run_mux(mux),
        MkxCmd::Extract(extract) => run_extract(extract),
        MkxCmd::Identify(identify) => run_identify(identify),
    }
}

/// `TID:value` option strings, keyed by the 0-based track id.
fn parse_tid_map(entries: &[String], what: &str) -> anyhow::Result<HashMap<usize, String>> {
    let mut map = HashMap::new();
    for entry in entries {
        let (tid, value) = entry
            .split_once(':')
            .with_context(|| format!("{what} expects TID:value, got '{entry}'"))?;
        let tid: usize = tid
            .parse()
            .with_context(|| format!("{what}: '{tid}' is not a track id"))?;
        map.insert(tid, value.to_string());
    }
    Ok(map)
}

fn run_mux(args: Mux) -> anyhow::Result<i32> {
    if args.input.is_empty() {
        anyhow::bail!("no input files given");
    }

    let warnings = Warnings::new();

    let mut sync = HashMap::new();
    for (tid, value) in parse_tid_map(&args.sync, "--sync")? {
        let (displacement, linear) = match value.split_once(',') {
            Some((d, l)) => (d.parse::<i64>()?, l.parse::<f64>()?),
            None => (value.parse::<i64>()?, 1.0),
        };
        sync.insert(
            tid,
            TrackSync {
                displacement: displacement * 1_000_000,
                linear,
            },
        );
    }

    let mut compression = HashMap::new();
    for (tid, value) in parse_tid_map(&args.compression, "--compression")? {
        let algo = match value.as_str() {
            "none" => None,
            "zlib" => Some(mkvbox::media::CompressionAlgo::Zlib),
            "bzip2" => Some(mkvbox::media::CompressionAlgo::Bzip2),
            "lzo1x" => Some(mkvbox::media::CompressionAlgo::Lzo1x),
            other => anyhow::bail!("--compression: unknown method '{other}'"),
        };
        compression.insert(tid, algo);
    }

    let languages = parse_tid_map(&args.language, "--language")?;
    let mut default_track = HashMap::new();
    for entry in &args.default_track {
        let tid: usize = entry
            .parse()
            .with_context(|| format!("--default-track: '{entry}' is not a track id"))?;
        default_track.insert(tid, true);
    }

    let source_options = SourceOptions {
        warnings: warnings.clone(),
        sync,
        languages,
        default_track,
        compression,
        track_filter: None,
        skip_big_vobsubs: args.skip_big_vobsubs,
    };

    let mut readers: Vec<Box<dyn Reader>> = Vec::new();
    for input in &args.input {
        let io = IoReader::open(input)
            .with_context(|| format!("failed to open '{}'", input.display()))?;
        let reader = open_reader(io, source_options.clone())?;
        log::info!(
            "'{}': using the {} reader",
            input.display(),
            reader.container()
        );
        readers.push(reader);
    }

    let mut track_order = Vec::new();
    if let Some(order) = &args.track_order {
        for pair in order.split(',') {
            let (file, track) = pair
                .split_once(':')
                .with_context(|| format!("--track-order expects file:track, got '{pair}'"))?;
            track_order.push((file.parse::<usize>()?, track.parse::<usize>()?));
        }
    }

    let options = MuxOptions {
        max_cluster_size: args.cluster_size.unwrap_or(5_242_880),
        max_cluster_time_ms: args.cluster_time.unwrap_or(32_767),
        no_cues: args.no_cues,
        cluster_positions: args.cluster_positions,
        track_order,
        warnings_as_errors: args.warnings_as_errors,
        deterministic: args.deterministic,
        writing_app: format!("mkx {}", env!("CARGO_PKG_VERSION")),
        ..MuxOptions::default()
    };
    let warnings_as_errors = options.warnings_as_errors;

    let out = IoWriter::create(&args.output)
        .with_context(|| format!("failed to create '{}'", args.output.display()))?;

    let cancel = AtomicBool::new(false);
    let mut muxer = Muxer::new(out, readers, options, warnings.clone())?;
    let report = muxer.run(&cancel)?;

    log::info!(
        "wrote {} cluster(s), duration {} ms",
        report.clusters_rendered,
        report.duration_ms
    );

    if report.warnings > 0 {
        eprintln!("(mkx) Warning: {} warning(s) were issued.", report.warnings);
        if warnings_as_errors {
            return Ok(1);
        }
    }
    Ok(0)
}

fn run_extract(args: Extract) -> anyhow::Result<i32> {
    let warnings = Warnings::new();

    let mut specs = Vec::new();
    for (tid, output) in parse_tid_map(&args.spec, "extraction spec")? {
        specs.push(TrackSpec {
            track: tid as u64,
            output,
            fullraw: args.fullraw,
        });
    }

    let options = ExtractOptions {
        warnings: warnings.clone(),
        deterministic: args.deterministic,
    };

    if !specs.is_empty() {
        let io = IoReader::open(&args.input)
            .with_context(|| format!("failed to open '{}'", args.input.display()))?;
        let mut mkv = mkvbox::format::mkv::MatroskaFile::open(io, warnings.clone())?;
        mkvbox::extract::extract_tracks(&mut mkv, &specs, &options)?;
    }

    for (tid, output) in parse_tid_map(&args.timecodes, "--timecodes")? {
        let io = IoReader::open(&args.input)
            .with_context(|| format!("failed to open '{}'", args.input.display()))?;
        let mut mkv = mkvbox::format::mkv::MatroskaFile::open(io, warnings.clone())?;
        mkvbox::extract::timecodes::extract_timecodes(&mut mkv, tid as u64, &output)?;
    }

    if warnings.count() > 0 {
        eprintln!("(mkx) Warning: {} warning(s) were issued.", warnings.count());
    }
    Ok(0)
}

fn run_identify(args: Identify) -> anyhow::Result<i32> {
    let io = IoReader::open(&args.input)
        .with_context(|| format!("failed to open '{}'", args.input.display()))?;

    // Matroska files identify through the extract-side walker, everything
    // else through the reader registry.
    let mut head = vec![0u8; 16384];
    let mut io = io;
    let got = io.read_some(&mut head)?;
    head.truncate(got);
    io.seek(std::io::SeekFrom::Start(0))?;

    if mkvbox::format::mkv::probe(&head) {
        let mkv = mkvbox::format::mkv::MatroskaFile::open(io, Warnings::new())?;
        println!("File '{}': container: Matroska", args.input.display());
        for track in &mkv.tracks {
            let kind = track
                .track_type
                .map(|t| t.describe())
                .unwrap_or("unknown");
            println!("Track ID {}: {kind} ({})", track.number, track.codec_id);
        }
        for attachment in &mkv.attachments {
            println!("Attachment: '{}' ({})", attachment.name, attachment.mime);
        }
        if mkv.has_chapters {
            println!("Chapters: present");
        }
        if mkv.has_tags {
            println!("Tags: present");
        }
        return Ok(0);
    }

    let mut reader = open_reader(io, SourceOptions::default())?;
    reader.read_headers()?;
    for line in reader.identify() {
        println!("{line}");
    }
    Ok(0)
}
