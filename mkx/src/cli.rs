use std::path::PathBuf;

xflags::xflags! {
    src "./src/cli.rs"

    /// Matroska muxer and extractor.
    cmd mkx {
        repeated -v, --verbose

        /// Mux one or more source files into a Matroska file.
        cmd mux {
            /// Destination file.
            required -o, --output output: PathBuf
            /// Source files, in track-number order.
            repeated input: PathBuf

            /// Maximum bytes per cluster.
            optional --cluster-size cluster_size: u32
            /// Maximum milliseconds per cluster.
            optional --cluster-time cluster_time: u32
            /// Skip cues generation.
            optional --no-cues
            /// Emit per-cluster position elements.
            optional --cluster-positions
            /// Pin all varying output bytes for byte-identical runs.
            optional --deterministic
            /// Exit non-zero when warnings occurred.
            optional --warnings-as-errors
            /// Skip VobSub entries larger than 64 KiB.
            optional --skip-big-vobsubs
            /// TID:displacement-ms[,linear-factor] audio/video sync.
            repeated --sync sync: String
            /// TID:language override.
            repeated --language language: String
            /// TID to mark as the default track.
            repeated --default-track default_track: String
            /// TID:none|zlib|bzip2|lzo1x content compression.
            repeated --compression compression: String
            /// file:track[,file:track...] emission priority.
            optional --track-order track_order: String
        }

        /// Extract tracks from a Matroska file.
        cmd extract {
            /// Source Matroska file.
            required -i, --input input: PathBuf
            /// TID:filename pairs to extract.
            repeated spec: String

            /// TID:filename timecode (v2) dumps.
            repeated --timecodes timecodes: String
            /// Dump raw payloads with codec private and codec state data.
            optional --fullraw
            /// Fixed Ogg stream serial numbers.
            optional --deterministic
        }

        /// List the container and tracks of a file.
        cmd identify {
            required input: PathBuf
        }
    }
}

// generated start
// The following code is generated by `xflags` macro.
// Run `env UPDATE_XFLAGS=1 cargo build` to regenerate.
#[derive(Debug)]
pub struct Mkx {
    pub verbose: u32,
    pub subcommand: MkxCmd,
}

#[derive(Debug)]
pub enum MkxCmd {
    Mux(Mux),
    Extract(Extract),
    Identify(Identify),
}

#[derive(Debug)]
pub struct Mux {
    pub input: Vec<PathBuf>,

    pub output: PathBuf,
    pub cluster_size: Option<u32>,
    pub cluster_time: Option<u32>,
    pub no_cues: bool,
    pub cluster_positions: bool,
    pub deterministic: bool,
    pub warnings_as_errors: bool,
    pub skip_big_vobsubs: bool,
    pub sync: Vec<String>,
    pub language: Vec<String>,
    pub default_track: Vec<String>,
    pub compression: Vec<String>,
    pub track_order: Option<String>,
}

#[derive(Debug)]
pub struct Extract {
    pub spec: Vec<String>,

    pub input: PathBuf,
    pub timecodes: Vec<String>,
    pub fullraw: bool,
    pub deterministic: bool,
}

#[derive(Debug)]
pub struct Identify {
    pub input: PathBuf,
}

impl Mkx {
    #[allow(dead_code)]
    pub fn from_env_or_exit() -> Self {
        Self::from_env_or_exit_()
    }

    #[allow(dead_code)]
    pub fn from_env() -> xflags::Result<Self> {
        Self::from_env_()
    }

    #[allow(dead_code)]
    pub fn from_vec(args: Vec<std::ffi::OsString>) -> xflags::Result<Self> {
        Self::from_vec_(args)
    }
}
// generated end
