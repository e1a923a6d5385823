//! Element ids and context tables for the Matroska subset this crate reads
//! and writes. Ids are stored with the marker bit, the way they appear in the
//! stream.

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EbmlId(pub u32);

impl std::fmt::Debug for EbmlId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}(0x{:x})", name(*self), self.0)
    }
}

pub const EBML_HEADER: EbmlId = EbmlId(0x1a45dfa3);
pub const EBML_VERSION: EbmlId = EbmlId(0x4286);
pub const EBML_READ_VERSION: EbmlId = EbmlId(0x42f7);
pub const EBML_MAX_ID_LENGTH: EbmlId = EbmlId(0x42f2);
pub const EBML_MAX_SIZE_LENGTH: EbmlId = EbmlId(0x42f3);
pub const DOC_TYPE: EbmlId = EbmlId(0x4282);
pub const DOC_TYPE_VERSION: EbmlId = EbmlId(0x4287);
pub const DOC_TYPE_READ_VERSION: EbmlId = EbmlId(0x4285);

pub const SEGMENT: EbmlId = EbmlId(0x18538067);

pub const SEEK_HEAD: EbmlId = EbmlId(0x114d9b74);
pub const SEEK: EbmlId = EbmlId(0x4dbb);
pub const SEEK_ID: EbmlId = EbmlId(0x53ab);
pub const SEEK_POSITION: EbmlId = EbmlId(0x53ac);

pub const INFO: EbmlId = EbmlId(0x1549a966);
pub const TIMECODE_SCALE: EbmlId = EbmlId(0x2ad7b1);
pub const DURATION: EbmlId = EbmlId(0x4489);
pub const DATE_UTC: EbmlId = EbmlId(0x4461);
pub const MUXING_APP: EbmlId = EbmlId(0x4d80);
pub const WRITING_APP: EbmlId = EbmlId(0x5741);
pub const SEGMENT_UID: EbmlId = EbmlId(0x73a4);

pub const TRACKS: EbmlId = EbmlId(0x1654ae6b);
pub const TRACK_ENTRY: EbmlId = EbmlId(0xae);
pub const TRACK_NUMBER: EbmlId = EbmlId(0xd7);
pub const TRACK_UID: EbmlId = EbmlId(0x73c5);
pub const TRACK_TYPE: EbmlId = EbmlId(0x83);
pub const FLAG_ENABLED: EbmlId = EbmlId(0xb9);
pub const FLAG_DEFAULT: EbmlId = EbmlId(0x88);
pub const FLAG_LACING: EbmlId = EbmlId(0x9c);
pub const MIN_CACHE: EbmlId = EbmlId(0x6de7);
pub const DEFAULT_DURATION: EbmlId = EbmlId(0x23e383);
pub const LANGUAGE: EbmlId = EbmlId(0x22b59c);
pub const CODEC_ID: EbmlId = EbmlId(0x86);
pub const CODEC_PRIVATE: EbmlId = EbmlId(0x63a2);

pub const VIDEO: EbmlId = EbmlId(0xe0);
pub const FLAG_INTERLACED: EbmlId = EbmlId(0x9a);
pub const PIXEL_WIDTH: EbmlId = EbmlId(0xb0);
pub const PIXEL_HEIGHT: EbmlId = EbmlId(0xba);
pub const DISPLAY_WIDTH: EbmlId = EbmlId(0x54b0);
pub const DISPLAY_HEIGHT: EbmlId = EbmlId(0x54ba);

pub const AUDIO: EbmlId = EbmlId(0xe1);
pub const SAMPLING_FREQUENCY: EbmlId = EbmlId(0xb5);
pub const OUTPUT_SAMPLING_FREQUENCY: EbmlId = EbmlId(0x78b5);
pub const CHANNELS: EbmlId = EbmlId(0x9f);
pub const BIT_DEPTH: EbmlId = EbmlId(0x6264);

pub const CONTENT_ENCODINGS: EbmlId = EbmlId(0x6d80);
pub const CONTENT_ENCODING: EbmlId = EbmlId(0x6240);
pub const CONTENT_ENCODING_ORDER: EbmlId = EbmlId(0x5031);
pub const CONTENT_ENCODING_SCOPE: EbmlId = EbmlId(0x5032);
pub const CONTENT_ENCODING_TYPE: EbmlId = EbmlId(0x5033);
pub const CONTENT_COMPRESSION: EbmlId = EbmlId(0x5034);
pub const CONTENT_COMP_ALGO: EbmlId = EbmlId(0x4254);
pub const CONTENT_COMP_SETTINGS: EbmlId = EbmlId(0x4255);

pub const CLUSTER: EbmlId = EbmlId(0x1f43b675);
pub const CLUSTER_TIMECODE: EbmlId = EbmlId(0xe7);
pub const CLUSTER_POSITION: EbmlId = EbmlId(0xa7);
pub const CLUSTER_PREV_SIZE: EbmlId = EbmlId(0xab);
pub const SIMPLE_BLOCK: EbmlId = EbmlId(0xa3);
pub const BLOCK_GROUP: EbmlId = EbmlId(0xa0);
pub const BLOCK: EbmlId = EbmlId(0xa1);
pub const BLOCK_ADDITIONS: EbmlId = EbmlId(0x75a1);
pub const BLOCK_MORE: EbmlId = EbmlId(0xa6);
pub const BLOCK_ADD_ID: EbmlId = EbmlId(0xee);
pub const BLOCK_ADDITIONAL: EbmlId = EbmlId(0xa5);
pub const BLOCK_DURATION: EbmlId = EbmlId(0x9b);
pub const REFERENCE_BLOCK: EbmlId = EbmlId(0xfb);
pub const CODEC_STATE: EbmlId = EbmlId(0xa4);

pub const CUES: EbmlId = EbmlId(0x1c53bb6b);
pub const CUE_POINT: EbmlId = EbmlId(0xbb);
pub const CUE_TIME: EbmlId = EbmlId(0xb3);
pub const CUE_TRACK_POSITIONS: EbmlId = EbmlId(0xb7);
pub const CUE_TRACK: EbmlId = EbmlId(0xf7);
pub const CUE_CLUSTER_POSITION: EbmlId = EbmlId(0xf1);
pub const CUE_BLOCK_NUMBER: EbmlId = EbmlId(0x5378);

pub const ATTACHMENTS: EbmlId = EbmlId(0x1941a469);
pub const ATTACHED_FILE: EbmlId = EbmlId(0x61a7);
pub const FILE_NAME: EbmlId = EbmlId(0x466e);
pub const FILE_MIME_TYPE: EbmlId = EbmlId(0x4660);
pub const FILE_DATA: EbmlId = EbmlId(0x465c);
pub const FILE_UID: EbmlId = EbmlId(0x46ae);

pub const CHAPTERS: EbmlId = EbmlId(0x1043a770);
pub const TAGS: EbmlId = EbmlId(0x1254c367);

pub const VOID: EbmlId = EbmlId(0xec);
pub const CRC32: EbmlId = EbmlId(0xbf);

/// Sentinel id for the stream root ("parent" of EBML header and Segment).
pub const ROOT: EbmlId = EbmlId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    UInt,
    SInt,
    Float,
    Str,
    Utf8,
    Binary,
    Date,
    Master,
}

pub fn kind(id: EbmlId) -> Option<ElementKind> {
    use ElementKind::*;

    let kind = match id {
        EBML_HEADER | SEGMENT | SEEK_HEAD | SEEK | INFO | TRACKS | TRACK_ENTRY | VIDEO
        | AUDIO | CONTENT_ENCODINGS | CONTENT_ENCODING | CONTENT_COMPRESSION | CLUSTER
        | BLOCK_GROUP | BLOCK_ADDITIONS | BLOCK_MORE | CUES | CUE_POINT
        | CUE_TRACK_POSITIONS | ATTACHMENTS | ATTACHED_FILE | CHAPTERS | TAGS => Master,

        EBML_VERSION | EBML_READ_VERSION | EBML_MAX_ID_LENGTH | EBML_MAX_SIZE_LENGTH
        | DOC_TYPE_VERSION | DOC_TYPE_READ_VERSION | SEEK_POSITION | TIMECODE_SCALE
        | TRACK_NUMBER | TRACK_UID | TRACK_TYPE | FLAG_ENABLED | FLAG_DEFAULT | FLAG_LACING
        | MIN_CACHE | DEFAULT_DURATION | PIXEL_WIDTH | PIXEL_HEIGHT | DISPLAY_WIDTH
        | DISPLAY_HEIGHT | FLAG_INTERLACED | CHANNELS | BIT_DEPTH | CONTENT_ENCODING_ORDER
        | CONTENT_ENCODING_SCOPE | CONTENT_ENCODING_TYPE | CONTENT_COMP_ALGO
        | CLUSTER_TIMECODE | CLUSTER_POSITION | CLUSTER_PREV_SIZE | BLOCK_ADD_ID
        | BLOCK_DURATION | CUE_TIME | CUE_TRACK | CUE_CLUSTER_POSITION | CUE_BLOCK_NUMBER
        | FILE_UID => UInt,

        REFERENCE_BLOCK => SInt,

        DURATION | SAMPLING_FREQUENCY | OUTPUT_SAMPLING_FREQUENCY => Float,

        DOC_TYPE | LANGUAGE | CODEC_ID | FILE_MIME_TYPE => Str,

        MUXING_APP | WRITING_APP | FILE_NAME => Utf8,

        DATE_UTC => Date,

        SEEK_ID | SEGMENT_UID | CODEC_PRIVATE | SIMPLE_BLOCK | BLOCK | BLOCK_ADDITIONAL
        | CODEC_STATE | CONTENT_COMP_SETTINGS | FILE_DATA | VOID | CRC32 => Binary,

        _ => return None,
    };

    Some(kind)
}

/// Allowed children of a master element. Void and CRC-32 are global and
/// handled separately by the element walker.
pub fn context(id: EbmlId) -> &'static [EbmlId] {
    match id {
        ROOT => &[EBML_HEADER, SEGMENT],
        EBML_HEADER => &[
            EBML_VERSION,
            EBML_READ_VERSION,
            EBML_MAX_ID_LENGTH,
            EBML_MAX_SIZE_LENGTH,
            DOC_TYPE,
            DOC_TYPE_VERSION,
            DOC_TYPE_READ_VERSION,
        ],
        SEGMENT => &[
            SEEK_HEAD,
            INFO,
            TRACKS,
            CLUSTER,
            CUES,
            CHAPTERS,
            ATTACHMENTS,
            TAGS,
        ],
        SEEK_HEAD => &[SEEK],
        SEEK => &[SEEK_ID, SEEK_POSITION],
        INFO => &[
            TIMECODE_SCALE,
            DURATION,
            DATE_UTC,
            MUXING_APP,
            WRITING_APP,
            SEGMENT_UID,
        ],
        TRACKS => &[TRACK_ENTRY],
        TRACK_ENTRY => &[
            TRACK_NUMBER,
            TRACK_UID,
            TRACK_TYPE,
            FLAG_ENABLED,
            FLAG_DEFAULT,
            FLAG_LACING,
            MIN_CACHE,
            DEFAULT_DURATION,
            LANGUAGE,
            CODEC_ID,
            CODEC_PRIVATE,
            VIDEO,
            AUDIO,
            CONTENT_ENCODINGS,
        ],
        VIDEO => &[
            FLAG_INTERLACED,
            PIXEL_WIDTH,
            PIXEL_HEIGHT,
            DISPLAY_WIDTH,
            DISPLAY_HEIGHT,
        ],
        AUDIO => &[
            SAMPLING_FREQUENCY,
            OUTPUT_SAMPLING_FREQUENCY,
            CHANNELS,
            BIT_DEPTH,
        ],
        CONTENT_ENCODINGS => &[CONTENT_ENCODING],
        CONTENT_ENCODING => &[
            CONTENT_ENCODING_ORDER,
            CONTENT_ENCODING_SCOPE,
            CONTENT_ENCODING_TYPE,
            CONTENT_COMPRESSION,
        ],
        CONTENT_COMPRESSION => &[CONTENT_COMP_ALGO, CONTENT_COMP_SETTINGS],
        CLUSTER => &[
            CLUSTER_TIMECODE,
            CLUSTER_POSITION,
            CLUSTER_PREV_SIZE,
            SIMPLE_BLOCK,
            BLOCK_GROUP,
        ],
        BLOCK_GROUP => &[
            BLOCK,
            BLOCK_ADDITIONS,
            BLOCK_DURATION,
            REFERENCE_BLOCK,
            CODEC_STATE,
        ],
        BLOCK_ADDITIONS => &[BLOCK_MORE],
        BLOCK_MORE => &[BLOCK_ADD_ID, BLOCK_ADDITIONAL],
        CUES => &[CUE_POINT],
        CUE_POINT => &[CUE_TIME, CUE_TRACK_POSITIONS],
        CUE_TRACK_POSITIONS => &[CUE_TRACK, CUE_CLUSTER_POSITION, CUE_BLOCK_NUMBER],
        ATTACHMENTS => &[ATTACHED_FILE],
        ATTACHED_FILE => &[FILE_NAME, FILE_MIME_TYPE, FILE_DATA, FILE_UID],
        _ => &[],
    }
}

/// Immediate parent of an element, used for the "upper level" predicate.
pub fn parent(id: EbmlId) -> Option<EbmlId> {
    if id == ROOT {
        return None;
    }
    if matches!(id, EBML_HEADER | SEGMENT) {
        return Some(ROOT);
    }

    fn search(parent_id: EbmlId, id: EbmlId) -> Option<EbmlId> {
        for &child in context(parent_id) {
            if child == id {
                return Some(parent_id);
            }
            if kind(child) == Some(ElementKind::Master) {
                if let Some(found) = search(child, id) {
                    return Some(found);
                }
            }
        }
        None
    }

    search(ROOT, id)
}

pub fn name(id: EbmlId) -> &'static str {
    match id {
        EBML_HEADER => "EBML",
        DOC_TYPE => "DocType",
        SEGMENT => "Segment",
        SEEK_HEAD => "SeekHead",
        SEEK => "Seek",
        SEEK_ID => "SeekID",
        SEEK_POSITION => "SeekPosition",
        INFO => "Info",
        TIMECODE_SCALE => "TimecodeScale",
        DURATION => "Duration",
        DATE_UTC => "DateUTC",
        MUXING_APP => "MuxingApp",
        WRITING_APP => "WritingApp",
        TRACKS => "Tracks",
        TRACK_ENTRY => "TrackEntry",
        TRACK_NUMBER => "TrackNumber",
        TRACK_UID => "TrackUID",
        TRACK_TYPE => "TrackType",
        CODEC_ID => "CodecID",
        CODEC_PRIVATE => "CodecPrivate",
        VIDEO => "Video",
        AUDIO => "Audio",
        CLUSTER => "Cluster",
        CLUSTER_TIMECODE => "Timecode",
        SIMPLE_BLOCK => "SimpleBlock",
        BLOCK_GROUP => "BlockGroup",
        BLOCK => "Block",
        BLOCK_DURATION => "BlockDuration",
        REFERENCE_BLOCK => "ReferenceBlock",
        CODEC_STATE => "CodecState",
        BLOCK_ADDITIONS => "BlockAdditions",
        CUES => "Cues",
        CUE_POINT => "CuePoint",
        ATTACHMENTS => "Attachments",
        CHAPTERS => "Chapters",
        TAGS => "Tags",
        VOID => "Void",
        CRC32 => "CRC-32",
        _ => "Unknown",
    }
}
