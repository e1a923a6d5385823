use std::cell::Cell;
use std::rc::Rc;

/// Error taxonomy for the whole crate.
///
/// Readers report structural problems in their source as [`Error::InvalidFormat`]
/// with the file name and the approximate byte offset; probe failures are not
/// errors at all (the caller just tries the next probe).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{file}: invalid {format} data at byte {offset}: {reason}")]
    InvalidFormat {
        file: String,
        format: &'static str,
        offset: u64,
        reason: String,
    },

    #[error("{0}")]
    Unsupported(String),

    #[error("{0}")]
    Config(String),

    #[error("backward reference could not be resolved ({timecode} -> {ref_timecode})")]
    ReferenceUnresolved { timecode: i64, ref_timecode: i64 },

    #[error("internal error at {file}:{line}: {reason}")]
    InternalInvariant {
        file: &'static str,
        line: u32,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid<R: Into<String>>(
        file: impl Into<String>,
        format: &'static str,
        offset: u64,
        reason: R,
    ) -> Error {
        Error::InvalidFormat {
            file: file.into(),
            format,
            offset,
            reason: reason.into(),
        }
    }
}

/// An assertion failure that is always fatal. Records file and line.
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::error::Error::InternalInvariant {
            file: file!(),
            line: line!(),
            reason: format!($($arg)*),
        }
    };
}

/// File-scoped warning accounting.
///
/// Warnings are logged through the `log` facade and counted; their presence
/// only fails the run when the caller decides so (`warnings_as_errors`).
/// Cloning shares the counter.
#[derive(Clone, Default)]
pub struct Warnings(Rc<Cell<u64>>);

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        log::warn!("{}", msg.as_ref());
        self.0.set(self.0.get() + 1);
    }

    pub fn count(&self) -> u64 {
        self.0.get()
    }
}
