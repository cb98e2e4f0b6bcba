use std::path::PathBuf;

use itertools::Itertools;
use thiserror::Error;

use crate::gtfs::Field;

#[derive(Error, Debug)]
pub enum PrecacheError {
    #[error("Could not access {path:?}")]
    FileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid header format, missing required columns: {}", .missing.iter().join(", "))]
    HeaderFormat { missing: Vec<Field> },

    #[error("Input changed between passes: declared {declared} rows, encoded {written}")]
    InputChanged { declared: u64, written: u64 },

    #[error("Could not encode document")]
    Encode(#[from] EncodeError),

    #[error("Version mismatch: binary={embedded}, declared={declared}; rebuild the tool or pass --rebuild")]
    VersionMismatch { embedded: String, declared: String },

    #[error("Rebuild failed: {0}")]
    RebuildFailure(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl PrecacheError {
    pub fn file_access(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileAccess {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Could not write MessagePack value")]
    Write(#[from] rmp::encode::ValueWriteError),

    #[error("Could not serialize row")]
    Serialize(#[from] rmp_serde::encode::Error),

    #[error("Could not decode document")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("{0} rows do not fit a MessagePack array")]
    TooManyRows(u64),

    #[error("Declared {declared} rows but {written} were encoded")]
    LengthMismatch { declared: u64, written: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error("Missing field {0}")]
    MissingField(Field),

    #[error("Field {field} is {len} bytes long, limit is {max}")]
    FieldTooLong { field: Field, len: usize, max: usize },

    #[error("Field {0} is not valid UTF-8")]
    InvalidUtf8(Field),

    #[error("Invalid stop_sequence {value:?}: {reason}")]
    SequenceFormat {
        value: String,
        reason: SequenceReason,
    },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{len} bytes exceeds the {max} byte limit")]
pub struct TooLong {
    pub len: usize,
    pub max: usize,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceReason {
    #[error("not a base-10 integer")]
    NotNumeric,

    #[error("negative")]
    Negative,

    #[error("outside the 32-bit range")]
    OutOfRange,
}
