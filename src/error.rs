use std::io;

use bincode::error::DecodeError;

/// Errors surfaced by the library.
///
/// Invalid bases and too-short sequences are not errors: encoders reset on
/// them and simply emit fewer k-mers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid parameters, or two sketches with different configurations.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A file whose header or body does not match what the reader expects.
    #[error("malformed file: {0}")]
    Format(String),
    #[error("failed to encode sketch: {0}")]
    Encode(#[from] bincode::error::EncodeError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnexpectedEnd { additional } => {
                Error::Format(format!("truncated input, {additional} more bytes expected"))
            }
            DecodeError::Io { inner, additional } if inner.kind() == io::ErrorKind::UnexpectedEof => {
                Error::Format(format!("truncated input, {additional} more bytes expected"))
            }
            DecodeError::Io { inner, .. } => Error::Io(inner),
            other => Error::Format(other.to_string()),
        }
    }
}

macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::Error::Config(format!($($arg)*))
    };
}

macro_rules! format_error {
    ($($arg:tt)*) => {
        $crate::Error::Format(format!($($arg)*))
    };
}

pub(crate) use config_error;
pub(crate) use format_error;
