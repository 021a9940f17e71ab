// src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NfcError {
    #[error("PC/SC hardware support is not available")]
    HardwareUnavailable,

    #[error("no reader named {0:?} is connected")]
    NoReaderPresent(String),

    #[error("payload too large ({size} bytes, max: {max} bytes)")]
    CapacityExceeded { size: usize, max: usize },

    #[error("invalid NDEF language code {0:?}")]
    InvalidLanguageCode(String),

    #[error("APDU error: status word {status}")]
    Apdu { status: String },

    #[error("malformed APDU response: {len} byte(s), expected at least 2")]
    MalformedResponse { len: usize },

    #[error("reader did not answer within {millis} ms")]
    Timeout { millis: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("write aborted at page {page} after {pages_written} page(s): {source}")]
    PartialWrite {
        page: u8,
        pages_written: usize,
        #[source]
        source: Box<NfcError>,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NfcError {
    /// Errors coming back from the reader itself. These abort the current
    /// multi-page operation and are never retried.
    pub fn is_apdu_failure(&self) -> bool {
        match self {
            NfcError::Apdu { .. }
            | NfcError::MalformedResponse { .. }
            | NfcError::Timeout { .. }
            | NfcError::Transport(_) => true,
            NfcError::PartialWrite { source, .. } => source.is_apdu_failure(),
            _ => false,
        }
    }
}

impl From<pcsc::Error> for NfcError {
    fn from(err: pcsc::Error) -> Self {
        NfcError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NfcError>;
