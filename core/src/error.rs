use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("remote store: {0}")]
    Remote(String),

    #[error("decryption failed, wrong passphrase or corrupt data")]
    CodecAuth,

    #[error("malformed index: {0}")]
    IndexMalformed(String),

    #[error("invalid path {path:?}: {reason}")]
    PathInvalid {
        path: String,
        reason: &'static str,
    },

    #[error("not found")]
    NotFound,

    #[error("data truncated: {0}")]
    DataTruncated(String),

    #[error("reading source {}: {}", .path.display(), .source)]
    Source {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
