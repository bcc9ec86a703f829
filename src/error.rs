//! Crate-wide error types.
//!
//! Each subsystem gets its own `thiserror` enum; [`ServerError`] folds them
//! into the single type `main` deals with.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read certificate file {path}: {source}")]
    CertRead {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to read private key file {path}: {source}")]
    KeyRead {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("no private key found in {0}")]
    NoKey(String),
    #[error("rustls configuration error: {0}")]
    Rustls(#[from] rustls::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("malformed header")]
    MalformedHeader,
    #[error("invalid content-length")]
    InvalidContentLength,
    #[error("invalid chunk size")]
    InvalidChunkSize,
}

#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("frame violates protocol")]
    Protocol,
    #[error("client frame was not masked")]
    Unmasked,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("startup I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = ServerError> = std::result::Result<T, E>;
