use std::io;

use crate::http::BoxError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the proxy engine.
///
/// None of these are fatal to the proxy as a whole: they abort the request or
/// connection they occurred on and are logged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Dialing, TLS or HTTP failure while talking to the real destination.
    #[error("upstream round trip failed: {0}")]
    UpstreamRoundTrip(#[source] BoxError),

    /// A leaf certificate could not be produced for `host`.
    #[error("certificate issuance failed for {host}: {reason}")]
    Issuance { host: String, reason: String },

    /// Replay was requested after the peek buffer overflowed.
    #[error("cannot rewind: more than {capacity} bytes were read since the last checkpoint")]
    RegretOverflow { capacity: usize },

    /// The sink stopped accepting bytes in the middle of a chunk.
    #[error("short write while framing chunk: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("malformed request head: {0}")]
    MalformedHead(String),

    #[error("malformed message body: {0}")]
    MalformedBody(String),

    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("message body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("invalid certificate authority material: {0}")]
    CaMaterial(String),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error only reflects the peer going away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl From<rcgen::Error> for Error {
    fn from(e: rcgen::Error) -> Self {
        Error::CaMaterial(e.to_string())
    }
}
