use std::fmt;

/// Errors surfaced by endpoints, pipes and child processes.
///
/// Mirrors the shallow error hierarchy of the library: every operation
/// fails with one of these kinds, never a bare I/O error, so callers can
/// match on intent (misuse vs. a dead peer) rather than on errno.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The endpoint's closed flag was already set.
    #[error("endpoint already closed")]
    AlreadyClosed,

    /// Close was attempted while another task holds the endpoint lock.
    #[error("endpoint is locked by another task")]
    Locked,

    /// Operation invoked from the wrong process, with a bad argument, or
    /// attempting to leave a scope with a still-locked endpoint.
    #[error("misuse: {0}")]
    Misuse(String),

    /// The peer closed its end of the pipe before a frame began.
    #[error("end of stream")]
    Eof,

    /// The codec returned an error while encoding or decoding a payload.
    #[error("codec error: {0}")]
    Codec(String),

    /// An I/O error occurred mid-frame (includes EOF mid-frame, which is
    /// distinct from a clean `Eof` between frames).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn misuse(msg: impl Into<String>) -> Self {
        Error::Misuse(msg.into())
    }

    pub(crate) fn codec(msg: impl fmt::Display) -> Self {
        Error::Codec(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
