//! The closed error surface for the session daemon.
//!
//! Mirrors the error-kind table in the specification's error-handling
//! design: each variant is a distinct failure mode with its own
//! propagation policy (see callers), not a generic catch-all.

use std::io;

/// An error produced by the session daemon's core subsystems.
#[derive(Debug, thiserror::Error)]
pub enum XtelnetError {
    #[error("could not connect to {host}:{port}: {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("connection was closed by server")]
    RemoteClosed,

    #[error("{0}")]
    RemoteIoError(io::Error),

    #[error("{0}")]
    UiIoError(io::Error),

    #[error("invalid packet")]
    FrameMalformed,

    #[error("{0}")]
    CommandMalformed(String),

    #[error("already attached")]
    AlreadyAttached,

    #[error("no such session: {0}")]
    NoSuchSession(String),
}

pub type Result<T> = std::result::Result<T, XtelnetError>;
