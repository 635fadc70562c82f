use std::io;

use wireline_h2::ErrorCode;

use crate::config::OptionError;

/// Errors surfaced to the engine's caller. Protocol faults never appear
/// here; those travel to each stream's reply target as typed messages.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The transport failed to accept a write.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The engine was created with invalid options.
    #[error(transparent)]
    Options(#[from] OptionError),
}

/// Why a stream (or the whole connection) failed, as reported to reply
/// targets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorCause {
    /// A per-stream protocol violation; the connection survives.
    #[error("{text} (stream error: {reason:?})")]
    Stream {
        reason: ErrorCode,
        text: &'static str,
    },

    /// A connection-wide protocol violation.
    #[error("{text} (connection error: {reason:?})")]
    Connection {
        reason: ErrorCode,
        text: &'static str,
    },

    /// The transport went away underneath the engine.
    #[error("The connection was lost.")]
    Closed,

    /// The server sent GOAWAY.
    #[error("Server is going away.")]
    GoingAway,

    /// The caller used a stream in a state that does not permit the
    /// operation.
    #[error("{0}")]
    BadState(&'static str),
}
