//! Client error types.

use crate::grpc::{ConnectStatus, WfmReplyStatus};
use thiserror::Error;

/// Result type alias using TekHsiError.
pub type Result<T> = std::result::Result<T, TekHsiError>;

/// Errors that can occur when using the TekHSI client.
#[derive(Error, Debug)]
pub enum TekHsiError {
    /// gRPC transport error (connection failed, TLS error, etc.).
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The instrument URL could not be parsed as a valid URI.
    #[error("invalid instrument URL: {0}")]
    InvalidUri(#[from] tonic::codegen::http::uri::InvalidUri),

    /// gRPC status error (server returned an error).
    #[error("gRPC status error: {0}")]
    Rpc(#[from] tonic::Status),

    /// The instrument rejected a session operation.
    #[error("instrument rejected session operation: {0:?}")]
    Connection(ConnectStatus),

    /// The waveform stream violated the header-then-chunks contract.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A waveform stream reported a non-success status.
    #[error("waveform stream for '{symbol}' failed: {status:?}")]
    Stream {
        /// Symbol whose stream failed.
        symbol: String,
        /// Status reported by the server.
        status: WfmReplyStatus,
    },

    /// Requested symbol is not part of the committed acquisition.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// `get_data` was called outside an `access_data` scope.
    #[error("no data-access scope is open")]
    NoAccessScope,

    /// Waiting for an acquisition exceeded the configured bound.
    #[error("timed out waiting for acquisition")]
    Timeout,

    /// The session failed fatally (keep-alive exhausted, transport lost).
    #[error("session is broken")]
    SessionBroken,

    /// The session was shut down cleanly.
    #[error("session is closed")]
    SessionClosed,
}
