//! User-visible result codes.

use thiserror::Error;

/// Result code delivered to every operation callback.
///
/// Exactly one code is delivered per submitted operation. Transient
/// conditions (disconnects, timeouts) are surfaced here and never retried at
/// this layer; the quorum layer above decides what to do with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    /// The operation completed successfully.
    #[error("OK")]
    Ok,

    /// No pool, no live connection, a write failed, or the peer dropped the
    /// connection before the operation completed.
    #[error("server unavailable")]
    ServerUnavailable,

    /// The client facade has been closed.
    #[error("client closed")]
    ClientClosed,

    /// The ordered callback executor rejected the submission.
    #[error("callback submission interrupted")]
    Interrupted,

    /// The server does not speak our protocol version.
    #[error("protocol version mismatch")]
    ProtocolVersion,

    /// The ledger has been fenced on the server; writes are refused.
    #[error("ledger fenced")]
    LedgerFenced,

    /// The server refused the credentials, the auth plugins were
    /// incompatible, or authentication failed without a specific code.
    #[error("unauthorized")]
    Unauthorized,

    /// The server is in read-only mode and refused a write.
    #[error("server is read-only")]
    ReadOnly,

    /// The requested entry (or its ledger) does not exist on the server.
    #[error("no such entry")]
    NoSuchEntry,

    /// The requested entry has been trimmed away on the server.
    #[error("entry trimmed")]
    EntryTrimmed,

    /// Authentication did not complete within the configured window.
    #[error("authentication timed out")]
    AuthTimeout,

    /// The server returned an unrecognized non-OK status for a write.
    #[error("write failed")]
    WriteFailure,

    /// The server returned an unrecognized non-OK status for a read.
    #[error("read failed")]
    ReadFailure,
}

impl ErrorCode {
    /// Whether this code indicates success.
    pub fn is_ok(self) -> bool {
        matches!(self, ErrorCode::Ok)
    }
}
