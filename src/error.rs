// Error taxonomy for the storage server.
// Handler-level failures are reported to clients as a failure response
// carrying an error code plus a human-readable diagnostic; everything in
// here knows how to map itself onto that pair.

use thiserror::Error;

/// Which driver operation a storage error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Prepare,
    Bind,
    Exec,
}

impl std::fmt::Display for StorageOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageOp::Prepare => write!(f, "prepare"),
            StorageOp::Bind => write!(f, "bind"),
            StorageOp::Exec => write!(f, "exec"),
        }
    }
}

/// Server-side error kinds, mirrored 1:1 by the protocol error codes.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame, unknown command kind, corrupt stream data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Client advertised a protocol version we cannot serve.
    #[error("unsupported protocol version {client} (server speaks {server})")]
    UnsupportedVersion { client: i32, server: i32 },

    /// Command not permitted in the current session state.
    #[error("command {command} not allowed in state {state}")]
    InvalidState { command: String, state: String },

    /// Invalid scope, unknown id, bad attribute type, oversized payload.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Revision mismatch, duplicate unique key, schema precondition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Driver-level failure. Carries the statement for diagnostics.
    #[error("query {op} failed: {message} (statement: {sql})")]
    Storage {
        op: StorageOp,
        sql: String,
        message: String,
    },

    /// Read/write failure on an external payload file.
    #[error("payload I/O error: {0}")]
    PayloadIo(String),

    /// A resource was unreachable, timed out, or reported failure.
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    /// Could not obtain the single-instance service lock in time.
    #[error("unable to obtain service lock: {0}")]
    Lock(String),
}

/// Wire error codes, written as the underlying integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Protocol = 1,
    UnsupportedVersion = 2,
    InvalidState = 3,
    Argument = 4,
    Conflict = 5,
    Storage = 6,
    PayloadIo = 7,
    Retrieval = 8,
    Lock = 9,
    Internal = 10,
}

impl ErrorCode {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => ErrorCode::Protocol,
            2 => ErrorCode::UnsupportedVersion,
            3 => ErrorCode::InvalidState,
            4 => ErrorCode::Argument,
            5 => ErrorCode::Conflict,
            6 => ErrorCode::Storage,
            7 => ErrorCode::PayloadIo,
            8 => ErrorCode::Retrieval,
            9 => ErrorCode::Lock,
            10 => ErrorCode::Internal,
            _ => return None,
        })
    }
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Protocol(_) => ErrorCode::Protocol,
            Error::UnsupportedVersion { .. } => ErrorCode::UnsupportedVersion,
            Error::InvalidState { .. } => ErrorCode::InvalidState,
            Error::Argument(_) => ErrorCode::Argument,
            Error::Conflict(_) => ErrorCode::Conflict,
            Error::Storage { .. } => ErrorCode::Storage,
            Error::PayloadIo(_) => ErrorCode::PayloadIo,
            Error::Retrieval(_) => ErrorCode::Retrieval,
            Error::Lock(_) => ErrorCode::Lock,
        }
    }

    pub fn storage(op: StorageOp, sql: impl Into<String>, message: impl ToString) -> Self {
        Error::Storage {
            op,
            sql: sql.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Maps an arbitrary `anyhow` failure onto the wire pair. Typed errors keep
/// their own code; everything else is reported as Internal.
pub fn error_to_response(err: &anyhow::Error) -> (ErrorCode, String) {
    match err.downcast_ref::<Error>() {
        Some(typed) => (typed.code(), typed.to_string()),
        None => (ErrorCode::Internal, format!("{err:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_errors_keep_their_code_through_anyhow() {
        let err = anyhow::Error::new(Error::Conflict("revision mismatch".into()));
        let (code, msg) = error_to_response(&err);
        assert_eq!(code, ErrorCode::Conflict);
        assert!(msg.contains("revision mismatch"));
    }

    #[test]
    fn untyped_errors_become_internal() {
        let err = anyhow::anyhow!("something broke");
        let (code, _) = error_to_response(&err);
        assert_eq!(code, ErrorCode::Internal);
    }
}
