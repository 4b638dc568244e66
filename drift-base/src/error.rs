//! The error taxonomy of the engine.

use serde::{Deserialize, Serialize};

/// Result alias using [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error domains surfaced on the wire and at the outermost API boundary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub enum Domain {
    /// Storage and revision-tree failures.
    #[display("Database")]
    Database,
    /// Transport-level failures.
    #[display("Network")]
    Network,
    /// Failures raised by the socket layer itself.
    #[display("WebSocket")]
    WebSocket,
    /// Raw OS errors, with the errno as code.
    #[display("POSIX")]
    Posix,
}

/// All failures the engine reports.
///
/// Actors never let a failure cross their mailbox boundary as a panic; every
/// fallible operation returns one of these. The numeric codes used on the
/// wire are produced by [`Error::domain_code`] and turned back into typed
/// errors by [`Error::from_wire`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested document, revision or blob does not exist.
    #[error("not found")]
    NotFound,
    /// The operation would create a revision branch without permission.
    #[error("conflict")]
    Conflict,
    /// A revision id failed to parse or had the wrong generation.
    #[error("invalid revision id")]
    BadRevId,
    /// A document id was empty or too long.
    #[error("invalid document id")]
    BadDocId,
    /// A blob key string or filename failed to parse.
    #[error("invalid blob key")]
    BadBlobKey,
    /// Stored bytes failed validation (digest mismatch, undecodable tree).
    #[error("corrupt data")]
    CorruptData,
    /// A store directory or file could not be opened.
    #[error("can't open file")]
    CantOpenFile,
    /// An underlying filesystem operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The database is locked by another operation.
    #[error("database busy")]
    Busy,
    /// A transaction was left open at the end of a database message.
    #[error("transaction not closed")]
    TransactionNotClosed,
    /// The remote peer reported a failure we do not model more precisely.
    #[error("remote error: {domain}/{code}: {message}")]
    Remote {
        /// Domain reported by the peer.
        domain: Domain,
        /// Numeric code within the domain.
        code: u32,
        /// Human-readable description. Not stable.
        message: String,
    },
    /// The connection closed while a request was outstanding.
    #[error("disconnected")]
    Disconnected,
    /// The operation is not supported by this build.
    #[error("unimplemented")]
    Unimplemented,
    /// An invariant was violated. Always a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

// Database-domain wire codes. These are part of the external contract and
// must not be renumbered.
const DB_NOT_FOUND: u32 = 1;
const DB_CONFLICT: u32 = 2;
const DB_BAD_REV_ID: u32 = 3;
const DB_BAD_DOC_ID: u32 = 4;
const DB_BAD_BLOB_KEY: u32 = 5;
const DB_CORRUPT: u32 = 6;
const DB_CANT_OPEN: u32 = 7;
const DB_BUSY: u32 = 8;
const DB_TXN_NOT_CLOSED: u32 = 9;
const DB_UNIMPLEMENTED: u32 = 10;
const DB_INTERNAL: u32 = 11;
const NET_DISCONNECTED: u32 = 1;

impl Error {
    /// The `(domain, code)` pair used when this error crosses the wire.
    pub fn domain_code(&self) -> (Domain, u32) {
        match self {
            Error::NotFound => (Domain::Database, DB_NOT_FOUND),
            Error::Conflict => (Domain::Database, DB_CONFLICT),
            Error::BadRevId => (Domain::Database, DB_BAD_REV_ID),
            Error::BadDocId => (Domain::Database, DB_BAD_DOC_ID),
            Error::BadBlobKey => (Domain::Database, DB_BAD_BLOB_KEY),
            Error::CorruptData => (Domain::Database, DB_CORRUPT),
            Error::CantOpenFile => (Domain::Database, DB_CANT_OPEN),
            Error::Busy => (Domain::Database, DB_BUSY),
            Error::TransactionNotClosed => (Domain::Database, DB_TXN_NOT_CLOSED),
            Error::Unimplemented => (Domain::Database, DB_UNIMPLEMENTED),
            Error::Internal(_) => (Domain::Database, DB_INTERNAL),
            Error::Io(err) => (Domain::Posix, err.raw_os_error().unwrap_or(0) as u32),
            Error::Disconnected => (Domain::Network, NET_DISCONNECTED),
            Error::Remote { domain, code, .. } => (*domain, *code),
        }
    }

    /// Rebuild a typed error from a wire `(domain, code, message)` triple.
    ///
    /// Codes we recognize map back onto their local variant so callers can
    /// match on them; anything else is preserved as [`Error::Remote`].
    pub fn from_wire(domain: Domain, code: u32, message: String) -> Self {
        match (domain, code) {
            (Domain::Database, DB_NOT_FOUND) => Error::NotFound,
            (Domain::Database, DB_CONFLICT) => Error::Conflict,
            (Domain::Database, DB_BAD_REV_ID) => Error::BadRevId,
            (Domain::Database, DB_BAD_DOC_ID) => Error::BadDocId,
            (Domain::Database, DB_BAD_BLOB_KEY) => Error::BadBlobKey,
            (Domain::Database, DB_CORRUPT) => Error::CorruptData,
            (Domain::Database, DB_BUSY) => Error::Busy,
            (Domain::Network, NET_DISCONNECTED) => Error::Disconnected,
            _ => Error::Remote {
                domain,
                code,
                message,
            },
        }
    }

    /// True for failures worth retrying with backoff: transient transport
    /// trouble and missing-revision replies.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NotFound | Error::Busy | Error::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        for err in [
            Error::NotFound,
            Error::Conflict,
            Error::BadRevId,
            Error::CorruptData,
            Error::Disconnected,
        ] {
            let (domain, code) = err.domain_code();
            let back = Error::from_wire(domain, code, err.to_string());
            assert_eq!(back.domain_code(), (domain, code));
        }
    }

    #[test]
    fn unknown_codes_stay_remote() {
        let err = Error::from_wire(Domain::WebSocket, 1008, "policy violation".into());
        assert!(matches!(err, Error::Remote { code: 1008, .. }));
        assert_eq!(err.domain_code(), (Domain::WebSocket, 1008));
    }
}
