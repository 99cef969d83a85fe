//! Coordination error types.
//!
//! Every failure mode of the layer is one variant of [`CoordError`]; callers
//! branch on [`CoordError::kind`] rather than on concrete types.

use thiserror::Error;

use crate::config::ConfigError;

/// Coordination errors.
#[derive(Error, Debug)]
pub enum CoordError {
    /// The coordination service could not be reached, even after a reconnect.
    #[error("Coordination service unavailable: {detail}")]
    CoordinationUnavailable { detail: String },

    /// The session backing a connection expired or was lost.
    ///
    /// Only raw connections return this; the client turns it into a
    /// reconnect and never hands it to callers.
    #[error("Session {session_id:#x} expired")]
    SessionExpired { session_id: u64 },

    /// Node absent on read, write or delete (or parent absent on create).
    #[error("No such node: {path}")]
    NotFound { path: String },

    /// Node already present on create.
    #[error("Node already exists: {path}")]
    AlreadyExists { path: String },

    /// Delete of a node that still has children.
    #[error("Node has children: {path}")]
    NotEmpty { path: String },

    /// A create lost a race that could not be resolved locally.
    #[error("Conflicting write on {path}")]
    ConflictingWrite { path: String },

    /// Compare-and-set failure; callers must re-read and retry explicitly.
    #[error("Version mismatch on {path} (expected {expected}, actual {actual})")]
    VersionMismatch {
        path: String,
        expected: i32,
        actual: i32,
    },

    /// Malformed control message or snapshot encoding.
    #[error("Corrupt message: {reason}")]
    CorruptMessage { reason: String },

    /// Operation requires leadership this process does not hold.
    #[error("Not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<String> },

    /// Host does not resolve or address string is malformed.
    #[error("Invalid server address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Server name is not `hostname,port,startcode`.
    #[error("Invalid server name {name}: {reason}")]
    InvalidServerName { name: String, reason: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Serialization error.
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: bincode::Error,
    },
}

/// The tag of a [`CoordError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    CoordinationUnavailable,
    SessionExpired,
    NotFound,
    AlreadyExists,
    ConflictingWrite,
    VersionMismatch,
    CorruptMessage,
    NotLeader,
    InvalidInput,
}

impl CoordError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordError::CoordinationUnavailable { .. } => ErrorKind::CoordinationUnavailable,
            CoordError::SessionExpired { .. } => ErrorKind::SessionExpired,
            CoordError::NotFound { .. } => ErrorKind::NotFound,
            CoordError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            CoordError::ConflictingWrite { .. } | CoordError::NotEmpty { .. } => {
                ErrorKind::ConflictingWrite
            }
            CoordError::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            CoordError::CorruptMessage { .. } | CoordError::Serialization { .. } => {
                ErrorKind::CorruptMessage
            }
            CoordError::NotLeader { .. } => ErrorKind::NotLeader,
            CoordError::InvalidAddress { .. }
            | CoordError::InvalidServerName { .. }
            | CoordError::Config(_) => ErrorKind::InvalidInput,
        }
    }

    /// True for errors that a new session may cure.
    pub fn is_session_loss(&self) -> bool {
        matches!(self, CoordError::SessionExpired { .. })
    }

    pub(crate) fn unavailable(detail: impl Into<String>) -> Self {
        CoordError::CoordinationUnavailable {
            detail: detail.into(),
        }
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        CoordError::CorruptMessage {
            reason: reason.into(),
        }
    }
}

/// Coordination result type.
pub type Result<T> = std::result::Result<T, CoordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        let err = CoordError::NotFound {
            path: "/cluster/root".into(),
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("/cluster/root"));

        let err = CoordError::VersionMismatch {
            path: "/cluster/root".into(),
            expected: 1,
            actual: 3,
        };
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);

        assert!(CoordError::SessionExpired { session_id: 7 }.is_session_loss());
        assert!(!CoordError::unavailable("down").is_session_loss());
        assert_eq!(
            CoordError::corrupt("bad tag").kind(),
            ErrorKind::CorruptMessage
        );
    }
}
