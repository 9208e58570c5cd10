//! Error types for signer discovery and signing sessions

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while discovering signers or running a session
#[derive(Debug, Error)]
pub enum Error {
    /// Transport or protocol has not been initialized
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Protocol was initialized twice
    #[error("Already initialized")]
    AlreadyInitialized,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Key is not part of the expected participant set, or was claimed twice
    #[error("Participant mismatch: {0}")]
    ParticipantMismatch(String),

    /// Nonce failed to decode or a participant sent two different nonces
    #[error("Invalid nonce from participant {participant}: {reason}")]
    InvalidNonce { participant: String, reason: String },

    /// Partial signature failed verification
    #[error("Invalid partial signature from participant {participant}: {reason}")]
    InvalidPartialSignature { participant: String, reason: String },

    /// Message or operation for a phase that is not reachable yet (or already passed)
    #[error("Phase order violation: {0}")]
    PhaseOrderViolation(String),

    /// A session with the same participant set and message is already running
    #[error("Duplicate session: {0} is already active for this participant set and message")]
    DuplicateSession(String),

    /// Local nonce was already published for this session
    #[error("Nonce already shared for session {0}")]
    NonceAlreadyShared(String),

    /// Local partial signature was already produced for this session
    #[error("Partial signature already shared for session {0}")]
    PartialSignatureAlreadyShared(String),

    /// Phase deadline exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transport call failed
    #[error("Network error: {0}")]
    Network(String),

    /// Malformed public or private key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Malformed protocol message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error is a cryptographic violation by a participant that
    /// must abort the session it occurred in.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::InvalidNonce { .. } | Error::InvalidPartialSignature { .. }
        )
    }

    /// Participant named by a cryptographic failure, if any
    pub fn offending_participant(&self) -> Option<&str> {
        match self {
            Error::InvalidNonce { participant, .. }
            | Error::InvalidPartialSignature { participant, .. } => Some(participant),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_violation_classification() {
        let bad_sig = Error::InvalidPartialSignature {
            participant: "02aa".into(),
            reason: "verification failed".into(),
        };
        assert!(bad_sig.is_protocol_violation());
        assert_eq!(bad_sig.offending_participant(), Some("02aa"));

        let timeout = Error::Timeout("join phase".into());
        assert!(!timeout.is_protocol_violation());
        assert_eq!(timeout.offending_participant(), None);
    }
}
