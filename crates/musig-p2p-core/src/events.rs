//! Typed protocol events
//!
//! Every lifecycle change is pushed onto a broadcast bus. Subscribers await
//! the next event instead of registering callbacks; a subscriber that falls
//! more than the bus capacity behind observes `RecvError::Lagged`.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{PeerId, PublicKey, SessionId, SignerAdvertisement, SigningRequest};

/// Session and discovery lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProtocolEvent {
    SessionCreated {
        session_id: SessionId,
        is_initiator: bool,
    },
    SessionAnnounced {
        session_id: SessionId,
    },
    ParticipantJoined {
        session_id: SessionId,
        participant: PublicKey,
        peer_id: PeerId,
    },
    /// Every expected participant has joined
    SessionReady {
        session_id: SessionId,
    },
    NonceReceived {
        session_id: SessionId,
        participant: PublicKey,
    },
    NoncesComplete {
        session_id: SessionId,
    },
    PartialSignatureReceived {
        session_id: SessionId,
        participant: PublicKey,
    },
    /// All partial signatures are present and verified
    PartialSignaturesComplete {
        session_id: SessionId,
    },
    SessionComplete {
        session_id: SessionId,
        #[serde(with = "crate::types::hex_serde")]
        signature: Vec<u8>,
    },
    SessionAborted {
        session_id: SessionId,
        reason: String,
        offender: Option<PublicKey>,
    },
    SessionTimeout {
        session_id: SessionId,
        reason: String,
    },
    ParticipantDisconnected {
        session_id: SessionId,
        participant: PublicKey,
        peer_id: PeerId,
    },
    SignerDiscovered {
        advertisement: SignerAdvertisement,
    },
    SignerWithdrawn {
        advertisement_id: String,
    },
    SigningRequestReceived {
        request: SigningRequest,
    },
    SigningRequestWithdrawn {
        request_id: String,
    },
}

impl ProtocolEvent {
    /// Session the event refers to, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionCreated { session_id, .. }
            | Self::SessionAnnounced { session_id }
            | Self::ParticipantJoined { session_id, .. }
            | Self::SessionReady { session_id }
            | Self::NonceReceived { session_id, .. }
            | Self::NoncesComplete { session_id }
            | Self::PartialSignatureReceived { session_id, .. }
            | Self::PartialSignaturesComplete { session_id }
            | Self::SessionComplete { session_id, .. }
            | Self::SessionAborted { session_id, .. }
            | Self::SessionTimeout { session_id, .. }
            | Self::ParticipantDisconnected { session_id, .. } => Some(session_id),
            Self::SignerDiscovered { .. }
            | Self::SignerWithdrawn { .. }
            | Self::SigningRequestReceived { .. }
            | Self::SigningRequestWithdrawn { .. } => None,
        }
    }

    /// Whether the event ends a session
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SessionComplete { .. } | Self::SessionAborted { .. } | Self::SessionTimeout { .. }
        )
    }
}

/// Broadcast bus shared by every component of one protocol instance
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProtocolEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: ProtocolEvent) {
        trace!(?event, "event");
        let _ = self.sender.send(event);
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = ProtocolEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.sender.subscribe()
    }
}
