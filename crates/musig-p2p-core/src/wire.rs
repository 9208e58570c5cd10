//! Wire format of protocol messages
//!
//! Every message is a JSON envelope carrying the protocol version, the
//! session it belongs to (if any), the sender's public key, a per-sender
//! sequence number used for staleness checks, a unix-millisecond timestamp
//! and a payload tagged by `kind`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::musig;
use crate::types::{
    hex_serde, PeerId, PublicKey, SessionId, SessionMetadata, SignerAdvertisement, SigningRequest,
};
use crate::{Error, Result};

/// Envelope version understood by this build
pub const PROTOCOL_VERSION: u8 = 1;

/// Topic carrying signer advertisements, signing requests and their withdrawals
pub const DISCOVERY_TOPIC: &str = "musig2/discovery/v1";

/// Topic carrying session announcements
pub const ANNOUNCEMENT_TOPIC: &str = "musig2/announcements/v1";

/// Resource type of signer advertisements
pub const SIGNER_RESOURCE: &str = "musig2-signer";

/// Resource type of session descriptors
pub const SESSION_RESOURCE: &str = "musig2-session";

/// Resource type of signing requests
pub const REQUEST_RESOURCE: &str = "musig2-request";

/// Topic a session's join, nonce, partial-signature and abort messages travel on
pub fn session_topic(session_id: &str) -> String {
    format!("musig2/session/{}", session_id)
}

/// Session descriptor published when a session is announced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAnnouncement {
    pub session_id: SessionId,
    pub initiator: PublicKey,
    pub initiator_peer: PeerId,
    /// Initiator key's binding of `initiator_peer` to this session
    #[serde(with = "hex_serde")]
    pub initiator_proof: Vec<u8>,
    /// Sorted participant set, initiator included
    pub participants: Vec<PublicKey>,
    #[serde(with = "hex_serde")]
    pub message: Vec<u8>,
    #[serde(default)]
    pub metadata: SessionMetadata,
    pub created_at: DateTime<Utc>,
}

impl SessionAnnouncement {
    pub fn is_well_formed(&self) -> bool {
        let sorted = self.participants.windows(2).all(|w| w[0] < w[1]);
        !self.session_id.is_empty()
            && self.participants.len() >= 2
            && sorted
            && self.participants.binary_search(&self.initiator).is_ok()
            && self.metadata.is_supported()
    }

    /// Whether `peer` is the initiator's proven peer
    pub fn is_bound_to(&self, peer: &str) -> bool {
        self.initiator_peer == peer
            && musig::verify_peer_binding(
                &self.initiator,
                &self.session_id,
                &self.initiator_peer,
                &self.initiator_proof,
            )
    }
}

/// Kind-specific message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum MessagePayload {
    Advertisement(SignerAdvertisement),
    Withdrawal {
        advertisement_id: String,
    },
    SigningRequest(SigningRequest),
    RequestWithdrawal {
        request_id: String,
    },
    SessionAnnouncement(SessionAnnouncement),
    Join {
        peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
        /// Sender key's binding of `peer_id` to the session
        #[serde(with = "hex_serde")]
        proof: Vec<u8>,
    },
    Nonce {
        #[serde(with = "hex_serde")]
        nonce: Vec<u8>,
    },
    PartialSignature {
        #[serde(with = "hex_serde")]
        partial_signature: Vec<u8>,
    },
    Abort {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offender: Option<PublicKey>,
    },
}

impl MessagePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Advertisement(_) => "advertisement",
            Self::Withdrawal { .. } => "withdrawal",
            Self::SigningRequest(_) => "signing_request",
            Self::RequestWithdrawal { .. } => "request_withdrawal",
            Self::SessionAnnouncement(_) => "session_announcement",
            Self::Join { .. } => "join",
            Self::Nonce { .. } => "nonce",
            Self::PartialSignature { .. } => "partial_signature",
            Self::Abort { .. } => "abort",
        }
    }

    /// Whether the payload must carry a session id
    pub fn is_session_scoped(&self) -> bool {
        matches!(
            self,
            Self::SessionAnnouncement(_)
                | Self::Join { .. }
                | Self::Nonce { .. }
                | Self::PartialSignature { .. }
                | Self::Abort { .. }
        )
    }
}

/// Message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub sender: PublicKey,
    pub sequence: u64,
    /// Unix milliseconds
    pub timestamp: i64,
    pub payload: MessagePayload,
}

impl ProtocolMessage {
    pub fn new(
        session_id: Option<SessionId>,
        sender: PublicKey,
        sequence: u64,
        payload: MessagePayload,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            session_id,
            sender,
            sequence,
            timestamp: Utc::now().timestamp_millis(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode and structurally validate an inbound message
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let message: Self = serde_json::from_slice(bytes)
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(Error::InvalidMessage(format!(
                "unsupported protocol version {}",
                self.version
            )));
        }

        let kind = self.payload.kind();
        match (&self.session_id, self.payload.is_session_scoped()) {
            (None, true) => {
                return Err(Error::InvalidMessage(format!(
                    "{} message without session id",
                    kind
                )))
            }
            (Some(_), false) => {
                return Err(Error::InvalidMessage(format!(
                    "{} message must not carry a session id",
                    kind
                )))
            }
            _ => {}
        }

        if let MessagePayload::SessionAnnouncement(announcement) = &self.payload {
            if self.session_id.as_deref() != Some(announcement.session_id.as_str()) {
                return Err(Error::InvalidMessage(
                    "announcement session id does not match envelope".into(),
                ));
            }
            if announcement.initiator != self.sender {
                return Err(Error::InvalidMessage(
                    "announcement not sent by its initiator".into(),
                ));
            }
        }

        Ok(())
    }

    /// Whether the timestamp lies within `[now - max_age, now + max_skew]`
    pub fn is_fresh(&self, now_ms: i64, max_age: Duration, max_skew: Duration) -> bool {
        let age = now_ms.saturating_sub(self.timestamp);
        let max_age = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let max_skew = i64::try_from(max_skew.as_millis()).unwrap_or(i64::MAX);
        age <= max_age && -age <= max_skew
    }
}

/// Source of per-sender sequence numbers.
///
/// Values follow wall-clock milliseconds but never repeat or go backwards,
/// so restarts do not collide with sequences a peer has already seen.
#[derive(Debug, Default)]
pub struct SequenceClock {
    last: AtomicU64,
}

impl SequenceClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }
}
