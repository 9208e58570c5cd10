//! Signing session state machine
//!
//! A [`SessionRecord`] holds everything one node knows about one session and
//! applies local operations and inbound messages to it synchronously. It
//! performs no I/O: each mutation reports the events to emit and the
//! messages to send through [`SessionEffects`], which the coordinator
//! delivers after the session lock is released.
//!
//! ```text
//! created -> announced -> joining -> nonce_exchange -> signing -> complete
//!                 (any non-terminal phase) -> aborted | timeout
//! ```

use chrono::{DateTime, Utc};
use musig2::{AggNonce, KeyAggContext, PubNonce, SecNonce};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ProtocolConfig;
use crate::events::ProtocolEvent;
use crate::musig::{self, PartialSignature};
use crate::types::{
    hex_serde, hex_serde_opt, PeerId, PrivateKey, PublicKey, SessionId, SessionMetadata,
};
use crate::wire::{MessagePayload, SessionAnnouncement};
use crate::{Error, Result};

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Announced,
    Joining,
    NonceExchange,
    Signing,
    Complete,
    Aborted,
    Timeout,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted | Self::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Announced => "announced",
            Self::Joining => "joining",
            Self::NonceExchange => "nonce_exchange",
            Self::Signing => "signing",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
            Self::Timeout => "timeout",
        }
    }

    /// Phase name used in timeout reasons
    fn phase(&self) -> &'static str {
        match self {
            Self::Created | Self::Announced | Self::Joining => "join",
            Self::NonceExchange => "nonce",
            Self::Signing => "signing",
            _ => "terminal",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One expected participant as seen by this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParticipant {
    pub public_key: PublicKey,
    pub peer_id: Option<PeerId>,
    pub nickname: Option<String>,
    pub joined: bool,
    pub has_nonce: bool,
    pub has_partial_signature: bool,
    /// Peer disconnected after joining
    pub left: bool,
}

/// Read-only snapshot of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningSession {
    pub session_id: SessionId,
    pub state: SessionState,
    pub is_initiator: bool,
    pub initiator: PublicKey,
    pub local_key: PublicKey,
    #[serde(with = "hex_serde")]
    pub message: Vec<u8>,
    /// Sorted by compressed key
    pub participants: Vec<SessionParticipant>,
    pub aggregated_key: PublicKey,
    pub metadata: SessionMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Our public nonce, once generated
    #[serde(default, with = "hex_serde_opt")]
    pub local_nonce: Option<Vec<u8>>,
    #[serde(default, with = "hex_serde_opt")]
    pub final_signature: Option<Vec<u8>>,
    pub failure_reason: Option<String>,
    pub offending_participant: Option<PublicKey>,
}

impl SigningSession {
    pub fn participant_keys(&self) -> Vec<PublicKey> {
        self.participants.iter().map(|p| p.public_key).collect()
    }

    pub fn participant(&self, key: &PublicKey) -> Option<&SessionParticipant> {
        self.participants.iter().find(|p| &p.public_key == key)
    }

    pub fn joined_count(&self) -> usize {
        self.participants.iter().filter(|p| p.joined).count()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Message produced by a state transition
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outbound {
    /// Publish on the session topic
    Session(MessagePayload),
    /// Send to one peer
    Direct { peer: PeerId, payload: MessagePayload },
}

/// Events and messages produced while the session lock was held
#[derive(Debug, Default)]
pub(crate) struct SessionEffects {
    pub events: Vec<ProtocolEvent>,
    pub outbound: Vec<Outbound>,
}

impl SessionEffects {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Per-session copy of the timing and finalization settings
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionPolicy {
    pub join_timeout: Duration,
    pub nonce_timeout: Duration,
    pub signing_timeout: Duration,
    pub auto_finalize: bool,
    pub max_participants: usize,
}

impl From<&ProtocolConfig> for SessionPolicy {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            join_timeout: config.join_timeout(),
            nonce_timeout: config.nonce_timeout(),
            signing_timeout: config.signing_timeout(),
            auto_finalize: config.auto_finalize,
            max_participants: config.max_participants,
        }
    }
}

/// Identity of a session's content: the sorted key set and the message
pub type Fingerprint = [u8; 32];

pub fn session_fingerprint(sorted_keys: &[PublicKey], message: &[u8]) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"musig2-p2p/session-fingerprint/v1");
    hasher.update(&(sorted_keys.len() as u32).to_be_bytes());
    for key in sorted_keys {
        hasher.update(key.as_bytes());
    }
    hasher.update(&(message.len() as u64).to_be_bytes());
    hasher.update(message);
    *hasher.finalize().as_bytes()
}

#[derive(Debug, Default)]
struct Slot {
    peer_id: Option<PeerId>,
    nickname: Option<String>,
    joined: bool,
    left: bool,
}

struct StoredNonce {
    nonce: PubNonce,
    bytes: Vec<u8>,
}

struct StoredPartial {
    partial: PartialSignature,
    bytes: Vec<u8>,
}

/// Messages from a participant that has not joined yet, by source peer
type Held<T> = BTreeMap<PublicKey, BTreeMap<PeerId, T>>;

/// Distinct peers whose unjoined messages are held for one key
const MAX_HELD_PEERS: usize = 4;

fn hold<T>(held: &mut Held<T>, sender: PublicKey, from: &PeerId, item: T) -> Result<()> {
    let by_peer = held.entry(sender).or_default();
    if by_peer.len() >= MAX_HELD_PEERS && !by_peer.contains_key(from) {
        return Err(Error::InvalidMessage(format!(
            "too many unjoined peers claim {}",
            sender.short()
        )));
    }
    by_peer.insert(from.clone(), item);
    Ok(())
}

/// Mutable state of one session; owned by the store
pub(crate) struct SessionRecord {
    id: SessionId,
    state: SessionState,
    is_initiator: bool,
    initiator: PublicKey,
    local_key: PublicKey,
    /// Our key's binding of our peer id to this session, once joined
    local_proof: Option<Vec<u8>>,
    message: Vec<u8>,
    metadata: SessionMetadata,
    sorted_keys: Vec<PublicKey>,
    slots: BTreeMap<PublicKey, Slot>,
    key_agg: KeyAggContext,
    aggregated_key: PublicKey,
    fingerprint: Fingerprint,
    policy: SessionPolicy,

    sec_nonce: Option<SecNonce>,
    local_nonce: Option<StoredNonce>,
    nonce_shared: bool,
    partial_shared: bool,
    nonces: BTreeMap<PublicKey, StoredNonce>,
    /// Nonces from participants that have not joined yet
    pending_nonces: Held<StoredNonce>,
    agg_nonce: Option<AggNonce>,
    /// Verified partial signatures
    partials: BTreeMap<PublicKey, StoredPartial>,
    /// Partial signatures that arrived before the nonce round completed
    pending_partials: Held<StoredPartial>,

    final_signature: Option<Vec<u8>>,
    failure_reason: Option<String>,
    offender: Option<PublicKey>,
    last_sequence: HashMap<PublicKey, u64>,

    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    phase_deadline: Instant,
    terminated_at: Option<Instant>,
}

impl SessionRecord {
    /// New session initiated by this node. The initiator is implicitly joined
    /// and its nonce is generated here, while the private key is at hand.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_local(
        session_id: SessionId,
        private_key: &PrivateKey,
        local_peer: PeerId,
        nickname: Option<String>,
        participants: &[PublicKey],
        message: Vec<u8>,
        metadata: SessionMetadata,
        policy: SessionPolicy,
    ) -> Result<Self> {
        let local_key = private_key.public_key();
        let mut keys = participants.to_vec();
        if !keys.contains(&local_key) {
            keys.push(local_key);
        }
        let proof = musig::peer_binding_proof(private_key, &session_id, &local_peer)?;

        let mut record = Self::build(
            session_id,
            true,
            local_key,
            local_key,
            keys,
            message,
            metadata,
            Utc::now(),
            policy,
        )?;

        let (sec_nonce, pub_nonce) =
            musig::generate_nonce(private_key, &record.key_agg, &record.message)?;
        record.sec_nonce = Some(sec_nonce);
        record.local_nonce = Some(StoredNonce {
            bytes: musig::encode_pub_nonce(&pub_nonce),
            nonce: pub_nonce,
        });
        record.local_proof = Some(proof);

        if let Some(slot) = record.slots.get_mut(&local_key) {
            slot.joined = true;
            slot.peer_id = Some(local_peer);
            slot.nickname = nickname;
        }

        Ok(record)
    }

    /// Session learned from another node's announcement, tracked on behalf
    /// of `local_key` until the local participant joins
    pub(crate) fn from_announcement(
        announcement: &SessionAnnouncement,
        local_key: PublicKey,
        policy: SessionPolicy,
    ) -> Result<Self> {
        if !announcement.is_well_formed() {
            return Err(Error::InvalidMessage(format!(
                "malformed announcement for session {}",
                announcement.session_id
            )));
        }
        if local_key == announcement.initiator {
            return Err(Error::ParticipantMismatch(
                "announcement claims our key as initiator".into(),
            ));
        }
        if !announcement.is_bound_to(&announcement.initiator_peer) {
            return Err(Error::InvalidMessage(format!(
                "announcement for session {} carries no valid initiator peer binding",
                announcement.session_id
            )));
        }

        let mut record = Self::build(
            announcement.session_id.clone(),
            false,
            announcement.initiator,
            local_key,
            announcement.participants.clone(),
            announcement.message.clone(),
            announcement.metadata.clone(),
            announcement.created_at,
            policy,
        )?;
        record.state = SessionState::Announced;

        if let Some(slot) = record.slots.get_mut(&announcement.initiator) {
            slot.joined = true;
            slot.peer_id = Some(announcement.initiator_peer.clone());
        }

        Ok(record)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: SessionId,
        is_initiator: bool,
        initiator: PublicKey,
        local_key: PublicKey,
        keys: Vec<PublicKey>,
        message: Vec<u8>,
        metadata: SessionMetadata,
        created_at: DateTime<Utc>,
        policy: SessionPolicy,
    ) -> Result<Self> {
        if message.is_empty() {
            return Err(Error::InvalidMessage("message to sign is empty".into()));
        }
        if !metadata.is_supported() {
            return Err(Error::InvalidMessage(format!(
                "unsupported metadata version {}",
                metadata.version
            )));
        }

        if keys.len() > policy.max_participants {
            return Err(Error::ParticipantMismatch(format!(
                "{} participants exceed the limit of {}",
                keys.len(),
                policy.max_participants
            )));
        }

        let sorted_keys = musig::sort_public_keys(&keys)?;
        if sorted_keys.binary_search(&local_key).is_err() {
            return Err(Error::ParticipantMismatch(format!(
                "local key {} is not a participant",
                local_key.short()
            )));
        }

        let key_agg = musig::key_agg_context(&sorted_keys)?;
        let aggregated_key = musig::aggregated_key(&key_agg)?;
        let fingerprint = session_fingerprint(&sorted_keys, &message);
        let slots = sorted_keys.iter().map(|k| (*k, Slot::default())).collect();

        Ok(Self {
            id,
            state: SessionState::Created,
            is_initiator,
            initiator,
            local_key,
            local_proof: None,
            message,
            metadata,
            sorted_keys,
            slots,
            key_agg,
            aggregated_key,
            fingerprint,
            policy,
            sec_nonce: None,
            local_nonce: None,
            nonce_shared: false,
            partial_shared: false,
            nonces: BTreeMap::new(),
            pending_nonces: BTreeMap::new(),
            agg_nonce: None,
            partials: BTreeMap::new(),
            pending_partials: BTreeMap::new(),
            final_signature: None,
            failure_reason: None,
            offender: None,
            last_sequence: HashMap::new(),
            created_at,
            updated_at: Utc::now(),
            phase_deadline: Instant::now() + policy.join_timeout,
            terminated_at: None,
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub(crate) fn local_key(&self) -> PublicKey {
        self.local_key
    }

    pub(crate) fn is_participant(&self, key: &PublicKey) -> bool {
        self.slots.contains_key(key)
    }

    pub(crate) fn terminated_at(&self) -> Option<Instant> {
        self.terminated_at
    }

    pub(crate) fn local_joined(&self) -> bool {
        self.slots
            .get(&self.local_key)
            .map(|s| s.joined)
            .unwrap_or(false)
    }

    /// Descriptor other nodes need to join; only the initiator announces
    pub(crate) fn announcement(&self) -> Result<SessionAnnouncement> {
        if !self.is_initiator {
            return Err(Error::PhaseOrderViolation(format!(
                "only the initiator announces session {}",
                self.id
            )));
        }
        let initiator_peer = self
            .slots
            .get(&self.initiator)
            .and_then(|s| s.peer_id.clone())
            .ok_or_else(|| Error::Internal("initiator has no peer id".into()))?;
        let initiator_proof = self
            .local_proof
            .clone()
            .ok_or_else(|| Error::Internal("initiator has no peer binding".into()))?;

        Ok(SessionAnnouncement {
            session_id: self.id.clone(),
            initiator: self.initiator,
            initiator_peer,
            initiator_proof,
            participants: self.sorted_keys.clone(),
            message: self.message.clone(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
        })
    }

    pub(crate) fn snapshot(&self) -> SigningSession {
        let participants = self
            .sorted_keys
            .iter()
            .map(|key| {
                let slot = self.slots.get(key);
                SessionParticipant {
                    public_key: *key,
                    peer_id: slot.and_then(|s| s.peer_id.clone()),
                    nickname: slot.and_then(|s| s.nickname.clone()),
                    joined: slot.map(|s| s.joined).unwrap_or(false),
                    has_nonce: self.nonces.contains_key(key),
                    has_partial_signature: self.partials.contains_key(key),
                    left: slot.map(|s| s.left).unwrap_or(false),
                }
            })
            .collect();

        SigningSession {
            session_id: self.id.clone(),
            state: self.state,
            is_initiator: self.is_initiator,
            initiator: self.initiator,
            local_key: self.local_key,
            message: self.message.clone(),
            participants,
            aggregated_key: self.aggregated_key,
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            local_nonce: self.local_nonce.as_ref().map(|n| n.bytes.clone()),
            final_signature: self.final_signature.clone(),
            failure_reason: self.failure_reason.clone(),
            offending_participant: self.offender,
        }
    }

    /// Record a sender's sequence number. Returns false for a stale message.
    fn accept_sequence(&mut self, sender: &PublicKey, sequence: u64) -> bool {
        let last = self.last_sequence.entry(*sender).or_insert(0);
        if sequence < *last {
            return false;
        }
        *last = sequence;
        true
    }

    pub(crate) fn mark_announced(&mut self) -> Result<()> {
        self.ensure_active()?;
        if !self.is_initiator {
            return Err(Error::PhaseOrderViolation(format!(
                "only the initiator announces session {}",
                self.id
            )));
        }
        if self.state == SessionState::Created {
            self.state = SessionState::Announced;
            self.touch();
        }
        Ok(())
    }

    /// Local participant accepts the session. Returns false when it had
    /// already joined from this peer.
    pub(crate) fn join_local(
        &mut self,
        private_key: &PrivateKey,
        local_peer: &PeerId,
        nickname: Option<String>,
        fx: &mut SessionEffects,
    ) -> Result<bool> {
        self.ensure_active()?;

        let key = private_key.public_key();
        if !self.is_participant(&key) {
            return Err(Error::ParticipantMismatch(format!(
                "{} is not a participant of session {}",
                key.short(),
                self.id
            )));
        }
        if key != self.local_key {
            if self.local_joined() {
                return Err(Error::ParticipantMismatch(format!(
                    "session {} already joined with key {}",
                    self.id,
                    self.local_key.short()
                )));
            }
            self.local_key = key;
        }

        if let Some(slot) = self.slots.get(&key) {
            if slot.joined {
                return if slot.peer_id.as_ref() == Some(local_peer) {
                    Ok(false)
                } else {
                    Err(Error::ParticipantMismatch(format!(
                        "key {} already joined from another peer",
                        key.short()
                    )))
                };
            }
        }

        let proof = musig::peer_binding_proof(private_key, &self.id, local_peer)?;
        let (sec_nonce, pub_nonce) = musig::generate_nonce(private_key, &self.key_agg, &self.message)?;
        self.sec_nonce = Some(sec_nonce);
        self.local_proof = Some(proof.clone());
        self.local_nonce = Some(StoredNonce {
            bytes: musig::encode_pub_nonce(&pub_nonce),
            nonce: pub_nonce,
        });

        if let Some(slot) = self.slots.get_mut(&key) {
            slot.joined = true;
            slot.left = false;
            slot.peer_id = Some(local_peer.clone());
            slot.nickname = nickname.clone();
        }

        fx.events.push(ProtocolEvent::ParticipantJoined {
            session_id: self.id.clone(),
            participant: key,
            peer_id: local_peer.clone(),
        });
        fx.outbound.push(Outbound::Session(MessagePayload::Join {
            peer_id: local_peer.clone(),
            nickname,
            proof,
        }));

        if matches!(self.state, SessionState::Created | SessionState::Announced) {
            self.state = SessionState::Joining;
        }
        self.touch();
        self.advance(fx);
        Ok(true)
    }

    /// Apply a session-scoped message that peer `from` sent under `sender`.
    ///
    /// Messages for a terminated session are ignored. A message the peer
    /// cannot speak for is rejected without touching the session. Protocol
    /// violations by an authenticated sender abort the session before the
    /// error is returned.
    pub(crate) fn handle(
        &mut self,
        from: &PeerId,
        sender: PublicKey,
        sequence: u64,
        payload: &MessagePayload,
        fx: &mut SessionEffects,
    ) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        let proven = self.authenticate(from, &sender, payload)?;
        if proven && !self.accept_sequence(&sender, sequence) {
            debug!(session_id = %self.id, participant = %sender.short(), sequence, "stale message");
            return Ok(());
        }

        match payload {
            MessagePayload::Join { nickname, .. } => {
                self.on_join(sender, from, nickname.clone(), fx)
            }
            MessagePayload::Nonce { nonce } => self.on_nonce(from, sender, nonce, fx),
            MessagePayload::PartialSignature { partial_signature } => {
                self.on_partial(from, sender, partial_signature, fx)
            }
            MessagePayload::Abort { reason, offender } => {
                self.on_abort(sender, reason, *offender, fx);
                Ok(())
            }
            other => Err(Error::InvalidMessage(format!(
                "{} is not a session message",
                other.kind()
            ))),
        }
    }

    /// Check that `from` may speak for `sender`.
    ///
    /// Returns true when the peer is proven: a join carrying a valid peer
    /// binding, or the peer the sender's slot is already bound to. Nonces and
    /// partial signatures for a participant that has not joined are unproven
    /// and only held.
    fn authenticate(
        &self,
        from: &PeerId,
        sender: &PublicKey,
        payload: &MessagePayload,
    ) -> Result<bool> {
        let Some(slot) = self.slots.get(sender) else {
            return Err(Error::ParticipantMismatch(format!(
                "{} is not a participant of session {}",
                sender.short(),
                self.id
            )));
        };
        if *sender == self.local_key {
            return Err(Error::ParticipantMismatch(format!(
                "peer {} sent a message under our key {}",
                from,
                sender.short()
            )));
        }

        match (payload, &slot.peer_id) {
            (MessagePayload::Join { peer_id, proof, .. }, _) => {
                if peer_id != from || !musig::verify_peer_binding(sender, &self.id, peer_id, proof) {
                    return Err(Error::InvalidMessage(format!(
                        "join for {} from peer {} carries no valid peer binding",
                        sender.short(),
                        from
                    )));
                }
                Ok(true)
            }
            (_, Some(bound)) if bound == from => Ok(true),
            (_, Some(bound)) => Err(Error::ParticipantMismatch(format!(
                "{} is bound to peer {}, not {}",
                sender.short(),
                bound,
                from
            ))),
            (MessagePayload::Nonce { .. } | MessagePayload::PartialSignature { .. }, None) => {
                Ok(false)
            }
            (_, None) => Err(Error::ParticipantMismatch(format!(
                "{} has not joined session {}",
                sender.short(),
                self.id
            ))),
        }
    }

    fn on_join(
        &mut self,
        sender: PublicKey,
        peer_id: &PeerId,
        nickname: Option<String>,
        fx: &mut SessionEffects,
    ) -> Result<()> {
        let Some(slot) = self.slots.get_mut(&sender) else {
            return Ok(());
        };

        if slot.joined {
            if slot.peer_id.as_ref() == Some(peer_id) {
                // Retransmission or roster reply
                slot.left = false;
                return Ok(());
            }
            let err = Error::ParticipantMismatch(format!(
                "{} joined from peer {} but is already bound to another peer",
                sender.short(),
                peer_id
            ));
            return Err(self.fail(err, fx));
        }

        slot.joined = true;
        slot.left = false;
        slot.peer_id = Some(peer_id.clone());
        slot.nickname = nickname;

        fx.events.push(ProtocolEvent::ParticipantJoined {
            session_id: self.id.clone(),
            participant: sender,
            peer_id: peer_id.clone(),
        });

        // Tell the newcomer who we are; it may have missed our join
        if self.local_joined() {
            if let (Some(local), Some(proof)) =
                (self.slots.get(&self.local_key), self.local_proof.as_ref())
            {
                if let Some(local_peer) = local.peer_id.clone() {
                    fx.outbound.push(Outbound::Direct {
                        peer: peer_id.clone(),
                        payload: MessagePayload::Join {
                            peer_id: local_peer,
                            nickname: local.nickname.clone(),
                            proof: proof.clone(),
                        },
                    });
                }
            }
        }

        // Only what the joining peer sent survives; the rest was unattributed
        let held_nonce = self
            .pending_nonces
            .remove(&sender)
            .and_then(|mut by_peer| by_peer.remove(peer_id));
        if let Some(stored) = held_nonce {
            self.nonces.insert(sender, stored);
            fx.events.push(ProtocolEvent::NonceReceived {
                session_id: self.id.clone(),
                participant: sender,
            });
        }
        if let Some(by_peer) = self.pending_partials.get_mut(&sender) {
            by_peer.retain(|peer, _| peer == peer_id);
        }

        if matches!(self.state, SessionState::Created | SessionState::Announced) {
            self.state = SessionState::Joining;
        }
        self.touch();
        self.advance(fx);
        Ok(())
    }

    fn on_nonce(
        &mut self,
        from: &PeerId,
        sender: PublicKey,
        bytes: &[u8],
        fx: &mut SessionEffects,
    ) -> Result<()> {
        let joined = self.slots.get(&sender).map(|s| s.joined).unwrap_or(false);

        let nonce = match musig::decode_pub_nonce(bytes) {
            Ok(nonce) => nonce,
            Err(e) if !joined => {
                return Err(Error::InvalidMessage(format!(
                    "nonce for unjoined {} from peer {}: {}",
                    sender.short(),
                    from,
                    e
                )))
            }
            Err(e) => {
                let err = Error::InvalidNonce {
                    participant: sender.to_hex(),
                    reason: e.to_string(),
                };
                return Err(self.fail(err, fx));
            }
        };

        let known = if joined {
            self.nonces.get(&sender)
        } else {
            self.pending_nonces.get(&sender).and_then(|by_peer| by_peer.get(from))
        };
        if let Some(existing) = known {
            if existing.bytes == bytes {
                return Ok(());
            }
            if !joined {
                return Err(Error::InvalidMessage(format!(
                    "peer {} sent two nonces for unjoined {}",
                    from,
                    sender.short()
                )));
            }
            let err = Error::InvalidNonce {
                participant: sender.to_hex(),
                reason: "sent two different nonces".into(),
            };
            return Err(self.fail(err, fx));
        }

        let stored = StoredNonce {
            nonce,
            bytes: bytes.to_vec(),
        };
        if !joined {
            // Held until the sender's join arrives from the same peer
            return hold(&mut self.pending_nonces, sender, from, stored);
        }

        self.nonces.insert(sender, stored);
        fx.events.push(ProtocolEvent::NonceReceived {
            session_id: self.id.clone(),
            participant: sender,
        });
        self.touch();
        self.advance(fx);
        Ok(())
    }

    fn on_partial(
        &mut self,
        from: &PeerId,
        sender: PublicKey,
        bytes: &[u8],
        fx: &mut SessionEffects,
    ) -> Result<()> {
        let joined = self.slots.get(&sender).map(|s| s.joined).unwrap_or(false);

        let partial = match musig::decode_partial_signature(bytes) {
            Ok(partial) => partial,
            Err(e) if !joined => {
                return Err(Error::InvalidMessage(format!(
                    "partial signature for unjoined {} from peer {}: {}",
                    sender.short(),
                    from,
                    e
                )))
            }
            Err(e) => {
                let err = Error::InvalidPartialSignature {
                    participant: sender.to_hex(),
                    reason: e.to_string(),
                };
                return Err(self.fail(err, fx));
            }
        };

        let known = self.partials.get(&sender).or_else(|| {
            self.pending_partials
                .get(&sender)
                .and_then(|by_peer| by_peer.get(from))
        });
        if let Some(existing) = known {
            if existing.bytes == bytes {
                return Ok(());
            }
            if !joined {
                return Err(Error::InvalidMessage(format!(
                    "peer {} sent two partial signatures for unjoined {}",
                    from,
                    sender.short()
                )));
            }
            let err = Error::InvalidPartialSignature {
                participant: sender.to_hex(),
                reason: "sent two different partial signatures".into(),
            };
            return Err(self.fail(err, fx));
        }

        let stored = StoredPartial {
            partial,
            bytes: bytes.to_vec(),
        };
        if !joined || self.state != SessionState::Signing {
            // Verified once the nonce round completes
            return hold(&mut self.pending_partials, sender, from, stored);
        }

        match self.verify_and_record(sender, stored, fx) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err, fx)),
        }
    }

    fn on_abort(
        &mut self,
        sender: PublicKey,
        reason: &str,
        offender: Option<PublicKey>,
        fx: &mut SessionEffects,
    ) {
        let reason = format!("aborted by {}: {}", sender.short(), reason);
        self.terminate(SessionState::Aborted, reason.clone(), offender);
        fx.events.push(ProtocolEvent::SessionAborted {
            session_id: self.id.clone(),
            reason,
            offender,
        });
    }

    /// Publish our nonce. Allowed once, after every participant has joined.
    pub(crate) fn share_nonce(&mut self, fx: &mut SessionEffects) -> Result<()> {
        self.ensure_active()?;
        if self.nonce_shared {
            return Err(Error::NonceAlreadyShared(self.id.clone()));
        }
        let own = match &self.local_nonce {
            Some(own) if self.local_joined() => StoredNonce {
                nonce: own.nonce.clone(),
                bytes: own.bytes.clone(),
            },
            _ => {
                return Err(Error::PhaseOrderViolation(format!(
                    "local participant has not joined session {}",
                    self.id
                )))
            }
        };
        if self.state != SessionState::NonceExchange {
            return Err(Error::PhaseOrderViolation(format!(
                "session {} is {}; waiting for {}",
                self.id,
                self.state,
                describe_missing(&self.missing_joins())
            )));
        }

        fx.outbound.push(Outbound::Session(MessagePayload::Nonce {
            nonce: own.bytes.clone(),
        }));
        self.nonces.insert(self.local_key, own);
        self.nonce_shared = true;
        fx.events.push(ProtocolEvent::NonceReceived {
            session_id: self.id.clone(),
            participant: self.local_key,
        });
        self.touch();
        self.advance(fx);
        Ok(())
    }

    /// Sign with the session nonce and publish the partial signature.
    /// The secret nonce is consumed, so this succeeds at most once.
    pub(crate) fn share_partial(
        &mut self,
        private_key: &PrivateKey,
        fx: &mut SessionEffects,
    ) -> Result<()> {
        self.ensure_active()?;
        if self.partial_shared {
            return Err(Error::PartialSignatureAlreadyShared(self.id.clone()));
        }
        if private_key.public_key() != self.local_key {
            return Err(Error::ParticipantMismatch(format!(
                "session {} was joined with key {}",
                self.id,
                self.local_key.short()
            )));
        }
        if self.state != SessionState::Signing {
            return Err(Error::PhaseOrderViolation(format!(
                "session {} is {}; waiting for nonces from {}",
                self.id,
                self.state,
                describe_missing(&self.missing_nonces())
            )));
        }
        let agg_nonce = self
            .agg_nonce
            .clone()
            .ok_or_else(|| Error::Internal("signing without aggregated nonce".into()))?;
        let sec_nonce = self
            .sec_nonce
            .take()
            .ok_or_else(|| Error::PartialSignatureAlreadyShared(self.id.clone()))?;

        let partial =
            musig::sign_partial(private_key, sec_nonce, &self.key_agg, &agg_nonce, &self.message)?;
        let bytes = musig::encode_partial_signature(&partial);
        self.partial_shared = true;

        fx.outbound.push(Outbound::Session(MessagePayload::PartialSignature {
            partial_signature: bytes.clone(),
        }));

        let own = self.local_key;
        if let Err(err) = self.verify_and_record(own, StoredPartial { partial, bytes }, fx) {
            return Err(self.fail(err, fx));
        }
        Ok(())
    }

    /// All partial signatures present and verified
    pub(crate) fn can_finalize(&self) -> bool {
        matches!(self.state, SessionState::Signing | SessionState::Complete)
            && self.partials.len() == self.sorted_keys.len()
    }

    /// Aggregate the final signature; later calls return the cached result
    pub(crate) fn finalize(&mut self, fx: &mut SessionEffects) -> Result<Vec<u8>> {
        if self.state == SessionState::Complete {
            if let Some(signature) = &self.final_signature {
                return Ok(signature.clone());
            }
        }
        self.ensure_active()?;
        if !self.can_finalize() {
            let missing: Vec<PublicKey> = self
                .sorted_keys
                .iter()
                .filter(|k| !self.partials.contains_key(k))
                .copied()
                .collect();
            return Err(Error::PhaseOrderViolation(format!(
                "session {} is {}; missing partial signatures from {}",
                self.id,
                self.state,
                describe_missing(&missing)
            )));
        }

        let agg_nonce = self
            .agg_nonce
            .clone()
            .ok_or_else(|| Error::Internal("finalizing without aggregated nonce".into()))?;
        let partials: Vec<PartialSignature> = self
            .sorted_keys
            .iter()
            .filter_map(|k| self.partials.get(k))
            .map(|p| p.partial)
            .collect();

        let signature =
            match musig::aggregate_signatures(&self.key_agg, &agg_nonce, &partials, &self.message)
            {
                Ok(signature) => signature.to_vec(),
                Err(err) => return Err(self.fail(err, fx)),
            };
        if !musig::verify_signature(&self.aggregated_key, &signature, &self.message) {
            let err = Error::Crypto("aggregated signature does not verify".into());
            return Err(self.fail(err, fx));
        }

        self.final_signature = Some(signature.clone());
        self.state = SessionState::Complete;
        self.terminated_at = Some(Instant::now());
        self.touch();
        fx.events.push(ProtocolEvent::SessionComplete {
            session_id: self.id.clone(),
            signature: signature.clone(),
        });
        Ok(signature)
    }

    /// Cancel the session locally and notify the other participants.
    /// Returns false when the session had already terminated.
    pub(crate) fn abort_local(&mut self, reason: &str, fx: &mut SessionEffects) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.terminate(SessionState::Aborted, reason.to_string(), None);
        fx.events.push(ProtocolEvent::SessionAborted {
            session_id: self.id.clone(),
            reason: reason.to_string(),
            offender: None,
        });
        self.notify_abort(reason.to_string(), None, fx);
        true
    }

    /// Expire the current phase if its deadline has passed
    pub(crate) fn check_timeout(&mut self, now: Instant, fx: &mut SessionEffects) -> bool {
        if self.state.is_terminal() || now < self.phase_deadline {
            return false;
        }

        let missing = match self.state {
            SessionState::NonceExchange => self.missing_nonces(),
            SessionState::Signing => self
                .sorted_keys
                .iter()
                .filter(|k| !self.partials.contains_key(k))
                .copied()
                .collect(),
            _ => self.missing_joins(),
        };
        let reason = format!(
            "{} phase timed out waiting for {}",
            self.state.phase(),
            describe_missing(&missing)
        );

        self.terminate(SessionState::Timeout, reason.clone(), None);
        fx.events.push(ProtocolEvent::SessionTimeout {
            session_id: self.id.clone(),
            reason,
        });
        true
    }

    /// Mark the participant reachable through `peer` as gone
    pub(crate) fn on_peer_disconnected(&mut self, peer: &PeerId, fx: &mut SessionEffects) {
        if self.state.is_terminal() {
            return;
        }
        for (key, slot) in self.slots.iter_mut() {
            if *key == self.local_key || !slot.joined || slot.left {
                continue;
            }
            if slot.peer_id.as_ref() == Some(peer) {
                slot.left = true;
                fx.events.push(ProtocolEvent::ParticipantDisconnected {
                    session_id: self.id.clone(),
                    participant: *key,
                    peer_id: peer.clone(),
                });
            }
        }
    }

    fn verify_and_record(
        &mut self,
        sender: PublicKey,
        stored: StoredPartial,
        fx: &mut SessionEffects,
    ) -> Result<()> {
        let (agg_nonce, signer_nonce) = match (&self.agg_nonce, self.nonces.get(&sender)) {
            (Some(agg), Some(nonce)) => (agg, &nonce.nonce),
            _ => {
                return Err(Error::Internal(format!(
                    "no nonce recorded for {}",
                    sender.short()
                )))
            }
        };

        if !musig::verify_partial(
            &self.key_agg,
            &stored.partial,
            agg_nonce,
            &sender,
            signer_nonce,
            &self.message,
        ) {
            return Err(Error::InvalidPartialSignature {
                participant: sender.to_hex(),
                reason: "verification failed".into(),
            });
        }

        self.partials.insert(sender, stored);
        self.touch();
        fx.events.push(ProtocolEvent::PartialSignatureReceived {
            session_id: self.id.clone(),
            participant: sender,
        });

        if self.partials.len() == self.sorted_keys.len() {
            fx.events.push(ProtocolEvent::PartialSignaturesComplete {
                session_id: self.id.clone(),
            });
            if self.policy.auto_finalize {
                // Failures abort the session inside finalize
                let _ = self.finalize(fx);
            }
        }
        Ok(())
    }

    /// Move to the next phase once the current one is satisfied
    fn advance(&mut self, fx: &mut SessionEffects) {
        let joining = matches!(
            self.state,
            SessionState::Created | SessionState::Announced | SessionState::Joining
        );
        if joining && self.missing_joins().is_empty() {
            self.enter(SessionState::NonceExchange, self.policy.nonce_timeout);
            fx.events.push(ProtocolEvent::SessionReady {
                session_id: self.id.clone(),
            });
        }

        if self.state == SessionState::NonceExchange && self.nonces.len() == self.sorted_keys.len() {
            let ordered: Vec<PubNonce> = self
                .sorted_keys
                .iter()
                .filter_map(|k| self.nonces.get(k))
                .map(|n| n.nonce.clone())
                .collect();
            self.agg_nonce = Some(musig::aggregate_nonces(&ordered));
            self.enter(SessionState::Signing, self.policy.signing_timeout);
            fx.events.push(ProtocolEvent::NoncesComplete {
                session_id: self.id.clone(),
            });

            let held = std::mem::take(&mut self.pending_partials);
            for (sender, mut by_peer) in held {
                let bound = self.slots.get(&sender).and_then(|s| s.peer_id.as_ref());
                let Some(stored) = bound.and_then(|peer| by_peer.remove(peer)) else {
                    continue;
                };
                if let Err(err) = self.verify_and_record(sender, stored, fx) {
                    self.fail(err, fx);
                    return;
                }
                if self.state.is_terminal() {
                    return;
                }
            }
        }
    }

    /// Abort because of `err`, notify the other participants and hand the
    /// error back to the caller
    fn fail(&mut self, err: Error, fx: &mut SessionEffects) -> Error {
        if self.state.is_terminal() {
            return err;
        }
        let offender = err
            .offending_participant()
            .and_then(|p| PublicKey::from_hex(p).ok());
        let reason = err.to_string();

        self.terminate(SessionState::Aborted, reason.clone(), offender);
        fx.events.push(ProtocolEvent::SessionAborted {
            session_id: self.id.clone(),
            reason: reason.clone(),
            offender,
        });
        self.notify_abort(reason, offender, fx);
        err
    }

    /// Others only accept an abort from a participant that has joined
    fn notify_abort(&self, reason: String, offender: Option<PublicKey>, fx: &mut SessionEffects) {
        if self.local_joined() {
            fx.outbound
                .push(Outbound::Session(MessagePayload::Abort { reason, offender }));
        }
    }

    fn terminate(&mut self, state: SessionState, reason: String, offender: Option<PublicKey>) {
        self.state = state;
        self.failure_reason = Some(reason);
        self.offender = offender;
        self.sec_nonce = None;
        self.terminated_at = Some(Instant::now());
        self.touch();
    }

    fn enter(&mut self, state: SessionState, timeout: Duration) {
        self.state = state;
        self.phase_deadline = Instant::now() + timeout;
        self.touch();
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            SessionState::Timeout => Err(Error::Timeout(format!(
                "session {}: {}",
                self.id,
                self.failure_reason.as_deref().unwrap_or("timed out")
            ))),
            state if state.is_terminal() => Err(Error::PhaseOrderViolation(format!(
                "session {} is {}",
                self.id, state
            ))),
            _ => Ok(()),
        }
    }

    fn missing_joins(&self) -> Vec<PublicKey> {
        self.slots
            .iter()
            .filter(|(_, slot)| !slot.joined)
            .map(|(key, _)| *key)
            .collect()
    }

    fn missing_nonces(&self) -> Vec<PublicKey> {
        self.sorted_keys
            .iter()
            .filter(|k| !self.nonces.contains_key(k))
            .copied()
            .collect()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn describe_missing(keys: &[PublicKey]) -> String {
    if keys.is_empty() {
        return "nobody".into();
    }
    keys.iter()
        .map(|k| k.short())
        .collect::<Vec<_>>()
        .join(", ")
}
