//! Session coordinator
//!
//! Async driver around the session state machine. Every operation runs its
//! transition under the session lock, collects the resulting events and
//! outbound messages, releases the lock and only then talks to the network.

use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::ProtocolConfig;
use crate::discovery::LocalKeys;
use crate::events::{EventBus, ProtocolEvent};
use crate::session::{Outbound, SessionEffects, SessionPolicy, SessionRecord, SigningSession};
use crate::store::SessionStore;
use crate::transport::{AnnounceOptions, Transport};
use crate::types::{PeerId, PrivateKey, PublicKey, SessionId, SessionMetadata};
use crate::wire::{
    session_topic, MessagePayload, ProtocolMessage, SequenceClock, SessionAnnouncement,
    ANNOUNCEMENT_TOPIC, SESSION_RESOURCE,
};
use crate::{Error, Result};

pub(crate) struct Coordinator {
    transport: Arc<dyn Transport>,
    config: Arc<ProtocolConfig>,
    store: Arc<SessionStore>,
    events: EventBus,
    clock: Arc<SequenceClock>,
    local_keys: LocalKeys,
    policy: SessionPolicy,
}

impl Coordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Arc<ProtocolConfig>,
        store: Arc<SessionStore>,
        events: EventBus,
        clock: Arc<SequenceClock>,
        local_keys: LocalKeys,
    ) -> Self {
        let policy = SessionPolicy::from(config.as_ref());
        Self {
            transport,
            config,
            store,
            events,
            clock,
            local_keys,
            policy,
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.transport.is_ready() {
            Ok(())
        } else {
            Err(Error::NotInitialized("transport is not ready".into()))
        }
    }

    pub fn knows(&self, session_id: &str) -> bool {
        self.store.contains(session_id)
    }

    #[instrument(skip(self, private_key, participants, message, metadata), fields(participants = participants.len()))]
    pub async fn create_session(
        &self,
        private_key: &PrivateKey,
        participants: &[PublicKey],
        message: &[u8],
        metadata: SessionMetadata,
    ) -> Result<SigningSession> {
        self.ensure_ready()?;

        let local_key = private_key.public_key();
        let session_id = Uuid::new_v4().to_string();
        let record = SessionRecord::create_local(
            session_id.clone(),
            private_key,
            self.transport.local_peer_id(),
            None,
            participants,
            message.to_vec(),
            metadata,
            self.policy,
        )?;
        let snapshot = record.snapshot();
        self.store.insert(record)?;
        self.local_keys.insert(local_key);

        info!(session_id = %session_id, participants = snapshot.participants.len(), "session created");
        self.events.emit(ProtocolEvent::SessionCreated {
            session_id,
            is_initiator: true,
        });
        Ok(snapshot)
    }

    /// Publish the session descriptor so participants can find and join it
    #[instrument(skip(self))]
    pub async fn announce_session(&self, session_id: &str) -> Result<()> {
        self.ensure_ready()?;

        let announcement = self
            .store
            .with_session(session_id, |record| {
                record.mark_announced().and_then(|_| record.announcement())
            })
            .await??;

        let descriptor = serde_json::to_vec(&announcement)?;
        self.transport
            .announce_resource(
                SESSION_RESOURCE,
                session_id,
                descriptor,
                AnnounceOptions::with_ttl(self.config.join_timeout()),
            )
            .await?;

        let message = ProtocolMessage::new(
            Some(session_id.to_string()),
            announcement.initiator,
            self.clock.next(),
            MessagePayload::SessionAnnouncement(announcement),
        )
        .encode()?;
        self.transport
            .publish_to_topic(ANNOUNCEMENT_TOPIC, message)
            .await?;

        info!(session_id, "session announced");
        self.events.emit(ProtocolEvent::SessionAnnounced {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// Make sure a session is known locally, fetching its descriptor from
    /// the network when needed
    #[instrument(skip(self), fields(key = %local_key.short()))]
    pub async fn ensure_session(&self, session_id: &str, local_key: PublicKey) -> Result<()> {
        self.ensure_ready()?;
        if self.store.contains(session_id) {
            return Ok(());
        }

        let resource = self
            .transport
            .discover_resource(
                SESSION_RESOURCE,
                session_id,
                self.config.resource_lookup_timeout(),
            )
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        let announcement: SessionAnnouncement = serde_json::from_slice(&resource.payload)
            .map_err(|e| Error::Deserialization(format!("session descriptor: {}", e)))?;
        if announcement.session_id != session_id || !announcement.is_bound_to(&resource.owner) {
            return Err(Error::InvalidMessage(format!(
                "descriptor for {} does not match its registration",
                session_id
            )));
        }

        let record = SessionRecord::from_announcement(&announcement, local_key, self.policy)?;
        match self.store.insert(record) {
            Ok(()) => {
                debug!(session_id, "session descriptor fetched");
                self.events.emit(ProtocolEvent::SessionAnnounced {
                    session_id: session_id.to_string(),
                });
                Ok(())
            }
            // Announcement raced us in through the router
            Err(Error::DuplicateSession(_)) if self.store.contains(session_id) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, private_key), fields(key = %private_key.public_key().short()))]
    pub async fn join_session(
        &self,
        session_id: &str,
        private_key: &PrivateKey,
    ) -> Result<SigningSession> {
        self.ensure_ready()?;

        let local_peer = self.transport.local_peer_id();
        let (joined, fx, sender, snapshot) = self
            .store
            .with_session(session_id, |record| {
                let mut fx = SessionEffects::new();
                let joined = record.join_local(private_key, &local_peer, None, &mut fx);
                (joined, fx, record.local_key(), record.snapshot())
            })
            .await?;

        let joined = joined?;
        self.local_keys.insert(private_key.public_key());
        if joined {
            info!(session_id, "joined session");
        }
        self.deliver(session_id, sender, fx).await?;
        Ok(snapshot)
    }

    #[instrument(skip(self))]
    pub async fn share_nonces(&self, session_id: &str) -> Result<()> {
        self.ensure_ready()?;
        let (result, fx, sender) = self
            .store
            .with_session(session_id, |record| {
                let mut fx = SessionEffects::new();
                let result = record.share_nonce(&mut fx);
                (result, fx, record.local_key())
            })
            .await?;

        result?;
        debug!(session_id, "nonce shared");
        self.deliver(session_id, sender, fx).await
    }

    #[instrument(skip(self, private_key))]
    pub async fn share_partial_signature(
        &self,
        session_id: &str,
        private_key: &PrivateKey,
    ) -> Result<()> {
        self.ensure_ready()?;
        let (result, fx, sender) = self
            .store
            .with_session(session_id, |record| {
                let mut fx = SessionEffects::new();
                let result = record.share_partial(private_key, &mut fx);
                (result, fx, record.local_key())
            })
            .await?;

        // An abort raised while signing still has to reach the others
        let delivered = self.deliver(session_id, sender, fx).await;
        result?;
        debug!(session_id, "partial signature shared");
        delivered
    }

    #[instrument(skip(self))]
    pub async fn finalize_session(&self, session_id: &str) -> Result<Vec<u8>> {
        let (result, fx, sender) = self
            .store
            .with_session(session_id, |record| {
                let mut fx = SessionEffects::new();
                let result = record.finalize(&mut fx);
                (result, fx, record.local_key())
            })
            .await?;

        if let Err(e) = self.deliver(session_id, sender, fx).await {
            warn!(session_id, error = %e, "failed to deliver finalize effects");
        }
        result
    }

    /// Abort locally; notifying the others is best effort
    #[instrument(skip(self))]
    pub async fn abort_session(&self, session_id: &str, reason: &str) -> Result<()> {
        let (aborted, fx, sender) = self
            .store
            .with_session(session_id, |record| {
                let mut fx = SessionEffects::new();
                let aborted = record.abort_local(reason, &mut fx);
                (aborted, fx, record.local_key())
            })
            .await?;

        if aborted {
            info!(session_id, reason, "session aborted");
            if let Err(e) = self.deliver(session_id, sender, fx).await {
                warn!(session_id, error = %e, "abort notice not delivered");
            }
        }
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SigningSession> {
        self.store.snapshot(session_id).await.ok()
    }

    pub async fn get_all_sessions(&self) -> Vec<SigningSession> {
        self.store.snapshots().await
    }

    pub async fn can_finalize_session(&self, session_id: &str) -> Result<bool> {
        self.store
            .with_session(session_id, |record| record.can_finalize())
            .await
    }

    /// Track an announced session that names one of our keys. Returns the
    /// session id when a new session was added.
    pub async fn on_announcement(
        &self,
        from: &PeerId,
        sender: &PublicKey,
        announcement: SessionAnnouncement,
    ) -> Option<SessionId> {
        if &announcement.initiator != sender || self.store.contains(&announcement.session_id) {
            return None;
        }
        if !announcement.is_bound_to(from) {
            warn!(
                session_id = %announcement.session_id,
                from = %from,
                "announcement not sent from the initiator's peer"
            );
            return None;
        }
        let local_key = announcement
            .participants
            .iter()
            .find(|key| **key != announcement.initiator && self.local_keys.contains(*key))
            .copied()?;

        let session_id = announcement.session_id.clone();
        let record = match SessionRecord::from_announcement(&announcement, local_key, self.policy) {
            Ok(record) => record,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "rejecting announcement");
                return None;
            }
        };
        if let Err(e) = self.store.insert(record) {
            warn!(session_id = %session_id, error = %e, "rejecting announcement");
            return None;
        }

        info!(
            session_id = %session_id,
            initiator = %announcement.initiator.short(),
            "session announced to us"
        );
        self.events.emit(ProtocolEvent::SessionAnnounced {
            session_id: session_id.clone(),
        });
        Some(session_id)
    }

    /// Apply a join, nonce, partial signature or abort that peer `from` sent
    pub async fn on_session_message(&self, from: &PeerId, message: ProtocolMessage) -> Result<()> {
        let session_id = message
            .session_id
            .clone()
            .ok_or_else(|| Error::InvalidMessage("session message without session id".into()))?;
        let sender = message.sender;

        let (result, fx, local_key) = self
            .store
            .with_session(&session_id, |record| {
                let mut fx = SessionEffects::new();
                let result =
                    record.handle(from, sender, message.sequence, &message.payload, &mut fx);
                (result, fx, record.local_key())
            })
            .await?;

        if let Err(e) = self.deliver(&session_id, local_key, fx).await {
            warn!(session_id = %session_id, error = %e, "failed to deliver session effects");
        }
        result
    }

    pub async fn on_peer_disconnected(&self, peer: &PeerId) {
        for session_id in self.store.ids() {
            let Ok(fx) = self
                .store
                .with_session(&session_id, |record| {
                    let mut fx = SessionEffects::new();
                    record.on_peer_disconnected(peer, &mut fx);
                    fx
                })
                .await
            else {
                continue;
            };
            for event in &fx.events {
                if let ProtocolEvent::ParticipantDisconnected { participant, .. } = event {
                    info!(session_id = %session_id, participant = %participant.short(), peer = %peer, "participant disconnected");
                }
            }
            self.events.emit_all(fx.events);
        }
    }

    /// Time out sessions whose phase deadline has passed
    pub async fn expire_overdue(&self, now: Instant) -> Vec<SessionId> {
        let mut expired = Vec::new();
        for session_id in self.store.ids() {
            let outcome = self
                .store
                .with_session(&session_id, |record| {
                    let mut fx = SessionEffects::new();
                    let timed_out = record.check_timeout(now, &mut fx);
                    (timed_out, fx)
                })
                .await;
            if let Ok((true, fx)) = outcome {
                warn!(session_id = %session_id, "session timed out");
                self.events.emit_all(fx.events);
                expired.push(session_id);
            }
        }
        expired
    }

    /// Evict long-terminated sessions and drop their descriptors
    pub async fn evict_terminated(&self, now: Instant) -> Vec<SessionId> {
        let evicted = self
            .store
            .evict_terminated(now, self.config.terminated_retention())
            .await;
        for session_id in &evicted {
            if let Err(e) = self
                .transport
                .withdraw_resource(SESSION_RESOURCE, session_id)
                .await
            {
                debug!(session_id = %session_id, error = %e, "failed to withdraw session descriptor");
            }
        }
        evicted
    }

    /// Abort every live session, used on shutdown
    pub async fn abort_all(&self, reason: &str) {
        let live: Vec<SessionId> = self
            .store
            .snapshots()
            .await
            .into_iter()
            .filter(|s| !s.is_terminal())
            .map(|s| s.session_id)
            .collect();
        for session_id in live {
            if let Err(e) = self.abort_session(&session_id, reason).await {
                debug!(session_id = %session_id, error = %e, "abort on shutdown failed");
            }
        }
    }

    /// Send outbound messages, then emit events. Only a failed publish on the
    /// session topic is reported; direct replies and abort notices are best
    /// effort.
    async fn deliver(&self, session_id: &str, sender: PublicKey, fx: SessionEffects) -> Result<()> {
        let mut failure = None;

        for outbound in fx.outbound {
            let (payload, target) = match outbound {
                Outbound::Session(payload) => (payload, None),
                Outbound::Direct { peer, payload } => (payload, Some(peer)),
            };
            let kind = payload.kind();
            let critical = target.is_none() && !matches!(payload, MessagePayload::Abort { .. });

            let bytes = ProtocolMessage::new(
                Some(session_id.to_string()),
                sender,
                self.clock.next(),
                payload,
            )
            .encode()?;

            let sent = match &target {
                None => {
                    self.transport
                        .publish_to_topic(&session_topic(session_id), bytes)
                        .await
                }
                Some(peer) => self.transport.send_to_peer(peer, bytes).await,
            };

            if let Err(e) = sent {
                if critical {
                    warn!(session_id, kind, error = %e, "failed to publish session message");
                    failure.get_or_insert(e);
                } else {
                    debug!(session_id, kind, peer = ?target, error = %e, "best-effort send failed");
                }
            }
        }

        for event in &fx.events {
            match event {
                ProtocolEvent::SessionReady { .. } => info!(session_id, "all participants joined"),
                ProtocolEvent::NoncesComplete { .. } => info!(session_id, "nonce round complete"),
                ProtocolEvent::SessionComplete { .. } => info!(session_id, "session complete"),
                ProtocolEvent::SessionAborted { reason, offender, .. } => warn!(
                    session_id,
                    reason = %reason,
                    offender = ?offender.map(|k| k.short()),
                    "session aborted"
                ),
                _ => {}
            }
        }
        self.events.emit_all(fx.events);

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
