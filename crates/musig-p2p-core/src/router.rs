//! Message router
//!
//! Owns every subscription the protocol holds on the transport and drains
//! each one with its own pump task. Inbound bytes are decoded, checked for
//! freshness and handed to discovery or the session coordinator. Session
//! messages that arrive before their session is known wait in a bounded
//! pending buffer.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::coordinator::Coordinator;
use crate::discovery::Discovery;
use crate::transport::{Inbox, PeerEvent, Transport, TransportMessage};
use crate::types::{PeerId, SessionId};
use crate::wire::{
    session_topic, MessagePayload, ProtocolMessage, ANNOUNCEMENT_TOPIC, DISCOVERY_TOPIC,
};
use crate::{Error, Result};

const DIRECT_PUMP: &str = "direct";
const PEER_EVENTS_PUMP: &str = "peer-events";

/// Session message with the peer the transport received it from
pub(crate) type Held = (PeerId, ProtocolMessage);

/// Messages held for a session we have not seen yet
struct PendingQueue {
    first_seen: Instant,
    messages: VecDeque<Held>,
}

/// Bounded buffer of session messages keyed by session id
pub(crate) struct PendingBuffer {
    queues: DashMap<SessionId, PendingQueue>,
    per_session: usize,
    max_sessions: usize,
}

impl PendingBuffer {
    pub fn new(per_session: usize, max_sessions: usize) -> Self {
        Self {
            queues: DashMap::new(),
            per_session,
            max_sessions,
        }
    }

    /// Hold a message; returns false when it was dropped for lack of room
    pub fn push(&self, session_id: &str, message: Held, now: Instant) -> bool {
        if let Some(mut queue) = self.queues.get_mut(session_id) {
            if queue.messages.len() >= self.per_session {
                return false;
            }
            queue.messages.push_back(message);
            return true;
        }

        if self.queues.len() >= self.max_sessions {
            return false;
        }
        self.queues
            .entry(session_id.to_string())
            .or_insert_with(|| PendingQueue {
                first_seen: now,
                messages: VecDeque::new(),
            })
            .messages
            .push_back(message);
        true
    }

    /// Take everything held for a session, in arrival order
    pub fn take(&self, session_id: &str) -> Vec<Held> {
        self.queues
            .remove(session_id)
            .map(|(_, queue)| queue.messages.into_iter().collect())
            .unwrap_or_default()
    }

    /// Drop queues older than `ttl`
    pub fn purge(&self, now: Instant, ttl: std::time::Duration) -> usize {
        let before = self.queues.len();
        self.queues
            .retain(|_, queue| now.saturating_duration_since(queue.first_seen) < ttl);
        before - self.queues.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queues.len()
    }
}

pub(crate) struct Router {
    transport: Arc<dyn Transport>,
    config: Arc<ProtocolConfig>,
    discovery: Arc<Discovery>,
    coordinator: Arc<Coordinator>,
    pending: PendingBuffer,
    pumps: DashMap<String, JoinHandle<()>>,
    local_peer: PeerId,
}

impl Router {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Arc<ProtocolConfig>,
        discovery: Arc<Discovery>,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        let pending = PendingBuffer::new(config.pending_per_session, config.max_pending_sessions);
        let local_peer = transport.local_peer_id();
        Self {
            transport,
            config,
            discovery,
            coordinator,
            pending,
            pumps: DashMap::new(),
            local_peer,
        }
    }

    /// Subscribe to the shared topics, the direct inbox and peer events
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        for topic in [DISCOVERY_TOPIC, ANNOUNCEMENT_TOPIC] {
            let inbox = self.transport.subscribe_to_topic(topic).await?;
            self.spawn_pump(topic.to_string(), inbox);
        }

        let direct = self.transport.direct_inbox().await?;
        self.spawn_pump(DIRECT_PUMP.to_string(), direct);

        let mut peer_events = self.transport.peer_events();
        let router = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match peer_events.recv().await {
                    Ok(PeerEvent::Disconnected(peer)) => {
                        router.coordinator.on_peer_disconnected(&peer).await
                    }
                    Ok(PeerEvent::Connected(peer)) => debug!(peer = %peer, "peer connected"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "peer event stream lagged")
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.pumps.insert(PEER_EVENTS_PUMP.to_string(), handle);

        info!(peer = %self.local_peer, "message router started");
        Ok(())
    }

    fn spawn_pump(self: &Arc<Self>, name: String, mut inbox: Inbox) {
        let router = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                router.dispatch(message).await;
            }
        });
        if let Some(previous) = self.pumps.insert(name, handle) {
            previous.abort();
        }
    }

    /// Subscribe to a session's topic; idempotent
    pub async fn watch_session(self: &Arc<Self>, session_id: &str) -> Result<()> {
        let topic = session_topic(session_id);
        if self.pumps.contains_key(&topic) {
            return Ok(());
        }
        let inbox = self.transport.subscribe_to_topic(&topic).await?;
        debug!(session_id, "watching session topic");
        self.spawn_pump(topic, inbox);
        Ok(())
    }

    pub async fn unwatch_session(&self, session_id: &str) {
        let topic = session_topic(session_id);
        if let Some((_, handle)) = self.pumps.remove(&topic) {
            handle.abort();
            if let Err(e) = self.transport.unsubscribe_from_topic(&topic).await {
                debug!(session_id, error = %e, "failed to unsubscribe session topic");
            }
        }
    }

    /// Replay messages that arrived before the session was known
    pub async fn drain_pending(&self, session_id: &str) {
        let held = self.pending.take(session_id);
        if held.is_empty() {
            return;
        }
        debug!(session_id, count = held.len(), "replaying held messages");
        for (from, message) in held {
            self.apply_session_message(&from, message).await;
        }
    }

    pub fn purge_pending(&self, now: Instant) -> usize {
        self.pending.purge(now, self.config.pending_ttl())
    }

    pub async fn dispatch(self: &Arc<Self>, inbound: TransportMessage) {
        if inbound.from == self.local_peer {
            return;
        }

        let message = match ProtocolMessage::decode(&inbound.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(from = %inbound.from, topic = ?inbound.topic, error = %e, "dropping malformed message");
                return;
            }
        };

        let now_ms = Utc::now().timestamp_millis();
        if !message.is_fresh(
            now_ms,
            self.config.max_message_age(),
            self.config.max_clock_skew(),
        ) {
            debug!(
                from = %inbound.from,
                kind = message.payload.kind(),
                timestamp = message.timestamp,
                "dropping message outside freshness window"
            );
            return;
        }

        if let MessagePayload::Join { peer_id, .. } = &message.payload {
            if peer_id != &inbound.from {
                warn!(from = %inbound.from, claimed = %peer_id, "dropping join with forged peer id");
                return;
            }
        }

        let from = inbound.from;
        let sender = message.sender;
        match message.payload {
            MessagePayload::Advertisement(advertisement) => {
                self.discovery.on_advertisement(&from, &sender, advertisement)
            }
            MessagePayload::Withdrawal { advertisement_id } => {
                self.discovery.on_withdrawal(&from, &sender, &advertisement_id)
            }
            MessagePayload::SigningRequest(request) => {
                self.discovery.on_signing_request(&from, &sender, request)
            }
            MessagePayload::RequestWithdrawal { request_id } => {
                self.discovery.on_request_withdrawal(&from, &sender, &request_id)
            }
            MessagePayload::SessionAnnouncement(announcement) => {
                if let Some(session_id) =
                    self.coordinator.on_announcement(&from, &sender, announcement).await
                {
                    self.track(&session_id).await;
                }
            }
            _ => self.route_session_message(from, message).await,
        }
    }

    async fn track(self: &Arc<Self>, session_id: &str) {
        if let Err(e) = self.watch_session(session_id).await {
            warn!(session_id, error = %e, "failed to watch announced session");
        }
        self.drain_pending(session_id).await;
    }

    async fn route_session_message(&self, from: PeerId, message: ProtocolMessage) {
        let Some(session_id) = message.session_id.clone() else {
            return;
        };
        if self.coordinator.knows(&session_id) {
            self.apply_session_message(&from, message).await;
            return;
        }

        let kind = message.payload.kind();
        if self.pending.push(&session_id, (from, message), Instant::now()) {
            debug!(session_id = %session_id, kind, "holding message for unknown session");
        } else {
            debug!(session_id = %session_id, kind, "pending buffer full, dropping message");
        }
    }

    async fn apply_session_message(&self, from: &PeerId, message: ProtocolMessage) {
        let session_id = message.session_id.clone().unwrap_or_default();
        let kind = message.payload.kind();
        let sender = message.sender.short();

        match self.coordinator.on_session_message(from, message).await {
            Ok(()) => {}
            Err(e) if e.is_protocol_violation() => {
                warn!(session_id = %session_id, kind, participant = %sender, from = %from, error = %e, "protocol violation")
            }
            Err(e @ Error::ParticipantMismatch(_)) => {
                warn!(session_id = %session_id, kind, participant = %sender, from = %from, error = %e, "rejected session message")
            }
            Err(e) => {
                debug!(session_id = %session_id, kind, participant = %sender, from = %from, error = %e, "ignored session message")
            }
        }
    }

    /// Stop every pump and release the topic subscriptions
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.pumps.iter().map(|entry| entry.key().clone()).collect();
        for name in names {
            if let Some((_, handle)) = self.pumps.remove(&name) {
                handle.abort();
            }
            if name != DIRECT_PUMP && name != PEER_EVENTS_PUMP {
                if let Err(e) = self.transport.unsubscribe_from_topic(&name).await {
                    debug!(topic = %name, error = %e, "failed to unsubscribe");
                }
            }
        }
        info!(peer = %self.local_peer, "message router stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::LocalKeys;
    use crate::events::EventBus;
    use crate::musig;
    use crate::session::{SessionPolicy, SessionRecord};
    use crate::store::SessionStore;
    use crate::transport::MemoryNetwork;
    use crate::types::{PrivateKey, PublicKey, SessionMetadata};
    use crate::wire::SequenceClock;
    use std::time::Duration;

    struct Fixture {
        router: Arc<Router>,
        store: Arc<SessionStore>,
        local_keys: LocalKeys,
    }

    fn fixture(network: &MemoryNetwork, peer: &str) -> Fixture {
        let transport: Arc<dyn Transport> = Arc::new(network.join(peer));
        let config = Arc::new(ProtocolConfig::default());
        let store = Arc::new(SessionStore::new());
        let events = EventBus::new(64);
        let clock = Arc::new(SequenceClock::new());
        let local_keys = LocalKeys::default();
        let discovery = Arc::new(Discovery::new(
            transport.clone(),
            config.clone(),
            events.clone(),
            clock.clone(),
            local_keys.clone(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            transport.clone(),
            config.clone(),
            store.clone(),
            events,
            clock,
            local_keys.clone(),
        ));
        let router = Arc::new(Router::new(transport, config, discovery, coordinator));
        Fixture {
            router,
            store,
            local_keys,
        }
    }

    fn envelope(from: &str, session_id: &str, sender: PublicKey, payload: MessagePayload) -> TransportMessage {
        let message = ProtocolMessage::new(Some(session_id.to_string()), sender, 1, payload);
        TransportMessage {
            from: from.to_string(),
            topic: Some(session_topic(session_id)),
            payload: message.encode().unwrap(),
        }
    }

    fn join(key: &PrivateKey, session_id: &str, peer: &str) -> MessagePayload {
        MessagePayload::Join {
            peer_id: peer.to_string(),
            nickname: None,
            proof: musig::peer_binding_proof(key, session_id, peer).unwrap(),
        }
    }

    fn message(session_id: &str) -> Held {
        let key = PrivateKey::generate();
        let message = ProtocolMessage::new(
            Some(session_id.to_string()),
            key.public_key(),
            1,
            join(&key, session_id, "peer"),
        );
        ("peer".to_string(), message)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_buffer_bounds_and_ttl() {
        let buffer = PendingBuffer::new(2, 2);
        let now = Instant::now();

        assert!(buffer.push("s1", message("s1"), now));
        assert!(buffer.push("s1", message("s1"), now));
        assert!(!buffer.push("s1", message("s1"), now));
        assert!(buffer.push("s2", message("s2"), now));
        assert!(!buffer.push("s3", message("s3"), now));
        assert_eq!(buffer.len(), 2);

        assert_eq!(buffer.take("s1").len(), 2);
        assert!(buffer.take("s1").is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(buffer.purge(Instant::now(), Duration::from_secs(10)), 1);
        assert_eq!(buffer.len(), 0);
    }

    #[tokio::test]
    async fn test_held_messages_replayed_when_announcement_arrives() {
        let network = MemoryNetwork::new();
        let bob = fixture(&network, "bob");

        let alice_key = PrivateKey::generate();
        let bob_key = PrivateKey::generate();
        let carol_key = PrivateKey::generate();
        bob.local_keys.insert(bob_key.public_key());

        let policy = SessionPolicy::from(&ProtocolConfig::default());
        let initiator = SessionRecord::create_local(
            "s1".into(),
            &alice_key,
            "alice".into(),
            None,
            &[bob_key.public_key(), carol_key.public_key()],
            b"spend".to_vec(),
            SessionMetadata::default(),
            policy,
        )
        .unwrap();
        let announcement = initiator.announcement().unwrap();

        // Carol's join overtakes the announcement
        bob.router
            .dispatch(envelope("carol", "s1", carol_key.public_key(), join(&carol_key, "s1", "carol")))
            .await;
        assert!(!bob.store.contains("s1"));
        assert_eq!(bob.router.pending.len(), 1);

        let announce = ProtocolMessage::new(
            Some("s1".into()),
            alice_key.public_key(),
            1,
            MessagePayload::SessionAnnouncement(announcement),
        );
        bob.router
            .dispatch(TransportMessage {
                from: "alice".into(),
                topic: Some(ANNOUNCEMENT_TOPIC.into()),
                payload: announce.encode().unwrap(),
            })
            .await;

        assert_eq!(bob.router.pending.len(), 0);
        assert!(bob.router.pumps.contains_key(&session_topic("s1")));
        let session = bob.store.snapshot("s1").await.unwrap();
        assert!(session.participant(&carol_key.public_key()).unwrap().joined);
        assert!(!session.participant(&bob_key.public_key()).unwrap().joined);
    }

    #[tokio::test]
    async fn test_announcement_not_naming_us_is_ignored() {
        let network = MemoryNetwork::new();
        let bob = fixture(&network, "bob");
        let alice_key = PrivateKey::generate();
        bob.local_keys.insert(PrivateKey::generate().public_key());

        let policy = SessionPolicy::from(&ProtocolConfig::default());
        let initiator = SessionRecord::create_local(
            "s1".into(),
            &alice_key,
            "alice".into(),
            None,
            &[PrivateKey::generate().public_key()],
            b"spend".to_vec(),
            SessionMetadata::default(),
            policy,
        )
        .unwrap();
        let announce = ProtocolMessage::new(
            Some("s1".into()),
            alice_key.public_key(),
            1,
            MessagePayload::SessionAnnouncement(initiator.announcement().unwrap()),
        );
        bob.router
            .dispatch(TransportMessage {
                from: "alice".into(),
                topic: Some(ANNOUNCEMENT_TOPIC.into()),
                payload: announce.encode().unwrap(),
            })
            .await;

        assert!(!bob.store.contains("s1"));
        assert!(!bob.router.pumps.contains_key(&session_topic("s1")));
    }

    #[tokio::test]
    async fn test_malformed_stale_and_forged_messages_dropped() {
        let network = MemoryNetwork::new();
        let bob = fixture(&network, "bob");
        let carol_key = PrivateKey::generate();

        bob.router
            .dispatch(TransportMessage {
                from: "carol".into(),
                topic: Some(session_topic("s1")),
                payload: b"not json".to_vec(),
            })
            .await;

        let mut stale = ProtocolMessage::new(
            Some("s1".into()),
            carol_key.public_key(),
            1,
            join(&carol_key, "s1", "carol"),
        );
        stale.timestamp -= 10 * 60 * 1000;
        bob.router
            .dispatch(TransportMessage {
                from: "carol".into(),
                topic: Some(session_topic("s1")),
                payload: stale.encode().unwrap(),
            })
            .await;

        let mut future = ProtocolMessage::new(
            Some("s1".into()),
            carol_key.public_key(),
            1,
            join(&carol_key, "s1", "carol"),
        );
        future.timestamp += 5 * 60 * 1000;
        bob.router
            .dispatch(TransportMessage {
                from: "carol".into(),
                topic: Some(session_topic("s1")),
                payload: future.encode().unwrap(),
            })
            .await;

        // Join claiming another peer's id
        bob.router
            .dispatch(envelope("mallory", "s1", carol_key.public_key(), join(&carol_key, "s1", "carol")))
            .await;

        // Our own traffic echoed back
        bob.router
            .dispatch(envelope("bob", "s1", carol_key.public_key(), join(&carol_key, "s1", "bob")))
            .await;

        assert_eq!(bob.router.pending.len(), 0);
    }

    fn announce_from(from: &str, sender: PublicKey, announcement: crate::wire::SessionAnnouncement) -> TransportMessage {
        let message = ProtocolMessage::new(
            Some(announcement.session_id.clone()),
            sender,
            1,
            MessagePayload::SessionAnnouncement(announcement),
        );
        TransportMessage {
            from: from.into(),
            topic: Some(ANNOUNCEMENT_TOPIC.into()),
            payload: message.encode().unwrap(),
        }
    }

    fn three_party(bob: &Fixture) -> (PrivateKey, PrivateKey, SessionRecord) {
        let alice_key = PrivateKey::generate();
        let bob_key = PrivateKey::generate();
        let carol_key = PrivateKey::generate();
        bob.local_keys.insert(bob_key.public_key());

        let initiator = SessionRecord::create_local(
            "s1".into(),
            &alice_key,
            "alice".into(),
            None,
            &[bob_key.public_key(), carol_key.public_key()],
            b"spend".to_vec(),
            SessionMetadata::default(),
            SessionPolicy::from(&ProtocolConfig::default()),
        )
        .unwrap();
        (alice_key, carol_key, initiator)
    }

    #[tokio::test]
    async fn test_announcement_relayed_by_another_peer_is_ignored() {
        let network = MemoryNetwork::new();
        let bob = fixture(&network, "bob");
        let (alice_key, _, initiator) = three_party(&bob);
        let announcement = initiator.announcement().unwrap();

        bob.router
            .dispatch(announce_from("mallory", alice_key.public_key(), announcement.clone()))
            .await;
        assert!(!bob.store.contains("s1"));

        // Re-pointing the descriptor at mallory breaks the initiator's binding
        let mut rebound = announcement;
        rebound.initiator_peer = "mallory".into();
        bob.router
            .dispatch(announce_from("mallory", alice_key.public_key(), rebound))
            .await;
        assert!(!bob.store.contains("s1"));
        assert!(!bob.router.pumps.contains_key(&session_topic("s1")));
    }

    #[tokio::test]
    async fn test_held_messages_keep_their_source_peer() {
        let network = MemoryNetwork::new();
        let bob = fixture(&network, "bob");
        let (alice_key, carol_key, initiator) = three_party(&bob);
        let nonce = initiator.snapshot().local_nonce.unwrap();

        // Mallory's nonce under carol's key and carol's real join both
        // overtake the announcement
        bob.router
            .dispatch(envelope(
                "mallory",
                "s1",
                carol_key.public_key(),
                MessagePayload::Nonce { nonce },
            ))
            .await;
        bob.router
            .dispatch(envelope("carol", "s1", carol_key.public_key(), join(&carol_key, "s1", "carol")))
            .await;

        bob.router
            .dispatch(announce_from("alice", alice_key.public_key(), initiator.announcement().unwrap()))
            .await;

        let session = bob.store.snapshot("s1").await.unwrap();
        let carol = session.participant(&carol_key.public_key()).unwrap();
        assert!(carol.joined);
        assert_eq!(carol.peer_id.as_deref(), Some("carol"));
        assert!(!carol.has_nonce);
        assert_eq!(session.state, crate::session::SessionState::Joining);
    }

    #[tokio::test]
    async fn test_outsider_abort_on_session_topic_is_ignored() {
        let network = MemoryNetwork::new();
        let bob = fixture(&network, "bob");
        let (alice_key, carol_key, initiator) = three_party(&bob);
        bob.router
            .dispatch(announce_from("alice", alice_key.public_key(), initiator.announcement().unwrap()))
            .await;

        for claimed in [alice_key.public_key(), carol_key.public_key()] {
            bob.router
                .dispatch(envelope(
                    "mallory",
                    "s1",
                    claimed,
                    MessagePayload::Abort {
                        reason: "forged".into(),
                        offender: None,
                    },
                ))
                .await;
        }

        let session = bob.store.snapshot("s1").await.unwrap();
        assert_eq!(session.state, crate::session::SessionState::Announced);
        assert!(session.failure_reason.is_none());
    }
}
