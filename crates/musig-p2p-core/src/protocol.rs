//! Protocol façade
//!
//! [`MuSigProtocol`] is the only entry point wallets use. It owns the session
//! store, the discovery service, the coordinator, the router and the
//! background sweeper for one transport. Nothing is global, so several
//! instances can run side by side in one process.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument};

use crate::config::ProtocolConfig;
use crate::coordinator::Coordinator;
use crate::discovery::{AdvertiseOptions, Discovery, LocalKeys, SigningRequestOptions};
use crate::events::{EventBus, ProtocolEvent};
use crate::router::Router;
use crate::session::SigningSession;
use crate::store::SessionStore;
use crate::transport::Transport;
use crate::types::{
    PeerId, PrivateKey, PublicKey, SessionMetadata, SharedWallet, SignerAdvertisement,
    SignerCriteria, SigningRequest, TransactionCategory,
};
use crate::wire::SequenceClock;
use crate::{Error, Result};

/// Everything that exists between `initialize` and `shutdown`
struct Runtime {
    transport: Arc<dyn Transport>,
    events: EventBus,
    store: Arc<SessionStore>,
    discovery: Arc<Discovery>,
    coordinator: Arc<Coordinator>,
    router: Arc<Router>,
    sweeper: JoinHandle<()>,
}

/// Signer discovery and MuSig2 signing sessions over a peer-to-peer transport
#[derive(Default)]
pub struct MuSigProtocol {
    runtime: RwLock<Option<Arc<Runtime>>>,
    local_keys: LocalKeys,
}

impl MuSigProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire the protocol to a transport and start the router and sweeper
    #[instrument(skip(self, transport, config), fields(peer = %transport.local_peer_id()))]
    pub async fn initialize(&self, transport: Arc<dyn Transport>, config: ProtocolConfig) -> Result<()> {
        let mut slot = self.runtime.write().await;
        if slot.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        config.validate()?;
        if !transport.is_ready() {
            return Err(Error::NotInitialized("transport is not ready".into()));
        }

        let config = Arc::new(config);
        let events = EventBus::new(config.event_capacity);
        let clock = Arc::new(SequenceClock::new());
        let store = Arc::new(SessionStore::new());

        let discovery = Arc::new(Discovery::new(
            transport.clone(),
            config.clone(),
            events.clone(),
            clock.clone(),
            self.local_keys.clone(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            transport.clone(),
            config.clone(),
            store.clone(),
            events.clone(),
            clock,
            self.local_keys.clone(),
        ));
        let router = Arc::new(Router::new(
            transport.clone(),
            config.clone(),
            discovery.clone(),
            coordinator.clone(),
        ));
        router.start().await?;

        let sweeper = spawn_sweeper(
            config,
            coordinator.clone(),
            router.clone(),
            discovery.clone(),
        );

        *slot = Some(Arc::new(Runtime {
            transport,
            events,
            store,
            discovery,
            coordinator,
            router,
            sweeper,
        }));
        info!("protocol initialized");
        Ok(())
    }

    /// Abort live sessions, withdraw our advertisement and stop all tasks.
    /// A later `initialize` starts from a clean slate.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        let Some(runtime) = self.runtime.write().await.take() else {
            return Ok(());
        };

        runtime.sweeper.abort();
        runtime.coordinator.abort_all("participant shut down").await;
        runtime.discovery.shutdown().await;
        runtime.router.shutdown().await;
        info!(sessions = runtime.store.len(), "protocol shut down");
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.runtime.read().await.is_some()
    }

    async fn runtime(&self) -> Result<Arc<Runtime>> {
        self.runtime
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::NotInitialized("call initialize first".into()))
    }

    pub async fn local_peer_id(&self) -> Result<PeerId> {
        Ok(self.runtime().await?.transport.local_peer_id())
    }

    /// Protocol events for this instance
    pub async fn subscribe_events(&self) -> Result<broadcast::Receiver<ProtocolEvent>> {
        Ok(self.runtime().await?.events.subscribe())
    }

    /// Declare a key we sign with, so announcements naming it are tracked
    pub fn register_signer_key(&self, public_key: PublicKey) {
        self.local_keys.insert(public_key);
    }

    /// Aggregated key and address for a participant set
    pub fn shared_wallet(&self, participants: &[PublicKey]) -> Result<SharedWallet> {
        SharedWallet::from_participants(participants)
    }

    // Discovery

    pub async fn advertise_signer(
        &self,
        public_key: PublicKey,
        categories: BTreeSet<TransactionCategory>,
        options: AdvertiseOptions,
    ) -> Result<String> {
        let runtime = self.runtime().await?;
        runtime
            .discovery
            .advertise_signer(public_key, categories, options)
            .await
    }

    /// Our current advertisement, if any
    pub async fn own_advertisement(&self) -> Result<Option<SignerAdvertisement>> {
        Ok(self.runtime().await?.discovery.own_advertisement().await)
    }

    pub async fn withdraw_signer(&self) -> Result<()> {
        self.runtime().await?.discovery.withdraw_signer().await
    }

    pub async fn discover_signers(&self, criteria: &SignerCriteria) -> Result<Vec<SignerAdvertisement>> {
        self.runtime().await?.discovery.discover_signers(criteria).await
    }

    /// Feed of matching advertisements, each delivered once per refresh
    pub async fn subscribe_to_signers(
        &self,
        criteria: SignerCriteria,
    ) -> Result<(String, mpsc::UnboundedReceiver<SignerAdvertisement>)> {
        Ok(self.runtime().await?.discovery.subscribe_to_signers(criteria))
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<bool> {
        Ok(self.runtime().await?.discovery.unsubscribe(subscription_id))
    }

    pub async fn create_signing_request(
        &self,
        creator: PublicKey,
        required_keys: &[PublicKey],
        message_hash: Vec<u8>,
        options: SigningRequestOptions,
    ) -> Result<String> {
        let runtime = self.runtime().await?;
        runtime
            .discovery
            .create_signing_request(creator, required_keys, message_hash, options)
            .await
    }

    pub async fn withdraw_signing_request(&self, request_id: &str) -> Result<()> {
        self.runtime()
            .await?
            .discovery
            .withdraw_signing_request(request_id)
            .await
    }

    /// Live signing requests, including our own
    pub async fn signing_requests(&self) -> Result<Vec<SigningRequest>> {
        self.runtime().await?.discovery.signing_requests().await
    }

    // Sessions

    /// Start a session as initiator. `participants` may or may not include
    /// our own key.
    pub async fn create_session(
        &self,
        private_key: &PrivateKey,
        participants: &[PublicKey],
        message: &[u8],
        metadata: SessionMetadata,
    ) -> Result<SigningSession> {
        let runtime = self.runtime().await?;
        let session = runtime
            .coordinator
            .create_session(private_key, participants, message, metadata)
            .await?;

        if let Err(e) = runtime.router.watch_session(&session.session_id).await {
            runtime
                .coordinator
                .abort_session(&session.session_id, "could not subscribe to session topic")
                .await?;
            return Err(e);
        }
        Ok(session)
    }

    pub async fn announce_session(&self, session_id: &str) -> Result<()> {
        self.runtime()
            .await?
            .coordinator
            .announce_session(session_id)
            .await
    }

    /// Join a session. One that has not been seen yet is looked up by id
    /// through the transport's resource registry.
    pub async fn join_session(&self, session_id: &str, private_key: &PrivateKey) -> Result<SigningSession> {
        let runtime = self.runtime().await?;
        let known = runtime.coordinator.knows(session_id);

        // Subscribe before anything is sent so no reply is missed
        runtime.router.watch_session(session_id).await?;
        if let Err(e) = runtime
            .coordinator
            .ensure_session(session_id, private_key.public_key())
            .await
        {
            if !known && !runtime.coordinator.knows(session_id) {
                runtime.router.unwatch_session(session_id).await;
            }
            return Err(e);
        }
        runtime.router.drain_pending(session_id).await;

        runtime
            .coordinator
            .join_session(session_id, private_key)
            .await
    }

    pub async fn share_nonces(&self, session_id: &str) -> Result<()> {
        self.runtime().await?.coordinator.share_nonces(session_id).await
    }

    pub async fn share_partial_signature(&self, session_id: &str, private_key: &PrivateKey) -> Result<()> {
        self.runtime()
            .await?
            .coordinator
            .share_partial_signature(session_id, private_key)
            .await
    }

    /// Aggregate the final 64-byte signature; repeated calls return it again
    pub async fn finalize_session(&self, session_id: &str) -> Result<Vec<u8>> {
        self.runtime()
            .await?
            .coordinator
            .finalize_session(session_id)
            .await
    }

    pub async fn abort_session(&self, session_id: &str, reason: &str) -> Result<()> {
        self.runtime()
            .await?
            .coordinator
            .abort_session(session_id, reason)
            .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SigningSession>> {
        Ok(self.runtime().await?.coordinator.get_session(session_id).await)
    }

    pub async fn get_all_sessions(&self) -> Result<Vec<SigningSession>> {
        Ok(self.runtime().await?.coordinator.get_all_sessions().await)
    }

    pub async fn can_finalize_session(&self, session_id: &str) -> Result<bool> {
        self.runtime()
            .await?
            .coordinator
            .can_finalize_session(session_id)
            .await
    }
}

fn spawn_sweeper(
    config: Arc<ProtocolConfig>,
    coordinator: Arc<Coordinator>,
    router: Arc<Router>,
    discovery: Arc<Discovery>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Instant::now();

            coordinator.expire_overdue(now).await;
            for session_id in coordinator.evict_terminated(now).await {
                router.unwatch_session(&session_id).await;
            }

            let dropped = router.purge_pending(now);
            let expired = discovery.purge_expired(now);
            if dropped > 0 || expired > 0 {
                debug!(dropped, expired, "sweep purged stale entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::musig;
    use crate::session::SessionState;
    use crate::transport::{MemoryNetwork, MemoryTransport};
    use crate::wire::{session_topic, MessagePayload, ProtocolMessage};
    use std::time::Duration;

    struct Node {
        protocol: MuSigProtocol,
        transport: MemoryTransport,
        key: PrivateKey,
        events: broadcast::Receiver<ProtocolEvent>,
    }

    impl Node {
        fn public_key(&self) -> PublicKey {
            self.key.public_key()
        }
    }

    async fn node(network: &MemoryNetwork, peer: &str, config: ProtocolConfig) -> Node {
        let transport = network.join(peer);
        let protocol = MuSigProtocol::new();
        protocol
            .initialize(Arc::new(transport.clone()), config)
            .await
            .unwrap();
        let key = PrivateKey::generate();
        protocol.register_signer_key(key.public_key());
        let events = protocol.subscribe_events().await.unwrap();
        Node {
            protocol,
            transport,
            key,
            events,
        }
    }

    async fn wait_for<F>(events: &mut broadcast::Receiver<ProtocolEvent>, mut matches: F) -> ProtocolEvent
    where
        F: FnMut(&ProtocolEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                match events.recv().await {
                    Ok(event) if matches(&event) => return event,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event bus closed: {}", e),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn is_ready(session_id: &str) -> impl FnMut(&ProtocolEvent) -> bool + '_ {
        move |event| matches!(event, ProtocolEvent::SessionReady { session_id: id } if id == session_id)
    }

    fn is_announced(session_id: &str) -> impl FnMut(&ProtocolEvent) -> bool + '_ {
        move |event| matches!(event, ProtocolEvent::SessionAnnounced { session_id: id } if id == session_id)
    }

    fn is_nonces_complete(session_id: &str) -> impl FnMut(&ProtocolEvent) -> bool + '_ {
        move |event| matches!(event, ProtocolEvent::NoncesComplete { session_id: id } if id == session_id)
    }

    fn is_complete(session_id: &str) -> impl FnMut(&ProtocolEvent) -> bool + '_ {
        move |event| matches!(event, ProtocolEvent::SessionComplete { session_id: id, .. } if id == session_id)
    }

    fn is_aborted(session_id: &str) -> impl FnMut(&ProtocolEvent) -> bool + '_ {
        move |event| matches!(event, ProtocolEvent::SessionAborted { session_id: id, .. } if id == session_id)
    }

    /// Create, announce and have every other node join. Returns the session id.
    async fn start_session(nodes: &mut [Node], message: &[u8]) -> String {
        let participants: Vec<PublicKey> = nodes.iter().map(|n| n.public_key()).collect();
        let session = nodes[0]
            .protocol
            .create_session(&nodes[0].key, &participants, message, SessionMetadata::default())
            .await
            .unwrap();
        let session_id = session.session_id;
        nodes[0].protocol.announce_session(&session_id).await.unwrap();

        for node in nodes[1..].iter_mut() {
            wait_for(&mut node.events, is_announced(&session_id)).await;
            node.protocol.join_session(&session_id, &node.key).await.unwrap();
        }
        for node in nodes.iter_mut() {
            wait_for(&mut node.events, is_ready(&session_id)).await;
        }
        session_id
    }

    async fn exchange_nonces(nodes: &mut [Node], session_id: &str) {
        for node in nodes.iter() {
            node.protocol.share_nonces(session_id).await.unwrap();
        }
        for node in nodes.iter_mut() {
            wait_for(&mut node.events, is_nonces_complete(session_id)).await;
        }
    }

    async fn run_to_completion(nodes: &mut [Node], session_id: &str) -> Vec<u8> {
        exchange_nonces(nodes, session_id).await;
        for node in nodes.iter() {
            node.protocol
                .share_partial_signature(session_id, &node.key)
                .await
                .unwrap();
        }
        let mut signature = Vec::new();
        for node in nodes.iter_mut() {
            match wait_for(&mut node.events, is_complete(session_id)).await {
                ProtocolEvent::SessionComplete { signature: sig, .. } => signature = sig,
                _ => unreachable!(),
            }
        }
        signature
    }

    #[tokio::test]
    async fn test_two_party_session_completes() {
        let network = MemoryNetwork::new();
        let mut nodes = vec![
            node(&network, "alice", ProtocolConfig::default()).await,
            node(&network, "bob", ProtocolConfig::default()).await,
        ];
        let message = b"send 0.1 to bc1q...";

        let session_id = start_session(&mut nodes, message).await;
        let signature = run_to_completion(&mut nodes, &session_id).await;
        assert_eq!(signature.len(), musig::SIGNATURE_LEN);

        let keys: Vec<PublicKey> = nodes.iter().map(|n| n.public_key()).collect();
        let wallet = nodes[0].protocol.shared_wallet(&keys).unwrap();
        assert!(musig::verify_signature(wallet.aggregated_key(), &signature, message));

        for node in &nodes {
            let session = node.protocol.get_session(&session_id).await.unwrap().unwrap();
            assert_eq!(session.state, SessionState::Complete);
            assert_eq!(session.final_signature.as_deref(), Some(signature.as_slice()));
            assert_eq!(&session.aggregated_key, wallet.aggregated_key());
            assert!(node.protocol.can_finalize_session(&session_id).await.unwrap());
            // Idempotent
            assert_eq!(
                node.protocol.finalize_session(&session_id).await.unwrap(),
                signature
            );
        }
    }

    #[tokio::test]
    async fn test_join_by_id_fetches_descriptor() {
        let network = MemoryNetwork::new();
        let alice = node(&network, "alice", ProtocolConfig::default()).await;
        // Bob never registered his key, so the announcement is not tracked
        let bob_protocol = MuSigProtocol::new();
        bob_protocol
            .initialize(Arc::new(network.join("bob")), ProtocolConfig::default())
            .await
            .unwrap();
        let bob_key = PrivateKey::generate();
        let mut bob_events = bob_protocol.subscribe_events().await.unwrap();
        let mut alice_events = alice.protocol.subscribe_events().await.unwrap();

        let session = alice
            .protocol
            .create_session(&alice.key, &[bob_key.public_key()], b"m", SessionMetadata::default())
            .await
            .unwrap();
        alice.protocol.announce_session(&session.session_id).await.unwrap();
        assert!(bob_protocol.get_session(&session.session_id).await.unwrap().is_none());

        let joined = bob_protocol
            .join_session(&session.session_id, &bob_key)
            .await
            .unwrap();
        assert_eq!(joined.local_key, bob_key.public_key());
        assert!(!joined.is_initiator);

        wait_for(&mut alice_events, is_ready(&session.session_id)).await;
        wait_for(&mut bob_events, is_ready(&session.session_id)).await;
    }

    #[tokio::test]
    async fn test_join_unknown_session_not_found() {
        let network = MemoryNetwork::new();
        let config = ProtocolConfig {
            resource_lookup_timeout_ms: 100,
            ..ProtocolConfig::default()
        };
        let bob = node(&network, "bob", config).await;
        assert!(matches!(
            bob.protocol.join_session("missing", &bob.key).await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_participant_times_out() {
        let network = MemoryNetwork::new();
        let config = ProtocolConfig {
            join_timeout_secs: 5,
            ..ProtocolConfig::default()
        };
        let mut alice = node(&network, "alice", config.clone()).await;
        let mut bob = node(&network, "bob", config.clone()).await;
        let carol = PrivateKey::generate().public_key();

        let session = alice
            .protocol
            .create_session(
                &alice.key,
                &[bob.public_key(), carol],
                b"three of three",
                SessionMetadata::default(),
            )
            .await
            .unwrap();
        let session_id = session.session_id;
        alice.protocol.announce_session(&session_id).await.unwrap();
        wait_for(&mut bob.events, is_announced(&session_id)).await;
        bob.protocol.join_session(&session_id, &bob.key).await.unwrap();

        let event = wait_for(&mut alice.events, |event| {
            matches!(event, ProtocolEvent::SessionTimeout { session_id: id, .. } if id == &session_id)
        })
        .await;
        match event {
            ProtocolEvent::SessionTimeout { reason, .. } => assert!(reason.contains("join")),
            _ => unreachable!(),
        }

        let session = alice.protocol.get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Timeout);
        assert!(session.final_signature.is_none());
        assert!(session.failure_reason.is_some());
        assert!(matches!(
            alice.protocol.finalize_session(&session_id).await,
            Err(Error::Timeout(ref reason)) if reason.contains("join phase")
        ));
        assert!(matches!(
            alice.protocol.share_nonces(&session_id).await,
            Err(Error::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_partial_aborts_everyone() {
        let network = MemoryNetwork::new();
        let mut nodes = vec![
            node(&network, "alice", ProtocolConfig::default()).await,
            node(&network, "bob", ProtocolConfig::default()).await,
            node(&network, "carol", ProtocolConfig::default()).await,
        ];
        let session_id = start_session(&mut nodes, b"spend").await;
        exchange_nonces(&mut nodes, &session_id).await;

        // Carol sends garbage to alice only; bob learns of it from the abort
        let carol_key = nodes[2].public_key();
        let forged = ProtocolMessage::new(
            Some(session_id.clone()),
            carol_key,
            u64::MAX / 2,
            MessagePayload::PartialSignature {
                partial_signature: vec![7u8; 32],
            },
        );
        nodes[2]
            .transport
            .send_to_peer(&"alice".to_string(), forged.encode().unwrap())
            .await
            .unwrap();

        for node in nodes.iter_mut() {
            wait_for(&mut node.events, is_aborted(&session_id)).await;
        }

        for node in &nodes[..2] {
            let session = node.protocol.get_session(&session_id).await.unwrap().unwrap();
            assert_eq!(session.state, SessionState::Aborted);
            assert_eq!(session.offending_participant, Some(carol_key));
            assert!(session.failure_reason.unwrap().contains(&carol_key.short()));
        }
        let carol = nodes[2].protocol.get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(carol.state, SessionState::Aborted);

        assert!(matches!(
            nodes[1].protocol.share_partial_signature(&session_id, &nodes[1].key).await,
            Err(Error::PhaseOrderViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_outsider_cannot_abort_or_frame_participants() {
        let network = MemoryNetwork::new();
        let mut nodes = vec![
            node(&network, "alice", ProtocolConfig::default()).await,
            node(&network, "bob", ProtocolConfig::default()).await,
            node(&network, "carol", ProtocolConfig::default()).await,
        ];
        let session_id = start_session(&mut nodes, b"spend").await;
        let mallory = network.join("mallory");
        let topic = session_topic(&session_id);

        // Abort under alice's key with a sequence meant to stale her real traffic
        let abort = ProtocolMessage::new(
            Some(session_id.clone()),
            nodes[0].public_key(),
            u64::MAX,
            MessagePayload::Abort {
                reason: "forged".into(),
                offender: Some(nodes[1].public_key()),
            },
        );
        mallory
            .publish_to_topic(&topic, abort.encode().unwrap())
            .await
            .unwrap();

        // A well-formed nonce under bob's key, so bob's real one would conflict
        let alice_session = nodes[0].protocol.get_session(&session_id).await.unwrap().unwrap();
        let nonce = ProtocolMessage::new(
            Some(session_id.clone()),
            nodes[1].public_key(),
            u64::MAX,
            MessagePayload::Nonce {
                nonce: alice_session.local_nonce.unwrap(),
            },
        );
        mallory
            .publish_to_topic(&topic, nonce.encode().unwrap())
            .await
            .unwrap();

        let signature = run_to_completion(&mut nodes, &session_id).await;
        assert_eq!(signature.len(), musig::SIGNATURE_LEN);
        for node in &nodes {
            let session = node.protocol.get_session(&session_id).await.unwrap().unwrap();
            assert_eq!(session.state, SessionState::Complete);
            assert!(session.offending_participant.is_none());
        }
    }

    #[tokio::test]
    async fn test_abort_propagates() {
        let network = MemoryNetwork::new();
        let mut nodes = vec![
            node(&network, "alice", ProtocolConfig::default()).await,
            node(&network, "bob", ProtocolConfig::default()).await,
        ];
        let session_id = start_session(&mut nodes, b"cancel me").await;

        nodes[1]
            .protocol
            .abort_session(&session_id, "changed my mind")
            .await
            .unwrap();
        match wait_for(&mut nodes[0].events, is_aborted(&session_id)).await {
            ProtocolEvent::SessionAborted { reason, offender, .. } => {
                assert!(reason.contains("changed my mind"));
                assert!(offender.is_none());
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_sessions_for_same_content_use_fresh_nonces() {
        let network = MemoryNetwork::new();
        let mut nodes = vec![
            node(&network, "alice", ProtocolConfig::default()).await,
            node(&network, "bob", ProtocolConfig::default()).await,
        ];
        let participants: Vec<PublicKey> = nodes.iter().map(|n| n.public_key()).collect();
        let message = b"same message";

        let first = start_session(&mut nodes, message).await;
        // A live session holds the content
        assert!(matches!(
            nodes[0]
                .protocol
                .create_session(&nodes[0].key, &participants, message, SessionMetadata::default())
                .await,
            Err(Error::DuplicateSession(id)) if id == first
        ));
        run_to_completion(&mut nodes, &first).await;

        let second = start_session(&mut nodes, message).await;
        assert_ne!(first, second);
        exchange_nonces(&mut nodes, &second).await;

        for node in &nodes {
            let a = node.protocol.get_session(&first).await.unwrap().unwrap();
            let b = node.protocol.get_session(&second).await.unwrap().unwrap();
            assert!(a.local_nonce.is_some());
            assert_ne!(a.local_nonce, b.local_nonce);
        }
    }

    #[tokio::test]
    async fn test_phase_order_enforced() {
        let network = MemoryNetwork::new();
        let mut nodes = vec![
            node(&network, "alice", ProtocolConfig::default()).await,
            node(&network, "bob", ProtocolConfig::default()).await,
        ];
        let session_id = start_session(&mut nodes, b"ordered").await;

        assert!(!nodes[0].protocol.can_finalize_session(&session_id).await.unwrap());
        assert!(matches!(
            nodes[0].protocol.finalize_session(&session_id).await,
            Err(Error::PhaseOrderViolation(_))
        ));

        nodes[0].protocol.share_nonces(&session_id).await.unwrap();
        assert!(matches!(
            nodes[0].protocol.share_nonces(&session_id).await,
            Err(Error::NonceAlreadyShared(_))
        ));
        assert!(matches!(
            nodes[0]
                .protocol
                .share_partial_signature(&session_id, &nodes[0].key)
                .await,
            Err(Error::PhaseOrderViolation(_))
        ));
        assert!(matches!(
            nodes[0].protocol.can_finalize_session("missing").await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let network = MemoryNetwork::new();
        let protocol = MuSigProtocol::new();
        let key = PrivateKey::generate();

        assert!(matches!(
            protocol
                .create_session(&key, &[PrivateKey::generate().public_key()], b"m", SessionMetadata::default())
                .await,
            Err(Error::NotInitialized(_))
        ));
        assert!(matches!(
            protocol.discover_signers(&SignerCriteria::any()).await,
            Err(Error::NotInitialized(_))
        ));

        let offline = network.join("offline");
        network.disconnect("offline");
        assert!(matches!(
            protocol
                .initialize(Arc::new(offline), ProtocolConfig::default())
                .await,
            Err(Error::NotInitialized(_))
        ));

        let bad = ProtocolConfig {
            join_timeout_secs: 0,
            ..ProtocolConfig::default()
        };
        assert!(matches!(
            protocol.initialize(Arc::new(network.join("a")), bad).await,
            Err(Error::InvalidConfig(_))
        ));

        let transport = Arc::new(network.join("alice"));
        protocol
            .initialize(transport.clone(), ProtocolConfig::default())
            .await
            .unwrap();
        assert!(matches!(
            protocol
                .initialize(transport.clone(), ProtocolConfig::default())
                .await,
            Err(Error::AlreadyInitialized)
        ));
        assert_eq!(protocol.local_peer_id().await.unwrap(), "alice");

        let session = protocol
            .create_session(&key, &[PrivateKey::generate().public_key()], b"m", SessionMetadata::default())
            .await
            .unwrap();
        protocol.shutdown().await.unwrap();
        assert!(!protocol.is_initialized().await);
        assert!(matches!(
            protocol.get_session(&session.session_id).await,
            Err(Error::NotInitialized(_))
        ));

        protocol
            .initialize(transport, ProtocolConfig::default())
            .await
            .unwrap();
        assert!(protocol.get_all_sessions().await.unwrap().is_empty());
        protocol.shutdown().await.unwrap();
        protocol.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_aborts_live_sessions() {
        let network = MemoryNetwork::new();
        let mut nodes = vec![
            node(&network, "alice", ProtocolConfig::default()).await,
            node(&network, "bob", ProtocolConfig::default()).await,
        ];
        let session_id = start_session(&mut nodes, b"bye").await;

        nodes[0].protocol.shutdown().await.unwrap();
        match wait_for(&mut nodes[1].events, is_aborted(&session_id)).await {
            ProtocolEvent::SessionAborted { reason, .. } => assert!(reason.contains("shut down")),
            _ => unreachable!(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_advertisement_not_discovered() {
        let network = MemoryNetwork::new();
        let alice = node(&network, "alice", ProtocolConfig::default()).await;
        let bob = node(&network, "bob", ProtocolConfig::default()).await;

        alice
            .protocol
            .advertise_signer(
                alice.public_key(),
                BTreeSet::from([TransactionCategory::Spend]),
                AdvertiseOptions {
                    ttl_secs: Some(60),
                    ..AdvertiseOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            bob.protocol.discover_signers(&SignerCriteria::any()).await.unwrap().len(),
            1
        );

        // No re-advertisement gets through once alice is gone
        network.disconnect("alice");
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(bob
            .protocol
            .discover_signers(&SignerCriteria::any())
            .await
            .unwrap()
            .is_empty());
    }
}
