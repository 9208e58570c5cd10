//! In-memory transport implementation for testing

use super::{async_trait, AnnounceOptions, Inbox, PeerEvent, Resource, Transport, TransportMessage};
use crate::{Error, PeerId, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::debug;

type Subscribers = DashMap<PeerId, mpsc::UnboundedSender<TransportMessage>>;

struct StoredResource {
    resource: Resource,
    expires_at: Instant,
}

struct NetworkInner {
    /// Peer id -> online
    peers: DashMap<PeerId, bool>,
    /// Topic -> subscribed peers
    topics: DashMap<String, Subscribers>,
    /// Direct inbox per peer
    directs: DashMap<PeerId, mpsc::UnboundedSender<TransportMessage>>,
    /// (resource_type, resource_id) -> resource
    resources: DashMap<(String, String), StoredResource>,
    /// Wakes resource lookups
    notify: broadcast::Sender<()>,
    events: broadcast::Sender<PeerEvent>,
}

/// Shared hub all [`MemoryTransport`]s of one simulated network attach to
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(100);
        let (events, _) = broadcast::channel(100);
        Self {
            inner: Arc::new(NetworkInner {
                peers: DashMap::new(),
                topics: DashMap::new(),
                directs: DashMap::new(),
                resources: DashMap::new(),
                notify,
                events,
            }),
        }
    }

    /// Attach a peer and return its transport handle
    pub fn join(&self, peer_id: &str) -> MemoryTransport {
        self.inner.peers.insert(peer_id.to_string(), true);
        let _ = self.inner.events.send(PeerEvent::Connected(peer_id.to_string()));
        MemoryTransport {
            inner: self.inner.clone(),
            peer_id: peer_id.to_string(),
        }
    }

    /// Take a peer offline: it neither sends nor receives until reconnected
    pub fn disconnect(&self, peer_id: &str) {
        if let Some(mut online) = self.inner.peers.get_mut(peer_id) {
            *online = false;
        }
        let _ = self
            .inner
            .events
            .send(PeerEvent::Disconnected(peer_id.to_string()));
    }

    pub fn reconnect(&self, peer_id: &str) {
        if let Some(mut online) = self.inner.peers.get_mut(peer_id) {
            *online = true;
        }
        let _ = self.inner.events.send(PeerEvent::Connected(peer_id.to_string()));
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer's view of a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<NetworkInner>,
    peer_id: PeerId,
}

impl MemoryTransport {
    fn is_online(&self, peer: &str) -> bool {
        self.inner.peers.get(peer).map(|p| *p).unwrap_or(false)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_online(&self.peer_id) {
            Ok(())
        } else {
            Err(Error::Network(format!("peer {} is offline", self.peer_id)))
        }
    }

    fn live_resource(&self, key: &(String, String)) -> Option<Resource> {
        let now = Instant::now();
        let entry = self.inner.resources.get(key)?;
        if entry.expires_at > now {
            Some(entry.resource.clone())
        } else {
            drop(entry);
            self.inner.resources.remove(key);
            None
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }

    fn is_ready(&self) -> bool {
        self.is_online(&self.peer_id)
    }

    async fn publish_to_topic(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.ensure_online()?;

        let Some(subscribers) = self.inner.topics.get(topic) else {
            return Ok(());
        };

        let mut closed = Vec::new();
        for entry in subscribers.iter() {
            if entry.key() == &self.peer_id || !self.is_online(entry.key()) {
                continue;
            }
            let message = TransportMessage {
                from: self.peer_id.clone(),
                topic: Some(topic.to_string()),
                payload: payload.clone(),
            };
            if entry.value().send(message).is_err() {
                closed.push(entry.key().clone());
            }
        }
        for peer in closed {
            subscribers.remove(&peer);
        }

        Ok(())
    }

    async fn subscribe_to_topic(&self, topic: &str) -> Result<Inbox> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(self.peer_id.clone(), tx);
        debug!(peer = %self.peer_id, topic, "subscribed");
        Ok(rx)
    }

    async fn unsubscribe_from_topic(&self, topic: &str) -> Result<()> {
        if let Some(subscribers) = self.inner.topics.get(topic) {
            subscribers.remove(&self.peer_id);
        }
        Ok(())
    }

    async fn send_to_peer(&self, peer: &PeerId, payload: Vec<u8>) -> Result<()> {
        self.ensure_online()?;
        if !self.is_online(peer) {
            return Err(Error::Network(format!("peer {} is unreachable", peer)));
        }

        let inbox = self
            .inner
            .directs
            .get(peer)
            .ok_or_else(|| Error::Network(format!("peer {} has no direct inbox", peer)))?;
        inbox
            .send(TransportMessage {
                from: self.peer_id.clone(),
                topic: None,
                payload,
            })
            .map_err(|_| Error::Network(format!("peer {} closed its inbox", peer)))
    }

    async fn direct_inbox(&self) -> Result<Inbox> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.directs.insert(self.peer_id.clone(), tx);
        Ok(rx)
    }

    async fn announce_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
        payload: Vec<u8>,
        options: AnnounceOptions,
    ) -> Result<()> {
        self.ensure_online()?;

        let resource = Resource {
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            owner: self.peer_id.clone(),
            payload,
        };
        self.inner.resources.insert(
            (resource_type.to_string(), resource_id.to_string()),
            StoredResource {
                resource,
                expires_at: Instant::now() + options.ttl,
            },
        );

        let _ = self.inner.notify.send(());
        Ok(())
    }

    async fn withdraw_resource(&self, resource_type: &str, resource_id: &str) -> Result<()> {
        self.inner
            .resources
            .remove_if(&(resource_type.to_string(), resource_id.to_string()), |_, stored| {
                stored.resource.owner == self.peer_id
            });
        Ok(())
    }

    async fn discover_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
        timeout: Duration,
    ) -> Result<Option<Resource>> {
        let key = (resource_type.to_string(), resource_id.to_string());
        let deadline = Instant::now() + timeout;
        let mut rx = self.inner.notify.subscribe();

        loop {
            if let Some(resource) = self.live_resource(&key) {
                return Ok(Some(resource));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }

            // Wait for an announcement or poll again
            tokio::select! {
                _ = rx.recv() => continue,
                _ = tokio::time::sleep_until(deadline.min(Instant::now() + Duration::from_millis(100))) => continue,
            }
        }
    }

    async fn get_local_resources(&self, resource_type: &str) -> Result<Vec<Resource>> {
        let now = Instant::now();
        self.inner.resources.retain(|_, stored| stored.expires_at > now);

        Ok(self
            .inner
            .resources
            .iter()
            .filter(|entry| entry.key().0 == resource_type)
            .map(|entry| entry.resource.clone())
            .collect())
    }

    fn peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_other_subscribers_only() {
        let network = MemoryNetwork::new();
        let alice = network.join("alice");
        let bob = network.join("bob");

        let mut alice_inbox = alice.subscribe_to_topic("t").await.unwrap();
        let mut bob_inbox = bob.subscribe_to_topic("t").await.unwrap();

        alice.publish_to_topic("t", b"hello".to_vec()).await.unwrap();

        let received = bob_inbox.recv().await.unwrap();
        assert_eq!(received.from, "alice");
        assert_eq!(received.topic.as_deref(), Some("t"));
        assert_eq!(received.payload, b"hello");
        assert!(alice_inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_inbox() {
        let network = MemoryNetwork::new();
        let alice = network.join("alice");
        let bob = network.join("bob");

        let mut inbox = bob.subscribe_to_topic("t").await.unwrap();
        bob.unsubscribe_from_topic("t").await.unwrap();
        alice.publish_to_topic("t", vec![1]).await.unwrap();

        assert!(inbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_direct_messages() {
        let network = MemoryNetwork::new();
        let alice = network.join("alice");
        let bob = network.join("bob");

        assert!(alice.send_to_peer(&"bob".to_string(), vec![1]).await.is_err());

        let mut inbox = bob.direct_inbox().await.unwrap();
        alice.send_to_peer(&"bob".to_string(), vec![42]).await.unwrap();

        let message = inbox.recv().await.unwrap();
        assert_eq!(message.from, "alice");
        assert_eq!(message.topic, None);
        assert_eq!(message.payload, vec![42]);
    }

    #[tokio::test]
    async fn test_disconnected_peer_cannot_publish() {
        let network = MemoryNetwork::new();
        let alice = network.join("alice");
        let mut events = alice.peer_events();

        network.disconnect("alice");
        assert!(!alice.is_ready());
        assert!(matches!(
            alice.publish_to_topic("t", vec![]).await,
            Err(Error::Network(_))
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::Disconnected("alice".into())
        );

        network.reconnect("alice");
        assert!(alice.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resources_expire_after_ttl() {
        let network = MemoryNetwork::new();
        let alice = network.join("alice");
        let bob = network.join("bob");

        alice
            .announce_resource("kind", "r1", vec![9], AnnounceOptions::with_ttl(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(bob.get_local_resources("kind").await.unwrap().len(), 1);
        assert!(bob.get_local_resources("other").await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(bob.get_local_resources("kind").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_withdraw_only_removes_own_resources() {
        let network = MemoryNetwork::new();
        let alice = network.join("alice");
        let bob = network.join("bob");
        let ttl = AnnounceOptions::with_ttl(Duration::from_secs(60));

        alice.announce_resource("kind", "r1", vec![], ttl).await.unwrap();
        bob.withdraw_resource("kind", "r1").await.unwrap();
        assert_eq!(alice.get_local_resources("kind").await.unwrap().len(), 1);

        alice.withdraw_resource("kind", "r1").await.unwrap();
        assert!(alice.get_local_resources("kind").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discover_waits_for_late_announcement() {
        let network = MemoryNetwork::new();
        let alice = network.join("alice");
        let bob = network.join("bob");

        let lookup = tokio::spawn(async move {
            bob.discover_resource("kind", "late", Duration::from_secs(2))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        alice
            .announce_resource("kind", "late", vec![7], AnnounceOptions::with_ttl(Duration::from_secs(60)))
            .await
            .unwrap();

        let found = lookup.await.unwrap().unwrap();
        assert_eq!(found.owner, "alice");
        assert_eq!(found.payload, vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_times_out_with_none() {
        let network = MemoryNetwork::new();
        let bob = network.join("bob");

        let found = bob
            .discover_resource("kind", "missing", Duration::from_millis(300))
            .await
            .unwrap();
        assert!(found.is_none());
    }
}
