//! Message Relay Library
//!
//! Core of the reference relay that stands in for the peer-to-peer layer.
//! Provides topic pub/sub and direct delivery between connected peers, plus
//! a resource registry whose entries expire after a TTL.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Relay error types
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Peer not connected: {0}")]
    PeerNotConnected(String),
    #[error("Resource {0} is owned by another peer")]
    NotOwner(String),
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Resource identifier
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: String,
    pub resource_id: String,
}

impl ResourceKey {
    pub fn new(resource_type: &str, resource_id: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
        }
    }

    /// Compute hash for lookup
    pub fn hash(&self) -> String {
        let data = format!("{}:{}", self.resource_type, self.resource_id);
        hex::encode(blake3::hash(data.as_bytes()).as_bytes())
    }
}

/// Stored resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResource {
    pub key: ResourceKey,
    /// Peer that registered the resource
    pub owner: String,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl StoredResource {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// TTL resource registry
#[derive(Clone)]
pub struct ResourceStore {
    /// Resources indexed by key hash
    resources: Arc<DashMap<String, StoredResource>>,
    /// Upper bound on any requested TTL
    max_ttl_seconds: i64,
}

impl ResourceStore {
    pub fn new(max_ttl_seconds: i64) -> Self {
        Self {
            resources: Arc::new(DashMap::new()),
            max_ttl_seconds,
        }
    }

    /// Register or replace a resource. Replacing someone else's live
    /// resource is refused.
    pub fn put(&self, key: ResourceKey, owner: &str, payload: Vec<u8>, ttl_seconds: i64) -> Result<StoredResource> {
        let now = Utc::now();
        let hash = key.hash();
        if let Some(existing) = self.resources.get(&hash) {
            if existing.owner != owner && existing.is_live_at(now) {
                return Err(RelayError::NotOwner(hash));
            }
        }

        let ttl = ttl_seconds.clamp(1, self.max_ttl_seconds);
        let resource = StoredResource {
            key,
            owner: owner.to_string(),
            payload,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl),
        };
        self.resources.insert(hash, resource.clone());
        Ok(resource)
    }

    /// Live resource by key
    pub fn get(&self, key: &ResourceKey) -> Result<StoredResource> {
        let hash = key.hash();
        let now = Utc::now();
        self.resources
            .get(&hash)
            .filter(|entry| entry.is_live_at(now))
            .map(|entry| entry.value().clone())
            .ok_or(RelayError::NotFound(hash))
    }

    /// Remove a resource registered by `owner`. Removing a missing resource
    /// is not an error.
    pub fn remove(&self, key: &ResourceKey, owner: &str) -> Result<bool> {
        let hash = key.hash();
        if let Some(existing) = self.resources.get(&hash) {
            if existing.owner != owner {
                return Err(RelayError::NotOwner(hash));
            }
        }
        Ok(self.resources.remove(&hash).is_some())
    }

    /// Every live resource of one type
    pub fn list(&self, resource_type: &str) -> Vec<StoredResource> {
        let now = Utc::now();
        self.resources
            .iter()
            .filter(|entry| entry.key.resource_type == resource_type && entry.is_live_at(now))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Remove expired resources
    pub fn cleanup(&self) -> usize {
        let now = Utc::now();
        let before = self.resources.len();
        self.resources.retain(|_, v| v.is_live_at(now));
        before - self.resources.len()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl Default for ResourceStore {
    fn default() -> Self {
        Self::new(3600) // 1 hour max TTL
    }
}

/// WebSocket frame exchanged between the relay and its peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    // Peer -> relay
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        #[serde(with = "b64")]
        payload: Vec<u8>,
    },
    Direct {
        to: String,
        #[serde(with = "b64")]
        payload: Vec<u8>,
    },

    // Relay -> peer
    Deliver {
        from: String,
        /// `None` for direct messages
        topic: Option<String>,
        #[serde(with = "b64")]
        payload: Vec<u8>,
    },
    PeerJoined {
        peer_id: String,
    },
    PeerLeft {
        peer_id: String,
    },
    Error {
        message: String,
    },
}

struct Connection {
    id: u64,
    sender: mpsc::UnboundedSender<RelayFrame>,
}

/// Topic pub/sub and direct delivery between connected peers
#[derive(Clone, Default)]
pub struct TopicHub {
    peers: Arc<DashMap<String, Connection>>,
    topics: Arc<DashMap<String, DashSet<String>>>,
    next_connection: Arc<AtomicU64>,
}

impl TopicHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer connection. A newer connection for the same peer
    /// replaces the old one. Returns the connection id and its outbound
    /// frame stream.
    pub fn connect(&self, peer_id: &str) -> (u64, mpsc::UnboundedReceiver<RelayFrame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .peers
            .insert(peer_id.to_string(), Connection { id, sender })
            .is_some();

        if !replaced {
            self.notify_others(peer_id, RelayFrame::PeerJoined {
                peer_id: peer_id.to_string(),
            });
        }
        debug!(peer = %peer_id, connection = id, replaced, "peer connected");
        (id, receiver)
    }

    /// Drop a peer connection, unless it was already replaced by a newer one
    pub fn disconnect(&self, peer_id: &str, connection: u64) -> bool {
        let removed = self
            .peers
            .remove_if(peer_id, |_, current| current.id == connection)
            .is_some();
        if !removed {
            return false;
        }

        for topic in self.topics.iter() {
            topic.value().remove(peer_id);
        }
        self.topics.retain(|_, members| !members.is_empty());
        self.notify_others(peer_id, RelayFrame::PeerLeft {
            peer_id: peer_id.to_string(),
        });
        debug!(peer = %peer_id, connection, "peer disconnected");
        true
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }

    pub fn subscribe(&self, peer_id: &str, topic: &str) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(peer_id.to_string());
    }

    pub fn unsubscribe(&self, peer_id: &str, topic: &str) {
        if let Some(members) = self.topics.get(topic) {
            members.remove(peer_id);
        }
        self.topics.remove_if(topic, |_, members| members.is_empty());
    }

    /// Deliver to every subscriber except the sender. Returns the number of
    /// peers reached.
    pub fn publish(&self, from: &str, topic: &str, payload: Vec<u8>) -> usize {
        let Some(members) = self.topics.get(topic) else {
            return 0;
        };
        let targets: Vec<String> = members
            .iter()
            .map(|m| m.key().clone())
            .filter(|peer| peer != from)
            .collect();
        drop(members);

        let mut delivered = 0;
        for peer in targets {
            let frame = RelayFrame::Deliver {
                from: from.to_string(),
                topic: Some(topic.to_string()),
                payload: payload.clone(),
            };
            if self.send_frame(&peer, frame) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn send_direct(&self, from: &str, to: &str, payload: Vec<u8>) -> Result<()> {
        let frame = RelayFrame::Deliver {
            from: from.to_string(),
            topic: None,
            payload,
        };
        if self.send_frame(to, frame) {
            Ok(())
        } else {
            Err(RelayError::PeerNotConnected(to.to_string()))
        }
    }

    /// Queue a frame for one peer; false when it is not connected
    pub fn send_frame(&self, peer_id: &str, frame: RelayFrame) -> bool {
        self.peers
            .get(peer_id)
            .map(|conn| conn.sender.send(frame).is_ok())
            .unwrap_or(false)
    }

    fn notify_others(&self, peer_id: &str, frame: RelayFrame) {
        for conn in self.peers.iter() {
            if conn.key() != peer_id {
                let _ = conn.sender.send(frame.clone());
            }
        }
    }
}

/// Base64 for byte payloads inside JSON bodies
pub mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(s)
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_key_hash() {
        let k1 = ResourceKey::new("musig2-signer", "ad-1");
        let k2 = ResourceKey::new("musig2-signer", "ad-1");
        let k3 = ResourceKey::new("musig2-session", "ad-1");

        assert_eq!(k1.hash(), k2.hash());
        assert_ne!(k1.hash(), k3.hash());
    }

    #[test]
    fn test_resource_store() {
        let store = ResourceStore::new(3600);
        let key = ResourceKey::new("musig2-signer", "ad-1");

        store.put(key.clone(), "alice", vec![1, 2, 3], 60).unwrap();
        assert_eq!(store.get(&key).unwrap().payload, vec![1, 2, 3]);
        assert_eq!(store.list("musig2-signer").len(), 1);
        assert!(store.list("musig2-session").is_empty());

        // Only the owner may replace or remove it
        assert!(matches!(
            store.put(key.clone(), "mallory", vec![9], 60),
            Err(RelayError::NotOwner(_))
        ));
        assert!(matches!(store.remove(&key, "mallory"), Err(RelayError::NotOwner(_))));

        assert!(store.remove(&key, "alice").unwrap());
        assert!(!store.remove(&key, "alice").unwrap());
        assert!(matches!(store.get(&key), Err(RelayError::NotFound(_))));
    }

    #[test]
    fn test_expired_resources_hidden_and_cleaned() {
        let store = ResourceStore::new(3600);
        let key = ResourceKey::new("musig2-signer", "ad-1");
        let mut resource = store.put(key.clone(), "alice", vec![1], 60).unwrap();

        resource.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.resources.insert(key.hash(), resource);

        assert!(store.get(&key).is_err());
        assert!(store.list("musig2-signer").is_empty());
        // Someone else may take over an expired entry
        store.put(key.clone(), "bob", vec![2], 60).unwrap();
        assert_eq!(store.get(&key).unwrap().owner, "bob");
        assert_eq!(store.cleanup(), 0);
    }

    #[tokio::test]
    async fn test_topic_hub_delivery() {
        let hub = TopicHub::new();
        let (_, mut alice) = hub.connect("alice");
        let (_, mut bob) = hub.connect("bob");
        assert_eq!(
            alice.recv().await,
            Some(RelayFrame::PeerJoined {
                peer_id: "bob".into()
            })
        );

        hub.subscribe("alice", "t");
        hub.subscribe("bob", "t");
        assert_eq!(hub.publish("alice", "t", vec![7]), 1);
        assert_eq!(
            bob.recv().await,
            Some(RelayFrame::Deliver {
                from: "alice".into(),
                topic: Some("t".into()),
                payload: vec![7],
            })
        );

        hub.send_direct("bob", "alice", vec![8]).unwrap();
        assert!(matches!(
            alice.recv().await,
            Some(RelayFrame::Deliver { topic: None, .. })
        ));
        assert!(matches!(
            hub.send_direct("bob", "carol", vec![1]),
            Err(RelayError::PeerNotConnected(_))
        ));

        hub.unsubscribe("bob", "t");
        assert_eq!(hub.publish("alice", "t", vec![7]), 0);
    }

    #[tokio::test]
    async fn test_replaced_connection_survives_old_disconnect() {
        let hub = TopicHub::new();
        let (_, mut bob) = hub.connect("bob");
        let (old, _old_rx) = hub.connect("alice");
        let (new, _new_rx) = hub.connect("alice");
        assert!(matches!(bob.recv().await, Some(RelayFrame::PeerJoined { .. })));

        assert!(!hub.disconnect("alice", old));
        assert!(hub.is_connected("alice"));

        assert!(hub.disconnect("alice", new));
        assert_eq!(hub.peers(), vec!["bob".to_string()]);
        assert_eq!(
            bob.recv().await,
            Some(RelayFrame::PeerLeft {
                peer_id: "alice".into()
            })
        );
    }

    #[test]
    fn test_frame_encoding() {
        let frame = RelayFrame::Publish {
            topic: "t".into(),
            payload: vec![1, 2, 3],
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"publish\""));
        assert!(json.contains("AQID"));
        assert_eq!(serde_json::from_str::<RelayFrame>(&json).unwrap(), frame);
    }
}
