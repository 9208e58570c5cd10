//! Peer-to-peer transport seam
//!
//! The protocol never manages connections itself. Everything it needs from
//! the network goes through [`Transport`]: topic pub/sub, direct peer
//! messages, a TTL resource registry and peer connectivity events.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::types::PeerId;
use crate::Result;

pub use ::async_trait::async_trait;

/// Inbound message delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub from: PeerId,
    /// Topic the message arrived on; `None` for direct messages
    pub topic: Option<String>,
    pub payload: Vec<u8>,
}

/// Stream of inbound messages for one subscription
pub type Inbox = mpsc::UnboundedReceiver<TransportMessage>;

/// A named record registered with the transport's resource registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub resource_type: String,
    pub resource_id: String,
    pub owner: PeerId,
    pub payload: Vec<u8>,
}

/// Options for [`Transport::announce_resource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceOptions {
    pub ttl: Duration,
}

impl AnnounceOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl }
    }
}

/// Peer connectivity change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

/// Transport collaborator consumed by the protocol
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identifier other peers address us by
    fn local_peer_id(&self) -> PeerId;

    /// Whether the transport can currently carry traffic
    fn is_ready(&self) -> bool;

    /// Publish to every subscriber of a topic except ourselves
    async fn publish_to_topic(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Start receiving a topic's messages
    async fn subscribe_to_topic(&self, topic: &str) -> Result<Inbox>;

    /// Stop receiving a topic's messages; the matching inbox closes
    async fn unsubscribe_from_topic(&self, topic: &str) -> Result<()>;

    /// Send a message to one peer
    async fn send_to_peer(&self, peer: &PeerId, payload: Vec<u8>) -> Result<()>;

    /// Messages sent directly to us
    async fn direct_inbox(&self) -> Result<Inbox>;

    /// Register or replace a resource for `options.ttl`
    async fn announce_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
        payload: Vec<u8>,
        options: AnnounceOptions,
    ) -> Result<()>;

    /// Remove a resource we registered; removing a missing one is not an error
    async fn withdraw_resource(&self, resource_type: &str, resource_id: &str) -> Result<()>;

    /// Look up one resource, waiting up to `timeout` for it to appear
    async fn discover_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
        timeout: Duration,
    ) -> Result<Option<Resource>>;

    /// Every live resource of a type known to this node
    async fn get_local_resources(&self, resource_type: &str) -> Result<Vec<Resource>>;

    /// Connectivity events
    fn peer_events(&self) -> broadcast::Receiver<PeerEvent>;
}

/// In-memory network for tests and single-process demos
pub mod memory;

mod retry;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use retry::with_retry;
