//! Message Relay Client
//!
//! [`Transport`] implementation backed by the relay service: topic and
//! direct traffic over one websocket, resources over HTTP.

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use msg_relay::{b64, RelayFrame, StoredResource};
use musig_p2p_core::transport::{
    async_trait, AnnounceOptions, Inbox, PeerEvent, Resource, Transport, TransportMessage,
};
use musig_p2p_core::{Error, PeerId, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

/// Interval between registry polls while waiting for a resource
const DISCOVER_POLL: Duration = Duration::from_millis(200);

#[derive(Default)]
struct Routes {
    topics: DashMap<String, mpsc::UnboundedSender<TransportMessage>>,
    direct: Mutex<Option<mpsc::UnboundedSender<TransportMessage>>>,
}

/// Relay-backed transport
pub struct RelayTransport {
    /// HTTP client
    client: Client,
    /// Relay service URL
    url: String,
    /// This node's peer id
    peer_id: PeerId,
    /// Request timeout
    timeout: Duration,
    outbound: mpsc::UnboundedSender<RelayFrame>,
    routes: Arc<Routes>,
    peer_events: broadcast::Sender<PeerEvent>,
    connected: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayTransport {
    /// Open the websocket to the relay at `url` (http or https) as `peer_id`
    #[instrument]
    pub async fn connect(url: &str, peer_id: &str) -> Result<Self> {
        let url = url.trim_end_matches('/').to_string();
        let ws_url = format!("{}/v1/ws?peer_id={}", websocket_base(&url), peer_id);

        let (socket, _) = tokio_tungstenite::connect_async(ws_url.as_str())
            .await
            .map_err(|e| Error::Network(format!("websocket connect to {}: {}", ws_url, e)))?;
        let (mut sink, mut stream) = socket.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let routes = Arc::new(Routes::default());
        let (peer_events, _) = broadcast::channel(64);
        let connected = Arc::new(AtomicBool::new(true));

        let writer_connected = connected.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(error = %e, "Relay connection lost while sending");
                    writer_connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        let reader_routes = routes.clone();
        let reader_events = peer_events.clone();
        let reader_connected = connected.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => route_frame(&reader_routes, &reader_events, &text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Relay connection error");
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            info!("Relay connection closed");
        });

        info!(peer = %peer_id, relay = %url, "Connected to relay");
        Ok(Self {
            client: Client::new(),
            url,
            peer_id: peer_id.to_string(),
            timeout: Duration::from_secs(30),
            outbound,
            routes,
            peer_events,
            connected,
            tasks: vec![writer, reader],
        })
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn send_frame(&self, frame: RelayFrame) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::Network("relay connection is closed".into()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| Error::Network("relay writer stopped".into()))
    }

    fn resource_url(&self, resource_type: &str, resource_id: &str) -> String {
        format!("{}/v1/resources/{}/{}", self.url, resource_type, resource_id)
    }

    async fn fetch_resource(&self, resource_type: &str, resource_id: &str) -> Result<Option<Resource>> {
        let response = self
            .client
            .get(self.resource_url(resource_type, resource_id))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "GET resource failed with status: {}",
                response.status()
            )));
        }

        let body: ResourceResponse = response
            .json()
            .await
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        Ok(body.resource.filter(|_| body.found).map(into_resource))
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }

    fn is_ready(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish_to_topic(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.send_frame(RelayFrame::Publish {
            topic: topic.to_string(),
            payload,
        })
    }

    async fn subscribe_to_topic(&self, topic: &str) -> Result<Inbox> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.topics.insert(topic.to_string(), tx);
        self.send_frame(RelayFrame::Subscribe {
            topic: topic.to_string(),
        })?;
        debug!(topic, "Subscribed");
        Ok(rx)
    }

    async fn unsubscribe_from_topic(&self, topic: &str) -> Result<()> {
        self.routes.topics.remove(topic);
        self.send_frame(RelayFrame::Unsubscribe {
            topic: topic.to_string(),
        })
    }

    async fn send_to_peer(&self, peer: &PeerId, payload: Vec<u8>) -> Result<()> {
        self.send_frame(RelayFrame::Direct {
            to: peer.clone(),
            payload,
        })
    }

    async fn direct_inbox(&self) -> Result<Inbox> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut direct = self
            .routes
            .direct
            .lock()
            .map_err(|_| Error::Internal("direct route lock poisoned".into()))?;
        *direct = Some(tx);
        Ok(rx)
    }

    #[instrument(skip(self, payload))]
    async fn announce_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
        payload: Vec<u8>,
        options: AnnounceOptions,
    ) -> Result<()> {
        let req = PutResourceRequest {
            owner: self.peer_id.clone(),
            payload: b64::encode(&payload),
            ttl_secs: i64::try_from(options.ttl.as_secs().max(1)).unwrap_or(i64::MAX),
        };

        let response = self
            .client
            .put(self.resource_url(resource_type, resource_id))
            .json(&req)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "PUT resource failed with status: {}",
                response.status()
            )));
        }

        debug!(resource_type, resource_id, "Resource announced");
        Ok(())
    }

    async fn withdraw_resource(&self, resource_type: &str, resource_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.resource_url(resource_type, resource_id))
            .query(&[("owner", self.peer_id.as_str())])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            status => Err(Error::Network(format!(
                "DELETE resource failed with status: {}",
                status
            ))),
        }
    }

    async fn discover_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
        timeout: Duration,
    ) -> Result<Option<Resource>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(resource) = self.fetch_resource(resource_type, resource_id).await? {
                return Ok(Some(resource));
            }
            if tokio::time::Instant::now() + DISCOVER_POLL > deadline {
                return Ok(None);
            }
            tokio::time::sleep(DISCOVER_POLL).await;
        }
    }

    async fn get_local_resources(&self, resource_type: &str) -> Result<Vec<Resource>> {
        let response = self
            .client
            .get(format!("{}/v1/resources/{}", self.url, resource_type))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "GET resources failed with status: {}",
                response.status()
            )));
        }

        let resources: Vec<StoredResource> = response
            .json()
            .await
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        Ok(resources.into_iter().map(into_resource).collect())
    }

    fn peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.peer_events.subscribe()
    }
}

/// Hand an inbound frame to the inbox it belongs to
fn route_frame(routes: &Routes, peer_events: &broadcast::Sender<PeerEvent>, text: &str) {
    let frame: RelayFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Dropping malformed relay frame");
            return;
        }
    };

    match frame {
        RelayFrame::Deliver {
            from,
            topic: Some(topic),
            payload,
        } => {
            if let Some(inbox) = routes.topics.get(&topic) {
                let _ = inbox.send(TransportMessage {
                    from,
                    topic: Some(topic.clone()),
                    payload,
                });
            }
        }
        RelayFrame::Deliver {
            from,
            topic: None,
            payload,
        } => {
            let direct = routes.direct.lock().ok().and_then(|d| d.clone());
            if let Some(inbox) = direct {
                let _ = inbox.send(TransportMessage {
                    from,
                    topic: None,
                    payload,
                });
            }
        }
        RelayFrame::PeerJoined { peer_id } => {
            let _ = peer_events.send(PeerEvent::Connected(peer_id));
        }
        RelayFrame::PeerLeft { peer_id } => {
            let _ = peer_events.send(PeerEvent::Disconnected(peer_id));
        }
        RelayFrame::Error { message } => warn!(error = %message, "Relay reported an error"),
        other => debug!(frame = ?other, "Ignoring unexpected relay frame"),
    }
}

fn into_resource(stored: StoredResource) -> Resource {
    Resource {
        resource_type: stored.key.resource_type,
        resource_id: stored.key.resource_id,
        owner: stored.owner,
        payload: stored.payload,
    }
}

/// `http://host` -> `ws://host`, `https://host` -> `wss://host`
fn websocket_base(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        url.to_string()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PutResourceRequest {
    owner: String,
    payload: String,
    ttl_secs: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResourceResponse {
    found: bool,
    resource: Option<StoredResource>,
}
