//! Message Relay Service
//!
//! HTTP/WebSocket relay standing in for the peer-to-peer network between
//! signer nodes: topic pub/sub and direct messages over a websocket, and a
//! TTL resource registry over HTTP.

use anyhow::Result;
use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use msg_relay::{b64, RelayError, RelayFrame, ResourceKey, ResourceStore, StoredResource, TopicHub};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn, Level};

/// Message relay service CLI arguments
#[derive(Parser, Debug)]
#[command(name = "msg-relay-svc")]
#[command(about = "Relay service for MuSig2 signer discovery and signing sessions")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8080", env = "RELAY_LISTEN")]
    listen: String,

    /// Upper bound on resource TTL in seconds
    #[arg(long, default_value = "3600")]
    max_ttl: i64,

    /// Seconds between expired-resource sweeps
    #[arg(long, default_value = "30")]
    cleanup_interval: u64,
}

/// Application state
struct AppState {
    resources: ResourceStore,
    hub: TopicHub,
}

/// Request to register a resource
#[derive(Debug, Serialize, Deserialize)]
struct PutResourceRequest {
    owner: String,
    payload: String, // base64 encoded
    ttl_secs: i64,
}

#[derive(Debug, Deserialize)]
struct OwnerQuery {
    owner: String,
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    peer_id: String,
}

/// Resource lookup response
#[derive(Debug, Serialize, Deserialize)]
struct ResourceResponse {
    found: bool,
    resource: Option<StoredResource>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.max_ttl > 0, "--max-ttl must be positive");

    info!(
        listen = %args.listen,
        max_ttl = args.max_ttl,
        "Starting message relay service"
    );

    let state = Arc::new(AppState {
        resources: ResourceStore::new(args.max_ttl),
        hub: TopicHub::new(),
    });

    // Spawn cleanup task
    let cleanup_store = state.resources.clone();
    let cleanup_every = std::time::Duration::from_secs(args.cleanup_interval.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_every);
        loop {
            interval.tick().await;
            let removed = cleanup_store.cleanup();
            if removed > 0 {
                debug!(removed, "expired resources removed");
            }
        }
    });

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(address = %args.listen, "Listening");

    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/peers", get(list_peers))
        .route("/v1/resources/:resource_type", get(list_resources))
        .route(
            "/v1/resources/:resource_type/:resource_id",
            get(get_resource).put(put_resource).delete(delete_resource),
        )
        .route("/v1/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "msg-relay-svc",
        "version": env!("CARGO_PKG_VERSION"),
        "peers": state.hub.peers().len(),
        "resources": state.resources.len(),
    }))
}

async fn list_peers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.hub.peers())
}

/// Register or refresh a resource
async fn put_resource(
    State(state): State<Arc<AppState>>,
    Path((resource_type, resource_id)): Path<(String, String)>,
    Json(req): Json<PutResourceRequest>,
) -> impl IntoResponse {
    let payload = match b64::decode(&req.payload) {
        Ok(p) => p,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("Invalid base64: {}", e) })),
            );
        }
    };

    let key = ResourceKey::new(&resource_type, &resource_id);
    match state.resources.put(key, &req.owner, payload, req.ttl_secs) {
        Ok(resource) => {
            debug!(
                resource_type = %resource_type,
                resource_id = %resource_id,
                owner = %req.owner,
                expires_at = %resource.expires_at,
                "Resource stored"
            );
            (
                StatusCode::OK,
                Json(serde_json::json!({ "expires_at": resource.expires_at })),
            )
        }
        Err(e) => (error_status(&e), Json(serde_json::json!({ "error": e.to_string() }))),
    }
}

async fn get_resource(
    State(state): State<Arc<AppState>>,
    Path((resource_type, resource_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let key = ResourceKey::new(&resource_type, &resource_id);
    match state.resources.get(&key) {
        Ok(resource) => Json(ResourceResponse {
            found: true,
            resource: Some(resource),
        }),
        Err(_) => Json(ResourceResponse {
            found: false,
            resource: None,
        }),
    }
}

async fn list_resources(
    State(state): State<Arc<AppState>>,
    Path(resource_type): Path<String>,
) -> impl IntoResponse {
    Json(state.resources.list(&resource_type))
}

async fn delete_resource(
    State(state): State<Arc<AppState>>,
    Path((resource_type, resource_id)): Path<(String, String)>,
    Query(query): Query<OwnerQuery>,
) -> impl IntoResponse {
    let key = ResourceKey::new(&resource_type, &resource_id);
    match state.resources.remove(&key, &query.owner) {
        Ok(removed) => (StatusCode::OK, Json(serde_json::json!({ "removed": removed }))),
        Err(e) => (error_status(&e), Json(serde_json::json!({ "error": e.to_string() }))),
    }
}

fn error_status(error: &RelayError) -> StatusCode {
    match error {
        RelayError::NotFound(_) | RelayError::PeerNotConnected(_) => StatusCode::NOT_FOUND,
        RelayError::NotOwner(_) => StatusCode::FORBIDDEN,
        RelayError::InvalidFormat(_) => StatusCode::BAD_REQUEST,
        RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// WebSocket handler for topic and direct traffic
async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, query.peer_id))
}

async fn handle_websocket(
    socket: axum::extract::ws::WebSocket,
    state: Arc<AppState>,
    peer_id: String,
) {
    use axum::extract::ws::Message;
    use futures_util::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let (connection, mut outbound) = state.hub.connect(&peer_id);
    info!(peer = %peer_id, connection, "Peer connected");

    let writer_peer = peer_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(peer = %writer_peer, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_frame(&state, &peer_id, &text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(peer = %peer_id, error = %e, "WebSocket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    writer.abort();
    state.hub.disconnect(&peer_id, connection);
    info!(peer = %peer_id, connection, "Peer disconnected");
}

fn handle_frame(state: &AppState, peer_id: &str, text: &str) {
    let frame: RelayFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(peer = %peer_id, error = %e, "Dropping malformed frame");
            return;
        }
    };

    match frame {
        RelayFrame::Subscribe { topic } => {
            state.hub.subscribe(peer_id, &topic);
            debug!(peer = %peer_id, topic = %topic, "Subscribed");
        }
        RelayFrame::Unsubscribe { topic } => state.hub.unsubscribe(peer_id, &topic),
        RelayFrame::Publish { topic, payload } => {
            let delivered = state.hub.publish(peer_id, &topic, payload);
            debug!(peer = %peer_id, topic = %topic, delivered, "Published");
        }
        RelayFrame::Direct { to, payload } => {
            if let Err(e) = state.hub.send_direct(peer_id, &to, payload) {
                debug!(peer = %peer_id, to = %to, error = %e, "Direct message not delivered");
                state.hub.send_frame(
                    peer_id,
                    RelayFrame::Error {
                        message: e.to_string(),
                    },
                );
            }
        }
        other => {
            warn!(peer = %peer_id, frame = ?other, "Unexpected frame from peer");
        }
    }
}
