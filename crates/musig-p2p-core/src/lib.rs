//! # MuSig2 P2P Core
//!
//! Signer discovery and multi-party MuSig2 signing sessions for shared
//! wallets whose participants talk over a peer-to-peer network.
//!
//! This crate provides:
//! - Signer advertisement, discovery and subscription
//! - Signing requests addressed to a fixed key set
//! - The session protocol: announce, join, nonce exchange, partial
//!   signing, aggregation, abort and timeout
//!
//! ## Protocol Overview
//!
//! Every participant sorts the same key set and derives the same aggregated
//! key. A session only becomes ready when every expected key has joined,
//! only signs once every nonce is in, and only completes once every partial
//! signature has verified. A bad nonce or partial signature aborts the
//! session for everyone and names the offender.
//!
//! ## Example
//!
//! ```rust,ignore
//! use musig_p2p_core::{MuSigProtocol, ProtocolConfig, SessionMetadata};
//!
//! let protocol = MuSigProtocol::new();
//! protocol.initialize(transport, ProtocolConfig::default()).await?;
//!
//! let session = protocol
//!     .create_session(&key, &[cosigner], message, SessionMetadata::default())
//!     .await?;
//! protocol.announce_session(&session.session_id).await?;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod musig;
pub mod session;
pub mod transport;
pub mod types;
pub mod wire;

mod coordinator;
mod discovery;
mod protocol;
mod router;
mod store;

pub use config::ProtocolConfig;
pub use discovery::{AdvertiseOptions, SigningRequestOptions};
pub use error::{Error, Result};
pub use events::ProtocolEvent;
pub use protocol::MuSigProtocol;
pub use session::{SessionParticipant, SessionState, SigningSession};
pub use transport::{
    AnnounceOptions, MemoryNetwork, MemoryTransport, PeerEvent, Resource, Transport,
    TransportMessage,
};
pub use types::{
    AmountRange, PeerId, PrivateKey, PublicKey, SessionId, SessionMetadata, SharedWallet,
    SignerAdvertisement, SignerCriteria, SigningRequest, TransactionCategory,
};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Smallest useful participant set
pub const MIN_PARTICIPANTS: usize = 2;
