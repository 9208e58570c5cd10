//! Signer discovery
//!
//! Signers advertise their public key and co-signing terms on the discovery
//! topic and in the transport's resource registry. Advertisements carry a
//! TTL and are re-published at half that interval until withdrawn; other
//! nodes cache them until they expire. Signing requests travel the same way.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::ProtocolConfig;
use crate::events::{EventBus, ProtocolEvent};
use crate::transport::{with_retry, AnnounceOptions, Transport};
use crate::types::{
    AmountRange, PeerId, PublicKey, SessionMetadata, SignerAdvertisement, SignerCriteria, SigningRequest,
    TransactionCategory,
};
use crate::wire::{
    MessagePayload, ProtocolMessage, SequenceClock, DISCOVERY_TOPIC, REQUEST_RESOURCE,
    SIGNER_RESOURCE,
};
use crate::{Error, Result};

/// Public keys this node can sign for
pub(crate) type LocalKeys = Arc<DashSet<PublicKey>>;

/// Optional terms of an advertisement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiseOptions {
    pub nickname: Option<String>,
    pub amount_range: Option<AmountRange>,
    pub fee: Option<u64>,
    pub reputation: u32,
    /// Defaults to the configured advertisement TTL
    pub ttl_secs: Option<u64>,
}

/// Optional fields of a signing request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequestOptions {
    pub metadata: SessionMetadata,
    /// Defaults to the configured signing request TTL
    pub ttl_secs: Option<u64>,
}

struct CachedAdvertisement {
    advertisement: SignerAdvertisement,
    expires_at: Instant,
}

struct CachedRequest {
    request: SigningRequest,
    /// Peer that published the request
    source: PeerId,
    expires_at: Instant,
}

struct OwnAdvertisement {
    advertisement: SignerAdvertisement,
    refresh: JoinHandle<()>,
}

struct Subscription {
    criteria: SignerCriteria,
    sender: mpsc::UnboundedSender<SignerAdvertisement>,
    delivered: HashSet<(String, i64)>,
}

enum Ingested {
    New,
    Refreshed,
    Ignored,
}

pub(crate) struct Discovery {
    transport: Arc<dyn Transport>,
    config: Arc<ProtocolConfig>,
    events: EventBus,
    clock: Arc<SequenceClock>,
    local_keys: LocalKeys,
    cache: DashMap<String, CachedAdvertisement>,
    requests: DashMap<String, CachedRequest>,
    own_requests: DashMap<String, SigningRequest>,
    own: Mutex<Option<OwnAdvertisement>>,
    subscriptions: DashMap<String, Subscription>,
}

impl Discovery {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Arc<ProtocolConfig>,
        events: EventBus,
        clock: Arc<SequenceClock>,
        local_keys: LocalKeys,
    ) -> Self {
        Self {
            transport,
            config,
            events,
            clock,
            local_keys,
            cache: DashMap::new(),
            requests: DashMap::new(),
            own_requests: DashMap::new(),
            own: Mutex::new(None),
            subscriptions: DashMap::new(),
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.transport.is_ready() {
            Ok(())
        } else {
            Err(Error::NotInitialized("transport is not ready".into()))
        }
    }

    /// Publish our advertisement and keep it alive until withdrawn.
    /// A previous advertisement is withdrawn first.
    #[instrument(skip(self, options), fields(key = %public_key.short()))]
    pub async fn advertise_signer(
        &self,
        public_key: PublicKey,
        categories: BTreeSet<TransactionCategory>,
        options: AdvertiseOptions,
    ) -> Result<String> {
        self.ensure_ready()?;
        if categories.is_empty() {
            return Err(Error::InvalidConfig(
                "an advertisement needs at least one category".into(),
            ));
        }
        if options.amount_range.map_or(false, |r| !r.is_valid()) {
            return Err(Error::InvalidConfig("amount range min exceeds max".into()));
        }

        self.withdraw_signer().await?;

        let ttl = options
            .ttl_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.advertisement_ttl());
        let chrono_ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::InvalidConfig(format!("advertisement ttl: {}", e)))?;

        let now = Utc::now();
        let advertisement = SignerAdvertisement {
            advertisement_id: Uuid::new_v4().to_string(),
            public_key,
            peer_id: self.transport.local_peer_id(),
            nickname: options.nickname,
            categories,
            amount_range: options.amount_range,
            fee: options.fee,
            reputation: options.reputation,
            last_seen: now,
            expires_at: now + chrono_ttl,
        };
        if !advertisement.is_well_formed() {
            return Err(Error::InvalidConfig("advertisement is malformed".into()));
        }

        with_retry(
            "advertise signer",
            self.config.publish_retries,
            self.config.retry_backoff(),
            || publish_advertisement(self.transport.as_ref(), &self.clock, &advertisement, ttl),
        )
        .await?;

        self.local_keys.insert(public_key);
        let refresh = self.spawn_refresh(advertisement.clone(), ttl, chrono_ttl);
        let id = advertisement.advertisement_id.clone();
        *self.own.lock().await = Some(OwnAdvertisement {
            advertisement,
            refresh,
        });

        info!(advertisement_id = %id, ttl_secs = ttl.as_secs(), "signer advertised");
        Ok(id)
    }

    fn spawn_refresh(
        &self,
        mut advertisement: SignerAdvertisement,
        ttl: Duration,
        chrono_ttl: chrono::Duration,
    ) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let clock = self.clock.clone();
        let retries = self.config.publish_retries;
        let backoff = self.config.retry_backoff();
        let interval = ProtocolConfig::refresh_interval(ttl);

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let now = Utc::now();
                advertisement.last_seen = now;
                advertisement.expires_at = now + chrono_ttl;

                let result = with_retry("refresh advertisement", retries, backoff, || {
                    publish_advertisement(transport.as_ref(), &clock, &advertisement, ttl)
                })
                .await;
                match result {
                    Ok(()) => debug!(
                        advertisement_id = %advertisement.advertisement_id,
                        "advertisement refreshed"
                    ),
                    Err(e) => warn!(
                        advertisement_id = %advertisement.advertisement_id,
                        error = %e,
                        "advertisement refresh failed"
                    ),
                }
            }
        })
    }

    /// Stop advertising. Withdrawing when nothing is advertised is a no-op.
    #[instrument(skip(self))]
    pub async fn withdraw_signer(&self) -> Result<()> {
        let Some(own) = self.own.lock().await.take() else {
            return Ok(());
        };
        own.refresh.abort();

        let ad = own.advertisement;
        self.transport
            .withdraw_resource(SIGNER_RESOURCE, &ad.advertisement_id)
            .await?;

        let payload = MessagePayload::Withdrawal {
            advertisement_id: ad.advertisement_id.clone(),
        };
        let message = ProtocolMessage::new(None, ad.public_key, self.clock.next(), payload).encode()?;
        with_retry(
            "withdraw signer",
            self.config.publish_retries,
            self.config.retry_backoff(),
            || self.transport.publish_to_topic(DISCOVERY_TOPIC, message.clone()),
        )
        .await?;

        info!(advertisement_id = %ad.advertisement_id, "signer withdrawn");
        Ok(())
    }

    /// Our current advertisement, if any
    pub async fn own_advertisement(&self) -> Option<SignerAdvertisement> {
        self.own
            .lock()
            .await
            .as_ref()
            .map(|own| own.advertisement.clone())
    }

    /// Live advertisements matching `criteria`, best reputation first
    #[instrument(skip(self))]
    pub async fn discover_signers(&self, criteria: &SignerCriteria) -> Result<Vec<SignerAdvertisement>> {
        self.ensure_ready()?;

        let resources = with_retry(
            "discover signers",
            self.config.publish_retries,
            self.config.retry_backoff(),
            || self.transport.get_local_resources(SIGNER_RESOURCE),
        )
        .await?;

        for resource in resources {
            let advertisement: SignerAdvertisement = match serde_json::from_slice(&resource.payload)
            {
                Ok(ad) => ad,
                Err(e) => {
                    debug!(resource_id = %resource.resource_id, error = %e, "skipping malformed advertisement");
                    continue;
                }
            };
            if advertisement.peer_id != resource.owner {
                debug!(resource_id = %resource.resource_id, "advertisement registered by another peer");
                continue;
            }
            self.ingest(advertisement);
        }

        let now = Instant::now();
        let mut found: Vec<SignerAdvertisement> = self
            .cache
            .iter()
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.advertisement.clone())
            .filter(|ad| criteria.matches(ad))
            .collect();
        found.sort_by(|a, b| {
            b.reputation
                .cmp(&a.reputation)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });

        debug!(count = found.len(), "signers discovered");
        Ok(found)
    }

    /// Stream of matching advertisements. Live matches are replayed first;
    /// each (advertisement, refresh) pair is delivered at most once.
    pub fn subscribe_to_signers(
        &self,
        criteria: SignerCriteria,
    ) -> (String, mpsc::UnboundedReceiver<SignerAdvertisement>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut subscription = Subscription {
            criteria,
            sender,
            delivered: HashSet::new(),
        };

        let now = Instant::now();
        for entry in self.cache.iter() {
            if entry.expires_at > now {
                deliver(&mut subscription, &entry.advertisement);
            }
        }

        let id = Uuid::new_v4().to_string();
        self.subscriptions.insert(id.clone(), subscription);
        (id, receiver)
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        self.subscriptions.remove(subscription_id).is_some()
    }

    /// Advertisement received on the discovery topic from peer `from`
    pub fn on_advertisement(
        &self,
        from: &PeerId,
        sender: &PublicKey,
        advertisement: SignerAdvertisement,
    ) {
        if &advertisement.public_key != sender || &advertisement.peer_id != from {
            debug!(
                advertisement_id = %advertisement.advertisement_id,
                from = %from,
                "advertisement not sent by its key holder"
            );
            return;
        }
        self.ingest(advertisement);
    }

    /// Only the peer that published an advertisement can withdraw it
    pub fn on_withdrawal(&self, from: &PeerId, sender: &PublicKey, advertisement_id: &str) {
        let removed = self.cache.remove_if(advertisement_id, |_, cached| {
            &cached.advertisement.public_key == sender && &cached.advertisement.peer_id == from
        });
        if removed.is_some() {
            debug!(advertisement_id, "advertisement withdrawn");
            self.events.emit(ProtocolEvent::SignerWithdrawn {
                advertisement_id: advertisement_id.to_string(),
            });
        }
    }

    fn ingest(&self, advertisement: SignerAdvertisement) {
        let now = Utc::now();
        if !advertisement.is_well_formed()
            || advertisement.is_expired_at(now)
            || advertisement.peer_id == self.transport.local_peer_id()
        {
            return;
        }

        let remaining = (advertisement.expires_at - now)
            .to_std()
            .unwrap_or_default();
        let cached = CachedAdvertisement {
            advertisement: advertisement.clone(),
            expires_at: Instant::now() + remaining,
        };

        let outcome = match self.cache.entry(advertisement.advertisement_id.clone()) {
            Entry::Occupied(mut entry) => {
                let current = &entry.get().advertisement;
                if current.peer_id != advertisement.peer_id
                    || current.public_key != advertisement.public_key
                    || current.last_seen >= advertisement.last_seen
                {
                    Ingested::Ignored
                } else {
                    entry.insert(cached);
                    Ingested::Refreshed
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(cached);
                Ingested::New
            }
        };

        match outcome {
            Ingested::Ignored => return,
            Ingested::New => {
                debug!(
                    advertisement_id = %advertisement.advertisement_id,
                    key = %advertisement.public_key.short(),
                    "new signer"
                );
                self.events.emit(ProtocolEvent::SignerDiscovered {
                    advertisement: advertisement.clone(),
                });
            }
            Ingested::Refreshed => {}
        }

        self.subscriptions.retain(|_, subscription| {
            deliver(subscription, &advertisement);
            !subscription.sender.is_closed()
        });
    }

    /// Broadcast a request for `required_keys` to co-sign `message_hash`
    #[instrument(skip(self, message_hash, options), fields(creator = %creator.short()))]
    pub async fn create_signing_request(
        &self,
        creator: PublicKey,
        required_keys: &[PublicKey],
        message_hash: Vec<u8>,
        options: SigningRequestOptions,
    ) -> Result<String> {
        self.ensure_ready()?;

        let mut keys = required_keys.to_vec();
        if !keys.contains(&creator) {
            keys.push(creator);
        }
        let required_keys = crate::musig::sort_public_keys(&keys)?;

        let ttl = options
            .ttl_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.signing_request_ttl());
        let chrono_ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::InvalidConfig(format!("signing request ttl: {}", e)))?;

        let now = Utc::now();
        let request = SigningRequest {
            request_id: Uuid::new_v4().to_string(),
            creator,
            required_keys,
            message_hash,
            metadata: options.metadata,
            created_at: now,
            expires_at: now + chrono_ttl,
        };
        if !request.is_well_formed() {
            return Err(Error::InvalidMessage("signing request is malformed".into()));
        }

        let resource = serde_json::to_vec(&request)?;
        let message = ProtocolMessage::new(
            None,
            creator,
            self.clock.next(),
            MessagePayload::SigningRequest(request.clone()),
        )
        .encode()?;

        with_retry(
            "create signing request",
            self.config.publish_retries,
            self.config.retry_backoff(),
            || async {
                self.transport
                    .announce_resource(
                        REQUEST_RESOURCE,
                        &request.request_id,
                        resource.clone(),
                        AnnounceOptions::with_ttl(ttl),
                    )
                    .await?;
                self.transport
                    .publish_to_topic(DISCOVERY_TOPIC, message.clone())
                    .await
            },
        )
        .await?;

        let id = request.request_id.clone();
        self.own_requests.insert(id.clone(), request);
        info!(request_id = %id, "signing request published");
        Ok(id)
    }

    /// Withdraw one of our signing requests; unknown ids are ignored
    #[instrument(skip(self))]
    pub async fn withdraw_signing_request(&self, request_id: &str) -> Result<()> {
        let Some((_, request)) = self.own_requests.remove(request_id) else {
            return Ok(());
        };

        self.transport
            .withdraw_resource(REQUEST_RESOURCE, request_id)
            .await?;
        let message = ProtocolMessage::new(
            None,
            request.creator,
            self.clock.next(),
            MessagePayload::RequestWithdrawal {
                request_id: request_id.to_string(),
            },
        )
        .encode()?;
        with_retry(
            "withdraw signing request",
            self.config.publish_retries,
            self.config.retry_backoff(),
            || self.transport.publish_to_topic(DISCOVERY_TOPIC, message.clone()),
        )
        .await?;

        info!(request_id, "signing request withdrawn");
        Ok(())
    }

    /// Live signing requests from other nodes plus our own
    pub async fn signing_requests(&self) -> Result<Vec<SigningRequest>> {
        self.ensure_ready()?;

        for resource in self.transport.get_local_resources(REQUEST_RESOURCE).await? {
            match serde_json::from_slice::<SigningRequest>(&resource.payload) {
                Ok(request) => self.ingest_request(request, resource.owner),
                Err(e) => debug!(resource_id = %resource.resource_id, error = %e, "skipping malformed request"),
            }
        }

        let now = Instant::now();
        let mut requests: Vec<SigningRequest> = self
            .requests
            .iter()
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.request.clone())
            .chain(self.own_requests.iter().map(|entry| entry.value().clone()))
            .collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(requests)
    }

    pub fn on_signing_request(&self, from: &PeerId, sender: &PublicKey, request: SigningRequest) {
        if &request.creator != sender {
            debug!(request_id = %request.request_id, "signing request not sent by its creator");
            return;
        }
        self.ingest_request(request, from.clone());
    }

    /// Only the peer that published a request can withdraw it
    pub fn on_request_withdrawal(&self, from: &PeerId, sender: &PublicKey, request_id: &str) {
        let removed = self.requests.remove_if(request_id, |_, cached| {
            &cached.request.creator == sender && &cached.source == from
        });
        if removed.is_some() {
            self.events.emit(ProtocolEvent::SigningRequestWithdrawn {
                request_id: request_id.to_string(),
            });
        }
    }

    fn ingest_request(&self, request: SigningRequest, source: PeerId) {
        let now = Utc::now();
        if !request.is_well_formed()
            || request.expires_at <= now
            || self.own_requests.contains_key(&request.request_id)
        {
            return;
        }

        let remaining = (request.expires_at - now).to_std().unwrap_or_default();
        let Entry::Vacant(entry) = self.requests.entry(request.request_id.clone()) else {
            return;
        };
        entry.insert(CachedRequest {
            request: request.clone(),
            source,
            expires_at: Instant::now() + remaining,
        });

        let ours = self.local_keys.iter().any(|key| request.involves(&key));
        if ours {
            info!(request_id = %request.request_id, "signing request for a local key");
            self.events
                .emit(ProtocolEvent::SigningRequestReceived { request });
        }
    }

    /// Drop expired advertisements and requests
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.cache.len() + self.requests.len();
        self.cache.retain(|_, cached| cached.expires_at > now);
        self.requests.retain(|_, cached| cached.expires_at > now);
        before - (self.cache.len() + self.requests.len())
    }

    /// Withdraw everything we published and close subscriptions
    pub async fn shutdown(&self) {
        if let Err(e) = self.withdraw_signer().await {
            warn!(error = %e, "failed to withdraw advertisement on shutdown");
        }
        let own: Vec<String> = self
            .own_requests
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in own {
            if let Err(e) = self.withdraw_signing_request(&id).await {
                warn!(request_id = %id, error = %e, "failed to withdraw signing request on shutdown");
            }
        }
        self.subscriptions.clear();
    }
}

fn deliver(subscription: &mut Subscription, advertisement: &SignerAdvertisement) {
    if !subscription.criteria.matches(advertisement) {
        return;
    }
    let key = (
        advertisement.advertisement_id.clone(),
        advertisement.last_seen.timestamp_millis(),
    );
    if subscription.delivered.insert(key) {
        let _ = subscription.sender.send(advertisement.clone());
    }
}

async fn publish_advertisement(
    transport: &dyn Transport,
    clock: &SequenceClock,
    advertisement: &SignerAdvertisement,
    ttl: Duration,
) -> Result<()> {
    let resource = serde_json::to_vec(advertisement)?;
    transport
        .announce_resource(
            SIGNER_RESOURCE,
            &advertisement.advertisement_id,
            resource,
            AnnounceOptions::with_ttl(ttl),
        )
        .await?;

    let message = ProtocolMessage::new(
        None,
        advertisement.public_key,
        clock.next(),
        MessagePayload::Advertisement(advertisement.clone()),
    )
    .encode()?;
    transport.publish_to_topic(DISCOVERY_TOPIC, message).await
}
