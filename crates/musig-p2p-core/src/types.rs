//! Core types shared by discovery and signing sessions

use chrono::{DateTime, Utc};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, Result};

/// Opaque session identifier
pub type SessionId = String;

/// Transport-level peer identifier
pub type PeerId = String;

/// Version of the metadata record understood by this build
pub const METADATA_VERSION: u8 = 1;

/// Compressed secp256k1 public key (33 bytes).
///
/// Ordering is byte-lexicographic on the compressed encoding, which is the
/// order used for key aggregation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 33]);

impl PublicKey {
    /// Parse and validate a compressed SEC1 encoding
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 33] = bytes.try_into().map_err(|_| {
            Error::InvalidKey(format!("expected 33 bytes, got {}", bytes.len()))
        })?;
        if array[0] != 0x02 && array[0] != 0x03 {
            return Err(Error::InvalidKey("key is not a compressed point".into()));
        }
        k256::PublicKey::from_sec1_bytes(&array)
            .map_err(|e| Error::InvalidKey(format!("not a curve point: {}", e)))?;
        Ok(Self(array))
    }

    /// Parse a hex-encoded compressed key
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| Error::InvalidKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Raw compressed encoding
    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }

    /// Hex encoding of the compressed point
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl FromStr for PublicKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Secret signing key. Never stored by the protocol; passed into the
/// operations that need it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey {
    secret: [u8; 32],
    #[zeroize(skip)]
    public: PublicKey,
}

impl PrivateKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let secret = k256::SecretKey::random(&mut OsRng);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&secret.to_bytes());
        Self {
            secret: bytes,
            public: compress(&secret.public_key()),
        }
    }

    /// Build from a 32-byte scalar
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let secret = k256::SecretKey::from_slice(bytes)
            .map_err(|_| Error::InvalidKey("invalid secret scalar".into()))?;
        let mut array = [0u8; 32];
        array.copy_from_slice(&secret.to_bytes());
        Ok(Self {
            secret: array,
            public: compress(&secret.public_key()),
        })
    }

    /// Parse a hex-encoded 32-byte scalar
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = hex::decode(s.trim()).map_err(|e| Error::InvalidKey(e.to_string()))?;
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }

    /// Matching public key
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Hex encoding of the secret scalar
    pub fn to_hex(&self) -> String {
        hex::encode(self.secret)
    }

    pub(crate) fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({}, <redacted>)", self.public.short())
    }
}

fn compress(public: &k256::PublicKey) -> PublicKey {
    let encoded = public.to_encoded_point(true);
    let mut bytes = [0u8; 33];
    bytes.copy_from_slice(encoded.as_bytes());
    PublicKey(bytes)
}

/// Transaction categories a signer is willing to co-sign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionCategory {
    /// Ordinary spend from a shared wallet
    Spend,
    /// Atomic swap
    Swap,
    /// CoinJoin-style collaborative transaction
    Coinjoin,
    /// Escrow release
    Escrow,
    /// Payment channel open/close
    Channel,
}

impl TransactionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spend => "spend",
            Self::Swap => "swap",
            Self::Coinjoin => "coinjoin",
            Self::Escrow => "escrow",
            Self::Channel => "channel",
        }
    }
}

impl fmt::Display for TransactionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spend" => Ok(Self::Spend),
            "swap" => Ok(Self::Swap),
            "coinjoin" => Ok(Self::Coinjoin),
            "escrow" => Ok(Self::Escrow),
            "channel" => Ok(Self::Channel),
            other => Err(Error::InvalidConfig(format!(
                "unknown transaction category: {}",
                other
            ))),
        }
    }
}

/// Inclusive amount range in integer base units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountRange {
    pub min: u64,
    pub max: u64,
}

impl AmountRange {
    pub fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min <= self.max
    }

    pub fn contains(&self, amount: u64) -> bool {
        amount >= self.min && amount <= self.max
    }
}

/// A signer's public capability record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignerAdvertisement {
    pub advertisement_id: String,
    pub public_key: PublicKey,
    pub peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    pub categories: BTreeSet<TransactionCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_range: Option<AmountRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
    #[serde(default)]
    pub reputation: u32,
    pub last_seen: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SignerAdvertisement {
    /// Structural checks applied to every advertisement received from the network
    pub fn is_well_formed(&self) -> bool {
        !self.advertisement_id.is_empty()
            && !self.peer_id.is_empty()
            && !self.categories.is_empty()
            && self.amount_range.map_or(true, |r| r.is_valid())
            && self.expires_at > self.last_seen
            && self.nickname.as_ref().map_or(true, |n| n.len() <= 64)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Filter applied to discovered advertisements
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerCriteria {
    #[serde(default)]
    pub category: Option<TransactionCategory>,
    #[serde(default)]
    pub min_reputation: Option<u32>,
    /// Amount the signer's advertised range must cover
    #[serde(default)]
    pub amount: Option<u64>,
    #[serde(default)]
    pub max_fee: Option<u64>,
}

impl SignerCriteria {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_category(mut self, category: TransactionCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_min_reputation(mut self, reputation: u32) -> Self {
        self.min_reputation = Some(reputation);
        self
    }

    pub fn with_amount(mut self, amount: u64) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_max_fee(mut self, fee: u64) -> Self {
        self.max_fee = Some(fee);
        self
    }

    pub fn matches(&self, ad: &SignerAdvertisement) -> bool {
        if let Some(category) = self.category {
            if !ad.categories.contains(&category) {
                return false;
            }
        }
        if let Some(min) = self.min_reputation {
            if ad.reputation < min {
                return false;
            }
        }
        if let Some(amount) = self.amount {
            // Signers without a range accept any amount
            if let Some(range) = ad.amount_range {
                if !range.contains(amount) {
                    return false;
                }
            }
        }
        if let Some(max_fee) = self.max_fee {
            if ad.fee.unwrap_or(0) > max_fee {
                return false;
            }
        }
        true
    }
}

/// Closed, versioned description of what a session signs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<TransactionCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self {
            version: METADATA_VERSION,
            wallet_id: None,
            recipient: None,
            amount: None,
            category: None,
            purpose: None,
        }
    }
}

impl SessionMetadata {
    pub fn is_supported(&self) -> bool {
        self.version == METADATA_VERSION
    }

    pub fn with_wallet_id(mut self, wallet_id: &str) -> Self {
        self.wallet_id = Some(wallet_id.to_string());
        self
    }

    pub fn with_recipient(mut self, recipient: &str) -> Self {
        self.recipient = Some(recipient.to_string());
        self
    }

    pub fn with_amount(mut self, amount: u64) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_category(mut self, category: TransactionCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_purpose(mut self, purpose: &str) -> Self {
        self.purpose = Some(purpose.to_string());
        self
    }
}

/// Broadcast request for a specific key set to co-sign a specific message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningRequest {
    pub request_id: String,
    pub creator: PublicKey,
    pub required_keys: Vec<PublicKey>,
    #[serde(with = "hex_serde")]
    pub message_hash: Vec<u8>,
    #[serde(default)]
    pub metadata: SessionMetadata,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SigningRequest {
    pub fn is_well_formed(&self) -> bool {
        let sorted = self.required_keys.windows(2).all(|w| w[0] < w[1]);
        !self.request_id.is_empty()
            && self.required_keys.len() >= 2
            && sorted
            && !self.message_hash.is_empty()
            && self.metadata.is_supported()
            && self.expires_at > self.created_at
    }

    pub fn involves(&self, key: &PublicKey) -> bool {
        self.required_keys.binary_search(key).is_ok()
    }
}

/// Aggregated key, its receiving address and the ordered participant list
/// used to derive it. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedWallet {
    aggregated_key: PublicKey,
    address: String,
    participants: Vec<PublicKey>,
}

impl SharedWallet {
    /// Derive the wallet for a participant set; input order does not matter
    pub fn from_participants(participants: &[PublicKey]) -> Result<Self> {
        let sorted = crate::musig::sort_public_keys(participants)?;
        let aggregated_key = crate::musig::aggregate_public_keys(&sorted)?;
        let address = crate::musig::derive_address(&aggregated_key);
        Ok(Self {
            aggregated_key,
            address,
            participants: sorted,
        })
    }

    pub fn aggregated_key(&self) -> &PublicKey {
        &self.aggregated_key
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn participants(&self) -> &[PublicKey] {
        &self.participants
    }
}

/// Hex (de)serialization for byte vectors
pub(crate) mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Hex (de)serialization for optional byte vectors
pub(crate) mod hex_serde_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(b) => serializer.serialize_some(&hex::encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| hex::decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
