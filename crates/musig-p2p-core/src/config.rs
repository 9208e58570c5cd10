//! Protocol configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// Tunables for discovery, session phases and housekeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Deadline for every expected participant to join
    pub join_timeout_secs: u64,
    /// Deadline for the nonce round once all participants have joined
    pub nonce_timeout_secs: u64,
    /// Deadline for the partial-signature round and finalization
    pub signing_timeout_secs: u64,
    /// Lifetime of a signer advertisement; re-published at half this interval
    pub advertisement_ttl_secs: u64,
    /// Lifetime of a signing request
    pub signing_request_ttl_secs: u64,
    /// Wait budget when fetching a session descriptor from the network
    pub resource_lookup_timeout_ms: u64,
    /// How long terminated sessions stay readable before eviction
    pub terminated_retention_secs: u64,
    /// Housekeeping interval (timeouts, eviction, buffer purge)
    pub sweep_interval_ms: u64,
    /// Messages older than this are considered stale
    pub max_message_age_secs: u64,
    /// Tolerated clock skew for messages stamped in the future
    pub max_clock_skew_secs: u64,
    /// Messages held per unknown session
    pub pending_per_session: usize,
    /// Unknown sessions with held messages
    pub max_pending_sessions: usize,
    /// How long a message for an unknown session is held
    pub pending_ttl_secs: u64,
    /// Largest accepted participant set
    pub max_participants: usize,
    /// Aggregate as soon as all partial signatures verify
    pub auto_finalize: bool,
    /// Retries for advertisement and discovery publication
    pub publish_retries: u32,
    /// Initial backoff between retries, doubled each attempt
    pub retry_backoff_ms: u64,
    /// Capacity of the event bus per subscriber
    pub event_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            join_timeout_secs: 120,
            nonce_timeout_secs: 60,
            signing_timeout_secs: 60,
            advertisement_ttl_secs: 300,
            signing_request_ttl_secs: 600,
            resource_lookup_timeout_ms: 5_000,
            terminated_retention_secs: 600,
            sweep_interval_ms: 1_000,
            max_message_age_secs: 300,
            max_clock_skew_secs: 60,
            pending_per_session: 64,
            max_pending_sessions: 256,
            pending_ttl_secs: 10,
            max_participants: 16,
            auto_finalize: true,
            publish_retries: 3,
            retry_backoff_ms: 200,
            event_capacity: 1024,
        }
    }
}

impl ProtocolConfig {
    /// Check that every bound is usable
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("join_timeout_secs", self.join_timeout_secs),
            ("nonce_timeout_secs", self.nonce_timeout_secs),
            ("signing_timeout_secs", self.signing_timeout_secs),
            ("advertisement_ttl_secs", self.advertisement_ttl_secs),
            ("signing_request_ttl_secs", self.signing_request_ttl_secs),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("max_message_age_secs", self.max_message_age_secs),
            ("pending_ttl_secs", self.pending_ttl_secs),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }

        if self.max_participants < crate::MIN_PARTICIPANTS {
            return Err(Error::InvalidConfig(
                "max_participants must be at least 2".into(),
            ));
        }
        if self.pending_per_session == 0 || self.max_pending_sessions == 0 {
            return Err(Error::InvalidConfig(
                "pending buffer bounds must be non-zero".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::InvalidConfig("event_capacity must be non-zero".into()));
        }

        Ok(())
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn nonce_timeout(&self) -> Duration {
        Duration::from_secs(self.nonce_timeout_secs)
    }

    pub fn signing_timeout(&self) -> Duration {
        Duration::from_secs(self.signing_timeout_secs)
    }

    pub fn advertisement_ttl(&self) -> Duration {
        Duration::from_secs(self.advertisement_ttl_secs)
    }

    /// Re-publication interval for a given advertisement lifetime
    pub fn refresh_interval(ttl: Duration) -> Duration {
        (ttl / 2).max(Duration::from_secs(1))
    }

    pub fn signing_request_ttl(&self) -> Duration {
        Duration::from_secs(self.signing_request_ttl_secs)
    }

    pub fn resource_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.resource_lookup_timeout_ms)
    }

    pub fn terminated_retention(&self) -> Duration {
        Duration::from_secs(self.terminated_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn max_message_age(&self) -> Duration {
        Duration::from_secs(self.max_message_age_secs)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_secs(self.max_clock_skew_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
