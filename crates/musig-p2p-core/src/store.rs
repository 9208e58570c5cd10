//! Session store
//!
//! The only shared mutable state of a protocol instance. Each session sits
//! behind its own async mutex, which is the single serialization point for
//! every local call and inbound message touching it. A fingerprint index
//! over (sorted keys, message) rejects a second live session for the same
//! content.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::session::{Fingerprint, SessionRecord, SigningSession};
use crate::{Error, Result, SessionId};

pub(crate) type SessionHandle = Arc<Mutex<SessionRecord>>;

#[derive(Default)]
pub(crate) struct SessionStore {
    sessions: DashMap<SessionId, SessionHandle>,
    /// Fingerprint -> id of the live session that holds it
    fingerprints: DashMap<Fingerprint, SessionId>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session, rejecting a reused id or a live duplicate fingerprint
    pub fn insert(&self, record: SessionRecord) -> Result<()> {
        let id = record.id().to_string();
        if self.sessions.contains_key(&id) {
            return Err(Error::DuplicateSession(id));
        }

        match self.fingerprints.entry(*record.fingerprint()) {
            Entry::Occupied(existing) => Err(Error::DuplicateSession(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(id.clone());
                self.sessions.insert(id, Arc::new(Mutex::new(record)));
                Ok(())
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Run `f` under the session's lock. A session that ends inside `f`
    /// gives up its fingerprint so the same content can be signed again.
    pub async fn with_session<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut SessionRecord) -> T,
    ) -> Result<T> {
        let handle = self
            .get(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        let mut record = handle.lock().await;
        let result = f(&mut *record);
        if record.state().is_terminal() {
            self.release(&record);
        }
        Ok(result)
    }

    pub async fn snapshot(&self, id: &str) -> Result<SigningSession> {
        self.with_session(id, |record| record.snapshot()).await
    }

    pub async fn snapshots(&self) -> Vec<SigningSession> {
        let mut sessions = Vec::new();
        for handle in self.handles() {
            sessions.push(handle.lock().await.snapshot());
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Drop sessions that terminated more than `retention` ago
    pub async fn evict_terminated(&self, now: Instant, retention: Duration) -> Vec<SessionId> {
        let mut expired = Vec::new();
        for handle in self.handles() {
            let record = handle.lock().await;
            if let Some(at) = record.terminated_at() {
                if now.saturating_duration_since(at) >= retention {
                    self.release(&record);
                    expired.push(record.id().to_string());
                }
            }
        }

        for id in &expired {
            self.sessions.remove(id);
            debug!(session_id = %id, "evicted terminated session");
        }
        expired
    }

    fn release(&self, record: &SessionRecord) {
        self.fingerprints
            .remove_if(record.fingerprint(), |_, holder| holder == record.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionEffects, SessionPolicy, SessionState};
    use crate::types::{PrivateKey, PublicKey, SessionMetadata};

    fn policy() -> SessionPolicy {
        SessionPolicy {
            join_timeout: Duration::from_secs(30),
            nonce_timeout: Duration::from_secs(30),
            signing_timeout: Duration::from_secs(30),
            auto_finalize: true,
            max_participants: 16,
        }
    }

    fn record(id: &str, key: &PrivateKey, others: &[PublicKey], message: &[u8]) -> SessionRecord {
        SessionRecord::create_local(
            id.into(),
            key,
            "peer-a".into(),
            None,
            others,
            message.to_vec(),
            SessionMetadata::default(),
            policy(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_fingerprint_rejected_while_live() {
        let store = SessionStore::new();
        let alice = PrivateKey::generate();
        let bob = PrivateKey::generate().public_key();

        store.insert(record("s1", &alice, &[bob], b"pay")).unwrap();
        assert!(matches!(
            store.insert(record("s2", &alice, &[bob], b"pay")),
            Err(Error::DuplicateSession(id)) if id == "s1"
        ));
        // Different message is a different session
        store.insert(record("s3", &alice, &[bob], b"pay twice")).unwrap();
        assert!(matches!(
            store.insert(record("s3", &alice, &[bob], b"other")),
            Err(Error::DuplicateSession(_))
        ));

        store
            .with_session("s1", |r| r.abort_local("cancelled", &mut SessionEffects::new()))
            .await
            .unwrap();
        store.insert(record("s4", &alice, &[bob], b"pay")).unwrap();
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let store = SessionStore::new();
        let result = store.with_session("missing", |r| r.state()).await;
        assert!(matches!(result, Err(Error::SessionNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminated_sessions_evicted_after_retention() {
        let store = SessionStore::new();
        let alice = PrivateKey::generate();
        let bob = PrivateKey::generate().public_key();
        let carol = PrivateKey::generate().public_key();

        store.insert(record("done", &alice, &[bob], b"a")).unwrap();
        store.insert(record("live", &alice, &[carol], b"a")).unwrap();
        store
            .with_session("done", |r| r.abort_local("stop", &mut SessionEffects::new()))
            .await
            .unwrap();

        let retention = Duration::from_secs(600);
        assert!(store.evict_terminated(Instant::now(), retention).await.is_empty());

        tokio::time::advance(Duration::from_secs(601)).await;
        let evicted = store.evict_terminated(Instant::now(), retention).await;
        assert_eq!(evicted, vec!["done".to_string()]);
        assert!(!store.contains("done"));
        assert_eq!(store.snapshot("live").await.unwrap().state, SessionState::Created);
    }
}
