//! Active sessions keyed by peer address.
//!
//! The map sits behind a `tokio::sync::RwLock`; creation re-checks under the
//! write lock so concurrent first contact with one peer yields one session.
//! Each session's engine sits behind its own `tokio::sync::Mutex`, which also
//! orders that session's persistence writes.

use crate::crypto::PeerIdentity;
use crate::session::engine::{EngineFactory, EngineState, Fingerprint, Protocol, ProtocolType, SessionId};
use crate::utils::{Result, SessionError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};

/// State guarded by a session's lock
pub struct SessionInner {
    /// The conversation partner, updated as envelopes teach us more
    pub peer: PeerIdentity,
    /// The protocol engine
    pub engine: Box<dyn Protocol>,
}

impl std::fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInner")
            .field("peer", &self.peer)
            .field("protocol", &self.engine.protocol_type())
            .field("state", &self.engine.state())
            .finish()
    }
}

/// One conversation with one peer
#[derive(Debug)]
pub struct Session {
    address: String,
    created_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn new(peer: PeerIdentity, engine: Box<dyn Protocol>) -> Self {
        Self {
            address: peer.address.clone(),
            created_at: Utc::now(),
            inner: Mutex::new(SessionInner { peer, engine }),
        }
    }

    /// Registry key
    pub fn address(&self) -> &str {
        &self.address
    }

    /// When the session was first created in this process
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Serialize access to the engine
    pub async fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().await
    }

    /// Point-in-time view for listings
    pub async fn summary(&self) -> SessionSummary {
        let inner = self.inner.lock().await;
        SessionSummary {
            peer: inner.peer.clone(),
            protocol: inner.engine.protocol_type(),
            state: inner.engine.state(),
            session_id: inner.engine.session_id(),
            fingerprint: inner.engine.fingerprint(),
            created_at: self.created_at,
        }
    }
}

/// Snapshot of a session's public attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// The conversation partner
    pub peer: PeerIdentity,
    /// Engine variant
    pub protocol: ProtocolType,
    /// Engine lifecycle state
    pub state: EngineState,
    /// Agreed id, once encrypted
    pub session_id: Option<SessionId>,
    /// Agreed fingerprint, once encrypted
    pub fingerprint: Option<Fingerprint>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// All live sessions
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    factory: EngineFactory,
    default_protocol: ProtocolType,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new(factory: EngineFactory, default_protocol: ProtocolType, max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            factory,
            default_protocol,
            max_sessions,
        }
    }

    /// Engine factory shared by all sessions
    pub fn factory(&self) -> &EngineFactory {
        &self.factory
    }

    /// Protocol used when no hint is given
    pub fn default_protocol(&self) -> ProtocolType {
        self.default_protocol
    }

    /// Return the session for `peer`, creating an unstarted one if none
    /// exists. Every concurrent caller for one address gets the same session.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::CapacityExceeded` when a new session would
    /// exceed the configured maximum
    pub async fn get_or_create(
        &self,
        peer: &PeerIdentity,
        protocol_hint: Option<ProtocolType>,
    ) -> Result<Arc<Session>> {
        if let Some(session) = self.sessions.read().await.get(&peer.address) {
            return Ok(Arc::clone(session));
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&peer.address) {
            return Ok(Arc::clone(session));
        }
        if sessions.len() >= self.max_sessions {
            return Err(SessionError::CapacityExceeded {
                max: self.max_sessions,
            }
            .into());
        }

        let protocol = protocol_hint.unwrap_or(self.default_protocol);
        let session = Arc::new(Session::new(peer.clone(), self.factory.create(protocol)));
        sessions.insert(peer.address.clone(), Arc::clone(&session));
        log::debug!("Created {protocol} session for {}", peer.address);

        Ok(session)
    }

    /// Look up an existing session
    pub async fn get(&self, address: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(address).cloned()
    }

    /// All sessions, in no particular order
    pub async fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Drop the session for `address`. Returns it if one existed.
    pub async fn remove(&self, address: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(address)
    }

    /// Drop `session` only if it is still the one registered for its
    /// address. A session created in its place after the caller released
    /// its lock stays put. Returns true if `session` was removed.
    pub async fn remove_if_same(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(session.address()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.address());
                true
            }
            _ => false,
        }
    }

    /// Register a session rebuilt from storage, unless one already exists
    pub async fn insert_restored(&self, peer: PeerIdentity, engine: Box<dyn Protocol>) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&peer.address) {
            return false;
        }
        let address = peer.address.clone();
        sessions.insert(address, Arc::new(Session::new(peer, engine)));
        true
    }

    /// Number of sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// True with no sessions
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeyPair;
    use crate::session::engine::EngineOptions;

    fn registry(max_sessions: usize) -> SessionRegistry {
        let factory = EngineFactory::new(IdentityKeyPair::generate(), EngineOptions::default());
        SessionRegistry::new(factory, ProtocolType::Otr, max_sessions)
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_sessions() {
        let registry = registry(10);
        let peer = PeerIdentity::from_address("10.0.0.2");

        let first = registry.get_or_create(&peer, None).await.unwrap();
        let second = registry.get_or_create(&peer, Some(ProtocolType::DoubleRatchet)).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len().await, 1);
        assert_eq!(first.lock().await.engine.protocol_type(), ProtocolType::Otr);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_contact_yields_one_session() {
        let registry = Arc::new(registry(10));
        let peer = PeerIdentity::from_address("10.0.0.3");

        let tasks = (0..16).map(|_| {
            let registry = Arc::clone(&registry);
            let peer = peer.clone();
            tokio::spawn(async move { registry.get_or_create(&peer, None).await.unwrap() })
        });
        let sessions: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_capacity_and_removal() {
        let registry = registry(1);
        let a = PeerIdentity::from_address("10.0.0.4");
        let b = PeerIdentity::from_address("10.0.0.5");

        registry.get_or_create(&a, None).await.unwrap();
        let err = registry.get_or_create(&b, None).await.unwrap_err();
        assert!(err.to_string().contains("limit"));

        assert!(registry.remove("10.0.0.4").await.is_some());
        assert!(registry.remove("10.0.0.4").await.is_none());
        assert!(registry.is_empty().await);
        registry.get_or_create(&b, None).await.unwrap();
        assert!(registry.get("10.0.0.5").await.is_some());
    }

    #[tokio::test]
    async fn test_remove_if_same_spares_a_replacement() {
        let registry = registry(4);
        let peer = PeerIdentity::from_address("10.0.0.7");

        let stale = registry.get_or_create(&peer, None).await.unwrap();
        assert!(registry.remove("10.0.0.7").await.is_some());
        let fresh = registry.get_or_create(&peer, None).await.unwrap();

        assert!(!registry.remove_if_same(&stale).await);
        let current = registry.get("10.0.0.7").await.unwrap();
        assert!(Arc::ptr_eq(&current, &fresh));

        assert!(registry.remove_if_same(&fresh).await);
        assert!(registry.is_empty().await);
        assert!(!registry.remove_if_same(&fresh).await);
    }

    #[tokio::test]
    async fn test_summary_reflects_engine() {
        let registry = registry(4);
        let peer = PeerIdentity::new("10.0.0.6", "aa:bb:cc:dd:ee:ff");
        let session = registry
            .get_or_create(&peer, Some(ProtocolType::DoubleRatchet))
            .await
            .unwrap();

        let summary = session.summary().await;
        assert_eq!(summary.peer, peer);
        assert_eq!(summary.protocol, ProtocolType::DoubleRatchet);
        assert_eq!(summary.state, EngineState::Unstarted);
        assert!(summary.session_id.is_none());

        let restored = registry.factory().create(ProtocolType::Otr);
        assert!(!registry.insert_restored(peer, restored).await);
    }
}
