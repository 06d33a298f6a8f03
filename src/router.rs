//! Message routing between the transport, the session engines, the
//! application and storage.
//!
//! The router is the only place that interprets [`Decrypted`]: handshake
//! continuations go back to the sender and nowhere else, application
//! plaintexts go to the event channel and the encrypted store.

use crate::crypto::{LocalIdentity, PeerIdentity};
use crate::session::{
    Decrypted, EngineState, Fingerprint, ProtocolType, SessionId, SessionInner, SessionRegistry,
    SessionSummary,
};
use crate::storage::{Direction, EncryptedStore, Message};
use crate::transport::{Envelope, Transport};
use crate::utils::{MessengerError, NetworkError, ProtocolError, Result, SessionError, StorageError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What the router tells the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// A key exchange finished; the fingerprint can be compared out of band
    HandshakeCompleted {
        /// The conversation partner
        peer: PeerIdentity,
        /// Agreed session id
        session_id: SessionId,
        /// Agreed fingerprint
        fingerprint: Fingerprint,
    },
    /// A decrypted application message
    MessageReceived {
        /// Sender
        peer: PeerIdentity,
        /// Session it arrived on
        session_id: SessionId,
        /// Message text
        content: String,
    },
    /// A session was torn down
    SessionEnded {
        /// The conversation partner
        peer: PeerIdentity,
        /// Why
        reason: String,
    },
}

/// Routes envelopes for the local node
pub struct Router {
    local: LocalIdentity,
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    store: Arc<EncryptedStore>,
    events: mpsc::UnboundedSender<RouterEvent>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create a router and the receiving end of its event channel
    pub fn new(
        local: LocalIdentity,
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn Transport>,
        store: Arc<EncryptedStore>,
    ) -> (Self, mpsc::UnboundedReceiver<RouterEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                local,
                registry,
                transport,
                store,
                events,
            },
            receiver,
        )
    }

    /// The local node's identity
    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    /// The session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn emit(&self, event: RouterEvent) {
        if self.events.send(event).is_err() {
            log::trace!("Router event dropped: no listener");
        }
    }

    fn envelope_to(&self, address: &str, payload: Vec<u8>) -> Envelope {
        Envelope::new(
            self.local.address.clone(),
            address,
            self.local.routing_id.clone(),
            payload,
        )
    }

    async fn send_all(&self, address: &str, fragments: Vec<Vec<u8>>) -> Result<()> {
        for fragment in fragments {
            self.transport.send(self.envelope_to(address, fragment)).await?;
        }
        Ok(())
    }

    fn save_record(&self, inner: &SessionInner) {
        if !inner.engine.is_encrypted() {
            return;
        }
        let saved = inner.engine.serialize().and_then(|state| {
            self.store
                .save_session(&inner.peer, inner.engine.protocol_type(), &state)
        });
        if let Err(e) = saved {
            log::warn!("Could not save session record for {}: {e}", inner.peer.address);
        }
    }

    fn forget_record(&self, address: &str) {
        if let Err(e) = self.store.delete_session(address) {
            log::warn!("Could not delete session record for {address}: {e}");
        }
    }

    /// Handle one envelope from the network.
    ///
    /// # Errors
    ///
    /// `NetworkError::AddressMismatch` if the envelope is not addressed to
    /// this node. Engine refusals are returned after the message is dropped;
    /// a handshake failure also tears the session down first. A refused
    /// message that leaves its session unstarted discards that session.
    /// Plaintext that is not UTF-8 is neither delivered nor stored.
    pub async fn on_inbound_envelope(&self, envelope: Envelope) -> Result<()> {
        if envelope.dest_address != self.local.address {
            return Err(NetworkError::AddressMismatch {
                expected: self.local.address.clone(),
                actual: envelope.dest_address,
            }
            .into());
        }

        let peer = PeerIdentity::new(
            envelope.source_address.clone(),
            envelope.source_routing_id.clone(),
        );
        let session = self
            .registry
            .get_or_create(&peer, envelope.start_protocol)
            .await?;
        let mut inner = session.lock().await;
        if inner.peer.learn_routing_id(&envelope.source_routing_id) {
            log::debug!(
                "Learned routing id {} for {}",
                envelope.source_routing_id,
                envelope.source_address
            );
        }

        let state = inner.engine.state();
        let kind = envelope
            .start_protocol
            .unwrap_or_else(|| inner.engine.protocol_type());
        let replace = match state {
            EngineState::Ended => true,
            EngineState::Encrypted => false,
            _ => kind != inner.engine.protocol_type(),
        };
        if replace {
            log::debug!("Fresh {kind} engine for {} (was {state})", peer.address);
            inner.engine = self.registry.factory().create(kind);
        }

        let before = (inner.engine.state(), inner.engine.session_id());
        let decrypted = inner.engine.decrypt(&envelope.payload);
        match decrypted {
            Decrypted::HandshakeContinuation(fragments) => {
                let after = (inner.engine.state(), inner.engine.session_id());
                if after.0 == EngineState::Encrypted && after != before {
                    if let (Some(session_id), Some(fingerprint)) =
                        (inner.engine.session_id(), inner.engine.fingerprint())
                    {
                        log::info!(
                            "Encrypted session {session_id} with {} (fingerprint {fingerprint})",
                            inner.peer.label()
                        );
                        self.save_record(&inner);
                        self.emit(RouterEvent::HandshakeCompleted {
                            peer: inner.peer.clone(),
                            session_id,
                            fingerprint,
                        });
                    }
                }

                let count = fragments.len();
                self.send_all(&envelope.source_address, fragments).await?;
                if count > 0 {
                    log::debug!("Echoed {count} handshake fragments to {}", peer.address);
                }
                Ok(())
            }
            Decrypted::ApplicationData(plaintexts) => {
                let session_id = inner.engine.session_id().ok_or_else(|| {
                    StorageError::MissingSessionId {
                        peer: peer.address.clone(),
                    }
                })?;
                let now = Utc::now();
                let mut stored = Ok(());
                let mut rejected = None;
                for plaintext in plaintexts {
                    let content = match String::from_utf8(plaintext) {
                        Ok(content) => content,
                        Err(e) => {
                            log::warn!("Dropped non-UTF-8 message from {}: {e}", peer.address);
                            rejected.get_or_insert_with(|| {
                                MessengerError::from(ProtocolError::InvalidMessage {
                                    reason: format!("plaintext is not UTF-8: {e}"),
                                })
                            });
                            continue;
                        }
                    };
                    log::debug!("Received {} bytes from {}", content.len(), peer.address);
                    self.emit(RouterEvent::MessageReceived {
                        peer: inner.peer.clone(),
                        session_id,
                        content: content.clone(),
                    });
                    if stored.is_ok() {
                        stored = self
                            .store
                            .append(session_id, Direction::Received, &content, now)
                            .map(|_| ());
                    }
                }
                self.save_record(&inner);
                stored?;
                rejected.map_or(Ok(()), Err)
            }
            Decrypted::Failure(failure) if failure.is_session_fatal() => {
                log::warn!("Handshake with {} failed: {failure}", peer.address);
                let ended = inner.peer.clone();
                self.registry.remove_if_same(&session).await;
                drop(inner);
                self.forget_record(&peer.address);
                self.emit(RouterEvent::SessionEnded {
                    peer: ended,
                    reason: failure.to_string(),
                });
                Err(failure.into_error(&peer.address))
            }
            Decrypted::Failure(failure) => {
                log::warn!("Dropped message from {}: {failure}", peer.address);
                if inner.engine.state() == EngineState::Unstarted
                    && self.registry.remove_if_same(&session).await
                {
                    log::debug!("Discarded unstarted session with {}", peer.address);
                }
                Err(failure.into_error(&peer.address))
            }
        }
    }

    /// Encrypt `text` for `address` and send it.
    ///
    /// # Errors
    ///
    /// `SessionError::NotFound` if there is no session with `address`,
    /// `SessionError::InvalidState` if it is not encrypted yet; transport
    /// failures are returned as is and not retried
    pub async fn send_application_message(&self, address: &str, text: &str) -> Result<SessionId> {
        let session = self
            .registry
            .get(address)
            .await
            .ok_or_else(|| SessionError::NotFound {
                peer: address.to_string(),
            })?;
        let mut inner = session.lock().await;

        let fragments = inner.engine.encrypt(text.as_bytes())?;
        let session_id = inner.engine.session_id().ok_or_else(|| {
            StorageError::MissingSessionId {
                peer: address.to_string(),
            }
        })?;
        self.save_record(&inner);
        self.send_all(address, fragments).await?;

        self.store
            .append(session_id, Direction::Sent, text, Utc::now())?;
        log::debug!("Sent {} bytes to {address} on session {session_id}", text.len());
        Ok(session_id)
    }

    /// Begin a key exchange with `address`, replacing an engine that has
    /// already been used or speaks another protocol
    pub async fn start_session(&self, address: &str, protocol: Option<ProtocolType>) -> Result<()> {
        let protocol = protocol.unwrap_or_else(|| self.registry.default_protocol());
        let peer = PeerIdentity::from_address(address);
        let session = self.registry.get_or_create(&peer, Some(protocol)).await?;
        let mut inner = session.lock().await;

        if inner.engine.state() != EngineState::Unstarted
            || inner.engine.protocol_type() != protocol
        {
            inner.engine = self.registry.factory().create(protocol);
        }

        let opening = inner.engine.new_session()?;
        let envelope = self
            .envelope_to(address, opening)
            .with_start_protocol(protocol);
        self.transport.send(envelope).await?;
        log::info!("Started {protocol} key exchange with {address}");
        Ok(())
    }

    /// End the session with `address` and forget its record. Returns false
    /// if there was none.
    pub async fn end_session(&self, address: &str) -> Result<bool> {
        let Some(session) = self.registry.remove(address).await else {
            return Ok(false);
        };
        let mut inner = session.lock().await;
        inner.engine.end_session();
        self.store.delete_session(address)?;
        log::info!("Ended session with {}", inner.peer.label());
        self.emit(RouterEvent::SessionEnded {
            peer: inner.peer.clone(),
            reason: "ended locally".to_string(),
        });
        Ok(true)
    }

    /// Summaries of every live session
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();
        for session in self.registry.list().await {
            summaries.push(session.summary().await);
        }
        summaries.sort_by(|a, b| a.peer.address.cmp(&b.peer.address));
        summaries
    }

    /// Stored messages of the current session with `address`
    pub async fn history(&self, address: &str) -> Result<Vec<Message>> {
        let session = self
            .registry
            .get(address)
            .await
            .ok_or_else(|| SessionError::NotFound {
                peer: address.to_string(),
            })?;
        let session_id = session
            .lock()
            .await
            .engine
            .session_id()
            .ok_or_else(|| StorageError::MissingSessionId {
                peer: address.to_string(),
            })?;
        self.store.query(session_id)
    }

    /// End every handshake whose deadline passed before `now`, and discard
    /// sessions that never got started within the same deadline. Returns the
    /// addresses that were torn down.
    pub async fn expire_stalled_handshakes(&self, now: DateTime<Utc>) -> Vec<String> {
        let options = self.registry.factory().options();
        let mut expired = Vec::new();
        for session in self.registry.list().await {
            let mut inner = session.lock().await;
            if inner.engine.state() == EngineState::Unstarted {
                if options.handshake_deadline(session.created_at()) <= now
                    && self.registry.remove_if_same(&session).await
                {
                    log::debug!("Discarded idle session with {}", inner.peer.address);
                    expired.push(inner.peer.address.clone());
                }
                continue;
            }
            if !inner.engine.expire_handshake(now) {
                continue;
            }
            let peer = inner.peer.clone();
            let removed = self.registry.remove_if_same(&session).await;
            drop(inner);
            if !removed {
                continue;
            }

            log::warn!("Handshake with {} timed out", peer.address);
            self.emit(RouterEvent::SessionEnded {
                peer: peer.clone(),
                reason: SessionError::HandshakeFailure {
                    peer: peer.address.clone(),
                    reason: "handshake timed out".to_string(),
                }
                .to_string(),
            });
            expired.push(peer.address);
        }
        expired
    }

    /// Run [`Router::expire_stalled_handshakes`] every `interval`
    pub fn spawn_handshake_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let expired = router.expire_stalled_handshakes(Utc::now()).await;
                if !expired.is_empty() {
                    log::debug!("Reaped {} stalled handshakes", expired.len());
                }
            }
        })
    }

    /// Rebuild sessions saved by an earlier run. Returns how many came back.
    pub async fn restore_sessions(&self) -> Result<usize> {
        let mut restored = 0;
        for stored in self.store.load_sessions()? {
            let address = stored.peer.address.clone();
            match self
                .registry
                .factory()
                .restore(stored.protocol, &stored.state)
            {
                Ok(engine) => {
                    if self.registry.insert_restored(stored.peer, engine).await {
                        restored += 1;
                    }
                }
                Err(e) => log::warn!("Could not restore session with {address}: {e}"),
            }
        }
        if restored > 0 {
            log::info!("Restored {restored} sessions");
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AtRestCipher, AtRestScheme, IdentityKeyPair};
    use crate::session::{EngineFactory, EngineOptions};
    use crate::storage::{MemoryBackend, StorageBackend};
    use crate::transport::MemoryTransport;
    use base64::{engine::general_purpose, Engine as _};

    const ALICE: &str = "10.0.0.1";
    const BOB: &str = "10.0.0.2";

    struct Node {
        router: Arc<Router>,
        keypair: IdentityKeyPair,
        transport: Arc<MemoryTransport>,
        backend: Arc<MemoryBackend>,
        outbox: mpsc::UnboundedReceiver<Envelope>,
        events: mpsc::UnboundedReceiver<RouterEvent>,
    }

    fn node_with(
        address: &str,
        keypair: IdentityKeyPair,
        backend: Arc<MemoryBackend>,
        protocol: ProtocolType,
        options: EngineOptions,
        max_sessions: usize,
    ) -> Node {
        let local = LocalIdentity::new(address.to_string(), None, address.to_string(), &keypair);
        let factory = EngineFactory::new(keypair.clone(), options);
        let registry = Arc::new(SessionRegistry::new(factory, protocol, max_sessions));
        let cipher = AtRestCipher::new(b"0123456789abcdef", AtRestScheme::LegacyZeroIv).unwrap();
        let store = Arc::new(EncryptedStore::new(backend.clone(), cipher));
        let (transport, outbox) = MemoryTransport::new();
        let transport = Arc::new(transport);
        let (router, events) = Router::new(local, registry, transport.clone(), store);

        Node {
            router: Arc::new(router),
            keypair,
            transport,
            backend,
            outbox,
            events,
        }
    }

    fn node(address: &str, protocol: ProtocolType) -> Node {
        node_with(
            address,
            IdentityKeyPair::generate(),
            Arc::new(MemoryBackend::new()),
            protocol,
            EngineOptions::default(),
            16,
        )
    }

    async fn pump(a: &mut Node, b: &mut Node) -> Vec<MessengerError> {
        let mut errors = Vec::new();
        loop {
            let mut idle = true;
            while let Ok(envelope) = a.outbox.try_recv() {
                idle = false;
                if let Err(e) = b.router.on_inbound_envelope(envelope).await {
                    errors.push(e);
                }
            }
            while let Ok(envelope) = b.outbox.try_recv() {
                idle = false;
                if let Err(e) = a.router.on_inbound_envelope(envelope).await {
                    errors.push(e);
                }
            }
            if idle {
                return errors;
            }
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<RouterEvent>) -> Vec<RouterEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    async fn handshake(a: &mut Node, b: &mut Node, protocol: ProtocolType) {
        a.router.start_session(BOB, Some(protocol)).await.unwrap();
        let errors = pump(a, b).await;
        assert!(errors.is_empty(), "handshake errors: {errors:?}");
    }

    fn completed_session(events: &[RouterEvent]) -> (SessionId, Fingerprint) {
        events
            .iter()
            .find_map(|event| match event {
                RouterEvent::HandshakeCompleted {
                    session_id,
                    fingerprint,
                    ..
                } => Some((*session_id, fingerprint.clone())),
                _ => None,
            })
            .expect("no handshake completion")
    }

    #[tokio::test]
    async fn test_handshake_converges_for_both_protocols() {
        for protocol in [ProtocolType::Otr, ProtocolType::DoubleRatchet] {
            let mut alice = node(ALICE, protocol);
            let mut bob = node(BOB, protocol);
            handshake(&mut alice, &mut bob, protocol).await;

            let alice_events = drain(&mut alice.events);
            let bob_events = drain(&mut bob.events);
            assert_eq!(completed_session(&alice_events), completed_session(&bob_events));
            assert!(alice_events
                .iter()
                .chain(bob_events.iter())
                .all(|e| matches!(e, RouterEvent::HandshakeCompleted { .. })));

            let sessions = bob.router.list_sessions().await;
            let summary = &sessions[0];
            assert_eq!(summary.peer.address, ALICE);
            assert_eq!(summary.protocol, protocol);
            assert_eq!(summary.state, EngineState::Encrypted);
            assert!(!summary.peer.routing_id.is_empty());
        }
    }

    #[tokio::test]
    async fn test_fortnite_message_is_delivered_and_persisted() {
        let mut alice = node(ALICE, ProtocolType::Otr);
        let mut bob = node(BOB, ProtocolType::Otr);
        handshake(&mut alice, &mut bob, ProtocolType::Otr).await;
        drain(&mut bob.events);

        alice
            .router
            .send_application_message(BOB, "Want to play fortnite?")
            .await
            .unwrap();
        assert!(pump(&mut alice, &mut bob).await.is_empty());

        let events = drain(&mut bob.events);
        assert_eq!(events.len(), 1);
        match &events[0] {
            RouterEvent::MessageReceived { peer, content, .. } => {
                assert_eq!(peer.address, ALICE);
                assert_eq!(content, "Want to play fortnite?");
            }
            other => panic!("unexpected event {other:?}"),
        }

        let received = bob.router.history(ALICE).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].direction, Direction::Received);
        assert_eq!(received[0].text, "Want to play fortnite?");

        let sent = alice.router.history(BOB).await.unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].direction, Direction::Sent);
    }

    #[tokio::test]
    async fn test_handshake_traffic_never_reaches_history() {
        let mut alice = node(ALICE, ProtocolType::DoubleRatchet);
        let mut bob = node(BOB, ProtocolType::DoubleRatchet);
        handshake(&mut alice, &mut bob, ProtocolType::DoubleRatchet).await;

        assert!(alice.backend.all_messages().unwrap().is_empty());
        assert!(bob.backend.all_messages().unwrap().is_empty());
        assert_eq!(bob.backend.sessions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_misaddressed_envelope_is_rejected() {
        let bob = node(BOB, ProtocolType::Otr);
        let envelope = Envelope::new(ALICE, "10.0.0.9", "", b"?OTRv3?".to_vec());

        let err = bob.router.on_inbound_envelope(envelope).await.unwrap_err();
        assert!(matches!(
            err,
            MessengerError::Network(NetworkError::AddressMismatch { .. })
        ));
        assert!(bob.router.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_send_before_handshake_fails() {
        let alice = node(ALICE, ProtocolType::Otr);
        let err = alice
            .router
            .send_application_message(BOB, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, MessengerError::Session(SessionError::NotFound { .. })));
        assert!(alice.backend.all_messages().unwrap().is_empty());
        assert!(alice.router.registry().is_empty().await);

        alice.router.start_session(BOB, None).await.unwrap();
        let err = alice
            .router
            .send_application_message(BOB, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, MessengerError::Session(SessionError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_junk_from_strangers_does_not_fill_the_registry() {
        let keypair = IdentityKeyPair::generate();
        let bob = node_with(
            BOB,
            keypair,
            Arc::new(MemoryBackend::new()),
            ProtocolType::Otr,
            EngineOptions::default(),
            4,
        );

        let junk: [&[u8]; 5] = [
            b"garbage",
            b"?OTR:not base64!.",
            b"?OTR,2,3,out of order,",
            b"?DRT:AAAA.",
            &[0xff, 0x00, 0xfe],
        ];
        for (i, payload) in junk.iter().enumerate() {
            let source = format!("10.0.1.{i}");
            let envelope = Envelope::new(source.as_str(), BOB, "", payload.to_vec());
            assert!(bob.router.on_inbound_envelope(envelope).await.is_err());
            assert!(bob.router.registry().is_empty().await);
        }

        let query = Envelope::new(ALICE, BOB, "", b"?OTRv3?".to_vec());
        bob.router.on_inbound_envelope(query).await.unwrap();
        assert_eq!(bob.router.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_unstarted_sessions_are_reaped() {
        let mut bob = node(BOB, ProtocolType::Otr);
        let fragment = Envelope::new(ALICE, BOB, "", b"?OTR,1,2,half,".to_vec());
        bob.router.on_inbound_envelope(fragment).await.unwrap();
        assert_eq!(bob.router.registry().len().await, 1);

        assert!(bob.router.expire_stalled_handshakes(Utc::now()).await.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(120);
        let reaped = bob.router.expire_stalled_handshakes(later).await;
        assert_eq!(reaped, vec![ALICE.to_string()]);
        assert!(bob.router.registry().is_empty().await);
        assert!(drain(&mut bob.events).is_empty());
    }

    #[tokio::test]
    async fn test_non_utf8_plaintext_is_rejected() {
        let mut alice = node(ALICE, ProtocolType::Otr);
        let mut bob = node(BOB, ProtocolType::Otr);
        handshake(&mut alice, &mut bob, ProtocolType::Otr).await;
        drain(&mut bob.events);

        let session = alice.router.registry().get(BOB).await.unwrap();
        let fragments = session.lock().await.engine.encrypt(&[0x66, 0xff, 0x6f]).unwrap();
        for fragment in fragments {
            let envelope = alice.router.envelope_to(BOB, fragment);
            let err = bob.router.on_inbound_envelope(envelope).await.unwrap_err();
            assert!(matches!(
                err,
                MessengerError::Protocol(ProtocolError::InvalidMessage { .. })
            ));
        }
        assert!(drain(&mut bob.events).is_empty());
        assert!(bob.backend.all_messages().unwrap().is_empty());

        alice.router.send_application_message(BOB, "still here").await.unwrap();
        assert!(pump(&mut alice, &mut bob).await.is_empty());
        assert!(matches!(
            drain(&mut bob.events).as_slice(),
            [RouterEvent::MessageReceived { content, .. }] if content == "still here"
        ));
    }

    #[tokio::test]
    async fn test_completion_is_recorded_when_the_reply_cannot_be_sent() {
        let mut alice = node(ALICE, ProtocolType::DoubleRatchet);
        let mut bob = node(BOB, ProtocolType::DoubleRatchet);
        alice
            .router
            .start_session(BOB, Some(ProtocolType::DoubleRatchet))
            .await
            .unwrap();
        let hello = alice.outbox.try_recv().unwrap();
        bob.router.on_inbound_envelope(hello).await.unwrap();
        let ack = bob.outbox.try_recv().unwrap();

        alice.transport.set_failing(true);
        let err = alice.router.on_inbound_envelope(ack).await.unwrap_err();
        assert!(err.is_recoverable());

        let events = drain(&mut alice.events);
        assert!(matches!(
            events.as_slice(),
            [RouterEvent::HandshakeCompleted { .. }]
        ));
        assert_eq!(alice.backend.sessions().unwrap().len(), 1);
        let sessions = alice.router.list_sessions().await;
        assert_eq!(sessions[0].state, EngineState::Encrypted);
    }

    #[tokio::test]
    async fn test_transport_failure_is_surfaced() {
        let mut alice = node(ALICE, ProtocolType::Otr);
        let mut bob = node(BOB, ProtocolType::Otr);
        handshake(&mut alice, &mut bob, ProtocolType::Otr).await;

        alice.transport.set_failing(true);
        let err = alice
            .router
            .send_application_message(BOB, "lost")
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
        assert!(alice.backend.all_messages().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tampered_hello_tears_down_the_session() {
        let mut alice = node(ALICE, ProtocolType::DoubleRatchet);
        let mut bob = node(BOB, ProtocolType::DoubleRatchet);
        alice
            .router
            .start_session(BOB, Some(ProtocolType::DoubleRatchet))
            .await
            .unwrap();

        let mut envelope = alice.outbox.try_recv().unwrap();
        let text = String::from_utf8(envelope.payload.clone()).unwrap();
        let body = text.strip_prefix("?DRT:").unwrap().strip_suffix('.').unwrap();
        let mut decoded = general_purpose::STANDARD.decode(body).unwrap();
        // variant tag, identity key, then the first byte of the ephemeral key
        decoded[4 + 32] ^= 0x01;
        envelope.payload = format!("?DRT:{}.", general_purpose::STANDARD.encode(decoded)).into_bytes();

        let err = bob.router.on_inbound_envelope(envelope).await.unwrap_err();
        assert!(err.is_session_fatal());
        assert!(bob.router.registry().is_empty().await);
        assert!(matches!(
            drain(&mut bob.events).as_slice(),
            [RouterEvent::SessionEnded { .. }]
        ));
        assert!(pump(&mut alice, &mut bob).await.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_handshake_is_reaped() {
        let mut alice = node(ALICE, ProtocolType::Otr);
        alice.router.start_session(BOB, None).await.unwrap();

        let early = alice.router.expire_stalled_handshakes(Utc::now()).await;
        assert!(early.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(120);
        let expired = alice.router.expire_stalled_handshakes(later).await;
        assert_eq!(expired, vec![BOB.to_string()]);
        assert!(alice.router.registry().is_empty().await);
        assert!(matches!(
            drain(&mut alice.events).as_slice(),
            [RouterEvent::SessionEnded { .. }]
        ));
    }

    #[tokio::test]
    async fn test_end_session_forgets_record() {
        let mut alice = node(ALICE, ProtocolType::Otr);
        let mut bob = node(BOB, ProtocolType::Otr);
        handshake(&mut alice, &mut bob, ProtocolType::Otr).await;
        assert_eq!(alice.backend.sessions().unwrap().len(), 1);

        assert!(alice.router.end_session(BOB).await.unwrap());
        assert!(!alice.router.end_session(BOB).await.unwrap());
        assert!(alice.backend.sessions().unwrap().is_empty());
        assert!(alice.router.history(BOB).await.is_err());
    }

    #[tokio::test]
    async fn test_sessions_survive_restart() {
        for protocol in [ProtocolType::Otr, ProtocolType::DoubleRatchet] {
            let mut alice = node(ALICE, protocol);
            let mut bob = node(BOB, protocol);
            handshake(&mut alice, &mut bob, protocol).await;
            alice.router.send_application_message(BOB, "before").await.unwrap();
            assert!(pump(&mut alice, &mut bob).await.is_empty());

            let mut bob = node_with(
                BOB,
                bob.keypair.clone(),
                Arc::clone(&bob.backend),
                protocol,
                EngineOptions::default(),
                16,
            );
            assert_eq!(bob.router.restore_sessions().await.unwrap(), 1);
            assert_eq!(bob.router.history(ALICE).await.unwrap().len(), 1);

            alice.router.send_application_message(BOB, "after").await.unwrap();
            assert!(pump(&mut alice, &mut bob).await.is_empty());
            let events = drain(&mut bob.events);
            assert!(matches!(
                events.as_slice(),
                [RouterEvent::MessageReceived { content, .. }] if content == "after"
            ));
            assert_eq!(bob.router.history(ALICE).await.unwrap().len(), 2);
        }
    }
}
