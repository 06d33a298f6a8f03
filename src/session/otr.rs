//! OTR-style authenticated key exchange and data messages.
//!
//! The initiator sends the plaintext query `?OTRv3?`. The exchange that
//! follows mirrors OTR's AKE with X25519 in place of the DH group and
//! Ed25519 in place of DSA:
//!
//! ```text
//! initiator                                responder
//!     ?OTRv3?                  -->
//!                              <--   DH-Commit  AES(r, g^x), SHA256(g^x)
//!     DH-Key  g^y              -->
//!                              <--   Reveal-Sig r, Enc_c(B, sig_B(M_B)), MAC_m2
//!     Signature                -->
//!     Enc_c'(A, sig_A(M_A)), MAC_m2'
//! ```
//!
//! Both sides derive `ssid`, `c`, `c'`, `m1`, `m2`, `m1'`, `m2'` and one key
//! per direction from the X25519 secret with HKDF-SHA256. Data messages are
//! ChaCha20-Poly1305 with a strictly increasing counter nonce and the ssid as
//! associated data.

use crate::crypto::identity::verify_signature;
use crate::crypto::mac::{hkdf_expand, hmac_sha256, random_key, verify_hmac_sha256, KEY_SIZE};
use crate::crypto::IdentityKeyPair;
use crate::session::engine::{
    Decrypted, EngineFailure, EngineOptions, EngineState, Fingerprint, Protocol, ProtocolType,
    SessionId,
};
use crate::session::fragment::{Armor, Reassembler, Reassembly};
use crate::utils::{CryptoError, MessengerError, Result, SessionError};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Plaintext query that opens a key exchange
pub const QUERY_MESSAGE: &[u8] = b"?OTRv3?";

const AKE_SALT: &[u8] = b"otr-messenger/ake/v1";

type Step<T> = std::result::Result<T, EngineFailure>;

/// Wire messages after the query
#[derive(Debug, Clone, Serialize, Deserialize)]
enum OtrMessage {
    DhCommit {
        encrypted_gx: Vec<u8>,
        hashed_gx: [u8; 32],
    },
    DhKey {
        gy: [u8; 32],
    },
    RevealSignature {
        r: [u8; 32],
        encrypted_sig: Vec<u8>,
        mac: [u8; 32],
    },
    Signature {
        encrypted_sig: Vec<u8>,
        mac: [u8; 32],
    },
    Data {
        counter: u64,
        ciphertext: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
struct Commit {
    encrypted_gx: Vec<u8>,
    hashed_gx: [u8; 32],
}

impl Commit {
    fn message(&self) -> OtrMessage {
        OtrMessage::DhCommit {
            encrypted_gx: self.encrypted_gx.clone(),
            hashed_gx: self.hashed_gx,
        }
    }
}

/// Which half of the exchange this side played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    CommitSender,
    KeySender,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct AkeKeys {
    ssid: [u8; KEY_SIZE],
    c: [u8; KEY_SIZE],
    c_prime: [u8; KEY_SIZE],
    m1: [u8; KEY_SIZE],
    m2: [u8; KEY_SIZE],
    m1_prime: [u8; KEY_SIZE],
    m2_prime: [u8; KEY_SIZE],
    from_commit_sender: [u8; KEY_SIZE],
    from_key_sender: [u8; KEY_SIZE],
}

impl AkeKeys {
    fn derive(shared_secret: &[u8; 32]) -> Result<Self> {
        let key = |label: &[u8]| hkdf_expand(AKE_SALT, shared_secret, label);
        Ok(Self {
            ssid: key(b"ssid")?,
            c: key(b"c")?,
            c_prime: key(b"c'")?,
            m1: key(b"m1")?,
            m2: key(b"m2")?,
            m1_prime: key(b"m1'")?,
            m2_prime: key(b"m2'")?,
            from_commit_sender: key(b"data/commit-sender")?,
            from_key_sender: key(b"data/key-sender")?,
        })
    }
}

/// Progress through the key exchange
enum Ake {
    Idle,
    QuerySent,
    AwaitingDhKey {
        x: Zeroizing<[u8; 32]>,
        gx: [u8; 32],
        r: Zeroizing<[u8; 32]>,
        commit: Commit,
    },
    AwaitingRevealSig {
        y: Zeroizing<[u8; 32]>,
        gy: [u8; 32],
        commit: Commit,
    },
    AwaitingSig {
        keys: AkeKeys,
        gx: [u8; 32],
        gy: [u8; 32],
    },
}

/// Established channel; also the persisted snapshot
#[derive(Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
struct DataChannel {
    ssid: u64,
    fingerprint: String,
    peer_key: [u8; 32],
    send_key: [u8; KEY_SIZE],
    recv_key: [u8; KEY_SIZE],
    send_counter: u64,
    recv_floor: u64,
}

/// One OTR-style conversation
pub struct OtrSession {
    keypair: IdentityKeyPair,
    options: EngineOptions,
    state: EngineState,
    ake: Ake,
    channel: Option<DataChannel>,
    deadline: Option<DateTime<Utc>>,
    reassembler: Reassembler,
}

impl std::fmt::Debug for OtrSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtrSession")
            .field("state", &self.state)
            .field("session_id", &self.session_id())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl OtrSession {
    /// Unstarted engine signing with `keypair`
    pub fn new(keypair: IdentityKeyPair, options: EngineOptions) -> Self {
        Self {
            keypair,
            options,
            state: EngineState::Unstarted,
            ake: Ake::Idle,
            channel: None,
            deadline: None,
            reassembler: Reassembler::default(),
        }
    }

    /// Rebuild an encrypted engine from [`Protocol::serialize`] output
    pub fn restore(keypair: IdentityKeyPair, options: EngineOptions, bytes: &[u8]) -> Result<Self> {
        let channel: DataChannel = bincode::deserialize(bytes)?;
        let mut session = Self::new(keypair, options);
        session.channel = Some(channel);
        session.state = EngineState::Encrypted;
        Ok(session)
    }

    fn send(&self, message: &OtrMessage) -> Step<Vec<Vec<u8>>> {
        let armored = Armor::OTR.encode(message).map_err(internal)?;
        Ok(Armor::OTR.fragment(armored, self.options.max_fragment_size))
    }

    fn enter_handshake(&mut self) {
        if self.state == EngineState::Unstarted {
            self.state = EngineState::AwaitingHandshake;
            self.deadline = Some(self.options.handshake_deadline(Utc::now()));
        }
    }

    fn unexpected(&self, operation: &'static str) -> EngineFailure {
        EngineFailure::UnexpectedState {
            state: self.state,
            operation,
        }
    }

    fn on_query(&mut self) -> Step<Vec<Vec<u8>>> {
        if let Ake::AwaitingDhKey { commit, .. } = &self.ake {
            let message = commit.message();
            return self.send(&message);
        }
        self.send_fresh_commit()
    }

    fn send_fresh_commit(&mut self) -> Step<Vec<Vec<u8>>> {
        let x = StaticSecret::random_from_rng(OsRng);
        let gx = PublicKey::from(&x).to_bytes();
        let r = Zeroizing::new(random_key());

        let commit = Commit {
            encrypted_gx: seal(&r, &gx)?,
            hashed_gx: Sha256::digest(gx).into(),
        };
        let message = commit.message();

        self.ake = Ake::AwaitingDhKey {
            x: Zeroizing::new(x.to_bytes()),
            gx,
            r,
            commit,
        };
        self.enter_handshake();
        self.send(&message)
    }

    fn on_dh_commit(&mut self, commit: Commit) -> Step<Vec<Vec<u8>>> {
        match &mut self.ake {
            // Simultaneous commits: the higher hash keeps its commit.
            Ake::AwaitingDhKey { commit: ours, .. } if ours.hashed_gx > commit.hashed_gx => {
                let message = ours.message();
                return self.send(&message);
            }
            Ake::AwaitingRevealSig {
                gy, commit: stored, ..
            } => {
                *stored = commit;
                let gy = *gy;
                return self.send(&OtrMessage::DhKey { gy });
            }
            _ => {}
        }

        let y = StaticSecret::random_from_rng(OsRng);
        let gy = PublicKey::from(&y).to_bytes();
        self.ake = Ake::AwaitingRevealSig {
            y: Zeroizing::new(y.to_bytes()),
            gy,
            commit,
        };
        self.enter_handshake();
        self.send(&OtrMessage::DhKey { gy })
    }

    fn on_dh_key(&mut self, gy: [u8; 32]) -> Step<Vec<Vec<u8>>> {
        let (x, gx, r) = match std::mem::replace(&mut self.ake, Ake::Idle) {
            Ake::AwaitingDhKey { x, gx, r, .. } => (x, gx, r),
            other => {
                // A retransmitted DH-Key after we moved on is harmless.
                let duplicate =
                    matches!(other, Ake::AwaitingSig { .. }) || self.state == EngineState::Encrypted;
                self.ake = other;
                return if duplicate {
                    Ok(Vec::new())
                } else {
                    Err(self.unexpected("accept a DH key"))
                };
            }
        };

        let keys = derive_keys(&x, &gy)?;
        let encrypted_sig = self.seal_identity(&keys.c, &keys.m1, &gx, &gy)?;
        let mac = hmac_sha256(&keys.m2, &[encrypted_sig.as_slice()]).map_err(internal)?;

        self.ake = Ake::AwaitingSig { keys, gx, gy };
        self.send(&OtrMessage::RevealSignature {
            r: *r,
            encrypted_sig,
            mac,
        })
    }

    fn on_reveal_signature(
        &mut self,
        r: &[u8; 32],
        encrypted_sig: &[u8],
        mac: &[u8; 32],
    ) -> Step<Vec<Vec<u8>>> {
        let (y, gy, commit) = match std::mem::replace(&mut self.ake, Ake::Idle) {
            Ake::AwaitingRevealSig { y, gy, commit } => (y, gy, commit),
            other => {
                self.ake = other;
                return Err(self.unexpected("accept a reveal-signature"));
            }
        };

        let gx: [u8; 32] = open(r, &commit.encrypted_gx)?
            .as_slice()
            .try_into()
            .map_err(|_| EngineFailure::handshake("committed g^x has the wrong length"))?;
        if Sha256::digest(gx)[..] != commit.hashed_gx[..] {
            return Err(EngineFailure::handshake("g^x does not match its commitment"));
        }

        let keys = derive_keys(&y, &gx)?;
        verify_hmac_sha256(&keys.m2, &[encrypted_sig], mac)
            .map_err(|_| EngineFailure::handshake("reveal-signature MAC mismatch"))?;
        let peer_key = open_identity(&keys.c, &keys.m1, encrypted_sig, &gx, &gy)?;

        let encrypted_sig = self.seal_identity(&keys.c_prime, &keys.m1_prime, &gy, &gx)?;
        let mac = hmac_sha256(&keys.m2_prime, &[encrypted_sig.as_slice()]).map_err(internal)?;

        self.establish(&keys, Role::KeySender, peer_key);
        self.send(&OtrMessage::Signature { encrypted_sig, mac })
    }

    fn on_signature(&mut self, encrypted_sig: &[u8], mac: &[u8; 32]) -> Step<Vec<Vec<u8>>> {
        let (keys, gx, gy) = match std::mem::replace(&mut self.ake, Ake::Idle) {
            Ake::AwaitingSig { keys, gx, gy } => (keys, gx, gy),
            other => {
                self.ake = other;
                return Err(self.unexpected("accept a signature"));
            }
        };

        verify_hmac_sha256(&keys.m2_prime, &[encrypted_sig], mac)
            .map_err(|_| EngineFailure::handshake("signature MAC mismatch"))?;
        let peer_key = open_identity(&keys.c_prime, &keys.m1_prime, encrypted_sig, &gy, &gx)?;

        self.establish(&keys, Role::CommitSender, peer_key);
        Ok(Vec::new())
    }

    /// `Enc_c(pub || sign(HMAC_m(first || second || pub)))`
    fn seal_identity(
        &self,
        c: &[u8; KEY_SIZE],
        m: &[u8; KEY_SIZE],
        first: &[u8; 32],
        second: &[u8; 32],
    ) -> Step<Vec<u8>> {
        let own_key = self.keypair.public_key_bytes();
        let authenticator =
            hmac_sha256(m, &[&first[..], &second[..], &own_key[..]]).map_err(internal)?;
        let signature = self.keypair.sign(&authenticator);

        let mut block = Zeroizing::new(Vec::with_capacity(own_key.len() + signature.len()));
        block.extend_from_slice(&own_key);
        block.extend_from_slice(&signature);
        seal(c, &block)
    }

    fn establish(&mut self, keys: &AkeKeys, role: Role, peer_key: [u8; 32]) {
        let (send_key, recv_key) = match role {
            Role::CommitSender => (keys.from_commit_sender, keys.from_key_sender),
            Role::KeySender => (keys.from_key_sender, keys.from_commit_sender),
        };
        let ssid = SessionId::from_key_material(&keys.ssid);
        let fingerprint = Fingerprint::from_identity_keys(&self.keypair.public_key_bytes(), &peer_key);

        log::debug!("OTR key exchange complete: ssid {ssid}, fingerprint {fingerprint}");
        self.channel = Some(DataChannel {
            ssid: ssid.0,
            fingerprint: fingerprint.0,
            peer_key,
            send_key,
            recv_key,
            send_counter: 0,
            recv_floor: 0,
        });
        self.state = EngineState::Encrypted;
        self.deadline = None;
        self.ake = Ake::Idle;
    }

    fn on_data(&mut self, counter: u64, ciphertext: &[u8]) -> Step<Vec<u8>> {
        let state = self.state;
        let Some(channel) = self.channel.as_mut() else {
            return Err(EngineFailure::UnexpectedState {
                state,
                operation: "decrypt data",
            });
        };

        if counter < channel.recv_floor {
            return Err(EngineFailure::malformed(format!(
                "replayed data counter {counter}"
            )));
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&channel.recv_key));
        let aad = channel.ssid.to_be_bytes();
        let plaintext = cipher
            .decrypt(
                &data_nonce(counter),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| EngineFailure::malformed("data message failed authentication"))?;

        channel.recv_floor = counter.saturating_add(1);
        Ok(plaintext)
    }
}

impl Protocol for OtrSession {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Otr
    }

    fn new_session(&mut self) -> Result<Vec<u8>> {
        if self.state == EngineState::Ended {
            return Err(SessionError::InvalidState {
                state: "cannot start an ended session".to_string(),
            }
            .into());
        }

        self.ake = Ake::QuerySent;
        if self.state == EngineState::Unstarted {
            self.state = EngineState::AwaitingHandshake;
            self.deadline = Some(self.options.handshake_deadline(Utc::now()));
        }
        Ok(QUERY_MESSAGE.to_vec())
    }

    fn decrypt(&mut self, wire: &[u8]) -> Decrypted {
        if self.state == EngineState::Ended {
            return Decrypted::Failure(self.unexpected("decrypt"));
        }

        let step = if wire == QUERY_MESSAGE {
            self.on_query().map(Decrypted::HandshakeContinuation)
        } else {
            let whole = match self.reassembler.push(&Armor::OTR, wire) {
                Ok(Reassembly::NotFragment) => wire.to_vec(),
                Ok(Reassembly::Buffered) => return Decrypted::nothing(),
                Ok(Reassembly::Complete(whole)) => whole,
                Err(failure) => return Decrypted::Failure(failure),
            };
            match Armor::OTR.decode::<OtrMessage>(&whole) {
                Ok(message) => self.dispatch(message),
                Err(failure) => return Decrypted::Failure(failure),
            }
        };

        match step {
            Ok(decrypted) => decrypted,
            Err(failure) => {
                if failure.is_session_fatal() {
                    log::warn!("OTR handshake failed: {failure}");
                    self.end_session();
                }
                Decrypted::Failure(failure)
            }
        }
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<Vec<u8>>> {
        let state = self.state;
        let Some(channel) = self.channel.as_mut() else {
            return Err(SessionError::InvalidState {
                state: format!("cannot encrypt while {state}"),
            }
            .into());
        };

        let counter = channel.send_counter;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&channel.send_key));
        let aad = channel.ssid.to_be_bytes();
        let ciphertext = cipher
            .encrypt(
                &data_nonce(counter),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Encryption {
                reason: "data message encryption failed".to_string(),
            })?;
        channel.send_counter = counter
            .checked_add(1)
            .ok_or_else(|| SessionError::InvalidState {
                state: "send counter exhausted".to_string(),
            })?;

        let armored = Armor::OTR.encode(&OtrMessage::Data {
            counter,
            ciphertext,
        })?;
        Ok(Armor::OTR.fragment(armored, self.options.max_fragment_size))
    }

    fn end_session(&mut self) {
        self.state = EngineState::Ended;
        self.ake = Ake::Idle;
        self.channel = None;
        self.deadline = None;
        self.reassembler = Reassembler::default();
    }

    fn state(&self) -> EngineState {
        self.state
    }

    fn session_id(&self) -> Option<SessionId> {
        self.channel.as_ref().map(|c| SessionId(c.ssid))
    }

    fn fingerprint(&self) -> Option<Fingerprint> {
        self.channel
            .as_ref()
            .map(|c| Fingerprint(c.fingerprint.clone()))
    }

    fn peer_public_key(&self) -> Option<[u8; 32]> {
        self.channel.as_ref().map(|c| c.peer_key)
    }

    fn expire_handshake(&mut self, now: DateTime<Utc>) -> bool {
        let overdue = self.state == EngineState::AwaitingHandshake
            && self.deadline.is_some_and(|deadline| deadline <= now);
        if overdue {
            self.end_session();
        }
        overdue
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        match &self.channel {
            Some(channel) if self.state == EngineState::Encrypted => {
                Ok(bincode::serialize(channel)?)
            }
            _ => Err(SessionError::InvalidState {
                state: format!("cannot snapshot a session while {}", self.state),
            }
            .into()),
        }
    }
}

impl OtrSession {
    fn dispatch(&mut self, message: OtrMessage) -> Step<Decrypted> {
        match message {
            OtrMessage::DhCommit {
                encrypted_gx,
                hashed_gx,
            } => self
                .on_dh_commit(Commit {
                    encrypted_gx,
                    hashed_gx,
                })
                .map(Decrypted::HandshakeContinuation),
            OtrMessage::DhKey { gy } => self.on_dh_key(gy).map(Decrypted::HandshakeContinuation),
            OtrMessage::RevealSignature {
                r,
                encrypted_sig,
                mac,
            } => self
                .on_reveal_signature(&r, &encrypted_sig, &mac)
                .map(Decrypted::HandshakeContinuation),
            OtrMessage::Signature { encrypted_sig, mac } => self
                .on_signature(&encrypted_sig, &mac)
                .map(Decrypted::HandshakeContinuation),
            OtrMessage::Data {
                counter,
                ciphertext,
            } => self
                .on_data(counter, &ciphertext)
                .map(|plaintext| Decrypted::ApplicationData(vec![plaintext])),
        }
    }
}

fn internal(error: MessengerError) -> EngineFailure {
    EngineFailure::handshake(error.to_string())
}

fn derive_keys(own_secret: &[u8; 32], their_public: &[u8; 32]) -> Step<AkeKeys> {
    let shared = StaticSecret::from(*own_secret).diffie_hellman(&PublicKey::from(*their_public));
    if !shared.was_contributory() {
        return Err(EngineFailure::handshake("peer sent a low-order DH key"));
    }
    AkeKeys::derive(shared.as_bytes()).map_err(internal)
}

/// Verify the identity block sealed by [`OtrSession::seal_identity`] and
/// return the peer's identity key
fn open_identity(
    c: &[u8; KEY_SIZE],
    m: &[u8; KEY_SIZE],
    encrypted_sig: &[u8],
    first: &[u8; 32],
    second: &[u8; 32],
) -> Step<[u8; 32]> {
    let block = Zeroizing::new(open(c, encrypted_sig)?);
    if block.len() != 32 + 64 {
        return Err(EngineFailure::handshake("identity block has the wrong length"));
    }

    let mut peer_key = [0u8; 32];
    peer_key.copy_from_slice(&block[..32]);
    let authenticator =
        hmac_sha256(m, &[&first[..], &second[..], &peer_key[..]]).map_err(internal)?;
    verify_signature(&peer_key, &authenticator, &block[32..])
        .map_err(|_| EngineFailure::handshake("identity signature does not verify"))?;
    Ok(peer_key)
}

/// Handshake keys are single-use, so the nonce is fixed
fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Step<Vec<u8>> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(&Nonce::default(), plaintext)
        .map_err(|_| EngineFailure::handshake("handshake encryption failed"))
}

fn open(key: &[u8; KEY_SIZE], ciphertext: &[u8]) -> Step<Vec<u8>> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(&Nonce::default(), ciphertext)
        .map_err(|_| EngineFailure::handshake("handshake block failed authentication"))
}

fn data_nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce::from(nonce)
}
