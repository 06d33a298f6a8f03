//! Double Ratchet sessions.
//!
//! The key exchange is a signed ephemeral X25519 hello / hello-ack pair. The
//! shared secret seeds a Double Ratchet with automatic key rotation and a
//! bounded cache of skipped message keys; the initiator's first ratchet
//! message (a fixed confirmation payload) completes the handshake.

use crate::crypto::identity::verify_signature;
use crate::crypto::mac::{hkdf_expand, KEY_SIZE};
use crate::crypto::IdentityKeyPair;
use crate::session::engine::{
    Decrypted, EngineFailure, EngineOptions, EngineState, Fingerprint, Protocol, ProtocolType,
    SessionId,
};
use crate::session::fragment::{Armor, Reassembler, Reassembly};
use crate::utils::{CryptoError, Result, SessionError};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// HKDF info for root key derivation
const ROOT_KEY_INFO: &[u8] = b"DoubleRatchet-RootKey";

/// HKDF info for chain key derivation
const CHAIN_KEY_INFO: &[u8] = b"DoubleRatchet-ChainKey";

/// Maximum number of skipped message keys to store
const MAX_SKIP: usize = 1000;

const HELLO_CONTEXT: &[u8] = b"otr-messenger/ratchet/hello";
const ACK_CONTEXT: &[u8] = b"otr-messenger/ratchet/ack";
const CONFIRM_PAYLOAD: &[u8] = b"otr-messenger/ratchet/confirm";

/// ChaCha20-Poly1305 nonce length
const NONCE_SIZE: usize = 12;

/// Encrypted message with Double Ratchet metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetMessage {
    /// Sender's current ratchet public key
    pub dh_public_key: [u8; 32],
    /// Length of the sender's previous sending chain
    pub previous_chain_length: u32,
    /// Message number in the current chain
    pub message_number: u32,
    /// Nonce followed by the encrypted content
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum RatchetWire {
    Hello {
        identity_key: [u8; 32],
        ephemeral_key: [u8; 32],
        signature: Vec<u8>,
    },
    HelloAck {
        identity_key: [u8; 32],
        ephemeral_key: [u8; 32],
        signature: Vec<u8>,
    },
    Confirm(RatchetMessage),
    Data(RatchetMessage),
}

/// The Double Ratchet state machine for one conversation
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RatchetState {
    /// Root key for key derivation
    root_key: [u8; KEY_SIZE],
    /// Current sending chain key
    sending_chain_key: Option<[u8; KEY_SIZE]>,
    /// Current receiving chain key
    receiving_chain_key: Option<[u8; KEY_SIZE]>,
    /// Our current ratchet secret
    dh_secret: [u8; 32],
    /// Our current ratchet public key
    dh_public: [u8; 32],
    /// Remote ratchet public key
    remote_dh_public: Option<[u8; 32]>,
    /// Previous sending chain length
    previous_sending_chain_length: u32,
    /// Current sending message number
    sending_message_number: u32,
    /// Current receiving message number
    receiving_message_number: u32,
    /// Skipped message keys for out-of-order delivery
    #[zeroize(skip)]
    skipped_message_keys: HashMap<([u8; 32], u32), [u8; KEY_SIZE]>,
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("root_key", &"[REDACTED]")
            .field("sending_chain_key", &"[REDACTED]")
            .field("receiving_chain_key", &"[REDACTED]")
            .field("dh_public", &hex::encode(self.dh_public))
            .field("previous_sending_chain_length", &self.previous_sending_chain_length)
            .field("sending_message_number", &self.sending_message_number)
            .field("receiving_message_number", &self.receiving_message_number)
            .field("skipped_keys", &self.skipped_message_keys.len())
            .finish()
    }
}

impl RatchetState {
    /// Initialize as the initiator, who knows the responder's ratchet key
    pub fn new_initiator(shared_secret: &[u8; KEY_SIZE], remote_dh_public: [u8; 32]) -> Result<Self> {
        let dh_private = StaticSecret::random_from_rng(OsRng);
        let dh_public = PublicKey::from(&dh_private);

        let root_key = Self::kdf_root_key(shared_secret)?;
        let (new_root_key, sending_chain_key) =
            Self::kdf_rk(&root_key, &dh_private, &PublicKey::from(remote_dh_public))?;

        Ok(Self {
            root_key: new_root_key,
            sending_chain_key: Some(sending_chain_key),
            receiving_chain_key: None,
            dh_secret: dh_private.to_bytes(),
            dh_public: dh_public.to_bytes(),
            remote_dh_public: Some(remote_dh_public),
            previous_sending_chain_length: 0,
            sending_message_number: 0,
            receiving_message_number: 0,
            skipped_message_keys: HashMap::new(),
        })
    }

    /// Initialize as the responder, owning the ratchet key the initiator uses
    pub fn new_recipient(shared_secret: &[u8; KEY_SIZE], dh_secret: [u8; 32]) -> Result<Self> {
        let dh_public = PublicKey::from(&StaticSecret::from(dh_secret)).to_bytes();

        Ok(Self {
            root_key: Self::kdf_root_key(shared_secret)?,
            sending_chain_key: None,
            receiving_chain_key: None,
            dh_secret,
            dh_public,
            remote_dh_public: None,
            previous_sending_chain_length: 0,
            sending_message_number: 0,
            receiving_message_number: 0,
            skipped_message_keys: HashMap::new(),
        })
    }

    /// Encrypt a message using the Double Ratchet
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage> {
        let chain_key = self
            .sending_chain_key
            .ok_or_else(|| SessionError::InvalidState {
                state: "No sending chain key available".to_string(),
            })?;

        let (new_chain_key, message_key) = Self::kdf_ck(&chain_key)?;
        self.sending_chain_key = Some(new_chain_key);
        let ciphertext = Self::encrypt_message(&message_key, plaintext)?;

        let message = RatchetMessage {
            dh_public_key: self.dh_public,
            previous_chain_length: self.previous_sending_chain_length,
            message_number: self.sending_message_number,
            ciphertext,
        };
        self.sending_message_number += 1;

        Ok(message)
    }

    /// Decrypt a message using the Double Ratchet.
    ///
    /// State only advances when decryption succeeds, so a forged message
    /// cannot desynchronise the chains.
    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>> {
        let mut next = self.clone();
        let plaintext = next.decrypt_in_place(message)?;
        *self = next;
        Ok(plaintext)
    }

    fn decrypt_in_place(&mut self, message: &RatchetMessage) -> Result<Vec<u8>> {
        let skipped_key = (message.dh_public_key, message.message_number);
        if let Some(message_key) = self.skipped_message_keys.remove(&skipped_key) {
            return Self::decrypt_message(&message_key, &message.ciphertext);
        }

        if self.remote_dh_public != Some(message.dh_public_key) {
            self.skip_message_keys(message.previous_chain_length)?;
            self.dh_ratchet_receive(message.dh_public_key)?;
        }

        self.skip_message_keys(message.message_number)?;
        let chain_key = self
            .receiving_chain_key
            .ok_or_else(|| SessionError::DoubleRatchetFailure {
                reason: "No receiving chain key available".to_string(),
            })?;
        let (new_chain_key, message_key) = Self::kdf_ck(&chain_key)?;
        self.receiving_chain_key = Some(new_chain_key);
        self.receiving_message_number = message.message_number.saturating_add(1);

        Self::decrypt_message(&message_key, &message.ciphertext)
    }

    /// Perform DH ratchet step when receiving a new DH public key
    fn dh_ratchet_receive(&mut self, remote_dh_public: [u8; 32]) -> Result<()> {
        self.previous_sending_chain_length = self.sending_message_number;
        self.sending_message_number = 0;
        self.receiving_message_number = 0;
        self.remote_dh_public = Some(remote_dh_public);
        let remote = PublicKey::from(remote_dh_public);

        let dh_private = StaticSecret::from(self.dh_secret);
        let (new_root_key, receiving_chain_key) =
            Self::kdf_rk(&self.root_key, &dh_private, &remote)?;
        self.root_key = new_root_key;
        self.receiving_chain_key = Some(receiving_chain_key);

        let new_dh_private = StaticSecret::random_from_rng(OsRng);
        let (new_root_key, sending_chain_key) =
            Self::kdf_rk(&self.root_key, &new_dh_private, &remote)?;
        self.root_key = new_root_key;
        self.sending_chain_key = Some(sending_chain_key);
        self.dh_public = PublicKey::from(&new_dh_private).to_bytes();
        self.dh_secret = new_dh_private.to_bytes();

        Ok(())
    }

    /// Store the keys of messages not yet received in the current chain
    fn skip_message_keys(&mut self, until: u32) -> Result<()> {
        let (Some(mut chain_key), Some(remote)) = (self.receiving_chain_key, self.remote_dh_public)
        else {
            return Ok(());
        };

        let missing = until.saturating_sub(self.receiving_message_number) as usize;
        if missing > MAX_SKIP || self.skipped_message_keys.len() + missing > MAX_SKIP {
            return Err(SessionError::MessageOrdering {
                expected: self.receiving_message_number,
                actual: until,
            }
            .into());
        }

        while self.receiving_message_number < until {
            let (new_chain_key, message_key) = Self::kdf_ck(&chain_key)?;
            self.skipped_message_keys
                .insert((remote, self.receiving_message_number), message_key);
            chain_key = new_chain_key;
            self.receiving_message_number += 1;
        }
        self.receiving_chain_key = Some(chain_key);

        Ok(())
    }

    /// Root key derivation function
    fn kdf_root_key(shared_secret: &[u8; KEY_SIZE]) -> Result<[u8; KEY_SIZE]> {
        hkdf_expand(&[0u8; KEY_SIZE], shared_secret, ROOT_KEY_INFO)
    }

    /// Root key and chain key derivation from DH output
    fn kdf_rk(
        root_key: &[u8; KEY_SIZE],
        dh_private: &StaticSecret,
        dh_public: &PublicKey,
    ) -> Result<([u8; KEY_SIZE], [u8; KEY_SIZE])> {
        let dh_output = dh_private.diffie_hellman(dh_public);
        let hkdf = Hkdf::<Sha256>::new(Some(root_key), dh_output.as_bytes());

        let mut output = Zeroizing::new([0u8; KEY_SIZE * 2]);
        hkdf.expand(ROOT_KEY_INFO, &mut output[..])
            .map_err(|_| CryptoError::KeyDerivation {
                reason: "Root and chain key derivation failed".to_string(),
            })?;

        let mut new_root_key = [0u8; KEY_SIZE];
        let mut chain_key = [0u8; KEY_SIZE];
        new_root_key.copy_from_slice(&output[..KEY_SIZE]);
        chain_key.copy_from_slice(&output[KEY_SIZE..]);

        Ok((new_root_key, chain_key))
    }

    /// Chain key derivation function
    fn kdf_ck(chain_key: &[u8; KEY_SIZE]) -> Result<([u8; KEY_SIZE], [u8; KEY_SIZE])> {
        let hkdf = Hkdf::<Sha256>::new(None, chain_key);

        let mut output = Zeroizing::new([0u8; KEY_SIZE * 2]);
        hkdf.expand(CHAIN_KEY_INFO, &mut output[..])
            .map_err(|_| CryptoError::KeyDerivation {
                reason: "Chain key derivation failed".to_string(),
            })?;

        let mut new_chain_key = [0u8; KEY_SIZE];
        let mut message_key = [0u8; KEY_SIZE];
        new_chain_key.copy_from_slice(&output[..KEY_SIZE]);
        message_key.copy_from_slice(&output[KEY_SIZE..]);

        Ok((new_chain_key, message_key))
    }

    /// Encrypt message with message key
    fn encrypt_message(message_key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(message_key));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

        let mut ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encryption {
                reason: "Message encryption failed".to_string(),
            })?;

        let mut result = nonce.to_vec();
        result.append(&mut ciphertext);
        Ok(result)
    }

    /// Decrypt message with message key
    fn decrypt_message(message_key: &[u8; KEY_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(CryptoError::Decryption {
                reason: "Ciphertext too short".to_string(),
            }
            .into());
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(message_key));
        let nonce = Nonce::from_slice(&ciphertext[..NONCE_SIZE]);

        cipher
            .decrypt(nonce, &ciphertext[NONCE_SIZE..])
            .map_err(|_| {
                CryptoError::Decryption {
                    reason: "Message decryption failed".to_string(),
                }
                .into()
            })
    }
}

/// Persisted form of an encrypted ratchet session
#[derive(Serialize, Deserialize)]
struct RatchetSnapshot {
    session_id: u64,
    fingerprint: String,
    peer_key: [u8; 32],
    ratchet: RatchetState,
}

struct Established {
    session_id: SessionId,
    fingerprint: Fingerprint,
    peer_key: [u8; 32],
}

enum Handshake {
    Idle,
    HelloSent {
        ephemeral: Zeroizing<[u8; 32]>,
        ephemeral_public: [u8; 32],
    },
    AckSent {
        ratchet: RatchetState,
        established: Established,
    },
}

/// One Double Ratchet conversation
pub struct RatchetSession {
    keypair: IdentityKeyPair,
    options: EngineOptions,
    state: EngineState,
    handshake: Handshake,
    ratchet: Option<RatchetState>,
    established: Option<Established>,
    deadline: Option<DateTime<Utc>>,
    reassembler: Reassembler,
}

impl std::fmt::Debug for RatchetSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetSession")
            .field("state", &self.state)
            .field("session_id", &self.session_id())
            .field("ratchet", &self.ratchet)
            .finish_non_exhaustive()
    }
}

impl RatchetSession {
    /// Unstarted engine signing with `keypair`
    pub fn new(keypair: IdentityKeyPair, options: EngineOptions) -> Self {
        Self {
            keypair,
            options,
            state: EngineState::Unstarted,
            handshake: Handshake::Idle,
            ratchet: None,
            established: None,
            deadline: None,
            reassembler: Reassembler::default(),
        }
    }

    /// Rebuild an encrypted engine from [`Protocol::serialize`] output
    pub fn restore(keypair: IdentityKeyPair, options: EngineOptions, bytes: &[u8]) -> Result<Self> {
        let snapshot: RatchetSnapshot = bincode::deserialize(bytes)?;
        let mut session = Self::new(keypair, options);
        session.established = Some(Established {
            session_id: SessionId(snapshot.session_id),
            fingerprint: Fingerprint(snapshot.fingerprint),
            peer_key: snapshot.peer_key,
        });
        session.ratchet = Some(snapshot.ratchet);
        session.state = EngineState::Encrypted;
        Ok(session)
    }

    fn send(&self, message: &RatchetWire) -> std::result::Result<Vec<Vec<u8>>, EngineFailure> {
        let armored = Armor::RATCHET
            .encode(message)
            .map_err(|e| EngineFailure::handshake(e.to_string()))?;
        Ok(Armor::RATCHET.fragment(armored, self.options.max_fragment_size))
    }

    fn enter_handshake(&mut self) {
        if self.state == EngineState::Unstarted {
            self.state = EngineState::AwaitingHandshake;
            self.deadline = Some(self.options.handshake_deadline(Utc::now()));
        }
    }

    fn hello(&mut self) -> RatchetWire {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        let signature = self.keypair.sign(&signed_hello(&ephemeral_public)).to_vec();

        self.handshake = Handshake::HelloSent {
            ephemeral: Zeroizing::new(ephemeral.to_bytes()),
            ephemeral_public,
        };
        RatchetWire::Hello {
            identity_key: self.keypair.public_key_bytes(),
            ephemeral_key: ephemeral_public,
            signature,
        }
    }

    fn on_hello(
        &mut self,
        identity_key: [u8; 32],
        their_ephemeral: [u8; 32],
        signature: &[u8],
    ) -> std::result::Result<Vec<Vec<u8>>, EngineFailure> {
        verify_signature(&identity_key, &signed_hello(&their_ephemeral), signature)
            .map_err(|_| EngineFailure::handshake("hello signature does not verify"))?;

        // Simultaneous hellos: the higher ephemeral key stays initiator.
        if let Handshake::HelloSent {
            ephemeral_public, ..
        } = &self.handshake
        {
            if *ephemeral_public > their_ephemeral {
                return Ok(Vec::new());
            }
        }

        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        let own_key = self.keypair.public_key_bytes();

        let shared = derive_shared(
            &ephemeral,
            &their_ephemeral,
            &transcript(&their_ephemeral, &ephemeral_public, &identity_key, &own_key),
        )?;
        let ratchet = RatchetState::new_recipient(&shared.root, ephemeral.to_bytes())
            .map_err(|e| EngineFailure::handshake(e.to_string()))?;

        let signature = self
            .keypair
            .sign(&signed_ack(&their_ephemeral, &ephemeral_public))
            .to_vec();

        self.handshake = Handshake::AckSent {
            ratchet,
            established: Established {
                session_id: shared.session_id,
                fingerprint: Fingerprint::from_identity_keys(&own_key, &identity_key),
                peer_key: identity_key,
            },
        };
        self.enter_handshake();
        self.send(&RatchetWire::HelloAck {
            identity_key: own_key,
            ephemeral_key: ephemeral_public,
            signature,
        })
    }

    fn on_hello_ack(
        &mut self,
        identity_key: [u8; 32],
        their_ephemeral: [u8; 32],
        signature: &[u8],
    ) -> std::result::Result<Vec<Vec<u8>>, EngineFailure> {
        let (ephemeral, ephemeral_public) =
            match std::mem::replace(&mut self.handshake, Handshake::Idle) {
                Handshake::HelloSent {
                    ephemeral,
                    ephemeral_public,
                } => (ephemeral, ephemeral_public),
                other => {
                    self.handshake = other;
                    return Err(EngineFailure::UnexpectedState {
                        state: self.state,
                        operation: "accept a hello-ack",
                    });
                }
            };

        verify_signature(
            &identity_key,
            &signed_ack(&ephemeral_public, &their_ephemeral),
            signature,
        )
        .map_err(|_| EngineFailure::handshake("hello-ack signature does not verify"))?;

        let own_key = self.keypair.public_key_bytes();
        let shared = derive_shared(
            &StaticSecret::from(*ephemeral),
            &their_ephemeral,
            &transcript(&ephemeral_public, &their_ephemeral, &own_key, &identity_key),
        )?;
        let mut ratchet = RatchetState::new_initiator(&shared.root, their_ephemeral)
            .map_err(|e| EngineFailure::handshake(e.to_string()))?;
        let confirm = ratchet
            .encrypt(CONFIRM_PAYLOAD)
            .map_err(|e| EngineFailure::handshake(e.to_string()))?;

        self.establish(
            ratchet,
            Established {
                session_id: shared.session_id,
                fingerprint: Fingerprint::from_identity_keys(&own_key, &identity_key),
                peer_key: identity_key,
            },
        );
        self.send(&RatchetWire::Confirm(confirm))
    }

    fn on_confirm(
        &mut self,
        message: &RatchetMessage,
    ) -> std::result::Result<Vec<Vec<u8>>, EngineFailure> {
        let (mut ratchet, established) =
            match std::mem::replace(&mut self.handshake, Handshake::Idle) {
                Handshake::AckSent {
                    ratchet,
                    established,
                } => (ratchet, established),
                other => {
                    self.handshake = other;
                    return Err(EngineFailure::UnexpectedState {
                        state: self.state,
                        operation: "accept a confirmation",
                    });
                }
            };

        let payload = ratchet
            .decrypt(message)
            .map_err(|_| EngineFailure::handshake("confirmation does not decrypt"))?;
        if payload != CONFIRM_PAYLOAD {
            return Err(EngineFailure::handshake("unexpected confirmation payload"));
        }

        self.establish(ratchet, established);
        Ok(Vec::new())
    }

    fn establish(&mut self, ratchet: RatchetState, established: Established) {
        log::debug!(
            "Ratchet key exchange complete: session {}, fingerprint {}",
            established.session_id,
            established.fingerprint
        );
        self.ratchet = Some(ratchet);
        self.established = Some(established);
        self.state = EngineState::Encrypted;
        self.deadline = None;
        self.handshake = Handshake::Idle;
    }

    fn on_data(&mut self, message: &RatchetMessage) -> std::result::Result<Vec<u8>, EngineFailure> {
        let state = self.state;
        let Some(ratchet) = self.ratchet.as_mut() else {
            return Err(EngineFailure::UnexpectedState {
                state,
                operation: "decrypt data",
            });
        };
        ratchet
            .decrypt(message)
            .map_err(|e| EngineFailure::malformed(e.to_string()))
    }

    fn dispatch(&mut self, message: RatchetWire) -> std::result::Result<Decrypted, EngineFailure> {
        match message {
            RatchetWire::Hello {
                identity_key,
                ephemeral_key,
                signature,
            } => self
                .on_hello(identity_key, ephemeral_key, &signature)
                .map(Decrypted::HandshakeContinuation),
            RatchetWire::HelloAck {
                identity_key,
                ephemeral_key,
                signature,
            } => self
                .on_hello_ack(identity_key, ephemeral_key, &signature)
                .map(Decrypted::HandshakeContinuation),
            RatchetWire::Confirm(message) => self
                .on_confirm(&message)
                .map(Decrypted::HandshakeContinuation),
            RatchetWire::Data(message) => self
                .on_data(&message)
                .map(|plaintext| Decrypted::ApplicationData(vec![plaintext])),
        }
    }
}

impl Protocol for RatchetSession {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::DoubleRatchet
    }

    fn new_session(&mut self) -> Result<Vec<u8>> {
        if self.state == EngineState::Ended {
            return Err(SessionError::InvalidState {
                state: "cannot start an ended session".to_string(),
            }
            .into());
        }

        let hello = self.hello();
        self.enter_handshake();
        Armor::RATCHET.encode(&hello)
    }

    fn decrypt(&mut self, wire: &[u8]) -> Decrypted {
        if self.state == EngineState::Ended {
            return Decrypted::Failure(EngineFailure::UnexpectedState {
                state: self.state,
                operation: "decrypt",
            });
        }

        let whole = match self.reassembler.push(&Armor::RATCHET, wire) {
            Ok(Reassembly::NotFragment) => wire.to_vec(),
            Ok(Reassembly::Buffered) => return Decrypted::nothing(),
            Ok(Reassembly::Complete(whole)) => whole,
            Err(failure) => return Decrypted::Failure(failure),
        };
        let message = match Armor::RATCHET.decode::<RatchetWire>(&whole) {
            Ok(message) => message,
            Err(failure) => return Decrypted::Failure(failure),
        };

        match self.dispatch(message) {
            Ok(decrypted) => decrypted,
            Err(failure) => {
                if failure.is_session_fatal() {
                    log::warn!("Ratchet handshake failed: {failure}");
                    self.end_session();
                }
                Decrypted::Failure(failure)
            }
        }
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<Vec<u8>>> {
        let state = self.state;
        let ratchet = self.ratchet.as_mut().ok_or_else(|| SessionError::InvalidState {
            state: format!("cannot encrypt while {state}"),
        })?;

        let message = ratchet.encrypt(plaintext)?;
        let armored = Armor::RATCHET.encode(&RatchetWire::Data(message))?;
        Ok(Armor::RATCHET.fragment(armored, self.options.max_fragment_size))
    }

    fn end_session(&mut self) {
        self.state = EngineState::Ended;
        self.handshake = Handshake::Idle;
        self.ratchet = None;
        self.established = None;
        self.deadline = None;
        self.reassembler = Reassembler::default();
    }

    fn state(&self) -> EngineState {
        self.state
    }

    fn session_id(&self) -> Option<SessionId> {
        self.established.as_ref().map(|e| e.session_id)
    }

    fn fingerprint(&self) -> Option<Fingerprint> {
        self.established.as_ref().map(|e| e.fingerprint.clone())
    }

    fn peer_public_key(&self) -> Option<[u8; 32]> {
        self.established.as_ref().map(|e| e.peer_key)
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
        match (&self.ratchet, &self.established) {
            (Some(ratchet), Some(established)) if self.state == EngineState::Encrypted => {
                Ok(bincode::serialize(&RatchetSnapshot {
                    session_id: established.session_id.0,
                    fingerprint: established.fingerprint.0.clone(),
                    peer_key: established.peer_key,
                    ratchet: ratchet.clone(),
                })?)
            }
            _ => Err(SessionError::InvalidState {
                state: format!("cannot snapshot a session while {}", self.state),
            }
            .into()),
        }
    }
}

struct SharedSecret {
    root: Zeroizing<[u8; KEY_SIZE]>,
    session_id: SessionId,
}

fn derive_shared(
    own_ephemeral: &StaticSecret,
    their_ephemeral: &[u8; 32],
    transcript: &[u8; 32],
) -> std::result::Result<SharedSecret, EngineFailure> {
    let dh = own_ephemeral.diffie_hellman(&PublicKey::from(*their_ephemeral));
    if !dh.was_contributory() {
        return Err(EngineFailure::handshake("peer sent a low-order ephemeral key"));
    }

    let derive = |label: &[u8]| {
        hkdf_expand(transcript, dh.as_bytes(), label)
            .map_err(|e| EngineFailure::handshake(e.to_string()))
    };
    Ok(SharedSecret {
        root: Zeroizing::new(derive(b"ratchet/root")?),
        session_id: SessionId::from_key_material(&derive(b"ratchet/ssid")?),
    })
}

/// Hash binding both ephemerals and identities, initiator first
fn transcript(
    initiator_ephemeral: &[u8; 32],
    responder_ephemeral: &[u8; 32],
    initiator_identity: &[u8; 32],
    responder_identity: &[u8; 32],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(initiator_ephemeral);
    hasher.update(responder_ephemeral);
    hasher.update(initiator_identity);
    hasher.update(responder_identity);
    hasher.finalize().into()
}

fn signed_hello(ephemeral: &[u8; 32]) -> Vec<u8> {
    [HELLO_CONTEXT, ephemeral.as_slice()].concat()
}

fn signed_ack(initiator_ephemeral: &[u8; 32], responder_ephemeral: &[u8; 32]) -> Vec<u8> {
    [
        ACK_CONTEXT,
        initiator_ephemeral.as_slice(),
        responder_ephemeral.as_slice(),
    ]
    .concat()
}
