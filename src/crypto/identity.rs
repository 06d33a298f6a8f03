//! Identity management and Ed25519 cryptographic operations.
//!
//! The long-term Ed25519 key pair signs the key exchange; it never encrypts
//! anything itself. [`LocalIdentity`] and [`PeerIdentity`] carry the routing
//! metadata that travels on every envelope.

use crate::utils::{CryptoError, Result};
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Ed25519 key pair for cryptographic identity operations
#[derive(Clone)]
pub struct IdentityKeyPair {
    /// The secret signing key
    signing_key: SigningKey,
    /// The public verifying key
    verifying_key: VerifyingKey,
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("signing_key", &"[REDACTED]")
            .field("verifying_key", &hex::encode(self.public_key_bytes()))
            .finish()
    }
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    ///
    /// # Example
    ///
    /// ```rust
    /// use otr_messenger::crypto::IdentityKeyPair;
    ///
    /// let keypair = IdentityKeyPair::generate();
    /// ```
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create an identity key pair from a secret key
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the secret key is not 32 bytes
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> Result<Self> {
        let secret: [u8; SECRET_KEY_LENGTH] =
            secret_bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKey {
                    reason: format!(
                        "Invalid secret key length: expected {}, got {}",
                        SECRET_KEY_LENGTH,
                        secret_bytes.len()
                    ),
                })?;

        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();

        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Load the key pair stored at `path`, generating and saving one if the
    /// file does not exist yet
    pub fn load_or_generate<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let secret = std::fs::read(path)?;
            return Self::from_secret_bytes(&secret);
        }

        let keypair = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        keypair.save_secret_key(path)?;
        log::info!("Generated new identity key at {}", path.display());
        Ok(keypair)
    }

    /// Write the secret key to `path`, replacing any existing file. On Unix
    /// the file is readable by its owner only.
    pub fn save_secret_key<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path)?;
        // mode() only applies on creation
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(&self.secret_key_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Get the public key as bytes
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Get the secret key as bytes
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Sign a message with this identity
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature against this identity's public key
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        verify_signature(&self.public_key_bytes(), message, signature)
    }

    /// MAC-like routing id derived from the public key
    pub fn default_routing_id(&self) -> String {
        let digest = Sha256::digest(self.public_key_bytes());
        digest[..6]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Verify `signature` over `message` with a raw Ed25519 public key
///
/// # Errors
///
/// Returns `CryptoError::SignatureVerification` for a malformed key or
/// signature, or when the signature does not match
pub fn verify_signature(
    public_key: &[u8; PUBLIC_KEY_LENGTH],
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::SignatureVerification)?;
    let signature: [u8; SIGNATURE_LENGTH] = signature
        .try_into()
        .map_err(|_| CryptoError::SignatureVerification)?;

    verifying_key
        .verify(message, &Signature::from_bytes(&signature))
        .map_err(|_| CryptoError::SignatureVerification.into())
}

/// How this node identifies itself on the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    /// Human-readable name
    pub display_name: String,
    /// MAC-like routing id
    pub routing_id: String,
    /// Address peers reach us on
    pub address: String,
}

impl LocalIdentity {
    /// Build the local identity, deriving the routing id from the key pair
    /// when none is configured
    pub fn new(
        display_name: String,
        routing_id: Option<String>,
        address: String,
        keypair: &IdentityKeyPair,
    ) -> Self {
        Self {
            display_name,
            routing_id: routing_id.unwrap_or_else(|| keypair.default_routing_id()),
            address,
        }
    }
}

impl fmt::Display for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] @ {}", self.display_name, self.routing_id, self.address)
    }
}

/// A conversation partner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Network address; the registry key
    pub address: String,
    /// MAC-like routing id, empty until the peer has sent us something
    pub routing_id: String,
    /// Display name, falls back to the routing id
    pub display_name: String,
}

impl PeerIdentity {
    /// Peer known only by address (outbound first contact)
    pub fn from_address<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            routing_id: String::new(),
            display_name: String::new(),
        }
    }

    /// Peer as seen on an inbound envelope
    pub fn new<A: Into<String>, R: Into<String>>(address: A, routing_id: R) -> Self {
        let routing_id = routing_id.into();
        Self {
            address: address.into(),
            display_name: routing_id.clone(),
            routing_id,
        }
    }

    /// Fill in what an inbound envelope taught us about a peer first
    /// contacted by address. Returns true if anything changed.
    pub fn learn_routing_id(&mut self, routing_id: &str) -> bool {
        if routing_id.is_empty() || self.routing_id == routing_id {
            return false;
        }
        self.routing_id = routing_id.to_string();
        if self.display_name.is_empty() {
            self.display_name = routing_id.to_string();
        }
        true
    }

    /// Best label for display
    pub fn label(&self) -> &str {
        if !self.display_name.is_empty() {
            &self.display_name
        } else if !self.routing_id.is_empty() {
            &self.routing_id
        } else {
            &self.address
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_keypair_from_secret() {
        let original = IdentityKeyPair::generate();
        let secret_bytes = original.secret_key_bytes();

        let restored = IdentityKeyPair::from_secret_bytes(&secret_bytes).unwrap();

        assert_eq!(original.public_key_bytes(), restored.public_key_bytes());
        assert!(IdentityKeyPair::from_secret_bytes(&secret_bytes[..16]).is_err());
    }

    #[test]
    fn test_signature_verification() {
        let keypair = IdentityKeyPair::generate();
        let message = b"Hello, world!";

        let signature = keypair.sign(message);
        assert!(keypair.verify(message, &signature).is_ok());
        assert!(keypair.verify(b"Hello, universe!", &signature).is_err());
        assert!(verify_signature(&keypair.public_key_bytes(), message, &signature[..10]).is_err());
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("identity.key");

        let first = IdentityKeyPair::load_or_generate(&path).unwrap();
        let second = IdentityKeyPair::load_or_generate(&path).unwrap();

        assert_eq!(first.public_key_bytes(), second.public_key_bytes());
    }

    #[cfg(unix)]
    #[test]
    fn test_secret_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.key");
        IdentityKeyPair::load_or_generate(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let replacement = IdentityKeyPair::generate();
        replacement.save_secret_key(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(
            IdentityKeyPair::load_or_generate(&path).unwrap().public_key_bytes(),
            replacement.public_key_bytes()
        );
    }

    #[test]
    fn test_routing_id_is_mac_like() {
        let keypair = IdentityKeyPair::generate();
        let routing_id = keypair.default_routing_id();

        assert_eq!(routing_id.len(), 17);
        assert_eq!(routing_id.matches(':').count(), 5);

        let local = LocalIdentity::new("Archil".into(), None, "10.0.0.1".into(), &keypair);
        assert_eq!(local.routing_id, routing_id);
    }

    #[test]
    fn test_peer_learns_routing_id() {
        let mut peer = PeerIdentity::from_address("10.0.0.2");
        assert_eq!(peer.label(), "10.0.0.2");

        assert!(peer.learn_routing_id("aa:bb:cc:dd:ee:ff"));
        assert!(!peer.learn_routing_id("aa:bb:cc:dd:ee:ff"));
        assert!(!peer.learn_routing_id(""));
        assert_eq!(peer.label(), "aa:bb:cc:dd:ee:ff");
    }
}
