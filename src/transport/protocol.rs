//! Wire envelope definitions and serialization.
//!
//! An envelope is the routing unit exchanged between nodes: addresses, the
//! sender's routing id, an optional protocol hint and the opaque engine
//! payload. On the wire it is one line of JSON with the payload in base64.

use crate::session::ProtocolType;
use crate::utils::{ProtocolError, Result};
use crate::MAX_MESSAGE_SIZE;
use serde::{Deserialize, Serialize};

/// Envelope format version
pub const ENVELOPE_VERSION: u32 = 1;

/// Routing envelope around one engine message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope format version
    #[serde(default = "default_version")]
    pub version: u32,
    /// Sender's network address
    pub source_address: String,
    /// Intended recipient's network address
    pub dest_address: String,
    /// Sender's MAC-like routing id
    #[serde(default)]
    pub source_routing_id: String,
    /// Opaque engine bytes
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Protocol the sender wants, attached when it starts a session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_protocol: Option<ProtocolType>,
}

fn default_version() -> u32 {
    ENVELOPE_VERSION
}

impl Envelope {
    /// Envelope carrying `payload` from `source` to `dest`
    pub fn new<S: Into<String>, D: Into<String>, R: Into<String>>(
        source_address: S,
        dest_address: D,
        source_routing_id: R,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            source_address: source_address.into(),
            dest_address: dest_address.into(),
            source_routing_id: source_routing_id.into(),
            payload,
            start_protocol: None,
        }
    }

    /// Attach the protocol hint for a session start
    #[must_use]
    pub fn with_start_protocol(mut self, protocol: ProtocolType) -> Self {
        self.start_protocol = Some(protocol);
        self
    }

    /// Serialize to one JSON line (without the trailing newline)
    pub fn to_json(&self) -> Result<String> {
        self.validate()?;
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one JSON line
    pub fn from_json(line: &str) -> Result<Self> {
        if line.len() > MAX_MESSAGE_SIZE * 2 {
            return Err(ProtocolError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE * 2,
            }
            .into());
        }

        let envelope: Self = serde_json::from_str(line).map_err(|e| ProtocolError::InvalidMessage {
            reason: format!("undecodable envelope: {e}"),
        })?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Validate envelope fields
    pub fn validate(&self) -> Result<()> {
        if self.version != ENVELOPE_VERSION {
            return Err(ProtocolError::InvalidMessage {
                reason: format!("unsupported envelope version {}", self.version),
            }
            .into());
        }
        if self.source_address.is_empty() {
            return Err(ProtocolError::MissingField {
                field: "source_address".to_string(),
            }
            .into());
        }
        if self.dest_address.is_empty() {
            return Err(ProtocolError::MissingField {
                field: "dest_address".to_string(),
            }
            .into());
        }
        if self.payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: self.payload.len(),
                max: MAX_MESSAGE_SIZE,
            }
            .into());
        }
        Ok(())
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_json_shape() {
        let envelope = Envelope::new("10.0.0.1", "10.0.0.2", "aa:bb:cc:dd:ee:ff", b"?OTRv3?".to_vec())
            .with_start_protocol(ProtocolType::Otr);
        let json = envelope.to_json().unwrap();

        assert!(json.contains("\"payload\":\"P09UUnYzPw==\""));
        assert!(json.contains("\"start_protocol\":\"otr\""));
        assert!(!json.contains('\n'));
        assert_eq!(Envelope::from_json(&json).unwrap(), envelope);
    }

    #[test]
    fn test_hint_is_optional() {
        let envelope = Envelope::new("10.0.0.1", "10.0.0.2", "", vec![1, 2, 3]);
        let json = envelope.to_json().unwrap();
        assert!(!json.contains("start_protocol"));

        let minimal = r#"{"source_address":"10.0.0.1","dest_address":"10.0.0.2","payload":"AQID"}"#;
        let parsed = Envelope::from_json(minimal).unwrap();
        assert_eq!(parsed.payload, vec![1, 2, 3]);
        assert_eq!(parsed.version, ENVELOPE_VERSION);
        assert!(parsed.start_protocol.is_none());
    }

    #[test]
    fn test_envelope_validation() {
        assert!(Envelope::from_json("not json").is_err());
        assert!(Envelope::from_json(r#"{"source_address":"","dest_address":"x","payload":""}"#).is_err());
        assert!(Envelope::from_json(r#"{"source_address":"a","dest_address":"b","payload":"%%"}"#).is_err());

        let oversized = Envelope::new("a", "b", "", vec![0u8; MAX_MESSAGE_SIZE + 1]);
        assert!(oversized.to_json().is_err());
    }
}
