//! Wire armor and fragmentation.
//!
//! Every engine message is bincode-encoded, base64-armored as
//! `?TAG:<base64>.` and, when longer than the configured fragment size,
//! split into `?TAG,k,n,piece,` fragments (`k` is 1-based).

use crate::session::engine::EngineFailure;
use crate::utils::{ProtocolError, Result};
use crate::MAX_MESSAGE_SIZE;
use base64::{engine::general_purpose, Engine as _};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Smallest `max_fragment_size` that leaves room for a useful piece
pub const MIN_FRAGMENT_SIZE: usize = 64;

/// Header and trailer bytes of a fragment, assuming at most five digits
/// for each of `k` and `n`: `?` `,` `,` `,` `,` plus the digits.
const FRAGMENT_FRAMING: usize = 15;

/// Armor for one protocol's wire messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Armor {
    tag: &'static str,
}

impl Armor {
    /// OTR-style engine messages
    pub const OTR: Self = Self { tag: "OTR" };
    /// Double Ratchet engine messages
    pub const RATCHET: Self = Self { tag: "DRT" };

    fn whole_prefix(&self) -> String {
        format!("?{}:", self.tag)
    }

    fn fragment_prefix(&self) -> String {
        format!("?{},", self.tag)
    }

    /// Encode and armor one message
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>> {
        let encoded = bincode::serialize(message)?;
        let body = general_purpose::STANDARD.encode(encoded);
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: body.len(),
                max: MAX_MESSAGE_SIZE,
            }
            .into());
        }
        Ok(format!("{}{body}.", self.whole_prefix()).into_bytes())
    }

    /// Strip the armor from a whole (reassembled) message and decode it
    pub fn decode<T: DeserializeOwned>(&self, wire: &[u8]) -> std::result::Result<T, EngineFailure> {
        let text = std::str::from_utf8(wire)
            .map_err(|_| EngineFailure::malformed("wire message is not UTF-8"))?;
        let body = text
            .strip_prefix(&self.whole_prefix())
            .and_then(|rest| rest.strip_suffix('.'))
            .ok_or_else(|| EngineFailure::malformed(format!("missing ?{}: armor", self.tag)))?;

        let decoded = general_purpose::STANDARD
            .decode(body)
            .map_err(|e| EngineFailure::malformed(format!("bad base64: {e}")))?;
        bincode::deserialize(&decoded)
            .map_err(|e| EngineFailure::malformed(format!("undecodable message: {e}")))
    }

    /// Split an armored message into fragments of at most `max_size` bytes.
    /// `max_size == 0` disables fragmentation.
    pub fn fragment(&self, armored: Vec<u8>, max_size: usize) -> Vec<Vec<u8>> {
        if max_size == 0 || armored.len() <= max_size {
            return vec![armored];
        }

        let piece_len = max_size
            .saturating_sub(self.tag.len() + FRAGMENT_FRAMING)
            .max(1);
        let pieces: Vec<&[u8]> = armored.chunks(piece_len).collect();
        let total = pieces.len();

        pieces
            .into_iter()
            .enumerate()
            .map(|(index, piece)| {
                let mut fragment =
                    format!("{}{},{total},", self.fragment_prefix(), index + 1).into_bytes();
                fragment.extend_from_slice(piece);
                fragment.push(b',');
                fragment
            })
            .collect()
    }
}

/// Result of offering one wire message to a [`Reassembler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// Not a fragment; pass it through unchanged
    NotFragment,
    /// A fragment was stored; more are needed
    Buffered,
    /// The last fragment arrived; here is the whole message
    Complete(Vec<u8>),
}

/// Collects the fragments of one message at a time
#[derive(Debug, Default)]
pub struct Reassembler {
    next: usize,
    total: usize,
    buffer: Vec<u8>,
}

impl Reassembler {
    /// Offer one wire message
    pub fn push(
        &mut self,
        armor: &Armor,
        wire: &[u8],
    ) -> std::result::Result<Reassembly, EngineFailure> {
        let Some(rest) = wire.strip_prefix(armor.fragment_prefix().as_bytes()) else {
            return Ok(Reassembly::NotFragment);
        };

        let (k, n, piece) = match parse_fragment(rest) {
            Some(parts) => parts,
            None => {
                self.reset();
                return Err(EngineFailure::malformed("unparseable fragment"));
            }
        };

        if k == 1 {
            self.reset();
            self.total = n;
        } else if k != self.next || n != self.total {
            self.reset();
            return Err(EngineFailure::malformed(format!(
                "fragment {k}/{n} out of sequence"
            )));
        }

        if self.buffer.len() + piece.len() > MAX_MESSAGE_SIZE {
            self.reset();
            return Err(EngineFailure::malformed("reassembled message too large"));
        }
        self.buffer.extend_from_slice(piece);

        if k == n {
            let whole = std::mem::take(&mut self.buffer);
            self.reset();
            return Ok(Reassembly::Complete(whole));
        }

        self.next = k + 1;
        Ok(Reassembly::Buffered)
    }

    fn reset(&mut self) {
        self.next = 0;
        self.total = 0;
        self.buffer.clear();
    }
}

/// Parse `k,n,piece,` into its parts
fn parse_fragment(rest: &[u8]) -> Option<(usize, usize, &[u8])> {
    let rest = rest.strip_suffix(b",")?;
    let mut parts = rest.splitn(3, |&b| b == b',');
    let k: usize = std::str::from_utf8(parts.next()?).ok()?.parse().ok()?;
    let n: usize = std::str::from_utf8(parts.next()?).ok()?.parse().ok()?;
    let piece = parts.next()?;

    if k == 0 || n == 0 || k > n || piece.is_empty() {
        return None;
    }
    Some((k, n, piece))
}
