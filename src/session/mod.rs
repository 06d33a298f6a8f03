//! Session engines and the registry of live sessions.
//!
//! [`engine`] defines the capability every protocol implements; [`otr`] and
//! [`ratchet`] are the two variants, sharing the wire armor in [`fragment`].
//! [`registry`] maps peers to their live session.

pub mod engine;
pub mod fragment;
pub mod otr;
pub mod ratchet;
pub mod registry;

pub use engine::*;
pub use fragment::MIN_FRAGMENT_SIZE;
pub use registry::{Session, SessionInner, SessionRegistry, SessionSummary};
