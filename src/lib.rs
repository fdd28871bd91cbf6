//! A continuous-ratchet, chaffed-and-winnowed end-to-end encryption core
//! for fixed-size messaging frames.
//!
//! The public surface is [`session::Session`]: construct one per
//! conversation with both parties' long-term keys, then drive it with
//! `encrypt_msg`/`encrypt_keyx`/`encrypt_initial_keyx` and `decrypt_msg`.
//! Everything else in this crate — the ratchet half-states, the key
//! schedule, and the chaffing/winnowing framing layer — is internal
//! plumbing `Session` composes; none of it is meant to be driven directly.

mod chaff;
mod constants;
mod errors;
mod kdf;
pub mod keys;
mod ratchet;
pub mod session;

pub use errors::{ChatsError, CryptoError, ProtocolViolation};
pub use keys::{PrivateKey, PublicKey};
pub use session::{DecryptOutcome, KeyxAction, Session, SessionConfig};

pub use constants::{DEFAULT_CHAFF_BLOCK_SIZE, DEFAULT_MAX_LENGTH, PROTO_ID};
