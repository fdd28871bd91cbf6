//! Error types for the key schedule, chaffing layer, and session façade.
//!
//! [`CryptoError`] covers primitive-layer failures (HKDF, secretbox),
//! while [`ChatsError`] covers protocol-layer failures surfaced to the
//! caller of [`crate::session::Session`].

use std::fmt::{Display, Formatter};

/// Errors from the crypto primitives layer.
#[derive(Debug)]
pub enum CryptoError {
    /// HKDF-Expand was asked for more output than its hash function allows.
    HkdfInvalidLength(hkdf::InvalidLength),

    /// Secretbox (XSalsa20-Poly1305) authenticated decryption failed. This
    /// is expected whenever a dechaffed candidate was a false positive or a
    /// frame was tampered with; it is not itself evidence of an attack.
    SecretboxOpenFailed,
}

impl Display for CryptoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::HkdfInvalidLength(e) => write!(f, "invalid HKDF output length: {}", e),
            CryptoError::SecretboxOpenFailed => write!(f, "secretbox authentication failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<hkdf::InvalidLength> for CryptoError {
    fn from(value: hkdf::InvalidLength) -> Self {
        CryptoError::HkdfInvalidLength(value)
    }
}

/// The specific protocol violation observed in [`ChatsError::ProtocolViolation`].
///
/// Both variants are non-fatal to the session: the offending frame is
/// dropped and subsequent frames are still accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// The peer's message advertised the same ephemeral it last advertised
    /// on this half, instead of a fresh one.
    RepeatedEphemeral,

    /// `decrypt_msg` dispatch reached a combination of initial-half role
    /// and ack flavor that the state machine does not define (e.g. a
    /// responder receiving an ack, or an initiator receiving a second
    /// fresh opening outside the simultaneous-initiation race).
    UnreachableState,
}

impl Display for ProtocolViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolViolation::RepeatedEphemeral => {
                write!(f, "peer re-advertised its previous ephemeral key")
            }
            ProtocolViolation::UnreachableState => {
                write!(f, "key exchange frame arrived in an unreachable state")
            }
        }
    }
}

/// Errors surfaced by [`crate::session::Session`].
#[derive(Debug)]
pub enum ChatsError {
    /// Dechaffing produced no real blocks for any candidate half. Fatal to
    /// this frame only; callers should treat it as possible cover traffic
    /// and drop it silently.
    NotEncrypted,

    /// A specific, defined protocol violation (see [`ProtocolViolation`]).
    /// Fatal to this frame only; the session continues to accept
    /// subsequent frames.
    ProtocolViolation(ProtocolViolation),

    /// The secretbox open succeeded past dechaffing's MAC filter but then
    /// failed AEAD authentication. Surfaced as "no plaintext" to the
    /// caller.
    AeadFailure,

    /// The frame was not a multiple of `2 * chaff_block_size`, or did not
    /// equal `max_length`.
    InvalidLength { expected: usize, actual: usize },

    /// A `SessionConfig` failed its validation invariant: either
    /// `chaff_block_size` does not divide `max_length`, or the resulting
    /// number of base units is odd (block pairing requires an even count).
    InvalidConfig,

    /// A lower-level crypto primitive failure not otherwise classified.
    Crypto(CryptoError),
}

impl Display for ChatsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatsError::NotEncrypted => write!(f, "not encrypted"),
            ChatsError::ProtocolViolation(v) => write!(f, "protocol violation: {}", v),
            ChatsError::AeadFailure => write!(f, "AEAD authentication failed"),
            ChatsError::InvalidLength { expected, actual } => write!(
                f,
                "invalid frame length: expected {} bytes, got {}",
                expected, actual
            ),
            ChatsError::InvalidConfig => write!(
                f,
                "chaff_block_size must divide max_length into an even number of base units"
            ),
            ChatsError::Crypto(e) => write!(f, "crypto error: {}", e),
        }
    }
}

impl std::error::Error for ChatsError {}

impl From<CryptoError> for ChatsError {
    fn from(value: CryptoError) -> Self {
        ChatsError::Crypto(value)
    }
}

impl From<hkdf::InvalidLength> for ChatsError {
    fn from(value: hkdf::InvalidLength) -> Self {
        ChatsError::Crypto(CryptoError::from(value))
    }
}
