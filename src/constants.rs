// byte size of a Curve25519 private key
pub(crate) const CURVE25519_SECRET_LENGTH: usize = 32;
// byte size of a Curve25519 public key
pub(crate) const CURVE25519_PUBLIC_LENGTH: usize = CURVE25519_SECRET_LENGTH;

// byte size of the secretbox (XSalsa20-Poly1305) symmetric key
pub(crate) const SECRETBOX_KEY_LENGTH: usize = 32;
// byte size of the secretbox nonce
pub(crate) const SECRETBOX_NONCE_LENGTH: usize = 24;
// byte size of a Poly1305 one-time-authenticator key
pub(crate) const POLY1305_KEY_LENGTH: usize = 32;
// byte size of a full (untruncated) Poly1305 tag
pub(crate) const POLY1305_TAG_LENGTH: usize = 16;

/// HKDF `info` string used throughout key derivation; also the crate's wire
/// protocol identifier.
pub const PROTO_ID: &str = "cryptchats-protocol-v1";

/// Poly1305 key used to compress the triple-DH master secret together with
/// the ratchet counter. This is exactly 32 bytes, the size Poly1305
/// requires, so it is used as the key directly rather than via HKDF.
pub(crate) const COUNTER_MAC_KEY: &[u8; 32] = b"cryptchats-protocol-v1::poly1305";

/// Default wire frame size in bytes.
pub const DEFAULT_MAX_LENGTH: usize = 480;
/// Default chaff block size in bytes.
pub const DEFAULT_CHAFF_BLOCK_SIZE: usize = 16;

/// Length, in bytes, of a single DH output once passed through
/// HKDF-Expand before concatenation in the triple-DH master secret.
pub(crate) const DH_COMPONENT_EXPANDED_LENGTH: usize = 96;

/// Length, in bytes, of the HKDF-Expand output split into the six derived
/// key-schedule fields:
/// `message_key(32) || exchange_key(32) || chaff_key(32) ||
/// exchange_chaff_key(32) || message_counter(24) || exchange_counter(24)`.
pub(crate) const DERIVED_KEY_BLOCK_LENGTH: usize = 32 * 4 + 24 * 2;
