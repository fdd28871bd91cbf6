//! The key schedule: combining Diffie-Hellman shares with a per-derivation
//! counter into the six derived keys/nonces a ratchet half needs. HKDF
//! with SHA-256, domain-separated by a fixed `info` string, splits the
//! expanded output into named fields.

use crate::constants::{
    DERIVED_KEY_BLOCK_LENGTH, DH_COMPONENT_EXPANDED_LENGTH, POLY1305_KEY_LENGTH, PROTO_ID,
};
use crate::errors::CryptoError;
use crate::keys::{poly1305_compress, ChaffKey, SecretboxKey, SharedSecret};
use arrayref::array_ref;
use hkdf::Hkdf;
use sha2::Sha256;

/// The six fields produced by one call to [`derive_keys_from_master`],
/// named per the 176-byte HKDF-Expand output's field split.
pub struct DerivedKeys {
    pub message_key: SecretboxKey,
    pub exchange_key: SecretboxKey,
    pub chaff_key: ChaffKey,
    pub exchange_chaff_key: ChaffKey,
    pub message_counter: [u8; 24],
    pub exchange_counter: [u8; 24],
}

/// Passes one DH output through HKDF-Expand to 96 bytes, the per-component
/// expansion step that precedes concatenation in the triple-DH master
/// secret.
pub(crate) fn expand_dh_component(
    dh: &SharedSecret,
) -> Result<[u8; DH_COMPONENT_EXPANDED_LENGTH], CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, dh.as_ref());
    let mut out = [0u8; DH_COMPONENT_EXPANDED_LENGTH];
    hk.expand(PROTO_ID.as_bytes(), &mut out)?;
    Ok(out)
}

/// Renders `counter` as its ASCII decimal digits — an unusual choice for
/// a clean-sheet design, but it feeds directly into the Poly1305
/// compression step below and must match what the peer computes.
pub(crate) fn ascii_decimal(counter: u64) -> Vec<u8> {
    counter.to_string().into_bytes()
}

/// Compresses the (already concatenated) master secret together with the
/// current counter, then expands the result to the full key-schedule
/// block and splits it into the six named fields.
pub(crate) fn derive_keys_from_master(
    master: &[u8],
    counter: u64,
    counter_mac_key: &[u8; POLY1305_KEY_LENGTH],
) -> Result<DerivedKeys, CryptoError> {
    let mut compressed_input = master.to_vec();
    compressed_input.extend_from_slice(&ascii_decimal(counter));
    let compressed = poly1305_compress(&compressed_input, counter_mac_key);

    let hk = Hkdf::<Sha256>::new(None, &compressed);
    let mut block = [0u8; DERIVED_KEY_BLOCK_LENGTH];
    hk.expand(PROTO_ID.as_bytes(), &mut block)?;

    let message_key = SecretboxKey::from(*array_ref!(block, 0, 32));
    let exchange_key = SecretboxKey::from(*array_ref!(block, 32, 32));
    let chaff_key = ChaffKey::from(*array_ref!(block, 64, 32));
    let exchange_chaff_key = ChaffKey::from(*array_ref!(block, 96, 32));
    let message_counter = *array_ref!(block, 128, 24);
    let exchange_counter = *array_ref!(block, 152, 24);

    Ok(DerivedKeys {
        message_key,
        exchange_key,
        chaff_key,
        exchange_chaff_key,
        message_counter,
        exchange_counter,
    })
}
