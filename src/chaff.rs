//! The chaffing-and-winnowing framing layer: splitting ciphertext into
//! MAC-tagged blocks, padding a frame out to a fixed number of block-pairs
//! with random decoys, and scanning a received frame for the pairs that
//! verify under a candidate chaff key.

use crate::errors::ChatsError;
use crate::keys::ChaffKey;
use rand_core::{CryptoRng, RngCore};

/// One `(data_block, mac_block)` pair, each exactly `block_size` bytes.
pub(crate) type BlockPair = (Vec<u8>, Vec<u8>);

/// Splits ciphertext into `block_size`-byte chunks and tags each with
/// `key`, producing the real block-pairs that will later be chaffed.
///
/// `ct` must be a multiple of `block_size`; callers arrange this by
/// zero-padding plaintext to a 16-byte multiple before encryption and by
/// choosing `chaff_block_size` so it evenly divides every ciphertext
/// length the session produces.
pub(crate) fn mac_pairs(ct: &[u8], block_size: usize, key: &ChaffKey) -> Vec<BlockPair> {
    ct.chunks(block_size)
        .map(|block| {
            let mac = key.tag(block, block_size);
            (block.to_vec(), mac)
        })
        .collect()
}

/// Pads `pairs` out to `total_pairs` with random decoy pairs inserted at
/// uniformly random positions, then concatenates `data || mac` for every
/// pair in the resulting order.
///
/// `total_pairs` is `max_length / chaff_block_size / 2`; `pairs.len()`
/// must not exceed it — the caller is responsible for choosing a payload
/// size (and padding) that fits within one frame.
pub(crate) fn chaff<C: RngCore + CryptoRng, I: RngCore>(
    mut pairs: Vec<BlockPair>,
    total_pairs: usize,
    block_size: usize,
    csprng: &mut C,
    index_rng: &mut I,
) -> Vec<u8> {
    let needed = total_pairs.saturating_sub(pairs.len());
    for _ in 0..needed {
        let mut data = vec![0u8; block_size];
        let mut mac = vec![0u8; block_size];
        csprng.fill_bytes(&mut data);
        csprng.fill_bytes(&mut mac);
        let position = (index_rng.next_u32() as usize) % (pairs.len() + 1);
        pairs.insert(position, (data, mac));
    }

    let mut out = Vec::with_capacity(pairs.len() * block_size * 2);
    for (data, mac) in &pairs {
        out.extend_from_slice(data);
        out.extend_from_slice(mac);
    }
    out
}

/// Splits a wire frame into its constituent block-pairs (the inverse of
/// the concatenation step in [`chaff`]).
pub(crate) fn split_into_pairs(frame: &[u8], block_size: usize) -> Result<Vec<BlockPair>, ChatsError> {
    let pair_size = block_size * 2;
    if pair_size == 0 || frame.len() % pair_size != 0 {
        return Err(ChatsError::InvalidLength {
            expected: pair_size,
            actual: frame.len(),
        });
    }
    Ok(frame
        .chunks(pair_size)
        .map(|chunk| (chunk[..block_size].to_vec(), chunk[block_size..].to_vec()))
        .collect())
}

/// The result of scanning a frame's block-pairs against one candidate
/// half's chaff keys.
pub(crate) struct DechaffResult {
    pub message_bytes: Vec<u8>,
    pub exchange_bytes: Vec<u8>,
}

impl DechaffResult {
    pub(crate) fn is_empty(&self) -> bool {
        self.message_bytes.is_empty() && self.exchange_bytes.is_empty()
    }
}

/// Scans every block-pair in `pairs`, testing the data block against
/// `chaff_key` and `exchange_chaff_key` in turn. A pair that verifies
/// under `chaff_key` contributes its data block to the message-channel
/// buffer; one that verifies under `exchange_chaff_key` contributes to
/// the exchange-channel buffer. A pair can only match one of the two
/// (their keys are independent 32-byte outputs of the same derivation),
/// so there is no ambiguity in which buffer a real block belongs to.
pub(crate) fn scan(
    pairs: &[BlockPair],
    chaff_key: &ChaffKey,
    exchange_chaff_key: &ChaffKey,
) -> DechaffResult {
    let mut message_bytes = Vec::new();
    let mut exchange_bytes = Vec::new();

    for (data, mac) in pairs {
        if chaff_key.verify(data, mac) {
            message_bytes.extend_from_slice(data);
        } else if exchange_chaff_key.verify(data, mac) {
            exchange_bytes.extend_from_slice(data);
        }
    }

    DechaffResult {
        message_bytes,
        exchange_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::POLY1305_KEY_LENGTH;
    use rand::rngs::OsRng;

    #[test]
    fn chaffed_frame_has_exact_length() {
        let key = ChaffKey::from([9u8; POLY1305_KEY_LENGTH]);
        let ct = vec![1u8; 32];
        let pairs = mac_pairs(&ct, 8, &key);
        let mut rng = OsRng;
        let frame = chaff(pairs, 25, 8, &mut rng, &mut rng);
        assert_eq!(frame.len(), 25 * 8 * 2);
    }

    #[test]
    fn scan_recovers_real_blocks_and_ignores_decoys() {
        let key = ChaffKey::from([9u8; POLY1305_KEY_LENGTH]);
        let other_key = ChaffKey::from([5u8; POLY1305_KEY_LENGTH]);
        let ct = b"attack at dawn!!".to_vec();
        let pairs = mac_pairs(&ct, 8, &key);
        let mut rng = OsRng;
        let frame = chaff(pairs, 25, 8, &mut rng, &mut rng);

        let split = split_into_pairs(&frame, 8).unwrap();
        let result = scan(&split, &key, &other_key);
        assert_eq!(result.message_bytes, ct);
        assert!(result.exchange_bytes.is_empty());
    }

    #[test]
    fn wrong_key_finds_nothing() {
        let key = ChaffKey::from([9u8; POLY1305_KEY_LENGTH]);
        let wrong = ChaffKey::from([1u8; POLY1305_KEY_LENGTH]);
        let other = ChaffKey::from([2u8; POLY1305_KEY_LENGTH]);
        let ct = b"attack at dawn!!".to_vec();
        let pairs = mac_pairs(&ct, 8, &key);
        let mut rng = OsRng;
        let frame = chaff(pairs, 25, 8, &mut rng, &mut rng);

        let split = split_into_pairs(&frame, 8).unwrap();
        let result = scan(&split, &wrong, &other);
        assert!(result.is_empty());
    }

    #[test]
    fn tampering_with_a_data_block_drops_that_pair() {
        let key = ChaffKey::from([9u8; POLY1305_KEY_LENGTH]);
        let other = ChaffKey::from([2u8; POLY1305_KEY_LENGTH]);
        let ct = b"attack at dawn!!".to_vec();
        let pairs = mac_pairs(&ct, 8, &key);
        let mut rng = OsRng;
        let mut frame = chaff(pairs, 25, 8, &mut rng, &mut rng);
        frame[0] ^= 0xff;

        let split = split_into_pairs(&frame, 8).unwrap();
        let result = scan(&split, &key, &other);
        assert_ne!(result.message_bytes, ct);
    }
}
