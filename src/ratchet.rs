//! Ratchet half-states and the pending slots that bridge a new ephemeral
//! advertisement to its adoption by the peer.
//!
//! Modeled as a tagged variant over `SenderHalf` and `ReceiverHalf`. The
//! "counter absent means reinitialize" convention becomes an explicit
//! `Counter(Option<i64>)` with the initialization branch folded into
//! `Counter::step`.
//!
//! The pre-handshake "initial" candidate needs no stored state at all:
//! every code path that rewinds its counter after a failed dechaff
//! attempt is immediately undone by the next attempt's step, so it always
//! derives at counter 0 regardless of how many times it has been tried
//! (see [`initial_case_keys`], used directly instead of a persistent
//! half-state).

use crate::errors::CryptoError;
use crate::kdf::{derive_keys_from_master, expand_dh_component, DerivedKeys};
use crate::keys::{EphemeralKeyPair, PrivateKey, PublicKey};
use rand_core::{CryptoRng, RngCore};
use std::collections::VecDeque;
use zeroize::Zeroize;

/// `Option<i64>` with precise step/rewind semantics: `None` means "never
/// derived"; the first `step()` yields 0, every subsequent one increments;
/// `rewind()` undoes the most recent step.
#[derive(Clone, Copy, Default)]
pub(crate) struct Counter(Option<i64>);

impl Counter {
    pub(crate) fn step(&mut self) -> u64 {
        let next = match self.0 {
            None => 0,
            Some(c) => c + 1,
        };
        self.0 = Some(next);
        debug_assert!(next >= 0, "counter stepped to a negative value");
        next as u64
    }

    pub(crate) fn rewind(&mut self) {
        if let Some(c) = self.0 {
            self.0 = Some(c - 1);
        }
    }

    pub(crate) fn reset(&mut self) {
        self.0 = None;
    }
}

/// Computes the triple-DH master secret for a sending half:
/// `dh(self_long, peer_eph) || dh(self_eph, peer_long) || dh(self_eph, peer_eph)`.
fn sending_master(
    self_long: &PrivateKey,
    self_eph: &EphemeralKeyPair,
    peer_long: &PublicKey,
    peer_eph: &PublicKey,
) -> Result<Vec<u8>, CryptoError> {
    let mut master = Vec::with_capacity(96 * 3);
    master.extend_from_slice(&expand_dh_component(&self_long.diffie_hellman(peer_eph))?);
    master.extend_from_slice(&expand_dh_component(&self_eph.diffie_hellman(peer_long))?);
    master.extend_from_slice(&expand_dh_component(&self_eph.diffie_hellman(peer_eph))?);
    Ok(master)
}

/// Computes the triple-DH master secret for a receiving half:
/// `dh(self_eph, peer_long) || dh(self_long, peer_eph) || dh(self_eph, peer_eph)`.
fn receiving_master(
    self_long: &PrivateKey,
    self_eph: &EphemeralKeyPair,
    peer_long: &PublicKey,
    peer_eph: &PublicKey,
) -> Result<Vec<u8>, CryptoError> {
    let mut master = Vec::with_capacity(96 * 3);
    master.extend_from_slice(&expand_dh_component(&self_eph.diffie_hellman(peer_long))?);
    master.extend_from_slice(&expand_dh_component(&self_long.diffie_hellman(peer_eph))?);
    master.extend_from_slice(&expand_dh_component(&self_eph.diffie_hellman(peer_eph))?);
    Ok(master)
}

/// Computes the initial master secret: `dh(self_long, peer_long)`.
fn initial_master(self_long: &PrivateKey, peer_long: &PublicKey) -> Result<Vec<u8>, CryptoError> {
    Ok(expand_dh_component(&self_long.diffie_hellman(peer_long))?.to_vec())
}

/// The stateless "initial half" candidate: always derives at counter 0,
/// using only the two long-term keys.
pub(crate) fn initial_case_keys(
    self_long: &PrivateKey,
    peer_long: &PublicKey,
    counter_mac_key: &[u8; 32],
) -> Result<DerivedKeys, CryptoError> {
    let master = initial_master(self_long, peer_long)?;
    derive_keys_from_master(&master, 0, counter_mac_key)
}

/// A directional send state. While `peer_ephemeral` is `None`, key
/// derivation falls back to the case-1 (long-term-only) master, exactly as
/// if this half were the stateless initial candidate — the ephemeral pair
/// is minted eagerly at construction time regardless, ready for the
/// moment a peer ephemeral becomes known.
#[derive(Clone)]
pub(crate) struct SenderHalf {
    pub self_ephemeral: EphemeralKeyPair,
    pub peer_ephemeral: Option<PublicKey>,
    counter: Counter,
}

impl SenderHalf {
    pub(crate) fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            self_ephemeral: EphemeralKeyPair::generate(rng),
            peer_ephemeral: None,
            counter: Counter::default(),
        }
    }

    /// Rebuilds a `SenderHalf` around a promoted [`PendingSend`]'s
    /// ephemeral and the peer's newly-adopted ephemeral, with a fresh
    /// counter.
    pub(crate) fn from_promotion(self_ephemeral: EphemeralKeyPair, peer_ephemeral: PublicKey) -> Self {
        Self {
            self_ephemeral,
            peer_ephemeral: Some(peer_ephemeral),
            counter: Counter::default(),
        }
    }

    /// Installs a newly-observed peer ephemeral directly (used when `send`
    /// becomes established other than via `PendingSend` promotion, e.g.
    /// the initiator's first `decrypt_msg` ack). Resets the counter.
    pub(crate) fn adopt_peer(&mut self, peer_ephemeral: PublicKey) {
        self.peer_ephemeral = Some(peer_ephemeral);
        self.counter.reset();
    }

    pub(crate) fn derive(
        &mut self,
        self_long: &PrivateKey,
        peer_long: &PublicKey,
    ) -> Result<DerivedKeys, CryptoError> {
        let master = match &self.peer_ephemeral {
            None => initial_master(self_long, peer_long)?,
            Some(peer_eph) => sending_master(self_long, &self.self_ephemeral, peer_long, peer_eph)?,
        };
        let counter = self.counter.step();
        derive_keys_from_master(&master, counter, crate::constants::COUNTER_MAC_KEY)
    }
}

/// A directional receive state. Like [`SenderHalf`], falls back to the
/// case-1 master while `peer_ephemeral` is `None`. Unlike `SenderHalf`,
/// `self_ephemeral` is optional: a real (case-3) derivation mints it
/// lazily the first time it is needed.
#[derive(Clone)]
pub(crate) struct ReceiverHalf {
    pub self_ephemeral: Option<EphemeralKeyPair>,
    pub peer_ephemeral: Option<PublicKey>,
    counter: Counter,
}

impl ReceiverHalf {
    pub(crate) fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            self_ephemeral: Some(EphemeralKeyPair::generate(rng)),
            peer_ephemeral: None,
            counter: Counter::default(),
        }
    }

    /// Builds a fresh receiver half for a newly-observed peer ephemeral
    /// (used both for [`PendingReceive`] and for directly installing an
    /// ack's ephemeral via `receive_key`).
    pub(crate) fn for_peer<R: RngCore + CryptoRng>(peer_ephemeral: PublicKey, rng: &mut R) -> Self {
        Self {
            self_ephemeral: Some(EphemeralKeyPair::generate(rng)),
            peer_ephemeral: Some(peer_ephemeral),
            counter: Counter::default(),
        }
    }

    pub(crate) fn adopt_peer(&mut self, peer_ephemeral: PublicKey) {
        self.peer_ephemeral = Some(peer_ephemeral);
        self.counter.reset();
    }

    pub(crate) fn derive<R: RngCore + CryptoRng>(
        &mut self,
        self_long: &PrivateKey,
        peer_long: &PublicKey,
        rng: &mut R,
    ) -> Result<DerivedKeys, CryptoError> {
        let master = match &self.peer_ephemeral {
            None => initial_master(self_long, peer_long)?,
            Some(peer_eph) => {
                if self.self_ephemeral.is_none() {
                    self.self_ephemeral = Some(EphemeralKeyPair::generate(rng));
                }
                let self_eph = self.self_ephemeral.as_ref().expect("minted above");
                receiving_master(self_long, self_eph, peer_long, peer_eph)?
            }
        };
        let counter = self.counter.step();
        derive_keys_from_master(&master, counter, crate::constants::COUNTER_MAC_KEY)
    }

    /// Rewinds the counter by one step. Called both when a dechaff attempt
    /// finds nothing (undoing the speculative `step()`) and once more after
    /// a successful dechaff, so that the subsequent direct `derive` call in
    /// `decrypt_message`/`decrypt_keyx` reproduces the exact counter the
    /// sender used.
    pub(crate) fn rewind(&mut self) {
        self.counter.rewind();
    }
}

/// A freshly-minted local ephemeral advertised to the peer but not yet
/// adopted, plus the plaintexts sent while it was pending.
pub(crate) struct PendingSend {
    pub self_ephemeral: EphemeralKeyPair,
    pub msgs: VecDeque<Vec<u8>>,
}

impl PendingSend {
    pub(crate) fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            self_ephemeral: EphemeralKeyPair::generate(rng),
            msgs: VecDeque::new(),
        }
    }
}

/// A peer-advertised new ephemeral not yet promoted to `receive`,
/// awaiting our ack and the peer's first use of it.
pub(crate) struct PendingReceive {
    pub half: ReceiverHalf,
    pub acked: bool,
}

impl PendingReceive {
    pub(crate) fn new<R: RngCore + CryptoRng>(peer_ephemeral: PublicKey, rng: &mut R) -> Self {
        Self {
            half: ReceiverHalf::for_peer(peer_ephemeral, rng),
            acked: false,
        }
    }
}

impl Drop for PendingSend {
    fn drop(&mut self) {
        for msg in self.msgs.iter_mut() {
            msg.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn sender_half_falls_back_to_initial_master_before_peer_known() {
        let self_long = PrivateKey::new();
        let peer_long = PrivateKey::new().public();
        let mut sender = SenderHalf::new(&mut OsRng);
        let keys = sender.derive(&self_long, &peer_long).unwrap();
        let initial = initial_case_keys(&self_long, &peer_long, crate::constants::COUNTER_MAC_KEY).unwrap();
        assert_eq!(keys.message_counter, initial.message_counter);
    }

    #[test]
    fn counter_step_and_rewind_round_trip() {
        let mut c = Counter::default();
        assert_eq!(c.step(), 0);
        assert_eq!(c.step(), 1);
        c.rewind();
        assert_eq!(c.step(), 1);
    }

    #[test]
    fn initial_case_is_order_independent_of_retries() {
        let self_long = PrivateKey::new();
        let peer_long = PrivateKey::new().public();
        let k1 = initial_case_keys(&self_long, &peer_long, crate::constants::COUNTER_MAC_KEY).unwrap();
        let k2 = initial_case_keys(&self_long, &peer_long, crate::constants::COUNTER_MAC_KEY).unwrap();
        assert_eq!(k1.message_counter, k2.message_counter);
    }
}
