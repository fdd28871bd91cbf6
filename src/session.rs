//! The session façade: the public surface that wraps the ratchet halves,
//! the key schedule, and the chaffing layer into
//! `encrypt_msg`/`encrypt_keyx`/`encrypt_initial_keyx`/`decrypt_msg`.

use crate::chaff::{self, DechaffResult};
use crate::constants::{
    COUNTER_MAC_KEY, DEFAULT_CHAFF_BLOCK_SIZE, DEFAULT_MAX_LENGTH, POLY1305_TAG_LENGTH,
    SECRETBOX_NONCE_LENGTH,
};
use crate::errors::{ChatsError, ProtocolViolation};
use crate::keys::{EphemeralKeyPair, PrivateKey, PublicKey};
use crate::ratchet::{self, PendingReceive, PendingSend, ReceiverHalf, SenderHalf};
use log::{debug, warn};
use rand_core::{CryptoRng, RngCore};

/// Frame sizing parameters. `chaff_block_size` must evenly divide
/// `max_length` into a positive, even number of base units, since every
/// frame is an exact number of `(data, mac)` block pairs.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub max_length: usize,
    pub chaff_block_size: usize,
}

impl SessionConfig {
    pub fn new(max_length: usize, chaff_block_size: usize) -> Result<Self, ChatsError> {
        if chaff_block_size == 0 || max_length % (chaff_block_size * 2) != 0 {
            return Err(ChatsError::InvalidConfig);
        }
        Ok(Self { max_length, chaff_block_size })
    }

    pub(crate) fn total_pairs(&self) -> usize {
        self.max_length / (self.chaff_block_size * 2)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            chaff_block_size: DEFAULT_CHAFF_BLOCK_SIZE,
        }
    }
}

/// What a successful [`Session::decrypt_msg`] call asks the caller to do
/// with the key-exchange channel.
#[derive(Debug, PartialEq, Eq)]
pub enum KeyxAction {
    /// No key-exchange activity occurred on this frame.
    None,
    /// The handshake completed on our end; nothing needs to be sent back.
    Established,
    /// Forward this frame to the peer to continue or complete the handshake.
    Send(Vec<u8>),
}

/// The result of [`Session::decrypt_msg`].
#[derive(Debug)]
pub struct DecryptOutcome {
    /// Plaintext recovered from the message channel, if this frame carried one.
    pub plaintext: Option<Vec<u8>>,
    /// Key-exchange follow-up action, if any.
    pub keyx: KeyxAction,
    /// Plaintexts that had been buffered in `pending_send` and were
    /// released now that the peer has acknowledged our ephemeral.
    pub msgs: Vec<Vec<u8>>,
}

/// Pads `data` with zero bytes so that `data.len() + overhead` is a
/// multiple of `block_size`, for whatever `chaff_block_size` a session is
/// configured with, and whatever fixed overhead — a secretbox tag, plus a
/// nonce for the initial exchange — precedes chaffing.
fn pad_for_alignment(data: &mut Vec<u8>, block_size: usize, overhead: usize) {
    let total = data.len() + overhead;
    let rem = total % block_size;
    if rem != 0 {
        data.resize(data.len() + (block_size - rem), 0);
    }
}

/// Zero-pads `data` up to the next 16-byte multiple — the fixed padding
/// granularity the wire format defines for message plaintext and the ack
/// payload (spec §4.4 step 6, §6), independent of `chaff_block_size`.
fn pad_to_16(data: &mut Vec<u8>) {
    let rem = data.len() % 16;
    if rem != 0 {
        data.resize(data.len() + (16 - rem), 0);
    }
}

#[derive(Clone, Copy)]
enum Winner {
    PendingReceive,
    Receive,
    Initial,
}

/// Two-party ratchet session. Owns one side's long-term key, the
/// peer's long-term public key, the send/receive ratchet halves, and the
/// pending slots that bridge ephemeral rotation.
pub struct Session {
    self_long: PrivateKey,
    peer_long: PublicKey,
    send: SenderHalf,
    receive: ReceiverHalf,
    pending_send: Option<PendingSend>,
    pending_receive: Option<PendingReceive>,
    is_initiator: bool,
    initialized: bool,
    config: SessionConfig,
}

impl Session {
    pub fn new<R: RngCore + CryptoRng>(
        self_long: PrivateKey,
        peer_long: PublicKey,
        config: SessionConfig,
        rng: &mut R,
    ) -> Self {
        Self {
            send: SenderHalf::new(rng),
            receive: ReceiverHalf::new(rng),
            self_long,
            peer_long,
            pending_send: None,
            pending_receive: None,
            is_initiator: false,
            initialized: false,
            config,
        }
    }

    /// Whether the receive ratchet has adopted a peer ephemeral.
    pub fn established(&self) -> bool {
        self.receive.peer_ephemeral.is_some()
    }

    pub fn config(&self) -> SessionConfig {
        self.config
    }

    /// Encrypts `plaintext` for the message channel. Buffers it in
    /// `pending_send` regardless of outcome; returns `Ok(None)` rather than
    /// a frame while the ratchet has no peer ephemeral yet to encrypt
    /// toward (the initial handshake must complete first).
    pub fn encrypt_msg<C: RngCore + CryptoRng, I: RngCore>(
        &mut self,
        plaintext: &[u8],
        csprng: &mut C,
        index_rng: &mut I,
    ) -> Result<Option<Vec<u8>>, ChatsError> {
        let keys = self.send.derive(&self.self_long, &self.peer_long)?;

        if self.pending_send.is_none() {
            self.pending_send = Some(PendingSend::new(csprng));
        }
        let pending = self.pending_send.as_mut().expect("just ensured");
        pending.msgs.push_back(plaintext.to_vec());

        if self.send.peer_ephemeral.is_none() {
            return Ok(None);
        }

        let mut payload = pending.self_ephemeral.public().0.to_vec();
        payload.extend_from_slice(plaintext);
        pad_to_16(&mut payload);

        let ct = keys.message_key.encrypt(&payload, &keys.message_counter)?;
        debug_assert_eq!(
            ct.len() % self.config.chaff_block_size,
            0,
            "chaff_block_size must divide 16 for message ciphertexts to pair evenly"
        );
        let pairs = chaff::mac_pairs(&ct, self.config.chaff_block_size, &keys.chaff_key);
        if pairs.len() > self.config.total_pairs() {
            return Err(ChatsError::InvalidLength {
                expected: self.config.total_pairs(),
                actual: pairs.len(),
            });
        }
        Ok(Some(chaff::chaff(
            pairs,
            self.config.total_pairs(),
            self.config.chaff_block_size,
            csprng,
            index_rng,
        )))
    }

    /// Encrypts an ack for the exchange channel, advertising the
    /// `pending_receive` half's ephemeral so the peer can promote its own
    /// `send` toward us. Requires a `pending_receive` to exist; calling
    /// this with none is a caller error.
    pub fn encrypt_keyx<C: RngCore + CryptoRng, I: RngCore>(
        &mut self,
        csprng: &mut C,
        index_rng: &mut I,
    ) -> Result<Vec<u8>, ChatsError> {
        let keys = self.send.derive(&self.self_long, &self.peer_long)?;

        let pending = self
            .pending_receive
            .as_mut()
            .ok_or(ChatsError::ProtocolViolation(ProtocolViolation::UnreachableState))?;
        pending.acked = true;
        if pending.half.self_ephemeral.is_none() {
            pending.half.self_ephemeral = Some(EphemeralKeyPair::generate(csprng));
        }
        let advertised = pending.half.self_ephemeral.as_ref().expect("minted above").public();

        let mut payload = advertised.0.to_vec();
        pad_to_16(&mut payload);

        let ct = keys.exchange_key.encrypt(&payload, &keys.exchange_counter)?;
        debug_assert_eq!(
            ct.len() % self.config.chaff_block_size,
            0,
            "chaff_block_size must divide 16 for ack ciphertexts to pair evenly"
        );
        let pairs = chaff::mac_pairs(&ct, self.config.chaff_block_size, &keys.exchange_chaff_key);
        if pairs.len() > self.config.total_pairs() {
            return Err(ChatsError::InvalidLength {
                expected: self.config.total_pairs(),
                actual: pairs.len(),
            });
        }
        Ok(chaff::chaff(
            pairs,
            self.config.total_pairs(),
            self.config.chaff_block_size,
            csprng,
            index_rng,
        ))
    }

    /// Opens (or re-opens) the key exchange: advertises our
    /// receive/send ephemerals, using the message channel if we are not
    /// yet established (we are "alice") or the exchange channel if we
    /// already are (this is a reply acting as an ack).
    pub fn encrypt_initial_keyx<C: RngCore + CryptoRng, I: RngCore>(
        &mut self,
        csprng: &mut C,
        index_rng: &mut I,
    ) -> Result<Vec<u8>, ChatsError> {
        self.is_initiator = !self.established();
        self.initialized = true;

        let mut nonce = [0u8; SECRETBOX_NONCE_LENGTH];
        csprng.fill_bytes(&mut nonce);

        let keys = ratchet::initial_case_keys(&self.self_long, &self.peer_long, COUNTER_MAC_KEY)?;

        if self.receive.self_ephemeral.is_none() {
            self.receive.self_ephemeral = Some(EphemeralKeyPair::generate(csprng));
        }
        let receive_pub = self.receive.self_ephemeral.as_ref().expect("minted above").public();
        let send_pub = self.send.self_ephemeral.public();

        let (mut payload, msg_key, chaff_key) = if self.is_initiator {
            let mut p = receive_pub.0.to_vec();
            p.extend_from_slice(&send_pub.0);
            (p, &keys.message_key, &keys.chaff_key)
        } else {
            let mut p = send_pub.0.to_vec();
            p.extend_from_slice(&receive_pub.0);
            (p, &keys.exchange_key, &keys.exchange_chaff_key)
        };
        pad_for_alignment(
            &mut payload,
            self.config.chaff_block_size,
            SECRETBOX_NONCE_LENGTH + POLY1305_TAG_LENGTH,
        );

        let ct = msg_key.encrypt(&payload, &nonce)?;
        let mut tagged = nonce.to_vec();
        tagged.extend_from_slice(&ct);

        let pairs = chaff::mac_pairs(&tagged, self.config.chaff_block_size, chaff_key);
        if pairs.len() > self.config.total_pairs() {
            return Err(ChatsError::InvalidLength {
                expected: self.config.total_pairs(),
                actual: pairs.len(),
            });
        }
        Ok(chaff::chaff(
            pairs,
            self.config.total_pairs(),
            self.config.chaff_block_size,
            csprng,
            index_rng,
        ))
    }

    fn decrypt_initial_keyx(&self, tagged: &[u8], ack: bool) -> Option<(PublicKey, PublicKey)> {
        if tagged.len() < SECRETBOX_NONCE_LENGTH {
            return None;
        }
        let mut nonce = [0u8; SECRETBOX_NONCE_LENGTH];
        nonce.copy_from_slice(&tagged[..SECRETBOX_NONCE_LENGTH]);
        let ct = &tagged[SECRETBOX_NONCE_LENGTH..];

        let keys = ratchet::initial_case_keys(&self.self_long, &self.peer_long, COUNTER_MAC_KEY).ok()?;
        let msg_key = if ack { &keys.exchange_key } else { &keys.message_key };
        let pt = msg_key.decrypt(ct, &nonce).ok()?;
        if pt.len() < 64 {
            return None;
        }

        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        a.copy_from_slice(&pt[0..32]);
        b.copy_from_slice(&pt[32..64]);
        Some((PublicKey::from(a), PublicKey::from(b)))
    }

    fn decrypt_keyx<R: RngCore + CryptoRng>(
        &mut self,
        ct: &[u8],
        winner: Winner,
        rng: &mut R,
    ) -> Result<PublicKey, ChatsError> {
        let keys = match winner {
            Winner::PendingReceive => {
                self.pending_receive
                    .as_mut()
                    .expect("winner implies Some")
                    .half
                    .derive(&self.self_long, &self.peer_long, rng)?
            }
            Winner::Receive => self.receive.derive(&self.self_long, &self.peer_long, rng)?,
            Winner::Initial => unreachable!("initial winner never reaches decrypt_keyx"),
        };

        let pt = keys
            .exchange_key
            .decrypt(ct, &keys.exchange_counter)
            .map_err(|_| ChatsError::AeadFailure)?;
        if pt.len() < 32 {
            return Err(ChatsError::AeadFailure);
        }
        let mut peer = [0u8; 32];
        peer.copy_from_slice(&pt[0..32]);
        Ok(PublicKey::from(peer))
    }

    fn decrypt_message<R: RngCore + CryptoRng>(
        &mut self,
        ct: &[u8],
        winner: Winner,
        rng: &mut R,
    ) -> Result<(PublicKey, Vec<u8>), ChatsError> {
        let keys = match winner {
            Winner::PendingReceive => {
                self.pending_receive
                    .as_mut()
                    .expect("winner implies Some")
                    .half
                    .derive(&self.self_long, &self.peer_long, rng)?
            }
            Winner::Receive => self.receive.derive(&self.self_long, &self.peer_long, rng)?,
            Winner::Initial => unreachable!("initial winner never reaches decrypt_message"),
        };

        let pt = keys
            .message_key
            .decrypt(ct, &keys.message_counter)
            .map_err(|_| ChatsError::AeadFailure)?;
        if pt.len() < 32 {
            return Err(ChatsError::AeadFailure);
        }
        let mut peer_eph = [0u8; 32];
        peer_eph.copy_from_slice(&pt[0..32]);
        Ok((PublicKey::from(peer_eph), pt[32..].to_vec()))
    }

    /// Rebuilds `send`/`receive` around fresh ephemerals and drops any
    /// pending slots, invoked when a peer's fresh opening implies the
    /// prior ratchet state is stale.
    fn reset_ratchet<R: RngCore + CryptoRng>(&mut self, rng: &mut R) {
        debug!("resetting ratchet state, dropping pending send/receive slots");
        self.send = SenderHalf::new(rng);
        self.receive = ReceiverHalf::new(rng);
        self.pending_send = None;
        self.pending_receive = None;
    }

    /// Promotes `pending_send` to `send` once the peer demonstrates it has
    /// adopted a *different* ephemeral than `send` currently targets —
    /// i.e. the peer has rotated its receiving ephemeral in response to
    /// ours.
    fn got_key(&mut self, peer_eph: Option<PublicKey>) {
        let peer_eph = match peer_eph {
            Some(p) => p,
            None => return,
        };
        if self.send.peer_ephemeral.is_none() {
            return;
        }
        let should_promote = self.pending_send.is_some() && Some(peer_eph) != self.send.peer_ephemeral;
        if should_promote {
            debug!("peer adopted a new ephemeral, promoting pending send ratchet");
            let pending = self.pending_send.take().expect("checked above");
            self.send = SenderHalf::from_promotion(pending.self_ephemeral, peer_eph);
        }
    }

    /// Decrypts an incoming frame: dechaffs against
    /// `pending_receive`, then `receive`, then the stateless initial
    /// candidate, and dispatches on which one matched and which channel
    /// (message or exchange) the recovered bytes came from.
    pub fn decrypt_msg<C: RngCore + CryptoRng, I: RngCore>(
        &mut self,
        frame: &[u8],
        csprng: &mut C,
        index_rng: &mut I,
    ) -> Result<DecryptOutcome, ChatsError> {
        if frame.len() != self.config.max_length {
            return Err(ChatsError::InvalidLength {
                expected: self.config.max_length,
                actual: frame.len(),
            });
        }
        let pairs = chaff::split_into_pairs(frame, self.config.chaff_block_size)?;

        let mut winner = None;
        let mut result: Option<DechaffResult> = None;

        if let Some(pending) = self.pending_receive.as_mut() {
            let keys = pending.half.derive(&self.self_long, &self.peer_long, csprng)?;
            let r = chaff::scan(&pairs, &keys.chaff_key, &keys.exchange_chaff_key);
            pending.half.rewind();
            if !r.is_empty() {
                winner = Some(Winner::PendingReceive);
                result = Some(r);
            }
        }

        if winner.is_none() {
            let keys = self.receive.derive(&self.self_long, &self.peer_long, csprng)?;
            let r = chaff::scan(&pairs, &keys.chaff_key, &keys.exchange_chaff_key);
            self.receive.rewind();
            if !r.is_empty() {
                winner = Some(Winner::Receive);
                result = Some(r);
            }
        }

        if winner.is_none() {
            let keys = ratchet::initial_case_keys(&self.self_long, &self.peer_long, COUNTER_MAC_KEY)?;
            let r = chaff::scan(&pairs, &keys.chaff_key, &keys.exchange_chaff_key);
            if !r.is_empty() {
                winner = Some(Winner::Initial);
                result = Some(r);
            }
        }

        let (winner, result) = match (winner, result) {
            (Some(w), Some(r)) => (w, r),
            _ => {
                debug!("frame did not dechaff against any candidate half, dropping");
                return Err(ChatsError::NotEncrypted);
            }
        };

        match winner {
            Winner::Initial => self.handle_initial_match(result, csprng, index_rng),
            Winner::PendingReceive | Winner::Receive => {
                if !result.message_bytes.is_empty() {
                    self.handle_message_match(winner, result.message_bytes, csprng, index_rng)
                } else {
                    self.handle_exchange_match(winner, result.exchange_bytes, csprng)
                }
            }
        }
    }

    fn commit_receiver_winner(&mut self, winner: Winner) {
        if let Winner::PendingReceive = winner {
            let pending = self.pending_receive.take().expect("winner implies Some");
            self.receive = pending.half;
        }
    }

    fn handle_message_match<C: RngCore + CryptoRng, I: RngCore>(
        &mut self,
        winner: Winner,
        ct: Vec<u8>,
        csprng: &mut C,
        index_rng: &mut I,
    ) -> Result<DecryptOutcome, ChatsError> {
        let (peer_new_eph, msg) = self.decrypt_message(&ct, winner, csprng)?;
        self.commit_receiver_winner(winner);

        if Some(peer_new_eph) == self.receive.peer_ephemeral {
            warn!("peer re-advertised its previous ephemeral key on the message channel");
            return Err(ChatsError::ProtocolViolation(ProtocolViolation::RepeatedEphemeral));
        }

        let already_pending = match &self.pending_receive {
            Some(p) => p.half.peer_ephemeral == Some(peer_new_eph),
            None => false,
        };
        if !already_pending {
            self.pending_receive = Some(PendingReceive::new(peer_new_eph, csprng));
        }

        // A pending receive we have not yet acked rides back on this same
        // reply so the peer can promote its sending ephemeral as soon as
        // possible, instead of waiting for a caller to ask for one later.
        let needs_ack = matches!(&self.pending_receive, Some(p) if !p.acked);
        let keyx = if needs_ack {
            KeyxAction::Send(self.encrypt_keyx(csprng, index_rng)?)
        } else {
            KeyxAction::None
        };

        Ok(DecryptOutcome {
            plaintext: Some(msg),
            keyx,
            msgs: Vec::new(),
        })
    }

    fn handle_exchange_match<R: RngCore + CryptoRng>(
        &mut self,
        winner: Winner,
        ct: Vec<u8>,
        rng: &mut R,
    ) -> Result<DecryptOutcome, ChatsError> {
        let peer_receiving_eph = self.decrypt_keyx(&ct, winner, rng)?;
        self.commit_receiver_winner(winner);
        self.got_key(Some(peer_receiving_eph));

        Ok(DecryptOutcome {
            plaintext: None,
            keyx: KeyxAction::None,
            msgs: Vec::new(),
        })
    }

    fn handle_initial_match<C: RngCore + CryptoRng, I: RngCore>(
        &mut self,
        result: DechaffResult,
        csprng: &mut C,
        index_rng: &mut I,
    ) -> Result<DecryptOutcome, ChatsError> {
        let (tagged, ack) = if !result.exchange_bytes.is_empty() {
            (result.exchange_bytes, true)
        } else {
            (result.message_bytes, false)
        };
        let (eph1, eph2) = self.decrypt_initial_keyx(&tagged, ack).ok_or(ChatsError::AeadFailure)?;

        let msgs: Vec<Vec<u8>> = match self.pending_send.as_mut() {
            Some(p) => p.msgs.drain(..).collect(),
            None => Vec::new(),
        };

        if self.is_initiator && ack {
            debug!("handshake established as initiator");
            self.receive.adopt_peer(eph1);
            self.send.adopt_peer(eph2);
            return Ok(DecryptOutcome {
                plaintext: None,
                keyx: KeyxAction::Established,
                msgs,
            });
        }

        if !ack {
            // Simultaneous initiation: both sides opened at once, so
            // neither received an ack. Both sides' self-advertised
            // ephemerals are already known to the other from that
            // opening, so neither resets its ratchet here — only a
            // genuine first-contact or restarting peer does that below.
            // The side with the numerically larger long-term public key
            // defers to the other instead of re-emitting a second
            // opening, which would otherwise loop. A responder always
            // pairs send with the peer's receive ephemeral (eph1) and
            // receive with the peer's send ephemeral (eph2).
            let simultaneous = self.initialized && !self.established();
            if simultaneous && self.self_long.public() > self.peer_long {
                debug!("simultaneous initiation resolved, deferring to peer's opening");
                self.send.adopt_peer(eph1);
                self.receive.adopt_peer(eph2);
                self.is_initiator = false;
                return Ok(DecryptOutcome {
                    plaintext: None,
                    keyx: KeyxAction::Established,
                    msgs,
                });
            }

            if !simultaneous {
                self.reset_ratchet(csprng);
            } else {
                debug!("simultaneous initiation resolved, replying as canonical initiator");
            }
            self.send.adopt_peer(eph1);
            self.receive.adopt_peer(eph2);
            let reply = self.encrypt_initial_keyx(csprng, index_rng)?;
            return Ok(DecryptOutcome {
                plaintext: None,
                keyx: KeyxAction::Send(reply),
                msgs,
            });
        }

        warn!("key exchange frame arrived in an unreachable initiator/ack combination");
        Err(ChatsError::ProtocolViolation(ProtocolViolation::UnreachableState))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn pair() -> (Session, Session) {
        pair_with_config(SessionConfig::default())
    }

    fn pair_with_config(config: SessionConfig) -> (Session, Session) {
        let alice_long = PrivateKey::new();
        let bob_long = PrivateKey::new();
        let alice = Session::new(alice_long.clone(), bob_long.public(), config, &mut OsRng);
        let bob = Session::new(bob_long, alice_long.public(), config, &mut OsRng);
        (alice, bob)
    }

    /// The `max_length=400, chaff_block_size=8` configuration used by the
    /// scenario-literal tests below.
    fn scenario_config() -> SessionConfig {
        SessionConfig::new(400, 8).unwrap()
    }

    fn handshake(alice: &mut Session, bob: &mut Session) {
        let opening = alice.encrypt_initial_keyx(&mut OsRng, &mut OsRng).unwrap();
        let outcome = bob.decrypt_msg(&opening, &mut OsRng, &mut OsRng).unwrap();
        let ack = match outcome.keyx {
            KeyxAction::Send(frame) => frame,
            other => panic!("expected bob to reply with an ack, got {:?}", other),
        };
        let outcome = alice.decrypt_msg(&ack, &mut OsRng, &mut OsRng).unwrap();
        assert_eq!(outcome.keyx, KeyxAction::Established);
        assert!(alice.established());
        assert!(bob.established());
    }

    #[test]
    fn basic_handshake_establishes_both_sides() {
        let (mut alice, mut bob) = pair();
        handshake(&mut alice, &mut bob);
    }

    #[test]
    fn message_round_trips_after_handshake() {
        let (mut alice, mut bob) = pair();
        handshake(&mut alice, &mut bob);

        let frame = alice
            .encrypt_msg(b"hello bob", &mut OsRng, &mut OsRng)
            .unwrap()
            .expect("ratchet established, should produce a frame");
        let outcome = bob.decrypt_msg(&frame, &mut OsRng, &mut OsRng).unwrap();
        let plaintext = outcome.plaintext.unwrap();
        assert!(plaintext.starts_with(b"hello bob"));

        // Bob's reply piggybacks an ack of alice's freshly advertised
        // ephemeral; alice consumes it without producing any plaintext.
        let ack = match outcome.keyx {
            KeyxAction::Send(frame) => frame,
            other => panic!("expected a piggyback ack, got {:?}", other),
        };
        let ack_outcome = alice.decrypt_msg(&ack, &mut OsRng, &mut OsRng).unwrap();
        assert!(ack_outcome.plaintext.is_none());
    }

    #[test]
    fn dropped_ack_does_not_desync_sender() {
        let (mut alice, mut bob) = pair();
        handshake(&mut alice, &mut bob);

        let frame = alice
            .encrypt_msg(b"first", &mut OsRng, &mut OsRng)
            .unwrap()
            .unwrap();
        let outcome = bob.decrypt_msg(&frame, &mut OsRng, &mut OsRng).unwrap();
        assert!(outcome.plaintext.is_some());
        // Alice never sees bob's piggybacked ack (dropped in transit).

        let frame2 = alice
            .encrypt_msg(b"second", &mut OsRng, &mut OsRng)
            .unwrap()
            .unwrap();
        let outcome2 = bob.decrypt_msg(&frame2, &mut OsRng, &mut OsRng).unwrap();
        assert!(outcome2.plaintext.is_some());
    }

    #[test]
    fn dropped_message_does_not_desync_the_ratchet() {
        let (mut alice, mut bob) = pair();
        handshake(&mut alice, &mut bob);

        let _dropped = alice
            .encrypt_msg(b"lost in transit", &mut OsRng, &mut OsRng)
            .unwrap()
            .unwrap();
        let second = alice
            .encrypt_msg(b"arrives fine", &mut OsRng, &mut OsRng)
            .unwrap()
            .unwrap();

        let outcome = bob.decrypt_msg(&second, &mut OsRng, &mut OsRng).unwrap();
        assert!(outcome.plaintext.unwrap().starts_with(b"arrives fine"));
    }

    #[test]
    fn pending_send_msgs_replay_on_a_fresh_opening() {
        // Buffered plaintexts are only ever handed back to the caller when
        // decrypt_msg processes a fresh initial-keyx opening (a handshake
        // or a reset), not on an ordinary message/ack exchange.
        let (mut alice, mut bob) = pair();
        handshake(&mut alice, &mut bob);

        let _buffered = alice
            .encrypt_msg(b"queued before any reset", &mut OsRng, &mut OsRng)
            .unwrap();

        // Bob re-opens the handshake (e.g. after losing his ratchet
        // state); since alice is already established and initiated the
        // first handshake, this reaches her "initiator receiving an ack"
        // path and flushes her pending_send buffer.
        let reopen = bob.encrypt_initial_keyx(&mut OsRng, &mut OsRng).unwrap();
        let outcome = alice.decrypt_msg(&reopen, &mut OsRng, &mut OsRng).unwrap();
        assert!(outcome
            .msgs
            .iter()
            .any(|m| m.starts_with(b"queued before any reset")));
    }

    #[test]
    fn simultaneous_initiation_converges_both_sides() {
        let (mut alice, mut bob) = pair();

        let alice_opening = alice.encrypt_initial_keyx(&mut OsRng, &mut OsRng).unwrap();
        let bob_opening = bob.encrypt_initial_keyx(&mut OsRng, &mut OsRng).unwrap();

        let bob_outcome = bob.decrypt_msg(&alice_opening, &mut OsRng, &mut OsRng).unwrap();
        let alice_outcome = alice.decrypt_msg(&bob_opening, &mut OsRng, &mut OsRng).unwrap();

        // Exactly one side defers silently; the other replies with an ack.
        let replies = [&bob_outcome.keyx, &alice_outcome.keyx]
            .iter()
            .filter(|k| matches!(k, KeyxAction::Send(_)))
            .count();
        assert_eq!(replies, 1);

        // Whichever side replied, deliver that ack to the other so both
        // sides are fully converged, then exchange a message in each
        // direction to confirm the race left a working pair of ratchets,
        // not just a handshake that "looks" established.
        if let KeyxAction::Send(ack) = &bob_outcome.keyx {
            let reply_outcome = alice.decrypt_msg(ack, &mut OsRng, &mut OsRng).unwrap();
            assert_eq!(reply_outcome.keyx, KeyxAction::Established);
        } else if let KeyxAction::Send(ack) = &alice_outcome.keyx {
            let reply_outcome = bob.decrypt_msg(ack, &mut OsRng, &mut OsRng).unwrap();
            assert_eq!(reply_outcome.keyx, KeyxAction::Established);
        }
        assert!(alice.established());
        assert!(bob.established());

        let frame = alice
            .encrypt_msg(b"post-race from alice", &mut OsRng, &mut OsRng)
            .unwrap()
            .expect("converged ratchet should produce a frame");
        let outcome = bob.decrypt_msg(&frame, &mut OsRng, &mut OsRng).unwrap();
        assert!(outcome.plaintext.unwrap().starts_with(b"post-race from alice"));

        let frame = bob
            .encrypt_msg(b"post-race from bob", &mut OsRng, &mut OsRng)
            .unwrap()
            .expect("converged ratchet should produce a frame");
        let outcome = alice.decrypt_msg(&frame, &mut OsRng, &mut OsRng).unwrap();
        assert!(outcome.plaintext.unwrap().starts_with(b"post-race from bob"));
    }

    #[test]
    fn s1_handshake_with_scenario_config() {
        let (mut alice, mut bob) = pair_with_config(scenario_config());
        let opening = alice.encrypt_initial_keyx(&mut OsRng, &mut OsRng).unwrap();
        assert_eq!(opening.len(), 400);
        let outcome = bob.decrypt_msg(&opening, &mut OsRng, &mut OsRng).unwrap();
        let ack = match outcome.keyx {
            KeyxAction::Send(frame) => frame,
            other => panic!("expected bob to reply with an ack, got {:?}", other),
        };
        assert_eq!(ack.len(), 400);
        let outcome = alice.decrypt_msg(&ack, &mut OsRng, &mut OsRng).unwrap();
        assert_eq!(outcome.keyx, KeyxAction::Established);
        assert!(alice.established());
        assert!(bob.established());
    }

    #[test]
    fn s2_simple_send_with_scenario_config() {
        let (mut alice, mut bob) = pair_with_config(scenario_config());
        handshake(&mut alice, &mut bob);

        let plaintext = b"ayy lmaoayy lmao";
        assert_eq!(plaintext.len(), 16);
        let frame = alice
            .encrypt_msg(plaintext, &mut OsRng, &mut OsRng)
            .unwrap()
            .unwrap();
        assert_eq!(frame.len(), 400);

        let outcome = bob.decrypt_msg(&frame, &mut OsRng, &mut OsRng).unwrap();
        assert_eq!(outcome.plaintext.unwrap(), plaintext);
        assert!(matches!(outcome.keyx, KeyxAction::Send(_)));
    }

    #[test]
    fn s3_dropped_ack_still_decrypts_next_message() {
        let (mut alice, mut bob) = pair_with_config(scenario_config());
        handshake(&mut alice, &mut bob);

        let frame = alice
            .encrypt_msg(b"first under scenario config", &mut OsRng, &mut OsRng)
            .unwrap()
            .unwrap();
        let outcome = bob.decrypt_msg(&frame, &mut OsRng, &mut OsRng).unwrap();
        assert!(outcome.plaintext.is_some());
        // Bob's piggybacked ack is dropped; alice never sees it.

        let frame2 = alice
            .encrypt_msg(b"second under scenario config", &mut OsRng, &mut OsRng)
            .unwrap()
            .unwrap();
        let outcome2 = bob.decrypt_msg(&frame2, &mut OsRng, &mut OsRng).unwrap();
        assert!(outcome2
            .plaintext
            .unwrap()
            .starts_with(b"second under scenario config"));
    }

    #[test]
    fn s4_dropped_message_still_allows_next_message() {
        let (mut alice, mut bob) = pair_with_config(scenario_config());
        handshake(&mut alice, &mut bob);

        let _dropped = alice
            .encrypt_msg(b"lost frame", &mut OsRng, &mut OsRng)
            .unwrap()
            .unwrap();
        let second = alice
            .encrypt_msg(b"arrives fine under scenario config", &mut OsRng, &mut OsRng)
            .unwrap()
            .unwrap();

        let outcome = bob.decrypt_msg(&second, &mut OsRng, &mut OsRng).unwrap();
        assert!(outcome
            .plaintext
            .unwrap()
            .starts_with(b"arrives fine under scenario config"));
    }

    #[test]
    fn s5_bidirectional_send_with_scenario_config() {
        let (mut alice, mut bob) = pair_with_config(scenario_config());
        handshake(&mut alice, &mut bob);

        // Alice sends first, as the other scenarios do.
        let frame = alice
            .encrypt_msg(b"hello from alice", &mut OsRng, &mut OsRng)
            .unwrap()
            .unwrap();
        let outcome = bob.decrypt_msg(&frame, &mut OsRng, &mut OsRng).unwrap();
        assert!(outcome.plaintext.unwrap().starts_with(b"hello from alice"));
        if let KeyxAction::Send(ack) = outcome.keyx {
            alice.decrypt_msg(&ack, &mut OsRng, &mut OsRng).unwrap();
        }

        // Bob now sends back, exercising the channel in the other
        // direction with the same non-default frame sizing.
        let reply = bob
            .encrypt_msg(b"ayy :)", &mut OsRng, &mut OsRng)
            .unwrap()
            .unwrap();
        assert_eq!(reply.len(), 400);
        let outcome = alice.decrypt_msg(&reply, &mut OsRng, &mut OsRng).unwrap();
        assert_eq!(outcome.plaintext.unwrap(), b"ayy :)");
        assert!(matches!(outcome.keyx, KeyxAction::Send(_)));
    }

    #[test]
    fn s6_tampered_frame_does_not_break_subsequent_traffic() {
        let (mut alice, mut bob) = pair_with_config(scenario_config());
        handshake(&mut alice, &mut bob);

        let mut frame = alice
            .encrypt_msg(b"about to be tampered with", &mut OsRng, &mut OsRng)
            .unwrap()
            .unwrap();
        for byte in frame.iter_mut() {
            *byte ^= 0xff;
        }
        let result = bob.decrypt_msg(&frame, &mut OsRng, &mut OsRng);
        assert!(matches!(result, Err(ChatsError::NotEncrypted)) || result.unwrap().plaintext.is_none());

        let clean = alice
            .encrypt_msg(b"clean frame after tamper", &mut OsRng, &mut OsRng)
            .unwrap()
            .unwrap();
        let outcome = bob.decrypt_msg(&clean, &mut OsRng, &mut OsRng).unwrap();
        assert!(outcome.plaintext.unwrap().starts_with(b"clean frame after tamper"));
    }

    #[test]
    fn determinism_given_identical_rng_seeds() {
        use rand_chacha::ChaCha20Rng;
        use rand_core::SeedableRng;

        // A fresh run, driven end to end by freshly re-seeded RNGs, must
        // produce a byte-identical opening frame every time: the frame
        // content is a pure function of the long-term keys and the RNG
        // streams, never of incidental state like allocation order.
        fn run() -> Vec<u8> {
            let mut key_rng = ChaCha20Rng::seed_from_u64(1);
            let alice_long = PrivateKey::generate(&mut key_rng);
            let bob_long = PrivateKey::generate(&mut key_rng);

            let mut csprng = ChaCha20Rng::seed_from_u64(42);
            let mut index_rng = ChaCha20Rng::seed_from_u64(7);
            let mut alice = Session::new(alice_long, bob_long.public(), SessionConfig::default(), &mut csprng);
            alice.encrypt_initial_keyx(&mut csprng, &mut index_rng).unwrap()
        }

        assert_eq!(run(), run());
    }

    #[test]
    fn repeated_ephemeral_is_rejected() {
        let (mut alice, mut bob) = pair();
        handshake(&mut alice, &mut bob);

        let frame = alice
            .encrypt_msg(b"first", &mut OsRng, &mut OsRng)
            .unwrap()
            .unwrap();
        let outcome = bob.decrypt_msg(&frame, &mut OsRng, &mut OsRng).unwrap();
        assert!(outcome.plaintext.is_some());

        // A second message from the same (not-yet-rotated) send ephemeral
        // must not be treated as a protocol violation — only a message
        // claiming to be the *already-adopted* `receive` ephemeral is.
        let frame2 = alice
            .encrypt_msg(b"second", &mut OsRng, &mut OsRng)
            .unwrap()
            .unwrap();
        let outcome2 = bob.decrypt_msg(&frame2, &mut OsRng, &mut OsRng);
        assert!(outcome2.is_ok());
    }

    #[test]
    fn tampered_frame_is_not_encrypted() {
        let (mut alice, mut bob) = pair();
        handshake(&mut alice, &mut bob);

        let mut frame = alice
            .encrypt_msg(b"hello bob", &mut OsRng, &mut OsRng)
            .unwrap()
            .unwrap();
        for byte in frame.iter_mut() {
            *byte ^= 0xff;
        }
        let result = bob.decrypt_msg(&frame, &mut OsRng, &mut OsRng);
        assert!(matches!(result, Err(ChatsError::NotEncrypted)) || result.unwrap().plaintext.is_none());
    }

    #[test]
    fn ratchet_rotation_promotes_pending_send_via_got_key() {
        let (mut alice, mut bob) = pair();
        handshake(&mut alice, &mut bob);

        let frame = alice
            .encrypt_msg(b"rotate me", &mut OsRng, &mut OsRng)
            .unwrap()
            .unwrap();
        let outcome = bob.decrypt_msg(&frame, &mut OsRng, &mut OsRng).unwrap();
        assert!(outcome.plaintext.is_some());
        assert!(bob.pending_receive.is_some());

        // decrypt_msg piggybacks the ack itself; no separate encrypt_keyx
        // call is needed.
        let ack = match outcome.keyx {
            KeyxAction::Send(frame) => frame,
            other => panic!("expected bob to piggyback an ack, got {:?}", other),
        };
        let outcome = alice.decrypt_msg(&ack, &mut OsRng, &mut OsRng).unwrap();
        assert_eq!(outcome.keyx, KeyxAction::None);
    }

    #[test]
    fn session_config_rejects_misaligned_sizes() {
        assert!(SessionConfig::new(100, 16).is_err());
        assert!(SessionConfig::new(480, 0).is_err());
        assert!(SessionConfig::new(480, 16).is_ok());
    }
}
