mod arena;
mod chain;
mod envelope;
mod state;

pub use envelope::{ExpiryPolicy, MessageEnvelope};
pub(crate) use envelope::now_millis;
pub use state::{CloseReason, SessionState};

use crate::config::{SessionConfig, SkippedKeyPolicy};
use crate::crypto::{hkdf_expand, hmac_sha256, hmac_verify};
use crate::handshake::{HandshakeOutcome, Role, Trust};
use crate::identity::{Fingerprint, IdentityPublicKey};
use crate::ratchet::chain::MessageKey;
use crate::ratchet::state::{DirectionState, Status};
use crate::wipe::SecretBuffer;
use crate::wire::PROTOCOL_VERSION;
use crate::Error;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::time::SystemTime;
use zeroize::{Zeroize, Zeroizing};

thread_local! {
    static AD_BUFFER: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(256));
}

fn with_ad_buffer<F, R>(f: F) -> R
where
    F: FnOnce(&mut Vec<u8>) -> R,
{
    AD_BUFFER.with(|buffer| {
        let mut buffer = buffer.borrow_mut();
        buffer.clear();
        f(&mut buffer)
    })
}

const INITIATOR_TO_RESPONDER: &[u8] = b"initiator->responder";
const RESPONDER_TO_INITIATOR: &[u8] = b"responder->initiator";

/// Per-message encryption for one established session.
///
/// The sending and receiving chains are derived from the handshake root with
/// direction-specific labels, after which the root is wiped. Each chain sits
/// behind its own lock, so one send and one receive can run concurrently while
/// two sends (or two receives) are serialized.
///
/// Every message key is used once. Advancing a chain overwrites the previous
/// chain key, so a captured key never opens an earlier message.
pub struct RatchetSession {
    sending: Mutex<DirectionState>,
    receiving: Mutex<DirectionState>,
    transcript: [u8; 32],
    role: Role,
    peer: IdentityPublicKey,
    peer_fingerprint: Fingerprint,
    session_id: [u8; 32],
    trust: Mutex<Trust>,
    created_at: SystemTime,
    reorder_window: u32,
    skipped_key_policy: SkippedKeyPolicy,
    max_message_size: usize,
}

impl RatchetSession {
    /// Consumes a handshake outcome. The root secret does not outlive this
    /// call.
    pub fn new(outcome: HandshakeOutcome, config: &SessionConfig) -> Result<Self, Error> {
        let HandshakeOutcome {
            root,
            transcript,
            role,
            peer,
            trust,
            session_id,
        } = outcome;

        let (send_label, receive_label) = match role {
            Role::Initiator => (INITIATOR_TO_RESPONDER, RESPONDER_TO_INITIATOR),
            Role::Responder => (RESPONDER_TO_INITIATOR, INITIATOR_TO_RESPONDER),
        };

        let info = config.protocol_info.as_slice();
        let derive = |purpose: &[u8], direction: &[u8]| {
            hkdf_expand(None, root.0.as_slice(), &[info, purpose, direction])
        };

        let sending = DirectionState::new(
            derive(b"chain", send_label)?,
            derive(b"header", send_label)?,
        );
        let receiving = DirectionState::new(
            derive(b"chain", receive_label)?,
            derive(b"header", receive_label)?,
        );
        drop(root);

        let peer_fingerprint = peer.fingerprint();
        tracing::debug!(peer = %peer_fingerprint.short_id(), ?role, "session established");

        Ok(Self {
            sending: Mutex::new(sending),
            receiving: Mutex::new(receiving),
            transcript,
            role,
            peer,
            peer_fingerprint,
            session_id,
            trust: Mutex::new(trust),
            created_at: SystemTime::now(),
            reorder_window: config.reorder_window,
            skipped_key_policy: config.skipped_key_policy,
            max_message_size: config.max_message_size,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> &IdentityPublicKey {
        &self.peer
    }

    pub fn peer_fingerprint(&self) -> Fingerprint {
        self.peer_fingerprint
    }

    pub fn session_id(&self) -> [u8; 32] {
        self.session_id
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn trust(&self) -> Trust {
        *self.trust.lock()
    }

    /// Records that the user compared fingerprints out of band. Fails, and
    /// leaves trust unchanged, if `fingerprint` is not this peer's.
    pub fn confirm_fingerprint(&self, fingerprint: &Fingerprint) -> Result<(), Error> {
        if *fingerprint != self.peer_fingerprint {
            return Err(Error::AuthenticationFailure);
        }
        *self.trust.lock() = Trust::Verified;
        Ok(())
    }

    /// Counter of the last message sent.
    pub fn send_counter(&self) -> u64 {
        self.sending.lock().chain.index
    }

    /// Highest counter received so far.
    pub fn receive_counter(&self) -> u64 {
        self.receiving.lock().chain.index
    }

    pub fn state(&self) -> SessionState {
        let sending = self.sending.lock().status;
        let receiving = self.receiving.lock().status;

        match (sending, receiving) {
            (Status::Active, Status::Active) => SessionState::Active,
            (Status::Closed(_), Status::Closed(_)) => SessionState::Closed,
            _ => SessionState::Closing,
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<MessageEnvelope, Error> {
        self.encrypt_with_policy(plaintext, None)
    }

    /// Encrypts one message under the next sending key. The expiry policy
    /// travels in the authenticated header.
    pub fn encrypt_with_policy(
        &self,
        plaintext: &[u8],
        policy: Option<ExpiryPolicy>,
    ) -> Result<MessageEnvelope, Error> {
        if plaintext.len() > self.max_message_size {
            return Err(Error::MessageTooLarge {
                size: plaintext.len(),
                max: self.max_message_size,
            });
        }

        let mut sending = self.sending.lock();
        sending.ensure_active()?;

        let message_key = sending.chain.next()?;
        let mut envelope = MessageEnvelope {
            version: PROTOCOL_VERSION,
            ephemeral: None,
            counter: sending.chain.index,
            policy,
            ciphertext: Vec::new(),
            tag: [0u8; 16],
            header_mac: [0u8; 32],
        };
        let header = envelope.header_bytes();

        let (ciphertext, tag) = with_ad_buffer(|buffer| {
            buffer.extend_from_slice(&self.transcript);
            buffer.extend_from_slice(&header);
            message_key.seal(plaintext, buffer)
        })?;
        drop(message_key);

        envelope.header_mac =
            hmac_sha256(sending.header_key.as_slice(), &[&header, &ciphertext, &tag])?;
        envelope.ciphertext = ciphertext;
        envelope.tag = tag;

        Ok(envelope)
    }

    /// Authenticates and decrypts one envelope.
    ///
    /// Any failure leaves the receiving chain exactly as it was. A key taken
    /// from the skipped-key arena goes back if the message does not verify.
    pub fn decrypt(&self, envelope: &MessageEnvelope) -> Result<SecretBuffer, Error> {
        let mut receiving = self.receiving.lock();
        receiving.ensure_active()?;

        if envelope.version != PROTOCOL_VERSION {
            return Err(Error::Malformed(format!(
                "unsupported protocol version {}",
                envelope.version
            )));
        }
        if envelope.ephemeral.is_some() {
            return Err(Error::Malformed(
                "unexpected ephemeral key on session message".to_string(),
            ));
        }

        let header = envelope.header_bytes();
        hmac_verify(
            receiving.header_key.as_slice(),
            &[&header, &envelope.ciphertext, &envelope.tag],
            &envelope.header_mac,
        )?;

        let counter = envelope.counter;
        if counter == 0 {
            return Err(Error::Malformed("message counter 0".to_string()));
        }

        let open = |key: &MessageKey| {
            with_ad_buffer(|buffer| {
                buffer.extend_from_slice(&self.transcript);
                buffer.extend_from_slice(&header);
                key.open(&envelope.ciphertext, &envelope.tag, buffer)
            })
            .map(Zeroizing::new)
        };

        if counter <= receiving.chain.index {
            let key = receiving
                .skipped
                .take(counter)
                .ok_or(Error::Replay { counter })?;
            return match open(&key) {
                Ok(plaintext) => Ok(plaintext),
                Err(err) => {
                    receiving.skipped.insert(counter, key);
                    Err(err)
                }
            };
        }

        let gap = counter - receiving.chain.index - 1;
        if gap > u64::from(self.reorder_window) {
            return Err(Error::OutOfOrderGapExceeded {
                counter,
                window: self.reorder_window,
            });
        }

        let mut chain = receiving.chain.clone();
        let mut skipped = Vec::with_capacity(gap as usize);
        while chain.index + 1 < counter {
            let key = chain.next()?;
            skipped.push((chain.index, key));
        }
        let key = chain.next()?;
        let plaintext = open(&key)?;

        receiving.chain = chain;
        match self.skipped_key_policy {
            SkippedKeyPolicy::RetainWithinWindow => {
                for (skipped_counter, key) in skipped {
                    receiving.skipped.insert(skipped_counter, key);
                }
                let floor = counter.saturating_sub(u64::from(self.reorder_window));
                let evicted = receiving.skipped.evict_below(floor);
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted skipped message keys");
                }
            }
            SkippedKeyPolicy::WipeOnAdvance => drop(skipped),
        }

        Ok(plaintext)
    }

    /// Wipes both chains and the skipped-key arena. Idempotent; the first
    /// reason sticks.
    pub fn close(&self, reason: CloseReason) {
        let closed_sending = self.sending.lock().close(reason);
        let closed_receiving = self.receiving.lock().close(reason);

        if closed_sending || closed_receiving {
            tracing::info!(peer = %self.peer_fingerprint.short_id(), ?reason, "session closed");
        }
    }

    pub fn close_session(&self) {
        self.close(CloseReason::Local);
    }
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.transcript.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{HandshakeEngine, PeerVerification};
    use crate::identity::DeviceIdentity;
    use crate::transport::memory;
    use std::sync::Arc;

    async fn outcomes() -> (HandshakeOutcome, HandshakeOutcome) {
        let config = SessionConfig::default();
        let alice = Arc::new(DeviceIdentity::generate().unwrap());
        let bob = Arc::new(DeviceIdentity::generate().unwrap());
        let (mut a, mut b) = memory::pair();

        let mut bob_engine =
            HandshakeEngine::new(bob, Role::Responder, PeerVerification::Deferred, &config);
        let responder = tokio::spawn(async move { bob_engine.run(&mut b).await.unwrap() });

        let mut alice_engine =
            HandshakeEngine::new(alice, Role::Initiator, PeerVerification::Deferred, &config);
        let alice_outcome = alice_engine.run(&mut a).await.unwrap();

        (alice_outcome, responder.await.unwrap())
    }

    fn create_sessions_with(config: SessionConfig) -> (RatchetSession, RatchetSession) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (alice, bob) = runtime.block_on(outcomes());

        (
            RatchetSession::new(alice, &config).unwrap(),
            RatchetSession::new(bob, &config).unwrap(),
        )
    }

    fn create_sessions() -> (RatchetSession, RatchetSession) {
        create_sessions_with(SessionConfig::default())
    }

    #[test]
    fn test_basic_exchange() {
        let (alice, bob) = create_sessions();

        let encrypted = alice.encrypt(b"Hello, Bob!").unwrap();
        assert_eq!(encrypted.counter(), 1);
        assert_eq!(bob.decrypt(&encrypted).unwrap().as_slice(), b"Hello, Bob!");

        let response = bob.encrypt(b"Hello, Alice!").unwrap();
        assert_eq!(alice.decrypt(&response).unwrap().as_slice(), b"Hello, Alice!");

        assert_eq!(alice.session_id(), bob.session_id());
        assert_eq!(alice.role(), Role::Initiator);
        assert_eq!(bob.role(), Role::Responder);
        assert_eq!(alice.peer_fingerprint(), alice.peer().fingerprint());
    }

    #[test]
    fn test_in_order_then_replay() {
        let (alice, bob) = create_sessions();

        let messages = ["Message 1", "Message 2", "Message 3", "Message 4", "Message 5"];
        let mut envelopes = Vec::new();
        for msg in &messages {
            envelopes.push(alice.encrypt(msg.as_bytes()).unwrap());
        }

        for (msg, envelope) in messages.iter().zip(&envelopes) {
            assert_eq!(bob.decrypt(envelope).unwrap().as_slice(), msg.as_bytes());
        }
        assert_eq!(bob.receive_counter(), 5);

        for envelope in &envelopes {
            assert_eq!(
                bob.decrypt(envelope),
                Err(Error::Replay {
                    counter: envelope.counter()
                })
            );
        }
    }

    #[test]
    fn test_sessions_do_not_reflect() {
        let (alice, _bob) = create_sessions();

        let envelope = alice.encrypt(b"echo").unwrap();
        assert_eq!(alice.decrypt(&envelope), Err(Error::AuthenticationFailure));
    }

    #[test]
    fn test_out_of_order_within_window() {
        let (alice, bob) = create_sessions();

        let one = alice.encrypt(b"1").unwrap();
        let two = alice.encrypt(b"2").unwrap();
        let three = alice.encrypt(b"3").unwrap();

        assert_eq!(bob.decrypt(&one).unwrap().as_slice(), b"1");
        assert_eq!(bob.decrypt(&three).unwrap().as_slice(), b"3");
        assert_eq!(bob.decrypt(&two).unwrap().as_slice(), b"2");

        // Both the late key and the consumed ones are gone now.
        assert_eq!(bob.decrypt(&two), Err(Error::Replay { counter: 2 }));
        assert_eq!(bob.decrypt(&three), Err(Error::Replay { counter: 3 }));
    }

    #[test]
    fn test_wipe_on_advance_reports_late_message_as_replay() {
        let (alice, bob) = create_sessions_with(SessionConfig {
            skipped_key_policy: SkippedKeyPolicy::WipeOnAdvance,
            ..SessionConfig::default()
        });

        let one = alice.encrypt(b"1").unwrap();
        let two = alice.encrypt(b"2").unwrap();
        let three = alice.encrypt(b"3").unwrap();

        assert_eq!(bob.decrypt(&one).unwrap().as_slice(), b"1");
        assert_eq!(bob.decrypt(&three).unwrap().as_slice(), b"3");
        assert_eq!(bob.decrypt(&two), Err(Error::Replay { counter: 2 }));
    }

    #[test]
    fn test_gap_beyond_window() {
        let (alice, bob) = create_sessions_with(SessionConfig {
            reorder_window: 2,
            ..SessionConfig::default()
        });

        let envelopes: Vec<_> = (0..5)
            .map(|i| alice.encrypt(format!("Message {i}").as_bytes()).unwrap())
            .collect();

        bob.decrypt(&envelopes[0]).unwrap();

        // Counter 5 would skip three keys, more than the window allows.
        assert_eq!(
            bob.decrypt(&envelopes[4]),
            Err(Error::OutOfOrderGapExceeded {
                counter: 5,
                window: 2
            })
        );
        assert_eq!(bob.receive_counter(), 1);

        // Counter 4 skips exactly two.
        assert!(bob.decrypt(&envelopes[3]).is_ok());
        assert!(bob.decrypt(&envelopes[4]).is_ok());
    }

    #[test]
    fn test_evicts_keys_that_fall_out_of_window() {
        let (alice, bob) = create_sessions_with(SessionConfig {
            reorder_window: 2,
            ..SessionConfig::default()
        });

        let envelopes: Vec<_> = (0..6).map(|_| alice.encrypt(b"m").unwrap()).collect();

        bob.decrypt(&envelopes[2]).unwrap(); // skips 1, 2
        bob.decrypt(&envelopes[5]).unwrap(); // skips 4, 5; window floor is 4

        assert_eq!(bob.decrypt(&envelopes[0]), Err(Error::Replay { counter: 1 }));
        assert_eq!(bob.decrypt(&envelopes[1]), Err(Error::Replay { counter: 2 }));
        assert!(bob.decrypt(&envelopes[3]).is_ok());
        assert!(bob.decrypt(&envelopes[4]).is_ok());
    }

    #[test]
    fn test_tampering_fails_without_advancing() {
        let (alice, bob) = create_sessions();

        let envelope = alice.encrypt(b"integrity matters").unwrap();

        let mut flipped_ciphertext = envelope.clone();
        flipped_ciphertext.ciphertext[0] ^= 0x01;
        assert_eq!(
            bob.decrypt(&flipped_ciphertext),
            Err(Error::AuthenticationFailure)
        );

        let mut flipped_tag = envelope.clone();
        flipped_tag.tag[15] ^= 0x80;
        assert_eq!(bob.decrypt(&flipped_tag), Err(Error::AuthenticationFailure));

        for bit in [0u64, 1, 7, 40, 63] {
            let mut flipped_counter = envelope.clone();
            flipped_counter.counter ^= 1 << bit;
            assert_eq!(
                bob.decrypt(&flipped_counter),
                Err(Error::AuthenticationFailure)
            );
        }

        let mut stripped_policy = alice
            .encrypt_with_policy(b"burn", Some(ExpiryPolicy::WipeOnRead))
            .unwrap();
        stripped_policy.policy = None;
        assert_eq!(
            bob.decrypt(&stripped_policy),
            Err(Error::AuthenticationFailure)
        );

        assert_eq!(bob.receive_counter(), 0);
        assert_eq!(
            bob.decrypt(&envelope).unwrap().as_slice(),
            b"integrity matters"
        );
    }

    #[test]
    fn test_bad_message_does_not_consume_skipped_key() {
        let (alice, bob) = create_sessions();

        let one = alice.encrypt(b"1").unwrap();
        let two = alice.encrypt(b"2").unwrap();
        bob.decrypt(&two).unwrap();

        let mut forged = one.clone();
        forged.ciphertext[0] ^= 0xFF;
        assert_eq!(bob.decrypt(&forged), Err(Error::AuthenticationFailure));
        assert_eq!(bob.decrypt(&one).unwrap().as_slice(), b"1");
    }

    #[test]
    fn test_payload_boundaries() {
        let config = SessionConfig {
            max_message_size: 4096,
            ..SessionConfig::default()
        };
        let (alice, bob) = create_sessions_with(config);

        let empty = alice.encrypt(b"").unwrap();
        assert!(bob.decrypt(&empty).unwrap().is_empty());

        let largest = vec![0xA5u8; 4096];
        let envelope = alice.encrypt(&largest).unwrap();
        assert_eq!(bob.decrypt(&envelope).unwrap().as_slice(), largest.as_slice());

        assert_eq!(
            alice.encrypt(&[0u8; 4097]).err(),
            Some(Error::MessageTooLarge {
                size: 4097,
                max: 4096
            })
        );
    }

    #[test]
    fn test_policy_travels_with_message() {
        let (alice, bob) = create_sessions();

        let policy = ExpiryPolicy::ExpiresAt {
            unix_millis: 1_900_000_000_000,
        };
        let envelope = alice.encrypt_with_policy(b"timed", Some(policy)).unwrap();
        let received = MessageEnvelope::from_bytes(&envelope.to_bytes()).unwrap();

        assert_eq!(received.policy(), Some(policy));
        assert_eq!(bob.decrypt(&received).unwrap().as_slice(), b"timed");
    }

    #[test]
    fn test_closed_session_refuses_work() {
        let (alice, bob) = create_sessions();

        let pending = alice.encrypt(b"before close").unwrap();
        bob.close_session();
        bob.close(CloseReason::Transport);

        assert_eq!(bob.state(), SessionState::Closed);
        assert_eq!(bob.decrypt(&pending), Err(Error::SessionClosed));
        assert_eq!(bob.encrypt(b"after").err(), Some(Error::SessionClosed));
        assert_eq!(bob.receive_counter(), 0);
        assert_eq!(alice.state(), SessionState::Active);
    }

    #[test]
    fn test_transport_close_reports_transport_closed() {
        let (alice, _bob) = create_sessions();

        alice.close(CloseReason::Transport);
        assert_eq!(alice.encrypt(b"x").err(), Some(Error::TransportClosed));
    }

    #[test]
    fn test_confirm_fingerprint() {
        let (alice, bob) = create_sessions();
        assert_eq!(alice.trust(), Trust::Unverified);

        // Bob's peer is Alice, so this is Alice's own fingerprint.
        let alice_fingerprint = bob.peer_fingerprint();
        assert_eq!(
            alice.confirm_fingerprint(&alice_fingerprint),
            Err(Error::AuthenticationFailure)
        );
        assert_eq!(alice.trust(), Trust::Unverified);

        let bob_fingerprint = alice.peer_fingerprint();
        alice.confirm_fingerprint(&bob_fingerprint).unwrap();
        assert_eq!(alice.trust(), Trust::Verified);
    }

    #[test]
    fn test_concurrent_send_and_receive() {
        let (alice, bob) = create_sessions();
        let alice = Arc::new(alice);
        let bob = Arc::new(bob);

        let inbound: Vec<_> = (0..200)
            .map(|i| bob.encrypt(format!("from bob {i}").as_bytes()).unwrap())
            .collect();

        let (outbound, received) = std::thread::scope(|scope| {
            let sender = scope.spawn(|| {
                (0..200)
                    .map(|i| alice.encrypt(format!("from alice {i}").as_bytes()).unwrap())
                    .collect::<Vec<_>>()
            });
            let receiver = scope.spawn(|| {
                inbound
                    .iter()
                    .map(|envelope| alice.decrypt(envelope).unwrap())
                    .count()
            });
            (sender.join().unwrap(), receiver.join().unwrap())
        });

        assert_eq!(received, 200);
        let counters: Vec<u64> = outbound.iter().map(|envelope| envelope.counter()).collect();
        assert_eq!(counters, (1..=200).collect::<Vec<_>>());
        for (i, envelope) in outbound.iter().enumerate() {
            assert_eq!(
                bob.decrypt(envelope).unwrap().as_slice(),
                format!("from alice {i}").as_bytes()
            );
        }
    }
}
