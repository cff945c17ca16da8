//! Mutual authenticated key agreement between two devices.
//!
//! Each side sends its long-term public key and a fresh ephemeral key, then
//! mixes three Diffie-Hellman values into a root secret:
//!
//! ```text
//! DH(IK_i, EK_r) || DH(EK_i, IK_r) || DH(EK_i, EK_r)
//! ```
//!
//! Possession of the long-term key is proven with an Ed25519 signature over
//! the transcript, and agreement on the root with an HMAC key confirmation.
//! The ephemeral secret is dropped, and zeroed, as soon as the root exists.

mod outcome;
pub use outcome::*;

use crate::config::SessionConfig;
use crate::crypto::{hkdf_expand, hmac_sha256, hmac_verify};
use crate::identity::{DeviceIdentity, IdentityPublicKey};
use crate::transport::Stream;
use crate::wire::{Frame, HandshakeFinish, HandshakeHello};
use crate::{Error, X25519Secret};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

const ROOT_SALT: &[u8] = b"PeerSeal-Handshake-Root";
const TRANSCRIPT_LABEL: &[u8] = b"PeerSeal-Handshake-Transcript";
const SIGNATURE_LABEL: &[u8] = b"PeerSeal-Handshake-Signature";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    EphemeralSent,
    PeerEphemeralReceived,
    RootSecretDerived,
    Aborted,
}

/// Runs one handshake over an already connected stream.
///
/// An engine is single-use: once it reaches `RootSecretDerived` or `Aborted`
/// it stays there. Retrying after a failure means building a new engine.
pub struct HandshakeEngine {
    identity: Arc<DeviceIdentity>,
    role: Role,
    verification: PeerVerification,
    protocol_info: Vec<u8>,
    timeout: Duration,
    state: HandshakeState,
}

impl HandshakeEngine {
    pub fn new(
        identity: Arc<DeviceIdentity>,
        role: Role,
        verification: PeerVerification,
        config: &SessionConfig,
    ) -> Self {
        Self {
            identity,
            role,
            verification,
            protocol_info: config.protocol_info.clone(),
            timeout: config.handshake_timeout,
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Performs the exchange, bounded by the configured handshake timeout.
    ///
    /// On any failure the engine moves to `Aborted` and all key material
    /// generated so far has already been wiped.
    pub async fn run(&mut self, stream: &mut Stream) -> Result<HandshakeOutcome, Error> {
        if self.state != HandshakeState::Idle {
            return Err(Error::InvalidState(format!(
                "handshake engine is {:?}",
                self.state
            )));
        }

        let timeout = self.timeout;
        let result = match tokio::time::timeout(timeout, self.exchange(stream)).await {
            Ok(result) => result,
            Err(_) => Err(Error::HandshakeTimeout),
        };

        match &result {
            Ok(outcome) => {
                tracing::info!(
                    role = ?self.role,
                    peer = %outcome.peer_fingerprint().short_id(),
                    trust = ?outcome.trust(),
                    "handshake complete"
                );
            }
            Err(err) => {
                tracing::warn!(role = ?self.role, state = ?self.state, %err, "handshake aborted");
                self.state = HandshakeState::Aborted;
            }
        }

        result
    }

    async fn exchange(&mut self, stream: &mut Stream) -> Result<HandshakeOutcome, Error> {
        let ephemeral = X25519Secret::generate()?;
        let our_hello = Frame::Hello(HandshakeHello {
            identity: self.identity.public_key(),
            ephemeral: ephemeral.public_key(),
        })
        .to_bytes();

        stream.send(&our_hello).await?;
        self.transition(HandshakeState::EphemeralSent);

        let peer_hello_bytes = stream.receive().await?;
        let peer_hello = match Frame::from_bytes(&peer_hello_bytes)? {
            Frame::Hello(hello) => hello,
            _ => return Err(Error::Malformed("expected handshake hello".to_string())),
        };
        self.transition(HandshakeState::PeerEphemeralReceived);

        self.check_peer(&peer_hello.identity)?;

        let transcript = match self.role {
            Role::Initiator => transcript_hash(&our_hello, &peer_hello_bytes),
            Role::Responder => transcript_hash(&peer_hello_bytes, &our_hello),
        };

        let root = self.derive_root(&ephemeral, &peer_hello)?;
        drop(ephemeral);

        let our_finish = HandshakeFinish {
            signature: self
                .identity
                .sign(&signature_payload(self.role, &transcript)),
            confirmation: self.confirmation(&root, self.role, &transcript)?,
        };
        stream.send(&Frame::Finish(our_finish).to_bytes()).await?;

        let peer_finish = match Frame::from_bytes(&stream.receive().await?)? {
            Frame::Finish(finish) => finish,
            _ => return Err(Error::Malformed("expected handshake finish".to_string())),
        };
        self.verify_finish(&root, &peer_hello.identity, &transcript, &peer_finish)?;

        let session_id = **hkdf_expand(
            None,
            root.0.as_slice(),
            &[&self.protocol_info, b"session-id"],
        )?;
        self.transition(HandshakeState::RootSecretDerived);

        Ok(HandshakeOutcome {
            root,
            transcript,
            role: self.role,
            peer: peer_hello.identity,
            trust: Trust::from(self.verification),
            session_id,
        })
    }

    fn transition(&mut self, next: HandshakeState) {
        tracing::debug!(role = ?self.role, from = ?self.state, to = ?next, "handshake state");
        self.state = next;
    }

    fn check_peer(&self, peer: &IdentityPublicKey) -> Result<(), Error> {
        if *peer == self.identity.public_key() {
            return Err(Error::AuthenticationFailure);
        }

        if let PeerVerification::Pinned(expected) = self.verification {
            if peer.fingerprint() != expected {
                return Err(Error::AuthenticationFailure);
            }
        }

        Ok(())
    }

    fn derive_root(
        &self,
        ephemeral: &X25519Secret,
        peer: &HandshakeHello,
    ) -> Result<RootSecret, Error> {
        let (dh1, dh2) = match self.role {
            Role::Initiator => (
                self.identity.dh(&peer.ephemeral)?,
                ephemeral.dh(peer.identity.dh_key())?,
            ),
            Role::Responder => (
                ephemeral.dh(peer.identity.dh_key())?,
                self.identity.dh(&peer.ephemeral)?,
            ),
        };
        let dh3 = ephemeral.dh(&peer.ephemeral)?;

        let mut ikm = Zeroizing::new([0u8; 96]);
        ikm[0..32].copy_from_slice(dh1.as_bytes());
        ikm[32..64].copy_from_slice(dh2.as_bytes());
        ikm[64..96].copy_from_slice(dh3.as_bytes());

        let root = hkdf_expand(Some(ROOT_SALT), ikm.as_slice(), &[&self.protocol_info, b"root"])?;
        Ok(RootSecret(root))
    }

    fn confirmation(
        &self,
        root: &RootSecret,
        role: Role,
        transcript: &[u8; 32],
    ) -> Result<[u8; 32], Error> {
        let key = hkdf_expand(
            None,
            root.0.as_slice(),
            &[&self.protocol_info, b"confirm", role.label()],
        )?;
        hmac_sha256(key.as_slice(), &[transcript])
    }

    fn verify_finish(
        &self,
        root: &RootSecret,
        peer: &IdentityPublicKey,
        transcript: &[u8; 32],
        finish: &HandshakeFinish,
    ) -> Result<(), Error> {
        let peer_role = self.role.peer();

        peer.signing_key()
            .verify_strict(&signature_payload(peer_role, transcript), &finish.signature)
            .map_err(|_| Error::AuthenticationFailure)?;

        let key = hkdf_expand(
            None,
            root.0.as_slice(),
            &[&self.protocol_info, b"confirm", peer_role.label()],
        )?;
        hmac_verify(key.as_slice(), &[transcript], &finish.confirmation)
    }
}

fn transcript_hash(initiator_hello: &[u8], responder_hello: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(TRANSCRIPT_LABEL);
    hasher.update(initiator_hello);
    hasher.update(responder_hello);
    hasher.finalize().into()
}

fn signature_payload(role: Role, transcript: &[u8; 32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(SIGNATURE_LABEL.len() + 9 + 32);
    payload.extend_from_slice(SIGNATURE_LABEL);
    payload.extend_from_slice(role.label());
    payload.extend_from_slice(transcript);
    payload
}
