use crate::crypto::DerivedKey;
use crate::identity::{Fingerprint, IdentityPublicKey};

/// Which side of the connection a device is on. The side that called
/// `connect` is the initiator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn peer(self) -> Self {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }

    pub(crate) fn label(self) -> &'static [u8] {
        match self {
            Role::Initiator => b"initiator",
            Role::Responder => b"responder",
        }
    }
}

/// How the peer's fingerprint is checked during pairing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerVerification {
    /// The user already entered the peer's connect ID. Any other key aborts
    /// the handshake.
    Pinned(Fingerprint),
    /// The fingerprint is shown to the user and confirmed later.
    Deferred,
    /// Verification is skipped by policy.
    Skip,
}

/// Whether the peer fingerprint was checked by a human. Affects display only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trust {
    Verified,
    Unverified,
    SkippedByPolicy,
}

impl From<PeerVerification> for Trust {
    fn from(verification: PeerVerification) -> Self {
        match verification {
            PeerVerification::Pinned(_) => Trust::Verified,
            PeerVerification::Deferred => Trust::Unverified,
            PeerVerification::Skip => Trust::SkippedByPolicy,
        }
    }
}

/// Shared secret produced by a completed handshake.
pub(crate) struct RootSecret(pub(crate) DerivedKey);

/// Everything a successful handshake hands to the ratchet.
///
/// The root secret can only be consumed by building a
/// [`RatchetSession`](crate::RatchetSession) from this value.
pub struct HandshakeOutcome {
    pub(crate) root: RootSecret,
    pub(crate) transcript: [u8; 32],
    pub(crate) role: Role,
    pub(crate) peer: IdentityPublicKey,
    pub(crate) trust: Trust,
    pub(crate) session_id: [u8; 32],
}

impl HandshakeOutcome {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_key(&self) -> &IdentityPublicKey {
        &self.peer
    }

    pub fn peer_fingerprint(&self) -> Fingerprint {
        self.peer.fingerprint()
    }

    pub fn trust(&self) -> Trust {
        self.trust
    }

    /// One-way identifier of the root secret. Both sides of one handshake see
    /// the same value; two handshakes never do.
    pub fn session_id(&self) -> [u8; 32] {
        self.session_id
    }
}
