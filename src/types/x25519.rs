use crate::Error;
use crate::crypto::generate_random_seed;
use std::fmt;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// An X25519 public key as sent over the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct X25519PublicKey(PublicKey);

impl X25519PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl fmt::Debug for X25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X25519PublicKey({:02x?})", &self.0.as_bytes()[..4])
    }
}

impl From<[u8; 32]> for X25519PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(PublicKey::from(bytes))
    }
}

impl From<PublicKey> for X25519PublicKey {
    fn from(value: PublicKey) -> Self {
        Self(value)
    }
}

impl AsRef<PublicKey> for X25519PublicKey {
    fn as_ref(&self) -> &PublicKey {
        &self.0
    }
}

/// An X25519 private key, zeroized when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct X25519Secret(Box<StaticSecret>);

impl X25519Secret {
    /// Generates a fresh key from the operating system RNG.
    pub(crate) fn generate() -> Result<Self, Error> {
        Ok(Self::from(generate_random_seed()?))
    }

    /// Diffie-Hellman with a peer key. Fails if the peer key is a low-order
    /// point that would make the output independent of our secret.
    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> Result<SharedSecret, Error> {
        let shared = self.0.diffie_hellman(public_key.as_ref());
        if !shared.was_contributory() {
            return Err(Error::AuthenticationFailure);
        }
        Ok(shared)
    }

    pub(crate) fn public_key(&self) -> X25519PublicKey {
        PublicKey::from(self.0.as_ref()).into()
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl From<Box<[u8; 32]>> for X25519Secret {
    fn from(mut bytes: Box<[u8; 32]>) -> Self {
        let secret = StaticSecret::from(*bytes);
        bytes.zeroize();
        Self(Box::new(secret))
    }
}
