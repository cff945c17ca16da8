mod fingerprint;
pub use fingerprint::*;
mod record;
mod store;
pub use store::*;

use crate::crypto::generate_random_seed;
use crate::{Error, X25519PublicKey, X25519Secret};
use ed25519_dalek::{SecretKey, Signature, Signer, SigningKey, VerifyingKey};
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, Zeroizing};

/// The public half of a device identity.
///
/// Carries an Ed25519 key, used to prove possession during the handshake, and
/// an X25519 key, used for key agreement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityPublicKey {
    pub(crate) signing: VerifyingKey,
    pub(crate) dh: X25519PublicKey,
}

impl IdentityPublicKey {
    pub fn signing_key(&self) -> &VerifyingKey {
        &self.signing
    }

    pub fn dh_key(&self) -> &X25519PublicKey {
        &self.dh
    }

    /// Serializes to 64 bytes: Ed25519 key then X25519 key.
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[0..32].copy_from_slice(self.signing.as_bytes());
        bytes[32..64].copy_from_slice(self.dh.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Result<Self, Error> {
        let mut signing_bytes = [0u8; 32];
        signing_bytes.copy_from_slice(&bytes[0..32]);
        let signing = VerifyingKey::from_bytes(&signing_bytes)
            .map_err(|err| Error::Malformed(format!("identity signing key: {err}")))?;

        let mut dh_bytes = [0u8; 32];
        dh_bytes.copy_from_slice(&bytes[32..64]);

        Ok(Self {
            signing,
            dh: X25519PublicKey::from(dh_bytes),
        })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }
}

/// Long-term device key pair.
///
/// Created once per installation. The private halves never leave this type
/// except through [`IdentityStore`], which seals them before they touch disk.
/// Both secret keys zeroize themselves on drop.
pub struct DeviceIdentity {
    signing_key: Box<SigningKey>,
    dh_key: X25519Secret,
    public: IdentityPublicKey,
}

impl DeviceIdentity {
    /// Creates a new identity from fresh operating system randomness.
    pub fn generate() -> Result<Self, Error> {
        let mut signing_seed = generate_random_seed()?;
        let signing_key = Box::new(SigningKey::from_bytes(&SecretKey::from(*signing_seed)));
        signing_seed.zeroize();

        let dh_key = X25519Secret::from(generate_random_seed()?);

        Ok(Self::from_parts(signing_key, dh_key))
    }

    fn from_parts(signing_key: Box<SigningKey>, dh_key: X25519Secret) -> Self {
        let public = IdentityPublicKey {
            signing: signing_key.verifying_key(),
            dh: dh_key.public_key(),
        };

        Self {
            signing_key,
            dh_key,
            public,
        }
    }

    pub fn public_key(&self) -> IdentityPublicKey {
        self.public
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.public)
    }

    /// The device identifier shown to users and shared when pairing.
    pub fn device_id(&self) -> String {
        self.fingerprint().connect_id()
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> Result<SharedSecret, Error> {
        self.dh_key.dh(public_key)
    }

    /// The 64 secret bytes: Ed25519 seed then X25519 scalar.
    pub(crate) fn secret_bytes(&self) -> Zeroizing<[u8; 64]> {
        let mut bytes = Zeroizing::new([0u8; 64]);
        bytes[0..32].copy_from_slice(self.signing_key.as_bytes());
        bytes[32..64].copy_from_slice(self.dh_key.as_bytes());
        bytes
    }

    pub(crate) fn from_secret_bytes(bytes: &[u8; 64]) -> Self {
        let mut signing_seed = Box::new([0u8; 32]);
        signing_seed.copy_from_slice(&bytes[0..32]);
        let signing_key = Box::new(SigningKey::from_bytes(&SecretKey::from(*signing_seed)));
        signing_seed.zeroize();

        let mut dh_bytes = Box::new([0u8; 32]);
        dh_bytes.copy_from_slice(&bytes[32..64]);
        let dh_key = X25519Secret::from(dh_bytes);

        Self::from_parts(signing_key, dh_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    #[test]
    fn test_identity_generation() {
        let identity = DeviceIdentity::generate().unwrap();

        assert!(!identity.signing_key.as_bytes().iter().all(|&b| b == 0));
        assert!(!identity.dh_key.as_bytes().iter().all(|&b| b == 0));
        assert_eq!(identity.device_id(), identity.fingerprint().connect_id());
    }

    #[test]
    fn test_signing_and_verification() {
        let identity = DeviceIdentity::generate().unwrap();
        let message = b"This is a test message";

        let signature = identity.sign(message);
        let public = identity.public_key();
        assert!(public.signing_key().verify(message, &signature).is_ok());
        assert!(public.signing_key().verify(b"modified", &signature).is_err());
    }

    #[test]
    fn test_secret_bytes_round_trip() {
        let original = DeviceIdentity::generate().unwrap();
        let restored = DeviceIdentity::from_secret_bytes(&original.secret_bytes());

        assert_eq!(original.public_key(), restored.public_key());
        assert_eq!(original.fingerprint(), restored.fingerprint());
    }

    #[test]
    fn test_public_key_bytes() {
        let public = DeviceIdentity::generate().unwrap().public_key();
        let bytes = public.to_bytes();

        assert_eq!(IdentityPublicKey::from_bytes(&bytes).unwrap(), public);
    }
}
