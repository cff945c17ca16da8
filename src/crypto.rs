use crate::Error;
use aes_gcm_siv::aead::{Aead, Payload};
use aes_gcm_siv::{Aes256GcmSiv, KeyInit, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

type HmacSha256 = Hmac<Sha256>;

pub(crate) const NONCE_SIZE: usize = 12; // AES-GCM-SIV uses 12-byte (96-bit) nonces
pub(crate) const TAG_SIZE: usize = 16;
pub(crate) const MAC_SIZE: usize = 32;

/// A 32-byte key that is zeroed when dropped.
pub(crate) type DerivedKey = Zeroizing<Box<[u8; 32]>>;

/// Generates a cryptographically secure random 32-byte seed.
pub(crate) fn generate_random_seed() -> Result<Box<[u8; 32]>, Error> {
    let mut seed = Box::new([0u8; 32]);
    OsRng
        .try_fill_bytes(seed.as_mut_slice())
        .map_err(|_| Error::KeyGeneration)?;
    Ok(seed)
}

pub(crate) fn random_nonce() -> Result<[u8; NONCE_SIZE], Error> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|_| Error::KeyGeneration)?;
    Ok(nonce)
}

/// HKDF-SHA256 extract-and-expand into a fresh 32-byte key.
pub(crate) fn hkdf_expand(
    salt: Option<&[u8]>,
    ikm: &[u8],
    info: &[&[u8]],
) -> Result<DerivedKey, Error> {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = Zeroizing::new(Box::new([0u8; 32]));
    hkdf.expand_multi_info(info, okm.as_mut_slice())
        .map_err(|_| Error::Crypto("HKDF expansion failed".to_string()))?;
    Ok(okm)
}

pub(crate) fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; MAC_SIZE], Error> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| Error::Crypto("HMAC initialization failed".to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time check of an HMAC-SHA256 tag.
pub(crate) fn hmac_verify(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<(), Error> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| Error::Crypto("HMAC initialization failed".to_string()))?;
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag)
        .map_err(|_| Error::AuthenticationFailure)
}

/// Encrypts with AES-256-GCM-SIV and returns `(ciphertext, tag)`.
pub(crate) fn seal(
    key: &[u8; 32],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_SIZE]), Error> {
    let cipher = Aes256GcmSiv::new(aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(key));
    let mut sealed = cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Crypto("Encryption failed".to_string()))?;

    let split = sealed.len() - TAG_SIZE;
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&sealed[split..]);
    sealed.truncate(split);

    Ok((sealed, tag))
}

/// Reverses [`seal`]. Any tag mismatch is an authentication failure.
pub(crate) fn open(
    key: &[u8; 32],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
    aad: &[u8],
) -> Result<Vec<u8>, Error> {
    let cipher = Aes256GcmSiv::new(aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(key));
    let mut buffer = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
    buffer.extend_from_slice(ciphertext);
    buffer.extend_from_slice(tag);

    let result = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: &buffer,
                aad,
            },
        )
        .map_err(|_| Error::AuthenticationFailure);

    buffer.zeroize();
    result
}
