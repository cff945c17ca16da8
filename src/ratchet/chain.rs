use crate::Error;
use crate::crypto::{DerivedKey, NONCE_SIZE, TAG_SIZE, hmac_sha256, open, seal};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const MESSAGE_KEY_INFO: &[u8] = b"PeerSeal-Message-Keys";

/// One-way symmetric key chain.
///
/// `index` counts the keys derived so far, so the key returned by the n-th
/// call to [`Chain::next`] belongs to message counter n.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct Chain {
    chain_key: DerivedKey,
    pub(crate) index: u64,
}

impl Chain {
    pub(crate) fn new(chain_key: DerivedKey) -> Self {
        Self {
            chain_key,
            index: 0,
        }
    }

    /// Advances the chain and returns the key for the new index. The previous
    /// chain key is overwritten in place.
    pub(crate) fn next(&mut self) -> Result<MessageKey, Error> {
        let index = self
            .index
            .checked_add(1)
            .ok_or_else(|| Error::Crypto("chain exhausted".to_string()))?;

        let mut next_chain_key = hmac_sha256(self.chain_key.as_slice(), &[&[0x01]])?;
        let mut message_result = hmac_sha256(self.chain_key.as_slice(), &[&[0x02]])?;

        self.chain_key.copy_from_slice(&next_chain_key);
        next_chain_key.zeroize();
        self.index = index;

        let mut message_key = Box::new([0u8; 32]);
        message_key.copy_from_slice(&message_result);
        message_result.zeroize();

        Ok(MessageKey(message_key))
    }
}

/// Single-use key for one message, wiped when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct MessageKey(Box<[u8; 32]>);

impl MessageKey {
    /// Expands the message key into an AEAD key and nonce.
    fn cipher_material(&self) -> Result<Zeroizing<[u8; 32 + NONCE_SIZE]>, Error> {
        let hkdf = Hkdf::<Sha256>::new(None, self.0.as_slice());
        let mut material = Zeroizing::new([0u8; 32 + NONCE_SIZE]);
        hkdf.expand(MESSAGE_KEY_INFO, material.as_mut_slice())
            .map_err(|_| Error::Crypto("HKDF expansion failed".to_string()))?;
        Ok(material)
    }

    fn split(material: &[u8; 32 + NONCE_SIZE]) -> (Zeroizing<[u8; 32]>, [u8; NONCE_SIZE]) {
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&material[..32]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&material[32..]);
        (key, nonce)
    }

    pub(crate) fn seal(
        &self,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, [u8; TAG_SIZE]), Error> {
        let material = self.cipher_material()?;
        let (key, nonce) = Self::split(&material);
        seal(&key, &nonce, plaintext, aad)
    }

    pub(crate) fn open(
        &self,
        ciphertext: &[u8],
        tag: &[u8; TAG_SIZE],
        aad: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let material = self.cipher_material()?;
        let (key, nonce) = Self::split(&material);
        open(&key, &nonce, ciphertext, tag, aad)
    }
}
