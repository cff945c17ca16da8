//! Frame layout shared by the handshake and the message path.
//!
//! Every frame starts with `[version][kind]`. Handshake frames and message
//! frames use distinct kinds so one can never be mistaken for the other.

use crate::identity::IdentityPublicKey;
use crate::ratchet::MessageEnvelope;
use crate::{Error, X25519PublicKey};
use ed25519_dalek::Signature;

pub const PROTOCOL_VERSION: u8 = 1;

pub(crate) const KIND_HELLO: u8 = 0x01;
pub(crate) const KIND_FINISH: u8 = 0x02;
pub(crate) const KIND_MESSAGE: u8 = 0x10;

/// First handshake frame: who we are and the ephemeral key for this run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeHello {
    pub identity: IdentityPublicKey,
    pub ephemeral: X25519PublicKey,
}

/// Second handshake frame: proof of possession of the long-term key and
/// confirmation that both sides hold the same root secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeFinish {
    pub signature: Signature,
    pub confirmation: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Hello(HandshakeHello),
    Finish(HandshakeFinish),
    Message(MessageEnvelope),
}

impl Frame {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Frame::Hello(hello) => {
                let mut bytes = Vec::with_capacity(2 + 96);
                bytes.extend_from_slice(&[PROTOCOL_VERSION, KIND_HELLO]);
                bytes.extend_from_slice(&hello.identity.to_bytes());
                bytes.extend_from_slice(hello.ephemeral.as_bytes());
                bytes
            }
            Frame::Finish(finish) => {
                let mut bytes = Vec::with_capacity(2 + 96);
                bytes.extend_from_slice(&[PROTOCOL_VERSION, KIND_FINISH]);
                bytes.extend_from_slice(&finish.signature.to_bytes());
                bytes.extend_from_slice(&finish.confirmation);
                bytes
            }
            Frame::Message(envelope) => envelope.to_bytes(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);
        let version = reader.u8()?;
        if version != PROTOCOL_VERSION {
            return Err(Error::Malformed(format!(
                "unsupported protocol version {version}"
            )));
        }

        match reader.u8()? {
            KIND_HELLO => {
                let identity = IdentityPublicKey::from_bytes(&reader.array::<64>()?)?;
                let ephemeral = X25519PublicKey::from(reader.array::<32>()?);
                reader.finish()?;
                Ok(Frame::Hello(HandshakeHello {
                    identity,
                    ephemeral,
                }))
            }
            KIND_FINISH => {
                let signature = Signature::from_bytes(&reader.array::<64>()?);
                let confirmation = reader.array::<32>()?;
                reader.finish()?;
                Ok(Frame::Finish(HandshakeFinish {
                    signature,
                    confirmation,
                }))
            }
            KIND_MESSAGE => Ok(Frame::Message(MessageEnvelope::from_bytes(bytes)?)),
            kind => Err(Error::Malformed(format!("unknown frame kind {kind:#04x}"))),
        }
    }
}

/// Cursor over an untrusted byte slice. Every read is bounds-checked.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| Error::Malformed("frame truncated".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub(crate) fn finish(&self) -> Result<(), Error> {
        if self.pos != self.bytes.len() {
            return Err(Error::Malformed(format!(
                "{} trailing bytes",
                self.bytes.len() - self.pos
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceIdentity;
    use crate::types::X25519Secret;

    fn hello() -> HandshakeHello {
        HandshakeHello {
            identity: DeviceIdentity::generate().unwrap().public_key(),
            ephemeral: X25519Secret::generate().unwrap().public_key(),
        }
    }

    #[test]
    fn test_hello_frame_layout() {
        let hello = hello();
        let bytes = Frame::Hello(hello.clone()).to_bytes();

        assert_eq!(bytes.len(), 2 + 64 + 32);
        assert_eq!(&bytes[0..2], &[PROTOCOL_VERSION, KIND_HELLO]);
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), Frame::Hello(hello));
    }

    #[test]
    fn test_finish_frame_decodes() {
        let finish = HandshakeFinish {
            signature: Signature::from_bytes(&[3u8; 64]),
            confirmation: [4u8; 32],
        };
        let bytes = Frame::Finish(finish.clone()).to_bytes();

        assert_eq!(Frame::from_bytes(&bytes).unwrap(), Frame::Finish(finish));
    }

    #[test]
    fn test_rejects_bad_headers() {
        let mut bytes = Frame::Hello(hello()).to_bytes();

        bytes[0] = PROTOCOL_VERSION + 1;
        assert!(matches!(Frame::from_bytes(&bytes), Err(Error::Malformed(_))));

        bytes[0] = PROTOCOL_VERSION;
        bytes[1] = 0x7f;
        assert!(matches!(Frame::from_bytes(&bytes), Err(Error::Malformed(_))));

        assert!(Frame::from_bytes(&[]).is_err());
        assert!(Frame::from_bytes(&[PROTOCOL_VERSION]).is_err());
    }

    #[test]
    fn test_rejects_truncated_and_padded_frames() {
        let bytes = Frame::Hello(hello()).to_bytes();

        assert!(Frame::from_bytes(&bytes[..bytes.len() - 1]).is_err());

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(Frame::from_bytes(&padded).is_err());
    }
}
