use crate::crypto::{MAC_SIZE, TAG_SIZE};
use crate::wire::{KIND_MESSAGE, PROTOCOL_VERSION, Reader};
use crate::{Error, X25519PublicKey};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const POLICY_NONE: u8 = 0;
const POLICY_EXPIRES_AT: u8 = 1;
const POLICY_WIPE_ON_READ: u8 = 2;

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// How long a delivered message may live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExpiryPolicy {
    /// Wiped once the wall clock passes this instant (milliseconds since the
    /// Unix epoch).
    ExpiresAt { unix_millis: u64 },
    /// Wiped right after its first successful read.
    WipeOnRead,
}

impl ExpiryPolicy {
    /// Expires `ttl` from now.
    pub fn expires_after(ttl: Duration) -> Self {
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Self::ExpiresAt {
            unix_millis: now_millis().saturating_add(ttl),
        }
    }

    pub fn expires_at(&self) -> Option<u64> {
        match self {
            Self::ExpiresAt { unix_millis } => Some(*unix_millis),
            Self::WipeOnRead => None,
        }
    }

    pub fn is_expired_at(&self, now_millis: u64) -> bool {
        self.expires_at()
            .is_some_and(|unix_millis| now_millis >= unix_millis)
    }
}

/// One encrypted message as it travels between devices.
///
/// The header (version, counter, ephemeral slot and expiry policy) is bound
/// into the AEAD as associated data and covered again by the header MAC, so
/// none of it can be changed in transit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub(crate) version: u8,
    pub(crate) ephemeral: Option<X25519PublicKey>,
    pub(crate) counter: u64,
    pub(crate) policy: Option<ExpiryPolicy>,
    pub(crate) ciphertext: Vec<u8>,
    pub(crate) tag: [u8; TAG_SIZE],
    pub(crate) header_mac: [u8; MAC_SIZE],
}

impl MessageEnvelope {
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn ephemeral(&self) -> Option<&X25519PublicKey> {
        self.ephemeral.as_ref()
    }

    pub fn policy(&self) -> Option<ExpiryPolicy> {
        self.policy
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn tag(&self) -> &[u8; TAG_SIZE] {
        &self.tag
    }

    /// Everything before the ciphertext length.
    pub(crate) fn header_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + 8 + 33 + 9);
        bytes.push(self.version);
        bytes.push(KIND_MESSAGE);
        bytes.extend_from_slice(&self.counter.to_be_bytes());

        match &self.ephemeral {
            Some(public_key) => {
                bytes.push(1);
                bytes.extend_from_slice(public_key.as_bytes());
            }
            None => bytes.push(0),
        }

        match self.policy {
            None => bytes.push(POLICY_NONE),
            Some(ExpiryPolicy::ExpiresAt { unix_millis }) => {
                bytes.push(POLICY_EXPIRES_AT);
                bytes.extend_from_slice(&unix_millis.to_be_bytes());
            }
            Some(ExpiryPolicy::WipeOnRead) => bytes.push(POLICY_WIPE_ON_READ),
        }

        bytes
    }

    /// Serializes the envelope for transmission.
    ///
    /// Format: [header][ciphertext length (4 bytes)][ciphertext][tag][header MAC]
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = self.header_bytes();
        let mut bytes =
            Vec::with_capacity(header.len() + 4 + self.ciphertext.len() + TAG_SIZE + MAC_SIZE);
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        bytes.extend_from_slice(&self.tag);
        bytes.extend_from_slice(&self.header_mac);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);

        let version = reader.u8()?;
        if version != PROTOCOL_VERSION {
            return Err(Error::Malformed(format!(
                "unsupported protocol version {version}"
            )));
        }
        if reader.u8()? != KIND_MESSAGE {
            return Err(Error::Malformed("not a message frame".to_string()));
        }

        let counter = reader.u64()?;

        let ephemeral = match reader.u8()? {
            0 => None,
            1 => Some(X25519PublicKey::from(reader.array::<32>()?)),
            flag => {
                return Err(Error::Malformed(format!("bad ephemeral flag {flag}")));
            }
        };

        let policy = match reader.u8()? {
            POLICY_NONE => None,
            POLICY_EXPIRES_AT => Some(ExpiryPolicy::ExpiresAt {
                unix_millis: reader.u64()?,
            }),
            POLICY_WIPE_ON_READ => Some(ExpiryPolicy::WipeOnRead),
            tag => return Err(Error::Malformed(format!("bad expiry policy {tag}"))),
        };

        let len = reader.u32()? as usize;
        let ciphertext = reader.take(len)?.to_vec();
        let tag = reader.array::<TAG_SIZE>()?;
        let header_mac = reader.array::<MAC_SIZE>()?;
        reader.finish()?;

        Ok(Self {
            version,
            ephemeral,
            counter,
            policy,
            ciphertext,
            tag,
            header_mac,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(policy: Option<ExpiryPolicy>) -> MessageEnvelope {
        MessageEnvelope {
            version: PROTOCOL_VERSION,
            ephemeral: None,
            counter: 7,
            policy,
            ciphertext: vec![0xAB; 10],
            tag: [1u8; TAG_SIZE],
            header_mac: [2u8; MAC_SIZE],
        }
    }

    #[test]
    fn test_envelope_bytes() {
        for policy in [
            None,
            Some(ExpiryPolicy::WipeOnRead),
            Some(ExpiryPolicy::ExpiresAt {
                unix_millis: 1_700_000_000_000,
            }),
        ] {
            let envelope = envelope(policy);
            let bytes = envelope.to_bytes();
            assert_eq!(MessageEnvelope::from_bytes(&bytes).unwrap(), envelope);
        }
    }

    #[test]
    fn test_counter_is_big_endian_after_kind() {
        let bytes = envelope(None).to_bytes();
        assert_eq!(&bytes[0..2], &[PROTOCOL_VERSION, KIND_MESSAGE]);
        assert_eq!(&bytes[2..10], &7u64.to_be_bytes());
    }

    #[test]
    fn test_rejects_garbage() {
        let bytes = envelope(None).to_bytes();

        assert!(MessageEnvelope::from_bytes(&bytes[..bytes.len() - 1]).is_err());

        let mut bad_flag = bytes.clone();
        bad_flag[10] = 9;
        assert!(matches!(
            MessageEnvelope::from_bytes(&bad_flag),
            Err(Error::Malformed(_))
        ));

        let mut bad_policy = bytes.clone();
        bad_policy[11] = 9;
        assert!(MessageEnvelope::from_bytes(&bad_policy).is_err());

        let mut huge_len = bytes;
        huge_len[12..16].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(MessageEnvelope::from_bytes(&huge_len).is_err());
    }

    #[test]
    fn test_expiry_policy() {
        let policy = ExpiryPolicy::ExpiresAt { unix_millis: 1_000 };
        assert!(!policy.is_expired_at(999));
        assert!(policy.is_expired_at(1_000));
        assert!(!ExpiryPolicy::WipeOnRead.is_expired_at(u64::MAX));

        let later = ExpiryPolicy::expires_after(Duration::from_secs(60));
        assert!(!later.is_expired_at(now_millis()));
    }
}
