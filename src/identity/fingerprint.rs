use crate::Error;
use crate::identity::IdentityPublicKey;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

const FINGERPRINT_LABEL: &[u8] = b"PeerSeal-Fingerprint-v1";

/// Length of the rendered connect ID.
pub const CONNECT_ID_LEN: usize = 43;

/// Length of the abbreviated ID shown next to a device name.
const SHORT_ID_LEN: usize = 16;

/// A SHA-256 digest of a device's long-term public key.
///
/// Equal keys always hash to the same fingerprint, and the fingerprint is what
/// two users compare (or type in) when pairing devices.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(public_key: &IdentityPublicKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_LABEL);
        hasher.update(public_key.to_bytes());
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The pairing identifier shared out of band: URL-safe base64 without
    /// padding, always [`CONNECT_ID_LEN`] characters.
    pub fn connect_id(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// The leading characters of the connect ID, for compact display.
    pub fn short_id(&self) -> String {
        let mut id = self.connect_id();
        id.truncate(SHORT_ID_LEN);
        id
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(connect_id: &str) -> Result<Self, Self::Err> {
        let connect_id = connect_id.trim();
        if connect_id.len() != CONNECT_ID_LEN {
            return Err(Error::Malformed(format!(
                "connect ID must be {} characters, got {}",
                CONNECT_ID_LEN,
                connect_id.len()
            )));
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(connect_id)
            .map_err(|err| Error::Malformed(err.to_string()))?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Malformed("connect ID has the wrong length".to_string()))?;

        Ok(Self(digest))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.connect_id())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceIdentity;

    #[test]
    fn test_equal_keys_equal_fingerprints() {
        let identity = DeviceIdentity::generate().unwrap();
        let public = identity.public_key();
        let restored = IdentityPublicKey::from_bytes(&public.to_bytes()).unwrap();

        assert_eq!(Fingerprint::of(&public), Fingerprint::of(&restored));
    }

    #[test]
    fn test_distinct_keys_distinct_fingerprints() {
        let a = DeviceIdentity::generate().unwrap();
        let b = DeviceIdentity::generate().unwrap();

        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_connect_id_parses_back() {
        let fingerprint = DeviceIdentity::generate().unwrap().fingerprint();
        let connect_id = fingerprint.connect_id();

        assert_eq!(connect_id.len(), CONNECT_ID_LEN);
        assert_eq!(connect_id.parse::<Fingerprint>().unwrap(), fingerprint);
        assert_eq!(
            format!("  {connect_id}\n").parse::<Fingerprint>().unwrap(),
            fingerprint
        );
        assert!(fingerprint.connect_id().starts_with(&fingerprint.short_id()));
    }

    #[test]
    fn test_connect_id_rejects_bad_input() {
        assert!("too-short".parse::<Fingerprint>().is_err());
        assert!("!".repeat(CONNECT_ID_LEN).parse::<Fingerprint>().is_err());
    }
}
