use crate::crypto::{NONCE_SIZE, TAG_SIZE, generate_random_seed, open, random_nonce, seal};
use crate::identity::record::IdentityRecord;
use crate::identity::{DeviceIdentity, Fingerprint, IdentityPublicKey};
use crate::wipe::wipe_file;
use crate::Error;
use prost::Message;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const RECORD_VERSION: u32 = 1;
const RECORD_LABEL: &[u8] = b"PeerSeal-Identity-Record";
const IDENTITY_FILE: &str = "identity.key";

/// Key that seals the identity at rest.
///
/// On a device this comes from the platform keystore or a passphrase KDF;
/// the store only needs the 32 bytes.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StorageKey(Box<[u8; 32]>);

impl StorageKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(Box::new(bytes))
    }

    pub fn generate() -> Result<Self, Error> {
        Ok(Self(generate_random_seed()?))
    }
}

/// Process-wide owner of the device identity.
///
/// There is one store per installation. It hands out the loaded identity as a
/// shared read-only handle that any number of concurrent handshakes may use.
pub struct IdentityStore {
    path: PathBuf,
    storage_key: StorageKey,
    current: Option<Arc<DeviceIdentity>>,
}

impl IdentityStore {
    /// Opens a store rooted at `dir`. Nothing is read until [`load_identity`].
    ///
    /// [`load_identity`]: IdentityStore::load_identity
    pub fn new(dir: impl AsRef<Path>, storage_key: StorageKey) -> Self {
        Self {
            path: dir.as_ref().join(IDENTITY_FILE),
            storage_key,
            current: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generates a new long-term key pair, persists it sealed and returns the
    /// public connect identifier.
    pub fn create_identity(&mut self) -> Result<Fingerprint, Error> {
        if self.path.exists() {
            return Err(Error::IdentityExists);
        }

        let identity = DeviceIdentity::generate()?;
        let record = self.seal_record(&identity)?;
        self.persist(&record.encode_to_vec())?;

        let fingerprint = identity.fingerprint();
        tracing::info!(device = %fingerprint.short_id(), "created device identity");

        self.current = Some(Arc::new(identity));
        Ok(fingerprint)
    }

    /// Reads and verifies the persisted identity.
    pub fn load_identity(&mut self) -> Result<Arc<DeviceIdentity>, Error> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => Zeroizing::new(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(Error::NoIdentity),
            Err(err) => return Err(err.into()),
        };

        let record = IdentityRecord::decode(bytes.as_slice())?;
        let identity = Arc::new(self.open_record(&record)?);

        tracing::debug!(device = %identity.fingerprint().short_id(), "loaded device identity");

        self.current = Some(identity.clone());
        Ok(identity)
    }

    /// The identity loaded by the last `create_identity` or `load_identity`.
    pub fn identity(&self) -> Result<Arc<DeviceIdentity>, Error> {
        self.current.clone().ok_or(Error::NoIdentity)
    }

    /// Whether `fingerprint` still names this installation's identity.
    pub fn is_current(&self, fingerprint: &Fingerprint) -> bool {
        self.current
            .as_ref()
            .is_some_and(|identity| identity.fingerprint() == *fingerprint)
    }

    /// Wipes the stored private key and forgets the loaded identity.
    ///
    /// Handles already given out keep working until dropped, but no
    /// fingerprint derived from the old key is current afterwards. Calling this
    /// when no identity exists is not an error.
    pub fn reset_identity(&mut self) -> Result<(), Error> {
        wipe_file(&self.path)?;
        wipe_file(&self.tmp_path())?;
        if let Some(identity) = self.current.take() {
            tracing::info!(device = %identity.fingerprint().short_id(), "reset device identity");
        }
        Ok(())
    }

    fn associated_data(public_key: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(RECORD_LABEL.len() + 4 + public_key.len());
        aad.extend_from_slice(RECORD_LABEL);
        aad.extend_from_slice(&RECORD_VERSION.to_be_bytes());
        aad.extend_from_slice(public_key);
        aad
    }

    fn seal_record(&self, identity: &DeviceIdentity) -> Result<IdentityRecord, Error> {
        let public_key = identity.public_key().to_bytes();
        let nonce = random_nonce()?;
        let secret = identity.secret_bytes();

        let (mut sealed_secret, tag) = seal(
            &self.storage_key.0,
            &nonce,
            secret.as_slice(),
            &Self::associated_data(&public_key),
        )?;
        sealed_secret.extend_from_slice(&tag);

        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Ok(IdentityRecord {
            version: RECORD_VERSION,
            public_key: public_key.to_vec(),
            nonce: nonce.to_vec(),
            sealed_secret,
            created_at,
        })
    }

    fn open_record(&self, record: &IdentityRecord) -> Result<DeviceIdentity, Error> {
        if record.version != RECORD_VERSION {
            return Err(Error::CorruptIdentity(format!(
                "unsupported record version {}",
                record.version
            )));
        }

        let public_key: [u8; 64] = record
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| Error::CorruptIdentity("bad public key length".to_string()))?;
        let nonce: [u8; NONCE_SIZE] = record
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| Error::CorruptIdentity("bad nonce length".to_string()))?;
        if record.sealed_secret.len() < TAG_SIZE {
            return Err(Error::CorruptIdentity("sealed secret truncated".to_string()));
        }

        let split = record.sealed_secret.len() - TAG_SIZE;
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&record.sealed_secret[split..]);

        let secret = Zeroizing::new(
            open(
                &self.storage_key.0,
                &nonce,
                &record.sealed_secret[..split],
                &tag,
                &Self::associated_data(&public_key),
            )
            .map_err(|_| Error::CorruptIdentity("integrity check failed".to_string()))?,
        );

        let secret: &[u8; 64] = secret
            .as_slice()
            .try_into()
            .map_err(|_| Error::CorruptIdentity("bad secret length".to_string()))?;
        let identity = DeviceIdentity::from_secret_bytes(secret);

        let stored_public = IdentityPublicKey::from_bytes(&public_key)
            .map_err(|err| Error::CorruptIdentity(err.to_string()))?;
        if identity.public_key() != stored_public {
            return Err(Error::CorruptIdentity(
                "public key does not match private key".to_string(),
            ));
        }

        Ok(identity)
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }

    /// Writes through a temporary file so a crash never leaves a torn record.
    /// A temporary file left behind by a failed write is wiped.
    fn persist(&self, bytes: &[u8]) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.tmp_path();
        let result = self.write_and_rename(&tmp_path, bytes);
        if result.is_err() {
            if let Err(err) = wipe_file(&tmp_path) {
                tracing::warn!(%err, "could not wipe temporary identity file");
            }
        }
        result
    }

    fn write_and_rename(&self, tmp_path: &Path, bytes: &[u8]) -> Result<(), Error> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(tmp_path, &self.path)?;
        Ok(())
    }
}
