//! Secure erasure of key material and message buffers.
//!
//! In-memory buffers are overwritten with zeros before they are released.
//! Files are overwritten, flushed to the device and truncated before they are
//! unlinked. On storage with wear-leveling or copy-on-write semantics the old
//! blocks may survive the overwrite; that limitation is inherent to the medium.

use crate::Error;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::Path;
use zeroize::{Zeroize, Zeroizing};

/// A heap buffer holding plaintext or key bytes. Zeroed when dropped.
pub type SecretBuffer = Zeroizing<Vec<u8>>;

const OVERWRITE_CHUNK: usize = 4096;

/// Overwrites a sensitive buffer with zeros.
pub fn wipe<Z: Zeroize + ?Sized>(buffer: &mut Z) {
    buffer.zeroize();
}

/// Overwrites a file with zeros, syncs it, then deletes it.
///
/// Succeeds without doing anything if the file does not exist, so repeated
/// calls are harmless.
pub fn wipe_file(path: &Path) -> Result<(), Error> {
    let mut file = match OpenOptions::new().write(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    let len = file.metadata()?.len();
    let zeros = [0u8; OVERWRITE_CHUNK];
    let mut remaining = len;

    file.seek(SeekFrom::Start(0))?;
    while remaining > 0 {
        let step = remaining.min(OVERWRITE_CHUNK as u64) as usize;
        file.write_all(&zeros[..step])?;
        remaining -= step as u64;
    }
    file.sync_all()?;
    file.set_len(0)?;
    file.sync_all()?;
    drop(file);

    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wipe_zeroes_buffer() {
        let mut key = [0xAAu8; 32];
        wipe(&mut key);
        assert_eq!(key, [0u8; 32]);

        let mut message = b"self-destructing".to_vec();
        wipe(&mut message);
        assert!(message.is_empty());
    }

    #[test]
    fn test_wipe_file_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.bin");
        std::fs::write(&path, vec![0x42u8; 10_000]).unwrap();

        wipe_file(&path).unwrap();
        assert!(!path.exists());

        // A second wipe of the same path is a no-op.
        wipe_file(&path).unwrap();
    }
}
