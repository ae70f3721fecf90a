//! Keyfile digestion: ordered concatenation or order-free XOR combination
//!
//! Ordered mode hashes the concatenation of all keyfiles, so the same files
//! in a different order produce a different key. Unordered mode hashes each
//! file individually and XORs the digests, making the order irrelevant.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha3::{Digest, Sha3_256};
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// The combined keyfile key and its public verifier.
///
/// The verifier (`SHA3-256(key)`) is stored in the volume header; the key
/// itself is XORed into the master key and never written anywhere.
pub struct KeyfileDigest {
    pub key: [u8; KEY_SIZE],
    pub verifier: [u8; KEY_SIZE],
}

impl Drop for KeyfileDigest {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for KeyfileDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyfileDigest")
            .field("key", &"[REDACTED]")
            .field("verifier", &self.verifier)
            .finish()
    }
}

/// Digest a list of keyfiles into a 32-byte key plus verifier.
pub fn digest_keyfiles<P: AsRef<Path>>(paths: &[P], ordered: bool) -> anyhow::Result<KeyfileDigest> {
    anyhow::ensure!(!paths.is_empty(), "no keyfiles given");

    let key: [u8; KEY_SIZE] = if ordered {
        let mut hasher = Sha3_256::new();
        for path in paths {
            hash_file_into(path.as_ref(), &mut hasher)?;
        }
        hasher.finalize().into()
    } else {
        let mut combined = [0u8; KEY_SIZE];
        for path in paths {
            let mut hasher = Sha3_256::new();
            hash_file_into(path.as_ref(), &mut hasher)?;
            let sum: [u8; KEY_SIZE] = hasher.finalize().into();
            for (c, s) in combined.iter_mut().zip(&sum) {
                *c ^= s;
            }
        }
        combined
    };

    let verifier: [u8; KEY_SIZE] = Sha3_256::digest(key).into();
    Ok(KeyfileDigest { key, verifier })
}

fn hash_file_into(path: &Path, hasher: &mut Sha3_256) -> anyhow::Result<()> {
    let mut file = File::open(path)
        .map_err(|e| anyhow::anyhow!("opening keyfile {}: {e}", path.display()))?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| anyhow::anyhow!("reading keyfile {}: {e}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_keyfiles(dir: &TempDir, contents: &[&[u8]]) -> Vec<PathBuf> {
        contents
            .iter()
            .enumerate()
            .map(|(i, data)| {
                let path = dir.path().join(format!("key{i}"));
                std::fs::write(&path, data).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_ordered_is_order_sensitive() {
        let dir = TempDir::new().unwrap();
        let paths = write_keyfiles(&dir, &[b"alpha", b"beta"]);
        let reversed: Vec<_> = paths.iter().rev().collect();

        let forward = digest_keyfiles(&paths, true).unwrap();
        let backward = digest_keyfiles(&reversed, true).unwrap();

        assert_ne!(forward.key, backward.key);
    }

    #[test]
    fn test_unordered_is_permutation_invariant() {
        let dir = TempDir::new().unwrap();
        let paths = write_keyfiles(&dir, &[b"alpha", b"beta", b"gamma"]);
        let shuffled = [&paths[2], &paths[0], &paths[1]];

        let a = digest_keyfiles(&paths, false).unwrap();
        let b = digest_keyfiles(&shuffled, false).unwrap();

        assert_eq!(a.key, b.key);
        assert_eq!(a.verifier, b.verifier);
    }

    #[test]
    fn test_verifier_matches_key() {
        let dir = TempDir::new().unwrap();
        let paths = write_keyfiles(&dir, &[b"some key material"]);
        let digest = digest_keyfiles(&paths, false).unwrap();

        let expected: [u8; KEY_SIZE] = Sha3_256::digest(digest.key).into();
        assert_eq!(digest.verifier, expected);
    }

    #[test]
    fn test_single_keyfile_same_in_both_modes_differs() {
        // With a single file both modes reduce to SHA3-256 of its content.
        let dir = TempDir::new().unwrap();
        let paths = write_keyfiles(&dir, &[b"only one"]);

        let ordered = digest_keyfiles(&paths, true).unwrap();
        let unordered = digest_keyfiles(&paths, false).unwrap();
        assert_eq!(ordered.key, unordered.key);
    }

    #[test]
    fn test_missing_keyfile_is_error() {
        let missing = [PathBuf::from("/nonexistent/keyfile")];
        assert!(digest_keyfiles(&missing, true).is_err());
    }
}
