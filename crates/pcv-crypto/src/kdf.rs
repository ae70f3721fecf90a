//! Key derivation: Argon2id password → 32-byte master key

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::{KEY_SIZE, SALT_SIZE};

/// A 256-bit master key derived from the password via Argon2id.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Byte-wise XOR with a keyfile key, producing the effective volume key.
    pub fn xor(&self, other: &[u8; KEY_SIZE]) -> MasterKey {
        let mut bytes = self.bytes;
        for (b, o) in bytes.iter_mut().zip(other) {
            *b ^= o;
        }
        MasterKey { bytes }
    }

    /// SHA3-512 of the key, stored in the header to detect a wrong password
    /// before any data is processed. Always taken over the pre-keyfile key.
    pub fn verifier(&self) -> [u8; 64] {
        use sha3::{Digest, Sha3_512};
        let digest = Sha3_512::digest(self.bytes);
        let mut out = [0u8; 64];
        out.copy_from_slice(&digest);
        out
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id parameter profile, selected by the volume's paranoid flag.
///
/// Both profiles use 1 GiB of memory; paranoid doubles passes and lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfProfile {
    Normal,
    Paranoid,
}

impl KdfProfile {
    /// Memory cost in KiB (1 GiB), shared by both profiles.
    const MEM_COST_KIB: u32 = 1 << 20;

    fn time_cost(self) -> u32 {
        match self {
            KdfProfile::Normal => 4,
            KdfProfile::Paranoid => 8,
        }
    }

    fn parallelism(self) -> u32 {
        match self {
            KdfProfile::Normal => 4,
            KdfProfile::Paranoid => 8,
        }
    }
}

/// Derive the master key from a password and the header's 16-byte salt.
///
/// The password may be empty when keyfiles alone carry the entropy; the
/// format does not forbid it.
pub fn derive_master_key(
    password: &SecretString,
    salt: &[u8; SALT_SIZE],
    profile: KdfProfile,
) -> anyhow::Result<MasterKey> {
    let params = Params::new(
        KdfProfile::MEM_COST_KIB,
        profile.time_cost(),
        profile.parallelism(),
        Some(KEY_SIZE),
    )
    .map_err(|e| anyhow::anyhow!("invalid Argon2id params: {e}"))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| anyhow::anyhow!("Argon2id KDF failed: {e}"))?;

    Ok(MasterKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_deterministic() {
        let password = SecretString::from("test-password-123");
        let salt = [1u8; SALT_SIZE];

        let key1 = derive_master_key(&password, &salt, KdfProfile::Normal).unwrap();
        let key2 = derive_master_key(&password, &salt, KdfProfile::Normal).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes(), "KDF must be deterministic");
    }

    #[test]
    fn test_profiles_differ() {
        let password = SecretString::from("same-password");
        let salt = [2u8; SALT_SIZE];

        let normal = derive_master_key(&password, &salt, KdfProfile::Normal).unwrap();
        let paranoid = derive_master_key(&password, &salt, KdfProfile::Paranoid).unwrap();

        assert_ne!(
            normal.as_bytes(),
            paranoid.as_bytes(),
            "profiles must produce different keys"
        );
    }

    #[test]
    fn test_xor_is_involutive() {
        let key = MasterKey::from_bytes([0xAB; KEY_SIZE]);
        let other = [0x5C; KEY_SIZE];
        let combined = key.xor(&other);
        assert_ne!(combined.as_bytes(), key.as_bytes());
        assert_eq!(combined.xor(&other).as_bytes(), key.as_bytes());
    }
}
