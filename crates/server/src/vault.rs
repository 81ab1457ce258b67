use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("vault unavailable: {0}")]
    Unavailable(String),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("invalid key length")]
    InvalidKeyLength,
}

/// Encrypts host secrets at rest with AES-256-GCM.
///
/// Stored values are `base64(nonce || ciphertext || tag)` with a 12-byte
/// nonce and no associated data. The empty string is stored as-is.
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    pub fn new(key: &[u8]) -> Result<Self, VaultError> {
        Ok(Self {
            cipher: Aes256Gcm::new_from_slice(key).map_err(|_| VaultError::InvalidKeyLength)?,
        })
    }

    /// Loads the key at `path`, creating it (mode 0600) on first boot.
    ///
    /// A key file of the wrong length is treated as missing and replaced.
    /// A key file that exists but cannot be read, or a missing key that
    /// cannot be written, is fatal.
    pub fn load_or_create(path: &Path) -> Result<Self, VaultError> {
        match fs::read(path) {
            Ok(bytes) if bytes.len() == KEY_LEN => {
                info!(path = %path.display(), "Loaded vault key.");
                Self::new(&bytes)
            }
            Ok(bytes) => {
                warn!(
                    path = %path.display(),
                    len = bytes.len(),
                    "Vault key has the wrong length; generating a fresh key. Existing secrets will no longer decrypt."
                );
                Self::generate(path)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "No vault key found; generating one.");
                Self::generate(path)
            }
            Err(e) => Err(VaultError::Unavailable(format!(
                "cannot read key file {}: {e}",
                path.display()
            ))),
        }
    }

    fn generate(path: &Path) -> Result<Self, VaultError> {
        let mut key = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        write_key_file(path, &key).map_err(|e| {
            VaultError::Unavailable(format!("cannot write key file {}: {e}", path.display()))
        })?;
        Self::new(&key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Returns the plaintext, or `stored` unchanged when it is not a value
    /// this vault produced.
    pub fn decrypt(&self, stored: &str) -> String {
        self.try_decrypt(stored).unwrap_or_else(|| stored.to_string())
    }

    pub fn is_encrypted(&self, stored: &str) -> bool {
        self.try_decrypt(stored).is_some()
    }

    fn try_decrypt(&self, stored: &str) -> Option<String> {
        let blob = BASE64.decode(stored.trim()).ok()?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return None;
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .ok()?;
        String::from_utf8(plaintext).ok()
    }
}

fn write_key_file(path: &Path, key: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(key)?;
    file.sync_all()?;

    #[cfg(unix)]
    {
        // `mode` only applies on create; tighten a pre-existing file too.
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Default key location under the data directory.
pub fn default_key_path(data_dir: &str) -> PathBuf {
    Path::new(data_dir).join("vault.key")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        Vault::new(&[7u8; KEY_LEN]).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let vault = vault();
        let stored = vault.encrypt("hunter2").unwrap();
        assert_ne!(stored, "hunter2");
        assert!(vault.is_encrypted(&stored));
        assert_eq!(vault.decrypt(&stored), "hunter2");
    }

    #[test]
    fn test_nonce_is_fresh_per_encryption() {
        let vault = vault();
        assert_ne!(vault.encrypt("same").unwrap(), vault.encrypt("same").unwrap());
    }

    #[test]
    fn test_empty_secret_stays_empty() {
        let vault = vault();
        assert_eq!(vault.encrypt("").unwrap(), "");
        assert_eq!(vault.decrypt(""), "");
        assert!(!vault.is_encrypted(""));
    }

    #[test]
    fn test_non_cipher_input_is_returned_unchanged() {
        let vault = vault();
        assert_eq!(vault.decrypt("plain password"), "plain password");
        // Valid base64 that does not authenticate.
        let bogus = BASE64.encode([1u8; 40]);
        assert_eq!(vault.decrypt(&bogus), bogus);
        assert!(!vault.is_encrypted(&bogus));
    }

    #[test]
    fn test_other_key_does_not_authenticate() {
        let stored = vault().encrypt("secret").unwrap();
        let other = Vault::new(&[9u8; KEY_LEN]).unwrap();
        assert!(!other.is_encrypted(&stored));
        assert_eq!(other.decrypt(&stored), stored);
    }

    #[test]
    fn test_key_file_created_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("vault.key");

        let first = Vault::load_or_create(&path).unwrap();
        let stored = first.encrypt("pw").unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), KEY_LEN);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let second = Vault::load_or_create(&path).unwrap();
        assert_eq!(second.decrypt(&stored), "pw");
    }

    #[test]
    fn test_corrupt_key_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.key");
        fs::write(&path, b"short").unwrap();

        let vault = Vault::load_or_create(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), KEY_LEN);
        let stored = vault.encrypt("x").unwrap();
        assert_eq!(vault.decrypt(&stored), "x");
    }

    #[test]
    fn test_unwritable_location_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"not a dir").unwrap();
        let result = Vault::load_or_create(&blocker.join("vault.key"));
        assert!(matches!(result, Err(VaultError::Unavailable(_))));
    }
}
