use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

const NONCE_LEN: usize = 12;

// Calculate SHA256 hash of a file
pub fn calculate_sha256<P: AsRef<Path>>(path: P) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

// Catalog key is the SHA256 of the shared passphrase
fn derive_key(passphrase: &str) -> Key<Aes256Gcm> {
    let digest = Sha256::digest(passphrase.as_bytes());
    Key::<Aes256Gcm>::clone_from_slice(&digest)
}

/// Decrypts a `nonce || ciphertext` catalog payload.
pub fn open_catalog(payload: &[u8], passphrase: &str) -> Result<Vec<u8>, CryptoError> {
    if payload.len() <= NONCE_LEN {
        return Err(CryptoError::Truncated);
    }
    let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(&derive_key(passphrase));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

/// Encrypts a plaintext catalog into the format [`open_catalog`] reads.
pub fn seal_catalog(plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(&derive_key(passphrase));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_sha256_of_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"test content").unwrap();

        let hash = calculate_sha256(temp_file.path()).unwrap();
        assert_eq!(
            hash,
            "6ae8a75555209fd6c44157c0aed8016e763ff435a19cf186f76863140143ff72"
        );
    }

    #[test]
    fn test_open_sealed_catalog() {
        let payload = seal_catalog(br#"{"packages":[]}"#, "secret").unwrap();
        assert_eq!(open_catalog(&payload, "secret").unwrap(), br#"{"packages":[]}"#);
    }

    #[test]
    fn test_wrong_passphrase_is_rejected() {
        let payload = seal_catalog(b"rows", "secret").unwrap();
        assert!(matches!(
            open_catalog(&payload, "guess"),
            Err(CryptoError::Decrypt)
        ));
        assert!(matches!(
            open_catalog(&payload[..8], "secret"),
            Err(CryptoError::Truncated)
        ));
    }
}
