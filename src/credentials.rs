//! Encryption of package-fetch credentials at rest.
//!
//! Passwords in the configuration and in the registry file are Fernet tokens
//! (`gAAAA...`). The key is the URL-safe base64 of the SHA-256 digest of a
//! setup passphrase. The environment variable may hold either that encoded key
//! or the passphrase itself.

use crate::error::{Error, Result};
use base64::{Engine as _, engine::general_purpose};
use fernet::Fernet;
use sha2::{Digest, Sha256};

/// Prefix shared by every Fernet token (version byte 0x80)
pub const TOKEN_PREFIX: &str = "gAAAA";

/// Encrypts and decrypts credential values.
#[derive(Clone)]
pub struct CredentialCipher {
    key: String,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    /// Derives the key from a passphrase.
    pub fn from_phrase(phrase: &str) -> Self {
        let digest = Sha256::digest(phrase.as_bytes());
        Self {
            key: general_purpose::URL_SAFE.encode(digest),
        }
    }

    /// Uses an already encoded Fernet key.
    ///
    /// Returns `None` unless `key` is URL-safe base64 of 32 bytes.
    pub fn from_key(key: &str) -> Option<Self> {
        let key = key.trim();
        Fernet::new(key).map(|_| Self {
            key: key.to_string(),
        })
    }

    /// Reads the key or passphrase from the named environment variable.
    ///
    /// Returns `None` when the variable is unset or empty.
    pub fn from_env(var: &str) -> Option<Self> {
        let value = std::env::var(var).ok()?;
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        Some(Self::from_key(value).unwrap_or_else(|| Self::from_phrase(value)))
    }

    fn fernet(&self) -> Result<Fernet> {
        Fernet::new(&self.key).ok_or_else(|| Error::Credentials("invalid key".to_string()))
    }

    /// Encrypts a plaintext value into a Fernet token.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(self.fernet()?.encrypt(plaintext.as_bytes()))
    }

    /// Decrypts a Fernet token.
    pub fn decrypt(&self, token: &str) -> Result<String> {
        let token = token.trim();
        if !token.starts_with(TOKEN_PREFIX) {
            return Err(Error::Credentials("stored value is not a Fernet token".to_string()));
        }
        let plaintext = self
            .fernet()?
            .decrypt(token)
            .map_err(|_| Error::Credentials("wrong key or corrupted value".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| Error::Credentials(format!("decrypted value is not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHRASE: &str = "my phrase";
    const ENCODED_KEY: &str = "5_5uM9RWYJsXRKbD5sz2h0yXX1fGOc-U5JlcvWy04BM=";
    // Written by the previous Python manager for "hunter2".
    const LEGACY_TOKEN: &str = "gAAAAABq0qoiIXg8Sj2baEhFofh1ClXbTOyn4CO4Fj1UgOMMEu9_skSzVw_7AovTnlD3ID7VY8nsOMPSYGMRzNfSIkqcB2g91g==";

    #[test]
    fn phrase_derives_the_encoded_key() {
        assert_eq!(CredentialCipher::from_phrase(PHRASE).key, ENCODED_KEY);
    }

    #[test]
    fn decrypts_existing_tokens_from_phrase_or_key() {
        let from_phrase = CredentialCipher::from_phrase(PHRASE);
        assert_eq!(from_phrase.decrypt(LEGACY_TOKEN).unwrap(), "hunter2");

        let from_key = CredentialCipher::from_key(ENCODED_KEY).unwrap();
        assert_eq!(from_key.decrypt(LEGACY_TOKEN).unwrap(), "hunter2");
    }

    #[test]
    fn encrypt_then_decrypt_with_same_phrase() {
        let cipher = CredentialCipher::from_phrase("correct horse");
        let stored = cipher.encrypt("hunter2").unwrap();
        assert!(stored.starts_with(TOKEN_PREFIX));

        let again = CredentialCipher::from_phrase("correct horse");
        assert_eq!(again.decrypt(&stored).unwrap(), "hunter2");
    }

    #[test]
    fn wrong_phrase_is_rejected() {
        let err = CredentialCipher::from_phrase("another phrase")
            .decrypt(LEGACY_TOKEN)
            .unwrap_err();
        assert!(matches!(err, Error::Credentials(_)));
    }

    #[test]
    fn garbage_is_rejected() {
        let cipher = CredentialCipher::from_phrase("a");
        assert!(cipher.decrypt("not a token at all!").is_err());
        assert!(cipher.decrypt("gAAAAAAA").is_err());
        assert!(CredentialCipher::from_key("short").is_none());
    }
}
