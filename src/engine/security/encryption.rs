//! Field Encryption
//!
//! AES-256-GCM over individual record fields. Ciphertext is stored as
//! `encrypted:` followed by base64(nonce || ciphertext || tag), so encrypted
//! values are recognizable and carry their own nonce.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;
use tracing::warn;

use crate::engine::canonical::Record;
use crate::engine::error::{EngineError, Result};

pub const KEY_ENV_VAR: &str = "POLYDB_ENCRYPTION_KEY";
pub const CIPHERTEXT_PREFIX: &str = "encrypted:";
pub const KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 12;

pub struct FieldEncryption {
    cipher: Aes256Gcm,
}

impl FieldEncryption {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LENGTH {
            return Err(EngineError::Encryption(format!(
                "key must be {} bytes, got {}",
                KEY_LENGTH,
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| EngineError::Encryption(format!("invalid key: {}", e)))?;
        Ok(Self { cipher })
    }

    /// Key from a base64 string
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| EngineError::Encryption(format!("key is not valid base64: {}", e)))?;
        Self::new(&key)
    }

    /// Key from `POLYDB_ENCRYPTION_KEY`. `None` when the variable is unset.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(KEY_ENV_VAR) {
            Ok(encoded) => Self::from_base64(&encoded).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Fresh random key, base64 encoded
    pub fn generate_key() -> Result<String> {
        let mut key = [0u8; KEY_LENGTH];
        getrandom::fill(&mut key).map_err(|e| EngineError::Encryption(format!("rng failure: {}", e)))?;
        Ok(STANDARD.encode(key))
    }

    pub fn is_encrypted(value: &Value) -> bool {
        value.as_str().map(|s| s.starts_with(CIPHERTEXT_PREFIX)).unwrap_or(false)
    }

    /// Encrypt one value. The plaintext is the value's JSON text, so its type
    /// survives the round trip.
    pub fn encrypt_value(&self, value: &Value) -> Result<Value> {
        let plaintext = serde_json::to_string(value)?;

        let mut nonce = [0u8; NONCE_LENGTH];
        getrandom::fill(&mut nonce).map_err(|e| EngineError::Encryption(format!("rng failure: {}", e)))?;

        let sealed = self
            .cipher
            .encrypt(&nonce.into(), plaintext.as_bytes())
            .map_err(|_| EngineError::Encryption("encryption failed".into()))?;

        let mut combined = Vec::with_capacity(NONCE_LENGTH + sealed.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&sealed);
        Ok(Value::String(format!("{}{}", CIPHERTEXT_PREFIX, STANDARD.encode(combined))))
    }

    /// Decrypt one value. Plaintext passes through; a value that fails to
    /// decrypt (wrong key, corruption) is returned as stored. Plaintext that is
    /// not JSON comes back as a string.
    pub fn decrypt_value(&self, value: Value) -> Value {
        let Some(encoded) = value.as_str().and_then(|s| s.strip_prefix(CIPHERTEXT_PREFIX)) else {
            return value;
        };
        match self.open(encoded) {
            Ok(plaintext) => serde_json::from_str(&plaintext).unwrap_or(Value::String(plaintext)),
            Err(e) => {
                warn!(error = %e, "field decryption failed, returning stored value");
                value
            }
        }
    }

    fn open(&self, encoded: &str) -> Result<String> {
        let combined = STANDARD
            .decode(encoded)
            .map_err(|e| EngineError::Encryption(format!("invalid ciphertext encoding: {}", e)))?;
        if combined.len() < NONCE_LENGTH {
            return Err(EngineError::Encryption("ciphertext too short".into()));
        }
        let (nonce, sealed) = combined.split_at(NONCE_LENGTH);
        let nonce: [u8; NONCE_LENGTH] = nonce
            .try_into()
            .map_err(|_| EngineError::Encryption("invalid nonce".into()))?;

        let plaintext = self
            .cipher
            .decrypt(&nonce.into(), sealed)
            .map_err(|_| EngineError::Encryption("authentication failed".into()))?;
        String::from_utf8(plaintext).map_err(|e| EngineError::Encryption(format!("plaintext is not utf-8: {}", e)))
    }

    /// Encrypt the listed fields in place. Null and absent fields are skipped,
    /// and already-encrypted values are left alone.
    pub fn encrypt_fields(&self, record: &mut Record, fields: &[String]) -> Result<()> {
        for field in fields {
            if let Some(value) = record.get_mut(field) {
                if value.is_null() || Self::is_encrypted(value) {
                    continue;
                }
                *value = self.encrypt_value(value)?;
            }
        }
        Ok(())
    }

    pub fn decrypt_fields(&self, record: &mut Record, fields: &[String]) {
        for field in fields {
            if let Some(value) = record.get_mut(field) {
                *value = self.decrypt_value(value.take());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encryption() -> FieldEncryption {
        FieldEncryption::from_base64(&FieldEncryption::generate_key().unwrap()).unwrap()
    }

    #[test]
    fn test_string_roundtrip() {
        let enc = encryption();
        let sealed = enc.encrypt_value(&json!("4111-1111")).unwrap();
        assert!(FieldEncryption::is_encrypted(&sealed));
        assert_ne!(sealed, json!("4111-1111"));
        assert_eq!(enc.decrypt_value(sealed), json!("4111-1111"));
    }

    #[test]
    fn test_structured_values_roundtrip() {
        let enc = encryption();
        for value in [json!(42), json!({"a": [1, 2]}), json!(true)] {
            let sealed = enc.encrypt_value(&value).unwrap();
            assert_eq!(enc.decrypt_value(sealed), value);
        }
    }

    #[test]
    fn test_nonce_is_fresh() {
        let enc = encryption();
        let a = enc.encrypt_value(&json!("same")).unwrap();
        let b = enc.encrypt_value(&json!("same")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_returns_stored_value() {
        let sealed = encryption().encrypt_value(&json!("secret")).unwrap();
        let other = encryption();
        assert_eq!(other.decrypt_value(sealed.clone()), sealed);
        assert_eq!(other.decrypt_value(json!("plain")), json!("plain"));
    }

    #[test]
    fn test_fields_in_place() {
        let enc = encryption();
        let fields = vec!["ssn".to_string(), "note".to_string()];
        let mut record = json!({"ssn": "123", "note": null, "name": "x"}).as_object().cloned().unwrap();

        enc.encrypt_fields(&mut record, &fields).unwrap();
        assert!(FieldEncryption::is_encrypted(&record["ssn"]));
        assert!(record["note"].is_null());
        assert_eq!(record["name"], "x");

        enc.decrypt_fields(&mut record, &fields);
        assert_eq!(record["ssn"], "123");
    }

    #[test]
    fn test_bad_key_length() {
        assert!(matches!(FieldEncryption::new(&[0u8; 16]), Err(EngineError::Encryption(_))));
        assert!(FieldEncryption::from_base64("!!!").is_err());
    }
}
