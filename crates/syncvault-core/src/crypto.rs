//! Optional record encryption
//!
//! Encryption is injected as a [`Cipher`] at construction. When no
//! cipher is supplied, records pass through both directions
//! unchanged; that is the normal unencrypted configuration, never an
//! error.
//!
//! Two modes, chosen per collection by its `encrypted_fields` list:
//!
//! - **Whole-payload** (empty list): the entire payload is replaced
//!   by a single `encrypted_payload` blob; the stored row carries no
//!   plaintext.
//! - **Field-level** (non-empty list): each named top-level field is
//!   individually encrypted into an `encrypted_fields` map and
//!   removed from the plaintext; the rest of the payload is stored
//!   as-is alongside it.
//!
//! Decryption reconstructs the exact original payload shape and is
//! the exact inverse of encryption.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;

use crate::error::{StorageError, StoreResult};
use crate::models::Payload;

/// Stored key holding a whole-payload ciphertext
pub const ENCRYPTED_PAYLOAD_KEY: &str = "encrypted_payload";

/// Stored key holding the field-name -> ciphertext map
pub const ENCRYPTED_FIELDS_KEY: &str = "encrypted_fields";

/// A reversible transform over serialized JSON text.
///
/// Implementations are supplied by the embedding application; the
/// storage layer only requires that `decrypt(encrypt(x)) == x`.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> StoreResult<String>;
    fn decrypt(&self, ciphertext: &str) -> StoreResult<String>;
}

/// Shared handle to an optional cipher
pub type CipherHandle = Option<Arc<dyn Cipher>>;

/// Encrypt a payload for storage according to the collection's
/// encrypted-field list.
///
/// With no cipher the payload is returned unchanged. An encrypted
/// field named in the list but absent from the payload is skipped.
pub fn encrypt_payload(
    cipher: &CipherHandle,
    payload: &Payload,
    encrypted_fields: &[String],
) -> StoreResult<Payload> {
    let Some(cipher) = cipher else {
        return Ok(payload.clone());
    };

    if encrypted_fields.is_empty() {
        // Whole-payload mode: one blob, no plaintext alongside.
        let plaintext = serde_json::to_string(payload)
            .map_err(|e| StorageError::Encryption(format!("serialize payload: {}", e)))?;
        let ciphertext = cipher.encrypt(&plaintext)?;
        let mut stored = Payload::new();
        stored.insert(ENCRYPTED_PAYLOAD_KEY.to_string(), Value::String(ciphertext));
        return Ok(stored);
    }

    let mut stored = payload.clone();
    let mut encrypted = Payload::new();
    for field in encrypted_fields {
        if let Some(value) = stored.remove(field) {
            let plaintext = serde_json::to_string(&value)
                .map_err(|e| StorageError::Encryption(format!("serialize field '{}': {}", field, e)))?;
            encrypted.insert(field.clone(), Value::String(cipher.encrypt(&plaintext)?));
        }
    }
    if !encrypted.is_empty() {
        stored.insert(ENCRYPTED_FIELDS_KEY.to_string(), Value::Object(encrypted));
    }
    Ok(stored)
}

/// Invert [`encrypt_payload`], restoring the original payload shape.
///
/// With no cipher the stored payload is returned unchanged. A stored
/// payload written without encryption also passes through unchanged,
/// so enabling encryption later does not break reads of old rows.
pub fn decrypt_payload(cipher: &CipherHandle, stored: &Payload) -> StoreResult<Payload> {
    let Some(cipher) = cipher else {
        return Ok(stored.clone());
    };

    if let Some(Value::String(ciphertext)) = stored.get(ENCRYPTED_PAYLOAD_KEY) {
        let plaintext = cipher.decrypt(ciphertext)?;
        let value: Value = serde_json::from_str(&plaintext)
            .map_err(|e| StorageError::Encryption(format!("invalid decrypted payload: {}", e)))?;
        return match value {
            Value::Object(map) => Ok(map),
            other => Err(StorageError::Encryption(format!(
                "decrypted payload is not an object: {}",
                other
            ))),
        };
    }

    let mut payload = stored.clone();
    if let Some(Value::Object(encrypted)) = payload.remove(ENCRYPTED_FIELDS_KEY) {
        for (field, ciphertext) in encrypted {
            let Value::String(ciphertext) = ciphertext else {
                return Err(StorageError::Encryption(format!(
                    "ciphertext for field '{}' is not a string",
                    field
                )));
            };
            let plaintext = cipher.decrypt(&ciphertext)?;
            let value: Value = serde_json::from_str(&plaintext).map_err(|e| {
                StorageError::Encryption(format!("invalid decrypted field '{}': {}", field, e))
            })?;
            payload.insert(field, value);
        }
    }
    Ok(payload)
}

/// Reference cipher: base64 over the plaintext.
///
/// Not secret in any way; exists so tests and examples can exercise
/// both encryption modes with a visibly transformed stored blob.
#[derive(Debug, Default, Clone, Copy)]
pub struct Base64Cipher;

impl Cipher for Base64Cipher {
    fn encrypt(&self, plaintext: &str) -> StoreResult<String> {
        Ok(BASE64.encode(plaintext.as_bytes()))
    }

    fn decrypt(&self, ciphertext: &str) -> StoreResult<String> {
        let bytes = BASE64
            .decode(ciphertext)
            .map_err(|e| StorageError::Encryption(format!("invalid base64 ciphertext: {}", e)))?;
        String::from_utf8(bytes)
            .map_err(|e| StorageError::Encryption(format!("ciphertext is not UTF-8: {}", e)))
    }
}
