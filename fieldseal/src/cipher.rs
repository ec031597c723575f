//! Per-value authenticated encryption.
//!
//! Construction (AEAD_AES_256_CBC_HMAC_SHA_512):
//!
//! ```text
//! AAD  = version ‖ algorithm ‖ key_id
//! IV   = HMAC-SHA-512(iv_key, AAD ‖ P)[..16]        (deterministic)
//!      = 16 random bytes                           (random)
//! C    = AES-256-CBC-PKCS7(enc_key, IV, P)
//! MAC  = HMAC-SHA-512(mac_key, AAD ‖ IV ‖ C ‖ bits(AAD) as u64be)[..32]
//! out  = AAD ‖ IV ‖ C ‖ MAC
//! ```
//!
//! Deriving the IV from the plaintext makes equal plaintexts under the same
//! key produce equal ciphertexts, which is what lets a server match
//! encrypted values for equality. Decryption verifies the MAC before touching
//! the CBC body.

use crate::codec;
use crate::error::{Error, Result};
use crate::header::{self, CiphertextEnvelope, IV_SIZE, MAC_SIZE};
use crate::kdf::DataKey;
use crate::schema::{Algorithm, Directive, ValueType};
use crate::value::Value;
use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chacha20poly1305::aead::{rand_core::RngCore, OsRng};
use hmac::{Hmac, Mac};
use sha2::Sha512;
use uuid::Uuid;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha512 = Hmac<Sha512>;

/// Encrypts a single field value according to `directive`.
///
/// `path` is only used in error messages.
///
/// # Errors
///
/// Returns `Error::SchemaMismatch` if the value is already encrypted or does
/// not match the declared type, and `Error::EncryptionFailed` if a
/// deterministic directive carries no declared type.
pub fn encrypt_value(
    key: &DataKey,
    directive: &Directive,
    value: &Value,
    path: &str,
) -> Result<Vec<u8>> {
    if value.is_encrypted() {
        return Err(Error::mismatch(path, "value is already encrypted"));
    }

    let canonical = match (directive.algorithm, directive.value_type) {
        (_, Some(declared)) => codec::coerce(value, declared, path)?,
        (Algorithm::Random, None) => value.clone(),
        (Algorithm::Deterministic, None) => {
            return Err(Error::EncryptionFailed(format!(
                "deterministic encryption of `{path}` needs a declared type"
            )))
        }
    };

    let plaintext = Zeroizing::new(codec::encode(&canonical)?);
    seal(key, directive.key_id, directive.algorithm, &plaintext)
}

/// Encrypts a value for explicit (non-schema) use.
///
/// # Errors
///
/// Same as [`encrypt_value`].
pub fn encrypt_explicit(
    key: &DataKey,
    key_id: Uuid,
    algorithm: Algorithm,
    value_type: Option<ValueType>,
    value: &Value,
) -> Result<Vec<u8>> {
    let value_type = value_type.or_else(|| match algorithm {
        Algorithm::Deterministic => inferred_type(value),
        Algorithm::Random => None,
    });
    encrypt_value(key, &Directive { key_id, algorithm, value_type }, value, "<explicit>")
}

/// Decrypts a parsed envelope with its data key.
///
/// # Errors
///
/// Returns `Error::AuthenticationFailed` when the MAC does not verify, and
/// `Error::DecryptionFailed` when the body or its encoding is malformed.
pub fn decrypt_value(key: &DataKey, envelope: &CiphertextEnvelope) -> Result<Value> {
    let mac = mac_for(key, &envelope.aad(), envelope.iv(), envelope.body())?;
    mac.verify_truncated_left(envelope.mac()).map_err(|_| Error::AuthenticationFailed)?;

    let plaintext = Zeroizing::new(
        Aes256CbcDec::new_from_slices(key.encryption_key(), envelope.iv())
            .map_err(|e| Error::DecryptionFailed(format!("invalid key: {e}")))?
            .decrypt_padded_vec_mut::<Pkcs7>(envelope.body())
            .map_err(|_| Error::DecryptionFailed("invalid padding".to_string()))?,
    );

    codec::decode(&plaintext)
}

fn seal(key: &DataKey, key_id: Uuid, algorithm: Algorithm, plaintext: &[u8]) -> Result<Vec<u8>> {
    let aad = header::aad(algorithm, key_id);

    let mut iv = [0u8; IV_SIZE];
    match algorithm {
        Algorithm::Deterministic => {
            let mut prf = <HmacSha512 as Mac>::new_from_slice(key.iv_key())
                .map_err(|e| Error::EncryptionFailed(format!("invalid IV key: {e}")))?;
            prf.update(&aad);
            prf.update(plaintext);
            iv.copy_from_slice(&prf.finalize().into_bytes()[..IV_SIZE]);
        }
        Algorithm::Random => OsRng.fill_bytes(&mut iv),
    }

    let body = Aes256CbcEnc::new_from_slices(key.encryption_key(), &iv)
        .map_err(|e| Error::EncryptionFailed(format!("invalid key: {e}")))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let tag = mac_for(key, &aad, &iv, &body)?.finalize().into_bytes();
    let mut mac = [0u8; MAC_SIZE];
    mac.copy_from_slice(&tag[..MAC_SIZE]);

    Ok(CiphertextEnvelope::new(algorithm, key_id, iv, body, mac).to_bytes())
}

fn mac_for(key: &DataKey, aad: &[u8], iv: &[u8], body: &[u8]) -> Result<HmacSha512> {
    let mut mac = <HmacSha512 as Mac>::new_from_slice(key.mac_key())
        .map_err(|e| Error::EncryptionFailed(format!("invalid MAC key: {e}")))?;
    mac.update(aad);
    mac.update(iv);
    mac.update(body);
    let aad_bits = (aad.len() as u64) * 8;
    mac.update(&aad_bits.to_be_bytes());
    Ok(mac)
}

fn inferred_type(value: &Value) -> Option<ValueType> {
    match value {
        Value::String(_) => Some(ValueType::String),
        Value::Int32(_) => Some(ValueType::Int),
        Value::Int64(_) => Some(ValueType::Long),
        Value::DateTime(_) => Some(ValueType::Date),
        Value::Binary(_) => Some(ValueType::BinData),
        _ => None,
    }
}
