//! Ciphertext envelope format.
//!
//! Every encrypted field value is a single binary blob (subtype 6):
//!
//! ```text
//! [version:1][algorithm:1][key_id:16][iv:16][body:N][mac:32]
//! ```
//!
//! The first 18 bytes are authenticated as associated data, so the algorithm
//! and key id cannot be swapped without failing MAC verification.

use crate::error::Error;
use crate::schema::Algorithm;
use uuid::Uuid;

/// Format version written by this crate.
pub const PROTOCOL_VERSION: u8 = 1;

/// AES block / IV size.
pub const IV_SIZE: usize = 16;

/// Truncated HMAC-SHA-512 tag size.
pub const MAC_SIZE: usize = 32;

/// Length of the authenticated prefix (`version ‖ algorithm ‖ key_id`).
pub const AAD_SIZE: usize = 2 + 16;

const MIN_BODY: usize = IV_SIZE;

/// Parsed ciphertext envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextEnvelope {
    version: u8,
    algorithm: Algorithm,
    key_id: Uuid,
    iv: [u8; IV_SIZE],
    body: Vec<u8>,
    mac: [u8; MAC_SIZE],
}

impl CiphertextEnvelope {
    /// Creates an envelope for the current protocol version.
    #[must_use]
    pub const fn new(
        algorithm: Algorithm,
        key_id: Uuid,
        iv: [u8; IV_SIZE],
        body: Vec<u8>,
        mac: [u8; MAC_SIZE],
    ) -> Self {
        Self { version: PROTOCOL_VERSION, algorithm, key_id, iv, body, mac }
    }

    /// Returns the format version.
    #[must_use]
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// Returns the algorithm the value was encrypted with.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Returns the data key identifier.
    #[must_use]
    pub const fn key_id(&self) -> Uuid {
        self.key_id
    }

    /// Returns the IV.
    #[must_use]
    pub const fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    /// Returns the CBC body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Returns the MAC tag.
    #[must_use]
    pub const fn mac(&self) -> &[u8; MAC_SIZE] {
        &self.mac
    }

    /// Associated data bound into the MAC.
    #[must_use]
    pub fn aad(&self) -> [u8; AAD_SIZE] {
        aad(self.algorithm, self.key_id)
    }

    /// Serializes the envelope.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(AAD_SIZE + IV_SIZE + self.body.len() + MAC_SIZE);
        bytes.push(self.version);
        bytes.push(self.algorithm.as_u8());
        bytes.extend_from_slice(self.key_id.as_bytes());
        bytes.extend_from_slice(&self.iv);
        bytes.extend_from_slice(&self.body);
        bytes.extend_from_slice(&self.mac);
        bytes
    }

    /// Deserializes an envelope.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The data is too short or the body is not block aligned
    /// - The version is not supported
    /// - The algorithm byte is unknown
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let (version, algorithm, key_id) = parse_prefix(data)?;

        let rest = &data[AAD_SIZE..];
        if rest.len() < IV_SIZE + MIN_BODY + MAC_SIZE {
            return Err(Error::InvalidHeader(format!(
                "ciphertext truncated: {} bytes",
                data.len()
            )));
        }
        let (iv, rest) = rest.split_at(IV_SIZE);
        let (body, mac) = rest.split_at(rest.len() - MAC_SIZE);
        if body.len() % IV_SIZE != 0 {
            return Err(Error::InvalidHeader("body is not block aligned".to_string()));
        }

        let mut iv_bytes = [0u8; IV_SIZE];
        iv_bytes.copy_from_slice(iv);
        let mut mac_bytes = [0u8; MAC_SIZE];
        mac_bytes.copy_from_slice(mac);

        Ok(Self { version, algorithm, key_id, iv: iv_bytes, body: body.to_vec(), mac: mac_bytes })
    }
}

/// Reads only the key id of an envelope, without validating the remainder.
///
/// # Errors
///
/// Returns the same prefix errors as [`CiphertextEnvelope::from_bytes`].
pub fn peek_key_id(data: &[u8]) -> Result<Uuid, Error> {
    parse_prefix(data).map(|(_, _, key_id)| key_id)
}

pub(crate) fn aad(algorithm: Algorithm, key_id: Uuid) -> [u8; AAD_SIZE] {
    let mut out = [0u8; AAD_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1] = algorithm.as_u8();
    out[2..].copy_from_slice(key_id.as_bytes());
    out
}

fn parse_prefix(data: &[u8]) -> Result<(u8, Algorithm, Uuid), Error> {
    let Some(&version) = data.first() else {
        return Err(Error::InvalidHeader("empty ciphertext".to_string()));
    };
    if version != PROTOCOL_VERSION {
        return Err(Error::UnsupportedVersion {
            version,
            supported: PROTOCOL_VERSION.to_string(),
        });
    }
    if data.len() < AAD_SIZE {
        return Err(Error::InvalidHeader("missing key id".to_string()));
    }
    let algorithm = Algorithm::from_u8(data[1])
        .ok_or_else(|| Error::InvalidHeader(format!("unknown algorithm byte {}", data[1])))?;
    let key_id = Uuid::from_slice(&data[2..AAD_SIZE])
        .map_err(|e| Error::InvalidHeader(format!("invalid key id: {e}")))?;
    Ok((version, algorithm, key_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CiphertextEnvelope {
        CiphertextEnvelope::new(
            Algorithm::Deterministic,
            Uuid::from_bytes([7; 16]),
            [1; IV_SIZE],
            vec![2; 32],
            [3; MAC_SIZE],
        )
    }

    #[test]
    fn test_envelope_layout() {
        let bytes = sample().to_bytes();

        assert_eq!(bytes.len(), 2 + 16 + IV_SIZE + 32 + MAC_SIZE);
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], 1);
        assert_eq!(&bytes[2..18], &[7; 16]);
        assert_eq!(&bytes[bytes.len() - MAC_SIZE..], &[3; MAC_SIZE]);
    }

    #[test]
    fn test_envelope_parse() {
        let envelope = sample();
        let parsed = CiphertextEnvelope::from_bytes(&envelope.to_bytes()).unwrap();

        assert_eq!(parsed, envelope);
        assert_eq!(parsed.body(), &[2; 32]);
        assert_eq!(&parsed.aad()[..2], &[PROTOCOL_VERSION, 1]);
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = sample().to_bytes();
        bytes[0] = 99;

        let result = CiphertextEnvelope::from_bytes(&bytes);
        assert!(matches!(result, Err(Error::UnsupportedVersion { version: 99, .. })));
    }

    #[test]
    fn test_unknown_algorithm() {
        let mut bytes = sample().to_bytes();
        bytes[1] = 9;
        assert!(matches!(CiphertextEnvelope::from_bytes(&bytes), Err(Error::InvalidHeader(_))));
    }

    #[test]
    fn test_truncated_data() {
        let bytes = sample().to_bytes();
        for len in [0, 1, 10, AAD_SIZE, bytes.len() - 17] {
            let result = CiphertextEnvelope::from_bytes(&bytes[..len]);
            assert!(
                matches!(result, Err(Error::InvalidHeader(_))),
                "length {len} accepted"
            );
        }
    }

    #[test]
    fn test_unaligned_body() {
        let mut bytes = sample().to_bytes();
        bytes.insert(AAD_SIZE + IV_SIZE, 0);
        assert!(matches!(CiphertextEnvelope::from_bytes(&bytes), Err(Error::InvalidHeader(_))));
    }

    #[test]
    fn test_peek_key_id() {
        let bytes = sample().to_bytes();
        assert_eq!(peek_key_id(&bytes).unwrap(), Uuid::from_bytes([7; 16]));
        assert!(peek_key_id(&bytes[..5]).is_err());
    }
}
