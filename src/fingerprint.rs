use std::fmt::Write as _;

use sha2::{Digest as _, Sha256};

use crate::interaction::RequestRecord;

const FINGERPRINT_HEX_LEN: usize = 64;

/// Hex-encoded SHA-256 digest identifying one recorded interaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidFingerprint {
    value: String,
}

impl std::fmt::Display for InvalidFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "`{}` is not a fingerprint (expected {FINGERPRINT_HEX_LEN} lowercase hex digits)",
            self.value
        )
    }
}

impl std::error::Error for InvalidFingerprint {}

impl Fingerprint {
    pub fn parse(value: &str) -> Result<Self, InvalidFingerprint> {
        let valid = value.len() == FINGERPRINT_HEX_LEN
            && value
                .bytes()
                .all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f'));
        if !valid {
            return Err(InvalidFingerprint {
                value: value.to_owned(),
            });
        }
        Ok(Self(value.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the fingerprint of a (hook-transformed) canonical request.
///
/// The digest covers, in this order and nothing else:
/// - `method` as stored
/// - `url` (path and query) as stored
/// - headers, sorted by name with a stable sort so repeated names keep their relative order;
///   names are compared lowercased and values are raw bytes
/// - body bytes
///
/// Every field is written with a tag and a length prefix, so no two distinct requests share a
/// serialization. Anything a caller wants ignored has to be removed from the request by the
/// normalize hook before this runs.
pub fn fingerprint(request: &RequestRecord) -> Fingerprint {
    let mut hasher = Sha256::new();

    hash_tagged_str(&mut hasher, b"method", &request.method);
    hash_tagged_str(&mut hasher, b"url", &request.url);

    let mut headers: Vec<(String, &[u8])> = request
        .headers
        .as_pairs()
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.as_slice()))
        .collect();
    headers.sort_by(|(a_name, _), (b_name, _)| a_name.cmp(b_name));

    hash_len_prefixed(&mut hasher, b"headers");
    hash_len_prefixed(&mut hasher, headers.len().to_string().as_bytes());
    for (name, value) in headers {
        hash_len_prefixed(&mut hasher, name.as_bytes());
        hash_len_prefixed(&mut hasher, value);
    }

    hash_tagged_bytes(&mut hasher, b"body", request.body.as_bytes());

    Fingerprint(hex_encode(&hasher.finalize()))
}

fn hash_tagged_str(hasher: &mut Sha256, tag: &[u8], value: &str) {
    hash_tagged_bytes(hasher, tag, value.as_bytes());
}

fn hash_tagged_bytes(hasher: &mut Sha256, tag: &[u8], value: &[u8]) {
    hash_len_prefixed(hasher, tag);
    hash_len_prefixed(hasher, value);
}

fn hash_len_prefixed(hasher: &mut Sha256, value: &[u8]) {
    hasher.update(u64::try_from(value.len()).unwrap_or(u64::MAX).to_le_bytes());
    hasher.update(value);
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}
