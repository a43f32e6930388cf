//! Webhook authenticity checks.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SIGNING_SECRET_PREFIX: &str = "whsec_";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
}

/// Verifies a `t=<unix>,v1=<hex>` header over `"<t>.<body>"`. Any `v1` entry may match,
/// which lets the processor roll its signing secret.
pub fn verify_signed_payload(
    header: Option<&str>,
    body: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let header = header.map(str::trim).filter(|value| !value.is_empty()).ok_or(SignatureError::Missing)?;

    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }

    let age = now.timestamp().abs_diff(timestamp);
    if age > tolerance_secs {
        return Err(SignatureError::Expired);
    }

    let key = secret.strip_prefix(SIGNING_SECRET_PREFIX).unwrap_or(secret);
    for candidate in candidates {
        let Some(signature) = decode_hex(candidate) else {
            continue;
        };
        let mut mac =
            HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| SignatureError::Malformed)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        if mac.verify_slice(&signature).is_ok() {
            return Ok(());
        }
    }
    Err(SignatureError::Mismatch)
}

/// Compares a shared-secret header without leaking the match length through timing.
pub fn verify_shared_secret(provided: Option<&str>, expected: &str) -> Result<(), SignatureError> {
    let provided = provided.ok_or(SignatureError::Missing)?;
    let digest = |value: &str| -> Result<Vec<u8>, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(expected.as_bytes())
            .map_err(|_| SignatureError::Malformed)?;
        mac.update(value.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    };

    let expected_digest = digest(expected)?;
    let mut mac =
        HmacSha256::new_from_slice(expected.as_bytes()).map_err(|_| SignatureError::Malformed)?;
    mac.update(provided.as_bytes());
    mac.verify_slice(&expected_digest).map_err(|_| SignatureError::Mismatch)
}

/// Builds a header the way the processor does. Used by tests and local tooling.
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let key = secret.strip_prefix(SIGNING_SECRET_PREFIX).unwrap_or(secret);
    let signature = match HmacSha256::new_from_slice(key.as_bytes()) {
        Ok(mut mac) => {
            mac.update(timestamp.to_string().as_bytes());
            mac.update(b".");
            mac.update(body);
            encode_hex(mac.finalize().into_bytes().as_slice())
        }
        Err(_) => String::new(),
    };
    format!("t={timestamp},v1={signature}")
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(value.get(index..index + 2)?, 16).ok())
        .collect()
}
