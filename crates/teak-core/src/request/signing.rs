//! Request signing.
//!
//! The canonical string is
//! `TeakV2-HMAC-SHA256\n{method}\n{hostname}\n{endpoint}\n{hex(HMAC(body))}\n`
//! and the signature is the hex HMAC-SHA256 of that string, both keyed with
//! the app's API key.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::TransportError;

type HmacSha256 = Hmac<Sha256>;

/// Algorithm name used in the canonical string and the header value.
pub const SIGNATURE_ALGORITHM: &str = "TeakV2-HMAC-SHA256";

fn hmac_hex(secret: &[u8], payload: &[u8]) -> Result<String, TransportError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|err| TransportError::Signing(err.to_string()))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Build the string that gets signed.
///
/// # Errors
///
/// Returns [`TransportError::Signing`] if the key is rejected.
pub fn canonical_string(
    method: &str,
    hostname: &str,
    endpoint: &str,
    body: &str,
    secret: &str,
) -> Result<String, TransportError> {
    let body_hash = hmac_hex(secret.as_bytes(), body.as_bytes())?;
    Ok(format!("{SIGNATURE_ALGORITHM}\n{method}\n{hostname}\n{endpoint}\n{body_hash}\n"))
}

/// Hex signature for a request.
///
/// # Errors
///
/// Returns [`TransportError::Signing`] if the key is rejected.
pub fn sign(method: &str, hostname: &str, endpoint: &str, body: &str, secret: &str) -> Result<String, TransportError> {
    let canonical = canonical_string(method, hostname, endpoint, body, secret)?;
    hmac_hex(secret.as_bytes(), canonical.as_bytes())
}

/// Value for the signature header.
pub fn authorization_value(signature: &str) -> String {
    format!("{SIGNATURE_ALGORITHM} Signature={signature}")
}
