//! Webhook signature checks.
//!
//! The TMS sends `sha1=<token>` in [`SIGNATURE_HEADER`]. Depending on how
//! the integration was provisioned, `<token>` is either the shared secret
//! itself or the hex HMAC-SHA1 of the raw body keyed with that secret; both
//! are accepted. Comparisons are constant time.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_HEADER: &str = "x-tms-signature";

const SIGNATURE_PREFIX: &str = "sha1=";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature header is empty")]
    Empty,

    #[error("signing secret is empty")]
    EmptySecret,

    #[error("signature verification failed")]
    Mismatch,
}

/// Check a signature header against the raw body.
///
/// The `sha1=` prefix is optional.
pub fn verify_signature(body: &[u8], header: &str, secret: &str) -> Result<(), SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::EmptySecret);
    }

    let header = header.trim();
    let token = header.strip_prefix(SIGNATURE_PREFIX).unwrap_or(header).trim();
    if token.is_empty() {
        return Err(SignatureError::Empty);
    }

    if timing_safe_eq(token, secret) {
        return Ok(());
    }

    let expected = sign(body, secret);
    if timing_safe_eq(&token.to_ascii_lowercase(), &expected) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Hex HMAC-SHA1 of `body` keyed with `secret`.
pub fn sign(body: &[u8], secret: &str) -> String {
    // HMAC takes keys of any length, so this never fails.
    let mut mac = match HmacSha1::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Header value for a body, as the TMS would send it.
pub fn signature_header(body: &[u8], secret: &str) -> String {
    format!("{SIGNATURE_PREFIX}{}", sign(body, secret))
}

fn timing_safe_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    #[test]
    fn test_hmac_signature_accepted() {
        let body = br#"{"event_type":"load.created"}"#;
        let header = signature_header(body, SECRET);

        assert!(header.starts_with("sha1="));
        assert_eq!(verify_signature(body, &header, SECRET), Ok(()));
    }

    #[test]
    fn test_uppercase_hex_accepted() {
        let body = b"payload";
        let header = format!("sha1={}", sign(body, SECRET).to_uppercase());
        assert_eq!(verify_signature(body, &header, SECRET), Ok(()));
    }

    #[test]
    fn test_shared_secret_token_accepted() {
        assert_eq!(verify_signature(b"anything", "sha1=whsec_test", SECRET), Ok(()));
        assert_eq!(verify_signature(b"anything", "whsec_test", SECRET), Ok(()));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let header = signature_header(b"original", SECRET);
        assert_eq!(
            verify_signature(b"tampered", &header, SECRET),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_secret_rejected() {
        assert_eq!(
            verify_signature(b"body", "sha1=not-the-secret", SECRET),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(verify_signature(b"body", "sha1=", SECRET), Err(SignatureError::Empty));
        assert_eq!(verify_signature(b"body", "sha1=x", ""), Err(SignatureError::EmptySecret));
    }
}
