// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HMAC-SHA256 request signing.
//!
//! Outbound deliveries carry `X-Hub-Signature-256: sha256=<hex>` computed
//! over the exact bytes of the request body. Inbound webhooks feeding the
//! platform are checked with [`verify`] before their payload is parsed.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::SignatureError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

const PREFIX: &str = "sha256=";

/// Parse `sha256=<hex>` into raw bytes. `None` for anything else.
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.strip_prefix(PREFIX)?;
    hex::decode(hex_sig).ok()
}

/// HMAC-SHA256 of `payload` under `secret`.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Result<Vec<u8>, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Format raw signature bytes as a header value.
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("{}{}", PREFIX, hex::encode(signature))
}

/// Header value for `payload` signed with `secret`.
pub fn sign(payload: &[u8], secret: &str) -> Result<String, SignatureError> {
    compute_signature(payload, secret.as_bytes()).map(|s| format_signature_header(&s))
}

/// Check `header` against `payload`. Comparison is constant-time.
pub fn verify(payload: &[u8], header: Option<&str>, secret: &[u8]) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::Missing)?;
    let expected = parse_signature_header(header).ok_or(SignatureError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

/// Boolean form of [`verify`].
pub fn verify_signature(payload: &[u8], header: &str, secret: &[u8]) -> bool {
    verify(payload, Some(header), secret).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2.
        let sig = compute_signature(b"what do ya want for nothing?", b"Jefe").unwrap();
        assert_eq!(
            hex::encode(sig),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_sign_then_verify() {
        let body = br#"{"event":"push","repository":{"id":"repo-1"}}"#;
        let header = sign(body, "s3cret").unwrap();

        assert!(header.starts_with("sha256="));
        assert_eq!(header.len(), "sha256=".len() + 64);
        assert_eq!(verify(body, Some(&header), b"s3cret"), Ok(()));
        assert_eq!(sign(body, "s3cret").unwrap(), header);
    }

    #[test]
    fn test_single_byte_change_fails() {
        let body = b"payload-bytes".to_vec();
        let header = sign(&body, "key").unwrap();

        for i in 0..body.len() {
            let mut tampered = body.clone();
            tampered[i] ^= 0x01;
            assert_eq!(
                verify(&tampered, Some(&header), b"key"),
                Err(SignatureError::Mismatch),
                "byte {} flipped",
                i
            );
        }
        assert!(!verify_signature(&body, &header, b"other-key"));
    }

    #[test]
    fn test_rejects_malformed_headers() {
        let body = b"x";
        assert_eq!(verify(body, None, b"k"), Err(SignatureError::Missing));
        for header in ["", "abcd", "sha1=abcd", "sha256=xyz", "SHA256=00"] {
            assert_eq!(
                verify(body, Some(header), b"k"),
                Err(SignatureError::Malformed),
                "{:?}",
                header
            );
        }
        // Well-formed hex but wrong length is a mismatch, not a panic.
        assert_eq!(verify(body, Some("sha256=00"), b"k"), Err(SignatureError::Mismatch));
    }

    #[test]
    fn test_empty_secret_and_body() {
        let header = sign(b"", "").unwrap();
        assert!(verify_signature(b"", &header, b""));
    }
}
