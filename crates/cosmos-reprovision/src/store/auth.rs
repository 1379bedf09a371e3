//! Master-key request signing.
//!
//! Every REST request carries an `authorization` header holding an
//! HMAC-SHA256 signature over the verb, resource type, resource link and
//! request date, keyed with the decoded account key.

use crate::error::{ReprovisionError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Decoded account master key.
#[derive(Clone)]
pub struct MasterKey {
    key: Vec<u8>,
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

impl MasterKey {
    /// Decode a base64 master key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let key = STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| ReprovisionError::Config(format!("Invalid master key: {}", e)))?;
        Ok(Self { key })
    }

    /// Build the URL-encoded `authorization` header value for a request.
    ///
    /// `resource_link` is case-sensitive and must not carry a leading slash.
    pub fn authorization(
        &self,
        verb: &str,
        resource_type: &str,
        resource_link: &str,
        date: &str,
    ) -> Result<String> {
        let payload = string_to_sign(verb, resource_type, resource_link, date);

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| ReprovisionError::Config(format!("Failed to create HMAC: {}", e)))?;
        mac.update(payload.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        let token = format!("type=master&ver=1.0&sig={}", signature);
        Ok(urlencoding::encode(&token).into_owned())
    }
}

fn string_to_sign(verb: &str, resource_type: &str, resource_link: &str, date: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}\n\n",
        verb.to_lowercase(),
        resource_type.to_lowercase(),
        resource_link,
        date.to_lowercase()
    )
}

/// Format a timestamp as the RFC 1123 date the store expects in `x-ms-date`.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const KEY: &str = "c2VjcmV0LWtleS1mb3ItdGVzdGluZy1vbmx5";

    #[test]
    fn test_string_to_sign_lowercases_all_but_link() {
        let payload = string_to_sign("GET", "Colls", "dbs/MyDb", "Tue, 01 Nov 1994 08:12:31 GMT");
        assert_eq!(
            payload,
            "get\ncolls\ndbs/MyDb\ntue, 01 nov 1994 08:12:31 gmt\n\n"
        );
    }

    #[test]
    fn test_authorization_token_shape() {
        let key = MasterKey::from_base64(KEY).unwrap();
        let token = key
            .authorization("POST", "docs", "dbs/db/colls/c", "Tue, 01 Nov 1994 08:12:31 GMT")
            .unwrap();

        assert!(token.starts_with("type%3Dmaster%26ver%3D1.0%26sig%3D"));

        let decoded = urlencoding::decode(&token).unwrap();
        let sig = decoded.strip_prefix("type=master&ver=1.0&sig=").unwrap();
        let raw = STANDARD.decode(sig).unwrap();
        assert_eq!(raw.len(), 32, "HMAC-SHA256 digest is 32 bytes");
    }

    #[test]
    fn test_authorization_is_deterministic_per_request() {
        let key = MasterKey::from_base64(KEY).unwrap();
        let date = "Tue, 01 Nov 1994 08:12:31 GMT";
        let a = key.authorization("GET", "dbs", "dbs/db", date).unwrap();
        let b = key.authorization("GET", "dbs", "dbs/db", date).unwrap();
        let c = key.authorization("DELETE", "dbs", "dbs/db", date).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(MasterKey::from_base64("%%%").is_err());
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = MasterKey::from_base64(KEY).unwrap();
        assert_eq!(format!("{:?}", key), "MasterKey([REDACTED])");
    }

    #[test]
    fn test_http_date_format() {
        let at = Utc.with_ymd_and_hms(1994, 11, 1, 8, 12, 31).unwrap();
        assert_eq!(http_date(at), "Tue, 01 Nov 1994 08:12:31 GMT");
    }
}
