//! SigV4 presigning of the broker's websocket URL
//!
//! The managed broker authenticates websocket clients through query
//! parameters on the upgrade request: the credential scope, the request date
//! and an HMAC-SHA256 signature over a canonical GET of `/mqtt`. A session
//! token, when present, is appended after signing.

use crate::credentials::Credential;
use crate::transport::TransportError;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "iotdevicegateway";
const CANONICAL_PATH: &str = "/mqtt";

/// Build a presigned `wss://` URL for `host`
pub fn presign_url(
    host: &str,
    port: u16,
    region: &str,
    credential: &Credential,
    now: DateTime<Utc>,
) -> Result<String, TransportError> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let scope = format!("{date_stamp}/{region}/{SERVICE}/aws4_request");

    let mut query = format!(
        "X-Amz-Algorithm={ALGORITHM}&X-Amz-Credential={}&X-Amz-Date={amz_date}&X-Amz-SignedHeaders=host",
        uri_encode(&format!("{}/{scope}", credential.access_key_id))
    );

    let canonical_request = format!(
        "GET\n{CANONICAL_PATH}\n{query}\nhost:{host}\n\nhost\n{}",
        sha256_hex(b"")
    );
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let signing_key = signing_key(&credential.secret_access_key, &date_stamp, region)?;
    let signature = hex::encode(hmac(&signing_key, string_to_sign.as_bytes())?);
    query.push_str(&format!("&X-Amz-Signature={signature}"));

    if let Some(token) = &credential.session_token {
        query.push_str(&format!("&X-Amz-Security-Token={}", uri_encode(token)));
    }

    let authority = if port == 443 {
        host.to_string()
    } else {
        format!("{host}:{port}")
    };
    Ok(format!("wss://{authority}{CANONICAL_PATH}?{query}"))
}

fn signing_key(secret: &str, date_stamp: &str, region: &str) -> Result<Vec<u8>, TransportError> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, SERVICE.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| TransportError::Construction(format!("signing key rejected: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Percent-encode everything outside the SigV4 unreserved set
fn uri_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
        .replace('*', "%2A")
        .replace("%7E", "~")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 30, 45).unwrap()
    }

    #[test]
    fn test_presigned_url_shape() {
        let credential = Credential::new("AKIDEXAMPLE", "secret");
        let url = presign_url(
            "abc-ats.iot.eu-west-1.amazonaws.com",
            443,
            "eu-west-1",
            &credential,
            fixed_time(),
        )
        .unwrap();

        assert!(url.starts_with("wss://abc-ats.iot.eu-west-1.amazonaws.com/mqtt?"));
        assert!(url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(url.contains(
            "X-Amz-Credential=AKIDEXAMPLE%2F20240315%2Feu-west-1%2Fiotdevicegateway%2Faws4_request"
        ));
        assert!(url.contains("X-Amz-Date=20240315T123045Z"));
        assert!(url.contains("X-Amz-SignedHeaders=host"));
        assert!(!url.contains("X-Amz-Security-Token"));

        let signature = url
            .split("X-Amz-Signature=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_is_deterministic_and_key_dependent() {
        let now = fixed_time();
        let a = Credential::new("AKID", "secret-a");
        let b = Credential::new("AKID", "secret-b");

        let first = presign_url("host", 443, "us-east-1", &a, now).unwrap();
        let again = presign_url("host", 443, "us-east-1", &a, now).unwrap();
        let other = presign_url("host", 443, "us-east-1", &b, now).unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
    }

    #[test]
    fn test_session_token_appended_after_signature() {
        let credential = Credential::new("AKID", "secret").with_session_token("tok/en+=");
        let url = presign_url("host", 8443, "us-east-1", &credential, fixed_time()).unwrap();

        assert!(url.starts_with("wss://host:8443/mqtt?"));
        let signature_at = url.find("X-Amz-Signature=").unwrap();
        let token_at = url.find("X-Amz-Security-Token=tok%2Fen%2B%3D").unwrap();
        assert!(token_at > signature_at);
    }

    #[test]
    fn test_uri_encode_unreserved_set() {
        assert_eq!(uri_encode("a-b_c.d~e"), "a-b_c.d~e");
        assert_eq!(uri_encode("a b*c/d"), "a%20b%2Ac%2Fd");
    }

    #[test]
    fn test_empty_payload_hash() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
