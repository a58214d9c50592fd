//! HTTP signatures in the "Signing HTTP Messages" profile the Mastodon
//! ecosystem speaks.
//!
//! The signature header has the form
//! `keyId="…"[,algorithm="…"],headers="(request-target) host date …",signature="…"`
//! and the signing string concatenates `"{name}: {value}"` lines joined by
//! single newlines, signed with RSASSA-PKCS1-v1_5 over SHA-256.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use signature::{SignatureEncoding, Signer, Verifier};
use thiserror::Error;
use tracing::debug;

/// Signing algorithm, formally RSASSA-PKCS1-v1_5 with SHA-256.
pub const SIGNING_ALGORITHM: &str = "rsa-sha256";

/// Allowed gap between the signature timestamp and the current time.
pub const SIGNATURE_WINDOW_SECONDS: i64 = 30;

/// Headers every signature must cover.
pub const MANDATORY_HEADERS: [&str; 3] = ["(request-target)", "host", "date"];

/// Signature failure kinds.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("bad signature format: {0}")]
    BadFormat(String),
    #[error("date is out of bounds: {0}")]
    ClockSkew(String),
    #[error("request body digest mismatch")]
    DigestMismatch,
    #[error("signature is not authentic: {0}")]
    NotAuthentic(String),
    #[error("bad key: {0}")]
    BadKey(String),
}

/// A parsed `Signature` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    /// ID of the signer's key.
    pub key_id: String,
    /// Digest algorithm; defaults to [`SIGNING_ALGORITHM`] when omitted.
    pub algorithm: String,
    /// Signed header names, in the sender's order.
    pub headers: Vec<String>,
    /// Base64-encoded signature.
    pub signature: String,
}

/// Parses a `Signature` header value.
///
/// Tolerates whitespace around parameters. `keyId`, `headers` and
/// `signature` must be present and non-empty; `algorithm` may be omitted but
/// not empty.
pub fn parse_signature_header(header: &str) -> Result<SignatureHeader, SignatureError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((name, value)) = part.split_once('=') else {
            return Err(SignatureError::BadFormat(format!(
                "malformed parameter: {part}"
            )));
        };
        let value = value.trim().trim_matches('"').to_string();
        match name.trim() {
            "keyId" => key_id = Some(value),
            "algorithm" => algorithm = Some(value),
            "headers" => headers = Some(value),
            "signature" => signature = Some(value),
            _ => {}
        }
    }

    let key_id = match key_id {
        Some(value) if !value.is_empty() => value,
        _ => {
            return Err(SignatureError::BadFormat(
                "keyId must not be empty".to_string(),
            ))
        }
    };
    let algorithm = match algorithm {
        None => SIGNING_ALGORITHM.to_string(),
        Some(value) if value.is_empty() => {
            return Err(SignatureError::BadFormat(
                "algorithm may be omitted but cannot be empty".to_string(),
            ))
        }
        Some(value) => value,
    };
    let headers = match headers {
        Some(value) if !value.is_empty() => parse_signed_headers(&value)?,
        _ => {
            return Err(SignatureError::BadFormat(
                "headers must not be empty".to_string(),
            ))
        }
    };
    let signature = match signature {
        Some(value) if !value.is_empty() => value,
        _ => {
            return Err(SignatureError::BadFormat(
                "signature must not be empty".to_string(),
            ))
        }
    };

    Ok(SignatureHeader {
        key_id,
        algorithm,
        headers,
        signature,
    })
}

/// Parses the `headers` parameter, requiring the mandatory set.
fn parse_signed_headers(headers: &str) -> Result<Vec<String>, SignatureError> {
    let names: Vec<String> = headers.split(' ').map(str::to_string).collect();
    if names.iter().any(String::is_empty) {
        return Err(SignatureError::BadFormat(format!(
            "malformed headers: {headers}"
        )));
    }
    for mandatory in MANDATORY_HEADERS {
        if !names.iter().any(|name| name == mandatory) {
            return Err(SignatureError::BadFormat(format!(
                "mandatory header {mandatory} is missing in {headers}"
            )));
        }
    }
    Ok(names)
}

/// Whether a signature `Date` value lies within the allowed window.
pub fn is_valid_signature_date(date: &str) -> Result<bool, SignatureError> {
    let timestamp = chrono::DateTime::parse_from_rfc2822(date)
        .map_err(|e| SignatureError::BadFormat(format!("invalid date {date:?}: {e}")))?;
    let elapsed = Utc::now().signed_duration_since(timestamp);
    debug!(elapsed_seconds = elapsed.num_seconds(), "signature age");
    Ok(elapsed.num_seconds().abs() <= SIGNATURE_WINDOW_SECONDS)
}

/// `SHA-256=<base64>` digest of a request body.
#[must_use]
pub fn digest_request_body(body: &[u8]) -> String {
    format!("SHA-256={}", BASE64.encode(Sha256::digest(body)))
}

/// Builds the signing string from header names and their values.
fn build_signing_string(
    headers: &[String],
    header_values: &HashMap<String, String>,
) -> Result<String, SignatureError> {
    let mut lines = Vec::with_capacity(headers.len());
    for name in headers {
        let value = header_values
            .get(name)
            .ok_or_else(|| SignatureError::BadFormat(format!("missing header value: {name}")))?;
        lines.push(format!("{name}: {value}"));
    }
    Ok(lines.join("\n"))
}

/// Verifies a parsed signature against a public key.
///
/// `header_values` maps the signed header names (plus `(request-target)`)
/// onto the values the request carried; `body` is the raw request body used
/// to check the digest when the signature covers one.
pub fn verify_signature_and_headers(
    signature: &SignatureHeader,
    public_key_pem: &str,
    header_values: &HashMap<String, String>,
    body: &str,
) -> Result<(), SignatureError> {
    debug!(algorithm = %signature.algorithm, "checking algorithm");
    if signature.algorithm != SIGNING_ALGORITHM {
        return Err(SignatureError::BadFormat(format!(
            "unsupported signing algorithm: {}",
            signature.algorithm
        )));
    }

    let date = header_values
        .get("date")
        .ok_or_else(|| SignatureError::BadFormat("missing header value: date".to_string()))?;
    if !is_valid_signature_date(date)? {
        return Err(SignatureError::ClockSkew(date.clone()));
    }

    if signature.headers.iter().any(|name| name == "digest") {
        debug!("validating body digest");
        let digest = header_values
            .get("digest")
            .ok_or_else(|| SignatureError::BadFormat("missing header value: digest".to_string()))?;
        if digest_request_body(body.as_bytes()) != *digest {
            return Err(SignatureError::DigestMismatch);
        }
    }

    let message = build_signing_string(&signature.headers, header_values)?;
    debug!(message = %message, "verifying signing string");

    let signature_bytes = BASE64
        .decode(&signature.signature)
        .map_err(|e| SignatureError::BadFormat(format!("signature is not base64: {e}")))?;
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| SignatureError::BadKey(e.to_string()))?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let signature = Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| SignatureError::NotAuthentic(e.to_string()))?;
    verifying_key
        .verify(message.as_bytes(), &signature)
        .map_err(|e| SignatureError::NotAuthentic(e.to_string()))
}

/// Signs an ordered list of `(header, value)` pairs and renders the
/// `Signature` header value.
pub fn make_signature_header(
    key_id: &str,
    private_key_pem: &str,
    headers: &[(String, String)],
) -> Result<String, SignatureError> {
    let names: Vec<String> = headers.iter().map(|(name, _)| name.clone()).collect();
    for mandatory in MANDATORY_HEADERS {
        if !names.iter().any(|name| name == mandatory) {
            return Err(SignatureError::BadFormat(format!(
                "mandatory header {mandatory} must be signed"
            )));
        }
    }
    let message = headers
        .iter()
        .map(|(name, value)| format!("{name}: {value}"))
        .collect::<Vec<_>>()
        .join("\n");
    debug!(message = %message, "signing string");

    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| SignatureError::BadKey(e.to_string()))?;
    let signing_key = SigningKey::<Sha256>::new(private_key);
    let signature = signing_key
        .try_sign(message.as_bytes())
        .map_err(|e| SignatureError::NotAuthentic(e.to_string()))?;
    let signature = BASE64.encode(signature.to_bytes());

    Ok(format!(
        "keyId=\"{key_id}\",algorithm=\"{SIGNING_ALGORITHM}\",headers=\"{}\",signature=\"{signature}\"",
        names.join(" ")
    ))
}

/// Builds the canonical signed header set for a POST and signs it.
///
/// Returns the headers to send, including the rendered `Signature`.
pub fn sign_post_request(
    key_id: &str,
    private_key_pem: &str,
    host: &str,
    path: &str,
    body: &[u8],
) -> Result<Vec<(String, String)>, SignatureError> {
    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = digest_request_body(body);
    let signed: Vec<(String, String)> = vec![
        ("(request-target)".to_string(), format!("post {path}")),
        ("host".to_string(), host.to_string()),
        ("date".to_string(), date.clone()),
        ("digest".to_string(), digest.clone()),
        (
            "content-type".to_string(),
            "application/activity+json".to_string(),
        ),
    ];
    let signature = make_signature_header(key_id, private_key_pem, &signed)?;
    Ok(vec![
        ("Date".to_string(), date),
        ("Digest".to_string(), digest),
        (
            "Content-Type".to_string(),
            "application/activity+json".to_string(),
        ),
        ("Signature".to_string(), signature),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_common::crypto::generate_rsa_keypair;

    fn keypair() -> (String, String) {
        let pair = generate_rsa_keypair().unwrap();
        (pair.private_key_pem, pair.public_key_pem)
    }

    fn signed_values(body: &str, date: String) -> HashMap<String, String> {
        HashMap::from([
            (
                "(request-target)".to_string(),
                "post /users/alice/inbox".to_string(),
            ),
            ("host".to_string(), "example.social".to_string()),
            ("date".to_string(), date),
            ("digest".to_string(), digest_request_body(body.as_bytes())),
            (
                "content-type".to_string(),
                "application/activity+json".to_string(),
            ),
        ])
    }

    fn sign(private_pem: &str, values: &HashMap<String, String>) -> SignatureHeader {
        let order = ["(request-target)", "host", "date", "digest", "content-type"];
        let pairs: Vec<(String, String)> = order
            .iter()
            .map(|name| ((*name).to_string(), values[*name].clone()))
            .collect();
        let header = make_signature_header(
            "https://r.example/users/bob#main-key",
            private_pem,
            &pairs,
        )
        .unwrap();
        parse_signature_header(&header).unwrap()
    }

    #[test]
    fn test_parse_signature_header() {
        let header = r#"keyId="https://r.example/users/bob#main-key", algorithm="rsa-sha256", headers="(request-target) host date digest", signature="abc123==""#;
        let parsed = parse_signature_header(header).unwrap();
        assert_eq!(parsed.key_id, "https://r.example/users/bob#main-key");
        assert_eq!(parsed.algorithm, "rsa-sha256");
        assert_eq!(
            parsed.headers,
            vec!["(request-target)", "host", "date", "digest"]
        );
        assert_eq!(parsed.signature, "abc123==");
    }

    #[test]
    fn test_parse_defaults_algorithm() {
        let header = r#"keyId="k",headers="(request-target) host date",signature="s""#;
        let parsed = parse_signature_header(header).unwrap();
        assert_eq!(parsed.algorithm, SIGNING_ALGORITHM);
    }

    #[test]
    fn test_parse_rejects_empty_parameters() {
        for header in [
            r#"keyId="",headers="(request-target) host date",signature="s""#,
            r#"keyId="k",headers="",signature="s""#,
            r#"keyId="k",headers="(request-target) host date",signature="""#,
            r#"keyId="k",algorithm="",headers="(request-target) host date",signature="s""#,
            r#"headers="(request-target) host date",signature="s""#,
        ] {
            assert!(parse_signature_header(header).is_err(), "{header}");
        }
    }

    #[test]
    fn test_parse_rejects_missing_mandatory_headers() {
        let header = r#"keyId="k",headers="host date",signature="s""#;
        assert!(parse_signature_header(header).is_err());
        // Double spaces produce an empty header name.
        let header = r#"keyId="k",headers="(request-target)  host date",signature="s""#;
        assert!(parse_signature_header(header).is_err());
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let (private_pem, public_pem) = keypair();
        let body = r#"{"type":"Follow"}"#;
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let values = signed_values(body, date);
        let signature = sign(&private_pem, &values);

        verify_signature_and_headers(&signature, &public_pem, &values, body).unwrap();
    }

    #[test]
    fn test_verify_rejects_tampered_body() {
        let (private_pem, public_pem) = keypair();
        let body = r#"{"type":"Follow"}"#;
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let values = signed_values(body, date);
        let signature = sign(&private_pem, &values);

        let err = verify_signature_and_headers(&signature, &public_pem, &values, "tampered")
            .unwrap_err();
        assert!(matches!(err, SignatureError::DigestMismatch));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let (private_pem, _) = keypair();
        let (_, other_public) = keypair();
        let body = "{}";
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let values = signed_values(body, date);
        let signature = sign(&private_pem, &values);

        let err =
            verify_signature_and_headers(&signature, &other_public, &values, body).unwrap_err();
        assert!(matches!(err, SignatureError::NotAuthentic(_)));
    }

    #[test]
    fn test_clock_skew_window() {
        let (private_pem, public_pem) = keypair();
        let body = "{}";

        // 29 seconds old: inside the window.
        let date = (Utc::now() - chrono::Duration::seconds(29))
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let values = signed_values(body, date);
        let signature = sign(&private_pem, &values);
        verify_signature_and_headers(&signature, &public_pem, &values, body).unwrap();

        // 31 seconds old: outside.
        let date = (Utc::now() - chrono::Duration::seconds(31))
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let values = signed_values(body, date);
        let signature = sign(&private_pem, &values);
        let err =
            verify_signature_and_headers(&signature, &public_pem, &values, body).unwrap_err();
        assert!(matches!(err, SignatureError::ClockSkew(_)));

        // 31 seconds in the future is just as bad.
        let date = (Utc::now() + chrono::Duration::seconds(31))
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let values = signed_values(body, date);
        let signature = sign(&private_pem, &values);
        let err =
            verify_signature_and_headers(&signature, &public_pem, &values, body).unwrap_err();
        assert!(matches!(err, SignatureError::ClockSkew(_)));
    }

    #[test]
    fn test_verify_rejects_unknown_algorithm() {
        let (private_pem, public_pem) = keypair();
        let body = "{}";
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let values = signed_values(body, date);
        let mut signature = sign(&private_pem, &values);
        signature.algorithm = "hs2019".to_string();
        let err =
            verify_signature_and_headers(&signature, &public_pem, &values, body).unwrap_err();
        assert!(matches!(err, SignatureError::BadFormat(_)));
    }

    #[test]
    fn test_sign_post_request_headers() {
        let (private_pem, public_pem) = keypair();
        let body = br#"{"type":"Accept"}"#;
        let headers = sign_post_request(
            "https://example.social/users/alice#main-key",
            &private_pem,
            "r.example",
            "/users/bob/inbox",
            body,
        )
        .unwrap();

        let header_map: HashMap<String, String> = headers
            .iter()
            .map(|(name, value)| (name.to_lowercase(), value.clone()))
            .collect();
        let signature = parse_signature_header(&header_map["signature"]).unwrap();
        assert_eq!(
            signature.headers,
            vec!["(request-target)", "host", "date", "digest", "content-type"]
        );

        // The receiver-side reconstruction verifies.
        let values = HashMap::from([
            (
                "(request-target)".to_string(),
                "post /users/bob/inbox".to_string(),
            ),
            ("host".to_string(), "r.example".to_string()),
            ("date".to_string(), header_map["date"].clone()),
            ("digest".to_string(), header_map["digest"].clone()),
            (
                "content-type".to_string(),
                "application/activity+json".to_string(),
            ),
        ]);
        verify_signature_and_headers(
            &signature,
            &public_pem,
            &values,
            std::str::from_utf8(body).unwrap(),
        )
        .unwrap();
    }
}
