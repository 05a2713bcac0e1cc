//! HTTP Signatures for ActivityPub
//!
//! Signing and verification per draft-cavage-http-signatures-12 with
//! RSA-SHA256. Outbound requests cover `(request-target) date host digest`.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Headers covered by every outbound signature, in order.
pub const SIGNED_HEADERS: &str = "(request-target) date host digest";

/// How far in the past an inbound `Date` may lie.
const MAX_DATE_AGE_SECS: i64 = 12 * 3600;
/// How far in the future an inbound `Date` may lie.
const MAX_DATE_SKEW_SECS: i64 = 3600;

/// Headers to add for a signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 1123, GMT)
    pub date: String,
    /// Host header value, including a non-default port
    pub host: String,
    /// Digest header value
    pub digest: String,
}

/// Sign a request with a body.
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for digest)
/// * `key` - Site signing key
/// * `key_id` - Full URL to the public key (actor#main-key)
pub fn sign_request(
    method: &str,
    url: &str,
    body: &[u8],
    key: &SigningKey<Sha256>,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host_name = parsed_url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    let host = match parsed_url.port() {
        Some(port) => format!("{}:{}", host_name, port),
        None => host_name.to_string(),
    };

    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", parsed_url.path(), q),
        None => parsed_url.path().to_string(),
    };

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = generate_digest(body);

    let signing_string = [
        format!("(request-target): {} {}", method.to_lowercase(), path_and_query),
        format!("date: {}", date),
        format!("host: {}", host),
        format!("digest: {}", digest),
    ]
    .join("\n");

    let mut rng = rand::thread_rng();
    let signature = key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id, SIGNED_HEADERS, signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        host,
        digest,
    })
}

/// Verify an inbound request signature
///
/// # Arguments
/// * `method` - HTTP method
/// * `path_and_query` - Request target as received
/// * `headers` - All request headers
/// * `body` - Request body (its digest is recomputed)
/// * `public_key_pem` - Signer's RSA public key in PEM format
///
/// # Errors
/// `InvalidSignature` for anything that makes the request untrustworthy.
pub fn verify_signature(
    method: &str,
    path_and_query: &str,
    headers: &http::HeaderMap,
    body: &[u8],
    public_key_pem: &str,
) -> Result<(), AppError> {
    let signature_header = header_str(headers, "signature")?
        .ok_or_else(|| invalid("Missing Signature header"))?;
    let parsed = parse_signature_header(signature_header)?;

    if !parsed.algorithm.eq_ignore_ascii_case("rsa-sha256")
        && !parsed.algorithm.eq_ignore_ascii_case("hs2019")
    {
        return Err(invalid(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in ["(request-target)", "digest"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(invalid(format!("Signed headers must include: {}", required)));
        }
    }

    // Digest must describe the body we actually received.
    let digest_header =
        header_str(headers, "digest")?.ok_or_else(|| invalid("Missing Digest header"))?;
    if !digest_matches(digest_header, body) {
        return Err(invalid("Digest mismatch"));
    }

    if let Some(date) = header_str(headers, "date")? {
        check_date(date)?;
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path_and_query),
            name if name.starts_with('(') => {
                return Err(invalid(format!("Unsupported pseudo-header: {}", name)));
            }
            name => {
                let values: Vec<&str> = headers
                    .get_all(name)
                    .iter()
                    .map(|v| v.to_str().map(str::trim))
                    .collect::<Result<_, _>>()
                    .map_err(|_| invalid(format!("Invalid {} header", name)))?;
                if values.is_empty() {
                    return Err(invalid(format!("Missing {} header", name)));
                }
                values.join(", ")
            }
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }
    let signing_string = signing_parts.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| invalid("Invalid signature encoding"))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .or_else(|_| {
            use rsa::pkcs1::DecodeRsaPublicKey;
            RsaPublicKey::from_pkcs1_pem(public_key_pem)
        })
        .map_err(|e| invalid(format!("Invalid public key: {}", e)))?;

    let verifier = VerifyingKey::<Sha256>::new(public_key);
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| invalid(format!("Invalid signature format: {}", e)))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| invalid("Signature verification failed"))?;

    Ok(())
}

fn invalid(msg: impl Into<String>) -> AppError {
    AppError::InvalidSignature(msg.into())
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<Option<&'a str>, AppError> {
    headers
        .get(name)
        .map(|v| v.to_str().map_err(|_| invalid(format!("Invalid {} header", name))))
        .transpose()
}

fn check_date(date: &str) -> Result<(), AppError> {
    let date = DateTime::parse_from_rfc2822(date).map_err(|_| invalid("Invalid Date format"))?;
    let age = Utc::now().timestamp() - date.timestamp();
    if age > MAX_DATE_AGE_SECS || -age > MAX_DATE_SKEW_SECS {
        return Err(invalid("Date header too old or in future"));
    }
    Ok(())
}

/// Whether a `Digest` header carries the SHA-256 of `body`.
fn digest_matches(header: &str, body: &[u8]) -> bool {
    let expected = generate_digest(body);
    let expected_value = &expected["SHA-256=".len()..];

    header.split(',').any(|part| {
        part.trim()
            .split_once('=')
            .map(|(alg, value)| alg.eq_ignore_ascii_case("sha-256") && value == expected_value)
            .unwrap_or(false)
    })
}

/// Parsed Signature header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names, lowercased
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse a Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// Quoted values may contain commas. A missing `headers` parameter means
/// `date`, as the draft specifies; a missing `algorithm` means hs2019.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    let mut rest = header.trim();
    while !rest.is_empty() {
        let (key, after_key) = rest
            .split_once('=')
            .ok_or_else(|| invalid("Malformed Signature header"))?;
        let key = key.trim().trim_start_matches(',').trim();

        let (value, after_value) = if let Some(quoted) = after_key.trim_start().strip_prefix('"') {
            let end = quoted
                .find('"')
                .ok_or_else(|| invalid("Unterminated quoted value in Signature header"))?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            let end = after_key.find(',').unwrap_or(after_key.len());
            (after_key[..end].trim(), &after_key[end..])
        };

        match key {
            "keyId" => key_id = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_string()),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(|s| s.to_ascii_lowercase())
                        .collect(),
                )
            }
            "signature" => signature = Some(value.to_string()),
            _ => {}
        }

        rest = after_value.trim_start().trim_start_matches(',').trim_start();
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| invalid("Missing keyId"))?,
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature.ok_or_else(|| invalid("Missing signature"))?,
    })
}

/// SHA-256 digest header value for a body: `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Extract keyId from the Signature header
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, AppError> {
    let signature_header =
        header_str(headers, "signature")?.ok_or_else(|| invalid("Missing Signature header"))?;
    Ok(parse_signature_header(signature_header)?.key_id)
}

/// The actor document URL behind a key id (fragment stripped).
pub fn key_id_actor(key_id: &str) -> &str {
    key_id.split('#').next().unwrap_or(key_id)
}
