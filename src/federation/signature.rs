//! HTTP Signatures for ActivityPub
//!
//! Pure codec for the `Signature` header and the canonical signing string,
//! per draft-cavage-http-signatures as used by Mastodon:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Nothing in here performs I/O. Verification lives in `authenticator`,
//! signing in `delivery`.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::FederationError;

/// Pseudo-header covering method and path
pub const REQUEST_TARGET: &str = "(request-target)";

/// Fixed Date header layout, always GMT
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Parsed Signature header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    /// Key ID (actor URL with a key fragment)
    pub key_id: String,
    /// Signed header names, lower-cased, in signing order
    pub headers: Vec<String>,
    /// Decoded signature bytes
    pub signature: Vec<u8>,
}

impl SignatureHeader {
    /// Actor identity the key belongs to (`keyId` without fragment)
    pub fn actor_id(&self) -> &str {
        strip_fragment(&self.key_id)
    }

    /// Serialize back to the wire format
    pub fn to_header_value(&self) -> String {
        build_signature_header(&self.key_id, &self.headers, &self.signature)
    }
}

/// Build the canonical signing string
///
/// Lines are emitted in the order of `headers`; `(request-target)` expands to
/// the lower-cased method and the path, every other name is looked up via
/// `resolver`. Lines are joined with `\n`, no trailing newline.
pub fn canonicalize<S, F>(
    headers: &[S],
    mut resolver: F,
    method: &str,
    path: &str,
) -> Result<String, FederationError>
where
    S: AsRef<str>,
    F: FnMut(&str) -> Option<String>,
{
    let mut lines = Vec::with_capacity(headers.len());

    for name in headers {
        let name = name.as_ref();
        if name == REQUEST_TARGET {
            lines.push(format!(
                "{}: {} {}",
                REQUEST_TARGET,
                method.to_lowercase(),
                path
            ));
            continue;
        }

        let value = resolver(name)
            .ok_or_else(|| FederationError::MissingSignedHeader(name.to_string()))?;
        lines.push(format!("{}: {}", name, value));
    }

    Ok(lines.join("\n"))
}

/// Split `key="value",key=value` pairs.
///
/// Quoted values may contain commas and `=`; anything that is not a pair is
/// skipped.
fn tokenize_pairs(raw: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();
    let mut rest = raw;

    loop {
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        if rest.is_empty() {
            break;
        }

        let Some(eq) = rest.find('=') else {
            break;
        };
        let (key_part, after_key) = rest.split_at(eq);
        let after_eq = &after_key[1..];

        // A comma before the `=` means the leading token was not a pair.
        if let Some(comma) = key_part.find(',') {
            rest = &rest[comma + 1..];
            continue;
        }
        let key = key_part.trim();

        let (value, remainder) = if let Some(quoted) = after_eq.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after_eq.find(',') {
                Some(end) => (after_eq[..end].trim(), &after_eq[end..]),
                None => (after_eq.trim(), ""),
            }
        };

        if !key.is_empty() {
            pairs.push((key, value));
        }
        rest = remainder;
    }

    pairs
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// `algorithm` and unknown fields are ignored.
pub fn parse_signature_header(header: &str) -> Result<SignatureHeader, FederationError> {
    let mut key_id = None;
    let mut headers = None;
    let mut signature = None;

    for (key, value) in tokenize_pairs(header) {
        match key {
            "keyId" => key_id = Some(value.to_string()),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(|s| s.to_ascii_lowercase())
                        .collect::<Vec<_>>(),
                )
            }
            "signature" => signature = Some(value.to_string()),
            _ => {}
        }
    }

    let key_id = key_id
        .filter(|k| !k.is_empty())
        .ok_or_else(|| FederationError::MalformedSignature("missing keyId".to_string()))?;
    let headers = headers
        .ok_or_else(|| FederationError::MalformedSignature("missing headers".to_string()))?;
    let signature = signature
        .ok_or_else(|| FederationError::MalformedSignature("missing signature".to_string()))?;
    let signature = BASE64
        .decode(signature.as_bytes())
        .map_err(|e| FederationError::MalformedSignature(format!("invalid base64: {}", e)))?;

    Ok(SignatureHeader {
        key_id,
        headers,
        signature,
    })
}

/// Build Signature header value
///
/// Field order is always keyId, headers, signature.
pub fn build_signature_header<S: AsRef<str>>(
    key_id: &str,
    headers: &[S],
    signature: &[u8],
) -> String {
    let names: Vec<&str> = headers.iter().map(AsRef::as_ref).collect();
    format!(
        "keyId=\"{}\",headers=\"{}\",signature=\"{}\"",
        key_id,
        names.join(" "),
        BASE64.encode(signature)
    )
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}

pub fn format_http_date(at: DateTime<Utc>) -> String {
    at.format(HTTP_DATE_FORMAT).to_string()
}

/// Parse a Date header in the fixed `Thu, 01 Jan 1970 00:00:00 GMT` layout
pub fn parse_http_date(value: &str) -> Result<DateTime<Utc>, FederationError> {
    NaiveDateTime::parse_from_str(value.trim(), HTTP_DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| {
            FederationError::MalformedSignature(format!(
                "unrecognized date format {:?}, expecting \"Thu, 01 Jan 1970 00:00:00 GMT\"",
                value
            ))
        })
}

/// Drop the `#fragment` of a URL
pub fn strip_fragment(url: &str) -> &str {
    url.split('#').next().unwrap_or(url)
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    strip_fragment(key_id) == strip_fragment(actor_id)
}
