//! Shared-secret checks.
//!
//! The WebSocket protocol authenticates in-band with an `auth` message; the
//! `/status` route accepts the same secret out-of-band.
//!
//! # Token Extraction
//!
//! 1. **Authorization header**: `Authorization: Bearer <secret>`
//! 2. **Query parameter**: `?token=<secret>` (for tools that can't set headers)
//!
//! All comparisons are constant-time.

use axum::http::{header, Request};
use subtle::ConstantTimeEq;

/// Compare a presented secret against the configured one in constant time.
///
/// An empty configured secret never matches.
pub fn secret_matches(expected: &str, presented: Option<&str>) -> bool {
    match presented {
        Some(presented) if !expected.is_empty() => {
            expected.as_bytes().ct_eq(presented.as_bytes()).into()
        }
        _ => false,
    }
}

/// Extract bearer token from the Authorization header.
///
/// Returns None if the header is missing, malformed, or uses a different scheme.
pub fn extract_bearer_token<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// Extract `token` from the URL query string.
///
/// - `/status?token=abc123` -> Some("abc123")
/// - `/status?foo=bar&token=abc123` -> Some("abc123")
/// - `/status?foo=bar` -> None
pub fn extract_query_token<B>(req: &Request<B>) -> Option<String> {
    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == "token").then(|| value.to_string())
        })
    })
}

/// Header token if present, otherwise the query token.
pub fn request_token<B>(req: &Request<B>) -> Option<String> {
    extract_bearer_token(req)
        .map(str::to_string)
        .or_else(|| extract_query_token(req))
}

// ============================================================================
// TESTS
// ============================================================================
