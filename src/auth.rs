//! Key checks shared by the relay and the workstation agent.
//!
//! Three credentials exist in the system:
//!
//! - the **registration key** — static process-wide secret authenticating
//!   `POST /tunnel/create` and tunnel teardown (header `X-API-Key` or
//!   `Authorization: Bearer`);
//! - the **connection API key** — per-tunnel secret the workstation presents
//!   when dialing `/tunnel/{id}`;
//! - the **client auth key** — workstation-owned bearer the mobile client
//!   attaches to proxied calls, validated workstation-side.

use axum::http::HeaderMap;

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    // Always iterate over the expected key length to avoid timing leak
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

/// Extract the caller's registration credential from `X-API-Key` or
/// `Authorization: Bearer` and compare it against `expected`.
pub fn check_registration_key(headers: &HeaderMap, expected: &str) -> bool {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return constant_time_eq(expected.as_bytes(), key.as_bytes());
    }
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return constant_time_eq(expected.as_bytes(), token.as_bytes());
        }
    }
    false
}

/// Extract the client auth key from `X-Laptop-Auth-Key` or
/// `Authorization: Bearer`.
pub fn client_auth_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers
        .get("x-laptop-auth-key")
        .and_then(|v| v.to_str().ok())
    {
        return Some(key);
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secrex"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn registration_key_header_forms() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("REG"));
        assert!(check_registration_key(&headers, "REG"));
        assert!(!check_registration_key(&headers, "OTHER"));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer REG"));
        assert!(check_registration_key(&headers, "REG"));

        let headers = HeaderMap::new();
        assert!(!check_registration_key(&headers, "REG"));
    }

    #[test]
    fn laptop_auth_key_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("x-laptop-auth-key", HeaderValue::from_static("abc"));
        assert_eq!(client_auth_key(&headers), Some("abc"));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer xyz"));
        assert_eq!(client_auth_key(&headers), Some("xyz"));

        let headers = HeaderMap::new();
        assert_eq!(client_auth_key(&headers), None);
    }
}
