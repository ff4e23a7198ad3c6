//! Request/response sanitisation applied before anything is persisted.

use std::collections::HashMap;

/// Header names containing any of these (case-insensitive) are redacted.
const SENSITIVE_HEADER_TOKENS: &[&str] = &[
    "authorization",
    "cookie",
    "x-api-key",
    "x-auth-token",
    "api-key",
    "access-token",
    "password",
];

pub const REDACTED: &str = "[REDACTED]";

/// Whether a header's value must be redacted.
pub fn is_sensitive_header(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    SENSITIVE_HEADER_TOKENS
        .iter()
        .any(|token| lowered.contains(token))
}

/// Replace sensitive header values with [`REDACTED`].
pub fn sanitize_headers(headers: &[(String, String)]) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if is_sensitive_header(name) {
                REDACTED.to_string()
            } else {
                value.clone()
            };
            (name.clone(), value)
        })
        .collect()
}

/// Truncate a body to `max_bytes` on a char boundary. Returns the stored
/// body and whether truncation happened.
pub fn truncate_body(body: &str, max_bytes: usize) -> (String, bool) {
    if body.len() <= max_bytes {
        return (body.to_string(), false);
    }
    let mut cut = max_bytes;
    while cut > 0 && !body.is_char_boundary(cut) {
        cut -= 1;
    }
    (body[..cut].to_string(), true)
}
