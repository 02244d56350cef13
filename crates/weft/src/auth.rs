//! Shared-secret bearer authentication for the private service surface.
//!
//! The upload service authenticates to the payment service with a single
//! shared secret carried as a bearer token. Comparison is constant-time.

use subtle::ConstantTimeEq;

/// Constant-time byte comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Render the `Authorization` header value for a shared secret.
pub fn bearer_value(secret: &str) -> String {
    format!("Bearer {secret}")
}

/// Check an `Authorization` header against the shared secret.
/// Returns `false` on a missing header, wrong scheme, or mismatch.
pub fn verify_bearer(secret: &[u8], header: Option<&str>) -> bool {
    let Some(header) = header else {
        return false;
    };
    let Some(token) = header.strip_prefix("Bearer ") else {
        return false;
    };
    constant_time_eq(token.as_bytes(), secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_token() {
        assert!(verify_bearer(b"s3cret", Some("Bearer s3cret")));
    }

    #[test]
    fn rejects_missing_wrong_scheme_and_mismatch() {
        assert!(!verify_bearer(b"s3cret", None));
        assert!(!verify_bearer(b"s3cret", Some("Basic s3cret")));
        assert!(!verify_bearer(b"s3cret", Some("Bearer nope")));
        assert!(!verify_bearer(b"s3cret", Some("Bearer s3cret-and-more")));
    }
}
