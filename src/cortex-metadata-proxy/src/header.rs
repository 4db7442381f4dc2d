//! Trust-boundary header check.

use hyper::HeaderMap;
use hyper::header::HeaderName;

use super::policy::FilterError;

/// The forwarding header the proxy strips from every outbound request.
///
/// A caller that already sends it is either injecting forwarding metadata
/// or came through an untrusted hop, so the request is rejected instead of
/// silently cleaned.
pub const TRUST_BOUNDARY_HEADER: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Reject requests that carry the trust-boundary header, with any value.
pub fn check_headers(headers: &HeaderMap) -> Result<(), FilterError> {
    if headers.contains_key(&TRUST_BOUNDARY_HEADER) {
        return Err(FilterError::HeaderViolation);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_no_headers() {
        assert!(check_headers(&HeaderMap::new()).is_ok());
    }

    #[test]
    fn test_unrelated_header() {
        let mut headers = HeaderMap::new();
        headers.insert("my-header", HeaderValue::from_static("Hello"));
        assert!(check_headers(&headers).is_ok());
    }

    #[test]
    fn test_forwarded_for_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("my-header", HeaderValue::from_static("Hello"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("That other person"));
        assert!(matches!(
            check_headers(&headers),
            Err(FilterError::HeaderViolation)
        ));
    }

    #[test]
    fn test_empty_value_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(""));
        assert!(check_headers(&headers).is_err());
    }
}
