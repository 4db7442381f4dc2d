//! Request-target parsing.
//!
//! Turns the raw request-target of an HTTP request line into a
//! percent-decoded path and the raw query string. Targets that cannot be
//! interpreted as a hierarchical path fail here, before any policy runs.

use std::borrow::Cow;

use hyper::{HeaderMap, Method, Request};

use super::policy::FilterError;

/// The parts of an inbound request the decision pipeline looks at.
#[derive(Debug, Clone)]
pub struct IncomingRequest<'a> {
    /// Request method.
    pub method: &'a Method,

    /// Raw request-target, as it appeared on the request line.
    pub target: Cow<'a, str>,

    /// Request headers.
    pub headers: &'a HeaderMap,
}

impl<'a> IncomingRequest<'a> {
    /// Build a request view from its parts.
    pub fn new(
        method: &'a Method,
        target: impl Into<Cow<'a, str>>,
        headers: &'a HeaderMap,
    ) -> Self {
        Self {
            method,
            target: target.into(),
            headers,
        }
    }

    /// Borrow the parts of a hyper request.
    pub fn from_request<B>(req: &'a Request<B>) -> Self {
        let uri = req.uri();
        let target = if uri.scheme().is_some() || uri.authority().is_some() {
            Cow::Owned(uri.to_string())
        } else {
            Cow::Borrowed(uri.path_and_query().map(|pq| pq.as_str()).unwrap_or(""))
        };

        Self::new(req.method(), target, req.headers())
    }
}

/// A parsed request-target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    /// Percent-decoded path.
    pub path: String,

    /// Raw query string without the leading `?`.
    pub raw_query: Option<String>,
}

impl RequestTarget {
    /// Parse a raw request-target.
    ///
    /// Accepts origin-form (`/a/b?q`), absolute-form (`http://host/a/b?q`)
    /// and the empty target. An opaque target (`scheme:rest` with no
    /// hierarchical part), an invalid scheme, or a path that does not
    /// percent-decode to UTF-8 is a [`FilterError::ParseError`].
    pub fn parse(raw: &str) -> Result<Self, FilterError> {
        let raw = raw.split_once('#').map(|(before, _)| before).unwrap_or(raw);
        let (before_query, raw_query) = match raw.split_once('?') {
            Some((before, query)) => (before, Some(query.to_string())),
            None => (raw, None),
        };

        let raw_path = strip_scheme_and_authority(before_query)?;
        let path = decode_path(raw_path)?;

        Ok(Self { path, raw_query })
    }

    /// Whether the decoded path ended in a separator.
    pub fn has_trailing_slash(&self) -> bool {
        self.path.ends_with('/')
    }
}

/// Return the path part of a target, rejecting opaque forms.
fn strip_scheme_and_authority(target: &str) -> Result<&str, FilterError> {
    if target.is_empty() || target.starts_with('/') {
        return Ok(target);
    }

    let first_segment = target.split('/').next().unwrap_or(target);
    let Some((scheme, rest)) = first_segment
        .split_once(':')
        .map(|(scheme, _)| (scheme, &target[scheme.len() + 1..]))
    else {
        // Relative reference with no scheme; matched as-is and denied later.
        return Ok(target);
    };

    if !is_valid_scheme(scheme) {
        return Err(FilterError::ParseError);
    }

    if let Some(after_slashes) = rest.strip_prefix("//") {
        return Ok(after_slashes
            .find('/')
            .map(|idx| &after_slashes[idx..])
            .unwrap_or(""));
    }

    if rest.starts_with('/') {
        return Ok(rest);
    }

    Err(FilterError::ParseError)
}

fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// Percent-decode a path, rejecting malformed escapes and non-UTF-8 output.
///
/// A decoded backslash or control character is also a parse error, since
/// upstream URL handling may treat `\` as `/` or drop tab and newline.
fn decode_path(raw: &str) -> Result<String, FilterError> {
    let bytes = raw.as_bytes();
    let mut idx = 0;
    while let Some(offset) = bytes[idx..].iter().position(|b| *b == b'%') {
        let start = idx + offset;
        let escape = bytes
            .get(start + 1..start + 3)
            .ok_or(FilterError::ParseError)?;
        if !escape.iter().all(u8::is_ascii_hexdigit) {
            return Err(FilterError::ParseError);
        }
        idx = start + 3;
    }

    let decoded = urlencoding::decode(raw).map_err(|_| FilterError::ParseError)?;
    if decoded.chars().any(|c| c == '\\' || c.is_control()) {
        return Err(FilterError::ParseError);
    }
    Ok(decoded.into_owned())
}
