//! Policy engine for metadata requests.

use thiserror::Error;
use tracing::debug;

use super::{
    Result,
    config::PathMatching,
    header::check_headers,
    path::{CanonicalPath, canonicalize},
    query::{QueryKeySet, QueryPolicy},
    rules::RuleSet,
    target::{IncomingRequest, RequestTarget},
};

/// Category of a denied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenyCategory {
    /// The request carries the trust-boundary header.
    HeaderViolation,

    /// The request-target cannot be safely interpreted.
    ParseError,

    /// Unknown query key, or `recursive` outside its whitelist.
    QueryViolation,

    /// The path exposes a secret.
    Concealed,

    /// The path is not part of a recognized API version.
    ApiNotAllowed,
}

impl std::fmt::Display for DenyCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyCategory::HeaderViolation => write!(f, "header_violation"),
            DenyCategory::ParseError => write!(f, "parse_error"),
            DenyCategory::QueryViolation => write!(f, "query_violation"),
            DenyCategory::Concealed => write!(f, "concealed"),
            DenyCategory::ApiNotAllowed => write!(f, "api_not_allowed"),
        }
    }
}

/// Why a request was denied. The message is written to the caller as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("Calls with X-Forwarded-For header are not allowed by the metadata proxy.")]
    HeaderViolation,

    #[error("Metadata proxy could not safely parse request.")]
    ParseError,

    #[error("?recursive calls are not allowed by the metadata proxy.")]
    RecursiveNotAllowed,

    #[error("Query parameter {0:?} is not allowed by the metadata proxy.")]
    QueryKeyNotAllowed(String),

    #[error("This metadata endpoint is concealed.")]
    Concealed,

    #[error("This metadata API is not allowed by the metadata proxy.")]
    ApiNotAllowed,
}

impl FilterError {
    /// The deny category.
    pub fn category(&self) -> DenyCategory {
        match self {
            FilterError::HeaderViolation => DenyCategory::HeaderViolation,
            FilterError::ParseError => DenyCategory::ParseError,
            FilterError::RecursiveNotAllowed | FilterError::QueryKeyNotAllowed(_) => {
                DenyCategory::QueryViolation
            }
            FilterError::Concealed => DenyCategory::Concealed,
            FilterError::ApiNotAllowed => DenyCategory::ApiNotAllowed,
        }
    }
}

/// Verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Forward the request with this path.
    Allow(CanonicalPath),

    /// Reject the request.
    Deny(FilterError),
}

impl FilterVerdict {
    /// Check if the verdict allows the request.
    pub fn is_allowed(&self) -> bool {
        matches!(self, FilterVerdict::Allow(_))
    }

    /// Check if the verdict denies the request.
    pub fn is_denied(&self) -> bool {
        matches!(self, FilterVerdict::Deny(_))
    }
}

impl From<std::result::Result<CanonicalPath, FilterError>> for FilterVerdict {
    fn from(result: std::result::Result<CanonicalPath, FilterError>) -> Self {
        match result {
            Ok(path) => FilterVerdict::Allow(path),
            Err(e) => FilterVerdict::Deny(e),
        }
    }
}

/// Decision engine over the static rule tables.
///
/// Holds no mutable state; one instance is shared by every connection.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    /// Compiled rule tables.
    rules: RuleSet,

    /// Query-key allowlist.
    query_policy: QueryPolicy,
}

impl PolicyEngine {
    /// Create a policy engine under a path matching policy.
    pub fn new(matching: PathMatching) -> Result<Self> {
        let rules = RuleSet::new(matching)?;
        debug!(matching = %matching, "Compiled metadata rule tables");

        Ok(Self {
            rules,
            query_policy: QueryPolicy::new(),
        })
    }

    /// The path matching policy in effect.
    pub fn matching(&self) -> PathMatching {
        self.rules.matching()
    }

    /// Decide a request.
    ///
    /// Order matters: header, then target parsing and canonicalization,
    /// then query keys, then endpoint classification. The first failure
    /// wins and nothing after it runs.
    pub fn filter(
        &self,
        req: &IncomingRequest<'_>,
    ) -> std::result::Result<CanonicalPath, FilterError> {
        check_headers(req.headers)?;

        let target = RequestTarget::parse(&req.target)?;
        let path = canonicalize(&target.path);

        if let Some(raw_query) = &target.raw_query {
            self.query_policy
                .check(&QueryKeySet::parse(raw_query), &path, &self.rules)?;
        }

        self.classify(&path)?;
        Ok(path)
    }

    /// Decide a request, as a verdict.
    pub fn evaluate(&self, req: &IncomingRequest<'_>) -> FilterVerdict {
        FilterVerdict::from(self.filter(req))
    }

    /// Classify a canonical path.
    ///
    /// Order matters for security:
    /// 1) concealed endpoints, 2) concealed patterns, 3) discovery
    /// endpoints, 4) known API prefixes. Anything else is an unknown API,
    /// whose paths we cannot vouch for, so it is denied.
    pub fn classify(&self, path: &CanonicalPath) -> std::result::Result<(), FilterError> {
        let path = path.as_str();

        if self.rules.is_concealed_endpoint(path) || self.rules.matches_concealed_pattern(path) {
            return Err(FilterError::Concealed);
        }

        if self.rules.is_discovery_endpoint(path) || self.rules.has_known_prefix(path) {
            return Ok(());
        }

        Err(FilterError::ApiNotAllowed)
    }
}
