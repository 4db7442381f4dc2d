//! Static rule tables and their compiled form.
//!
//! The tables are fixed for the process lifetime. [`RuleSet`] compiles the
//! pattern tables once, under one [`PathMatching`] policy, and is then
//! shared read-only by every connection.

use regex::{Regex, RegexBuilder};

use super::{MetadataProxyError, Result, config::PathMatching};

/// Endpoints that expose long-lived secrets. Never proxied.
pub const CONCEALED_ENDPOINTS: &[&str] = &[
    "/0.1/meta-data/attributes/kube-env",
    "/computeMetadata/v1beta1/instance/attributes/kube-env",
    "/computeMetadata/v1/instance/attributes/kube-env",
];

/// Discovery endpoints, allowed on exact match.
pub const DISCOVERY_ENDPOINTS: &[&str] = &[
    "",
    "/",
    "/0.1",
    "/0.1/",
    "/0.1/meta-data",
    "/computeMetadata",
    "/computeMetadata/",
    "/computeMetadata/v1beta1",
    "/computeMetadata/v1",
];

/// Prefixes of the recognized API versions.
pub const KNOWN_PREFIXES: &[&str] = &[
    "/0.1/meta-data/",
    "/computeMetadata/v1beta1/",
    "/computeMetadata/v1/",
];

/// Roots under which per-version secrets live.
const VERSION_ROOTS: &[&str] = &[
    "/0.1/meta-data",
    "/computeMetadata/v1beta1/instance",
    "/computeMetadata/v1/instance",
];

/// The recursive-expansion query key.
pub const RECURSIVE_KEY: &str = "recursive";

/// Query keys allowed on any path.
pub const ALLOWED_QUERY_KEYS: &[&str] = &[
    "alt",
    "audience",
    "format",
    "last_etag",
    "licenses",
    "scopes",
    "timeout_sec",
    "wait_for_change",
];

/// Concealed path patterns for every recognized API version.
///
/// Service-account identity tokens live at `.../service-accounts/<id>/identity`;
/// the patterns are unanchored, so any path containing that shape matches.
/// `kube-env` with a trailing separator is the same attribute.
pub fn concealed_pattern_sources() -> Vec<String> {
    VERSION_ROOTS
        .iter()
        .flat_map(|root| {
            let root = regex::escape(root);
            [
                format!("{}/service-accounts/.+/identity", root),
                format!("^{}/attributes/kube-env/$", root),
            ]
        })
        .collect()
}

/// Paths on which `?recursive` is permitted: the service-account listing
/// and a single account's listing. Neither expands to a secret value.
pub fn recursive_whitelist_sources() -> Vec<String> {
    VERSION_ROOTS
        .iter()
        .flat_map(|root| {
            let root = regex::escape(root);
            [
                format!("^{}/service-accounts/?$", root),
                format!("^{}/service-accounts/[^/]+/?$", root),
            ]
        })
        .collect()
}

/// A set of compiled path patterns.
#[derive(Debug, Clone, Default)]
pub struct PathPatterns {
    patterns: Vec<Regex>,
}

impl PathPatterns {
    /// Compile pattern sources under a matching policy.
    pub fn compile(sources: &[String], matching: PathMatching) -> Result<Self> {
        let patterns = sources
            .iter()
            .map(|source| {
                RegexBuilder::new(source)
                    .case_insensitive(matching.folds_case())
                    .build()
                    .map_err(|e| MetadataProxyError::InvalidPattern(format!("{}: {}", source, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { patterns })
    }

    /// Check if a path matches any pattern.
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(path))
    }

    /// Number of patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// All rule tables, compiled under one matching policy.
#[derive(Debug, Clone)]
pub struct RuleSet {
    matching: PathMatching,
    concealed_patterns: PathPatterns,
    recursive_whitelist: PathPatterns,
}

impl RuleSet {
    /// Compile the static tables.
    pub fn new(matching: PathMatching) -> Result<Self> {
        Ok(Self {
            matching,
            concealed_patterns: PathPatterns::compile(&concealed_pattern_sources(), matching)?,
            recursive_whitelist: PathPatterns::compile(&recursive_whitelist_sources(), matching)?,
        })
    }

    /// The matching policy these rules were compiled with.
    pub fn matching(&self) -> PathMatching {
        self.matching
    }

    /// Exact match against the concealed endpoints.
    pub fn is_concealed_endpoint(&self, path: &str) -> bool {
        CONCEALED_ENDPOINTS
            .iter()
            .any(|e| self.matching.exact_eq(path, e))
    }

    /// Match against the concealed patterns.
    pub fn matches_concealed_pattern(&self, path: &str) -> bool {
        self.concealed_patterns.matches(path)
    }

    /// Exact match against the discovery endpoints.
    pub fn is_discovery_endpoint(&self, path: &str) -> bool {
        DISCOVERY_ENDPOINTS
            .iter()
            .any(|e| self.matching.exact_eq(path, e))
    }

    /// Prefix match against the known API versions.
    pub fn has_known_prefix(&self, path: &str) -> bool {
        KNOWN_PREFIXES
            .iter()
            .any(|p| self.matching.has_prefix(path, p))
    }

    /// Whether `?recursive` is permitted on this path.
    pub fn allows_recursive(&self, path: &str) -> bool {
        self.recursive_whitelist.matches(path)
    }
}
