//! Query-parameter policy.
//!
//! Keys are percent-decoded before any check, so `%72%65%63%75%72%73%69%76%65`
//! is `recursive`, and `nonrecursive` is its own (unknown) key.

use std::collections::BTreeSet;

use super::path::CanonicalPath;
use super::policy::FilterError;
use super::rules::{ALLOWED_QUERY_KEYS, RECURSIVE_KEY, RuleSet};

/// The distinct decoded keys of a query string. Case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryKeySet(BTreeSet<String>);

impl QueryKeySet {
    /// Decode the keys of a raw query string (without the leading `?`).
    pub fn parse(raw_query: &str) -> Self {
        Self(
            url::form_urlencoded::parse(raw_query.as_bytes())
                .map(|(key, _)| key.into_owned())
                .collect(),
        )
    }

    /// Check whether a key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    /// Iterate keys in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if no keys are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Allowlist check for query keys.
#[derive(Debug, Clone)]
pub struct QueryPolicy {
    allowed_keys: BTreeSet<String>,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            allowed_keys: ALLOWED_QUERY_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl QueryPolicy {
    /// Create the policy over the static allowlist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a key set against the policy for a canonical path.
    ///
    /// `recursive` is checked first and only passes on whitelisted
    /// service-account listings; every other key must be allowlisted.
    /// Unknown keys are reported in sorted order, first one wins.
    pub fn check(
        &self,
        keys: &QueryKeySet,
        path: &CanonicalPath,
        rules: &RuleSet,
    ) -> Result<(), FilterError> {
        if keys.contains(RECURSIVE_KEY) && !rules.allows_recursive(path.as_str()) {
            return Err(FilterError::RecursiveNotAllowed);
        }

        match keys
            .iter()
            .find(|key| *key != RECURSIVE_KEY && !self.allowed_keys.contains(*key))
        {
            Some(key) => Err(FilterError::QueryKeyNotAllowed(key.to_string())),
            None => Ok(()),
        }
    }
}
