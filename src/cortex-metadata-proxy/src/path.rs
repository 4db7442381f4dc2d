//! Path canonicalization.
//!
//! Every policy match runs against the canonical form of a path, so that
//! `attributes//kube-env` and `attributes/../attributes/kube-env` are the
//! same resource as `attributes/kube-env`.

/// A normalized request path used for all policy matching.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct CanonicalPath(String);

impl CanonicalPath {
    /// Get the canonical path string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the inner string.
    pub fn into_string(self) -> String {
        self.0
    }

    /// Whether the path is empty (the bare discovery root).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CanonicalPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Canonicalize a percent-decoded path.
///
/// Dot segments are resolved and repeated separators collapsed. `""` stays
/// `""` and `/` stays `/`. If the input ended in `/`, so does the output.
pub fn canonicalize(path: &str) -> CanonicalPath {
    if path.is_empty() {
        return CanonicalPath(String::new());
    }

    let mut cleaned = clean(path);
    if path.ends_with('/') && !cleaned.ends_with('/') {
        cleaned.push('/');
    }

    CanonicalPath(cleaned)
}

/// Lexical path cleaning.
///
/// Returns the shortest path equivalent to `path`:
/// 1. Replace multiple separators with one.
/// 2. Drop each `.` element.
/// 3. Drop each `..` together with the element before it.
/// 4. Drop `..` elements at the start of a rooted path.
///
/// The result has no trailing separator unless it is `/`, and an empty
/// result becomes `.`.
fn clean(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                _ if rooted => {}
                _ => segments.push(".."),
            },
            _ => segments.push(segment),
        }
    }

    let joined = segments.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}
