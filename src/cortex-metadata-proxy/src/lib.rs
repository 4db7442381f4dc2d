//! Filtering proxy for the instance metadata server.
//!
//! This crate sits between untrusted local processes and the link-local
//! metadata server. It implements:
//! - Request-target parsing and path canonicalization (traversal, doubled
//!   separators and percent-encoding all resolve to one canonical path)
//! - A query-parameter allowlist with a narrow `?recursive` whitelist
//! - Rejection of requests that already carry `X-Forwarded-For`
//! - Endpoint classification: concealed, discovery, known API prefix, or denied
//! - A bounded forwarding pipeline: admission limiting, pooled 32 KiB
//!   buffers, and per-request outcome accounting
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     MetadataProxy (server)                    │
//! │  AdmissionLimiter ─► accept ─► per-connection task            │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                     PolicyEngine                        │  │
//! │  │  header ─► target/path ─► query ─► classifier           │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │       Allow ─► UpstreamTransport + BufferPool ─► caller       │
//! │       Deny  ─► 403 + message                                  │
//! │  RequestCounter: (filter_result, code) ─► /metrics            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use cortex_metadata_proxy::{IncomingRequest, PathMatching, PolicyEngine};
//!
//! let policy = PolicyEngine::new(PathMatching::CaseSensitive)?;
//! let headers = hyper::HeaderMap::new();
//! let request = IncomingRequest::new(&hyper::Method::GET, "/computeMetadata/v1/", &headers);
//!
//! let path = policy.filter(&request)?;
//! assert_eq!(path.as_str(), "/computeMetadata/v1/");
//! ```

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod body;
pub mod config;
pub mod header;
pub mod limiter;
pub mod metrics;
pub mod path;
pub mod policy;
pub mod pool;
pub mod query;
pub mod rules;
pub mod server;
pub mod target;
pub mod upstream;

pub use body::PooledBody;
pub use config::{PathMatching, ProxyConfig, ProxyConfigBuilder};
pub use header::{TRUST_BOUNDARY_HEADER, check_headers};
pub use limiter::{AdmissionLimiter, AdmissionPermit};
pub use metrics::{FilterResult, OutcomeRecord, OutcomeSink, RequestCounter};
pub use path::{CanonicalPath, canonicalize};
pub use policy::{DenyCategory, FilterError, FilterVerdict, PolicyEngine};
pub use pool::{BUFFER_SIZE, BufferPool, BufferSlot};
pub use query::{QueryKeySet, QueryPolicy};
pub use server::{MetadataProxy, ProxyBody, deny_response, run_with_shutdown, serve_metrics};
pub use target::{IncomingRequest, RequestTarget};
pub use upstream::{UpstreamBody, UpstreamTransport, strip_forwarding_headers};

use thiserror::Error;

/// Errors for the metadata proxy runtime.
///
/// Policy denials are not errors of this type; they are [`FilterError`]s
/// and always end in a 403 response.
#[derive(Debug, Error)]
pub enum MetadataProxyError {
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule pattern failed to compile.
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// The metadata server could not be reached or answered badly.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MetadataProxyError>;
