//! Metadata proxy configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{MetadataProxyError, Result};

/// How the endpoint classifier compares paths against its rule tables.
///
/// Some deployments must treat `/computeMetadata/` and `/COMPUTEMETADATA/`
/// as the same resource; others must not. Every exact, prefix and pattern
/// match consults this one switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathMatching {
    /// Paths match rules byte for byte.
    #[default]
    CaseSensitive,

    /// Paths are ASCII case-folded before matching.
    CaseInsensitive,
}

impl PathMatching {
    /// Whether matching folds ASCII case.
    pub fn folds_case(&self) -> bool {
        matches!(self, PathMatching::CaseInsensitive)
    }

    /// Compare two paths under this policy.
    pub fn exact_eq(&self, path: &str, rule: &str) -> bool {
        match self {
            PathMatching::CaseSensitive => path == rule,
            PathMatching::CaseInsensitive => path.eq_ignore_ascii_case(rule),
        }
    }

    /// Check whether `path` starts with `prefix` under this policy.
    pub fn has_prefix(&self, path: &str, prefix: &str) -> bool {
        match self {
            PathMatching::CaseSensitive => path.starts_with(prefix),
            PathMatching::CaseInsensitive => {
                let (path, prefix) = (path.as_bytes(), prefix.as_bytes());
                path.len() >= prefix.len() && path[..prefix.len()].eq_ignore_ascii_case(prefix)
            }
        }
    }
}

impl std::fmt::Display for PathMatching {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathMatching::CaseSensitive => write!(f, "case-sensitive"),
            PathMatching::CaseInsensitive => write!(f, "case-insensitive"),
        }
    }
}

impl std::str::FromStr for PathMatching {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "case-sensitive" | "sensitive" => Ok(PathMatching::CaseSensitive),
            "case-insensitive" | "insensitive" | "fold" => Ok(PathMatching::CaseInsensitive),
            _ => Err(format!("Unknown path matching policy: {}", s)),
        }
    }
}

/// Configuration for the metadata proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address at which to listen and proxy.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Address at which to publish metrics. `None` disables the listener.
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: Option<String>,

    /// The metadata server every allowed request is sent to.
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,

    /// Maximum number of concurrently served connections.
    /// Also the number of pooled response buffers.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Timeout for reading a request head, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Timeout for producing a response, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Maximum size of a request head in bytes.
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,

    /// Case policy for endpoint matching.
    #[serde(default)]
    pub path_matching: PathMatching,

    /// TCP keep-alive period for accepted connections, in seconds.
    #[serde(default = "default_tcp_keepalive_secs")]
    pub tcp_keepalive_secs: u64,
}

fn default_listen_addr() -> String {
    "127.0.0.1:988".to_string()
}

fn default_metrics_addr() -> Option<String> {
    Some("127.0.0.1:989".to_string())
}

fn default_upstream_url() -> String {
    "http://169.254.169.254".to_string()
}

fn default_max_connections() -> usize {
    100
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_header_bytes() -> usize {
    1 << 20
}

fn default_tcp_keepalive_secs() -> u64 {
    180 // 3 minutes
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
            upstream_url: default_upstream_url(),
            max_connections: default_max_connections(),
            read_timeout_secs: default_timeout_secs(),
            write_timeout_secs: default_timeout_secs(),
            max_header_bytes: default_max_header_bytes(),
            path_matching: PathMatching::default(),
            tcp_keepalive_secs: default_tcp_keepalive_secs(),
        }
    }
}

impl ProxyConfig {
    /// Create a new default config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for configuration.
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::new()
    }

    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Overlay environment variables onto this config.
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(addr) = std::env::var("METADATA_PROXY_ADDR") {
            self.listen_addr = addr;
        }

        if let Ok(addr) = std::env::var("METADATA_PROXY_METRICS_ADDR") {
            self.metrics_addr = if addr.is_empty() { None } else { Some(addr) };
        }

        if let Ok(upstream) = std::env::var("METADATA_PROXY_UPSTREAM") {
            self.upstream_url = upstream;
        }

        if let Ok(matching) = std::env::var("METADATA_PROXY_PATH_MATCHING") {
            self.path_matching = matching.parse().map_err(MetadataProxyError::Config)?;
        }

        Ok(self)
    }

    /// Check the config for values the proxy cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(MetadataProxyError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }

        self.listen_socket_addr()?;
        if let Some(addr) = &self.metrics_addr {
            parse_socket_addr("metrics_addr", addr)?;
        }
        self.upstream_base()?;

        Ok(())
    }

    /// Parsed listen address.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        parse_socket_addr("listen_addr", &self.listen_addr)
    }

    /// The upstream as `http://host[:port]` with any trailing `/` removed.
    ///
    /// Only plain HTTP to a bare authority is accepted; the canonical path
    /// of each allowed request is appended to this base.
    pub fn upstream_base(&self) -> Result<String> {
        let url = url::Url::parse(&self.upstream_url).map_err(|e| {
            MetadataProxyError::Config(format!("invalid upstream_url {}: {}", self.upstream_url, e))
        })?;

        if url.scheme() != "http" {
            return Err(MetadataProxyError::Config(format!(
                "upstream_url must use http, got {}",
                url.scheme()
            )));
        }
        let Some(host) = url.host_str() else {
            return Err(MetadataProxyError::Config(
                "upstream_url has no host".to_string(),
            ));
        };
        if url.path() != "/" || url.query().is_some() {
            return Err(MetadataProxyError::Config(
                "upstream_url must not carry a path or query".to_string(),
            ));
        }

        Ok(match url.port() {
            Some(port) => format!("http://{}:{}", host, port),
            None => format!("http://{}", host),
        })
    }

    /// Get read timeout as Duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Get write timeout as Duration.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Get the TCP keep-alive period as Duration.
    pub fn tcp_keepalive(&self) -> Duration {
        Duration::from_secs(self.tcp_keepalive_secs)
    }
}

fn parse_socket_addr(field: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| MetadataProxyError::Config(format!("invalid {} {}: {}", field, value, e)))
}

/// Builder for ProxyConfig.
#[derive(Debug, Default)]
pub struct ProxyConfigBuilder {
    config: ProxyConfig,
}

impl ProxyConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: ProxyConfig::new(),
        }
    }

    /// Set the proxy listen address.
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the metrics listen address.
    pub fn metrics_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.metrics_addr = Some(addr.into());
        self
    }

    /// Disable the metrics listener.
    pub fn without_metrics(mut self) -> Self {
        self.config.metrics_addr = None;
        self
    }

    /// Set the upstream metadata server URL.
    pub fn upstream_url(mut self, url: impl Into<String>) -> Self {
        self.config.upstream_url = url.into();
        self
    }

    /// Set the admission limit.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set the read timeout in seconds.
    pub fn read_timeout_secs(mut self, secs: u64) -> Self {
        self.config.read_timeout_secs = secs;
        self
    }

    /// Set the write timeout in seconds.
    pub fn write_timeout_secs(mut self, secs: u64) -> Self {
        self.config.write_timeout_secs = secs;
        self
    }

    /// Set the maximum request head size.
    pub fn max_header_bytes(mut self, bytes: usize) -> Self {
        self.config.max_header_bytes = bytes;
        self
    }

    /// Set the path matching policy.
    pub fn path_matching(mut self, matching: PathMatching) -> Self {
        self.config.path_matching = matching;
        self
    }

    /// Build the config.
    pub fn build(self) -> ProxyConfig {
        self.config
    }
}
