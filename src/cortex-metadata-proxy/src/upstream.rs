//! Outbound transport to the metadata server.
//!
//! Allowed requests are re-targeted at the configured upstream with their
//! canonical path. The outbound path and query are re-encoded from the same
//! decoded values the policy checked. Headers pass through except the
//! trust-boundary header and hop-by-hop headers.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderName};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::debug;
use url::Url;

use super::{
    MetadataProxyError, Result, config::ProxyConfig, header::TRUST_BOUNDARY_HEADER,
    path::CanonicalPath,
};

/// Body type of outbound requests.
pub type UpstreamBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Headers that describe a single hop and never cross the proxy.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// HTTP client bound to one metadata server.
#[derive(Debug, Clone)]
pub struct UpstreamTransport {
    client: Client<HttpConnector, UpstreamBody>,
    base: Url,
    authority: String,
}

impl UpstreamTransport {
    /// Create a transport for the upstream in `config`.
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let base = Url::parse(&config.upstream_base()?)
            .map_err(|e| MetadataProxyError::Config(format!("invalid upstream_url: {}", e)))?;
        let authority = match (base.host_str(), base.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(MetadataProxyError::Config(
                    "upstream_url has no host".to_string(),
                ));
            }
        };

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.write_timeout()));
        connector.set_keepalive(Some(config.tcp_keepalive()));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_connections)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Ok(Self {
            client,
            base,
            authority,
        })
    }

    /// The upstream base URL.
    pub fn base(&self) -> &str {
        self.base.as_str()
    }

    /// The outbound URI for a canonical path and raw query.
    ///
    /// Each path segment is percent-encoded on its own, so the upstream
    /// decodes exactly the canonical path. The query is rebuilt from its
    /// decoded pairs, so the upstream sees only the keys that were checked.
    pub fn upstream_uri(&self, path: &CanonicalPath, raw_query: Option<&str>) -> Result<Uri> {
        let mut path_and_query = encode_path(path.as_str());
        if let Some(query) = raw_query.map(encode_query).filter(|q| !q.is_empty()) {
            path_and_query.push('?');
            path_and_query.push_str(&query);
        }

        Uri::builder()
            .scheme(self.base.scheme())
            .authority(self.authority.as_str())
            .path_and_query(path_and_query.as_str())
            .build()
            .map_err(|e| {
                MetadataProxyError::Internal(format!("upstream uri {}: {}", path_and_query, e))
            })
    }

    /// Forward a request to the metadata server under its canonical path.
    ///
    /// The inbound method, body and end-to-end headers are kept. The
    /// response is returned as-is for the caller to stream.
    pub async fn round_trip(
        &self,
        req: Request<UpstreamBody>,
        path: &CanonicalPath,
    ) -> Result<Response<Incoming>> {
        let (mut parts, body) = req.into_parts();

        parts.uri = self.upstream_uri(path, parts.uri.query())?;
        strip_forwarding_headers(&mut parts.headers);
        // The client derives Host from the upstream URI.
        parts.headers.remove(header::HOST);

        debug!(uri = %parts.uri, method = %parts.method, "Forwarding to metadata server");

        self.client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| MetadataProxyError::Upstream(e.to_string()))
    }
}

fn encode_path(path: &str) -> String {
    let encoded = path
        .split('/')
        .map(urlencoding::encode)
        .collect::<Vec<_>>()
        .join("/");

    if encoded.starts_with('/') {
        encoded
    } else {
        format!("/{}", encoded)
    }
}

fn encode_query(raw_query: &str) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in url::form_urlencoded::parse(raw_query.as_bytes()) {
        serializer.append_pair(&key, &value);
    }
    serializer.finish()
}

/// Remove the trust-boundary header and every hop-by-hop header, including
/// those named in `Connection`.
pub fn strip_forwarding_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
    headers.remove(&TRUST_BOUNDARY_HEADER);
}
