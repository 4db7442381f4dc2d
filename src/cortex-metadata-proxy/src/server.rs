//! Proxy and metrics listeners.
//!
//! [`MetadataProxy`] owns everything a connection needs: the policy engine,
//! the upstream transport, the buffer pool, the admission limiter and the
//! outcome sink. It is shared by reference between connection tasks.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{
    Result,
    body::PooledBody,
    config::ProxyConfig,
    limiter::AdmissionLimiter,
    metrics::{OutcomeRecord, OutcomeSink, RequestCounter},
    path::CanonicalPath,
    policy::{FilterError, FilterVerdict, PolicyEngine},
    pool::BufferPool,
    target::IncomingRequest,
    upstream::{UpstreamTransport, strip_forwarding_headers},
};

/// Body type of every response the proxy writes.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// hyper refuses read buffers smaller than this.
const MIN_BUF_SIZE: usize = 8192;

/// Back-off after a failed `accept`.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(50);

const METRICS_PATH: &str = "/metrics";

const FORWARD_FAILED: &str = "Metadata proxy failed to forward request.";
const UPSTREAM_TIMED_OUT: &str = "Metadata server did not answer in time.";

/// The filtering proxy.
pub struct MetadataProxy {
    config: ProxyConfig,
    policy: PolicyEngine,
    upstream: UpstreamTransport,
    pool: BufferPool,
    limiter: AdmissionLimiter,
    outcomes: Arc<dyn OutcomeSink>,
}

impl std::fmt::Debug for MetadataProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataProxy")
            .field("listen_addr", &self.config.listen_addr)
            .field("upstream", &self.upstream.base())
            .field("path_matching", &self.policy.matching())
            .field("max_connections", &self.limiter.capacity())
            .finish()
    }
}

impl MetadataProxy {
    /// Build a proxy from a validated config.
    pub fn new(config: ProxyConfig, outcomes: Arc<dyn OutcomeSink>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            policy: PolicyEngine::new(config.path_matching)?,
            upstream: UpstreamTransport::new(&config)?,
            pool: BufferPool::new(config.max_connections),
            limiter: AdmissionLimiter::new(config.max_connections),
            outcomes,
            config,
        })
    }

    /// The proxy configuration.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// The decision engine.
    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    /// The admission limiter.
    pub fn limiter(&self) -> &AdmissionLimiter {
        &self.limiter
    }

    /// The response buffer pool.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Handle one request: decide, then either deny locally or forward.
    ///
    /// Always produces a response and exactly one outcome record.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + 'static,
    {
        info!(method = %req.method(), path = %req.uri().path(), "Metadata request");

        let verdict = self.policy.evaluate(&IncomingRequest::from_request(&req));
        let (response, outcome) = match verdict {
            FilterVerdict::Deny(e) => {
                info!(path = %req.uri().path(), category = %e.category(), "Request blocked");
                let response = deny_response(&e);
                let outcome = OutcomeRecord::blocked(response.status().as_u16());
                (response, outcome)
            }
            FilterVerdict::Allow(path) => {
                let response = self.forward(req, path).await;
                let outcome = OutcomeRecord::proxied(response.status().as_u16());
                (response, outcome)
            }
        };

        self.outcomes.record(&outcome);
        response
    }

    /// Forward an allowed request and stream the answer through a pooled
    /// buffer. Upstream failures become gateway errors; nothing is retried.
    async fn forward<B>(&self, req: Request<B>, path: CanonicalPath) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + 'static,
    {
        let slot = match self.pool.acquire().await {
            Ok(slot) => slot,
            Err(e) => {
                error!(error = %e, "No response buffer available");
                return text_response(StatusCode::BAD_GATEWAY, FORWARD_FAILED);
            }
        };

        let req = req.map(|body| body.boxed_unsync());
        let round_trip = self.upstream.round_trip(req, &path);

        match tokio::time::timeout(self.config.write_timeout(), round_trip).await {
            Ok(Ok(response)) => {
                let (mut parts, body) = response.into_parts();
                strip_forwarding_headers(&mut parts.headers);
                debug!(path = %path, status = parts.status.as_u16(), "Proxied");
                Response::from_parts(parts, PooledBody::new(body, slot).boxed_unsync())
            }
            Ok(Err(e)) => {
                warn!(path = %path, error = %e, "Upstream request failed");
                text_response(StatusCode::BAD_GATEWAY, FORWARD_FAILED)
            }
            Err(_) => {
                warn!(
                    path = %path,
                    timeout_secs = self.config.write_timeout_secs,
                    "Upstream request timed out"
                );
                text_response(StatusCode::GATEWAY_TIMEOUT, UPSTREAM_TIMED_OUT)
            }
        }
    }

    /// Accept connections until `shutdown` resolves, then give in-flight
    /// connections up to the write timeout to finish.
    ///
    /// A slot is taken from the admission limiter before each accept, so
    /// connections beyond the limit wait in the listen backlog.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        if let Ok(addr) = listener.local_addr() {
            info!(
                addr = %addr,
                max_connections = self.limiter.capacity(),
                "Metadata proxy listening"
            );
        }

        loop {
            let permit = tokio::select! {
                permit = self.limiter.admit() => permit?,
                _ = &mut shutdown => break,
            };

            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };

            if let Err(e) = configure_tcp_stream(&stream, self.config.tcp_keepalive()) {
                warn!(peer = %peer, error = %e, "Failed to configure socket");
            }

            let proxy = Arc::clone(&self);
            let stop = stop_rx.clone();
            tokio::spawn(async move {
                proxy.serve_connection(stream, peer, stop).await;
                drop(permit);
            });
        }

        info!(in_flight = self.limiter.in_flight(), "Stopping metadata proxy");
        let _ = stop_tx.send(true);

        let grace = self.config.write_timeout();
        if tokio::time::timeout(grace, self.limiter.drain()).await.is_err() {
            warn!(
                in_flight = self.limiter.in_flight(),
                "Shutdown timeout reached, dropping connections"
            );
        }
        Ok(())
    }

    async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        stop: watch::Receiver<bool>,
    ) {
        let proxy = Arc::clone(&self);
        let service = service_fn(move |req| {
            let proxy = Arc::clone(&proxy);
            async move { Ok::<_, Infallible>(proxy.handle(req).await) }
        });

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(self.config.read_timeout())
            .max_buf_size(self.config.max_header_bytes.max(MIN_BUF_SIZE));

        let conn = builder.serve_connection(TokioIo::new(stream), service);
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(peer = %peer, error = %e, "Connection closed with error");
                }
            }
            _ = stopped(stop) => {
                conn.as_mut().graceful_shutdown();
                if let Err(e) = conn.await {
                    debug!(peer = %peer, error = %e, "Connection closed during shutdown");
                }
            }
        }
    }
}

/// Run the proxy, and the metrics listener if configured, until `shutdown`
/// resolves.
pub async fn run_with_shutdown<F>(config: ProxyConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let counter = Arc::new(RequestCounter::new());
    let metrics_addr = config.metrics_addr.clone();
    let listen_addr = config.listen_socket_addr()?;
    let proxy = Arc::new(MetadataProxy::new(config, counter.clone())?);

    let (stop_tx, stop_rx) = watch::channel(false);

    let metrics_task = match metrics_addr {
        Some(addr) => {
            let listener = TcpListener::bind(&addr).await?;
            let stop = stop_rx.clone();
            Some(tokio::spawn(serve_metrics(listener, counter, stopped(stop))))
        }
        None => None,
    };

    let listener = TcpListener::bind(listen_addr).await?;
    let result = proxy
        .serve(listener, async move {
            shutdown.await;
            let _ = stop_tx.send(true);
        })
        .await;

    if let Some(task) = metrics_task {
        match task.await {
            Ok(Err(e)) => warn!(error = %e, "Metrics listener failed"),
            Err(e) => warn!(error = %e, "Metrics listener task failed"),
            Ok(Ok(())) => {}
        }
    }

    result
}

/// Serve the request counter as Prometheus text on `GET /metrics` until
/// `shutdown` resolves. Every other request gets a 404.
pub async fn serve_metrics<F>(
    listener: TcpListener,
    counter: Arc<RequestCounter>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Metrics listening");
    }

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept metrics connection");
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        let counter = Arc::clone(&counter);
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = metrics_response(&counter, &req);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(peer = %peer, error = %e, "Metrics connection closed with error");
            }
        });
    }

    Ok(())
}

fn metrics_response<B>(counter: &RequestCounter, req: &Request<B>) -> Response<Full<Bytes>> {
    let found = req.uri().path() == METRICS_PATH
        && (req.method() == Method::GET || req.method() == Method::HEAD);

    let (status, body) = if found {
        (StatusCode::OK, counter.export_prometheus())
    } else {
        (StatusCode::NOT_FOUND, "404 page not found\n".to_string())
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    let content_type = if found {
        "text/plain; version=0.0.4; charset=utf-8"
    } else {
        "text/plain; charset=utf-8"
    };
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// The 403 response for a denied request. The body is the deny message.
pub fn deny_response(err: &FilterError) -> Response<ProxyBody> {
    text_response(StatusCode::FORBIDDEN, &err.to_string())
}

fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("{}\n", message)))
        .map_err(|never: Infallible| match never {})
        .boxed_unsync();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

fn configure_tcp_stream(stream: &TcpStream, keepalive: Duration) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let socket = socket2::SockRef::from(stream);
    socket.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(keepalive))?;
    Ok(())
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::FilterResult;
    use http_body_util::Empty;

    fn proxy(counter: Arc<RequestCounter>) -> MetadataProxy {
        let config = ProxyConfig::builder()
            .listen_addr("127.0.0.1:0")
            .without_metrics()
            .upstream_url("http://127.0.0.1:9")
            .max_connections(4)
            .build();
        MetadataProxy::new(config, counter).unwrap()
    }

    fn get(target: &str) -> Request<ProxyBody> {
        Request::builder()
            .method(Method::GET)
            .uri(target)
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync())
            .unwrap()
    }

    async fn body_text(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_concealed_request_blocked() {
        let counter = Arc::new(RequestCounter::new());
        let proxy = proxy(counter.clone());

        let response = proxy.handle(get("/computeMetadata/v1/instance/attributes/kube-env")).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            response.headers().get(header::X_CONTENT_TYPE_OPTIONS).unwrap(),
            "nosniff"
        );
        assert_eq!(body_text(response).await, "This metadata endpoint is concealed.\n");
        assert_eq!(counter.count(FilterResult::Blocked, 403), 1);
        assert_eq!(counter.count(FilterResult::Proxied, 403), 0);
    }

    #[tokio::test]
    async fn test_header_violation_blocked() {
        let counter = Arc::new(RequestCounter::new());
        let proxy = proxy(counter.clone());

        let mut req = get("/computeMetadata/v1/");
        req.headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        let response = proxy.handle(req).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_text(response).await,
            "Calls with X-Forwarded-For header are not allowed by the metadata proxy.\n"
        );
        assert_eq!(counter.total(), 1);
    }

    #[tokio::test]
    async fn test_deny_never_takes_buffer() {
        let counter = Arc::new(RequestCounter::new());
        let proxy = proxy(counter.clone());

        for target in [
            "/0.2/",
            "/computeMetadata/v1/?recursive=true",
            "/computeMetadata/v1/?foo=1",
        ] {
            let response = proxy.handle(get(target)).await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "target {:?}", target);
        }
        assert_eq!(proxy.pool().available(), 4);
        assert_eq!(counter.count(FilterResult::Blocked, 403), 3);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let counter = Arc::new(RequestCounter::new());
        let proxy = proxy(counter.clone());

        let response = proxy.handle(get("/computeMetadata/v1/project/project-id")).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(counter.count(FilterResult::Proxied, 502), 1);
        assert_eq!(proxy.pool().available(), 4);
    }

    #[test]
    fn test_metrics_response_routes() {
        let counter = RequestCounter::new();
        counter.record(&OutcomeRecord::blocked(403));

        let req = Request::get("/metrics").body(()).unwrap();
        let ok = metrics_response(&counter, &req);
        assert_eq!(ok.status(), StatusCode::OK);

        let req = Request::get("/").body(()).unwrap();
        assert_eq!(metrics_response(&counter, &req).status(), StatusCode::NOT_FOUND);

        let req = Request::post("/metrics").body(()).unwrap();
        assert_eq!(metrics_response(&counter, &req).status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_connection_futures_are_send() {
        fn assert_send<T: Send>(_: &T) {}

        let proxy = Arc::new(proxy(Arc::new(RequestCounter::new())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let serve = Arc::clone(&proxy).serve(listener, std::future::pending::<()>());
        assert_send(&serve);

        let client = TcpStream::connect(addr).await.unwrap();
        let connection = Arc::clone(&proxy).serve_connection(client, addr, stop_rx);
        assert_send(&connection);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ProxyConfig::builder().max_connections(0).build();
        assert!(MetadataProxy::new(config, Arc::new(RequestCounter::new())).is_err());
    }
}
