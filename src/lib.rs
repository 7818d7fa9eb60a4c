pub mod ca;
pub mod chunked;
pub mod condition;
pub mod config;
mod connect;
pub mod ctx;
pub mod error;
pub mod handler;
pub mod http;
pub mod peek;
pub mod pipeline;
pub mod transport;
mod tunnel;
pub mod wire;

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ::http::header::{CONNECTION, CONTENT_LENGTH, HeaderMap};
use ::http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::Instrument;

pub use ca::{CertificateAuthority, LeafCert};
pub use condition::{Condition, ConditionRef};
pub use ctx::ProxyContext;
pub use error::{Error, Result};
pub use handler::{
    ALWAYS_MITM, ALWAYS_REJECT, ConnectAction, ConnectDecision, ConnectHandler, HijackHandler,
    OK_CONNECT, RequestHandler, ResponseHandler,
};
pub use pipeline::{HandlerPipeline, OnRequest, OnResponse};
pub use transport::{BoxedIo, Dialer, RoundTripper};

use crate::http::{Body, error_response, incoming_to_body, is_websocket_upgrade};
use crate::peek::PeekableReader;
use crate::transport::TransportOptions;

/// Answers requests that are not proxy requests (no absolute URI).
pub type NonProxyHandler = Arc<dyn Fn(Request<Body>) -> Response<Body> + Send + Sync>;

const NON_PROXY_MESSAGE: &str = "This is a proxy server. Does not respond to non-proxy requests.";

/// Request headers that only concern the client-to-proxy hop.
const PROXY_HEADERS: &[&str] = &[
    "accept-encoding",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
];

/// Time limits applied to client and upstream connections.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Reading the first request head and completing a client TLS handshake.
    pub handshake: Duration,
    /// Waiting for the next request in a tunnel, and silence on byte relays.
    pub idle: Duration,
    /// Opening an upstream connection.
    pub connect: Duration,
    /// A whole upstream round trip.
    pub upstream: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            idle: Duration::from_secs(60),
            connect: Duration::from_secs(10),
            upstream: Duration::from_secs(60),
        }
    }
}

/// Builder for configuring a [`Proxy`].
///
/// Handlers can only be registered here: once [`build`](Self::build) is
/// called the chains are frozen.
pub struct ProxyBuilder {
    pub(crate) pipeline: HandlerPipeline,
    ca: Option<CertificateAuthority>,
    round_tripper: Option<Arc<dyn RoundTripper>>,
    dialer: Option<Arc<dyn Dialer>>,
    non_proxy: Option<NonProxyHandler>,
    keep_header: bool,
    keep_destination_headers: bool,
    accept_invalid_upstream_certs: bool,
    timeouts: Timeouts,
}

impl ProxyBuilder {
    /// Set the CA from PEM-encoded strings.
    pub fn ca_pem(mut self, cert_pem: &str, key_pem: &str) -> Result<Self> {
        self.ca = Some(CertificateAuthority::from_pem(cert_pem, key_pem)?);
        Ok(self)
    }

    /// Set the CA from PEM files on disk.
    pub fn ca_pem_files(
        mut self,
        cert_path: impl AsRef<std::path::Path>,
        key_path: impl AsRef<std::path::Path>,
    ) -> Result<Self> {
        self.ca = Some(CertificateAuthority::from_pem_files(cert_path, key_path)?);
        Ok(self)
    }

    /// Set the CA directly.
    pub fn ca(mut self, ca: CertificateAuthority) -> Self {
        self.ca = Some(ca);
        self
    }

    /// Start a request or `CONNECT` registration guarded by `conds`.
    pub fn on_request(self, conds: impl IntoIterator<Item = ConditionRef>) -> OnRequest {
        OnRequest {
            builder: self,
            conds: conds.into_iter().collect(),
        }
    }

    /// Start a response registration guarded by `conds`.
    pub fn on_response(self, conds: impl IntoIterator<Item = ConditionRef>) -> OnResponse {
        OnResponse {
            builder: self,
            conds: conds.into_iter().collect(),
        }
    }

    /// What to do with a `CONNECT` no handler decided on. Defaults to
    /// [`ConnectAction::Reject`].
    pub fn default_connect(mut self, action: ConnectAction) -> Self {
        self.pipeline.set_default_connect(action);
        self
    }

    /// Replace the upstream transport.
    pub fn round_tripper(mut self, rt: impl RoundTripper + 'static) -> Self {
        self.round_tripper = Some(Arc::new(rt));
        self
    }

    /// Replace the dialer used for forwarded tunnels. Defaults to
    /// [`transport::dialer_from_env`]. A dialer that chains through an
    /// upstream proxy also carries the default transport's connections.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Answer requests that are not addressed to a proxy.
    pub fn non_proxy_handler(
        mut self,
        f: impl Fn(Request<Body>) -> Response<Body> + Send + Sync + 'static,
    ) -> Self {
        self.non_proxy = Some(Arc::new(f));
        self
    }

    /// Forward proxy-specific request headers unchanged.
    pub fn keep_header(mut self, keep: bool) -> Self {
        self.keep_header = keep;
        self
    }

    /// Keep headers staged in [`ProxyContext::response_headers`] alongside
    /// the upstream ones.
    pub fn keep_destination_headers(mut self, keep: bool) -> Self {
        self.keep_destination_headers = keep;
        self
    }

    /// Disable upstream TLS certificate verification. Useful for testing with
    /// self-signed upstream servers.
    pub fn danger_accept_invalid_upstream_certs(mut self) -> Self {
        self.accept_invalid_upstream_certs = true;
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Build the proxy.
    pub fn build(self) -> Proxy {
        let opts = TransportOptions {
            connect_timeout: self.timeouts.connect,
            upstream_timeout: self.timeouts.upstream,
            accept_invalid_upstream_certs: self.accept_invalid_upstream_certs,
        };
        // aws-lc-rs supports every default protocol version, so these cannot fail
        let upstream_tls = transport::upstream_tls_config(opts.accept_invalid_upstream_certs)
            .expect("default crypto provider supports TLS 1.2 and 1.3");
        let dialer = self
            .dialer
            .unwrap_or_else(|| transport::dialer_from_env(self.timeouts.connect));
        let round_tripper = match self.round_tripper {
            Some(rt) => rt,
            None => {
                let rt = match dialer.upstream_proxy() {
                    Some(upstream) => {
                        tracing::debug!(%upstream, "round trips go through upstream proxy");
                        transport::dialer_round_tripper(&opts, dialer.clone())
                    }
                    None => transport::default_round_tripper(&opts),
                };
                Arc::new(rt.expect("default crypto provider supports TLS 1.2 and 1.3"))
            }
        };
        let non_proxy = self.non_proxy.unwrap_or_else(|| {
            Arc::new(|_req: Request<Body>| {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, NON_PROXY_MESSAGE)
            })
        });

        Proxy {
            inner: Arc::new(Inner {
                pipeline: self.pipeline,
                ca: self.ca.map(Arc::new),
                round_tripper,
                dialer,
                non_proxy,
                upstream_tls: Arc::new(upstream_tls),
                keep_header: self.keep_header,
                keep_destination_headers: self.keep_destination_headers,
                timeouts: self.timeouts,
            }),
        }
    }
}

struct Inner {
    pipeline: HandlerPipeline,
    ca: Option<Arc<CertificateAuthority>>,
    round_tripper: Arc<dyn RoundTripper>,
    dialer: Arc<dyn Dialer>,
    non_proxy: NonProxyHandler,
    upstream_tls: Arc<ClientConfig>,
    keep_header: bool,
    keep_destination_headers: bool,
    timeouts: Timeouts,
}

/// A configured intercepting forward proxy.
///
/// Cheaply cloneable via an internal `Arc`.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
}

impl Proxy {
    /// Create a new builder.
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder {
            pipeline: HandlerPipeline::new(),
            ca: None,
            round_tripper: None,
            dialer: None,
            non_proxy: None,
            keep_header: false,
            keep_destination_headers: false,
            accept_invalid_upstream_certs: false,
            timeouts: Timeouts::default(),
        }
    }

    pub fn pipeline(&self) -> &HandlerPipeline {
        &self.inner.pipeline
    }

    pub fn ca(&self) -> Option<&Arc<CertificateAuthority>> {
        self.inner.ca.as_ref()
    }

    pub fn round_tripper(&self) -> Arc<dyn RoundTripper> {
        self.inner.round_tripper.clone()
    }

    pub fn dialer(&self) -> &Arc<dyn Dialer> {
        &self.inner.dialer
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.inner.timeouts
    }

    pub(crate) fn upstream_tls(&self) -> Arc<ClientConfig> {
        self.inner.upstream_tls.clone()
    }

    /// Bind to `addr` and run the accept loop.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Accept connections from `listener` until `shutdown` resolves.
    /// Connections already being served are left to finish on their own.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "interpose listening");
        tokio::pin!(shutdown);

        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut shutdown => {
                    tracing::info!("shutting down");
                    return Ok(());
                }
            };
            tracing::debug!(client = %addr, "accepted connection");
            let proxy = self.clone();
            tokio::spawn(async move {
                if let Err(e) = proxy.handle_connection(stream, addr).await {
                    if e.is_disconnect() {
                        tracing::debug!(client = %addr, error = %e, "client went away");
                    } else {
                        tracing::warn!(client = %addr, error = %e, "connection failed");
                    }
                }
            });
        }
    }

    /// Serve one accepted client connection.
    ///
    /// A `CONNECT` as the first request is handled on the raw socket; any
    /// other first request hands the connection to an HTTP/1.1 server loop.
    pub async fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) -> Result<()> {
        let mut reader = PeekableReader::with_capacity(stream, wire::MAX_HEAD + 8 * 1024);
        let sniffed =
            tokio::time::timeout(self.inner.timeouts.handshake, wire::sniff_head(&mut reader, wire::MAX_HEAD))
                .await;
        let len = match sniffed {
            Err(_) => {
                tracing::debug!(client = %client_addr, "no request head before timeout");
                return Ok(());
            }
            Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(len))) => len,
            Ok(Err(Error::HeadTooLarge { .. })) => {
                // let the HTTP server report it
                reader.rewind()?;
                return self.serve_http(reader, client_addr).await;
            }
            Ok(Err(e)) => return Err(e),
        };

        reader.rewind()?;
        let mut raw = vec![0u8; len];
        reader.read_exact(&mut raw).await?;
        match wire::parse_request_head(&raw) {
            Ok(head) if head.method == Method::CONNECT => {
                reader.forget();
                connect::handle_raw(self, head, reader, client_addr).await
            }
            _ => {
                reader.rewind()?;
                self.serve_http(reader, client_addr).await
            }
        }
    }

    async fn serve_http<S>(&self, io: S, client_addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let proxy = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = proxy.clone();
            async move {
                let resp = proxy.serve_request(req.map(incoming_to_body), client_addr).await;
                Ok::<_, Infallible>(resp)
            }
        });

        let conn = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(self.inner.timeouts.handshake)
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();
        if let Err(e) = conn.await {
            if e.is_incomplete_message() || e.is_canceled() {
                tracing::debug!(client = %client_addr, error = %e, "client connection closed");
            } else {
                tracing::warn!(client = %client_addr, error = %e, "error serving client");
            }
        }
        Ok(())
    }

    /// Handle one request received by the HTTP server loop.
    pub async fn serve_request(&self, req: Request<Body>, client_addr: SocketAddr) -> Response<Body> {
        let mut ctx = ProxyContext::new(self.clone(), client_addr);
        let span = ctx.span().clone();

        if req.method() == Method::CONNECT {
            return connect::handle_upgrade(self, req, ctx).instrument(span).await;
        }
        if req.uri().scheme().is_none() {
            tracing::debug!(parent: &span, uri = %req.uri(), "non-proxy request");
            return (self.inner.non_proxy)(req);
        }
        self.proxy_request(req, &mut ctx).instrument(span).await
    }

    /// The request lifecycle shared by plain and intercepted requests:
    /// request chain, upstream round trip, response chain, header relay.
    pub(crate) async fn proxy_request(
        &self,
        req: Request<Body>,
        ctx: &mut ProxyContext,
    ) -> Response<Body> {
        tracing::debug!(method = %req.method(), uri = %req.uri(), "got request");
        let (mut req, short_circuit) = self.inner.pipeline.filter_request(req, ctx).await;

        let upgrade = is_websocket_upgrade(req.headers());
        let mut client_upgrade = None;
        let resp = match short_circuit {
            Some(resp) => Some(resp),
            None => {
                if !self.inner.keep_header {
                    remove_proxy_headers(req.headers_mut(), upgrade);
                }
                if upgrade {
                    client_upgrade = Some(hyper::upgrade::on(&mut req));
                }
                match ctx.round_trip(req).await {
                    Ok(resp) => Some(resp),
                    Err(e) => {
                        tracing::warn!(error = %e, "upstream round trip failed");
                        ctx.error = Some(e);
                        None
                    }
                }
            }
        };
        let shape_before = resp.as_ref().map(body_shape);
        let resp = self.inner.pipeline.filter_response(resp, ctx).await;

        let Some(mut resp) = resp else {
            let message = match &ctx.error {
                Some(e) => e.to_string(),
                None => format!(
                    "error read response {}",
                    ctx.request
                        .as_ref()
                        .and_then(|r| r.authority())
                        .unwrap_or_default()
                ),
            };
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, message);
        };
        tracing::debug!(status = %resp.status(), "received response");

        if shape_before != Some(body_shape(&resp)) {
            drop_replaced_content_length(&mut resp);
        }
        self.copy_headers(&mut resp, ctx);

        if let Some(client_upgrade) = client_upgrade {
            if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
                spawn_upgrade_relay(client_upgrade, &mut resp, self.inner.timeouts.idle);
            }
        }
        resp
    }

    fn copy_headers(&self, resp: &mut Response<Body>, ctx: &mut ProxyContext) {
        let mut headers = std::mem::take(&mut ctx.response_headers);
        if !self.inner.keep_destination_headers {
            headers.clear();
        }
        for (name, value) in resp.headers() {
            headers.append(name.clone(), value.clone());
        }
        *resp.headers_mut() = headers;
    }
}

fn remove_proxy_headers(headers: &mut HeaderMap, keep_connection: bool) {
    for name in PROXY_HEADERS {
        headers.remove(*name);
    }
    if !keep_connection {
        headers.remove(CONNECTION);
    }
}

/// Size bounds of a response body. A response handler that swaps the body
/// almost always changes them; HEAD and 304 bodies are empty either way.
fn body_shape(resp: &Response<Body>) -> (u64, Option<u64>) {
    let hint = hyper::body::Body::size_hint(resp.body());
    (hint.lower(), hint.upper())
}

/// The upstream length no longer describes a body a handler replaced.
fn drop_replaced_content_length(resp: &mut Response<Body>) {
    if resp.headers_mut().remove(CONTENT_LENGTH).is_some() {
        tracing::debug!("body replaced, dropping content-length");
    }
}

fn spawn_upgrade_relay(client: hyper::upgrade::OnUpgrade, resp: &mut Response<Body>, idle: Duration) {
    let upstream = hyper::upgrade::on(resp);
    tokio::spawn(
        async move {
            let (client, upstream) = match tokio::try_join!(client, upstream) {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "websocket upgrade failed");
                    return;
                }
            };
            let mut client = TokioIo::new(client);
            let mut upstream = TokioIo::new(upstream);
            match wire::relay(&mut client, &mut upstream, idle).await {
                Ok((up, down)) => tracing::debug!(up, down, "websocket closed"),
                Err(e) => tracing::debug!(error = %e, "websocket relay ended"),
            }
        }
        .in_current_span(),
    );
}
