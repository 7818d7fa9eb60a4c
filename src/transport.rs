use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use http::{Request, Response, Uri};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tower::util::BoxCloneService;
use tower::{Service, ServiceBuilder, ServiceExt};

use crate::ctx::ProxyContext;
use crate::http::{Body, BoxError, RequestHead, incoming_to_body};

/// Sends a request to its destination and returns the response.
#[async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(
        &self,
        req: Request<Body>,
        ctx: &ProxyContext,
    ) -> Result<Response<Body>, BoxError>;
}

pub type HttpService = BoxCloneService<Request<Body>, Response<Body>, BoxError>;

/// Adapts any tower HTTP service into a [`RoundTripper`].
pub struct ServiceRoundTripper {
    service: Mutex<HttpService>,
}

impl ServiceRoundTripper {
    pub fn new<S>(service: S) -> Self
    where
        S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        let service = ServiceBuilder::new()
            .map_err(|e: S::Error| -> BoxError { e.into() })
            .service(service);
        Self {
            service: Mutex::new(BoxCloneService::new(service)),
        }
    }
}

#[async_trait]
impl RoundTripper for ServiceRoundTripper {
    async fn round_trip(
        &self,
        req: Request<Body>,
        _ctx: &ProxyContext,
    ) -> Result<Response<Body>, BoxError> {
        let service = self
            .service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let fut: Pin<Box<dyn std::future::Future<Output = Result<Response<Body>, BoxError>> + Send>> =
            Box::pin(service.oneshot(req));
        fut.await
    }
}

/// Settings of the default upstream transport.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub upstream_timeout: Duration,
    pub accept_invalid_upstream_certs: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            upstream_timeout: Duration::from_secs(60),
            accept_invalid_upstream_certs: false,
        }
    }
}

fn into_body_response(resp: Response<Incoming>) -> Response<Body> {
    resp.map(incoming_to_body)
}

/// The default transport: a pooled hyper client speaking HTTP/1.1 over
/// plain TCP or rustls, bounded by the upstream timeout.
pub fn default_round_tripper(opts: &TransportOptions) -> Result<ServiceRoundTripper, rustls::Error> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout(Some(opts.connect_timeout));
    round_tripper_over(opts, http)
}

/// Like [`default_round_tripper`], but every upstream connection is opened
/// by `dialer`. With an [`UpstreamProxyDialer`] plain and intercepted
/// requests are chained through the same proxy as forwarded tunnels.
pub fn dialer_round_tripper(
    opts: &TransportOptions,
    dialer: Arc<dyn Dialer>,
) -> Result<ServiceRoundTripper, rustls::Error> {
    let connect_timeout = opts.connect_timeout;
    let connector = tower::service_fn(move |uri: Uri| {
        let dialer = dialer.clone();
        async move {
            let addr = uri_addr(&uri)?;
            let io = dial_within(dialer.as_ref(), None, &addr, connect_timeout).await?;
            Ok::<_, io::Error>(DialedIo(TokioIo::new(io)))
        }
    });
    round_tripper_over(opts, connector)
}

fn round_tripper_over<C>(opts: &TransportOptions, connector: C) -> Result<ServiceRoundTripper, rustls::Error>
where
    C: Service<Uri> + Clone + Send + Sync + 'static,
    C::Response: Connection + hyper::rt::Read + hyper::rt::Write + Send + Unpin + 'static,
    C::Future: Send + 'static,
    C::Error: Into<BoxError>,
{
    let https = HttpsConnectorBuilder::new()
        .with_tls_config(upstream_tls_config(opts.accept_invalid_upstream_certs)?)
        .https_or_http()
        .enable_http1()
        .wrap_connector(connector);
    let client: Client<_, Body> = Client::builder(TokioExecutor::new()).build(https);

    let service = ServiceBuilder::new()
        .timeout(opts.upstream_timeout)
        .map_response(into_body_response)
        .service(client);
    Ok(ServiceRoundTripper::new(service))
}

/// `host:port` of an absolute URI, with the scheme's default port.
fn uri_addr(uri: &Uri) -> io::Result<String> {
    let host = uri
        .host()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("no host in {uri}")))?;
    let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });
    Ok(format!("{host}:{port}"))
}

/// A dialed stream handed to the hyper client.
pub struct DialedIo(TokioIo<BoxedIo>);

impl Connection for DialedIo {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl hyper::rt::Read for DialedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.get_mut().0), cx, buf)
    }
}

impl hyper::rt::Write for DialedIo {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.get_mut().0), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.get_mut().0), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.get_mut().0), cx)
    }
}

/// rustls client configuration for connections to real servers.
pub fn upstream_tls_config(accept_invalid: bool) -> Result<ClientConfig, rustls::Error> {
    let builder = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()?;
    let config = if accept_invalid {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
            .with_no_client_auth()
    } else {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };
    Ok(config)
}

/// A `ServerCertVerifier` that accepts any certificate. Used when
/// `danger_accept_invalid_upstream_certs` is enabled on the builder.
#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Byte stream the proxy can relay: a socket, a TLS session or an upgraded
/// hyper connection.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// Opens the raw connections used for forwarded tunnels and inner
/// WebSocket upgrades. `addr` is `host:port`.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> io::Result<BoxedIo>;

    /// Dial on behalf of a specific request. Defaults to [`dial`](Self::dial).
    async fn dial_with_request(&self, _head: &RequestHead, addr: &str) -> io::Result<BoxedIo> {
        self.dial(addr).await
    }

    /// `host:port` of the proxy this dialer chains through, if any. The
    /// default transport then opens its connections with this dialer too.
    fn upstream_proxy(&self) -> Option<&str> {
        None
    }
}

/// Dial `addr`, giving up after `limit`.
pub async fn dial_within(
    dialer: &dyn Dialer,
    head: Option<&RequestHead>,
    addr: &str,
    limit: Duration,
) -> io::Result<BoxedIo> {
    let dial = async {
        match head {
            Some(head) => dialer.dial_with_request(head, addr).await,
            None => dialer.dial(addr).await,
        }
    };
    tokio::time::timeout(limit, dial).await.map_err(|_| {
        io::Error::new(io::ErrorKind::TimedOut, format!("dial {addr} timed out"))
    })?
}

/// Direct TCP connections.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    pub connect_timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TcpDialer {
    async fn connect(&self, addr: &str) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, format!("connect to {addr} timed out"))
            })??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<BoxedIo> {
        Ok(Box::new(self.connect(addr).await?))
    }
}

const CONNECT_HEADERS_MAX_SIZE: usize = 8192;
const CONNECT_HEADERS_MAX_COUNT: usize = 32;

/// Tunnels every dial through another HTTP proxy with `CONNECT`.
#[derive(Debug, Clone)]
pub struct UpstreamProxyDialer {
    proxy_addr: String,
    tcp: TcpDialer,
}

impl UpstreamProxyDialer {
    /// `proxy_addr` is the `host:port` of the upstream proxy.
    pub fn new(proxy_addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            tcp: TcpDialer { connect_timeout },
        }
    }

    pub fn proxy_addr(&self) -> &str {
        &self.proxy_addr
    }
}

impl UpstreamProxyDialer {
    async fn handshake(&self, addr: &str) -> io::Result<TcpStream> {
        let mut stream = self.tcp.connect(&self.proxy_addr).await?;

        let request = format!("CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\n\r\n");
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        // read byte by byte so nothing past the head is consumed
        let mut buf = Vec::with_capacity(512);
        let mut one = [0u8; 1];
        loop {
            let n = stream.read(&mut one).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "upstream proxy closed connection before response",
                ));
            }
            buf.push(one[0]);
            if buf.ends_with(b"\r\n\r\n") {
                break;
            }
            if buf.len() > CONNECT_HEADERS_MAX_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "upstream proxy response headers too large",
                ));
            }
        }

        let mut headers = [httparse::EMPTY_HEADER; CONNECT_HEADERS_MAX_COUNT];
        let mut response = httparse::Response::new(&mut headers);
        response
            .parse(&buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let code = response.code.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "empty upstream proxy response")
        })?;
        if !(200..300).contains(&code) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!(
                    "upstream proxy CONNECT failed with status {code}: {}",
                    response.reason.unwrap_or("")
                ),
            ));
        }
        Ok(stream)
    }
}

#[async_trait]
impl Dialer for UpstreamProxyDialer {
    async fn dial(&self, addr: &str) -> io::Result<BoxedIo> {
        // the connect timeout bounds the CONNECT exchange as well
        let stream = tokio::time::timeout(self.tcp.connect_timeout, self.handshake(addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("upstream proxy {} did not answer CONNECT {addr}", self.proxy_addr),
                )
            })??;
        tracing::debug!(proxy = %self.proxy_addr, target = %addr, "tunnel via upstream proxy");
        Ok(Box::new(stream))
    }

    fn upstream_proxy(&self) -> Option<&str> {
        Some(&self.proxy_addr)
    }
}

/// Pick a dialer from `HTTPS_PROXY` / `https_proxy`, falling back to direct
/// TCP.
pub fn dialer_from_env(connect_timeout: Duration) -> Arc<dyn Dialer> {
    let value = std::env::var("HTTPS_PROXY")
        .or_else(|_| std::env::var("https_proxy"))
        .ok();
    dialer_for_proxy(value.as_deref(), connect_timeout)
}

/// Dialer for an optional upstream proxy URL or `host:port`.
pub fn dialer_for_proxy(proxy: Option<&str>, connect_timeout: Duration) -> Arc<dyn Dialer> {
    match proxy.map(str::trim).filter(|p| !p.is_empty()).and_then(proxy_authority) {
        Some(addr) => Arc::new(UpstreamProxyDialer::new(addr, connect_timeout)),
        None => Arc::new(TcpDialer { connect_timeout }),
    }
}

fn proxy_authority(value: &str) -> Option<String> {
    let with_scheme = if value.contains("://") {
        value.to_string()
    } else {
        format!("http://{value}")
    };
    let uri: http::Uri = with_scheme.parse().ok()?;
    let authority = uri.authority()?;
    let port = authority.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });
    Some(format!("{}:{port}", authority.host()))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn proxy_urls_become_authorities() {
        assert_eq!(proxy_authority("http://corp:3128").as_deref(), Some("corp:3128"));
        assert_eq!(proxy_authority("corp.example").as_deref(), Some("corp.example:80"));
        assert_eq!(proxy_authority("https://corp/").as_deref(), Some("corp:443"));
    }

    async fn fake_upstream_proxy(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut first = String::new();
            reader.read_line(&mut first).await.unwrap();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                if line.trim().is_empty() {
                    break;
                }
            }
            let mut stream = reader.into_inner();
            stream.write_all(status_line.as_bytes()).await.unwrap();
            stream.write_all(b"tunnel-bytes").await.unwrap();
            first
        });
        (addr, task)
    }

    #[tokio::test]
    async fn upstream_proxy_dialer_sends_connect() {
        let (addr, task) = fake_upstream_proxy("HTTP/1.1 200 Connection established\r\n\r\n").await;
        let dialer = UpstreamProxyDialer::new(addr, Duration::from_secs(5));
        let mut io = dialer.dial("target.test:443").await.unwrap();
        let mut got = [0u8; 12];
        io.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"tunnel-bytes");
        assert_eq!(task.await.unwrap(), "CONNECT target.test:443 HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn silent_upstream_proxy_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // accept and never answer
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let dialer = UpstreamProxyDialer::new(addr, Duration::from_millis(300));
        let outcome = tokio::time::timeout(Duration::from_secs(5), dialer.dial("target.test:443")).await;
        let err = outcome.expect("dial must give up on its own").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn dial_within_bounds_any_dialer() {
        struct Stalled;

        #[async_trait]
        impl Dialer for Stalled {
            async fn dial(&self, _addr: &str) -> io::Result<BoxedIo> {
                std::future::pending().await
            }
        }

        let err = dial_within(&Stalled, None, "a.test:80", Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(Stalled.upstream_proxy().is_none());
        assert_eq!(
            UpstreamProxyDialer::new("corp:3128", Duration::from_secs(1)).upstream_proxy(),
            Some("corp:3128")
        );
    }

    #[test]
    fn uri_addresses_get_default_ports() {
        assert_eq!(uri_addr(&"http://a.test/x".parse().unwrap()).unwrap(), "a.test:80");
        assert_eq!(uri_addr(&"https://a.test/".parse().unwrap()).unwrap(), "a.test:443");
        assert_eq!(uri_addr(&"http://a.test:8080/".parse().unwrap()).unwrap(), "a.test:8080");
        assert!(uri_addr(&"/relative".parse().unwrap()).is_err());
    }

    #[tokio::test]
    async fn upstream_proxy_refusal_is_an_error() {
        let (addr, _task) = fake_upstream_proxy("HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await;
        let dialer = UpstreamProxyDialer::new(addr, Duration::from_secs(5));
        let err = dialer.dial("target.test:443").await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
