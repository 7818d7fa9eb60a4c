#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::routing::get;
use axum_server::tls_rustls::RustlsConfig;
use http::header::{self, HeaderMap};
use http::{Request, Response, StatusCode};
use interpose::http::{Body, BoxError, new_response};
use interpose::{ProxyBuilder, ProxyContext, RoundTripper};
use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Plain HTTP upstream with a handful of fixed routes.
pub async fn start_upstream() -> SocketAddr {
    let app = Router::new()
        .route("/", get(|| async { "hello world" }))
        .route("/momo", get(|| async { "momo" }))
        .route("/bobo", get(|| async { "bobo" }))
        .route("/koko", get(|| async { "koko" }))
        .route(
            "/img.png",
            get(|| async { ([(header::CONTENT_TYPE, "image/png")], "png") }),
        )
        .route(
            "/img.jpg",
            get(|| async { ([(header::CONTENT_TYPE, "image/jpeg")], "jpg") }),
        )
        .route(
            "/headers",
            get(|headers: HeaderMap| async move {
                let mut names: Vec<String> =
                    headers.keys().map(|k| k.as_str().to_string()).collect();
                names.sort();
                names.join(",")
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// HTTPS upstream with a self-signed `localhost` cert that returns `body` on GET /.
pub async fn start_tls_upstream(body: &'static str) -> SocketAddr {
    install_crypto_provider();
    let key_pair = KeyPair::generate().unwrap();
    let params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    let cert_der = cert.der().to_vec();
    let key_der = key_pair.serialized_der().to_vec();

    let config = RustlsConfig::from_der(vec![cert_der], key_der)
        .await
        .unwrap();

    let app = Router::new().route("/", get(move || async move { body }));

    let handle = axum_server::Handle::new();
    let listener_handle = handle.clone();

    tokio::spawn(async move {
        axum_server::bind_rustls("127.0.0.1:0".parse().unwrap(), config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .unwrap();
    });

    listener_handle.listening().await.unwrap()
}

/// Build the proxy and spawn its accept loop.
pub async fn start_proxy(builder: ProxyBuilder) -> SocketAddr {
    install_crypto_provider();
    let proxy = builder.build();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, client_addr) = listener.accept().await.unwrap();
            let proxy = proxy.clone();
            tokio::spawn(async move {
                proxy.handle_connection(stream, client_addr).await.ok();
            });
        }
    });

    addr
}

/// A client that sends every request through the proxy.
pub fn proxied_client(proxy_addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy_addr}")).unwrap())
        .build()
        .unwrap()
}

/// A proxied client that trusts certificates minted by the proxy.
pub fn mitm_client(proxy_addr: SocketAddr, ca_pem: &str) -> reqwest::Client {
    let ca_cert = reqwest::tls::Certificate::from_pem(ca_pem.as_bytes()).unwrap();
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy_addr}")).unwrap())
        .add_root_certificate(ca_cert)
        .build()
        .unwrap()
}

/// Records what reached the transport and answers every request itself.
#[derive(Clone, Default)]
pub struct Recorder {
    pub seen: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl RoundTripper for Recorder {
    async fn round_trip(
        &self,
        req: Request<Body>,
        _ctx: &ProxyContext,
    ) -> Result<Response<Body>, BoxError> {
        self.seen
            .lock()
            .unwrap()
            .push(format!("{} {}", req.method(), req.uri()));
        Ok(new_response(StatusCode::OK, "text/plain", "intercepted"))
    }
}

/// Read a response head up to and including the blank line.
pub async fn read_head<R: AsyncRead + Unpin>(r: &mut BufReader<R>) -> String {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        let n = r.read_line(&mut line).await.unwrap();
        if n == 0 || line == "\r\n" {
            return head;
        }
        head.push_str(&line);
    }
}

/// Read one response with a `Content-Length` body; returns head and body.
pub async fn read_response<R: AsyncRead + Unpin>(r: &mut BufReader<R>) -> (String, String) {
    let head = read_head(r).await;
    let len = head
        .lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await.unwrap();
    (head, String::from_utf8(body).unwrap())
}

/// Open a raw connection to the proxy and send `CONNECT target`.
pub async fn send_connect(proxy_addr: SocketAddr, target: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let req = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(req.as_bytes()).await.unwrap();
    stream
}

/// TLS client handshake over `io`, trusting only `ca_der`.
pub async fn tls_connect<S>(
    io: S,
    ca_der: rustls::pki_types::CertificateDer<'static>,
    server_name: &str,
) -> TlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca_der).unwrap();
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(server_name.to_string()).unwrap();
    connector.connect(name, io).await.unwrap()
}

/// Upstream that answers any request with `101 Switching Protocols` and
/// then echoes every byte back.
pub async fn start_upgrade_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stream);
                read_head(&mut reader).await;
                reader
                    .get_mut()
                    .write_all(
                        b"HTTP/1.1 101 Switching Protocols\r\n\
                          Connection: Upgrade\r\n\
                          Upgrade: websocket\r\n\r\n",
                    )
                    .await
                    .unwrap();
                let (mut r, mut w) = tokio::io::split(reader);
                tokio::io::copy(&mut r, &mut w).await.ok();
            });
        }
    });
    addr
}

/// Upstream that accepts connections and never sends a byte.
pub async fn start_silent_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            held.push(stream);
        }
    });
    addr
}

/// A chaining HTTP proxy that accepts one `CONNECT`, then answers the
/// request sent through the tunnel with `chained`. The task yields the
/// `CONNECT` line and the tunneled request line.
pub async fn start_chaining_proxy() -> (SocketAddr, tokio::task::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        let connect = read_head(&mut reader).await;
        reader
            .get_mut()
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();
        let request = read_head(&mut reader).await;
        reader
            .get_mut()
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 7\r\nconnection: close\r\n\r\nchained")
            .await
            .unwrap();
        [connect, request]
            .iter()
            .map(|head| head.lines().next().unwrap_or_default().to_string())
            .collect()
    });
    (addr, task)
}

/// Read until the peer closes, failing if that takes longer than `limit`.
pub async fn expect_closed_within<R: AsyncRead + Unpin>(r: &mut R, limit: std::time::Duration) -> Vec<u8> {
    let mut rest = Vec::new();
    // a reset counts as closed too
    let read = tokio::time::timeout(limit, r.read_to_end(&mut rest)).await;
    assert!(read.is_ok(), "peer should have closed the connection");
    rest
}
