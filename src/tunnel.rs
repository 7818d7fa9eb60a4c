use std::fmt;
use std::net::SocketAddr;

use http::header::{HOST, TRANSFER_ENCODING};
use http::{Request, Response, StatusCode, Uri};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::Instrument;

use crate::ctx::ProxyContext;
use crate::error::Error;
use crate::http::{Body, RequestHead, empty_body, error_response, full_body, has_connection_token, strip_port};
use crate::peek::PeekableReader;
use crate::transport::{self, BoxedIo, Io};
use crate::{Proxy, wire};

/// First byte of a TLS record carrying a handshake message.
const TLS_HANDSHAKE: u8 = 0x16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TunnelState {
    AwaitingHandshake,
    HandshakeInProgress,
    Established,
    Closed,
    Failed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::AwaitingHandshake => "awaiting-handshake",
            TunnelState::HandshakeInProgress => "handshake",
            TunnelState::Established => "established",
            TunnelState::Closed => "closed",
            TunnelState::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct Tunnel {
    proxy: Proxy,
    host: String,
    client_addr: SocketAddr,
    state: TunnelState,
}

impl Tunnel {
    fn enter(&mut self, next: TunnelState) {
        // Closed and Failed are final
        if matches!(self.state, TunnelState::Closed | TunnelState::Failed) {
            return;
        }
        tracing::debug!(host = %self.host, from = %self.state, to = %next, "tunnel state");
        self.state = next;
    }

    fn fail(&mut self, why: &dyn fmt::Display) {
        tracing::warn!(host = %self.host, error = %why, "tunnel failed");
        self.enter(TunnelState::Failed);
    }
}

/// Intercept the tunnel to `host` (`host:port`) over `client`, which has
/// already been told the connection is established.
///
/// A TLS client hello is answered with a leaf certificate for `host`; any
/// other first byte is taken as plaintext HTTP. Each request read from the
/// tunnel runs through the proxy's pipeline.
pub(crate) async fn run<S>(proxy: Proxy, client: S, host: String, client_addr: SocketAddr)
where
    S: Io + 'static,
{
    let mut tunnel = Tunnel {
        proxy,
        host,
        client_addr,
        state: TunnelState::AwaitingHandshake,
    };
    let handshake = tunnel.proxy.timeouts().handshake;

    let mut client = PeekableReader::with_capacity(client, 1);
    let mut first = [0u8; 1];
    let n = match tokio::time::timeout(handshake, client.read(&mut first)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return tunnel.fail(&e),
        Err(_) => return tunnel.fail(&"no data before handshake timeout"),
    };
    if n == 0 {
        return tunnel.enter(TunnelState::Closed);
    }
    if let Err(e) = client.rewind() {
        return tunnel.fail(&e);
    }

    if first[0] != TLS_HANDSHAKE {
        tracing::debug!(host = %tunnel.host, "plaintext http inside tunnel");
        tunnel.enter(TunnelState::Established);
        serve_inner(&mut tunnel, client, "http").await;
        return;
    }

    tunnel.enter(TunnelState::HandshakeInProgress);
    let Some(ca) = tunnel.proxy.ca().cloned() else {
        return tunnel.fail(&"no certificate authority");
    };
    let leaf = match ca.fetch_or_generate(&tunnel.host).await {
        Ok(leaf) => leaf,
        Err(e) => return tunnel.fail(&e),
    };
    let acceptor = TlsAcceptor::from(leaf.server_config());
    let tls = match tokio::time::timeout(handshake, acceptor.accept(client)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => return tunnel.fail(&e),
        Err(_) => return tunnel.fail(&"tls handshake timed out"),
    };
    tunnel.enter(TunnelState::Established);
    serve_inner(&mut tunnel, tls, "https").await;
}

async fn serve_inner<S>(tunnel: &mut Tunnel, stream: S, scheme: &'static str)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let idle = tunnel.proxy.timeouts().idle;
    let mut stream = BufReader::new(stream);

    loop {
        let head = match tokio::time::timeout(idle, wire::read_request_head(&mut stream, wire::MAX_HEAD)).await {
            Err(_) => {
                tracing::debug!(host = %tunnel.host, "tunnel idle");
                break;
            }
            Ok(Ok(None)) => break,
            Ok(Ok(Some(head))) => head,
            Ok(Err(e)) if e.is_disconnect() => break,
            Ok(Err(e)) => {
                let _ = write_error(stream.get_mut(), StatusCode::BAD_REQUEST, &e).await;
                tunnel.fail(&e);
                return;
            }
        };

        if head.is_websocket_upgrade() {
            if let Err(e) = relay_websocket(tunnel, &mut stream, head, scheme == "https").await {
                tracing::debug!(host = %tunnel.host, error = %e, "websocket relay ended");
            }
            break;
        }

        let body = match wire::read_body(&mut stream, &head.headers, wire::MAX_BODY).await {
            Ok(body) => body,
            Err(e) => {
                let _ = write_error(stream.get_mut(), StatusCode::BAD_REQUEST, &e).await;
                tunnel.fail(&e);
                return;
            }
        };
        let keep_alive = wire::keep_alive(&head);
        let method = head.method.clone();
        let req = match inner_request(head, body, &tunnel.host, scheme) {
            Ok(req) => req,
            Err(e) => {
                let _ = write_error(stream.get_mut(), StatusCode::BAD_REQUEST, &e).await;
                tunnel.fail(&e);
                return;
            }
        };

        let mut ctx = ProxyContext::new(tunnel.proxy.clone(), tunnel.client_addr);
        let span = ctx.span().clone();
        let resp = tunnel.proxy.proxy_request(req, &mut ctx).instrument(span).await;
        let close = !keep_alive || has_connection_token(resp.headers(), "close");

        if let Err(e) = wire::write_response(stream.get_mut(), resp, &method).await {
            if !e.is_disconnect() {
                tunnel.fail(&e);
            }
            break;
        }
        if close {
            break;
        }
    }

    let _ = stream.get_mut().shutdown().await;
    tunnel.enter(TunnelState::Closed);
}

async fn write_error<W: AsyncWrite + Unpin>(w: &mut W, status: StatusCode, e: &Error) -> Result<(), Error> {
    let mut resp = error_response(status, e.to_string());
    resp.headers_mut()
        .insert(http::header::CONNECTION, http::HeaderValue::from_static("close"));
    wire::write_response(w, resp, &http::Method::GET).await
}

/// Rebuild a request read from the tunnel with an absolute URI pointing at
/// the tunnel host.
fn inner_request(
    head: RequestHead,
    body: bytes::Bytes,
    host: &str,
    scheme: &str,
) -> Result<Request<Body>, Error> {
    let authority = match (scheme, host.rsplit_once(':')) {
        ("https", Some((name, "443"))) | ("http", Some((name, "80"))) => name,
        _ => host,
    };
    let path = head
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("{scheme}://{authority}{path}")
        .parse()
        .map_err(|e: http::uri::InvalidUri| Error::MalformedHead(e.to_string()))?;

    let mut headers = head.headers;
    headers.remove(TRANSFER_ENCODING);
    if !headers.contains_key(HOST) {
        if let Ok(value) = authority.parse() {
            headers.insert(HOST, value);
        }
    }
    let body = if body.is_empty() {
        empty_body()
    } else {
        full_body(body)
    };

    let mut req = Request::new(body);
    *req.method_mut() = head.method;
    *req.uri_mut() = uri;
    *req.version_mut() = head.version;
    *req.headers_mut() = headers;
    Ok(req)
}

/// Send the upgrade request to the real host and relay raw bytes both ways.
async fn relay_websocket<S>(
    tunnel: &Tunnel,
    client: &mut BufReader<S>,
    head: RequestHead,
    tls: bool,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    tracing::debug!(host = %tunnel.host, uri = %head.uri, "websocket inside tunnel");
    let dialed = transport::dial_within(
        tunnel.proxy.dialer().as_ref(),
        Some(&head),
        &tunnel.host,
        tunnel.proxy.timeouts().connect,
    )
    .await;
    let upstream = match dialed {
        Ok(upstream) => upstream,
        Err(e) => {
            let resp: Response<Body> = error_response(StatusCode::BAD_GATEWAY, e.to_string());
            wire::write_response(client.get_mut(), resp, &head.method).await?;
            return Err(e.into());
        }
    };
    let mut upstream: BoxedIo = if tls {
        let name = ServerName::try_from(strip_port(&tunnel.host).to_string())
            .map_err(|e| Error::MalformedHead(e.to_string()))?;
        let connector = TlsConnector::from(tunnel.proxy.upstream_tls());
        Box::new(connector.connect(name, upstream).await?)
    } else {
        upstream
    };

    upstream.write_all(&wire::encode_request_head(&head)).await?;
    let early = client.buffer().to_vec();
    if !early.is_empty() {
        upstream.write_all(&early).await?;
        client.consume(early.len());
    }
    upstream.flush().await?;

    let (up, down) = wire::relay(client.get_mut(), &mut upstream, tunnel.proxy.timeouts().idle).await?;
    tracing::debug!(up, down, "websocket closed");
    Ok(())
}
