//! HTTP/1.1 framing for the connections the proxy parses by hand: the first
//! request of every client connection and the requests inside intercepted
//! tunnels.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderName, HeaderValue, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
};
use tokio::time::Instant;

use crate::chunked::{self, ChunkedWriter};
use crate::error::Error;
use crate::http::{Body, RequestHead, format_version, has_connection_token};
use crate::peek::PeekableReader;

pub const MAX_HEAD: usize = 64 * 1024;
pub const MAX_BODY: usize = 32 * 1024 * 1024;
const MAX_HEADERS: usize = 100;

/// Headers that describe a single hop and are never relayed as-is.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Read until a full request head (`...\r\n\r\n`) has been seen and return its
/// length. `Ok(None)` means the peer closed before sending anything. The bytes
/// stay recorded in `reader`, so callers decide whether to rewind.
pub async fn sniff_head<R: AsyncRead + Unpin>(
    reader: &mut PeekableReader<R>,
    limit: usize,
) -> Result<Option<usize>, Error> {
    let mut seen = Vec::with_capacity(1024);
    let mut buf = [0u8; 4096];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            if seen.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        let from = seen.len().saturating_sub(3);
        seen.extend_from_slice(&buf[..n]);
        if let Some(pos) = seen[from..].windows(4).position(|w| w == b"\r\n\r\n") {
            return Ok(Some(from + pos + 4));
        }
        if seen.len() > limit {
            return Err(Error::HeadTooLarge { limit });
        }
    }
}

/// Parse a complete request head.
pub fn parse_request_head(raw: &[u8]) -> Result<RequestHead, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(Error::MalformedHead("incomplete request head".into()));
        }
        Err(e) => return Err(Error::MalformedHead(e.to_string())),
    }

    let method = req
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| Error::MalformedHead("invalid method".into()))?;
    let uri = req
        .path
        .and_then(|p| p.parse::<Uri>().ok())
        .ok_or_else(|| Error::MalformedHead("invalid request target".into()))?;
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut map = HeaderMap::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| Error::MalformedHead(format!("invalid header name {:?}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| Error::MalformedHead(format!("invalid value for {}", h.name)))?;
        map.append(name, value);
    }

    Ok(RequestHead {
        method,
        uri,
        version,
        headers: map,
    })
}

/// Read the next request head from a buffered stream. Blank lines before the
/// request line are skipped. `Ok(None)` on a clean EOF between requests.
pub async fn read_request_head<R: AsyncBufRead + Unpin>(
    r: &mut R,
    limit: usize,
) -> Result<Option<RequestHead>, Error> {
    let mut raw = Vec::new();
    loop {
        let mut line = Vec::new();
        let n = (&mut *r)
            .take((limit - raw.len()) as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            if raw.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        if !line.ends_with(b"\n") {
            return Err(Error::HeadTooLarge { limit });
        }
        let blank = line == b"\r\n" || line == b"\n";
        if blank && raw.is_empty() {
            continue;
        }
        raw.extend_from_slice(&line);
        if blank {
            break;
        }
        if raw.len() >= limit {
            return Err(Error::HeadTooLarge { limit });
        }
    }
    parse_request_head(&raw).map(Some)
}

/// Read the body announced by `headers`: chunked, `Content-Length` delimited
/// or absent.
pub async fn read_body<R: AsyncBufRead + Unpin>(
    r: &mut R,
    headers: &HeaderMap,
    limit: usize,
) -> Result<Bytes, Error> {
    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return chunked::read_chunked_body(r, limit).await;
    }

    let Some(len) = headers.get(CONTENT_LENGTH) else {
        return Ok(Bytes::new());
    };
    let len: usize = len
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| Error::MalformedBody("invalid content-length".into()))?;
    if len > limit {
        return Err(Error::BodyTooLarge { limit });
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(body.into())
}

/// Whether a response to `method` with `status` carries no body.
fn is_bodyless(method: &Method, status: StatusCode) -> bool {
    *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// Serialize `resp` onto `w`. Bodies of known size are sent with a
/// `Content-Length`, everything else chunked. Event streams are flushed
/// after every frame.
pub async fn write_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    resp: Response<Body>,
    method: &Method,
) -> Result<(), Error> {
    let (parts, mut body) = resp.into_parts();
    let bodyless = is_bodyless(method, parts.status);
    let exact = hyper::body::Body::size_hint(&body).exact();

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            format_version(Version::HTTP_11),
            parts.status.as_u16(),
            parts.status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in parts.headers.iter() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if name == CONTENT_LENGTH && !bodyless {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    if bodyless {
        head.extend_from_slice(b"\r\n");
        w.write_all(&head).await?;
        w.flush().await?;
        return Ok(());
    }

    let streaming = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"));

    match exact {
        Some(len) => {
            head.extend_from_slice(format!("content-length: {len}\r\n\r\n").as_bytes());
            w.write_all(&head).await?;
            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(Error::UpstreamRoundTrip)?;
                if let Ok(data) = frame.into_data() {
                    w.write_all(&data).await?;
                }
            }
            w.flush().await?;
        }
        None => {
            head.extend_from_slice(b"transfer-encoding: chunked\r\n\r\n");
            w.write_all(&head).await?;
            let mut chunked = ChunkedWriter::new(&mut *w);
            while let Some(frame) = body.frame().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(error = %e, "response body ended with an error");
                        break;
                    }
                };
                if let Ok(data) = frame.into_data() {
                    chunked.write_chunk(&data).await?;
                    if streaming {
                        chunked.flush().await?;
                    }
                }
            }
            chunked.finish().await?;
            chunked.flush().await?;
        }
    }
    Ok(())
}

/// Whether the connection should stay open after this exchange.
pub fn keep_alive(head: &RequestHead) -> bool {
    if has_connection_token(&head.headers, "close") {
        return false;
    }
    head.version != Version::HTTP_10 || has_connection_token(&head.headers, "keep-alive")
}

/// Serialize a request head for a raw upstream connection.
pub fn encode_request_head(head: &RequestHead) -> Vec<u8> {
    let target = head
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            head.method,
            target,
            format_version(head.version)
        )
        .as_bytes(),
    );
    for (name, value) in head.headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn is_tls_close(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::UnexpectedEof
}

/// Copy bytes both ways until each side has closed or nothing moved for
/// `idle`. Returns the byte counts `(a → b, b → a)`.
pub async fn relay<A, B>(a: &mut A, b: &mut B, idle: Duration) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut buf_a = vec![0u8; 8192];
    let mut buf_b = vec![0u8; 8192];
    let (mut a_to_b, mut b_to_a) = (0u64, 0u64);
    let (mut a_done, mut b_done) = (false, false);

    let deadline = tokio::time::sleep(idle);
    tokio::pin!(deadline);

    while !(a_done && b_done) {
        tokio::select! {
            result = a.read(&mut buf_a), if !a_done => {
                let n = match result {
                    Ok(n) => n,
                    Err(e) if is_tls_close(&e) => 0,
                    Err(e) => return Err(e),
                };
                if n == 0 {
                    a_done = true;
                    let _ = b.shutdown().await;
                    continue;
                }
                b.write_all(&buf_a[..n]).await?;
                b.flush().await?;
                a_to_b += n as u64;
                deadline.as_mut().reset(Instant::now() + idle);
            }
            result = b.read(&mut buf_b), if !b_done => {
                let n = match result {
                    Ok(n) => n,
                    Err(e) if is_tls_close(&e) => 0,
                    Err(e) => return Err(e),
                };
                if n == 0 {
                    b_done = true;
                    let _ = a.shutdown().await;
                    continue;
                }
                a.write_all(&buf_b[..n]).await?;
                a.flush().await?;
                b_to_a += n as u64;
                deadline.as_mut().reset(Instant::now() + idle);
            }
            _ = &mut deadline => {
                tracing::debug!(a_to_b, b_to_a, "relay idle timeout");
                break;
            }
        }
    }
    Ok((a_to_b, b_to_a))
}

#[cfg(test)]
mod tests {
    use http::header::HOST;
    use tokio::io::BufReader;

    use super::*;
    use crate::http::{full_body, new_response};

    #[tokio::test]
    async fn sniffed_head_can_be_replayed() {
        let wire = b"CONNECT good.test:443 HTTP/1.1\r\nHost: good.test:443\r\n\r\n\x16\x03\x01";
        let mut reader = PeekableReader::with_capacity(&wire[..], 16 * 1024);
        let len = sniff_head(&mut reader, MAX_HEAD).await.unwrap().unwrap();
        assert_eq!(&wire[len..], b"\x16\x03\x01");

        reader.rewind().unwrap();
        let mut head = vec![0u8; len];
        reader.read_exact(&mut head).await.unwrap();
        let head = parse_request_head(&head).unwrap();
        assert_eq!(head.method, Method::CONNECT);
        assert_eq!(head.authority(), Some("good.test:443"));
    }

    #[tokio::test]
    async fn sniff_reports_eof_and_oversized_heads() {
        let mut reader = PeekableReader::new(&b""[..]);
        assert!(sniff_head(&mut reader, 100).await.unwrap().is_none());

        let big = vec![b'a'; 9000];
        let mut reader = PeekableReader::with_capacity(&big[..], 16 * 1024);
        assert!(matches!(
            sniff_head(&mut reader, 1024).await,
            Err(Error::HeadTooLarge { limit: 1024 })
        ));
    }

    #[tokio::test]
    async fn reads_consecutive_requests_with_bodies() {
        let wire = b"\r\nPOST /a HTTP/1.1\r\nHost: x.test\r\nContent-Length: 3\r\n\r\nabc\
GET /b HTTP/1.1\r\nHost: x.test\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n";
        let mut r = BufReader::new(&wire[..]);

        let first = read_request_head(&mut r, MAX_HEAD).await.unwrap().unwrap();
        assert_eq!(first.method, Method::POST);
        assert_eq!(first.uri.path(), "/a");
        assert_eq!(first.headers[HOST], "x.test");
        assert_eq!(&read_body(&mut r, &first.headers, 10).await.unwrap()[..], b"abc");

        let second = read_request_head(&mut r, MAX_HEAD).await.unwrap().unwrap();
        assert_eq!(second.uri.path(), "/b");
        assert_eq!(&read_body(&mut r, &second.headers, 10).await.unwrap()[..], b"hi");

        assert!(read_request_head(&mut r, MAX_HEAD).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn content_length_over_limit_is_refused() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("100"));
        let mut r = BufReader::new(&b""[..]);
        assert!(matches!(
            read_body(&mut r, &headers, 10).await,
            Err(Error::BodyTooLarge { limit: 10 })
        ));
    }

    #[tokio::test]
    async fn known_length_response_is_written_with_content_length() {
        let mut resp = new_response(StatusCode::OK, "text/plain", "chico");
        resp.headers_mut()
            .insert("connection", HeaderValue::from_static("keep-alive"));
        let mut out = Vec::new();
        write_response(&mut out, resp, &Method::GET).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(!text.contains("connection"));
        assert!(text.ends_with("\r\n\r\nchico"));
    }

    #[tokio::test]
    async fn streaming_response_is_chunked() {
        let stream = unsized_body(vec!["ab", "cde"]);
        let resp = Response::new(stream);
        let mut out = Vec::new();
        write_response(&mut out, resp, &Method::GET).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(text.ends_with("\r\n\r\n2\r\nab\r\n3\r\ncde\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn head_responses_have_no_body() {
        let resp = Response::new(full_body("ignored"));
        let mut out = Vec::new();
        write_response(&mut out, resp, &Method::HEAD).await.unwrap();
        assert!(String::from_utf8(out).unwrap().ends_with("\r\n\r\n"));
    }

    #[test]
    fn keep_alive_rules() {
        let mut head = parse_request_head(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(keep_alive(&head));
        head.headers
            .insert("connection", HeaderValue::from_static("close"));
        assert!(!keep_alive(&head));
        let head = parse_request_head(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!keep_alive(&head));
    }

    #[tokio::test]
    async fn relay_moves_bytes_both_ways() {
        let (mut client, mut proxy_side) = tokio::io::duplex(64);
        let (mut upstream_side, mut server) = tokio::io::duplex(64);
        let task = tokio::spawn(async move {
            relay(&mut proxy_side, &mut upstream_side, Duration::from_secs(5)).await
        });

        client.write_all(b"ping").await.unwrap();
        let mut got = [0u8; 4];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");
        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong");

        drop(client);
        drop(server);
        let (up, down) = task.await.unwrap().unwrap();
        assert_eq!((up, down), (4, 4));
    }

    /// A body without a known length, made of the given frames.
    fn unsized_body(parts: Vec<&'static str>) -> Body {
        UnsizedBody(parts.into_iter().map(|s| Bytes::from_static(s.as_bytes())).collect()).boxed()
    }

    struct UnsizedBody(std::collections::VecDeque<Bytes>);

    impl hyper::body::Body for UnsizedBody {
        type Data = Bytes;
        type Error = crate::http::BoxError;

        fn poll_frame(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Result<hyper::body::Frame<Bytes>, Self::Error>>> {
            std::task::Poll::Ready(self.0.pop_front().map(|b| Ok(hyper::body::Frame::data(b))))
        }
    }
}
