use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use http::{HeaderMap, Request, Response};

use crate::Proxy;
use crate::http::{Body, BoxError, RequestHead, ResponseHead};
use crate::transport::RoundTripper;

static SESSION: AtomicU64 = AtomicU64::new(0);

/// State shared by the handlers that see one request.
///
/// A fresh context is created for every plain request, every `CONNECT` and
/// every request decrypted inside a tunnel. It is owned by the task serving
/// that request and handed to handlers by `&mut`.
pub struct ProxyContext {
    session: u64,
    client_addr: SocketAddr,
    span: tracing::Span,
    proxy: Proxy,
    /// Head of the request being served, as it looked when last observed by
    /// the pipeline.
    pub request: Option<RequestHead>,
    /// Head of the upstream (or handler supplied) response, once known.
    pub response: Option<ResponseHead>,
    /// Why the upstream round trip failed, if it did.
    pub error: Option<BoxError>,
    /// Replaces the proxy's transport for this request only.
    pub round_tripper: Option<Arc<dyn RoundTripper>>,
    /// Headers to send to the client in addition to the upstream ones. They
    /// are discarded unless the proxy keeps destination headers.
    pub response_headers: HeaderMap,
    /// Free slot for handlers to pass data along the chain.
    pub user_data: Option<Box<dyn Any + Send + Sync>>,
}

impl ProxyContext {
    pub fn new(proxy: Proxy, client_addr: SocketAddr) -> Self {
        let session = SESSION.fetch_add(1, Ordering::Relaxed) + 1;
        let span = tracing::debug_span!("session", id = session & 0xFF, client = %client_addr);
        Self {
            session,
            client_addr,
            span,
            proxy,
            request: None,
            response: None,
            error: None,
            round_tripper: None,
            response_headers: HeaderMap::new(),
            user_data: None,
        }
    }

    /// Process-wide, monotonically increasing id of this context.
    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Span under which everything done for this context is logged.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub(crate) fn set_request<B>(&mut self, req: &Request<B>) {
        self.request = Some(RequestHead::from_request(req));
    }

    pub(crate) fn set_response<B>(&mut self, resp: Option<&Response<B>>) {
        self.response = resp.map(ResponseHead::from_response);
    }

    /// Send `req` to its destination with this context's transport.
    pub async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, BoxError> {
        let transport = match &self.round_tripper {
            Some(rt) => rt.clone(),
            None => self.proxy.round_tripper(),
        };
        transport.round_trip(req, self).await
    }

    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_ref()?.downcast_ref()
    }
}

impl fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyContext")
            .field("session", &self.session)
            .field("client_addr", &self.client_addr)
            .field("request", &self.request)
            .field("response", &self.response)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}
