use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use http::{Request, Response};

use crate::ctx::ProxyContext;
use crate::http::{Body, RequestHead};
use crate::transport::BoxedIo;

/// Inspects or rewrites a request before it is sent upstream.
///
/// Returning a response short-circuits the chain: no later request handler
/// runs and nothing is sent upstream, but the response handlers still do.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        req: Request<Body>,
        ctx: &mut ProxyContext,
    ) -> (Request<Body>, Option<Response<Body>>);
}

/// Inspects or rewrites the response sent back to the client. `None` means
/// there is no response, usually because the upstream round trip failed.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn handle(
        &self,
        resp: Option<Response<Body>>,
        ctx: &mut ProxyContext,
    ) -> Option<Response<Body>>;
}

/// Decides what to do with a `CONNECT` to `host` (`host:port`). `None`
/// leaves the decision to the next registration.
pub trait ConnectHandler: Send + Sync {
    fn handle_connect(&self, host: &str, ctx: &mut ProxyContext) -> Option<ConnectDecision>;
}

/// Takes over a client connection once a `CONNECT` is hijacked. The proxy
/// does not touch the stream afterwards.
pub type HijackHandler =
    Arc<dyn Fn(RequestHead, BoxedIo, ProxyContext) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Clone)]
pub enum ConnectAction {
    /// Relay the encrypted bytes without looking at them.
    Forward,
    /// Terminate TLS with a leaf certificate and run inner requests through
    /// the pipeline.
    Mitm,
    /// Answer `403 Forbidden` and close.
    Reject,
    /// Hand the raw connection to caller code.
    Hijack(HijackHandler),
}

impl fmt::Debug for ConnectAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectAction::Forward => f.write_str("Forward"),
            ConnectAction::Mitm => f.write_str("Mitm"),
            ConnectAction::Reject => f.write_str("Reject"),
            ConnectAction::Hijack(_) => f.write_str("Hijack"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectDecision {
    pub action: ConnectAction,
    /// The `host:port` to use for the tunnel, which may differ from the one
    /// the client asked for.
    pub host: String,
}

impl ConnectDecision {
    pub fn new(action: ConnectAction, host: impl Into<String>) -> Self {
        Self {
            action,
            host: host.into(),
        }
    }
}

pub struct FuncRequestHandler<F>(pub F);

#[async_trait]
impl<F> RequestHandler for FuncRequestHandler<F>
where
    F: Fn(Request<Body>, &mut ProxyContext) -> (Request<Body>, Option<Response<Body>>) + Send + Sync,
{
    async fn handle(
        &self,
        req: Request<Body>,
        ctx: &mut ProxyContext,
    ) -> (Request<Body>, Option<Response<Body>>) {
        (self.0)(req, ctx)
    }
}

pub struct FuncResponseHandler<F>(pub F);

#[async_trait]
impl<F> ResponseHandler for FuncResponseHandler<F>
where
    F: Fn(Option<Response<Body>>, &mut ProxyContext) -> Option<Response<Body>> + Send + Sync,
{
    async fn handle(
        &self,
        resp: Option<Response<Body>>,
        ctx: &mut ProxyContext,
    ) -> Option<Response<Body>> {
        (self.0)(resp, ctx)
    }
}

pub struct FuncConnectHandler<F>(pub F);

impl<F> ConnectHandler for FuncConnectHandler<F>
where
    F: Fn(&str, &mut ProxyContext) -> Option<ConnectDecision> + Send + Sync,
{
    fn handle_connect(&self, host: &str, ctx: &mut ProxyContext) -> Option<ConnectDecision> {
        (self.0)(host, ctx)
    }
}

impl<T: ConnectHandler + ?Sized> ConnectHandler for &'static T {
    fn handle_connect(&self, host: &str, ctx: &mut ProxyContext) -> Option<ConnectDecision> {
        (**self).handle_connect(host, ctx)
    }
}

/// Connect handler that always answers with the same action for the
/// requested host.
#[derive(Debug, Clone, Copy)]
pub struct FixedConnect(FixedAction);

#[derive(Debug, Clone, Copy)]
enum FixedAction {
    Forward,
    Mitm,
    Reject,
}

impl ConnectHandler for FixedConnect {
    fn handle_connect(&self, host: &str, _ctx: &mut ProxyContext) -> Option<ConnectDecision> {
        let action = match self.0 {
            FixedAction::Forward => ConnectAction::Forward,
            FixedAction::Mitm => ConnectAction::Mitm,
            FixedAction::Reject => ConnectAction::Reject,
        };
        Some(ConnectDecision::new(action, host))
    }
}

/// Intercept every matching tunnel.
pub static ALWAYS_MITM: FixedConnect = FixedConnect(FixedAction::Mitm);
/// Refuse every matching tunnel.
pub static ALWAYS_REJECT: FixedConnect = FixedConnect(FixedAction::Reject);
/// Relay every matching tunnel untouched.
pub static OK_CONNECT: FixedConnect = FixedConnect(FixedAction::Forward);
