use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http::{Method, Request, Response, Uri, Version};

use crate::ProxyBuilder;
use crate::condition::ConditionRef;
use crate::ctx::ProxyContext;
use crate::handler::{
    ConnectAction, ConnectDecision, ConnectHandler, FuncConnectHandler, FuncRequestHandler,
    FuncResponseHandler, HijackHandler, RequestHandler, ResponseHandler,
};
use crate::http::{Body, RequestHead};

/// A handler together with the conditions that must all hold for it to run.
pub struct Registration<H: ?Sized> {
    conds: Vec<ConditionRef>,
    handler: Arc<H>,
}

impl<H: ?Sized> Clone for Registration<H> {
    fn clone(&self) -> Self {
        Self {
            conds: self.conds.clone(),
            handler: self.handler.clone(),
        }
    }
}

/// The three ordered handler chains of a proxy.
///
/// Registration order is evaluation order. Once a [`Proxy`](crate::Proxy) is
/// built the pipeline is frozen behind an `Arc`.
#[derive(Clone)]
pub struct HandlerPipeline {
    requests: Vec<Registration<dyn RequestHandler>>,
    responses: Vec<Registration<dyn ResponseHandler>>,
    connects: Vec<Registration<dyn ConnectHandler>>,
    default_connect: ConnectAction,
}

impl Default for HandlerPipeline {
    fn default() -> Self {
        Self {
            requests: Vec::new(),
            responses: Vec::new(),
            connects: Vec::new(),
            default_connect: ConnectAction::Reject,
        }
    }
}

impl HandlerPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_request(&mut self, conds: Vec<ConditionRef>, h: Arc<dyn RequestHandler>) {
        self.requests.push(Registration { conds, handler: h });
    }

    pub(crate) fn push_response(&mut self, conds: Vec<ConditionRef>, h: Arc<dyn ResponseHandler>) {
        self.responses.push(Registration { conds, handler: h });
    }

    pub(crate) fn push_connect(&mut self, conds: Vec<ConditionRef>, h: Arc<dyn ConnectHandler>) {
        self.connects.push(Registration { conds, handler: h });
    }

    pub(crate) fn set_default_connect(&mut self, action: ConnectAction) {
        self.default_connect = action;
    }

    pub fn request_handlers(&self) -> usize {
        self.requests.len()
    }

    pub fn response_handlers(&self) -> usize {
        self.responses.len()
    }

    pub fn connect_handlers(&self) -> usize {
        self.connects.len()
    }

    /// Run the request chain. Each handler sees the request as left by the
    /// ones before it; the first one to produce a response ends the chain.
    pub async fn filter_request(
        &self,
        mut req: Request<Body>,
        ctx: &mut ProxyContext,
    ) -> (Request<Body>, Option<Response<Body>>) {
        for (i, reg) in self.requests.iter().enumerate() {
            ctx.set_request(&req);
            if !reg.conds.is_empty() {
                let Some(head) = ctx.request.as_ref() else {
                    continue;
                };
                if !reg.conds.iter().all(|c| c.matches_request(head, ctx)) {
                    continue;
                }
            }
            let (next, resp) = reg.handler.handle(req, ctx).await;
            req = next;
            if resp.is_some() {
                tracing::debug!(parent: ctx.span(), handler = i, "request answered by handler");
                ctx.set_request(&req);
                return (req, resp);
            }
        }
        ctx.set_request(&req);
        (req, None)
    }

    /// Run every matching response handler in order, threading the response
    /// through them.
    pub async fn filter_response(
        &self,
        mut resp: Option<Response<Body>>,
        ctx: &mut ProxyContext,
    ) -> Option<Response<Body>> {
        for reg in &self.responses {
            ctx.set_response(resp.as_ref());
            if !reg.conds.iter().all(|c| c.matches_response(resp.as_ref(), ctx)) {
                continue;
            }
            resp = reg.handler.handle(resp, ctx).await;
        }
        ctx.set_response(resp.as_ref());
        resp
    }

    /// Decide what to do with a `CONNECT` to `host` (`host:port`).
    pub fn decide_connect(&self, host: &str, ctx: &mut ProxyContext) -> ConnectDecision {
        ctx.request = Some(connect_head(host));
        for reg in &self.connects {
            let matched = match ctx.request.as_ref() {
                Some(head) => reg.conds.iter().all(|c| c.matches_request(head, ctx)),
                None => reg.conds.is_empty(),
            };
            if !matched {
                continue;
            }
            if let Some(decision) = reg.handler.handle_connect(host, ctx) {
                return decision;
            }
        }
        ConnectDecision::new(self.default_connect.clone(), host)
    }
}

/// Synthetic head for a `CONNECT host:port` request.
pub(crate) fn connect_head(host: &str) -> RequestHead {
    RequestHead {
        method: Method::CONNECT,
        uri: host.parse::<Uri>().unwrap_or_default(),
        version: Version::HTTP_11,
        headers: Default::default(),
    }
}

/// Registrations started with [`ProxyBuilder::on_request`].
#[must_use = "call a handler method to register"]
pub struct OnRequest {
    pub(crate) builder: ProxyBuilder,
    pub(crate) conds: Vec<ConditionRef>,
}

impl OnRequest {
    pub fn handle(mut self, h: impl RequestHandler + 'static) -> ProxyBuilder {
        self.builder.pipeline.push_request(self.conds, Arc::new(h));
        self.builder
    }

    pub fn do_fn<F>(self, f: F) -> ProxyBuilder
    where
        F: Fn(Request<Body>, &mut ProxyContext) -> (Request<Body>, Option<Response<Body>>)
            + Send
            + Sync
            + 'static,
    {
        self.handle(FuncRequestHandler(f))
    }

    /// Register a `CONNECT` handler. The conditions see a synthetic
    /// `CONNECT host:port` request.
    pub fn handle_connect(mut self, h: impl ConnectHandler + 'static) -> ProxyBuilder {
        self.builder.pipeline.push_connect(self.conds, Arc::new(h));
        self.builder
    }

    pub fn connect_fn<F>(self, f: F) -> ProxyBuilder
    where
        F: Fn(&str, &mut ProxyContext) -> Option<ConnectDecision> + Send + Sync + 'static,
    {
        self.handle_connect(FuncConnectHandler(f))
    }

    /// Hand matching tunnels to `f` together with the `CONNECT` head.
    pub fn hijack_connect<F, Fut>(self, f: F) -> ProxyBuilder
    where
        F: Fn(RequestHead, crate::transport::BoxedIo, ProxyContext) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hijack: HijackHandler = Arc::new(move |head, io, ctx| {
            Box::pin(f(head, io, ctx)) as Pin<Box<dyn Future<Output = ()> + Send>>
        });
        self.connect_fn(move |host, _| {
            Some(ConnectDecision::new(ConnectAction::Hijack(hijack.clone()), host))
        })
    }
}

/// Registrations started with [`ProxyBuilder::on_response`].
#[must_use = "call a handler method to register"]
pub struct OnResponse {
    pub(crate) builder: ProxyBuilder,
    pub(crate) conds: Vec<ConditionRef>,
}

impl OnResponse {
    pub fn handle(mut self, h: impl ResponseHandler + 'static) -> ProxyBuilder {
        self.builder.pipeline.push_response(self.conds, Arc::new(h));
        self.builder
    }

    pub fn do_fn<F>(self, f: F) -> ProxyBuilder
    where
        F: Fn(Option<Response<Body>>, &mut ProxyContext) -> Option<Response<Body>>
            + Send
            + Sync
            + 'static,
    {
        self.handle(FuncResponseHandler(f))
    }
}
