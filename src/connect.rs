use std::future::Future;
use std::net::SocketAddr;

use http::{Request, Response, StatusCode};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use crate::ctx::ProxyContext;
use crate::error::Error;
use crate::handler::{ConnectAction, ConnectDecision, HijackHandler};
use crate::http::{Body, RequestHead, empty_body};
use crate::transport::{BoxedIo, Io};
use crate::{Proxy, transport, tunnel, wire};

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// `host:port` a `CONNECT` asks for, with `443` when no port is given.
pub(crate) fn connect_target(head: &RequestHead) -> Option<String> {
    let authority = head.authority()?.trim();
    if authority.is_empty() {
        return None;
    }
    let has_port = match authority.rsplit_once(':') {
        Some((host, port)) => {
            (!host.contains(':') || host.ends_with(']')) && port.parse::<u16>().is_ok()
        }
        None => false,
    };
    if has_port {
        Some(authority.to_string())
    } else {
        Some(format!("{authority}:443"))
    }
}

fn decide(proxy: &Proxy, target: &str, ctx: &mut ProxyContext) -> ConnectDecision {
    let decision = proxy.pipeline().decide_connect(target, ctx);
    tracing::debug!(target = %target, host = %decision.host, action = ?decision.action, "connect decision");
    decision
}

/// A connect decision with its upstream side ready.
enum Plan {
    Reject,
    /// The upstream could not be reached or cannot be intercepted.
    BadGateway,
    Forward(BoxedIo),
    Mitm(String),
    Hijack(HijackHandler),
}

async fn prepare(proxy: &Proxy, head: &RequestHead, decision: ConnectDecision) -> Plan {
    match decision.action {
        ConnectAction::Reject => Plan::Reject,
        ConnectAction::Forward => {
            let dialed = transport::dial_within(
                proxy.dialer().as_ref(),
                Some(head),
                &decision.host,
                proxy.timeouts().connect,
            )
            .await;
            match dialed {
                Ok(upstream) => Plan::Forward(upstream),
                Err(e) => {
                    tracing::warn!(host = %decision.host, error = %e, "cannot dial tunnel target");
                    Plan::BadGateway
                }
            }
        }
        ConnectAction::Mitm if proxy.ca().is_none() => {
            tracing::warn!(host = %decision.host, "cannot intercept without a certificate authority");
            Plan::BadGateway
        }
        ConnectAction::Mitm => Plan::Mitm(decision.host),
        ConnectAction::Hijack(hijack) => {
            tracing::debug!(host = %decision.host, "hijacking connection");
            Plan::Hijack(hijack)
        }
    }
}

/// `CONNECT` received as the first request of a connection: the socket is
/// ours and the answer is written by hand.
pub(crate) async fn handle_raw<S>(
    proxy: &Proxy,
    head: RequestHead,
    mut client: S,
    client_addr: SocketAddr,
) -> Result<(), Error>
where
    S: Io + 'static,
{
    let mut ctx = ProxyContext::new(proxy.clone(), client_addr);
    let span = ctx.span().clone();
    async move {
        let Some(target) = connect_target(&head) else {
            client
                .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
                .await?;
            return Ok(());
        };
        let decision = decide(proxy, &target, &mut ctx);
        ctx.request = Some(head.clone());

        match prepare(proxy, &head, decision).await {
            Plan::Reject => {
                client.write_all(FORBIDDEN).await?;
                let _ = client.shutdown().await;
            }
            Plan::BadGateway => client.write_all(BAD_GATEWAY).await?,
            Plan::Forward(mut upstream) => {
                client.write_all(ESTABLISHED).await?;
                let (up, down) = wire::relay(&mut client, &mut upstream, proxy.timeouts().idle).await?;
                tracing::debug!(up, down, "tunnel closed");
            }
            Plan::Mitm(host) => {
                client.write_all(ESTABLISHED).await?;
                tunnel::run(proxy.clone(), client, host, client_addr).await;
            }
            Plan::Hijack(hijack) => hijack(head, Box::new(client) as BoxedIo, ctx).await,
        }
        Ok(())
    }
    .instrument(span)
    .await
}

fn status_only(status: StatusCode) -> Response<Body> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = status;
    resp
}

/// Run `f` on the connection once hyper has sent the `200` and handed it
/// over.
fn on_upgraded<F, Fut>(req: Request<Body>, f: F)
where
    F: FnOnce(TokioIo<Upgraded>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(
        async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => f(TokioIo::new(upgraded)).await,
                Err(e) => tracing::debug!(error = %e, "connect upgrade failed"),
            }
        }
        .in_current_span(),
    );
}

/// `CONNECT` received on a connection already served by hyper. The `200`
/// goes out as a normal response and the tunnel runs on the upgraded
/// connection.
pub(crate) async fn handle_upgrade(
    proxy: &Proxy,
    req: Request<Body>,
    mut ctx: ProxyContext,
) -> Response<Body> {
    let head = RequestHead::from_request(&req);
    let Some(target) = connect_target(&head) else {
        return status_only(StatusCode::BAD_REQUEST);
    };
    let decision = decide(proxy, &target, &mut ctx);
    ctx.request = Some(head.clone());
    let client_addr = ctx.client_addr();

    match prepare(proxy, &head, decision).await {
        Plan::Reject => return status_only(StatusCode::FORBIDDEN),
        Plan::BadGateway => return status_only(StatusCode::BAD_GATEWAY),
        Plan::Forward(mut upstream) => {
            let idle = proxy.timeouts().idle;
            on_upgraded(req, move |mut client| async move {
                match wire::relay(&mut client, &mut upstream, idle).await {
                    Ok((up, down)) => tracing::debug!(up, down, "tunnel closed"),
                    Err(e) => tracing::debug!(error = %e, "tunnel ended"),
                }
            });
        }
        Plan::Mitm(host) => {
            let proxy = proxy.clone();
            on_upgraded(req, move |client| tunnel::run(proxy, client, host, client_addr));
        }
        Plan::Hijack(hijack) => {
            on_upgraded(req, move |client| hijack(head, Box::new(client) as BoxedIo, ctx));
        }
    }
    status_only(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::connect_head;

    #[test]
    fn targets_default_to_port_443() {
        assert_eq!(connect_target(&connect_head("good.test")).as_deref(), Some("good.test:443"));
        assert_eq!(
            connect_target(&connect_head("good.test:8443")).as_deref(),
            Some("good.test:8443")
        );
        assert_eq!(connect_target(&connect_head("[::1]:443")).as_deref(), Some("[::1]:443"));
    }
}
