//! Predicates that gate handler registrations.
//!
//! Every condition can be asked about a request and about a response. The
//! response side defaults to re-checking the request that produced it, so a
//! request predicate such as [`url_is`] can also guard a response handler.

use std::net::IpAddr;
use std::sync::Arc;

use http::Response;
use http::header::CONTENT_TYPE;
use regex::Regex;

use crate::ctx::ProxyContext;
use crate::http::{Body, RequestHead};

pub trait Condition: Send + Sync {
    fn matches_request(&self, req: &RequestHead, ctx: &ProxyContext) -> bool;

    fn matches_response(&self, _resp: Option<&Response<Body>>, ctx: &ProxyContext) -> bool {
        match &ctx.request {
            Some(req) => self.matches_request(req, ctx),
            None => false,
        }
    }
}

pub type ConditionRef = Arc<dyn Condition>;

struct ReqFn<F>(F);

impl<F> Condition for ReqFn<F>
where
    F: Fn(&RequestHead, &ProxyContext) -> bool + Send + Sync,
{
    fn matches_request(&self, req: &RequestHead, ctx: &ProxyContext) -> bool {
        (self.0)(req, ctx)
    }
}

struct RespFn<F>(F);

impl<F> Condition for RespFn<F>
where
    F: Fn(Option<&Response<Body>>, &ProxyContext) -> bool + Send + Sync,
{
    /// Response-only conditions never hold for requests.
    fn matches_request(&self, _req: &RequestHead, _ctx: &ProxyContext) -> bool {
        false
    }

    fn matches_response(&self, resp: Option<&Response<Body>>, ctx: &ProxyContext) -> bool {
        (self.0)(resp, ctx)
    }
}

/// Lift a closure over the request head into a condition.
pub fn req_condition_fn(
    f: impl Fn(&RequestHead, &ProxyContext) -> bool + Send + Sync + 'static,
) -> ConditionRef {
    Arc::new(ReqFn(f))
}

/// Lift a closure over the response into a condition that only applies to
/// response handlers.
pub fn resp_condition_fn(
    f: impl Fn(Option<&Response<Body>>, &ProxyContext) -> bool + Send + Sync + 'static,
) -> ConditionRef {
    Arc::new(RespFn(f))
}

/// The client connected from one of `ips`. An entry ending in `.` (or `:`
/// for IPv6) matches every address starting with it.
pub fn src_ip_is<I, S>(ips: I) -> ConditionRef
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let ips: Vec<String> = ips.into_iter().map(Into::into).collect();
    req_condition_fn(move |_, ctx| {
        let client = ctx.client_addr().ip();
        let text = client.to_string();
        ips.iter().any(|ip| {
            if ip.ends_with('.') || ip.ends_with(':') {
                text.starts_with(ip.as_str())
            } else {
                ip.parse::<IpAddr>().is_ok_and(|parsed| parsed == client)
            }
        })
    })
}

/// The request path, or host and path together, equal one of `urls`.
pub fn url_is<I, S>(urls: I) -> ConditionRef
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let urls: Vec<String> = urls.into_iter().map(Into::into).collect();
    req_condition_fn(move |req, _| {
        let path = req.uri.path();
        let host_path = format!("{}{}", req.authority().unwrap_or(""), path);
        urls.iter().any(|u| u == path || *u == host_path)
    })
}

/// Like [`url_is`] but matching prefixes.
pub fn url_has_prefix(prefix: impl Into<String>) -> ConditionRef {
    let prefix = prefix.into();
    req_condition_fn(move |req, _| {
        let path = req.uri.path();
        if path.starts_with(prefix.as_str()) {
            return true;
        }
        let host_path = format!("{}{}", req.authority().unwrap_or(""), path);
        host_path.starts_with(prefix.as_str())
    })
}

/// `host + path` matches the regular expression.
pub fn url_matches(re: Regex) -> ConditionRef {
    req_condition_fn(move |req, _| {
        let host_path = format!("{}{}", req.authority().unwrap_or(""), req.uri.path());
        re.is_match(&host_path)
    })
}

/// The target host, with or without its port, is one of `hosts`.
pub fn host_is<I, S>(hosts: I) -> ConditionRef
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let hosts: Vec<String> = hosts.into_iter().map(Into::into).collect();
    req_condition_fn(move |req, _| {
        let Some(authority) = req.authority() else {
            return false;
        };
        let hostname = req.hostname().unwrap_or(authority);
        hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(authority) || h.eq_ignore_ascii_case(hostname))
    })
}

/// The target `host[:port]` matches the regular expression. For `CONNECT`
/// requests this is the tunnel target.
pub fn req_host_matches(re: Regex) -> ConditionRef {
    req_condition_fn(move |req, _| req.authority().is_some_and(|a| re.is_match(a)))
}

/// The `Content-Type` is one of `types`, ignoring parameters. Requests are
/// checked against their own header, responses against the response's.
pub fn content_type_is<I, S>(types: I) -> ConditionRef
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let types: Arc<Vec<String>> = Arc::new(types.into_iter().map(Into::into).collect());
    Arc::new(ContentTypeIs(types))
}

struct ContentTypeIs(Arc<Vec<String>>);

impl ContentTypeIs {
    fn check(&self, value: Option<&http::HeaderValue>) -> bool {
        let Some(value) = value.and_then(|v| v.to_str().ok()) else {
            return false;
        };
        self.0.iter().any(|t| media_type_matches(value, t))
    }
}

impl Condition for ContentTypeIs {
    fn matches_request(&self, req: &RequestHead, _ctx: &ProxyContext) -> bool {
        self.check(req.headers.get(CONTENT_TYPE))
    }

    fn matches_response(&self, resp: Option<&Response<Body>>, _ctx: &ProxyContext) -> bool {
        resp.is_some_and(|r| self.check(r.headers().get(CONTENT_TYPE)))
    }
}

fn media_type_matches(value: &str, wanted: &str) -> bool {
    if value == wanted {
        return true;
    }
    match value.strip_prefix(wanted) {
        Some(rest) => rest.trim_start().starts_with(';'),
        None => false,
    }
}

/// Negates `cond` on both sides.
pub fn not(cond: ConditionRef) -> ConditionRef {
    Arc::new(Not(cond))
}

struct Not(ConditionRef);

impl Condition for Not {
    fn matches_request(&self, req: &RequestHead, ctx: &ProxyContext) -> bool {
        !self.0.matches_request(req, ctx)
    }

    fn matches_response(&self, resp: Option<&Response<Body>>, ctx: &ProxyContext) -> bool {
        !self.0.matches_response(resp, ctx)
    }
}

#[cfg(test)]
mod tests {
    use http::Request;

    use super::*;
    use crate::Proxy;
    use crate::http::new_response;

    fn ctx_from(addr: &str) -> ProxyContext {
        ProxyContext::new(Proxy::builder().build(), addr.parse().unwrap())
    }

    fn head(uri: &str) -> RequestHead {
        RequestHead::from_request(&Request::builder().uri(uri).body(()).unwrap())
    }

    #[test]
    fn url_is_matches_path_or_host_and_path() {
        let ctx = ctx_from("127.0.0.1:1");
        let cond = url_is(["/koko"]);
        assert!(cond.matches_request(&head("http://a.test/koko"), &ctx));
        assert!(cond.matches_request(&head("http://b.test:8080/koko"), &ctx));
        assert!(!cond.matches_request(&head("http://a.test/koko/x"), &ctx));

        let cond = url_is(["a.test/koko"]);
        assert!(cond.matches_request(&head("http://a.test/koko"), &ctx));
        assert!(!cond.matches_request(&head("http://b.test/koko"), &ctx));
    }

    #[test]
    fn content_type_ignores_parameters_only() {
        let ctx = ctx_from("127.0.0.1:1");
        let cond = content_type_is(["image/png"]);
        for (value, expected) in [
            ("image/png", true),
            ("image/png; charset=binary", true),
            ("image/png ;q=1", true),
            ("image/pngish", false),
            ("image/jpeg", false),
        ] {
            let resp = new_response(http::StatusCode::OK, value, "");
            assert_eq!(cond.matches_response(Some(&resp), &ctx), expected, "{value}");
        }
        assert!(!cond.matches_response(None, &ctx));
    }

    #[test]
    fn content_type_on_request_side_reads_request_header() {
        let ctx = ctx_from("127.0.0.1:1");
        let req = Request::builder()
            .uri("http://a.test/upload")
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .body(())
            .unwrap();
        let head = RequestHead::from_request(&req);
        assert!(content_type_is(["application/json"]).matches_request(&head, &ctx));
        assert!(!content_type_is(["text/html"]).matches_request(&head, &ctx));
    }

    #[test]
    fn src_ip_exact_and_prefix() {
        let ctx = ctx_from("10.1.2.3:5555");
        let req = head("http://a.test/");
        assert!(src_ip_is(["10.1.2.3"]).matches_request(&req, &ctx));
        assert!(src_ip_is(["10.1."]).matches_request(&req, &ctx));
        assert!(!src_ip_is(["10.1.2.30", "127.0.0.1"]).matches_request(&req, &ctx));
    }

    #[test]
    fn response_side_defaults_to_request_snapshot() {
        let mut ctx = ctx_from("127.0.0.1:1");
        let cond = host_is(["a.test"]);
        assert!(!cond.matches_response(None, &ctx));
        ctx.request = Some(head("http://a.test:8080/x"));
        assert!(cond.matches_response(None, &ctx));
        assert!(!not(cond).matches_response(None, &ctx));
    }

    #[test]
    fn regex_conditions() {
        let ctx = ctx_from("127.0.0.1:1");
        let host = req_host_matches(Regex::new(r"^.*\.example\.com:443$").unwrap());
        assert!(host.matches_request(&head("https://www.example.com:443/"), &ctx));
        assert!(!host.matches_request(&head("https://example.org:443/"), &ctx));

        let url = url_matches(Regex::new(r"^a\.test/api/v\d+/").unwrap());
        assert!(url.matches_request(&head("http://a.test/api/v2/users"), &ctx));
        assert!(!url.matches_request(&head("http://a.test/api/latest/"), &ctx));
        assert!(url_has_prefix("/api").matches_request(&head("http://a.test/api/x"), &ctx));
    }

    #[test]
    fn response_fn_never_matches_requests() {
        let ctx = ctx_from("127.0.0.1:1");
        let cond = resp_condition_fn(|resp, _| resp.is_some_and(|r| r.status().is_success()));
        assert!(!cond.matches_request(&head("http://a.test/"), &ctx));
        let ok = new_response(http::StatusCode::OK, "text/plain", "");
        assert!(cond.matches_response(Some(&ok), &ctx));
    }
}
