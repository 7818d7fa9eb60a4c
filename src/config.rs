use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context as _;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use regex::Regex;
use serde::Deserialize;

use crate::condition::{self, ConditionRef};
use crate::handler::{ALWAYS_MITM, ALWAYS_REJECT, ConnectAction, OK_CONNECT};
use crate::http::new_response;
use crate::{CertificateAuthority, ProxyBuilder, Timeouts, transport};

/// Top-level proxy configuration, usually loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct ProxyConfig {
    /// Listen address, e.g. "127.0.0.1:8080".
    pub listen: Option<String>,

    /// CA certificate and key paths. Required for interception.
    pub ca: Option<CaConfig>,

    /// Accept invalid upstream TLS certificates.
    #[serde(default)]
    pub accept_invalid_upstream_certs: bool,

    /// Forward `Proxy-*` and `Accept-Encoding` request headers unchanged.
    #[serde(default)]
    pub keep_header: bool,

    /// Keep headers staged by handlers next to the upstream ones.
    #[serde(default)]
    pub keep_destination_headers: bool,

    /// Time allowed for the first request head and client TLS handshakes, e.g. "10s".
    pub handshake_timeout: Option<DurationValue>,

    /// Idle timeout for tunnels and byte relays, e.g. "60s".
    pub idle_timeout: Option<DurationValue>,

    /// Timeout for opening upstream connections.
    pub connect_timeout: Option<DurationValue>,

    /// Timeout for a whole upstream round trip.
    pub upstream_timeout: Option<DurationValue>,

    /// Validity of minted leaf certificates. Default: 365 days.
    pub leaf_validity: Option<DurationValue>,

    /// Reissue cached leaf certificates older than this.
    pub leaf_cache_ttl: Option<DurationValue>,

    /// Chain forwarded tunnels through this HTTP proxy, e.g. "http://corp:3128".
    /// Falls back to `HTTPS_PROXY` when unset.
    pub upstream_proxy: Option<String>,

    /// Action for tunnels no `[[connect]]` rule matches. Default: reject.
    pub default_connect: Option<ConnectActionConfig>,

    /// Ordered tunnel rules; the first matching host wins.
    #[serde(default)]
    pub connect: Vec<ConnectRule>,

    /// Ordered request/response rules.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Deserialize)]
pub struct CaConfig {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectActionConfig {
    Forward,
    Mitm,
    Reject,
}

impl From<ConnectActionConfig> for ConnectAction {
    fn from(action: ConnectActionConfig) -> Self {
        match action {
            ConnectActionConfig::Forward => ConnectAction::Forward,
            ConnectActionConfig::Mitm => ConnectAction::Mitm,
            ConnectActionConfig::Reject => ConnectAction::Reject,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectRule {
    /// Regex over the `host:port` of the tunnel.
    pub host: String,
    pub action: ConnectActionConfig,
}

/// A single rule: an optional match plus what to do with matching traffic.
#[derive(Debug, Default, Deserialize)]
pub struct RuleConfig {
    #[serde(rename = "match")]
    pub match_config: Option<MatchConfig>,

    /// Answer matching requests locally instead of going upstream.
    pub respond: Option<RespondConfig>,

    pub request_headers: Option<HeaderOpsConfig>,
    pub response_headers: Option<HeaderOpsConfig>,
}

/// Every field that is set must match.
#[derive(Debug, Default, Deserialize)]
pub struct MatchConfig {
    /// Host with or without port, case-insensitive.
    pub host: Option<String>,
    /// Path, or host + path.
    pub path: Option<String>,
    /// Prefix of host + path.
    pub url_prefix: Option<String>,
    /// Client address or address prefix ending in `.` or `:`.
    pub src_ip: Option<String>,
    /// Media type, matched against the response on response rules.
    pub content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RespondConfig {
    #[serde(default)]
    pub body: String,
    pub status: Option<u16>,
    pub content_type: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct HeaderOpsConfig {
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    #[serde(default)]
    pub append: BTreeMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

/// A duration written as `"250ms"` or `"1.5s"`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationValue(pub Duration);

impl<'de> Deserialize<'de> for DurationValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s)
            .map(DurationValue)
            .map_err(serde::de::Error::custom)
    }
}

/// Parse `"200ms"`, `"10s"`, `"5m"`, `"2h"` or `"365d"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        let n: u64 = ms.parse().map_err(|e| format!("invalid duration: {e}"))?;
        return Ok(Duration::from_millis(n));
    }
    let scale = match s.chars().last() {
        Some('s') => 1.0,
        Some('m') => 60.0,
        Some('h') => 3600.0,
        Some('d') => 86400.0,
        _ => return Err(format!("expected duration like '200ms' or '1s', got '{s}'")),
    };
    let n: f64 = s[..s.len() - 1]
        .parse()
        .map_err(|e| format!("invalid duration: {e}"))?;
    if !n.is_finite() || n < 0.0 {
        return Err(format!("invalid duration '{s}'"));
    }
    Duration::try_from_secs_f64(n * scale).map_err(|e| format!("invalid duration '{s}': {e}"))
}

struct HeaderOps {
    set: Vec<(HeaderName, HeaderValue)>,
    append: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

impl HeaderOps {
    fn parse(config: HeaderOpsConfig) -> anyhow::Result<Self> {
        fn pair(name: &str, value: &str) -> anyhow::Result<(HeaderName, HeaderValue)> {
            let n = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name '{name}'"))?;
            let v = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header '{name}'"))?;
            Ok((n, v))
        }
        Ok(Self {
            set: config
                .set
                .iter()
                .map(|(n, v)| pair(n, v))
                .collect::<anyhow::Result<_>>()?,
            append: config
                .append
                .iter()
                .map(|(n, v)| pair(n, v))
                .collect::<anyhow::Result<_>>()?,
            remove: config
                .remove
                .iter()
                .map(|n| {
                    HeaderName::from_bytes(n.as_bytes())
                        .with_context(|| format!("invalid header name '{n}'"))
                })
                .collect::<anyhow::Result<_>>()?,
        })
    }

    fn apply(&self, headers: &mut HeaderMap) {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in &self.append {
            headers.append(name.clone(), value.clone());
        }
    }
}

impl MatchConfig {
    fn into_conditions(self) -> Vec<ConditionRef> {
        let mut conds = Vec::new();
        if let Some(host) = self.host {
            conds.push(condition::host_is([host]));
        }
        if let Some(path) = self.path {
            conds.push(condition::url_is([path]));
        }
        if let Some(prefix) = self.url_prefix {
            conds.push(condition::url_has_prefix(prefix));
        }
        if let Some(ip) = self.src_ip {
            conds.push(condition::src_ip_is([ip]));
        }
        if let Some(content_type) = self.content_type {
            conds.push(condition::content_type_is([content_type]));
        }
        conds
    }
}

impl ProxyConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load config from a TOML file.
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Timeouts with unset entries left at their defaults.
    pub fn timeouts(&self) -> Timeouts {
        let mut timeouts = Timeouts::default();
        if let Some(t) = self.handshake_timeout {
            timeouts.handshake = t.0;
        }
        if let Some(t) = self.idle_timeout {
            timeouts.idle = t.0;
        }
        if let Some(t) = self.connect_timeout {
            timeouts.connect = t.0;
        }
        if let Some(t) = self.upstream_timeout {
            timeouts.upstream = t.0;
        }
        timeouts
    }

    /// Build a [`ProxyBuilder`] from this config.
    pub fn into_builder(self) -> anyhow::Result<ProxyBuilder> {
        let timeouts = self.timeouts();
        let mut builder = crate::Proxy::builder()
            .keep_header(self.keep_header)
            .keep_destination_headers(self.keep_destination_headers)
            .timeouts(timeouts.clone());

        if let Some(ca) = self.ca {
            let mut authority = CertificateAuthority::from_pem_files(&ca.cert, &ca.key)
                .with_context(|| format!("loading CA from {} and {}", ca.cert, ca.key))?;
            if let Some(validity) = self.leaf_validity {
                authority = authority.with_leaf_validity(validity.0);
            }
            authority = authority.with_cache_ttl(self.leaf_cache_ttl.map(|t| t.0));
            builder = builder.ca(authority);
        }

        if self.accept_invalid_upstream_certs {
            builder = builder.danger_accept_invalid_upstream_certs();
        }

        if let Some(upstream) = self.upstream_proxy.as_deref() {
            builder = builder.dialer(transport::dialer_for_proxy(Some(upstream), timeouts.connect));
        }

        if let Some(action) = self.default_connect {
            builder = builder.default_connect(action.into());
        }

        for rule in self.connect {
            let re = Regex::new(&rule.host)
                .with_context(|| format!("invalid connect host pattern '{}'", rule.host))?;
            let on = builder.on_request([condition::req_host_matches(re)]);
            builder = match rule.action {
                ConnectActionConfig::Forward => on.handle_connect(&OK_CONNECT),
                ConnectActionConfig::Mitm => on.handle_connect(&ALWAYS_MITM),
                ConnectActionConfig::Reject => on.handle_connect(&ALWAYS_REJECT),
            };
        }

        for rule in self.rules {
            builder = apply_rule(builder, rule)?;
        }

        Ok(builder)
    }
}

fn apply_rule(mut builder: ProxyBuilder, rule: RuleConfig) -> anyhow::Result<ProxyBuilder> {
    let conds = rule
        .match_config
        .map(MatchConfig::into_conditions)
        .unwrap_or_default();

    if let Some(ops) = rule.request_headers {
        let ops = HeaderOps::parse(ops)?;
        builder = builder.on_request(conds.clone()).do_fn(move |mut req, _ctx| {
            ops.apply(req.headers_mut());
            (req, None)
        });
    }

    if let Some(respond) = rule.respond {
        let status = match respond.status {
            Some(code) => StatusCode::from_u16(code)
                .with_context(|| format!("invalid status code {code}"))?,
            None => StatusCode::OK,
        };
        let content_type = respond
            .content_type
            .unwrap_or_else(|| "text/plain".to_string());
        HeaderValue::from_str(&content_type)
            .with_context(|| format!("invalid content type '{content_type}'"))?;
        let body = bytes::Bytes::from(respond.body);
        builder = builder.on_request(conds.clone()).do_fn(move |req, _ctx| {
            let resp = new_response(status, &content_type, body.clone());
            (req, Some(resp))
        });
    }

    if let Some(ops) = rule.response_headers {
        let ops = HeaderOps::parse(ops)?;
        builder = builder.on_response(conds).do_fn(move |resp, _ctx| {
            resp.map(|mut resp| {
                ops.apply(resp.headers_mut());
                resp
            })
        });
    }

    Ok(builder)
}
