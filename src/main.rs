use std::path::Path;

use clap::Parser;
use interpose::config::{CaConfig, ConnectActionConfig, ConnectRule, HeaderOpsConfig, ProxyConfig, RuleConfig};

#[derive(Parser)]
#[command(name = "interpose", about = "Intercepting HTTP/HTTPS forward proxy")]
struct Cli {
    /// Path to TOML config file
    #[arg(short, long)]
    config: Option<String>,

    /// Path to CA certificate PEM file
    #[arg(long = "cert", default_value = "ca-cert.pem")]
    cert: String,

    /// Path to CA private key PEM file
    #[arg(long = "key", default_value = "ca-key.pem")]
    key: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Generate a new CA cert+key pair and exit
    #[arg(long)]
    generate: bool,

    /// Intercept every tunnel no other rule decides on
    #[arg(long)]
    mitm: bool,

    /// Refuse tunnels whose host:port matches this regex (repeatable)
    #[arg(long = "reject-host")]
    reject_hosts: Vec<String>,

    /// Set a response header on every proxied response (format: "name: value", repeatable)
    #[arg(long = "set-response-header")]
    set_response_headers: Vec<String>,

    /// Chain forwarded tunnels through this HTTP proxy
    #[arg(long = "upstream-proxy")]
    upstream_proxy: Option<String>,

    /// Accept invalid upstream TLS certificates
    #[arg(long)]
    accept_invalid_certs: bool,

    /// Log every request and tunnel decision
    #[arg(short, long)]
    verbose: bool,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "interpose=debug"
    } else {
        "interpose=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let span_events = tracing_subscriber::fmt::format::FmtSpan::CLOSE;
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_span_events(span_events)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_span_events(span_events)
            .init();
    }

    if cli.generate {
        let ca = interpose::CertificateAuthority::generate()?;
        ca.to_pem_files(&cli.cert, &cli.key)?;
        tracing::info!(path = %cli.cert, "generated CA certificate");
        tracing::info!(path = %cli.key, "generated CA private key");
        return Ok(());
    }

    let mut config = if let Some(ref path) = cli.config {
        ProxyConfig::from_toml_file(path)?
    } else {
        ProxyConfig::default()
    };

    // CLI overrides
    if config.ca.is_none() && Path::new(&cli.cert).exists() && Path::new(&cli.key).exists() {
        config.ca = Some(CaConfig {
            cert: cli.cert.clone(),
            key: cli.key.clone(),
        });
    }

    if cli.mitm {
        if config.ca.is_none() {
            anyhow::bail!(
                "--mitm needs a CA: {} / {} not found, create them with --generate",
                cli.cert,
                cli.key
            );
        }
        config.default_connect = Some(ConnectActionConfig::Mitm);
    }

    // rejections take precedence over config-file tunnel rules
    let mut connect: Vec<ConnectRule> = cli
        .reject_hosts
        .into_iter()
        .map(|host| ConnectRule {
            host,
            action: ConnectActionConfig::Reject,
        })
        .collect();
    connect.append(&mut config.connect);
    config.connect = connect;

    if !cli.set_response_headers.is_empty() {
        let mut ops = HeaderOpsConfig::default();
        for h in &cli.set_response_headers {
            let (name, value) = parse_header_arg(h)?;
            ops.set.insert(name, value);
        }
        config.rules.push(RuleConfig {
            response_headers: Some(ops),
            ..Default::default()
        });
    }

    if let Some(upstream) = cli.upstream_proxy {
        config.upstream_proxy = Some(upstream);
    }

    if cli.accept_invalid_certs {
        config.accept_invalid_upstream_certs = true;
    }

    let listen = config
        .listen
        .clone()
        .unwrap_or_else(|| format!("{}:{}", cli.bind, cli.port));
    let proxy = config.into_builder()?.build();
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    proxy
        .serve(listener, async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
}

fn parse_header_arg(s: &str) -> anyhow::Result<(String, String)> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("header must be 'name: value', got '{s}'"))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}
