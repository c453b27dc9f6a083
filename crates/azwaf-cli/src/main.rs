//! AzWaf CLI
//!
//! Evaluates raw HTTP/1.x request files against a WAF policy and prints one
//! decision per file.
//!
//! # Usage
//!
//! ```bash
//! CONFIG_PATH=/etc/azwaf/azwaf.json azwaf --config-id site1 req1.http req2.http
//! azwaf --json --geo-db geoip.json blocked.http
//! ```

use anyhow::{bail, Context};
use azwaf_core::customrule::GeoIpRecord;
use azwaf_core::waf::{PolicyConfig, SecRuleConfig, TracingResultsLogger};
use azwaf_core::{HttpRequest, Waf, WafConfig};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const MAX_HEADERS: usize = 128;

#[derive(Parser)]
#[command(name = "azwaf")]
#[command(version)]
#[command(about = "Evaluate raw HTTP requests with AzWaf", long_about = None)]
struct Cli {
    /// WAF configuration (JSON)
    #[arg(long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Policy the requests are evaluated against
    #[arg(long, default_value = "default")]
    config_id: String,

    /// GeoIP ranges for GeoMatch custom rules (JSON list)
    #[arg(long)]
    geo_db: Option<PathBuf>,

    /// Client address seen by the rules
    #[arg(long, default_value = "127.0.0.1")]
    remote_addr: String,

    /// Print decisions as JSON lines
    #[arg(long)]
    json: bool,

    /// Raw HTTP/1.x request files
    #[arg(required = true)]
    requests: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => Some(WafConfig::load(path).with_context(|| format!("loading config {}", path.display()))?),
        None => None,
    };
    let from_file = loaded.is_some();
    let mut config = loaded.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("AzWaf v{}", env!("CARGO_PKG_VERSION"));

    if !from_file {
        tracing::warn!("CONFIG_PATH not set, using defaults");
    }
    if config.policies.is_empty() {
        tracing::warn!(config_id = %cli.config_id, "No policies configured, using the default CRS policy");
        config.policies.push(PolicyConfig {
            config_id: cli.config_id.clone(),
            secrule: Some(SecRuleConfig::default()),
            ..Default::default()
        });
    }

    let waf = Waf::new(&config).context("building WAF")?;

    if let Some(path) = &cli.geo_db {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading GeoIP data {}", path.display()))?;
        let records: Vec<GeoIpRecord> = serde_json::from_slice(&data).context("parsing GeoIP data")?;
        tracing::info!(records = records.len(), "GeoIP data loaded");
        waf.put_geo_ip_data(records).context("loading GeoIP data")?;
    }

    let logger = TracingResultsLogger;
    let mut failed = 0usize;
    for path in &cli.requests {
        let outcome = match read_request(path, &cli).await {
            Ok(request) => waf.evaluate(&request, &logger).map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(decision) if cli.json => {
                let line = serde_json::json!({
                    "file": path.display().to_string(),
                    "decision": decision,
                    "status": decision.http_status(),
                });
                println!("{line}");
            }
            Ok(decision) => println!("{}: {:?} ({})", path.display(), decision, decision.http_status()),
            Err(e) => {
                tracing::error!(file = %path.display(), error = %format!("{e:#}"), "Request not evaluated");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} requests could not be evaluated", cli.requests.len());
    }
    Ok(())
}

async fn read_request(path: &Path, cli: &Cli) -> anyhow::Result<HttpRequest> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_request(&raw, &cli.config_id, &cli.remote_addr).with_context(|| format!("parsing {}", path.display()))
}

/// Split a raw HTTP/1.x request into head and body
fn parse_request(raw: &[u8], config_id: &str, remote_addr: &str) -> anyhow::Result<HttpRequest> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(raw).context("malformed request head")? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => bail!("incomplete request head"),
    };

    Ok(HttpRequest {
        method: req.method.unwrap_or_default().to_string(),
        uri: req.path.unwrap_or_default().to_string(),
        protocol: format!("HTTP/1.{}", req.version.unwrap_or(1)),
        remote_addr: remote_addr.to_string(),
        headers: req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
            .collect(),
        config_id: config_id.to_string(),
        body: raw[head_len..].to_vec().into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let raw = b"POST /login?next=%2F HTTP/1.1\r\n\
                    Host: example.com\r\n\
                    Content-Type: application/x-www-form-urlencoded\r\n\
                    Content-Length: 11\r\n\
                    \r\n\
                    user=a&pw=b";
        let req = parse_request(raw, "site1", "10.1.2.3").unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.uri, "/login?next=%2F");
        assert_eq!(req.protocol, "HTTP/1.1");
        assert_eq!(req.header("host"), Some("example.com"));
        assert_eq!(req.content_length(), Some(11));
        assert_eq!(&req.body[..], b"user=a&pw=b");
        assert_eq!(req.config_id, "site1");
        assert_eq!(req.remote_addr, "10.1.2.3");
    }

    #[test]
    fn test_parse_incomplete_request() {
        assert!(parse_request(b"GET / HTTP/1.1\r\nHost: x\r\n", "c", "::1").is_err());
        assert!(parse_request(b"\x01\x02 garbage\r\n\r\n", "c", "::1").is_err());
    }

    #[test]
    fn test_cli_args() {
        let cli = Cli::try_parse_from(["azwaf", "--config-id", "site1", "--json", "a.http", "b.http"]).unwrap();
        assert_eq!(cli.config_id, "site1");
        assert!(cli.json);
        assert_eq!(cli.requests.len(), 2);
        assert!(Cli::try_parse_from(["azwaf"]).is_err());
    }
}
