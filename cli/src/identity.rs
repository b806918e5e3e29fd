/// Exit identity check through the active proxy.
///
/// Purely informational: a failed probe is logged and ignored.
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityReport {
    pub address: String,
    pub is_anonymized: bool,
}

pub trait IdentityProbe {
    async fn probe(&self, proxy_url: &str) -> Option<IdentityReport>;
}

/// A disabled probe is `None`.
impl<T: IdentityProbe> IdentityProbe for Option<T> {
    async fn probe(&self, proxy_url: &str) -> Option<IdentityReport> {
        match self {
            Some(probe) => probe.probe(proxy_url).await,
            None => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TorCheckResponse {
    #[serde(rename = "IP")]
    ip: String,
    #[serde(rename = "IsTor")]
    is_tor: bool,
}

/// Parse the check.torproject.org `api/ip` JSON body.
pub fn parse_report(body: &str) -> Option<IdentityReport> {
    match serde_json::from_str::<TorCheckResponse>(body) {
        Ok(resp) => Some(IdentityReport {
            address: resp.ip,
            is_anonymized: resp.is_tor,
        }),
        Err(e) => {
            warn!("Unexpected identity check response: {}", e);
            None
        }
    }
}

pub struct TorCheckProbe {
    url: String,
    timeout: Duration,
}

impl TorCheckProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: PROBE_TIMEOUT,
        }
    }

    async fn request(&self, proxy_url: &str) -> reqwest::Result<String> {
        // socks5h: hostname resolution happens on the exit side too.
        let proxy_url = proxy_url.replacen("socks5://", "socks5h://", 1);
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(proxy_url)?)
            .timeout(self.timeout)
            .build()?;
        client.get(&self.url).send().await?.error_for_status()?.text().await
    }
}

impl IdentityProbe for TorCheckProbe {
    async fn probe(&self, proxy_url: &str) -> Option<IdentityReport> {
        debug!("Checking exit identity via {}", self.url);
        match self.request(proxy_url).await {
            Ok(body) => parse_report(&body),
            Err(e) => {
                warn!("Identity check failed: {}", e);
                None
            }
        }
    }
}
