//! Reachability probes.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::util::{is_http_url, normalize_text_option};

/// Address used to ask the OS for a route; no packet is sent.
const ROUTE_CHECK_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53);

/// Source of raw connectivity signals for the monitor.
pub trait ReachabilityProbe: Send + Sync + 'static {
    /// Whether the local network stack has a usable route.
    fn interface_up(&self) -> bool;

    /// Whether the server answered a health request.
    fn probe(&self) -> impl Future<Output = bool> + Send;
}

/// Probes `GET {server}/health`.
#[derive(Clone)]
pub struct HttpReachabilityProbe {
    health_url: String,
    loopback: bool,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpReachabilityProbe {
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self> {
        let server_url = normalize_text_option(Some(server_url.to_string()))
            .filter(|url| is_http_url(url))
            .ok_or_else(|| Error::Config("server URL must include http:// or https://".to_string()))?;
        let parsed = reqwest::Url::parse(&server_url)
            .map_err(|error| Error::Config(format!("invalid server URL: {error}")))?;

        let loopback = parsed.host_str().is_some_and(|host| {
            host.eq_ignore_ascii_case("localhost")
                || host
                    .trim_matches(|c| c == '[' || c == ']')
                    .parse::<IpAddr>()
                    .is_ok_and(|ip| ip.is_loopback())
        });

        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| Error::Config(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            health_url: format!("{}/health", server_url.trim_end_matches('/')),
            loopback,
            timeout,
            client,
        })
    }

    pub fn health_url(&self) -> &str {
        &self.health_url
    }
}

impl ReachabilityProbe for HttpReachabilityProbe {
    fn interface_up(&self) -> bool {
        // A server on this machine needs no outside route.
        if self.loopback {
            return true;
        }
        UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .and_then(|socket| socket.connect(ROUTE_CHECK_ADDR))
            .is_ok()
    }

    async fn probe(&self) -> bool {
        match self
            .client
            .get(&self.health_url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::debug!(status = %response.status(), "Health check rejected");
                false
            }
            Err(error) => {
                tracing::debug!("Health check failed: {error}");
                false
            }
        }
    }
}
