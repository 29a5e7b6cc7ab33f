//! Address discovery: the relay tells producers which LAN address to use.

use axum::Json;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Duration;
use tracing::{info, warn};

/// Used when discovery fails for any reason
pub const FALLBACK_HOST: &str = "localhost";

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Body of `GET /local-ip`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIp {
    pub ip: String,
}

/// Best-effort non-loopback IPv4 of this host, `127.0.0.1` if there is none.
pub fn local_ipv4() -> Ipv4Addr {
    probe_route()
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
        .unwrap_or(Ipv4Addr::LOCALHOST)
}

/// Ask the routing table which interface would reach the outside world.
/// Connecting a UDP socket sends nothing.
fn probe_route() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}

pub async fn local_ip_handler() -> Json<LocalIp> {
    Json(LocalIp {
        ip: local_ipv4().to_string(),
    })
}

/// Host the producer should connect to, falling back to `localhost`.
pub async fn resolve_relay_host(discovery_url: &str) -> String {
    let url = discovery_url.to_string();
    match tokio::task::spawn_blocking(move || fetch_local_ip(&url)).await {
        Ok(Ok(ip)) if !ip.is_empty() => {
            info!("relay address discovered: {}", ip);
            ip
        }
        Ok(Ok(_)) => {
            warn!("discovery returned an empty address, using {}", FALLBACK_HOST);
            FALLBACK_HOST.to_string()
        }
        Ok(Err(e)) => {
            warn!(
                "address discovery via {} failed: {}; using {}",
                discovery_url, e, FALLBACK_HOST
            );
            FALLBACK_HOST.to_string()
        }
        Err(e) => {
            warn!("address discovery task failed: {}", e);
            FALLBACK_HOST.to_string()
        }
    }
}

fn fetch_local_ip(url: &str) -> Result<String, ureq::Error> {
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(DISCOVERY_TIMEOUT))
        .build()
        .into();
    let mut response = agent.get(url).call()?;
    let body: LocalIp = response.body_mut().read_json()?;
    Ok(body.ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ipv4_is_never_unspecified() {
        let ip = local_ipv4();
        assert!(!ip.is_unspecified());
    }

    #[test]
    fn test_local_ip_body_shape() {
        let body = serde_json::to_string(&LocalIp {
            ip: "192.168.1.20".into(),
        })
        .unwrap();
        assert_eq!(body, r#"{"ip":"192.168.1.20"}"#);
    }

    #[tokio::test]
    async fn test_unreachable_discovery_falls_back() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let host = resolve_relay_host(&format!("http://127.0.0.1:{}/local-ip", port)).await;
        assert_eq!(host, FALLBACK_HOST);
    }
}
