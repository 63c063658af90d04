//! UDP broadcast discovery of a reader on the local network.
//!
//! A short probe is broadcast to a fixed set of ports. The device answers
//! with a line such as `crosspoint (on CrossPoint-Reader);81`, whose
//! `;`-suffix is the WebSocket port. The host is taken from the datagram's
//! source address.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::core::models::DeviceEndpoint;

/// Identifier token every compatible reply carries.
const DEVICE_TOKEN: &str = "crosspoint";

const MAX_REPLY_LEN: usize = 256;

pub struct DiscoveryClient {
    config: DiscoveryConfig,
    extra_hosts: Vec<String>,
}

impl DiscoveryClient {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            extra_hosts: Vec::new(),
        }
    }

    /// Also probe `host` directly, and its /24 broadcast address.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        if !host.trim().is_empty() {
            self.extra_hosts.push(host);
        }
        self
    }

    /// Probe for a device. The first well-formed reply wins.
    ///
    /// Every failure (socket setup, send errors, no reply) resolves to
    /// `None` so the caller can fall back to a static address.
    pub async fn discover(&self) -> Option<DeviceEndpoint> {
        let socket = match bind_broadcast_socket() {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "Discovery socket setup failed");
                return None;
            }
        };

        if let Ok(local) = socket.local_addr() {
            debug!(local = %local, "Discovery socket bound");
        }

        let targets = self.targets();
        let per_round = Duration::from_millis(self.config.timeout_ms);
        let attempts = self.config.attempts.max(1);
        debug!(targets = targets.len(), attempts, "Probing for devices");

        let mut buf = [0u8; MAX_REPLY_LEN];
        for attempt in 1..=attempts {
            debug!(attempt, attempts, "Discovery round");

            for target in &targets {
                if let Err(e) = socket
                    .send_to(self.config.probe.as_bytes(), target)
                    .await
                {
                    debug!(target = %target, error = %e, "Probe send failed");
                }
            }

            let deadline = Instant::now() + per_round;
            loop {
                let (len, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
                    Err(_) => break,
                    Ok(Err(e)) => {
                        debug!(error = %e, "Discovery receive failed");
                        break;
                    }
                    Ok(Ok(received)) => received,
                };

                let text = String::from_utf8_lossy(&buf[..len]);
                match parse_reply(&text) {
                    Some(port) => {
                        let endpoint = DeviceEndpoint::new(from.ip().to_string(), port);
                        info!(device = %endpoint, "Discovered device");
                        return Some(endpoint);
                    }
                    None => debug!(from = %from, reply = %text, "Ignoring malformed reply"),
                }
            }
        }

        info!("No device answered discovery");
        None
    }

    fn targets(&self) -> Vec<SocketAddr> {
        let mut hosts = vec![Ipv4Addr::BROADCAST];
        for host in &self.extra_hosts {
            match host.parse::<Ipv4Addr>() {
                Ok(addr) => {
                    hosts.push(addr);
                    if let Some(bcast) = subnet_broadcast(addr) {
                        hosts.push(bcast);
                    }
                }
                Err(_) => debug!(host = %host, "Skipping non-IPv4 discovery host"),
            }
        }
        hosts.dedup();

        hosts
            .into_iter()
            .flat_map(|ip| {
                self.config
                    .ports
                    .iter()
                    .map(move |port| SocketAddr::from((ip, *port)))
            })
            .collect()
    }
}

fn bind_broadcast_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
    socket.bind(&bind_addr.into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// The `x.y.z.255` broadcast address of `host`'s /24.
fn subnet_broadcast(host: Ipv4Addr) -> Option<Ipv4Addr> {
    if host.is_loopback() || host.is_broadcast() || host.is_unspecified() {
        return None;
    }
    let [a, b, c, _] = host.octets();
    Some(Ipv4Addr::new(a, b, c, 255))
}

/// Extract the advertised port from a discovery reply.
///
/// The reply must carry the device token and a `;` followed by a decimal
/// port; anything after a `,` is ignored.
pub fn parse_reply(text: &str) -> Option<u16> {
    if !text.to_ascii_lowercase().contains(DEVICE_TOKEN) {
        return None;
    }
    let (_, tail) = text.split_once(';')?;
    let port = tail.split(',').next()?.trim();
    match port.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply("crosspoint (on CrossPoint-Reader);81"), Some(81));
        assert_eq!(parse_reply("CrossPoint;8080, extra"), Some(8080));
        assert_eq!(parse_reply("crosspoint; 81 \n"), Some(81));
    }

    #[test]
    fn test_parse_reply_rejects_malformed() {
        assert_eq!(parse_reply("crosspoint"), None);
        assert_eq!(parse_reply("crosspoint;abc"), None);
        assert_eq!(parse_reply("crosspoint;0"), None);
        assert_eq!(parse_reply("crosspoint;70000"), None);
        assert_eq!(parse_reply("printer;81"), None);
        assert_eq!(parse_reply(""), None);
    }

    #[test]
    fn test_subnet_broadcast() {
        assert_eq!(
            subnet_broadcast(Ipv4Addr::new(192, 168, 4, 1)),
            Some(Ipv4Addr::new(192, 168, 4, 255))
        );
        assert_eq!(subnet_broadcast(Ipv4Addr::LOCALHOST), None);
    }

    #[test]
    fn test_targets_cover_every_port() {
        let config = DiscoveryConfig {
            ports: vec![1000, 2000],
            ..DiscoveryConfig::default()
        };
        let client = DiscoveryClient::new(config).with_host("10.0.0.7").with_host("");

        let targets = client.targets();
        assert_eq!(targets.len(), 6);
        assert!(targets.contains(&"255.255.255.255:1000".parse().unwrap()));
        assert!(targets.contains(&"10.0.0.7:2000".parse().unwrap()));
        assert!(targets.contains(&"10.0.0.255:1000".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_discover_against_local_responder() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = responder.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            // One junk answer first, then the real one
            if let Ok((_, from)) = responder.recv_from(&mut buf).await {
                let _ = responder.send_to(b"not a reader", from).await;
                let _ = responder.send_to(b"crosspoint (test);4321", from).await;
            }
        });

        let config = DiscoveryConfig {
            ports: vec![port],
            timeout_ms: 500,
            attempts: 1,
            ..DiscoveryConfig::default()
        };
        let endpoint = DiscoveryClient::new(config)
            .with_host("127.0.0.1")
            .discover()
            .await
            .expect("responder should be found");

        assert_eq!(endpoint.host, "127.0.0.1");
        assert_eq!(endpoint.port, 4321);
    }

    #[tokio::test]
    async fn test_discover_times_out_quietly() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = DiscoveryConfig {
            ports: vec![silent.local_addr().unwrap().port()],
            timeout_ms: 50,
            attempts: 2,
            ..DiscoveryConfig::default()
        };

        let found = DiscoveryClient::new(config)
            .with_host("127.0.0.1")
            .discover()
            .await;
        assert!(found.is_none());
    }
}
