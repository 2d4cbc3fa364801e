//! Reachability probes

use async_trait::async_trait;
use kidslock_device_api::ReachabilityProber;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use surge_ping::{Client, Config, PingIdentifier, PingSequence, ICMP};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::debug;

/// Probe by opening a TCP connection to a fixed port.
///
/// Needs no privileges; the control endpoint's port is the usual choice.
#[derive(Debug, Clone)]
pub struct TcpProber {
    port: u16,
    connect_timeout: Duration,
}

impl TcpProber {
    pub fn new(port: u16, connect_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
        }
    }
}

#[async_trait]
impl ReachabilityProber for TcpProber {
    async fn is_reachable(&self, address: &str) -> bool {
        match timeout(self.connect_timeout, TcpStream::connect((address, self.port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(address, port = self.port, error = %e, "TCP probe failed");
                false
            }
            Err(_) => {
                debug!(address, port = self.port, "TCP probe timed out");
                false
            }
        }
    }
}

/// Probe with a single ICMP echo request.
///
/// Opening the ICMP sockets needs CAP_NET_RAW or a matching
/// `net.ipv4.ping_group_range`.
pub struct IcmpProber {
    v4: Client,
    v6: Client,
    ping_timeout: Duration,
    next_id: AtomicU16,
}

impl IcmpProber {
    pub fn new(ping_timeout: Duration) -> io::Result<Self> {
        Ok(Self {
            v4: Client::new(&Config::default())?,
            v6: Client::new(&Config::builder().kind(ICMP::V6).build())?,
            ping_timeout,
            next_id: AtomicU16::new(std::process::id() as u16),
        })
    }

    async fn ping(&self, ip: IpAddr) -> bool {
        let client = if ip.is_ipv4() { &self.v4 } else { &self.v6 };
        let id = PingIdentifier(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut pinger = client.pinger(ip, id).await;
        pinger.timeout(self.ping_timeout);

        match pinger.ping(PingSequence(0), &[]).await {
            Ok((_, rtt)) => {
                debug!(ip = %ip, rtt_ms = rtt.as_millis() as u64, "ICMP probe answered");
                true
            }
            Err(e) => {
                debug!(ip = %ip, error = %e, "ICMP probe failed");
                false
            }
        }
    }
}

#[async_trait]
impl ReachabilityProber for IcmpProber {
    async fn is_reachable(&self, address: &str) -> bool {
        match resolve(address).await {
            Some(ip) => self.ping(ip).await,
            None => false,
        }
    }
}

/// Resolve a hostname or literal to its first address
pub async fn resolve(address: &str) -> Option<IpAddr> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Some(ip);
    }
    match lookup_host((address, 0)).await {
        Ok(mut addrs) => addrs.next().map(|a| a.ip()),
        Err(e) => {
            debug!(address, error = %e, "Failed to resolve device address");
            None
        }
    }
}
