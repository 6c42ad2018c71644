//! Endpoint helpers and LAN detection.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use ipnet::Ipv4Net;
use tokio::net::UdpSocket;

use crate::error::{Error, Result};

/// Public anchor used to learn the outbound interface address. The socket is
/// connected but never written to, so no packet leaves the host.
const LOCAL_IP_ANCHOR: &str = "8.8.8.8:80";

/// Discover the private address of the outbound interface by connecting a UDP
/// socket toward a public anchor and reading the kernel-assigned local IP.
pub async fn local_interface_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| Error::probe_with_source("failed to bind local discovery socket", e))?;
    socket
        .connect(LOCAL_IP_ANCHOR)
        .await
        .map_err(|e| Error::probe_with_source("failed to connect local discovery socket", e))?;
    let addr = socket
        .local_addr()
        .map_err(|e| Error::probe_with_source("local discovery socket has no address", e))?;
    Ok(addr.ip())
}

/// Returns true if the address is in RFC1918 private space.
pub fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    const PRIVATE: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];
    PRIVATE.iter().any(|cidr| {
        let net: Ipv4Net = cidr.parse().expect("static CIDR");
        net.contains(&ip)
    })
}

fn same_subnet(a: Ipv4Addr, b: Ipv4Addr, prefix: u8) -> bool {
    let net = Ipv4Net::new(a, prefix).expect("valid prefix");
    net.trunc().contains(&b)
}

fn in_net(ip: Ipv4Addr, cidr: &str) -> bool {
    let net: Ipv4Net = cidr.parse().expect("static CIDR");
    net.contains(&ip)
}

/// Returns true if two private addresses are in the same LAN, using the most
/// specific matching strategy: shared /24, then /16 within 192.168.0.0/16,
/// /8 within 10.0.0.0/8, /12 within 172.16.0.0/12.
pub fn same_lan_subnet(a: IpAddr, b: IpAddr) -> bool {
    let (IpAddr::V4(a), IpAddr::V4(b)) = (a, b) else {
        return false;
    };

    if !is_private_ipv4(a) || !is_private_ipv4(b) {
        return false;
    }

    if same_subnet(a, b, 24) {
        return true;
    }
    if in_net(a, "192.168.0.0/16") && in_net(b, "192.168.0.0/16") && same_subnet(a, b, 16) {
        return true;
    }
    if in_net(a, "10.0.0.0/8") && in_net(b, "10.0.0.0/8") && same_subnet(a, b, 8) {
        return true;
    }
    if in_net(a, "172.16.0.0/12") && in_net(b, "172.16.0.0/12") && same_subnet(a, b, 12) {
        return true;
    }

    false
}

/// Decide whether two peers share a LAN.
///
/// Either both public addresses are equal (hairpin NAT), or both private
/// addresses are in the same RFC1918 subnet.
pub fn is_lan_peer(
    local_public: Option<SocketAddr>,
    local_private: Option<IpAddr>,
    remote_public: Option<SocketAddr>,
    remote_private: Option<IpAddr>,
) -> bool {
    if let (Some(lp), Some(rp)) = (local_public, remote_public) {
        if lp.ip() == rp.ip() {
            log::debug!("LAN detected: same public IP {}", lp.ip());
            return true;
        }
    }

    if let (Some(lp), Some(rp)) = (local_private, remote_private) {
        if same_lan_subnet(lp, rp) {
            log::debug!("LAN detected: same private subnet ({} <-> {})", lp, rp);
            return true;
        }
    }

    false
}
