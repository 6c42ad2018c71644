//! STUN discovery and NAT classification.
//!
//! Speaks just enough RFC 5389 to issue binding requests and read the
//! XOR-MAPPED-ADDRESS (or legacy MAPPED-ADDRESS) attribute from the
//! response. Classification follows the classic multi-binding procedure:
//! two bindings from the same local endpoint to the same server rule
//! symmetric NAT in or out, a third binding to a different server separates
//! full cone from restricted cone.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::net::local_interface_ip;
use crate::protocol::{NatType, NetworkInfo};

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// STUN magic cookie (RFC 5389).
const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Per-request response window.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a probe result stays valid in the process-wide cache.
pub const PROBE_CACHE_TTL: Duration = Duration::from_secs(300);

static PROBE_CACHE: RwLock<Option<(NetworkInfo, Instant)>> = RwLock::new(None);

/// Clear the probe cache, forcing the next discovery to hit the network.
pub fn clear_cache() {
    *PROBE_CACHE.write().expect("probe cache lock") = None;
}

fn cached_probe(ttl: Duration) -> Option<NetworkInfo> {
    let guard = PROBE_CACHE.read().expect("probe cache lock");
    guard
        .as_ref()
        .filter(|(_, at)| at.elapsed() < ttl)
        .map(|(info, _)| info.clone())
}

fn store_probe(info: &NetworkInfo) {
    *PROBE_CACHE.write().expect("probe cache lock") = Some((info.clone(), Instant::now()));
}

// ============================================================================
// Message codec
// ============================================================================

/// Build a binding request with no attributes.
pub fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(20);
    msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(transaction_id);
    msg
}

/// Parse a binding success response, returning the reflexive address.
pub fn parse_binding_response(data: &[u8], expected_txn_id: &[u8; 12]) -> Result<SocketAddr> {
    if data.len() < 20 {
        return Err(Error::probe("STUN response too short"));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_RESPONSE {
        return Err(Error::probe(format!(
            "unexpected STUN message type 0x{:04x}",
            msg_type
        )));
    }

    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(Error::probe("invalid STUN magic cookie"));
    }

    if &data[8..20] != expected_txn_id {
        return Err(Error::probe("STUN transaction ID mismatch"));
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() < 20 + msg_len {
        return Err(Error::probe("truncated STUN response"));
    }

    let mut offset = 20;
    while offset + 4 <= 20 + msg_len {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let value_start = offset + 4;

        if value_start + attr_len > data.len() {
            break;
        }
        let value = &data[value_start..value_start + attr_len];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return parse_xor_mapped_address(value, expected_txn_id),
            ATTR_MAPPED_ADDRESS => return parse_mapped_address(value),
            _ => {}
        }

        // Attributes are padded to 4-byte boundaries.
        offset = value_start + ((attr_len + 3) & !3);
    }

    Err(Error::probe("no mapped address in STUN response"))
}

fn parse_xor_mapped_address(value: &[u8], txn_id: &[u8; 12]) -> Result<SocketAddr> {
    if value.len() < 8 {
        return Err(Error::probe("XOR-MAPPED-ADDRESS too short"));
    }

    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;

    match family {
        0x01 => {
            let raw = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
            let ip = Ipv4Addr::from(raw ^ MAGIC_COOKIE);
            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        0x02 => {
            if value.len() < 20 {
                return Err(Error::probe("XOR-MAPPED-ADDRESS IPv6 too short"));
            }
            // The IPv6 address is XORed with the magic cookie followed by the
            // transaction ID.
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(txn_id);
            let mut octets = [0u8; 16];
            for (i, byte) in octets.iter_mut().enumerate() {
                *byte = value[4 + i] ^ mask[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => Err(Error::probe(format!(
            "unknown STUN address family {}",
            other
        ))),
    }
}

fn parse_mapped_address(value: &[u8]) -> Result<SocketAddr> {
    if value.len() < 8 {
        return Err(Error::probe("MAPPED-ADDRESS too short"));
    }

    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]);

    match family {
        0x01 => {
            let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        0x02 => {
            if value.len() < 20 {
                return Err(Error::probe("MAPPED-ADDRESS IPv6 too short"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => Err(Error::probe(format!(
            "unknown STUN address family {}",
            other
        ))),
    }
}

// ============================================================================
// Binding requests
// ============================================================================

/// Issue one binding request from `socket` to `server` and return the
/// reflexive address. Datagrams from other sources are ignored.
pub async fn binding_request(socket: &UdpSocket, server: SocketAddr) -> Result<SocketAddr> {
    let transaction_id: [u8; 12] = rand::random();
    let request = build_binding_request(&transaction_id);

    socket
        .send_to(&request, server)
        .await
        .map_err(|e| Error::probe_with_source("failed to send STUN binding request", e))?;

    let deadline = Instant::now() + REQUEST_TIMEOUT;
    let mut buf = [0u8; 576];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::probe(format!("STUN request to {} timed out", server)));
        }

        let (len, from) = timeout(remaining, socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::probe(format!("STUN request to {} timed out", server)))?
            .map_err(|e| Error::probe_with_source("failed to receive STUN response", e))?;

        if from != server {
            log::debug!("ignoring datagram from {} while waiting for {}", from, server);
            continue;
        }

        return parse_binding_response(&buf[..len], &transaction_id);
    }
}

async fn resolve_stun(server: &str) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = lookup_host(server)
        .await
        .map_err(|e| Error::probe_with_source(format!("failed to resolve STUN server '{}'", server), e))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::probe(format!(
            "no addresses found for STUN server '{}'",
            server
        )));
    }
    Ok(addrs)
}

/// Bind a probe socket in the address family of `server`.
async fn bind_for(server: SocketAddr) -> Result<UdpSocket> {
    let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| Error::probe_with_source("failed to bind STUN probe socket", e))
}

// ============================================================================
// NAT classification
// ============================================================================

/// Derive NAT type and hole-punch feasibility from the probe observations.
///
/// `local_ip` is the probe socket's interface address, `first` the reflexive
/// endpoint of the first binding, `second` a repeat binding from the same
/// local endpoint to the same server, `other_server` a binding from the same
/// local endpoint to a different server.
fn classify(
    local_ip: IpAddr,
    first: SocketAddr,
    second: Option<SocketAddr>,
    other_server: Option<SocketAddr>,
) -> (NatType, bool) {
    if local_ip == first.ip() {
        return (NatType::None, true);
    }

    match second {
        // Could not repeat the binding: symmetric NAT cannot be ruled out,
        // stay optimistic.
        None => return (NatType::Unknown, true),
        Some(second) if second != first => return (NatType::Symmetric, false),
        Some(_) => {}
    }

    match other_server {
        Some(reflected) if reflected.port() == first.port() => (NatType::FullCone, true),
        // Restricted cone is the most common punchable case; assume it when
        // the cross-server observation is missing or differs.
        _ => (NatType::RestrictedCone, true),
    }
}

/// Run the full NAT discovery procedure against `primary` (and optionally
/// `secondary`) and return the classified [`NetworkInfo`].
///
/// Results are cached process-wide for [`PROBE_CACHE_TTL`]; use
/// [`clear_cache`] to force a re-probe.
pub async fn discover(primary: &str, secondary: Option<&str>) -> Result<NetworkInfo> {
    if let Some(info) = cached_probe(PROBE_CACHE_TTL) {
        log::debug!("using cached NAT probe result: {}", info.public_addr);
        return Ok(info);
    }

    let info = probe(primary, secondary).await?;
    store_probe(&info);
    Ok(info)
}

/// Uncached probe. Tries the primary server over IPv4 first, then IPv6,
/// then whatever the resolver returned.
pub async fn probe(primary: &str, secondary: Option<&str>) -> Result<NetworkInfo> {
    let addrs = resolve_stun(primary).await?;

    let mut ordered: Vec<SocketAddr> = Vec::with_capacity(addrs.len());
    ordered.extend(addrs.iter().filter(|a| a.is_ipv4()));
    ordered.extend(addrs.iter().filter(|a| a.is_ipv6()));

    let mut last_err = Error::probe(format!("no usable address for STUN server '{}'", primary));
    for server in ordered {
        match probe_via(server, secondary).await {
            Ok(info) => return Ok(info),
            Err(e) => {
                log::warn!("STUN probe via {} failed: {}", server, e);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

async fn probe_via(primary: SocketAddr, secondary: Option<&str>) -> Result<NetworkInfo> {
    let socket = bind_for(primary).await?;

    // First binding: learn the reflexive endpoint. Failure here is total
    // failure for this server.
    let first = binding_request(&socket, primary).await?;
    log::debug!("STUN primary mapping: {}", first);

    let local_addr = socket
        .local_addr()
        .map_err(|e| Error::probe_with_source("probe socket has no local address", e))?;

    // Best-effort interface address; the wildcard bind address is useless
    // for LAN detection.
    let private_addr = match local_interface_ip().await {
        Ok(ip) => Some(ip),
        Err(e) => {
            log::warn!("could not determine private address: {}", e);
            None
        }
    };
    let local_ip = private_addr.unwrap_or_else(|| local_addr.ip());

    // Second binding from the same local endpoint: symmetric detection.
    let second = match binding_request(&socket, primary).await {
        Ok(addr) => {
            log::debug!("STUN repeat mapping: {}", addr);
            Some(addr)
        }
        Err(e) => {
            log::warn!("repeat STUN binding failed: {}", e);
            None
        }
    };

    // Third binding to a different server, still from the same socket:
    // cone-type detection.
    let mut other_server = None;
    if second.map_or(false, |s| s == first) {
        if let Some(server) = secondary.filter(|s| !s.is_empty()) {
            match resolve_stun(server).await {
                Ok(addrs) => {
                    if let Some(addr) = addrs.iter().find(|a| a.is_ipv4() == primary.is_ipv4()) {
                        match binding_request(&socket, *addr).await {
                            Ok(reflected) => {
                                log::debug!("STUN secondary-server mapping: {}", reflected);
                                other_server = Some(reflected);
                            }
                            Err(e) => log::warn!("secondary STUN binding failed: {}", e),
                        }
                    }
                }
                Err(e) => log::warn!("secondary STUN resolution failed: {}", e),
            }
        }
    }

    let (nat_type, can_hole_punch) = classify(local_ip, first, second, other_server);
    log::info!(
        "NAT probe: public {}, private {:?}, {} (hole punch {})",
        first,
        private_addr,
        nat_type,
        if can_hole_punch { "feasible" } else { "not feasible" }
    );

    Ok(NetworkInfo {
        public_addr: first,
        private_addr,
        nat_type,
        can_hole_punch,
        hole_punch_port: Some(local_addr.port()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid() -> [u8; 12] {
        [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]
    }

    /// Build a binding success response carrying an XOR-MAPPED-ADDRESS.
    fn build_response(mapped: SocketAddr, txn_id: &[u8; 12]) -> Vec<u8> {
        let (family, ip_bytes): (u8, Vec<u8>) = match mapped.ip() {
            IpAddr::V4(ip) => {
                let raw = u32::from(ip) ^ MAGIC_COOKIE;
                (0x01, raw.to_be_bytes().to_vec())
            }
            IpAddr::V6(ip) => {
                let mut mask = [0u8; 16];
                mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                mask[4..].copy_from_slice(txn_id);
                let bytes: Vec<u8> = ip
                    .octets()
                    .iter()
                    .zip(mask.iter())
                    .map(|(b, m)| b ^ m)
                    .collect();
                (0x02, bytes)
            }
        };
        let attr_len = 4 + ip_bytes.len() as u16;

        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        msg.extend_from_slice(&(4 + attr_len).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(txn_id);
        msg.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        msg.extend_from_slice(&attr_len.to_be_bytes());
        msg.push(0);
        msg.push(family);
        let xport = mapped.port() ^ (MAGIC_COOKIE >> 16) as u16;
        msg.extend_from_slice(&xport.to_be_bytes());
        msg.extend_from_slice(&ip_bytes);
        msg
    }

    #[test]
    fn test_binding_request_layout() {
        let request = build_binding_request(&txid());
        assert_eq!(request.len(), 20);
        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[2..4], &[0x00, 0x00]);
        assert_eq!(&request[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&request[8..20], &txid());
    }

    #[test]
    fn test_response_roundtrip_ipv4() {
        let mapped: SocketAddr = "192.168.1.100:5000".parse().unwrap();
        let response = build_response(mapped, &txid());
        let parsed = parse_binding_response(&response, &txid()).expect("parse");
        assert_eq!(parsed, mapped);
    }

    #[test]
    fn test_response_roundtrip_ipv6() {
        let mapped: SocketAddr = "[2001:db8::7]:6000".parse().unwrap();
        let response = build_response(mapped, &txid());
        let parsed = parse_binding_response(&response, &txid()).expect("parse");
        assert_eq!(parsed, mapped);
    }

    #[test]
    fn test_response_rejects_wrong_transaction_id() {
        let mapped: SocketAddr = "192.168.1.100:5000".parse().unwrap();
        let response = build_response(mapped, &txid());
        let other = [9u8; 12];
        let err = parse_binding_response(&response, &other).expect_err("txid mismatch");
        assert!(err.to_string().contains("transaction ID"));
    }

    #[test]
    fn test_response_rejects_request_message() {
        let request = build_binding_request(&txid());
        let err = parse_binding_response(&request, &txid()).expect_err("not a response");
        assert!(err.to_string().contains("message type"));
    }

    #[test]
    fn test_classify_no_nat() {
        let first: SocketAddr = "192.168.1.5:4000".parse().unwrap();
        let (nat, punch) = classify("192.168.1.5".parse().unwrap(), first, None, None);
        assert_eq!(nat, NatType::None);
        assert!(punch);
    }

    #[test]
    fn test_classify_equal_bindings_never_symmetric() {
        let first: SocketAddr = "203.0.113.9:4000".parse().unwrap();
        for other in [None, Some("203.0.113.9:4000".parse().unwrap())] {
            let (nat, punch) =
                classify("10.0.0.2".parse().unwrap(), first, Some(first), other);
            assert_ne!(nat, NatType::Symmetric);
            assert!(punch);
        }
    }

    #[test]
    fn test_classify_symmetric() {
        let first: SocketAddr = "203.0.113.9:4000".parse().unwrap();
        let second: SocketAddr = "203.0.113.9:4001".parse().unwrap();
        let (nat, punch) = classify("10.0.0.2".parse().unwrap(), first, Some(second), None);
        assert_eq!(nat, NatType::Symmetric);
        assert!(!punch);
    }

    #[test]
    fn test_classify_full_cone_by_matching_port() {
        let first: SocketAddr = "203.0.113.9:4000".parse().unwrap();
        let cross: SocketAddr = "203.0.113.9:4000".parse().unwrap();
        let (nat, _) = classify("10.0.0.2".parse().unwrap(), first, Some(first), Some(cross));
        assert_eq!(nat, NatType::FullCone);
    }

    #[test]
    fn test_classify_degrades_to_unknown_without_repeat_binding() {
        let first: SocketAddr = "203.0.113.9:4000".parse().unwrap();
        let (nat, punch) = classify("10.0.0.2".parse().unwrap(), first, None, None);
        assert_eq!(nat, NatType::Unknown);
        assert!(punch);
    }

    /// Minimal STUN responder that reflects the observed source address.
    async fn spawn_stun_stub() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = socket.local_addr().expect("stub addr");
        tokio::spawn(async move {
            let mut buf = [0u8; 576];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                if len < 20 {
                    continue;
                }
                let mut txn = [0u8; 12];
                txn.copy_from_slice(&buf[8..20]);
                let response = build_response(from, &txn);
                let _ = socket.send_to(&response, from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_binding_request_against_stub() {
        let server = spawn_stun_stub().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let reflected = binding_request(&socket, server).await.expect("binding");
        assert_eq!(reflected, socket.local_addr().expect("local addr"));
    }

    #[tokio::test]
    async fn test_probe_against_stub_classifies_consistent_mapping() {
        let server = spawn_stun_stub().await;
        let info = probe(&server.to_string(), None).await.expect("probe");
        // Loopback reflections keep the mapping stable, so the result must
        // never be symmetric and punching stays feasible.
        assert_ne!(info.nat_type, NatType::Symmetric);
        assert!(info.can_hole_punch);
        assert!(info.hole_punch_port.is_some());
    }

    #[tokio::test]
    async fn test_cache_roundtrip() {
        clear_cache();
        assert!(cached_probe(PROBE_CACHE_TTL).is_none());
        let info = NetworkInfo {
            public_addr: "203.0.113.9:4000".parse().unwrap(),
            private_addr: None,
            nat_type: NatType::RestrictedCone,
            can_hole_punch: true,
            hole_punch_port: None,
        };
        store_probe(&info);
        let cached = cached_probe(PROBE_CACHE_TTL).expect("cached");
        assert_eq!(cached.public_addr, info.public_addr);
        assert!(cached_probe(Duration::ZERO).is_none());
        clear_cache();
        assert!(cached_probe(PROBE_CACHE_TTL).is_none());
    }
}
