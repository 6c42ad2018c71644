//! Multi-strategy UDP hole punching.
//!
//! Both peers run [`establish`] concurrently after exchanging their
//! [`NetworkInfo`] through signaling. Strategies are tried in order until one
//! produces a socket with a confirmed bidirectional exchange or the overall
//! deadline elapses:
//!
//! 1. LAN direct handshake against the peer's private endpoint
//! 2. Simultaneous token spray at the peer's public endpoint, bound to the
//!    STUN-observed local port where possible
//! 3. Direct handshake against the public endpoint, with retries
//! 4. Port prediction around the peer's public port (mildly symmetric NATs)
//!
//! Per attempt the flow is send -> listen -> confirmed | timed out; the
//! first datagram received from any source confirms the path.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep, timeout, Instant};

use crate::error::{Error, Result};
use crate::net::same_lan_subnet;
use crate::protocol::NetworkInfo;

/// Token sent during direct handshakes.
const INIT_TOKEN: &[u8] = b"HOLE_PUNCH_INIT";

/// Cadence of the simultaneous token spray.
const SPRAY_INTERVAL: Duration = Duration::from_millis(50);

/// Stagger applied by the non-initiator before spraying.
const RESPONDER_SPRAY_DELAY: Duration = Duration::from_millis(100);

/// Coordination delay for the non-initiator before any strategy runs.
const RESPONDER_COORDINATION_DELAY: Duration = Duration::from_millis(800);

/// Read window for the LAN direct handshake.
const LAN_WINDOW: Duration = Duration::from_secs(2);

/// Read window per direct public-endpoint attempt.
const DIRECT_WINDOW: Duration = Duration::from_secs(3);

/// Read window per predicted-port probe.
const PREDICTION_WINDOW: Duration = Duration::from_secs(1);

/// Port offsets tried during prediction, nearest first.
const PREDICTION_OFFSETS: [i32; 11] = [0, 1, -1, 2, -2, 3, -3, 4, -4, 5, -5];

/// Default overall budget for a punch attempt.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default number of direct public-endpoint attempts.
pub const DEFAULT_RETRY_COUNT: u32 = 5;

/// The strategy that produced a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    LanDirect,
    SimultaneousSend,
    DirectPublic,
    PortPrediction,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Strategy::LanDirect => "lan-direct",
            Strategy::SimultaneousSend => "simultaneous-send",
            Strategy::DirectPublic => "direct-public",
            Strategy::PortPrediction => "port-prediction",
        };
        write!(f, "{}", s)
    }
}

/// An established peer-to-peer UDP path.
#[derive(Debug)]
pub struct HolePunchPath {
    /// Socket with at least one confirmed exchange with the peer. No read or
    /// write deadline is pending on it.
    pub socket: UdpSocket,
    /// Source endpoint of the confirming datagram.
    pub remote: SocketAddr,
    pub strategy: Strategy,
}

/// Inputs for one punch attempt.
#[derive(Debug, Clone)]
pub struct HolePunchConfig {
    pub local_public: SocketAddr,
    pub remote_public: SocketAddr,
    pub local_private: Option<IpAddr>,
    pub remote_private: Option<IpAddr>,
    /// Peer's advertised punch port, used for the LAN handshake target.
    pub remote_punch_port: Option<u16>,
    pub timeout: Duration,
    pub retry_count: u32,
    pub is_initiator: bool,
}

impl HolePunchConfig {
    pub fn from_network_info(
        local: &NetworkInfo,
        remote: &NetworkInfo,
        is_initiator: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            local_public: local.public_addr,
            remote_public: remote.public_addr,
            local_private: local.private_addr,
            remote_private: remote.private_addr,
            remote_punch_port: remote.hole_punch_port,
            timeout,
            retry_count: DEFAULT_RETRY_COUNT,
            is_initiator,
        }
    }
}

/// Establish a peer-to-peer UDP path to the remote peer.
///
/// The client side is the initiator; the responder delays briefly so both
/// sides spray into each other's freshly opened NAT mappings. On failure the
/// caller falls back to relay forwarding.
pub async fn establish(
    local: &NetworkInfo,
    remote: &NetworkInfo,
    is_initiator: bool,
    overall_timeout: Duration,
) -> Result<HolePunchPath> {
    let config = HolePunchConfig::from_network_info(local, remote, is_initiator, overall_timeout);
    establish_with(config).await
}

/// Run the strategy ladder with an explicit configuration.
pub async fn establish_with(config: HolePunchConfig) -> Result<HolePunchPath> {
    log::info!(
        "starting UDP hole punch (initiator: {}, local {}, remote {})",
        config.is_initiator,
        config.local_public,
        config.remote_public
    );

    if !config.is_initiator {
        sleep(RESPONDER_COORDINATION_DELAY).await;
    }

    let deadline = Instant::now() + config.timeout;

    // Strategy 1: LAN direct.
    if let (Some(local_ip), Some(remote_ip)) = (config.local_private, config.remote_private) {
        if same_lan_subnet(local_ip, remote_ip) {
            let port = config.remote_punch_port.unwrap_or(config.remote_public.port());
            let target = SocketAddr::new(remote_ip, port);
            match try_direct(target, clamp(LAN_WINDOW, deadline), Strategy::LanDirect).await {
                Ok(path) => {
                    log::info!("hole punch succeeded via LAN direct to {}", path.remote);
                    return Ok(path);
                }
                Err(e) => log::debug!("LAN direct handshake failed: {}", e),
            }
        }
    }

    // Strategy 2: simultaneous send toward the public endpoint.
    if Instant::now() < deadline {
        match simultaneous_send(&config, deadline).await {
            Ok(path) => {
                log::info!("hole punch succeeded via simultaneous send from {}", path.remote);
                return Ok(path);
            }
            Err(e) => log::debug!("simultaneous send failed: {}", e),
        }
    }

    // Strategy 3: direct public endpoint with retries.
    for attempt in 1..=config.retry_count {
        if Instant::now() >= deadline {
            break;
        }
        log::debug!(
            "direct handshake attempt {}/{} toward {}",
            attempt,
            config.retry_count,
            config.remote_public
        );
        match try_direct(
            config.remote_public,
            clamp(DIRECT_WINDOW, deadline),
            Strategy::DirectPublic,
        )
        .await
        {
            Ok(path) => {
                log::info!("hole punch succeeded via direct handshake on attempt {}", attempt);
                return Ok(path);
            }
            Err(e) => log::debug!("direct handshake attempt {} failed: {}", attempt, e),
        }
        if attempt < config.retry_count {
            sleep(Duration::from_millis(500) * attempt).await;
        }
    }

    // Strategy 4: port prediction for mildly symmetric peers.
    if Instant::now() < deadline {
        match port_prediction(&config, deadline).await {
            Ok(path) => {
                log::info!("hole punch succeeded via port prediction to {}", path.remote);
                return Ok(path);
            }
            Err(e) => log::debug!("port prediction failed: {}", e),
        }
    }

    Err(Error::hole_punch("all hole punching strategies failed"))
}

fn clamp(window: Duration, deadline: Instant) -> Duration {
    window.min(deadline.saturating_duration_since(Instant::now()))
}

/// Send one token at `remote` and wait up to `window` for any reply.
async fn try_direct(
    remote: SocketAddr,
    window: Duration,
    strategy: Strategy,
) -> Result<HolePunchPath> {
    if window.is_zero() {
        return Err(Error::hole_punch("punch deadline elapsed"));
    }

    let bind_addr: SocketAddr = if remote.is_ipv4() {
        "0.0.0.0:0".parse().expect("static addr")
    } else {
        "[::]:0".parse().expect("static addr")
    };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| Error::hole_punch_with_source("failed to bind punch socket", e))?;

    socket
        .send_to(INIT_TOKEN, remote)
        .await
        .map_err(|e| Error::hole_punch_with_source("failed to send punch token", e))?;

    let mut buf = [0u8; 1024];
    let (len, from) = timeout(window, socket.recv_from(&mut buf))
        .await
        .map_err(|_| Error::hole_punch(format!("no reply from {}", remote)))?
        .map_err(|e| Error::hole_punch_with_source("punch socket read failed", e))?;

    log::debug!(
        "punch reply from {}: {:?}",
        from,
        String::from_utf8_lossy(&buf[..len])
    );
    Ok(HolePunchPath {
        socket,
        remote: from,
        strategy,
    })
}

/// Bind a reusable socket for the simultaneous strategy, preferring the
/// STUN-observed local port so the NAT mapping lines up with what the peer
/// was told.
fn bind_punch_socket(local_public: SocketAddr) -> Result<UdpSocket> {
    let wildcard: IpAddr = if local_public.is_ipv4() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
    };

    let preferred = SocketAddr::new(wildcard, local_public.port());
    match bind_reuse(preferred) {
        Ok(socket) => Ok(socket),
        Err(e) => {
            log::debug!(
                "could not bind punch socket on {}: {}, using kernel port",
                preferred,
                e
            );
            bind_reuse(SocketAddr::new(wildcard, 0))
                .map_err(|e| Error::hole_punch_with_source("failed to bind punch socket", e))
        }
    }
}

fn bind_reuse(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Spray the punch token at the peer's public endpoint while reading
/// concurrently. The first datagram received completes the path.
async fn simultaneous_send(config: &HolePunchConfig, deadline: Instant) -> Result<HolePunchPath> {
    let socket = bind_punch_socket(config.local_public)?;

    if !config.is_initiator {
        sleep(RESPONDER_SPRAY_DELAY).await;
    }

    let role = if config.is_initiator { "initiator" } else { "responder" };
    let token = format!("ENHANCED_HOLE_PUNCH_{}", role);

    let mut spray = interval(SPRAY_INTERVAL);
    let mut buf = [0u8; 1024];

    loop {
        tokio::select! {
            _ = spray.tick() => {
                if let Err(e) = socket.send_to(token.as_bytes(), config.remote_public).await {
                    log::debug!("punch spray send failed: {}", e);
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received
                    .map_err(|e| Error::hole_punch_with_source("punch socket read failed", e))?;
                if len > 0 {
                    log::debug!(
                        "simultaneous send reply from {}: {:?}",
                        from,
                        String::from_utf8_lossy(&buf[..len])
                    );
                    return Ok(HolePunchPath {
                        socket,
                        remote: from,
                        strategy: Strategy::SimultaneousSend,
                    });
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::hole_punch("simultaneous send timed out"));
            }
        }
    }
}

/// Probe ports around the peer's public port.
async fn port_prediction(config: &HolePunchConfig, deadline: Instant) -> Result<HolePunchPath> {
    let base = i32::from(config.remote_public.port());

    for offset in PREDICTION_OFFSETS {
        if Instant::now() >= deadline {
            break;
        }
        let port = base + offset;
        let Ok(port) = u16::try_from(port) else {
            continue;
        };
        if port == 0 {
            continue;
        }

        let target = SocketAddr::new(config.remote_public.ip(), port);
        log::debug!("trying predicted port {}", target);
        match try_direct(
            target,
            clamp(PREDICTION_WINDOW, deadline),
            Strategy::PortPrediction,
        )
        .await
        {
            Ok(path) => return Ok(path),
            Err(_) => continue,
        }
    }

    Err(Error::hole_punch("port prediction failed"))
}
