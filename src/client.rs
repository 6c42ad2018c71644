//! Client-role coordinator.
//!
//! Bootstrap: probe the NAT, publish our registration (network info plus the
//! requested mappings), then poll for the server's allocation table. Every
//! allocation gets a local listener; UDP mappings attempt a hole-punched
//! path when both sides believe punching is feasible and fall back to relay
//! otherwise. A config-file watcher pushes mapping updates at runtime and
//! reconciles the local forwarder set against the refreshed allocations.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, PortMapping, Protocol};
use crate::error::{Error, Result};
use crate::forward;
use crate::holepunch;
use crate::protocol::{is_legacy_payload, ClientRegistration, NetworkInfo, ServerRegistration};
use crate::signaling::SignalingClient;
use crate::stun;
use crate::updater;

/// Attempts to obtain a structured ServerRegistration at bootstrap.
const FETCH_ATTEMPTS: u32 = 5;

/// Pause between bootstrap fetch attempts.
const FETCH_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Poll budget per bootstrap fetch attempt.
const FETCH_BUDGET: Duration = Duration::from_secs(15);

/// Settling time between pushing a mapping update and re-fetching the
/// allocation table.
const UPDATE_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Poll budget for the post-update allocation fetch.
const UPDATE_FETCH_BUDGET: Duration = Duration::from_secs(5);

/// Running forwarders keyed by mapping, each with its own kill switch.
type ActiveForwarders = Arc<Mutex<HashMap<PortMapping, CancellationToken>>>;

struct ClientCtx {
    local_info: NetworkInfo,
    session_timeout: Duration,
    punch_timeout: Duration,
    cancel: CancellationToken,
}

/// Run the client until cancelled.
pub async fn run(config: Config, config_path: PathBuf, cancel: CancellationToken) -> Result<()> {
    let local_info = stun::discover(
        &config.stun_server,
        Some(&config.secondary_stun_server),
    )
    .await?;
    let signaling = SignalingClient::new(&config.signaling_url)?;
    run_inner(config, config_path, local_info, signaling, cancel).await
}

async fn run_inner(
    config: Config,
    config_path: PathBuf,
    local_info: NetworkInfo,
    signaling: SignalingClient,
    cancel: CancellationToken,
) -> Result<()> {
    log::info!(
        "starting client mode with {} mappings in room '{}'",
        config.mappings.len(),
        config.room_id
    );
    let room_key = format!("{}-server", config.room_id);

    let registration = ClientRegistration::new(local_info.clone(), &config.mappings);
    signaling
        .publish("client", &room_key, &registration.encode()?)
        .await?;

    let server_reg = fetch_server_registration(&signaling, &room_key, &cancel).await?;
    log::info!(
        "received {} port allocations from server",
        server_reg.port_mappings.len()
    );

    let ctx = ClientCtx {
        local_info,
        session_timeout: Duration::from_secs(config.session_timeout_secs),
        punch_timeout: holepunch::DEFAULT_TIMEOUT,
        cancel: cancel.clone(),
    };
    let active: ActiveForwarders = Arc::new(Mutex::new(HashMap::new()));

    reconcile_forwarders(&ctx, &server_reg, &active).await;

    let (update_tx, mut update_rx) = mpsc::channel(4);
    tokio::spawn(updater::watch_config_file(
        config_path,
        config.mappings.clone(),
        updater::POLL_INTERVAL,
        update_tx,
        cancel.child_token(),
    ));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = update_rx.recv() => {
                let Some(mappings) = changed else { break };
                if let Err(e) = push_mapping_update(&signaling, &room_key, &ctx, &mappings, &active).await {
                    log::warn!("mapping update failed: {}", e);
                }
            }
        }
    }

    log::info!("client shutting down");
    Ok(())
}

/// Poll for the server's allocation table, tolerating the window in which
/// the server slot still holds a stale bootstrap payload.
async fn fetch_server_registration(
    signaling: &SignalingClient,
    room_key: &str,
    cancel: &CancellationToken,
) -> Result<ServerRegistration> {
    for attempt in 1..=FETCH_ATTEMPTS {
        log::info!(
            "waiting for server port allocations (attempt {}/{})",
            attempt,
            FETCH_ATTEMPTS
        );

        match signaling.fetch(room_key, "server", FETCH_BUDGET).await {
            Ok(body) => {
                if is_legacy_payload(&body) {
                    log::info!("server has not finished port allocation yet");
                } else {
                    match ServerRegistration::decode(&body) {
                        Ok(registration) => return Ok(registration),
                        Err(e) => log::warn!("could not parse server registration: {}", e),
                    }
                }
            }
            Err(e) => log::warn!("fetch attempt {} failed: {}", attempt, e),
        }

        if attempt < FETCH_ATTEMPTS {
            tokio::select! {
                _ = tokio::time::sleep(FETCH_RETRY_DELAY) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    Err(Error::signaling(format!(
        "no usable server registration after {} attempts",
        FETCH_ATTEMPTS
    )))
}

/// Push the changed mapping set to the endpoint, wait for the server to
/// allocate, then reconcile local forwarders against the fresh table.
async fn push_mapping_update(
    signaling: &SignalingClient,
    room_key: &str,
    ctx: &ClientCtx,
    mappings: &[PortMapping],
    active: &ActiveForwarders,
) -> Result<()> {
    let strings: Vec<String> = mappings.iter().map(|m| m.to_string()).collect();
    signaling.update_mappings(room_key, &strings).await?;

    tokio::time::sleep(UPDATE_SETTLE_DELAY).await;

    let body = signaling
        .fetch(room_key, "server", UPDATE_FETCH_BUDGET)
        .await?;
    let registration = ServerRegistration::decode(&body)?;
    log::info!(
        "server now allocates {} mappings",
        registration.port_mappings.len()
    );

    reconcile_forwarders(ctx, &registration, active).await;
    Ok(())
}

/// Stop forwarders whose mapping left the allocation table and start
/// forwarders for newly allocated mappings.
async fn reconcile_forwarders(
    ctx: &ClientCtx,
    registration: &ServerRegistration,
    active: &ActiveForwarders,
) {
    let desired: HashMap<PortMapping, u16> = registration
        .port_mappings
        .iter()
        .map(|a| (a.client_mapping, a.allocated_port))
        .collect();

    let mut table = active.lock().await;

    let removed: Vec<PortMapping> = table
        .keys()
        .filter(|m| !desired.contains_key(*m))
        .copied()
        .collect();
    for mapping in removed {
        if let Some(token) = table.remove(&mapping) {
            log::info!("stopping forwarder for removed mapping {}", mapping);
            token.cancel();
        }
    }

    for (mapping, allocated_port) in desired {
        if table.contains_key(&mapping) {
            continue;
        }
        let token = ctx.cancel.child_token();
        table.insert(mapping, token.clone());
        tokio::spawn(run_mapping(
            mapping,
            allocated_port,
            ctx.local_info.clone(),
            registration.network_info.clone(),
            ctx.session_timeout,
            ctx.punch_timeout,
            token,
        ));
    }
}

/// Choose the server-side target endpoint for a mapping: the private address
/// on a shared LAN, the public address otherwise.
fn select_target(
    local_info: &NetworkInfo,
    server_info: &NetworkInfo,
    allocated_port: u16,
) -> SocketAddr {
    let lan = crate::net::is_lan_peer(
        Some(local_info.public_addr),
        local_info.private_addr,
        Some(server_info.public_addr),
        server_info.private_addr,
    );

    if lan {
        if let Some(private_ip) = server_info.private_addr {
            let target = SocketAddr::new(private_ip, allocated_port);
            log::info!("using LAN path to {}", target);
            return target;
        }
    }

    let target = SocketAddr::new(server_info.public_addr.ip(), allocated_port);
    log::info!("using WAN path to {}", target);
    target
}

/// Host one mapping: bind the user-facing listener and forward through the
/// chosen path until cancelled.
async fn run_mapping(
    mapping: PortMapping,
    allocated_port: u16,
    local_info: NetworkInfo,
    server_info: NetworkInfo,
    session_timeout: Duration,
    punch_timeout: Duration,
    cancel: CancellationToken,
) {
    let target = select_target(&local_info, &server_info, allocated_port);
    log::info!(
        "starting forwarder: {} local port {} -> {}",
        mapping.protocol,
        mapping.local_port,
        target
    );

    match mapping.protocol {
        Protocol::Tcp => {
            let listener = match TcpListener::bind(("0.0.0.0", mapping.local_port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    log::error!("failed to bind local TCP port {}: {}", mapping.local_port, e);
                    return;
                }
            };
            forward::serve_tcp(listener, target, cancel).await;
        }
        Protocol::Udp => {
            let listener = match UdpSocket::bind(("0.0.0.0", mapping.local_port)).await {
                Ok(socket) => socket,
                Err(e) => {
                    log::error!("failed to bind local UDP port {}: {}", mapping.local_port, e);
                    return;
                }
            };
            run_udp_mapping(
                listener,
                &local_info,
                &server_info,
                target,
                session_timeout,
                punch_timeout,
                cancel,
            )
            .await;
        }
    }
}

/// Forward a UDP mapping, preferring a hole-punched path when both sides
/// report punching feasible. Punch failure degrades to relay.
async fn run_udp_mapping(
    listener: UdpSocket,
    local_info: &NetworkInfo,
    server_info: &NetworkInfo,
    relay_target: SocketAddr,
    session_timeout: Duration,
    punch_timeout: Duration,
    cancel: CancellationToken,
) {
    if local_info.can_hole_punch && server_info.can_hole_punch {
        match holepunch::establish(local_info, server_info, true, punch_timeout).await {
            Ok(path) => {
                forward::serve_udp_path_client(listener, path, cancel).await;
                return;
            }
            Err(e) => {
                log::warn!("hole punch failed, falling back to relay: {}", e);
            }
        }
    } else {
        log::info!("hole punching not feasible for this pair, using relay");
    }

    forward::serve_udp_relay(listener, relay_target, session_timeout, cancel).await;
}
