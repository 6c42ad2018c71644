//! Server-role coordinator.
//!
//! Bootstrap: probe the NAT, then wait for the client registration before
//! publishing anything (publishing earlier would let a stale payload
//! overwrite the final registration under last-writer-wins). Each requested
//! mapping gets a kernel-allocated listener port; the resulting allocation
//! table is published and refreshed every 30 seconds to keep the room
//! alive. A watcher polls for mapping-version changes and reconciles the
//! listener set: removed mappings are stopped, added ones allocated and
//! started, then the new table is published.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, PortMapping, Protocol};
use crate::error::{Error, Result};
use crate::forward;
use crate::holepunch;
use crate::protocol::{ClientRegistration, NetworkInfo, ServerAllocation, ServerRegistration};
use crate::signaling::SignalingClient;
use crate::stun;

/// How long the server waits for the initial client registration.
const CLIENT_FETCH_BUDGET: Duration = Duration::from_secs(60);

/// Cadence of the presence refresh republish.
const PRESENCE_INTERVAL: Duration = Duration::from_secs(30);

struct ActiveMapping {
    allocation: ServerAllocation,
    token: CancellationToken,
}

type ActiveMappings = Arc<Mutex<HashMap<PortMapping, ActiveMapping>>>;

struct ServerCtx {
    local_info: NetworkInfo,
    session_timeout: Duration,
    punch_timeout: Duration,
    cancel: CancellationToken,
}

/// Run the server until cancelled.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let local_info = stun::discover(
        &config.stun_server,
        Some(&config.secondary_stun_server),
    )
    .await?;
    let signaling = SignalingClient::new(&config.signaling_url)?;
    run_inner(config, local_info, signaling, cancel).await
}

async fn run_inner(
    config: Config,
    local_info: NetworkInfo,
    signaling: SignalingClient,
    cancel: CancellationToken,
) -> Result<()> {
    log::info!("starting server mode in room '{}'", config.room_id);
    let room_key = format!("{}-server", config.room_id);

    log::info!("waiting for client registration...");
    let body = tokio::select! {
        fetched = signaling.fetch(&room_key, "client", CLIENT_FETCH_BUDGET) => fetched?,
        _ = cancel.cancelled() => return Err(Error::Cancelled),
    };
    let client_reg = ClientRegistration::decode(&body)?;
    let mappings = client_reg.parsed_mappings();
    log::info!("received client registration with {} mappings", mappings.len());

    let ctx = ServerCtx {
        local_info,
        session_timeout: Duration::from_secs(config.session_timeout_secs),
        punch_timeout: holepunch::DEFAULT_TIMEOUT,
        cancel: cancel.clone(),
    };
    let active: ActiveMappings = Arc::new(Mutex::new(HashMap::new()));

    // Any allocation failure for the initial set aborts startup.
    for mapping in &mappings {
        start_mapping(&ctx, *mapping, &client_reg.network_info, &active).await?;
    }

    publish_registration(&signaling, &room_key, &ctx.local_info, &active).await?;
    log::info!("server ready, {} listeners started", mappings.len());

    let mut updates = signaling.watch(
        room_key.clone(),
        Duration::from_secs(config.watch_interval_secs),
        cancel.child_token(),
    );

    let mut presence = tokio::time::interval(PRESENCE_INTERVAL);
    presence.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    presence.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            update = updates.recv() => {
                match update {
                    Some(update) => {
                        reconcile(&ctx, &signaling, &room_key, &active, &update.client_data).await;
                    }
                    None => {
                        if !cancel.is_cancelled() {
                            log::warn!("mapping update watcher exited unexpectedly");
                        }
                        break;
                    }
                }
            }
            _ = presence.tick() => {
                if let Err(e) = publish_registration(&signaling, &room_key, &ctx.local_info, &active).await {
                    log::warn!("presence refresh failed: {}", e);
                } else {
                    log::debug!("server presence refreshed");
                }
            }
        }
    }

    log::info!("server shutting down");
    Ok(())
}

/// Allocate a port for `mapping`, start its listener, and record it in the
/// active table.
async fn start_mapping(
    ctx: &ServerCtx,
    mapping: PortMapping,
    client_info: &NetworkInfo,
    active: &ActiveMappings,
) -> Result<()> {
    let port = crate::allocator::allocate(mapping.protocol).await?;
    let service = SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        mapping.remote_port,
    );
    let token = ctx.cancel.child_token();

    match mapping.protocol {
        Protocol::Tcp => {
            let listener = TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
                Error::allocation_with_source(format!("failed to bind allocated TCP port {}", port), e)
            })?;
            tokio::spawn(forward::serve_tcp(listener, service, token.clone()));
        }
        Protocol::Udp => {
            let socket = UdpSocket::bind(("0.0.0.0", port)).await.map_err(|e| {
                Error::allocation_with_source(format!("failed to bind allocated UDP port {}", port), e)
            })?;
            tokio::spawn(run_udp_listener(
                socket,
                ctx.local_info.clone(),
                client_info.clone(),
                service,
                ctx.session_timeout,
                ctx.punch_timeout,
                token.clone(),
            ));
        }
    }

    log::info!(
        "allocated {} port {} for mapping {} -> local service {}",
        mapping.protocol,
        port,
        mapping,
        service
    );

    active.lock().await.insert(
        mapping,
        ActiveMapping {
            allocation: ServerAllocation {
                client_mapping: mapping,
                allocated_port: port,
            },
            token,
        },
    );
    Ok(())
}

/// Host one UDP mapping. When both sides believe punching is feasible the
/// server joins the punch as responder and bridges the path straight to the
/// loopback service; otherwise (or on punch failure) the allocated listener
/// relays with per-source sessions.
async fn run_udp_listener(
    listener: UdpSocket,
    local_info: NetworkInfo,
    client_info: NetworkInfo,
    service: SocketAddr,
    session_timeout: Duration,
    punch_timeout: Duration,
    cancel: CancellationToken,
) {
    if local_info.can_hole_punch && client_info.can_hole_punch {
        match holepunch::establish(&local_info, &client_info, false, punch_timeout).await {
            Ok(path) => {
                // The listener stays bound to keep the published port
                // reserved while traffic flows over the punched path.
                if let Err(e) = forward::serve_udp_path_server(path, service, cancel).await {
                    log::warn!("hole-punched bridge failed: {}", e);
                }
                return;
            }
            Err(e) => {
                log::warn!("hole punch failed, falling back to relay: {}", e);
            }
        }
    }

    forward::serve_udp_relay(listener, service, session_timeout, cancel).await;
}

/// Apply a fresh client registration: stop removed mappings, allocate and
/// start added ones, then publish the updated table.
async fn reconcile(
    ctx: &ServerCtx,
    signaling: &SignalingClient,
    room_key: &str,
    active: &ActiveMappings,
    client_data: &str,
) {
    let registration = match ClientRegistration::decode(client_data) {
        Ok(registration) => registration,
        Err(e) => {
            log::warn!("ignoring unparsable client update: {}", e);
            return;
        }
    };
    let desired = registration.parsed_mappings();

    let removed: Vec<PortMapping> = {
        let table = active.lock().await;
        table
            .keys()
            .filter(|m| !desired.contains(*m))
            .copied()
            .collect()
    };
    for mapping in removed {
        let entry = active.lock().await.remove(&mapping);
        if let Some(entry) = entry {
            log::info!(
                "stopping listener on port {} for removed mapping {}",
                entry.allocation.allocated_port,
                mapping
            );
            entry.token.cancel();
        }
    }

    for mapping in desired {
        let exists = active.lock().await.contains_key(&mapping);
        if exists {
            continue;
        }
        // Hot adds are per-mapping: one failed allocation does not take the
        // rest of the server down.
        if let Err(e) = start_mapping(ctx, mapping, &registration.network_info, active).await {
            log::warn!("could not start added mapping {}: {}", mapping, e);
        }
    }

    if let Err(e) = publish_registration(signaling, room_key, &ctx.local_info, active).await {
        log::warn!("failed to publish refreshed registration: {}", e);
    }
}

/// Publish the current allocation table into the server slot.
async fn publish_registration(
    signaling: &SignalingClient,
    room_key: &str,
    local_info: &NetworkInfo,
    active: &ActiveMappings,
) -> Result<()> {
    let mut port_mappings: Vec<ServerAllocation> = {
        let table = active.lock().await;
        table.values().map(|m| m.allocation.clone()).collect()
    };
    port_mappings.sort_by_key(|a| a.client_mapping.to_string());

    let registration = ServerRegistration {
        network_info: local_info.clone(),
        port_mappings,
    };
    signaling
        .publish("server", room_key, &registration.encode()?)
        .await
}
