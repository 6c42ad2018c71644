//! TCP and UDP forwarding plane.
//!
//! Every active mapping owns one listener. TCP pairs each accepted stream
//! with a freshly dialed stream and runs two unidirectional copies. UDP has
//! two modes: relay (per-source sessions with response correlation) and
//! hole-punched (a single peer owns the path, so no demultiplexing is
//! needed). All tasks stop through the cancellation token; dropping the
//! socket halves closes the underlying connections promptly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::holepunch::HolePunchPath;
use crate::session::UdpSessionManager;

/// Buffer size for TCP stream copies.
pub const TCP_BUFFER_SIZE: usize = 64 * 1024;

/// Buffer size for UDP datagrams.
pub const UDP_BUFFER_SIZE: usize = 8 * 1024;

/// How long a relayed datagram waits for the upstream response.
const UDP_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// TCP
// ============================================================================

/// Copy `src` into `dst` until EOF or error. A clean EOF shuts down the
/// write side so half-close propagates to the peer.
async fn copy_stream<R, W>(mut src: R, mut dst: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; TCP_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            dst.shutdown().await?;
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Bridge one accepted stream with a fresh dial to `target`.
async fn handle_tcp_pair(
    inbound: TcpStream,
    peer: SocketAddr,
    target: SocketAddr,
    cancel: CancellationToken,
) {
    let outbound = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("dial to {} failed for {}: {}", target, peer, e);
            return;
        }
    };

    log::debug!("forwarding {} <-> {}", peer, target);

    let (read_in, write_in) = inbound.into_split();
    let (read_out, write_out) = outbound.into_split();

    let inbound_to_target = async {
        if let Err(e) = copy_stream(read_in, write_out).await {
            log::debug!("{} -> {} copy ended: {}", peer, target, e);
        }
    };
    let target_to_inbound = async {
        if let Err(e) = copy_stream(read_out, write_in).await {
            log::debug!("{} -> {} copy ended: {}", target, peer, e);
        }
    };

    tokio::select! {
        _ = async { tokio::join!(inbound_to_target, target_to_inbound) } => {}
        _ = cancel.cancelled() => {}
    }

    log::debug!("connection from {} closed", peer);
}

/// Accept TCP connections and forward each to `target` until cancelled.
pub async fn serve_tcp(listener: TcpListener, target: SocketAddr, cancel: CancellationToken) {
    let local = listener.local_addr().ok();
    log::info!("TCP listener on {:?} forwarding to {}", local, target);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("TCP listener on {:?} stopping", local);
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_tcp_pair(stream, peer, target, cancel.child_token()));
                    }
                    Err(e) => {
                        log::warn!("accept error on {:?}: {}", local, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

// ============================================================================
// UDP relay
// ============================================================================

/// Forward one datagram through its session and relay the upstream response
/// (if any arrives within the response window) back to the source.
async fn relay_datagram(
    data: Vec<u8>,
    session: Arc<crate::session::UdpSession>,
    listener: Arc<UdpSocket>,
) {
    if let Err(e) = session.upstream.send(&data).await {
        log::debug!("upstream send for {} failed: {}", session.peer, e);
        return;
    }

    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    match timeout(UDP_RESPONSE_TIMEOUT, session.upstream.recv(&mut buf)).await {
        Ok(Ok(n)) => {
            session.touch().await;
            if let Err(e) = listener.send_to(&buf[..n], session.peer).await {
                log::debug!("response send to {} failed: {}", session.peer, e);
            }
        }
        Ok(Err(e)) => log::debug!("upstream read for {} failed: {}", session.peer, e),
        // No response within the window; plenty of protocols are one-way.
        Err(_) => {}
    }
}

/// Relay datagrams between the listener and `target`, one session per source
/// endpoint, until cancelled.
pub async fn serve_udp_relay(
    socket: UdpSocket,
    target: SocketAddr,
    session_timeout: Duration,
    cancel: CancellationToken,
) {
    let local = socket.local_addr().ok();
    log::info!("UDP listener on {:?} forwarding to {}", local, target);

    let socket = Arc::new(socket);
    let sessions = UdpSessionManager::new(session_timeout);
    tokio::spawn(sessions.clone().sweep(cancel.child_token()));

    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("UDP listener on {:?} stopping", local);
                return;
            }
            received = socket.recv_from(&mut buf) => {
                let (n, source) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("UDP read error on {:?}: {}", local, e);
                        continue;
                    }
                };

                let session = match sessions.get_or_create(source, target).await {
                    Ok(session) => session,
                    Err(e) => {
                        log::warn!("session for {} failed: {}", source, e);
                        continue;
                    }
                };

                tokio::spawn(relay_datagram(buf[..n].to_vec(), session, socket.clone()));
            }
        }
    }
}

// ============================================================================
// UDP hole-punched
// ============================================================================

/// Client side of a punched path: bridge local application datagrams with
/// the peer-to-peer socket. A single application endpoint is tracked (the
/// most recent sender), mirroring what a point-to-point tunnel can carry.
pub async fn serve_udp_path_client(
    listener: UdpSocket,
    path: HolePunchPath,
    cancel: CancellationToken,
) {
    let local = listener.local_addr().ok();
    log::info!(
        "UDP hole-punched listener on {:?}, peer {} via {}",
        local,
        path.remote,
        path.strategy
    );

    let listener = Arc::new(listener);
    let path_socket = Arc::new(path.socket);
    let remote = path.remote;
    let app_addr: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

    let local_to_path = {
        let listener = listener.clone();
        let path_socket = path_socket.clone();
        let app_addr = app_addr.clone();
        async move {
            let mut buf = vec![0u8; UDP_BUFFER_SIZE];
            loop {
                let (n, from) = match listener.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::debug!("local read error: {}", e);
                        return;
                    }
                };
                *app_addr.lock().await = Some(from);
                if let Err(e) = path_socket.send_to(&buf[..n], remote).await {
                    log::debug!("path send error: {}", e);
                    return;
                }
            }
        }
    };

    let path_to_local = {
        let listener = listener.clone();
        let path_socket = path_socket.clone();
        let app_addr = app_addr.clone();
        async move {
            let mut buf = vec![0u8; UDP_BUFFER_SIZE];
            loop {
                let (n, from) = match path_socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::debug!("path read error: {}", e);
                        return;
                    }
                };
                if from.ip() != remote.ip() {
                    log::debug!("dropping datagram from unexpected source {}", from);
                    continue;
                }
                let target = *app_addr.lock().await;
                match target {
                    Some(app) => {
                        if let Err(e) = listener.send_to(&buf[..n], app).await {
                            log::debug!("local send error: {}", e);
                            return;
                        }
                    }
                    None => log::debug!("datagram from peer before any local sender, dropping"),
                }
            }
        }
    };

    tokio::select! {
        _ = local_to_path => {}
        _ = path_to_local => {}
        _ = cancel.cancelled() => {}
    }
    log::info!("UDP hole-punched listener on {:?} stopping", local);
}

/// Server side of a punched path: bridge the peer-to-peer socket with a
/// fresh connected socket to the loopback service. No per-source
/// demultiplexing; a single peer owns the path.
pub async fn serve_udp_path_server(
    path: HolePunchPath,
    service: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    log::info!(
        "UDP hole-punched path from {} via {} bridging to {}",
        path.remote,
        path.strategy,
        service
    );

    let path_socket = Arc::new(path.socket);
    let remote = path.remote;

    let upstream = UdpSocket::bind("127.0.0.1:0")
        .await
        .map_err(|e| Error::forwarding_with_source("failed to bind service socket", e))?;
    upstream.connect(service).await.map_err(|e| {
        Error::forwarding_with_source(format!("failed to connect to service {}", service), e)
    })?;
    let upstream = Arc::new(upstream);

    let path_to_service = {
        let path_socket = path_socket.clone();
        let upstream = upstream.clone();
        async move {
            let mut buf = vec![0u8; UDP_BUFFER_SIZE];
            loop {
                let (n, from) = match path_socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::debug!("path read error: {}", e);
                        return;
                    }
                };
                if from.ip() != remote.ip() {
                    log::debug!("dropping datagram from unexpected source {}", from);
                    continue;
                }
                if let Err(e) = upstream.send(&buf[..n]).await {
                    log::debug!("service send error: {}", e);
                    return;
                }
            }
        }
    };

    let service_to_path = {
        let path_socket = path_socket.clone();
        let upstream = upstream.clone();
        async move {
            let mut buf = vec![0u8; UDP_BUFFER_SIZE];
            loop {
                let n = match upstream.recv(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        log::debug!("service read error: {}", e);
                        return;
                    }
                };
                if let Err(e) = path_socket.send_to(&buf[..n], remote).await {
                    log::debug!("path send error: {}", e);
                    return;
                }
            }
        }
    };

    tokio::select! {
        _ = path_to_service => {}
        _ = service_to_path => {}
        _ = cancel.cancelled() => {}
    }
    log::info!("UDP hole-punched path to {} stopping", service);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::holepunch::Strategy;

    async fn spawn_tcp_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
        let addr = listener.local_addr().expect("echo addr");
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn spawn_udp_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind echo");
        let addr = socket.local_addr().expect("echo addr");
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_tcp_relay_echoes_end_to_end() {
        let echo = spawn_tcp_echo().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let cancel = CancellationToken::new();
        tokio::spawn(serve_tcp(listener, echo, cancel.clone()));

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream.write_all(b"hello").await.expect("write");
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"hello");

        // A second connection through the same listener works too.
        let mut second = TcpStream::connect(addr).await.expect("connect 2");
        second.write_all(b"again").await.expect("write 2");
        let mut buf = [0u8; 5];
        second.read_exact(&mut buf).await.expect("read 2");
        assert_eq!(&buf, b"again");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_tcp_listener_stops_on_cancel() {
        let echo = spawn_tcp_echo().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve_tcp(listener, echo, cancel.clone()));

        // Active connection, then shutdown.
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream.write_all(b"x").await.expect("write");

        cancel.cancel();
        timeout(Duration::from_secs(2), server)
            .await
            .expect("listener exited in time")
            .expect("join");

        // The listener socket is gone; new connections must fail.
        let refused = TcpStream::connect(addr).await;
        assert!(refused.is_err());
    }

    #[tokio::test]
    async fn test_udp_relay_echoes_end_to_end() {
        let echo = spawn_udp_echo().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = socket.local_addr().expect("addr");
        let cancel = CancellationToken::new();
        tokio::spawn(serve_udp_relay(
            socket,
            echo,
            Duration::from_secs(300),
            cancel.clone(),
        ));

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("client bind");
        client.send_to(b"ping", addr).await.expect("send");
        let mut buf = [0u8; 16];
        let (n, from) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("reply in time")
            .expect("recv");
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, addr);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_udp_relay_keeps_sources_separate() {
        let echo = spawn_udp_echo().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = socket.local_addr().expect("addr");
        let cancel = CancellationToken::new();
        tokio::spawn(serve_udp_relay(
            socket,
            echo,
            Duration::from_secs(300),
            cancel.clone(),
        ));

        let a = UdpSocket::bind("127.0.0.1:0").await.expect("a");
        let b = UdpSocket::bind("127.0.0.1:0").await.expect("b");
        a.send_to(b"from-a", addr).await.expect("send a");
        b.send_to(b"from-b", addr).await.expect("send b");

        let mut buf = [0u8; 16];
        let (n, _) = timeout(Duration::from_secs(5), a.recv_from(&mut buf))
            .await
            .expect("a reply")
            .expect("a recv");
        assert_eq!(&buf[..n], b"from-a");
        let (n, _) = timeout(Duration::from_secs(5), b.recv_from(&mut buf))
            .await
            .expect("b reply")
            .expect("b recv");
        assert_eq!(&buf[..n], b"from-b");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_udp_path_server_bridges_to_service() {
        let echo = spawn_udp_echo().await;

        // Fake punched path: the "peer" socket talks to the path socket.
        let path_socket = UdpSocket::bind("127.0.0.1:0").await.expect("path bind");
        let path_addr = path_socket.local_addr().expect("path addr");
        let peer = UdpSocket::bind("127.0.0.1:0").await.expect("peer bind");
        let peer_addr = peer.local_addr().expect("peer addr");

        let path = HolePunchPath {
            socket: path_socket,
            remote: peer_addr,
            strategy: Strategy::SimultaneousSend,
        };
        let cancel = CancellationToken::new();
        tokio::spawn(serve_udp_path_server(path, echo, cancel.clone()));

        peer.send_to(b"ping", path_addr).await.expect("send");
        let mut buf = [0u8; 16];
        let (n, from) = timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
            .await
            .expect("reply in time")
            .expect("recv");
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, path_addr);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_udp_path_client_bridges_local_applications() {
        // Fake punched path between the client bridge and a raw peer socket.
        let path_socket = UdpSocket::bind("127.0.0.1:0").await.expect("path bind");
        let peer = UdpSocket::bind("127.0.0.1:0").await.expect("peer bind");
        let peer_addr = peer.local_addr().expect("peer addr");

        let listener = UdpSocket::bind("127.0.0.1:0").await.expect("listener bind");
        let listener_addr = listener.local_addr().expect("listener addr");

        let path = HolePunchPath {
            socket: path_socket,
            remote: peer_addr,
            strategy: Strategy::DirectPublic,
        };
        let cancel = CancellationToken::new();
        tokio::spawn(serve_udp_path_client(listener, path, cancel.clone()));

        let app = UdpSocket::bind("127.0.0.1:0").await.expect("app bind");
        app.send_to(b"outbound", listener_addr).await.expect("send");

        let mut buf = [0u8; 16];
        let (n, from) = timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
            .await
            .expect("peer got datagram")
            .expect("recv");
        assert_eq!(&buf[..n], b"outbound");

        // Reply travels back to the application socket.
        peer.send_to(b"inbound", from).await.expect("reply");
        let (n, _) = timeout(Duration::from_secs(5), app.recv_from(&mut buf))
            .await
            .expect("app got reply")
            .expect("recv");
        assert_eq!(&buf[..n], b"inbound");

        cancel.cancel();
    }
}
