//! Per-source UDP session state with idle eviction.
//!
//! Every distinct source endpoint observed on a UDP forwarding listener gets
//! one session holding a connected upstream socket. A background sweeper
//! evicts sessions that stayed idle beyond the configured timeout; eviction
//! drops the upstream socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Cadence of the idle-session sweeper.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One forwarding session for a single source endpoint.
pub struct UdpSession {
    /// The source endpoint this session belongs to.
    pub peer: SocketAddr,
    /// Connected socket toward the upstream target.
    pub upstream: Arc<UdpSocket>,
    last_activity: RwLock<Instant>,
}

impl UdpSession {
    pub async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    async fn idle_for(&self) -> Duration {
        self.last_activity.read().await.elapsed()
    }
}

/// Session table for one UDP listener, keyed by source endpoint.
pub struct UdpSessionManager {
    sessions: RwLock<HashMap<SocketAddr, Arc<UdpSession>>>,
    timeout: Duration,
}

impl UdpSessionManager {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            timeout,
        })
    }

    /// Return the session for `source`, creating one (with a fresh connected
    /// upstream socket) if none exists. The upstream dial happens outside the
    /// table lock; a concurrent insert for the same source wins and the
    /// losing socket is dropped, so each source has at most one session.
    pub async fn get_or_create(
        self: &Arc<Self>,
        source: SocketAddr,
        upstream_target: SocketAddr,
    ) -> Result<Arc<UdpSession>> {
        if let Some(session) = self.sessions.read().await.get(&source) {
            session.touch().await;
            return Ok(session.clone());
        }

        let upstream = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| Error::forwarding_with_source("failed to bind upstream socket", e))?;
        upstream.connect(upstream_target).await.map_err(|e| {
            Error::forwarding_with_source(
                format!("failed to connect upstream socket to {}", upstream_target),
                e,
            )
        })?;

        let session = Arc::new(UdpSession {
            peer: source,
            upstream: Arc::new(upstream),
            last_activity: RwLock::new(Instant::now()),
        });

        let mut table = self.sessions.write().await;
        let entry = table.entry(source).or_insert_with(|| session.clone());
        Ok(entry.clone())
    }

    /// Remove and return expired sessions. The returned sessions hold the
    /// last references to their upstream sockets unless a forward task is
    /// still in flight.
    pub async fn evict_expired(&self) -> Vec<Arc<UdpSession>> {
        let mut expired = Vec::new();
        {
            let table = self.sessions.read().await;
            for (source, session) in table.iter() {
                if session.idle_for().await > self.timeout {
                    expired.push(*source);
                }
            }
        }

        let mut removed = Vec::new();
        if !expired.is_empty() {
            let mut table = self.sessions.write().await;
            for source in expired {
                if let Some(session) = table.remove(&source) {
                    log::debug!("UDP session for {} expired", source);
                    removed.push(session);
                }
            }
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Run the eviction loop until cancelled.
    pub async fn sweep(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let removed = self.evict_expired().await;
                    if !removed.is_empty() {
                        log::info!("evicted {} idle UDP sessions", removed.len());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn upstream_target() -> SocketAddr {
        // UDP connect is purely local, so an address that nothing listens on
        // is a fine upstream target for these tests.
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind target");
        socket.local_addr().expect("target addr")
    }

    #[tokio::test]
    async fn test_session_reuse_for_same_source() {
        let manager = UdpSessionManager::new(Duration::from_secs(300));
        let target = upstream_target().await;
        let source: SocketAddr = "127.0.0.1:34567".parse().unwrap();

        let first = manager.get_or_create(source, target).await.expect("create");
        let second = manager.get_or_create(source, target).await.expect("reuse");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn test_distinct_sources_get_distinct_sessions() {
        let manager = UdpSessionManager::new(Duration::from_secs(300));
        let target = upstream_target().await;

        let a = manager
            .get_or_create("127.0.0.1:40001".parse().unwrap(), target)
            .await
            .expect("a");
        let b = manager
            .get_or_create("127.0.0.1:40002".parse().unwrap(), target)
            .await
            .expect("b");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(manager.len().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_creation_keeps_one_session_per_source() {
        let manager = UdpSessionManager::new(Duration::from_secs(300));
        let target = upstream_target().await;
        let source: SocketAddr = "127.0.0.1:35000".parse().unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_or_create(source, target).await })
            })
            .collect();

        let mut sessions = Vec::new();
        for task in tasks {
            sessions.push(task.await.expect("join").expect("session"));
        }
        assert_eq!(manager.len().await, 1);
        for s in &sessions[1..] {
            assert!(Arc::ptr_eq(&sessions[0], s));
        }
    }

    #[tokio::test]
    async fn test_idle_sessions_are_evicted() {
        let manager = UdpSessionManager::new(Duration::from_millis(20));
        let target = upstream_target().await;
        let source: SocketAddr = "127.0.0.1:36000".parse().unwrap();

        manager.get_or_create(source, target).await.expect("create");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let removed = manager.evict_expired().await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].peer, source);
        assert_eq!(manager.len().await, 0);
    }

    #[tokio::test]
    async fn test_activity_defers_eviction() {
        let manager = UdpSessionManager::new(Duration::from_millis(80));
        let target = upstream_target().await;
        let source: SocketAddr = "127.0.0.1:37000".parse().unwrap();

        let session = manager.get_or_create(source, target).await.expect("create");
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.touch().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.evict_expired().await.is_empty());
        assert_eq!(manager.len().await, 1);
    }
}
