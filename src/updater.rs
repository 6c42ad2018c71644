//! Config-file watcher for runtime mapping updates.
//!
//! The client polls its own configuration file and, whenever the mapping
//! set changes, hands the new set to the coordinator, which pushes it to
//! the signaling endpoint and reconciles local forwarders. A file that is
//! temporarily unreadable or unparsable (for example mid-edit) is skipped.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Mode, PortMapping};

/// Poll cadence for config changes.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

fn as_set(mappings: &[PortMapping]) -> HashSet<PortMapping> {
    mappings.iter().copied().collect()
}

/// Poll `path` until cancelled, sending the full mapping set through `tx`
/// whenever it differs from the last observed one.
pub async fn watch_config_file(
    path: PathBuf,
    initial: Vec<PortMapping>,
    interval: Duration,
    tx: mpsc::Sender<Vec<PortMapping>>,
    cancel: CancellationToken,
) {
    log::info!("watching {} for mapping changes", path.display());

    let mut current = as_set(&initial);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately and would just re-read the config we
    // started from.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("config watcher stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let config = match Config::load(&path) {
            Ok(config) => config,
            Err(e) => {
                log::debug!("config reload skipped: {}", e);
                continue;
            }
        };

        if config.mode != Mode::Client {
            log::warn!("config mode changed away from client, ignoring reload");
            continue;
        }

        let fresh = as_set(&config.mappings);
        if fresh == current {
            continue;
        }

        log::info!(
            "mapping set changed ({} -> {} entries), pushing update",
            current.len(),
            fresh.len()
        );
        current = fresh;

        if tx.send(config.mappings).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn write_config(path: &std::path::Path, mappings: &[&str]) {
        let list = mappings
            .iter()
            .map(|m| format!("  - \"{}\"", m))
            .collect::<Vec<_>>()
            .join("\n");
        let body = format!(
            "mode: client\nroomId: r1\nsignalingUrl: http://127.0.0.1:9/\nmappings:\n{}\n",
            list
        );
        std::fs::write(path, body).expect("write config");
    }

    #[tokio::test]
    async fn test_watcher_reports_added_mapping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yml");
        write_config(&path, &["tcp:15001:22"]);

        let initial: Vec<PortMapping> = vec!["tcp:15001:22".parse().unwrap()];
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        tokio::spawn(watch_config_file(
            path.clone(),
            initial,
            Duration::from_millis(30),
            tx,
            cancel.clone(),
        ));

        write_config(&path, &["tcp:15001:22", "udp:17000:53"]);

        let update = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("update in time")
            .expect("channel open");
        assert_eq!(update.len(), 2);
        assert!(update.contains(&"udp:17000:53".parse().unwrap()));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_watcher_ignores_unchanged_and_broken_configs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yml");
        write_config(&path, &["tcp:15001:22"]);

        let initial: Vec<PortMapping> = vec!["tcp:15001:22".parse().unwrap()];
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        tokio::spawn(watch_config_file(
            path.clone(),
            initial,
            Duration::from_millis(20),
            tx,
            cancel.clone(),
        ));

        // Unchanged content, then a syntactically broken file: neither may
        // produce an update.
        write_config(&path, &["tcp:15001:22"]);
        tokio::time::sleep(Duration::from_millis(80)).await;
        std::fs::write(&path, "mode: client\nmappings: [").expect("write broken");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());

        // Recovery with a real change is picked up.
        write_config(&path, &["udp:17000:53"]);
        let update = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("update in time")
            .expect("channel open");
        assert_eq!(update, vec!["udp:17000:53".parse().unwrap()]);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_watcher_exits_on_cancel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yml");
        write_config(&path, &["tcp:15001:22"]);

        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(watch_config_file(
            path,
            vec!["tcp:15001:22".parse().unwrap()],
            Duration::from_millis(20),
            tx,
            cancel.clone(),
        ));

        cancel.cancel();
        timeout(Duration::from_secs(2), watcher)
            .await
            .expect("watcher exited in time")
            .expect("join");
    }
}
