//! HTTP key/value rendezvous client.
//!
//! The signaling endpoint stores one payload per `(room, role)` slot,
//! last-writer-wins. Publishing and fetching are independent; ordering is
//! the coordinator's business. Retries here are observation-side only: the
//! endpoint is never asked to deduplicate anything.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// HTTP request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle connections kept per host.
const MAX_IDLE_PER_HOST: usize = 2;

/// Idle connection lifetime.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait used for the first rapid fetch retries.
const RAPID_RETRY_WAIT: Duration = Duration::from_millis(200);

/// Number of rapid retries before backoff takes over.
const RAPID_RETRY_COUNT: u32 = 3;

/// Initial backoff between fetch attempts.
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Backoff growth after an empty (but successful) poll.
const EMPTY_BACKOFF_FACTOR: f64 = 1.2;

/// Backoff growth after a transport error.
const ERROR_BACKOFF_FACTOR: f64 = 1.5;

#[derive(Serialize)]
struct PublishBody<'a> {
    role: &'a str,
    room: &'a str,
    data: &'a str,
}

#[derive(Serialize)]
struct MappingsBody<'a> {
    room: &'a str,
    mappings: &'a [String],
}

/// Response to an update-check poll.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateCheck {
    #[serde(default)]
    pub has_update: bool,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub client_data: Option<String>,
}

/// A mapping update observed by [`SignalingClient::watch`].
#[derive(Debug, Clone)]
pub struct MappingUpdate {
    pub version: u64,
    pub client_data: String,
}

/// Client for the signaling endpoint.
#[derive(Clone)]
pub struct SignalingClient {
    base_url: String,
    client: reqwest::Client,
}

impl SignalingClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .build()
            .map_err(|e| Error::signaling_with_source("failed to build HTTP client", e))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string() + "/",
            client,
        })
    }

    /// Publish `data` into the `(room, role)` slot. Idempotent,
    /// last-writer-wins.
    pub async fn publish(&self, role: &str, room: &str, data: &str) -> Result<()> {
        log::debug!(
            "publishing {} bytes as role '{}' into room '{}'",
            data.len(),
            role,
            room
        );

        let response = self
            .client
            .post(&self.base_url)
            .json(&PublishBody { role, room, data })
            .send()
            .await
            .map_err(|e| Error::signaling_with_source("publish request failed", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::signaling(format!(
                "publish returned {} ({})",
                status, body
            )));
        }
        Ok(())
    }

    /// Poll the `(room, role)` slot until it holds a payload or `budget`
    /// elapses. The first [`RAPID_RETRY_COUNT`] empty polls retry after
    /// [`RAPID_RETRY_WAIT`]; later ones back off geometrically, faster on
    /// transport errors than on empty responses.
    pub async fn fetch(&self, room: &str, role: &str, budget: Duration) -> Result<String> {
        let deadline = Instant::now() + budget;
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0u32;

        while Instant::now() < deadline {
            attempt += 1;

            let result = self
                .client
                .get(&self.base_url)
                .query(&[("role", role), ("room", room)])
                .send()
                .await;

            match result {
                Err(e) => {
                    log::debug!("fetch attempt {} transport error: {}", attempt, e);
                    tokio::time::sleep(backoff.min(deadline.saturating_duration_since(Instant::now()))).await;
                    backoff = grow(backoff, ERROR_BACKOFF_FACTOR);
                    continue;
                }
                Ok(response) if response.status().is_success() => {
                    match response.text().await {
                        Ok(body) if !body.is_empty() => return Ok(body),
                        Ok(_) => {}
                        Err(e) => log::debug!("fetch attempt {} body read error: {}", attempt, e),
                    }
                }
                Ok(response) => {
                    log::debug!("fetch attempt {} returned {}", attempt, response.status());
                }
            }

            let wait = if attempt <= RAPID_RETRY_COUNT {
                RAPID_RETRY_WAIT
            } else {
                backoff
            };
            tokio::time::sleep(wait.min(deadline.saturating_duration_since(Instant::now()))).await;
            backoff = grow(backoff, EMPTY_BACKOFF_FACTOR);
        }

        Err(Error::signaling(format!(
            "timed out waiting for '{}' payload in room '{}'",
            role, room
        )))
    }

    /// Replace the room's mapping list. The endpoint bumps its mapping
    /// version, which watchers observe.
    pub async fn update_mappings(&self, room: &str, mappings: &[String]) -> Result<()> {
        log::info!("updating {} mappings in room '{}'", mappings.len(), room);

        let response = self
            .client
            .put(&self.base_url)
            .json(&MappingsBody { room, mappings })
            .send()
            .await
            .map_err(|e| Error::signaling_with_source("mapping update request failed", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::signaling(format!(
                "mapping update returned {} ({})",
                status, body
            )));
        }
        Ok(())
    }

    /// Ask the endpoint whether the client slot changed since
    /// `last_mapping_version`. A non-success status counts as "no update".
    pub async fn check_updates(&self, room: &str, last_mapping_version: u64) -> Result<UpdateCheck> {
        let version = last_mapping_version.to_string();
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("room", room),
                ("role", "client"),
                ("check_updates", "true"),
                ("last_mapping_version", version.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::signaling_with_source("update check request failed", e))?;

        if !response.status().is_success() {
            log::debug!("update check returned {}", response.status());
            return Ok(UpdateCheck {
                has_update: false,
                version: last_mapping_version,
                client_data: None,
            });
        }

        response
            .json()
            .await
            .map_err(|e| Error::signaling_with_source("update check response malformed", e))
    }

    /// Start a polling watcher on the room's client slot. Updates arrive on
    /// the returned channel; the watcher advances its version cursor after
    /// each delivery and exits when cancelled.
    pub fn watch(
        &self,
        room: String,
        interval: Duration,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<MappingUpdate> {
        let (tx, rx) = mpsc::channel(4);
        let client = self.clone();

        tokio::spawn(async move {
            log::info!("mapping update watcher started for room '{}'", room);
            let mut last_version = 0u64;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        log::info!("mapping update watcher stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let check = match client.check_updates(&room, last_version).await {
                    Ok(check) => check,
                    Err(e) => {
                        log::warn!("update check failed: {}", e);
                        continue;
                    }
                };

                if check.has_update {
                    if let Some(client_data) = check.client_data {
                        log::info!("detected mapping update (version {})", check.version);
                        last_version = check.version.max(last_version + 1);
                        let update = MappingUpdate {
                            version: last_version,
                            client_data,
                        };
                        if tx.send(update).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        rx
    }
}

fn grow(backoff: Duration, factor: f64) -> Duration {
    backoff.mul_f64(factor).min(MAX_BACKOFF)
}
