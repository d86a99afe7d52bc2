use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{instrument, Instrument};
use udagram_core::{
    ConnectionId, DeliveryError, ImageNotification, SignError, Transport, UploadEvent, UrlSigner,
};
use udagram_store::{ConnectionStore, StoreError};
use udagram_telemetry::MetricsRecorder;

/// Cycle-level failures. Per-connection failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("registry scan failed: {0}")]
    Registry(#[from] StoreError),

    #[error("payload build failed: {0}")]
    Payload(String),
}

impl From<SignError> for BroadcastError {
    fn from(e: SignError) -> Self {
        Self::Payload(e.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    /// Delivery attempts in flight at once.
    pub max_concurrency: usize,
    /// Deadline for a single attempt.
    pub delivery_timeout: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            delivery_timeout: Duration::from_secs(5),
        }
    }
}

/// Classified result of one delivery attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Transport reported the connection gone. `evicted` is false when the
    /// registry delete failed.
    Stale { evicted: bool },
    Transient(String),
}

impl DeliveryOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Stale { .. } => "stale",
            Self::Transient(_) => "transient",
        }
    }
}

/// Tally of one completed cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub evicted: usize,
    pub eviction_failures: usize,
    pub transient: usize,
}

impl BroadcastReport {
    fn record(&mut self, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => self.delivered += 1,
            DeliveryOutcome::Stale { evicted: true } => self.evicted += 1,
            DeliveryOutcome::Stale { evicted: false } => self.eviction_failures += 1,
            DeliveryOutcome::Transient(_) => self.transient += 1,
        }
    }
}

/// Pushes one notification per upload event to every registered connection
/// and evicts the connections the transport no longer knows.
pub struct Broadcaster {
    store: Arc<dyn ConnectionStore>,
    transport: Arc<dyn Transport>,
    signer: Arc<dyn UrlSigner>,
    metrics: Arc<MetricsRecorder>,
    config: BroadcastConfig,
}

impl Broadcaster {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        transport: Arc<dyn Transport>,
        signer: Arc<dyn UrlSigner>,
        metrics: Arc<MetricsRecorder>,
        mut config: BroadcastConfig,
    ) -> Self {
        config.max_concurrency = config.max_concurrency.max(1);
        Self {
            store,
            transport,
            signer,
            metrics,
            config,
        }
    }

    /// Run one broadcast cycle for `event`.
    ///
    /// Fails only when the payload cannot be built or the registry scan
    /// fails; in both cases no delivery is attempted. Otherwise returns once
    /// every attempt has been classified.
    #[instrument(
        skip_all,
        fields(bucket = %event.bucket_name, key = %event.object_key, image_id = %event.image_id())
    )]
    pub async fn run_cycle(&self, event: &UploadEvent) -> Result<BroadcastReport, BroadcastError> {
        let result = self.fan_out(event).await;
        let label = if result.is_ok() { "ok" } else { "failed" };
        self.metrics
            .counter_inc("broadcast.cycles", &[("result", label)], 1);
        result
    }

    async fn fan_out(&self, event: &UploadEvent) -> Result<BroadcastReport, BroadcastError> {
        let payload: Arc<str> = self.build_payload(event)?.into();

        let records = self.store.scan_all().await.inspect_err(|e| {
            tracing::error!(error = %e, "registry scan failed, aborting cycle");
        })?;

        let mut report = BroadcastReport {
            attempted: records.len(),
            ..Default::default()
        };
        if records.is_empty() {
            tracing::debug!("no registered connections");
            return Ok(report);
        }

        let permits = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut attempts = JoinSet::new();
        for record in records {
            let attempt = Attempt {
                connection_id: record.connection_id,
                payload: Arc::clone(&payload),
                store: Arc::clone(&self.store),
                transport: Arc::clone(&self.transport),
                timeout: self.config.delivery_timeout,
            };
            let permits = Arc::clone(&permits);
            attempts.spawn(
                async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return DeliveryOutcome::Transient("delivery pool closed".into());
                    };
                    attempt.run().await
                }
                .in_current_span(),
            );
        }

        while let Some(joined) = attempts.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "delivery task did not complete");
                DeliveryOutcome::Transient(e.to_string())
            });
            self.metrics
                .counter_inc("broadcast.deliveries", &[("outcome", outcome.label())], 1);
            match outcome {
                DeliveryOutcome::Stale { evicted: true } => {
                    self.metrics.counter_inc("broadcast.evictions", &[("result", "ok")], 1);
                }
                DeliveryOutcome::Stale { evicted: false } => {
                    self.metrics.counter_inc("broadcast.evictions", &[("result", "failed")], 1);
                }
                _ => {}
            }
            report.record(&outcome);
        }

        tracing::info!(
            attempted = report.attempted,
            delivered = report.delivered,
            evicted = report.evicted,
            eviction_failures = report.eviction_failures,
            transient = report.transient,
            "broadcast cycle complete"
        );
        Ok(report)
    }

    fn build_payload(&self, event: &UploadEvent) -> Result<String, BroadcastError> {
        let url = self
            .signer
            .sign(&event.bucket_name, &event.object_key)
            .inspect_err(|e| tracing::error!(error = %e, "failed to sign image url"))?;
        let notification = ImageNotification::from_event(event, url);
        serde_json::to_string(&notification).map_err(|e| BroadcastError::Payload(e.to_string()))
    }
}

/// One delivery to one connection, with eviction on a stale result.
struct Attempt {
    connection_id: ConnectionId,
    payload: Arc<str>,
    store: Arc<dyn ConnectionStore>,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl Attempt {
    async fn run(self) -> DeliveryOutcome {
        let sent = tokio::time::timeout(
            self.timeout,
            self.transport.send(&self.connection_id, &self.payload),
        )
        .await;

        match sent {
            Ok(Ok(())) => DeliveryOutcome::Delivered,
            Ok(Err(DeliveryError::Gone)) => self.evict().await,
            Ok(Err(DeliveryError::Transient(reason))) => {
                tracing::warn!(connection_id = %self.connection_id, %reason, "transient delivery failure");
                DeliveryOutcome::Transient(reason)
            }
            Err(_) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "delivery timed out"
                );
                DeliveryOutcome::Transient("timed out".into())
            }
        }
    }

    async fn evict(&self) -> DeliveryOutcome {
        match self.store.delete(&self.connection_id).await {
            Ok(()) => {
                tracing::info!(connection_id = %self.connection_id, "evicted stale connection");
                DeliveryOutcome::Stale { evicted: true }
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    error = %e,
                    "failed to evict stale connection"
                );
                DeliveryOutcome::Stale { evicted: false }
            }
        }
    }
}
