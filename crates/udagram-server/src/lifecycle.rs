use std::sync::Arc;

use udagram_core::ConnectionId;
use udagram_store::{ConnectionStore, StoreError};
use udagram_telemetry::MetricsRecorder;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("connection registry unavailable: {0}")]
    Registry(#[from] StoreError),
}

/// Keeps the connection store in step with transport connect/disconnect.
///
/// A registered id means CONNECTED, an absent one DISCONNECTED.
pub struct LifecycleHandler {
    store: Arc<dyn ConnectionStore>,
    metrics: Arc<MetricsRecorder>,
}

impl LifecycleHandler {
    pub fn new(store: Arc<dyn ConnectionStore>, metrics: Arc<MetricsRecorder>) -> Self {
        Self { store, metrics }
    }

    /// Register `id`. The transport must not confirm the connection unless
    /// this succeeds.
    pub async fn on_connect(&self, id: &ConnectionId) -> Result<(), LifecycleError> {
        match self.store.put(id).await {
            Ok(()) => {
                self.metrics.counter_inc("connections.opened", &[], 1);
                tracing::info!(connection_id = %id, "connection registered");
                Ok(())
            }
            Err(e) => {
                self.metrics.counter_inc("connections.rejected", &[], 1);
                tracing::error!(connection_id = %id, error = %e, "failed to register connection");
                Err(e.into())
            }
        }
    }

    /// Deregister `id`. Best effort: a failed delete leaves a stale row that
    /// the next broadcast evicts.
    pub async fn on_disconnect(&self, id: &ConnectionId) {
        self.metrics.counter_inc("connections.closed", &[], 1);
        match self.store.delete(id).await {
            Ok(()) => tracing::info!(connection_id = %id, "connection deregistered"),
            Err(e) => {
                tracing::warn!(connection_id = %id, error = %e, "failed to deregister connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{memory_store, FlakyStore};

    fn handler(store: Arc<dyn ConnectionStore>) -> (LifecycleHandler, Arc<MetricsRecorder>) {
        let metrics = Arc::new(MetricsRecorder::new());
        (LifecycleHandler::new(store, Arc::clone(&metrics)), metrics)
    }

    fn contains(records: &[udagram_core::ConnectionRecord], id: &ConnectionId) -> bool {
        records.iter().any(|r| &r.connection_id == id)
    }

    #[tokio::test]
    async fn connect_registers() {
        let store = memory_store();
        let (lifecycle, metrics) = handler(store.clone());
        let id = ConnectionId::new();

        lifecycle.on_connect(&id).await.unwrap();
        assert!(contains(&store.scan_all().await.unwrap(), &id));
        assert_eq!(metrics.counter_get("connections.opened", &[]), 1);
    }

    #[tokio::test]
    async fn disconnect_deregisters() {
        let store = memory_store();
        let (lifecycle, _) = handler(store.clone());
        let id = ConnectionId::new();

        lifecycle.on_connect(&id).await.unwrap();
        lifecycle.on_disconnect(&id).await;
        assert!(!contains(&store.scan_all().await.unwrap(), &id));
    }

    #[tokio::test]
    async fn connect_twice_keeps_one_entry() {
        let store = memory_store();
        let (lifecycle, _) = handler(store.clone());
        let id = ConnectionId::from_raw("abc");

        lifecycle.on_connect(&id).await.unwrap();
        lifecycle.on_connect(&id).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn disconnect_unknown_is_quiet() {
        let store = memory_store();
        let (lifecycle, metrics) = handler(store.clone());
        lifecycle.on_disconnect(&ConnectionId::from_raw("never-connected")).await;
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(metrics.counter_get("connections.closed", &[]), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_connects_both_land() {
        let store = memory_store();
        let (lifecycle, _) = handler(store.clone());
        let a = ConnectionId::from_raw("A");
        let b = ConnectionId::from_raw("B");

        let (ra, rb) = tokio::join!(lifecycle.on_connect(&a), lifecycle.on_connect(&b));
        ra.unwrap();
        rb.unwrap();

        let records = store.scan_all().await.unwrap();
        assert!(contains(&records, &a));
        assert!(contains(&records, &b));
    }

    #[tokio::test]
    async fn failed_put_rejects_connection() {
        let store = Arc::new(FlakyStore::new());
        store.fail_put(true);
        let (lifecycle, metrics) = handler(store.clone());

        let err = lifecycle.on_connect(&ConnectionId::new()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Registry(_)));
        assert_eq!(metrics.counter_get("connections.rejected", &[]), 1);
        assert_eq!(metrics.counter_get("connections.opened", &[]), 0);
    }

    #[tokio::test]
    async fn failed_delete_does_not_block_teardown() {
        let store = Arc::new(FlakyStore::new());
        let (lifecycle, _) = handler(store.clone());
        let id = ConnectionId::new();
        lifecycle.on_connect(&id).await.unwrap();

        store.fail_delete(true);
        lifecycle.on_disconnect(&id).await;

        // Row survives until a broadcast evicts it.
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
