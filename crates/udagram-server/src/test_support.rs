//! Hand-written doubles for the store, transport and signer seams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use udagram_core::{ConnectionId, ConnectionRecord, DeliveryError, SignError, Transport, UrlSigner};
use udagram_store::{ConnectionRepo, ConnectionStore, Database, StoreError};

pub fn memory_store() -> Arc<ConnectionRepo> {
    Arc::new(ConnectionRepo::new(Database::in_memory().unwrap()))
}

/// SQLite-backed store whose operations can be switched to fail.
pub struct FlakyStore {
    inner: ConnectionRepo,
    fail_put: AtomicBool,
    fail_delete: AtomicBool,
    fail_scan: AtomicBool,
    scans: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: ConnectionRepo::new(Database::in_memory().unwrap()),
            fail_put: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            fail_scan: AtomicBool::new(false),
            scans: AtomicUsize::new(0),
        }
    }

    pub fn fail_put(&self, fail: bool) {
        self.fail_put.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn fail_scan(&self, fail: bool) {
        self.fail_scan.store(fail, Ordering::SeqCst);
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    fn check(flag: &AtomicBool) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConnectionStore for FlakyStore {
    async fn put(&self, id: &ConnectionId) -> Result<(), StoreError> {
        Self::check(&self.fail_put)?;
        self.inner.put(id).await
    }

    async fn delete(&self, id: &ConnectionId) -> Result<(), StoreError> {
        Self::check(&self.fail_delete)?;
        self.inner.delete(id).await
    }

    async fn scan_all(&self) -> Result<Vec<ConnectionRecord>, StoreError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_scan)?;
        self.inner.scan_all().await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.inner.count().await
    }
}

/// Scripted reaction of [`ScriptedTransport`] for one connection.
#[derive(Clone, Debug)]
pub enum Script {
    Deliver,
    Gone,
    Transient,
    /// Never completes; only a timeout ends the attempt.
    Hang,
}

/// Transport that answers per connection id from a script and records
/// what it was asked to do.
pub struct ScriptedTransport {
    scripts: HashMap<ConnectionId, Script>,
    delay: Duration,
    sent: Mutex<Vec<(ConnectionId, String)>>,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    /// Every connection not named in `scripts` gets [`Script::Deliver`].
    pub fn new(scripts: impl IntoIterator<Item = (&'static str, Script)>) -> Self {
        Self {
            scripts: scripts
                .into_iter()
                .map(|(id, s)| (ConnectionId::from_raw(id), s))
                .collect(),
            delay: Duration::ZERO,
            sent: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn delivering() -> Self {
        Self::new([])
    }

    /// Hold every attempt for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn delivered_to(&self) -> Vec<ConnectionId> {
        self.sent.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, p)| p.clone()).collect()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, connection_id: &ConnectionId, payload: &str) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.scripts.get(connection_id).cloned().unwrap_or(Script::Deliver) {
            Script::Deliver => {
                self.sent
                    .lock()
                    .push((connection_id.clone(), payload.to_owned()));
                Ok(())
            }
            Script::Gone => Err(DeliveryError::Gone),
            Script::Transient => Err(DeliveryError::Transient("peer busy".into())),
            Script::Hang => std::future::pending().await,
        }
    }
}

/// Signer that always fails.
pub struct FailingSigner;

impl UrlSigner for FailingSigner {
    fn sign(&self, _bucket: &str, _key: &str) -> Result<String, SignError> {
        Err(SignError::KeyUnavailable("no credentials".into()))
    }
}
