//! Object-created notifications in, broadcast cycles out.
//!
//! Storage notifications arrive in the S3 event format. Only `ObjectCreated:*`
//! records become [`UploadEvent`]s; everything else is skipped. Each event is
//! handed to the broadcaster on its own task, so cycles for different uploads
//! overlap and a redelivered event simply runs another cycle.

use std::sync::Arc;

use percent_encoding::percent_decode_str;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use udagram_core::UploadEvent;

use crate::broadcaster::Broadcaster;

const OBJECT_CREATED_PREFIX: &str = "ObjectCreated:";

#[derive(Debug, thiserror::Error)]
pub enum EventSourceError {
    #[error("malformed notification: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("object key is not valid UTF-8 after decoding: {0}")]
    InvalidKey(String),
}

#[derive(Debug, Deserialize)]
struct S3Notification {
    #[serde(rename = "Records", default)]
    records: Vec<S3Record>,
}

#[derive(Debug, Deserialize)]
struct S3Record {
    #[serde(rename = "eventName", default)]
    event_name: String,
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
}

/// Parse a storage notification into upload events.
pub fn parse_notification(body: &str) -> Result<Vec<UploadEvent>, EventSourceError> {
    let notification: S3Notification = serde_json::from_str(body)?;
    let mut events = Vec::new();
    for record in notification.records {
        if !record.event_name.starts_with(OBJECT_CREATED_PREFIX) {
            tracing::debug!(event_name = %record.event_name, "skipping non-create record");
            continue;
        }
        let key = decode_key(&record.s3.object.key)?;
        events.push(UploadEvent::new(record.s3.bucket.name, key));
    }
    Ok(events)
}

/// Keys arrive form-encoded: `+` is a space, `%XX` an escaped byte.
fn decode_key(raw: &str) -> Result<String, EventSourceError> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|k| k.into_owned())
        .map_err(|_| EventSourceError::InvalidKey(raw.to_string()))
}

/// Consume upload events until the channel closes or `stop` fires, one
/// broadcast task per event. After `stop`, events already queued still run.
/// In-flight cycles are awaited before the pump returns.
pub fn spawn_event_pump(
    mut rx: mpsc::Receiver<UploadEvent>,
    broadcaster: Arc<Broadcaster>,
    mut stop: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut cycles = JoinSet::new();
        let mut stopping = false;
        loop {
            tokio::select! {
                signal = &mut stop, if !stopping => {
                    stopping = true;
                    // A dropped handle is not a stop request.
                    if signal.is_ok() {
                        tracing::debug!("event pump stopping, draining queued events");
                        rx.close();
                    }
                }
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let broadcaster = Arc::clone(&broadcaster);
                    cycles.spawn(async move {
                        if let Err(e) = broadcaster.run_cycle(&event).await {
                            tracing::error!(
                                bucket = %event.bucket_name,
                                key = %event.object_key,
                                error = %e,
                                "broadcast cycle failed"
                            );
                        }
                    });
                }
                Some(done) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(e) = done {
                        tracing::warn!(error = %e, "broadcast task did not complete");
                    }
                }
            }
        }
        while cycles.join_next().await.is_some() {}
        tracing::info!("upload event channel closed");
    })
}
