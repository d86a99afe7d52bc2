use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One completed upload, as reported by object storage.
///
/// Delivery from the storage side is at-least-once and unordered, so the same
/// event may show up more than once.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEvent {
    pub bucket_name: String,
    pub object_key: String,
}

impl UploadEvent {
    pub fn new(bucket_name: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            object_key: object_key.into(),
        }
    }

    /// Group segment of the key: everything before the last `/`.
    /// `None` for keys stored at the bucket root.
    pub fn group_id(&self) -> Option<&str> {
        self.object_key
            .trim_start_matches('/')
            .rsplit_once('/')
            .map(|(group, _)| group)
            .filter(|g| !g.is_empty())
    }

    /// Image segment of the key: the last `/`-separated component.
    pub fn image_id(&self) -> &str {
        match self.object_key.rsplit_once('/') {
            Some((_, image)) => image,
            None => &self.object_key,
        }
    }
}

/// Payload pushed to every live connection when an image lands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "image_uploaded", rename_all = "camelCase")]
pub struct ImageNotification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub image_id: String,
    pub image_url: String,
    pub bucket: String,
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

impl ImageNotification {
    pub fn from_event(event: &UploadEvent, image_url: String) -> Self {
        Self {
            group_id: event.group_id().map(str::to_owned),
            image_id: event.image_id().to_owned(),
            image_url,
            bucket: event.bucket_name.clone(),
            key: event.object_key.clone(),
            timestamp: Utc::now(),
        }
    }
}
