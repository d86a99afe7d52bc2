use async_trait::async_trait;

use crate::errors::DeliveryError;
use crate::ids::ConnectionId;

/// Send primitive of the layer that hosts live connections.
///
/// Implementations must classify failures: [`DeliveryError::Gone`] when the
/// connection no longer exists, [`DeliveryError::Transient`] otherwise.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, connection_id: &ConnectionId, payload: &str) -> Result<(), DeliveryError>;
}
