/// Outcome of a failed push to one connection.
/// Classifies whether the connection is gone for good or only unreachable right now.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The transport no longer knows the connection (peer vanished without a
    /// graceful close). The registry entry is stale.
    #[error("connection gone")]
    Gone,

    /// Non-terminal failure: full send queue, slow peer, timeout.
    #[error("transient delivery failure: {0}")]
    Transient(String),
}

impl DeliveryError {
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Gone)
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Gone => "stale",
            Self::Transient(_) => "transient",
        }
    }
}

/// Failure to issue a read URL for an uploaded object.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SignError {
    #[error("invalid object location: {0}")]
    InvalidLocation(String),

    #[error("signing key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("clock error: {0}")]
    Clock(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_classification() {
        assert!(DeliveryError::Gone.is_stale());
        assert!(!DeliveryError::Transient("queue full".into()).is_stale());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(DeliveryError::Gone.error_kind(), "stale");
        assert_eq!(
            DeliveryError::Transient("timeout".into()).error_kind(),
            "transient"
        );
    }

    #[test]
    fn sign_error_display() {
        let err = SignError::InvalidLocation("empty key".into());
        assert_eq!(err.to_string(), "invalid object location: empty key");
    }
}
