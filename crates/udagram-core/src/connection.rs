use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ConnectionId;

/// One registry entry: a currently-open client session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    /// Informational only. Never used to decide eviction.
    pub created_at: DateTime<Utc>,
}

impl ConnectionRecord {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_camel_case() {
        let record = ConnectionRecord::new(ConnectionId::from_raw("conn_1"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["connectionId"], "conn_1");
        assert!(json["createdAt"].is_string());
    }
}
