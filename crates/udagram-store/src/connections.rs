use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

use udagram_core::{ConnectionId, ConnectionRecord};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Durable registry of live connections, one row per connection id.
///
/// Writes are idempotent and reads are eventually consistent, so unrelated
/// invocations may call into it concurrently without any coordination.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Insert `id`. An id already present is a no-op success.
    async fn put(&self, id: &ConnectionId) -> Result<(), StoreError>;

    /// Remove `id`. Removing an absent id is a no-op success.
    async fn delete(&self, id: &ConnectionId) -> Result<(), StoreError>;

    /// Every current entry, in no particular order.
    async fn scan_all(&self) -> Result<Vec<ConnectionRecord>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

/// SQLite-backed [`ConnectionStore`].
#[derive(Clone)]
pub struct ConnectionRepo {
    db: Database,
}

impl ConnectionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a connection row, keeping the original `created_at` on conflict.
    #[instrument(skip(self), fields(connection_id = %id))]
    pub fn insert(&self, id: &ConnectionId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO connections (id, created_at) VALUES (?1, ?2)
                 ON CONFLICT(id) DO NOTHING",
                rusqlite::params![id.as_str(), now],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(connection_id = %id))]
    pub fn remove(&self, id: &ConnectionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM connections WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(connection_id = %id))]
    pub fn get(&self, id: &ConnectionId) -> Result<Option<ConnectionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, created_at FROM connections WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(record_from_row(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Every row, tolerating damage: an unreadable `created_at` becomes the
    /// Unix epoch, and a row without a readable id is skipped.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<ConnectionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, created_at FROM connections")?;
            let mut rows = stmt.query([])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                if let Some(record) = lenient_record_from_row(row) {
                    records.push(record);
                }
            }
            Ok(records)
        })
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM connections", [], |row| row.get(0))?;
            Ok(usize::try_from(n).unwrap_or_default())
        })
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Run a synchronous repo call off the async runtime.
    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&ConnectionRepo) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let repo = self.clone();
        tokio::task::spawn_blocking(move || f(&repo)).await?
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> Result<ConnectionRecord, StoreError> {
    let id: String = row_helpers::get(row, 0, "connections", "id")?;
    let created_at: String = row_helpers::get(row, 1, "connections", "created_at")?;
    Ok(ConnectionRecord {
        connection_id: ConnectionId::from_raw(id),
        created_at: row_helpers::parse_timestamp(&created_at, "connections", "created_at")?,
    })
}

fn lenient_record_from_row(row: &rusqlite::Row<'_>) -> Option<ConnectionRecord> {
    let id: String = match row_helpers::get(row, 0, "connections", "id") {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(error = %e, "skipping connection row with unreadable id");
            return None;
        }
    };
    let created_at = row_helpers::get::<String>(row, 1, "connections", "created_at")
        .and_then(|raw| row_helpers::parse_timestamp(&raw, "connections", "created_at"))
        .unwrap_or_else(|e| {
            tracing::warn!(connection_id = %id, error = %e, "keeping connection with unreadable created_at");
            DateTime::<Utc>::UNIX_EPOCH
        });
    Some(ConnectionRecord {
        connection_id: ConnectionId::from_raw(id),
        created_at,
    })
}

#[async_trait]
impl ConnectionStore for ConnectionRepo {
    async fn put(&self, id: &ConnectionId) -> Result<(), StoreError> {
        let id = id.clone();
        self.blocking(move |repo| repo.insert(&id)).await
    }

    async fn delete(&self, id: &ConnectionId) -> Result<(), StoreError> {
        let id = id.clone();
        self.blocking(move |repo| repo.remove(&id)).await
    }

    async fn scan_all(&self) -> Result<Vec<ConnectionRecord>, StoreError> {
        self.blocking(|repo| repo.list()).await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.blocking(|repo| repo.len()).await
    }
}
