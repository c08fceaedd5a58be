use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::debug;

use super::{validate_sequence, HistoryStore, InstanceRecord, ProviderError};
use crate::{ErrorDetails, Event, EventKind, InstanceStatus};

/// SQLite-backed history store.
///
/// History rows are keyed by `(instance_id, sequence_number)`. Each append is
/// a single `INSERT ... SELECT MAX + 1` statement, so sequence assignment is
/// atomic even with several pooled connections writing the same instance.
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    /// Convert sqlx error to ProviderError with appropriate retry classification
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();

        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("Database locked: {error_msg}"));
        }

        if error_msg.contains("FOREIGN KEY") {
            return ProviderError::permanent(operation, format!("instance not found: {error_msg}"));
        }

        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("Constraint violation: {error_msg}"));
        }

        if error_msg.contains("connection") || error_msg.contains("timeout") {
            return ProviderError::retryable(operation, format!("Connection error: {error_msg}"));
        }

        ProviderError::retryable(operation, error_msg)
    }

    /// Open (or create) a store.
    ///
    /// # Arguments
    /// * `database_url` - SQLite connection string (e.g., "sqlite:data.db" or "sqlite::memory:")
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new().max_connections(5);
        if is_memory {
            // The database disappears with its last connection.
            pool_options = pool_options.min_connections(1).idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        // Appended events must survive a crash: full sync on commit.
                        sqlx::query("PRAGMA synchronous = FULL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await?;

        Self::create_schema(&pool).await?;
        debug!(target: "blobflow::providers::sqlite", database_url, "sqlite history store ready");
        Ok(Self { pool })
    }

    /// Private in-memory database, one per call.
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:").await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                input TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'Running',
                output TEXT,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status)")
            .execute(pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL REFERENCES instances(instance_id) ON DELETE CASCADE,
                sequence_number INTEGER NOT NULL,
                kind TEXT NOT NULL,
                activity_name TEXT,
                attempt INTEGER,
                payload TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                PRIMARY KEY (instance_id, sequence_number)
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Force a WAL checkpoint so all committed events land in the main file.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint operation fails.
    pub async fn checkpoint(&self) -> Result<(), sqlx::Error> {
        sqlx::query("PRAGMA wal_checkpoint(FULL)").execute(&self.pool).await?;
        Ok(())
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<InstanceRecord, ProviderError> {
        let get_err = |e: sqlx::Error| ProviderError::permanent("read_instance", format!("bad instance row: {e}"));
        let status_str: String = row.try_get("status").map_err(get_err)?;
        let status = InstanceStatus::parse(&status_str)
            .ok_or_else(|| ProviderError::corruption("read_instance", format!("unknown status '{status_str}'")))?;
        let error_json: Option<String> = row.try_get("error").map_err(get_err)?;
        let error = match error_json {
            Some(s) => Some(
                serde_json::from_str::<ErrorDetails>(&s)
                    .map_err(|e| ProviderError::corruption("read_instance", format!("undecodable error detail: {e}")))?,
            ),
            None => None,
        };
        let created_at: i64 = row.try_get("created_at").map_err(get_err)?;
        Ok(InstanceRecord {
            id: row.try_get("instance_id").map_err(get_err)?,
            input: row.try_get("input").map_err(get_err)?,
            status,
            output: row.try_get("output").map_err(get_err)?,
            error,
            created_at_ms: created_at.max(0) as u64,
        })
    }
}

#[async_trait::async_trait]
impl HistoryStore for SqliteHistoryStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_instance(&self, record: &InstanceRecord) -> Result<(), ProviderError> {
        let now = crate::now_millis() as i64;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO instances (instance_id, input, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.input)
        .bind(record.status.as_str())
        .bind(record.created_at_ms as i64)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("create_instance", e))?;

        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent(
                "create_instance",
                format!("instance already exists: {}", record.id),
            ));
        }
        Ok(())
    }

    async fn append(&self, instance: &str, kind: EventKind) -> Result<u64, ProviderError> {
        let payload = serde_json::to_string(&kind)
            .map_err(|e| ProviderError::permanent("append", format!("Serialization error: {e}")))?;
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO history (instance_id, sequence_number, kind, activity_name, attempt, payload, timestamp)
            SELECT ?1, COALESCE(MAX(sequence_number), 0) + 1, ?2, ?3, ?4, ?5, ?6
            FROM history WHERE instance_id = ?1
            RETURNING sequence_number
            "#,
        )
        .bind(instance)
        .bind(kind.kind_name())
        .bind(kind.activity_name())
        .bind(kind.attempt().map(i64::from))
        .bind(payload)
        .bind(crate::now_millis() as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("append", e))?;

        debug!(
            target: "blobflow::providers::sqlite",
            instance_id = %instance,
            sequence_number = seq,
            kind = kind.kind_name(),
            "appended event"
        );
        Ok(seq as u64)
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence_number, timestamp, payload
            FROM history
            WHERE instance_id = ?
            ORDER BY sequence_number
            "#,
        )
        .bind(instance)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("read", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            let seq: i64 = row
                .try_get("sequence_number")
                .map_err(|e| ProviderError::corruption("read", format!("bad sequence_number at {idx}: {e}")))?;
            let ts: i64 = row
                .try_get("timestamp")
                .map_err(|e| ProviderError::corruption("read", format!("bad timestamp at {idx}: {e}")))?;
            let payload: String = row
                .try_get("payload")
                .map_err(|e| ProviderError::corruption("read", format!("bad payload at {idx}: {e}")))?;
            // Undecodable records must not be skipped: replay would silently diverge.
            let kind: EventKind = serde_json::from_str(&payload).map_err(|e| {
                ProviderError::corruption(
                    "read",
                    format!("failed to decode event {seq} for instance '{instance}': {e}"),
                )
            })?;
            events.push(Event::new(seq.max(0) as u64, ts.max(0) as u64, kind));
        }

        validate_sequence(instance, &events)?;
        Ok(events)
    }

    async fn read_instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        let row = sqlx::query(
            "SELECT instance_id, input, status, output, error, created_at FROM instances WHERE instance_id = ?",
        )
        .bind(instance)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("read_instance", e))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_status(
        &self,
        instance: &str,
        status: InstanceStatus,
        output: Option<String>,
        error: Option<ErrorDetails>,
    ) -> Result<(), ProviderError> {
        let error_json = match error {
            Some(e) => Some(
                serde_json::to_string(&e)
                    .map_err(|e| ProviderError::permanent("update_status", format!("Serialization error: {e}")))?,
            ),
            None => None,
        };
        let result = sqlx::query(
            "UPDATE instances SET status = ?, output = ?, error = ?, updated_at = ? WHERE instance_id = ?",
        )
        .bind(status.as_str())
        .bind(output)
        .bind(error_json)
        .bind(crate::now_millis() as i64)
        .bind(instance)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("update_status", e))?;

        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent(
                "update_status",
                format!("instance not found: {instance}"),
            ));
        }
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let rows = sqlx::query("SELECT instance_id FROM instances ORDER BY created_at, instance_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("list_instances", e))?;
        rows.iter()
            .map(|r| {
                r.try_get("instance_id")
                    .map_err(|e| ProviderError::permanent("list_instances", e.to_string()))
            })
            .collect()
    }

    async fn list_instances_by_status(&self, status: InstanceStatus) -> Result<Vec<String>, ProviderError> {
        let rows = sqlx::query("SELECT instance_id FROM instances WHERE status = ? ORDER BY created_at, instance_id")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("list_instances_by_status", e))?;
        rows.iter()
            .map(|r| {
                r.try_get("instance_id")
                    .map_err(|e| ProviderError::permanent("list_instances_by_status", e.to_string()))
            })
            .collect()
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("remove_instance", e))?;
        sqlx::query("DELETE FROM history WHERE instance_id = ?")
            .bind(instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("remove_instance", e))?;
        let result = sqlx::query("DELETE FROM instances WHERE instance_id = ?")
            .bind(instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("remove_instance", e))?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent(
                "remove_instance",
                format!("instance not found: {instance}"),
            ));
        }
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("remove_instance", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(name: &str) -> EventKind {
        EventKind::ActivityCompleted {
            name: name.to_string(),
            attempt: 1,
            result: "true".to_string(),
        }
    }

    #[tokio::test]
    async fn append_and_read_back_in_order() {
        let store = SqliteHistoryStore::new_in_memory().await.unwrap();
        store.create_instance(&InstanceRecord::new("i1", "{}")).await.unwrap();
        assert_eq!(store.append("i1", completed("a")).await.unwrap(), 1);
        assert_eq!(store.append("i1", completed("b")).await.unwrap(), 2);

        let hist = store.read("i1").await.unwrap();
        assert_eq!(hist.len(), 2);
        assert_eq!(hist[0].activity_name(), Some("a"));
        assert_eq!(hist[1].sequence_number, 2);
    }

    #[tokio::test]
    async fn in_memory_stores_are_isolated() {
        let a = SqliteHistoryStore::new_in_memory().await.unwrap();
        let b = SqliteHistoryStore::new_in_memory().await.unwrap();
        a.create_instance(&InstanceRecord::new("only-in-a", "{}")).await.unwrap();
        assert!(b.read_instance("only-in-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn append_for_unknown_instance_is_permanent() {
        let store = SqliteHistoryStore::new_in_memory().await.unwrap();
        let err = store.append("ghost", completed("a")).await.unwrap_err();
        assert!(!err.is_retryable(), "{err}");
    }

    #[tokio::test]
    async fn undecodable_payload_is_corruption() {
        let store = SqliteHistoryStore::new_in_memory().await.unwrap();
        store.create_instance(&InstanceRecord::new("i1", "{}")).await.unwrap();
        sqlx::query(
            "INSERT INTO history (instance_id, sequence_number, kind, payload, timestamp) VALUES ('i1', 1, 'X', 'not json', 0)",
        )
        .execute(store.get_pool())
        .await
        .unwrap();
        assert!(store.read("i1").await.unwrap_err().is_corruption());
    }

    #[tokio::test]
    async fn status_and_error_persist() {
        let store = SqliteHistoryStore::new_in_memory().await.unwrap();
        store.create_instance(&InstanceRecord::new("i1", "{\"name\":\"x\"}")).await.unwrap();
        let err = ErrorDetails::PermanentActivity {
            message: "boom".to_string(),
        };
        store
            .update_status("i1", InstanceStatus::Failed, None, Some(err.clone()))
            .await
            .unwrap();
        let rec = store.read_instance("i1").await.unwrap().unwrap();
        assert_eq!(rec.status, InstanceStatus::Failed);
        assert_eq!(rec.error, Some(err));
        assert_eq!(rec.input, "{\"name\":\"x\"}");
        assert_eq!(
            store.list_instances_by_status(InstanceStatus::Failed).await.unwrap(),
            vec!["i1".to_string()]
        );
    }
}
