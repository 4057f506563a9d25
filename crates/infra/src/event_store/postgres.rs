//! Postgres-backed event store.
//!
//! ## Error mapping
//!
//! | sqlx error | Postgres code | `EventStoreError` | When |
//! |---|---|---|---|
//! | Database (unique violation) | `23505` | `Concurrency` | another writer inserted the same `(aggregate_id, sequence_number)` |
//! | Database (check violation) | `23514` | `InvalidAppend` | e.g. `sequence_number <= 0` |
//! | Database (other) | any | `Storage` | |
//! | PoolClosed / Io / other | n/a | `Storage` | connection failures |
//!
//! ## Sync bridge
//!
//! `EventStore` is synchronous. The trait impl runs the async queries with
//! `tokio::task::block_in_place` + `Handle::block_on`, which requires a
//! multi-threaded tokio runtime on the calling thread.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::{Span, instrument};

use stockflow_core::{AggregateId, ExpectedVersion};

use super::query::EventFilter;
use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent, validate_batch};

/// Schema of the `events` table. Applied by [`PostgresEventStore::migrate`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id        UUID PRIMARY KEY,
    aggregate_id    UUID NOT NULL,
    aggregate_type  TEXT NOT NULL,
    sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
    event_type      TEXT NOT NULL,
    event_version   INTEGER NOT NULL,
    occurred_at     TIMESTAMPTZ NOT NULL,
    payload         JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (aggregate_id, sequence_number)
);
CREATE INDEX IF NOT EXISTS events_type_time_idx ON events (event_type, occurred_at);
CREATE INDEX IF NOT EXISTS events_aggregate_type_idx ON events (aggregate_type, occurred_at);
"#;

/// Postgres-backed append-only event store.
///
/// `append()` runs in one transaction: read `MAX(sequence_number)`, check the
/// expected version, insert. If another transaction commits in between, the
/// unique `(aggregate_id, sequence_number)` constraint fails the insert and
/// the caller sees a concurrency error.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Create the `events` table and indexes if missing.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Load one stream in sequence order. Unknown streams are empty.
    #[instrument(
        skip(self),
        fields(aggregate_id = %aggregate_id, loaded_events = tracing::field::Empty),
        err
    )]
    pub async fn load_stream_async(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, aggregate_id, aggregate_type, sequence_number,
                   event_type, event_version, occurred_at, payload
            FROM events
            WHERE aggregate_id = $1
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        let events = decode_rows(&rows)?;
        Span::current().record("loaded_events", events.len());
        Ok(events)
    }

    /// Filtered scan across streams, ordered like the in-memory store.
    #[instrument(skip(self), err)]
    pub async fn load_events_async(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, aggregate_id, aggregate_type, sequence_number,
                   event_type, event_version, occurred_at, payload
            FROM events
            WHERE ($1::uuid IS NULL OR aggregate_id = $1)
              AND ($2::text IS NULL OR aggregate_type = $2)
              AND ($3::text IS NULL OR event_type = $3)
              AND ($4::timestamptz IS NULL OR occurred_at >= $4)
              AND ($5::timestamptz IS NULL OR occurred_at < $5)
            ORDER BY occurred_at ASC, aggregate_id ASC, sequence_number ASC
            "#,
        )
        .bind(filter.aggregate_id.map(|id| *id.as_uuid()))
        .bind(filter.aggregate_type.as_deref())
        .bind(filter.event_type.as_deref())
        .bind(filter.occurred_after)
        .bind(filter.occurred_before)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_events", e))?;

        decode_rows(&rows)
    }

    /// Append a batch to one stream under optimistic concurrency.
    #[instrument(
        skip(self, events),
        fields(batch_size = events.len(), committed_events = tracing::field::Empty),
        err
    )]
    pub async fn append_async(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        let (aggregate_id, aggregate_type) = validate_batch(&events)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let (current_version, existing_type) = check_stream_version(&mut tx, aggregate_id).await?;

        if let Some(existing) = existing_type {
            if existing != aggregate_type {
                rollback(tx).await?;
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{existing}', attempted append with '{aggregate_type}'"
                )));
            }
        }

        if !expected_version.matches(current_version) {
            rollback(tx).await?;
            return Err(EventStoreError::Concurrency(format!(
                "stream {aggregate_id}: expected {expected_version:?}, found {current_version}"
            )));
        }

        let mut committed = Vec::with_capacity(events.len());
        let mut next_sequence = current_version + 1;

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO events (
                    event_id, aggregate_id, aggregate_type, sequence_number,
                    event_type, event_version, occurred_at, payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(event.event_id)
            .bind(aggregate_id.as_uuid())
            .bind(&aggregate_type)
            .bind(next_sequence as i64)
            .bind(&event.event_type)
            .bind(event.event_version as i32)
            .bind(event.occurred_at)
            .bind(&event.payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EventStoreError::Concurrency(format!(
                        "concurrent append detected: sequence_number {next_sequence} already exists"
                    ))
                } else {
                    map_sqlx_error("insert_event", e)
                }
            })?;

            committed.push(StoredEvent {
                event_id: event.event_id,
                aggregate_id,
                aggregate_type: event.aggregate_type,
                sequence_number: next_sequence,
                event_type: event.event_type,
                event_version: event.event_version,
                occurred_at: event.occurred_at,
                payload: event.payload,
            });
            next_sequence += 1;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("committed_events", committed.len());
        Ok(committed)
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T, EventStoreError>
    where
        F: std::future::Future<Output = Result<T, EventStoreError>>,
    {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            EventStoreError::Storage("PostgresEventStore must be called from within a tokio runtime".to_string())
        })?;
        tokio::task::block_in_place(|| handle.block_on(fut))
    }
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.block_on(self.append_async(events, expected_version))
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.block_on(self.load_stream_async(aggregate_id))
    }

    fn load_events(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.block_on(self.load_events_async(filter))
    }
}

async fn rollback(tx: Transaction<'_, Postgres>) -> Result<(), EventStoreError> {
    tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
}

/// Current version and aggregate type of a stream (`0`/`None` if it doesn't exist).
async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_id: AggregateId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(MAX(sequence_number), 0) AS current_version,
            MAX(aggregate_type) AS aggregate_type
        FROM events
        WHERE aggregate_id = $1
        "#,
    )
    .bind(aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current_version: i64 = row
        .try_get("current_version")
        .map_err(|e| map_sqlx_error("read_current_version", e))?;
    let aggregate_type: Option<String> = row
        .try_get("aggregate_type")
        .map_err(|e| map_sqlx_error("read_aggregate_type", e))?;

    Ok((current_version.max(0) as u64, aggregate_type))
}

fn decode_rows(rows: &[sqlx::postgres::PgRow]) -> Result<Vec<StoredEvent>, EventStoreError> {
    rows.iter()
        .map(|row| {
            StoredEventRow::from_row(row)
                .map(StoredEvent::from)
                .map_err(|e| EventStoreError::Storage(format!("failed to decode event row: {e}")))
        })
        .collect()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => EventStoreError::Storage(format!("connection pool closed in {operation}")),
        other => EventStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

#[derive(Debug)]
struct StoredEventRow {
    event_id: uuid::Uuid,
    aggregate_id: uuid::Uuid,
    aggregate_type: String,
    sequence_number: i64,
    event_type: String,
    event_version: i32,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for StoredEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            event_id: row.try_get("event_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            sequence_number: row.try_get("sequence_number")?,
            event_type: row.try_get("event_type")?,
            event_version: row.try_get("event_version")?,
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl From<StoredEventRow> for StoredEvent {
    fn from(row: StoredEventRow) -> Self {
        StoredEvent {
            event_id: row.event_id,
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            aggregate_type: row.aggregate_type,
            sequence_number: row.sequence_number as u64,
            event_type: row.event_type,
            event_version: row.event_version as u32,
            occurred_at: row.occurred_at,
            payload: row.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    /// Live-database tests run only when this points at a disposable Postgres.
    const DATABASE_URL_VAR: &str = "STOCKFLOW_TEST_DATABASE_URL";

    fn opened(aggregate_id: AggregateId) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            aggregate_id,
            aggregate_type: "inventory.record".to_string(),
            event_type: "inventory.record.opened".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: json!({ "location": "A-01" }),
        }
    }

    #[test]
    fn non_database_errors_map_to_storage() {
        assert!(matches!(
            map_sqlx_error("load_stream", sqlx::Error::PoolClosed),
            EventStoreError::Storage(msg) if msg.contains("load_stream")
        ));
        assert!(matches!(
            map_sqlx_error("insert_event", sqlx::Error::RowNotFound),
            EventStoreError::Storage(_)
        ));
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn stale_appends_are_rejected_by_a_live_database() {
        let Ok(url) = std::env::var(DATABASE_URL_VAR) else {
            return;
        };
        let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap();

        rt.block_on(async {
            let store = PostgresEventStore::new(PgPool::connect(&url).await.unwrap());
            store.migrate().await.unwrap();

            let id = AggregateId::new();
            let first = store.append_async(vec![opened(id)], ExpectedVersion::Exact(0)).await.unwrap();
            assert_eq!(first[0].sequence_number, 1);

            let stale = store.append_async(vec![opened(id)], ExpectedVersion::Exact(0)).await;
            assert!(matches!(stale, Err(EventStoreError::Concurrency(_))));

            let stream = store.load_stream_async(id).await.unwrap();
            assert_eq!(stream.len(), 1);
            assert_eq!(stream[0].payload, json!({ "location": "A-01" }));
        });
    }
}
