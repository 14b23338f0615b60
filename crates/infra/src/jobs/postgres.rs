//! Postgres-backed job store.
//!
//! Each [`PostgresSession`] owns a single-connection pool and a current-thread
//! Tokio runtime, so a worker thread can drive it synchronously without sharing
//! a connection with any other worker. Statements run inside a session
//! transaction that is opened lazily and closed by `commit`/`rollback`.
//!
//! ## Atomic operations
//!
//! - `claim_next` is a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED)`,
//!   so concurrent pollers never claim the same entry.
//! - `enqueue` flips the record with a conditional `UPDATE` (which row-locks it)
//!   and inserts with `ON CONFLICT DO NOTHING` against the partial unique index
//!   `queue_entries_one_live_per_record`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database | `40001`, `40P01` | `SessionConflict` | Serialization failure or deadlock |
//! | Database | `25P02` | `SessionConflict` | Statement issued on an aborted transaction |
//! | Database | `08xxx`, `57P01` | `Connection` | Connection lost or server shutting down |
//! | Database | any other | `Storage` | Constraint violations and other database errors |
//! | PoolClosed / PoolTimedOut / Io / Tls / Protocol | N/A | `Connection` | Network or pool failure |
//! | ColumnDecode / Decode / ColumnNotFound | N/A | `Serialization` | Row does not match the schema |
//! | Other | N/A | `Storage` | Anything else |

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnection, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Runtime;
use tracing::instrument;

use mailledger_core::{JobRecordId, QueueEntryId, WorkerId};

use super::store::{EnqueueOutcome, JobStore, QueueStats, SessionFactory, StoreError};
use super::types::{offset, JobFamily, JobRecord, QueueEntry, QueueStatus, RunHistory, JOB_RECORD_KEY};

/// Schema for `job_records` and `queue_entries`.
pub const SCHEMA: &str = include_str!("../../migrations/0001_job_queue.sql");

const RECORD_COLUMNS: &str = "id, family, status, worker_id, started_at, completed_at, timeout_at, \
     next_run_at, sync_interval_secs, total_runs, consecutive_errors, error_message, run_history, \
     last_run_at, last_run_duration_secs, emails_found_last_run, emails_processed_last_run, \
     total_emails_processed, summary, extracted_data, transaction_id, confidence_score, rules_used, \
     payload, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, queue_name, job_type, payload, status, worker_id, priority, \
     attempts, max_attempts, created_at, scheduled_at, started_at, completed_at, expires_at, \
     result_data, error_message";

/// Opens a fresh [`PostgresSession`] per worker.
#[derive(Debug, Clone)]
pub struct PostgresSessionFactory {
    database_url: String,
    connect_timeout: Duration,
}

impl PostgresSessionFactory {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Create the job tables and indexes if they do not exist.
    pub fn apply_schema(&self) -> Result<(), StoreError> {
        let mut session = PostgresSession::connect(&self.database_url, self.connect_timeout)?;
        session.apply_schema()?;
        session.close()
    }
}

impl SessionFactory for PostgresSessionFactory {
    fn open(&self) -> Result<Box<dyn JobStore>, StoreError> {
        let session = PostgresSession::connect(&self.database_url, self.connect_timeout)?;
        Ok(Box::new(session))
    }
}

/// A worker's private Postgres session.
pub struct PostgresSession {
    runtime: Runtime,
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
    closed: bool,
}

impl std::fmt::Debug for PostgresSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresSession")
            .field("in_transaction", &self.tx.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

impl PostgresSession {
    /// Connect a new session with its own connection.
    #[instrument(level = "debug", skip(database_url), err)]
    pub fn connect(database_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StoreError::Connection(format!("failed to build session runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(1)
                    .acquire_timeout(timeout)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self {
            runtime,
            pool,
            tx: None,
            closed: false,
        })
    }

    fn apply_schema(&mut self) -> Result<(), StoreError> {
        let (runtime, conn) = self.transaction()?;
        runtime
            .block_on(sqlx::raw_sql(SCHEMA).execute(conn))
            .map_err(|e| map_sqlx_error("apply_schema", e))?;
        self.commit()
    }

    /// The session runtime and the connection of the open transaction,
    /// beginning one if needed.
    fn transaction(&mut self) -> Result<(&Runtime, &mut PgConnection), StoreError> {
        if self.closed {
            return Err(StoreError::Connection("session closed".to_string()));
        }
        if self.tx.is_none() {
            let tx = self
                .runtime
                .block_on(self.pool.begin())
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;
            self.tx = Some(tx);
        }
        match self.tx.as_mut() {
            Some(tx) => Ok((&self.runtime, &mut **tx)),
            None => Err(StoreError::Connection("transaction unavailable".to_string())),
        }
    }

    fn fetch_records(
        &mut self,
        operation: &'static str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let (runtime, conn) = self.transaction()?;
        let rows = runtime
            .block_on(query.fetch_all(conn))
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter()
            .map(|row| {
                let row = JobRecordRow::from_row(row).map_err(|e| map_sqlx_error(operation, e))?;
                JobRecord::try_from(row)
            })
            .collect()
    }

    fn fetch_entries(
        &mut self,
        operation: &'static str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let (runtime, conn) = self.transaction()?;
        let rows = runtime
            .block_on(query.fetch_all(conn))
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter()
            .map(|row| {
                let row = QueueEntryRow::from_row(row).map_err(|e| map_sqlx_error(operation, e))?;
                QueueEntry::try_from(row)
            })
            .collect()
    }

    fn execute(
        &mut self,
        operation: &'static str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<u64, StoreError> {
        let (runtime, conn) = self.transaction()?;
        let done = runtime
            .block_on(query.execute(conn))
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(done.rows_affected())
    }
}

impl Drop for PostgresSession {
    fn drop(&mut self) {
        let _guard = self.runtime.enter();
        if let Some(tx) = self.tx.take() {
            let _ = self.runtime.block_on(tx.rollback());
        }
        if !self.closed {
            self.runtime.block_on(self.pool.close());
        }
    }
}

impl JobStore for PostgresSession {
    fn insert_record(&mut self, record: &JobRecord) -> Result<(), StoreError> {
        let params = RecordParams::try_from(record)?;
        let sql = format!(
            "INSERT INTO job_records ({RECORD_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, \
              $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26)"
        );
        self.execute("insert_record", params.bind(sqlx::query(&sql)))?;
        Ok(())
    }

    fn get_record(&mut self, id: JobRecordId) -> Result<Option<JobRecord>, StoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM job_records WHERE id = $1");
        let mut records = self.fetch_records("get_record", sqlx::query(&sql).bind(id.as_uuid()))?;
        Ok(records.pop())
    }

    fn update_record(&mut self, record: &JobRecord) -> Result<(), StoreError> {
        let params = RecordParams::try_from(record)?;
        let sql = r#"
            UPDATE job_records SET
                family = $2, status = $3, worker_id = $4, started_at = $5, completed_at = $6,
                timeout_at = $7, next_run_at = $8, sync_interval_secs = $9, total_runs = $10,
                consecutive_errors = $11, error_message = $12, run_history = $13,
                last_run_at = $14, last_run_duration_secs = $15, emails_found_last_run = $16,
                emails_processed_last_run = $17, total_emails_processed = $18, summary = $19,
                extracted_data = $20, transaction_id = $21, confidence_score = $22,
                rules_used = $23, payload = $24, created_at = $25, updated_at = $26
            WHERE id = $1
            "#;
        let updated = self.execute("update_record", params.bind(sqlx::query(sql)))?;
        if updated == 0 {
            return Err(StoreError::record_not_found(record.id));
        }
        Ok(())
    }

    fn list_eligible(
        &mut self,
        family: JobFamily,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM job_records \
             WHERE family = $1 AND status = ANY($2) \
               AND (NOT $3::boolean OR next_run_at IS NULL OR next_run_at <= $4) \
             ORDER BY created_at ASC, id ASC \
             LIMIT $5"
        );
        let query = sqlx::query(&sql)
            .bind(family.as_str())
            .bind(status_names(family))
            .bind(family.is_time_gated())
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX));
        self.fetch_records("list_eligible", query)
    }

    fn list_owned_running(
        &mut self,
        family: JobFamily,
        owner: WorkerId,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM job_records \
             WHERE family = $1 AND status = 'running' AND worker_id = $2"
        );
        let query = sqlx::query(&sql).bind(family.as_str()).bind(owner.as_uuid());
        self.fetch_records("list_owned_running", query)
    }

    fn list_orphaned_queued(&mut self, family: JobFamily) -> Result<Vec<JobRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM job_records r \
             WHERE r.family = $1 AND r.status = 'queued' \
               AND NOT EXISTS ( \
                   SELECT 1 FROM queue_entries q \
                   WHERE q.payload->>'{JOB_RECORD_KEY}' = r.id::text \
                     AND q.status IN ('pending', 'running'))"
        );
        self.fetch_records("list_orphaned_queued", sqlx::query(&sql).bind(family.as_str()))
    }

    fn get_entry(&mut self, id: QueueEntryId) -> Result<Option<QueueEntry>, StoreError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = $1");
        let mut entries = self.fetch_entries("get_entry", sqlx::query(&sql).bind(id.as_uuid()))?;
        Ok(entries.pop())
    }

    fn update_entry(&mut self, entry: &QueueEntry) -> Result<(), StoreError> {
        let params = EntryParams::from(entry);
        let sql = r#"
            UPDATE queue_entries SET
                queue_name = $2, job_type = $3, payload = $4, status = $5, worker_id = $6,
                priority = $7, attempts = $8, max_attempts = $9, created_at = $10,
                scheduled_at = $11, started_at = $12, completed_at = $13, expires_at = $14,
                result_data = $15, error_message = $16
            WHERE id = $1
            "#;
        let updated = self.execute("update_entry", params.bind(sqlx::query(sql)))?;
        if updated == 0 {
            return Err(StoreError::entry_not_found(entry.id));
        }
        Ok(())
    }

    fn list_owned_entries(
        &mut self,
        queue_name: &str,
        owner: WorkerId,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM queue_entries \
             WHERE queue_name = $1 AND status = 'running' AND worker_id = $2"
        );
        let query = sqlx::query(&sql).bind(queue_name).bind(owner.as_uuid());
        self.fetch_entries("list_owned_entries", query)
    }

    #[instrument(level = "debug", skip(self, record, entry), fields(job_id = %record.id), err)]
    fn enqueue(
        &mut self,
        record: &JobRecord,
        entry: &QueueEntry,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, StoreError> {
        let params = EntryParams::from(entry);
        let record_key = record.id.to_string();
        let insert = format!(
            "INSERT INTO queue_entries ({ENTRY_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
             ON CONFLICT ((payload->>'{JOB_RECORD_KEY}')) WHERE status IN ('pending', 'running') \
             DO NOTHING"
        );
        let live_check = format!(
            "SELECT 1 FROM queue_entries \
             WHERE payload->>'{JOB_RECORD_KEY}' = $1 AND status IN ('pending', 'running') \
             LIMIT 1"
        );

        let (runtime, conn) = self.transaction()?;
        runtime
            .block_on(async {
                let live: Option<i32> = sqlx::query_scalar(&live_check)
                    .bind(&record_key)
                    .fetch_optional(&mut *conn)
                    .await?;
                if live.is_some() {
                    return Ok(EnqueueOutcome::AlreadyQueued);
                }

                let flipped = sqlx::query(
                    r#"
                    UPDATE job_records
                    SET status = 'queued', updated_at = $2
                    WHERE id = $1
                      AND status = ANY($3)
                      AND (NOT $4::boolean OR next_run_at IS NULL OR next_run_at <= $2)
                    "#,
                )
                .bind(record.id.as_uuid())
                .bind(now)
                .bind(status_names(record.family))
                .bind(record.family.is_time_gated())
                .execute(&mut *conn)
                .await?;
                if flipped.rows_affected() == 0 {
                    return Ok(EnqueueOutcome::NotEligible);
                }

                let inserted = params.bind(sqlx::query(&insert)).execute(&mut *conn).await?;
                if inserted.rows_affected() == 0 {
                    return Ok(EnqueueOutcome::AlreadyQueued);
                }
                Ok::<_, sqlx::Error>(EnqueueOutcome::Enqueued)
            })
            .map_err(|e| map_sqlx_error("enqueue", e))
    }

    #[instrument(level = "debug", skip(self), fields(worker_id = %worker), err)]
    fn claim_next(
        &mut self,
        queue_name: &str,
        worker: WorkerId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<QueueEntry>, StoreError> {
        let sql = format!(
            "UPDATE queue_entries \
             SET status = 'running', worker_id = $2, started_at = $3, \
                 attempts = attempts + 1, expires_at = $4 \
             WHERE id = ( \
                 SELECT id FROM queue_entries \
                 WHERE queue_name = $1 AND status = 'pending' AND scheduled_at <= $3 \
                 ORDER BY priority DESC, created_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING {ENTRY_COLUMNS}"
        );
        let query = sqlx::query(&sql)
            .bind(queue_name)
            .bind(worker.as_uuid())
            .bind(now)
            .bind(offset(now, lease));
        let mut claimed = self.fetch_entries("claim_next", query)?;
        Ok(claimed.pop())
    }

    fn queue_stats(&mut self, queue_name: &str) -> Result<QueueStats, StoreError> {
        let (runtime, conn) = self.transaction()?;
        let rows = runtime
            .block_on(
                sqlx::query(
                    r#"
                    SELECT status, COUNT(*) AS total
                    FROM queue_entries
                    WHERE queue_name = $1
                    GROUP BY status
                    "#,
                )
                .bind(queue_name)
                .fetch_all(conn),
            )
            .map_err(|e| map_sqlx_error("queue_stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("queue_stats", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("queue_stats", e))?;
            let total = usize::try_from(total).unwrap_or(0);
            let status: QueueStatus = status.parse()?;
            match status {
                QueueStatus::Pending => stats.pending += total,
                QueueStatus::Running => stats.running += total,
                QueueStatus::Completed => stats.completed += total,
                QueueStatus::Failed => stats.failed += total,
                QueueStatus::Expired => stats.expired += total,
            }
        }
        Ok(stats)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            self.runtime
                .block_on(tx.commit())
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            self.runtime
                .block_on(tx.rollback())
                .map_err(|e| map_sqlx_error("rollback", e))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        let rolled_back = self.rollback();
        self.runtime.block_on(self.pool.close());
        self.closed = true;
        rolled_back
    }
}

fn status_names(family: JobFamily) -> Vec<String> {
    family
        .eligible_statuses()
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                // serialization_failure, deadlock_detected, in_failed_sql_transaction
                Some("40001") | Some("40P01") | Some("25P02") => StoreError::SessionConflict(msg),
                // admin_shutdown
                Some("57P01") => StoreError::Connection(msg),
                Some(code) if code.starts_with("08") => StoreError::Connection(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            StoreError::Connection(format!("connection pool unavailable in {}", operation))
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
            StoreError::Connection(format!("connection error in {}: {}", operation, err))
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Serialization(format!("failed to decode row in {}: {}", operation, err))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// Bind parameter sets, in column order.

struct RecordParams {
    id: uuid::Uuid,
    family: &'static str,
    status: &'static str,
    worker_id: Option<uuid::Uuid>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    timeout_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    sync_interval_secs: Option<i64>,
    total_runs: i64,
    consecutive_errors: i32,
    error_message: Option<String>,
    run_history: serde_json::Value,
    last_run_at: Option<DateTime<Utc>>,
    last_run_duration_secs: Option<f64>,
    emails_found_last_run: i32,
    emails_processed_last_run: i32,
    total_emails_processed: i64,
    summary: Option<&'static str>,
    extracted_data: Option<serde_json::Value>,
    transaction_id: Option<String>,
    confidence_score: Option<f64>,
    rules_used: Vec<String>,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<&JobRecord> for RecordParams {
    type Error = StoreError;

    fn try_from(record: &JobRecord) -> Result<Self, Self::Error> {
        let run_history = serde_json::to_value(&record.run_history)
            .map_err(|e| StoreError::Serialization(format!("run_history: {e}")))?;
        Ok(Self {
            id: *record.id.as_uuid(),
            family: record.family.as_str(),
            status: record.status.as_str(),
            worker_id: record.worker_id.map(uuid::Uuid::from),
            started_at: record.started_at,
            completed_at: record.completed_at,
            timeout_at: record.timeout_at,
            next_run_at: record.next_run_at,
            sync_interval_secs: record.sync_interval.map(|d| to_i64(d.as_secs())),
            total_runs: to_i64(record.total_runs),
            consecutive_errors: to_i32(record.consecutive_errors),
            error_message: record.error_message.clone(),
            run_history,
            last_run_at: record.last_run_at,
            last_run_duration_secs: record.last_run_duration_secs,
            emails_found_last_run: to_i32(record.emails_found_last_run),
            emails_processed_last_run: to_i32(record.emails_processed_last_run),
            total_emails_processed: to_i64(record.total_emails_processed),
            summary: record.summary.map(|s| s.as_str()),
            extracted_data: record.extracted_data.clone(),
            transaction_id: record.transaction_id.clone(),
            confidence_score: record.confidence_score,
            rules_used: record.rules_used.clone(),
            payload: record.payload.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

impl RecordParams {
    fn bind<'q>(&'q self, query: Query<'q, Postgres, PgArguments>) -> Query<'q, Postgres, PgArguments> {
        query
            .bind(self.id)
            .bind(self.family)
            .bind(self.status)
            .bind(self.worker_id)
            .bind(self.started_at)
            .bind(self.completed_at)
            .bind(self.timeout_at)
            .bind(self.next_run_at)
            .bind(self.sync_interval_secs)
            .bind(self.total_runs)
            .bind(self.consecutive_errors)
            .bind(&self.error_message)
            .bind(&self.run_history)
            .bind(self.last_run_at)
            .bind(self.last_run_duration_secs)
            .bind(self.emails_found_last_run)
            .bind(self.emails_processed_last_run)
            .bind(self.total_emails_processed)
            .bind(self.summary)
            .bind(&self.extracted_data)
            .bind(&self.transaction_id)
            .bind(self.confidence_score)
            .bind(&self.rules_used)
            .bind(&self.payload)
            .bind(self.created_at)
            .bind(self.updated_at)
    }
}

struct EntryParams<'a> {
    entry: &'a QueueEntry,
    worker_id: Option<uuid::Uuid>,
}

impl<'a> From<&'a QueueEntry> for EntryParams<'a> {
    fn from(entry: &'a QueueEntry) -> Self {
        Self {
            entry,
            worker_id: entry.worker_id.map(uuid::Uuid::from),
        }
    }
}

impl<'a> EntryParams<'a> {
    fn bind<'q>(&'q self, query: Query<'q, Postgres, PgArguments>) -> Query<'q, Postgres, PgArguments> {
        let e = self.entry;
        query
            .bind(e.id.as_uuid())
            .bind(&e.queue_name)
            .bind(&e.job_type)
            .bind(&e.payload)
            .bind(e.status.as_str())
            .bind(self.worker_id)
            .bind(e.priority)
            .bind(to_i32(e.attempts))
            .bind(to_i32(e.max_attempts))
            .bind(e.created_at)
            .bind(e.scheduled_at)
            .bind(e.started_at)
            .bind(e.completed_at)
            .bind(e.expires_at)
            .bind(&e.result_data)
            .bind(&e.error_message)
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRecordRow {
    id: uuid::Uuid,
    family: String,
    status: String,
    worker_id: Option<uuid::Uuid>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    timeout_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    sync_interval_secs: Option<i64>,
    total_runs: i64,
    consecutive_errors: i32,
    error_message: Option<String>,
    run_history: serde_json::Value,
    last_run_at: Option<DateTime<Utc>>,
    last_run_duration_secs: Option<f64>,
    emails_found_last_run: i32,
    emails_processed_last_run: i32,
    total_emails_processed: i64,
    summary: Option<String>,
    extracted_data: Option<serde_json::Value>,
    transaction_id: Option<String>,
    confidence_score: Option<f64>,
    rules_used: Vec<String>,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRecordRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRecordRow {
            id: row.try_get("id")?,
            family: row.try_get("family")?,
            status: row.try_get("status")?,
            worker_id: row.try_get("worker_id")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            timeout_at: row.try_get("timeout_at")?,
            next_run_at: row.try_get("next_run_at")?,
            sync_interval_secs: row.try_get("sync_interval_secs")?,
            total_runs: row.try_get("total_runs")?,
            consecutive_errors: row.try_get("consecutive_errors")?,
            error_message: row.try_get("error_message")?,
            run_history: row.try_get("run_history")?,
            last_run_at: row.try_get("last_run_at")?,
            last_run_duration_secs: row.try_get("last_run_duration_secs")?,
            emails_found_last_run: row.try_get("emails_found_last_run")?,
            emails_processed_last_run: row.try_get("emails_processed_last_run")?,
            total_emails_processed: row.try_get("total_emails_processed")?,
            summary: row.try_get("summary")?,
            extracted_data: row.try_get("extracted_data")?,
            transaction_id: row.try_get("transaction_id")?,
            confidence_score: row.try_get("confidence_score")?,
            rules_used: row.try_get("rules_used")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRecordRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRecordRow) -> Result<Self, Self::Error> {
        let run_history: RunHistory = serde_json::from_value(row.run_history)
            .map_err(|e| StoreError::Serialization(format!("run_history: {e}")))?;
        Ok(JobRecord {
            id: JobRecordId::from_uuid(row.id),
            family: row.family.parse()?,
            status: row.status.parse()?,
            worker_id: row.worker_id.map(WorkerId::from_uuid),
            started_at: row.started_at,
            completed_at: row.completed_at,
            timeout_at: row.timeout_at,
            next_run_at: row.next_run_at,
            sync_interval: row
                .sync_interval_secs
                .map(|secs| Duration::from_secs(secs.max(0) as u64)),
            total_runs: row.total_runs.max(0) as u64,
            consecutive_errors: row.consecutive_errors.max(0) as u32,
            error_message: row.error_message,
            run_history,
            last_run_at: row.last_run_at,
            last_run_duration_secs: row.last_run_duration_secs,
            emails_found_last_run: row.emails_found_last_run.max(0) as u32,
            emails_processed_last_run: row.emails_processed_last_run.max(0) as u32,
            total_emails_processed: row.total_emails_processed.max(0) as u64,
            summary: row.summary.as_deref().map(str::parse).transpose()?,
            extracted_data: row.extracted_data,
            transaction_id: row.transaction_id,
            confidence_score: row.confidence_score,
            rules_used: row.rules_used,
            payload: row.payload,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct QueueEntryRow {
    id: uuid::Uuid,
    queue_name: String,
    job_type: String,
    payload: serde_json::Value,
    status: String,
    worker_id: Option<uuid::Uuid>,
    priority: i32,
    attempts: i32,
    max_attempts: i32,
    created_at: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    result_data: Option<serde_json::Value>,
    error_message: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for QueueEntryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(QueueEntryRow {
            id: row.try_get("id")?,
            queue_name: row.try_get("queue_name")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            worker_id: row.try_get("worker_id")?,
            priority: row.try_get("priority")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            created_at: row.try_get("created_at")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            expires_at: row.try_get("expires_at")?,
            result_data: row.try_get("result_data")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

impl TryFrom<QueueEntryRow> for QueueEntry {
    type Error = StoreError;

    fn try_from(row: QueueEntryRow) -> Result<Self, Self::Error> {
        Ok(QueueEntry {
            id: QueueEntryId::from_uuid(row.id),
            queue_name: row.queue_name,
            job_type: row.job_type,
            payload: row.payload,
            status: row.status.parse()?,
            worker_id: row.worker_id.map(WorkerId::from_uuid),
            priority: row.priority,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            created_at: row.created_at,
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            expires_at: row.expires_at,
            result_data: row.result_data,
            error_message: row.error_message,
        })
    }
}
