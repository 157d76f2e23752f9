use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use labelsquor_core::{
    DeadLetterEntry, Event, EventType, LastError, Metric, MetricKind, QuotaCounter,
    QuotaDimension, QuotaLimit, QuotaUsageEntry, QuotaWindow, Stage, Transition, WorkItem,
    WorkState, is_legal_transition,
};
use labelsquor_store::{
    ClaimCandidate, FieldUpdate, ItemFilter, StoreError, TransitionOutcome, TransitionRequest,
    WorkItemStore,
};

use crate::config::PostgresConfig;
use crate::migrations;

/// Build `PgConnectOptions` from a [`PostgresConfig`], applying SSL settings
/// when configured.
pub(crate) fn build_connect_options(
    config: &PostgresConfig,
) -> Result<sqlx::postgres::PgConnectOptions, StoreError> {
    let mut options: sqlx::postgres::PgConnectOptions = config
        .url
        .parse()
        .map_err(|e: sqlx::Error| StoreError::Connection(e.to_string()))?;

    if let Some(ref mode) = config.ssl_mode {
        let ssl_mode = match mode.as_str() {
            "disable" => sqlx::postgres::PgSslMode::Disable,
            "prefer" => sqlx::postgres::PgSslMode::Prefer,
            "require" => sqlx::postgres::PgSslMode::Require,
            "verify-ca" => sqlx::postgres::PgSslMode::VerifyCa,
            "verify-full" => sqlx::postgres::PgSslMode::VerifyFull,
            other => {
                return Err(StoreError::Connection(format!("unknown ssl_mode: {other}")));
            }
        };
        options = options.ssl_mode(ssl_mode);
    }

    if let Some(ref path) = config.ssl_root_cert {
        options = options.ssl_root_cert(path);
    }

    if let Some(ref path) = config.ssl_cert {
        options = options.ssl_client_cert(path);
    }

    if let Some(ref path) = config.ssl_key {
        options = options.ssl_client_key(path);
    }

    Ok(options)
}

fn backend_err(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(e.to_string())
        }
        other => StoreError::Backend(other.to_string()),
    }
}

fn parse_state(s: &str) -> Result<WorkState, StoreError> {
    WorkState::parse(s).ok_or_else(|| StoreError::Serialization(format!("unknown state: {s}")))
}

fn parse_stage(s: &str) -> Result<Stage, StoreError> {
    Stage::parse(s).ok_or_else(|| StoreError::Serialization(format!("unknown stage: {s}")))
}

#[allow(clippy::cast_sign_loss)]
fn item_from_row(row: &PgRow) -> Result<WorkItem, StoreError> {
    let state: String = row.try_get("state").map_err(backend_err)?;
    let stage: String = row.try_get("stage").map_err(backend_err)?;
    let partial: serde_json::Value = row.try_get("partial_results").map_err(backend_err)?;
    let last_error: Option<serde_json::Value> = row.try_get("last_error").map_err(backend_err)?;

    let partial_results = serde_json::from_value(partial)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let last_error: Option<LastError> = match last_error {
        Some(value) => Some(
            serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))?,
        ),
        None => None,
    };

    let version: i64 = row.try_get("version").map_err(backend_err)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(backend_err)?;
    let quota_exceeded_count: i32 = row.try_get("quota_exceeded_count").map_err(backend_err)?;

    Ok(WorkItem {
        id: row.try_get("id").map_err(backend_err)?,
        priority: row.try_get("priority").map_err(backend_err)?,
        state: parse_state(&state)?,
        stage: parse_stage(&stage)?,
        attempt_count: attempt_count as u32,
        quota_exceeded_count: quota_exceeded_count as u32,
        enqueued_at: row.try_get("enqueued_at").map_err(backend_err)?,
        started_at: row.try_get("started_at").map_err(backend_err)?,
        completed_at: row.try_get("completed_at").map_err(backend_err)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(backend_err)?,
        lock_holder: row.try_get("lock_holder").map_err(backend_err)?,
        lock_acquired_at: row.try_get("lock_acquired_at").map_err(backend_err)?,
        lock_expires_at: row.try_get("lock_expires_at").map_err(backend_err)?,
        version: version as u64,
        payload: row.try_get("payload").map_err(backend_err)?,
        partial_results,
        last_error,
        cancel_requested: row.try_get("cancel_requested").map_err(backend_err)?,
        metadata: row.try_get("metadata").map_err(backend_err)?,
    })
}

fn transition_from_row(row: &PgRow) -> Result<Transition, StoreError> {
    let from_state: String = row.try_get("from_state").map_err(backend_err)?;
    let to_state: String = row.try_get("to_state").map_err(backend_err)?;
    let stage: String = row.try_get("stage").map_err(backend_err)?;
    Ok(Transition {
        id: row.try_get("id").map_err(backend_err)?,
        work_item_id: row.try_get("work_item_id").map_err(backend_err)?,
        from_state: parse_state(&from_state)?,
        to_state: parse_state(&to_state)?,
        stage: parse_stage(&stage)?,
        reason: row.try_get("reason").map_err(backend_err)?,
        metadata: row.try_get("metadata").map_err(backend_err)?,
        actor: row.try_get("actor").map_err(backend_err)?,
        at: row.try_get("at").map_err(backend_err)?,
    })
}

#[allow(clippy::cast_sign_loss)]
fn event_from_row(row: &PgRow) -> Result<Event, StoreError> {
    let event_type: String = row.try_get("event_type").map_err(backend_err)?;
    let seq: i64 = row.try_get("seq").map_err(backend_err)?;
    Ok(Event {
        id: row.try_get("id").map_err(backend_err)?,
        seq: seq as u64,
        work_item_id: row.try_get("work_item_id").map_err(backend_err)?,
        event_type: EventType::parse(&event_type).ok_or_else(|| {
            StoreError::Serialization(format!("unknown event type: {event_type}"))
        })?,
        payload: row.try_get("payload").map_err(backend_err)?,
        at: row.try_get("at").map_err(backend_err)?,
        delivered: row.try_get("delivered").map_err(backend_err)?,
    })
}

/// `PostgreSQL`-backed implementation of [`WorkItemStore`].
///
/// Every state change is a single conditional `UPDATE` that tests `state`
/// and `version` and fails with a zero-row count on any mismatch; the audit
/// row and the outbox event are inserted in the same transaction so they
/// cannot diverge from the row they describe.
pub struct PostgresWorkItemStore {
    pool: PgPool,
    config: Arc<PostgresConfig>,
}

impl PostgresWorkItemStore {
    /// Create a new `PostgresWorkItemStore` from the provided configuration.
    ///
    /// Connects to `PostgreSQL`, creates the connection pool, and runs
    /// migrations to ensure the required tables exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if pool creation fails, or
    /// [`StoreError::Backend`] if migrations fail.
    pub async fn new(config: PostgresConfig) -> Result<Self, StoreError> {
        let connect_options = build_connect_options(&config)?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect_with(connect_options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        migrations::run_migrations(&pool, &config)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(Self {
            pool,
            config: Arc::new(config),
        })
    }

    /// Create a `PostgresWorkItemStore` from an existing pool and config.
    /// Runs migrations on creation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if migrations fail.
    pub async fn from_pool(pool: PgPool, config: PostgresConfig) -> Result<Self, StoreError> {
        migrations::run_migrations(&pool, &config)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(Self {
            pool,
            config: Arc::new(config),
        })
    }

    async fn fetch_optional(&self, id: &str) -> Result<Option<WorkItem>, StoreError> {
        let table = self.config.work_item_table();
        let query = format!("SELECT * FROM {table} WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(item_from_row).transpose()
    }
}

#[async_trait]
impl WorkItemStore for PostgresWorkItemStore {
    async fn insert(&self, item: &WorkItem) -> Result<(), StoreError> {
        let table = self.config.work_item_table();
        let query = format!(
            "INSERT INTO {table} (
                id, priority, state, stage, attempt_count, quota_exceeded_count,
                enqueued_at, started_at, completed_at, next_attempt_at,
                lock_holder, lock_acquired_at, lock_expires_at, version,
                payload, partial_results, last_error, cancel_requested, metadata
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19
            )"
        );

        let partial = serde_json::to_value(&item.partial_results)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let last_error = item
            .last_error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(&query)
            .bind(&item.id)
            .bind(item.priority)
            .bind(item.state.as_str())
            .bind(item.stage.as_str())
            .bind(i32::try_from(item.attempt_count).unwrap_or(i32::MAX))
            .bind(i32::try_from(item.quota_exceeded_count).unwrap_or(i32::MAX))
            .bind(item.enqueued_at)
            .bind(item.started_at)
            .bind(item.completed_at)
            .bind(item.next_attempt_at)
            .bind(&item.lock_holder)
            .bind(item.lock_acquired_at)
            .bind(item.lock_expires_at)
            .bind(i64::try_from(item.version).unwrap_or(i64::MAX))
            .bind(&item.payload)
            .bind(partial)
            .bind(last_error)
            .bind(item.cancel_requested)
            .bind(&item.metadata)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<WorkItem, StoreError> {
        self.fetch_optional(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))
    }

    async fn list(&self, filter: &ItemFilter) -> Result<Vec<WorkItem>, StoreError> {
        let table = self.config.work_item_table();
        let states: Vec<String> = filter
            .states
            .iter()
            .map(|s| s.as_str().to_owned())
            .collect();

        let query = format!(
            "SELECT * FROM {table} \
             WHERE (cardinality($1::text[]) = 0 OR state = ANY($1)) \
               AND ($2::text IS NULL OR stage = $2) \
               AND ($3::int IS NULL OR priority >= $3) \
               AND ($4::timestamptz IS NULL OR enqueued_at <= $4) \
             ORDER BY enqueued_at DESC, id ASC \
             LIMIT $5 OFFSET $6"
        );

        let rows = sqlx::query(&query)
            .bind(&states)
            .bind(filter.stage.map(Stage::as_str))
            .bind(filter.min_priority)
            .bind(filter.enqueued_before)
            .bind(i64::from(filter.effective_limit()))
            .bind(i64::from(filter.effective_offset()))
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        rows.iter().map(item_from_row).collect()
    }

    #[allow(clippy::cast_sign_loss)]
    async fn counts_by_state(&self) -> Result<HashMap<WorkState, u64>, StoreError> {
        let table = self.config.work_item_table();
        let query = format!("SELECT state, COUNT(*) AS n FROM {table} GROUP BY state");
        let rows: Vec<(String, i64)> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        let mut counts = HashMap::new();
        for (state, n) in rows {
            counts.insert(parse_state(&state)?, n as u64);
        }
        Ok(counts)
    }

    async fn transition(&self, req: TransitionRequest) -> Result<TransitionOutcome, StoreError> {
        if !is_legal_transition(req.from, req.to) {
            return Err(StoreError::IllegalTransition {
                from: req.from,
                to: req.to,
            });
        }

        let work_item = self.config.work_item_table();
        let transition = self.config.transition_table();
        let event = self.config.event_table();

        let (set_next, clear_next, next_at) = match req.changes.next_attempt_at {
            FieldUpdate::Keep => (false, false, None),
            FieldUpdate::Set(at) => (true, false, Some(at)),
            FieldUpdate::Clear => (false, true, None),
        };
        let (set_err, clear_err, last_error) = match &req.changes.last_error {
            FieldUpdate::Keep => (false, false, None),
            FieldUpdate::Set(err) => (
                true,
                false,
                Some(
                    serde_json::to_value(err)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                ),
            ),
            FieldUpdate::Clear => (false, true, None),
        };
        let (partial_key, partial_value) = match &req.changes.record_partial {
            Some((stage, summary)) => (Some(stage.as_str()), Some(summary.clone())),
            None => (None, None),
        };

        // The CTE captures the pre-update stage for the audit row; the
        // UPDATE re-tests state and version so a concurrent writer yields a
        // zero-row conflict instead of a lost update.
        let update = format!(
            "WITH prev AS (SELECT id, stage FROM {work_item} WHERE id = $1) \
             UPDATE {work_item} w SET \
                state = $4, \
                version = w.version + 1, \
                stage = COALESCE($5, w.stage), \
                partial_results = CASE WHEN $6::text IS NULL THEN w.partial_results \
                    ELSE w.partial_results || jsonb_build_object($6::text, $7::jsonb) END, \
                attempt_count = w.attempt_count + $8, \
                quota_exceeded_count = w.quota_exceeded_count + $9, \
                next_attempt_at = CASE WHEN $10 THEN $11::timestamptz \
                    WHEN $12 THEN NULL ELSE w.next_attempt_at END, \
                last_error = CASE WHEN $13 THEN $14::jsonb \
                    WHEN $15 THEN NULL ELSE w.last_error END, \
                lock_holder = CASE WHEN $16 THEN NULL ELSE w.lock_holder END, \
                lock_acquired_at = CASE WHEN $16 THEN NULL ELSE w.lock_acquired_at END, \
                lock_expires_at = CASE WHEN $16 THEN NULL ELSE w.lock_expires_at END, \
                started_at = CASE WHEN $4 = 'running' AND w.started_at IS NULL \
                    THEN NOW() ELSE w.started_at END, \
                completed_at = CASE WHEN $4 IN ('completed', 'cancelled', 'dead_lettered') \
                    THEN NOW() ELSE w.completed_at END \
             FROM prev \
             WHERE w.id = prev.id AND w.state = $2 AND w.version = $3 \
             RETURNING w.*, prev.stage AS stage_before"
        );

        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        let row = sqlx::query(&update)
            .bind(&req.item_id)
            .bind(req.from.as_str())
            .bind(i64::try_from(req.expected_version).unwrap_or(i64::MAX))
            .bind(req.to.as_str())
            .bind(req.changes.stage.map(Stage::as_str))
            .bind(partial_key)
            .bind(partial_value)
            .bind(i32::from(req.changes.increment_attempt))
            .bind(i32::from(req.changes.increment_quota_exceeded))
            .bind(set_next)
            .bind(next_at)
            .bind(clear_next)
            .bind(set_err)
            .bind(last_error)
            .bind(clear_err)
            .bind(req.changes.clear_lock)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend_err)?;

        let Some(row) = row else {
            // Nothing was written; surface the current row for the caller.
            drop(tx);
            return match self.fetch_optional(&req.item_id).await? {
                Some(current) => Ok(TransitionOutcome::Conflict(Box::new(current))),
                None => Err(StoreError::NotFound(req.item_id)),
            };
        };

        let item = item_from_row(&row)?;
        let stage_before: String = row.try_get("stage_before").map_err(backend_err)?;
        let stage_before = parse_stage(&stage_before)?;
        let now = Utc::now();

        let audit = Transition::new(
            &item.id,
            req.from,
            req.to,
            stage_before,
            &req.reason,
            req.metadata.clone(),
            &req.actor,
            now,
        );
        let insert_transition = format!(
            "INSERT INTO {transition} \
             (id, work_item_id, from_state, to_state, stage, reason, metadata, actor, at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        );
        sqlx::query(&insert_transition)
            .bind(&audit.id)
            .bind(&audit.work_item_id)
            .bind(audit.from_state.as_str())
            .bind(audit.to_state.as_str())
            .bind(audit.stage.as_str())
            .bind(&audit.reason)
            .bind(&audit.metadata)
            .bind(&audit.actor)
            .bind(audit.at)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;

        let payload = serde_json::json!({
            "from": req.from,
            "to": req.to,
            "stage": stage_before,
            "reason": req.reason,
            "actor": req.actor,
            "metadata": req.metadata,
        });
        let insert_event = format!(
            "INSERT INTO {event} (id, work_item_id, event_type, payload, at, delivered) \
             VALUES ($1, $2, $3, $4, $5, FALSE)"
        );
        sqlx::query(&insert_event)
            .bind(uuid::Uuid::now_v7().to_string())
            .bind(&item.id)
            .bind(EventType::StateChanged.as_str())
            .bind(&payload)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;

        tx.commit().await.map_err(backend_err)?;
        Ok(TransitionOutcome::Applied(Box::new(item)))
    }

    async fn acquire_lock(
        &self,
        item_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let table = self.config.work_item_table();
        let query = format!(
            "UPDATE {table} SET \
                lock_holder = $2, \
                lock_acquired_at = NOW(), \
                lock_expires_at = NOW() + make_interval(secs => $3) \
             WHERE id = $1 \
               AND (lock_holder IS NULL OR lock_expires_at IS NULL OR lock_expires_at <= NOW())"
        );
        let result = sqlx::query(&query)
            .bind(item_id)
            .bind(worker_id)
            .bind(lease.as_secs_f64())
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

        if result.rows_affected() > 0 {
            Ok(true)
        } else if self.fetch_optional(item_id).await?.is_some() {
            Ok(false)
        } else {
            Err(StoreError::NotFound(item_id.to_owned()))
        }
    }

    async fn extend_lock(
        &self,
        item_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let table = self.config.work_item_table();
        let query = format!(
            "UPDATE {table} SET lock_expires_at = NOW() + make_interval(secs => $3) \
             WHERE id = $1 AND lock_holder = $2 AND lock_expires_at > NOW()"
        );
        let result = sqlx::query(&query)
            .bind(item_id)
            .bind(worker_id)
            .bind(lease.as_secs_f64())
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

        if result.rows_affected() > 0 {
            Ok(true)
        } else if self.fetch_optional(item_id).await?.is_some() {
            Ok(false)
        } else {
            Err(StoreError::NotFound(item_id.to_owned()))
        }
    }

    async fn release_lock(&self, item_id: &str, worker_id: &str) -> Result<bool, StoreError> {
        let table = self.config.work_item_table();
        let query = format!(
            "UPDATE {table} SET \
                lock_holder = NULL, lock_acquired_at = NULL, lock_expires_at = NULL \
             WHERE id = $1 AND lock_holder = $2"
        );
        let result = sqlx::query(&query)
            .bind(item_id)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

        if result.rows_affected() > 0 {
            Ok(true)
        } else if self.fetch_optional(item_id).await?.is_some() {
            Ok(false)
        } else {
            Err(StoreError::NotFound(item_id.to_owned()))
        }
    }

    async fn claim_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimCandidate>, StoreError> {
        let table = self.config.work_item_table();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let ready = format!(
            "SELECT * FROM {table} \
             WHERE state = 'ready' \
               AND (next_attempt_at IS NULL OR next_attempt_at <= $1) \
               AND (lock_holder IS NULL OR lock_expires_at IS NULL OR lock_expires_at <= $1) \
             ORDER BY priority DESC, enqueued_at ASC \
             LIMIT $2"
        );
        let rows = sqlx::query(&ready)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        let mut candidates: Vec<ClaimCandidate> = rows
            .iter()
            .map(|row| {
                item_from_row(row).map(|item| ClaimCandidate {
                    item,
                    reclaim: false,
                })
            })
            .collect::<Result<_, _>>()?;

        let expired = format!(
            "SELECT * FROM {table} \
             WHERE state = 'running' AND lock_expires_at <= $1 \
             ORDER BY lock_expires_at ASC \
             LIMIT $2"
        );
        let rows = sqlx::query(&expired)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        for row in &rows {
            candidates.push(ClaimCandidate {
                item: item_from_row(row)?,
                reclaim: true,
            });
        }

        candidates.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(candidates)
    }

    async fn due_for_resume(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let table = self.config.work_item_table();
        let query = format!(
            "SELECT * FROM {table} \
             WHERE state IN ('retry_scheduled', 'quota_exceeded') \
               AND next_attempt_at IS NOT NULL AND next_attempt_at <= $1 \
             ORDER BY next_attempt_at ASC \
             LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(item_from_row).collect()
    }

    async fn request_cancel(&self, id: &str) -> Result<WorkItem, StoreError> {
        let table = self.config.work_item_table();
        let query =
            format!("UPDATE {table} SET cancel_requested = TRUE WHERE id = $1 RETURNING *");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        match row {
            Some(row) => item_from_row(&row),
            None => Err(StoreError::NotFound(id.to_owned())),
        }
    }

    async fn append_event(&self, event: Event) -> Result<(), StoreError> {
        let table = self.config.event_table();
        let query = format!(
            "INSERT INTO {table} (id, work_item_id, event_type, payload, at, delivered) \
             VALUES ($1, $2, $3, $4, $5, $6)"
        );
        sqlx::query(&query)
            .bind(&event.id)
            .bind(&event.work_item_id)
            .bind(event.event_type.as_str())
            .bind(&event.payload)
            .bind(event.at)
            .bind(event.delivered)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn undelivered_events(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        let table = self.config.event_table();
        let query = format!(
            "SELECT * FROM {table} WHERE delivered = FALSE ORDER BY seq ASC LIMIT $1"
        );
        let rows = sqlx::query(&query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn mark_delivered(&self, event_ids: &[String]) -> Result<(), StoreError> {
        let table = self.config.event_table();
        let query = format!("UPDATE {table} SET delivered = TRUE WHERE id = ANY($1)");
        sqlx::query(&query)
            .bind(event_ids)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn history(&self, id: &str) -> Result<Vec<Transition>, StoreError> {
        let table = self.config.transition_table();
        let query = format!(
            "SELECT * FROM {table} WHERE work_item_id = $1 ORDER BY at ASC, id ASC"
        );
        let rows = sqlx::query(&query)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(transition_from_row).collect()
    }

    async fn transitions_in(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Transition>, StoreError> {
        let table = self.config.transition_table();
        let query = format!(
            "SELECT * FROM {table} WHERE at >= $1 AND at <= $2 ORDER BY at ASC, id ASC"
        );
        let rows = sqlx::query(&query)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(transition_from_row).collect()
    }

    #[allow(clippy::cast_sign_loss)]
    async fn add_quota_usage(
        &self,
        service: &str,
        window: QuotaWindow,
        dimension: QuotaDimension,
        window_start: DateTime<Utc>,
        amount: u64,
        limit: u64,
    ) -> Result<u64, StoreError> {
        let table = self.config.quota_counter_table();
        // One upsert under row-level locking: a tumbled window restarts the
        // count, a live window accumulates.
        let query = format!(
            "INSERT INTO {table} (service, \"window\", dimension, \"limit\", used, window_start) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (service, \"window\", dimension) DO UPDATE SET \
                used = CASE WHEN {table}.window_start = EXCLUDED.window_start \
                    THEN {table}.used + EXCLUDED.used ELSE EXCLUDED.used END, \
                window_start = EXCLUDED.window_start, \
                \"limit\" = EXCLUDED.\"limit\" \
             RETURNING used"
        );
        let row: (i64,) = sqlx::query_as(&query)
            .bind(service)
            .bind(window.label())
            .bind(dimension.label())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(amount).unwrap_or(i64::MAX))
            .bind(window_start)
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(row.0 as u64)
    }

    #[allow(clippy::cast_sign_loss)]
    async fn quota_counters(&self, service: &str) -> Result<Vec<QuotaCounter>, StoreError> {
        let table = self.config.quota_counter_table();
        let query = format!(
            "SELECT service, \"window\", dimension, \"limit\", used, window_start \
             FROM {table} WHERE service = $1"
        );
        let rows: Vec<(String, String, String, i64, i64, DateTime<Utc>)> = sqlx::query_as(&query)
            .bind(service)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        rows.into_iter()
            .map(|(service, window, dimension, limit, used, window_start)| {
                Ok(QuotaCounter {
                    service,
                    window: QuotaWindow::parse(&window).ok_or_else(|| {
                        StoreError::Serialization(format!("unknown quota window: {window}"))
                    })?,
                    dimension: QuotaDimension::parse(&dimension).ok_or_else(|| {
                        StoreError::Serialization(format!("unknown quota dimension: {dimension}"))
                    })?,
                    limit: limit as u64,
                    used: used as u64,
                    window_start,
                })
            })
            .collect()
    }

    async fn append_usage_log(&self, entry: QuotaUsageEntry) -> Result<(), StoreError> {
        let table = self.config.quota_usage_log_table();
        let query = format!(
            "INSERT INTO {table} \
             (id, service, work_item_id, input_tokens, output_tokens, image_count, cost, at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        );
        sqlx::query(&query)
            .bind(&entry.id)
            .bind(&entry.service)
            .bind(&entry.work_item_id)
            .bind(i64::try_from(entry.input_tokens).unwrap_or(i64::MAX))
            .bind(i64::try_from(entry.output_tokens).unwrap_or(i64::MAX))
            .bind(i32::try_from(entry.image_count).unwrap_or(i32::MAX))
            .bind(entry.cost)
            .bind(entry.at)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    #[allow(clippy::cast_sign_loss)]
    async fn usage_log(
        &self,
        service: &str,
        limit: usize,
    ) -> Result<Vec<QuotaUsageEntry>, StoreError> {
        let table = self.config.quota_usage_log_table();
        let query = format!(
            "SELECT id, service, work_item_id, input_tokens, output_tokens, image_count, cost, at \
             FROM {table} WHERE service = $1 ORDER BY at DESC LIMIT $2"
        );
        let rows: Vec<(String, String, String, i64, i64, i32, f64, DateTime<Utc>)> =
            sqlx::query_as(&query)
                .bind(service)
                .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                .fetch_all(&self.pool)
                .await
                .map_err(backend_err)?;

        Ok(rows
            .into_iter()
            .map(
                |(id, service, work_item_id, input_tokens, output_tokens, image_count, cost, at)| {
                    QuotaUsageEntry {
                        id,
                        service,
                        work_item_id,
                        input_tokens: input_tokens as u64,
                        output_tokens: output_tokens as u64,
                        image_count: image_count as u32,
                        cost,
                        at,
                    }
                },
            )
            .collect())
    }

    #[allow(clippy::cast_sign_loss)]
    async fn quota_limit_overrides(&self, service: &str) -> Result<Vec<QuotaLimit>, StoreError> {
        let table = self.config.quota_limit_table();
        let query = format!(
            "SELECT service, \"window\", dimension, \"limit\" FROM {table} WHERE service = $1"
        );
        let rows: Vec<(String, String, String, i64)> = sqlx::query_as(&query)
            .bind(service)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        rows.into_iter()
            .map(|(service, window, dimension, limit)| {
                Ok(QuotaLimit {
                    service,
                    window: QuotaWindow::parse(&window).ok_or_else(|| {
                        StoreError::Serialization(format!("unknown quota window: {window}"))
                    })?,
                    dimension: QuotaDimension::parse(&dimension).ok_or_else(|| {
                        StoreError::Serialization(format!("unknown quota dimension: {dimension}"))
                    })?,
                    limit: limit as u64,
                })
            })
            .collect()
    }

    async fn upsert_quota_limit(&self, limit: QuotaLimit) -> Result<(), StoreError> {
        let table = self.config.quota_limit_table();
        let query = format!(
            "INSERT INTO {table} (service, \"window\", dimension, \"limit\") \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (service, \"window\", dimension) DO UPDATE SET \
                \"limit\" = EXCLUDED.\"limit\""
        );
        sqlx::query(&query)
            .bind(&limit.service)
            .bind(limit.window.label())
            .bind(limit.dimension.label())
            .bind(i64::try_from(limit.limit).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn record_metric(&self, metric: Metric) -> Result<(), StoreError> {
        let table = self.config.metric_table();
        let query = format!(
            "INSERT INTO {table} (id, work_item_id, kind, name, value, at) \
             VALUES ($1, $2, $3, $4, $5, $6)"
        );
        sqlx::query(&query)
            .bind(&metric.id)
            .bind(&metric.work_item_id)
            .bind(metric.kind.as_str())
            .bind(&metric.name)
            .bind(metric.value)
            .bind(metric.at)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn metrics_in(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        kind: Option<MetricKind>,
    ) -> Result<Vec<Metric>, StoreError> {
        let table = self.config.metric_table();
        let query = format!(
            "SELECT id, work_item_id, kind, name, value, at FROM {table} \
             WHERE at >= $1 AND at <= $2 AND ($3::text IS NULL OR kind = $3) \
             ORDER BY at ASC"
        );
        let rows: Vec<(String, Option<String>, String, String, f64, DateTime<Utc>)> =
            sqlx::query_as(&query)
                .bind(from)
                .bind(to)
                .bind(kind.map(MetricKind::as_str))
                .fetch_all(&self.pool)
                .await
                .map_err(backend_err)?;

        rows.into_iter()
            .map(|(id, work_item_id, kind, name, value, at)| {
                Ok(Metric {
                    id,
                    work_item_id,
                    kind: MetricKind::parse(&kind).ok_or_else(|| {
                        StoreError::Serialization(format!("unknown metric kind: {kind}"))
                    })?,
                    name,
                    value,
                    at,
                })
            })
            .collect()
    }

    async fn insert_dead_letter(&self, entry: DeadLetterEntry) -> Result<(), StoreError> {
        let table = self.config.dead_letter_table();
        let chain = serde_json::to_value(&entry.error_chain)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let query = format!(
            "INSERT INTO {table} (id, work_item_id, error_chain, at) VALUES ($1, $2, $3, $4)"
        );
        sqlx::query(&query)
            .bind(&entry.id)
            .bind(&entry.work_item_id)
            .bind(chain)
            .bind(entry.at)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let table = self.config.dead_letter_table();
        let query = format!("SELECT id, work_item_id, error_chain, at FROM {table} \
             ORDER BY at DESC LIMIT $1");
        let rows: Vec<(String, String, serde_json::Value, DateTime<Utc>)> = sqlx::query_as(&query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        rows.into_iter()
            .map(|(id, work_item_id, chain, at)| {
                Ok(DeadLetterEntry {
                    id,
                    work_item_id,
                    error_chain: serde_json::from_value(chain)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                    at,
                })
            })
            .collect()
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;

    fn test_config() -> PostgresConfig {
        PostgresConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost:5432/labelsquor_test".to_string()),
            table_prefix: format!("test_{}_", uuid::Uuid::new_v4().simple()),
            ..PostgresConfig::default()
        }
    }

    #[tokio::test]
    async fn store_conformance() {
        let config = test_config();
        let store = PostgresWorkItemStore::new(config)
            .await
            .expect("pool creation should succeed");
        labelsquor_store::testing::run_store_conformance_tests(&store)
            .await
            .expect("conformance tests should pass");
    }
}
