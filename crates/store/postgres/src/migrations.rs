use sqlx::PgPool;

use crate::config::PostgresConfig;

/// Run database migrations, creating required tables and indexes if they do
/// not exist. All DDL is idempotent so every instance can run it at startup.
///
/// # Errors
///
/// Returns a [`sqlx::Error`] if any DDL statement fails.
pub async fn run_migrations(pool: &PgPool, config: &PostgresConfig) -> Result<(), sqlx::Error> {
    let work_item = config.work_item_table();
    let transition = config.transition_table();
    let event = config.event_table();
    let metric = config.metric_table();
    let quota_counter = config.quota_counter_table();
    let quota_usage_log = config.quota_usage_log_table();
    let quota_limit = config.quota_limit_table();
    let dead_letter = config.dead_letter_table();
    let prefix = &config.table_prefix;

    let tables = [
        format!(
            "CREATE TABLE IF NOT EXISTS {work_item} (
                id                    TEXT PRIMARY KEY,
                priority              INTEGER NOT NULL DEFAULT 0,
                state                 TEXT NOT NULL,
                stage                 TEXT NOT NULL,
                attempt_count         INTEGER NOT NULL DEFAULT 0,
                quota_exceeded_count  INTEGER NOT NULL DEFAULT 0,
                enqueued_at           TIMESTAMPTZ NOT NULL,
                started_at            TIMESTAMPTZ,
                completed_at          TIMESTAMPTZ,
                next_attempt_at       TIMESTAMPTZ,
                lock_holder           TEXT,
                lock_acquired_at      TIMESTAMPTZ,
                lock_expires_at       TIMESTAMPTZ,
                version               BIGINT NOT NULL DEFAULT 0,
                payload               JSONB NOT NULL DEFAULT 'null'::jsonb,
                partial_results       JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                last_error            JSONB,
                cancel_requested      BOOLEAN NOT NULL DEFAULT FALSE,
                metadata              JSONB NOT NULL DEFAULT 'null'::jsonb
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {transition} (
                id            TEXT PRIMARY KEY,
                work_item_id  TEXT NOT NULL,
                from_state    TEXT NOT NULL,
                to_state      TEXT NOT NULL,
                stage         TEXT NOT NULL,
                reason        TEXT NOT NULL,
                metadata      JSONB NOT NULL DEFAULT 'null'::jsonb,
                actor         TEXT NOT NULL,
                at            TIMESTAMPTZ NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {event} (
                seq           BIGSERIAL PRIMARY KEY,
                id            TEXT NOT NULL UNIQUE,
                work_item_id  TEXT NOT NULL,
                event_type    TEXT NOT NULL,
                payload       JSONB NOT NULL DEFAULT 'null'::jsonb,
                at            TIMESTAMPTZ NOT NULL,
                delivered     BOOLEAN NOT NULL DEFAULT FALSE
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {metric} (
                id            TEXT PRIMARY KEY,
                work_item_id  TEXT,
                kind          TEXT NOT NULL,
                name          TEXT NOT NULL,
                value         DOUBLE PRECISION NOT NULL,
                at            TIMESTAMPTZ NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {quota_counter} (
                service       TEXT NOT NULL,
                \"window\"      TEXT NOT NULL,
                dimension     TEXT NOT NULL,
                \"limit\"       BIGINT NOT NULL,
                used          BIGINT NOT NULL DEFAULT 0,
                window_start  TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (service, \"window\", dimension)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {quota_usage_log} (
                id             TEXT PRIMARY KEY,
                service        TEXT NOT NULL,
                work_item_id   TEXT NOT NULL,
                input_tokens   BIGINT NOT NULL DEFAULT 0,
                output_tokens  BIGINT NOT NULL DEFAULT 0,
                image_count    INTEGER NOT NULL DEFAULT 0,
                cost           DOUBLE PRECISION NOT NULL DEFAULT 0,
                at             TIMESTAMPTZ NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {quota_limit} (
                service    TEXT NOT NULL,
                \"window\"   TEXT NOT NULL,
                dimension  TEXT NOT NULL,
                \"limit\"    BIGINT NOT NULL,
                PRIMARY KEY (service, \"window\", dimension)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {dead_letter} (
                id            TEXT PRIMARY KEY,
                work_item_id  TEXT NOT NULL,
                error_chain   JSONB NOT NULL DEFAULT '[]'::jsonb,
                at            TIMESTAMPTZ NOT NULL
            )"
        ),
    ];

    for ddl in &tables {
        sqlx::query(ddl).execute(pool).await?;
    }

    let indexes = [
        // Dispatcher feed.
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{prefix}work_item_ready ON {work_item} \
             (state, priority DESC, next_attempt_at ASC)"
        ),
        // Lease reclamation.
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{prefix}work_item_lease ON {work_item} \
             (lock_expires_at) WHERE lock_expires_at IS NOT NULL"
        ),
        // Transition history per item.
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{prefix}transition_item ON {transition} \
             (work_item_id, at DESC)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{prefix}transition_at ON {transition} (at)"
        ),
        // Outbox scan.
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{prefix}event_undelivered ON {event} \
             (seq) WHERE delivered = FALSE"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{prefix}metric_at ON {metric} (at)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{prefix}usage_log_service ON {quota_usage_log} \
             (service, at DESC)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{prefix}dead_letter_at ON {dead_letter} (at DESC)"
        ),
    ];

    for idx in &indexes {
        sqlx::query(idx).execute(pool).await?;
    }

    Ok(())
}
