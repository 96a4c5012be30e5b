//! Database schema management for `codemetal-agrowatch`.
//!
//! Ensures the queue, alert and property tables exist before any worker
//! starts. Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Safe to call on every startup; no-op if the objects already exist.
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Queue registry, one row per declared queue
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queues (
            name        TEXT PRIMARY KEY,
            declared_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Pending and in-flight messages; a row lives until it is acknowledged
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_messages (
            id             BIGSERIAL   PRIMARY KEY,
            queue          TEXT        NOT NULL REFERENCES queues (name),
            body           JSONB       NOT NULL,
            persistent     BOOLEAN     NOT NULL DEFAULT TRUE,
            enqueued_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            available_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            delivery_count INTEGER     NOT NULL DEFAULT 0
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_queue_messages_visible
            ON queue_messages (queue, available_at, id);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Alert records, owned by the alert consumer
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id           UUID          PRIMARY KEY,
            property_id  TEXT          NOT NULL,
            plot_id      TEXT          NOT NULL,
            alert_type   TEXT          NOT NULL,
            message      TEXT          NOT NULL,
            sensor_type  TEXT          NOT NULL,
            sensor_value NUMERIC       NOT NULL,
            threshold    NUMERIC       NOT NULL,
            created_at   TIMESTAMPTZ   NOT NULL,
            is_active    BOOLEAN       NOT NULL DEFAULT TRUE
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Lookup of the active alert by composite key
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_alerts_active_key
            ON alerts (property_id, plot_id, sensor_type, created_at DESC)
            WHERE is_active;
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Property aggregates, owned by the projection consumer
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS properties (
            id         TEXT        PRIMARY KEY,
            owner_id   TEXT        NOT NULL,
            active     BOOLEAN     NOT NULL DEFAULT TRUE,
            document   JSONB       NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_properties_owner_id
            ON properties (owner_id);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
