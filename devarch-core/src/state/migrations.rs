//! Database migrations.

use crate::error::{DevarchError, Result};
use sqlx::SqlitePool;
use tracing::{info, instrument};

const SCHEMA_VERSION: i64 = 1;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DevarchError::MigrationFailed { reason: e.to_string() })?;

    let current_version: Option<i64> =
        sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(pool)
            .await
            .map_err(|e| DevarchError::MigrationFailed { reason: e.to_string() })?;

    let current_version = current_version.unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!("Migrating database from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        migrate_to_v1(pool).await?;
    }

    Ok(())
}

const V1: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS templates (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        revision INTEGER NOT NULL,
        definition TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stacks (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        revision INTEGER NOT NULL,
        deleted_at TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    // Names are unique among live stacks only; the trash may hold duplicates.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_stacks_active_name ON stacks(name) WHERE deleted_at IS NULL",
    r#"
    CREATE TABLE IF NOT EXISTS instances (
        uid TEXT PRIMARY KEY,
        stack_id TEXT NOT NULL REFERENCES stacks(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        template_id TEXT NOT NULL REFERENCES templates(id),
        description TEXT NOT NULL DEFAULT '',
        revision INTEGER NOT NULL,
        deleted_at TEXT,
        applied TEXT
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_active_name ON instances(stack_id, name) WHERE deleted_at IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_instances_stack ON instances(stack_id)",
    r#"
    CREATE TABLE IF NOT EXISTS instance_overrides (
        instance_uid TEXT NOT NULL REFERENCES instances(uid) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (instance_uid, kind)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stack_wires (
        stack_id TEXT NOT NULL REFERENCES stacks(id) ON DELETE CASCADE,
        consumer TEXT NOT NULL,
        import_name TEXT NOT NULL,
        provider TEXT NOT NULL,
        export_name TEXT,
        PRIMARY KEY (stack_id, consumer, import_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stack_applied_edges (
        stack_id TEXT NOT NULL REFERENCES stacks(id) ON DELETE CASCADE,
        consumer TEXT NOT NULL,
        import_name TEXT NOT NULL,
        edge TEXT NOT NULL,
        PRIMARY KEY (stack_id, consumer, import_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stack_locks (
        stack_id TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        acquired_at TEXT NOT NULL
    )
    "#,
];

#[instrument(skip(pool))]
async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 1");

    let mut tx = pool.begin().await.map_err(|e| DevarchError::MigrationFailed { reason: e.to_string() })?;

    for statement in V1 {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| DevarchError::MigrationFailed { reason: e.to_string() })?;
    }

    sqlx::query("INSERT INTO schema_version (version) VALUES (1)")
        .execute(&mut *tx)
        .await
        .map_err(|e| DevarchError::MigrationFailed { reason: e.to_string() })?;

    tx.commit().await.map_err(|e| DevarchError::MigrationFailed { reason: e.to_string() })?;

    Ok(())
}
