//! Row-level queries shared by pooled reads, catalog transactions and
//! atomic units. Everything here takes a bare connection so callers decide
//! the transaction boundary.

use crate::error::{DevarchError, Result};
use crate::observability::metrics;
use crate::repository::StackState;
use crate::types::{
    Instance, Lifecycle, OverrideBundle, OverrideKind, OverrideSet, ServiceTemplate, Stack,
};
use crate::wiring::{ExplicitWire, WiringEdge};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use std::collections::{BTreeMap, HashMap};

/// Map a database error, counting it under `operation`.
pub(super) fn db_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> DevarchError {
    move |e| {
        metrics::record_db_error(operation);
        DevarchError::Database(e.to_string())
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED and their extended codes, or pool exhaustion.
pub(super) fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("5") | Some("6") | Some("261") | Some("262") | Some("517"))
                || db.message().contains("database is locked")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub(super) fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DevarchError::Serialization(format!("invalid timestamp '{}': {}", value, e)))
}

fn parse_lifecycle(deleted_at: Option<String>) -> Result<Lifecycle> {
    Ok(Lifecycle::from_deleted_at(deleted_at.as_deref().map(parse_time).transpose()?))
}

// ========================
// Templates
// ========================

fn row_to_template(row: SqliteRow) -> Result<ServiceTemplate> {
    let definition: String = row.try_get("definition")?;
    let mut template: ServiceTemplate = serde_json::from_str(&definition)?;
    template.revision = row.try_get("revision")?;
    Ok(template)
}

pub(super) async fn fetch_template(
    conn: &mut SqliteConnection,
    template_id: &str,
) -> Result<Option<ServiceTemplate>> {
    sqlx::query("SELECT revision, definition FROM templates WHERE id = ?")
        .bind(template_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("fetch_template"))?
        .map(row_to_template)
        .transpose()
}

pub(super) async fn fetch_templates(conn: &mut SqliteConnection) -> Result<Vec<ServiceTemplate>> {
    sqlx::query("SELECT revision, definition FROM templates ORDER BY name")
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error("fetch_templates"))?
        .into_iter()
        .map(row_to_template)
        .collect()
}

pub(super) async fn upsert_template(conn: &mut SqliteConnection, template: &ServiceTemplate) -> Result<()> {
    let definition = serde_json::to_string(template)?;
    sqlx::query(
        r#"
        INSERT INTO templates (id, name, revision, definition) VALUES (?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET name = excluded.name, revision = excluded.revision,
            definition = excluded.definition
        "#,
    )
    .bind(&template.id)
    .bind(&template.name)
    .bind(template.revision)
    .bind(definition)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            DevarchError::NameConflict {
                name: template.name.clone(),
                reason: "another template has this name".to_string(),
            }
        } else {
            db_error("upsert_template")(e)
        }
    })?;
    Ok(())
}

// ========================
// Stacks
// ========================

const STACK_COLUMNS: &str = "id, name, description, revision, deleted_at, created_at";

fn row_to_stack(row: SqliteRow) -> Result<Stack> {
    let created_at: String = row.try_get("created_at")?;
    Ok(Stack {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        lifecycle: parse_lifecycle(row.try_get("deleted_at")?)?,
        revision: row.try_get("revision")?,
        created_at: parse_time(&created_at)?,
    })
}

pub(super) async fn fetch_stack(conn: &mut SqliteConnection, stack_id: &str) -> Result<Option<Stack>> {
    sqlx::query(&format!("SELECT {} FROM stacks WHERE id = ?", STACK_COLUMNS))
        .bind(stack_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("fetch_stack"))?
        .map(row_to_stack)
        .transpose()
}

pub(super) async fn fetch_active_stack_by_name(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<Option<Stack>> {
    sqlx::query(&format!(
        "SELECT {} FROM stacks WHERE name = ? AND deleted_at IS NULL",
        STACK_COLUMNS
    ))
    .bind(name)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("fetch_stack_by_name"))?
    .map(row_to_stack)
    .transpose()
}

/// Active stacks by name, or tombstoned stacks newest first.
pub(super) async fn fetch_stacks(conn: &mut SqliteConnection, deleted: bool) -> Result<Vec<Stack>> {
    let query = if deleted {
        format!("SELECT {} FROM stacks WHERE deleted_at IS NOT NULL ORDER BY deleted_at DESC", STACK_COLUMNS)
    } else {
        format!("SELECT {} FROM stacks WHERE deleted_at IS NULL ORDER BY name", STACK_COLUMNS)
    };
    sqlx::query(&query)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error("fetch_stacks"))?
        .into_iter()
        .map(row_to_stack)
        .collect()
}

pub(super) async fn insert_stack(conn: &mut SqliteConnection, stack: &Stack) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO stacks (id, name, description, revision, deleted_at, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&stack.id)
    .bind(&stack.name)
    .bind(&stack.description)
    .bind(stack.revision)
    .bind(stack.lifecycle.deleted_at().map(format_time))
    .bind(format_time(stack.created_at))
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            DevarchError::NameConflict {
                name: stack.name.clone(),
                reason: "an active stack already has this name".to_string(),
            }
        } else {
            db_error("insert_stack")(e)
        }
    })?;
    Ok(())
}

/// Set or clear a stack's tombstone and bump its revision.
pub(super) async fn set_stack_deleted_at(
    conn: &mut SqliteConnection,
    stack_id: &str,
    deleted_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query("UPDATE stacks SET deleted_at = ?, revision = revision + 1 WHERE id = ?")
        .bind(deleted_at.map(format_time))
        .bind(stack_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error("set_stack_deleted_at"))?;
    Ok(())
}

pub(super) async fn bump_stack_revision(conn: &mut SqliteConnection, stack_id: &str) -> Result<()> {
    sqlx::query("UPDATE stacks SET revision = revision + 1 WHERE id = ?")
        .bind(stack_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error("bump_stack_revision"))?;
    Ok(())
}

/// Remove a stack and every row that hangs off it.
pub(super) async fn purge_stack(conn: &mut SqliteConnection, stack_id: &str) -> Result<()> {
    let statements = [
        "DELETE FROM instance_overrides WHERE instance_uid IN (SELECT uid FROM instances WHERE stack_id = ?)",
        "DELETE FROM instances WHERE stack_id = ?",
        "DELETE FROM stack_wires WHERE stack_id = ?",
        "DELETE FROM stack_applied_edges WHERE stack_id = ?",
        "DELETE FROM stacks WHERE id = ?",
    ];
    for statement in statements {
        sqlx::query(statement)
            .bind(stack_id)
            .execute(&mut *conn)
            .await
            .map_err(db_error("purge_stack"))?;
    }
    Ok(())
}

// ========================
// Instances and overrides
// ========================

const INSTANCE_COLUMNS: &str =
    "uid, stack_id, name, template_id, description, revision, deleted_at, applied";

fn row_to_instance(row: SqliteRow, overrides: OverrideBundle) -> Result<Instance> {
    let applied: Option<String> = row.try_get("applied")?;
    Ok(Instance {
        uid: row.try_get("uid")?,
        stack_id: row.try_get("stack_id")?,
        name: row.try_get("name")?,
        template_id: row.try_get("template_id")?,
        description: row.try_get("description")?,
        lifecycle: parse_lifecycle(row.try_get("deleted_at")?)?,
        revision: row.try_get("revision")?,
        overrides,
        applied: applied.as_deref().map(serde_json::from_str).transpose()?,
    })
}

fn bundle_from_rows(rows: Vec<(String, String)>) -> Result<OverrideBundle> {
    let mut bundle = OverrideBundle::default();
    for (kind, payload) in rows {
        let kind = OverrideKind::parse(&kind)
            .ok_or_else(|| DevarchError::Serialization(format!("unknown override kind '{}'", kind)))?;
        bundle.set(OverrideSet::from_payload(kind, &payload)?);
    }
    Ok(bundle)
}

pub(super) async fn fetch_overrides(conn: &mut SqliteConnection, instance_uid: &str) -> Result<OverrideBundle> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT kind, payload FROM instance_overrides WHERE instance_uid = ?")
            .bind(instance_uid)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_error("fetch_overrides"))?;
    bundle_from_rows(rows)
}

pub(super) async fn fetch_instance(conn: &mut SqliteConnection, uid: &str) -> Result<Option<Instance>> {
    let Some(row) = sqlx::query(&format!("SELECT {} FROM instances WHERE uid = ?", INSTANCE_COLUMNS))
        .bind(uid)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("fetch_instance"))?
    else {
        return Ok(None);
    };
    let overrides = fetch_overrides(conn, uid).await?;
    row_to_instance(row, overrides).map(Some)
}

/// Every instance of a stack, tombstoned ones included, sorted by name then uid.
pub(super) async fn fetch_instances(conn: &mut SqliteConnection, stack_id: &str) -> Result<Vec<Instance>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM instances WHERE stack_id = ? ORDER BY name, uid",
        INSTANCE_COLUMNS
    ))
    .bind(stack_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("fetch_instances"))?;

    let override_rows: Vec<(String, String, String)> = sqlx::query_as(
        r#"
        SELECT o.instance_uid, o.kind, o.payload
        FROM instance_overrides o JOIN instances i ON i.uid = o.instance_uid
        WHERE i.stack_id = ?
        "#,
    )
    .bind(stack_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("fetch_instances"))?;

    let mut grouped: HashMap<String, Vec<(String, String)>> = HashMap::new();
    for (uid, kind, payload) in override_rows {
        grouped.entry(uid).or_default().push((kind, payload));
    }

    rows.into_iter()
        .map(|row| {
            let uid: String = row.try_get("uid")?;
            let overrides = bundle_from_rows(grouped.remove(&uid).unwrap_or_default())?;
            row_to_instance(row, overrides)
        })
        .collect()
}

pub(super) async fn fetch_active_instance(
    conn: &mut SqliteConnection,
    stack_id: &str,
    name: &str,
) -> Result<Option<Instance>> {
    let uid: Option<String> = sqlx::query_scalar(
        "SELECT uid FROM instances WHERE stack_id = ? AND name = ? AND deleted_at IS NULL",
    )
    .bind(stack_id)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("fetch_active_instance"))?;

    match uid {
        Some(uid) => fetch_instance(conn, &uid).await,
        None => Ok(None),
    }
}

pub(super) async fn insert_instance(conn: &mut SqliteConnection, instance: &Instance) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO instances (uid, stack_id, name, template_id, description, revision, deleted_at, applied)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&instance.uid)
    .bind(&instance.stack_id)
    .bind(&instance.name)
    .bind(&instance.template_id)
    .bind(&instance.description)
    .bind(instance.revision)
    .bind(instance.lifecycle.deleted_at().map(format_time))
    .bind(instance.applied.as_ref().map(serde_json::to_string).transpose()?)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            DevarchError::NameConflict {
                name: instance.name.clone(),
                reason: "an active instance in this stack already has this name".to_string(),
            }
        } else {
            db_error("insert_instance")(e)
        }
    })?;

    write_overrides(conn, &instance.uid, &instance.overrides).await
}

/// Persist an instance row. Overrides are written separately.
pub(super) async fn update_instance(conn: &mut SqliteConnection, instance: &Instance) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE instances
        SET name = ?, template_id = ?, description = ?, revision = ?, deleted_at = ?, applied = ?
        WHERE uid = ? AND stack_id = ?
        "#,
    )
    .bind(&instance.name)
    .bind(&instance.template_id)
    .bind(&instance.description)
    .bind(instance.revision)
    .bind(instance.lifecycle.deleted_at().map(format_time))
    .bind(instance.applied.as_ref().map(serde_json::to_string).transpose()?)
    .bind(&instance.uid)
    .bind(&instance.stack_id)
    .execute(&mut *conn)
    .await
    .map_err(db_error("update_instance"))?;

    if result.rows_affected() == 0 {
        return Err(DevarchError::InstanceNotFound {
            stack: instance.stack_id.clone(),
            instance: instance.name.clone(),
        });
    }
    Ok(())
}

/// Replace every override row of an instance with the present kinds of `bundle`.
pub(super) async fn write_overrides(
    conn: &mut SqliteConnection,
    instance_uid: &str,
    bundle: &OverrideBundle,
) -> Result<()> {
    sqlx::query("DELETE FROM instance_overrides WHERE instance_uid = ?")
        .bind(instance_uid)
        .execute(&mut *conn)
        .await
        .map_err(db_error("write_overrides"))?;

    for set in bundle.present() {
        sqlx::query("INSERT INTO instance_overrides (instance_uid, kind, payload) VALUES (?, ?, ?)")
            .bind(instance_uid)
            .bind(set.kind().as_str())
            .bind(set.payload_json()?)
            .execute(&mut *conn)
            .await
            .map_err(db_error("write_overrides"))?;
    }
    Ok(())
}

/// Tombstone (keeping an earlier tombstone) and forget the applied snapshot.
/// Returns false when no such instance exists in the stack.
pub(super) async fn soft_delete_instance(
    conn: &mut SqliteConnection,
    stack_id: &str,
    instance_uid: &str,
    at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE instances
        SET deleted_at = COALESCE(deleted_at, ?), applied = NULL, revision = revision + 1
        WHERE uid = ? AND stack_id = ?
        "#,
    )
    .bind(format_time(at))
    .bind(instance_uid)
    .bind(stack_id)
    .execute(&mut *conn)
    .await
    .map_err(db_error("soft_delete_instance"))?;
    Ok(result.rows_affected() > 0)
}

/// Tombstone every active instance of a stack at `at`.
pub(super) async fn tombstone_instances(
    conn: &mut SqliteConnection,
    stack_id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE instances SET deleted_at = ?, revision = revision + 1 WHERE stack_id = ? AND deleted_at IS NULL",
    )
    .bind(format_time(at))
    .bind(stack_id)
    .execute(&mut *conn)
    .await
    .map_err(db_error("tombstone_instances"))?;
    Ok(())
}

/// Clear the tombstone of instances that were deleted at exactly `at`.
pub(super) async fn restore_instances_deleted_at(
    conn: &mut SqliteConnection,
    stack_id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE instances SET deleted_at = NULL, revision = revision + 1 WHERE stack_id = ? AND deleted_at = ?",
    )
    .bind(stack_id)
    .bind(format_time(at))
    .execute(&mut *conn)
    .await
    .map_err(db_error("restore_instances"))?;
    Ok(())
}

pub(super) async fn count_applied_instances(conn: &mut SqliteConnection, stack_id: &str) -> Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM instances WHERE stack_id = ? AND applied IS NOT NULL")
        .bind(stack_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error("count_applied_instances"))
}

/// Applied instances of tombstoned stacks named `name`, other than `except`.
///
/// Container names derive from the stack name, so the name stays taken until
/// those deletions are applied.
pub(super) async fn count_pending_teardowns(
    conn: &mut SqliteConnection,
    name: &str,
    except: &str,
) -> Result<i64> {
    sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM instances i
        JOIN stacks s ON s.id = i.stack_id
        WHERE s.name = ? AND s.id != ? AND s.deleted_at IS NOT NULL AND i.applied IS NOT NULL
        "#,
    )
    .bind(name)
    .bind(except)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error("count_pending_teardowns"))
}

// ========================
// Wires and applied edges
// ========================

pub(super) async fn fetch_wires(conn: &mut SqliteConnection, stack_id: &str) -> Result<Vec<ExplicitWire>> {
    let rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
        r#"
        SELECT consumer, import_name, provider, export_name FROM stack_wires
        WHERE stack_id = ? ORDER BY consumer, import_name
        "#,
    )
    .bind(stack_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("fetch_wires"))?;

    Ok(rows
        .into_iter()
        .map(|(consumer, import_name, provider, export_name)| ExplicitWire {
            consumer,
            import_name,
            provider,
            export_name,
        })
        .collect())
}

pub(super) async fn insert_wire(conn: &mut SqliteConnection, stack_id: &str, wire: &ExplicitWire) -> Result<()> {
    sqlx::query(
        "INSERT INTO stack_wires (stack_id, consumer, import_name, provider, export_name) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(stack_id)
    .bind(&wire.consumer)
    .bind(&wire.import_name)
    .bind(&wire.provider)
    .bind(&wire.export_name)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            DevarchError::validation(format!(
                "import {}.{} is already wired explicitly",
                wire.consumer, wire.import_name
            ))
        } else {
            db_error("insert_wire")(e)
        }
    })?;
    Ok(())
}

/// Returns false when there was no such wire.
pub(super) async fn delete_wire(
    conn: &mut SqliteConnection,
    stack_id: &str,
    consumer: &str,
    import_name: &str,
) -> Result<bool> {
    let result =
        sqlx::query("DELETE FROM stack_wires WHERE stack_id = ? AND consumer = ? AND import_name = ?")
            .bind(stack_id)
            .bind(consumer)
            .bind(import_name)
            .execute(&mut *conn)
            .await
            .map_err(db_error("delete_wire"))?;
    Ok(result.rows_affected() > 0)
}

pub(super) async fn fetch_applied_edges(conn: &mut SqliteConnection, stack_id: &str) -> Result<Vec<WiringEdge>> {
    let rows: Vec<String> = sqlx::query_scalar(
        "SELECT edge FROM stack_applied_edges WHERE stack_id = ? ORDER BY consumer, import_name",
    )
    .bind(stack_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("fetch_applied_edges"))?;

    rows.iter().map(|edge| Ok(serde_json::from_str(edge)?)).collect()
}

pub(super) async fn replace_applied_edges(
    conn: &mut SqliteConnection,
    stack_id: &str,
    edges: &[WiringEdge],
) -> Result<()> {
    sqlx::query("DELETE FROM stack_applied_edges WHERE stack_id = ?")
        .bind(stack_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error("replace_applied_edges"))?;

    for edge in edges {
        sqlx::query(
            "INSERT INTO stack_applied_edges (stack_id, consumer, import_name, edge) VALUES (?, ?, ?, ?)",
        )
        .bind(stack_id)
        .bind(&edge.consumer)
        .bind(&edge.import_name)
        .bind(serde_json::to_string(edge)?)
        .execute(&mut *conn)
        .await
        .map_err(db_error("replace_applied_edges"))?;
    }
    Ok(())
}

// ========================
// Stack snapshot
// ========================

/// Read every row planning needs for one stack.
pub(super) async fn load_stack_state(conn: &mut SqliteConnection, stack_id: &str) -> Result<StackState> {
    let stack = fetch_stack(conn, stack_id)
        .await?
        .ok_or_else(|| DevarchError::StackNotFound { stack: stack_id.to_string() })?;
    let instances = fetch_instances(conn, stack_id).await?;

    let mut templates = BTreeMap::new();
    for instance in instances.iter().filter(|i| i.is_active()) {
        if templates.contains_key(&instance.template_id) {
            continue;
        }
        let template = fetch_template(conn, &instance.template_id)
            .await?
            .ok_or_else(|| DevarchError::TemplateNotFound { template: instance.template_id.clone() })?;
        templates.insert(instance.template_id.clone(), template);
    }

    let wires = fetch_wires(conn, stack_id).await?;
    let applied_edges = fetch_applied_edges(conn, stack_id).await?;

    Ok(StackState { stack, instances, templates, wires, applied_edges })
}
