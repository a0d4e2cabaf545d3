//! State management with SQLite persistence.
//!
//! The StateManager is the engine's [`Repository`] and also owns the
//! catalog: templates, stacks, instances, overrides and explicit wires.
//!
//! Catalog writes are short transactions of their own. They do not go
//! through the apply path, and a plan generated before one of them is
//! rejected as stale. Override writes are the exception: they take the
//! stack lock so they never interleave with an apply.

use crate::apply::lock::{StackLockGuard, StackLocks};
use crate::config::EngineConfig;
use crate::error::{DevarchError, Result};
use crate::naming;
use crate::repository::{AtomicUnit, Repository, StackState};
use crate::types::{
    Instance, Lifecycle, OverrideBundle, OverrideKind, OverrideSet, ServiceTemplate, Stack,
};
use crate::wiring::{ExplicitWire, WiringEdge};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

mod atomic;
pub mod migrations;
mod queries;

#[cfg(test)]
mod tests;

use atomic::SqliteAtomicUnit;
use queries::db_error;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// State manager for persistent storage.
#[derive(Clone)]
pub struct StateManager {
    pool: SqlitePool,
    locks: StackLocks,
    lock_timeout: Duration,
}

impl StateManager {
    /// Create a new StateManager with an in-memory database (for tests).
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    /// Get a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Bound the wait for the stack lock taken by override writes.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Create a new StateManager with a database at the specified path.
    #[instrument(skip(db_path))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Initializing state manager at {:?}", db_path);

        let in_memory = db_path == Path::new(":memory:");

        if !in_memory {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(|e| DevarchError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        let path = db_path
            .to_str()
            .ok_or_else(|| DevarchError::InvalidConfig { reason: "Invalid database path".to_string() })?;
        let mut options = SqliteConnectOptions::from_str(path)
            .map_err(|e| DevarchError::Database(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true);

        // Each connection to ":memory:" would otherwise see its own database.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options = options.journal_mode(SqliteJournalMode::Wal).busy_timeout(BUSY_TIMEOUT);
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| DevarchError::Database(e.to_string()))?;

        let manager = Self { pool, locks: StackLocks::new(), lock_timeout: DEFAULT_LOCK_TIMEOUT };

        manager.run_migrations().await?;

        info!("State manager initialized successfully");
        Ok(manager)
    }

    /// Open the database at `config.database_path` with the configured lock timeout.
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        Ok(Self::new(&config.database_path).await?.with_lock_timeout(config.lock_timeout()))
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        migrations::run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    /// Whether an apply or override write currently holds the stack.
    pub async fn is_stack_locked(&self, stack_id: &str) -> bool {
        self.locks.is_locked(stack_id).await
    }

    // ========================
    // Template Operations
    // ========================

    /// Insert a new template at revision 1.
    #[instrument(skip(self, template), fields(template_id = %template.id))]
    pub async fn insert_template(&self, template: &ServiceTemplate) -> Result<ServiceTemplate> {
        if template.id.trim().is_empty() || template.name.trim().is_empty() {
            return Err(DevarchError::validation("template id and name are required"));
        }

        let mut tx = self.pool.begin().await.map_err(db_error("insert_template"))?;
        if queries::fetch_template(&mut tx, &template.id).await?.is_some() {
            return Err(DevarchError::NameConflict {
                name: template.id.clone(),
                reason: "a template with this id already exists".to_string(),
            });
        }

        let mut stored = template.clone();
        stored.revision = 1;
        queries::upsert_template(&mut tx, &stored).await?;
        tx.commit().await.map_err(db_error("insert_template"))?;

        Ok(stored)
    }

    /// Replace a template's definition and bump its revision.
    ///
    /// Every instance of the template sees the change on its next plan.
    #[instrument(skip(self, template), fields(template_id = %template.id))]
    pub async fn update_template(&self, template: &ServiceTemplate) -> Result<ServiceTemplate> {
        let mut tx = self.pool.begin().await.map_err(db_error("update_template"))?;
        let current = queries::fetch_template(&mut tx, &template.id)
            .await?
            .ok_or_else(|| DevarchError::TemplateNotFound { template: template.id.clone() })?;

        let mut stored = template.clone();
        stored.revision = current.revision + 1;
        queries::upsert_template(&mut tx, &stored).await?;
        tx.commit().await.map_err(db_error("update_template"))?;

        info!(revision = stored.revision, "Template updated");
        Ok(stored)
    }

    pub async fn get_template(&self, template_id: &str) -> Result<ServiceTemplate> {
        let mut conn = self.pool.acquire().await.map_err(db_error("get_template"))?;
        queries::fetch_template(&mut conn, template_id)
            .await?
            .ok_or_else(|| DevarchError::TemplateNotFound { template: template_id.to_string() })
    }

    pub async fn list_templates(&self) -> Result<Vec<ServiceTemplate>> {
        let mut conn = self.pool.acquire().await.map_err(db_error("list_templates"))?;
        queries::fetch_templates(&mut conn).await
    }

    // ========================
    // Stack Operations
    // ========================

    /// Create an empty stack. Names are unique among active stacks.
    #[instrument(skip(self, description))]
    pub async fn create_stack(&self, name: &str, description: &str) -> Result<Stack> {
        naming::validate_name(name)?;

        let mut tx = self.pool.begin().await.map_err(db_error("create_stack"))?;
        let stack = new_stack(&mut tx, name, description).await?;
        tx.commit().await.map_err(db_error("create_stack"))?;

        info!(stack_id = %stack.id, "Stack created");
        Ok(stack)
    }

    /// Get a stack by ID, tombstoned or not.
    pub async fn get_stack(&self, stack_id: &str) -> Result<Stack> {
        let mut conn = self.pool.acquire().await.map_err(db_error("get_stack"))?;
        queries::fetch_stack(&mut conn, stack_id)
            .await?
            .ok_or_else(|| DevarchError::StackNotFound { stack: stack_id.to_string() })
    }

    /// Get an active stack by name.
    pub async fn get_stack_by_name(&self, name: &str) -> Result<Stack> {
        let mut conn = self.pool.acquire().await.map_err(db_error("get_stack_by_name"))?;
        queries::fetch_active_stack_by_name(&mut conn, name)
            .await?
            .ok_or_else(|| DevarchError::StackNotFound { stack: name.to_string() })
    }

    /// Active stacks, by name.
    pub async fn list_stacks(&self) -> Result<Vec<Stack>> {
        let mut conn = self.pool.acquire().await.map_err(db_error("list_stacks"))?;
        queries::fetch_stacks(&mut conn, false).await
    }

    /// Tombstoned stacks, most recently deleted first.
    pub async fn list_trash(&self) -> Result<Vec<Stack>> {
        let mut conn = self.pool.acquire().await.map_err(db_error("list_trash"))?;
        queries::fetch_stacks(&mut conn, true).await
    }

    /// Tombstone a stack and its active instances.
    ///
    /// Nothing is torn down until the next apply of the stack.
    #[instrument(skip(self))]
    pub async fn soft_delete_stack(&self, stack_id: &str) -> Result<Stack> {
        let mut tx = self.pool.begin().await.map_err(db_error("soft_delete_stack"))?;
        let stack = active_stack(&mut tx, stack_id).await?;
        let now = Utc::now();
        queries::set_stack_deleted_at(&mut tx, stack_id, Some(now)).await?;
        queries::tombstone_instances(&mut tx, stack_id, now).await?;
        tx.commit().await.map_err(db_error("soft_delete_stack"))?;

        info!(stack = %stack.name, "Stack moved to trash");
        self.get_stack(stack_id).await
    }

    /// Bring a stack back from the trash together with the instances deleted with it.
    #[instrument(skip(self))]
    pub async fn restore_stack(&self, stack_id: &str) -> Result<Stack> {
        let mut tx = self.pool.begin().await.map_err(db_error("restore_stack"))?;
        let stack = queries::fetch_stack(&mut tx, stack_id)
            .await?
            .ok_or_else(|| DevarchError::StackNotFound { stack: stack_id.to_string() })?;
        let Some(deleted_at) = stack.lifecycle.deleted_at() else {
            return Err(DevarchError::validation(format!("stack {} is not deleted", stack.name)));
        };
        if queries::fetch_active_stack_by_name(&mut tx, &stack.name).await?.is_some() {
            return Err(DevarchError::NameConflict {
                name: stack.name.clone(),
                reason: "an active stack already has this name".to_string(),
            });
        }
        ensure_no_pending_teardown(&mut tx, &stack.name, stack_id).await?;

        queries::set_stack_deleted_at(&mut tx, stack_id, None).await?;
        queries::restore_instances_deleted_at(&mut tx, stack_id, deleted_at).await?;
        tx.commit().await.map_err(db_error("restore_stack"))?;

        info!(stack = %stack.name, "Stack restored");
        self.get_stack(stack_id).await
    }

    /// Permanently remove a tombstoned stack.
    ///
    /// Refused while any instance still has an applied snapshot: the stack's
    /// deletion has to be applied first.
    #[instrument(skip(self))]
    pub async fn purge_stack(&self, stack_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error("purge_stack"))?;
        let stack = queries::fetch_stack(&mut tx, stack_id)
            .await?
            .ok_or_else(|| DevarchError::StackNotFound { stack: stack_id.to_string() })?;
        if stack.lifecycle.is_active() {
            return Err(DevarchError::validation(format!(
                "stack {} must be deleted before it can be purged",
                stack.name
            )));
        }
        let applied = queries::count_applied_instances(&mut tx, stack_id).await?;
        if applied > 0 {
            return Err(DevarchError::validation(format!(
                "stack {} still has {} applied instance(s); apply its deletion first",
                stack.name, applied
            )));
        }

        queries::purge_stack(&mut tx, stack_id).await?;
        tx.commit().await.map_err(db_error("purge_stack"))?;

        info!(stack = %stack.name, "Stack purged");
        Ok(())
    }

    /// Copy a stack's active instances, overrides and explicit wires into a new stack.
    /// Applied snapshots are not copied: everything in the clone plans as a create.
    #[instrument(skip(self))]
    pub async fn clone_stack(&self, source_id: &str, new_name: &str) -> Result<Stack> {
        naming::validate_name(new_name)?;

        let mut tx = self.pool.begin().await.map_err(db_error("clone_stack"))?;
        let clone = clone_into(&mut tx, source_id, new_name).await?;
        tx.commit().await.map_err(db_error("clone_stack"))?;

        info!(stack_id = %clone.id, "Stack cloned");
        Ok(clone)
    }

    /// Rename a stack: clone it under the new name and tombstone the original,
    /// in one transaction.
    #[instrument(skip(self))]
    pub async fn rename_stack(&self, stack_id: &str, new_name: &str) -> Result<Stack> {
        naming::validate_name(new_name)?;

        let mut tx = self.pool.begin().await.map_err(db_error("rename_stack"))?;
        let renamed = clone_into(&mut tx, stack_id, new_name).await?;
        let now = Utc::now();
        queries::set_stack_deleted_at(&mut tx, stack_id, Some(now)).await?;
        queries::tombstone_instances(&mut tx, stack_id, now).await?;
        tx.commit().await.map_err(db_error("rename_stack"))?;

        info!(new_stack_id = %renamed.id, "Stack renamed");
        Ok(renamed)
    }

    // ========================
    // Instance Operations
    // ========================

    /// Bind a template into a stack.
    #[instrument(skip(self, description), fields(stack_id = %stack_id, instance = %name))]
    pub async fn create_instance(
        &self,
        stack_id: &str,
        name: &str,
        template_id: &str,
        description: &str,
    ) -> Result<Instance> {
        naming::validate_name(name)?;

        let mut tx = self.pool.begin().await.map_err(db_error("create_instance"))?;
        let stack = active_stack(&mut tx, stack_id).await?;
        naming::validate_container_name(&stack.name, name)?;
        if queries::fetch_template(&mut tx, template_id).await?.is_none() {
            return Err(DevarchError::TemplateNotFound { template: template_id.to_string() });
        }

        let instance = Instance {
            uid: Uuid::new_v4().to_string(),
            stack_id: stack_id.to_string(),
            name: name.to_string(),
            template_id: template_id.to_string(),
            description: description.to_string(),
            lifecycle: Lifecycle::Active,
            revision: 1,
            overrides: OverrideBundle::default(),
            applied: None,
        };
        ensure_instance_name_free(&mut tx, stack_id, name).await?;
        queries::insert_instance(&mut tx, &instance).await?;
        tx.commit().await.map_err(db_error("create_instance"))?;

        Ok(instance)
    }

    /// Copy an instance (template and overrides) under a new name,
    /// `<source>-copy` by default.
    #[instrument(skip(self), fields(stack_id = %stack_id))]
    pub async fn duplicate_instance(
        &self,
        stack_id: &str,
        source: &str,
        new_name: Option<&str>,
    ) -> Result<Instance> {
        let name = new_name.map(str::to_string).unwrap_or_else(|| format!("{}-copy", source));
        naming::validate_name(&name)?;

        let mut tx = self.pool.begin().await.map_err(db_error("duplicate_instance"))?;
        let stack = active_stack(&mut tx, stack_id).await?;
        naming::validate_container_name(&stack.name, &name)?;
        let original = queries::fetch_active_instance(&mut tx, stack_id, source)
            .await?
            .ok_or_else(|| instance_not_found(&stack, source))?;

        let copy = Instance {
            uid: Uuid::new_v4().to_string(),
            name: name.clone(),
            revision: 1,
            applied: None,
            ..original
        };
        ensure_instance_name_free(&mut tx, stack_id, &name).await?;
        queries::insert_instance(&mut tx, &copy).await?;
        tx.commit().await.map_err(db_error("duplicate_instance"))?;

        Ok(copy)
    }

    /// Get an active instance by name.
    pub async fn get_instance(&self, stack_id: &str, name: &str) -> Result<Instance> {
        let mut conn = self.pool.acquire().await.map_err(db_error("get_instance"))?;
        let stack = queries::fetch_stack(&mut conn, stack_id)
            .await?
            .ok_or_else(|| DevarchError::StackNotFound { stack: stack_id.to_string() })?;
        queries::fetch_active_instance(&mut conn, stack_id, name)
            .await?
            .ok_or_else(|| instance_not_found(&stack, name))
    }

    /// Active instances of a stack, by name.
    pub async fn list_instances(&self, stack_id: &str) -> Result<Vec<Instance>> {
        let mut conn = self.pool.acquire().await.map_err(db_error("list_instances"))?;
        let mut instances = queries::fetch_instances(&mut conn, stack_id).await?;
        instances.retain(Instance::is_active);
        Ok(instances)
    }

    /// Tombstone an instance. Its container goes away on the next apply.
    #[instrument(skip(self), fields(stack_id = %stack_id, instance = %name))]
    pub async fn soft_delete_instance(&self, stack_id: &str, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error("soft_delete_instance"))?;
        let stack = active_stack(&mut tx, stack_id).await?;
        let mut instance = queries::fetch_active_instance(&mut tx, stack_id, name)
            .await?
            .ok_or_else(|| instance_not_found(&stack, name))?;

        instance.lifecycle = Lifecycle::Deleted { at: Utc::now() };
        instance.revision += 1;
        queries::update_instance(&mut tx, &instance).await?;
        tx.commit().await.map_err(db_error("soft_delete_instance"))?;
        Ok(())
    }

    /// Restore a tombstoned instance by uid (names may repeat in the trash).
    #[instrument(skip(self), fields(stack_id = %stack_id, instance_uid = %uid))]
    pub async fn restore_instance(&self, stack_id: &str, uid: &str) -> Result<Instance> {
        let mut tx = self.pool.begin().await.map_err(db_error("restore_instance"))?;
        let stack = active_stack(&mut tx, stack_id).await?;
        let mut instance = queries::fetch_instance(&mut tx, uid)
            .await?
            .filter(|i| i.stack_id == stack_id)
            .ok_or_else(|| instance_not_found(&stack, uid))?;
        if instance.is_active() {
            return Err(DevarchError::validation(format!("instance {} is not deleted", instance.name)));
        }
        ensure_instance_name_free(&mut tx, stack_id, &instance.name).await?;

        instance.lifecycle = Lifecycle::Active;
        instance.revision += 1;
        queries::update_instance(&mut tx, &instance).await?;
        tx.commit().await.map_err(db_error("restore_instance"))?;
        Ok(instance)
    }

    // ========================
    // Override Operations
    // ========================

    /// Set one override kind on an instance, replacing any previous value of that kind.
    ///
    /// Reserved identity keys are rejected here rather than silently dropped
    /// at resolution time.
    #[instrument(skip(self, set), fields(stack_id = %stack_id, instance = %instance, kind = %set.kind()))]
    pub async fn set_override(&self, stack_id: &str, instance: &str, set: OverrideSet) -> Result<Instance> {
        reject_reserved_keys(&set)?;
        self.update_overrides(stack_id, instance, move |bundle| {
            bundle.set(set);
            Ok(())
        })
        .await
    }

    /// Return one override kind to inheriting from the template.
    #[instrument(skip(self), fields(stack_id = %stack_id, instance = %instance))]
    pub async fn clear_override(&self, stack_id: &str, instance: &str, kind: OverrideKind) -> Result<Instance> {
        self.update_overrides(stack_id, instance, move |bundle| bundle.clear(kind)).await
    }

    async fn update_overrides<F>(&self, stack_id: &str, name: &str, update: F) -> Result<Instance>
    where
        F: FnOnce(&mut OverrideBundle) -> Result<()> + Send,
    {
        let lock = self.acquire_stack_lock(stack_id, self.lock_timeout).await?;
        let mut unit = self.begin_atomic(lock).await?;

        let state = unit.load_stack_state().await?;
        if !state.stack.lifecycle.is_active() {
            return Err(DevarchError::StackDeleted { stack: state.stack.name });
        }
        let mut instance = state
            .instances
            .iter()
            .find(|i| i.is_active() && i.name == name)
            .cloned()
            .ok_or_else(|| instance_not_found(&state.stack, name))?;

        update(&mut instance.overrides)?;
        unit.save_overrides(&instance.uid, &instance.overrides).await?;
        unit.commit().await?;

        instance.revision += 1;
        Ok(instance)
    }

    // ========================
    // Wire Operations
    // ========================

    /// Pin an import of `wire.consumer` to a specific provider.
    ///
    /// Contract compatibility is checked at plan time, when both templates
    /// are resolved.
    #[instrument(skip(self, wire), fields(stack_id = %stack_id, consumer = %wire.consumer, import = %wire.import_name))]
    pub async fn add_wire(&self, stack_id: &str, wire: &ExplicitWire) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error("add_wire"))?;
        let stack = active_stack(&mut tx, stack_id).await?;
        for name in [&wire.consumer, &wire.provider] {
            if queries::fetch_active_instance(&mut tx, stack_id, name).await?.is_none() {
                return Err(instance_not_found(&stack, name));
            }
        }
        if wire.consumer == wire.provider {
            return Err(DevarchError::validation(format!("{} cannot be wired to itself", wire.consumer)));
        }

        queries::insert_wire(&mut tx, stack_id, wire).await?;
        queries::bump_stack_revision(&mut tx, stack_id).await?;
        tx.commit().await.map_err(db_error("add_wire"))?;
        Ok(())
    }

    /// Drop an explicit wire; the import falls back to auto-wiring.
    #[instrument(skip(self), fields(stack_id = %stack_id))]
    pub async fn remove_wire(&self, stack_id: &str, consumer: &str, import_name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error("remove_wire"))?;
        active_stack(&mut tx, stack_id).await?;
        if !queries::delete_wire(&mut tx, stack_id, consumer, import_name).await? {
            return Err(DevarchError::validation(format!(
                "no explicit wire for {}.{}",
                consumer, import_name
            )));
        }
        queries::bump_stack_revision(&mut tx, stack_id).await?;
        tx.commit().await.map_err(db_error("remove_wire"))?;
        Ok(())
    }

    pub async fn list_wires(&self, stack_id: &str) -> Result<Vec<ExplicitWire>> {
        let mut conn = self.pool.acquire().await.map_err(db_error("list_wires"))?;
        queries::fetch_wires(&mut conn, stack_id).await
    }
}

fn instance_not_found(stack: &Stack, instance: &str) -> DevarchError {
    DevarchError::InstanceNotFound { stack: stack.name.clone(), instance: instance.to_string() }
}

async fn active_stack(conn: &mut SqliteConnection, stack_id: &str) -> Result<Stack> {
    let stack = queries::fetch_stack(conn, stack_id)
        .await?
        .ok_or_else(|| DevarchError::StackNotFound { stack: stack_id.to_string() })?;
    if !stack.lifecycle.is_active() {
        return Err(DevarchError::StackDeleted { stack: stack.name });
    }
    Ok(stack)
}

async fn ensure_instance_name_free(conn: &mut SqliteConnection, stack_id: &str, name: &str) -> Result<()> {
    if queries::fetch_active_instance(conn, stack_id, name).await?.is_some() {
        return Err(DevarchError::NameConflict {
            name: name.to_string(),
            reason: "an active instance in this stack already has this name".to_string(),
        });
    }
    Ok(())
}

async fn ensure_no_pending_teardown(conn: &mut SqliteConnection, name: &str, except: &str) -> Result<()> {
    let pending = queries::count_pending_teardowns(conn, name, except).await?;
    if pending > 0 {
        return Err(DevarchError::NameConflict {
            name: name.to_string(),
            reason: format!(
                "a deleted stack with this name still has {} applied instance(s); apply its deletion first",
                pending
            ),
        });
    }
    Ok(())
}

async fn new_stack(conn: &mut SqliteConnection, name: &str, description: &str) -> Result<Stack> {
    if queries::fetch_active_stack_by_name(conn, name).await?.is_some() {
        return Err(DevarchError::NameConflict {
            name: name.to_string(),
            reason: "an active stack already has this name".to_string(),
        });
    }
    ensure_no_pending_teardown(conn, name, "").await?;

    let stack = Stack {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        description: description.to_string(),
        lifecycle: Lifecycle::Active,
        revision: 1,
        created_at: Utc::now(),
    };
    queries::insert_stack(conn, &stack).await?;
    Ok(stack)
}

async fn clone_into(conn: &mut SqliteConnection, source_id: &str, new_name: &str) -> Result<Stack> {
    let source = active_stack(conn, source_id).await?;
    let clone = new_stack(conn, new_name, &source.description).await?;

    for instance in queries::fetch_instances(conn, source_id).await?.into_iter().filter(Instance::is_active) {
        naming::validate_container_name(&clone.name, &instance.name)?;
        let copy = Instance {
            uid: Uuid::new_v4().to_string(),
            stack_id: clone.id.clone(),
            revision: 1,
            applied: None,
            ..instance
        };
        queries::insert_instance(conn, &copy).await?;
    }

    for wire in queries::fetch_wires(conn, source_id).await? {
        queries::insert_wire(conn, &clone.id, &wire).await?;
    }

    Ok(clone)
}

fn reject_reserved_keys(set: &OverrideSet) -> Result<()> {
    let reserved = match set {
        OverrideSet::EnvVars(env) => {
            env.keys().find(|k| naming::is_reserved_env(k)).map(|k| (k, naming::ENV_PREFIX))
        }
        OverrideSet::Labels(labels) => {
            labels.keys().find(|k| naming::is_reserved_label(k)).map(|k| (k, naming::LABEL_PREFIX))
        }
        _ => None,
    };

    match reserved {
        Some((key, prefix)) => {
            Err(DevarchError::ReservedKey { key: key.clone(), prefix: prefix.to_string() })
        }
        None => Ok(()),
    }
}

#[async_trait]
impl Repository for StateManager {
    #[instrument(skip(self))]
    async fn load_stack(&self, stack_id: &str) -> Result<Stack> {
        self.get_stack(stack_id).await
    }

    #[instrument(skip(self))]
    async fn load_instances(&self, stack_id: &str) -> Result<Vec<Instance>> {
        let mut conn = self.pool.acquire().await.map_err(db_error("load_instances"))?;
        queries::fetch_instances(&mut conn, stack_id).await
    }

    async fn load_overrides(&self, instance_uid: &str) -> Result<OverrideBundle> {
        let mut conn = self.pool.acquire().await.map_err(db_error("load_overrides"))?;
        queries::fetch_overrides(&mut conn, instance_uid).await
    }

    async fn load_template(&self, template_id: &str) -> Result<ServiceTemplate> {
        self.get_template(template_id).await
    }

    async fn load_wires(&self, stack_id: &str) -> Result<Vec<ExplicitWire>> {
        self.list_wires(stack_id).await
    }

    async fn load_applied_edges(&self, stack_id: &str) -> Result<Vec<WiringEdge>> {
        let mut conn = self.pool.acquire().await.map_err(db_error("load_applied_edges"))?;
        queries::fetch_applied_edges(&mut conn, stack_id).await
    }

    /// All rows from one read transaction.
    #[instrument(skip(self))]
    async fn load_stack_state(&self, stack_id: &str) -> Result<StackState> {
        let mut tx = self.pool.begin().await.map_err(db_error("load_stack_state"))?;
        let state = queries::load_stack_state(&mut tx, stack_id).await?;
        tx.commit().await.map_err(db_error("load_stack_state"))?;
        Ok(state)
    }

    async fn acquire_stack_lock(&self, stack_id: &str, timeout: Duration) -> Result<StackLockGuard> {
        self.locks.acquire(stack_id, timeout).await
    }

    async fn begin_atomic(&self, lock: StackLockGuard) -> Result<Box<dyn AtomicUnit>> {
        Ok(Box::new(SqliteAtomicUnit::begin(&self.pool, lock).await?))
    }
}
