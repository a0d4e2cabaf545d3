//! SQLite atomic unit: one transaction plus the stack lock it was started with.

use super::queries::{self, db_error};
use crate::apply::lock::StackLockGuard;
use crate::error::{DevarchError, Result};
use crate::repository::{AtomicUnit, StackState};
use crate::types::{Instance, OverrideBundle};
use crate::wiring::WiringEdge;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::time::Instant;
use tracing::{debug, info, instrument};

pub(super) struct SqliteAtomicUnit {
    stack_id: String,
    holder: String,
    tx: Transaction<'static, Sqlite>,
    lock: StackLockGuard,
}

impl SqliteAtomicUnit {
    /// Open the transaction and claim the stack's lock row.
    ///
    /// The claim is the first statement, so the unit holds SQLite's write
    /// lock from the start and never has to upgrade a read snapshot.
    #[instrument(skip_all, fields(stack_id = %lock.stack_id()))]
    pub(super) async fn begin(pool: &SqlitePool, lock: StackLockGuard) -> Result<Self> {
        let started = Instant::now();
        let stack_id = lock.stack_id().to_string();
        let holder = uuid::Uuid::new_v4().to_string();

        let contention = |e: sqlx::Error, operation: &'static str| {
            if queries::is_contention(&e) {
                DevarchError::LockTimeout { stack_id: stack_id.clone(), waited: started.elapsed() }
            } else {
                db_error(operation)(e)
            }
        };

        let mut tx = pool.begin().await.map_err(|e| contention(e, "begin_atomic"))?;
        sqlx::query("INSERT INTO stack_locks (stack_id, holder, acquired_at) VALUES (?, ?, ?)")
            .bind(&stack_id)
            .bind(&holder)
            .bind(queries::format_time(Utc::now()))
            .execute(&mut *tx)
            .await
            .map_err(|e| contention(e, "claim_stack_lock"))?;

        debug!(holder = %holder, "Atomic unit started");
        Ok(Self { stack_id, holder, tx, lock })
    }
}

#[async_trait]
impl AtomicUnit for SqliteAtomicUnit {
    fn stack_id(&self) -> &str {
        &self.stack_id
    }

    async fn load_stack_state(&mut self) -> Result<StackState> {
        queries::load_stack_state(&mut self.tx, &self.stack_id).await
    }

    #[instrument(skip_all, fields(stack_id = %self.stack_id, instance = %instance.name))]
    async fn save_instance(&mut self, instance: &Instance) -> Result<()> {
        if instance.stack_id != self.stack_id {
            return Err(DevarchError::validation(format!(
                "instance {} belongs to stack {}, not {}",
                instance.name, instance.stack_id, self.stack_id
            )));
        }
        queries::update_instance(&mut self.tx, instance).await
    }

    #[instrument(skip_all, fields(stack_id = %self.stack_id, instance_uid = %instance_uid))]
    async fn save_overrides(&mut self, instance_uid: &str, bundle: &OverrideBundle) -> Result<()> {
        let result = sqlx::query(
            "UPDATE instances SET revision = revision + 1 WHERE uid = ? AND stack_id = ?",
        )
        .bind(instance_uid)
        .bind(&self.stack_id)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("save_overrides"))?;

        if result.rows_affected() == 0 {
            return Err(DevarchError::InstanceNotFound {
                stack: self.stack_id.clone(),
                instance: instance_uid.to_string(),
            });
        }
        queries::write_overrides(&mut self.tx, instance_uid, bundle).await
    }

    #[instrument(skip_all, fields(stack_id = %self.stack_id, instance_uid = %instance_uid))]
    async fn soft_delete(&mut self, instance_uid: &str, at: DateTime<Utc>) -> Result<()> {
        if !queries::soft_delete_instance(&mut self.tx, &self.stack_id, instance_uid, at).await? {
            return Err(DevarchError::InstanceNotFound {
                stack: self.stack_id.clone(),
                instance: instance_uid.to_string(),
            });
        }
        Ok(())
    }

    async fn replace_applied_edges(&mut self, edges: &[WiringEdge]) -> Result<()> {
        queries::replace_applied_edges(&mut self.tx, &self.stack_id, edges).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self { stack_id, holder, mut tx, lock } = *self;

        sqlx::query("DELETE FROM stack_locks WHERE stack_id = ? AND holder = ?")
            .bind(&stack_id)
            .bind(&holder)
            .execute(&mut *tx)
            .await
            .map_err(db_error("release_stack_lock"))?;
        tx.commit().await.map_err(db_error("commit"))?;

        info!(stack_id = %stack_id, held_ms = lock.held_for().as_millis() as u64, "Atomic unit committed");
        drop(lock);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let Self { stack_id, tx, lock, .. } = *self;

        tx.rollback().await.map_err(db_error("rollback"))?;

        info!(stack_id = %stack_id, held_ms = lock.held_for().as_millis() as u64, "Atomic unit rolled back");
        drop(lock);
        Ok(())
    }
}
