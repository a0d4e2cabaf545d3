//! Apply executor.
//!
//! Moves a stack from its applied state to the state described by a plan:
//!
//! ```text
//! Pending -> Locking -> Verifying -> Executing -> Committed
//!                                            \-> RolledBack
//! ```
//!
//! The stack lock is held from `Locking` until the atomic unit commits or
//! rolls back. Cancellation is honoured only while waiting for the lock;
//! once execution starts the apply always runs to completion.

pub mod lock;

pub use lock::{StackLockGuard, StackLocks};

use crate::config::EngineConfig;
use crate::error::{DevarchError, Result};
use crate::observability::metrics;
use crate::plan::{self, fingerprint, Plan};
use crate::repository::{AtomicUnit, Repository};
use crate::types::AppliedSnapshot;
use crate::wiring::WiringEdge;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Apply state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyPhase {
    Pending,
    Locking,
    Verifying,
    Executing,
    Committed,
    RolledBack,
}

impl std::fmt::Display for ApplyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApplyPhase::Pending => "pending",
            ApplyPhase::Locking => "locking",
            ApplyPhase::Verifying => "verifying",
            ApplyPhase::Executing => "executing",
            ApplyPhase::Committed => "committed",
            ApplyPhase::RolledBack => "rolled_back",
        };
        write!(f, "{}", s)
    }
}

/// Caller choices for one apply.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// The caller has reviewed the plan's warnings and accepts them.
    pub confirm_warnings: bool,
    /// Overrides the configured lock timeout.
    pub lock_timeout: Option<Duration>,
}

/// Outcome of a committed apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub stack_id: String,
    pub plan_id: String,
    pub fingerprint: String,
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub edges_added: Vec<WiringEdge>,
    pub edges_removed: Vec<WiringEdge>,
    pub startup_order: Vec<String>,
    pub phase: ApplyPhase,
}

/// Executes plans against the repository.
#[derive(Clone)]
pub struct ApplyExecutor {
    repo: Arc<dyn Repository>,
    config: EngineConfig,
}

impl ApplyExecutor {
    pub fn new(repo: Arc<dyn Repository>, config: EngineConfig) -> Self {
        Self { repo, config }
    }

    /// Apply a plan without external cancellation.
    pub async fn apply(&self, plan: &Plan, options: ApplyOptions) -> Result<ApplyResult> {
        self.apply_with_cancel(plan, options, &CancellationToken::new()).await
    }

    /// Apply a plan. `cancel` is honoured only until the stack lock is held.
    #[instrument(skip_all, fields(stack_id = %plan.stack_id, plan_id = %plan.id))]
    pub async fn apply_with_cancel(
        &self,
        plan: &Plan,
        options: ApplyOptions,
        cancel: &CancellationToken,
    ) -> Result<ApplyResult> {
        let started = Instant::now();
        let result = self.run(plan, &options, cancel).await;

        let outcome = match &result {
            Ok(_) => "committed",
            Err(DevarchError::StalePlan { .. }) => "stale",
            Err(DevarchError::LockTimeout { .. }) => "lock_timeout",
            Err(DevarchError::PlanBlocked { .. }) => "blocked",
            Err(DevarchError::Cancelled { .. }) => "cancelled",
            Err(_) => "rolled_back",
        };
        metrics::record_apply(outcome, started.elapsed());

        result
    }

    async fn run(
        &self,
        plan: &Plan,
        options: &ApplyOptions,
        cancel: &CancellationToken,
    ) -> Result<ApplyResult> {
        let stack_id = plan.stack_id.as_str();

        // Pending
        let warnings_confirmed = options.confirm_warnings || !self.config.confirm_warnings_required;
        let blocking = plan.blocking_diagnostics(warnings_confirmed);
        if !blocking.is_empty() {
            let reasons: Vec<&str> = blocking.iter().map(|d| d.message.as_str()).collect();
            return Err(DevarchError::PlanBlocked {
                stack_id: stack_id.to_string(),
                reason: reasons.join("; "),
            });
        }

        // Locking
        let timeout = options.lock_timeout.unwrap_or_else(|| self.config.lock_timeout());
        info!(phase = %ApplyPhase::Locking, timeout_ms = timeout.as_millis() as u64, "Waiting for stack lock");
        let lock = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Apply cancelled while waiting for the stack lock");
                return Err(DevarchError::Cancelled { operation: format!("apply {}", stack_id) });
            }
            lock = self.repo.acquire_stack_lock(stack_id, timeout) => lock?,
        };
        let mut unit = self.repo.begin_atomic(lock).await?;

        // Verifying
        info!(phase = %ApplyPhase::Verifying, "Verifying plan fingerprint");
        let current = match verify(unit.as_mut(), plan).await {
            Ok(current) => current,
            Err(e) => {
                if let Err(rollback) = unit.rollback().await {
                    error!(error = %rollback, "Rollback after failed verification also failed");
                }
                return Err(e);
            }
        };

        // Executing
        info!(phase = %ApplyPhase::Executing, changes = current.changes().count(), "Executing plan");
        if let Err(source) = execute(unit.as_mut(), &current).await {
            error!(error = %source, phase = %ApplyPhase::RolledBack, "Apply failed, rolling back");
            if let Err(rollback) = unit.rollback().await {
                error!(error = %rollback, "Rollback failed");
            }
            return Err(DevarchError::ApplyExecution {
                stack_id: stack_id.to_string(),
                source: Box::new(source),
            });
        }

        if let Err(source) = unit.commit().await {
            error!(error = %source, phase = %ApplyPhase::RolledBack, "Commit failed");
            return Err(DevarchError::ApplyExecution {
                stack_id: stack_id.to_string(),
                source: Box::new(source),
            });
        }

        if cancel.is_cancelled() {
            info!("Cancellation requested during execution; apply already completed");
        }

        info!(
            phase = %ApplyPhase::Committed,
            created = current.creates.len(),
            updated = current.updates.len(),
            deleted = current.deletes.len(),
            "Apply committed"
        );

        Ok(ApplyResult {
            stack_id: stack_id.to_string(),
            plan_id: plan.id.clone(),
            fingerprint: plan.fingerprint.clone(),
            created: current.creates.iter().map(|c| c.instance.clone()).collect(),
            updated: current.updates.iter().map(|c| c.instance.clone()).collect(),
            deleted: current.deletes.iter().map(|c| c.instance.clone()).collect(),
            edges_added: current.wiring.added.clone(),
            edges_removed: current.wiring.removed.clone(),
            startup_order: current.startup_order.clone(),
            phase: ApplyPhase::Committed,
        })
    }
}

/// Re-plan inside the unit and make sure nothing changed since `plan` was made.
async fn verify(unit: &mut dyn AtomicUnit, plan: &Plan) -> Result<Plan> {
    let state = unit.load_stack_state().await?;
    let current = fingerprint::compute(&state)?;

    if current.fingerprint != plan.fingerprint {
        let changed = fingerprint::changed_instances(&plan.instance_digests, &current.instances);
        warn!(changed = ?changed, "Plan is stale");
        return Err(DevarchError::StalePlan {
            stack_id: plan.stack_id.clone(),
            changed_instances: changed,
        });
    }

    plan::compute(&state, plan.options)
}

/// Write the plan: creates, updates, wiring, then deletes.
async fn execute(unit: &mut dyn AtomicUnit, plan: &Plan) -> Result<()> {
    let state = unit.load_stack_state().await?;
    let now = Utc::now();

    for change in plan.creates.iter().chain(&plan.updates) {
        let mut instance = state.instance(&change.instance_uid).cloned().ok_or_else(|| {
            DevarchError::InstanceNotFound {
                stack: plan.stack_name.clone(),
                instance: change.instance.clone(),
            }
        })?;
        let effective = change.effective.clone().ok_or_else(|| {
            DevarchError::Internal(format!("{} change for {} has no config", change.action, change.instance))
        })?;
        let template_revision = state.template(&instance.template_id)?.revision;
        let digest = plan
            .instance_digests
            .get(&instance.uid)
            .map(|d| d.digest.clone())
            .unwrap_or_default();

        instance.applied = Some(AppliedSnapshot {
            template_id: instance.template_id.clone(),
            template_revision,
            overrides: instance.overrides.clone(),
            effective,
            digest,
            applied_at: now,
        });
        instance.revision += 1;
        unit.save_instance(&instance).await?;
    }

    if !plan.wiring.is_empty() {
        unit.replace_applied_edges(&plan.edges).await?;
    }

    for change in &plan.deletes {
        unit.soft_delete(&change.instance_uid, now).await?;
    }

    Ok(())
}
