//! Plan engine: loads a stack and computes its plan.

use crate::error::{DevarchError, Result};
use crate::observability::metrics;
use crate::plan::{compute, Plan, PlanOptions};
use crate::repository::Repository;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Read-only planner. Safe to call concurrently and repeatedly.
#[derive(Clone)]
pub struct PlanEngine {
    repo: Arc<dyn Repository>,
    options: PlanOptions,
}

impl PlanEngine {
    pub fn new(repo: Arc<dyn Repository>, options: PlanOptions) -> Self {
        Self { repo, options }
    }

    /// Generate a fresh plan for a stack.
    #[instrument(skip(self), fields(stack_id = %stack_id))]
    pub async fn generate_plan(&self, stack_id: &str) -> Result<Plan> {
        let state = self.repo.load_stack_state(stack_id).await?;
        let plan = compute(&state, self.options)?;

        metrics::record_plan_generated(plan.diagnostics.iter().map(|d| d.code.as_str()));
        info!(
            creates = plan.creates.len(),
            updates = plan.updates.len(),
            deletes = plan.deletes.len(),
            edges_added = plan.wiring.added.len(),
            edges_removed = plan.wiring.removed.len(),
            diagnostics = plan.diagnostics.len(),
            fingerprint = %plan.fingerprint,
            "Plan generated"
        );

        Ok(plan)
    }

    /// Like [`generate_plan`](Self::generate_plan), abandoned as soon as `cancel` fires.
    /// Planning has no side effects, so nothing needs undoing.
    pub async fn generate_plan_cancellable(
        &self,
        stack_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Plan> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DevarchError::Cancelled { operation: format!("plan {}", stack_id) }),
            plan = self.generate_plan(stack_id) => plan,
        }
    }
}
