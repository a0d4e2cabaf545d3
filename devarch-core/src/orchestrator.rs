//! Stack orchestrator: one handle over planning, applying and inspection.
//!
//! Callers (an API handler, a CLI) hold a `StackOrchestrator` and never talk
//! to the resolver or the wiring builder directly.

use crate::apply::{ApplyExecutor, ApplyOptions, ApplyResult};
use crate::config::EngineConfig;
use crate::error::{DevarchError, Result};
use crate::plan::{Plan, PlanEngine, PlanOptions};
use crate::repository::{Repository, StackState};
use crate::resolver;
use crate::types::{EffectiveConfig, OverridesApplied};
use crate::wiring::{self, Diagnostic, WiringGraph};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Everything a manifest emitter needs for one stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmitterInput {
    pub stack_id: String,
    pub stack_name: String,
    pub network_name: String,
    /// Resolved configs in startup order
    pub services: Vec<EffectiveConfig>,
    pub graph: WiringGraph,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Clone)]
pub struct StackOrchestrator {
    repo: Arc<dyn Repository>,
    planner: PlanEngine,
    executor: ApplyExecutor,
}

impl StackOrchestrator {
    pub fn new(repo: Arc<dyn Repository>, config: EngineConfig) -> Self {
        let options = PlanOptions { strict_wiring: config.strict_wiring };
        Self {
            planner: PlanEngine::new(repo.clone(), options),
            executor: ApplyExecutor::new(repo.clone(), config),
            repo,
        }
    }

    pub async fn plan(&self, stack_id: &str) -> Result<Plan> {
        self.planner.generate_plan(stack_id).await
    }

    pub async fn plan_cancellable(&self, stack_id: &str, cancel: &CancellationToken) -> Result<Plan> {
        self.planner.generate_plan_cancellable(stack_id, cancel).await
    }

    pub async fn apply(&self, plan: &Plan, options: ApplyOptions) -> Result<ApplyResult> {
        self.executor.apply(plan, options).await
    }

    pub async fn apply_with_cancel(
        &self,
        plan: &Plan,
        options: ApplyOptions,
        cancel: &CancellationToken,
    ) -> Result<ApplyResult> {
        self.executor.apply_with_cancel(plan, options, cancel).await
    }

    /// Live resolved config of one active instance, with its provenance.
    #[instrument(skip(self), fields(stack_id = %stack_id, instance = %instance))]
    pub async fn effective_config(
        &self,
        stack_id: &str,
        instance: &str,
    ) -> Result<(EffectiveConfig, OverridesApplied)> {
        let state = self.repo.load_stack_state(stack_id).await?;
        let found = state
            .desired_instances()
            .find(|i| i.name == instance)
            .ok_or_else(|| DevarchError::InstanceNotFound {
                stack: state.stack.name.clone(),
                instance: instance.to_string(),
            })?;
        let template = state.template(&found.template_id)?;
        Ok(resolver::resolve(&state.stack.name, &found.name, template, &found.overrides))
    }

    /// Wiring of the stack as it would be applied now.
    #[instrument(skip(self), fields(stack_id = %stack_id))]
    pub async fn wiring(&self, stack_id: &str) -> Result<(WiringGraph, Vec<Diagnostic>)> {
        let state = self.repo.load_stack_state(stack_id).await?;
        let configs = resolve_desired(&state)?;
        wiring::build(&configs, &state.active_wires())
    }

    /// Resolved configs and wiring for the emitter, in startup order.
    #[instrument(skip(self), fields(stack_id = %stack_id))]
    pub async fn render_input(&self, stack_id: &str) -> Result<EmitterInput> {
        let state = self.repo.load_stack_state(stack_id).await?;
        if !state.stack.lifecycle.is_active() {
            return Err(DevarchError::StackDeleted { stack: state.stack.name });
        }

        let mut configs = resolve_desired(&state)?;
        let (graph, diagnostics) = wiring::build(&configs, &state.active_wires())?;
        configs.sort_by_key(|c| graph.startup_order.iter().position(|n| *n == c.instance));

        Ok(EmitterInput {
            stack_id: state.stack.id.clone(),
            stack_name: state.stack.name.clone(),
            network_name: state.stack.network_name(),
            services: configs,
            graph,
            diagnostics,
        })
    }
}

fn resolve_desired(state: &StackState) -> Result<Vec<EffectiveConfig>> {
    state
        .desired_instances()
        .map(|i| {
            let template = state.template(&i.template_id)?;
            Ok(resolver::resolve(&state.stack.name, &i.name, template, &i.overrides).0)
        })
        .collect()
}
