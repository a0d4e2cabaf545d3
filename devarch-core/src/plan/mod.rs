//! Plans: inspectable, fingerprinted diffs between applied and live state.
//!
//! There is no separate desired-state store. Each instance carries the
//! snapshot recorded by its last apply, and a plan diffs that snapshot
//! against what the live rows resolve to now:
//!
//! - active instance without a snapshot: create
//! - active instance whose resolved config differs from its snapshot: update
//! - tombstoned instance (or instance of a tombstoned stack) with a snapshot: delete
//!
//! Planning takes no lock and writes nothing.

pub mod differ;
pub mod engine;
pub mod fingerprint;

pub use engine::PlanEngine;
pub use fingerprint::{InstanceDigest, StateFingerprint};

use crate::error::Result;
use crate::repository::StackState;
use crate::resolver;
use crate::types::{EffectiveConfig, Instance};
use crate::wiring::{self, Diagnostic, Severity, WiringEdge};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Where a field's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    Template,
    Override,
}

/// Old and new value of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Option<Value>,
    pub new: Option<Value>,
    pub old_source: Option<ValueSource>,
    pub new_source: Option<ValueSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeAction::Create => write!(f, "create"),
            ChangeAction::Update => write!(f, "update"),
            ChangeAction::Delete => write!(f, "delete"),
        }
    }
}

/// Planned change to one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceChange {
    pub action: ChangeAction,
    pub instance_uid: String,
    pub instance: String,
    pub template_id: String,
    pub container_name: String,
    /// Field name -> change
    pub fields: BTreeMap<String, FieldChange>,
    /// Config the instance will have after apply; `None` for deletes
    pub effective: Option<EffectiveConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiringChanges {
    pub added: Vec<WiringEdge>,
    pub removed: Vec<WiringEdge>,
}

impl WiringChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOptions {
    /// Ambiguous or missing wiring fails planning instead of producing diagnostics.
    pub strict_wiring: bool,
}

/// Immutable description of pending changes to one stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub stack_id: String,
    pub stack_name: String,
    /// In startup order
    pub creates: Vec<InstanceChange>,
    /// In startup order
    pub updates: Vec<InstanceChange>,
    pub deletes: Vec<InstanceChange>,
    pub wiring: WiringChanges,
    /// Full desired edge set
    pub edges: Vec<WiringEdge>,
    pub startup_order: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
    pub options: PlanOptions,
    pub fingerprint: String,
    /// Per-instance digests keyed by instance uid
    pub instance_digests: BTreeMap<String, InstanceDigest>,
    pub generated_at: DateTime<Utc>,
}

impl Plan {
    /// True when apply would change nothing.
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.wiring.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn has_warnings(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity == Severity::Warning)
    }

    /// Diagnostics that stop apply given the caller's confirmation.
    pub fn blocking_diagnostics(&self, warnings_confirmed: bool) -> Vec<&Diagnostic> {
        self.diagnostics.iter().filter(|d| d.blocks_apply(warnings_confirmed)).collect()
    }

    /// Every instance change in execution order: creates, updates, deletes.
    pub fn changes(&self) -> impl Iterator<Item = &InstanceChange> {
        self.creates.iter().chain(&self.updates).chain(&self.deletes)
    }
}

/// Compute a plan from loaded state. Pure apart from the plan id and timestamp.
pub fn compute(state: &StackState, options: PlanOptions) -> Result<Plan> {
    let fingerprint = fingerprint::compute(state)?;

    let mut desired: Vec<(&Instance, EffectiveConfig)> = Vec::new();
    let mut diagnostics = Vec::new();
    for instance in state.desired_instances() {
        let template = state.template(&instance.template_id)?;
        let (config, _) =
            resolver::resolve(&state.stack.name, &instance.name, template, &instance.overrides);
        for kind in resolver::stale_kinds(template, &instance.overrides) {
            diagnostics.push(Diagnostic::stale_override(&instance.name, kind.as_str()));
        }
        desired.push((instance, config));
    }

    let configs: Vec<EffectiveConfig> = desired.iter().map(|(_, c)| c.clone()).collect();
    let (graph, wiring_diagnostics) = wiring::build(&configs, &state.active_wires())?;

    let mut all_diagnostics = wiring_diagnostics;
    all_diagnostics.append(&mut diagnostics);

    if options.strict_wiring {
        if let Some(err) = all_diagnostics.iter().find_map(Diagnostic::to_strict_error) {
            return Err(err);
        }
    }

    let position: BTreeMap<&str, usize> =
        graph.startup_order.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
    desired.sort_by_key(|(i, _)| position.get(i.name.as_str()).copied().unwrap_or(usize::MAX));

    let mut creates = Vec::new();
    let mut updates = Vec::new();
    for (instance, config) in desired {
        match &instance.applied {
            None => {
                let fields = differ::diff(None, &config);
                creates.push(change(ChangeAction::Create, instance, fields, config));
            }
            Some(snapshot) => {
                let fields = differ::diff(Some(&snapshot.effective), &config);
                if !fields.is_empty() {
                    updates.push(change(ChangeAction::Update, instance, fields, config));
                }
            }
        }
    }

    let deletes = state
        .instances
        .iter()
        .filter(|i| !(state.stack.lifecycle.is_active() && i.is_active()))
        .filter_map(|i| {
            i.applied.as_ref().map(|snapshot| InstanceChange {
                action: ChangeAction::Delete,
                instance_uid: i.uid.clone(),
                instance: i.name.clone(),
                template_id: snapshot.template_id.clone(),
                container_name: snapshot.effective.container_name.clone(),
                fields: BTreeMap::new(),
                effective: None,
            })
        })
        .collect();

    let wiring_changes = WiringChanges {
        added: graph.edges.iter().filter(|e| !state.applied_edges.contains(e)).cloned().collect(),
        removed: state.applied_edges.iter().filter(|e| !graph.edges.contains(e)).cloned().collect(),
    };

    Ok(Plan {
        id: uuid::Uuid::new_v4().to_string(),
        stack_id: state.stack.id.clone(),
        stack_name: state.stack.name.clone(),
        creates,
        updates,
        deletes,
        wiring: wiring_changes,
        edges: graph.edges,
        startup_order: graph.startup_order,
        diagnostics: all_diagnostics,
        options,
        fingerprint: fingerprint.fingerprint,
        instance_digests: fingerprint.instances,
        generated_at: Utc::now(),
    })
}

fn change(
    action: ChangeAction,
    instance: &Instance,
    fields: BTreeMap<String, FieldChange>,
    config: EffectiveConfig,
) -> InstanceChange {
    InstanceChange {
        action,
        instance_uid: instance.uid.clone(),
        instance: instance.name.clone(),
        template_id: instance.template_id.clone(),
        container_name: config.container_name.clone(),
        fields,
        effective: Some(config),
    }
}
