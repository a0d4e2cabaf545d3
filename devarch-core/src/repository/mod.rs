//! Storage boundary of the engine.
//!
//! The planner only reads through [`Repository`]. The apply executor writes
//! exclusively through an [`AtomicUnit`], which owns the stack lock for its
//! whole lifetime: the lock is released when the unit commits, rolls back,
//! or is dropped.

use crate::apply::lock::StackLockGuard;
use crate::error::{DevarchError, Result};
use crate::types::{Instance, Override, OverrideBundle, OverrideKind, OverrideSet, ServiceTemplate, Stack};
use crate::wiring::{ExplicitWire, WiringEdge};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Every row that contributes to planning one stack.
#[derive(Debug, Clone, PartialEq)]
pub struct StackState {
    pub stack: Stack,
    /// All instances of the stack, tombstoned ones included, sorted by name
    pub instances: Vec<Instance>,
    /// Templates referenced by active instances, by id
    pub templates: BTreeMap<String, ServiceTemplate>,
    pub wires: Vec<ExplicitWire>,
    /// Edge set recorded by the last successful apply
    pub applied_edges: Vec<WiringEdge>,
}

impl StackState {
    pub fn template(&self, template_id: &str) -> Result<&ServiceTemplate> {
        self.templates
            .get(template_id)
            .ok_or_else(|| DevarchError::TemplateNotFound { template: template_id.to_string() })
    }

    pub fn instance(&self, uid: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.uid == uid)
    }

    /// Instances that should exist after apply.
    pub fn desired_instances(&self) -> impl Iterator<Item = &Instance> {
        let stack_active = self.stack.lifecycle.is_active();
        self.instances.iter().filter(move |i| stack_active && i.is_active())
    }

    /// Explicit wires whose endpoints are both desired. Wires touching a
    /// tombstoned instance stay dormant until it is restored.
    pub fn active_wires(&self) -> Vec<ExplicitWire> {
        let names: BTreeSet<&str> = self.desired_instances().map(|i| i.name.as_str()).collect();
        self.wires
            .iter()
            .filter(|w| names.contains(w.consumer.as_str()) && names.contains(w.provider.as_str()))
            .cloned()
            .collect()
    }
}

/// Read side of persisted state plus the entry point to atomic writes.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn load_stack(&self, stack_id: &str) -> Result<Stack>;

    /// All instances of a stack with their overrides.
    async fn load_instances(&self, stack_id: &str) -> Result<Vec<Instance>>;

    async fn load_overrides(&self, instance_uid: &str) -> Result<OverrideBundle>;

    async fn load_template(&self, template_id: &str) -> Result<ServiceTemplate>;

    async fn load_wires(&self, stack_id: &str) -> Result<Vec<ExplicitWire>>;

    async fn load_applied_edges(&self, stack_id: &str) -> Result<Vec<WiringEdge>>;

    /// Override state of a single kind.
    async fn load_override(&self, instance_uid: &str, kind: OverrideKind) -> Result<Override<OverrideSet>> {
        let bundle = self.load_overrides(instance_uid).await?;
        Ok(match bundle.get(kind) {
            Some(set) => Override::Present(set),
            None => Override::Absent,
        })
    }

    /// Load everything planning needs for one stack.
    ///
    /// Implementations backed by a transactional store should override this
    /// to read from a single snapshot.
    async fn load_stack_state(&self, stack_id: &str) -> Result<StackState> {
        let stack = self.load_stack(stack_id).await?;
        let mut instances = self.load_instances(stack_id).await?;
        instances.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.uid.cmp(&b.uid)));

        let mut templates = BTreeMap::new();
        for instance in instances.iter().filter(|i| i.is_active()) {
            if !templates.contains_key(&instance.template_id) {
                let template = self.load_template(&instance.template_id).await?;
                templates.insert(instance.template_id.clone(), template);
            }
        }

        let wires = self.load_wires(stack_id).await?;
        let applied_edges = self.load_applied_edges(stack_id).await?;

        Ok(StackState { stack, instances, templates, wires, applied_edges })
    }

    /// Wait at most `timeout` for exclusive use of a stack.
    async fn acquire_stack_lock(&self, stack_id: &str, timeout: Duration) -> Result<StackLockGuard>;

    /// Start an atomic unit of work that owns `lock` until it finishes.
    async fn begin_atomic(&self, lock: StackLockGuard) -> Result<Box<dyn AtomicUnit>>;
}

/// All-or-nothing batch of writes against one locked stack.
///
/// Dropping a unit without committing discards its writes and releases the lock.
#[async_trait]
pub trait AtomicUnit: Send {
    fn stack_id(&self) -> &str;

    /// Re-read the stack inside the unit.
    async fn load_stack_state(&mut self) -> Result<StackState>;

    /// Persist an instance row: lifecycle, revision and applied snapshot.
    async fn save_instance(&mut self, instance: &Instance) -> Result<()>;

    /// Replace an instance's overrides with `bundle`.
    async fn save_overrides(&mut self, instance_uid: &str, bundle: &OverrideBundle) -> Result<()>;

    /// Tombstone an instance (if not already) and forget its applied snapshot.
    async fn soft_delete(&mut self, instance_uid: &str, at: DateTime<Utc>) -> Result<()>;

    async fn replace_applied_edges(&mut self, edges: &[WiringEdge]) -> Result<()>;

    /// Make every write durable, then release the stack lock.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every write, then release the stack lock.
    async fn rollback(self: Box<Self>) -> Result<()>;
}
