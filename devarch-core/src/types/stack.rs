//! Stack and instance types.

use crate::types::effective::EffectiveConfig;
use crate::types::overrides::OverrideBundle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tombstone state of a stack or instance.
///
/// Name uniqueness is enforced among `Active` entities only, so a deleted
/// name can be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Active,
    Deleted { at: DateTime<Utc> },
}

impl Lifecycle {
    pub fn is_active(&self) -> bool {
        matches!(self, Lifecycle::Active)
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Lifecycle::Active => None,
            Lifecycle::Deleted { at } => Some(*at),
        }
    }

    pub fn from_deleted_at(deleted_at: Option<DateTime<Utc>>) -> Self {
        match deleted_at {
            None => Lifecycle::Active,
            Some(at) => Lifecycle::Deleted { at },
        }
    }
}

/// Named group of instances sharing one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    /// Stack ID
    pub id: String,

    /// Stack name, immutable after creation
    pub name: String,

    pub description: String,

    pub lifecycle: Lifecycle,

    /// Bumped on every mutation of the stack row
    pub revision: i64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Stack {
    pub fn network_name(&self) -> String {
        crate::naming::network_name(&self.name)
    }
}

/// What the last successful apply recorded for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedSnapshot {
    pub template_id: String,
    pub template_revision: i64,
    pub overrides: OverrideBundle,
    pub effective: EffectiveConfig,
    /// Digest of the instance inputs at plan time
    pub digest: String,
    pub applied_at: DateTime<Utc>,
}

/// A template bound into a stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Surrogate key, stable across renames of the stack
    pub uid: String,

    pub stack_id: String,

    /// Unique among active instances of the stack
    pub name: String,

    pub template_id: String,

    pub description: String,

    pub lifecycle: Lifecycle,

    pub revision: i64,

    pub overrides: OverrideBundle,

    /// `None` until the instance has been applied at least once
    pub applied: Option<AppliedSnapshot>,
}

impl Instance {
    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }
}
