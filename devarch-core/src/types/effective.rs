//! Effective (merged) instance configuration.

use crate::types::overrides::OverridesApplied;
use crate::types::resources::{
    ConfigFile, Dependency, Domain, EnvVar, ExportContract, Healthcheck, ImportContract,
    PortMapping, VolumeMount,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Template merged with an instance's overrides, ready for an emitter.
///
/// Derived, never persisted on its own. Maps are ordered so that the
/// serialized form is byte-identical for identical input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub stack: String,
    pub instance: String,
    pub template_id: String,
    pub template_name: String,

    /// `devarch-{stack}-{instance}`
    pub container_name: String,
    /// `devarch-{stack}-net`
    pub network_name: String,

    pub image: String,
    pub restart_policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    pub ports: Vec<PortMapping>,
    pub volumes: Vec<VolumeMount>,
    pub env: BTreeMap<String, EnvVar>,
    pub labels: BTreeMap<String, String>,
    pub domains: Vec<Domain>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Healthcheck>,
    pub config_files: BTreeMap<String, ConfigFile>,
    pub dependencies: Vec<Dependency>,

    pub exports: Vec<ExportContract>,
    pub imports: Vec<ImportContract>,

    pub overrides_applied: OverridesApplied,
}

impl EffectiveConfig {
    /// Env map with plain string values, as an emitter writes it.
    pub fn env_map(&self) -> BTreeMap<String, String> {
        self.env.iter().map(|(k, v)| (k.clone(), v.value.clone())).collect()
    }
}
