//! Copy-on-write instance overrides.
//!
//! Each overridable resource kind is held as an [`Override`], which keeps
//! "inherit from the template" (`Absent`) apart from "explicitly set, possibly
//! to nothing" (`Present`). One [`OverrideBundle`] carries every kind for an
//! instance, so there is no per-kind flag to keep in sync.

use crate::error::{DevarchError, Result};
use crate::types::resources::{ConfigFile, Domain, EnvVar, Healthcheck, PortMapping, VolumeMount};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Override state for a single kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Override<T> {
    /// Inherit the template value.
    Absent,
    /// Replace or extend the template value, per the kind's merge policy.
    Present(T),
}

impl<T> Default for Override<T> {
    fn default() -> Self {
        Override::Absent
    }
}

impl<T> Override<T> {
    pub fn is_present(&self) -> bool {
        matches!(self, Override::Present(_))
    }

    pub fn as_option(&self) -> Option<&T> {
        match self {
            Override::Absent => None,
            Override::Present(value) => Some(value),
        }
    }
}

/// Resource kinds of an instance configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideKind {
    Ports,
    Volumes,
    EnvVars,
    Labels,
    Domains,
    Healthcheck,
    ConfigFiles,
    /// Template-defined only. Listed so provenance reports can show it as never overridden.
    Dependencies,
}

impl OverrideKind {
    pub const ALL: [OverrideKind; 8] = [
        OverrideKind::Ports,
        OverrideKind::Volumes,
        OverrideKind::EnvVars,
        OverrideKind::Labels,
        OverrideKind::Domains,
        OverrideKind::Healthcheck,
        OverrideKind::ConfigFiles,
        OverrideKind::Dependencies,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ports => "ports",
            Self::Volumes => "volumes",
            Self::EnvVars => "env_vars",
            Self::Labels => "labels",
            Self::Domains => "domains",
            Self::Healthcheck => "healthcheck",
            Self::ConfigFiles => "config_files",
            Self::Dependencies => "dependencies",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    pub fn is_overridable(&self) -> bool {
        !matches!(self, Self::Dependencies)
    }
}

impl std::fmt::Display for OverrideKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload of a single present override. Dependencies have no variant:
/// they cannot be overridden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideSet {
    Ports(Vec<PortMapping>),
    Volumes(Vec<VolumeMount>),
    EnvVars(BTreeMap<String, EnvVar>),
    Labels(BTreeMap<String, String>),
    Domains(Vec<Domain>),
    Healthcheck(Healthcheck),
    ConfigFiles(BTreeMap<String, ConfigFile>),
}

impl OverrideSet {
    pub fn kind(&self) -> OverrideKind {
        match self {
            Self::Ports(_) => OverrideKind::Ports,
            Self::Volumes(_) => OverrideKind::Volumes,
            Self::EnvVars(_) => OverrideKind::EnvVars,
            Self::Labels(_) => OverrideKind::Labels,
            Self::Domains(_) => OverrideKind::Domains,
            Self::Healthcheck(_) => OverrideKind::Healthcheck,
            Self::ConfigFiles(_) => OverrideKind::ConfigFiles,
        }
    }

    /// Serialize the payload alone, as stored in one override row.
    pub fn payload_json(&self) -> Result<String> {
        let json = match self {
            Self::Ports(v) => serde_json::to_string(v),
            Self::Volumes(v) => serde_json::to_string(v),
            Self::EnvVars(v) => serde_json::to_string(v),
            Self::Labels(v) => serde_json::to_string(v),
            Self::Domains(v) => serde_json::to_string(v),
            Self::Healthcheck(v) => serde_json::to_string(v),
            Self::ConfigFiles(v) => serde_json::to_string(v),
        };
        Ok(json?)
    }

    /// Rebuild a payload from its stored kind and JSON.
    pub fn from_payload(kind: OverrideKind, payload: &str) -> Result<Self> {
        let set = match kind {
            OverrideKind::Ports => Self::Ports(serde_json::from_str(payload)?),
            OverrideKind::Volumes => Self::Volumes(serde_json::from_str(payload)?),
            OverrideKind::EnvVars => Self::EnvVars(serde_json::from_str(payload)?),
            OverrideKind::Labels => Self::Labels(serde_json::from_str(payload)?),
            OverrideKind::Domains => Self::Domains(serde_json::from_str(payload)?),
            OverrideKind::Healthcheck => Self::Healthcheck(serde_json::from_str(payload)?),
            OverrideKind::ConfigFiles => Self::ConfigFiles(serde_json::from_str(payload)?),
            OverrideKind::Dependencies => {
                return Err(DevarchError::validation("dependencies cannot be overridden"))
            }
        };
        Ok(set)
    }
}

/// All overrides of one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverrideBundle {
    pub ports: Override<Vec<PortMapping>>,
    pub volumes: Override<Vec<VolumeMount>>,
    pub env_vars: Override<BTreeMap<String, EnvVar>>,
    pub labels: Override<BTreeMap<String, String>>,
    pub domains: Override<Vec<Domain>>,
    pub healthcheck: Override<Healthcheck>,
    pub config_files: Override<BTreeMap<String, ConfigFile>>,
}

impl OverrideBundle {
    /// Mark a kind as present with the given payload.
    pub fn set(&mut self, set: OverrideSet) {
        match set {
            OverrideSet::Ports(v) => self.ports = Override::Present(v),
            OverrideSet::Volumes(v) => self.volumes = Override::Present(v),
            OverrideSet::EnvVars(v) => self.env_vars = Override::Present(v),
            OverrideSet::Labels(v) => self.labels = Override::Present(v),
            OverrideSet::Domains(v) => self.domains = Override::Present(v),
            OverrideSet::Healthcheck(v) => self.healthcheck = Override::Present(v),
            OverrideSet::ConfigFiles(v) => self.config_files = Override::Present(v),
        }
    }

    /// Return a kind to inheriting from the template.
    pub fn clear(&mut self, kind: OverrideKind) -> Result<()> {
        match kind {
            OverrideKind::Ports => self.ports = Override::Absent,
            OverrideKind::Volumes => self.volumes = Override::Absent,
            OverrideKind::EnvVars => self.env_vars = Override::Absent,
            OverrideKind::Labels => self.labels = Override::Absent,
            OverrideKind::Domains => self.domains = Override::Absent,
            OverrideKind::Healthcheck => self.healthcheck = Override::Absent,
            OverrideKind::ConfigFiles => self.config_files = Override::Absent,
            OverrideKind::Dependencies => {
                return Err(DevarchError::validation("dependencies cannot be overridden"))
            }
        }
        Ok(())
    }

    /// The present payload for a kind, if any.
    pub fn get(&self, kind: OverrideKind) -> Option<OverrideSet> {
        match kind {
            OverrideKind::Ports => self.ports.as_option().cloned().map(OverrideSet::Ports),
            OverrideKind::Volumes => self.volumes.as_option().cloned().map(OverrideSet::Volumes),
            OverrideKind::EnvVars => self.env_vars.as_option().cloned().map(OverrideSet::EnvVars),
            OverrideKind::Labels => self.labels.as_option().cloned().map(OverrideSet::Labels),
            OverrideKind::Domains => self.domains.as_option().cloned().map(OverrideSet::Domains),
            OverrideKind::Healthcheck => {
                self.healthcheck.as_option().cloned().map(OverrideSet::Healthcheck)
            }
            OverrideKind::ConfigFiles => {
                self.config_files.as_option().cloned().map(OverrideSet::ConfigFiles)
            }
            OverrideKind::Dependencies => None,
        }
    }

    pub fn is_present(&self, kind: OverrideKind) -> bool {
        match kind {
            OverrideKind::Ports => self.ports.is_present(),
            OverrideKind::Volumes => self.volumes.is_present(),
            OverrideKind::EnvVars => self.env_vars.is_present(),
            OverrideKind::Labels => self.labels.is_present(),
            OverrideKind::Domains => self.domains.is_present(),
            OverrideKind::Healthcheck => self.healthcheck.is_present(),
            OverrideKind::ConfigFiles => self.config_files.is_present(),
            OverrideKind::Dependencies => false,
        }
    }

    /// Every present override, in kind order.
    pub fn present(&self) -> Vec<OverrideSet> {
        OverrideKind::ALL.into_iter().filter_map(|k| self.get(k)).collect()
    }
}

/// Which kinds of an effective config came from an override.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverridesApplied {
    pub ports: bool,
    pub volumes: bool,
    pub env_vars: bool,
    pub labels: bool,
    pub domains: bool,
    pub healthcheck: bool,
    pub config_files: bool,
    /// Always false.
    pub dependencies: bool,
}

impl OverridesApplied {
    pub fn from_bundle(bundle: &OverrideBundle) -> Self {
        Self {
            ports: bundle.ports.is_present(),
            volumes: bundle.volumes.is_present(),
            env_vars: bundle.env_vars.is_present(),
            labels: bundle.labels.is_present(),
            domains: bundle.domains.is_present(),
            healthcheck: bundle.healthcheck.is_present(),
            config_files: bundle.config_files.is_present(),
            dependencies: false,
        }
    }

    pub fn get(&self, kind: OverrideKind) -> bool {
        match kind {
            OverrideKind::Ports => self.ports,
            OverrideKind::Volumes => self.volumes,
            OverrideKind::EnvVars => self.env_vars,
            OverrideKind::Labels => self.labels,
            OverrideKind::Domains => self.domains,
            OverrideKind::Healthcheck => self.healthcheck,
            OverrideKind::ConfigFiles => self.config_files,
            OverrideKind::Dependencies => self.dependencies,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (OverrideKind, bool)> + '_ {
        OverrideKind::ALL.into_iter().map(|k| (k, self.get(k)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_and_present_empty_are_distinct() {
        let mut bundle = OverrideBundle::default();
        assert!(!bundle.is_present(OverrideKind::Ports));

        bundle.set(OverrideSet::Ports(vec![]));
        assert!(bundle.is_present(OverrideKind::Ports));
        assert_eq!(bundle.get(OverrideKind::Ports), Some(OverrideSet::Ports(vec![])));

        bundle.clear(OverrideKind::Ports).unwrap();
        assert_eq!(bundle, OverrideBundle::default());
    }

    #[test]
    fn test_bundle_json_keeps_present_empty() {
        let mut bundle = OverrideBundle::default();
        bundle.set(OverrideSet::Labels(BTreeMap::new()));

        let json = serde_json::to_string(&bundle).unwrap();
        let back: OverrideBundle = serde_json::from_str(&json).unwrap();
        assert!(back.labels.is_present());
        assert!(!back.env_vars.is_present());
    }

    #[test]
    fn test_dependencies_cannot_be_overridden() {
        let mut bundle = OverrideBundle::default();
        assert!(bundle.clear(OverrideKind::Dependencies).is_err());
        assert!(OverrideSet::from_payload(OverrideKind::Dependencies, "[]").is_err());
        assert!(!OverrideKind::Dependencies.is_overridable());
        assert_eq!(bundle.get(OverrideKind::Dependencies), None);
    }

    #[test]
    fn test_payload_storage() {
        let set = OverrideSet::Healthcheck(Healthcheck {
            interval_secs: Some(5),
            ..Default::default()
        });
        let payload = set.payload_json().unwrap();
        assert_eq!(payload, r#"{"interval_secs":5}"#);
        assert_eq!(OverrideSet::from_payload(OverrideKind::Healthcheck, &payload).unwrap(), set);
    }

    #[test]
    fn test_kind_names() {
        for kind in OverrideKind::ALL {
            assert_eq!(OverrideKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(OverrideKind::parse("env"), None);
    }

    #[test]
    fn test_overrides_applied_from_bundle() {
        let mut bundle = OverrideBundle::default();
        bundle.set(OverrideSet::EnvVars(BTreeMap::new()));
        let applied = OverridesApplied::from_bundle(&bundle);
        let flagged: Vec<_> = applied.iter().filter(|(_, v)| *v).map(|(k, _)| k).collect();
        assert_eq!(flagged, vec![OverrideKind::EnvVars]);
    }
}
