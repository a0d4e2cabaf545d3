//! Core domain types for DevArch.

pub mod effective;
pub mod overrides;
pub mod resources;
pub mod stack;
pub mod template;

// Re-exports
pub use effective::EffectiveConfig;
pub use overrides::{Override, OverrideBundle, OverrideKind, OverrideSet, OverridesApplied};
pub use resources::{
    ConfigFile, Dependency, Domain, EnvVar, ExportContract, Healthcheck, ImportContract,
    PortMapping, Protocol, VolumeMount,
};
pub use stack::{AppliedSnapshot, Instance, Lifecycle, Stack};
pub use template::{ServiceTemplate, TemplateBuilder};
