//! DevArch Core Library
//!
//! Stack orchestration engine for DevArch: resolves service templates and
//! per-instance overrides into effective configs, wires instances together
//! through typed contracts, and moves stacks between states with
//! fingerprinted plans and locked, atomic applies.

pub mod apply;
pub mod config;
pub mod error;
pub mod naming;
pub mod observability;
pub mod orchestrator;
pub mod paths;
pub mod plan;
pub mod repository;
pub mod resolver;
pub mod state;
pub mod types;
pub mod wiring;

// Re-export commonly used items
pub use apply::{ApplyExecutor, ApplyOptions, ApplyPhase, ApplyResult};
pub use config::EngineConfig;
pub use error::{DevarchError, Result};
pub use observability::{init as init_observability, init_from_config as init_observability_from_config};
pub use orchestrator::{EmitterInput, StackOrchestrator};
pub use plan::{Plan, PlanEngine, PlanOptions};
pub use repository::{AtomicUnit, Repository, StackState};
pub use state::StateManager;
pub use types::{
    EffectiveConfig, Instance, Override, OverrideBundle, OverrideKind, OverrideSet,
    OverridesApplied, ServiceTemplate, Stack,
};
pub use wiring::{Diagnostic, ExplicitWire, WiringEdge, WiringGraph};
