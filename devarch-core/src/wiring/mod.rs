//! Wiring graph builder.
//!
//! Derives consumer -> provider edges for one stack from explicit wires and
//! from contract matching, then checks the result for cycles and computes a
//! startup order.
//!
//! Ambiguous or missing providers are reported as [`Diagnostic`]s next to a
//! best-effort graph. Ambiguity is never resolved by picking a candidate:
//! the caller has to add an explicit wire.

pub mod diagnostic;
pub mod graph;

pub use diagnostic::{Diagnostic, DiagnosticCode, Severity};
pub use graph::{ExplicitWire, WireMode, WiringEdge, WiringGraph};

use crate::error::{DevarchError, Result};
use crate::naming;
use crate::types::{EffectiveConfig, ExportContract, ImportContract};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument};

/// Build the wiring graph for a set of resolved instances.
///
/// Explicit wires are validated strictly: an unknown instance, import or
/// export, or a contract mismatch is a validation error. A cycle is fatal
/// and reported with its full path.
#[instrument(skip_all, fields(instances = configs.len(), wires = wires.len()))]
pub fn build(
    configs: &[EffectiveConfig],
    wires: &[ExplicitWire],
) -> Result<(WiringGraph, Vec<Diagnostic>)> {
    let mut by_name: BTreeMap<&str, &EffectiveConfig> = BTreeMap::new();
    for config in configs {
        if by_name.insert(config.instance.as_str(), config).is_some() {
            return Err(DevarchError::validation(format!(
                "duplicate instance '{}' in wiring input",
                config.instance
            )));
        }
    }

    let mut edges: Vec<WiringEdge> = Vec::new();
    let mut bound: BTreeSet<(&str, &str)> = BTreeSet::new();

    let mut sorted_wires: Vec<&ExplicitWire> = wires.iter().collect();
    sorted_wires.sort();

    for wire in sorted_wires {
        let edge = explicit_edge(&by_name, wire)?;
        if !bound.insert((wire.consumer.as_str(), wire.import_name.as_str())) {
            return Err(DevarchError::validation(format!(
                "import '{}' of '{}' is wired more than once",
                wire.import_name, wire.consumer
            )));
        }
        edges.push(edge);
    }

    let mut diagnostics = Vec::new();

    for (&consumer, config) in &by_name {
        for import in &config.imports {
            if bound.contains(&(consumer, import.name.as_str())) {
                continue;
            }

            let candidates: Vec<(&EffectiveConfig, &ExportContract)> = by_name
                .iter()
                .filter(|(name, _)| **name != consumer)
                .filter_map(|(_, provider)| {
                    provider
                        .exports
                        .iter()
                        .find(|e| e.contract == import.contract)
                        .map(|export| (*provider, export))
                })
                .collect();

            match candidates.as_slice() {
                [] => {
                    debug!(consumer, contract = %import.contract, "No provider for import");
                    diagnostics.push(Diagnostic::missing_provider(
                        consumer,
                        &import.contract,
                        import.required,
                    ));
                }
                [(provider, export)] => {
                    edges.push(make_edge(config, import, provider, export, WireMode::Auto));
                }
                many => {
                    let names = many.iter().map(|(p, _)| p.instance.clone()).collect();
                    diagnostics.push(Diagnostic::ambiguous(consumer, &import.contract, names));
                }
            }
        }
    }

    edges.sort();

    let nodes: BTreeSet<String> = by_name.keys().map(|n| n.to_string()).collect();
    let adj = graph::adjacency(
        &nodes,
        edges.iter().map(|e| (e.consumer.as_str(), e.provider.as_str())),
    );

    if let Some(cycle) = graph::find_cycle(&adj) {
        return Err(DevarchError::CycleDetected { cycle });
    }
    let startup_order = graph::topological_order(&adj)?;

    let graph = WiringGraph { nodes: nodes.into_iter().collect(), edges, startup_order };
    Ok((graph, diagnostics))
}

fn explicit_edge(
    by_name: &BTreeMap<&str, &EffectiveConfig>,
    wire: &ExplicitWire,
) -> Result<WiringEdge> {
    let consumer = by_name.get(wire.consumer.as_str()).ok_or_else(|| {
        DevarchError::validation(format!("wire references unknown consumer '{}'", wire.consumer))
    })?;
    let provider = by_name.get(wire.provider.as_str()).ok_or_else(|| {
        DevarchError::validation(format!("wire references unknown provider '{}'", wire.provider))
    })?;

    let import = consumer.imports.iter().find(|i| i.name == wire.import_name).ok_or_else(|| {
        DevarchError::validation(format!(
            "'{}' has no import named '{}'",
            wire.consumer, wire.import_name
        ))
    })?;

    let export = match &wire.export_name {
        Some(name) => {
            let export = provider.exports.iter().find(|e| &e.name == name).ok_or_else(|| {
                DevarchError::validation(format!(
                    "'{}' has no export named '{}'",
                    wire.provider, name
                ))
            })?;
            if export.contract != import.contract {
                return Err(DevarchError::validation(format!(
                    "contract mismatch: {}.{} requires '{}' but {}.{} exports '{}'",
                    wire.consumer,
                    import.name,
                    import.contract,
                    wire.provider,
                    export.name,
                    export.contract
                )));
            }
            export
        }
        None => {
            let matching: Vec<&ExportContract> =
                provider.exports.iter().filter(|e| e.contract == import.contract).collect();
            match matching.as_slice() {
                [export] => *export,
                [] => {
                    return Err(DevarchError::validation(format!(
                        "contract mismatch: {}.{} requires '{}' but '{}' does not export it",
                        wire.consumer, import.name, import.contract, wire.provider
                    )))
                }
                _ => {
                    return Err(DevarchError::validation(format!(
                        "'{}' exports '{}' more than once; name the export on the wire",
                        wire.provider, import.contract
                    )))
                }
            }
        }
    };

    Ok(make_edge(consumer, import, provider, export, WireMode::Explicit))
}

fn make_edge(
    consumer: &EffectiveConfig,
    import: &ImportContract,
    provider: &EffectiveConfig,
    export: &ExportContract,
    mode: WireMode,
) -> WiringEdge {
    let prefix = naming::binding_prefix(&import.name);
    let mut bindings = BTreeMap::new();
    bindings.insert(format!("{}_HOST", prefix), provider.container_name.clone());
    if let Some(port) = export.port {
        bindings.insert(format!("{}_PORT", prefix), port.to_string());
    }

    WiringEdge {
        consumer: consumer.instance.clone(),
        import_name: import.name.clone(),
        provider: provider.instance.clone(),
        export_name: export.name.clone(),
        contract: import.contract.clone(),
        mode,
        bindings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver;
    use crate::types::{OverrideBundle, ServiceTemplate};

    fn web() -> ServiceTemplate {
        ServiceTemplate::builder("tpl-web", "web")
            .image("nginx")
            .export("http", "http", Some(80))
            .import("db", "sql")
            .build()
    }

    fn db() -> ServiceTemplate {
        ServiceTemplate::builder("tpl-db", "db")
            .image("postgres:16")
            .export("sql", "sql", Some(5432))
            .build()
    }

    fn cache() -> ServiceTemplate {
        ServiceTemplate::builder("tpl-cache", "cache").image("redis:7").export("kv", "redis", None).build()
    }

    fn config(instance: &str, template: &ServiceTemplate) -> EffectiveConfig {
        resolver::resolve("s1", instance, template, &OverrideBundle::default()).0
    }

    fn wire(consumer: &str, import: &str, provider: &str) -> ExplicitWire {
        ExplicitWire {
            consumer: consumer.into(),
            import_name: import.into(),
            provider: provider.into(),
            export_name: None,
        }
    }

    #[test]
    fn test_single_candidate_auto_edge() {
        let configs = vec![config("web-a", &web()), config("db-a", &db())];
        let (graph, diagnostics) = build(&configs, &[]).unwrap();

        assert!(diagnostics.is_empty());
        assert_eq!(graph.edges.len(), 1);
        let edge = &graph.edges[0];
        assert_eq!((edge.consumer.as_str(), edge.provider.as_str()), ("web-a", "db-a"));
        assert_eq!(edge.mode, WireMode::Auto);
        assert_eq!(edge.bindings["DB_HOST"], "devarch-s1-db-a");
        assert_eq!(edge.bindings["DB_PORT"], "5432");
        assert_eq!(graph.startup_order, vec!["db-a", "web-a"]);
    }

    #[test]
    fn test_ambiguous_candidates_add_no_edge() {
        let configs = vec![config("web-a", &web()), config("db-a", &db()), config("db-b", &db())];
        let (graph, diagnostics) = build(&configs, &[]).unwrap();

        assert!(graph.edges_from("web-a").next().is_none());
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, DiagnosticCode::AmbiguousWiring);
        assert_eq!(diagnostics[0].message, "ambiguous: web-a requires sql, candidates [db-a, db-b]");
    }

    #[test]
    fn test_explicit_wire_resolves_ambiguity() {
        let configs = vec![config("web-a", &web()), config("db-a", &db()), config("db-b", &db())];
        let (graph, diagnostics) = build(&configs, &[wire("web-a", "db", "db-b")]).unwrap();

        assert!(diagnostics.is_empty());
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].provider, "db-b");
        assert_eq!(graph.edges[0].mode, WireMode::Explicit);
    }

    #[test]
    fn test_explicit_wire_contract_mismatch_is_error() {
        let configs = vec![config("web-a", &web()), config("cache", &cache())];
        let err = build(&configs, &[wire("web-a", "db", "cache")]).unwrap_err();
        assert!(matches!(err, DevarchError::Validation { .. }));
        assert!(err.to_string().contains("contract mismatch"));

        let named = ExplicitWire { export_name: Some("kv".into()), ..wire("web-a", "db", "cache") };
        assert!(build(&configs, &[named]).unwrap_err().to_string().contains("contract mismatch"));
    }

    #[test]
    fn test_explicit_wire_unknown_references() {
        let configs = vec![config("web-a", &web()), config("db-a", &db())];
        assert!(build(&configs, &[wire("web-z", "db", "db-a")]).is_err());
        assert!(build(&configs, &[wire("web-a", "db", "db-z")]).is_err());
        assert!(build(&configs, &[wire("web-a", "nope", "db-a")]).is_err());
    }

    #[test]
    fn test_missing_provider_severity() {
        let optional = ServiceTemplate::builder("tpl-app", "app")
            .image("app")
            .optional_import("cache", "redis")
            .import("db", "sql")
            .build();
        let configs = vec![config("app", &optional)];
        let (graph, diagnostics) = build(&configs, &[]).unwrap();

        assert!(graph.edges.is_empty());
        let severities: Vec<_> = diagnostics.iter().map(|d| d.severity).collect();
        assert_eq!(severities, vec![Severity::Warning, Severity::Error]);
    }

    #[test]
    fn test_explicit_cycle_is_fatal() {
        let both = ServiceTemplate::builder("tpl-both", "both")
            .image("x")
            .export("api", "api", None)
            .import("peer", "api")
            .build();
        let configs = vec![config("a", &both), config("b", &both)];
        let err = build(&configs, &[wire("a", "peer", "b"), wire("b", "peer", "a")]).unwrap_err();
        match err {
            DevarchError::CycleDetected { cycle } => assert_eq!(cycle, vec!["a", "b", "a"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_auto_wiring_skips_self() {
        let both = ServiceTemplate::builder("tpl-both", "both")
            .image("x")
            .export("api", "api", None)
            .import("peer", "api")
            .build();
        let (graph, diagnostics) = build(&[config("a", &both)], &[]).unwrap();
        assert!(graph.edges.is_empty());
        assert_eq!(diagnostics[0].code, DiagnosticCode::MissingProvider);
    }

    #[test]
    fn test_duplicate_wire_rejected() {
        let configs = vec![config("web-a", &web()), config("db-a", &db()), config("db-b", &db())];
        let err = build(&configs, &[wire("web-a", "db", "db-a"), wire("web-a", "db", "db-b")])
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }
}
