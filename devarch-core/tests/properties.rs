//! Property tests for resolution merge policies and wiring graph shape.

use devarch_core::{
    resolver,
    types::{EnvVar, Override, OverrideBundle, PortMapping, ServiceTemplate},
    wiring, DevarchError, EffectiveConfig,
};
use proptest::prelude::*;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

fn arb_ports() -> impl Strategy<Value = Vec<PortMapping>> {
    prop::collection::vec((1u16..u16::MAX, 1u16..u16::MAX), 0..4)
        .prop_map(|pairs| pairs.into_iter().map(|(h, c)| PortMapping::tcp(h, c)).collect())
}

fn arb_env() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map("[A-Z]{1,6}", "[a-z0-9]{0,8}", 0..6)
}

fn arb_labels() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,8}", 0..6)
}

fn template(ports: &[PortMapping], env: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> ServiceTemplate {
    let mut builder = ServiceTemplate::builder("tpl-app", "app").image("app:1");
    for port in ports {
        builder = builder.port(port.host_port.unwrap_or_default(), port.container_port);
    }
    for (key, value) in env {
        builder = builder.env(key.clone(), value.clone());
    }
    for (key, value) in labels {
        builder = builder.label(key.clone(), value.clone());
    }
    builder.build()
}

fn plain(env: &BTreeMap<String, String>) -> BTreeMap<String, EnvVar> {
    env.iter().map(|(k, v)| (k.clone(), EnvVar::plain(v.clone()))).collect()
}

/// One config per node; node `i` imports contract `c{j}` for every provider `j` in `deps[i]`.
fn graph_configs(deps: &[Vec<usize>]) -> Vec<EffectiveConfig> {
    deps.iter()
        .enumerate()
        .map(|(i, providers)| {
            let mut builder = ServiceTemplate::builder(format!("tpl-{i}"), format!("svc{i}"))
                .image("svc:1")
                .export("out", format!("c{i}"), Some(8000 + i as u16));
            for j in providers {
                builder = builder.import(format!("dep{j}"), format!("c{j}"));
            }
            let template = builder.build();
            resolver::resolve("p", &format!("svc{i}"), &template, &OverrideBundle::default()).0
        })
        .collect()
}

/// Random DAG: node `i` may only depend on nodes with a lower index.
fn arb_dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1usize..8).prop_flat_map(|n| {
        prop::collection::vec(any::<bool>(), n * n).prop_map(move |bits| {
            (0..n).map(|i| (0..i).filter(|j| bits[i * n + j]).collect()).collect()
        })
    })
}

/// Random edge set without self-loops: node `i` may depend on any other node.
fn arb_edges() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1usize..7).prop_flat_map(|n| {
        prop::collection::vec(prop::bool::weighted(0.3), n * n).prop_map(move |bits| {
            (0..n).map(|i| (0..n).filter(|j| *j != i && bits[i * n + j]).collect()).collect()
        })
    })
}

fn graph_has_dependency(deps: &[Vec<usize>], consumer: &str, provider: &str) -> bool {
    let index = |name: &str| name.trim_start_matches("svc").parse::<usize>().ok();
    match (index(consumer), index(provider)) {
        (Some(c), Some(p)) => deps.get(c).is_some_and(|providers| providers.contains(&p)),
        _ => false,
    }
}

/// Reference cycle check by transitive closure.
fn has_cycle(deps: &[Vec<usize>]) -> bool {
    let n = deps.len();
    let mut reach = vec![vec![false; n]; n];
    for (i, providers) in deps.iter().enumerate() {
        for j in providers {
            reach[i][*j] = true;
        }
    }
    for k in 0..n {
        for i in 0..n {
            for j in 0..n {
                if reach[i][k] && reach[k][j] {
                    reach[i][j] = true;
                }
            }
        }
    }
    (0..n).any(|i| reach[i][i])
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn resolution_is_deterministic(
        ports in arb_ports(),
        env in arb_env(),
        labels in arb_labels(),
        env_over in arb_env(),
    ) {
        let template = template(&ports, &env, &labels);
        let overrides = OverrideBundle { env_vars: Override::Present(plain(&env_over)), ..Default::default() };

        let first = resolver::resolve("s1", "app-a", &template, &overrides);
        let second = resolver::resolve("s1", "app-a", &template, &overrides);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn ports_override_touches_only_ports(
        ports in arb_ports(),
        env in arb_env(),
        labels in arb_labels(),
        over in arb_ports(),
    ) {
        let template = template(&ports, &env, &labels);
        let (base, _) = resolver::resolve("s1", "app-a", &template, &OverrideBundle::default());
        let overrides = OverrideBundle { ports: Override::Present(over.clone()), ..Default::default() };
        let (mut changed, applied) = resolver::resolve("s1", "app-a", &template, &overrides);

        prop_assert!(applied.ports);
        prop_assert_eq!(&changed.ports, &over);

        changed.ports = base.ports.clone();
        changed.overrides_applied = base.overrides_applied;
        prop_assert_eq!(changed, base);
    }

    #[test]
    fn present_list_replaces_template_even_when_empty(ports in arb_ports()) {
        let template = template(&ports, &BTreeMap::new(), &BTreeMap::new());
        let overrides = OverrideBundle { ports: Override::Present(Vec::new()), ..Default::default() };

        let (config, applied) = resolver::resolve("s1", "app-a", &template, &overrides);
        prop_assert!(config.ports.is_empty());
        prop_assert!(applied.ports);
    }

    #[test]
    fn env_merges_by_key_with_override_winning(env in arb_env(), env_over in arb_env()) {
        let template = template(&[], &env, &BTreeMap::new());
        let overrides = OverrideBundle { env_vars: Override::Present(plain(&env_over)), ..Default::default() };

        let (config, _) = resolver::resolve("s1", "app-a", &template, &overrides);
        for (key, value) in &env_over {
            prop_assert_eq!(&config.env[key].value, value);
        }
        for (key, value) in env.iter().filter(|(k, _)| !env_over.contains_key(*k)) {
            prop_assert_eq!(&config.env[key].value, value);
        }
        prop_assert_eq!(config.env.len(), env.keys().chain(env_over.keys()).collect::<std::collections::BTreeSet<_>>().len() + 3);
        prop_assert_eq!(&config.env["DEVARCH_INSTANCE_ID"].value, "app-a");
    }

    #[test]
    fn reserved_keys_never_leak_from_overrides(value in "[a-z]{1,8}") {
        let template = template(&[], &BTreeMap::new(), &BTreeMap::new());
        let mut labels = BTreeMap::new();
        labels.insert("devarch.stack_id".to_string(), value.clone());
        labels.insert("team".to_string(), value.clone());
        let overrides = OverrideBundle { labels: Override::Present(labels), ..Default::default() };

        let (config, _) = resolver::resolve("s1", "app-a", &template, &overrides);
        prop_assert_eq!(&config.labels["devarch.stack_id"], "s1");
        prop_assert_eq!(&config.labels["team"], &value);
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn dag_startup_order_puts_providers_first(deps in arb_dag()) {
        let configs = graph_configs(&deps);
        let (graph, diagnostics) = wiring::build(&configs, &[]).unwrap();

        prop_assert!(diagnostics.is_empty());
        prop_assert_eq!(graph.startup_order.len(), deps.len());

        let position: BTreeMap<&str, usize> =
            graph.startup_order.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
        for edge in &graph.edges {
            prop_assert!(position[edge.provider.as_str()] < position[edge.consumer.as_str()]);
        }
        prop_assert_eq!(graph.edges.len(), deps.iter().map(Vec::len).sum::<usize>());
    }

    #[test]
    fn build_rejects_exactly_the_cyclic_edge_sets(deps in arb_edges()) {
        let configs = graph_configs(&deps);

        match wiring::build(&configs, &[]) {
            Ok((graph, _)) => {
                prop_assert!(!has_cycle(&deps));
                prop_assert_eq!(graph.startup_order.len(), deps.len());
            }
            Err(DevarchError::CycleDetected { cycle }) => {
                prop_assert!(has_cycle(&deps));
                prop_assert_eq!(cycle.first(), cycle.last());
                for pair in cycle.windows(2) {
                    prop_assert!(graph_has_dependency(&deps, &pair[0], &pair[1]));
                }
            }
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
        }
    }

    #[test]
    fn ring_of_imports_is_rejected_with_full_cycle(n in 2usize..7) {
        let deps: Vec<Vec<usize>> = (0..n).map(|i| vec![(i + 1) % n]).collect();
        let configs = graph_configs(&deps);

        match wiring::build(&configs, &[]) {
            Err(DevarchError::CycleDetected { cycle }) => {
                prop_assert_eq!(cycle.len(), n + 1);
                prop_assert_eq!(cycle.first(), cycle.last());
            }
            other => prop_assert!(false, "expected a cycle, got {:?}", other.map(|(g, _)| g.startup_order)),
        }
    }
}
