//! Config resolution: template + overrides -> effective config.
//!
//! Merge policy per kind:
//! - ports, volumes, domains: a present override replaces the template list
//! - env vars, labels: merge by key, override wins, reserved keys stripped
//!   from the override and identity keys injected last
//! - healthcheck: a present override replaces the template object whole,
//!   even when it sets no field
//! - config files: merge by path, override wins
//! - dependencies: copied from the template, never overridable
//!
//! Resolution is pure. It performs no I/O and never fails; malformed
//! override input is rejected where overrides are written.

use crate::naming;
use crate::types::{
    EffectiveConfig, EnvVar, Healthcheck, Override, OverrideBundle, OverrideKind,
    OverridesApplied, ServiceTemplate,
};
use std::collections::BTreeMap;
use tracing::warn;

/// Resolve the effective configuration of `instance` in `stack`.
pub fn resolve(
    stack: &str,
    instance: &str,
    template: &ServiceTemplate,
    overrides: &OverrideBundle,
) -> (EffectiveConfig, OverridesApplied) {
    let applied = OverridesApplied::from_bundle(overrides);

    let mut env = merge_keyed(&template.env, &overrides.env_vars, |k| {
        strip_reserved(k, naming::is_reserved_env, instance)
    });
    for (key, value) in naming::identity_env(stack, instance, &template.id) {
        env.insert(key, EnvVar::plain(value));
    }

    let mut labels = merge_keyed(&template.labels, &overrides.labels, |k| {
        strip_reserved(k, naming::is_reserved_label, instance)
    });
    labels.extend(naming::identity_labels(stack, instance, &template.id));

    let config = EffectiveConfig {
        stack: stack.to_string(),
        instance: instance.to_string(),
        template_id: template.id.clone(),
        template_name: template.name.clone(),
        container_name: naming::container_name(stack, instance),
        network_name: naming::network_name(stack),
        image: template.image.clone(),
        restart_policy: template.restart_policy.clone(),
        command: template.command.clone(),
        ports: replace_list(&template.ports, &overrides.ports),
        volumes: replace_list(&template.volumes, &overrides.volumes),
        env,
        labels,
        domains: replace_list(&template.domains, &overrides.domains),
        healthcheck: replace_healthcheck(&template.healthcheck, &overrides.healthcheck),
        config_files: merge_keyed(&template.config_files, &overrides.config_files, |_| true),
        dependencies: template.dependencies.clone(),
        exports: template.exports.clone(),
        imports: template.imports.clone(),
        overrides_applied: applied,
    };

    (config, applied)
}

/// Present overrides whose effective contribution equals what the template
/// alone would produce.
pub fn stale_kinds(template: &ServiceTemplate, overrides: &OverrideBundle) -> Vec<OverrideKind> {
    let mut stale = Vec::new();

    if overrides.ports.as_option().is_some_and(|v| *v == template.ports) {
        stale.push(OverrideKind::Ports);
    }
    if overrides.volumes.as_option().is_some_and(|v| *v == template.volumes) {
        stale.push(OverrideKind::Volumes);
    }
    if overrides.env_vars.as_option().is_some_and(|v| is_subset(v, &template.env)) {
        stale.push(OverrideKind::EnvVars);
    }
    if overrides.labels.as_option().is_some_and(|v| is_subset(v, &template.labels)) {
        stale.push(OverrideKind::Labels);
    }
    if overrides.domains.as_option().is_some_and(|v| *v == template.domains) {
        stale.push(OverrideKind::Domains);
    }
    if overrides.healthcheck.is_present()
        && replace_healthcheck(&template.healthcheck, &overrides.healthcheck)
            == template.healthcheck
    {
        stale.push(OverrideKind::Healthcheck);
    }
    if overrides.config_files.as_option().is_some_and(|v| is_subset(v, &template.config_files)) {
        stale.push(OverrideKind::ConfigFiles);
    }

    stale
}

fn replace_list<T: Clone>(template: &[T], over: &Override<Vec<T>>) -> Vec<T> {
    match over {
        Override::Absent => template.to_vec(),
        Override::Present(rows) => rows.clone(),
    }
}

fn replace_healthcheck(
    template: &Option<Healthcheck>,
    over: &Override<Healthcheck>,
) -> Option<Healthcheck> {
    match over {
        Override::Absent => template.clone(),
        Override::Present(hc) => Some(hc.clone()),
    }
}

fn merge_keyed<V: Clone>(
    template: &BTreeMap<String, V>,
    over: &Override<BTreeMap<String, V>>,
    keep: impl Fn(&str) -> bool,
) -> BTreeMap<String, V> {
    let mut merged = template.clone();
    if let Override::Present(entries) = over {
        for (key, value) in entries {
            if keep(key) {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

fn strip_reserved(key: &str, is_reserved: fn(&str) -> bool, instance: &str) -> bool {
    if is_reserved(key) {
        warn!(instance = %instance, key = %key, "Dropping reserved key from override");
        return false;
    }
    true
}

fn is_subset<V: PartialEq>(entries: &BTreeMap<String, V>, base: &BTreeMap<String, V>) -> bool {
    entries.iter().all(|(k, v)| base.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConfigFile, OverrideSet, PortMapping};

    fn web() -> ServiceTemplate {
        ServiceTemplate::builder("tpl-web", "web")
            .image("nginx:1.27")
            .port(8080, 80)
            .port(8443, 443)
            .env("MODE", "prod")
            .env("LOG", "info")
            .label("team", "platform")
            .healthcheck(Healthcheck {
                test: Some(vec!["CMD".into(), "curl".into(), "localhost".into()]),
                interval_secs: Some(30),
                retries: Some(3),
                ..Default::default()
            })
            .config_file("/etc/nginx/nginx.conf", "worker_processes 1;")
            .config_file("/etc/nginx/mime.types", "types {}")
            .depends_on("db", "service_healthy")
            .build()
    }

    #[test]
    fn test_absent_overrides_inherit_template() {
        let template = web();
        let (config, applied) = resolve("s1", "web-a", &template, &OverrideBundle::default());

        assert_eq!(config.ports, template.ports);
        assert_eq!(config.healthcheck, template.healthcheck);
        assert_eq!(config.config_files, template.config_files);
        assert_eq!(config.dependencies, template.dependencies);
        assert_eq!(applied, OverridesApplied::default());
        assert_eq!(config.container_name, "devarch-s1-web-a");
        assert_eq!(config.network_name, "devarch-s1-net");
    }

    #[test]
    fn test_list_override_replaces_template_rows() {
        let mut overrides = OverrideBundle::default();
        overrides.set(OverrideSet::Ports(vec![PortMapping::tcp(9000, 80)]));

        let (config, applied) = resolve("s1", "web-a", &web(), &overrides);
        assert_eq!(config.ports, vec![PortMapping::tcp(9000, 80)]);
        assert!(applied.ports);
    }

    #[test]
    fn test_present_empty_list_clears() {
        let mut overrides = OverrideBundle::default();
        overrides.set(OverrideSet::Ports(vec![]));

        let (config, applied) = resolve("s1", "web-a", &web(), &overrides);
        assert!(config.ports.is_empty());
        assert!(applied.ports);
    }

    #[test]
    fn test_env_merges_by_key_and_injects_identity() {
        let mut overrides = OverrideBundle::default();
        overrides.set(OverrideSet::EnvVars(BTreeMap::from([
            ("MODE".to_string(), EnvVar::plain("dev")),
            ("DEVARCH_STACK_ID".to_string(), EnvVar::plain("spoofed")),
            ("EXTRA".to_string(), EnvVar::plain("1")),
        ])));

        let (config, _) = resolve("s1", "web-a", &web(), &overrides);
        let env = config.env_map();
        assert_eq!(env["MODE"], "dev");
        assert_eq!(env["LOG"], "info");
        assert_eq!(env["EXTRA"], "1");
        assert_eq!(env["DEVARCH_STACK_ID"], "s1");
        assert_eq!(env["DEVARCH_INSTANCE_ID"], "web-a");
        assert_eq!(env["DEVARCH_TEMPLATE_ID"], "tpl-web");
    }

    #[test]
    fn test_present_empty_env_still_flagged() {
        let mut overrides = OverrideBundle::default();
        overrides.set(OverrideSet::EnvVars(BTreeMap::new()));

        let (config, applied) = resolve("s1", "web-a", &web(), &overrides);
        assert!(applied.env_vars);
        assert_eq!(config.env_map()["MODE"], "prod");
    }

    #[test]
    fn test_reserved_labels_stripped_and_identity_injected() {
        let mut overrides = OverrideBundle::default();
        overrides.set(OverrideSet::Labels(BTreeMap::from([
            ("devarch.managed_by".to_string(), "someone-else".to_string()),
            ("tier".to_string(), "frontend".to_string()),
        ])));

        let (config, _) = resolve("s1", "web-a", &web(), &overrides);
        assert!(naming::is_managed(&config.labels));
        assert_eq!(config.labels["tier"], "frontend");
        assert_eq!(config.labels["team"], "platform");
    }

    #[test]
    fn test_healthcheck_override_replaces_whole_object() {
        let mut overrides = OverrideBundle::default();
        overrides.set(OverrideSet::Healthcheck(Healthcheck {
            interval_secs: Some(5),
            ..Default::default()
        }));

        let (config, applied) = resolve("s1", "i1", &web(), &overrides);
        let hc = config.healthcheck.unwrap();
        assert_eq!(hc.interval_secs, Some(5));
        assert_eq!(hc.test, None);
        assert_eq!(hc.retries, None);
        assert!(applied.healthcheck);
    }

    #[test]
    fn test_empty_healthcheck_override_is_kept_verbatim() {
        let mut overrides = OverrideBundle::default();
        overrides.set(OverrideSet::Healthcheck(Healthcheck::default()));

        let (config, applied) = resolve("s1", "i1", &web(), &overrides);
        assert_eq!(config.healthcheck, Some(Healthcheck::default()));
        assert!(applied.healthcheck);
    }

    #[test]
    fn test_config_files_merge_by_path() {
        let mut overrides = OverrideBundle::default();
        overrides.set(OverrideSet::ConfigFiles(BTreeMap::from([
            ("/etc/nginx/nginx.conf".to_string(), ConfigFile::new("worker_processes 4;")),
            ("/etc/nginx/extra.conf".to_string(), ConfigFile::new("")),
        ])));

        let (config, _) = resolve("s1", "web-a", &web(), &overrides);
        assert_eq!(config.config_files.len(), 3);
        assert_eq!(config.config_files["/etc/nginx/nginx.conf"].content, "worker_processes 4;");
        assert_eq!(config.config_files["/etc/nginx/mime.types"].content, "types {}");
    }

    #[test]
    fn test_dependencies_never_flagged() {
        let (config, applied) = resolve("s1", "web-a", &web(), &OverrideBundle::default());
        assert!(!applied.get(OverrideKind::Dependencies));
        assert_eq!(config.dependencies.len(), 1);
    }

    #[test]
    fn test_stale_kinds() {
        let template = web();
        let mut overrides = OverrideBundle::default();
        overrides.set(OverrideSet::Ports(template.ports.clone()));
        overrides.set(OverrideSet::EnvVars(BTreeMap::from([(
            "MODE".to_string(),
            EnvVar::plain("prod"),
        )])));
        overrides.set(OverrideSet::Labels(BTreeMap::from([(
            "team".to_string(),
            "other".to_string(),
        )])));
        overrides.set(OverrideSet::Healthcheck(Healthcheck::default()));

        assert_eq!(
            stale_kinds(&template, &overrides),
            vec![OverrideKind::Ports, OverrideKind::EnvVars]
        );
    }
}
