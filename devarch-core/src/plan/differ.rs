//! Field-level diff between an applied snapshot and the live effective config.

use crate::plan::{FieldChange, ValueSource};
use crate::types::{EffectiveConfig, EnvVar, OverrideKind};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

const MASK: &str = "********";

/// One comparable field of an effective config.
struct Field {
    name: &'static str,
    value: Value,
    source: ValueSource,
}

fn fields(config: &EffectiveConfig) -> Vec<(Field, Value)> {
    let applied = &config.overrides_applied;
    let source = |kind: OverrideKind| {
        if applied.get(kind) {
            ValueSource::Override
        } else {
            ValueSource::Template
        }
    };

    // (field, comparison value); the displayed value masks secrets
    let plain = |name: &'static str, value: Value, src: ValueSource| {
        (Field { name, value: value.clone(), source: src }, value)
    };

    vec![
        plain("template", Value::String(config.template_id.clone()), ValueSource::Template),
        plain("image", Value::String(config.image.clone()), ValueSource::Template),
        plain("restart_policy", Value::String(config.restart_policy.clone()), ValueSource::Template),
        plain("command", to_value(&config.command), ValueSource::Template),
        plain("ports", to_value(&config.ports), source(OverrideKind::Ports)),
        plain("volumes", to_value(&config.volumes), source(OverrideKind::Volumes)),
        (
            Field {
                name: "env_vars",
                value: masked_env(&config.env),
                source: source(OverrideKind::EnvVars),
            },
            to_value(&config.env),
        ),
        plain("labels", to_value(&config.labels), source(OverrideKind::Labels)),
        plain("domains", to_value(&config.domains), source(OverrideKind::Domains)),
        plain("healthcheck", to_value(&config.healthcheck), source(OverrideKind::Healthcheck)),
        plain("config_files", to_value(&config.config_files), source(OverrideKind::ConfigFiles)),
        plain("dependencies", to_value(&config.dependencies), ValueSource::Template),
        plain("exports", to_value(&config.exports), ValueSource::Template),
        plain("imports", to_value(&config.imports), ValueSource::Template),
    ]
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn masked_env(env: &BTreeMap<String, EnvVar>) -> Value {
    let masked: BTreeMap<&str, &str> = env
        .iter()
        .map(|(k, v)| (k.as_str(), if v.secret { MASK } else { v.value.as_str() }))
        .collect();
    to_value(&masked)
}

/// Diff `live` against the last applied config.
///
/// A field is reported when its value or its provenance changed. With no
/// previous config every non-empty field is reported as new.
pub fn diff(previous: Option<&EffectiveConfig>, live: &EffectiveConfig) -> BTreeMap<String, FieldChange> {
    let mut changes = BTreeMap::new();

    let Some(previous) = previous else {
        for (field, _) in fields(live) {
            if !is_empty(&field.value) {
                changes.insert(
                    field.name.to_string(),
                    FieldChange { old: None, new: Some(field.value), old_source: None, new_source: Some(field.source) },
                );
            }
        }
        return changes;
    };

    for ((old, old_cmp), (new, new_cmp)) in fields(previous).into_iter().zip(fields(live)) {
        if old_cmp != new_cmp || old.source != new.source {
            changes.insert(
                new.name.to_string(),
                FieldChange {
                    old: Some(old.value),
                    new: Some(new.value),
                    old_source: Some(old.source),
                    new_source: Some(new.source),
                },
            );
        }
    }

    changes
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
