//! Stateless identity helpers.
//!
//! Every identity-bearing value (container name, network name, identity
//! labels and env) is a pure function of the stack and instance names.

use crate::error::{DevarchError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

/// Prefix reserved for system labels.
pub const LABEL_PREFIX: &str = "devarch.";
/// Prefix reserved for system environment variables.
pub const ENV_PREFIX: &str = "DEVARCH_";

pub const LABEL_MANAGED_BY: &str = "devarch.managed_by";
pub const LABEL_STACK_ID: &str = "devarch.stack_id";
pub const LABEL_INSTANCE_ID: &str = "devarch.instance_id";
pub const LABEL_TEMPLATE_ID: &str = "devarch.template_id";
pub const MANAGED_BY_VALUE: &str = "devarch";

pub const ENV_STACK_ID: &str = "DEVARCH_STACK_ID";
pub const ENV_INSTANCE_ID: &str = "DEVARCH_INSTANCE_ID";
pub const ENV_TEMPLATE_ID: &str = "DEVARCH_TEMPLATE_ID";

const MAX_NAME_LEN: usize = 63;
const MAX_CONTAINER_NAME_LEN: usize = 127;

static DNS_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("static regex"));

const RESERVED_NAMES: &[&str] = &["default", "devarch", "system", "none", "all"];

/// Container name for an instance of a stack.
pub fn container_name(stack: &str, instance: &str) -> String {
    format!("devarch-{}-{}", stack, instance)
}

/// Network name for a stack.
pub fn network_name(stack: &str) -> String {
    format!("devarch-{}-net", stack)
}

/// Identity labels injected into every effective config.
pub fn identity_labels(stack: &str, instance: &str, template_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
        (LABEL_STACK_ID.to_string(), stack.to_string()),
        (LABEL_INSTANCE_ID.to_string(), instance.to_string()),
        (LABEL_TEMPLATE_ID.to_string(), template_id.to_string()),
    ])
}

/// Identity env vars injected into every effective config.
pub fn identity_env(stack: &str, instance: &str, template_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (ENV_STACK_ID.to_string(), stack.to_string()),
        (ENV_INSTANCE_ID.to_string(), instance.to_string()),
        (ENV_TEMPLATE_ID.to_string(), template_id.to_string()),
    ])
}

pub fn is_reserved_label(key: &str) -> bool {
    key.starts_with(LABEL_PREFIX)
}

pub fn is_reserved_env(key: &str) -> bool {
    key.starts_with(ENV_PREFIX)
}

/// Whether a label set marks a container as managed by DevArch.
pub fn is_managed(labels: &BTreeMap<String, String>) -> bool {
    labels.get(LABEL_MANAGED_BY).map(String::as_str) == Some(MANAGED_BY_VALUE)
}

/// Validate a stack or instance name.
///
/// The error message carries a slugified suggestion when the name is merely malformed.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: String| DevarchError::InvalidName { name: name.to_string(), reason };

    if name.is_empty() {
        return Err(invalid("name cannot be empty".to_string()));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(invalid(format!("must be {} characters or less", MAX_NAME_LEN)));
    }

    if RESERVED_NAMES.contains(&name.to_lowercase().as_str()) {
        return Err(invalid("reserved name".to_string()));
    }

    if !DNS_NAME.is_match(name) {
        return Err(invalid(format!(
            "must be lowercase alphanumeric with hyphens, try: {}",
            slugify(name)
        )));
    }

    Ok(())
}

/// Validate the combined container name for a stack/instance pair.
pub fn validate_container_name(stack: &str, instance: &str) -> Result<()> {
    let name = container_name(stack, instance);
    if name.len() > MAX_CONTAINER_NAME_LEN {
        return Err(DevarchError::InvalidName {
            name,
            reason: format!("container name exceeds {} characters", MAX_CONTAINER_NAME_LEN),
        });
    }
    Ok(())
}

/// Convert arbitrary input into a DNS-safe name.
pub fn slugify(input: &str) -> String {
    let lowered = input.to_lowercase().replace([' ', '_'], "-");

    let mut slug = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        let keep = c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-';
        if keep && !(c == '-' && slug.ends_with('-')) {
            slug.push(c);
        }
    }

    let mut slug = slug.trim_matches('-').to_string();
    if slug.len() > MAX_NAME_LEN {
        slug.truncate(MAX_NAME_LEN);
        slug = slug.trim_end_matches('-').to_string();
    }

    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug
    }
}

/// Environment variable prefix derived from an import name (`primary-db` -> `PRIMARY_DB`).
pub fn binding_prefix(import_name: &str) -> String {
    import_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}
