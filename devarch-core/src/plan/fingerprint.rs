//! State fingerprints.
//!
//! A fingerprint is a SHA-256 over the canonical JSON of every row that
//! went into a plan. Canonical means struct fields in declaration order and
//! maps as `BTreeMap`, so identical rows always hash identically.

use crate::error::Result;
use crate::repository::StackState;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Digest of one instance's contributing rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDigest {
    pub instance: String,
    pub digest: String,
}

/// Fingerprint of a whole stack plus per-instance digests keyed by instance uid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateFingerprint {
    pub fingerprint: String,
    pub instances: BTreeMap<String, InstanceDigest>,
}

fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

/// Compute the fingerprint of a loaded stack.
pub fn compute(state: &StackState) -> Result<StateFingerprint> {
    let mut instances = BTreeMap::new();
    for instance in &state.instances {
        let row = serde_json::to_vec(instance)?;
        let template = match state.templates.get(&instance.template_id) {
            Some(template) if instance.is_active() => serde_json::to_vec(template)?,
            _ => Vec::new(),
        };
        let digest = sha256_hex(&[row.as_slice(), template.as_slice()]);
        instances
            .insert(instance.uid.clone(), InstanceDigest { instance: instance.name.clone(), digest });
    }

    let stack = serde_json::to_vec(&state.stack)?;
    let digests = serde_json::to_vec(&instances)?;
    let mut wires = state.wires.clone();
    wires.sort();
    let wires = serde_json::to_vec(&wires)?;
    let mut edges = state.applied_edges.clone();
    edges.sort();
    let edges = serde_json::to_vec(&edges)?;

    Ok(StateFingerprint {
        fingerprint: sha256_hex(&[
            stack.as_slice(),
            digests.as_slice(),
            wires.as_slice(),
            edges.as_slice(),
        ]),
        instances,
    })
}

/// Names of instances whose digest differs between two fingerprints,
/// including instances that appeared or disappeared.
pub fn changed_instances(
    planned: &BTreeMap<String, InstanceDigest>,
    current: &BTreeMap<String, InstanceDigest>,
) -> Vec<String> {
    let mut changed: Vec<String> = planned
        .iter()
        .filter(|(uid, d)| current.get(*uid).map(|c| &c.digest) != Some(&d.digest))
        .map(|(_, d)| d.instance.clone())
        .chain(
            current
                .iter()
                .filter(|(uid, _)| !planned.contains_key(*uid))
                .map(|(_, d)| d.instance.clone()),
        )
        .collect();
    changed.sort();
    changed.dedup();
    changed
}
