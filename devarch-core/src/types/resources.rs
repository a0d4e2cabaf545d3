//! Resource records shared by templates, overrides and effective configs.

use serde::{Deserialize, Serialize};

/// Network protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Port publication (host:container).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host interface to bind, all interfaces when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,

    /// Host port, ephemeral when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,

    /// Container port
    pub container_port: u16,

    /// Protocol (tcp, udp)
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortMapping {
    pub fn tcp(host_port: u16, container_port: u16) -> Self {
        Self { host_ip: None, host_port: Some(host_port), container_port, protocol: Protocol::Tcp }
    }
}

/// Volume or bind mount.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeMount {
    /// "volume" or "bind"
    pub volume_type: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Environment variable value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvVar {
    pub value: String,

    /// Secret values are masked in logs and plan output by callers
    #[serde(default)]
    pub secret: bool,
}

impl EnvVar {
    pub fn plain(value: impl Into<String>) -> Self {
        Self { value: value.into(), secret: false }
    }
}

/// Domain routed to the instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Domain {
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
}

/// Health check definition.
///
/// Every field is optional. An override replaces the template object as a
/// whole, so unset fields stay unset in the effective config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Healthcheck {
    /// Health check command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<Vec<String>>,

    /// Interval between checks (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,

    /// Timeout for each check (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Number of retries before marking unhealthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    /// Grace period after start (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period_secs: Option<u64>,
}

/// File rendered into the container, keyed by path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigFile {
    pub content: String,
    #[serde(default = "default_file_mode")]
    pub mode: String,
}

fn default_file_mode() -> String {
    "0644".to_string()
}

impl ConfigFile {
    pub fn new(content: impl Into<String>) -> Self {
        Self { content: content.into(), mode: default_file_mode() }
    }
}

/// Template-level start dependency on another service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub service: String,
    /// e.g. "service_started", "service_healthy"
    pub condition: String,
}

/// Capability a template offers to other instances.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExportContract {
    pub name: String,
    /// Contract type, e.g. "sql" or "http"
    pub contract: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Capability a template needs from another instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImportContract {
    pub name: String,
    pub contract: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}
