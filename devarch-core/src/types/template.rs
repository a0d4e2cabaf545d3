//! Service templates.
//!
//! A template holds the defaults every instance starts from. Instances
//! reference a template by id and layer an [`OverrideBundle`] on top.
//!
//! # Example
//!
//! ```
//! use devarch_core::types::ServiceTemplate;
//!
//! let postgres = ServiceTemplate::builder("tpl-postgres", "postgres")
//!     .image("postgres:16-alpine")
//!     .port(5432, 5432)
//!     .env("POSTGRES_DB", "app")
//!     .export("sql", "sql", Some(5432))
//!     .build();
//! assert_eq!(postgres.exports[0].contract, "sql");
//! ```
//!
//! [`OverrideBundle`]: crate::types::OverrideBundle

use crate::types::resources::{
    ConfigFile, Dependency, Domain, EnvVar, ExportContract, Healthcheck, ImportContract,
    PortMapping, VolumeMount,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A service template definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTemplate {
    /// Unique template identifier.
    pub id: String,

    /// Catalog name (e.g., "postgres").
    pub name: String,

    /// Image reference (e.g., "postgres:16-alpine").
    pub image: String,

    /// Restart policy passed through to the emitter.
    #[serde(default = "default_restart_policy")]
    pub restart_policy: String,

    /// Command override for the image entrypoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub env: BTreeMap<String, EnvVar>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub domains: Vec<Domain>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Healthcheck>,
    #[serde(default)]
    pub config_files: BTreeMap<String, ConfigFile>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,

    /// Contracts this template provides.
    #[serde(default)]
    pub exports: Vec<ExportContract>,

    /// Contracts this template consumes.
    #[serde(default)]
    pub imports: Vec<ImportContract>,

    /// Bumped by the catalog on every update.
    #[serde(default)]
    pub revision: i64,
}

fn default_restart_policy() -> String {
    "unless-stopped".to_string()
}

impl ServiceTemplate {
    /// Create a new template builder.
    #[must_use]
    pub fn builder(id: impl Into<String>, name: impl Into<String>) -> TemplateBuilder {
        TemplateBuilder::new(id, name)
    }

    pub fn export(&self, name: &str) -> Option<&ExportContract> {
        self.exports.iter().find(|e| e.name == name)
    }

    pub fn import(&self, name: &str) -> Option<&ImportContract> {
        self.imports.iter().find(|i| i.name == name)
    }
}

/// Builder for creating templates.
#[derive(Debug)]
pub struct TemplateBuilder {
    template: ServiceTemplate,
}

impl TemplateBuilder {
    /// Create a new template builder with the given ID and name.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            template: ServiceTemplate {
                id: id.into(),
                name: name.into(),
                image: String::new(),
                restart_policy: default_restart_policy(),
                command: None,
                ports: Vec::new(),
                volumes: Vec::new(),
                env: BTreeMap::new(),
                labels: BTreeMap::new(),
                domains: Vec::new(),
                healthcheck: None,
                config_files: BTreeMap::new(),
                dependencies: Vec::new(),
                exports: Vec::new(),
                imports: Vec::new(),
                revision: 0,
            },
        }
    }

    /// Set the image reference.
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.template.image = image.into();
        self
    }

    pub fn restart_policy(mut self, policy: impl Into<String>) -> Self {
        self.template.restart_policy = policy.into();
        self
    }

    pub fn command(mut self, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.template.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    /// Add a TCP port mapping.
    pub fn port(mut self, host: u16, container: u16) -> Self {
        self.template.ports.push(PortMapping::tcp(host, container));
        self
    }

    /// Add a named volume mount.
    pub fn volume(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.template.volumes.push(VolumeMount {
            volume_type: "volume".to_string(),
            source: source.into(),
            target: target.into(),
            read_only: false,
        });
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.template.env.insert(key.into(), EnvVar::plain(value));
        self
    }

    /// Add a secret environment variable.
    pub fn secret_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.template.env.insert(key.into(), EnvVar { value: value.into(), secret: true });
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.template.labels.insert(key.into(), value.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>, proxy_port: Option<u16>) -> Self {
        self.template.domains.push(Domain { domain: domain.into(), proxy_port });
        self
    }

    pub fn healthcheck(mut self, healthcheck: Healthcheck) -> Self {
        self.template.healthcheck = Some(healthcheck);
        self
    }

    pub fn config_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.template.config_files.insert(path.into(), ConfigFile::new(content));
        self
    }

    pub fn depends_on(mut self, service: impl Into<String>, condition: impl Into<String>) -> Self {
        self.template
            .dependencies
            .push(Dependency { service: service.into(), condition: condition.into() });
        self
    }

    /// Declare an exported contract.
    pub fn export(
        mut self,
        name: impl Into<String>,
        contract: impl Into<String>,
        port: Option<u16>,
    ) -> Self {
        self.template.exports.push(ExportContract {
            name: name.into(),
            contract: contract.into(),
            port,
        });
        self
    }

    /// Declare a required imported contract.
    pub fn import(mut self, name: impl Into<String>, contract: impl Into<String>) -> Self {
        self.template.imports.push(ImportContract {
            name: name.into(),
            contract: contract.into(),
            required: true,
        });
        self
    }

    /// Declare an optional imported contract.
    pub fn optional_import(mut self, name: impl Into<String>, contract: impl Into<String>) -> Self {
        self.template.imports.push(ImportContract {
            name: name.into(),
            contract: contract.into(),
            required: false,
        });
        self
    }

    /// Build the template.
    #[must_use]
    pub fn build(self) -> ServiceTemplate {
        self.template
    }
}
