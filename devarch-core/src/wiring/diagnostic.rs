//! Plan diagnostics.

use crate::error::DevarchError;
use serde::{Deserialize, Serialize};

/// Machine-readable diagnostic code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCode {
    AmbiguousWiring,
    MissingProvider,
    StaleOverride,
}

impl DiagnosticCode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AmbiguousWiring => "ambiguous_wiring",
            Self::MissingProvider => "missing_provider",
            Self::StaleOverride => "stale_override",
        }
    }
}

impl std::fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Diagnostic severity. Errors always block apply; warnings block unless confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Finding attached to a plan for a human to review before apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: DiagnosticCode,
    pub message: String,
    /// Instance the finding is about
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
}

impl Diagnostic {
    pub fn ambiguous(consumer: &str, contract: &str, candidates: Vec<String>) -> Self {
        Self {
            severity: Severity::Warning,
            code: DiagnosticCode::AmbiguousWiring,
            message: format!(
                "ambiguous: {} requires {}, candidates [{}]",
                consumer,
                contract,
                candidates.join(", ")
            ),
            instance: Some(consumer.to_string()),
            contract: Some(contract.to_string()),
            candidates,
        }
    }

    pub fn missing_provider(consumer: &str, contract: &str, required: bool) -> Self {
        Self {
            severity: if required { Severity::Error } else { Severity::Warning },
            code: DiagnosticCode::MissingProvider,
            message: format!("missing provider: {} requires {}, no candidates", consumer, contract),
            instance: Some(consumer.to_string()),
            contract: Some(contract.to_string()),
            candidates: Vec::new(),
        }
    }

    pub fn stale_override(instance: &str, kind: &str) -> Self {
        Self {
            severity: Severity::Info,
            code: DiagnosticCode::StaleOverride,
            message: format!("{} override on {} matches the template and has no effect", kind, instance),
            instance: Some(instance.to_string()),
            contract: None,
            candidates: Vec::new(),
        }
    }

    pub fn blocks_apply(&self, warnings_confirmed: bool) -> bool {
        match self.severity {
            Severity::Error => true,
            Severity::Warning => !warnings_confirmed,
            Severity::Info => false,
        }
    }

    /// The error this diagnostic becomes under strict wiring, if it is a wiring finding.
    pub fn to_strict_error(&self) -> Option<DevarchError> {
        let consumer = self.instance.clone().unwrap_or_default();
        let contract = self.contract.clone().unwrap_or_default();
        match self.code {
            DiagnosticCode::AmbiguousWiring => Some(DevarchError::AmbiguousWiring {
                consumer,
                contract,
                candidates: self.candidates.clone(),
            }),
            DiagnosticCode::MissingProvider => Some(DevarchError::MissingProvider { consumer, contract }),
            DiagnosticCode::StaleOverride => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_rules() {
        let ambiguous = Diagnostic::ambiguous("web-a", "sql", vec!["db-a".into(), "db-b".into()]);
        assert!(ambiguous.blocks_apply(false));
        assert!(!ambiguous.blocks_apply(true));

        let missing = Diagnostic::missing_provider("web-a", "sql", true);
        assert!(missing.blocks_apply(true));

        assert!(!Diagnostic::stale_override("web-a", "ports").blocks_apply(false));
    }

    #[test]
    fn test_strict_escalation() {
        let err = Diagnostic::ambiguous("web-a", "sql", vec!["db-a".into(), "db-b".into()])
            .to_strict_error()
            .unwrap();
        assert_eq!(err.to_string(), "Ambiguous wiring: web-a requires sql, candidates [db-a, db-b]");
        assert!(Diagnostic::stale_override("web-a", "ports").to_strict_error().is_none());
    }
}
