//! Configuration validation.
//!
//! Checks a loaded [`MimeviewConfig`] for settings that parse fine but can
//! never work: empty commands, filters shadowed by an earlier rule, and
//! alternatives that no part can satisfy.

use std::collections::HashSet;

use crate::schema::MimeviewConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "empty-command", "shadowed-filter", "unmatchable", "headers"
    pub category: &'static str,
    /// Dotted path, e.g. "filters[2].command"
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}: {}",
            self.severity, self.category, self.path, self.message
        )
    }
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(
        &mut self,
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.diagnostics.push(Diagnostic {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Validate a loaded configuration.
#[must_use]
pub fn validate(config: &MimeviewConfig) -> ValidationResult {
    let mut result = ValidationResult::default();
    let viewer = &config.viewer;

    if viewer.pager.trim().is_empty() {
        result.push(
            Severity::Error,
            "empty-command",
            "viewer.pager",
            "pager command is empty",
        );
    }
    if viewer.shell.trim().is_empty() {
        result.push(
            Severity::Error,
            "empty-command",
            "viewer.shell",
            "shell is empty",
        );
    }

    // A type-wide wildcard rule shadows every later rule of the same type.
    let mut wildcard_types: HashSet<&str> = HashSet::new();
    let mut seen = HashSet::new();
    for (i, filter) in config.filters.iter().enumerate() {
        if filter.command.trim().is_empty() {
            result.push(
                Severity::Error,
                "empty-command",
                format!("filters[{i}].command"),
                format!("filter for {} has an empty command", filter.mime),
            );
        }
        if wildcard_types.contains(filter.mime.type_.as_str()) || !seen.insert(&filter.mime) {
            result.push(
                Severity::Warning,
                "shadowed-filter",
                format!("filters[{i}]"),
                format!(
                    "filter for {} is unreachable, an earlier rule matches first",
                    filter.mime
                ),
            );
        }
        if filter.mime.is_wildcard() {
            wildcard_types.insert(filter.mime.type_.as_str());
        }
    }

    for (i, alt) in viewer.alternatives.iter().enumerate() {
        if alt.type_ == "*" {
            result.push(
                Severity::Warning,
                "unmatchable",
                format!("viewer.alternatives[{i}]"),
                format!("{alt} never matches: only the subtype may be a wildcard"),
            );
        }
    }

    if viewer.show_headers.is_empty() {
        result.push(
            Severity::Info,
            "headers",
            "viewer.show_headers",
            "no headers will be shown above message content",
        );
    }

    result
}
