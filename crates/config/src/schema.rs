//! Config schema types (viewer, filters).

use {
    mimeview_common::MimeType,
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MimeviewConfig {
    pub viewer: ViewerConfig,
    /// Preprocessing filters, first match wins.
    pub filters: Vec<FilterRule>,
}

/// How alternative preferences resolve when several rules match parts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlternativePolicy {
    /// The earliest configured alternative with any matching part wins.
    #[default]
    FirstRule,
    /// Every alternative is scanned and the last one with a matching part
    /// wins. Matches how older configurations were resolved.
    LastRule,
}

/// Message viewer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Interactive pager command run through the shell. Defaults to `less -R`.
    pub pager: String,
    /// Shell used to run filters and the pager as `<shell> -c <command>`.
    pub shell: String,
    /// Preferred part types, most preferred first.
    pub alternatives: Vec<MimeType>,
    pub alternative_policy: AlternativePolicy,
    /// Header keys forwarded to the pager, matched exactly.
    pub show_headers: Vec<String>,
    /// Kill a filter that runs longer than this. `None` waits forever.
    pub preprocess_timeout_secs: Option<u64>,
    /// Per-stream cap on captured filter output.
    pub max_capture_bytes: usize,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            pager: "less -R".into(),
            shell: "sh".into(),
            alternatives: vec![MimeType::new("text", "plain"), MimeType::new("text", "html")],
            alternative_policy: AlternativePolicy::default(),
            show_headers: ["From", "To", "Cc", "Bcc", "Subject", "Date"]
                .into_iter()
                .map(String::from)
                .collect(),
            preprocess_timeout_secs: None,
            max_capture_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ViewerConfig {
    /// Whether a header key is on the forwarding allow-list.
    #[must_use]
    pub fn shows_header(&self, key: &str) -> bool {
        self.show_headers.iter().any(|h| h == key)
    }
}

/// Maps a `type/subtype` (subtype may be `*`) to a filter command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub mime: MimeType,
    pub command: String,
}

impl FilterRule {
    pub fn new(mime: MimeType, command: impl Into<String>) -> Self {
        Self {
            mime,
            command: command.into(),
        }
    }
}

impl MimeviewConfig {
    /// The first filter whose rule matches `type_`/`subtype`.
    #[must_use]
    pub fn filter_for(&self, type_: &str, subtype: &str) -> Option<&FilterRule> {
        self.filters.iter().find(|f| f.mime.matches(type_, subtype))
    }
}
