//! Configuration loading, validation and env substitution.
//!
//! Config files: `mimeview.toml`, `mimeview.yaml` or `mimeview.json`,
//! searched in `./` then `~/.config/mimeview/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-fallback}` substitution in the raw
//! file before it is parsed.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{config_dir, discover_and_load, load_config},
    schema::{AlternativePolicy, FilterRule, MimeviewConfig, ViewerConfig},
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
