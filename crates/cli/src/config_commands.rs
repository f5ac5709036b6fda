use std::path::{Path, PathBuf};

use anyhow::Result;

use mimeview_config::{MimeviewConfig, Severity, ValidationResult, validate};

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Load the config named on the command line, or discover one.
///
/// An explicit path that fails to load is an error; discovery falls back to
/// defaults.
pub fn load(path: Option<&Path>) -> Result<MimeviewConfig> {
    match path {
        Some(path) => mimeview_config::load_config(path),
        None => Ok(mimeview_config::discover_and_load()),
    }
}

/// Print diagnostics for the active configuration. Returns whether any error
/// was reported.
pub fn check(path: Option<&PathBuf>, verbose: bool) -> Result<bool> {
    match path {
        Some(path) => eprintln!("Checking {}\n", path.display()),
        None => eprintln!("Checking discovered configuration\n"),
    }
    let config = load(path.map(PathBuf::as_path))?;
    let result = validate(&config);
    print_diagnostics(&result, verbose);
    Ok(result.has_errors())
}

fn print_diagnostics(result: &ValidationResult, verbose: bool) {
    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }

        let color = match d.severity {
            Severity::Error => RED,
            Severity::Warning => YELLOW,
            Severity::Info => CYAN,
        };

        if d.path.is_empty() {
            eprintln!("  {BOLD}{color}{}{RESET} {}", d.severity, d.message);
        } else {
            eprintln!(
                "  {BOLD}{color}{}{RESET} {}: {}",
                d.severity, d.path, d.message
            );
        }
        shown += 1;
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);

    if shown > 0 {
        eprintln!();
    }

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }
}
