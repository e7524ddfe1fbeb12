//! Configuration validation.
//!
//! Checks a loaded [`RoostConfig`] for values that would break operations and
//! detects unknown or misspelled keys in config files.

use std::path::{Path, PathBuf};

use crate::{env_subst::substitute_env, loader::parse_config, schema::RoostConfig};

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
    /// Category: "syntax", "unknown-field", "value"
    pub category: &'static str,
    /// Dotted path, e.g. "operations.completion_timeout_secs"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

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

const KNOWN_KEYS: &[(&str, &[&str])] = &[
    ("registry", &["path"]),
    ("operations", &[
        "completion_timeout_secs",
        "success_notice_ms",
        "failure_notice_ms",
    ]),
    ("watcher", &["debounce_ms", "max_depth", "ignored_dirs"]),
    ("preferences", &[
        "editor",
        "copy_include_files",
        "operation_mode",
        "sort_by_name",
    ]),
];

/// Validate semantic constraints on an already-parsed config.
pub fn validate(config: &RoostConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if config.operations.completion_timeout_secs == 0 {
        result.push(
            Severity::Error,
            "value",
            "operations.completion_timeout_secs",
            "must be greater than zero or every operation rolls back immediately",
        );
    }

    for (i, file) in config.preferences.copy_include_files.iter().enumerate() {
        let path = format!("preferences.copy_include_files[{i}]");
        if file.trim().is_empty() {
            result.push(Severity::Warning, "value", path, "empty include entry");
        } else if Path::new(file)
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            result.push(
                Severity::Warning,
                "value",
                path,
                format!("`{file}` escapes the project folder and is skipped during copies"),
            );
        }
    }

    if !config.preferences.editor.is_known_preset() {
        result.push(
            Severity::Info,
            "value",
            "preferences.editor",
            format!(
                "`{}` is not a preset editor; it is launched by name",
                config.preferences.editor.app_name()
            ),
        );
    }

    result
}

/// Parse and validate a config file, reporting syntax errors and unknown keys.
pub fn validate_file(path: &Path) -> ValidationResult {
    let mut result = ValidationResult {
        config_path: Some(path.to_path_buf()),
        ..Default::default()
    };

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => substitute_env(&raw),
        Err(e) => {
            result.push(Severity::Error, "syntax", "", format!("cannot read: {e}"));
            return result;
        },
    };

    if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        match raw.parse::<toml::Table>() {
            Ok(table) => check_unknown_keys(&table, &mut result),
            Err(e) => {
                result.push(Severity::Error, "syntax", "", e.to_string());
                return result;
            },
        }
    }

    match parse_config(&raw, path) {
        Ok(config) => result.diagnostics.extend(validate(&config).diagnostics),
        Err(e) => result.push(Severity::Error, "syntax", "", e.to_string()),
    }
    result
}

fn check_unknown_keys(table: &toml::Table, result: &mut ValidationResult) {
    for (section, value) in table {
        let Some((_, known)) = KNOWN_KEYS.iter().find(|(name, _)| name == section) else {
            result.push(
                Severity::Warning,
                "unknown-field",
                section.clone(),
                "unknown section",
            );
            continue;
        };
        if let Some(inner) = value.as_table() {
            for key in inner.keys() {
                if !known.contains(&key.as_str()) {
                    result.push(
                        Severity::Warning,
                        "unknown-field",
                        format!("{section}.{key}"),
                        "unknown field",
                    );
                }
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::schema::EditorChoice};

    #[test]
    fn default_config_is_clean() {
        let result = validate(&RoostConfig::default());
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
    }

    #[test]
    fn zero_timeout_is_an_error() {
        let mut cfg = RoostConfig::default();
        cfg.operations.completion_timeout_secs = 0;
        let result = validate(&cfg);
        assert!(result.has_errors());
        assert_eq!(
            result.diagnostics[0].path,
            "operations.completion_timeout_secs"
        );
    }

    #[test]
    fn include_entries_are_checked() {
        let mut cfg = RoostConfig::default();
        cfg.preferences.copy_include_files = vec![" ".into(), "../secrets".into(), ".env".into()];
        cfg.preferences.editor = EditorChoice::Custom("zed".into());
        let result = validate(&cfg);
        assert!(!result.has_errors());
        assert_eq!(result.count(Severity::Warning), 2);
        assert_eq!(result.count(Severity::Info), 1);
    }

    #[test]
    fn unknown_keys_in_file_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roost.toml");
        std::fs::write(
            &path,
            "[watcher]\nmax_dept = 2\n\n[colours]\ntheme = \"dark\"\n",
        )
        .unwrap();
        let result = validate_file(&path);
        let paths: Vec<_> = result.diagnostics.iter().map(|d| d.path.as_str()).collect();
        assert!(paths.contains(&"watcher.max_dept"));
        assert!(paths.contains(&"colours"));
        assert!(!result.has_errors());
    }

    #[test]
    fn syntax_errors_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roost.toml");
        std::fs::write(&path, "[watcher\n").unwrap();
        let result = validate_file(&path);
        assert!(result.has_errors());
        assert_eq!(result.diagnostics[0].category, "syntax");
    }
}
