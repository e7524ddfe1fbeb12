//! Configuration loading, validation, and env substitution.
//!
//! Config files: `roost.toml`, `roost.yaml`, or `roost.json`
//! Searched in `./` then `~/.config/roost/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{
        clear_config_dir, clear_data_dir, config_dir, data_dir, discover_and_load,
        find_or_default_config_path, load_config, registry_path, save_config, set_config_dir,
        set_data_dir,
    },
    schema::{
        EditorChoice, MoveMode, OperationsConfig, Preferences, RegistryConfig, RoostConfig,
        SUPPORTED_EDITORS, WatcherConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate, validate_file},
};
