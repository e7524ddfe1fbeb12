use std::{
    path::{Path, PathBuf},
    sync::RwLock,
};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::RoostConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["roost.toml", "roost.yaml", "roost.yml", "roost.json"];

const REGISTRY_FILENAME: &str = "registry.toml";

static CONFIG_DIR_OVERRIDE: RwLock<Option<PathBuf>> = RwLock::new(None);
static DATA_DIR_OVERRIDE: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Use `dir` instead of `~/.config/roost/` for config discovery and saving.
pub fn set_config_dir(dir: PathBuf) {
    if let Ok(mut guard) = CONFIG_DIR_OVERRIDE.write() {
        *guard = Some(dir);
    }
}

pub fn clear_config_dir() {
    if let Ok(mut guard) = CONFIG_DIR_OVERRIDE.write() {
        *guard = None;
    }
}

/// Use `dir` instead of the platform data directory for the registry file.
pub fn set_data_dir(dir: PathBuf) {
    if let Ok(mut guard) = DATA_DIR_OVERRIDE.write() {
        *guard = Some(dir);
    }
}

pub fn clear_data_dir() {
    if let Ok(mut guard) = DATA_DIR_OVERRIDE.write() {
        *guard = None;
    }
}

fn read_override(lock: &RwLock<Option<PathBuf>>) -> Option<PathBuf> {
    lock.read().ok().and_then(|guard| guard.clone())
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<RoostConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./roost.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/roost/roost.{toml,yaml,yml,json}` (user-global)
///
/// Returns `RoostConfig::default()` if no config file is found or it fails
/// to parse.
pub fn discover_and_load() -> RoostConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    RoostConfig::default()
}

fn find_config_file() -> Option<PathBuf> {
    if read_override(&CONFIG_DIR_OVERRIDE).is_none() {
        for name in CONFIG_FILENAMES {
            let p = PathBuf::from(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the config directory (`~/.config/roost/` unless overridden).
pub fn config_dir() -> Option<PathBuf> {
    read_override(&CONFIG_DIR_OVERRIDE).or_else(|| {
        directories::ProjectDirs::from("", "", "roost").map(|d| d.config_dir().to_path_buf())
    })
}

/// Returns the data directory holding the registry (unless overridden).
pub fn data_dir() -> Option<PathBuf> {
    read_override(&DATA_DIR_OVERRIDE).or_else(|| {
        directories::ProjectDirs::from("", "", "roost").map(|d| d.data_dir().to_path_buf())
    })
}

/// Resolve the registry file: the configured path, or `<data_dir>/registry.toml`.
pub fn registry_path(config: &RoostConfig) -> PathBuf {
    if let Some(path) = &config.registry.path {
        return path.clone();
    }
    data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(REGISTRY_FILENAME)
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn find_or_default_config_path() -> PathBuf {
    if let Some(path) = find_config_file() {
        return path;
    }
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("roost.toml")
}

/// Serialize `config` to TOML and write it to the resolved config path.
///
/// Creates parent directories if needed. Returns the path written to.
pub fn save_config(config: &RoostConfig) -> anyhow::Result<PathBuf> {
    let path = find_or_default_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str =
        toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serialize config: {e}"))?;
    std::fs::write(&path, toml_str)?;
    debug!(path = %path.display(), "saved config");
    Ok(path)
}

pub(crate) fn parse_config(raw: &str, path: &Path) -> anyhow::Result<RoostConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::schema::MoveMode};

    #[test]
    fn parses_every_supported_format() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("roost.toml");
        std::fs::write(&toml_path, "[watcher]\nmax_depth = 2\n").unwrap();
        assert_eq!(load_config(&toml_path).unwrap().watcher.max_depth, 2);

        let yaml_path = dir.path().join("roost.yaml");
        std::fs::write(&yaml_path, "preferences:\n  operation_mode: copy\n").unwrap();
        assert_eq!(
            load_config(&yaml_path).unwrap().preferences.operation_mode,
            MoveMode::Copy
        );

        let json_path = dir.path().join("roost.json");
        std::fs::write(&json_path, r#"{"operations": {"completion_timeout_secs": 5}}"#).unwrap();
        assert_eq!(
            load_config(&json_path)
                .unwrap()
                .operations
                .completion_timeout_secs,
            5
        );
    }

    #[test]
    fn rejects_unknown_extension() {
        let err = parse_config("", Path::new("roost.ini")).unwrap_err();
        assert!(err.to_string().contains("unsupported config format"));
    }

    #[test]
    fn registry_path_prefers_explicit_setting() {
        let mut cfg = RoostConfig::default();
        cfg.registry.path = Some(PathBuf::from("/tmp/custom-registry.toml"));
        assert_eq!(
            registry_path(&cfg),
            PathBuf::from("/tmp/custom-registry.toml")
        );

        cfg.registry.path = None;
        assert!(registry_path(&cfg).ends_with(REGISTRY_FILENAME));
    }
}
