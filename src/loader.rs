//! Harness config loader.
//!
//! Loads `fixtest.yaml` / `fixtest.toml` from disk and layers environment
//! overrides on top.

use crate::config::HarnessConfig;
use std::path::{Path, PathBuf};

/// Error type for config loading operations.
#[derive(Debug)]
pub enum LoadError {
    /// Failed to read the file.
    Io(std::io::Error),
    /// Failed to parse YAML.
    Yaml(serde_yaml::Error),
    /// Failed to parse TOML.
    Toml(toml::de::Error),
    /// Unsupported file extension.
    UnsupportedFormat(String),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io(e) => write!(f, "failed to read file: {e}"),
            LoadError::Yaml(e) => write!(f, "invalid YAML: {e}"),
            LoadError::Toml(e) => write!(f, "invalid TOML: {e}"),
            LoadError::UnsupportedFormat(ext) => {
                write!(
                    f,
                    "unsupported file format: {ext} (expected .yaml, .yml, or .toml)"
                )
            }
        }
    }
}

impl std::error::Error for LoadError {}

/// File names probed by [`load_config`], in order.
pub const CONFIG_FILENAMES: [&str; 2] = ["fixtest.yaml", "fixtest.toml"];

/// Load a harness config from a specific file path.
pub fn load_config_file(path: &Path) -> Result<HarnessConfig, LoadError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let contents = std::fs::read_to_string(path).map_err(LoadError::Io)?;

    match ext {
        "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(LoadError::Yaml),
        "toml" => toml::from_str(&contents).map_err(LoadError::Toml),
        other => Err(LoadError::UnsupportedFormat(other.to_string())),
    }
}

/// Load harness configuration from a directory.
///
/// Probes for `fixtest.yaml` then `fixtest.toml` in the given directory.
/// Returns `None` if neither exists, `Err` if one exists but is invalid.
pub fn load_config(dir: &Path) -> Result<Option<HarnessConfig>, LoadError> {
    for name in CONFIG_FILENAMES {
        let path = dir.join(name);
        if path.exists() {
            return load_config_file(&path).map(Some);
        }
    }
    Ok(None)
}

/// Resolve the effective config: explicit file, directory probe, or defaults,
/// always with env overrides applied last.
pub fn resolve_config(explicit: Option<&PathBuf>) -> Result<HarnessConfig, LoadError> {
    let mut config = match explicit {
        Some(path) => load_config_file(path)?,
        None => {
            let cwd = std::env::current_dir().map_err(LoadError::Io)?;
            load_config(&cwd)?.unwrap_or_default()
        }
    };
    config.apply_env();
    Ok(config)
}
