//! Config file resolution and loading.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::env::apply_env_overrides;
use crate::schema::Settings;

const CONFIG_FILE_NAME: &str = "config.yaml";

/// Resolve the valet config directory.
/// Priority: `VALET_CONFIG_DIR` env > `~/.valet/`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("VALET_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .map(|home| home.join(".valet"))
        .unwrap_or_else(|| PathBuf::from(".valet"))
}

pub fn config_file_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE_NAME)
}

/// Load settings from disk, falling back to defaults when the file does not
/// exist, then apply environment overrides.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let mut settings = if path.exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let parsed: Settings = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config YAML at: {}", path.display()))?;
        info!(path = %path.display(), "Loaded config");
        parsed
    } else {
        debug!(path = %path.display(), "Config file does not exist; using defaults");
        Settings::default()
    };

    apply_env_overrides(&mut settings);
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let settings = load_settings(Path::new("/nonexistent/valet-config.yaml")).unwrap();
        assert_eq!(settings.executor.max_tool_iterations, 12);
    }
}
