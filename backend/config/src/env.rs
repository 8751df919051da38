//! Environment-variable overrides applied on top of the file config.

use std::path::PathBuf;

use tracing::warn;

use crate::schema::Settings;

/// Apply `VALET_*` environment overrides in place.
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(dir) = std::env::var("VALET_DATA_DIR") {
        settings.data_dir = PathBuf::from(dir);
    }
    if let Ok(level) = std::env::var("VALET_LOG_LEVEL") {
        settings.logging.level = level;
    }
    if let Ok(raw) = std::env::var("VALET_MAX_TOOL_ITERATIONS") {
        match raw.parse::<usize>() {
            Ok(value) if value > 0 => settings.executor.max_tool_iterations = value,
            _ => warn!(value = %raw, "Ignoring invalid VALET_MAX_TOOL_ITERATIONS"),
        }
    }
    if let Ok(raw) = std::env::var("VALET_FAILURE_THRESHOLD") {
        match raw.parse::<u32>() {
            Ok(value) if value > 0 => settings.scheduler.failure_threshold = value,
            _ => warn!(value = %raw, "Ignoring invalid VALET_FAILURE_THRESHOLD"),
        }
    }
}
