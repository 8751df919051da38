//! Runtime settings schema, typed for serde YAML deserialization.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the valet runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Base directory for durable state (conversation log, trigger store).
    pub data_dir: PathBuf,
    pub logging: LoggingSettings,
    pub executor: ExecutorSettings,
    pub interaction: InteractionSettings,
    pub scheduler: SchedulerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|home| home.join(".valet"))
            .unwrap_or_else(|| PathBuf::from(".valet"));
        Self {
            data_dir,
            logging: LoggingSettings::default(),
            executor: ExecutorSettings::default(),
            interaction: InteractionSettings::default(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl Settings {
    pub fn conversation_log_path(&self) -> PathBuf {
        self.data_dir.join("conversation").join("conversation.log")
    }

    pub fn trigger_store_path(&self) -> PathBuf {
        self.data_dir.join("triggers.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorSettings {
    /// Maximum tool-call rounds per execution run.
    pub max_tool_iterations: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_tool_iterations: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InteractionSettings {
    /// Bounded size of the duplicate-detection cache.
    pub duplicate_cache_size: usize,
    /// Window within which identical same-role content is suppressed.
    pub duplicate_window_secs: u64,
}

impl Default for InteractionSettings {
    fn default() -> Self {
        Self {
            duplicate_cache_size: 100,
            duplicate_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    /// Consecutive failures before a trigger gives up and notifies.
    pub failure_threshold: u32,
    pub retry_base_delay_secs: u64,
    pub retry_backoff_factor: f64,
    pub retry_max_delay_secs: u64,
    /// Delay between attempts when the trigger store itself is unavailable.
    pub store_retry_delay_secs: u64,
    /// Upper bound on how long the loop sleeps with no due trigger.
    pub idle_wake_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            retry_base_delay_secs: 30,
            retry_backoff_factor: 2.0,
            retry_max_delay_secs: 3_600,
            store_retry_delay_secs: 5,
            idle_wake_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.executor.max_tool_iterations, 12);
        assert_eq!(settings.scheduler.failure_threshold, 3);
        assert!(settings.scheduler.retry_max_delay_secs >= settings.scheduler.retry_base_delay_secs);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = "executor:\n  maxToolIterations: 5\n";
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.executor.max_tool_iterations, 5);
        assert_eq!(settings.scheduler.failure_threshold, 3);
    }
}
