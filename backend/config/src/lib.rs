//! Typed runtime settings: YAML file + environment overrides + defaults.

pub mod env;
pub mod io;
pub mod schema;

pub use io::{config_dir, config_file_path, load_settings};
pub use schema::{
    ExecutorSettings, InteractionSettings, LoggingSettings, SchedulerSettings, Settings,
};
