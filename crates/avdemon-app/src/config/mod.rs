//! Configuration for avd-demon
//!
//! A single TOML file, `<config_dir>/avd-demon/config.toml`. Every section
//! and field is optional; anything missing takes its default.

pub mod settings;
pub mod types;

pub use settings::{config_file, default_config_dir, load_settings, save_settings, set_sdk_path};
pub use types::*;
