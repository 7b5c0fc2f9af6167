//! Settings parser for `<config dir>/avd-demon/config.toml`

use super::types::Settings;
use avdemon_core::prelude::*;
use avdemon_daemon::is_valid_sdk_root;
use std::path::{Path, PathBuf};

const CONFIG_FILENAME: &str = "config.toml";
const APP_DIR: &str = "avd-demon";

/// Platform config directory for AVD Demon (`~/.config/avd-demon` on Linux)
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR))
}

/// Path of the settings file inside `config_dir`
pub fn config_file(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILENAME)
}

/// Load settings from `config_dir`, falling back to defaults
///
/// A missing file is normal. An unreadable or invalid file is logged and ignored.
pub fn load_settings(config_dir: &Path) -> Settings {
    let config_path = config_file(config_dir);

    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", config_path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", config_path, e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", config_path, e);
            Settings::default()
        }
    }
}

/// Save settings to `config_dir`, creating the directory if needed
pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir)
            .with_context(|| format!("Failed to create config dir {:?}", config_dir))?;
    }

    let config_path = config_file(config_dir);
    let temp_path = config_dir.join(".config.toml.tmp");

    let content = toml::to_string_pretty(settings)
        .map_err(|e| Error::config(format!("Failed to serialize settings: {}", e)))?;
    let full_content = format!("{}{}", generate_config_header(), content);

    // Atomic write: write to temp, then rename
    std::fs::write(&temp_path, &full_content)
        .with_context(|| format!("Failed to write {:?}", temp_path))?;

    std::fs::rename(&temp_path, &config_path)
        .with_context(|| format!("Failed to replace {:?}", config_path))?;

    info!("Saved settings to {:?}", config_path);
    Ok(())
}

/// Validate `path` as an SDK root and store it in `settings`
pub fn set_sdk_path(settings: &mut Settings, path: &Path) -> Result<()> {
    if !is_valid_sdk_root(path) {
        return Err(Error::invalid_sdk_path(path));
    }

    let path = dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    info!("SDK path set to {}", path.display());
    settings.sdk.path = Some(path);
    Ok(())
}

fn generate_config_header() -> String {
    r#"# AVD Demon Configuration
# Every key is optional; missing keys use built-in defaults.

"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_settings_defaults() {
        let temp = tempdir().unwrap();
        let settings = load_settings(temp.path());

        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_load_settings_custom() {
        let temp = tempdir().unwrap();
        let config = r#"
[reconcile]
interval_secs = 15

[watcher]
enabled = false
"#;
        std::fs::write(temp.path().join("config.toml"), config).unwrap();

        let settings = load_settings(temp.path());

        assert_eq!(settings.reconcile.interval_secs, 15);
        assert!(!settings.watcher.enabled);
        assert_eq!(settings.watcher.debounce_ms, 500);
    }

    #[test]
    fn test_load_settings_invalid_toml() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("config.toml"), "not valid toml {{{{").unwrap();

        // Should return defaults
        let settings = load_settings(temp.path());
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_save_settings_roundtrip() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("nested").join("avd-demon");

        let mut settings = Settings::default();
        settings.lifecycle.revert_unconfirmed_start = true;
        settings.commands.timeout_secs = 20;

        save_settings(&dir, &settings).unwrap();

        let content = std::fs::read_to_string(config_file(&dir)).unwrap();
        assert!(content.starts_with("# AVD Demon Configuration"));
        assert!(!dir.join(".config.toml.tmp").exists());
        assert_eq!(load_settings(&dir), settings);
    }

    #[test]
    fn test_save_settings_into_file_path_fails_with_io() {
        let temp = tempdir().unwrap();
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();

        let err = save_settings(&blocker.join("avdemon"), &Settings::default()).unwrap_err();

        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_set_sdk_path_validates() {
        let temp = tempdir().unwrap();
        let mut settings = Settings::default();

        let err = set_sdk_path(&mut settings, temp.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidSdkPath { .. }));
        assert_eq!(settings.sdk.path, None);

        std::fs::create_dir_all(temp.path().join("emulator")).unwrap();
        std::fs::create_dir_all(temp.path().join("platform-tools")).unwrap();
        set_sdk_path(&mut settings, temp.path()).unwrap();
        assert_eq!(
            settings.sdk.path,
            Some(dunce::canonicalize(temp.path()).unwrap())
        );
    }
}
