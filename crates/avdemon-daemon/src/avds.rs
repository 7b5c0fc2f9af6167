//! Android AVD (Android Virtual Device) enumeration
//!
//! Names come from `emulator -list-avds`. Metadata is taken from
//! `avdmanager list avd` when it knows the image, else from the image's
//! `config.ini`, else from the `_API_nn` naming convention. Anything that
//! cannot be parsed degrades to defaults; enumeration itself never fails.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

use avdemon_core::prelude::*;
use avdemon_core::types::{is_valid_avd_name, AvdImage, MetadataSource, UNKNOWN_DEVICE};

use crate::command::{CommandRunner, RunMode, Tool};

/// Static regex pattern for extracting API level from AVD names
static API_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_API_(\d+)$").expect("Invalid API pattern regex"));

/// API level as printed by the various avdmanager releases
static API_LEVEL_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"(?i)API level\s+(\d+)").expect("Invalid API level regex"),
        Regex::new(r"\(API (\d+)\)").expect("Invalid API paren regex"),
        Regex::new(r"android-(\d+)").expect("Invalid android-N regex"),
    ]
});

/// avdmanager separates image blocks with a dashed line
const BLOCK_SEPARATOR: &str = "---------";

/// One `avdmanager list avd` block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvdManagerEntry {
    pub name: String,
    pub device: Option<String>,
    pub path: Option<PathBuf>,
    pub target: Option<String>,
    pub based_on: Option<String>,
    pub api_level: Option<String>,
}

/// Fields of interest from an image's `config.ini`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigIni {
    pub display_name: Option<String>,
    pub device_name: Option<String>,
    pub manufacturer: Option<String>,
    pub tag: Option<String>,
    pub api_level: Option<String>,
}

impl ConfigIni {
    /// "pixel_7 (Google)", or just the profile name without a manufacturer
    fn device_label(&self) -> Option<String> {
        let name = self.device_name.as_deref()?;
        Some(match self.manufacturer.as_deref() {
            Some(m) if !m.is_empty() => format!("{} ({})", name, m),
            _ => name.to_string(),
        })
    }

    fn has_metadata(&self) -> bool {
        self.device_name.is_some() || self.api_level.is_some() || self.display_name.is_some()
    }
}

/// List every locally registered image with the best metadata available.
///
/// `budget` bounds the whole pass. Only the name listing can exhaust it:
/// that yields `None`. Metadata enrichment gets whatever remains and, when it
/// runs out, images fall back to `config.ini` and the naming convention.
/// A missing `emulator` tool or empty output yields an empty list.
pub async fn list_images<R: CommandRunner + Sync>(
    runner: &R,
    budget: Duration,
) -> Option<Vec<AvdImage>> {
    let deadline = Instant::now() + budget;

    let listing = tokio::time::timeout_at(
        deadline,
        runner.run(Tool::Emulator, &["-list-avds"], RunMode::Foreground),
    )
    .await
    .ok()?;

    if listing.is_unresolvable() {
        warn!("emulator not found; no AVDs can be listed");
        return Some(Vec::new());
    }
    if listing.is_timed_out() {
        warn!("emulator -list-avds timed out; using partial output");
    }

    let names = parse_avd_list(&listing.text);
    if names.is_empty() {
        info!("No AVDs registered");
        return Some(Vec::new());
    }

    let details = tokio::time::timeout_at(
        deadline,
        runner.run(Tool::AvdManager, &["list", "avd"], RunMode::Foreground),
    )
    .await;
    let entries: HashMap<String, AvdManagerEntry> = match details {
        Err(_) => {
            warn!("avdmanager did not answer within the enumeration budget; using config.ini metadata");
            HashMap::new()
        }
        Ok(details) if details.is_unresolvable() => {
            debug!("avdmanager not available; using config.ini metadata");
            HashMap::new()
        }
        Ok(details) => parse_avdmanager_output(&details.text)
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect(),
    };

    let home = avd_home();
    let mut images = Vec::with_capacity(names.len());
    for name in names {
        let entry = entries.get(&name);
        let config = match config_ini_path(home.as_deref(), &name, entry) {
            Some(path) => read_config_ini(&path).await,
            None => None,
        };
        images.push(build_image(&name, entry, config.as_ref()));
    }

    debug!("Enumerated {} AVD(s)", images.len());
    Some(images)
}

/// Parse `emulator -list-avds`, keeping only lines that are AVD names
///
/// Newer emulators mix `INFO    | ...` log lines into the listing.
pub fn parse_avd_list(output: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    output
        .lines()
        .map(str::trim)
        .filter(|line| is_valid_avd_name(line))
        .filter(|line| seen.insert(line.to_string()))
        .map(str::to_string)
        .collect()
}

/// Parse `avdmanager list avd` into per-image blocks
pub fn parse_avdmanager_output(output: &str) -> Vec<AvdManagerEntry> {
    let mut entries = Vec::new();
    let mut current: Option<AvdManagerEntry> = None;

    for raw in output.lines() {
        let line = raw.trim();

        if line.starts_with(BLOCK_SEPARATOR) {
            entries.extend(current.take());
            continue;
        }

        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "Name" => {
                entries.extend(current.take());
                current = Some(AvdManagerEntry {
                    name: value.to_string(),
                    ..Default::default()
                });
            }
            "Device" => set_field(&mut current, |e| e.device = non_empty(value)),
            "Path" => set_field(&mut current, |e| e.path = non_empty(value).map(PathBuf::from)),
            "Target" => set_field(&mut current, |e| e.target = non_empty(value)),
            // "Based on: Android 13.0 (Tiramisu) Tag/ABI: google_apis/x86_64"
            "Based on" => set_field(&mut current, |e| e.based_on = non_empty(value)),
            _ => {}
        }
    }
    entries.extend(current);

    for entry in &mut entries {
        entry.api_level = entry
            .target
            .as_deref()
            .and_then(extract_api_level)
            .or_else(|| entry.based_on.as_deref().and_then(extract_api_level));
    }

    entries.retain(|e| is_valid_avd_name(&e.name));
    entries
}

/// Parse the `key=value` lines of a `config.ini`
pub fn parse_config_ini(content: &str) -> ConfigIni {
    let mut config = ConfigIni::default();

    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "avd.ini.displayname" => config.display_name = non_empty(value),
            "hw.device.name" => config.device_name = non_empty(value),
            "hw.device.manufacturer" => config.manufacturer = non_empty(value),
            "tag.display" => config.tag = non_empty(value),
            "target" | "image.sysdir.1" if config.api_level.is_none() => {
                config.api_level = extract_api_level(value);
            }
            _ => {}
        }
    }

    config
}

/// Parse AVD name to extract display name and API level
///
/// Common naming patterns:
/// - "Pixel_6_API_33" -> ("Pixel 6", Some("33"))
/// - "Nexus_5X_API_29" -> ("Nexus 5X", Some("29"))
/// - "My_Custom_AVD" -> ("My Custom AVD", None)
pub fn parse_avd_name(name: &str) -> (String, Option<String>) {
    if let Some(caps) = API_PATTERN.captures(name) {
        let api_level = caps.get(1).map(|m| m.as_str().to_string());
        let display = API_PATTERN.replace(name, "").replace('_', " ");
        return (display.trim().to_string(), api_level);
    }

    (name.replace('_', " "), None)
}

/// Find an API level in free text ("API level 33", "(API 33)", "android-33")
pub fn extract_api_level(text: &str) -> Option<String> {
    API_LEVEL_PATTERNS
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Directory holding `<name>.ini` and `<name>.avd/`
pub fn avd_home() -> Option<PathBuf> {
    if let Some(dir) = env_path("ANDROID_AVD_HOME") {
        return Some(dir);
    }
    if let Some(dir) = env_path("ANDROID_USER_HOME") {
        return Some(dir.join("avd"));
    }
    dirs::home_dir().map(|home| home.join(".android").join("avd"))
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn config_ini_path(
    home: Option<&Path>,
    name: &str,
    entry: Option<&AvdManagerEntry>,
) -> Option<PathBuf> {
    if let Some(path) = entry.and_then(|e| e.path.as_ref()) {
        return Some(path.join("config.ini"));
    }
    home.map(|h| h.join(format!("{}.avd", name)).join("config.ini"))
}

async fn read_config_ini(path: &Path) -> Option<ConfigIni> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Some(parse_config_ini(&content)),
        Err(e) => {
            trace!("No config.ini at {}: {}", path.display(), e);
            None
        }
    }
}

/// Combine the metadata sources for one image, best first
fn build_image(name: &str, entry: Option<&AvdManagerEntry>, config: Option<&ConfigIni>) -> AvdImage {
    let (display_name, name_api) = parse_avd_name(name);
    let mut image = AvdImage::new(name).with_display_name(display_name);

    if let Some(entry) = entry {
        image = image
            .with_device(entry.device.clone().unwrap_or_else(|| UNKNOWN_DEVICE.to_string()))
            .with_source(MetadataSource::AvdManager);
        if let Some(target) = &entry.target {
            image = image.with_target(target.clone());
        }
        let api = entry
            .api_level
            .clone()
            .or_else(|| config.and_then(|c| c.api_level.clone()))
            .or(name_api);
        if let Some(api) = api {
            image = image.with_api_level(api);
        }
        return image;
    }

    if let Some(config) = config.filter(|c| c.has_metadata()) {
        image = image.with_source(MetadataSource::ConfigIni);
        if let Some(display) = &config.display_name {
            image = image.with_display_name(display.clone());
        }
        if let Some(device) = config.device_label() {
            image = image.with_device(device);
        }
        if let Some(tag) = &config.tag {
            image = image.with_target(tag.clone());
        }
        if let Some(api) = config.api_level.clone().or(name_api) {
            image = image.with_api_level(api);
        }
        return image;
    }

    if let Some(api) = name_api {
        return image
            .with_api_level(api)
            .with_source(MetadataSource::NamePattern);
    }

    image
}

fn set_field(current: &mut Option<AvdManagerEntry>, apply: impl FnOnce(&mut AvdManagerEntry)) {
    if let Some(entry) = current.as_mut() {
        apply(entry);
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}
