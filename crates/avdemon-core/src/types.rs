//! Domain types shared by every AVD Demon crate

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Device label used when no metadata source names the hardware profile
pub const UNKNOWN_DEVICE: &str = "Unknown Device";

/// API level used when no metadata source names the platform
pub const UNKNOWN_API_LEVEL: &str = "Unknown";

/// Target summary used when no metadata source describes the system image
pub const DEFAULT_TARGET: &str = "Android";

/// Characters the Android tooling accepts in an AVD name
static AVD_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("Invalid AVD name regex"));

/// Check whether `candidate` could be an AVD name.
///
/// Used to reject tool chatter (`INFO    | ...`, `KO: unknown command`) wherever
/// a name is scraped from command output.
pub fn is_valid_avd_name(candidate: &str) -> bool {
    AVD_NAME_PATTERN.is_match(candidate)
}

/// Where an image's descriptive metadata came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataSource {
    /// Correlated from `avdmanager list avd`
    AvdManager,
    /// Read from the image's `config.ini`
    ConfigIni,
    /// Inferred from an `_API_nn` name suffix
    NamePattern,
    /// Nothing recognizable; defaults substituted
    #[default]
    Defaulted,
}

/// A locally-registered Android Virtual Device image
///
/// Immutable once enumerated. The whole list is rebuilt on every enumeration pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvdImage {
    /// AVD name, the identity key (used for `emulator -avd <name>`)
    pub name: String,

    /// Friendly display name ("Pixel 7" for "Pixel_7_API_33")
    pub display_name: String,

    /// Hardware profile label (e.g. "pixel_7 (Google)")
    pub device: String,

    /// API level as reported ("33"), or [`UNKNOWN_API_LEVEL`]
    pub api_level: String,

    /// Human-readable target summary (e.g. "Google APIs (Google Inc.)")
    pub target: String,

    /// Which fallback produced the metadata above
    #[serde(default)]
    pub metadata_source: MetadataSource,
}

impl AvdImage {
    /// Create an image with defaulted metadata
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.replace('_', " "),
            name,
            device: UNKNOWN_DEVICE.to_string(),
            api_level: UNKNOWN_API_LEVEL.to_string(),
            target: DEFAULT_TARGET.to_string(),
            metadata_source: MetadataSource::Defaulted,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_api_level(mut self, api_level: impl Into<String>) -> Self {
        self.api_level = api_level.into();
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_source(mut self, source: MetadataSource) -> Self {
        self.metadata_source = source;
        self
    }

    /// "API 33", or "Unknown API" when the level was never discovered
    pub fn api_display(&self) -> String {
        if self.api_level == UNKNOWN_API_LEVEL {
            "Unknown API".to_string()
        } else {
            format!("API {}", self.api_level)
        }
    }

    /// Placeholder row shown when enumeration found no images
    pub fn no_images_placeholder() -> Self {
        Self::new("No_Emulators_Found")
            .with_display_name("No emulators found")
            .with_device("Check Android SDK")
            .with_api_level("??")
            .with_target("Create AVDs in Android Studio")
    }

    /// Placeholder row shown when enumeration did not finish in time
    pub fn timed_out_placeholder() -> Self {
        Self::new("Timeout_Check_SDK_Config")
            .with_display_name("Enumeration timed out")
            .with_device("SDK Configuration Needed")
            .with_api_level("??")
            .with_target("Check Android SDK Setup")
    }
}

/// An operation in flight for one image
///
/// An image carries at most one intent, so "starting and stopping at once"
/// cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionIntent {
    Starting,
    Stopping,
}

impl fmt::Display for TransitionIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionIntent::Starting => write!(f, "starting"),
            TransitionIntent::Stopping => write!(f, "stopping"),
        }
    }
}

/// Per-image lifecycle state as presented to users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl LifecyclePhase {
    /// Derive the phase from the observed flag and any in-flight intent.
    ///
    /// An intent always wins over the observed flag.
    pub fn derive(is_running: bool, intent: Option<TransitionIntent>) -> Self {
        match (intent, is_running) {
            (Some(TransitionIntent::Starting), _) => LifecyclePhase::Starting,
            (Some(TransitionIntent::Stopping), _) => LifecyclePhase::Stopping,
            (None, true) => LifecyclePhase::Running,
            (None, false) => LifecyclePhase::Stopped,
        }
    }

    /// Whether an operation is in flight
    pub fn is_transitioning(&self) -> bool {
        matches!(self, LifecyclePhase::Starting | LifecyclePhase::Stopping)
    }

    pub fn label(&self) -> &'static str {
        match self {
            LifecyclePhase::Stopped => "Stopped",
            LifecyclePhase::Starting => "Starting",
            LifecyclePhase::Running => "Running",
            LifecyclePhase::Stopping => "Stopping",
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_avd_names() {
        assert!(is_valid_avd_name("Pixel_7_API_33"));
        assert!(is_valid_avd_name("wear-os.round"));
        assert!(!is_valid_avd_name(""));
        assert!(!is_valid_avd_name("INFO    | Storing crashdata"));
        assert!(!is_valid_avd_name("KO: unknown command"));
    }

    #[test]
    fn test_new_image_is_defaulted() {
        let image = AvdImage::new("My_Custom_AVD");
        assert_eq!(image.display_name, "My Custom AVD");
        assert_eq!(image.device, UNKNOWN_DEVICE);
        assert_eq!(image.api_level, UNKNOWN_API_LEVEL);
        assert_eq!(image.metadata_source, MetadataSource::Defaulted);
        assert_eq!(image.api_display(), "Unknown API");
    }

    #[test]
    fn test_api_display() {
        let image = AvdImage::new("Pixel_7_API_33").with_api_level("33");
        assert_eq!(image.api_display(), "API 33");
    }

    #[test]
    fn test_phase_intent_wins() {
        assert_eq!(
            LifecyclePhase::derive(false, Some(TransitionIntent::Starting)),
            LifecyclePhase::Starting
        );
        assert_eq!(
            LifecyclePhase::derive(true, Some(TransitionIntent::Stopping)),
            LifecyclePhase::Stopping
        );
        assert_eq!(LifecyclePhase::derive(true, None), LifecyclePhase::Running);
        assert_eq!(LifecyclePhase::derive(false, None), LifecyclePhase::Stopped);
    }

    #[test]
    fn test_image_serializes_snake_case_source() {
        let image = AvdImage::new("Pixel_7_API_33").with_source(MetadataSource::ConfigIni);
        let json = serde_json::to_string(&image).unwrap();
        assert!(json.contains(r#""metadata_source":"config_ini""#));
    }

    #[test]
    fn test_placeholders_are_distinct() {
        assert_ne!(
            AvdImage::no_images_placeholder().name,
            AvdImage::timed_out_placeholder().name
        );
    }
}
