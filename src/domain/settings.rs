use crate::domain::iq::ArrayType;
use crate::domain::models::{Coordinate, Orientation};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Maximum number of locators handled by one gateway instance
pub const MAX_NUM_LOCATORS: usize = 8;

/// Maximum number of tags tracked, and of simultaneous tag connections
pub const MAX_NUM_TAGS: usize = 30;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("at least one locator must be configured")]
    NoLocators,
    #[error("locator id {0} is configured more than once")]
    DuplicateLocator(String),
    #[error("filtering amount {0} is outside [0, 1]")]
    FilteringAmount(f32),
    #[error("estimation interval must be positive, got {0}")]
    EstimationInterval(f32),
    #[error("multilocator id must not be empty")]
    MissingMultilocatorId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "aoa_gateway".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Static description of one locator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocatorConfig {
    pub id: String,
    #[serde(default)]
    pub coordinate: Coordinate,
    #[serde(default)]
    pub orientation: Orientation,
}

/// Azimuth range excluded from angle estimation, in degrees
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AzimuthMask {
    pub min: f32,
    pub max: f32,
}

impl AzimuthMask {
    pub fn contains(&self, azimuth: f32) -> bool {
        azimuth >= self.min && azimuth <= self.max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerSettings {
    #[serde(default = "default_true")]
    pub passive: bool,
    /// Scan interval in 0.625 ms units
    #[serde(default = "default_scan_timing")]
    pub interval: u16,
    /// Scan window in 0.625 ms units
    #[serde(default = "default_scan_timing")]
    pub window: u16,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            passive: true,
            interval: default_scan_timing(),
            window: default_scan_timing(),
        }
    }
}

fn default_scan_timing() -> u16 {
    16 // 10 ms
}

/// Default parameters applied to every tag connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionParameters {
    /// Connection interval in 1.25 ms units
    pub min_interval: u16,
    pub max_interval: u16,
    pub latency: u16,
    /// Supervision timeout in 10 ms units
    pub timeout: u16,
    pub min_ce_length: u16,
    pub max_ce_length: u16,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            min_interval: 80, // 100 ms
            max_interval: 80,
            latency: 0,
            timeout: 100, // 1000 ms
            min_ce_length: 0,
            max_ce_length: 0xFFFF,
        }
    }
}

/// Tuning of the built-in phase interferometer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterferometerSettings {
    /// Distance between neighbouring antenna elements in meters
    #[serde(default = "default_element_spacing")]
    pub element_spacing_m: f32,
    /// Packets accumulated before an angle is reported
    #[serde(default = "default_packets_per_estimate")]
    pub packets_per_estimate: u32,
}

impl Default for InterferometerSettings {
    fn default() -> Self {
        Self {
            element_spacing_m: default_element_spacing(),
            packets_per_estimate: default_packets_per_estimate(),
        }
    }
}

fn default_element_spacing() -> f32 {
    0.04
}
fn default_packets_per_estimate() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    /// TCP address of the radio bridge
    #[serde(default = "default_radio_address")]
    pub radio_address: String,

    // Locator geometry
    #[serde(default = "default_multilocator_id")]
    pub multilocator_id: String,
    #[serde(default)]
    pub locators: Vec<LocatorConfig>,

    // Angle estimation
    #[serde(default)]
    pub array_type: ArrayType,
    /// Reference RSSI of a tag at 1.0 m distance in dBm
    #[serde(default = "default_tag_tx_power")]
    pub tag_tx_power_dbm: f32,
    #[serde(default = "default_path_loss_exponent")]
    pub path_loss_exponent: f32,
    /// Filter weight applied to distance and position, from 0 to 1
    #[serde(default = "default_filtering_amount")]
    pub filtering_amount: f32,
    /// Should approximate the interval between two consecutive CTEs
    #[serde(default = "default_estimation_interval")]
    pub estimation_interval_sec: f32,
    #[serde(default)]
    pub azimuth_mask: Option<AzimuthMask>,
    #[serde(default)]
    pub interferometer: InterferometerSettings,

    // Connection handling
    /// Tag ids allowed to connect. Empty allows every tag.
    #[serde(default)]
    pub tag_allowlist: Vec<String>,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: Option<u64>,
    #[serde(default)]
    pub scanner: ScannerSettings,
    #[serde(default)]
    pub connection_parameters: ConnectionParameters,

    /// Feed published angles straight back into the local tag aggregator
    #[serde(default = "default_true")]
    pub aggregate_locally: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            radio_address: default_radio_address(),
            multilocator_id: default_multilocator_id(),
            locators: Vec::new(),
            array_type: ArrayType::default(),
            tag_tx_power_dbm: default_tag_tx_power(),
            path_loss_exponent: default_path_loss_exponent(),
            filtering_amount: default_filtering_amount(),
            estimation_interval_sec: default_estimation_interval(),
            azimuth_mask: None,
            interferometer: InterferometerSettings::default(),
            tag_allowlist: Vec::new(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            scanner: ScannerSettings::default(),
            connection_parameters: ConnectionParameters::default(),
            aggregate_locally: true,
        }
    }
}

fn default_radio_address() -> String {
    "127.0.0.1:4901".to_string()
}
fn default_multilocator_id() -> String {
    "multilocator".to_string()
}
fn default_tag_tx_power() -> f32 {
    -45.0
}
fn default_path_loss_exponent() -> f32 {
    2.0
}
fn default_filtering_amount() -> f32 {
    0.6
}
fn default_estimation_interval() -> f32 {
    0.1
}
fn default_discovery_timeout_ms() -> Option<u64> {
    Some(10_000)
}

impl Settings {
    /// Check the loaded values and cap the locator list at [`MAX_NUM_LOCATORS`]
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.multilocator_id.is_empty() {
            return Err(ConfigError::MissingMultilocatorId);
        }
        if self.locators.is_empty() {
            return Err(ConfigError::NoLocators);
        }
        if self.locators.len() > MAX_NUM_LOCATORS {
            warn!(
                "{} locators configured, only the first {} are used",
                self.locators.len(),
                MAX_NUM_LOCATORS
            );
            self.locators.truncate(MAX_NUM_LOCATORS);
        }

        let mut seen = HashSet::new();
        for locator in &self.locators {
            if !seen.insert(locator.id.as_str()) {
                return Err(ConfigError::DuplicateLocator(locator.id.clone()));
            }
        }

        if !(0.0..=1.0).contains(&self.filtering_amount) {
            return Err(ConfigError::FilteringAmount(self.filtering_amount));
        }
        if self.estimation_interval_sec <= 0.0 || !self.estimation_interval_sec.is_finite() {
            return Err(ConfigError::EstimationInterval(self.estimation_interval_sec));
        }
        Ok(())
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load settings from `path`, or from the per-user config directory when no path is given
    ///
    /// An explicit path must exist. The default location falls back to built-in
    /// defaults, which still fail [`SettingsService::validate`] until locators
    /// are configured.
    pub fn new(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (settings, settings_path) = match path {
            Some(path) => {
                let settings = Self::load_from_file(&path)
                    .with_context(|| format!("Failed to load settings from {}", path.display()))?;
                (settings, path)
            }
            None => {
                let path = Self::get_settings_path()?;
                let settings = Self::load_from_file(&path).unwrap_or_else(|_| {
                    info!("No settings at {}, using defaults", path.display());
                    Settings::default()
                });
                (settings, path)
            }
        };

        Ok(Self {
            settings,
            settings_path,
        })
    }

    /// Runs once logging is up so truncation warnings are not lost
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.settings.validate()
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("aoa-gateway");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}
