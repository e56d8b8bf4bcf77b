//! Simulator configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via PLCSIM_CONFIG or --config)
//! 3. Environment variables

use plcsim_core::series::{ATMOSPHERIC_PRESSURE, PUMP_DOWN, VENT_UP};
use plcsim_core::{ControllerConfig, PlantLayout, DEFAULT_VALVE_SETTLE_TICKS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Simulator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Devices and timing.
    pub plant: PlantConfig,
    /// Relation file.
    pub relations: RelationsConfig,
    /// Subscriptions and cascading.
    pub dispatcher: DispatcherConfig,
    /// Evacuate/intake sequences.
    pub sequencer: SequencerConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("PLCSIM_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.plant.apply_env_overrides();
        self.relations.apply_env_overrides();
        self.dispatcher.apply_env_overrides();
        self.sequencer.apply_env_overrides();
    }

    /// Checks values that would stall or break the simulation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plant.tick_ms == 0 {
            return Err(ConfigError::ValidationError(
                "plant.tick_ms must be greater than 0".to_string(),
            ));
        }
        if self.plant.layout.devices.is_empty() {
            return Err(ConfigError::ValidationError(
                "plant.layout.devices must not be empty".to_string(),
            ));
        }
        if self.dispatcher.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "dispatcher.channel_capacity must be greater than 0".to_string(),
            ));
        }
        if let Some(poll) = self.sequencer.poll_interval_ms {
            if poll == 0 || poll > self.plant.tick_ms {
                return Err(ConfigError::ValidationError(format!(
                    "sequencer.poll_interval_ms must be between 1 and plant.tick_ms ({}), got {}",
                    self.plant.tick_ms, poll
                )));
            }
        }
        for (mode, profile) in [
            ("evacuate", &self.sequencer.evacuate),
            ("intake", &self.sequencer.intake),
        ] {
            if profile.valve.is_empty()
                || profile.pump.is_empty()
                || profile.barometer.is_empty()
                || profile.series.is_empty()
            {
                return Err(ConfigError::ValidationError(format!(
                    "sequencer.{} profile has empty device or series names",
                    mode
                )));
            }
        }
        Ok(())
    }

    /// Sequencer settings with the poll interval resolved against the plant tick.
    pub fn sequencer_config(&self) -> SequencerConfig {
        let mut sequencer = self.sequencer.clone();
        sequencer.poll_interval_ms.get_or_insert(self.plant.tick_ms);
        sequencer
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Plant configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlantConfig {
    /// Length of one time unit in milliseconds.
    pub tick_ms: u64,
    /// Ticks a valve spends opening or closing.
    pub valve_settle_ticks: u32,
    /// Optional YAML/JSON file with extra sensor series.
    pub series_file: Option<PathBuf>,
    /// Initial barometer reading (Pa).
    pub ambient_pressure: f64,
    /// Devices created at startup.
    pub layout: PlantLayout,
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            valve_settle_ticks: DEFAULT_VALVE_SETTLE_TICKS,
            series_file: None,
            ambient_pressure: ATMOSPHERIC_PRESSURE,
            layout: PlantLayout::standard(),
        }
    }
}

impl PlantConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(tick) = std::env::var("PLCSIM_TICK_MS") {
            if let Ok(ms) = tick.parse() {
                self.tick_ms = ms;
            }
        }

        if let Ok(ticks) = std::env::var("PLCSIM_VALVE_SETTLE_TICKS") {
            if let Ok(n) = ticks.parse() {
                self.valve_settle_ticks = n;
            }
        }

        if let Ok(path) = std::env::var("PLCSIM_SERIES_FILE") {
            self.series_file = Some(PathBuf::from(path));
        }
    }

    /// Returns the tick as Duration.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Returns the device controller configuration.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig::new(self.tick()).with_valve_settle_ticks(self.valve_settle_ticks)
    }
}

/// Relation file configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationsConfig {
    /// Path of the relation file.
    pub path: PathBuf,
    /// Fail startup when the relation file is missing instead of running
    /// without cascading.
    pub required: bool,
}

impl Default for RelationsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("model_set/relation.json"),
            required: false,
        }
    }
}

impl RelationsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("PLCSIM_RELATIONS") {
            self.path = PathBuf::from(path);
        }
    }
}

/// Subscription and cascade configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Capacity of each data-change channel.
    pub channel_capacity: usize,
    /// Whether status changes cascade to child devices.
    pub cascade: bool,
    /// Gas flow used when a cascade starts a valve (L/min).
    pub valve_flow: f64,
    /// Frequency used when a cascade starts a pump.
    pub pump_speed: f64,
    /// Series used when a cascade starts a barometer.
    pub barometer_series: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            cascade: true,
            valve_flow: 2.0,
            pump_speed: 2.0,
            barometer_series: PUMP_DOWN.to_string(),
        }
    }
}

impl DispatcherConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(cap) = std::env::var("PLCSIM_CHANNEL_CAPACITY") {
            if let Ok(n) = cap.parse() {
                self.channel_capacity = n;
            }
        }
    }
}

/// Devices and barometer policy of one sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceProfile {
    /// Browse name of the valve to open.
    pub valve: String,
    /// Browse name of the pump to start.
    pub pump: String,
    /// Browse name of the barometer to watch.
    pub barometer: String,
    /// Series replayed by the barometer during the run.
    pub series: String,
    /// Whether the barometer is stopped when the run completes.
    #[serde(default)]
    pub stop_barometer: bool,
}

const DEFAULT_POLL_MS: u64 = 1000;

/// Sequencer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Interval between sensor and status polls in milliseconds.
    /// Unset means one poll per plant tick.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    /// Longest wait for every valve and pump to report CLOSED.
    pub baseline_timeout_secs: u64,
    /// Longest wait for the mode's valve to settle.
    pub settle_timeout_secs: u64,
    /// Longest wait for the reading to cross the threshold.
    pub sensor_timeout_secs: u64,
    /// Gas flow of the opened valve (L/min).
    pub nominal_flow: f64,
    /// Frequency of the started pump.
    pub pump_speed: f64,
    pub evacuate: SequenceProfile,
    pub intake: SequenceProfile,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: None,
            baseline_timeout_secs: 30,
            settle_timeout_secs: 30,
            sensor_timeout_secs: 600,
            nominal_flow: 2.0,
            pump_speed: 2.0,
            evacuate: SequenceProfile {
                valve: "valve02".to_string(),
                pump: "vacuumpump02".to_string(),
                barometer: "barometer01".to_string(),
                series: PUMP_DOWN.to_string(),
                stop_barometer: false,
            },
            intake: SequenceProfile {
                valve: "valve01".to_string(),
                pump: "vacuumpump01".to_string(),
                barometer: "barometer01".to_string(),
                series: VENT_UP.to_string(),
                stop_barometer: true,
            },
        }
    }
}

impl SequencerConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(poll) = std::env::var("PLCSIM_POLL_MS") {
            if let Ok(ms) = poll.parse() {
                self.poll_interval_ms = Some(ms);
            }
        }

        if let Ok(timeout) = std::env::var("PLCSIM_BASELINE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.baseline_timeout_secs = secs;
            }
        }

        if let Ok(timeout) = std::env::var("PLCSIM_SENSOR_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.sensor_timeout_secs = secs;
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(DEFAULT_POLL_MS))
    }

    pub fn baseline_timeout(&self) -> Duration {
        Duration::from_secs(self.baseline_timeout_secs)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }

    pub fn sensor_timeout(&self) -> Duration {
        Duration::from_secs(self.sensor_timeout_secs)
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.plant.tick(), Duration::from_secs(1));
        assert_eq!(config.plant.controller_config().settle_time(), Duration::from_secs(3));
        assert_eq!(config.sequencer.evacuate.valve, "valve02");
        assert_eq!(config.sequencer.intake.pump, "vacuumpump01");
        assert!(config.sequencer.intake.stop_barometer);
        assert!(!config.sequencer.evacuate.stop_barometer);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plcsim.yaml");

        let mut config = Config::default();
        config.plant.tick_ms = 50;
        config.relations.required = true;
        config.sequencer.evacuate.series = "quick".to_string();
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.plant.tick_ms, 50);
        assert!(loaded.relations.required);
        assert_eq!(loaded.sequencer.evacuate.series, "quick");
        assert_eq!(loaded.plant.layout, PlantLayout::standard());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str(
            "plant:\n  tick_ms: 10\nsequencer:\n  sensor_timeout_secs: 5\n",
        )
        .unwrap();
        assert_eq!(config.plant.tick_ms, 10);
        assert_eq!(config.plant.valve_settle_ticks, 3);
        assert_eq!(config.sequencer.sensor_timeout(), Duration::from_secs(5));
        assert_eq!(config.sequencer.poll_interval_ms, None);
        assert_eq!(
            config.sequencer_config().poll_interval(),
            Duration::from_millis(10)
        );
        assert_eq!(config.relations.path, PathBuf::from("model_set/relation.json"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.plant.tick_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.sequencer.intake.valve.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poll_interval_follows_tick() {
        let mut config = Config::default();
        assert_eq!(config.sequencer_config().poll_interval(), Duration::from_secs(1));

        config.plant.tick_ms = 250;
        assert!(config.validate().is_ok());
        assert_eq!(
            config.sequencer_config().poll_interval(),
            Duration::from_millis(250)
        );

        config.sequencer.poll_interval_ms = Some(100);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.sequencer_config().poll_interval(),
            Duration::from_millis(100)
        );

        // Polling slower than the tick would skip readings.
        config.sequencer.poll_interval_ms = Some(500);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
        config.sequencer.poll_interval_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/plcsim.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(..)));
    }
}
