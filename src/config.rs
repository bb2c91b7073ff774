//! Run configuration using Figment
//!
//! Settings for one calibration run are loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `IVY_`
//!
//! Nested keys use a double underscore, so `IVY_DELAYS__VSET_SECS=30` overrides
//! `[delays] vset_secs`.
//!
//! ```toml
//! duc_name = "CHANGE_THIS!"
//! comment = "Routine check"
//! rs = 1e5
//! duc_gain = 1e6
//! settle_delay_secs = 600
//! data_file = "IVY_RunData.json"
//!
//! [delays]
//! vset_secs = 180
//! azero_secs = 5
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::experiment::plan::NREADS;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "IVY_";

/// Longest accepted delay, seconds (one day).
pub const MAX_DELAY_SECS: f64 = 86_400.0;

/// Settle delays used by the acquisition sequence, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelaySettings {
    /// After applying a new source voltage
    #[serde(default = "default_vset")]
    pub vset_secs: f64,
    /// After triggering DVM auto-zero
    #[serde(default = "default_azero")]
    pub azero_secs: f64,
    /// After locking DVM ranges
    #[serde(default = "default_half_second")]
    pub range_secs: f64,
    /// Between source setpoint and output enable
    #[serde(default = "default_half_second")]
    pub source_secs: f64,
    /// After clearing the source error queue
    #[serde(default = "default_three_seconds")]
    pub error_check_secs: f64,
    /// After setting DVM line-frequency sync
    #[serde(default = "default_three_seconds")]
    pub line_freq_secs: f64,
    /// After switching the input node relay
    #[serde(default = "default_one_second")]
    pub node_switch_secs: f64,
    /// After initialising each instrument
    #[serde(default = "default_one_second")]
    pub init_secs: f64,
    /// After the last read of a point
    #[serde(default = "default_one_second")]
    pub post_read_secs: f64,
    /// Hold time so results stay readable before the next point
    #[serde(default = "default_display")]
    pub display_secs: f64,
    /// After each recorded row
    #[serde(default = "default_row")]
    pub row_secs: f64,
}

impl Default for DelaySettings {
    fn default() -> Self {
        Self {
            vset_secs: default_vset(),
            azero_secs: default_azero(),
            range_secs: default_half_second(),
            source_secs: default_half_second(),
            error_check_secs: default_three_seconds(),
            line_freq_secs: default_three_seconds(),
            node_switch_secs: default_one_second(),
            init_secs: default_one_second(),
            post_read_secs: default_one_second(),
            display_secs: default_display(),
            row_secs: default_row(),
        }
    }
}

impl DelaySettings {
    /// Every delay set to zero.
    pub fn none() -> Self {
        Self {
            vset_secs: 0.0,
            azero_secs: 0.0,
            range_secs: 0.0,
            source_secs: 0.0,
            error_check_secs: 0.0,
            line_freq_secs: 0.0,
            node_switch_secs: 0.0,
            init_secs: 0.0,
            post_read_secs: 0.0,
            display_secs: 0.0,
            row_secs: 0.0,
        }
    }

    fn named(&self) -> [(&'static str, f64); 11] {
        [
            ("vset_secs", self.vset_secs),
            ("azero_secs", self.azero_secs),
            ("range_secs", self.range_secs),
            ("source_secs", self.source_secs),
            ("error_check_secs", self.error_check_secs),
            ("line_freq_secs", self.line_freq_secs),
            ("node_switch_secs", self.node_switch_secs),
            ("init_secs", self.init_secs),
            ("post_read_secs", self.post_read_secs),
            ("display_secs", self.display_secs),
            ("row_secs", self.row_secs),
        ]
    }
}

/// Everything needed to start one calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    /// Identifier to store the run under; generated when absent
    #[serde(default)]
    pub run_id: Option<String>,
    /// Name of the device under calibration
    #[serde(default = "default_duc_name")]
    pub duc_name: String,
    /// Operator comment stored with the run
    #[serde(default)]
    pub comment: String,
    /// Series (input) resistance in ohms
    pub rs: f64,
    /// DUC gain setting
    pub duc_gain: f64,
    /// Wait before touching any instrument, in seconds
    #[serde(default)]
    pub settle_delay_secs: f64,
    /// Run file the completed run is merged into
    pub data_file: PathBuf,
    /// Readings per channel per calibration point
    #[serde(default = "default_nreads")]
    pub nreads: usize,
    /// Settle delays
    #[serde(default)]
    pub delays: DelaySettings,
}

fn default_duc_name() -> String {
    "CHANGE_THIS!".to_string()
}

fn default_nreads() -> usize {
    NREADS
}

fn default_vset() -> f64 {
    180.0
}

fn default_azero() -> f64 {
    5.0
}

fn default_half_second() -> f64 {
    0.5
}

fn default_one_second() -> f64 {
    1.0
}

fn default_three_seconds() -> f64 {
    3.0
}

fn default_display() -> f64 {
    2.0
}

fn default_row() -> f64 {
    0.1
}

impl RunSettings {
    /// Settings for a DUC with default delays and no pre-run settle time.
    pub fn new(rs: f64, duc_gain: f64, data_file: impl Into<PathBuf>) -> Self {
        Self {
            run_id: None,
            duc_name: default_duc_name(),
            comment: String::new(),
            rs,
            duc_gain,
            settle_delay_secs: 0.0,
            data_file: data_file.into(),
            nreads: NREADS,
            delays: DelaySettings::default(),
        }
    }

    /// Load settings from a TOML file and `IVY_` environment variables.
    ///
    /// Environment variables take precedence over the file. The result is
    /// validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::file(path.as_ref())))
    }

    /// Extract and validate settings from a prepared figment, with the
    /// environment layered on top.
    pub fn from_figment(figment: Figment) -> AppResult<Self> {
        let settings: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check the settings describe a run that can be executed.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.rs.is_finite() && self.rs > 0.0) {
            return Err(DaqError::Configuration(format!(
                "Invalid rs {}. Must be a positive resistance",
                self.rs
            )));
        }
        if !self.duc_gain.is_finite() || self.duc_gain == 0.0 {
            return Err(DaqError::Configuration(format!(
                "Invalid duc_gain {}. Must be finite and non-zero",
                self.duc_gain
            )));
        }
        if self.nreads < 2 {
            return Err(DaqError::Configuration(format!(
                "Invalid nreads {}. At least 2 readings are needed for a standard deviation",
                self.nreads
            )));
        }
        if self.data_file.as_os_str().is_empty() {
            return Err(DaqError::Configuration(
                "data_file cannot be empty".to_string(),
            ));
        }

        let settle = [("settle_delay_secs", self.settle_delay_secs)];
        for (name, secs) in settle.iter().chain(self.delays.named().iter()) {
            if !secs.is_finite() || *secs < 0.0 || *secs > MAX_DELAY_SECS {
                return Err(DaqError::Configuration(format!(
                    "Invalid {} {}. Delays must be between 0 and {} s",
                    name, secs, MAX_DELAY_SECS
                )));
            }
        }
        Ok(())
    }

    /// Pre-run settle delay.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs_f64(self.settle_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_bench_timing() {
        let delays = DelaySettings::default();
        assert_eq!(delays.vset_secs, 180.0);
        assert_eq!(delays.azero_secs, 5.0);
        assert_eq!(delays.row_secs, 0.1);
        assert!(RunSettings::new(1e5, 1e6, "runs.json").validate().is_ok());
    }

    #[test]
    fn loads_toml_with_partial_delays() {
        let toml = r#"
            duc_name = "I2V-3"
            rs = 1e5
            duc_gain = 1e6
            settle_delay_secs = 60
            data_file = "IVY_RunData.json"

            [delays]
            vset_secs = 30
        "#;
        let settings = RunSettings::from_figment(Figment::new().merge(Toml::string(toml))).unwrap();
        assert_eq!(settings.duc_name, "I2V-3");
        assert_eq!(settings.nreads, NREADS);
        assert_eq!(settings.delays.vset_secs, 30.0);
        assert_eq!(settings.delays.azero_secs, 5.0);
        assert_eq!(settings.settle_delay(), Duration::from_secs(60));
    }

    #[test]
    fn missing_file_and_no_env_fails_to_extract() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunSettings::load_from(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, DaqError::Config(_)));
    }

    #[test]
    fn rejects_non_positive_resistance() {
        let settings = RunSettings::new(0.0, 1e6, "runs.json");
        assert!(matches!(
            settings.validate(),
            Err(DaqError::Configuration(msg)) if msg.contains("rs")
        ));
    }

    #[test]
    fn rejects_zero_gain_and_short_batches() {
        assert!(RunSettings::new(1e5, 0.0, "runs.json").validate().is_err());

        let mut settings = RunSettings::new(1e5, 1e6, "runs.json");
        settings.nreads = 1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_negative_delay() {
        let mut settings = RunSettings::new(1e5, 1e6, "runs.json");
        settings.delays.azero_secs = -1.0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("azero_secs"));
    }

    #[test]
    fn rejects_delay_longer_than_a_day() {
        let mut settings = RunSettings::new(1e5, 1e6, "runs.json");
        settings.delays.vset_secs = 1e19;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("vset_secs"));

        settings.delays.vset_secs = MAX_DELAY_SECS;
        settings.settle_delay_secs = MAX_DELAY_SECS + 1.0;
        assert!(settings.validate().is_err());
    }
}
