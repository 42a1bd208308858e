//! Scan configuration using Figment.
//!
//! A configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `SCAN_`, nested with `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! SCAN_APPLICATION__LOG_LEVEL=debug
//! SCAN_RUNNER__MOVE_MS=25
//! SCAN_SOURCES__BEAMCURRENT=0.5
//! ```
//!
//! # Example file
//!
//! ```toml
//! [application]
//! name = "raster"
//! log_level = "info"
//!
//! [scan]
//! name = "raster"
//! axes = [
//!     { type = "step", name = "y", start = 0.0, stop = 2.0, step = 1.0 },
//!     { type = "step", name = "x", start = 10.0, stop = 20.0, step = 5.0 },
//! ]
//!
//! [scan.watchdog]
//! expression = "beamcurrent >= 1.0"
//! message = "Beam has been lost"
//!
//! [sources]
//! beamcurrent = 2.5
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{ScanError, ScanResult};
use crate::points::{CompoundGenerator, Generator, ModelDefinition, RegionDefinition, Scalar};
use crate::watchdog::WatchdogModel;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Timing of the simulated positioner
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Positioner cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// The scan to generate or run
    pub scan: ScanDefinition,
    /// Initial values of simulated live value sources
    #[serde(default)]
    pub sources: BTreeMap<String, Scalar>,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Simulated positioner timing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Time per move in milliseconds
    #[serde(default)]
    pub move_ms: u64,
    /// Settling time after each move in milliseconds
    #[serde(default)]
    pub settle_ms: u64,
}

/// Positioner cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached positioners
    #[serde(default = "default_positioner_capacity")]
    pub positioner_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            positioner_capacity: default_positioner_capacity(),
        }
    }
}

/// Declarative description of a compound scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanDefinition {
    /// Scan name used in logs
    #[serde(default = "default_scan_name")]
    pub name: String,
    /// Axis models, outermost first
    pub axes: Vec<ModelDefinition>,
    /// Regions applied to the composed positions
    #[serde(default)]
    pub regions: Vec<RegionDefinition>,
    /// Optional interlock guarding the scan
    #[serde(default)]
    pub watchdog: Option<WatchdogModel>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "scan_runner".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_positioner_capacity() -> usize {
    16
}

fn default_scan_name() -> String {
    "scan".to_string()
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl ScanDefinition {
    /// Build the compound generator this definition describes.
    ///
    /// Every model is validated before anything is generated.
    pub fn build(&self) -> ScanResult<CompoundGenerator> {
        let children = self
            .axes
            .iter()
            .cloned()
            .map(|model| Generator::new(model.into_model()))
            .collect::<ScanResult<Vec<_>>>()?;
        let mut compound = CompoundGenerator::new(self.name.clone(), children)?;
        for region in &self.regions {
            compound.add_filter(region.clone().into_filter());
        }
        Ok(compound)
    }
}

impl ScanConfig {
    /// Load from a TOML file (if given) and `SCAN_` environment variables,
    /// then validate.
    ///
    /// Environment variables take precedence over the file.
    pub fn load(path: Option<&Path>) -> ScanResult<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed("SCAN_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text without consulting the environment, then validate.
    pub fn from_toml_str(text: &str) -> ScanResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(text)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints.
    ///
    /// - log level is one of trace, debug, info, warn, error
    /// - positioner cache capacity is positive
    /// - at least one axis, and the scan builds
    /// - a watchdog, if present, has an expression
    pub fn validate(&self) -> ScanResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ScanError::validation(
                "log_level",
                format!(
                    "Invalid log_level '{}'. Must be one of: {}",
                    self.application.log_level,
                    valid_levels.join(", ")
                ),
            ));
        }

        if self.cache.positioner_capacity == 0 {
            return Err(ScanError::validation(
                "positioner_capacity",
                "Invalid positioner_capacity 0. Must be at least 1",
            ));
        }

        if self.scan.axes.is_empty() {
            return Err(ScanError::validation(
                "axes",
                format!("Scan '{}' has no axes", self.scan.name),
            ));
        }
        self.scan.build()?;

        if let Some(watchdog) = &self.scan.watchdog {
            watchdog.validate()?;
        }
        Ok(())
    }
}
