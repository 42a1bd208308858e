//! Core library for scan trajectory generation and live interlocks.
//!
//! - [`points`]: lazy, validated trajectory generators composed into
//!   multi-dimensional scans, with region filtering and index slices
//! - [`watchdog`]: expression interlocks that pause, rewind and resume a
//!   running scan as live values change
//! - [`sequencer`]: the controller boundary, an in-process runner and mocks
//! - [`config`]: Figment-based scan definitions
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_scanning::points::{CompoundGenerator, Generator, PointGenerator, StepModel};
//! use daq_scanning::sequencer::{MockPositioner, ScanRunner};
//!
//! let scan = CompoundGenerator::new(
//!     "raster",
//!     vec![
//!         Generator::new(Box::new(StepModel::new("y", 0.0, 2.0, 1.0)))?,
//!         Generator::new(Box::new(StepModel::new("x", 10.0, 20.0, 5.0)))?,
//!     ],
//! )?;
//! let summary = ScanRunner::new("runner")
//!     .run(&scan, &MockPositioner::new("stage"))
//!     .await?;
//! assert_eq!(summary.points_completed, 9);
//! ```

pub mod config;
pub mod error;
pub mod limits;
pub mod points;
pub mod sequencer;
pub mod watchdog;

pub use config::{ScanConfig, ScanDefinition};
pub use error::{ScanError, ScanResult};
