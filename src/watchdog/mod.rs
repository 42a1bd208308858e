//! Live interlocks for running scans.
//!
//! An [`ExpressionWatchdog`] watches a boolean expression over named live
//! values (beam current, shutter state, ...). When the expression turns
//! false it pauses the [`Controller`](crate::sequencer::Controller); when it
//! turns true again it rewinds to the last completed point and resumes.
//!
//! - [`expression`]: parse / bind / evaluate engines (Rhai and a scripted double)
//! - [`source`]: live value sources on tokio watch channels
//! - [`expression_watchdog`]: the arm / trip / resume / disarm state machine

pub mod expression;
pub mod expression_watchdog;
pub mod source;

pub use expression::{
    free_variables, ExpressionEngine, ExpressionError, ExpressionService, RhaiExpressionEngine,
    RhaiExpressionService, ScriptedExpressionEngine,
};
pub use expression_watchdog::{ExpressionWatchdog, WatchdogEvent, WatchdogModel, WatchdogState};
pub use source::{LiveValueSource, ObservableValue, PolledValue, SourceMetadata, SourceRegistry};
