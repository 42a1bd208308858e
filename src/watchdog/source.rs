//! Live value sources monitored by the watchdog.
//!
//! A source publishes the current value of one named quantity (beam current,
//! shutter state, ...) and, if it can, notifies subscribers on every change.
//! Notification uses `tokio::sync::watch`, so any number of subscribers can
//! wait for changes without polling.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{ScanError, ScanResult};
use crate::points::position::Scalar;

/// A named live value the interlock expression can refer to.
pub trait LiveValueSource: Send + Sync {
    /// Name used as the expression variable.
    fn name(&self) -> &str;

    /// The value right now.
    fn current_value(&self) -> Scalar;

    /// Change notifications, or `None` if this source cannot notify.
    ///
    /// Dropping the receiver unsubscribes.
    fn subscribe(&self) -> Option<watch::Receiver<Scalar>>;
}

/// Descriptive metadata of an observable value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Source name (expression variable)
    pub name: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Physical units (e.g., "mA")
    pub units: Option<String>,
}

type Validator = Arc<dyn Fn(&Scalar) -> ScanResult<()> + Send + Sync>;

/// Observable scalar backed by a watch channel.
///
/// Every successful [`ObservableValue::set`] notifies subscribers, even if
/// the new value equals the old one, so a watchdog binding is never stale.
#[derive(Clone)]
pub struct ObservableValue {
    sender: watch::Sender<Scalar>,
    metadata: SourceMetadata,
    validator: Option<Validator>,
}

impl fmt::Debug for ObservableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableValue")
            .field("metadata", &self.metadata)
            .field("value", &*self.sender.borrow())
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

impl ObservableValue {
    /// Create an observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: impl Into<Scalar>) -> Self {
        let (sender, _) = watch::channel(initial_value.into());
        Self {
            sender,
            metadata: SourceMetadata {
                name: name.into(),
                ..SourceMetadata::default()
            },
            validator: None,
        }
    }

    /// Add a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = Some(description.into());
        self
    }

    /// Add units.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.metadata.units = Some(units.into());
        self
    }

    /// Accept only numbers within `[min, max]`.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        let name = self.metadata.name.clone();
        self.validator = Some(Arc::new(move |value: &Scalar| match value.as_f64() {
            Some(v) if (min..=max).contains(&v) => Ok(()),
            Some(v) => Err(ScanError::Source {
                name: name.clone(),
                message: format!("value {} is outside range [{}, {}]", v, min, max),
            }),
            None => Err(ScanError::Source {
                name: name.clone(),
                message: format!("expected a number, got '{}'", value),
            }),
        }));
        self
    }

    /// Current value (clone).
    pub fn get(&self) -> Scalar {
        self.sender.borrow().clone()
    }

    /// Metadata.
    pub fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    /// Set a new value and notify all subscribers.
    pub fn set(&self, value: impl Into<Scalar>) -> ScanResult<()> {
        let value = value.into();
        if let Some(validator) = &self.validator {
            validator(&value)?;
        }
        self.sender.send_replace(value);
        Ok(())
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl LiveValueSource for ObservableValue {
    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn current_value(&self) -> Scalar {
        self.get()
    }

    fn subscribe(&self) -> Option<watch::Receiver<Scalar>> {
        Some(self.sender.subscribe())
    }
}

/// A value that can only be read, never watched.
///
/// The watchdog refuses to arm on an expression that uses one.
#[derive(Debug)]
pub struct PolledValue {
    name: String,
    value: Mutex<Scalar>,
}

impl PolledValue {
    /// Create a polled value.
    pub fn new(name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self {
            name: name.into(),
            value: Mutex::new(value.into()),
        }
    }

    /// Replace the value silently.
    pub fn set(&self, value: impl Into<Scalar>) {
        *self.value.lock() = value.into();
    }
}

impl LiveValueSource for PolledValue {
    fn name(&self) -> &str {
        &self.name
    }

    fn current_value(&self) -> Scalar {
        self.value.lock().clone()
    }

    fn subscribe(&self) -> Option<watch::Receiver<Scalar>> {
        None
    }
}

/// Name-indexed set of live value sources.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: HashMap<String, Arc<dyn LiveValueSource>>,
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.sources.keys().collect();
        names.sort();
        f.debug_struct("SourceRegistry")
            .field("sources", &names)
            .finish()
    }
}

impl SourceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source under its own name, replacing any previous one.
    pub fn register(&mut self, source: Arc<dyn LiveValueSource>) {
        self.sources.insert(source.name().to_string(), source);
    }

    /// Builder form of [`SourceRegistry::register`].
    pub fn with(mut self, source: Arc<dyn LiveValueSource>) -> Self {
        self.register(source);
        self
    }

    /// Look up a source.
    pub fn get(&self, name: &str) -> Option<Arc<dyn LiveValueSource>> {
        self.sources.get(name).cloned()
    }

    /// Resolve a variable name or fail with [`ScanError::Source`].
    pub fn resolve(&self, name: &str) -> ScanResult<Arc<dyn LiveValueSource>> {
        self.get(name).ok_or_else(|| ScanError::Source {
            name: name.to_string(),
            message: "no live value source with this name".to_string(),
        })
    }

    /// Number of registered sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether no source is registered.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
