//! Region and container filters that mask generator output.
//!
//! A filter is a pure predicate over a candidate position. Generators only
//! yield candidates accepted by every attached filter. Geometric regions
//! test two named axes; predicate containers run arbitrary logic and also see
//! the candidate's index in the unfiltered sequence.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{ScanError, ScanResult};
use crate::points::position::Position;

/// Predicate deciding whether a candidate position is kept.
///
/// Implementations must be side-effect free: evaluating the same candidate
/// twice gives the same answer.
pub trait PointFilter: fmt::Debug + Send + Sync {
    /// Name used to identify the filter for removal and diagnostics.
    fn name(&self) -> &str;

    /// Whether the candidate at `candidate_index` (its position in the
    /// unfiltered sequence) is kept.
    fn accepts(&self, position: &Position, candidate_index: usize) -> ScanResult<bool>;
}

fn axis_value(position: &Position, axis: &str, region: &str) -> ScanResult<f64> {
    position.get_f64(axis).ok_or_else(|| {
        ScanError::Generator(format!(
            "region '{}' needs numeric axis '{}' which is missing from {}",
            region, axis, position
        ))
    })
}

/// Axis-aligned rectangle over two axes, edges inclusive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RectangularRegion {
    pub name: String,
    pub x_axis: String,
    pub y_axis: String,
    pub x_start: f64,
    pub y_start: f64,
    pub width: f64,
    pub height: f64,
}

impl PointFilter for RectangularRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, position: &Position, _candidate_index: usize) -> ScanResult<bool> {
        let x = axis_value(position, &self.x_axis, &self.name)?;
        let y = axis_value(position, &self.y_axis, &self.name)?;
        let (x0, x1) = ordered(self.x_start, self.x_start + self.width);
        let (y0, y1) = ordered(self.y_start, self.y_start + self.height);
        Ok(x >= x0 && x <= x1 && y >= y0 && y <= y1)
    }
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Disc over two axes, boundary inclusive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircularRegion {
    pub name: String,
    pub x_axis: String,
    pub y_axis: String,
    pub x_centre: f64,
    pub y_centre: f64,
    pub radius: f64,
}

impl PointFilter for CircularRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, position: &Position, _candidate_index: usize) -> ScanResult<bool> {
        let dx = axis_value(position, &self.x_axis, &self.name)? - self.x_centre;
        let dy = axis_value(position, &self.y_axis, &self.name)? - self.y_centre;
        Ok(dx * dx + dy * dy <= self.radius * self.radius)
    }
}

type Predicate = dyn Fn(&Position, usize) -> ScanResult<bool> + Send + Sync;

/// Logical container backed by a closure.
#[derive(Clone)]
pub struct PredicateFilter {
    name: String,
    predicate: Arc<Predicate>,
}

impl PredicateFilter {
    /// Wrap a closure as a named filter.
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Position, usize) -> ScanResult<bool> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }
}

impl fmt::Debug for PredicateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateFilter")
            .field("name", &self.name)
            .finish()
    }
}

impl PointFilter for PredicateFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, position: &Position, candidate_index: usize) -> ScanResult<bool> {
        (self.predicate)(position, candidate_index)
    }
}

/// Serializable region, as written in scan definition files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegionDefinition {
    Rectangle(RectangularRegion),
    Circle(CircularRegion),
}

impl RegionDefinition {
    /// Convert into a shareable filter.
    pub fn into_filter(self) -> Arc<dyn PointFilter> {
        match self {
            RegionDefinition::Rectangle(r) => Arc::new(r),
            RegionDefinition::Circle(c) => Arc::new(c),
        }
    }
}

/// Ordered list of filters attached to a generator.
#[derive(Clone, Debug, Default)]
pub struct FilterList {
    filters: Vec<Arc<dyn PointFilter>>,
}

impl FilterList {
    /// Attach a filter.
    pub fn add(&mut self, filter: Arc<dyn PointFilter>) {
        self.filters.push(filter);
    }

    /// Detach every filter with the given name. Returns whether any matched.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.filters.len();
        self.filters.retain(|f| f.name() != name);
        self.filters.len() != before
    }

    /// Attached filters in order.
    pub fn as_slice(&self) -> &[Arc<dyn PointFilter>] {
        &self.filters
    }

    /// Whether no filter is attached.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// True when every filter accepts the candidate. Stops at the first
    /// rejection or error; any filter failure surfaces as a generator error.
    pub fn accepts(&self, position: &Position, candidate_index: usize) -> ScanResult<bool> {
        for filter in &self.filters {
            match filter.accepts(position, candidate_index) {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(err @ ScanError::Generator(_)) => return Err(err),
                Err(other) => {
                    return Err(ScanError::Generator(format!(
                        "filter '{}' failed on candidate {}: {}",
                        filter.name(),
                        candidate_index,
                        other
                    )))
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xy(x: f64, y: f64) -> Position {
        Position::new(vec![("x".into(), x.into()), ("y".into(), y.into())], vec![], 0)
    }

    #[test]
    fn test_rectangle_inclusive_edges() {
        let region = RectangularRegion {
            name: "roi".into(),
            x_axis: "x".into(),
            y_axis: "y".into(),
            x_start: 1.0,
            y_start: 1.0,
            width: 2.0,
            height: -1.0,
        };
        assert!(region.accepts(&xy(1.0, 0.0), 0).unwrap());
        assert!(region.accepts(&xy(3.0, 1.0), 0).unwrap());
        assert!(!region.accepts(&xy(3.1, 0.5), 0).unwrap());
    }

    #[test]
    fn test_circle() {
        let region = CircularRegion {
            name: "disc".into(),
            x_axis: "x".into(),
            y_axis: "y".into(),
            x_centre: 0.0,
            y_centre: 0.0,
            radius: 1.0,
        };
        assert!(region.accepts(&xy(0.6, 0.7), 0).unwrap());
        assert!(region.accepts(&xy(0.0, -1.0), 0).unwrap());
        assert!(!region.accepts(&xy(0.8, 0.8), 0).unwrap());
    }

    #[test]
    fn test_missing_axis_is_generator_error() {
        let region = CircularRegion {
            name: "disc".into(),
            x_axis: "x".into(),
            y_axis: "z".into(),
            x_centre: 0.0,
            y_centre: 0.0,
            radius: 1.0,
        };
        assert!(matches!(
            region.accepts(&xy(0.0, 0.0), 0),
            Err(ScanError::Generator(_))
        ));
    }

    #[test]
    fn test_filter_list_add_remove() {
        let mut list = FilterList::default();
        list.add(Arc::new(PredicateFilter::new("even", |_, i| Ok(i % 2 == 0))));
        assert!(!list.accepts(&xy(0.0, 0.0), 1).unwrap());
        assert!(list.remove("even"));
        assert!(!list.remove("even"));
        assert!(list.accepts(&xy(0.0, 0.0), 1).unwrap());
    }

    #[test]
    fn test_filter_failure_becomes_generator_error() {
        let mut list = FilterList::default();
        list.add(Arc::new(PredicateFilter::new("sensor", |_, _| {
            Err(ScanError::Control("sensor offline".into()))
        })));
        let err = list.accepts(&xy(0.0, 0.0), 7).unwrap_err();
        assert!(matches!(err, ScanError::Generator(ref msg)
            if msg.contains("'sensor'") && msg.contains("candidate 7") && msg.contains("sensor offline")));
    }
}
