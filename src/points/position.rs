//! Position and scalar value types produced by generators.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A scalar axis or sensor value.
///
/// Motors report numbers; shutters and similar devices report text states
/// such as `"Open"` or `"Closed"`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Numeric value (all numbers normalized to f64)
    Number(f64),
    /// Text value
    Text(String),
}

impl Scalar {
    /// Numeric view of the value, if it is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Number(v) => Some(*v),
            Scalar::Text(_) => None,
        }
    }

    /// Text view of the value, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Number(_) => None,
            Scalar::Text(s) => Some(s),
        }
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Number(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Number(v) => write!(f, "{}", v),
            Scalar::Text(s) => write!(f, "{}", s),
        }
    }
}

/// One fully specified point of a trajectory.
///
/// Axis values are kept in axis order (outermost generator first). A name
/// appears at most once; inserting an existing name replaces its value.
/// `indices` locates the point along every dimension of the generator that
/// produced it and `step_index` counts yielded points from zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    values: Vec<(String, Scalar)>,
    indices: Vec<usize>,
    step_index: usize,
}

impl Position {
    /// Create a position from axis values and per-dimension indices.
    pub fn new(values: Vec<(String, Scalar)>, indices: Vec<usize>, step_index: usize) -> Self {
        let mut pos = Self {
            values: Vec::with_capacity(values.len()),
            indices,
            step_index,
        };
        for (name, value) in values {
            pos.insert(name, value);
        }
        pos
    }

    /// Single-axis position, the shape live value sources report changes in.
    pub fn single(name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self::new(vec![(name.into(), value.into())], Vec::new(), 0)
    }

    fn insert(&mut self, name: String, value: Scalar) {
        match self.values.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name, value)),
        }
    }

    /// Value of the named axis.
    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Numeric value of the named axis.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Scalar::as_f64)
    }

    /// Axis names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(n, _)| n.as_str())
    }

    /// Axis values with their names.
    pub fn values(&self) -> &[(String, Scalar)] {
        &self.values
    }

    /// Index of this point along each dimension of its generator.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Number of yielded points preceding this one.
    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub(crate) fn with_step_index(mut self, step_index: usize) -> Self {
        self.step_index = step_index;
        self
    }

    pub(crate) fn with_indices(mut self, indices: Vec<usize>) -> Self {
        self.indices = indices;
        self
    }

    /// Merge an ordered list of child positions (outer first) into one.
    pub(crate) fn compose(parts: &[Position], step_index: usize) -> Self {
        let value_count = parts.iter().map(|p| p.values.len()).sum();
        let mut pos = Self {
            values: Vec::with_capacity(value_count),
            indices: parts.iter().flat_map(|p| p.indices.iter().copied()).collect(),
            step_index,
        };
        for part in parts {
            for (name, value) in &part.values {
                pos.insert(name.clone(), value.clone());
            }
        }
        pos
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (name, value)) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        write!(f, "] step={}", self.step_index)
    }
}
