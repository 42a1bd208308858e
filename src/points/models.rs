//! Axis models: validated parameter sets describing one generator's motion.
//!
//! A model is a plain value object. Nothing is computed from it until
//! [`AxisModel::validate`] has passed; after that its shape is analytic and any
//! point can be computed directly from its multi-index, so generators never
//! need to store previously produced points.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::error::{ScanError, ScanResult};
use crate::limits::MAX_POINTS;
use crate::points::position::Scalar;

/// Slack applied before flooring `length / step` so that exact multiples
/// (e.g. `10.0 / 5.0`) are not lost to rounding.
const STEP_EPSILON: f64 = 1e-9;

/// Parameters for one axis (or one coupled group of axes) of motion.
pub trait AxisModel: Debug + Send + Sync {
    /// Short identifier of the model type (`"step"`, `"grid"`, ...).
    fn kind(&self) -> &'static str;

    /// Names of the axes this model moves, in value order.
    fn axes(&self) -> Vec<String>;

    /// Check parameter constraints.
    fn validate(&self) -> ScanResult<()>;

    /// Analytic shape. Only meaningful for a validated model.
    fn shape(&self) -> Vec<usize>;

    /// Axis values of the point at `indices` (one index per dimension of
    /// [`AxisModel::shape`]).
    fn values_at(&self, indices: &[usize]) -> Vec<(String, Scalar)>;
}

fn require_finite(field: &str, value: f64) -> ScanResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ScanError::validation(
            field,
            "must be a finite number (not NaN or infinity)",
        ))
    }
}

fn require_name(field: &str, name: &str) -> ScanResult<()> {
    if name.trim().is_empty() {
        Err(ScanError::validation(field, "axis name cannot be empty"))
    } else {
        Ok(())
    }
}

fn require_positive_step(step: f64) -> ScanResult<()> {
    require_finite("step", step)?;
    if step <= 0.0 {
        return Err(ScanError::validation(
            "step",
            "Model step size must be positive!",
        ));
    }
    Ok(())
}

/// Number of points of a stepped span, including both ends.
fn stepped_count(length: f64, step: f64) -> usize {
    (length / step + STEP_EPSILON).floor() as usize + 1
}

fn require_stepped_limit(length: f64, step: f64) -> ScanResult<()> {
    if length / step >= MAX_POINTS as f64 {
        return Err(ScanError::LimitExceeded {
            what: "scan point count",
            limit: MAX_POINTS,
        });
    }
    Ok(())
}

// =============================================================================
// StepModel
// =============================================================================

/// Scalar axis stepped from `start` towards `stop` by `step`.
///
/// The direction is taken from `stop - start`, so `step` is always a positive
/// magnitude. A span shorter than one step still yields the start point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepModel {
    pub name: String,
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl StepModel {
    /// Create a step model for the named axis.
    pub fn new(name: impl Into<String>, start: f64, stop: f64, step: f64) -> Self {
        Self {
            name: name.into(),
            start,
            stop,
            step,
        }
    }

    fn direction(&self) -> f64 {
        if self.stop >= self.start {
            1.0
        } else {
            -1.0
        }
    }
}

impl AxisModel for StepModel {
    fn kind(&self) -> &'static str {
        "step"
    }

    fn axes(&self) -> Vec<String> {
        vec![self.name.clone()]
    }

    fn validate(&self) -> ScanResult<()> {
        require_name("name", &self.name)?;
        require_finite("start", self.start)?;
        require_finite("stop", self.stop)?;
        require_positive_step(self.step)?;
        require_stepped_limit((self.stop - self.start).abs(), self.step)
    }

    fn shape(&self) -> Vec<usize> {
        vec![stepped_count((self.stop - self.start).abs(), self.step)]
    }

    fn values_at(&self, indices: &[usize]) -> Vec<(String, Scalar)> {
        let i = indices.first().copied().unwrap_or(0) as f64;
        let value = self.start + self.direction() * self.step * i;
        vec![(self.name.clone(), Scalar::Number(value))]
    }
}

// =============================================================================
// ArrayModel
// =============================================================================

/// Scalar axis visiting an explicit list of positions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArrayModel {
    pub name: String,
    pub positions: Vec<f64>,
}

impl ArrayModel {
    /// Create an array model for the named axis.
    pub fn new(name: impl Into<String>, positions: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            positions,
        }
    }
}

impl AxisModel for ArrayModel {
    fn kind(&self) -> &'static str {
        "array"
    }

    fn axes(&self) -> Vec<String> {
        vec![self.name.clone()]
    }

    fn validate(&self) -> ScanResult<()> {
        require_name("name", &self.name)?;
        if self.positions.is_empty() {
            return Err(ScanError::validation(
                "positions",
                "at least one position is required",
            ));
        }
        if self.positions.len() > MAX_POINTS {
            return Err(ScanError::LimitExceeded {
                what: "scan point count",
                limit: MAX_POINTS,
            });
        }
        self.positions
            .iter()
            .try_for_each(|&p| require_finite("positions", p))
    }

    fn shape(&self) -> Vec<usize> {
        vec![self.positions.len()]
    }

    fn values_at(&self, indices: &[usize]) -> Vec<(String, Scalar)> {
        let i = indices.first().copied().unwrap_or(0);
        let value = self.positions.get(i).copied().unwrap_or(f64::NAN);
        vec![(self.name.clone(), Scalar::Number(value))]
    }
}

// =============================================================================
// LineStepModel
// =============================================================================

/// Straight line in the plane of two axes. `angle` is in radians from the
/// first axis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingLine {
    pub x_start: f64,
    pub y_start: f64,
    pub length: f64,
    #[serde(default)]
    pub angle: f64,
}

/// Two coupled axes stepped along a bounding line (rank 1).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineStepModel {
    pub x_axis: String,
    pub y_axis: String,
    pub line: BoundingLine,
    pub step: f64,
}

impl AxisModel for LineStepModel {
    fn kind(&self) -> &'static str {
        "line"
    }

    fn axes(&self) -> Vec<String> {
        vec![self.x_axis.clone(), self.y_axis.clone()]
    }

    fn validate(&self) -> ScanResult<()> {
        require_name("x_axis", &self.x_axis)?;
        require_name("y_axis", &self.y_axis)?;
        if self.x_axis == self.y_axis {
            return Err(ScanError::validation(
                "y_axis",
                "line axes must be different",
            ));
        }
        require_finite("line.x_start", self.line.x_start)?;
        require_finite("line.y_start", self.line.y_start)?;
        require_finite("line.angle", self.line.angle)?;
        require_finite("line.length", self.line.length)?;
        if self.line.length < 0.0 {
            return Err(ScanError::validation(
                "line.length",
                "line length cannot be negative",
            ));
        }
        require_positive_step(self.step)?;
        require_stepped_limit(self.line.length, self.step)
    }

    fn shape(&self) -> Vec<usize> {
        vec![stepped_count(self.line.length, self.step)]
    }

    fn values_at(&self, indices: &[usize]) -> Vec<(String, Scalar)> {
        let distance = indices.first().copied().unwrap_or(0) as f64 * self.step;
        let x = self.line.x_start + distance * self.line.angle.cos();
        let y = self.line.y_start + distance * self.line.angle.sin();
        vec![
            (self.x_axis.clone(), Scalar::Number(x)),
            (self.y_axis.clone(), Scalar::Number(y)),
        ]
    }
}

// =============================================================================
// GridModel
// =============================================================================

/// Axis-aligned rectangle in the plane of a fast and a slow axis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub fast_start: f64,
    pub slow_start: f64,
    pub fast_length: f64,
    pub slow_length: f64,
}

/// Raster over a bounding box, shape `[slow_points, fast_points]`.
///
/// Points sit at cell centres. With `snake` set, odd rows of the fast axis
/// run backwards so the motor never flies back across the box.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridModel {
    pub fast_axis: String,
    pub slow_axis: String,
    pub bounding_box: BoundingBox,
    pub fast_points: usize,
    pub slow_points: usize,
    #[serde(default)]
    pub snake: bool,
}

impl GridModel {
    fn cell_centre(start: f64, length: f64, points: usize, index: usize) -> f64 {
        start + (index as f64 + 0.5) * length / points as f64
    }
}

impl AxisModel for GridModel {
    fn kind(&self) -> &'static str {
        "grid"
    }

    fn axes(&self) -> Vec<String> {
        vec![self.slow_axis.clone(), self.fast_axis.clone()]
    }

    fn validate(&self) -> ScanResult<()> {
        require_name("fast_axis", &self.fast_axis)?;
        require_name("slow_axis", &self.slow_axis)?;
        if self.fast_axis == self.slow_axis {
            return Err(ScanError::validation(
                "slow_axis",
                "fast and slow axes must be different",
            ));
        }
        let b = &self.bounding_box;
        require_finite("bounding_box.fast_start", b.fast_start)?;
        require_finite("bounding_box.slow_start", b.slow_start)?;
        require_finite("bounding_box.fast_length", b.fast_length)?;
        require_finite("bounding_box.slow_length", b.slow_length)?;
        if self.fast_points == 0 {
            return Err(ScanError::validation("fast_points", "must be > 0"));
        }
        if self.slow_points == 0 {
            return Err(ScanError::validation("slow_points", "must be > 0"));
        }
        crate::limits::checked_point_count(&[self.slow_points, self.fast_points]).map(|_| ())
    }

    fn shape(&self) -> Vec<usize> {
        vec![self.slow_points, self.fast_points]
    }

    fn values_at(&self, indices: &[usize]) -> Vec<(String, Scalar)> {
        let slow = indices.first().copied().unwrap_or(0);
        let mut fast = indices.get(1).copied().unwrap_or(0);
        if self.snake && slow % 2 == 1 {
            fast = self.fast_points - 1 - fast;
        }
        let b = &self.bounding_box;
        vec![
            (
                self.slow_axis.clone(),
                Scalar::Number(Self::cell_centre(
                    b.slow_start,
                    b.slow_length,
                    self.slow_points,
                    slow,
                )),
            ),
            (
                self.fast_axis.clone(),
                Scalar::Number(Self::cell_centre(
                    b.fast_start,
                    b.fast_length,
                    self.fast_points,
                    fast,
                )),
            ),
        ]
    }
}

// =============================================================================
// Model definitions (configuration)
// =============================================================================

/// Serializable choice of model, as written in scan definition files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelDefinition {
    Step(StepModel),
    Array(ArrayModel),
    Line(LineStepModel),
    Grid(GridModel),
}

impl ModelDefinition {
    /// Convert into a boxed model ready to be configured on a generator.
    pub fn into_model(self) -> Box<dyn AxisModel> {
        match self {
            ModelDefinition::Step(m) => Box::new(m),
            ModelDefinition::Array(m) => Box::new(m),
            ModelDefinition::Line(m) => Box::new(m),
            ModelDefinition::Grid(m) => Box::new(m),
        }
    }
}
