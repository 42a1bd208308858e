//! Per-dimension index ranges over a generator's shape.
//!
//! A [`ScanSlice`] addresses a sub-region of the index space as one
//! `[start, stop, step)` triple per dimension. The sequencer uses
//! [`slice_from`] to describe the remaining trajectory when it seeks.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ScanError, ScanResult};
use crate::limits::checked_point_count;

/// Per-dimension `[start, stop, step)` description of a trajectory sub-range.
///
/// Equality and hashing compare the three arrays element-wise.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanSlice {
    start: Vec<usize>,
    stop: Vec<usize>,
    step: Vec<usize>,
}

impl ScanSlice {
    /// Create a slice, checking that the arrays have equal length,
    /// `start <= stop` and `step > 0` in every dimension.
    pub fn new(start: Vec<usize>, stop: Vec<usize>, step: Vec<usize>) -> ScanResult<Self> {
        if start.len() != stop.len() || start.len() != step.len() {
            return Err(ScanError::validation(
                "slice",
                format!(
                    "start, stop and step must have equal length (got {}, {}, {})",
                    start.len(),
                    stop.len(),
                    step.len()
                ),
            ));
        }
        for dim in 0..start.len() {
            if start[dim] > stop[dim] {
                return Err(ScanError::validation(
                    "start",
                    format!(
                        "start {} is beyond stop {} in dimension {}",
                        start[dim], stop[dim], dim
                    ),
                ));
            }
            if step[dim] == 0 {
                return Err(ScanError::validation(
                    "step",
                    format!("step must be positive in dimension {}", dim),
                ));
            }
        }
        Ok(Self { start, stop, step })
    }

    /// First index in every dimension.
    pub fn start(&self) -> &[usize] {
        &self.start
    }

    /// Exclusive upper bound in every dimension.
    pub fn stop(&self) -> &[usize] {
        &self.stop
    }

    /// Stride in every dimension.
    pub fn step(&self) -> &[usize] {
        &self.step
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.start.len()
    }

    /// Number of multi-indices covered by the box this slice describes.
    pub fn size(&self) -> usize {
        (0..self.rank())
            .map(|d| (self.stop[d] - self.start[d]).div_ceil(self.step[d]))
            .product()
    }

    /// Whether a multi-index lies on the slice's lattice.
    pub fn contains(&self, indices: &[usize]) -> bool {
        indices.len() == self.rank()
            && (0..self.rank()).all(|d| {
                indices[d] >= self.start[d]
                    && indices[d] < self.stop[d]
                    && (indices[d] - self.start[d]) % self.step[d] == 0
            })
    }
}

impl fmt::Display for ScanSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ScanSlice [start={:?}, stop={:?}, step={:?}]",
            self.start, self.stop, self.step
        )
    }
}

/// Row-major multi-index of a linear index.
pub fn unravel(shape: &[usize], linear_index: usize) -> ScanResult<Vec<usize>> {
    let size = checked_point_count(shape)?;
    if linear_index >= size {
        return Err(ScanError::validation(
            "linear_index",
            format!(
                "index {} is outside a trajectory of {} points",
                linear_index, size
            ),
        ));
    }
    let mut indices = vec![0; shape.len()];
    let mut remainder = linear_index;
    for dim in (0..shape.len()).rev() {
        indices[dim] = remainder % shape[dim];
        remainder /= shape[dim];
    }
    Ok(indices)
}

/// Linear index of a row-major multi-index.
pub fn ravel(shape: &[usize], indices: &[usize]) -> ScanResult<usize> {
    if shape.len() != indices.len() {
        return Err(ScanError::validation(
            "indices",
            format!("expected {} indices, got {}", shape.len(), indices.len()),
        ));
    }
    let mut linear = 0usize;
    for (dim, (&len, &index)) in shape.iter().zip(indices).enumerate() {
        if index >= len {
            return Err(ScanError::validation(
                "indices",
                format!("index {} out of bounds {} in dimension {}", index, len, dim),
            ));
        }
        linear = linear * len + index;
    }
    Ok(linear)
}

/// Slice covering the remaining trajectory from `linear_index` to the end.
///
/// `start` is the row-major position of the index, `stop` equals the shape
/// and `step` is one in every dimension. Together with nested iteration order
/// this identifies where emission resumes.
pub fn slice_from(shape: &[usize], linear_index: usize) -> ScanResult<ScanSlice> {
    let start = unravel(shape, linear_index)?;
    ScanSlice::new(start, shape.to_vec(), vec![1; shape.len()])
}
