//! Trajectory generation.
//!
//! Generators lazily produce the ordered positions of a scan over an
//! N-dimensional index space.
//!
//! # Architecture
//!
//! ```text
//! AxisModel (StepModel, ArrayModel, LineStepModel, GridModel)
//!     └── Generator          one validated model + region/container filters
//!           └── CompoundGenerator   nested composition, outermost first
//!
//! PointGenerator trait: size / shape / rank / iter / materialize
//! ScanSlice: per-dimension [start, stop, step) used when seeking
//! ```
//!
//! Iterators compute one position per call from the current multi-index and
//! never keep earlier positions, so memory stays proportional to the rank.
//! A fresh iterator must be requested to iterate again.
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_scanning::points::{CompoundGenerator, Generator, PointGenerator, StepModel};
//!
//! let outer = Generator::new(Box::new(StepModel::new("y", 0.0, 2.0, 1.0)))?;
//! let inner = Generator::new(Box::new(StepModel::new("x", 10.0, 20.0, 5.0)))?;
//! let scan = CompoundGenerator::new("raster", vec![outer, inner])?;
//!
//! assert_eq!(scan.shape()?, vec![3, 3]);
//! for position in scan.positions()? {
//!     println!("{}", position?);
//! }
//! ```

pub mod compound;
pub mod generator;
pub mod models;
pub mod position;
pub mod region;
pub mod slice;

pub use compound::{CompoundGenerator, CompoundIter};
pub use generator::{Generator, GeneratorIter};
pub use models::{
    ArrayModel, AxisModel, BoundingBox, BoundingLine, GridModel, LineStepModel, ModelDefinition,
    StepModel,
};
pub use position::{Position, Scalar};
pub use region::{
    CircularRegion, FilterList, PointFilter, PredicateFilter, RectangularRegion, RegionDefinition,
};
pub use slice::{ravel, slice_from, unravel, ScanSlice};

use crate::error::ScanResult;

/// Boxed lazy sequence of positions. Ends after the first error.
pub type PositionIter<'a> = Box<dyn Iterator<Item = ScanResult<Position>> + Send + 'a>;

/// Common surface of single and compound generators.
pub trait PointGenerator: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Re-check model and composition constraints.
    fn validate(&self) -> ScanResult<()>;

    /// Number of positions an exhaustive iteration yields.
    ///
    /// Analytic (O(1) in the number of points) when no filter is attached;
    /// with filters this counts by iterating, which costs O(size).
    fn size(&self) -> ScanResult<usize>;

    /// Length of each dimension. Filtered generators report `[size]`.
    fn shape(&self) -> ScanResult<Vec<usize>>;

    /// Number of dimensions, always `shape().len()`.
    fn rank(&self) -> ScanResult<usize> {
        Ok(self.shape()?.len())
    }

    /// Fresh lazy iterator over the positions.
    fn positions(&self) -> ScanResult<PositionIter<'_>>;

    /// Drain a fresh iterator into memory.
    ///
    /// O(size) time and memory; prefer [`PointGenerator::positions`] unless
    /// random access is really needed.
    fn materialize(&self) -> ScanResult<Vec<Position>> {
        self.positions()?.collect()
    }

    /// The first position, without iterating further.
    fn first_point(&self) -> ScanResult<Option<Position>> {
        self.positions()?.next().transpose()
    }
}

/// Advance a row-major multi-index (last dimension fastest).
///
/// Returns `false` once the index has wrapped past the final element.
pub(crate) fn increment_index(index: &mut [usize], shape: &[usize]) -> bool {
    for dim in (0..index.len()).rev() {
        index[dim] += 1;
        if index[dim] < shape[dim] {
            return true;
        }
        index[dim] = 0;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_index_row_major() {
        let shape = [2, 3];
        let mut index = vec![0, 0];
        let mut seen = vec![index.clone()];
        while increment_index(&mut index, &shape) {
            seen.push(index.clone());
        }
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[1], vec![0, 1]);
        assert_eq!(seen[3], vec![1, 0]);
        assert_eq!(seen[5], vec![1, 2]);
    }

    #[test]
    fn test_increment_index_rank_zero() {
        let mut index: Vec<usize> = vec![];
        assert!(!increment_index(&mut index, &[]));
    }
}
