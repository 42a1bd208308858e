//! Nested composition of generators into one multi-dimensional trajectory.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ScanError, ScanResult};
use crate::limits::{checked_point_count, MAX_RANK};
use crate::points::generator::{Generator, GeneratorIter};
use crate::points::position::Position;
use crate::points::region::{FilterList, PointFilter};
use crate::points::{PointGenerator, PositionIter};

/// Ordered list of generators, outermost first.
///
/// The innermost generator completes a full pass for every position of the
/// generator outside it, recursively. Shape is the concatenation of the
/// enabled children's shapes; disabled children are skipped entirely.
/// Filters attached here see the composed position and flatten the shape to
/// `[size]`.
#[derive(Debug)]
pub struct CompoundGenerator {
    name: String,
    children: Vec<Generator>,
    filters: FilterList,
}

impl CompoundGenerator {
    /// Compose `children` (outermost first) and check the composition.
    pub fn new(name: impl Into<String>, children: Vec<Generator>) -> ScanResult<Self> {
        let compound = Self {
            name: name.into(),
            children,
            filters: FilterList::default(),
        };
        compound.validate()?;
        debug!(
            "Composed '{}' from {} generator(s)",
            compound.name,
            compound.children.len()
        );
        Ok(compound)
    }

    /// Attach a filter over composed positions (builder form).
    pub fn with_filter(mut self, filter: Arc<dyn PointFilter>) -> Self {
        self.filters.add(filter);
        self
    }

    /// Attach a filter over composed positions.
    pub fn add_filter(&mut self, filter: Arc<dyn PointFilter>) {
        self.filters.add(filter);
    }

    /// Detach filters by name.
    pub fn remove_filter(&mut self, name: &str) -> bool {
        self.filters.remove(name)
    }

    /// Compound-level filters.
    pub fn filters(&self) -> &[Arc<dyn PointFilter>] {
        self.filters.as_slice()
    }

    /// All children, including disabled ones.
    pub fn children(&self) -> &[Generator] {
        &self.children
    }

    /// Mutable access to a child, e.g. to toggle it or attach a filter.
    pub fn child_mut(&mut self, index: usize) -> Option<&mut Generator> {
        self.children.get_mut(index)
    }

    fn active(&self) -> impl Iterator<Item = &Generator> {
        self.children.iter().filter(|c| c.is_enabled())
    }

    fn unfiltered_shape(&self) -> ScanResult<Vec<usize>> {
        let mut shape = Vec::new();
        for child in self.active() {
            shape.extend(child.shape()?);
        }
        Ok(shape)
    }

    /// Concrete lazy iterator (see [`PointGenerator::positions`]).
    pub fn iter(&self) -> CompoundIter<'_> {
        CompoundIter {
            children: self.active().collect(),
            iters: Vec::new(),
            current: Vec::new(),
            filters: &self.filters,
            started: false,
            done: false,
            candidate: 0,
            step: 0,
        }
    }
}

impl PointGenerator for CompoundGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> ScanResult<()> {
        if self.active().next().is_none() {
            return Err(ScanError::Generator(format!(
                "compound generator '{}' has no enabled generators",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        let mut rank = 0;
        for child in self.active() {
            child.validate()?;
            rank += child.rank()?;
            for axis in child.axes() {
                if !seen.insert(axis.clone()) {
                    return Err(ScanError::Generator(format!(
                        "axis '{}' is moved by more than one generator in '{}'",
                        axis, self.name
                    )));
                }
            }
        }

        if rank > MAX_RANK {
            return Err(ScanError::LimitExceeded {
                what: "scan rank",
                limit: MAX_RANK,
            });
        }
        checked_point_count(&self.unfiltered_shape()?)?;
        Ok(())
    }

    fn size(&self) -> ScanResult<usize> {
        if self.filters.is_empty() {
            let sizes = self
                .active()
                .map(|c| c.size())
                .collect::<ScanResult<Vec<_>>>()?;
            return checked_point_count(&sizes);
        }
        self.iter().try_fold(0usize, |count, pos| pos.map(|_| count + 1))
    }

    fn shape(&self) -> ScanResult<Vec<usize>> {
        if self.filters.is_empty() {
            self.unfiltered_shape()
        } else {
            Ok(vec![self.size()?])
        }
    }

    fn positions(&self) -> ScanResult<PositionIter<'_>> {
        self.validate()?;
        Ok(Box::new(self.iter()))
    }
}

/// Lazy nested iterator over a compound generator.
///
/// Holds one live child iterator and the current position per child. When a
/// child runs out it is replaced by a fresh iterator and the next outer child
/// advances by one.
pub struct CompoundIter<'a> {
    children: Vec<&'a Generator>,
    iters: Vec<GeneratorIter<'a>>,
    current: Vec<Position>,
    filters: &'a FilterList,
    started: bool,
    done: bool,
    candidate: usize,
    step: usize,
}

impl<'a> CompoundIter<'a> {
    /// Prime every child with its first position.
    fn start(&mut self) -> ScanResult<bool> {
        for index in 0..self.children.len() {
            let child: &'a Generator = self.children[index];
            let mut iter = child.iter();
            match iter.next() {
                Some(pos) => self.current.push(pos?),
                None => return Ok(false),
            }
            self.iters.push(iter);
        }
        Ok(true)
    }

    /// Advance the innermost child, carrying into outer children.
    fn advance(&mut self) -> ScanResult<bool> {
        let mut level = self.iters.len();
        while level > 0 {
            level -= 1;
            if let Some(pos) = self.iters[level].next() {
                self.current[level] = pos?;
                for inner in level + 1..self.iters.len() {
                    let child: &'a Generator = self.children[inner];
                    let mut fresh = child.iter();
                    match fresh.next() {
                        Some(pos) => self.current[inner] = pos?,
                        None => return Ok(false),
                    }
                    self.iters[inner] = fresh;
                }
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Iterator for CompoundIter<'_> {
    type Item = ScanResult<Position>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            let moved = if self.started {
                self.advance()
            } else {
                self.started = true;
                self.start()
            };
            match moved {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }

            let position = Position::compose(&self.current, self.step);
            let candidate_index = self.candidate;
            self.candidate += 1;

            if self.filters.is_empty() {
                self.step += 1;
                return Some(Ok(position));
            }

            match self.filters.accepts(&position, candidate_index) {
                Ok(true) => {
                    let step = self.step;
                    self.step += 1;
                    return Some(Ok(position.with_indices(vec![step])));
                }
                Ok(false) => continue,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::points::models::{BoundingBox, GridModel, StepModel};
    use crate::points::region::{PredicateFilter, RectangularRegion};

    fn axis(name: &str, start: f64, stop: f64, step: f64) -> Generator {
        Generator::new(Box::new(StepModel::new(name, start, stop, step))).unwrap()
    }

    #[test]
    fn test_nested_order() {
        let scan = CompoundGenerator::new(
            "grid",
            vec![axis("y", 0.0, 1.0, 1.0), axis("x", 0.0, 2.0, 1.0)],
        )
        .unwrap();

        let points = scan.materialize().unwrap();
        let pairs: Vec<(f64, f64)> = points
            .iter()
            .map(|p| (p.get_f64("y").unwrap(), p.get_f64("x").unwrap()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                (0.0, 0.0),
                (0.0, 1.0),
                (0.0, 2.0),
                (1.0, 0.0),
                (1.0, 1.0),
                (1.0, 2.0)
            ]
        );
        assert_eq!(points[4].indices(), &[1, 1]);
        assert_eq!(points[4].step_index(), 4);
        assert_eq!(scan.shape().unwrap(), vec![2, 3]);
        assert_eq!(scan.size().unwrap(), 6);
    }

    #[test]
    fn test_duplicate_axes_rejected() {
        let err = CompoundGenerator::new(
            "bad",
            vec![axis("x", 0.0, 1.0, 1.0), axis("x", 0.0, 2.0, 1.0)],
        )
        .unwrap_err();
        assert!(matches!(err, ScanError::Generator(_)));
    }

    #[test]
    fn test_empty_compound_rejected() {
        assert!(CompoundGenerator::new("empty", vec![]).is_err());
    }

    #[test]
    fn test_disabled_child_is_skipped() {
        let mut scan = CompoundGenerator::new(
            "grid",
            vec![axis("y", 0.0, 1.0, 1.0), axis("x", 0.0, 2.0, 1.0)],
        )
        .unwrap();
        if let Some(child) = scan.child_mut(0) {
            child.set_enabled(false);
        }
        assert_eq!(scan.shape().unwrap(), vec![3]);
        let first = scan.first_point().unwrap().unwrap();
        assert!(first.get("y").is_none());
    }

    #[test]
    fn test_region_flattens_shape() {
        let scan = CompoundGenerator::new(
            "grid",
            vec![axis("y", 0.0, 3.0, 1.0), axis("x", 0.0, 3.0, 1.0)],
        )
        .unwrap()
        .with_filter(Arc::new(RectangularRegion {
            name: "roi".into(),
            x_axis: "x".into(),
            y_axis: "y".into(),
            x_start: 1.0,
            y_start: 1.0,
            width: 1.0,
            height: 1.0,
        }));

        assert_eq!(scan.size().unwrap(), 4);
        assert_eq!(scan.shape().unwrap(), vec![4]);
        assert_eq!(scan.rank().unwrap(), 1);
        let points = scan.materialize().unwrap();
        assert_eq!(points[0].get_f64("y"), Some(1.0));
        assert_eq!(points[0].get_f64("x"), Some(1.0));
        assert_eq!(points[3].step_index(), 3);
        assert_eq!(points[3].indices(), &[3]);
    }

    #[test]
    fn test_filtered_child_inside_compound() {
        let inner = axis("x", 0.0, 5.0, 1.0).with_filter(Arc::new(
            PredicateFilter::new("odd", |p, _| {
                Ok(p.get_f64("x").map(|x| x as i64 % 2 == 1).unwrap_or(false))
            }),
        ));
        let scan = CompoundGenerator::new("nested", vec![axis("y", 0.0, 1.0, 1.0), inner]).unwrap();
        assert_eq!(scan.shape().unwrap(), vec![2, 3]);
        assert_eq!(scan.size().unwrap(), 6);
        let xs: Vec<f64> = scan
            .materialize()
            .unwrap()
            .iter()
            .filter_map(|p| p.get_f64("x"))
            .collect();
        assert_eq!(xs, vec![1.0, 3.0, 5.0, 1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_product_above_point_limit_rejected() {
        let err = CompoundGenerator::new(
            "huge",
            vec![axis("y", 0.0, 4999.0, 1.0), axis("x", 0.0, 4999.0, 1.0)],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ScanError::LimitExceeded {
                what: "scan point count",
                ..
            }
        ));

        let mut scan = CompoundGenerator::new("huge", vec![axis("y", 0.0, 4999.0, 1.0)]).unwrap();
        scan.children.push(axis("x", 0.0, 4999.0, 1.0));
        assert!(scan.positions().is_err());
    }

    #[test]
    fn test_filtered_child_counts_as_rank_one() {
        let mut children: Vec<Generator> = (0..MAX_RANK - 1)
            .map(|i| axis(&format!("a{}", i), 0.0, 0.0, 1.0))
            .collect();
        let grid = Generator::new(Box::new(GridModel {
            fast_axis: "x".into(),
            slow_axis: "y".into(),
            bounding_box: BoundingBox {
                fast_start: 0.0,
                slow_start: 0.0,
                fast_length: 2.0,
                slow_length: 2.0,
            },
            fast_points: 2,
            slow_points: 2,
            snake: false,
        }))
        .unwrap()
        .with_filter(Arc::new(PredicateFilter::new("all", |_, _| Ok(true))));
        children.push(grid);

        let scan = CompoundGenerator::new("deep", children).unwrap();
        assert_eq!(scan.rank().unwrap(), MAX_RANK);
        assert_eq!(scan.size().unwrap(), 4);
    }

    #[test]
    fn test_compound_filter_failure_is_generator_error() {
        let scan = CompoundGenerator::new(
            "grid",
            vec![axis("y", 0.0, 1.0, 1.0), axis("x", 0.0, 1.0, 1.0)],
        )
        .unwrap()
        .with_filter(Arc::new(PredicateFilter::new("sensor", |_, i| {
            if i < 2 {
                Ok(true)
            } else {
                Err(ScanError::Control("sensor offline".into()))
            }
        })));

        let mut iter = scan.positions().unwrap();
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().unwrap().is_ok());
        assert!(matches!(iter.next(), Some(Err(ScanError::Generator(_)))));
        assert!(iter.next().is_none());
        assert!(matches!(scan.materialize(), Err(ScanError::Generator(_))));
    }
}
