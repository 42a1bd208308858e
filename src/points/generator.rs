//! Single-model generator with optional region/container filtering.

use std::sync::Arc;
use tracing::debug;

use crate::error::ScanResult;
use crate::limits::checked_point_count;
use crate::points::models::AxisModel;
use crate::points::position::Position;
use crate::points::region::{FilterList, PointFilter};
use crate::points::{increment_index, PointGenerator, PositionIter};

/// Generator for one axis model.
///
/// The model is validated when it is configured, so a `Generator` never holds
/// an invalid model and no position is ever computed from one.
#[derive(Debug)]
pub struct Generator {
    model: Box<dyn AxisModel>,
    filters: FilterList,
    label: String,
    enabled: bool,
}

impl Generator {
    /// Validate `model` and wrap it in a generator.
    pub fn new(model: Box<dyn AxisModel>) -> ScanResult<Self> {
        model.validate()?;
        let label = format!("{}({})", model.kind(), model.axes().join(", "));
        debug!("Configured generator {}", label);
        Ok(Self {
            model,
            filters: FilterList::default(),
            label,
            enabled: true,
        })
    }

    /// Replace the model. On validation failure the previous model is kept.
    pub fn configure(&mut self, model: Box<dyn AxisModel>) -> ScanResult<()> {
        model.validate()?;
        self.model = model;
        Ok(())
    }

    /// Set the label shown in logs and listings.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Attach a filter (builder form).
    pub fn with_filter(mut self, filter: Arc<dyn PointFilter>) -> Self {
        self.filters.add(filter);
        self
    }

    /// The configured model.
    pub fn model(&self) -> &dyn AxisModel {
        self.model.as_ref()
    }

    /// Attach a filter.
    pub fn add_filter(&mut self, filter: Arc<dyn PointFilter>) {
        self.filters.add(filter);
    }

    /// Detach filters by name.
    pub fn remove_filter(&mut self, name: &str) -> bool {
        self.filters.remove(name)
    }

    /// Attached filters.
    pub fn filters(&self) -> &[Arc<dyn PointFilter>] {
        self.filters.as_slice()
    }

    /// Whether a compound generator should include this generator.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Include or skip this generator when composed.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Axis names moved by this generator.
    pub fn axes(&self) -> Vec<String> {
        self.model.axes()
    }

    /// Concrete lazy iterator (see [`PointGenerator::positions`]).
    pub fn iter(&self) -> GeneratorIter<'_> {
        GeneratorIter::new(self.model.as_ref(), &self.filters)
    }
}

impl PointGenerator for Generator {
    fn name(&self) -> &str {
        &self.label
    }

    fn validate(&self) -> ScanResult<()> {
        self.model.validate()
    }

    fn size(&self) -> ScanResult<usize> {
        if self.filters.is_empty() {
            return checked_point_count(&self.model.shape());
        }
        self.iter().try_fold(0usize, |count, pos| pos.map(|_| count + 1))
    }

    fn shape(&self) -> ScanResult<Vec<usize>> {
        if self.filters.is_empty() {
            Ok(self.model.shape())
        } else {
            Ok(vec![self.size()?])
        }
    }

    fn positions(&self) -> ScanResult<PositionIter<'_>> {
        Ok(Box::new(self.iter()))
    }
}

/// Lazy iterator over one generator's positions.
///
/// Walks the model's multi-index in row-major order. Candidates rejected by a
/// filter are skipped without consuming a step index.
pub struct GeneratorIter<'a> {
    model: &'a dyn AxisModel,
    filters: &'a FilterList,
    shape: Vec<usize>,
    cursor: Option<Vec<usize>>,
    candidate: usize,
    step: usize,
}

impl<'a> GeneratorIter<'a> {
    fn new(model: &'a dyn AxisModel, filters: &'a FilterList) -> Self {
        let shape = model.shape();
        let cursor = if shape.iter().any(|&len| len == 0) {
            None
        } else {
            Some(vec![0; shape.len()])
        };
        Self {
            model,
            filters,
            shape,
            cursor,
            candidate: 0,
            step: 0,
        }
    }

    fn next_candidate(&mut self) -> Option<Vec<usize>> {
        let cursor = self.cursor.as_mut()?;
        let current = cursor.clone();
        if !increment_index(cursor, &self.shape) {
            self.cursor = None;
        }
        Some(current)
    }
}

impl Iterator for GeneratorIter<'_> {
    type Item = ScanResult<Position>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let indices = self.next_candidate()?;
            let candidate_index = self.candidate;
            self.candidate += 1;

            let position = Position::new(self.model.values_at(&indices), indices, self.step);
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
                    self.cursor = None;
                    return Some(Err(err));
                }
            }
        }
    }
}
