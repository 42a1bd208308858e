use std::sync::Arc;

use daq_scanning::points::{
    slice_from, ArrayModel, BoundingBox, BoundingLine, CircularRegion, CompoundGenerator,
    Generator, GridModel, LineStepModel, PointGenerator, Position, PredicateFilter, StepModel,
};
use daq_scanning::ScanError;

fn step(name: &str, start: f64, stop: f64, step: f64) -> Generator {
    Generator::new(Box::new(StepModel::new(name, start, stop, step))).unwrap()
}

fn grid(snake: bool) -> Generator {
    Generator::new(Box::new(GridModel {
        fast_axis: "x".into(),
        slow_axis: "y".into(),
        bounding_box: BoundingBox {
            fast_start: 0.0,
            slow_start: 0.0,
            fast_length: 3.0,
            slow_length: 2.0,
        },
        fast_points: 3,
        slow_points: 2,
        snake,
    }))
    .unwrap()
}

fn values(points: &[Position], axis: &str) -> Vec<f64> {
    points.iter().filter_map(|p| p.get_f64(axis)).collect()
}

#[test]
fn test_size_matches_enumeration_for_every_model() {
    let line = Generator::new(Box::new(LineStepModel {
        x_axis: "x".into(),
        y_axis: "y".into(),
        line: BoundingLine {
            x_start: 0.0,
            y_start: 0.0,
            length: 5.0,
            angle: 0.0,
        },
        step: 1.0,
    }))
    .unwrap();
    let generators: Vec<Box<dyn PointGenerator>> = vec![
        Box::new(step("x", 0.0, 1.0, 0.1)),
        Box::new(step("x", 5.0, -5.0, 2.5)),
        Box::new(Generator::new(Box::new(ArrayModel::new("x", vec![3.0, 1.0, 2.0]))).unwrap()),
        Box::new(line),
        Box::new(grid(true)),
    ];
    for generator in &generators {
        let count = generator.materialize().unwrap().len();
        assert_eq!(generator.size().unwrap(), count, "{}", generator.name());
        let product: usize = generator.shape().unwrap().iter().product();
        assert_eq!(product, count, "{}", generator.name());
    }
}

#[test]
fn test_reverse_direction_step() {
    let points = step("x", 5.0, -5.0, 2.5).materialize().unwrap();
    assert_eq!(values(&points, "x"), vec![5.0, 2.5, 0.0, -2.5, -5.0]);
}

#[test]
fn test_compound_shape_and_size_are_concatenation_and_product() {
    let scan = CompoundGenerator::new(
        "cube",
        vec![step("z", 0.0, 1.0, 1.0), grid(false), step("t", 0.0, 3.0, 1.0)],
    )
    .unwrap();
    assert_eq!(scan.shape().unwrap(), vec![2, 2, 3, 4]);
    assert_eq!(scan.rank().unwrap(), 4);
    assert_eq!(scan.size().unwrap(), 48);
    assert_eq!(scan.materialize().unwrap().len(), 48);
}

#[test]
fn test_fresh_iterators_are_deterministic() {
    let scan =
        CompoundGenerator::new("stack", vec![step("z", 0.0, 2.0, 1.0), grid(true)]).unwrap();
    let first = scan.materialize().unwrap();
    let second = scan.materialize().unwrap();
    assert_eq!(first, second);

    let steps: Vec<usize> = first.iter().map(Position::step_index).collect();
    assert_eq!(steps, (0..first.len()).collect::<Vec<_>>());
}

#[test]
fn test_snake_reverses_odd_rows() {
    let points = grid(true).materialize().unwrap();
    assert_eq!(values(&points, "x"), vec![0.5, 1.5, 2.5, 2.5, 1.5, 0.5]);
    assert_eq!(values(&points, "y"), vec![0.5, 0.5, 0.5, 1.5, 1.5, 1.5]);
    assert_eq!(points[4].indices(), &[1, 1]);
}

#[test]
fn test_every_other_filter_halves_materialized_length() {
    let plain = step("x", 0.0, 19.0, 1.0);
    let filtered = step("x", 0.0, 19.0, 1.0).with_filter(Arc::new(PredicateFilter::new(
        "every-other",
        |_, candidate| Ok(candidate % 2 == 1),
    )));

    let unfiltered = plain.materialize().unwrap().len();
    let points = filtered.materialize().unwrap();
    assert_eq!(points.len() * 2, unfiltered);
    assert_eq!(filtered.size().unwrap(), points.len());
    assert_eq!(values(&points, "x")[..3], [1.0, 3.0, 5.0]);
}

#[test]
fn test_circular_region_on_compound() {
    let scan = CompoundGenerator::new(
        "disc",
        vec![step("y", -2.0, 2.0, 1.0), step("x", -2.0, 2.0, 1.0)],
    )
    .unwrap()
    .with_filter(Arc::new(CircularRegion {
        name: "disc".into(),
        x_axis: "x".into(),
        y_axis: "y".into(),
        x_centre: 0.0,
        y_centre: 0.0,
        radius: 1.0,
    }));

    let points = scan.materialize().unwrap();
    assert_eq!(points.len(), 5);
    assert_eq!(scan.shape().unwrap(), vec![5]);
    for (i, p) in points.iter().enumerate() {
        let (x, y) = (p.get_f64("x").unwrap(), p.get_f64("y").unwrap());
        assert!(x * x + y * y <= 1.0);
        assert_eq!(p.step_index(), i);
    }
}

#[test]
fn test_invalid_models_never_generate() {
    let bad_grid = Generator::new(Box::new(GridModel {
        fast_axis: "x".into(),
        slow_axis: "x".into(),
        bounding_box: BoundingBox {
            fast_start: 0.0,
            slow_start: 0.0,
            fast_length: 1.0,
            slow_length: 1.0,
        },
        fast_points: 2,
        slow_points: 2,
        snake: false,
    }));
    assert!(matches!(bad_grid, Err(ScanError::Validation { .. })));

    let nan = Generator::new(Box::new(StepModel::new("x", f64::NAN, 1.0, 0.5)));
    assert!(matches!(nan, Err(ScanError::Validation { .. })));

    let empty = Generator::new(Box::new(ArrayModel::new("x", vec![])));
    assert!(matches!(empty, Err(ScanError::Validation { .. })));
}

#[test]
fn test_slice_from_addresses_row_major_element() {
    let scan = CompoundGenerator::new(
        "raster",
        vec![step("y", 0.0, 2.0, 1.0), step("x", 0.0, 3.0, 1.0)],
    )
    .unwrap();
    let shape = scan.shape().unwrap();
    assert_eq!(shape, vec![3, 4]);

    let slice = slice_from(&shape, 5).unwrap();
    assert_eq!(slice.stop(), &shape[..]);

    let fifth = scan.positions().unwrap().nth(5).unwrap().unwrap();
    assert_eq!(fifth.indices(), slice.start());
    assert_eq!(fifth.get_f64("y"), Some(1.0));
    assert_eq!(fifth.get_f64("x"), Some(1.0));
}
