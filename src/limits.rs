//! Shared hard limits to prevent unbounded trajectories.

use crate::error::ScanError;

/// Maximum number of points a single generator may describe.
pub const MAX_POINTS: usize = 10_000_000;
/// Maximum supported rank of a (compound) generator.
pub const MAX_RANK: usize = 16;

/// Multiply dimension lengths into a point count, rejecting overflow and
/// trajectories above [`MAX_POINTS`].
pub fn checked_point_count(shape: &[usize]) -> Result<usize, ScanError> {
    if shape.len() > MAX_RANK {
        return Err(ScanError::LimitExceeded {
            what: "scan rank",
            limit: MAX_RANK,
        });
    }

    let count = shape.iter().try_fold(1usize, |acc, &len| {
        acc.checked_mul(len).ok_or(ScanError::SizeOverflow {
            context: "scan point count",
        })
    })?;

    if count > MAX_POINTS {
        return Err(ScanError::LimitExceeded {
            what: "scan point count",
            limit: MAX_POINTS,
        });
    }

    Ok(count)
}
