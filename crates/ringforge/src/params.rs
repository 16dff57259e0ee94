//! Construction-time ring parameters.

use serde::{Deserialize, Serialize};

use crate::error::{RingError, RingResult};

/// Highest permitted partition power (a ring of 2^32 partitions).
pub const MAX_PART_POWER: u32 = 32;

/// Immutable construction-time configuration for a ring builder.
///
/// A ring has `2^part_power` partitions, each stored `replicas` times.
/// `min_part_hours` is the minimum number of hours that must elapse before a
/// given partition may be relocated again; it bounds data movement after a
/// topology edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingParams {
    part_power: u32,
    replicas: usize,
    min_part_hours: u8,
}

impl RingParams {
    /// Validate and build a parameter set.
    ///
    /// Fails with a parameter-validation error naming the parameter when
    /// `part_power` is outside `1..=32` or `replicas` is zero.
    pub fn new(part_power: u32, replicas: usize, min_part_hours: u8) -> RingResult<Self> {
        if !(1..=MAX_PART_POWER).contains(&part_power) {
            return Err(RingError::InvalidParameter {
                parameter: "part_power",
                reason: format!("must be between 1 and {MAX_PART_POWER}, got {part_power}"),
            });
        }
        if replicas < 1 {
            return Err(RingError::InvalidParameter {
                parameter: "replicas",
                reason: format!("must be at least 1, got {replicas}"),
            });
        }
        Ok(Self { part_power, replicas, min_part_hours })
    }

    /// The partition power.
    #[must_use]
    pub fn part_power(&self) -> u32 {
        self.part_power
    }

    /// Replica count per partition.
    #[must_use]
    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Minimum hours between relocations of one partition.
    #[must_use]
    pub fn min_part_hours(&self) -> u8 {
        self.min_part_hours
    }

    /// Total number of partitions in the ring.
    #[must_use]
    pub fn parts(&self) -> usize {
        1usize << self.part_power
    }

    /// Bit shift that maps a 32-bit key hash to a partition number.
    #[must_use]
    pub fn part_shift(&self) -> u32 {
        32 - self.part_power
    }

    pub(crate) fn set_min_part_hours(&mut self, hours: u8) {
        self.min_part_hours = hours;
    }

    pub(crate) fn set_replicas(&mut self, replicas: usize) {
        self.replicas = replicas;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_params() {
        let params = RingParams::new(10, 3, 1).unwrap();
        assert_eq!(params.parts(), 1024);
        assert_eq!(params.part_shift(), 22);
        assert_eq!(params.replicas(), 3);
        assert_eq!(params.min_part_hours(), 1);
    }

    #[test]
    fn test_part_power_out_of_range() {
        let err = RingParams::new(0, 3, 1).unwrap_err();
        assert!(matches!(err, RingError::InvalidParameter { parameter: "part_power", .. }));

        let err = RingParams::new(33, 3, 1).unwrap_err();
        assert!(matches!(err, RingError::InvalidParameter { parameter: "part_power", .. }));
    }

    #[test]
    fn test_zero_replicas_rejected() {
        let err = RingParams::new(10, 0, 1).unwrap_err();
        assert!(matches!(err, RingError::InvalidParameter { parameter: "replicas", .. }));
    }

    #[test]
    fn test_smallest_ring() {
        let params = RingParams::new(1, 1, 0).unwrap();
        assert_eq!(params.parts(), 2);
        assert_eq!(params.part_shift(), 31);
    }
}
