//! The frozen ring artifact handed to downstream consumers.
//!
//! A [`RingTable`] is a read-only view of the assignment table plus the
//! device records needed to resolve it, detached from the builder. The
//! builder caches the last derived table and invalidates the cache on any
//! structural mutation or restore.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::builder::RingBuilder;
use crate::device::{Device, DeviceId, DeviceTable};

/// A frozen `replica × partition → device` lookup table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingTable {
    part_shift: u32,
    rows: Vec<Vec<Option<DeviceId>>>,
    devs: DeviceTable,
}

impl RingTable {
    /// Bit shift mapping a 32-bit key hash to a partition number.
    #[must_use]
    pub fn part_shift(&self) -> u32 {
        self.part_shift
    }

    /// Number of replica rows. Zero until the builder has rebalanced.
    #[must_use]
    pub fn replica_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of partitions.
    #[must_use]
    pub fn part_count(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    /// Partition number for a 32-bit key hash.
    #[must_use]
    pub fn part_for_hash(&self, key_hash: u32) -> usize {
        (key_hash >> self.part_shift) as usize
    }

    /// The device holding `replica` of `part`, if assigned.
    #[must_use]
    pub fn device(&self, replica: usize, part: usize) -> Option<&Device> {
        self.rows.get(replica).and_then(|row| row.get(part)).copied().flatten().and_then(|id| self.devs.get(id))
    }

    /// All devices holding replicas of `part`.
    #[must_use]
    pub fn devices_for_part(&self, part: usize) -> Vec<&Device> {
        (0..self.replica_count()).filter_map(|replica| self.device(replica, part)).collect()
    }
}

impl RingBuilder {
    /// The current ring artifact, derived lazily and cached until the next
    /// structural mutation or restore.
    pub fn ring(&mut self) -> Arc<RingTable> {
        if let Some(ring) = &self.cached_ring {
            return Arc::clone(ring);
        }
        let ring = Arc::new(RingTable {
            part_shift: self.part_shift(),
            rows: self.assignment.rows().to_vec(),
            devs: self.devs.clone(),
        });
        self.cached_ring = Some(Arc::clone(&ring));
        ring
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use crate::device::DeviceSpec;
    use crate::params::RingParams;

    use super::*;

    fn spec(region: u32) -> DeviceSpec {
        DeviceSpec::new()
            .with_region(region)
            .with_zone(1)
            .with_ip("10.5.0.1".parse::<IpAddr>().unwrap())
            .with_port(6200)
            .with_device("sde1")
            .with_weight(1.0)
    }

    fn built_builder() -> RingBuilder {
        let mut builder = RingBuilder::new(RingParams::new(4, 3, 1).unwrap());
        for region in 1..=3 {
            builder.add_device(spec(region)).unwrap();
        }
        builder.rebalance(2).unwrap();
        builder
    }

    #[test]
    fn test_ring_resolves_devices() {
        let mut builder = built_builder();
        let ring = builder.ring();

        assert_eq!(ring.replica_count(), 3);
        assert_eq!(ring.part_count(), 16);
        assert_eq!(ring.part_shift(), 28);
        for part in 0..ring.part_count() {
            assert_eq!(ring.devices_for_part(part).len(), 3);
        }
    }

    #[test]
    fn test_part_for_hash_covers_the_ring() {
        let mut builder = built_builder();
        let ring = builder.ring();

        assert_eq!(ring.part_for_hash(0), 0);
        assert_eq!(ring.part_for_hash(u32::MAX), ring.part_count() - 1);
        // The shift maps contiguous hash ranges onto partitions in order.
        assert_eq!(ring.part_for_hash(1 << 28), 1);
    }

    #[test]
    fn test_ring_is_cached_until_mutation() {
        let mut builder = built_builder();
        let first = builder.ring();
        let second = builder.ring();
        assert!(Arc::ptr_eq(&first, &second));

        builder.set_weight(0, 2.0).unwrap();
        let third = builder.ring();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_ring_detached_from_builder() {
        let mut builder = built_builder();
        let ring = builder.ring();

        builder.remove_device(0).unwrap();
        builder.pretend_min_part_hours_passed();
        builder.rebalance(2).unwrap();

        // The old artifact still resolves the topology it was built from.
        assert!(ring.devices_for_part(0).len() == 3);
    }

    #[test]
    fn test_unbuilt_ring_is_empty() {
        let mut builder = RingBuilder::new(RingParams::new(4, 3, 1).unwrap());
        let ring = builder.ring();
        assert_eq!(ring.replica_count(), 0);
        assert_eq!(ring.part_count(), 0);
    }
}
