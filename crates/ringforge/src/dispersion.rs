//! Ring-quality analysis: replica co-location statistics.
//!
//! Walks the assignment table and reports, per failure-domain tier, how many
//! replicas land under each node, plus a single scalar: the fraction of
//! partitions whose replicas share a region or zone even though enough
//! distinct domains existed to avoid it. Sharing forced by the topology
//! (fewer domains than replicas) is not counted. Pure read; safe to call at
//! any time, including mid-build.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::builder::RingBuilder;
use crate::device::DeviceId;

/// Key of one failure-domain tier node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TierKey {
    /// A region.
    Region {
        /// The region number.
        region: u32,
    },
    /// A zone within a region.
    Zone {
        /// The enclosing region.
        region: u32,
        /// The zone number.
        zone: u32,
    },
    /// A single device.
    Device {
        /// The device id.
        id: DeviceId,
    },
}

/// Replica placement statistics for one tier node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierStats {
    /// The tier node these counts describe.
    pub key: TierKey,
    /// Total replicas placed under this node.
    pub replicas: u64,
    /// Partitions with more than one replica under this node.
    pub parts_with_multiple: u64,
}

/// Result of a dispersion analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispersionReport {
    /// Fraction of partitions with avoidable replica co-location.
    pub fraction: f64,
    /// Per-tier placement statistics, ordered by tier key.
    pub tiers: Vec<TierStats>,
}

impl RingBuilder {
    /// Analyze replica dispersion over the current assignment table.
    #[must_use]
    pub fn analyze_dispersion(&self) -> DispersionReport {
        if !self.assignment.is_initialized() {
            return DispersionReport::default();
        }

        let active_regions: HashSet<u32> =
            self.devs.iter().filter(|(_, d)| d.is_active()).map(|(_, d)| d.region).collect();
        let active_zones: HashSet<(u32, u32)> = self
            .devs
            .iter()
            .filter(|(_, d)| d.is_active())
            .map(|(_, d)| (d.region, d.zone))
            .collect();

        let parts = self.assignment.parts();
        let mut accum: BTreeMap<TierKey, (u64, u64)> = BTreeMap::new();
        let mut colocated = 0usize;

        for part in 0..parts {
            let mut region_counts: BTreeMap<u32, u64> = BTreeMap::new();
            let mut zone_counts: BTreeMap<(u32, u32), u64> = BTreeMap::new();
            let mut placed = 0u64;

            for id in self.assignment.devices_of_part(part) {
                let Some(dev) = self.devs.get(id) else {
                    continue;
                };
                placed += 1;
                *region_counts.entry(dev.region).or_default() += 1;
                *zone_counts.entry((dev.region, dev.zone)).or_default() += 1;
                let entry = accum.entry(TierKey::Device { id }).or_default();
                entry.0 += 1;
            }

            for (region, count) in &region_counts {
                let entry = accum.entry(TierKey::Region { region: *region }).or_default();
                entry.0 += count;
                if *count > 1 {
                    entry.1 += 1;
                }
            }
            for ((region, zone), count) in &zone_counts {
                let entry =
                    accum.entry(TierKey::Zone { region: *region, zone: *zone }).or_default();
                entry.0 += count;
                if *count > 1 {
                    entry.1 += 1;
                }
            }

            let placed_usize = placed as usize;
            let region_sharing =
                active_regions.len() >= placed_usize && (region_counts.len() as u64) < placed;
            let zone_sharing =
                active_zones.len() >= placed_usize && (zone_counts.len() as u64) < placed;
            if placed > 0 && (region_sharing || zone_sharing) {
                colocated += 1;
            }
        }

        DispersionReport {
            fraction: if parts == 0 { 0.0 } else { colocated as f64 / parts as f64 },
            tiers: accum
                .into_iter()
                .map(|(key, (replicas, parts_with_multiple))| TierStats {
                    key,
                    replicas,
                    parts_with_multiple,
                })
                .collect(),
        }
    }

    /// The dispersion report computed by the last rebalance.
    #[must_use]
    pub fn dispersion(&self) -> &DispersionReport {
        &self.dispersion
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use crate::device::DeviceSpec;
    use crate::params::RingParams;

    use super::*;

    fn spec(region: u32, zone: u32, weight: f64) -> DeviceSpec {
        DeviceSpec::new()
            .with_region(region)
            .with_zone(zone)
            .with_ip("10.3.0.1".parse::<IpAddr>().unwrap())
            .with_port(6200)
            .with_device("sdc1")
            .with_weight(weight)
    }

    #[test]
    fn test_unbuilt_ring_reports_nothing() {
        let builder = RingBuilder::new(RingParams::new(4, 3, 1).unwrap());
        let report = builder.analyze_dispersion();
        assert_eq!(report.fraction, 0.0);
        assert!(report.tiers.is_empty());
    }

    #[test]
    fn test_fully_dispersed_ring() {
        let mut builder = RingBuilder::new(RingParams::new(4, 3, 1).unwrap());
        for region in 1..=3 {
            builder.add_device(spec(region, 1, 1.0)).unwrap();
        }
        builder.rebalance(0).unwrap();

        let report = builder.analyze_dispersion();
        assert_eq!(report.fraction, 0.0);
        // Each region holds one replica of each of the 16 partitions.
        let region_totals: Vec<u64> = report
            .tiers
            .iter()
            .filter(|t| matches!(t.key, TierKey::Region { .. }))
            .map(|t| t.replicas)
            .collect();
        assert_eq!(region_totals, vec![16, 16, 16]);
    }

    #[test]
    fn test_forced_sharing_is_not_counted() {
        // One region, two zones, three replicas: sharing is unavoidable.
        let mut builder = RingBuilder::new(RingParams::new(4, 3, 1).unwrap());
        builder.add_device(spec(1, 1, 1.0)).unwrap();
        builder.add_device(spec(1, 1, 1.0)).unwrap();
        builder.add_device(spec(1, 2, 1.0)).unwrap();
        builder.rebalance(0).unwrap();

        let report = builder.analyze_dispersion();
        assert_eq!(report.fraction, 0.0);

        let zone_one = report
            .tiers
            .iter()
            .find(|t| t.key == TierKey::Zone { region: 1, zone: 1 })
            .unwrap();
        assert_eq!(zone_one.replicas, 32);
        assert_eq!(zone_one.parts_with_multiple, 16);
    }

    #[test]
    fn test_topology_growth_exposes_avoidable_sharing() {
        let mut builder = RingBuilder::new(RingParams::new(6, 3, 1).unwrap());
        builder.add_device(spec(1, 1, 1.0)).unwrap();
        builder.add_device(spec(1, 1, 1.0)).unwrap();
        builder.add_device(spec(1, 2, 1.0)).unwrap();
        builder.rebalance(0).unwrap();
        assert_eq!(builder.analyze_dispersion().fraction, 0.0);

        // A third zone appears; the old placement is now avoidably
        // co-located everywhere.
        builder.add_device(spec(1, 3, 1.0)).unwrap();
        let before = builder.analyze_dispersion().fraction;
        assert_eq!(before, 1.0);

        builder.pretend_min_part_hours_passed();
        builder.rebalance(0).unwrap();
        let after = builder.dispersion().fraction;
        assert!(after < before, "rebalance should reduce dispersion: {after} vs {before}");
    }

    #[test]
    fn test_stored_report_matches_fresh_analysis() {
        let mut builder = RingBuilder::new(RingParams::new(4, 2, 1).unwrap());
        builder.add_device(spec(1, 1, 1.0)).unwrap();
        builder.add_device(spec(2, 1, 1.0)).unwrap();
        builder.rebalance(8).unwrap();

        assert_eq!(builder.dispersion(), &builder.analyze_dispersion());
    }
}
