//! The gather/reassign rebalance engine.
//!
//! One invocation drives the assignment table toward the weight model's
//! targets while honoring the move ledger and failure-domain anti-affinity:
//!
//! 1. Compute each device's desired partition count (floor plus
//!    largest-remainder distribution, so targets sum exactly to
//!    `parts * replicas`).
//! 2. Gather movable assignments: structurally broken cells (unassigned, or
//!    referencing a hole or an unweighted device) are always collected;
//!    overweight devices shed ledger-eligible partitions down to target.
//! 3. Reassign most-constrained partitions first, preferring the most
//!    underweight device in an unused region, then relaxing to an unused
//!    zone, then to any device not already holding the partition.
//! 4. Repeat while the balance metric keeps improving; a ring that cannot be
//!    balanced further under its constraints terminates instead of looping.
//!
//! All tie-breaking flows through a caller-supplied seed, so identical
//! topology and seed reproduce an identical ring.

use std::collections::HashSet;

use chrono::Utc;
use metrics::{counter, gauge};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::assignment::AssignmentTable;
use crate::builder::RingBuilder;
use crate::device::{Device, DeviceId};
use crate::diag::DiagnosticEvent;
use crate::error::RingResult;

/// Residual balance below which the ring counts as converged, and the
/// minimum relative improvement a pass must deliver to keep iterating.
const CONVERGENCE_EPSILON: f64 = 0.01;

/// Hard cap on gather/reassign passes within one invocation.
const MAX_PASSES: usize = 64;

/// Summary of one rebalance invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RebalanceStats {
    /// Partition replicas relocated across all passes.
    pub parts_moved: usize,
    /// Final residual balance: the summed absolute skew as a fraction of
    /// total capacity. Zero is a perfectly balanced ring.
    pub balance: f64,
    /// Gather/reassign passes executed.
    pub passes: usize,
}

impl RingBuilder {
    /// Rebalance the ring.
    ///
    /// `seed` drives every tie-break; reruns with the same topology and seed
    /// produce identical assignment tables. Fails fast with an empty-ring
    /// error when no weighted device exists. A topologically imperfect ring
    /// (fewer regions or zones than replicas) degrades placement quality
    /// instead of failing. Stopping before full convergence is a legal
    /// terminal state, not an error.
    pub fn rebalance(&mut self, seed: u64) -> RingResult<RebalanceStats> {
        let weight_of_one_part = self.weight_of_one_part()?;
        self.ledger.begin_pass(Utc::now(), self.params.min_part_hours());
        info!(version = self.version, seed, "rebalance started");
        self.diag.emit(DiagnosticEvent::RebalanceStarted { version: self.version });

        let parts = self.parts();
        let replicas = self.replicas();
        if !self.assignment.is_initialized() {
            self.assignment = AssignmentTable::with_shape(replicas, parts);
        } else if self.assignment.replicas() != replicas {
            self.assignment.set_replica_count(replicas, parts);
        }

        let slots = self.devs.slot_len();
        let desired = self.desired_counts(weight_of_one_part);
        let mut assigned = self.assignment.assigned_counts(slots);
        let mut rng = StdRng::seed_from_u64(seed);
        let total_capacity = (parts * replicas) as f64;

        let mut stats = RebalanceStats {
            parts_moved: 0,
            balance: balance_of(&desired, &assigned, total_capacity),
            passes: 0,
        };
        let mut prev_balance = stats.balance;

        for pass in 1..=MAX_PASSES {
            let gathered = self.gather(&desired, &mut assigned, &mut rng);
            if gathered.is_empty() {
                break;
            }
            let moved = self.reassign(gathered, &desired, &mut assigned, &mut rng);
            let balance = balance_of(&desired, &assigned, total_capacity);
            stats.parts_moved += moved;
            stats.passes = pass;
            stats.balance = balance;
            debug!(pass, moved, balance, "rebalance pass complete");
            self.diag.emit(DiagnosticEvent::RebalancePass { pass, balance, parts_moved: moved });

            let improvement = prev_balance - balance;
            prev_balance = balance;
            if moved == 0
                || balance < CONVERGENCE_EPSILON
                || improvement <= prev_balance * CONVERGENCE_EPSILON
            {
                break;
            }
        }

        self.finalize_removals();
        self.dispersion = self.analyze_dispersion();
        self.devs_changed = false;
        self.version += 1;
        self.cached_ring = None;

        counter!("ringforge_rebalance_runs").increment(1);
        counter!("ringforge_rebalance_parts_moved").increment(stats.parts_moved as u64);
        gauge!("ringforge_ring_balance").set(stats.balance);
        info!(
            parts_moved = stats.parts_moved,
            balance = stats.balance,
            passes = stats.passes,
            "rebalance complete"
        );
        self.diag.emit(DiagnosticEvent::RebalanceFinished {
            parts_moved: stats.parts_moved,
            balance: stats.balance,
        });
        Ok(stats)
    }

    /// Integer desired partition counts per device slot.
    ///
    /// Floors the fractional targets, then hands the remaining slots to the
    /// devices with the largest fractional remainders (ties to the lower
    /// id), so the targets sum exactly to `parts * replicas`.
    fn desired_counts(&self, weight_of_one_part: f64) -> Vec<usize> {
        let mut desired = vec![0usize; self.devs.slot_len()];
        let mut fractions: Vec<(usize, f64)> = Vec::new();
        let mut floor_sum = 0usize;

        for (idx, dev) in self.devs.iter() {
            if !dev.is_active() {
                continue;
            }
            let want = dev.weight * weight_of_one_part;
            let floor = want.floor() as usize;
            desired[idx] = floor;
            floor_sum += floor;
            fractions.push((idx, want - want.floor()));
        }
        if fractions.is_empty() {
            return desired;
        }

        fractions.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut remainder = (self.parts() * self.replicas()).saturating_sub(floor_sum);
        let mut next = 0usize;
        while remainder > 0 {
            desired[fractions[next % fractions.len()].0] += 1;
            next += 1;
            remainder -= 1;
        }
        desired
    }

    /// Collect the `(partition, replica)` assignments eligible to move.
    fn gather(
        &mut self,
        desired: &[usize],
        assigned: &mut [usize],
        rng: &mut StdRng,
    ) -> Vec<(usize, usize)> {
        let parts = self.parts();
        let replicas = self.assignment.replicas();
        let min_hours = self.params.min_part_hours();
        let mut gathered = Vec::new();

        // Structural repair ignores the move-hours gate: unassigned cells
        // and cells referencing a hole or an unweighted device.
        for part in 0..parts {
            for replica in 0..replicas {
                let cell = self.assignment.get(replica, part);
                let broken = match cell {
                    None => true,
                    Some(dev) => self.devs.get(dev).map_or(true, |d| !d.is_active()),
                };
                if !broken {
                    continue;
                }
                if let Some(dev) = cell {
                    if let Some(count) = assigned.get_mut(dev as usize) {
                        *count = count.saturating_sub(1);
                    }
                    self.assignment.set(replica, part, None);
                }
                self.ledger.mark_moved(part);
                gathered.push((part, replica));
            }
        }

        // Overweight devices shed ledger-eligible partitions, visited in
        // seeded order so no partition range is systematically favored.
        let mut order: Vec<usize> = (0..parts).collect();
        order.shuffle(rng);
        for part in order {
            if !self.ledger.can_move(part, min_hours) {
                continue;
            }
            for replica in 0..replicas {
                let Some(dev) = self.assignment.get(replica, part) else {
                    continue;
                };
                let idx = dev as usize;
                if assigned[idx] > desired[idx] {
                    assigned[idx] -= 1;
                    self.assignment.set(replica, part, None);
                    self.ledger.mark_moved(part);
                    gathered.push((part, replica));
                    break;
                }
            }
        }
        gathered
    }

    /// Place every gathered assignment, most constrained partitions first.
    fn reassign(
        &mut self,
        gathered: Vec<(usize, usize)>,
        desired: &[usize],
        assigned: &mut [usize],
        rng: &mut StdRng,
    ) -> usize {
        let mut keyed: Vec<(usize, u64, usize, usize)> = gathered
            .into_iter()
            .map(|(part, replica)| {
                (self.placement_options(part, desired, assigned), rng.gen::<u64>(), part, replica)
            })
            .collect();
        keyed.sort_unstable();

        let mut moved = 0;
        for (_, _, part, replica) in keyed {
            match self.choose_target(part, desired, assigned, rng) {
                Some(dev) => {
                    self.assignment.set(replica, part, Some(dev));
                    assigned[dev as usize] += 1;
                    moved += 1;
                }
                None => {
                    debug!(part, replica, "no placement candidate, cell left unassigned");
                }
            }
        }
        moved
    }

    /// Number of first-tier placement candidates for a partition, used to
    /// order reassignment.
    fn placement_options(&self, part: usize, desired: &[usize], assigned: &[usize]) -> usize {
        let existing_ids: HashSet<DeviceId> = self.assignment.devices_of_part(part).collect();
        let existing_regions: HashSet<u32> =
            existing_ids.iter().filter_map(|id| self.devs.get(*id)).map(|d| d.region).collect();

        self.devs
            .iter()
            .filter(|&(idx, d)| {
                d.is_active()
                    && !existing_ids.contains(&d.id)
                    && !existing_regions.contains(&d.region)
                    && desired[idx] > assigned[idx]
            })
            .count()
    }

    /// Pick a target device for one replica of `part`.
    ///
    /// Tier one wants an underweight device in a region no other replica of
    /// the partition uses. Tier two admits a shared region if the zone
    /// differs, with the overload factor granting intake headroom past the
    /// desired count. Tier three takes any device not already holding the
    /// partition. Within a tier the most underweight candidate wins; ties go
    /// to a seeded pick.
    fn choose_target(
        &self,
        part: usize,
        desired: &[usize],
        assigned: &[usize],
        rng: &mut StdRng,
    ) -> Option<DeviceId> {
        let existing_ids: HashSet<DeviceId> = self.assignment.devices_of_part(part).collect();
        let existing_devs: Vec<&Device> =
            existing_ids.iter().filter_map(|id| self.devs.get(*id)).collect();
        let existing_regions: HashSet<u32> = existing_devs.iter().map(|d| d.region).collect();
        let existing_zones: HashSet<(u32, u32)> =
            existing_devs.iter().map(|d| (d.region, d.zone)).collect();

        if let Some(dev) = self.pick_most_underweight(desired, assigned, rng, |idx, d| {
            !existing_ids.contains(&d.id)
                && !existing_regions.contains(&d.region)
                && desired[idx] > assigned[idx]
        }) {
            return Some(dev);
        }

        let overload = self.overload;
        if let Some(dev) = self.pick_most_underweight(desired, assigned, rng, |idx, d| {
            let headroom = desired[idx] + (desired[idx] as f64 * overload).ceil() as usize;
            !existing_ids.contains(&d.id)
                && !existing_zones.contains(&(d.region, d.zone))
                && assigned[idx] < headroom.max(desired[idx])
        }) {
            return Some(dev);
        }

        self.pick_most_underweight(desired, assigned, rng, |_, d| !existing_ids.contains(&d.id))
    }

    /// Most underweight active device passing `eligible`; seeded tie-break.
    fn pick_most_underweight<F>(
        &self,
        desired: &[usize],
        assigned: &[usize],
        rng: &mut StdRng,
        eligible: F,
    ) -> Option<DeviceId>
    where
        F: Fn(usize, &Device) -> bool,
    {
        let mut best: Vec<DeviceId> = Vec::new();
        let mut best_skew = isize::MIN;
        for (idx, dev) in self.devs.iter() {
            if !dev.is_active() || !eligible(idx, dev) {
                continue;
            }
            let skew = desired[idx] as isize - assigned[idx] as isize;
            if skew > best_skew {
                best_skew = skew;
                best.clear();
                best.push(dev.id);
            } else if skew == best_skew {
                best.push(dev.id);
            }
        }
        best.choose(rng).copied()
    }

    /// Complete pending removals: their partitions were reassigned above, so
    /// the slots become reusable holes and the removal list drains.
    fn finalize_removals(&mut self) {
        for dev in std::mem::take(&mut self.remove_devs) {
            debug!(device = dev.id, "removal finalized, slot freed");
            self.devs.clear_slot(dev.id);
        }
    }
}

/// Summed absolute skew as a fraction of total capacity.
fn balance_of(desired: &[usize], assigned: &[usize], total_capacity: f64) -> f64 {
    let skew: f64 = desired
        .iter()
        .zip(assigned.iter())
        .map(|(&d, &a)| (d as f64 - a as f64).abs())
        .sum();
    skew / total_capacity
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
            .with_ip("10.2.0.1".parse::<IpAddr>().unwrap())
            .with_port(6200)
            .with_device("sdb1")
            .with_weight(weight)
    }

    fn builder_with_devices(devices: &[(u32, u32, f64)]) -> RingBuilder {
        let mut builder = RingBuilder::new(RingParams::new(6, 3, 1).unwrap());
        for &(region, zone, weight) in devices {
            builder.add_device(spec(region, zone, weight)).unwrap();
        }
        builder
    }

    fn assert_no_duplicate_devices(builder: &RingBuilder) {
        for part in 0..builder.parts() {
            let devs: Vec<DeviceId> = builder.assignment().devices_of_part(part).collect();
            let unique: HashSet<DeviceId> = devs.iter().copied().collect();
            assert_eq!(devs.len(), unique.len(), "partition {part} has duplicate devices");
        }
    }

    #[test]
    fn test_initial_rebalance_assigns_every_cell() {
        let mut builder =
            builder_with_devices(&[(1, 1, 1.0), (2, 1, 1.0), (3, 1, 1.0), (1, 2, 1.0)]);
        let stats = builder.rebalance(0).unwrap();

        assert!(builder.ever_rebalanced());
        assert_eq!(stats.parts_moved, builder.parts() * builder.replicas());
        for part in 0..builder.parts() {
            assert_eq!(builder.assignment().devices_of_part(part).count(), 3);
        }
        assert_no_duplicate_devices(&builder);
    }

    #[test]
    fn test_region_anti_affinity_with_enough_regions() {
        let mut builder =
            builder_with_devices(&[(1, 1, 1.0), (2, 1, 1.0), (3, 1, 1.0), (4, 1, 1.0)]);
        builder.rebalance(7).unwrap();

        for part in 0..builder.parts() {
            let regions: HashSet<u32> = builder
                .assignment()
                .devices_of_part(part)
                .map(|id| builder.device(id).unwrap().region)
                .collect();
            assert_eq!(regions.len(), 3, "partition {part} shares a region");
        }
    }

    #[test]
    fn test_forced_uniform_when_devices_equal_replicas() {
        // Three devices, three replicas: the no-duplicate rule forces one
        // replica of every partition onto each device, whatever the weights.
        let mut builder = builder_with_devices(&[(1, 1, 1.0), (1, 2, 2.0), (1, 3, 3.0)]);
        builder.rebalance(3).unwrap();

        let counts = builder.assignment().assigned_counts(builder.devs.slot_len());
        assert_eq!(counts, vec![64, 64, 64]);
        assert_no_duplicate_devices(&builder);
    }

    #[test]
    fn test_second_rebalance_moves_nothing() {
        // Equal weights across three distinct regions converge exactly on
        // the first run, so a second run with the cooldown fully lifted
        // still has nothing to gather.
        let mut builder = builder_with_devices(&[(1, 1, 1.0), (2, 1, 1.0), (3, 1, 1.0)]);
        builder.rebalance(11).unwrap();

        builder.pretend_min_part_hours_passed();
        let stats = builder.rebalance(11).unwrap();
        assert_eq!(stats.parts_moved, 0);
    }

    #[test]
    fn test_seeded_rebalance_is_reproducible() {
        let devices = [(1, 1, 1.0), (2, 1, 2.0), (3, 1, 1.0), (1, 2, 2.0), (2, 2, 1.0)];
        let mut a = builder_with_devices(&devices);
        let mut b = builder_with_devices(&devices);

        a.rebalance(42).unwrap();
        b.rebalance(42).unwrap();
        assert_eq!(a.assignment(), b.assignment());

        let mut c = builder_with_devices(&devices);
        c.rebalance(43).unwrap();
        // A different seed is allowed to produce a different ring.
        let _ = c.assignment();
    }

    #[test]
    fn test_cooldown_blocks_weight_driven_moves() {
        let mut builder =
            builder_with_devices(&[(1, 1, 1.0), (2, 1, 1.0), (3, 1, 1.0), (4, 1, 1.0)]);
        builder.rebalance(5).unwrap();

        // Shift weight immediately; every partition just moved, so nothing
        // is eligible and the table must not change.
        builder.set_weight(0, 4.0).unwrap();
        let before = builder.assignment().clone();
        let stats = builder.rebalance(5).unwrap();
        assert_eq!(stats.parts_moved, 0);
        assert_eq!(builder.assignment(), &before);

        // After the cooldown the ring converges toward the new weights.
        builder.pretend_min_part_hours_passed();
        let stats = builder.rebalance(5).unwrap();
        assert!(stats.parts_moved > 0);
        let counts = builder.assignment().assigned_counts(builder.devs.slot_len());
        assert!(counts[0] > counts[1]);
    }

    #[test]
    fn test_removed_device_holds_nothing_after_rebalance() {
        let mut builder =
            builder_with_devices(&[(1, 1, 1.0), (2, 1, 1.0), (3, 1, 1.0), (4, 1, 1.0)]);
        builder.rebalance(1).unwrap();

        builder.remove_device(2).unwrap();
        builder.pretend_min_part_hours_passed();
        builder.rebalance(1).unwrap();

        let counts = builder.assignment().assigned_counts(builder.devs.slot_len());
        assert_eq!(counts[2], 0);
        // The slot is a hole now and the removal list has drained.
        assert!(builder.device(2).is_none());
        assert!(builder.pending_removals().is_empty());
        assert_no_duplicate_devices(&builder);

        // The freed slot is the next automatic id.
        let id = builder.add_device(spec(2, 1, 1.0)).unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn test_rebalance_empty_ring_fails_fast() {
        let mut builder = RingBuilder::new(RingParams::new(4, 2, 1).unwrap());
        assert!(matches!(builder.rebalance(0).unwrap_err(), crate::RingError::EmptyRing));
        assert!(!builder.ever_rebalanced());
    }

    #[test]
    fn test_fewer_devices_than_replicas_leaves_cells_unassigned() {
        let mut builder = builder_with_devices(&[(1, 1, 1.0), (2, 1, 1.0)]);
        builder.rebalance(0).unwrap();

        for part in 0..builder.parts() {
            assert_eq!(builder.assignment().devices_of_part(part).count(), 2);
        }
        assert_no_duplicate_devices(&builder);
    }

    #[test]
    fn test_single_zone_ring_still_builds() {
        let mut builder = builder_with_devices(&[(1, 1, 1.0), (1, 1, 1.0), (1, 1, 1.0)]);
        builder.rebalance(9).unwrap();

        for part in 0..builder.parts() {
            assert_eq!(builder.assignment().devices_of_part(part).count(), 3);
        }
        assert_no_duplicate_devices(&builder);
    }

    #[test]
    fn test_desired_counts_sum_to_capacity() {
        let mut builder = builder_with_devices(&[(1, 1, 1.3), (2, 1, 2.7), (3, 1, 0.9)]);
        let wopp = builder.weight_of_one_part().unwrap();
        let desired = builder.desired_counts(wopp);
        assert_eq!(desired.iter().sum::<usize>(), builder.parts() * builder.replicas());

        // Weight-zero devices get no target.
        builder.set_weight(2, 0.0).unwrap();
        let wopp = builder.weight_of_one_part().unwrap();
        let desired = builder.desired_counts(wopp);
        assert_eq!(desired[2], 0);
        assert_eq!(desired.iter().sum::<usize>(), builder.parts() * builder.replicas());
    }

    #[test]
    fn test_version_and_flags_after_rebalance() {
        let mut builder = builder_with_devices(&[(1, 1, 1.0), (2, 1, 1.0), (3, 1, 1.0)]);
        assert!(builder.devs_changed());
        let version = builder.version();

        builder.rebalance(0).unwrap();
        assert!(!builder.devs_changed());
        assert_eq!(builder.version(), version + 1);
    }
}
