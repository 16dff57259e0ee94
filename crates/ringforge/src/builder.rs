//! The ring builder: device registry, weight model, and state flags.
//!
//! A builder is a single-writer structure. Registry mutation, rebalancing
//! and snapshot/restore must be externally serialized; the only operation
//! safe to race with them is swapping the diagnostics sink, which lives
//! behind its own lock in [`crate::diag`].

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::assignment::AssignmentTable;
use crate::device::{Device, DeviceId, DeviceSpec, DeviceTable};
use crate::diag::{DiagHandle, DiagnosticEvent, DiagnosticSink};
use crate::dispersion::DispersionReport;
use crate::error::{RingError, RingResult};
use crate::ledger::MoveLedger;
use crate::params::RingParams;
use crate::ring::RingTable;

/// Builds and maintains the partition-to-device ring.
#[derive(Debug)]
pub struct RingBuilder {
    pub(crate) params: RingParams,
    pub(crate) devs: DeviceTable,
    pub(crate) remove_devs: Vec<Device>,
    pub(crate) assignment: AssignmentTable,
    pub(crate) ledger: MoveLedger,
    pub(crate) dispersion: DispersionReport,
    pub(crate) overload: f64,
    pub(crate) version: u64,
    pub(crate) devs_changed: bool,
    pub(crate) id: Option<Uuid>,
    pub(crate) cached_ring: Option<std::sync::Arc<RingTable>>,
    pub(crate) diag: DiagHandle,
}

impl RingBuilder {
    /// Create a builder with an empty device registry.
    #[must_use]
    pub fn new(params: RingParams) -> Self {
        let parts = params.parts();
        Self {
            params,
            devs: DeviceTable::new(),
            remove_devs: Vec::new(),
            assignment: AssignmentTable::empty(),
            ledger: MoveLedger::new(parts, Utc::now()),
            dispersion: DispersionReport::default(),
            overload: 0.0,
            version: 0,
            devs_changed: false,
            id: None,
            cached_ring: None,
            diag: DiagHandle::default(),
        }
    }

    /// The construction-time parameters.
    #[must_use]
    pub fn params(&self) -> &RingParams {
        &self.params
    }

    /// Total number of partitions.
    #[must_use]
    pub fn parts(&self) -> usize {
        self.params.parts()
    }

    /// Replica count per partition.
    #[must_use]
    pub fn replicas(&self) -> usize {
        self.params.replicas()
    }

    /// Bit shift mapping a 32-bit key hash to a partition number.
    #[must_use]
    pub fn part_shift(&self) -> u32 {
        self.params.part_shift()
    }

    /// Monotonic counter incremented by every successful structural
    /// mutation.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether device state changed since the flag was last reset.
    #[must_use]
    pub fn devs_changed(&self) -> bool {
        self.devs_changed
    }

    /// Reset the pending-changes flag after consuming it.
    pub fn reset_devs_changed(&mut self) {
        self.devs_changed = false;
    }

    /// Whether a rebalance has ever produced an assignment table.
    #[must_use]
    pub fn ever_rebalanced(&self) -> bool {
        self.assignment.is_initialized()
    }

    /// The current overload factor.
    #[must_use]
    pub fn overload(&self) -> f64 {
        self.overload
    }

    /// Set the overload factor: extra intake headroom, as a fraction of a
    /// device's desired partition count, granted when anti-affinity forces
    /// placement onto devices that are already at target.
    pub fn set_overload(&mut self, overload: f64) -> RingResult<()> {
        if !overload.is_finite() || overload < 0.0 {
            return Err(RingError::InvalidParameter {
                parameter: "overload",
                reason: format!("must be a non-negative finite number, got {overload}"),
            });
        }
        self.overload = overload;
        Ok(())
    }

    /// The persisted builder identity.
    ///
    /// Fails with an uninitialized-identity error until [`Self::assign_id`]
    /// has run or a restore carried an id in.
    pub fn id(&self) -> RingResult<Uuid> {
        self.id.ok_or(RingError::UninitializedIdentity)
    }

    /// Assign a fresh identity if none exists yet; returns the current one
    /// either way.
    pub fn assign_id(&mut self) -> Uuid {
        *self.id.get_or_insert_with(Uuid::new_v4)
    }

    /// Install a diagnostics sink, replacing any current one.
    pub fn set_diagnostic_sink(&self, sink: std::sync::Arc<dyn DiagnosticSink>) {
        self.diag.set(sink);
    }

    /// Remove the diagnostics sink.
    pub fn clear_diagnostic_sink(&self) {
        self.diag.clear();
    }

    /// Lazy, order-preserving iteration over live `(index, device)` pairs.
    ///
    /// The registry is not safe for concurrent writers while an iteration is
    /// outstanding; the borrow checker enforces exactly that here.
    pub fn devices(&self) -> impl Iterator<Item = (usize, &Device)> {
        self.devs.iter()
    }

    /// Look up one live device.
    #[must_use]
    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devs.get(id)
    }

    /// The current assignment table.
    #[must_use]
    pub fn assignment(&self) -> &AssignmentTable {
        &self.assignment
    }

    /// The move-tracking ledger.
    #[must_use]
    pub fn ledger(&self) -> &MoveLedger {
        &self.ledger
    }

    /// Devices currently queued for removal.
    #[must_use]
    pub fn pending_removals(&self) -> &[Device] {
        &self.remove_devs
    }

    /// Whether `id` is queued for removal.
    #[must_use]
    pub fn is_removed(&self, id: DeviceId) -> bool {
        self.remove_devs.iter().any(|d| d.id == id)
    }

    /// Add a device to the registry.
    ///
    /// Validates completeness first (missing fields allocate no id), then
    /// checks an explicit id against live devices, then assigns the lowest
    /// free slot when no id was requested. On success the gap below an
    /// explicit id is back-filled with empty slots, `devs_changed` is set and
    /// the version is bumped.
    pub fn add_device(&mut self, spec: DeviceSpec) -> RingResult<DeviceId> {
        let (requested, validated) = spec.into_validated()?;

        if let Some(id) = requested {
            if self.devs.is_live(id) {
                return Err(RingError::DuplicateDevice(id));
            }
        }
        let id = match requested {
            Some(id) => id,
            None => self.devs.first_hole().unwrap_or(self.devs.slot_len()) as DeviceId,
        };

        self.devs.install(id, validated.into_device(id));
        self.mark_structural_change();
        debug!(device = id, "added device");
        self.diag.emit(DiagnosticEvent::DeviceAdded { id });
        Ok(id)
    }

    /// Set the weight of a device.
    ///
    /// This must be used rather than editing the record directly so the
    /// builder can track the pending change and invalidate derived state.
    pub fn set_weight(&mut self, id: DeviceId, weight: f64) -> RingResult<()> {
        self.check_mutable(id, "set_weight")?;
        if !weight.is_finite() || weight < 0.0 {
            return Err(RingError::InvalidParameter {
                parameter: "weight",
                reason: format!("must be non-negative, got {weight}"),
            });
        }
        if let Some(dev) = self.devs.get_mut(id) {
            dev.weight = weight;
        }
        self.mark_structural_change();
        self.diag.emit(DiagnosticEvent::WeightChanged { id, weight });
        Ok(())
    }

    /// Move a device to another region.
    pub fn set_region(&mut self, id: DeviceId, region: u32) -> RingResult<()> {
        self.check_mutable(id, "set_region")?;
        if region == 0 {
            return Err(RingError::InvalidParameter {
                parameter: "region",
                reason: "must be greater than zero".to_string(),
            });
        }
        if let Some(dev) = self.devs.get_mut(id) {
            dev.region = region;
        }
        self.mark_structural_change();
        Ok(())
    }

    /// Move a device to another zone within its region.
    pub fn set_zone(&mut self, id: DeviceId, zone: u32) -> RingResult<()> {
        self.check_mutable(id, "set_zone")?;
        if zone == 0 {
            return Err(RingError::InvalidParameter {
                parameter: "zone",
                reason: "must be greater than zero".to_string(),
            });
        }
        if let Some(dev) = self.devs.get_mut(id) {
            dev.zone = zone;
        }
        self.mark_structural_change();
        Ok(())
    }

    /// Queue a device for removal.
    ///
    /// The weight drops to zero immediately so the device stops attracting
    /// data, but its partitions are only reassigned by the next rebalance,
    /// which also frees the slot for reuse.
    pub fn remove_device(&mut self, id: DeviceId) -> RingResult<()> {
        if self.is_removed(id) {
            return Err(RingError::MarkedForRemoval { device: id, operation: "remove_device" });
        }
        let dev = self.devs.get_mut(id).ok_or(RingError::UnknownDevice(id))?;
        dev.weight = 0.0;
        let record = dev.clone();
        self.remove_devs.push(record);
        self.mark_structural_change();
        info!(device = id, "device queued for removal");
        self.diag.emit(DiagnosticEvent::DeviceRemoved { id });
        Ok(())
    }

    /// Weight of one partition replica, derived from the total active
    /// weight: `parts * replicas / Σ(weights)`.
    ///
    /// Fails with empty-ring when no active device remains, and with the
    /// defensive invalid-weight error should a non-removed device ever carry
    /// a negative weight.
    pub fn weight_of_one_part(&self) -> RingResult<f64> {
        let mut weight_sum = 0.0;
        for (_, dev) in self.devs.iter() {
            if self.is_removed(dev.id) {
                continue;
            }
            if dev.weight < 0.0 {
                return Err(RingError::InvalidWeight { device: dev.id, weight: dev.weight });
            }
            weight_sum += dev.weight;
        }
        if weight_sum == 0.0 {
            return Err(RingError::EmptyRing);
        }
        Ok(self.parts() as f64 * self.replicas() as f64 / weight_sum)
    }

    /// Seconds until the ledger-wide cooldown window has elapsed, for
    /// operator visibility.
    #[must_use]
    pub fn min_part_seconds_left(&self) -> u64 {
        self.ledger.min_seconds_left(self.params.min_part_hours(), Utc::now())
    }

    /// Lift the cooldown for every partition, typically before an urgent
    /// topology repair.
    pub fn pretend_min_part_hours_passed(&mut self) {
        self.ledger.pretend_min_part_hours_passed(self.params.min_part_hours());
    }

    /// Change the minimum hours between relocations of one partition.
    pub fn change_min_part_hours(&mut self, min_part_hours: u8) {
        self.params.set_min_part_hours(min_part_hours);
    }

    /// Change the replica count.
    ///
    /// Flags pending changes only when the slot count actually changes.
    /// Assignment rows grow unassigned (repaired by the next rebalance) or
    /// are truncated in place.
    pub fn set_replicas(&mut self, replicas: usize) -> RingResult<()> {
        if replicas < 1 {
            return Err(RingError::InvalidParameter {
                parameter: "replicas",
                reason: format!("must be at least 1, got {replicas}"),
            });
        }
        let old_slots = self.parts() * self.replicas();
        let new_slots = self.parts() * replicas;
        if old_slots != new_slots {
            self.devs_changed = true;
        }
        self.params.set_replicas(replicas);
        self.assignment.set_replica_count(replicas, self.parts());
        self.version += 1;
        self.cached_ring = None;
        Ok(())
    }

    /// Refuse mutation of removed or unknown devices.
    fn check_mutable(&self, id: DeviceId, operation: &'static str) -> RingResult<()> {
        if self.is_removed(id) {
            return Err(RingError::MarkedForRemoval { device: id, operation });
        }
        if !self.devs.is_live(id) {
            return Err(RingError::UnknownDevice(id));
        }
        Ok(())
    }

    /// Record a successful structural mutation.
    fn mark_structural_change(&mut self) {
        self.devs_changed = true;
        self.version += 1;
        self.cached_ring = None;
    }
}
