//! Deep-copy snapshot and restore of the full builder state.
//!
//! The snapshot is a typed value graph: every field the builder owns, deep
//! copied, with no dynamic key/value maps and no aliasing back into the
//! builder. An external persistence collaborator serializes it however it
//! likes; restoring it and immediately re-snapshotting yields an identical
//! value.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::assignment::AssignmentTable;
use crate::builder::RingBuilder;
use crate::device::{Device, DeviceTable};
use crate::dispersion::DispersionReport;
use crate::ledger::MoveLedger;
use crate::params::RingParams;

/// The complete persistable state of a [`RingBuilder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingSnapshot {
    /// Construction-time parameters.
    pub params: RingParams,
    /// Persisted builder identity, if one was assigned.
    pub id: Option<Uuid>,
    /// The device table, holes preserved.
    pub devs: DeviceTable,
    /// Devices queued for removal.
    pub remove_devs: Vec<Device>,
    /// The assignment table.
    pub assignment: AssignmentTable,
    /// The move-tracking ledger, ages and epoch included.
    pub ledger: MoveLedger,
    /// Dispersion report from the last rebalance.
    pub dispersion: DispersionReport,
    /// Overload factor.
    pub overload: f64,
    /// Structural version counter.
    pub version: u64,
    /// Pending-changes flag.
    pub devs_changed: bool,
}

impl RingBuilder {
    /// Produce an independent deep copy of all mutable state.
    #[must_use]
    pub fn snapshot(&self) -> RingSnapshot {
        RingSnapshot {
            params: self.params,
            id: self.id,
            devs: self.devs.clone(),
            remove_devs: self.remove_devs.clone(),
            assignment: self.assignment.clone(),
            ledger: self.ledger.clone(),
            dispersion: self.dispersion.clone(),
            overload: self.overload,
            version: self.version,
            devs_changed: self.devs_changed,
        }
    }

    /// Replace all current state with the snapshot's.
    ///
    /// Nothing is shared with the snapshot afterwards; both sides stay
    /// independently mutable. Any previously derived ring artifact is
    /// invalidated and will be rebuilt on demand.
    pub fn restore(&mut self, snapshot: &RingSnapshot) {
        self.params = snapshot.params;
        self.id = snapshot.id;
        self.devs = snapshot.devs.clone();
        self.remove_devs = snapshot.remove_devs.clone();
        self.assignment = snapshot.assignment.clone();
        self.ledger = snapshot.ledger.clone();
        self.dispersion = snapshot.dispersion.clone();
        self.overload = snapshot.overload;
        self.version = snapshot.version;
        self.devs_changed = snapshot.devs_changed;
        self.cached_ring = None;
    }

    /// Build a fresh builder from a snapshot, as when loading persisted
    /// state.
    #[must_use]
    pub fn from_snapshot(snapshot: &RingSnapshot) -> Self {
        let mut builder = Self::new(snapshot.params);
        builder.restore(snapshot);
        builder
    }
}
