//! The replica-to-partition-to-device assignment matrix.
//!
//! This is the artifact the whole engine produces and mutates: one row per
//! replica index, one cell per partition, each cell holding the id of the
//! device that replica lives on. `None` marks a cell that has never been
//! assigned or whose device went away; such cells are repaired structurally
//! on the next rebalance regardless of the move-hours gate.

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;

/// The `replica × partition → device` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentTable {
    rows: Vec<Vec<Option<DeviceId>>>,
}

impl AssignmentTable {
    /// An empty table: the ring has never been rebalanced.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A fully unassigned table of the given shape.
    #[must_use]
    pub fn with_shape(replicas: usize, parts: usize) -> Self {
        Self { rows: vec![vec![None; parts]; replicas] }
    }

    /// Whether the table has been given a shape by a rebalance.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        !self.rows.is_empty()
    }

    /// Number of replica rows.
    #[must_use]
    pub fn replicas(&self) -> usize {
        self.rows.len()
    }

    /// Number of partitions per row.
    #[must_use]
    pub fn parts(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    /// The device holding `replica` of `part`, if assigned.
    #[must_use]
    pub fn get(&self, replica: usize, part: usize) -> Option<DeviceId> {
        self.rows[replica][part]
    }

    /// Raw row access for read-only consumers.
    #[must_use]
    pub fn rows(&self) -> &[Vec<Option<DeviceId>>] {
        &self.rows
    }

    /// Devices currently holding replicas of `part`, skipping unassigned
    /// cells.
    pub fn devices_of_part(&self, part: usize) -> impl Iterator<Item = DeviceId> + '_ {
        self.rows.iter().filter_map(move |row| row[part])
    }

    /// Per-slot assigned partition counts over a device table of `slots`
    /// slots. Cells referencing out-of-range ids are ignored.
    #[must_use]
    pub fn assigned_counts(&self, slots: usize) -> Vec<usize> {
        let mut counts = vec![0usize; slots];
        for row in &self.rows {
            for dev in row.iter().flatten() {
                if let Some(count) = counts.get_mut(*dev as usize) {
                    *count += 1;
                }
            }
        }
        counts
    }

    pub(crate) fn set(&mut self, replica: usize, part: usize, dev: Option<DeviceId>) {
        self.rows[replica][part] = dev;
    }

    /// Resize to a new replica count, keeping existing rows where possible.
    /// New rows start fully unassigned.
    pub(crate) fn set_replica_count(&mut self, replicas: usize, parts: usize) {
        if !self.is_initialized() {
            return;
        }
        self.rows.resize_with(replicas, || vec![None; parts]);
    }
}
