//! Device records and the sparse device table.
//!
//! Devices are stored in a slot arena indexed by their stable id. Removed or
//! never-assigned slots are tagged empty rather than physically deleted, so
//! ids stay valid across the life of the ring and freed slots can be reused
//! by later additions.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{RingError, RingResult};

/// Unique, stable identifier for a storage device.
pub type DeviceId = u32;

/// One storage target in the ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable device id; may have gaps from removed devices.
    pub id: DeviceId,
    /// Placement weight; 0 marks a device queued for removal.
    pub weight: f64,
    /// Failure domain tier 1.
    pub region: u32,
    /// Failure domain tier 2, meaningful within a region.
    pub zone: u32,
    /// Network address of the node holding the device.
    pub ip: IpAddr,
    /// Service port on that node.
    pub port: u16,
    /// On-disk device name, e.g. `sdb1`.
    pub device: String,
}

impl Device {
    /// Returns true while the device is an active placement target.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.weight > 0.0
    }
}

/// Builder-style input for [`crate::RingBuilder::add_device`].
///
/// Region, zone, ip, port, device name and weight are all required; an add
/// with any of them absent fails with a missing-fields error naming every
/// absent key. Zero values count as absent, matching the wire convention the
/// rest of the cluster tooling uses for "not set".
#[derive(Debug, Clone, Default)]
pub struct DeviceSpec {
    id: Option<DeviceId>,
    weight: Option<f64>,
    region: Option<u32>,
    zone: Option<u32>,
    ip: Option<IpAddr>,
    port: Option<u16>,
    device: Option<String>,
}

impl DeviceSpec {
    /// Create an empty spec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an explicit device id instead of automatic assignment.
    #[must_use]
    pub fn with_id(mut self, id: DeviceId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the placement weight.
    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Set the region (failure domain tier 1).
    #[must_use]
    pub fn with_region(mut self, region: u32) -> Self {
        self.region = Some(region);
        self
    }

    /// Set the zone (failure domain tier 2).
    #[must_use]
    pub fn with_zone(mut self, zone: u32) -> Self {
        self.zone = Some(zone);
        self
    }

    /// Set the node address.
    #[must_use]
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Set the node port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the on-disk device name.
    #[must_use]
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// The explicitly requested id, if any.
    #[must_use]
    pub fn requested_id(&self) -> Option<DeviceId> {
        self.id
    }

    /// Validate completeness and split into the requested id and the fields.
    ///
    /// Returns every missing key at once so the caller can fix the spec in
    /// one round trip.
    pub(crate) fn into_validated(self) -> RingResult<(Option<DeviceId>, ValidatedSpec)> {
        let mut missing: Vec<&'static str> = Vec::new();
        if self.region.unwrap_or(0) == 0 {
            missing.push("region");
        }
        if self.zone.unwrap_or(0) == 0 {
            missing.push("zone");
        }
        if self.ip.is_none() {
            missing.push("ip");
        }
        if self.port.unwrap_or(0) == 0 {
            missing.push("port");
        }
        if self.device.as_deref().unwrap_or("").is_empty() {
            missing.push("device");
        }
        if self.weight.unwrap_or(0.0) == 0.0 {
            missing.push("weight");
        }
        if !missing.is_empty() {
            let device = match self.id {
                Some(id) => id.to_string(),
                None => "(unassigned)".to_string(),
            };
            return Err(RingError::MissingFields { device, missing });
        }

        let weight = self.weight.unwrap_or(0.0);
        if weight < 0.0 {
            return Err(RingError::InvalidParameter {
                parameter: "weight",
                reason: format!("must be non-negative, got {weight}"),
            });
        }

        Ok((
            self.id,
            ValidatedSpec {
                weight,
                region: self.region.unwrap_or(0),
                zone: self.zone.unwrap_or(0),
                ip: self.ip.unwrap_or(IpAddr::from([0, 0, 0, 0])),
                port: self.port.unwrap_or(0),
                device: self.device.unwrap_or_default(),
            },
        ))
    }
}

/// A spec that passed completeness validation.
#[derive(Debug, Clone)]
pub(crate) struct ValidatedSpec {
    pub(crate) weight: f64,
    pub(crate) region: u32,
    pub(crate) zone: u32,
    pub(crate) ip: IpAddr,
    pub(crate) port: u16,
    pub(crate) device: String,
}

impl ValidatedSpec {
    pub(crate) fn into_device(self, id: DeviceId) -> Device {
        Device {
            id,
            weight: self.weight,
            region: self.region,
            zone: self.zone,
            ip: self.ip,
            port: self.port,
            device: self.device,
        }
    }
}

/// Sparse arena of device slots indexed by device id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTable {
    slots: Vec<Option<Device>>,
}

impl DeviceTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots, counting holes.
    #[must_use]
    pub fn slot_len(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn live_len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Look up a live device by id.
    #[must_use]
    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    /// Returns true when the slot for `id` holds a live device.
    #[must_use]
    pub fn is_live(&self, id: DeviceId) -> bool {
        self.get(id).is_some()
    }

    /// Order-preserving iteration over `(index, device)` pairs, skipping
    /// holes.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Device)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| slot.as_ref().map(|d| (i, d)))
    }

    pub(crate) fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.slots.get_mut(id as usize).and_then(Option::as_mut)
    }

    /// Lowest-indexed empty slot, if any.
    pub(crate) fn first_hole(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    /// Install a device at `id`, back-filling holes up to the index.
    pub(crate) fn install(&mut self, id: DeviceId, device: Device) {
        let idx = id as usize;
        while self.slots.len() <= idx {
            self.slots.push(None);
        }
        self.slots[idx] = Some(device);
    }

    /// Empty the slot for `id`.
    pub(crate) fn clear_slot(&mut self, id: DeviceId) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            *slot = None;
        }
    }
}
