//! Failure-domain-aware partition ring builder for distributed object
//! storage.
//!
//! This crate plans *where data should live*: it maps every
//! `(partition, replica)` pair of a weighted consistent-hashing ring onto a
//! storage device, spreading replicas across failure domains (region, then
//! zone), assigning partition counts proportional to device weights, and
//! bounding churn after topology edits through a per-partition move-hours
//! gate.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       RingBuilder                         │
//! ├──────────────────────────────────────────────────────────┤
//! │  DeviceTable        sparse id-stable device slots         │
//! │  AssignmentTable    replica × partition → device          │
//! │  MoveLedger         per-partition relocation cooldown     │
//! │  rebalance()        gather → reassign → converge          │
//! │  DispersionReport   replica co-location statistics        │
//! │  RingSnapshot       deep-copy state for persistence       │
//! │  RingTable          frozen artifact for the data path     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The builder is a single-writer structure; callers serialize structural
//! access externally. The one concurrency-safe exception is the swappable
//! diagnostics sink, guarded by its own lock. Rebalancing is pure in-memory
//! computation, deterministic for a given topology and seed.
//!
//! The on-disk ring file format, CLI front-ends and ring distribution are
//! external collaborators: this crate hands them [`RingSnapshot`] and
//! [`RingTable`] values and stays format-agnostic.
//!
//! # Example
//!
//! ```
//! use ringforge::{DeviceSpec, RingBuilder, RingParams};
//!
//! # fn main() -> Result<(), ringforge::RingError> {
//! let params = RingParams::new(8, 3, 1)?;
//! let mut builder = RingBuilder::new(params);
//!
//! for (region, zone) in [(1, 1), (2, 1), (3, 1), (1, 2)] {
//!     builder.add_device(
//!         DeviceSpec::new()
//!             .with_region(region)
//!             .with_zone(zone)
//!             .with_ip("10.0.0.1".parse().unwrap())
//!             .with_port(6200)
//!             .with_device("sdb1")
//!             .with_weight(1.0),
//!     )?;
//! }
//!
//! let stats = builder.rebalance(42)?;
//! assert_eq!(stats.parts_moved, 256 * 3);
//!
//! let ring = builder.ring();
//! assert_eq!(ring.devices_for_part(0).len(), 3);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod assignment;
pub mod bitmap;
pub mod builder;
pub mod device;
pub mod diag;
pub mod dispersion;
pub mod error;
pub mod ledger;
pub mod params;
pub mod rebalance;
pub mod ring;
pub mod snapshot;

pub use assignment::AssignmentTable;
pub use bitmap::PartBitmap;
pub use builder::RingBuilder;
pub use device::{Device, DeviceId, DeviceSpec, DeviceTable};
pub use diag::{DiagnosticEvent, DiagnosticSink};
pub use dispersion::{DispersionReport, TierKey, TierStats};
pub use error::{RingError, RingResult};
pub use ledger::MoveLedger;
pub use params::{RingParams, MAX_PART_POWER};
pub use rebalance::RebalanceStats;
pub use ring::RingTable;
pub use snapshot::RingSnapshot;
