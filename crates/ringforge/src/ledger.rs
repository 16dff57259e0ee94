//! Move-tracking ledger.
//!
//! Tracks, per partition, the hours elapsed since its last relocation plus a
//! bitmap of partitions already moved during the current rebalance pass. The
//! two together gate which partitions the rebalance engine may touch: a
//! partition is eligible when its age has reached `min_part_hours` and it has
//! not yet moved this pass. Ages accumulate against a wall-clock epoch while
//! no pass is running.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bitmap::PartBitmap;

/// Per-partition relocation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveLedger {
    /// Hours since each partition last moved, saturating at the cooldown cap.
    ages: Vec<u8>,
    /// Partitions already relocated during the current pass.
    moved: PartBitmap,
    /// Reference time the ages were last brought up to date against.
    epoch: DateTime<Utc>,
}

impl MoveLedger {
    /// Create a ledger for `parts` partitions with all ages zero.
    #[must_use]
    pub fn new(parts: usize, now: DateTime<Utc>) -> Self {
        Self { ages: vec![0; parts], moved: PartBitmap::new(parts), epoch: now }
    }

    /// Number of partitions tracked.
    #[must_use]
    pub fn parts(&self) -> usize {
        self.ages.len()
    }

    /// Recorded age of one partition, in hours.
    #[must_use]
    pub fn age_hours(&self, part: usize) -> u8 {
        self.ages[part]
    }

    /// The reference time ages are measured against.
    #[must_use]
    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    /// Whether the partition may be relocated.
    #[must_use]
    pub fn can_move(&self, part: usize, min_part_hours: u8) -> bool {
        self.ages[part] >= min_part_hours && !self.moved.get(part)
    }

    /// Whether the partition has already moved during the current pass.
    #[must_use]
    pub fn has_moved(&self, part: usize) -> bool {
        self.moved.get(part)
    }

    /// Record a relocation: the age resets and the pass bit is set.
    pub fn mark_moved(&mut self, part: usize) {
        self.ages[part] = 0;
        self.moved.set(part);
    }

    /// Open a rebalance pass at `now`.
    ///
    /// Ages each partition by the wall-clock hours elapsed since the epoch
    /// (saturating at `cap`), resets the epoch, and clears the per-pass
    /// bitmap.
    pub fn begin_pass(&mut self, now: DateTime<Utc>, cap: u8) {
        let elapsed = (now - self.epoch).num_hours().max(0);
        let hours = u8::try_from(elapsed).unwrap_or(u8::MAX);
        self.age_by(hours, cap);
        self.epoch = now;
        self.moved.clear_all();
    }

    /// Age every partition by `hours`, saturating at `cap`.
    pub fn age_by(&mut self, hours: u8, cap: u8) {
        if hours == 0 {
            return;
        }
        for age in &mut self.ages {
            *age = age.saturating_add(hours).min(cap);
        }
    }

    /// Saturate every age so the cooldown gate passes everywhere.
    pub fn pretend_min_part_hours_passed(&mut self, min_part_hours: u8) {
        for age in &mut self.ages {
            *age = min_part_hours;
        }
    }

    /// Seconds until the ledger-wide cooldown window has fully elapsed.
    ///
    /// Operator visibility only; individual partitions are gated by their own
    /// ages, not by this value.
    #[must_use]
    pub fn min_seconds_left(&self, min_part_hours: u8, now: DateTime<Utc>) -> u64 {
        let elapsed = (now - self.epoch).num_seconds().max(0) as u64;
        (u64::from(min_part_hours) * 3600).saturating_sub(elapsed)
    }
}
