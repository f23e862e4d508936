//! Sliding-window rows for interval views.
//!
//! An interval window of `duration` is split into `intervals` sub-intervals
//! of equal width, numbered from the view's registration. A row keeps one
//! accumulator per sub-interval in a ring of `intervals + 1` slots: the
//! sub-intervals fully inside the window plus the one in progress. Reading
//! merges the live slots into a single aggregate without resetting anything,
//! so every reader of the same instant sees the same data.

use std::time::{Duration, Instant, SystemTime};

use super::aggregation::Aggregation;
use super::data::AggregationData;

/// Clock of one interval view: maps instants onto sub-interval numbers and
/// back onto wall-clock window boundaries.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IntervalClock {
    epoch: Instant,
    epoch_wall: SystemTime,
    width: Duration,
    intervals: u32,
}

impl IntervalClock {
    pub(crate) fn new(
        epoch: Instant,
        epoch_wall: SystemTime,
        duration: Duration,
        intervals: u32,
    ) -> Self {
        let intervals = intervals.max(1);
        Self {
            epoch,
            epoch_wall,
            width: (duration / intervals).max(Duration::from_nanos(1)),
            intervals,
        }
    }

    pub(crate) fn intervals(&self) -> u32 {
        self.intervals
    }

    /// Sub-interval number `now` falls in.
    pub(crate) fn slot_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.epoch).as_nanos();
        u64::try_from(elapsed / self.width.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Wall-clock start of the oldest sub-interval a read at `slot` covers.
    pub(crate) fn window_start(&self, slot: u64) -> SystemTime {
        let first = slot.saturating_sub(u64::from(self.intervals));
        let offset = self.width.as_nanos().saturating_mul(u128::from(first));
        let offset = Duration::from_nanos(u64::try_from(offset).unwrap_or(u64::MAX));
        self.epoch_wall
            .checked_add(offset)
            .unwrap_or(self.epoch_wall)
    }
}

#[derive(Debug)]
struct Slot {
    index: Option<u64>,
    data: AggregationData,
}

/// Ring of per-sub-interval accumulators of one row.
#[derive(Debug)]
pub(crate) struct IntervalRow {
    slots: Box<[Slot]>,
    intervals: u64,
}

impl IntervalRow {
    pub(crate) fn new(aggregation: &Aggregation, intervals: u32) -> Self {
        let intervals = u64::from(intervals.max(1));
        let slots = (0..=intervals)
            .map(|_| Slot {
                index: None,
                data: AggregationData::new(aggregation),
            })
            .collect();
        Self { slots, intervals }
    }

    /// Folds `value` into sub-interval `at`. A slot still holding an older
    /// sub-interval is recycled first; a recorder that computed its slot
    /// just before the ring moved on lands in the newer slot instead of
    /// wiping it.
    pub(crate) fn update(&mut self, at: u64, value: f64) {
        let pos = (at % self.slots.len() as u64) as usize;
        let slot = &mut self.slots[pos];
        match slot.index {
            Some(index) if index >= at => {}
            _ => {
                slot.data.reset();
                slot.index = Some(at);
            }
        }
        slot.data.update(value);
    }

    /// Merged aggregate of every sub-interval inside the window ending at
    /// `at`, or `None` when nothing was recorded in it.
    pub(crate) fn read(&self, at: u64) -> Option<AggregationData> {
        let oldest = at.saturating_sub(self.intervals);
        let mut live = self
            .slots
            .iter()
            .filter(|s| s.index.is_some_and(|i| i >= oldest));

        let mut merged = live.next()?.data.clone();
        for slot in live {
            merged.merge(&slot.data);
        }
        Some(merged.snapshot())
    }
}
