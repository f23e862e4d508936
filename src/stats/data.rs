//! Per-row accumulators.
//!
//! Every variant is updated in place under its row's lock. Snapshots are
//! plain clones, so they share nothing with the live accumulator.

use std::sync::Arc;

use super::aggregation::{bucket_index, Aggregation};

/// Accumulated state of one row.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationData {
    Count(CountData),
    Sum(SumData),
    Mean(MeanData),
    Distribution(DistributionData),
}

impl AggregationData {
    /// Creates a zero-valued accumulator for the aggregation.
    pub fn new(aggregation: &Aggregation) -> Self {
        match aggregation {
            Aggregation::Count => Self::Count(CountData::default()),
            Aggregation::Sum => Self::Sum(SumData::default()),
            Aggregation::Mean => Self::Mean(MeanData::default()),
            Aggregation::Distribution { bounds } => {
                Self::Distribution(DistributionData::new(Arc::clone(bounds)))
            }
        }
    }

    /// Folds one measured value into the accumulator.
    #[inline]
    pub fn update(&mut self, value: f64) {
        match self {
            Self::Count(d) => d.update(),
            Self::Sum(d) => d.update(value),
            Self::Mean(d) => d.update(value),
            Self::Distribution(d) => d.update(value),
        }
    }

    /// Returns an independent copy for export. Distribution statistics of
    /// an empty accumulator are normalized to zero.
    pub fn snapshot(&self) -> Self {
        match self {
            Self::Distribution(d) => Self::Distribution(d.snapshot()),
            other => other.clone(),
        }
    }

    /// Folds another accumulator of the same aggregation into this one.
    pub fn merge(&mut self, other: &Self) {
        match (self, other) {
            (Self::Count(a), Self::Count(b)) => a.value += b.value,
            (Self::Sum(a), Self::Sum(b)) => a.value += b.value,
            (Self::Mean(a), Self::Mean(b)) => a.merge(b),
            (Self::Distribution(a), Self::Distribution(b)) => a.merge(b),
            // Rows of one view always share an aggregation.
            _ => {}
        }
    }

    /// Zeroes the accumulator in place, keeping distribution bounds.
    pub(crate) fn reset(&mut self) {
        match self {
            Self::Count(d) => *d = CountData::default(),
            Self::Sum(d) => *d = SumData::default(),
            Self::Mean(d) => *d = MeanData::default(),
            Self::Distribution(d) => d.reset(),
        }
    }

    /// Number of measurements folded in, where the variant tracks it.
    pub fn count(&self) -> Option<i64> {
        match self {
            Self::Count(d) => Some(d.value),
            Self::Sum(_) => None,
            Self::Mean(d) => Some(d.count),
            Self::Distribution(d) => Some(d.count),
        }
    }
}

/// Number of measurements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountData {
    pub value: i64,
}

impl CountData {
    #[inline]
    pub fn update(&mut self) {
        self.value += 1;
    }
}

/// Sum of measured values.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SumData {
    pub value: f64,
}

impl SumData {
    #[inline]
    pub fn update(&mut self, value: f64) {
        self.value += value;
    }
}

/// Incremental mean.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeanData {
    pub count: i64,
    pub mean: f64,
}

impl MeanData {
    #[inline]
    pub fn update(&mut self, value: f64) {
        self.count += 1;
        self.mean += (value - self.mean) / self.count as f64;
    }

    pub fn merge(&mut self, other: &MeanData) {
        if other.count == 0 {
            return;
        }
        let total = self.count + other.count;
        self.mean += (other.mean - self.mean) * (other.count as f64 / total as f64);
        self.count = total;
    }
}

/// Histogram plus running moments (Welford).
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionData {
    pub count: i64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub sum_of_squared_dev: f64,
    pub count_per_bucket: Vec<i64>,
    pub bounds: Arc<[f64]>,
}

impl DistributionData {
    /// Creates an empty distribution with min at +inf and max at -inf.
    pub fn new(bounds: Arc<[f64]>) -> Self {
        Self {
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: 0.0,
            sum_of_squared_dev: 0.0,
            count_per_bucket: vec![0; bounds.len() + 1],
            bounds,
        }
    }

    #[inline]
    pub fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.sum_of_squared_dev += delta * (value - self.mean);

        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }

        let idx = bucket_index(&self.bounds, value);
        self.count_per_bucket[idx] += 1;
    }

    /// Combines two distributions over the same bounds. Moments are merged
    /// pairwise (Chan et al.), so the result matches recording both value
    /// sequences into one accumulator.
    pub fn merge(&mut self, other: &DistributionData) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            self.clone_from(other);
            return;
        }

        let n_a = self.count as f64;
        let n_b = other.count as f64;
        let n = n_a + n_b;
        let delta = other.mean - self.mean;

        self.mean += delta * (n_b / n);
        self.sum_of_squared_dev += other.sum_of_squared_dev + delta * delta * (n_a * n_b / n);
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);

        for (mine, theirs) in self.count_per_bucket.iter_mut().zip(&other.count_per_bucket) {
            *mine += theirs;
        }
    }

    fn reset(&mut self) {
        self.count = 0;
        self.min = f64::INFINITY;
        self.max = f64::NEG_INFINITY;
        self.mean = 0.0;
        self.sum_of_squared_dev = 0.0;
        self.count_per_bucket.fill(0);
    }

    /// Sample variance, or zero with fewer than two values.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        self.sum_of_squared_dev / (self.count - 1) as f64
    }

    pub fn sum(&self) -> f64 {
        self.mean * self.count as f64
    }

    fn snapshot(&self) -> Self {
        let mut out = self.clone();
        // Handle case where no values were recorded.
        if out.count == 0 {
            out.min = 0.0;
            out.max = 0.0;
            out.mean = 0.0;
            out.sum_of_squared_dev = 0.0;
        }
        out
    }
}
