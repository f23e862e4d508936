use std::sync::Arc;
use std::time::Duration;

/// How a view summarizes the values recorded against its measure.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    /// Number of measurements, regardless of value.
    Count,
    /// Sum of measured values.
    Sum,
    /// Running mean of measured values.
    Mean,
    /// Histogram over explicit bucket boundaries, plus moments.
    Distribution { bounds: Arc<[f64]> },
}

impl Aggregation {
    /// Distribution aggregation over the given bucket boundaries.
    pub fn distribution(bounds: impl Into<Vec<f64>>) -> Self {
        Self::Distribution {
            bounds: Arc::from(bounds.into()),
        }
    }

    /// Short lowercase name for logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Distribution { .. } => "distribution",
        }
    }

    /// Checks that distribution boundaries are finite and strictly ascending.
    pub fn validate(&self) -> Result<(), String> {
        let Self::Distribution { bounds } = self else {
            return Ok(());
        };

        if let Some(b) = bounds.iter().find(|b| !b.is_finite()) {
            return Err(format!("bucket boundary {b} is not finite"));
        }
        if let Some(pair) = bounds.windows(2).find(|w| w[0] >= w[1]) {
            return Err(format!(
                "bucket boundaries must be strictly ascending, got {} before {}",
                pair[0], pair[1]
            ));
        }

        Ok(())
    }
}

/// Time span a view's rows cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// Accumulates from registration onwards and never resets.
    Cumulative,
    /// Sliding window over the last `duration`, kept as `intervals`
    /// sub-intervals of equal width.
    Interval { duration: Duration, intervals: u32 },
}

impl Window {
    pub fn is_cumulative(&self) -> bool {
        matches!(self, Self::Cumulative)
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Cumulative => Ok(()),
            Self::Interval { duration, .. } if duration.is_zero() => {
                Err("interval duration must be positive".to_string())
            }
            Self::Interval { intervals: 0, .. } => {
                Err("interval count must be positive".to_string())
            }
            Self::Interval { .. } => Ok(()),
        }
    }
}

/// Returns the bucket a value falls into: bucket `i` holds `b[i-1] <= v < b[i]`,
/// bucket 0 holds everything below the first boundary and bucket `len` holds
/// everything at or above the last.
#[inline]
pub fn bucket_index(bounds: &[f64], value: f64) -> usize {
    bounds.partition_point(|b| *b <= value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_bucket(bounds: &[f64], value: f64) -> usize {
        for (i, b) in bounds.iter().enumerate() {
            if value < *b {
                return i;
            }
        }
        bounds.len()
    }

    #[test]
    fn test_bucket_index_edges() {
        let bounds = [0.0, 1.0, 2.0, 4.0];
        assert_eq!(bucket_index(&bounds, -1.0), 0);
        assert_eq!(bucket_index(&bounds, 0.0), 1);
        assert_eq!(bucket_index(&bounds, 0.5), 1);
        assert_eq!(bucket_index(&bounds, 1.0), 2);
        assert_eq!(bucket_index(&bounds, 3.999), 3);
        assert_eq!(bucket_index(&bounds, 4.0), 4);
        assert_eq!(bucket_index(&bounds, 1e12), 4);
    }

    #[test]
    fn test_bucket_index_empty_bounds() {
        assert_eq!(bucket_index(&[], 42.0), 0);
        assert_eq!(bucket_index(&[], -42.0), 0);
    }

    #[test]
    fn test_bucket_index_matches_linear_search() {
        let bounds = [
            0.0, 1024.0, 2048.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0,
        ];
        let mut v = -3.0;
        while v < 2_000_000.0 {
            assert_eq!(
                bucket_index(&bounds, v),
                linear_bucket(&bounds, v),
                "value {v}"
            );
            v = v * 1.7 + 3.0;
        }
        for b in bounds {
            assert_eq!(bucket_index(&bounds, b), linear_bucket(&bounds, b));
        }
    }

    #[test]
    fn test_validate_bounds() {
        assert!(Aggregation::distribution(vec![]).validate().is_ok());
        assert!(Aggregation::distribution(vec![0.0, 1.0, 5.0])
            .validate()
            .is_ok());
        assert!(Aggregation::distribution(vec![0.0, 1.0, 1.0])
            .validate()
            .is_err());
        assert!(Aggregation::distribution(vec![3.0, 1.0]).validate().is_err());
        assert!(Aggregation::distribution(vec![0.0, f64::INFINITY])
            .validate()
            .is_err());
        assert!(Aggregation::distribution(vec![f64::NAN]).validate().is_err());
        assert!(Aggregation::Count.validate().is_ok());
    }

    #[test]
    fn test_validate_window() {
        assert!(Window::Cumulative.validate().is_ok());
        assert!(Window::Interval {
            duration: Duration::from_secs(60),
            intervals: 5
        }
        .validate()
        .is_ok());
        assert!(Window::Interval {
            duration: Duration::ZERO,
            intervals: 5
        }
        .validate()
        .is_err());
        assert!(Window::Interval {
            duration: Duration::from_secs(60),
            intervals: 0
        }
        .validate()
        .is_err());
    }
}
