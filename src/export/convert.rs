//! Conversion of view snapshots into upload requests.

use std::collections::BTreeMap;

use super::wire::{
    DistributionValue, TimeInterval, TimeSeriesPoint, Timestamp, TypedValue, UploadRequest,
};
use crate::stats::{AggregationData, ViewData};

/// Namespace prefixed to every view name to form its metric type.
pub const DEFAULT_METRIC_PREFIX: &str = "custom.googleapis.com/opencensus/";

/// Monitored resource type used when no richer resource is configured.
pub const DEFAULT_RESOURCE_TYPE: &str = "global";

/// Backend limit on time series per upload call.
pub const MAX_TIME_SERIES_PER_UPLOAD: usize = 200;

/// Backend limit on label key length.
const LABEL_KEY_MAX_LEN: usize = 100;

/// Where and under which names points are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOptions {
    pub project_id: String,
    pub metric_prefix: String,
    pub resource_type: String,
}

impl RequestOptions {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            metric_prefix: DEFAULT_METRIC_PREFIX.to_string(),
            resource_type: DEFAULT_RESOURCE_TYPE.to_string(),
        }
    }

    /// Upload target, `projects/{project_id}`.
    pub fn target(&self) -> String {
        format!("projects/{}", self.project_id)
    }

    pub fn metric_type(&self, view_name: &str) -> String {
        format!("{}{}", self.metric_prefix, view_name)
    }
}

/// Converts snapshots into upload requests of at most `max_per_request`
/// time series each. Points keep the order of their snapshots and rows;
/// no points yields no requests.
pub fn make_requests(
    opts: &RequestOptions,
    data: &[ViewData],
    max_per_request: usize,
) -> Vec<UploadRequest> {
    let points: Vec<TimeSeriesPoint> = data
        .iter()
        .flat_map(|vd| time_series(opts, vd))
        .collect();
    if points.is_empty() {
        return Vec::new();
    }

    let chunk = max_per_request.max(1);
    let target = opts.target();
    let mut requests = Vec::with_capacity(points.len().div_ceil(chunk));
    let mut points = points.into_iter().peekable();
    while points.peek().is_some() {
        requests.push(UploadRequest {
            target: target.clone(),
            time_series: points.by_ref().take(chunk).collect(),
        });
    }

    requests
}

/// Builds one point per non-empty row of a snapshot.
pub fn time_series(opts: &RequestOptions, vd: &ViewData) -> Vec<TimeSeriesPoint> {
    let metric_type = opts.metric_type(vd.view.name());
    let interval = TimeInterval {
        start_time: Timestamp::from(vd.start),
        end_time: Timestamp::from(vd.end),
    };

    vd.rows
        .iter()
        .filter_map(|row| {
            let value = typed_value(&row.data)?;
            let labels: BTreeMap<String, String> = row
                .tags
                .iter()
                .map(|t| (sanitize_label(t.key.name()), t.value.clone()))
                .collect();
            Some(TimeSeriesPoint {
                metric_type: metric_type.clone(),
                labels,
                resource_type: opts.resource_type.clone(),
                interval,
                value,
            })
        })
        .collect()
}

/// Encodes accumulated data as a wire value. Empty accumulators have no value.
pub fn typed_value(data: &AggregationData) -> Option<TypedValue> {
    match data {
        AggregationData::Count(c) if c.value > 0 => Some(TypedValue::Int64Value(c.value)),
        AggregationData::Count(_) => None,
        AggregationData::Sum(s) => Some(TypedValue::DoubleValue(s.value)),
        AggregationData::Mean(m) if m.count > 0 => {
            Some(TypedValue::DistributionValue(DistributionValue {
                count: m.count,
                mean: m.mean,
                sum_of_squared_deviation: 0.0,
                bucket_bounds: vec![0.0],
                bucket_counts: vec![0, m.count],
            }))
        }
        AggregationData::Mean(_) => None,
        AggregationData::Distribution(d) if d.count > 0 => {
            let (bucket_bounds, bucket_counts) =
                with_zero_bound(&d.bounds, &d.count_per_bucket);
            Some(TypedValue::DistributionValue(DistributionValue {
                count: d.count,
                mean: d.mean,
                sum_of_squared_deviation: d.sum_of_squared_dev,
                bucket_bounds,
                bucket_counts,
            }))
        }
        AggregationData::Distribution(_) => None,
    }
}

/// The backend expects at least one explicit boundary. A distribution
/// without boundaries gets a synthetic 0 boundary with an empty bucket in
/// front; explicit boundaries are sent as recorded so no bucket count moves.
fn with_zero_bound(bounds: &[f64], counts: &[i64]) -> (Vec<f64>, Vec<i64>) {
    if !bounds.is_empty() {
        return (bounds.to_vec(), counts.to_vec());
    }

    let mut c = Vec::with_capacity(counts.len() + 1);
    c.push(0);
    c.extend_from_slice(counts);
    (vec![0.0], c)
}

/// Maps a tag key onto the backend's label key alphabet.
pub fn sanitize_label(key: &str) -> String {
    let mut out: String = key
        .chars()
        .take(LABEL_KEY_MAX_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "key_");
    } else if out.starts_with('_') {
        out.insert_str(0, "key");
    }
    out
}
