//! RPC instrumentation: well-known tag keys, per-side measures and views,
//! and the per-call [`CallStats`] state machine.

pub mod handler;

use std::sync::Arc;
use std::time::Duration;

use crate::stats::{Aggregation, Measure, Registry, StatsError, View, Window};
use crate::tag::TagKey;

pub use handler::{CallState, CallStats, RpcError, StatsHandler};

/// Method name tag.
pub const KEY_METHOD: TagKey = TagKey::from_static("grpc.method");
/// Service name tag.
pub const KEY_SERVICE: TagKey = TagKey::from_static("grpc.service");
/// Terminal error status tag, only set on the error-count view.
pub const KEY_STATUS: TagKey = TagKey::from_static("grpc.status");

pub const REQUEST_BYTES: &str = "request_bytes";
pub const RESPONSE_BYTES: &str = "response_bytes";
pub const REQUEST_COUNT: &str = "request_count";
pub const RESPONSE_COUNT: &str = "response_count";
pub const ERROR_COUNT: &str = "error_count";
pub const LATENCY: &str = "latency";
pub const STARTED_COUNT: &str = "started_count";
pub const FINISHED_COUNT: &str = "finished_count";

/// Byte-size bucket boundaries.
pub const BYTES_BOUNDS: [f64; 14] = [
    0.0,
    1024.0,
    2048.0,
    4096.0,
    16384.0,
    65536.0,
    262144.0,
    1048576.0,
    4194304.0,
    16777216.0,
    67108864.0,
    268435456.0,
    1073741824.0,
    4294967296.0,
];

/// Per-call message-count bucket boundaries.
pub const COUNT_BOUNDS: [f64; 18] = [
    0.0, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0,
    8192.0, 16384.0, 32768.0, 65536.0,
];

/// Call latency bucket boundaries, in milliseconds.
pub const LATENCY_MS_BOUNDS: [f64; 35] = [
    0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 8.0, 10.0, 13.0, 16.0, 20.0, 25.0, 30.0, 40.0, 50.0, 65.0,
    80.0, 100.0, 130.0, 160.0, 200.0, 250.0, 300.0, 400.0, 500.0, 650.0, 800.0, 1000.0, 2000.0,
    5000.0, 10000.0, 20000.0, 50000.0, 100000.0,
];

/// Window of the default distribution views. Cumulative distributions cannot
/// be exported, so they cover the last minute instead.
pub const DISTRIBUTION_WINDOW: Window = Window::Interval {
    duration: Duration::from_secs(60),
    intervals: 1,
};

/// Which end of the call is instrumented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }

    /// Full measure or view name for a metric suffix, e.g.
    /// `grpc.io/server/request_count`.
    pub fn metric_name(self, suffix: &str) -> String {
        format!("grpc.io/{}/{}", self.as_str(), suffix)
    }
}

/// Measures recorded by one side's handler.
#[derive(Debug, Clone)]
pub struct RpcMeasures {
    pub side: Side,
    pub request_bytes: Arc<Measure>,
    pub response_bytes: Arc<Measure>,
    pub request_count: Arc<Measure>,
    pub response_count: Arc<Measure>,
    pub error_count: Arc<Measure>,
    pub latency: Arc<Measure>,
    pub started_count: Arc<Measure>,
    pub finished_count: Arc<Measure>,
}

impl RpcMeasures {
    /// Registers (or looks up) the measures of one side.
    pub fn register(registry: &Registry, side: Side) -> Result<Self, StatsError> {
        let int = |suffix: &str, description: &str, unit: &str| {
            registry.register_measure(Measure::int64(side.metric_name(suffix), description, unit))
        };

        Ok(Self {
            side,
            request_bytes: int(REQUEST_BYTES, "Request bytes", "By")?,
            response_bytes: int(RESPONSE_BYTES, "Response bytes", "By")?,
            request_count: int(REQUEST_COUNT, "Request messages per call", "1")?,
            response_count: int(RESPONSE_COUNT, "Response messages per call", "1")?,
            error_count: int(ERROR_COUNT, "Calls ending with an error", "1")?,
            latency: registry.register_measure(Measure::float64(
                side.metric_name(LATENCY),
                "Call latency",
                "ms",
            ))?,
            started_count: int(STARTED_COUNT, "Calls started", "1")?,
            finished_count: int(FINISHED_COUNT, "Calls finished", "1")?,
        })
    }

    /// The default view set: distributions for sizes, per-call message
    /// counts and latency, cumulative counts for errors and call
    /// starts/finishes.
    pub fn default_views(&self) -> Vec<View> {
        let by_method = || vec![KEY_METHOD, KEY_SERVICE];
        let view = |measure: &Arc<Measure>, aggregation: Aggregation, keys: Vec<TagKey>| {
            let window = match aggregation {
                Aggregation::Distribution { .. } => DISTRIBUTION_WINDOW,
                _ => Window::Cumulative,
            };
            View::new(
                measure.name(),
                measure.description(),
                Arc::clone(measure),
                aggregation,
                window,
                keys,
            )
        };

        vec![
            view(
                &self.request_bytes,
                Aggregation::distribution(BYTES_BOUNDS),
                by_method(),
            ),
            view(
                &self.response_bytes,
                Aggregation::distribution(BYTES_BOUNDS),
                by_method(),
            ),
            view(
                &self.request_count,
                Aggregation::distribution(COUNT_BOUNDS),
                by_method(),
            ),
            view(
                &self.response_count,
                Aggregation::distribution(COUNT_BOUNDS),
                by_method(),
            ),
            view(
                &self.error_count,
                Aggregation::Count,
                vec![KEY_METHOD, KEY_SERVICE, KEY_STATUS],
            ),
            view(
                &self.latency,
                Aggregation::distribution(LATENCY_MS_BOUNDS),
                by_method(),
            ),
            view(&self.started_count, Aggregation::Count, by_method()),
            view(&self.finished_count, Aggregation::Count, by_method()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert_eq!(
            Side::Server.metric_name(REQUEST_COUNT),
            "grpc.io/server/request_count"
        );
        assert_eq!(Side::Client.metric_name(LATENCY), "grpc.io/client/latency");
    }

    #[test]
    fn test_bounds_bucket_counts() {
        for bounds in [&BYTES_BOUNDS[..], &COUNT_BOUNDS[..], &LATENCY_MS_BOUNDS[..]] {
            assert!(Aggregation::distribution(bounds.to_vec()).validate().is_ok());
        }
        assert_eq!(BYTES_BOUNDS.len() + 1, 15);
        assert_eq!(COUNT_BOUNDS.len() + 1, 19);
    }

    #[test]
    fn test_register_measures_is_idempotent() {
        let registry = Registry::new();
        let first = RpcMeasures::register(&registry, Side::Server).expect("register");
        let second = RpcMeasures::register(&registry, Side::Server).expect("register again");
        assert!(Arc::ptr_eq(&first.request_bytes, &second.request_bytes));

        // Sides do not collide.
        RpcMeasures::register(&registry, Side::Client).expect("register client");
    }

    #[test]
    fn test_default_views_register() {
        let registry = Registry::new();
        let measures = RpcMeasures::register(&registry, Side::Server).expect("register");
        for view in measures.default_views() {
            registry.register_view(view).expect("register view");
        }

        let error_view = registry
            .find_view(&Side::Server.metric_name(ERROR_COUNT))
            .expect("error view");
        assert_eq!(error_view.aggregation(), &Aggregation::Count);
        assert_eq!(
            error_view.group_keys(),
            &[KEY_METHOD, KEY_SERVICE, KEY_STATUS]
        );
        assert!(error_view.window().is_cumulative());
        let latency = registry
            .find_view(&Side::Server.metric_name(LATENCY))
            .expect("latency view");
        assert_eq!(latency.window(), &DISTRIBUTION_WINDOW);
        assert_eq!(registry.registered_views().len(), 8);
    }
}
