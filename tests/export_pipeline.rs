//! Registry snapshots flowing through the exporter into an in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use viewstat::config::ExporterConfig;
use viewstat::export::{
    ErrorHandler, ExportError, Exporter, ExporterHealth, LabelDescriptor, MemoryClient,
    MetricDescriptor, MetricKind, TransportError, TypedValue, ValueType,
};
use viewstat::stats::{
    Aggregation, Measure, Registry, Reporter, View, ViewData, ViewExporter, Window,
};
use viewstat::tag::{TagKey, TagSet};

const INTERVAL: Window = Window::Interval {
    duration: Duration::from_secs(60),
    intervals: 1,
};

fn config() -> ExporterConfig {
    ExporterConfig {
        project_id: "test-project".to_string(),
        bundle_delay: Duration::from_millis(10),
        upload_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn key() -> TagKey {
    TagKey::new("test-key").expect("key")
}

/// Registers a view over a fresh int measure and records one value per tag
/// value.
fn populated_view(
    registry: &Registry,
    name: &str,
    aggregation: Aggregation,
    window: Window,
    tag_values: usize,
) -> ViewData {
    let measure = registry
        .register_measure(Measure::int64(format!("{name}/measure"), "", "By"))
        .expect("measure");
    registry
        .register_view(View::new(
            name,
            "test view",
            Arc::clone(&measure),
            aggregation,
            window,
            vec![key()],
        ))
        .expect("view");

    for i in 0..tag_values {
        let tags = TagSet::new().with(key(), format!("v{i}")).expect("tags");
        registry
            .record(&tags, &[measure.m_int(i as i64 + 1)])
            .expect("record");
    }

    registry.retrieve_data(name).expect("retrieve")
}

fn collect_errors() -> (ErrorHandler, Arc<Mutex<Vec<ExportError>>>) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let handler: ErrorHandler = Arc::new(move |e: &ExportError| sink.lock().push(e.clone()));
    (handler, errors)
}

#[tokio::test]
async fn batches_points_into_bounded_requests() {
    let registry = Registry::new();
    let data = populated_view(&registry, "batched", Aggregation::Count, Window::Cumulative, 7);

    let client = Arc::new(MemoryClient::new());
    let cfg = ExporterConfig {
        max_time_series_per_request: 3,
        ..config()
    };
    let exporter = Exporter::new(cfg, Arc::clone(&client));

    let report = exporter.upload(vec![data]).await;
    assert_eq!(report.views, 1);
    assert_eq!(report.requests_sent, 3);
    assert_eq!(report.requests_failed, 0);
    assert_eq!(report.points, 7);

    let mut sizes: Vec<usize> = client
        .requests()
        .iter()
        .map(|r| r.time_series.len())
        .collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![1, 3, 3]);

    for request in client.requests() {
        assert_eq!(request.target, "projects/test-project");
        for point in &request.time_series {
            assert_eq!(point.metric_type, "custom.googleapis.com/opencensus/batched");
            assert_eq!(point.resource_type, "global");
            assert!(point.labels.contains_key("test_key"));
            assert_eq!(point.value, TypedValue::Int64Value(1));
        }
    }
}

#[tokio::test]
async fn creates_missing_descriptor() {
    let registry = Registry::new();
    let data = populated_view(
        &registry,
        "latency",
        Aggregation::distribution(vec![5.0, 10.0]),
        INTERVAL,
        2,
    );

    let client = Arc::new(MemoryClient::new());
    let exporter = Exporter::new(config(), Arc::clone(&client));
    let report = exporter.upload(vec![data]).await;
    assert_eq!(report.requests_sent, 1);
    assert_eq!(client.descriptors_created(), 1);

    let md = client
        .descriptor("custom.googleapis.com/opencensus/latency")
        .expect("descriptor created");
    assert_eq!(md.metric_kind, MetricKind::Delta);
    assert_eq!(md.value_type, ValueType::Distribution);
    assert_eq!(md.unit, "By");
    assert_eq!(md.labels.len(), 1);
    assert_eq!(md.labels[0].key, "test_key");

    let point = &client.requests()[0].time_series[0];
    let TypedValue::DistributionValue(dv) = &point.value else {
        panic!("expected distribution value");
    };
    assert_eq!(dv.bucket_bounds, vec![5.0, 10.0]);
    assert_eq!(dv.bucket_counts, vec![2, 0, 0]);
}

#[tokio::test]
async fn mismatched_descriptor_skips_only_that_view() {
    let registry = Registry::new();
    let good = populated_view(&registry, "good", Aggregation::Count, Window::Cumulative, 1);
    let bad = populated_view(&registry, "bad", Aggregation::Count, Window::Cumulative, 1);

    let client = Arc::new(MemoryClient::new());
    client.insert_descriptor(MetricDescriptor {
        metric_type: "custom.googleapis.com/opencensus/bad".to_string(),
        metric_kind: MetricKind::Cumulative,
        value_type: ValueType::Int64,
        labels: vec![LabelDescriptor {
            key: "other_key".to_string(),
            description: String::new(),
        }],
        description: String::new(),
        unit: "1".to_string(),
        display_name: String::new(),
    });

    let (on_error, errors) = collect_errors();
    let health = Arc::new(ExporterHealth::new(":0").expect("health"));
    let exporter = Exporter::with_hooks(
        config(),
        Arc::clone(&client),
        Some(on_error),
        Some(Arc::clone(&health)),
    );

    let report = exporter.upload(vec![bad, good]).await;
    assert_eq!(report.views_skipped, 1);
    assert_eq!(report.points, 1);

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(
        matches!(&errors[0], ExportError::DescriptorMismatch { metric_type, .. }
            if metric_type.ends_with("/bad")),
        "{:?}",
        errors[0]
    );
    assert_eq!(health.validation_errors.get(), 1.0);

    let uploaded: Vec<String> = client
        .requests()
        .iter()
        .flat_map(|r| r.time_series.iter().map(|p| p.metric_type.clone()))
        .collect();
    assert_eq!(uploaded, vec!["custom.googleapis.com/opencensus/good".to_string()]);
}

#[tokio::test]
async fn cumulative_distribution_rejected_before_network() {
    let registry = Registry::new();
    let data = populated_view(
        &registry,
        "cumulative_dist",
        Aggregation::distribution(vec![1.0, 2.0]),
        Window::Cumulative,
        1,
    );

    let client = Arc::new(MemoryClient::new());
    let (on_error, errors) = collect_errors();
    let exporter = Exporter::with_hooks(config(), Arc::clone(&client), Some(on_error), None);

    let report = exporter.upload(vec![data]).await;
    assert_eq!(report.views_skipped, 1);
    assert_eq!(report.requests_sent, 0);
    assert_eq!(client.descriptor_lookups(), 0);
    assert!(client.requests().is_empty());

    let errors = errors.lock();
    assert!(matches!(
        errors[0],
        ExportError::UnsupportedAggregation { .. }
    ));
    assert!(errors[0].is_validation());
}

#[tokio::test]
async fn failed_request_does_not_stop_the_others() {
    let registry = Registry::new();
    let data = populated_view(&registry, "partial", Aggregation::Sum, Window::Cumulative, 6);

    let client = Arc::new(MemoryClient::new());
    client.fail_next(1);
    let (on_error, errors) = collect_errors();
    let health = Arc::new(ExporterHealth::new(":0").expect("health"));
    let cfg = ExporterConfig {
        max_time_series_per_request: 2,
        workers: 1,
        ..config()
    };
    let exporter = Exporter::with_hooks(
        cfg,
        Arc::clone(&client),
        Some(on_error),
        Some(Arc::clone(&health)),
    );

    let report = exporter.upload(vec![data]).await;
    assert_eq!(report.requests_sent, 2);
    assert_eq!(report.requests_failed, 1);
    assert_eq!(report.points, 4);
    assert_eq!(client.requests().len(), 2);

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        ExportError::Transport {
            source: TransportError::Status { status: 503, .. },
            ..
        }
    ));
    assert_eq!(health.requests_sent.get(), 2.0);
    assert_eq!(health.points_exported.get(), 4.0);
    assert_eq!(
        health.request_errors.with_label_values(&["transport"]).get(),
        1.0
    );
}

#[tokio::test]
async fn slow_upload_times_out() {
    let registry = Registry::new();
    let data = populated_view(&registry, "slow", Aggregation::Count, Window::Cumulative, 1);

    let client = Arc::new(MemoryClient::new().with_latency(Duration::from_millis(500)));
    let (on_error, errors) = collect_errors();
    let cfg = ExporterConfig {
        upload_timeout: Duration::from_millis(20),
        ..config()
    };
    let exporter = Exporter::with_hooks(cfg, Arc::clone(&client), Some(on_error), None);

    let report = exporter.upload(vec![data]).await;
    assert_eq!(report.requests_failed, 1);
    assert_eq!(errors.lock()[0].kind(), "timeout");
}

#[tokio::test]
async fn empty_snapshot_uploads_nothing() {
    let registry = Registry::new();
    let data = populated_view(&registry, "empty", Aggregation::Count, Window::Cumulative, 0);

    let client = Arc::new(MemoryClient::new());
    let exporter = Exporter::new(config(), Arc::clone(&client));
    let report = exporter.upload(vec![data]).await;

    assert_eq!(report.requests_sent, 0);
    assert!(client.requests().is_empty());
}

#[tokio::test]
async fn reporter_feeds_exporter() {
    let registry = Arc::new(Registry::new());
    populated_view(&registry, "reported", Aggregation::Count, Window::Cumulative, 2);
    // A view without rows reports nothing.
    populated_view(&registry, "idle", Aggregation::Count, INTERVAL, 0);

    let client = Arc::new(MemoryClient::new());
    let exporter = Arc::new(Exporter::new(config(), Arc::clone(&client)));
    exporter.start(CancellationToken::new()).expect("start");

    let reporter = Reporter::new(Arc::clone(&registry), Duration::from_secs(60));
    reporter.register_exporter(exporter.clone());
    assert_eq!(reporter.report_once(), 1);

    exporter.flush().await.expect("flush");
    let requests = client.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].time_series.len(), 2);

    exporter.stop().await.expect("stop");
}

#[tokio::test]
async fn full_queue_is_reported() {
    let registry = Registry::new();
    let data = populated_view(&registry, "queued", Aggregation::Count, Window::Cumulative, 1);

    let client = Arc::new(MemoryClient::new().with_latency(Duration::from_millis(300)));
    let (on_error, errors) = collect_errors();
    let cfg = ExporterConfig {
        max_queue_size: 1,
        ..config()
    };
    let exporter = Arc::new(Exporter::with_hooks(
        cfg,
        Arc::clone(&client),
        Some(on_error),
        None,
    ));
    exporter.start(CancellationToken::new()).expect("start");

    // Keep the accumulator busy waiting on a slow upload.
    exporter.export_view(data.clone());
    let flusher = {
        let exporter = Arc::clone(&exporter);
        tokio::spawn(async move { exporter.flush().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    exporter.export_view(data.clone());
    exporter.export_view(data);

    flusher.await.expect("join").expect("flush");
    exporter.stop().await.expect("stop");

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], ExportError::QueueFull { view } if view == "queued"));
}
