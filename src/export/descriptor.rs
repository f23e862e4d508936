//! Metric descriptor construction and schema validation.

use std::collections::BTreeSet;

use super::convert::{sanitize_label, RequestOptions};
use super::error::ExportError;
use super::wire::{LabelDescriptor, MetricDescriptor, MetricKind, ValueType};
use crate::stats::{Aggregation, View, Window};
use crate::tag::TagKey;

/// Descriptor kind and value type a view exports as. Distribution with a
/// Cumulative window has no representation and is rejected.
pub fn descriptor_shape(
    aggregation: &Aggregation,
    window: &Window,
) -> Result<(MetricKind, ValueType), String> {
    let kind = if window.is_cumulative() {
        MetricKind::Cumulative
    } else {
        MetricKind::Delta
    };

    let value_type = match aggregation {
        Aggregation::Count => ValueType::Int64,
        Aggregation::Sum => ValueType::Double,
        Aggregation::Mean => ValueType::Distribution,
        Aggregation::Distribution { .. } if window.is_cumulative() => {
            return Err(
                "distribution aggregation cannot be exported with a cumulative window".to_string(),
            );
        }
        Aggregation::Distribution { .. } => ValueType::Distribution,
    };

    Ok((kind, value_type))
}

/// Verifies that an existing descriptor matches a view's aggregation, window
/// and grouping keys. Label keys are compared as sets after sanitization.
pub fn check_descriptor_shape(
    descriptor: &MetricDescriptor,
    aggregation: &Aggregation,
    window: &Window,
    group_keys: &[TagKey],
) -> Result<(), ExportError> {
    let metric_type = &descriptor.metric_type;
    let (kind, value_type) =
        descriptor_shape(aggregation, window).map_err(|reason| {
            ExportError::UnsupportedAggregation {
                metric_type: metric_type.clone(),
                reason,
            }
        })?;

    let mismatch = |reason: String| ExportError::DescriptorMismatch {
        metric_type: metric_type.clone(),
        reason,
    };

    if descriptor.metric_kind != kind {
        return Err(mismatch(format!(
            "{} aggregation needs metric kind {kind:?}, descriptor has {:?}",
            aggregation.as_str(),
            descriptor.metric_kind
        )));
    }
    if descriptor.value_type != value_type {
        return Err(mismatch(format!(
            "{} aggregation needs value type {value_type:?}, descriptor has {:?}",
            aggregation.as_str(),
            descriptor.value_type
        )));
    }

    let want: BTreeSet<String> = group_keys.iter().map(|k| sanitize_label(k.name())).collect();
    let have: BTreeSet<String> = descriptor.labels.iter().map(|l| l.key.clone()).collect();
    if want != have {
        let missing: Vec<&String> = want.difference(&have).collect();
        let extra: Vec<&String> = have.difference(&want).collect();
        return Err(mismatch(format!(
            "label keys differ, missing {missing:?}, unexpected {extra:?}"
        )));
    }

    Ok(())
}

/// Builds the descriptor created for a view the backend does not know yet.
pub fn descriptor_for_view(
    opts: &RequestOptions,
    view: &View,
) -> Result<MetricDescriptor, ExportError> {
    let metric_type = opts.metric_type(view.name());
    let (metric_kind, value_type) = descriptor_shape(view.aggregation(), view.window())
        .map_err(|reason| ExportError::UnsupportedAggregation {
            metric_type: metric_type.clone(),
            reason,
        })?;

    let unit = match view.aggregation() {
        Aggregation::Count => "1".to_string(),
        _ => view.measure().unit().to_string(),
    };

    Ok(MetricDescriptor {
        metric_type,
        metric_kind,
        value_type,
        labels: view
            .group_keys()
            .iter()
            .map(|k| LabelDescriptor {
                key: sanitize_label(k.name()),
                description: String::new(),
            })
            .collect(),
        description: view.description().to_string(),
        unit,
        display_name: format!("OpenCensus/{}", view.name()),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::stats::Measure;

    const INTERVAL: Window = Window::Interval {
        duration: Duration::from_secs(60),
        intervals: 1,
    };

    fn key(name: &str) -> TagKey {
        TagKey::new(name).expect("key")
    }

    fn descriptor(kind: MetricKind, value_type: ValueType, labels: &[&str]) -> MetricDescriptor {
        MetricDescriptor {
            metric_type: "custom.googleapis.com/opencensus/v".to_string(),
            metric_kind: kind,
            value_type,
            labels: labels
                .iter()
                .map(|k| LabelDescriptor {
                    key: k.to_string(),
                    description: String::new(),
                })
                .collect(),
            description: String::new(),
            unit: String::new(),
            display_name: String::new(),
        }
    }

    #[test]
    fn test_shape_rules() {
        let keys = [key("test-key")];
        let cases = [
            (Aggregation::Count, Window::Cumulative, MetricKind::Cumulative, ValueType::Int64),
            (Aggregation::Sum, Window::Cumulative, MetricKind::Cumulative, ValueType::Double),
            (Aggregation::Mean, Window::Cumulative, MetricKind::Cumulative, ValueType::Distribution),
            (
                Aggregation::distribution(vec![1.0, 2.0]),
                INTERVAL,
                MetricKind::Delta,
                ValueType::Distribution,
            ),
            (Aggregation::Count, INTERVAL, MetricKind::Delta, ValueType::Int64),
        ];

        for (aggregation, window, kind, value_type) in cases {
            let md = descriptor(kind, value_type, &["test_key"]);
            check_descriptor_shape(&md, &aggregation, &window, &keys)
                .unwrap_or_else(|e| panic!("{} {window:?}: {e}", aggregation.as_str()));
        }
    }

    #[test]
    fn test_cumulative_distribution_rejected() {
        let md = descriptor(MetricKind::Cumulative, ValueType::Distribution, &[]);
        let err = check_descriptor_shape(
            &md,
            &Aggregation::distribution(vec![1.0]),
            &Window::Cumulative,
            &[],
        )
        .expect_err("must reject");
        assert!(matches!(err, ExportError::UnsupportedAggregation { .. }));
        assert!(err.is_validation());
    }

    #[test]
    fn test_kind_and_type_mismatch() {
        let md = descriptor(MetricKind::Cumulative, ValueType::Double, &[]);
        let err = check_descriptor_shape(&md, &Aggregation::Count, &Window::Cumulative, &[])
            .expect_err("type mismatch");
        assert!(matches!(err, ExportError::DescriptorMismatch { .. }));

        let md = descriptor(MetricKind::Gauge, ValueType::Int64, &[]);
        assert!(check_descriptor_shape(&md, &Aggregation::Count, &Window::Cumulative, &[]).is_err());
    }

    #[test]
    fn test_label_set_mismatch() {
        let keys = [key("a"), key("b")];
        let extra = descriptor(MetricKind::Cumulative, ValueType::Int64, &["a", "b", "c"]);
        let missing = descriptor(MetricKind::Cumulative, ValueType::Int64, &["a"]);
        let reordered = descriptor(MetricKind::Cumulative, ValueType::Int64, &["b", "a"]);

        for md in [&extra, &missing] {
            let err = check_descriptor_shape(md, &Aggregation::Count, &Window::Cumulative, &keys)
                .expect_err("label mismatch");
            assert!(err.to_string().contains("label keys differ"), "{err}");
        }
        check_descriptor_shape(&reordered, &Aggregation::Count, &Window::Cumulative, &keys)
            .expect("order does not matter");
    }

    #[test]
    fn test_descriptor_for_view() {
        let measure = Arc::new(Measure::float64("latency", "Call latency", "ms"));
        let view = View::new(
            "rpc/latency",
            "Latency per call",
            Arc::clone(&measure),
            Aggregation::distribution(vec![0.0, 10.0]),
            INTERVAL,
            vec![key("grpc.method")],
        );
        let md = descriptor_for_view(&RequestOptions::new("p"), &view).expect("descriptor");
        assert_eq!(md.metric_type, "custom.googleapis.com/opencensus/rpc/latency");
        assert_eq!(md.metric_kind, MetricKind::Delta);
        assert_eq!(md.value_type, ValueType::Distribution);
        assert_eq!(md.unit, "ms");
        assert_eq!(md.labels[0].key, "grpc_method");

        check_descriptor_shape(&md, view.aggregation(), view.window(), view.group_keys())
            .expect("created descriptor passes its own check");

        let count = View::new("calls", "", measure, Aggregation::Count, Window::Cumulative, vec![]);
        let md = descriptor_for_view(&RequestOptions::new("p"), &count).expect("descriptor");
        assert_eq!(md.unit, "1");
    }
}
