//! Export of view snapshots to a monitoring backend.
//!
//! [`Exporter`] receives [`ViewData`](crate::stats::ViewData) from the
//! reporter, makes sure each view has a matching metric descriptor, converts
//! rows into time series points and uploads them in bounded requests.

pub mod client;
pub mod convert;
pub mod descriptor;
pub mod error;
pub mod exporter;
pub mod health;
pub mod wire;

pub use client::{BodyEncoding, HttpMetricClient, MemoryClient, MetricClient};
pub use convert::{
    make_requests, sanitize_label, typed_value, RequestOptions, DEFAULT_METRIC_PREFIX,
    DEFAULT_RESOURCE_TYPE, MAX_TIME_SERIES_PER_UPLOAD,
};
pub use descriptor::{check_descriptor_shape, descriptor_for_view, descriptor_shape};
pub use error::{ExportError, TransportError};
pub use exporter::{ErrorHandler, Exporter, UploadReport};
pub use health::ExporterHealth;
pub use wire::{
    DistributionValue, LabelDescriptor, MetricDescriptor, MetricKind, TimeInterval,
    TimeSeriesPoint, Timestamp, TypedValue, UploadRequest, ValueType,
};
