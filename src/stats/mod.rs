//! Measures, views and the aggregation engine.
//!
//! Measurements recorded through the [`Registry`] are folded into the rows of
//! every view subscribed to their measure. Rows are keyed by the recorded tag
//! values of the view's grouping keys; [`Registry::retrieve_data`] produces
//! immutable [`ViewData`] snapshots for export.

pub mod aggregation;
pub mod data;
pub mod error;
mod interval;
pub mod measure;
pub mod registry;
pub mod reporter;
pub mod view;

pub use aggregation::{bucket_index, Aggregation, Window};
pub use data::{AggregationData, CountData, DistributionData, MeanData, SumData};
pub use error::StatsError;
pub use measure::{Measure, MeasureKind, Measurement};
pub use registry::Registry;
pub use reporter::{Reporter, ViewExporter};
pub use view::{Row, View, ViewData};
