use std::sync::Arc;
use std::time::SystemTime;

use super::aggregation::{Aggregation, Window};
use super::data::AggregationData;
use super::measure::Measure;
use crate::tag::{Tag, TagKey, TagSet};

/// A registered aggregation definition: which measure, how to summarize it,
/// over what window, grouped by which tag keys.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    name: String,
    description: String,
    measure: Arc<Measure>,
    aggregation: Aggregation,
    window: Window,
    group_keys: Vec<TagKey>,
}

impl View {
    /// Creates a view definition. Grouping keys are kept sorted; the
    /// definition is validated when registered.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        measure: Arc<Measure>,
        aggregation: Aggregation,
        window: Window,
        mut group_keys: Vec<TagKey>,
    ) -> Self {
        group_keys.sort();
        Self {
            name: name.into(),
            description: description.into(),
            measure,
            aggregation,
            window,
            group_keys,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn measure(&self) -> &Arc<Measure> {
        &self.measure
    }

    pub fn aggregation(&self) -> &Aggregation {
        &self.aggregation
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Grouping keys in sorted order.
    pub fn group_keys(&self) -> &[TagKey] {
        &self.group_keys
    }

    /// Projects a tag set onto this view's grouping keys. Keys absent from
    /// the tag set stay `None`, so the signature identifies the row.
    pub(crate) fn signature(&self, tags: &TagSet) -> Signature {
        self.group_keys
            .iter()
            .map(|k| tags.get(k).map(str::to_string))
            .collect()
    }

    /// Rebuilds a row's tags from its signature, omitting missing keys.
    pub(crate) fn tags_for(&self, signature: &Signature) -> Vec<Tag> {
        self.group_keys
            .iter()
            .zip(signature.iter())
            .filter_map(|(k, v)| v.as_ref().map(|v| Tag::new(k.clone(), v.clone())))
            .collect()
    }
}

/// Tag values of one row, aligned with the view's sorted grouping keys.
pub(crate) type Signature = Vec<Option<String>>;

/// One row of a snapshot: the grouping tags and their accumulated data.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub tags: Vec<Tag>,
    pub data: AggregationData,
}

/// Immutable snapshot of a view over `[start, end]`.
#[derive(Debug, Clone)]
pub struct ViewData {
    pub view: Arc<View>,
    pub rows: Vec<Row>,
    pub start: SystemTime,
    pub end: SystemTime,
}
