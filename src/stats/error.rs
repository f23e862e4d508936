use thiserror::Error;

/// Errors reported by the measure and view registry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("invalid measure name {name:?}")]
    InvalidMeasure { name: String },

    #[error("measure {name} is already registered with a different definition")]
    DuplicateMeasure { name: String },

    #[error("measure {name} is not registered")]
    MeasureNotRegistered { name: String },

    #[error("measure {name} is recorded after all of its views were unregistered")]
    MeasureUnsubscribed { name: String },

    #[error("measure {name} is still used by view {view}")]
    MeasureInUse { name: String, view: String },

    #[error("invalid view {name:?}: {reason}")]
    InvalidView { name: String, reason: String },

    #[error("view {view}: invalid aggregation: {reason}")]
    InvalidAggregation { view: String, reason: String },

    #[error("view {view}: invalid window: {reason}")]
    InvalidWindow { view: String, reason: String },

    #[error("a different view is already registered under the name {name}")]
    ViewNameCollision { name: String },

    #[error("view {name} is not registered")]
    ViewNotRegistered { name: String },
}
