use std::sync::Arc;

/// Numeric type of a measure's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasureKind {
    Int64,
    Float64,
}

/// Identity of a recordable quantity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Measure {
    name: String,
    description: String,
    unit: String,
    kind: MeasureKind,
}

impl Measure {
    /// Declares an integer-valued measure.
    pub fn int64(
        name: impl Into<String>,
        description: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Self::new(name, description, unit, MeasureKind::Int64)
    }

    /// Declares a floating-point measure.
    pub fn float64(
        name: impl Into<String>,
        description: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Self::new(name, description, unit, MeasureKind::Float64)
    }

    fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        unit: impl Into<String>,
        kind: MeasureKind,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            unit: unit.into(),
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn kind(&self) -> MeasureKind {
        self.kind
    }

    /// Creates a measurement of this measure.
    pub fn m(self: &Arc<Self>, value: f64) -> Measurement {
        Measurement {
            measure: Arc::clone(self),
            value,
        }
    }

    /// Creates a measurement from an integer value.
    pub fn m_int(self: &Arc<Self>, value: i64) -> Measurement {
        self.m(value as f64)
    }
}

/// A single recorded value.
#[derive(Debug, Clone)]
pub struct Measurement {
    measure: Arc<Measure>,
    value: f64,
}

impl Measurement {
    pub fn measure(&self) -> &Arc<Measure> {
        &self.measure
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}
