use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::aggregation::Window;
use super::data::AggregationData;
use super::error::StatsError;
use super::interval::{IntervalClock, IntervalRow};
use super::measure::{Measure, Measurement};
use super::view::{Row, Signature, View, ViewData};
use crate::tag::{context, TagSet};

/// Owns registered measures, views and every row's accumulator.
///
/// Recording takes the view index read lock only long enough to clone the
/// subscriber lists of its measures. Row updates then go through the row
/// arena of each view, where every row has its own mutex, so unrelated rows
/// and views never serialize on each other. Snapshots read rows under those
/// same mutexes and never modify them.
pub struct Registry {
    measures: RwLock<HashMap<String, Arc<Measure>>>,
    views: RwLock<ViewIndex>,
}

#[derive(Default)]
struct ViewIndex {
    by_name: HashMap<String, Arc<ViewState>>,
    by_measure: HashMap<String, Arc<[Arc<ViewState>]>>,
    /// Measures whose last view was unregistered. Recording them is misuse.
    unsubscribed: HashSet<String>,
}

struct ViewState {
    view: Arc<View>,
    registered_at: SystemTime,
    /// Set for interval windows.
    clock: Option<IntervalClock>,
    rows: DashMap<Signature, Mutex<RowData>>,
}

enum RowData {
    Cumulative(AggregationData),
    Interval(IntervalRow),
}

impl RowData {
    #[inline]
    fn update(&mut self, slot: u64, value: f64) {
        match self {
            Self::Cumulative(data) => data.update(value),
            Self::Interval(row) => row.update(slot, value),
        }
    }

    fn read(&self, slot: u64) -> Option<AggregationData> {
        match self {
            Self::Cumulative(data) => Some(data.snapshot()),
            Self::Interval(row) => row.read(slot),
        }
    }
}

impl ViewState {
    fn new(view: View) -> Self {
        let registered_at = SystemTime::now();
        let clock = match *view.window() {
            Window::Cumulative => None,
            Window::Interval {
                duration,
                intervals,
            } => Some(IntervalClock::new(
                Instant::now(),
                registered_at,
                duration,
                intervals,
            )),
        };
        Self {
            view: Arc::new(view),
            registered_at,
            clock,
            rows: DashMap::with_capacity(16),
        }
    }

    fn new_row(&self) -> RowData {
        match &self.clock {
            None => RowData::Cumulative(AggregationData::new(self.view.aggregation())),
            Some(clock) => {
                RowData::Interval(IntervalRow::new(self.view.aggregation(), clock.intervals()))
            }
        }
    }

    fn current_slot(&self) -> u64 {
        self.clock
            .as_ref()
            .map_or(0, |clock| clock.slot_at(Instant::now()))
    }

    #[inline]
    fn record(&self, tags: &TagSet, value: f64) {
        let signature = self.view.signature(tags);
        let slot = self.current_slot();

        // Fast path: row already exists.
        if let Some(row) = self.rows.get(&signature) {
            row.lock().update(slot, value);
            return;
        }

        let row = self
            .rows
            .entry(signature)
            .or_insert_with(|| Mutex::new(self.new_row()));
        row.lock().update(slot, value);
    }

    /// Copies every row under its own lock. Interval rows with nothing
    /// inside the window are left out of the snapshot but stay live.
    fn snapshot(&self, now: SystemTime) -> ViewData {
        let slot = self.current_slot();

        let mut rows: Vec<Row> = self
            .rows
            .iter()
            .filter_map(|entry| {
                let data = entry.value().lock().read(slot)?;
                Some(Row {
                    tags: self.view.tags_for(entry.key()),
                    data,
                })
            })
            .collect();
        rows.sort_by(|a, b| a.tags.cmp(&b.tags));

        let start = match &self.clock {
            None => self.registered_at,
            Some(clock) => clock.window_start(slot).min(now),
        };

        ViewData {
            view: Arc::clone(&self.view),
            rows,
            start,
            end: now,
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            measures: RwLock::new(HashMap::new()),
            views: RwLock::new(ViewIndex::default()),
        }
    }

    /// Registers a measure. Registering an identical definition again
    /// returns the existing instance.
    pub fn register_measure(&self, measure: Measure) -> Result<Arc<Measure>, StatsError> {
        let name = measure.name();
        if name.is_empty() || name.len() > crate::tag::MAX_LEN || !name.is_ascii() {
            return Err(StatsError::InvalidMeasure {
                name: name.to_string(),
            });
        }

        let mut measures = self.measures.write();
        if let Some(existing) = measures.get(name) {
            if **existing == measure {
                return Ok(Arc::clone(existing));
            }
            return Err(StatsError::DuplicateMeasure {
                name: name.to_string(),
            });
        }

        let measure = Arc::new(measure);
        measures.insert(measure.name().to_string(), Arc::clone(&measure));
        tracing::debug!(measure = measure.name(), "measure registered");

        Ok(measure)
    }

    pub fn find_measure(&self, name: &str) -> Option<Arc<Measure>> {
        self.measures.read().get(name).cloned()
    }

    /// Removes a measure that no registered view uses.
    pub fn delete_measure(&self, name: &str) -> Result<(), StatsError> {
        // Held across the removal so a concurrent view registration either
        // sees the measure gone or blocks the delete.
        let mut index = self.views.write();
        if let Some(subscribers) = index.by_measure.get(name) {
            if let Some(state) = subscribers.first() {
                return Err(StatsError::MeasureInUse {
                    name: name.to_string(),
                    view: state.view.name().to_string(),
                });
            }
        }

        if self.measures.write().remove(name).is_none() {
            return Err(StatsError::MeasureNotRegistered {
                name: name.to_string(),
            });
        }
        index.unsubscribed.remove(name);

        Ok(())
    }

    /// Registers a view and subscribes it to its measure.
    ///
    /// Re-registering an equal definition is a no-op; a different definition
    /// under a registered name fails with [`StatsError::ViewNameCollision`].
    pub fn register_view(&self, view: View) -> Result<(), StatsError> {
        validate_view(&view)?;

        let mut index = self.views.write();
        self.check_measure(view.measure())?;

        if let Some(existing) = index.by_name.get(view.name()) {
            if *existing.view == view {
                return Ok(());
            }
            return Err(StatsError::ViewNameCollision {
                name: view.name().to_string(),
            });
        }

        let state = Arc::new(ViewState::new(view));
        let measure_name = state.view.measure().name().to_string();

        let mut subscribers: Vec<Arc<ViewState>> = index
            .by_measure
            .get(&measure_name)
            .map(|s| s.to_vec())
            .unwrap_or_default();
        subscribers.push(Arc::clone(&state));
        index.unsubscribed.remove(&measure_name);
        index.by_measure.insert(measure_name, subscribers.into());
        index
            .by_name
            .insert(state.view.name().to_string(), Arc::clone(&state));

        tracing::debug!(
            view = state.view.name(),
            measure = state.view.measure().name(),
            aggregation = state.view.aggregation().as_str(),
            "view registered",
        );

        Ok(())
    }

    /// Unregisters a view and discards its rows. Snapshots already taken
    /// stay valid.
    pub fn unregister_view(&self, name: &str) -> Result<(), StatsError> {
        let mut index = self.views.write();
        let Some(state) = index.by_name.remove(name) else {
            return Err(StatsError::ViewNotRegistered {
                name: name.to_string(),
            });
        };

        let measure_name = state.view.measure().name();
        let remaining: Vec<Arc<ViewState>> = index
            .by_measure
            .get(measure_name)
            .map(|s| {
                s.iter()
                    .filter(|v| !Arc::ptr_eq(v, &state))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if remaining.is_empty() {
            index.by_measure.remove(measure_name);
            index.unsubscribed.insert(measure_name.to_string());
        } else {
            index
                .by_measure
                .insert(measure_name.to_string(), remaining.into());
        }

        tracing::debug!(view = name, rows = state.rows.len(), "view unregistered");

        Ok(())
    }

    pub fn find_view(&self, name: &str) -> Option<Arc<View>> {
        self.views
            .read()
            .by_name
            .get(name)
            .map(|s| Arc::clone(&s.view))
    }

    /// All registered views, sorted by name.
    pub fn registered_views(&self) -> Vec<Arc<View>> {
        let mut views: Vec<Arc<View>> = self
            .views
            .read()
            .by_name
            .values()
            .map(|s| Arc::clone(&s.view))
            .collect();
        views.sort_by(|a, b| a.name().cmp(b.name()));
        views
    }

    /// Records measurements under `tags` into every subscribed view.
    ///
    /// Every measure must be registered, and a measure whose views were all
    /// unregistered is rejected with [`StatsError::MeasureUnsubscribed`]. A
    /// rejected batch records nothing.
    pub fn record(&self, tags: &TagSet, measurements: &[Measurement]) -> Result<(), StatsError> {
        for m in measurements {
            self.check_measure(m.measure())?;
        }

        let targets: Vec<Option<Arc<[Arc<ViewState>]>>> = {
            let index = self.views.read();
            measurements
                .iter()
                .map(|m| {
                    let name = m.measure().name();
                    match index.by_measure.get(name) {
                        Some(subscribers) => Ok(Some(Arc::clone(subscribers))),
                        None if index.unsubscribed.contains(name) => {
                            Err(StatsError::MeasureUnsubscribed {
                                name: name.to_string(),
                            })
                        }
                        None => Ok(None),
                    }
                })
                .collect::<Result<_, _>>()?
        };

        for (m, subscribers) in measurements.iter().zip(targets) {
            for state in subscribers.iter().flat_map(|s| s.iter()) {
                state.record(tags, m.value());
            }
        }

        Ok(())
    }

    /// Records measurements under the tag set of the current scope.
    pub fn record_current(&self, measurements: &[Measurement]) -> Result<(), StatsError> {
        self.record(&context::current(), measurements)
    }

    /// Snapshots one view.
    pub fn retrieve_data(&self, name: &str) -> Result<ViewData, StatsError> {
        let state = self
            .views
            .read()
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| StatsError::ViewNotRegistered {
                name: name.to_string(),
            })?;

        Ok(state.snapshot(SystemTime::now()))
    }

    /// Snapshots every registered view, sorted by view name.
    pub fn retrieve_all(&self) -> Vec<ViewData> {
        let mut states: Vec<Arc<ViewState>> =
            self.views.read().by_name.values().cloned().collect();
        states.sort_by(|a, b| a.view.name().cmp(b.view.name()));

        let now = SystemTime::now();
        states.iter().map(|s| s.snapshot(now)).collect()
    }

    fn check_measure(&self, measure: &Arc<Measure>) -> Result<(), StatsError> {
        match self.measures.read().get(measure.name()) {
            Some(registered) if Arc::ptr_eq(registered, measure) || **registered == **measure => {
                Ok(())
            }
            _ => Err(StatsError::MeasureNotRegistered {
                name: measure.name().to_string(),
            }),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_view(view: &View) -> Result<(), StatsError> {
    if view.name().is_empty() || view.name().len() > crate::tag::MAX_LEN {
        return Err(StatsError::InvalidView {
            name: view.name().to_string(),
            reason: "name must be 1-255 bytes".to_string(),
        });
    }

    if let Some(pair) = view.group_keys().windows(2).find(|w| w[0] == w[1]) {
        return Err(StatsError::InvalidView {
            name: view.name().to_string(),
            reason: format!("duplicate grouping key {}", pair[0]),
        });
    }

    view.aggregation()
        .validate()
        .map_err(|reason| StatsError::InvalidAggregation {
            view: view.name().to_string(),
            reason,
        })?;

    view.window()
        .validate()
        .map_err(|reason| StatsError::InvalidWindow {
            view: view.name().to_string(),
            reason,
        })?;

    Ok(())
}
