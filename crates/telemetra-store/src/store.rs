//! Per-owner in-memory sample store.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use telemetra_core::{
    DataRequirements, Metric, MetricKind, Sample, SampleValue, TimeUuid, MAX_TIMEUUID,
    MIN_TIMEUUID,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::series::Series;

pub const DEFAULT_REQUIREMENTS: DataRequirements = DataRequirements {
    past_delta: Some(Duration::from_secs(10 * 60)),
    past_count: Some(2),
};

pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{uri} holds {stored} samples, got a {given} sample")]
    KindMismatch {
        uri: String,
        stored: MetricKind,
        given: MetricKind,
    },
}

#[derive(Default)]
struct StoreState {
    series: HashMap<String, Series>,
    requirements: HashMap<String, DataRequirements>,
    hooked: HashMap<String, Metric>,
    synced: HashSet<String>,
    last_maintenance: Option<Instant>,
}

/// Samples of every metric an agent has seen, keyed by global uri.
///
/// Reads hand out copies, so callers never hold the lock across awaits.
pub struct LocalStore {
    owner: String,
    maintenance_interval: Duration,
    default_reqs: Mutex<DataRequirements>,
    state: Mutex<StoreState>,
}

impl LocalStore {
    pub fn new(owner: impl Into<String>) -> Self {
        Self::with_maintenance_interval(owner, DEFAULT_MAINTENANCE_INTERVAL)
    }

    pub fn with_maintenance_interval(owner: impl Into<String>, interval: Duration) -> Self {
        LocalStore {
            owner: owner.into(),
            maintenance_interval: interval,
            default_reqs: Mutex::new(DEFAULT_REQUIREMENTS),
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn key(&self, metric: &Metric) -> String {
        metric.global_uri(&self.owner)
    }

    /// Stores a sample; `Ok(false)` means the series already holds a row at
    /// that timestamp. The first write at a timestamp wins.
    pub fn insert(&self, sample: &Sample) -> Result<bool, StoreError> {
        let key = self.key(sample.metric());
        let mut state = self.state.lock();
        let series = state
            .series
            .entry(key.clone())
            .or_insert_with(|| Series::new(sample.metric().clone()));
        let stored = series.metric().kind();
        if stored != sample.metric().kind() {
            return Err(StoreError::KindMismatch {
                uri: key,
                stored,
                given: sample.metric().kind(),
            });
        }
        if series.insert(sample.t(), sample.value().clone()) {
            return Ok(true);
        }
        if !series.contains(sample.t(), sample.value()) {
            debug!(uri = %key, t = %sample.t(), "store.conflicting_write_ignored");
        }
        Ok(false)
    }

    pub fn is_in(&self, metric: &Metric, t: TimeUuid, value: &SampleValue) -> bool {
        let key = self.key(metric);
        self.state
            .lock()
            .series
            .get(&key)
            .map(|series| series.metric().kind() == metric.kind() && series.contains(t, value))
            .unwrap_or(false)
    }

    /// Rows of `metric` between `start` and `end`, oldest first. Without any
    /// bound only the latest row is returned.
    pub fn get_series(
        &self,
        metric: &Metric,
        end: Option<TimeUuid>,
        start: Option<TimeUuid>,
        count: Option<usize>,
    ) -> Vec<(TimeUuid, SampleValue)> {
        let count = match (start, end, count) {
            (None, None, None) => Some(1),
            (_, _, count) => count,
        };
        let key = self.key(metric);
        self.state
            .lock()
            .series
            .get(&key)
            .filter(|series| series.metric().kind() == metric.kind())
            .map(|series| series.range(start, end, count))
            .unwrap_or_default()
    }

    pub fn len(&self, metric: &Metric) -> usize {
        let key = self.key(metric);
        self.state
            .lock()
            .series
            .get(&key)
            .map(Series::len)
            .unwrap_or(0)
    }

    pub fn last_timestamp(&self, metric: &Metric) -> Option<TimeUuid> {
        let key = self.key(metric);
        self.state
            .lock()
            .series
            .get(&key)
            .and_then(Series::last_timestamp)
    }

    /// Raises the retention of `metric`; repeated calls keep the maximum.
    pub fn set_requirements(&self, metric: &Metric, reqs: DataRequirements) {
        let key = self.key(metric);
        let mut state = self.state.lock();
        let merged = state
            .requirements
            .get(&key)
            .map(|current| current.merge(&reqs))
            .unwrap_or(reqs);
        state.requirements.insert(key, merged);
    }

    pub fn requirements(&self, metric: &Metric) -> DataRequirements {
        let key = self.key(metric);
        self.state
            .lock()
            .requirements
            .get(&key)
            .copied()
            .filter(|reqs| !reqs.is_empty())
            .unwrap_or_else(|| self.default_reqs())
    }

    pub fn default_reqs(&self) -> DataRequirements {
        *self.default_reqs.lock()
    }

    pub fn set_default_reqs(&self, reqs: DataRequirements) {
        *self.default_reqs.lock() = reqs;
    }

    pub fn purge(&self) -> usize {
        self.purge_at(TimeUuid::now())
    }

    /// Drops rows outside the retention window of their series.
    ///
    /// The age bound and the row-count bound each yield a cutoff and the
    /// earlier one applies, so a row survives if either bound keeps it.
    pub fn purge_at(&self, now: TimeUuid) -> usize {
        let defaults = self.default_reqs();
        let mut state = self.state.lock();
        let StoreState {
            series: all_series,
            requirements,
            ..
        } = &mut *state;
        let mut purged = 0;
        for (key, series) in all_series.iter_mut() {
            let reqs = requirements
                .get(key)
                .copied()
                .filter(|reqs| !reqs.is_empty())
                .unwrap_or(defaults);
            let age_cutoff = reqs
                .past_delta
                .map(|delta| age_cutoff(now, delta))
                .unwrap_or(MAX_TIMEUUID);
            let count_cutoff = reqs
                .past_count
                .map(|count| series.count_cutoff(count))
                .unwrap_or(MAX_TIMEUUID);
            let removed = series.purge_before(age_cutoff.min(count_cutoff));
            if removed > 0 {
                debug!(uri = %key, removed, "store.series_purged");
            }
            purged += removed;
        }
        all_series.retain(|_, series| !series.is_empty());
        state.last_maintenance = Some(Instant::now());
        if purged > 0 {
            info!(owner = %self.owner, purged, "store.purged");
        }
        purged
    }

    /// Purges unless the last run was less than the maintenance interval ago.
    pub fn maybe_purge(&self) -> Option<usize> {
        let due = self
            .state
            .lock()
            .last_maintenance
            .map(|last| last.elapsed() >= self.maintenance_interval)
            .unwrap_or(true);
        due.then(|| self.purge())
    }

    /// Remembers a subscribed metric so it can be resynced after reconnects.
    pub fn mark_hooked(&self, metric: &Metric) {
        let key = self.key(metric);
        self.state.lock().hooked.insert(key, metric.clone());
    }

    pub fn mark_unhooked(&self, metric: &Metric) {
        let key = self.key(metric);
        let mut state = self.state.lock();
        state.hooked.remove(&key);
        state.synced.remove(&key);
    }

    pub fn is_hooked(&self, metric: &Metric) -> bool {
        let key = self.key(metric);
        self.state.lock().hooked.contains_key(&key)
    }

    pub fn hooked_metrics(&self) -> Vec<Metric> {
        self.state.lock().hooked.values().cloned().collect()
    }

    /// Called when the link drops: nothing is known to be current anymore.
    pub fn mark_unsynced(&self) {
        let mut state = self.state.lock();
        let count = state.synced.len();
        state.synced.clear();
        debug!(owner = %self.owner, count, "store.marked_unsynced");
    }

    pub fn mark_synced(&self, metric: &Metric) {
        let key = self.key(metric);
        self.state.lock().synced.insert(key);
    }

    pub fn is_synced(&self, metric: &Metric) -> bool {
        let key = self.key(metric);
        self.state.lock().synced.contains(&key)
    }

    /// Hooked metrics that need a resync, with their newest stored row.
    pub fn unsynced_metrics(&self) -> Vec<(Metric, Option<TimeUuid>)> {
        let state = self.state.lock();
        let mut pending: Vec<_> = state
            .hooked
            .iter()
            .filter(|(key, _)| !state.synced.contains(*key))
            .map(|(key, metric)| {
                let last = state.series.get(key).and_then(Series::last_timestamp);
                (metric.clone(), last)
            })
            .collect();
        pending.sort_by(|a, b| a.0.uri().cmp(b.0.uri()));
        pending
    }
}

fn age_cutoff(now: TimeUuid, delta: Duration) -> TimeUuid {
    let delta = i64::try_from(delta.as_micros()).unwrap_or(i64::MAX);
    TimeUuid::lowest(now.timestamp_micros().saturating_sub(delta)).unwrap_or(MIN_TIMEUUID)
}
