use telemetra_core::{Metric, SampleValue, TimeUuid, MAX_TIMEUUID, MIN_TIMEUUID};

/// Time-ordered rows of a single metric.
#[derive(Debug, Clone)]
pub struct Series {
    metric: Metric,
    rows: Vec<(TimeUuid, SampleValue)>,
}

impl Series {
    pub fn new(metric: Metric) -> Self {
        Series {
            metric,
            rows: Vec::new(),
        }
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[(TimeUuid, SampleValue)] {
        &self.rows
    }

    pub fn contains(&self, t: TimeUuid, value: &SampleValue) -> bool {
        self.position(t)
            .map(|idx| &self.rows[idx].1 == value)
            .unwrap_or(false)
    }

    fn position(&self, t: TimeUuid) -> Option<usize> {
        self.rows.binary_search_by(|(row_t, _)| row_t.cmp(&t)).ok()
    }

    /// Appends a row, returns `false` when `t` is already present.
    ///
    /// Rows normally arrive in order; a late row is pushed and the series is
    /// re-sorted.
    pub(crate) fn insert(&mut self, t: TimeUuid, value: SampleValue) -> bool {
        if self.position(t).is_some() {
            return false;
        }
        let out_of_order = self.rows.last().map(|(last, _)| *last > t).unwrap_or(false);
        self.rows.push((t, value));
        if out_of_order {
            self.rows.sort_by(|a, b| a.0.cmp(&b.0));
        }
        true
    }

    pub fn last_timestamp(&self) -> Option<TimeUuid> {
        self.rows.last().map(|(t, _)| *t)
    }

    /// Rows within `[start, end]`, keeping only the newest `count` when
    /// given. Always ascending.
    pub fn range(
        &self,
        start: Option<TimeUuid>,
        end: Option<TimeUuid>,
        count: Option<usize>,
    ) -> Vec<(TimeUuid, SampleValue)> {
        let start = start.unwrap_or(MIN_TIMEUUID);
        let end = end.unwrap_or(MAX_TIMEUUID);
        let lo = self.rows.partition_point(|(t, _)| *t < start);
        let hi = self.rows.partition_point(|(t, _)| *t <= end);
        if lo >= hi {
            return Vec::new();
        }
        let window = &self.rows[lo..hi];
        let skip = count
            .map(|count| window.len().saturating_sub(count))
            .unwrap_or(0);
        window[skip..].to_vec()
    }

    /// Drops rows strictly older than `cutoff`, returns how many went.
    pub(crate) fn purge_before(&mut self, cutoff: TimeUuid) -> usize {
        let keep_from = self.rows.partition_point(|(t, _)| *t < cutoff);
        self.rows.drain(..keep_from).count()
    }

    /// Timestamp of the `count`-th newest row, or the lowest id when fewer
    /// rows exist. A zero count does not hold anything back.
    pub(crate) fn count_cutoff(&self, count: u64) -> TimeUuid {
        if count == 0 {
            return MAX_TIMEUUID;
        }
        let count = usize::try_from(count).unwrap_or(usize::MAX);
        if self.rows.len() < count {
            return MIN_TIMEUUID;
        }
        self.rows[self.rows.len() - count].0
    }
}
