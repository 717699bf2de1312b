use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::validation::{validate_uri, validate_uri_level, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Datasource,
    Datapoint,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Datasource => "datasource",
            MetricKind::Datapoint => "datapoint",
        }
    }
}

impl FromStr for MetricKind {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "datasource" => Ok(MetricKind::Datasource),
            "datapoint" => Ok(MetricKind::Datapoint),
            other => Err(ValidationError::Field {
                field: "type",
                reason: format!("unknown metric type {other:?}"),
            }),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time series identified by its kind and uri.
///
/// Equality and hashing use the normalized uri, so `Alice:cpu` and
/// `alice:cpu` name the same series while `cpu` and `CPU` do not.
#[derive(Debug, Clone)]
pub struct Metric {
    kind: MetricKind,
    uri: String,
    normalized: String,
}

impl Metric {
    pub fn new(kind: MetricKind, uri: impl Into<String>) -> Result<Self, ValidationError> {
        let uri = uri.into();
        validate_uri(&uri)?;
        let normalized = normalize_uri(&uri);
        Ok(Metric {
            kind,
            uri,
            normalized,
        })
    }

    pub fn datasource(uri: impl Into<String>) -> Result<Self, ValidationError> {
        Metric::new(MetricKind::Datasource, uri)
    }

    pub fn datapoint(uri: impl Into<String>) -> Result<Self, ValidationError> {
        Metric::new(MetricKind::Datapoint, uri)
    }

    /// Datapoint carrying anomaly flags for `metric`.
    pub fn anomaly(metric: &Metric) -> Result<Self, ValidationError> {
        Metric::datapoint(format!("{}._anomaly", metric.uri))
    }

    /// Datapoint tagging `metric` with a `key`/`value` pair.
    pub fn tag(metric: &Metric, key: &str, value: &str) -> Result<Self, ValidationError> {
        validate_uri_level(key)?;
        validate_uri_level(value)?;
        Metric::datapoint(format!("{}._tag.{key}.{value}", metric.uri))
    }

    pub fn filter(metric: &Metric, key: &str) -> Result<Self, ValidationError> {
        validate_uri_level(key)?;
        Metric::datapoint(format!("{}._filter.{key}", metric.uri))
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_global(&self) -> bool {
        self.uri.contains(':')
    }

    pub fn global_uri(&self, owner: &str) -> String {
        global_uri(&self.uri, owner)
    }
}

impl PartialEq for Metric {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.normalized == other.normalized
    }
}

impl Eq for Metric {}

impl Hash for Metric {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.normalized.hash(state);
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.uri)
    }
}

/// Lower-cases the owner segment of a global uri; local uris are returned
/// untouched.
pub fn normalize_uri(uri: &str) -> String {
    match uri.split_once(':') {
        Some((owner, local)) => format!("{}:{}", owner.to_lowercase(), local),
        None => uri.to_string(),
    }
}

/// Resolves `uri` against `owner`: local uris get the owner prefix, global
/// ones keep their owner.
pub fn global_uri(uri: &str, owner: &str) -> String {
    if uri.contains(':') {
        normalize_uri(uri)
    } else {
        format!("{}:{}", owner.to_lowercase(), uri)
    }
}

/// Retention hint for one series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataRequirements {
    pub past_delta: Option<Duration>,
    /// Rows kept regardless of age.
    pub past_count: Option<u64>,
}

impl DataRequirements {
    pub fn new(past_delta: Option<Duration>, past_count: Option<u64>) -> Self {
        DataRequirements {
            past_delta,
            past_count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.past_delta.is_none() && self.past_count.is_none()
    }

    /// Field-wise maximum of the present values.
    pub fn merge(&self, other: &DataRequirements) -> DataRequirements {
        DataRequirements {
            past_delta: max_present(self.past_delta, other.past_delta),
            past_count: max_present(self.past_count, other.past_count),
        }
    }
}

fn max_present<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equality_normalizes_owner_only() {
        let a = Metric::datasource("Alice:host.cpu").expect("metric");
        let b = Metric::datasource("alice:host.cpu").expect("metric");
        let c = Metric::datasource("alice:host.CPU").expect("metric");
        let d = Metric::datapoint("alice:host.cpu").expect("metric");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        let set: HashSet<_> = [a, b, c, d].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn global_uri_resolution() {
        let local = Metric::datapoint("host.cpu").expect("metric");
        assert_eq!(local.global_uri("Alice"), "alice:host.cpu");
        let global = Metric::datapoint("BOB:host.cpu").expect("metric");
        assert_eq!(global.global_uri("alice"), "bob:host.cpu");
    }

    #[test]
    fn rejects_bad_uris() {
        assert!(Metric::datasource("bad uri").is_err());
        assert!(Metric::datasource("").is_err());
    }

    #[test]
    fn derived_metrics_are_datapoints() {
        let base = Metric::datasource("host.log").expect("metric");
        let anomaly = Metric::anomaly(&base).expect("anomaly");
        assert_eq!(anomaly.kind(), MetricKind::Datapoint);
        assert_eq!(anomaly.uri(), "host.log._anomaly");
        let tag = Metric::tag(&base, "level", "error").expect("tag");
        assert_eq!(tag.uri(), "host.log._tag.level.error");
        assert!(Metric::tag(&base, "lev.el", "x").is_err());
        assert_eq!(Metric::filter(&base, "f1").expect("filter").uri(), "host.log._filter.f1");
    }

    #[test]
    fn requirements_merge_takes_maximum() {
        let a = DataRequirements::new(Some(Duration::from_secs(60)), Some(3));
        let b = DataRequirements::new(Some(Duration::from_secs(120)), None);
        let merged = a.merge(&b);
        assert_eq!(merged.past_delta, Some(Duration::from_secs(120)));
        assert_eq!(merged.past_count, Some(3));
        assert!(DataRequirements::default().is_empty());
    }
}
