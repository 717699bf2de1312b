use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;

use crate::metric::{Metric, MetricKind};
use crate::timeuuid::TimeUuid;
use crate::validation::{validate_ds_value, ValidationError};

/// Arbitrary precision datapoint value. `NaN` compares equal to itself so
/// decoded samples can be matched against stored ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Numeric {
    Finite(BigDecimal),
    NaN,
}

impl FromStr for Numeric {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("nan") {
            return Ok(Numeric::NaN);
        }
        // BigDecimal has no infinities, anything it accepts is finite
        BigDecimal::from_str(trimmed)
            .map(Numeric::Finite)
            .map_err(|_| ValidationError::DatapointContent(value.to_string()))
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Numeric::Finite(value) => write!(f, "{value}"),
            Numeric::NaN => f.write_str("NaN"),
        }
    }
}

impl From<BigDecimal> for Numeric {
    fn from(value: BigDecimal) -> Self {
        Numeric::Finite(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleValue {
    Text(String),
    Number(Numeric),
}

impl SampleValue {
    /// Parses wire content according to the metric kind.
    pub fn parse(kind: MetricKind, content: &str) -> Result<Self, ValidationError> {
        match kind {
            MetricKind::Datasource => {
                validate_ds_value(content)?;
                Ok(SampleValue::Text(content.to_string()))
            }
            MetricKind::Datapoint => content.parse().map(SampleValue::Number),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            SampleValue::Text(_) => MetricKind::Datasource,
            SampleValue::Number(_) => MetricKind::Datapoint,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SampleValue::Text(text) => Some(text),
            SampleValue::Number(_) => None,
        }
    }

    pub fn as_number(&self) -> Option<&Numeric> {
        match self {
            SampleValue::Number(number) => Some(number),
            SampleValue::Text(_) => None,
        }
    }

    /// String form sent on the wire.
    pub fn to_wire(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SampleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleValue::Text(text) => f.write_str(text),
            SampleValue::Number(number) => write!(f, "{number}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    metric: Metric,
    t: TimeUuid,
    value: SampleValue,
}

impl Sample {
    pub fn new(metric: Metric, t: TimeUuid, value: SampleValue) -> Result<Self, ValidationError> {
        if value.kind() != metric.kind() {
            return Err(ValidationError::Field {
                field: "value",
                reason: format!("{} value given for {metric}", value.kind()),
            });
        }
        if let SampleValue::Text(text) = &value {
            validate_ds_value(text)?;
        }
        Ok(Sample { metric, t, value })
    }

    /// Skips checks for values already validated against `metric`.
    pub(crate) fn trusted(metric: Metric, t: TimeUuid, value: SampleValue) -> Self {
        Sample { metric, t, value }
    }

    pub fn parse(metric: Metric, t: TimeUuid, content: &str) -> Result<Self, ValidationError> {
        let value = SampleValue::parse(metric.kind(), content)?;
        Ok(Sample { metric, t, value })
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    pub fn t(&self) -> TimeUuid {
        self.t
    }

    pub fn value(&self) -> &SampleValue {
        &self.value
    }

    pub fn into_parts(self) -> (Metric, TimeUuid, SampleValue) {
        (self.metric, self.t, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datapoint_values_are_decimals() {
        let value = SampleValue::parse(MetricKind::Datapoint, "123.32").expect("parse");
        let expected = BigDecimal::from_str("123.32").expect("decimal");
        assert_eq!(value, SampleValue::Number(Numeric::Finite(expected)));
        assert_eq!(value.to_wire(), "123.32");
        assert_eq!(
            SampleValue::parse(MetricKind::Datapoint, "nan").expect("nan"),
            SampleValue::Number(Numeric::NaN)
        );
        assert!(SampleValue::parse(MetricKind::Datapoint, "12,5").is_err());
    }

    #[test]
    fn sample_kind_must_match_metric() {
        let ds = Metric::datasource("host.log").expect("metric");
        let t = TimeUuid::now();
        assert!(Sample::new(ds.clone(), t, SampleValue::Text("line".into())).is_ok());
        let number = SampleValue::parse(MetricKind::Datapoint, "1").expect("parse");
        assert!(Sample::new(ds, t, number).is_err());
    }
}
