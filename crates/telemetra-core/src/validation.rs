//! Pure predicates guarding every value that crosses the protocol boundary.
//!
//! The `validate_*` functions return `Ok(())` or a [`ValidationError`] naming
//! the offending value. The `is_*` helpers never fail and are meant for
//! optional fields that must be recognised before a full decode.

use chrono::DateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use uuid::Uuid;

use crate::sample::Numeric;
use crate::timeuuid::TimeUuid;

/// Largest accepted datasource content, in UTF-8 bytes.
pub const MAX_DS_CONTENT_BYTES: usize = 1 << 17;

static LOCAL_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9\-_]+(\.[a-zA-Z0-9\-_]+)*$").expect("valid local uri regex")
});

static GLOBAL_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9\-_]+(\.[a-zA-Z0-9\-_]+)*:[a-zA-Z0-9\-_]+(\.[a-zA-Z0-9\-_]+)*$")
        .expect("valid global uri regex")
});

static URI_LEVEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9\-_]+$").expect("valid uri level regex"));

static TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d{4})-(\d{2})-(\d{2})T(\d{2}):(\d{2}):(\d{2})(?:\.(\d+))?(?:Z|[+-](\d{2}):(\d{2})(:\d{2})?)$",
    )
    .expect("valid timestamp regex")
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid uri: {0:?}")]
    Uri(String),
    #[error("invalid local uri: {0:?}")]
    LocalUri(String),
    #[error("invalid uri level: {0:?}")]
    UriLevel(String),
    #[error("invalid username: {0:?}")]
    Username(String),
    #[error("invalid timestamp: {0:?}")]
    Timestamp(String),
    #[error("invalid datasource content: {0}")]
    DatasourceContent(String),
    #[error("invalid datapoint content: {0:?}")]
    DatapointContent(String),
    #[error("invalid sequence: {0:?}")]
    Sequence(String),
    #[error("invalid {field}: {reason}")]
    Field { field: &'static str, reason: String },
}

/// Local (`a.b.c`) or global (`owner:a.b.c`) metric uri.
pub fn validate_uri(uri: &str) -> Result<(), ValidationError> {
    if LOCAL_URI.is_match(uri) || GLOBAL_URI.is_match(uri) {
        Ok(())
    } else {
        Err(ValidationError::Uri(uri.to_string()))
    }
}

pub fn validate_local_uri(uri: &str) -> Result<(), ValidationError> {
    if LOCAL_URI.is_match(uri) {
        Ok(())
    } else {
        Err(ValidationError::LocalUri(uri.to_string()))
    }
}

/// A single uri segment, without dots.
pub fn validate_uri_level(level: &str) -> Result<(), ValidationError> {
    if URI_LEVEL.is_match(level) {
        Ok(())
    } else {
        Err(ValidationError::UriLevel(level.to_string()))
    }
}

pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    if LOCAL_URI.is_match(username) {
        Ok(())
    } else {
        Err(ValidationError::Username(username.to_string()))
    }
}

/// Timezone-qualified ISO-8601 with at most microsecond precision and a year
/// between 1000 and 9999.
pub fn validate_timestamp_text(text: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::Timestamp(text.to_string());
    let caps = TIMESTAMP.captures(text).ok_or_else(invalid)?;
    let year: u32 = caps[1].parse().map_err(|_| invalid())?;
    if year < 1000 {
        return Err(invalid());
    }
    if caps.get(7).map(|frac| frac.as_str().len() > 6).unwrap_or(false) {
        return Err(invalid());
    }
    if let (Some(hours), Some(minutes)) = (caps.get(8), caps.get(9)) {
        let hours: u32 = hours.as_str().parse().map_err(|_| invalid())?;
        let minutes: u32 = minutes.as_str().parse().map_err(|_| invalid())?;
        if hours >= 24 || minutes >= 60 || caps.get(10).is_some() {
            return Err(invalid());
        }
    }
    DateTime::parse_from_rfc3339(text).map_err(|_| invalid())?;
    Ok(())
}

pub fn validate_ds_value(content: &str) -> Result<(), ValidationError> {
    if content.len() > MAX_DS_CONTENT_BYTES {
        return Err(ValidationError::DatasourceContent(format!(
            "{} bytes exceeds the {MAX_DS_CONTENT_BYTES} byte limit",
            content.len()
        )));
    }
    Ok(())
}

pub fn validate_dp_value(content: &str) -> Result<(), ValidationError> {
    content.parse::<Numeric>().map(|_| ())
}

/// Wire form of a message sequence: 32 hex chars of a version 1 uuid.
pub fn is_message_sequence(text: &str) -> bool {
    text.len() == 32
        && text.chars().all(|c| c.is_ascii_hexdigit())
        && TimeUuid::parse(text).is_ok()
}

pub fn is_uuid_v1(text: &str) -> bool {
    Uuid::parse_str(text)
        .map(|uuid| uuid.get_version_num() == 1)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_grammar() {
        for ok in ["cpu", "host.cpu.load", "a-b_c.D9", "user:host.cpu", "user.name:x"] {
            assert!(validate_uri(ok).is_ok(), "{ok} should be valid");
        }
        for bad in ["", ".cpu", "cpu.", "cpu..load", "a b", "u:", ":x", "a:b:c", "cpu/load"] {
            assert!(validate_uri(bad).is_err(), "{bad} should be invalid");
        }
        assert!(validate_local_uri("user:host").is_err());
        assert!(validate_uri_level("host").is_ok());
        assert!(validate_uri_level("host.cpu").is_err());
        assert!(validate_username("Some_User").is_ok());
        assert!(validate_username("bad user").is_err());
    }

    #[test]
    fn timestamps_require_offset_and_microsecond_precision() {
        for ok in [
            "2016-06-01T12:00:00Z",
            "2016-06-01T12:00:00.123456Z",
            "2016-06-01T12:00:00+05:30",
            "2016-06-01T12:00:00.5-23:59",
        ] {
            assert!(validate_timestamp_text(ok).is_ok(), "{ok} should be valid");
        }
        for bad in [
            "2016-06-01T12:00:00",
            "2016-06-01T12:00:00.1234567Z",
            "2016-06-01T12:00:00+24:00",
            "2016-06-01T12:00:00+01:60",
            "2016-06-01T12:00:00+01:00:30",
            "0999-06-01T12:00:00Z",
            "2016-06-01T12:00:00z",
            "2016-02-30T12:00:00Z",
        ] {
            assert!(validate_timestamp_text(bad).is_err(), "{bad} should be invalid");
        }
    }

    #[test]
    fn content_limits() {
        assert!(validate_ds_value("hello").is_ok());
        let big = "x".repeat(MAX_DS_CONTENT_BYTES + 1);
        assert!(validate_ds_value(&big).is_err());
        assert!(validate_dp_value("123.32").is_ok());
        assert!(validate_dp_value("-1e10").is_ok());
        assert!(validate_dp_value("NaN").is_ok());
        assert!(validate_dp_value("abc").is_err());
        assert!(validate_dp_value("").is_err());
    }

    #[test]
    fn sequence_recognition() {
        let seq = TimeUuid::now();
        assert!(is_message_sequence(&seq.hex()));
        assert!(!is_message_sequence(&seq.as_uuid().hyphenated().to_string()));
        assert!(is_uuid_v1(&seq.as_uuid().hyphenated().to_string()));
        assert!(!is_uuid_v1("5c4f2b8e-6a1d-4f3e-9b0a-1c2d3e4f5a6b"));
        assert!(!is_message_sequence("zz"));
    }
}
