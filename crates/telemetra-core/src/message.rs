//! Protocol message catalog.
//!
//! Every frame is a JSON object `{v, action, seq, irt, payload}`. The set of
//! actions is closed: [`Payload`] is the sum type over all of them and the
//! encode/decode functions below are the only place the wire shape lives.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde_json::{json, Map as JsonMap, Value as JsonValue};
use thiserror::Error;

use crate::metric::{Metric, MetricKind};
use crate::sample::{Numeric, Sample, SampleValue};
use crate::timeuuid::TimeUuid;
use crate::validation::{validate_local_uri, validate_uri, ValidationError};

pub const PROTOCOL_VERSION: u64 = 1;

const ENVELOPE_KEYS: [&str; 5] = ["v", "action", "seq", "irt", "payload"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("could not decode message: expected {0}")]
    Decode(String),
    #[error("unknown message type: {0:?}")]
    UnknownType(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0} is immutable once set")]
    Immutable(&'static str),
}

fn decode_error(expected: impl Into<String>) -> MessageError {
    MessageError::Decode(expected.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    SendDsData,
    SendDpData,
    SendDsInfo,
    SendMultiData,
    HookToUri,
    UnHookFromUri,
    RequestData,
    SendDataInterval,
    GenericResponse,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::SendDsData,
        Action::SendDpData,
        Action::SendDsInfo,
        Action::SendMultiData,
        Action::HookToUri,
        Action::UnHookFromUri,
        Action::RequestData,
        Action::SendDataInterval,
        Action::GenericResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::SendDsData => "send_ds_data",
            Action::SendDpData => "send_dp_data",
            Action::SendDsInfo => "send_ds_info",
            Action::SendMultiData => "send_multi_data",
            Action::HookToUri => "hook_to_uri",
            Action::UnHookFromUri => "unhook_from_uri",
            Action::RequestData => "request_data",
            Action::SendDataInterval => "send_data_interval",
            Action::GenericResponse => "generic_response",
        }
    }
}

impl FromStr for Action {
    type Err = MessageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == value)
            .ok_or_else(|| MessageError::UnknownType(value.to_string()))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendDsData {
    metric: Metric,
    t: TimeUuid,
    content: String,
}

impl SendDsData {
    pub fn new(uri: &str, t: TimeUuid, content: impl Into<String>) -> Result<Self, MessageError> {
        let metric = Metric::datasource(uri)?;
        let content = content.into();
        crate::validation::validate_ds_value(&content)?;
        Ok(SendDsData { metric, t, content })
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    pub fn t(&self) -> TimeUuid {
        self.t
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn to_sample(&self) -> Sample {
        Sample::trusted(
            self.metric.clone(),
            self.t,
            SampleValue::Text(self.content.clone()),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendDpData {
    metric: Metric,
    t: TimeUuid,
    content: Numeric,
}

impl SendDpData {
    pub fn new(uri: &str, t: TimeUuid, content: &str) -> Result<Self, MessageError> {
        let content: Numeric = content.parse()?;
        Self::from_numeric(uri, t, content)
    }

    pub fn from_numeric(uri: &str, t: TimeUuid, content: Numeric) -> Result<Self, MessageError> {
        let metric = Metric::datapoint(uri)?;
        Ok(SendDpData { metric, t, content })
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    pub fn t(&self) -> TimeUuid {
        self.t
    }

    pub fn content(&self) -> &Numeric {
        &self.content
    }

    pub fn to_sample(&self) -> Sample {
        Sample::trusted(
            self.metric.clone(),
            self.t,
            SampleValue::Number(self.content.clone()),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendDsInfo {
    metric: Metric,
    supplies: Option<BTreeSet<String>>,
}

impl SendDsInfo {
    /// `supplies` lists local uris this datasource feeds; duplicates are
    /// dropped and the list is kept sorted.
    pub fn new(uri: &str, supplies: Option<Vec<String>>) -> Result<Self, MessageError> {
        let metric = Metric::datasource(uri)?;
        let supplies = match supplies {
            Some(items) => {
                for item in &items {
                    validate_local_uri(item)?;
                }
                Some(items.into_iter().collect())
            }
            None => None,
        };
        Ok(SendDsInfo { metric, supplies })
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    pub fn supplies(&self) -> Option<Vec<&str>> {
        self.supplies
            .as_ref()
            .map(|set| set.iter().map(String::as_str).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiDataEntry {
    metric: Metric,
    content: SampleValue,
}

impl MultiDataEntry {
    pub fn new(metric: Metric, content: &str) -> Result<Self, MessageError> {
        let content = SampleValue::parse(metric.kind(), content)?;
        Ok(MultiDataEntry { metric, content })
    }

    pub fn from_value(metric: Metric, content: SampleValue) -> Result<Self, MessageError> {
        let sample = Sample::new(metric, crate::timeuuid::MIN_TIMEUUID, content)?;
        let (metric, _, content) = sample.into_parts();
        Ok(MultiDataEntry { metric, content })
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    pub fn content(&self) -> &SampleValue {
        &self.content
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMultiData {
    t: TimeUuid,
    entries: Vec<MultiDataEntry>,
}

impl SendMultiData {
    pub fn new(t: TimeUuid, entries: Vec<MultiDataEntry>) -> Self {
        SendMultiData { t, entries }
    }

    pub fn t(&self) -> TimeUuid {
        self.t
    }

    pub fn entries(&self) -> &[MultiDataEntry] {
        &self.entries
    }

    pub fn to_samples(&self) -> Vec<Sample> {
        self.entries
            .iter()
            .map(|entry| Sample::trusted(entry.metric.clone(), self.t, entry.content.clone()))
            .collect()
    }
}

/// Subscribes to updates of a metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookToUri {
    uri: String,
}

impl HookToUri {
    pub fn new(uri: &str) -> Result<Self, MessageError> {
        validate_uri(uri)?;
        Ok(HookToUri {
            uri: uri.to_string(),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnHookFromUri {
    uri: String,
}

impl UnHookFromUri {
    pub fn new(uri: &str) -> Result<Self, MessageError> {
        validate_uri(uri)?;
        Ok(UnHookFromUri {
            uri: uri.to_string(),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestData {
    uri: String,
    start: Option<TimeUuid>,
    end: Option<TimeUuid>,
    count: Option<u64>,
}

impl RequestData {
    pub fn new(
        uri: &str,
        start: Option<TimeUuid>,
        end: Option<TimeUuid>,
        count: Option<u64>,
    ) -> Result<Self, MessageError> {
        validate_uri(uri)?;
        Ok(RequestData {
            uri: uri.to_string(),
            start,
            end,
            count,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn start(&self) -> Option<TimeUuid> {
        self.start
    }

    pub fn end(&self) -> Option<TimeUuid> {
        self.end
    }

    pub fn count(&self) -> Option<u64> {
        self.count
    }
}

/// Bulk historical payload. Servers send rows newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendDataInterval {
    metric: Metric,
    start: TimeUuid,
    end: TimeUuid,
    data: Vec<(TimeUuid, SampleValue)>,
}

impl SendDataInterval {
    pub fn new(
        metric: Metric,
        start: TimeUuid,
        end: TimeUuid,
        data: Vec<(TimeUuid, SampleValue)>,
    ) -> Result<Self, MessageError> {
        for (_, value) in &data {
            if value.kind() != metric.kind() {
                return Err(ValidationError::Field {
                    field: "data",
                    reason: format!("{} value in {metric} interval", value.kind()),
                }
                .into());
            }
        }
        Ok(SendDataInterval {
            metric,
            start,
            end,
            data,
        })
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    pub fn start(&self) -> TimeUuid {
        self.start
    }

    pub fn end(&self) -> TimeUuid {
        self.end
    }

    pub fn data(&self) -> &[(TimeUuid, SampleValue)] {
        &self.data
    }

    /// Rows in replay order, oldest first.
    pub fn samples_oldest_first(&self) -> Vec<Sample> {
        let mut rows: Vec<_> = self.data.iter().collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.into_iter()
            .map(|(t, value)| Sample::trusted(self.metric.clone(), *t, value.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericResponse {
    status: u32,
    error: u32,
    reason: Option<String>,
}

impl GenericResponse {
    pub fn new(status: u32, error: u32, reason: Option<String>) -> Result<Self, MessageError> {
        if status == 0 {
            return Err(ValidationError::Field {
                field: "status",
                reason: "status must be a positive integer".into(),
            }
            .into());
        }
        Ok(GenericResponse {
            status,
            error,
            reason,
        })
    }

    pub fn status(&self) -> u32 {
        self.status
    }

    pub fn error(&self) -> u32 {
        self.error
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    SendDsData(SendDsData),
    SendDpData(SendDpData),
    SendDsInfo(SendDsInfo),
    SendMultiData(SendMultiData),
    HookToUri(HookToUri),
    UnHookFromUri(UnHookFromUri),
    RequestData(RequestData),
    SendDataInterval(SendDataInterval),
    GenericResponse(GenericResponse),
}

macro_rules! payload_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Payload {
                fn from(value: $variant) -> Self {
                    Payload::$variant(value)
                }
            }
        )*
    };
}

payload_from!(
    SendDsData,
    SendDpData,
    SendDsInfo,
    SendMultiData,
    HookToUri,
    UnHookFromUri,
    RequestData,
    SendDataInterval,
    GenericResponse,
);

impl Payload {
    pub fn action(&self) -> Action {
        match self {
            Payload::SendDsData(_) => Action::SendDsData,
            Payload::SendDpData(_) => Action::SendDpData,
            Payload::SendDsInfo(_) => Action::SendDsInfo,
            Payload::SendMultiData(_) => Action::SendMultiData,
            Payload::HookToUri(_) => Action::HookToUri,
            Payload::UnHookFromUri(_) => Action::UnHookFromUri,
            Payload::RequestData(_) => Action::RequestData,
            Payload::SendDataInterval(_) => Action::SendDataInterval,
            Payload::GenericResponse(_) => Action::GenericResponse,
        }
    }

    fn to_wire(&self) -> JsonValue {
        match self {
            Payload::SendDsData(p) => json!({
                "uri": p.metric.uri(),
                "ts": p.t.hex(),
                "content": p.content,
            }),
            Payload::SendDpData(p) => json!({
                "uri": p.metric.uri(),
                "ts": p.t.hex(),
                "content": p.content.to_string(),
            }),
            Payload::SendDsInfo(p) => json!({
                "uri": p.metric.uri(),
                "supplies": p.supplies.as_ref().map(|set| set.iter().collect::<Vec<_>>()),
            }),
            Payload::SendMultiData(p) => json!({
                "ts": p.t.hex(),
                "uris": p.entries.iter().map(|entry| json!({
                    "uri": entry.metric.uri(),
                    "type": entry.metric.kind().as_str(),
                    "content": entry.content.to_wire(),
                })).collect::<Vec<_>>(),
            }),
            Payload::HookToUri(p) => json!({ "uri": p.uri }),
            Payload::UnHookFromUri(p) => json!({ "uri": p.uri }),
            Payload::RequestData(p) => json!({
                "uri": p.uri,
                "start": p.start.map(|t| t.hex()),
                "end": p.end.map(|t| t.hex()),
                "count": p.count,
            }),
            Payload::SendDataInterval(p) => json!({
                "uri": p.metric.uri(),
                "type": p.metric.kind().as_str(),
                "start": p.start.hex(),
                "end": p.end.hex(),
                "data": p.data.iter().map(|(t, value)| json!([t.hex(), value.to_wire()])).collect::<Vec<_>>(),
            }),
            Payload::GenericResponse(p) => json!({
                "status": p.status,
                "error": p.error,
                "reason": p.reason,
            }),
        }
    }

    fn from_wire(action: Action, payload: &JsonMap<String, JsonValue>) -> Result<Self, MessageError> {
        let fields = Fields {
            action,
            map: payload,
        };
        let decoded: Payload = match action {
            Action::SendDsData => {
                let uri = fields.str("uri")?;
                let ts = fields.str("ts")?;
                let content = fields.str("content")?;
                SendDsData::new(uri, parse_ts("ts", ts)?, content)?.into()
            }
            Action::SendDpData => {
                let uri = fields.str("uri")?;
                let ts = fields.str("ts")?;
                let content = fields.number_text("content")?;
                SendDpData::new(uri, parse_ts("ts", ts)?, &content)?.into()
            }
            Action::SendDsInfo => {
                let uri = fields.str("uri")?;
                let supplies = match fields.optional("supplies")? {
                    None => None,
                    Some(JsonValue::Array(items)) => Some(
                        items
                            .iter()
                            .map(|item| {
                                item.as_str()
                                    .map(str::to_string)
                                    .ok_or_else(|| fields.expected("supplies as a list of strings"))
                            })
                            .collect::<Result<Vec<_>, _>>()?,
                    ),
                    Some(_) => return Err(fields.expected("supplies as a list of strings")),
                };
                SendDsInfo::new(uri, supplies)?.into()
            }
            Action::SendMultiData => {
                let ts = fields.str("ts")?;
                let items = fields.array("uris")?;
                let mut entries = Vec::with_capacity(items.len());
                for item in items {
                    let item = item
                        .as_object()
                        .ok_or_else(|| fields.expected("uris entries as objects"))?;
                    let entry = Fields { action, map: item };
                    let kind: MetricKind = entry.str("type")?.parse()?;
                    let metric = Metric::new(kind, entry.str("uri")?)?;
                    let content = match kind {
                        MetricKind::Datasource => entry.str("content")?.to_string(),
                        MetricKind::Datapoint => entry.number_text("content")?,
                    };
                    entries.push(MultiDataEntry::new(metric, &content)?);
                }
                SendMultiData::new(parse_ts("ts", ts)?, entries).into()
            }
            Action::HookToUri => HookToUri::new(fields.str("uri")?)?.into(),
            Action::UnHookFromUri => UnHookFromUri::new(fields.str("uri")?)?.into(),
            Action::RequestData => {
                let uri = fields.str("uri")?;
                let start = fields.optional_ts("start")?;
                let end = fields.optional_ts("end")?;
                let count = match fields.optional("count")? {
                    None => None,
                    Some(value) => Some(
                        value
                            .as_u64()
                            .ok_or_else(|| fields.expected("count as a non-negative integer"))?,
                    ),
                };
                RequestData::new(uri, start, end, count)?.into()
            }
            Action::SendDataInterval => {
                let kind: MetricKind = fields.str("type")?.parse()?;
                let metric = Metric::new(kind, fields.str("uri")?)?;
                let start = parse_ts("start", fields.str("start")?)?;
                let end = parse_ts("end", fields.str("end")?)?;
                let rows = fields.array("data")?;
                let mut data = Vec::with_capacity(rows.len());
                for row in rows {
                    let pair = row
                        .as_array()
                        .filter(|pair| pair.len() == 2)
                        .ok_or_else(|| fields.expected("data rows as [ts, content] pairs"))?;
                    let ts = pair[0]
                        .as_str()
                        .ok_or_else(|| fields.expected("data row ts as a string"))?;
                    let content = match (&pair[1], kind) {
                        (JsonValue::String(text), _) => text.clone(),
                        (JsonValue::Number(number), MetricKind::Datapoint) => number.to_string(),
                        _ => return Err(fields.expected("data row content as a string")),
                    };
                    data.push((parse_ts("data", ts)?, SampleValue::parse(kind, &content)?));
                }
                SendDataInterval::new(metric, start, end, data)?.into()
            }
            Action::GenericResponse => {
                let status = fields
                    .require("status")?
                    .as_u64()
                    .and_then(|value| u32::try_from(value).ok())
                    .ok_or_else(|| fields.expected("status as a positive integer"))?;
                let error = fields
                    .require("error")?
                    .as_u64()
                    .and_then(|value| u32::try_from(value).ok())
                    .ok_or_else(|| fields.expected("error as a non-negative integer"))?;
                let reason = match fields.optional("reason")? {
                    None => None,
                    Some(JsonValue::String(reason)) => Some(reason.clone()),
                    Some(_) => return Err(fields.expected("reason as a string")),
                };
                GenericResponse::new(status, error, reason)?.into()
            }
        };
        Ok(decoded)
    }
}

struct Fields<'a> {
    action: Action,
    map: &'a JsonMap<String, JsonValue>,
}

impl<'a> Fields<'a> {
    fn expected(&self, what: &str) -> MessageError {
        decode_error(format!("{} payload with {what}", self.action))
    }

    fn require(&self, key: &str) -> Result<&'a JsonValue, MessageError> {
        self.map
            .get(key)
            .ok_or_else(|| self.expected(&format!("key {key:?}")))
    }

    /// Absent and `null` are both treated as missing.
    fn optional(&self, key: &str) -> Result<Option<&'a JsonValue>, MessageError> {
        Ok(self.map.get(key).filter(|value| !value.is_null()))
    }

    fn str(&self, key: &str) -> Result<&'a str, MessageError> {
        self.require(key)?
            .as_str()
            .ok_or_else(|| self.expected(&format!("{key} as a string")))
    }

    fn array(&self, key: &str) -> Result<&'a Vec<JsonValue>, MessageError> {
        self.require(key)?
            .as_array()
            .ok_or_else(|| self.expected(&format!("{key} as a list")))
    }

    /// Datapoint content travels as a string, bare JSON numbers are accepted.
    fn number_text(&self, key: &str) -> Result<String, MessageError> {
        match self.require(key)? {
            JsonValue::String(text) => Ok(text.clone()),
            JsonValue::Number(number) => Ok(number.to_string()),
            _ => Err(self.expected(&format!("{key} as a numeric string"))),
        }
    }

    fn optional_ts(&self, key: &'static str) -> Result<Option<TimeUuid>, MessageError> {
        match self.optional(key)? {
            None => Ok(None),
            Some(JsonValue::String(text)) => parse_ts(key, text).map(Some),
            Some(_) => Err(self.expected(&format!("{key} as a string"))),
        }
    }
}

fn parse_ts(field: &'static str, text: &str) -> Result<TimeUuid, MessageError> {
    TimeUuid::parse(text).map_err(|err| {
        ValidationError::Field {
            field,
            reason: err.to_string(),
        }
        .into()
    })
}

/// A protocol message: envelope plus typed payload.
///
/// Version, action and sequence have no setters. The in-reply-to reference
/// may be filled once if the message was built without one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sequence: TimeUuid,
    irt: Option<TimeUuid>,
    payload: Payload,
}

impl Message {
    pub fn new(payload: impl Into<Payload>) -> Self {
        Message {
            sequence: TimeUuid::now(),
            irt: None,
            payload: payload.into(),
        }
    }

    pub fn with_sequence(payload: impl Into<Payload>, sequence: TimeUuid) -> Self {
        Message {
            sequence,
            irt: None,
            payload: payload.into(),
        }
    }

    pub fn reply(payload: impl Into<Payload>, in_reply_to: TimeUuid) -> Self {
        Message {
            sequence: TimeUuid::now(),
            irt: Some(in_reply_to),
            payload: payload.into(),
        }
    }

    pub fn version(&self) -> u64 {
        PROTOCOL_VERSION
    }

    pub fn action(&self) -> Action {
        self.payload.action()
    }

    pub fn sequence(&self) -> TimeUuid {
        self.sequence
    }

    pub fn in_reply_to(&self) -> Option<TimeUuid> {
        self.irt
    }

    pub fn set_in_reply_to(&mut self, irt: TimeUuid) -> Result<(), MessageError> {
        if self.irt.is_some() {
            return Err(MessageError::Immutable("irt"));
        }
        self.irt = Some(irt);
        Ok(())
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn to_wire(&self) -> JsonValue {
        json!({
            "v": PROTOCOL_VERSION,
            "action": self.action().as_str(),
            "seq": self.sequence.hex(),
            "irt": self.irt.map(|irt| irt.hex()),
            "payload": self.payload.to_wire(),
        })
    }

    pub fn to_json(&self) -> String {
        self.to_wire().to_string()
    }

    /// Decodes any action, looking the variant up from the `action` tag.
    pub fn from_wire(value: &JsonValue) -> Result<Self, MessageError> {
        let obj = envelope(value)?;
        check_version(obj)?;
        let action = obj
            .get("action")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| decode_error("action as a string"))?;
        let action: Action = action.parse()?;
        Self::from_wire_as(action, value)
    }

    /// Decodes a frame that must carry `expected` as its action.
    pub fn from_wire_as(expected: Action, value: &JsonValue) -> Result<Self, MessageError> {
        let obj = envelope(value)?;
        check_version(obj)?;
        if obj.get("action").and_then(JsonValue::as_str) != Some(expected.as_str()) {
            return Err(decode_error(format!("action {expected}")));
        }
        let sequence = obj
            .get("seq")
            .and_then(JsonValue::as_str)
            .and_then(|seq| TimeUuid::parse(seq).ok())
            .ok_or_else(|| decode_error("seq as a version 1 uuid"))?;
        let irt = match obj.get("irt") {
            Some(JsonValue::Null) => None,
            Some(JsonValue::String(irt)) => Some(
                TimeUuid::parse(irt).map_err(|_| decode_error("irt as a version 1 uuid or null"))?,
            ),
            _ => return Err(decode_error("irt as a version 1 uuid or null")),
        };
        let payload = obj
            .get("payload")
            .and_then(JsonValue::as_object)
            .ok_or_else(|| decode_error(format!("{expected} payload as an object")))?;
        let payload = Payload::from_wire(expected, payload)?;
        Ok(Message {
            sequence,
            irt,
            payload,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        let value: JsonValue =
            serde_json::from_str(text).map_err(|_| decode_error("a JSON object"))?;
        Self::from_wire(&value)
    }
}

fn envelope(value: &JsonValue) -> Result<&JsonMap<String, JsonValue>, MessageError> {
    let obj = value
        .as_object()
        .ok_or_else(|| decode_error("a JSON object"))?;
    for key in ENVELOPE_KEYS {
        if !obj.contains_key(key) {
            return Err(decode_error(format!("envelope key {key:?}")));
        }
    }
    Ok(obj)
}

fn check_version(obj: &JsonMap<String, JsonValue>) -> Result<(), MessageError> {
    if obj.get("v").and_then(JsonValue::as_u64) == Some(PROTOCOL_VERSION) {
        Ok(())
    } else {
        Err(decode_error(format!("protocol version {PROTOCOL_VERSION}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeuuid::TieBreak;
    use bigdecimal::BigDecimal;

    fn t(micros: i64) -> TimeUuid {
        TimeUuid::from_micros(micros, TieBreak::Random).expect("timeuuid")
    }

    fn round_trip(message: Message) {
        let wire = message.to_wire();
        let decoded = Message::from_wire(&wire).expect("decode");
        assert_eq!(decoded, message);
        let text = message.to_json();
        assert_eq!(Message::from_json(&text).expect("decode text"), message);
    }

    fn all_variants() -> Vec<Message> {
        let ds = Metric::datasource("host.log").expect("metric");
        let dp = Metric::datapoint("alice:host.cpu").expect("metric");
        vec![
            Message::new(SendDsData::new("host.log", t(1), "line one").expect("ds")),
            Message::new(SendDpData::new("valid.uri", t(2), "123.32").expect("dp")),
            Message::new(SendDsInfo::new("host.log", Some(vec!["b".into(), "a".into()])).expect("info")),
            Message::new(SendDsInfo::new("host.log", None).expect("info")),
            Message::new(SendMultiData::new(
                t(3),
                vec![
                    MultiDataEntry::new(ds.clone(), "text").expect("entry"),
                    MultiDataEntry::new(dp.clone(), "-4.5").expect("entry"),
                ],
            )),
            Message::new(HookToUri::new("alice:host.cpu").expect("hook")),
            Message::new(UnHookFromUri::new("host.cpu").expect("unhook")),
            Message::new(RequestData::new("host.cpu", Some(t(4)), None, Some(10)).expect("req")),
            Message::new(RequestData::new("host.cpu", None, None, None).expect("req")),
            Message::reply(
                SendDataInterval::new(
                    dp,
                    t(5),
                    t(9),
                    vec![
                        (t(8), SampleValue::parse(MetricKind::Datapoint, "2").expect("v")),
                        (t(6), SampleValue::parse(MetricKind::Datapoint, "NaN").expect("v")),
                    ],
                )
                .expect("interval"),
                t(4),
            ),
            Message::reply(GenericResponse::new(200, 0, None).expect("resp"), t(10)),
            Message::reply(
                GenericResponse::new(404, 12, Some("not found".into())).expect("resp"),
                t(11),
            ),
        ]
    }

    #[test]
    fn every_variant_round_trips() {
        for message in all_variants() {
            round_trip(message);
        }
    }

    #[test]
    fn dp_content_is_sent_as_string() {
        let message = Message::new(SendDpData::new("valid.uri", t(2), "123.32").expect("dp"));
        let wire = message.to_wire();
        assert_eq!(wire["payload"]["content"], JsonValue::String("123.32".into()));
        let decoded = Message::from_wire(&wire).expect("decode");
        let Payload::SendDpData(payload) = decoded.payload() else {
            panic!("wrong variant");
        };
        let expected = BigDecimal::from_str("123.32").expect("decimal");
        assert_eq!(payload.content(), &Numeric::Finite(expected));
    }

    #[test]
    fn missing_keys_fail_with_decode_error() {
        for message in all_variants() {
            let wire = message.to_wire();
            for key in ENVELOPE_KEYS {
                let mut broken = wire.clone();
                broken.as_object_mut().expect("object").remove(key);
                let err = Message::from_wire_as(message.action(), &broken).expect_err("missing key");
                assert!(matches!(err, MessageError::Decode(_)), "{key}: {err:?}");
            }
            let required: Vec<String> = wire["payload"]
                .as_object()
                .expect("payload")
                .iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(key, _)| key.clone())
                .collect();
            for key in required {
                if matches!(message.action(), Action::RequestData | Action::SendDsInfo | Action::GenericResponse)
                    && matches!(key.as_str(), "start" | "end" | "count" | "supplies" | "reason")
                {
                    continue;
                }
                let mut broken = wire.clone();
                broken["payload"].as_object_mut().expect("payload").remove(&key);
                let err = Message::from_wire(&broken).expect_err("missing payload key");
                assert!(matches!(err, MessageError::Decode(_)), "{key}: {err:?}");
            }
        }
    }

    #[test]
    fn structural_checks() {
        assert!(matches!(
            Message::from_wire(&json!([1, 2])),
            Err(MessageError::Decode(_))
        ));
        let mut wire = Message::new(HookToUri::new("a.b").expect("hook")).to_wire();
        wire["v"] = json!(99);
        assert!(matches!(Message::from_wire(&wire), Err(MessageError::Decode(_))));

        let wire = Message::new(HookToUri::new("a.b").expect("hook")).to_wire();
        assert!(matches!(
            Message::from_wire_as(Action::UnHookFromUri, &wire),
            Err(MessageError::Decode(_))
        ));

        let mut wire = Message::new(HookToUri::new("a.b").expect("hook")).to_wire();
        wire["action"] = json!("launch_rockets");
        assert!(matches!(
            Message::from_wire(&wire),
            Err(MessageError::UnknownType(_))
        ));
        wire["v"] = json!(2);
        assert!(matches!(Message::from_wire(&wire), Err(MessageError::Decode(_))));

        let mut wire = Message::new(HookToUri::new("a.b").expect("hook")).to_wire();
        wire["payload"] = json!("a.b");
        assert!(matches!(Message::from_wire(&wire), Err(MessageError::Decode(_))));
    }

    #[test]
    fn domain_errors_are_specific() {
        let mut wire = Message::new(HookToUri::new("a.b").expect("hook")).to_wire();
        wire["payload"]["uri"] = json!("not a uri");
        assert!(matches!(
            Message::from_wire(&wire),
            Err(MessageError::Validation(ValidationError::Uri(_)))
        ));

        let mut wire = Message::new(SendDpData::new("a.b", t(1), "1").expect("dp")).to_wire();
        wire["payload"]["content"] = json!("one");
        assert!(matches!(
            Message::from_wire(&wire),
            Err(MessageError::Validation(ValidationError::DatapointContent(_)))
        ));
    }

    #[test]
    fn multi_data_drops_unknown_entry_keys() {
        let message = Message::new(SendMultiData::new(
            t(3),
            vec![MultiDataEntry::new(Metric::datapoint("a.b").expect("m"), "1").expect("entry")],
        ));
        let mut wire = message.to_wire();
        wire["payload"]["uris"][0]["colour"] = json!("blue");
        let decoded = Message::from_wire(&wire).expect("decode");
        assert_eq!(decoded, message);
        assert!(decoded.to_wire()["payload"]["uris"][0].get("colour").is_none());
    }

    #[test]
    fn ds_info_supplies_are_sorted_and_deduplicated() {
        let info = SendDsInfo::new("host.log", Some(vec!["z".into(), "a".into(), "z".into()]))
            .expect("info");
        assert_eq!(info.supplies(), Some(vec!["a", "z"]));
        assert!(SendDsInfo::new("host.log", Some(vec!["u:x".into()])).is_err());
    }

    #[test]
    fn in_reply_to_is_set_once() {
        let mut message = Message::new(HookToUri::new("a.b").expect("hook"));
        assert_eq!(message.version(), PROTOCOL_VERSION);
        assert_eq!(message.action(), Action::HookToUri);
        let first = t(1);
        message.set_in_reply_to(first).expect("first assignment");
        assert_eq!(
            message.set_in_reply_to(t(2)),
            Err(MessageError::Immutable("irt"))
        );
        assert_eq!(message.in_reply_to(), Some(first));
    }

    #[test]
    fn data_interval_replays_oldest_first() {
        let dp = Metric::datapoint("a.b").expect("m");
        let rows = vec![
            (t(30), SampleValue::parse(MetricKind::Datapoint, "3").expect("v")),
            (t(10), SampleValue::parse(MetricKind::Datapoint, "1").expect("v")),
            (t(20), SampleValue::parse(MetricKind::Datapoint, "2").expect("v")),
        ];
        let interval = SendDataInterval::new(dp, t(0), t(40), rows).expect("interval");
        let order: Vec<i64> = interval
            .samples_oldest_first()
            .iter()
            .map(|sample| sample.t().timestamp_micros())
            .collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[test]
    fn generic_response_status_must_be_positive() {
        assert!(GenericResponse::new(0, 0, None).is_err());
        assert!(GenericResponse::new(202, 0, None).expect("resp").is_success());
    }
}
