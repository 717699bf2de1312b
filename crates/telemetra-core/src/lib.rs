//! Core types shared by every telemetra crate: time-ordered identifiers,
//! metric and sample model, input validation and the protocol message
//! catalog.

pub mod message;
pub mod metric;
pub mod sample;
pub mod timeuuid;
pub mod uplink;
pub mod validation;

pub use message::{Action, Message, MessageError, Payload, PROTOCOL_VERSION};
pub use metric::{global_uri, normalize_uri, DataRequirements, Metric, MetricKind};
pub use sample::{Numeric, Sample, SampleValue};
pub use timeuuid::{TieBreak, TimeUuid, TimeUuidError, MAX_TIMEUUID, MIN_TIMEUUID};
pub use uplink::{SendOptions, Uplink};
pub use validation::ValidationError;
