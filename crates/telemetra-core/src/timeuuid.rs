use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// 100ns ticks between the Gregorian reform (1582-10-15) and the unix epoch.
const GREGORIAN_OFFSET: i128 = 0x01b2_1dd2_1381_4000;
const TICKS_MASK: u64 = 0x0fff_ffff_ffff_ffff;

const LOWEST_CLOCK_SEQ: u16 = 0x0080;
const LOWEST_NODE: u64 = 0x8080_8080_8080;
const HIGHEST_CLOCK_SEQ: u16 = 0x3f7f;
const HIGHEST_NODE: u64 = 0x7f7f_7f7f_7f7f;

/// Smallest value of the family: zero ticks, lowest tie-breaker.
pub const MIN_TIMEUUID: TimeUuid = TimeUuid::from_parts(0, LOWEST_CLOCK_SEQ, LOWEST_NODE);
/// Largest value of the family: all 60 tick bits set, highest tie-breaker.
pub const MAX_TIMEUUID: TimeUuid = TimeUuid::from_parts(TICKS_MASK, HIGHEST_CLOCK_SEQ, HIGHEST_NODE);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeUuidError {
    #[error("invalid identifier format: {0}")]
    InvalidFormat(String),
    #[error("invalid identifier type: expected version 1, got version {0}")]
    InvalidType(usize),
    #[error("timestamp out of range: {0}us")]
    OutOfRange(i64),
}

/// How the 62 tie-breaker bits (clock sequence + node) are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// Cryptographically random clock sequence and node.
    Random,
    /// Sorts before every other value sharing the timestamp.
    Lowest,
    /// Sorts after every other value sharing the timestamp.
    Highest,
    /// All-zero clock sequence and node, for reproducible identities.
    Zero,
    Fixed { clock_seq: u16, node: u64 },
}

/// Time-ordered version 1 UUID used for sample timestamps and message
/// sequence numbers.
#[derive(Clone, Copy)]
pub struct TimeUuid(Uuid);

impl TimeUuid {
    const fn from_parts(ticks: u64, clock_seq: u16, node: u64) -> Self {
        let ticks = ticks & TICKS_MASK;
        let time_low = (ticks & 0xffff_ffff) as u32;
        let time_mid = ((ticks >> 32) & 0xffff) as u16;
        let time_hi = (((ticks >> 48) & 0x0fff) as u16) | 0x1000;
        let clock_seq = clock_seq & 0x3fff;
        let bytes = [
            (time_low >> 24) as u8,
            (time_low >> 16) as u8,
            (time_low >> 8) as u8,
            time_low as u8,
            (time_mid >> 8) as u8,
            time_mid as u8,
            (time_hi >> 8) as u8,
            time_hi as u8,
            ((clock_seq >> 8) as u8 & 0x3f) | 0x80,
            clock_seq as u8,
            (node >> 40) as u8,
            (node >> 32) as u8,
            (node >> 24) as u8,
            (node >> 16) as u8,
            (node >> 8) as u8,
            node as u8,
        ];
        TimeUuid(Uuid::from_bytes(bytes))
    }

    /// Current wall-clock time with a random tie-breaker.
    pub fn now() -> Self {
        Self::at_micros(now_micros(), TieBreak::Random)
    }

    pub fn now_with(tiebreak: TieBreak) -> Self {
        Self::at_micros(now_micros(), tiebreak)
    }

    /// Builds a value from microseconds since the unix epoch.
    pub fn from_micros(micros: i64, tiebreak: TieBreak) -> Result<Self, TimeUuidError> {
        let ticks = micros_to_ticks(micros);
        if ticks < 0 || ticks > TICKS_MASK as i128 {
            return Err(TimeUuidError::OutOfRange(micros));
        }
        Ok(Self::at_micros(micros, tiebreak))
    }

    /// Like [`from_micros`](Self::from_micros) but clamps times outside the
    /// representable range to the nearest bound.
    fn at_micros(micros: i64, tiebreak: TieBreak) -> Self {
        let ticks = micros_to_ticks(micros).clamp(0, TICKS_MASK as i128) as u64;
        let (clock_seq, node) = match tiebreak {
            TieBreak::Random => random_tiebreak(),
            TieBreak::Lowest => (LOWEST_CLOCK_SEQ, LOWEST_NODE),
            TieBreak::Highest => (HIGHEST_CLOCK_SEQ, HIGHEST_NODE),
            TieBreak::Zero => (0, 0),
            TieBreak::Fixed { clock_seq, node } => (clock_seq, node & 0xffff_ffff_ffff),
        };
        Self::from_parts(ticks, clock_seq, node)
    }

    /// Builds a value from fractional seconds since the unix epoch, rounded
    /// to the microsecond.
    pub fn from_timestamp(seconds: f64, tiebreak: TieBreak) -> Result<Self, TimeUuidError> {
        let micros = (seconds * 1_000_000.0).round();
        if !micros.is_finite() || micros.abs() > i64::MAX as f64 {
            return Err(TimeUuidError::OutOfRange(i64::MAX));
        }
        Self::from_micros(micros as i64, tiebreak)
    }

    pub fn from_datetime<Tz: TimeZone>(
        datetime: &DateTime<Tz>,
        tiebreak: TieBreak,
    ) -> Result<Self, TimeUuidError> {
        Self::from_micros(datetime.timestamp_micros(), tiebreak)
    }

    pub fn lowest(micros: i64) -> Result<Self, TimeUuidError> {
        Self::from_micros(micros, TieBreak::Lowest)
    }

    pub fn highest(micros: i64) -> Result<Self, TimeUuidError> {
        Self::from_micros(micros, TieBreak::Highest)
    }

    /// Accepts any UUID whose version tag is 1.
    pub fn from_uuid(uuid: Uuid) -> Result<Self, TimeUuidError> {
        match uuid.get_version_num() {
            1 => Ok(TimeUuid(uuid)),
            other => Err(TimeUuidError::InvalidType(other)),
        }
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Result<Self, TimeUuidError> {
        Self::from_uuid(Uuid::from_bytes(bytes))
    }

    /// Parses hyphenated or simple hex text.
    pub fn parse(text: &str) -> Result<Self, TimeUuidError> {
        let uuid =
            Uuid::parse_str(text).map_err(|_| TimeUuidError::InvalidFormat(text.to_string()))?;
        Self::from_uuid(uuid)
    }

    fn ticks(&self) -> u64 {
        let b = self.0.as_bytes();
        let time_low = u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64;
        let time_mid = u16::from_be_bytes([b[4], b[5]]) as u64;
        let time_hi = (u16::from_be_bytes([b[6], b[7]]) & 0x0fff) as u64;
        (time_hi << 48) | (time_mid << 32) | time_low
    }

    /// Seconds since the unix epoch.
    pub fn timestamp(&self) -> f64 {
        (self.ticks() as i128 - GREGORIAN_OFFSET) as f64 / 10_000_000.0
    }

    pub fn timestamp_micros(&self) -> i64 {
        (self.ticks() as i128 - GREGORIAN_OFFSET).div_euclid(10) as i64
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_micros(self.timestamp_micros()).single()
    }

    pub fn clock_seq(&self) -> u16 {
        let b = self.0.as_bytes();
        (((b[8] & 0x3f) as u16) << 8) | b[9] as u16
    }

    pub fn node(&self) -> u64 {
        self.0.as_bytes()[10..]
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | *byte as u64)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Fixed-width wire form: 32 lowercase hex characters.
    pub fn hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    fn tiebreak_key(&self) -> [i8; 8] {
        let b = self.0.as_bytes();
        let mut key = [0i8; 8];
        key[0] = (b[8] & 0x3f) as i8;
        for (slot, byte) in key.iter_mut().zip(&b[8..]).skip(1) {
            *slot = *byte as i8;
        }
        key
    }
}

fn micros_to_ticks(micros: i64) -> i128 {
    micros as i128 * 10 + GREGORIAN_OFFSET
}

fn now_micros() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_micros() as i64,
        Err(err) => -(err.duration().as_micros() as i64),
    }
}

fn random_tiebreak() -> (u16, u64) {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    let clock_seq = u16::from_be_bytes([bytes[0], bytes[1]]) & 0x3fff;
    let node = bytes[2..]
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | *byte as u64);
    (clock_seq, node)
}

impl PartialEq for TimeUuid {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for TimeUuid {}

impl Hash for TimeUuid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Ord for TimeUuid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ticks()
            .cmp(&other.ticks())
            .then_with(|| self.tiebreak_key().cmp(&other.tiebreak_key()))
            // variant bits are masked out above; keep Ord consistent with Eq
            .then_with(|| self.0.as_bytes().cmp(other.0.as_bytes()))
    }
}

impl PartialOrd for TimeUuid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for TimeUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimeUuid({})", self.0.hyphenated())
    }
}

impl fmt::Display for TimeUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl FromStr for TimeUuid {
    type Err = TimeUuidError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        TimeUuid::parse(value)
    }
}

impl TryFrom<Uuid> for TimeUuid {
    type Error = TimeUuidError;

    fn try_from(value: Uuid) -> Result<Self, Self::Error> {
        TimeUuid::from_uuid(value)
    }
}

impl Serialize for TimeUuid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for TimeUuid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error as _;
        let raw = String::deserialize(deserializer)?;
        TimeUuid::parse(&raw).map_err(D::Error::custom)
    }
}
