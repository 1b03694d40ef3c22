//! The BSON type system: `Value`, `ObjectId`, and a minimal `Decimal128`.
//!
//! Type tags follow the real BSON wire format byte-for-byte (§4.1) so the
//! codec is a genuine implementation of the format, not a look-alike.

use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const TAG_DOUBLE: u8 = 0x01;
pub const TAG_STRING: u8 = 0x02;
pub const TAG_DOCUMENT: u8 = 0x03;
pub const TAG_ARRAY: u8 = 0x04;
pub const TAG_BINARY: u8 = 0x05;
pub const TAG_OBJECT_ID: u8 = 0x07;
pub const TAG_BOOLEAN: u8 = 0x08;
pub const TAG_DATETIME: u8 = 0x09;
pub const TAG_NULL: u8 = 0x0A;
pub const TAG_REGEX: u8 = 0x0B;
pub const TAG_INT32: u8 = 0x10;
pub const TAG_TIMESTAMP: u8 = 0x11;
pub const TAG_INT64: u8 = 0x12;
pub const TAG_DECIMAL128: u8 = 0x13;
pub const TAG_MIN_KEY: u8 = 0xFF;
pub const TAG_MAX_KEY: u8 = 0x7F;

/// 12-byte MongoDB-compatible identifier: 4-byte big-endian seconds, 5-byte
/// per-process random value, 3-byte big-endian counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub [u8; 12]);

static OID_COUNTER: AtomicU32 = AtomicU32::new(0);

fn process_random_5() -> [u8; 5] {
    // Derived once per process from the address of a thread-local and the
    // current time; stable for the process lifetime, unique enough that
    // collisions across processes are not expected within the timestamp
    // granularity used by ObjectId.
    use std::sync::OnceLock;
    static RANDOM: OnceLock<[u8; 5]> = OnceLock::new();
    *RANDOM.get_or_init(|| {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
        let pid = std::process::id() as u128;
        let mixed = nanos ^ (pid << 64) ^ ((&RANDOM as *const _ as u128) << 3);
        let bytes = mixed.to_le_bytes();
        [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]]
    })
}

impl ObjectId {
    /// Generate a new, time-ordered ObjectId.
    #[must_use]
    pub fn new() -> Self {
        let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0) as u32;
        let counter = OID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed) & 0x00FF_FFFF;
        let rand5 = process_random_5();
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&rand5);
        let c = counter.to_be_bytes();
        bytes[9..12].copy_from_slice(&c[1..4]);
        Self(bytes)
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

/// A deliberately minimal IEEE 754-2008 decimal128 (BID layout) value: we
/// keep sign, exponent, and a 113-bit coefficient, enough to round-trip
/// the 16-byte wire value exactly and to compare decimal128-vs-decimal128
/// exactly and decimal128-vs-other-numeric approximately via `to_f64`.
#[derive(Debug, Clone, Copy)]
pub struct Decimal128 {
    pub negative: bool,
    pub exponent: i16,
    pub coefficient: u128,
}

impl Decimal128 {
    const EXPONENT_BIAS: i32 = 6176;
    const MAX_COEFFICIENT: u128 = 10u128.pow(34) - 1;

    #[must_use]
    pub fn from_bits(bytes: [u8; 16]) -> Self {
        // BSON stores decimal128 little-endian; reassemble the 128-bit
        // integer in big-endian order to apply the BID bit layout.
        let mut be = bytes;
        be.reverse();
        let hi = u64::from_be_bytes(be[0..8].try_into().unwrap_or([0; 8]));
        let lo = u64::from_be_bytes(be[8..16].try_into().unwrap_or([0; 8]));
        let negative = (hi >> 63) & 1 == 1;
        let combination = (hi >> 58) & 0x1F;
        let (exponent_bits, coeff_msd): (u32, u64) = if combination >> 3 == 0b11 {
            // G0..G4 = 11xxx: implicit leading coefficient bits are 100,
            // exponent occupies the next 14 bits after the two leading '11'.
            let exp = ((hi >> 47) & 0x3FFF) as u32;
            (exp, 0b1000 | ((hi >> 46) & 1))
        } else {
            let exp = ((hi >> 51) & 0x3FFF) as u32;
            (exp, (hi >> 46) & 0x7)
        };
        let rest_hi = hi & 0x0000_3FFF_FFFF_FFFF;
        let coefficient = (u128::from(coeff_msd) << 110)
            | (u128::from(rest_hi) << 64)
            | u128::from(lo);
        let exponent = exponent_bits as i32 - Self::EXPONENT_BIAS;
        Self { negative, exponent: exponent as i16, coefficient: coefficient.min(Self::MAX_COEFFICIENT) }
    }

    #[must_use]
    pub fn to_bits(self) -> [u8; 16] {
        let exponent_bits = u64::from((self.exponent as i32 + Self::EXPONENT_BIAS) as u32) & 0x3FFF;
        let coeff = self.coefficient.min(Self::MAX_COEFFICIENT);
        let coeff_msd = (coeff >> 110) & 0xF;
        let rest_hi = ((coeff >> 64) & 0x0000_3FFF_FFFF_FFFF) as u64;
        let lo = (coeff & u128::from(u64::MAX)) as u64;
        let sign_bit = u64::from(self.negative) << 63;
        let hi = if coeff_msd & 0b1000 != 0 {
            sign_bit
                | (0b11u64 << 61)
                | (exponent_bits << 47)
                | ((coeff_msd & 1) << 46)
                | rest_hi
        } else {
            sign_bit | (exponent_bits << 51) | (coeff_msd << 46) | rest_hi
        };
        let mut be = [0u8; 16];
        be[0..8].copy_from_slice(&hi.to_be_bytes());
        be[8..16].copy_from_slice(&lo.to_be_bytes());
        be.reverse();
        be
    }

    #[must_use]
    pub fn from_f64_approx(v: f64) -> Self {
        Self { negative: v.is_sign_negative(), exponent: 0, coefficient: v.abs() as u128 }
    }

    #[must_use]
    pub fn to_f64(self) -> f64 {
        let mag = self.coefficient as f64 * 10f64.powi(i32::from(self.exponent));
        if self.negative { -mag } else { mag }
    }
}

impl PartialEq for Decimal128 {
    fn eq(&self, other: &Self) -> bool {
        self.negative == other.negative && self.exponent == other.exponent && self.coefficient == other.coefficient
    }
}

/// A BSON binary subtype tag (generic=0x00, function=0x01, uuid=0x04, …).
pub type BinarySubtype = u8;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Double(f64),
    String(String),
    Document(crate::bson::Document),
    Array(Vec<Value>),
    Binary(BinarySubtype, Vec<u8>),
    ObjectId(ObjectId),
    Boolean(bool),
    /// Milliseconds since the Unix epoch.
    DateTime(i64),
    Null,
    Regex { pattern: String, options: String },
    Int32(i32),
    Int64(i64),
    /// `(seconds, ordinal)` — real-BSON wire order is increment-then-seconds;
    /// logical ordering per §3 treats this as `seconds‖ordinal`.
    Timestamp { seconds: u32, ordinal: u32 },
    Decimal128(Decimal128),
    MinKey,
    MaxKey,
}

/// Cross-type comparison rank, per §3. Numerics share a rank (including
/// decimal128) so `compare` can fall through to per-type numeric rules.
pub(crate) fn type_rank(v: &Value) -> u8 {
    match v {
        Value::MinKey => 0,
        Value::Null => 1,
        Value::Double(_) | Value::Int32(_) | Value::Int64(_) | Value::Decimal128(_) => 2,
        Value::String(_) => 3,
        Value::Document(_) => 4,
        Value::Array(_) => 5,
        Value::Binary(_, _) => 6,
        Value::ObjectId(_) => 7,
        Value::Boolean(_) => 8,
        Value::DateTime(_) => 9,
        Value::Timestamp { .. } => 10,
        Value::Regex { .. } => 11,
        Value::MaxKey => 12,
    }
}

impl Value {
    #[must_use]
    pub const fn type_tag(&self) -> u8 {
        match self {
            Self::Double(_) => TAG_DOUBLE,
            Self::String(_) => TAG_STRING,
            Self::Document(_) => TAG_DOCUMENT,
            Self::Array(_) => TAG_ARRAY,
            Self::Binary(_, _) => TAG_BINARY,
            Self::ObjectId(_) => TAG_OBJECT_ID,
            Self::Boolean(_) => TAG_BOOLEAN,
            Self::DateTime(_) => TAG_DATETIME,
            Self::Null => TAG_NULL,
            Self::Regex { .. } => TAG_REGEX,
            Self::Int32(_) => TAG_INT32,
            Self::Timestamp { .. } => TAG_TIMESTAMP,
            Self::Int64(_) => TAG_INT64,
            Self::Decimal128(_) => TAG_DECIMAL128,
            Self::MinKey => TAG_MIN_KEY,
            Self::MaxKey => TAG_MAX_KEY,
        }
    }

    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Double(_) | Self::Int32(_) | Self::Int64(_) | Self::Decimal128(_))
    }

    /// Best-effort widening to `f64`, used for mixed-numeric comparison.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            Self::Int32(i) => Some(f64::from(*i)),
            Self::Int64(i) => Some(*i as f64),
            Self::Decimal128(d) => Some(d.to_f64()),
            _ => None,
        }
    }
}
