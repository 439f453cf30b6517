//! Records: typed values with update-ordering metadata.
//!
//! A record pairs a [`Value`] with a logical `clock` and a `quality`. When two
//! writers race on the same key, quality decides first and the clock breaks
//! ties, so every participant converges on the same winner.

use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Type tag of a record value. Record filters are registered per tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Integer,
    Double,
    String,
    Binary,
    IntegerArray,
    DoubleArray,
}

impl RecordType {
    /// Every record type, in tag order.
    pub const ALL: [Self; 6] = [
        Self::Integer,
        Self::Double,
        Self::String,
        Self::Binary,
        Self::IntegerArray,
        Self::DoubleArray,
    ];

    const fn bit(self) -> u32 {
        match self {
            Self::Integer => 1,
            Self::Double => 1 << 1,
            Self::String => 1 << 2,
            Self::Binary => 1 << 3,
            Self::IntegerArray => 1 << 4,
            Self::DoubleArray => 1 << 5,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Double => "double",
            Self::String => "string",
            Self::Binary => "binary",
            Self::IntegerArray => "integer_array",
            Self::DoubleArray => "double_array",
        }
    }
}

/// A set of record types, used when registering record filters.
///
/// ```
/// use kyromesh::{RecordType, RecordTypes};
///
/// let numeric = RecordTypes::from(RecordType::Integer) | RecordType::Double;
/// assert!(numeric.contains(RecordType::Double));
/// assert!(!numeric.contains(RecordType::String));
/// assert!(RecordTypes::ALL.contains(RecordType::Binary));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RecordTypes(u32);

impl RecordTypes {
    /// The empty set.
    pub const NONE: Self = Self(0);
    /// Wildcard registration: every record type.
    pub const ALL: Self = Self(0b11_1111);

    /// Returns true if `ty` is in the set.
    #[must_use]
    pub const fn contains(self, ty: RecordType) -> bool {
        self.0 & ty.bit() != 0
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates the types in the set in tag order.
    pub fn iter(self) -> impl Iterator<Item = RecordType> {
        RecordType::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

impl From<RecordType> for RecordTypes {
    fn from(ty: RecordType) -> Self {
        Self(ty.bit())
    }
}

impl BitOr for RecordTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOr<RecordType> for RecordTypes {
    type Output = Self;

    fn bitor(self, rhs: RecordType) -> Self {
        Self(self.0 | rhs.bit())
    }
}

impl BitOr for RecordType {
    type Output = RecordTypes;

    fn bitor(self, rhs: Self) -> RecordTypes {
        RecordTypes(self.bit() | rhs.bit())
    }
}

/// A single typed value with freshness metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub value: Value,
    /// Logical clock assigned by the writer.
    pub clock: u64,
    /// Writer priority; higher quality wins regardless of clock.
    #[serde(default)]
    pub quality: u32,
}

impl Record {
    /// Creates a record with clock and quality zero.
    #[must_use]
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            clock: 0,
            quality: 0,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: u64) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_quality(mut self, quality: u32) -> Self {
        self.quality = quality;
        self
    }

    /// Returns a record carrying `value` and this record's metadata.
    #[must_use]
    pub fn with_value(&self, value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            clock: self.clock,
            quality: self.quality,
        }
    }

    #[must_use]
    pub const fn record_type(&self) -> RecordType {
        self.value.record_type()
    }

    /// Returns true if this record should replace `existing` in a store.
    #[must_use]
    pub const fn supersedes(&self, existing: &Self) -> bool {
        if self.quality != existing.quality {
            return self.quality > existing.quality;
        }
        self.clock >= existing.clock
    }
}
