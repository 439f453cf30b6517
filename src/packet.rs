//! Packets: one atomic batch of key/record updates.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::record::Record;

/// An ordered mapping from key to record.
///
/// Keys are unique and keep their first insertion position, so filters and
/// logs always see the batch in the same order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Packet {
    records: IndexMap<String, Record>,
}

impl Packet {
    /// Create an empty packet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, record: Record) -> Option<Record> {
        self.records.insert(key.into(), record)
    }

    /// Removes a key while preserving the order of the remaining keys.
    pub fn remove(&mut self, key: &str) -> Option<Record> {
        self.records.shift_remove(key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Record)> {
        self.records.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Moves every record of `other` into this packet.
    pub fn merge(&mut self, other: Self) {
        self.records.extend(other.records);
    }

    /// Approximate payload size (keys plus values) in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.records
            .iter()
            .map(|(k, r)| k.len() + r.value.payload_size())
            .sum()
    }
}

impl IntoIterator for Packet {
    type Item = (String, Record);
    type IntoIter = indexmap::map::IntoIter<String, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<K: Into<String>> FromIterator<(K, Record)> for Packet {
    fn from_iter<I: IntoIterator<Item = (K, Record)>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().map(|(k, r)| (k.into(), r)).collect(),
        }
    }
}
