//! In-memory knowledge store.
//!
//! Thread-safe reference implementation of [`KnowledgeStore`], intended for
//! embedded usage and tests. A single `RwLock` guards the whole map so a
//! remote packet is always applied as one unit.

use std::collections::HashMap;
use std::sync::RwLock;

use indexmap::IndexSet;

use crate::packet::Packet;
use crate::record::Record;
use crate::storage::traits::{ApplySummary, KnowledgeStore, StoreError};
use crate::value::Value;

fn lock_err(context: &'static str) -> StoreError {
    StoreError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct StoreState {
    records: HashMap<String, Record>,
    modified: IndexSet<String>,
    clock: u64,
}

/// Thread-safe in-memory knowledge store.
#[derive(Debug, Default)]
pub struct InMemoryKnowledgeStore {
    state: RwLock<StoreState>,
    quality: u32,
}

impl InMemoryKnowledgeStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose local writes carry `quality`.
    #[must_use]
    pub fn with_quality(quality: u32) -> Self {
        Self {
            state: RwLock::default(),
            quality,
        }
    }

    /// Current logical clock.
    pub fn clock(&self) -> Result<u64, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("store.clock"))?;
        Ok(state.clock)
    }

    /// Convenience accessor for the stored value.
    pub fn value(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.get(key)?.map(|r| r.value))
    }
}

impl KnowledgeStore for InMemoryKnowledgeStore {
    fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("store.get"))?;
        Ok(state.records.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<Record, StoreError> {
        if key.trim().is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }

        let mut state = self.state.write().map_err(|_| lock_err("store.set"))?;
        state.clock += 1;
        let record = Record {
            value,
            clock: state.clock,
            quality: self.quality,
        };
        state.records.insert(key.to_string(), record.clone());
        state.modified.insert(key.to_string());
        Ok(record)
    }

    fn apply(&self, packet: &Packet) -> Result<ApplySummary, StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("store.apply"))?;
        let mut summary = ApplySummary::default();

        for (key, record) in packet.iter() {
            if key.is_empty() {
                summary.rejected += 1;
                continue;
            }

            let accept = state
                .records
                .get(key)
                .map_or(true, |existing| record.supersedes(existing));

            if accept {
                state.clock = state.clock.max(record.clock);
                state.records.insert(key.to_string(), record.clone());
                summary.accepted += 1;
            } else {
                summary.rejected += 1;
            }
        }

        Ok(summary)
    }

    fn drain_modified(&self) -> Result<Packet, StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("store.drain_modified"))?;
        let modified = std::mem::take(&mut state.modified);

        let mut packet = Packet::new();
        for key in modified {
            if let Some(record) = state.records.get(&key) {
                packet.insert(key.clone(), record.clone());
            }
        }
        Ok(packet)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("store.keys"))?;
        let mut keys: Vec<String> = state.records.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn len(&self) -> Result<usize, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("store.len"))?;
        Ok(state.records.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn set_stamps_increasing_clock() {
        let store = InMemoryKnowledgeStore::new();
        let a = store.set("a", Value::Integer(1)).unwrap();
        let b = store.set("b", Value::Integer(2)).unwrap();
        assert!(b.clock > a.clock);
        assert_eq!(store.clock().unwrap(), 2);
    }

    #[test]
    fn set_rejects_empty_key() {
        let store = InMemoryKnowledgeStore::new();
        let err = store.set("  ", Value::Integer(1)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[test]
    fn drain_modified_returns_changes_in_order_once() {
        let store = InMemoryKnowledgeStore::new();
        store.set("x", Value::Integer(1)).unwrap();
        store.set("y", Value::Integer(2)).unwrap();
        store.set("x", Value::Integer(3)).unwrap();

        let drained = store.drain_modified().unwrap();
        let keys: Vec<&str> = drained.keys().collect();
        assert_eq!(keys, vec!["x", "y"]);
        assert_eq!(drained.get("x").unwrap().value, Value::Integer(3));

        assert!(store.drain_modified().unwrap().is_empty());
    }

    #[test]
    fn apply_honors_quality_and_clock() {
        let store = InMemoryKnowledgeStore::new();

        let mut first = Packet::new();
        first.insert("k", Record::new(1).with_clock(10).with_quality(2));
        assert_eq!(store.apply(&first).unwrap().accepted, 1);

        let mut stale = Packet::new();
        stale.insert("k", Record::new(2).with_clock(5).with_quality(2));
        let summary = store.apply(&stale).unwrap();
        assert_eq!(summary.rejected, 1);
        assert_eq!(store.value("k").unwrap(), Some(Value::Integer(1)));

        let mut higher_quality = Packet::new();
        higher_quality.insert("k", Record::new(3).with_clock(1).with_quality(9));
        assert_eq!(store.apply(&higher_quality).unwrap().accepted, 1);
        assert_eq!(store.value("k").unwrap(), Some(Value::Integer(3)));

        // remote applies are not echoed back out
        assert!(store.drain_modified().unwrap().is_empty());
        // local clock catches up with the newest remote clock
        assert_eq!(store.clock().unwrap(), 10);
    }

    #[test]
    fn apply_is_atomic_for_concurrent_readers() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 1..=200u64 {
                    let mut packet = Packet::new();
                    packet.insert("left", Record::new(i as i64).with_clock(i));
                    packet.insert("right", Record::new(i as i64).with_clock(i));
                    store.apply(&packet).unwrap();
                }
            })
        };

        for _ in 0..200 {
            let keys_seen = store.len().unwrap();
            if keys_seen == 0 {
                continue;
            }
            // both keys of a packet land together
            assert_eq!(keys_seen, 2);
        }

        writer.join().unwrap();
        assert_eq!(store.value("left").unwrap(), store.value("right").unwrap());
    }
}
