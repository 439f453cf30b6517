//! Record filters: per-key transforms selected by record type.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::context::TransportContext;
use crate::error::FilterError;
use crate::packet::Packet;
use crate::record::{Record, RecordType, RecordTypes};

/// Result of one record filter invocation.
pub type RecordOutcome = Result<Option<Record>, FilterError>;

/// A per-record transform.
///
/// Returning `Ok(None)` removes the key from the packet. Returning an error
/// skips this filter for the key; the input record continues down the chain.
pub trait RecordFilter: Send + Sync {
    fn filter(
        &self,
        key: &str,
        record: Record,
        context: &mut TransportContext,
    ) -> RecordOutcome;
}

impl<F> RecordFilter for F
where
    F: Fn(&str, Record, &mut TransportContext) -> RecordOutcome + Send + Sync,
{
    fn filter(
        &self,
        key: &str,
        record: Record,
        context: &mut TransportContext,
    ) -> RecordOutcome {
        self(key, record, context)
    }
}

/// Passes every record through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl RecordFilter for PassThrough {
    fn filter(
        &self,
        _key: &str,
        record: Record,
        _context: &mut TransportContext,
    ) -> RecordOutcome {
        Ok(Some(record))
    }
}

/// Removes every record it sees.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardAll;

impl RecordFilter for DiscardAll {
    fn filter(
        &self,
        _key: &str,
        _record: Record,
        _context: &mut TransportContext,
    ) -> RecordOutcome {
        Ok(None)
    }
}

/// Record filters for one boundary, grouped by record type.
#[derive(Clone, Default)]
pub struct RecordFilterChain {
    chains: BTreeMap<RecordType, Vec<Arc<dyn RecordFilter>>>,
}

impl std::fmt::Debug for RecordFilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.chains.iter().map(|(ty, filters)| (ty.name(), filters.len())))
            .finish()
    }
}

impl RecordFilterChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `filter` to the chain of every type in `types`.
    pub fn add(&mut self, types: RecordTypes, filter: Arc<dyn RecordFilter>) {
        for ty in types.iter() {
            self.chains.entry(ty).or_default().push(Arc::clone(&filter));
        }
    }

    /// Removes every filter registered for the types in `types`.
    pub fn clear(&mut self, types: RecordTypes) {
        for ty in types.iter() {
            self.chains.remove(&ty);
        }
    }

    /// Number of filters that would run for `ty`.
    #[must_use]
    pub fn len_for(&self, ty: RecordType) -> usize {
        self.chains.get(&ty).map_or(0, Vec::len)
    }

    /// Types with at least one filter.
    #[must_use]
    pub fn filtered_types(&self) -> RecordTypes {
        self.chains
            .iter()
            .filter(|(_, filters)| !filters.is_empty())
            .fold(RecordTypes::NONE, |acc, (ty, _)| acc | *ty)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chains.values().all(Vec::is_empty)
    }

    /// Runs the chain for one record. The chain is picked by the input
    /// record's type; a filter that changes the type does not switch chains.
    pub fn filter_record(
        &self,
        key: &str,
        record: Record,
        context: &mut TransportContext,
    ) -> Option<Record> {
        let Some(filters) = self.chains.get(&record.record_type()) else {
            return Some(record);
        };

        let mut current = record;
        for filter in filters {
            match filter.filter(key, current.clone(), context) {
                Ok(Some(next)) => current = next,
                Ok(None) => {
                    tracing::trace!(key, operation = %context.operation(), "record removed by filter");
                    return None;
                }
                Err(error) => {
                    tracing::warn!(key, operation = %context.operation(), %error, "record filter failed, skipping");
                }
            }
        }
        Some(current)
    }

    /// Runs every record of `packet` through its chain, in packet order.
    #[must_use]
    pub fn filter_packet(&self, packet: Packet, context: &mut TransportContext) -> Packet {
        if self.is_empty() {
            return packet;
        }

        packet
            .into_iter()
            .filter_map(|(key, record)| {
                self.filter_record(&key, record, context)
                    .map(|record| (key, record))
            })
            .collect()
    }
}
