//! Registration surface for every filter chain of a transport.
//!
//! Registration takes a short write lock. Running a boundary clones the chain
//! handles first, so user filters never execute under the pipeline lock and
//! can register more filters from inside a callback without deadlocking.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::context::{Operation, TransportContext};
use crate::error::{MeshError, MeshResult};
use crate::filter::aggregate::{AggregateFilter, AggregateFilterChain};
use crate::filter::buffer::{BufferFilter, BufferFilterChain};
use crate::filter::record::{RecordFilter, RecordFilterChain};
use crate::packet::Packet;
use crate::record::RecordTypes;
use crate::release::Liveness;

/// Record and aggregate chains for one boundary.
#[derive(Debug, Clone, Default)]
pub struct BoundaryFilters {
    pub records: RecordFilterChain,
    pub aggregates: AggregateFilterChain,
}

impl BoundaryFilters {
    /// Runs the record chain, then the aggregate chain, then merges every
    /// record staged on the context. Staged records are not filtered again.
    #[must_use]
    pub fn run(&self, packet: Packet, context: &mut TransportContext) -> Packet {
        let mut filtered = self.records.filter_packet(packet, context);
        self.aggregates.run(&filtered, context);

        let staged = context.take_records();
        if !staged.is_empty() {
            tracing::trace!(staged = staged.len(), operation = %context.operation(), "merging staged records");
            filtered.merge(staged);
        }
        filtered
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty() && self.aggregates.is_empty()
    }
}

#[derive(Debug, Default)]
struct PipelineState {
    send: BoundaryFilters,
    receive: BoundaryFilters,
    rebroadcast: BoundaryFilters,
    buffer: BufferFilterChain,
}

impl PipelineState {
    fn boundary(&self, operation: Operation) -> Option<&BoundaryFilters> {
        match operation {
            Operation::Send => Some(&self.send),
            Operation::Receive => Some(&self.receive),
            Operation::Rebroadcast => Some(&self.rebroadcast),
            Operation::Idle => None,
        }
    }

    fn boundary_mut(&mut self, operation: Operation) -> Option<&mut BoundaryFilters> {
        match operation {
            Operation::Send => Some(&mut self.send),
            Operation::Receive => Some(&mut self.receive),
            Operation::Rebroadcast => Some(&mut self.rebroadcast),
            Operation::Idle => None,
        }
    }
}

/// Every filter chain of one transport.
#[derive(Debug)]
pub struct FilterPipeline {
    state: RwLock<PipelineState>,
    liveness: Liveness,
}

impl Default for FilterPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PipelineState::default()),
            liveness: Liveness::new("FilterPipeline"),
        }
    }

    fn read(&self) -> MeshResult<RwLockReadGuard<'_, PipelineState>> {
        self.liveness.ensure_live()?;
        self.state
            .read()
            .map_err(|_| MeshError::internal("poisoned lock: filter pipeline"))
    }

    fn write(&self) -> MeshResult<RwLockWriteGuard<'_, PipelineState>> {
        self.liveness.ensure_live()?;
        self.state
            .write()
            .map_err(|_| MeshError::internal("poisoned lock: filter pipeline"))
    }

    fn add_record_filter(
        &self,
        operation: Operation,
        types: RecordTypes,
        filter: Arc<dyn RecordFilter>,
    ) -> MeshResult<()> {
        let mut state = self.write()?;
        if let Some(boundary) = state.boundary_mut(operation) {
            boundary.records.add(types, filter);
        }
        tracing::debug!(%operation, types = ?types.iter().map(|t| t.name()).collect::<Vec<_>>(), "record filter added");
        Ok(())
    }

    fn add_aggregate_filter(&self, operation: Operation, filter: Arc<dyn AggregateFilter>) -> MeshResult<()> {
        let mut state = self.write()?;
        if let Some(boundary) = state.boundary_mut(operation) {
            boundary.aggregates.push(filter);
        }
        tracing::debug!(%operation, "aggregate filter added");
        Ok(())
    }

    /// Adds a record filter to the send chain of every type in `types`.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn add_send_filter(&self, types: RecordTypes, filter: impl RecordFilter + 'static) -> MeshResult<()> {
        self.add_record_filter(Operation::Send, types, Arc::new(filter))
    }

    /// Adds a record filter to the receive chain of every type in `types`.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn add_receive_filter(&self, types: RecordTypes, filter: impl RecordFilter + 'static) -> MeshResult<()> {
        self.add_record_filter(Operation::Receive, types, Arc::new(filter))
    }

    /// Adds a record filter to the rebroadcast chain of every type in `types`.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn add_rebroadcast_filter(&self, types: RecordTypes, filter: impl RecordFilter + 'static) -> MeshResult<()> {
        self.add_record_filter(Operation::Rebroadcast, types, Arc::new(filter))
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn add_send_aggregate_filter(&self, filter: impl AggregateFilter + 'static) -> MeshResult<()> {
        self.add_aggregate_filter(Operation::Send, Arc::new(filter))
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn add_receive_aggregate_filter(&self, filter: impl AggregateFilter + 'static) -> MeshResult<()> {
        self.add_aggregate_filter(Operation::Receive, Arc::new(filter))
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn add_rebroadcast_aggregate_filter(&self, filter: impl AggregateFilter + 'static) -> MeshResult<()> {
        self.add_aggregate_filter(Operation::Rebroadcast, Arc::new(filter))
    }

    /// Appends a buffer filter. Encode runs in registration order, decode in
    /// reverse, so every participant must register the same filters in the
    /// same order.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn add_buffer_filter(&self, filter: impl BufferFilter + 'static) -> MeshResult<()> {
        let mut state = self.write()?;
        state.buffer.push(Arc::new(filter));
        tracing::debug!(count = state.buffer.len(), "buffer filter added");
        Ok(())
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn clear_buffer_filters(&self) -> MeshResult<()> {
        self.write()?.buffer.clear();
        Ok(())
    }

    fn clear_record_filters(&self, operation: Operation, types: RecordTypes) -> MeshResult<()> {
        let mut state = self.write()?;
        if let Some(boundary) = state.boundary_mut(operation) {
            boundary.records.clear(types);
        }
        Ok(())
    }

    fn clear_aggregate_filters(&self, operation: Operation) -> MeshResult<()> {
        let mut state = self.write()?;
        if let Some(boundary) = state.boundary_mut(operation) {
            boundary.aggregates.clear();
        }
        Ok(())
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn clear_send_filters(&self, types: RecordTypes) -> MeshResult<()> {
        self.clear_record_filters(Operation::Send, types)
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn clear_receive_filters(&self, types: RecordTypes) -> MeshResult<()> {
        self.clear_record_filters(Operation::Receive, types)
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn clear_rebroadcast_filters(&self, types: RecordTypes) -> MeshResult<()> {
        self.clear_record_filters(Operation::Rebroadcast, types)
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn clear_send_aggregate_filters(&self) -> MeshResult<()> {
        self.clear_aggregate_filters(Operation::Send)
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn clear_receive_aggregate_filters(&self) -> MeshResult<()> {
        self.clear_aggregate_filters(Operation::Receive)
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn clear_rebroadcast_aggregate_filters(&self) -> MeshResult<()> {
        self.clear_aggregate_filters(Operation::Rebroadcast)
    }

    fn filtered_types(&self, operation: Operation) -> MeshResult<RecordTypes> {
        Ok(self
            .read()?
            .boundary(operation)
            .map_or(RecordTypes::NONE, |b| b.records.filtered_types()))
    }

    fn aggregate_count(&self, operation: Operation) -> MeshResult<usize> {
        Ok(self.read()?.boundary(operation).map_or(0, |b| b.aggregates.len()))
    }

    /// Record types that have at least one send filter.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn send_filtered_types(&self) -> MeshResult<RecordTypes> {
        self.filtered_types(Operation::Send)
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn receive_filtered_types(&self) -> MeshResult<RecordTypes> {
        self.filtered_types(Operation::Receive)
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn rebroadcast_filtered_types(&self) -> MeshResult<RecordTypes> {
        self.filtered_types(Operation::Rebroadcast)
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn send_aggregate_filters(&self) -> MeshResult<usize> {
        self.aggregate_count(Operation::Send)
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn receive_aggregate_filters(&self) -> MeshResult<usize> {
        self.aggregate_count(Operation::Receive)
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn rebroadcast_aggregate_filters(&self) -> MeshResult<usize> {
        self.aggregate_count(Operation::Rebroadcast)
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn buffer_filters(&self) -> MeshResult<usize> {
        Ok(self.read()?.buffer.len())
    }

    /// Snapshot of the chains for `operation`.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn boundary(&self, operation: Operation) -> MeshResult<BoundaryFilters> {
        Ok(self.read()?.boundary(operation).cloned().unwrap_or_default())
    }

    /// Snapshot of the buffer chain.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn buffer_chain(&self) -> MeshResult<BufferFilterChain> {
        Ok(self.read()?.buffer.clone())
    }

    /// Runs the record and aggregate chains of the context's boundary.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn run(&self, packet: Packet, context: &mut TransportContext) -> MeshResult<Packet> {
        let filters = self.boundary(context.operation())?;
        if filters.is_empty() {
            return Ok(packet);
        }
        Ok(filters.run(packet, context))
    }

    /// Drops every filter. Later calls fail with
    /// [`MeshError::UseAfterRelease`].
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] if already released.
    pub fn release(&self) -> MeshResult<()> {
        self.liveness.release()?;
        if let Ok(mut state) = self.state.write() {
            *state = PipelineState::default();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FilterError;
    use crate::filter::codec::IdentityFilter;
    use crate::filter::record::{DiscardAll, RecordOutcome};
    use crate::record::{Record, RecordType};

    #[test]
    fn test_boundaries_are_independent() {
        let pipeline = FilterPipeline::new();
        pipeline.add_send_filter(RecordType::Integer.into(), DiscardAll).unwrap();
        pipeline.add_receive_aggregate_filter(|_: &Packet, _: &mut TransportContext| -> Result<(), FilterError> { Ok(()) }).unwrap();

        assert!(pipeline.send_filtered_types().unwrap().contains(RecordType::Integer));
        assert!(pipeline.receive_filtered_types().unwrap().is_empty());
        assert_eq!(pipeline.receive_aggregate_filters().unwrap(), 1);
        assert_eq!(pipeline.send_aggregate_filters().unwrap(), 0);

        let mut packet = Packet::new();
        packet.insert("n", Record::new(1));
        let mut send = TransportContext::new(Operation::Send, "d", "o");
        assert!(pipeline.run(packet.clone(), &mut send).unwrap().is_empty());
        let mut receive = TransportContext::new(Operation::Receive, "d", "o");
        assert_eq!(pipeline.run(packet, &mut receive).unwrap().len(), 1);
    }

    #[test]
    fn test_staged_records_are_merged_unfiltered() {
        let pipeline = FilterPipeline::new();
        pipeline.add_send_filter(RecordTypes::ALL, |key: &str, record: Record, ctx: &mut TransportContext| -> RecordOutcome {
            if key == "secret" {
                ctx.add_record("redacted", Record::new(1));
                return Ok(None);
            }
            Ok(Some(record))
        }).unwrap();
        pipeline.add_send_aggregate_filter(|packet: &Packet, ctx: &mut TransportContext| -> Result<(), FilterError> {
            ctx.add_record("secret", Record::new(packet.len() as i64));
            Ok(())
        }).unwrap();

        let mut packet = Packet::new();
        packet.insert("secret", Record::new(42));
        packet.insert("public", Record::new(7));

        let mut ctx = TransportContext::new(Operation::Send, "d", "o");
        let out = pipeline.run(packet, &mut ctx).unwrap();
        assert_eq!(out.get("public").unwrap().value.as_integer(), Some(7));
        assert_eq!(out.get("redacted").unwrap().value.as_integer(), Some(1));
        // staged by the aggregate filter after "secret" was removed
        assert_eq!(out.get("secret").unwrap().value.as_integer(), Some(1));
        assert!(ctx.records().is_empty());
    }

    #[test]
    fn test_filters_may_register_from_inside_a_callback() {
        let pipeline = Arc::new(FilterPipeline::new());
        let inner = Arc::clone(&pipeline);
        pipeline
            .add_send_aggregate_filter(move |_: &Packet, _: &mut TransportContext| -> Result<(), FilterError> {
                inner.add_buffer_filter(IdentityFilter).map_err(|e| FilterError::aggregate(e.to_string()))
            })
            .unwrap();

        let mut ctx = TransportContext::new(Operation::Send, "d", "o");
        pipeline.run(Packet::new(), &mut ctx).unwrap();
        assert_eq!(pipeline.buffer_filters().unwrap(), 1);
    }

    #[test]
    fn test_clear_operations() {
        let pipeline = FilterPipeline::new();
        pipeline.add_buffer_filter(IdentityFilter).unwrap();
        pipeline.add_rebroadcast_filter(RecordTypes::ALL, DiscardAll).unwrap();
        pipeline.add_rebroadcast_aggregate_filter(|_: &Packet, _: &mut TransportContext| -> Result<(), FilterError> { Ok(()) }).unwrap();

        pipeline.clear_buffer_filters().unwrap();
        pipeline.clear_rebroadcast_filters(RecordType::String.into()).unwrap();
        pipeline.clear_rebroadcast_aggregate_filters().unwrap();

        assert_eq!(pipeline.buffer_filters().unwrap(), 0);
        let remaining = pipeline.rebroadcast_filtered_types().unwrap();
        assert!(!remaining.contains(RecordType::String));
        assert!(remaining.contains(RecordType::Integer));
        assert_eq!(pipeline.rebroadcast_aggregate_filters().unwrap(), 0);
    }

    #[test]
    fn test_use_after_release() {
        let pipeline = FilterPipeline::new();
        pipeline.release().unwrap();

        assert!(pipeline.add_send_filter(RecordTypes::ALL, DiscardAll).unwrap_err().is_release());
        assert!(pipeline.buffer_filters().unwrap_err().is_release());
        assert!(pipeline.release().unwrap_err().is_release());
    }
}
