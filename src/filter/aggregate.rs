//! Aggregate filters: whole-packet observers.
//!
//! An aggregate filter sees the packet after every record filter has run.
//! It cannot edit the packet directly; it can stage extra records on the
//! context, which the transport merges in after the aggregate pass.

use std::sync::Arc;

use crate::context::TransportContext;
use crate::error::FilterError;
use crate::packet::Packet;

/// A whole-packet observer.
pub trait AggregateFilter: Send + Sync {
    fn filter(&self, packet: &Packet, context: &mut TransportContext) -> Result<(), FilterError>;
}

impl<F> AggregateFilter for F
where
    F: Fn(&Packet, &mut TransportContext) -> Result<(), FilterError> + Send + Sync,
{
    fn filter(&self, packet: &Packet, context: &mut TransportContext) -> Result<(), FilterError> {
        self(packet, context)
    }
}

/// Ordered list of aggregate filters for one boundary.
#[derive(Clone, Default)]
pub struct AggregateFilterChain {
    filters: Vec<Arc<dyn AggregateFilter>>,
}

impl std::fmt::Debug for AggregateFilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateFilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl AggregateFilterChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Arc<dyn AggregateFilter>) {
        self.filters.push(filter);
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs every filter once in registration order. Failures are logged and
    /// the remaining filters still run.
    pub fn run(&self, packet: &Packet, context: &mut TransportContext) {
        for (index, filter) in self.filters.iter().enumerate() {
            if let Err(error) = filter.filter(packet, context) {
                tracing::warn!(index, operation = %context.operation(), %error, "aggregate filter failed, skipping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::context::Operation;
    use crate::record::Record;

    #[test]
    fn test_runs_once_per_packet_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = AggregateFilterChain::new();

        let first = Arc::clone(&calls);
        chain.push(Arc::new(move |packet: &Packet, ctx: &mut TransportContext| -> Result<(), FilterError> {
            assert_eq!(first.fetch_add(1, Ordering::SeqCst), 0);
            ctx.add_record("count", Record::new(packet.len() as i64));
            Ok(())
        }));
        let second = Arc::clone(&calls);
        chain.push(Arc::new(move |_: &Packet, ctx: &mut TransportContext| -> Result<(), FilterError> {
            assert_eq!(second.fetch_add(1, Ordering::SeqCst), 1);
            // staged records from earlier filters are visible
            assert!(ctx.records().contains_key("count"));
            Ok(())
        }));

        let mut packet = Packet::new();
        packet.insert("a", Record::new(1));
        packet.insert("b", Record::new(2));

        let mut ctx = TransportContext::new(Operation::Send, "test", "agent.0");
        chain.run(&packet, &mut ctx);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.records().get("count").unwrap().value.as_integer(), Some(2));
    }

    #[test]
    fn test_failure_does_not_stop_later_filters() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut chain = AggregateFilterChain::new();
        chain.push(Arc::new(|_: &Packet, _: &mut TransportContext| -> Result<(), FilterError> {
            Err(FilterError::aggregate("quota exceeded"))
        }));
        let counter = Arc::clone(&ran);
        chain.push(Arc::new(move |_: &Packet, _: &mut TransportContext| -> Result<(), FilterError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let mut ctx = TransportContext::new(Operation::Receive, "test", "agent.1");
        chain.run(&Packet::new(), &mut ctx);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(chain.len(), 2);
    }
}
