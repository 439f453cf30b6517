//! Simulated packet loss.
//!
//! The scheduler decides per outbound packet whether it is sent or dropped.
//! Bursts are accounted per burst: after a drop, following packets keep being
//! dropped until `burst` consecutive drops have happened, and the run resets
//! on the next sent packet. With `burst > 1` the rate is divided by
//! `burst - 1` so the long-run loss stays near the configured percentage.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::qos::policy::{DropPolicy, DropRate};

const MAX_STRIDE: u64 = 150_000_000;
const TICKETS_PER_UNIT: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy)]
struct StrideTicket {
    stride: u64,
    pass: u64,
    send: bool,
}

impl StrideTicket {
    fn new(rate: f64, send: bool) -> Self {
        let tickets = (TICKETS_PER_UNIT * rate.max(0.0)) as u64;
        let stride = if tickets > 0 { MAX_STRIDE / tickets } else { u64::MAX / 4 };
        Self {
            stride: stride.max(1),
            pass: stride.max(1),
            send,
        }
    }
}

#[derive(Debug)]
struct DropState {
    rng: StdRng,
    sent: u64,
    dropped: u64,
    consecutive_drops: u64,
    tickets: Option<(DropRate, [StrideTicket; 2])>,
}

/// Per-transport loss scheduler.
#[derive(Debug)]
pub struct DropScheduler {
    state: Mutex<DropState>,
}

impl Default for DropScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn effective_rate(rate: &DropRate) -> f64 {
    let fraction = rate.percentage / 100.0;
    if rate.burst > 1 {
        fraction / (rate.burst - 1) as f64
    } else {
        fraction
    }
}

impl DropScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Reproducible scheduler for tests and simulations.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            state: Mutex::new(DropState {
                rng,
                sent: 0,
                dropped: 0,
                consecutive_drops: 0,
                tickets: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DropState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Returns true if the next packet should be sent, false if it is lost.
    pub fn should_send(&self, rate: &DropRate) -> bool {
        let mut state = self.lock();
        let send = if rate.is_disabled() {
            true
        } else if rate.percentage >= 100.0
            || (state.consecutive_drops > 0 && rate.burst > 1 && state.consecutive_drops < rate.burst)
        {
            false
        } else {
            match rate.policy {
                DropPolicy::Probabilistic => state.rng.gen::<f64>() >= effective_rate(rate),
                DropPolicy::Deterministic => Self::next_stride(&mut state, rate),
            }
        };

        if send {
            state.sent += 1;
            state.consecutive_drops = 0;
        } else {
            state.dropped += 1;
            state.consecutive_drops += 1;
        }
        send
    }

    fn next_stride(state: &mut DropState, rate: &DropRate) -> bool {
        let stale = state.tickets.as_ref().map_or(true, |(seen, _)| seen != rate);
        if stale {
            let drop_rate = effective_rate(rate).min(1.0);
            let tickets = [
                StrideTicket::new(1.0 - drop_rate, true),
                StrideTicket::new(drop_rate, false),
            ];
            state.tickets = Some((*rate, tickets));
        }

        let Some((_, tickets)) = state.tickets.as_mut() else {
            return true;
        };
        // lowest pass runs next; ties go to the sender
        let index = usize::from(tickets[1].pass < tickets[0].pass);
        let ticket = &mut tickets[index];
        ticket.pass = ticket.pass.saturating_add(ticket.stride);
        ticket.send
    }

    #[must_use]
    pub fn sent(&self) -> u64 {
        self.lock().sent
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    #[must_use]
    pub fn consecutive_drops(&self) -> u64 {
        self.lock().consecutive_drops
    }

    /// Resets counters and the stride schedule.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.sent = 0;
        state.dropped = 0;
        state.consecutive_drops = 0;
        state.tickets = None;
    }
}
