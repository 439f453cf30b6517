//! Sliding-window bandwidth accounting.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default accounting window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Window {
    events: VecDeque<(Instant, u64)>,
    total: u64,
}

impl Window {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, bytes)) = self.events.front() {
            if now.saturating_duration_since(at) < window {
                break;
            }
            self.events.pop_front();
            self.total -= bytes;
        }
    }
}

/// Bytes transferred over a rolling window.
///
/// Limits enforced through [`BandwidthMonitor::wait_for`] are soft: a message
/// that arrives on an empty window is always allowed, even if it alone is
/// over budget.
#[derive(Debug)]
pub struct BandwidthMonitor {
    window: Duration,
    state: Mutex<Window>,
}

impl Default for BandwidthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl BandwidthMonitor {
    /// A zero window is bumped to one millisecond.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            state: Mutex::new(Window::default()),
        }
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        // the window holds plain counters, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Records `bytes` transferred now.
    pub fn add(&self, bytes: u64) {
        self.add_at(Instant::now(), bytes);
    }

    /// Records `bytes` transferred at `at`.
    pub fn add_at(&self, at: Instant, bytes: u64) {
        let mut state = self.lock();
        state.prune(at, self.window);
        state.events.push_back((at, bytes));
        state.total += bytes;
    }

    /// Bytes recorded inside the window.
    #[must_use]
    pub fn bytes_in_window(&self) -> u64 {
        let mut state = self.lock();
        state.prune(Instant::now(), self.window);
        state.total
    }

    /// Average rate over the window, in bytes/sec.
    #[must_use]
    pub fn bytes_per_second(&self) -> u64 {
        let bytes = self.bytes_in_window() as f64;
        (bytes / self.window.as_secs_f64()) as u64
    }

    /// How long to wait before `next` more bytes fit under `limit` bytes/sec.
    /// `None` means send now.
    #[must_use]
    pub fn wait_for(&self, next: u64, limit: u64) -> Option<Duration> {
        self.wait_for_at(Instant::now(), next, limit)
    }

    /// [`BandwidthMonitor::wait_for`] evaluated at `now`.
    #[must_use]
    pub fn wait_for_at(&self, now: Instant, next: u64, limit: u64) -> Option<Duration> {
        let mut state = self.lock();
        state.prune(now, self.window);
        if state.events.is_empty() {
            return None;
        }

        let budget = (limit as f64 * self.window.as_secs_f64()) as u64;
        let mut remaining = state.total;
        if remaining.saturating_add(next) <= budget {
            return None;
        }

        // wait until enough of the oldest traffic has aged out
        for &(at, bytes) in &state.events {
            remaining -= bytes;
            if remaining == 0 || remaining.saturating_add(next) <= budget {
                return Some((at + self.window).saturating_duration_since(now));
            }
        }
        Some(self.window)
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.events.clear();
        state.total = 0;
    }
}
