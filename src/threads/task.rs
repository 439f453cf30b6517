//! Units of work and their control tokens.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::storage::KnowledgeStore;

/// Lifecycle of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Registered, `init` not finished yet.
    Created,
    /// Running or waiting for its next tick.
    Running,
    /// Parked until resumed or terminated.
    Paused,
    /// Finished, terminated, or panicked. Final.
    Terminated,
}

impl TaskState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Running => 1,
            Self::Paused => 2,
            Self::Terminated => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Paused,
            _ => Self::Terminated,
        }
    }
}

/// User-supplied work run by the [`Threader`](crate::threads::Threader).
///
/// `init` and `cleanup` run exactly once, on the task's own thread. `run` is
/// invoked once, periodically or back-to-back depending on how the task was
/// started. Long-running `run` bodies should poll
/// [`TaskControl::is_terminated`]; cancellation is cooperative.
pub trait Task: Send + 'static {
    fn init(&mut self, _control: &TaskControl) {}

    fn run(&mut self, control: &TaskControl);

    fn cleanup(&mut self, _control: &TaskControl) {}
}

impl<F> Task for F
where
    F: FnMut(&TaskControl) + Send + 'static,
{
    fn run(&mut self, control: &TaskControl) {
        self(control);
    }
}

struct ControlInner {
    name: String,
    store: Arc<dyn KnowledgeStore>,
    terminated: AtomicBool,
    paused: AtomicBool,
    state: AtomicU8,
    invocations: AtomicU64,
    hertz_bits: AtomicU64,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    panicked: AtomicBool,
    // never sent on; dropping the sender releases every waiter
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
}

/// Cancellation token and shared context handed to a running task.
#[derive(Clone)]
pub struct TaskControl {
    inner: Arc<ControlInner>,
}

impl std::fmt::Debug for TaskControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskControl")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("paused", &self.is_paused())
            .field("terminated", &self.is_terminated())
            .field("hertz", &self.hertz())
            .field("invocations", &self.invocations())
            .finish_non_exhaustive()
    }
}

impl TaskControl {
    pub(crate) fn new(name: &str, store: Arc<dyn KnowledgeStore>, hertz: f64, paused: bool) -> Self {
        // one pending wake is enough; extra signals coalesce
        let (wake_tx, wake_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(0);
        Self {
            inner: Arc::new(ControlInner {
                name: name.to_string(),
                store,
                terminated: AtomicBool::new(false),
                paused: AtomicBool::new(paused),
                state: AtomicU8::new(TaskState::Created.to_u8()),
                invocations: AtomicU64::new(0),
                hertz_bits: AtomicU64::new(hertz.to_bits()),
                wake_tx,
                wake_rx,
                panicked: AtomicBool::new(false),
                done_tx: Mutex::new(Some(done_tx)),
                done_rx,
            }),
        }
    }

    /// Name the task was registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Store shared by every task of the threader.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn KnowledgeStore> {
        &self.inner.store
    }

    /// True once termination was requested. Long `run` bodies should poll it.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    /// True while a pause is requested.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Lifecycle state last reported by the task's thread.
    #[must_use]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Completed `run` invocations.
    #[must_use]
    pub fn invocations(&self) -> u64 {
        self.inner.invocations.load(Ordering::Acquire)
    }

    /// Current rate: `< 0` one shot, `0` back-to-back, `> 0` periodic.
    #[must_use]
    pub fn hertz(&self) -> f64 {
        f64::from_bits(self.inner.hertz_bits.load(Ordering::Acquire))
    }

    fn wake(&self) {
        let _ = self.inner.wake_tx.try_send(());
    }

    pub(crate) fn request_pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
        self.wake();
    }

    pub(crate) fn request_resume(&self) {
        self.inner.paused.store(false, Ordering::Release);
        self.wake();
    }

    pub(crate) fn request_terminate(&self) {
        self.inner.terminated.store(true, Ordering::Release);
        self.wake();
    }

    pub(crate) fn set_hertz(&self, hertz: f64) {
        self.inner.hertz_bits.store(hertz.to_bits(), Ordering::Release);
        self.wake();
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        // terminated is final
        let _ = self.inner.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current != TaskState::Terminated.to_u8()).then_some(state.to_u8())
        });
    }

    pub(crate) fn record_invocation(&self) {
        self.inner.invocations.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true if both tokens belong to the same task instance.
    pub(crate) fn same_task(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// True once the task's thread unwound from a panic.
    pub(crate) fn panicked(&self) -> bool {
        self.inner.panicked.load(Ordering::Acquire)
    }

    /// Marks the task terminated and releases everyone blocked in
    /// [`TaskControl::wait_finished`]. Idempotent.
    pub(crate) fn finish(&self, panicked: bool) {
        if panicked {
            self.inner.panicked.store(true, Ordering::Release);
        }
        self.set_state(TaskState::Terminated);
        self.inner
            .done_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Blocks until [`TaskControl::finish`] has run. Any number of threads
    /// can wait at once.
    pub(crate) fn wait_finished(&self) {
        let _ = self.inner.done_rx.recv();
    }

    /// Blocks until woken by a control request or until `timeout` elapses.
    /// `None` waits for a wake only.
    pub(crate) fn wait(&self, timeout: Option<Duration>) {
        match timeout {
            Some(timeout) => {
                let _ = self.inner.wake_rx.recv_timeout(timeout);
            }
            None => {
                let _ = self.inner.wake_rx.recv();
            }
        }
    }
}
