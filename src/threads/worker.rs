//! The loop each scheduled task runs on its own OS thread.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::MeshResult;
use crate::threads::task::{Task, TaskControl, TaskState};

/// Marks the task finished however the thread exits, panics included.
struct TerminationGuard<'a>(&'a TaskControl);

impl Drop for TerminationGuard<'_> {
    fn drop(&mut self) {
        let panicked = thread::panicking();
        if panicked {
            tracing::warn!(task = self.0.name(), "task panicked");
        } else {
            tracing::info!(task = self.0.name(), invocations = self.0.invocations(), "task stopped");
        }
        self.0.finish(panicked);
    }
}

/// `None` when `1 / hertz` does not fit in a `Duration`.
fn period(hertz: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(1.0 / hertz).ok()
}

/// First tick strictly after `now`, skipping every tick that was missed.
/// `None` when the tick lies beyond what an `Instant` can represent.
fn next_tick_after(next: Instant, period: Duration, now: Instant) -> Option<Instant> {
    let next = next.checked_add(period)?;
    if next > now {
        return Some(next);
    }
    let behind = now.duration_since(next).as_nanos();
    let into_period = u64::try_from(behind % period.as_nanos()).ok()?;
    now.checked_add(period.checked_sub(Duration::from_nanos(into_period))?)
}

pub(crate) fn spawn(control: TaskControl, mut task: Box<dyn Task>) -> MeshResult<JoinHandle<()>> {
    let thread_name = format!("kyromesh-task-{}", control.name());
    let handle = thread::Builder::new().name(thread_name).spawn(move || {
        let _guard = TerminationGuard(&control);
        tracing::info!(task = control.name(), hertz = control.hertz(), "task started");

        task.init(&control);
        run_loop(&control, task.as_mut());
        task.cleanup(&control);
    })?;
    Ok(handle)
}

fn run_loop(control: &TaskControl, task: &mut dyn Task) {
    let mut hertz = control.hertz();
    // `None`: the next tick is out of range, so only a control request wakes us
    let mut next_tick = Some(Instant::now());

    loop {
        if control.is_terminated() {
            break;
        }
        if control.is_paused() {
            control.set_state(TaskState::Paused);
            control.wait(None);
            continue;
        }
        control.set_state(TaskState::Running);

        let current = control.hertz();
        if current.to_bits() != hertz.to_bits() {
            tracing::debug!(task = control.name(), from = hertz, to = current, "task rate changed");
            hertz = current;
            next_tick = Some(Instant::now());
        }

        if hertz > 0.0 {
            let Some(tick) = next_tick else {
                control.wait(None);
                continue;
            };
            let now = Instant::now();
            if now < tick {
                control.wait(Some(tick - now));
                continue;
            }
        }

        task.run(control);
        control.record_invocation();

        if hertz < 0.0 {
            break;
        }
        if hertz > 0.0 {
            next_tick = next_tick
                .zip(period(hertz))
                .and_then(|(tick, period)| next_tick_after(tick, period, Instant::now()));
            if next_tick.is_none() {
                tracing::debug!(task = control.name(), hertz, "next tick out of range, waiting for a control request");
            }
        }
    }
}
