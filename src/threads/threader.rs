//! Named, rate-controlled task threads over a shared knowledge store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::error::{MeshError, MeshResult};
use crate::release::Liveness;
use crate::storage::KnowledgeStore;
use crate::threads::task::{Task, TaskControl, TaskState};
use crate::threads::worker;

struct ThreadEntry {
    control: TaskControl,
    handle: Option<JoinHandle<()>>,
}

/// Runs [`Task`]s on dedicated threads and controls them by name.
///
/// ```no_run
/// use std::sync::Arc;
/// use kyromesh::storage::{InMemoryKnowledgeStore, KnowledgeStore};
/// use kyromesh::threads::{TaskControl, Threader};
/// use kyromesh::Value;
///
/// let threader = Threader::new(Arc::new(InMemoryKnowledgeStore::new()));
/// threader
///     .run_at(10.0, "heartbeat", |control: &TaskControl| {
///         let _ = control.store().set("heartbeat", Value::Integer(1));
///     })
///     .unwrap();
/// threader.terminate("heartbeat").unwrap();
/// threader.wait_for_thread("heartbeat").unwrap();
/// ```
pub struct Threader {
    store: Arc<dyn KnowledgeStore>,
    threads: Mutex<HashMap<String, ThreadEntry>>,
    liveness: Liveness,
}

impl std::fmt::Debug for Threader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.names().unwrap_or_default();
        f.debug_struct("Threader").field("threads", &names).finish_non_exhaustive()
    }
}

impl Threader {
    /// An empty threader whose tasks share `store`.
    #[must_use]
    pub fn new(store: Arc<dyn KnowledgeStore>) -> Self {
        Self {
            store,
            threads: Mutex::new(HashMap::new()),
            liveness: Liveness::new("Threader"),
        }
    }

    /// Store shared with every task.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn KnowledgeStore> {
        &self.store
    }

    fn lock(&self) -> MeshResult<MutexGuard<'_, HashMap<String, ThreadEntry>>> {
        self.threads
            .lock()
            .map_err(|_| MeshError::internal("poisoned lock: threader"))
    }

    fn spawn(&self, name: &str, hertz: f64, paused: bool, task: Box<dyn Task>) -> MeshResult<()> {
        self.liveness.ensure_live()?;
        if name.trim().is_empty() {
            return Err(MeshError::invalid_config("thread name is empty"));
        }
        if !hertz.is_finite() {
            return Err(MeshError::invalid_config(format!("invalid rate for thread '{name}'")));
        }

        let mut threads = self.lock()?;
        if let Some(existing) = threads.get_mut(name) {
            if existing.control.state() != TaskState::Terminated {
                return Err(MeshError::DuplicateRegistration {
                    name: name.to_string(),
                });
            }
            // reusing a finished name: reap the old thread first
            if let Some(handle) = existing.handle.take() {
                if handle.join().is_err() {
                    tracing::warn!(task = name, "previous task panicked before its name was reused");
                }
            }
        }

        let control = TaskControl::new(name, Arc::clone(&self.store), hertz, paused);
        let handle = worker::spawn(control.clone(), task)?;
        threads.insert(
            name.to_string(),
            ThreadEntry {
                control,
                handle: Some(handle),
            },
        );
        tracing::debug!(task = name, hertz, paused, "task registered");
        Ok(())
    }

    /// Runs `task` once on a new thread.
    ///
    /// # Errors
    /// [`MeshError::DuplicateRegistration`] if `name` is still active.
    pub fn run(&self, name: &str, task: impl Task) -> MeshResult<()> {
        self.spawn(name, -1.0, false, Box::new(task))
    }

    /// Runs `task` at `hertz`: periodic for `> 0` (missed ticks are skipped),
    /// back-to-back for `0`, once for `< 0`.
    ///
    /// # Errors
    /// [`MeshError::DuplicateRegistration`] if `name` is still active.
    pub fn run_at(&self, hertz: f64, name: &str, task: impl Task) -> MeshResult<()> {
        self.spawn(name, hertz, false, Box::new(task))
    }

    /// Like [`Threader::run`], but nothing runs until [`Threader::resume`].
    /// `init` still runs immediately.
    ///
    /// # Errors
    /// [`MeshError::DuplicateRegistration`] if `name` is still active.
    pub fn start_paused(&self, name: &str, task: impl Task) -> MeshResult<()> {
        self.spawn(name, -1.0, true, Box::new(task))
    }

    /// Like [`Threader::run_at`], but nothing runs until
    /// [`Threader::resume`].
    ///
    /// # Errors
    /// [`MeshError::DuplicateRegistration`] if `name` is still active.
    pub fn start_paused_at(&self, hertz: f64, name: &str, task: impl Task) -> MeshResult<()> {
        self.spawn(name, hertz, true, Box::new(task))
    }

    fn control(&self, name: &str) -> MeshResult<TaskControl> {
        self.liveness.ensure_live()?;
        self.lock()?
            .get(name)
            .map(|entry| entry.control.clone())
            .ok_or_else(|| MeshError::UnknownThread {
                name: name.to_string(),
            })
    }

    fn controls(&self) -> MeshResult<Vec<TaskControl>> {
        self.liveness.ensure_live()?;
        Ok(self.lock()?.values().map(|entry| entry.control.clone()).collect())
    }

    /// # Errors
    /// [`MeshError::UnknownThread`] for an unregistered name.
    pub fn pause(&self, name: &str) -> MeshResult<()> {
        self.control(name)?.request_pause();
        Ok(())
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn pause_all(&self) -> MeshResult<()> {
        self.controls()?.iter().for_each(TaskControl::request_pause);
        Ok(())
    }

    /// Has no effect on a terminated task.
    ///
    /// # Errors
    /// [`MeshError::UnknownThread`] for an unregistered name.
    pub fn resume(&self, name: &str) -> MeshResult<()> {
        self.control(name)?.request_resume();
        Ok(())
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn resume_all(&self) -> MeshResult<()> {
        self.controls()?.iter().for_each(TaskControl::request_resume);
        Ok(())
    }

    /// Requests termination. The task stops before its next invocation; a
    /// `run` body already executing is not interrupted.
    ///
    /// # Errors
    /// [`MeshError::UnknownThread`] for an unregistered name.
    pub fn terminate(&self, name: &str) -> MeshResult<()> {
        self.control(name)?.request_terminate();
        Ok(())
    }

    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn terminate_all(&self) -> MeshResult<()> {
        self.controls()?.iter().for_each(TaskControl::request_terminate);
        Ok(())
    }

    /// Changes a task's rate; takes effect without waiting out the current
    /// period.
    ///
    /// # Errors
    /// [`MeshError::UnknownThread`] for an unregistered name,
    /// [`MeshError::InvalidConfig`] for a non-finite rate.
    pub fn change_hertz(&self, name: &str, hertz: f64) -> MeshResult<()> {
        if !hertz.is_finite() {
            return Err(MeshError::invalid_config(format!("invalid rate for thread '{name}'")));
        }
        self.control(name)?.set_hertz(hertz);
        Ok(())
    }

    /// # Errors
    /// [`MeshError::UnknownThread`] for an unregistered name.
    pub fn state(&self, name: &str) -> MeshResult<TaskState> {
        Ok(self.control(name)?.state())
    }

    /// Completed invocations of the task's `run`.
    ///
    /// # Errors
    /// [`MeshError::UnknownThread`] for an unregistered name.
    pub fn invocations(&self, name: &str) -> MeshResult<u64> {
        Ok(self.control(name)?.invocations())
    }

    /// Registered names, sorted.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn names(&self) -> MeshResult<Vec<String>> {
        self.liveness.ensure_live()?;
        let mut names: Vec<String> = self.lock()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Blocks until the named task has finished. Any number of callers may
    /// wait on the same task; unknown names return immediately.
    ///
    /// # Errors
    /// [`MeshError::Internal`] if the task panicked.
    pub fn wait_for_thread(&self, name: &str) -> MeshResult<()> {
        self.liveness.ensure_live()?;
        let control = self.lock()?.get(name).map(|entry| entry.control.clone());
        match control {
            Some(control) => self.wait_on(&control),
            None => Ok(()),
        }
    }

    /// Blocks until every task has finished.
    ///
    /// # Errors
    /// [`MeshError::Internal`] naming the first task that panicked.
    pub fn wait_for_threads(&self) -> MeshResult<()> {
        self.liveness.ensure_live()?;
        self.wait_all()
    }

    fn wait_all(&self) -> MeshResult<()> {
        let controls: Vec<TaskControl> = self.lock()?.values().map(|entry| entry.control.clone()).collect();
        let mut first_error = None;
        for control in &controls {
            if let Err(err) = self.wait_on(control) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Waits on the completion signal, then reaps the thread if no other
    /// waiter got to it first.
    fn wait_on(&self, control: &TaskControl) -> MeshResult<()> {
        control.wait_finished();

        let handle = self
            .lock()?
            .get_mut(control.name())
            .filter(|entry| entry.control.same_task(control))
            .and_then(|entry| entry.handle.take());
        // the panic is reported through the control below
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        if control.panicked() {
            return Err(MeshError::internal(format!("task '{}' panicked", control.name())));
        }
        Ok(())
    }

    /// Terminates and joins every task, then ends the threader.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] if already released.
    pub fn release(&self) -> MeshResult<()> {
        self.terminate_all()?;
        self.liveness.release()?;
        self.wait_all()
    }
}

impl Drop for Threader {
    fn drop(&mut self) {
        let Ok(threads) = self.threads.get_mut() else {
            return;
        };
        for entry in threads.values() {
            entry.control.request_terminate();
        }
        for (name, entry) in threads.iter_mut() {
            if let Some(handle) = entry.handle.take() {
                if handle.join().is_err() {
                    tracing::warn!(task = %name, "task panicked before shutdown");
                }
            }
        }
    }
}
