// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Background task scheduling.
//!
//! The real-time side asks for a task to "run soon" once per exchange. The
//! request is cheap and coalescing: a task that is pending or already running
//! ignores it. Once started, a task keeps cycling on its own hardware clock
//! until the stop signal is raised.

use crate::device::DeviceError;
use crate::io::task::{HardwareTask, TaskState};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uacbridge_rt::StopSignal;

/// How often an idle task re-checks the stop signal.
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Pause before a task that hit a device error may run again.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Failed to spawn task {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// How a task should be run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: String,
    /// SCHED_FIFO priority, 0 to leave the thread's policy alone.
    pub priority: i32,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }
}

/// Refers to a task created by a [`Scheduler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    id: usize,
    name: Arc<str>,
}

impl TaskHandle {
    fn new(id: usize, name: &str) -> Self {
        Self {
            id,
            name: Arc::from(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub trait Scheduler: Send {
    /// Stop signal observed by every task this scheduler runs.
    fn stop_signal(&self) -> &StopSignal;

    fn create_task(
        &mut self,
        spec: TaskSpec,
        task: Box<dyn HardwareTask>,
    ) -> Result<TaskHandle, SchedulerError>;

    /// Ask for the task to run soon. Safe to call from the real-time thread
    /// and idempotent while the task is pending or running.
    fn schedule(&self, handle: &TaskHandle);

    /// Raise the stop signal and wait for every task to finish.
    fn shutdown(&mut self);
}

/// Outcome of a priority change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityResult {
    Success,
    /// No change requested.
    Skipped,
    /// Not permitted or rejected by the kernel (non-fatal).
    Failed,
    Unsupported,
}

/// Move the calling thread to `SCHED_FIFO` at `priority`.
#[cfg(target_os = "linux")]
pub fn elevate_priority(priority: i32) -> PriorityResult {
    use libc::{pthread_self, pthread_setschedparam, sched_get_priority_max, sched_param, SCHED_FIFO};

    if priority <= 0 {
        return PriorityResult::Skipped;
    }
    let max = unsafe { sched_get_priority_max(SCHED_FIFO) };
    let param = sched_param {
        sched_priority: priority.min(max),
    };
    let result = unsafe { pthread_setschedparam(pthread_self(), SCHED_FIFO, &param) };
    if result == 0 {
        PriorityResult::Success
    } else {
        debug!("pthread_setschedparam failed (errno: {})", result);
        PriorityResult::Failed
    }
}

#[cfg(not(target_os = "linux"))]
pub fn elevate_priority(priority: i32) -> PriorityResult {
    if priority <= 0 {
        PriorityResult::Skipped
    } else {
        PriorityResult::Unsupported
    }
}

/// Coalescing wakeup for one task thread.
#[derive(Default)]
struct Trigger {
    pending: AtomicBool,
    active: AtomicBool,
    runs: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Trigger {
    /// Returns true if this call armed the trigger.
    fn fire(&self) -> bool {
        if self.active.load(Ordering::Acquire) || self.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.wake(false);
        true
    }

    /// Notify under the lock so a waiter between its `pending` check and
    /// parking cannot miss the wakeup.
    fn wake(&self, all: bool) {
        let _guard = self.lock.lock();
        if all {
            self.cond.notify_all();
        } else {
            self.cond.notify_one();
        }
    }

    fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    fn wait(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        if !self.pending.load(Ordering::Acquire) {
            self.cond.wait_for(&mut guard, timeout);
        }
    }
}

struct TaskThread {
    handle: TaskHandle,
    trigger: Arc<Trigger>,
    join: Option<JoinHandle<()>>,
}

/// Runs each task on its own named OS thread.
pub struct ThreadScheduler {
    stop: StopSignal,
    threads: Vec<TaskThread>,
}

impl ThreadScheduler {
    pub fn new(stop: StopSignal) -> Self {
        Self {
            stop,
            threads: Vec::new(),
        }
    }

    /// How many times the task has been started.
    pub fn run_count(&self, handle: &TaskHandle) -> u64 {
        self.threads
            .get(handle.id)
            .map_or(0, |t| t.trigger.runs.load(Ordering::Acquire))
    }

    pub fn is_running(&self, handle: &TaskHandle) -> bool {
        self.threads
            .get(handle.id)
            .is_some_and(|t| t.trigger.active.load(Ordering::Acquire))
    }
}

fn task_main(
    mut task: Box<dyn HardwareTask>,
    trigger: Arc<Trigger>,
    stop: StopSignal,
    priority: i32,
) {
    match elevate_priority(priority) {
        PriorityResult::Success => info!("{}: real-time priority {}", task.name(), priority),
        PriorityResult::Failed => warn!(
            "{}: failed to set real-time priority {} (non-fatal)",
            task.name(),
            priority
        ),
        PriorityResult::Unsupported => debug!("Real-time priority not supported on this platform"),
        PriorityResult::Skipped => {}
    }

    'idle: while !stop.is_raised() {
        if !trigger.take() {
            trigger.wait(IDLE_WAIT);
            continue;
        }

        trigger.active.store(true, Ordering::Release);
        trigger.runs.fetch_add(1, Ordering::AcqRel);
        debug!("{}: started", task.name());
        loop {
            match task.run_cycle() {
                Ok(TaskState::Stopped) => break 'idle,
                Ok(_) => {}
                Err(err) => {
                    error!("{}: {}", task.name(), err);
                    break;
                }
            }
        }
        trigger.active.store(false, Ordering::Release);
        thread::sleep(ERROR_BACKOFF);
    }

    trigger.active.store(false, Ordering::Release);
    task.finish();
}

impl Scheduler for ThreadScheduler {
    fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    fn create_task(
        &mut self,
        spec: TaskSpec,
        task: Box<dyn HardwareTask>,
    ) -> Result<TaskHandle, SchedulerError> {
        let handle = TaskHandle::new(self.threads.len(), &spec.name);
        let trigger = Arc::new(Trigger::default());

        let join = {
            let trigger = Arc::clone(&trigger);
            let stop = self.stop.clone();
            let priority = spec.priority;
            thread::Builder::new()
                .name(spec.name.clone())
                .spawn(move || task_main(task, trigger, stop, priority))
                .map_err(|source| SchedulerError::Spawn {
                    name: spec.name.clone(),
                    source,
                })?
        };

        debug!("Created task {} (priority {})", spec.name, spec.priority);
        self.threads.push(TaskThread {
            handle: handle.clone(),
            trigger,
            join: Some(join),
        });
        Ok(handle)
    }

    fn schedule(&self, handle: &TaskHandle) {
        if let Some(thread) = self.threads.get(handle.id) {
            thread.trigger.fire();
        }
    }

    fn shutdown(&mut self) {
        self.stop.raise();
        for thread in &mut self.threads {
            thread.trigger.wake(true);
            if let Some(join) = thread.join.take() {
                if join.join().is_err() {
                    error!("Task {} panicked", thread.handle.name());
                }
            }
        }
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ManualTask {
    spec: TaskSpec,
    task: Box<dyn HardwareTask>,
    triggers: AtomicU64,
}

/// Scheduler that runs nothing by itself.
///
/// Tasks only cycle when [`run_cycle`](Self::run_cycle) is called, which makes
/// orchestrator behaviour deterministic under test.
pub struct ManualScheduler {
    stop: StopSignal,
    tasks: Vec<ManualTask>,
}

impl ManualScheduler {
    pub fn new(stop: StopSignal) -> Self {
        Self {
            stop,
            tasks: Vec::new(),
        }
    }

    /// Times `schedule` was called for the task.
    pub fn trigger_count(&self, handle: &TaskHandle) -> u64 {
        self.tasks
            .get(handle.id)
            .map_or(0, |t| t.triggers.load(Ordering::Acquire))
    }

    pub fn spec(&self, handle: &TaskHandle) -> Option<&TaskSpec> {
        self.tasks.get(handle.id).map(|t| &t.spec)
    }

    pub fn task_state(&self, handle: &TaskHandle) -> Option<TaskState> {
        self.tasks.get(handle.id).map(|t| t.task.state())
    }

    /// Run one cycle of the task.
    pub fn run_cycle(&mut self, handle: &TaskHandle) -> Result<TaskState, DeviceError> {
        match self.tasks.get_mut(handle.id) {
            Some(entry) => entry.task.run_cycle(),
            None => Err(DeviceError::Stopped),
        }
    }

    /// Run one cycle of every task, in creation order.
    pub fn run_all(&mut self) -> Result<(), DeviceError> {
        for entry in &mut self.tasks {
            entry.task.run_cycle()?;
        }
        Ok(())
    }
}

impl Scheduler for ManualScheduler {
    fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    fn create_task(
        &mut self,
        spec: TaskSpec,
        task: Box<dyn HardwareTask>,
    ) -> Result<TaskHandle, SchedulerError> {
        let handle = TaskHandle::new(self.tasks.len(), &spec.name);
        self.tasks.push(ManualTask {
            spec,
            task,
            triggers: AtomicU64::new(0),
        });
        Ok(handle)
    }

    fn schedule(&self, handle: &TaskHandle) {
        if let Some(entry) = self.tasks.get(handle.id) {
            entry.triggers.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn shutdown(&mut self) {
        self.stop.raise();
        for entry in &mut self.tasks {
            entry.task.finish();
        }
    }
}
