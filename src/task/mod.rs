//! Deferred units of work that compute the payload of a tile.
//!
//! A [`Task`] is created by a [`TileProducer`](crate::producer::TileProducer) for one tile
//! and writes into the [`Slot`] it is attached to. The [`TileCache`](crate::cache::TileCache)
//! never runs tasks itself, it only creates, indexes and reschedules them.
//! Running them is the job of a [`Scheduler`].

mod scheduler;

pub use scheduler::{Scheduler, TaskPoolScheduler};

use crate::{error::TaskError, storage::Slot};
use anyhow::Result;
use derive_more::derive::Display;
use parking_lot::Mutex;
use std::{
    fmt, mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

/// An opaque scheduling priority hint, usually the frame by which the result is needed.
/// Smaller values are more urgent.
pub type Deadline = u32;

/// Why a task has to compute its result (again).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Display)]
pub enum TaskReason {
    /// One of the dependencies of the task has changed.
    DependencyChanged,
    /// The data the task reads from has changed.
    DataChanged,
    /// The result of the task was discarded but is needed again.
    DataNeeded,
}

#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Display)]
#[display("task {_0}")]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

type TaskWork = dyn Fn(&Task, Slot) -> Result<()> + Send + Sync;

struct TaskStatus {
    done: bool,
    running: bool,
    /// Set when the task was invalidated while running, so that the result of that run is discarded.
    redo: bool,
    slot: Option<Slot>,
    deadline: Deadline,
    reason: Option<TaskReason>,
    run_count: u32,
}

/// A unit of deferred work producing the payload of one tile into its slot.
///
/// Tasks form a graph: a task is only ready once its dependencies are done, and changing
/// the data of a task marks all tasks depending on it as not done.
pub struct Task {
    this: Weak<Task>,
    id: TaskId,
    label: String,
    status: Mutex<TaskStatus>,
    dependencies: Mutex<Vec<Arc<Task>>>,
    dependents: Mutex<Vec<Weak<Task>>>,
    work: Box<TaskWork>,
}

impl Task {
    /// Creates a task, which is not done and writes into the given slot once run.
    pub fn new(
        label: impl Into<String>,
        slot: Slot,
        work: impl Fn(&Task, Slot) -> Result<()> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            id: TaskId::next(),
            label: label.into(),
            status: Mutex::new(TaskStatus {
                done: false,
                running: false,
                redo: false,
                slot: Some(slot),
                deadline: Deadline::MAX,
                reason: None,
                run_count: 0,
            }),
            dependencies: Mutex::default(),
            dependents: Mutex::default(),
            work: Box::new(work),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_done(&self) -> bool {
        self.status.lock().done
    }

    /// Marks the task as done or as requiring to be run (again) for the given reason.
    ///
    /// While the task is not done, the most urgent deadline is kept.
    /// Invalidating a running task discards the result of the current run.
    /// Unless the data is only needed again, the done dependents of the task are marked
    /// as not done with [`TaskReason::DependencyChanged`].
    pub fn set_is_done(&self, done: bool, deadline: Deadline, reason: TaskReason) {
        let was_done = {
            let mut status = self.status.lock();

            if done {
                status.done = true;
                status.reason = None;
                return;
            }

            if status.running {
                status.redo = true;
            }

            let was_done = status.done;

            status.deadline = if was_done {
                deadline
            } else {
                status.deadline.min(deadline)
            };
            status.done = false;
            status.reason = Some(reason);

            was_done
        };

        // a recomputed payload equals the discarded one
        if was_done && reason != TaskReason::DataNeeded {
            for dependent in self.dependents() {
                if dependent.is_done() || dependent.is_running() {
                    dependent.set_is_done(false, deadline, TaskReason::DependencyChanged);
                }
            }
        }
    }

    /// The reason the task is not done, or `None` if it is done or has never been invalidated.
    pub fn reason(&self) -> Option<TaskReason> {
        self.status.lock().reason
    }

    pub fn deadline(&self) -> Deadline {
        self.status.lock().deadline
    }

    pub fn is_running(&self) -> bool {
        self.status.lock().running
    }

    /// How many times the work of the task has been executed.
    pub fn run_count(&self) -> u32 {
        self.status.lock().run_count
    }

    /// The slot the task writes into, if it still owns one.
    pub fn slot(&self) -> Option<Slot> {
        self.status.lock().slot
    }

    pub(crate) fn attach_slot(&self, slot: Slot) {
        self.status.lock().slot = Some(slot);
    }

    /// Takes the slot away from the task, unless the task is currently writing into it.
    pub(crate) fn try_detach_slot(&self) -> bool {
        let mut status = self.status.lock();

        if status.running {
            false
        } else {
            status.slot = None;
            true
        }
    }

    pub fn add_dependency(&self, task: Arc<Task>) {
        task.add_dependent(&self.this);
        self.dependencies.lock().push(task);
    }

    /// Replaces the dependencies of the task.
    pub fn set_dependencies(&self, dependencies: Vec<Arc<Task>>) {
        for dependency in &dependencies {
            dependency.add_dependent(&self.this);
        }

        let previous = mem::replace(&mut *self.dependencies.lock(), dependencies);

        for dependency in previous {
            if !self.depends_on(&dependency) {
                dependency.remove_dependent(&self.this);
            }
        }
    }

    pub fn dependencies(&self) -> Vec<Arc<Task>> {
        self.dependencies.lock().clone()
    }

    /// The live tasks depending on this one.
    pub fn dependents(&self) -> Vec<Arc<Task>> {
        self.dependents
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn depends_on(&self, task: &Arc<Task>) -> bool {
        self.dependencies
            .lock()
            .iter()
            .any(|dependency| Arc::ptr_eq(dependency, task))
    }

    fn add_dependent(&self, task: &Weak<Task>) {
        let mut dependents = self.dependents.lock();
        dependents.retain(|dependent| dependent.strong_count() > 0);

        if !dependents.iter().any(|dependent| dependent.ptr_eq(task)) {
            dependents.push(task.clone());
        }
    }

    fn remove_dependent(&self, task: &Weak<Task>) {
        self.dependents
            .lock()
            .retain(|dependent| dependent.strong_count() > 0 && !dependent.ptr_eq(task));
    }

    /// Whether all dependencies of the task are done.
    pub fn is_ready(&self) -> bool {
        self.dependencies
            .lock()
            .iter()
            .all(|dependency| dependency.is_done())
    }

    /// Executes the work of the task and marks it as done if it succeeded.
    pub fn run(&self) -> Result<()> {
        let slot = {
            let mut status = self.status.lock();

            let Some(slot) = status.slot else {
                return Err(TaskError::Detached {
                    task: self.label.clone(),
                }
                .into());
            };

            status.running = true;
            status.redo = false;
            slot
        };

        let result = (self.work)(self, slot);

        let mut status = self.status.lock();
        status.running = false;
        status.run_count += 1;

        if result.is_ok() && !status.redo {
            status.done = true;
            status.reason = None;
        }

        result
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status.lock();

        f.debug_struct("Task")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("done", &status.done)
            .field("reason", &status.reason)
            .field("slot", &status.slot)
            .finish()
    }
}
