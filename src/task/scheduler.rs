use crate::{
    config::SchedulerConfig,
    error::TaskError,
    task::{Deadline, Task, TaskId, TaskReason},
};
use async_channel::{Receiver, Sender};
use bevy::{
    log::{debug, warn},
    tasks::{AsyncComputeTaskPool, TaskPool},
    utils::{HashMap, HashSet},
};
use parking_lot::Mutex;
use std::{collections::BTreeMap, mem, sync::Arc};

/// Runs tasks on behalf of the caches.
pub trait Scheduler: Send + Sync {
    /// Queues the task and all of its unfinished dependencies.
    /// The task is run no later than tasks with a less urgent deadline.
    fn schedule(&self, task: Arc<Task>, deadline: Deadline);

    /// Marks the task as not done for the given reason and queues it again,
    /// together with the dependents this invalidated.
    fn reschedule(&self, task: Arc<Task>, reason: TaskReason, deadline: Deadline) {
        task.set_is_done(false, deadline, reason);
        self.schedule_dependents(&task, deadline);
        self.schedule(task, deadline);
    }

    /// Queues the dependents of the task, that are not done, recursively.
    fn schedule_dependents(&self, task: &Task, deadline: Deadline) {
        for dependent in task.dependents() {
            // dependents of evicted tiles own no slot and are rescheduled once requested again
            if !dependent.is_done() && dependent.slot().is_some() {
                self.schedule_dependents(&dependent, deadline);
                self.schedule(dependent, deadline);
            }
        }
    }
}

struct Completion {
    task: Arc<Task>,
    result: anyhow::Result<()>,
}

#[derive(Default)]
struct SchedulerState {
    /// Queued tasks ordered by deadline and submission order.
    pending: BTreeMap<(Deadline, u64), Arc<Task>>,
    queued: HashMap<TaskId, (Deadline, u64)>,
    /// Tasks that failed transiently and are retried on the next update.
    deferred: Vec<Arc<Task>>,
    in_flight: HashSet<TaskId>,
    next_sequence: u64,
}

impl SchedulerState {
    fn enqueue(&mut self, task: Arc<Task>, deadline: Deadline) {
        if task.is_done() || self.in_flight.contains(&task.id()) {
            return;
        }

        let deadline = deadline.min(task.deadline());

        if let Some(&key) = self.queued.get(&task.id()) {
            if key.0 <= deadline {
                return;
            }

            self.pending.remove(&key);
        }

        let key = (deadline, self.next_sequence);
        self.next_sequence += 1;

        let dependencies = task.dependencies();
        self.queued.insert(task.id(), key);
        self.pending.insert(key, task);

        // dependencies inherit the urgency of the task waiting for them
        for dependency in dependencies {
            self.enqueue(dependency, deadline);
        }
    }

    /// Whether the task is not done and nothing is going to run it.
    fn is_abandoned(&self, task: &Task) -> bool {
        let id = task.id();

        !task.is_done()
            && !self.queued.contains_key(&id)
            && !self.in_flight.contains(&id)
            && !self.deferred.iter().any(|deferred| deferred.id() == id)
    }

    /// Takes the most urgent task, that does not wait for any dependency.
    ///
    /// A dependency that was dropped (e.g. because its tile was evicted) is not waited for,
    /// the work of the task has to request it again.
    fn next_ready(&mut self) -> Option<Arc<Task>> {
        let key = self
            .pending
            .iter()
            .find(|(_, task)| {
                task.dependencies()
                    .iter()
                    .all(|dependency| dependency.is_done() || self.is_abandoned(dependency))
            })
            .map(|(&key, _)| key)?;

        let task = self.pending.remove(&key)?;
        self.queued.remove(&task.id());

        Some(task)
    }
}

/// A [`Scheduler`] running tasks on the [`AsyncComputeTaskPool`].
///
/// Tasks are queued by deadline and dispatched during [`update`](Self::update), which should
/// be called once per frame. At most `max_in_flight` tasks run concurrently and a task is only
/// dispatched once all of its dependencies are done.
pub struct TaskPoolScheduler {
    state: Mutex<SchedulerState>,
    max_in_flight: usize,
    sender: Sender<Completion>,
    receiver: Receiver<Completion>,
}

impl Default for TaskPoolScheduler {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl TaskPoolScheduler {
    pub fn new(max_in_flight: u32) -> Self {
        let (sender, receiver) = async_channel::unbounded();

        Self {
            state: Mutex::default(),
            max_in_flight: max_in_flight.max(1) as usize,
            sender,
            receiver,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.max_in_flight)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.deferred.is_empty() && state.in_flight.is_empty()
    }

    /// Collects finished tasks and dispatches the next ready ones.
    /// Returns the number of tasks that finished successfully.
    pub fn update(&self) -> usize {
        {
            let mut state = self.state.lock();

            for task in mem::take(&mut state.deferred) {
                let deadline = task.deadline();
                state.enqueue(task, deadline);
            }
        }

        let mut finished = 0;

        while let Ok(completion) = self.receiver.try_recv() {
            if self.complete(completion) {
                finished += 1;
            }
        }

        self.dispatch();

        finished
    }

    /// Runs tasks until none of the remaining ones can make progress.
    /// This blocks the calling thread.
    pub fn run_until_idle(&self) {
        loop {
            let mut progress = self.update() > 0;

            while self.in_flight_count() > 0 {
                let Ok(completion) = self.receiver.recv_blocking() else {
                    return;
                };

                progress |= self.complete(completion);
                self.dispatch();
            }

            // the remaining pending tasks wait for dependencies, that can not finish
            if self.state.lock().deferred.is_empty() || !progress {
                break;
            }
        }
    }

    fn complete(&self, completion: Completion) -> bool {
        let Completion { task, result } = completion;

        let mut state = self.state.lock();
        state.in_flight.remove(&task.id());

        match result {
            Ok(()) => {
                if !task.is_done() {
                    // invalidated while running
                    let deadline = task.deadline();
                    state.enqueue(task, deadline);
                }

                true
            }
            Err(error) => {
                match error.downcast_ref::<TaskError>() {
                    Some(task_error) if task_error.is_transient() => {
                        debug!("Deferring {}: {task_error}", task.label());
                        state.deferred.push(task);
                    }
                    Some(task_error) => debug!("Dropping {}: {task_error}", task.label()),
                    None => warn!("{} failed: {error:#}", task.label()),
                }

                false
            }
        }
    }

    fn dispatch(&self) {
        let pool = AsyncComputeTaskPool::get_or_init(TaskPool::new);
        let mut state = self.state.lock();

        while state.in_flight.len() < self.max_in_flight {
            let Some(task) = state.next_ready() else {
                break;
            };

            if task.is_done() {
                continue;
            }

            state.in_flight.insert(task.id());

            let sender = self.sender.clone();
            pool.spawn(async move {
                let result = task.run();
                // the receiver lives as long as the scheduler
                let _ = sender.send(Completion { task, result }).await;
            })
            .detach();
        }
    }
}

impl Scheduler for TaskPoolScheduler {
    fn schedule(&self, task: Arc<Task>, deadline: Deadline) {
        self.state.lock().enqueue(task, deadline);
    }
}
