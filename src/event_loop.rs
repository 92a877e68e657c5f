// SPDX-License-Identifier: MPL-2.0

//! Scheduling consumption tasks onto the display thread's event loop.
//!
//! The bridge never runs pixel uploads itself. It hands a task to an
//! [`EventLoopAdapter`], which runs it once on the loop thread, and keeps the
//! returned handle so the task can be cancelled before it starts.
//!
//! [`CalloopScheduler`] is the adapter for a `calloop` loop: tasks travel over
//! a `calloop::channel` and are run by the channel's event source.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
};

use calloop::{LoopHandle, RegistrationToken, channel};
use tracing::{debug, trace, warn};

/// Work scheduled onto the event loop thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A cooperative, single-threaded task scheduler.
pub trait EventLoopAdapter {
    type Handle;

    /// Queue `task` to run once on the loop thread.
    fn schedule(&self, task: Task) -> Self::Handle;

    /// Try to remove a task that has not started yet.
    ///
    /// Returns `true` only if the task is guaranteed never to run.
    fn cancel(&self, handle: Self::Handle) -> bool;
}

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

/// Decides, exactly once, whether a task starts or is cancelled.
#[derive(Debug, Clone)]
pub struct TaskToken(Arc<AtomicU8>);

impl TaskToken {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(PENDING)))
    }

    /// Claim the task for execution. Fails if it was cancelled.
    pub fn try_start(&self) -> bool {
        self.0
            .compare_exchange(PENDING, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Cancel the task. Fails if it already started.
    pub fn try_cancel(&self) -> bool {
        self.0
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire) == PENDING
    }
}

/// A task on its way to the loop thread.
pub struct ScheduledTask {
    token: TaskToken,
    task: Task,
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl ScheduledTask {
    pub fn new(task: Task) -> (Self, TaskToken) {
        let token = TaskToken::new();
        (
            Self {
                token: token.clone(),
                task,
            },
            token,
        )
    }

    /// Run the task unless it was cancelled first.
    pub fn run(self) -> bool {
        if !self.token.try_start() {
            return false;
        }
        (self.task)();
        true
    }
}

/// Tasks waiting for the loop, shared by every clone of a scheduler.
#[derive(Debug, Default)]
struct TaskQueue {
    tasks: Mutex<VecDeque<ScheduledTask>>,
    /// A wakeup is in the channel and has not been handled yet.
    woken: AtomicBool,
}

impl TaskQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<ScheduledTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run everything queued so far, on the loop thread.
    fn run_queued(&self) {
        self.woken.store(false, Ordering::Release);
        let tasks: Vec<ScheduledTask> = self.lock().drain(..).collect();
        for task in tasks {
            if !task.run() {
                trace!("Skipped cancelled frame task");
            }
        }
    }
}

/// [`EventLoopAdapter`] for a `calloop` event loop.
///
/// Tasks wait in a queue shared with the loop; the `calloop::channel` only
/// carries wakeups, and at most one is in flight. Cancelling a task removes
/// it from the queue, so a stalled loop holds at most the live task no matter
/// how often it is replaced.
///
/// calloop has no source priorities; a task runs during the first dispatch
/// after it was queued.
#[derive(Clone)]
pub struct CalloopScheduler {
    sender: channel::Sender<()>,
    queue: Arc<TaskQueue>,
}

impl CalloopScheduler {
    /// Register the wakeup channel on `handle`.
    ///
    /// The scheduler can be moved to another thread; tasks always run on the
    /// thread dispatching the loop.
    pub fn register<'l, Data: 'l>(
        handle: &LoopHandle<'l, Data>,
    ) -> calloop::Result<(Self, RegistrationToken)> {
        let (sender, wakeups) = channel::channel::<()>();
        let queue = Arc::new(TaskQueue::default());

        let token = {
            let queue = Arc::clone(&queue);
            handle
                .insert_source(wakeups, move |event, _, _| match event {
                    channel::Event::Msg(()) => queue.run_queued(),
                    channel::Event::Closed => {
                        debug!("Frame task channel closed");
                    }
                })
                .map_err(|err| err.error)?
        };

        Ok((Self { sender, queue }, token))
    }

    /// Tasks queued and not yet taken by the loop.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}

impl std::fmt::Debug for CalloopScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalloopScheduler")
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

impl EventLoopAdapter for CalloopScheduler {
    type Handle = TaskToken;

    fn schedule(&self, task: Task) -> TaskToken {
        let (task, token) = ScheduledTask::new(task);
        self.queue.lock().push_back(task);

        if !self.queue.woken.swap(true, Ordering::AcqRel) && self.sender.send(()).is_err() {
            // The token stays pending, so cancellation still succeeds.
            warn!("Event loop is gone, frame task will never run");
        }
        token
    }

    fn cancel(&self, handle: TaskToken) -> bool {
        if !handle.try_cancel() {
            return false;
        }
        self.queue.lock().retain(|task| task.token.is_pending());
        true
    }
}
